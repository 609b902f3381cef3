use std::time::Duration;

use console_core::ConsoleError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Unknown datacenter: {0}")]
    UnknownDatacenter(String),

    #[error("You are not logged in to datacenter {0}. Login before running this command.")]
    NotLoggedIn(String),

    #[error("Malformed job: {0}")]
    MalformedJob(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("The {0} queue is no longer accepting work")]
    QueueClosed(&'static str),

    #[error("Operation failed: {0}")]
    Operation(#[from] ConsoleError),

    #[error("Operation panicked: {0}")]
    Panicked(String),

    #[error("Remote side rejected creation of {0}")]
    CommitRejected(String),

    #[error("Gave up waiting for {what} after {waited:?}")]
    JobTimeout { what: String, waited: Duration },

    #[error("{outstanding} dispatched item(s) still running after {waited:?}")]
    JoinTimeout { outstanding: usize, waited: Duration },
}

impl DispatchError {
    /// Errors that come from a bad queue entry rather than from the remote side.
    pub fn is_malformed(&self) -> bool {
        matches!(self, DispatchError::MalformedJob(_))
    }
}
