use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Errors raised at the boundary with a remote datacenter.
///
/// Every `CloudApi` call reports failures through this type so callers can
/// tell a rejected login apart from a plain API failure without parsing text.
#[derive(Error, Debug)]
pub enum ConsoleError {
    Api(String),
    Authentication(String),
    NotFound(String),
    Config(String),
    Io(#[from] std::io::Error),
    Serialization(String),
    Other(#[from] anyhow::Error),
}

impl Display for ConsoleError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ConsoleError::Api(s) => write!(f, "Remote API error: {}", s),
            ConsoleError::Authentication(s) => {
                write!(f, "Authentication failed: {}\n\n", s)?;
                write!(f, "Fix:\n")?;
                write!(f, "  • Check the username and password\n")?;
                write!(f, "  • Verify the datacenter id with: login --dc <id>")
            }
            ConsoleError::NotFound(s) => write!(f, "Not found: {}", s),
            ConsoleError::Config(s) => write!(f, "Configuration error: {}", s),
            ConsoleError::Io(e) => write!(f, "I/O error: {}", e),
            ConsoleError::Serialization(s) => write!(f, "Serialization error: {}", s),
            ConsoleError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl ConsoleError {
    pub fn api(msg: impl Into<String>) -> Self {
        ConsoleError::Api(msg.into())
    }

    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConsoleError::Api(_) | ConsoleError::Io(_))
    }
}

impl From<serde_yaml_ng::Error> for ConsoleError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        ConsoleError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ConsoleError {
    fn from(err: serde_json::Error) -> Self {
        ConsoleError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConsoleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_error_carries_a_hint() {
        let err = ConsoleError::Authentication("bad password".into());
        let text = err.to_string();
        assert!(text.starts_with("Authentication failed: bad password"));
        assert!(text.contains("login --dc"));
    }

    #[test]
    fn api_errors_are_transient() {
        assert!(ConsoleError::api("timeout").is_transient());
        assert!(!ConsoleError::NotFound("vm".into()).is_transient());
    }

    #[test]
    fn yaml_errors_become_serialization_errors() {
        let err: ConsoleError = serde_yaml_ng::from_str::<Vec<u32>>("{ not: a list")
            .unwrap_err()
            .into();
        assert!(matches!(err, ConsoleError::Serialization(_)));
    }
}
