//! Asynchronous job dispatch for a multi-datacenter VM console.
//!
//! A [`Dispatcher`] owns a registry of datacenter sessions and two queues:
//! a general operation queue drained by a worker pool, and a creation queue
//! whose workers share a bounded permit pool and a single commit lock.
//! Fan-out calls enqueue one item per datacenter and wait on a completion
//! barrier until every item is done.

pub mod api;
pub mod barrier;
pub mod creation;
pub mod datacenter;
pub mod dispatcher;
pub mod error;
pub mod fleet;
pub mod operation;
pub mod poll;
pub mod pool;
pub mod registry;
pub mod report;
pub mod simulated;

pub use api::{
    CloudApi, CloudConnector, JobLookup, PackageSize, Template, VmCreator, VmRef, VmVariant,
};
pub use barrier::CompletionBarrier;
pub use creation::{
    CreationBatch, CreationOutcome, CreationRequest, CreationSpec, CreationState, ProParams,
    SmartParams,
};
pub use datacenter::{DatacenterHandle, DatacenterId};
pub use dispatcher::{Dispatcher, DispatcherSettings};
pub use error::{DispatchError, Result};
pub use fleet::{DeleteReport, PowerAction};
pub use operation::{DatacenterOp, DeferredOperation, OpOutput, OperationRef};
pub use poll::JobPollPolicy;
pub use registry::DatacenterRegistry;
pub use report::{DispatchReport, ItemOutcome};
