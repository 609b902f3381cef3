use std::fmt;
use std::future::Future;
use std::sync::Arc;

use console_core::ConsoleError;
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;

use crate::api::{PendingJob, ServerId, VmRef};
use crate::datacenter::{DatacenterHandle, DatacenterId};
use crate::error::{DispatchError, Result};
use crate::poll::JobPollPolicy;

/// Operations every datacenter handle understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatacenterOp {
    PowerOn(ServerId),
    PowerOff(ServerId),
    Delete(ServerId),
    QueryVms { pattern: Option<String> },
    FindIp(String),
    RefreshServerList,
    PendingJobs,
    /// Blocks until the datacenter reports no pending jobs.
    WaitForPendingJobs,
}

impl DatacenterOp {
    pub fn name(&self) -> &'static str {
        match self {
            DatacenterOp::PowerOn(_) => "power_on",
            DatacenterOp::PowerOff(_) => "power_off",
            DatacenterOp::Delete(_) => "delete",
            DatacenterOp::QueryVms { .. } => "query_vms",
            DatacenterOp::FindIp(_) => "find_ip",
            DatacenterOp::RefreshServerList => "refresh_server_list",
            DatacenterOp::PendingJobs => "list_pending_jobs",
            DatacenterOp::WaitForPendingJobs => "wait_for_pending_jobs",
        }
    }

    /// Resolves an operation from its name and textual arguments.
    ///
    /// Unknown names and wrong argument counts are reported as
    /// [`DispatchError::MalformedJob`].
    pub fn by_name(name: &str, args: &[String]) -> Result<Self> {
        let op = match (name, args) {
            ("power_on", [id]) => DatacenterOp::PowerOn(parse_server_id(name, id)?),
            ("power_off", [id]) => DatacenterOp::PowerOff(parse_server_id(name, id)?),
            ("delete", [id]) => DatacenterOp::Delete(parse_server_id(name, id)?),
            ("query_vms", []) => DatacenterOp::QueryVms { pattern: None },
            ("query_vms", [pattern]) => DatacenterOp::QueryVms {
                pattern: Some(pattern.clone()),
            },
            ("find_ip", [ip]) => DatacenterOp::FindIp(ip.clone()),
            ("refresh_server_list", []) => DatacenterOp::RefreshServerList,
            ("list_pending_jobs", []) => DatacenterOp::PendingJobs,
            ("wait_for_pending_jobs", []) => DatacenterOp::WaitForPendingJobs,
            (
                "power_on" | "power_off" | "delete" | "query_vms" | "find_ip"
                | "refresh_server_list" | "list_pending_jobs" | "wait_for_pending_jobs",
                _,
            ) => {
                return Err(DispatchError::MalformedJob(format!(
                    "{} does not take {} argument(s)",
                    name,
                    args.len()
                )))
            }
            _ => {
                return Err(DispatchError::MalformedJob(format!(
                    "'{}' is not an operation",
                    name
                )))
            }
        };
        Ok(op)
    }

    pub(crate) async fn execute(
        &self,
        handle: &DatacenterHandle,
        poll: &JobPollPolicy,
    ) -> Result<OpOutput> {
        let api = handle.api();
        let output = match self {
            DatacenterOp::PowerOn(id) => api.power_on(*id).await.map(|_| OpOutput::Done)?,
            DatacenterOp::PowerOff(id) => api.power_off(*id).await.map(|_| OpOutput::Done)?,
            DatacenterOp::Delete(id) => api.delete(*id).await.map(|_| OpOutput::Done)?,
            DatacenterOp::QueryVms { pattern } => {
                OpOutput::Vms(handle.search(pattern.as_deref()).await?)
            }
            DatacenterOp::FindIp(ip) => OpOutput::Vms(handle.find_ip(ip).await?),
            DatacenterOp::RefreshServerList => {
                api.refresh_server_list().await.map(|_| OpOutput::Done)?
            }
            DatacenterOp::PendingJobs => OpOutput::PendingJobs(api.list_pending_jobs().await?),
            DatacenterOp::WaitForPendingJobs => {
                let what = format!("pending jobs on datacenter {}", handle.id());
                poll.poll_until(&what, move || async move {
                    Ok(api.list_pending_jobs().await?.is_empty())
                })
                .await?;
                OpOutput::Done
            }
        };
        Ok(output)
    }
}

impl fmt::Display for DatacenterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatacenterOp::PowerOn(id) | DatacenterOp::PowerOff(id) | DatacenterOp::Delete(id) => {
                write!(f, "{} server {}", self.name(), id)
            }
            DatacenterOp::QueryVms {
                pattern: Some(pattern),
            } => write!(f, "{} '{}'", self.name(), pattern),
            DatacenterOp::FindIp(ip) => write!(f, "{} {}", self.name(), ip),
            _ => f.write_str(self.name()),
        }
    }
}

fn parse_server_id(op: &str, raw: &str) -> Result<ServerId> {
    raw.parse().map_err(|_| {
        DispatchError::MalformedJob(format!("{} expects a server id, got '{}'", op, raw))
    })
}

/// What an operation hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OpOutput {
    Done,
    Vms(Vec<VmRef>),
    PendingJobs(Vec<PendingJob>),
}

impl OpOutput {
    pub fn vms(&self) -> &[VmRef] {
        match self {
            OpOutput::Vms(vms) => vms,
            _ => &[],
        }
    }
}

pub type OperationFn = Arc<
    dyn Fn(Arc<DatacenterHandle>) -> BoxFuture<'static, std::result::Result<OpOutput, ConsoleError>>
        + Send
        + Sync,
>;

/// Reference to the work a queue entry should perform against its handle.
#[derive(Clone)]
pub enum OperationRef {
    Op(DatacenterOp),
    /// Resolved with [`DatacenterOp::by_name`] when a worker picks it up.
    Named { name: String, args: Vec<String> },
    Callable(OperationFn),
}

impl OperationRef {
    pub fn named<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        OperationRef::Named {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn callable<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<DatacenterHandle>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<OpOutput, ConsoleError>> + Send + 'static,
    {
        OperationRef::Callable(Arc::new(move |handle: Arc<DatacenterHandle>| {
            f(handle).boxed()
        }))
    }

    pub fn label(&self) -> String {
        match self {
            OperationRef::Op(op) => op.to_string(),
            OperationRef::Named { name, .. } => name.clone(),
            OperationRef::Callable(_) => "callable".to_string(),
        }
    }
}

impl From<DatacenterOp> for OperationRef {
    fn from(op: DatacenterOp) -> Self {
        OperationRef::Op(op)
    }
}

impl fmt::Debug for OperationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationRef::Op(op) => f.debug_tuple("Op").field(op).finish(),
            OperationRef::Named { name, args } => f
                .debug_struct("Named")
                .field("name", name)
                .field("args", args)
                .finish(),
            OperationRef::Callable(_) => f.write_str("Callable(..)"),
        }
    }
}

/// A unit of work bound to one datacenter.
#[derive(Debug, Clone)]
pub struct DeferredOperation {
    pub datacenter: DatacenterId,
    pub operation: OperationRef,
}

impl DeferredOperation {
    pub fn new(datacenter: DatacenterId, operation: impl Into<OperationRef>) -> Self {
        Self {
            datacenter,
            operation: operation.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn resolves_known_operations() {
        assert_eq!(
            DatacenterOp::by_name("power_off", &args(&["42"])).unwrap(),
            DatacenterOp::PowerOff(42)
        );
        assert_eq!(
            DatacenterOp::by_name("query_vms", &[]).unwrap(),
            DatacenterOp::QueryVms { pattern: None }
        );
        assert_eq!(
            DatacenterOp::by_name("query_vms", &args(&["web"])).unwrap(),
            DatacenterOp::QueryVms {
                pattern: Some("web".into())
            }
        );
    }

    #[test]
    fn wrong_arity_is_malformed() {
        let err = DatacenterOp::by_name("power_on", &[]).unwrap_err();
        assert!(err.is_malformed());
        assert!(err.to_string().contains("does not take 0"));

        let err = DatacenterOp::by_name("refresh_server_list", &args(&["x"])).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn unknown_name_is_malformed() {
        let err = DatacenterOp::by_name("reboot_everything", &[]).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn non_numeric_server_id_is_malformed() {
        let err = DatacenterOp::by_name("delete", &args(&["web-1"])).unwrap_err();
        assert!(err.to_string().contains("expects a server id"));
    }

    #[test]
    fn labels_name_the_work() {
        assert_eq!(OperationRef::from(DatacenterOp::PendingJobs).label(), "list_pending_jobs");
        assert_eq!(OperationRef::from(DatacenterOp::PowerOff(7)).label(), "power_off server 7");
        assert_eq!(OperationRef::named("power_on", ["1"]).label(), "power_on");
        let callable = OperationRef::callable(|_| async { Ok(OpOutput::Done) });
        assert_eq!(callable.label(), "callable");
        assert_eq!(format!("{:?}", callable), "Callable(..)");
    }
}
