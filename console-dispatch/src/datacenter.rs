use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use console_core::error::Result;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::api::{CloudApi, VmRef};

/// Identifier of a remote datacenter, e.g. `"1"` or `"it-dc2"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct DatacenterId(String);

impl DatacenterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatacenterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatacenterId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DatacenterId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Session state for one remote datacenter.
///
/// The login flag only flips to `true` after the remote side accepted the
/// credentials. A handle is never logged out; logging in again replaces the
/// handle in the registry instead.
pub struct DatacenterHandle {
    id: DatacenterId,
    api: Arc<dyn CloudApi>,
    logged_in: AtomicBool,
    /// Written only while the lock is held across the remote query, so a
    /// reader never observes a half-finished search.
    last_search_result: Mutex<Vec<VmRef>>,
}

impl DatacenterHandle {
    pub fn new(id: DatacenterId, api: Arc<dyn CloudApi>) -> Self {
        Self {
            id,
            api,
            logged_in: AtomicBool::new(false),
            last_search_result: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &DatacenterId {
        &self.id
    }

    pub fn api(&self) -> &dyn CloudApi {
        self.api.as_ref()
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        self.api.authenticate(username, password).await?;
        self.logged_in.store(true, Ordering::Release);
        info!(datacenter = %self.id, "Logged in");
        Ok(())
    }

    pub async fn pending_job_count(&self) -> Result<usize> {
        Ok(self.api.list_pending_jobs().await?.len())
    }

    /// Runs a remote search and stores it as the handle's last result.
    pub async fn search(&self, pattern: Option<&str>) -> Result<Vec<VmRef>> {
        let mut slot = self.last_search_result.lock().await;
        let found = self.api.query_vms(pattern).await?;
        debug!(datacenter = %self.id, ?pattern, found = found.len(), "Search finished");
        *slot = found.clone();
        Ok(found)
    }

    /// Finds the servers that own `ip`, storing them as the last result.
    pub async fn find_ip(&self, ip: &str) -> Result<Vec<VmRef>> {
        let mut slot = self.last_search_result.lock().await;
        let found: Vec<VmRef> = self
            .api
            .query_vms(None)
            .await?
            .into_iter()
            .filter(|vm| vm.ip_addresses.iter().any(|addr| addr == ip))
            .collect();
        *slot = found.clone();
        Ok(found)
    }

    pub async fn last_search_result(&self) -> Vec<VmRef> {
        self.last_search_result.lock().await.clone()
    }
}

impl fmt::Debug for DatacenterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatacenterHandle")
            .field("id", &self.id)
            .field("logged_in", &self.is_logged_in())
            .finish_non_exhaustive()
    }
}
