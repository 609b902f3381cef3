use std::sync::Arc;
use std::time::Duration;

use console_config::ConsoleConfig;
use tracing::{info, warn};

use crate::api::CloudConnector;
use crate::barrier::CompletionBarrier;
use crate::creation::{
    CreationBatch, CreationOutcome, CreationPool, CreationPoolSettings, CreationState,
};
use crate::datacenter::{DatacenterHandle, DatacenterId};
use crate::error::{DispatchError, Result};
use crate::operation::{DeferredOperation, OperationRef};
use crate::poll::JobPollPolicy;
use crate::pool::{OperationPool, PoolSettings};
use crate::registry::DatacenterRegistry;
use crate::report::{DispatchReport, ResultSlots};

/// Everything needed to start a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Identifiers `login_all` walks through.
    pub datacenters: Vec<DatacenterId>,
    pub operations: PoolSettings,
    pub creations: CreationPoolSettings,
    pub join_timeout: Option<Duration>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from(&ConsoleConfig::default())
    }
}

impl From<&ConsoleConfig> for DispatcherSettings {
    fn from(config: &ConsoleConfig) -> Self {
        let poll_interval = config.dispatch.queue_poll_interval();
        let job_poll = JobPollPolicy::from(&config.creation.job_poll);
        Self {
            datacenters: config
                .datacenters
                .iter()
                .map(|id| DatacenterId::from(id.as_str()))
                .collect(),
            operations: PoolSettings {
                workers: config.operation_workers(),
                poll_interval,
                job_poll,
            },
            creations: CreationPoolSettings {
                workers: config.creation.workers,
                max_concurrent: config.creation.max_concurrent,
                poll_interval,
                job_poll,
            },
            join_timeout: config.dispatch.join_timeout(),
        }
    }
}

/// Owns the datacenter registry, both queues and their workers.
///
/// Nothing here is global: several dispatchers can run side by side, each
/// with its own registry and pools.
pub struct Dispatcher {
    settings: DispatcherSettings,
    connector: Arc<dyn CloudConnector>,
    registry: Arc<DatacenterRegistry>,
    operations: OperationPool,
    creations: CreationPool,
}

impl Dispatcher {
    /// Starts both worker pools on the current tokio runtime.
    pub fn start(settings: DispatcherSettings, connector: Arc<dyn CloudConnector>) -> Self {
        let registry = Arc::new(DatacenterRegistry::new());
        let operations = OperationPool::start(Arc::clone(&registry), settings.operations.clone());
        let creations = CreationPool::start(Arc::clone(&registry), settings.creations.clone());
        Self {
            settings,
            connector,
            registry,
            operations,
            creations,
        }
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<DatacenterRegistry> {
        &self.registry
    }

    pub fn operations(&self) -> &OperationPool {
        &self.operations
    }

    pub fn creations(&self) -> &CreationPool {
        &self.creations
    }

    /// Opens a session for `datacenter` and authenticates it.
    ///
    /// The handle is registered only once the remote side accepted the
    /// credentials; a previous handle for the same id is replaced.
    pub async fn login(
        &self,
        datacenter: &DatacenterId,
        username: &str,
        password: &str,
    ) -> Result<Arc<DatacenterHandle>> {
        let api = self.connector.connect(datacenter).map_err(|e| {
            warn!(datacenter = %datacenter, "Cannot connect: {}", e);
            DispatchError::UnknownDatacenter(datacenter.to_string())
        })?;
        let handle = Arc::new(DatacenterHandle::new(datacenter.clone(), api));
        handle.login(username, password).await?;
        if self.registry.register(Arc::clone(&handle)).is_some() {
            info!(datacenter = %datacenter, "Replaced existing session");
        }
        Ok(handle)
    }

    /// Logs into every configured datacenter. A failure on one datacenter
    /// does not stop the others.
    pub async fn login_all(
        &self,
        username: &str,
        password: &str,
    ) -> Vec<(DatacenterId, Result<()>)> {
        let mut results = Vec::with_capacity(self.settings.datacenters.len());
        for id in &self.settings.datacenters {
            let result = self.login(id, username, password).await.map(|_| ());
            if let Err(e) = &result {
                warn!(datacenter = %id, "Login failed: {}", e);
            }
            results.push((id.clone(), result));
        }
        results
    }

    /// Runs `operation` once on every logged-in datacenter and waits for all of them.
    ///
    /// With no datacenter logged in this returns an empty report right away.
    pub async fn run_for_all_logged_in(
        &self,
        operation: impl Into<OperationRef>,
    ) -> Result<DispatchReport> {
        let operation = operation.into();
        let batch = self
            .registry
            .list_logged_in()
            .into_iter()
            .map(|id| DeferredOperation::new(id, operation.clone()))
            .collect();
        self.run_batch(batch).await
    }

    /// Runs `operation` on each of `datacenters`, all of which must be logged in.
    pub async fn run_on(
        &self,
        datacenters: &[DatacenterId],
        operation: impl Into<OperationRef>,
    ) -> Result<DispatchReport> {
        for id in datacenters {
            self.require_logged_in(id)?;
        }
        let operation = operation.into();
        let batch = datacenters
            .iter()
            .map(|id| DeferredOperation::new(id.clone(), operation.clone()))
            .collect();
        self.run_batch(batch).await
    }

    /// Enqueues every item and waits until each of them has been processed.
    ///
    /// The wait covers only this batch; other work on the queue does not
    /// hold it up.
    pub async fn run_batch(&self, batch: Vec<DeferredOperation>) -> Result<DispatchReport> {
        let barrier = Arc::new(CompletionBarrier::new());
        let slots = ResultSlots::default();
        for item in batch {
            self.operations.enqueue_tracked(item, &barrier, &slots)?;
        }

        match self.settings.join_timeout {
            Some(limit) => {
                if !barrier.join_timeout(limit).await {
                    return Err(DispatchError::JoinTimeout {
                        outstanding: barrier.outstanding(),
                        waited: limit,
                    });
                }
            }
            None => barrier.join().await,
        }
        Ok(slots.take())
    }

    /// Adds one item to the general queue without waiting for it.
    pub fn enqueue(&self, item: DeferredOperation) -> Result<()> {
        self.operations.enqueue(item)
    }

    /// Waits for everything on the general queue.
    pub async fn join_operations(&self) {
        self.operations.join().await;
    }

    /// Validates a batch, names its instances and queues one request per
    /// instance. Returns the assigned names.
    pub fn enqueue_creation(&self, batch: &CreationBatch) -> Result<Vec<String>> {
        self.require_logged_in(&batch.datacenter)?;
        let requests = batch.expand()?;
        let names = requests.iter().map(|request| request.name.clone()).collect();
        for request in requests {
            self.creations.enqueue(request)?;
        }
        info!(
            datacenter = %batch.datacenter,
            count = batch.number,
            variant = %batch.spec.variant(),
            "Queued VM creation"
        );
        Ok(names)
    }

    /// Waits for every queued creation to finish.
    pub async fn join_creations(&self) {
        self.creations.join().await;
    }

    pub fn creation_state(&self, datacenter: &DatacenterId, name: &str) -> Option<CreationState> {
        self.creations.state_of(datacenter, name)
    }

    pub fn take_creation_outcomes(&self) -> Vec<CreationOutcome> {
        self.creations.take_outcomes()
    }

    /// Stops both pools from taking new work. Items already running finish
    /// on their own; call [`wait_stopped`](Self::wait_stopped) to wait for that.
    pub fn shutdown(&self) {
        self.operations.shutdown();
        self.creations.shutdown();
    }

    pub async fn wait_stopped(&self) {
        self.operations.wait_stopped().await;
        self.creations.wait_stopped().await;
    }

    pub(crate) fn require_logged_in(&self, id: &DatacenterId) -> Result<Arc<DatacenterHandle>> {
        self.registry
            .lookup(id)
            .filter(|handle| handle.is_logged_in())
            .ok_or_else(|| DispatchError::NotLoggedIn(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_the_config() {
        let mut config = ConsoleConfig::default();
        config.datacenters = vec!["a".into(), "b".into()];
        config.dispatch.join_timeout_secs = Some(30);
        config.creation.max_concurrent = 5;

        let settings = DispatcherSettings::from(&config);
        assert_eq!(settings.datacenters, vec![DatacenterId::from("a"), DatacenterId::from("b")]);
        assert_eq!(settings.operations.workers, 2);
        assert_eq!(settings.creations.max_concurrent, 5);
        assert_eq!(settings.join_timeout, Some(Duration::from_secs(30)));
    }
}
