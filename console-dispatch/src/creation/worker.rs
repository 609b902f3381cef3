use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use console_core::{console_success, console_warning, ConsoleError};
use futures_util::future::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{CreationRequest, CreationSpec};
use crate::api::{CloudApi, JobLookup};
use crate::barrier::{CompletionBarrier, Ticket};
use crate::datacenter::DatacenterId;
use crate::error::{DispatchError, Result};
use crate::poll::JobPollPolicy;
use crate::pool::panic_message;
use crate::registry::DatacenterRegistry;

/// Where a creation request currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationState {
    Queued,
    AwaitingPermit,
    Committing,
    Polling,
    Done { succeeded: bool },
}

/// Final result of one creation request.
#[derive(Debug)]
pub struct CreationOutcome {
    pub name: String,
    pub datacenter: DatacenterId,
    /// Sequential id handed out under the commit lock. `None` when the request
    /// never reached the commit step.
    pub commit_id: Option<u64>,
    pub result: Result<()>,
}

impl CreationOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreationStats {
    /// Requests currently holding a creation permit.
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub committed: u64,
}

#[derive(Debug, Clone)]
pub struct CreationPoolSettings {
    pub workers: usize,
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    pub job_poll: JobPollPolicy,
}

impl Default for CreationPoolSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            max_concurrent: 3,
            poll_interval: Duration::from_millis(250),
            job_poll: JobPollPolicy::default(),
        }
    }
}

struct CommitLedger {
    next_commit_id: u64,
}

impl CommitLedger {
    fn allocate(&mut self) -> u64 {
        self.next_commit_id += 1;
        self.next_commit_id
    }
}

type StateKey = (DatacenterId, String);

struct Shared {
    registry: Arc<DatacenterRegistry>,
    permits: Semaphore,
    commit_lock: tokio::sync::Mutex<CommitLedger>,
    states: Mutex<HashMap<StateKey, CreationState>>,
    outcomes: Mutex<Vec<CreationOutcome>>,
    stats: Mutex<CreationStats>,
    job_poll: JobPollPolicy,
}

impl Shared {
    fn set_state(&self, request: &CreationRequest, state: CreationState) {
        debug!(datacenter = %request.datacenter, vm_name = %request.name, ?state, "Creation state");
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((request.datacenter.clone(), request.name.clone()), state);
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, CreationStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts a request as in flight for as long as it is alive.
struct InFlight<'a> {
    shared: &'a Shared,
}

impl<'a> InFlight<'a> {
    fn enter(shared: &'a Shared) -> Self {
        let mut stats = shared.stats();
        stats.in_flight += 1;
        stats.peak_in_flight = stats.peak_in_flight.max(stats.in_flight);
        drop(stats);
        Self { shared }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut stats = self.shared.stats();
        stats.in_flight = stats.in_flight.saturating_sub(1);
    }
}

struct QueuedCreation {
    request: CreationRequest,
    _ticket: Ticket,
}

struct WorkerContext {
    id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedCreation>>>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    poll_interval: Duration,
}

/// Creation queue plus the workers that drain it.
///
/// At most `max_concurrent` requests hold a permit at once, across every
/// datacenter. Only one request at a time builds and commits its creator.
pub struct CreationPool {
    sender: mpsc::UnboundedSender<QueuedCreation>,
    pending: Arc<CompletionBarrier>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CreationPool {
    pub fn start(registry: Arc<DatacenterRegistry>, settings: CreationPoolSettings) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shutdown = CancellationToken::new();
        let max_concurrent = settings.max_concurrent.max(1);
        let shared = Arc::new(Shared {
            registry,
            permits: Semaphore::new(max_concurrent),
            commit_lock: tokio::sync::Mutex::new(CommitLedger { next_commit_id: 0 }),
            states: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(Vec::new()),
            stats: Mutex::new(CreationStats::default()),
            job_poll: settings.job_poll,
        });

        let worker_count = settings.workers.max(1);
        let workers = (0..worker_count)
            .map(|id| {
                tokio::spawn(run_worker(WorkerContext {
                    id,
                    receiver: Arc::clone(&receiver),
                    shared: Arc::clone(&shared),
                    shutdown: shutdown.clone(),
                    poll_interval: settings.poll_interval,
                }))
            })
            .collect();
        debug!(
            workers = worker_count,
            max_concurrent,
            "Started creation workers"
        );

        Self {
            sender,
            pending: Arc::new(CompletionBarrier::new()),
            shared,
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    /// Appends a request to the creation queue. Never waits.
    pub fn enqueue(&self, request: CreationRequest) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::QueueClosed("creation"));
        }
        self.shared.set_state(&request, CreationState::Queued);
        let ticket = self.pending.ticket();
        self.sender
            .send(QueuedCreation {
                request,
                _ticket: ticket,
            })
            .map_err(|_| DispatchError::QueueClosed("creation"))
    }

    /// Waits until every request enqueued so far is done.
    pub async fn join(&self) {
        self.pending.join().await;
    }

    pub async fn join_timeout(&self, limit: Duration) -> bool {
        self.pending.join_timeout(limit).await
    }

    pub fn outstanding(&self) -> usize {
        self.pending.outstanding()
    }

    pub fn state_of(&self, datacenter: &DatacenterId, name: &str) -> Option<CreationState> {
        self.shared
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(datacenter.clone(), name.to_string()))
            .copied()
    }

    /// Removes and returns the outcomes recorded since the last call.
    ///
    /// The finished requests are forgotten by [`CreationPool::state_of`] too.
    pub fn take_outcomes(&self) -> Vec<CreationOutcome> {
        let outcomes = std::mem::take(
            &mut *self
                .shared
                .outcomes
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let mut states = self
            .shared
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for outcome in &outcomes {
            let key = (outcome.datacenter.clone(), outcome.name.clone());
            if matches!(states.get(&key), Some(CreationState::Done { .. })) {
                states.remove(&key);
            }
        }
        outcomes
    }

    pub fn stats(&self) -> CreationStats {
        *self.shared.stats()
    }

    pub fn available_permits(&self) -> usize {
        self.shared.permits.available_permits()
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn wait_stopped(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Creation worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for CreationPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_worker(ctx: WorkerContext) {
    debug!(worker = ctx.id, "Creation worker started");
    while !ctx.shutdown.is_cancelled() {
        let next = {
            let mut receiver = ctx.receiver.lock().await;
            tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => break,
                received = timeout(ctx.poll_interval, receiver.recv()) => received,
            }
        };

        match next {
            Err(_idle) => continue,
            Ok(None) => break,
            Ok(Some(QueuedCreation { request, _ticket })) => {
                let span = info_span!(
                    "create",
                    worker = ctx.id,
                    datacenter = %request.datacenter,
                    vm_name = %request.name
                );
                create(&ctx.shared, request).instrument(span).await;
            }
        }
    }
    debug!(worker = ctx.id, "Creation worker stopped");
}

async fn create(shared: &Shared, request: CreationRequest) {
    let mut commit_id = None;
    let result = match AssertUnwindSafe(run_creation(shared, &request, &mut commit_id))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(DispatchError::Panicked(panic_message(panic.as_ref()))),
    };

    shared.set_state(
        &request,
        CreationState::Done {
            succeeded: result.is_ok(),
        },
    );
    match &result {
        Ok(()) => {
            info!(commit_id, "VM created");
            console_success!("Creation of VM: {} Done.", request.name);
        }
        Err(e) => {
            warn!(commit_id, "VM creation failed: {}", e);
            console_warning!(
                "Cannot create VM {} on datacenter {}: {}",
                request.name,
                request.datacenter,
                e
            );
        }
    }

    shared
        .outcomes
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(CreationOutcome {
            name: request.name,
            datacenter: request.datacenter,
            commit_id,
            result,
        });
}

async fn run_creation(
    shared: &Shared,
    request: &CreationRequest,
    commit_id: &mut Option<u64>,
) -> Result<()> {
    let handle = shared
        .registry
        .lookup(&request.datacenter)
        .filter(|handle| handle.is_logged_in())
        .ok_or_else(|| DispatchError::NotLoggedIn(request.datacenter.to_string()))?;
    let api = handle.api();

    shared.set_state(request, CreationState::AwaitingPermit);
    let _permit = shared
        .permits
        .acquire()
        .await
        .map_err(|_| DispatchError::QueueClosed("creation"))?;
    let _in_flight = InFlight::enter(shared);

    shared.set_state(request, CreationState::Committing);
    {
        let mut ledger = shared.commit_lock.lock().await;
        let id = ledger.allocate();
        *commit_id = Some(id);
        commit(api, request).await?;
        shared.stats().committed += 1;
        debug!(commit_id = id, "Creation committed");
    }

    shared.set_state(request, CreationState::Polling);
    let name = request.name.as_str();
    shared
        .job_poll
        .poll_until(&format!("VM {}", name), move || is_complete(api, name))
        .await
}

async fn commit(api: &dyn CloudApi, request: &CreationRequest) -> Result<()> {
    let mut creator = api.new_creator(
        request.spec.variant(),
        &request.name,
        &request.template_id,
        &request.admin_password,
    );

    match &request.spec {
        CreationSpec::Smart(smart) => creator.set_package(smart.package),
        CreationSpec::Pro(pro) => {
            if pro.buy_public_ip {
                let ip = api.purchase_public_ip().await?;
                debug!(address = %ip.address, "Purchased public IP");
                creator.attach_public_ip(&ip.resource_id);
            }
            for size in pro.disks_gb.iter().copied().filter(|size| *size > 0) {
                creator.attach_disk(size);
            }
            creator.set_cpu_count(pro.cpu_count);
            creator.set_ram_amount(pro.ram_gb);
        }
    }

    if creator.commit(&api.endpoint()).await? {
        Ok(())
    } else {
        Err(DispatchError::CommitRejected(request.name.clone()))
    }
}

/// The job is gone and the server shows up in a search by its name.
async fn is_complete(api: &dyn CloudApi, name: &str) -> std::result::Result<bool, ConsoleError> {
    match api.find_job(name).await? {
        JobLookup::Pending(_) => Ok(false),
        JobLookup::NotFound => Ok(api
            .query_vms(Some(name))
            .await?
            .iter()
            .any(|vm| vm.name == name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_ids_are_sequential() {
        let mut ledger = CommitLedger { next_commit_id: 0 };
        assert_eq!(ledger.allocate(), 1);
        assert_eq!(ledger.allocate(), 2);
        assert_eq!(ledger.allocate(), 3);
    }

    #[test]
    fn done_state_serializes_with_its_flag() {
        let json = serde_json::to_string(&CreationState::Done { succeeded: false }).unwrap();
        assert_eq!(json, r#"{"done":{"succeeded":false}}"#);
        let json = serde_json::to_string(&CreationState::AwaitingPermit).unwrap();
        assert_eq!(json, r#""awaiting_permit""#);
    }
}
