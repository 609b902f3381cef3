//! General operation queue and its worker pool.
//!
//! Producers push onto an unbounded FIFO and never block. Each worker takes
//! one entry at a time, runs it against the target datacenter's handle and
//! marks it done. A failing or panicking entry only affects its own result.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::barrier::{CompletionBarrier, Ticket};
use crate::datacenter::DatacenterId;
use crate::error::{DispatchError, Result};
use crate::operation::{DatacenterOp, DeferredOperation, OpOutput, OperationRef};
use crate::poll::JobPollPolicy;
use crate::registry::DatacenterRegistry;
use crate::report::{ItemOutcome, ResultSlots};

struct QueuedOperation {
    deferred: DeferredOperation,
    slots: Option<ResultSlots>,
    // Dropped only after the outcome is recorded.
    tickets: Vec<Ticket>,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub poll_interval: Duration,
    pub job_poll: JobPollPolicy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: 6,
            poll_interval: Duration::from_millis(250),
            job_poll: JobPollPolicy::default(),
        }
    }
}

struct WorkerContext {
    id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedOperation>>>,
    registry: Arc<DatacenterRegistry>,
    shutdown: CancellationToken,
    poll_interval: Duration,
    job_poll: JobPollPolicy,
}

pub struct OperationPool {
    sender: mpsc::UnboundedSender<QueuedOperation>,
    pending: Arc<CompletionBarrier>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl OperationPool {
    /// Spawns the workers on the current tokio runtime.
    pub fn start(registry: Arc<DatacenterRegistry>, settings: PoolSettings) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shutdown = CancellationToken::new();

        let worker_count = settings.workers.max(1);
        let workers = (0..worker_count)
            .map(|id| {
                let context = WorkerContext {
                    id,
                    receiver: Arc::clone(&receiver),
                    registry: Arc::clone(&registry),
                    shutdown: shutdown.clone(),
                    poll_interval: settings.poll_interval,
                    job_poll: settings.job_poll,
                };
                tokio::spawn(run_worker(context))
            })
            .collect();
        debug!(workers = worker_count, "Started operation workers");

        Self {
            sender,
            pending: Arc::new(CompletionBarrier::new()),
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    /// Appends an operation to the queue. Never waits.
    pub fn enqueue(&self, deferred: DeferredOperation) -> Result<()> {
        self.push(deferred, None, None)
    }

    pub(crate) fn enqueue_tracked(
        &self,
        deferred: DeferredOperation,
        barrier: &Arc<CompletionBarrier>,
        slots: &ResultSlots,
    ) -> Result<()> {
        self.push(deferred, Some(barrier), Some(slots.clone()))
    }

    fn push(
        &self,
        deferred: DeferredOperation,
        barrier: Option<&Arc<CompletionBarrier>>,
        slots: Option<ResultSlots>,
    ) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::QueueClosed("operation"));
        }
        let mut tickets = vec![self.pending.ticket()];
        tickets.extend(barrier.map(|barrier| barrier.ticket()));

        self.sender
            .send(QueuedOperation {
                deferred,
                slots,
                tickets,
            })
            .map_err(|_| DispatchError::QueueClosed("operation"))
    }

    /// Waits until everything enqueued so far has been processed.
    pub async fn join(&self) {
        self.pending.join().await;
    }

    pub fn outstanding(&self) -> usize {
        self.pending.outstanding()
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Tells workers to stop taking new entries. Running entries finish on their own.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Waits for every worker task to exit. Call after [`shutdown`](Self::shutdown).
    pub async fn wait_stopped(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Operation worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for OperationPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_worker(ctx: WorkerContext) {
    debug!(worker = ctx.id, "Operation worker started");
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
            Ok(Some(item)) => process(&ctx, item).await,
        }
    }
    debug!(worker = ctx.id, "Operation worker stopped");
}

async fn process(ctx: &WorkerContext, item: QueuedOperation) {
    let QueuedOperation {
        deferred,
        slots,
        tickets,
    } = item;
    let DeferredOperation {
        datacenter,
        operation,
    } = deferred;
    let label = operation.label();

    let span = info_span!("operation", worker = ctx.id, datacenter = %datacenter, op = %label);
    let result = execute(ctx, &datacenter, operation).instrument(span).await;

    match &result {
        Ok(_) => debug!(worker = ctx.id, datacenter = %datacenter, op = %label, "Operation done"),
        Err(e) if e.is_malformed() => {
            warn!(worker = ctx.id, datacenter = %datacenter, "Dropping queue entry: {}", e)
        }
        Err(e) => warn!(worker = ctx.id, datacenter = %datacenter, op = %label, "{}", e),
    }

    if let Some(slots) = slots {
        slots.record(ItemOutcome {
            datacenter,
            operation: label,
            result,
        });
    }
    drop(tickets);
}

async fn execute(
    ctx: &WorkerContext,
    datacenter: &DatacenterId,
    operation: OperationRef,
) -> Result<OpOutput> {
    let handle = ctx.registry.lookup(datacenter).ok_or_else(|| {
        DispatchError::MalformedJob(format!("no handle registered for datacenter {}", datacenter))
    })?;
    let job_poll = ctx.job_poll;

    let work: BoxFuture<'static, Result<OpOutput>> = match operation {
        OperationRef::Op(op) => async move { op.execute(&handle, &job_poll).await }.boxed(),
        OperationRef::Named { name, args } => {
            let op = DatacenterOp::by_name(&name, &args)?;
            async move { op.execute(&handle, &job_poll).await }.boxed()
        }
        OperationRef::Callable(f) => {
            async move { f(handle).await.map_err(DispatchError::from) }.boxed()
        }
    };

    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(DispatchError::Panicked(panic_message(panic.as_ref()))),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages_are_extracted() {
        let static_str: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(static_str.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
