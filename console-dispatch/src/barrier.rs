use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Counts outstanding work items and lets callers wait until none are left.
///
/// Items are tracked with [`Ticket`]s: taking a ticket adds one item and
/// dropping it marks that item done, so an item is released even if the
/// worker that held it bails out early.
#[derive(Debug)]
pub struct CompletionBarrier {
    outstanding: watch::Sender<usize>,
}

impl Default for CompletionBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionBarrier {
    pub fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self { outstanding }
    }

    pub fn ticket(self: &Arc<Self>) -> Ticket {
        self.outstanding.send_modify(|count| *count += 1);
        Ticket {
            barrier: Arc::clone(self),
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Waits until every ticket taken so far has been dropped.
    /// Returns immediately when nothing is outstanding.
    pub async fn join(&self) {
        let mut watcher = self.outstanding.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = watcher.wait_for(|count| *count == 0).await;
    }

    /// Like [`join`](Self::join) but gives up after `limit`. Returns whether
    /// the barrier drained in time.
    pub async fn join_timeout(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.join()).await.is_ok()
    }

    fn release(&self) {
        self.outstanding
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// One outstanding item on a [`CompletionBarrier`].
#[derive(Debug)]
#[must_use = "dropping a ticket marks its item done"]
pub struct Ticket {
    barrier: Arc<CompletionBarrier>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.barrier.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_without_tickets_returns_immediately() {
        let barrier = Arc::new(CompletionBarrier::new());
        assert!(barrier.join_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn join_waits_for_every_ticket() {
        let barrier = Arc::new(CompletionBarrier::new());
        let tickets: Vec<Ticket> = (0..3).map(|_| barrier.ticket()).collect();
        assert_eq!(barrier.outstanding(), 3);

        let mut tickets = tickets.into_iter();
        drop(tickets.next());
        drop(tickets.next());
        assert!(!barrier.join_timeout(Duration::from_millis(20)).await);

        let last = tickets.next();
        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.join().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(last);
        waiter.await.unwrap();
        assert_eq!(barrier.outstanding(), 0);
    }

    #[tokio::test]
    async fn barrier_is_reusable() {
        let barrier = Arc::new(CompletionBarrier::new());
        drop(barrier.ticket());
        barrier.join().await;

        let ticket = barrier.ticket();
        assert_eq!(barrier.outstanding(), 1);
        drop(ticket);
        barrier.join().await;
    }
}
