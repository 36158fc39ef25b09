//! `EnhancementJobObserver` lets a caller wait for one job to finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::EnhancementJob;

/// Waits shorter than this are raised to it.
pub const MIN_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Pending,
    /// Nothing running and nothing left to execute.
    Completed,
    /// The handler gave up on a job that had not completed.
    Abandoned,
    Closed,
}

/// Handle on a registered [`EnhancementJob`].
///
/// The handler signals the observer once the job is finished, or when the
/// handler itself is closed. Waiting never misses a signal sent before the
/// wait started, and never takes the item's lock.
#[derive(Debug)]
pub struct EnhancementJobObserver {
    job: Arc<EnhancementJob>,
    signal: watch::Sender<Signal>,
}

impl EnhancementJobObserver {
    pub(crate) fn new(job: Arc<EnhancementJob>) -> Self {
        let (signal, _) = watch::channel(Signal::Pending);
        Self { job, signal }
    }

    pub fn job(&self) -> &Arc<EnhancementJob> {
        &self.job
    }

    /// `completed` is the job's `is_finished` as seen by the handler.
    pub(crate) fn notify_finished(&self, completed: bool) {
        self.signal.send_replace(if completed {
            Signal::Completed
        } else {
            Signal::Abandoned
        });
    }

    /// Wake waiters because the handler shut down. A job that already
    /// finished keeps its signal.
    pub(crate) fn notify_closed(&self) {
        self.signal.send_if_modified(|s| {
            if *s == Signal::Pending {
                *s = Signal::Closed;
                true
            } else {
                false
            }
        });
    }

    /// The handler finished the job with nothing running and nothing left
    /// to execute.
    pub fn has_completed(&self) -> bool {
        *self.signal.borrow() == Signal::Completed
    }

    /// The handler was closed before the job finished.
    pub fn is_closed(&self) -> bool {
        *self.signal.borrow() == Signal::Closed
    }

    /// Wait until the job finished, the handler was closed, or `max_wait`
    /// (at least [`MIN_WAIT`]) elapsed. Returns [`has_completed`](Self::has_completed).
    pub async fn wait_for_completion(&self, max_wait: Duration) -> bool {
        let max_wait = max_wait.max(MIN_WAIT);
        let mut rx = self.signal.subscribe();
        let signalled = tokio::time::timeout(max_wait, rx.wait_for(|s| *s != Signal::Pending))
            .await
            .is_ok();
        if !signalled {
            debug!("stopped waiting for {} after {max_wait:?}", self.job);
        }
        self.has_completed()
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use enhancer::{ContentItem, ExecutionNode, ExecutionPlan};

    fn observer() -> EnhancementJobObserver {
        let item = Arc::new(ContentItem::from_text("text"));
        let plan = Arc::new(ExecutionPlan::new("single", vec![ExecutionNode::new("a")]));
        EnhancementJobObserver::new(Arc::new(EnhancementJob::new(item, plan, false).unwrap()))
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_when_nothing_happens() {
        let observer = observer();
        let started = tokio::time::Instant::now();
        assert!(!observer.wait_for_completion(Duration::from_secs(2)).await);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(!observer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn short_waits_are_raised_to_the_minimum() {
        let observer = observer();
        let started = tokio::time::Instant::now();
        observer.wait_for_completion(Duration::from_millis(1)).await;
        assert!(started.elapsed() >= MIN_WAIT);
    }

    #[tokio::test]
    async fn signal_sent_before_waiting_is_not_missed() {
        let observer = observer();
        observer.job().set_running("a").unwrap();
        observer.job().set_completed("a").unwrap();
        observer.notify_finished(true);
        assert!(observer.wait_for_completion(Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn abandoned_jobs_have_not_completed() {
        let observer = observer();
        observer.notify_finished(false);
        assert!(!observer.wait_for_completion(Duration::from_secs(30)).await);
        assert!(!observer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_does_not_need_the_item_lock() {
        let observer = observer();
        let _locked = observer.job().content_item().write();
        assert!(!observer.wait_for_completion(Duration::from_secs(1)).await);
        assert!(!observer.has_completed());
    }

    #[tokio::test]
    async fn closing_wakes_waiters() {
        let observer = Arc::new(observer());
        let waiter = {
            let observer = Arc::clone(&observer);
            tokio::spawn(async move { observer.wait_for_completion(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        observer.notify_closed();
        assert!(!waiter.await.unwrap());
        assert!(observer.is_closed());
    }

    #[test]
    fn close_does_not_override_finished() {
        let observer = observer();
        observer.notify_finished(true);
        observer.notify_closed();
        assert!(!observer.is_closed());
        assert!(observer.has_completed());
    }
}
