//! Bounded-concurrency gate for calls to the moderation service.
//!
//! Every outbound call (page fetches and action emissions alike) runs
//! through [`Dispatcher::run`]. At most `ceiling` operations are in flight;
//! the rest wait in submission order. Admission is serialized, completion
//! is not.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::ModerationError;
use crate::moderation::{ActionRequest, ModerationService};

pub struct Dispatcher {
    // tokio's semaphore is fair, so waiters are admitted FIFO.
    permits: Semaphore,
    ceiling: usize,
    in_flight: AtomicUsize,
    queued: AtomicUsize,
}

impl Dispatcher {
    /// Create a dispatcher admitting at most `ceiling` operations at once.
    /// A ceiling of zero is raised to one.
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            permits: Semaphore::new(ceiling),
            ceiling,
            in_flight: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Operations currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Operations waiting for admission.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Wait for admission, then run `op` to completion.
    ///
    /// The operation's own error is returned untouched; a failure never
    /// affects the admission of other operations.
    pub async fn run<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ModerationError>,
    {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let permit = self.permits.acquire().await;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        let _permit = permit.map_err(|_| ModerationError::DispatcherClosed)?;

        let _guard = InFlight::enter(&self.in_flight);
        op().await
    }

    /// Emit one moderation action through the gate.
    pub async fn emit(
        &self,
        service: &dyn ModerationService,
        request: &ActionRequest,
    ) -> Result<(), ModerationError> {
        debug!(
            kind = request.kind.label(),
            subject = %request.subject,
            in_flight = self.in_flight(),
            queued = self.queued(),
            "Dispatching moderation action"
        );
        self.run(|| service.emit_action(request)).await
    }

    /// Stop admitting new operations. Waiters fail with `DispatcherClosed`.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Decrements the in-flight counter when the operation finishes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures::future::join_all;
    use tokio::sync::oneshot;

    use super::*;

    async fn bounded_run(total: usize, ceiling: usize) -> (usize, usize) {
        let dispatcher = Dispatcher::new(ceiling);
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let done = AtomicUsize::new(0);

        let ops = (0..total).map(|_| {
            dispatcher.run(|| async {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ModerationError>(())
            })
        });
        for result in join_all(ops).await {
            assert!(result.is_ok());
        }
        assert_eq!(dispatcher.in_flight(), 0);
        (peak.load(Ordering::SeqCst), done.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn never_exceeds_ceiling_and_completes_all() {
        for (total, ceiling) in [(0, 1), (1, 1), (10, 1), (50, 4), (7, 10)] {
            let (peak, done) = bounded_run(total, ceiling).await;
            assert!(peak <= ceiling, "peak {peak} over ceiling {ceiling}");
            assert_eq!(done, total);
        }
    }

    #[tokio::test]
    async fn zero_ceiling_raised_to_one() {
        assert_eq!(Dispatcher::new(0).ceiling(), 1);
    }

    #[tokio::test]
    async fn queued_operations_start_in_submission_order() {
        let dispatcher = Arc::new(Dispatcher::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release, hold) = oneshot::channel::<()>();

        let blocker = {
            let task_dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                task_dispatcher
                    .run(move || async move {
                        let _ = hold.await;
                        Ok::<_, ModerationError>(())
                    })
                    .await
            })
        };
        while dispatcher.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let mut waiters = Vec::new();
        for i in 0..5 {
            let task_dispatcher = Arc::clone(&dispatcher);
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                task_dispatcher
                    .run(move || async move {
                        order.lock().unwrap().push(i);
                        Ok::<_, ModerationError>(())
                    })
                    .await
            }));
            while dispatcher.queued() < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        release.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failures_do_not_block_others() {
        let dispatcher = Dispatcher::new(2);
        let ops = (0..10).map(|i| {
            dispatcher.run(move || async move {
                if i % 3 == 0 {
                    Err(ModerationError::Transient {
                        method: "test".into(),
                        reason: format!("op {i}"),
                    })
                } else {
                    Ok(i)
                }
            })
        });
        let results = join_all(ops).await;
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 4);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 6);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn closed_dispatcher_rejects() {
        let dispatcher = Dispatcher::new(1);
        dispatcher.close();
        let result = dispatcher
            .run(|| async { Ok::<_, ModerationError>(()) })
            .await;
        assert!(matches!(result, Err(ModerationError::DispatcherClosed)));
    }
}
