//! One-shot stop signal shared by a connection and its background tasks.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Stopping,
    Stopped,
}

/// A stop condition that is raised exactly once.
///
/// Any number of callers may request a stop, concurrently or repeatedly. The first request moves
/// the signal out of `Running` and spawns the shutdown work passed to
/// [`LifecycleSignal::stop_with`]; later requests never run theirs. Every caller waits for the
/// shutdown to finish. The work runs on its own task, so dropping a waiting caller does not abort
/// it.
///
/// Waiters on [`LifecycleSignal::on_stopped`] are released as soon as the stop is requested, before
/// the shutdown work runs. [`LifecycleSignal::stopped`] only turns `true` once that work is done.
#[derive(Debug)]
pub struct LifecycleSignal {
    phase: Arc<watch::Sender<Phase>>,
}

/// Marks the signal `Stopped` when the shutdown task ends, including by panic.
struct MarkStopped(Arc<watch::Sender<Phase>>);

impl Drop for MarkStopped {
    fn drop(&mut self) {
        self.0.send_replace(Phase::Stopped);
    }
}

impl Default for LifecycleSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleSignal {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Running);
        LifecycleSignal {
            phase: Arc::new(phase),
        }
    }

    /// Request a stop, spawning `shutdown` if this is the first request, and wait until the
    /// shutdown has finished. Must be called from within a `tokio` runtime.
    pub async fn stop_with<F, Fut>(&self, shutdown: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // Subscribed before the transition so the final phase cannot be missed.
        let mut rx = self.phase.subscribe();
        let first = self.phase.send_if_modified(|phase| {
            if *phase == Phase::Running {
                *phase = Phase::Stopping;
                true
            } else {
                false
            }
        });
        if first {
            let work = shutdown();
            let guard = MarkStopped(self.phase.clone());
            tokio::spawn(async move {
                let _guard = guard;
                work.await;
            });
        }
        let _ = rx.wait_for(|phase| *phase == Phase::Stopped).await;
    }

    /// Request a stop with no shutdown work of its own.
    pub async fn stop(&self) {
        self.stop_with(|| async {}).await
    }

    /// Whether a stop has been requested (it may still be in progress).
    pub fn stop_requested(&self) -> bool {
        *self.phase.borrow() != Phase::Running
    }

    /// Whether the one-shot shutdown has run to completion.
    pub fn stopped(&self) -> bool {
        *self.phase.borrow() == Phase::Stopped
    }

    /// Resolves once a stop has been requested.
    pub fn on_stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.phase.subscribe();
        async move {
            // The sender lives as long as the signal; if it is gone there is nothing to wait on.
            let _ = rx.wait_for(|phase| *phase != Phase::Running).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Shutdown = Pin<Box<dyn Future<Output = ()> + Send>>;

    #[tokio::test]
    async fn shutdown_runs_once() {
        let signal = LifecycleSignal::new();
        let runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let runs = runs.clone();
            signal
                .stop_with(move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            assert!(signal.stopped());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_wait_for_shutdown() {
        let signal = Arc::new(LifecycleSignal::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let signal = signal.clone();
                let runs = runs.clone();
                tokio::spawn(async move {
                    signal
                        .stop_with(move || async move {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            runs.fetch_add(1, Ordering::SeqCst);
                        })
                        .await;
                    signal.stopped()
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn on_stopped_resolves_for_early_and_late_waiters() {
        let signal = LifecycleSignal::new();
        let early = tokio::spawn(signal.on_stopped());
        assert!(!signal.stopped());

        signal.stop().await;
        early.await.unwrap();
        signal.on_stopped().await;
        assert!(signal.stopped());
    }

    #[tokio::test]
    async fn waiters_are_released_before_shutdown_completes() {
        let signal = Arc::new(LifecycleSignal::new());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let stopper = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal
                    .stop_with(move || async move {
                        let _ = release_rx.await;
                    })
                    .await
            })
        };

        signal.on_stopped().await;
        assert!(signal.stop_requested());
        assert!(!signal.stopped());

        release_tx.send(()).unwrap();
        stopper.await.unwrap();
        assert!(signal.stopped());
    }

    fn slow_shutdown(runs: Arc<AtomicUsize>) -> impl FnOnce() -> Shutdown {
        move || {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                runs.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_caller_does_not_abort_shutdown() {
        let signal = LifecycleSignal::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            signal.stop_with(slow_shutdown(runs.clone())),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(signal.stop_requested());

        // Nobody else asks for a stop, yet the shutdown still finishes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(signal.stopped());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        signal.stop_with(slow_shutdown(runs.clone())).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn later_caller_waits_for_shutdown_of_dropped_caller() {
        let signal = LifecycleSignal::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let _ = tokio::time::timeout(
            Duration::from_millis(10),
            signal.stop_with(slow_shutdown(runs.clone())),
        )
        .await;
        assert!(!signal.stopped());

        signal.stop_with(slow_shutdown(runs.clone())).await;
        assert!(signal.stopped());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
