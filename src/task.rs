use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Background job driven by a fixed-interval ticker.
///
/// The first tick fires one full interval after spawning. Dropping the handle
/// signals the loop to stop; [`PeriodicTask::shutdown`] also waits for it.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if tick().await.is_break() {
                            break;
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(task = name, "periodic task stopped");
        });
        Self {
            name,
            stop,
            handle: Some(handle),
        }
    }

    /// Stops the loop and waits for an in-flight tick to finish.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.await
        {
            warn!(task = self.name, error = %err, "periodic task panicked");
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let task = PeriodicTask::spawn("test", Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        task.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn break_ends_the_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let task = PeriodicTask::spawn("test", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Break(())
            }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        task.shutdown().await;
    }
}
