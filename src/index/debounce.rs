//! Debounced rebuild trigger.
//!
//! A dirty flag, a poke channel and one consumer task. Each [`Debouncer::trigger`]
//! marks the index dirty and (re)arms the quiet-period timer; the action runs
//! once the timer expires with the flag still set. Only the consumer task
//! touches the timer, so "timer fired" and "timer reset" cannot race.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Handle used by event producers
#[derive(Debug, Clone)]
pub struct Debouncer {
    dirty: Arc<AtomicBool>,
    pokes: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    /// Spawn the consumer task. `action` runs at most once per quiet period.
    pub fn spawn<F, Fut>(
        delay: Duration,
        shutdown: CancellationToken,
        action: F,
    ) -> (Self, JoinHandle<()>)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let dirty = Arc::new(AtomicBool::new(false));
        let (pokes, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(delay, Arc::clone(&dirty), rx, shutdown, action));
        (Self { dirty, pokes }, handle)
    }

    /// Mark dirty and restart the quiet period
    pub fn trigger(&self) {
        self.dirty.store(true, Ordering::Release);
        if self.pokes.send(()).is_err() {
            trace!("Debounce consumer already stopped");
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

async fn run<F, Fut>(
    delay: Duration,
    dirty: Arc<AtomicBool>,
    mut rx: mpsc::UnboundedReceiver<()>,
    shutdown: CancellationToken,
    action: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            poke = rx.recv() => {
                if poke.is_none() {
                    break;
                }
            }
        }

        // armed: every further poke restarts the quiet period
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => break,
                poke = rx.recv() => {
                    if poke.is_none() {
                        break;
                    }
                }
            }
        }

        if dirty.swap(false, Ordering::AcqRel) {
            debug!("Quiet period elapsed, running debounced action");
            action().await;
        }
    }
    debug!("Debounce consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn trigger_then_quiet_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let shutdown = CancellationToken::new();
        let (debouncer, handle) = Debouncer::spawn(Duration::from_secs(5), shutdown.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        debouncer.trigger();
        assert!(debouncer.is_dirty());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_dirty());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_discards_pending_action() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let shutdown = CancellationToken::new();
        let (debouncer, handle) = Debouncer::spawn(Duration::from_secs(5), shutdown.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        debouncer.trigger();
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
