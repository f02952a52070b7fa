//! # Task Utilities
//!
//! Cooperative cancellation for the long-running pieces of a controller:
//! a [`Stopper`] token that child tasks poll or await, a deadline wrapper
//! with the "completed or quietly discarded" contract, and a bounded retry
//! helper.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

/// The sending half of a cancellation pair. Dropping it also stops the
/// matching [`Stopper`]s.
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// A cooperative cancellation token. Cheap to clone; hand one to every
/// sub-task.
#[derive(Clone)]
pub struct Stopper {
    rx: watch::Receiver<bool>,
}

impl Stopper {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the handle fires (or is dropped).
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // An error means the sender is gone, which counts as stopped.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

/// Creates a linked handle/token pair.
pub fn stop_pair() -> (StopHandle, Stopper) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, Stopper { rx })
}

/// Runs `f` with a child stopper under a deadline, also honoring the parent
/// stopper.
///
/// Returns `(true, Some(result))` when the future finishes in time. On
/// deadline or parent cancellation the child stopper fires so spawned
/// sub-work can exit, and the call returns `(false, None)` — the result is
/// discarded, and a timeout is not an error.
pub async fn exec_with_timeout<T, Fut>(
    parent: &Stopper,
    f: impl FnOnce(Stopper) -> Fut,
    timeout: Duration,
) -> (bool, Option<T>)
where
    Fut: Future<Output = T>,
{
    let (handle, child) = stop_pair();
    let fut = f(child);
    tokio::pin!(fut);

    tokio::select! {
        result = &mut fut => (true, Some(result)),
        _ = tokio::time::sleep(timeout) => {
            handle.stop();
            (false, None)
        }
        _ = parent.stopped() => {
            handle.stop();
            (false, None)
        }
    }
}

/// Calls `f` until it succeeds, at most `retries` times, with a linear
/// backoff between attempts. Returns the last error when every attempt
/// fails.
pub async fn retry<T, E, Fut>(
    mut f: impl FnMut() -> Fut,
    retries: usize,
    backoff: Duration,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_err = None;
    for attempt in 1..=retries.max(1) {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "retried operation failed");
                last_err = Some(e);
                if attempt < retries {
                    tokio::time::sleep(backoff * attempt as u32).await;
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt ran"))
}
