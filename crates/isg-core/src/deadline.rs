//! Timeout and cooperative cancellation for calls into external
//! collaborators (semantic hydration, preflight validation).
//!
//! The collaborator call runs on its own thread; the caller waits on a
//! channel in short slices so a cancellation request is noticed promptly. A
//! call that outlives its deadline is abandoned: its thread finishes in the
//! background and its result is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use tracing::warn;

use crate::errors::{IsgError, IsgResult};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Cancellation handle shared between a caller and the calls it starts.
///
/// `cancel()` abandons every call scoped before it; calls scoped afterwards
/// run normally, so one cancellation never disables the owning engine.
/// Clones share both the counter and the scope.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    generation: Arc<AtomicU64>,
    scoped_at: u64,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// True once `cancel()` has been called since this token was scoped.
    pub fn is_cancelled(&self) -> bool {
        self.generation.load(Ordering::SeqCst) != self.scoped_at
    }

    /// A token for one call: cancelled only by a `cancel()` issued after
    /// this point.
    pub fn scoped(&self) -> Self {
        Self {
            generation: Arc::clone(&self.generation),
            scoped_at: self.generation.load(Ordering::SeqCst),
        }
    }
}

/// Run `job` on a worker thread and wait at most `timeout` for it.
///
/// Timeouts surface as [`IsgError::Timeout`] (retryable); cancellation as
/// [`IsgError::Cancelled`].
pub fn run_with_deadline<T, F>(
    operation: &'static str,
    timeout: Duration,
    cancel: &CancellationToken,
    job: F,
) -> IsgResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> IsgResult<T> + Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(IsgError::Cancelled(operation));
    }

    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::Builder::new()
        .name(format!("isg-{operation}"))
        .spawn(move || {
            let _ = tx.send(job());
        })?;

    let started = Instant::now();
    loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            warn!("{operation} exceeded its {} ms deadline", timeout.as_millis());
            return Err(IsgError::Timeout {
                operation,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        match rx.recv_timeout(remaining.min(POLL_INTERVAL)) {
            Ok(result) => return result,
            Err(RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    warn!("{operation} cancelled by caller");
                    return Err(IsgError::Cancelled(operation));
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(IsgError::Io(std::io::Error::other(format!(
                    "{operation} worker exited without a result"
                ))));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_job_returns_value() {
        let token = CancellationToken::new();
        let value = run_with_deadline("job", Duration::from_secs(2), &token, || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_slow_job_times_out_as_retryable() {
        let token = CancellationToken::new();
        let err = run_with_deadline("job", Duration::from_millis(30), &token, || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, IsgError::Timeout { operation: "job", .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_cancellation_interrupts_wait() {
        let token = CancellationToken::new();
        let remote = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(40));
            remote.cancel();
        });
        let started = Instant::now();
        let err = run_with_deadline("job", Duration::from_secs(10), &token, || {
            std::thread::sleep(Duration::from_secs(2));
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, IsgError::Cancelled("job")));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_pre_cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let err = run_with_deadline("job", Duration::from_secs(1), &token, || Ok(1)).unwrap_err();
        assert!(matches!(err, IsgError::Cancelled(_)));
    }

    #[test]
    fn test_cancel_only_reaches_calls_scoped_before_it() {
        let token = CancellationToken::new();
        let in_flight = token.scoped();
        token.cancel();
        assert!(in_flight.is_cancelled());
        assert!(in_flight.clone().is_cancelled());

        let next = token.scoped();
        assert!(!next.is_cancelled());
        let value = run_with_deadline("scoped", Duration::from_secs(1), &next, || Ok(3)).unwrap();
        assert_eq!(value, 3);

        token.cancel();
        assert!(next.is_cancelled());
    }

    #[test]
    fn test_job_errors_pass_through() {
        let token = CancellationToken::new();
        let err = run_with_deadline::<(), _>("job", Duration::from_secs(1), &token, || {
            Err(IsgError::Hydration("analyzer crashed".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, IsgError::Hydration(_)));
    }
}
