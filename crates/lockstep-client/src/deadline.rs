//! Future-with-deadline wrapper.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("deadline of {0:?} elapsed")]
pub struct DeadlineElapsed(pub Duration);

/// Await `future` for at most `deadline`.
///
/// Completes with the inner output when it arrives in time; otherwise runs
/// `cleanup` exactly once and fails with [`DeadlineElapsed`].  The session
/// layer uses the cleanup hook to purge its pending-request entry.
pub async fn expiring<F, C>(
    future: F,
    deadline: Duration,
    cleanup: C,
) -> Result<F::Output, DeadlineElapsed>
where
    F: Future,
    C: FnOnce(),
{
    match tokio::time::timeout(deadline, future).await {
        Ok(output) => Ok(output),
        Err(_) => {
            cleanup();
            Err(DeadlineElapsed(deadline))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const DEADLINE: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn completes_with_inner_output_before_deadline() {
        let cleanups = AtomicU32::new(0);
        let result = expiring(async { 42 }, DEADLINE, || {
            cleanups.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_cleanup_once_on_expiry() {
        let cleanups = AtomicU32::new(0);
        let result = expiring(std::future::pending::<()>(), DEADLINE, || {
            cleanups.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert!(result.is_err());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inner_error_passes_through() {
        let result = expiring(async { Err::<(), &str>("boom") }, DEADLINE, || {}).await;
        assert_eq!(result.unwrap(), Err("boom"));
    }
}
