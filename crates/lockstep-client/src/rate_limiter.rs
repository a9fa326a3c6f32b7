//! Burst-collapsing rate limiter.
//!
//! `call` runs the job immediately when at least one interval has elapsed
//! since the last execution; otherwise the job is parked, replacing whatever
//! was parked before, and a single timer fires the latest parked job at the
//! interval boundary.  Across any burst the first and the last job execute.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Job = Box<dyn FnOnce() + Send>;

struct Inner {
    last_run: Option<Instant>,
    pending: Option<Job>,
    timer: Option<JoinHandle<()>>,
}

pub struct RateLimiter {
    interval: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            inner: Arc::new(Mutex::new(Inner {
                last_run: None,
                pending: None,
                timer: None,
            })),
        }
    }

    /// Run `job` now, or park it for the interval boundary.
    ///
    /// A parked job replaces any previously parked one: only the most recent
    /// call in a burst executes at the boundary.
    pub fn call(&self, job: impl FnOnce() + Send + 'static) {
        let now = Instant::now();
        let run_now = {
            let mut inner = self.inner.lock().unwrap();
            match inner.last_run {
                Some(last_run) if now < last_run + self.interval => {
                    inner.pending = Some(Box::new(job));
                    if inner.timer.is_none() {
                        inner.timer = Some(tokio::spawn(Self::fire_at(
                            last_run + self.interval,
                            Arc::clone(&self.inner),
                        )));
                    }
                    None
                }
                _ => {
                    inner.last_run = Some(now);
                    Some(job)
                }
            }
        };
        if let Some(job) = run_now {
            job();
        }
    }

    /// Discard the parked job, if any.  The last-run stamp is not advanced.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending = None;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }

    async fn fire_at(due: Instant, inner: Arc<Mutex<Inner>>) {
        tokio::time::sleep_until(due).await;
        let job = {
            let mut inner = inner.lock().unwrap();
            inner.timer = None;
            let job = inner.pending.take();
            if job.is_some() {
                inner.last_run = Some(Instant::now());
            }
            job
        };
        if let Some(job) = job {
            job();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);

    fn recording_limiter() -> (RateLimiter, Arc<Mutex<Vec<u32>>>) {
        (RateLimiter::new(INTERVAL), Arc::new(Mutex::new(Vec::new())))
    }

    fn record(log: &Arc<Mutex<Vec<u32>>>, n: u32) -> impl FnOnce() + Send + 'static {
        let log = Arc::clone(log);
        move || log.lock().unwrap().push(n)
    }

    #[tokio::test(start_paused = true)]
    async fn first_call_runs_immediately() {
        let (limiter, log) = recording_limiter();
        limiter.call(record(&log, 1));
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_executes_first_and_last_only() {
        let (limiter, log) = recording_limiter();
        limiter.call(record(&log, 1));
        limiter.call(record(&log, 2));
        limiter.call(record(&log, 3));
        limiter.call(record(&log, 4));
        assert_eq!(*log.lock().unwrap(), vec![1]);

        tokio::time::sleep(INTERVAL + Duration::from_millis(1)).await;
        assert_eq!(*log.lock().unwrap(), vec![1, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn call_after_interval_runs_immediately_again() {
        let (limiter, log) = recording_limiter();
        limiter.call(record(&log, 1));
        tokio::time::sleep(INTERVAL + Duration::from_millis(1)).await;
        limiter.call(record(&log, 2));
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_execution_advances_the_stamp() {
        let (limiter, log) = recording_limiter();
        limiter.call(record(&log, 1));
        limiter.call(record(&log, 2));
        tokio::time::sleep(INTERVAL + Duration::from_millis(1)).await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);

        // The boundary execution counts as a run: an immediate follow-up call
        // is again inside the interval and must be parked, not run.
        limiter.call(record(&log, 3));
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        tokio::time::sleep(INTERVAL + Duration::from_millis(1)).await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_discards_the_parked_job() {
        let (limiter, log) = recording_limiter();
        limiter.call(record(&log, 1));
        limiter.call(record(&log, 2));
        limiter.reset();

        tokio::time::sleep(INTERVAL * 2).await;
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_does_not_advance_the_stamp() {
        let (limiter, log) = recording_limiter();
        limiter.call(record(&log, 1));
        tokio::time::sleep(INTERVAL + Duration::from_millis(1)).await;
        limiter.reset();
        limiter.call(record(&log, 2));
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }
}
