//! Reference-time synchronizer.
//!
//! Estimates the offset between the local monotonic clock and the server's
//! reference clock from one round trip, assuming symmetric one-way delay:
//!
//! ```text
//! midpoint = sent_at + (received_at − sent_at) / 2     // local monotonic
//! offset   = server_reference_ms − midpoint
//! ```
//!
//! One exchange is awaited at construction; `start` then samples every 15 s
//! and reports offset changes to the callback.  Sample failures are logged
//! and the next tick retries implicitly.

use crate::clock::{LocalTime, Offset};
use crate::connection::{Connection, RequestError};
use lockstep_protocol::{ClientRequest, SuccessMessage};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("periodic sampling is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("expected a reference_time response")]
    UnexpectedResponse,
}

pub struct ReferenceTimeSynchronizer {
    connection: Arc<Connection>,
    offset: Arc<Mutex<Offset>>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl ReferenceTimeSynchronizer {
    /// Perform one reference-time exchange and return a synchronizer holding
    /// the resulting initial offset.
    pub async fn create_initialized(connection: Arc<Connection>) -> Result<Self, SyncError> {
        let offset = sample(&connection).await?;
        debug!(offset_ms = offset.millis(), "initial reference time offset");
        Ok(Self {
            connection,
            offset: Arc::new(Mutex::new(offset)),
            sampler: Mutex::new(None),
        })
    }

    pub fn offset(&self) -> Offset {
        *self.offset.lock().unwrap()
    }

    /// Translate a local monotonic timestamp into the server reference domain.
    pub fn server_time_from_local(&self, t: LocalTime) -> i64 {
        self.offset().local_to_server(t)
    }

    /// Begin periodic sampling.  `on_change` fires with
    /// `delta = new_offset − old_offset` whenever a sample moves the offset;
    /// equal samples are silent.
    pub fn start(
        &self,
        on_change: impl Fn(i64) + Send + Sync + 'static,
    ) -> Result<(), SyncError> {
        let mut sampler = self.sampler.lock().unwrap();
        if sampler.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let connection = Arc::clone(&self.connection);
        let offset_slot = Arc::clone(&self.offset);
        *sampler = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // An interval's first tick completes immediately; the initial
            // sample already happened at construction.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match sample(&connection).await {
                    Ok(new_offset) => {
                        let delta = {
                            let mut offset = offset_slot.lock().unwrap();
                            let delta = new_offset.millis() - offset.millis();
                            if delta != 0 {
                                *offset = new_offset;
                            }
                            delta
                        };
                        if delta != 0 {
                            debug!(delta, offset_ms = new_offset.millis(), "offset changed");
                            on_change(delta);
                        }
                    }
                    Err(e) => warn!(error = %e, "reference time sample failed"),
                }
            }
        }));
        Ok(())
    }

    /// Cancel periodic sampling.  A later `start` is allowed again.
    pub fn stop(&self) {
        if let Some(sampler) = self.sampler.lock().unwrap().take() {
            sampler.abort();
        }
    }
}

impl Drop for ReferenceTimeSynchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sample(connection: &Connection) -> Result<Offset, SyncError> {
    let response = connection
        .perform_request(ClientRequest::GetReferenceTime)
        .await?;
    match response.message {
        SuccessMessage::ReferenceTime { milliseconds } => {
            let midpoint = LocalTime::midpoint(
                response.metadata.sent_at,
                response.metadata.received_at,
            );
            Ok(Offset::from_sample(milliseconds, midpoint))
        }
        _ => Err(SyncError::UnexpectedResponse),
    }
}
