//! Player coordinator: binds the authoritative playback state to a local
//! media sink.
//!
//! Server-directed moves (apply) drive the sink; sink-originated events are
//! reported back through `on_seek`/`on_play_pause`, suppressed while an apply
//! is in progress so a server-driven seek cannot echo back to the server as a
//! user seek.  Scrubbing is collapsed by a rate limiter: at most one seek
//! report per interval, final position guaranteed.

use crate::clock::LocalTime;
use crate::medium::PlaybackState;
use crate::rate_limiter::RateLimiter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_DRIFT_THRESHOLD: Duration = Duration::from_millis(1000);
pub const SEEK_REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// Failure loading a medium's metadata into the sink.  Boundary error,
/// reported to the UI.
#[derive(Debug, thiserror::Error)]
#[error("media sink failed to load '{name}': {reason}")]
pub struct PlayerLoadError {
    pub name: String,
    pub reason: String,
}

/// The capabilities the coordinator needs from a media element.
///
/// Positions are durations; sinks that measure in seconds convert at this
/// boundary.
pub trait MediaSink: Send + Sync {
    fn load(&self, name: &str, length: Duration) -> Result<(), PlayerLoadError>;
    fn position(&self) -> Duration;
    fn is_paused(&self) -> bool;
    fn set_position(&self, position: Duration);
    fn play(&self);
    fn pause(&self);
}

pub struct PlayerCoordinator {
    sink: Arc<dyn MediaSink>,
    threshold: Duration,
    applying: AtomicBool,
    on_seek: Arc<dyn Fn(Duration) + Send + Sync>,
    on_play_pause: Box<dyn Fn(bool, Duration) + Send + Sync>,
    seek_limiter: RateLimiter,
}

impl PlayerCoordinator {
    /// Bind `sink` to `initial`.  Returns `None` when either is absent (no
    /// sink attached yet, or no medium loaded).  `threshold` defaults to
    /// [`DEFAULT_DRIFT_THRESHOLD`].
    pub fn for_player_with_initial_state(
        sink: Option<Arc<dyn MediaSink>>,
        initial: Option<PlaybackState>,
        on_seek: impl Fn(Duration) + Send + Sync + 'static,
        on_play_pause: impl Fn(bool, Duration) + Send + Sync + 'static,
        threshold: Option<Duration>,
    ) -> Option<Self> {
        let (sink, initial) = (sink?, initial?);
        let coordinator = Self {
            sink,
            threshold: threshold.unwrap_or(DEFAULT_DRIFT_THRESHOLD),
            applying: AtomicBool::new(false),
            on_seek: Arc::new(on_seek),
            on_play_pause: Box::new(on_play_pause),
            seek_limiter: RateLimiter::new(SEEK_REPORT_INTERVAL),
        };
        coordinator.apply(&initial);
        Some(coordinator)
    }

    /// Drive the sink into conformance with `target`.
    ///
    /// A paused target always pauses and seeks.  A playing target seeks a
    /// paused sink unconditionally, but leaves a playing sink alone while its
    /// drift from the derived position stays under the threshold — natural
    /// playback suffices.
    pub fn apply(&self, target: &PlaybackState) {
        self.applying.store(true, Ordering::SeqCst);
        match target {
            PlaybackState::Paused { position } => {
                if !self.sink.is_paused() {
                    self.sink.pause();
                }
                self.sink.set_position(*position);
            }
            PlaybackState::Playing { local_start_time } => {
                let derived = derived_position(*local_start_time, LocalTime::now());
                if self.sink.is_paused() {
                    self.sink.play();
                    self.sink.set_position(derived);
                } else {
                    let drift = abs_difference(self.sink.position(), derived);
                    if drift >= self.threshold {
                        debug!(?drift, "adjusting drifted sink");
                        self.sink.set_position(derived);
                    }
                }
            }
        }
        self.applying.store(false, Ordering::SeqCst);
    }

    /// Report a user seek from the sink.  Ignored during a server-driven
    /// apply; otherwise funneled through the rate limiter.
    pub fn sink_seeked(&self, position: Duration) {
        if self.applying.load(Ordering::SeqCst) {
            return;
        }
        let on_seek = Arc::clone(&self.on_seek);
        self.seek_limiter.call(move || on_seek(position));
    }

    /// Report a user play/pause toggle from the sink.  Ignored during a
    /// server-driven apply.
    pub fn sink_play_state_changed(&self, paused: bool) {
        if self.applying.load(Ordering::SeqCst) {
            return;
        }
        (self.on_play_pause)(paused, self.sink.position());
    }
}

/// Position a playing medium has reached by `now`, never negative.
fn derived_position(local_start_time: LocalTime, now: LocalTime) -> Duration {
    let elapsed_ms = now - local_start_time;
    Duration::from_millis(u64::try_from(elapsed_ms).unwrap_or(0))
}

fn abs_difference(a: Duration, b: Duration) -> Duration {
    if a >= b { a - b } else { b - a }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum SinkCall {
        Play,
        Pause,
        SetPosition(Duration),
    }

    #[derive(Default)]
    struct FakeSink {
        paused: Mutex<bool>,
        position: Mutex<Duration>,
        calls: Mutex<Vec<SinkCall>>,
    }

    impl FakeSink {
        fn playing_at(position: Duration) -> Arc<Self> {
            let sink = Self::default();
            *sink.paused.lock().unwrap() = false;
            *sink.position.lock().unwrap() = position;
            Arc::new(sink)
        }

        fn paused_at(position: Duration) -> Arc<Self> {
            let sink = Self::default();
            *sink.paused.lock().unwrap() = true;
            *sink.position.lock().unwrap() = position;
            Arc::new(sink)
        }

        fn calls(&self) -> Vec<SinkCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl MediaSink for FakeSink {
        fn load(&self, _name: &str, _length: Duration) -> Result<(), PlayerLoadError> {
            Ok(())
        }

        fn position(&self) -> Duration {
            *self.position.lock().unwrap()
        }

        fn is_paused(&self) -> bool {
            *self.paused.lock().unwrap()
        }

        fn set_position(&self, position: Duration) {
            *self.position.lock().unwrap() = position;
            self.calls.lock().unwrap().push(SinkCall::SetPosition(position));
        }

        fn play(&self) {
            *self.paused.lock().unwrap() = false;
            self.calls.lock().unwrap().push(SinkCall::Play);
        }

        fn pause(&self) {
            *self.paused.lock().unwrap() = true;
            self.calls.lock().unwrap().push(SinkCall::Pause);
        }
    }

    fn coordinator_for(sink: &Arc<FakeSink>, initial: PlaybackState) -> PlayerCoordinator {
        PlayerCoordinator::for_player_with_initial_state(
            Some(Arc::clone(sink) as Arc<dyn MediaSink>),
            Some(initial),
            |_| {},
            |_, _| {},
            None,
        )
        .expect("sink and initial state are present")
    }

    #[tokio::test]
    async fn factory_requires_sink_and_initial_state() {
        let sink = FakeSink::paused_at(Duration::ZERO);
        assert!(
            PlayerCoordinator::for_player_with_initial_state(
                None,
                Some(PlaybackState::Paused {
                    position: Duration::ZERO,
                }),
                |_| {},
                |_, _| {},
                None,
            )
            .is_none()
        );
        assert!(
            PlayerCoordinator::for_player_with_initial_state(
                Some(sink as Arc<dyn MediaSink>),
                None,
                |_| {},
                |_, _| {},
                None,
            )
            .is_none()
        );
    }

    #[tokio::test]
    async fn paused_target_pauses_and_seeks_a_playing_sink() {
        let sink = FakeSink::playing_at(Duration::from_secs(10));
        let _coordinator = coordinator_for(
            &sink,
            PlaybackState::Paused {
                position: Duration::from_millis(90_500),
            },
        );

        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Pause,
                SinkCall::SetPosition(Duration::from_millis(90_500)),
            ]
        );
    }

    #[tokio::test]
    async fn playing_target_starts_a_paused_sink() {
        let sink = FakeSink::paused_at(Duration::ZERO);
        // Started 30 s ago in local time.
        let start = LocalTime::now() + (-30_000);
        let _coordinator = coordinator_for(
            &sink,
            PlaybackState::Playing {
                local_start_time: start,
            },
        );

        let calls = sink.calls();
        assert_eq!(calls[0], SinkCall::Play);
        match calls[1] {
            SinkCall::SetPosition(position) => {
                assert!(position >= Duration::from_secs(29) && position <= Duration::from_secs(31));
            }
            ref other => panic!("expected SetPosition, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn playing_sink_below_threshold_is_left_alone() {
        let start = LocalTime::now() + (-30_000);
        let sink = FakeSink::playing_at(Duration::from_millis(30_999));
        let coordinator = coordinator_for(
            &sink,
            PlaybackState::Playing {
                local_start_time: start,
            },
        );
        coordinator.apply(&PlaybackState::Playing {
            local_start_time: start,
        });

        assert!(sink.calls().is_empty(), "drift under threshold: no calls");
    }

    #[tokio::test(start_paused = true)]
    async fn playing_sink_at_threshold_is_adjusted() {
        let start = LocalTime::now() + (-30_000);
        let sink = FakeSink::playing_at(Duration::from_millis(31_000));
        let coordinator = coordinator_for(
            &sink,
            PlaybackState::Playing {
                local_start_time: start,
            },
        );
        coordinator.apply(&PlaybackState::Playing {
            local_start_time: start,
        });

        assert_eq!(
            sink.calls(),
            vec![SinkCall::SetPosition(Duration::from_millis(30_000))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn future_start_time_derives_position_zero() {
        let sink = FakeSink::paused_at(Duration::from_secs(5));
        let start = LocalTime::now() + 10_000;
        let _coordinator = coordinator_for(
            &sink,
            PlaybackState::Playing {
                local_start_time: start,
            },
        );

        assert_eq!(
            sink.calls(),
            vec![SinkCall::Play, SinkCall::SetPosition(Duration::ZERO)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn seek_burst_reports_first_and_final_position() {
        let sink = FakeSink::playing_at(Duration::ZERO);
        let seeks = Arc::new(Mutex::new(Vec::new()));
        let seeks_in_callback = Arc::clone(&seeks);
        let coordinator = PlayerCoordinator::for_player_with_initial_state(
            Some(Arc::clone(&sink) as Arc<dyn MediaSink>),
            Some(PlaybackState::Paused {
                position: Duration::ZERO,
            }),
            move |position| seeks_in_callback.lock().unwrap().push(position),
            |_, _| {},
            None,
        )
        .unwrap();

        for ms in [1_000, 2_000, 3_000, 4_000] {
            coordinator.sink_seeked(Duration::from_millis(ms));
        }
        tokio::time::sleep(SEEK_REPORT_INTERVAL + Duration::from_millis(1)).await;

        assert_eq!(
            *seeks.lock().unwrap(),
            vec![Duration::from_millis(1_000), Duration::from_millis(4_000)]
        );
    }

    #[tokio::test]
    async fn play_pause_toggle_reports_position() {
        let sink = FakeSink::playing_at(Duration::from_secs(42));
        let toggles = Arc::new(Mutex::new(Vec::new()));
        let toggles_in_callback = Arc::clone(&toggles);
        let coordinator = PlayerCoordinator::for_player_with_initial_state(
            Some(Arc::clone(&sink) as Arc<dyn MediaSink>),
            Some(PlaybackState::Paused {
                position: Duration::ZERO,
            }),
            |_| {},
            move |paused, position| toggles_in_callback.lock().unwrap().push((paused, position)),
            None,
        )
        .unwrap();

        coordinator.sink_play_state_changed(true);
        assert_eq!(
            *toggles.lock().unwrap(),
            vec![(true, *sink.position.lock().unwrap())]
        );
    }
}
