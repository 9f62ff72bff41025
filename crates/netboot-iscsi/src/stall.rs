//! Per-device progress and stall tracking.
//!
//! [`transition`] is a pure function from the remembered tracker and one
//! telemetry observation to the next tracker plus the events to emit. It
//! does no I/O and no logging, so it can be driven directly by tests.
//!
//! States: `idle -> active -> stalled`, with `active_unattributed` entered
//! whenever a session is active but the byte counts cannot be trusted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::telemetry::Confidence;

/// Stall state of a device's install session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallState {
    /// No active session.
    #[default]
    Idle,
    /// Active session with trusted, growing byte counts.
    Active,
    /// Active session whose bytes cannot be attributed to this device.
    ActiveUnattributed,
    /// Active session with no byte growth for at least the threshold.
    Stalled,
}

/// Remembered stall detector state, persisted inside the transfer state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallTracker {
    /// Current state.
    pub stall_state: StallState,
    /// Last observed trusted byte total; `None` until the first baseline.
    pub stall_last_total_bytes: Option<u64>,
    /// Time the total last grew (or was baselined).
    pub stall_last_progress_at: Option<DateTime<Utc>>,
    /// Time of the last progress log event.
    #[serde(default)]
    pub stall_last_log_at: Option<DateTime<Utc>>,
    /// Byte total at the last progress log event.
    #[serde(default)]
    pub stall_last_logged_total: u64,
}

/// Thresholds for the stall detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallConfig {
    /// Seconds without growth before `stalled`.
    pub stall_threshold_secs: u64,
    /// Minimum seconds between progress events.
    pub progress_log_interval_secs: u64,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            stall_threshold_secs: 180,
            progress_log_interval_secs: 60,
        }
    }
}

/// One telemetry poll, reduced to what the detector needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Whether the target has an active session.
    pub active: bool,
    /// Confidence that `total_bytes` belongs to this device.
    pub confidence: Confidence,
    /// Observed byte total (both directions).
    pub total_bytes: Option<u64>,
    /// Poll time.
    pub at: DateTime<Utc>,
}

/// Side effects produced by a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StallEvent {
    /// Bytes grew and the logging interval elapsed.
    Progress {
        /// Bytes since the previous progress event.
        delta_bytes: u64,
        /// Current total.
        total_bytes: u64,
    },
    /// The session crossed the stall threshold.
    Stalled {
        /// Seconds since the last growth.
        stall_seconds: u64,
        /// Total at which the transfer stopped.
        total_bytes: u64,
    },
    /// Bytes grew again after a stall.
    Resumed {
        /// Seconds the session was without growth.
        stalled_seconds: u64,
        /// Current total.
        total_bytes: u64,
    },
}

/// Result of applying one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallOutcome {
    /// Next tracker state.
    pub tracker: StallTracker,
    /// Events to emit, in order.
    pub events: Vec<StallEvent>,
    /// Seconds since the last growth, when it was evaluated.
    pub stall_seconds: Option<u64>,
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_seconds().max(0) as u64
}

fn record_progress(
    next: &mut StallTracker,
    total: u64,
    at: DateTime<Utc>,
    config: &StallConfig,
    events: &mut Vec<StallEvent>,
) {
    next.stall_last_total_bytes = Some(total);
    next.stall_last_progress_at = Some(at);
    next.stall_state = StallState::Active;

    let due = match next.stall_last_log_at {
        Some(last) => seconds_between(last, at) >= config.progress_log_interval_secs,
        None => true,
    };
    if due {
        events.push(StallEvent::Progress {
            delta_bytes: total.saturating_sub(next.stall_last_logged_total),
            total_bytes: total,
        });
        next.stall_last_log_at = Some(at);
        next.stall_last_logged_total = total;
    }
}

fn rebaseline(next: &mut StallTracker, total: u64, at: DateTime<Utc>) {
    next.stall_state = StallState::Active;
    next.stall_last_total_bytes = Some(total);
    next.stall_last_progress_at = Some(at);
    next.stall_last_log_at = Some(at);
    next.stall_last_logged_total = total;
}

/// Applies one observation to the tracker.
pub fn transition(
    tracker: &StallTracker,
    obs: &Observation,
    config: &StallConfig,
) -> StallOutcome {
    let mut next = tracker.clone();
    let mut events = Vec::new();

    if !obs.active {
        next.stall_state = StallState::Idle;
        return StallOutcome {
            tracker: next,
            events,
            stall_seconds: None,
        };
    }

    let total = match obs.total_bytes {
        Some(total) if obs.confidence.is_actionable() => total,
        _ => {
            next.stall_state = StallState::ActiveUnattributed;
            return StallOutcome {
                tracker: next,
                events,
                stall_seconds: None,
            };
        }
    };

    let was_stalled = tracker.stall_state == StallState::Stalled;
    let resuming_from_untrusted = matches!(
        tracker.stall_state,
        StallState::Idle | StallState::ActiveUnattributed
    );

    let (previous, last_progress_at) =
        match (tracker.stall_last_total_bytes, tracker.stall_last_progress_at) {
            (Some(previous), Some(at)) => (previous, at),
            _ => {
                rebaseline(&mut next, total, obs.at);
                return StallOutcome {
                    tracker: next,
                    events,
                    stall_seconds: Some(0),
                };
            }
        };

    if total > previous {
        if was_stalled {
            events.push(StallEvent::Resumed {
                stalled_seconds: seconds_between(last_progress_at, obs.at),
                total_bytes: total,
            });
        }
        record_progress(&mut next, total, obs.at, config, &mut events);
        return StallOutcome {
            tracker: next,
            events,
            stall_seconds: Some(0),
        };
    }

    if total < previous {
        // Counter reset, e.g. the initiator reconnected on a new socket.
        if was_stalled {
            events.push(StallEvent::Resumed {
                stalled_seconds: seconds_between(last_progress_at, obs.at),
                total_bytes: total,
            });
        }
        rebaseline(&mut next, total, obs.at);
        return StallOutcome {
            tracker: next,
            events,
            stall_seconds: Some(0),
        };
    }

    if resuming_from_untrusted {
        // The stall clock only runs while the numbers are trusted.
        next.stall_state = StallState::Active;
        next.stall_last_progress_at = Some(obs.at);
        return StallOutcome {
            tracker: next,
            events,
            stall_seconds: Some(0),
        };
    }

    let stall_seconds = seconds_between(last_progress_at, obs.at);
    if !was_stalled && stall_seconds >= config.stall_threshold_secs {
        next.stall_state = StallState::Stalled;
        events.push(StallEvent::Stalled {
            stall_seconds,
            total_bytes: total,
        });
    }

    StallOutcome {
        tracker: next,
        events,
        stall_seconds: Some(stall_seconds),
    }
}
