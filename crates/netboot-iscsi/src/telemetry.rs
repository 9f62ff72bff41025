//! Per-image connection telemetry.
//!
//! The target daemon does not reliably report per-initiator byte counters,
//! so bytes are attributed to an image from whichever signal is available:
//! native target counters first, then host TCP socket counters matched by
//! remote address. Every estimate carries the signal it came from and a
//! confidence level. Consumers must check [`Confidence::is_actionable`]
//! before treating the numbers as belonging to one device.

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::IscsiConfig;
use crate::error::{DaemonStep, IscsiError, IscsiResult};
use crate::model::Image;
use crate::parse::{parse_socket_table, ByteCounters, SocketStat, TargetStatus};
use crate::registrar::TargetRegistrar;
use crate::runner::CommandRunner;

/// How much an attribution can be trusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Numbers come from the target itself or an unambiguous socket match.
    High,
    /// Single-session hint without an address match.
    Medium,
    /// The remote address is shared by several active targets.
    Ambiguous,
    /// No usable signal.
    #[default]
    Unknown,
}

impl Confidence {
    /// True if byte totals at this confidence may drive stall logic.
    pub fn is_actionable(&self) -> bool {
        matches!(self, Confidence::High | Confidence::Medium)
    }
}

/// The signal that produced a byte estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterSource {
    /// Counters printed by the target daemon.
    TargetStats,
    /// Host socket counters matched by remote address.
    SocketCounters,
    /// The only socket on the port, assumed to belong to the only session.
    SocketCountersMacHint,
    /// No counters were attributed.
    #[default]
    Unavailable,
}

/// A value tagged with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Estimate<T> {
    /// The estimated value, absent when nothing could be attributed.
    pub value: Option<T>,
    /// Where the value came from.
    pub source: CounterSource,
    /// How far it can be trusted.
    pub confidence: Confidence,
}

impl<T> Estimate<T> {
    /// An estimate backed by a signal.
    pub fn new(value: T, source: CounterSource, confidence: Confidence) -> Self {
        Self {
            value: Some(value),
            source,
            confidence,
        }
    }

    /// No signal at all.
    pub fn unavailable() -> Self {
        Self {
            value: None,
            source: CounterSource::Unavailable,
            confidence: Confidence::Unknown,
        }
    }

    /// Signal exists but cannot be pinned to one device.
    pub fn ambiguous() -> Self {
        Self {
            value: None,
            source: CounterSource::Unavailable,
            confidence: Confidence::Ambiguous,
        }
    }

    /// The value, only if the confidence is actionable.
    pub fn actionable(&self) -> Option<&T> {
        if self.confidence.is_actionable() {
            self.value.as_ref()
        } else {
            None
        }
    }

    /// Consumes the estimate, failing unless it is actionable.
    pub fn require_actionable(self) -> IscsiResult<T> {
        match (self.confidence, self.value) {
            (Confidence::Ambiguous, _) => Err(IscsiError::AmbiguousAttribution),
            (c, Some(value)) if c.is_actionable() => Ok(value),
            _ => Err(IscsiError::NotFound {
                what: "transfer counters",
                name: "unattributed".to_string(),
            }),
        }
    }
}

/// Network view: server-side rx/tx.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCounters {
    /// Bytes received by the server.
    pub rx: Option<u64>,
    /// Bytes sent by the server.
    pub tx: Option<u64>,
    /// Where the numbers came from.
    pub source: CounterSource,
}

/// Disk view derived from the network view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskIo {
    /// Bytes the initiator read from the disk (server tx).
    pub read: Option<u64>,
    /// Bytes the initiator wrote to the disk (server rx).
    pub write: Option<u64>,
    /// Where the numbers came from.
    pub source: CounterSource,
}

/// Best-effort connection state of one image's target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEstimate {
    /// Live target id, if the target is registered.
    pub target_id: Option<u32>,
    /// True if at least one initiator session exists.
    pub active: bool,
    /// Number of initiator sessions.
    pub session_count: usize,
    /// Remote addresses of the sessions.
    pub remote_ips: Vec<IpAddr>,
    /// Server-side byte counters.
    pub network: NetworkCounters,
    /// Initiator-side disk view.
    pub disk_io: DiskIo,
    /// Confidence of the byte attribution.
    pub attribution_confidence: Confidence,
}

impl ConnectionEstimate {
    fn with_bytes(mut self, bytes: Estimate<ByteCounters>) -> Self {
        let counters = bytes.value;
        self.network = NetworkCounters {
            rx: counters.map(|c| c.rx_bytes),
            tx: counters.map(|c| c.tx_bytes),
            source: bytes.source,
        };
        self.disk_io = DiskIo {
            read: counters.map(|c| c.tx_bytes),
            write: counters.map(|c| c.rx_bytes),
            source: bytes.source,
        };
        self.attribution_confidence = bytes.confidence;
        self
    }

    /// The byte attribution as a tagged estimate.
    pub fn bytes(&self) -> Estimate<ByteCounters> {
        let value = match (self.network.rx, self.network.tx) {
            (Some(rx_bytes), Some(tx_bytes)) => Some(ByteCounters { rx_bytes, tx_bytes }),
            _ => None,
        };
        Estimate {
            value,
            source: self.network.source,
            confidence: self.attribution_confidence,
        }
    }

    /// Total attributed bytes in both directions.
    pub fn total_bytes(&self) -> Option<u64> {
        self.bytes().value.map(|c| c.total())
    }
}

fn sum_counters<'a>(sockets: impl Iterator<Item = &'a SocketStat>) -> ByteCounters {
    sockets.fold(ByteCounters::default(), |acc, s| ByteCounters {
        rx_bytes: acc.rx_bytes.saturating_add(s.bytes_received),
        tx_bytes: acc.tx_bytes.saturating_add(s.bytes_sent),
    })
}

/// Attributes bytes to `target` from the daemon listing and socket table.
///
/// `sockets` must already be restricted to the target service port.
/// Pure function; the rules are applied in order:
///
/// 1. native counters on the target: `high`, `target_stats`
/// 2. one active target and one socket system-wide: `high`, `socket_counters`
/// 3. a session address shared with another active target: `ambiguous`, no bytes
/// 4. sockets matching the session addresses: `high`, `socket_counters`
/// 5. one session, no address match, one socket: `medium`, `socket_counters_mac_hint`
/// 6. otherwise `unknown`, `unavailable`
pub fn attribute(
    target: Option<&TargetStatus>,
    all_targets: &[TargetStatus],
    sockets: &[SocketStat],
) -> ConnectionEstimate {
    let Some(target) = target else {
        return ConnectionEstimate::default();
    };

    let base = ConnectionEstimate {
        target_id: Some(target.target_id),
        active: target.is_active(),
        session_count: target.session_count(),
        remote_ips: target.remote_ips(),
        ..ConnectionEstimate::default()
    };

    if !target.is_active() {
        return base;
    }

    if let Some(counters) = target.native_counters() {
        return base.with_bytes(Estimate::new(
            counters,
            CounterSource::TargetStats,
            Confidence::High,
        ));
    }

    let active: Vec<&TargetStatus> = all_targets.iter().filter(|t| t.is_active()).collect();

    if active.len() == 1 && active[0].target_id == target.target_id && sockets.len() == 1 {
        return base.with_bytes(Estimate::new(
            sockets[0].counters(),
            CounterSource::SocketCounters,
            Confidence::High,
        ));
    }

    let shared = base.remote_ips.iter().any(|ip| {
        active
            .iter()
            .filter(|t| t.target_id != target.target_id)
            .any(|t| t.remote_ips().contains(ip))
    });
    if shared {
        return base.with_bytes(Estimate::ambiguous());
    }

    let mut matched = sockets
        .iter()
        .filter(|s| base.remote_ips.contains(&s.remote_ip))
        .peekable();
    if matched.peek().is_some() {
        let counters = sum_counters(matched);
        return base.with_bytes(Estimate::new(
            counters,
            CounterSource::SocketCounters,
            Confidence::High,
        ));
    }

    if target.session_count() == 1 && sockets.len() == 1 {
        return base.with_bytes(Estimate::new(
            sockets[0].counters(),
            CounterSource::SocketCountersMacHint,
            Confidence::Medium,
        ));
    }

    base.with_bytes(Estimate::unavailable())
}

/// Queries the daemon and the socket table for per-image estimates.
pub struct ConnectionTelemetry {
    registrar: Arc<TargetRegistrar>,
    runner: Arc<dyn CommandRunner>,
    config: Arc<IscsiConfig>,
}

impl ConnectionTelemetry {
    /// Create a telemetry reader sharing the registrar's daemon view.
    pub fn new(
        registrar: Arc<TargetRegistrar>,
        runner: Arc<dyn CommandRunner>,
        config: Arc<IscsiConfig>,
    ) -> Self {
        Self {
            registrar,
            runner,
            config,
        }
    }

    /// Established connections on the target service port.
    pub async fn socket_table(&self) -> IscsiResult<Vec<SocketStat>> {
        let port = self.config.iscsi_port;
        let args = vec![
            "-tinH".to_string(),
            "state".to_string(),
            "established".to_string(),
            format!("( sport = :{} )", port),
        ];
        let output = self
            .runner
            .run(&self.config.ss_path, &args, self.config.command_timeout())
            .await
            .map_err(|e| IscsiError::daemon(DaemonStep::SocketTable, e))?;
        let sockets: Vec<SocketStat> = parse_socket_table(&output.stdout)
            .into_iter()
            .filter(|s| s.local_port == port)
            .collect();
        debug!(port, count = sockets.len(), "parsed socket table");
        Ok(sockets)
    }

    /// Estimates the connection state of `image`; never fails.
    ///
    /// The target is resolved by name against the live listing, so a stale
    /// persisted target id has no effect.
    pub async fn estimate(&self, image: &Image) -> ConnectionEstimate {
        let targets = match self.registrar.show_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(image = %image.name, "target listing unavailable for telemetry: {}", e);
                return ConnectionEstimate::default();
            }
        };

        let target = targets.iter().find(|t| t.target_name == image.target_name);
        let needs_sockets = target.is_some_and(|t| t.is_active() && t.native_counters().is_none());

        let sockets = if needs_sockets {
            self.socket_table().await.unwrap_or_else(|e| {
                warn!(image = %image.name, "socket table unavailable for telemetry: {}", e);
                Vec::new()
            })
        } else {
            Vec::new()
        };

        let estimate = attribute(target, &targets, &sockets);
        debug!(
            image = %image.name,
            active = estimate.active,
            sessions = estimate.session_count,
            source = ?estimate.network.source,
            confidence = ?estimate.attribution_confidence,
            "connection estimate"
        );
        estimate
    }
}
