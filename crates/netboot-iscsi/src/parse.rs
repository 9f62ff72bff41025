//! Parsers for free-text daemon and socket-table output.
//!
//! The target daemon's listing format is not a stable interface, so all
//! pattern matching lives here and produces typed results. Fields that are
//! not found stay `None` (or empty) instead of failing the whole parse.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Byte counters from the server's perspective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteCounters {
    /// Bytes received by the server (initiator writing to disk).
    pub rx_bytes: u64,
    /// Bytes sent by the server (initiator reading from disk).
    pub tx_bytes: u64,
}

impl ByteCounters {
    /// Sum of both directions.
    pub fn total(&self) -> u64 {
        self.rx_bytes.saturating_add(self.tx_bytes)
    }

    fn add(&mut self, other: ByteCounters) {
        self.rx_bytes = self.rx_bytes.saturating_add(other.rx_bytes);
        self.tx_bytes = self.tx_bytes.saturating_add(other.tx_bytes);
    }
}

/// One initiator session (I_T nexus) on a target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Daemon nexus id, if printed.
    pub nexus_id: Option<u64>,
    /// Initiator IQN, if printed.
    pub initiator: Option<String>,
    /// Remote addresses of the session's connections.
    pub remote_ips: Vec<IpAddr>,
    /// Native byte counters, if the daemon exposes them.
    pub counters: Option<ByteCounters>,
}

/// Parsed status of one registered target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetStatus {
    /// Daemon-local target id.
    pub target_id: u32,
    /// Target IQN.
    pub target_name: String,
    /// Active sessions.
    pub sessions: Vec<SessionInfo>,
    /// Backing store paths of the target's logical units.
    pub backing_stores: Vec<PathBuf>,
    /// Target-level native byte counters, if printed outside any session.
    pub counters: Option<ByteCounters>,
}

impl TargetStatus {
    /// True if at least one initiator session exists.
    pub fn is_active(&self) -> bool {
        !self.sessions.is_empty()
    }

    /// Number of initiator sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Distinct remote addresses across all sessions, in first-seen order.
    pub fn remote_ips(&self) -> Vec<IpAddr> {
        let mut ips = Vec::new();
        for ip in self.sessions.iter().flat_map(|s| s.remote_ips.iter()) {
            if !ips.contains(ip) {
                ips.push(*ip);
            }
        }
        ips
    }

    /// Native counters: target-level if present, otherwise the sum of session counters.
    pub fn native_counters(&self) -> Option<ByteCounters> {
        if let Some(counters) = self.counters {
            return Some(counters);
        }
        let mut total: Option<ByteCounters> = None;
        for counters in self.sessions.iter().filter_map(|s| s.counters) {
            total.get_or_insert_with(ByteCounters::default).add(counters);
        }
        total
    }
}

/// One established TCP connection from the host socket table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketStat {
    /// Local address.
    pub local_ip: IpAddr,
    /// Local port.
    pub local_port: u16,
    /// Peer address.
    pub remote_ip: IpAddr,
    /// Peer port.
    pub remote_port: u16,
    /// Bytes sent by the server.
    pub bytes_sent: u64,
    /// Bytes received by the server.
    pub bytes_received: u64,
}

impl SocketStat {
    /// Counters of this connection.
    pub fn counters(&self) -> ByteCounters {
        ByteCounters {
            rx_bytes: self.bytes_received,
            tx_bytes: self.bytes_sent,
        }
    }
}

fn target_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*Target\s+(\d+)\s*:\s*(\S+)").expect("static regex"))
}

fn nexus_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*I_T\s+nexus\s*:\s*(\d+)").expect("static regex"))
}

fn initiator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*Initiator\s*:\s*(\S+)").expect("static regex"))
}

fn ip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*IP\s+Address\s*:\s*\[?([0-9a-f:.%]+?)\]?\s*$").expect("static regex")
    })
}

fn backing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*Backing\s+store\s+path\s*:\s*(\S+)").expect("static regex")
    })
}

fn counter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(read|write|rx|tx|received|sent)[ _-]?bytes?\s*[:=]\s*(\d+)")
            .expect("static regex")
    })
}

fn section_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(LUN|Account|ACL|System)\s+information\s*:").expect("static regex")
    })
}

/// Parses a remote address as printed by the daemon or `ss`.
///
/// Strips brackets and zone ids, and unwraps IPv4-mapped IPv6 addresses.
pub fn parse_ip(text: &str) -> Option<IpAddr> {
    let trimmed = text.trim().trim_start_matches('[').trim_end_matches(']');
    let without_zone = trimmed.split('%').next().unwrap_or(trimmed);
    let ip: IpAddr = without_zone.parse().ok()?;
    Some(match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    })
}

fn parse_endpoint(token: &str) -> Option<(IpAddr, u16)> {
    let (host, port) = token.rsplit_once(':')?;
    let port = port.parse().ok()?;
    Some((parse_ip(host)?, port))
}

/// Parses the daemon's target listing into per-target status.
pub fn parse_target_listing(text: &str) -> Vec<TargetStatus> {
    let mut targets: Vec<TargetStatus> = Vec::new();
    let mut in_session = false;

    for line in text.lines() {
        if let Some(caps) = target_header_re().captures(line) {
            let Ok(target_id) = caps[1].parse() else {
                continue;
            };
            targets.push(TargetStatus {
                target_id,
                target_name: caps[2].to_string(),
                ..TargetStatus::default()
            });
            in_session = false;
            continue;
        }

        let Some(target) = targets.last_mut() else {
            continue;
        };

        if let Some(caps) = nexus_re().captures(line) {
            target.sessions.push(SessionInfo {
                nexus_id: caps[1].parse().ok(),
                ..SessionInfo::default()
            });
            in_session = true;
            continue;
        }

        if section_re().is_match(line) {
            in_session = false;
            continue;
        }

        if let Some(caps) = backing_re().captures(line) {
            let path = &caps[1];
            if !path.eq_ignore_ascii_case("none") {
                target.backing_stores.push(PathBuf::from(path));
            }
            continue;
        }

        if in_session {
            if let Some(caps) = initiator_re().captures(line) {
                if let Some(session) = target.sessions.last_mut() {
                    session.initiator = Some(caps[1].to_string());
                }
                continue;
            }
            if let Some(caps) = ip_re().captures(line) {
                if let (Some(session), Some(ip)) = (target.sessions.last_mut(), parse_ip(&caps[1])) {
                    if !session.remote_ips.contains(&ip) {
                        session.remote_ips.push(ip);
                    }
                }
                continue;
            }
        }

        for caps in counter_re().captures_iter(line) {
            let Ok(value) = caps[2].parse::<u64>() else {
                continue;
            };
            let slot = if in_session {
                match target.sessions.last_mut() {
                    Some(session) => session.counters.get_or_insert_with(ByteCounters::default),
                    None => target.counters.get_or_insert_with(ByteCounters::default),
                }
            } else {
                target.counters.get_or_insert_with(ByteCounters::default)
            };
            match caps[1].to_ascii_lowercase().as_str() {
                "read" | "tx" | "sent" => slot.tx_bytes = value,
                _ => slot.rx_bytes = value,
            }
        }
    }

    targets
}

/// Finds the id of the target with the given IQN in a listing.
pub fn find_target_id(text: &str, target_name: &str) -> Option<u32> {
    text.lines()
        .filter_map(|line| target_header_re().captures(line))
        .find(|caps| &caps[2] == target_name)
        .and_then(|caps| caps[1].parse().ok())
}

/// Parses `ss -tin` style output into established connections.
///
/// Connection lines are recognised by their trailing local and peer
/// endpoints; indented info lines that follow contribute byte counters.
pub fn parse_socket_table(text: &str) -> Vec<SocketStat> {
    let mut sockets: Vec<SocketStat> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let indented = line.starts_with(' ') || line.starts_with('\t');

        if !indented {
            let endpoints: Vec<(IpAddr, u16)> =
                line.split_whitespace().filter_map(parse_endpoint).collect();
            if endpoints.len() >= 2 {
                let (local_ip, local_port) = endpoints[endpoints.len() - 2];
                let (remote_ip, remote_port) = endpoints[endpoints.len() - 1];
                sockets.push(SocketStat {
                    local_ip,
                    local_port,
                    remote_ip,
                    remote_port,
                    bytes_sent: 0,
                    bytes_received: 0,
                });
            }
            continue;
        }

        let Some(socket) = sockets.last_mut() else {
            continue;
        };
        let mut acked = None;
        let mut sent = None;
        for token in line.split_whitespace() {
            let Some((key, value)) = token.split_once(':') else {
                continue;
            };
            let Ok(value) = value.parse::<u64>() else {
                continue;
            };
            match key {
                "bytes_sent" => sent = Some(value),
                "bytes_acked" => acked = Some(value),
                "bytes_received" => socket.bytes_received = value,
                _ => {}
            }
        }
        if let Some(value) = sent.or(acked) {
            socket.bytes_sent = value;
        }
    }

    sockets
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LISTING: &str = "\
Target 1: iqn.2024-01.local.netboot:disk-a
    System information:
        Driver: iscsi
        State: ready
    I_T nexus information:
        I_T nexus: 3
            Initiator: iqn.2010-04.org.ipxe:00000000-0000-0000-0000-4c4c4544 alias: none
            Connection: 0
                IP Address: 192.168.1.101
    LUN information:
        LUN: 0
            Type: controller
            Size: 0 MB, Block size: 1
            Backing store type: null
            Backing store path: None
        LUN: 1
            Type: disk
            Size: 4295 MB, Block size: 512
            Backing store type: rdwr
            Backing store path: /iscsi-images/disk-a.img
    Account information:
    ACL information:
        ALL
Target 2: iqn.2024-01.local.netboot:disk-b
    System information:
        Driver: iscsi
        State: ready
    I_T nexus information:
    LUN information:
        LUN: 1
            Type: disk
            Backing store path: /iscsi-images/disk-b.img
    Account information:
    ACL information:
        ALL
";

    #[test]
    fn test_parse_listing_targets_and_sessions() {
        let targets = parse_target_listing(LISTING);
        assert_eq!(targets.len(), 2);

        let a = &targets[0];
        assert_eq!(a.target_id, 1);
        assert_eq!(a.target_name, "iqn.2024-01.local.netboot:disk-a");
        assert!(a.is_active());
        assert_eq!(a.session_count(), 1);
        assert_eq!(a.sessions[0].nexus_id, Some(3));
        assert!(a.sessions[0]
            .initiator
            .as_deref()
            .unwrap()
            .starts_with("iqn.2010-04.org.ipxe"));
        assert_eq!(a.remote_ips(), vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 101))]);
        assert_eq!(a.backing_stores, vec![PathBuf::from("/iscsi-images/disk-a.img")]);
        assert!(a.native_counters().is_none());

        let b = &targets[1];
        assert_eq!(b.target_id, 2);
        assert!(!b.is_active());
        assert!(b.remote_ips().is_empty());
    }

    #[test]
    fn test_parse_listing_native_counters() {
        let text = "\
Target 7: iqn.x:disk-c
    I_T nexus information:
        I_T nexus: 1
            Initiator: iqn.client alias: none
            Connection: 0
                IP Address: 10.0.0.9
            Read bytes: 5000
            Write bytes: 1200
    LUN information:
";
        let targets = parse_target_listing(text);
        let counters = targets[0].native_counters().unwrap();
        assert_eq!(counters.tx_bytes, 5000);
        assert_eq!(counters.rx_bytes, 1200);
        assert_eq!(counters.total(), 6200);
    }

    #[test]
    fn test_parse_listing_target_level_counters() {
        let text = "\
Target 4: iqn.x:disk-d
    System information:
        rx_bytes=10 tx_bytes=20
";
        let targets = parse_target_listing(text);
        assert_eq!(
            targets[0].native_counters(),
            Some(ByteCounters { rx_bytes: 10, tx_bytes: 20 })
        );
    }

    #[test]
    fn test_parse_listing_tolerates_garbage() {
        assert!(parse_target_listing("").is_empty());
        assert!(parse_target_listing("tgtadm: error\n\n   junk").is_empty());
        let targets = parse_target_listing("Target x: bad\nTarget 3: iqn.ok\n");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].target_id, 3);
    }

    #[test]
    fn test_find_target_id() {
        assert_eq!(find_target_id(LISTING, "iqn.2024-01.local.netboot:disk-b"), Some(2));
        assert_eq!(find_target_id(LISTING, "iqn.2024-01.local.netboot:disk"), None);
    }

    #[test]
    fn test_parse_ip_forms() {
        assert_eq!(parse_ip("192.168.1.5"), Some("192.168.1.5".parse().unwrap()));
        assert_eq!(parse_ip("[::ffff:192.168.1.5]"), Some("192.168.1.5".parse().unwrap()));
        assert_eq!(parse_ip("fe80::1%eth0"), Some("fe80::1".parse().unwrap()));
        assert_eq!(parse_ip("not-an-ip"), None);
    }

    #[test]
    fn test_parse_socket_table() {
        let text = "\
0      0      192.168.1.50:3260      192.168.1.101:49834
\t cubic wscale:7,7 rto:204 rtt:0.3/0.1 bytes_sent:987654 bytes_acked:987000 bytes_received:4321 segs_out:100
0      0      [::ffff:192.168.1.50]:3260      [::ffff:192.168.1.102]:50000
\t cubic bytes_acked:500 bytes_received:60
";
        let sockets = parse_socket_table(text);
        assert_eq!(sockets.len(), 2);

        assert_eq!(sockets[0].local_port, 3260);
        assert_eq!(sockets[0].remote_ip, "192.168.1.101".parse::<IpAddr>().unwrap());
        assert_eq!(sockets[0].remote_port, 49834);
        assert_eq!(sockets[0].bytes_sent, 987654);
        assert_eq!(sockets[0].bytes_received, 4321);

        assert_eq!(sockets[1].remote_ip, "192.168.1.102".parse::<IpAddr>().unwrap());
        assert_eq!(sockets[1].bytes_sent, 500);
        assert_eq!(sockets[1].counters(), ByteCounters { rx_bytes: 60, tx_bytes: 500 });
    }

    #[test]
    fn test_parse_socket_table_with_state_column() {
        let text = "ESTAB 0 0 10.0.0.1:3260 10.0.0.2:40000 users:((\"tgtd\",pid=1,fd=9))\n\t bytes_sent:1 bytes_received:2\n";
        let sockets = parse_socket_table(text);
        assert_eq!(sockets.len(), 1);
        assert_eq!(sockets[0].remote_port, 40000);
        assert_eq!(sockets[0].bytes_received, 2);
    }
}
