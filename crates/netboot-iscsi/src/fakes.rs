//! In-memory stand-in for `tgtd`/`tgtadm` and the host socket table.
//!
//! [`FakeTargetDaemon`] implements [`CommandRunner`], keeps a target table,
//! and answers `show` and `ss` queries in the same text formats the real
//! tools print, so the parsers are exercised end to end. Failures and
//! timeouts can be injected per operation and per target name.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::parse::ByteCounters;
use crate::runner::{command_line, CommandOutput, CommandRunner, ProcessError};

/// Operations that can be targeted by failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeOp {
    /// `--mode target --op new`
    NewTarget,
    /// `--mode logicalunit --op new`
    NewLogicalUnit,
    /// `--mode target --op bind`
    Bind,
    /// `--mode target --op delete`
    Delete,
    /// `--mode target --op show`
    Show,
    /// `ss`
    SocketTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Fail,
    Timeout,
}

#[derive(Debug, Clone)]
struct Injection {
    op: FakeOp,
    target_name: Option<String>,
    fault: Fault,
}

#[derive(Debug, Clone)]
struct FakeTarget {
    name: String,
    backing: Option<PathBuf>,
    device_type: String,
    bound: bool,
    sessions: Vec<(u64, IpAddr)>,
    counters: Option<ByteCounters>,
}

#[derive(Debug, Clone)]
struct FakeSocket {
    local_port: u16,
    remote_ip: IpAddr,
    remote_port: u16,
    bytes_sent: u64,
    bytes_received: u64,
}

#[derive(Debug, Default)]
struct State {
    targets: BTreeMap<u32, FakeTarget>,
    sockets: Vec<FakeSocket>,
    injections: Vec<Injection>,
    calls: Vec<String>,
    next_nexus: u64,
    next_port: u16,
}

/// Scripted target daemon and socket table.
#[derive(Debug, Default)]
pub struct FakeTargetDaemon {
    state: Mutex<State>,
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn failure(command: String, stderr: &str) -> ProcessError {
    ProcessError::Failed {
        command,
        status: Some(22),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn endpoint(ip: &IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}:{}", v4, port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    }
}

impl FakeTargetDaemon {
    /// Empty daemon with no targets or sockets.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts a bound target directly, as if left over from an earlier run.
    pub fn preload_target(&self, target_id: u32, name: &str, backing: &str) {
        self.state().targets.insert(
            target_id,
            FakeTarget {
                name: name.to_string(),
                backing: Some(PathBuf::from(backing)),
                device_type: "disk".to_string(),
                bound: true,
                sessions: Vec::new(),
                counters: None,
            },
        );
    }

    /// Fails the next matching operation with a non-zero exit.
    pub fn fail_next(&self, op: FakeOp, target_name: Option<&str>) {
        self.state().injections.push(Injection {
            op,
            target_name: target_name.map(str::to_string),
            fault: Fault::Fail,
        });
    }

    /// Times out the next matching operation.
    pub fn timeout_next(&self, op: FakeOp) {
        self.state().injections.push(Injection {
            op,
            target_name: None,
            fault: Fault::Timeout,
        });
    }

    /// Adds an initiator session from `ip`; returns false if the target is unknown.
    pub fn add_session(&self, target_name: &str, ip: &str) -> bool {
        let Ok(ip) = ip.parse::<IpAddr>() else {
            return false;
        };
        let mut state = self.state();
        state.next_nexus += 1;
        let nexus = state.next_nexus;
        match state.targets.values_mut().find(|t| t.name == target_name) {
            Some(target) => {
                target.sessions.push((nexus, ip));
                true
            }
            None => false,
        }
    }

    /// Drops every session of a target.
    pub fn clear_sessions(&self, target_name: &str) {
        if let Some(target) = self
            .state()
            .targets
            .values_mut()
            .find(|t| t.name == target_name)
        {
            target.sessions.clear();
        }
    }

    /// Makes `show` print native counters for the target.
    pub fn set_target_counters(&self, target_name: &str, rx_bytes: u64, tx_bytes: u64) {
        if let Some(target) = self
            .state()
            .targets
            .values_mut()
            .find(|t| t.name == target_name)
        {
            target.counters = Some(ByteCounters { rx_bytes, tx_bytes });
        }
    }

    /// Adds an established connection on port 3260.
    pub fn add_socket(&self, remote_ip: &str, bytes_sent: u64, bytes_received: u64) {
        self.add_socket_on_port(3260, remote_ip, bytes_sent, bytes_received);
    }

    /// Adds an established connection on an arbitrary local port.
    pub fn add_socket_on_port(
        &self,
        local_port: u16,
        remote_ip: &str,
        bytes_sent: u64,
        bytes_received: u64,
    ) {
        let Ok(remote_ip) = remote_ip.parse::<IpAddr>() else {
            return;
        };
        let mut state = self.state();
        state.next_port += 1;
        let remote_port = 40000 + state.next_port;
        state.sockets.push(FakeSocket {
            local_port,
            remote_ip,
            remote_port,
            bytes_sent,
            bytes_received,
        });
    }

    /// Updates the counters of every connection from `remote_ip`.
    pub fn set_socket_bytes(&self, remote_ip: &str, bytes_sent: u64, bytes_received: u64) {
        let Ok(remote_ip) = remote_ip.parse::<IpAddr>() else {
            return;
        };
        for socket in self
            .state()
            .sockets
            .iter_mut()
            .filter(|s| s.remote_ip == remote_ip)
        {
            socket.bytes_sent = bytes_sent;
            socket.bytes_received = bytes_received;
        }
    }

    /// Removes all connections.
    pub fn clear_sockets(&self) {
        self.state().sockets.clear();
    }

    /// Forgets every target, as a daemon restart would.
    pub fn clear_targets(&self) {
        self.state().targets.clear();
    }

    /// Number of registered targets.
    pub fn target_count(&self) -> usize {
        self.state().targets.len()
    }

    /// Live id of a target by name.
    pub fn target_id(&self, target_name: &str) -> Option<u32> {
        self.state()
            .targets
            .iter()
            .find(|(_, t)| t.name == target_name)
            .map(|(id, _)| *id)
    }

    /// Names of all registered targets, by id.
    pub fn target_names(&self) -> Vec<String> {
        self.state().targets.values().map(|t| t.name.clone()).collect()
    }

    /// True if the target exists and accepts initiators.
    pub fn is_bound(&self, target_name: &str) -> bool {
        self.state()
            .targets
            .values()
            .any(|t| t.name == target_name && t.bound)
    }

    /// Backing file of a target's LUN 1.
    pub fn backing_store(&self, target_name: &str) -> Option<PathBuf> {
        self.state()
            .targets
            .values()
            .find(|t| t.name == target_name)
            .and_then(|t| t.backing.clone())
    }

    /// Command lines received so far.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn take_injection(state: &mut State, op: FakeOp, target_name: Option<&str>) -> Option<Fault> {
        let index = state.injections.iter().position(|inj| {
            inj.op == op
                && match (&inj.target_name, target_name) {
                    (None, _) => true,
                    (Some(want), Some(got)) => want == got,
                    (Some(_), None) => false,
                }
        })?;
        Some(state.injections.remove(index).fault)
    }

    fn render_listing(state: &State) -> String {
        let mut out = String::new();
        for (id, target) in &state.targets {
            out.push_str(&format!("Target {}: {}\n", id, target.name));
            out.push_str("    System information:\n");
            out.push_str("        Driver: iscsi\n");
            out.push_str("        State: ready\n");
            if let Some(counters) = target.counters {
                out.push_str(&format!("        Read bytes: {}\n", counters.tx_bytes));
                out.push_str(&format!("        Write bytes: {}\n", counters.rx_bytes));
            }
            out.push_str("    I_T nexus information:\n");
            for (nexus, ip) in &target.sessions {
                out.push_str(&format!("        I_T nexus: {}\n", nexus));
                out.push_str(&format!(
                    "            Initiator: iqn.2010-04.org.ipxe:{:08x} alias: none\n",
                    nexus
                ));
                out.push_str("            Connection: 0\n");
                out.push_str(&format!("                IP Address: {}\n", ip));
            }
            out.push_str("    LUN information:\n");
            out.push_str("        LUN: 0\n");
            out.push_str("            Type: controller\n");
            out.push_str("            Backing store path: None\n");
            if let Some(backing) = &target.backing {
                out.push_str("        LUN: 1\n");
                out.push_str(&format!("            Type: {}\n", target.device_type));
                out.push_str(&format!(
                    "            Backing store path: {}\n",
                    backing.display()
                ));
            }
            out.push_str("    Account information:\n");
            out.push_str("    ACL information:\n");
            if target.bound {
                out.push_str("        ALL\n");
            }
        }
        out
    }

    fn render_sockets(state: &State) -> String {
        let local: IpAddr = IpAddr::from([192, 168, 1, 50]);
        let mut out = String::new();
        for socket in &state.sockets {
            out.push_str(&format!(
                "0      0      {}      {}\n",
                endpoint(&local, socket.local_port),
                endpoint(&socket.remote_ip, socket.remote_port)
            ));
            out.push_str(&format!(
                "\t cubic wscale:7,7 rto:204 bytes_sent:{} bytes_acked:{} bytes_received:{}\n",
                socket.bytes_sent, socket.bytes_sent, socket.bytes_received
            ));
        }
        out
    }
}

#[async_trait]
impl CommandRunner for FakeTargetDaemon {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, ProcessError> {
        // Let concurrent callers interleave the way real processes would.
        tokio::task::yield_now().await;

        let command = command_line(program, args);
        let mut state = self.state();
        state.calls.push(command.clone());

        if !args.iter().any(|a| a == "--lld") {
            if let Some(fault) = Self::take_injection(&mut state, FakeOp::SocketTable, None) {
                return Err(match fault {
                    Fault::Fail => failure(command, "ss: injected failure"),
                    Fault::Timeout => ProcessError::Timeout { command, timeout },
                });
            }
            return Ok(CommandOutput::ok(Self::render_sockets(&state)));
        }

        let mode = flag(args, "--mode").unwrap_or_default();
        let op = match (mode, flag(args, "--op").unwrap_or_default()) {
            ("target", "new") => FakeOp::NewTarget,
            ("logicalunit", "new") => FakeOp::NewLogicalUnit,
            ("target", "bind") => FakeOp::Bind,
            ("target", "delete") => FakeOp::Delete,
            ("target", "show") => FakeOp::Show,
            _ => return Err(failure(command, "tgtadm: unsupported operation")),
        };
        let tid: Option<u32> = flag(args, "--tid").and_then(|t| t.parse().ok());
        let subject = match op {
            FakeOp::NewTarget => flag(args, "--targetname").map(str::to_string),
            _ => tid.and_then(|id| state.targets.get(&id).map(|t| t.name.clone())),
        };

        if let Some(fault) = Self::take_injection(&mut state, op, subject.as_deref()) {
            return Err(match fault {
                Fault::Fail => failure(command, "tgtadm: injected failure"),
                Fault::Timeout => ProcessError::Timeout { command, timeout },
            });
        }

        match op {
            FakeOp::Show => Ok(CommandOutput::ok(Self::render_listing(&state))),
            FakeOp::NewTarget => {
                let (Some(id), Some(name)) = (tid, subject) else {
                    return Err(failure(command, "tgtadm: missing tid or targetname"));
                };
                if state.targets.contains_key(&id) {
                    return Err(failure(command, "tgtadm: this target already exists"));
                }
                if state.targets.values().any(|t| t.name == name) {
                    return Err(failure(command, "tgtadm: target name already exists"));
                }
                state.targets.insert(
                    id,
                    FakeTarget {
                        name,
                        backing: None,
                        device_type: "disk".to_string(),
                        bound: false,
                        sessions: Vec::new(),
                        counters: None,
                    },
                );
                Ok(CommandOutput::ok(""))
            }
            FakeOp::NewLogicalUnit => {
                let backing = flag(args, "--backing-store").map(PathBuf::from);
                let device_type = flag(args, "--device-type").unwrap_or("disk").to_string();
                match tid.and_then(|id| state.targets.get_mut(&id)) {
                    Some(target) => {
                        target.backing = backing;
                        target.device_type = device_type;
                        Ok(CommandOutput::ok(""))
                    }
                    None => Err(failure(command, "tgtadm: can't find the target")),
                }
            }
            FakeOp::Bind => match tid.and_then(|id| state.targets.get_mut(&id)) {
                Some(target) => {
                    target.bound = true;
                    Ok(CommandOutput::ok(""))
                }
                None => Err(failure(command, "tgtadm: can't find the target")),
            },
            FakeOp::Delete => match tid.and_then(|id| state.targets.remove(&id)) {
                Some(_) => Ok(CommandOutput::ok("")),
                None => Err(failure(command, "tgtadm: can't find the target")),
            },
            FakeOp::SocketTable => Ok(CommandOutput::ok(Self::render_sockets(&state))),
        }
    }
}
