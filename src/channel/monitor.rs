//! Connection monitoring.
//!
//! Two halves: a reader for the kernel's TCP tables (`/proc/net/tcp{,6}`)
//! used both for port-occupancy probes and for "is the peer connected"
//! checks, and a background task that polls a probe closure and flips the
//! session's `connected` flag on transitions.

use std::collections::HashSet;
use std::fs;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const TCP_TABLES: &[&str] = &["/proc/net/tcp", "/proc/net/tcp6"];

/// TCP states as encoded in `/proc/net/tcp`.
pub const TCP_ESTABLISHED: u8 = 0x01;
pub const TCP_LISTEN: u8 = 0x0A;

/// One row of a kernel TCP table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpEntry {
    pub local_port: u16,
    pub remote_port: u16,
    pub state: u8,
    pub inode: u64,
}

/// Parse the text of `/proc/net/tcp` or `/proc/net/tcp6`. Malformed rows are
/// skipped.
pub fn parse_tcp_table(text: &str) -> Vec<TcpEntry> {
    text.lines().skip(1).filter_map(parse_tcp_row).collect()
}

fn parse_tcp_row(line: &str) -> Option<TcpEntry> {
    // sl local_address rem_address st tx_queue:rx_queue tr:tm->when retrnsmt uid timeout inode
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }
    Some(TcpEntry {
        local_port: parse_endpoint_port(fields[1])?,
        remote_port: parse_endpoint_port(fields[2])?,
        state: u8::from_str_radix(fields[3], 16).ok()?,
        inode: fields[9].parse().ok()?,
    })
}

/// `0100007F:115C` -> 4444
fn parse_endpoint_port(endpoint: &str) -> Option<u16> {
    let (_, port) = endpoint.rsplit_once(':')?;
    u16::from_str_radix(port, 16).ok()
}

/// All rows of the IPv4 and IPv6 tables that could be read.
pub fn read_tcp_tables() -> Vec<TcpEntry> {
    TCP_TABLES
        .iter()
        .filter_map(|path| fs::read_to_string(path).ok())
        .flat_map(|text| parse_tcp_table(&text))
        .collect()
}

/// Socket inodes held open by `pid`, from `/proc/<pid>/fd`.
pub fn socket_inodes(pid: u32) -> HashSet<u64> {
    let Ok(entries) = fs::read_dir(format!("/proc/{pid}/fd")) else {
        return HashSet::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| fs::read_link(entry.path()).ok())
        .filter_map(|target| {
            let target = target.to_string_lossy();
            target
                .strip_prefix("socket:[")
                .and_then(|rest| rest.strip_suffix(']'))
                .and_then(|inode| inode.parse().ok())
        })
        .collect()
}

/// Whether any table shows a listener on `port`.
pub fn port_is_listening(port: u16) -> bool {
    read_tcp_tables()
        .iter()
        .any(|e| e.state == TCP_LISTEN && e.local_port == port)
}

/// Whether a bind to `port` on all interfaces currently fails.
pub fn port_bind_blocked(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_err()
}

/// Occupancy probe combining a bind test with the listen table.
pub fn port_in_use(port: u16) -> bool {
    let bind_blocked = port_bind_blocked(port);
    let listening = port_is_listening(port);
    if bind_blocked || listening {
        tracing::debug!(port, bind_blocked, listening, "port occupancy detected");
    }
    bind_blocked || listening
}

/// An accepted connection on local `port`, preferring sockets owned by
/// `pid` when its descriptors are readable.
pub fn inbound_established(entries: &[TcpEntry], port: u16, owned: &HashSet<u64>) -> bool {
    let mut candidates = entries
        .iter()
        .filter(|e| e.state == TCP_ESTABLISHED && e.local_port == port);
    if owned.is_empty() {
        candidates.next().is_some()
    } else {
        candidates.any(|e| owned.contains(&e.inode))
    }
}

/// An outbound connection to `remote_port` owned by `pid`'s sockets.
pub fn outbound_established(
    entries: &[TcpEntry],
    remote_port: u16,
    owned: &HashSet<u64>,
) -> bool {
    entries.iter().any(|e| {
        e.state == TCP_ESTABLISHED
            && e.remote_port == remote_port
            && (owned.is_empty() || owned.contains(&e.inode))
    })
}

// ---------------------------------------------------------------------------
// Monitor task
// ---------------------------------------------------------------------------

/// What one probe observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Connected,
    Disconnected,
    /// The child exited; the monitor stops.
    Gone,
}

/// Poll cadence before and after the first connection.
#[derive(Debug, Clone, Copy)]
pub struct MonitorCadence {
    pub until_connected: Duration,
    pub while_connected: Duration,
}

impl MonitorCadence {
    pub fn uniform(every: Duration) -> Self {
        Self {
            until_connected: every,
            while_connected: every,
        }
    }
}

/// Handle to a running monitor task.
#[derive(Debug)]
pub struct MonitorHandle {
    stop: watch::Sender<bool>,
    active: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Ask the task to finish and wait for it briefly.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let mut task = self.task;
        if tokio::time::timeout(Duration::from_secs(2), &mut task)
            .await
            .is_err()
        {
            task.abort();
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Start polling `probe` and mirror its result into `connected`.
pub fn spawn_monitor<P>(
    label: String,
    connected: Arc<AtomicBool>,
    cadence: MonitorCadence,
    probe: P,
) -> MonitorHandle
where
    P: Fn() -> Probe + Send + 'static,
{
    let (stop, mut stop_rx) = watch::channel(false);
    let active = Arc::new(AtomicBool::new(true));
    let task_active = Arc::clone(&active);
    let task = tokio::spawn(async move {
        let mut ever_connected = connected.load(Ordering::SeqCst);
        loop {
            let every = if ever_connected {
                cadence.while_connected
            } else {
                cadence.until_connected
            };
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(every) => {}
            }
            let observed = probe();
            let was = connected.load(Ordering::SeqCst);
            match observed {
                Probe::Connected => {
                    ever_connected = true;
                    if !was {
                        tracing::info!(session = %label, "peer connected");
                        connected.store(true, Ordering::SeqCst);
                    }
                }
                Probe::Disconnected => {
                    if was {
                        tracing::warn!(session = %label, "peer disconnected");
                        connected.store(false, Ordering::SeqCst);
                    }
                }
                Probe::Gone => {
                    if was {
                        tracing::warn!(session = %label, "session process exited");
                    }
                    connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
        task_active.store(false, Ordering::SeqCst);
        tracing::debug!(session = %label, "monitor finished");
    });
    MonitorHandle { stop, active, task }
}
