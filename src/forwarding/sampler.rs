//! Traffic Sampler
//!
//! Attaches connection counts and cumulative byte counters to a running
//! forwarder. Sampling is best effort: a dead handle, a platform without
//! `/proc`, a permission error or a slow query all yield `None`.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::process_tree;
use super::procfs::{self, IoCounters, TCP_LISTEN};
use super::supervisor::{Liveness, ProcessHandle};

/// Traffic counters for a forwarder at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSample {
    /// Open (non-listening) TCP sockets held by the forwarder tree
    pub connections: u64,
    /// Bytes written by the tree since start
    pub bytes_sent: u64,
    /// Bytes read by the tree since start
    pub bytes_recv: u64,
    #[serde(rename = "update_time")]
    pub sampled_at: DateTime<Utc>,
}

/// Source of traffic samples
#[async_trait]
pub trait TrafficSampler: Send + Sync {
    /// Sample a live forwarder; `None` means no data is available.
    async fn sample(&self, handle: &Arc<ProcessHandle>) -> Option<TrafficSample>;
}

/// Sampler for platforms without a usable `/proc`
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSampler;

#[async_trait]
impl TrafficSampler for NullSampler {
    async fn sample(&self, _handle: &Arc<ProcessHandle>) -> Option<TrafficSample> {
        None
    }
}

/// Blocking query producing one sample
type Collector = fn(&ProcessHandle) -> io::Result<TrafficSample>;

/// Linux sampler reading `/proc` for the whole forwarder tree
#[derive(Clone)]
pub struct ProcfsSampler {
    timeout: Duration,
    collector: Collector,
}

impl ProcfsSampler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            collector: collect,
        }
    }

    #[cfg(test)]
    fn with_collector(timeout: Duration, collector: Collector) -> Self {
        Self { timeout, collector }
    }
}

impl std::fmt::Debug for ProcfsSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcfsSampler")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for ProcfsSampler {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl TrafficSampler for ProcfsSampler {
    async fn sample(&self, handle: &Arc<ProcessHandle>) -> Option<TrafficSample> {
        if handle.is_released() || handle.liveness() != Liveness::Alive {
            return None;
        }

        let handle = handle.clone();
        let pid = handle.pid();
        let collector = self.collector;
        let task = tokio::task::spawn_blocking(move || collector(&handle));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(sample))) => Some(sample),
            Ok(Ok(Err(e))) => {
                debug!("Traffic sample for pid {} unavailable: {}", pid, e);
                None
            }
            Ok(Err(e)) => {
                warn!("Traffic sampling task for pid {} failed: {}", pid, e);
                None
            }
            Err(_) => {
                warn!(
                    "Traffic sample for pid {} timed out after {:?}",
                    pid, self.timeout
                );
                None
            }
        }
    }
}

fn collect(handle: &ProcessHandle) -> io::Result<TrafficSample> {
    let root = handle.pid();
    let tree = process_tree::snapshot(root);
    if tree.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("process {} not in process table", root),
        ));
    }

    // Forked handlers share the root's network namespace
    let states = procfs::tcp_socket_states(root)?;

    let mut inodes = HashSet::new();
    let mut live = Vec::with_capacity(tree.members.len());
    for member in &tree.members {
        match procfs::socket_inodes(member.pid) {
            Ok(found) => inodes.extend(found),
            Err(e) if member.pid == root => return Err(e),
            // Handler exited mid-scan
            Err(_) => {}
        }
        match procfs::io_counters(member.pid) {
            Ok(counters) => live.push(counters),
            Err(e) if member.pid == root => return Err(e),
            Err(_) => {}
        }
    }

    let connections = inodes
        .iter()
        .filter(|inode| matches!(states.get(*inode), Some(&state) if state != TCP_LISTEN))
        .count() as u64;
    let totals = handle.ledger().lock().update(live);

    Ok(TrafficSample {
        connections,
        bytes_sent: totals.wchar,
        bytes_recv: totals.rchar,
        sampled_at: Utc::now(),
    })
}

/// Per-forwarder I/O bookkeeping.
///
/// A reaped handler's counters are added to its parent's `/proc/<pid>/io` by
/// the kernel, so the live members of the tree always account for every
/// byte the tree has moved. The sum only dips while an exited handler is a
/// zombie (its counters unreadable, not yet folded into the parent); the
/// running maximum hides that window.
#[derive(Debug, Default)]
pub struct IoLedger {
    peak: IoCounters,
}

impl IoLedger {
    /// Record the readings of the tree members seen now and return the totals.
    pub fn update(&mut self, readings: impl IntoIterator<Item = IoCounters>) -> IoCounters {
        let current = readings
            .into_iter()
            .fold(IoCounters::default(), |acc, c| IoCounters {
                rchar: acc.rchar.saturating_add(c.rchar),
                wchar: acc.wchar.saturating_add(c.wchar),
            });
        self.peak.rchar = self.peak.rchar.max(current.rchar);
        self.peak.wchar = self.peak.wchar.max(current.wchar);
        self.peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::rule::ForwardTarget;
    use crate::forwarding::test_support::{free_port, shell_supervisor};

    fn io(rchar: u64, wchar: u64) -> IoCounters {
        IoCounters { rchar, wchar }
    }

    #[test]
    fn test_ledger_sums_live_members() {
        let mut ledger = IoLedger::default();
        assert_eq!(ledger.update(vec![io(100, 50), io(30, 20)]), io(130, 70));
        assert_eq!(ledger.update(vec![io(150, 60), io(30, 25)]), io(180, 85));
    }

    #[test]
    fn test_ledger_reaped_child_not_counted_twice() {
        let mut ledger = IoLedger::default();
        // root 100, handler 40
        assert_eq!(ledger.update(vec![io(100, 10), io(40, 4)]), io(140, 14));

        // Handler is a zombie: unreadable, parent not yet credited
        assert_eq!(ledger.update(vec![io(100, 10)]), io(140, 14));

        // Reaped: the parent now carries the handler's bytes
        assert_eq!(ledger.update(vec![io(140, 14)]), io(140, 14));
        assert_eq!(ledger.update(vec![io(145, 14)]), io(145, 14));
    }

    #[test]
    fn test_sample_serializes_update_time() {
        let sample = TrafficSample {
            connections: 2,
            bytes_sent: 10,
            bytes_recv: 20,
            sampled_at: Utc::now(),
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert!(json.get("update_time").is_some());
        assert!(json.get("sampled_at").is_none());
    }

    #[tokio::test]
    async fn test_sample_dead_handle_is_none() {
        let supervisor = shell_supervisor("sleep 30");
        let target = ForwardTarget::new(free_port(), "127.0.0.1", 8080).unwrap();
        let handle = Arc::new(supervisor.start(&target).await.unwrap());
        supervisor.stop(&handle).await.unwrap();

        assert_eq!(ProcfsSampler::default().sample(&handle).await, None);
        assert_eq!(NullSampler.sample(&handle).await, None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_sample_live_process() {
        let supervisor = shell_supervisor("sleep 30");
        let target = ForwardTarget::new(free_port(), "127.0.0.1", 8080).unwrap();
        let handle = Arc::new(supervisor.start(&target).await.unwrap());

        let sample = ProcfsSampler::default().sample(&handle).await.unwrap();
        assert_eq!(sample.connections, 0);

        supervisor.stop(&handle).await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_sample_after_child_reaped_counts_bytes_once() {
        // ~1 MB read by a grandchild that finishes, then its subshell is reaped
        let supervisor = shell_supervisor(
            "( dd if=/dev/zero of=/dev/null bs=1000000 count=1 2>/dev/null; sleep 1 ); sleep 30",
        );
        let target = ForwardTarget::new(free_port(), "127.0.0.1", 8080).unwrap();
        let handle = Arc::new(supervisor.start(&target).await.unwrap());
        let sampler = ProcfsSampler::default();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let during = sampler.sample(&handle).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let after = sampler.sample(&handle).await.unwrap();

        assert!(during.bytes_recv >= 1_000_000, "{:?}", during);
        assert!(after.bytes_recv >= during.bytes_recv, "{:?} {:?}", during, after);
        assert!(after.bytes_recv < 1_500_000, "{:?}", after);

        supervisor.stop(&handle).await.unwrap();
    }

    fn slow_collector(_handle: &ProcessHandle) -> io::Result<TrafficSample> {
        std::thread::sleep(Duration::from_millis(500));
        Ok(TrafficSample {
            connections: 1,
            bytes_sent: 1,
            bytes_recv: 1,
            sampled_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_slow_query_times_out() {
        let supervisor = shell_supervisor("sleep 30");
        let target = ForwardTarget::new(free_port(), "127.0.0.1", 8080).unwrap();
        let handle = Arc::new(supervisor.start(&target).await.unwrap());

        let sampler = ProcfsSampler::with_collector(Duration::from_millis(50), slow_collector);
        let started = std::time::Instant::now();
        assert_eq!(sampler.sample(&handle).await, None);
        assert!(started.elapsed() < Duration::from_millis(400));

        // Same query within a generous bound succeeds
        let sampler = ProcfsSampler::with_collector(Duration::from_secs(2), slow_collector);
        assert!(sampler.sample(&handle).await.is_some());

        supervisor.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_timeout_is_none() {
        let supervisor = shell_supervisor("sleep 30");
        let target = ForwardTarget::new(free_port(), "127.0.0.1", 8080).unwrap();
        let handle = Arc::new(supervisor.start(&target).await.unwrap());

        assert_eq!(ProcfsSampler::new(Duration::ZERO).sample(&handle).await, None);

        supervisor.stop(&handle).await.unwrap();
    }
}
