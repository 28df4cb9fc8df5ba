//! Process tree inspection and signalling
//!
//! The forwarder forks one child per accepted connection, so tearing it down
//! means walking the whole descendant tree. Enumeration goes through the
//! `sysinfo` process table; signals go through `nix` on Unix.
//!
//! Everything here is blocking and is expected to run under
//! `tokio::task::spawn_blocking`.

use std::collections::{HashMap, HashSet, VecDeque};

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// One member of a process tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeMember {
    pub pid: u32,
    /// Distance from the root (root = 0)
    pub depth: usize,
    /// Process start time in seconds since boot; disambiguates reused pids
    pub start_time: u64,
}

/// Snapshot of a process and all of its descendants
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessTree {
    /// Members ordered deepest-first; the root, when present, is last
    pub members: Vec<TreeMember>,
}

impl ProcessTree {
    /// Members other than the root, deepest-first
    pub fn descendants(&self) -> impl Iterator<Item = &TreeMember> {
        self.members.iter().filter(|m| m.depth > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Take a snapshot of `root` and its descendants from the OS process table.
pub fn snapshot(root: u32) -> ProcessTree {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut start_times = HashMap::new();
    let mut edges = Vec::new();
    for (pid, process) in system.processes() {
        // Linux exposes threads in the table too; only real processes matter.
        if process.thread_kind().is_some() {
            continue;
        }
        start_times.insert(pid.as_u32(), process.start_time());
        if let Some(parent) = process.parent() {
            edges.push((parent.as_u32(), pid.as_u32()));
        }
    }

    if !start_times.contains_key(&root) {
        return ProcessTree::default();
    }

    let members = deepest_first(root, &edges)
        .into_iter()
        .map(|(pid, depth)| TreeMember {
            pid,
            depth,
            start_time: start_times.get(&pid).copied().unwrap_or(0),
        })
        .collect();
    ProcessTree { members }
}

/// Whether `member` is still the same live process: the pid exists, is not
/// a zombie, and has the start time recorded in the snapshot.
pub fn still_running(member: &TreeMember) -> bool {
    let mut system = System::new();
    let pid = Pid::from_u32(member.pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    match system.process(pid) {
        Some(process) => {
            process.start_time() == member.start_time && process.status() != ProcessStatus::Zombie
        }
        None => false,
    }
}

/// Breadth-first walk from `root` over `(parent, child)` edges, returned
/// deepest level first so children are always handled before their parent.
fn deepest_first(root: u32, edges: &[(u32, u32)]) -> Vec<(u32, usize)> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(parent, child) in edges {
        children.entry(parent).or_default().push(child);
    }

    let mut seen = HashSet::from([root]);
    let mut order = vec![(root, 0usize)];
    let mut queue = VecDeque::from([(root, 0usize)]);
    while let Some((pid, depth)) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if seen.insert(kid) {
                    order.push((kid, depth + 1));
                    queue.push_back((kid, depth + 1));
                }
            }
        }
    }

    // BFS order is shallow-to-deep; reversing puts leaves first, root last
    order.reverse();
    order
}

/// Signals used during teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSignal {
    Terminate,
    Kill,
}

/// Result of a successful signal delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Target no longer exists
    Gone,
}

#[cfg(unix)]
mod imp {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    use super::{Delivery, TreeSignal};

    fn to_nix(signal: TreeSignal) -> Signal {
        match signal {
            TreeSignal::Terminate => Signal::SIGTERM,
            TreeSignal::Kill => Signal::SIGKILL,
        }
    }

    fn classify(result: nix::Result<()>) -> Result<Delivery, String> {
        match result {
            Ok(()) => Ok(Delivery::Delivered),
            Err(Errno::ESRCH) => Ok(Delivery::Gone),
            Err(e) => Err(e.desc().to_string()),
        }
    }

    pub fn signal_process(pid: u32, signal: TreeSignal) -> Result<Delivery, String> {
        classify(kill(Pid::from_raw(pid as i32), to_nix(signal)))
    }

    pub fn signal_group(pgid: u32, signal: TreeSignal) -> Result<Delivery, String> {
        classify(killpg(Pid::from_raw(pgid as i32), to_nix(signal)))
    }
}

#[cfg(not(unix))]
mod imp {
    use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

    use super::{Delivery, TreeSignal};

    pub fn signal_process(pid: u32, signal: TreeSignal) -> Result<Delivery, String> {
        let mut system = System::new();
        let target = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        let Some(process) = system.process(target) else {
            return Ok(Delivery::Gone);
        };
        let delivered = match signal {
            TreeSignal::Terminate => process.kill_with(Signal::Term).unwrap_or(false),
            TreeSignal::Kill => process.kill(),
        };
        if delivered {
            Ok(Delivery::Delivered)
        } else {
            Err(format!("signal {:?} not delivered", signal))
        }
    }

    pub fn signal_group(pgid: u32, signal: TreeSignal) -> Result<Delivery, String> {
        // No process groups here; fall back to the leader itself
        signal_process(pgid, signal)
    }
}

pub use imp::{signal_group, signal_process};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deepest_first_orders_leaves_before_root() {
        // 1 -> {2, 3}, 2 -> {4}, 4 -> {5}, unrelated 9 -> {10}
        let edges = [(1, 2), (1, 3), (2, 4), (4, 5), (9, 10)];
        let order = deepest_first(1, &edges);

        assert_eq!(order.last(), Some(&(1, 0)));
        assert_eq!(order.first(), Some(&(5, 3)));
        let pids: Vec<u32> = order.iter().map(|(p, _)| *p).collect();
        assert_eq!(pids.len(), 5);
        assert!(!pids.contains(&9));
        assert!(!pids.contains(&10));

        let pos = |p: u32| pids.iter().position(|x| *x == p).unwrap();
        assert!(pos(4) < pos(2));
        assert!(pos(2) < pos(1));
        assert!(pos(3) < pos(1));
    }

    #[test]
    fn test_deepest_first_survives_cycles() {
        let edges = [(1, 2), (2, 1)];
        let order = deepest_first(1, &edges);
        assert_eq!(order, vec![(2, 1), (1, 0)]);
    }

    #[test]
    fn test_snapshot_of_missing_process_is_empty() {
        // pid_max on Linux tops out well below this
        assert!(snapshot(u32::MAX - 1).is_empty());
    }

    #[test]
    fn test_snapshot_includes_current_process() {
        let me = std::process::id();
        let tree = snapshot(me);
        let root = tree.members.last().unwrap();
        assert_eq!(root.pid, me);
        assert_eq!(root.depth, 0);
        assert!(still_running(root));
    }

    #[test]
    fn test_recycled_pid_is_not_running() {
        let me = std::process::id();
        let root = *snapshot(me).members.last().unwrap();
        let recycled = TreeMember {
            start_time: root.start_time + 1000,
            ..root
        };
        assert!(!still_running(&recycled));
    }

    #[cfg(unix)]
    #[test]
    fn test_zombie_is_not_running() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        // Exited but not yet waited for
        std::thread::sleep(std::time::Duration::from_millis(300));

        let member = snapshot(std::process::id())
            .members
            .into_iter()
            .find(|m| m.pid == pid)
            .unwrap();
        assert_eq!(member.depth, 1);
        assert!(!still_running(&member));

        child.wait().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_missing_process_is_gone() {
        assert_eq!(
            signal_process(i32::MAX as u32, TreeSignal::Terminate),
            Ok(Delivery::Gone)
        );
    }
}
