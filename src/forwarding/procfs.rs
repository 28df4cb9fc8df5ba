//! `/proc` readers for traffic sampling
//!
//! Three sources per process:
//! - `/proc/<pid>/fd/*` symlinks, `socket:[<inode>]` for every open socket
//! - `/proc/<pid>/net/tcp` and `tcp6`, mapping socket inodes to TCP state
//! - `/proc/<pid>/io`, cumulative `rchar` / `wchar` byte counters
//!
//! `rchar`/`wchar` include socket traffic; `read_bytes`/`write_bytes` only
//! count block-device I/O and stay at zero for a pure relay.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;

/// TCP state code for LISTEN in `/proc/net/tcp`
pub const TCP_LISTEN: u8 = 0x0A;

/// Cumulative I/O counters of one process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounters {
    /// Bytes read through read(2)-family calls, sockets included
    pub rchar: u64,
    /// Bytes written through write(2)-family calls, sockets included
    pub wchar: u64,
}

fn proc_path(pid: u32, rest: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{}/{}", pid, rest))
}

/// Inodes of every socket the process holds open
pub fn socket_inodes(pid: u32) -> io::Result<HashSet<u64>> {
    let mut inodes = HashSet::new();
    for entry in fs::read_dir(proc_path(pid, "fd"))? {
        let Ok(entry) = entry else { continue };
        // fds close underneath us all the time; skip the ones that vanished
        let Ok(target) = fs::read_link(entry.path()) else {
            continue;
        };
        if let Some(inode) = target.to_str().and_then(parse_socket_link) {
            inodes.insert(inode);
        }
    }
    Ok(inodes)
}

/// TCP socket inode -> state, from the process's network namespace view
pub fn tcp_socket_states(pid: u32) -> io::Result<HashMap<u64, u8>> {
    let mut states = parse_proc_net_tcp(&fs::read_to_string(proc_path(pid, "net/tcp"))?);
    // tcp6 is missing when IPv6 is disabled
    match fs::read_to_string(proc_path(pid, "net/tcp6")) {
        Ok(content) => states.extend(parse_proc_net_tcp(&content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(states)
}

/// Cumulative I/O counters of the process
pub fn io_counters(pid: u32) -> io::Result<IoCounters> {
    let content = fs::read_to_string(proc_path(pid, "io"))?;
    parse_proc_io(&content).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("malformed /proc/{}/io", pid))
    })
}

/// `socket:[12345]` -> 12345
fn parse_socket_link(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

/// Parse `/proc/net/tcp` or `/proc/net/tcp6` into inode -> state.
///
/// ```text
///   sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
///    0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345
/// ```
fn parse_proc_net_tcp(content: &str) -> HashMap<u64, u8> {
    let mut states = HashMap::new();
    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }
        let Ok(state) = u8::from_str_radix(parts[3], 16) else {
            continue;
        };
        let Ok(inode) = parts[9].parse::<u64>() else {
            continue;
        };
        // inode 0 marks sockets already detached from any process (TIME_WAIT)
        if inode != 0 {
            states.insert(inode, state);
        }
    }
    states
}

/// Parse `/proc/<pid>/io`
fn parse_proc_io(content: &str) -> Option<IoCounters> {
    let mut rchar = None;
    let mut wchar = None;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "rchar" => rchar = value.trim().parse().ok(),
            "wchar" => wchar = value.trim().parse().ok(),
            _ => {}
        }
    }
    Some(IoCounters {
        rchar: rchar?,
        wchar: wchar?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET_TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:2328 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 1001 1 0000000000000000 100 0 0 10 0
   1: 0100007F:2328 0100007F:C350 01 00000000:00000000 00:00000000 00000000  1000        0 1002 1 0000000000000000 20 4 30 10 -1
   2: 0100007F:C352 0100007F:1F90 01 00000000:00000000 00:00000000 00000000  1000        0 1003 1 0000000000000000 20 4 30 10 -1
   3: 0100007F:C354 0100007F:1F90 06 00000000:00000000 03:00000545 00000000     0        0 0 3 0000000000000000
";

    const PROC_IO: &str = "\
rchar: 4096
wchar: 1024
syscr: 12
syscw: 8
read_bytes: 0
write_bytes: 0
cancelled_write_bytes: 0
";

    #[test]
    fn test_parse_proc_net_tcp() {
        let states = parse_proc_net_tcp(NET_TCP);
        assert_eq!(states.len(), 3);
        assert_eq!(states[&1001], TCP_LISTEN);
        assert_eq!(states[&1002], 0x01);
        assert_eq!(states[&1003], 0x01);
    }

    #[test]
    fn test_parse_proc_net_tcp_skips_garbage() {
        let states = parse_proc_net_tcp("header\nnot a socket line\n   0: zz\n");
        assert!(states.is_empty());
    }

    #[test]
    fn test_parse_proc_io() {
        assert_eq!(
            parse_proc_io(PROC_IO),
            Some(IoCounters {
                rchar: 4096,
                wchar: 1024
            })
        );
        assert_eq!(parse_proc_io("syscr: 1\n"), None);
    }

    #[test]
    fn test_parse_socket_link() {
        assert_eq!(parse_socket_link("socket:[98765]"), Some(98765));
        assert_eq!(parse_socket_link("pipe:[98765]"), None);
        assert_eq!(parse_socket_link("/dev/null"), None);
        assert_eq!(parse_socket_link("socket:[abc]"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reads_own_process() {
        let me = std::process::id();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let inodes = socket_inodes(me).unwrap();
        let states = tcp_socket_states(me).unwrap();
        let listening = inodes
            .iter()
            .filter(|inode| states.get(*inode) == Some(&TCP_LISTEN))
            .count();
        assert!(listening >= 1);

        let counters = io_counters(me).unwrap();
        assert!(counters.rchar > 0);
        drop(listener);
    }
}
