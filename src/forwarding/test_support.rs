//! Shared fixtures for forwarding tests

use std::collections::HashSet;
use std::time::Duration;

use super::supervisor::{ForwarderCommand, ProcessSupervisor, SupervisorConfig};

/// Supervisor whose "forwarder" is `sh -c <script>`
pub fn shell_supervisor(script: &str) -> ProcessSupervisor {
    ProcessSupervisor::new(SupervisorConfig {
        command: ForwarderCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        },
        startup_probe: Duration::from_millis(50),
        stop_grace: Duration::from_secs(1),
    })
}

/// A port that was free a moment ago
pub fn free_port() -> u16 {
    free_ports(1)[0]
}

/// `count` distinct ports that were free a moment ago
pub fn free_ports(count: usize) -> Vec<u16> {
    let mut held = Vec::with_capacity(count);
    let mut ports = HashSet::with_capacity(count);
    while ports.len() < count {
        let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        if ports.insert(port) {
            held.push(listener);
        }
    }
    held.iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect()
}

/// Whether a real socat binary is on PATH
pub fn socat_available() -> bool {
    std::process::Command::new("socat")
        .arg("-V")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
