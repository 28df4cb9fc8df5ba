//! Forwarding rules
//!
//! A rule binds one local port to one remote `host:port`. The rule owns the
//! forwarding process while it is running; the handle is dropped from the
//! rule the moment it stops.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::MappingError;
use super::supervisor::ProcessHandle;

/// Longest hostname accepted (RFC 1035 presentation form)
const MAX_HOSTNAME_LEN: usize = 253;

/// Validated forwarding target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardTarget {
    /// Local port the forwarder listens on
    pub local_port: u16,
    /// Remote host (hostname or IP literal)
    pub remote_host: String,
    /// Remote port connections are relayed to
    pub remote_port: u16,
}

impl ForwardTarget {
    /// Validate and build a target
    pub fn new(
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Result<Self, MappingError> {
        let remote_host = normalize_host(&remote_host.into())?;
        if local_port == 0 {
            return Err(MappingError::InvalidTarget(
                "local_port must be between 1 and 65535".into(),
            ));
        }
        if remote_port == 0 {
            return Err(MappingError::InvalidTarget(
                "remote_port must be between 1 and 65535".into(),
            ));
        }
        Ok(Self {
            local_port,
            remote_host,
            remote_port,
        })
    }

    /// Host as it must appear inside a forwarder address (`[v6]` bracketed)
    pub fn address_host(&self) -> String {
        match self.remote_host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]", ip),
            _ => self.remote_host.clone(),
        }
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}:{}",
            self.local_port,
            self.address_host(),
            self.remote_port
        )
    }
}

/// Accept IP literals and plain hostnames; reject anything that could
/// smuggle extra options into a forwarder address.
fn normalize_host(raw: &str) -> Result<String, MappingError> {
    let host = raw.trim();
    if host.is_empty() {
        return Err(MappingError::InvalidTarget("remote_host is empty".into()));
    }

    let unbracketed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }

    if host.len() > MAX_HOSTNAME_LEN {
        return Err(MappingError::InvalidTarget(format!(
            "remote_host longer than {} characters",
            MAX_HOSTNAME_LEN
        )));
    }
    if host.starts_with('-') || host.starts_with('.') {
        return Err(MappingError::InvalidTarget(format!(
            "remote_host has an invalid first character: {}",
            host
        )));
    }
    if let Some(bad) = host
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(MappingError::InvalidTarget(format!(
            "remote_host contains invalid character {:?}",
            bad
        )));
    }

    Ok(host.to_ascii_lowercase())
}

/// Why a rule stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StopReason {
    /// Stopped through the control API
    Requested,
    /// Forwarder process died on its own
    Exited { code: Option<i32> },
    /// Service shutdown
    Shutdown,
}

/// Serialized state name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Running,
    Stopped,
}

/// Rule lifecycle state. The process handle only exists while running.
#[derive(Debug, Clone)]
pub enum RuleState {
    Running(Arc<ProcessHandle>),
    Stopped {
        stopped_at: DateTime<Utc>,
        reason: StopReason,
    },
}

impl RuleState {
    pub fn status(&self) -> RuleStatus {
        match self {
            RuleState::Running(_) => RuleStatus::Running,
            RuleState::Stopped { .. } => RuleStatus::Stopped,
        }
    }
}

/// A port-forwarding rule
#[derive(Debug)]
pub struct ForwardingRule {
    /// Unique identifier of this rule instance
    pub id: Uuid,
    /// What is forwarded where
    pub target: ForwardTarget,
    /// Creation time
    pub started_at: DateTime<Utc>,
    state: parking_lot::Mutex<RuleState>,
}

impl ForwardingRule {
    /// Create a running rule around a freshly started process
    pub fn running(target: ForwardTarget, handle: ProcessHandle) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            started_at: Utc::now(),
            state: parking_lot::Mutex::new(RuleState::Running(Arc::new(handle))),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.target.local_port
    }

    /// Current state (cloned out of the lock)
    pub fn state(&self) -> RuleState {
        self.state.lock().clone()
    }

    /// Process handle, if running
    pub fn process(&self) -> Option<Arc<ProcessHandle>> {
        match &*self.state.lock() {
            RuleState::Running(handle) => Some(handle.clone()),
            RuleState::Stopped { .. } => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.state.lock(), RuleState::Running(_))
    }

    /// When the rule stopped, if it has
    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        match &*self.state.lock() {
            RuleState::Running(_) => None,
            RuleState::Stopped { stopped_at, .. } => Some(*stopped_at),
        }
    }

    /// Transition to stopped, releasing the process handle.
    /// Returns false if the rule was already stopped.
    pub fn mark_stopped(&self, reason: StopReason) -> bool {
        let mut state = self.state.lock();
        if matches!(&*state, RuleState::Stopped { .. }) {
            return false;
        }
        *state = RuleState::Stopped {
            stopped_at: Utc::now(),
            reason,
        };
        true
    }
}
