//! Port Forwarding Module
//!
//! Supervises one external forwarder process (socat by default) per local
//! port and reports its liveness and traffic.

pub mod error;
pub mod manager;
pub mod process_tree;
mod procfs;
pub mod rule;
pub mod sampler;
pub mod store;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{MappingError, SpawnError, StopError};
pub use manager::{ForwardingManager, StatusView};
pub use rule::{ForwardTarget, ForwardingRule, RuleState, RuleStatus, StopReason};
pub use sampler::{NullSampler, ProcfsSampler, TrafficSample, TrafficSampler};
pub use store::{RuleStore, DEFAULT_MAX_STOPPED_RULES};
pub use supervisor::{
    ForwarderCommand, Liveness, ProcessHandle, ProcessSupervisor, StopOutcome, SupervisorConfig,
};
