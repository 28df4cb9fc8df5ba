//! Port Forwarding Manager
//!
//! Composes the rule store, the process supervisor and the traffic sampler
//! into the operations the control API exposes. Every operation on a port
//! runs under that port's lock; operations on different ports never wait on
//! each other.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::MappingError;
use super::rule::{ForwardTarget, ForwardingRule, RuleState, RuleStatus, StopReason};
use super::sampler::{TrafficSample, TrafficSampler};
use super::store::RuleStore;
use super::supervisor::{ProcessSupervisor, StopOutcome};

/// Status of one mapping as reported to clients
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub id: Uuid,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub status: RuleStatus,
    /// Liveness as observed from the OS at the time of the request
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic: Option<TrafficSample>,
}

impl StatusView {
    fn new(rule: &ForwardingRule, alive: bool, traffic: Option<TrafficSample>) -> Self {
        let (pid, stopped_at, stop_reason) = match rule.state() {
            RuleState::Running(handle) => (Some(handle.pid()), None, None),
            RuleState::Stopped { stopped_at, reason } => (None, Some(stopped_at), Some(reason)),
        };
        Self {
            id: rule.id,
            local_port: rule.target.local_port,
            remote_host: rule.target.remote_host.clone(),
            remote_port: rule.target.remote_port,
            status: rule.state().status(),
            alive,
            pid,
            start_time: rule.started_at,
            stopped_at,
            stop_reason,
            traffic,
        }
    }
}

/// Port forwarding manager
pub struct ForwardingManager {
    store: Arc<RuleStore>,
    supervisor: ProcessSupervisor,
    sampler: Arc<dyn TrafficSampler>,
}

impl ForwardingManager {
    pub fn new(
        store: Arc<RuleStore>,
        supervisor: ProcessSupervisor,
        sampler: Arc<dyn TrafficSampler>,
    ) -> Self {
        Self {
            store,
            supervisor,
            sampler,
        }
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Create a mapping and start its forwarder
    pub async fn create_mapping(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<StatusView, MappingError> {
        let target = ForwardTarget::new(local_port, remote_host, remote_port)?;
        let _guard = self.store.lock_port(local_port).await;

        if let Some(existing) = self.store.get(local_port) {
            if self.refresh_liveness(&existing).await {
                return Err(MappingError::DuplicatePort(local_port));
            }
        }

        info!("Creating mapping {}", target);
        let handle = self.supervisor.start(&target).await?;
        let rule = Arc::new(ForwardingRule::running(target, handle));

        if let Err(e) = self.store.insert(rule.clone()) {
            // Unreachable under the port lock, but never leave an orphan behind
            if let Some(handle) = rule.process() {
                let _ = self.supervisor.stop(&handle).await;
            }
            rule.mark_stopped(StopReason::Shutdown);
            return Err(e);
        }

        info!("Mapping created: {} ({})", rule.target, rule.id);
        Ok(StatusView::new(&rule, true, None))
    }

    /// Stop a mapping's forwarder. Stopping a stopped mapping is a no-op.
    pub async fn stop_mapping(&self, local_port: u16) -> Result<StopOutcome, MappingError> {
        let _guard = self.store.lock_port(local_port).await;
        let rule = self
            .store
            .get(local_port)
            .ok_or(MappingError::NotFound(local_port))?;

        let Some(handle) = rule.process() else {
            return Ok(StopOutcome::AlreadyStopped);
        };

        let outcome = self.supervisor.stop(&handle).await.map_err(|e| {
            warn!("Failed to stop mapping on port {}: {}", local_port, e);
            e
        })?;
        let reason = match outcome {
            StopOutcome::AlreadyExited { code } => StopReason::Exited { code },
            _ => StopReason::Requested,
        };
        rule.mark_stopped(reason);
        self.store.enforce_retention();

        info!("Mapping on port {} stopped", local_port);
        Ok(outcome)
    }

    /// Status of one mapping with liveness re-derived from the OS and,
    /// while alive, a fresh traffic sample.
    pub async fn get_status(&self, local_port: u16) -> Result<StatusView, MappingError> {
        let _guard = self.store.lock_port(local_port).await;
        let rule = self
            .store
            .get(local_port)
            .ok_or(MappingError::NotFound(local_port))?;

        let alive = self.refresh_liveness(&rule).await;
        let traffic = match rule.process() {
            Some(handle) if alive => self.sampler.sample(&handle).await,
            _ => None,
        };
        Ok(StatusView::new(&rule, alive, traffic))
    }

    /// Every mapping, ordered by port, without traffic samples. A port busy
    /// with another operation is reported in its last known state.
    pub async fn list_mappings(&self) -> Vec<StatusView> {
        let mut views = Vec::new();
        for listed in self.store.list() {
            let port = listed.local_port();
            let view = match self.store.try_lock_port(port) {
                Some(_guard) => {
                    // Replaced or evicted since the listing
                    let Some(rule) = self.store.get(port) else {
                        continue;
                    };
                    let alive = self.refresh_liveness(&rule).await;
                    StatusView::new(&rule, alive, None)
                }
                None => {
                    debug!("Port {} busy, listing last known state", port);
                    StatusView::new(&listed, listed.is_running(), None)
                }
            };
            views.push(view);
        }
        views
    }

    /// Stop every running mapping. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let running = self.store.running();
        info!("Stopping all {} running mappings", running.len());

        let mut stopped = 0;
        for rule in running {
            let _guard = self.store.lock_port(rule.local_port()).await;
            let Some(handle) = rule.process() else {
                continue;
            };
            match self.supervisor.stop(&handle).await {
                Ok(_) => {
                    rule.mark_stopped(StopReason::Shutdown);
                    self.store.enforce_retention();
                    stopped += 1;
                }
                Err(e) => warn!("Failed to stop mapping on port {}: {}", rule.local_port(), e),
            }
        }
        stopped
    }

    /// Re-derive liveness from the OS. A forwarder found dead is reaped and
    /// its rule moves to stopped. Caller holds the port lock.
    async fn refresh_liveness(&self, rule: &ForwardingRule) -> bool {
        let Some(handle) = rule.process() else {
            return false;
        };
        if self.supervisor.is_alive(&handle) {
            return true;
        }

        let code = match self.supervisor.stop(&handle).await {
            Ok(StopOutcome::AlreadyExited { code }) => code,
            Ok(_) => None,
            Err(e) => {
                warn!("Failed to reap forwarder {}: {}", handle.pid(), e);
                None
            }
        };
        warn!(
            "Forwarder for port {} died unexpectedly (exit code {:?})",
            rule.local_port(),
            code
        );
        rule.mark_stopped(StopReason::Exited { code });
        self.store.enforce_retention();
        false
    }
}
