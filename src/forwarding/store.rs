//! Forwarding Rule Store
//!
//! In-memory table of rules keyed by local port, plus one operational lock
//! per port. The table lock is only held for insert/remove/lookup; start,
//! stop and status hold the port lock instead, so a slow teardown on one
//! port never blocks another.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use super::error::MappingError;
use super::rule::ForwardingRule;

/// Default number of stopped rules kept queryable
pub const DEFAULT_MAX_STOPPED_RULES: usize = 256;

/// Held for the duration of one operation on one port
pub type PortGuard = OwnedMutexGuard<()>;

/// Port -> rule table
pub struct RuleStore {
    rules: RwLock<HashMap<u16, Arc<ForwardingRule>>>,
    /// Never pruned; bounded by the port space
    port_locks: DashMap<u16, Arc<Mutex<()>>>,
    max_stopped: usize,
}

impl RuleStore {
    pub fn new(max_stopped: usize) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            port_locks: DashMap::new(),
            max_stopped,
        }
    }

    /// Acquire the operational lock for `port`
    pub async fn lock_port(&self, port: u16) -> PortGuard {
        let lock = self
            .port_locks
            .entry(port)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Acquire the lock for `port` only if no operation holds it
    pub fn try_lock_port(&self, port: u16) -> Option<PortGuard> {
        let lock = self
            .port_locks
            .entry(port)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.try_lock_owned().ok()
    }

    pub fn get(&self, port: u16) -> Option<Arc<ForwardingRule>> {
        self.rules.read().get(&port).cloned()
    }

    /// Insert a rule. A stopped rule on the same port is replaced; a running
    /// one is a `DuplicatePort` error and stays in place.
    pub fn insert(&self, rule: Arc<ForwardingRule>) -> Result<(), MappingError> {
        let port = rule.local_port();
        let mut rules = self.rules.write();
        if let Some(existing) = rules.get(&port) {
            if existing.is_running() {
                return Err(MappingError::DuplicatePort(port));
            }
            debug!("Replacing stopped rule {} on port {}", existing.id, port);
        }
        rules.insert(port, rule);

        let evicted = evict_stopped(&mut rules, self.max_stopped);
        if !evicted.is_empty() {
            info!("Evicted {} stopped rules: {:?}", evicted.len(), evicted);
        }
        Ok(())
    }

    /// Every rule, ordered by port
    pub fn list(&self) -> Vec<Arc<ForwardingRule>> {
        let mut rules: Vec<_> = self.rules.read().values().cloned().collect();
        rules.sort_by_key(|r| r.local_port());
        rules
    }

    /// Rules currently marked running
    pub fn running(&self) -> Vec<Arc<ForwardingRule>> {
        self.list().into_iter().filter(|r| r.is_running()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Apply the retention cap now (stopped rules accumulate through stop calls
    /// as well as inserts)
    pub fn enforce_retention(&self) -> Vec<u16> {
        evict_stopped(&mut self.rules.write(), self.max_stopped)
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STOPPED_RULES)
    }
}

/// Drop the oldest stopped rules beyond `max_stopped`. Returns evicted ports.
fn evict_stopped(rules: &mut HashMap<u16, Arc<ForwardingRule>>, max_stopped: usize) -> Vec<u16> {
    let mut stopped: Vec<_> = rules
        .values()
        .filter_map(|r| r.stopped_at().map(|at| (at, r.local_port())))
        .collect();
    if stopped.len() <= max_stopped {
        return Vec::new();
    }

    stopped.sort();
    let excess = stopped.len() - max_stopped;
    stopped
        .into_iter()
        .take(excess)
        .map(|(_, port)| {
            rules.remove(&port);
            port
        })
        .collect()
}
