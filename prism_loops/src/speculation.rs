//! Speculation log.
//!
//! Optimistic transformations (loop predication, guard hoisting, overflow
//! guards) register the assumption they make in the log and embed the
//! returned token in the guard that checks it. When such a guard fails at
//! run time the runtime records the failure against the token; the next
//! compilation of the same method then sees `may_speculate == false` for
//! that key and leaves the code alone.
//!
//! # Concurrency
//!
//! A log is shared by every compilation of one method, possibly on
//! different compiler threads. Queries take a read lock; registrations and
//! failure records are serialized behind the write lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use log::debug;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::deopt::{MethodId, SpeculationReason, SpeculationToken};

// =============================================================================
// Speculation Log
// =============================================================================

#[derive(Debug, Default)]
struct LogState {
    /// Keys that failed in an earlier run.
    failed: FxHashSet<SpeculationReason>,
    /// Keys registered by any compilation, with their token id.
    registered: FxHashMap<SpeculationReason, u32>,
}

/// Append-only record of speculations for one method.
#[derive(Debug)]
pub struct SpeculationLog {
    method: MethodId,
    state: RwLock<LogState>,
    next_id: AtomicU32,
}

impl SpeculationLog {
    /// Empty log for `method`.
    pub fn new(method: MethodId) -> Self {
        SpeculationLog {
            method,
            state: RwLock::new(LogState::default()),
            next_id: AtomicU32::new(0),
        }
    }

    /// Method this log belongs to.
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Whether speculating on `reason` is still allowed.
    pub fn may_speculate(&self, reason: &SpeculationReason) -> bool {
        !self.state.read().failed.contains(reason)
    }

    /// Register a speculation and return the token to embed in its guard.
    ///
    /// Registering the same key twice returns the same token.
    pub fn speculate(&self, reason: SpeculationReason) -> SpeculationToken {
        let mut state = self.state.write();
        let id = *state
            .registered
            .entry(reason)
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::Relaxed));
        SpeculationToken { id, reason }
    }

    /// Whether `reason` was registered by some compilation.
    pub fn contains(&self, reason: &SpeculationReason) -> bool {
        self.state.read().registered.contains_key(reason)
    }

    /// Record that the guard carrying `token` failed.
    pub fn record_failure(&self, token: &SpeculationToken) {
        debug!("speculation {} failed", token.reason);
        self.state.write().failed.insert(token.reason);
    }

    /// Number of registered speculations.
    pub fn len(&self) -> usize {
        self.state.read().registered.len()
    }

    /// Whether nothing was registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered keys, sorted.
    pub fn registered(&self) -> Vec<SpeculationReason> {
        let mut keys: Vec<_> = self.state.read().registered.keys().copied().collect();
        keys.sort();
        keys
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Process-wide map from method to its speculation log.
///
/// Recompilations look up the existing log so failures persist.
#[derive(Debug, Default)]
pub struct SpeculationLogRegistry {
    logs: DashMap<MethodId, Arc<SpeculationLog>>,
}

impl SpeculationLogRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Log of `method`, created on first use.
    pub fn log_for(&self, method: MethodId) -> Arc<SpeculationLog> {
        self.logs
            .entry(method)
            .or_insert_with(|| Arc::new(SpeculationLog::new(method)))
            .clone()
    }

    /// Drop the log of `method`, e.g. when its code is unloaded.
    pub fn forget(&self, method: MethodId) -> bool {
        self.logs.remove(&method).is_some()
    }

    /// Number of methods with a log.
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    /// Whether no log exists.
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::deopt::{DeoptimizationReason, SpeculationGroup};
    use std::thread;

    fn key(bci: u32) -> SpeculationReason {
        SpeculationReason::new(
            SpeculationGroup::LoopPredication,
            MethodId(7),
            bci,
            DeoptimizationReason::BoundsCheckException,
        )
    }

    #[test]
    fn test_failure_blocks_future_speculation() {
        let log = SpeculationLog::new(MethodId(7));
        assert!(log.may_speculate(&key(3)));
        let token = log.speculate(key(3));
        assert!(log.contains(&key(3)));

        log.record_failure(&token);
        assert!(!log.may_speculate(&key(3)));
        assert!(log.may_speculate(&key(4)));
    }

    #[test]
    fn test_same_key_same_token() {
        let log = SpeculationLog::new(MethodId(7));
        let a = log.speculate(key(1));
        let b = log.speculate(key(1));
        let c = log.speculate(key(2));
        assert_eq!(a, b);
        assert_ne!(a.id, c.id);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_registry_shares_logs() {
        let registry = SpeculationLogRegistry::new();
        let first = registry.log_for(MethodId(1));
        first.record_failure(&first.speculate(key(9)));
        let again = registry.log_for(MethodId(1));
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registry.len(), 1);
        assert!(registry.forget(MethodId(1)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_registration() {
        let log = Arc::new(SpeculationLog::new(MethodId(7)));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for bci in 0..50 {
                        log.speculate(key(bci));
                        assert!(log.may_speculate(&key(1000 + t)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(log.len(), 50);
        let mut ids: Vec<u32> = log
            .registered()
            .iter()
            .map(|k| log.speculate(*k).id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 50);
    }
}
