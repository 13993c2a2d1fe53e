//! In-process target state store.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;

use crate::core::{CombinedTargetState, ConsistencyState, ReachabilityState, TargetId};

/// Read/write contract every mirrored operation and the resync engine use
/// to consult and update target states.
pub trait ConsistencyStates: Send + Sync {
    fn consistency_state(&self, target: TargetId) -> Option<ConsistencyState>;

    fn reachability_state(&self, target: TargetId) -> Option<ReachabilityState>;

    /// `true` moves a GOOD target to NEEDS_RESYNC; `false` moves a
    /// NEEDS_RESYNC target back to GOOD. BAD is left alone either way.
    fn set_buddy_needs_resync(&self, target: TargetId, needs_resync: bool);

    fn set_consistency_state(&self, target: TargetId, state: ConsistencyState);

    fn is_resync_in_progress(&self, _target: TargetId) -> bool {
        false
    }

    fn set_resync_in_progress(&self, _target: TargetId, _running: bool) {}
}

#[derive(Default)]
struct StoreInner {
    states: BTreeMap<TargetId, CombinedTargetState>,
    resyncing: BTreeSet<TargetId>,
}

/// Reader-heavy target state table behind a `parking_lot::RwLock`.
#[derive(Default)]
pub struct TargetStateStore {
    inner: RwLock<StoreInner>,
}

impl TargetStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, target: TargetId, state: CombinedTargetState) {
        self.inner.write().states.insert(target, state);
    }

    pub fn set_consistency(&self, target: TargetId, consistency: ConsistencyState) {
        let mut inner = self.inner.write();
        let entry = inner.states.entry(target).or_default();
        if entry.consistency != consistency {
            tracing::info!(
                target_id = %target,
                from = %entry.consistency,
                to = %consistency,
                "consistency state changed"
            );
        }
        entry.consistency = consistency;
    }

    pub fn set_reachability(&self, target: TargetId, reachability: ReachabilityState) {
        let mut inner = self.inner.write();
        inner.states.entry(target).or_default().reachability = reachability;
    }

    pub fn combined_state(&self, target: TargetId) -> Option<CombinedTargetState> {
        self.inner.read().states.get(&target).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<TargetId, CombinedTargetState> {
        self.inner.read().states.clone()
    }

    /// Operator request: resync this target even if it looks GOOD.
    pub fn force_resync(&self, target: TargetId) {
        self.set_consistency(target, ConsistencyState::NeedsResync);
    }
}

impl ConsistencyStates for TargetStateStore {
    fn consistency_state(&self, target: TargetId) -> Option<ConsistencyState> {
        self.inner
            .read()
            .states
            .get(&target)
            .map(|state| state.consistency)
    }

    fn reachability_state(&self, target: TargetId) -> Option<ReachabilityState> {
        self.inner
            .read()
            .states
            .get(&target)
            .map(|state| state.reachability)
    }

    fn set_buddy_needs_resync(&self, target: TargetId, needs_resync: bool) {
        let mut inner = self.inner.write();
        let entry = inner.states.entry(target).or_default();
        let next = match (entry.consistency, needs_resync) {
            (ConsistencyState::Good, true) => ConsistencyState::NeedsResync,
            (ConsistencyState::NeedsResync, false) => ConsistencyState::Good,
            (current, _) => current,
        };
        if next != entry.consistency {
            tracing::info!(
                target_id = %target,
                from = %entry.consistency,
                to = %next,
                "buddy resync flag changed"
            );
            entry.consistency = next;
        }
    }

    fn set_consistency_state(&self, target: TargetId, state: ConsistencyState) {
        self.set_consistency(target, state);
    }

    fn is_resync_in_progress(&self, target: TargetId) -> bool {
        self.inner.read().resyncing.contains(&target)
    }

    fn set_resync_in_progress(&self, target: TargetId, running: bool) {
        let mut inner = self.inner.write();
        if running {
            inner.resyncing.insert(target);
        } else {
            inner.resyncing.remove(&target);
        }
    }
}
