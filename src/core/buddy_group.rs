//! Mirror buddy groups and the target → group mapping.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{BuddyGroupId, TargetId};

/// A primary/secondary target pair. Exactly one side is primary at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorBuddyGroup {
    pub primary: TargetId,
    pub secondary: TargetId,
}

impl MirrorBuddyGroup {
    pub const fn new(primary: TargetId, secondary: TargetId) -> Self {
        Self { primary, secondary }
    }

    pub fn contains(&self, target: TargetId) -> bool {
        self.primary == target || self.secondary == target
    }

    fn swapped(self) -> Self {
        Self {
            primary: self.secondary,
            secondary: self.primary,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuddyGroupError {
    #[error("buddy group {0} already exists")]
    GroupExists(BuddyGroupId),
    #[error("buddy group {0} not found")]
    UnknownGroup(BuddyGroupId),
    #[error("target {target} already belongs to buddy group {group}")]
    TargetInUse {
        target: TargetId,
        group: BuddyGroupId,
    },
    #[error("buddy group needs two distinct non-zero targets, got {primary} and {secondary}")]
    InvalidPair {
        primary: TargetId,
        secondary: TargetId,
    },
    #[error("buddy group {0} is still referenced by stored data")]
    GroupReferenced(BuddyGroupId),
}

#[derive(Default)]
struct MapperState {
    groups: BTreeMap<BuddyGroupId, MirrorBuddyGroup>,
    target_to_group: BTreeMap<TargetId, BuddyGroupId>,
    referenced: BTreeSet<BuddyGroupId>,
    local_group: Option<BuddyGroupId>,
}

/// Thread-safe registry of buddy groups.
///
/// Groups are created by admin action and swapped on switchover. A group
/// that is marked referenced cannot be removed.
#[derive(Default)]
pub struct BuddyGroupMapper {
    state: RwLock<MapperState>,
}

impl BuddyGroupMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(
        &self,
        id: BuddyGroupId,
        group: MirrorBuddyGroup,
    ) -> Result<(), BuddyGroupError> {
        if group.primary == group.secondary
            || group.primary.is_unset()
            || group.secondary.is_unset()
        {
            return Err(BuddyGroupError::InvalidPair {
                primary: group.primary,
                secondary: group.secondary,
            });
        }
        let mut state = self.state.write();
        if state.groups.contains_key(&id) {
            return Err(BuddyGroupError::GroupExists(id));
        }
        for target in [group.primary, group.secondary] {
            if let Some(existing) = state.target_to_group.get(&target) {
                return Err(BuddyGroupError::TargetInUse {
                    target,
                    group: *existing,
                });
            }
        }
        state.target_to_group.insert(group.primary, id);
        state.target_to_group.insert(group.secondary, id);
        state.groups.insert(id, group);
        Ok(())
    }

    pub fn group(&self, id: BuddyGroupId) -> Option<MirrorBuddyGroup> {
        self.state.read().groups.get(&id).copied()
    }

    pub fn primary_target(&self, id: BuddyGroupId) -> Option<TargetId> {
        self.group(id).map(|group| group.primary)
    }

    pub fn secondary_target(&self, id: BuddyGroupId) -> Option<TargetId> {
        self.group(id).map(|group| group.secondary)
    }

    pub fn group_of(&self, target: TargetId) -> Option<BuddyGroupId> {
        self.state.read().target_to_group.get(&target).copied()
    }

    /// Returns the buddy of `target` and whether `target` is the primary.
    pub fn buddy_of(&self, target: TargetId) -> Option<(TargetId, bool)> {
        let state = self.state.read();
        let id = state.target_to_group.get(&target)?;
        let group = state.groups.get(id)?;
        if group.primary == target {
            Some((group.secondary, true))
        } else {
            Some((group.primary, false))
        }
    }

    /// Swap primary and secondary. Returns the new group layout.
    pub fn switchover(&self, id: BuddyGroupId) -> Result<MirrorBuddyGroup, BuddyGroupError> {
        let mut state = self.state.write();
        let group = state
            .groups
            .get_mut(&id)
            .ok_or(BuddyGroupError::UnknownGroup(id))?;
        *group = group.swapped();
        let group = *group;
        tracing::info!(
            group = %id,
            primary = %group.primary,
            secondary = %group.secondary,
            "buddy group switchover"
        );
        Ok(group)
    }

    pub fn mark_referenced(
        &self,
        id: BuddyGroupId,
        referenced: bool,
    ) -> Result<(), BuddyGroupError> {
        let mut state = self.state.write();
        if !state.groups.contains_key(&id) {
            return Err(BuddyGroupError::UnknownGroup(id));
        }
        if referenced {
            state.referenced.insert(id);
        } else {
            state.referenced.remove(&id);
        }
        Ok(())
    }

    pub fn remove_group(&self, id: BuddyGroupId) -> Result<MirrorBuddyGroup, BuddyGroupError> {
        let mut state = self.state.write();
        if state.referenced.contains(&id) {
            return Err(BuddyGroupError::GroupReferenced(id));
        }
        let group = state
            .groups
            .remove(&id)
            .ok_or(BuddyGroupError::UnknownGroup(id))?;
        state.target_to_group.remove(&group.primary);
        state.target_to_group.remove(&group.secondary);
        if state.local_group == Some(id) {
            state.local_group = None;
        }
        Ok(group)
    }

    pub fn set_local_group(&self, id: Option<BuddyGroupId>) {
        self.state.write().local_group = id;
    }

    pub fn local_group(&self) -> Option<BuddyGroupId> {
        self.state.read().local_group
    }

    pub fn groups(&self) -> Vec<(BuddyGroupId, MirrorBuddyGroup)> {
        self.state
            .read()
            .groups
            .iter()
            .map(|(id, group)| (*id, *group))
            .collect()
    }
}
