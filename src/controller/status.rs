//! Status management utilities.
//!
//! Provides helpers for building and updating resource status conditions.

use crate::crd::{Condition, ConditionType};

/// Reasons reported on NodeUpgrade conditions.
pub mod reason {
    pub const CONTAINER_FAILED: &str = "ContainerFailed";
    pub const CONTAINER_WAITING: &str = "ContainerWaiting";
    pub const CONTAINER_RUNNING: &str = "ContainerRunning";
    pub const UPGRADE_IN_PROGRESS: &str = "UpgradeInProgress";
    pub const UPGRADE_FAILED: &str = "UpgradeFailed";
    pub const UPGRADE_COMPLETE: &str = "UpgradeComplete";
}

/// Builder for managing conditions list
///
/// Starts from the conditions already on the object. Setting a condition
/// whose status did not change keeps its `lastTransitionTime`.
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    /// Create a builder seeded with existing conditions
    pub fn new(existing: &[Condition]) -> Self {
        Self {
            conditions: existing.to_vec(),
        }
    }

    /// Add or update a condition
    pub fn set(&mut self, mut condition: Condition) -> &mut Self {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
        self
    }

    /// Mark a condition True.
    pub fn mark_true(&mut self, condition_type: ConditionType, generation: Option<i64>) -> &mut Self {
        self.set(Condition::new(condition_type.as_str(), true, "", "", generation))
    }

    /// Mark a condition False with a reason and message.
    pub fn mark_false(
        &mut self,
        condition_type: ConditionType,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::new(
            condition_type.as_str(),
            false,
            reason,
            message,
            generation,
        ))
    }

    /// Set Ready condition
    pub fn ready(
        &mut self,
        ready: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::ready(ready, reason, message, generation))
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: ConditionType) -> bool {
    get_condition(conditions, condition_type).is_some_and(Condition::is_true)
}

/// Find a condition by type
pub fn get_condition(conditions: &[Condition], condition_type: ConditionType) -> Option<&Condition> {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type.as_str())
}
