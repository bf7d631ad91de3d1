//! Condition model shared by both resource kinds.
//!
//! A status carries at most one condition per type. `set` replaces the entry for
//! a type and keeps its `lastTransitionTime` unless the status value flips.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionType {
    Ready,
    Syncing,
    Failed,
    Released,
    Progressing,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::Syncing => "Syncing",
            ConditionType::Failed => "Failed",
            ConditionType::Released => "Released",
            ConditionType::Progressing => "Progressing",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    RepositoryAdded,
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    AuthenticationFailed,
    Suspended,
    ConfigurationError,
    InstallStarted,
    InstallCompleted,
    InstallFailed,
    UpgradeStarted,
    UpgradeCompleted,
    UpgradeFailed,
    RollbackCompleted,
    RollbackFailed,
    UninstallFailed,
    DependencyNotReady,
    ReleaseSuspended,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::RepositoryAdded => "RepositoryAdded",
            Reason::SyncStarted => "SyncStarted",
            Reason::SyncCompleted => "SyncCompleted",
            Reason::SyncFailed => "SyncFailed",
            Reason::AuthenticationFailed => "AuthenticationFailed",
            Reason::Suspended => "Suspended",
            Reason::ConfigurationError => "ConfigurationError",
            Reason::InstallStarted => "InstallStarted",
            Reason::InstallCompleted => "InstallCompleted",
            Reason::InstallFailed => "InstallFailed",
            Reason::UpgradeStarted => "UpgradeStarted",
            Reason::UpgradeCompleted => "UpgradeCompleted",
            Reason::UpgradeFailed => "UpgradeFailed",
            Reason::RollbackCompleted => "RollbackCompleted",
            Reason::RollbackFailed => "RollbackFailed",
            Reason::UninstallFailed => "UninstallFailed",
            Reason::DependencyNotReady => "DependencyNotReady",
            Reason::ReleaseSuspended => "ReleaseSuspended",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(ty: ConditionType, status: ConditionStatus, reason: Reason, message: impl Into<String>) -> Self {
        Self {
            type_: ty.as_str().to_string(),
            status,
            reason: reason.as_str().to_string(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn ready(reason: Reason, message: impl Into<String>) -> Self {
        Self::new(ConditionType::Ready, ConditionStatus::True, reason, message)
    }
    pub fn not_ready(reason: Reason, message: impl Into<String>) -> Self {
        Self::new(ConditionType::Ready, ConditionStatus::False, reason, message)
    }
    pub fn syncing(reason: Reason, message: impl Into<String>) -> Self {
        Self::new(ConditionType::Syncing, ConditionStatus::True, reason, message)
    }
    pub fn failed(reason: Reason, message: impl Into<String>) -> Self {
        Self::new(ConditionType::Failed, ConditionStatus::True, reason, message)
    }
    pub fn released(reason: Reason, message: impl Into<String>) -> Self {
        Self::new(ConditionType::Released, ConditionStatus::True, reason, message)
    }
    pub fn progressing(reason: Reason, message: impl Into<String>) -> Self {
        Self::new(ConditionType::Progressing, ConditionStatus::True, reason, message)
    }

    pub fn is(&self, ty: ConditionType) -> bool { self.type_ == ty.as_str() }
}

/// Upsert by type. Returns true when the stored condition changed in any field
/// other than the transition time.
pub fn set(conditions: &mut Vec<Condition>, mut next: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == next.type_) {
        Some(cur) => {
            if cur.status == next.status {
                next.last_transition_time = cur.last_transition_time;
            }
            let changed = cur.status != next.status || cur.reason != next.reason || cur.message != next.message;
            *cur = next;
            changed
        }
        None => {
            conditions.push(next);
            true
        }
    }
}

pub fn find(conditions: &[Condition], ty: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.is(ty))
}

pub fn is_true(conditions: &[Condition], ty: ConditionType) -> bool {
    find(conditions, ty).map(|c| c.status == ConditionStatus::True).unwrap_or(false)
}

/// Flip an existing condition of `ty` to False; absent conditions stay absent.
pub fn resolve(conditions: &mut Vec<Condition>, ty: ConditionType, reason: Reason, message: impl Into<String>) {
    if find(conditions, ty).is_some() {
        set(conditions, Condition::new(ty, ConditionStatus::False, reason, message));
    }
}
