//! Status types shared by every integration CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Condition types and reasons
// =============================================================================

/// Condition type tracking the plug/socket coupling
pub const CONDITION_JOINED: &str = "Joined";
/// Condition type tracking deferred resource resolution
pub const CONDITION_RESOLVED: &str = "Resolved";
/// Condition type set when a pass ends in error
pub const CONDITION_FAILED: &str = "Failed";

/// Machine-readable condition reasons
pub mod reason {
    /// Plug was seen for the first time
    pub const PLUG_CREATED: &str = "PlugCreated";
    /// Socket was seen for the first time
    pub const SOCKET_CREATED: &str = "SocketCreated";
    /// Referenced socket does not exist yet
    pub const SOCKET_NOT_CREATED: &str = "SocketNotCreated";
    /// Referenced socket exists but is not ready
    pub const SOCKET_NOT_READY: &str = "SocketNotReady";
    /// Coupling has started
    pub const COUPLING_IN_PROCESS: &str = "CouplingInProcess";
    /// Update of an existing coupling has started
    pub const UPDATING_IN_PROCESS: &str = "UpdatingInProcess";
    /// Coupling finished
    pub const COUPLING_SUCCEEDED: &str = "CouplingSucceeded";
    /// Socket has at least one coupled plug
    pub const SOCKET_COUPLED: &str = "SocketCoupled";
    /// Socket has no coupled plugs
    pub const SOCKET_EMPTY: &str = "SocketEmpty";
    /// Socket resolved its interface
    pub const SOCKET_READY: &str = "SocketReady";
    /// Deferred resource is waiting
    pub const PENDING: &str = "Pending";
    /// Deferred resource was applied
    pub const SUCCESS: &str = "Success";
    /// Pass ended in error
    pub const ERROR: &str = "Error";
}

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of a plug
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Phase {
    /// Waiting on creation, a socket, or an in-flight coupling
    Pending,
    /// Coupled to its socket
    Succeeded,
    /// Last pass failed
    Failed,
    /// Not yet observed
    #[default]
    Unknown,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

// =============================================================================
// Conditions
// =============================================================================

/// Status of a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Joined, Resolved, Failed)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Generation of the object this condition was computed from
    #[serde(default)]
    pub observed_generation: i64,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        observed_generation: i64,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation,
            last_transition_time: Utc::now(),
        }
    }

    /// Whether this condition is True
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Set a condition, keeping one entry per type
///
/// The transition time only moves when the status changes. A condition
/// computed from an older generation than the stored one is ignored; returns
/// whether the list changed.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if condition.observed_generation < existing.observed_generation {
                return false;
            }
            if existing.status != condition.status {
                existing.last_transition_time = condition.last_transition_time;
            }
            existing.status = condition.status;
            existing.reason = condition.reason;
            existing.message = condition.message;
            existing.observed_generation = condition.observed_generation;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Remove a condition by type
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}
