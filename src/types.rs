//! Data structures shared by the poll loops, the differs and the sinks.
//!
//! Snapshots are plain value types rebuilt on every successful poll.
//! [`DeltaEvent`]s are produced by comparing two snapshots and are
//! serialised with [`serde`](https://serde.rs/) when the JSON sink is
//! selected.  Nothing here is persisted.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Change-sequence token handed out by the registry.
///
/// A blocking query made with index `n` returns once the registry has
/// seen a change past `n` or the wait elapses.  Callers only ever move
/// it forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaitIndex(pub u64);

impl WaitIndex {
    /// Asks for the current state without blocking.
    pub const ZERO: WaitIndex = WaitIndex(0);

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WaitIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Service names observed at one poll.
pub type ServiceSnapshot = BTreeSet<String>;

/// Identity of one service instance.
///
/// Service IDs are only unique per agent node, so the node name is part
/// of the key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId {
    pub node: String,
    pub service_id: String,
}

impl InstanceId {
    pub fn new(node: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            service_id: service_id.into(),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service_id, self.node)
    }
}

/// Result of a single health check as reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
    Maintenance,
    Unknown,
}

impl CheckStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "passing" => CheckStatus::Passing,
            "warning" => CheckStatus::Warning,
            "critical" => CheckStatus::Critical,
            "maintenance" => CheckStatus::Maintenance,
            _ => CheckStatus::Unknown,
        }
    }
}

/// Aggregated verdict for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Passing,
    NotPassing,
}

impl HealthState {
    /// Reduces check results to a single verdict.
    ///
    /// An instance is `Passing` as soon as any one of its checks passes.
    /// This is deliberately an any-passing rule and not a quorum or
    /// majority model: one passing node check is enough even if the
    /// service's own check is critical.  An instance with no checks at
    /// all is `NotPassing`.
    pub fn from_checks(checks: &[CheckStatus]) -> Self {
        if checks.iter().any(|c| *c == CheckStatus::Passing) {
            HealthState::Passing
        } else {
            HealthState::NotPassing
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Passing => f.write_str("passing"),
            HealthState::NotPassing => f.write_str("not-passing"),
        }
    }
}

/// One instance of a service together with its check results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub checks: Vec<CheckStatus>,
}

impl InstanceRecord {
    pub fn health(&self) -> HealthState {
        HealthState::from_checks(&self.checks)
    }
}

/// Instances of one service observed at one poll, keyed by identity.
pub type InstanceSnapshot = BTreeMap<InstanceId, InstanceRecord>;

/// A single reported change.
///
/// Instance events carry the owning service so that several monitors can
/// share one sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeltaEvent {
    ServiceAdded {
        name: String,
    },
    ServiceRemoved {
        name: String,
    },
    InstanceAdded {
        service: String,
        id: InstanceId,
    },
    InstanceRemoved {
        service: String,
        id: InstanceId,
    },
    InstanceHealthChanged {
        service: String,
        id: InstanceId,
        old: HealthState,
        new: HealthState,
    },
}

impl fmt::Display for DeltaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeltaEvent::ServiceAdded { name } => write!(f, "+ service {}", name),
            DeltaEvent::ServiceRemoved { name } => write!(f, "- service {}", name),
            DeltaEvent::InstanceAdded { service, id } => {
                write!(f, "+ instance {}/{}", service, id)
            }
            DeltaEvent::InstanceRemoved { service, id } => {
                write!(f, "- instance {}/{}", service, id)
            }
            DeltaEvent::InstanceHealthChanged {
                service,
                id,
                old,
                new,
            } => write!(f, "~ instance {}/{} {} -> {}", service, id, old, new),
        }
    }
}
