//! Per-iteration result records and the cluster-state status summary.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

/// Outcome of the scale-up phase of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleUpOutcome {
    NotTried,
    NotNeeded,
    InCooldown,
    InProgress,
    Successful,
    NoOptionsAvailable,
    Error,
}

impl Default for ScaleUpOutcome {
    fn default() -> Self {
        ScaleUpOutcome::NotTried
    }
}

impl fmt::Display for ScaleUpOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleUpOutcome::NotTried => write!(f, "NOT_TRIED"),
            ScaleUpOutcome::NotNeeded => write!(f, "NOT_NEEDED"),
            ScaleUpOutcome::InCooldown => write!(f, "IN_COOLDOWN"),
            ScaleUpOutcome::InProgress => write!(f, "IN_PROGRESS"),
            ScaleUpOutcome::Successful => write!(f, "SUCCESSFUL"),
            ScaleUpOutcome::NoOptionsAvailable => write!(f, "NO_OPTIONS_AVAILABLE"),
            ScaleUpOutcome::Error => write!(f, "ERROR"),
        }
    }
}

/// Outcome of the scale-down phase of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleDownOutcome {
    NotTried,
    InCooldown,
    InProgress,
    NoUnneeded,
    NoNodesDeleted,
    NodeDeleteStarted,
    Error,
}

impl Default for ScaleDownOutcome {
    fn default() -> Self {
        ScaleDownOutcome::NotTried
    }
}

impl fmt::Display for ScaleDownOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleDownOutcome::NotTried => write!(f, "NOT_TRIED"),
            ScaleDownOutcome::InCooldown => write!(f, "IN_COOLDOWN"),
            ScaleDownOutcome::InProgress => write!(f, "IN_PROGRESS"),
            ScaleDownOutcome::NoUnneeded => write!(f, "NO_UNNEEDED"),
            ScaleDownOutcome::NoNodesDeleted => write!(f, "NO_NODES_DELETED"),
            ScaleDownOutcome::NodeDeleteStarted => write!(f, "NODE_DELETE_STARTED"),
            ScaleDownOutcome::Error => write!(f, "ERROR"),
        }
    }
}

/// Why a node could not be removed, recorded for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnremovableReason {
    NotUnderutilized,
    NotUnneededLongEnough,
    BlockedByDisruptionBudget { pod: String, namespace: String },
    SingleReplica { pod: String, namespace: String },
    LocalStorage { pod: String, namespace: String },
    NoPlaceToReschedule { pod: String, namespace: String },
}

impl fmt::Display for UnremovableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnremovableReason::NotUnderutilized => write!(f, "node is not underutilized"),
            UnremovableReason::NotUnneededLongEnough => {
                write!(f, "node has not been unneeded long enough")
            }
            UnremovableReason::BlockedByDisruptionBudget { pod, namespace } => {
                write!(f, "pod {namespace}/{pod} is protected by a disruption budget")
            }
            UnremovableReason::SingleReplica { pod, namespace } => {
                write!(f, "pod {namespace}/{pod} is the only replica of its controller")
            }
            UnremovableReason::LocalStorage { pod, namespace } => {
                write!(f, "pod {namespace}/{pod} uses local storage")
            }
            UnremovableReason::NoPlaceToReschedule { pod, namespace } => {
                write!(f, "pod {namespace}/{pod} has nowhere to reschedule")
            }
        }
    }
}

/// Result of the scale-up phase.
#[derive(Debug, Default)]
pub struct ScaleUpStatus {
    pub outcome: ScaleUpOutcome,
    /// Pods the planner could not help; the status processor emits events
    /// for these.
    pub pods_remain_unschedulable: Vec<Pod>,
    /// Pods the planner expects to become schedulable once the requested
    /// nodes register.
    pub pods_awaiting_capacity: Vec<Pod>,
    /// Node count requested from the provider, if any.
    pub nodes_requested: usize,
}

impl ScaleUpStatus {
    pub fn with_outcome(outcome: ScaleUpOutcome) -> Self {
        Self {
            outcome,
            ..Default::default()
        }
    }
}

/// Result of the scale-down phase.
#[derive(Debug, Default)]
pub struct ScaleDownStatus {
    pub outcome: ScaleDownOutcome,
    /// Per-node reasons a candidate was kept.
    pub unremovable: BTreeMap<String, UnremovableReason>,
    /// Per-node utilization observed while looking for unneeded nodes.
    pub utilization: BTreeMap<String, f64>,
    /// Nodes handed to the provider for deletion, if any.
    pub nodes_deleted: Vec<String>,
}

impl ScaleDownStatus {
    pub fn with_outcome(outcome: ScaleDownOutcome) -> Self {
        Self {
            outcome,
            ..Default::default()
        }
    }
}

/// Aggregate cluster-health verdict of the state registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthVerdict {
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthVerdict::Healthy => write!(f, "Healthy"),
            HealthVerdict::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Snapshot of the registry's view, written into the status configmap at
/// the end of every iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStateStatus {
    pub verdict: HealthVerdict,
    pub ready_count: usize,
    pub unready_count: usize,
    pub registered_count: usize,
    pub upcoming_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl ClusterStateStatus {
    /// Human-readable multi-line rendering for the status configmap.
    pub fn readable_string(&self) -> String {
        format!(
            "Cluster-autoscaler status at {}:\n\
             Health: {} (ready={} unready={} registered={} upcoming={})",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.verdict,
            self.ready_count,
            self.unready_count,
            self.registered_count,
            self.upcoming_count,
        )
    }

    /// Parse a readable rendering back into a status. The round trip is
    /// relied on by operators' tooling that scrapes the configmap.
    pub fn parse_readable(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let header = lines.next()?;
        let timestamp = header
            .strip_prefix("Cluster-autoscaler status at ")?
            .strip_suffix(':')?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp).ok()?.with_timezone(&Utc);

        let body = lines.next()?;
        let rest = body.strip_prefix("Health: ")?;
        let (verdict, counters) = rest.split_once(" (")?;
        let verdict = match verdict {
            "Healthy" => HealthVerdict::Healthy,
            "Unhealthy" => HealthVerdict::Unhealthy,
            _ => return None,
        };

        let counters = counters.strip_suffix(')')?;
        let mut ready = None;
        let mut unready = None;
        let mut registered = None;
        let mut upcoming = None;
        for field in counters.split_whitespace() {
            let (key, value) = field.split_once('=')?;
            let value: usize = value.parse().ok()?;
            match key {
                "ready" => ready = Some(value),
                "unready" => unready = Some(value),
                "registered" => registered = Some(value),
                "upcoming" => upcoming = Some(value),
                _ => return None,
            }
        }

        Some(Self {
            verdict,
            ready_count: ready?,
            unready_count: unready?,
            registered_count: registered?,
            upcoming_count: upcoming?,
            timestamp,
        })
    }
}
