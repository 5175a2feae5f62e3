//! Node read helpers and taint plumbing.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Taint};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Hard taint applied right before a node is handed to the provider for
/// deletion. `NoSchedule`.
pub const TO_BE_DELETED_TAINT: &str = "ToBeDeletedByClusterAutoscaler";
/// Soft taint marking a node the scale-down planner considers unneeded.
/// `PreferNoSchedule`, observational only.
pub const DELETION_CANDIDATE_TAINT: &str = "DeletionCandidateOfClusterAutoscaler";
/// Annotation set on simulated upcoming nodes.
pub const UPCOMING_NODE_ANNOTATION: &str = "cluster-autoscaler.k8s.io/upcoming-node";

/// Substring identifying the scalable node class.
pub const WORKER_NAME_FRAGMENT: &str = "worker";

/// Aggregated compute shape of a node (or a workload's request vector).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeResources {
    pub millicores: i64,
    pub memory_bytes: i64,
}

impl NodeResources {
    pub fn add(&mut self, other: NodeResources) {
        self.millicores += other.millicores;
        self.memory_bytes += other.memory_bytes;
    }

    pub fn fits_within(&self, capacity: &NodeResources) -> bool {
        self.millicores <= capacity.millicores && self.memory_bytes <= capacity.memory_bytes
    }

    pub fn is_zero(&self) -> bool {
        self.millicores == 0 && self.memory_bytes == 0
    }
}

pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or("")
}

pub fn is_worker(node: &Node) -> bool {
    node_name(node).contains(WORKER_NAME_FRAGMENT)
}

/// Names of all worker nodes, in listing order.
pub fn worker_names(nodes: &[Node]) -> Vec<String> {
    nodes
        .iter()
        .filter(|n| is_worker(n))
        .map(|n| node_name(n).to_string())
        .collect()
}

/// The node whose name ends with `worker<index>` (decimal, no leading
/// zeros). Past scaling events can leave the numbering sparse, in which
/// case no node matches and the caller must treat the correction as
/// blocked.
pub fn find_worker_with_index<'a>(names: &'a [String], index: usize) -> Option<&'a str> {
    let suffix = format!("{WORKER_NAME_FRAGMENT}{index}");
    names
        .iter()
        .find(|name| name.ends_with(&suffix))
        .map(|name| name.as_str())
}

pub fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

pub fn creation_time(node: &Node) -> Option<DateTime<Utc>> {
    node.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

/// Allocatable compute of the node; falls back to capacity when the kubelet
/// has not reported allocatable yet.
pub fn allocatable(node: &Node) -> NodeResources {
    let status = match node.status.as_ref() {
        Some(status) => status,
        None => return NodeResources::default(),
    };
    let resources = status.allocatable.as_ref().or(status.capacity.as_ref());
    match resources {
        Some(map) => NodeResources {
            millicores: map.get("cpu").map(parse_cpu_millis).unwrap_or(0),
            memory_bytes: map.get("memory").map(parse_memory_bytes).unwrap_or(0),
        },
        None => NodeResources::default(),
    }
}

/// Whole cores and memory bytes from node capacity, for cluster totals.
pub fn cores_and_memory(node: &Node) -> (i64, i64) {
    let resources = allocatable(node);
    (resources.millicores / 1000, resources.memory_bytes)
}

/// Parse a CPU quantity into millicores. Accepts `2`, `500m`, `0.5`.
pub fn parse_cpu_millis(quantity: &Quantity) -> i64 {
    let raw = quantity.0.trim();
    if let Some(millis) = raw.strip_suffix('m') {
        return millis.parse::<i64>().unwrap_or(0);
    }
    if let Ok(cores) = raw.parse::<i64>() {
        return cores * 1000;
    }
    if let Ok(cores) = raw.parse::<f64>() {
        return (cores * 1000.0).round() as i64;
    }
    0
}

/// Parse a memory quantity into bytes. Accepts plain bytes plus the binary
/// (`Ki`..`Ei`) and decimal (`k`..`E`) suffixes.
pub fn parse_memory_bytes(quantity: &Quantity) -> i64 {
    const SUFFIXES: &[(&str, i64)] = &[
        ("Ei", 1 << 60),
        ("Pi", 1 << 50),
        ("Ti", 1 << 40),
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
        ("E", 1_000_000_000_000_000_000),
        ("P", 1_000_000_000_000_000),
        ("T", 1_000_000_000_000),
        ("G", 1_000_000_000),
        ("M", 1_000_000),
        ("k", 1_000),
    ];
    let raw = quantity.0.trim();
    for (suffix, multiplier) in SUFFIXES {
        if let Some(value) = raw.strip_suffix(suffix) {
            return value
                .parse::<f64>()
                .map(|v| (v * *multiplier as f64) as i64)
                .unwrap_or(0);
        }
    }
    raw.parse::<i64>().unwrap_or(0)
}

pub fn has_taint(node: &Node, key: &str) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .map(|taints| taints.iter().any(|t| t.key == key))
        .unwrap_or(false)
}

/// A node carrying the hard deletion taint is already on its way out and is
/// excluded from cluster totals.
pub fn is_being_deleted(node: &Node) -> bool {
    has_taint(node, TO_BE_DELETED_TAINT)
}

/// Current taints plus the given one, for a patch payload. Existing taints
/// with the same key are replaced so a retried taint refreshes its
/// timestamp.
pub fn taints_with(node: &Node, taint: Taint) -> Vec<Taint> {
    let mut taints: Vec<Taint> = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default();
    taints.retain(|t| t.key != taint.key);
    taints.push(taint);
    taints
}

/// Current taints with every taint under `key` removed.
pub fn taints_without(node: &Node, key: &str) -> Vec<Taint> {
    let mut taints: Vec<Taint> = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default();
    taints.retain(|t| t.key != key);
    taints
}

/// Build the hard deletion taint stamped with the decision time.
pub fn to_be_deleted_taint(now: DateTime<Utc>) -> Taint {
    Taint {
        key: TO_BE_DELETED_TAINT.to_string(),
        value: Some(now.timestamp().to_string()),
        effect: "NoSchedule".to_string(),
        time_added: None,
    }
}

/// Build the soft deletion-candidate taint stamped with the decision time.
pub fn deletion_candidate_taint(now: DateTime<Utc>) -> Taint {
    Taint {
        key: DELETION_CANDIDATE_TAINT.to_string(),
        value: Some(now.timestamp().to_string()),
        effect: "PreferNoSchedule".to_string(),
        time_added: None,
    }
}
