//! Capability ports implemented by the infrastructure layer.
//!
//! The engine and planners are parameterized over these traits; tests swap
//! in hand-rolled fakes, production wires kube-, REST- and gRPC-backed
//! implementations selected once at startup.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, ReplicaSet};
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;

use stratus_shared::credentials::{NodeGroupBounds, ProviderCredentials};
use stratus_shared::error::Result;

use crate::status::{ScaleDownStatus, ScaleUpStatus};

/// Read/write access to the workload orchestrator.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    async fn list_all_nodes(&self) -> Result<Vec<Node>>;
    async fn list_ready_nodes(&self) -> Result<Vec<Node>>;
    /// Pods bound to a node and not yet finished.
    async fn list_scheduled_pods(&self) -> Result<Vec<Pod>>;
    /// Pods the orchestrator marked unschedulable.
    async fn list_unschedulable_pods(&self) -> Result<Vec<Pod>>;
    /// Every pod in the cluster, for the removability predicate.
    async fn list_all_pods(&self) -> Result<Vec<Pod>>;
    async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>>;
    async fn list_pod_disruption_budgets(&self) -> Result<Vec<PodDisruptionBudget>>;
    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>>;

    /// Apply a taint to a node, replacing any existing taint with the same key.
    async fn apply_taint(&self, node: &Node, taint: Taint) -> Result<()>;
    /// Remove every taint with the given key from a node.
    async fn remove_taint(&self, node: &Node, taint_key: &str) -> Result<()>;

    /// Emit an event attached to a pod.
    async fn emit_pod_event(
        &self,
        pod: &Pod,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()>;
    /// Emit a cluster-scoped warning event.
    async fn emit_cluster_event(&self, reason: &str, message: &str) -> Result<()>;
    /// Message of the most recent event attached to a pod, if any.
    async fn latest_pod_event_message(&self, pod: &Pod) -> Result<Option<String>>;
}

/// Terminal-or-not answer of the provider status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderScalingStatus {
    Scaling,
    Succeeded,
}

/// The external provisioning control plane. The only component permitted
/// to change the cluster's node count. Calls are synchronous and slow
/// (minutes) and may fail mid-flight.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn scale_up(&self, count: usize) -> Result<()>;
    async fn scale_down(&self, count: usize) -> Result<()>;
    async fn status(&self) -> Result<ProviderScalingStatus>;
    /// Whether the provider reports the last operation as failed.
    async fn error_status(&self) -> Result<bool>;
}

/// Read access to the cluster-resident configuration artifacts.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn node_group_bounds(&self) -> Result<NodeGroupBounds>;
    async fn provider_credentials(&self) -> Result<ProviderCredentials>;
}

/// Writes the status summary back into the cluster.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn write(&self, body: &str) -> Result<()>;
    async fn delete(&self) -> Result<()>;
}

/// A candidate (node-group, count) pair considered by the scale-up planner.
#[derive(Debug, Clone)]
pub struct ScaleUpOption {
    pub node_group_id: String,
    pub node_count: usize,
    pub debug: String,
    pub pods: Vec<Pod>,
}

/// Ranks candidate scale-up options. Implementations must fail open: on any
/// internal failure the input is returned unfiltered.
#[async_trait]
pub trait ExpanderStrategy: Send + Sync {
    async fn best_options(
        &self,
        options: Vec<ScaleUpOption>,
        node_map: &BTreeMap<String, Node>,
    ) -> Vec<ScaleUpOption>;

    fn name(&self) -> &str;
}

/// Partitions the node list into pod-destination candidates and scale-down
/// candidates. The default uses the full list for both.
pub trait ScaleDownNodeProcessor: Send + Sync {
    fn pod_destination_candidates(&self, all_nodes: &[Node]) -> Vec<Node>;
    fn scale_down_candidates(&self, all_nodes: &[Node]) -> Vec<Node>;
}

/// Default node processor: every node is both a destination and a candidate.
pub struct AllNodesProcessor;

impl ScaleDownNodeProcessor for AllNodesProcessor {
    fn pod_destination_candidates(&self, all_nodes: &[Node]) -> Vec<Node> {
        all_nodes.to_vec()
    }

    fn scale_down_candidates(&self, all_nodes: &[Node]) -> Vec<Node> {
        all_nodes.to_vec()
    }
}

/// Invoked with the scale-up result of every iteration, even when the
/// planner never ran.
#[async_trait]
pub trait ScaleUpStatusProcessor: Send + Sync {
    async fn process(&self, status: &ScaleUpStatus);
}

/// Invoked with the scale-down result of every iteration.
#[async_trait]
pub trait ScaleDownStatusProcessor: Send + Sync {
    async fn process(&self, status: &ScaleDownStatus);
}
