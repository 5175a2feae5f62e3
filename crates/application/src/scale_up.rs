//! Scale-up planner: turns unschedulable workloads into a node count and
//! drives the provider request to a terminal state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stratus_domain::node::{allocatable, is_worker, NodeResources};
use stratus_domain::ports::{ExpanderStrategy, ProviderClient, ScaleUpOption};
use stratus_domain::registry::ClusterStateRegistry;
use stratus_domain::status::{ScaleUpOutcome, ScaleUpStatus};
use stratus_domain::workload::{pod_name, resource_requests};
use stratus_shared::error::Result;

use crate::poll::{scale_with_retry, PollOutcome, ScaleRequest};

/// The single node group this autoscaler manages.
pub const WORKER_NODE_GROUP_ID: &str = "workers";

pub struct ScaleUpPlanner {
    provider: Arc<dyn ProviderClient>,
    expander: Arc<dyn ExpanderStrategy>,
    /// Taint keys that do not disqualify a node from acting as the template.
    ignored_taints: BTreeSet<String>,
}

impl ScaleUpPlanner {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        expander: Arc<dyn ExpanderStrategy>,
        ignored_taints: BTreeSet<String>,
    ) -> Self {
        Self {
            provider,
            expander,
            ignored_taints,
        }
    }

    /// Decide how many nodes the unschedulable pods need, rank the options
    /// through the expander and drive a single provider request to a
    /// terminal state.
    ///
    /// At most one in-flight provider request per iteration; the polling
    /// loop is bounded only by provider responsiveness and the cancellation
    /// token.
    pub async fn scale_up(
        &self,
        unschedulable_pods: Vec<Pod>,
        ready_nodes: &[Node],
        daemon_sets: &[DaemonSet],
        registry: &ClusterStateRegistry,
        registered_count: usize,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ScaleUpStatus> {
        let template = match template_node(ready_nodes, &self.ignored_taints) {
            Some(node) => node,
            None => {
                warn!("no ready node to derive a worker template from");
                let mut status = ScaleUpStatus::with_outcome(ScaleUpOutcome::NoOptionsAvailable);
                status.pods_remain_unschedulable = unschedulable_pods;
                return Ok(status);
            }
        };

        let mut capacity = allocatable(&template);
        let overhead = daemon_set_overhead(daemon_sets);
        capacity.millicores = (capacity.millicores - overhead.millicores).max(0);
        capacity.memory_bytes = (capacity.memory_bytes - overhead.memory_bytes).max(0);

        let mut fitting = Vec::new();
        let mut remaining = Vec::new();
        for pod in unschedulable_pods {
            if !capacity.is_zero() && resource_requests(&pod).fits_within(&capacity) {
                fitting.push(pod);
            } else {
                info!(
                    pod = pod_name(&pod),
                    "no worker template accommodates this pod"
                );
                remaining.push(pod);
            }
        }

        if fitting.is_empty() {
            let mut status = ScaleUpStatus::with_outcome(ScaleUpOutcome::NoOptionsAvailable);
            status.pods_remain_unschedulable = remaining;
            return Ok(status);
        }

        let node_count = estimate_node_count(&fitting, &capacity);
        let option = ScaleUpOption {
            node_group_id: WORKER_NODE_GROUP_ID.to_string(),
            node_count,
            debug: format!("{} pods over {} nodes", fitting.len(), node_count),
            pods: fitting.clone(),
        };

        let mut node_map = BTreeMap::new();
        node_map.insert(WORKER_NODE_GROUP_ID.to_string(), template);

        let ranked = self.expander.best_options(vec![option.clone()], &node_map).await;
        let chosen = ranked.into_iter().next().unwrap_or(option);

        info!(
            node_count = chosen.node_count,
            expander = self.expander.name(),
            "requesting scale-up"
        );
        let outcome = scale_with_retry(
            self.provider.as_ref(),
            ScaleRequest::Up(chosen.node_count),
            cancel,
        )
        .await?;

        let mut status = ScaleUpStatus::default();
        status.nodes_requested = chosen.node_count;
        status.pods_remain_unschedulable = remaining;
        match outcome {
            PollOutcome::Cancelled => {
                status.outcome = ScaleUpOutcome::InProgress;
            }
            _ => {
                registry.register_scale_up_request(chosen.node_count, registered_count, now);
                status.outcome = ScaleUpOutcome::Successful;
                status.pods_awaiting_capacity = fitting;
            }
        }
        Ok(status)
    }
}

/// Template shape for hypothetical new nodes: the largest untainted ready
/// worker, or any ready node when no worker qualifies. Taints whose keys
/// are in the ignored set do not disqualify a node.
fn template_node(ready_nodes: &[Node], ignored_taints: &BTreeSet<String>) -> Option<Node> {
    ready_nodes
        .iter()
        .filter(|n| is_worker(n) && !has_disqualifying_taint(n, ignored_taints))
        .max_by_key(|n| allocatable(n).millicores)
        .or_else(|| ready_nodes.first())
        .cloned()
}

fn has_disqualifying_taint(node: &Node, ignored_taints: &BTreeSet<String>) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .map(|taints| taints.iter().any(|t| !ignored_taints.contains(&t.key)))
        .unwrap_or(false)
}

/// Requests every daemon set would place on a new node.
fn daemon_set_overhead(daemon_sets: &[DaemonSet]) -> NodeResources {
    let mut total = NodeResources::default();
    for ds in daemon_sets {
        let pod_spec = ds
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref());
        if let Some(spec) = pod_spec {
            let probe = Pod {
                spec: Some(spec.clone()),
                ..Default::default()
            };
            total.add(resource_requests(&probe));
        }
    }
    total
}

/// First-fit-decreasing bin packing of the pods into template-shaped nodes.
fn estimate_node_count(pods: &[Pod], capacity: &NodeResources) -> usize {
    let mut requests: Vec<NodeResources> = pods.iter().map(resource_requests).collect();
    requests.sort_by(|a, b| b.millicores.cmp(&a.millicores));

    let mut bins: Vec<NodeResources> = Vec::new();
    for request in requests {
        let slot = bins.iter_mut().find(|used| {
            used.millicores + request.millicores <= capacity.millicores
                && used.memory_bytes + request.memory_bytes <= capacity.memory_bytes
        });
        match slot {
            Some(used) => used.add(request),
            None => bins.push(request),
        }
    }
    bins.len().max(1)
}
