//! Scale-down planner: finds unneeded nodes, gates their removal on safety
//! predicates and drives the provider request.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use stratus_domain::node::{
    deletion_candidate_taint, has_taint, is_being_deleted, is_worker, node_name,
    to_be_deleted_taint, NodeResources, DELETION_CANDIDATE_TAINT,
};
use stratus_domain::ports::{OrchestratorClient, ProviderClient};
use stratus_domain::snapshot::ClusterSnapshot;
use stratus_domain::status::{ScaleDownOutcome, ScaleDownStatus, UnremovableReason};
use stratus_domain::workload::{
    first_owner, has_local_storage, host_node, is_daemon_set_pod, pod_name, pod_namespace,
    resource_requests,
};
use stratus_shared::credentials::NodeGroupBounds;
use stratus_shared::error::Result;
use stratus_shared::options::AutoscalingOptions;

use crate::poll::{scale_with_retry, PollOutcome, ScaleRequest};

/// Tracks provider deletions that have not reached a terminal state yet.
#[derive(Debug, Default)]
pub struct NodeDeletionTracker {
    non_empty_in_progress: bool,
}

impl NodeDeletionTracker {
    fn start(&mut self, non_empty: bool) {
        self.non_empty_in_progress = non_empty;
    }

    fn finish(&mut self) {
        self.non_empty_in_progress = false;
    }

    pub fn is_non_empty_node_delete_in_progress(&self) -> bool {
        self.non_empty_in_progress
    }
}

/// Verdict of the node-removability predicate.
#[derive(Debug)]
pub struct RemovabilityVerdict {
    pub can_remove: bool,
    pub reasons: Vec<UnremovableReason>,
}

/// Whether the named worker node can be removed without losing availability
/// or data. Walks every workload in the cluster: a pod hosted on the target
/// blocks removal when its controller would drop to zero replicas, or when
/// it holds local storage.
pub async fn can_remove_worker_node(
    orchestrator: &dyn OrchestratorClient,
    worker_node_name: &str,
) -> Result<RemovabilityVerdict> {
    let pods = orchestrator.list_all_pods().await?;
    let mut reasons = Vec::new();

    for pod in &pods {
        if host_node(pod) != Some(worker_node_name) {
            continue;
        }
        let name = pod_name(pod).to_string();
        let namespace = pod_namespace(pod).to_string();

        if has_local_storage(pod) {
            info!(
                pod = %name,
                namespace = %namespace,
                "scale down blocked: pod has local storage and should be evicted first"
            );
            reasons.push(UnremovableReason::LocalStorage {
                pod: name.clone(),
                namespace: namespace.clone(),
            });
        }

        match first_owner(pod) {
            None => {
                // Undefined in the original design; an unmanaged pod does
                // not block removal through the replica rule.
                debug!(
                    pod = %name,
                    namespace = %namespace,
                    "pod has no owner references, not blocking removal"
                );
            }
            Some(owner) if owner.kind != "DaemonSet" => {
                if let Some(replica_set) =
                    orchestrator.get_replica_set(&namespace, &owner.name).await?
                {
                    let replicas = replica_set.status.as_ref().map(|s| s.replicas).unwrap_or(0);
                    if replicas == 1 {
                        info!(
                            pod = %name,
                            namespace = %namespace,
                            replica_set = %owner.name,
                            "scale down blocked: replica set has only one replica"
                        );
                        reasons.push(UnremovableReason::SingleReplica {
                            pod: name,
                            namespace,
                        });
                    }
                }
            }
            Some(_) => {}
        }
    }

    Ok(RemovabilityVerdict {
        can_remove: reasons.is_empty(),
        reasons,
    })
}

/// Whether any disruption budget forbids evicting this pod right now.
fn blocked_by_disruption_budget(pod: &Pod, pdbs: &[PodDisruptionBudget]) -> bool {
    let labels = match pod.metadata.labels.as_ref() {
        Some(labels) => labels,
        None => return false,
    };
    for pdb in pdbs {
        if pdb.metadata.namespace.as_deref() != pod.metadata.namespace.as_deref() {
            continue;
        }
        let selector = pdb
            .spec
            .as_ref()
            .and_then(|s| s.selector.as_ref())
            .and_then(|s| s.match_labels.as_ref());
        let matches = match selector {
            Some(match_labels) => match_labels
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value)),
            None => false,
        };
        if !matches {
            continue;
        }
        let allowed = pdb
            .status
            .as_ref()
            .map(|s| s.disruptions_allowed)
            .unwrap_or(0);
        if allowed <= 0 {
            return true;
        }
    }
    false
}

pub struct ScaleDownPlanner {
    options: AutoscalingOptions,
    orchestrator: Arc<dyn OrchestratorClient>,
    provider: Arc<dyn ProviderClient>,

    /// First time each node was observed unneeded; entries disappear as
    /// soon as the node stops being unneeded.
    unneeded_since: BTreeMap<String, DateTime<Utc>>,
    unremovable: BTreeMap<String, UnremovableReason>,
    utilization: BTreeMap<String, f64>,
    tracker: NodeDeletionTracker,
}

impl ScaleDownPlanner {
    pub fn new(
        options: AutoscalingOptions,
        orchestrator: Arc<dyn OrchestratorClient>,
        provider: Arc<dyn ProviderClient>,
    ) -> Self {
        Self {
            options,
            orchestrator,
            provider,
            unneeded_since: BTreeMap::new(),
            unremovable: BTreeMap::new(),
            utilization: BTreeMap::new(),
            tracker: NodeDeletionTracker::default(),
        }
    }

    pub fn tracker(&self) -> &NodeDeletionTracker {
        &self.tracker
    }

    pub fn unneeded_count(&self) -> usize {
        self.unneeded_since.len()
    }

    pub fn unremovable_reasons(&self) -> &BTreeMap<String, UnremovableReason> {
        &self.unremovable
    }

    pub fn utilization_map(&self) -> &BTreeMap<String, f64> {
        &self.utilization
    }

    /// Reset per-iteration observability maps.
    pub fn clean_up(&mut self, _now: DateTime<Utc>) {
        self.utilization.clear();
        self.unremovable.clear();
    }

    /// Forget all tentative scale-down state. Called when the cluster turns
    /// unhealthy so stale observations never justify a deletion.
    pub fn clean_up_unneeded_nodes(&mut self) {
        self.unneeded_since.clear();
    }

    /// Recompute which scale-down candidates are unneeded: utilization
    /// below the threshold and every workload placeable on some other
    /// pod-destination candidate without violating its disruption budget.
    pub fn update_unneeded_nodes(
        &mut self,
        pod_destinations: &[Node],
        candidates: &[Node],
        snapshot: &ClusterSnapshot,
        pdbs: &[PodDisruptionBudget],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut spare: BTreeMap<String, NodeResources> = BTreeMap::new();
        for node in pod_destinations {
            if is_being_deleted(node) {
                continue;
            }
            if let Some(info) = snapshot.get(node_name(node)) {
                let capacity = info.capacity();
                let requested = info.requested();
                spare.insert(
                    info.name().to_string(),
                    NodeResources {
                        millicores: (capacity.millicores - requested.millicores).max(0),
                        memory_bytes: (capacity.memory_bytes - requested.memory_bytes).max(0),
                    },
                );
            }
        }

        let mut currently_unneeded = BTreeSet::new();
        for node in candidates {
            let name = node_name(node).to_string();
            if !is_worker(node) || is_being_deleted(node) {
                continue;
            }
            let info = match snapshot.get(&name) {
                Some(info) => info,
                None => continue,
            };
            let capacity = info.capacity();
            if capacity.millicores == 0 || capacity.memory_bytes == 0 {
                continue;
            }

            let mut requested = NodeResources::default();
            for pod in info.pods() {
                if !is_daemon_set_pod(pod) {
                    requested.add(resource_requests(pod));
                }
            }
            let utilization = (requested.millicores as f64 / capacity.millicores as f64)
                .max(requested.memory_bytes as f64 / capacity.memory_bytes as f64);
            self.utilization.insert(name.clone(), utilization);

            if utilization >= self.options.scale_down_utilization_threshold {
                self.unremovable
                    .insert(name, UnremovableReason::NotUnderutilized);
                continue;
            }

            let mut blocking = None;
            for pod in info.pods() {
                if is_daemon_set_pod(pod) {
                    continue;
                }
                if blocked_by_disruption_budget(pod, pdbs) {
                    blocking = Some(UnremovableReason::BlockedByDisruptionBudget {
                        pod: pod_name(pod).to_string(),
                        namespace: pod_namespace(pod).to_string(),
                    });
                    break;
                }
                let requests = resource_requests(pod);
                let target = spare.iter_mut().find(|(dest, free)| {
                    dest.as_str() != name
                        && requests.millicores <= free.millicores
                        && requests.memory_bytes <= free.memory_bytes
                });
                match target {
                    Some((_, free)) => {
                        free.millicores -= requests.millicores;
                        free.memory_bytes -= requests.memory_bytes;
                    }
                    None => {
                        blocking = Some(UnremovableReason::NoPlaceToReschedule {
                            pod: pod_name(pod).to_string(),
                            namespace: pod_namespace(pod).to_string(),
                        });
                        break;
                    }
                }
            }

            if let Some(reason) = blocking {
                debug!(node = %name, %reason, "node is not scale-down eligible");
                self.unremovable.insert(name, reason);
                continue;
            }

            self.unneeded_since.entry(name.clone()).or_insert(now);
            currently_unneeded.insert(name);
        }

        // Stabilization entries vanish the moment a node stops being unneeded.
        self.unneeded_since
            .retain(|name, _| currently_unneeded.contains(name));
        Ok(())
    }

    /// Select nodes that have been unneeded long enough and hand them to
    /// the provider for deletion. Never takes the worker count below the
    /// configured minimum.
    pub async fn try_to_scale_down(
        &mut self,
        snapshot: &ClusterSnapshot,
        pdbs: &[PodDisruptionBudget],
        bounds: NodeGroupBounds,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ScaleDownStatus> {
        let mut status = ScaleDownStatus::default();
        status.utilization = self.utilization.clone();
        status.unremovable = self.unremovable.clone();

        if self.unneeded_since.is_empty() {
            status.outcome = ScaleDownOutcome::NoUnneeded;
            return Ok(status);
        }

        let worker_count = snapshot
            .node_infos()
            .filter(|info| is_worker(info.node()) && !is_being_deleted(info.node()))
            .count();
        let deletable = worker_count.saturating_sub(bounds.min_workers);
        if deletable == 0 {
            status.outcome = ScaleDownOutcome::NoNodesDeleted;
            return Ok(status);
        }
        let max_selectable = deletable.min(self.options.max_empty_bulk_delete);

        let unneeded_time = chrono::Duration::from_std(self.options.scale_down_unneeded_time)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let mut empty = Vec::new();
        let mut non_empty = Vec::new();
        for (name, since) in &self.unneeded_since {
            if now - *since < unneeded_time {
                status
                    .unremovable
                    .insert(name.clone(), UnremovableReason::NotUnneededLongEnough);
                continue;
            }
            let info = match snapshot.get(name) {
                Some(info) => info,
                None => continue,
            };
            let has_workloads = info.pods().iter().any(|pod| !is_daemon_set_pod(pod));
            if has_workloads {
                non_empty.push(name.clone());
            } else {
                empty.push(name.clone());
            }
        }

        if empty.is_empty() && non_empty.is_empty() {
            status.outcome = ScaleDownOutcome::NoNodesDeleted;
            return Ok(status);
        }

        let mut selection: Vec<String> = Vec::new();
        for name in empty {
            if selection.len() >= max_selectable {
                break;
            }
            selection.push(name);
        }
        let mut non_empty_selected = false;
        for name in non_empty {
            if selection.len() >= max_selectable {
                break;
            }
            let info = match snapshot.get(&name) {
                Some(info) => info,
                None => continue,
            };
            let blocked = info
                .pods()
                .iter()
                .find(|pod| !is_daemon_set_pod(pod) && blocked_by_disruption_budget(pod, pdbs));
            if let Some(pod) = blocked {
                status.unremovable.insert(
                    name,
                    UnremovableReason::BlockedByDisruptionBudget {
                        pod: pod_name(pod).to_string(),
                        namespace: pod_namespace(pod).to_string(),
                    },
                );
                continue;
            }
            selection.push(name);
            non_empty_selected = true;
        }

        if selection.is_empty() {
            status.outcome = ScaleDownOutcome::NoNodesDeleted;
            return Ok(status);
        }

        info!(nodes = ?selection, "starting scale down");
        for name in &selection {
            if let Some(info) = snapshot.get(name) {
                self.orchestrator
                    .apply_taint(info.node(), to_be_deleted_taint(now))
                    .await?;
            }
        }

        self.tracker.start(non_empty_selected);
        let outcome = scale_with_retry(
            self.provider.as_ref(),
            ScaleRequest::Down(selection.len()),
            cancel,
        )
        .await;

        match outcome {
            Err(err) => {
                self.tracker.finish();
                Err(err)
            }
            Ok(PollOutcome::Cancelled) => {
                // The provider keeps working; report progress and let a
                // later iteration observe the result.
                status.outcome = ScaleDownOutcome::InProgress;
                Ok(status)
            }
            Ok(_) => {
                self.tracker.finish();
                for name in &selection {
                    self.unneeded_since.remove(name);
                }
                status.nodes_deleted = selection;
                status.outcome = ScaleDownOutcome::NodeDeleteStarted;
                Ok(status)
            }
        }
    }

    /// Apply the deletion-candidate soft taint to unneeded nodes, up to the
    /// configured cap. Observational only; nothing is deleted.
    pub async fn soft_taint_unneeded_nodes(
        &self,
        all_nodes: &[Node],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut applied = 0;
        for node in all_nodes {
            if applied >= self.options.max_bulk_soft_taint_count {
                break;
            }
            let name = node_name(node);
            if !self.unneeded_since.contains_key(name) {
                continue;
            }
            if has_taint(node, DELETION_CANDIDATE_TAINT) {
                continue;
            }
            self.orchestrator
                .apply_taint(node, deletion_candidate_taint(now))
                .await?;
            applied += 1;
        }
        if applied > 0 {
            info!(applied, "soft-tainted unneeded nodes");
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use k8s_openapi::api::apps::v1::{DaemonSet, ReplicaSet, ReplicaSetStatus};
    use k8s_openapi::api::core::v1::{Container, NodeStatus, PodSpec, ResourceRequirements, Taint};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use std::sync::Mutex;
    use stratus_domain::ports::ProviderScalingStatus;

    fn worker(name: &str, cpu: &str, memory: &str) -> Node {
        use k8s_openapi::api::core::v1::NodeCondition;
        let mut capacity = std::collections::BTreeMap::new();
        capacity.insert("cpu".to_string(), Quantity(cpu.to_string()));
        capacity.insert("memory".to_string(), Quantity(memory.to_string()));
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                allocatable: Some(capacity),
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_on(name: &str, node: &str, cpu: &str, memory: &str) -> Pod {
        let mut requests = std::collections::BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity(cpu.to_string()));
        requests.insert("memory".to_string(), Quantity(memory.to_string()));
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                containers: vec![Container {
                    name: "main".to_string(),
                    resources: Some(ResourceRequirements {
                        requests: Some(requests),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn owned_by_replica_set(mut pod: Pod, rs_name: &str) -> Pod {
        pod.metadata.owner_references = Some(vec![OwnerReference {
            kind: "ReplicaSet".to_string(),
            name: rs_name.to_string(),
            api_version: "apps/v1".to_string(),
            uid: "rs-uid".to_string(),
            ..Default::default()
        }]);
        pod
    }

    #[derive(Default)]
    struct FakeOrchestrator {
        pods: Vec<Pod>,
        replica_sets: std::collections::BTreeMap<String, i32>,
        taints: Mutex<Vec<(String, Taint)>>,
    }

    #[async_trait]
    impl OrchestratorClient for FakeOrchestrator {
        async fn list_all_nodes(&self) -> Result<Vec<Node>> {
            Ok(Vec::new())
        }
        async fn list_ready_nodes(&self) -> Result<Vec<Node>> {
            Ok(Vec::new())
        }
        async fn list_scheduled_pods(&self) -> Result<Vec<Pod>> {
            Ok(Vec::new())
        }
        async fn list_unschedulable_pods(&self) -> Result<Vec<Pod>> {
            Ok(Vec::new())
        }
        async fn list_all_pods(&self) -> Result<Vec<Pod>> {
            Ok(self.pods.clone())
        }
        async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>> {
            Ok(Vec::new())
        }
        async fn list_pod_disruption_budgets(&self) -> Result<Vec<PodDisruptionBudget>> {
            Ok(Vec::new())
        }
        async fn get_replica_set(
            &self,
            _namespace: &str,
            name: &str,
        ) -> Result<Option<ReplicaSet>> {
            Ok(self.replica_sets.get(name).map(|replicas| ReplicaSet {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                status: Some(ReplicaSetStatus {
                    replicas: *replicas,
                    ..Default::default()
                }),
                ..Default::default()
            }))
        }
        async fn apply_taint(&self, node: &Node, taint: Taint) -> Result<()> {
            self.taints
                .lock()
                .unwrap()
                .push((node_name(node).to_string(), taint));
            Ok(())
        }
        async fn remove_taint(&self, _node: &Node, _taint_key: &str) -> Result<()> {
            Ok(())
        }
        async fn emit_pod_event(
            &self,
            _pod: &Pod,
            _event_type: &str,
            _reason: &str,
            _message: &str,
        ) -> Result<()> {
            Ok(())
        }
        async fn emit_cluster_event(&self, _reason: &str, _message: &str) -> Result<()> {
            Ok(())
        }
        async fn latest_pod_event_message(&self, _pod: &Pod) -> Result<Option<String>> {
            Ok(None)
        }
    }

    struct HappyProvider;

    #[async_trait]
    impl ProviderClient for HappyProvider {
        async fn scale_up(&self, _count: usize) -> Result<()> {
            Ok(())
        }
        async fn scale_down(&self, _count: usize) -> Result<()> {
            Ok(())
        }
        async fn status(&self) -> Result<ProviderScalingStatus> {
            Ok(ProviderScalingStatus::Succeeded)
        }
        async fn error_status(&self) -> Result<bool> {
            Ok(false)
        }
    }

    fn planner(orchestrator: Arc<FakeOrchestrator>) -> ScaleDownPlanner {
        let mut options = AutoscalingOptions::default();
        options.scale_down_unneeded_time = std::time::Duration::from_secs(600);
        options.max_empty_bulk_delete = 10;
        ScaleDownPlanner::new(options, orchestrator, Arc::new(HappyProvider))
    }

    fn snapshot_of(nodes: Vec<(Node, Vec<Pod>)>) -> ClusterSnapshot {
        let mut snapshot = ClusterSnapshot::new();
        for (node, pods) in nodes {
            snapshot.add_node_with_pods(node, pods).unwrap();
        }
        snapshot
    }

    #[tokio::test]
    async fn single_replica_blocks_removal() {
        let pod = owned_by_replica_set(pod_on("app", "cluster-worker3", "100m", "64Mi"), "app-rs");
        let mut orchestrator = FakeOrchestrator::default();
        orchestrator.pods = vec![pod];
        orchestrator.replica_sets.insert("app-rs".to_string(), 1);

        let verdict = can_remove_worker_node(&orchestrator, "cluster-worker3")
            .await
            .unwrap();
        assert!(!verdict.can_remove);
        assert!(matches!(
            verdict.reasons[0],
            UnremovableReason::SingleReplica { .. }
        ));
    }

    #[tokio::test]
    async fn local_storage_blocks_removal() {
        use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, Volume};
        let mut pod =
            owned_by_replica_set(pod_on("cache", "cluster-worker2", "100m", "64Mi"), "cache-rs");
        pod.spec.as_mut().unwrap().volumes = Some(vec![Volume {
            name: "scratch".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }]);
        let mut orchestrator = FakeOrchestrator::default();
        orchestrator.pods = vec![pod];
        orchestrator.replica_sets.insert("cache-rs".to_string(), 3);

        let verdict = can_remove_worker_node(&orchestrator, "cluster-worker2")
            .await
            .unwrap();
        assert!(!verdict.can_remove);
        assert!(matches!(
            verdict.reasons[0],
            UnremovableReason::LocalStorage { .. }
        ));
    }

    #[tokio::test]
    async fn unowned_pods_do_not_block_removal() {
        let pod = pod_on("orphan", "cluster-worker1", "100m", "64Mi");
        let mut orchestrator = FakeOrchestrator::default();
        orchestrator.pods = vec![pod];

        let verdict = can_remove_worker_node(&orchestrator, "cluster-worker1")
            .await
            .unwrap();
        assert!(verdict.can_remove);
    }

    #[tokio::test(start_paused = true)]
    async fn underutilized_nodes_become_unneeded_after_stabilization() {
        let orchestrator = Arc::new(FakeOrchestrator::default());
        let mut planner = planner(orchestrator.clone());

        let idle = worker("cluster-worker2", "4", "8Gi");
        let busy = worker("cluster-worker1", "4", "8Gi");
        let snapshot = snapshot_of(vec![
            (busy.clone(), vec![pod_on("app", "cluster-worker1", "3", "6Gi")]),
            (idle.clone(), vec![]),
        ]);
        let nodes = vec![busy, idle];

        let t0 = Utc::now();
        planner
            .update_unneeded_nodes(&nodes, &nodes, &snapshot, &[], t0)
            .unwrap();
        assert_eq!(planner.unneeded_count(), 1);

        // Not stabilized yet: nothing deleted.
        let cancel = CancellationToken::new();
        let bounds = NodeGroupBounds {
            min_workers: 1,
            max_workers: 10,
        };
        let status = planner
            .try_to_scale_down(&snapshot, &[], bounds, t0, &cancel)
            .await
            .unwrap();
        assert_eq!(status.outcome, ScaleDownOutcome::NoNodesDeleted);
        assert!(matches!(
            status.unremovable.get("cluster-worker2"),
            Some(UnremovableReason::NotUnneededLongEnough)
        ));

        // After the stabilization window the idle node goes.
        let t1 = t0 + chrono::Duration::seconds(601);
        let status = planner
            .try_to_scale_down(&snapshot, &[], bounds, t1, &cancel)
            .await
            .unwrap();
        assert_eq!(status.outcome, ScaleDownOutcome::NodeDeleteStarted);
        assert_eq!(status.nodes_deleted, vec!["cluster-worker2".to_string()]);

        let taints = orchestrator.taints.lock().unwrap();
        assert_eq!(taints.len(), 1);
        assert_eq!(taints[0].0, "cluster-worker2");
        assert_eq!(taints[0].1.key, stratus_domain::node::TO_BE_DELETED_TAINT);
    }

    #[tokio::test]
    async fn busy_node_is_not_unneeded() {
        let orchestrator = Arc::new(FakeOrchestrator::default());
        let mut planner = planner(orchestrator);

        let busy = worker("cluster-worker1", "4", "8Gi");
        let snapshot = snapshot_of(vec![(
            busy.clone(),
            vec![pod_on("app", "cluster-worker1", "3", "6Gi")],
        )]);
        let nodes = vec![busy];

        planner
            .update_unneeded_nodes(&nodes, &nodes, &snapshot, &[], Utc::now())
            .unwrap();
        assert_eq!(planner.unneeded_count(), 0);
        assert!(matches!(
            planner.unremovable_reasons().get("cluster-worker1"),
            Some(UnremovableReason::NotUnderutilized)
        ));
    }

    #[tokio::test]
    async fn pdb_blocks_rescheduling() {
        use k8s_openapi::api::policy::v1::{PodDisruptionBudgetSpec, PodDisruptionBudgetStatus};
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

        let orchestrator = Arc::new(FakeOrchestrator::default());
        let mut planner = planner(orchestrator);

        let mut guarded = pod_on("guarded", "cluster-worker2", "100m", "64Mi");
        guarded.metadata.labels = Some(
            [("app".to_string(), "guarded".to_string())]
                .into_iter()
                .collect(),
        );
        let pdb = PodDisruptionBudget {
            metadata: ObjectMeta {
                name: Some("guarded-pdb".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodDisruptionBudgetSpec {
                selector: Some(LabelSelector {
                    match_labels: Some(
                        [("app".to_string(), "guarded".to_string())]
                            .into_iter()
                            .collect(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PodDisruptionBudgetStatus {
                disruptions_allowed: 0,
                ..Default::default()
            }),
        };

        let lightly_loaded = worker("cluster-worker2", "4", "8Gi");
        let spare = worker("cluster-worker1", "4", "8Gi");
        let snapshot = snapshot_of(vec![
            (spare.clone(), vec![]),
            (lightly_loaded.clone(), vec![guarded]),
        ]);
        let nodes = vec![spare, lightly_loaded];

        planner
            .update_unneeded_nodes(&nodes, &nodes, &snapshot, &[pdb], Utc::now())
            .unwrap();
        assert!(matches!(
            planner.unremovable_reasons().get("cluster-worker2"),
            Some(UnremovableReason::BlockedByDisruptionBudget { .. })
        ));
    }

    #[tokio::test]
    async fn soft_taint_respects_the_cap() {
        let orchestrator = Arc::new(FakeOrchestrator::default());
        let mut options = AutoscalingOptions::default();
        options.max_bulk_soft_taint_count = 1;
        let mut planner =
            ScaleDownPlanner::new(options, orchestrator.clone(), Arc::new(HappyProvider));

        let idle1 = worker("cluster-worker1", "4", "8Gi");
        let idle2 = worker("cluster-worker2", "4", "8Gi");
        let snapshot = snapshot_of(vec![(idle1.clone(), vec![]), (idle2.clone(), vec![])]);
        let nodes = vec![idle1, idle2];

        let now = Utc::now();
        planner
            .update_unneeded_nodes(&nodes, &nodes, &snapshot, &[], now)
            .unwrap();
        assert_eq!(planner.unneeded_count(), 2);

        let applied = planner.soft_taint_unneeded_nodes(&nodes, now).await.unwrap();
        assert_eq!(applied, 1);
        let taints = orchestrator.taints.lock().unwrap();
        assert_eq!(taints.len(), 1);
        assert_eq!(taints[0].1.key, DELETION_CANDIDATE_TAINT);
    }
}
