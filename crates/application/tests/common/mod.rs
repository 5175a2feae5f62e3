//! Shared fakes for the engine scenario tests: an in-memory cluster whose
//! node set reacts to provider calls the way the real control plane does.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, ReplicaSet, ReplicaSetStatus};
use k8s_openapi::api::core::v1::{
    Container, Node, NodeCondition, NodeStatus, Pod, PodSpec, ResourceRequirements, Taint,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use tokio_util::sync::CancellationToken;

use stratus_application::engine::ReconcileEngine;
use stratus_domain::node::{is_ready, node_name};
use stratus_domain::ports::{
    AllNodesProcessor, ConfigSource, ExpanderStrategy, OrchestratorClient, ProviderClient,
    ProviderScalingStatus, ScaleDownStatusProcessor, ScaleUpOption, ScaleUpStatusProcessor,
    StatusWriter,
};
use stratus_domain::registry::{ClusterStateRegistry, ClusterStateRegistryConfig};
use stratus_domain::status::{ScaleDownOutcome, ScaleDownStatus, ScaleUpOutcome, ScaleUpStatus};
use stratus_domain::workload::host_node;
use stratus_shared::credentials::{NodeGroupBounds, ProviderCredentials};
use stratus_shared::error::Result;
use stratus_shared::options::AutoscalingOptions;

pub fn ready_worker(name: &str) -> Node {
    let mut capacity = BTreeMap::new();
    capacity.insert("cpu".to_string(), Quantity("4".to_string()));
    capacity.insert("memory".to_string(), Quantity("8Gi".to_string()));
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

pub fn pod(name: &str, cpu: &str, memory: &str, created: DateTime<Utc>) -> Pod {
    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity(cpu.to_string()));
    requests.insert("memory".to_string(), Quantity(memory.to_string()));
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            creation_timestamp: Some(Time(created)),
            ..Default::default()
        },
        spec: Some(PodSpec {
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

pub fn scheduled_on(mut pod: Pod, node: &str) -> Pod {
    pod.spec.as_mut().unwrap().node_name = Some(node.to_string());
    pod
}

pub fn owned_by_replica_set(mut pod: Pod, rs_name: &str) -> Pod {
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
pub struct ClusterState {
    pub nodes: Vec<Node>,
    pub pods: Vec<Pod>,
    pub replica_sets: BTreeMap<String, i32>,
    pub next_worker_index: usize,
}

impl ClusterState {
    pub fn with_workers(count: usize) -> Self {
        let mut state = Self::default();
        for index in 1..=count {
            state.nodes.push(ready_worker(&format!("cluster-worker{index}")));
        }
        state.next_worker_index = count + 1;
        state
    }

    pub fn worker_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| node_name(n).contains("worker"))
            .count()
    }
}

pub struct MockOrchestrator {
    pub state: Arc<Mutex<ClusterState>>,
    pub taints: Mutex<Vec<(String, Taint)>>,
    pub removed_taints: Mutex<Vec<(String, String)>>,
    pub pod_events: Mutex<Vec<(String, String, String)>>,
    pub cluster_events: Mutex<Vec<String>>,
    pub event_messages: Mutex<BTreeMap<String, String>>,
}

impl MockOrchestrator {
    pub fn new(state: Arc<Mutex<ClusterState>>) -> Self {
        Self {
            state,
            taints: Mutex::new(Vec::new()),
            removed_taints: Mutex::new(Vec::new()),
            pod_events: Mutex::new(Vec::new()),
            cluster_events: Mutex::new(Vec::new()),
            event_messages: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl OrchestratorClient for MockOrchestrator {
    async fn list_all_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn list_ready_nodes(&self) -> Result<Vec<Node>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .filter(|n| is_ready(n))
            .cloned()
            .collect())
    }

    async fn list_scheduled_pods(&self) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|p| host_node(p).is_some())
            .cloned()
            .collect())
    }

    async fn list_unschedulable_pods(&self) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|p| host_node(p).is_none())
            .cloned()
            .collect())
    }

    async fn list_all_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.state.lock().unwrap().pods.clone())
    }

    async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>> {
        Ok(Vec::new())
    }

    async fn list_pod_disruption_budgets(&self) -> Result<Vec<PodDisruptionBudget>> {
        Ok(Vec::new())
    }

    async fn get_replica_set(&self, _namespace: &str, name: &str) -> Result<Option<ReplicaSet>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .replica_sets
            .get(name)
            .map(|replicas| ReplicaSet {
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

    async fn remove_taint(&self, node: &Node, taint_key: &str) -> Result<()> {
        self.removed_taints
            .lock()
            .unwrap()
            .push((node_name(node).to_string(), taint_key.to_string()));
        Ok(())
    }

    async fn emit_pod_event(
        &self,
        pod: &Pod,
        event_type: &str,
        reason: &str,
        _message: &str,
    ) -> Result<()> {
        self.pod_events.lock().unwrap().push((
            pod.metadata.name.clone().unwrap_or_default(),
            event_type.to_string(),
            reason.to_string(),
        ));
        Ok(())
    }

    async fn emit_cluster_event(&self, reason: &str, _message: &str) -> Result<()> {
        self.cluster_events.lock().unwrap().push(reason.to_string());
        Ok(())
    }

    async fn latest_pod_event_message(&self, pod: &Pod) -> Result<Option<String>> {
        Ok(self
            .event_messages
            .lock()
            .unwrap()
            .get(pod.metadata.name.as_deref().unwrap_or_default())
            .cloned())
    }
}

/// Provider fake that applies scaling requests to the shared cluster state,
/// the way the real control plane eventually would.
pub struct MockProvider {
    pub state: Arc<Mutex<ClusterState>>,
    pub up_requests: Mutex<Vec<usize>>,
    pub down_requests: Mutex<Vec<usize>>,
}

impl MockProvider {
    pub fn new(state: Arc<Mutex<ClusterState>>) -> Self {
        Self {
            state,
            up_requests: Mutex::new(Vec::new()),
            down_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn total_requests(&self) -> usize {
        self.up_requests.lock().unwrap().len() + self.down_requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn scale_up(&self, count: usize) -> Result<()> {
        self.up_requests.lock().unwrap().push(count);
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            let index = state.next_worker_index;
            state.next_worker_index += 1;
            state.nodes.push(ready_worker(&format!("cluster-worker{index}")));
        }
        Ok(())
    }

    async fn scale_down(&self, count: usize) -> Result<()> {
        self.down_requests.lock().unwrap().push(count);
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            if let Some(position) = state
                .nodes
                .iter()
                .rposition(|n| node_name(n).contains("worker"))
            {
                state.nodes.remove(position);
            }
        }
        Ok(())
    }

    async fn status(&self) -> Result<ProviderScalingStatus> {
        Ok(ProviderScalingStatus::Succeeded)
    }

    async fn error_status(&self) -> Result<bool> {
        Ok(false)
    }
}

pub struct StaticConfigSource {
    pub bounds: NodeGroupBounds,
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn node_group_bounds(&self) -> Result<NodeGroupBounds> {
        Ok(self.bounds)
    }

    async fn provider_credentials(&self) -> Result<ProviderCredentials> {
        Ok(ProviderCredentials {
            access_token: "token".to_string(),
            vpc_id: "vpc".to_string(),
            cluster_id: "cluster".to_string(),
        })
    }
}

#[derive(Default)]
pub struct RecordingStatusWriter {
    pub writes: Mutex<Vec<String>>,
    pub deleted: AtomicBool,
}

#[async_trait]
impl StatusWriter for RecordingStatusWriter {
    async fn write(&self, body: &str) -> Result<()> {
        self.writes.lock().unwrap().push(body.to_string());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.deleted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Expander that endorses everything, in input order.
pub struct PassThroughExpander;

#[async_trait]
impl ExpanderStrategy for PassThroughExpander {
    async fn best_options(
        &self,
        options: Vec<ScaleUpOption>,
        _node_map: &BTreeMap<String, Node>,
    ) -> Vec<ScaleUpOption> {
        options
    }

    fn name(&self) -> &str {
        "pass-through"
    }
}

/// Expander that returns nothing, forcing the planner's local fallback.
pub struct EmptyExpander;

#[async_trait]
impl ExpanderStrategy for EmptyExpander {
    async fn best_options(
        &self,
        _options: Vec<ScaleUpOption>,
        _node_map: &BTreeMap<String, Node>,
    ) -> Vec<ScaleUpOption> {
        Vec::new()
    }

    fn name(&self) -> &str {
        "empty"
    }
}

#[derive(Default)]
pub struct RecordingScaleUpProcessor {
    pub outcomes: Mutex<Vec<ScaleUpOutcome>>,
}

#[async_trait]
impl ScaleUpStatusProcessor for RecordingScaleUpProcessor {
    async fn process(&self, status: &ScaleUpStatus) {
        self.outcomes.lock().unwrap().push(status.outcome);
    }
}

#[derive(Default)]
pub struct RecordingScaleDownProcessor {
    pub outcomes: Mutex<Vec<ScaleDownOutcome>>,
}

#[async_trait]
impl ScaleDownStatusProcessor for RecordingScaleDownProcessor {
    async fn process(&self, status: &ScaleDownStatus) {
        self.outcomes.lock().unwrap().push(status.outcome);
    }
}

pub struct Harness {
    pub engine: ReconcileEngine,
    pub state: Arc<Mutex<ClusterState>>,
    pub orchestrator: Arc<MockOrchestrator>,
    pub provider: Arc<MockProvider>,
    pub status_writer: Arc<RecordingStatusWriter>,
    pub scale_up_outcomes: Arc<RecordingScaleUpProcessor>,
    pub scale_down_outcomes: Arc<RecordingScaleDownProcessor>,
}

pub fn harness(state: ClusterState, bounds: NodeGroupBounds) -> Harness {
    harness_with(state, bounds, AutoscalingOptions::default(), Arc::new(PassThroughExpander))
}

pub fn harness_with(
    state: ClusterState,
    bounds: NodeGroupBounds,
    options: AutoscalingOptions,
    expander: Arc<dyn ExpanderStrategy>,
) -> Harness {
    let state = Arc::new(Mutex::new(state));
    let orchestrator = Arc::new(MockOrchestrator::new(Arc::clone(&state)));
    let provider = Arc::new(MockProvider::new(Arc::clone(&state)));
    let status_writer = Arc::new(RecordingStatusWriter::default());
    let scale_up_outcomes = Arc::new(RecordingScaleUpProcessor::default());
    let scale_down_outcomes = Arc::new(RecordingScaleDownProcessor::default());
    let registry = Arc::new(ClusterStateRegistry::new(ClusterStateRegistryConfig::default()));

    let engine = ReconcileEngine::new(
        options,
        orchestrator.clone(),
        provider.clone(),
        Arc::new(StaticConfigSource { bounds }),
        status_writer.clone(),
        expander,
        Arc::new(AllNodesProcessor),
        Some(scale_up_outcomes.clone()),
        Some(scale_down_outcomes.clone()),
        registry,
        CancellationToken::new(),
    );

    Harness {
        engine,
        state,
        orchestrator,
        provider,
        status_writer,
        scale_up_outcomes,
        scale_down_outcomes,
    }
}

pub fn seconds(value: i64) -> Duration {
    Duration::seconds(value)
}
