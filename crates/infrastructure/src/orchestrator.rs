//! Kubernetes-backed orchestrator client.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{DaemonSet, ReplicaSet};
use k8s_openapi::api::core::v1::{Event, EventSource, Node, ObjectReference, Pod, Taint};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

use stratus_domain::node::{has_taint, is_ready, node_name, taints_with, taints_without};
use stratus_domain::ports::OrchestratorClient;
use stratus_domain::workload::{host_node, pod_name, pod_namespace};
use stratus_shared::error::{AutoscalerError, Result};

const EVENT_SOURCE_COMPONENT: &str = "stratus-autoscaler";

/// Orchestrator access through the cluster API server. Uses plain list
/// calls; the client keeps its own connection pool.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
    config_namespace: String,
}

impl KubeOrchestrator {
    pub fn new(client: Client, config_namespace: impl Into<String>) -> Self {
        Self {
            client,
            config_namespace: config_namespace.into(),
        }
    }

    fn api_err(context: &str, err: kube::Error) -> AutoscalerError {
        AutoscalerError::api_call(format!("{context}: {err}"))
    }

    /// Merge-patch body replacing a node's full taint list. Merge semantics
    /// mean an empty list clears every taint.
    fn build_taint_patch(taints: &[Taint]) -> serde_json::Value {
        json!({ "spec": { "taints": taints } })
    }

    async fn patch_taints(&self, node: &Node, taints: Vec<Taint>) -> Result<()> {
        let name = node_name(node);
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = Self::build_taint_patch(&taints);
        nodes
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Self::api_err("failed to patch node taints", e))?;
        Ok(())
    }

    fn pod_is_unschedulable(pod: &Pod) -> bool {
        let status = match pod.status.as_ref() {
            Some(status) => status,
            None => return false,
        };
        if status.phase.as_deref() != Some("Pending") {
            return false;
        }
        status
            .conditions
            .as_ref()
            .map(|conditions| {
                conditions.iter().any(|c| {
                    c.type_ == "PodScheduled"
                        && c.status == "False"
                        && c.reason.as_deref() == Some("Unschedulable")
                })
            })
            .unwrap_or(false)
    }

    fn pod_is_finished(pod: &Pod) -> bool {
        matches!(
            pod.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some("Succeeded") | Some("Failed")
        )
    }
}

#[async_trait]
impl OrchestratorClient for KubeOrchestrator {
    async fn list_all_nodes(&self) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| Self::api_err("failed to list nodes", e))?;
        Ok(list.items)
    }

    async fn list_ready_nodes(&self) -> Result<Vec<Node>> {
        Ok(self
            .list_all_nodes()
            .await?
            .into_iter()
            .filter(is_ready)
            .collect())
    }

    async fn list_scheduled_pods(&self) -> Result<Vec<Pod>> {
        Ok(self
            .list_all_pods()
            .await?
            .into_iter()
            .filter(|p| host_node(p).is_some() && !Self::pod_is_finished(p))
            .collect())
    }

    async fn list_unschedulable_pods(&self) -> Result<Vec<Pod>> {
        Ok(self
            .list_all_pods()
            .await?
            .into_iter()
            .filter(Self::pod_is_unschedulable)
            .collect())
    }

    async fn list_all_pods(&self) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods
            .list(&ListParams::default())
            .await
            .map_err(|e| Self::api_err("failed to list pods", e))?;
        Ok(list.items)
    }

    async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>> {
        let daemon_sets: Api<DaemonSet> = Api::all(self.client.clone());
        let list = daemon_sets
            .list(&ListParams::default())
            .await
            .map_err(|e| Self::api_err("failed to list daemon sets", e))?;
        Ok(list.items)
    }

    async fn list_pod_disruption_budgets(&self) -> Result<Vec<PodDisruptionBudget>> {
        let pdbs: Api<PodDisruptionBudget> = Api::all(self.client.clone());
        let list = pdbs
            .list(&ListParams::default())
            .await
            .map_err(|e| Self::api_err("failed to list pod disruption budgets", e))?;
        Ok(list.items)
    }

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>> {
        let replica_sets: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        replica_sets
            .get_opt(name)
            .await
            .map_err(|e| Self::api_err("failed to get replica set", e))
    }

    async fn apply_taint(&self, node: &Node, taint: Taint) -> Result<()> {
        debug!(node = node_name(node), taint = %taint.key, "applying taint");
        self.patch_taints(node, taints_with(node, taint)).await
    }

    async fn remove_taint(&self, node: &Node, taint_key: &str) -> Result<()> {
        if !has_taint(node, taint_key) {
            return Ok(());
        }
        debug!(node = node_name(node), taint = taint_key, "removing taint");
        self.patch_taints(node, taints_without(node, taint_key)).await
    }

    async fn emit_pod_event(
        &self,
        pod: &Pod,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let namespace = pod_namespace(pod);
        let now = Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                name: Some(format!("{}.{:x}", pod_name(pod), now.timestamp_nanos_opt().unwrap_or(0))),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                kind: Some("Pod".to_string()),
                name: pod.metadata.name.clone(),
                namespace: pod.metadata.namespace.clone(),
                uid: pod.metadata.uid.clone(),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some(event_type.to_string()),
            count: Some(1),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            source: Some(EventSource {
                component: Some(EVENT_SOURCE_COMPONENT.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        events
            .create(&PostParams::default(), &event)
            .await
            .map_err(|e| Self::api_err("failed to emit pod event", e))?;
        Ok(())
    }

    async fn emit_cluster_event(&self, reason: &str, message: &str) -> Result<()> {
        let now = Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                name: Some(format!(
                    "stratus-autoscaler.{:x}",
                    now.timestamp_nanos_opt().unwrap_or(0)
                )),
                namespace: Some(self.config_namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                kind: Some("ConfigMap".to_string()),
                name: Some("cluster-autoscaler-status".to_string()),
                namespace: Some(self.config_namespace.clone()),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some("Warning".to_string()),
            count: Some(1),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            source: Some(EventSource {
                component: Some(EVENT_SOURCE_COMPONENT.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let events: Api<Event> = Api::namespaced(self.client.clone(), &self.config_namespace);
        events
            .create(&PostParams::default(), &event)
            .await
            .map_err(|e| Self::api_err("failed to emit cluster event", e))?;
        Ok(())
    }

    async fn latest_pod_event_message(&self, pod: &Pod) -> Result<Option<String>> {
        let namespace = pod_namespace(pod);
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let params =
            ListParams::default().fields(&format!("involvedObject.name={}", pod_name(pod)));
        let list = events
            .list(&params)
            .await
            .map_err(|e| Self::api_err("failed to list pod events", e))?;
        Ok(list
            .items
            .into_iter()
            .max_by_key(|e| e.last_timestamp.as_ref().map(|t| t.0))
            .and_then(|e| e.message))
    }
}
