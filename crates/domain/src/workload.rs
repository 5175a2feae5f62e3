//! Workload (pod) read helpers and the per-iteration filters applied before
//! planning.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::debug;

use crate::node::{parse_cpu_millis, parse_memory_bytes, NodeResources};

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("")
}

pub fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or("default")
}

pub fn creation_time(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

pub fn priority(pod: &Pod) -> i32 {
    pod.spec.as_ref().and_then(|s| s.priority).unwrap_or(0)
}

pub fn host_node(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
}

pub fn nominated_node(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|s| s.nominated_node_name.as_deref())
}

/// First owner reference, the controller that manages this pod. Pods with
/// no owner at all are unmanaged; callers treat them as not blocking
/// removal but log the fact.
pub fn first_owner(pod: &Pod) -> Option<&OwnerReference> {
    pod.metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.first())
}

pub fn is_daemon_set_pod(pod: &Pod) -> bool {
    first_owner(pod).map(|o| o.kind == "DaemonSet").unwrap_or(false)
}

/// Whether the pod mounts a local/ephemeral volume whose contents would be
/// lost with the node.
pub fn has_local_storage(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| volumes.iter().any(|v| v.empty_dir.is_some()))
        .unwrap_or(false)
}

/// Sum of the pod's container resource requests.
pub fn resource_requests(pod: &Pod) -> NodeResources {
    let mut total = NodeResources::default();
    let containers = match pod.spec.as_ref() {
        Some(spec) => &spec.containers,
        None => return total,
    };
    for container in containers {
        let requests = container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref());
        if let Some(requests) = requests {
            total.add(NodeResources {
                millicores: requests.get("cpu").map(parse_cpu_millis).unwrap_or(0),
                memory_bytes: requests.get("memory").map(parse_memory_bytes).unwrap_or(0),
            });
        }
    }
    total
}

/// Drop expendable pods: anything below the priority cutoff is ignored for
/// scale-up and may be preempted on scale-down.
pub fn filter_out_expendable(pods: Vec<Pod>, priority_cutoff: i32) -> Vec<Pod> {
    pods.into_iter()
        .filter(|pod| priority(pod) >= priority_cutoff)
        .collect()
}

/// Split non-expendable unschedulable pods into those that genuinely need
/// capacity and those waiting for a lower-priority preemption (they carry a
/// nominated node that exists). The latter do not trigger scale-up but are
/// placed into the snapshot so they block scale-down.
pub fn filter_out_expendable_and_split(
    pods: Vec<Pod>,
    node_names: &BTreeSet<String>,
    priority_cutoff: i32,
) -> (Vec<Pod>, Vec<Pod>) {
    let mut unschedulable = Vec::new();
    let mut awaiting_preemption = Vec::new();
    for pod in pods {
        if priority(&pod) < priority_cutoff {
            continue;
        }
        match nominated_node(&pod) {
            Some(node) if node_names.contains(node) => awaiting_preemption.push(pod),
            _ => unschedulable.push(pod),
        }
    }
    (unschedulable, awaiting_preemption)
}

/// Pods younger than the delay are not considered unschedulable yet; the
/// scheduler may still be working on them.
pub fn filter_out_young(pods: Vec<Pod>, now: DateTime<Utc>, delay: std::time::Duration) -> Vec<Pod> {
    let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::zero());
    pods.into_iter()
        .filter(|pod| match creation_time(pod) {
            Some(created) => {
                let age = now - created;
                if age > delay {
                    true
                } else {
                    debug!(
                        pod = pod_name(pod),
                        age_secs = age.num_seconds(),
                        "pod too new to consider unschedulable"
                    );
                    false
                }
            }
            None => true,
        })
        .collect()
}

pub fn oldest_creation_time(pods: &[Pod]) -> Option<DateTime<Utc>> {
    pods.iter().filter_map(creation_time).min()
}

/// True when every pod in the set was created within the buffer. More pods
/// are probably on their way, so it is worth waiting one iteration for a
/// better-informed decision.
pub fn all_pods_are_new(pods: &[Pod], now: DateTime<Utc>, buffer: std::time::Duration) -> bool {
    let buffer = Duration::from_std(buffer).unwrap_or_else(|_| Duration::zero());
    match oldest_creation_time(pods) {
        Some(oldest) => oldest + buffer > now,
        None => false,
    }
}

/// Strip accelerator resource requests (extended resources such as GPUs and
/// TPUs) so placement simulation only reasons about cpu and memory, which
/// is all the worker template offers.
pub fn clear_accelerator_requests(pods: Vec<Pod>) -> Vec<Pod> {
    pods.into_iter()
        .map(|mut pod| {
            if let Some(spec) = pod.spec.as_mut() {
                for container in spec.containers.iter_mut() {
                    if let Some(resources) = container.resources.as_mut() {
                        if let Some(requests) = resources.requests.as_mut() {
                            requests.retain(|key, _| !key.contains('/'));
                        }
                        if let Some(limits) = resources.limits.as_mut() {
                            limits.retain(|key, _| !key.contains('/'));
                        }
                    }
                }
            }
            pod
        })
        .collect()
}
