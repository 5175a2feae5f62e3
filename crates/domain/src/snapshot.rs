//! Per-iteration, in-memory model of the cluster used for placement
//! simulation.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Pod};

use stratus_shared::error::{AutoscalerError, Result};

use crate::node::{allocatable, node_name, NodeResources};
use crate::workload::resource_requests;

/// A node together with the workloads scheduled onto it.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    node: Node,
    pods: Vec<Pod>,
}

impl NodeInfo {
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn pods(&self) -> &[Pod] {
        &self.pods
    }

    pub fn name(&self) -> &str {
        node_name(&self.node)
    }

    pub fn capacity(&self) -> NodeResources {
        allocatable(&self.node)
    }

    /// Sum of the requests of every pod hosted here.
    pub fn requested(&self) -> NodeResources {
        let mut total = NodeResources::default();
        for pod in &self.pods {
            total.add(resource_requests(pod));
        }
        total
    }
}

/// Mapping from node name to the node and its scheduled workloads.
///
/// Cleared and rebuilt by the engine every iteration; single-writer within
/// an iteration, never shared across iterations. Every pod's recorded host
/// must be a node already in the snapshot.
#[derive(Debug, Default)]
pub struct ClusterSnapshot {
    nodes: BTreeMap<String, NodeInfo>,
}

impl ClusterSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn add_node(&mut self, node: Node) -> Result<()> {
        let name = node_name(&node).to_string();
        if name.is_empty() {
            return Err(AutoscalerError::internal("cannot add a nameless node"));
        }
        self.nodes.insert(name, NodeInfo { node, pods: Vec::new() });
        Ok(())
    }

    pub fn add_pod(&mut self, pod: Pod, node_name: &str) -> Result<()> {
        match self.nodes.get_mut(node_name) {
            Some(info) => {
                info.pods.push(pod);
                Ok(())
            }
            None => Err(AutoscalerError::internal(format!(
                "pod host {node_name} is not in the snapshot"
            ))),
        }
    }

    pub fn add_node_with_pods(&mut self, node: Node, pods: Vec<Pod>) -> Result<()> {
        let name = node_name(&node).to_string();
        self.add_node(node)?;
        for pod in pods {
            self.add_pod(pod, &name)?;
        }
        Ok(())
    }

    pub fn contains(&self, node_name: &str) -> bool {
        self.nodes.contains_key(node_name)
    }

    pub fn get(&self, node_name: &str) -> Option<&NodeInfo> {
        self.nodes.get(node_name)
    }

    pub fn node_infos(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
