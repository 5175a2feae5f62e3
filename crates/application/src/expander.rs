//! Local expander strategies.
//!
//! Pure functions of the option list and the node templates backing them.
//! The remote gRPC strategy lives in the infrastructure layer; whatever the
//! strategy, the planner falls back to the first input option when the
//! ranking comes back empty.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use rand::seq::SliceRandom;
use tracing::warn;

use stratus_domain::node::allocatable;
use stratus_domain::ports::{ExpanderStrategy, ScaleUpOption};
use stratus_domain::workload::resource_requests;

/// Picks an option uniformly at random.
pub struct RandomExpander;

#[async_trait]
impl ExpanderStrategy for RandomExpander {
    async fn best_options(
        &self,
        options: Vec<ScaleUpOption>,
        _node_map: &BTreeMap<String, Node>,
    ) -> Vec<ScaleUpOption> {
        let mut rng = rand::thread_rng();
        options.choose(&mut rng).cloned().into_iter().collect()
    }

    fn name(&self) -> &str {
        "random"
    }
}

/// Prefers the option that helps the most pods.
pub struct MostPodsExpander;

#[async_trait]
impl ExpanderStrategy for MostPodsExpander {
    async fn best_options(
        &self,
        options: Vec<ScaleUpOption>,
        _node_map: &BTreeMap<String, Node>,
    ) -> Vec<ScaleUpOption> {
        options
            .into_iter()
            .max_by_key(|option| option.pods.len())
            .into_iter()
            .collect()
    }

    fn name(&self) -> &str {
        "most-pods"
    }
}

/// Prefers the option wasting the smallest fraction of the capacity it
/// would add.
pub struct LeastWasteExpander;

impl LeastWasteExpander {
    fn wasted_fraction(option: &ScaleUpOption, node_map: &BTreeMap<String, Node>) -> f64 {
        let template = match node_map.get(&option.node_group_id) {
            Some(node) => allocatable(node),
            None => return f64::MAX,
        };
        let added_millis = template.millicores * option.node_count as i64;
        let added_memory = template.memory_bytes * option.node_count as i64;
        if added_millis == 0 || added_memory == 0 {
            return f64::MAX;
        }

        let mut requested_millis = 0;
        let mut requested_memory = 0;
        for pod in &option.pods {
            let requests = resource_requests(pod);
            requested_millis += requests.millicores;
            requested_memory += requests.memory_bytes;
        }

        let cpu_waste = 1.0 - requested_millis as f64 / added_millis as f64;
        let memory_waste = 1.0 - requested_memory as f64 / added_memory as f64;
        (cpu_waste + memory_waste) / 2.0
    }
}

#[async_trait]
impl ExpanderStrategy for LeastWasteExpander {
    async fn best_options(
        &self,
        options: Vec<ScaleUpOption>,
        node_map: &BTreeMap<String, Node>,
    ) -> Vec<ScaleUpOption> {
        options
            .into_iter()
            .min_by(|a, b| {
                Self::wasted_fraction(a, node_map)
                    .total_cmp(&Self::wasted_fraction(b, node_map))
            })
            .into_iter()
            .collect()
    }

    fn name(&self) -> &str {
        "least-waste"
    }
}

/// Ranks options by an operator-supplied node-group priority table; higher
/// wins, unknown groups rank lowest.
pub struct PriorityExpander {
    priorities: BTreeMap<String, i32>,
}

impl PriorityExpander {
    pub fn new(priorities: BTreeMap<String, i32>) -> Self {
        Self { priorities }
    }
}

#[async_trait]
impl ExpanderStrategy for PriorityExpander {
    async fn best_options(
        &self,
        options: Vec<ScaleUpOption>,
        _node_map: &BTreeMap<String, Node>,
    ) -> Vec<ScaleUpOption> {
        options
            .into_iter()
            .max_by_key(|option| {
                self.priorities
                    .get(&option.node_group_id)
                    .copied()
                    .unwrap_or(i32::MIN)
            })
            .into_iter()
            .collect()
    }

    fn name(&self) -> &str {
        "priority"
    }
}

/// Resolve a local strategy by name; `None` for unknown names so startup
/// can fail loudly.
pub fn local_expander(name: &str) -> Option<Box<dyn ExpanderStrategy>> {
    match name {
        "random" => Some(Box::new(RandomExpander)),
        "most-pods" => Some(Box::new(MostPodsExpander)),
        "least-waste" => Some(Box::new(LeastWasteExpander)),
        "priority" => Some(Box::new(PriorityExpander::new(BTreeMap::new()))),
        other => {
            warn!(strategy = other, "unknown expander strategy");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(cpu: &str) -> Pod {
        let mut requests = std::collections::BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity(cpu.to_string()));
        requests.insert("memory".to_string(), Quantity("128Mi".to_string()));
        Pod {
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

    fn template_node(name: &str, cpu: &str, memory: &str) -> Node {
        use k8s_openapi::api::core::v1::NodeStatus;
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
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn option(group: &str, count: usize, pods: Vec<Pod>) -> ScaleUpOption {
        ScaleUpOption {
            node_group_id: group.to_string(),
            node_count: count,
            debug: String::new(),
            pods,
        }
    }

    #[tokio::test]
    async fn most_pods_picks_the_busiest_option() {
        let options = vec![
            option("a", 1, vec![pod("1")]),
            option("b", 1, vec![pod("1"), pod("1")]),
        ];
        let ranked = MostPodsExpander
            .best_options(options, &BTreeMap::new())
            .await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].node_group_id, "b");
    }

    #[tokio::test]
    async fn least_waste_prefers_tighter_fit() {
        let mut node_map = BTreeMap::new();
        node_map.insert("small".to_string(), template_node("small", "2", "4Gi"));
        node_map.insert("large".to_string(), template_node("large", "16", "64Gi"));

        let options = vec![
            option("small", 1, vec![pod("1500m")]),
            option("large", 1, vec![pod("1500m")]),
        ];
        let ranked = LeastWasteExpander.best_options(options, &node_map).await;
        assert_eq!(ranked[0].node_group_id, "small");
    }

    #[tokio::test]
    async fn priority_expander_uses_the_table() {
        let mut priorities = BTreeMap::new();
        priorities.insert("preferred".to_string(), 100);
        priorities.insert("fallback".to_string(), 1);
        let expander = PriorityExpander::new(priorities);

        let options = vec![
            option("fallback", 1, vec![]),
            option("preferred", 1, vec![]),
            option("unknown", 1, vec![]),
        ];
        let ranked = expander.best_options(options, &BTreeMap::new()).await;
        assert_eq!(ranked[0].node_group_id, "preferred");
    }

    #[tokio::test]
    async fn random_returns_one_of_the_inputs() {
        let options = vec![option("a", 1, vec![]), option("b", 2, vec![])];
        let ranked = RandomExpander.best_options(options, &BTreeMap::new()).await;
        assert_eq!(ranked.len(), 1);
        assert!(["a", "b"].contains(&ranked[0].node_group_id.as_str()));
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        assert!(local_expander("least-waste").is_some());
        assert!(local_expander("grpc").is_none());
    }
}
