//! Cluster-resident configuration artifacts.
//!
//! The node-group bounds live in a configmap and the provider credentials in
//! a secret, both in the configured namespace. They are re-read at the top
//! of every iteration so operators can retune bounds without restarting the
//! autoscaler.

use serde::{Deserialize, Serialize};

/// Name of the configmap carrying the node-group bounds.
pub const AUTOSCALING_CONFIG_MAP: &str = "autoscaling-configmap";
/// Configmap key for the minimum worker count, base-10.
pub const MIN_NODE_GROUP_SIZE_KEY: &str = "min_node_group_size";
/// Configmap key for the maximum worker count, base-10.
pub const MAX_NODE_GROUP_SIZE_KEY: &str = "max_node_group_size";

/// Name of the secret carrying the provider credentials.
pub const CREDENTIALS_SECRET: &str = "fke-secret";
pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const VPC_ID_KEY: &str = "vpc_id";
pub const CLUSTER_ID_KEY: &str = "cluster_id";

/// Administrator-declared worker-count band, re-read every iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupBounds {
    pub min_workers: usize,
    pub max_workers: usize,
}

impl NodeGroupBounds {
    pub fn contains(&self, worker_count: usize) -> bool {
        worker_count >= self.min_workers && worker_count <= self.max_workers
    }
}

/// Credentials for the provider control-plane API.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderCredentials {
    pub access_token: String,
    pub vpc_id: String,
    pub cluster_id: String,
}

// Manual Debug so the bearer token never lands in logs.
impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("access_token", &"<redacted>")
            .field("vpc_id", &self.vpc_id)
            .field("cluster_id", &self.cluster_id)
            .finish()
    }
}
