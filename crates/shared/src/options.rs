//! Static autoscaling options.
//!
//! These are resolved once at startup (flags/environment) and stay fixed for
//! the process lifetime, unlike the node-group bounds which are re-read from
//! the cluster every iteration.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deployment environment the provider control plane lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    /// Base URL of the provider control-plane API for this environment.
    pub fn api_domain(&self) -> &'static str {
        match self {
            Environment::Dev => "https://api.dev.stratuscloud.io",
            Environment::Staging => "https://api.staging.stratuscloud.io",
            Environment::Prod => "https://api.stratuscloud.io",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "dev" => Some(Environment::Dev),
            "staging" => Some(Environment::Staging),
            "prod" => Some(Environment::Prod),
            _ => None,
        }
    }
}

/// Validated settings for the autoscaler, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct AutoscalingOptions {
    /// Namespace holding the config, secret and status artifacts.
    pub config_namespace: String,
    /// Name of the status configmap written at the end of every iteration.
    pub status_config_map_name: String,
    /// Whether the status configmap is written at all.
    pub write_status_config_map: bool,

    /// Interval between control-loop iterations.
    pub scan_interval: Duration,
    /// Environment tag selecting the provider API endpoints.
    pub environment: Environment,

    /// Whether scale-down is considered at all.
    pub scale_down_enabled: bool,
    /// Utilization below which a node is a scale-down candidate.
    pub scale_down_utilization_threshold: f64,
    /// How long a node must stay unneeded before it may be deleted.
    pub scale_down_unneeded_time: Duration,
    pub scale_down_delay_after_add: Duration,
    pub scale_down_delay_after_delete: Duration,
    pub scale_down_delay_after_failure: Duration,
    /// Upper bound on nodes removed in one scale-down.
    pub max_empty_bulk_delete: usize,
    /// Upper bound on soft-tainted nodes; 0 disables bulk soft-tainting.
    pub max_bulk_soft_taint_count: usize,

    /// Pods younger than this are not considered for scale-up.
    pub new_pod_scale_up_delay: Duration,
    /// Pods with priority below the cutoff are expendable.
    pub expendable_pods_priority_cutoff: i32,

    /// Cluster health thresholds for the state registry.
    pub max_total_unready_percentage: f64,
    pub ok_total_unready_count: usize,
    /// How long a provisioning request may stay unfulfilled before the
    /// registry counts it as stale.
    pub max_node_provision_time: Duration,

    /// Taint keys ignored when comparing node templates.
    pub ignored_taints: BTreeSet<String>,
}

impl Default for AutoscalingOptions {
    fn default() -> Self {
        Self {
            config_namespace: "kube-system".to_string(),
            status_config_map_name: "cluster-autoscaler-status".to_string(),
            write_status_config_map: true,
            scan_interval: Duration::from_secs(10),
            environment: Environment::Dev,
            scale_down_enabled: true,
            scale_down_utilization_threshold: 0.5,
            scale_down_unneeded_time: Duration::from_secs(10 * 60),
            scale_down_delay_after_add: Duration::from_secs(10 * 60),
            scale_down_delay_after_delete: Duration::from_secs(0),
            scale_down_delay_after_failure: Duration::from_secs(3 * 60),
            max_empty_bulk_delete: 10,
            max_bulk_soft_taint_count: 10,
            new_pod_scale_up_delay: Duration::from_secs(0),
            expendable_pods_priority_cutoff: -10,
            max_total_unready_percentage: 45.0,
            ok_total_unready_count: 3,
            max_node_provision_time: Duration::from_secs(15 * 60),
            ignored_taints: BTreeSet::new(),
        }
    }
}

impl AutoscalingOptions {
    /// Override options from the process environment. Unset variables keep
    /// their defaults; unparseable values are reported as errors by the
    /// caller so startup can fail loudly.
    pub fn from_env() -> crate::error::Result<Self> {
        let mut options = Self::default();

        if let Ok(tag) = std::env::var("STRATUS_ENVIRONMENT") {
            options.environment = Environment::parse(&tag).ok_or_else(|| {
                crate::error::AutoscalerError::configuration(format!(
                    "unknown STRATUS_ENVIRONMENT {tag:?}, expected dev|staging|prod"
                ))
            })?;
        }
        if let Ok(name) = std::env::var("STRATUS_STATUS_CONFIGMAP") {
            options.status_config_map_name = name;
        }
        if let Ok(value) = std::env::var("STRATUS_SCAN_INTERVAL_SECS") {
            let secs: u64 = value.parse().map_err(|_| {
                crate::error::AutoscalerError::configuration(format!(
                    "STRATUS_SCAN_INTERVAL_SECS is not an integer: {value:?}"
                ))
            })?;
            options.scan_interval = Duration::from_secs(secs);
        }
        if let Ok(value) = std::env::var("STRATUS_SCALE_DOWN_ENABLED") {
            options.scale_down_enabled = value != "false";
        }

        Ok(options)
    }
}
