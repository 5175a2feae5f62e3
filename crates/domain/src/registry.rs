//! Cross-iteration cluster state: per-node readiness transitions, in-flight
//! provisioning and the aggregate health verdict.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use tracing::{debug, info};

use stratus_shared::error::Result;

use crate::node::{is_ready, node_name};
use crate::status::{ClusterStateStatus, HealthVerdict};

/// Cadence of the background cleanup task started by [`ClusterStateRegistry::start`].
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClusterStateRegistryConfig {
    /// Above this unready percentage the cluster is unhealthy...
    pub max_total_unready_percentage: f64,
    /// ...unless no more than this many nodes are unready.
    pub ok_total_unready_count: usize,
    /// How long a provisioning request may stay unfulfilled before it is
    /// considered stale and dropped.
    pub max_node_provision_time: Duration,
}

impl Default for ClusterStateRegistryConfig {
    fn default() -> Self {
        Self {
            max_total_unready_percentage: 45.0,
            ok_total_unready_count: 3,
            max_node_provision_time: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct NodeTracking {
    ready: bool,
    first_observed: DateTime<Utc>,
    unready_since: Option<DateTime<Utc>>,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ProvisioningRequest {
    /// Registered node count the request should take the cluster to.
    target_count: usize,
    started: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<String, NodeTracking>,
    provisioning: Vec<ProvisioningRequest>,
    ready_count: usize,
    unready_count: usize,
    healthy: bool,
    last_update: Option<DateTime<Utc>>,
}

/// Registry of node state across iterations.
///
/// Shared between the control task and its background cleaner; all access
/// goes through one internal mutex and the lock is never held across an
/// await point.
pub struct ClusterStateRegistry {
    config: ClusterStateRegistryConfig,
    inner: Mutex<Inner>,
    stopped: AtomicBool,
}

impl ClusterStateRegistry {
    pub fn new(config: ClusterStateRegistryConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                healthy: true,
                ..Default::default()
            }),
            stopped: AtomicBool::new(false),
        }
    }

    // Readiness bookkeeping must survive a panicked holder; recover the
    // guard instead of propagating the poison.
    fn locked(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the background cleanup task. It runs until [`stop`] is called.
    ///
    /// [`stop`]: ClusterStateRegistry::stop
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if registry.stopped.load(Ordering::Relaxed) {
                    break;
                }
                registry.periodic_cleanup(Utc::now());
            }
            debug!("cluster state registry cleaner stopped");
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    /// Drop tracking entries for nodes that have not been listed recently
    /// and provisioning requests that overran the provision timeout.
    pub fn periodic_cleanup(&self, now: DateTime<Utc>) {
        let retention = chrono::Duration::from_std(self.config.max_node_provision_time)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let mut inner = self.locked();

        let before = inner.nodes.len();
        inner.nodes.retain(|_, tracking| now - tracking.last_seen < retention);
        let removed = before - inner.nodes.len();
        if removed > 0 {
            debug!(removed, "garbage-collected stale registry entries");
        }

        inner.provisioning.retain(|request| {
            let fresh = now - request.started < retention;
            if !fresh {
                info!(
                    target_count = request.target_count,
                    "dropping provisioning request that exceeded the provision timeout"
                );
            }
            fresh
        });
    }

    /// Fold the latest node listing into the registry and recompute the
    /// health verdict.
    pub fn update_nodes(&self, nodes: &[Node], now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.locked();

        let mut ready_count = 0;
        let mut unready_count = 0;
        for node in nodes {
            let name = node_name(node).to_string();
            if name.is_empty() {
                continue;
            }
            let ready = is_ready(node);
            if ready {
                ready_count += 1;
            } else {
                unready_count += 1;
            }
            match inner.nodes.entry(name) {
                std::collections::btree_map::Entry::Occupied(mut entry) => {
                    let tracking = entry.get_mut();
                    if ready {
                        tracking.unready_since = None;
                    } else if tracking.ready {
                        tracking.unready_since = Some(now);
                    }
                    tracking.ready = ready;
                    tracking.last_seen = now;
                }
                std::collections::btree_map::Entry::Vacant(entry) => {
                    entry.insert(NodeTracking {
                        ready,
                        first_observed: now,
                        unready_since: if ready { None } else { Some(now) },
                        last_seen: now,
                    });
                }
            }
        }

        // A provisioning request is fulfilled once the registered count
        // reaches its target.
        let registered = nodes.len();
        inner
            .provisioning
            .retain(|request| registered < request.target_count);

        inner.ready_count = ready_count;
        inner.unready_count = unready_count;
        inner.healthy = Self::verdict(&self.config, ready_count, unready_count)
            == HealthVerdict::Healthy;
        inner.last_update = Some(now);
        Ok(())
    }

    fn verdict(
        config: &ClusterStateRegistryConfig,
        ready_count: usize,
        unready_count: usize,
    ) -> HealthVerdict {
        let total = ready_count + unready_count;
        if total == 0 || unready_count <= config.ok_total_unready_count {
            return HealthVerdict::Healthy;
        }
        let unready_percentage = unready_count as f64 * 100.0 / total as f64;
        if unready_percentage > config.max_total_unready_percentage {
            HealthVerdict::Unhealthy
        } else {
            HealthVerdict::Healthy
        }
    }

    /// Record that a scale-up request for `count` nodes was submitted while
    /// `current_registered` nodes were known.
    pub fn register_scale_up_request(
        &self,
        count: usize,
        current_registered: usize,
        now: DateTime<Utc>,
    ) {
        let mut inner = self.locked();
        inner.provisioning.push(ProvisioningRequest {
            target_count: current_registered + count,
            started: now,
        });
    }

    /// Nodes requested from the provider that have not registered yet.
    pub fn get_upcoming_nodes(&self) -> usize {
        let inner = self.locked();
        let registered = inner.nodes.len();
        inner
            .provisioning
            .iter()
            .map(|request| request.target_count.saturating_sub(registered))
            .sum()
    }

    pub fn is_cluster_healthy(&self) -> bool {
        self.locked().healthy
    }

    /// When the registry last folded in a node listing.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.locked().last_update
    }

    pub fn get_status(&self, now: DateTime<Utc>) -> ClusterStateStatus {
        let inner = self.locked();
        let registered = inner.nodes.len();
        let upcoming = inner
            .provisioning
            .iter()
            .map(|request| request.target_count.saturating_sub(registered))
            .sum();
        ClusterStateStatus {
            verdict: if inner.healthy {
                HealthVerdict::Healthy
            } else {
                HealthVerdict::Unhealthy
            },
            ready_count: inner.ready_count,
            unready_count: inner.unready_count,
            registered_count: registered,
            upcoming_count: upcoming,
            timestamp: now,
        }
    }

    /// When a node first became unready, if it is currently unready.
    pub fn unready_since(&self, node_name: &str) -> Option<DateTime<Utc>> {
        let inner = self.locked();
        inner.nodes.get(node_name).and_then(|t| t.unready_since)
    }

    /// When a node was first observed by this process.
    pub fn first_observed(&self, node_name: &str) -> Option<DateTime<Utc>> {
        let inner = self.locked();
        inner.nodes.get(node_name).map(|t| t.first_observed)
    }
}
