//! The reconciliation engine: one `run_once` call per scan interval,
//! binding bounds enforcement, snapshot construction, the planners and the
//! cooldown state machine.
//!
//! Known limitation: the bounds-enforcement block picks its scale-down
//! candidate by the `worker<count>` name suffix. Clusters whose workers
//! were renumbered by past scaling events may have no node with that
//! suffix, in which case the correction is skipped for the iteration.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stratus_domain::node::{
    cores_and_memory, find_worker_with_index, is_being_deleted, worker_names,
    DELETION_CANDIDATE_TAINT, TO_BE_DELETED_TAINT,
};
use stratus_domain::ports::{
    ConfigSource, ExpanderStrategy, OrchestratorClient, ProviderClient, ScaleDownNodeProcessor,
    ScaleDownStatusProcessor, ScaleUpStatusProcessor, StatusWriter,
};
use stratus_domain::registry::ClusterStateRegistry;
use stratus_domain::snapshot::ClusterSnapshot;
use stratus_domain::status::{ScaleDownOutcome, ScaleDownStatus, ScaleUpOutcome, ScaleUpStatus};
use stratus_domain::workload::{
    all_pods_are_new, clear_accelerator_requests, filter_out_expendable,
    filter_out_expendable_and_split, filter_out_young, host_node, nominated_node,
};
use stratus_shared::error::Result;
use stratus_shared::options::AutoscalingOptions;

use crate::poll::{scale_with_retry, PollOutcome, ScaleRequest};
use crate::scale_down::{can_remove_worker_node, ScaleDownPlanner};
use crate::scale_up::ScaleUpPlanner;

/// How old the oldest unschedulable pod must be before a scale-up starts.
const UNSCHEDULABLE_POD_TIME_BUFFER: Duration = Duration::from_secs(2);

/// Per-iteration callbacks the status processors may invoke.
#[derive(Debug, Default)]
pub struct ProcessorCallbacks {
    disable_scale_down_for_loop: bool,
    extra_values: BTreeMap<String, String>,
}

impl ProcessorCallbacks {
    fn reset(&mut self) {
        self.disable_scale_down_for_loop = false;
        self.extra_values.clear();
    }

    pub fn disable_scale_down_for_loop(&mut self) {
        self.disable_scale_down_for_loop = true;
    }

    pub fn set_extra_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extra_values.insert(key.into(), value.into());
    }

    pub fn get_extra_value(&self, key: &str) -> Option<&str> {
        self.extra_values.get(key).map(String::as_str)
    }
}

pub struct ReconcileEngine {
    options: AutoscalingOptions,
    orchestrator: Arc<dyn OrchestratorClient>,
    provider: Arc<dyn ProviderClient>,
    config_source: Arc<dyn ConfigSource>,
    status_writer: Arc<dyn StatusWriter>,
    node_processor: Arc<dyn ScaleDownNodeProcessor>,
    scale_up_processor: Option<Arc<dyn ScaleUpStatusProcessor>>,
    scale_down_processor: Option<Arc<dyn ScaleDownStatusProcessor>>,
    registry: Arc<ClusterStateRegistry>,

    scale_up_planner: ScaleUpPlanner,
    scale_down: ScaleDownPlanner,
    snapshot: ClusterSnapshot,
    callbacks: ProcessorCallbacks,

    last_scale_up_time: DateTime<Utc>,
    last_scale_down_delete_time: DateTime<Utc>,
    last_scale_down_fail_time: DateTime<Utc>,
    initialized: bool,
    cancel: CancellationToken,
}

impl ReconcileEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: AutoscalingOptions,
        orchestrator: Arc<dyn OrchestratorClient>,
        provider: Arc<dyn ProviderClient>,
        config_source: Arc<dyn ConfigSource>,
        status_writer: Arc<dyn StatusWriter>,
        expander: Arc<dyn ExpanderStrategy>,
        node_processor: Arc<dyn ScaleDownNodeProcessor>,
        scale_up_processor: Option<Arc<dyn ScaleUpStatusProcessor>>,
        scale_down_processor: Option<Arc<dyn ScaleDownStatusProcessor>>,
        registry: Arc<ClusterStateRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        let scale_up_planner = ScaleUpPlanner::new(
            Arc::clone(&provider),
            expander,
            options.ignored_taints.clone(),
        );
        let scale_down = ScaleDownPlanner::new(
            options.clone(),
            Arc::clone(&orchestrator),
            Arc::clone(&provider),
        );
        // Start outside the cooldown windows so the first correction is
        // never suppressed.
        let initial_scale_time = Utc::now() - chrono::Duration::hours(1);
        Self {
            options,
            orchestrator,
            provider,
            config_source,
            status_writer,
            node_processor,
            scale_up_processor,
            scale_down_processor,
            registry,
            scale_up_planner,
            scale_down,
            snapshot: ClusterSnapshot::new(),
            callbacks: ProcessorCallbacks::default(),
            last_scale_up_time: initial_scale_time,
            last_scale_down_delete_time: initial_scale_time,
            last_scale_down_fail_time: initial_scale_time,
            initialized: false,
            cancel,
        }
    }

    /// Start background components (the registry cleaner).
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        self.registry.start()
    }

    pub fn last_scale_up_time(&self) -> DateTime<Utc> {
        self.last_scale_up_time
    }

    pub fn last_scale_down_delete_time(&self) -> DateTime<Utc> {
        self.last_scale_down_delete_time
    }

    pub fn last_scale_down_fail_time(&self) -> DateTime<Utc> {
        self.last_scale_down_fail_time
    }

    /// One reconciliation pass. Idempotent at convergence: with the cluster
    /// inside its bounds and nothing unschedulable, the only external
    /// effect is the status write.
    pub async fn run_once(&mut self, now: DateTime<Utc>) -> Result<()> {
        let mut scale_up_status = ScaleUpStatus::default();
        let mut scale_down_status = ScaleDownStatus::default();
        let mut scale_up_reported = false;
        let mut scale_down_reported = false;

        let result = self
            .iteration(
                now,
                &mut scale_up_status,
                &mut scale_down_status,
                &mut scale_up_reported,
                &mut scale_down_reported,
            )
            .await;

        // Deferred status write and processor invocation run on every exit
        // path, including early returns and errors.
        if self.options.write_status_config_map {
            let status = self.registry.get_status(now);
            if let Err(err) = self.status_writer.write(&status.readable_string()).await {
                warn!(%err, "failed to write the status configmap");
            }
        }
        if !scale_up_reported {
            if let Some(processor) = &self.scale_up_processor {
                processor.process(&scale_up_status).await;
            }
        }
        if !scale_down_reported {
            for (name, reason) in self.scale_down.unremovable_reasons() {
                scale_down_status
                    .unremovable
                    .entry(name.clone())
                    .or_insert_with(|| reason.clone());
            }
            scale_down_status.utilization = self.scale_down.utilization_map().clone();
            if let Some(processor) = &self.scale_down_processor {
                processor.process(&scale_down_status).await;
            }
        }

        result
    }

    /// Clean-ups at process exit: drop the status configmap and stop the
    /// registry cleaner.
    pub async fn exit_clean_up(&self) {
        if self.options.write_status_config_map {
            if let Err(err) = self.status_writer.delete().await {
                warn!(%err, "failed to delete the status configmap");
            }
        }
        self.registry.stop();
    }

    async fn iteration(
        &mut self,
        now: DateTime<Utc>,
        scale_up_status: &mut ScaleUpStatus,
        scale_down_status: &mut ScaleDownStatus,
        scale_up_reported: &mut bool,
        scale_down_reported: &mut bool,
    ) -> Result<()> {
        self.clean_up_if_required().await;
        self.callbacks.reset();
        self.registry.periodic_cleanup(now);

        debug!("starting main loop");

        let bounds = self.config_source.node_group_bounds().await?;
        let (all_nodes, _) = self.obtain_node_lists().await?;

        // Bounds enforcement runs before any planner.
        let names = worker_names(&all_nodes);
        let worker_count = names.len();
        if worker_count < bounds.min_workers {
            let count = bounds.min_workers - worker_count;
            info!(
                current = worker_count,
                min = bounds.min_workers,
                count,
                "worker count below minimum, scaling up"
            );
            let outcome =
                scale_with_retry(self.provider.as_ref(), ScaleRequest::Up(count), &self.cancel)
                    .await?;
            if outcome == PollOutcome::Cancelled {
                scale_up_status.outcome = ScaleUpOutcome::InProgress;
                return Ok(());
            }
            self.registry
                .register_scale_up_request(count, all_nodes.len(), now);
        } else if worker_count > bounds.max_workers {
            let count = worker_count - bounds.max_workers;
            match find_worker_with_index(&names, worker_count) {
                None => {
                    warn!(
                        index = worker_count,
                        "no worker carries the removal suffix, skipping the correction"
                    );
                    return Ok(());
                }
                Some(candidate) => {
                    let candidate = candidate.to_string();
                    info!(
                        current = worker_count,
                        max = bounds.max_workers,
                        count,
                        %candidate,
                        "worker count above maximum, scaling down"
                    );
                    let verdict =
                        can_remove_worker_node(self.orchestrator.as_ref(), &candidate).await?;
                    if !verdict.can_remove {
                        info!(%candidate, "cannot perform scale down action");
                        for reason in verdict.reasons {
                            scale_down_status.unremovable.insert(candidate.clone(), reason);
                        }
                        return Ok(());
                    }
                    // Only the suffix-selected node is predicate-checked;
                    // the provider chooses the rest when count > 1.
                    let outcome = scale_with_retry(
                        self.provider.as_ref(),
                        ScaleRequest::Down(count),
                        &self.cancel,
                    )
                    .await?;
                    if outcome == PollOutcome::Cancelled {
                        scale_down_status.outcome = ScaleDownOutcome::InProgress;
                        return Ok(());
                    }
                }
            }
        }

        // Re-list so everything below sees the converged count.
        let (all_nodes, ready_nodes) = self.obtain_node_lists().await?;
        update_cluster_metrics(&all_nodes);

        let scheduled_pods = self.orchestrator.list_scheduled_pods().await?;
        let daemon_sets = self.orchestrator.list_daemon_sets().await?;

        let scheduled_pods =
            filter_out_expendable(scheduled_pods, self.options.expendable_pods_priority_cutoff);

        self.snapshot.clear();
        let node_names: BTreeSet<String> = all_nodes
            .iter()
            .filter_map(|n| n.metadata.name.clone())
            .collect();
        for node in &all_nodes {
            self.snapshot
                .add_node(node.clone())
                .map_err(|e| e.add_prefix("initialize cluster snapshot"))?;
        }
        for pod in scheduled_pods {
            if let Some(host) = host_node(&pod).map(str::to_string) {
                if node_names.contains(&host) {
                    self.snapshot
                        .add_pod(pod, &host)
                        .map_err(|e| e.add_prefix("initialize cluster snapshot"))?;
                }
            }
        }

        self.registry.update_nodes(&all_nodes, now)?;
        if !self.registry.is_cluster_healthy() {
            warn!("cluster is not ready for autoscaling");
            self.scale_down.clean_up_unneeded_nodes();
            if let Err(err) = self
                .orchestrator
                .emit_cluster_event("ClusterUnhealthy", "Cluster is unhealthy")
                .await
            {
                warn!(%err, "failed to emit ClusterUnhealthy event");
            }
            return Ok(());
        }

        let unschedulable_pods = self.orchestrator.list_unschedulable_pods().await?;
        metrics::gauge!("unschedulable_pods_count").set(unschedulable_pods.len() as f64);
        let unschedulable_pods = clear_accelerator_requests(unschedulable_pods);

        // Pods waiting for a preemption have a nominated node; they do not
        // need new capacity but must block scale-down of that node.
        let (unschedulable_pods, awaiting_preemption) = filter_out_expendable_and_split(
            unschedulable_pods,
            &node_names,
            self.options.expendable_pods_priority_cutoff,
        );
        for pod in awaiting_preemption {
            let host = nominated_node(&pod)
                .map(str::to_string)
                .unwrap_or_default();
            self.snapshot
                .add_pod(pod, &host)
                .map_err(|e| e.add_prefix("pod waiting for preemption"))?;
        }

        let pods_to_help =
            filter_out_young(unschedulable_pods, now, self.options.new_pod_scale_up_delay);

        if pods_to_help.is_empty() {
            scale_up_status.outcome = ScaleUpOutcome::NotNeeded;
            info!("no unschedulable pods, no need to scale up");
        } else if all_pods_are_new(&pods_to_help, now, UNSCHEDULABLE_POD_TIME_BUFFER) {
            self.callbacks.disable_scale_down_for_loop();
            scale_up_status.outcome = ScaleUpOutcome::InCooldown;
            info!("unschedulable pods are very new, waiting one iteration for more");
        } else {
            info!(pods = pods_to_help.len(), "starting scale up");
            *scale_up_status = self
                .scale_up_planner
                .scale_up(
                    pods_to_help,
                    &ready_nodes,
                    &daemon_sets,
                    &self.registry,
                    all_nodes.len(),
                    now,
                    &self.cancel,
                )
                .await?;
            if let Some(processor) = &self.scale_up_processor {
                processor.process(scale_up_status).await;
                *scale_up_reported = true;
            }
            if scale_up_status.outcome == ScaleUpOutcome::Successful {
                self.last_scale_up_time = now;
                scale_down_status.outcome = ScaleDownOutcome::InCooldown;
                return Ok(());
            }
        }

        if self.options.scale_down_enabled {
            let pdbs = match self.orchestrator.list_pod_disruption_budgets().await {
                Ok(pdbs) => pdbs,
                Err(err) => {
                    scale_down_status.outcome = ScaleDownOutcome::Error;
                    return Err(err);
                }
            };

            debug!("calculating unneeded nodes");
            self.scale_down.clean_up(now);
            let candidates = self.node_processor.scale_down_candidates(&all_nodes);
            let destinations = self.node_processor.pod_destination_candidates(&all_nodes);
            if let Err(err) = self.scale_down.update_unneeded_nodes(
                &destinations,
                &candidates,
                &self.snapshot,
                &pdbs,
                now,
            ) {
                scale_down_status.outcome = ScaleDownOutcome::Error;
                return Err(err);
            }

            let in_cooldown = self.callbacks.disable_scale_down_for_loop
                || within(now, self.last_scale_up_time, self.options.scale_down_delay_after_add)
                || within(
                    now,
                    self.last_scale_down_fail_time,
                    self.options.scale_down_delay_after_failure,
                )
                || within(
                    now,
                    self.last_scale_down_delete_time,
                    self.options.scale_down_delay_after_delete,
                );
            metrics::gauge!("scale_down_in_cooldown").set(if in_cooldown { 1.0 } else { 0.0 });
            debug!(
                in_cooldown,
                last_scale_up = %self.last_scale_up_time,
                last_delete = %self.last_scale_down_delete_time,
                last_failure = %self.last_scale_down_fail_time,
                "scale down status"
            );

            if in_cooldown {
                // Utilization was still refreshed above; soft taints keep
                // flowing so the unneeded set stays observable.
                scale_down_status.outcome = ScaleDownOutcome::InCooldown;
                if self.options.max_bulk_soft_taint_count != 0 {
                    if let Err(err) =
                        self.scale_down.soft_taint_unneeded_nodes(&all_nodes, now).await
                    {
                        warn!(%err, "failed to soft-taint unneeded nodes");
                    }
                }
            } else if self
                .scale_down
                .tracker()
                .is_non_empty_node_delete_in_progress()
            {
                scale_down_status.outcome = ScaleDownOutcome::InProgress;
            } else {
                match self
                    .scale_down
                    .try_to_scale_down(&self.snapshot, &pdbs, bounds, now, &self.cancel)
                    .await
                {
                    Ok(status) => {
                        if status.outcome == ScaleDownOutcome::NodeDeleteStarted {
                            self.last_scale_down_delete_time = now;
                        }
                        if matches!(
                            status.outcome,
                            ScaleDownOutcome::NoNodesDeleted | ScaleDownOutcome::NoUnneeded
                        ) && self.options.max_bulk_soft_taint_count != 0
                        {
                            if let Err(err) =
                                self.scale_down.soft_taint_unneeded_nodes(&all_nodes, now).await
                            {
                                warn!(%err, "failed to soft-taint unneeded nodes");
                            }
                        }
                        *scale_down_status = status;
                        if let Some(processor) = &self.scale_down_processor {
                            processor.process(scale_down_status).await;
                            *scale_down_reported = true;
                        }
                    }
                    Err(err) => {
                        error!(%err, "failed to scale down");
                        self.last_scale_down_fail_time = now;
                        scale_down_status.outcome = ScaleDownOutcome::Error;
                        return Err(err);
                    }
                }
            }
        }

        Ok(())
    }

    /// Remove taints a previous process instance may have left behind.
    /// Runs once per process lifetime.
    async fn clean_up_if_required(&mut self) {
        if self.initialized {
            return;
        }
        match self.orchestrator.list_ready_nodes().await {
            Err(err) => {
                error!(%err, "failed to list ready nodes, not cleaning up taints");
            }
            Ok(ready_nodes) => {
                for node in &ready_nodes {
                    if let Err(err) = self
                        .orchestrator
                        .remove_taint(node, TO_BE_DELETED_TAINT)
                        .await
                    {
                        warn!(%err, "failed to clean deletion taint");
                    }
                    if self.options.max_bulk_soft_taint_count == 0 {
                        if let Err(err) = self
                            .orchestrator
                            .remove_taint(node, DELETION_CANDIDATE_TAINT)
                            .await
                        {
                            warn!(%err, "failed to clean deletion-candidate taint");
                        }
                    }
                }
            }
        }
        self.initialized = true;
    }

    async fn obtain_node_lists(&self) -> Result<(Vec<Node>, Vec<Node>)> {
        let all_nodes = self.orchestrator.list_all_nodes().await.map_err(|err| {
            error!(%err, "failed to list all nodes");
            err
        })?;
        let ready_nodes = self.orchestrator.list_ready_nodes().await.map_err(|err| {
            error!(%err, "failed to list ready nodes");
            err
        })?;
        Ok((all_nodes, ready_nodes))
    }
}

fn within(now: DateTime<Utc>, last: DateTime<Utc>, delay: Duration) -> bool {
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    last + delay > now
}

fn update_cluster_metrics(nodes: &[Node]) {
    let mut cores_total = 0;
    let mut memory_total = 0;
    for node in nodes {
        if is_being_deleted(node) {
            continue;
        }
        let (cores, memory) = cores_and_memory(node);
        cores_total += cores;
        memory_total += memory;
    }
    metrics::gauge!("cluster_cpu_current_cores").set(cores_total as f64);
    metrics::gauge!("cluster_memory_current_bytes").set(memory_total as f64);
}
