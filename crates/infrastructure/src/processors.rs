//! Status processors invoked after every iteration.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use stratus_domain::ports::{OrchestratorClient, ScaleUpStatusProcessor};
use stratus_domain::status::ScaleUpStatus;
use stratus_domain::workload::pod_name;

/// Emits a per-pod event describing whether the pod's scheduling failure
/// actually asked for more capacity: `TriggerScaleUp` when the latest
/// scheduler event mentions `Insufficient`, `NotTriggerScaleUp` otherwise.
pub struct EventingScaleUpStatusProcessor {
    orchestrator: Arc<dyn OrchestratorClient>,
}

impl EventingScaleUpStatusProcessor {
    pub fn new(orchestrator: Arc<dyn OrchestratorClient>) -> Self {
        Self { orchestrator }
    }

    fn triggers_scale_up(message: Option<&str>) -> bool {
        message.map(|m| m.contains("Insufficient")).unwrap_or(false)
    }
}

#[async_trait]
impl ScaleUpStatusProcessor for EventingScaleUpStatusProcessor {
    async fn process(&self, status: &ScaleUpStatus) {
        let affected = status
            .pods_remain_unschedulable
            .iter()
            .chain(status.pods_awaiting_capacity.iter());
        for pod in affected {
            let message = match self.orchestrator.latest_pod_event_message(pod).await {
                Ok(message) => message,
                Err(err) => {
                    warn!(pod = pod_name(pod), %err, "failed to list pod events");
                    continue;
                }
            };
            let (reason, text) = if Self::triggers_scale_up(message.as_deref()) {
                ("TriggerScaleUp", "pod triggered scale-up")
            } else {
                ("NotTriggerScaleUp", "pod didn't trigger scale-up")
            };
            if let Err(err) = self
                .orchestrator
                .emit_pod_event(pod, "Normal", reason, text)
                .await
            {
                warn!(pod = pod_name(pod), %err, "failed to emit scale-up event");
            }
        }
    }
}
