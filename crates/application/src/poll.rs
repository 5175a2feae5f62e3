//! Cooperative waits on the provider control plane.
//!
//! Provider operations take minutes. The planners submit a request and then
//! poll the status endpoint on a fixed cadence until the provider reports a
//! terminal state; an ERROR status is retried exactly once. Every sleep
//! consults the cancellation token so the control task can be shut down
//! mid-poll; cancellation is surfaced as a non-error outcome.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stratus_domain::ports::{ProviderClient, ProviderScalingStatus};
use stratus_shared::error::Result;

/// Cadence of provider status polls.
pub const PROVIDER_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Succeeded,
    Errored,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleRequest {
    Up(usize),
    Down(usize),
}

async fn issue(provider: &dyn ProviderClient, request: ScaleRequest) -> Result<()> {
    match request {
        ScaleRequest::Up(count) => provider.scale_up(count).await,
        ScaleRequest::Down(count) => provider.scale_down(count).await,
    }
}

/// Poll until the provider reports SUCCEEDED or ERROR.
pub async fn wait_for_terminal_status(
    provider: &dyn ProviderClient,
    cancel: &CancellationToken,
) -> Result<PollOutcome> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
            _ = tokio::time::sleep(PROVIDER_POLL_INTERVAL) => {}
        }
        info!("cluster status is SCALING");
        if provider.status().await? == ProviderScalingStatus::Succeeded {
            info!("cluster status is SUCCEEDED");
            return Ok(PollOutcome::Succeeded);
        }
        if provider.error_status().await? {
            return Ok(PollOutcome::Errored);
        }
    }
}

/// Poll until the provider reports SUCCEEDED. Used after the single retry,
/// where a second ERROR no longer changes the plan.
async fn wait_until_succeeded(
    provider: &dyn ProviderClient,
    cancel: &CancellationToken,
) -> Result<PollOutcome> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
            _ = tokio::time::sleep(PROVIDER_POLL_INTERVAL) => {}
        }
        if provider.status().await? == ProviderScalingStatus::Succeeded {
            info!("cluster status is SUCCEEDED");
            return Ok(PollOutcome::Succeeded);
        }
    }
}

/// Submit a scaling request and wait for a terminal status, retrying the
/// request once if the provider reports ERROR.
pub async fn scale_with_retry(
    provider: &dyn ProviderClient,
    request: ScaleRequest,
    cancel: &CancellationToken,
) -> Result<PollOutcome> {
    issue(provider, request).await?;
    match wait_for_terminal_status(provider, cancel).await? {
        PollOutcome::Errored => {
            warn!(?request, "provider reported ERROR, retrying the request once");
            issue(provider, request).await?;
            wait_until_succeeded(provider, cancel).await
        }
        outcome => Ok(outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Provider fake scripted with a sequence of status answers.
    struct ScriptedProvider {
        statuses: Mutex<Vec<ProviderScalingStatus>>,
        errors: Mutex<Vec<bool>>,
        up_calls: AtomicUsize,
        down_calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(statuses: Vec<ProviderScalingStatus>, errors: Vec<bool>) -> Self {
            Self {
                statuses: Mutex::new(statuses),
                errors: Mutex::new(errors),
                up_calls: AtomicUsize::new(0),
                down_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        async fn scale_up(&self, _count: usize) -> Result<()> {
            self.up_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn scale_down(&self, _count: usize) -> Result<()> {
            self.down_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn status(&self) -> Result<ProviderScalingStatus> {
            let mut statuses = self.statuses.lock().unwrap();
            Ok(if statuses.is_empty() {
                ProviderScalingStatus::Succeeded
            } else {
                statuses.remove(0)
            })
        }

        async fn error_status(&self) -> Result<bool> {
            let mut errors = self.errors.lock().unwrap();
            Ok(if errors.is_empty() { false } else { errors.remove(0) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_retry() {
        let provider = ScriptedProvider::new(
            vec![ProviderScalingStatus::Scaling, ProviderScalingStatus::Succeeded],
            vec![false],
        );
        let cancel = CancellationToken::new();

        let outcome = scale_with_retry(&provider, ScaleRequest::Up(2), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Succeeded);
        assert_eq!(provider.up_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_status_triggers_exactly_one_retry() {
        let provider = ScriptedProvider::new(
            vec![
                ProviderScalingStatus::Scaling,
                ProviderScalingStatus::Succeeded,
            ],
            vec![true],
        );
        let cancel = CancellationToken::new();

        let outcome = scale_with_retry(&provider, ScaleRequest::Down(1), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Succeeded);
        assert_eq!(provider.down_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_wait() {
        let provider = ScriptedProvider::new(vec![ProviderScalingStatus::Scaling], vec![false]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = scale_with_retry(&provider, ScaleRequest::Up(1), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled);
    }
}
