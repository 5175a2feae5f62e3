//! stratus-autoscaler binary.
//!
//! Wires the kube client, the provider REST client, the expander and the
//! reconciliation engine, then drives `run_once` at the configured scan
//! interval until a shutdown signal arrives.

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use stratus_application::engine::ReconcileEngine;
use stratus_application::expander::local_expander;
use stratus_domain::ports::{AllNodesProcessor, ConfigSource, ExpanderStrategy};
use stratus_domain::registry::{ClusterStateRegistry, ClusterStateRegistryConfig};
use stratus_infrastructure::artifacts::{KubeConfigSource, KubeStatusWriter};
use stratus_infrastructure::expander::GrpcExpander;
use stratus_infrastructure::orchestrator::KubeOrchestrator;
use stratus_infrastructure::processors::EventingScaleUpStatusProcessor;
use stratus_infrastructure::provider::RestProviderClient;
use stratus_shared::error::{AutoscalerError, Result};
use stratus_shared::options::AutoscalingOptions;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "autoscaler terminated");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let options = AutoscalingOptions::from_env()?;
    info!(environment = ?options.environment, "starting stratus autoscaler");

    let client = kube::Client::try_default().await.map_err(|e| {
        AutoscalerError::configuration(format!("failed to build the Kubernetes client: {e}"))
    })?;

    let config_source = Arc::new(KubeConfigSource::new(
        client.clone(),
        &options.config_namespace,
    ));
    // A missing secret means the deployment is broken; retrying is pointless.
    let credentials = config_source.provider_credentials().await?;
    let provider = Arc::new(RestProviderClient::new(options.environment, credentials)?);

    let orchestrator = Arc::new(KubeOrchestrator::new(
        client.clone(),
        &options.config_namespace,
    ));
    let status_writer = Arc::new(KubeStatusWriter::new(
        client,
        &options.config_namespace,
        &options.status_config_map_name,
    ));

    let expander: Arc<dyn ExpanderStrategy> = match std::env::var("STRATUS_EXPANDER_URL") {
        Ok(url) => {
            let cert_path = std::env::var("STRATUS_EXPANDER_CA_CERT").map_err(|_| {
                AutoscalerError::configuration(
                    "STRATUS_EXPANDER_CA_CERT must point at the expander CA certificate",
                )
            })?;
            let pem = std::fs::read(&cert_path).map_err(|e| {
                AutoscalerError::configuration(format!(
                    "failed to read the expander CA certificate at {cert_path}: {e}"
                ))
            })?;
            Arc::new(GrpcExpander::connect(&url, &pem).await?)
        }
        Err(_) => {
            let name =
                std::env::var("STRATUS_EXPANDER").unwrap_or_else(|_| "least-waste".to_string());
            Arc::from(local_expander(&name).ok_or_else(|| {
                AutoscalerError::configuration(format!("unknown expander strategy {name:?}"))
            })?)
        }
    };

    let registry = Arc::new(ClusterStateRegistry::new(ClusterStateRegistryConfig {
        max_total_unready_percentage: options.max_total_unready_percentage,
        ok_total_unready_count: options.ok_total_unready_count,
        max_node_provision_time: options.max_node_provision_time,
    }));

    let cancel = CancellationToken::new();
    let scan_interval = options.scan_interval;
    let mut engine = ReconcileEngine::new(
        options,
        orchestrator.clone(),
        provider,
        config_source,
        status_writer,
        expander,
        Arc::new(AllNodesProcessor),
        Some(Arc::new(EventingScaleUpStatusProcessor::new(orchestrator))),
        None,
        registry,
        cancel.clone(),
    );
    let cleaner = engine.start();

    let mut ticker = tokio::time::interval(scan_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                cancel.cancel();
                break;
            }
            _ = ticker.tick() => {}
        }
        if let Err(err) = engine.run_once(chrono::Utc::now()).await {
            if err.is_fatal() {
                engine.exit_clean_up().await;
                return Err(err);
            }
            // The next scheduled iteration starts fresh.
            error!(%err, "iteration failed");
        }
    }

    engine.exit_clean_up().await;
    cleaner.abort();
    Ok(())
}
