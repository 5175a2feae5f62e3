//! REST client for the provider control plane.
//!
//! Endpoints derive from the environment tag; every call carries the
//! customer's bearer token. This client is the only component that mutates
//! the cluster's node count.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use stratus_domain::ports::{ProviderClient, ProviderScalingStatus};
use stratus_shared::credentials::ProviderCredentials;
use stratus_shared::error::{AutoscalerError, Result};
use stratus_shared::options::Environment;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct ScaleRequestBody {
    worker_count: usize,
}

#[derive(Debug, Deserialize)]
struct ClusterStatusBody {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ErrorStatusBody {
    error: bool,
}

pub struct RestProviderClient {
    http: reqwest::Client,
    base_url: String,
    credentials: ProviderCredentials,
}

impl RestProviderClient {
    pub fn new(environment: Environment, credentials: ProviderCredentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                AutoscalerError::configuration(format!("failed to build the provider client: {e}"))
            })?;
        Ok(Self {
            http,
            base_url: environment.api_domain().to_string(),
            credentials,
        })
    }

    fn endpoint(&self, operation: &str) -> String {
        format!(
            "{}/v1/vpc/{}/kubernetes/{}/{operation}",
            self.base_url, self.credentials.vpc_id, self.credentials.cluster_id
        )
    }

    async fn post_scale(&self, operation: &str, worker_count: usize) -> Result<()> {
        let url = self.endpoint(operation);
        debug!(%url, worker_count, "posting scaling request");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.credentials.access_token)
            .json(&ScaleRequestBody { worker_count })
            .send()
            .await
            .map_err(|e| AutoscalerError::cloud_provider(format!("{operation} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AutoscalerError::cloud_provider(format!(
                "{operation} returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, operation: &str) -> Result<T> {
        let url = self.endpoint(operation);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.credentials.access_token)
            .send()
            .await
            .map_err(|e| AutoscalerError::cloud_provider(format!("{operation} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AutoscalerError::cloud_provider(format!(
                "{operation} returned HTTP {}",
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| AutoscalerError::cloud_provider(format!("{operation} bad payload: {e}")))
    }
}

#[async_trait]
impl ProviderClient for RestProviderClient {
    async fn scale_up(&self, count: usize) -> Result<()> {
        self.post_scale("scale-up", count).await
    }

    async fn scale_down(&self, count: usize) -> Result<()> {
        self.post_scale("scale-down", count).await
    }

    async fn status(&self) -> Result<ProviderScalingStatus> {
        let body: ClusterStatusBody = self.get_json("status").await?;
        Ok(match body.status.as_str() {
            "SUCCEEDED" => ProviderScalingStatus::Succeeded,
            _ => ProviderScalingStatus::Scaling,
        })
    }

    async fn error_status(&self) -> Result<bool> {
        let body: ErrorStatusBody = self.get_json("error-status").await?;
        Ok(body.error)
    }
}
