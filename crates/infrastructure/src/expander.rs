//! Remote expander strategy over gRPC.
//!
//! The call has a hard 5-second deadline and fails open: any timeout,
//! transport failure or empty answer leaves the option set unchanged.
//! Insecure endpoints are refused at startup.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use tokio::sync::Mutex;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tracing::{debug, warn};

use stratus_domain::node::allocatable;
use stratus_domain::ports::{ExpanderStrategy, ScaleUpOption};
use stratus_domain::workload::{pod_name, pod_namespace, resource_requests};
use stratus_proto::expander::expander_client::ExpanderClient;
use stratus_proto::expander::{BestOptionsRequest, ExpansionOption, NodeShape, Workload};
use stratus_shared::error::{AutoscalerError, Result};

/// Hard deadline on the ranking call.
const EXPANDER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// The wire call, separated from the deadline and sanitation handling so
/// those can be exercised against a hand-rolled transport.
#[async_trait]
trait RankingCall: Send + Sync {
    async fn best_options(
        &self,
        request: BestOptionsRequest,
    ) -> std::result::Result<stratus_proto::expander::BestOptionsResponse, tonic::Status>;
}

struct ChannelCall {
    client: Mutex<ExpanderClient<Channel>>,
}

#[async_trait]
impl RankingCall for ChannelCall {
    async fn best_options(
        &self,
        request: BestOptionsRequest,
    ) -> std::result::Result<stratus_proto::expander::BestOptionsResponse, tonic::Status> {
        let mut client = self.client.lock().await;
        client
            .best_options(request)
            .await
            .map(|response| response.into_inner())
    }
}

pub struct GrpcExpander {
    transport: Box<dyn RankingCall>,
}

impl std::fmt::Debug for GrpcExpander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcExpander").finish_non_exhaustive()
    }
}

impl GrpcExpander {
    /// Dial the ranking service. The endpoint must be TLS; a missing
    /// certificate or a non-https URL is a startup error.
    pub async fn connect(url: &str, ca_certificate_pem: &[u8]) -> Result<Self> {
        if !url.starts_with("https://") {
            return Err(AutoscalerError::configuration(
                "expander endpoint must use TLS, insecure connections are not allowed",
            ));
        }
        if ca_certificate_pem.is_empty() {
            return Err(AutoscalerError::configuration(
                "expander CA certificate not specified, insecure connections are not allowed",
            ));
        }
        let tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca_certificate_pem));
        let channel = Channel::from_shared(url.to_string())
            .map_err(|e| AutoscalerError::configuration(format!("bad expander endpoint: {e}")))?
            .tls_config(tls)
            .map_err(|e| AutoscalerError::configuration(format!("bad expander TLS config: {e}")))?
            .timeout(EXPANDER_TIMEOUT)
            .connect()
            .await
            .map_err(|e| {
                AutoscalerError::configuration(format!("failed to dial expander: {e}"))
            })?;
        Ok(Self {
            transport: Box::new(ChannelCall {
                client: Mutex::new(ExpanderClient::new(channel)),
            }),
        })
    }

    #[cfg(test)]
    fn with_transport(transport: Box<dyn RankingCall>) -> Self {
        Self { transport }
    }

    fn build_request(
        options: &[ScaleUpOption],
        node_map: &BTreeMap<String, Node>,
    ) -> BestOptionsRequest {
        let wire_options = options
            .iter()
            .map(|option| ExpansionOption {
                node_group_id: option.node_group_id.clone(),
                node_count: option.node_count as i32,
                debug: option.debug.clone(),
                pods: option
                    .pods
                    .iter()
                    .map(|pod| {
                        let requests = resource_requests(pod);
                        Workload {
                            name: pod_name(pod).to_string(),
                            namespace: pod_namespace(pod).to_string(),
                            millicores: requests.millicores,
                            memory_bytes: requests.memory_bytes,
                        }
                    })
                    .collect(),
            })
            .collect();
        let wire_nodes = node_map
            .iter()
            .map(|(id, node)| {
                let resources = allocatable(node);
                (
                    id.clone(),
                    NodeShape {
                        name: id.clone(),
                        millicores: resources.millicores,
                        memory_bytes: resources.memory_bytes,
                    },
                )
            })
            .collect();
        BestOptionsRequest {
            options: wire_options,
            node_map: wire_nodes,
        }
    }

    /// Map the server's answer back onto the input options. Unknown ids are
    /// dropped with a warning; an empty answer keeps the input unfiltered.
    fn sanitize(endorsed: Vec<ExpansionOption>, input: Vec<ScaleUpOption>) -> Vec<ScaleUpOption> {
        if endorsed.is_empty() {
            debug!("expander returned no options, keeping the input unfiltered");
            return input;
        }
        let mut by_id: BTreeMap<String, ScaleUpOption> = input
            .iter()
            .map(|option| (option.node_group_id.clone(), option.clone()))
            .collect();
        let mut ranked = Vec::new();
        for wire in endorsed {
            match by_id.remove(&wire.node_group_id) {
                Some(option) => ranked.push(option),
                None => {
                    warn!(
                        node_group_id = %wire.node_group_id,
                        "expander returned an unknown node group id, dropping it"
                    );
                }
            }
        }
        if ranked.is_empty() {
            warn!("no expander answer survived sanitation, keeping the input unfiltered");
            return input;
        }
        ranked
    }
}

#[async_trait]
impl ExpanderStrategy for GrpcExpander {
    async fn best_options(
        &self,
        options: Vec<ScaleUpOption>,
        node_map: &BTreeMap<String, Node>,
    ) -> Vec<ScaleUpOption> {
        let request = Self::build_request(&options, node_map);
        match tokio::time::timeout(EXPANDER_TIMEOUT, self.transport.best_options(request)).await {
            Err(_) => {
                warn!("expander call timed out, no options filtered");
                options
            }
            Ok(Err(status)) => {
                warn!(%status, "expander call failed, no options filtered");
                options
            }
            Ok(Ok(response)) => Self::sanitize(response.options, options),
        }
    }

    fn name(&self) -> &str {
        "grpc"
    }
}
