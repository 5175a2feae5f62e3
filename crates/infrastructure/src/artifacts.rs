//! Cluster-resident configuration and status artifacts.
//!
//! The node-group bounds and provider credentials are read from a configmap
//! and a secret; missing or unparseable artifacts mean the operator
//! misconfigured the deployment, so those failures are fatal.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::debug;

use stratus_domain::ports::{ConfigSource, StatusWriter};
use stratus_shared::credentials::{
    NodeGroupBounds, ProviderCredentials, ACCESS_TOKEN_KEY, AUTOSCALING_CONFIG_MAP, CLUSTER_ID_KEY,
    CREDENTIALS_SECRET, MAX_NODE_GROUP_SIZE_KEY, MIN_NODE_GROUP_SIZE_KEY, VPC_ID_KEY,
};
use stratus_shared::error::{AutoscalerError, Result};

/// Key under which the status body is stored in the status configmap.
const STATUS_KEY: &str = "status";

pub struct KubeConfigSource {
    client: Client,
    namespace: String,
}

impl KubeConfigSource {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn parse_size(data: &BTreeMap<String, String>, key: &str) -> Result<usize> {
        let raw = data.get(key).ok_or_else(|| {
            AutoscalerError::configuration(format!(
                "{AUTOSCALING_CONFIG_MAP} has no {key} entry"
            ))
        })?;
        raw.parse::<usize>().map_err(|_| {
            AutoscalerError::configuration(format!(
                "{AUTOSCALING_CONFIG_MAP} entry {key} is not a base-10 integer: {raw:?}"
            ))
        })
    }

    fn secret_string(data: &BTreeMap<String, k8s_openapi::ByteString>, key: &str) -> Result<String> {
        let bytes = data.get(key).ok_or_else(|| {
            AutoscalerError::configuration(format!("{CREDENTIALS_SECRET} has no {key} entry"))
        })?;
        String::from_utf8(bytes.0.clone()).map_err(|_| {
            AutoscalerError::configuration(format!(
                "{CREDENTIALS_SECRET} entry {key} is not valid UTF-8"
            ))
        })
    }
}

#[async_trait]
impl ConfigSource for KubeConfigSource {
    async fn node_group_bounds(&self) -> Result<NodeGroupBounds> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let config_map = config_maps.get(AUTOSCALING_CONFIG_MAP).await.map_err(|e| {
            AutoscalerError::configuration(format!(
                "cannot get information from {AUTOSCALING_CONFIG_MAP}: {e}"
            ))
        })?;
        let data = config_map.data.unwrap_or_default();
        Ok(NodeGroupBounds {
            min_workers: Self::parse_size(&data, MIN_NODE_GROUP_SIZE_KEY)?,
            max_workers: Self::parse_size(&data, MAX_NODE_GROUP_SIZE_KEY)?,
        })
    }

    async fn provider_credentials(&self) -> Result<ProviderCredentials> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = secrets.get(CREDENTIALS_SECRET).await.map_err(|e| {
            AutoscalerError::configuration(format!(
                "cannot get information from {CREDENTIALS_SECRET}: {e}"
            ))
        })?;
        let data = secret.data.unwrap_or_default();
        Ok(ProviderCredentials {
            access_token: Self::secret_string(&data, ACCESS_TOKEN_KEY)?,
            vpc_id: Self::secret_string(&data, VPC_ID_KEY)?,
            cluster_id: Self::secret_string(&data, CLUSTER_ID_KEY)?,
        })
    }
}

/// Writes the readable status summary into a configmap at the end of every
/// iteration and deletes it at process exit.
pub struct KubeStatusWriter {
    client: Client,
    namespace: String,
    name: String,
}

impl KubeStatusWriter {
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn render(&self, body: &str) -> ConfigMap {
        let mut data = BTreeMap::new();
        data.insert(STATUS_KEY.to_string(), body.to_string());
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write(&self, body: &str) -> Result<()> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let rendered = self.render(body);
        match config_maps.get_opt(&self.name).await {
            Ok(Some(mut existing)) => {
                existing.data = rendered.data.clone();
                config_maps
                    .replace(&self.name, &PostParams::default(), &existing)
                    .await
                    .map_err(|e| {
                        AutoscalerError::api_call(format!("failed to update status configmap: {e}"))
                    })?;
            }
            Ok(None) => {
                config_maps
                    .create(&PostParams::default(), &rendered)
                    .await
                    .map_err(|e| {
                        AutoscalerError::api_call(format!("failed to create status configmap: {e}"))
                    })?;
            }
            Err(e) => {
                return Err(AutoscalerError::api_call(format!(
                    "failed to read status configmap: {e}"
                )));
            }
        }
        debug!(name = %self.name, "status configmap written");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        match config_maps.delete(&self.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(AutoscalerError::api_call(format!(
                "failed to delete status configmap: {e}"
            ))),
        }
    }
}
