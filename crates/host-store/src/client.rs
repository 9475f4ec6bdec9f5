//! Kubernetes-backed host store
//!
//! Reads and patches `BareMetalHost` objects through the API server. Writes
//! are JSON merge patches carrying the resourceVersion read beforehand, so
//! the API server enforces optimistic concurrency.

use crate::error::StoreError;
use crate::models::{HostResource, HostUpdate};
use crate::store_trait::HostStore;
use crate::userdata::{USER_DATA_KEY, user_data_secret_name};
use crds::{BareMetalHost, SecretReference};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::debug;

/// Field manager used for server-side apply of user-data Secrets
pub const FIELD_MANAGER: &str = "provision-webhook";

/// Store backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeHostStore {
    hosts: Api<BareMetalHost>,
    secrets: Api<Secret>,
    namespace: String,
}

impl KubeHostStore {
    /// Create a store scoped to `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            hosts: Api::namespaced(client.clone(), &namespace),
            secrets: Api::namespaced(client, &namespace),
            namespace,
        }
    }

    /// The underlying BareMetalHost API, e.g. for watches
    pub fn hosts_api(&self) -> &Api<BareMetalHost> {
        &self.hosts
    }
}

impl std::fmt::Debug for KubeHostStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeHostStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl HostStore for KubeHostStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, name: &str) -> Result<HostResource, StoreError> {
        debug!("GET BareMetalHost {}/{}", self.namespace, name);
        match self.hosts.get_opt(name).await {
            Ok(Some(host)) => HostResource::from_bare_metal_host(&host),
            Ok(None) => Err(StoreError::NotFound(name.to_string())),
            Err(e) => Err(StoreError::from_kube(name, e)),
        }
    }

    async fn conditional_update(
        &self,
        name: &str,
        update: &HostUpdate,
        expected_token: &str,
    ) -> Result<(), StoreError> {
        let patch = update.to_merge_patch(expected_token);
        debug!(
            "PATCH BareMetalHost {}/{} at resourceVersion {}",
            self.namespace, name, expected_token
        );

        self.hosts
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(name, e))
    }

    async fn apply_user_data(
        &self,
        name: &str,
        cloud_config: &str,
    ) -> Result<SecretReference, StoreError> {
        let secret_name = user_data_secret_name(name);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    ("app.kubernetes.io/managed-by".to_string(), FIELD_MANAGER.to_string()),
                    ("metal3.io/host".to_string(), name.to_string()),
                ])),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            string_data: Some(BTreeMap::from([(
                USER_DATA_KEY.to_string(),
                cloud_config.to_string(),
            )])),
            ..Default::default()
        };

        debug!("APPLY Secret {}/{}", self.namespace, secret_name);
        self.secrets
            .patch(
                &secret_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await
            .map_err(|e| StoreError::from_kube(&secret_name, e))?;

        Ok(SecretReference {
            name: Some(secret_name),
            namespace: Some(self.namespace.clone()),
        })
    }
}
