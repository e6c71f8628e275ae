use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{ObjectMeta, Patch, PatchParams, PostParams},
    core::OwnerReference,
    Api, Client,
};
use serde_json::json;
use tracing::debug;

use crate::{
    api::constants::FIELD_MANAGER,
    error::not_found_as_none,
    Error, Result,
};

/// Named string maps. A missing store or key is reported as `Error::NotFound`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, store: &str, key: &str) -> Result<String>;
    async fn set(&self, store: &str, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, store: &str, key: &str) -> Result<()>;
    async fn list(&self, store: &str) -> Result<BTreeMap<String, String>>;
    async fn delete_store(&self, store: &str) -> Result<()>;

    /// `get` with the not-found case folded into `None`.
    async fn get_opt(&self, store: &str, key: &str) -> Result<Option<String>> {
        match self.get(store, key).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Each store is a config map in one namespace, owned by the cluster when an
/// owner is given.
#[derive(Clone)]
pub struct ConfigMapKvStore {
    api: Api<ConfigMap>,
    owner: Option<OwnerReference>,
}

impl ConfigMapKvStore {
    pub fn new(client: Client, namespace: &str, owner: Option<OwnerReference>) -> Self {
        ConfigMapKvStore {
            api: Api::namespaced(client, namespace),
            owner,
        }
    }

    async fn load(&self, store: &str) -> Result<ConfigMap> {
        not_found_as_none(self.api.get(store).await)?
            .ok_or_else(|| Error::NotFound(format!("store {store}")))
    }

    async fn create_with(&self, store: &str, key: &str, value: &str) -> Result<()> {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(store.to_string()),
                owner_references: self.owner.clone().map(|o| vec![o]),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
            ..Default::default()
        };
        self.api.create(&PostParams::default(), &cm).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for ConfigMapKvStore {
    async fn get(&self, store: &str, key: &str) -> Result<String> {
        let cm = self.load(store).await?;
        cm.data
            .and_then(|mut d| d.remove(key))
            .ok_or_else(|| Error::NotFound(format!("key {key} in store {store}")))
    }

    async fn set(&self, store: &str, key: &str, value: &str) -> Result<()> {
        debug!("setting {key} in store {store}");
        match self.create_with(store, key, value).await {
            Err(e) if e.is_already_exists() => {
                let patch = json!({ "data": { key: value } });
                self.api
                    .patch(store, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
            other => other,
        }
    }

    async fn delete(&self, store: &str, key: &str) -> Result<()> {
        let patch = json!({ "data": { key: null } });
        not_found_as_none(
            self.api
                .patch(store, &PatchParams::default(), &Patch::Merge(&patch))
                .await,
        )?;
        Ok(())
    }

    async fn list(&self, store: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.load(store).await?.data.unwrap_or_default())
    }

    async fn delete_store(&self, store: &str) -> Result<()> {
        not_found_as_none(self.api.delete(store, &Default::default()).await)?;
        Ok(())
    }
}

/// Applies a whole config map with server side apply.
pub async fn apply_config_map(api: &Api<ConfigMap>, cm: &ConfigMap) -> Result<()> {
    let name = cm
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::Fatal("config map without a name".to_string()))?;
    api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(cm))
        .await?;
    Ok(())
}
