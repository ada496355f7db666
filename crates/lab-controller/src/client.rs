//! Kubernetes access for the Lab controller
//!
//! Every cluster interaction goes through [`LabClient`] so the engine can be
//! tested against mocks or an in-memory fake while production uses kube-rs.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams,
    PostParams,
};
use kube::discovery::{pinned_kind, ApiCapabilities, Scope};
use kube::Client;
use serde_json::Value;
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use lab_common::crd::{Lab, LabStatus};
use lab_common::kube_utils::gvk_for;
use lab_common::{Error, FIELD_MANAGER};

use crate::manifest::{ManifestDocument, ResourceKey};

/// Trait abstracting Kubernetes operations for the Lab controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LabClient: Send + Sync {
    /// Fetch a live object as a JSON tree, `None` if it doesn't exist
    async fn get_resource(&self, key: &ResourceKey) -> Result<Option<Value>, Error>;

    /// Create an object from a manifest document
    async fn create_resource(&self, doc: &ManifestDocument) -> Result<(), Error>;

    /// Server-side apply a manifest document over an existing object
    async fn patch_resource(&self, doc: &ManifestDocument) -> Result<(), Error>;

    /// Request deletion of an object
    ///
    /// Returns `false` if the object was already absent.
    async fn delete_resource(&self, key: &ResourceKey) -> Result<bool, Error>;

    /// Fetch a Secret, `None` if it doesn't exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create or replace a Secret owned by the operator
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Merge-patch a Lab's spec (the patch is the whole `{"spec": ...}` body)
    async fn patch_lab(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error>;

    /// Replace a Lab's status
    async fn patch_lab_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LabStatus,
    ) -> Result<(), Error>;

    /// Add a finalizer to a Lab (no-op if already present)
    async fn add_lab_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Remove a finalizer from a Lab (no-op if absent or the Lab is gone)
    async fn remove_lab_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;
}

/// Real client implementation using DynamicObject for arbitrary kinds
///
/// Kinds are resolved through API discovery once and cached, so CRDs
/// installed by a Lab's given manifests work like built-in kinds.
pub struct KubeLabClient {
    client: Client,
    discovered: RwLock<HashMap<GroupVersionKind, (ApiResource, ApiCapabilities)>>,
}

impl KubeLabClient {
    /// Create a new KubeLabClient
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovered: RwLock::new(HashMap::new()),
        }
    }

    async fn resolve(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<(ApiResource, ApiCapabilities), Error> {
        let gvk = gvk_for(api_version, kind);
        if let Some(hit) = self.discovered.read().ok().and_then(|m| m.get(&gvk).cloned()) {
            return Ok(hit);
        }

        let resolved = match pinned_kind(&self.client, &gvk).await {
            Ok(resolved) => resolved,
            Err(kube::Error::Discovery(e)) => {
                return Err(Error::unknown_kind(api_version, kind, e.to_string()))
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(Error::unknown_kind(api_version, kind, ae.message))
            }
            Err(e) => return Err(e.into()),
        };
        trace!(api_version, kind, plural = %resolved.0.plural, "discovered kind");

        if let Ok(mut m) = self.discovered.write() {
            m.insert(gvk, resolved.clone());
        }
        Ok(resolved)
    }

    /// Api handle for a key, honoring the kind's scope
    async fn api_for(&self, key: &ResourceKey) -> Result<(Api<DynamicObject>, bool), Error> {
        let (ar, caps) = self.resolve(&key.api_version, &key.kind).await?;
        match (&caps.scope, key.namespace.as_deref()) {
            (Scope::Namespaced, Some(ns)) => {
                Ok((Api::namespaced_with(self.client.clone(), ns, &ar), true))
            }
            (Scope::Namespaced, None) => Ok((
                Api::default_namespaced_with(self.client.clone(), &ar),
                true,
            )),
            (Scope::Cluster, _) => Ok((Api::all_with(self.client.clone(), &ar), false)),
        }
    }

    /// Build the object sent to the API server for a document
    fn object_for(doc: &ManifestDocument, namespaced: bool) -> Result<DynamicObject, Error> {
        let mut obj: DynamicObject = serde_json::from_value(doc.body.clone())
            .map_err(|e| Error::serialization_for_kind(&doc.key.kind, e.to_string()))?;
        obj.metadata.namespace = if namespaced {
            doc.key.namespace.clone()
        } else {
            None
        };
        Ok(obj)
    }
}

#[async_trait]
impl LabClient for KubeLabClient {
    async fn get_resource(&self, key: &ResourceKey) -> Result<Option<Value>, Error> {
        let (api, _) = self.api_for(key).await?;
        match api.get_opt(&key.name).await? {
            Some(obj) => serde_json::to_value(&obj)
                .map(Some)
                .map_err(|e| Error::serialization_for_kind(&key.kind, e.to_string())),
            None => Ok(None),
        }
    }

    async fn create_resource(&self, doc: &ManifestDocument) -> Result<(), Error> {
        let (api, namespaced) = self.api_for(&doc.key).await?;
        let obj = Self::object_for(doc, namespaced)?;
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.create(&pp, &obj).await?;
        debug!(resource = %doc.key, "created resource");
        Ok(())
    }

    async fn patch_resource(&self, doc: &ManifestDocument) -> Result<(), Error> {
        let (api, namespaced) = self.api_for(&doc.key).await?;
        let obj = Self::object_for(doc, namespaced)?;
        api.patch(
            &doc.key.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&obj),
        )
        .await?;
        debug!(resource = %doc.key, "applied resource");
        Ok(())
    }

    async fn delete_resource(&self, key: &ResourceKey) -> Result<bool, Error> {
        let (api, _) = self.api_for(key).await?;
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        let name = secret
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal_with_context("apply_secret", "secret has no name"))?;
        let namespace = secret.metadata.namespace.as_deref().ok_or_else(|| {
            Error::internal_with_context("apply_secret", "secret has no namespace")
        })?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(secret),
        )
        .await?;
        Ok(())
    }

    async fn patch_lab(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error> {
        let api: Api<Lab> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_lab_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LabStatus,
    ) -> Result<(), Error> {
        let api: Api<Lab> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_lab_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<Lab> = Api::namespaced(self.client.clone(), namespace);

        let lab = api.get(name).await?;
        let mut finalizers = lab.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_lab_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<Lab> = Api::namespaced(self.client.clone(), namespace);

        let Some(lab) = api.get_opt(name).await? else {
            return Ok(());
        };
        let finalizers: Vec<String> = lab
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
