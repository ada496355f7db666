//! In-memory cluster used by the lifecycle stories
//!
//! Objects are stored as JSON trees keyed by [`ResourceKey`]. Server-side
//! apply and Lab patches are approximated with JSON merge patch, which is
//! enough for the manifests these stories use.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use serde_json::Value;

use lab_common::crd::{Lab, LabStatus};
use lab_common::events::EventPublisher;
use lab_common::Error;
use lab_controller::manifest::{ManifestDocument, ResourceKey};
use lab_controller::{reconcile, Context, ControllerConfig, LabClient};

/// Write counters, for asserting idempotence
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Writes {
    pub creates: usize,
    pub patches: usize,
    pub deletes: usize,
    pub secret_writes: usize,
    pub lab_patches: usize,
    pub status_writes: usize,
}

#[derive(Default)]
struct State {
    objects: HashMap<ResourceKey, Value>,
    labs: HashMap<(String, String), Value>,
    writes: Writes,
}

/// Fake cluster implementing [`LabClient`]
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

fn conflict(message: String) -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: "AlreadyExists".to_string(),
        code: 409,
    }))
}

fn not_found(message: String) -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

/// RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(target) = target {
        for (k, v) in patch {
            if v.is_null() {
                target.remove(k);
            } else {
                merge_patch(target.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

fn with_namespace(key: &ResourceKey, body: &Value) -> Value {
    let mut body = body.clone();
    if let Some(ns) = &key.namespace {
        body["metadata"]["namespace"] = Value::String(ns.clone());
    }
    body
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn writes(&self) -> Writes {
        self.state.lock().unwrap().writes
    }

    pub fn object(&self, key: &ResourceKey) -> Option<Value> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    /// Stand in for the solver editing the cluster directly
    pub fn put_object(&self, key: ResourceKey, body: Value) {
        let body = with_namespace(&key, &body);
        self.state.lock().unwrap().objects.insert(key, body);
    }

    pub fn remove_object(&self, key: &ResourceKey) {
        self.state.lock().unwrap().objects.remove(key);
    }

    pub fn insert_lab(&self, lab: &Lab) {
        let key = (
            lab.metadata.namespace.clone().unwrap_or_default(),
            lab.metadata.name.clone().unwrap_or_default(),
        );
        let value = serde_json::to_value(lab).unwrap();
        self.state.lock().unwrap().labs.insert(key, value);
    }

    pub fn lab(&self, namespace: &str, name: &str) -> Option<Lab> {
        self.state
            .lock()
            .unwrap()
            .labs
            .get(&(namespace.to_string(), name.to_string()))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Edit a Lab's stored object as a user would with kubectl
    pub fn edit_lab(&self, namespace: &str, name: &str, patch: Value) {
        let mut state = self.state.lock().unwrap();
        let lab = state
            .labs
            .get_mut(&(namespace.to_string(), name.to_string()))
            .unwrap();
        merge_patch(lab, &patch);
    }

    pub fn mark_lab_deleted(&self, namespace: &str, name: &str) {
        self.edit_lab(
            namespace,
            name,
            serde_json::json!({"metadata": {"deletionTimestamp": "2026-01-01T00:00:00Z"}}),
        );
    }
}

#[async_trait]
impl LabClient for FakeCluster {
    async fn get_resource(&self, key: &ResourceKey) -> Result<Option<Value>, Error> {
        Ok(self.object(key))
    }

    async fn create_resource(&self, doc: &ManifestDocument) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.objects.contains_key(&doc.key) {
            return Err(conflict(format!("{} already exists", doc.key)));
        }
        state
            .objects
            .insert(doc.key.clone(), with_namespace(&doc.key, &doc.body));
        state.writes.creates += 1;
        Ok(())
    }

    async fn patch_resource(&self, doc: &ManifestDocument) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let body = with_namespace(&doc.key, &doc.body);
        let entry = state
            .objects
            .entry(doc.key.clone())
            .or_insert(Value::Null);
        merge_patch(entry, &body);
        state.writes.patches += 1;
        Ok(())
    }

    async fn delete_resource(&self, key: &ResourceKey) -> Result<bool, Error> {
        let mut state = self.state.lock().unwrap();
        let existed = state.objects.remove(key).is_some();
        if existed {
            state.writes.deletes += 1;
        }
        Ok(existed)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self
            .object(&ResourceKey::secret(namespace, name))
            .map(|v| serde_json::from_value(v).unwrap()))
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        let key = ResourceKey::secret(
            secret.metadata.namespace.as_deref().unwrap_or_default(),
            secret.metadata.name.as_deref().unwrap_or_default(),
        );
        let mut state = self.state.lock().unwrap();
        state
            .objects
            .insert(key, serde_json::to_value(secret).unwrap());
        state.writes.secret_writes += 1;
        Ok(())
    }

    async fn patch_lab(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let lab = state
            .labs
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| not_found(format!("lab {name} not found")))?;
        merge_patch(lab, patch);
        state.writes.lab_patches += 1;
        Ok(())
    }

    async fn patch_lab_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LabStatus,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let lab = state
            .labs
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| not_found(format!("lab {name} not found")))?;
        lab["status"] = serde_json::to_value(status).unwrap();
        state.writes.status_writes += 1;
        Ok(())
    }

    async fn add_lab_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let lab = state
            .labs
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| not_found(format!("lab {name} not found")))?;
        let finalizers = lab["metadata"]
            .as_object_mut()
            .unwrap()
            .entry("finalizers")
            .or_insert(Value::Array(vec![]));
        let list = finalizers.as_array_mut().unwrap();
        if !list.iter().any(|f| f == finalizer) {
            list.push(Value::String(finalizer.to_string()));
        }
        Ok(())
    }

    async fn remove_lab_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let Some(lab) = state.labs.get_mut(&key) else {
            return Ok(());
        };
        if let Some(list) = lab["metadata"]["finalizers"].as_array_mut() {
            list.retain(|f| f != finalizer);
        }
        let released = lab["metadata"]["finalizers"]
            .as_array()
            .is_none_or(|l| l.is_empty());
        if released && !lab["metadata"]["deletionTimestamp"].is_null() {
            state.labs.remove(&key);
        }
        Ok(())
    }
}

/// Event publisher that remembers reasons in order
#[derive(Default)]
pub struct RecordingPublisher {
    reasons: Mutex<Vec<String>>,
}

impl RecordingPublisher {
    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}

/// A fake cluster wired into a controller context
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub events: Arc<RecordingPublisher>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let cluster = FakeCluster::new();
        let events = Arc::new(RecordingPublisher::default());
        let ctx = Arc::new(Context::for_testing(
            cluster.clone(),
            events.clone(),
            config,
        ));
        Self {
            cluster,
            events,
            ctx,
        }
    }

    /// Run one reconcile against the Lab as currently stored
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action, Error> {
        let lab = self
            .cluster
            .lab(namespace, name)
            .expect("lab should exist");
        reconcile(Arc::new(lab), self.ctx.clone()).await
    }
}
