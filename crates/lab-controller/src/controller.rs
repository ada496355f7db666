//! Lab reconciliation controller
//!
//! Dispatches each Lab event to a bootstrap, revalidation or teardown pass,
//! persists the resulting status in a single write and publishes transition
//! events. Revalidation is driven by requeueing, so a Lab is re-graded on a
//! timer even when nothing in its spec changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use lab_common::crd::Lab;
use lab_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use lab_common::{Error, Step, LAB_FINALIZER};

use crate::applier::DEFAULT_POLL_INTERVAL;
use crate::client::{KubeLabClient, LabClient};
use crate::engine::{needs_bootstrap, on_bootstrap, on_revalidate};
use crate::manifest::{lab_namespace, ManifestResolver};
use crate::status::{initializing_status, LabEvent, LabEventKind};
use crate::teardown::on_teardown;

/// Controller name reported on Kubernetes Events
pub const CONTROLLER_NAME: &str = "lab-controller";

/// Default directory `givenFile`/`expectedFile` resolve against
pub const DEFAULT_MANIFEST_ROOT: &str = "/etc/lab-operator/manifests";

/// Tunables shared by every pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Directory file references resolve against
    pub manifest_root: PathBuf,
    /// How often a healthy Lab is re-graded
    pub revalidate_interval: Duration,
    /// How long deletions may take before being reported as stuck
    pub delete_timeout: Duration,
    /// Interval between existence checks while waiting for deletion
    pub poll_interval: Duration,
    /// Requeue delay after a transient failure
    pub error_requeue: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            manifest_root: PathBuf::from(DEFAULT_MANIFEST_ROOT),
            revalidate_interval: Duration::from_secs(30),
            delete_timeout: Duration::from_secs(60),
            poll_interval: DEFAULT_POLL_INTERVAL,
            error_requeue: Duration::from_secs(10),
        }
    }
}

/// Controller context shared across reconciliations
pub struct Context {
    /// Cluster access (trait object for testability)
    pub client: Arc<dyn LabClient>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Resolver for given/expected manifest sources
    pub resolver: ManifestResolver,
    /// Pass tunables
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for unit tests with mock dependencies
    pub fn for_testing(
        client: Arc<dyn LabClient>,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            events,
            resolver: ManifestResolver::new(config.manifest_root.clone()),
            config,
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```text
/// let ctx = Context::builder(client).config(config).build();
/// ```
pub struct ContextBuilder {
    client: Client,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            config: ControllerConfig::default(),
        }
    }

    /// Set pass tunables
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            client: Arc::new(KubeLabClient::new(self.client.clone())),
            events: Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME)),
            resolver: ManifestResolver::new(self.config.manifest_root.clone()),
            config: self.config,
        }
    }
}

fn has_finalizer(lab: &Lab) -> bool {
    lab.finalizers().iter().any(|f| f == LAB_FINALIZER)
}

fn object_ref(lab: &Lab) -> ObjectReference {
    lab.object_ref(&())
}

async fn publish(lab: &Lab, ctx: &Context, event: &LabEvent) {
    let type_ = match event.kind {
        LabEventKind::Normal => EventType::Normal,
        LabEventKind::Warning => EventType::Warning,
    };
    ctx.events
        .publish(
            &object_ref(lab),
            type_,
            event.reason,
            event.action,
            Some(event.note.clone()),
        )
        .await;
}

/// Reconcile a Lab
///
/// Deleted Labs are torn down. Live Labs get the cleanup finalizer, then a
/// bootstrap pass when the given manifests haven't been applied for the
/// current spec, otherwise a revalidation pass. The status is written once,
/// and only when it changed.
#[instrument(skip(lab, ctx), fields(lab = %lab.name_any(), namespace = %lab_namespace(&lab)))]
pub async fn reconcile(lab: Arc<Lab>, ctx: Arc<Context>) -> Result<Action, Error> {
    if lab.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&lab, &ctx).await;
    }

    let name = lab.name_any();
    let namespace = lab_namespace(&lab);

    if !has_finalizer(&lab) {
        info!("adding cleanup finalizer");
        ctx.client
            .add_lab_finalizer(&namespace, &name, LAB_FINALIZER)
            .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if lab.status.is_none() {
        ctx.client
            .patch_lab_status(&namespace, &name, &initializing_status())
            .await
            .map_err(|e| Error::at_step(Step::Status, format!("Lab {}/{}", namespace, name), e))?;
    }

    let verdict = if needs_bootstrap(&lab, &ctx).await {
        info!("bootstrapping lab");
        on_bootstrap(&lab, &ctx).await?
    } else {
        debug!("revalidating lab");
        on_revalidate(&lab, &ctx).await?
    };

    if lab.status.as_ref() != Some(&verdict.status) {
        ctx.client
            .patch_lab_status(&namespace, &name, &verdict.status)
            .await
            .map_err(|e| Error::at_step(Step::Status, format!("Lab {}/{}", namespace, name), e))?;
        info!(
            state = ?verdict.status.state(),
            ready = ?verdict.status.ready,
            "lab status updated"
        );
    }

    for event in &verdict.events {
        publish(&lab, &ctx, event).await;
    }

    if verdict.is_error() {
        // Input errors only clear when the spec changes
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(ctx.config.revalidate_interval))
    }
}

/// Tear a deleted Lab down and release its finalizer
async fn handle_deletion(lab: &Lab, ctx: &Context) -> Result<Action, Error> {
    if !has_finalizer(lab) {
        return Ok(Action::await_change());
    }

    info!("tearing down lab");
    let report = on_teardown(lab, ctx).await;
    if !report.is_complete() {
        warn!(summary = %report.summary(), "teardown incomplete, releasing lab anyway");
        ctx.events
            .publish(
                &object_ref(lab),
                EventType::Warning,
                reasons::TEARDOWN_INCOMPLETE,
                actions::TEARDOWN,
                Some(report.summary()),
            )
            .await;
    }

    ctx.client
        .remove_lab_finalizer(&lab_namespace(lab), &lab.name_any(), LAB_FINALIZER)
        .await?;
    Ok(Action::await_change())
}

/// Error policy for the controller
///
/// Only transient failures reach here; they are retried after a fixed delay.
pub fn error_policy(lab: Arc<Lab>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        lab = %lab.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(ctx.config.error_requeue)
}
