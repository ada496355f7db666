//! Resource applier
//!
//! Creates or updates given resources so the cluster matches them, and
//! deletes resources during teardown. Applying is idempotent: a resource
//! whose live state already contains the document is left untouched.

use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use lab_common::kube_utils::poll_until;
use lab_common::{Error, Step};

use crate::client::LabClient;
use crate::compare::{comparable_body, compare};
use crate::manifest::{ManifestDocument, ResourceKey};

/// Default interval between existence checks while waiting for deletion
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// What happened to one document during apply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyAction {
    /// The resource didn't exist and was created
    Created,
    /// The resource existed and was server-side applied
    Patched,
    /// The resource had drifted in immutable fields and was deleted and recreated
    Recreated,
    /// The live state already matched the document
    Unchanged,
}

/// A document that could not be applied or deleted
#[derive(Debug)]
pub struct ResourceFailure {
    /// Resource the failure is about
    pub key: ResourceKey,
    /// Why it failed
    pub error: Error,
}

/// Outcome of applying a list of documents
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Documents applied successfully, in order
    pub applied: Vec<(ResourceKey, ApplyAction)>,
    /// Documents that failed
    pub failures: Vec<ResourceFailure>,
}

impl ApplyReport {
    /// Collapse into a single result
    ///
    /// A transient failure wins over a permanent one so the pass is retried
    /// rather than reported as a Lab error.
    pub fn into_result(mut self) -> Result<Vec<(ResourceKey, ApplyAction)>, Error> {
        if self.failures.is_empty() {
            return Ok(self.applied);
        }
        let pick = self
            .failures
            .iter()
            .position(|f| f.error.is_retryable())
            .unwrap_or(0);
        let failure = self.failures.swap_remove(pick);
        Err(Error::at_step(Step::Apply, failure.key.to_string(), failure.error))
    }
}

/// Outcome of deleting a list of resources
#[derive(Debug, Default)]
pub struct DeleteReport {
    /// Resources confirmed gone (including ones already absent)
    pub deleted: Vec<ResourceKey>,
    /// Resources still present when the wait timed out
    pub timed_out: Vec<ResourceKey>,
    /// Resources whose deletion request failed
    pub failures: Vec<ResourceFailure>,
}

impl DeleteReport {
    /// Whether every resource is confirmed gone
    pub fn is_complete(&self) -> bool {
        self.timed_out.is_empty() && self.failures.is_empty()
    }
}

/// Applies and deletes manifest documents through a [`LabClient`]
pub struct ResourceApplier<'a> {
    client: &'a dyn LabClient,
    delete_timeout: Duration,
    poll_interval: Duration,
}

impl<'a> ResourceApplier<'a> {
    /// Create an applier that waits up to `delete_timeout` for deletions
    pub fn new(client: &'a dyn LabClient, delete_timeout: Duration) -> Self {
        Self {
            client,
            delete_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the existence poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Apply documents in order, continuing past failures
    pub async fn apply(&self, docs: &[ManifestDocument]) -> ApplyReport {
        let mut report = ApplyReport::default();
        for doc in docs {
            match self.apply_one(doc).await {
                Ok(action) => {
                    debug!(resource = %doc.key, ?action, "applied given resource");
                    report.applied.push((doc.key.clone(), action));
                }
                Err(error) => {
                    warn!(resource = %doc.key, error = %error, "failed to apply given resource");
                    report.failures.push(ResourceFailure {
                        key: doc.key.clone(),
                        error,
                    });
                }
            }
        }
        report
    }

    async fn apply_one(&self, doc: &ManifestDocument) -> Result<ApplyAction, Error> {
        let Some(live) = self.client.get_resource(&doc.key).await? else {
            self.client.create_resource(doc).await?;
            return Ok(ApplyAction::Created);
        };

        if compare(&comparable_body(doc), &live).matched {
            return Ok(ApplyAction::Unchanged);
        }

        // Pod specs are mostly immutable; a drifted Pod is replaced
        if doc.key.api_version == "v1" && doc.key.kind == "Pod" {
            self.client.delete_resource(&doc.key).await?;
            let remaining = self.wait_absent(vec![doc.key.clone()]).await;
            if !remaining.is_empty() {
                return Err(Error::internal_with_context(
                    "apply",
                    format!(
                        "{} still terminating after {:?}",
                        doc.key, self.delete_timeout
                    ),
                ));
            }
            self.client.create_resource(doc).await?;
            info!(resource = %doc.key, "recreated drifted pod");
            return Ok(ApplyAction::Recreated);
        }

        self.client.patch_resource(doc).await?;
        Ok(ApplyAction::Patched)
    }

    /// Delete resources and wait until they are gone
    ///
    /// Already-absent resources count as deleted. Resources still present at
    /// the timeout are reported rather than treated as errors.
    pub async fn delete(&self, keys: &[ResourceKey]) -> DeleteReport {
        let mut report = DeleteReport::default();
        let mut pending = Vec::new();

        for key in keys {
            match self.client.delete_resource(key).await {
                Ok(true) => pending.push(key.clone()),
                Ok(false) => {
                    debug!(resource = %key, "already absent");
                    report.deleted.push(key.clone());
                }
                Err(error) => {
                    warn!(resource = %key, error = %error, "failed to delete resource");
                    report.failures.push(ResourceFailure {
                        key: key.clone(),
                        error,
                    });
                }
            }
        }

        let remaining = self.wait_absent(pending.clone()).await;
        for key in pending {
            if remaining.contains(&key) {
                warn!(
                    resource = %key,
                    timeout = ?self.delete_timeout,
                    "resource still present after timeout"
                );
                report.timed_out.push(key);
            } else {
                report.deleted.push(key);
            }
        }
        report
    }

    /// Poll until every key is absent or the timeout passes, returning the
    /// keys still present
    async fn wait_absent(&self, keys: Vec<ResourceKey>) -> Vec<ResourceKey> {
        let remaining = Mutex::new(keys);
        let pending = &remaining;
        let client = self.client;

        let result = poll_until(
            self.delete_timeout,
            self.poll_interval,
            "resources still present after delete",
            move || async move {
                let keys = pending.lock().await.clone();
                let mut still_present = Vec::with_capacity(keys.len());
                for key in keys {
                    match client.get_resource(&key).await {
                        Ok(None) => {}
                        Ok(Some(_)) => still_present.push(key),
                        Err(e) => {
                            debug!(resource = %key, error = %e, "existence check failed, retrying");
                            still_present.push(key);
                        }
                    }
                }
                let done = still_present.is_empty();
                *pending.lock().await = still_present;
                Ok(done)
            },
        )
        .await;

        match result {
            Ok(()) => Vec::new(),
            Err(_) => remaining.into_inner(),
        }
    }
}
