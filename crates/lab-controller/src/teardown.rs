//! Lab teardown
//!
//! Deletes everything a Lab brought into the cluster: the union of its
//! given and expected resources plus the Secret holding the solution.
//! Teardown is best-effort; unreadable sources and stuck deletions are
//! reported, never fatal, so a broken Lab can always be deleted.

use std::collections::HashSet;

use tracing::{info, warn};

use lab_common::crd::Lab;
use lab_common::Error;

use crate::applier::{DeleteReport, ResourceApplier};
use crate::controller::Context;
use crate::manifest::{lab_name, lab_namespace, parse_documents, ResourceKey};
use crate::secret::expected_secret_name;

/// Outcome of tearing a Lab down
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Deletion results for every resource the Lab owned
    pub deletion: DeleteReport,
    /// Manifest sources that could not be read, so their resources weren't found
    pub unresolved: Vec<Error>,
}

impl TeardownReport {
    /// Whether every known resource is confirmed gone
    pub fn is_complete(&self) -> bool {
        self.deletion.is_complete() && self.unresolved.is_empty()
    }

    /// One-line description for events and logs
    pub fn summary(&self) -> String {
        format!(
            "{} deleted, {} still present, {} failed, {} unreadable sources",
            self.deletion.deleted.len(),
            self.deletion.timed_out.len(),
            self.deletion.failures.len(),
            self.unresolved.len()
        )
    }
}

/// Keys to delete for a Lab, given resources first, without duplicates
async fn teardown_keys(lab: &Lab, ctx: &Context, unresolved: &mut Vec<Error>) -> Vec<ResourceKey> {
    let name = lab_name(lab);
    let namespace = lab_namespace(lab);
    let mut keys = Vec::new();

    match ctx.resolver.given_docs(lab).await {
        Ok(docs) => keys.extend(docs.into_iter().map(|d| d.key)),
        Err(e) => {
            warn!(lab = %name, error = %e, "given manifests unreadable during teardown");
            unresolved.push(e);
        }
    }

    let expected = ctx
        .resolver
        .expected_text(lab, ctx.client.as_ref())
        .await
        .and_then(|text| parse_documents(&name, &text, &namespace));
    match expected {
        Ok(docs) => keys.extend(docs.into_iter().map(|d| d.key)),
        Err(e) => {
            warn!(lab = %name, error = %e, "expected manifests unreadable during teardown");
            unresolved.push(e);
        }
    }

    keys.push(ResourceKey::secret(&namespace, &expected_secret_name(&name)));

    let mut seen = HashSet::new();
    keys.retain(|k| seen.insert(k.clone()));
    keys
}

/// Delete every resource the Lab created and wait for them to disappear
pub async fn on_teardown(lab: &Lab, ctx: &Context) -> TeardownReport {
    let mut unresolved = Vec::new();
    let keys = teardown_keys(lab, ctx, &mut unresolved).await;

    let applier = ResourceApplier::new(ctx.client.as_ref(), ctx.config.delete_timeout)
        .with_poll_interval(ctx.config.poll_interval);
    let report = TeardownReport {
        deletion: applier.delete(&keys).await,
        unresolved,
    };
    info!(lab = %lab_name(lab), summary = %report.summary(), "lab torn down");
    report
}
