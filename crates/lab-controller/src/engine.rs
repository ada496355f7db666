//! Bootstrap and revalidation passes
//!
//! A bootstrap pass runs when the given manifests have not been applied for
//! the current spec (or plaintext expected manifests are still present): it
//! hides the solution, applies the given resources and grades. A revalidation
//! pass only grades. Both return a [`LabVerdict`] for the dispatcher to
//! persist; input errors become an error verdict, transient ones propagate.

use chrono::Utc;
use tracing::{debug, info, warn};

use lab_common::crd::Lab;
use lab_common::kube_utils::deterministic_hash;
use lab_common::{Error, Step};

use crate::applier::ResourceApplier;
use crate::compare::judge_all;
use crate::controller::Context;
use crate::manifest::{lab_name, lab_namespace, parse_documents};
use crate::secret::materialize_expected;
use crate::status::{derive_status, LabEvent, LabVerdict, PassOutcome};

/// Whether the next pass for this Lab must bootstrap
///
/// True while plaintext expected manifests remain in the spec or the given
/// manifests differ from the ones last applied. A given source that can't
/// be read also bootstraps, so the failure gets reported.
pub async fn needs_bootstrap(lab: &Lab, ctx: &Context) -> bool {
    if lab.spec.has_plaintext_expected() {
        return true;
    }
    let applied = lab.status.as_ref().and_then(|s| s.given_digest.as_deref());
    match ctx.resolver.given_text(lab).await {
        Ok(text) => applied != Some(deterministic_hash(&text).as_str()),
        Err(_) => true,
    }
}

/// Turn a pass result into a verdict, letting transient errors escape
fn settle(
    lab: &Lab,
    result: Result<PassOutcome, Error>,
    given_digest: Option<String>,
    mut events: Vec<LabEvent>,
) -> Result<LabVerdict, Error> {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) if e.is_retryable() => return Err(e),
        Err(e) => {
            warn!(lab = %lab_name(lab), error = %e, "lab input error");
            PassOutcome::Failed(e.to_string())
        }
    };
    let mut verdict = derive_status(lab.status.as_ref(), outcome, given_digest, Utc::now());
    events.append(&mut verdict.events);
    verdict.events = events;
    Ok(verdict)
}

/// Apply given resources, hide the solution, and grade
pub async fn on_bootstrap(lab: &Lab, ctx: &Context) -> Result<LabVerdict, Error> {
    let name = lab_name(lab);
    let namespace = lab_namespace(lab);
    let client = ctx.client.as_ref();
    let mut events = Vec::new();

    if let Err(msg) = lab.spec.validate() {
        return settle(lab, Err(Error::validation_for(&name, msg)), None, events);
    }

    let given_text = match ctx.resolver.given_text(lab).await {
        Ok(text) => text,
        Err(e) => return settle(lab, Err(e), None, events),
    };
    let given = match parse_documents(&name, &given_text, &namespace) {
        Ok(docs) => docs,
        Err(e) => return settle(lab, Err(e), None, events),
    };

    // Parse before migrating so broken YAML stays editable in the spec
    let expected_text = match ctx.resolver.expected_text(lab, client).await {
        Ok(text) => text,
        Err(e) => return settle(lab, Err(e), None, events),
    };
    let expected = match parse_documents(&name, &expected_text, &namespace) {
        Ok(docs) => docs,
        Err(e) => return settle(lab, Err(e), None, events),
    };

    match materialize_expected(lab, client, &ctx.resolver).await {
        Ok(m) if m.migrated => events.push(LabEvent::initializing()),
        Ok(_) => {}
        Err(e) => return settle(lab, Err(e), None, events),
    }

    let applier = ResourceApplier::new(client, ctx.config.delete_timeout)
        .with_poll_interval(ctx.config.poll_interval);
    let applied = match applier.apply(&given).await.into_result() {
        Ok(applied) => applied,
        Err(e) => return settle(lab, Err(e), None, events),
    };
    info!(lab = %name, resources = applied.len(), "given resources applied");

    let digest = Some(deterministic_hash(&given_text));
    let judged = judge_all(client, &expected).await.map(PassOutcome::Judged);
    settle(lab, judged, digest, events)
}

/// Grade live state against the expected manifests
pub async fn on_revalidate(lab: &Lab, ctx: &Context) -> Result<LabVerdict, Error> {
    let name = lab_name(lab);
    let namespace = lab_namespace(lab);
    let client = ctx.client.as_ref();

    let result = async {
        lab.spec
            .validate()
            .map_err(|msg| Error::validation_for(&name, msg))?;
        let text = ctx
            .resolver
            .expected_text(lab, client)
            .await
            .map_err(|e| match e {
                e @ Error::Step { .. } => e,
                e => Error::at_step(Step::Resolve, "expected", e),
            })?;
        let expected = parse_documents(&name, &text, &namespace)?;
        debug!(lab = %name, resources = expected.len(), "grading");
        judge_all(client, &expected).await.map(PassOutcome::Judged)
    }
    .await;

    settle(lab, result, None, Vec::new())
}
