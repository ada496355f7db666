//! Lab CRD types
//!
//! A `Lab` is one gradable exercise. Its spec names a "given" manifest set
//! that is applied to set the exercise up and an "expected" manifest set the
//! live cluster must eventually match. Plaintext `expected`/`expectedFile`
//! are migrated by the controller into a Secret referenced by `expectedRef`.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::EXPECTED_SECRET_KEY;

/// Status message while the first comparison has not completed
pub const MESSAGE_INITIALIZING: &str =
    "Please wait, the Lab is initializing and preparing resources.";

/// Status message when at least one expected resource does not match
pub const MESSAGE_NOT_FIXED: &str = "The cluster state does not match the expected manifests. \
     Keep looking for the issue and try again.";

/// Status message when every expected resource matches
pub const MESSAGE_READY: &str = "The Lab is successfully fixed.";

/// Desired state of a Lab exercise
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "training.dev",
    version = "v1",
    kind = "Lab",
    plural = "labs",
    shortname = "lab",
    namespaced,
    status = "LabStatus",
    validation = "has(self.spec.given) != has(self.spec.givenFile)",
    validation = "[has(self.spec.expected), has(self.spec.expectedFile), has(self.spec.expectedRef)].filter(x, x).size() == 1",
    printcolumn = r#"{"name":"Task","type":"string","jsonPath":".spec.task"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Error","type":"string","jsonPath":".status.error"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LabSpec {
    /// Instructions shown to the person solving the Lab
    pub task: String,

    /// Inline YAML of the starting resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given: Option<String>,

    /// Path (relative to the operator's manifest root) of the starting resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_file: Option<String>,

    /// Inline YAML of the solution; migrated to `expectedRef` on first reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,

    /// Path of the solution YAML; migrated to `expectedRef` on first reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_file: Option<String>,

    /// Secret holding the solution YAML
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_ref: Option<ExpectedRef>,
}

/// Reference to the Secret key holding the expected manifests
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedRef {
    /// Secret name, in the Lab's namespace
    pub secret_name: String,

    /// Data key within the Secret
    #[serde(default = "default_expected_key")]
    pub key: String,
}

fn default_expected_key() -> String {
    EXPECTED_SECRET_KEY.to_string()
}

/// Where the given manifests come from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestSource<'a> {
    /// Inline YAML text
    Inline(&'a str),
    /// Path relative to the manifest root
    File(&'a str),
}

/// Where the expected manifests come from
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExpectedSource<'a> {
    /// Plaintext YAML still held in the spec
    Inline(&'a str),
    /// Plaintext YAML file path still held in the spec
    File(&'a str),
    /// Migrated Secret reference
    Secret(&'a ExpectedRef),
}

impl LabSpec {
    /// Validate the oneOf constraints on given/expected sources
    pub fn validate(&self) -> Result<(), String> {
        self.given_source()?;
        self.expected_source()?;
        if let Some(r) = &self.expected_ref {
            if r.secret_name.trim().is_empty() {
                return Err("spec.expectedRef.secretName must not be empty".to_string());
            }
            if r.key.trim().is_empty() {
                return Err("spec.expectedRef.key must not be empty".to_string());
            }
        }
        Ok(())
    }

    /// The single configured given source
    pub fn given_source(&self) -> Result<ManifestSource<'_>, String> {
        match (&self.given, &self.given_file) {
            (Some(text), None) => Ok(ManifestSource::Inline(text)),
            (None, Some(path)) => Ok(ManifestSource::File(path)),
            (Some(_), Some(_)) => {
                Err("spec.given and spec.givenFile are mutually exclusive".to_string())
            }
            (None, None) => {
                Err("exactly one of spec.given or spec.givenFile is required".to_string())
            }
        }
    }

    /// The single configured expected source
    pub fn expected_source(&self) -> Result<ExpectedSource<'_>, String> {
        match (&self.expected, &self.expected_file, &self.expected_ref) {
            (Some(text), None, None) => Ok(ExpectedSource::Inline(text)),
            (None, Some(path), None) => Ok(ExpectedSource::File(path)),
            (None, None, Some(r)) => Ok(ExpectedSource::Secret(r)),
            (None, None, None) => Err(
                "exactly one of spec.expected, spec.expectedFile or spec.expectedRef is required"
                    .to_string(),
            ),
            _ => Err(
                "spec.expected, spec.expectedFile and spec.expectedRef are mutually exclusive"
                    .to_string(),
            ),
        }
    }

    /// Whether the solution is still stored in plaintext and must be migrated
    pub fn has_plaintext_expected(&self) -> bool {
        self.expected_ref.is_none() && (self.expected.is_some() || self.expected_file.is_some())
    }
}

/// Status of a Lab
///
/// Every field is serialized (including `null`s) so a merge patch of the
/// whole status replaces the previous one in a single write.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabStatus {
    /// Last comparison verdict; absent until the first comparison completes
    #[serde(default)]
    pub ready: Option<bool>,

    /// Human-readable summary of the last verdict
    #[serde(default)]
    pub message: Option<String>,

    /// Last fatal parse/apply error
    #[serde(default)]
    pub error: Option<String>,

    /// One entry per expected resource, in manifest order
    #[serde(default)]
    pub resources: Vec<ResourceStatus>,

    /// Digest of the given manifests last applied successfully
    #[serde(default)]
    pub given_digest: Option<String>,

    /// When any other status field last changed
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Comparison outcome for one expected resource
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Resource kind
    pub kind: String,
    /// Resource name
    pub name: String,
    /// Resource namespace (absent for cluster-scoped kinds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Comparison outcome
    pub status: ResourceState,
    /// Why the resource could not be judged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Field paths where the live object diverges
    #[serde(default)]
    pub mismatches: Vec<String>,
}

/// Outcome of comparing one resource
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ResourceState {
    /// Live object contains every expected field
    Matched,
    /// Live object exists but diverges
    Mismatched,
    /// Live object does not exist
    NotFound,
    /// Live object could not be read
    Error,
}

/// Lifecycle state derived from a Lab's status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabState {
    /// No comparison has completed yet
    Initializing,
    /// Latest comparison found at least one mismatch
    NotFixed,
    /// Latest comparison matched every resource
    Ready,
    /// Latest pass hit a fatal error
    Error,
}

impl LabStatus {
    /// Derive the lifecycle state from the persisted fields
    pub fn state(&self) -> LabState {
        if self.error.is_some() {
            return LabState::Error;
        }
        match self.ready {
            None => LabState::Initializing,
            Some(true) => LabState::Ready,
            Some(false) => LabState::NotFixed,
        }
    }
}
