//! Error types for the Lab operator
//!
//! Errors carry enough context to be written verbatim into a Lab's
//! `status.error` and to decide whether the dispatcher should retry.
//! Input errors (bad YAML, missing files, invalid spec) are never retried;
//! transient Kubernetes failures are.

use std::fmt;

use thiserror::Error;

/// Reconciliation step that produced a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Parsing given/expected manifests
    Resolve,
    /// Creating or patching given resources
    Apply,
    /// Writing the expected secret or rewriting the Lab spec
    Materialize,
    /// Reading live objects for comparison
    Fetch,
    /// Deleting resources during teardown
    Delete,
    /// Writing the Lab status
    Status,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Resolve => "resolve",
            Step::Apply => "apply",
            Step::Materialize => "materialize",
            Step::Fetch => "fetch",
            Step::Delete => "delete",
            Step::Status => "status",
        };
        f.write_str(s)
    }
}

/// Main error type for Lab operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A given/expected manifest could not be parsed or loaded
    #[error("invalid manifest for {lab}: {message}")]
    Manifest {
        /// Name of the Lab the manifest belongs to
        lab: String,
        /// Description of what's wrong
        message: String,
        /// Zero-based position of the offending document, when known
        document: Option<usize>,
    },

    /// Validation error for the Lab spec
    #[error("validation error for {lab}: {message}")]
    Validation {
        /// Name of the Lab with invalid configuration
        lab: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.expectedRef.key")
        field: Option<String>,
    },

    /// A manifest names a kind the API server does not serve
    #[error("unknown resource kind {kind} in {api_version}: {message}")]
    UnknownKind {
        /// apiVersion from the manifest
        api_version: String,
        /// Kind from the manifest
        kind: String,
        /// Discovery failure detail
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A reconciliation step failed for a specific resource
    #[error("{step} failed for {resource}: {source}")]
    Step {
        /// Step that failed
        step: Step,
        /// Resource the step was acting on (e.g. "Pod default/busybox")
        resource: String,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a manifest error for a Lab
    pub fn manifest(lab: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            lab: lab.into(),
            message: msg.into(),
            document: None,
        }
    }

    /// Create a manifest error pointing at one document of a multi-document source
    pub fn manifest_at(lab: impl Into<String>, document: usize, msg: impl Into<String>) -> Self {
        Self::Manifest {
            lab: lab.into(),
            message: msg.into(),
            document: Some(document),
        }
    }

    /// Create a validation error with Lab context
    pub fn validation_for(lab: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            lab: lab.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with Lab context and field path
    pub fn validation_for_field(
        lab: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            lab: lab.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an error for a kind discovery could not resolve
    pub fn unknown_kind(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::UnknownKind {
            api_version: api_version.into(),
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Tag an error with the step and resource it came from
    pub fn at_step(step: Step, resource: impl Into<String>, source: Error) -> Self {
        Self::Step {
            step,
            resource: resource.into(),
            source: Box::new(source),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Transient Kubernetes failures (connection errors, 5xx, 409 conflicts,
    /// 429 throttling) are retryable. Other 4xx responses, manifest and
    /// validation errors require a spec change and are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || matches!(ae.code, 409 | 429)
                }
                _ => true,
            },
            Error::Manifest { .. } => false,
            Error::Validation { .. } => false,
            Error::UnknownKind { .. } => false,
            Error::Serialization { .. } => false,
            Error::Step { source, .. } => source.is_retryable(),
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error means the target object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::Step { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// The step this error was tagged with, if any
    pub fn step(&self) -> Option<Step> {
        match self {
            Error::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}
