//! Common types for the Lab operator: CRDs, errors, events and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod yaml;

pub use error::{Error, Step};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply and patch issued by the operator
pub const FIELD_MANAGER: &str = "lab-controller";

/// Finalizer that holds a Lab until its given/expected resources are torn down
pub const LAB_FINALIZER: &str = "training.dev/lab-cleanup";

/// Secret data key holding the expected manifest text
pub const EXPECTED_SECRET_KEY: &str = "expected.yaml";

/// Label key marking resources created by the operator
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value for [`LABEL_MANAGED_BY`]
pub const LABEL_MANAGED_BY_LAB_OPERATOR: &str = "lab-operator";

/// Label key recording which Lab owns an operator-created resource
pub const LABEL_LAB_NAME: &str = "training.dev/lab";
