//! Lab controller: resolves a Lab's manifests, applies the given resources,
//! hides the solution in a Secret and grades live state against it.

#![deny(missing_docs)]

pub mod applier;
pub mod client;
pub mod compare;
pub mod controller;
pub mod engine;
pub mod manifest;
pub mod secret;
pub mod status;
pub mod teardown;

pub use client::{KubeLabClient, LabClient};
pub use controller::{error_policy, reconcile, Context, ControllerConfig};
pub use engine::{on_bootstrap, on_revalidate};
pub use status::LabVerdict;
pub use teardown::{on_teardown, TeardownReport};
