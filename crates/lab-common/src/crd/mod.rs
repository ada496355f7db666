//! Custom Resource Definitions for the Lab operator

mod lab;

pub use lab::{
    ExpectedRef, ExpectedSource, Lab, LabSpec, LabState, LabStatus, ManifestSource,
    ResourceState, ResourceStatus, MESSAGE_INITIALIZING, MESSAGE_NOT_FIXED, MESSAGE_READY,
};
