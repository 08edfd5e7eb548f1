//! Generated bindings for the kubelet device plugin API (`v1beta1`).
#![allow(clippy::doc_markdown)]

pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

/// Version string the kubelet expects in `RegisterRequest.version`.
pub const VERSION: &str = "v1beta1";

/// Health value for a device the kubelet may schedule onto.
pub const HEALTHY: &str = "Healthy";

/// Health value for a device the kubelet must stop scheduling onto.
pub const UNHEALTHY: &str = "Unhealthy";
