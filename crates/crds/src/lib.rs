//! DCops CRD Definitions
//!
//! Kubernetes resource types consumed by the provisioning webhook. The
//! Metal³ `BareMetalHost` is owned by the baremetal-operator; only the fields
//! the webhook reads or writes are modelled.

pub mod bare_metal_host;

pub use bare_metal_host::*;
