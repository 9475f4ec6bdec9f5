//! BareMetalHost CRD
//!
//! Typed view of the Metal³ `BareMetalHost` resource. The resource is owned by
//! the baremetal-operator; only the fields the provisioning webhook reads or
//! writes are modelled here; everything else round-trips untouched because
//! writes are issued as merge patches.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "metal3.io",
    version = "v1alpha1",
    kind = "BareMetalHost",
    namespaced,
    status = "BareMetalHostStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalHostSpec {
    /// Whether the host should be powered on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,

    /// MAC address of the NIC used for provisioning
    #[serde(default, rename = "bootMACAddress", skip_serializing_if = "Option::is_none")]
    pub boot_mac_address: Option<String>,

    /// Image to write to the host; removing it triggers deprovisioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<HostImage>,

    /// Secret holding cloud-init user data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<SecretReference>,
}

/// Boot/provisioning image reference
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HostImage {
    /// Image URL
    pub url: String,

    /// Checksum value or URL of the checksum file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Checksum algorithm (md5, sha256, sha512)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_type: Option<String>,

    /// Disk format (raw, qcow2, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_format: Option<String>,
}

/// Namespaced Secret reference (mirrors `core/v1 SecretReference`)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Secret name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Secret namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalHostStatus {
    /// Overall health reported by the operator (OK, discovered, error, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operational_status: Option<String>,

    /// Failure category when the host is in an error condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    /// Human-readable failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Provisioning progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning: Option<ProvisionStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionStatus {
    /// Provisioning state machine position as reported by the operator
    #[serde(default)]
    pub state: String,

    /// Image most recently provisioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<HostImage>,
}

/// Provisioning state reported in `status.provisioning.state`.
///
/// Kept out of the serialized schema: the operator adds states across
/// releases, so the raw string is stored and parsed on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProvisioningState {
    /// No state reported yet
    #[default]
    None,
    Registering,
    Inspecting,
    Preparing,
    Ready,
    Available,
    Provisioning,
    Provisioned,
    Deprovisioning,
    ExternallyProvisioned,
    PoweringOffBeforeDelete,
    Deleting,
    /// Failure reported by older operator releases
    Error,
    /// A state this crate does not know about
    Unknown,
}

impl ProvisioningState {
    /// Parses the operator's state string (case-insensitive).
    #[must_use]
    pub fn parse(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "" => Self::None,
            "registering" => Self::Registering,
            "inspecting" => Self::Inspecting,
            "preparing" => Self::Preparing,
            "ready" => Self::Ready,
            "available" => Self::Available,
            "provisioning" => Self::Provisioning,
            "provisioned" => Self::Provisioned,
            "deprovisioning" => Self::Deprovisioning,
            "externally provisioned" => Self::ExternallyProvisioned,
            "powering off before delete" => Self::PoweringOffBeforeDelete,
            "deleting" => Self::Deleting,
            "error" | "failed" => Self::Error,
            _ => Self::Unknown,
        }
    }
}

impl BareMetalHost {
    /// Observed provisioning state, `None` when the operator has not reported one.
    #[must_use]
    pub fn provisioning_state(&self) -> ProvisioningState {
        self.status
            .as_ref()
            .and_then(|s| s.provisioning.as_ref())
            .map_or(ProvisioningState::None, |p| ProvisioningState::parse(&p.state))
    }

    /// Whether the operator still reports a provisioned image in its status.
    #[must_use]
    pub fn has_provisioned_image(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.provisioning.as_ref())
            .and_then(|p| p.image.as_ref())
            .is_some_and(|image| !image.url.is_empty())
    }

    /// Whether the operator reports the host as failed.
    #[must_use]
    pub fn has_error(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        let error_type_set = status.error_type.as_deref().is_some_and(|t| !t.is_empty());
        let operational_error = status
            .operational_status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("error"));
        error_type_set || operational_error || self.provisioning_state() == ProvisioningState::Error
    }
}
