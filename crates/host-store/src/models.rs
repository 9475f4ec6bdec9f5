//! Host state models
//!
//! `HostResource` is the engine's view of a `BareMetalHost`: the lifecycle
//! state it is driving, the image, the optimistic-concurrency token and the
//! ids of the most recent events applied. `HostUpdate` is the mutation
//! written back with a conditional merge patch.

use chrono::{DateTime, SecondsFormat, Utc};
use crds::{BareMetalHost, HostImage, ProvisioningState, SecretReference};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::StoreError;

/// Annotation carrying the id of the last event applied to the host
pub const LAST_APPLIED_EVENT_ID_ANNOTATION: &str =
    "provisioning.dcops.microscaler.io/last-applied-event-id";

/// Annotation carrying a JSON array of recently applied event ids, oldest first
pub const APPLIED_EVENT_IDS_ANNOTATION: &str = "provisioning.dcops.microscaler.io/applied-event-ids";

/// Number of applied event ids remembered per host
pub const APPLIED_EVENT_HISTORY: usize = 16;

/// Annotation carrying the lifecycle state last driven by the webhook
pub const DESIRED_STATE_ANNOTATION: &str = "provisioning.dcops.microscaler.io/desired-state";

/// Annotation carrying the RFC 3339 timestamp of the last write
pub const LAST_APPLIED_AT_ANNOTATION: &str = "provisioning.dcops.microscaler.io/last-applied-at";

/// Lifecycle state of a host from the webhook's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DesiredState {
    Available,
    Provisioning,
    Provisioned,
    Deprovisioning,
    Error,
}

impl DesiredState {
    /// PascalCase name, as stored in the desired-state annotation
    pub fn as_str(self) -> &'static str {
        match self {
            DesiredState::Available => "Available",
            DesiredState::Provisioning => "Provisioning",
            DesiredState::Provisioned => "Provisioned",
            DesiredState::Deprovisioning => "Deprovisioning",
            DesiredState::Error => "Error",
        }
    }

    /// Parses an annotation value; unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "Available" => Some(DesiredState::Available),
            "Provisioning" => Some(DesiredState::Provisioning),
            "Provisioned" => Some(DesiredState::Provisioned),
            "Deprovisioning" => Some(DesiredState::Deprovisioning),
            "Error" => Some(DesiredState::Error),
            _ => None,
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Freshly read state of one `BareMetalHost`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostResource {
    pub name: String,
    pub desired_state: DesiredState,
    /// Image URL, present while provisioning or provisioned
    pub image: Option<String>,
    /// `metadata.resourceVersion` at read time
    pub concurrency_token: String,
    pub last_applied_event_id: Option<String>,
    /// Recently applied event ids, oldest first, at most `APPLIED_EVENT_HISTORY`
    pub applied_event_ids: Vec<String>,
    /// Raw state reported by the operator
    pub observed_state: ProvisioningState,
}

impl HostResource {
    /// Projects a `BareMetalHost` onto the engine's view.
    ///
    /// Fails when the object has no name or no resourceVersion, since no
    /// conditional write could be issued against it.
    pub fn from_bare_metal_host(host: &BareMetalHost) -> Result<Self, StoreError> {
        let name = host
            .metadata
            .name
            .clone()
            .ok_or_else(|| StoreError::InvalidResource("BareMetalHost missing name".to_string()))?;
        let concurrency_token = host.metadata.resource_version.clone().ok_or_else(|| {
            StoreError::InvalidResource(format!("BareMetalHost {} missing resourceVersion", name))
        })?;

        let last_applied_event_id = annotation(host, LAST_APPLIED_EVENT_ID_ANNOTATION)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let applied_event_ids = applied_event_ids(host, last_applied_event_id.as_deref());

        Ok(Self {
            name,
            desired_state: derive_desired_state(host),
            image: host.spec.image.as_ref().map(|i| i.url.clone()),
            concurrency_token,
            last_applied_event_id,
            applied_event_ids,
            observed_state: host.provisioning_state(),
        })
    }
}

impl HostResource {
    /// Whether `event_id` is among the events already applied to this host
    pub fn has_applied(&self, event_id: &str) -> bool {
        self.last_applied_event_id.as_deref() == Some(event_id)
            || self.applied_event_ids.iter().any(|id| id == event_id)
    }

    /// Event history to write back once `event_id` has been applied.
    ///
    /// `event_id` moves to the end; the oldest ids are dropped beyond
    /// `APPLIED_EVENT_HISTORY`.
    pub fn history_with(&self, event_id: &str) -> Vec<String> {
        let mut history: Vec<String> = self
            .applied_event_ids
            .iter()
            .filter(|id| id.as_str() != event_id)
            .cloned()
            .collect();
        history.push(event_id.to_string());
        let excess = history.len().saturating_sub(APPLIED_EVENT_HISTORY);
        history.drain(..excess);
        history
    }
}

/// Reads the applied-event history, tolerating a missing or unparseable
/// annotation. The last applied id is always part of the result.
fn applied_event_ids(host: &BareMetalHost, last_applied: Option<&str>) -> Vec<String> {
    let mut ids: Vec<String> = annotation(host, APPLIED_EVENT_IDS_ANNOTATION)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    ids.retain(|id| !id.is_empty());
    if let Some(last) = last_applied {
        if !ids.iter().any(|id| id == last) {
            ids.push(last.to_string());
        }
    }
    let excess = ids.len().saturating_sub(APPLIED_EVENT_HISTORY);
    ids.drain(..excess);
    ids
}

fn annotation<'a>(host: &'a BareMetalHost, key: &str) -> Option<&'a str> {
    host.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Combines the state recorded by the webhook with what the operator reports.
///
/// An operator-reported failure always wins. Otherwise the recorded state is
/// advanced once the operator has caught up with it (Provisioning becomes
/// Provisioned, Deprovisioning becomes Available). Deprovisioning only settles
/// once the operator reports the host available again with no provisioned
/// image left in its status. Hosts never touched by the webhook are
/// classified from their image and observed state.
pub fn derive_desired_state(host: &BareMetalHost) -> DesiredState {
    if host.has_error() {
        return DesiredState::Error;
    }

    let observed = host.provisioning_state();
    let has_image = host.spec.image.is_some();
    let recorded = annotation(host, DESIRED_STATE_ANNOTATION).and_then(DesiredState::parse);

    match recorded {
        Some(DesiredState::Provisioning) => {
            if observed == ProvisioningState::Provisioned {
                DesiredState::Provisioned
            } else {
                DesiredState::Provisioning
            }
        }
        Some(DesiredState::Deprovisioning) => {
            let settled = matches!(observed, ProvisioningState::Available | ProvisioningState::Ready);
            if settled && !has_image && !host.has_provisioned_image() {
                DesiredState::Available
            } else {
                DesiredState::Deprovisioning
            }
        }
        Some(other) => other,
        None if has_image => {
            if observed == ProvisioningState::Provisioned {
                DesiredState::Provisioned
            } else {
                DesiredState::Provisioning
            }
        }
        None if observed == ProvisioningState::Deprovisioning => DesiredState::Deprovisioning,
        None => DesiredState::Available,
    }
}

/// Mutation issued by the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostUpdate {
    pub desired_state: DesiredState,
    /// `None` clears the image (deprovisioning)
    pub image: Option<HostImage>,
    /// `None` clears the user-data reference
    pub user_data: Option<SecretReference>,
    pub event_id: String,
    /// Applied-event history including `event_id`, see `HostResource::history_with`
    pub applied_event_ids: Vec<String>,
    pub applied_at: DateTime<Utc>,
}

impl HostUpdate {
    /// Annotations written with this update
    pub fn annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LAST_APPLIED_EVENT_ID_ANNOTATION.to_string(), self.event_id.clone()),
            (
                APPLIED_EVENT_IDS_ANNOTATION.to_string(),
                serde_json::Value::from(self.applied_event_ids.clone()).to_string(),
            ),
            (DESIRED_STATE_ANNOTATION.to_string(), self.desired_state.as_str().to_string()),
            (
                LAST_APPLIED_AT_ANNOTATION.to_string(),
                self.applied_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ])
    }

    /// Builds the JSON merge patch for this update.
    ///
    /// `metadata.resourceVersion` makes the API server reject the patch with
    /// 409 when the object changed since `expected_token` was read. Image
    /// fields are always listed so that stale values from an earlier image
    /// are removed rather than merged.
    pub fn to_merge_patch(&self, expected_token: &str) -> serde_json::Value {
        let image = self.image.as_ref().map(|image| {
            json!({
                "url": image.url,
                "checksum": image.checksum,
                "checksumType": image.checksum_type,
                "diskFormat": image.disk_format,
            })
        });
        let user_data = self.user_data.as_ref().map(|secret| {
            json!({
                "name": secret.name,
                "namespace": secret.namespace,
            })
        });

        json!({
            "metadata": {
                "resourceVersion": expected_token,
                "annotations": self.annotations(),
            },
            "spec": {
                "image": image,
                "userData": user_data,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{BareMetalHostSpec, BareMetalHostStatus, ProvisionStatus};
    use std::collections::BTreeMap;

    fn host(
        image: Option<&str>,
        recorded: Option<DesiredState>,
        observed: &str,
    ) -> BareMetalHost {
        let mut host = BareMetalHost::new(
            "bmh-node-001",
            BareMetalHostSpec {
                image: image.map(|url| HostImage {
                    url: url.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        host.metadata.resource_version = Some("7".to_string());
        if let Some(state) = recorded {
            host.metadata.annotations = Some(BTreeMap::from([(
                DESIRED_STATE_ANNOTATION.to_string(),
                state.as_str().to_string(),
            )]));
        }
        host.status = Some(BareMetalHostStatus {
            provisioning: Some(ProvisionStatus {
                state: observed.to_string(),
                image: None,
            }),
            ..Default::default()
        });
        host
    }

    #[test]
    fn test_desired_state_roundtrip_names() {
        for state in [
            DesiredState::Available,
            DesiredState::Provisioning,
            DesiredState::Provisioned,
            DesiredState::Deprovisioning,
            DesiredState::Error,
        ] {
            assert_eq!(DesiredState::parse(state.as_str()), Some(state));
        }
        assert_eq!(DesiredState::parse("provisioning"), None);
    }

    #[test]
    fn test_untouched_host_without_image_is_available() {
        assert_eq!(derive_desired_state(&host(None, None, "available")), DesiredState::Available);
    }

    #[test]
    fn test_untouched_host_with_image_follows_operator() {
        assert_eq!(
            derive_desired_state(&host(Some("http://img"), None, "provisioning")),
            DesiredState::Provisioning
        );
        assert_eq!(
            derive_desired_state(&host(Some("http://img"), None, "provisioned")),
            DesiredState::Provisioned
        );
    }

    #[test]
    fn test_recorded_provisioning_advances_when_provisioned() {
        let pending = host(Some("http://img"), Some(DesiredState::Provisioning), "available");
        assert_eq!(derive_desired_state(&pending), DesiredState::Provisioning);

        let done = host(Some("http://img"), Some(DesiredState::Provisioning), "provisioned");
        assert_eq!(derive_desired_state(&done), DesiredState::Provisioned);
    }

    #[test]
    fn test_recorded_deprovisioning_settles_to_available() {
        let draining = host(None, Some(DesiredState::Deprovisioning), "deprovisioning");
        assert_eq!(derive_desired_state(&draining), DesiredState::Deprovisioning);

        let stale_status = host(None, Some(DesiredState::Deprovisioning), "provisioned");
        assert_eq!(derive_desired_state(&stale_status), DesiredState::Deprovisioning);

        let settled = host(None, Some(DesiredState::Deprovisioning), "available");
        assert_eq!(derive_desired_state(&settled), DesiredState::Available);
    }

    #[test]
    fn test_deprovisioning_waits_for_provisioned_image_release() {
        let mut releasing = host(None, Some(DesiredState::Deprovisioning), "available");
        if let Some(provisioning) = releasing.status.as_mut().and_then(|s| s.provisioning.as_mut()) {
            provisioning.image = Some(HostImage {
                url: "img://provision-v1".to_string(),
                ..Default::default()
            });
        }
        assert_eq!(derive_desired_state(&releasing), DesiredState::Deprovisioning);
    }

    #[test]
    fn test_applied_history_falls_back_to_last_applied() {
        let mut h = host(None, None, "available");
        h.metadata.annotations = Some(BTreeMap::from([
            (LAST_APPLIED_EVENT_ID_ANNOTATION.to_string(), "evt-3".to_string()),
            (APPLIED_EVENT_IDS_ANNOTATION.to_string(), r#"["evt-1","evt-2"]"#.to_string()),
        ]));
        let resource = HostResource::from_bare_metal_host(&h).expect("projection should succeed");
        assert_eq!(resource.applied_event_ids, vec!["evt-1", "evt-2", "evt-3"]);
        assert!(resource.has_applied("evt-1"));
        assert!(!resource.has_applied("evt-4"));

        h.metadata.annotations = Some(BTreeMap::from([
            (LAST_APPLIED_EVENT_ID_ANNOTATION.to_string(), "evt-3".to_string()),
            (APPLIED_EVENT_IDS_ANNOTATION.to_string(), "not json".to_string()),
        ]));
        let resource = HostResource::from_bare_metal_host(&h).expect("projection should succeed");
        assert_eq!(resource.applied_event_ids, vec!["evt-3"]);
    }

    #[test]
    fn test_history_is_bounded_and_moves_repeats_to_end() {
        let h = host(None, None, "available");
        let mut resource = HostResource::from_bare_metal_host(&h).expect("projection should succeed");
        resource.applied_event_ids = (0..APPLIED_EVENT_HISTORY).map(|n| format!("evt-{}", n)).collect();

        let history = resource.history_with("evt-new");
        assert_eq!(history.len(), APPLIED_EVENT_HISTORY);
        assert_eq!(history.first().map(String::as_str), Some("evt-1"));
        assert_eq!(history.last().map(String::as_str), Some("evt-new"));

        let history = resource.history_with("evt-3");
        assert_eq!(history.len(), APPLIED_EVENT_HISTORY);
        assert_eq!(history.last().map(String::as_str), Some("evt-3"));
        assert_eq!(history.iter().filter(|id| id.as_str() == "evt-3").count(), 1);
    }

    #[test]
    fn test_operator_error_wins() {
        let mut failed = host(Some("http://img"), Some(DesiredState::Provisioning), "provisioning");
        if let Some(status) = failed.status.as_mut() {
            status.error_type = Some("provisioning error".to_string());
        }
        assert_eq!(derive_desired_state(&failed), DesiredState::Error);
    }

    #[test]
    fn test_from_bare_metal_host_requires_resource_version() {
        let mut h = host(None, None, "available");
        h.metadata.resource_version = None;
        let result = HostResource::from_bare_metal_host(&h);
        assert!(matches!(result, Err(StoreError::InvalidResource(_))));
    }

    #[test]
    fn test_from_bare_metal_host_reads_annotations() {
        let mut h = host(Some("http://img"), Some(DesiredState::Provisioning), "provisioning");
        if let Some(annotations) = h.metadata.annotations.as_mut() {
            annotations.insert(LAST_APPLIED_EVENT_ID_ANNOTATION.to_string(), "evt-1".to_string());
        }

        let resource = HostResource::from_bare_metal_host(&h).expect("projection should succeed");
        assert_eq!(resource.name, "bmh-node-001");
        assert_eq!(resource.concurrency_token, "7");
        assert_eq!(resource.image.as_deref(), Some("http://img"));
        assert_eq!(resource.last_applied_event_id.as_deref(), Some("evt-1"));
        assert_eq!(resource.desired_state, DesiredState::Provisioning);
    }

    #[test]
    fn test_merge_patch_carries_token_and_clears_image() {
        let update = HostUpdate {
            desired_state: DesiredState::Deprovisioning,
            image: None,
            user_data: None,
            event_id: "evt-2".to_string(),
            applied_event_ids: vec!["evt-1".to_string(), "evt-2".to_string()],
            applied_at: Utc::now(),
        };
        let patch = update.to_merge_patch("42");

        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["metadata"]["annotations"][LAST_APPLIED_EVENT_ID_ANNOTATION], "evt-2");
        assert_eq!(patch["metadata"]["annotations"][DESIRED_STATE_ANNOTATION], "Deprovisioning");
        assert_eq!(
            patch["metadata"]["annotations"][APPLIED_EVENT_IDS_ANNOTATION],
            r#"["evt-1","evt-2"]"#
        );
        assert!(patch["spec"]["image"].is_null(), "image must be cleared explicitly");
        assert!(patch["spec"]["userData"].is_null(), "userData must be cleared explicitly");
    }

    #[test]
    fn test_merge_patch_lists_every_image_field() {
        let update = HostUpdate {
            desired_state: DesiredState::Provisioning,
            image: Some(HostImage {
                url: "img://provision-v1".to_string(),
                checksum: Some("abc".to_string()),
                checksum_type: Some("sha256".to_string()),
                disk_format: None,
            }),
            user_data: Some(SecretReference {
                name: Some("bmh-node-001-userdata".to_string()),
                namespace: Some("metal3".to_string()),
            }),
            event_id: "evt-1".to_string(),
            applied_event_ids: vec!["evt-1".to_string()],
            applied_at: Utc::now(),
        };
        let patch = update.to_merge_patch("1");

        assert_eq!(patch["spec"]["image"]["url"], "img://provision-v1");
        assert_eq!(patch["spec"]["image"]["checksumType"], "sha256");
        let image = patch["spec"]["image"].as_object().expect("image should be an object");
        assert!(image.contains_key("diskFormat"), "unset fields are sent as null");
        assert_eq!(patch["spec"]["userData"]["name"], "bmh-node-001-userdata");
    }
}
