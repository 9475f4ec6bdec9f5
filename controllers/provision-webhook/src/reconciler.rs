//! Reconciliation logic.
//!
//! Applies one `ProvisionRequest` to its `BareMetalHost` with a
//! read-decide-write cycle. The write presents the resourceVersion read at the
//! start of the attempt; when another writer got there first the whole cycle
//! is repeated on fresh state, up to `max_attempts`, with exponential backoff
//! between attempts.
//!
//! Callers are expected to hold the per-host lock from `ResourceLocker`.

use crate::backoff::ExponentialBackoff;
use crate::outcome::{FailureReason, ReconciliationOutcome, RejectReason};
use crate::translator::{EventType, ProvisionRequest};
use chrono::Utc;
use crds::{HostImage, SecretReference};
use host_store::{DesiredState, HostResource, HostStore, HostUpdate, StoreError, render_cloud_config};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Knobs for the reconciler
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Fallback image when a START carries none
    pub provision_image: Option<String>,
    pub provision_checksum: Option<String>,
    pub provision_checksum_type: String,
    /// Login user for generated cloud-init user data
    pub userdata_user: String,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(5000),
            provision_image: None,
            provision_checksum: None,
            provision_checksum_type: "sha256".to_string(),
            userdata_user: "provision".to_string(),
        }
    }
}

/// What a single attempt decided to do
#[derive(Debug)]
enum Plan {
    NoOp,
    Write {
        target: DesiredState,
        image: Option<HostImage>,
    },
}

/// How a single attempt ended
#[derive(Debug)]
enum AttemptResult {
    Done(ReconciliationOutcome),
    /// Token mismatch on write; worth another attempt
    Conflict,
}

/// Event-to-BareMetalHost reconciler
pub struct Reconciler {
    store: Arc<dyn HostStore>,
    settings: ReconcileSettings,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("namespace", &self.store.namespace())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Reconciler {
    /// Creates a new reconciler over `store`.
    pub fn new(store: Arc<dyn HostStore>, settings: ReconcileSettings) -> Self {
        Self { store, settings }
    }

    /// Drives `request` to a terminal outcome.
    ///
    /// Every read-modify-write cycle started is added to `counter`, which
    /// stays readable when the caller cancels the future on a deadline.
    pub async fn reconcile(
        &self,
        request: &ProvisionRequest,
        counter: &AtomicU32,
    ) -> ReconciliationOutcome {
        let mut backoff = ExponentialBackoff::new(self.settings.backoff_base, self.settings.backoff_max);
        // Applied at most once per request, even across conflict retries
        let mut user_data: Option<SecretReference> = None;
        let mut attempts = 0;

        loop {
            attempts += 1;
            counter.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Reconciling {} {} (event {}) attempt {}/{}",
                request.event_type, request.resource_name, request.event_id, attempts,
                self.settings.max_attempts
            );

            match self.attempt(request, &mut user_data).await {
                AttemptResult::Done(outcome) => return outcome,
                AttemptResult::Conflict if attempts < self.settings.max_attempts => {
                    let delay = backoff.next_backoff();
                    warn!(
                        "Concurrency conflict on {} (event {}), retrying in {:?} (attempt {}/{})",
                        request.resource_name, request.event_id, delay, attempts,
                        self.settings.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                AttemptResult::Conflict => {
                    error!(
                        "Giving up on {} (event {}) after {} conflicting attempts",
                        request.resource_name, request.event_id, attempts
                    );
                    return ReconciliationOutcome::Failed(FailureReason::Conflict);
                }
            }
        }
    }

    /// One read-decide-write cycle against fresh state.
    async fn attempt(
        &self,
        request: &ProvisionRequest,
        user_data: &mut Option<SecretReference>,
    ) -> AttemptResult {
        let name = &request.resource_name;

        let host = match self.store.get(name).await {
            Ok(host) => host,
            Err(e) => return AttemptResult::Done(store_failure(name, &e)),
        };

        if host.has_applied(&request.event_id) {
            info!(
                "Event {} already applied to {}, nothing to do",
                request.event_id, name
            );
            return AttemptResult::Done(ReconciliationOutcome::NoOpAlreadyApplied);
        }

        let (target, image) = match self.plan(request, &host) {
            Ok(Plan::NoOp) => {
                info!(
                    "{} is already {} for {}, nothing to do",
                    name, host.desired_state, request.event_type
                );
                return AttemptResult::Done(ReconciliationOutcome::NoOpAlreadyApplied);
            }
            Ok(Plan::Write { target, image }) => (target, image),
            Err(reason) => {
                warn!(
                    "Rejecting {} for {} in state {}: {:?}",
                    request.event_type, name, host.desired_state, reason
                );
                return AttemptResult::Done(ReconciliationOutcome::Rejected(reason));
            }
        };

        if request.event_type == EventType::Start && user_data.is_none() {
            if let Some(ssh_key) = request.ssh_public_key.as_deref() {
                match self.apply_user_data(name, ssh_key).await {
                    Ok(reference) => *user_data = Some(reference),
                    Err(outcome) => return AttemptResult::Done(outcome),
                }
            }
        }

        let update = HostUpdate {
            desired_state: target,
            image,
            user_data: match request.event_type {
                EventType::Start => user_data.clone(),
                EventType::End => None,
            },
            event_id: request.event_id.clone(),
            applied_event_ids: host.history_with(&request.event_id),
            applied_at: Utc::now(),
        };

        match self
            .store
            .conditional_update(name, &update, &host.concurrency_token)
            .await
        {
            Ok(()) => {
                info!(
                    "Applied {} to {}: {} -> {} (event {})",
                    request.event_type, name, host.desired_state, target, request.event_id
                );
                AttemptResult::Done(ReconciliationOutcome::Applied)
            }
            Err(StoreError::TokenMismatch(_)) => AttemptResult::Conflict,
            Err(e) => AttemptResult::Done(store_failure(name, &e)),
        }
    }

    /// Decides the transition for `request` given the freshly read state.
    fn plan(&self, request: &ProvisionRequest, host: &HostResource) -> Result<Plan, RejectReason> {
        match (request.event_type, host.desired_state) {
            (EventType::Start, DesiredState::Available | DesiredState::Error) => {
                let image = self.resolve_image(request).ok_or(RejectReason::InvalidImage)?;
                Ok(Plan::Write {
                    target: DesiredState::Provisioning,
                    image: Some(image),
                })
            }
            (EventType::Start, DesiredState::Provisioning | DesiredState::Provisioned) => Ok(Plan::NoOp),
            (EventType::End, DesiredState::Provisioning | DesiredState::Provisioned) => Ok(Plan::Write {
                target: DesiredState::Deprovisioning,
                image: None,
            }),
            (EventType::End, DesiredState::Available | DesiredState::Deprovisioning) => Ok(Plan::NoOp),
            (EventType::Start, DesiredState::Deprovisioning) | (EventType::End, DesiredState::Error) => {
                Err(RejectReason::InvalidTransition)
            }
        }
    }

    /// Image for a START: request metadata first, configured defaults second.
    fn resolve_image(&self, request: &ProvisionRequest) -> Option<HostImage> {
        let url = request
            .image()
            .or(self.settings.provision_image.as_deref())
            .map(str::trim)
            .filter(|url| !url.is_empty())?;

        let checksum = request
            .metadata_value("imageChecksum")
            .or(self.settings.provision_checksum.as_deref())
            .map(str::to_string);
        let checksum_type = request
            .metadata_value("imageChecksumType")
            .unwrap_or(&self.settings.provision_checksum_type)
            .to_string();

        Some(HostImage {
            url: url.to_string(),
            checksum,
            checksum_type: Some(checksum_type),
            disk_format: None,
        })
    }

    async fn apply_user_data(
        &self,
        name: &str,
        ssh_key: &str,
    ) -> Result<SecretReference, ReconciliationOutcome> {
        let cloud_config = render_cloud_config(&self.settings.userdata_user, ssh_key).map_err(|e| {
            warn!("Cannot build user data for {}: {}", name, e);
            ReconciliationOutcome::Rejected(RejectReason::MalformedPayload)
        })?;

        self.store
            .apply_user_data(name, &cloud_config)
            .await
            .map_err(|e| {
                error!("Failed to apply user data secret for {}: {}", name, e);
                ReconciliationOutcome::Failed(FailureReason::Store)
            })
    }
}

/// Maps a store error outside the retry path onto an outcome.
fn store_failure(name: &str, error: &StoreError) -> ReconciliationOutcome {
    match error {
        StoreError::NotFound(_) => {
            warn!("BareMetalHost {} not found", name);
            ReconciliationOutcome::Rejected(RejectReason::NotFound)
        }
        other => {
            error!("Store error while reconciling {}: {}", name, other);
            ReconciliationOutcome::Failed(FailureReason::Store)
        }
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
