//! Event pipeline.
//!
//! verify signature → translate → filter resource type → lock host →
//! reconcile (bounded by a deadline) → outcome. Every path yields exactly one
//! `ReconciliationOutcome`; the store is never touched for unauthenticated or
//! unparseable input.

use crate::locker::ResourceLocker;
use crate::metrics::Metrics;
use crate::outcome::{FailureReason, IgnoreReason, ReconciliationOutcome, RejectReason};
use crate::reconciler::Reconciler;
use crate::signature::{SignatureVerifier, Verification};
use crate::translator::{ProvisionRequest, TranslateError, translate};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of handling one inbound event
#[derive(Debug, Clone)]
pub struct EventResult {
    pub outcome: ReconciliationOutcome,
    /// The parsed request, when the payload got that far
    pub request: Option<ProvisionRequest>,
    pub message: String,
}

impl EventResult {
    fn new(outcome: ReconciliationOutcome, request: Option<ProvisionRequest>, message: String) -> Self {
        Self {
            outcome,
            request,
            message,
        }
    }
}

/// Runs inbound events through verification and reconciliation
#[derive(Debug)]
pub struct Engine {
    reconciler: Reconciler,
    verifier: SignatureVerifier,
    locker: ResourceLocker,
    metrics: Metrics,
    /// Overall deadline per event, lock wait included
    deadline: Duration,
}

impl Engine {
    pub fn new(
        reconciler: Reconciler,
        verifier: SignatureVerifier,
        metrics: Metrics,
        deadline: Duration,
    ) -> Self {
        Self {
            reconciler,
            verifier,
            locker: ResourceLocker::new(),
            metrics,
            deadline,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    #[cfg(test)]
    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    /// Handles one raw webhook body and its claimed signature.
    pub async fn handle(&self, body: &[u8], signature: Option<&str>) -> EventResult {
        let result = self.process(body, signature).await;
        self.metrics.record_outcome(result.outcome);

        let event_id = result.request.as_ref().map_or("-", |r| r.event_id.as_str());
        let resource = result.request.as_ref().map_or("-", |r| r.resource_name.as_str());
        if result.outcome.is_retryable() {
            warn!(
                "Event {} for {}: {} ({})",
                event_id, resource, result.outcome, result.message
            );
        } else {
            info!(
                "Event {} for {}: {} ({})",
                event_id, resource, result.outcome, result.message
            );
        }
        result
    }

    async fn process(&self, body: &[u8], signature: Option<&str>) -> EventResult {
        if self.verifier.verify(body, signature) == Verification::Invalid {
            warn!("Rejecting webhook with invalid or missing signature");
            return EventResult::new(
                ReconciliationOutcome::Rejected(RejectReason::InvalidSignature),
                None,
                "Invalid webhook signature".to_string(),
            );
        }

        let request = match translate(body) {
            Ok(request) => request,
            Err(TranslateError::Unsupported(event_type)) => {
                return EventResult::new(
                    ReconciliationOutcome::Ignored(IgnoreReason::UnsupportedEventType),
                    None,
                    format!("Event type {} is not handled", event_type),
                );
            }
            Err(e) => {
                return EventResult::new(
                    ReconciliationOutcome::Rejected(RejectReason::MalformedPayload),
                    None,
                    e.to_string(),
                );
            }
        };

        debug!(
            "Translated {} for {} (event {}, user {})",
            request.event_type,
            request.resource_name,
            request.event_id,
            request.username.as_deref().unwrap_or("-")
        );

        if !request.is_server() {
            let message = format!(
                "Resource type {} is not a server",
                request.resource_type.as_deref().unwrap_or_default()
            );
            return EventResult::new(
                ReconciliationOutcome::Ignored(IgnoreReason::NonServerResource),
                Some(request),
                message,
            );
        }

        let started = Instant::now();
        // Outlives the reconcile future so cancelled attempts are still counted
        let attempts = AtomicU32::new(0);
        let reconciled = tokio::time::timeout(
            self.deadline,
            self.locker.with_lock(&request.resource_name, || {
                self.reconciler.reconcile(&request, &attempts)
            }),
        )
        .await;

        let outcome = reconciled.unwrap_or_else(|_| {
            warn!(
                "Reconciliation of {} (event {}) exceeded {:?} after {} attempts",
                request.resource_name,
                request.event_id,
                self.deadline,
                attempts.load(Ordering::Relaxed)
            );
            ReconciliationOutcome::Failed(FailureReason::Timeout)
        });
        self.metrics
            .record_reconcile(attempts.load(Ordering::Relaxed), started.elapsed());

        let message = describe(outcome, &request);
        EventResult::new(outcome, Some(request), message)
    }
}

/// Human-readable message for the response body
fn describe(outcome: ReconciliationOutcome, request: &ProvisionRequest) -> String {
    let name = &request.resource_name;
    match outcome {
        ReconciliationOutcome::Applied => {
            format!("{} applied to BareMetalHost {}", request.event_type, name)
        }
        ReconciliationOutcome::NoOpAlreadyApplied => {
            format!("BareMetalHost {} already reflects {}", name, request.event_type)
        }
        ReconciliationOutcome::Ignored(_) => format!("Event for {} ignored", name),
        ReconciliationOutcome::Rejected(RejectReason::NotFound) => {
            format!("BareMetalHost {} not found", name)
        }
        ReconciliationOutcome::Rejected(RejectReason::InvalidTransition) => format!(
            "{} is not valid for BareMetalHost {} in its current state",
            request.event_type, name
        ),
        ReconciliationOutcome::Rejected(RejectReason::InvalidImage) => {
            format!("No provisioning image available for {}", name)
        }
        ReconciliationOutcome::Rejected(RejectReason::MalformedPayload) => {
            format!("Invalid provisioning data for {}", name)
        }
        ReconciliationOutcome::Rejected(RejectReason::InvalidSignature) => {
            "Invalid webhook signature".to_string()
        }
        ReconciliationOutcome::Failed(FailureReason::Conflict) => {
            format!("BareMetalHost {} kept changing concurrently; retry later", name)
        }
        ReconciliationOutcome::Failed(FailureReason::Timeout) => {
            format!("Reconciliation of {} timed out; retry later", name)
        }
        ReconciliationOutcome::Failed(FailureReason::Store) => {
            format!("Kubernetes API error while updating {}; retry later", name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use crate::reconciler::{ReconcileSettings, Reconciler};
    use host_store::DesiredState;
    use std::sync::Arc;

    fn attempts_total(engine: &Engine) -> u64 {
        engine
            .metrics()
            .render()
            .lines()
            .find_map(|line| line.strip_prefix("provision_webhook_reconcile_attempts_total "))
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or_default()
    }

    const HOST: &str = "bmh-node-001";
    const START: &[u8] = br#"{"eventType":"EVENT_START","resourceName":"bmh-node-001","eventId":"evt-1","metadata":{"image":"img://provision-v1"}}"#;
    const END: &[u8] = br#"{"eventType":"EVENT_END","resourceName":"bmh-node-001","eventId":"evt-2"}"#;

    #[tokio::test]
    async fn test_documented_event_sequence() {
        let store = store_with_hosts(&[HOST]);
        let engine = engine(&store, None, Duration::from_secs(5));

        let first = engine.handle(START, None).await;
        assert_eq!(first.outcome, ReconciliationOutcome::Applied);
        let host = store.resource(HOST).expect("host exists");
        assert_eq!(host.desired_state, DesiredState::Provisioning);
        assert_eq!(host.image.as_deref(), Some("img://provision-v1"));
        assert_eq!(host.last_applied_event_id.as_deref(), Some("evt-1"));

        let resent = engine.handle(START, None).await;
        assert_eq!(resent.outcome, ReconciliationOutcome::NoOpAlreadyApplied);
        assert_eq!(store.resource(HOST), Some(host));

        store.set_provisioning_state(HOST, "provisioning");
        let end = engine.handle(END, None).await;
        assert_eq!(end.outcome, ReconciliationOutcome::Applied);
        let host = store.resource(HOST).expect("host exists");
        assert_eq!(host.desired_state, DesiredState::Deprovisioning);
        assert_eq!(host.image, None);
    }

    #[tokio::test]
    async fn test_bad_signature_never_touches_store() {
        let store = store_with_hosts(&[HOST]);
        let engine = engine(&store, Some(TEST_SECRET), Duration::from_secs(5));

        for signature in [None, Some("deadbeef"), Some("sha256=00")] {
            let result = engine.handle(START, signature).await;
            assert_eq!(
                result.outcome,
                ReconciliationOutcome::Rejected(RejectReason::InvalidSignature)
            );
            assert!(result.request.is_none(), "Payload must not be parsed");
        }
        assert_eq!(store.read_count(), 0);
        assert_eq!(store.write_attempt_count(), 0);

        let signature = engine.verifier().sign(START);
        let result = engine.handle(START, signature.as_deref()).await;
        assert_eq!(result.outcome, ReconciliationOutcome::Applied);
    }

    #[tokio::test]
    async fn test_bad_input_never_touches_store() {
        let store = store_with_hosts(&[HOST]);
        let engine = engine(&store, None, Duration::from_secs(5));

        let malformed = engine.handle(br#"{"eventType":"EVENT_START"}"#, None).await;
        assert_eq!(
            malformed.outcome,
            ReconciliationOutcome::Rejected(RejectReason::MalformedPayload)
        );

        let unsupported = engine
            .handle(br#"{"eventType":"EVENT_DELETED","resourceName":"bmh-node-001","eventId":"e"}"#, None)
            .await;
        assert_eq!(
            unsupported.outcome,
            ReconciliationOutcome::Ignored(IgnoreReason::UnsupportedEventType)
        );

        let switch = engine
            .handle(
                br#"{"eventType":"EVENT_START","resourceName":"sw-1","eventId":"e","resourceType":"Switch"}"#,
                None,
            )
            .await;
        assert_eq!(
            switch.outcome,
            ReconciliationOutcome::Ignored(IgnoreReason::NonServerResource)
        );

        assert_eq!(store.read_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_events_for_one_host_do_not_interleave() {
        let store = store_with_hosts(&[HOST]);
        store.set_latency(Duration::from_millis(5));
        let engine = Arc::new(engine(&store, None, Duration::from_secs(10)));

        let mut handles = Vec::new();
        for i in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                let body = format!(
                    r#"{{"eventType":"EVENT_START","resourceName":"bmh-node-001","eventId":"evt-{}","metadata":{{"image":"img://provision-v1"}}}}"#,
                    i
                );
                engine.handle(body.as_bytes(), None).await.outcome
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.expect("task should not panic"));
        }

        let applied = outcomes
            .iter()
            .filter(|o| **o == ReconciliationOutcome::Applied)
            .count();
        assert_eq!(applied, 1, "Exactly one START should win: {:?}", outcomes);
        assert!(
            outcomes
                .iter()
                .all(|o| matches!(o, ReconciliationOutcome::Applied | ReconciliationOutcome::NoOpAlreadyApplied))
        );
        assert_eq!(store.overlap_count(), 0, "Store calls for one host overlapped");
        assert_eq!(store.write_attempt_count(), 1, "No write should have conflicted");
    }

    #[tokio::test]
    async fn test_different_hosts_proceed_independently() {
        let store = store_with_hosts(&["bmh-a", "bmh-b"]);
        let engine = Arc::new(engine(&store, None, Duration::from_secs(10)));

        let a = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .handle(br#"{"eventType":"EVENT_START","resourceName":"bmh-a","eventId":"1","metadata":{"image":"img://a"}}"#, None)
                    .await
                    .outcome
            })
        };
        let b = engine
            .handle(br#"{"eventType":"EVENT_START","resourceName":"bmh-b","eventId":"2","metadata":{"image":"img://b"}}"#, None)
            .await
            .outcome;

        assert_eq!(a.await.expect("task should not panic"), ReconciliationOutcome::Applied);
        assert_eq!(b, ReconciliationOutcome::Applied);
    }

    #[tokio::test]
    async fn test_deadline_yields_timeout_and_releases_lock() {
        let store = store_with_hosts(&[HOST]);
        store.set_latency(Duration::from_millis(200));
        let engine = engine(&store, None, Duration::from_millis(50));

        let result = engine.handle(START, None).await;
        assert_eq!(result.outcome, ReconciliationOutcome::Failed(FailureReason::Timeout));
        assert!(result.outcome.is_retryable());

        store.set_latency(Duration::ZERO);
        let retried = engine.handle(START, None).await;
        assert_eq!(
            retried.outcome,
            ReconciliationOutcome::Applied,
            "Lock must be released after a timeout"
        );
    }

    #[tokio::test]
    async fn test_deadline_covers_lock_wait() {
        let store = store_with_hosts(&[HOST]);
        let engine = engine(&store, None, Duration::from_millis(100));

        // Another event holds the host's lock for longer than the deadline
        let locker = engine.locker.clone();
        let (acquired_tx, acquired_rx) = tokio::sync::oneshot::channel::<()>();
        let holder = tokio::spawn(async move {
            locker
                .with_lock(HOST, || async move {
                    let _ = acquired_tx.send(());
                    tokio::time::sleep(Duration::from_millis(300)).await;
                })
                .await;
        });
        acquired_rx.await.expect("holder should acquire the lock");

        let waiting = engine.handle(START, None).await;
        assert_eq!(waiting.outcome, ReconciliationOutcome::Failed(FailureReason::Timeout));
        assert_eq!(store.read_count(), 0, "Timed out while still waiting for the lock");
        assert_eq!(attempts_total(&engine), 0);

        holder.await.expect("task should not panic");
        let retried = engine.handle(START, None).await;
        assert_eq!(
            retried.outcome,
            ReconciliationOutcome::Applied,
            "Lock must be usable after a waiter timed out"
        );
    }

    #[tokio::test]
    async fn test_deadline_cuts_conflict_retries_short() {
        let store = store_with_hosts(&[HOST]);
        store.always_mismatch();
        let settings = ReconcileSettings {
            max_attempts: u32::MAX,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(10),
            ..ReconcileSettings::default()
        };
        let engine = Engine::new(
            Reconciler::new(Arc::new(store.clone()), settings),
            crate::signature::SignatureVerifier::new(None),
            crate::metrics::Metrics::new().expect("metrics should register"),
            Duration::from_millis(150),
        );

        let result = engine.handle(START, None).await;
        assert_eq!(result.outcome, ReconciliationOutcome::Failed(FailureReason::Timeout));
        assert!(store.write_attempt_count() > 1, "Retries should have run before the deadline");
        assert!(
            attempts_total(&engine) > 1,
            "Attempts started before the deadline are counted"
        );
        assert!(attempts_total(&engine) >= store.write_attempt_count() as u64);

        store.fail_next_updates_with_mismatch(0);
        let retried = engine.handle(START, None).await;
        assert_eq!(retried.outcome, ReconciliationOutcome::Applied);
    }

    #[tokio::test]
    async fn test_unknown_host_is_rejected() {
        let store = store_with_hosts(&[]);
        let engine = engine(&store, None, Duration::from_secs(5));

        let result = engine.handle(START, None).await;
        assert_eq!(result.outcome, ReconciliationOutcome::Rejected(RejectReason::NotFound));
        assert_eq!(result.outcome.http_status(), 404);
    }
}
