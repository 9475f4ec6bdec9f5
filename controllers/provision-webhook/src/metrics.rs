//! Prometheus Metrics
//!
//! Metrics tracked:
//! - `provision_webhook_events_total{outcome}` - events by terminal outcome
//! - `provision_webhook_reconcile_attempts_total` - read-modify-write cycles started
//! - `provision_webhook_reconcile_duration_seconds` - time from lock request to outcome

use crate::outcome::ReconciliationOutcome;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Registry and handles for all webhook metrics
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    events: IntCounterVec,
    reconcile_attempts: IntCounter,
    reconcile_duration: Histogram,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create and register all metrics in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events = IntCounterVec::new(
            Opts::new("provision_webhook_events_total", "Webhook events by outcome"),
            &["outcome"],
        )?;
        let reconcile_attempts = IntCounter::new(
            "provision_webhook_reconcile_attempts_total",
            "Read-modify-write cycles started against BareMetalHosts",
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "provision_webhook_reconcile_duration_seconds",
                "Time from lock request to terminal outcome",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;

        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(reconcile_attempts.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            registry,
            events,
            reconcile_attempts,
            reconcile_duration,
        })
    }

    /// Record the terminal outcome of one event
    pub fn record_outcome(&self, outcome: ReconciliationOutcome) {
        self.events.with_label_values(&[outcome.label()]).inc();
    }

    /// Record a finished reconciliation
    pub fn record_reconcile(&self, attempts: u32, duration: Duration) {
        self.reconcile_attempts.inc_by(u64::from(attempts));
        self.reconcile_duration.observe(duration.as_secs_f64());
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
