//! HTTP transport.
//!
//! - `POST /webhook` - signed reservation events
//! - `GET /healthz` - liveness probe
//! - `GET /readyz` - readiness probe
//! - `GET /metrics` - Prometheus metrics

use crate::engine::{Engine, EventResult};
use crate::monitor::{MonitorTarget, ProvisioningMonitor};
use crate::notifier::{NotificationClient, WebhookLog};
use crate::outcome::{ReconciliationOutcome, ResponseStatus};
use crate::signature::SIGNATURE_HEADER;
use crate::translator::EventType;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tower_http::trace::TraceLayer;
use tracing::{Instrument, info_span, warn};
use uuid::Uuid;

/// Shared state for all handlers
#[derive(Clone, Debug)]
pub struct AppState {
    engine: Arc<Engine>,
    notifier: Option<NotificationClient>,
    monitor: Option<ProvisioningMonitor>,
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            notifier: None,
            monitor: None,
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Send webhook logs after applied events
    pub fn with_notifier(mut self, notifier: NotificationClient) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Monitor hosts after an applied START
    pub fn with_monitor(mut self, monitor: ProvisioningMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Readiness flag; cleared on shutdown
    pub fn ready(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    /// Background follow-ups for an applied event
    fn after_event(&self, result: &EventResult, body: &[u8]) {
        if result.outcome != ReconciliationOutcome::Applied {
            return;
        }
        let Some(request) = result.request.as_ref() else {
            return;
        };

        if let Some(notifier) = self.notifier.clone() {
            let log = WebhookLog::new(
                request.webhook_id.as_deref(),
                request.event_type.as_str(),
                &String::from_utf8_lossy(body),
                true,
                Some(result.outcome.http_status()),
                Some(&result.message),
                Some(&request.resource_name),
                Some(json!({
                    "resourceName": request.resource_name,
                    "userId": request.user_id,
                    "eventId": request.event_id,
                })),
            );
            tokio::spawn(async move {
                if let Err(e) = notifier.send_webhook_log(&log).await {
                    warn!("Failed to send webhook log: {}", e);
                }
            });
        }

        if request.event_type == EventType::Start {
            if let (Some(monitor), Some(webhook_id), Some(user_id)) = (
                self.monitor.as_ref(),
                request.webhook_id.as_ref(),
                request.user_id.as_ref(),
            ) {
                monitor.spawn(MonitorTarget {
                    resource_name: request.resource_name.clone(),
                    webhook_id: webhook_id.clone(),
                    user_id: user_id.clone(),
                    event_id: request.event_id.clone(),
                });
            }
        }
    }
}

/// Body returned for every webhook request
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub status: ResponseStatus,
    pub outcome: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub request_id: String,
    pub timestamp: String,
}

/// Create the router; probe routes are traced only when `trace_probes` is set
pub fn create_router(state: AppState, trace_probes: bool) -> Router {
    let webhook = Router::new()
        .route("/webhook", post(handle_webhook))
        .layer(TraceLayer::new_for_http());

    let probes = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics));
    let probes = if trace_probes {
        probes.layer(TraceLayer::new_for_http())
    } else {
        probes
    };

    webhook.merge(probes).with_state(state)
}

async fn handle_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let span = info_span!("webhook", request_id = %request_id);

    async move {
        let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        let result = state.engine.handle(&body, signature).await;
        state.after_event(&result, &body);

        let status = StatusCode::from_u16(result.outcome.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let response = WebhookResponse {
            status: result.outcome.status(),
            outcome: result.outcome.label().to_string(),
            message: result.message,
            resource_name: result.request.as_ref().map(|r| r.resource_name.clone()),
            event_id: result.request.as_ref().map(|r| r.event_id.clone()),
            request_id,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        (status, Json(response)).into_response()
    }
    .instrument(span)
    .await
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "service": "provision-webhook" }))
}

async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    if state.ready.load(Ordering::Acquire) {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "shutting down" })),
        )
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.engine.metrics().render(),
    )
}
