//! Outbound notifications
//!
//! Reports webhook processing and provisioning results back to the
//! reservation system. Bodies are compact JSON signed with the same shared
//! secret used for inbound events. Endpoints are optional; an unset endpoint
//! turns the corresponding call into a no-op.

use crate::config::Config;
use crate::signature::{SIGNATURE_HEADER, SignatureVerifier};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Longest payload/response text forwarded in a webhook log
const MAX_LOG_TEXT: usize = 4000;

/// Errors that can occur while delivering a notification
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint answered with a non-success status
    #[error("Endpoint {endpoint} returned {status}")]
    Status { endpoint: String, status: u16 },

    /// Body serialization error
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Record of one processed webhook event
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookLog {
    pub webhook_id: Value,
    pub event_type: String,
    pub payload: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub response: Option<String>,
    pub retry_count: u32,
    pub resource_id: Option<String>,
    pub metadata: Option<Value>,
}

impl WebhookLog {
    /// Builds a log entry, truncating `payload` and `response` to the accepted length.
    #[allow(clippy::too_many_arguments, reason = "mirrors the receiver's log schema")]
    pub fn new(
        webhook_id: Option<&str>,
        event_type: &str,
        payload: &str,
        success: bool,
        status_code: Option<u16>,
        response: Option<&str>,
        resource_id: Option<&str>,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            webhook_id: id_value(webhook_id),
            event_type: event_type.to_string(),
            payload: truncate(payload),
            success,
            status_code,
            response: response.map(truncate),
            retry_count: 0,
            resource_id: resource_id.map(str::to_string),
            metadata,
        }
    }
}

/// Provisioning result sent to the reservation owner
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningNotification {
    pub webhook_id: Value,
    pub user_id: String,
    pub message: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub event_id: Option<String>,
    pub resource_id: String,
    pub event_type: String,
    pub metadata: Value,
}

/// Numeric ids are forwarded as JSON numbers, everything else as strings.
fn id_value(id: Option<&str>) -> Value {
    match id {
        None => Value::Null,
        Some(id) => id
            .parse::<i64>()
            .map_or_else(|_| Value::String(id.to_string()), Value::from),
    }
}

/// Cuts `text` to at most `MAX_LOG_TEXT` characters, marking the cut with `...`.
pub fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_LOG_TEXT {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MAX_LOG_TEXT - 3).collect();
    cut.push_str("...");
    cut
}

/// Endpoints and timeouts for outbound notifications
#[derive(Debug, Clone, Default)]
pub struct NotificationSettings {
    pub notification_endpoint: Option<String>,
    pub notification_timeout: Duration,
    pub webhook_log_endpoint: Option<String>,
    pub webhook_log_timeout: Duration,
    /// Namespace reported in notification metadata
    pub namespace: String,
    /// Login user named in the success message
    pub login_user: String,
}

impl NotificationSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            notification_endpoint: config.notification_endpoint.clone(),
            notification_timeout: config.notification_timeout,
            webhook_log_endpoint: config.webhook_log_endpoint.clone(),
            webhook_log_timeout: config.webhook_log_timeout,
            namespace: config.namespace.clone(),
            login_user: config.userdata_user.clone(),
        }
    }
}

/// HTTP client for notification and webhook-log endpoints
#[derive(Debug, Clone)]
pub struct NotificationClient {
    client: Client,
    signer: SignatureVerifier,
    settings: NotificationSettings,
}

impl NotificationClient {
    /// Create a new notification client
    pub fn new(settings: NotificationSettings, signer: SignatureVerifier) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("provision-webhook/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            signer,
            settings,
        })
    }

    /// Builds the provisioning result notification for `resource_name`.
    pub fn provisioning_notification(
        &self,
        webhook_id: Option<&str>,
        user_id: &str,
        resource_name: &str,
        success: bool,
        error_message: Option<&str>,
        event_id: Option<&str>,
    ) -> ProvisioningNotification {
        let (message, notification_type, event_type) = if success {
            (
                format!(
                    "Your bare metal server reservation '{}' has been successfully provisioned and will be \
                     available soon after the system boot completes. This could take some minutes. \
                     You can login using SSH with the user '{}' and your configured SSH key.",
                    resource_name, self.settings.login_user
                ),
                "SUCCESS",
                "PROVISIONING_COMPLETED",
            )
        } else {
            (
                format!(
                    "Your bare metal server reservation '{}' provisioning failed. Error: {}",
                    resource_name,
                    error_message.unwrap_or("Unknown error occurred")
                ),
                "ERROR",
                "PROVISIONING_FAILED",
            )
        };

        ProvisioningNotification {
            webhook_id: id_value(webhook_id),
            user_id: user_id.to_string(),
            message,
            notification_type: notification_type.to_string(),
            event_id: event_id.map(str::to_string),
            resource_id: resource_name.to_string(),
            event_type: event_type.to_string(),
            metadata: json!({
                "resourceType": "BareMetalHost",
                "resourceName": resource_name,
                "namespace": self.settings.namespace,
            }),
        }
    }

    /// Sends a provisioning notification; skipped when no endpoint is configured.
    pub async fn send_provisioning_notification(
        &self,
        notification: &ProvisioningNotification,
    ) -> Result<(), NotifyError> {
        let Some(endpoint) = self.settings.notification_endpoint.as_deref() else {
            debug!("No notification endpoint configured, skipping notification");
            return Ok(());
        };
        info!(
            "Sending provisioning notification for {} ({})",
            notification.resource_id, notification.notification_type
        );
        self.post(endpoint, notification, self.settings.notification_timeout)
            .await
    }

    /// Sends a webhook log entry; skipped when no endpoint is configured.
    pub async fn send_webhook_log(&self, log: &WebhookLog) -> Result<(), NotifyError> {
        let Some(endpoint) = self.settings.webhook_log_endpoint.as_deref() else {
            debug!("No webhook log endpoint configured, skipping webhook log");
            return Ok(());
        };
        info!(
            "Sending webhook log for {} (success: {})",
            log.event_type, log.success
        );
        self.post(endpoint, log, self.settings.webhook_log_timeout)
            .await
    }

    async fn post<T: Serialize>(
        &self,
        endpoint: &str,
        body: &T,
        timeout: Duration,
    ) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(body)?;

        let mut request = self
            .client
            .post(endpoint)
            .timeout(timeout)
            .header("Content-Type", "application/json");
        if let Some(signature) = self.signer.sign(&body) {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        debug!("Delivered notification to {}: {}", endpoint, status);
        Ok(())
    }
}
