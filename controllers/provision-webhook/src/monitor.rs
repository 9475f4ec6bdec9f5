//! Provisioning monitor.
//!
//! After a START has been applied, watches the BareMetalHost until the
//! operator reports a terminal provisioning state (or the timeout expires)
//! and reports the result to the reservation owner.

use crate::notifier::{NotificationClient, WebhookLog};
use crds::{BareMetalHost, ProvisioningState};
use futures::StreamExt;
use kube::Api;
use kube_runtime::{WatchStreamExt, watcher};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where a host stands from the monitor's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningProgress {
    Pending,
    Provisioned,
    Failed(String),
}

/// Classifies the operator-reported state of `host`.
///
/// Any operator-reported failure counts, including an `errorType` set while
/// the state machine still reads `provisioning`.
pub fn classify(host: &BareMetalHost) -> ProvisioningProgress {
    if host.has_error() {
        let detail = host
            .status
            .as_ref()
            .and_then(|s| s.error_message.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "provisioning failed".to_string());
        return ProvisioningProgress::Failed(detail);
    }
    match host.provisioning_state() {
        ProvisioningState::Provisioned => ProvisioningProgress::Provisioned,
        _ => ProvisioningProgress::Pending,
    }
}

/// Identifies whom to notify about one provisioning run
#[derive(Debug, Clone)]
pub struct MonitorTarget {
    pub resource_name: String,
    pub webhook_id: String,
    pub user_id: String,
    pub event_id: String,
}

/// Watches hosts after provisioning starts and sends the result notification
#[derive(Clone)]
pub struct ProvisioningMonitor {
    hosts: Api<BareMetalHost>,
    notifier: NotificationClient,
    timeout: Duration,
}

impl std::fmt::Debug for ProvisioningMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningMonitor")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ProvisioningMonitor {
    pub fn new(hosts: Api<BareMetalHost>, notifier: NotificationClient, timeout: Duration) -> Self {
        Self {
            hosts,
            notifier,
            timeout,
        }
    }

    /// Starts monitoring `target` in the background.
    pub fn spawn(&self, target: MonitorTarget) {
        let monitor = self.clone();
        tokio::spawn(async move {
            monitor.run(target).await;
        });
        debug!("Provisioning monitor spawned");
    }

    async fn run(&self, target: MonitorTarget) {
        info!(
            "Monitoring provisioning of {} (timeout {:?})",
            target.resource_name, self.timeout
        );

        let result = match tokio::time::timeout(self.timeout, self.wait_for_provisioning(&target.resource_name)).await {
            Ok(result) => result,
            Err(_) => Err(format!("timed out after {}s", self.timeout.as_secs())),
        };

        match &result {
            Ok(()) => info!("BareMetalHost {} provisioned", target.resource_name),
            Err(reason) => error!(
                "Provisioning of BareMetalHost {} failed: {}",
                target.resource_name, reason
            ),
        }
        self.report(&target, result).await;
    }

    /// Resolves once the host reaches a terminal state.
    async fn wait_for_provisioning(&self, name: &str) -> Result<(), String> {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
        let mut stream = Box::pin(watcher(self.hosts.clone(), config).default_backoff());
        let mut seen = false;

        while let Some(event) = stream.next().await {
            let host = match event {
                Ok(watcher::Event::Apply(host) | watcher::Event::InitApply(host)) => host,
                Ok(watcher::Event::Delete(_)) => {
                    return Err("BareMetalHost was deleted".to_string());
                }
                Ok(watcher::Event::Init) => continue,
                Ok(watcher::Event::InitDone) => {
                    if !seen {
                        return Err("BareMetalHost not found".to_string());
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Watch error for BareMetalHost {}: {}", name, e);
                    continue;
                }
            };

            seen = true;
            match classify(&host) {
                ProvisioningProgress::Provisioned => return Ok(()),
                ProvisioningProgress::Failed(reason) => return Err(reason),
                ProvisioningProgress::Pending => {
                    debug!(
                        "BareMetalHost {} is {:?}, still waiting",
                        name,
                        host.provisioning_state()
                    );
                }
            }
        }

        Err("watch stream ended".to_string())
    }

    async fn report(&self, target: &MonitorTarget, result: Result<(), String>) {
        let error_message = result.as_ref().err().map(String::as_str);
        let success = result.is_ok();

        let notification = self.notifier.provisioning_notification(
            Some(&target.webhook_id),
            &target.user_id,
            &target.resource_name,
            success,
            error_message,
            Some(&target.event_id),
        );
        if let Err(e) = self.notifier.send_provisioning_notification(&notification).await {
            warn!(
                "Failed to send provisioning notification for {}: {}",
                target.resource_name, e
            );
        }

        let response = match error_message {
            None => "Provisioning completed successfully".to_string(),
            Some(reason) => format!("Provisioning failed: {}", reason),
        };
        let log = WebhookLog::new(
            Some(&target.webhook_id),
            "EVENT_START",
            &format!("Provisioning monitoring for resource '{}'", target.resource_name),
            success,
            Some(if success { 200 } else { 500 }),
            Some(&response),
            Some(&target.resource_name),
            Some(json!({
                "resourceName": target.resource_name,
                "userId": target.user_id,
                "eventId": target.event_id,
                "errorMessage": error_message,
            })),
        );
        if let Err(e) = self.notifier.send_webhook_log(&log).await {
            warn!("Failed to send webhook log for {}: {}", target.resource_name, e);
        }
    }
}
