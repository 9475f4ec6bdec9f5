//! Provision Webhook
//!
//! Receives signed reservation events and drives Metal³ BareMetalHosts:
//! - EVENT_START: sets the provisioning image (and cloud-init user data)
//! - EVENT_END: clears the image so the operator deprovisions the host
//!
//! Events are applied idempotently (keyed by event id) with optimistic
//! concurrency against the API server, serialized per host.

mod backoff;
mod config;
mod engine;
mod error;
mod locker;
mod metrics;
mod monitor;
mod notifier;
mod outcome;
mod reconciler;
mod server;
mod signature;
mod translator;
#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::engine::Engine;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::monitor::ProvisioningMonitor;
use crate::notifier::{NotificationClient, NotificationSettings};
use crate::reconciler::{ReconcileSettings, Reconciler};
use crate::server::{AppState, create_router};
use crate::signature::SignatureVerifier;
use host_store::KubeHostStore;
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    // kube and reqwest both link rustls; pick the provider explicitly
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider was already installed");
    }

    info!("Starting Provision Webhook");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace);
    info!("  Port: {}", config.port);
    info!(
        "  Provision image: {}",
        config.provision_image.as_deref().unwrap_or("<from event metadata>")
    );
    info!(
        "  Reconcile: timeout {:?}, {} attempts, backoff {:?}..{:?}",
        config.reconcile_timeout, config.reconcile_max_attempts, config.backoff_base, config.backoff_max
    );
    info!(
        "  Notifications: {}",
        config.notification_endpoint.as_deref().unwrap_or("disabled")
    );
    info!(
        "  Webhook logs: {}",
        config.webhook_log_endpoint.as_deref().unwrap_or("disabled")
    );

    let kube_client = Client::try_default().await.map_err(ControllerError::Kube)?;
    let store = KubeHostStore::new(kube_client, config.namespace.clone());
    let hosts_api = store.hosts_api().clone();

    let verifier = SignatureVerifier::new(config.webhook_secret.as_deref());
    let reconciler = Reconciler::new(
        Arc::new(store),
        ReconcileSettings {
            max_attempts: config.reconcile_max_attempts,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
            provision_image: config.provision_image.clone(),
            provision_checksum: config.provision_checksum.clone(),
            provision_checksum_type: config.provision_checksum_type.clone(),
            userdata_user: config.userdata_user.clone(),
        },
    );
    let metrics = Metrics::new().map_err(ControllerError::Metrics)?;
    let engine = Arc::new(Engine::new(
        reconciler,
        verifier.clone(),
        metrics,
        config.reconcile_timeout,
    ));

    let notifier = NotificationClient::new(NotificationSettings::from_config(&config), verifier)
        .map_err(ControllerError::Http)?;
    let monitor = ProvisioningMonitor::new(hosts_api, notifier.clone(), config.provisioning_timeout);

    let state = AppState::new(engine)
        .with_notifier(notifier)
        .with_monitor(monitor);
    let ready = state.ready();
    let app = create_router(state, !config.disable_healthz_logs);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(ControllerError::Io)?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(ready))
        .await
        .map_err(ControllerError::Io)?;

    info!("Provision Webhook stopped");
    Ok(())
}

/// Resolves on SIGINT/SIGTERM and marks the service as not ready.
async fn shutdown_signal(ready: Arc<AtomicBool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    ready.store(false, Ordering::Release);
}
