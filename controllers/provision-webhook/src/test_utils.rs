//! Test utilities for unit testing the webhook
//!
//! This module provides helpers for creating requests, stores and engines.

use crate::config::Config;
use crate::engine::Engine;
use crate::metrics::Metrics;
use crate::reconciler::{ReconcileSettings, Reconciler};
use crate::signature::SignatureVerifier;
use crate::translator::{EventType, ProvisionRequest};
use host_store::MockHostStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Namespace used by test stores
pub const TEST_NAMESPACE: &str = "metal3";

/// Shared secret used by signed test requests
pub const TEST_SECRET: &str = "test-secret";

/// Helper to create a request for `resource_name`
pub fn request(event_type: EventType, resource_name: &str, event_id: &str) -> ProvisionRequest {
    ProvisionRequest {
        event_type,
        resource_name: resource_name.to_string(),
        event_id: event_id.to_string(),
        resource_type: None,
        metadata: BTreeMap::new(),
        ssh_public_key: None,
        user_id: None,
        username: None,
        webhook_id: None,
    }
}

/// Helper to create a START request with an image in its metadata
pub fn start_request(resource_name: &str, event_id: &str, image: &str) -> ProvisionRequest {
    let mut request = request(EventType::Start, resource_name, event_id);
    request.metadata.insert("image".to_string(), image.to_string());
    request
}

/// Reconcile settings with millisecond backoff so retry tests stay fast
pub fn fast_settings() -> ReconcileSettings {
    ReconcileSettings {
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(4),
        ..Default::default()
    }
}

/// Helper to create a mock store holding one `available` host per name
pub fn store_with_hosts(names: &[&str]) -> MockHostStore {
    let store = MockHostStore::new(TEST_NAMESPACE);
    for name in names {
        store.add_available_host(name);
    }
    store
}

/// Helper to create a reconciler over `store`
pub fn reconciler(store: &MockHostStore, settings: ReconcileSettings) -> Reconciler {
    Reconciler::new(Arc::new(store.clone()), settings)
}

/// Config as loaded from an environment holding only `vars`
pub fn test_config(vars: &[(&str, &str)]) -> Config {
    let vars: BTreeMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Config::from_lookup(|key| vars.get(key).cloned()).expect("test config should load")
}

/// Helper to create an engine over `store` with fast retries and no notifications
pub fn engine(store: &MockHostStore, secret: Option<&str>, timeout: Duration) -> Engine {
    Engine::new(
        reconciler(store, fast_settings()),
        SignatureVerifier::new(secret),
        Metrics::new().expect("metrics should register"),
        timeout,
    )
}
