//! Mock HostStore for unit testing
//!
//! Keeps `BareMetalHost` objects in memory and applies updates the way the
//! API server would: resourceVersion is bumped on every write and a stale
//! token is refused. Counters and fault injection let tests assert how many
//! reads and writes a reconciliation issued and whether calls for the same
//! host ever overlapped.

use crate::error::StoreError;
use crate::models::{HostResource, HostUpdate};
use crate::store_trait::HostStore;
use crate::userdata::user_data_secret_name;
use crds::{BareMetalHost, BareMetalHostSpec, BareMetalHostStatus, ProvisionStatus, SecretReference};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock HostStore for testing
#[derive(Clone, Debug)]
pub struct MockHostStore {
    namespace: String,
    hosts: Arc<Mutex<HashMap<String, BareMetalHost>>>,
    user_data: Arc<Mutex<HashMap<String, String>>>,
    reads: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
    write_attempts: Arc<AtomicUsize>,
    forced_mismatches: Arc<AtomicUsize>,
    latency: Arc<Mutex<Option<Duration>>>,
    in_flight: Arc<Mutex<HashMap<String, usize>>>,
    overlaps: Arc<AtomicUsize>,
}

/// Marks a call for `name` as in flight until dropped
struct InFlight<'a> {
    store: &'a MockHostStore,
    name: String,
}

impl<'a> InFlight<'a> {
    fn enter(store: &'a MockHostStore, name: &str) -> Self {
        let mut in_flight = lock(&store.in_flight);
        let count = in_flight.entry(name.to_string()).or_insert(0);
        if *count > 0 {
            store.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        *count += 1;
        Self {
            store,
            name: name.to_string(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.store.in_flight);
        if let Some(count) = in_flight.get_mut(&self.name) {
            *count = count.saturating_sub(1);
        }
    }
}

impl MockHostStore {
    /// Create an empty mock store for `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            hosts: Arc::new(Mutex::new(HashMap::new())),
            user_data: Arc::new(Mutex::new(HashMap::new())),
            reads: Arc::new(AtomicUsize::new(0)),
            writes: Arc::new(AtomicUsize::new(0)),
            write_attempts: Arc::new(AtomicUsize::new(0)),
            forced_mismatches: Arc::new(AtomicUsize::new(0)),
            latency: Arc::new(Mutex::new(None)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            overlaps: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Add a host in the operator's `available` state with no image
    pub fn add_available_host(&self, name: &str) {
        let mut host = BareMetalHost::new(name, BareMetalHostSpec::default());
        host.status = Some(BareMetalHostStatus {
            operational_status: Some("OK".to_string()),
            provisioning: Some(ProvisionStatus {
                state: "available".to_string(),
                image: None,
            }),
            ..Default::default()
        });
        self.add_host(host);
    }

    /// Add a host object; namespace and resourceVersion are filled in if missing
    pub fn add_host(&self, mut host: BareMetalHost) {
        host.metadata.namespace.get_or_insert_with(|| self.namespace.clone());
        host.metadata.resource_version.get_or_insert_with(|| "1".to_string());
        self.add_raw_host(host);
    }

    /// Add a host object exactly as given
    pub fn add_raw_host(&self, host: BareMetalHost) {
        let name = host.metadata.name.clone().unwrap_or_default();
        lock(&self.hosts).insert(name, host);
    }

    /// Current stored object
    pub fn host(&self, name: &str) -> Option<BareMetalHost> {
        lock(&self.hosts).get(name).cloned()
    }

    /// Current projected state, without counting as a read
    pub fn resource(&self, name: &str) -> Option<HostResource> {
        self.host(name)
            .and_then(|h| HostResource::from_bare_metal_host(&h).ok())
    }

    /// Simulate the operator reporting a provisioning state
    pub fn set_provisioning_state(&self, name: &str, state: &str) {
        self.mutate_status(name, |status| {
            status.provisioning.get_or_insert_with(ProvisionStatus::default).state = state.to_string();
        });
    }

    /// Simulate the operator reporting a failure
    pub fn set_error(&self, name: &str, error_type: &str) {
        self.mutate_status(name, |status| {
            status.error_type = Some(error_type.to_string());
            status.operational_status = Some("error".to_string());
        });
    }

    fn mutate_status(&self, name: &str, f: impl FnOnce(&mut BareMetalHostStatus)) {
        let mut hosts = lock(&self.hosts);
        if let Some(host) = hosts.get_mut(name) {
            f(host.status.get_or_insert_with(BareMetalHostStatus::default));
            bump_resource_version(host);
        }
    }

    /// User data stored for `name`, if any
    pub fn user_data(&self, name: &str) -> Option<String> {
        lock(&self.user_data).get(name).cloned()
    }

    /// Number of `get` calls served
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of successful conditional writes
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of conditional writes attempted, successful or not
    pub fn write_attempt_count(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Number of times a call started while another call for the same host was in flight
    pub fn overlap_count(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Make the next `count` conditional writes fail as if another writer raced us.
    ///
    /// Each forced failure also bumps the stored resourceVersion.
    pub fn fail_next_updates_with_mismatch(&self, count: usize) {
        self.forced_mismatches.store(count, Ordering::SeqCst);
    }

    /// Make every conditional write fail with a token mismatch
    pub fn always_mismatch(&self) {
        self.fail_next_updates_with_mismatch(usize::MAX);
    }

    /// Delay every store call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    async fn simulate_latency(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_forced_mismatch(&self) -> bool {
        self.forced_mismatches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

fn bump_resource_version(host: &mut BareMetalHost) {
    let next = host
        .metadata
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    host.metadata.resource_version = Some(next.to_string());
}

fn apply_update(host: &mut BareMetalHost, update: &HostUpdate) {
    host.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .extend(update.annotations());
    host.spec.image = update.image.clone();
    host.spec.user_data = update.user_data.clone();
    bump_resource_version(host);
}

#[async_trait::async_trait]
impl HostStore for MockHostStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, name: &str) -> Result<HostResource, StoreError> {
        let _in_flight = InFlight::enter(self, name);
        self.simulate_latency().await;
        self.reads.fetch_add(1, Ordering::SeqCst);

        let host = self
            .host(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        HostResource::from_bare_metal_host(&host)
    }

    async fn conditional_update(
        &self,
        name: &str,
        update: &HostUpdate,
        expected_token: &str,
    ) -> Result<(), StoreError> {
        let _in_flight = InFlight::enter(self, name);
        self.simulate_latency().await;
        self.write_attempts.fetch_add(1, Ordering::SeqCst);

        let mut hosts = lock(&self.hosts);
        let host = hosts
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        if self.take_forced_mismatch() {
            bump_resource_version(host);
            return Err(StoreError::TokenMismatch(name.to_string()));
        }
        if host.metadata.resource_version.as_deref() != Some(expected_token) {
            return Err(StoreError::TokenMismatch(name.to_string()));
        }

        apply_update(host, update);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_user_data(
        &self,
        name: &str,
        cloud_config: &str,
    ) -> Result<SecretReference, StoreError> {
        self.simulate_latency().await;
        lock(&self.user_data).insert(name.to_string(), cloud_config.to_string());
        Ok(SecretReference {
            name: Some(user_data_secret_name(name)),
            namespace: Some(self.namespace.clone()),
        })
    }
}
