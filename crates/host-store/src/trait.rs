//! HostStore trait for mocking
//!
//! This trait abstracts the Kubernetes-backed store so the reconciler can be
//! unit tested against an in-memory implementation.

use crate::error::StoreError;
use crate::models::{HostResource, HostUpdate};
use crds::SecretReference;

/// Authoritative store of `BareMetalHost` state
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait HostStore: Send + Sync {
    /// Namespace the store operates in
    fn namespace(&self) -> &str;

    /// Reads the current state of `name`.
    ///
    /// Returns `StoreError::NotFound` when the host does not exist.
    async fn get(&self, name: &str) -> Result<HostResource, StoreError>;

    /// Writes `update` only if the object still carries `expected_token`.
    ///
    /// Returns `StoreError::TokenMismatch` when another writer got there
    /// first and `StoreError::NotFound` when the host vanished.
    async fn conditional_update(
        &self,
        name: &str,
        update: &HostUpdate,
        expected_token: &str,
    ) -> Result<(), StoreError>;

    /// Creates or replaces the user-data Secret for `name` and returns a
    /// reference suitable for `spec.userData`.
    async fn apply_user_data(
        &self,
        name: &str,
        cloud_config: &str,
    ) -> Result<SecretReference, StoreError>;
}
