//! BareMetalHost State Store
//!
//! Reads and conditionally writes the provisioning state of Metal³
//! `BareMetalHost` resources. Every write carries the resourceVersion the
//! caller read, so concurrent writers are detected by the API server and
//! surface as `StoreError::TokenMismatch`.
//!
//! # Example
//!
//! ```no_run
//! use host_store::{HostStore, KubeHostStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let store = KubeHostStore::new(client, "metal3");
//!
//! let host = store.get("bmh-node-001").await?;
//! println!("{} is {} at {}", host.name, host.desired_state, host.concurrency_token);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Conditional writes**: merge patches pinned to `metadata.resourceVersion`
//! - **State projection**: operator status folded into a webhook-level lifecycle state
//! - **User data**: cloud-init Secrets applied with server-side apply
//! - **Mocking**: `MockHostStore` behind the `test-util` feature

pub mod client;
pub mod error;
pub mod models;
pub mod userdata;
#[path = "trait.rs"]
pub mod store_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::{FIELD_MANAGER, KubeHostStore};
pub use error::StoreError;
pub use models::*;
pub use store_trait::HostStore;
pub use userdata::{USER_DATA_KEY, render_cloud_config, user_data_secret_name};
#[cfg(feature = "test-util")]
pub use mock::MockHostStore;
