//! Host store errors

use thiserror::Error;

/// Errors that can occur when reading or writing `BareMetalHost` state
#[derive(Debug, Error)]
pub enum StoreError {
    /// The named BareMetalHost does not exist in the target namespace
    #[error("BareMetalHost not found: {0}")]
    NotFound(String),

    /// The concurrency token presented with a write is stale
    #[error("Concurrency token mismatch for BareMetalHost {0}")]
    TokenMismatch(String),

    /// Kubernetes API error other than not-found/conflict
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The stored object cannot be projected (e.g. missing resourceVersion)
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// User data could not be rendered
    #[error("Invalid user data: {0}")]
    InvalidUserData(String),

    /// YAML serialization error
    #[error("Serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl StoreError {
    /// Maps a Kubernetes API error for `name` onto the store taxonomy.
    ///
    /// 404 becomes `NotFound` and 409 becomes `TokenMismatch`; anything else is
    /// passed through as `Kube`.
    pub fn from_kube(name: &str, error: kube::Error) -> Self {
        match error {
            kube::Error::Api(ref response) if response.code == 404 => {
                StoreError::NotFound(name.to_string())
            }
            kube::Error::Api(ref response) if response.code == 409 => {
                StoreError::TokenMismatch(name.to_string())
            }
            other => StoreError::Kube(other),
        }
    }
}
