use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use derive_builder::Builder;
use thiserror::Error;

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Couldn't connect to the store at '{}'! Reason: {}", .endpoint, .source)]
    Connect {
        endpoint: String,
        source: etcd_client::Error,
    },
    #[error("Store request failed! Reason: {}", .0)]
    Request(etcd_client::Error),
    #[error("Store {} request timed out after {:?}!", .0, .1)]
    Timeout(&'static str, Duration),
    #[error("Couldn't read TLS material from '{}'! Reason: {}", .path.display(), .source)]
    TlsMaterial {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Secure endpoint '{}' requires both a client certificate and a key!", .0)]
    MissingClientIdentity(String),
}

/// Flat string key-value store shared by every plugin invocation.
///
/// Single operations are atomic; nothing spanning two calls is.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Creates `key` only if it doesn't exist yet. Returns whether this call
    /// created it.
    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError> {
        (**self).get_prefix(prefix).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).put(key, value).await
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        (**self).put_if_absent(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key).await
    }
}

#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct StoreOptions {
    pub endpoint: String,
    #[builder(default)]
    pub cert_file: Option<PathBuf>,
    #[builder(default)]
    pub key_file: Option<PathBuf>,
    #[builder(default)]
    pub trusted_ca_file: Option<PathBuf>,
    #[builder(default = "DEFAULT_STORE_TIMEOUT")]
    pub timeout: Duration,
}

impl StoreOptions {
    pub fn is_secure(&self) -> bool {
        self.endpoint.starts_with("https")
    }
}
