//! Client-side lock orchestration.
//!
//! The request layer ([`HttpLockClient`]) speaks the server's JSON protocol
//! and keeps an optional advisory [`LruCache`](cache::LruCache) of observed
//! ownership. Session scoping, the pounce queue, and the watcher all sit on
//! top of the [`LockRpc`] seam so they can run against any transport.

pub mod cache;
pub mod pounce;
pub mod session;
pub mod watcher;

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::constants::{DEFAULT_CACHE_CAPACITY, DEFAULT_SESSION_LEASE};
use crate::client::cache::{CacheError, LruCache};

/// The request pair naming the target object and the claimed holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "fileID")]
    pub file_id: String,
    #[serde(rename = "userID")]
    pub user_id: String,
}

impl Descriptor {
    pub fn new(file_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Client-side failures.
#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("request transport failed: {source}"))]
    Transport { source: reqwest::Error },

    #[snafu(display("failed to decode server response: {source}"))]
    Decode { source: serde_json::Error },

    /// The server answered with a non-success status; `message` is the
    /// error body (e.g. "file already acquired").
    #[snafu(display("server rejected request: {message}"))]
    Rejected { message: String },

    #[snafu(display("the session related to this process doesn't exist"))]
    SessionInexistent,

    #[snafu(display("session expired"))]
    SessionExpired,

    #[snafu(display("owner is already queued for this object"))]
    AlreadyQueued,
}

/// Transport seam for everything above the request layer.
///
/// `check_acquire` answers `Some(owner)` while the object is held and `None`
/// once it is free.
pub trait LockRpc: Send + Sync {
    fn acquire(&self, desc: &Descriptor) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn release(&self, desc: &Descriptor) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn check_acquire(
        &self,
        file_id: &str,
    ) -> impl Future<Output = Result<Option<String>, ClientError>> + Send;
}

/// Client configuration: where to reach the service and how to scope
/// sessions.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// host:port of any node's application listener.
    pub server_addr: String,
    /// Capacity of the advisory ownership cache; `None` disables it.
    pub cache_capacity: Option<usize>,
    /// Lifetime of a session created through [`session::SessionManager`].
    pub session_lease: Duration,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            cache_capacity: Some(DEFAULT_CACHE_CAPACITY),
            session_lease: DEFAULT_SESSION_LEASE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CheckAcquireBody {
    owner: String,
}

/// HTTP implementation of [`LockRpc`] against a node's application listener.
pub struct HttpLockClient {
    http: reqwest::Client,
    base_url: String,
    cache: Option<LruCache>,
}

impl HttpLockClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("http://{}", config.server_addr),
            cache: config.cache_capacity.map(LruCache::new),
        }
    }

    async fn post_lock(&self, path: &str, desc: &Descriptor) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/{path}", self.base_url))
            .json(desc)
            .send()
            .await
            .context(TransportSnafu)?;
        let status = response.status();
        let body = response.text().await.context(TransportSnafu)?;
        if status.is_success() {
            Ok(())
        } else {
            RejectedSnafu { message: body }.fail()
        }
    }

    /// Refresh the cached owner for an object, replacing a stale entry.
    fn cache_insert(&self, file_id: &str, owner: &str) {
        if let Some(cache) = &self.cache {
            if cache.put(file_id, owner) == Err(CacheError::AlreadyExists) {
                let _ = cache.remove(file_id);
                let _ = cache.put(file_id, owner);
            }
        }
    }
}

impl LockRpc for HttpLockClient {
    async fn acquire(&self, desc: &Descriptor) -> Result<(), ClientError> {
        // The cache is advisory: a hit is worth logging but the server stays
        // authoritative, so the request goes out either way.
        if let Some(cache) = &self.cache {
            if let Ok(owner) = cache.get(&desc.file_id) {
                debug!(object = %desc.file_id, cached_owner = %owner, "cache reports object held");
            }
        }
        self.post_lock("acquire", desc).await?;
        self.cache_insert(&desc.file_id, &desc.user_id);
        Ok(())
    }

    async fn release(&self, desc: &Descriptor) -> Result<(), ClientError> {
        self.post_lock("release", desc).await?;
        if let Some(cache) = &self.cache {
            let _ = cache.remove(&desc.file_id);
        }
        Ok(())
    }

    async fn check_acquire(&self, file_id: &str) -> Result<Option<String>, ClientError> {
        let response = self
            .http
            .post(format!("{}/checkAcquire", self.base_url))
            .json(&serde_json::json!({ "fileID": file_id }))
            .send()
            .await
            .context(TransportSnafu)?;
        let status = response.status();
        let body = response.text().await.context(TransportSnafu)?;
        if status.is_success() {
            let parsed: CheckAcquireBody = serde_json::from_str(&body).context(DecodeSnafu)?;
            Ok(Some(parsed.owner))
        } else if body == "file is not acquired" {
            Ok(None)
        } else {
            RejectedSnafu { message: body }.fail()
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-process transport backed by a real lock store, used by the
    //! session/watcher/pounce tests.

    use std::sync::Arc;
    use std::time::Duration;

    use crate::store::LockStore;

    use super::*;

    pub struct InProcessRpc {
        store: Arc<LockStore>,
    }

    impl InProcessRpc {
        pub fn new() -> Self {
            Self {
                store: Arc::new(LockStore::new(Duration::from_secs(3600))),
            }
        }

        pub fn store(&self) -> Arc<LockStore> {
            self.store.clone()
        }
    }

    impl LockRpc for InProcessRpc {
        async fn acquire(&self, desc: &Descriptor) -> Result<(), ClientError> {
            self.store
                .acquire(&desc.file_id, &desc.user_id)
                .map_err(|err| ClientError::Rejected {
                    message: err.to_string(),
                })
        }

        async fn release(&self, desc: &Descriptor) -> Result<(), ClientError> {
            self.store
                .release(&desc.file_id, &desc.user_id)
                .map_err(|err| ClientError::Rejected {
                    message: err.to_string(),
                })
        }

        async fn check_acquire(&self, file_id: &str) -> Result<Option<String>, ClientError> {
            Ok(self.store.lookup(file_id))
        }
    }
}
