//! Remote Sinks
//!
//! The upload queue talks to the network only through three seams:
//!
//! - [`BundleSink`]: prepare a per-session container once, then upload
//!   bundle files into it
//! - [`RequestSink`]: fire a lightweight GET (location pings)
//! - [`Reachability`]: cheap connectivity check before a drain tick
//!
//! Production implementations live here; the fault-injecting ones used by
//! simulation live in `simulated_sink`.

use crate::recording::object_store::ObjectStore;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Boxed future returned by sink operations
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DeliveryError>> + Send + 'a>>;

/// Delivery error types. Never propagated to the recording path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The drain tick found no connectivity
    Unreachable,
    /// Bundle upload failed
    Upload(String),
    /// Lightweight request failed
    Request(String),
    /// Container creation failed
    Prepare(String),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Unreachable => write!(f, "Sink unreachable"),
            DeliveryError::Upload(msg) => write!(f, "Upload failed: {}", msg),
            DeliveryError::Request(msg) => write!(f, "Request failed: {}", msg),
            DeliveryError::Prepare(msg) => write!(f, "Container preparation failed: {}", msg),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Destination for bundle files
pub trait BundleSink: Send + Sync + 'static {
    /// Create `container` if the sink needs it. Called once per session
    /// before its first upload; must succeed when the container exists.
    fn prepare<'a>(&'a self, container: &'a str) -> SinkFuture<'a, ()>;

    /// Upload `local_path` as `<container>/<remote_name>`
    fn upload<'a>(
        &'a self,
        container: &'a str,
        remote_name: &'a str,
        local_path: &'a Path,
    ) -> SinkFuture<'a, ()>;
}

/// Destination for lightweight GET requests
pub trait RequestSink: Send + Sync + 'static {
    fn get<'a>(&'a self, url: &'a str) -> SinkFuture<'a, ()>;
}

/// Connectivity check
pub trait Reachability: Send + Sync + 'static {
    fn is_reachable(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

// ============================================================================
// ObjectStoreSink
// ============================================================================

/// Delivers bundles into an [`ObjectStore`] under `<container>/<name>`
pub struct ObjectStoreSink<S: ObjectStore> {
    store: Arc<S>,
}

impl<S: ObjectStore> ObjectStoreSink<S> {
    pub fn new(store: Arc<S>) -> Self {
        ObjectStoreSink { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: ObjectStore> BundleSink for ObjectStoreSink<S> {
    fn prepare<'a>(&'a self, _container: &'a str) -> SinkFuture<'a, ()> {
        // Object stores have no containers to create.
        Box::pin(async { Ok(()) })
    }

    fn upload<'a>(
        &'a self,
        container: &'a str,
        remote_name: &'a str,
        local_path: &'a Path,
    ) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            let data = tokio::fs::read(local_path)
                .await
                .map_err(|e| DeliveryError::Upload(format!("{}: {}", local_path.display(), e)))?;
            let key = format!("{}/{}", container, remote_name);
            self.store
                .put(&key, data)
                .await
                .map_err(|e| DeliveryError::Upload(format!("{}: {}", key, e)))
        })
    }
}

// ============================================================================
// LogRequestSink
// ============================================================================

/// Request sink that only logs; used when no HTTP sink is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRequestSink;

impl RequestSink for LogRequestSink {
    fn get<'a>(&'a self, url: &'a str) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            info!("Request (not sent): {}", url);
            Ok(())
        })
    }
}

// ============================================================================
// Reachability
// ============================================================================

/// Reachability decided by a flag, e.g. from a platform connectivity callback
#[derive(Debug)]
pub struct StaticReachability {
    reachable: AtomicBool,
}

impl StaticReachability {
    pub fn new(reachable: bool) -> Self {
        StaticReachability {
            reachable: AtomicBool::new(reachable),
        }
    }

    pub fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Relaxed);
    }
}

impl Reachability for StaticReachability {
    fn is_reachable(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let reachable = self.reachable.load(Ordering::Relaxed);
        Box::pin(async move { reachable })
    }
}

/// Reachability by opening a TCP connection to the sink host
#[derive(Debug, Clone)]
pub struct TcpReachability {
    addr: String,
    timeout: Duration,
}

impl TcpReachability {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        TcpReachability {
            addr: addr.into(),
            timeout,
        }
    }
}

impl Reachability for TcpReachability {
    fn is_reachable(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&self.addr))
                .await
            {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    debug!("Probe of {} failed: {}", self.addr, e);
                    false
                }
                Err(_) => {
                    debug!("Probe of {} timed out", self.addr);
                    false
                }
            }
        })
    }
}

// ============================================================================
// HttpSink (WebDAV style)
// ============================================================================

#[cfg(feature = "http")]
pub use http::HttpSink;

#[cfg(feature = "http")]
mod http {
    use super::{BundleSink, DeliveryError, RequestSink, SinkFuture};
    use crate::recording::config::SinkConfig;
    use reqwest::{Client, Method, RequestBuilder, StatusCode};
    use std::path::Path;
    use tracing::debug;

    /// WebDAV-style sink: `MKCOL` containers, `PUT` bundles, `GET` pings
    #[derive(Clone)]
    pub struct HttpSink {
        client: Client,
        base_url: String,
        username: Option<String>,
        password: Option<String>,
    }

    impl HttpSink {
        /// Build from config; fails when no base URL is set
        pub fn new(config: &SinkConfig) -> Result<Self, DeliveryError> {
            let base_url = config
                .base_url
                .as_deref()
                .ok_or_else(|| DeliveryError::Prepare("no sink base URL configured".to_string()))?
                .trim_end_matches('/')
                .to_string();
            let client = Client::builder()
                .timeout(config.request_timeout)
                .build()
                .map_err(|e| DeliveryError::Prepare(e.to_string()))?;
            Ok(HttpSink {
                client,
                base_url,
                username: config.username.clone(),
                password: config.password.clone(),
            })
        }

        fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
            match &self.username {
                Some(user) => builder.basic_auth(user, self.password.as_ref()),
                None => builder,
            }
        }
    }

    impl BundleSink for HttpSink {
        fn prepare<'a>(&'a self, container: &'a str) -> SinkFuture<'a, ()> {
            Box::pin(async move {
                let method = Method::from_bytes(b"MKCOL")
                    .map_err(|e| DeliveryError::Prepare(e.to_string()))?;
                let url = format!("{}/{}/", self.base_url, container);
                let response = self
                    .authorized(self.client.request(method, &url))
                    .send()
                    .await
                    .map_err(|e| DeliveryError::Prepare(e.to_string()))?;

                let status = response.status();
                // 405: the collection already exists
                if status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED {
                    debug!("Container {} ready ({})", url, status);
                    Ok(())
                } else {
                    Err(DeliveryError::Prepare(format!("{} returned {}", url, status)))
                }
            })
        }

        fn upload<'a>(
            &'a self,
            container: &'a str,
            remote_name: &'a str,
            local_path: &'a Path,
        ) -> SinkFuture<'a, ()> {
            Box::pin(async move {
                let body = tokio::fs::read(local_path).await.map_err(|e| {
                    DeliveryError::Upload(format!("{}: {}", local_path.display(), e))
                })?;
                let url = format!("{}/{}/{}", self.base_url, container, remote_name);
                let response = self
                    .authorized(self.client.put(&url))
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| DeliveryError::Upload(e.to_string()))?;

                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(DeliveryError::Upload(format!(
                        "{} returned {}",
                        url,
                        response.status()
                    )))
                }
            })
        }
    }

    impl RequestSink for HttpSink {
        fn get<'a>(&'a self, url: &'a str) -> SinkFuture<'a, ()> {
            Box::pin(async move {
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| DeliveryError::Request(e.to_string()))?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(DeliveryError::Request(format!(
                        "{} returned {}",
                        url,
                        response.status()
                    )))
                }
            })
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::object_store::InMemoryObjectStore;

    #[tokio::test]
    async fn test_object_store_sink_uploads_under_container() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("s-1.bundle");
        std::fs::write(&file, b"bundle bytes").unwrap();

        let store = Arc::new(InMemoryObjectStore::new());
        let sink = ObjectStoreSink::new(store.clone());
        sink.prepare("s").await.unwrap();
        sink.upload("s", "s-1.bundle", &file).await.unwrap();

        assert_eq!(store.get("s/s-1.bundle").await.unwrap(), b"bundle bytes");
    }

    #[tokio::test]
    async fn test_object_store_sink_missing_file() {
        let sink = ObjectStoreSink::new(Arc::new(InMemoryObjectStore::new()));
        let err = sink
            .upload("s", "x.bundle", Path::new("/nonexistent/x.bundle"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Upload(_)));
    }

    #[tokio::test]
    async fn test_static_reachability_toggles() {
        let reach = StaticReachability::new(false);
        assert!(!reach.is_reachable().await);
        reach.set(true);
        assert!(reach.is_reachable().await);
    }

    #[tokio::test]
    async fn test_tcp_probe_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let probe = TcpReachability::new(addr.to_string(), Duration::from_secs(1));
        assert!(probe.is_reachable().await);

        drop(listener);
        let closed = TcpReachability::new(addr.to_string(), Duration::from_millis(200));
        assert!(!closed.is_reachable().await);
    }
}
