//! Client call engine: builder, registries, and the per-call entry points.
//!
//! An [`RpcClient`] is cheap to clone and safe to share across tasks. It
//! holds the base URL, a pooled HTTP client, the generated operation
//! catalog, and the global/rpc-level registries for header providers,
//! interceptors and tunables. Per-call knobs live on [`CallBuilder`] /
//! [`StreamBuilder`], resolved against the registries with the usual
//! operation > rpc > global > default precedence.

use crate::catalog::OperationCatalog;
use crate::config::{ReconnectConfig, RetryConfig, TimeoutConfig};
use crate::error::{category, Error, Result};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use url::Url;

pub mod call;
pub mod headers;
pub mod interceptor;
pub(crate) mod sse;
pub mod stream;

pub use call::CallBuilder;
pub use headers::HeaderProvider;
pub use interceptor::{Interceptor, Invoker, RequestInfo};
pub use stream::{RpcStream, StreamBuilder};

/// One tier of client registrations (global or per-rpc).
#[derive(Clone, Default)]
pub(crate) struct ClientScope {
    pub providers: Vec<HeaderProvider>,
    pub interceptors: Vec<Interceptor>,
    pub retry: Option<RetryConfig>,
    pub timeout: Option<TimeoutConfig>,
    pub reconnect: Option<ReconnectConfig>,
    pub max_message_size: Option<usize>,
}

#[derive(Default)]
pub(crate) struct ClientRegistry {
    pub global: ClientScope,
    pub rpcs: HashMap<String, ClientScope>,
}

pub(crate) struct ClientInner {
    pub base: Url,
    pub http: reqwest::Client,
    pub catalog: OperationCatalog,
    pub registry: RwLock<ClientRegistry>,
}

/// The client call engine.
#[derive(Clone)]
pub struct RpcClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("base", &self.inner.base)
            .field("operations", &self.inner.catalog.len())
            .finish()
    }
}

/// Builder for [`RpcClient`].
#[derive(Clone, Debug)]
pub struct RpcClientBuilder {
    base: Url,
    catalog: OperationCatalog,
    connect_timeout: Duration,
    default_headers: HeaderMap,
    user_agent: Option<String>,
}

impl RpcClientBuilder {
    pub fn new(base: Url, catalog: OperationCatalog) -> Self {
        Self {
            base,
            catalog,
            connect_timeout: Duration::from_secs(10),
            default_headers: HeaderMap::new(),
            user_agent: None,
        }
    }

    pub fn from_str(base: &str, catalog: OperationCatalog) -> Result<Self> {
        let base = base.parse::<Url>().map_err(|e| {
            Error::new(format!("bad base URL: {e}")).with_category(category::CLIENT)
        })?;
        Ok(Self::new(base, catalog))
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn bearer_auth(mut self, token: &str) -> Self {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .unwrap_or_else(|_| HeaderValue::from_static("Bearer INVALID"));
        self.default_headers.insert(header::AUTHORIZATION, value);
        self
    }

    pub fn user_agent(mut self, ua: &str) -> Self {
        self.user_agent = Some(ua.to_owned());
        self
    }

    pub fn build(self) -> Result<RpcClient> {
        let mut headers = self.default_headers;
        let ua = self
            .user_agent
            .unwrap_or_else(crate::version::user_agent);
        headers.entry(header::USER_AGENT).or_insert(
            HeaderValue::from_str(&ua).unwrap_or_else(|_| HeaderValue::from_static("strand-rpc")),
        );

        // No client-wide timeout: per-attempt deadlines come from the retry
        // loop, and a blanket timeout would tear down long-lived streams.
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(self.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                Error::new(format!("http client build: {e}")).with_category(category::CLIENT)
            })?;

        Ok(RpcClient {
            inner: Arc::new(ClientInner {
                base: self.base,
                http,
                catalog: self.catalog,
                registry: RwLock::new(ClientRegistry::default()),
            }),
        })
    }
}

impl RpcClient {
    /// Quick constructor with defaults.
    pub fn new(base: &str, catalog: OperationCatalog) -> Result<Self> {
        RpcClientBuilder::from_str(base, catalog)?.build()
    }

    /// Create a builder for custom configuration.
    pub fn builder(base: &str, catalog: OperationCatalog) -> Result<RpcClientBuilder> {
        RpcClientBuilder::from_str(base, catalog)
    }

    pub fn catalog(&self) -> &OperationCatalog {
        &self.inner.catalog
    }

    /// Start a procedure call.
    pub fn proc(&self, rpc: &str, op: &str) -> CallBuilder {
        CallBuilder::new(self.clone(), rpc, op)
    }

    /// Start a stream call.
    pub fn stream(&self, rpc: &str, op: &str) -> StreamBuilder {
        StreamBuilder::new(self.clone(), rpc, op)
    }

    // -------------------------- provider registration -------------------------

    pub fn use_global_provider<F>(&self, f: F)
    where
        F: Fn() -> Result<Vec<(String, String)>> + Send + Sync + 'static,
    {
        self.write().global.providers.push(Arc::new(f));
    }

    pub fn use_rpc_provider<F>(&self, rpc: &str, f: F)
    where
        F: Fn() -> Result<Vec<(String, String)>> + Send + Sync + 'static,
    {
        self.write()
            .rpcs
            .entry(rpc.to_string())
            .or_default()
            .providers
            .push(Arc::new(f));
    }

    // ------------------------- interceptor registration ------------------------

    pub fn use_global_interceptor<F, Fut>(&self, f: F)
    where
        F: Fn(RequestInfo, Invoker) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let interceptor: Interceptor = Arc::new(move |info, next| Box::pin(f(info, next)));
        self.write().global.interceptors.push(interceptor);
    }

    pub fn use_rpc_interceptor<F, Fut>(&self, rpc: &str, f: F)
    where
        F: Fn(RequestInfo, Invoker) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let interceptor: Interceptor = Arc::new(move |info, next| Box::pin(f(info, next)));
        self.write()
            .rpcs
            .entry(rpc.to_string())
            .or_default()
            .interceptors
            .push(interceptor);
    }

    // ------------------------------ default tunables ---------------------------

    pub fn set_global_retry(&self, retry: RetryConfig) {
        self.write().global.retry = Some(retry);
    }

    pub fn set_rpc_retry(&self, rpc: &str, retry: RetryConfig) {
        self.write().rpcs.entry(rpc.to_string()).or_default().retry = Some(retry);
    }

    pub fn set_global_timeout(&self, timeout: TimeoutConfig) {
        self.write().global.timeout = Some(timeout);
    }

    pub fn set_rpc_timeout(&self, rpc: &str, timeout: TimeoutConfig) {
        self.write().rpcs.entry(rpc.to_string()).or_default().timeout = Some(timeout);
    }

    pub fn set_global_reconnect(&self, reconnect: ReconnectConfig) {
        self.write().global.reconnect = Some(reconnect);
    }

    pub fn set_rpc_reconnect(&self, rpc: &str, reconnect: ReconnectConfig) {
        self.write()
            .rpcs
            .entry(rpc.to_string())
            .or_default()
            .reconnect = Some(reconnect);
    }

    pub fn set_global_max_message_size(&self, bytes: usize) {
        self.write().global.max_message_size = Some(bytes);
    }

    pub fn set_rpc_max_message_size(&self, rpc: &str, bytes: usize) {
        self.write()
            .rpcs
            .entry(rpc.to_string())
            .or_default()
            .max_message_size = Some(bytes);
    }

    // --------------------------------- internals -------------------------------

    /// Snapshot the global and rpc tiers; the lock is never held across user
    /// code or I/O.
    pub(crate) fn snapshot(&self, rpc: &str) -> (ClientScope, ClientScope) {
        let reg = self.inner.registry.read().unwrap_or_else(|e| e.into_inner());
        (
            reg.global.clone(),
            reg.rpcs.get(rpc).cloned().unwrap_or_default(),
        )
    }

    /// `<base>/<rpc>/<op>`, via the catalog's path rule.
    pub(crate) fn operation_url(&self, rpc: &str, op: &str) -> Result<Url> {
        self.inner.catalog.path(&self.inner.base, rpc, op)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ClientRegistry> {
        self.inner
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }
}
