//! Procedure call engine: per-call builder and the retry loop.
//!
//! The interceptor chain wraps the WHOLE attempt loop, so one logical call
//! passes through each interceptor exactly once however many transport
//! attempts it takes. Header providers, in contrast, re-run before every
//! attempt.

use crate::catalog::{OperationId, OperationKind};
use crate::chain;
use crate::client::headers::{self, HeaderProvider};
use crate::client::interceptor::{Interceptor, Invoker, RequestInfo};
use crate::client::RpcClient;
use crate::config::{resolve, RetryConfig, TimeoutConfig};
use crate::envelope;
use crate::error::{category, code, Error, Result};
use http::header::{HeaderMap, HeaderValue};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Map as JsonMap, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Fluent per-call configuration for one procedure invocation.
pub struct CallBuilder {
    client: RpcClient,
    rpc: String,
    op: String,
    headers: Vec<(String, String)>,
    provider: Option<HeaderProvider>,
    retry: Option<RetryConfig>,
    timeout: Option<TimeoutConfig>,
    cancel: Option<CancellationToken>,
}

impl CallBuilder {
    pub(crate) fn new(client: RpcClient, rpc: &str, op: &str) -> Self {
        Self {
            client,
            rpc: rpc.to_string(),
            op: op.to_string(),
            headers: Vec::new(),
            provider: None,
            retry: None,
            timeout: None,
            cancel: None,
        }
    }

    /// Add a static header for this call.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set a dynamic operation-level header provider.
    pub fn provider<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<Vec<(String, String)>> + Send + Sync + 'static,
    {
        self.provider = Some(Arc::new(f));
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Abort the call (including backoff sleeps) when `cancel` fires.
    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Execute and return the raw output blob.
    pub async fn execute<P: Serialize>(self, input: P) -> Result<Value> {
        let Self {
            client,
            rpc,
            op,
            headers,
            provider,
            retry,
            timeout,
            cancel,
        } = self;

        // Fail fast on unknown operations, before any network I/O.
        match client.inner.catalog.kind_of(&rpc, &op) {
            Some(OperationKind::Proc) => {}
            _ => {
                return Err(Error::new(format!("Invalid operation: {rpc}.{op}"))
                    .with_category(category::CLIENT)
                    .with_code(code::UNKNOWN_OPERATION))
            }
        }

        let (global, rpc_scope) = client.snapshot(&rpc);
        let retry = resolve(retry, rpc_scope.retry, global.retry, RetryConfig::default());
        let timeout = resolve(
            timeout,
            rpc_scope.timeout,
            global.timeout,
            TimeoutConfig::default(),
        );

        let input = encode_input(&input)?;
        let url = client.operation_url(&rpc, &op)?;

        let mut op_providers: Vec<HeaderProvider> = Vec::new();
        if !headers.is_empty() {
            op_providers.push(headers::static_provider(headers));
        }
        if let Some(p) = provider {
            op_providers.push(p);
        }

        let attempts = AttemptLoop {
            http: client.inner.http.clone(),
            url: url.clone(),
            body: serde_json::to_vec(&input)?,
            providers: Arc::new([global.providers, rpc_scope.providers, op_providers]),
            retry,
            timeout,
            cancel,
            label: format!("{rpc}.{op}"),
        };

        let invoker: Invoker = Arc::new(move |_info| {
            let attempts = attempts.clone();
            Box::pin(async move { attempts.run().await })
        });
        let mut links: Vec<Interceptor> = global.interceptors;
        links.extend(rpc_scope.interceptors);
        let chain = chain::compose(&links, invoker);

        let info = RequestInfo {
            op: OperationId::proc(&rpc, &op),
            url,
        };
        chain(info).await
    }

    /// Execute and decode the output into the expected type.
    ///
    /// This is what a generated typed wrapper does with the raw blob.
    pub async fn execute_typed<P: Serialize, O: DeserializeOwned>(self, input: P) -> Result<O> {
        let op = self.op.clone();
        let blob = self.execute(input).await?;
        envelope::decode_output(&op, blob)
    }
}

enum AttemptOutcome {
    /// Final result, success or not; no further attempts.
    Done(Result<Value>),
    /// Retryable failure.
    Retry(Error),
}

#[derive(Clone)]
struct AttemptLoop {
    http: reqwest::Client,
    url: Url,
    body: Vec<u8>,
    providers: Arc<[Vec<HeaderProvider>; 3]>,
    retry: RetryConfig,
    timeout: TimeoutConfig,
    cancel: Option<CancellationToken>,
    label: String,
}

impl AttemptLoop {
    async fn run(&self) -> Result<Value> {
        let max = self.retry.attempts();
        let mut last = Error::new("request failed").with_category(category::CONNECTION);
        for attempt in 1..=max {
            if self.is_cancelled() {
                return Err(cancelled());
            }
            match self.attempt_once().await {
                AttemptOutcome::Done(result) => return result,
                AttemptOutcome::Retry(err) => {
                    tracing::debug!(op = %self.label, attempt, error = %err, "attempt failed");
                    last = err;
                    if attempt < max {
                        let delay = self.retry.delay_for(attempt);
                        match &self.cancel {
                            Some(token) => tokio::select! {
                                _ = token.cancelled() => return Err(cancelled()),
                                _ = tokio::time::sleep(delay) => {}
                            },
                            None => tokio::time::sleep(delay).await,
                        }
                    }
                }
            }
        }
        Err(last)
    }

    async fn attempt_once(&self) -> AttemptOutcome {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            http::header::ACCEPT,
            HeaderValue::from_static("application/json"),
        );
        // global, then rpc-level, then operation-level; an error aborts with
        // no retry
        for tier in self.providers.iter() {
            if let Err(e) = headers::apply(&mut headers, tier) {
                return AttemptOutcome::Done(Err(e));
            }
        }

        let mut request = self
            .http
            .post(self.url.clone())
            .headers(headers)
            .body(self.body.clone());
        if let Some(deadline) = self.timeout.timeout {
            request = request.timeout(deadline);
        }

        let sent = match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return AttemptOutcome::Done(Err(cancelled())),
                r = request.send() => r,
            },
            None => request.send().await,
        };

        let response = match sent {
            Ok(r) => r,
            Err(e) => return AttemptOutcome::Retry(classify_transport(&e)),
        };

        let status = response.status();
        if status.is_server_error() {
            return AttemptOutcome::Retry(http_status_error(status));
        }
        if !status.is_success() {
            return AttemptOutcome::Done(Err(http_status_error(status)));
        }

        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => return AttemptOutcome::Retry(classify_transport(&e)),
        };
        match envelope::decode(&bytes) {
            Ok(env) => AttemptOutcome::Done(env.into_result()),
            Err(e) => AttemptOutcome::Done(Err(e)),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

pub(crate) fn encode_input<P: Serialize>(input: &P) -> Result<Value> {
    let value = serde_json::to_value(input).map_err(|e| {
        Error::new(format!("failed to encode input: {e}"))
            .with_category(category::CLIENT)
            .with_code(code::ENCODE_INPUT)
    })?;
    // A null input still posts an (empty) JSON object.
    Ok(if value.is_null() {
        Value::Object(JsonMap::new())
    } else {
        value
    })
}

pub(crate) fn classify_transport(e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::new("request timed out")
            .with_category(category::TIMEOUT)
            .with_code(code::REQUEST_TIMEOUT)
    } else {
        Error::new(format!("request failed: {e}"))
            .with_category(category::CONNECTION)
            .with_code(code::CONNECT_FAILED)
    }
}

pub(crate) fn http_status_error(status: http::StatusCode) -> Error {
    Error::new(format!("unexpected HTTP status {status}"))
        .with_category(category::HTTP)
        .with_code(code::BAD_STATUS)
        .with_detail("status", json!(status.as_u16()))
}

fn cancelled() -> Error {
    Error::new("call cancelled").with_category(category::CLIENT)
}
