//! Stream call engine: reconnect loop, lifecycle hooks, and the event
//! channel handed to callers.
//!
//! `execute` returns an [`RpcStream`] immediately; a background task dials
//! the server, feeds parsed envelopes into the channel, and reconnects with
//! backoff on transport interruptions. Protocol violations and non-5xx HTTP
//! failures are fatal: the error is delivered as a final envelope and the
//! channel closes. Interceptors wrap the stream SETUP only; reconnects
//! happen underneath them, while header providers re-run for every dial.

use crate::catalog::{OperationId, OperationKind};
use crate::chain;
use crate::client::call::{encode_input, http_status_error};
use crate::client::headers::{self, HeaderProvider};
use crate::client::interceptor::{Interceptor, Invoker, RequestInfo};
use crate::client::sse::SseParser;
use crate::client::RpcClient;
use crate::config::{resolve, ReconnectConfig, DEFAULT_MAX_MESSAGE_SIZE};
use crate::envelope::Envelope;
use crate::error::{category, code, Error, Result};
use futures::StreamExt;
use http::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Server-pushed event sequence for one stream call.
///
/// Yields envelopes in emit order; a final non-`ok` envelope (if any)
/// explains why the stream ended. The channel closes when the stream is
/// over -- there is no out-of-band error path.
pub struct RpcStream {
    rx: mpsc::Receiver<Envelope<Value>>,
}

impl RpcStream {
    /// Receive the next envelope; `None` once the stream is closed.
    pub async fn next(&mut self) -> Option<Envelope<Value>> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    pub fn try_next(&mut self) -> Option<Envelope<Value>> {
        self.rx.try_recv().ok()
    }
}

impl futures::Stream for RpcStream {
    type Item = Envelope<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[derive(Clone, Default)]
struct StreamHooks {
    on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
    on_reconnect: Option<Arc<dyn Fn(u32, Duration) + Send + Sync>>,
    on_disconnect: Option<Arc<dyn Fn(Option<&Error>) + Send + Sync>>,
}

/// Fluent per-call configuration for one stream invocation.
pub struct StreamBuilder {
    client: RpcClient,
    rpc: String,
    op: String,
    headers: Vec<(String, String)>,
    provider: Option<HeaderProvider>,
    reconnect: Option<ReconnectConfig>,
    max_message_size: Option<usize>,
    cancel: Option<CancellationToken>,
    hooks: StreamHooks,
}

impl StreamBuilder {
    pub(crate) fn new(client: RpcClient, rpc: &str, op: &str) -> Self {
        Self {
            client,
            rpc: rpc.to_string(),
            op: op.to_string(),
            headers: Vec::new(),
            provider: None,
            reconnect: None,
            max_message_size: None,
            cancel: None,
            hooks: StreamHooks::default(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn provider<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<Vec<(String, String)>> + Send + Sync + 'static,
    {
        self.provider = Some(Arc::new(f));
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Bound on the accumulated `data:` bytes of one event.
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = Some(bytes);
        self
    }

    /// Close the stream when `cancel` fires.
    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Called after every successful dial, initial and reconnects alike.
    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.on_connect = Some(Arc::new(f));
        self
    }

    /// Called with `(attempt, delay)` before each reconnect backoff sleep.
    pub fn on_reconnect<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, Duration) + Send + Sync + 'static,
    {
        self.hooks.on_reconnect = Some(Arc::new(f));
        self
    }

    /// Called exactly once when the stream ends, with the terminal error if
    /// there was one.
    pub fn on_disconnect<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&Error>) + Send + Sync + 'static,
    {
        self.hooks.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Start the stream. All failures, including precondition ones, arrive
    /// as envelopes on the returned stream.
    pub async fn execute<P: Serialize>(self, input: P) -> RpcStream {
        let (tx, rx) = mpsc::channel::<Envelope<Value>>(64);
        let out = RpcStream { rx };
        let Self {
            client,
            rpc,
            op,
            headers,
            provider,
            reconnect,
            max_message_size,
            cancel,
            hooks,
        } = self;

        // Fail fast before any network I/O: unknown operation, unencodable
        // input, or a degenerate base URL.
        let prepared: Result<(Value, Url)> = (|| {
            match client.inner.catalog.kind_of(&rpc, &op) {
                Some(OperationKind::Stream) => {}
                _ => {
                    return Err(Error::new(format!("Invalid operation: {rpc}.{op}"))
                        .with_category(category::CLIENT)
                        .with_code(code::UNKNOWN_OPERATION))
                }
            }
            let input = encode_input(&input)?;
            let url = client.operation_url(&rpc, &op)?;
            Ok((input, url))
        })();
        let (input, url) = match prepared {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.send(Envelope::failure(e.clone())).await;
                if let Some(f) = &hooks.on_disconnect {
                    f(Some(&e));
                }
                return out;
            }
        };

        let (global, rpc_scope) = client.snapshot(&rpc);
        let reconnect = resolve(
            reconnect,
            rpc_scope.reconnect,
            global.reconnect,
            ReconnectConfig::default(),
        );
        let max_message_size = resolve(
            max_message_size,
            rpc_scope.max_message_size,
            global.max_message_size,
            DEFAULT_MAX_MESSAGE_SIZE,
        );

        let mut op_providers: Vec<HeaderProvider> = Vec::new();
        if !headers.is_empty() {
            op_providers.push(headers::static_provider(headers));
        }
        if let Some(p) = provider {
            op_providers.push(p);
        }

        let task = StreamTask {
            http: client.inner.http.clone(),
            url: url.clone(),
            input,
            providers: Arc::new([global.providers, rpc_scope.providers, op_providers]),
            reconnect,
            max_message_size,
            cancel,
            hooks: hooks.clone(),
            tx: tx.clone(),
        };

        // Interceptors see one setup per call, not every reconnect.
        let setup: Invoker = Arc::new(move |_info| {
            let task = task.clone();
            Box::pin(async move {
                tokio::spawn(task.run());
                Ok(Value::Null)
            })
        });
        let mut links: Vec<Interceptor> = global.interceptors;
        links.extend(rpc_scope.interceptors);
        let setup_chain = chain::compose(&links, setup);

        let info = RequestInfo {
            op: OperationId::stream(&rpc, &op),
            url,
        };
        if let Err(e) = setup_chain(info).await {
            let _ = tx.send(Envelope::failure(e.clone())).await;
            if let Some(f) = &hooks.on_disconnect {
                f(Some(&e));
            }
        }
        out
    }
}

enum ReadOutcome {
    /// Server ended the stream cleanly.
    Eof,
    /// Caller cancelled or stopped listening.
    Cancelled,
    /// Protocol violation; the terminal envelope was already delivered.
    Fatal(Error),
    /// Transport interruption, eligible for reconnect.
    Interrupted(Error),
}

#[derive(Clone)]
struct StreamTask {
    http: reqwest::Client,
    url: Url,
    input: Value,
    providers: Arc<[Vec<HeaderProvider>; 3]>,
    reconnect: ReconnectConfig,
    max_message_size: usize,
    cancel: Option<CancellationToken>,
    hooks: StreamHooks,
    tx: mpsc::Sender<Envelope<Value>>,
}

impl StreamTask {
    async fn run(self) {
        let final_err = self.run_inner().await;
        if let Some(f) = &self.hooks.on_disconnect {
            f(final_err.as_ref());
        }
        // dropping self closes the event channel
    }

    async fn run_inner(&self) -> Option<Error> {
        let body = match serde_json::to_vec(&self.input) {
            Ok(b) => b,
            Err(e) => {
                let err = Error::new(format!("failed to encode input: {e}"))
                    .with_category(category::CLIENT)
                    .with_code(code::ENCODE_INPUT);
                self.deliver(&err).await;
                return Some(err);
            }
        };

        let mut failures: u32 = 0;
        loop {
            if self.is_cancelled() {
                return None;
            }

            let mut headers = HeaderMap::new();
            headers.insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            headers.insert(
                http::header::ACCEPT,
                HeaderValue::from_static("text/event-stream"),
            );
            for tier in self.providers.iter() {
                if let Err(e) = headers::apply(&mut headers, tier) {
                    self.deliver(&e).await;
                    return Some(e);
                }
            }

            let request = self
                .http
                .post(self.url.clone())
                .headers(headers)
                .body(body.clone());
            let sent = match &self.cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => return None,
                    r = request.send() => r,
                },
                None => request.send().await,
            };

            let response = match sent {
                Ok(r) => r,
                Err(e) => {
                    let err = Error::new(format!("connect failed: {e}"))
                        .with_category(category::CONNECTION)
                        .with_code(code::CONNECT_FAILED);
                    if !self.backoff(&mut failures).await {
                        self.deliver(&err).await;
                        return Some(err);
                    }
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() {
                drop(response);
                let err = http_status_error(status);
                if !self.backoff(&mut failures).await {
                    self.deliver(&err).await;
                    return Some(err);
                }
                continue;
            }
            if !status.is_success() {
                let err = http_status_error(status);
                self.deliver(&err).await;
                return Some(err);
            }

            if let Some(f) = &self.hooks.on_connect {
                f();
            }
            failures = 0;

            match self.read_events(response).await {
                ReadOutcome::Eof => return None,
                ReadOutcome::Cancelled => return None,
                ReadOutcome::Fatal(e) => return Some(e),
                ReadOutcome::Interrupted(e) => {
                    if !self.backoff(&mut failures).await {
                        self.deliver(&e).await;
                        return Some(e);
                    }
                }
            }
        }
    }

    async fn read_events(&self, response: reqwest::Response) -> ReadOutcome {
        let mut chunks = response.bytes_stream();
        let mut parser = SseParser::new(self.max_message_size);
        loop {
            let chunk = match &self.cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => return ReadOutcome::Cancelled,
                    c = chunks.next() => c,
                },
                None => chunks.next().await,
            };
            match chunk {
                None => return ReadOutcome::Eof,
                Some(Err(e)) => {
                    return ReadOutcome::Interrupted(
                        Error::new(format!("stream read failed: {e}"))
                            .with_category(category::CONNECTION),
                    )
                }
                Some(Ok(bytes)) => match parser.push(&bytes) {
                    Ok(events) => {
                        for env in events {
                            if self.tx.send(env).await.is_err() {
                                return ReadOutcome::Cancelled;
                            }
                        }
                    }
                    Err(e) => {
                        self.deliver(&e).await;
                        return ReadOutcome::Fatal(e);
                    }
                },
            }
        }
    }

    /// Count one failure; `true` when a reconnect attempt remains. Fires the
    /// `on_reconnect` hook and sleeps the backoff before returning.
    async fn backoff(&self, failures: &mut u32) -> bool {
        *failures += 1;
        if *failures >= self.reconnect.attempts() {
            return false;
        }
        let delay = self.reconnect.delay_for(*failures);
        if let Some(f) = &self.hooks.on_reconnect {
            f(*failures, delay);
        }
        tracing::debug!(attempt = *failures, ?delay, "stream reconnecting");
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            },
            None => tokio::time::sleep(delay).await,
        }
        true
    }

    async fn deliver(&self, e: &Error) {
        let _ = self.tx.send(Envelope::failure(e.clone())).await;
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}
