//! Reference [`ServerExchange`] adapter and serving loop over hyper 1.x.
//!
//! hyper wants the `Response` (status + headers) before the body streams,
//! while `dispatch` writes headers and body through the same push-style
//! exchange. The adapter bridges the two: headers are buffered until the
//! first write, then sent over a oneshot to the pending response, and body
//! bytes flow through an unbounded channel that backs the response body.
//! Dropping the response body (client gone) trips the request's
//! cancellation token via a drop guard.

use crate::catalog::OperationCatalog;
use crate::error::{category, Error, Result};
use crate::server::RpcServer;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::Map as JsonMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::ServerExchange;

/// Response body type produced by this adapter.
pub type RespBody = BoxBody<Bytes, Infallible>;

type ChunkResult = std::result::Result<Frame<Bytes>, Infallible>;

/// Push-style exchange over one hyper request.
pub struct HyperExchange {
    body: Option<Incoming>,
    headers: HeaderMap,
    header_tx: Option<oneshot::Sender<HeaderMap>>,
    chunk_tx: mpsc::UnboundedSender<ChunkResult>,
}

impl HyperExchange {
    /// Split an inbound request into the exchange handed to `dispatch` and
    /// the response half handed back to hyper.
    ///
    /// `cancel` is tripped when the response body is dropped, which is how a
    /// client disconnect reaches the handler and the keepalive task.
    pub fn new(body: Incoming, cancel: CancellationToken) -> (Self, PendingResponse) {
        let (header_tx, header_rx) = oneshot::channel();
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let exchange = Self {
            body: Some(body),
            headers: HeaderMap::new(),
            header_tx: Some(header_tx),
            chunk_tx,
        };
        let pending = PendingResponse {
            header_rx,
            stream: ChannelStream {
                rx: chunk_rx,
                _cancel_on_drop: cancel.drop_guard(),
            },
        };
        (exchange, pending)
    }
}

#[async_trait]
impl ServerExchange for HyperExchange {
    async fn request_body(&mut self) -> Result<Bytes> {
        let body = self
            .body
            .take()
            .ok_or_else(|| Error::new("request body already consumed"))?;
        let collected = body.collect().await.map_err(|e| {
            Error::new(format!("failed to read request body: {e}"))
                .with_category(category::CONNECTION)
        })?;
        Ok(collected.to_bytes())
    }

    fn set_header(&mut self, name: &str, value: &str) {
        if self.header_tx.is_none() {
            // headers already went out with the first write
            return;
        }
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            self.headers.insert(name, value);
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if let Some(tx) = self.header_tx.take() {
            let _ = tx.send(std::mem::take(&mut self.headers));
        }
        self.chunk_tx
            .send(Ok(Frame::data(Bytes::copy_from_slice(buf))))
            .map_err(|_| Error::new("client disconnected").with_category(category::CONNECTION))?;
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<()> {
        // Chunks are handed to hyper the moment they are sent; flushing
        // before the first write releases the response headers early, which
        // is what the stream path needs before a slow handler emits.
        if let Some(tx) = self.header_tx.take() {
            let _ = tx.send(std::mem::take(&mut self.headers));
        }
        Ok(())
    }
}

impl Drop for HyperExchange {
    fn drop(&mut self) {
        // release a response even if dispatch never wrote a byte
        if let Some(tx) = self.header_tx.take() {
            let _ = tx.send(std::mem::take(&mut self.headers));
        }
    }
}

struct ChannelStream {
    rx: mpsc::UnboundedReceiver<ChunkResult>,
    _cancel_on_drop: DropGuard,
}

impl futures::Stream for ChannelStream {
    type Item = ChunkResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Response half of a [`HyperExchange`], resolving once headers are known.
pub struct PendingResponse {
    header_rx: oneshot::Receiver<HeaderMap>,
    stream: ChannelStream,
}

impl PendingResponse {
    pub async fn into_response(self) -> Response<RespBody> {
        let headers = self.header_rx.await.unwrap_or_default();
        let mut resp = Response::new(StreamBody::new(self.stream).boxed());
        *resp.headers_mut() = headers;
        resp
    }
}

/// Serve an [`RpcServer`] over HTTP/1.1 on the given listener.
///
/// One task per connection, one task per request dispatch; request props
/// start empty. Embedders with their own HTTP stack only need to implement
/// [`ServerExchange`] and call `dispatch` themselves.
pub async fn serve(listener: TcpListener, server: Arc<RpcServer>) -> std::io::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let io = TokioIo::new(socket);
            let service = service_fn(move |req| handle_request(Arc::clone(&server), req));
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}

async fn handle_request(
    server: Arc<RpcServer>,
    req: hyper::Request<Incoming>,
) -> std::result::Result<Response<RespBody>, Infallible> {
    if req.method() != http::Method::POST {
        return Ok(plain_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
        ));
    }
    let path = req.uri().path().to_string();
    let Some((rpc, op)) = OperationCatalog::split_path(&path) else {
        return Ok(plain_response(StatusCode::NOT_FOUND, "not found"));
    };
    let (rpc, op) = (rpc.to_string(), op.to_string());

    let cancel = CancellationToken::new();
    let (exchange, pending) = HyperExchange::new(req.into_body(), cancel.clone());
    tokio::spawn(async move {
        if let Err(e) = server
            .dispatch(&rpc, &op, Box::new(exchange), JsonMap::new(), cancel)
            .await
        {
            tracing::debug!(error = %e, "dispatch aborted");
        }
    });
    Ok(pending.into_response().await)
}

fn plain_response(status: StatusCode, text: &'static str) -> Response<RespBody> {
    let mut resp = Response::new(Full::new(Bytes::from_static(text.as_bytes())).boxed());
    *resp.status_mut() = status;
    resp
}
