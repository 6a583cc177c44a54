//! The server's only coupling to an HTTP stack.
//!
//! `dispatch` talks to one request through [`ServerExchange`]: read the
//! body, set response headers, write and flush bytes. Anything that can
//! implement those four operations can host the engine; the reference
//! implementation over hyper 1.x lives in [`hyper`].

use crate::error::Result;
use bytes::Bytes;

pub mod hyper;

/// One in-flight HTTP exchange, as seen by the server engine.
///
/// Implementations must tolerate `set_header` calls being ignored after the
/// first `write`, and should make `flush` push buffered bytes to the client
/// (a no-op is allowed when delivery is already immediate).
#[async_trait::async_trait]
pub trait ServerExchange: Send {
    /// Read the complete request body.
    async fn request_body(&mut self) -> Result<Bytes>;

    /// Set a response header. Only effective before the first write.
    fn set_header(&mut self, name: &str, value: &str);

    /// Write response bytes, returning how many were accepted.
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Force delivery of buffered bytes to the client.
    async fn flush(&mut self) -> Result<()>;
}
