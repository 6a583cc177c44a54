//! Client-side interceptor chain.
//!
//! Interceptors wrap the invoker and may short-circuit, observe, or
//! transform its outcome. They are folded with the shared reverse-fold
//! composer, so the first registered interceptor runs outermost. For
//! procedures the invoker runs the whole attempt loop; for streams it runs
//! the stream setup only, never the individual reconnects.

use crate::catalog::OperationId;
use crate::chain::{Link, Tail};
use crate::error::Result;
use serde_json::Value;
use url::Url;

/// What an interceptor sees about the call being made.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub op: OperationId,
    pub url: Url,
}

/// Continuation to the transport invocation.
///
/// Resolves to the raw output blob for procedures and to `Null` for stream
/// setup (stream events travel on the event channel, not through here).
pub type Invoker = Tail<RequestInfo, Result<Value>>;

/// A callable wrapping the [`Invoker`].
pub type Interceptor = Link<RequestInfo, Result<Value>>;
