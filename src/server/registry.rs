//! Internal registration maps behind the server's reader-writer lock.
//!
//! Built once during server construction, mutated only through the
//! registration APIs, snapshotted (never held) during dispatch.

use crate::config::StreamTuning;
use crate::error::Result;
use crate::server::middleware::{AnyLink, Ctx, ErrorHandler, Middleware, MwResult, RawEmit};
use futures::future::BoxFuture;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) type OpKey = (String, String);

/// Erased deserializer: parse + validate + transform, supplied per operation
/// by generated code together with the handler.
pub(crate) type ErasedDeserializer =
    Arc<dyn Fn(Value) -> Result<Box<dyn Any + Send>> + Send + Sync>;

/// Erased procedure invocation: enters the typed chain for one request.
pub(crate) type ProcInvoke =
    Arc<dyn Fn(Ctx, Vec<AnyLink>) -> BoxFuture<'static, MwResult> + Send + Sync>;

/// Erased stream invocation: typed chain plus the emit pipeline.
pub(crate) type StreamInvoke = Arc<
    dyn Fn(Ctx, Vec<AnyLink>, Vec<AnyLink>, RawEmit) -> BoxFuture<'static, MwResult> + Send + Sync,
>;

pub(crate) enum OpInvoke {
    Proc(ProcInvoke),
    Stream(StreamInvoke),
}

/// Handler + deserializer pair registered for one operation.
pub(crate) struct OpHandler {
    pub deserialize: ErasedDeserializer,
    pub invoke: OpInvoke,
}

/// Per-operation registrations that may exist before the handler does.
#[derive(Default)]
pub(crate) struct OpScope {
    pub middlewares: Vec<AnyLink>,
    pub emit_middlewares: Vec<AnyLink>,
    pub tuning: Option<StreamTuning>,
    pub error_handler: Option<ErrorHandler>,
}

/// Per-rpc registrations.
#[derive(Default)]
pub(crate) struct RpcScope {
    pub middlewares: Vec<Middleware>,
    pub tuning: Option<StreamTuning>,
    pub error_handler: Option<ErrorHandler>,
}

/// Everything the server knows, keyed by operation, rpc, or nothing.
#[derive(Default)]
pub(crate) struct ServerRegistry {
    pub handlers: HashMap<OpKey, OpHandler>,
    pub ops: HashMap<OpKey, OpScope>,
    pub rpcs: HashMap<String, RpcScope>,
    pub global_middlewares: Vec<Middleware>,
    pub global_tuning: Option<StreamTuning>,
    pub global_error_handler: Option<ErrorHandler>,
}

impl ServerRegistry {
    pub fn op_scope(&mut self, rpc: &str, op: &str) -> &mut OpScope {
        self.ops
            .entry((rpc.to_string(), op.to_string()))
            .or_default()
    }

    pub fn rpc_scope(&mut self, rpc: &str) -> &mut RpcScope {
        self.rpcs.entry(rpc.to_string()).or_default()
    }
}
