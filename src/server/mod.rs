//! Server request engine: registration surface and per-request dispatch.
//!
//! An [`RpcServer`] owns the operation catalog plus three tiers of
//! registries (operation, rpc, global) behind one reader-writer lock.
//! Registration is append-only for middleware and one-shot for handlers;
//! dispatch snapshots what it needs under the read lock and releases it
//! before any user code runs, so registering during serving is safe but not
//! visible to in-flight requests.
//!
//! The actual HTTP plumbing lives behind the [`crate::transport`] adapter;
//! `dispatch` only ever talks to that trait.

use crate::catalog::{OperationCatalog, OperationId};
use crate::config::StreamTuning;
use crate::context::TypedContext;
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod middleware;
pub(crate) mod registry;
mod dispatch;
mod sse;

pub use middleware::{
    Ctx, ErrorHandler, Middleware, MwResult, Next, TypedEmit, TypedEmitMiddleware,
    TypedMiddleware, TypedNext,
};

use middleware::RawEmit;
use registry::{ErasedDeserializer, OpHandler, OpInvoke, ProcInvoke, ServerRegistry, StreamInvoke};

/// The server request engine.
pub struct RpcServer {
    catalog: OperationCatalog,
    registry: RwLock<ServerRegistry>,
}

impl RpcServer {
    /// Build a server over the generated operation catalog.
    pub fn new(catalog: OperationCatalog) -> Self {
        Self {
            catalog,
            registry: RwLock::new(ServerRegistry::default()),
        }
    }

    pub fn catalog(&self) -> &OperationCatalog {
        &self.catalog
    }

    // ------------------------- handler registration ---------------------------

    /// Register the handler + deserializer pair for a procedure.
    ///
    /// The deserializer parses the raw JSON input, validates required fields
    /// and transforms to the typed input; generated code supplies it next to
    /// the handler. Registering the same operation twice is a programmer
    /// error and fails loudly.
    pub fn register_proc<I, O, D, H, Fut>(
        &self,
        rpc: &str,
        op: &str,
        deserialize: D,
        handler: H,
    ) -> Result<()>
    where
        I: Any + Clone + Send + 'static,
        O: Serialize + Send + 'static,
        D: Fn(Value) -> Result<I> + Send + Sync + 'static,
        H: Fn(TypedContext<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let id = OperationId::proc(rpc, op);
        self.check_catalog(&id)?;

        let handler: Arc<
            dyn Fn(TypedContext<I>) -> BoxFuture<'static, Result<O>> + Send + Sync,
        > = Arc::new(move |tc| Box::pin(handler(tc)));

        let label = id.to_string();
        let invoke: ProcInvoke = Arc::new(move |ctx: Ctx, op_links| {
            let handler = handler.clone();
            let label = label.clone();
            Box::pin(async move {
                let links = middleware::downcast_links::<I>(&op_links, &label)?;
                let terminal: TypedNext<I> = {
                    let handler = handler.clone();
                    Arc::new(move |tc| {
                        let handler = handler.clone();
                        Box::pin(async move {
                            let out = handler(tc).await?;
                            serde_json::to_value(out).map_err(|e| {
                                Error::new(format!("failed to encode output: {e}"))
                            })
                        })
                    })
                };
                let chain = middleware::compose_typed(ctx.clone(), &links, terminal);
                let tc = middleware::typed_entry::<I>(&ctx)?;
                chain(tc).await
            })
        });

        let deserialize: ErasedDeserializer =
            Arc::new(move |raw| deserialize(raw).map(|i| Box::new(i) as Box<dyn Any + Send>));

        self.insert_handler(
            id,
            OpHandler {
                deserialize,
                invoke: OpInvoke::Proc(invoke),
            },
        )
    }

    /// Register the handler + deserializer pair for a stream.
    ///
    /// The handler receives the composed emit chain and pushes events until
    /// it returns; returning `Err` ends the stream with a framed error
    /// envelope.
    pub fn register_stream<I, O, D, H, Fut>(
        &self,
        rpc: &str,
        op: &str,
        deserialize: D,
        handler: H,
    ) -> Result<()>
    where
        I: Any + Clone + Send + 'static,
        O: Serialize + Send + 'static,
        D: Fn(Value) -> Result<I> + Send + Sync + 'static,
        H: Fn(TypedContext<I>, TypedEmit<O>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = OperationId::stream(rpc, op);
        self.check_catalog(&id)?;

        let handler: Arc<
            dyn Fn(TypedContext<I>, TypedEmit<O>) -> BoxFuture<'static, Result<()>> + Send + Sync,
        > = Arc::new(move |tc, emit| Box::pin(handler(tc, emit)));

        let label = id.to_string();
        let invoke: StreamInvoke = Arc::new(move |ctx, op_links, emit_links, raw_emit: RawEmit| {
            let handler = handler.clone();
            let label = label.clone();
            Box::pin(async move {
                let links = middleware::downcast_links::<I>(&op_links, &label)?;
                let emits = middleware::downcast_emit_links::<O>(&emit_links, &label)?;

                let base_emit: TypedEmit<O> = {
                    let raw_emit = raw_emit.clone();
                    Arc::new(move |out: O| {
                        let raw_emit = raw_emit.clone();
                        Box::pin(async move {
                            let value = serde_json::to_value(out).map_err(|e| {
                                Error::new(format!("failed to encode event: {e}"))
                            })?;
                            raw_emit(value).await
                        })
                    })
                };
                let emit = crate::chain::compose(&emits, base_emit);

                let terminal: TypedNext<I> = {
                    let handler = handler.clone();
                    Arc::new(move |tc| {
                        let handler = handler.clone();
                        let emit = emit.clone();
                        Box::pin(async move { handler(tc, emit).await.map(|_| Value::Null) })
                    })
                };
                let chain = middleware::compose_typed(ctx.clone(), &links, terminal);
                let tc = middleware::typed_entry::<I>(&ctx)?;
                chain(tc).await
            })
        });

        let deserialize: ErasedDeserializer =
            Arc::new(move |raw| deserialize(raw).map(|i| Box::new(i) as Box<dyn Any + Send>));

        self.insert_handler(
            id,
            OpHandler {
                deserialize,
                invoke: OpInvoke::Stream(invoke),
            },
        )
    }

    // ------------------------ middleware registration -------------------------

    /// Append a generic middleware that runs for every operation.
    pub fn use_global<F, Fut>(&self, f: F)
    where
        F: Fn(Ctx, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MwResult> + Send + 'static,
    {
        let mw: Middleware = Arc::new(move |ctx, next| Box::pin(f(ctx, next)));
        self.write().global_middlewares.push(mw);
    }

    /// Append a generic middleware scoped to one rpc service.
    pub fn use_rpc<F, Fut>(&self, rpc: &str, f: F)
    where
        F: Fn(Ctx, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MwResult> + Send + 'static,
    {
        let mw: Middleware = Arc::new(move |ctx, next| Box::pin(f(ctx, next)));
        self.write().rpc_scope(rpc).middlewares.push(mw);
    }

    /// Append a typed middleware scoped to one operation.
    ///
    /// `I` must match the operation's input type; a mismatch is reported as
    /// an internal error at dispatch time.
    pub fn use_operation<I, F, Fut>(&self, rpc: &str, op: &str, f: F)
    where
        I: Any + Clone + Send + 'static,
        F: Fn(TypedContext<I>, TypedNext<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MwResult> + Send + 'static,
    {
        let mw: TypedMiddleware<I> = Arc::new(move |tc, next| Box::pin(f(tc, next)));
        self.write()
            .op_scope(rpc, op)
            .middlewares
            .push(middleware::erase_typed_middleware(mw));
    }

    /// Append an emit middleware wrapping every event of one stream.
    pub fn use_emit<O, F, Fut>(&self, rpc: &str, op: &str, f: F)
    where
        O: Send + 'static,
        F: Fn(O, TypedEmit<O>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mw: TypedEmitMiddleware<O> = Arc::new(move |out, next| Box::pin(f(out, next)));
        self.write()
            .op_scope(rpc, op)
            .emit_middlewares
            .push(middleware::erase_emit_middleware(mw));
    }

    // ----------------------- tuning and error handlers ------------------------

    pub fn set_global_stream_tuning(&self, tuning: StreamTuning) {
        self.write().global_tuning = Some(tuning);
    }

    pub fn set_rpc_stream_tuning(&self, rpc: &str, tuning: StreamTuning) {
        self.write().rpc_scope(rpc).tuning = Some(tuning);
    }

    pub fn set_operation_stream_tuning(&self, rpc: &str, op: &str, tuning: StreamTuning) {
        self.write().op_scope(rpc, op).tuning = Some(tuning);
    }

    pub fn set_global_error_handler<F>(&self, f: F)
    where
        F: Fn(Error) -> Error + Send + Sync + 'static,
    {
        self.write().global_error_handler = Some(Arc::new(f));
    }

    pub fn set_rpc_error_handler<F>(&self, rpc: &str, f: F)
    where
        F: Fn(Error) -> Error + Send + Sync + 'static,
    {
        self.write().rpc_scope(rpc).error_handler = Some(Arc::new(f));
    }

    pub fn set_operation_error_handler<F>(&self, rpc: &str, op: &str, f: F)
    where
        F: Fn(Error) -> Error + Send + Sync + 'static,
    {
        self.write().op_scope(rpc, op).error_handler = Some(Arc::new(f));
    }

    // ------------------------------- internals --------------------------------

    fn check_catalog(&self, id: &OperationId) -> Result<()> {
        match self.catalog.kind_of(&id.rpc, &id.name) {
            Some(kind) if kind == id.kind => Ok(()),
            Some(_) => Err(Error::new(format!("operation kind mismatch for {id}"))),
            None => Err(Error::new(format!("Invalid operation: {id}"))),
        }
    }

    fn insert_handler(&self, id: OperationId, handler: OpHandler) -> Result<()> {
        let key = (id.rpc.clone(), id.name.clone());
        let mut reg = self.write();
        if reg.handlers.contains_key(&key) {
            return Err(Error::new(format!("handler already registered for {id}")));
        }
        reg.handlers.insert(key, handler);
        Ok(())
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, ServerRegistry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ServerRegistry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("operations", &self.catalog.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::OperationId;
    use serde_json::json;

    fn server() -> RpcServer {
        RpcServer::new(OperationCatalog::new([OperationId::proc("Echo", "Say")]))
    }

    fn say_deserializer(raw: Value) -> Result<String> {
        raw.get("text")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| Error::missing_required_field("field text is required"))
    }

    #[test]
    fn duplicate_handler_registration_fails_loudly() {
        let s = server();
        s.register_proc("Echo", "Say", say_deserializer, |tc: TypedContext<String>| async move {
            Ok(json!({ "text": tc.input }))
        })
        .unwrap();

        let err = s
            .register_proc("Echo", "Say", say_deserializer, |tc: TypedContext<String>| async move {
                Ok(json!({ "text": tc.input }))
            })
            .unwrap_err();
        assert!(err.message.contains("already registered"));
    }

    #[test]
    fn unknown_operation_registration_fails() {
        let s = server();
        let err = s
            .register_proc("Nope", "Say", say_deserializer, |tc: TypedContext<String>| async move {
                Ok(json!({ "text": tc.input }))
            })
            .unwrap_err();
        assert!(err.message.contains("Invalid operation"));
    }

    #[test]
    fn kind_mismatch_registration_fails() {
        let s = RpcServer::new(OperationCatalog::new([OperationId::stream("Ticker", "Ticks")]));
        let err = s
            .register_proc("Ticker", "Ticks", say_deserializer, |tc: TypedContext<String>| async move {
                Ok(json!({ "text": tc.input }))
            })
            .unwrap_err();
        assert!(err.message.contains("kind mismatch"));
    }
}
