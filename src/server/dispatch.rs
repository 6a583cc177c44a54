//! Per-request dispatch: decode, route, compose, run, respond.

use crate::catalog::{OperationId, OperationKind};
use crate::config::{resolve, StreamTuning};
use crate::context::CallContext;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::server::middleware::{self, AnyLink, Ctx, ErrorHandler, Middleware, Next, RawEmit};
use crate::server::registry::{ErasedDeserializer, OpInvoke, ProcInvoke, StreamInvoke};
use crate::server::{sse, RpcServer};
use crate::transport::ServerExchange;
use serde_json::{Map as JsonMap, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct ProcSnapshot {
    deserialize: ErasedDeserializer,
    invoke: ProcInvoke,
    op_links: Vec<AnyLink>,
    rpc_links: Vec<Middleware>,
    global_links: Vec<Middleware>,
    on_error: ErrorHandler,
}

struct StreamSnapshot {
    deserialize: ErasedDeserializer,
    invoke: StreamInvoke,
    op_links: Vec<AnyLink>,
    emit_links: Vec<AnyLink>,
    rpc_links: Vec<Middleware>,
    global_links: Vec<Middleware>,
    on_error: ErrorHandler,
    tuning: StreamTuning,
}

impl RpcServer {
    /// Dispatch one inbound request through the engine.
    ///
    /// Every outcome, including unknown operations and malformed bodies, is
    /// conveyed in the envelope with HTTP 200 semantics; transport status is
    /// reserved for transport-layer signalling. The returned error reports
    /// adapter I/O failures only.
    pub async fn dispatch(
        &self,
        rpc: &str,
        op: &str,
        mut exchange: Box<dyn ServerExchange>,
        props: JsonMap<String, Value>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let body = match exchange.request_body().await {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(error = %e, "request body unavailable");
                let env = Envelope::failure(Error::new("Invalid request body"));
                return respond(exchange.as_mut(), &env).await;
            }
        };
        let raw: Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(_) => {
                let env = Envelope::failure(Error::new("Invalid request body"));
                return respond(exchange.as_mut(), &env).await;
            }
        };

        let Some(kind) = self.catalog().kind_of(rpc, op) else {
            let env = Envelope::failure(Error::new(format!("Invalid operation: {rpc}.{op}")));
            return respond(exchange.as_mut(), &env).await;
        };
        tracing::debug!(%rpc, %op, ?kind, "dispatching");

        let id = match kind {
            OperationKind::Proc => OperationId::proc(rpc, op),
            OperationKind::Stream => OperationId::stream(rpc, op),
        };
        let ctx: Ctx = Arc::new(CallContext::new(id, props, raw.clone(), cancel));

        match kind {
            OperationKind::Proc => self.dispatch_proc(rpc, op, exchange, ctx, raw).await,
            OperationKind::Stream => self.dispatch_stream(rpc, op, exchange, ctx, raw).await,
        }
    }

    async fn dispatch_proc(
        &self,
        rpc: &str,
        op: &str,
        mut exchange: Box<dyn ServerExchange>,
        ctx: Ctx,
        raw: Value,
    ) -> Result<()> {
        let snap = match self.snapshot_proc(rpc, op) {
            Ok(s) => s,
            Err(e) => return respond(exchange.as_mut(), &Envelope::failure(e)).await,
        };

        // Parse, validate required fields, transform. Failure skips the
        // handler entirely and goes straight back to the client.
        let typed = match (snap.deserialize)(raw) {
            Ok(t) => t,
            Err(e) => return respond(exchange.as_mut(), &Envelope::failure(e)).await,
        };
        ctx.set_input_box(typed);

        let invoke = snap.invoke.clone();
        let op_links = snap.op_links.clone();
        let terminal: Next = Arc::new(move |c: Ctx| invoke(c, op_links.clone()));
        let chain = middleware::compose(&snap.rpc_links, terminal);
        let chain = middleware::compose(&snap.global_links, chain);

        let env = match chain(ctx).await {
            Ok(output) => Envelope::success(output),
            Err(e) => Envelope::failure((snap.on_error)(e)),
        };
        respond(exchange.as_mut(), &env).await
    }

    async fn dispatch_stream(
        &self,
        rpc: &str,
        op: &str,
        mut exchange: Box<dyn ServerExchange>,
        ctx: Ctx,
        raw: Value,
    ) -> Result<()> {
        exchange.set_header("Content-Type", "text/event-stream");
        exchange.set_header("Cache-Control", "no-cache");
        exchange.set_header("Connection", "keep-alive");
        // Release headers before a slow handler produces its first event.
        exchange.flush().await?;

        let writer: sse::SharedWriter = Arc::new(Mutex::new(exchange));

        let snap = match self.snapshot_stream(rpc, op) {
            Ok(s) => s,
            Err(e) => return sse::write_event(&writer, &Envelope::failure(e)).await,
        };
        let typed = match (snap.deserialize)(raw) {
            Ok(t) => t,
            Err(e) => return sse::write_event(&writer, &Envelope::failure(e)).await,
        };
        ctx.set_input_box(typed);

        let raw_emit: RawEmit = {
            let writer = writer.clone();
            Arc::new(move |output: Value| {
                let writer = writer.clone();
                Box::pin(async move { sse::write_event(&writer, &Envelope::success(output)).await })
            })
        };

        let ka_cancel = ctx.cancel_token().child_token();
        let keepalive = tokio::spawn(sse::keepalive(
            writer.clone(),
            snap.tuning.ping_interval,
            ka_cancel.clone(),
        ));

        let invoke = snap.invoke.clone();
        let op_links = snap.op_links.clone();
        let emit_links = snap.emit_links.clone();
        let terminal: Next = Arc::new(move |c: Ctx| {
            invoke(c, op_links.clone(), emit_links.clone(), raw_emit.clone())
        });
        let chain = middleware::compose(&snap.rpc_links, terminal);
        let chain = middleware::compose(&snap.global_links, chain);

        let result = chain(ctx).await;

        ka_cancel.cancel();
        let _ = keepalive.await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => sse::write_event(&writer, &Envelope::failure((snap.on_error)(e))).await,
        }
    }

    fn snapshot_proc(&self, rpc: &str, op: &str) -> Result<ProcSnapshot> {
        let reg = self.read();
        let key = (rpc.to_string(), op.to_string());
        let handler = reg
            .handlers
            .get(&key)
            .ok_or_else(|| Error::new(format!("no handler registered for {rpc}.{op}")))?;
        let invoke = match &handler.invoke {
            OpInvoke::Proc(i) => i.clone(),
            OpInvoke::Stream(_) => {
                return Err(Error::new(format!("{rpc}.{op} is registered as a stream")))
            }
        };
        let op_scope = reg.ops.get(&key);
        let rpc_scope = reg.rpcs.get(rpc);
        Ok(ProcSnapshot {
            deserialize: handler.deserialize.clone(),
            invoke,
            op_links: op_scope.map(|s| s.middlewares.clone()).unwrap_or_default(),
            rpc_links: rpc_scope.map(|s| s.middlewares.clone()).unwrap_or_default(),
            global_links: reg.global_middlewares.clone(),
            on_error: resolve(
                op_scope.and_then(|s| s.error_handler.clone()),
                rpc_scope.and_then(|s| s.error_handler.clone()),
                reg.global_error_handler.clone(),
                middleware::passthrough_error_handler(),
            ),
        })
    }

    fn snapshot_stream(&self, rpc: &str, op: &str) -> Result<StreamSnapshot> {
        let reg = self.read();
        let key = (rpc.to_string(), op.to_string());
        let handler = reg
            .handlers
            .get(&key)
            .ok_or_else(|| Error::new(format!("no handler registered for {rpc}.{op}")))?;
        let invoke = match &handler.invoke {
            OpInvoke::Stream(i) => i.clone(),
            OpInvoke::Proc(_) => {
                return Err(Error::new(format!("{rpc}.{op} is registered as a procedure")))
            }
        };
        let op_scope = reg.ops.get(&key);
        let rpc_scope = reg.rpcs.get(rpc);
        Ok(StreamSnapshot {
            deserialize: handler.deserialize.clone(),
            invoke,
            op_links: op_scope.map(|s| s.middlewares.clone()).unwrap_or_default(),
            emit_links: op_scope
                .map(|s| s.emit_middlewares.clone())
                .unwrap_or_default(),
            rpc_links: rpc_scope.map(|s| s.middlewares.clone()).unwrap_or_default(),
            global_links: reg.global_middlewares.clone(),
            on_error: resolve(
                op_scope.and_then(|s| s.error_handler.clone()),
                rpc_scope.and_then(|s| s.error_handler.clone()),
                reg.global_error_handler.clone(),
                middleware::passthrough_error_handler(),
            ),
            tuning: resolve(
                op_scope.and_then(|s| s.tuning),
                rpc_scope.and_then(|s| s.tuning),
                reg.global_tuning,
                StreamTuning::default(),
            ),
        })
    }
}

async fn respond(exchange: &mut dyn ServerExchange, env: &Envelope<Value>) -> Result<()> {
    exchange.set_header("Content-Type", "application/json");
    let body = serde_json::to_vec(env)?;
    exchange.write(&body).await?;
    exchange.flush().await
}
