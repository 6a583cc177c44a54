//! Middleware signatures and the typed <-> erased bridge.
//!
//! The registries hold uniform, type-erased chain links; user code written
//! against a concrete operation works with [`TypedContext`] instead. The
//! bridge between the two worlds:
//!
//! 1. downcasts the erased input to the operation's typed input once per
//!    request, when the typed chain is entered,
//! 2. upcasts the typed result back to a JSON value for the generic links
//!    above it,
//! 3. copies the typed context's `props` and `input` back into the erased
//!    context on every call to the typed `next`, so generic middleware
//!    registered at rpc or global scope sees typed-land mutations.

use crate::chain::{Link, Tail};
use crate::context::{CallContext, TypedContext};
use crate::error::{Error, Result};
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;

/// Shared handle to the per-request context.
pub type Ctx = Arc<CallContext>;

/// Outcome of one chain step: the (erased) handler output or an error.
pub type MwResult = Result<Value>;

/// Continuation to the rest of an erased chain.
pub type Next = Tail<Ctx, MwResult>;

/// Generic middleware, registered at global or rpc scope.
pub type Middleware = Link<Ctx, MwResult>;

/// Continuation to the rest of a typed chain.
pub type TypedNext<I> = Tail<TypedContext<I>, MwResult>;

/// Typed operation middleware.
pub type TypedMiddleware<I> = Link<TypedContext<I>, MwResult>;

/// Typed emit function handed to stream handlers.
pub type TypedEmit<O> = Tail<O, Result<()>>;

/// Typed emit middleware, wrapping every emitted event.
pub type TypedEmitMiddleware<O> = Link<O, Result<()>>;

/// Erased emit writing one success envelope to the wire.
pub(crate) type RawEmit = Tail<Value, Result<()>>;

/// Maps the chain's final error once, before it is written to the client.
pub type ErrorHandler = Arc<dyn Fn(Error) -> Error + Send + Sync>;

/// Default error handler: pass the error through untouched.
pub(crate) fn passthrough_error_handler() -> ErrorHandler {
    Arc::new(|e| e)
}

/// Type-erased typed link, stored uniformly in the per-operation registry.
pub(crate) type AnyLink = Arc<dyn Any + Send + Sync>;

/// Enter the typed world: the one downcast per request.
pub(crate) fn typed_entry<I>(ctx: &Ctx) -> Result<TypedContext<I>>
where
    I: Any + Clone + Send,
{
    let input = ctx.typed_input::<I>().ok_or_else(|| {
        Error::new(format!(
            "internal: typed input missing or mismatched for {}",
            ctx.op()
        ))
    })?;
    Ok(TypedContext {
        op: ctx.op().clone(),
        cancel: ctx.cancel_token().clone(),
        props: ctx.props(),
        input,
    })
}

/// Recover the typed middleware list from its erased storage.
pub(crate) fn downcast_links<I: 'static>(links: &[AnyLink], op: &str) -> Result<Vec<TypedMiddleware<I>>> {
    links
        .iter()
        .map(|l| {
            l.downcast_ref::<TypedMiddleware<I>>().cloned().ok_or_else(|| {
                Error::new(format!("internal: operation middleware type mismatch for {op}"))
            })
        })
        .collect()
}

/// Recover the typed emit middleware list from its erased storage.
pub(crate) fn downcast_emit_links<O: 'static>(
    links: &[AnyLink],
    op: &str,
) -> Result<Vec<TypedEmitMiddleware<O>>> {
    links
        .iter()
        .map(|l| {
            l.downcast_ref::<TypedEmitMiddleware<O>>().cloned().ok_or_else(|| {
                Error::new(format!("internal: emit middleware type mismatch for {op}"))
            })
        })
        .collect()
}

/// Compose the typed chain so that every typed `next` first writes the typed
/// context's `props` and `input` back into the erased context.
pub(crate) fn compose_typed<I>(
    erased: Ctx,
    links: &[TypedMiddleware<I>],
    terminal: TypedNext<I>,
) -> TypedNext<I>
where
    I: Any + Clone + Send + 'static,
{
    let mut tail = terminal;
    for link in links.iter().rev() {
        let link = Arc::clone(link);
        let inner = write_back_on_call(erased.clone(), tail);
        tail = Arc::new(move |tc| link(tc, Arc::clone(&inner)));
    }
    tail
}

fn write_back_on_call<I>(erased: Ctx, inner: TypedNext<I>) -> TypedNext<I>
where
    I: Any + Clone + Send + 'static,
{
    Arc::new(move |tc: TypedContext<I>| {
        erased.set_props(tc.props.clone());
        erased.set_typed_input(tc.input.clone());
        inner(tc)
    })
}

/// Erased wrapper around a registration-time typed middleware.
pub(crate) fn erase_typed_middleware<I>(mw: TypedMiddleware<I>) -> AnyLink
where
    I: 'static,
{
    Arc::new(mw)
}

/// Erased wrapper around a registration-time typed emit middleware.
pub(crate) fn erase_emit_middleware<O>(mw: TypedEmitMiddleware<O>) -> AnyLink
where
    O: 'static,
{
    Arc::new(mw)
}

/// Re-export of the shared composer for erased chains.
pub(crate) use crate::chain::compose;
