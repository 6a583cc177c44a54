//! Per-request handler context.
//!
//! One [`CallContext`] is created per inbound request and shared by
//! reference (an `Arc`) through the whole middleware chain, so a mutation
//! made by one link is visible to every link after it. The mutable parts
//! (`props` and `input`) sit behind a mutex with short, await-free critical
//! sections.
//!
//! `input` starts as the raw JSON value read from the request body and is
//! replaced with the operation's typed value once the deserializer has run.
//! Generic middleware sees the typed value through the [`std::any::Any`]
//! erasure; typed middleware gets a concrete [`TypedContext`] view built by
//! the bridge in `server::middleware`.

use crate::catalog::OperationId;
use serde_json::{Map as JsonMap, Value};
use std::any::Any;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

enum InputSlot {
    /// Raw JSON from the request body, before the deserializer ran.
    Raw(Value),
    /// The operation's typed input.
    Typed(Box<dyn Any + Send>),
}

struct CtxState {
    props: JsonMap<String, Value>,
    input: InputSlot,
}

/// Mutable per-request state threaded through middleware chains.
pub struct CallContext {
    op: OperationId,
    cancel: CancellationToken,
    state: Mutex<CtxState>,
}

impl CallContext {
    pub fn new(
        op: OperationId,
        props: JsonMap<String, Value>,
        raw_input: Value,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            op,
            cancel,
            state: Mutex::new(CtxState {
                props,
                input: InputSlot::Raw(raw_input),
            }),
        }
    }

    /// Identity of the operation being dispatched.
    pub fn op(&self) -> &OperationId {
        &self.op
    }

    /// Token cancelled when the caller disconnects or the request is aborted.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Snapshot of the props map.
    pub fn props(&self) -> JsonMap<String, Value> {
        self.lock().props.clone()
    }

    /// Replace the whole props map.
    pub fn set_props(&self, props: JsonMap<String, Value>) {
        self.lock().props = props;
    }

    /// One prop by key.
    pub fn prop(&self, key: &str) -> Option<Value> {
        self.lock().props.get(key).cloned()
    }

    /// Insert or replace one prop.
    pub fn set_prop(&self, key: impl Into<String>, value: Value) {
        self.lock().props.insert(key.into(), value);
    }

    /// The raw JSON input, if the deserializer has not replaced it yet.
    pub fn raw_input(&self) -> Option<Value> {
        match &self.lock().input {
            InputSlot::Raw(v) => Some(v.clone()),
            InputSlot::Typed(_) => None,
        }
    }

    /// The typed input, if it has been set and `T` matches.
    pub fn typed_input<T: Any + Clone>(&self) -> Option<T> {
        match &self.lock().input {
            InputSlot::Typed(b) => b.downcast_ref::<T>().cloned(),
            InputSlot::Raw(_) => None,
        }
    }

    /// Store the operation's typed input, replacing whatever was there.
    pub fn set_typed_input<T: Any + Send>(&self, input: T) {
        self.lock().input = InputSlot::Typed(Box::new(input));
    }

    /// Store an already-boxed typed input (the deserializer's output).
    pub(crate) fn set_input_box(&self, input: Box<dyn Any + Send>) {
        self.lock().input = InputSlot::Typed(input);
    }

    /// Replace the input with a raw JSON value.
    pub fn set_raw_input(&self, input: Value) {
        self.lock().input = InputSlot::Raw(input);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CtxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("op", &self.op)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Concrete view of a [`CallContext`] for typed middleware and handlers.
///
/// The bridge copies `props` and `input` back into the erased context on
/// every call to the typed `next`, so generic middleware outside the typed
/// chain observes the mutations.
#[derive(Debug, Clone)]
pub struct TypedContext<I> {
    pub op: OperationId,
    pub cancel: CancellationToken,
    pub props: JsonMap<String, Value>,
    pub input: I,
}
