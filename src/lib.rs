//! Runtime core for Strand-generated RPC clients and servers.
//!
//! An IDL describes an API as named RPC services, each containing
//! **procedures** (unary request/response) and **streams** (server-push
//! event series over SSE). The toolchain compiles that IDL to typed stubs;
//! this crate is the engine those stubs delegate to:
//!
//! - [`server::RpcServer`] -- decodes one HTTP request, selects the
//!   operation, drives the layered middleware chain, invokes the handler,
//!   and for streams keeps the SSE connection alive with emit middleware
//!   and keepalive pings.
//! - [`client::RpcClient`] -- serialises a call, runs the header-provider
//!   pipeline and interceptor chain, retries procedures with jittered
//!   backoff, and reconnects streams with SSE framing.
//!
//! Both engines share the wire [`Envelope`], the structured [`Error`]
//! model, the [`OperationCatalog`], and the configuration precedence rule
//! (operation > rpc > global > default) in [`config`].
//!
//! The HTTP transport is pluggable: the server engine only talks to
//! [`transport::ServerExchange`], and a reference adapter over hyper ships
//! in [`transport::hyper`].
//!
//! ## Example
//! ```no_run
//! use strand_rpc::{OperationCatalog, OperationId, Result};
//! use strand_rpc::client::RpcClient;
//! use serde_json::{json, Value};
//!
//! # async fn run() -> Result<()> {
//! let catalog = OperationCatalog::new([OperationId::proc("Echo", "Say")]);
//! let client = RpcClient::new("http://127.0.0.1:8080", catalog)?;
//! let output: Value = client.proc("Echo", "Say").execute(json!({"text": "hi"})).await?;
//! assert_eq!(output, json!({"text": "hi"}));
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod chain;
pub mod client;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod server;
pub mod transport;
pub mod version;

pub use catalog::{OperationCatalog, OperationId, OperationKind};
pub use context::{CallContext, TypedContext};
pub use envelope::Envelope;
pub use error::{Error, Result};

pub use client::{RpcClient, RpcClientBuilder};
pub use server::RpcServer;
