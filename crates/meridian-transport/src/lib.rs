//! Meridian transport layer.
//!
//! Two listeners share one handler:
//! - HTTP: every request is read fully and passed to [`HttpHandler`], which
//!   owns routing.
//! - Native RPC: JSON-RPC 2.0 over WebSocket at `/rpc`. Methods are addressed
//!   as `"Service/Method"` and call metadata travels in the request's
//!   `metadata` member.
//!
//! The transport is decoupled from the server via [`RpcHandler`] and
//! [`HttpHandler`].

pub mod request;
pub mod server;

pub use request::{HttpRequest, HttpResponse, HttpVerb, PathParams, UnsupportedVerb};
pub use server::{
    HttpHandler, RpcHandler, ShutdownHandle, TransportConfig, TransportError, TransportServer,
};
