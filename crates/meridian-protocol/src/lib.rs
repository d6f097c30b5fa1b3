//! Meridian protocol types.
//!
//! Shared by the transport, tracing and server crates: the error model
//! (JSON-RPC error objects with HTTP status mappings), the JSON-RPC 2.0
//! envelopes spoken by the native RPC transport, and the metadata carriers
//! used to propagate trace context across process boundaries.

pub mod error;
pub mod jsonrpc;
pub mod metadata;

pub use error::{ErrorCode, ServiceError};
pub use jsonrpc::{
    HandlerResult, RequestId, RpcErrorResponse, RpcRequest, RpcResponse, RpcSuccessResponse,
    split_target,
};
pub use metadata::{BINARY_SUFFIX, Carrier, CarrierError, MetadataMap};
