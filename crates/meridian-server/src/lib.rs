//! Meridian server: serves one set of RPC methods over native RPC and
//! HTTP/REST at once.
//!
//! Generated bindings register a [`ServiceRegistration`] and attach HTTP
//! encoders, decoders, raw handlers, middleware and options per method
//! through the `register_*` helpers. [`DefaultServer`] resolves every
//! inbound call to its method and runs it through the dispatch pipeline:
//! decode, middleware, handler, encode.

pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod initializer;
pub mod middleware;
pub mod pipeline;
pub mod registry;
pub mod router;
pub mod server;
pub mod service;
pub mod store;

pub use capability::{
    Decodable, Encodeable, HttpInterceptor, Middlewareable, Optionable, Server,
    register_decoder, register_default_decoder, register_default_encoder, register_encoder,
    register_encoders, register_handler, register_method_option, register_middleware,
};
pub use config::ServerConfig;
pub use context::{IGNORE_TRACING, REQUEST_ID_KEY, RequestContext, Transport};
pub use error::{InitError, ServerError};
pub use initializer::Initializer;
pub use middleware::{Middleware, MiddlewareSet};
pub use pipeline::{decode_json, encode_json};
pub use registry::{
    BoundRoute, Decoder, Encoder, HttpFuture, HttpHandlerFn, MethodEntry, MethodRegistry,
    RouteBinding, decoder, default_route, encoder, http_handler,
};
pub use router::{HttpRouter, PathPattern, RouteMatch};
pub use server::{DefaultServer, ServerState};
pub use service::{
    MethodFuture, ServiceDescriptor, ServiceFactory, ServiceInstance, ServiceRegistration,
};
pub use store::{Store, StoreValue};
