//! The server contract generated bindings program against, the optional
//! capabilities a server may implement, and the registration helpers that
//! degrade to a logged no-op when a capability is missing.

use std::sync::Arc;

use meridian_transport::HttpVerb;
use tracing::warn;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::initializer::Initializer;
use crate::registry::{Decoder, Encoder, HttpHandlerFn};
use crate::service::ServiceRegistration;
use crate::store::StoreValue;

/// What every server implementation provides.
pub trait Server: Send + Sync {
    /// Register a service's method table and instance factory. Fails on a
    /// duplicate name or an invalid descriptor.
    fn register_service(&self, registration: ServiceRegistration) -> Result<(), ServerError>;

    fn add_initializers(&self, initializers: Vec<Arc<dyn Initializer>>);

    /// Store a value for initializers and handlers. Last write wins.
    fn store(&self, key: &str, value: StoreValue);

    fn fetch(&self, key: &str) -> Option<StoreValue>;

    fn config(&self) -> &ServerConfig;

    fn as_encodeable(&self) -> Option<&dyn Encodeable> {
        None
    }

    fn as_decodable(&self) -> Option<&dyn Decodable> {
        None
    }

    fn as_http_interceptor(&self) -> Option<&dyn HttpInterceptor> {
        None
    }

    fn as_optionable(&self) -> Option<&dyn Optionable> {
        None
    }

    fn as_middlewareable(&self) -> Option<&dyn Middlewareable> {
        None
    }
}

/// Servers that encode handler results into HTTP responses.
pub trait Encodeable {
    fn add_encoder(
        &self,
        service: &str,
        method: &str,
        verbs: &[HttpVerb],
        path: &str,
        encoder: Option<Encoder>,
    );

    fn add_default_encoder(&self, service: &str, encoder: Encoder);
}

/// Servers that decode HTTP requests into method requests.
pub trait Decodable {
    fn add_decoder(&self, service: &str, method: &str, decoder: Decoder);

    fn add_default_decoder(&self, service: &str, decoder: Decoder);
}

/// Servers that let a method serve HTTP directly.
pub trait HttpInterceptor {
    fn add_http_handler(&self, service: &str, method: &str, path: &str, handler: HttpHandlerFn);
}

/// Servers that attach string options to methods.
pub trait Optionable {
    fn add_option(&self, service: &str, method: &str, option: &str);
}

/// Servers that run named middleware around methods.
pub trait Middlewareable {
    fn add_middleware(&self, service: &str, method: &str, names: &[&str]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Registration helpers
// ─────────────────────────────────────────────────────────────────────────────

fn unsupported(capability: &str, service: &str, method: &str) -> bool {
    warn!("Server does not support {capability}; skipped registration for {service}/{method}");
    false
}

/// Bind one verb at `path` and set the encoder. Returns false when the
/// server cannot encode.
pub fn register_encoder(
    server: &dyn Server,
    service: &str,
    method: &str,
    verb: HttpVerb,
    path: &str,
    encoder: Option<Encoder>,
) -> bool {
    register_encoders(server, service, method, &[verb], path, encoder)
}

pub fn register_encoders(
    server: &dyn Server,
    service: &str,
    method: &str,
    verbs: &[HttpVerb],
    path: &str,
    encoder: Option<Encoder>,
) -> bool {
    match server.as_encodeable() {
        Some(e) => {
            e.add_encoder(service, method, verbs, path, encoder);
            true
        }
        None => unsupported("encoders", service, method),
    }
}

pub fn register_default_encoder(server: &dyn Server, service: &str, encoder: Encoder) -> bool {
    match server.as_encodeable() {
        Some(e) => {
            e.add_default_encoder(service, encoder);
            true
        }
        None => unsupported("encoders", service, "*"),
    }
}

pub fn register_decoder(server: &dyn Server, service: &str, method: &str, decoder: Decoder) -> bool {
    match server.as_decodable() {
        Some(d) => {
            d.add_decoder(service, method, decoder);
            true
        }
        None => unsupported("decoders", service, method),
    }
}

pub fn register_default_decoder(server: &dyn Server, service: &str, decoder: Decoder) -> bool {
    match server.as_decodable() {
        Some(d) => {
            d.add_default_decoder(service, decoder);
            true
        }
        None => unsupported("decoders", service, "*"),
    }
}

pub fn register_handler(
    server: &dyn Server,
    service: &str,
    method: &str,
    path: &str,
    handler: HttpHandlerFn,
) -> bool {
    match server.as_http_interceptor() {
        Some(h) => {
            h.add_http_handler(service, method, path, handler);
            true
        }
        None => unsupported("HTTP handlers", service, method),
    }
}

pub fn register_method_option(server: &dyn Server, service: &str, method: &str, option: &str) -> bool {
    match server.as_optionable() {
        Some(o) => {
            o.add_option(service, method, option);
            true
        }
        None => unsupported("method options", service, method),
    }
}

pub fn register_middleware(server: &dyn Server, service: &str, method: &str, names: &[&str]) -> bool {
    match server.as_middlewareable() {
        Some(m) => {
            m.add_middleware(service, method, names);
            true
        }
        None => unsupported("middleware", service, method),
    }
}
