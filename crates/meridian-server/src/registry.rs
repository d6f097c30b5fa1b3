//! Per-service, per-method storage of HTTP translation hooks, middleware
//! names, options and route bindings.
//!
//! Every `add_*` call upserts: the entry is created on first touch and a
//! later registration of the same hook replaces the earlier one.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use meridian_protocol::{HandlerResult, ServiceError};
use meridian_transport::{HttpRequest, HttpResponse, HttpVerb};
use serde_json::Value;

use crate::context::RequestContext;

/// Turns an HTTP request (body, headers, path and query parameters) into
/// the method's request value.
pub type Decoder =
    Arc<dyn Fn(&mut RequestContext, &HttpRequest) -> Result<Value, ServiceError> + Send + Sync>;

/// Turns a handler result (success or error) into an HTTP response.
pub type Encoder =
    Arc<dyn Fn(&RequestContext, HandlerResult) -> Result<HttpResponse, ServiceError> + Send + Sync>;

pub type HttpFuture = Pin<Box<dyn Future<Output = HttpResponse> + Send>>;

/// Serves an HTTP request for a method directly, bypassing the pipeline.
pub type HttpHandlerFn = Arc<dyn Fn(RequestContext, HttpRequest) -> HttpFuture + Send + Sync>;

pub fn decoder<F>(f: F) -> Decoder
where
    F: Fn(&mut RequestContext, &HttpRequest) -> Result<Value, ServiceError> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn encoder<F>(f: F) -> Encoder
where
    F: Fn(&RequestContext, HandlerResult) -> Result<HttpResponse, ServiceError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

pub fn http_handler<F, Fut>(f: F) -> HttpHandlerFn
where
    F: Fn(RequestContext, HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    Arc::new(move |ctx: RequestContext, req: HttpRequest| -> HttpFuture {
        Box::pin(f(ctx, req))
    })
}

/// Verbs and path pattern one method is reachable at over HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteBinding {
    pub verbs: Vec<HttpVerb>,
    pub pattern: String,
}

#[derive(Clone, Default)]
pub struct MethodEntry {
    pub decoder: Option<Decoder>,
    pub encoder: Option<Encoder>,
    pub http_handler: Option<HttpHandlerFn>,
    /// Execution order; duplicates run each time.
    pub middlewares: Vec<String>,
    pub options: Arc<HashSet<String>>,
    pub bindings: Vec<RouteBinding>,
}

impl MethodEntry {
    fn bind(&mut self, verbs: &[HttpVerb], pattern: &str) {
        let mut verbs = verbs.to_vec();
        verbs.sort();
        verbs.dedup();
        match self.bindings.iter_mut().find(|b| b.pattern == pattern) {
            Some(binding) => binding.verbs = verbs,
            None => self.bindings.push(RouteBinding {
                verbs,
                pattern: pattern.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodEntry")
            .field("decoder", &self.decoder.is_some())
            .field("encoder", &self.encoder.is_some())
            .field("http_handler", &self.http_handler.is_some())
            .field("middlewares", &self.middlewares)
            .field("options", &self.options)
            .field("bindings", &self.bindings)
            .finish()
    }
}

#[derive(Default)]
struct ServiceEntry {
    methods: HashMap<String, Arc<MethodEntry>>,
    /// First-touch order of methods.
    order: Vec<String>,
    default_encoder: Option<Encoder>,
    default_decoder: Option<Decoder>,
}

/// A route binding tagged with the method it resolves to.
#[derive(Debug, Clone)]
pub struct BoundRoute {
    pub service: String,
    pub method: String,
    pub binding: RouteBinding,
}

/// The method registry. Entries are shared out as `Arc<MethodEntry>`
/// snapshots; mutation copies on write.
#[derive(Default)]
pub struct MethodRegistry {
    services: BTreeMap<String, ServiceEntry>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_mut(&mut self, service: &str, method: &str) -> &mut MethodEntry {
        let svc = self.services.entry(service.to_string()).or_default();
        if !svc.methods.contains_key(method) {
            svc.order.push(method.to_string());
        }
        let entry = svc.methods.entry(method.to_string()).or_default();
        Arc::make_mut(entry)
    }

    /// Bind `verbs` at `pattern` and set the encoder. An empty pattern adds
    /// no HTTP route; a `None` encoder leaves the current encoder alone.
    pub fn add_encoder(
        &mut self,
        service: &str,
        method: &str,
        verbs: &[HttpVerb],
        pattern: &str,
        encoder: Option<Encoder>,
    ) {
        let entry = self.entry_mut(service, method);
        if !pattern.is_empty() && !verbs.is_empty() {
            entry.bind(verbs, pattern);
        }
        if let Some(encoder) = encoder {
            entry.encoder = Some(encoder);
        }
    }

    pub fn add_decoder(&mut self, service: &str, method: &str, decoder: Decoder) {
        self.entry_mut(service, method).decoder = Some(decoder);
    }

    /// Set the raw HTTP handler. It is routed for every verb, at `pattern`
    /// or at `/{service}/{method}` when `pattern` is empty.
    pub fn add_http_handler(
        &mut self,
        service: &str,
        method: &str,
        pattern: &str,
        handler: HttpHandlerFn,
    ) {
        let pattern = if pattern.is_empty() {
            default_route(service, method)
        } else {
            pattern.to_string()
        };
        let entry = self.entry_mut(service, method);
        entry.bind(&HttpVerb::ALL, &pattern);
        entry.http_handler = Some(handler);
    }

    pub fn add_option(&mut self, service: &str, method: &str, option: &str) {
        Arc::make_mut(&mut self.entry_mut(service, method).options).insert(option.to_string());
    }

    pub fn add_middleware(&mut self, service: &str, method: &str, names: &[&str]) {
        self.entry_mut(service, method)
            .middlewares
            .extend(names.iter().map(|n| n.to_string()));
    }

    pub fn set_default_encoder(&mut self, service: &str, encoder: Encoder) {
        self.services
            .entry(service.to_string())
            .or_default()
            .default_encoder = Some(encoder);
    }

    pub fn set_default_decoder(&mut self, service: &str, decoder: Decoder) {
        self.services
            .entry(service.to_string())
            .or_default()
            .default_decoder = Some(decoder);
    }

    pub fn get(&self, service: &str, method: &str) -> Option<Arc<MethodEntry>> {
        self.services.get(service)?.methods.get(method).cloned()
    }

    pub fn default_encoder(&self, service: &str) -> Option<Encoder> {
        self.services.get(service)?.default_encoder.clone()
    }

    pub fn default_decoder(&self, service: &str) -> Option<Decoder> {
        self.services.get(service)?.default_decoder.clone()
    }

    /// Every `(service, method)` with an entry, in routing tie-break order.
    pub fn methods(&self) -> Vec<(String, String)> {
        self.services
            .iter()
            .flat_map(|(name, svc)| svc.order.iter().map(move |m| (name.clone(), m.clone())))
            .collect()
    }

    /// Every route binding, in routing tie-break order.
    pub fn routes(&self) -> Vec<BoundRoute> {
        let mut routes = Vec::new();
        for (name, svc) in &self.services {
            for method in &svc.order {
                let Some(entry) = svc.methods.get(method) else {
                    continue;
                };
                for binding in &entry.bindings {
                    routes.push(BoundRoute {
                        service: name.clone(),
                        method: method.clone(),
                        binding: binding.clone(),
                    });
                }
            }
        }
        routes
    }

    pub fn len(&self) -> usize {
        self.services.values().map(|s| s.methods.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `/{service}/{method}`
pub fn default_route(service: &str, method: &str) -> String {
    format!("/{service}/{method}")
}
