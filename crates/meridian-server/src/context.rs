//! Request-scoped context handed through decoders, middleware and handlers.

use std::collections::HashSet;
use std::sync::Arc;

use http::Extensions;
use meridian_protocol::MetadataMap;
use meridian_trace::{TraceContext, Traced};
use meridian_transport::PathParams;

use crate::store::Store;

/// Method option disabling the server span for a method.
pub const IGNORE_TRACING: &str = "IgnoreTracing";

/// Inbound metadata key whose value is reused as the request id.
pub const REQUEST_ID_KEY: &str = "x-request-id";

/// Which listener a call arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Rpc,
    Http,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    service: Arc<str>,
    method: Arc<str>,
    transport: Transport,
    request_id: String,
    metadata: Arc<MetadataMap>,
    params: PathParams,
    options: Arc<HashSet<String>>,
    extensions: Extensions,
    store: Store,
    trace: TraceContext,
}

impl RequestContext {
    pub fn new(service: &str, method: &str, transport: Transport) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            transport,
            request_id: uuid::Uuid::new_v4().to_string(),
            metadata: Arc::new(MetadataMap::new()),
            params: PathParams::new(),
            options: Arc::new(HashSet::new()),
            extensions: Extensions::new(),
            store: Store::new(),
            trace: TraceContext::default(),
        }
    }

    /// Install inbound metadata. The trace context keeps a copy as its
    /// inbound carrier, and `x-request-id` (if present) becomes the id.
    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        if let Some(id) = metadata.get(REQUEST_ID_KEY).filter(|id| !id.is_empty()) {
            self.request_id = id.to_string();
        }
        self.trace = self.trace.with_inbound(metadata.clone());
        self.metadata = Arc::new(metadata);
        self
    }

    pub fn with_params(mut self, params: PathParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_options(mut self, options: Arc<HashSet<String>>) -> Self {
        self.options = options;
        self
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = store;
        self
    }

    /// Replace the trace context, keeping the inbound carrier.
    pub fn with_trace_context(mut self, trace: TraceContext) -> Self {
        self.trace = if self.metadata.is_empty() {
            trace
        } else {
            trace.with_inbound((*self.metadata).clone())
        };
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// `"Service/Method"`
    pub fn full_method(&self) -> String {
        format!("{}/{}", self.service, self.method)
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.options.contains(option)
    }

    pub fn options(&self) -> &HashSet<String> {
        &self.options
    }

    /// Typed values middleware hand to handlers.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

impl Traced for RequestContext {
    fn trace(&self) -> &TraceContext {
        &self.trace
    }

    fn with_trace(&self, trace: TraceContext) -> Self {
        Self {
            trace,
            ..self.clone()
        }
    }
}
