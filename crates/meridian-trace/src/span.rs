//! The span handle and its constructors.
//!
//! A [`TracingSpan`] fans every call out to the backend sub-spans it was
//! started with. The handle may be empty (see [`TracingSpan::noop`]): every
//! operation on an empty or already-ended handle is a no-op, so callers never
//! need a presence check. Dropping a span ends it.

use std::collections::HashMap;
use std::fmt;

use http::HeaderMap;
use parking_lot::Mutex;

use crate::context::{SpanContext, Traced};
use crate::tracer::{BackendSpan, Tracer};

/// Value attached to a span tag.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for TagValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u16> for TagValue {
    fn from(value: u16) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// What kind of work a span represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanKind {
    Internal,
    Datastore { store: String },
    External { url: String },
    /// Inbound call continued from a remote caller.
    Server,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Datastore { .. } => "datastore",
            Self::External { .. } => "external",
            Self::Server => "server",
        }
    }
}

/// One logical unit of traced work, mirrored into every configured backend.
pub struct TracingSpan {
    inner: Option<SpanInner>,
}

struct SpanInner {
    name: String,
    kind: SpanKind,
    context: SpanContext,
    parent: Option<SpanContext>,
    state: Mutex<SpanState>,
}

struct SpanState {
    open: bool,
    tags: HashMap<String, TagValue>,
    backends: Vec<Box<dyn BackendSpan>>,
}

impl TracingSpan {
    /// A handle that records nothing.
    pub fn noop() -> Self {
        Self { inner: None }
    }

    pub(crate) fn from_parts(
        name: &str,
        kind: SpanKind,
        context: SpanContext,
        parent: Option<SpanContext>,
        backends: Vec<Box<dyn BackendSpan>>,
    ) -> Self {
        Self {
            inner: Some(SpanInner {
                name: name.to_string(),
                kind,
                context,
                parent,
                state: Mutex::new(SpanState {
                    open: true,
                    tags: HashMap::new(),
                    backends,
                }),
            }),
        }
    }

    /// True while the span is open.
    pub fn is_recording(&self) -> bool {
        self.inner.as_ref().is_some_and(|i| i.state.lock().open)
    }

    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    pub fn context(&self) -> Option<SpanContext> {
        self.inner.as_ref().map(|i| i.context)
    }

    pub fn parent(&self) -> Option<SpanContext> {
        self.inner.as_ref().and_then(|i| i.parent)
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.as_ref().map(|i| i.name.as_str())
    }

    pub fn kind(&self) -> Option<&SpanKind> {
        self.inner.as_ref().map(|i| &i.kind)
    }

    pub fn tag(&self, key: &str) -> Option<TagValue> {
        self.inner.as_ref()?.state.lock().tags.get(key).cloned()
    }

    pub fn set_tag(&self, key: &str, value: impl Into<TagValue>) {
        let Some(inner) = &self.inner else {
            return;
        };
        let value = value.into();
        let mut state = inner.state.lock();
        if !state.open {
            return;
        }
        for backend in state.backends.iter_mut() {
            backend.set_tag(key, &value);
        }
        state.tags.insert(key.to_string(), value);
    }

    /// Record the query a datastore span executes.
    pub fn set_query(&self, query: &str) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut state = inner.state.lock();
        if !state.open {
            return;
        }
        for backend in state.backends.iter_mut() {
            backend.set_query(query);
        }
        state.tags.insert("query".into(), TagValue::from(query));
    }

    /// Mark the span as failed. An empty message is ignored.
    pub fn set_error(&self, message: &str) {
        if message.is_empty() {
            return;
        }
        let Some(inner) = &self.inner else {
            return;
        };
        let mut state = inner.state.lock();
        if !state.open {
            return;
        }
        for backend in state.backends.iter_mut() {
            backend.set_error(message);
        }
        state.tags.insert("error".into(), TagValue::from(message));
    }

    /// End the span in every backend. Later calls do nothing.
    pub fn end(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut state = inner.state.lock();
        if !state.open {
            return;
        }
        state.open = false;
        for backend in state.backends.iter_mut() {
            backend.end();
        }
    }

    pub fn finish(&self) {
        self.end();
    }
}

impl Drop for TracingSpan {
    fn drop(&mut self) {
        self.end();
    }
}

impl fmt::Debug for TracingSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.write_str("TracingSpan(noop)"),
            Some(inner) => f
                .debug_struct("TracingSpan")
                .field("name", &inner.name)
                .field("kind", &inner.kind)
                .field("context", &inner.context)
                .field("open", &inner.state.lock().open)
                .finish(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Constructors
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn start_span<C: Traced>(
    ctx: &C,
    name: &str,
    kind: SpanKind,
    parent: Option<SpanContext>,
) -> (TracingSpan, C) {
    let trace = ctx.trace();
    let tracer = match trace.tracer() {
        Some(tracer) if !trace.is_ignored() => tracer,
        _ => return (TracingSpan::noop(), ctx.with_trace(trace.clone())),
    };
    let span = tracer.start_span(name, kind, parent);
    let next = match span.context() {
        Some(cx) => trace.with_active(cx),
        None => trace.clone(),
    };
    (span, ctx.with_trace(next))
}

fn start_child<C: Traced>(ctx: &C, name: &str, kind: SpanKind) -> (TracingSpan, C) {
    let parent = ctx.trace().active().copied();
    start_span(ctx, name, kind, parent)
}

/// Start a span for work done inside this process.
pub fn new_internal_span<C: Traced>(ctx: &C, name: &str) -> (TracingSpan, C) {
    start_child(ctx, name, SpanKind::Internal)
}

/// Start a span for a datastore call. The datastore name is prefixed to
/// `name` unless it already starts with it.
pub fn new_datastore_span<C: Traced>(ctx: &C, name: &str, datastore: &str) -> (TracingSpan, C) {
    let name = if name.starts_with(datastore) {
        name.to_string()
    } else {
        format!("{datastore}{name}")
    };
    let (span, ctx) = start_child(
        ctx,
        &name,
        SpanKind::Datastore {
            store: datastore.to_string(),
        },
    );
    span.set_tag("store", datastore);
    (span, ctx)
}

/// Start a span for a call to an external system.
pub fn new_external_span<C: Traced>(ctx: &C, name: &str, url: &str) -> (TracingSpan, C) {
    let (span, ctx) = start_child(
        ctx,
        name,
        SpanKind::External {
            url: url.to_string(),
        },
    );
    span.set_tag("url", url);
    span.set_tag("span.kind", "client");
    (span, ctx)
}

/// Start an external span for an outbound HTTP request and write its trace
/// context into `headers` so the callee can continue the trace.
pub fn new_http_external_span<C: Traced>(
    ctx: &C,
    name: &str,
    url: &str,
    headers: &mut HeaderMap,
) -> (TracingSpan, C) {
    let (span, ctx) = new_external_span(ctx, name, url);
    if let (Some(tracer), Some(cx)) = (ctx.trace().tracer(), span.context()) {
        tracer.inject(&cx, headers);
    }
    (span, ctx)
}

impl Tracer {
    /// Start a span in every backend.
    pub fn start_span(
        &self,
        name: &str,
        kind: SpanKind,
        parent: Option<SpanContext>,
    ) -> TracingSpan {
        let context = match parent {
            Some(parent) => parent.child(),
            None => SpanContext::new_root(),
        };
        let backends = self.open_backend_spans(name, &kind, context, parent);
        TracingSpan::from_parts(name, kind, context, parent, backends)
    }
}
