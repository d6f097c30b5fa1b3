//! Trace identity and the request-scoped trace context.

use std::fmt;
use std::sync::Arc;

use meridian_protocol::MetadataMap;

use crate::tracer::Tracer;

/// 128-bit trace identifier shared by every span of one logical trace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(u128);

impl TraceId {
    pub const INVALID: TraceId = TraceId(0);

    pub fn random() -> Self {
        loop {
            let id: u128 = rand::random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn from_u128(id: u128) -> Self {
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 32 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u128::from_str_radix(hex, 16).ok().map(Self)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({self})")
    }
}

/// 64-bit identifier of one span within a trace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

impl SpanId {
    pub const INVALID: SpanId = SpanId(0);

    pub fn random() -> Self {
        loop {
            let id: u64 = rand::random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 16 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u64::from_str_radix(hex, 16).ok().map(Self)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({self})")
    }
}

/// The propagated part of a span: what crosses process boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub sampled: bool,
    /// True when this context was extracted from an inbound carrier.
    pub remote: bool,
}

impl SpanContext {
    /// Identity of a new root span in a fresh trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: TraceId::random(),
            span_id: SpanId::random(),
            sampled: true,
            remote: false,
        }
    }

    /// Identity of a new span whose parent is `self`.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: SpanId::random(),
            sampled: self.sampled,
            remote: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.trace_id.is_valid() && self.span_id.is_valid()
    }
}

/// Request-scoped trace state: which tracer to use, the active parent span,
/// and the inbound carrier a server span can be continued from.
#[derive(Clone, Default)]
pub struct TraceContext {
    tracer: Option<Arc<Tracer>>,
    active: Option<SpanContext>,
    inbound: Option<Arc<MetadataMap>>,
    ignored: bool,
}

impl TraceContext {
    pub fn new(tracer: Arc<Tracer>) -> Self {
        Self {
            tracer: Some(tracer),
            ..Self::default()
        }
    }

    pub fn tracer(&self) -> Option<&Arc<Tracer>> {
        self.tracer.as_ref()
    }

    /// Identity of the span that new spans will be parented to.
    pub fn active(&self) -> Option<&SpanContext> {
        self.active.as_ref()
    }

    pub fn inbound(&self) -> Option<&MetadataMap> {
        self.inbound.as_deref()
    }

    /// When set, span constructors hand out no-op spans.
    pub fn is_ignored(&self) -> bool {
        self.ignored
    }

    pub fn with_active(&self, active: SpanContext) -> Self {
        Self {
            active: Some(active),
            ..self.clone()
        }
    }

    pub fn with_inbound(&self, inbound: MetadataMap) -> Self {
        Self {
            inbound: Some(Arc::new(inbound)),
            ..self.clone()
        }
    }

    pub fn ignored(&self) -> Self {
        Self {
            ignored: true,
            ..self.clone()
        }
    }
}

impl fmt::Debug for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceContext")
            .field("has_tracer", &self.tracer.is_some())
            .field("active", &self.active)
            .field("ignored", &self.ignored)
            .finish()
    }
}

/// Anything that carries a [`TraceContext`] and can be re-derived with a
/// different one. Span constructors return the same context type they
/// were given, with the new span installed as the active parent.
pub trait Traced: Sized {
    fn trace(&self) -> &TraceContext;

    fn with_trace(&self, trace: TraceContext) -> Self;
}

impl Traced for TraceContext {
    fn trace(&self) -> &TraceContext {
        self
    }

    fn with_trace(&self, trace: TraceContext) -> Self {
        trace
    }
}
