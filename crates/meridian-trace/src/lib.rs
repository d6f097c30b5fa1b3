//! Meridian tracing.
//!
//! A [`TracingSpan`] is one unit of traced work mirrored into every backend
//! a [`Tracer`] was built with. Spans are started from any request-scoped
//! value implementing [`Traced`]; each constructor returns the span plus a
//! derived context with the new span installed as the active parent.
//!
//! [`extract_inbound_span`] and [`inject_outbound_span`] move trace
//! identity across process boundaries through [`meridian_protocol::Carrier`]s.

pub mod backends;
pub mod context;
pub mod propagation;
pub mod span;
pub mod tracer;

pub use backends::{ErrorReport, ErrorReporter, LogBackend, RecordedSpan, SegmentRecorder};
pub use context::{SpanContext, SpanId, TraceContext, TraceId, Traced};
pub use propagation::{
    BinaryPropagator, GRPC_TRACE_BIN, PropagationError, Propagator, TRACEPARENT_HEADER,
    TraceContextPropagator, extract_inbound_span, inject_outbound_span,
};
pub use span::{
    SpanKind, TagValue, TracingSpan, new_datastore_span, new_external_span,
    new_http_external_span, new_internal_span,
};
pub use tracer::{BackendSpan, SpanStart, TraceBackend, Tracer, TracerBuilder};
