//! The fan-out tracer and the contract each tracing backend satisfies.

use std::fmt;
use std::sync::Arc;

use meridian_protocol::Carrier;
use tracing::debug;

use crate::context::SpanContext;
use crate::propagation::{BinaryPropagator, Propagator, TraceContextPropagator};
use crate::span::{SpanKind, TagValue};

/// Everything a backend needs to open its side of a span.
#[derive(Debug)]
pub struct SpanStart<'a> {
    pub name: &'a str,
    pub kind: &'a SpanKind,
    pub context: SpanContext,
    pub parent: Option<SpanContext>,
}

/// A tracing system spans are mirrored into.
pub trait TraceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn start_span(&self, start: &SpanStart<'_>) -> Box<dyn BackendSpan>;
}

/// A backend's half of one span.
///
/// [`crate::TracingSpan`] forwards `end` at most once; backends that can be
/// reached through other paths still guard against ending twice.
pub trait BackendSpan: Send {
    fn set_tag(&mut self, key: &str, value: &TagValue);

    fn set_query(&mut self, _query: &str) {}

    fn set_error(&mut self, _message: &str) {}

    fn end(&mut self);
}

/// Starts spans in zero or more backends and moves span contexts in and out
/// of carriers. A tracer with no backends still hands out span identities,
/// so context keeps propagating through services that record nothing.
pub struct Tracer {
    backends: Vec<Arc<dyn TraceBackend>>,
    propagators: Vec<Arc<dyn Propagator>>,
}

impl Tracer {
    pub fn builder() -> TracerBuilder {
        TracerBuilder::default()
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub(crate) fn open_backend_spans(
        &self,
        name: &str,
        kind: &SpanKind,
        context: SpanContext,
        parent: Option<SpanContext>,
    ) -> Vec<Box<dyn BackendSpan>> {
        let start = SpanStart {
            name,
            kind,
            context,
            parent,
        };
        self.backends.iter().map(|b| b.start_span(&start)).collect()
    }

    /// Write `cx` into `carrier` with every propagator.
    pub fn inject(&self, cx: &SpanContext, carrier: &mut dyn Carrier) {
        for propagator in &self.propagators {
            propagator.inject(cx, carrier);
        }
    }

    /// Read the first valid span context any propagator finds in `carrier`.
    /// Malformed entries are logged and skipped.
    pub fn extract(&self, carrier: &dyn Carrier) -> Option<SpanContext> {
        for propagator in &self.propagators {
            match propagator.extract(carrier) {
                Ok(Some(cx)) => return Some(cx),
                Ok(None) => {}
                Err(e) => debug!("{} propagator: {e}", propagator.name()),
            }
        }
        None
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("backends", &self.backend_names())
            .field(
                "propagators",
                &self.propagators.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builder for [`Tracer`]. Without explicit propagators the tracer speaks
/// W3C `traceparent` and `grpc-trace-bin`.
#[derive(Default)]
pub struct TracerBuilder {
    backends: Vec<Arc<dyn TraceBackend>>,
    propagators: Option<Vec<Arc<dyn Propagator>>>,
}

impl TracerBuilder {
    pub fn backend<B: TraceBackend + 'static>(mut self, backend: B) -> Self {
        self.backends.push(Arc::new(backend));
        self
    }

    pub fn shared_backend(mut self, backend: Arc<dyn TraceBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn propagator<P: Propagator + 'static>(mut self, propagator: P) -> Self {
        self.propagators
            .get_or_insert_with(Vec::new)
            .push(Arc::new(propagator));
        self
    }

    pub fn build(self) -> Tracer {
        let propagators = self.propagators.unwrap_or_else(|| {
            vec![
                Arc::new(TraceContextPropagator) as Arc<dyn Propagator>,
                Arc::new(BinaryPropagator),
            ]
        });
        Tracer {
            backends: self.backends,
            propagators,
        }
    }
}
