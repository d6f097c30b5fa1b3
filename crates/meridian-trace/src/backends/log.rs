use std::time::Instant;

use tracing::{Level, Span, debug, field};

use crate::span::TagValue;
use crate::tracer::{BackendSpan, SpanStart, TraceBackend};

/// Mirrors spans into `tracing` spans at the configured level.
#[derive(Debug, Clone)]
pub struct LogBackend {
    level: Level,
}

impl LogBackend {
    pub fn new() -> Self {
        Self { level: Level::INFO }
    }

    pub fn with_level(level: Level) -> Self {
        Self { level }
    }
}

impl Default for LogBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceBackend for LogBackend {
    fn name(&self) -> &str {
        "log"
    }

    fn start_span(&self, start: &SpanStart<'_>) -> Box<dyn BackendSpan> {
        let parent_id = start.parent.map(|p| p.span_id.to_string());
        macro_rules! open {
            ($lvl:expr) => {
                tracing::span!(
                    $lvl,
                    "span",
                    otel.name = start.name,
                    otel.kind = start.kind.as_str(),
                    trace_id = %start.context.trace_id,
                    span_id = %start.context.span_id,
                    parent_id = parent_id.as_deref(),
                    query = field::Empty,
                    error = field::Empty,
                )
            };
        }
        // span! needs a constant level per callsite
        let span = match self.level {
            Level::TRACE => open!(Level::TRACE),
            Level::DEBUG => open!(Level::DEBUG),
            Level::INFO => open!(Level::INFO),
            Level::WARN => open!(Level::WARN),
            _ => open!(Level::ERROR),
        };
        Box::new(LogSpan {
            span: Some(span),
            started: Instant::now(),
        })
    }
}

struct LogSpan {
    span: Option<Span>,
    started: Instant,
}

impl BackendSpan for LogSpan {
    fn set_tag(&mut self, key: &str, value: &TagValue) {
        if let Some(span) = &self.span {
            debug!(parent: span, tag = key, value = %value, "span tag");
        }
    }

    fn set_query(&mut self, query: &str) {
        if let Some(span) = &self.span {
            span.record("query", query);
        }
    }

    fn set_error(&mut self, message: &str) {
        if let Some(span) = &self.span {
            span.record("error", message);
        }
    }

    fn end(&mut self) {
        if let Some(span) = self.span.take() {
            let elapsed_ms = self.started.elapsed().as_millis() as u64;
            debug!(parent: &span, elapsed_ms, "span ended");
        }
    }
}
