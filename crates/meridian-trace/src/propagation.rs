//! Moving trace context across process boundaries.
//!
//! A [`Propagator`] understands one carrier format. The context propagator
//! functions at the bottom of this module bridge inbound carriers into a
//! server span and write the active span into outbound carriers.

use meridian_protocol::{Carrier, CarrierError};

use crate::context::{SpanContext, SpanId, TraceId, Traced};
use crate::span::{SpanKind, TracingSpan, start_span};

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const GRPC_TRACE_BIN: &str = "grpc-trace-bin";

const FLAG_SAMPLED: u8 = 0x01;

#[derive(Debug, thiserror::Error)]
pub enum PropagationError {
    #[error("malformed {carrier} value: {reason}")]
    Malformed {
        carrier: &'static str,
        reason: &'static str,
    },
    #[error(transparent)]
    Carrier(#[from] CarrierError),
}

fn malformed(carrier: &'static str, reason: &'static str) -> PropagationError {
    PropagationError::Malformed { carrier, reason }
}

/// One wire format for span contexts.
pub trait Propagator: Send + Sync {
    fn name(&self) -> &str;

    fn inject(&self, cx: &SpanContext, carrier: &mut dyn Carrier);

    /// `Ok(None)` when the carrier holds no context in this format.
    fn extract(&self, carrier: &dyn Carrier) -> Result<Option<SpanContext>, PropagationError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// W3C trace context
// ─────────────────────────────────────────────────────────────────────────────

/// `traceparent: 00-<trace id>-<span id>-<flags>`
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceContextPropagator;

impl Propagator for TraceContextPropagator {
    fn name(&self) -> &str {
        "tracecontext"
    }

    fn inject(&self, cx: &SpanContext, carrier: &mut dyn Carrier) {
        let flags = if cx.sampled { FLAG_SAMPLED } else { 0 };
        carrier.set(
            TRACEPARENT_HEADER,
            format!("00-{}-{}-{flags:02x}", cx.trace_id, cx.span_id),
        );
    }

    fn extract(&self, carrier: &dyn Carrier) -> Result<Option<SpanContext>, PropagationError> {
        let Some(value) = carrier.get(TRACEPARENT_HEADER) else {
            return Ok(None);
        };
        parse_traceparent(value.trim()).map(Some)
    }
}

fn parse_traceparent(value: &str) -> Result<SpanContext, PropagationError> {
    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() < 4 {
        return Err(malformed(TRACEPARENT_HEADER, "expected four fields"));
    }
    let version = parts[0];
    if version.len() != 2 || u8::from_str_radix(version, 16).is_err() || version == "ff" {
        return Err(malformed(TRACEPARENT_HEADER, "bad version"));
    }
    if version == "00" && parts.len() != 4 {
        return Err(malformed(TRACEPARENT_HEADER, "unexpected trailing fields"));
    }
    let trace_id = TraceId::from_hex(parts[1])
        .filter(TraceId::is_valid)
        .ok_or_else(|| malformed(TRACEPARENT_HEADER, "bad trace id"))?;
    let span_id = SpanId::from_hex(parts[2])
        .filter(SpanId::is_valid)
        .ok_or_else(|| malformed(TRACEPARENT_HEADER, "bad span id"))?;
    if parts[3].len() != 2 {
        return Err(malformed(TRACEPARENT_HEADER, "bad flags"));
    }
    let flags = u8::from_str_radix(parts[3], 16)
        .map_err(|_| malformed(TRACEPARENT_HEADER, "bad flags"))?;
    Ok(SpanContext {
        trace_id,
        span_id,
        sampled: flags & FLAG_SAMPLED != 0,
        remote: true,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Binary trace context
// ─────────────────────────────────────────────────────────────────────────────

/// `grpc-trace-bin`: version byte, then id-tagged trace id, span id and
/// options fields. Base64-encoded in text carriers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryPropagator;

const BINARY_LEN: usize = 29;

impl Propagator for BinaryPropagator {
    fn name(&self) -> &str {
        "binary"
    }

    fn inject(&self, cx: &SpanContext, carrier: &mut dyn Carrier) {
        let mut buf = Vec::with_capacity(BINARY_LEN);
        buf.push(0); // version
        buf.push(0);
        buf.extend_from_slice(&cx.trace_id.to_bytes());
        buf.push(1);
        buf.extend_from_slice(&cx.span_id.to_bytes());
        buf.push(2);
        buf.push(if cx.sampled { FLAG_SAMPLED } else { 0 });
        carrier.set_binary(GRPC_TRACE_BIN, &buf);
    }

    fn extract(&self, carrier: &dyn Carrier) -> Result<Option<SpanContext>, PropagationError> {
        let Some(buf) = carrier.get_binary(GRPC_TRACE_BIN)? else {
            return Ok(None);
        };
        parse_binary(&buf).map(Some)
    }
}

fn parse_binary(buf: &[u8]) -> Result<SpanContext, PropagationError> {
    if buf.len() < BINARY_LEN {
        return Err(malformed(GRPC_TRACE_BIN, "too short"));
    }
    if buf[0] != 0 {
        return Err(malformed(GRPC_TRACE_BIN, "unsupported version"));
    }
    if buf[1] != 0 || buf[18] != 1 || buf[27] != 2 {
        return Err(malformed(GRPC_TRACE_BIN, "unexpected field layout"));
    }
    let mut trace = [0u8; 16];
    trace.copy_from_slice(&buf[2..18]);
    let mut span = [0u8; 8];
    span.copy_from_slice(&buf[19..27]);

    let cx = SpanContext {
        trace_id: TraceId::from_bytes(trace),
        span_id: SpanId::from_bytes(span),
        sampled: buf[28] & FLAG_SAMPLED != 0,
        remote: true,
    };
    if !cx.is_valid() {
        return Err(malformed(GRPC_TRACE_BIN, "zero id"));
    }
    Ok(cx)
}

// ─────────────────────────────────────────────────────────────────────────────
// Context propagator
// ─────────────────────────────────────────────────────────────────────────────

/// Continue the caller's trace for an inbound call.
///
/// Reads the inbound carrier installed on `ctx`; when it holds no usable
/// context, the server span is parented to the locally active span if any,
/// otherwise it starts a fresh root trace. The returned context has the
/// server span installed as the active parent.
pub fn extract_inbound_span<C: Traced>(ctx: &C, operation: &str) -> (TracingSpan, C) {
    let trace = ctx.trace();
    let remote = match (trace.tracer(), trace.inbound()) {
        (Some(tracer), Some(inbound)) => tracer.extract(inbound),
        _ => None,
    };
    let parent = remote.or_else(|| trace.active().copied());
    let (span, ctx) = start_span(ctx, operation, SpanKind::Server, parent);
    span.set_tag("span.kind", "server");
    (span, ctx)
}

/// Write the active span's context into an outbound carrier. Returns false
/// (and writes nothing) when no span is active.
pub fn inject_outbound_span<C: Traced>(ctx: &C, carrier: &mut dyn Carrier) -> bool {
    let trace = ctx.trace();
    match (trace.tracer(), trace.active()) {
        (Some(tracer), Some(cx)) => {
            tracer.inject(cx, carrier);
            true
        }
        _ => false,
    }
}
