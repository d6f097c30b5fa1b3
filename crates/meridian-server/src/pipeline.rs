//! The dispatch pipeline.
//!
//! For one resolved method and one inbound call, in order: decode (HTTP
//! only), middleware `before` hooks, the handler, `after` hooks, encode
//! (HTTP only). The first failure skips the remaining stages and becomes the
//! response. A panic in any stage is caught here and turned into a
//! `HandlerPanicked` error; the serving task survives.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use http::StatusCode;
use meridian_protocol::{HandlerResult, ServiceError};
use meridian_trace::{Traced, TracingSpan, extract_inbound_span};
use meridian_transport::{HttpRequest, HttpResponse};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, error};

use crate::context::{IGNORE_TRACING, RequestContext, Transport};
use crate::middleware::MiddlewareChain;
use crate::registry::{Decoder, Encoder, MethodEntry};
use crate::service::{MethodCall, ServiceInstance};

/// Everything the pipeline needs for one call, resolved by the server.
pub(crate) struct Dispatch {
    pub(crate) entry: Arc<MethodEntry>,
    /// `None` when the service declares no such method.
    pub(crate) handler: Option<(MethodCall, ServiceInstance)>,
    pub(crate) default_encoder: Option<Encoder>,
    pub(crate) default_decoder: Option<Decoder>,
    pub(crate) chain: Result<MiddlewareChain, ServiceError>,
    /// Flips to true when `stop` gives up on in-flight calls.
    pub(crate) abandon: watch::Receiver<bool>,
}

/// Run a native RPC call.
pub(crate) async fn run_rpc(dispatch: Dispatch, ctx: RequestContext, params: Option<Value>) -> HandlerResult {
    let (span, ctx) = server_span(ctx);
    let method = ctx.full_method();
    let work = invoke(&dispatch, ctx, params.unwrap_or(Value::Null));
    let result = guarded(&dispatch.abandon, &method, work).await.and_then(|r| r);
    finish_span(&span, &result);
    result
}

/// Run an HTTP call.
pub(crate) async fn run_http(dispatch: Dispatch, ctx: RequestContext, request: HttpRequest) -> HttpResponse {
    let (span, mut ctx) = server_span(ctx);
    span.set_tag("http.method", request.method.as_str());
    span.set_tag("http.path", request.path.as_str());
    let method = ctx.full_method();

    let decoder = dispatch
        .entry
        .decoder
        .clone()
        .or_else(|| dispatch.default_decoder.clone());

    if decoder.is_none() {
        if let Some(handler) = dispatch.entry.http_handler.clone() {
            let work = async move { handler(ctx, request).await };
            let response = guarded(&dispatch.abandon, &method, work)
                .await
                .unwrap_or_else(|err| {
                    span.set_error(&err.message);
                    HttpResponse::error(&err)
                });
            span.set_tag("http.status", response.status.as_u16());
            span.end();
            return response;
        }
    }

    let encoder = dispatch
        .entry
        .encoder
        .clone()
        .or_else(|| dispatch.default_encoder.clone());
    let dispatch = &dispatch;
    let work = async move {
        let decoded = match &decoder {
            Some(decode) => decode(&mut ctx, &request),
            None => decode_json(&request),
        };
        let result = match decoded {
            Ok(value) => invoke(dispatch, ctx.clone(), value).await,
            Err(e) => {
                debug!("{} decode failed: {e}", ctx.full_method());
                Err(e)
            }
        };
        let failure = result.as_ref().err().map(|e| e.message.clone());
        let response = match encoder {
            Some(encode) => encode(&ctx, result).unwrap_or_else(|e| {
                debug!("{} encode failed: {e}", ctx.full_method());
                HttpResponse::error(&e)
            }),
            None => encode_json(result),
        };
        (failure, response)
    };

    let response = match guarded(&dispatch.abandon, &method, work).await {
        Ok((failure, response)) => {
            if let Some(message) = failure {
                span.set_error(&message);
            }
            response
        }
        Err(err) => {
            span.set_error(&err.message);
            HttpResponse::error(&err)
        }
    };
    span.set_tag("http.status", response.status.as_u16());
    span.end();
    response
}

/// Drive one call's work to completion. A panic anywhere inside it becomes
/// `HandlerPanicked`; a call still running when `stop` gives up answers
/// `ServerShuttingDown`.
async fn guarded<F: Future>(
    abandon: &watch::Receiver<bool>,
    method: &str,
    work: F,
) -> Result<F::Output, ServiceError> {
    let mut abandon = abandon.clone();
    let abandoned = async move {
        if abandon.wait_for(|gone| *gone).await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        outcome = AssertUnwindSafe(work).catch_unwind() => {
            outcome.map_err(|payload| recovered(method, payload))
        }
        _ = abandoned => {
            debug!("{method} abandoned during shutdown");
            Err(ServiceError::shutting_down())
        }
    }
}

/// Middleware, handler, after-hooks.
async fn invoke(dispatch: &Dispatch, mut ctx: RequestContext, mut request: Value) -> HandlerResult {
    let chain = match &dispatch.chain {
        Ok(chain) => chain,
        Err(e) => {
            error!("{}: {e}", ctx.full_method());
            return Err(e.clone());
        }
    };

    let (passed, allowed) = chain.run_before(&mut ctx, &mut request).await;
    let result = match allowed {
        Ok(()) => match &dispatch.handler {
            Some((call, instance)) => call(instance.clone(), ctx.clone(), request).await,
            None => Err(ServiceError::method_not_found(&ctx.full_method())),
        },
        Err(e) => Err(e),
    };
    chain.run_after(passed, &ctx, &result).await;
    result
}

fn recovered(method: &str, payload: Box<dyn Any + Send>) -> ServiceError {
    let description = panic_description(payload.as_ref());
    error!("{method} panicked: {description}");
    ServiceError::panicked(description)
}

fn panic_description(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn server_span(ctx: RequestContext) -> (TracingSpan, RequestContext) {
    if ctx.has_option(IGNORE_TRACING) {
        let ignored = ctx.trace().ignored();
        return (TracingSpan::noop(), ctx.with_trace(ignored));
    }
    let (span, ctx) = extract_inbound_span(&ctx, &ctx.full_method());
    span.set_tag(
        "transport",
        match ctx.transport() {
            Transport::Rpc => "rpc",
            Transport::Http => "http",
        },
    );
    (span, ctx)
}

fn finish_span(span: &TracingSpan, result: &HandlerResult) {
    if let Err(e) = result {
        span.set_error(&e.message);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in translation
// ─────────────────────────────────────────────────────────────────────────────

/// Decoder used when a method and its service register none: the JSON body
/// (empty means `{}`), with query parameters and then path variables merged
/// into it when it is an object.
pub fn decode_json(request: &HttpRequest) -> Result<Value, ServiceError> {
    let mut value = if request.body.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Map::new())
    } else {
        serde_json::from_slice(&request.body)
            .map_err(|e| ServiceError::parse_error(format!("invalid JSON body: {e}")))?
    };
    if let Value::Object(map) = &mut value {
        for (key, val) in &request.query {
            map.insert(key.clone(), Value::String(val.clone()));
        }
        for (key, val) in &request.params {
            map.insert(key.clone(), Value::String(val.clone()));
        }
    }
    Ok(value)
}

/// Encoder used when a method and its service register none.
pub fn encode_json(result: HandlerResult) -> HttpResponse {
    match result {
        Ok(value) => HttpResponse::json(StatusCode::OK, &value),
        Err(err) => HttpResponse::error(&err),
    }
}
