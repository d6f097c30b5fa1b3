//! EchoService: the demo service, plus the bindings a code generator would
//! emit for it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use http::StatusCode;
use meridian_protocol::{HandlerResult, ServiceError};
use meridian_server::{
    DefaultServer, HttpHandlerFn, InitError, Initializer, Middleware, RequestContext, Server,
    ServerError, ServiceDescriptor, ServiceFactory, ServiceRegistration, decoder, http_handler,
    register_decoder, register_encoders, register_handler, register_middleware,
};
use meridian_trace::{inject_outbound_span, new_internal_span};
use meridian_transport::{HttpRequest, HttpResponse, HttpVerb};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

pub const SERVICE_NAME: &str = "EchoService";

/// Store key of the shared call counter.
pub const CALLS_KEY: &str = "echo.calls";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpperRequest {
    pub msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpperResponse {
    pub msg: String,
    pub result: String,
}

pub struct EchoService {
    calls: Arc<AtomicU64>,
}

impl EchoService {
    pub fn new(calls: Arc<AtomicU64>) -> Self {
        Self { calls }
    }

    pub async fn upper(&self, ctx: RequestContext, req: UpperRequest) -> Result<UpperResponse, ServiceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let (span, _ctx) = new_internal_span(&ctx, "uppercase");
        span.set_tag("msg.len", req.msg.len() as i64);
        let result = req.msg.to_uppercase();
        span.end();
        Ok(UpperResponse {
            msg: req.msg,
            result,
        })
    }

    /// Upper, reached through a forwarding hop.
    pub async fn upper_proxy(
        &self,
        ctx: RequestContext,
        req: UpperRequest,
    ) -> Result<UpperResponse, ServiceError> {
        let (span, ctx) = new_internal_span(&ctx, "proxy.forward");
        let response = self.upper(ctx, req).await;
        if let Err(e) = &response {
            span.set_error(&e.message);
        }
        span.end();
        response
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

/// Builds an [`EchoService`] around the counter the initializer stored.
pub struct EchoFactory;

impl ServiceFactory<EchoService> for EchoFactory {
    fn new_service(&self, server: &dyn Server) -> EchoService {
        let calls = server
            .fetch(CALLS_KEY)
            .and_then(|v| v.downcast::<AtomicU64>().ok())
            .unwrap_or_default();
        EchoService::new(calls)
    }

    fn dispose_service(&self, service: Arc<EchoService>) {
        debug!("Disposing EchoService after {} calls", service.calls());
    }
}

/// Puts the shared call counter into the store.
pub struct EchoInit;

impl Initializer for EchoInit {
    fn init(&self, server: &dyn Server) -> Result<(), InitError> {
        if server.fetch(CALLS_KEY).is_none() {
            server.store(CALLS_KEY, Arc::new(AtomicU64::new(0)));
        }
        Ok(())
    }

    fn reinit(&self, server: &dyn Server) -> Result<(), InitError> {
        let calls = server
            .fetch(CALLS_KEY)
            .and_then(|v| v.downcast::<AtomicU64>().ok())
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0);
        info!("EchoService reinit ({calls} calls so far)");
        Ok(())
    }
}

/// Logs each call with its request id.
pub struct RequestLog;

impl Middleware for RequestLog {
    async fn before(&self, ctx: &mut RequestContext, _request: &mut Value) -> Result<(), ServiceError> {
        debug!("{} [{}] via {:?}", ctx.full_method(), ctx.request_id(), ctx.transport());
        Ok(())
    }

    async fn after(&self, ctx: &RequestContext, result: &HandlerResult) {
        if let Err(e) = result {
            debug!("{} [{}] failed: {e}", ctx.full_method(), ctx.request_id());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generated bindings
// ─────────────────────────────────────────────────────────────────────────────

pub fn descriptor() -> ServiceDescriptor<EchoService> {
    ServiceDescriptor::new(SERVICE_NAME)
        .method(
            "Upper",
            |svc: Arc<EchoService>, ctx: RequestContext, req: UpperRequest| async move {
                svc.upper(ctx, req).await
            },
        )
        .method(
            "UpperProxy",
            |svc: Arc<EchoService>, ctx: RequestContext, req: UpperRequest| async move {
                svc.upper_proxy(ctx, req).await
            },
        )
}

/// `GET|POST|OPTIONS /api/1.0/upper/{msg}`
pub fn register_upper_encoder(server: &dyn Server, encoder: Option<meridian_server::Encoder>) -> bool {
    register_encoders(
        server,
        SERVICE_NAME,
        "Upper",
        &[HttpVerb::Get, HttpVerb::Post, HttpVerb::Options],
        "/api/1.0/upper/{msg}",
        encoder,
    )
}

/// `POST|PUT`, no HTTP path.
pub fn register_upper_proxy_encoder(
    server: &dyn Server,
    encoder: Option<meridian_server::Encoder>,
) -> bool {
    register_encoders(
        server,
        SERVICE_NAME,
        "UpperProxy",
        &[HttpVerb::Post, HttpVerb::Put],
        "",
        encoder,
    )
}

pub fn register_upper_handler(server: &dyn Server, handler: HttpHandlerFn) -> bool {
    register_handler(server, SERVICE_NAME, "Upper", "/api/1.0/upper/{msg}", handler)
}

pub fn register_upper_proxy_handler(server: &dyn Server, handler: HttpHandlerFn) -> bool {
    register_handler(server, SERVICE_NAME, "UpperProxy", "", handler)
}

pub fn register_upper_decoder(server: &dyn Server, decoder: meridian_server::Decoder) -> bool {
    register_decoder(server, SERVICE_NAME, "Upper", decoder)
}

pub fn register_upper_proxy_decoder(server: &dyn Server, decoder: meridian_server::Decoder) -> bool {
    register_decoder(server, SERVICE_NAME, "UpperProxy", decoder)
}

/// Register the service and its default HTTP bindings.
pub fn register_echo_service<F>(factory: F, server: &dyn Server) -> Result<(), ServerError>
where
    F: ServiceFactory<EchoService>,
{
    server.register_service(ServiceRegistration::new(descriptor(), factory))?;
    register_upper_encoder(server, None);
    register_upper_proxy_encoder(server, None);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────────────────────────

/// `msg` comes from the path, falling back to the JSON body.
fn upper_decoder(_ctx: &mut RequestContext, req: &HttpRequest) -> Result<Value, ServiceError> {
    if let Some(msg) = req.param("msg") {
        return Ok(json!({ "msg": msg }));
    }
    meridian_server::decode_json(req)
}

/// Serves `UpperProxy` at its default route and hands the trace back in a
/// `traceparent` header.
fn upper_proxy_http() -> HttpHandlerFn {
    http_handler(|ctx: RequestContext, req: HttpRequest| async move {
        let request: UpperRequest = match serde_json::from_slice(&req.body) {
            Ok(request) => request,
            Err(e) => return HttpResponse::error(&ServiceError::invalid_params(e.to_string())),
        };
        let result = request.msg.to_uppercase();
        let mut response = HttpResponse::json(
            StatusCode::OK,
            &json!({ "msg": request.msg, "result": result, "via": "http" }),
        );
        inject_outbound_span(&ctx, &mut response.headers);
        response
    })
}

/// Install EchoService and everything it uses on `server`.
pub fn install(server: &DefaultServer) -> Result<(), ServerError> {
    server.register_middleware("request-log", RequestLog);
    server.add_initializers(vec![Arc::new(EchoInit)]);
    register_echo_service(EchoFactory, server)?;
    register_upper_decoder(server, decoder(upper_decoder));
    register_upper_proxy_handler(server, upper_proxy_http());
    register_middleware(server, SERVICE_NAME, "Upper", &["request-log"]);
    register_middleware(server, SERVICE_NAME, "UpperProxy", &["request-log"]);
    Ok(())
}
