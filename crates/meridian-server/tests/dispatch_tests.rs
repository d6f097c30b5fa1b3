//! End-to-end dispatch tests: a running `DefaultServer` on OS-assigned
//! ports, called over REST with reqwest and over native RPC with
//! tokio-tungstenite.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::{SinkExt, StreamExt};
    use http::StatusCode;
    use meridian_protocol::{HandlerResult, ServiceError};
    use meridian_server::*;
    use meridian_trace::{SegmentRecorder, TraceId, Tracer};
    use meridian_transport::{HttpResponse, HttpVerb};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use serde_json::{Value, json};
    use tokio_tungstenite::tungstenite::Message;

    type Ws = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    #[derive(Deserialize)]
    struct UpperRequest {
        msg: String,
    }

    #[derive(Serialize)]
    struct UpperResponse {
        result: String,
    }

    struct Echo {
        calls: Arc<AtomicUsize>,
    }

    #[derive(Clone)]
    struct Tag(String);

    fn echo_descriptor() -> ServiceDescriptor<Echo> {
        ServiceDescriptor::new("Echo")
            .method(
                "Upper",
                |svc: Arc<Echo>, _ctx: RequestContext, req: UpperRequest| async move {
                    svc.calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ServiceError>(UpperResponse {
                        result: req.msg.to_uppercase(),
                    })
                },
            )
            .method(
                "Panic",
                |_svc: Arc<Echo>, _ctx: RequestContext, req: Value| async move {
                    if req.get("boom").is_some() {
                        panic!("kaboom");
                    }
                    Ok::<_, ServiceError>(req)
                },
            )
            .method(
                "Whoami",
                |svc: Arc<Echo>, ctx: RequestContext, _req: Value| async move {
                    svc.calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ServiceError>(json!({
                        "method": ctx.full_method(),
                        "request_id": ctx.request_id(),
                        "tag": ctx.extensions().get::<Tag>().map(|t| t.0.clone()),
                    }))
                },
            )
    }

    fn config() -> ServerConfig {
        ServerConfig {
            http_port: Some(0),
            rpc_port: Some(0),
            ..ServerConfig::default()
        }
    }

    /// Register Echo; the returned counter tracks handler invocations.
    fn register_echo(server: &DefaultServer) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let shared = calls.clone();
        server
            .register_service(ServiceRegistration::new(
                echo_descriptor(),
                move |_: &dyn Server| Echo {
                    calls: shared.clone(),
                },
            ))
            .unwrap();
        calls
    }

    fn upper_routes(server: &dyn Server, seen: Arc<Mutex<Vec<String>>>) {
        assert!(register_encoders(
            server,
            "Echo",
            "Upper",
            &[HttpVerb::Get, HttpVerb::Post, HttpVerb::Options],
            "/api/1.0/upper/{msg}",
            None,
        ));
        assert!(register_decoder(
            server,
            "Echo",
            "Upper",
            decoder(move |_ctx, req| {
                let msg = req.param("msg").unwrap_or_default().to_string();
                seen.lock().push(msg.clone());
                Ok(json!({ "msg": msg }))
            }),
        ));
    }

    async fn rpc_connect(server: &DefaultServer) -> Ws {
        let port = server.rpc_port().unwrap();
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/rpc"))
            .await
            .unwrap();
        ws
    }

    async fn rpc_call(ws: &mut Ws, payload: Value) -> Value {
        ws.send(Message::Text(payload.to_string().into())).await.unwrap();
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    fn call(id: u64, method: &str, params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
    }

    fn url(server: &DefaultServer, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", server.http_port().unwrap())
    }

    // ─────────────────────────────────────────────────────────────────────
    // One method, two transports
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn upper_is_served_over_http_and_rpc() {
        let server = DefaultServer::new(config());
        register_echo(&server);
        let seen = Arc::new(Mutex::new(Vec::new()));
        upper_routes(&server, seen.clone());
        server.start().await.unwrap();

        let resp = reqwest::get(url(&server, "/api/1.0/upper/hello")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({ "result": "HELLO" }));
        assert_eq!(*seen.lock(), vec!["hello".to_string()]);

        let resp = reqwest::Client::new()
            .post(url(&server, "/api/1.0/upper/post%20body"))
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["result"], "POST BODY");

        let mut ws = rpc_connect(&server).await;
        let resp = rpc_call(&mut ws, call(1, "Echo/Upper", json!({ "msg": "rpc" }))).await;
        assert_eq!(resp["result"]["result"], "RPC");
        // The decoder is an HTTP concern only.
        assert_eq!(seen.lock().len(), 2);

        server.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn unmatched_verbs_and_paths_are_not_found() {
        let server = DefaultServer::new(config());
        register_echo(&server);
        upper_routes(&server, Arc::default());
        server.start().await.unwrap();
        let client = reqwest::Client::new();

        let resp = client
            .delete(url(&server, "/api/1.0/upper/x"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], -32601);

        let resp = client.get(url(&server, "/api/1.0/lower/x")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // Methods without an HTTP binding are not reachable over REST.
        let resp = client.get(url(&server, "/Echo/Whoami")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        server.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn options_preflight_is_answered_without_a_handler() {
        let server = DefaultServer::new(config());
        register_echo(&server);
        upper_routes(&server, Arc::default());
        server.start().await.unwrap();

        let resp = reqwest::Client::new()
            .request(reqwest::Method::OPTIONS, url(&server, "/api/1.0/upper/x"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers()["allow"], "GET, POST, OPTIONS");
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");

        server.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn rpc_errors_map_to_json_rpc_codes() {
        let server = DefaultServer::new(config());
        register_echo(&server);
        server.start().await.unwrap();
        let mut ws = rpc_connect(&server).await;

        let resp = rpc_call(&mut ws, call(1, "Echo/Missing", json!({}))).await;
        assert_eq!(resp["error"]["code"], -32601);

        let resp = rpc_call(&mut ws, call(2, "NoSlash", json!({}))).await;
        assert_eq!(resp["error"]["code"], -32601);

        let resp = rpc_call(&mut ws, call(3, "Echo/Upper", json!({ "nope": 1 }))).await;
        assert_eq!(resp["error"]["code"], -32602);

        server.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Panic recovery
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn handler_panics_become_errors_and_serving_continues() {
        let server = DefaultServer::new(config());
        register_echo(&server);
        upper_routes(&server, Arc::default());
        register_encoder(&server, "Echo", "Panic", HttpVerb::Post, "/panic", None);
        server.start().await.unwrap();

        let mut ws = rpc_connect(&server).await;
        let resp = rpc_call(&mut ws, call(1, "Echo/Panic", json!({ "boom": true }))).await;
        assert_eq!(resp["error"]["code"], -32003);
        assert_eq!(resp["error"]["data"], "kaboom");

        let resp = rpc_call(&mut ws, call(2, "Echo/Upper", json!({ "msg": "still" }))).await;
        assert_eq!(resp["result"]["result"], "STILL");

        let resp = reqwest::Client::new()
            .post(url(&server, "/panic"))
            .body(r#"{"boom": 1}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let resp = reqwest::get(url(&server, "/api/1.0/upper/ok")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        server.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }

    struct Explode;

    impl Middleware for Explode {
        async fn before(
            &self,
            _ctx: &mut RequestContext,
            _request: &mut Value,
        ) -> Result<(), ServiceError> {
            panic!("middleware blew up");
        }
    }

    #[tokio::test]
    async fn panics_outside_the_handler_are_recovered_too() {
        let server = DefaultServer::new(config());
        server.register_middleware("explode", Explode);
        let calls = register_echo(&server);
        assert!(register_middleware(&server, "Echo", "Whoami", &["explode"]));
        register_encoder(&server, "Echo", "Whoami", HttpVerb::Get, "/whoami", None);
        register_encoders(
            &server,
            "Echo",
            "Upper",
            &[HttpVerb::Get],
            "/api/1.0/upper/{msg}",
            None,
        );
        register_decoder(
            &server,
            "Echo",
            "Upper",
            decoder(|_, req| {
                if req.param("msg").is_some() {
                    panic!("decoder blew up");
                }
                decode_json(req)
            }),
        );
        register_encoder(
            &server,
            "Echo",
            "Panic",
            HttpVerb::Post,
            "/explode",
            Some(encoder(|_, result| {
                if result.is_ok() {
                    panic!("encoder blew up");
                }
                Ok(encode_json(result))
            })),
        );
        server.start().await.unwrap();

        let mut ws = rpc_connect(&server).await;
        let resp = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            rpc_call(&mut ws, call(1, "Echo/Whoami", json!({}))),
        )
        .await
        .expect("a reply despite the panicking middleware");
        assert_eq!(resp["error"]["code"], -32003);
        assert_eq!(resp["error"]["data"], "middleware blew up");

        let client = reqwest::Client::new();
        let resp = client.get(url(&server, "/whoami")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let resp = client.get(url(&server, "/api/1.0/upper/x")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["data"], "decoder blew up");

        let resp = client
            .post(url(&server, "/explode"))
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["data"], "encoder blew up");

        // The connection and the server keep serving.
        let resp = rpc_call(&mut ws, call(2, "Echo/Upper", json!({ "msg": "still" }))).await;
        assert_eq!(resp["result"]["result"], "STILL");

        server.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Middleware
    // ─────────────────────────────────────────────────────────────────────

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Recording {
        async fn before(
            &self,
            ctx: &mut RequestContext,
            _request: &mut Value,
        ) -> Result<(), ServiceError> {
            self.log.lock().push(format!("before:{}", self.name));
            ctx.extensions_mut().insert(Tag(self.name.to_string()));
            Ok(())
        }

        async fn after(&self, _ctx: &RequestContext, result: &HandlerResult) {
            self.log
                .lock()
                .push(format!("after:{}:{}", self.name, result.is_ok()));
        }
    }

    struct Deny;

    impl Middleware for Deny {
        async fn before(
            &self,
            _ctx: &mut RequestContext,
            _request: &mut Value,
        ) -> Result<(), ServiceError> {
            Err(ServiceError::rejected("denied"))
        }
    }

    #[tokio::test]
    async fn middleware_run_in_order_with_duplicates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let server = DefaultServer::new(ServerConfig {
            default_middlewares: vec!["global".into()],
            ..config()
        });
        for name in ["global", "a", "b"] {
            server.register_middleware(
                name,
                Recording {
                    name,
                    log: log.clone(),
                },
            );
        }
        register_echo(&server);
        assert!(register_middleware(&server, "Echo", "Whoami", &["a", "b"]));
        assert!(register_middleware(&server, "Echo", "Whoami", &["a"]));
        server.start().await.unwrap();

        let mut ws = rpc_connect(&server).await;
        let resp = rpc_call(&mut ws, call(1, "Echo/Whoami", json!({}))).await;
        assert_eq!(resp["result"]["tag"], "a");
        assert_eq!(
            *log.lock(),
            vec![
                "before:global",
                "before:a",
                "before:b",
                "before:a",
                "after:global:true",
                "after:a:true",
                "after:b:true",
                "after:a:true",
            ]
        );

        server.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn rejecting_middleware_skips_the_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let server = DefaultServer::new(config());
        server.register_middleware(
            "first",
            Recording {
                name: "first",
                log: log.clone(),
            },
        );
        server.register_middleware("deny", Deny);
        server.register_middleware(
            "never",
            Recording {
                name: "never",
                log: log.clone(),
            },
        );
        let calls = register_echo(&server);
        register_middleware(&server, "Echo", "Upper", &["first", "deny", "never"]);
        upper_routes(&server, Arc::default());
        server.start().await.unwrap();

        let mut ws = rpc_connect(&server).await;
        let resp = rpc_call(&mut ws, call(1, "Echo/Upper", json!({ "msg": "x" }))).await;
        assert_eq!(resp["error"]["code"], -32004);

        let resp = reqwest::get(url(&server, "/api/1.0/upper/x")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        assert_eq!(
            *log.lock(),
            vec![
                "before:first",
                "after:first:false",
                "before:first",
                "after:first:false",
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        server.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Translation hooks
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn last_registered_encoder_wins() {
        let server = DefaultServer::new(config());
        register_echo(&server);
        upper_routes(&server, Arc::default());
        for label in ["first", "second"] {
            register_encoders(
                &server,
                "Echo",
                "Upper",
                &[HttpVerb::Get],
                "/api/1.0/upper/{msg}",
                Some(encoder(move |_ctx, result| {
                    let value = result?;
                    Ok(HttpResponse::json(
                        StatusCode::CREATED,
                        &json!({ "by": label, "value": value }),
                    ))
                })),
            );
        }
        server.start().await.unwrap();

        let resp = reqwest::get(url(&server, "/api/1.0/upper/hi")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["by"], "second");
        assert_eq!(body["value"]["result"], "HI");

        // Re-binding the same pattern replaced the verb set.
        let resp = reqwest::Client::new()
            .post(url(&server, "/api/1.0/upper/hi"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        server.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn service_defaults_apply_when_method_has_none() {
        let server = DefaultServer::new(config());
        register_echo(&server);
        register_encoder(&server, "Echo", "Whoami", HttpVerb::Post, "/who/{name}", None);
        assert!(register_default_decoder(
            &server,
            "Echo",
            decoder(|_ctx, req| Ok(json!({ "name": req.param("name") })))
        ));
        assert!(register_default_encoder(
            &server,
            "Echo",
            encoder(|ctx, result| {
                let mut resp = encode_json(result);
                resp = resp.with_header(
                    http::HeaderName::from_static("x-method"),
                    &ctx.full_method(),
                );
                Ok(resp)
            })
        ));
        server.start().await.unwrap();

        let resp = reqwest::Client::new()
            .post(url(&server, "/who/ann"))
            .header("x-request-id", "req-7")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.headers()["x-method"], "Echo/Whoami");
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["method"], "Echo/Whoami");
        assert_eq!(body["request_id"], "req-7");

        server.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_json_body_is_a_parse_error() {
        let server = DefaultServer::new(config());
        register_echo(&server);
        register_encoder(&server, "Echo", "Whoami", HttpVerb::Post, "/who", None);
        server.start().await.unwrap();

        let resp = reqwest::Client::new()
            .post(url(&server, "/who"))
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], -32700);

        server.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn raw_handler_takes_over_the_default_route() {
        let server = DefaultServer::new(config());
        register_echo(&server);
        assert!(register_handler(
            &server,
            "Echo",
            "Raw",
            "",
            http_handler(|ctx: RequestContext, req: meridian_transport::HttpRequest| async move {
                HttpResponse::json(
                    StatusCode::ACCEPTED,
                    &json!({ "raw": ctx.full_method(), "verb": req.method.as_str() }),
                )
            }),
        ));
        server.start().await.unwrap();

        for method in [reqwest::Method::GET, reqwest::Method::PUT, reqwest::Method::OPTIONS] {
            let resp = reqwest::Client::new()
                .request(method.clone(), url(&server, "/Echo/Raw"))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::ACCEPTED);
            let body: Value = resp.json().await.unwrap();
            assert_eq!(body["raw"], "Echo/Raw");
            assert_eq!(body["verb"], method.as_str());
        }

        // A raw handler is not a native RPC method.
        let mut ws = rpc_connect(&server).await;
        let resp = rpc_call(&mut ws, call(1, "Echo/Raw", json!({}))).await;
        assert_eq!(resp["error"]["code"], -32601);

        server.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn routes_registered_after_start_are_served() {
        let server = DefaultServer::new(config());
        register_echo(&server);
        server.start().await.unwrap();
        assert_eq!(server.route_count(), 0);

        register_encoder(&server, "Echo", "Whoami", HttpVerb::Get, "/late", None);
        assert_eq!(server.route_count(), 1);
        let resp = reqwest::get(url(&server, "/late")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        server.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tracing
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn inbound_trace_continues_across_rpc_and_http() {
        let recorder = SegmentRecorder::new();
        let tracer = Arc::new(Tracer::builder().backend(recorder.clone()).build());
        let server = DefaultServer::with_tracer(config(), tracer);
        register_echo(&server);
        upper_routes(&server, Arc::default());
        assert!(register_method_option(&server, "Echo", "Whoami", IGNORE_TRACING));
        server.start().await.unwrap();

        let trace = "4bf92f3577b34da6a3ce929d0e0e4736";
        let parent = "00f067aa0ba902b7";
        let mut ws = rpc_connect(&server).await;
        let mut request = call(1, "Echo/Upper", json!({ "msg": "t" }));
        request["metadata"] = json!({ "traceparent": format!("00-{trace}-{parent}-01") });
        let resp = rpc_call(&mut ws, request).await;
        assert_eq!(resp["result"]["result"], "T");

        let span = recorder.find("Echo/Upper").unwrap();
        assert_eq!(span.kind, "server");
        assert_eq!(Some(span.context.trace_id), TraceId::from_hex(trace));
        assert_eq!(span.parent.unwrap().span_id.to_string(), parent);

        recorder.clear();
        let resp = reqwest::Client::new()
            .get(url(&server, "/api/1.0/upper/h"))
            .header("traceparent", format!("00-{trace}-{parent}-01"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let span = recorder.find("Echo/Upper").unwrap();
        assert_eq!(span.context.trace_id.to_string(), trace);

        // Failed calls are marked; ignored methods record nothing.
        rpc_call(&mut ws, call(2, "Echo/Upper", json!({}))).await;
        let failed = recorder.find("Echo/Upper").unwrap();
        assert!(failed.error.is_some());

        let before = recorder.ended_count();
        rpc_call(&mut ws, call(3, "Echo/Whoami", json!({}))).await;
        assert_eq!(recorder.ended_count(), before);

        server.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn calls_without_a_carrier_start_fresh_traces() {
        let recorder = SegmentRecorder::new();
        let tracer = Arc::new(Tracer::builder().backend(recorder.clone()).build());
        let server = DefaultServer::with_tracer(config(), tracer);
        register_echo(&server);
        server.start().await.unwrap();

        let mut ws = rpc_connect(&server).await;
        rpc_call(&mut ws, call(1, "Echo/Upper", json!({ "msg": "a" }))).await;
        rpc_call(&mut ws, call(2, "Echo/Upper", json!({ "msg": "b" }))).await;

        let spans = recorder.finished();
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().all(|s| s.parent.is_none()));
        assert_ne!(spans[0].context.trace_id, spans[1].context.trace_id);

        server.stop(std::time::Duration::from_secs(5)).await.unwrap();
    }
}
