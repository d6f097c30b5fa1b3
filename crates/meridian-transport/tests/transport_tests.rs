//! Listener tests against a stub handler bound to OS-assigned ports.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::{SinkExt, StreamExt};
    use http::StatusCode;
    use meridian_protocol::{HandlerResult, MetadataMap, ServiceError};
    use meridian_transport::*;
    use serde_json::{Value, json};
    use tokio_tungstenite::tungstenite::Message;

    struct Stub;

    impl RpcHandler for Stub {
        async fn handle_rpc(
            &self,
            method: &str,
            metadata: MetadataMap,
            params: Option<Value>,
        ) -> HandlerResult {
            match method {
                "Echo/Say" => Ok(json!({
                    "params": params,
                    "traceparent": metadata.get("traceparent"),
                })),
                "Echo/Slow" => {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    Ok(json!("slow"))
                }
                other => Err(ServiceError::method_not_found(other)),
            }
        }
    }

    impl HttpHandler for Stub {
        async fn handle_http(&self, request: HttpRequest) -> HttpResponse {
            HttpResponse::json(
                StatusCode::OK,
                &json!({
                    "verb": request.verb().map(|v| v.as_str()),
                    "path": request.path,
                    "q": request.query_param("q"),
                    "body": String::from_utf8_lossy(&request.body),
                }),
            )
        }
    }

    fn config() -> TransportConfig {
        TransportConfig {
            http_port: Some(0),
            rpc_port: Some(0),
            ..TransportConfig::default()
        }
    }

    async fn rpc_call(
        ws: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        payload: Value,
    ) -> Value {
        ws.send(Message::Text(payload.to_string().into())).await.unwrap();
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn http_requests_reach_handler() {
        let server = TransportServer::start(config(), Arc::new(Stub)).await.unwrap();
        let port = server.http_port().unwrap();

        let body: Value = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/a/b?q=1"))
            .body("hello")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["verb"], "POST");
        assert_eq!(body["path"], "/a/b");
        assert_eq!(body["q"], "1");
        assert_eq!(body["body"], "hello");

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let cfg = TransportConfig {
            max_body_bytes: 4,
            ..config()
        };
        let server = TransportServer::start(cfg, Arc::new(Stub)).await.unwrap();
        let port = server.http_port().unwrap();
        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/x"))
            .body("far too long")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::PAYLOAD_TOO_LARGE);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn rpc_calls_carry_metadata() {
        let server = TransportServer::start(config(), Arc::new(Stub)).await.unwrap();
        let port = server.rpc_port().unwrap();
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/rpc"))
            .await
            .unwrap();

        let resp = rpc_call(
            &mut ws,
            json!({
                "jsonrpc": "2.0", "id": 1, "method": "Echo/Say",
                "params": {"x": 1},
                "metadata": {"Traceparent": "abc"}
            }),
        )
        .await;
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["params"]["x"], 1);
        assert_eq!(resp["result"]["traceparent"], "abc");

        let resp = rpc_call(&mut ws, json!({"jsonrpc": "2.0", "id": 2, "method": "Nope/Nope"})).await;
        assert_eq!(resp["error"]["code"], -32601);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_rpc_messages_get_error_replies() {
        let server = TransportServer::start(config(), Arc::new(Stub)).await.unwrap();
        let port = server.rpc_port().unwrap();
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/rpc"))
            .await
            .unwrap();

        ws.send(Message::Text("not json".into())).await.unwrap();
        let resp: Value = match ws.next().await.unwrap().unwrap() {
            Message::Text(t) => serde_json::from_str(t.as_str()).unwrap(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(resp["error"]["code"], -32700);

        let resp = rpc_call(&mut ws, json!({"jsonrpc": "1.0", "id": 7, "method": "Echo/Say"})).await;
        assert_eq!(resp["error"]["code"], -32600);
        assert_eq!(resp["id"], 7);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn slow_call_does_not_block_connection() {
        let server = TransportServer::start(config(), Arc::new(Stub)).await.unwrap();
        let port = server.rpc_port().unwrap();
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/rpc"))
            .await
            .unwrap();

        let slow = json!({"jsonrpc": "2.0", "id": "slow", "method": "Echo/Slow"});
        ws.send(Message::Text(slow.to_string().into())).await.unwrap();
        let fast = rpc_call(&mut ws, json!({"jsonrpc": "2.0", "id": "fast", "method": "Echo/Say"})).await;
        assert_eq!(fast["id"], "fast");

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_sends_close_to_open_connections() {
        let server = TransportServer::start(config(), Arc::new(Stub)).await.unwrap();
        let port = server.rpc_port().unwrap();
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/rpc"))
            .await
            .unwrap();
        let resp = rpc_call(&mut ws, json!({"jsonrpc": "2.0", "id": 1, "method": "Echo/Say"})).await;
        assert_eq!(resp["id"], 1);

        server.shutdown();
        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "connection stayed open after shutdown");
        server.join().await.unwrap();
    }

    #[tokio::test]
    async fn disabled_listener_has_no_port() {
        let cfg = TransportConfig {
            http_port: None,
            ..config()
        };
        let server = TransportServer::start(cfg, Arc::new(Stub)).await.unwrap();
        assert!(server.http_port().is_none());
        let port = server.rpc_port().unwrap();

        let health: Value = reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = TransportServer::start(config(), Arc::new(Stub)).await.unwrap();
        let cfg = TransportConfig {
            http_port: first.http_port(),
            rpc_port: None,
            ..config()
        };
        let err = TransportServer::start(cfg, Arc::new(Stub)).await.err().unwrap();
        assert!(matches!(err, TransportError::Bind { .. }));
        first.stop().await.unwrap();
    }
}
