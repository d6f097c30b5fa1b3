//! Protocol layer tests: JSON-RPC envelopes, error mapping and metadata carriers.

#[cfg(test)]
mod tests {
    use http::{HeaderMap, StatusCode};
    use meridian_protocol::*;
    use serde_json::json;

    // ─────────────────────────────────────────────────────────────────────
    // RpcRequest
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn request_deserialized_from_wire_format() {
        let wire = r#"{"jsonrpc":"2.0","id":1,"method":"EchoService/Upper","params":{"msg":"hi"}}"#;
        let req: RpcRequest = serde_json::from_str(wire).unwrap();
        assert!(req.is_valid());
        assert_eq!(req.target(), Some(("EchoService", "Upper")));
        assert_eq!(req.params.as_ref().unwrap()["msg"], "hi");
        assert!(req.metadata.is_empty());
    }

    #[test]
    fn request_with_metadata() {
        let wire = r#"{"jsonrpc":"2.0","id":"a","method":"S/M","metadata":{"Traceparent":"x","multi":["1","2"]}}"#;
        let req: RpcRequest = serde_json::from_str(wire).unwrap();
        assert_eq!(req.metadata.get("traceparent"), Some("x"));
        assert_eq!(req.metadata.get_all("multi"), &["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn request_without_metadata_omits_field() {
        let req = RpcRequest::new(RequestId::Number(3), "S/M", None);
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("metadata").is_none());
        assert!(value.get("params").is_none());
    }

    #[test]
    fn request_invalid_version() {
        let mut req = RpcRequest::new(RequestId::Number(1), "S/M", None);
        req.jsonrpc = "1.0".into();
        assert!(!req.is_valid());
    }

    #[test]
    fn split_target_variants() {
        assert_eq!(split_target("Svc/Method"), Some(("Svc", "Method")));
        assert_eq!(split_target("/Svc/Method"), Some(("Svc", "Method")));
        assert_eq!(split_target("Svc"), None);
        assert_eq!(split_target("Svc/"), None);
        assert_eq!(split_target("a/b/c"), None);
    }

    // ─────────────────────────────────────────────────────────────────────
    // RpcResponse
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn success_response_serialization() {
        let resp = RpcResponse::success(RequestId::Number(1), json!({"result": "HELLO"}));
        assert!(resp.is_success());
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["jsonrpc"], "2.0");
        assert_eq!(parsed["id"], 1);
        assert_eq!(parsed["result"]["result"], "HELLO");
        assert!(parsed.get("error").is_none());
    }

    #[test]
    fn error_response_null_id() {
        let resp = RpcResponse::error(None, ServiceError::parse_error("bad json"));
        let parsed = serde_json::to_value(&resp).unwrap();
        assert!(parsed["id"].is_null());
        assert_eq!(parsed["error"]["code"], -32700);
    }

    #[test]
    fn from_result_maps_both_halves() {
        let ok = RpcResponse::from_result(Some(RequestId::Number(2)), Ok(json!(1)));
        assert!(ok.is_success());
        let err = RpcResponse::from_result(None, Err(ServiceError::shutting_down()));
        assert!(err.is_error());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Error codes
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn error_code_values() {
        assert_eq!(ErrorCode::ParseError.code(), -32700);
        assert_eq!(ErrorCode::MethodNotFound.code(), -32601);
        assert_eq!(ErrorCode::ServerShuttingDown.code(), -32002);
        assert_eq!(ErrorCode::HandlerPanicked.code(), -32003);
        assert_eq!(ErrorCode::Rejected.code(), -32004);
        assert_eq!(ErrorCode::Custom(-42).code(), -42);
        assert_eq!(ErrorCode::from_code(-32003), ErrorCode::HandlerPanicked);
        assert_eq!(ErrorCode::from_code(-99999), ErrorCode::Custom(-99999));
    }

    #[test]
    fn error_http_status_mapping() {
        assert_eq!(ServiceError::route_not_found("GET", "/x").http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ServiceError::invalid_params("x").http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(ServiceError::rejected("no").http_status(), StatusCode::FORBIDDEN);
        assert_eq!(ServiceError::shutting_down().http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ServiceError::panicked("boom").http_status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn panicked_error_carries_description() {
        let e = ServiceError::panicked("index out of bounds");
        assert_eq!(e.error_code(), ErrorCode::HandlerPanicked);
        assert!(e.message.contains("index out of bounds"));
        assert_eq!(e.data, Some(json!("index out of bounds")));
    }

    #[test]
    fn error_serialization_skips_empty_data() {
        let json = serde_json::to_value(ServiceError::server_error("oops")).unwrap();
        assert_eq!(json["code"], -32000);
        assert!(json.get("data").is_none());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Metadata
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn metadata_keys_are_case_insensitive() {
        let mut md = MetadataMap::new();
        md.insert("X-Request-Id", "abc");
        assert_eq!(md.get("x-request-id"), Some("abc"));
        assert_eq!(md.get("X-REQUEST-ID"), Some("abc"));
        md.append("x-request-id", "def");
        assert_eq!(md.get_all("x-request-id").len(), 2);
        md.insert("x-request-id", "ghi");
        assert_eq!(md.get_all("x-request-id"), &["ghi".to_string()]);
    }

    #[test]
    fn binary_entries_are_base64_encoded() {
        let mut md = MetadataMap::new();
        md.insert_bin("trace", &[0u8, 1, 2, 255]);
        // suffix appended and value stored as text
        let raw = md.get("trace-bin").unwrap();
        assert_eq!(raw, "AAEC/w==");
        assert_eq!(md.get_bin("trace-bin").unwrap(), Some(vec![0u8, 1, 2, 255]));
        assert_eq!(md.get_bin("missing").unwrap(), None);
    }

    #[test]
    fn binary_entries_accept_unpadded_base64() {
        let mut md = MetadataMap::new();
        md.insert("grpc-trace-bin", "AAEC/w");
        assert_eq!(md.get_bin("grpc-trace-bin").unwrap(), Some(vec![0u8, 1, 2, 255]));
    }

    #[test]
    fn invalid_binary_entry_is_an_error() {
        let mut md = MetadataMap::new();
        md.insert("grpc-trace-bin", "!!!");
        assert!(md.get_bin("grpc-trace-bin").is_err());
    }

    #[test]
    fn metadata_header_conversion() {
        let mut headers = HeaderMap::new();
        headers.insert("Traceparent", "00-abc".parse().unwrap());
        headers.append("accept", "a".parse().unwrap());
        headers.append("accept", "b".parse().unwrap());
        let md = MetadataMap::from_headers(&headers);
        assert_eq!(md.get("traceparent"), Some("00-abc"));
        assert_eq!(md.get_all("accept").len(), 2);

        let back = md.to_headers();
        assert_eq!(back.get_all("accept").iter().count(), 2);
    }

    #[test]
    fn header_map_is_a_carrier() {
        let mut headers = HeaderMap::new();
        Carrier::set(&mut headers, "X-Trace", "1".into());
        headers.set_binary("ctx", b"hi");
        assert_eq!(Carrier::get(&headers, "x-trace"), Some("1"));
        assert_eq!(headers.get_binary("ctx-bin").unwrap(), Some(b"hi".to_vec()));
        assert!(Carrier::keys(&headers).contains(&"ctx-bin".to_string()));
    }
}
