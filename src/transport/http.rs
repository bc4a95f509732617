//! Plain request/response HTTP transport.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::header,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::{headers::ContentType, TypedHeader};
use serde::Serialize;

use crate::config::TransportConfig;
use crate::errors::{AppError, TransportError};
use crate::logging::request_logging_middleware;
use crate::mcp::JsonRpcProcessor;
use crate::transport::cors::{cors_middleware, preflight, CorsPolicy};
use crate::transport::{is_json_content_type, Lifecycle, Transport};

pub const TRANSPORT_NAME: &str = "http";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub transport: &'static str,
    pub methods: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_connections: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl HealthResponse {
    pub fn new(transport: &'static str, processor: &JsonRpcProcessor) -> Self {
        Self {
            status: "ok",
            transport,
            methods: processor.method_names(),
            active_connections: None,
            max_connections: None,
        }
    }

    pub fn with_connections(mut self, active: usize, max: usize) -> Self {
        self.active_connections = Some(active);
        self.max_connections = Some(max);
        self
    }
}

#[derive(Debug, Serialize)]
pub struct MethodsResponse {
    pub methods: Vec<String>,
}

pub struct HttpTransport {
    config: TransportConfig,
    processor: Arc<JsonRpcProcessor>,
    lifecycle: Lifecycle,
}

impl HttpTransport {
    pub fn new(config: TransportConfig, processor: Arc<JsonRpcProcessor>) -> Self {
        let lifecycle = Lifecycle::new(TRANSPORT_NAME, config.bind);
        Self {
            config,
            processor,
            lifecycle,
        }
    }

    pub fn router(&self) -> Router {
        let cors = CorsPolicy::new(&self.config.allowed_origins);

        Router::new()
            .route("/", post(mcp_endpoint).options(preflight))
            .route("/mcp", post(mcp_endpoint).options(preflight))
            .route("/health", get(health))
            .route("/methods", get(methods))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(middleware::from_fn(request_logging_middleware))
            .layer(middleware::from_fn_with_state(cors, cors_middleware))
            .with_state(Arc::clone(&self.processor))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.lifecycle.start(self.router(), || None).await
    }

    async fn stop(&self) {
        self.lifecycle.stop(|| async { 0 }).await
    }

    async fn is_running(&self) -> bool {
        self.lifecycle.is_running().await
    }

    async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr().await
    }
}

async fn mcp_endpoint(
    State(processor): State<Arc<JsonRpcProcessor>>,
    content_type: Option<TypedHeader<ContentType>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let is_json = content_type
        .map(|TypedHeader(content_type)| is_json_content_type(&content_type.to_string()))
        .unwrap_or(false);
    if !is_json {
        return Err(AppError::bad_request(
            "invalid_content_type",
            "Content-Type must be application/json",
        ));
    }
    if body.is_empty() {
        return Err(AppError::bad_request(
            "empty_body",
            "request body must not be empty",
        ));
    }

    let mut reply = processor.process_message(&body).await;
    if reply.is_empty() {
        reply = "{}".to_string();
    }

    Ok(([(header::CONTENT_TYPE, "application/json")], reply).into_response())
}

async fn health(State(processor): State<Arc<JsonRpcProcessor>>) -> Json<HealthResponse> {
    Json(HealthResponse::new(TRANSPORT_NAME, &processor))
}

async fn methods(State(processor): State<Arc<JsonRpcProcessor>>) -> Json<MethodsResponse> {
    Json(MethodsResponse {
        methods: processor.method_names(),
    })
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::tools::{echo::EchoTool, ToolRegistry};

    use super::*;

    async fn transport(config: TransportConfig) -> HttpTransport {
        let registry = Arc::new(ToolRegistry::default());
        registry.register_tool(Arc::new(EchoTool), Some("utility")).await;
        HttpTransport::new(config, crate::build_processor(registry))
    }

    async fn app() -> Router {
        transport(TransportConfig::new(([127, 0, 0, 1], 0).into()))
            .await
            .router()
    }

    fn json_post(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .expect("request should build")
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body should collect")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("body should be json")
    }

    #[tokio::test]
    async fn echo_tool_call_returns_message() {
        let response = app()
            .await
            .oneshot(json_post(
                "/mcp",
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": "tools/call",
                    "params": {"name": "echo", "arguments": {"message": "hi"}}
                })
                .to_string(),
            ))
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"]["success"], true);
        assert_eq!(body["result"]["content"]["message"], "hi");
    }

    #[tokio::test]
    async fn unknown_method_returns_method_not_found() {
        let response = app()
            .await
            .oneshot(json_post(
                "/",
                r#"{"jsonrpc":"2.0","id":7,"method":"foo"}"#,
            ))
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], 7);
        assert_eq!(body["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn notification_returns_empty_object() {
        let response = app()
            .await
            .oneshot(json_post(
                "/mcp",
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            ))
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({}));
    }

    #[tokio::test]
    async fn rejects_wrong_content_type_and_empty_body() {
        let wrong_type = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .expect("request should build");
        let response = app()
            .await
            .oneshot(wrong_type)
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app()
            .await
            .oneshot(json_post("/mcp", Body::empty()))
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "empty_body");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let mut config = TransportConfig::new(([127, 0, 0, 1], 0).into());
        config.max_body_bytes = 16;
        let response = transport(config)
            .await
            .router()
            .oneshot(json_post(
                "/mcp",
                r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":{}}"#,
            ))
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn health_and_methods_list_registered_methods() {
        let response = app()
            .await
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["transport"], "http");
        assert!(body["methods"]
            .as_array()
            .expect("methods should be an array")
            .contains(&json!("tools/call")));

        let response = app()
            .await
            .oneshot(
                Request::builder()
                    .uri("/methods")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");
        let body = body_json(response).await;
        assert!(body["methods"]
            .as_array()
            .expect("methods should be an array")
            .contains(&json!("initialize")));
    }

    #[tokio::test]
    async fn preflight_carries_cors_headers() {
        let response = app()
            .await
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/mcp")
                    .header(header::ORIGIN, "https://client.example.com")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let transport = transport(TransportConfig::new(([127, 0, 0, 1], 0).into())).await;

        transport.stop().await;
        assert!(!transport.is_running().await);

        transport.start().await.expect("transport should start");
        transport.start().await.expect("second start is a no-op");
        assert!(transport.is_running().await);
        assert!(transport.local_addr().await.is_some());

        transport.stop().await;
        transport.stop().await;
        assert!(!transport.is_running().await);
        assert!(transport.local_addr().await.is_none());
    }
}
