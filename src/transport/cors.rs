//! Permissive CORS headers driven by an origin allow-list.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

const ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Accept, Authorization, Mcp-Session-Id";

#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allowed_origins: Arc<[String]>,
    expose_headers: Option<&'static str>,
}

impl CorsPolicy {
    pub fn new(allowed_origins: &[String]) -> Self {
        Self {
            allowed_origins: Arc::from(allowed_origins.to_vec()),
            expose_headers: None,
        }
    }

    pub fn exposing(mut self, headers: &'static str) -> Self {
        self.expose_headers = Some(headers);
        self
    }

    /// Value for `Access-Control-Allow-Origin`, if any.
    ///
    /// Entries ending in `*` match any origin sharing the prefix before the `*`.
    pub fn allow_origin(&self, origin: Option<&str>) -> Option<String> {
        if self.allowed_origins.iter().any(|allowed| allowed == "*") {
            return Some("*".to_string());
        }

        let origin = origin?;
        self.allowed_origins
            .iter()
            .any(|allowed| match allowed.strip_suffix('*') {
                Some(prefix) => origin.starts_with(prefix),
                None => allowed == origin,
            })
            .then(|| origin.to_string())
    }

    fn apply(&self, origin: Option<&str>, headers: &mut HeaderMap) {
        if let Some(value) = self
            .allow_origin(origin)
            .and_then(|value| HeaderValue::from_str(&value).ok())
        {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
            headers.append(header::VARY, HeaderValue::from_static("Origin"));
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        );
        if let Some(expose) = self.expose_headers {
            headers.insert(
                header::ACCESS_CONTROL_EXPOSE_HEADERS,
                HeaderValue::from_static(expose),
            );
        }
    }
}

pub async fn cors_middleware(
    State(policy): State<CorsPolicy>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let mut response = next.run(request).await;
    policy.apply(origin.as_deref(), response.headers_mut());
    response
}

/// Answers CORS preflight requests; the headers themselves come from the middleware.
pub async fn preflight() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(origins: &[&str]) -> CorsPolicy {
        CorsPolicy::new(
            &origins
                .iter()
                .map(|origin| origin.to_string())
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn wildcard_allows_everything() {
        assert_eq!(
            policy(&["*"]).allow_origin(Some("https://evil.test")),
            Some("*".to_string())
        );
        assert_eq!(policy(&["*"]).allow_origin(None), Some("*".to_string()));
    }

    #[test]
    fn exact_and_prefix_entries_echo_the_origin() {
        let policy = policy(&["https://app.example.com", "http://localhost*"]);

        assert_eq!(
            policy.allow_origin(Some("https://app.example.com")),
            Some("https://app.example.com".to_string())
        );
        assert_eq!(
            policy.allow_origin(Some("http://localhost:5173")),
            Some("http://localhost:5173".to_string())
        );
        assert_eq!(policy.allow_origin(Some("https://other.example.com")), None);
        assert_eq!(policy.allow_origin(None), None);
    }

    #[test]
    fn apply_sets_method_and_header_lists() {
        let mut headers = HeaderMap::new();
        policy(&["*"])
            .exposing("Mcp-Session-Id")
            .apply(None, &mut headers);

        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], ALLOW_METHODS);
        assert_eq!(headers[header::ACCESS_CONTROL_EXPOSE_HEADERS], "Mcp-Session-Id");
    }
}
