//! Transport to the backend services that do the actual step work.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ProcessingError;

/// Backend service a processor delegates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Adapter,
    Transformation,
    Condition,
    Loop,
    Delay,
}

impl ServiceKind {
    /// Endpoint path relative to the service base URL.
    pub fn path(&self) -> &'static str {
        match self {
            Self::Adapter => "/api/adapters/execute",
            Self::Transformation => "/api/transformations/execute",
            Self::Condition => "/api/conditions/evaluate",
            Self::Loop => "/api/loops/execute",
            Self::Delay => "/api/delay",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adapter => write!(f, "adapter"),
            Self::Transformation => write!(f, "transformation"),
            Self::Condition => write!(f, "condition"),
            Self::Loop => write!(f, "loop"),
            Self::Delay => write!(f, "delay"),
        }
    }
}

/// Sends a request to a backend service and returns its JSON answer.
///
/// Implementations must stop waiting as soon as `cancel` fires.
#[async_trait]
pub trait ServiceTransport: Send + Sync {
    async fn call(
        &self,
        service: ServiceKind,
        request: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ProcessingError>;
}

/// HTTP transport for the backend services.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpTransport {
    /// Create a transport against `base_url` with the given request timeout.
    pub fn new(base_url: &str, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: None,
        }
    }

    /// Send a bearer token with every request.
    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    /// Full URL for a service endpoint.
    pub fn endpoint(&self, service: ServiceKind) -> String {
        format!("{}{}", self.base_url, service.path())
    }

    async fn send(
        &self,
        service: ServiceKind,
        request: &serde_json::Value,
    ) -> Result<serde_json::Value, ProcessingError> {
        let mut builder = self.client.post(self.endpoint(service)).json(request);
        if let Some(ref token) = self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ProcessingError::Service {
                status: status.as_u16(),
                message: error_message(&text, status),
            });
        }

        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }

        serde_json::from_str(&text)
            .map_err(|e| ProcessingError::InvalidResponse(format!("{} service: {}", service, e)))
    }
}

#[async_trait]
impl ServiceTransport for HttpTransport {
    async fn call(
        &self,
        service: ServiceKind,
        request: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ProcessingError> {
        tracing::trace!(service = %service, "Calling backend service");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(service = %service, "Backend call aborted");
                Err(ProcessingError::Cancelled)
            }
            result = self.send(service, &request) => result,
        }
    }
}

/// Extract a human-readable message from an error response body.
fn error_message(body: &str, status: StatusCode) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "error", "detail"] {
            if let Some(msg) = value.get(key).and_then(|v| v.as_str()) {
                return msg.to_string();
            }
        }
    }

    if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    /// Read one request up to the end of its body.
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Answer the first request with a raw response, then close.
    /// Returns the base URL and a handle yielding the raw request.
    async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            request
        });
        (format!("http://{}", addr), server)
    }

    async fn call_stub(response: String) -> (Result<serde_json::Value, ProcessingError>, String) {
        let (base_url, server) = serve_once(response).await;
        let transport = HttpTransport::new(&base_url, Duration::from_secs(5)).with_api_token("secret");
        let result = transport
            .call(
                ServiceKind::Transformation,
                serde_json::json!({"transformationType": "mapping"}),
                CancellationToken::new(),
            )
            .await;
        (result, server.await.unwrap())
    }

    #[test]
    fn test_transport_creation() {
        let transport = HttpTransport::new("http://localhost:8082/", Duration::from_secs(5));
        assert_eq!(transport.base_url, "http://localhost:8082");
        assert_eq!(
            transport.endpoint(ServiceKind::Condition),
            "http://localhost:8082/api/conditions/evaluate"
        );
        assert_eq!(
            transport.endpoint(ServiceKind::Delay),
            "http://localhost:8082/api/delay"
        );
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"message": "adapter offline"}"#, StatusCode::BAD_GATEWAY),
            "adapter offline"
        );
        assert_eq!(
            error_message(r#"{"error": "bad expression"}"#, StatusCode::BAD_REQUEST),
            "bad expression"
        );
        assert_eq!(error_message("upstream down", StatusCode::BAD_GATEWAY), "upstream down");
        assert_eq!(error_message("", StatusCode::NOT_FOUND), "Not Found");
    }

    #[tokio::test]
    async fn test_call_returns_json_body() {
        let (result, request) = call_stub(http_response("200 OK", r#"{"mapped": 3}"#)).await;

        assert_eq!(result.unwrap(), serde_json::json!({"mapped": 3}));
        assert!(request.starts_with("POST /api/transformations/execute HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
        assert!(request.ends_with(r#"{"transformationType":"mapping"}"#));
    }

    #[tokio::test]
    async fn test_call_empty_body_is_null() {
        let (result, _) = call_stub(http_response("200 OK", "")).await;
        assert_eq!(result.unwrap(), serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_call_maps_error_status() {
        let (result, _) = call_stub(http_response(
            "502 Bad Gateway",
            r#"{"message": "adapter offline"}"#,
        ))
        .await;

        assert_eq!(
            result.unwrap_err(),
            ProcessingError::Service {
                status: 502,
                message: "adapter offline".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_call_rejects_invalid_json() {
        let (result, _) = call_stub(http_response("200 OK", "<html>oops</html>")).await;

        let err = result.unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidResponse(_)));
        assert_eq!(err.code(), "INVALID_RESPONSE");
    }

    #[tokio::test]
    async fn test_call_fails_on_truncated_body() {
        let truncated = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n{\"ok".to_string();
        let (result, _) = call_stub(truncated).await;

        let err = result.unwrap_err();
        assert!(matches!(err, ProcessingError::Http(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_call_honours_cancellation() {
        // Unroutable address: the request would hang until the client timeout.
        let transport = HttpTransport::new("http://10.255.255.1:9", Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = transport
            .call(ServiceKind::Adapter, serde_json::json!({}), cancel)
            .await;
        assert_eq!(result.unwrap_err(), ProcessingError::Cancelled);
    }
}
