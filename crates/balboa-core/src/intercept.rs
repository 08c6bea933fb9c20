use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use balboa_protocol::{ErrorPayload, Message, MessageBody, MockResponsePayload, RequestPayload};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use uuid::Uuid;

use crate::config::InterceptConfig;
use crate::context::{current_client_identity, ClientIdentity};
use crate::errors::{ControlPlaneError, InterceptError, MockableClientError, PendingError};
use crate::registry::{ConnectionHandle, ConnectionRegistry};

/// An outbound HTTP(S) call made by the server under test, captured before
/// it reaches the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptOutcome {
    /// Let the real network call proceed unmodified.
    Passthrough,
    /// The test process supplied this response.
    Fulfilled(MockResponse),
}

/// Resolves outbound calls against the owning test client: ambient identity
/// lookup, `REQUEST`/`RESPONSE` round trip with timeout, and conversion of
/// the reply into a response, a passthrough, or a simulated network error.
pub struct InterceptionEngine {
    registry: Arc<ConnectionRegistry>,
    config: InterceptConfig,
}

impl InterceptionEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        config: InterceptConfig,
    ) -> Result<Self, ControlPlaneError> {
        config.validate()?;
        Ok(Self { registry, config })
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn resolve(
        &self,
        request: &OutboundRequest,
    ) -> Result<InterceptOutcome, InterceptError> {
        let ClientIdentity::Id(client_id) = current_client_identity() else {
            return Ok(InterceptOutcome::Passthrough);
        };
        let Some(handle) = self.registry.get(&client_id) else {
            return Ok(InterceptOutcome::Passthrough);
        };

        let request_id = Uuid::new_v4().to_string();
        let message = Message::new(MessageBody::Request(RequestPayload {
            request_id: request_id.clone(),
            client_id: client_id.clone(),
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        }));

        let reply = handle.replies().register(&request_id);
        if handle.send(message).await.is_err() {
            // Stale registry entry; the connection's close path evicts it.
            tracing::warn!(%client_id, "control connection gone; passing request through");
            return Ok(InterceptOutcome::Passthrough);
        }

        let timeout = Duration::from_millis(self.config.response_timeout_ms);
        let response = match reply.wait(timeout).await {
            Ok(message) => message,
            Err(PendingError::TimedOut) => {
                handle.send_best_effort(Message::new(MessageBody::Error(ErrorPayload {
                    request_id: Some(request_id.clone()),
                    reason: "timed out waiting for mock response".to_string(),
                })));
                return Err(InterceptError::ResponseTimeout { request_id });
            }
            Err(PendingError::ConnectionClosed) => {
                return Err(InterceptError::ConnectionClosed { request_id });
            }
        };

        let payload = match response.body {
            MessageBody::Response(payload) => payload,
            MessageBody::Error(_) => {
                return Err(InterceptError::MockedNetworkError { request_id });
            }
            other => {
                tracing::warn!(kind = ?other, "unexpected reply kind for intercepted request");
                return Err(InterceptError::MockedNetworkError { request_id });
            }
        };

        if payload.is_error() {
            return Err(InterceptError::MockedNetworkError { request_id });
        }
        let Some(mock) = payload.response else {
            return Ok(InterceptOutcome::Passthrough);
        };

        let response = synthesize_response(&handle, &request_id, mock).await?;
        Ok(InterceptOutcome::Fulfilled(response))
    }
}

async fn synthesize_response(
    handle: &ConnectionHandle,
    request_id: &str,
    mock: MockResponsePayload,
) -> Result<MockResponse, InterceptError> {
    let status =
        StatusCode::from_u16(mock.status).map_err(|_| InterceptError::InvalidStatus(mock.status))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &mock.headers {
        let Ok(name) = name.parse::<HeaderName>() else {
            tracing::warn!(name = %name, "skipping invalid mock response header name");
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            tracing::warn!(name = %name, "skipping invalid mock response header value");
            continue;
        };
        headers.append(name, value);
    }

    let body = match (mock.body, mock.path) {
        (Some(body), _) => Bytes::from(body),
        (None, Some(path)) => match tokio::fs::read(&path).await {
            Ok(bytes) => {
                if !headers.contains_key(CONTENT_TYPE) {
                    let mime = mime_guess::from_path(&path).first_or_octet_stream();
                    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
                        headers.insert(CONTENT_TYPE, value);
                    }
                }
                Bytes::from(bytes)
            }
            Err(source) => {
                // Fatal for this single request: fail locally and tell the
                // test process why.
                handle.send_best_effort(Message::new(MessageBody::Error(ErrorPayload {
                    request_id: Some(request_id.to_string()),
                    reason: format!("failed to read response body file {path}"),
                })));
                return Err(InterceptError::FileRead {
                    path: PathBuf::from(path),
                    source,
                });
            }
        },
        (None, None) => Bytes::new(),
    };

    Ok(MockResponse {
        status,
        headers,
        body,
    })
}

/// HTTP client for the server under test: consults the interception engine
/// and only reaches the real network on passthrough. Framework adapters
/// route their outbound calls through this.
pub struct MockableClient {
    engine: Arc<InterceptionEngine>,
    http: reqwest::Client,
}

impl MockableClient {
    pub fn new(engine: Arc<InterceptionEngine>) -> Self {
        Self {
            engine,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_http_client(engine: Arc<InterceptionEngine>, http: reqwest::Client) -> Self {
        Self { engine, http }
    }

    pub async fn execute(
        &self,
        request: OutboundRequest,
    ) -> Result<MockResponse, MockableClientError> {
        match self.engine.resolve(&request).await? {
            InterceptOutcome::Fulfilled(response) => Ok(response),
            InterceptOutcome::Passthrough => self.fetch_real(request).await,
        }
    }

    async fn fetch_real(
        &self,
        request: OutboundRequest,
    ) -> Result<MockResponse, MockableClientError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| MockableClientError::InvalidRequest(request.method.clone()))?;
        let mut builder = self.http.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(MockResponse {
            status,
            headers,
            body,
        })
    }
}
