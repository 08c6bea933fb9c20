use std::collections::BTreeMap;
use std::sync::Arc;

use balboa_protocol::MockResponsePayload;
use reqwest::Method;

use crate::errors::FetchError;
use crate::request::MockRequest;

/// Terminal (or fallback) result of one route handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Try the next matching entry.
    Fallback,
    /// Terminate matching; forward the real request unmodified.
    Passthrough,
    /// Terminate matching; simulate a network failure.
    Error,
    /// Terminate matching; answer with this response.
    Fulfill(FulfillResponse),
}

/// Response supplied by a fulfillment, either inline or file-backed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub path: Option<String>,
}

impl FulfillResponse {
    pub fn into_payload(self) -> MockResponsePayload {
        MockResponsePayload {
            status: self.status,
            headers: self.headers,
            body: self.body,
            path: self.path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseOptions {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub path: Option<String>,
}

impl Default for ResponseOptions {
    fn default() -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: None,
            path: None,
        }
    }
}

impl ResponseOptions {
    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Mutations applied to the original request when replaying it with
/// `Route::continue_with` or `Route::fetch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub method: Option<String>,
    pub url: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub body: Option<String>,
}

/// Handle given to a route handler: the intercepted request plus the
/// decision constructors.
#[derive(Clone)]
pub struct Route {
    request: MockRequest,
    fetcher: Arc<ReplayFetcher>,
}

impl Route {
    pub(crate) fn new(request: MockRequest, fetcher: Arc<ReplayFetcher>) -> Self {
        Self { request, fetcher }
    }

    pub fn request(&self) -> &MockRequest {
        &self.request
    }

    pub fn fulfill(&self, options: ResponseOptions) -> RouteDecision {
        RouteDecision::Fulfill(FulfillResponse {
            status: options.status,
            headers: options.headers,
            body: options.body,
            path: options.path,
        })
    }

    pub fn error(&self) -> RouteDecision {
        RouteDecision::Error
    }

    pub fn passthrough(&self) -> RouteDecision {
        RouteDecision::Passthrough
    }

    pub fn fallback(&self) -> RouteDecision {
        RouteDecision::Fallback
    }

    /// Replays the real request, optionally mutated, and returns its
    /// response for inspection or further mutation before fulfilling.
    pub async fn fetch(&self, options: FetchOptions) -> Result<FulfillResponse, FetchError> {
        self.fetcher.fetch(&self.request, options).await
    }

    /// Replays the real request and fulfills with whatever comes back.
    pub async fn continue_with(&self, options: FetchOptions) -> Result<RouteDecision, FetchError> {
        let response = self.fetch(options).await?;
        Ok(RouteDecision::Fulfill(response))
    }
}

/// Replay fetch shared by `Route::fetch` and `Route::continue_with`: a
/// bounded retry loop over network-level failures only. Any HTTP status is
/// success.
pub struct ReplayFetcher {
    http: reqwest::Client,
    max_attempts: usize,
}

impl Default for ReplayFetcher {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
            max_attempts: 20,
        }
    }
}

impl ReplayFetcher {
    pub fn new(http: reqwest::Client, max_attempts: usize) -> Self {
        Self {
            http,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn fetch(
        &self,
        request: &MockRequest,
        options: FetchOptions,
    ) -> Result<FulfillResponse, FetchError> {
        let method_text = options.method.as_deref().unwrap_or(&request.method);
        let method = Method::from_bytes(method_text.as_bytes())
            .map_err(|_| FetchError::InvalidMethod(method_text.to_string()))?;
        let url = options.url.as_deref().unwrap_or(&request.url).to_string();
        let headers = options.headers.as_ref().unwrap_or(&request.headers);
        let body = options.body.or_else(|| request.body.clone());

        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            let mut builder = self.http.request(method.clone(), &url);
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = &body {
                builder = builder.body(body.clone());
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let mut response_headers = BTreeMap::new();
                    for (name, value) in response.headers() {
                        if let Ok(value) = value.to_str() {
                            response_headers.insert(name.as_str().to_string(), value.to_string());
                        }
                    }
                    match response.text().await {
                        Ok(text) => {
                            return Ok(FulfillResponse {
                                status,
                                headers: response_headers,
                                body: Some(text),
                                path: None,
                            });
                        }
                        Err(error) => {
                            tracing::debug!(attempt, %error, "replay body read failed");
                            last_error = Some(error);
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(attempt, %error, "replay request failed");
                    last_error = Some(error);
                }
            }
        }

        Err(FetchError::Exhausted {
            attempts: self.max_attempts,
            source: last_error.expect("bounded retry loop records an error before exhausting"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fulfill_carries_the_response_options() {
        let route = Route::new(
            MockRequest::get("http://api.test/users"),
            Arc::new(ReplayFetcher::default()),
        );
        let decision = route.fulfill(
            ResponseOptions::default()
                .status(201)
                .header("content-type", "application/json")
                .body("{\"id\":1}"),
        );
        let RouteDecision::Fulfill(response) = decision else {
            panic!("expected fulfill");
        };
        assert_eq!(response.status, 201);
        assert_eq!(
            response.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(response.body.as_deref(), Some("{\"id\":1}"));
        assert_eq!(response.path, None);
    }

    #[test]
    fn replay_fetcher_requires_at_least_one_attempt() {
        let fetcher = ReplayFetcher::new(reqwest::Client::new(), 0);
        assert_eq!(fetcher.max_attempts, 1);
    }
}
