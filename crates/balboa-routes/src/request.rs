use std::collections::BTreeMap;

use balboa_protocol::RequestPayload;

/// Which interception path a request came from. Server requests originate in
/// the interception engine of the server under test; client requests come
/// from the analogous browser-side path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    Server,
    Client,
}

/// The matching engine's request representation: a cloned, re-readable copy
/// of the intercepted call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl MockRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn from_payload(payload: &RequestPayload) -> Self {
        Self {
            method: payload.method.clone(),
            url: payload.url.clone(),
            headers: payload.headers.clone(),
            body: payload.body.clone(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> &str {
        self.body.as_deref().unwrap_or("")
    }

    pub fn body_json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(self.body_text()).ok()
    }
}
