use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use balboa_core::{ConnectionRegistry, ControlPlaneError};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;

use crate::config::ProxyConfig;
use crate::sse;
use crate::ws;

/// The secondary server: file proxy, SSE proxy, and WebSocket proxy. Shares
/// the connection registry with the control-plane server.
pub struct ProxyServer {
    config: ProxyConfig,
    registry: Arc<ConnectionRegistry>,
}

#[derive(Clone)]
pub(crate) struct ProxyState {
    pub(crate) config: ProxyConfig,
    pub(crate) registry: Arc<ConnectionRegistry>,
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self, ControlPlaneError> {
        config.validate()?;
        Ok(Self { config, registry })
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        TcpListener::bind(self.config.bind).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> io::Result<()> {
        let state = ProxyState {
            config: self.config,
            registry: self.registry,
        };
        let router = Router::new()
            .route("/file", get(file_proxy))
            .route("/sse", get(sse::sse_proxy))
            .route("/ws", get(ws::ws_proxy))
            .with_state(state);
        axum::serve(listener, router).await
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await
    }
}

#[derive(Debug, Deserialize)]
struct FileProxyParams {
    path: String,
}

/// Streams a file's bytes so the test process can serve large response
/// bodies from disk instead of copying them into protocol messages.
async fn file_proxy(Query(params): Query<FileProxyParams>) -> Response {
    let file = match tokio::fs::File::open(&params.path).await {
        Ok(file) => file,
        Err(error) => {
            tracing::debug!(path = %params.path, %error, "file proxy open failed");
            return (StatusCode::NOT_FOUND, "file not found or unreadable").into_response();
        }
    };

    let mime = mime_guess::from_path(&params.path).first_or_octet_stream();
    let stream = ReaderStream::new(file);
    (
        [(header::CONTENT_TYPE, mime.as_ref())],
        Body::from_stream(stream),
    )
        .into_response()
}
