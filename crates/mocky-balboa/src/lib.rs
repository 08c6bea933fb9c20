mod client;
mod config;
mod errors;
mod runtime;
mod sender;
mod sse;
mod websocket;

pub use client::MockClient;
pub use config::ClientConfig;
pub use errors::ClientError;
pub use runtime::{MockRuntime, MockRuntimeBuilder};
pub use sse::SseHandle;
pub use websocket::{WebSocketHandle, WsMockMessage};

pub use balboa_core::{
    current_client_identity, identity_from_headers, with_client_identity, with_request_identity,
    ClientIdentity, ConnectionRegistry, ControlPlaneConfig, ControlPlaneError, ControlPlaneServer,
    InterceptConfig, InterceptError, InterceptOutcome, InterceptionEngine, MockResponse,
    MockableClient, MockableClientError, OutboundRequest,
};
pub use balboa_protocol::{CLIENT_ID_HEADER, DEFAULT_CONTROL_PORT, DEFAULT_PROXY_PORT};
pub use balboa_proxy::{ProxyConfig, ProxyServer};
pub use balboa_routes::{
    BoxError, FetchError, FetchOptions, FulfillResponse, GraphqlError, GraphqlMock,
    GraphqlResponse, GraphqlRoute, GraphqlTransport, MockRequest, OperationType, ReplayFetcher,
    RequestOrigin, ResponseOptions, Route, RouteDecision, RouteError, RouteId, RouteMatcher,
    RouteOptions, RouteScope, RouteTable, WaitOptions,
};
