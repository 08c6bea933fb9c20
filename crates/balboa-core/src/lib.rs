mod config;
mod context;
mod errors;
mod intercept;
mod pending;
mod registry;
mod server;

pub use config::{ControlPlaneConfig, InterceptConfig};
pub use context::{
    current_client_identity, identity_from_headers, with_client_identity, with_request_identity,
    ClientIdentity,
};
pub use errors::{ControlPlaneError, InterceptError, MockableClientError, PendingError};
pub use intercept::{
    InterceptOutcome, InterceptionEngine, MockResponse, MockableClient, OutboundRequest,
};
pub use pending::{PendingReply, PendingTable};
pub use registry::{
    ConnectionClosed, ConnectionHandle, ConnectionRegistry, Subscription, SubscriptionFilter,
};
pub use server::ControlPlaneServer;
