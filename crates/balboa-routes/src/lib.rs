mod errors;
mod graphql;
mod matcher;
mod request;
mod route;
mod table;

pub use errors::{BoxError, FetchError, GraphqlError, RouteError};
pub use graphql::{
    GraphqlMock, GraphqlResponse, GraphqlRoute, GraphqlTransport, OperationType,
};
pub use matcher::RouteMatcher;
pub use request::{MockRequest, RequestOrigin};
pub use route::{
    FetchOptions, FulfillResponse, ReplayFetcher, ResponseOptions, Route, RouteDecision,
};
pub use table::{RouteId, RouteOptions, RouteScope, RouteTable, WaitOptions};
