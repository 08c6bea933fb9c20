use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("timed out waiting for request")]
    WaitForRequestTimeout,
    #[error("invalid glob pattern {pattern}: {source}")]
    InvalidGlob {
        pattern: String,
        source: regex::Error,
    },
    /// A route handler failed; the failure terminates that request's mock
    /// resolution and is not caught by the matching engine.
    #[error("route handler failed: {0}")]
    Handler(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum GraphqlError {
    #[error("failed to parse GraphQL query: {0}")]
    Syntax(String),
    #[error("GraphQL document contains no operation definitions")]
    NoOperations,
    #[error("GraphQL document contains multiple operations and no operationName was given")]
    MultipleOperations,
    #[error("GraphQL document's only operation is unnamed and no operationName was given")]
    UnnamedOperation,
    #[error("operation {0} is not defined in the GraphQL document")]
    UnknownOperation(String),
    #[error("operation {name} has type {kind} which the transport does not support")]
    UnsupportedOperationType { name: String, kind: String },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid request method: {0}")]
    InvalidMethod(String),
    #[error("request failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: usize,
        source: reqwest::Error,
    },
}
