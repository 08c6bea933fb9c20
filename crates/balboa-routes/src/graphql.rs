use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use graphql_parser::query as gql;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::{BoxError, GraphqlError};
use crate::matcher::RouteMatcher;
use crate::request::MockRequest;
use crate::route::{FulfillResponse, Route, RouteDecision};
use crate::table::{RouteHandler, RouteOptions, RouteTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Query,
    Mutation,
    Subscription,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Query => f.write_str("query"),
            OperationType::Mutation => f.write_str("mutation"),
            OperationType::Subscription => f.write_str("subscription"),
        }
    }
}

/// Which operation kinds the carrying transport can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphqlTransport {
    Http,
    Streaming,
}

impl GraphqlTransport {
    fn supports(self, kind: OperationType) -> bool {
        match self {
            GraphqlTransport::Http => kind != OperationType::Subscription,
            GraphqlTransport::Streaming => true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GraphqlEnvelope {
    #[serde(rename = "operationName")]
    operation_name: Option<String>,
    query: String,
    #[serde(default)]
    variables: Option<Value>,
}

type GraphqlHandler =
    Arc<dyn Fn(GraphqlRoute) -> BoxFuture<'static, Result<RouteDecision, BoxError>> + Send + Sync>;

struct GraphqlEntry {
    id: u64,
    operation_name: String,
    operation_type: OperationType,
    handler: GraphqlHandler,
    times: Option<u64>,
    calls: AtomicU64,
}

impl GraphqlEntry {
    fn exhausted(&self) -> bool {
        self.times
            .is_some_and(|times| self.calls.load(Ordering::SeqCst) >= times)
    }
}

struct GraphqlState {
    transport: GraphqlTransport,
    entries: Mutex<Vec<Arc<GraphqlEntry>>>,
    next_id: AtomicU64,
}

/// GraphQL specialization over the route table: one outer URL-matched entry
/// whose handler parses the envelope, resolves the operation, and dispatches
/// by exact (name, type) through its own ordered handler table.
#[derive(Clone)]
pub struct GraphqlMock {
    state: Arc<GraphqlState>,
}

impl GraphqlMock {
    pub fn attach(table: &RouteTable, matcher: RouteMatcher, options: RouteOptions) -> Self {
        Self::attach_with_transport(table, matcher, options, GraphqlTransport::Http)
    }

    pub fn attach_with_transport(
        table: &RouteTable,
        matcher: RouteMatcher,
        options: RouteOptions,
        transport: GraphqlTransport,
    ) -> Self {
        let state = Arc::new(GraphqlState {
            transport,
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });

        let dispatch_state = Arc::clone(&state);
        let handler: RouteHandler = Arc::new(move |route: Route| {
            let state = Arc::clone(&dispatch_state);
            Box::pin(async move { dispatch(state, route).await })
        });
        table.route_boxed(matcher, handler, options);

        Self { state }
    }

    pub fn operation<H, Fut>(
        &self,
        name: impl Into<String>,
        operation_type: OperationType,
        handler: H,
        times: Option<u64>,
    ) -> u64
    where
        H: Fn(GraphqlRoute) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RouteDecision, BoxError>> + Send + 'static,
    {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(GraphqlEntry {
            id,
            operation_name: name.into(),
            operation_type,
            handler: Arc::new(move |route| Box::pin(handler(route))),
            times,
            calls: AtomicU64::new(0),
        });
        self.state.entries.lock().push(entry);
        id
    }

    pub fn query<H, Fut>(&self, name: impl Into<String>, handler: H) -> u64
    where
        H: Fn(GraphqlRoute) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RouteDecision, BoxError>> + Send + 'static,
    {
        self.operation(name, OperationType::Query, handler, None)
    }

    pub fn mutation<H, Fut>(&self, name: impl Into<String>, handler: H) -> u64
    where
        H: Fn(GraphqlRoute) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RouteDecision, BoxError>> + Send + 'static,
    {
        self.operation(name, OperationType::Mutation, handler, None)
    }

    pub fn remove_operation(&self, id: u64) -> bool {
        let mut entries = self.state.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }
}

async fn dispatch(state: Arc<GraphqlState>, route: Route) -> Result<RouteDecision, BoxError> {
    // A request that does not carry a GraphQL envelope is not ours; let the
    // next handler in the outer chain run.
    let Some(envelope) = extract_envelope(route.request()) else {
        return Ok(route.fallback());
    };

    let (name, kind) = resolve_operation(&envelope)?;
    if !state.transport.supports(kind) {
        return Err(GraphqlError::UnsupportedOperationType {
            name,
            kind: kind.to_string(),
        }
        .into());
    }

    let snapshot: Vec<Arc<GraphqlEntry>> = state.entries.lock().clone();
    for entry in snapshot {
        if entry.exhausted() || entry.operation_name != name || entry.operation_type != kind {
            continue;
        }

        let graphql_route = GraphqlRoute {
            operation_name: name.clone(),
            operation_type: kind,
            query: envelope.query.clone(),
            variables: envelope.variables.clone().unwrap_or(Value::Null),
            request: route.request().clone(),
        };
        let decision = (entry.handler)(graphql_route).await?;
        if matches!(decision, RouteDecision::Fallback) {
            continue;
        }

        let calls = entry.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if entry.times == Some(calls) {
            state.entries.lock().retain(|candidate| candidate.id != entry.id);
        }
        return Ok(decision);
    }

    Ok(route.fallback())
}

fn extract_envelope(request: &MockRequest) -> Option<GraphqlEnvelope> {
    if request.method.eq_ignore_ascii_case("GET") {
        let url = reqwest::Url::parse(&request.url).ok()?;
        let mut operation_name = None;
        let mut query = None;
        let mut variables = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "query" => query = Some(value.into_owned()),
                "operationName" => operation_name = Some(value.into_owned()),
                "variables" => variables = serde_json::from_str(&value).ok(),
                _ => {}
            }
        }
        return Some(GraphqlEnvelope {
            operation_name,
            query: query?,
            variables,
        });
    }

    if request.method.eq_ignore_ascii_case("POST") {
        return serde_json::from_str(request.body_text()).ok();
    }

    None
}

/// Resolves the operation name and type. With no explicit `operationName`
/// the document must contain exactly one named operation; anything else is
/// raised rather than guessed.
fn resolve_operation(envelope: &GraphqlEnvelope) -> Result<(String, OperationType), GraphqlError> {
    let document = gql::parse_query::<String>(&envelope.query)
        .map_err(|error| GraphqlError::Syntax(error.to_string()))?;

    let operations: Vec<&gql::OperationDefinition<'_, String>> = document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            gql::Definition::Operation(operation) => Some(operation),
            gql::Definition::Fragment(_) => None,
        })
        .collect();

    let name = match &envelope.operation_name {
        Some(name) => name.clone(),
        None => match operations.as_slice() {
            [] => return Err(GraphqlError::NoOperations),
            [only] => operation_name(only).ok_or(GraphqlError::UnnamedOperation)?,
            _ => return Err(GraphqlError::MultipleOperations),
        },
    };

    // Re-locate the named definition; an explicit operationName that does
    // not appear in the document is an error, not a guess.
    let operation = operations
        .iter()
        .find(|operation| operation_name(operation).as_deref() == Some(name.as_str()))
        .ok_or_else(|| GraphqlError::UnknownOperation(name.clone()))?;

    Ok((name, operation_kind(operation)))
}

fn operation_name(operation: &gql::OperationDefinition<'_, String>) -> Option<String> {
    match operation {
        gql::OperationDefinition::Query(query) => query.name.clone(),
        gql::OperationDefinition::Mutation(mutation) => mutation.name.clone(),
        gql::OperationDefinition::Subscription(subscription) => subscription.name.clone(),
        gql::OperationDefinition::SelectionSet(_) => None,
    }
}

fn operation_kind(operation: &gql::OperationDefinition<'_, String>) -> OperationType {
    match operation {
        gql::OperationDefinition::Query(_) | gql::OperationDefinition::SelectionSet(_) => {
            OperationType::Query
        }
        gql::OperationDefinition::Mutation(_) => OperationType::Mutation,
        gql::OperationDefinition::Subscription(_) => OperationType::Subscription,
    }
}

/// Handle given to a matched GraphQL handler.
#[derive(Debug, Clone)]
pub struct GraphqlRoute {
    operation_name: String,
    operation_type: OperationType,
    query: String,
    variables: Value,
    request: MockRequest,
}

impl GraphqlRoute {
    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn variables(&self) -> &Value {
        &self.variables
    }

    pub fn request(&self) -> &MockRequest {
        &self.request
    }

    pub fn fallback(&self) -> RouteDecision {
        RouteDecision::Fallback
    }

    pub fn error(&self) -> RouteDecision {
        RouteDecision::Error
    }

    /// Serializes the standard `{data, errors}` envelope, or streams a file
    /// body when `path` is set.
    pub fn fulfill(&self, response: GraphqlResponse) -> RouteDecision {
        let mut headers = response.headers;
        headers
            .entry("content-type".to_string())
            .or_insert_with(|| "application/json".to_string());

        let body = if response.path.is_some() {
            None
        } else {
            let mut envelope = serde_json::Map::new();
            envelope.insert("data".to_string(), response.data.unwrap_or(Value::Null));
            if let Some(errors) = response.errors {
                envelope.insert("errors".to_string(), errors);
            }
            Some(Value::Object(envelope).to_string())
        };

        RouteDecision::Fulfill(FulfillResponse {
            status: response.status,
            headers,
            body,
            path: response.path,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphqlResponse {
    pub data: Option<Value>,
    pub errors: Option<Value>,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub path: Option<String>,
}

impl Default for GraphqlResponse {
    fn default() -> Self {
        Self {
            data: None,
            errors: None,
            status: 200,
            headers: BTreeMap::new(),
            path: None,
        }
    }
}

impl GraphqlResponse {
    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn errors(mut self, errors: Value) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::request::RequestOrigin;
    use crate::route::ResponseOptions;

    fn post_request(body: Value) -> MockRequest {
        MockRequest {
            method: "POST".to_string(),
            url: "http://app.test/graphql".to_string(),
            headers: BTreeMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: Some(body.to_string()),
        }
    }

    fn envelope(query: &str) -> GraphqlEnvelope {
        GraphqlEnvelope {
            operation_name: None,
            query: query.to_string(),
            variables: None,
        }
    }

    #[test]
    fn single_named_operation_resolves_without_operation_name() {
        let (name, kind) =
            resolve_operation(&envelope("query GetUser{user{id}}")).expect("must resolve");
        assert_eq!(name, "GetUser");
        assert_eq!(kind, OperationType::Query);
    }

    #[test]
    fn two_named_operations_without_operation_name_raise() {
        let error = resolve_operation(&envelope(
            "query GetUser{user{id}} query GetPosts{posts{id}}",
        ))
        .expect_err("ambiguous document must raise");
        assert!(matches!(error, GraphqlError::MultipleOperations));
    }

    #[test]
    fn unnamed_single_operation_raises() {
        let error = resolve_operation(&envelope("{user{id}}")).expect_err("anonymous must raise");
        assert!(matches!(error, GraphqlError::UnnamedOperation));
    }

    #[test]
    fn fragment_only_document_raises_no_operations() {
        let error = resolve_operation(&envelope("fragment UserParts on User{id}"))
            .expect_err("fragment-only must raise");
        assert!(matches!(error, GraphqlError::NoOperations));
    }

    #[test]
    fn explicit_operation_name_selects_among_multiple() {
        let (name, kind) = resolve_operation(&GraphqlEnvelope {
            operation_name: Some("CreateUser".to_string()),
            query: "query GetUser{user{id}} mutation CreateUser{createUser{id}}".to_string(),
            variables: None,
        })
        .expect("must resolve");
        assert_eq!(name, "CreateUser");
        assert_eq!(kind, OperationType::Mutation);
    }

    #[test]
    fn explicit_operation_name_missing_from_document_raises() {
        let error = resolve_operation(&GraphqlEnvelope {
            operation_name: Some("Nope".to_string()),
            query: "query GetUser{user{id}}".to_string(),
            variables: None,
        })
        .expect_err("unknown name must raise");
        assert!(matches!(error, GraphqlError::UnknownOperation(name) if name == "Nope"));
    }

    #[test]
    fn get_requests_carry_the_envelope_in_query_parameters() {
        let request = MockRequest::get(
            "http://app.test/graphql?query=query%20GetUser%7Buser%7Bid%7D%7D&variables=%7B%22id%22%3A7%7D",
        );
        let envelope = extract_envelope(&request).expect("envelope from query params");
        assert_eq!(envelope.query, "query GetUser{user{id}}");
        assert_eq!(envelope.variables, Some(json!({"id": 7})));
    }

    #[tokio::test]
    async fn dispatches_on_exact_name_and_type() {
        let table = RouteTable::default();
        let mock = GraphqlMock::attach(
            &table,
            RouteMatcher::glob("**/graphql").expect("glob"),
            RouteOptions::default(),
        );
        mock.query("GetUser", |route: GraphqlRoute| {
            let decision = route.fulfill(
                GraphqlResponse::default().data(json!({"user": {"id": "user-1"}})),
            );
            async move { Ok(decision) }
        });

        let decision = table
            .resolve(
                &post_request(json!({"query": "query GetUser{user{id}}"})),
                RequestOrigin::Server,
            )
            .await
            .expect("resolve");
        let RouteDecision::Fulfill(response) = decision else {
            panic!("expected fulfill, got {decision:?}");
        };
        assert_eq!(response.status, 200);
        assert_eq!(
            response.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        let body: Value =
            serde_json::from_str(response.body.as_deref().expect("body")).expect("json body");
        assert_eq!(body, json!({"data": {"user": {"id": "user-1"}}}));
    }

    #[tokio::test]
    async fn mutation_handlers_do_not_see_queries() {
        let table = RouteTable::default();
        let mock = GraphqlMock::attach(
            &table,
            RouteMatcher::glob("**/graphql").expect("glob"),
            RouteOptions::default(),
        );
        mock.mutation("GetUser", |route: GraphqlRoute| {
            let decision = route.fulfill(GraphqlResponse::default());
            async move { Ok(decision) }
        });

        let decision = table
            .resolve(
                &post_request(json!({"query": "query GetUser{user{id}}"})),
                RequestOrigin::Server,
            )
            .await
            .expect("resolve");
        assert_eq!(decision, RouteDecision::Passthrough);
    }

    #[tokio::test]
    async fn non_envelope_bodies_fall_back_to_the_outer_chain() {
        let table = RouteTable::default();
        GraphqlMock::attach(
            &table,
            RouteMatcher::glob("**/graphql").expect("glob"),
            RouteOptions::default(),
        );
        table.route(
            RouteMatcher::glob("**/graphql").expect("glob"),
            |route: Route| {
                let decision = route.fulfill(ResponseOptions::default().body("outer"));
                async move { Ok(decision) }
            },
            RouteOptions::default(),
        );

        let decision = table
            .resolve(
                &post_request(json!({"not": "graphql"})),
                RequestOrigin::Server,
            )
            .await
            .expect("resolve");
        let RouteDecision::Fulfill(response) = decision else {
            panic!("expected outer fulfill, got {decision:?}");
        };
        assert_eq!(response.body.as_deref(), Some("outer"));
    }

    #[tokio::test]
    async fn ambiguous_documents_raise_through_the_handler_path() {
        let table = RouteTable::default();
        GraphqlMock::attach(
            &table,
            RouteMatcher::glob("**/graphql").expect("glob"),
            RouteOptions::default(),
        );

        let error = table
            .resolve(
                &post_request(json!({
                    "query": "query GetUser{user{id}} query GetPosts{posts{id}}"
                })),
                RequestOrigin::Server,
            )
            .await
            .expect_err("ambiguous document must raise");
        assert!(matches!(error, crate::errors::RouteError::Handler(_)));
    }

    #[tokio::test]
    async fn subscription_over_http_raises() {
        let table = RouteTable::default();
        let mock = GraphqlMock::attach(
            &table,
            RouteMatcher::glob("**/graphql").expect("glob"),
            RouteOptions::default(),
        );
        mock.operation(
            "OnUserCreated",
            OperationType::Subscription,
            |route: GraphqlRoute| {
                let decision = route.fulfill(GraphqlResponse::default());
                async move { Ok(decision) }
            },
            None,
        );

        let error = table
            .resolve(
                &post_request(json!({
                    "query": "subscription OnUserCreated{userCreated{id}}"
                })),
                RequestOrigin::Server,
            )
            .await
            .expect_err("subscription over HTTP must raise");
        assert!(matches!(error, crate::errors::RouteError::Handler(_)));
    }

    #[tokio::test]
    async fn streaming_transports_dispatch_subscriptions() {
        let table = RouteTable::default();
        let mock = GraphqlMock::attach_with_transport(
            &table,
            RouteMatcher::glob("**/graphql").expect("glob"),
            RouteOptions::default(),
            GraphqlTransport::Streaming,
        );
        mock.operation(
            "OnUserCreated",
            OperationType::Subscription,
            |route: GraphqlRoute| {
                let decision = route.fulfill(
                    GraphqlResponse::default().data(json!({"userCreated": {"id": "user-2"}})),
                );
                async move { Ok(decision) }
            },
            None,
        );

        let decision = table
            .resolve(
                &post_request(json!({
                    "query": "subscription OnUserCreated{userCreated{id}}"
                })),
                RequestOrigin::Server,
            )
            .await
            .expect("resolve");
        assert!(matches!(decision, RouteDecision::Fulfill(_)));
    }

    #[tokio::test]
    async fn operation_times_are_consumed_per_handler() {
        let table = RouteTable::default();
        let mock = GraphqlMock::attach(
            &table,
            RouteMatcher::glob("**/graphql").expect("glob"),
            RouteOptions::default(),
        );
        mock.operation(
            "GetUser",
            OperationType::Query,
            |route: GraphqlRoute| {
                let decision =
                    route.fulfill(GraphqlResponse::default().data(json!({"user": null})));
                async move { Ok(decision) }
            },
            Some(1),
        );

        let request = post_request(json!({"query": "query GetUser{user{id}}"}));
        let first = table
            .resolve(&request, RequestOrigin::Server)
            .await
            .expect("first resolve");
        assert!(matches!(first, RouteDecision::Fulfill(_)));

        let second = table
            .resolve(&request, RequestOrigin::Server)
            .await
            .expect("second resolve");
        assert_eq!(second, RouteDecision::Passthrough);
    }
}
