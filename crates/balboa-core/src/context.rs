use std::future::Future;

use balboa_protocol::CLIENT_ID_HEADER;

/// Identity of the test-process client owning the current request, or the
/// `Unset` sentinel when the reserved header was absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIdentity {
    Unset,
    Id(String),
}

impl ClientIdentity {
    pub fn as_id(&self) -> Option<&str> {
        match self {
            ClientIdentity::Unset => None,
            ClientIdentity::Id(id) => Some(id.as_str()),
        }
    }
}

tokio::task_local! {
    static CLIENT_IDENTITY: ClientIdentity;
}

/// Enters the ambient identity scope for the remainder of `future`'s
/// execution, including across await points. One value per logical request;
/// nesting is a contract violation and keeps the outer value's scope rules.
pub async fn with_client_identity<F>(identity: ClientIdentity, future: F) -> F::Output
where
    F: Future,
{
    if CLIENT_IDENTITY.try_with(|_| ()).is_ok() {
        tracing::warn!("nested ambient client identity scope; requests must enter exactly one");
    }
    CLIENT_IDENTITY.scope(identity, future).await
}

/// Reads the ambient identity anywhere below the middleware, without it
/// being threaded through intermediate call sites. Outside any scope the
/// sentinel is returned, which the interception engine treats as
/// passthrough.
pub fn current_client_identity() -> ClientIdentity {
    CLIENT_IDENTITY
        .try_with(Clone::clone)
        .unwrap_or(ClientIdentity::Unset)
}

pub fn identity_from_headers(headers: &http::HeaderMap) -> ClientIdentity {
    match headers.get(CLIENT_ID_HEADER).and_then(|v| v.to_str().ok()) {
        Some(value) if !value.is_empty() => ClientIdentity::Id(value.to_string()),
        _ => ClientIdentity::Unset,
    }
}

/// The middleware contract consumed by framework adapters: read the reserved
/// header from the inbound request and run the continuation inside the
/// ambient scope.
pub async fn with_request_identity<F>(headers: &http::HeaderMap, continuation: F) -> F::Output
where
    F: Future,
{
    with_client_identity(identity_from_headers(headers), continuation).await
}

#[cfg(test)]
mod tests {
    use http::HeaderMap;

    use super::*;

    #[tokio::test]
    async fn identity_is_visible_across_await_points() {
        let identity = ClientIdentity::Id("client-1".to_string());
        with_client_identity(identity.clone(), async {
            assert_eq!(current_client_identity(), identity);
            tokio::task::yield_now().await;
            assert_eq!(current_client_identity(), identity);
        })
        .await;
    }

    #[tokio::test]
    async fn outside_any_scope_the_sentinel_is_returned() {
        assert_eq!(current_client_identity(), ClientIdentity::Unset);
    }

    #[tokio::test]
    async fn header_middleware_enters_the_scope() {
        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_ID_HEADER, "client-7".parse().expect("header value"));
        with_request_identity(&headers, async {
            assert_eq!(
                current_client_identity(),
                ClientIdentity::Id("client-7".to_string())
            );
        })
        .await;
    }

    #[tokio::test]
    async fn missing_or_empty_header_maps_to_the_sentinel() {
        assert_eq!(identity_from_headers(&HeaderMap::new()), ClientIdentity::Unset);

        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_ID_HEADER, "".parse().expect("header value"));
        assert_eq!(identity_from_headers(&headers), ClientIdentity::Unset);
    }

    #[tokio::test]
    async fn sibling_tasks_do_not_observe_the_scope() {
        with_client_identity(ClientIdentity::Id("client-9".to_string()), async {
            let outside = tokio::spawn(async { current_client_identity() })
                .await
                .expect("join");
            assert_eq!(outside, ClientIdentity::Unset);
        })
        .await;
    }
}
