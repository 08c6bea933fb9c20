use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;

use crate::errors::RouteError;
use crate::request::MockRequest;

type PredicateFn = Arc<dyn Fn(MockRequest) -> BoxFuture<'static, bool> + Send + Sync>;

/// URL matcher for a registered route: string glob, regular expression, or
/// an asynchronous predicate over the whole request.
#[derive(Clone)]
pub enum RouteMatcher {
    Glob { pattern: String, compiled: Arc<Regex> },
    Regex(Arc<Regex>),
    Predicate(PredicateFn),
}

impl RouteMatcher {
    /// Compiles a glob pattern: `**` crosses path separators, `*` matches
    /// within a segment, `?` matches a single character.
    pub fn glob(pattern: &str) -> Result<Self, RouteError> {
        let compiled = compile_glob(pattern).map_err(|source| RouteError::InvalidGlob {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self::Glob {
            pattern: pattern.to_string(),
            compiled: Arc::new(compiled),
        })
    }

    pub fn regex(pattern: Regex) -> Self {
        Self::Regex(Arc::new(pattern))
    }

    pub fn predicate<F, Fut>(predicate: F) -> Self
    where
        F: Fn(MockRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self::Predicate(Arc::new(move |request| Box::pin(predicate(request))))
    }

    /// Predicates are awaited, never raced; the table relies on this to keep
    /// registration-order matching deterministic.
    pub async fn matches(&self, request: &MockRequest) -> bool {
        match self {
            Self::Glob { compiled, .. } => compiled.is_match(&request.url),
            Self::Regex(pattern) => pattern.is_match(&request.url),
            Self::Predicate(predicate) => predicate(request.clone()).await,
        }
    }
}

impl fmt::Debug for RouteMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Glob { pattern, .. } => f.debug_tuple("Glob").field(pattern).finish(),
            Self::Regex(pattern) => f.debug_tuple("Regex").field(&pattern.as_str()).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

fn compile_glob(pattern: &str) -> Result<Regex, regex::Error> {
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    translated.push_str(".*");
                } else {
                    translated.push_str("[^/]*");
                }
            }
            '?' => translated.push_str("[^/]"),
            other => {
                if regex_special(other) {
                    translated.push('\\');
                }
                translated.push(other);
            }
        }
    }

    translated.push('$');
    Regex::new(&translated)
}

fn regex_special(ch: char) -> bool {
    matches!(
        ch,
        '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn glob_matches(pattern: &str, url: &str) -> bool {
        RouteMatcher::glob(pattern)
            .expect("glob must compile")
            .matches(&MockRequest::get(url))
            .await
    }

    #[tokio::test]
    async fn double_star_crosses_path_segments() {
        assert!(glob_matches("**/events", "http://localhost:3000/api/events").await);
        assert!(glob_matches("**/events", "https://example.com/events").await);
        assert!(!glob_matches("**/events", "https://example.com/events/archive").await);
    }

    #[tokio::test]
    async fn single_star_stays_within_a_segment() {
        assert!(glob_matches("http://api.test/users/*", "http://api.test/users/42").await);
        assert!(!glob_matches("http://api.test/users/*", "http://api.test/users/42/posts").await);
    }

    #[tokio::test]
    async fn question_mark_matches_one_character() {
        assert!(glob_matches("http://api.test/v?", "http://api.test/v1").await);
        assert!(!glob_matches("http://api.test/v?", "http://api.test/v10").await);
    }

    #[tokio::test]
    async fn literal_dots_are_escaped() {
        assert!(!glob_matches("http://api.test/*", "http://apixtest/a").await);
    }

    #[tokio::test]
    async fn regex_matcher_tests_the_url() {
        let matcher = RouteMatcher::regex(Regex::new(r"/users/\d+$").expect("regex"));
        assert!(matcher.matches(&MockRequest::get("http://api.test/users/7")).await);
        assert!(!matcher.matches(&MockRequest::get("http://api.test/users/me")).await);
    }

    #[tokio::test]
    async fn predicate_matcher_sees_the_whole_request() {
        let matcher = RouteMatcher::predicate(|request: MockRequest| async move {
            request.method == "POST" && request.body_text().contains("rocky")
        });
        let mut request = MockRequest::get("http://api.test/users");
        assert!(!matcher.matches(&request).await);
        request.method = "POST".to_string();
        request.body = Some("{\"name\":\"rocky\"}".to_string());
        assert!(matcher.matches(&request).await);
    }
}
