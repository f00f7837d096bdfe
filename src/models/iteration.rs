use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::graphql::Variables;
use crate::error::{CheckError, TransportError};
use crate::scheduler::ConcurrencyContext;

// ==================================================================================================
// Variable Sources
// ==================================================================================================

/// Produces the variables for one iteration.
///
/// Resolved by the runner right before each call, so implementations may vary
/// values per iteration or per worker.
pub trait VariableSource: Send + Sync {
    fn resolve(&self, ctx: &ConcurrencyContext) -> Variables;
}

/// The same variables for every iteration
#[derive(Debug, Clone, Default)]
pub struct StaticVariables(pub Variables);

impl VariableSource for StaticVariables {
    fn resolve(&self, _ctx: &ConcurrencyContext) -> Variables {
        self.0.clone()
    }
}

/// Adapter for closures
pub struct VariablesFn<F>(pub F);

impl<F> VariableSource for VariablesFn<F>
where
    F: Fn(&ConcurrencyContext) -> Variables + Send + Sync,
{
    fn resolve(&self, ctx: &ConcurrencyContext) -> Variables {
        (self.0)(ctx)
    }
}

// ==================================================================================================
// Request Template
// ==================================================================================================

type BodyBuilder = Arc<dyn Fn(&Variables) -> Value + Send + Sync>;

/// Immutable request template, built once and shared by every iteration
#[derive(Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    body: BodyBuilder,
    variables: Arc<dyn VariableSource>,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Arc::new(|_| Value::Null),
            variables: Arc::new(StaticVariables::default()),
        }
    }

    /// JSON POST template
    pub fn post_json(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url).header("Content-Type", "application/json")
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body<F>(mut self, builder: F) -> Self
    where
        F: Fn(&Variables) -> Value + Send + Sync + 'static,
    {
        self.body = Arc::new(builder);
        self
    }

    pub fn variables<S>(mut self, source: S) -> Self
    where
        S: VariableSource + 'static,
    {
        self.variables = Arc::new(source);
        self
    }

    pub fn resolve_variables(&self, ctx: &ConcurrencyContext) -> Variables {
        self.variables.resolve(ctx)
    }

    pub fn build_body(&self, variables: &Variables) -> Value {
        (self.body)(variables)
    }
}

impl std::fmt::Debug for RequestSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSpec")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

// ==================================================================================================
// Iteration Outcome
// ==================================================================================================

/// Outcome of one call.
///
/// `body` is the decoded JSON document. Predicates reach into it through the
/// path helpers below, which report absence as a [`CheckError`] instead of
/// assuming a shape.
#[derive(Debug, Clone, Default)]
pub struct IterationResult {
    pub status: Option<u16>,
    /// Response headers, names lowercased
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub elapsed: Duration,
    pub failure: Option<TransportError>,
}

impl IterationResult {
    pub fn completed(status: u16, body: Value, elapsed: Duration) -> Self {
        Self {
            status: Some(status),
            headers: Vec::new(),
            body: Some(body),
            elapsed,
            failure: None,
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn failed(error: TransportError, elapsed: Duration) -> Self {
        Self {
            status: None,
            headers: Vec::new(),
            body: None,
            elapsed,
            failure: Some(error),
        }
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// The decoded body
    pub fn json(&self) -> Result<&Value, CheckError> {
        self.body.as_ref().ok_or(CheckError::MissingBody)
    }

    /// Optional lookup of a dotted path (`data.threads.0.posts`).
    /// `Ok(None)` means the body exists but the path does not.
    pub fn lookup(&self, path: &str) -> Result<Option<&Value>, CheckError> {
        Ok(resolve_path(self.json()?, path))
    }

    /// Required lookup of a dotted path
    pub fn field(&self, path: &str) -> Result<&Value, CheckError> {
        self.lookup(path)?
            .ok_or_else(|| CheckError::MissingField(path.to_string()))
    }

    /// Required lookup of an array
    pub fn array(&self, path: &str) -> Result<&Vec<Value>, CheckError> {
        self.field(path)?
            .as_array()
            .ok_or_else(|| CheckError::TypeMismatch {
                path: path.to_string(),
                expected: "an array",
            })
    }
}

/// Walk `path` through objects (by key) and arrays (by index).
/// An empty path addresses the root.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }

    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> IterationResult {
        IterationResult::completed(
            200,
            json!({"data": {"threads": [{"id": 1, "posts": [{"id": 7}]}]}}),
            Duration::from_millis(12),
        )
    }

    #[test]
    fn test_resolve_nested_path() {
        let result = sample();
        assert_eq!(result.field("data.threads.0.id").unwrap(), &json!(1));
        assert_eq!(result.field("data.threads.0.posts.0.id").unwrap(), &json!(7));
        assert_eq!(result.array("data.threads").unwrap().len(), 1);
    }

    #[test]
    fn test_missing_field_is_an_error_not_a_panic() {
        let result = sample();
        assert_eq!(
            result.field("errors"),
            Err(CheckError::MissingField("errors".to_string()))
        );
        assert_eq!(result.lookup("errors").unwrap(), None);
        assert_eq!(
            result.field("data.threads.5"),
            Err(CheckError::MissingField("data.threads.5".to_string()))
        );
    }

    #[test]
    fn test_array_type_mismatch() {
        let result = sample();
        assert_eq!(
            result.array("data.threads.0.id"),
            Err(CheckError::TypeMismatch {
                path: "data.threads.0.id".to_string(),
                expected: "an array",
            })
        );
    }

    #[test]
    fn test_failed_result_has_no_body() {
        let result = IterationResult::failed(
            TransportError::timeout("deadline"),
            Duration::from_secs(1),
        );
        assert!(!result.is_success());
        assert_eq!(result.json(), Err(CheckError::MissingBody));
        assert_eq!(result.lookup("data"), Err(CheckError::MissingBody));
    }

    #[test]
    fn test_empty_path_is_root() {
        let value = json!({"a": 1});
        assert_eq!(resolve_path(&value, ""), Some(&value));
        assert_eq!(resolve_path(&json!(3), "a"), None);
    }

    #[test]
    fn test_request_spec_builds_body_from_variables() {
        let mut variables = Variables::new();
        variables.insert("n".to_string(), 3);

        let spec = RequestSpec::post_json("http://localhost/graphql")
            .body(|vars| json!({ "n": vars.get("n") }))
            .variables(StaticVariables(variables));

        let ctx = ConcurrencyContext::default();
        let resolved = spec.resolve_variables(&ctx);
        assert_eq!(spec.build_body(&resolved), json!({"n": 3}));
        assert_eq!(spec.method, Method::POST);
        assert_eq!(
            spec.headers,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );
    }

    #[test]
    fn test_closure_variable_source_sees_context() {
        let spec = RequestSpec::post_json("http://localhost/graphql").variables(VariablesFn(
            |ctx: &ConcurrencyContext| {
                let mut vars = Variables::new();
                vars.insert("iteration".to_string(), ctx.iteration as i64);
                vars
            },
        ));

        let ctx = ConcurrencyContext {
            iteration: 41,
            worker: Some(2),
        };
        assert_eq!(spec.resolve_variables(&ctx).get("iteration"), Some(&41));
    }
}
