//! The MagicSauce workload: fetch N threads with M posts each and verify the shape.

use serde_json::Value;

use crate::checks::CheckSet;
use crate::error::Result;
use crate::models::iteration::StaticVariables;
use crate::models::{GraphqlRequest, RequestSpec, Variables};
use crate::runner::TestDefinition;
use crate::scheduler::{ConcurrencyPolicy, SchedulerOptions};

pub const OPERATION_NAME: &str = "MagicSauce";

pub const QUERY: &str = r#"query MagicSauce($threadLimit: Int!, $postLimit: Int!) {
  threads(limit: $threadLimit) {
    id
    posts(limit: $postLimit) {
      id
    }
  }
}"#;

pub const CHECK_GRAPHQL_ERRORS: &str = "graphql errors";
pub const CHECK_THREADS: &str = "threads";
pub const CHECK_THREAD_POSTS: &str = "thread posts";

/// Expected response size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub threads: usize,
    pub posts: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            threads: 4,
            posts: 20,
        }
    }
}

impl Limits {
    pub fn variables(&self) -> Variables {
        let mut variables = Variables::new();
        variables.insert("threadLimit".to_string(), self.threads as i64);
        variables.insert("postLimit".to_string(), self.posts as i64);
        variables
    }
}

/// POST template for the MagicSauce query against `endpoint`
pub fn request_spec(endpoint: &str, limits: Limits) -> RequestSpec {
    RequestSpec::post_json(endpoint)
        .body(|variables| {
            serde_json::to_value(
                GraphqlRequest::new(OPERATION_NAME, QUERY).with_variables(variables.clone()),
            )
            .unwrap_or(Value::Null)
        })
        .variables(StaticVariables(limits.variables()))
}

/// The three shape checks.
///
/// `thread posts` passes vacuously on an empty thread list; that case is
/// already reported by `threads`.
pub fn check_set(limits: Limits) -> Result<CheckSet> {
    let Limits { threads, posts } = limits;

    CheckSet::new()
        .with(CHECK_GRAPHQL_ERRORS, |r| {
            r.json()?;
            Ok(match r.lookup("errors")? {
                None | Some(Value::Null) => true,
                Some(Value::Array(errors)) => errors.is_empty(),
                Some(_) => false,
            })
        })?
        .with(CHECK_THREADS, move |r| {
            Ok(r.array("data.threads")?.len() == threads)
        })?
        .with(CHECK_THREAD_POSTS, move |r| {
            for (i, _) in r.array("data.threads")?.iter().enumerate() {
                if r.array(&format!("data.threads.{}.posts", i))?.len() != posts {
                    return Ok(false);
                }
            }
            Ok(true)
        })
}

/// Complete MagicSauce test against `endpoint`
pub fn definition(
    endpoint: &str,
    limits: Limits,
    policy: ConcurrencyPolicy,
    options: SchedulerOptions,
) -> Result<TestDefinition> {
    Ok(TestDefinition {
        name: OPERATION_NAME.to_string(),
        request: request_spec(endpoint, limits),
        checks: check_set(limits)?,
        policy,
        options,
        warmup_iterations: 0,
    })
}
