// Data models for requests, responses and iteration outcomes

pub mod graphql;
pub mod iteration;

pub use graphql::{GraphqlRequest, Variables};
pub use iteration::{IterationResult, RequestSpec, VariableSource};
