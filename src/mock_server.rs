//! Mock GraphQL server answering the MagicSauce thread/post query.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

use crate::models::graphql::{
    GraphqlError, GraphqlRequest, GraphqlResponse, Identified, Thread, ThreadsData,
};
use crate::workload::Limits;

/// Largest `threadLimit` / `postLimit` the server honors
pub const MAX_LIMIT: i64 = 1000;

/// Configuration for the mock GraphQL server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MockServerConfig {
    /// Port to listen on (0 for random)
    pub port: u16,
    /// Artificial latency per response in milliseconds
    pub latency_ms: u64,
    /// Error rate (0.0 to 1.0)
    pub error_rate: f64,
}

/// Mock GraphQL server for standalone runs and tests
pub struct MockGraphqlServer {
    config: MockServerConfig,
    shutdown_tx: Option<oneshot::Sender<()>>,
    port: u16,
}

impl MockGraphqlServer {
    /// Create a new mock server with the given configuration
    pub fn new(config: MockServerConfig) -> Self {
        Self {
            config,
            shutdown_tx: None,
            port: 0,
        }
    }

    /// Start the mock server and return the actual port
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("127.0.0.1:{}", self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        self.port = port;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let app = router(self.config.clone());

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        tracing::info!(port, error_rate = self.config.error_rate, "Mock GraphQL server listening");

        // Give the server a moment to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        Ok(port)
    }

    /// Get the server's port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the server's base URL
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Get the GraphQL endpoint URL
    pub fn endpoint(&self) -> String {
        format!("{}/graphql", self.url())
    }

    /// Stop the mock server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockGraphqlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build the mock router
pub fn router(config: MockServerConfig) -> Router {
    Router::new()
        .route("/graphql", post(handle_graphql))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(config))
}

/// Handle POST /graphql
async fn handle_graphql(
    State(config): State<Arc<MockServerConfig>>,
    payload: Result<Json<GraphqlRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => {
            let body = GraphqlResponse {
                data: serde_json::Value::Null,
                errors: vec![GraphqlError {
                    message: rejection.body_text(),
                }],
            };
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    if config.latency_ms > 0 {
        tokio::time::sleep(Duration::from_millis(config.latency_ms)).await;
    }

    // Simulate random errors
    if config.error_rate > 0.0 {
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() < config.error_rate {
            let body = GraphqlResponse {
                data: ThreadsData { threads: vec![] },
                errors: vec![GraphqlError {
                    message: "simulated resolver failure".to_string(),
                }],
            };
            return Json(body).into_response();
        }
    }

    let defaults = Limits::default();
    let threads = clamp_limit(request.variable("threadLimit"), defaults.threads);
    let posts = clamp_limit(request.variable("postLimit"), defaults.posts);

    Json(GraphqlResponse {
        data: generate_threads(threads, posts),
        errors: vec![],
    })
    .into_response()
}

fn clamp_limit(value: Option<i64>, default: usize) -> usize {
    value.map_or(default, |v| v.clamp(0, MAX_LIMIT) as usize)
}

/// Threads are numbered from 1; post ids are unique across threads
fn generate_threads(threads: usize, posts: usize) -> ThreadsData {
    let threads = (1..=threads as u32)
        .map(|id| Thread {
            id,
            posts: (1..=posts as u32)
                .map(|p| Identified {
                    id: id * MAX_LIMIT as u32 + p,
                })
                .collect(),
        })
        .collect();

    ThreadsData { threads }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_threads_shape() {
        let data = generate_threads(4, 20);
        assert_eq!(data.threads.len(), 4);
        assert!(data.threads.iter().all(|t| t.posts.len() == 20));
        assert_eq!(data.threads[0].id, 1);
        assert_eq!(data.threads[1].posts[0].id, 2001);
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None, 4), 4);
        assert_eq!(clamp_limit(Some(-3), 4), 0);
        assert_eq!(clamp_limit(Some(7), 4), 7);
        assert_eq!(clamp_limit(Some(1_000_000), 4), 1000);
    }

    #[tokio::test]
    async fn test_server_start_and_stop() {
        let mut server = MockGraphqlServer::new(MockServerConfig::default());
        let port = server.start().await.unwrap();
        assert_ne!(port, 0);
        assert_eq!(server.port(), port);
        assert_eq!(server.endpoint(), format!("http://127.0.0.1:{}/graphql", port));

        let response = reqwest::Client::new()
            .post(server.endpoint())
            .json(&serde_json::json!({
                "query": "query { threads { id } }",
                "variables": {"threadLimit": 2, "postLimit": 3}
            }))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        let body: GraphqlResponse<ThreadsData> = response.json().await.unwrap();
        assert_eq!(body.data.threads.len(), 2);
        assert!(body.errors.is_empty());

        server.stop();
    }
}
