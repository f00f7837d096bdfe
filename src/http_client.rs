use anyhow::Context;
use reqwest::Client;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::error::{Result, TransportError};
use crate::models::{IterationResult, RequestSpec, Variables};

/// Performs the network call of one iteration.
///
/// From the runner's point of view `execute` is a single blocking step: it
/// either yields a decoded response or a categorized [`TransportError`].
/// It never panics on network conditions.
pub trait Executor: Send + Sync + 'static {
    fn execute(
        &self,
        spec: &RequestSpec,
        variables: &Variables,
    ) -> impl Future<Output = std::result::Result<IterationResult, TransportError>> + Send;
}

/// Executor backed by a pooled reqwest client
#[derive(Clone)]
pub struct HttpExecutor {
    /// Shared HTTP client with connection pooling
    client: Client,
}

impl HttpExecutor {
    /// Create a new executor.
    /// `max_idle` bounds pooled connections per host; size it near the worker count.
    pub fn new(request_timeout: Duration, connect_timeout: Duration, max_idle: usize) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(max_idle)
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn send(
        &self,
        spec: &RequestSpec,
        variables: &Variables,
    ) -> std::result::Result<IterationResult, TransportError> {
        let body = serde_json::to_vec(&spec.build_body(variables))
            .map_err(|e| TransportError::decode(format!("request body: {}", e)))?;

        let mut request = self.client.request(spec.method.clone(), &spec.url);
        for (name, value) in &spec.headers {
            request = request.header(name, value);
        }

        let start = Instant::now();
        let response = request.body(body).send().await?;
        let status = response.status();

        tracing::trace!(status = %status, url = %spec.url, "Received HTTP response");

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        // Non-2xx is not a transport failure: GraphQL servers report errors in the body
        let bytes = response.bytes().await?;
        let elapsed = start.elapsed();

        let json = serde_json::from_slice(&bytes).map_err(|e| {
            TransportError::decode(format!(
                "status {} with non-JSON body ({} bytes): {}",
                status.as_u16(),
                bytes.len(),
                e
            ))
        })?;

        Ok(IterationResult::completed(status.as_u16(), json, elapsed).with_headers(headers))
    }
}

impl Executor for HttpExecutor {
    fn execute(
        &self,
        spec: &RequestSpec,
        variables: &Variables,
    ) -> impl Future<Output = std::result::Result<IterationResult, TransportError>> + Send {
        async move {
            let result = self.send(spec, variables).await;
            if let Err(e) = &result {
                tracing::debug!(
                    error_kind = %e.kind,
                    error = %e.message,
                    url = %spec.url,
                    "HTTP request error"
                );
            }
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;
    use serde_json::json;

    fn executor(timeout: Duration) -> HttpExecutor {
        HttpExecutor::new(timeout, Duration::from_secs(2), 8).unwrap()
    }

    #[tokio::test]
    async fn test_posts_json_body_and_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/graphql")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::Json(json!({"limit": 4})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":{"ok":true}}"#)
            .create_async()
            .await;

        let spec = RequestSpec::post_json(format!("{}/graphql", server.url()))
            .body(|vars| json!({ "limit": vars.get("limit") }));
        let mut variables = Variables::new();
        variables.insert("limit".to_string(), 4);

        let result = executor(Duration::from_secs(5))
            .execute(&spec, &variables)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.status, Some(200));
        assert_eq!(result.header("Content-Type"), Some("application/json"));
        assert_eq!(result.field("data.ok").unwrap(), &json!(true));
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_error_status_is_not_a_transport_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/graphql")
            .with_status(400)
            .with_body(r#"{"errors":[{"message":"bad query"}]}"#)
            .create_async()
            .await;

        let spec = RequestSpec::post_json(format!("{}/graphql", server.url()));
        let result = executor(Duration::from_secs(5))
            .execute(&spec, &Variables::new())
            .await
            .unwrap();

        assert_eq!(result.status, Some(400));
        assert_eq!(result.array("errors").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_json_body_is_decode_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/graphql")
            .with_status(502)
            .with_body("<html>Bad Gateway</html>")
            .create_async()
            .await;

        let spec = RequestSpec::post_json(format!("{}/graphql", server.url()));
        let err = executor(Duration::from_secs(5))
            .execute(&spec, &Variables::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, TransportErrorKind::DecodeError);
        assert!(err.message.contains("502"));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let spec = RequestSpec::post_json(format!("http://127.0.0.1:{}/graphql", port));
        let err = executor(Duration::from_secs(5))
            .execute(&spec, &Variables::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, TransportErrorKind::ConnectionFailed);
    }

    #[tokio::test]
    async fn test_timeout() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let spec = RequestSpec::post_json(format!("http://{}/graphql", addr));
        let err = executor(Duration::from_millis(200))
            .execute(&spec, &Variables::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, TransportErrorKind::Timeout);
        accept.abort();
    }
}
