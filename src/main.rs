use anyhow::Result;
use tokio::sync::watch;

use graphql_loadtest::config::Config;
use graphql_loadtest::error::LoadError;
use graphql_loadtest::http_client::HttpExecutor;
use graphql_loadtest::mock_server::MockGraphqlServer;
use graphql_loadtest::{runner, workload};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;

    // Initialize logging with a configured level; stdout is reserved for the report
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("🚀 GraphQL load test starting...");

    // Standalone mode: serve the query locally and point the run at it
    let mut mock_server = None;
    let endpoint = match (&config.mock_server, &config.endpoint) {
        (Some(mock_config), _) => {
            let mut server = MockGraphqlServer::new(mock_config.clone());
            server.start().await?;
            let endpoint = server.endpoint();
            mock_server = Some(server);
            endpoint
        }
        (None, Some(endpoint)) => endpoint.clone(),
        (None, None) => {
            return Err(LoadError::MissingConfig("GRAPHQL_ENDPOINT".to_string()).into());
        }
    };

    tracing::info!(endpoint = %endpoint, policy = %config.policy, "Target configured");

    let mut definition =
        workload::definition(&endpoint, config.limits, config.policy, config.scheduler)?;
    definition.warmup_iterations = config.warmup;

    let executor = HttpExecutor::new(
        config.request_timeout,
        config.connect_timeout,
        config.policy.max_workers(),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let summary = runner::run_with_shutdown(definition, executor, Some(shutdown_rx)).await?;

    if let Some(mut server) = mock_server.take() {
        server.stop();
    }

    if config.json_output {
        println!("{}", summary.to_json());
    } else {
        summary.print_table();
    }

    let breaches = summary.evaluate(&config.thresholds);
    if !breaches.is_empty() {
        for breach in &breaches {
            tracing::error!("❌ Threshold breached: {}", breach);
        }
        anyhow::bail!("{} threshold(s) breached", breaches.len());
    }

    tracing::info!("✅ Load test complete");

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, stopping new iterations...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, stopping new iterations...");
        },
    }
}
