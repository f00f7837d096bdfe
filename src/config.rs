use clap::{Args, Parser, Subcommand};
use std::time::Duration;

use crate::error::{LoadError, Result};
use crate::mock_server::MockServerConfig;
use crate::report::Thresholds;
use crate::scheduler::{ArrivalOverflow, ConcurrencyPolicy, SchedulerOptions};
use crate::workload::Limits;

/// GraphQL load tester for the MagicSauce thread/post query
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load-test the GraphQL endpoint at GRAPHQL_ENDPOINT
    Run(LoadArgs),

    /// Start a local mock GraphQL server and load-test it
    Standalone {
        #[command(flatten)]
        load: LoadArgs,

        /// Mock server port (0 for random)
        #[arg(long, env = "MOCK_PORT", default_value = "0")]
        mock_port: u16,

        /// Artificial latency per mock response in milliseconds
        #[arg(long, env = "MOCK_LATENCY_MS", default_value = "5")]
        mock_latency_ms: u64,

        /// Share of mock responses that carry GraphQL errors (0.0 to 1.0)
        #[arg(long, env = "MOCK_ERROR_RATE", default_value = "0.0")]
        mock_error_rate: f64,
    },
}

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// GraphQL endpoint URL
    #[arg(short, long, env = "GRAPHQL_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Concurrency policy (fixed-pool, constant-arrival-rate)
    #[arg(short = 'x', long, env = "LOADTEST_EXECUTOR", default_value = "fixed-pool")]
    pub executor: String,

    /// Number of concurrent workers for fixed-pool
    #[arg(long, env = "LOADTEST_VUS", default_value = "100")]
    pub vus: usize,

    /// Run duration (e.g. 1s, 30s, 5m)
    #[arg(short, long, env = "LOADTEST_DURATION", default_value = "1s", value_parser = humantime::parse_duration)]
    pub duration: Duration,

    /// Iterations per time unit for constant-arrival-rate
    #[arg(long, env = "LOADTEST_RATE")]
    pub rate: Option<f64>,

    /// Time unit the rate refers to
    #[arg(long, env = "LOADTEST_TIME_UNIT", default_value = "1s", value_parser = humantime::parse_duration)]
    pub time_unit: Duration,

    /// Worker limit for constant-arrival-rate (defaults to --vus)
    #[arg(long, env = "LOADTEST_PRE_ALLOCATED_WORKERS")]
    pub pre_allocated_workers: Option<usize>,

    /// What to do with an arrival when every worker is busy (drop, queue)
    #[arg(long, env = "LOADTEST_OVERFLOW", default_value = "drop")]
    pub overflow: String,

    /// Maximum queued arrivals when --overflow=queue
    #[arg(long, env = "LOADTEST_QUEUE_CAPACITY", default_value = "1000")]
    pub queue_capacity: usize,

    /// Per-request timeout
    #[arg(long, env = "LOADTEST_REQUEST_TIMEOUT", default_value = "60s", value_parser = humantime::parse_duration)]
    pub request_timeout: Duration,

    /// TCP connect timeout
    #[arg(long, env = "LOADTEST_CONNECT_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    pub connect_timeout: Duration,

    /// Abort in-flight iterations this long after the run window closes
    #[arg(long, env = "LOADTEST_HARD_STOP", value_parser = humantime::parse_duration)]
    pub hard_stop: Option<Duration>,

    /// Threads requested per query
    #[arg(long, env = "THREADS", default_value = "4")]
    pub threads: usize,

    /// Posts requested per thread
    #[arg(long, env = "POSTS", default_value = "20")]
    pub posts: usize,

    /// Fail the run when the share of failed checks exceeds this (0.0 to 1.0)
    #[arg(long, env = "LOADTEST_MAX_FAILURE_RATE")]
    pub max_failure_rate: Option<f64>,

    /// Fail the run when latency p95 exceeds this many milliseconds
    #[arg(long, env = "LOADTEST_MAX_P95_MS")]
    pub max_p95_ms: Option<f64>,

    /// Unrecorded requests sent before the measured run
    #[arg(long, env = "LOADTEST_WARMUP", default_value = "0")]
    pub warmup: usize,

    /// Print the summary as JSON instead of a table
    #[arg(long, env = "LOADTEST_JSON")]
    pub json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Target URL; `None` in standalone mode until the mock server is up
    pub endpoint: Option<String>,
    /// Set in standalone mode
    pub mock_server: Option<MockServerConfig>,

    // Scheduling
    pub policy: ConcurrencyPolicy,
    pub scheduler: SchedulerOptions,
    pub warmup: usize,

    // HTTP client
    pub request_timeout: Duration,
    pub connect_timeout: Duration,

    // Workload
    pub limits: Limits,

    // Reporting
    pub thresholds: Thresholds,
    pub json_output: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration with priority: CLI > ENV (.env included) > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(cli: Cli) -> Result<Self> {
        let (args, mock_server) = match cli.command {
            Command::Run(args) => (args, None),
            Command::Standalone {
                load,
                mock_port,
                mock_latency_ms,
                mock_error_rate,
            } => (
                load,
                Some(MockServerConfig {
                    port: mock_port,
                    latency_ms: mock_latency_ms,
                    error_rate: mock_error_rate,
                }),
            ),
        };

        let endpoint = args.endpoint.clone().filter(|e| !e.trim().is_empty());
        if mock_server.is_none() && endpoint.is_none() {
            return Err(LoadError::MissingConfig(
                "GRAPHQL_ENDPOINT is required (use --endpoint or set GRAPHQL_ENDPOINT env var)"
                    .to_string(),
            ));
        }

        let config = Config {
            // The mock server decides its own URL
            endpoint: if mock_server.is_some() { None } else { endpoint },
            mock_server,
            policy: build_policy(&args)?,
            scheduler: SchedulerOptions {
                overflow: parse_overflow(&args.overflow, args.queue_capacity)?,
                hard_stop: args.hard_stop,
            },
            warmup: args.warmup,
            request_timeout: args.request_timeout,
            connect_timeout: args.connect_timeout,
            limits: Limits {
                threads: args.threads,
                posts: args.posts,
            },
            thresholds: Thresholds {
                max_check_failure_rate: args.max_failure_rate,
                max_latency_p95_ms: args.max_p95_ms,
            },
            json_output: args.json,
            log_level: args.log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;

        if self.request_timeout.is_zero() {
            return Err(LoadError::InvalidPolicy(
                "request timeout must be greater than zero".to_string(),
            ));
        }

        if let Some(rate) = self.thresholds.max_check_failure_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(LoadError::InvalidPolicy(format!(
                    "max failure rate must be within 0.0..=1.0, got {}",
                    rate
                )));
            }
        }

        if let Some(mock) = &self.mock_server {
            if !(0.0..=1.0).contains(&mock.error_rate) {
                return Err(LoadError::InvalidPolicy(format!(
                    "mock error rate must be within 0.0..=1.0, got {}",
                    mock.error_rate
                )));
            }
        }

        Ok(())
    }
}

/// Executor kind selected on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorKind {
    FixedPool,
    ConstantArrivalRate,
}

/// Parse executor kind from string
fn parse_executor(s: &str) -> Result<ExecutorKind> {
    match s.to_lowercase().replace('_', "-").as_str() {
        "fixed-pool" | "constant-vus" => Ok(ExecutorKind::FixedPool),
        "constant-arrival-rate" => Ok(ExecutorKind::ConstantArrivalRate),
        other => Err(LoadError::InvalidPolicy(format!(
            "unknown executor: {} (expected fixed-pool or constant-arrival-rate)",
            other
        ))),
    }
}

/// Parse overflow handling from string
fn parse_overflow(s: &str, capacity: usize) -> Result<ArrivalOverflow> {
    match s.to_lowercase().as_str() {
        "drop" => Ok(ArrivalOverflow::Drop),
        "queue" => Ok(ArrivalOverflow::Queue { capacity }),
        other => Err(LoadError::InvalidPolicy(format!(
            "unknown overflow mode: {} (expected drop or queue)",
            other
        ))),
    }
}

fn build_policy(args: &LoadArgs) -> Result<ConcurrencyPolicy> {
    let policy = match parse_executor(&args.executor)? {
        ExecutorKind::FixedPool => ConcurrencyPolicy::FixedPool {
            count: args.vus,
            duration: args.duration,
        },
        ExecutorKind::ConstantArrivalRate => ConcurrencyPolicy::ConstantArrivalRate {
            rate: args.rate.ok_or_else(|| {
                LoadError::InvalidPolicy(
                    "--rate is required for constant-arrival-rate".to_string(),
                )
            })?,
            time_unit: args.time_unit,
            duration: args.duration,
            pre_allocated_workers: args.pre_allocated_workers.unwrap_or(args.vus),
        },
    };
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config> {
        let mut argv = vec!["graphql-loadtest"];
        argv.extend_from_slice(args);
        Config::from_cli(Cli::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_defaults_mirror_single_second_burst() {
        let config = parse(&["run", "--endpoint", "http://localhost:8000/graphql"]).unwrap();

        assert_eq!(
            config.policy,
            ConcurrencyPolicy::FixedPool {
                count: 100,
                duration: Duration::from_secs(1),
            }
        );
        assert_eq!(config.limits, Limits::default());
        assert_eq!(config.scheduler, SchedulerOptions::default());
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.thresholds, Thresholds::default());
        assert!(!config.json_output);
        assert!(config.mock_server.is_none());
    }

    #[test]
    fn test_missing_endpoint() {
        let err = parse(&["run", "--endpoint="]).unwrap_err();
        assert!(matches!(err, LoadError::MissingConfig(msg) if msg.contains("GRAPHQL_ENDPOINT")));
    }

    #[test]
    fn test_standalone_needs_no_endpoint() {
        let config = parse(&["standalone", "--endpoint=", "--mock-error-rate", "0.5"]).unwrap();
        assert!(config.endpoint.is_none());
        assert_eq!(config.mock_server.unwrap().error_rate, 0.5);
    }

    #[test]
    fn test_constant_arrival_rate() {
        let config = parse(&[
            "run",
            "-e",
            "http://x/graphql",
            "--executor",
            "constant-arrival-rate",
            "--rate",
            "50",
            "--time-unit",
            "1m",
            "--duration",
            "30s",
            "--pre-allocated-workers",
            "20",
            "--overflow",
            "queue",
            "--queue-capacity",
            "5",
            "--hard-stop",
            "2s",
        ])
        .unwrap();

        assert_eq!(
            config.policy,
            ConcurrencyPolicy::ConstantArrivalRate {
                rate: 50.0,
                time_unit: Duration::from_secs(60),
                duration: Duration::from_secs(30),
                pre_allocated_workers: 20,
            }
        );
        assert_eq!(config.scheduler.overflow, ArrivalOverflow::Queue { capacity: 5 });
        assert_eq!(config.scheduler.hard_stop, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_arrival_rate_requires_rate() {
        let err = parse(&["run", "-e", "http://x", "-x", "constant-arrival-rate"]).unwrap_err();
        assert!(matches!(err, LoadError::InvalidPolicy(_)));
    }

    #[test]
    fn test_invalid_values_are_policy_errors() {
        for args in [
            vec!["run", "-e", "http://x", "--vus", "0"],
            vec!["run", "-e", "http://x", "--duration", "0s"],
            vec!["run", "-e", "http://x", "--executor", "ramping"],
            vec!["run", "-e", "http://x", "--overflow", "block"],
            vec!["run", "-e", "http://x", "--max-failure-rate", "1.5"],
            vec!["run", "-e", "http://x", "-x", "constant-arrival-rate", "--rate=-1"],
        ] {
            let err = parse(&args).unwrap_err();
            assert!(matches!(err, LoadError::InvalidPolicy(_)), "{:?}", args);
        }
    }

    #[test]
    fn test_parse_executor_case_insensitive() {
        assert_eq!(parse_executor("Fixed_Pool").unwrap(), ExecutorKind::FixedPool);
        assert_eq!(parse_executor("constant-vus").unwrap(), ExecutorKind::FixedPool);
        assert_eq!(
            parse_executor("CONSTANT-ARRIVAL-RATE").unwrap(),
            ExecutorKind::ConstantArrivalRate
        );
    }

    #[test]
    fn test_parse_overflow() {
        assert_eq!(parse_overflow("drop", 3).unwrap(), ArrivalOverflow::Drop);
        assert_eq!(
            parse_overflow("Queue", 3).unwrap(),
            ArrivalOverflow::Queue { capacity: 3 }
        );
        assert!(parse_overflow("", 3).is_err());
    }
}
