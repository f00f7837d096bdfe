// GraphQL Load Tester - Library root

pub mod checks;
pub mod config;
pub mod error;
pub mod http_client;
pub mod metrics;
pub mod mock_server;
pub mod models;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod workload;
