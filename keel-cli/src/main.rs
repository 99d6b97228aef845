use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod config;

use commands::Context;
use config::{ConfigLoader, KeelConfig};

#[derive(Parser)]
#[command(
    name = "keel",
    about = "Leader election and locking over a hierarchical watch store"
)]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Store endpoint (overrides session.endpoint)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Session timeout, e.g. "15s" (overrides session.session_timeout)
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    session_timeout: Option<Duration>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage configuration
    Config(commands::config::ConfigArgs),
    /// Create, read, update and delete a node
    Crud(commands::crud::CrudArgs),
    /// Run a leader election among several contenders
    Elect(commands::elect::ElectArgs),
    /// Register server health with periodic heartbeats
    Health(commands::health::HealthArgs),
    /// Contend for a distributed lock
    Lock(commands::lock::LockArgs),
    /// Watch a configuration node while it is updated
    Watch(commands::watch::WatchArgs),
}

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration
    fn apply_overrides(&self, mut config: KeelConfig) -> KeelConfig {
        if let Some(endpoint) = &self.endpoint {
            config.session = config.session.with_endpoint(endpoint.clone());
        }
        if let Some(timeout) = self.session_timeout {
            config.session = config.session.with_session_timeout(timeout);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.apply_overrides(ConfigLoader::load()?);
    let ctx = Context::new(config);

    match cli.command {
        Commands::Config(args) => commands::config::run(args, &ctx.config),
        Commands::Crud(args) => commands::crud::run(args, &ctx).await,
        Commands::Elect(args) => commands::elect::run(args, &ctx).await,
        Commands::Health(args) => commands::health::run(args, &ctx).await,
        Commands::Lock(args) => commands::lock::run(args, &ctx).await,
        Commands::Watch(args) => commands::watch::run(args, &ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_override_config() {
        let cli = Cli::try_parse_from([
            "keel",
            "--endpoint",
            "zk1:2181",
            "--session-timeout",
            "30s",
            "crud",
        ])
        .unwrap();

        let config = cli.apply_overrides(KeelConfig::default());
        assert_eq!(config.session.endpoint, "zk1:2181");
        assert_eq!(config.session.session_timeout, Duration::from_secs(30));
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["keel", "elect", "--contenders", "4", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Elect(_)));
    }

    #[test]
    fn no_overrides_keeps_config() {
        let cli = Cli::try_parse_from(["keel", "config", "show"]).unwrap();
        let config = cli.apply_overrides(KeelConfig::default());
        assert_eq!(config, KeelConfig::default());
    }

    #[tokio::test]
    async fn unsupported_endpoint_fails_after_retries() {
        let mut config = KeelConfig::default();
        config.session = config
            .session
            .with_endpoint("zk1:2181")
            .with_max_connect_attempts(2)
            .with_retry_delay(Duration::from_millis(1));
        let ctx = Context::new(config);

        let args = commands::crud::CrudArgs {
            path: None,
            data: "x".to_string(),
            update: "y".to_string(),
            keep: false,
        };
        let err = commands::crud::run(args, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("after 2 attempts"));
    }
}
