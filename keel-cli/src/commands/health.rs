//! Server health registration demo

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use keel_coord::HealthRegistration;

use super::Context;
use super::elect::cancel_on_ctrl_c;

#[derive(Args, Debug)]
pub struct HealthArgs {
    /// Identifier registered under the health path
    #[arg(long, default_value = "server-1")]
    pub server_id: String,

    /// Stop after this many heartbeats (runs until Ctrl-C if unset)
    #[arg(long)]
    pub beats: Option<u64>,

    /// Heartbeat interval
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub interval: Duration,
}

pub async fn run(args: HealthArgs, ctx: &Context) -> Result<()> {
    let mut registration =
        HealthRegistration::new(ctx.manager(), ctx.config.paths.health.clone(), args.server_id)
            .with_interval(args.interval);
    if let Some(beats) = args.beats {
        registration = registration.with_max_beats(beats);
    }

    println!("Registered {}", registration.node_path());
    let beats = registration.run(&cancel_on_ctrl_c()).await?;
    println!("Deregistered {} after {beats} heartbeats", registration.node_path());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeelConfig;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        health: HealthArgs,
    }

    #[test]
    fn parse_defaults() {
        let cli = TestCli::try_parse_from(["test"]).unwrap();
        assert_eq!(cli.health.server_id, "server-1");
        assert!(cli.health.beats.is_none());
        assert_eq!(cli.health.interval, Duration::from_secs(5));
    }

    #[test]
    fn parse_with_options() {
        let cli = TestCli::try_parse_from([
            "test",
            "--server-id",
            "api-7",
            "--beats",
            "2",
            "--interval",
            "100ms",
        ])
        .unwrap();
        assert_eq!(cli.health.server_id, "api-7");
        assert_eq!(cli.health.beats, Some(2));
        assert_eq!(cli.health.interval, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn bounded_run_completes() {
        let ctx = Context::new(KeelConfig::default());
        let args = HealthArgs {
            server_id: "test-server".to_string(),
            beats: Some(2),
            interval: Duration::from_millis(5),
        };

        run(args, &ctx).await.unwrap();
    }
}
