//! Leader election demo

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use keel_coord::{ElectionResult, LeaderElection, LeadershipWait};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Context;

#[derive(Args, Debug)]
pub struct ElectArgs {
    /// Number of competing participants
    #[arg(long, default_value_t = 3)]
    pub contenders: usize,

    /// How long each leader holds leadership before resigning
    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    pub hold: Duration,

    /// Election path (defaults to paths.election)
    #[arg(long)]
    pub path: Option<String>,
}

pub async fn run(args: ElectArgs, ctx: &Context) -> Result<()> {
    let path = args.path.unwrap_or_else(|| ctx.config.paths.election.clone());
    let cancel = cancel_on_ctrl_c();
    let hold = args.hold;

    let mut tasks = JoinSet::new();
    for i in 0..args.contenders {
        let election = LeaderElection::new(ctx.manager()).with_identity(format!("contender-{i}"));
        let path = path.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { contend(election, &path, hold, &cancel).await });
    }

    let mut led = 0;
    while let Some(joined) = tasks.join_next().await {
        if joined?? {
            led += 1;
        }
    }
    println!("{led} of {} contenders led {path} in turn", args.contenders);
    Ok(())
}

/// Run one participant until it has led once. Returns whether it led.
async fn contend(
    election: LeaderElection,
    path: &str,
    hold: Duration,
    cancel: &CancellationToken,
) -> Result<bool> {
    let handle = match election.try_elect(path).await? {
        ElectionResult::Leader(handle) => handle,
        ElectionResult::Follower(handle, watch) => {
            println!(
                "{} ({}) waiting behind {}",
                election.identity(),
                handle.name(),
                watch.predecessor()
            );
            match election.wait_for_leadership(handle, cancel).await? {
                LeadershipWait::Leader(handle) => handle,
                LeadershipWait::Cancelled(handle) => {
                    warn!(identity = %election.identity(), "Stopped waiting for leadership");
                    election.resign(&handle).await?;
                    return Ok(false);
                }
            }
        }
    };

    if let Some(leader) = election.current_leader(path).await? {
        println!("{} is leader ({})", leader.identity, leader.candidate);
    }

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(hold) => {}
    }

    election.resign(&handle).await?;
    info!(identity = %election.identity(), "Resigned leadership");
    Ok(true)
}

pub(crate) fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}
