//! Distributed lock demo

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use keel_coord::{AcquireOptions, AcquireOutcome, DistributedLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::Context;
use super::elect::cancel_on_ctrl_c;

#[derive(Args, Debug)]
pub struct LockArgs {
    /// Number of competing participants
    #[arg(long, default_value_t = 3)]
    pub contenders: usize,

    /// How long each holder keeps the lock
    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    pub hold: Duration,

    /// Give up waiting for the lock after this long
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Lock path (defaults to paths.lock)
    #[arg(long)]
    pub path: Option<String>,
}

pub async fn run(args: LockArgs, ctx: &Context) -> Result<()> {
    let path = args.path.unwrap_or_else(|| ctx.config.paths.lock.clone());
    let cancel = cancel_on_ctrl_c();

    let mut options = AcquireOptions::blocking().with_cancel(cancel.clone());
    if let Some(timeout) = args.timeout {
        options = options.with_timeout(timeout);
    }

    let hold = args.hold;
    let mut tasks = JoinSet::new();
    for i in 0..args.contenders {
        let lock = DistributedLock::new(ctx.manager()).with_identity(format!("worker-{i}"));
        let path = path.clone();
        let options = options.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { work(lock, &path, options, hold, &cancel).await });
    }

    let mut held = 0;
    while let Some(joined) = tasks.join_next().await {
        if joined?? {
            held += 1;
        }
    }
    println!("{held} of {} workers held {path}", args.contenders);
    Ok(())
}

/// Acquire, hold, release. Returns whether the lock was held.
async fn work(
    lock: DistributedLock,
    path: &str,
    options: AcquireOptions,
    hold: Duration,
    cancel: &CancellationToken,
) -> Result<bool> {
    let handle = match lock.acquire(path, options).await? {
        AcquireOutcome::Acquired(handle) => handle,
        AcquireOutcome::Pending(candidate) | AcquireOutcome::Cancelled(candidate) => {
            println!("{} gave up waiting", lock.identity());
            lock.abandon(candidate).await?;
            return Ok(false);
        }
    };

    println!(
        "{} acquired {} ({})",
        lock.identity(),
        handle.path(),
        handle.candidate().name()
    );

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(hold) => {}
    }

    lock.release(handle).await?;
    println!("{} released {path}", lock.identity());
    Ok(true)
}
