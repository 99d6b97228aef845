//! Configuration watch demo

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use keel_coord::{ConfigWatcher, CreateMode, NodeClient};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Context;

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Number of updates to write and observe
    #[arg(long, default_value_t = 3)]
    pub updates: u32,

    /// Delay between updates
    #[arg(long, default_value = "200ms", value_parser = humantime::parse_duration)]
    pub interval: Duration,

    /// Configuration node (defaults to paths.config)
    #[arg(long)]
    pub path: Option<String>,
}

pub async fn run(args: WatchArgs, ctx: &Context) -> Result<()> {
    let path = args.path.unwrap_or_else(|| ctx.config.paths.config.clone());
    let writer = NodeClient::new(ctx.manager());
    writer
        .create_if_absent(&path, b"version-0", CreateMode::Persistent)
        .await?;
    let (_, meta) = writer.read(&path).await?;
    let target = meta.version + i32::try_from(args.updates)?;

    let cancel = CancellationToken::new();
    let (mut values, watcher) =
        ConfigWatcher::new(ctx.manager(), path.clone()).spawn(cancel.clone());

    let updates = args.updates;
    let interval = args.interval;
    let writer_task = {
        let path = path.clone();
        tokio::spawn(async move {
            for n in 1..=updates {
                tokio::time::sleep(interval).await;
                writer
                    .update(&path, format!("version-{n}").as_bytes(), None)
                    .await?;
                debug!(path = %path, n, "Wrote configuration");
            }
            anyhow::Ok(())
        })
    };

    // Rapid writes may coalesce; stop once the last version is seen
    while values.changed().await.is_ok() {
        let current = values.borrow_and_update().clone();
        match current {
            Some(value) => {
                println!("{path} = {} (version {})", value.text(), value.version);
                if value.version >= target {
                    break;
                }
            }
            None => println!("{path} is absent"),
        }
    }

    writer_task.await??;
    cancel.cancel();
    watcher.await??;
    Ok(())
}
