//! Node create/read/update/delete walkthrough

use anyhow::Result;
use clap::Args;
use keel_coord::{CreateMode, NodeClient};
use tracing::info;

use super::Context;

#[derive(Args, Debug)]
pub struct CrudArgs {
    /// Node to operate on (defaults to paths.node)
    #[arg(long)]
    pub path: Option<String>,

    /// Initial node data
    #[arg(long, default_value = "Hello ZooKeeper")]
    pub data: String,

    /// Data written by the update step
    #[arg(long, default_value = "Updated Data")]
    pub update: String,

    /// Leave the node in place instead of deleting it
    #[arg(long)]
    pub keep: bool,
}

pub async fn run(args: CrudArgs, ctx: &Context) -> Result<()> {
    let path = args.path.unwrap_or_else(|| ctx.config.paths.node.clone());
    let manager = ctx.manager();
    let nodes = NodeClient::new(manager.clone());

    if nodes
        .create_if_absent(&path, args.data.as_bytes(), CreateMode::Persistent)
        .await?
    {
        println!("Created {path}");
    } else {
        println!("{path} already exists");
    }

    let (data, meta) = nodes.read(&path).await?;
    println!(
        "Read {path}: {} (version {})",
        String::from_utf8_lossy(&data),
        meta.version
    );

    let meta = nodes
        .update(&path, args.update.as_bytes(), Some(meta.version))
        .await?;
    let (data, _) = nodes.read(&path).await?;
    println!(
        "Updated {path}: {} (version {})",
        String::from_utf8_lossy(&data),
        meta.version
    );

    let children = nodes.children("/").await?;
    println!("Children of /: {}", children.join(", "));

    if !args.keep {
        nodes.delete(&path, Some(meta.version)).await?;
        println!("Deleted {path}");
        info!(exists = nodes.exists(&path).await?.is_some(), "Checked {path}");
    }

    manager.close().await;
    Ok(())
}
