//! mirror CLI — serve a directory as shared objects, or browse one remotely.
//!
//! `serve` plays the server side: it listens for peers and hosts `dir` and
//! `file` instances. `ls` and `cat` play the client side: they connect,
//! authenticate, and call through the same objects.

mod cli;
mod config;

use crate::cli::{Cli, Commands};
use anyhow::Context;
use clap::Parser;
use mirror_objects::{register_all, VirtualRoot, DIR_TYPE, FILE_TYPE};
use mirror_types::config::MirrorConfig;
use mirror_types::object::Side;
use mirror_wire::{
    connect, ObjectRouter, PeerNode, PeerRegistry, PeerSession, RouterConfig, SharedSecret,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing_stderr();

    let mut config = config::load_config(cli.config.as_deref());
    config::apply_overrides(&mut config, &cli);

    match &cli.command {
        Commands::Serve => cmd_serve(config).await,
        Commands::Ls { path } => cmd_ls(&config, path).await,
        Commands::Cat { path } => cmd_cat(&config, path).await,
    }
}

fn router_config(config: &MirrorConfig) -> RouterConfig {
    RouterConfig {
        reply_timeout: Duration::from_secs(config.reply_timeout_secs),
    }
}

async fn cmd_serve(config: MirrorConfig) -> anyhow::Result<()> {
    let registry = PeerRegistry::with_validator(Arc::new(SharedSecret::new(&config.password)));
    let router = ObjectRouter::new(Side::SERVER, registry.clone(), router_config(&config));
    register_all(&router, VirtualRoot::new(&config.root_dir));

    let (node, _accept) = PeerNode::listen(config.listen_addr, registry.clone())
        .await
        .with_context(|| format!("cannot listen on {}", config.listen_addr))?;
    info!(
        node_id = %config.node_id,
        addr = %node.local_addr(),
        root = %config.root_dir.display(),
        "Serving"
    );

    tokio::signal::ctrl_c().await?;
    info!(live_objects = router.live_objects().len(), "Shutting down");
    registry.shutdown();
    Ok(())
}

/// Connect as a client and return the router to call through.
async fn connect_client(config: &MirrorConfig) -> anyhow::Result<(ObjectRouter, Arc<PeerSession>)> {
    let registry = PeerRegistry::new();
    let router = ObjectRouter::new(Side::CLIENT, registry.clone(), router_config(config));
    register_all(&router, VirtualRoot::new(&config.root_dir));

    let session = connect(
        config.listen_addr,
        &registry,
        &config.password,
        &config.node_id,
        Duration::from_secs(config.reply_timeout_secs),
    )
    .await
    .with_context(|| format!("cannot connect to {}", config.listen_addr))?;
    Ok((router, session))
}

async fn cmd_ls(config: &MirrorConfig, path: &str) -> anyhow::Result<()> {
    let (router, session) = connect_client(config).await?;
    let dir = router.get_or_create(DIR_TYPE, path)?;
    let listing = dir.call("listFiles", vec![json!(path)]).await?;

    for entry in listing.as_array().into_iter().flatten() {
        let name = entry.get("name").and_then(Value::as_str).unwrap_or_default();
        let is_dir = entry
            .get("isDirectory")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        println!("{name}{}", if is_dir { "/" } else { "" });
    }

    dir.release();
    session.close();
    Ok(())
}

async fn cmd_cat(config: &MirrorConfig, path: &str) -> anyhow::Result<()> {
    let (router, session) = connect_client(config).await?;
    let file = router.get_or_create(FILE_TYPE, path)?;
    let content = file.call("getContent", vec![]).await?;
    print!("{}", content.as_str().unwrap_or_default());

    file.release();
    session.close();
    Ok(())
}
