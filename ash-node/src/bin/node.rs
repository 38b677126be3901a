//! Ash node binary

use anyhow::Context;
use ash_node::{Node, NodeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting Ash node");

    // Load configuration: file first, environment on top
    let config = match std::env::var("ASH_CONFIG") {
        Ok(path) => {
            let mut config = NodeConfig::from_file(&path)
                .with_context(|| format!("loading config from {}", path))?;
            config.apply_env()?;
            config
        }
        Err(_) => NodeConfig::from_env()?,
    };

    let node = Node::start(config).await.context("starting node")?;
    tracing::info!(url = %node.url(), peer = %node.public_key(), "Node listening");

    node.run().await?;

    tracing::info!("Shutting down Ash node");
    Ok(())
}
