use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use codebox::gateway::{self, GatewayConfig};
use codebox::{Engine, EngineConfig};

#[derive(Parser)]
#[command(name = "codebox-gateway")]
#[command(version)]
#[command(about = "HTTP gateway for the codebox execution engine")]
struct Args {
    #[arg(long, env = "CODEBOX_BIND_ADDR", default_value = "127.0.0.1:8000")]
    bind_addr: String,

    /// TOML configuration file
    #[arg(long, env = "CODEBOX_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    codebox::init_logging();
    let args = Args::parse();

    let config = EngineConfig::load(args.config.as_deref())?;
    tracing::info!(
        python = %config.python_path.display(),
        artifacts = %config.artifacts.root.display(),
        "Starting codebox gateway"
    );

    let engine = Arc::new(Engine::new(config));
    gateway::serve(
        engine,
        GatewayConfig {
            bind_addr: args.bind_addr,
        },
    )
    .await?;
    Ok(())
}
