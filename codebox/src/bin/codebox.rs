use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use codebox::validator::Validator;
use codebox::{Engine, EngineConfig, ExecutionRequest};

#[derive(Parser)]
#[command(name = "codebox")]
#[command(version)]
#[command(about = "Validate and run Python snippets in a disposable sandbox")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "CODEBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the static checks only
    Check(SourceArgs),
    /// Execute a snippet through the full pipeline and print the tool response
    Run(RunArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Parser)]
struct SourceArgs {
    /// Snippet file, or `-` for stdin
    #[arg(default_value = "-")]
    source: String,
}

#[derive(Parser)]
struct RunArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Do not capture figures
    #[arg(long)]
    no_plot: bool,

    #[arg(long, default_value = "cli")]
    conversation: String,
}

#[tokio::main]
async fn main() {
    codebox::init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Check(args) => check(args),
        Commands::Run(args) => run(cli.config, args).await,
        Commands::Config => show_config(cli.config),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn read_source(source: &str) -> anyhow::Result<String> {
    if source == "-" {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("Failed to read snippet from stdin")?;
        return Ok(code);
    }
    std::fs::read_to_string(source).with_context(|| format!("Failed to read {}", source))
}

fn check(args: SourceArgs) -> anyhow::Result<i32> {
    let code = read_source(&args.source)?;
    match Validator::new().validate(&code) {
        Ok(()) => {
            println!("ok");
            Ok(0)
        }
        Err(rejection) => {
            println!("{}", rejection.message());
            Ok(2)
        }
    }
}

async fn run(config: Option<PathBuf>, args: RunArgs) -> anyhow::Result<i32> {
    let code = read_source(&args.source.source)?;
    let config = EngineConfig::load(config.as_deref())?;
    let engine = Engine::new(config);

    let request = ExecutionRequest::new(args.conversation, code).with_capture_plot(!args.no_plot);
    let response = engine.execute(request).await?;
    engine.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(if response.is_success() { 0 } else { 2 })
}

fn show_config(config: Option<PathBuf>) -> anyhow::Result<i32> {
    let config = EngineConfig::load(config.as_deref())?;
    println!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
    Ok(0)
}
