use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing_subscriber::prelude::*;

mod config;
mod session;

use crate::config::{FileConfig, load_config};
use crate::session::JoinOptions;

#[derive(Parser)]
#[command(name = "phx")]
#[command(about = "Join Phoenix channel topics from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./phx.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a topic: print inbound frames, push stdin lines
    Join(JoinArgs),

    /// Print the resolved configuration as TOML
    Config,
}

#[derive(Parser)]
struct JoinArgs {
    /// Topic to join, e.g. "room:lobby"
    topic: String,

    /// Event name for lines read from stdin
    #[arg(short, long, default_value = "new_msg")]
    event: String,

    /// Join param as key=value (value parsed as JSON when possible)
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,

    /// Override the configured endpoint
    #[arg(long)]
    endpoint: Option<String>,
}

fn parse_param(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("expected key=value, got {raw:?}");
    };
    if key.is_empty() {
        bail!("empty param name in {raw:?}");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "phx_cli=debug,phx_channels=debug,info"
    } else {
        "phx_cli=info,phx_channels=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let mut file_config: FileConfig = load_config(cli.config.as_deref())
        .extract()
        .context("loading configuration")?;

    match cli.command {
        Commands::Config => {
            let text = toml::to_string_pretty(&file_config).context("rendering configuration")?;
            print!("{text}");
            Ok(())
        }
        Commands::Join(args) => {
            if let Some(endpoint) = args.endpoint {
                file_config.endpoint = endpoint;
            }
            let opts = JoinOptions {
                topic: args.topic,
                event: args.event,
                params: args.params.into_iter().collect::<Map<String, Value>>(),
            };
            session::join_command(&file_config, opts).await
        }
    }
}
