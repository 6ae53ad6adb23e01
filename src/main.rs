use std::path::PathBuf;

use anyhow::{Context, Result};
use capwire::{demo, util, SessionConfig, Value};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "capwire",
    version,
    about = "Capability RPC with promise pipelining and callback capture"
)]
struct Cli {
    /// Config file (default: ~/.capwire/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log filter directive when RUST_LOG is unset (e.g. debug, capwire=trace)
    #[arg(long, global = true, value_name = "LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a captured query against an in-process query service
    Demo {
        /// Keep rows whose age is at least this
        #[arg(long, default_value_t = 30)]
        min_age: i64,

        /// Print rows as a JSON array
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid --log-level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => SessionConfig::load_from(path)?,
        None => {
            util::init_data_dir(None);
            SessionConfig::load()?
        }
    };

    match cli.command {
        Command::Demo { min_age, json } => {
            let rows = demo::run_demo(min_age, config)
                .await
                .context("demo query failed")?;
            if json {
                let list = Value::List(rows).to_json();
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                for row in &rows {
                    println!("{}", describe(row));
                }
            }
        }
    }

    Ok(())
}

fn describe(row: &Value) -> String {
    match (row.field("name"), row.field("age")) {
        (Some(Value::String(name)), Some(age)) => format!("{name} ({age})"),
        _ => row.to_string(),
    }
}
