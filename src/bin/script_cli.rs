//! script_cli - run scripts and data bridge reads locally
//!
//! `run` pushes a script file through the same pipeline the HTTP service
//! uses; `fetch` performs a single data bridge call and prints the JSON.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use script_gateway::config::GatewayConfig;
use script_gateway::{Gateway, ScriptRequest};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "GATEWAY_CONFIG", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a script file and print the reply body.
    Run {
        /// Script to execute.
        #[arg(long)]
        file: PathBuf,
        /// Correlation id to log the run under.
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// GET one path from the data API and print the response.
    Fetch {
        /// Environment name, e.g. sandbox or production.
        #[arg(long, env = "BC_ENVIRONMENT")]
        environment: String,
        /// Path relative to the environment's API root.
        #[arg(long, env = "BC_RELATIVE_URL", default_value = "companies")]
        path: String,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = GatewayConfig::load_from(args.config.as_deref())?;
    let gateway = Gateway::from_config(&config)?;

    match args.command {
        Command::Run {
            file,
            correlation_id,
        } => {
            let code = std::fs::read_to_string(&file)
                .map_err(|e| anyhow!("failed to read script {}: {}", file.display(), e))?;
            let mut request = ScriptRequest::new(code);
            if let Some(id) = correlation_id {
                request = request.with_correlation_id(id);
            }
            let reply = gateway.handle(&request).into_reply(&request.correlation_id);
            println!("{}", reply.body);
            if reply.status != 200 {
                return Err(anyhow!("script finished with status {}", reply.status));
            }
        }
        Command::Fetch { environment, path } => {
            let data = gateway.bridge().fetch(&path, &environment)?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
    }
    Ok(())
}
