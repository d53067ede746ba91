use anyhow::Result;
use clap::{Parser, Subcommand};
use mentord::config::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mentord", version, about = "Local pairing daemon with a Learning Contract")]
struct Cli {
    /// Path to config.toml (default: platform config dir or $MENTORD_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Serve {
        /// Bind host (loopback unless explicitly allowed in config).
        #[arg(long)]
        host: Option<String>,
        /// Bind port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Query a running daemon's status endpoint.
    Status,
    /// Write a commented starter config to stdout or a file.
    InitConfig {
        /// Destination file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mentord=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Command::Serve { host, port } => {
            let mut config = Config::load(cli.config.as_deref())?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            mentord::gateway::run_gateway(config).await
        }
        Command::Status => {
            let config = Config::load(cli.config.as_deref())?;
            let url = format!(
                "http://{}:{}/v1/status",
                config.gateway.host, config.gateway.port
            );
            let status: serde_json::Value = reqwest::get(&url).await?.json().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::InitConfig { out } => {
            let rendered = Config::starter_toml();
            match out {
                Some(path) => {
                    if path.exists() {
                        anyhow::bail!("refusing to overwrite existing {}", path.display());
                    }
                    std::fs::write(&path, rendered)?;
                    println!("wrote {}", path.display());
                }
                None => print!("{rendered}"),
            }
            Ok(())
        }
    }
}
