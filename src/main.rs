use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

use modsync::exchange::ConsolePrompt;
use modsync::{server, sync, Config};

#[derive(Debug, Parser)]
#[command(name = "modsync", version, about = "Server-authoritative file sync", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Offer the configured files to connecting clients
    Serve {
        /// Path to the TOML config file
        #[arg(short, long, env = "MODSYNC_CONFIG", default_value = "modsync.toml")]
        config: PathBuf,
        /// Override `server.bind`
        #[arg(long)]
        bind: Option<String>,
    },
    /// Fetch missing or changed files from a server
    Pull {
        #[arg(short, long, env = "MODSYNC_CONFIG", default_value = "modsync.toml")]
        config: PathBuf,
        /// Override `client.server`
        #[arg(long)]
        server: Option<String>,
        /// Do not wait for confirmation after files were written
        #[arg(short, long)]
        yes: bool,
        /// Print the result as JSON on stdout
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "modsync=info",
        1 => "modsync=debug",
        _ => "modsync=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Serve { config, bind } => {
            let mut config = Config::load(&config)?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            server::run_server(&config).await
        }
        Command::Pull {
            config,
            server,
            yes,
            json,
        } => {
            let mut config = Config::load(&config)?;
            if let Some(server) = server {
                config.client.server = server;
            }
            // The prompt would interleave with the JSON document
            let prompt = ConsolePrompt::new(yes || json);
            let report = sync::sync_pull(&config, prompt).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if !report.stats.sync_enabled {
                eprintln!("{}", "File sync is disabled for this server".yellow());
            } else if !report.restart_required {
                eprintln!("{}", "Everything is up to date".green());
            }
            Ok(())
        }
    }
}
