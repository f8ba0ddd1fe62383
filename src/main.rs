use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use wormhole_daemon::config::Config;

#[derive(Parser)]
#[command(
    name = "wormhole",
    about = "Monitor and steer AI coding sessions from anywhere",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Daemon {
        /// Port to listen on (overrides config and environment)
        #[arg(long)]
        port: Option<u16>,

        /// Disable DNS-SD advertisement
        #[arg(long)]
        no_discovery: bool,
    },

    /// Open a new session in a directory
    Open {
        /// Session name (defaults to <dirname>-<hash>)
        #[arg(long)]
        name: Option<String>,

        /// Working directory (defaults to the current directory)
        #[arg(long)]
        directory: Option<PathBuf>,

        /// Extra flags passed through to the driver
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        driver_args: Vec<String>,
    },

    /// Close a session
    Close { name: String },

    /// List active sessions
    List,

    /// Show daemon status
    Status,

    /// Attach an interactive terminal to a session's conversation
    Attach {
        name: String,

        /// Run inside a detachable screen session
        #[arg(long)]
        screen: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Daemon { port, no_discovery } => run_daemon(port, no_discovery).await,
        Commands::Open {
            name,
            directory,
            driver_args,
        } => wormhole_cli::commands::open(name, directory, driver_args).await,
        Commands::Close { name } => wormhole_cli::commands::close(name).await,
        Commands::List => wormhole_cli::commands::list().await,
        Commands::Status => wormhole_cli::commands::status().await,
        Commands::Attach { name, screen } => wormhole_cli::commands::attach(name, screen).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run_daemon(port: Option<u16>, no_discovery: bool) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = port {
        config.port = port;
    }
    if no_discovery {
        config.discovery_enabled = false;
    }
    wormhole_daemon::run_daemon(config).await
}
