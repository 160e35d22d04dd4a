use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;

use tether_daemon::client::{self, DaemonClient};
use tether_daemon::daemon;
use tether_wire::{ControlDir, DaemonRequest};

#[derive(Debug, Parser)]
#[command(name = "tetherd")]
#[command(about = "Per-host daemon for the tether agent control mesh")]
struct Cli {
    /// Control directory (default: ~/.pi/remote-control).
    #[arg(long, global = true)]
    control_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the daemon in the foreground (the default).
    Run {
        /// Federation port override.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Start a detached daemon and wait for its control socket.
    Spawn,
    /// Print the running daemon's status.
    Status,
    /// Ask the running daemon to exit.
    Kill,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let control_dir = match cli.control_dir {
        Some(path) => ControlDir::new(path),
        None => match ControlDir::default_root() {
            Some(dir) => dir,
            None => {
                error!("cannot determine home directory");
                std::process::exit(1);
            }
        },
    };

    match cli.command.unwrap_or(Commands::Run { port: None }) {
        Commands::Run { port } => {
            if let Err(e) = daemon::run(control_dir, port).await {
                error!("fatal: {e}");
                std::process::exit(1);
            }
        }

        Commands::Spawn => match DaemonClient::connect_or_spawn(&control_dir).await {
            Ok(_) => println!("daemon ready at {}", control_dir.daemon_sock().display()),
            Err(e) => {
                error!("{e}");
                std::process::exit(1);
            }
        },

        Commands::Status => match run_request(&control_dir, DaemonRequest::Status).await {
            Ok(()) => {}
            Err(e) => {
                error!("{e}");
                std::process::exit(1);
            }
        },

        Commands::Kill => match run_request(&control_dir, DaemonRequest::Kill).await {
            Ok(()) => {}
            Err(e) => {
                error!("{e}");
                std::process::exit(1);
            }
        },
    }
}

async fn run_request(
    control_dir: &ControlDir,
    request: DaemonRequest,
) -> Result<(), client::ClientError> {
    let mut client = DaemonClient::connect(control_dir).await?;
    let resp = client.request(&request).await?;
    match serde_json::to_string_pretty(&resp) {
        Ok(json) => println!("{json}"),
        Err(_) => println!("{resp:?}"),
    }
    Ok(())
}
