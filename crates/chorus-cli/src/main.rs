mod agents;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};

use chorus_core::workspace::{build_workspace, ServiceRegistry, WorkspaceSpec};
use chorus_core::WorkspaceController;

/// Run workspaces of collaborating agents.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory containing workspace definition files
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Workspace name; resolves to `<root>/<name>.json`
    #[arg(short = 'w', long)]
    workspace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the workspace and block until a stop condition fires
    Run {
        /// Write a snapshot to this path during shutdown
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { snapshot } => run(cli.root, cli.workspace, snapshot).await,
    }
}

async fn run(root: PathBuf, workspace: String, snapshot: Option<PathBuf>) -> Result<()> {
    let path = root.join(format!("{workspace}.json"));
    let spec = WorkspaceSpec::from_file(&path)
        .wrap_err_with(|| format!("failed to load workspace definition {}", path.display()))?;
    let workspace = build_workspace(&spec, &agents::builtin_registry(), &ServiceRegistry::new())?;

    let mut controller = WorkspaceController::new(workspace)?;
    if let Some(path) = snapshot {
        controller.snapshot_on_stop(path);
    }

    let handle = controller.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping workspace");
            handle.request_stop();
        }
    });

    let mut listener = controller.add_message_listener();
    tokio::spawn(async move {
        while let Ok(event) = listener.recv().await {
            if let Some(message) = event.as_message() {
                tracing::info!(
                    source = %message.source,
                    destination = message.destination.as_ref().map(|d| d.as_str()).unwrap_or("-"),
                    channel = message.channel.as_ref().map(|c| c.as_str()).unwrap_or("-"),
                    tick = message.timestamp,
                    "{}",
                    message.content
                );
            }
        }
    });

    controller.run().await?;
    Ok(())
}
