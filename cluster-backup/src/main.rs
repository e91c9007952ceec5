//! Cluster Backup - Main entry point
//!
//! Prints only externally consumed lines on stdout; logs and diagnostics go
//! to stderr.

use anyhow::Result;
use clap::{Parser, Subcommand};
use cluster_backup::executor::BackupExecutor;
use cluster_backup::shutdown::ShutdownCoordinator;
use cluster_backup::transfer::RsyncTool;
use cluster_backup::transport::SshTransport;
use cluster_backup::{utils, BackupError, Config};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose ssh/rsync output and debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot repository storage from every node
    Backup {
        /// Primary as [user@]host[:port] (overrides config)
        #[arg(long)]
        host: Option<String>,
    },
    /// Check that the primary is a reachable, supported instance
    HostCheck {
        #[arg(long)]
        host: Option<String>,
    },
    /// List the storage nodes a backup would address
    Nodes {
        #[arg(long)]
        host: Option<String>,
    },
}

impl Command {
    fn host(&self) -> Option<&str> {
        match self {
            Command::Backup { host } | Command::HostCheck { host } | Command::Nodes { host } => {
                host.as_deref()
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            let code = err
                .downcast_ref::<BackupError>()
                .map(BackupError::exit_code)
                .unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(args: Args) -> Result<()> {
    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env()?;
    if let Some(host) = args.command.host() {
        config.host.hostname = host.to_string();
    }
    if args.verbose {
        config.transport.verbose = true;
    }

    // Initialize logging
    let log_level = match (&args.log_level, args.verbose) {
        (Some(level), _) => level.clone(),
        (None, true) => "debug".to_string(),
        (None, false) => config.log.level.clone(),
    };
    utils::logger::init(&log_level)?;

    config.validate()?;

    tracing::info!(
        "Starting cluster-backup v{} (host: {})",
        env!("CARGO_PKG_VERSION"),
        config.host.hostname
    );

    let ssh = SshTransport::from_config(&config.transport);
    let rsync = RsyncTool::from_config(&config, ssh.clone());
    let executor = BackupExecutor::new(&config, &ssh, &rsync);

    let negotiation = executor.negotiate().await?;
    println!("{}", negotiation.confirmation_line());

    match args.command {
        Command::HostCheck { .. } => Ok(()),
        Command::Nodes { .. } => {
            for target in executor.resolve_targets(&negotiation).await? {
                println!("{}", target.node);
            }
            Ok(())
        }
        Command::Backup { .. } => {
            let shutdown = Arc::new(ShutdownCoordinator::new());
            let token = shutdown.token();
            let listener = tokio::spawn({
                let shutdown = shutdown.clone();
                async move { shutdown.wait_for_signal().await }
            });

            let result = executor.backup(negotiation, &token).await;

            // Stop the signal listener
            shutdown.shutdown();
            let _ = listener.await;

            let report = result?;
            let Some(snapshot) = report.snapshot.as_ref() else {
                tracing::info!("No storage nodes found, nothing backed up");
                return Ok(());
            };

            let snapshots = executor.snapshots().clone();
            snapshots.promote(snapshot)?;

            let keep = config.backup.snapshots_to_keep;
            let verbose = config.transport.verbose;
            let finished = snapshot.clone();
            let cleanup = tokio::task::spawn_blocking(move || {
                if let Err(e) = snapshots.prune(keep) {
                    tracing::warn!("Failed to prune old snapshots: {}", e);
                }
                if verbose {
                    match snapshots.summary(&finished) {
                        Ok(summary) => tracing::info!(
                            snapshot = %finished.id,
                            files = summary.files,
                            bytes = summary.bytes,
                            "Snapshot contents"
                        ),
                        Err(e) => tracing::warn!("Failed to summarize snapshot: {}", e),
                    }
                }
            });
            if let Err(e) = cleanup.await {
                tracing::warn!("Snapshot cleanup task failed: {}", e);
            }

            tracing::info!(
                snapshot = %snapshot.id,
                nodes = report.nodes.len(),
                files = report.files_transferred(),
                "Backup complete"
            );
            println!("{}", snapshot.id);
            Ok(())
        }
    }
}
