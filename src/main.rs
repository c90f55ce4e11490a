//! tabserv - firewall drop-rule manager
//!
//! Manages TCP drop rules on an iptables chain, keeps a history of every rule
//! it installed, and feeds rule changes to live watchers.
//!
//! # Usage
//!
//! ```bash
//! tabserv shell                      # Interactive session (add/delete/list/history/watch)
//! tabserv --dry-run demo             # Replay the sample session against an in-memory table
//! tabserv add 192.168.1.100 22       # One-shot add
//! tabserv delete 192.168.1.100 22    # One-shot delete
//! tabserv init-config                # Write the default config.json
//! ```
//!
//! History and watchers live in the process, so `list`/`history`/`watch` are
//! only meaningful inside `shell` or `demo`.

use clap::{Parser, Subcommand};
use shadow_rs::shadow;
use std::io::Write;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::process::ExitCode;
use tabserv::config::{self, AppConfig};
use tabserv::{RuleService, shell};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

shadow!(build);

#[derive(Parser)]
#[command(name = "tabserv")]
#[command(version, long_version = build::CLAP_LONG_VERSION)]
#[command(about = "Firewall drop-rule manager with history and live change feeds", long_about = None)]
struct Cli {
    /// Use an in-memory rule table instead of iptables
    #[arg(long, global = true)]
    dry_run: bool,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Read configuration from this file instead of the data directory
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the configured chain
    #[arg(long, global = true)]
    chain: Option<String>,

    /// Override the configured table
    #[arg(long, global = true)]
    table: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read commands from stdin until quit or end of input
    Shell,
    /// Run the sample client session and print every response and event
    Demo,
    /// Install a TCP drop rule
    Add {
        /// Source address or CIDR
        source: String,
        /// Destination port
        port: u16,
    },
    /// Remove a TCP drop rule
    Delete {
        /// Source address or CIDR
        source: String,
        /// Destination port
        port: u16,
    },
    /// Write the effective configuration to the data directory
    InitConfig,
}

fn main() -> ExitCode {
    let _ = tabserv::utils::ensure_dirs();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error ({}): {e}", e.status());
            ExitCode::FAILURE
        }
    }
}

/// Logs to `tabserv.log` in the state directory, falling back to stderr.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if let Some(mut log_path) = tabserv::utils::get_state_dir() {
        log_path.push("tabserv.log");
        if let Ok(file) = std::fs::File::create(log_path) {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_ansi(false)
                .with_writer(file)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .init();
}

async fn load_config(cli: &Cli) -> tabserv::Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => config::load_config_from(path).await?,
        None => config::load_config().await,
    };
    if let Some(chain) = &cli.chain {
        config.chain.clone_from(chain);
    }
    if let Some(table) = &cli.table {
        config.table.clone_from(table);
    }
    Ok(config)
}

/// Prints lines from the output channel until every sender is gone.
fn spawn_printer() -> (mpsc::Sender<String>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(line) = rx.recv().await {
            if writeln!(stdout, "{line}").is_err() {
                break;
            }
        }
    });
    (tx, printer)
}

async fn init_config(config: &AppConfig) -> tabserv::Result<()> {
    config::save_config(config).await?;
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

async fn run(cli: Cli) -> tabserv::Result<()> {
    let config = load_config(&cli).await?;

    if !cli.dry_run && config.elevate && !nix::unistd::getuid().is_root() {
        tracing::info!("Not running as root; iptables calls will be elevated");
    }
    let service = RuleService::from_config(&config, cli.dry_run);

    let result = match cli.command {
        Commands::Add { source, port } => service
            .add_drop_rule(&source, port)
            .await
            .map(|resp| println!("added={} rule={}", resp.added, resp.formatted_rule)),
        Commands::Delete { source, port } => service
            .delete_drop_rule(&source, port)
            .await
            .map(|resp| println!("deleted={} rule={}", resp.deleted, resp.formatted_rule)),
        Commands::Demo => {
            let (out, printer) = spawn_printer();
            let result = shell::run_demo(&service, &out).await;
            drop(out);
            let _ = printer.await;
            result
        }
        Commands::Shell => {
            if nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false) {
                println!("tabserv {} - type 'help' for commands", build::PKG_VERSION);
            }

            let shutdown = CancellationToken::new();
            let ctrl_c = {
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        shutdown.cancel();
                    }
                })
            };

            let (out, printer) = spawn_printer();
            let input = tokio::io::BufReader::new(tokio::io::stdin());
            let result = shell::run_shell(&service, input, &out, &shutdown).await;
            drop(out);
            let _ = printer.await;
            ctrl_c.abort();
            result
        }
        Commands::InitConfig => init_config(&config).await,
    };

    service.shutdown();
    result
}
