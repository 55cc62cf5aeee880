#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # deskbridge
//!
//! Command-line front end for the desktop connection bridge.
//!
//! ## Subcommands
//!
//! - `deskbridge connect "<command>" [--fetch <path>]` spawns the sidecar,
//!   opens a tunnel with `<command>` (answering authentication prompts on the
//!   terminal), optionally fetches `<path>` through it, then tears it down.
//! - `deskbridge store [--namespace <ns>] get|set|delete|keys|clear` reads and
//!   writes the persisted key/value store.
//!
//! Configuration comes from `--config`, `deskbridge.toml` or compiled
//! defaults, with `DESKBRIDGE_*` environment overrides.

use std::error::Error;
use std::io::{IsTerminal, Write};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use deskbridge::config::Config;
use deskbridge::fetch::{self, FetchRouter};
use deskbridge::host::{Host, ProcessHost};
use deskbridge::prompt::spawn_relay;
use deskbridge::sidecar::SidecarCommand;
use deskbridge::storage::{FlushReport, LifecycleEvent, Storage, DEFAULT_NAMESPACE};
use deskbridge::terminal::{spawn_input, TerminalView};
use deskbridge::tunnel::TunnelManager;
use deskbridge::FetchError;

type CliResult = Result<(), Box<dyn Error>>;

/// Desktop connection bridge.
#[derive(Parser)]
#[command(name = "deskbridge", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a tunnel through the sidecar and report where it leads.
    Connect {
        /// Remote login command, e.g. "ssh -p 2222 me@build-box".
        command: String,
        /// Fetch this path (or URL) through the tunnel before disconnecting.
        #[arg(long)]
        fetch: Option<String>,
    },
    /// Inspect or edit persisted client state.
    Store {
        #[arg(long, default_value = DEFAULT_NAMESPACE)]
        namespace: String,
        #[command(subcommand)]
        op: StoreOp,
    },
}

#[derive(Subcommand)]
enum StoreOp {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
    Keys,
    Clear,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Connect { command, fetch } => run_connect(&config, &command, fetch.as_deref()).await,
        Commands::Store { namespace, op } => run_store(&config, &namespace, op).await,
    };

    // Exit explicitly: the stdin reader may still be parked in a blocking read.
    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}

fn storage(config: &Config) -> Storage {
    Storage::with_files(
        &config.storage.data_dir,
        Duration::from_millis(config.storage.debounce_ms),
    )
}

fn check(report: &FlushReport) -> CliResult {
    match report.failed.first() {
        None => Ok(()),
        Some((key, e)) => Err(format!("failed to persist {key}: {e}").into()),
    }
}

async fn run_connect(config: &Config, command: &str, fetch_path: Option<&str>) -> CliResult {
    info!("deskbridge v{} starting", env!("CARGO_PKG_VERSION"));
    let storage = storage(config);

    let password = config
        .server
        .password
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let sidecar = SidecarCommand::from_config(&config.sidecar, &config.storage.data_dir, &password);

    let (prompt_tx, prompt_rx) = mpsc::channel(config.prompt.queue_capacity.max(1));
    let (host, exit_rx) = ProcessHost::spawn(&sidecar, prompt_tx)?;
    let host = Arc::new(host);
    let manager = TunnelManager::new(host.clone());

    let interactive = std::io::stdin().is_terminal();
    let (relay, _relay_task) = spawn_relay(
        host.clone(),
        TerminalView::new(std::io::stderr(), interactive),
        prompt_rx,
        manager.subscribe_connecting(),
    );
    spawn_input(BufReader::new(tokio::io::stdin()), relay);

    let router = FetchRouter::new(fetch::client(&config.fetch)?, manager.directory(), &config.fetch);
    router.set_ambient_password(Some(password));
    if router.base_url().is_none() {
        if let Some(base) = host.server_config().await.and_then(|c| c.base_url()) {
            router.set_base_url(Some(&base))?;
        }
    }

    let conn = tokio::select! {
        result = manager.connect(command) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            if let Err(e) = storage.on_lifecycle(LifecycleEvent::Terminating).await {
                warn!("Lifecycle flush task failed: {e}");
            }
            host.shutdown();
            return Err("interrupted".into());
        }
    };
    info!(key = %conn.key, origin = %conn.origin, "Tunnel open");
    println!("{}\t{}\t{}", conn.key, conn.origin, manager.server_key(&conn.url));

    let session = storage.default_namespace();
    session.set("tunnel.last_destination", conn.destination.clone());
    session.set("tunnel.last_origin", conn.origin.to_string());

    let fetched = match fetch_path {
        Some(path) => {
            router.set_base_url(Some(&conn.url))?;
            fetch_and_print(&router, path).await
        }
        None => Ok(()),
    };

    let teardown = manager.disconnect(&conn.key).await;
    if let Some(e) = &teardown.host_error {
        warn!(key = %conn.key, "Tunnel teardown failed: {e}");
    }

    for (namespace, report) in storage.flush_all().await {
        if let Err(e) = check(&report) {
            warn!(namespace = %namespace, "{e}");
        }
    }

    host.shutdown();
    if let Ok(Ok(exit)) = tokio::time::timeout(Duration::from_secs(2), exit_rx).await {
        info!(code = ?exit.code, "Sidecar exited");
    }
    fetched.map_err(Into::into)
}

/// Print the status line, then stream the body to stdout.
async fn fetch_and_print(router: &FetchRouter, path: &str) -> Result<(), FetchError> {
    let mut resp = router.get(path).await?;
    println!("{}", resp.status);
    let mut stdout = std::io::stdout();
    while let Some(chunk) = resp.chunk().await? {
        // A closed stdout just ends the output early.
        if stdout.write_all(&chunk).and_then(|()| stdout.flush()).is_err() {
            break;
        }
    }
    Ok(())
}

async fn run_store(config: &Config, namespace: &str, op: StoreOp) -> CliResult {
    let storage = storage(config);
    let ns = storage.namespace(namespace);
    match op {
        StoreOp::Get { key } => match ns.get(&key).await {
            Some(value) => println!("{value}"),
            None => return Err(format!("{key}: not found").into()),
        },
        StoreOp::Set { key, value } => {
            ns.set(key, value);
            check(&ns.flush().await)?;
        }
        StoreOp::Delete { key } => {
            ns.delete(key);
            check(&ns.flush().await)?;
        }
        StoreOp::Keys => {
            for key in ns.keys().await {
                println!("{key}");
            }
        }
        StoreOp::Clear => ns.clear().await,
    }
    Ok(())
}
