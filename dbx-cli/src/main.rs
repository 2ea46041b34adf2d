//! CLI for talking to D-Bus services.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod call;
mod decode;
mod render;
mod watch;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use dbx::bus::{self, RequestNameFlags, RequestNameReply};
use dbx::{BusKind, Config, Connection, ConnectionBuilder};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dbx", version, about = "Talk to D-Bus services")]
struct Cli {
    /// Connect to the system bus instead of the session bus.
    #[arg(long, global = true, conflicts_with = "address")]
    system: bool,

    /// Connect to an explicit D-Bus address.
    #[arg(long, global = true)]
    address: Option<String>,

    /// Read connection settings from a JSON file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format.
    #[arg(long, global = true, default_value = "table")]
    format: OutputFormat,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(flatten)]
    Bus(BusCommand),

    /// Decode raw frames from a capture file or stdin.
    Decode {
        /// Capture file (default: stdin).
        file: Option<PathBuf>,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Subcommands that need a connection.
#[derive(Subcommand)]
enum BusCommand {
    /// List every name on the bus.
    #[command(visible_alias = "ls")]
    ListNames,

    /// Call a method and print its reply.
    Call(call::CallArgs),

    /// Read one property.
    Get(call::GetArgs),

    /// Read every property of an interface.
    GetAll(call::GetAllArgs),

    /// List the objects below an object manager.
    ManagedObjects(call::ManagedObjectsArgs),

    /// Print matching signals until interrupted.
    Watch(watch::WatchArgs),

    /// Own a well-known name until interrupted.
    RequestName {
        /// Name to request.
        name: String,
        /// Fail rather than wait in the queue.
        #[arg(long)]
        no_queue: bool,
    },
}

/// Output format for commands printing structured data.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable text.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = cli.dispatch().await {
        eprintln!("dbx: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Bus(command) => {
                let conn = connect(self.config.as_deref(), self.system, self.address.as_deref()).await?;
                let result = command.run(&conn, self.format).await;
                conn.close();
                result
            }
            Command::Decode { file } => decode::run(file.as_deref(), self.format),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "dbx", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

impl BusCommand {
    async fn run(self, conn: &Connection, format: OutputFormat) -> Result<()> {
        match self {
            Self::ListNames => list_names(conn, format).await,
            Self::Call(args) => call::call(conn, &args, format).await,
            Self::Get(args) => call::get(conn, &args, format).await,
            Self::GetAll(args) => call::get_all(conn, &args, format).await,
            Self::ManagedObjects(args) => call::managed_objects(conn, &args, format).await,
            Self::Watch(args) => watch::run(conn, &args, format).await,
            Self::RequestName { name, no_queue } => request_name(conn, &name, no_queue).await,
        }
    }
}

/// Opens a connection from the command-line flags.
///
/// Flags win over the config file; the config file wins over the defaults.
async fn connect(config: Option<&Path>, system: bool, address: Option<&str>) -> Result<Connection> {
    let mut cfg = match config {
        Some(path) => Config::load(path).with_context(|| format!("reading {}", path.display()))?,
        None => Config::default(),
    };
    if system {
        cfg.bus = BusKind::System;
        cfg.address = None;
    }
    if let Some(address) = address {
        cfg.address = Some(address.to_owned());
    }
    let target = match &cfg.address {
        Some(address) => address.clone(),
        None if cfg.bus == BusKind::System => "the system bus".to_owned(),
        None => "the session bus".to_owned(),
    };
    ConnectionBuilder::from_config(&cfg)
        .build()
        .await
        .with_context(|| format!("connecting to {target}"))
}

async fn list_names(conn: &Connection, format: OutputFormat) -> Result<()> {
    let mut names = bus::list_names(conn).await?;
    names.sort();
    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&names)?);
        return Ok(());
    }
    for name in &names {
        println!("{name}");
    }
    Ok(())
}

async fn request_name(conn: &Connection, name: &str, no_queue: bool) -> Result<()> {
    let flags = if no_queue {
        RequestNameFlags::DO_NOT_QUEUE
    } else {
        RequestNameFlags::empty()
    };
    let reply = bus::request_name(conn, name, flags)
        .await
        .with_context(|| format!("requesting {name}"))?;
    match reply {
        RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => println!("{name}: owned"),
        RequestNameReply::InQueue => println!("{name}: queued"),
        RequestNameReply::Exists => anyhow::bail!("{name} is already owned"),
        _ => anyhow::bail!("unexpected reply for {name}"),
    }
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("waiting for Ctrl-C")?,
        () = conn.closed() => anyhow::bail!("connection closed"),
    }
    Ok(())
}
