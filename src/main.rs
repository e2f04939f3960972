//! CLI for centralbus
//!
//! Subcommands:
//! - `central`: run the central broker
//! - `playback`: republish a message log through a fresh publisher
//! - `info`: print central's presence table

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use centralbus::broker::Central;
use centralbus::client::{ControlClient, Publisher};
use centralbus::config::{
    self, CentralSettings, DEFAULT_CENTRAL_RPC_PORT, PublisherSettings, Settings,
};
use centralbus::persistence::message_log::DISABLED;
use centralbus::persistence::ready_log_path;
use centralbus::playback::Playback;
use centralbus::transport::endpoint::{self, CENTRAL_HOST_TOKEN, Endpoint, Port};
use centralbus::utils::{Result, daemon, logging};

#[derive(Parser)]
#[command(name = "centralbus", about = "Central message bus")]
struct Cli {
    /// Configuration file; defaults to config/default.* plus CENTRALBUS_* variables
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the central broker
    Central(CentralArgs),
    /// Republish the messages of a log file
    Playback(PlaybackArgs),
    /// Print the modules central currently knows about
    Info(InfoArgs),
}

#[derive(Args)]
struct CentralArgs {
    /// Interface to bind, substituted for {bindInterface} in endpoints
    #[arg(short, long)]
    bind_interface: Option<String>,
    #[arg(short, long)]
    rpc_endpoint: Option<String>,
    /// Endpoint modules publish to
    #[arg(short, long)]
    subscribe_endpoint: Option<String>,
    /// Endpoint modules subscribe to
    #[arg(short, long)]
    publish_endpoint: Option<String>,
    /// Also bridge in a non-central-aware publisher, as NAME@ENDPOINT
    #[arg(long, value_name = "NAME@ENDPOINT")]
    subscribe_to: Vec<String>,
    #[arg(short = 'd', long)]
    log_dir: Option<String>,
    /// Message log file name, %s is replaced by the start time, "none" disables
    #[arg(short, long)]
    message_log: Option<String>,
    /// Console log file name, %s is replaced by the start time, "none" disables
    #[arg(short, long)]
    console_log: Option<String>,
    /// Stay in the foreground and also log to stderr
    #[arg(short, long)]
    foreground: bool,
}

#[derive(Args)]
struct PublisherArgs {
    #[arg(long)]
    central_host: Option<String>,
    #[arg(long, default_value = "playback")]
    module_name: String,
    #[arg(long)]
    central_subscribe_endpoint: Option<String>,
    #[arg(long)]
    publish_endpoint: Option<String>,
    #[arg(long)]
    heartbeat_period_ms: Option<u64>,
}

#[derive(Args)]
struct PlaybackArgs {
    /// Message log to play
    log: PathBuf,
    /// Only play topics starting with PREFIX; may be repeated
    #[arg(short, long = "topic", value_name = "PREFIX")]
    topics: Vec<String>,
    #[command(flatten)]
    publisher: PublisherArgs,
}

#[derive(Args)]
struct InfoArgs {
    /// Defaults to the configured `publisher.central_rpc_endpoint`
    #[arg(long)]
    rpc_endpoint: Option<String>,
    #[arg(long)]
    central_host: Option<String>,
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let loaded = match cli.config.as_deref() {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    };
    let settings = match loaded {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Central(args) => central_command(settings, args),
        Command::Playback(args) => block_on(&settings, playback_command(settings.publisher.clone(), args)),
        Command::Info(args) => block_on(&settings, info_command(settings.publisher.clone(), args)),
    }
}

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

/// Run a client-side command with stderr logging.
fn block_on(settings: &Settings, task: impl Future<Output = Result<()>>) -> ExitCode {
    logging::init(&settings.logging.level);
    let outcome = match runtime() {
        Ok(runtime) => runtime.block_on(task),
        Err(e) => Err(e.into()),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn central_command(settings: Settings, args: CentralArgs) -> ExitCode {
    let mut central = settings.central;
    apply_central_args(&mut central, args);

    let console_log = match prepare_logs(&mut central) {
        Ok(console_log) => console_log,
        Err(e) => {
            logging::init(&settings.logging.level);
            error!("could not prepare log directory: {e}");
            return ExitCode::FAILURE;
        }
    };

    if !central.foreground {
        if let Err(e) = daemon::daemonize() {
            logging::init(&settings.logging.level);
            error!("could not daemonize: {e}");
            return ExitCode::FAILURE;
        }
    }
    if let Err(e) = logging::init_with_file(
        &settings.logging.level,
        console_log.as_deref(),
        central.foreground,
    ) {
        logging::init(&settings.logging.level);
        error!("could not open console log: {e}");
        return ExitCode::FAILURE;
    }

    let outcome = match runtime() {
        Ok(runtime) => runtime.block_on(run_central(central)),
        Err(e) => Err(e.into()),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("central failed to start: {e}");
            ExitCode::FAILURE
        }
    }
}

fn apply_central_args(central: &mut CentralSettings, args: CentralArgs) {
    let overrides = [
        (args.bind_interface, &mut central.bind_interface),
        (args.rpc_endpoint, &mut central.rpc_endpoint),
        (args.subscribe_endpoint, &mut central.subscribe_endpoint),
        (args.publish_endpoint, &mut central.publish_endpoint),
        (args.log_dir, &mut central.log_dir),
        (args.message_log, &mut central.message_log),
        (args.console_log, &mut central.console_log),
    ];
    for (value, slot) in overrides {
        if let Some(value) = value {
            *slot = value;
        }
    }
    central.subscribe_to.extend(args.subscribe_to);
    central.foreground |= args.foreground;
}

/// Make the log directory absolute (daemonizing changes the working
/// directory) and resolve the console log file.
fn prepare_logs(central: &mut CentralSettings) -> std::io::Result<Option<PathBuf>> {
    let log_dir = std::path::absolute(Path::new(&central.log_dir))?;
    central.log_dir = log_dir.to_string_lossy().into_owned();
    if central.console_log == DISABLED {
        return Ok(None);
    }
    ready_log_path(&log_dir, &central.console_log, Utc::now()).map(Some)
}

async fn run_central(settings: CentralSettings) -> Result<()> {
    let handle = Central::start(&settings).await?;
    info!(
        "central running: rpc {}, subscribe {}, publish {}",
        handle.endpoints.rpc, handle.endpoints.subscribe, handle.endpoints.publish
    );
    shutdown_signal().await;
    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut terminate) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
            return;
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

async fn playback_command(mut settings: PublisherSettings, args: PlaybackArgs) -> Result<()> {
    let overrides = args.publisher;
    settings.module_name = overrides.module_name;
    if let Some(host) = overrides.central_host {
        settings.central_host = host;
    }
    if let Some(endpoint) = overrides.central_subscribe_endpoint {
        settings.central_subscribe_endpoint = endpoint;
    }
    if let Some(endpoint) = overrides.publish_endpoint {
        settings.publish_endpoint = endpoint;
    }
    if let Some(period) = overrides.heartbeat_period_ms {
        settings.heartbeat_period_ms = period;
    }

    let mut publisher = Publisher::new(settings);
    publisher.start().await?;
    let played = Playback::new(args.log, args.topics).run(&publisher).await;
    publisher.stop().await;
    played.map(|_| ())
}

async fn info_command(settings: PublisherSettings, args: InfoArgs) -> Result<()> {
    let host = args.central_host.unwrap_or(settings.central_host);
    let template = args.rpc_endpoint.unwrap_or(settings.central_rpc_endpoint);
    let endpoint = Endpoint::parse_with_default(
        &endpoint::expand(&template, CENTRAL_HOST_TOKEN, &host),
        Some(Port::Fixed(DEFAULT_CENTRAL_RPC_PORT)),
    )?;
    let mut client = ControlClient::connect(&endpoint).await?;
    let modules = client.info().await?;
    println!("{}", serde_json::to_string_pretty(&modules)?);
    client.close().await
}
