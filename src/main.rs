use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vocalrelay::audio::AudioIo;
use vocalrelay::config::Config;
use vocalrelay::crypto::SessionKey;
use vocalrelay::media_transport::MediaSocket;
use vocalrelay::relay::MediaRelay;
use vocalrelay::session::Session;
use vocalrelay::signaling::{SignalType, SignalingServer};

#[derive(Debug, Parser)]
#[command(name = "vocalrelay", about = "Peer-to-peer voice chat client, relay, and signaling fabric")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Optional TOML config file; overridden by any flags below.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a media session against a single peer.
    Client {
        #[arg(short = 'l', long, default_value_t = 40000)]
        local_port: u16,
        #[arg(short = 'p', long)]
        peer: SocketAddr,
        #[arg(long)]
        input_device: Option<String>,
        #[arg(long)]
        output_device: Option<String>,
    },
    /// Run the media relay standalone.
    Relay {
        #[arg(short = 'l', long, default_value_t = 40001)]
        port: u16,
    },
    /// Run the signaling router standalone.
    Signal {
        #[arg(short = 'l', long, default_value_t = 40002)]
        port: u16,
    },
    /// List available audio devices and exit.
    Devices,
}

fn main() {
    let file_appender = rolling::daily("logs", "vocalrelay.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let subscriber_result = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_timer(fmt::time::OffsetTime::local_rfc_3339().unwrap_or_else(|_| {
                    fmt::time::OffsetTime::local_rfc_3339().expect("local time unavailable")
                }))
                .with_ansi(false),
        )
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .try_init();
    if subscriber_result.is_err() {
        eprintln!("warning: tracing subscriber already initialized");
    }

    std::panic::set_hook(Box::new(|panic_info| {
        error!("panic occurred: {panic_info}");
    }));

    let exit_code = match run() {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "fatal error");
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::from_file(path).context("loading config file"),
        None => Ok(Config::default()),
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Devices => run_devices(),
        Command::Relay { port } => run_relay(port),
        Command::Signal { port } => run_signal(port),
        Command::Client {
            local_port,
            peer,
            input_device,
            output_device,
        } => run_client(&config, local_port, peer, input_device, output_device),
    }
}

fn run_devices() -> Result<()> {
    let audio = AudioIo::new();
    for dev in audio.enumerate() {
        println!(
            "[{}] {} (in={} out={} rates={:?})",
            dev.id, dev.name, dev.max_input_channels, dev.max_output_channels, dev.supported_rates
        );
    }
    Ok(())
}

fn install_ctrlc(running: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("installing ctrl-c handler")
}

fn run_relay(port: u16) -> Result<()> {
    let socket = Arc::new(MediaSocket::bind(&format!("0.0.0.0:{port}"))?);
    let relay = Arc::new(MediaRelay::new(socket));
    relay.start();
    info!(port, "media relay running");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc(Arc::clone(&running))?;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    relay.stop();
    let (forwarded, failed) = relay.stats();
    info!(forwarded, failed, "media relay stopped");
    Ok(())
}

fn run_signal(port: u16) -> Result<()> {
    let server = SignalingServer::bind(&format!("0.0.0.0:{port}"))?;
    server.register_callback(SignalType::Error, |msg| {
        error!(sender = %msg.sender, "signaling ERROR message");
    });
    server.start();
    info!(port, "signaling router running");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc(Arc::clone(&running))?;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    server.stop();
    info!("signaling router stopped");
    Ok(())
}

fn run_client(
    config: &Config,
    local_port: u16,
    peer: SocketAddr,
    input_device: Option<String>,
    output_device: Option<String>,
) -> Result<()> {
    let socket = Arc::new(MediaSocket::bind(&format!("0.0.0.0:{local_port}"))?);
    let audio = AudioIo::new();
    // Long-term key is provisioned out of band in a real deployment; an
    // ephemeral one is generated here since no-key-exchange is in scope.
    let key = SessionKey::generate(config.kdf_iterations);

    let session = Session::start(
        config,
        socket,
        peer,
        &key,
        &audio,
        input_device.as_deref(),
        output_device.as_deref(),
    )
    .context("starting session")?;
    info!(%peer, "session running, sending audio");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc(Arc::clone(&running))?;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    session.hangup();
    Ok(())
}
