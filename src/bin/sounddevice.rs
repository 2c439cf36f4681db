//! Sounddevice bridge
//!
//! Captures the input device onto the detect channel, plays payloads
//! delivered to configured consumer queues, and offers a few inspection
//! commands.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aurora_sounddevice::{
    audio::{
        capture::AudioCaptureBridge,
        device::{device_info, list_devices, AudioDeviceInfo, Direction},
        playback::AudioPlaybackBridge,
    },
    broker::{BrokerSession, PublishOptions},
    config::{AppConfig, ChannelName},
    handlers::builtin_registry,
};

#[derive(Parser)]
#[command(name = "sounddevice", version, about = "Audio device bridge for the message fabric")]
struct Cli {
    /// Configuration file
    #[arg(long, short, env = "AURORA_SOUNDDEVICE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration
    Config {
        #[arg(long, value_enum)]
        section: Option<Section>,
        #[arg(long, value_enum, default_value_t = Format::Toml)]
        format: Format,
    },
    /// Show the configured input and output devices
    Info {
        /// List every device instead
        #[arg(long)]
        all: bool,
        #[arg(long, value_enum, default_value_t = Format::Toml)]
        format: Format,
    },
    /// Stream the input device to the detect channel
    Listen,
    /// Run the configured consumer queues
    Consume,
    /// Play a file locally, or publish it to a channel
    Play {
        file: PathBuf,
        /// Publish to this channel instead of playing
        #[arg(long)]
        queue: Option<ChannelName>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Section {
    Input,
    Output,
    Decoder,
    Queues,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Toml,
    Json,
}

#[derive(Serialize)]
struct DeviceReport {
    input: Vec<AudioDeviceInfo>,
    output: Vec<AudioDeviceInfo>,
}

fn render<T: Serialize>(value: &T, format: Format) -> Result<String> {
    Ok(match format {
        Format::Json => serde_json::to_string_pretty(value)?,
        Format::Toml => toml::to_string_pretty(value)?,
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

fn print_config(config: &AppConfig, section: Option<Section>, format: Format) -> Result<()> {
    let text = match section {
        None => render(config, format)?,
        Some(Section::Input) => render(&config.input, format)?,
        Some(Section::Output) => render(&config.output, format)?,
        Some(Section::Decoder) => render(&config.decoder, format)?,
        Some(Section::Queues) => render(&config.queues, format)?,
    };
    println!("{}", text);
    Ok(())
}

fn print_devices(config: &AppConfig, all: bool, format: Format) -> Result<()> {
    let report = if all {
        DeviceReport {
            input: list_devices(Direction::Input)?,
            output: list_devices(Direction::Output)?,
        }
    } else {
        DeviceReport {
            input: vec![device_info(&config.input.device, Direction::Input)?],
            output: vec![device_info(&config.output.device, Direction::Output)?],
        }
    };
    println!("{}", render(&report, format)?);
    Ok(())
}

async fn listen(config: AppConfig) -> Result<()> {
    let session = BrokerSession::connect(&config.queues).await?;
    let bridge = AudioCaptureBridge::new(config.input.clone(), session.publisher(), config.source.clone());
    let result = bridge.listen(shutdown_signal()).await;
    session.close().await?;
    result?;
    Ok(())
}

async fn consume(config: AppConfig) -> Result<()> {
    let session = BrokerSession::connect(&config.queues).await?;
    let registry = builtin_registry(&config);
    tracing::info!(
        "Handlers available: {}",
        registry.names().collect::<Vec<_>>().join(", ")
    );
    let result = session.consume_loop(registry).run(shutdown_signal()).await;
    session.close().await?;
    result?;
    Ok(())
}

async fn play(config: AppConfig, file: PathBuf, queue: Option<ChannelName>) -> Result<()> {
    if !file.is_file() {
        bail!("No such file: {}", file.display());
    }

    match queue {
        Some(channel) => {
            let body = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let session = BrokerSession::connect(&config.queues).await?;
            let hash = session
                .publisher()
                .publish(Bytes::from(body), channel, &PublishOptions::with_source(&config.source))
                .await?;
            tracing::info!("Published {} to {}", file.display(), channel);
            println!("{}", hash);
            session.close().await?;
        }
        None => {
            let bridge = AudioPlaybackBridge::new(config.output.clone(), config.decoder.clone());
            let end = tokio::task::spawn_blocking(move || bridge.play(&file)).await??;
            tracing::info!("Playback ended: {:?}", end);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Config { section, format } => print_config(&config, section, format),
        Command::Info { all, format } => print_devices(&config, all, format),
        Command::Listen => listen(config).await,
        Command::Consume => consume(config).await,
        Command::Play { file, queue } => play(config, file, queue).await,
    }
}
