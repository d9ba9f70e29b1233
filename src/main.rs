use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use livecast::config::{AppConfig, ConfigStore};
use livecast::events::EventBus;
use livecast::stream::rtmp::flv;
use livecast::stream::{
    LoggingChecker, MediaPacket, NetworkPublisherFactory, PublishOptions, SessionOptions,
    StreamingSession,
};
use livecast::video::format::Resolution;
use livecast::video::uvc::enumerate_devices;
use livecast::video::{Surface, UvcSource, VideoSource};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// livecast command line arguments
#[derive(Parser, Debug)]
#[command(name = "livecast")]
#[command(version, about = "Camera capture and live streaming", long_about = None)]
struct CliArgs {
    /// Data directory path (default: $HOME/.config/livecast)
    #[arg(short = 'd', long, value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List V4L2 capture devices and their formats
    Devices,

    /// Capture from a V4L2 device and report the frame rate
    Capture {
        /// Device node (default: first capture device found)
        #[arg(long)]
        device: Option<PathBuf>,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        #[arg(long)]
        fps: Option<u32>,
        /// Stop after this many seconds (default: run until Ctrl-C)
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Publish a raw H.264 Annex-B file to an RTMP or UDP endpoint
    Publish {
        /// H.264 elementary stream
        file: PathBuf,
        /// Server URL (default: stream.url from the config)
        #[arg(long)]
        url: Option<String>,
        /// Stream key (default: stream.key from the config)
        #[arg(long)]
        key: Option<String>,
        /// Frame rate used to pace the file
        #[arg(long, default_value_t = 30)]
        fps: u32,
        /// Start over at the end of the file
        #[arg(long = "loop")]
        repeat: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_format);

    let data_dir = args.data_dir.unwrap_or_else(get_data_dir);
    tracing::debug!("Data directory: {}", data_dir.display());
    let config_store = ConfigStore::new(&data_dir.join("config.json")).await?;
    let config = config_store.get();

    match args.command {
        Command::Devices => list_devices(),
        Command::Capture {
            device,
            width,
            height,
            fps,
            seconds,
        } => {
            let width = width.unwrap_or(config.camera.width);
            let height = height.unwrap_or(config.camera.height);
            let fps = fps.unwrap_or(config.camera.fps);
            run_capture(device, Resolution::new(width, height), fps, seconds).await
        }
        Command::Publish {
            file,
            url,
            key,
            fps,
            repeat,
        } => {
            let url = url.unwrap_or_else(|| config.stream.url.clone());
            let key = key.unwrap_or_else(|| config.stream.key.clone());
            run_publish(&config, &file, &url, &key, fps, repeat).await
        }
        Command::Config => {
            println!("# {}", config_store.path().display());
            println!("{}", serde_json::to_string_pretty(&*config)?);
            Ok(())
        }
    }
}

fn list_devices() -> anyhow::Result<()> {
    let devices = enumerate_devices()?;
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for device in devices {
        println!(
            "{}: {} ({}, {})",
            device.path.display(),
            device.name,
            device.driver,
            device.bus_info
        );
        for format in &device.formats {
            println!("  {} ({})", format.format, format.description);
            for (size, rates) in &format.sizes {
                let rates: Vec<String> = rates.iter().map(u32::to_string).collect();
                println!("    {} @ {} fps", size, rates.join("/"));
            }
        }
    }
    Ok(())
}

async fn run_capture(
    device: Option<PathBuf>,
    resolution: Resolution,
    fps: u32,
    seconds: Option<u64>,
) -> anyhow::Result<()> {
    let path = match device {
        Some(path) => path,
        None => enumerate_devices()?
            .into_iter()
            .next()
            .map(|d| d.path)
            .ok_or_else(|| anyhow::anyhow!("No capture devices found"))?,
    };

    let source = UvcSource::new(&path);
    source.create(resolution.width, resolution.height, fps, 0)?;
    let surface = Arc::new(Surface::new(resolution));
    let mut frames = surface.subscribe();
    source.start(surface.clone()).await?;
    tracing::info!("Capturing {} from {}", resolution, path.display());

    let stop_after = async {
        match seconds {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(stop_after);
    let mut window_start = Instant::now();
    let mut window_frames = 0u32;
    let mut window_bytes = 0usize;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut stop_after => break,
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    window_frames += 1;
                    window_bytes += frame.len();
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Skipped {} frames", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }

        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            println!(
                "{:.1} fps, {} KiB/frame, state {:?}",
                window_frames as f64 / elapsed.as_secs_f64(),
                window_bytes / window_frames.max(1) as usize / 1024,
                source.state()
            );
            window_start = Instant::now();
            window_frames = 0;
            window_bytes = 0;
        }
    }

    source.stop().await?;
    println!("{} frames captured", source.frames_captured());
    Ok(())
}

/// Group NAL units into access units: each picture slice closes one
fn access_units(data: &[u8]) -> Vec<(Vec<u8>, bool)> {
    let mut units = Vec::new();
    let mut current = Vec::new();
    let mut keyframe = false;
    for nal in flv::split_annexb(data) {
        current.extend_from_slice(&[0, 0, 0, 1]);
        current.extend_from_slice(nal);
        match flv::nal_type(nal) {
            Some(flv::NAL_SLICE_IDR) => keyframe = true,
            Some(1) => {}
            _ => continue,
        }
        units.push((std::mem::take(&mut current), keyframe));
        keyframe = false;
    }
    units
}

async fn run_publish(
    config: &AppConfig,
    file: &Path,
    url: &str,
    key: &str,
    fps: u32,
    repeat: bool,
) -> anyhow::Result<()> {
    let data = tokio::fs::read(file).await?;
    let units = access_units(&data);
    if units.is_empty() {
        anyhow::bail!("{} contains no H.264 pictures", file.display());
    }
    tracing::info!("{} access units in {}", units.len(), file.display());

    let events = Arc::new(EventBus::new());
    let mut stream_events = events.subscribe_topic("stream.*");
    tokio::spawn(async move {
        while let Some(event) = stream_events.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                tracing::debug!("{}", json);
            }
        }
    });

    let mut options = PublishOptions::from_config(config);
    options.fps = fps;
    options.audio = None;
    let session = StreamingSession::new(
        Arc::new(NetworkPublisherFactory::new(options)),
        SessionOptions::from(&config.stream),
        Arc::new(LoggingChecker),
    );
    session.set_event_bus(events);

    session.connect(url, key).await?;
    session.start_publishing().await?;

    let frame_ms = 1000 / fps.max(1) as u64;
    let mut ticker = tokio::time::interval(Duration::from_millis(frame_ms));
    let mut state = session.state_watch();
    let mut pts = 0u64;

    'outer: loop {
        for (unit, keyframe) in &units {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break 'outer,
                _ = state.changed() => {
                    if !session.is_connected() {
                        tracing::error!("Stream ended: {}", session.state());
                        break 'outer;
                    }
                }
                _ = ticker.tick() => {}
            }
            session.push(MediaPacket::video(unit.clone(), pts, *keyframe));
            pts += frame_ms;
        }
        if !repeat {
            break;
        }
    }

    session.disconnect().await;
    session.flush_callbacks().await;
    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8, format: LogFormat) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "livecast=error",
        LogLevel::Warn => "livecast=warn",
        LogLevel::Info => "livecast=info",
        LogLevel::Verbose => "livecast=debug",
        LogLevel::Debug => "livecast=debug,v4l=debug",
        LogLevel::Trace => "livecast=trace,v4l=debug",
    };

    // RUST_LOG wins
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("LIVECAST_DATA_DIR") {
        return PathBuf::from(path);
    }

    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".config").join("livecast"),
        Err(_) => PathBuf::from(".livecast"),
    }
}
