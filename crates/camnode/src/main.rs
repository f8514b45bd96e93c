//! camnode device control plane.
//!
//! Streams MJPEG over HTTP and serves MQTT commands for one camera node,
//! backed by the host simulation drivers.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use camnode_lib::bus::Topics;
use camnode_lib::camera::{Camera, FrameSource};
use camnode_lib::capture::{CapturePipeline, CaptureSettings};
use camnode_lib::config_store::ConfigStore;
use camnode_lib::control::{ControlLoop, ExitReason};
use camnode_lib::mqtt::{LinkSettings, MqttLink};
use camnode_lib::publisher::StatusPublisher;
use camnode_lib::router::{CommandRouter, Devices};
use camnode_lib::sim::{DirectoryCamera, HostProbe, LoggingActuators, StaticSensors};
use camnode_lib::store::{FileKvStore, KvStore};
use camnode_lib::stream::{StreamServer, DEFAULT_MAX_VIEWERS};
use camnode_lib::upload::{UploadSettings, Uploader};
use camnode_lib::voice::{self, VoiceCommand};
use camnode_telemetry::{log_shutdown, log_startup, LogFormat, Telemetry, TelemetryConfig};

/// Pause before rebuilding a control loop whose link closed.
const LINK_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "camnode", about = "camnode device control plane", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the stream server and the command loop.
    Serve {
        /// Stream server listen address.
        #[arg(long, env = "CAMNODE_LISTEN", default_value = "0.0.0.0:8081")]
        listen: String,

        /// Path of the persisted device config.
        #[arg(long, env = "CAMNODE_STORE", default_value = "camnode-config.json")]
        store: PathBuf,

        /// Directory of JPEG files served by the simulated camera.
        #[arg(long, env = "CAMNODE_FRAMES")]
        frames: Option<PathBuf>,

        /// Simulated camera frame rate.
        #[arg(long, env = "CAMNODE_FPS", default_value = "30")]
        fps: u32,

        /// Voice channel device or file; `-` reads stdin.
        #[arg(long, env = "CAMNODE_VOICE")]
        voice: Option<String>,

        /// Concurrent stream viewers.
        #[arg(long, env = "CAMNODE_MAX_VIEWERS", default_value_t = DEFAULT_MAX_VIEWERS)]
        max_viewers: usize,

        /// Log level.
        #[arg(long, env = "CAMNODE_LOG_LEVEL", default_value = "info")]
        log_level: String,

        /// Log format (json, pretty or compact).
        #[arg(long, env = "CAMNODE_LOG_FORMAT", default_value = "json")]
        log_format: String,

        /// Pause after switching to capture resolution, in milliseconds.
        #[arg(long, env = "CAMNODE_SETTLE_DELAY_MS", default_value = "300")]
        settle_delay_ms: u64,

        /// Upload response timeout, in seconds.
        #[arg(long, env = "CAMNODE_UPLOAD_TIMEOUT_SECS", default_value = "15")]
        upload_timeout_secs: u64,
    },

    /// Print the persisted device config as JSON, password redacted.
    ShowConfig {
        /// Path of the persisted device config.
        #[arg(long, env = "CAMNODE_STORE", default_value = "camnode-config.json")]
        store: PathBuf,
    },
}

struct ServeOptions {
    listen: String,
    store: PathBuf,
    frames: Option<PathBuf>,
    fps: u32,
    voice: Option<String>,
    max_viewers: usize,
    capture: CaptureSettings,
    upload: UploadSettings,
}

fn open_store(path: &Path) -> anyhow::Result<Arc<dyn KvStore>> {
    let store = FileKvStore::open(path)
        .with_context(|| format!("failed to open config store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn run_show_config(store: &Path) -> ExitCode {
    let store = match open_store(store) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(1);
        }
    };

    let config = ConfigStore::load(store);
    match serde_json::to_string_pretty(&config.config().redacted()) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}

fn open_camera(frames: Option<&Path>, fps: u32) -> anyhow::Result<Arc<dyn Camera>> {
    let camera = match frames {
        Some(dir) => DirectoryCamera::open(dir, fps)?,
        None => {
            tracing::warn!("No frames directory given, serving a placeholder image");
            DirectoryCamera::from_frames(Vec::new(), fps)
        }
    };
    Ok(Arc::new(camera))
}

async fn open_voice(source: &str) -> anyhow::Result<mpsc::Receiver<VoiceCommand>> {
    let (tx, rx) = mpsc::channel(8);
    if source == "-" {
        voice::spawn_reader(tokio::io::stdin(), tx);
    } else {
        let file = tokio::fs::File::open(source)
            .await
            .with_context(|| format!("failed to open voice channel {source}"))?;
        voice::spawn_reader(file, tx);
    }
    tracing::info!(source = %source, "Voice channel open");
    Ok(rx)
}

/// Run the serve command until shutdown.
async fn run_serve(options: ServeOptions, telemetry: &Telemetry) -> anyhow::Result<()> {
    let metrics = telemetry.metrics();
    let store = open_store(&options.store)?;

    let devices = Devices {
        camera: open_camera(options.frames.as_deref(), options.fps)?,
        actuators: Arc::new(LoggingActuators),
        sensors: Arc::new(StaticSensors::default()),
        probe: Arc::new(HostProbe::new()),
    };
    let frames = FrameSource::new(Arc::clone(&devices.camera));

    let addr: SocketAddr = options
        .listen
        .parse()
        .with_context(|| format!("invalid listen address: {}", options.listen))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    let server = StreamServer::new(frames.clone(), options.max_viewers, Arc::clone(&metrics));
    let server_task = tokio::spawn(server.serve(listener, shutdown_rx.clone()));

    let mut voice = match &options.voice {
        Some(source) => Some(open_voice(source).await?),
        None => None,
    };

    // Each pass is one boot: config is reloaded and outputs return to their
    // boot positions. The stream server keeps running across passes.
    while !*shutdown_rx.borrow() {
        let config = ConfigStore::load(Arc::clone(&store));
        let settings = LinkSettings::from_config(config.config());
        let topics = Topics::for_client(&settings.client_id);
        let (link, publisher) = MqttLink::start(&settings, &topics);

        let status = StatusPublisher::new(
            Arc::new(publisher),
            &settings.client_id,
            Arc::clone(&devices.camera),
            Arc::clone(&devices.probe),
            Arc::clone(&metrics),
        );
        let uploader = Uploader::new(options.upload)?;
        let capture = CapturePipeline::new(
            frames.clone(),
            uploader,
            options.capture,
            Arc::clone(&metrics),
        );
        let router = CommandRouter::new(config, &devices, capture, status, Arc::clone(&metrics));

        let mut control = ControlLoop::new(router, link, shutdown_rx.clone());
        if let Some(rx) = voice.take() {
            control = control.with_voice(rx);
        }

        let reason = control.run().await;
        voice = control.into_voice();

        match reason {
            ExitReason::Restart => tracing::info!("Restarting control loop with persisted config"),
            ExitReason::LinkClosed => {
                tracing::warn!("Command link closed, restarting control loop");
                tokio::time::sleep(LINK_RETRY_DELAY).await;
            }
            ExitReason::Shutdown => break,
        }
    }

    if let Err(e) = server_task.await {
        tracing::warn!(error = %e, "Stream server task failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::ShowConfig { store } => run_show_config(&store),
        Commands::Serve {
            listen,
            store,
            frames,
            fps,
            voice,
            max_viewers,
            log_level,
            log_format,
            settle_delay_ms,
            upload_timeout_secs,
        } => {
            let log_format = match log_format.parse::<LogFormat>() {
                Ok(format) => format,
                Err(e) => {
                    eprintln!("error: {e}");
                    return ExitCode::from(1);
                }
            };
            let config = TelemetryConfig::new()
                .with_log_level(log_level)
                .with_log_format(log_format);
            let telemetry = match Telemetry::init(config) {
                Ok(telemetry) => telemetry,
                Err(e) => {
                    eprintln!("error: {e}");
                    return ExitCode::from(1);
                }
            };

            log_startup!(
                node = %telemetry.config().node,
                version = env!("CARGO_PKG_VERSION"),
                "camnode starting"
            );

            let options = ServeOptions {
                listen,
                store,
                frames,
                fps,
                voice,
                max_viewers,
                capture: CaptureSettings {
                    settle_delay: Duration::from_millis(settle_delay_ms),
                    ..CaptureSettings::default()
                },
                upload: UploadSettings {
                    response_timeout: Duration::from_secs(upload_timeout_secs),
                    ..UploadSettings::default()
                },
            };

            match run_serve(options, &telemetry).await {
                Ok(()) => {
                    log_shutdown!("camnode stopped");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    tracing::error!(error = %format!("{e:#}"), "camnode failed");
                    ExitCode::from(1)
                }
            }
        }
    }
}
