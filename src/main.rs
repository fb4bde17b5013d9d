use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use road_sentinel::alerts::{self, AlertSettings, AlertSettingsOverrides, LogAudio, LogSpeech};
use road_sentinel::backend::HttpBackend;
use road_sentinel::config::{self, Config, ConfigOverrides};
use road_sentinel::lifecycle::stop_pair;
use road_sentinel::sensors::{self, MockDrive};
use road_sentinel::session::{session_channels, DrivingSession, SessionCommand};
use road_sentinel::storage::KvStore;
use road_sentinel::types::VehicleClass;
use std::path::PathBuf;
use std::rc::Rc;
use tokio::task::LocalSet;
use tokio::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "road_sentinel")]
#[command(about = "Road event detection, telemetry upload and hazard alerts", long_about = None)]
struct Args {
    /// Duration in seconds (0 = until input ends or Ctrl-C)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON config override file
    #[arg(long, default_value = "road_sentinel.json")]
    config: PathBuf,

    /// Device id reported to the backend
    #[arg(long)]
    device_id: Option<String>,

    /// Vehicle class (car, suv, van, truck, motorcycle)
    #[arg(long)]
    vehicle_class: Option<VehicleClass>,

    /// Backend base URL
    #[arg(long)]
    backend_url: Option<String>,

    /// Directory for persisted state (queue, profile, reactions, settings)
    #[arg(long, default_value = "road_sentinel_store")]
    store_dir: PathBuf,

    /// Replay a JSON-lines recording instead of the synthetic drive
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Replay speed multiplier (0 = as fast as possible)
    #[arg(long, default_value = "1.0")]
    speedup: f64,

    /// Collect calibration samples for this many seconds at startup
    #[arg(long, default_value = "0")]
    calibrate_secs: u64,

    /// JSON alert settings overrides, merged into the stored settings
    #[arg(long)]
    alert_settings: Option<PathBuf>,

    /// Live status output file
    #[arg(long, default_value = "live_status.json")]
    status_file: PathBuf,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::default();
        overrides.device.device_id = self.device_id.clone();
        overrides.device.vehicle_class = self.vehicle_class;
        overrides.backend.base_url = self.backend_url.clone();
        overrides
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let file_config = Config::load(&args.config)
        .with_context(|| format!("Invalid config file {}", args.config.display()))?;
    let config = config::merge(&file_config, &args.overrides()).context("Invalid command line overrides")?;

    log::info!("[{}] Road Sentinel starting", ts_now());
    log::info!("  Device: {} ({:?})", config.device.device_id, config.device.vehicle_class);
    log::info!("  Backend: {}", config.backend.base_url);
    log::info!("  Store: {}", args.store_dir.display());
    log::info!("  Duration: {} seconds (0=continuous)", args.duration);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    let local = LocalSet::new();
    local.block_on(&runtime, run(args, config))
}

async fn run(args: Args, config: Config) -> Result<()> {
    let store = KvStore::open(&args.store_dir)?;
    if let Some(path) = &args.alert_settings {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read alert settings {}", path.display()))?;
        let overrides: AlertSettingsOverrides = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid alert settings {}", path.display()))?;
        let settings = alerts::merge(&AlertSettings::load(&store), &overrides)?;
        settings.save(&store)?;
        log::info!("Alert settings updated from {}", path.display());
    }
    let backend = Rc::new(HttpBackend::new(&config.backend));
    let session = DrivingSession::new(config, backend, store, Rc::new(LogSpeech), Rc::new(LogAudio))
        .with_status_file(&args.status_file);

    let (senders, inputs) = session_channels(500);
    let (input_stop, input_token) = stop_pair();

    match &args.replay {
        Some(path) => {
            let lines = sensors::read_replay(path)?;
            log::info!("Replaying {} lines from {}", lines.len(), path.display());
            tokio::task::spawn_local(sensors::replay_loop(
                lines,
                senders.samples.clone(),
                senders.fixes.clone(),
                args.speedup,
                input_token,
            ));
        }
        None => {
            let drive = MockDrive::default();
            tokio::task::spawn_local(sensors::mock_accel_loop(
                senders.samples.clone(),
                drive.clone(),
                input_token.clone(),
            ));
            tokio::task::spawn_local(sensors::mock_gps_loop(senders.fixes.clone(), drive, input_token));
        }
    }

    // Treat the backend as reachable at startup so any persisted queue drains
    let _ = senders.connectivity.send(true).await;

    if args.calibrate_secs > 0 {
        let commands = senders.commands.clone();
        let secs = args.calibrate_secs;
        tokio::task::spawn_local(async move {
            let _ = commands.send(SessionCommand::StartCalibration).await;
            tokio::time::sleep(Duration::from_secs(secs)).await;
            let _ = commands
                .send(SessionCommand::SubmitCalibration {
                    speed_kmh: 0.0,
                    road_type: Default::default(),
                })
                .await;
        });
    }

    let commands = senders.commands.clone();
    let duration = args.duration;
    tokio::task::spawn_local(async move {
        if duration > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(duration)) => {
                    log::info!("[{}] Duration reached, stopping...", ts_now());
                }
                _ = tokio::signal::ctrl_c() => {}
            }
        } else {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = commands.send(SessionCommand::Stop).await;
    });

    // Only the input tasks keep the sensor channels open
    drop(senders);

    let summary = session.run(inputs).await;
    input_stop.stop();

    log::info!("=== Final Stats ===");
    log::info!("Samples: {}  Fixes: {}", summary.samples, summary.fixes);
    log::info!("Events: {} ({} critical)", summary.events, summary.critical_events);
    log::info!("Driver reactions: {}", summary.reactions);
    if let Some(status) = summary.transmission {
        log::info!(
            "Batches sent: {}  queued: {}  failed: {}  evicted: {}",
            status.stats.sent_batches,
            status.queued,
            status.stats.failed_batches,
            status.stats.evicted_batches
        );
    }
    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
