use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Result};
use clap::Parser;
use road_sentinel::config::Config;
use road_sentinel::classifier::SignalClassifier;
use road_sentinel::sensors::{read_replay, ReplayLine};
use road_sentinel::storage::KvStore;
use road_sentinel::testing::MockBackend;
use road_sentinel::transmission::TransmissionPipeline;
use road_sentinel::types::{EventType, VehicleClass};
use serde::Serialize;
use serde_json::json;

/// Run recorded drives through the classifier and the batching pipeline
/// against an in-process backend, and report what would have been sent.
#[derive(Parser, Debug)]
struct Args {
    /// Path to a *.jsonl[.gz] recording
    #[arg(long, conflicts_with = "golden_dir")]
    log: Option<PathBuf>,

    /// Directory of recordings to batch replay
    #[arg(long)]
    golden_dir: Option<PathBuf>,

    #[arg(long, default_value = "car")]
    vehicle_class: VehicleClass,

    /// Batch trigger size
    #[arg(long, default_value = "50")]
    batch_size: usize,

    /// Simulate a dead link: everything goes to the offline queue
    #[arg(long, default_value_t = false)]
    offline: bool,

    /// Print the report as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Default, Serialize)]
struct ReplayReport {
    file: String,
    samples: usize,
    fixes: usize,
    events: BTreeMap<String, usize>,
    severity: [usize; 5],
    critical: usize,
    road_type: String,
    batches_sent: u64,
    batches_queued: usize,
    points_delivered: usize,
    events_delivered: usize,
}

fn event_name(event_type: EventType) -> String {
    serde_json::to_value(event_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", event_type))
}

async fn replay_file(path: &Path, args: &Args) -> Result<ReplayReport> {
    let lines: Vec<ReplayLine> = read_replay(path)?;
    let store_dir = std::env::temp_dir().join(format!("road_sentinel_replay_{}", std::process::id()));
    // Start from an empty queue every run
    let _ = fs::remove_dir_all(&store_dir);
    let store = KvStore::open(&store_dir)?;

    let mut config = Config::default();
    config.transmission.batch_size = args.batch_size.max(1);
    config.transmission.buffer_capacity = config.transmission.buffer_capacity.max(config.transmission.batch_size);
    config.transmission.drain_delay_ms = 0;

    let backend = Rc::new(if args.offline {
        MockBackend::offline()
    } else {
        MockBackend::online()
    });
    let pipeline = TransmissionPipeline::new(backend.clone(), store, "replay", config.transmission.clone());
    let mut classifier = SignalClassifier::new(config.classifier.clone(), args.vehicle_class);

    let mut report = ReplayReport {
        file: path.display().to_string(),
        ..Default::default()
    };
    let mut window = Vec::new();
    let mut last_fix = None;

    for line in lines {
        if let Some(sample) = line.accel {
            report.samples += 1;
            window.push(sample);
            if let Some(event) = classifier.process(sample) {
                *report.events.entry(event_name(event.event_type)).or_default() += 1;
                if let Some(slot) = report.severity.get_mut(usize::from(event.severity.saturating_sub(1))) {
                    *slot += 1;
                }
                if event.is_critical() {
                    report.critical += 1;
                }
                pipeline.add_event(&event, last_fix.as_ref()).await;
            }
        }
        if let Some(fix) = line.gps {
            report.fixes += 1;
            pipeline.add_data_point(&fix, std::mem::take(&mut window)).await;
            last_fix = Some(fix);
        }
    }
    pipeline.flush().await;

    report.road_type = format!("{:?}", classifier.road_type());
    report.batches_sent = pipeline.stats().sent_batches;
    report.batches_queued = pipeline.queue_len();
    report.points_delivered = backend.raw_requests.borrow().iter().map(|r| r.data.len()).sum();
    report.events_delivered = backend.sensor_requests.borrow().iter().map(|r| r.sensor_data.len()).sum();

    let _ = fs::remove_dir_all(&store_dir);
    Ok(report)
}

fn print_report(report: &ReplayReport) {
    println!("=== {} ===", report.file);
    println!("  Samples: {}  Fixes: {}  Road: {}", report.samples, report.fixes, report.road_type);
    for (name, count) in &report.events {
        println!("  {:<10} {}", name, count);
    }
    println!(
        "  Severity 1..5: {:?}  (critical sent immediately: {})",
        report.severity, report.critical
    );
    println!(
        "  Batches sent: {}  queued: {}  points: {}  events: {}",
        report.batches_sent, report.batches_queued, report.points_delivered, report.events_delivered
    );
}

fn collect_logs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut logs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            name.ends_with(".jsonl") || name.ends_with(".jsonl.gz")
        })
        .collect();
    logs.sort();
    Ok(logs)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let logs = match (&args.log, &args.golden_dir) {
        (Some(log), _) => vec![log.clone()],
        (None, Some(dir)) => collect_logs(dir)?,
        (None, None) => bail!("Pass --log <file> or --golden-dir <dir>"),
    };
    if logs.is_empty() {
        bail!("No recordings found");
    }

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let mut reports = Vec::new();
    for log in &logs {
        let report = runtime.block_on(replay_file(log, &args))?;
        if !args.json {
            print_report(&report);
        }
        reports.push(report);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&json!({ "reports": reports }))?);
    }
    Ok(())
}
