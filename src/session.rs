//! One driving session: wires calibration, classification, transmission,
//! hazard tracking and alerting around a single cooperative event loop.
//!
//! [`DrivingSession::run`] must be awaited inside a `tokio::task::LocalSet`:
//! network work (batch sends, queue drains, obstacle polls) is spawned as
//! local tasks so the loop keeps ticking while requests are in flight.

use crate::alerts::{AlertOrchestrator, AlertSettings, AudioOutput, SpeechOutput};
use crate::backend::{Backend, NearbyObstaclesResponse};
use crate::calibration::CalibrationManager;
use crate::classifier::SignalClassifier;
use crate::config::Config;
use crate::error::Result;
use crate::lifecycle::{stop_pair, StopHandle, StopToken};
use crate::live_status::{current_timestamp, LiveStatus};
use crate::proximity::{tick_interval, ProximityTracker};
use crate::storage::KvStore;
use crate::transmission::{PipelineStatus, TransmissionPipeline};
use crate::types::{AccelerationSample, DetectedEvent, LocationFix, RoadType, Warning};
use std::future::Future;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Samples kept between two location fixes
const ACCEL_WINDOW_CAP: usize = 100;
const STATUS_INTERVAL: Duration = Duration::from_secs(2);
/// Retry delay for the first obstacle poll while no fix is known yet
const NO_FIX_POLL_RETRY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq)]
pub enum SessionCommand {
    StartCalibration,
    SubmitCalibration { speed_kmh: f64, road_type: RoadType },
    ResetCalibration,
    Dismiss(String),
    Stop,
}

/// Producer side of the session inputs
#[derive(Clone)]
pub struct SessionSenders {
    pub samples: mpsc::Sender<AccelerationSample>,
    pub fixes: mpsc::Sender<LocationFix>,
    pub connectivity: mpsc::Sender<bool>,
    pub commands: mpsc::Sender<SessionCommand>,
}

pub struct SessionInputs {
    samples: mpsc::Receiver<AccelerationSample>,
    fixes: mpsc::Receiver<LocationFix>,
    connectivity: mpsc::Receiver<bool>,
    commands: mpsc::Receiver<SessionCommand>,
}

pub fn session_channels(capacity: usize) -> (SessionSenders, SessionInputs) {
    let (samples_tx, samples) = mpsc::channel(capacity);
    let (fixes_tx, fixes) = mpsc::channel(capacity);
    let (connectivity_tx, connectivity) = mpsc::channel(16);
    let (commands_tx, commands) = mpsc::channel(16);
    (
        SessionSenders {
            samples: samples_tx,
            fixes: fixes_tx,
            connectivity: connectivity_tx,
            commands: commands_tx,
        },
        SessionInputs {
            samples,
            fixes,
            connectivity,
            commands,
        },
    )
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionSummary {
    pub samples: u64,
    pub fixes: u64,
    pub events: u64,
    pub critical_events: u64,
    pub reactions: usize,
    pub transmission: Option<PipelineStatus>,
}

pub struct DrivingSession<B: Backend + 'static, S: SpeechOutput, A: AudioOutput> {
    config: Config,
    backend: Rc<B>,
    calibration: CalibrationManager<B>,
    classifier: SignalClassifier,
    pipeline: Rc<TransmissionPipeline<B>>,
    tracker: ProximityTracker<B>,
    orchestrator: AlertOrchestrator<S, A>,
    stop: StopHandle,
    status_path: Option<PathBuf>,
    accel_window: Vec<AccelerationSample>,
    last_fix: Option<LocationFix>,
    poll_in_flight: bool,
    /// Sends, flushes and drains that must finish before shutdown returns
    pipeline_work: Vec<JoinHandle<()>>,
    started: Instant,
    summary: SessionSummary,
}

impl<B: Backend + 'static, S: SpeechOutput, A: AudioOutput> DrivingSession<B, S, A> {
    pub fn new(config: Config, backend: Rc<B>, store: KvStore, speech: Rc<S>, audio: Rc<A>) -> Self {
        let device_id = config.device.device_id.clone();
        let vehicle_class = config.device.vehicle_class;

        let calibration = CalibrationManager::new(
            backend.clone(),
            store.clone(),
            &device_id,
            vehicle_class,
            config.calibration.clone(),
        );
        let classifier = SignalClassifier::new(config.classifier.clone(), vehicle_class);
        let pipeline = Rc::new(TransmissionPipeline::new(
            backend.clone(),
            store.clone(),
            &device_id,
            config.transmission.clone(),
        ));
        let tracker = ProximityTracker::new(backend.clone(), store.clone(), config.proximity.clone());
        let orchestrator = AlertOrchestrator::new(speech, audio, AlertSettings::load(&store));
        let (stop, _) = stop_pair();

        Self {
            config,
            backend,
            calibration,
            classifier,
            pipeline,
            tracker,
            orchestrator,
            stop,
            status_path: None,
            accel_window: Vec::with_capacity(ACCEL_WINDOW_CAP),
            last_fix: None,
            poll_in_flight: false,
            pipeline_work: Vec::new(),
            started: Instant::now(),
            summary: SessionSummary::default(),
        }
    }

    /// Write a [`LiveStatus`] JSON file every two seconds while running
    pub fn with_status_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.status_path = Some(path.into());
        self
    }

    pub fn pipeline(&self) -> &TransmissionPipeline<B> {
        &self.pipeline
    }

    /// Token that fires when the session stops
    pub fn stop_token(&self) -> StopToken {
        self.stop.token()
    }

    /// Resolve the calibration profile and hand it to the classifier
    pub async fn start(&mut self) {
        let profile = self.calibration.load_profile().await;
        log::info!(
            "Session started for {} ({:?}), calibration source {:?}",
            self.config.device.device_id,
            self.config.device.vehicle_class,
            profile.source
        );
        self.classifier.set_calibration(Some(profile));
        self.started = Instant::now();
    }

    /// Run until a `Stop` command arrives, the stop handle fires, or both
    /// sensor channels close.
    pub async fn run(mut self, mut inputs: SessionInputs) -> SessionSummary {
        self.start().await;

        let (warn_tx, mut warn_rx) = mpsc::unbounded_channel::<Vec<Warning>>();
        let (poll_tx, mut poll_rx) = mpsc::unbounded_channel::<Result<NearbyObstaclesResponse>>();
        let mut stop_token = self.stop.token();

        let mut samples_open = true;
        let mut fixes_open = true;
        let mut connectivity_open = true;
        let mut commands_open = true;

        let now = Instant::now();
        let mut tick_at = now + tick_interval(0.0);
        let mut poll_at = now;
        let mut status_at = now + STATUS_INTERVAL;
        // Deadline an idle flush was already spawned for
        let mut flushed_for: Option<Instant> = None;

        loop {
            if !samples_open && !fixes_open {
                log::info!("Sensor inputs closed");
                break;
            }
            let flush_at = self.pipeline.flush_deadline().filter(|d| Some(*d) != flushed_for);
            let pulse_at = self.orchestrator.next_pulse_at();

            tokio::select! {
                _ = stop_token.stopped() => break,
                sample = inputs.samples.recv(), if samples_open => match sample {
                    Some(sample) => self.on_sample(sample, &warn_tx),
                    None => samples_open = false,
                },
                fix = inputs.fixes.recv(), if fixes_open => match fix {
                    Some(fix) => self.on_fix(fix, &warn_tx),
                    None => fixes_open = false,
                },
                online = inputs.connectivity.recv(), if connectivity_open => match online {
                    Some(online) => self.on_connectivity(online, &warn_tx),
                    None => connectivity_open = false,
                },
                command = inputs.commands.recv(), if commands_open => match command {
                    Some(SessionCommand::Stop) => break,
                    Some(command) => self.on_command(command).await,
                    None => commands_open = false,
                },
                Some(result) = poll_rx.recv() => {
                    self.poll_in_flight = false;
                    self.tracker.apply_fetch(result);
                }
                Some(warnings) = warn_rx.recv() => self.on_warnings(warnings).await,
                _ = sleep_until(tick_at) => {
                    let speed = self.on_tick().await;
                    tick_at = Instant::now() + tick_interval(speed);
                }
                _ = sleep_until(poll_at) => {
                    poll_at = Instant::now() + self.poll(&poll_tx, &warn_tx);
                }
                _ = sleep_until_opt(flush_at) => {
                    flushed_for = flush_at;
                    let pipeline = self.pipeline.clone();
                    let warn_tx = warn_tx.clone();
                    self.spawn_pipeline_work(async move {
                        forward(&warn_tx, pipeline.flush().await);
                    });
                }
                _ = sleep_until_opt(pulse_at) => {
                    self.orchestrator.play_due_pulses().await;
                }
                _ = sleep_until(status_at) => {
                    self.write_status();
                    status_at = Instant::now() + STATUS_INTERVAL;
                }
            }
        }

        self.shutdown().await
    }

    fn on_sample(&mut self, sample: AccelerationSample, warn_tx: &mpsc::UnboundedSender<Vec<Warning>>) {
        self.summary.samples += 1;
        if self.calibration.is_collecting() {
            self.calibration.add_sample(sample);
        }

        if self.accel_window.len() >= ACCEL_WINDOW_CAP {
            self.accel_window.remove(0);
        }
        self.accel_window.push(sample);

        if let Some(event) = self.classifier.process(sample) {
            self.on_event(event, warn_tx);
        }
    }

    fn on_event(&mut self, event: DetectedEvent, warn_tx: &mpsc::UnboundedSender<Vec<Warning>>) {
        self.summary.events += 1;
        if event.is_critical() {
            self.summary.critical_events += 1;
            log::warn!(
                "Critical {:?} detected: magnitude {:.2} m/s²",
                event.event_type,
                event.magnitude
            );
        } else {
            log::debug!("{:?} severity {}", event.event_type, event.severity);
        }

        let pipeline = self.pipeline.clone();
        let location = self.last_fix.clone();
        let warn_tx = warn_tx.clone();
        self.spawn_pipeline_work(async move {
            forward(&warn_tx, pipeline.add_event(&event, location.as_ref()).await);
        });
    }

    fn on_fix(&mut self, fix: LocationFix, warn_tx: &mpsc::UnboundedSender<Vec<Warning>>) {
        self.summary.fixes += 1;
        let window = std::mem::take(&mut self.accel_window);
        self.last_fix = Some(fix.clone());

        let pipeline = self.pipeline.clone();
        let warn_tx = warn_tx.clone();
        self.spawn_pipeline_work(async move {
            forward(&warn_tx, pipeline.add_data_point(&fix, window).await);
        });
    }

    fn on_connectivity(&mut self, online: bool, warn_tx: &mpsc::UnboundedSender<Vec<Warning>>) {
        let pipeline = self.pipeline.clone();
        let token = self.stop.token();
        let warn_tx = warn_tx.clone();
        self.spawn_pipeline_work(async move {
            forward(&warn_tx, pipeline.on_connectivity_change(online, &token).await);
        });
    }

    fn spawn_pipeline_work(&mut self, work: impl Future<Output = ()> + 'static) {
        self.pipeline_work.retain(|handle| !handle.is_finished());
        self.pipeline_work.push(tokio::task::spawn_local(work));
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::StartCalibration => self.calibration.start_calibration(),
            SessionCommand::SubmitCalibration { speed_kmh, road_type } => {
                match self.calibration.submit_calibration(speed_kmh, road_type).await {
                    Ok(profile) => self.classifier.set_calibration(Some(profile)),
                    Err(e) => log::warn!("Calibration not submitted: {}", e),
                }
            }
            SessionCommand::ResetCalibration => {
                self.calibration.reset_profile().await;
                self.classifier.set_calibration(Some(self.calibration.profile()));
            }
            SessionCommand::Dismiss(id) => match self.orchestrator.dismiss(&id) {
                Some(reaction) => {
                    self.summary.reactions += 1;
                    self.tracker.record_driver_reaction(reaction);
                }
                None => log::debug!("No active alert for {}", id),
            },
            SessionCommand::Stop => self.stop.stop(),
        }
    }

    async fn on_tick(&mut self) -> f64 {
        let Some(fix) = self.last_fix.clone() else {
            return 0.0;
        };
        let speed_kmh = fix.speed_kmh();
        let report = self.tracker.tick(&fix);

        let tracker = &self.tracker;
        let update = self
            .orchestrator
            .update(&report, speed_kmh, |t| tracker.alert_distance(t))
            .await;
        for reaction in update.reactions {
            self.summary.reactions += 1;
            self.tracker.record_driver_reaction(reaction);
        }
        speed_kmh
    }

    /// Kick off background obstacle and warning polls. Returns the delay
    /// until the next poll.
    fn poll(
        &mut self,
        poll_tx: &mpsc::UnboundedSender<Result<NearbyObstaclesResponse>>,
        warn_tx: &mpsc::UnboundedSender<Vec<Warning>>,
    ) -> Duration {
        let Some(fix) = &self.last_fix else {
            return NO_FIX_POLL_RETRY;
        };

        if !self.poll_in_flight && self.tracker.needs_refresh() {
            self.poll_in_flight = true;
            let query = self.tracker.query_for(fix.latitude, fix.longitude);
            let backend = self.backend.clone();
            let poll_tx = poll_tx.clone();
            tokio::task::spawn_local(async move {
                let _ = poll_tx.send(backend.nearby_obstacles(&query).await);
            });
        }

        let pipeline = self.pipeline.clone();
        let warn_tx = warn_tx.clone();
        tokio::task::spawn_local(async move {
            match pipeline.fetch_warnings().await {
                Ok(warnings) => forward(&warn_tx, warnings),
                Err(e) => log::debug!("Warning fetch failed: {}", e),
            }
        });

        self.config.proximity.poll_interval()
    }

    async fn on_warnings(&mut self, warnings: Vec<Warning>) {
        for warning in warnings {
            if self.orchestrator.announce_backend_warning(&warning).await {
                let pipeline = self.pipeline.clone();
                tokio::task::spawn_local(async move {
                    if let Err(e) = pipeline.acknowledge_warning(&warning.id).await {
                        log::warn!("Failed to acknowledge warning {}: {}", warning.id, e);
                    }
                });
            }
        }
    }

    pub fn live_status(&self) -> LiveStatus {
        let profile = self.calibration.profile();
        let (lat, lon, speed) = self
            .last_fix
            .as_ref()
            .map_or((0.0, 0.0, 0.0), |f| (f.latitude, f.longitude, f.speed_kmh()));
        LiveStatus {
            timestamp: current_timestamp(),
            uptime_seconds: self.started.elapsed().as_secs(),
            accel_samples: self.summary.samples,
            gps_fixes: self.summary.fixes,
            events_detected: self.summary.events,
            critical_events: self.summary.critical_events,
            road_type: self.classifier.road_type(),
            calibrating: self.calibration.is_collecting(),
            calibration_samples: self.calibration.collected(),
            profile_source: profile.source,
            threshold_multiplier: self.classifier.threshold_multiplier(),
            gps_lat: lat,
            gps_lon: lon,
            gps_speed_kmh: speed,
            tracked_hazards: self.tracker.active().len(),
            warnings: self.orchestrator.active_warnings(),
            transmission: self.pipeline.status(),
        }
    }

    fn write_status(&self) {
        if let Some(path) = &self.status_path {
            if let Err(e) = self.live_status().save(path) {
                log::warn!("Failed to write live status: {}", e);
            }
        }
    }

    /// Tear down tracking state, wait for in-flight sends and make one last
    /// flush attempt. Queue drains stop after their current batch.
    async fn shutdown(mut self) -> SessionSummary {
        log::info!("Stopping session");
        self.stop.stop();
        self.tracker.stop();
        self.orchestrator.clear();
        self.classifier.reset();

        let pending = std::mem::take(&mut self.pipeline_work);
        if !pending.is_empty() {
            log::debug!("Waiting for {} pipeline tasks", pending.len());
        }
        for handle in pending {
            if let Err(e) = handle.await {
                log::warn!("Pipeline task failed: {}", e);
            }
        }

        if !self.accel_window.is_empty() {
            if let Some(fix) = self.last_fix.clone() {
                let window = std::mem::take(&mut self.accel_window);
                self.pipeline.add_data_point(&fix, window).await;
            }
        }
        self.pipeline.flush().await;
        self.write_status();

        let status = self.pipeline.status();
        log::info!(
            "Session ended: {} samples, {} events, {} batches sent, {} queued",
            self.summary.samples,
            self.summary.events,
            status.stats.sent_batches,
            status.queued
        );
        self.summary.transmission = Some(status);
        self.summary
    }
}

fn forward(warn_tx: &mpsc::UnboundedSender<Vec<Warning>>, warnings: Vec<Warning>) {
    if !warnings.is_empty() {
        let _ = warn_tx.send(warnings);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
