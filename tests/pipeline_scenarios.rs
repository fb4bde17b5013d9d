//! End-to-end behaviour across classifier, transmission, proximity and alerts
//! using the in-process backend and output doubles.

use std::rc::Rc;

use road_sentinel::alerts::{AlertLevel, AlertOrchestrator, AlertSettings, AlertState};
use road_sentinel::classifier::SignalClassifier;
use road_sentinel::config::{Config, ProximityConfig, TransmissionConfig};
use road_sentinel::lifecycle::stop_pair;
use road_sentinel::proximity::ProximityTracker;
use road_sentinel::storage::KvStore;
use road_sentinel::testing::{MockBackend, RecordingAudio, RecordingSpeech};
use road_sentinel::transmission::{Priority, TransmissionPipeline};
use road_sentinel::types::{
    AccelerationSample, EventType, LocationFix, Obstacle, ObstacleType, ReactionAction, SeverityStats,
    VehicleClass,
};

const START_LAT: f64 = 45.0;
const START_LON: f64 = 7.0;
const METRES_PER_DEG_LAT: f64 = 111_195.0;

fn transmission_config(batch_size: usize) -> TransmissionConfig {
    TransmissionConfig {
        buffer_capacity: 50,
        batch_size,
        idle_flush_secs: 60,
        max_retries: 3,
        queue_capacity: 100,
        drain_delay_ms: 0,
    }
}

fn classifier() -> SignalClassifier {
    SignalClassifier::new(Config::default().classifier, VehicleClass::Car)
}

fn fix_north_of_start(metres: f64, speed_kmh: f64) -> LocationFix {
    LocationFix::new(START_LAT + metres / METRES_PER_DEG_LAT, START_LON, speed_kmh / 3.6, 0.0).with_heading(0.0)
}

fn pothole_ahead(id: &str, metres: f64) -> Obstacle {
    Obstacle {
        id: id.to_string(),
        obstacle_type: ObstacleType::Pothole,
        latitude: START_LAT + metres / METRES_PER_DEG_LAT,
        longitude: START_LON,
        distance: 0.0,
        bearing: 0.0,
        relevant_distance: 0.0,
        severity: SeverityStats { avg: 2.0, max: 2 },
        confidence: 0.9,
        confirmations: 3,
        last_reported: None,
        priority: 1,
    }
}

#[test]
fn vertical_spike_is_immediate_critical_pothole() {
    let mut c = classifier();
    assert!(c.process(AccelerationSample::new(0.0, 0.0, 9.8, 0.0)).is_none());

    let event = c.process(AccelerationSample::new(0.0, 5.0, 9.7, 0.02)).unwrap();
    assert_eq!(event.event_type, EventType::Pothole);
    assert_eq!(event.severity, 1);
    assert!(event.send_immediately);
}

#[test]
fn emergency_braking_after_steady_driving() {
    let mut c = classifier();
    for i in 0..9 {
        assert!(c.process(AccelerationSample::new(0.0, 0.0, 9.8, i as f64 * 0.02)).is_none());
    }
    let event = c.process(AccelerationSample::new(0.0, 0.0, 13.0, 0.2)).unwrap();
    assert_eq!(event.event_type, EventType::Braking);
    assert_eq!(event.severity, 1);
}

#[tokio::test]
async fn five_points_make_one_batch() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Rc::new(MockBackend::online());
    let pipeline = TransmissionPipeline::new(
        backend.clone(),
        KvStore::open(dir.path()).unwrap(),
        "dev-1",
        transmission_config(5),
    );

    for i in 0..5 {
        pipeline
            .add_data_point(&LocationFix::new(45.0, 7.0, 10.0, i as f64), Vec::new())
            .await;
    }

    let requests = backend.raw_requests.borrow();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].data.len(), 5);
    assert_eq!(pipeline.status().buffered_points, 0);
}

#[tokio::test]
async fn offline_batches_drain_in_order_on_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Rc::new(MockBackend::offline());
    let pipeline = TransmissionPipeline::new(
        backend.clone(),
        KvStore::open(dir.path()).unwrap(),
        "dev-1",
        transmission_config(5),
    );

    for i in 0..15 {
        pipeline
            .add_data_point(&LocationFix::new(45.0, 7.0, 10.0, i as f64), Vec::new())
            .await;
    }
    assert_eq!(pipeline.queue_len(), 3);
    assert_eq!(backend.delivered_batches(), 0);

    let (_handle, stop) = stop_pair();
    backend.set_online(true);
    pipeline.on_connectivity_change(true, &stop).await;

    assert_eq!(pipeline.queue_len(), 0);
    let first_points: Vec<f64> = backend
        .raw_requests
        .borrow()
        .iter()
        .map(|r| r.data[0].timestamp)
        .collect();
    assert_eq!(first_points, vec![0.0, 5.0, 10.0]);
}

#[tokio::test]
async fn queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Rc::new(MockBackend::offline());
    {
        let pipeline = TransmissionPipeline::new(
            backend.clone(),
            KvStore::open(dir.path()).unwrap(),
            "dev-1",
            transmission_config(5),
        );
        for i in 0..5 {
            pipeline
                .add_data_point(&LocationFix::new(45.0, 7.0, 10.0, i as f64), Vec::new())
                .await;
        }
        assert_eq!(pipeline.queue_len(), 1);
    }

    let restarted = TransmissionPipeline::new(
        backend.clone(),
        KvStore::open(dir.path()).unwrap(),
        "dev-1",
        transmission_config(5),
    );
    assert_eq!(restarted.queue_len(), 1);
    let id = restarted.queued_ids().remove(0);
    assert_eq!(restarted.queued_batch(&id).unwrap().priority, Priority::Normal);

    let (_handle, stop) = stop_pair();
    backend.set_online(true);
    restarted.process_queue(&stop).await;
    assert_eq!(restarted.queue_len(), 0);
    assert_eq!(backend.raw_requests.borrow().len(), 1);
}

fn tracker(backend: &Rc<MockBackend>, dir: &tempfile::TempDir) -> ProximityTracker<MockBackend> {
    let config = ProximityConfig {
        search_radius_m: 1000.0,
        ..Config::default().proximity
    };
    ProximityTracker::new(backend.clone(), KvStore::open(dir.path()).unwrap(), config)
}

#[tokio::test]
async fn speeding_toward_hazard_gets_full_alert() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Rc::new(MockBackend::online());
    backend.obstacles.borrow_mut().push(pothole_ahead("p1", 320.0));
    let mut tracker = tracker(&backend, &dir);

    let speech = Rc::new(RecordingSpeech::default());
    let audio = Rc::new(RecordingAudio::default());
    let mut orchestrator = AlertOrchestrator::new(speech.clone(), audio, AlertSettings::default());

    let here = fix_north_of_start(0.0, 65.0);
    let nearby = tracker.fetch_nearby_obstacles(here.latitude, here.longitude, 1000.0, 1).await;
    assert_eq!(nearby.len(), 1);

    let report = tracker.tick(&here);
    assert_eq!(report.active.len(), 1);
    assert!((report.active[0].relevant_distance - 320.0).abs() < 1.0);

    orchestrator
        .update(&report, 65.0, |t| tracker.alert_distance(t))
        .await;
    assert_eq!(orchestrator.state("p1"), Some(AlertState::Alerted));
    let warnings = orchestrator.active_warnings();
    assert_eq!(warnings[0].level, AlertLevel::Full);
    assert_eq!(speech.spoken.borrow().len(), 1);
}

#[tokio::test]
async fn slowing_down_confirms_hazard_and_adapts() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Rc::new(MockBackend::online());
    backend.obstacles.borrow_mut().push(pothole_ahead("p1", 400.0));
    let mut tracker = tracker(&backend, &dir);

    let speech = Rc::new(RecordingSpeech::default());
    let audio = Rc::new(RecordingAudio::default());
    let mut orchestrator = AlertOrchestrator::new(speech, audio, AlertSettings::default());

    let first = fix_north_of_start(0.0, 70.0);
    tracker.fetch_nearby_obstacles(first.latitude, first.longitude, 1000.0, 1).await;
    let report = tracker.tick(&first);
    orchestrator.update(&report, 70.0, |t| tracker.alert_distance(t)).await;
    assert_eq!(orchestrator.state("p1"), Some(AlertState::Alerted));

    let second = fix_north_of_start(20.0, 60.0);
    let report = tracker.tick(&second);
    let update = orchestrator.update(&report, 60.0, |t| tracker.alert_distance(t)).await;

    assert_eq!(update.transitions.len(), 1);
    assert_eq!(update.transitions[0].state, AlertState::Reacted);
    assert_eq!(update.reactions.len(), 1);
    assert_eq!(update.reactions[0].action, ReactionAction::Confirmed);

    for reaction in update.reactions {
        tracker.record_driver_reaction(reaction);
    }
    assert_eq!(tracker.reactions().len(), 1);

    // Persisted for the next session
    let reloaded = ProximityTracker::new(backend.clone(), KvStore::open(dir.path()).unwrap(), Config::default().proximity);
    assert_eq!(reloaded.reactions().len(), 1);
}

#[tokio::test]
async fn hazard_behind_is_passed_and_not_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Rc::new(MockBackend::online());
    backend.obstacles.borrow_mut().push(pothole_ahead("p1", 100.0));
    let mut tracker = tracker(&backend, &dir);

    let start = fix_north_of_start(0.0, 50.0);
    tracker.fetch_nearby_obstacles(start.latitude, start.longitude, 1000.0, 1).await;
    assert_eq!(tracker.tick(&start).active.len(), 1);

    let beyond = fix_north_of_start(120.0, 50.0);
    let report = tracker.tick(&beyond);
    assert!(report.active.is_empty());
    assert_eq!(report.passed.len(), 1);
    assert!(tracker.is_passed("p1"));

    let nearby = tracker.fetch_nearby_obstacles(beyond.latitude, beyond.longitude, 1000.0, 1).await;
    assert!(nearby.is_empty());
}
