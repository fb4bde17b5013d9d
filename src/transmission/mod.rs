//! Buffered, batched delivery of telemetry with an offline fallback.
//!
//! Raw points and classified events are buffered separately and turned into
//! batches when a buffer reaches `batch_size` or sits idle for
//! `idle_flush_secs`. Every send is preceded by a reachability probe. Batches
//! that cannot be delivered go to the persisted [`OfflineQueue`], which is
//! drained critical-first once connectivity returns.
//!
//! All state sits behind `RefCell`/`Cell` and is only touched between await
//! points, so the pipeline can be shared via `Rc` across local tasks.

pub mod batch;
pub mod offline_queue;

pub use batch::{DataPackage, Payload, Priority};
pub use offline_queue::{OfflineQueue, PushOutcome, QueueSnapshot};

use crate::backend::{Backend, GpsPayload, RawDataPoint, RawDataRequest, SensorDataRecord, SensorDataRequest};
use crate::config::TransmissionConfig;
use crate::error::{Result, SentinelError};
use crate::lifecycle::StopToken;
use crate::storage::{KvStore, OFFLINE_QUEUE_KEY};
use crate::types::{AccelerationSample, DetectedEvent, LocationFix, Warning};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub sent_batches: u64,
    pub queued_batches: u64,
    pub failed_batches: u64,
    pub critical_dropped: u64,
    pub evicted_batches: u64,
    pub warnings_received: u64,
}

/// Point-in-time view for the status line and the live status file
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub online: bool,
    pub buffered_points: usize,
    pub buffered_events: usize,
    pub queued: usize,
    pub queued_critical: usize,
    pub is_sending: bool,
    pub is_draining: bool,
    pub stats: PipelineStats,
}

#[derive(Default)]
struct Buffers {
    points: Vec<RawDataPoint>,
    events: Vec<SensorDataRecord>,
    last_location: Option<GpsPayload>,
    last_added: Option<Instant>,
}

/// Resets a busy flag when the owning future completes or is dropped
struct BusyGuard<'a>(&'a Cell<bool>);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a Cell<bool>) -> Option<Self> {
        if flag.replace(true) {
            None
        } else {
            Some(BusyGuard(flag))
        }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

pub struct TransmissionPipeline<B: Backend> {
    backend: Rc<B>,
    store: KvStore,
    device_id: String,
    config: TransmissionConfig,
    buffers: RefCell<Buffers>,
    queue: RefCell<OfflineQueue>,
    stats: Cell<PipelineStats>,
    online: Cell<bool>,
    is_sending: Cell<bool>,
    is_processing_queue: Cell<bool>,
    /// Set by a flush that found another one running
    flush_requested: Cell<bool>,
    next_seq: Cell<u64>,
}

impl<B: Backend> TransmissionPipeline<B> {
    /// Restores any persisted offline queue from `store`
    pub fn new(backend: Rc<B>, store: KvStore, device_id: &str, config: TransmissionConfig) -> Self {
        let queue = match store.load_or_warn::<QueueSnapshot>(OFFLINE_QUEUE_KEY) {
            Some(snapshot) => {
                let queue = OfflineQueue::restore(config.queue_capacity, snapshot);
                if !queue.is_empty() {
                    log::info!(
                        "Restored offline queue: {} batches ({} critical)",
                        queue.len(),
                        queue.critical_len()
                    );
                }
                queue
            }
            None => OfflineQueue::new(config.queue_capacity),
        };

        TransmissionPipeline {
            backend,
            store,
            device_id: device_id.to_string(),
            config,
            buffers: RefCell::new(Buffers::default()),
            queue: RefCell::new(queue),
            stats: Cell::new(PipelineStats::default()),
            online: Cell::new(false),
            is_sending: Cell::new(false),
            is_processing_queue: Cell::new(false),
            flush_requested: Cell::new(false),
            next_seq: Cell::new(0),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Buffer a location snapshot with its acceleration window
    pub async fn add_data_point(
        &self,
        location: &LocationFix,
        window: Vec<AccelerationSample>,
    ) -> Vec<Warning> {
        let point = RawDataPoint {
            device_id: self.device_id.clone(),
            timestamp: location.timestamp,
            gps: GpsPayload::from(location),
            accelerometer: window,
        };

        let trigger = {
            let mut buffers = self.buffers.borrow_mut();
            if buffers.points.len() >= self.config.buffer_capacity {
                buffers.points.remove(0);
                log::warn!("Point buffer full, dropped oldest point");
            }
            buffers.points.push(point);
            buffers.last_location = Some(GpsPayload::from(location));
            buffers.last_added = Some(Instant::now());
            buffers.points.len() >= self.config.batch_size
        };

        if trigger {
            self.flush().await
        } else {
            Vec::new()
        }
    }

    /// Buffer a classified event. Events flagged `send_immediately` bypass the
    /// buffer and go out as a single-event critical batch.
    pub async fn add_event(&self, event: &DetectedEvent, location: Option<&LocationFix>) -> Vec<Warning> {
        let record = SensorDataRecord::from_event(event, location);

        if event.send_immediately {
            log::info!(
                "Sending {:?} (severity {}) immediately",
                event.event_type,
                event.severity
            );
            let batch = self.make_batch(
                Payload::Events(vec![record]),
                location.map(GpsPayload::from),
                Priority::Critical,
            );
            return self.deliver(batch).await;
        }

        let trigger = {
            let mut buffers = self.buffers.borrow_mut();
            if buffers.events.len() >= self.config.buffer_capacity {
                buffers.events.remove(0);
                log::warn!("Event buffer full, dropped oldest event");
            }
            buffers.events.push(record);
            if let Some(fix) = location {
                buffers.last_location = Some(GpsPayload::from(fix));
            }
            buffers.last_added = Some(Instant::now());
            buffers.events.len() >= self.config.batch_size
        };

        if trigger {
            self.flush().await
        } else {
            Vec::new()
        }
    }

    /// When the idle timer fires, if anything is buffered
    pub fn flush_deadline(&self) -> Option<Instant> {
        let buffers = self.buffers.borrow();
        if buffers.points.is_empty() && buffers.events.is_empty() {
            return None;
        }
        buffers.last_added.map(|t| t + self.config.idle_flush())
    }

    /// Form batches from everything buffered and deliver them. Buffers are
    /// cleared before any send, so nothing is batched twice. A flush that
    /// finds another in progress leaves a request for it and returns; the
    /// running flush takes whatever was buffered in the meantime.
    pub async fn flush(&self) -> Vec<Warning> {
        let Some(_guard) = BusyGuard::acquire(&self.is_sending) else {
            log::debug!("Flush already in progress, handing over");
            self.flush_requested.set(true);
            return Vec::new();
        };

        let mut warnings = Vec::new();
        loop {
            self.flush_requested.set(false);
            let batches = self.take_batches();
            if batches.is_empty() {
                break;
            }
            for batch in batches {
                warnings.extend(self.deliver(batch).await);
            }
            // More data may have arrived while we were sending
            if !self.flush_requested.get() && !self.batch_size_reached() {
                break;
            }
        }
        warnings
    }

    fn batch_size_reached(&self) -> bool {
        let buffers = self.buffers.borrow();
        buffers.points.len() >= self.config.batch_size || buffers.events.len() >= self.config.batch_size
    }

    fn take_batches(&self) -> Vec<DataPackage> {
        let (points, events, location) = {
            let mut buffers = self.buffers.borrow_mut();
            buffers.last_added = None;
            (
                std::mem::take(&mut buffers.points),
                std::mem::take(&mut buffers.events),
                buffers.last_location.clone(),
            )
        };

        let mut batches = Vec::new();
        if !points.is_empty() {
            batches.push(self.make_batch(Payload::Points(points), location.clone(), Priority::Normal));
        }
        if !events.is_empty() {
            let priority = batch::events_priority(events.iter().filter_map(|e| e.severity));
            batches.push(self.make_batch(Payload::Events(events), location, priority));
        }
        batches
    }

    fn make_batch(&self, payload: Payload, location: Option<GpsPayload>, priority: Priority) -> DataPackage {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        let id = format!(
            "{}-{}-{}",
            self.device_id,
            chrono::Utc::now().timestamp_millis(),
            seq
        );
        DataPackage::new(id, &self.device_id, payload, location, priority)
    }

    /// Probe, then send or fall back to the offline queue
    async fn deliver(&self, mut batch: DataPackage) -> Vec<Warning> {
        let reachable = self.backend.is_reachable().await;
        self.online.set(reachable);
        if !reachable {
            log::info!("Offline, queueing batch {} ({} items)", batch.id, batch.payload.len());
            self.enqueue(batch);
            return Vec::new();
        }

        match self.send(&batch).await {
            Ok(warnings) => {
                self.update_stats(|s| {
                    s.sent_batches += 1;
                    s.warnings_received += warnings.len() as u64;
                });
                log::debug!("Sent batch {} ({} items)", batch.id, batch.payload.len());
                warnings
            }
            Err(e) => {
                if e.is_connectivity() {
                    self.online.set(false);
                }
                if batch.record_failure(self.config.max_retries) {
                    log::warn!("Send of batch {} failed ({}), queueing", batch.id, e);
                    self.enqueue(batch);
                } else {
                    self.drop_exhausted(&batch);
                }
                Vec::new()
            }
        }
    }

    async fn send(&self, batch: &DataPackage) -> Result<Vec<Warning>> {
        match &batch.payload {
            Payload::Points(points) => {
                let request = RawDataRequest {
                    device_id: batch.device_id.clone(),
                    data: points.clone(),
                };
                let response = self.backend.post_raw_data(&request).await?;
                Ok(response.warnings)
            }
            Payload::Events(events) => {
                let request = SensorDataRequest {
                    device_id: batch.device_id.clone(),
                    sensor_data: events.clone(),
                };
                self.backend.post_sensor_data(&request).await?;
                Ok(Vec::new())
            }
        }
    }

    fn enqueue(&self, batch: DataPackage) {
        let outcome = self.queue.borrow_mut().push(batch);
        match outcome {
            PushOutcome::Queued => self.update_stats(|s| s.queued_batches += 1),
            PushOutcome::Evicted(dropped) => {
                log::warn!("Offline queue full, evicted batch {}", dropped.id);
                self.update_stats(|s| {
                    s.queued_batches += 1;
                    s.evicted_batches += 1;
                    if dropped.is_critical() {
                        s.critical_dropped += 1;
                    }
                });
            }
            PushOutcome::Rejected(rejected) => {
                log::warn!("Offline queue full of critical batches, rejected batch {}", rejected.id);
                self.update_stats(|s| s.evicted_batches += 1);
            }
        }
        self.persist_queue();
    }

    fn drop_exhausted(&self, batch: &DataPackage) {
        let err = SentinelError::RetryExhausted {
            batch_id: batch.id.clone(),
            retries: batch.retry_count,
        };
        if batch.is_critical() {
            log::error!("Dropping critical batch: {}", err);
        } else {
            log::warn!("Dropping batch: {}", err);
        }
        self.update_stats(|s| {
            s.failed_batches += 1;
            if batch.is_critical() {
                s.critical_dropped += 1;
            }
        });
    }

    fn persist_queue(&self) {
        let snapshot = self.queue.borrow().snapshot();
        self.store.save_or_warn(OFFLINE_QUEUE_KEY, &snapshot);
    }

    fn update_stats(&self, f: impl FnOnce(&mut PipelineStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    /// Drain the offline queue, critical batches first. Each batch queued at
    /// the start is attempted at most once; the drain stops at the first
    /// unreachable probe or when `stop` fires. Only one drain runs at a time.
    pub async fn process_queue(&self, stop: &StopToken) -> Vec<Warning> {
        let Some(_guard) = BusyGuard::acquire(&self.is_processing_queue) else {
            log::debug!("Queue drain already in progress");
            return Vec::new();
        };

        let ids = self.queue.borrow().drain_order();
        if ids.is_empty() {
            return Vec::new();
        }
        log::info!("Draining offline queue: {} batches", ids.len());

        let mut warnings = Vec::new();
        let mut delivered = 0usize;
        for (i, id) in ids.iter().enumerate() {
            if stop.is_stopped() {
                log::info!("Stop requested, leaving {} batches queued", ids.len() - i);
                break;
            }
            if i > 0 && !self.config.drain_delay().is_zero() {
                tokio::time::sleep(self.config.drain_delay()).await;
                if stop.is_stopped() {
                    break;
                }
            }

            // The batch may have been evicted while we were waiting
            let Some(batch) = self.queue.borrow().get(id).cloned() else {
                continue;
            };

            let reachable = self.backend.is_reachable().await;
            self.online.set(reachable);
            if !reachable {
                log::info!("Lost connectivity during drain");
                break;
            }

            match self.send(&batch).await {
                Ok(batch_warnings) => {
                    self.queue.borrow_mut().remove(id);
                    self.update_stats(|s| {
                        s.sent_batches += 1;
                        s.warnings_received += batch_warnings.len() as u64;
                    });
                    warnings.extend(batch_warnings);
                    delivered += 1;
                }
                Err(e) => {
                    if e.is_connectivity() {
                        self.online.set(false);
                    }
                    let exhausted = {
                        let mut queue = self.queue.borrow_mut();
                        let keep = queue.get_mut(id).map(|q| q.record_failure(self.config.max_retries));
                        if keep == Some(false) {
                            queue.remove(id)
                        } else {
                            None
                        }
                    };
                    match exhausted {
                        Some(dropped) => self.drop_exhausted(&dropped),
                        None => log::warn!("Resend of batch {} failed: {}", id, e),
                    }
                }
            }
            self.persist_queue();
        }

        log::info!(
            "Drain finished: {} delivered, {} still queued",
            delivered,
            self.queue.borrow().len()
        );
        warnings
    }

    /// Record a connectivity signal; a transition to online drains the queue
    pub async fn on_connectivity_change(&self, online: bool, stop: &StopToken) -> Vec<Warning> {
        let was_online = self.online.replace(online);
        if online && !was_online {
            log::info!("Connectivity restored");
        } else if !online && was_online {
            log::info!("Connectivity lost");
        }
        if online {
            self.process_queue(stop).await
        } else {
            Vec::new()
        }
    }

    pub async fn fetch_warnings(&self) -> Result<Vec<Warning>> {
        self.backend.fetch_warnings(&self.device_id).await
    }

    pub async fn acknowledge_warning(&self, warning_id: &str) -> Result<()> {
        self.backend.delete_warning(warning_id).await
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.get()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn queued_ids(&self) -> Vec<String> {
        self.queue.borrow().drain_order()
    }

    pub fn queued_batch(&self, id: &str) -> Option<DataPackage> {
        self.queue.borrow().get(id).cloned()
    }

    pub fn status(&self) -> PipelineStatus {
        let buffers = self.buffers.borrow();
        let queue = self.queue.borrow();
        PipelineStatus {
            online: self.online.get(),
            buffered_points: buffers.points.len(),
            buffered_events: buffers.events.len(),
            queued: queue.len(),
            queued_critical: queue.critical_len(),
            is_sending: self.is_sending.get(),
            is_draining: self.is_processing_queue.get(),
            stats: self.stats.get(),
        }
    }

    /// Drop all queued batches, in memory and on disk
    pub fn clear_queue(&self) {
        self.queue.borrow_mut().clear();
        self.persist_queue();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::stop_pair;
    use crate::testing::MockBackend;
    use crate::types::{AxisDelta, EventType, RoadType};
    use std::time::Duration;

    fn config() -> TransmissionConfig {
        TransmissionConfig {
            buffer_capacity: 50,
            batch_size: 50,
            idle_flush_secs: 60,
            max_retries: 3,
            queue_capacity: 100,
            drain_delay_ms: 0,
        }
    }

    fn pipeline(backend: MockBackend, dir: &tempfile::TempDir) -> (Rc<MockBackend>, TransmissionPipeline<MockBackend>) {
        let backend = Rc::new(backend);
        let store = KvStore::open(dir.path()).unwrap();
        let pipeline = TransmissionPipeline::new(backend.clone(), store, "dev-1", config());
        (backend, pipeline)
    }

    fn fix(t: f64) -> LocationFix {
        LocationFix::new(45.0, 7.0, 10.0, t)
    }

    fn event(severity: u8, immediate: bool) -> DetectedEvent {
        DetectedEvent {
            event_type: EventType::Pothole,
            severity,
            timestamp: 1.0,
            magnitude: 4.0,
            delta: AxisDelta { x: 0.0, y: 4.0, z: 0.0 },
            variance: 0.0,
            road_type: RoadType::Asphalt,
            notify_user: true,
            send_immediately: immediate,
        }
    }

    #[tokio::test]
    async fn test_batch_formed_at_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, pipeline) = pipeline(MockBackend::online(), &dir);

        for i in 0..49 {
            pipeline.add_data_point(&fix(i as f64), Vec::new()).await;
        }
        assert_eq!(backend.delivered_batches(), 0);
        assert_eq!(pipeline.status().buffered_points, 49);

        pipeline.add_data_point(&fix(49.0), Vec::new()).await;
        assert_eq!(backend.raw_requests.borrow().len(), 1);
        assert_eq!(backend.raw_requests.borrow()[0].data.len(), 50);
        assert_eq!(pipeline.status().buffered_points, 0);
        assert_eq!(pipeline.stats().sent_batches, 1);
    }

    #[tokio::test]
    async fn test_critical_event_sent_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, pipeline) = pipeline(MockBackend::online(), &dir);

        pipeline.add_event(&event(1, true), Some(&fix(1.0))).await;
        let requests = backend.sensor_requests.borrow();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].sensor_data.len(), 1);
        assert_eq!(requests[0].sensor_data[0].severity, Some(1));
    }

    #[tokio::test]
    async fn test_offline_send_is_queued_without_retry_increment() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, pipeline) = pipeline(MockBackend::offline(), &dir);

        pipeline.add_event(&event(1, true), None).await;
        assert_eq!(backend.delivered_batches(), 0);
        assert_eq!(pipeline.queue_len(), 1);

        let id = pipeline.queued_ids().remove(0);
        let queued = pipeline.queued_batch(&id).unwrap();
        assert_eq!(queued.priority, Priority::Critical);
        assert_eq!(queued.retry_count, 0);
        assert!(!pipeline.status().online);
    }

    #[tokio::test]
    async fn test_failed_send_increments_retry_and_queues() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::online();
        backend.fail_sends.set(1);
        let (_backend, pipeline) = pipeline(backend, &dir);

        pipeline.add_event(&event(3, false), None).await;
        pipeline.flush().await;

        let id = pipeline.queued_ids().remove(0);
        assert_eq!(pipeline.queued_batch(&id).unwrap().retry_count, 1);
        assert_eq!(pipeline.queued_batch(&id).unwrap().priority, Priority::Normal);
    }

    #[tokio::test]
    async fn test_send_dropped_mid_request_marks_offline() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::offline();
        *backend.reachability_script.borrow_mut() = vec![true];
        let (_backend, pipeline) = pipeline(backend, &dir);

        pipeline.add_event(&event(1, true), None).await;
        assert_eq!(pipeline.queue_len(), 1);
        assert!(!pipeline.status().online);
    }

    #[tokio::test]
    async fn test_flush_clears_buffers_and_sets_priority() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, pipeline) = pipeline(MockBackend::offline(), &dir);

        pipeline.add_data_point(&fix(1.0), Vec::new()).await;
        pipeline.add_event(&event(2, false), None).await;
        pipeline.add_event(&event(4, false), None).await;
        pipeline.flush().await;

        let status = pipeline.status();
        assert_eq!(status.buffered_points, 0);
        assert_eq!(status.buffered_events, 0);
        assert_eq!(status.queued, 2);
        assert_eq!(backend.delivered_batches(), 0);

        let priorities: Vec<Priority> = pipeline
            .queued_ids()
            .iter()
            .map(|id| pipeline.queued_batch(id).unwrap().priority)
            .collect();
        assert_eq!(priorities, vec![Priority::Normal, Priority::High]);
    }

    #[tokio::test]
    async fn test_drain_delivers_critical_first() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, pipeline) = pipeline(MockBackend::offline(), &dir);
        let (_handle, stop) = stop_pair();

        pipeline.add_event(&event(4, false), None).await;
        pipeline.flush().await;
        pipeline.add_event(&event(1, true), None).await;
        assert_eq!(pipeline.queue_len(), 2);

        backend.set_online(true);
        pipeline.on_connectivity_change(true, &stop).await;

        assert_eq!(pipeline.queue_len(), 0);
        let requests = backend.sensor_requests.borrow();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].sensor_data[0].severity, Some(1));
        assert_eq!(requests[1].sensor_data[0].severity, Some(4));
    }

    #[tokio::test]
    async fn test_drain_attempts_each_batch_once() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, pipeline) = pipeline(MockBackend::offline(), &dir);
        let (_handle, stop) = stop_pair();

        pipeline.add_event(&event(3, false), None).await;
        pipeline.flush().await;
        backend.set_online(true);
        backend.always_fail_sends.set(true);

        pipeline.process_queue(&stop).await;
        let id = pipeline.queued_ids().remove(0);
        assert_eq!(pipeline.queued_batch(&id).unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_batch_dropped_after_max_retries() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, pipeline) = pipeline(MockBackend::offline(), &dir);
        let (_handle, stop) = stop_pair();

        pipeline.add_event(&event(1, true), None).await;
        backend.set_online(true);
        backend.always_fail_sends.set(true);

        for _ in 0..3 {
            pipeline.process_queue(&stop).await;
            assert_eq!(pipeline.queue_len(), 1);
        }
        pipeline.process_queue(&stop).await;
        assert_eq!(pipeline.queue_len(), 0);

        let stats = pipeline.stats();
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.critical_dropped, 1);
    }

    #[tokio::test]
    async fn test_drain_stops_when_connectivity_lost() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, pipeline) = pipeline(MockBackend::offline(), &dir);
        let (_handle, stop) = stop_pair();

        for _ in 0..3 {
            pipeline.add_event(&event(1, true), None).await;
        }
        backend.set_online(true);
        *backend.reachability_script.borrow_mut() = vec![true, false];

        pipeline.process_queue(&stop).await;
        assert_eq!(backend.delivered_batches(), 1);
        assert_eq!(pipeline.queue_len(), 2);
    }

    #[tokio::test]
    async fn test_drain_honours_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, pipeline) = pipeline(MockBackend::offline(), &dir);
        let (handle, stop) = stop_pair();

        pipeline.add_event(&event(1, true), None).await;
        backend.set_online(true);
        handle.stop();

        pipeline.process_queue(&stop).await;
        assert_eq!(backend.delivered_batches(), 0);
        assert_eq!(pipeline.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_drains_deliver_once() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, pipeline) = pipeline(MockBackend::offline(), &dir);
        let (_handle, stop) = stop_pair();

        for _ in 0..4 {
            pipeline.add_event(&event(1, true), None).await;
        }
        backend.set_online(true);
        backend.send_delay.set(Duration::from_millis(5));

        futures::join!(pipeline.process_queue(&stop), pipeline.process_queue(&stop));
        assert_eq!(backend.delivered_batches(), 4);
        assert_eq!(pipeline.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_flush_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, pipeline) = pipeline(MockBackend::online(), &dir);
        backend.send_delay.set(Duration::from_millis(5));

        pipeline.add_event(&event(3, false), None).await;
        futures::join!(pipeline.flush(), pipeline.flush());
        assert_eq!(backend.sensor_requests.borrow().len(), 1);
        assert!(!pipeline.status().is_sending);
    }

    #[tokio::test]
    async fn test_flush_during_send_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, pipeline) = pipeline(MockBackend::online(), &dir);
        backend.send_delay.set(Duration::from_millis(5));

        pipeline.add_event(&event(3, false), None).await;
        let late_flush = async {
            pipeline.add_data_point(&fix(2.0), Vec::new()).await;
            pipeline.flush().await
        };
        futures::join!(pipeline.flush(), late_flush);

        assert_eq!(backend.sensor_requests.borrow().len(), 1);
        assert_eq!(backend.raw_requests.borrow().len(), 1);
        assert_eq!(pipeline.status().buffered_points, 0);
        assert!(pipeline.flush_deadline().is_none());
    }

    #[tokio::test]
    async fn test_queue_persisted_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (_backend, pipeline) = pipeline(MockBackend::offline(), &dir);
            pipeline.add_event(&event(1, true), None).await;
            pipeline.add_event(&event(4, false), None).await;
            pipeline.flush().await;
        }

        let (_backend, restored) = pipeline(MockBackend::offline(), &dir);
        assert_eq!(restored.queue_len(), 2);
        assert_eq!(restored.status().queued_critical, 1);
    }

    #[tokio::test]
    async fn test_warnings_returned_from_raw_data() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::online();
        backend.warnings.borrow_mut().push(Warning {
            id: "w1".to_string(),
            warning_type: "pothole".to_string(),
            message: "Pothole ahead".to_string(),
            severity: Some(2),
            latitude: None,
            longitude: None,
            distance: Some(120.0),
        });
        let (_backend, pipeline) = pipeline(backend, &dir);

        pipeline.add_data_point(&fix(1.0), Vec::new()).await;
        let warnings = pipeline.flush().await;
        assert_eq!(warnings.len(), 1);
        assert_eq!(pipeline.stats().warnings_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_deadline_tracks_idle_time() {
        let dir = tempfile::tempdir().unwrap();
        let (_backend, pipeline) = pipeline(MockBackend::online(), &dir);
        assert!(pipeline.flush_deadline().is_none());

        let before = Instant::now();
        pipeline.add_data_point(&fix(1.0), Vec::new()).await;
        let deadline = pipeline.flush_deadline().unwrap();
        assert_eq!(deadline - before, Duration::from_secs(60));

        pipeline.flush().await;
        assert!(pipeline.flush_deadline().is_none());
    }
}
