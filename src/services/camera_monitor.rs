//! Per-camera monitoring loop
//!
//! Each camera gets its own OS thread. The loop reads frames as fast as the
//! source delivers them but only runs detection when at least one frame
//! interval has passed since the last processed frame. Detected boxes are
//! mapped onto the camera's spots; every spot whose status differs from the
//! store is written and published.
//!
//! Faults stay inside the worker:
//! - a failed read drops the source, sleeps the reconnect backoff, reopens
//! - a failed detection skips that frame only
//! - a failed plate read leaves the event without a plate

use crate::domain::layout::{Camera, SpotRegion};
use crate::domain::types::{CameraId, SpotStatus, StatusChangeEvent, VehicleBox};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::detector::{DetectionError, Detector};
use crate::io::frame_source::{Frame, FrameSource, SourceConnector};
use crate::services::event_bus::EventBus;
use crate::services::occupancy::map_occupancy;
use crate::services::status_store::{StatusStore, Transition};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTimings {
    /// Minimum spacing between processed frames (1 / target fps)
    pub frame_interval: Duration,
    pub reconnect_backoff: Duration,
    /// Pause between unthrottled read attempts
    pub idle_sleep: Duration,
}

impl MonitorTimings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            frame_interval: config.frame_interval(),
            reconnect_backoff: config.reconnect_backoff(),
            idle_sleep: config.idle_sleep(),
        }
    }
}

/// Shared components every worker writes to
#[derive(Clone)]
pub struct MonitorContext {
    pub store: Arc<StatusStore>,
    pub bus: EventBus,
    pub metrics: Arc<Metrics>,
    pub detector: Arc<dyn Detector>,
}

/// Result of one `poll_once` step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Source could not be opened or returned no frame; back off
    SourceDown,
    /// Frame read but inside the sampling interval
    Skipped,
    /// Frame processed; number of spots that changed status
    Processed { changes: usize },
    /// Detector failed on this frame
    DetectionFailed,
}

pub struct CameraMonitor {
    camera_id: CameraId,
    camera_name: String,
    stream_url: String,
    spots: Vec<SpotRegion>,
    connector: Box<dyn SourceConnector>,
    ctx: MonitorContext,
    timings: MonitorTimings,
    read_plates: bool,
    source: Option<Box<dyn FrameSource>>,
    last_processed: Option<Instant>,
}

impl CameraMonitor {
    pub fn new(
        camera: &Camera,
        spots: Vec<SpotRegion>,
        connector: Box<dyn SourceConnector>,
        ctx: MonitorContext,
        timings: MonitorTimings,
        read_plates: bool,
    ) -> Self {
        Self {
            camera_id: camera.id,
            camera_name: camera.name.clone(),
            stream_url: camera.stream_url.clone(),
            spots,
            connector,
            ctx,
            timings,
            read_plates,
            source: None,
            last_processed: None,
        }
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    /// Start the loop on a dedicated named thread
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("camera-{}", self.camera_id))
            .spawn(move || self.run(shutdown))
    }

    /// Run until shutdown is signalled. Never exits on a camera fault.
    pub fn run(mut self, shutdown: watch::Receiver<bool>) {
        self.ctx.metrics.record_camera_started();
        info!(
            camera_id = %self.camera_id,
            camera = %self.camera_name,
            spots = self.spots.len(),
            interval_ms = self.timings.frame_interval.as_millis() as u64,
            "camera_monitor_started"
        );

        while !*shutdown.borrow() {
            let pause = match self.poll_once(Instant::now()) {
                PollOutcome::SourceDown => self.timings.reconnect_backoff,
                _ => self.timings.idle_sleep,
            };
            thread::sleep(pause);
        }

        info!(camera_id = %self.camera_id, "camera_monitor_stopped");
    }

    /// One iteration: ensure a source, read a frame, maybe process it.
    pub fn poll_once(&mut self, now: Instant) -> PollOutcome {
        if self.source.is_none() {
            match self.connector.open(&self.stream_url) {
                Ok(source) => {
                    info!(camera_id = %self.camera_id, "camera_source_opened");
                    self.source = Some(source);
                }
                Err(e) => {
                    warn!(camera_id = %self.camera_id, error = %e, "camera_source_open_failed");
                    self.ctx.metrics.record_source_failure();
                    return PollOutcome::SourceDown;
                }
            }
        }

        let Some(frame) = self.source.as_mut().and_then(|source| source.read_frame()) else {
            warn!(
                camera_id = %self.camera_id,
                backoff_ms = self.timings.reconnect_backoff.as_millis() as u64,
                "camera_read_failed_reconnecting"
            );
            self.source = None;
            self.ctx.metrics.record_source_failure();
            return PollOutcome::SourceDown;
        };
        self.ctx.metrics.record_frame_read();

        if let Some(last) = self.last_processed {
            if now.saturating_duration_since(last) < self.timings.frame_interval {
                return PollOutcome::Skipped;
            }
        }
        self.last_processed = Some(now);

        match self.process_frame(&frame) {
            Ok(changes) => PollOutcome::Processed { changes },
            Err(e) => {
                warn!(camera_id = %self.camera_id, error = %e, "detection_failed");
                self.ctx.metrics.record_detection_failure();
                PollOutcome::DetectionFailed
            }
        }
    }

    /// Detect, map, and write through every changed spot
    fn process_frame(&self, frame: &Frame) -> Result<usize, DetectionError> {
        let started = Instant::now();
        let boxes = self.ctx.detector.detect(frame)?;
        self.ctx.metrics.record_frame_processed(started.elapsed().as_millis() as u64);
        trace!(camera_id = %self.camera_id, vehicles = boxes.len(), "frame_processed");

        let mut changes = 0;
        for result in map_occupancy(&self.spots, &boxes) {
            let Transition::Changed { previous } = self.ctx.store.observe(result.spot_id, result.status)
            else {
                continue;
            };

            let plate = match (self.read_plates, result.status, result.covering) {
                (true, SpotStatus::Occupied, Some(vehicle)) => self.read_plate(frame, &vehicle),
                _ => None,
            };

            info!(
                camera_id = %self.camera_id,
                spot_id = %result.spot_id,
                from = previous.map(|s| s.as_str()).unwrap_or("unknown"),
                to = %result.status,
                plate = plate.as_deref().unwrap_or(""),
                "spot_status_changed"
            );
            self.ctx.metrics.record_status_change();
            self.ctx
                .bus
                .publish(StatusChangeEvent::new(result.spot_id, result.status).with_plate(plate));
            changes += 1;
        }
        Ok(changes)
    }

    fn read_plate(&self, frame: &Frame, vehicle: &VehicleBox) -> Option<String> {
        match self.ctx.detector.read_text(frame, vehicle) {
            Ok(plate) => plate,
            Err(e) => {
                debug!(camera_id = %self.camera_id, error = %e, "plate_read_failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Region, SpotId};
    use crate::io::frame_source::SourceError;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Source replaying a script of frames; `None` entries simulate read failures
    struct ScriptedSource {
        script: Arc<Mutex<VecDeque<Option<u8>>>>,
    }

    impl FrameSource for ScriptedSource {
        fn read_frame(&mut self) -> Option<Frame> {
            match self.script.lock().pop_front() {
                Some(Some(tag)) => Some(Frame::new(vec![tag])),
                _ => None,
            }
        }
    }

    struct ScriptedConnector {
        script: Arc<Mutex<VecDeque<Option<u8>>>>,
        opens: Arc<AtomicUsize>,
        fail_first_opens: usize,
    }

    impl SourceConnector for ScriptedConnector {
        fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, SourceError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_opens {
                return Err(SourceError::Open { url: url.to_string(), reason: "refused".into() });
            }
            Ok(Box::new(ScriptedSource { script: self.script.clone() }))
        }
    }

    /// Detector keyed on the first frame byte: 1 = car on spot 1, 2 = error,
    /// anything else = empty lot
    struct TaggedDetector {
        plate: Option<String>,
        plate_calls: AtomicUsize,
    }

    impl Detector for TaggedDetector {
        fn detect(&self, frame: &Frame) -> Result<Vec<VehicleBox>, DetectionError> {
            match frame.data.first() {
                Some(1) => Ok(vec![VehicleBox::new(0, 0, 100, 100)]),
                Some(2) => Err(DetectionError::Status { status: 500, body: "boom".into() }),
                _ => Ok(Vec::new()),
            }
        }

        fn read_text(&self, _: &Frame, _: &VehicleBox) -> Result<Option<String>, DetectionError> {
            self.plate_calls.fetch_add(1, Ordering::SeqCst);
            match &self.plate {
                Some(p) => Ok(Some(p.clone())),
                None => Err(DetectionError::Status { status: 503, body: "ocr down".into() }),
            }
        }
    }

    struct Harness {
        monitor: CameraMonitor,
        script: Arc<Mutex<VecDeque<Option<u8>>>>,
        opens: Arc<AtomicUsize>,
        store: Arc<StatusStore>,
        bus: EventBus,
        detector: Arc<TaggedDetector>,
        metrics: Arc<Metrics>,
    }

    fn harness(fail_first_opens: usize, read_plates: bool, plate: Option<&str>) -> Harness {
        let script = Arc::new(Mutex::new(VecDeque::new()));
        let opens = Arc::new(AtomicUsize::new(0));
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(StatusStore::new());
        let bus = EventBus::new(64, metrics.clone());
        let detector = Arc::new(TaggedDetector {
            plate: plate.map(str::to_string),
            plate_calls: AtomicUsize::new(0),
        });
        let camera = Camera {
            id: CameraId(1),
            name: "cam-1".into(),
            stream_url: "test://cam-1".into(),
            zone_id: None,
        };
        let spots = vec![
            SpotRegion { id: SpotId(1), region: Region::new(10, 10, 60, 60) },
            SpotRegion { id: SpotId(2), region: Region::new(200, 10, 260, 60) },
        ];
        let connector =
            ScriptedConnector { script: script.clone(), opens: opens.clone(), fail_first_opens };
        let ctx = MonitorContext {
            store: store.clone(),
            bus: bus.clone(),
            metrics: metrics.clone(),
            detector: detector.clone(),
        };
        let timings = MonitorTimings {
            frame_interval: Duration::from_millis(500),
            reconnect_backoff: Duration::from_millis(1),
            idle_sleep: Duration::from_millis(1),
        };
        let monitor =
            CameraMonitor::new(&camera, spots, Box::new(connector), ctx, timings, read_plates);
        Harness { monitor, script, opens, store, bus, detector, metrics }
    }

    impl Harness {
        fn push(&self, frames: &[Option<u8>]) {
            self.script.lock().extend(frames.iter().copied());
        }
    }

    #[test]
    fn test_first_frame_publishes_every_spot() {
        let mut h = harness(0, false, None);
        let mut sub = h.bus.subscribe("test");
        h.push(&[Some(1)]);

        let t0 = Instant::now();
        assert_eq!(h.monitor.poll_once(t0), PollOutcome::Processed { changes: 2 });
        assert_eq!(h.store.get(SpotId(1)), Some(SpotStatus::Occupied));
        assert_eq!(h.store.get(SpotId(2)), Some(SpotStatus::Free));

        let events: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].spot_id, SpotId(1));
        assert_eq!(events[0].status, SpotStatus::Occupied);
    }

    #[test]
    fn test_unchanged_frames_publish_nothing() {
        let mut h = harness(0, false, None);
        let t0 = Instant::now();
        h.push(&[Some(1), Some(1)]);
        h.monitor.poll_once(t0);

        let mut sub = h.bus.subscribe("late");
        let t1 = t0 + Duration::from_millis(600);
        assert_eq!(h.monitor.poll_once(t1), PollOutcome::Processed { changes: 0 });
        assert!(sub.try_recv().is_none());
        assert_eq!(h.metrics.status_changes_total(), 2);
    }

    #[test]
    fn test_frames_inside_interval_are_read_but_skipped() {
        let mut h = harness(0, false, None);
        let t0 = Instant::now();
        h.push(&[Some(0), Some(1), Some(1)]);

        assert_eq!(h.monitor.poll_once(t0), PollOutcome::Processed { changes: 2 });
        assert_eq!(h.monitor.poll_once(t0 + Duration::from_millis(100)), PollOutcome::Skipped);
        assert_eq!(h.store.get(SpotId(1)), Some(SpotStatus::Free));
        // Exactly one interval later counts as elapsed
        assert_eq!(
            h.monitor.poll_once(t0 + Duration::from_millis(500)),
            PollOutcome::Processed { changes: 1 }
        );
        assert_eq!(h.store.get(SpotId(1)), Some(SpotStatus::Occupied));
    }

    #[test]
    fn test_read_failure_reopens_source() {
        let mut h = harness(0, false, None);
        let t0 = Instant::now();
        h.push(&[Some(0), None, Some(1)]);

        assert!(matches!(h.monitor.poll_once(t0), PollOutcome::Processed { .. }));
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);
        assert_eq!(h.monitor.poll_once(t0 + Duration::from_secs(1)), PollOutcome::SourceDown);
        assert_eq!(
            h.monitor.poll_once(t0 + Duration::from_secs(2)),
            PollOutcome::Processed { changes: 1 }
        );
        assert_eq!(h.opens.load(Ordering::SeqCst), 2);
        assert_eq!(h.metrics.source_failures_total(), 1);
    }

    #[test]
    fn test_open_failures_retry_until_source_available() {
        let mut h = harness(2, false, None);
        let t0 = Instant::now();
        h.push(&[Some(1)]);

        assert_eq!(h.monitor.poll_once(t0), PollOutcome::SourceDown);
        assert_eq!(h.monitor.poll_once(t0), PollOutcome::SourceDown);
        assert_eq!(h.monitor.poll_once(t0), PollOutcome::Processed { changes: 2 });
        assert_eq!(h.metrics.source_failures_total(), 2);
    }

    #[test]
    fn test_detection_failure_skips_frame_only() {
        let mut h = harness(0, false, None);
        let t0 = Instant::now();
        h.push(&[Some(2), Some(1)]);

        assert_eq!(h.monitor.poll_once(t0), PollOutcome::DetectionFailed);
        assert!(h.store.is_empty());
        assert_eq!(h.metrics.detection_failures_total(), 1);
        assert_eq!(
            h.monitor.poll_once(t0 + Duration::from_secs(1)),
            PollOutcome::Processed { changes: 2 }
        );
        // Source kept across the failed frame
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_plate_attached_to_occupied_transition() {
        let mut h = harness(0, true, Some("KA01AB1234"));
        let mut sub = h.bus.subscribe("test");
        h.push(&[Some(1)]);
        h.monitor.poll_once(Instant::now());

        let events: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        let occupied = events.iter().find(|e| e.spot_id == SpotId(1)).unwrap();
        assert_eq!(occupied.plate.as_deref(), Some("KA01AB1234"));
        let free = events.iter().find(|e| e.spot_id == SpotId(2)).unwrap();
        assert_eq!(free.plate, None);
        assert_eq!(h.detector.plate_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_plate_failure_does_not_block_event() {
        let mut h = harness(0, true, None);
        let mut sub = h.bus.subscribe("test");
        h.push(&[Some(1)]);

        assert_eq!(h.monitor.poll_once(Instant::now()), PollOutcome::Processed { changes: 2 });
        let first = sub.try_recv().unwrap();
        assert_eq!(first.status, SpotStatus::Occupied);
        assert_eq!(first.plate, None);
    }

    #[test]
    fn test_plates_not_read_when_disabled() {
        let mut h = harness(0, false, Some("KA01AB1234"));
        h.push(&[Some(1)]);
        h.monitor.poll_once(Instant::now());
        assert_eq!(h.detector.plate_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_timings_from_config() {
        let config = Config::default().with_monitor_timings(4.0, 1000, 20);
        let timings = MonitorTimings::from_config(&config);
        assert_eq!(timings.frame_interval, Duration::from_millis(250));
        assert_eq!(timings.reconnect_backoff, Duration::from_secs(1));
        assert_eq!(timings.idle_sleep, Duration::from_millis(20));
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let h = harness(0, false, None);
        h.push(&[Some(1)]);
        let store = h.store.clone();
        let (tx, rx) = watch::channel(false);

        let handle = h.monitor.spawn(rx).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.get(SpotId(1)).is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        tx.send(true).unwrap();
        handle.join().unwrap();

        assert_eq!(store.get(SpotId(1)), Some(SpotStatus::Occupied));
    }
}
