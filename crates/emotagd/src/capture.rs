//! The capture loop: one OS thread that reads frames, detects faces, scores
//! their expressions and publishes the result as the live snapshot.
//!
//! The pipeline (frame source + both models) is moved into the thread on
//! `start` and handed back through its `JoinHandle` on `stop`, so the device
//! only ever has one user. Stopping is signalled over a channel that doubles
//! as the inter-frame sleep, which lets `stop` interrupt a sleeping loop
//! without waiting out the interval.

use emotag_core::crop::crop_face;
use emotag_core::detector::DetectorError;
use emotag_core::{EmotionClassifier, FaceDetector, Snapshot};
use emotag_hw::{CameraError, FrameSource};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// Ceiling for the failure backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(1);
/// Backoff base when the frame interval is configured as zero.
const MIN_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(#[from] CameraError),
    #[error("capture pipeline is still held by a capture thread that has not exited")]
    PipelineLost,
    #[error("capture thread did not stop within {0:?}; device handle leaked")]
    StopTimeout(Duration),
    #[error("failed to spawn capture thread: {0}")]
    ThreadSpawn(std::io::Error),
    #[error("capture thread panicked")]
    WorkerPanicked,
}

/// Why a single iteration produced no snapshot.
#[derive(Error, Debug)]
enum IterationError {
    #[error("frame read failed: {0}")]
    Read(#[from] CameraError),
    #[error("face detection failed: {0}")]
    Detect(#[from] DetectorError),
}

/// Everything the capture thread owns while running.
pub struct Pipeline {
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn FaceDetector>,
    pub classifier: Box<dyn EmotionClassifier>,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub warmup_frames: usize,
    pub frame_interval: Duration,
    pub stop_timeout: Duration,
    pub degraded_after: u32,
}

impl From<&crate::config::Config> for LoopSettings {
    fn from(c: &crate::config::Config) -> Self {
        Self {
            warmup_frames: c.warmup_frames,
            frame_interval: c.frame_interval,
            stop_timeout: c.stop_timeout,
            degraded_after: c.degraded_after,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    /// Too many consecutive iterations failed; the loop keeps retrying.
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub state: CaptureState,
    pub health: Health,
    pub frames_processed: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Live snapshot slot. `epoch` changes on every stop so a capture thread that
/// outlived its session cannot publish into the next one.
#[derive(Default)]
struct LiveSlot {
    epoch: u64,
    snapshot: Option<Arc<Snapshot>>,
}

/// State shared between the capture thread and readers.
struct Shared {
    live: RwLock<LiveSlot>,
    state: Mutex<CaptureState>,
    frames_processed: AtomicU64,
    consecutive_failures: AtomicU32,
    last_error: Mutex<Option<String>>,
    degraded_after: u32,
}

impl Shared {
    fn new(degraded_after: u32) -> Self {
        Self {
            live: RwLock::new(LiveSlot::default()),
            state: Mutex::new(CaptureState::Stopped),
            frames_processed: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_error: Mutex::new(None),
            degraded_after,
        }
    }

    fn epoch(&self) -> u64 {
        self.live.read().unwrap_or_else(|p| p.into_inner()).epoch
    }

    /// Replace the live snapshot whole, unless `epoch` has been retired.
    fn publish(&self, epoch: u64, snapshot: Snapshot) -> bool {
        let mut slot = self.live.write().unwrap_or_else(|p| p.into_inner());
        if slot.epoch != epoch {
            return false;
        }
        slot.snapshot = Some(Arc::new(snapshot));
        true
    }

    /// Drop the live snapshot and retire the current epoch.
    fn retire(&self) {
        let mut slot = self.live.write().unwrap_or_else(|p| p.into_inner());
        slot.epoch += 1;
        slot.snapshot = None;
    }

    fn live_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.live
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .snapshot
            .clone()
    }

    fn set_state(&self, state: CaptureState) {
        let mut current = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *current != state {
            tracing::debug!(from = ?*current, to = ?state, "capture state");
            *current = state;
        }
    }

    fn state(&self) -> CaptureState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = error;
    }

    fn record_success(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        let previous = self.consecutive_failures.swap(0, Ordering::Relaxed);
        if previous >= self.degraded_after {
            tracing::info!(after_failures = previous, "capture recovered");
        }
    }

    /// Count a failed iteration; returns the new consecutive-failure count.
    fn record_failure(&self, error: &IterationError) -> u32 {
        let n = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.set_last_error(Some(error.to_string()));
        if n == self.degraded_after {
            tracing::error!(consecutive = n, error = %error, "capture degraded");
        }
        n
    }

    fn reset_counters(&self) {
        self.frames_processed.store(0, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn status(&self) -> LoopStatus {
        let consecutive_failures = self.consecutive_failures.load(Ordering::Relaxed);
        LoopStatus {
            state: self.state(),
            health: if consecutive_failures >= self.degraded_after {
                Health::Degraded
            } else {
                Health::Healthy
            },
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            consecutive_failures,
            last_error: self.last_error.lock().unwrap_or_else(|p| p.into_inner()).clone(),
        }
    }
}

/// Read-only view of the loop for request handlers; never blocks on start/stop.
#[derive(Clone)]
pub struct CaptureMonitor {
    shared: Arc<Shared>,
}

impl CaptureMonitor {
    pub fn live_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.shared.live_snapshot()
    }

    pub fn status(&self) -> LoopStatus {
        self.shared.status()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state() == CaptureState::Running
    }
}

struct Worker {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: JoinHandle<Pipeline>,
}

pub struct CaptureLoop {
    settings: LoopSettings,
    shared: Arc<Shared>,
    /// Present while stopped.
    pipeline: Option<Pipeline>,
    /// Present while running.
    worker: Option<Worker>,
    /// A thread that missed the stop deadline; reclaimed once it finishes.
    parked: Option<JoinHandle<Pipeline>>,
}

impl CaptureLoop {
    pub fn new(pipeline: Pipeline, settings: LoopSettings) -> Self {
        Self {
            shared: Arc::new(Shared::new(settings.degraded_after)),
            settings,
            pipeline: Some(pipeline),
            worker: None,
            parked: None,
        }
    }

    pub fn monitor(&self) -> CaptureMonitor {
        CaptureMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.shared.state()
    }

    /// Open the source, discard warm-up frames and spawn the sampling thread.
    ///
    /// A no-op while already running.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.reclaim_parked();
        let mut pipeline = self.pipeline.take().ok_or(CaptureError::PipelineLost)?;

        self.shared.set_state(CaptureState::Starting);
        if let Err(e) = pipeline.source.open() {
            tracing::warn!(
                source = %pipeline.source.describe(),
                error = %e,
                "failed to open frame source"
            );
            self.pipeline = Some(pipeline);
            self.shared.set_state(CaptureState::Stopped);
            self.shared.set_last_error(Some(e.to_string()));
            return Err(CaptureError::DeviceUnavailable(e));
        }

        if self.settings.warmup_frames > 0 {
            tracing::info!(count = self.settings.warmup_frames, "discarding warmup frames");
            for _ in 0..self.settings.warmup_frames {
                if let Err(e) = pipeline.source.read_frame() {
                    tracing::debug!(error = %e, "warmup read failed");
                }
            }
        }

        self.shared.retire();
        self.shared.reset_counters();
        self.shared.set_last_error(None);

        let (stop_tx, stop_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let settings = self.settings.clone();
        let epoch = shared.epoch();

        let handle = std::thread::Builder::new()
            .name("emotag-capture".into())
            .spawn(move || {
                // Dropping done_tx on exit (including unwinding) is the completion signal.
                let _done = done_tx;
                run_loop(pipeline, &shared, &settings, epoch, &stop_rx)
            })
            .map_err(|e| {
                self.shared.set_state(CaptureState::Stopped);
                CaptureError::ThreadSpawn(e)
            })?;

        self.worker = Some(Worker {
            stop_tx,
            done_rx,
            handle,
        });
        self.shared.set_state(CaptureState::Running);
        tracing::info!("capture started");
        Ok(())
    }

    /// Signal the thread, wait up to `stop_timeout`, close the source.
    ///
    /// A no-op while stopped. On timeout the device stays with the thread and
    /// `StopTimeout` is returned.
    pub fn stop(&mut self) -> Result<(), CaptureError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.shared.set_state(CaptureState::Stopping);
        let _ = worker.stop_tx.send(());

        let result = match worker.done_rx.recv_timeout(self.settings.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => self.recover(worker.handle),
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!(
                    timeout = ?self.settings.stop_timeout,
                    "capture thread did not stop in time; device handle leaked"
                );
                self.parked = Some(worker.handle);
                let err = CaptureError::StopTimeout(self.settings.stop_timeout);
                self.shared.set_last_error(Some(err.to_string()));
                Err(err)
            }
        };

        self.shared.retire();
        self.shared.set_state(CaptureState::Stopped);
        if result.is_ok() {
            tracing::info!("capture stopped");
        }
        result
    }

    fn recover(&mut self, handle: JoinHandle<Pipeline>) -> Result<(), CaptureError> {
        match handle.join() {
            Ok(mut pipeline) => {
                pipeline.source.close();
                self.pipeline = Some(pipeline);
                Ok(())
            }
            Err(_) => {
                tracing::error!("capture thread panicked; frame source lost");
                Err(CaptureError::WorkerPanicked)
            }
        }
    }

    fn reclaim_parked(&mut self) {
        let finished = self.parked.as_ref().is_some_and(|h| h.is_finished());
        if !finished {
            return;
        }
        if let Some(handle) = self.parked.take() {
            if self.recover(handle).is_ok() {
                tracing::info!("reclaimed frame source from late capture thread");
            }
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!(error = %e, "capture loop dropped without a clean stop");
        }
    }
}

fn run_loop(
    mut pipeline: Pipeline,
    shared: &Shared,
    settings: &LoopSettings,
    epoch: u64,
    stop_rx: &Receiver<()>,
) -> Pipeline {
    tracing::info!(source = %pipeline.source.describe(), "capture thread started");
    loop {
        let wait = match capture_once(&mut pipeline) {
            Ok(snapshot) => {
                tracing::trace!(faces = snapshot.num_faces, seq = snapshot.sequence, "snapshot");
                shared.record_success();
                shared.publish(epoch, snapshot);
                settings.frame_interval
            }
            Err(e) => {
                let consecutive = shared.record_failure(&e);
                tracing::warn!(error = %e, consecutive, "capture iteration skipped");
                failure_backoff(settings.frame_interval, consecutive)
            }
        };

        match stop_rx.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::info!("capture thread exiting");
    pipeline
}

/// One iteration: read, detect, then crop and classify each face.
///
/// A face whose crop or inference fails is dropped; the rest of the frame still counts.
fn capture_once(pipeline: &mut Pipeline) -> Result<Snapshot, IterationError> {
    let frame = pipeline.source.read_frame()?;
    let boxes = pipeline.detector.detect(&frame.image)?;
    let size = pipeline.classifier.input_size();

    let mut faces = Vec::with_capacity(boxes.len());
    for (i, bbox) in boxes.iter().enumerate() {
        let crop = match crop_face(&frame.image, bbox, size) {
            Ok(crop) => crop,
            Err(e) => {
                tracing::debug!(face = i, error = %e, "skipping face: bad crop");
                continue;
            }
        };
        match pipeline.classifier.classify(&crop) {
            Ok(scores) => faces.push(scores),
            Err(e) => {
                tracing::warn!(face = i, error = %e, "skipping face: expression inference failed")
            }
        }
    }

    Ok(Snapshot::new(faces, frame.sequence))
}

/// Interval doubled per consecutive failure, capped.
fn failure_backoff(interval: Duration, consecutive: u32) -> Duration {
    let base = interval.max(MIN_BACKOFF);
    let factor = 1u32 << consecutive.saturating_sub(1).min(8);
    base.saturating_mul(factor).min(MAX_BACKOFF.max(interval))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, FakeClassifier, FakeDetector, FakeSource, SourceProbe};
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    fn settings() -> LoopSettings {
        LoopSettings {
            warmup_frames: 5,
            frame_interval: Duration::from_millis(5),
            stop_timeout: Duration::from_secs(2),
            degraded_after: 3,
        }
    }

    fn make_loop(
        source: FakeSource,
        detector: FakeDetector,
        classifier: FakeClassifier,
    ) -> CaptureLoop {
        CaptureLoop::new(
            Pipeline {
                source: Box::new(source),
                detector: Box::new(detector),
                classifier: Box::new(classifier),
            },
            settings(),
        )
    }

    #[test]
    fn test_start_discards_warmup_and_publishes() {
        let probe = SourceProbe::new();
        let mut capture = make_loop(
            FakeSource::new(&probe),
            FakeDetector::faces(2),
            FakeClassifier::happy(),
        );
        let monitor = capture.monitor();
        assert!(monitor.live_snapshot().is_none());

        capture.start().unwrap();
        assert_eq!(capture.state(), CaptureState::Running);
        assert!(wait_until(Duration::from_secs(2), || monitor.live_snapshot().is_some()));

        let snap = monitor.live_snapshot().unwrap();
        assert_eq!(snap.num_faces, 2);
        // Warmup frames never reach the snapshot: first published sequence is past them.
        assert!(snap.sequence >= 5, "sequence = {}", snap.sequence);

        capture.stop().unwrap();
    }

    #[test]
    fn test_start_twice_is_idempotent() {
        let probe = SourceProbe::new();
        let mut capture = make_loop(
            FakeSource::new(&probe),
            FakeDetector::faces(1),
            FakeClassifier::happy(),
        );
        capture.start().unwrap();
        capture.start().unwrap();
        assert_eq!(capture.state(), CaptureState::Running);
        assert_eq!(probe.opens.load(Ordering::SeqCst), 1);
        assert_eq!(probe.open_handles.load(Ordering::SeqCst), 1);
        capture.stop().unwrap();
    }

    #[test]
    fn test_open_failure_stays_stopped() {
        let probe = SourceProbe::new();
        let mut capture = make_loop(
            FakeSource::new(&probe).failing_open(),
            FakeDetector::faces(1),
            FakeClassifier::happy(),
        );
        let err = capture.start().unwrap_err();
        assert!(matches!(err, CaptureError::DeviceUnavailable(_)));
        assert_eq!(capture.state(), CaptureState::Stopped);
        // The pipeline is kept, so a later start can retry.
        assert!(matches!(capture.start(), Err(CaptureError::DeviceUnavailable(_))));
        assert_eq!(probe.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let probe = SourceProbe::new();
        let mut capture = make_loop(
            FakeSource::new(&probe),
            FakeDetector::faces(1),
            FakeClassifier::happy(),
        );
        capture.stop().unwrap();
        capture.stop().unwrap();
        assert_eq!(capture.state(), CaptureState::Stopped);
        assert_eq!(probe.closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_closes_source_and_clears_live() {
        let probe = SourceProbe::new();
        let mut capture = make_loop(
            FakeSource::new(&probe),
            FakeDetector::faces(1),
            FakeClassifier::happy(),
        );
        let monitor = capture.monitor();
        capture.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || monitor.live_snapshot().is_some()));

        capture.stop().unwrap();
        assert_eq!(capture.state(), CaptureState::Stopped);
        assert!(monitor.live_snapshot().is_none());
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
        assert_eq!(probe.open_handles.load(Ordering::SeqCst), 0);

        // The pipeline came back: the loop restarts on the same source.
        capture.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || monitor.live_snapshot().is_some()));
        capture.stop().unwrap();
        assert_eq!(probe.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_interrupts_long_interval() {
        let probe = SourceProbe::new();
        let mut capture = CaptureLoop::new(
            Pipeline {
                source: Box::new(FakeSource::new(&probe)),
                detector: Box::new(FakeDetector::faces(1)),
                classifier: Box::new(FakeClassifier::happy()),
            },
            LoopSettings {
                frame_interval: Duration::from_secs(30),
                ..settings()
            },
        );
        let monitor = capture.monitor();
        capture.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || monitor.live_snapshot().is_some()));

        let started = Instant::now();
        capture.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_read_failures_skip_and_degrade() {
        let probe = SourceProbe::new();
        let mut capture = make_loop(
            FakeSource::new(&probe),
            FakeDetector::faces(1),
            FakeClassifier::happy(),
        );
        let monitor = capture.monitor();
        probe.fail_reads.store(true, Ordering::SeqCst);
        capture.start().unwrap();

        assert!(wait_until(Duration::from_secs(3), || {
            monitor.status().health == Health::Degraded
        }));
        let status = monitor.status();
        assert_eq!(status.state, CaptureState::Running);
        assert!(status.consecutive_failures >= 3);
        assert!(status.last_error.is_some());
        assert!(monitor.live_snapshot().is_none());

        probe.fail_reads.store(false, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(3), || monitor.live_snapshot().is_some()));
        assert_eq!(monitor.status().health, Health::Healthy);
        capture.stop().unwrap();
    }

    #[test]
    fn test_face_failure_is_isolated() {
        let probe = SourceProbe::new();
        // Three faces per frame; every third classification fails.
        let mut capture = make_loop(
            FakeSource::new(&probe),
            FakeDetector::faces(3),
            FakeClassifier::happy().failing_every(3),
        );
        let monitor = capture.monitor();
        capture.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || monitor.live_snapshot().is_some()));
        let snap = monitor.live_snapshot().unwrap();
        assert_eq!(snap.num_faces, 2);
        assert_eq!(snap.faces.len(), 2);
        capture.stop().unwrap();
    }

    #[test]
    fn test_no_faces_is_not_an_error() {
        let probe = SourceProbe::new();
        let mut capture = make_loop(
            FakeSource::new(&probe),
            FakeDetector::faces(0),
            FakeClassifier::happy(),
        );
        let monitor = capture.monitor();
        capture.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || monitor.live_snapshot().is_some()));
        assert_eq!(monitor.live_snapshot().unwrap().num_faces, 0);
        assert_eq!(monitor.status().health, Health::Healthy);
        capture.stop().unwrap();
    }

    #[test]
    fn test_stop_timeout_is_surfaced_and_recoverable() {
        let probe = SourceProbe::new();
        let mut capture = CaptureLoop::new(
            Pipeline {
                source: Box::new(FakeSource::new(&probe)),
                detector: Box::new(FakeDetector::faces(1)),
                classifier: Box::new(
                    FakeClassifier::happy().with_delay(Duration::from_millis(400)),
                ),
            },
            LoopSettings {
                warmup_frames: 0,
                stop_timeout: Duration::from_millis(20),
                ..settings()
            },
        );
        let monitor = capture.monitor();
        capture.start().unwrap();
        // Let the thread enter a slow inference.
        std::thread::sleep(Duration::from_millis(50));

        let err = capture.stop().unwrap_err();
        assert!(matches!(err, CaptureError::StopTimeout(_)));
        assert_eq!(capture.state(), CaptureState::Stopped);
        assert!(monitor.status().last_error.is_some());

        // The late thread must not publish into the stopped session.
        std::thread::sleep(Duration::from_millis(600));
        assert!(monitor.live_snapshot().is_none());

        // Once it has exited, start reclaims the source.
        capture.start().unwrap();
        assert_eq!(capture.state(), CaptureState::Running);
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
        // Every iteration is slow, so this stop times out too.
        assert!(capture.stop().is_err());
    }

    #[test]
    fn test_failure_backoff_bounded() {
        let interval = Duration::from_millis(100);
        assert_eq!(failure_backoff(interval, 1), Duration::from_millis(100));
        assert_eq!(failure_backoff(interval, 2), Duration::from_millis(200));
        assert_eq!(failure_backoff(interval, 4), Duration::from_millis(800));
        assert_eq!(failure_backoff(interval, 50), Duration::from_secs(1));
        assert_eq!(failure_backoff(Duration::ZERO, 1), MIN_BACKOFF);
    }
}
