//! In-process fakes for the capture pipeline seams.

use crate::capture::Pipeline;
use emotag_core::detector::DetectorError;
use emotag_core::expression::ClassifierError;
use emotag_core::{BoundingBox, Emotion, EmotionClassifier, EmotionScore, FaceDetector, FaceResult};
use emotag_hw::{CameraError, Frame, FrameSource};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FRAME_SIDE: u32 = 64;

/// Counters and knobs shared between a test and its [`FakeSource`].
#[derive(Default)]
pub struct SourceProbe {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub reads: AtomicUsize,
    /// Sources currently open; never exceeds 1 for a correct loop.
    pub open_handles: AtomicUsize,
    pub fail_reads: AtomicBool,
}

impl SourceProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

pub struct FakeSource {
    probe: Arc<SourceProbe>,
    open: bool,
    fail_open: bool,
    sequence: u32,
}

impl FakeSource {
    pub fn new(probe: &Arc<SourceProbe>) -> Self {
        Self {
            probe: Arc::clone(probe),
            open: false,
            fail_open: false,
            sequence: 0,
        }
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }
}

impl FrameSource for FakeSource {
    fn open(&mut self) -> Result<(), CameraError> {
        if self.open {
            return Ok(());
        }
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            return Err(CameraError::DeviceNotFound("fake0".into()));
        }
        self.open = true;
        self.probe.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        if !self.open {
            return Err(CameraError::NotOpen);
        }
        self.probe.reads.fetch_add(1, Ordering::SeqCst);
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        if self.probe.fail_reads.load(Ordering::SeqCst) {
            return Err(CameraError::CaptureFailed("fake read failure".into()));
        }
        Ok(Frame::new(
            RgbImage::from_pixel(FRAME_SIDE, FRAME_SIDE, Rgb([120, 120, 120])),
            seq,
        ))
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
            self.probe.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn describe(&self) -> String {
        "fake0".into()
    }
}

/// Reports a fixed number of non-overlapping faces on every frame.
pub struct FakeDetector {
    faces: usize,
}

impl FakeDetector {
    pub fn faces(faces: usize) -> Self {
        Self { faces }
    }
}

impl FaceDetector for FakeDetector {
    fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        Ok((0..self.faces)
            .map(|i| BoundingBox {
                x: 2.0 + i as f32 * 20.0,
                y: 8.0,
                width: 16.0,
                height: 16.0,
                confidence: 0.9,
            })
            .collect())
    }
}

pub struct FakeClassifier {
    scores: FaceResult,
    fail_every: Option<usize>,
    delay: Duration,
    calls: usize,
}

impl FakeClassifier {
    pub fn returning(scores: &[(Emotion, f32)]) -> Self {
        Self {
            scores: scores
                .iter()
                .map(|&(label, score)| EmotionScore { label, score })
                .collect(),
            fail_every: None,
            delay: Duration::ZERO,
            calls: 0,
        }
    }

    pub fn happy() -> Self {
        Self::returning(&[(Emotion::Happy, 0.8), (Emotion::Sad, 0.2)])
    }

    /// Fail every `n`th call (the `n`th, `2n`th, ...).
    pub fn failing_every(mut self, n: usize) -> Self {
        self.fail_every = Some(n);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl EmotionClassifier for FakeClassifier {
    fn input_size(&self) -> u32 {
        16
    }

    fn classify(&mut self, _face: &RgbImage) -> Result<FaceResult, ClassifierError> {
        self.calls += 1;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail_every.is_some_and(|n| self.calls % n == 0) {
            return Err(ClassifierError::InferenceFailed("fake inference failure".into()));
        }
        Ok(self.scores.clone())
    }
}

pub fn fake_pipeline(
    probe: &Arc<SourceProbe>,
    faces: usize,
    classifier: FakeClassifier,
) -> Pipeline {
    Pipeline {
        source: Box::new(FakeSource::new(probe)),
        detector: Box::new(FakeDetector::faces(faces)),
        classifier: Box::new(classifier),
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
