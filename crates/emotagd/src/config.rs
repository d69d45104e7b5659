use emotag_core::detector::DEFAULT_CONFIDENCE_THRESHOLD;
use emotag_core::expression::{parse_labels, DEFAULT_INPUT_SIZE, DEFAULT_LABELS};
use emotag_core::Emotion;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration: optional TOML file, then `EMOTAG_*` environment overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Frames discarded after opening the camera (exposure/white-balance settling).
    pub warmup_frames: usize,
    /// Pause between capture iterations.
    pub frame_interval: Duration,
    /// Upper bound on how long `stop` waits for the capture thread.
    pub stop_timeout: Duration,
    /// Consecutive failed iterations before health reports degraded.
    pub degraded_after: u32,
    /// Square side of the face crop fed to the expression model.
    pub face_input_size: u32,
    /// Output order of the expression model.
    pub emotion_labels: Vec<Emotion>,
    /// Minimum face detection score.
    pub detector_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: emotag_core::default_model_dir(),
            warmup_frames: 5,
            frame_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_millis(2000),
            degraded_after: 10,
            face_input_size: DEFAULT_INPUT_SIZE,
            emotion_labels: DEFAULT_LABELS.to_vec(),
            detector_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

/// On-disk overrides; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    model_dir: Option<PathBuf>,
    warmup_frames: Option<usize>,
    frame_interval_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
    degraded_after: Option<u32>,
    face_input_size: Option<u32>,
    emotion_labels: Option<Vec<Emotion>>,
    detector_threshold: Option<f32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl Config {
    /// Load from the config file (if any) and `EMOTAG_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = config_path() {
            if path.exists() {
                config.apply_file(&path)?;
                tracing::info!(path = %path.display(), "loaded config file");
            }
        }
        config.apply_env(|key| std::env::var(key).ok());
        config.sanitize();
        Ok(config)
    }

    /// Reset settings that would wedge the pipeline to their defaults.
    fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.face_input_size == 0 {
            tracing::warn!("face_input_size must be positive; using default");
            self.face_input_size = defaults.face_input_size;
        }
        if self.degraded_after == 0 {
            tracing::warn!("degraded_after must be positive; using default");
            self.degraded_after = defaults.degraded_after;
        }
        if self.stop_timeout.is_zero() {
            tracing::warn!("stop_timeout must be positive; using default");
            self.stop_timeout = defaults.stop_timeout;
        }
        if !(0.0..=1.0).contains(&self.detector_threshold) {
            tracing::warn!(
                value = self.detector_threshold,
                "detector_threshold must be within 0..=1; using default"
            );
            self.detector_threshold = defaults.detector_threshold;
        }
        if self.emotion_labels.is_empty() {
            tracing::warn!("emotion_labels is empty; using default label order");
            self.emotion_labels = defaults.emotion_labels;
        }
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        self.merge(file);
        Ok(())
    }

    fn merge(&mut self, file: FileConfig) {
        if let Some(v) = file.camera_device {
            self.camera_device = v;
        }
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.warmup_frames {
            self.warmup_frames = v;
        }
        if let Some(v) = file.frame_interval_ms {
            self.frame_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.stop_timeout_ms {
            self.stop_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.degraded_after {
            self.degraded_after = v;
        }
        if let Some(v) = file.face_input_size {
            self.face_input_size = v;
        }
        if let Some(v) = file.emotion_labels {
            self.emotion_labels = v;
        }
        if let Some(v) = file.detector_threshold {
            self.detector_threshold = v;
        }
    }

    /// Apply environment overrides. Unparseable values keep the current setting.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("EMOTAG_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("EMOTAG_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        self.warmup_frames = parsed(&var, "EMOTAG_WARMUP_FRAMES", self.warmup_frames);
        self.frame_interval = Duration::from_millis(parsed(
            &var,
            "EMOTAG_FRAME_INTERVAL_MS",
            self.frame_interval.as_millis() as u64,
        ));
        self.stop_timeout = Duration::from_millis(parsed(
            &var,
            "EMOTAG_STOP_TIMEOUT_MS",
            self.stop_timeout.as_millis() as u64,
        ));
        self.degraded_after = parsed(&var, "EMOTAG_DEGRADED_AFTER", self.degraded_after);
        self.face_input_size = parsed(&var, "EMOTAG_FACE_INPUT_SIZE", self.face_input_size);
        self.detector_threshold =
            parsed(&var, "EMOTAG_DETECTOR_THRESHOLD", self.detector_threshold);

        if let Some(v) = var("EMOTAG_EMOTION_LABELS") {
            match parse_labels(&v) {
                Ok(labels) if !labels.is_empty() => self.emotion_labels = labels,
                Ok(_) => {
                    tracing::warn!("EMOTAG_EMOTION_LABELS is empty; keeping default label order")
                }
                Err(e) => tracing::warn!(error = %e, "ignoring EMOTAG_EMOTION_LABELS"),
            }
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the facial-expression model.
    pub fn expression_model_path(&self) -> String {
        self.model_dir
            .join("facial_expression.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("EMOTAG_CONFIG") {
        return Some(PathBuf::from(p));
    }
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
        .ok()?;
    Some(base.join("emotag").join("emotagd.toml"))
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match var(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "unparseable value; keeping current setting");
                current
            }
        },
        None => current,
    }
}
