//! emotag-core: emotion capture data model and topic aggregation.
//!
//! Face detection (SCRFD) and expression inference run via ONNX Runtime
//! behind the [`FaceDetector`] and [`EmotionClassifier`] traits; tagged
//! snapshots accumulate in a [`TopicStore`] and [`classify`] ranks topics.

pub mod aggregate;
pub mod crop;
pub mod detector;
pub mod expression;
pub mod store;
pub mod types;

pub use aggregate::{classify, Classification, TopicScore};
pub use detector::{FaceDetector, ScrfdDetector};
pub use expression::{EmotionClassifier, OnnxEmotionClassifier};
pub use store::{TopicHistory, TopicMap, TopicStore};
pub use types::{
    BoundingBox, Emotion, EmotionScore, FaceResult, Snapshot, TaggedScore, TaggedSnapshot,
};

use std::path::PathBuf;

/// Where packaged models live when `EMOTAG_MODEL_DIR` is unset.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/emotag/models")
}
