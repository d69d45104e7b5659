use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Topic stamped on scores read without a topic.
pub const UNTAGGED_TOPIC: &str = "none";

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Facial expression labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Neutral,
    Happy,
    Sad,
    Surprise,
    Fear,
    Disgust,
    Anger,
}

/// How an emotion counts toward a topic's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
    /// Counts toward neither side.
    Ignored,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprise,
        Emotion::Fear,
        Emotion::Disgust,
        Emotion::Anger,
    ];

    pub fn polarity(self) -> Polarity {
        match self {
            Emotion::Neutral | Emotion::Happy => Polarity::Positive,
            Emotion::Sad | Emotion::Anger | Emotion::Disgust | Emotion::Fear => Polarity::Negative,
            Emotion::Surprise => Polarity::Ignored,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Surprise => "surprise",
            Emotion::Fear => "fear",
            Emotion::Disgust => "disgust",
            Emotion::Anger => "anger",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown emotion label: {0}")]
pub struct UnknownEmotion(pub String);

impl FromStr for Emotion {
    type Err = UnknownEmotion;

    /// Case-insensitive; accepts the label spellings common FER models ship with.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "neutral" | "calm" => Ok(Emotion::Neutral),
            "happy" | "happiness" | "joy" => Ok(Emotion::Happy),
            "sad" | "sadness" => Ok(Emotion::Sad),
            "surprise" | "surprised" => Ok(Emotion::Surprise),
            "fear" | "fearful" | "scared" => Ok(Emotion::Fear),
            "disgust" | "disgusted" => Ok(Emotion::Disgust),
            "anger" | "angry" => Ok(Emotion::Anger),
            _ => Err(UnknownEmotion(s.to_string())),
        }
    }
}

/// One label's confidence for one face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionScore {
    pub label: Emotion,
    /// Confidence in [0, 1]. Scores for a face need not sum to 1.
    pub score: f32,
}

/// Scores for one detected face, sorted descending by score.
pub type FaceResult = Vec<EmotionScore>;

/// Sort scores descending.
pub fn rank_scores(scores: &mut [EmotionScore]) {
    scores.sort_by(|a, b| b.score.total_cmp(&a.score));
}

/// One capture iteration: every face that produced a result, and when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub num_faces: usize,
    pub faces: Vec<FaceResult>,
    pub captured_at: DateTime<Utc>,
    /// Frame sequence number from the source.
    pub sequence: u32,
}

impl Snapshot {
    /// Build a snapshot; `num_faces` is derived from `faces` so the two never disagree.
    pub fn new(faces: Vec<FaceResult>, sequence: u32) -> Self {
        Self {
            num_faces: faces.len(),
            faces,
            captured_at: Utc::now(),
            sequence,
        }
    }

    /// Stamp every score with `topic` (or [`UNTAGGED_TOPIC`]).
    pub fn stamped(&self, topic: Option<&str>) -> Vec<Vec<TaggedScore>> {
        let topic = topic.unwrap_or(UNTAGGED_TOPIC);
        self.faces
            .iter()
            .map(|face| {
                face.iter()
                    .map(|s| TaggedScore {
                        label: s.label,
                        score: s.score,
                        topic: topic.to_string(),
                    })
                    .collect()
            })
            .collect()
    }
}

/// An emotion score carrying the topic it was filed under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedScore {
    pub label: Emotion,
    pub score: f32,
    pub topic: String,
}

/// A snapshot filed under a topic at the moment of tagging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedSnapshot {
    pub topic: String,
    pub num_faces: usize,
    pub faces: Vec<Vec<TaggedScore>>,
    pub captured_at: DateTime<Utc>,
    pub tagged_at: DateTime<Utc>,
}

impl TaggedSnapshot {
    pub fn new(snapshot: &Snapshot, topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            num_faces: snapshot.num_faces,
            faces: snapshot.stamped(Some(topic)),
            captured_at: snapshot.captured_at,
            tagged_at: Utc::now(),
        }
    }

    /// Every (label, score) pair across all faces.
    pub fn scores(&self) -> impl Iterator<Item = (Emotion, f32)> + '_ {
        self.faces
            .iter()
            .flat_map(|face| face.iter().map(|s| (s.label, s.score)))
    }
}
