//! Facial-expression inference: the [`EmotionClassifier`] seam and an ONNX adapter.
//!
//! The adapter takes a square RGB face crop, normalizes it, runs a single
//! forward pass and maps the output vector onto [`Emotion`] labels using a
//! configurable label order (models disagree on it).

use crate::types::{rank_scores, Emotion, EmotionScore, FaceResult};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

/// Square side the default model expects.
pub const DEFAULT_INPUT_SIZE: u32 = 224;
// ViT-style normalization on [0, 1] pixels.
const PIXEL_MEAN: f32 = 0.5;
const PIXEL_STD: f32 = 0.5;
/// Outputs already within this distance of summing to 1 are treated as probabilities.
const PROBABILITY_SUM_TOLERANCE: f32 = 1e-3;

/// Output order of the default 7-class model.
pub const DEFAULT_LABELS: [Emotion; 7] = [
    Emotion::Neutral,
    Emotion::Happy,
    Emotion::Sad,
    Emotion::Surprise,
    Emotion::Fear,
    Emotion::Disgust,
    Emotion::Anger,
];

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("face crop is {actual}x{actual_h}, model expects {expected}x{expected}")]
    BadInputSize {
        expected: u32,
        actual: u32,
        actual_h: u32,
    },
    #[error("model produced {actual} scores for {expected} labels")]
    LabelMismatch { expected: usize, actual: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scores one cropped face.
pub trait EmotionClassifier: Send {
    /// Square side length of the crop this classifier wants.
    fn input_size(&self) -> u32;

    /// Rank emotions for a face crop of `input_size()`², highest score first.
    fn classify(&mut self, face: &RgbImage) -> Result<FaceResult, ClassifierError>;
}

/// ONNX expression model with a fixed label order.
pub struct OnnxEmotionClassifier {
    session: Session,
    labels: Vec<Emotion>,
    input_size: u32,
}

impl OnnxEmotionClassifier {
    pub fn load(
        model_path: &str,
        labels: Vec<Emotion>,
        input_size: u32,
    ) -> Result<Self, ClassifierError> {
        if !Path::new(model_path).exists() {
            return Err(ClassifierError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            input_size,
            labels = ?labels,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded expression model"
        );

        Ok(Self {
            session,
            labels,
            input_size,
        })
    }

    /// RGB crop → NCHW float tensor.
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let (w, h) = face.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
        for (x, y, px) in face.enumerate_pixels() {
            for c in 0..3 {
                let v = px.0[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (v - PIXEL_MEAN) / PIXEL_STD;
            }
        }
        tensor
    }
}

impl EmotionClassifier for OnnxEmotionClassifier {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn classify(&mut self, face: &RgbImage) -> Result<FaceResult, ClassifierError> {
        if face.dimensions() != (self.input_size, self.input_size) {
            return Err(ClassifierError::BadInputSize {
                expected: self.input_size,
                actual: face.width(),
                actual_h: face.height(),
            });
        }

        let input = Self::preprocess(face);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("expression scores: {e}")))?;

        scores_from_output(raw, &self.labels)
    }
}

/// Turn a raw output vector into ranked scores.
///
/// Logits are softmaxed; vectors that already look like probabilities are kept.
pub fn scores_from_output(raw: &[f32], labels: &[Emotion]) -> Result<FaceResult, ClassifierError> {
    if raw.len() != labels.len() {
        return Err(ClassifierError::LabelMismatch {
            expected: labels.len(),
            actual: raw.len(),
        });
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(ClassifierError::InferenceFailed("non-finite model output".into()));
    }

    let probs = if looks_like_probabilities(raw) {
        raw.to_vec()
    } else {
        softmax(raw)
    };

    let mut scores: Vec<EmotionScore> = labels
        .iter()
        .zip(probs)
        .map(|(&label, score)| EmotionScore { label, score })
        .collect();
    rank_scores(&mut scores);
    Ok(scores)
}

fn looks_like_probabilities(v: &[f32]) -> bool {
    v.iter().all(|p| (0.0..=1.0).contains(p))
        && (v.iter().sum::<f32>() - 1.0).abs() < PROBABILITY_SUM_TOLERANCE
}

fn softmax(v: &[f32]) -> Vec<f32> {
    let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = v.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Parse a comma-separated label order, e.g. `"angry,disgust,fear,happy,neutral,sad,surprise"`.
pub fn parse_labels(list: &str) -> Result<Vec<Emotion>, crate::types::UnknownEmotion> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect()
}
