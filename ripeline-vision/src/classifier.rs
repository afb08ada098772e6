//! Classifier adapter
//!
//! The model is a black box behind the [`Model`] trait: it receives a
//! preprocessed `(size, size, 3)` tensor with values in `[0, 1]` and returns
//! one score per class. The adapter owns everything around it:
//!
//! 1. **Preprocess**: bilinear resize to the square input size, scale to `[0, 1]`
//! 2. **Invoke**: a single model call, no retries
//! 3. **Select**: argmax over the scores, confidence clamped into `[0, 1]`
//!
//! A model failure or unusable output is an [`InferenceError`]; the caller
//! drops the trigger and no partial record is produced.

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array3;
use thiserror::Error;

use crate::frame::Frame;

/// Classification failures for a single frame
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InferenceError {
    /// The model call itself failed
    #[error("model invocation failed: {0}")]
    Invocation(String),

    /// The model returned no scores
    #[error("model returned no scores")]
    EmptyOutput,

    /// Every score was NaN
    #[error("model returned no usable scores")]
    InvalidOutput,
}

/// Pretrained image classifier
pub trait Model {
    /// Per-class scores for one preprocessed image
    fn predict(&mut self, input: &Array3<f32>) -> Result<Vec<f64>, InferenceError>;
}

impl<M: Model + ?Sized> Model for Box<M> {
    fn predict(&mut self, input: &Array3<f32>) -> Result<Vec<f64>, InferenceError> {
        (**self).predict(input)
    }
}

/// Winning class for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub class_index: i64,
    /// Within `[0, 1]`
    pub confidence: f64,
}

/// Resize and normalize a frame into the model input layout (HWC, RGB)
pub fn preprocess(image: &RgbImage, size: u32) -> Array3<f32> {
    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
    let edge = size as usize;
    Array3::from_shape_fn((edge, edge, 3), |(y, x, c)| {
        f32::from(resized.get_pixel(x as u32, y as u32)[c]) / 255.0
    })
}

/// Pick the highest score and clamp it into a confidence
pub fn select(scores: &[f64]) -> Result<Prediction, InferenceError> {
    if scores.is_empty() {
        return Err(InferenceError::EmptyOutput);
    }

    let (class_index, best) = scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, s)| !s.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, s)| match best {
            Some((_, b)) if b >= s => best,
            _ => Some((i, s)),
        })
        .ok_or(InferenceError::InvalidOutput)?;

    if !(0.0..=1.0).contains(&best) {
        log::warn!("model score {best} for class {class_index} outside [0, 1], clamping");
    }

    Ok(Prediction {
        class_index: class_index as i64,
        confidence: best.clamp(0.0, 1.0),
    })
}

/// Preprocess, invoke, select
pub struct Classifier<M: Model> {
    model: M,
    input_size: u32,
}

impl<M: Model> Classifier<M> {
    pub fn new(model: M, input_size: u32) -> Self {
        Self { model, input_size }
    }

    pub fn classify(&mut self, frame: &Frame) -> Result<Prediction, InferenceError> {
        let input = preprocess(&frame.image, self.input_size);
        let scores = self.model.predict(&input)?;
        select(&scores)
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }
}
