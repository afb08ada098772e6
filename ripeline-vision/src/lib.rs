//! Ripeline Vision
//!
//! Image acquisition and classification for the edge node:
//!
//! - [`camera`]: capture policy (retries, best-of-N) over a [`FrameSource`]
//! - [`frame`]: captured frames and the Laplacian sharpness score
//! - [`classifier`]: preprocessing and argmax selection around a [`Model`]
//! - [`model_loader`]: cached download of the model artifact
//!
//! Hardware backends are behind features: `v4l` for the V4L2 camera driver
//! and `torch` for the TorchScript model.

#![deny(unsafe_code)]

pub mod camera;
pub mod classifier;
pub mod frame;
pub mod model_loader;

#[cfg(feature = "torch")]
pub mod torch;

#[cfg(all(feature = "v4l", target_os = "linux"))]
pub mod v4l_camera;

pub use camera::{scan_devices, Camera, CaptureError, FrameInfo, FrameSource, PictureControl};
pub use classifier::{Classifier, InferenceError, Model, Prediction};
pub use frame::Frame;
pub use model_loader::{load_model, ModelArtifact, ModelLoadError, ModelRepository};

#[cfg(feature = "torch")]
pub use torch::TorchScriptModel;

#[cfg(all(feature = "v4l", target_os = "linux"))]
pub use v4l_camera::{available_cameras, V4lCamera};
