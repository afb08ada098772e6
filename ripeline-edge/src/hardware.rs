//! Camera and model bring-up
//!
//! Backends are chosen at build time. Without the `v4l` or `torch` feature
//! the corresponding component reports `FailedToInit`, so a binary built
//! for development fails at startup rather than at the first trigger.

use ripeline_core::config::{CameraConfig, ModelConfig};
use ripeline_core::InitOutcome;
use ripeline_vision::{Camera, FrameInfo, FrameSource, Model};

pub type DynCamera = Camera<Box<dyn FrameSource + Send>>;
pub type DynModel = Box<dyn Model + Send>;

#[cfg(all(feature = "v4l", target_os = "linux"))]
pub fn open_camera(config: &CameraConfig) -> InitOutcome<DynCamera> {
    ripeline_vision::V4lCamera::open(config).map(|source| {
        let source: Box<dyn FrameSource + Send> = Box::new(source);
        let mut camera = Camera::new(source, config);
        camera.apply_controls(config);
        camera
    })
}

/// Cameras present on this host
#[cfg(all(feature = "v4l", target_os = "linux"))]
pub fn list_cameras() -> Vec<FrameInfo> {
    ripeline_vision::available_cameras()
}

#[cfg(not(all(feature = "v4l", target_os = "linux")))]
pub fn open_camera(config: &CameraConfig) -> InitOutcome<DynCamera> {
    log::error!("no camera backend for /dev/video{}", config.device);
    InitOutcome::failed("camera", "built without the `v4l` feature")
}

#[cfg(not(all(feature = "v4l", target_os = "linux")))]
pub fn list_cameras() -> Vec<FrameInfo> {
    ripeline_vision::scan_devices(|_| None)
}

#[cfg(feature = "torch")]
pub fn open_model(config: &ModelConfig) -> InitOutcome<DynModel> {
    ripeline_vision::load_model(config, |artifact| {
        let model = ripeline_vision::TorchScriptModel::load(&artifact.path)?;
        Ok(Box::new(model) as DynModel)
    })
}

#[cfg(not(feature = "torch"))]
pub fn open_model(config: &ModelConfig) -> InitOutcome<DynModel> {
    log::error!("no inference backend for {}", config.repository);
    InitOutcome::failed("model", "built without the `torch` feature")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "torch"))]
    #[test]
    fn missing_model_backend_fails_to_init() {
        match open_model(&ModelConfig::new("someone/tomato-yolo")) {
            InitOutcome::FailedToInit(e) => assert_eq!(e.component, "model"),
            InitOutcome::Ready(_) => panic!("no backend compiled in"),
        }
    }

    #[cfg(not(all(feature = "v4l", target_os = "linux")))]
    #[test]
    fn missing_camera_backend_fails_to_init() {
        assert!(!open_camera(&CameraConfig::default()).is_ready());
        assert!(list_cameras().is_empty());
    }
}
