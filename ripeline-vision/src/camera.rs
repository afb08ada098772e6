//! Image acquisition with bounded retries
//!
//! [`Camera`] wraps a [`FrameSource`] (the device driver) and adds the
//! capture policy:
//!
//! - [`Camera::capture`] tries up to `capture_retries` times, sleeping
//!   `retry_delay` between attempts. Any attempt that yields no usable frame
//!   (an empty buffer, an undecodable frame, or a driver error) spends one
//!   attempt.
//! - [`Camera::capture_best_of`] takes `n` frames in sequence and keeps the
//!   sharpest one.
//!
//! The device handle is released exactly once, either explicitly through
//! [`Camera::release`] or when the camera is dropped.
//!
//! Picture controls (brightness, contrast, saturation) are optional: a
//! driver that cannot adjust one reports [`CaptureError::Unsupported`].

use std::fmt;
use std::thread;
use std::time::Duration;

use image::RgbImage;
use ripeline_core::config::{CameraConfig, CaptureStrategy};
use thiserror::Error;

use crate::frame::Frame;

/// Image acquisition failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Every attempt in the retry budget came back without a usable frame
    #[error("camera unavailable after {attempts} attempts")]
    DeviceUnavailable { attempts: u32 },

    /// Multi-frame capture got zero frames
    #[error("no frames captured out of {requested}")]
    NoFrames { requested: u32 },

    /// Driver-level failure for a single attempt
    #[error("device error: {0}")]
    Device(String),

    /// The driver has no such picture control
    #[error("{0} control not supported by this device")]
    Unsupported(PictureControl),
}

/// Adjustable picture controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PictureControl {
    Brightness,
    Contrast,
    Saturation,
}

impl PictureControl {
    pub fn name(self) -> &'static str {
        match self {
            Self::Brightness => "brightness",
            Self::Contrast => "contrast",
            Self::Saturation => "saturation",
        }
    }

    /// Whether a driver control label refers to this control
    pub fn matches(self, label: &str) -> bool {
        label.trim().eq_ignore_ascii_case(self.name())
    }
}

impl fmt::Display for PictureControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Actual device settings after initialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub device: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Current picture controls; `None` when the driver does not expose one
    pub brightness: Option<i64>,
    pub contrast: Option<i64>,
    pub saturation: Option<i64>,
}

impl FrameInfo {
    pub fn new(device: u32, width: u32, height: u32, fps: u32) -> Self {
        Self {
            device,
            width,
            height,
            fps,
            brightness: None,
            contrast: None,
            saturation: None,
        }
    }

    pub fn control(&self, control: PictureControl) -> Option<i64> {
        match control {
            PictureControl::Brightness => self.brightness,
            PictureControl::Contrast => self.contrast,
            PictureControl::Saturation => self.saturation,
        }
    }
}

/// Device indices tried by [`scan_devices`] (`/dev/video0` to `/dev/video9`)
pub const MAX_DEVICES: u32 = 10;

/// Try every device index and keep the ones that answer
pub fn scan_devices(open: impl FnMut(u32) -> Option<FrameInfo>) -> Vec<FrameInfo> {
    let found: Vec<FrameInfo> = (0..MAX_DEVICES).filter_map(open).collect();
    for info in &found {
        log::info!("camera {}: /dev/video{} ({}x{})", info.device, info.device, info.width, info.height);
    }
    if found.is_empty() {
        log::warn!("no cameras found");
    }
    found
}

/// A camera driver
///
/// Implementations are initialized before they are handed to [`Camera`];
/// `read_frame` is the per-event hot path.
pub trait FrameSource {
    /// Grab one frame; `Ok(None)` when the device produced nothing usable
    fn read_frame(&mut self) -> Result<Option<RgbImage>, CaptureError>;

    /// Negotiated device settings
    fn info(&self) -> Option<FrameInfo> {
        None
    }

    /// Adjust a picture control
    fn set_control(&mut self, control: PictureControl, _value: i64) -> Result<(), CaptureError> {
        Err(CaptureError::Unsupported(control))
    }

    /// Close the device handle
    fn release(&mut self) {}
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        (**self).read_frame()
    }

    fn info(&self) -> Option<FrameInfo> {
        (**self).info()
    }

    fn set_control(&mut self, control: PictureControl, value: i64) -> Result<(), CaptureError> {
        (**self).set_control(control, value)
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Capture policy around a [`FrameSource`]
pub struct Camera<S: FrameSource> {
    source: S,
    retries: u32,
    retry_delay: Duration,
    released: bool,
}

impl<S: FrameSource> Camera<S> {
    pub fn new(source: S, config: &CameraConfig) -> Self {
        Self {
            source,
            retries: config.capture_retries.max(1),
            retry_delay: config.retry_delay,
            released: false,
        }
    }

    /// Capture a single frame within the retry budget
    pub fn capture(&mut self) -> Result<Frame, CaptureError> {
        if self.released {
            return Err(CaptureError::DeviceUnavailable { attempts: 0 });
        }

        for attempt in 1..=self.retries {
            match self.source.read_frame() {
                Ok(Some(image)) => return Ok(Frame::new(image)),
                Ok(None) => log::warn!("capture attempt {attempt}/{} returned no frame", self.retries),
                Err(e) => log::warn!("capture attempt {attempt}/{} failed: {e}", self.retries),
            }
            if attempt < self.retries && !self.retry_delay.is_zero() {
                thread::sleep(self.retry_delay);
            }
        }

        log::error!("failed to capture frame after {} attempts", self.retries);
        Err(CaptureError::DeviceUnavailable {
            attempts: self.retries,
        })
    }

    /// Capture `n` frames and return the sharpest
    pub fn capture_best_of(&mut self, n: u32, inter_frame_delay: Duration) -> Result<Frame, CaptureError> {
        let mut best: Option<Frame> = None;

        for i in 0..n {
            match self.capture() {
                Ok(frame) => {
                    let frame = frame.scored();
                    let score = frame.sharpness.unwrap_or_default();
                    log::debug!("frame {}/{n} sharpness {score:.2}", i + 1);
                    if best.as_ref().map_or(true, |b| score > b.sharpness.unwrap_or_default()) {
                        best = Some(frame);
                    }
                }
                Err(e) => log::warn!("frame {}/{n} failed: {e}", i + 1),
            }
            if i + 1 < n && !inter_frame_delay.is_zero() {
                thread::sleep(inter_frame_delay);
            }
        }

        match best {
            Some(frame) => {
                log::info!("selected frame with sharpness {:.2}", frame.sharpness.unwrap_or_default());
                Ok(frame)
            }
            None => Err(CaptureError::NoFrames { requested: n }),
        }
    }

    /// Capture according to the configured strategy
    pub fn capture_with(&mut self, strategy: CaptureStrategy) -> Result<Frame, CaptureError> {
        match strategy {
            CaptureStrategy::Single => self.capture(),
            CaptureStrategy::BestOf {
                frames,
                inter_frame_delay,
            } => self.capture_best_of(frames, inter_frame_delay),
        }
    }

    pub fn frame_info(&self) -> Option<FrameInfo> {
        if self.released {
            return None;
        }
        self.source.info()
    }

    pub fn set_brightness(&mut self, value: i64) -> Result<(), CaptureError> {
        self.set_control(PictureControl::Brightness, value)
    }

    pub fn set_contrast(&mut self, value: i64) -> Result<(), CaptureError> {
        self.set_control(PictureControl::Contrast, value)
    }

    pub fn set_control(&mut self, control: PictureControl, value: i64) -> Result<(), CaptureError> {
        if self.released {
            return Err(CaptureError::Device("camera released".into()));
        }
        self.source.set_control(control, value)?;
        log::info!("{control} set to {value}");
        Ok(())
    }

    /// Apply the picture controls requested in `config`
    ///
    /// A control the device rejects is logged and skipped.
    pub fn apply_controls(&mut self, config: &CameraConfig) {
        let requested = [
            (PictureControl::Brightness, config.brightness),
            (PictureControl::Contrast, config.contrast),
        ];
        for (control, value) in requested {
            if let Some(value) = value {
                if let Err(e) = self.set_control(control, value) {
                    log::warn!("could not set {control}: {e}");
                }
            }
        }
    }

    /// Release the device; safe to call more than once
    pub fn release(&mut self) {
        if !self.released {
            self.source.release();
            self.released = true;
            log::info!("camera released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl<S: FrameSource> Drop for Camera<S> {
    fn drop(&mut self) {
        self.release();
    }
}
