//! V4L2 camera driver
//!
//! Opens `/dev/videoN`, negotiates MJPG at the configured resolution and
//! frame rate, turns continuous autofocus off and reads one throwaway frame
//! to confirm the device actually streams. Frames are JPEG-decoded to RGB.
//! Picture controls are looked up by driver label and written through
//! `VIDIOC_S_CTRL`.

use image::{ImageFormat, RgbImage};
use ripeline_core::config::CameraConfig;
use ripeline_core::InitOutcome;
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::FourCC;

use crate::camera::{scan_devices, CaptureError, FrameInfo, FrameSource, PictureControl};

const BUFFER_COUNT: u32 = 4;

pub struct V4lCamera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    info: FrameInfo,
}

impl V4lCamera {
    /// Open and configure the device, reporting failure as a value
    pub fn open(config: &CameraConfig) -> InitOutcome<Self> {
        match Self::try_open(config) {
            Ok(camera) => {
                log::info!(
                    "camera {} initialized: {}x{} @ {} fps",
                    camera.info.device,
                    camera.info.width,
                    camera.info.height,
                    camera.info.fps
                );
                InitOutcome::Ready(camera)
            }
            Err(e) => {
                log::error!("failed to initialize camera {}: {e}", config.device);
                InitOutcome::failed("camera", e.to_string())
            }
        }
    }

    fn try_open(config: &CameraConfig) -> Result<Self, CaptureError> {
        let device = Device::new(config.device as usize).map_err(device_err)?;

        let mut format = device.format().map_err(device_err)?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = FourCC::new(b"MJPG");
        let format = device.set_format(&format).map_err(device_err)?;
        if format.fourcc != FourCC::new(b"MJPG") {
            return Err(CaptureError::Device(format!("device refused MJPG, offered {}", format.fourcc)));
        }

        let params = device
            .set_params(&Parameters::with_fps(config.fps))
            .map_err(device_err)?;
        let fps = params.interval.denominator / params.interval.numerator.max(1);

        if config.disable_autofocus {
            disable_autofocus(&device);
        }

        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT).map_err(device_err)?;
        // the first buffer after stream-on is frequently incomplete
        stream.next().map_err(device_err)?;

        Ok(Self {
            device,
            stream: Some(stream),
            info: FrameInfo::new(config.device, format.width, format.height, fps),
        })
    }
}

/// List the cameras that open and report a format
pub fn available_cameras() -> Vec<FrameInfo> {
    scan_devices(|index| {
        let device = Device::new(index as usize).ok()?;
        let format = device.format().ok()?;
        let fps = device
            .params()
            .map(|p| p.interval.denominator / p.interval.numerator.max(1))
            .unwrap_or(0);
        let mut info = FrameInfo::new(index, format.width, format.height, fps);
        read_picture_controls(&device, &mut info);
        Some(info)
    })
}

fn find_control(device: &Device, control: PictureControl) -> Option<u32> {
    device
        .query_controls()
        .ok()?
        .into_iter()
        .find(|desc| control.matches(&desc.name))
        .map(|desc| desc.id)
}

fn read_control(device: &Device, control: PictureControl) -> Option<i64> {
    let id = find_control(device, control)?;
    match device.control(id).ok()?.value {
        v4l::control::Value::Integer(v) => Some(v),
        v4l::control::Value::Boolean(b) => Some(i64::from(b)),
        _ => None,
    }
}

fn read_picture_controls(device: &Device, info: &mut FrameInfo) {
    info.brightness = read_control(device, PictureControl::Brightness);
    info.contrast = read_control(device, PictureControl::Contrast);
    info.saturation = read_control(device, PictureControl::Saturation);
}

fn device_err(e: std::io::Error) -> CaptureError {
    CaptureError::Device(e.to_string())
}

fn disable_autofocus(device: &Device) {
    let Ok(controls) = device.query_controls() else {
        return;
    };
    for desc in controls {
        let name = desc.name.to_ascii_lowercase();
        if name.contains("focus") && (name.contains("auto") || name.contains("continuous")) {
            let ctrl = v4l::Control {
                id: desc.id,
                value: v4l::control::Value::Integer(0),
            };
            match device.set_control(ctrl) {
                Ok(()) => log::debug!("disabled '{}'", desc.name),
                Err(e) => log::warn!("could not disable '{}': {e}", desc.name),
            }
        }
    }
}

impl FrameSource for V4lCamera {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CaptureError::Device("stream closed".into()))?;

        let (buf, meta) = stream.next().map_err(device_err)?;
        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            return Ok(None);
        }

        match image::load_from_memory_with_format(&buf[..used], ImageFormat::Jpeg) {
            Ok(decoded) => Ok(Some(decoded.to_rgb8())),
            Err(e) => {
                log::warn!("dropping undecodable frame: {e}");
                Ok(None)
            }
        }
    }

    fn info(&self) -> Option<FrameInfo> {
        let mut info = self.info.clone();
        read_picture_controls(&self.device, &mut info);
        Some(info)
    }

    fn set_control(&mut self, control: PictureControl, value: i64) -> Result<(), CaptureError> {
        let id = find_control(&self.device, control).ok_or(CaptureError::Unsupported(control))?;
        self.device
            .set_control(v4l::Control {
                id,
                value: v4l::control::Value::Integer(value),
            })
            .map_err(device_err)
    }

    fn release(&mut self) {
        self.stream.take();
    }
}
