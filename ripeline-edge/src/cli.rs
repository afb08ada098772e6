//! Command line and environment surface of the edge binary

use std::path::PathBuf;

use clap::Parser;
use ripeline_core::config::{
    BrokerConfig, CameraConfig, CaptureStrategy, EdgeConfig, ModelConfig, SerialConfig, DEFAULT_TOPIC,
};
use ripeline_core::ConfigError;

/// Edge node settings; every flag can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Ripeline edge node",
    long_about = "Waits for the IR sensor, captures and classifies the object, publishes the \
        classification to the MQTT broker and drives the sorting servo."
)]
pub struct EdgeArgs {
    #[arg(long, env = "DEVICE_ID", default_value = "raspberrypi_default")]
    pub device_id: String,

    #[arg(long, env = "MQTT_BROKER", help = "Broker host name or address")]
    pub mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    #[arg(long, env = "MQTT_TOPIC", default_value = DEFAULT_TOPIC)]
    pub mqtt_topic: String,

    #[arg(long, env = "ARDUINO_PORT", default_value = "/dev/ttyUSB0", help = "Sensor/actuator serial port")]
    pub serial_port: String,

    #[arg(long, env = "ARDUINO_BAUD", default_value_t = 115_200)]
    pub serial_baud: u32,

    #[arg(long, env = "MODEL_NAME", help = "Model repository id, e.g. owner/name")]
    pub model_name: String,

    #[arg(long, env = "MODEL_FILE", default_value = "best.pt")]
    pub model_file: String,

    #[arg(long, env = "MODEL_CACHE_DIR", default_value = "/tmp/hf_models")]
    pub model_cache_dir: PathBuf,

    #[arg(long, env = "CAMERA_DEVICE", default_value_t = 0, help = "Index N of /dev/videoN")]
    pub camera_device: u32,

    #[arg(long, env = "CAMERA_WIDTH", default_value_t = 1280)]
    pub camera_width: u32,

    #[arg(long, env = "CAMERA_HEIGHT", default_value_t = 720)]
    pub camera_height: u32,

    #[arg(long, env = "CAMERA_FPS", default_value_t = 30)]
    pub camera_fps: u32,

    #[arg(long, env = "CAMERA_BRIGHTNESS", allow_negative_numbers = true, help = "Brightness applied after opening the camera")]
    pub camera_brightness: Option<i64>,

    #[arg(long, env = "CAMERA_CONTRAST", allow_negative_numbers = true)]
    pub camera_contrast: Option<i64>,

    #[arg(
        long,
        env = "CAPTURE_STRATEGY",
        default_value = "single",
        help = "single, or best-of-N to keep the sharpest of N frames"
    )]
    pub capture_strategy: CaptureStrategy,
}

impl EdgeArgs {
    /// Build and validate the edge configuration
    pub fn into_config(self) -> Result<EdgeConfig, ConfigError> {
        let broker = BrokerConfig::new(self.mqtt_broker)
            .port(self.mqtt_port)
            .topic(self.mqtt_topic)
            .client_id(format!("ripeline-edge-{}", self.device_id));
        let serial = SerialConfig {
            port: self.serial_port,
            baud: self.serial_baud,
            ..SerialConfig::default()
        };
        let camera = CameraConfig {
            device: self.camera_device,
            width: self.camera_width,
            height: self.camera_height,
            fps: self.camera_fps,
            brightness: self.camera_brightness,
            contrast: self.camera_contrast,
            ..CameraConfig::default()
        };
        let model = ModelConfig::new(self.model_name)
            .filename(self.model_file)
            .cache_dir(self.model_cache_dir);

        let config = EdgeConfig::new(self.device_id)
            .with_broker(broker)
            .with_serial(serial)
            .with_camera(camera)
            .with_model(model)
            .with_capture(self.capture_strategy);
        config.validate()?;
        Ok(config)
    }
}
