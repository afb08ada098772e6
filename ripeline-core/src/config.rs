//! Configuration structs for the edge node and the relay
//!
//! Every component receives its configuration explicitly through its
//! constructor; nothing reads process globals. Defaults match the reference
//! deployment (Raspberry Pi, Logitech C270, ESP32 actuator board on USB
//! serial, Mosquitto broker).
//!
//! ```rust
//! use ripeline_core::config::{BrokerConfig, CaptureStrategy, EdgeConfig, ModelConfig};
//! use std::time::Duration;
//!
//! let config = EdgeConfig::new("raspberrypi_01")
//!     .with_broker(BrokerConfig::new("192.168.1.100").port(1883))
//!     .with_model(ModelConfig::new("someone/tomato-yolo"))
//!     .with_capture(CaptureStrategy::BestOf { frames: 3, inter_frame_delay: Duration::from_millis(50) });
//! config.validate()?;
//! # Ok::<(), ripeline_core::ConfigError>(())
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::classes::{ActuationMap, ClassTable};
use crate::errors::ConfigError;

/// Topic the edge publishes to and the relay subscribes to
pub const DEFAULT_TOPIC: &str = "tomato/predictions";

/// Backend request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// MQTT broker connection settings
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
    pub keep_alive: Duration,
    /// Pause between reconnect attempts after a connection error
    pub reconnect_delay: Duration,
    /// How long a publish waits for the broker acknowledgement
    pub publish_timeout: Duration,
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 1883,
            client_id: format!("ripeline-{}", std::process::id()),
            topic: DEFAULT_TOPIC.to_owned(),
            keep_alive: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(2),
            publish_timeout: Duration::from_secs(2),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Missing("broker host"));
        }
        if self.topic.is_empty() {
            return Err(ConfigError::Missing("broker topic"));
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::Missing("broker client id"));
        }
        Ok(())
    }
}

/// Serial link to the sensor/actuator board
#[derive(Debug, Clone, PartialEq)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
    /// Read timeout; bounds how long one trigger poll can block
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_owned(),
            baud: 115_200,
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// Camera device settings
#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfig {
    /// Index `N` of `/dev/videoN`
    pub device: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub disable_autofocus: bool,
    /// Attempts per single capture before giving up
    pub capture_retries: u32,
    pub retry_delay: Duration,
    /// Picture controls applied after opening; `None` keeps the device value
    pub brightness: Option<i64>,
    pub contrast: Option<i64>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: 0,
            width: 1280,
            height: 720,
            fps: 30,
            disable_autofocus: true,
            capture_retries: 3,
            retry_delay: Duration::from_millis(100),
            brightness: None,
            contrast: None,
        }
    }
}

/// How many frames to grab per trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStrategy {
    /// One frame with retries
    Single,
    /// Several frames, keep the sharpest
    BestOf {
        frames: u32,
        inter_frame_delay: Duration,
    },
}

impl Default for CaptureStrategy {
    fn default() -> Self {
        Self::Single
    }
}

impl FromStr for CaptureStrategy {
    type Err = ConfigError;

    /// Parses `single` or `best-of-N`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "single" {
            return Ok(Self::Single);
        }
        if let Some(n) = s.strip_prefix("best-of-") {
            let frames = n
                .parse::<u32>()
                .map_err(|_| ConfigError::Invalid(format!("bad frame count in capture strategy '{s}'")))?;
            return Ok(Self::BestOf {
                frames,
                inter_frame_delay: Duration::from_millis(50),
            });
        }
        Err(ConfigError::Invalid(format!("unknown capture strategy '{s}'")))
    }
}

/// Where the classifier model comes from
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Remote repository id, e.g. `someone/tomato-yolo`
    pub repository: String,
    /// Artifact inside the repository
    pub filename: String,
    pub cache_dir: PathBuf,
    /// Hub base URL
    pub hub_url: String,
    /// Square input edge in pixels
    pub input_size: u32,
}

impl ModelConfig {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            filename: "best.pt".to_owned(),
            cache_dir: PathBuf::from("/tmp/hf_models"),
            hub_url: "https://huggingface.co".to_owned(),
            input_size: 320,
        }
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn hub_url(mut self, url: impl Into<String>) -> Self {
        self.hub_url = url.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.is_empty() {
            return Err(ConfigError::Missing("model repository"));
        }
        if self.input_size == 0 {
            return Err(ConfigError::Invalid("model input size must be positive".into()));
        }
        Ok(())
    }
}

/// Everything the edge node needs
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeConfig {
    pub device_id: String,
    pub broker: BrokerConfig,
    pub serial: SerialConfig,
    pub camera: CameraConfig,
    pub model: ModelConfig,
    pub capture: CaptureStrategy,
    pub classes: ClassTable,
    pub actuation: ActuationMap,
    /// Sleep between trigger polls while idle
    pub poll_interval: Duration,
    /// Pause after a completed cycle before polling again
    pub settle_delay: Duration,
}

impl EdgeConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            broker: BrokerConfig::new("localhost"),
            serial: SerialConfig::default(),
            camera: CameraConfig::default(),
            model: ModelConfig::new(""),
            capture: CaptureStrategy::default(),
            classes: ClassTable::default(),
            actuation: ActuationMap::default(),
            poll_interval: Duration::from_millis(100),
            settle_delay: Duration::from_secs(1),
        }
    }

    pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_serial(mut self, serial: SerialConfig) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_camera(mut self, camera: CameraConfig) -> Self {
        self.camera = camera;
        self
    }

    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }

    pub fn with_capture(mut self, capture: CaptureStrategy) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.is_empty() {
            return Err(ConfigError::Missing("device id"));
        }
        self.broker.validate()?;
        self.model.validate()?;
        if let CaptureStrategy::BestOf { frames: 0, .. } = self.capture {
            return Err(ConfigError::Invalid("best-of capture needs at least one frame".into()));
        }
        if self.camera.capture_retries == 0 {
            return Err(ConfigError::Invalid("camera needs at least one capture attempt".into()));
        }
        Ok(())
    }
}

/// Everything the relay needs
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    /// Backend URL events are POSTed to
    pub api_endpoint: String,
    pub request_timeout: Duration,
}

impl RelayConfig {
    pub fn new(broker: BrokerConfig, api_endpoint: impl Into<String>) -> Self {
        Self {
            broker,
            api_endpoint: api_endpoint.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout = Duration::from_secs(secs);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        if self.api_endpoint.is_empty() {
            return Err(ConfigError::Missing("API endpoint"));
        }
        if !self.api_endpoint.starts_with("http://") && !self.api_endpoint.starts_with("https://") {
            return Err(ConfigError::Invalid(
                "API endpoint must start with http:// or https://".into(),
            ));
        }
        Ok(())
    }
}
