//! Command line and environment surface of the relay binary

use clap::Parser;
use ripeline_core::config::{BrokerConfig, RelayConfig, DEFAULT_TOPIC};
use ripeline_core::ConfigError;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Forwards Ripeline classifications from the broker to the backend API")]
pub struct RelayArgs {
    #[arg(long, env = "MQTT_BROKER", help = "Broker host name or address")]
    pub mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    #[arg(long, env = "MQTT_TOPIC", default_value = DEFAULT_TOPIC)]
    pub mqtt_topic: String,

    #[arg(long, env = "API_ENDPOINT", help = "Backend URL classifications are POSTed to")]
    pub api_endpoint: String,

    #[arg(long, env = "API_TIMEOUT_SECS", default_value_t = 10)]
    pub timeout_secs: u64,

    #[arg(long, env = "RELAY_CLIENT_ID", default_value = "ripeline-relay")]
    pub client_id: String,
}

impl RelayArgs {
    pub fn into_config(self) -> Result<RelayConfig, ConfigError> {
        let broker = BrokerConfig::new(self.mqtt_broker)
            .port(self.mqtt_port)
            .topic(self.mqtt_topic)
            .client_id(self.client_id);
        let config = RelayConfig::new(broker, self.api_endpoint).timeout_secs(self.timeout_secs);
        config.validate()?;
        Ok(config)
    }
}
