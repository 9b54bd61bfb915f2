use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_topic: String,
    pub mqtt_qos: u8,
    pub mqtt_ca_cert: Option<PathBuf>,
    pub mqtt_keepalive_secs: u64,

    pub influx_url: String,
    pub influx_token: String,
    pub influx_org: String,
    pub influx_bucket: String,
    pub write_timeout_ms: u64,

    pub device_id: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let mqtt_host = env_string("BRIDGE_MQTT_HOST", Some("127.0.0.1".to_string()))?;
        let mqtt_port = env_u64("BRIDGE_MQTT_PORT", Some(8883))? as u16;
        let mqtt_username = env_optional("BRIDGE_MQTT_USERNAME");
        // No baked-in credentials: a configured username requires the password
        // to come from the environment as well.
        let mqtt_password = env_optional("BRIDGE_MQTT_PASSWORD");
        if mqtt_username.is_some() && mqtt_password.is_none() {
            bail!("BRIDGE_MQTT_PASSWORD is required when BRIDGE_MQTT_USERNAME is set");
        }

        let mqtt_client_id = env_string(
            "BRIDGE_MQTT_CLIENT_ID",
            Some(format!("telemetry-bridge-{}", std::process::id())),
        )?;
        let mqtt_topic = env_string("BRIDGE_MQTT_TOPIC", Some("sensors/all/room1".to_string()))?;
        let mqtt_qos = env_u64("BRIDGE_MQTT_QOS", Some(0))? as u8;
        if mqtt_qos > 2 {
            bail!("BRIDGE_MQTT_QOS must be 0, 1 or 2");
        }
        let mqtt_ca_cert = env_optional("BRIDGE_MQTT_CA_CERT").map(PathBuf::from);
        let mqtt_keepalive_secs = env_u64("BRIDGE_MQTT_KEEPALIVE_SECS", Some(30))?;

        let influx_url = env_string("BRIDGE_INFLUX_URL", None)
            .context("BRIDGE_INFLUX_URL is required")?
            .trim_end_matches('/')
            .to_string();
        let influx_token =
            env_string("BRIDGE_INFLUX_TOKEN", None).context("BRIDGE_INFLUX_TOKEN is required")?;
        let influx_org =
            env_string("BRIDGE_INFLUX_ORG", None).context("BRIDGE_INFLUX_ORG is required")?;
        let influx_bucket =
            env_string("BRIDGE_INFLUX_BUCKET", None).context("BRIDGE_INFLUX_BUCKET is required")?;
        let write_timeout_ms = env_u64("BRIDGE_WRITE_TIMEOUT_MS", Some(5000))?;

        let device_id = env_string("BRIDGE_DEVICE_ID", Some("ESP32".to_string()))?;

        Ok(Self {
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_topic,
            mqtt_qos,
            mqtt_ca_cert,
            mqtt_keepalive_secs,
            influx_url,
            influx_token,
            influx_org,
            influx_bucket,
            write_timeout_ms,
            device_id,
        })
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
