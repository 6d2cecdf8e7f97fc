use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fleet::DeviceClass;
use crate::fleet::liveness::Windows;
use crate::fleet::orchestrator::RefreshSettings;
use crate::fleet::poller::PollPeriods;
use crate::fleet::registry::DeviceSpec;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub timing: TimingConfig,
    pub devices: Vec<DeviceSpec>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    /// Prefix for the operator control topics and the bridge status topic.
    pub topic_prefix: String,
}

#[derive(Debug, Clone)]
pub struct TimingConfig {
    pub refresh: RefreshSettings,
    /// Bounded wait for a single on-demand read.
    pub read_timeout: Duration,
    pub poll: PollPeriods,
}

type Vars = HashMap<String, String>;

fn env_required(vars: &Vars, key: &str) -> Result<String> {
    vars.get(key)
        .cloned()
        .ok_or_else(|| Error::Config(format!("{key} environment variable is required")))
}

fn env_optional(vars: &Vars, key: &str) -> Option<String> {
    vars.get(key).filter(|v| !v.is_empty()).cloned()
}

fn env_or_default<T: std::str::FromStr>(vars: &Vars, key: &str, default: T) -> T {
    vars.get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(vars: &Vars, key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_or_default(vars, key, default_ms))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&env::vars().collect())
    }

    pub fn from_vars(vars: &Vars) -> Result<Self> {
        let devices = match env_optional(vars, "DEVICES_FILE") {
            Some(path) => load_devices(&path)?,
            None => default_fleet(vars),
        };

        let config = Self {
            mqtt: MqttConfig {
                broker_host: env_required(vars, "MQTT_BROKER_HOST")?,
                broker_port: env_or_default(vars, "MQTT_BROKER_PORT", 1883),
                username: env_optional(vars, "MQTT_USERNAME"),
                password: env_optional(vars, "MQTT_PASSWORD"),
                client_id: env_or_default(vars, "MQTT_CLIENT_ID", "fleet-monitor".to_string()),
                topic_prefix: env_or_default(vars, "FLEET_TOPIC_PREFIX", "fleet".to_string()),
            },
            timing: TimingConfig {
                refresh: RefreshSettings {
                    step_timeout: env_millis(vars, "STEP_TIMEOUT_MS", 4000),
                    settle_delay: env_millis(vars, "SETTLE_DELAY_MS", 200),
                    windows: Windows {
                        heartbeat: env_millis(vars, "HEARTBEAT_WINDOW_MS", 8000),
                        image: env_millis(vars, "IMAGE_WINDOW_MS", 2000),
                        distance: env_millis(vars, "DISTANCE_WINDOW_MS", 3000),
                    },
                },
                read_timeout: env_millis(vars, "READ_TIMEOUT_MS", 3000),
                poll: PollPeriods {
                    image: env_millis(vars, "POLL_IMAGE_MS", 500),
                    distance: env_millis(vars, "POLL_DISTANCE_MS", 500),
                    heartbeat: env_millis(vars, "POLL_HEARTBEAT_MS", 2000),
                },
            },
            devices,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt.broker_host.is_empty() {
            return Err(Error::Config("MQTT_BROKER_HOST must not be empty".into()));
        }
        if self.mqtt.topic_prefix.is_empty() || self.mqtt.topic_prefix.contains(['+', '#']) {
            return Err(Error::Config(
                "FLEET_TOPIC_PREFIX must be a non-empty topic without wildcards".into(),
            ));
        }
        if self.devices.is_empty() {
            return Err(Error::Config("No devices configured".into()));
        }
        let timing = &self.timing;
        let required = [
            ("STEP_TIMEOUT_MS", timing.refresh.step_timeout),
            ("READ_TIMEOUT_MS", timing.read_timeout),
            ("HEARTBEAT_WINDOW_MS", timing.refresh.windows.heartbeat),
            ("IMAGE_WINDOW_MS", timing.refresh.windows.image),
            ("DISTANCE_WINDOW_MS", timing.refresh.windows.distance),
            ("POLL_IMAGE_MS", timing.poll.image),
            ("POLL_DISTANCE_MS", timing.poll.distance),
            ("POLL_HEARTBEAT_MS", timing.poll.heartbeat),
        ];
        if let Some((key, _)) = required.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{key} must be > 0")));
        }
        Ok(())
    }

    /// Retained online/offline marker for this process.
    pub fn status_topic(&self) -> String {
        format!("{}/status", self.mqtt.topic_prefix)
    }

    pub fn command_filter(&self) -> String {
        format!("{}/command/#", self.mqtt.topic_prefix)
    }
}

/// The stock installation: numbered cameras, one level sensor, one actuator.
fn default_fleet(vars: &Vars) -> Vec<DeviceSpec> {
    let camera_count: usize = env_or_default(vars, "CAMERA_COUNT", 4);
    let camera_prefix = env_or_default(vars, "CAMERA_PREFIX", "ESP32_CAM_".to_string());
    let sensor_id = env_or_default(vars, "DISTANCE_SENSOR_ID", "ESP32_WLEVEL_1".to_string());
    let actuator_id = env_or_default(vars, "ACTUATOR_ID", "ESP32_ACT_1".to_string());
    let channels = env_or_default(vars, "ACTUATOR_CHANNELS", "pump,light".to_string());

    let mut devices: Vec<DeviceSpec> = (1..=camera_count)
        .map(|i| DeviceSpec::new(format!("{camera_prefix}{i}"), DeviceClass::Camera))
        .collect();
    if !sensor_id.is_empty() {
        devices.push(DeviceSpec::new(sensor_id, DeviceClass::DistanceSensor));
    }
    if !actuator_id.is_empty() {
        devices.push(
            DeviceSpec::new(actuator_id, DeviceClass::Actuator).with_channels(
                channels
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty()),
            ),
        );
    }
    devices
}

fn load_devices(path: &str) -> Result<Vec<DeviceSpec>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {path}: {e}")))?;
    parse_devices(&content).map_err(|e| Error::Config(format!("Failed to parse {path}: {e}")))
}

fn parse_devices(content: &str) -> serde_json::Result<Vec<DeviceSpec>> {
    serde_json::from_str(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::Capability;

    fn vars(pairs: &[(&str, &str)]) -> Vars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_describe_stock_fleet() {
        let config = Config::from_vars(&vars(&[("MQTT_BROKER_HOST", "10.0.0.2")])).unwrap();
        assert_eq!(config.mqtt.broker_port, 1883);
        assert_eq!(config.mqtt.topic_prefix, "fleet");
        assert_eq!(config.timing.refresh.step_timeout, Duration::from_secs(4));
        assert_eq!(config.timing.refresh.windows.heartbeat, Duration::from_secs(8));

        let ids: Vec<_> = config.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(
            ids,
            ["ESP32_CAM_1", "ESP32_CAM_2", "ESP32_CAM_3", "ESP32_CAM_4", "ESP32_WLEVEL_1", "ESP32_ACT_1"]
        );
        assert_eq!(config.devices[5].channels, ["pump", "light"]);
    }

    #[test]
    fn broker_host_is_required() {
        assert!(matches!(Config::from_vars(&vars(&[])), Err(Error::Config(_))));
    }

    #[test]
    fn zero_periods_are_rejected() {
        let err = Config::from_vars(&vars(&[
            ("MQTT_BROKER_HOST", "broker"),
            ("POLL_DISTANCE_MS", "0"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("POLL_DISTANCE_MS"));
    }

    #[test]
    fn overrides_apply() {
        let config = Config::from_vars(&vars(&[
            ("MQTT_BROKER_HOST", "broker"),
            ("CAMERA_COUNT", "2"),
            ("ACTUATOR_ID", ""),
            ("STEP_TIMEOUT_MS", "1500"),
            ("FLEET_TOPIC_PREFIX", "plant"),
        ]))
        .unwrap();
        assert_eq!(config.devices.len(), 3);
        assert_eq!(config.timing.refresh.step_timeout, Duration::from_millis(1500));
        assert_eq!(config.command_filter(), "plant/command/#");
        assert_eq!(config.status_topic(), "plant/status");
    }

    #[test]
    fn parses_devices_file() {
        let devices = parse_devices(
            r#"[
                {"id": "CAM_A", "class": "camera"},
                {"id": "TANK", "class": "distance_sensor", "capabilities": ["heartbeat", "distance"]},
                {"id": "RELAY", "class": "actuator", "channels": ["valve"]}
            ]"#,
        )
        .unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[1].class, DeviceClass::DistanceSensor);
        assert_eq!(devices[1].capabilities, [Capability::Heartbeat, Capability::Distance]);
        assert_eq!(devices[2].channels, ["valve"]);
    }

    #[test]
    fn missing_devices_file_is_config_error() {
        let err = Config::from_vars(&vars(&[
            ("MQTT_BROKER_HOST", "broker"),
            ("DEVICES_FILE", "/nonexistent/devices.json"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
