use std::{collections::HashSet, fmt, path::Path, time::Duration};

use anyhow::{Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::Deserialize;
use thiserror::Error;

use crate::{engine::EngineTimings, mqtt::MqttSettings};

// ---------------------------------------------------------------------------
// DeviceKind
// ---------------------------------------------------------------------------

/// Device categories the engine knows how to drive.
///
/// Anything else in the device file is kept as `Unrecognized` so it can be
/// logged and skipped at run time instead of failing the whole load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    Sprinkler,
    PlantPot,
    Unrecognized(String),
}

impl From<&str> for DeviceKind {
    fn from(s: &str) -> Self {
        match s.trim() {
            "sprinkler" | "iot_sprinkler" => Self::Sprinkler,
            "plant-pot" | "plant_pot" | "iot_plant_pot" => Self::PlantPot,
            other => Self::Unrecognized(other.to_owned()),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Sprinkler => f.write_str("sprinkler"),
            DeviceKind::PlantPot => f.write_str("plant-pot"),
            DeviceKind::Unrecognized(raw) => write!(f, "unrecognized({raw})"),
        }
    }
}

// ---------------------------------------------------------------------------
// DeviceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub id: String,
    pub kind: DeviceKind,
    /// Daily trigger times in the configured schedule timezone.
    pub schedule_times: Vec<NaiveTime>,
    /// Plant-pot watering duration sent with the trigger command.
    pub schedule_duration: u32,
    /// Ordered task IDs run by sprinkler devices.
    pub task_ids: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read device config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse device config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid device configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// On-disk device entry before validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDevice {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    schedule_times: Vec<String>,
    #[serde(default)]
    schedule_duration: i64,
    #[serde(default)]
    task_ids: Vec<String>,
}

/// Accepts `{ "devices": [...] }` or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeviceFile {
    Wrapped { devices: Vec<RawDevice> },
    Bare(Vec<RawDevice>),
}

pub fn load_devices(path: impl AsRef<Path>) -> Result<Vec<DeviceConfig>, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_devices(&raw)
}

/// Parse and validate a device file, reporting every violation at once.
pub fn parse_devices(json: &str) -> Result<Vec<DeviceConfig>, ConfigError> {
    let raw = match serde_json::from_str::<DeviceFile>(json)? {
        DeviceFile::Wrapped { devices } | DeviceFile::Bare(devices) => devices,
    };

    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    let mut devices = Vec::with_capacity(raw.len());

    for (index, entry) in raw.into_iter().enumerate() {
        let label = if entry.id.is_empty() {
            format!("devices[{index}]")
        } else {
            format!("device {:?}", entry.id)
        };

        if entry.id.trim().is_empty() {
            errors.push(format!("{label}: id is required"));
        } else if entry.id.contains(['/', '+', '#']) || entry.id.contains(char::is_whitespace) {
            errors.push(format!("{label}: id must not contain '/', '+', '#' or whitespace"));
        } else if !seen.insert(entry.id.clone()) {
            errors.push(format!("{label}: duplicate id"));
        }

        let kind = DeviceKind::from(entry.kind.as_str());

        let mut schedule_times = Vec::new();
        for raw_time in &entry.schedule_times {
            let trimmed = raw_time.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_schedule_time(trimmed) {
                Ok(t) => schedule_times.push(t),
                Err(_) => errors.push(format!(
                    "{label}: schedule time {raw_time:?} is not HH:MM"
                )),
            }
        }

        let schedule_duration = match u32::try_from(entry.schedule_duration) {
            Ok(d) => d,
            Err(_) => {
                errors.push(format!(
                    "{label}: scheduleDuration must be a non-negative integer, got {}",
                    entry.schedule_duration
                ));
                0
            }
        };

        if kind == DeviceKind::Sprinkler {
            if entry.task_ids.is_empty() {
                errors.push(format!("{label}: sprinkler devices need at least one task id"));
            }
            if entry.task_ids.iter().any(|t| t.trim().is_empty()) {
                errors.push(format!("{label}: task ids must not be empty"));
            }
        }

        devices.push(DeviceConfig {
            id: entry.id,
            kind,
            schedule_times,
            schedule_duration,
            task_ids: entry.task_ids,
        });
    }

    if errors.is_empty() {
        Ok(devices)
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

pub fn parse_schedule_time(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .with_context(|| format!("invalid schedule time {raw:?}, expected HH:MM"))
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub app_env: String,
    pub database_url: String,
    pub mqtt: MqttSettings,
    pub slack_bot_token: String,
    pub slack_channel_id: String,
    pub slack_signing_secret: String,
    pub device_config_path: String,
    /// Directory holding `<device_id>_<task_id>.json` task files.
    pub tasks_dir: String,
    pub schedule_timezone: Tz,
    pub server_host: String,
    pub server_port: u16,
    pub timings: EngineTimings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let (mqtt_host, mqtt_port) = parse_broker(&required("MQTT_BROKER")?)?;

        Ok(Self {
            app_env: optional("APP_ENV", "development"),
            database_url: required("DATABASE_URL")?,
            mqtt: MqttSettings {
                host: mqtt_host,
                port: mqtt_port,
                client_id: optional("MQTT_CLIENT_ID", "irrigation-orchestrator"),
                username: non_empty(optional("MQTT_USERNAME", "")),
                password: non_empty(optional("MQTT_PASSWORD", "")),
                keep_alive: Duration::from_secs(30),
                ack_timeout: secs("PUBLISH_ACK_TIMEOUT_SECS", "5")?,
            },
            slack_bot_token: optional("SLACK_BOT_TOKEN", ""),
            slack_channel_id: optional("SLACK_CHANNEL_ID", ""),
            slack_signing_secret: optional("SLACK_SIGNING_SECRET", ""),
            device_config_path: optional("DEVICE_CONFIG_PATH", "devices.json"),
            tasks_dir: optional("TASKS_DIR", "tasks"),
            schedule_timezone: optional("SCHEDULE_TIMEZONE", "Asia/Bangkok")
                .parse::<Tz>()
                .map_err(|e| anyhow::anyhow!("SCHEDULE_TIMEZONE must be an IANA zone: {e}"))?,
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port: optional("SERVER_PORT", "3005")
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
            timings: EngineTimings {
                poll_interval: positive_secs("POLL_INTERVAL_SECS", "2")?,
                settle_delay: secs("SETTLE_DELAY_SECS", "3")?,
                calibration_timeout: secs("CALIBRATION_TIMEOUT_SECS", "120")?,
            },
        })
    }
}

/// Parse `host`, `host:port` or `tcp://host:port` into `(host, port)`.
fn parse_broker(raw: &str) -> Result<(String, u16)> {
    let trimmed = raw.trim();
    let without_scheme = ["tcp://", "mqtt://"]
        .iter()
        .find_map(|scheme| trimmed.strip_prefix(scheme))
        .unwrap_or(trimmed)
        .trim_end_matches('/');

    let (host, port) = match without_scheme.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>()
                .with_context(|| format!("MQTT_BROKER port must be a number, got {raw:?}"))?,
        ),
        None => (without_scheme, 1883),
    };

    if host.is_empty() {
        anyhow::bail!("MQTT_BROKER must name a host, got {raw:?}");
    }
    Ok((host.to_owned(), port))
}

/// Like `secs`, but zero is rejected.
fn positive_secs(key: &str, default: &str) -> Result<Duration> {
    let value = secs(key, default)?;
    if value.is_zero() {
        anyhow::bail!("{key} must be greater than zero");
    }
    Ok(value)
}

fn secs(key: &str, default: &str) -> Result<Duration> {
    let value: u64 = optional(key, default)
        .parse()
        .with_context(|| format!("{key} must be a non-negative integer"))?;
    Ok(Duration::from_secs(value))
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required env var: {key}"))
}

fn optional(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "devices": [
            {
                "id": "sprinkler_01",
                "type": "sprinkler",
                "scheduleTimes": ["06:00", " 18:30 ", ""],
                "scheduleDuration": 0,
                "taskIds": ["water_zone_1", "water_zone_2"]
            },
            { "id": "pot_01", "type": "plant-pot", "scheduleTimes": ["07:15"], "scheduleDuration": 45 },
            { "id": "lamp_01", "type": "lamp" }
        ]
    }"#;

    #[test]
    fn parse_devices_valid_file() {
        let devices = parse_devices(SAMPLE).unwrap();
        assert_eq!(devices.len(), 3);

        let sprinkler = &devices[0];
        assert_eq!(sprinkler.kind, DeviceKind::Sprinkler);
        assert_eq!(
            sprinkler.schedule_times,
            vec![
                NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(18, 30, 0).unwrap()
            ]
        );
        assert_eq!(sprinkler.task_ids, vec!["water_zone_1", "water_zone_2"]);

        assert_eq!(devices[1].kind, DeviceKind::PlantPot);
        assert_eq!(devices[1].schedule_duration, 45);
        assert_eq!(devices[2].kind, DeviceKind::Unrecognized("lamp".into()));
    }

    #[test]
    fn parse_devices_accepts_bare_array() {
        let devices =
            parse_devices(r#"[{"id":"p1","type":"iot_plant_pot","scheduleDuration":10}]"#).unwrap();
        assert_eq!(devices[0].kind, DeviceKind::PlantPot);
    }

    #[test]
    fn parse_devices_aggregates_all_violations() {
        let json = r#"[
            {"id": "", "type": "sprinkler", "taskIds": ["t"]},
            {"id": "a/b", "type": "plant-pot"},
            {"id": "dup", "type": "plant-pot", "scheduleTimes": ["25:99"]},
            {"id": "dup", "type": "sprinkler", "scheduleDuration": -1}
        ]"#;
        let ConfigError::Invalid(errors) = parse_devices(json).unwrap_err() else {
            panic!("expected Invalid");
        };

        assert_eq!(errors.len(), 6, "{errors:#?}");
        assert!(errors.iter().any(|e| e.contains("devices[0]: id is required")));
        assert!(errors.iter().any(|e| e.contains("\"a/b\"") && e.contains("'/'")));
        assert!(errors.iter().any(|e| e.contains("25:99")));
        assert!(errors.iter().any(|e| e.contains("duplicate id")));
        assert!(errors.iter().any(|e| e.contains("scheduleDuration")));
        assert!(errors.iter().any(|e| e.contains("at least one task id")));
    }

    #[test]
    fn parse_devices_rejects_malformed_json() {
        assert!(matches!(parse_devices("{not json"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn load_devices_reports_missing_file() {
        let err = load_devices("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn device_kind_from_str() {
        assert_eq!(DeviceKind::from("iot_sprinkler"), DeviceKind::Sprinkler);
        assert_eq!(DeviceKind::from("plant_pot"), DeviceKind::PlantPot);
        assert_eq!(DeviceKind::from("fridge"), DeviceKind::Unrecognized("fridge".into()));
    }

    #[test]
    fn parse_broker_variants() {
        assert_eq!(parse_broker("localhost").unwrap(), ("localhost".into(), 1883));
        assert_eq!(parse_broker("broker:1884").unwrap(), ("broker".into(), 1884));
        assert_eq!(
            parse_broker("tcp://10.0.0.5:1883").unwrap(),
            ("10.0.0.5".into(), 1883)
        );
        assert!(parse_broker("tcp://:1883").is_err());
        assert!(parse_broker("host:abc").is_err());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        std::env::set_var("IRRIGATION_TEST_ZERO_INTERVAL", "0");
        let err = positive_secs("IRRIGATION_TEST_ZERO_INTERVAL", "2").unwrap_err();
        assert!(err.to_string().contains("greater than zero"));

        std::env::set_var("IRRIGATION_TEST_ONE_INTERVAL", "1");
        assert_eq!(
            positive_secs("IRRIGATION_TEST_ONE_INTERVAL", "2").unwrap(),
            Duration::from_secs(1)
        );
        assert_eq!(
            positive_secs("IRRIGATION_TEST_UNSET_INTERVAL", "2").unwrap(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn parse_schedule_time_requires_hh_mm() {
        assert!(parse_schedule_time("06:00").is_ok());
        assert!(parse_schedule_time("6am").is_err());
    }
}
