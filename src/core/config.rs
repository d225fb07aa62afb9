//! Configuration system: TOML file + env var overrides + lab defaults.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TwinError};

/// Full twin configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub topics: TopicsConfig,
    pub selection: SelectionConfig,
    pub status: StatusConfig,
    pub paths: PathsConfig,
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    /// Bound on TCP connect plus the CONNECT/CONNACK exchange.
    pub connect_timeout_secs: u64,
    /// Client ids are `<prefix>-<pipeline>-<pid>` so parallel pipelines never collide.
    pub client_id_prefix: String,
    /// Capacity of the request queue between the client handle and its event loop.
    pub channel_capacity: usize,
    pub reconnect: ReconnectConfig,
}

/// Exponential backoff with jitter applied to broker connection failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Growth factor per consecutive failure, in percent (200 = doubling).
    pub multiplier_pct: u32,
}

/// Topic set, grouping keywords, and building-entity links.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TopicsConfig {
    pub sensors: Vec<String>,
    pub actuators: Vec<String>,
    pub group_keys: Vec<String>,
    pub actuator_group_keys: Vec<String>,
    /// Groups that do not offer an "all" selection (protocol-wide groups).
    pub protocol_groups: Vec<String>,
    pub default_group: String,
    /// Optional `;`-separated export with `FullTopic` and `IFC Device GUID` columns.
    pub links_csv: Option<PathBuf>,
    /// Inline topic → building entity ids, merged over the CSV links.
    pub links: BTreeMap<String, Vec<String>>,
}

/// Wire format of the shared selection file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// `{"visual_topic": "..."}`
    Single,
    /// `{"visual_topics": [...]}`
    #[default]
    Multi,
}

/// Selection channel behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SelectionConfig {
    pub mode: SelectionMode,
    pub poll_interval_ms: u64,
}

/// Thresholds used to classify the latest reading of a topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    pub co2_occupied_ppm: f64,
    pub temperature_low_c: f64,
    pub temperature_high_c: f64,
    pub humidity_low_pct: f64,
    pub humidity_high_pct: f64,
}

/// Filesystem paths used by the twin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub live_db: PathBuf,
    pub history_db: PathBuf,
    pub selection_file: PathBuf,
    pub activity_log: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "xrdevmqtt.edu.metropolia.fi".to_string(),
            port: 1883,
            keep_alive_secs: 60,
            connect_timeout_secs: 5,
            client_id_prefix: "smartlab-twin".to_string(),
            channel_capacity: 64,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
            multiplier_pct: 200,
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            sensors: [
                "KNX/13/0/2<Livingroom.Sensors.Air-temperature-C>",
                "KNX/13/0/3<Livingroom.Sensors.Floor-temp-C>",
                "KNX/13/0/0<Livingroom.Sensors.CO2-ppm>",
                "KNX/13/0/1<Livingroom.Sensors.Rh-percent>",
                "KNX/14/0/2<Bedroom.Sensors.Air-temperature-C>",
                "KNX/14/0/0<Bedroom.Sensors.CO2-ppm>",
                "KNX/14/0/1<Bedroom.Sensors.Rh-percent>",
                "KNX/15/0/2<Bathroom.Sensors.Air-temperature-C>",
                "KNX/15/0/3<Bathroom.Sensors.Floor-temp-C>",
                "KNX/15/0/0<Bathroom.Sensors.CO2-ppm>",
                "KNX/15/0/1<Bathroom.Sensors.RH|percent>",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            actuators: [
                "KNX/0/4/41<Actuators.DimLight.Bedroom-Light-M1-Dim>",
                "KNX/0/5/0<Actuators.Curtain.Bedroom-Up|Down>",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            group_keys: [
                "Livingroom",
                "Bedroom",
                "Bathroom",
                "Air-temperature",
                "Floor-temp",
                "CO2-ppm",
                "Rh",
                "M-bus",
                "KNX",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            actuator_group_keys: ["Bedroom", "Livingroom", "Kitchen", "DimLight", "Curtain"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            protocol_groups: vec!["M-bus".to_string(), "KNX".to_string()],
            default_group: "Livingroom".to_string(),
            links_csv: None,
            links: BTreeMap::new(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            mode: SelectionMode::Multi,
            poll_interval_ms: 1_000,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            co2_occupied_ppm: 429.5,
            temperature_low_c: 18.0,
            temperature_high_c: 24.0,
            humidity_low_pct: 30.0,
            humidity_high_pct: 60.0,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[SLT-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir
            .join(".config")
            .join("smartlab-twin")
            .join("config.toml");
        let data = home_dir.join(".local").join("share").join("smartlab-twin");
        Self {
            config_file: cfg,
            live_db: data.join("sensor_data_realtime.sqlite3"),
            history_db: data.join("sensor_data_history.sqlite3"),
            selection_file: data.join("shared_topic.json"),
            activity_log: data.join("activity.jsonl"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| TwinError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(TwinError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize_topics();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON form; stable across processes and releases.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    /// `host:port` label used in logs and error messages.
    #[must_use]
    pub fn broker_label(&self) -> String {
        format!("{}:{}", self.broker.host, self.broker.port)
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // broker
        if let Some(raw) = lookup("SLT_BROKER_HOST") {
            self.broker.host = raw;
        }
        if let Some(raw) = lookup("SLT_BROKER_PORT") {
            self.broker.port = parse_env("SLT_BROKER_PORT", &raw)?;
        }
        if let Some(raw) = lookup("SLT_BROKER_KEEP_ALIVE_SECS") {
            self.broker.keep_alive_secs = parse_env("SLT_BROKER_KEEP_ALIVE_SECS", &raw)?;
        }
        if let Some(raw) = lookup("SLT_BROKER_CONNECT_TIMEOUT_SECS") {
            self.broker.connect_timeout_secs =
                parse_env("SLT_BROKER_CONNECT_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("SLT_BROKER_CLIENT_ID_PREFIX") {
            self.broker.client_id_prefix = raw;
        }
        if let Some(raw) = lookup("SLT_RECONNECT_INITIAL_BACKOFF_MS") {
            self.broker.reconnect.initial_backoff_ms =
                parse_env("SLT_RECONNECT_INITIAL_BACKOFF_MS", &raw)?;
        }
        if let Some(raw) = lookup("SLT_RECONNECT_MAX_BACKOFF_MS") {
            self.broker.reconnect.max_backoff_ms =
                parse_env("SLT_RECONNECT_MAX_BACKOFF_MS", &raw)?;
        }

        // selection
        if let Some(raw) = lookup("SLT_SELECTION_MODE") {
            self.selection.mode = match raw.trim().to_ascii_lowercase().as_str() {
                "single" => SelectionMode::Single,
                "multi" => SelectionMode::Multi,
                other => {
                    return Err(TwinError::ConfigParse {
                        context: "env",
                        details: format!("SLT_SELECTION_MODE={other:?}: expected single|multi"),
                    });
                }
            };
        }
        if let Some(raw) = lookup("SLT_SELECTION_POLL_INTERVAL_MS") {
            self.selection.poll_interval_ms = parse_env("SLT_SELECTION_POLL_INTERVAL_MS", &raw)?;
        }

        // paths
        if let Some(raw) = lookup("SLT_PATHS_LIVE_DB") {
            self.paths.live_db = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("SLT_PATHS_HISTORY_DB") {
            self.paths.history_db = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("SLT_PATHS_SELECTION_FILE") {
            self.paths.selection_file = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("SLT_PATHS_ACTIVITY_LOG") {
            self.paths.activity_log = PathBuf::from(raw);
        }

        Ok(())
    }

    /// Trim whitespace and drop duplicate topics while keeping first-seen order.
    fn normalize_topics(&mut self) {
        for list in [&mut self.topics.sensors, &mut self.topics.actuators] {
            let mut seen = std::collections::HashSet::new();
            list.retain_mut(|topic| {
                let trimmed = topic.trim();
                if trimmed.len() != topic.len() {
                    *topic = trimmed.to_string();
                }
                !topic.is_empty() && seen.insert(topic.clone())
            });
        }
    }

    fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            return Err(TwinError::InvalidConfig {
                details: "broker.host must not be empty".to_string(),
            });
        }
        if self.broker.port == 0 {
            return Err(TwinError::InvalidConfig {
                details: "broker.port must be > 0".to_string(),
            });
        }
        // MQTT brokers and the client library reject sub-5s keep-alive.
        if self.broker.keep_alive_secs < 5 {
            return Err(TwinError::InvalidConfig {
                details: format!(
                    "broker.keep_alive_secs must be >= 5, got {}",
                    self.broker.keep_alive_secs
                ),
            });
        }
        if self.broker.connect_timeout_secs == 0 {
            return Err(TwinError::InvalidConfig {
                details: "broker.connect_timeout_secs must be > 0".to_string(),
            });
        }
        if self.broker.channel_capacity == 0 {
            return Err(TwinError::InvalidConfig {
                details: "broker.channel_capacity must be >= 1".to_string(),
            });
        }

        let reconnect = &self.broker.reconnect;
        if reconnect.initial_backoff_ms == 0 {
            return Err(TwinError::InvalidConfig {
                details: "broker.reconnect.initial_backoff_ms must be > 0".to_string(),
            });
        }
        if reconnect.max_backoff_ms < reconnect.initial_backoff_ms {
            return Err(TwinError::InvalidConfig {
                details: "broker.reconnect.max_backoff_ms must be >= initial_backoff_ms"
                    .to_string(),
            });
        }
        if reconnect.multiplier_pct < 100 {
            return Err(TwinError::InvalidConfig {
                details: format!(
                    "broker.reconnect.multiplier_pct must be >= 100, got {}",
                    reconnect.multiplier_pct
                ),
            });
        }

        if self.topics.sensors.is_empty() {
            return Err(TwinError::InvalidConfig {
                details: "topics.sensors must list at least one topic".to_string(),
            });
        }
        if self
            .topics
            .group_keys
            .iter()
            .chain(&self.topics.actuator_group_keys)
            .any(|key| key.trim().is_empty())
        {
            return Err(TwinError::InvalidConfig {
                details: "topics group keys must not be empty strings".to_string(),
            });
        }
        if !self.topics.default_group.is_empty()
            && !self
                .topics
                .group_keys
                .iter()
                .any(|key| key == &self.topics.default_group)
        {
            return Err(TwinError::InvalidConfig {
                details: format!(
                    "topics.default_group {:?} is not one of topics.group_keys",
                    self.topics.default_group
                ),
            });
        }

        if self.selection.poll_interval_ms == 0 {
            return Err(TwinError::InvalidConfig {
                details: "selection.poll_interval_ms must be > 0".to_string(),
            });
        }

        if self.status.temperature_low_c >= self.status.temperature_high_c {
            return Err(TwinError::InvalidConfig {
                details: "status.temperature_low_c must be < temperature_high_c".to_string(),
            });
        }
        if self.status.humidity_low_pct >= self.status.humidity_high_pct {
            return Err(TwinError::InvalidConfig {
                details: "status.humidity_low_pct must be < humidity_high_pct".to_string(),
            });
        }
        if !(0.0..=100.0).contains(&self.status.humidity_low_pct)
            || !(0.0..=100.0).contains(&self.status.humidity_high_pct)
        {
            return Err(TwinError::InvalidConfig {
                details: "status humidity thresholds must be in [0, 100]".to_string(),
            });
        }

        if self.paths.live_db == self.paths.history_db {
            return Err(TwinError::InvalidConfig {
                details: "paths.live_db and paths.history_db must differ; the live store is \
                          cleared at session start"
                    .to_string(),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| TwinError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}
