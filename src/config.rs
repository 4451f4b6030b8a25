use crate::history_buffer::{DEFAULT_HISTORY_CAPACITY, MAX_HISTORY_CAPACITY};
use crate::ingestion::Subscription;
use crate::mqtt_reader::BrokerAddress;
use crate::reading::Channel;
use crate::state_engine::Thresholds;
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TOPIC_PREFIX: &str = "solar";
pub const DEFAULT_MODBUS_LISTEN: &str = "0.0.0.0:5502";
pub const DEFAULT_MQTT_CLIENT_ID: &str = "solar-telemetry";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("{key} is required")]
    MissingValue { key: String },
}

/// Which transport feeds readings into the engine
#[derive(Debug, Clone, PartialEq)]
pub enum SourceConfig {
    Simulated {
        interval: Duration,
        seed: Option<u64>,
    },
    HomeAssistant {
        endpoint_url: String,
        auth_token: String,
        /// Entity id per channel, e.g. `sensor.roof_voltage`
        sensors: BTreeMap<Channel, String>,
        poll_interval: Duration,
    },
    Mqtt {
        broker: BrokerAddress,
        client_id: String,
    },
    Tcp {
        address: SocketAddr,
    },
    Stdin,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub source: SourceConfig,
    pub subscription: Subscription,
    pub history_capacity: usize,
    pub thresholds: Thresholds,
    pub modbus_listen: Option<SocketAddr>,
}

impl BridgeConfig {
    /// Reads the configuration from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let topic_prefix = get("TOPIC_PREFIX").unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string());
        let channels = match get("SUBSCRIBED_CHANNELS") {
            Some(list) => parse_channel_list(&list)?,
            None => Channel::ALL.into_iter().collect(),
        };

        let history_capacity: usize =
            parse_or("HISTORY_CAPACITY", get("HISTORY_CAPACITY"), DEFAULT_HISTORY_CAPACITY)?;
        if !(1..=MAX_HISTORY_CAPACITY).contains(&history_capacity) {
            return Err(invalid(
                "HISTORY_CAPACITY",
                &history_capacity.to_string(),
                &format!("must be between 1 and {MAX_HISTORY_CAPACITY}"),
            ));
        }

        let defaults = Thresholds::default();
        let thresholds = Thresholds {
            voltage_limit: parse_or("VOLTAGE_LIMIT", get("VOLTAGE_LIMIT"), defaults.voltage_limit)?,
            smoke_limit: parse_or("SMOKE_LIMIT", get("SMOKE_LIMIT"), defaults.smoke_limit)?,
            energy_strain_limit: parse_or(
                "ENERGY_STRAIN_LIMIT",
                get("ENERGY_STRAIN_LIMIT"),
                defaults.energy_strain_limit,
            )?,
            impact_maintenance_limit: parse_or(
                "IMPACT_MAINTENANCE_LIMIT",
                get("IMPACT_MAINTENANCE_LIMIT"),
                defaults.impact_maintenance_limit,
            )?,
        };

        // An explicitly empty MODBUS_LISTEN disables the register export
        let modbus_listen = match lookup("MODBUS_LISTEN") {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(parse_value("MODBUS_LISTEN", &value)?),
            None => Some(parse_value("MODBUS_LISTEN", DEFAULT_MODBUS_LISTEN)?),
        };

        let source = Self::source_from(&get)?;

        Ok(Self {
            source,
            subscription: Subscription {
                topic_prefix,
                channels,
            },
            history_capacity,
            thresholds,
            modbus_listen,
        })
    }

    fn source_from<G>(get: &G) -> Result<SourceConfig, ConfigError>
    where
        G: Fn(&str) -> Option<String>,
    {
        let kind = get("READING_SOURCE")
            .unwrap_or_else(|| "simulated".to_string())
            .to_ascii_lowercase();

        match kind.as_str() {
            "simulated" | "sim" => Ok(SourceConfig::Simulated {
                interval: Duration::from_millis(parse_or(
                    "SIM_INTERVAL_MS",
                    get("SIM_INTERVAL_MS"),
                    1000,
                )?),
                seed: get("SIM_SEED")
                    .map(|seed| parse_value("SIM_SEED", &seed))
                    .transpose()?,
            }),
            "home-assistant" | "home_assistant" | "ha" => {
                let endpoint_url = get("HA_URL").ok_or_else(|| ConfigError::MissingValue {
                    key: "HA_URL".to_string(),
                })?;
                let sensors: BTreeMap<Channel, String> = Channel::ALL
                    .into_iter()
                    .filter_map(|channel| {
                        let key = format!("HA_SENSOR_{}", channel.name().to_ascii_uppercase());
                        get(&key).map(|entity| (channel, entity))
                    })
                    .collect();
                if sensors.is_empty() {
                    return Err(ConfigError::MissingValue {
                        key: "HA_SENSOR_<CHANNEL>".to_string(),
                    });
                }
                Ok(SourceConfig::HomeAssistant {
                    endpoint_url,
                    auth_token: get("HA_TOKEN").unwrap_or_default(),
                    sensors,
                    poll_interval: Duration::from_millis(parse_or(
                        "HA_POLL_MS",
                        get("HA_POLL_MS"),
                        1000,
                    )?),
                })
            }
            "mqtt" => {
                let url = get("MQTT_URL").ok_or_else(|| ConfigError::MissingValue {
                    key: "MQTT_URL".to_string(),
                })?;
                Ok(SourceConfig::Mqtt {
                    broker: BrokerAddress::parse(&url)
                        .map_err(|reason| invalid("MQTT_URL", &url, &reason))?,
                    client_id: get("MQTT_CLIENT_ID")
                        .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                })
            }
            "tcp" => {
                let address = get("LINE_FEED_ADDR").ok_or_else(|| ConfigError::MissingValue {
                    key: "LINE_FEED_ADDR".to_string(),
                })?;
                Ok(SourceConfig::Tcp {
                    address: parse_value("LINE_FEED_ADDR", &address)?,
                })
            }
            "stdin" => Ok(SourceConfig::Stdin),
            other => Err(invalid(
                "READING_SOURCE",
                other,
                "expected simulated, home-assistant, mqtt, tcp or stdin",
            )),
        }
    }
}

fn parse_channel_list(list: &str) -> Result<HashSet<Channel>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            name.parse::<Channel>()
                .map_err(|e| invalid("SUBSCRIBED_CHANNELS", name, &e.to_string()))
        })
        .collect()
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, value, &e.to_string()))
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(value) => parse_value(key, &value),
        None => Ok(default),
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
