use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A named telemetry category published by the installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Voltage,
    Smoke,
    Energy,
    Maintenance,
    Impact,
    Microgrid,
    Emergency,
}

impl Channel {
    pub const ALL: [Channel; 7] = [
        Channel::Voltage,
        Channel::Smoke,
        Channel::Energy,
        Channel::Maintenance,
        Channel::Impact,
        Channel::Microgrid,
        Channel::Emergency,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Voltage => "voltage",
            Channel::Smoke => "smoke",
            Channel::Energy => "energy",
            Channel::Maintenance => "maintenance",
            Channel::Impact => "impact",
            Channel::Microgrid => "microgrid",
            Channel::Emergency => "emergency",
        }
    }

    /// Full transport topic for this channel, e.g. `solar/voltage`
    pub fn topic(&self, prefix: &str) -> String {
        if prefix.is_empty() {
            self.name().to_string()
        } else {
            format!("{}/{}", prefix.trim_end_matches('/'), self.name())
        }
    }

    /// Resolves a channel from a topic such as `solar/voltage` or a bare `voltage`.
    /// Only the last path segment is significant.
    pub fn from_topic(topic: &str) -> Option<Channel> {
        let segment = topic.trim().rsplit('/').next().unwrap_or_default();
        segment.parse().ok()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = MalformedReading;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Channel::ALL
            .into_iter()
            .find(|channel| channel.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| MalformedReading::UnknownChannel {
                topic: s.to_string(),
            })
    }
}

/// Raw message as delivered by a transport, before parsing
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

impl TopicMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::at(topic, payload, Utc::now())
    }

    pub fn at(
        topic: impl Into<String>,
        payload: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadingValue {
    Numeric(f64),
    Text(String),
}

impl ReadingValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ReadingValue::Numeric(value) => Some(*value),
            ReadingValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ReadingValue::Numeric(_) => None,
            ReadingValue::Text(text) => Some(text),
        }
    }
}

impl fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingValue::Numeric(value) => write!(f, "{value}"),
            ReadingValue::Text(text) => write!(f, "{text:?}"),
        }
    }
}

/// One timestamped observation on a channel
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub channel: Channel,
    pub value: ReadingValue,
    pub observed_at: DateTime<Utc>,
}

/// Payloads that cannot become a [`Reading`]. These are dropped, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedReading {
    #[error("empty payload on channel {channel}")]
    EmptyPayload { channel: Channel },
    #[error("unknown channel for topic `{topic}`")]
    UnknownChannel { topic: String },
}

impl Reading {
    pub fn new(channel: Channel, value: ReadingValue, observed_at: DateTime<Utc>) -> Self {
        Self {
            channel,
            value,
            observed_at,
        }
    }

    pub fn numeric(channel: Channel, value: f64, observed_at: DateTime<Utc>) -> Self {
        Self::new(channel, ReadingValue::Numeric(value), observed_at)
    }

    pub fn text(channel: Channel, text: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self::new(channel, ReadingValue::Text(text.into()), observed_at)
    }

    /// Parses a raw transport payload. Anything that is a finite decimal number becomes
    /// [`ReadingValue::Numeric`], any other non-empty payload is carried verbatim as text.
    pub fn parse(
        topic: &str,
        payload: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<Self, MalformedReading> {
        let channel = Channel::from_topic(topic).ok_or_else(|| MalformedReading::UnknownChannel {
            topic: topic.to_string(),
        })?;

        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return Err(MalformedReading::EmptyPayload { channel });
        }

        let value = match trimmed.parse::<f64>() {
            Ok(number) if number.is_finite() => ReadingValue::Numeric(number),
            _ => ReadingValue::Text(payload.to_string()),
        };

        Ok(Self::new(channel, value, observed_at))
    }

    pub fn from_message(message: &TopicMessage) -> Result<Self, MalformedReading> {
        Self::parse(&message.topic, &message.payload, message.received_at)
    }
}

/// Lower-cased alphanumerics only, so "Critical Alert: Voltage/Smoke" and
/// "criticalalertvoltagesmoke" compare equal.
fn normalise_status(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MaintenanceStatus {
    #[default]
    Operational,
    MaintenanceRequired,
}

impl MaintenanceStatus {
    pub fn from_status_text(text: &str) -> Option<Self> {
        match normalise_status(text).as_str() {
            // "All systems operational" is a heartbeat broadcast, never an acknowledgement
            "operational" => Some(Self::Operational),
            "maintenancerequired"
            | "immediatemaintenancerequired"
            | "performancedegradationdetected" => Some(Self::MaintenanceRequired),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Operational => "Operational",
            Self::MaintenanceRequired => "Immediate Maintenance Required",
        }
    }

    pub fn register_code(&self) -> u16 {
        match self {
            Self::Operational => 0,
            Self::MaintenanceRequired => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MicrogridStatus {
    #[default]
    Stable,
    ShuttingDown,
}

impl MicrogridStatus {
    pub fn from_status_text(text: &str) -> Option<Self> {
        match normalise_status(text).as_str() {
            "stable" => Some(Self::Stable),
            "shuttingdown" | "shuttingdowntopreventdamage" | "overload" => {
                Some(Self::ShuttingDown)
            }
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Stable => "Stable",
            Self::ShuttingDown => "Shutting Down to Prevent Damage",
        }
    }

    pub fn register_code(&self) -> u16 {
        match self {
            Self::Stable => 0,
            Self::ShuttingDown => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EmergencyStatus {
    #[default]
    Safe,
    CriticalAlert,
}

impl EmergencyStatus {
    pub fn from_status_text(text: &str) -> Option<Self> {
        let normalised = normalise_status(text);
        match normalised.as_str() {
            "safe" => Some(Self::Safe),
            "highenergysurgedetected" => Some(Self::CriticalAlert),
            other if other.starts_with("criticalalert") => Some(Self::CriticalAlert),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Safe => "Safe",
            Self::CriticalAlert => "Critical Alert: Voltage/Smoke Level Exceeded!",
        }
    }

    pub fn register_code(&self) -> u16 {
        match self {
            Self::Safe => 0,
            Self::CriticalAlert => 1,
        }
    }
}
