// Power event model and its wire encoding
//
// Wire form is a JSON object: {"state": "Standby", "timeGenerated": "2025-12-20T12:40:00Z"}
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Host power state carried by a [`PowerEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerState {
    Awake,
    Standby,
    /// Any state name this relay does not recognise
    #[serde(other)]
    Unknown,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::Awake => "Awake",
            PowerState::Standby => "Standby",
            PowerState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single host power-state transition.
///
/// `time_generated` is when the OS observed the transition, not when the relay
/// received it. Events have no identity beyond their content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerEvent {
    state: PowerState,
    #[serde(with = "time_generated")]
    time_generated: DateTime<Utc>,
}

impl PowerEvent {
    pub fn new(state: PowerState, time_generated: DateTime<Utc>) -> Self {
        Self {
            state,
            time_generated,
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn time_generated(&self) -> DateTime<Utc> {
        self.time_generated
    }
}

/// Payload could not be turned into a [`PowerEvent`]
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("malformed power event: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode an event into its wire representation
pub fn encode(event: &PowerEvent) -> Vec<u8> {
    // Serializing a struct of a unit enum and a string cannot fail
    serde_json::to_vec(event).unwrap_or_default()
}

/// Decode a wire payload. Both `state` and `timeGenerated` are required.
pub fn decode(payload: &[u8]) -> Result<PowerEvent, DecodeError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }
    Ok(serde_json::from_slice(payload)?)
}

/// Shortened, lossy view of a payload for log lines
pub fn preview(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() > 100 {
        let head: String = text.chars().take(100).collect();
        format!("{head}...")
    } else {
        text.into_owned()
    }
}

// RFC 3339 on the way out; RFC 3339 or an offset-less datetime (read as UTC) on the way in.
mod time_generated {
    use super::*;

    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid timeGenerated: {raw:?}"))
        })
    }

    pub(super) fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(|naive| naive.and_utc())
    }
}
