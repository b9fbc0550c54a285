//! JSON envelopes exchanged with the fleet
//!
//! Outbound traffic is always a [`CommandEnvelope`]; inbound traffic is
//! expected to be a device report. Decoding never panics and never logs,
//! callers decide what to do with a [`DecodeError`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Value of the `type` field of every control envelope
pub const ENVELOPE_TYPE: &str = "control";
/// Fixed provenance tag kept for wire compatibility with the firmware
pub const ENVELOPE_STATUS: &str = "connected";
/// Wildcard device id addressing the whole fleet
pub const BROADCAST_TARGET: &str = "ALL";

/// Who a command is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Device(String),
}

impl Target {
    pub fn as_str(&self) -> &str {
        match self {
            Target::All => BROADCAST_TARGET,
            Target::Device(id) => id,
        }
    }
}

impl From<&str> for Target {
    fn from(value: &str) -> Self {
        if value.eq_ignore_ascii_case(BROADCAST_TARGET) {
            Target::All
        } else {
            Target::Device(value.to_string())
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Action requested from a device
///
/// The firmware understands `ON`, `OFF` and `status`; anything else is
/// carried through untouched as [`Action::Custom`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    On,
    Off,
    Status,
    Custom(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::On => "ON",
            Action::Off => "OFF",
            Action::Status => "status",
            Action::Custom(message) => message,
        }
    }
}

impl From<&str> for Action {
    fn from(value: &str) -> Self {
        match value {
            "ON" => Action::On,
            "OFF" => Action::Off,
            "status" => Action::Status,
            other => Action::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Flat JSON control message sent to the fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub controller: String,
    pub device: String,
    pub status: String,
    pub message: String,
}

impl CommandEnvelope {
    pub fn new(controller: &str, target: &Target, action: &Action) -> Self {
        Self {
            kind: ENVELOPE_TYPE.to_string(),
            controller: controller.to_string(),
            device: target.as_str().to_string(),
            status: ENVELOPE_STATUS.to_string(),
            message: action.as_str().to_string(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // A struct of plain strings always serializes
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Strict decode, every field must be present
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(payload).map_err(DecodeError::MalformedPayload)
    }

    pub fn target(&self) -> Target {
        Target::from(self.device.as_str())
    }

    pub fn action(&self) -> Action {
        Action::from(self.message.as_str())
    }
}

/// Builds the payload for `action` addressed to `target`
pub fn encode(controller: &str, target: &Target, action: &Action) -> Vec<u8> {
    CommandEnvelope::new(controller, target, action).to_bytes()
}

/// Connectivity a device reports about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PresenceStatus {
    Connected,
    #[default]
    Disconnected,
}

impl PresenceStatus {
    fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("connected") {
            Some(PresenceStatus::Connected)
        } else if value.eq_ignore_ascii_case("disconnected") {
            Some(PresenceStatus::Disconnected)
        } else {
            None
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PresenceStatus::Connected => write!(f, "Connected"),
            PresenceStatus::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Operating state a device reports (or is driven to by a timeout)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerState {
    On,
    #[default]
    Off,
}

impl PowerState {
    fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("on") {
            Some(PowerState::On)
        } else if value.eq_ignore_ascii_case("off") {
            Some(PowerState::Off)
        } else {
            None
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PowerState::On => write!(f, "ON"),
            PowerState::Off => write!(f, "OFF"),
        }
    }
}

/// Decoded inbound device report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub device: String,
    pub status: PresenceStatus,
    pub state: PowerState,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("incomplete report: missing or empty `{0}`")]
    IncompleteReport(&'static str),

    #[error("invalid value {value:?} for `{field}`")]
    InvalidField { field: &'static str, value: String },
}

// Lenient mirror of the report; required-ness is checked by hand so that a
// missing field and a malformed document produce different errors.
#[derive(Deserialize)]
struct RawReport {
    device: Option<String>,
    status: Option<String>,
    state: Option<String>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, DecodeError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(DecodeError::IncompleteReport(field)),
    }
}

/// Parses a device report
///
/// `device` and `status` are required. Older firmware omits `state`, which
/// then defaults to [`PowerState::Off`]; a present but empty `state` is
/// still rejected.
pub fn decode(payload: &[u8]) -> Result<DeviceReport, DecodeError> {
    let raw: RawReport = serde_json::from_slice(payload).map_err(DecodeError::MalformedPayload)?;

    let device = required(raw.device, "device")?;
    let status = required(raw.status, "status")?;
    let status = PresenceStatus::parse(&status).ok_or(DecodeError::InvalidField {
        field: "status",
        value: status,
    })?;

    let state = match raw.state {
        None => PowerState::Off,
        Some(state) => {
            let state = required(Some(state), "state")?;
            PowerState::parse(&state).ok_or(DecodeError::InvalidField {
                field: "state",
                value: state,
            })?
        }
    };

    Ok(DeviceReport {
        device,
        status,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_status_request_carries_action_and_wildcard() {
        let payload = encode("MQTT_master", &Target::All, &Action::Status);
        let envelope = CommandEnvelope::decode(&payload).unwrap();

        assert_eq!(envelope.kind, "control");
        assert_eq!(envelope.controller, "MQTT_master");
        assert_eq!(envelope.device, "ALL");
        assert_eq!(envelope.status, "connected");
        assert_eq!(envelope.message, "status");
        assert_eq!(envelope.target(), Target::All);
        assert_eq!(envelope.action(), Action::Status);
    }

    #[test]
    fn device_command_is_flat_json() {
        let payload = encode("MQTT_master", &Target::Device("ESP32-3".into()), &Action::On);
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(value["device"], "ESP32-3");
        assert_eq!(value["message"], "ON");
        assert_eq!(value.as_object().unwrap().len(), 5);
    }

    #[test]
    fn envelope_decode_requires_every_field() {
        let err = CommandEnvelope::decode(br#"{"type":"control","device":"ALL"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload(_)));
    }

    #[test]
    fn unknown_actions_pass_through() {
        let payload = encode("MQTT_master", &Target::All, &Action::from("blink"));
        let envelope = CommandEnvelope::decode(&payload).unwrap();
        assert_eq!(envelope.action(), Action::Custom("blink".into()));
    }

    #[test]
    fn decodes_full_report() {
        let report = decode(br#"{"device":"ESP32-2","status":"Connected","state":"ON"}"#).unwrap();
        assert_eq!(
            report,
            DeviceReport {
                device: "ESP32-2".into(),
                status: PresenceStatus::Connected,
                state: PowerState::On,
            }
        );
    }

    #[test]
    fn missing_state_defaults_to_off() {
        let report = decode(br#"{"device":"ESP32-1","status":"Connected"}"#).unwrap();
        assert_eq!(report.state, PowerState::Off);
    }

    #[test]
    fn malformed_json_is_typed() {
        let err = decode(b"{not json").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload(_)));

        let err = decode(b"ON").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload(_)));
    }

    #[test]
    fn missing_or_empty_fields_are_incomplete() {
        let err = decode(br#"{"status":"Connected","state":"ON"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::IncompleteReport("device")));

        let err = decode(br#"{"device":"","status":"Connected"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::IncompleteReport("device")));

        let err = decode(br#"{"device":"ESP32-1","status":"Connected","state":""}"#).unwrap_err();
        assert!(matches!(err, DecodeError::IncompleteReport("state")));
    }

    #[test]
    fn unknown_status_value_is_rejected() {
        let err = decode(br#"{"device":"ESP32-1","status":"sleeping"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { field: "status", .. }));
    }
}
