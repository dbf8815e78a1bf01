//! Device records
//!
//! Devices are identified by an opaque serial and created the first time the
//! tracker observes them. Attributes are mutated only by the tracker;
//! offline devices stay in the set (state `Offline`) until process shutdown.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Connection state as reported by the debug bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Online,
    Offline,
    Unauthorized,
    Unknown,
}

impl DeviceState {
    /// Parse the state column of a `track-devices` line
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "device" => DeviceState::Online,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            _ => DeviceState::Unknown,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, DeviceState::Online)
    }
}

/// A tracked Android device
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub serial: String,
    pub state: DeviceState,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub is_emulator: bool,
    pub last_seen_at: DateTime<Utc>,
}

impl Device {
    pub fn new(serial: impl Into<String>, state: DeviceState) -> Self {
        let serial = serial.into();
        let is_emulator = serial.starts_with("emulator-");
        Self {
            serial,
            state,
            model: None,
            manufacturer: None,
            is_emulator,
            last_seen_at: Utc::now(),
        }
    }
}

/// Full current set of `(serial, state)` pairs from one tracking event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSetSnapshot {
    pub devices: Vec<(String, DeviceState)>,
}

impl DeviceSetSnapshot {
    /// Parse the payload of one `track-devices` frame
    ///
    /// Each line is `<serial>\t<state>`; blank payloads mean no devices.
    pub fn parse(payload: &str) -> Self {
        let devices = payload
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() {
                    return None;
                }
                let mut parts = line.split('\t');
                let serial = parts.next()?.trim();
                let state = parts.next()?.trim();
                if serial.is_empty() {
                    return None;
                }
                Some((serial.to_string(), DeviceState::parse(state)))
            })
            .collect();
        Self { devices }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_parse() {
        assert_eq!(DeviceState::parse("device"), DeviceState::Online);
        assert_eq!(DeviceState::parse("offline"), DeviceState::Offline);
        assert_eq!(DeviceState::parse("unauthorized"), DeviceState::Unauthorized);
        assert_eq!(DeviceState::parse("connecting"), DeviceState::Unknown);
        assert_eq!(DeviceState::parse("DEVICE"), DeviceState::Online);
    }

    #[test]
    fn test_emulator_detection() {
        assert!(Device::new("emulator-5554", DeviceState::Online).is_emulator);
        assert!(!Device::new("R5CT1027ABC", DeviceState::Online).is_emulator);
    }

    #[test]
    fn test_snapshot_parse() {
        let snap = DeviceSetSnapshot::parse("emulator-5554\tdevice\nR5CT1027ABC\tunauthorized\n");
        assert_eq!(
            snap.devices,
            vec![
                ("emulator-5554".to_string(), DeviceState::Online),
                ("R5CT1027ABC".to_string(), DeviceState::Unauthorized),
            ]
        );
    }

    #[test]
    fn test_snapshot_parse_empty() {
        assert!(DeviceSetSnapshot::parse("").devices.is_empty());
        assert!(DeviceSetSnapshot::parse("\n\n").devices.is_empty());
    }
}
