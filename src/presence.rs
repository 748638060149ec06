use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};

/// What the gateway last reported for a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceState {
    InRange,
    OutOfRange,
    /// Also used for any state string the gateway sends that we don't recognise.
    #[default]
    #[serde(other)]
    Unknown,
}

impl PresenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceState::InRange => "IN_RANGE",
            PresenceState::OutOfRange => "OUT_OF_RANGE",
            PresenceState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw `device key -> state` map from one `/get_status` response.
///
/// Keys keep the order in which the gateway listed them; the fallback matcher
/// scans them in that order.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RawPresenceMap(IndexMap<String, PresenceState>);

impl RawPresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, state: PresenceState) {
        self.0.insert(key.into(), state);
    }

    pub fn get(&self, key: &str) -> Option<PresenceState> {
        self.0.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, PresenceState)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, PresenceState)> for RawPresenceMap {
    fn from_iter<I: IntoIterator<Item = (K, PresenceState)>>(iter: I) -> Self {
        RawPresenceMap(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// A tracked patient as supplied by the roster.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PatientIdentity {
    pub id: String,
    #[serde(alias = "display_name", default)]
    pub name: String,
    /// RFID tag / beacon MAC. Empty and absent both mean "no device registered".
    #[serde(alias = "device_identifier", default)]
    pub device: Option<String>,
}

impl PatientIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        PatientIdentity {
            id: id.into(),
            name: name.into(),
            device: None,
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// The registered device identifier, if there is a non-blank one.
    pub fn device_identifier(&self) -> Option<&str> {
        self.device
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
    }
}

/// When a patient was last seen in range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LastSeen {
    #[default]
    Unknown,
    At(DateTime<Utc>),
}

impl LastSeen {
    /// Moves the timestamp to `now` unless it is already later.
    pub fn advance(self, now: DateTime<Utc>) -> LastSeen {
        match self {
            LastSeen::At(prev) if prev > now => LastSeen::At(prev),
            _ => LastSeen::At(now),
        }
    }
}

impl fmt::Display for LastSeen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastSeen::Unknown => f.write_str("Unknown"),
            LastSeen::At(ts) => f.write_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }
}

impl serde::Serialize for LastSeen {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Resolved location of one roster entry for one tick.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PatientLocationRecord {
    pub id: String,
    pub name: String,
    pub device_identifier: String,
    pub state: PresenceState,
    pub last_seen: LastSeen,
}

/// A gateway key that no roster entry claimed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnmatchedDevice {
    pub label: String,
    pub key: String,
    pub state: PresenceState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_raw_map_keeps_server_order() {
        let raw: RawPresenceMap =
            serde_json::from_str(r#"{"zeta":"IN_RANGE","alpha":"OUT_OF_RANGE","mid":"UNKNOWN"}"#)
                .unwrap();
        let keys: Vec<&str> = raw.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
        assert_eq!(raw.get("alpha"), Some(PresenceState::OutOfRange));
    }

    #[test]
    fn test_unrecognised_state_is_unknown() {
        let raw: RawPresenceMap = serde_json::from_str(r#"{"tag":"OFFLINE"}"#).unwrap();
        assert_eq!(raw.get("tag"), Some(PresenceState::Unknown));
    }

    #[test]
    fn test_non_string_state_is_rejected() {
        assert!(serde_json::from_str::<RawPresenceMap>(r#"{"tag":3}"#).is_err());
        assert!(serde_json::from_str::<RawPresenceMap>(r#"["IN_RANGE"]"#).is_err());
    }

    #[test]
    fn test_blank_device_is_not_registered() {
        let p = PatientIdentity::new("p1", "John").with_device("   ");
        assert_eq!(p.device_identifier(), None);
        let p = PatientIdentity::new("p1", "John").with_device("AA:BB:CC");
        assert_eq!(p.device_identifier(), Some("AA:BB:CC"));
    }

    #[test]
    fn test_last_seen_never_moves_backwards() {
        let t1 = Utc.with_ymd_and_hms(2025, 4, 6, 13, 23, 39).unwrap();
        let earlier = t1 - Duration::seconds(30);
        assert_eq!(LastSeen::At(t1).advance(earlier), LastSeen::At(t1));
        assert_eq!(LastSeen::Unknown.advance(t1), LastSeen::At(t1));
        assert_eq!(LastSeen::At(earlier).advance(t1), LastSeen::At(t1));
    }

    #[test]
    fn test_record_serialization() {
        let record = PatientLocationRecord {
            id: "p1".to_string(),
            name: "John".to_string(),
            device_identifier: "AA:BB:CC".to_string(),
            state: PresenceState::OutOfRange,
            last_seen: LastSeen::Unknown,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["state"], "OUT_OF_RANGE");
        assert_eq!(json["last_seen"], "Unknown");
    }
}
