//! Reconciles the patient roster against one gateway snapshot. Partial-key
//! matches take the first overlapping key in the gateway's order.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::presence::{
    LastSeen, PatientIdentity, PatientLocationRecord, PresenceState, RawPresenceMap,
    UnmatchedDevice,
};

const UNMATCHED_LABEL: &str = "Unknown Device";

/// Output of one reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    /// One record per roster entry, in roster order.
    pub records: Vec<PatientLocationRecord>,
    /// Gateway keys no roster entry claimed.
    pub unmatched: Vec<UnmatchedDevice>,
}

/// Resolves `roster` against `raw` using the wall clock.
pub fn resolve(
    roster: &[PatientIdentity],
    raw: &RawPresenceMap,
    previous: &[PatientLocationRecord],
) -> Vec<PatientLocationRecord> {
    resolve_at(roster, raw, previous, Utc::now()).records
}

pub fn resolve_at(
    roster: &[PatientIdentity],
    raw: &RawPresenceMap,
    previous: &[PatientLocationRecord],
    now: DateTime<Utc>,
) -> Resolution {
    let mut consumed: HashSet<&str> = HashSet::new();

    let records = roster
        .iter()
        .map(|patient| {
            let (state, key) = match_patient(patient, raw);
            if let Some(key) = key {
                consumed.insert(key);
            }
            let carried = previous_last_seen(previous, &patient.id);
            let last_seen = match state {
                PresenceState::InRange => carried.advance(now),
                _ => carried,
            };
            PatientLocationRecord {
                id: patient.id.clone(),
                name: patient.name.clone(),
                device_identifier: patient.device.clone().unwrap_or_default(),
                state,
                last_seen,
            }
        })
        .collect();

    let mut seen_labels = HashSet::new();
    let unmatched = raw
        .iter()
        .filter(|(key, _)| !consumed.contains(key) && !key.contains(UNMATCHED_LABEL))
        .filter_map(|(key, state)| {
            let label = format!("{UNMATCHED_LABEL} ({key})");
            seen_labels.insert(label.clone()).then(|| UnmatchedDevice {
                label,
                key: key.to_string(),
                state,
            })
        })
        .collect();

    Resolution { records, unmatched }
}

/// The snapshot delivered when the gateway could not be read: every patient is
/// `UNKNOWN` and keeps whatever `last_seen` it had.
pub fn degrade(
    roster: &[PatientIdentity],
    previous: &[PatientLocationRecord],
) -> Vec<PatientLocationRecord> {
    roster
        .iter()
        .map(|patient| PatientLocationRecord {
            id: patient.id.clone(),
            name: patient.name.clone(),
            device_identifier: patient.device.clone().unwrap_or_default(),
            state: PresenceState::Unknown,
            last_seen: previous_last_seen(previous, &patient.id),
        })
        .collect()
}

/// Returns the resolved state and the raw key that produced it, if any.
/// A key equal to the display name wins, then the first key that contains or
/// is contained in the device identifier. A device with no key is out of range.
fn match_patient<'a>(
    patient: &PatientIdentity,
    raw: &'a RawPresenceMap,
) -> (PresenceState, Option<&'a str>) {
    if !patient.name.is_empty() {
        if let Some((key, state)) = raw.iter().find(|(key, _)| *key == patient.name) {
            return (state, Some(key));
        }
    }

    let Some(device) = patient.device_identifier() else {
        return (PresenceState::Unknown, None);
    };

    raw.iter()
        .find(|(key, _)| !key.is_empty() && (device.contains(key) || key.contains(device)))
        .map(|(key, state)| (state, Some(key)))
        .unwrap_or((PresenceState::OutOfRange, None))
}

fn previous_last_seen(previous: &[PatientLocationRecord], id: &str) -> LastSeen {
    previous
        .iter()
        .find(|r| r.id == id)
        .map(|r| r.last_seen)
        .unwrap_or_default()
}
