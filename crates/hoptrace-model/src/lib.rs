//! Shared data structures for hoptrace.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Delay recorded for a hop whose probes all timed out.
pub const TIMED_OUT_DELAY_MS: f64 = -1.0;

/// Address recorded for a hop that never replied.
pub const NO_REPLY_ADDRESS: &str = "*";

/// Serialized form of [`GeoField::Unknown`].
pub const UNKNOWN_MARKER: &str = "unknown";

/// One geographic component. `Unknown` is distinct from an empty string so
/// callers can tell "not parsed yet" from "parsed as nothing".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GeoField {
    #[default]
    Unknown,
    Known(String),
}

impl GeoField {
    pub fn is_unknown(&self) -> bool {
        matches!(self, GeoField::Unknown)
    }

    pub fn as_known(&self) -> Option<&str> {
        match self {
            GeoField::Unknown => None,
            GeoField::Known(value) => Some(value),
        }
    }
}

impl From<String> for GeoField {
    fn from(value: String) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed == UNKNOWN_MARKER {
            GeoField::Unknown
        } else {
            GeoField::Known(trimmed.to_string())
        }
    }
}

impl From<&str> for GeoField {
    fn from(value: &str) -> Self {
        GeoField::from(value.to_string())
    }
}

impl From<GeoField> for String {
    fn from(value: GeoField) -> Self {
        match value {
            GeoField::Unknown => UNKNOWN_MARKER.to_string(),
            GeoField::Known(text) => text,
        }
    }
}

impl fmt::Display for GeoField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeoField::Unknown => f.write_str(UNKNOWN_MARKER),
            GeoField::Known(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Geo {
    pub country: GeoField,
    pub region: GeoField,
    pub city: GeoField,
}

impl Geo {
    /// Merges positional tokens (country, region, city) into the fields that
    /// are still unknown. Returns true if any field changed.
    pub fn fill_unknown<S: AsRef<str>>(&mut self, tokens: &[S]) -> bool {
        let mut changed = false;
        let slots = [&mut self.country, &mut self.region, &mut self.city];
        for (slot, token) in slots.into_iter().zip(tokens) {
            if slot.is_unknown() {
                let value = GeoField::from(token.as_ref());
                if !value.is_unknown() {
                    *slot = value;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Fills unknown fields from another geo value. Returns true if any field
    /// changed.
    pub fn merge_from(&mut self, other: &Geo) -> bool {
        let mut changed = false;
        for (slot, value) in [
            (&mut self.country, &other.country),
            (&mut self.region, &other.region),
            (&mut self.city, &other.city),
        ] {
            if slot.is_unknown() && !value.is_unknown() {
                *slot = value.clone();
                changed = true;
            }
        }
        changed
    }

    pub fn is_unknown(&self) -> bool {
        self.country.is_unknown() && self.region.is_unknown() && self.city.is_unknown()
    }

    /// Human label with repeated components collapsed, e.g. "China Shanghai".
    pub fn label(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for field in [&self.country, &self.region, &self.city] {
            if let Some(text) = field.as_known() {
                if !parts.contains(&text) {
                    parts.push(text);
                }
            }
        }
        if parts.is_empty() {
            UNKNOWN_MARKER.to_string()
        } else {
            parts.join(" ")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HopRecord {
    pub hop_number: u32,
    pub address: String,
    pub delay_ms: f64,
    pub geo: Geo,
    pub network_owner: Option<String>,
    pub is_final: bool,
}

impl HopRecord {
    pub fn new(hop_number: u32, address: impl Into<String>) -> Self {
        Self {
            hop_number,
            address: address.into(),
            delay_ms: 0.0,
            geo: Geo::default(),
            network_owner: None,
            is_final: false,
        }
    }

    pub fn timed_out(hop_number: u32) -> Self {
        Self {
            delay_ms: TIMED_OUT_DELAY_MS,
            ..Self::new(hop_number, NO_REPLY_ADDRESS)
        }
    }

    pub fn is_timed_out(&self) -> bool {
        self.delay_ms < 0.0
    }

    pub fn has_reply(&self) -> bool {
        self.address != NO_REPLY_ADDRESS
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    #[serde(rename = "IPv4")]
    V4,
    #[serde(rename = "IPv6")]
    V6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => f.write_str("IPv4"),
            AddressFamily::V6 => f.write_str("IPv6"),
        }
    }
}

/// One candidate address offered by a disambiguation prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionOption {
    pub offered_index: u32,
    pub address: String,
    pub family: AddressFamily,
    pub geo_hint: GeoField,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    TimedOut,
    Cancelled,
    Failed { reason: String },
}

impl SessionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionStatus::Completed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionOutcome {
    pub target: String,
    pub backend: String,
    pub hops: Vec<HopRecord>,
    pub artifact: Option<String>,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geo_field_serializes_unknown_marker() {
        let geo = Geo {
            country: GeoField::Known("China".to_string()),
            ..Geo::default()
        };
        let json = serde_json::to_string(&geo).unwrap();
        assert_eq!(
            json,
            r#"{"country":"China","region":"unknown","city":"unknown"}"#
        );

        let decoded: Geo = serde_json::from_str(r#"{"country":"","region":"unknown","city":"Tokyo"}"#)
            .unwrap();
        assert!(decoded.country.is_unknown());
        assert!(decoded.region.is_unknown());
        assert_eq!(decoded.city.as_known(), Some("Tokyo"));
    }

    #[test]
    fn fill_unknown_keeps_parsed_fields() {
        let mut geo = Geo {
            country: GeoField::Known("China".to_string()),
            ..Geo::default()
        };
        assert!(geo.fill_unknown(&["Japan", "Jiangsu", "Nanjing"]));
        assert_eq!(geo.country.as_known(), Some("China"));
        assert_eq!(geo.region.as_known(), Some("Jiangsu"));
        assert_eq!(geo.city.as_known(), Some("Nanjing"));
        assert!(!geo.fill_unknown(&["Japan", "Tokyo", "Tokyo"]));
    }

    #[test]
    fn label_collapses_duplicates() {
        let mut geo = Geo::default();
        assert_eq!(geo.label(), "unknown");
        geo.fill_unknown(&["China", "Shanghai", "Shanghai"]);
        assert_eq!(geo.label(), "China Shanghai");
    }

    #[test]
    fn outcome_round_trip_is_stable() {
        let outcome = SessionOutcome {
            target: "example.com".to_string(),
            backend: "rich".to_string(),
            hops: vec![
                HopRecord {
                    hop_number: 1,
                    address: "192.168.1.1".to_string(),
                    delay_ms: 1.2,
                    geo: Geo::default(),
                    network_owner: None,
                    is_final: false,
                },
                HopRecord {
                    is_final: true,
                    ..HopRecord::timed_out(2)
                },
            ],
            artifact: Some("https://assets.nxtrace.org/tracemap/abc.html".to_string()),
            status: SessionStatus::Failed {
                reason: "backend exited".to_string(),
            },
            exit_code: Some(1),
        };

        let json = serde_json::to_string_pretty(&outcome).unwrap();
        let decoded: SessionOutcome = serde_json::from_str(&json).unwrap();

        assert_eq!(outcome, decoded);
        assert!(decoded.hops[1].is_timed_out());
        assert!(!decoded.hops[1].has_reply());
    }
}
