//! Canonical sensor object ("SOL object") and its component types.
//!
//! A SOL object is the unit flowing through the publication pipeline:
//! `{mac, timestamp, type, value}`.  Objects are immutable after creation;
//! the constructor enforces the invariants (8-byte MAC, positive epoch
//! timestamp, type from the closed enumeration).

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Mac
// ---------------------------------------------------------------------------

/// An 8-byte device identifier (a mote or the Manager itself).
///
/// Rendered as lowercase dash-separated hex, e.g.
/// `00-17-0d-00-00-38-06-5b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mac(pub [u8; 8]);

impl Mac {
    /// The all-zero MAC, used to seed Manager-side iteration commands.
    pub const ZERO: Mac = Mac([0u8; 8]);

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Build a MAC from an arbitrary byte slice.
    ///
    /// Returns `None` unless the slice is exactly 8 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Mac> {
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(Mac(arr))
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl FromStr for Mac {
    type Err = ObjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(['-', ':']).collect();
        if parts.len() != 8 {
            return Err(ObjectError::BadMac(s.to_owned()));
        }
        let mut bytes = [0u8; 8];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] =
                u8::from_str_radix(part, 16).map_err(|_| ObjectError::BadMac(s.to_owned()))?;
        }
        Ok(Mac(bytes))
    }
}

impl Serialize for Mac {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Mac {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// SolType
// ---------------------------------------------------------------------------

/// The closed enumeration of sensor-object types.
///
/// The numeric values are the on-wire type codes of the binary encoding;
/// they never change once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolType {
    /// Raw upstream data frame from a mote.
    RawData,
    /// Network event (mote join, path change, command finished, ...).
    Event,
    /// Parsed health report section.
    HealthReport,
    /// 6LoWPAN packet received from a mote.
    IpData,
    /// Log notification from a mote.
    Log,
    /// Manager-side statistics record.
    ManagerStats,
    /// Object-attribute-protocol report carried over raw data.
    Oap,
    /// Point-in-time topology snapshot (motes + paths).
    Snapshot,
    /// The gateway's own version/statistics record.
    SolmanagerStats,
}

impl SolType {
    /// On-wire type code.
    pub fn code(self) -> u8 {
        match self {
            SolType::RawData => 0x01,
            SolType::Event => 0x02,
            SolType::HealthReport => 0x03,
            SolType::IpData => 0x04,
            SolType::Log => 0x05,
            SolType::ManagerStats => 0x06,
            SolType::Oap => 0x10,
            SolType::Snapshot => 0x20,
            SolType::SolmanagerStats => 0x27,
        }
    }

    /// Inverse of [`SolType::code`].
    pub fn from_code(code: u8) -> Option<SolType> {
        match code {
            0x01 => Some(SolType::RawData),
            0x02 => Some(SolType::Event),
            0x03 => Some(SolType::HealthReport),
            0x04 => Some(SolType::IpData),
            0x05 => Some(SolType::Log),
            0x06 => Some(SolType::ManagerStats),
            0x10 => Some(SolType::Oap),
            0x20 => Some(SolType::Snapshot),
            0x27 => Some(SolType::SolmanagerStats),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// SolObject
// ---------------------------------------------------------------------------

/// The canonical sensor record.
///
/// Created by the ingest dispatcher (from notifications), the snapshot
/// collector, and the stats publisher.  Immutable after creation; the
/// publishers consume it without mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolObject {
    pub mac: Mac,
    /// Epoch seconds UTC.  Always > 0.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub sol_type: SolType,
    pub value: serde_json::Value,
}

impl SolObject {
    /// Build an object, enforcing the model invariants.
    ///
    /// `timestamp` must be positive and `value` must be a JSON object or
    /// null (the per-type payload schema is a JSON object throughout).
    pub fn new(
        mac: Mac,
        timestamp: i64,
        sol_type: SolType,
        value: serde_json::Value,
    ) -> Result<SolObject, ObjectError> {
        if timestamp <= 0 {
            return Err(ObjectError::BadTimestamp(timestamp));
        }
        if !(value.is_object() || value.is_null()) {
            return Err(ObjectError::BadValue(sol_type));
        }
        Ok(SolObject {
            mac,
            timestamp,
            sol_type,
            value,
        })
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("invalid MAC '{0}': expected 8 dash-separated hex octets")]
    BadMac(String),
    #[error("invalid timestamp {0}: must be > 0")]
    BadTimestamp(i64),
    #[error("invalid value payload for type {0:?}: expected JSON object")]
    BadValue(SolType),
}
