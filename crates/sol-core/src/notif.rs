//! Manager notification records and their SOL-object transform.
//!
//! A notification is what the Manager connector delivers upward: a name
//! tag, an optional network-time pair, and kind-specific fields.  The
//! transform maps one notification to *zero or more* SOL objects: health
//! reports fan out into one object per embedded section, unknown names
//! yield nothing.
//!
//! Epoch projection is NOT done here — the dispatcher stamps the epoch
//! (via the connector's time map) and passes it in.

use crate::object::{Mac, ObjectError, SolObject, SolType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Notification record
// ---------------------------------------------------------------------------

/// Network-time pair carried by notifications that are clocked by the
/// Manager (`utcSecs` / `utcUsecs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetTime {
    pub secs: i64,
    pub usecs: i64,
}

impl NetTime {
    /// The pair as a single integer microsecond value.
    pub fn as_micros(self) -> i64 {
        self.secs * 1_000_000 + self.usecs
    }
}

/// One notification from the Manager, consumed exactly once by the
/// dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Manager-side notification kind, e.g. `notifData`, `hr`, `event`.
    pub name: String,
    /// Kind-specific fields (JSON object).
    pub fields: Value,
}

impl Notification {
    pub fn new(name: impl Into<String>, fields: Value) -> Notification {
        Notification {
            name: name.into(),
            fields,
        }
    }

    /// The network-time pair, when present in the fields.
    pub fn net_time(&self) -> Option<NetTime> {
        let secs = self.fields.get("utcSecs")?.as_i64()?;
        let usecs = self.fields.get("utcUsecs").and_then(Value::as_i64).unwrap_or(0);
        Some(NetTime { secs, usecs })
    }

    /// The originating mote MAC, when the record carries one.
    pub fn mote_mac(&self) -> Result<Option<Mac>, TransformError> {
        match self.fields.get("macAddress") {
            None => Ok(None),
            Some(v) => {
                let s = v
                    .as_str()
                    .ok_or_else(|| TransformError::BadField("macAddress"))?;
                let mac = s
                    .parse::<Mac>()
                    .map_err(TransformError::Object)?;
                Ok(Some(mac))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Notification -> SOL objects
// ---------------------------------------------------------------------------

/// Health-report sections that fan out into one object each.
const HR_SECTIONS: [&str; 3] = ["Device", "Neighbors", "Discovered"];

/// Transform a notification into its SOL objects.
///
/// `epoch` is the already-projected timestamp; `manager_mac` is used for
/// records that are Manager-scoped (events) rather than mote-scoped.
pub fn to_sol_objects(
    notif: &Notification,
    epoch: i64,
    manager_mac: Mac,
) -> Result<Vec<SolObject>, TransformError> {
    let mac = notif.mote_mac()?.unwrap_or(manager_mac);

    let objs = match notif.name.as_str() {
        "notifData" => vec![SolObject::new(
            mac,
            epoch,
            SolType::RawData,
            payload_without_envelope(&notif.fields),
        )?],
        "oap" => vec![SolObject::new(
            mac,
            epoch,
            SolType::Oap,
            payload_without_envelope(&notif.fields),
        )?],
        "event" => vec![SolObject::new(
            manager_mac,
            epoch,
            SolType::Event,
            payload_without_envelope(&notif.fields),
        )?],
        "notifLog" => vec![SolObject::new(
            mac,
            epoch,
            SolType::Log,
            payload_without_envelope(&notif.fields),
        )?],
        "notifIpData" => vec![SolObject::new(
            mac,
            epoch,
            SolType::IpData,
            payload_without_envelope(&notif.fields),
        )?],
        "managerStats" => vec![SolObject::new(
            manager_mac,
            epoch,
            SolType::ManagerStats,
            payload_without_envelope(&notif.fields),
        )?],
        "hr" => {
            let mut objs = Vec::new();
            for section in HR_SECTIONS {
                if let Some(report) = notif.fields.get(section) {
                    objs.push(SolObject::new(
                        mac,
                        epoch,
                        SolType::HealthReport,
                        serde_json::json!({ "section": section, "report": report }),
                    )?);
                }
            }
            objs
        }
        // Unknown notification kinds produce nothing.
        _ => Vec::new(),
    };
    Ok(objs)
}

/// Copy of the fields object with the envelope keys (source MAC and
/// network time) removed — those live on the SOL object itself.
fn payload_without_envelope(fields: &Value) -> Value {
    match fields.as_object() {
        Some(map) => {
            let filtered: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !matches!(k.as_str(), "macAddress" | "utcSecs" | "utcUsecs"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Object(filtered)
        }
        None => Value::Null,
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("bad notification field: {0}")]
    BadField(&'static str),
    #[error(transparent)]
    Object(#[from] ObjectError),
}
