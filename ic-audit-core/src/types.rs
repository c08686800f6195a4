//! Core domain types for ic-audit
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Project** | A program that reports to the collector, identified by name |
//! | **Project identity** | The (name, market, description, privileges) tuple a [`ProjectIdentity`] carries |
//! | **Envelope** | One audit event plus the full identity of the project that emitted it |
//! | **Audit trail** | All envelopes of one project, in arrival order |
//!
//! Envelopes are self-describing: every one of them carries the complete
//! project identity, so a store or a dump never needs to look it up elsewhere.

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known event types. The collector accepts any string.
pub mod events {
    pub const BOOT: &str = "boot";
    pub const ERROR: &str = "error";
    pub const TRADE_OPENED: &str = "trade_opened";
    pub const TRADE_CLOSED: &str = "trade_closed";
    pub const UNCLASSIFIED_EVENT: &str = "unclassified_event";
}

/// Well-known privilege tags. Advisory only; nothing enforces them.
pub mod privileges {
    pub const EXECUTE_TRADE: &str = "execute_trade";
    pub const POST_MORTEM_ANALYSIS: &str = "post_mortem_analysis";
    pub const LIVE_MONITORING: &str = "live_monitoring";
    pub const UTILITIES: &str = "utilities";
}

/// Top-level keys owned by [`Envelope`]; extra fields may not reuse them.
pub const RESERVED_FIELDS: [&str; 7] = [
    "event_type",
    "event_description",
    "timestamp",
    "project_name",
    "project_market",
    "project_description",
    "project_privileges",
];

/// Mapping of project name to its audit trail.
pub type AuditTrails = BTreeMap<String, Vec<Envelope>>;

/// Extra key/value pairs merged at the top level of an envelope.
pub type ExtraFields = BTreeMap<String, FieldValue>;

// ============================================
// Field values
// ============================================

/// Value of an extra field.
///
/// Restricted to scalars and string lists so the wire and snapshot formats
/// stay plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    /// JSON cannot carry NaN or infinities.
    pub fn is_encodable(&self) -> bool {
        match self {
            FieldValue::Float(v) => v.is_finite(),
            _ => true,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Text(v) => f.write_str(v),
            FieldValue::List(v) => write!(f, "[{}]", v.join(", ")),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Integer(value.into())
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Integer(value.into())
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::List(value)
    }
}

impl From<Vec<&str>> for FieldValue {
    fn from(value: Vec<&str>) -> Self {
        FieldValue::List(value.into_iter().map(str::to_string).collect())
    }
}

// ============================================
// Project identity
// ============================================

/// Identity a notifier attaches to every event it sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectIdentity {
    pub name: String,
    pub market: String,
    pub description: String,
    pub privileges: Vec<String>,
}

impl ProjectIdentity {
    pub fn new(
        name: impl Into<String>,
        market: impl Into<String>,
        description: impl Into<String>,
        privileges: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            market: market.into(),
            description: description.into(),
            privileges,
        }
    }
}

// ============================================
// Envelope
// ============================================

/// A single audit event.
///
/// Serializes to a flat JSON object: the fixed fields below plus every entry
/// of `extra_fields` as a top-level key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_type: String,
    pub event_description: String,
    /// Seconds since the Unix epoch, taken by the sender
    pub timestamp: f64,
    pub project_name: String,
    pub project_market: String,
    pub project_description: String,
    /// `null` and `null` entries are read as "no privilege"
    #[serde(default, deserialize_with = "privileges_skipping_nulls")]
    pub project_privileges: Vec<String>,
    #[serde(flatten)]
    pub extra_fields: ExtraFields,
}

impl Envelope {
    /// Build an envelope for `identity` stamped with `timestamp`.
    pub fn new(
        identity: &ProjectIdentity,
        event_type: impl Into<String>,
        event_description: impl Into<String>,
        timestamp: f64,
        extra_fields: ExtraFields,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_description: event_description.into(),
            timestamp,
            project_name: identity.name.clone(),
            project_market: identity.market.clone(),
            project_description: identity.description.clone(),
            project_privileges: identity.privileges.clone(),
            extra_fields,
        }
    }

    /// Sender timestamp as a UTC datetime, if representable.
    pub fn emitted_at(&self) -> Option<DateTime<Utc>> {
        if !self.timestamp.is_finite() {
            return None;
        }
        let secs = self.timestamp.floor();
        let nanos = ((self.timestamp - secs) * 1e9) as u32;
        Utc.timestamp_opt(secs as i64, nanos.min(999_999_999)).single()
    }

    /// Sender timestamp rendered in local time (`YYYY-mm-dd HH:MM:SS`).
    pub fn local_time_label(&self) -> String {
        match self.emitted_at() {
            Some(ts) => ts
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            None => self.timestamp.to_string(),
        }
    }
}

fn privileges_skipping_nulls<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<Option<String>>> = Option::deserialize(deserializer)?;
    Ok(raw.unwrap_or_default().into_iter().flatten().collect())
}

/// Current wall-clock time as float seconds since the Unix epoch.
pub fn unix_now() -> f64 {
    unix_seconds(Utc::now())
}

/// Convert a datetime to float seconds since the Unix epoch.
pub fn unix_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_micros()) / 1_000_000.0
}
