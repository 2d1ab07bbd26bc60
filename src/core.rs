//! Core data types shared by every instrument driver.
//!
//! This module defines the vocabulary the rest of the crate speaks:
//!
//! - [`Measurement`]: the unit of cached state (value + timestamp + units)
//! - [`InstrumentStatus`] and [`StatusCell`]: per-instrument health, updated
//!   at the completion of every hardware exchange
//! - [`Direction`] / [`ValueKind`]: presentation tags consumed by an external
//!   UI layer
//! - [`PropertyValue`]: the dynamically typed value carried through the
//!   property surface
//!
//! # Thread Safety
//!
//! `StatusCell` wraps a `tokio::sync::watch` channel so that the latest status
//! can be replaced and read from any task without holding a lock across an
//! exchange.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::warn;

use crate::error::DaqError;

// =============================================================================
// Measurement
// =============================================================================

/// The most recently known reading or setpoint of a property.
///
/// `time` and `value` only change together. A `Measurement` handed to a
/// caller is always a copy of the cached one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement<T> {
    /// Cached value.
    pub value: T,
    /// When `value` was last written. Starts at the Unix epoch.
    pub time: DateTime<Utc>,
    /// Physical unit, empty for unitless values.
    pub units: String,
}

impl<T> Measurement<T> {
    /// A measurement that has never been refreshed.
    pub fn new(value: T, units: impl Into<String>) -> Self {
        Self {
            value,
            time: DateTime::<Utc>::default(),
            units: units.into(),
        }
    }

    /// Replace the value, stamping it no earlier than the previous stamp.
    pub(crate) fn stamp(&mut self, value: T) {
        let now = Utc::now();
        self.time = if now > self.time { now } else { self.time };
        self.value = value;
    }

    /// Convert the value while keeping time and units.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Measurement<U> {
        Measurement {
            value: f(self.value),
            time: self.time,
            units: self.units,
        }
    }
}

/// A type-erased measurement, as returned by the property surface.
pub type Reading = Measurement<PropertyValue>;

// =============================================================================
// Instrument Status
// =============================================================================

/// Health of one instrument.
///
/// The latest exchange outcome always overwrites the previous status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentStatus {
    /// No exchange has completed yet.
    Disconnected,
    /// The last exchange succeeded.
    Connected,
    /// Values are synthesized, no hardware is involved.
    Testing,
    /// The last exchange failed with this fault description.
    Error(String),
}

impl fmt::Display for InstrumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentStatus::Disconnected => write!(f, "Disconnected"),
            InstrumentStatus::Connected => write!(f, "Connected"),
            InstrumentStatus::Testing => write!(f, "Testing"),
            InstrumentStatus::Error(message) => write!(f, "{}", message),
        }
    }
}

/// Status holder shared by a device and the tasks it spawns.
#[derive(Debug)]
pub struct StatusCell {
    owner: String,
    simulated: bool,
    sender: watch::Sender<InstrumentStatus>,
}

impl StatusCell {
    /// Create a cell in the `Disconnected` state.
    pub fn new(owner: impl Into<String>, simulated: bool) -> Self {
        let (sender, _) = watch::channel(InstrumentStatus::Disconnected);
        Self {
            owner: owner.into(),
            simulated,
            sender,
        }
    }

    /// Current status.
    pub fn get(&self) -> InstrumentStatus {
        self.sender.borrow().clone()
    }

    /// Fold a successful exchange into the status.
    pub fn record_success(&self) {
        let next = if self.simulated {
            InstrumentStatus::Testing
        } else {
            InstrumentStatus::Connected
        };
        self.sender.send_replace(next);
    }

    /// Fold a failed exchange into the status.
    pub fn record_failure(&self, err: &DaqError) {
        warn!("[{}] {}", self.owner, err);
        self.sender
            .send_replace(InstrumentStatus::Error(err.to_string()));
    }

    /// Fold the outcome of an exchange into the status.
    pub fn record<T>(&self, outcome: &Result<T, DaqError>) {
        match outcome {
            Ok(_) => self.record_success(),
            Err(err) => self.record_failure(err),
        }
    }
}

// =============================================================================
// Presentation tags
// =============================================================================

/// Whether a property is shown as a reading or as a control.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Read-only reading.
    Input,
    /// User-settable control.
    Output,
}

/// How a property value should be rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Free text.
    String,
    /// On/off.
    Binary,
    /// Number with units.
    Datapoint,
    /// Path to a file.
    Link,
}

// =============================================================================
// Property values
// =============================================================================

/// Dynamically typed property value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Binary value.
    Bool(bool),
    /// Numeric value.
    Float(f64),
    /// Text, also used for values typed in by a user.
    Text(String),
}

impl PropertyValue {
    /// Numeric view, parsing text when needed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(v) => Some(*v),
            PropertyValue::Text(text) => text.trim().parse().ok(),
            PropertyValue::Bool(_) => None,
        }
    }

    /// Boolean view. Accepts 0/1 and "true"/"false".
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            PropertyValue::Float(v) if *v == 0.0 => Some(false),
            PropertyValue::Float(v) if *v == 1.0 => Some(true),
            PropertyValue::Float(_) => None,
            PropertyValue::Text(text) => match text.trim() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Text(text) => write!(f, "{}", text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_measurement_starts_at_epoch() {
        let m = Measurement::new(0.0, "ms");
        assert_eq!(m.time.timestamp(), 0);
        assert_eq!(m.units, "ms");
    }

    #[test]
    fn test_stamp_never_regresses() {
        let mut m = Measurement::new(1.0, "");
        let future = Utc::now() + chrono::Duration::hours(1);
        m.time = future;
        m.stamp(2.0);
        assert_eq!(m.time, future);
        assert_eq!(m.value, 2.0);
    }

    #[test]
    fn test_status_transitions() {
        let cell = StatusCell::new("TEC", false);
        assert_eq!(cell.get(), InstrumentStatus::Disconnected);

        cell.record_failure(&DaqError::TransportTimeout {
            timeout: Duration::from_millis(200),
        });
        assert!(matches!(cell.get(), InstrumentStatus::Error(_)));

        cell.record_success();
        assert_eq!(cell.get(), InstrumentStatus::Connected);
    }

    #[test]
    fn test_simulated_success_reports_testing() {
        let cell = StatusCell::new("Thermocouple", true);
        cell.record_success();
        assert_eq!(cell.get(), InstrumentStatus::Testing);
        assert_eq!(cell.get().to_string(), "Testing");
    }

    #[test]
    fn test_property_value_coercion() {
        assert_eq!(PropertyValue::from("12.5").as_f64(), Some(12.5));
        assert_eq!(PropertyValue::Float(1.0).as_bool(), Some(true));
        assert_eq!(PropertyValue::from("false").as_bool(), Some(false));
        assert_eq!(PropertyValue::Float(0.5).as_bool(), None);
        assert_eq!(PropertyValue::Bool(true).as_f64(), None);
    }

    #[test]
    fn test_property_value_json_is_untagged() {
        let json = serde_json::to_string(&PropertyValue::Float(2.5)).unwrap();
        assert_eq!(json, "2.5");
        let back: PropertyValue = serde_json::from_str("true").unwrap();
        assert_eq!(back, PropertyValue::Bool(true));
    }
}
