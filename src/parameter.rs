//! Cached values and write domains.
//!
//! A [`Cached<T>`] holds the latest [`Measurement`] of one property inside a
//! `tokio::sync::watch` channel. Readers take a snapshot without waiting on
//! hardware. Writers replace value and timestamp in a single `send_modify`,
//! which also wakes subscribers.
//!
//! A [`Domain`] describes which values a property accepts on write. Values
//! outside the domain are rejected by returning `None` from
//! [`Domain::admit`]; the caller drops them silently.
//!
//! # Example
//!
//! ```rust,ignore
//! use rig_daq::core::PropertyValue;
//! use rig_daq::parameter::{Cached, Domain};
//!
//! let setpoint = Cached::new(0.0, "˚C");
//! if let Some(v) = Domain::range(0.0, 50.0).admit(&PropertyValue::Float(21.5)) {
//!     setpoint.update(v.as_f64().unwrap_or_default());
//! }
//! let snapshot = setpoint.get();
//! ```

use std::fmt::Debug;
use tokio::sync::watch;

use crate::core::{Measurement, PropertyValue};

// =============================================================================
// Cached<T>
// =============================================================================

/// The cached measurement of one property.
#[derive(Debug)]
pub struct Cached<T> {
    sender: watch::Sender<Measurement<T>>,
}

impl<T> Cached<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a never-refreshed cache entry.
    pub fn new(initial: T, units: impl Into<String>) -> Self {
        let (sender, _) = watch::channel(Measurement::new(initial, units));
        Self { sender }
    }

    /// Snapshot of the cached measurement.
    pub fn get(&self) -> Measurement<T> {
        self.sender.borrow().clone()
    }

    /// Store a new value. Value and time change together and time never
    /// moves backwards, even if two completions race.
    pub fn update(&self, value: T) {
        self.sender.send_modify(|m| m.stamp(value));
    }

    /// Subscribe to changes.
    pub fn subscribe(&self) -> watch::Receiver<Measurement<T>> {
        self.sender.subscribe()
    }
}

// =============================================================================
// Domain
// =============================================================================

/// Set of values a property accepts on write.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Domain {
    /// `true`/`false`, also accepting 0/1 and their text forms.
    Boolean,
    /// Numbers in `[min, max]`.
    Range { min: f64, max: f64 },
    /// Numbers in `(min, max)`.
    Exclusive { min: f64, max: f64 },
}

impl Domain {
    /// Inclusive numeric range.
    pub fn range(min: f64, max: f64) -> Self {
        Domain::Range { min, max }
    }

    /// Exclusive numeric range.
    pub fn exclusive(min: f64, max: f64) -> Self {
        Domain::Exclusive { min, max }
    }

    /// Coerce `value` into the domain, or `None` if it does not belong.
    pub fn admit(&self, value: &PropertyValue) -> Option<PropertyValue> {
        match self {
            Domain::Boolean => value.as_bool().map(PropertyValue::Bool),
            Domain::Range { min, max } => value
                .as_f64()
                .filter(|v| v >= min && v <= max)
                .map(PropertyValue::Float),
            Domain::Exclusive { min, max } => value
                .as_f64()
                .filter(|v| v > min && v < max)
                .map(PropertyValue::Float),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_notifies_subscribers() {
        let cached = Cached::new(0.0, "%");
        let mut rx = cached.subscribe();

        cached.update(42.0);

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().value, 42.0);
        assert_eq!(cached.get().value, 42.0);
    }

    #[test]
    fn test_time_only_advances() {
        let cached = Cached::new(false, "");
        let mut last = cached.get().time;
        for _ in 0..50 {
            cached.update(true);
            let m = cached.get();
            assert!(m.time >= last);
            assert!(m.value);
            last = m.time;
        }
    }

    #[test]
    fn test_range_is_inclusive() {
        let domain = Domain::range(0.0, 1.0);
        assert_eq!(domain.admit(&PropertyValue::Float(0.0)), Some(PropertyValue::Float(0.0)));
        assert_eq!(domain.admit(&PropertyValue::Float(1.0)), Some(PropertyValue::Float(1.0)));
        assert_eq!(domain.admit(&PropertyValue::Float(1.5)), None);
        assert_eq!(domain.admit(&f64::NAN.into()), None);
    }

    #[test]
    fn test_exclusive_rejects_bounds() {
        let domain = Domain::exclusive(32.0, 20_000.0);
        assert_eq!(domain.admit(&PropertyValue::Float(32.0)), None);
        assert_eq!(domain.admit(&PropertyValue::Float(10.0)), None);
        assert_eq!(domain.admit(&PropertyValue::Float(20_000.0)), None);
        assert_eq!(domain.admit(&PropertyValue::Float(33.0)), Some(PropertyValue::Float(33.0)));
    }

    #[test]
    fn test_text_is_coerced() {
        assert_eq!(
            Domain::range(0.0, 50.0).admit(&"21.5".into()),
            Some(PropertyValue::Float(21.5))
        );
        assert_eq!(
            Domain::Boolean.admit(&"true".into()),
            Some(PropertyValue::Bool(true))
        );
        assert_eq!(Domain::Boolean.admit(&"maybe".into()), None);
    }
}
