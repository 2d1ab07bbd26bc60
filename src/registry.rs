//! Instruments grouped by kind, owned by the composition root.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::Reading;
use crate::error::{AppResult, DaqError};
use crate::instrument::Instrument;

/// Group ids used by the rig.
pub mod group {
    /// Thermoelectric controllers.
    pub const TEC: &str = "TEC";
    /// Ozone generators.
    pub const OZONE: &str = "OzoneControl";
    /// Relay modules.
    pub const VALVES: &str = "Valves";
    /// Thermocouple channels.
    pub const THERMOCOUPLE: &str = "Thermocouple";
}

/// Group id to instrument id to instrument.
#[derive(Default)]
pub struct InstrumentRegistry {
    groups: BTreeMap<String, BTreeMap<String, Arc<dyn Instrument>>>,
}

impl InstrumentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instrument under `group`. Ids must be unique within a group.
    pub fn register(&mut self, group: &str, instrument: Arc<dyn Instrument>) -> AppResult<()> {
        let members = self.groups.entry(group.to_string()).or_default();
        let id = instrument.id().to_string();
        if members.contains_key(&id) {
            return Err(DaqError::Configuration(format!(
                "{}: instrument '{}' registered twice",
                group, id
            )));
        }
        members.insert(id, instrument);
        Ok(())
    }

    /// One instrument.
    pub fn get(&self, group: &str, id: &str) -> Option<&Arc<dyn Instrument>> {
        self.groups.get(group)?.get(id)
    }

    /// Group ids in sorted order.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Every instrument with its group.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Instrument>)> {
        self.groups.iter().flat_map(|(group, members)| {
            members.values().map(move |instrument| (group.as_str(), instrument))
        })
    }

    /// Number of instruments across all groups.
    pub fn len(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached value of one field, for samplers that poll at their own rate.
    /// Never touches hardware.
    pub fn snapshot(&self, group: &str, id: &str, field: &str) -> Option<Reading> {
        self.get(group, id)?.snapshot(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;
    use crate::core::PropertyValue;
    use crate::instrument::{ozone, Nameplate};
    use std::time::Duration;

    fn lamp(id: &str) -> Arc<dyn Instrument> {
        Arc::new(ozone::driver(
            &Nameplate::new(id),
            Arc::new(MockTransport::new(id)),
            ozone::DEFAULT_TIMEOUT,
            false,
            Duration::from_millis(300),
        ))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = InstrumentRegistry::new();
        registry.register(group::OZONE, lamp("A")).unwrap();
        registry.register(group::OZONE, lamp("B")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.groups().collect::<Vec<_>>(), vec!["OzoneControl"]);
        assert_eq!(registry.get(group::OZONE, "B").unwrap().id(), "B");
        assert!(registry.get(group::TEC, "B").is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut registry = InstrumentRegistry::new();
        registry.register(group::OZONE, lamp("A")).unwrap();
        assert!(registry.register(group::OZONE, lamp("A")).is_err());
        assert!(registry.register(group::TEC, lamp("A")).is_ok());
    }

    #[test]
    fn test_snapshot_reads_cache_only() {
        let mut registry = InstrumentRegistry::new();
        registry.register(group::OZONE, lamp("A")).unwrap();

        let reading = registry.snapshot(group::OZONE, "A", "ID").unwrap();
        assert_eq!(reading.value, PropertyValue::Text("A".to_string()));
        assert!(registry.snapshot(group::OZONE, "A", "Missing").is_none());
        assert!(registry.snapshot(group::VALVES, "A", "ID").is_none());
    }
}
