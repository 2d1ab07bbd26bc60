//! Instrument driver abstraction.
//!
//! Every instrument is a [`Device`] (its transport, cached values and status)
//! plus a static [`PropertyTable`] built once per instrument type. A table
//! entry maps a property name to:
//!
//! - a snapshot function returning the cached [`Reading`]
//! - an optional refresh exchange that re-fetches the value from hardware
//! - an optional write domain, local apply step and dispatch exchange
//!
//! [`Driver`] joins the two and implements the object-safe [`Instrument`]
//! trait used by the registry, the poll loop and the settings store.
//!
//! # Read and write semantics
//!
//! `read()` returns the cached value at once and starts a refresh in the
//! background. `write()` checks the value against the property's domain and
//! silently drops it (with a `debug!` line) when it does not fit. Accepted
//! values are applied locally first when the entry has an apply step, then
//! the dispatch exchange is spawned. Exchange outcomes only ever land in the
//! instrument status.
//!
//! Reads and writes of the same property are not serialized. A refresh that
//! was issued before a write may complete after it and overwrite the cache
//! with the pre-write value until the next refresh; completions are applied
//! in the order they finish. This race is accepted.

pub mod ozone;
pub mod tec;
pub mod thermocouple;
pub mod valves;

use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::{
    Direction, InstrumentStatus, Measurement, PropertyValue, Reading, StatusCell, ValueKind,
};
use crate::error::AppResult;
use crate::parameter::Domain;

/// State shared between a driver and the exchanges it spawns.
pub trait Device: Send + Sync + 'static {
    /// Health of the device.
    fn status(&self) -> &StatusCell;
}

type SnapshotFn<D> = Box<dyn Fn(&D) -> Reading + Send + Sync>;
type RefreshFn<D> = Box<dyn Fn(Arc<D>) -> BoxFuture<'static, AppResult<()>> + Send + Sync>;
type ApplyFn<D> = Box<dyn Fn(&D, &PropertyValue) + Send + Sync>;
type DispatchFn<D> =
    Box<dyn Fn(Arc<D>, PropertyValue) -> BoxFuture<'static, AppResult<()>> + Send + Sync>;

/// Static description of one property.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyInfo {
    /// Unique within the instrument.
    pub name: String,
    /// Reading or control.
    pub direction: Direction,
    /// How the value is rendered.
    pub kind: ValueKind,
    /// Whether writes can be accepted.
    pub writable: bool,
    /// Whether the value is saved between runs.
    pub persisted: bool,
}

/// One row of a property table.
pub struct PropertyEntry<D> {
    name: String,
    direction: Direction,
    kind: ValueKind,
    domain: Option<Domain>,
    persisted: bool,
    snapshot: SnapshotFn<D>,
    refresh: Option<RefreshFn<D>>,
    apply: Option<ApplyFn<D>>,
    dispatch: Option<DispatchFn<D>>,
}

impl<D: Device> PropertyEntry<D> {
    fn new<F>(name: impl Into<String>, direction: Direction, kind: ValueKind, snapshot: F) -> Self
    where
        F: Fn(&D) -> Reading + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            direction,
            kind,
            domain: None,
            persisted: false,
            snapshot: Box::new(snapshot),
            refresh: None,
            apply: None,
            dispatch: None,
        }
    }

    /// A reading shown to the user.
    pub fn input<F>(name: impl Into<String>, kind: ValueKind, snapshot: F) -> Self
    where
        F: Fn(&D) -> Reading + Send + Sync + 'static,
    {
        Self::new(name, Direction::Input, kind, snapshot)
    }

    /// A control shown to the user.
    pub fn output<F>(name: impl Into<String>, kind: ValueKind, snapshot: F) -> Self
    where
        F: Fn(&D) -> Reading + Send + Sync + 'static,
    {
        Self::new(name, Direction::Output, kind, snapshot)
    }

    /// Constant text such as an id or description.
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        let reading = Measurement::new(PropertyValue::Text(value.into()), "");
        Self::input(name, ValueKind::String, move |_| reading.clone())
    }

    /// The device status rendered as text.
    pub fn status() -> Self {
        Self::input("Status", ValueKind::String, |device: &D| {
            Measurement::new(PropertyValue::Text(device.status().get().to_string()), "")
        })
    }

    /// A link to the file the settings are saved in.
    pub fn link(name: impl Into<String>, target: impl Into<String>) -> Self {
        let reading = Measurement::new(PropertyValue::Text(target.into()), "");
        Self::output(name, ValueKind::Link, move |_| reading.clone())
    }

    /// Exchange run in the background on every read.
    pub fn refreshed_by<F, Fut>(mut self, refresh: F) -> Self
    where
        F: Fn(Arc<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        self.refresh = Some(Box::new(move |device| Box::pin(refresh(device))));
        self
    }

    /// Make the property writable with values from `domain`.
    pub fn accepts(mut self, domain: Domain) -> Self {
        self.domain = Some(domain);
        self
    }

    /// Local update applied as soon as a write is accepted.
    pub fn applied_by<F>(mut self, apply: F) -> Self
    where
        F: Fn(&D, &PropertyValue) + Send + Sync + 'static,
    {
        self.apply = Some(Box::new(apply));
        self
    }

    /// Exchange spawned for every accepted write.
    pub fn dispatched_by<F, Fut>(mut self, dispatch: F) -> Self
    where
        F: Fn(Arc<D>, PropertyValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        self.dispatch = Some(Box::new(move |device, value| Box::pin(dispatch(device, value))));
        self
    }

    /// Include the property in saved settings.
    pub fn persisted(mut self) -> Self {
        self.persisted = true;
        self
    }

    fn info(&self) -> PropertyInfo {
        PropertyInfo {
            name: self.name.clone(),
            direction: self.direction,
            kind: self.kind,
            writable: self.domain.is_some(),
            persisted: self.persisted,
        }
    }
}

/// Identity shown on every instrument.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Nameplate {
    /// Instrument id, shown as `ID`.
    pub id: String,
    /// Shown as `Description`.
    pub description: String,
    /// Shown as `Details`.
    pub details: String,
    /// Where saved settings live, if persistence is configured.
    pub settings_link: Option<String>,
}

impl Nameplate {
    /// A nameplate with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the details line.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    /// Set where the settings are saved.
    pub fn with_settings_link(mut self, link: Option<String>) -> Self {
        self.settings_link = link;
        self
    }
}

/// Property name to behaviour, in display order.
pub struct PropertyTable<D> {
    entries: Vec<PropertyEntry<D>>,
}

impl<D: Device> Default for PropertyTable<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Device> PropertyTable<D> {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// A table starting with `ID`, `Description`, `Details` and `Status`.
    pub fn with_nameplate(nameplate: &Nameplate) -> Self {
        let mut table = Self::new();
        table
            .push(PropertyEntry::text("ID", nameplate.id.as_str()))
            .push(PropertyEntry::text("Description", nameplate.description.as_str()))
            .push(PropertyEntry::text("Details", nameplate.details.as_str()))
            .push(PropertyEntry::status());
        table
    }

    /// Append the `Settings` link when persistence is configured.
    pub fn finish(mut self, nameplate: &Nameplate) -> Self {
        if let Some(link) = &nameplate.settings_link {
            self.push(PropertyEntry::link("Settings", link.as_str()));
        }
        self
    }

    /// Append an entry. Later entries with the same name are unreachable.
    pub fn push(&mut self, entry: PropertyEntry<D>) -> &mut Self {
        self.entries.push(entry);
        self
    }

    fn get(&self, name: &str) -> Option<&PropertyEntry<D>> {
        self.entries.iter().find(|e| e.name == name)
    }
}

// =============================================================================
// Instrument trait
// =============================================================================

/// Object-safe view of an instrument, as seen by the registry and poll loop.
///
/// None of these methods block on hardware or return exchange errors.
pub trait Instrument: Send + Sync {
    /// Instrument id, unique within its group.
    fn id(&self) -> &str;

    /// Latest status.
    fn status(&self) -> InstrumentStatus;

    /// How often the supervisory layer should poll this instrument.
    fn refresh_rate(&self) -> Duration;

    /// All properties in display order.
    fn describe(&self) -> Vec<PropertyInfo>;

    /// Cached value of `name`, triggering a background refresh.
    fn read(&self, name: &str) -> Option<Reading>;

    /// Cached value of `name` without touching hardware.
    fn snapshot(&self, name: &str) -> Option<Reading>;

    /// Validate and dispatch a write. Out-of-domain values are dropped.
    fn write(&self, name: &str, value: PropertyValue);

    /// Cached values of every persisted property.
    fn settings(&self) -> BTreeMap<String, PropertyValue> {
        self.describe()
            .into_iter()
            .filter(|p| p.persisted)
            .filter_map(|p| self.snapshot(&p.name).map(|r| (p.name, r.value)))
            .collect()
    }

    /// Write saved values back through the normal write path.
    fn restore(&self, settings: &BTreeMap<String, PropertyValue>) {
        for info in self.describe().into_iter().filter(|p| p.persisted) {
            if let Some(value) = settings.get(&info.name) {
                self.write(&info.name, value.clone());
            }
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

/// A device joined with its property table.
pub struct Driver<D> {
    id: String,
    device: Arc<D>,
    table: Arc<PropertyTable<D>>,
    refresh_rate: Duration,
}

impl<D> Clone for Driver<D> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            device: Arc::clone(&self.device),
            table: Arc::clone(&self.table),
            refresh_rate: self.refresh_rate,
        }
    }
}

impl<D: Device> Driver<D> {
    /// Join `device` with its table.
    pub fn new(
        id: impl Into<String>,
        device: Arc<D>,
        table: PropertyTable<D>,
        refresh_rate: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            device,
            table: Arc::new(table),
            refresh_rate,
        }
    }

    /// The underlying device.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Non-owning handle, for callbacks stored inside the device.
    pub fn downgrade(&self) -> WeakDriver<D> {
        WeakDriver {
            id: self.id.clone(),
            device: Arc::downgrade(&self.device),
            table: Arc::downgrade(&self.table),
            refresh_rate: self.refresh_rate,
        }
    }

    /// Run the refresh exchange of `name` to completion, folding the outcome
    /// into the status. Properties without a refresh succeed immediately.
    pub async fn refresh(&self, name: &str) -> AppResult<()> {
        let Some(refresh) = self.table.get(name).and_then(|e| e.refresh.as_ref()) else {
            return Ok(());
        };
        let outcome = refresh(Arc::clone(&self.device)).await;
        self.device.status().record(&outcome);
        outcome
    }

    /// Like [`Instrument::read`], also returning the spawned refresh.
    pub fn read_tracked(&self, name: &str) -> Option<(Reading, Option<JoinHandle<()>>)> {
        let entry = self.table.get(name)?;
        let reading = (entry.snapshot)(&self.device);
        let task = entry
            .refresh
            .as_ref()
            .and_then(|refresh| self.spawn(name, refresh(Arc::clone(&self.device))));
        Some((reading, task))
    }

    /// Like [`Instrument::write`], returning `None` when the write was
    /// dropped and otherwise the spawned dispatch, if any.
    pub fn write_tracked(
        &self,
        name: &str,
        value: PropertyValue,
    ) -> Option<Option<JoinHandle<()>>> {
        let Some(entry) = self.table.get(name) else {
            debug!("[{}] dropping write to unknown property '{}'", self.id, name);
            return None;
        };
        let Some(domain) = entry.domain else {
            debug!("[{}] dropping write to read-only '{}'", self.id, name);
            return None;
        };
        let Some(value) = domain.admit(&value) else {
            debug!("[{}] dropping out-of-domain write {} = {}", self.id, name, value);
            return None;
        };
        if let Some(apply) = &entry.apply {
            apply(&self.device, &value);
        }
        Some(
            entry
                .dispatch
                .as_ref()
                .and_then(|dispatch| self.spawn(name, dispatch(Arc::clone(&self.device), value))),
        )
    }

    fn spawn(
        &self,
        name: &str,
        exchange: BoxFuture<'static, AppResult<()>>,
    ) -> Option<JoinHandle<()>> {
        let Ok(handle) = Handle::try_current() else {
            debug!("[{}] no runtime, skipping exchange for '{}'", self.id, name);
            return None;
        };
        let device = Arc::clone(&self.device);
        Some(handle.spawn(async move {
            let outcome = exchange.await;
            device.status().record(&outcome);
        }))
    }
}

impl<D: Device> Instrument for Driver<D> {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> InstrumentStatus {
        self.device.status().get()
    }

    fn refresh_rate(&self) -> Duration {
        self.refresh_rate
    }

    fn describe(&self) -> Vec<PropertyInfo> {
        self.table.entries.iter().map(PropertyEntry::info).collect()
    }

    fn read(&self, name: &str) -> Option<Reading> {
        self.read_tracked(name).map(|(reading, _)| reading)
    }

    fn snapshot(&self, name: &str) -> Option<Reading> {
        self.table.get(name).map(|entry| (entry.snapshot)(&self.device))
    }

    fn write(&self, name: &str, value: PropertyValue) {
        self.write_tracked(name, value);
    }
}

/// Weak counterpart of [`Driver`].
pub struct WeakDriver<D> {
    id: String,
    device: Weak<D>,
    table: Weak<PropertyTable<D>>,
    refresh_rate: Duration,
}

impl<D> Clone for WeakDriver<D> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            device: Weak::clone(&self.device),
            table: Weak::clone(&self.table),
            refresh_rate: self.refresh_rate,
        }
    }
}

impl<D: Device> WeakDriver<D> {
    /// The driver, if it is still alive.
    pub fn upgrade(&self) -> Option<Driver<D>> {
        Some(Driver {
            id: self.id.clone(),
            device: self.device.upgrade()?,
            table: self.table.upgrade()?,
            refresh_rate: self.refresh_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaqError;
    use crate::parameter::Cached;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    struct Dial {
        status: StatusCell,
        level: Cached<f64>,
        fail: Mutex<bool>,
        sent: Mutex<Vec<f64>>,
    }

    impl Device for Dial {
        fn status(&self) -> &StatusCell {
            &self.status
        }
    }

    impl Dial {
        async fn fetch(&self) -> AppResult<()> {
            if *self.fail.lock() {
                return Err(DaqError::TransportTimeout {
                    timeout: Duration::from_millis(200),
                });
            }
            self.level.update(7.0);
            Ok(())
        }

        async fn send(&self, value: PropertyValue) -> AppResult<()> {
            if *self.fail.lock() {
                return Err(DaqError::Transport("port closed".to_string()));
            }
            self.sent.lock().push(value.as_f64().unwrap_or_default());
            Ok(())
        }
    }

    fn driver() -> Driver<Dial> {
        let device = Arc::new(Dial {
            status: StatusCell::new("dial", false),
            level: Cached::new(0.0, "%"),
            fail: Mutex::new(false),
            sent: Mutex::new(Vec::new()),
        });
        let mut table = PropertyTable::new();
        table
            .push(PropertyEntry::status())
            .push(PropertyEntry::text("ID", "dial"))
            .push(
                PropertyEntry::output("Level", ValueKind::Datapoint, |d: &Dial| {
                    d.level.get().map(PropertyValue::Float)
                })
                .refreshed_by(|d: Arc<Dial>| async move { d.fetch().await })
                .accepts(Domain::range(0.0, 100.0))
                .applied_by(|d: &Dial, v: &PropertyValue| {
                    if let Some(v) = v.as_f64() {
                        d.level.update(v);
                    }
                })
                .dispatched_by(|d: Arc<Dial>, v| async move { d.send(v).await })
                .persisted(),
            );
        Driver::new("dial", device, table, Duration::from_millis(300))
    }

    #[tokio::test]
    async fn test_read_returns_cache_then_refreshes() {
        let driver = driver();

        let (reading, task) = driver.read_tracked("Level").unwrap();
        assert_eq!(reading.value, PropertyValue::Float(0.0));

        task.unwrap().await.unwrap();
        assert_eq!(driver.snapshot("Level").unwrap().value, PropertyValue::Float(7.0));
        assert_eq!(driver.status(), InstrumentStatus::Connected);
    }

    #[tokio::test]
    async fn test_refresh_failure_only_changes_status() {
        let driver = driver();
        *driver.device().fail.lock() = true;

        let (reading, task) = driver.read_tracked("Level").unwrap();
        task.unwrap().await.unwrap();

        assert_eq!(reading.value, PropertyValue::Float(0.0));
        assert!(matches!(driver.status(), InstrumentStatus::Error(_)));
        assert_eq!(
            driver.read("Status").unwrap().value,
            PropertyValue::Text("Transport timeout after 200ms".to_string())
        );
    }

    #[tokio::test]
    async fn test_write_applies_then_dispatches() {
        let driver = driver();

        let task = driver.write_tracked("Level", "42".into()).unwrap().unwrap();
        assert_eq!(driver.snapshot("Level").unwrap().value, PropertyValue::Float(42.0));

        task.await.unwrap();
        assert_eq!(*driver.device().sent.lock(), vec![42.0]);
        assert_eq!(driver.status(), InstrumentStatus::Connected);
    }

    #[tokio::test]
    async fn test_write_failure_lands_in_status() {
        let driver = driver();
        *driver.device().fail.lock() = true;

        let task = driver.write_tracked("Level", PropertyValue::Float(10.0)).unwrap().unwrap();
        task.await.unwrap();

        assert_eq!(
            driver.status(),
            InstrumentStatus::Error("Transport failure: port closed".to_string())
        );
    }

    // Out-of-domain writes are dropped without any error reaching the caller.
    // This is a deliberate fail-open policy, kept under test as-is.
    #[traced_test]
    #[tokio::test]
    async fn test_out_of_domain_write_is_silently_dropped() {
        let driver = driver();
        let before = driver.snapshot("Level").unwrap();

        assert!(driver.write_tracked("Level", PropertyValue::Float(150.0)).is_none());
        driver.write("Level", "loud".into());

        assert_eq!(driver.snapshot("Level").unwrap(), before);
        assert!(driver.device().sent.lock().is_empty());
        assert_eq!(driver.status(), InstrumentStatus::Disconnected);
        assert!(logs_contain("dropping out-of-domain write"));
    }

    #[tokio::test]
    async fn test_read_only_and_unknown_writes_dropped() {
        let driver = driver();
        assert!(driver.write_tracked("ID", "other".into()).is_none());
        assert!(driver.write_tracked("Nope", PropertyValue::Float(1.0)).is_none());
        assert_eq!(driver.read("ID").unwrap().value, PropertyValue::Text("dial".into()));
        assert!(driver.read("Nope").is_none());
    }

    #[tokio::test]
    async fn test_settings_round_trip_through_write_path() {
        let driver = driver();
        driver.write("Level", PropertyValue::Float(55.0));

        let saved = driver.settings();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved["Level"], PropertyValue::Float(55.0));

        let other = self::driver();
        other.restore(&saved);
        assert_eq!(other.snapshot("Level").unwrap().value, PropertyValue::Float(55.0));
    }

    #[test]
    fn test_describe_lists_table_in_order() {
        let driver = driver();
        let names: Vec<String> = driver.describe().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["Status", "ID", "Level"]);
        let level = &driver.describe()[2];
        assert!(level.writable);
        assert!(level.persisted);
        assert_eq!(level.direction, Direction::Output);
    }

    #[test]
    fn test_weak_driver_expires() {
        let driver = driver();
        let weak = driver.downgrade();
        assert!(weak.upgrade().is_some());
        drop(driver);
        assert!(weak.upgrade().is_none());
    }
}
