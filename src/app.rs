//! Composition root: builds every instrument from the settings, owns the
//! registry and the settings store, and runs the poll loop.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::adapters::{MockTransport, SerialTransport, Transport};
use crate::config::{SerialSettings, Settings};
use crate::error::AppResult;
use crate::error_recovery::{retry, RetryPolicy};
use crate::instrument::thermocouple::{SimulatedInput, TemperatureInput, UnavailableInput};
use crate::instrument::{ozone, tec, thermocouple, valves, Instrument, Nameplate};
use crate::persistence::SettingsStore;
use crate::protocol::relay::ModuleAddress;
use crate::registry::{group, InstrumentRegistry};

/// The running rig.
pub struct App {
    registry: InstrumentRegistry,
    store: Option<SettingsStore>,
    simulate: bool,
    retry: RetryPolicy,
}

impl App {
    /// Open every transport, build every instrument and restore saved
    /// settings. Instruments whose port cannot be opened are still
    /// registered; their status reports the failure.
    pub async fn build(settings: &Settings) -> AppResult<Self> {
        let mut app = Self {
            registry: InstrumentRegistry::new(),
            store: settings.persistence.dir.clone().map(SettingsStore::new),
            simulate: settings.application.simulate,
            retry: RetryPolicy::default(),
        };
        if app.simulate {
            info!("simulation mode: no serial ports will be opened");
        }

        for t in &settings.tec {
            let serial = t.serial();
            let timeout = serial.timeout();
            let transport = app
                .transport(format!("TEC {}", t.id), serial, || tec::simulator(&t.id))
                .await;
            let nameplate = app.nameplate(group::TEC, &t.id, &t.description, &t.details);
            let driver = tec::driver(
                &nameplate,
                transport,
                timeout,
                app.simulate,
                millis(t.refresh_ms),
            );
            app.register(group::TEC, Arc::new(driver))?;
        }

        for o in &settings.ozone {
            let serial = o.serial();
            let timeout = serial.timeout();
            let transport = app
                .transport(format!("Ozone {}", o.id), serial, || ozone::simulator(&o.id))
                .await;
            let nameplate = app.nameplate(group::OZONE, &o.id, &o.description, &o.details);
            let driver = ozone::driver(
                &nameplate,
                transport,
                timeout,
                app.simulate,
                millis(o.refresh_ms),
            );
            app.register(group::OZONE, Arc::new(driver))?;
        }

        if let Some(bus) = &settings.valves {
            let addresses = bus
                .modules
                .iter()
                .map(|m| ModuleAddress::parse(&m.address))
                .collect::<AppResult<Vec<_>>>()?;
            let serial = bus.serial();
            let timeout = serial.timeout();
            let transport = app
                .transport("Valves".to_string(), serial, || {
                    let modules: Vec<(ModuleAddress, &str)> = bus
                        .modules
                        .iter()
                        .zip(&addresses)
                        .map(|(m, a)| (a.clone(), simulated_model(m.channels)))
                        .collect();
                    valves::simulator("Valves", &modules)
                })
                .await;
            for (module, address) in bus.modules.iter().zip(addresses) {
                let channels = valves::discover_channels(
                    transport.as_ref(),
                    &address,
                    module.channels,
                    timeout,
                )
                .await;
                let nameplate = app.nameplate(
                    group::VALVES,
                    &module.id,
                    &module.description,
                    &module.details,
                );
                let driver = valves::driver(
                    &nameplate,
                    address,
                    channels,
                    Arc::clone(&transport),
                    timeout,
                    app.simulate,
                    millis(bus.refresh_ms),
                );
                app.register(group::VALVES, Arc::new(driver))?;
            }
        }

        for t in &settings.thermocouples {
            let input: Arc<dyn TemperatureInput> = if app.simulate {
                Arc::new(SimulatedInput)
            } else {
                Arc::new(UnavailableInput {
                    unique_id: t.unique_id.clone(),
                })
            };
            let nameplate = app.nameplate(group::THERMOCOUPLE, &t.id, &t.description, "");
            let driver = thermocouple::driver(
                &nameplate,
                t.channel,
                input,
                app.simulate,
                millis(t.refresh_ms),
            );
            app.register(group::THERMOCOUPLE, Arc::new(driver))?;
        }

        info!("{} instruments ready", app.registry.len());
        Ok(app)
    }

    /// Every built instrument, by group.
    pub fn registry(&self) -> &InstrumentRegistry {
        &self.registry
    }

    async fn transport<F>(
        &self,
        name: String,
        serial: SerialSettings,
        simulator: F,
    ) -> Arc<dyn Transport>
    where
        F: FnOnce() -> MockTransport,
    {
        let transport: Arc<dyn Transport> = if self.simulate {
            Arc::new(simulator())
        } else {
            Arc::new(SerialTransport::new(name.clone(), serial))
        };
        let opened = retry(&format!("open {}", name), &self.retry, || transport.open()).await;
        if let Err(err) = opened {
            error!("{}", err);
        }
        transport
    }

    fn nameplate(&self, group: &str, id: &str, description: &str, details: &str) -> Nameplate {
        Nameplate::new(id)
            .with_description(description)
            .with_details(details)
            .with_settings_link(
                self.store
                    .as_ref()
                    .map(|store| store.path(group, id).display().to_string()),
            )
    }

    fn register(&mut self, group: &str, instrument: Arc<dyn Instrument>) -> AppResult<()> {
        if let Some(store) = &self.store {
            match store.load(group, instrument.id()) {
                Ok(Some(saved)) => {
                    info!("restoring {} settings for {}/{}", saved.len(), group, instrument.id());
                    instrument.restore(&saved);
                }
                Ok(None) => {}
                Err(err) => warn!(
                    "ignoring saved settings for {}/{}: {}",
                    group,
                    instrument.id(),
                    err
                ),
            }
        }
        self.registry.register(group, instrument)
    }

    /// Save the persisted properties of every instrument. Returns how many
    /// files were written.
    pub fn save_settings(&self) -> AppResult<usize> {
        let Some(store) = &self.store else {
            debug!("no persistence directory configured");
            return Ok(0);
        };
        let mut written = 0;
        for (group, instrument) in self.registry.iter() {
            let settings = instrument.settings();
            if settings.is_empty() {
                continue;
            }
            store.save(group, instrument.id(), &settings)?;
            written += 1;
        }
        Ok(written)
    }

    /// Read every property of every instrument once.
    pub fn poll_all(&self) {
        for (group, instrument) in self.registry.iter() {
            poll(group, instrument.as_ref());
        }
    }

    /// Poll each instrument at its refresh rate until `shutdown` resolves or
    /// `cycles` ticks have passed.
    pub async fn run<S>(&self, cycles: Option<u64>, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let tick = self
            .registry
            .iter()
            .map(|(_, instrument)| instrument.refresh_rate())
            .min()
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_millis(10));
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_poll: HashMap<(String, String), Instant> = HashMap::new();
        let mut count = 0u64;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    for (group, instrument) in self.registry.iter() {
                        let key = (group.to_string(), instrument.id().to_string());
                        let due = last_poll.get(&key).map_or(true, |last| {
                            now.duration_since(*last) >= instrument.refresh_rate()
                        });
                        if due {
                            poll(group, instrument.as_ref());
                            last_poll.insert(key, now);
                        }
                    }
                    count += 1;
                    if cycles.is_some_and(|n| count >= n) {
                        info!("finished {} poll cycles", count);
                        break;
                    }
                }
            }
        }
    }
}

fn poll(group: &str, instrument: &dyn Instrument) {
    for info in instrument.describe() {
        if let Some(reading) = instrument.read(&info.name) {
            debug!(
                "{}/{} {} = {} {}",
                group,
                instrument.id(),
                info.name,
                reading.value,
                reading.units
            );
        }
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

fn simulated_model(channels: Option<usize>) -> &'static str {
    match channels {
        Some(4) => "4060",
        Some(12) => "4056",
        _ => "4068",
    }
}
