//! Thermocouple DAQ channels.
//!
//! The acquisition board is reached through a vendor binding that is not part
//! of this crate; [`TemperatureInput`] is the seam it plugs into.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use super::{Device, Driver, Nameplate, PropertyEntry, PropertyTable};
use crate::core::{PropertyValue, StatusCell, ValueKind};
use crate::error::{AppResult, DaqError};
use crate::parameter::Cached;

/// Source of thermocouple readings in ˚C.
#[async_trait]
pub trait TemperatureInput: Send + Sync {
    /// Sample one channel.
    async fn read_celsius(&self, channel: u8) -> AppResult<f64>;
}

/// Synthesized readings between 0 and 10 ˚C.
pub struct SimulatedInput;

#[async_trait]
impl TemperatureInput for SimulatedInput {
    async fn read_celsius(&self, _channel: u8) -> AppResult<f64> {
        Ok(rand::thread_rng().gen::<f64>() * 10.0)
    }
}

/// Stand-in for a board that was not found at start-up.
pub struct UnavailableInput {
    /// Serial number of the missing board.
    pub unique_id: Option<String>,
}

#[async_trait]
impl TemperatureInput for UnavailableInput {
    async fn read_celsius(&self, channel: u8) -> AppResult<f64> {
        Err(DaqError::Transport(format!(
            "thermocouple board {} (channel {}) not available",
            self.unique_id.as_deref().unwrap_or("<unknown>"),
            channel
        )))
    }
}

/// One thermocouple channel.
pub struct Thermocouple {
    channel: u8,
    input: Arc<dyn TemperatureInput>,
    status: StatusCell,
    temperature: Cached<f64>,
}

impl Device for Thermocouple {
    fn status(&self) -> &StatusCell {
        &self.status
    }
}

impl Thermocouple {
    /// A channel read through `input`.
    pub fn new(id: &str, channel: u8, input: Arc<dyn TemperatureInput>, simulated: bool) -> Self {
        Self {
            channel,
            input,
            status: StatusCell::new(format!("Thermocouple {}", id), simulated),
            temperature: Cached::new(0.0, "˚C"),
        }
    }

    /// Sample the channel.
    pub async fn refresh_temperature(&self) -> AppResult<()> {
        let celsius = self.input.read_celsius(self.channel).await?;
        self.temperature.update(celsius);
        Ok(())
    }
}

/// Build a driver for one channel.
pub fn driver(
    nameplate: &Nameplate,
    channel: u8,
    input: Arc<dyn TemperatureInput>,
    simulated: bool,
    refresh_rate: Duration,
) -> Driver<Thermocouple> {
    let device = Arc::new(Thermocouple::new(&nameplate.id, channel, input, simulated));
    let mut table = PropertyTable::with_nameplate(nameplate);
    table.push(
        PropertyEntry::input("Temperature", ValueKind::Datapoint, |d: &Thermocouple| {
            d.temperature.get().map(PropertyValue::Float)
        })
        .refreshed_by(|d: Arc<Thermocouple>| async move { d.refresh_temperature().await }),
    );
    Driver::new(nameplate.id.as_str(), device, table.finish(nameplate), refresh_rate)
}
