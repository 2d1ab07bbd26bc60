//! Ozone generator driver (microcontroller, tagged protocol).
//!
//! | Name         | Kind       | Read   | Write              |
//! |--------------|------------|--------|--------------------|
//! | `Intensity`  | %          | `<q>`  |                    |
//! | `Period`     | s, 0..=100 | `<gp>` | `<p:V>`            |
//! | `Duty`       | %, 0..=100 | `<gd>` | `<d:V>`            |
//! | `PWM Enable` | binary     | `<gS>` | `<on:0>`/`<off:0>` |
//!
//! Set commands wait a short, bounded time for a reply that usually never
//! comes. Every control has a readback, so writes do not touch the cache.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use super::{Device, Driver, Nameplate, PropertyEntry, PropertyTable};
use crate::adapters::{MockTransport, Transport};
use crate::core::{PropertyValue, StatusCell, ValueKind};
use crate::error::{AppResult, DecodeError};
use crate::parameter::{Cached, Domain};
use crate::protocol::tagged::{parse_flag, parse_number, TaggedCommand};

/// Default reply timeout for readbacks.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);
const SET_TIMEOUT: Duration = Duration::from_millis(50);

/// Microcontroller driving the ozone lamp.
pub struct OzoneGenerator {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    status: StatusCell,
    intensity: Cached<f64>,
    period: Cached<f64>,
    duty: Cached<f64>,
    pwm_enabled: Cached<bool>,
}

impl Device for OzoneGenerator {
    fn status(&self) -> &StatusCell {
        &self.status
    }
}

impl OzoneGenerator {
    /// A generator on `transport`; readbacks wait up to `timeout`.
    pub fn new(
        id: &str,
        transport: Arc<dyn Transport>,
        timeout: Duration,
        simulated: bool,
    ) -> Self {
        Self {
            transport,
            timeout,
            status: StatusCell::new(format!("Ozone {}", id), simulated),
            intensity: Cached::new(0.0, "%"),
            period: Cached::new(0.0, "s"),
            duty: Cached::new(0.0, "%"),
            pwm_enabled: Cached::new(false, ""),
        }
    }

    async fn get(&self, command: &str, tag: &str) -> AppResult<String> {
        TaggedCommand::get(command, tag)
            .exchange(self.transport.as_ref(), self.timeout)
            .await?
            .ok_or_else(|| DecodeError::new("empty reply", "").into())
    }

    async fn fetch_number(&self, command: &str, tag: &str, cache: &Cached<f64>) -> AppResult<()> {
        let reply = self.get(command, tag).await?;
        cache.update(parse_number(&reply, tag)?);
        Ok(())
    }

    /// Read the lamp intensity.
    pub async fn refresh_intensity(&self) -> AppResult<()> {
        self.fetch_number("<q>\r", "data", &self.intensity).await
    }

    /// Read the PWM period in seconds.
    pub async fn refresh_period(&self) -> AppResult<()> {
        self.fetch_number("<gp>", "gp", &self.period).await
    }

    /// Read the PWM duty in percent.
    pub async fn refresh_duty(&self) -> AppResult<()> {
        self.fetch_number("<gd>", "gd", &self.duty).await
    }

    /// Read whether the lamp PWM runs.
    pub async fn refresh_pwm_enabled(&self) -> AppResult<()> {
        let reply = self.get("<gS>", "gS").await?;
        self.pwm_enabled.update(parse_flag(&reply, "gS")?);
        Ok(())
    }

    /// Set the PWM period in seconds.
    pub async fn set_period(&self, seconds: f64) -> AppResult<()> {
        TaggedCommand::set("p", seconds)
            .exchange(self.transport.as_ref(), SET_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Set the PWM duty in percent.
    pub async fn set_duty(&self, percent: f64) -> AppResult<()> {
        TaggedCommand::set("d", percent)
            .exchange(self.transport.as_ref(), SET_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Start or stop the lamp PWM.
    pub async fn set_pwm_enabled(&self, on: bool) -> AppResult<()> {
        TaggedCommand::toggle(on)
            .exchange(self.transport.as_ref(), SET_TIMEOUT)
            .await
            .map(|_| ())
    }
}

/// Build a driver for one ozone generator.
pub fn driver(
    nameplate: &Nameplate,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    simulated: bool,
    refresh_rate: Duration,
) -> Driver<OzoneGenerator> {
    let device = Arc::new(OzoneGenerator::new(&nameplate.id, transport, timeout, simulated));
    let mut table = PropertyTable::with_nameplate(nameplate);
    table
        .push(
            PropertyEntry::input("Intensity", ValueKind::Datapoint, |d: &OzoneGenerator| {
                d.intensity.get().map(PropertyValue::Float)
            })
            .refreshed_by(|d: Arc<OzoneGenerator>| async move { d.refresh_intensity().await }),
        )
        .push(
            PropertyEntry::output("Period", ValueKind::Datapoint, |d: &OzoneGenerator| {
                d.period.get().map(PropertyValue::Float)
            })
            .refreshed_by(|d: Arc<OzoneGenerator>| async move { d.refresh_period().await })
            .accepts(Domain::range(0.0, 100.0))
            .dispatched_by(|d: Arc<OzoneGenerator>, v: PropertyValue| async move {
                d.set_period(v.as_f64().unwrap_or_default()).await
            })
            .persisted(),
        )
        .push(
            PropertyEntry::output("Duty", ValueKind::Datapoint, |d: &OzoneGenerator| {
                d.duty.get().map(PropertyValue::Float)
            })
            .refreshed_by(|d: Arc<OzoneGenerator>| async move { d.refresh_duty().await })
            .accepts(Domain::range(0.0, 100.0))
            .dispatched_by(|d: Arc<OzoneGenerator>, v: PropertyValue| async move {
                d.set_duty(v.as_f64().unwrap_or_default()).await
            })
            .persisted(),
        )
        .push(
            PropertyEntry::output("PWM Enable", ValueKind::Binary, |d: &OzoneGenerator| {
                d.pwm_enabled.get().map(PropertyValue::Bool)
            })
            .refreshed_by(|d: Arc<OzoneGenerator>| async move { d.refresh_pwm_enabled().await })
            .accepts(Domain::Boolean)
            .dispatched_by(|d: Arc<OzoneGenerator>, v: PropertyValue| async move {
                d.set_pwm_enabled(v.as_bool().unwrap_or(false)).await
            })
            .persisted(),
        );
    Driver::new(nameplate.id.as_str(), device, table.finish(nameplate), refresh_rate)
}

// =============================================================================
// Simulator
// =============================================================================

struct SimulatedLamp {
    period: f64,
    duty: f64,
    on: bool,
}

impl SimulatedLamp {
    fn answer(&mut self, command: &str) -> Option<String> {
        let command = command.trim_end_matches('\r');
        match command {
            "<q>" => {
                let level = if self.on { self.duty } else { 0.0 };
                let noise = rand::thread_rng().gen_range(-0.5..0.5);
                Some(format!("<data:{:.1}>", (level + noise).max(0.0)))
            }
            "<gp>" => Some(format!("<gp:{}>", self.period)),
            "<gd>" => Some(format!("<gd:{}>", self.duty)),
            "<gS>" => Some(format!("<gS:{}>", u8::from(self.on))),
            "<on:0>" => {
                self.on = true;
                None
            }
            "<off:0>" => {
                self.on = false;
                None
            }
            _ => {
                let (key, value) = command
                    .strip_prefix('<')?
                    .strip_suffix('>')?
                    .split_once(':')?;
                let value: f64 = value.parse().ok()?;
                match key {
                    "p" => self.period = value,
                    "d" => self.duty = value,
                    _ => {}
                }
                None
            }
        }
    }
}

/// A transport that answers like the lamp controller.
pub fn simulator(id: &str) -> MockTransport {
    let state = Mutex::new(SimulatedLamp {
        period: 10.0,
        duty: 50.0,
        on: false,
    });
    MockTransport::new(format!("Ozone {} (simulated)", id))
        .with_latency(Duration::from_millis(5))
        .with_responder(move |command| state.lock().answer(command))
}
