//! Relay-module valve banks.
//!
//! Each module on the shared bus is its own instrument. Channel `i` of a
//! module is the binary output `VS{i}` and owns one [`PwmChannel`], exposed
//! as `VS{i} Interval`, `VS{i} Duty` and `VS{i} PWM Mode`. The PWM channel
//! drives its valve through the same write path as any other caller.
//!
//! The module reports no readback on a channel write, so valve writes update
//! the cache as soon as they are accepted.
//!
//! Every `VS{i}` refreshes from the same `$AA6` mask. While one mask read is
//! in flight, further refreshes of the module return at once instead of
//! queueing on the shared bus.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Device, Driver, Instrument, Nameplate, PropertyEntry, PropertyTable, WeakDriver};
use crate::adapters::{MockTransport, Transport};
use crate::core::{Measurement, PropertyValue, StatusCell, ValueKind};
use crate::error::{AppResult, DecodeError};
use crate::parameter::{Cached, Domain};
use crate::protocol::relay::{
    channels_for_model, check_set_ack, decode_module_name, decode_outputs, encode_outputs,
    read_module_name, read_outputs, set_channel, ModuleAddress, MAX_CHANNELS, SET_ACK,
};
use crate::pwm::{BinaryOutput, PwmChannel, MAX_INTERVAL_MS, MIN_INTERVAL_MS};

/// Default reply timeout on the relay bus.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(300);

struct ValveChannel {
    state: Cached<bool>,
    pwm: PwmChannel,
}

/// One relay module and its channels.
pub struct ValveBank {
    address: ModuleAddress,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    status: StatusCell,
    channels: Vec<ValveChannel>,
    mask_read: AtomicBool,
}

/// Clears the in-flight flag when the mask read ends or is cancelled.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Device for ValveBank {
    fn status(&self) -> &StatusCell {
        &self.status
    }
}

impl ValveBank {
    /// A module at `address` with up to sixteen channels, all closed.
    pub fn new(
        id: &str,
        address: ModuleAddress,
        channels: usize,
        transport: Arc<dyn Transport>,
        timeout: Duration,
        simulated: bool,
    ) -> Self {
        let channels = (0..channels.min(MAX_CHANNELS))
            .map(|i| ValveChannel {
                state: Cached::new(false, ""),
                pwm: PwmChannel::new(format!("{} VS{}", id, i), ((i + 2) * 1000) as f64, 0.0),
            })
            .collect();
        Self {
            address,
            transport,
            timeout,
            status: StatusCell::new(format!("Valves {}", id), simulated),
            channels,
            mask_read: AtomicBool::new(false),
        }
    }

    /// Number of channels on the module.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Read every channel state in one exchange. Returns immediately when a
    /// read of this module is already running.
    pub async fn refresh_outputs(&self) -> AppResult<()> {
        if self.mask_read.swap(true, Ordering::AcqRel) {
            debug!("relay module {} mask read already in flight", self.address);
            return Ok(());
        }
        let _in_flight = InFlight(&self.mask_read);
        let command = read_outputs(&self.address);
        let lines = self.transport.send(command.as_bytes(), true, self.timeout).await?;
        let reply = lines
            .first()
            .ok_or_else(|| DecodeError::new("empty reply", ""))?;
        let states = decode_outputs(reply, self.channels.len())?;
        for (channel, on) in self.channels.iter().zip(states) {
            channel.state.update(on);
        }
        Ok(())
    }

    /// Drive one channel and wait for the module's acknowledgement.
    pub async fn set_valve(&self, channel: usize, on: bool) -> AppResult<()> {
        let command = set_channel(&self.address, channel, on)?;
        let lines = self.transport.send(command.as_bytes(), true, self.timeout).await?;
        let reply = lines
            .first()
            .ok_or_else(|| DecodeError::new("empty reply", ""))?;
        check_set_ack(reply)?;
        Ok(())
    }
}

/// Ask a module for its model and derive the channel count. Falls back to
/// `fallback`, then to zero channels, when the module cannot tell.
pub async fn discover_channels(
    transport: &dyn Transport,
    address: &ModuleAddress,
    fallback: Option<usize>,
    timeout: Duration,
) -> usize {
    let command = read_module_name(address);
    let discovered = match transport.send(command.as_bytes(), true, timeout).await {
        Ok(lines) => lines
            .first()
            .and_then(|reply| decode_module_name(reply, address).ok())
            .and_then(|model| {
                let count = channels_for_model(&model);
                if count.is_none() {
                    warn!("relay module {} reports unknown model '{}'", address, model);
                }
                count
            }),
        Err(err) => {
            warn!("relay module {} did not report its model: {}", address, err);
            None
        }
    };
    match (discovered, fallback) {
        (Some(count), _) => {
            info!("relay module {} has {} channels", address, count);
            count
        }
        (None, Some(count)) => count,
        (None, None) => 0,
    }
}

/// Drives `VS{i}` through the driver's write path.
struct ValveOutput {
    driver: WeakDriver<ValveBank>,
    property: String,
}

impl BinaryOutput for ValveOutput {
    fn set(&self, on: bool) {
        match self.driver.upgrade() {
            Some(driver) => driver.write(&self.property, PropertyValue::Bool(on)),
            None => debug!("{} outlived its valve bank", self.property),
        }
    }
}

fn valve_entries(table: &mut PropertyTable<ValveBank>, i: usize) {
    let name = format!("VS{}", i);
    table
        .push(
            PropertyEntry::output(name.as_str(), ValueKind::Binary, move |d: &ValveBank| {
                d.channels[i].state.get().map(PropertyValue::Bool)
            })
            .refreshed_by(|d: Arc<ValveBank>| async move { d.refresh_outputs().await })
            .accepts(Domain::Boolean)
            .applied_by(move |d: &ValveBank, v: &PropertyValue| {
                if let Some(on) = v.as_bool() {
                    d.channels[i].state.update(on);
                }
            })
            .dispatched_by(move |d: Arc<ValveBank>, v: PropertyValue| async move {
                d.set_valve(i, v.as_bool().unwrap_or(false)).await
            }),
        )
        .push(
            PropertyEntry::output(
                format!("{} Interval", name),
                ValueKind::Datapoint,
                move |d: &ValveBank| d.channels[i].pwm.interval().map(PropertyValue::Float),
            )
            .accepts(Domain::exclusive(MIN_INTERVAL_MS, MAX_INTERVAL_MS))
            .applied_by(move |d: &ValveBank, v: &PropertyValue| {
                if let Some(ms) = v.as_f64() {
                    d.channels[i].pwm.set_interval(ms);
                }
            })
            .persisted(),
        )
        .push(
            PropertyEntry::output(
                format!("{} Duty", name),
                ValueKind::Datapoint,
                move |d: &ValveBank| d.channels[i].pwm.duty().map(PropertyValue::Float),
            )
            .accepts(Domain::range(0.0, 1.0))
            .applied_by(move |d: &ValveBank, v: &PropertyValue| {
                if let Some(duty) = v.as_f64() {
                    d.channels[i].pwm.set_duty(duty);
                }
            })
            .persisted(),
        )
        .push(
            PropertyEntry::output(
                format!("{} PWM Mode", name),
                ValueKind::Binary,
                move |d: &ValveBank| d.channels[i].pwm.mode().map(PropertyValue::Bool),
            )
            .accepts(Domain::Boolean)
            .applied_by(move |d: &ValveBank, v: &PropertyValue| {
                if let Some(enabled) = v.as_bool() {
                    d.channels[i].pwm.set_mode(enabled);
                }
            }),
        );
}

/// Build a driver for one module with `channels` channels.
pub fn driver(
    nameplate: &Nameplate,
    address: ModuleAddress,
    channels: usize,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    simulated: bool,
    refresh_rate: Duration,
) -> Driver<ValveBank> {
    let device = Arc::new(ValveBank::new(
        &nameplate.id,
        address.clone(),
        channels,
        transport,
        timeout,
        simulated,
    ));
    let count = device.channel_count();
    let mut table = PropertyTable::with_nameplate(nameplate);
    table.push(PropertyEntry::text("Address", address.as_str())).push(
        PropertyEntry::input("Channels", ValueKind::Datapoint, move |_: &ValveBank| {
            Measurement::new(PropertyValue::Float(count as f64), "")
        }),
    );
    for i in 0..count {
        valve_entries(&mut table, i);
    }
    let driver = Driver::new(nameplate.id.as_str(), device, table.finish(nameplate), refresh_rate);

    for (i, channel) in driver.device().channels.iter().enumerate() {
        channel.pwm.bind(Arc::new(ValveOutput {
            driver: driver.downgrade(),
            property: format!("VS{}", i),
        }));
    }
    driver
}

// =============================================================================
// Simulator
// =============================================================================

struct SimulatedModule {
    model: String,
    outputs: Vec<bool>,
}

struct SimulatedBus {
    modules: BTreeMap<String, SimulatedModule>,
}

impl SimulatedBus {
    fn answer(&mut self, command: &str) -> Option<String> {
        let command = command.trim_end_matches('\r');
        let kind = command.get(..1)?;
        let address = command.get(1..3)?;
        let body = command.get(3..)?;
        let module = self.modules.get_mut(address)?;
        match (kind, body) {
            ("$", "M") => Some(format!("!{}{}", address, module.model)),
            ("$", "6") => Some(encode_outputs(&module.outputs)),
            ("#", body) => {
                let body = body.strip_prefix('1')?;
                let channel = usize::from_str_radix(body.get(..1)?, 16).ok()?;
                let on = match body.get(1..)? {
                    "00" => false,
                    "01" => true,
                    _ => return None,
                };
                *module.outputs.get_mut(channel)? = on;
                Some(SET_ACK.to_string())
            }
            _ => None,
        }
    }
}

/// A transport that answers like a bus of relay modules, given as
/// `(address, model)` pairs.
pub fn simulator(name: &str, modules: &[(ModuleAddress, &str)]) -> MockTransport {
    let modules = modules
        .iter()
        .map(|(address, model)| {
            let channels = channels_for_model(model).unwrap_or(0);
            (
                address.as_str().to_string(),
                SimulatedModule {
                    model: model.to_string(),
                    outputs: vec![false; channels],
                },
            )
        })
        .collect();
    let state = Mutex::new(SimulatedBus { modules });
    MockTransport::new(format!("{} (simulated)", name))
        .with_latency(Duration::from_millis(2))
        .with_responder(move |command| state.lock().answer(command))
}
