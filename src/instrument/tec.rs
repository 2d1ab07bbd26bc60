//! Thermoelectric controller driver.
//!
//! Talks the checksummed fixed-point protocol from
//! [`protocol::checksum`](crate::protocol::checksum).
//!
//! ## Properties
//!
//! | Name                    | Kind       | Read op | Write                     |
//! |-------------------------|------------|---------|---------------------------|
//! | `TEC Power`             | binary     | `64`    | constant enable frames    |
//! | `Set Point Temperature` | ˚C, 0..=50 | `50`    | `1c`, applied immediately |
//! | `Power Output`          | %          | `02`    |                           |
//! | `Thermistor 1`          | ˚C         | `01`    |                           |
//! | `Thermistor 2`          | ˚C         | `04`    |                           |
//!
//! The set-point write carries no readback, so the cache takes the new value
//! as soon as the write is accepted. Enable/disable frames expect either no
//! reply or the exact echo; a wrong echo marks the status as `Error`.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Device, Driver, Nameplate, PropertyEntry, PropertyTable};
use crate::adapters::{MockTransport, Transport};
use crate::core::{PropertyValue, StatusCell, ValueKind};
use crate::error::{AppResult, DaqError, DecodeError};
use crate::parameter::{Cached, Domain};
use crate::protocol::checksum::{
    check_ack, decode_command, decode_reply, encode_command, encode_hundredths, encode_reply, op,
    Acknowledgement, Scale, OUTPUT_OFF, OUTPUT_OFF_ACK, OUTPUT_ON, OUTPUT_ON_ACK,
};

/// Default reply timeout for queries and power frames.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(600);
const SET_POINT_TIMEOUT: Duration = Duration::from_millis(100);

/// Set-point range accepted on write, in ˚C.
pub const SET_POINT_RANGE: (f64, f64) = (0.0, 50.0);

/// One thermoelectric controller.
pub struct Tec {
    id: String,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    status: StatusCell,
    output_enabled: Cached<bool>,
    set_point: Cached<f64>,
    output_power: Cached<f64>,
    thermistor1: Cached<f64>,
    thermistor2: Cached<f64>,
}

impl Device for Tec {
    fn status(&self) -> &StatusCell {
        &self.status
    }
}

impl Tec {
    /// A controller on `transport`. `timeout` bounds every query and the
    /// power frames; set-point writes keep their own short wait.
    pub fn new(
        id: impl Into<String>,
        transport: Arc<dyn Transport>,
        timeout: Duration,
        simulated: bool,
    ) -> Self {
        let id = id.into();
        Self {
            status: StatusCell::new(format!("TEC {}", id), simulated),
            id,
            transport,
            timeout,
            output_enabled: Cached::new(false, ""),
            set_point: Cached::new(0.0, "˚C"),
            output_power: Cached::new(0.0, "%"),
            thermistor1: Cached::new(0.0, "˚C"),
            thermistor2: Cached::new(0.0, "˚C"),
        }
    }

    async fn query(&self, operation: u8) -> AppResult<u16> {
        let frame = encode_command(operation, 0);
        let lines = self.transport.send(frame.as_bytes(), true, self.timeout).await?;
        let reply = lines
            .first()
            .ok_or_else(|| DecodeError::new("empty reply", ""))?;
        Ok(decode_reply(reply)?)
    }

    /// Send a write frame and check the echo, tolerating silence.
    async fn command(
        &self,
        frame: &str,
        echo: &str,
        timeout: Duration,
    ) -> AppResult<Acknowledgement> {
        let reply = match self.transport.send(frame.as_bytes(), true, timeout).await {
            Ok(lines) => lines.into_iter().next(),
            Err(DaqError::TransportTimeout { .. }) => None,
            Err(err) => return Err(err),
        };
        let ack = check_ack(reply.as_deref(), echo)?;
        debug!("[TEC {}] {:?} acknowledged: {:?}", self.id, frame, ack);
        Ok(ack)
    }

    /// Read whether the output stage is enabled.
    pub async fn refresh_output_enabled(&self) -> AppResult<()> {
        let raw = self.query(op::OUTPUT_ENABLE_READ).await?;
        self.output_enabled.update(raw != 0);
        Ok(())
    }

    /// Switch the output stage. The cache follows only on an exact echo.
    pub async fn set_output_enabled(&self, on: bool) -> AppResult<()> {
        let (frame, echo) = if on {
            (OUTPUT_ON, OUTPUT_ON_ACK)
        } else {
            (OUTPUT_OFF, OUTPUT_OFF_ACK)
        };
        if self.command(frame, echo, self.timeout).await? == Acknowledgement::Matched {
            self.output_enabled.update(on);
        }
        Ok(())
    }

    /// Read the set point back.
    pub async fn refresh_set_point(&self) -> AppResult<()> {
        let raw = self.query(op::SET_POINT_READ).await?;
        self.set_point.update(Scale::Hundredths.decode(raw));
        Ok(())
    }

    /// Send a new set point, tolerating a missing echo.
    pub async fn write_set_point(&self, celsius: f64) -> AppResult<()> {
        let payload = encode_hundredths(celsius);
        let frame = encode_command(op::SET_POINT_WRITE, payload);
        self.command(&frame, &encode_reply(payload), SET_POINT_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Read the drive level as a signed percentage.
    pub async fn refresh_output_power(&self) -> AppResult<()> {
        let raw = self.query(op::OUTPUT_POWER).await?;
        self.output_power.update(Scale::BipolarPercent.decode(raw));
        Ok(())
    }

    /// Read the control thermistor.
    pub async fn refresh_thermistor1(&self) -> AppResult<()> {
        let raw = self.query(op::INPUT1).await?;
        self.thermistor1.update(Scale::Hundredths.decode(raw));
        Ok(())
    }

    /// Read the auxiliary thermistor.
    pub async fn refresh_thermistor2(&self) -> AppResult<()> {
        let raw = self.query(op::INPUT2).await?;
        self.thermistor2.update(Scale::Hundredths.decode(raw));
        Ok(())
    }
}

/// Build a driver for one controller.
pub fn driver(
    nameplate: &Nameplate,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    simulated: bool,
    refresh_rate: Duration,
) -> Driver<Tec> {
    let device = Arc::new(Tec::new(nameplate.id.as_str(), transport, timeout, simulated));
    let mut table = PropertyTable::with_nameplate(nameplate);
    table
        .push(
            PropertyEntry::output("TEC Power", ValueKind::Binary, |d: &Tec| {
                d.output_enabled.get().map(PropertyValue::Bool)
            })
            .refreshed_by(|d: Arc<Tec>| async move { d.refresh_output_enabled().await })
            .accepts(Domain::Boolean)
            .dispatched_by(|d: Arc<Tec>, v: PropertyValue| async move {
                d.set_output_enabled(v.as_bool().unwrap_or(false)).await
            })
            .persisted(),
        )
        .push(
            PropertyEntry::output("Set Point Temperature", ValueKind::Datapoint, |d: &Tec| {
                d.set_point.get().map(PropertyValue::Float)
            })
            .refreshed_by(|d: Arc<Tec>| async move { d.refresh_set_point().await })
            .accepts(Domain::range(SET_POINT_RANGE.0, SET_POINT_RANGE.1))
            .applied_by(|d: &Tec, v: &PropertyValue| {
                if let Some(celsius) = v.as_f64() {
                    d.set_point.update(celsius);
                }
            })
            .dispatched_by(|d: Arc<Tec>, v: PropertyValue| async move {
                d.write_set_point(v.as_f64().unwrap_or_default()).await
            })
            .persisted(),
        )
        .push(
            PropertyEntry::input("Power Output", ValueKind::Datapoint, |d: &Tec| {
                d.output_power.get().map(PropertyValue::Float)
            })
            .refreshed_by(|d: Arc<Tec>| async move { d.refresh_output_power().await }),
        )
        .push(
            PropertyEntry::input("Thermistor 1", ValueKind::Datapoint, |d: &Tec| {
                d.thermistor1.get().map(PropertyValue::Float)
            })
            .refreshed_by(|d: Arc<Tec>| async move { d.refresh_thermistor1().await }),
        )
        .push(
            PropertyEntry::input("Thermistor 2", ValueKind::Datapoint, |d: &Tec| {
                d.thermistor2.get().map(PropertyValue::Float)
            })
            .refreshed_by(|d: Arc<Tec>| async move { d.refresh_thermistor2().await }),
        );
    Driver::new(nameplate.id.as_str(), device, table.finish(nameplate), refresh_rate)
}

// =============================================================================
// Simulator
// =============================================================================

struct SimulatedTec {
    enabled: bool,
    set_point: u16,
    thermistor1: f64,
}

impl SimulatedTec {
    fn answer(&mut self, command: &str) -> Option<String> {
        let (operation, payload) = decode_command(command.as_bytes()).ok()?;
        let mut rng = rand::thread_rng();
        let target = if self.enabled {
            Scale::Hundredths.decode(self.set_point)
        } else {
            22.0
        };
        self.thermistor1 += (target - self.thermistor1) * 0.2;
        let raw = match operation {
            op::OUTPUT_ENABLE_WRITE => {
                self.enabled = payload != 0;
                payload
            }
            op::SET_POINT_WRITE => {
                self.set_point = payload;
                payload
            }
            op::SET_POINT_READ => self.set_point,
            op::OUTPUT_ENABLE_READ => u16::from(self.enabled),
            op::INPUT1 => encode_hundredths(self.thermistor1 + rng.gen_range(-0.05..0.05)),
            op::INPUT2 => encode_hundredths(22.0 + rng.gen_range(-0.2..0.2)),
            op::OUTPUT_POWER => {
                let power = if self.enabled {
                    ((target - self.thermistor1) * 100.0).clamp(-511.0, 511.0)
                } else {
                    0.0
                };
                (power.round() as i16) as u16
            }
            _ => return None,
        };
        Some(encode_reply(raw))
    }
}

/// A transport that answers like a controller idling at room temperature.
pub fn simulator(id: &str) -> MockTransport {
    let state = Mutex::new(SimulatedTec {
        enabled: false,
        set_point: encode_hundredths(20.0),
        thermistor1: 22.0,
    });
    MockTransport::new(format!("TEC {} (simulated)", id))
        .with_latency(Duration::from_millis(5))
        .with_responder(move |command| state.lock().answer(command))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::InstrumentStatus;
    use crate::instrument::Instrument;
    use tokio::time::Instant;

    async fn scripted_with(timeout: Duration) -> (Driver<Tec>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new("tec"));
        transport.open().await.unwrap();
        let driver = driver(
            &Nameplate::new("HFVG"),
            transport.clone(),
            timeout,
            false,
            Duration::from_secs(6),
        );
        (driver, transport)
    }

    async fn scripted() -> (Driver<Tec>, Arc<MockTransport>) {
        scripted_with(DEFAULT_TIMEOUT).await
    }

    #[tokio::test]
    async fn test_thermistor_read_decodes_hundredths() {
        let (driver, transport) = scripted().await;
        transport.push_reply(Some(&encode_reply(0x0929)), Duration::ZERO);

        driver.refresh("Thermistor 1").await.unwrap();

        assert_eq!(transport.sent(), vec!["*01000021\r".to_string()]);
        assert_eq!(
            driver.snapshot("Thermistor 1").unwrap().value,
            PropertyValue::Float(23.45)
        );
        assert_eq!(driver.status(), InstrumentStatus::Connected);
    }

    #[tokio::test]
    async fn test_negative_temperature_reply() {
        let (driver, transport) = scripted().await;
        transport.push_reply(Some(&encode_reply(0xFE0C)), Duration::ZERO);

        driver.refresh("Thermistor 2").await.unwrap();

        assert_eq!(
            driver.snapshot("Thermistor 2").unwrap().value,
            PropertyValue::Float(-5.0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_timeout_bounds_queries() {
        let (driver, _transport) = scripted_with(Duration::from_millis(50)).await;
        let start = Instant::now();

        assert!(driver.refresh("Thermistor 1").await.is_err());

        assert_eq!(start.elapsed(), Duration::from_millis(50));
        assert_eq!(
            driver.status(),
            InstrumentStatus::Error("Transport timeout after 50ms".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_apply_in_completion_order() {
        let (driver, transport) = scripted().await;
        transport.push_reply(Some(&encode_reply(0x0929)), Duration::from_millis(100));
        transport.push_reply(Some(&encode_reply(0x0898)), Duration::from_millis(10));

        let (_, first) = driver.read_tracked("Thermistor 1").unwrap();
        let (_, second) = driver.read_tracked("Thermistor 1").unwrap();

        second.unwrap().await.unwrap();
        let early = driver.snapshot("Thermistor 1").unwrap();
        assert_eq!(early.value, PropertyValue::Float(22.0));

        first.unwrap().await.unwrap();
        let late = driver.snapshot("Thermistor 1").unwrap();
        assert_eq!(late.value, PropertyValue::Float(23.45));
        assert!(late.time >= early.time);
        assert_eq!(driver.status(), InstrumentStatus::Connected);
    }

    #[tokio::test]
    async fn test_corrupted_reply_sets_error_and_keeps_cache() {
        let (driver, transport) = scripted().await;
        transport.push_reply(Some("*0929ff^"), Duration::ZERO);

        assert!(driver.refresh("Set Point Temperature").await.is_err());

        assert_eq!(
            driver.snapshot("Set Point Temperature").unwrap().value,
            PropertyValue::Float(0.0)
        );
        match driver.status() {
            InstrumentStatus::Error(message) => assert!(message.contains("*0929ff^")),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_set_point_write_is_optimistic() {
        let (driver, transport) = scripted().await;

        let task = driver
            .write_tracked("Set Point Temperature", PropertyValue::Float(23.45))
            .unwrap()
            .unwrap();
        assert_eq!(
            driver.snapshot("Set Point Temperature").unwrap().value,
            PropertyValue::Float(23.45)
        );

        task.await.unwrap();
        assert_eq!(transport.sent(), vec![encode_command(op::SET_POINT_WRITE, 0x0929)]);
        assert_eq!(driver.status(), InstrumentStatus::Connected);
    }

    #[tokio::test]
    async fn test_out_of_range_set_point_dropped() {
        let (driver, transport) = scripted().await;
        assert!(driver
            .write_tracked("Set Point Temperature", PropertyValue::Float(50.5))
            .is_none());
        assert!(driver
            .write_tracked("Set Point Temperature", PropertyValue::Float(-5.0))
            .is_none());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_power_enable_ack_variants() {
        let (driver, transport) = scripted().await;

        transport.push_reply(Some(OUTPUT_ON_ACK), Duration::ZERO);
        driver.device().set_output_enabled(true).await.unwrap();
        assert_eq!(driver.snapshot("TEC Power").unwrap().value, PropertyValue::Bool(true));

        transport.push_reply(None, Duration::ZERO);
        assert!(driver.device().set_output_enabled(false).await.is_ok());

        transport.push_reply(Some("*0001c1^"), Duration::ZERO);
        assert!(driver.device().set_output_enabled(false).await.is_err());

        assert_eq!(
            transport.sent(),
            vec![OUTPUT_ON.to_string(), OUTPUT_OFF.to_string(), OUTPUT_OFF.to_string()]
        );
    }

    #[tokio::test]
    async fn test_power_output_scale() {
        let (driver, transport) = scripted().await;
        transport.push_reply(Some(&encode_reply(511)), Duration::ZERO);

        driver.refresh("Power Output").await.unwrap();

        assert_eq!(
            driver.snapshot("Power Output").unwrap().value,
            PropertyValue::Float(100.0)
        );
    }

    #[tokio::test]
    async fn test_simulator_round_trip() {
        let transport = Arc::new(simulator("HFVG"));
        transport.open().await.unwrap();
        let driver = driver(
            &Nameplate::new("HFVG"),
            transport,
            DEFAULT_TIMEOUT,
            true,
            Duration::from_secs(6),
        );

        driver
            .write_tracked("Set Point Temperature", PropertyValue::Float(30.0))
            .unwrap()
            .unwrap()
            .await
            .unwrap();
        driver.refresh("Set Point Temperature").await.unwrap();

        assert_eq!(
            driver.snapshot("Set Point Temperature").unwrap().value,
            PropertyValue::Float(30.0)
        );
        assert_eq!(driver.status(), InstrumentStatus::Testing);
    }
}
