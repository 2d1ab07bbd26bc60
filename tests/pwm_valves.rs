//! PWM behaviour observed through the valve-bank property surface.

use rig_daq::{
    adapters::{MockTransport, Transport},
    core::PropertyValue,
    instrument::{valves, Driver, Instrument, Nameplate},
    protocol::relay::ModuleAddress,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn addr(text: &str) -> ModuleAddress {
    ModuleAddress::parse(text).unwrap()
}

async fn bus() -> Arc<MockTransport> {
    let transport = Arc::new(valves::simulator(
        "valves",
        &[(addr("01"), "4068"), (addr("03"), "4068")],
    ));
    transport.open().await.unwrap();
    transport
}

fn bank(id: &str, transport: Arc<MockTransport>) -> Driver<valves::ValveBank> {
    valves::driver(
        &Nameplate::new(id),
        addr(id),
        8,
        transport,
        valves::DEFAULT_TIMEOUT,
        true,
        Duration::from_secs(4),
    )
}

fn valve(driver: &Driver<valves::ValveBank>, channel: usize) -> PropertyValue {
    driver.snapshot(&format!("VS{}", channel)).unwrap().value
}

#[tokio::test(start_paused = true)]
async fn test_zero_duty_pauses_without_disabling() {
    let transport = bus().await;
    let bank = bank("01", transport);
    bank.write("VS0 Interval", PropertyValue::Float(1000.0));
    bank.write("VS0 Duty", PropertyValue::Float(0.3));
    bank.write("VS0 PWM Mode", PropertyValue::Bool(true));

    sleep(Duration::from_millis(1100)).await;
    assert_eq!(valve(&bank, 0), PropertyValue::Bool(true));
    sleep(Duration::from_millis(300)).await; // t = 1400
    assert_eq!(valve(&bank, 0), PropertyValue::Bool(false));

    sleep(Duration::from_millis(100)).await; // t = 1500
    bank.write("VS0 Duty", PropertyValue::Float(0.0));
    sleep(Duration::from_millis(600)).await; // t = 2100, past a tick
    assert_eq!(valve(&bank, 0), PropertyValue::Bool(false));
    assert_eq!(
        bank.snapshot("VS0 PWM Mode").unwrap().value,
        PropertyValue::Bool(true)
    );

    sleep(Duration::from_millis(400)).await; // t = 2500
    bank.write("VS0 Duty", PropertyValue::Float(0.5));
    sleep(Duration::from_millis(1100)).await; // t = 3600
    assert_eq!(valve(&bank, 0), PropertyValue::Bool(true));
    sleep(Duration::from_millis(500)).await; // t = 4100
    assert_eq!(valve(&bank, 0), PropertyValue::Bool(false));
    assert_eq!(
        bank.snapshot("VS0 Interval").unwrap().value,
        PropertyValue::Float(1000.0)
    );

    bank.write("VS0 PWM Mode", PropertyValue::Bool(false));
}

#[tokio::test(start_paused = true)]
async fn test_disable_truncates_pulse() {
    let transport = bus().await;
    let bank = bank("01", transport);
    bank.write("VS1 Interval", PropertyValue::Float(1000.0));
    bank.write("VS1 Duty", PropertyValue::Float(0.8));
    bank.write("VS1 PWM Mode", PropertyValue::Bool(true));

    sleep(Duration::from_millis(1200)).await;
    assert_eq!(valve(&bank, 1), PropertyValue::Bool(true));

    bank.write("VS1 PWM Mode", PropertyValue::Bool(false));
    assert_eq!(valve(&bank, 1), PropertyValue::Bool(false));

    sleep(Duration::from_millis(3000)).await;
    assert_eq!(valve(&bank, 1), PropertyValue::Bool(false));
}

#[tokio::test(start_paused = true)]
async fn test_channels_on_shared_bus_pulse_independently() {
    let transport = bus().await;
    let first = bank("01", transport.clone());
    let third = bank("03", transport.clone());

    first.write("VS0 Interval", PropertyValue::Float(1000.0));
    first.write("VS0 Duty", PropertyValue::Float(0.5));
    first.write("VS0 PWM Mode", PropertyValue::Bool(true));
    third.write("VS0 Interval", PropertyValue::Float(400.0));
    third.write("VS0 Duty", PropertyValue::Float(0.25));
    third.write("VS0 PWM Mode", PropertyValue::Bool(true));

    sleep(Duration::from_millis(450)).await;
    assert_eq!(valve(&first, 0), PropertyValue::Bool(false));
    assert_eq!(valve(&third, 0), PropertyValue::Bool(true));
    assert_eq!(valve(&first, 1), PropertyValue::Bool(false));

    sleep(Duration::from_millis(600)).await; // t = 1050
    assert_eq!(valve(&first, 0), PropertyValue::Bool(true));
    assert_eq!(valve(&third, 0), PropertyValue::Bool(false));

    let sent = transport.sent();
    assert!(sent.iter().any(|c| c == "#011001\r"));
    assert!(sent.iter().any(|c| c == "#031001\r"));
    assert!(sent.iter().all(|c| !c.starts_with("#0111")));

    first.write("VS0 PWM Mode", PropertyValue::Bool(false));
    third.write("VS0 PWM Mode", PropertyValue::Bool(false));
}

#[tokio::test]
async fn test_out_of_range_settings_leave_channel_unchanged() {
    let transport = bus().await;
    let bank = bank("01", transport);
    bank.write("VS3 Interval", PropertyValue::Float(1000.0));
    bank.write("VS3 Duty", PropertyValue::Float(0.3));

    bank.write("VS3 Duty", PropertyValue::Float(1.5));
    bank.write("VS3 Interval", PropertyValue::Float(10.0));
    bank.write("VS3 Interval", PropertyValue::Float(20_000.0));

    assert_eq!(
        bank.snapshot("VS3 Duty").unwrap().value,
        PropertyValue::Float(0.3)
    );
    assert_eq!(
        bank.snapshot("VS3 Interval").unwrap().value,
        PropertyValue::Float(1000.0)
    );
}
