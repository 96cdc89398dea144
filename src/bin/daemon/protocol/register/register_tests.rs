// Tests for the register client against the in-memory register bank

use super::transport::{BankHandle, MemoryRegisterBank, RegisterTransport};
use super::{Direction, IoLayout, RegisterClient, RelayState};
use crate::config::Config;
use crate::device::DeviceRegistry;
use crate::error::MechError;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;

const LAYOUT: &str = r#"
[[device]]
id = 20
name = "dome io"
kind = "register"
endpoint = "sim"
unit = 3

[[device]]
id = 1
name = "focus"
kind = "line"
endpoint = "sim"

[[relay]]
name = "lamp"
module = 20
register = 4
mask = 0x0001
convention = "normally_open"

[[relay]]
name = "heater"
module = 20
register = 4
mask = 0x0004
convention = "normally_closed"

[[sensor]]
name = "dewar"
module = 20
register = 10
kind = "rtd"
units = "C"

[[sensor]]
name = "laser power"
module = 20
register = 11
kind = "polynomial"
calibration = "register_to_power"
units = "mW"

[calibration.register_to_power]
coefficients = [0.5, 0.25]
"#;

async fn setup() -> (RegisterClient, Arc<DeviceRegistry>, BankHandle) {
    let config = Config::from_toml(LAYOUT).unwrap();
    let registry = Arc::new(DeviceRegistry::from_configs(&config.devices));
    let bank = MemoryRegisterBank::new();
    let handle = bank.handle();
    registry
        .get(20)
        .unwrap()
        .attach_fieldbus(Box::new(bank))
        .await;
    let client = RegisterClient::new(registry.clone(), Arc::new(IoLayout::from_config(&config)));
    (client, registry, handle)
}

/// A write followed by a read of the same block returns the written values
#[async_std::test]
async fn test_write_then_read() {
    let (client, _, bank) = setup().await;

    let mut written = [1u16, 0xFFFF, 42];
    client
        .register_transfer(Direction::Write, 20, 3, 100, &mut written, 3)
        .await
        .unwrap();
    assert_eq!(bank.get(3, 101), 0xFFFF);

    let mut read = [0u16; 3];
    client
        .register_transfer(Direction::Read, 20, 3, 100, &mut read, 3)
        .await
        .unwrap();
    assert_eq!(read, written);
}

/// Only `count` registers are transferred
#[async_std::test]
async fn test_partial_count() {
    let (client, _, bank) = setup().await;
    bank.set(3, 0, 7);
    bank.set(3, 1, 8);

    let mut read = [99u16; 4];
    client
        .register_transfer(Direction::Read, 20, 3, 0, &mut read, 1)
        .await
        .unwrap();
    assert_eq!(read, [7, 99, 99, 99]);
}

/// A failed transfer is fatal and leaves the buffer as it was
#[async_std::test]
async fn test_unreachable_module() {
    let (client, registry, bank) = setup().await;
    bank.set_offline(true);

    let mut read = [5u16; 2];
    let err = client
        .register_transfer(Direction::Read, 20, 3, 0, &mut read, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, MechError::UnreachableFieldbusDevice { .. }));
    assert!(err.is_fatal());
    assert_eq!(read, [5, 5]);

    let device = registry.get(20).unwrap();
    assert!(!device.is_busy());
    assert!(device.snapshot().last_error.contains("unreachable"));

    // The in-memory bank survives the failure with its registers intact
    bank.set(3, 0, 77);
    bank.set_offline(false);
    client
        .register_transfer(Direction::Read, 20, 3, 0, &mut read, 2)
        .await
        .unwrap();
    assert_eq!(read, [77, 0]);
    assert!(device.snapshot().last_error.is_empty());
}

/// Network module that refuses every transfer
struct DeadModule;

#[async_trait]
impl RegisterTransport for DeadModule {
    async fn read_registers(
        &mut self,
        _unit: u8,
        _base: u16,
        _count: u16,
    ) -> io::Result<Vec<u16>> {
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
    }

    async fn write_registers(
        &mut self,
        _unit: u8,
        _base: u16,
        _values: &[u16],
    ) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
    }

    fn describe(&self) -> String {
        "dead".to_string()
    }
}

/// A reconnecting transport is dropped after a failure so the next transfer reopens it
#[async_std::test]
async fn test_failed_link_is_dropped() {
    let (client, registry, _) = setup().await;
    let device = registry.get(20).unwrap();
    device.attach_fieldbus(Box::new(DeadModule)).await;

    let mut buffer = [9u16; 1];
    let err = client.update_bits(20, 4, 1, true).await.unwrap_err();
    assert!(matches!(err, MechError::UnreachableFieldbusDevice { .. }));
    assert!(device.fieldbus.lock().await.is_none());

    // The endpoint is `sim`, so the reopened link is a blank bank
    client
        .register_transfer(Direction::Read, 20, 3, 4, &mut buffer, 1)
        .await
        .unwrap();
    assert_eq!(buffer, [0]);
}

/// The busy flag covers the whole transfer, not just its start
#[async_std::test]
async fn test_busy_during_transfer() {
    let (client, registry, bank) = setup().await;
    bank.set_latency(Duration::from_millis(200));
    let device = registry.get(20).unwrap();

    let background = client.clone();
    let transfer = async_std::task::spawn(async move {
        let mut buffer = [0u16; 4];
        background
            .register_transfer(Direction::Read, 20, 3, 0, &mut buffer, 4)
            .await
    });

    async_std::task::sleep(Duration::from_millis(50)).await;
    assert!(device.is_busy());
    let mut other = [0u16; 1];
    assert!(matches!(
        client
            .register_transfer(Direction::Read, 20, 3, 0, &mut other, 1)
            .await,
        Err(MechError::BusyConflict { .. })
    ));
    assert!(matches!(
        client.set_relay("lamp", RelayState::On).await,
        Err(MechError::BusyConflict { .. })
    ));

    transfer.await.unwrap();
    assert!(!device.is_busy());
    assert_eq!(bank.transfers(), 1);
}

#[async_std::test]
async fn test_transfer_argument_checks() {
    let (client, _, _) = setup().await;

    let mut buffer = [0u16; 2];
    assert!(matches!(
        client
            .register_transfer(Direction::Read, 20, 3, 0, &mut buffer, 3)
            .await,
        Err(MechError::InvalidArguments(_))
    ));
    // Line devices are not register modules
    assert!(matches!(
        client
            .register_transfer(Direction::Read, 1, 3, 0, &mut buffer, 1)
            .await,
        Err(MechError::NotFound(_))
    ));
}

#[async_std::test]
async fn test_busy_module() {
    let (client, registry, _) = setup().await;
    let device = registry.get(20).unwrap();
    let _held = device.try_begin().unwrap();

    let mut buffer = [0u16; 1];
    assert!(matches!(
        client
            .register_transfer(Direction::Read, 20, 3, 0, &mut buffer, 1)
            .await,
        Err(MechError::BusyConflict { .. })
    ));
}

/// Read-modify-write touches only the masked bits
#[async_std::test]
async fn test_update_bits() {
    let (client, _, bank) = setup().await;
    bank.set(3, 4, 0b1010_0000);

    assert_eq!(client.update_bits(20, 4, 0b11, true).await.unwrap(), 0b1010_0011);
    assert_eq!(client.update_bits(20, 4, 0b1000_0001, false).await.unwrap(), 0b0010_0010);
    assert_eq!(bank.get(3, 4), 0b0010_0010);
}

/// Normally open channels close with the bit set; normally closed ones with it clear
#[async_std::test]
async fn test_relay_conventions() {
    let (client, _, bank) = setup().await;

    client.set_relay("lamp", RelayState::On).await.unwrap();
    assert_eq!(bank.get(3, 4) & 0x0001, 0x0001);
    assert_eq!(client.relay_state("LAMP").await.unwrap(), RelayState::On);

    client.set_relay("heater", RelayState::On).await.unwrap();
    assert_eq!(bank.get(3, 4) & 0x0004, 0);
    assert_eq!(client.relay_state("heater").await.unwrap(), RelayState::On);

    client.set_relay("heater", RelayState::Off).await.unwrap();
    assert_eq!(bank.get(3, 4) & 0x0004, 0x0004);
    assert_eq!(client.relay_state("heater").await.unwrap(), RelayState::Off);
    // The lamp bit in the shared register survived
    assert_eq!(client.relay_state("lamp").await.unwrap(), RelayState::On);

    assert!(matches!(
        client.set_relay("fan", RelayState::On).await,
        Err(MechError::NotFound(_))
    ));
}

#[async_std::test]
async fn test_sensors() {
    let (client, _, bank) = setup().await;
    bank.set(3, 10, 0xFFEC);
    bank.set(3, 11, 10);

    let dewar = client.read_sensor("dewar").await.unwrap();
    assert_eq!(dewar.raw, 0xFFEC);
    assert!((dewar.value - (-1.9)).abs() < 1e-6);
    assert_eq!(dewar.units, "C");

    let power = client.read_sensor("laser power").await.unwrap();
    assert_eq!(power.value, 3.0);
}
