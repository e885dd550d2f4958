//! Tests against the real USB library
//!
//! These need libusb with access to at least one device, so they are ignored
//! by default. Run with: `cargo test -p usbhost --test hardware_tests -- --ignored`

use std::time::{Duration, Instant};
use usbhost::{ControlSetup, DebugLevel, Session, SessionSettings, Transfer, TransferStatus};

const DEADLINE: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("usbhost=debug")
        .with_test_writer()
        .try_init();
}

fn session() -> anyhow::Result<Session> {
    init_logging();
    let settings = SessionSettings {
        debug_level: DebugLevel::Level1,
        transfer_timeout_ms: 1000,
        ..SessionSettings::default()
    };
    Ok(Session::new(&settings)?)
}

#[test]
#[ignore = "requires hardware"]
fn test_enumerate_real_devices() -> anyhow::Result<()> {
    let session = session()?;
    let devices = session.enumerate_devices()?;
    assert!(!devices.is_empty(), "no USB devices visible");

    for device in &devices {
        let info = device.info();
        assert!(info.num_configurations > 0, "{} has no configurations", device);
    }
    Ok(())
}

#[test]
#[ignore = "requires hardware"]
fn test_get_device_descriptor() -> anyhow::Result<()> {
    let session = session()?;
    let device = session
        .enumerate_devices()?
        .into_iter()
        .find(|device| device.open().is_ok())
        .ok_or_else(|| anyhow::anyhow!("no device could be opened"))?;

    let setup = ControlSetup {
        request_type: 0x80,
        request: 0x06,
        value: 0x0100,
        index: 0,
    };
    let transfer = Transfer::control(&device, setup, 18);
    transfer.submit()?;

    let started = Instant::now();
    while transfer.state() == usbhost::TransferState::Submitted {
        anyhow::ensure!(started.elapsed() < DEADLINE, "descriptor request never finished");
        session.process_events_timeout(Duration::from_millis(50))?;
    }

    assert!(transfer.is_complete(), "finished with {:?}", transfer.state());
    let data = transfer.data().ok_or_else(|| anyhow::anyhow!("no data"))?;
    assert_eq!(data.len(), 18);
    // bDescriptorType, idVendor
    assert_eq!(data[1], 0x01);
    assert_eq!(
        u16::from_le_bytes([data[8], data[9]]),
        device.info().vendor_id
    );
    Ok(())
}

#[test]
#[ignore = "requires hardware"]
fn test_cancel_real_transfer() -> anyhow::Result<()> {
    let session = session()?;
    let device = session
        .enumerate_devices()?
        .into_iter()
        .find(|device| device.open().is_ok())
        .ok_or_else(|| anyhow::anyhow!("no device could be opened"))?;

    let setup = ControlSetup {
        request_type: 0x80,
        request: 0x06,
        value: 0x0100,
        index: 0,
    };
    let transfer = Transfer::control(&device, setup, 18);
    transfer.submit()?;
    transfer.cancel()?;

    let started = Instant::now();
    while session.in_flight() > 0 {
        anyhow::ensure!(started.elapsed() < DEADLINE, "cancellation never reported");
        session.process_events_timeout(Duration::from_millis(50))?;
    }

    // Control transfers may finish before the cancel lands
    assert!(matches!(
        transfer.state(),
        usbhost::TransferState::Finished(TransferStatus::Cancelled | TransferStatus::Completed)
    ));
    Ok(())
}
