//! Hardware integration tests.
//!
//! These need a real serial device and are ignored by default. Set
//! `TEST_PORT` (and `TEST_LOOPBACK=1` when a loopback plug is fitted), then
//! run with: cargo test --features hardware-tests -- --ignored

#![cfg(feature = "hardware-tests")]

use asyn_serial::interface::IoRequest;
use asyn_serial::port::{DeviceDriver, NativeDriver};
use asyn_serial::registry::{configure_serial_port, PortAttributes, PortRegistry};
use asyn_serial::{DriverSettings, PortController, TimerQueue};
use std::env;
use std::sync::Arc;
use std::time::Duration;

const PORT: &str = "HW0";

fn test_port() -> Option<String> {
    match env::var("TEST_PORT") {
        Ok(port) => Some(port),
        Err(_) => {
            println!("Skipping: TEST_PORT not set");
            None
        }
    }
}

fn test_baud() -> u32 {
    env::var("TEST_BAUD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9600)
}

fn loopback_fitted() -> bool {
    env::var("TEST_LOOPBACK").ok().as_deref() == Some("1")
}

fn open(registry: &PortRegistry, device: &str) -> Arc<PortController> {
    let timers = TimerQueue::shared().expect("timer queue");
    let port = configure_serial_port(
        registry,
        Arc::new(NativeDriver::new(test_baud())) as Arc<dyn DeviceDriver>,
        &timers,
        DriverSettings::default(),
        PORT,
        device,
        PortAttributes::default(),
    )
    .expect("configure port");
    assert!(port.is_connected(), "failed to open {device}");
    port
}

#[test]
#[ignore]
fn test_real_port_connect_cycle() {
    let Some(device) = test_port() else { return };
    let registry = PortRegistry::new();
    let port = open(&registry, &device);

    assert!(port.monitor_running());
    port.disconnect().unwrap();
    assert!(!registry.is_connected(PORT));
    port.connect().unwrap();
    assert!(registry.is_connected(PORT));
}

#[test]
#[ignore]
fn test_real_port_options() {
    let Some(device) = test_port() else { return };
    let registry = PortRegistry::new();
    let port = open(&registry, &device);

    port.set_option("baud", "19200").unwrap();
    port.set_option("parity", "none").unwrap();
    assert_eq!(port.get_option("baud").unwrap(), "19200");
    assert_eq!(port.get_option("parity").unwrap(), "none");

    let mut report = Vec::new();
    port.report(&mut report, 2).unwrap();
    let text = String::from_utf8_lossy(&report);
    println!("{text}");
    assert!(text.contains("*** Port Configuration ***"));
}

#[test]
#[ignore]
fn test_real_port_read_timeout() {
    let Some(device) = test_port() else { return };
    if loopback_fitted() {
        println!("Skipping: loopback plug echoes input");
        return;
    }
    let registry = PortRegistry::new();
    let port = open(&registry, &device);
    port.flush().unwrap();

    let mut buf = [0u8; 32];
    let read = port.read(&IoRequest::with_timeout(Duration::from_millis(300)), &mut buf);

    assert!(read.status.is_timeout(), "{}", read.status);
    assert_eq!(read.transferred, 0);
}

#[test]
#[ignore]
fn test_real_port_loopback_communication() {
    let Some(device) = test_port() else { return };
    if !loopback_fitted() {
        println!("Skipping: TEST_LOOPBACK not set to 1");
        return;
    }
    let registry = PortRegistry::new();
    let port = open(&registry, &device);
    port.flush().unwrap();
    let req = IoRequest::with_timeout(Duration::from_secs(1));

    let written = port.write(&req, b"LOOPBACK TEST\r\n");
    assert!(written.status.is_success(), "{}", written.status);

    let mut buf = [0u8; 256];
    let mut received = Vec::new();
    while received.len() < 15 {
        let read = port.read(&req, &mut buf);
        if read.transferred == 0 {
            break;
        }
        received.extend_from_slice(&buf[..read.transferred]);
    }
    assert_eq!(received, b"LOOPBACK TEST\r\n");
}
