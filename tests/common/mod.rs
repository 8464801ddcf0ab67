//! Shared test utilities for asyn-serial tests.
//!
//! This module provides common test infrastructure including:
//! - A registered, connected port over an in-memory loopback line
//! - Timing helpers for deadline assertions

#![allow(dead_code)]

use asyn_serial::driver::{DriverSettings, PortController};
use asyn_serial::port::{normalize_device_path, DeviceDriver, LoopbackDriver, LoopbackLine};
use asyn_serial::registry::{configure_serial_port, PortAttributes, PortRegistry};
use asyn_serial::timer::TimerQueue;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Registry name used by every harness port.
pub const PORT: &str = "L0";

/// A configured port, its registry and the peer end of its line.
pub struct Harness {
    pub registry: PortRegistry,
    pub driver: Arc<LoopbackDriver>,
    pub port: Arc<PortController>,
    pub line: Arc<LoopbackLine>,
}

impl Harness {
    /// Register `PORT` on a fresh loopback line and connect it.
    pub fn connected() -> Self {
        Self::with_attributes(PortAttributes::default())
    }

    /// Register `PORT` without connecting.
    pub fn disconnected() -> Self {
        Self::with_attributes(PortAttributes {
            auto_connect: false,
            ..PortAttributes::default()
        })
    }

    pub fn with_attributes(attributes: PortAttributes) -> Self {
        let registry = PortRegistry::new();
        let driver = Arc::new(LoopbackDriver::new());
        let timers = TimerQueue::shared().expect("timer queue");
        let port = configure_serial_port(
            &registry,
            Arc::clone(&driver) as Arc<dyn DeviceDriver>,
            &timers,
            DriverSettings::default(),
            PORT,
            "loop0",
            attributes,
        )
        .expect("configure port");
        let line = driver.line(&normalize_device_path("loop0"));
        Self {
            registry,
            driver,
            port,
            line,
        }
    }
}

/// Run `f` and return its result together with the elapsed time.
pub fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let value = f();
    (value, start.elapsed())
}
