//! Named port table and the serial-port configure entry point.
//!
//! The registry stores each port's capabilities under its name, tracks
//! connection transitions reported by the ports themselves and lets filters
//! be interposed on the octet capability after registration.

use crate::config::Config;
use crate::driver::{DriverSettings, PortController};
use crate::interface::{Common, ConnectionObserver, Octet, OptionAccess};
use crate::interpose::EosFilter;
use crate::port::{normalize_device_path, DeviceDriver, PortError, PortResult};
use crate::timer::TimerQueue;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attributes given at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttributes {
    pub priority: u32,
    pub auto_connect: bool,
    /// Install end-of-string processing over the octet capability.
    pub process_eos: bool,
}

impl Default for PortAttributes {
    fn default() -> Self {
        Self {
            priority: 0,
            auto_connect: true,
            process_eos: true,
        }
    }
}

/// One registered port.
pub struct PortEntry {
    pub attributes: PortAttributes,
    common: Arc<dyn Common>,
    option: Arc<dyn OptionAccess>,
    octet: RwLock<Arc<dyn Octet>>,
}

/// Connection state as last reported by each port.
#[derive(Debug, Default)]
pub struct ConnectionBoard {
    states: Mutex<HashMap<String, bool>>,
    transitions: Mutex<u64>,
}

impl ConnectionBoard {
    pub fn is_connected(&self, port: &str) -> bool {
        self.states.lock().get(port).copied().unwrap_or(false)
    }

    /// Connects plus disconnects seen across all ports.
    pub fn transitions(&self) -> u64 {
        *self.transitions.lock()
    }

    fn record(&self, port: &str, connected: bool) {
        self.states.lock().insert(port.to_string(), connected);
        *self.transitions.lock() += 1;
    }
}

impl ConnectionObserver for ConnectionBoard {
    fn connected(&self, port: &str) {
        info!(port, "connected");
        self.record(port, true);
    }

    fn disconnected(&self, port: &str) {
        info!(port, "disconnected");
        self.record(port, false);
    }
}

/// Table of registered ports.
#[derive(Default)]
pub struct PortRegistry {
    ports: RwLock<BTreeMap<String, Arc<PortEntry>>>,
    board: Arc<ConnectionBoard>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observer that ports registered here should notify.
    pub fn observer(&self) -> Arc<dyn ConnectionObserver> {
        Arc::clone(&self.board) as Arc<dyn ConnectionObserver>
    }

    pub fn board(&self) -> &ConnectionBoard {
        &self.board
    }

    pub fn register_port(
        &self,
        name: &str,
        attributes: PortAttributes,
        common: Arc<dyn Common>,
        option: Arc<dyn OptionAccess>,
        octet: Arc<dyn Octet>,
    ) -> PortResult<()> {
        let mut ports = self.ports.write();
        if ports.contains_key(name) {
            return Err(PortError::PortExists(name.to_string()));
        }
        ports.insert(
            name.to_string(),
            Arc::new(PortEntry {
                attributes,
                common,
                option,
                octet: RwLock::new(octet),
            }),
        );
        debug!(port = name, ?attributes, "port registered");
        Ok(())
    }

    fn entry(&self, name: &str) -> PortResult<Arc<PortEntry>> {
        self.ports
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PortError::PortNotFound(name.to_string()))
    }

    pub fn attributes(&self, name: &str) -> PortResult<PortAttributes> {
        Ok(self.entry(name)?.attributes)
    }

    pub fn find_common(&self, name: &str) -> PortResult<Arc<dyn Common>> {
        Ok(Arc::clone(&self.entry(name)?.common))
    }

    pub fn find_option(&self, name: &str) -> PortResult<Arc<dyn OptionAccess>> {
        Ok(Arc::clone(&self.entry(name)?.option))
    }

    /// The outermost octet capability, after any interposed filters.
    pub fn find_octet(&self, name: &str) -> PortResult<Arc<dyn Octet>> {
        Ok(Arc::clone(&*self.entry(name)?.octet.read()))
    }

    /// Replace the octet capability of `name` with `wrap(previous)`.
    pub fn interpose_octet<F>(&self, name: &str, wrap: F) -> PortResult<()>
    where
        F: FnOnce(Arc<dyn Octet>) -> Arc<dyn Octet>,
    {
        let entry = self.entry(name)?;
        let mut octet = entry.octet.write();
        let previous = Arc::clone(&*octet);
        *octet = wrap(previous);
        Ok(())
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.board.is_connected(name)
    }

    pub fn port_names(&self) -> Vec<String> {
        self.ports.read().keys().cloned().collect()
    }

    /// Report one port, or every port when `name` is `None`.
    pub fn report(&self, out: &mut dyn io::Write, level: u32, name: Option<&str>) -> PortResult<()> {
        let targets: Vec<(String, Arc<PortEntry>)> = match name {
            Some(name) => vec![(name.to_string(), self.entry(name)?)],
            None => self
                .ports
                .read()
                .iter()
                .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
                .collect(),
        };
        for (name, entry) in targets {
            self.report_entry(out, level, &name, &entry)
                .map_err(|source| PortError::Io {
                    device: name.clone(),
                    op: "report",
                    source,
                })?;
        }
        Ok(())
    }

    fn report_entry(
        &self,
        out: &mut dyn io::Write,
        level: u32,
        name: &str,
        entry: &PortEntry,
    ) -> io::Result<()> {
        let yes_no = |flag: bool| if flag { "Yes" } else { "No" };
        writeln!(
            out,
            "{name} priority {} autoConnect {} connected {}",
            entry.attributes.priority,
            yes_no(entry.attributes.auto_connect),
            yes_no(self.is_connected(name)),
        )?;
        entry.common.report(out, level)
    }
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRegistry")
            .field("ports", &self.port_names())
            .field("board", &self.board)
            .finish()
    }
}

/// Create, register and optionally connect a serial port.
///
/// `device` is put into the platform's raw-device namespace first. A failed
/// initial connect is logged; the port stays registered so a later connect
/// can succeed.
pub fn configure_serial_port(
    registry: &PortRegistry,
    driver: Arc<dyn DeviceDriver>,
    timers: &TimerQueue,
    settings: DriverSettings,
    port_name: &str,
    device: &str,
    attributes: PortAttributes,
) -> PortResult<Arc<PortController>> {
    let device_name = normalize_device_path(device);
    let controller = Arc::new(PortController::new(
        port_name,
        device_name.as_str(),
        driver,
        timers,
        settings,
        registry.observer(),
    ));

    registry.register_port(
        port_name,
        attributes,
        Arc::clone(&controller) as Arc<dyn Common>,
        Arc::clone(&controller) as Arc<dyn OptionAccess>,
        Arc::clone(&controller) as Arc<dyn Octet>,
    )?;
    if attributes.process_eos {
        registry.interpose_octet(port_name, |inner| Arc::new(EosFilter::new(inner)) as Arc<dyn Octet>)?;
    }
    info!(port = port_name, device = %device_name, "serial port configured");

    if attributes.auto_connect {
        if let Err(e) = controller.connect() {
            warn!(port = port_name, error = %e, "initial connect failed");
        }
    }
    Ok(controller)
}

/// Configure every `[[ports]]` entry of `config` and apply its options.
///
/// Option failures are logged and skipped; a registration failure stops
/// the walk.
pub fn configure_ports(
    registry: &PortRegistry,
    driver: Arc<dyn DeviceDriver>,
    timers: &TimerQueue,
    config: &Config,
) -> PortResult<Vec<Arc<PortController>>> {
    let settings = config.serial.driver_settings();
    let mut controllers = Vec::with_capacity(config.ports.len());
    for port in &config.ports {
        let device = config.serial.resolve_port(&port.device);
        let controller = configure_serial_port(
            registry,
            Arc::clone(&driver),
            timers,
            settings,
            &port.name,
            &device,
            port.attributes(),
        )?;
        for (key, value) in &port.options {
            if let Err(e) = controller.set_option(key, value) {
                warn!(port = %port.name, key = %key, value = %value, error = %e, "option not applied");
            }
        }
        controllers.push(controller);
    }
    Ok(controllers)
}
