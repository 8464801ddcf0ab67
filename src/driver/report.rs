//! Diagnostic report for a serial port.
//!
//! Level 0 prints the connection state, level 1 adds identity, counters and
//! break timing, level 2 re-queries the device for its configuration, queue
//! properties, line status and modem lines. A failed query ends the report
//! with a message line; it is never an error for the caller.

use super::monitor::MonitorShared;
use crate::port::{DeviceConfig, EventMask, SerialDevice};
use std::io::{self, Write};
use std::time::Duration;

/// Values the report needs from the controller.
pub(crate) struct ReportContext<'a> {
    pub port_name: &'a str,
    pub device_name: &'a str,
    pub device: Option<&'a dyn SerialDevice>,
    pub n_written: u64,
    pub n_read: u64,
    pub break_duration_ms: u32,
    pub break_delay_ms: u32,
    pub flush_on_write: bool,
    pub requested_mask: EventMask,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub monitor: &'a MonitorShared,
    pub monitor_running: bool,
}

fn row(out: &mut dyn Write, label: &str, value: impl std::fmt::Display) -> io::Result<()> {
    writeln!(out, "{label:>22}: {value}")
}

fn yn(flag: bool) -> char {
    if flag {
        'Y'
    } else {
        'N'
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "ON"
    } else {
        "OFF"
    }
}

fn timeout_text(timeout: Option<Duration>) -> String {
    match timeout {
        None => "unset".to_string(),
        Some(t) => format!("{:.3}", t.as_secs_f64()),
    }
}

fn mask_text(mask: EventMask) -> String {
    let names: Vec<&str> = mask.iter_names().map(|(name, _)| name).collect();
    if names.is_empty() {
        format!("0x{:x}", mask.bits())
    } else {
        format!("0x{:x} ({})", mask.bits(), names.join("|"))
    }
}

pub(crate) fn write_report(out: &mut dyn Write, level: u32, ctx: &ReportContext<'_>) -> io::Result<()> {
    writeln!(
        out,
        "Serial line {}: {}",
        ctx.device_name,
        if ctx.device.is_some() {
            "Connected"
        } else {
            "Disconnected"
        }
    )?;
    if level >= 1 {
        row(out, "port", ctx.port_name)?;
        row(out, "Characters written", ctx.n_written)?;
        row(out, "Characters read", ctx.n_read)?;
        row(out, "break duration (ms)", ctx.break_duration_ms)?;
        row(out, "break delay (ms)", ctx.break_delay_ms)?;
        row(out, "flush after write", yn(ctx.flush_on_write))?;
        row(out, "requested event mask", mask_text(ctx.requested_mask))?;
        row(out, "read timeout (s)", timeout_text(ctx.read_timeout))?;
        row(out, "write timeout (s)", timeout_text(ctx.write_timeout))?;
        row(out, "event monitor", if ctx.monitor_running { "running" } else { "stopped" })?;
    }
    let Some(device) = ctx.device else {
        return Ok(());
    };
    if level < 2 {
        return Ok(());
    }

    let config = match device.comm_config() {
        Ok(config) => config,
        Err(e) => return writeln!(out, "{} error calling get config: {e}", ctx.device_name),
    };
    writeln!(out, "*** Port Configuration ***")?;
    write_config(out, &config)?;

    let props = match device.properties() {
        Ok(props) => props,
        Err(e) => return writeln!(out, "{} error calling get properties: {e}", ctx.device_name),
    };
    writeln!(out, "*** Port Properties ***")?;
    row(out, "Max input buffer size", props.max_rx_queue)?;
    row(out, "input buffer size", props.current_rx_queue)?;
    row(out, "Max output buffer size", props.max_tx_queue)?;
    row(out, "output buffer size", props.current_tx_queue)?;

    match device.comm_state() {
        Ok(state) if state != config => writeln!(
            out,
            "*** WARNING: configuration and state queries disagree on contents"
        )?,
        Ok(_) => {}
        Err(e) => return writeln!(out, "{} error calling get state: {e}", ctx.device_name),
    }

    let (errors, status) = match device.line_status() {
        Ok(status) => status,
        Err(e) => return writeln!(out, "{} error calling line status: {e}", ctx.device_name),
    };
    writeln!(out, "*** Port Status ***")?;
    if !errors.is_empty() {
        let names: Vec<&str> = errors.iter_names().map(|(name, _)| name).collect();
        row(out, "line errors present", format!("0x{:x} ({})", errors.bits(), names.join("|")))?;
    }
    row(out, "waiting for CTS", yn(status.cts_hold))?;
    row(out, "waiting for DSR", yn(status.dsr_hold))?;
    row(out, "waiting for CD/RLSD", yn(status.rlsd_hold))?;
    row(out, "waiting as seen Xoff", yn(status.xoff_hold))?;
    row(out, "waiting as sent Xoff", yn(status.xoff_sent))?;
    row(out, "EOF received", yn(status.eof))?;
    row(out, "immediate char queued", yn(status.txim))?;
    row(out, "nbytes in input queue", status.in_queue)?;
    row(out, "nbytes in output queue", status.out_queue)?;

    let modem = match device.modem_status() {
        Ok(modem) => modem,
        Err(e) => return writeln!(out, "{} error calling modem status: {e}", ctx.device_name),
    };
    writeln!(out, "*** Modem control line Status ***")?;
    writeln!(out, "CTS: {}", on_off(modem.cts))?;
    writeln!(out, "DSR: {}", on_off(modem.dsr))?;
    writeln!(out, "RI: {}", on_off(modem.ring))?;
    writeln!(out, "RLSD: {}", on_off(modem.rlsd))?;

    match device.event_mask() {
        Ok(mask) => row(out, "event mask", mask_text(mask))?,
        Err(e) => return writeln!(out, "{} error calling get event mask: {e}", ctx.device_name),
    }
    row(out, "events seen", ctx.monitor.event_count())?;
    if let Some(event) = ctx.monitor.last_event() {
        row(
            out,
            "last event",
            format!(
                "{} at {}",
                mask_text(event.fired),
                event.at.format("%Y/%m/%d %H:%M:%S%.3f")
            ),
        )?;
    }
    Ok(())
}

fn write_config(out: &mut dyn Write, config: &DeviceConfig) -> io::Result<()> {
    row(out, "Baud rate", config.baud_rate)?;
    row(out, "data bits", config.byte_size)?;
    row(out, "Parity", config.parity.as_str())?;
    row(out, "stop bits", config.stop_bits.as_str())?;
    row(out, "Parity checking", yn(config.parity_check))?;
    writeln!(out, "               * Hardware flow control *")?;
    row(out, "Out CTS flow control", yn(config.out_cts_flow))?;
    row(out, "RTS flow control", config.rts_control.as_str())?;
    row(out, "Out DSR flow control", yn(config.out_dsr_flow))?;
    row(out, "DTR flow control", config.dtr_control.as_str())?;
    row(out, "DSR sensitive", yn(config.dsr_sensitivity))?;
    writeln!(out, "              * Software flow control *")?;
    row(out, "XON/XOFF transmission", yn(config.out_x))?;
    row(out, "XON/XOFF reception", yn(config.in_x))?;
    row(out, "xon char code", format!("0x{:x}", config.xon_char))?;
    row(out, "xoff char code", format!("0x{:x}", config.xoff_char))?;
    row(out, "xon character limit", config.xon_limit)?;
    row(out, "xoff character limit", config.xoff_limit)?;
    row(out, "continue on Xoff", yn(config.tx_continue_on_xoff))?;
    writeln!(out, "                 * Other Settings *")?;
    row(out, "parity -> error char", yn(config.error_char_enabled))?;
    row(out, "discard NULL bytes", yn(config.discard_null))?;
    row(out, "abort R/W on error", yn(config.abort_on_error))?;
    row(out, "error char code", format!("0x{:x}", config.error_char))?;
    row(out, "eof char code", format!("0x{:x}", config.eof_char))?;
    row(out, "event char code", format!("0x{:x}", config.event_char))
}
