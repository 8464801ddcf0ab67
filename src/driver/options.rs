//! Named string options and their mapping onto the device record.
//!
//! Parsing is separated from application: [`parse_change`] validates a
//! `(key, value)` pair against a freshly fetched configuration and returns
//! the complete change to apply, so a rejected value never leaves a partial
//! mutation behind. [`render`] produces the canonical text for `get`.

use crate::port::{
    CommProperties, DeviceConfig, DtrControl, EscapeFunction, EventMask, Parity, PortError,
    PortResult, PurgeFlags, RtsControl, StopBits,
};

/// Recognised option keys. Matching is case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKey {
    Baud,
    Bits,
    Parity,
    Stop,
    Clocal,
    Crtscts,
    Ixon,
    Ixoff,
    Ixany,
    BreakDuration,
    BreakDelay,
    Rbuff,
    Wbuff,
    Flush,
    EventMask,
    Purge,
    Escape,
}

impl OptionKey {
    pub const ALL: [OptionKey; 17] = [
        OptionKey::Baud,
        OptionKey::Bits,
        OptionKey::Parity,
        OptionKey::Stop,
        OptionKey::Clocal,
        OptionKey::Crtscts,
        OptionKey::Ixon,
        OptionKey::Ixoff,
        OptionKey::Ixany,
        OptionKey::BreakDuration,
        OptionKey::BreakDelay,
        OptionKey::Rbuff,
        OptionKey::Wbuff,
        OptionKey::Flush,
        OptionKey::EventMask,
        OptionKey::Purge,
        OptionKey::Escape,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OptionKey::Baud => "baud",
            OptionKey::Bits => "bits",
            OptionKey::Parity => "parity",
            OptionKey::Stop => "stop",
            OptionKey::Clocal => "clocal",
            OptionKey::Crtscts => "crtscts",
            OptionKey::Ixon => "ixon",
            OptionKey::Ixoff => "ixoff",
            OptionKey::Ixany => "ixany",
            OptionKey::BreakDuration => "break_duration",
            OptionKey::BreakDelay => "break_delay",
            OptionKey::Rbuff => "rbuff",
            OptionKey::Wbuff => "wbuff",
            OptionKey::Flush => "flush",
            OptionKey::EventMask => "eventmask",
            OptionKey::Purge => "purge",
            OptionKey::Escape => "escape",
        }
    }

    pub fn parse(key: &str) -> PortResult<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(key))
            .ok_or_else(|| PortError::UnsupportedKey(key.to_string()))
    }
}

/// A validated `set`, ready to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionChange {
    /// Write the whole record back.
    Config(DeviceConfig),
    /// Resize the driver queues.
    Queues { rx: u32, tx: u32 },
    BreakDuration(u32),
    BreakDelay(u32),
    FlushOnWrite(bool),
    /// The caller's requested notification mask.
    EventMask(EventMask),
    Purge(PurgeFlags),
    Escape(EscapeFunction),
}

/// Everything `get` may render from.
#[derive(Debug, Clone, Copy)]
pub struct OptionSnapshot<'a> {
    pub config: &'a DeviceConfig,
    pub properties: &'a CommProperties,
    pub break_duration_ms: u32,
    pub break_delay_ms: u32,
    pub flush_on_write: bool,
    pub requested_mask: EventMask,
}

fn yes_no(key: OptionKey, value: &str) -> PortResult<bool> {
    if value.eq_ignore_ascii_case("y") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("n") {
        Ok(false)
    } else {
        Err(invalid(key, value))
    }
}

fn invalid(key: OptionKey, value: &str) -> PortError {
    PortError::InvalidValue {
        key: key.as_str(),
        value: value.to_string(),
    }
}

fn number(key: OptionKey, value: &str) -> PortResult<u32> {
    value.trim().parse::<u32>().map_err(|_| PortError::BadNumber {
        key: key.as_str(),
        value: value.to_string(),
    })
}

fn positive(key: OptionKey, value: &str) -> PortResult<u32> {
    match number(key, value)? {
        0 => Err(PortError::BadNumber {
            key: key.as_str(),
            value: value.to_string(),
        }),
        n => Ok(n),
    }
}

/// Parse a hex mask, with or without a `0x` prefix.
pub fn parse_event_mask(value: &str) -> PortResult<EventMask> {
    let digits = value.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    let bits = u32::from_str_radix(digits, 16).map_err(|_| PortError::BadNumber {
        key: OptionKey::EventMask.as_str(),
        value: value.to_string(),
    })?;
    EventMask::from_bits(bits).ok_or_else(|| invalid(OptionKey::EventMask, value))
}

fn named<T: Copy>(key: OptionKey, value: &str, table: &[(&str, T)]) -> PortResult<T> {
    table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(value))
        .map(|&(_, v)| v)
        .ok_or_else(|| invalid(key, value))
}

/// Validate `value` for `key` against the current device state.
pub fn parse_change(
    key: OptionKey,
    value: &str,
    current: &DeviceConfig,
    properties: &CommProperties,
) -> PortResult<OptionChange> {
    let mut config = current.clone();
    match key {
        OptionKey::Baud => config.baud_rate = positive(key, value)?,
        OptionKey::Bits => {
            let bits = number(key, value)?;
            if !(5..=8).contains(&bits) {
                return Err(invalid(key, value));
            }
            config.byte_size = bits as u8;
        }
        OptionKey::Parity => {
            config.parity = named(
                key,
                value,
                &[
                    ("none", Parity::None),
                    ("odd", Parity::Odd),
                    ("even", Parity::Even),
                    ("mark", Parity::Mark),
                    ("space", Parity::Space),
                ],
            )?;
            config.parity_check = config.parity != Parity::None;
        }
        OptionKey::Stop => {
            config.stop_bits = named(
                key,
                value,
                &[
                    ("1", StopBits::One),
                    ("1.5", StopBits::OnePointFive),
                    ("2", StopBits::Two),
                ],
            )?;
        }
        OptionKey::Clocal => {
            let (dsr_flow, dtr) = named(
                key,
                value,
                &[
                    ("y", (false, DtrControl::Enable)),
                    ("n", (true, DtrControl::Handshake)),
                    ("d", (false, DtrControl::Disable)),
                ],
            )?;
            config.out_dsr_flow = dsr_flow;
            config.dsr_sensitivity = dsr_flow;
            config.dtr_control = dtr;
        }
        OptionKey::Crtscts => {
            let (cts_flow, rts) = named(
                key,
                value,
                &[
                    ("y", (true, RtsControl::Handshake)),
                    ("n", (false, RtsControl::Enable)),
                    ("d", (false, RtsControl::Disable)),
                ],
            )?;
            config.out_cts_flow = cts_flow;
            config.rts_control = rts;
        }
        OptionKey::Ixon => config.out_x = yes_no(key, value)?,
        OptionKey::Ixoff => config.in_x = yes_no(key, value)?,
        OptionKey::Ixany => return Err(PortError::UnsupportedOption { key: key.as_str() }),
        OptionKey::BreakDuration => return Ok(OptionChange::BreakDuration(number(key, value)?)),
        OptionKey::BreakDelay => return Ok(OptionChange::BreakDelay(number(key, value)?)),
        OptionKey::Rbuff => {
            return Ok(OptionChange::Queues {
                rx: positive(key, value)?,
                tx: properties.current_tx_queue,
            })
        }
        OptionKey::Wbuff => {
            return Ok(OptionChange::Queues {
                rx: properties.current_rx_queue,
                tx: positive(key, value)?,
            })
        }
        OptionKey::Flush => return Ok(OptionChange::FlushOnWrite(yes_no(key, value)?)),
        OptionKey::EventMask => return Ok(OptionChange::EventMask(parse_event_mask(value)?)),
        OptionKey::Purge => {
            return Ok(OptionChange::Purge(named(
                key,
                value,
                &[
                    ("rxclear", PurgeFlags::RXCLEAR),
                    ("txclear", PurgeFlags::TXCLEAR),
                    ("rxabort", PurgeFlags::RXABORT),
                    ("txabort", PurgeFlags::TXABORT),
                ],
            )?))
        }
        OptionKey::Escape => {
            return Ok(OptionChange::Escape(named(
                key,
                value,
                &[
                    ("clrbreak", EscapeFunction::ClrBreak),
                    ("clrdtr", EscapeFunction::ClrDtr),
                    ("clrrts", EscapeFunction::ClrRts),
                    ("setbreak", EscapeFunction::SetBreak),
                    ("setdtr", EscapeFunction::SetDtr),
                    ("setrts", EscapeFunction::SetRts),
                    ("setxoff", EscapeFunction::SetXoff),
                    ("setxon", EscapeFunction::SetXon),
                ],
            )?))
        }
    }
    Ok(OptionChange::Config(config))
}

fn flag(on: bool) -> String {
    let text = if on { "Y" } else { "N" };
    text.to_string()
}

fn clocal_text(config: &DeviceConfig) -> &'static str {
    if config.out_dsr_flow {
        "N"
    } else if config.dtr_control == DtrControl::Disable {
        "D"
    } else {
        "Y"
    }
}

fn crtscts_text(config: &DeviceConfig) -> &'static str {
    if config.out_cts_flow {
        "Y"
    } else if config.rts_control == RtsControl::Disable {
        "D"
    } else {
        "N"
    }
}

/// Canonical text for `key`.
pub fn render(key: OptionKey, snap: &OptionSnapshot<'_>) -> PortResult<String> {
    let config = snap.config;
    let text = match key {
        OptionKey::Baud => config.baud_rate.to_string(),
        OptionKey::Bits => config.byte_size.to_string(),
        OptionKey::Parity => config.parity.as_str().to_string(),
        OptionKey::Stop => config.stop_bits.as_str().to_string(),
        OptionKey::Clocal => clocal_text(config).to_string(),
        OptionKey::Crtscts => crtscts_text(config).to_string(),
        OptionKey::Ixon => flag(config.out_x),
        OptionKey::Ixoff => flag(config.in_x),
        OptionKey::Ixany => flag(false),
        OptionKey::BreakDuration => snap.break_duration_ms.to_string(),
        OptionKey::BreakDelay => snap.break_delay_ms.to_string(),
        OptionKey::Rbuff => snap.properties.current_rx_queue.to_string(),
        OptionKey::Wbuff => snap.properties.current_tx_queue.to_string(),
        OptionKey::Flush => flag(snap.flush_on_write),
        OptionKey::EventMask => format!("0x{:x}", snap.requested_mask.bits()),
        OptionKey::Purge | OptionKey::Escape => {
            return Err(PortError::WriteOnly { key: key.as_str() })
        }
    };
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn props() -> CommProperties {
        CommProperties {
            max_rx_queue: 65536,
            max_tx_queue: 65536,
            current_rx_queue: 4096,
            current_tx_queue: 2048,
        }
    }

    fn apply(key: &str, value: &str, config: &DeviceConfig) -> DeviceConfig {
        match parse_change(OptionKey::parse(key).unwrap(), value, config, &props()).unwrap() {
            OptionChange::Config(c) => c,
            other => panic!("expected config change, got {other:?}"),
        }
    }

    fn get(key: &str, config: &DeviceConfig) -> String {
        let props = props();
        let snap = OptionSnapshot {
            config,
            properties: &props,
            break_duration_ms: 0,
            break_delay_ms: 0,
            flush_on_write: false,
            requested_mask: EventMask::ERR,
        };
        render(OptionKey::parse(key).unwrap(), &snap).unwrap()
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        assert_eq!(OptionKey::parse("BAUD").unwrap(), OptionKey::Baud);
        assert_eq!(OptionKey::parse("Break_Delay").unwrap(), OptionKey::BreakDelay);
        let err = OptionKey::parse("notakey").unwrap_err();
        assert_eq!(err.to_string(), "Unsupported key \"notakey\"");
    }

    #[test]
    fn test_config_round_trips() {
        let base = DeviceConfig::default();
        let cases = [
            ("baud", "19200", "19200"),
            ("bits", "7", "7"),
            ("parity", "EVEN", "even"),
            ("parity", "mark", "mark"),
            ("stop", "1.5", "1.5"),
            ("stop", "2", "2"),
            ("clocal", "n", "N"),
            ("clocal", "D", "D"),
            ("clocal", "Y", "Y"),
            ("crtscts", "Y", "Y"),
            ("crtscts", "d", "D"),
            ("crtscts", "N", "N"),
            ("ixon", "Y", "Y"),
            ("ixoff", "y", "Y"),
        ];
        for (key, value, expected) in cases {
            let config = apply(key, value, &base);
            assert_eq!(get(key, &config), expected, "{key}={value}");
        }
    }

    #[test]
    fn test_change_preserves_other_fields() {
        let mut base = DeviceConfig::default();
        base.xon_limit = 77;
        base.out_x = true;
        let config = apply("baud", "115200", &base);
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.xon_limit, 77);
        assert!(config.out_x);
    }

    #[test]
    fn test_clocal_sets_dsr_handshake() {
        let config = apply("clocal", "N", &DeviceConfig::default());
        assert!(config.out_dsr_flow);
        assert!(config.dsr_sensitivity);
        assert_eq!(config.dtr_control, DtrControl::Handshake);
    }

    #[test]
    fn test_rejects_bad_values() {
        let base = DeviceConfig::default();
        let p = props();
        let bad = [
            ("baud", "fast"),
            ("baud", "0"),
            ("bits", "9"),
            ("bits", "x"),
            ("parity", "sometimes"),
            ("stop", "3"),
            ("clocal", "maybe"),
            ("ixon", "yes"),
            ("break_duration", "-5"),
            ("rbuff", "0"),
            ("flush", "1"),
            ("eventmask", "zz"),
            ("eventmask", "0x1000"),
            ("purge", "everything"),
            ("escape", "setfoo"),
        ];
        for (key, value) in bad {
            let key = OptionKey::parse(key).unwrap();
            assert!(
                parse_change(key, value, &base, &p).is_err(),
                "{key:?}={value} accepted"
            );
        }
    }

    #[test]
    fn test_ixany_is_unsupported() {
        let err = parse_change(OptionKey::Ixany, "Y", &DeviceConfig::default(), &props())
            .unwrap_err();
        assert!(matches!(err, PortError::UnsupportedOption { key: "ixany" }));
        assert_eq!(get("ixany", &DeviceConfig::default()), "N");
    }

    #[test]
    fn test_queue_changes_keep_other_direction() {
        let change =
            parse_change(OptionKey::Rbuff, "8192", &DeviceConfig::default(), &props()).unwrap();
        assert_eq!(change, OptionChange::Queues { rx: 8192, tx: 2048 });
        let change =
            parse_change(OptionKey::Wbuff, "512", &DeviceConfig::default(), &props()).unwrap();
        assert_eq!(change, OptionChange::Queues { rx: 4096, tx: 512 });
    }

    #[test]
    fn test_event_mask_parsing() {
        assert_eq!(parse_event_mask("0x19").unwrap().bits(), 0x19);
        assert_eq!(parse_event_mask("80").unwrap(), EventMask::ERR);
        assert_eq!(parse_event_mask("0X1").unwrap(), EventMask::RXCHAR);
        assert!(parse_event_mask("").is_err());
    }

    #[test]
    fn test_action_keys_are_write_only() {
        let config = DeviceConfig::default();
        let props = props();
        let snap = OptionSnapshot {
            config: &config,
            properties: &props,
            break_duration_ms: 50,
            break_delay_ms: 10,
            flush_on_write: true,
            requested_mask: EventMask::CTS | EventMask::ERR,
        };
        assert!(matches!(
            render(OptionKey::Purge, &snap),
            Err(PortError::WriteOnly { .. })
        ));
        assert_eq!(render(OptionKey::BreakDuration, &snap).unwrap(), "50");
        assert_eq!(render(OptionKey::Flush, &snap).unwrap(), "Y");
        assert_eq!(render(OptionKey::EventMask, &snap).unwrap(), "0x88");
        assert_eq!(render(OptionKey::Wbuff, &snap).unwrap(), "2048");
    }

    #[test]
    fn test_action_parsing() {
        let config = DeviceConfig::default();
        assert_eq!(
            parse_change(OptionKey::Purge, "RXCLEAR", &config, &props()).unwrap(),
            OptionChange::Purge(PurgeFlags::RXCLEAR)
        );
        assert_eq!(
            parse_change(OptionKey::Escape, "setdtr", &config, &props()).unwrap(),
            OptionChange::Escape(EscapeFunction::SetDtr)
        );
    }
}
