//! Port controller behaviour over the loopback backend.
//!
//! Covers the end-to-end transfer scenarios, the option round-trips and
//! the error paths that close a connection.

mod common;

use asyn_serial::interface::{EomReason, IoRequest, Status};
use asyn_serial::port::{
    normalize_device_path, EventMask, Fault, ModemStatus, PortError, ReadTimeout, WriteTimeout,
};
use common::{timed, Harness, PORT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// End-to-end transfers
// ============================================================================

mod transfer_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_echo_write_then_read() {
        // Arrange
        let h = Harness::connected();
        let octet = h.registry.find_octet(PORT).unwrap();
        let req = IoRequest::with_timeout(Duration::from_secs(2));

        // Act
        let written = octet.write(&req, b"AT\r\n");
        let mut buf = [0u8; 64];
        let read = octet.read(&req, &mut buf);

        // Assert
        assert!(written.status.is_success(), "{}", written.status);
        assert_eq!(written.transferred, 4);
        assert!(read.status.is_success(), "{}", read.status);
        assert_eq!(read.transferred, 4);
        assert_eq!(&buf[..5], b"AT\r\n\0");
        assert!(read.eom.is_empty());
    }

    #[test]
    fn test_read_without_peer_times_out() {
        let h = Harness::connected();
        h.line.set_echo(false);
        let mut buf = [0u8; 16];

        let (read, elapsed) = timed(|| {
            h.port
                .read(&IoRequest::with_timeout(Duration::from_millis(500)), &mut buf)
        });

        assert!(read.status.is_timeout(), "{}", read.status);
        assert_eq!(read.transferred, 0);
        assert!(elapsed >= Duration::from_millis(450), "{elapsed:?}");
        assert!(h.port.is_connected());
    }

    #[test]
    fn test_full_buffer_reports_cnt() {
        let h = Harness::connected();
        h.line.inject(b"0123456789");
        let mut buf = [0u8; 4];

        let read = h
            .port
            .read(&IoRequest::with_timeout(Duration::from_secs(1)), &mut buf);

        assert!(read.status.is_success());
        assert_eq!(read.transferred, 4);
        assert_eq!(read.eom, EomReason::CNT);
        assert_eq!(&buf, b"0123");
        assert_eq!(h.line.queued_input(), 6);
    }

    #[test]
    fn test_zero_capacity_read_rejected() {
        let h = Harness::connected();
        let read = h.port.read(&IoRequest::default(), &mut []);
        assert!(matches!(
            read.status.error(),
            Some(PortError::BadCapacity { capacity: 0, .. })
        ));
        assert!(h.port.is_connected());
    }

    #[test]
    fn test_break_extends_write() {
        let h = Harness::connected();
        let req = IoRequest::with_timeout(Duration::from_secs(1));

        let (plain, plain_elapsed) = timed(|| h.port.write(&req, b"ping"));
        h.port.set_option("break_duration", "50").unwrap();
        h.port.set_option("break_delay", "10").unwrap();
        let (with_break, break_elapsed) = timed(|| h.port.write(&req, b"ping"));

        assert_eq!(plain.transferred, 4);
        assert_eq!(with_break.transferred, 4);
        assert!(with_break.status.is_success(), "{}", with_break.status);
        assert!(break_elapsed >= Duration::from_millis(60), "{break_elapsed:?}");
        assert!(break_elapsed > plain_elapsed);
        assert_eq!(h.line.break_count(), 1);
        assert!(!h.line.break_asserted());
    }

    #[test]
    fn test_trickle_with_non_blocking_reads() {
        let h = Harness::connected();
        h.line.set_echo(false);
        let line = Arc::clone(&h.line);
        let done = Arc::new(AtomicBool::new(false));
        let producer_done = Arc::clone(&done);
        let producer = std::thread::spawn(move || {
            for _ in 0..40 {
                line.inject(b"x");
                std::thread::sleep(Duration::from_millis(5));
            }
            producer_done.store(true, Ordering::Release);
        });

        let mut received = 0;
        let mut buf = [0u8; 8];
        let give_up = Instant::now() + Duration::from_secs(5);
        while received < 40 && Instant::now() < give_up {
            let read = h.port.read(&IoRequest::non_blocking(), &mut buf);
            if read.transferred > 0 {
                assert!(read.status.is_success(), "{}", read.status);
            } else {
                assert!(read.status.is_timeout(), "{}", read.status);
            }
            received += read.transferred;
        }
        producer.join().unwrap();

        assert!(done.load(Ordering::Acquire));
        assert_eq!(received, 40);
    }

    #[test]
    fn test_kept_timeout_reuses_programmed_value() {
        let h = Harness::connected();
        h.line.set_echo(false);
        let mut buf = [0u8; 8];

        let first = h
            .port
            .read(&IoRequest::with_timeout(Duration::from_millis(150)), &mut buf);
        assert!(first.status.is_timeout());
        assert_eq!(
            h.line.timeouts().read,
            ReadTimeout::Total(Duration::from_millis(150))
        );

        let (second, elapsed) = timed(|| h.port.read(&IoRequest::keep_timeout(), &mut buf));
        assert!(second.status.is_timeout());
        assert!(elapsed >= Duration::from_millis(140), "{elapsed:?}");
        assert_eq!(
            h.line.timeouts().read,
            ReadTimeout::Total(Duration::from_millis(150))
        );

        h.line.inject(b"ok");
        let third = h.port.read(&IoRequest::keep_timeout(), &mut buf);
        assert!(third.status.is_success());
        assert_eq!(&buf[..third.transferred], b"ok");
    }
}

// ============================================================================
// Write timeouts
// ============================================================================

mod write_timeout_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stalled_port(queue: &str) -> Harness {
        let h = Harness::connected();
        h.port.set_option("wbuff", queue).unwrap();
        h.line.set_draining(false);
        h
    }

    #[test]
    fn test_stalled_line_times_out_with_partial_count() {
        let h = stalled_port("16");
        let data = [0x55u8; 64];

        for timeout in [Duration::from_millis(100), Duration::from_millis(250)] {
            let (out, elapsed) = timed(|| h.port.write(&IoRequest::with_timeout(timeout), &data));

            assert!(out.status.is_timeout(), "{}", out.status);
            assert!(out.transferred < data.len());
            assert!(out.transferred <= h.line.queued_output());
            assert!(elapsed >= timeout, "{elapsed:?} < {timeout:?}");
            assert!(h.port.is_connected());
        }
        assert_eq!(
            h.line.timeouts().write,
            WriteTimeout::Total(Duration::from_millis(350))
        );
    }

    #[test]
    fn test_zero_timeout_write_never_blocks() {
        let h = stalled_port("8");
        let data = [0xaau8; 32];

        let (out, elapsed) = timed(|| h.port.write(&IoRequest::non_blocking(), &data));

        assert!(out.status.is_timeout(), "{}", out.status);
        assert_eq!(out.transferred, 8);
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    }

    #[test]
    fn test_zero_length_write_succeeds() {
        let h = Harness::connected();
        let out = h.port.write(&IoRequest::default(), &[]);
        assert!(out.status.is_success());
        assert_eq!(out.transferred, 0);
        assert_eq!(h.port.bytes_written(), 0);
    }

    #[test]
    fn test_zero_length_write_still_requires_connection() {
        let h = Harness::disconnected();
        let out = h.port.write(&IoRequest::default(), &[]);
        assert!(matches!(out.status, Status::Error(PortError::Disconnected { .. })));
    }

    #[test]
    fn test_resumed_line_completes_pending_write() {
        let h = stalled_port("4");
        let line = Arc::clone(&h.line);
        let resume = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            line.set_draining(true);
        });

        let out = h
            .port
            .write(&IoRequest::with_timeout(Duration::from_secs(2)), b"abcdefgh");
        resume.join().unwrap();

        assert!(out.status.is_success(), "{}", out.status);
        assert_eq!(out.transferred, 8);
    }
}

// ============================================================================
// Kept timeouts before any value is programmed
// ============================================================================

mod unprogrammed_timeout_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kept_timeout_read_right_after_connect_is_bounded() {
        let h = Harness::connected();
        h.line.set_echo(false);
        let mut buf = [0u8; 8];

        let (read, elapsed) = timed(|| h.port.read(&IoRequest::keep_timeout(), &mut buf));

        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
        assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
        assert!(
            matches!(read.status, Status::Error(PortError::WaitElapsed { op: "read", .. })),
            "{}",
            read.status
        );
        assert_eq!(read.transferred, 0);
        assert!(!h.port.is_connected());
    }

    #[test]
    fn test_kept_timeout_write_right_after_connect_is_bounded() {
        let h = Harness::connected();
        h.port.set_option("wbuff", "4").unwrap();
        h.line.set_draining(false);

        let (out, elapsed) = timed(|| h.port.write(&IoRequest::keep_timeout(), &[0x33; 32]));

        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
        assert!(
            matches!(out.status, Status::Error(PortError::WaitElapsed { op: "write", .. })),
            "{}",
            out.status
        );
        assert!(out.transferred < 32);
        assert!(!h.port.is_connected());
        assert!(!h.registry.is_connected(PORT));
    }

    #[test]
    fn test_kept_timeout_read_with_pending_input_succeeds() {
        let h = Harness::connected();
        h.line.inject(b"hi");
        let mut buf = [0u8; 8];

        let read = h.port.read(&IoRequest::keep_timeout(), &mut buf);

        assert!(read.status.is_success(), "{}", read.status);
        assert_eq!(&buf[..read.transferred], b"hi");
        assert!(h.port.is_connected());
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

mod lifecycle_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_disconnect_is_idempotent() {
        let h = Harness::connected();
        h.port.disconnect().unwrap();
        h.port.disconnect().unwrap();
        assert!(!h.port.is_connected());
        assert!(!h.line.is_open());
        assert!(!h.registry.is_connected(PORT));
    }

    #[test]
    fn test_reconnect_preserves_counters() {
        let h = Harness::connected();
        let req = IoRequest::with_timeout(Duration::from_secs(1));
        let mut buf = [0u8; 16];
        h.port.write(&req, b"hello");
        h.port.read(&req, &mut buf);
        assert_eq!((h.port.bytes_written(), h.port.bytes_read()), (5, 5));

        h.port.disconnect().unwrap();
        let read = h.port.read(&req, &mut buf);
        let err = read.status.error().expect("read must fail");
        assert_eq!(
            err.to_string(),
            format!("{} disconnected", normalize_device_path("loop0"))
        );

        h.port.connect().unwrap();
        assert!(h.registry.is_connected(PORT));
        assert!(h.port.write(&req, b"again").status.is_success());
        let read = h.port.read(&req, &mut buf);
        assert!(read.status.is_success());
        assert_eq!(&buf[..read.transferred], b"again");
        assert_eq!((h.port.bytes_written(), h.port.bytes_read()), (10, 10));
    }

    #[test]
    fn test_counters_never_decrease() {
        let h = Harness::connected();
        let req = IoRequest::with_timeout(Duration::from_millis(50));
        let mut buf = [0u8; 8];
        let mut last = (0, 0);
        for round in 0..5 {
            if round % 2 == 0 {
                h.port.write(&req, b"abc");
            }
            h.port.read(&req, &mut buf);
            if round == 3 {
                h.port.disconnect().unwrap();
                h.port.connect().unwrap();
            }
            let now = (h.port.bytes_written(), h.port.bytes_read());
            assert!(now.0 >= last.0 && now.1 >= last.1, "{now:?} < {last:?}");
            last = now;
        }
    }

    #[test]
    fn test_write_fault_closes_connection() {
        let h = Harness::connected();
        h.line.inject_fault(Fault::Write);

        let out = h
            .port
            .write(&IoRequest::with_timeout(Duration::from_secs(1)), b"x");

        assert!(out.status.is_error());
        assert!(out.status.error().is_some_and(PortError::is_fatal));
        assert!(!h.port.is_connected());
        assert!(!h.registry.is_connected(PORT));
        let again = h.port.write(&IoRequest::default(), b"x");
        assert!(matches!(again.status, Status::Error(PortError::Disconnected { .. })));
    }

    #[test]
    fn test_read_fault_closes_connection() {
        let h = Harness::connected();
        h.line.inject(b"data");
        h.line.inject_fault(Fault::Read);
        let mut buf = [0u8; 8];

        let read = h
            .port
            .read(&IoRequest::with_timeout(Duration::from_secs(1)), &mut buf);

        assert!(read.status.is_error());
        assert!(!h.port.is_connected());
    }

    #[test]
    fn test_monitor_failure_leaves_connection_open() {
        let h = Harness::connected();
        // The monitor re-arms its wait after each notification; the next
        // arm picks up the fault and the monitor exits.
        h.line.inject_fault(Fault::EventWait);
        h.line.inject(b"z");
        let give_up = Instant::now() + Duration::from_secs(2);
        while h.port.monitor_running() && Instant::now() < give_up {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(!h.port.monitor_running());
        assert!(h.port.is_connected());
        let mut buf = [0u8; 4];
        let read = h
            .port
            .read(&IoRequest::with_timeout(Duration::from_millis(200)), &mut buf);
        assert!(read.status.is_success(), "{}", read.status);
        assert_eq!(&buf[..read.transferred], b"z");
    }

    #[test]
    fn test_absent_device_fails_connect() {
        let h = Harness::disconnected();
        h.line.set_present(false);
        let err = h.port.connect().unwrap_err();
        assert!(matches!(err, PortError::Open { .. }));
        assert!(err.to_string().contains("can't open"));

        h.line.set_present(true);
        h.port.connect().unwrap();
        assert!(h.port.is_connected());
    }
}

// ============================================================================
// Options
// ============================================================================

mod option_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_line_settings_round_trip() {
        let h = Harness::connected();
        h.port.set_option("baud", "19200").unwrap();
        h.port.set_option("parity", "EVEN").unwrap();
        h.port.set_option("bits", "7").unwrap();

        assert_eq!(h.port.get_option("baud").unwrap(), "19200");
        assert_eq!(h.port.get_option("parity").unwrap(), "even");
        assert_eq!(h.port.get_option("bits").unwrap(), "7");
        assert_eq!(h.line.config().baud_rate, 19200);
    }

    #[test]
    fn test_every_readable_key_round_trips() {
        let h = Harness::connected();
        let cases = [
            ("baud", "115200", "115200"),
            ("bits", "8", "8"),
            ("parity", "odd", "odd"),
            ("stop", "2", "2"),
            ("stop", "1.5", "1.5"),
            ("clocal", "y", "Y"),
            ("clocal", "N", "N"),
            ("clocal", "D", "D"),
            ("crtscts", "Y", "Y"),
            ("crtscts", "n", "N"),
            ("crtscts", "D", "D"),
            ("ixon", "Y", "Y"),
            ("ixoff", "n", "N"),
            ("break_duration", "25", "25"),
            ("break_delay", "5", "5"),
            ("rbuff", "2048", "2048"),
            ("wbuff", "1024", "1024"),
            ("flush", "Y", "Y"),
            ("eventmask", "0x1ff", "0x1ff"),
        ];
        for (key, value, expected) in cases {
            h.port.set_option(key, value).unwrap();
            assert_eq!(h.port.get_option(key).unwrap(), expected, "key {key}");
        }
        assert_eq!(h.port.get_option("IXANY").unwrap(), "N");
    }

    #[test]
    fn test_unknown_key_leaves_config_unchanged() {
        let h = Harness::connected();
        let before = h.line.config();

        let set = h.port.set_option("notakey", "x").unwrap_err();
        let get = h.port.get_option("notakey").unwrap_err();

        assert_eq!(set.to_string(), "Unsupported key \"notakey\"");
        assert!(matches!(get, PortError::UnsupportedKey(_)));
        assert_eq!(h.line.config(), before);
    }

    #[test]
    fn test_invalid_values_leave_config_unchanged() {
        let h = Harness::connected();
        let before = h.line.config();
        for (key, value) in [("baud", "fast"), ("bits", "9"), ("parity", "sometimes")] {
            assert!(h.port.set_option(key, value).is_err(), "{key}={value}");
        }
        assert!(matches!(
            h.port.set_option("ixany", "Y"),
            Err(PortError::UnsupportedOption { .. })
        ));
        assert_eq!(h.line.config(), before);
    }

    #[test]
    fn test_options_require_connection() {
        let h = Harness::disconnected();
        assert!(matches!(
            h.port.get_option("baud"),
            Err(PortError::Disconnected { .. })
        ));
        assert!(matches!(
            h.port.set_option("baud", "9600"),
            Err(PortError::Disconnected { .. })
        ));
    }

    #[test]
    fn test_eventmask_keeps_required_bits() {
        let h = Harness::connected();
        h.port.set_option("eventmask", "0x8").unwrap();

        assert_eq!(
            h.line.event_mask(),
            EventMask::CTS | EventMask::RXCHAR | EventMask::ERR
        );
        assert_eq!(h.port.get_option("eventmask").unwrap(), "0x8");

        h.port.set_option("eventmask", "0").unwrap();
        assert_eq!(h.line.event_mask(), EventMask::RXCHAR | EventMask::ERR);
        assert_eq!(h.port.get_option("eventmask").unwrap(), "0x0");
    }

    #[test]
    fn test_requested_mask_survives_reconnect() {
        let h = Harness::connected();
        h.port.set_option("eventmask", "0x1").unwrap();
        h.port.disconnect().unwrap();
        h.port.connect().unwrap();

        assert_eq!(h.port.get_option("eventmask").unwrap(), "0x1");
        assert_eq!(h.line.event_mask(), EventMask::RXCHAR | EventMask::ERR);
    }

    #[test]
    fn test_escape_drives_modem_lines() {
        let h = Harness::connected();
        h.port.set_option("escape", "setdtr").unwrap();
        h.port.set_option("escape", "setrts").unwrap();

        let mut report = Vec::new();
        h.port.report(&mut report, 2).unwrap();
        let text = String::from_utf8(report).unwrap();
        assert!(text.contains("CTS: ON"), "{text}");
        assert!(text.contains("DSR: ON"), "{text}");

        assert!(matches!(
            h.port.get_option("escape"),
            Err(PortError::WriteOnly { .. })
        ));
    }

    #[test]
    fn test_purge_discards_input() {
        let h = Harness::connected();
        h.line.inject(b"stale");
        h.port.set_option("purge", "rxclear").unwrap();
        assert_eq!(h.line.queued_input(), 0);

        h.line.inject(b"stale again");
        h.port.flush().unwrap();
        assert_eq!(h.line.queued_input(), 0);
    }
}

// ============================================================================
// Reports
// ============================================================================

mod report_tests {
    use super::*;

    fn report(h: &Harness, level: u32) -> String {
        let mut out = Vec::new();
        h.registry.report(&mut out, level, Some(PORT)).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_level_zero_shows_connection_only() {
        let h = Harness::connected();
        let text = report(&h, 0);
        assert!(text.contains(&format!(
            "Serial line {}: Connected",
            normalize_device_path("loop0")
        )));
        assert!(!text.contains("Characters written"));
    }

    #[test]
    fn test_level_two_details() {
        let h = Harness::connected();
        h.line.set_modem_lines(ModemStatus {
            cts: true,
            ..ModemStatus::default()
        });
        let text = report(&h, 2);

        for section in [
            "Characters written",
            "*** Port Configuration ***",
            "*** Port Properties ***",
            "*** Port Status ***",
            "*** Modem control line Status ***",
            "CTS: ON",
            "RI: OFF",
            "event mask",
        ] {
            assert!(text.contains(section), "missing {section}:\n{text}");
        }
        assert!(!text.contains("WARNING"));
    }

    #[test]
    fn test_state_mismatch_warning() {
        let h = Harness::connected();
        h.line.desync_state();
        let text = report(&h, 2);
        assert!(text.contains("configuration and state queries disagree"), "{text}");
    }

    #[test]
    fn test_disconnected_report_skips_device_queries() {
        let h = Harness::disconnected();
        let text = report(&h, 2);
        assert!(text.contains("Disconnected"));
        assert!(!text.contains("*** Port Configuration ***"));
    }
}
