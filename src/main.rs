use asyn_serial::config::ConfigLoader;
use asyn_serial::interface::{IoRequest, ReadOutcome, WriteOutcome};
use asyn_serial::interpose::{configure_strip, configure_throttle};
use asyn_serial::logging::{init_logging, verbosity_level};
use asyn_serial::port::{DeviceDriver, LoopbackDriver, NativeDriver};
use asyn_serial::registry::{configure_ports, configure_serial_port, PortAttributes, PortRegistry};
use asyn_serial::timer::TimerQueue;
use asyn_serial::AppError;
use clap::Parser;
use serde_json::json;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Registry name of the port this client drives.
const PORT: &str = "L0";

/// Capacity of the response buffer.
const INPUT_CAPACITY: usize = 10_000;

// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    name = "serial-port-client",
    version,
    about = "Write a string to a serial port and read the response.",
    long_about = "Configures port L0 on the given device, applies line options, writes the \
                  output string (with an optional terminator) and reads one response."
)]
struct Args {
    /// Serial device, e.g. COM3 or ttyUSB0
    port: String,

    /// String to write
    output: Option<String>,

    /// Output terminator, C escapes allowed (e.g. "\r\n")
    output_eos: Option<String>,

    /// Input terminator, C escapes allowed
    input_eos: Option<String>,

    /// Print port reports of this level before write, before read and at the end
    #[arg(long, value_name = "LEVEL")]
    report: Option<u32>,

    /// Do not read after the write
    #[arg(long)]
    noread: bool,

    /// Read and write timeout in seconds; negative keeps the OS timeouts
    #[arg(long, value_name = "SECS", allow_negative_numbers = true)]
    timeout: Option<f64>,

    /// Use an in-memory echo line instead of a real device
    #[arg(long)]
    loopback: bool,

    /// Print a JSON summary instead of text
    #[arg(long)]
    json: bool,

    /// Bytes to strip from every read, C escapes allowed
    #[arg(long, value_name = "CHARS")]
    strip_in: Option<String>,

    /// Minimum seconds between writes
    #[arg(long, value_name = "SECS")]
    throttle: Option<f64>,

    /// Configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Data bits
    #[arg(long)]
    bits: Option<u8>,

    /// Parity: none, odd, even, mark or space
    #[arg(long)]
    parity: Option<String>,

    /// Stop bits: 1, 1.5 or 2
    #[arg(long)]
    stop: Option<String>,

    /// DSR/DTR handshake: Y, N or D
    #[arg(long)]
    clocal: Option<String>,

    /// RTS/CTS handshake: Y, N or D
    #[arg(long)]
    crtscts: Option<String>,

    /// Software flow control on output: Y or N
    #[arg(long)]
    ixon: Option<String>,

    /// Software flow control on input: Y or N
    #[arg(long)]
    ixoff: Option<String>,

    /// Break duration in milliseconds
    #[arg(long = "break-duration")]
    break_duration: Option<u32>,

    /// Delay after break in milliseconds
    #[arg(long = "break-delay")]
    break_delay: Option<u32>,

    /// Event mask in hex, 0x1FF enables all
    #[arg(long)]
    eventmask: Option<String>,

    /// Flush after write: Y or N
    #[arg(long)]
    flush: Option<String>,
}

impl Args {
    /// Option key/value pairs given on the command line, in key order.
    fn options(&self) -> Vec<(&'static str, String)> {
        let options = vec![
            ("baud", self.baud.map(|v| v.to_string())),
            ("bits", self.bits.map(|v| v.to_string())),
            ("break_delay", self.break_delay.map(|v| v.to_string())),
            ("break_duration", self.break_duration.map(|v| v.to_string())),
            ("clocal", self.clocal.clone()),
            ("crtscts", self.crtscts.clone()),
            ("eventmask", self.eventmask.clone()),
            ("flush", self.flush.clone()),
            ("ixoff", self.ixoff.clone()),
            ("ixon", self.ixon.clone()),
            ("parity", self.parity.clone()),
            ("stop", self.stop.clone()),
        ];
        options
            .into_iter()
            .filter_map(|(key, value)| value.filter(|v| !v.is_empty()).map(|v| (key, v)))
            .collect()
    }
}

/// Decode C-style escapes: `\r \n \t \0 \\ \' \" \a \b \f \v \e`, `\xHH`
/// and up to three octal digits.
fn unescape(text: &str) -> Result<Vec<u8>, AppError> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let Some(&code) = bytes.get(i + 1) else {
            return Err(AppError::InvalidArgument(format!(
                "trailing backslash in \"{text}\""
            )));
        };
        i += 2;
        let byte = match code {
            b'r' => b'\r',
            b'n' => b'\n',
            b't' => b'\t',
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'v' => 0x0b,
            b'e' => 0x1b,
            b'\\' | b'\'' | b'"' | b'?' => code,
            b'x' => {
                let digits: Vec<u8> = bytes[i..]
                    .iter()
                    .take(2)
                    .take_while(|b| b.is_ascii_hexdigit())
                    .copied()
                    .collect();
                if digits.is_empty() {
                    return Err(AppError::InvalidArgument(format!(
                        "\\x without hex digits in \"{text}\""
                    )));
                }
                i += digits.len();
                hex_value(&digits)
            }
            b'0'..=b'7' => {
                let start = i - 1;
                let len = bytes[start..]
                    .iter()
                    .take(3)
                    .take_while(|b| (b'0'..=b'7').contains(b))
                    .count();
                i = start + len;
                bytes[start..start + len]
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0')) as u8
            }
            other => other,
        };
        out.push(byte);
    }
    Ok(out)
}

fn hex_value(digits: &[u8]) -> u8 {
    digits.iter().fold(0u8, |acc, b| {
        let nibble = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            _ => b - b'A' + 10,
        };
        (acc << 4) | nibble
    })
}

fn seconds(value: f64, what: &str) -> Result<Duration, AppError> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| AppError::InvalidArgument(format!("{what} {value}: {e}")))
}

fn print_report(registry: &PortRegistry, level: Option<u32>, heading: &str) -> Result<(), AppError> {
    if let Some(level) = level {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "\n--- Report {heading} ---\n")?;
        registry.report(&mut out, level, Some(PORT))?;
    }
    Ok(())
}

fn run(args: Args) -> Result<(), AppError> {
    let loader = match &args.config {
        Some(path) => ConfigLoader::load_from(path)?,
        None => ConfigLoader::load()?,
    };
    let config = loader.into_config();
    init_logging(&config.logging, verbosity_level(args.verbose))?;

    let driver: Arc<dyn DeviceDriver> = if args.loopback {
        Arc::new(LoopbackDriver::new())
    } else {
        Arc::new(NativeDriver::new(config.serial.default_baud))
    };
    let timers = TimerQueue::shared()?;
    let registry = PortRegistry::new();

    configure_ports(&registry, Arc::clone(&driver), &timers, &config)?;
    let device = config.serial.resolve_port(&args.port);
    configure_serial_port(
        &registry,
        driver,
        &timers,
        config.serial.driver_settings(),
        PORT,
        &device,
        PortAttributes::default(),
    )?;

    let option = registry.find_option(PORT)?;
    for (key, value) in args.options() {
        if let Err(e) = option.set_option(key, &value) {
            warn!(key, value = %value, error = %e, "option rejected");
            eprintln!("{PORT}: {e}");
        }
    }

    if let Some(strip) = &args.strip_in {
        configure_strip(&registry, PORT, &unescape(strip)?, b"")?;
    }
    if let Some(secs) = args.throttle {
        configure_throttle(&registry, PORT, seconds(secs, "throttle")?)?;
    }

    let octet = registry.find_octet(PORT)?;
    if let Some(eos) = args.output_eos.as_deref().filter(|e| !e.is_empty()) {
        octet.set_output_eos(&unescape(eos)?)?;
    }
    if let Some(eos) = args.input_eos.as_deref().filter(|e| !e.is_empty()) {
        octet.set_input_eos(&unescape(eos)?)?;
    }

    let request = match args.timeout {
        Some(secs) if secs < 0.0 => IoRequest::keep_timeout(),
        Some(secs) => IoRequest::with_timeout(seconds(secs, "timeout")?),
        None => IoRequest::with_timeout(config.serial.read_timeout()),
    };
    debug!(?request, "transfer context");

    let output = args.output.as_deref().filter(|o| !o.is_empty());
    let mut written: Option<WriteOutcome> = None;
    if let Some(text) = output {
        print_report(&registry, args.report, "prior to write")?;
        let request = match args.timeout {
            None => IoRequest::with_timeout(config.serial.write_timeout()),
            Some(_) => request,
        };
        written = Some(octet.write(&request, text.as_bytes()));
    }

    let mut input = vec![0u8; INPUT_CAPACITY];
    let mut received: Option<ReadOutcome> = None;
    if !args.noread {
        print_report(&registry, args.report, "prior to read")?;
        received = Some(octet.read(&request, &mut input));
    }
    print_report(&registry, args.report, "at end")?;

    let response = received
        .as_ref()
        .map(|r| String::from_utf8_lossy(&input[..r.transferred]).into_owned());

    if args.json {
        let summary = json!({
            "port": PORT,
            "device": device,
            "write": written.as_ref().zip(output).map(|(w, text)| json!({
                "transferred": w.transferred,
                "status": w.status.to_string(),
                "output": text,
            })),
            "read": received.as_ref().map(|r| json!({
                "transferred": r.transferred,
                "status": r.status.to_string(),
                "eom": r.eom.bits(),
                "eom_names": r.eom.iter_names().map(|(name, _)| name).collect::<Vec<_>>(),
                "response": response,
            })),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        if let (Some(w), Some(text)) = (&written, output) {
            println!("Sent {} bytes, status={}, output:\n{text}", w.transferred, w.status);
        }
        if let Some(r) = &received {
            println!(
                "Received {} bytes, status={}, eomReason={}, response:\n{}",
                r.transferred,
                r.status,
                r.eom.bits(),
                response.as_deref().unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("serial-port-client: {e}");
            ExitCode::FAILURE
        }
    }
}
