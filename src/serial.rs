//! Serial device access for driving a GNSS receiver directly
//!
//! When a serial device is configured, the caster's bytes go out on the wire
//! to the receiver and whatever the receiver talks back is mirrored to
//! stdout, optionally logged, and scanned for GGA sentences to upload.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    time::Duration,
};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::{nmea::NmeaScanner, NtripError};

/// Baud rates the line discipline accepts.
pub const BAUD_RATES: [u32; 12] = [
    50, 110, 300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200,
];

/// Serial line configuration.
#[derive(Clone, PartialEq, Debug)]
pub struct SerialSettings {
    pub device: String,
    pub baud: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl SerialSettings {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            baud: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }

    /// Open the device with this line discipline.
    ///
    /// The settings live and die with the returned handle; dropping it
    /// releases the line.
    pub fn open(&self) -> Result<SerialStream, NtripError> {
        tokio_serial::new(&self.device, self.baud)
            .data_bits(self.data_bits)
            .stop_bits(self.stop_bits)
            .parity(self.parity)
            .flow_control(self.flow_control)
            .open_native_async()
            .map_err(|e| {
                NtripError::Environment(format!("could not open serial port {}: {e}", self.device))
            })
    }
}

pub fn parse_baud(s: &str) -> Result<u32, String> {
    s.parse::<u32>()
        .ok()
        .filter(|baud| BAUD_RATES.contains(baud))
        .ok_or_else(|| format!("Baudrate '{s}' unknown"))
}

pub fn parse_data_bits(s: &str) -> Result<DataBits, String> {
    match s {
        "5" => Ok(DataBits::Five),
        "6" => Ok(DataBits::Six),
        "7" => Ok(DataBits::Seven),
        "8" => Ok(DataBits::Eight),
        _ => Err(format!("Databits '{s}' unknown")),
    }
}

pub fn parse_stop_bits(s: &str) -> Result<StopBits, String> {
    match s {
        "1" => Ok(StopBits::One),
        "2" => Ok(StopBits::Two),
        _ => Err(format!("Stopbits '{s}' unknown")),
    }
}

/// Lenient parity spelling: `none`/`no`/`n`, `odd`/`o`, `even`/`e`,
/// any case.
pub fn parse_parity(s: &str) -> Result<Parity, String> {
    match s.to_ascii_lowercase().as_str() {
        "none" | "no" | "n" => Ok(Parity::None),
        "odd" | "o" => Ok(Parity::Odd),
        "even" | "e" => Ok(Parity::Even),
        _ => Err(format!("Parity '{s}' unknown")),
    }
}

/// Lenient flow-control spelling, as gentle as possible about the separator.
pub fn parse_flow_control(s: &str) -> Result<FlowControl, String> {
    match s.to_ascii_lowercase().as_str() {
        "none" | "no" | "n" => Ok(FlowControl::None),
        "xonxoff" | "xon_xoff" | "xon-xoff" | "xon xoff" | "xon" | "xoff" | "x" => {
            Ok(FlowControl::Software)
        }
        "rtscts" | "rts_cts" | "rts-cts" | "rts cts" | "rts" | "cts" | "r" | "c" => {
            Ok(FlowControl::Hardware)
        }
        _ => Err(format!("Protocol '{s}' unknown")),
    }
}

/// The serial end of the relay: payload out, receiver chatter back.
pub struct SerialBridge {
    port: SerialStream,
    scanner: NmeaScanner,
    log: Option<File>,
}

impl SerialBridge {
    pub fn new(settings: &SerialSettings, log_path: Option<&Path>) -> Result<Self, NtripError> {
        let port = settings.open()?;
        let log = match log_path {
            Some(path) => Some(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)
                    .map_err(|_| {
                        NtripError::Environment("Could not open serial logfile.".into())
                    })?,
            ),
            None => None,
        };
        Ok(Self {
            port,
            scanner: NmeaScanner::new(),
            log,
        })
    }

    /// Write a payload block to the receiver, draining partial writes.
    pub async fn deliver(&mut self, data: &[u8]) -> Result<(), NtripError> {
        tokio::io::AsyncWriteExt::write_all(&mut self.port, data)
            .await
            .map_err(|_| NtripError::SerialAccess)
    }

    /// Read whatever the receiver has pending without blocking.
    ///
    /// Bytes are mirrored to stdout and the logfile; any GGA sentences
    /// completed by them are returned for upload on the control socket.
    pub async fn drain(&mut self) -> Result<Vec<Vec<u8>>, NtripError> {
        let mut sentences = Vec::new();

        loop {
            let mut buf = [0u8; 200];
            let n = match tokio::time::timeout(Duration::ZERO, self.port.read(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Ok(Err(_)) => return Err(NtripError::SerialAccess),
            };

            let _ = std::io::stdout().write_all(&buf[..n]);
            if let Some(log) = &mut self.log {
                let _ = log.write_all(&buf[..n]);
            }
            for &b in &buf[..n] {
                if let Some(sentence) = self.scanner.feed(b) {
                    sentences.push(sentence);
                }
            }

            if n < buf.len() {
                break;
            }
        }

        Ok(sentences)
    }
}
