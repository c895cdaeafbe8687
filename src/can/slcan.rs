// SLCAN (Lawicel ASCII) serial-line CAN adapter
//
// Frames are ASCII lines terminated by '\r':
//   t<iii><l><dd...>   data frame, 3 hex id digits, 1 dlc digit, 2 hex digits per byte
//   r<iii><l>          remote frame
// The adapter answers commands with '\r' (ok), 'z\r' (sent) or 0x07 (error).

use std::io::{Read, Write};
use std::time::Duration;

use embedded_can::Frame;
use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info, warn};

use super::{CanBus, CanError, CanFrame, Result};

/// Host side baud rate of the USB adapter (the CAN bitrate is set separately)
pub const ADAPTER_BAUDRATE: u32 = 115_200;
pub const ADAPTER_TIMEOUT_MS: u64 = 10;

const CR: u8 = b'\r';
const BELL: u8 = 0x07;

pub struct Slcan {
    port: Box<dyn SerialPort>,
    rx: Vec<u8>,
}

impl Slcan {
    /// Open the adapter and start the channel at the given CAN bitrate
    pub fn open(port_name: &str, bitrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, ADAPTER_BAUDRATE)
            .timeout(Duration::from_millis(ADAPTER_TIMEOUT_MS))
            .open()?;
        let mut bus = Self::with_port(port);
        bus.start(bitrate)?;
        info!("CAN channel open on {} at {} bit/s", port_name, bitrate);
        Ok(bus)
    }

    pub fn with_port(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            rx: Vec::with_capacity(64),
        }
    }

    fn start(&mut self, bitrate: u32) -> Result<()> {
        let speed = bitrate_command(bitrate)?;
        // Close first in case the adapter was left open by a previous run
        self.write_line(b"C")?;
        self.port.clear(ClearBuffer::Input)?;
        self.write_line(speed.as_bytes())?;
        self.write_line(b"O")
    }

    fn write_line(&mut self, body: &[u8]) -> Result<()> {
        self.port.write_all(body)?;
        self.port.write_all(&[CR])?;
        self.port.flush()?;
        Ok(())
    }

    /// Pull whatever the adapter has buffered into `rx`
    fn fill(&mut self) -> Result<()> {
        let available = self.port.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(());
        }
        let mut chunk = vec![0u8; available];
        let n = self.port.read(&mut chunk)?;
        self.rx.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

impl CanBus for Slcan {
    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        debug!("CAN tx 0x{:03X} {:02X?}", frame.raw_id(), frame.data());
        let line = encode(frame);
        self.write_line(line.as_bytes())
    }

    fn receive(&mut self) -> Result<Option<CanFrame>> {
        self.fill()?;
        while let Some(end) = self.rx.iter().position(|&b| b == CR || b == BELL) {
            let line: Vec<u8> = self.rx.drain(..=end).collect();
            if line[end] == BELL {
                warn!("CAN adapter rejected a command");
                continue;
            }
            match decode(&line[..end]) {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => continue,
                Err(e) => warn!("Dropping CAN line: {}", e),
            }
        }
        Ok(None)
    }
}

impl Drop for Slcan {
    fn drop(&mut self) {
        if let Err(e) = self.write_line(b"C") {
            warn!("Failed to close CAN channel: {}", e);
        }
    }
}

fn bitrate_command(bitrate: u32) -> Result<String> {
    let code = match bitrate {
        10_000 => 0,
        20_000 => 1,
        50_000 => 2,
        100_000 => 3,
        125_000 => 4,
        250_000 => 5,
        500_000 => 6,
        800_000 => 7,
        1_000_000 => 8,
        other => return Err(CanError::UnsupportedBitrate(other)),
    };
    Ok(format!("S{}", code))
}

/// Encode a frame as an SLCAN line body (without the trailing '\r')
pub fn encode(frame: &CanFrame) -> String {
    if frame.is_remote_frame() {
        format!("r{:03X}{}", frame.raw_id(), frame.dlc())
    } else {
        let mut line = format!("t{:03X}{}", frame.raw_id(), frame.dlc());
        for byte in frame.data() {
            line.push_str(&format!("{:02X}", byte));
        }
        line
    }
}

/// Decode one SLCAN line body; acknowledgements and status lines yield `None`
pub fn decode(line: &[u8]) -> Result<Option<CanFrame>> {
    let text = std::str::from_utf8(line)
        .ok()
        .filter(|text| text.is_ascii())
        .ok_or_else(|| CanError::Malformed(format!("{:02X?}", line)))?;
    let kind = match text.chars().next() {
        Some(kind @ ('t' | 'r')) => kind,
        _ => return Ok(None),
    };
    let malformed = || CanError::Malformed(text.to_string());

    if text.len() < 5 {
        return Err(malformed());
    }
    let id = u16::from_str_radix(&text[1..4], 16).map_err(|_| malformed())?;
    let dlc = usize::from_str_radix(&text[4..5], 16).map_err(|_| malformed())?;
    if dlc > 8 {
        return Err(malformed());
    }

    if kind == 'r' {
        return CanFrame::remote_frame(id, dlc).map(Some);
    }

    let hex = &text[5..];
    if hex.len() < dlc * 2 {
        return Err(malformed());
    }
    let mut data = [0u8; 8];
    for (i, byte) in data.iter_mut().take(dlc).enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| malformed())?;
    }
    CanFrame::data_frame(id, &data[..dlc]).map(Some)
}
