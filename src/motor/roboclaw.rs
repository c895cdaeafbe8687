// RoboClaw packet serial protocol implementation
//
// Packet format: [Address, Command, Data..., CRC16 hi, CRC16 lo]
// Multi-byte values are big-endian. Writes are acknowledged with 0xFF,
// reads answer with the data followed by a CRC16 that also covers the
// request's address and command bytes.

use serialport::{self, ClearBuffer, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

/// Read timeout per transaction
pub const DEFAULT_TIMEOUT_MS: u64 = 10;

/// Write acknowledge byte
const ACK: u8 = 0xFF;

/// Command set (only what the drive uses)
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Command {
    ReadMainBattery = 24,
    DutyM1M2 = 34,
    SpeedAccelM1M2 = 40,
    ReadEncoders = 78,
    ReadISpeeds = 79,
    ReadTemperature = 82,
}

/// Error types for RoboClaw communication
#[derive(Debug, thiserror::Error)]
pub enum RoboClawError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for response from controller {address}")]
    Timeout { address: u8 },

    #[error("CRC mismatch in {command:?} response from controller {address}")]
    CrcMismatch { address: u8, command: Command },

    #[error("Controller {address} did not acknowledge {command:?}")]
    Nack { address: u8, command: Command },
}

pub type Result<T> = std::result::Result<T, RoboClawError>;

/// Request/response transactions the drive needs from its motor controller.
/// Speeds and encoder values are raw counts; temperature and voltage are tenths.
pub trait MotorLink {
    fn duty_m1m2(&mut self, left: i16, right: i16) -> Result<()>;

    fn speed_accel_m1m2(&mut self, accel: u32, left: i32, right: i32) -> Result<()>;

    fn read_encoders(&mut self) -> Result<(u32, u32)>;

    /// Closed-loop speed registers, counts per second
    fn read_speeds(&mut self) -> Result<(i32, i32)>;

    fn read_temperature(&mut self) -> Result<u16>;

    fn read_main_battery(&mut self) -> Result<u16>;

    /// Drop any partial transaction so the next one starts clean
    fn clear(&mut self) -> Result<()>;
}

/// RoboClaw motor controller on a serial port
pub struct RoboClaw {
    port: Box<dyn SerialPort>,
    address: u8,
}

impl RoboClaw {
    /// Open a connection to the controller at `address` on a serial port
    pub fn open(port_name: &str, address: u8, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self { port, address })
    }

    /// CRC16-CCITT (XModem): polynomial 0x1021, initial value 0
    fn crc16(data: &[u8]) -> u16 {
        let mut crc: u16 = 0;
        for &byte in data {
            crc ^= (byte as u16) << 8;
            for _ in 0..8 {
                crc = if crc & 0x8000 != 0 {
                    (crc << 1) ^ 0x1021
                } else {
                    crc << 1
                };
            }
        }
        crc
    }

    /// Build a write packet with trailing CRC
    fn build_packet(address: u8, command: Command, data: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(4 + data.len());
        packet.push(address);
        packet.push(command as u8);
        packet.extend_from_slice(data);

        let crc = Self::crc16(&packet);
        packet.extend_from_slice(&crc.to_be_bytes());
        packet
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.port.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                RoboClawError::Timeout {
                    address: self.address,
                }
            } else {
                RoboClawError::Io(e)
            }
        })
    }

    /// Send a write command and wait for the acknowledge byte
    fn write_command(&mut self, command: Command, data: &[u8]) -> Result<()> {
        let packet = Self::build_packet(self.address, command, data);
        debug!("RoboClaw {} write {:?}: {:02X?}", self.address, command, data);
        self.port.write_all(&packet)?;
        self.port.flush()?;

        let mut ack = [0u8; 1];
        self.read_exact(&mut ack)?;
        if ack[0] != ACK {
            return Err(RoboClawError::Nack {
                address: self.address,
                command,
            });
        }
        Ok(())
    }

    /// Send a read command and return its `N` data bytes after checking the CRC
    fn read_command<const N: usize>(&mut self, command: Command) -> Result<[u8; N]> {
        let request = [self.address, command as u8];
        self.port.write_all(&request)?;
        self.port.flush()?;

        let mut data = [0u8; N];
        self.read_exact(&mut data)?;
        let mut crc = [0u8; 2];
        self.read_exact(&mut crc)?;

        let mut covered = Vec::with_capacity(2 + N);
        covered.extend_from_slice(&request);
        covered.extend_from_slice(&data);
        if Self::crc16(&covered) != u16::from_be_bytes(crc) {
            return Err(RoboClawError::CrcMismatch {
                address: self.address,
                command,
            });
        }
        Ok(data)
    }
}

impl MotorLink for RoboClaw {
    fn duty_m1m2(&mut self, left: i16, right: i16) -> Result<()> {
        let mut data = [0u8; 4];
        data[0..2].copy_from_slice(&left.to_be_bytes());
        data[2..4].copy_from_slice(&right.to_be_bytes());
        self.write_command(Command::DutyM1M2, &data)
    }

    fn speed_accel_m1m2(&mut self, accel: u32, left: i32, right: i32) -> Result<()> {
        let mut data = [0u8; 12];
        data[0..4].copy_from_slice(&accel.to_be_bytes());
        data[4..8].copy_from_slice(&left.to_be_bytes());
        data[8..12].copy_from_slice(&right.to_be_bytes());
        self.write_command(Command::SpeedAccelM1M2, &data)
    }

    fn read_encoders(&mut self) -> Result<(u32, u32)> {
        let data: [u8; 8] = self.read_command(Command::ReadEncoders)?;
        let (left, right) = split_words(data);
        Ok((u32::from_be_bytes(left), u32::from_be_bytes(right)))
    }

    fn read_speeds(&mut self) -> Result<(i32, i32)> {
        let data: [u8; 8] = self.read_command(Command::ReadISpeeds)?;
        let (left, right) = split_words(data);
        Ok((i32::from_be_bytes(left), i32::from_be_bytes(right)))
    }

    fn read_temperature(&mut self) -> Result<u16> {
        let data: [u8; 2] = self.read_command(Command::ReadTemperature)?;
        Ok(u16::from_be_bytes(data))
    }

    fn read_main_battery(&mut self) -> Result<u16> {
        let data: [u8; 2] = self.read_command(Command::ReadMainBattery)?;
        Ok(u16::from_be_bytes(data))
    }

    fn clear(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }
}

fn split_words(data: [u8; 8]) -> ([u8; 4], [u8; 4]) {
    let mut first = [0u8; 4];
    let mut second = [0u8; 4];
    first.copy_from_slice(&data[0..4]);
    second.copy_from_slice(&data[4..8]);
    (first, second)
}

/// Convert a normalized duty in [-1, 1] to the controller's signed 16-bit range
pub fn duty_to_raw(duty: f64) -> i16 {
    (duty.clamp(-1.0, 1.0) * 32767.0) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16() {
        // Standard CRC16/XMODEM check value
        assert_eq!(RoboClaw::crc16(b"123456789"), 0x31C3);
        assert_eq!(RoboClaw::crc16(&[]), 0);
    }

    #[test]
    fn test_build_duty_packet() {
        let packet = RoboClaw::build_packet(0x80, Command::DutyM1M2, &[0x40, 0x00, 0xC0, 0x00]);
        // Address (1) + Command (1) + Data (4) + CRC (2) = 8 bytes
        assert_eq!(packet.len(), 8);
        assert_eq!(packet[0], 0x80);
        assert_eq!(packet[1], 34);
        let crc = RoboClaw::crc16(&packet[..6]);
        assert_eq!(&packet[6..], &crc.to_be_bytes());
    }

    #[test]
    fn test_duty_to_raw() {
        assert_eq!(duty_to_raw(0.0), 0);
        assert_eq!(duty_to_raw(1.0), 32767);
        assert_eq!(duty_to_raw(-1.0), -32767);
        assert_eq!(duty_to_raw(2.5), 32767);
        assert_eq!(duty_to_raw(0.5), 16383);
    }

    #[test]
    fn test_split_words() {
        let (a, b) = split_words([0, 0, 1, 0, 0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(u32::from_be_bytes(a), 256);
        assert_eq!(i32::from_be_bytes(b), -2);
    }
}
