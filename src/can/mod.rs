// CAN bus plumbing shared by all servo axes
//
// Provides:
// - CanFrame, a standard-id frame implementing embedded_can::Frame
// - the CanBus transaction trait (send / non-blocking receive)
// - CanDispatcher, the id -> subscriber table the router uses to deliver frames
// - an SLCAN (serial-line CAN adapter) implementation of CanBus

pub mod slcan;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use embedded_can::{Frame, Id, StandardId};

pub use slcan::Slcan;

#[derive(Debug, thiserror::Error)]
pub enum CanError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid standard CAN id 0x{0:03X}")]
    InvalidId(u16),

    #[error("Payload of {0} bytes does not fit a CAN frame")]
    PayloadTooLong(usize),

    #[error("Unsupported bitrate: {0}")]
    UnsupportedBitrate(u32),

    #[error("Malformed frame from adapter: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, CanError>;

/// Classic CAN frame with an 11-bit identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: StandardId,
    data: [u8; 8],
    dlc: u8,
    remote: bool,
}

impl CanFrame {
    pub fn data_frame(id: u16, data: &[u8]) -> Result<Self> {
        let id = StandardId::new(id).ok_or(CanError::InvalidId(id))?;
        <Self as Frame>::new(id, data).ok_or(CanError::PayloadTooLong(data.len()))
    }

    pub fn remote_frame(id: u16, dlc: usize) -> Result<Self> {
        let id = StandardId::new(id).ok_or(CanError::InvalidId(id))?;
        <Self as Frame>::new_remote(id, dlc).ok_or(CanError::PayloadTooLong(dlc))
    }

    pub fn raw_id(&self) -> u16 {
        self.id.as_raw()
    }
}

impl Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        let Id::Standard(id) = id.into() else {
            return None;
        };
        if data.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            data: buf,
            dlc: data.len() as u8,
            remote: false,
        })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        let Id::Standard(id) = id.into() else {
            return None;
        };
        if dlc > 8 {
            return None;
        }
        Some(Self {
            id,
            data: [0; 8],
            dlc: dlc as u8,
            remote: true,
        })
    }

    fn is_extended(&self) -> bool {
        false
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        Id::Standard(self.id)
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        if self.remote {
            &[]
        } else {
            &self.data[..self.dlc as usize]
        }
    }
}

/// Synchronous CAN transaction primitive
pub trait CanBus {
    fn send(&mut self, frame: &CanFrame) -> Result<()>;

    /// Next received frame, if one is available; never blocks
    fn receive(&mut self) -> Result<Option<CanFrame>>;
}

/// One bus shared by every axis on it
pub type SharedCanBus = Rc<RefCell<dyn CanBus>>;

/// Subscription table: which handlers want frames with a given id
#[derive(Debug, Default)]
pub struct CanDispatcher {
    subscriptions: HashMap<u16, Vec<usize>>,
}

impl CanDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, id: u16, handler: usize) {
        let handlers = self.subscriptions.entry(id).or_default();
        if !handlers.contains(&handler) {
            handlers.push(handler);
        }
    }

    pub fn handlers(&self, id: u16) -> &[usize] {
        self.subscriptions
            .get(&id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
