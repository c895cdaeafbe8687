// Digital inputs (bumper, home switch)
//
// On the host the lines come from a serial adapter's modem status pins.

#[cfg(test)]
use std::cell::Cell;
#[cfg(test)]
use std::rc::Rc;

use serde::Deserialize;
use serialport::SerialPort;
use tracing::warn;

pub trait DigitalInput {
    /// True while the input is asserted (polarity already applied)
    fn is_active(&mut self) -> bool;
}

/// Modem status lines readable through `serialport`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModemLine {
    Cts,
    Dsr,
    Cd,
    Ri,
}

pub struct ModemLineInput {
    port: Box<dyn SerialPort>,
    line: ModemLine,
    active_low: bool,
}

impl ModemLineInput {
    pub fn new(port: Box<dyn SerialPort>, line: ModemLine, active_low: bool) -> Self {
        Self {
            port,
            line,
            active_low,
        }
    }

    fn read_level(&mut self) -> serialport::Result<bool> {
        match self.line {
            ModemLine::Cts => self.port.read_clear_to_send(),
            ModemLine::Dsr => self.port.read_data_set_ready(),
            ModemLine::Cd => self.port.read_carrier_detect(),
            ModemLine::Ri => self.port.read_ring_indicator(),
        }
    }
}

impl DigitalInput for ModemLineInput {
    fn is_active(&mut self) -> bool {
        match self.read_level() {
            Ok(level) => level != self.active_low,
            Err(e) => {
                // A failed read counts as released so motion is never latched on
                warn!("Failed to read {:?} line: {}", self.line, e);
                false
            }
        }
    }
}

/// Input driven from test code; clones share the level
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct ManualInput {
    level: Rc<Cell<bool>>,
}

#[cfg(test)]
impl ManualInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, active: bool) {
        self.level.set(active);
    }
}

#[cfg(test)]
impl DigitalInput for ManualInput {
    fn is_active(&mut self) -> bool {
        self.level.get()
    }
}
