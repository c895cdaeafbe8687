// Capability set every controller exposes to the router

use crate::can::CanFrame;
use crate::messages::{Command, CommandError};

pub trait Module {
    fn name(&self) -> &str;

    /// One-time initialization once all modules are constructed
    fn setup(&mut self) {}

    /// One control cycle
    fn tick(&mut self);

    fn handle_command(&mut self, command: &Command) -> Result<(), CommandError>;

    /// Update a named field; unknown keys return `UnknownKey` so the router's
    /// base handler can try them
    fn set_parameter(&mut self, key: &str, value: &str) -> Result<(), CommandError>;

    fn status_text(&self) -> String;

    fn stop(&mut self);

    /// CAN ids this module wants delivered to `handle_can_frame`
    fn can_subscriptions(&self) -> Vec<u16> {
        Vec::new()
    }

    fn handle_can_frame(&mut self, _frame: &CanFrame) {}
}
