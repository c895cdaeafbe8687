// Closed-loop servo axis driven by an ODrive over CAN
//
// Mirrors the remote (axis state, control mode, input mode) so unchanged
// configuration frames are not resent, and keeps a position zero that is
// re-latched whenever the home switch is pressed.

use embedded_can::Frame;
use tracing::{debug, warn};

use super::odrive::{
    self, CLEAR_ERRORS, ENCODER_ESTIMATES, HEARTBEAT, REBOOT, RemoteMode, SET_AXIS_STATE,
    SET_CONTROLLER_MODE, SET_INPUT_POS, SET_INPUT_TORQUE, SET_INPUT_VEL, SET_LIMITS,
};
use crate::can::{CanFrame, SharedCanBus};
use crate::io::DigitalInput;
use crate::messages::{self, Command, CommandError};
use crate::module::Module;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisMode {
    Stop = 0,
    Move = 1,
    Home = 2,
    Homing = 3,
}

/// Last remote mode we transmitted, per frame
#[derive(Debug, Default)]
struct ModeMirror {
    axis_state: Option<odrive::AxisState>,
    controller: Option<(odrive::ControlMode, odrive::InputMode)>,
}

pub struct AxisController {
    name: String,
    can_id: u16,
    bus: SharedCanBus,
    home_switch: Option<Box<dyn DigitalInput>>,

    min_pos: f32,
    max_pos: f32,
    tolerance: f32,
    move_speed: f32,
    home_speed: f32,
    meters_per_tick: f32,

    mode: AxisMode,
    mirror: ModeMirror,
    raw_tick: f32,
    tick_offset: f32,
    position: f32,
    error_code: u8,
    target: Option<f32>,
    arrived: bool,
}

impl AxisController {
    pub fn new(name: &str, can_id: u16, bus: SharedCanBus) -> Self {
        Self {
            name: name.to_string(),
            can_id,
            bus,
            home_switch: None,
            min_pos: f32::NEG_INFINITY,
            max_pos: f32::INFINITY,
            tolerance: 0.005,
            move_speed: f32::INFINITY,
            home_speed: -0.1,
            meters_per_tick: 0.01,
            mode: AxisMode::Stop,
            mirror: ModeMirror::default(),
            raw_tick: 0.0,
            tick_offset: 0.0,
            position: 0.0,
            error_code: 0,
            target: None,
            arrived: false,
        }
    }

    pub fn with_home_switch(mut self, home_switch: Box<dyn DigitalInput>) -> Self {
        self.home_switch = Some(home_switch);
        self
    }

    pub fn mode(&self) -> AxisMode {
        self.mode
    }

    pub fn position(&self) -> f32 {
        self.position
    }

    pub fn tick_offset(&self) -> f32 {
        self.tick_offset
    }

    pub fn error_code(&self) -> u8 {
        self.error_code
    }

    /// True once the position is within `tolerance` of the last move target
    pub fn on_target(&self) -> bool {
        self.target
            .is_some_and(|target| (self.position - target).abs() <= self.tolerance)
    }

    // === Motion ===

    pub fn move_to(&mut self, target: f32, speed: f32) {
        self.set_mode(RemoteMode::POSITION);
        self.send(SET_LIMITS, odrive::f32_payload(speed / self.meters_per_tick));

        // max/min rather than clamp: limits may be configured inverted
        let target = target.min(self.max_pos).max(self.min_pos);
        let tick = target / self.meters_per_tick + self.tick_offset;
        self.send(SET_INPUT_POS, odrive::f32_payload(tick));
        self.target = Some(target);
        self.arrived = false;
        self.mode = AxisMode::Move;
    }

    pub fn move_by(&mut self, delta: f32, speed: f32) {
        self.move_to(self.position + delta, speed);
    }

    pub fn set_velocity(&mut self, velocity: f32) {
        self.set_mode(RemoteMode::VELOCITY_RAMP);
        let vel = velocity / self.meters_per_tick;
        self.send(SET_INPUT_VEL, odrive::f32_payload(vel));
        self.send(SET_LIMITS, odrive::f32_payload((vel * 2.0).abs()));
        self.target = None;
        self.mode = AxisMode::Move;
    }

    pub fn set_torque(&mut self, power: f32) {
        self.set_mode(RemoteMode::TORQUE);
        self.send(SET_INPUT_TORQUE, odrive::f32_payload(power));
        self.target = None;
        self.mode = AxisMode::Move;
    }

    pub fn home(&mut self) {
        self.set_mode(RemoteMode::VELOCITY);
        let vel = self.home_speed / self.meters_per_tick;
        self.send(SET_INPUT_VEL, odrive::f32_payload(vel));
        self.target = None;
        self.mode = AxisMode::Homing;
    }

    pub fn halt(&mut self) {
        self.set_mode(RemoteMode::IDLE);
        self.mode = if self.is_home_active() {
            AxisMode::Home
        } else {
            AxisMode::Stop
        };
    }

    pub fn reboot(&mut self) {
        self.send(REBOOT, [0; 8]);
    }

    pub fn clear_errors(&mut self) {
        self.send(CLEAR_ERRORS, [0; 8]);
    }

    // === Bus helpers ===

    fn set_mode(&mut self, required: RemoteMode) {
        if self.mirror.axis_state != Some(required.axis_state)
            && self.send(SET_AXIS_STATE, odrive::axis_state_payload(required.axis_state))
        {
            self.mirror.axis_state = Some(required.axis_state);
        }

        let controller = (required.control_mode, required.input_mode);
        if self.mirror.controller != Some(controller)
            && self.send(
                SET_CONTROLLER_MODE,
                odrive::controller_mode_payload(controller.0, controller.1),
            )
        {
            self.mirror.controller = Some(controller);
        }
    }

    /// Transmit one frame; failures are logged and reported as `false`
    fn send(&mut self, offset: u16, data: [u8; 8]) -> bool {
        let frame = match CanFrame::data_frame(self.can_id + offset, &data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}: cannot build frame: {}", self.name, e);
                return false;
            }
        };
        self.transmit(&frame)
    }

    fn transmit(&mut self, frame: &CanFrame) -> bool {
        match self.bus.borrow_mut().send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: CAN send 0x{:03X} failed: {}", self.name, frame.raw_id(), e);
                false
            }
        }
    }

    fn request_encoder_estimate(&mut self) {
        match CanFrame::remote_frame(self.can_id + ENCODER_ESTIMATES, 8) {
            Ok(frame) => {
                self.transmit(&frame);
            }
            Err(e) => warn!("{}: cannot build frame: {}", self.name, e),
        }
    }

    fn is_home_active(&mut self) -> bool {
        self.home_switch
            .as_mut()
            .is_some_and(|switch| switch.is_active())
    }

    /// Re-zero on the home switch, then derive the position from the raw tick
    fn update_position(&mut self) {
        if self.is_home_active() {
            self.tick_offset = self.raw_tick;
        }
        self.position = (self.raw_tick - self.tick_offset) * self.meters_per_tick;

        if !self.arrived && self.on_target() {
            self.arrived = true;
            debug!("{} reached {:.3}", self.name, self.position);
        }
    }
}

impl Module for AxisController {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self) {
        self.request_encoder_estimate();
        self.update_position();

        if self.mode == AxisMode::Homing && self.is_home_active() {
            self.halt();
        }
    }

    fn handle_command(&mut self, command: &Command) -> Result<(), CommandError> {
        let mut args = command.args();
        match command.name.as_str() {
            "move" => {
                let target = args.f64("target")? as f32;
                let speed = args.optional_f64("speed")?.map_or(self.move_speed, |s| s as f32);
                self.move_to(target, speed);
            }
            "dmove" => {
                let delta = args.f64("delta")? as f32;
                let speed = args.optional_f64("speed")?.map_or(self.move_speed, |s| s as f32);
                self.move_by(delta, speed);
            }
            "speed" => self.set_velocity(args.f64("velocity")? as f32),
            "torque" => self.set_torque(args.f64("power")? as f32),
            "home" => self.home(),
            "stop" => self.halt(),
            "reboot" => self.reboot(),
            "clearError" => self.clear_errors(),
            other => return Err(CommandError::UnknownCommand(other.to_string())),
        }
        Ok(())
    }

    fn set_parameter(&mut self, key: &str, value: &str) -> Result<(), CommandError> {
        let number = |name: &'static str| messages::parse_f64(name, value).map(|n| n as f32);
        match key {
            "minPos" => self.min_pos = number("minPos")?,
            "maxPos" => self.max_pos = number("maxPos")?,
            "tolerance" => self.tolerance = number("tolerance")?,
            "moveSpeed" => self.move_speed = number("moveSpeed")?,
            "homeSpeed" => self.home_speed = number("homeSpeed")?,
            "mPerTick" => {
                self.meters_per_tick = messages::parse_nonzero("mPerTick", value)? as f32
            }
            _ => return Err(CommandError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn status_text(&self) -> String {
        format!("{} {} {:.3}", self.mode as u8, self.error_code, self.position)
    }

    fn stop(&mut self) {
        self.halt();
    }

    fn can_subscriptions(&self) -> Vec<u16> {
        vec![self.can_id + HEARTBEAT, self.can_id + ENCODER_ESTIMATES]
    }

    fn handle_can_frame(&mut self, frame: &CanFrame) {
        let id = frame.raw_id();
        if id == self.can_id + HEARTBEAT {
            if let Some(&code) = frame.data().first() {
                if code != self.error_code && code != 0 {
                    warn!("{} reports error code {}", self.name, code);
                }
                self.error_code = code;
            }
        } else if id == self.can_id + ENCODER_ESTIMATES {
            if let Some(tick) = odrive::read_f32(frame.data()) {
                self.raw_tick = tick;
                self.update_position();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::mock::MockCanBus;
    use crate::io::ManualInput;
    use std::cell::RefCell;
    use std::rc::Rc;

    const BASE: u16 = 0x060;

    fn axis() -> (AxisController, Rc<RefCell<MockCanBus>>) {
        let bus = Rc::new(RefCell::new(MockCanBus::default()));
        let shared: SharedCanBus = bus.clone();
        (AxisController::new("z", BASE, shared), bus)
    }

    fn homed_axis() -> (AxisController, Rc<RefCell<MockCanBus>>, ManualInput) {
        let (axis, bus) = axis();
        let switch = ManualInput::new();
        (axis.with_home_switch(Box::new(switch.clone())), bus, switch)
    }

    fn value_of(frame: &CanFrame) -> f32 {
        odrive::read_f32(frame.data()).unwrap()
    }

    fn encoder_frame(tick: f32) -> CanFrame {
        CanFrame::data_frame(BASE + ENCODER_ESTIMATES, &odrive::f32_payload(tick)).unwrap()
    }

    #[test]
    fn test_repeated_move_mirrors_mode() {
        let (mut axis, bus) = axis();
        axis.move_to(0.1, 0.2);
        axis.move_to(0.3, 0.2);

        let bus = bus.borrow();
        assert_eq!(bus.sent_with_id(BASE + SET_AXIS_STATE).len(), 1);
        assert_eq!(bus.sent_with_id(BASE + SET_CONTROLLER_MODE).len(), 1);
        assert_eq!(bus.sent_with_id(BASE + SET_LIMITS).len(), 2);
        assert_eq!(bus.sent_with_id(BASE + SET_INPUT_POS).len(), 2);
        assert_eq!(bus.sent.len(), 6);

        let controller = bus.sent_with_id(BASE + SET_CONTROLLER_MODE)[0];
        assert_eq!(controller.data(), &[3, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(axis.mode(), AxisMode::Move);
    }

    #[test]
    fn test_mode_change_sends_only_changed_frame() {
        let (mut axis, bus) = axis();
        axis.move_to(0.1, 0.2);
        axis.set_velocity(0.1);
        // Axis state stays closed loop; only the controller mode changes
        let bus = bus.borrow();
        assert_eq!(bus.sent_with_id(BASE + SET_AXIS_STATE).len(), 1);
        assert_eq!(bus.sent_with_id(BASE + SET_CONTROLLER_MODE).len(), 2);
    }

    #[test]
    fn test_move_clamps_target() {
        let (mut axis, bus) = axis();
        axis.set_parameter("minPos", "0").unwrap();
        axis.set_parameter("maxPos", "0.5").unwrap();
        axis.move_to(2.0, 0.1);
        axis.move_to(-1.0, 0.1);

        let bus = bus.borrow();
        let positions = bus.sent_with_id(BASE + SET_INPUT_POS);
        assert!((value_of(positions[0]) - 50.0).abs() < 1e-3);
        assert_eq!(value_of(positions[1]), 0.0);
        let limit = bus.sent_with_id(BASE + SET_LIMITS)[0];
        assert!((value_of(limit) - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_move_is_relative_to_tick_offset() {
        let (mut axis, bus, switch) = homed_axis();
        switch.set(true);
        axis.handle_can_frame(&encoder_frame(40.0));
        switch.set(false);

        axis.move_to(0.1, 0.1);
        let bus = bus.borrow();
        let position = bus.sent_with_id(BASE + SET_INPUT_POS)[0];
        assert!((value_of(position) - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_home_switch_latches_offset() {
        let (mut axis, _bus, switch) = homed_axis();
        switch.set(true);
        axis.handle_can_frame(&encoder_frame(123.0));
        assert_eq!(axis.tick_offset(), 123.0);
        assert_eq!(axis.position(), 0.0);

        axis.handle_can_frame(&encoder_frame(130.0));
        axis.tick();
        assert_eq!(axis.tick_offset(), 130.0);
        assert_eq!(axis.position(), 0.0);

        switch.set(false);
        axis.handle_can_frame(&encoder_frame(230.0));
        assert_eq!(axis.tick_offset(), 130.0);
        assert!((axis.position() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_homing_stops_at_switch() {
        let (mut axis, bus, switch) = homed_axis();
        axis.home();
        assert_eq!(axis.mode(), AxisMode::Homing);
        {
            let bus = bus.borrow();
            let vel = bus.sent_with_id(BASE + SET_INPUT_VEL)[0];
            assert!((value_of(vel) + 10.0).abs() < 1e-3);
            let controller = bus.sent_with_id(BASE + SET_CONTROLLER_MODE)[0];
            assert_eq!(controller.data(), &[2, 0, 0, 0, 1, 0, 0, 0]);
        }

        axis.tick();
        assert_eq!(axis.mode(), AxisMode::Homing);

        switch.set(true);
        axis.tick();
        assert_eq!(axis.mode(), AxisMode::Home);
        let bus = bus.borrow();
        let states = bus.sent_with_id(BASE + SET_AXIS_STATE);
        assert_eq!(states.last().unwrap().data()[0], 1);
    }

    #[test]
    fn test_stop_without_switch() {
        let (mut axis, _bus) = axis();
        axis.set_torque(0.3);
        axis.handle_command(&Command::new("stop", "")).unwrap();
        assert_eq!(axis.mode(), AxisMode::Stop);
    }

    #[test]
    fn test_tick_requests_encoder_estimate() {
        let (mut axis, bus) = axis();
        axis.tick();
        axis.tick();
        let bus = bus.borrow();
        let requests = bus.sent_with_id(BASE + ENCODER_ESTIMATES);
        assert_eq!(requests.len(), 2);
        assert!(requests[0].is_remote_frame());
    }

    #[test]
    fn test_velocity_and_torque_frames() {
        let (mut axis, bus) = axis();
        axis.handle_command(&Command::new("speed", "-0.05")).unwrap();
        axis.handle_command(&Command::new("torque", "0.7")).unwrap();

        let bus = bus.borrow();
        let vel = bus.sent_with_id(BASE + SET_INPUT_VEL)[0];
        assert!((value_of(vel) + 5.0).abs() < 1e-3);
        let limit = bus.sent_with_id(BASE + SET_LIMITS)[0];
        assert!((value_of(limit) - 10.0).abs() < 1e-3);
        let torque = bus.sent_with_id(BASE + SET_INPUT_TORQUE)[0];
        assert!((value_of(torque) - 0.7).abs() < 1e-6);
        let controller = bus.sent_with_id(BASE + SET_CONTROLLER_MODE);
        assert_eq!(controller[0].data(), &[2, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(controller[1].data(), &[1, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_dmove_uses_current_position() {
        let (mut axis, bus) = axis();
        axis.handle_can_frame(&encoder_frame(20.0));
        axis.handle_command(&Command::new("dmove", "0.1")).unwrap();
        let bus = bus.borrow();
        let position = bus.sent_with_id(BASE + SET_INPUT_POS)[0];
        assert!((value_of(position) - 30.0).abs() < 1e-3);
        // No speed given: default move speed is unlimited
        let limit = bus.sent_with_id(BASE + SET_LIMITS)[0];
        assert!(value_of(limit).is_infinite());
    }

    #[test]
    fn test_fire_and_forget_frames() {
        let (mut axis, bus) = axis();
        axis.handle_command(&Command::new("reboot", "")).unwrap();
        axis.handle_command(&Command::new("clearError", "")).unwrap();
        let bus = bus.borrow();
        assert_eq!(bus.sent_with_id(BASE + REBOOT).len(), 1);
        assert_eq!(bus.sent_with_id(BASE + CLEAR_ERRORS).len(), 1);
        assert_eq!(axis.mode(), AxisMode::Stop);
    }

    #[test]
    fn test_failed_send_is_retried() {
        let (mut axis, bus) = axis();
        bus.borrow_mut().fail_sends = true;
        axis.move_to(0.1, 0.1);
        bus.borrow_mut().fail_sends = false;
        axis.move_to(0.1, 0.1);
        let bus = bus.borrow();
        assert_eq!(bus.sent_with_id(BASE + SET_AXIS_STATE).len(), 1);
        assert_eq!(bus.sent_with_id(BASE + SET_CONTROLLER_MODE).len(), 1);
    }

    #[test]
    fn test_error_frame_and_status() {
        let (mut axis, _bus) = axis();
        let frame = CanFrame::data_frame(BASE + HEARTBEAT, &[5, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        axis.handle_can_frame(&frame);
        assert_eq!(axis.error_code(), 5);
        axis.handle_can_frame(&encoder_frame(150.0));
        assert_eq!(axis.status_text(), "0 5 1.500");
    }

    #[test]
    fn test_bare_number_is_not_a_command() {
        let (mut axis, bus) = axis();
        assert_eq!(
            axis.handle_command(&Command::new("0.5", "")),
            Err(CommandError::UnknownCommand("0.5".to_string()))
        );
        assert!(bus.borrow().sent.is_empty());
        assert_eq!(axis.mode(), AxisMode::Stop);
    }

    #[test]
    fn test_on_target() {
        let (mut axis, _bus) = axis();
        axis.move_to(0.5, 0.1);
        assert!(!axis.on_target());
        axis.handle_can_frame(&encoder_frame(49.8));
        assert!(axis.on_target());
    }

    #[test]
    fn test_subscriptions_and_parameters() {
        let (mut axis, _bus) = axis();
        assert_eq!(axis.can_subscriptions(), vec![0x061, 0x069]);
        assert!(axis.set_parameter("homeSpeed", "0.2").is_ok());
        assert!(axis.set_parameter("mPerTick", "0").is_err());
        assert!(axis.set_parameter("mPerTick", "inf").is_err());
        assert_eq!(
            axis.set_parameter("maxPos", "high"),
            Err(CommandError::InvalidNumber {
                name: "maxPos",
                value: "high".to_string()
            })
        );
        assert_eq!(
            axis.set_parameter("width", "1"),
            Err(CommandError::UnknownKey("width".to_string()))
        );
        assert_eq!(
            axis.handle_command(&Command::new("jump", "")),
            Err(CommandError::UnknownCommand("jump".to_string()))
        );
    }
}
