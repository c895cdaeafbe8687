// Differential drive controller
//
// Turns power/speed setpoints into periodic RoboClaw transactions through a
// small state machine:
//
//   IDLE      -> zero power every cycle
//   POWERING  -> stored duty for 500ms, then IDLE
//   SPEEDING  -> full speed 200ms, linear ramp to zero until 500ms, zero until 700ms, then IDLE
//   BRAKING   -> zero speed for 1s, then IDLE
//   REVERSING -> bump escape power fading out over 400ms, then IDLE
//
// Temperature above 70°C overrides every mode with zero duty.

use tracing::{Level, debug, error, info, warn};

use super::kinematics::{WheelSpeeds, curvature_to_wheels, pivot, wheels_to_body};
use super::roboclaw::{self, MotorLink, RoboClawError};
use crate::clock::Clock;
use crate::config::{
    BRAKE_HOLD_MS, BUMP_LOCKOUT_MS, BUMPER_DEBOUNCE_MS, MAX_TEMPERATURE_C, POWER_HOLD_MS,
    REVERSE_MS, SPEED_ACCELERATION, SPEED_HOLD_MS, SPEED_RAMP_END_MS, SPEED_ZERO_END_MS,
};
use crate::io::DigitalInput;
use crate::messages::{self, Command, CommandError};
use crate::module::Module;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    Idle,
    Powering,
    Speeding,
    Braking,
    Reversing,
}

impl DriveMode {
    pub fn name(&self) -> &'static str {
        match self {
            DriveMode::Idle => "IDLE",
            DriveMode::Powering => "POWERING",
            DriveMode::Speeding => "SPEEDING",
            DriveMode::Braking => "BRAKING",
            DriveMode::Reversing => "REVERSING",
        }
    }
}

/// Where measured wheel speeds come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedSensing {
    /// The controller's own closed-loop speed registers (sampled at 300Hz)
    ClosedLoop,
    /// Encoder count differences over wall-clock time between ticks
    CounterDiff,
}

#[derive(Debug, Clone, Copy)]
struct EncoderSample {
    stamp_us: u64,
    left: u32,
    right: u32,
}

/// Consecutive link failure tracking with escalating severity
#[derive(Debug, Default)]
pub struct LinkHealth {
    failures: u32,
}

impl LinkHealth {
    /// Count a failure and return the severity to report it with
    pub fn record_failure(&mut self) -> Level {
        self.failures += 1;
        if self.failures < 3 {
            Level::WARN
        } else {
            Level::ERROR
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

pub struct DriveController {
    name: String,
    link: Box<dyn MotorLink>,
    clock: Box<dyn Clock>,
    bumper: Option<Box<dyn DigitalInput>>,

    meters_per_tick: f64,
    width: f64,
    sensing: SpeedSensing,
    bumper_debounce_ms: u64,

    mode: DriveMode,
    power: (f64, f64),
    speed: WheelSpeeds,
    reverse_power: (f64, f64),

    power_at: u64,
    speed_at: u64,
    brake_at: u64,
    reverse_at: u64,
    last_bump: Option<u64>,
    bump_active: bool,

    temperature_c: f64,
    battery_v: f64,
    linear_speed: f64,
    angular_speed: f64,

    previous_sample: Option<EncoderSample>,
    health: LinkHealth,
}

impl DriveController {
    pub fn new(name: &str, link: Box<dyn MotorLink>, clock: Box<dyn Clock>) -> Self {
        Self {
            name: name.to_string(),
            link,
            clock,
            bumper: None,
            meters_per_tick: 0.001,
            width: 1.0,
            sensing: SpeedSensing::ClosedLoop,
            bumper_debounce_ms: BUMPER_DEBOUNCE_MS,
            mode: DriveMode::Idle,
            power: (0.0, 0.0),
            speed: WheelSpeeds::zero(),
            reverse_power: (0.0, 0.0),
            power_at: 0,
            speed_at: 0,
            brake_at: 0,
            reverse_at: 0,
            last_bump: None,
            bump_active: false,
            temperature_c: 0.0,
            battery_v: 0.0,
            linear_speed: 0.0,
            angular_speed: 0.0,
            previous_sample: None,
            health: LinkHealth::default(),
        }
    }

    pub fn with_bumper(mut self, bumper: Box<dyn DigitalInput>) -> Self {
        self.bumper = Some(bumper);
        self
    }

    pub fn mode(&self) -> DriveMode {
        self.mode
    }

    pub fn speed_setpoint(&self) -> WheelSpeeds {
        self.speed
    }

    pub fn reverse_power(&self) -> (f64, f64) {
        self.reverse_power
    }

    pub fn linear_speed(&self) -> f64 {
        self.linear_speed
    }

    pub fn angular_speed(&self) -> f64 {
        self.angular_speed
    }

    pub fn temperature(&self) -> f64 {
        self.temperature_c
    }

    pub fn link_failures(&self) -> u32 {
        self.health.failures()
    }

    // === Triggers ===

    pub fn trigger_power(&mut self, left: f64, right: f64) {
        self.power_at = self.clock.now_ms();
        self.power = (left.clamp(-1.0, 1.0), right.clamp(-1.0, 1.0));
        if matches!(self.mode, DriveMode::Idle | DriveMode::Speeding) {
            self.mode = DriveMode::Powering;
        }
    }

    pub fn trigger_speed(&mut self, left: f64, right: f64) {
        self.speed_at = self.clock.now_ms();
        self.speed = WheelSpeeds::new(left, right);
        let bump_cleared = self
            .last_bump
            .is_none_or(|at| self.clock.millis_since(at) > BUMP_LOCKOUT_MS);
        if self.mode == DriveMode::Idle && bump_cleared {
            self.mode = DriveMode::Speeding;
        }
    }

    /// Back away from an obstacle, opposite to each wheel's current direction
    pub fn trigger_bump(&mut self, current_left: f64, current_right: f64) {
        if self.mode == DriveMode::Speeding {
            self.mode = DriveMode::Reversing;
            self.reverse_power = (
                if current_left > 0.0 { -1.0 } else { 1.0 },
                if current_right > 0.0 { -1.0 } else { 1.0 },
            );
            self.reverse_at = self.clock.now_ms();
        }
    }

    /// Brake out of a speed command
    pub fn brake(&mut self) {
        if self.mode == DriveMode::Speeding {
            self.mode = DriveMode::Braking;
            self.brake_at = self.clock.now_ms();
        }
    }

    pub fn to_idle(&mut self) {
        self.mode = DriveMode::Idle;
        let result = self.send_power(0.0, 0.0);
        self.check(result);
    }

    // === Bus primitives ===

    fn overheated(&self) -> bool {
        self.temperature_c > MAX_TEMPERATURE_C
    }

    fn send_power(&mut self, left: f64, right: f64) -> roboclaw::Result<()> {
        if self.overheated() {
            return self.link.duty_m1m2(0, 0);
        }
        self.link
            .duty_m1m2(roboclaw::duty_to_raw(left), roboclaw::duty_to_raw(right))
    }

    fn send_speed(&mut self, speeds: WheelSpeeds) -> roboclaw::Result<()> {
        if self.overheated() {
            return self.link.duty_m1m2(0, 0);
        }
        let left = (speeds.left / self.meters_per_tick) as i32;
        let right = (speeds.right / self.meters_per_tick) as i32;
        let accel = (SPEED_ACCELERATION / self.meters_per_tick).abs() as u32;
        self.link.speed_accel_m1m2(accel, left, right)
    }

    fn read_speed(&mut self) -> roboclaw::Result<WheelSpeeds> {
        match self.sensing {
            SpeedSensing::ClosedLoop => self.speed_from_registers(),
            SpeedSensing::CounterDiff => self.speed_from_counter_diffs(),
        }
    }

    fn speed_from_registers(&mut self) -> roboclaw::Result<WheelSpeeds> {
        let (left, right) = self.link.read_speeds()?;
        Ok(WheelSpeeds::new(
            left as f64 * self.meters_per_tick,
            right as f64 * self.meters_per_tick,
        ))
    }

    fn speed_from_counter_diffs(&mut self) -> roboclaw::Result<WheelSpeeds> {
        let now = self.clock.now_us();
        let (left, right) = self.link.read_encoders()?;

        let speeds = match self.previous_sample {
            Some(previous) if now > previous.stamp_us => {
                let dt = (now - previous.stamp_us) as f64 * 1.0e-6;
                // Wrapping difference keeps counter rollover continuous
                let d_left = left.wrapping_sub(previous.left) as i32;
                let d_right = right.wrapping_sub(previous.right) as i32;
                WheelSpeeds::new(
                    d_left as f64 * self.meters_per_tick / dt,
                    d_right as f64 * self.meters_per_tick / dt,
                )
            }
            _ => WheelSpeeds::zero(),
        };
        self.previous_sample = Some(EncoderSample {
            stamp_us: now,
            left,
            right,
        });
        Ok(speeds)
    }

    fn read_telemetry(&mut self) {
        match self.link.read_temperature() {
            Ok(tenths) => self.temperature_c = 0.1 * tenths as f64,
            Err(e) => debug!("{}: temperature read failed: {}", self.name, e),
        }
        match self.link.read_main_battery() {
            Ok(tenths) => self.battery_v = 0.1 * tenths as f64,
            Err(e) => debug!("{}: battery read failed: {}", self.name, e),
        }
    }

    /// Track link health; returns the value on success
    fn check<T>(&mut self, result: roboclaw::Result<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.health.record_success();
                Some(value)
            }
            Err(e) => {
                self.on_link_failure(&e);
                None
            }
        }
    }

    fn on_link_failure(&mut self, e: &RoboClawError) {
        if self.health.record_failure() == Level::WARN {
            warn!("Communication problem with {} RoboClaw: {}", self.name, e);
        } else {
            error!("Communication problem with {} RoboClaw: {}", self.name, e);
        }
        if let Err(e) = self.link.clear() {
            debug!("{}: failed to clear serial buffers: {}", self.name, e);
        }
    }

    fn update_bumper(&mut self, current: WheelSpeeds) {
        let Some(bumper) = self.bumper.as_mut() else {
            return;
        };
        let now = self.clock.now_ms();
        if bumper.is_active() {
            self.last_bump = Some(now);
        }
        let active = self
            .last_bump
            .is_some_and(|at| now.saturating_sub(at) <= self.bumper_debounce_ms);
        let newly_active = active && !self.bump_active;
        if active != self.bump_active {
            info!("{} bump {}", self.name, if active { "start" } else { "stop" });
        }
        self.bump_active = active;
        if newly_active {
            self.trigger_bump(current.left, current.right);
        }
    }

    fn run_mode(&mut self) {
        match self.mode {
            DriveMode::Idle => {
                let result = self.send_power(0.0, 0.0);
                self.check(result);
            }
            DriveMode::Powering => {
                let (left, right) = self.power;
                let result = self.send_power(left, right);
                self.check(result);
                if self.clock.millis_since(self.power_at) > POWER_HOLD_MS {
                    self.to_idle();
                }
            }
            DriveMode::Speeding => {
                let m = self.clock.millis_since(self.speed_at);
                if m < SPEED_HOLD_MS {
                    let result = self.send_speed(self.speed);
                    self.check(result);
                } else if m < SPEED_RAMP_END_MS {
                    let ramp = (SPEED_RAMP_END_MS - SPEED_HOLD_MS) as f64;
                    let factor = 1.0 - (m - SPEED_HOLD_MS) as f64 / ramp;
                    let result = self.send_speed(self.speed.scaled(factor));
                    self.check(result);
                } else if m < SPEED_ZERO_END_MS {
                    let result = self.send_speed(WheelSpeeds::zero());
                    self.check(result);
                } else {
                    self.to_idle();
                }
            }
            DriveMode::Braking => {
                let result = self.send_speed(WheelSpeeds::zero());
                self.check(result);
                if self.clock.millis_since(self.brake_at) > BRAKE_HOLD_MS {
                    self.to_idle();
                }
            }
            DriveMode::Reversing => {
                let m = self.clock.millis_since(self.reverse_at);
                let factor = (1.0 - m as f64 / REVERSE_MS as f64).max(0.0);
                let (left, right) = self.reverse_power;
                let result = self.send_power(factor * left, factor * right);
                self.check(result);
                if m > REVERSE_MS {
                    self.to_idle();
                }
            }
        }
    }
}

impl Module for DriveController {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self) {
        let result = self.read_speed();
        let Some(current) = self.check(result) else {
            return;
        };
        (self.linear_speed, self.angular_speed) = wheels_to_body(current, self.width);

        self.read_telemetry();
        self.update_bumper(current);
        self.run_mode();
    }

    fn handle_command(&mut self, command: &Command) -> Result<(), CommandError> {
        if let Some(speed) = command.bare_number_as_speed() {
            return self.handle_command(&speed);
        }
        let mut args = command.args();
        match command.name.as_str() {
            "pw" => {
                let left = args.f64("left")?;
                let right = args.f64("right")?;
                self.trigger_power(left, right);
            }
            "speed" => {
                let speed = args.f64("speed")?;
                let curvature = args.optional_f64("curvature")?.unwrap_or(0.0);
                let wheels = curvature_to_wheels(speed, curvature, self.width);
                self.trigger_speed(wheels.left, wheels.right);
            }
            "left" => {
                let wheels = pivot(args.f64("speed")?, self.width);
                self.trigger_speed(wheels.left, wheels.right);
            }
            "right" => {
                let wheels = pivot(-args.f64("speed")?, self.width);
                self.trigger_speed(wheels.left, wheels.right);
            }
            "stop" => self.brake(),
            "idle" => self.to_idle(),
            other => return Err(CommandError::UnknownCommand(other.to_string())),
        }
        Ok(())
    }

    fn set_parameter(&mut self, key: &str, value: &str) -> Result<(), CommandError> {
        match key {
            "mPerTick" => self.meters_per_tick = messages::parse_nonzero("mPerTick", value)?,
            "width" => self.width = messages::parse_nonzero("width", value)?,
            "use300HzSpeedReadings" => {
                self.sensing = if messages::parse_flag(value) {
                    SpeedSensing::ClosedLoop
                } else {
                    SpeedSensing::CounterDiff
                };
                self.previous_sample = None;
            }
            "bumper_debounce" => {
                self.bumper_debounce_ms = messages::parse_u64("bumper_debounce", value)?
            }
            _ => return Err(CommandError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn status_text(&self) -> String {
        format!(
            "{:.4}\t{:.4}\t{:.1}\t{:.1}\t{}",
            self.linear_speed,
            self.angular_speed,
            self.temperature_c,
            self.battery_v,
            self.mode.name()
        )
    }

    fn stop(&mut self) {
        self.brake();
    }
}

impl Drop for DriveController {
    fn drop(&mut self) {
        // Leave the wheels unpowered when the runtime goes away
        if let Err(e) = self.link.duty_m1m2(0, 0) {
            warn!("Failed to stop {} on drop: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::io::ManualInput;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum Sent {
        Duty(i16, i16),
        Speed(u32, i32, i32),
    }

    #[derive(Default)]
    pub struct LinkState {
        pub sent: Vec<Sent>,
        pub speeds: (i32, i32),
        pub encoders: (u32, u32),
        pub temperature: u16,
        pub battery: u16,
        pub fail_reads: bool,
        pub fail_telemetry: bool,
        pub fail_writes: bool,
        pub clears: usize,
    }

    /// Motor link fake; clones share the recorded state
    #[derive(Clone, Default)]
    pub struct MockLink(pub Rc<RefCell<LinkState>>);

    impl MockLink {
        pub fn last(&self) -> Option<Sent> {
            self.0.borrow().sent.last().copied()
        }

        pub fn sent_count(&self) -> usize {
            self.0.borrow().sent.len()
        }
    }

    fn timeout() -> RoboClawError {
        RoboClawError::Timeout { address: 0x80 }
    }

    impl MotorLink for MockLink {
        fn duty_m1m2(&mut self, left: i16, right: i16) -> roboclaw::Result<()> {
            let mut state = self.0.borrow_mut();
            if state.fail_writes {
                return Err(RoboClawError::Nack {
                    address: 0x80,
                    command: roboclaw::Command::DutyM1M2,
                });
            }
            state.sent.push(Sent::Duty(left, right));
            Ok(())
        }

        fn speed_accel_m1m2(&mut self, accel: u32, left: i32, right: i32) -> roboclaw::Result<()> {
            let mut state = self.0.borrow_mut();
            if state.fail_writes {
                return Err(RoboClawError::Nack {
                    address: 0x80,
                    command: roboclaw::Command::SpeedAccelM1M2,
                });
            }
            state.sent.push(Sent::Speed(accel, left, right));
            Ok(())
        }

        fn read_encoders(&mut self) -> roboclaw::Result<(u32, u32)> {
            let state = self.0.borrow();
            if state.fail_reads {
                return Err(timeout());
            }
            Ok(state.encoders)
        }

        fn read_speeds(&mut self) -> roboclaw::Result<(i32, i32)> {
            let state = self.0.borrow();
            if state.fail_reads {
                return Err(timeout());
            }
            Ok(state.speeds)
        }

        fn read_temperature(&mut self) -> roboclaw::Result<u16> {
            let state = self.0.borrow();
            if state.fail_telemetry {
                return Err(timeout());
            }
            Ok(state.temperature)
        }

        fn read_main_battery(&mut self) -> roboclaw::Result<u16> {
            let state = self.0.borrow();
            if state.fail_telemetry {
                return Err(timeout());
            }
            Ok(state.battery)
        }

        fn clear(&mut self) -> roboclaw::Result<()> {
            self.0.borrow_mut().clears += 1;
            Ok(())
        }
    }

    fn drive() -> (DriveController, MockLink, MockClock) {
        let link = MockLink::default();
        link.0.borrow_mut().temperature = 250;
        let clock = MockClock::new();
        let drive = DriveController::new("dm", Box::new(link.clone()), Box::new(clock.clone()));
        (drive, link, clock)
    }

    /// Sent speed command converted back to m/s (default 0.001 m per tick)
    fn speed_of(sent: Option<Sent>) -> (f64, f64) {
        match sent {
            Some(Sent::Speed(_, left, right)) => (left as f64 * 0.001, right as f64 * 0.001),
            other => panic!("expected a speed command, got {:?}", other),
        }
    }

    fn close(a: (f64, f64), b: (f64, f64)) -> bool {
        (a.0 - b.0).abs() < 0.002 && (a.1 - b.1).abs() < 0.002
    }

    #[test]
    fn test_idle_sends_zero_power() {
        let (mut drive, link, _clock) = drive();
        drive.tick();
        assert_eq!(link.last(), Some(Sent::Duty(0, 0)));
        assert_eq!(drive.mode(), DriveMode::Idle);
    }

    #[test]
    fn test_power_times_out_to_idle() {
        let (mut drive, link, clock) = drive();
        drive.trigger_power(0.5, -0.5);
        assert_eq!(drive.mode(), DriveMode::Powering);

        drive.tick();
        assert_eq!(link.last(), Some(Sent::Duty(16383, -16383)));

        clock.set_ms(600);
        drive.tick();
        assert_eq!(drive.mode(), DriveMode::Idle);
        assert_eq!(link.last(), Some(Sent::Duty(0, 0)));
    }

    #[test]
    fn test_power_is_clamped() {
        let (mut drive, link, _clock) = drive();
        drive.trigger_power(3.0, -7.0);
        drive.tick();
        assert_eq!(link.last(), Some(Sent::Duty(32767, -32767)));
    }

    #[test]
    fn test_speed_profile() {
        let (mut drive, link, clock) = drive();
        drive.trigger_speed(1.0, 1.0);
        assert_eq!(drive.mode(), DriveMode::Speeding);

        clock.set_ms(100);
        drive.tick();
        assert!(close(speed_of(link.last()), (1.0, 1.0)));

        clock.set_ms(350);
        drive.tick();
        assert!(close(speed_of(link.last()), (0.5, 0.5)));

        clock.set_ms(600);
        drive.tick();
        assert_eq!(speed_of(link.last()), (0.0, 0.0));
        assert_eq!(drive.mode(), DriveMode::Speeding);

        clock.set_ms(800);
        drive.tick();
        assert_eq!(drive.mode(), DriveMode::Idle);
        assert_eq!(link.last(), Some(Sent::Duty(0, 0)));
    }

    #[test]
    fn test_speed_acceleration_in_counts() {
        let (mut drive, link, _clock) = drive();
        drive.trigger_speed(0.2, 0.2);
        drive.tick();
        match link.last() {
            Some(Sent::Speed(accel, _, _)) => assert!((699..=700).contains(&accel)),
            other => panic!("expected speed, got {:?}", other),
        }
    }

    #[test]
    fn test_power_overrides_speed() {
        let (mut drive, _link, _clock) = drive();
        drive.trigger_speed(1.0, 1.0);
        drive.trigger_power(0.2, 0.2);
        assert_eq!(drive.mode(), DriveMode::Powering);
        // Speed never preempts power
        drive.trigger_speed(1.0, 1.0);
        assert_eq!(drive.mode(), DriveMode::Powering);
    }

    #[test]
    fn test_brake_holds_zero_speed() {
        let (mut drive, link, clock) = drive();
        drive.brake();
        assert_eq!(drive.mode(), DriveMode::Idle);

        drive.trigger_speed(1.0, 1.0);
        drive.brake();
        assert_eq!(drive.mode(), DriveMode::Braking);

        clock.set_ms(900);
        drive.tick();
        assert_eq!(speed_of(link.last()), (0.0, 0.0));

        clock.set_ms(1001);
        drive.tick();
        assert_eq!(drive.mode(), DriveMode::Idle);
    }

    #[test]
    fn test_thermal_cutoff_zeroes_every_command() {
        let (mut drive, link, _clock) = drive();
        link.0.borrow_mut().temperature = 705;

        drive.trigger_power(1.0, 1.0);
        drive.tick();
        assert!(drive.temperature() > 70.0);
        assert_eq!(link.last(), Some(Sent::Duty(0, 0)));
        assert_eq!(drive.mode(), DriveMode::Powering);

        drive.to_idle();
        drive.trigger_speed(1.0, 1.0);
        drive.tick();
        assert_eq!(link.last(), Some(Sent::Duty(0, 0)));
        assert_eq!(drive.mode(), DriveMode::Speeding);
    }

    #[test]
    fn test_bump_reverses_then_locks_out_speed() {
        let (drive, link, clock) = drive();
        let bumper = ManualInput::new();
        let mut drive = drive.with_bumper(Box::new(bumper.clone()));
        link.0.borrow_mut().speeds = (500, -500);

        drive.trigger_speed(1.0, 1.0);
        drive.tick();
        assert_eq!(drive.mode(), DriveMode::Speeding);

        clock.set_ms(50);
        bumper.set(true);
        drive.tick();
        assert_eq!(drive.mode(), DriveMode::Reversing);
        assert_eq!(drive.reverse_power(), (-1.0, 1.0));
        assert_eq!(link.last(), Some(Sent::Duty(-32767, 32767)));

        bumper.set(false);
        clock.set_ms(250);
        drive.tick();
        assert_eq!(link.last(), Some(Sent::Duty(-16383, 16383)));

        clock.set_ms(500);
        drive.tick();
        assert_eq!(drive.mode(), DriveMode::Idle);

        // Within two seconds of the bump, speed commands do not engage
        clock.set_ms(1500);
        drive.trigger_speed(1.0, 1.0);
        assert_eq!(drive.mode(), DriveMode::Idle);

        clock.set_ms(2100);
        drive.tick();
        drive.trigger_speed(1.0, 1.0);
        assert_eq!(drive.mode(), DriveMode::Speeding);
    }

    #[test]
    fn test_bump_ignored_outside_speeding() {
        let (mut drive, _link, _clock) = drive();
        drive.trigger_bump(0.5, 0.5);
        assert_eq!(drive.mode(), DriveMode::Idle);
        drive.trigger_power(0.5, 0.5);
        drive.trigger_bump(0.5, 0.5);
        assert_eq!(drive.mode(), DriveMode::Powering);
    }

    #[test]
    fn test_bump_at_standstill_reverses_forward() {
        let (mut drive, _link, _clock) = drive();
        drive.trigger_speed(1.0, 1.0);
        drive.trigger_bump(0.0, -0.1);
        assert_eq!(drive.reverse_power(), (1.0, 1.0));
    }

    #[test]
    fn test_failures_escalate_and_reset() {
        let (mut drive, link, _clock) = drive();
        link.0.borrow_mut().fail_reads = true;

        drive.tick();
        drive.tick();
        drive.tick();
        assert_eq!(drive.link_failures(), 3);
        assert_eq!(link.0.borrow().clears, 3);
        // Failed reads skip the rest of the cycle
        assert_eq!(link.sent_count(), 0);

        link.0.borrow_mut().fail_reads = false;
        drive.tick();
        assert_eq!(drive.link_failures(), 0);
        assert_eq!(link.sent_count(), 1);
    }

    #[test]
    fn test_telemetry_failure_does_not_block_motion() {
        let (mut drive, link, _clock) = drive();
        link.0.borrow_mut().fail_telemetry = true;
        drive.trigger_power(0.5, 0.5);
        drive.tick();
        assert_eq!(link.last(), Some(Sent::Duty(16383, 16383)));
        assert_eq!(drive.link_failures(), 0);
        assert_eq!(link.0.borrow().clears, 0);
        // Last good reading is kept
        assert_eq!(drive.temperature(), 0.0);
    }

    #[test]
    fn test_write_failures_escalate_and_clear() {
        let (mut drive, link, clock) = drive();
        link.0.borrow_mut().fail_writes = true;

        drive.trigger_speed(1.0, 1.0);
        drive.tick();
        assert_eq!(drive.link_failures(), 1);
        drive.tick();
        drive.tick();
        assert_eq!(drive.link_failures(), 3);
        assert_eq!(link.0.borrow().clears, 3);
        assert_eq!(link.sent_count(), 0);
        // The phase timing is unaffected by failed sends
        assert_eq!(drive.mode(), DriveMode::Speeding);

        link.0.borrow_mut().fail_writes = false;
        clock.set_ms(100);
        drive.tick();
        assert_eq!(drive.link_failures(), 0);
        assert!(close(speed_of(link.last()), (1.0, 1.0)));
    }

    #[test]
    fn test_link_health_levels() {
        let mut health = LinkHealth::default();
        assert_eq!(health.record_failure(), Level::WARN);
        assert_eq!(health.record_failure(), Level::WARN);
        assert_eq!(health.record_failure(), Level::ERROR);
        assert_eq!(health.record_failure(), Level::ERROR);
        health.record_success();
        assert_eq!(health.failures(), 0);
        assert_eq!(health.record_failure(), Level::WARN);
    }

    #[test]
    fn test_counter_diff_speeds() {
        let (mut drive, link, clock) = drive();
        drive.set_parameter("use300HzSpeedReadings", "0").unwrap();

        link.0.borrow_mut().encoders = (u32::MAX - 49, 1000);
        clock.set_ms(1000);
        drive.tick();
        // No reference sample yet
        assert_eq!(drive.linear_speed(), 0.0);

        link.0.borrow_mut().encoders = (50, 1300);
        clock.set_ms(1100);
        drive.tick();
        // left: 100 ticks across rollover, right: 300 ticks, over 0.1s
        assert!((drive.linear_speed() - 2.0).abs() < 1e-9);
        assert!((drive.angular_speed() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_closed_loop_speeds() {
        let (mut drive, link, _clock) = drive();
        drive.set_parameter("width", "0.5").unwrap();
        link.0.borrow_mut().speeds = (1000, 2000);
        drive.tick();
        assert!((drive.linear_speed() - 1.5).abs() < 1e-9);
        assert!((drive.angular_speed() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_commands() {
        let (mut drive, _link, _clock) = drive();
        drive.handle_command(&Command::new("speed", "1,1")).unwrap();
        let setpoint = drive.speed_setpoint();
        assert!((setpoint.left - 1.0 / 3.0).abs() < 1e-9);
        assert!((setpoint.right - 1.0).abs() < 1e-9);

        drive.handle_command(&Command::new("left", "2")).unwrap();
        assert_eq!(drive.speed_setpoint(), WheelSpeeds::new(-1.0, 1.0));
        drive.handle_command(&Command::new("right", "2")).unwrap();
        assert_eq!(drive.speed_setpoint(), WheelSpeeds::new(1.0, -1.0));

        drive.handle_command(&Command::new("stop", "")).unwrap();
        assert_eq!(drive.mode(), DriveMode::Braking);

        assert_eq!(
            drive.handle_command(&Command::new("fly", "")),
            Err(CommandError::UnknownCommand("fly".to_string()))
        );
        assert_eq!(
            drive.handle_command(&Command::new("pw", "0.5")),
            Err(CommandError::MissingParameter("right"))
        );
    }

    #[test]
    fn test_bare_number_is_speed() {
        let (mut drive, _link, _clock) = drive();
        drive.handle_command(&Command::new("0.5", "")).unwrap();
        assert_eq!(drive.mode(), DriveMode::Speeding);
        assert_eq!(drive.speed_setpoint(), WheelSpeeds::new(0.5, 0.5));
    }

    #[test]
    fn test_parameters() {
        let (mut drive, _link, _clock) = drive();
        assert!(drive.set_parameter("mPerTick", "0.0002").is_ok());
        assert!(drive.set_parameter("bumper_debounce", "250").is_ok());
        assert!(drive.set_parameter("width", "0").is_err());
        assert_eq!(
            drive.set_parameter("colour", "red"),
            Err(CommandError::UnknownKey("colour".to_string()))
        );
    }

    #[test]
    fn test_status_text() {
        let (mut drive, link, _clock) = drive();
        link.0.borrow_mut().battery = 123;
        drive.tick();
        assert_eq!(drive.status_text(), "0.0000\t0.0000\t25.0\t12.3\tIDLE");
    }

    #[test]
    fn test_drop_zeroes_outputs() {
        let (mut drive, link, _clock) = drive();
        drive.trigger_power(1.0, 1.0);
        drive.tick();
        drop(drive);
        assert_eq!(link.last(), Some(Sent::Duty(0, 0)));
    }
}
