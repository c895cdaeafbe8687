// ODrive CAN protocol: frame map and operating modes
//
// Arbitration id = axis base id + command offset. Payloads are 8 bytes,
// numeric values little-endian f32 unless noted.

/// Command offsets from the axis base id
pub const HEARTBEAT: u16 = 0x001; // in: byte0 = error code
pub const SET_AXIS_STATE: u16 = 0x007; // out: byte0 = axis state
pub const ENCODER_ESTIMATES: u16 = 0x009; // out: remote request, in: f32 raw tick
pub const SET_CONTROLLER_MODE: u16 = 0x00b; // out: byte0 = control mode, byte4 = input mode
pub const SET_INPUT_POS: u16 = 0x00c;
pub const SET_INPUT_VEL: u16 = 0x00d;
pub const SET_INPUT_TORQUE: u16 = 0x00e;
pub const SET_LIMITS: u16 = 0x00f; // velocity limit
pub const REBOOT: u16 = 0x016;
pub const CLEAR_ERRORS: u16 = 0x018;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisState {
    Idle = 0x1,
    ClosedLoopControl = 0x8,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Voltage = 0x0,
    Torque = 0x1,
    Velocity = 0x2,
    Position = 0x3,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Inactive = 0x0,
    Passthrough = 0x1,
    VelocityRamp = 0x2,
}

/// The remote configuration a motion command needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMode {
    pub axis_state: AxisState,
    pub control_mode: ControlMode,
    pub input_mode: InputMode,
}

impl RemoteMode {
    pub const IDLE: Self = Self::new(AxisState::Idle, ControlMode::Voltage, InputMode::Inactive);
    pub const POSITION: Self = Self::closed_loop(ControlMode::Position, InputMode::Passthrough);
    pub const VELOCITY_RAMP: Self = Self::closed_loop(ControlMode::Velocity, InputMode::VelocityRamp);
    pub const VELOCITY: Self = Self::closed_loop(ControlMode::Velocity, InputMode::Passthrough);
    pub const TORQUE: Self = Self::closed_loop(ControlMode::Torque, InputMode::Passthrough);

    const fn new(axis_state: AxisState, control_mode: ControlMode, input_mode: InputMode) -> Self {
        Self {
            axis_state,
            control_mode,
            input_mode,
        }
    }

    const fn closed_loop(control_mode: ControlMode, input_mode: InputMode) -> Self {
        Self::new(AxisState::ClosedLoopControl, control_mode, input_mode)
    }
}

pub fn axis_state_payload(state: AxisState) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0] = state as u8;
    data
}

pub fn controller_mode_payload(control_mode: ControlMode, input_mode: InputMode) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0] = control_mode as u8;
    data[4] = input_mode as u8;
    data
}

pub fn f32_payload(value: f32) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0..4].copy_from_slice(&value.to_le_bytes());
    data
}

/// Leading f32 of a payload, if there are at least four bytes
pub fn read_f32(data: &[u8]) -> Option<f32> {
    let bytes: [u8; 4] = data.get(0..4)?.try_into().ok()?;
    Some(f32::from_le_bytes(bytes))
}
