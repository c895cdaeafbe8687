// Actuator controllers
//
// Provides:
// - Differential drive kinematics
// - RoboClaw packet serial protocol and the drive state machine built on it
// - ODrive CAN frame map and the servo axis controller built on it

pub mod axis;
pub mod drive;
pub mod kinematics;
pub mod odrive;
pub mod roboclaw;

pub use axis::{AxisController, AxisMode};
pub use drive::{DriveController, DriveMode, SpeedSensing};
pub use kinematics::{WheelSpeeds, curvature_to_wheels};
pub use roboclaw::{MotorLink, RoboClaw, RoboClawError};
