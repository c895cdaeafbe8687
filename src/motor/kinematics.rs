// Differential drive kinematics
// Converts a linear speed plus path curvature into left/right wheel speeds,
// and measured wheel speeds back into body velocities.

/// Wheel speeds in m/s
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WheelSpeeds {
    pub left: f64,
    pub right: f64,
}

impl WheelSpeeds {
    pub fn new(left: f64, right: f64) -> Self {
        Self { left, right }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(self.left * factor, self.right * factor)
    }
}

/// Wheel speeds for driving `speed` m/s along an arc of the given curvature (1/m)
///
/// The inner/outer ratio follows the curvature, and both sides are scaled so the
/// faster wheel never exceeds `|speed|`.
pub fn curvature_to_wheels(speed: f64, curvature: f64, width: f64) -> WheelSpeeds {
    let delta = speed * width * curvature / 2.0;
    let left = speed - delta;
    let right = speed + delta;

    let factor_left = if left != 0.0 { speed.abs() / left.abs() } else { 1.0 };
    let factor_right = if right != 0.0 { speed.abs() / right.abs() } else { 1.0 };
    let factor = factor_left.min(factor_right);

    WheelSpeeds::new(left * factor, right * factor)
}

/// Turn on the spot; positive `speed` turns left (counter-clockwise)
pub fn pivot(speed: f64, width: f64) -> WheelSpeeds {
    let wheel = speed * width / 2.0;
    WheelSpeeds::new(-wheel, wheel)
}

/// Body velocities (linear m/s, angular rad/s) from measured wheel speeds
pub fn wheels_to_body(wheels: WheelSpeeds, width: f64) -> (f64, f64) {
    let linear = (wheels.left + wheels.right) / 2.0;
    let angular = (wheels.right - wheels.left) / width;
    (linear, angular)
}
