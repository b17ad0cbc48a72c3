// Phase-current to shaft-torque model
//
// Below the rotation cutoff current the motor torque scales linearly with
// q-axis current.  Beyond it magnetic saturation sets in and each additional
// amp buys progressively less torque; that region is modeled with a
// logarithmic curve whose inverse is exact.

use libm::{exp2f, fabsf, log2f};

/// Empirical correction applied when deriving the torque constant from the
/// back-EMF constant.  Consistent across every motor measured so far.
pub const TORQUE_CONSTANT_FUDGE: f32 = 0.78;

/// Bidirectional torque/current model
#[derive(Debug, Clone, Copy)]
pub struct TorqueModel {
    /// Linear-region torque constant [N·m/A]
    pub torque_constant: f32,
    /// Current where saturation begins [A]
    pub rotation_current_cutoff_a: f32,
    /// Current scale of the saturated region
    pub rotation_current_scale: f32,
    /// Torque scale of the saturated region
    pub rotation_torque_scale: f32,
}

impl TorqueModel {
    pub fn new(
        torque_constant: f32,
        rotation_current_cutoff_a: f32,
        rotation_current_scale: f32,
        rotation_torque_scale: f32,
    ) -> Self {
        Self {
            torque_constant,
            rotation_current_cutoff_a,
            rotation_current_scale,
            rotation_torque_scale,
        }
    }

    /// Torque produced by a given q-axis current
    pub fn current_to_torque(&self, current: f32) -> f32 {
        let abs_current = fabsf(current);
        if abs_current < self.rotation_current_cutoff_a {
            return current * self.torque_constant;
        }

        let sign = if current > 0.0 { 1.0 } else { -1.0 };
        sign * (self.rotation_current_cutoff_a * self.torque_constant
            + self.rotation_torque_scale
                * log2f(
                    1.0 + (abs_current - self.rotation_current_cutoff_a)
                        * self.rotation_current_scale,
                ))
    }

    /// q-axis current required for a given torque
    pub fn torque_to_current(&self, torque: f32) -> f32 {
        let abs_torque = fabsf(torque);
        let max_linear_torque = self.rotation_current_cutoff_a * self.torque_constant;
        if abs_torque < max_linear_torque {
            return torque / self.torque_constant;
        }

        let sign = if torque > 0.0 { 1.0 } else { -1.0 };
        sign * ((exp2f((abs_torque - max_linear_torque) / self.rotation_torque_scale) - 1.0)
            / self.rotation_current_scale
            + self.rotation_current_cutoff_a)
    }
}
