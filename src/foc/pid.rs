// PID controller with rate-limited integral and telemetry-visible state
//
// The controller state lives in a separate plain struct so that the servo
// can publish it for telemetry without copying.

/// PID gains and limits
#[derive(Debug, Clone, Copy)]
pub struct PidConfig {
    /// Proportional gain
    pub kp: f32,
    /// Integral gain
    pub ki: f32,
    /// Derivative gain (applied to the rate error)
    pub kd: f32,
    /// Maximum integral change per second (negative disables the limit)
    pub iratelimit: f32,
    /// Symmetric clamp on the integral term (0 disables the clamp)
    pub ilimit: f32,
    /// Output sign, +1 or -1
    pub sign: f32,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
            iratelimit: -1.0,
            ilimit: 0.0,
            sign: 1.0,
        }
    }
}

/// Per-cycle scaling of the proportional and derivative terms
///
/// Lets a caller soften or disable terms for one update without touching
/// the configured gains.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    pub kp_scale: f32,
    pub kd_scale: f32,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            kp_scale: 1.0,
            kd_scale: 1.0,
        }
    }
}

/// Internal controller state, published for telemetry
#[derive(Debug, Clone, Copy, Default)]
pub struct PidState {
    /// Integral accumulator
    pub integral: f32,
    /// Last commanded setpoint
    pub desired: f32,
    /// Last error (measured - desired)
    pub error: f32,
    /// Last rate error
    pub error_rate: f32,
    /// Proportional term of the last update
    pub p: f32,
    /// Derivative term of the last update
    pub d: f32,
    /// p + d of the last update
    pub pd: f32,
    /// Last output
    pub command: f32,
}

impl PidState {
    /// Reset everything to zero
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl PidConfig {
    /// Run one controller update
    ///
    /// # Arguments
    /// * `state` - controller state, updated in place
    /// * `measured` / `desired` - process value and setpoint
    /// * `measured_rate` / `desired_rate` - their time derivatives
    /// * `rate_hz` - update rate this is being called at
    /// * `options` - per-cycle term scaling
    ///
    /// # Returns
    /// Controller output, `sign * (p + d + integral)`
    pub fn apply(
        &self,
        state: &mut PidState,
        measured: f32,
        desired: f32,
        measured_rate: f32,
        desired_rate: f32,
        rate_hz: f32,
        options: &ApplyOptions,
    ) -> f32 {
        state.desired = desired;
        state.error = measured - desired;
        state.error_rate = measured_rate - desired_rate;

        let mut to_update_i = state.error * self.ki / rate_hz;
        if self.iratelimit >= 0.0 {
            let max_i_update = self.iratelimit / rate_hz;
            to_update_i = to_update_i.clamp(-max_i_update, max_i_update);
        }

        state.integral += to_update_i;

        if self.ilimit > 0.0 {
            state.integral = state.integral.clamp(-self.ilimit, self.ilimit);
        }

        state.p = options.kp_scale * self.kp * state.error;
        state.d = options.kd_scale * self.kd * state.error_rate;
        state.pd = state.p + state.d;

        state.command = self.sign * (state.pd + state.integral);
        state.command
    }
}
