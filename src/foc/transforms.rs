// Coordinate transformations for FOC (Field Oriented Control)
// Clarke+Park ("DQ") transform between the stator phases and the rotor frame

use libm::{cosf, sinf};

// Enable idsp-based fast trigonometric functions
const USE_IDSP_COSSIN: bool = true;

/// Sine and cosine of the electrical angle, computed once per cycle and
/// shared by every transform in that cycle.
#[derive(Debug, Clone, Copy)]
pub struct SinCos {
    pub s: f32,
    pub c: f32,
}

/// Compute sin/cos of an electrical angle in radians
///
/// # Implementation
/// Uses idsp::cossin() for fast trigonometric calculation (~40 cycles on
/// Cortex-M) compared to libm::cosf/sinf (~100-200 cycles). Can be switched
/// via USE_IDSP_COSSIN.
pub fn sin_cos(theta: f32) -> SinCos {
    if USE_IDSP_COSSIN {
        sin_cos_idsp(theta)
    } else {
        SinCos {
            s: sinf(theta),
            c: cosf(theta),
        }
    }
}

/// sin/cos using idsp::cossin() (fast, ~40 cycles on Cortex-M)
#[inline]
fn sin_cos_idsp(theta: f32) -> SinCos {
    // Convert theta (radians, 0 to 2π) to idsp phase format (i32, full scale)
    // idsp uses i32::MIN (-2^31) to i32::MAX (2^31-1) to represent -π to π
    // First normalize theta from [0, 2π] to [-π, π]
    use core::f32::consts::{PI, TAU};
    let normalized_theta = if theta > PI { theta - TAU } else { theta };

    // Then scale to i32 range: phase = normalized_theta * (2^31 / π)
    const SCALE: f32 = 2147483648.0 / PI; // 2^31 / π
    let phase: i32 = (normalized_theta * SCALE) as i32;

    // cossin() returns (cos, sin) as (i32, i32) in range [-2^31, 2^31-1]
    let (cos_i32, sin_i32) = idsp::cossin(phase);

    // Convert i32 to f32 and normalize to [-1.0, 1.0]
    const I32_TO_F32: f32 = 1.0 / 2147483648.0; // 1 / 2^31
    SinCos {
        s: sin_i32 as f32 * I32_TO_F32,
        c: cos_i32 as f32 * I32_TO_F32,
    }
}

const SQRT3_DIV_2: f32 = 0.866_025_4; // sqrt(3) / 2
const ONE_DIV_SQRT3: f32 = 0.577_350_3; // 1 / sqrt(3)

/// DQ transformation (abc → dq)
///
/// Amplitude-invariant Clarke transform followed by the Park rotation into
/// the rotor frame.
///
/// # Arguments
/// * `sc` - sin/cos of the electrical angle
/// * `a`, `b`, `c` - instantaneous phase currents
///
/// # Returns
/// Tuple of (d, q) rotor-frame currents
pub fn dq_transform(sc: &SinCos, a: f32, b: f32, c: f32) -> (f32, f32) {
    let i_alpha = (2.0 * a - b - c) * (1.0 / 3.0);
    let i_beta = (b - c) * ONE_DIV_SQRT3;

    let d = i_alpha * sc.c + i_beta * sc.s;
    let q = i_beta * sc.c - i_alpha * sc.s;

    (d, q)
}

/// Inverse DQ transformation (dq → abc)
///
/// Park rotation back into the stationary frame followed by the inverse
/// Clarke transform to three-phase quantities.
///
/// # Arguments
/// * `sc` - sin/cos of the electrical angle
/// * `d` - d-axis voltage (aligned with rotor flux)
/// * `q` - q-axis voltage (perpendicular to rotor flux, produces torque)
///
/// # Returns
/// Tuple of (a, b, c) phase voltages
pub fn inverse_dq_transform(sc: &SinCos, d: f32, q: f32) -> (f32, f32, f32) {
    let v_alpha = d * sc.c - q * sc.s;
    let v_beta = d * sc.s + q * sc.c;

    let a = v_alpha;
    let b = -0.5 * v_alpha + SQRT3_DIV_2 * v_beta;
    let c = -0.5 * v_alpha - SQRT3_DIV_2 * v_beta;

    (a, b, c)
}

/// Normalize angle to range [0, 2π)
pub fn normalize_angle(angle: f32) -> f32 {
    use core::f32::consts::TAU;

    let mut normalized = angle;
    while normalized >= TAU {
        normalized -= TAU;
    }
    while normalized < 0.0 {
        normalized += TAU;
    }
    normalized
}
