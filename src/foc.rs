// FOC (Field Oriented Control) math
// Rotor-frame transforms, PID control law, and the torque model

pub mod pid;
pub mod torque_model;
pub mod transforms;

// Re-export main types for easier access
pub use pid::{ApplyOptions, PidConfig, PidState};
pub use torque_model::TorqueModel;
pub use transforms::{dq_transform, inverse_dq_transform, normalize_angle, sin_cos, SinCos};
