//! Hard real-time FOC servo core for three-phase BLDC motor controllers.
//!
//! The control pipeline runs synchronously with a center-aligned PWM timer:
//! every update event samples phase currents, bus voltage, temperatures and
//! an absolute magnetic encoder, transforms them into the rotor (d, q)
//! frame, runs the nested PID loops selected by the active mode, and writes
//! three duty cycles back to the inverter — all inside one PWM half-period.
//!
//! Peripherals and external collaborators are abstracted behind the traits
//! in [`hardware`], so the whole pipeline also runs on a host under
//! `cargo test` against mock implementations.

#![cfg_attr(not(test), no_std)]

mod fmt;

pub mod config;
pub mod foc;
pub mod hardware;
pub mod servo;

pub use config::{MotorConfig, PositionLimitConfig, ServoConfig};
pub use servo::data::{CommandData, CommandError, Control, ErrorCode, Mode, Status};
pub use servo::BldcServo;
