//! Hardware abstraction consumed by the motion dispatcher.
//!
//! The [`Hal`] trait is the full set of operations the core requires; the two
//! implementations are the Raspberry Pi DMA backend (`hal-rpi`) and the
//! [`VirtualHal`] here, which executes nothing but *verifies* every pulse
//! stream against the generator contract. The dispatcher and all of its tests
//! run unchanged against either.

mod virtual_hal;

use std::sync::Arc;

use core_pulses::PulseGenerator;
use thiserror::Error;

pub use virtual_hal::{VirtualHal, VirtualState};

/// Temperature read failures. The first three are distinct hardware
/// conditions the thermistor circuit can report; `Io` covers ordinary bus
/// errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemperatureError {
    #[error("temperature sensor is not connected")]
    SensorAbsent,
    #[error("short circuit")]
    ShortCircuit,
    #[error("thermistor not connected")]
    OpenCircuit,
    #[error("sensor read failed: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum HalError {
    #[error("pulse stream invariant violated: {0}")]
    PulseInvariant(String),
    #[error("hardware access failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations the motion core requires from a hardware backend.
///
/// `move_pulses` only has to *enqueue* the stream; `join` provides synchronous
/// completion. Percent arguments are `0.0..=100.0`.
pub trait Hal: Send + Sync {
    /// Initialize pins and bring the machine to a known idle state.
    fn init(&self) -> Result<(), HalError>;
    /// Release the hardware: abort any motion, drop PWM, clear outputs.
    fn deinit(&self) -> Result<(), HalError>;
    fn spindle_control(&self, percent: f64) -> Result<(), HalError>;
    fn fan_control(&self, on: bool) -> Result<(), HalError>;
    fn extruder_heater_control(&self, percent: f64) -> Result<(), HalError>;
    fn bed_heater_control(&self, percent: f64) -> Result<(), HalError>;
    fn get_extruder_temperature(&self) -> Result<f64, TemperatureError>;
    fn get_bed_temperature(&self) -> Result<f64, TemperatureError>;
    /// Cut stepper holding current until the next movement.
    fn disable_steppers(&self) -> Result<(), HalError>;
    /// Home the selected axes against their endstops. `Ok(false)` means an
    /// endstop was never triggered.
    fn calibrate(&self, x: bool, y: bool, z: bool) -> Result<bool, HalError>;
    /// Emit (or enqueue) a pulse stream.
    fn move_pulses(&self, generator: PulseGenerator) -> Result<(), HalError>;
    /// Block until all enqueued motion has completed.
    fn join(&self) -> Result<(), HalError>;
}

pub type SharedHal = Arc<dyn Hal>;
