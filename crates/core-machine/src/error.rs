//! Machine-level command failures, surfaced to the operator as `ERROR <msg>`.

use core_hal::HalError;
use core_pulses::PulseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("out of effective area")]
    OutOfArea,
    #[error("bad feed rate")]
    BadFeedRate,
    #[error("bad spindle speed")]
    BadSpindleSpeed,
    #[error("bad delay")]
    BadDelay,
    #[error("bad temperature")]
    BadTemperature,
    #[error("temperature is not specified")]
    MissingTemperature,
    #[error("ambiguous extruder mode")]
    AmbiguousExtruderMode,
    #[error("zero radius arc")]
    ZeroRadius,
    #[error("temperature sensors failure")]
    SensorFailure,
    #[error("calibration failed")]
    CalibrationFailed,
    #[error("unknown command")]
    UnknownCommand,
    #[error(transparent)]
    Hal(#[from] HalError),
    #[error(transparent)]
    Pulse(#[from] PulseError),
}
