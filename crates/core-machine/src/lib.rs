//! The machine state model and G-code dispatcher.
//!
//! [`GMachine`] owns the authoritative machine state (position, modes, sticky
//! feed rate, heaters) and interprets one parsed G-code line per
//! [`GMachine::do_command`] call: it validates the command against the
//! physical limits from the configuration, converts it into motion primitives
//! and hands those to the HAL. State is only updated after the HAL accepted
//! the motion, so a rejected command leaves the machine untouched.

mod arc;
mod error;
mod motion;
mod temperature;

use std::sync::Arc;
use std::time::Duration;

use core_config::MachineConfig;
use core_gcode::GcodeLine;
use core_geometry::{Plane, RotationDirection, Vector4};
use core_hal::SharedHal;
use core_heater::{Heater, HeaterTuning};
use tracing::debug;

pub use error::MachineError;
use temperature::HeaterKind;

pub struct GMachine {
    hal: SharedHal,
    config: Arc<MachineConfig>,
    heater_tuning: HeaterTuning,
    position: Vector4,
    velocity_mm_per_min: f64,
    spindle_rpm: f64,
    local_offset: Vector4,
    unit_factor: f64,
    absolute: bool,
    plane: Plane,
    extruder: Option<Heater>,
    bed: Option<Heater>,
    fan_on: bool,
}

impl GMachine {
    /// Create the machine model and initialize the hardware.
    pub fn new(hal: SharedHal, config: Arc<MachineConfig>) -> Result<Self, MachineError> {
        hal.init()?;
        let mut machine = Self {
            hal,
            config,
            heater_tuning: HeaterTuning::default(),
            position: Vector4::zero(),
            velocity_mm_per_min: 0.0,
            spindle_rpm: 0.0,
            local_offset: Vector4::zero(),
            unit_factor: 1.0,
            absolute: true,
            plane: Plane::Xy,
            extruder: None,
            bed: None,
            fan_on: false,
        };
        machine.reset();
        Ok(machine)
    }

    /// Override heater worker timing (tests).
    pub fn with_heater_tuning(mut self, tuning: HeaterTuning) -> Self {
        self.heater_tuning = tuning;
        self
    }

    /// Reinitialize everything a G-code program can configure (M2/M30).
    pub fn reset(&mut self) {
        let c = &self.config.file.control;
        self.velocity_mm_per_min = c
            .max_velocity_mm_per_min_x
            .min(c.max_velocity_mm_per_min_y)
            .min(c.max_velocity_mm_per_min_z)
            .min(c.max_velocity_mm_per_min_e);
        self.spindle_rpm = 1000.0_f64.min(c.spindle_max_rpm);
        self.local_offset = Vector4::zero();
        self.unit_factor = 1.0;
        self.absolute = true;
        self.plane = Plane::Xy;
    }

    /// Stop everything and free the hardware. Best effort: every sub-step is
    /// attempted even if a previous one failed.
    pub fn release(&mut self) {
        let _ = self.hal.spindle_control(0.0);
        self.stop_heater(HeaterKind::Extruder);
        self.stop_heater(HeaterKind::Bed);
        let _ = self.fan(false);
        let _ = self.hal.deinit();
    }

    /// Current machine position, after waiting for queued motion to finish.
    pub fn position(&self) -> Result<Vector4, MachineError> {
        self.hal.join()?;
        Ok(self.position)
    }

    pub fn plane(&self) -> Plane {
        self.plane
    }

    /// Target of the extruder heater; zero when disabled.
    pub fn extruder_target_temperature(&self) -> f64 {
        self.extruder
            .as_ref()
            .map(Heater::target_temperature)
            .unwrap_or(0.0)
    }

    /// Target of the bed heater; zero when disabled.
    pub fn bed_target_temperature(&self) -> f64 {
        self.bed
            .as_ref()
            .map(Heater::target_temperature)
            .unwrap_or(0.0)
    }

    /// Execute one parsed line. Returns an optional reply for the operator
    /// (position and temperature reports).
    pub fn do_command(&mut self, line: &GcodeLine) -> Result<Option<String>, MachineError> {
        let command = match line.command() {
            Some(c) => Some(c),
            // a bare coordinate line continues the previous linear motion
            None if line.has_coordinates() => Some("G1".to_string()),
            None => None,
        };
        debug!(target: "machine", command = command.as_deref(), "dispatch");

        // coordinate resolution
        let delta = if self.absolute {
            let target = line.coordinates(self.position - self.local_offset, self.unit_factor)
                + self.local_offset;
            target - self.position
        } else {
            line.coordinates(Vector4::zero(), self.unit_factor)
        };
        let radius = line.radius(Vector4::zero(), self.unit_factor);
        let velocity = line.get('F', self.velocity_mm_per_min, self.unit_factor);
        if velocity < self.config.file.control.min_velocity_mm_per_min {
            return Err(MachineError::BadFeedRate);
        }
        let max_feed = core_geometry::Axis::ALL
            .iter()
            .map(|a| self.config.max_velocity(*a))
            .fold(0.0f64, f64::max);
        if velocity > max_feed && !self.config.file.control.auto_velocity_adjustment {
            return Err(MachineError::BadFeedRate);
        }

        let mut reply = None;
        match command.as_deref() {
            Some("G0") => {
                let rapid = self.rapid_velocity(&delta);
                self.move_linear(delta, rapid)?;
            }
            Some("G1") => {
                let admitted = self.admit_linear_velocity(&delta, velocity)?;
                self.move_linear(delta, admitted)?;
            }
            Some("G2") => {
                self.move_circular(delta, radius, RotationDirection::Cw, velocity)?;
            }
            Some("G3") => {
                self.move_circular(delta, radius, RotationDirection::Ccw, velocity)?;
            }
            Some("G4") => {
                if !line.has('P') {
                    return Err(MachineError::BadDelay);
                }
                let pause = line.get('P', 0.0, 1.0);
                if pause < 0.0 {
                    return Err(MachineError::BadDelay);
                }
                self.hal.join()?;
                std::thread::sleep(Duration::from_secs_f64(pause));
            }
            Some("G17") => self.plane = Plane::Xy,
            Some("G18") => self.plane = Plane::Zx,
            Some("G19") => self.plane = Plane::Yz,
            Some("G20") => self.unit_factor = 25.4,
            Some("G21") => self.unit_factor = 1.0,
            Some("G28") => {
                let (mut x, mut y, mut z) = (line.has('X'), line.has('Y'), line.has('Z'));
                if !x && !y && !z {
                    (x, y, z) = (true, true, true);
                }
                self.safe_zero(x, y, z)?;
                self.hal.join()?;
                if !self.hal.calibrate(x, y, z)? {
                    return Err(MachineError::CalibrationFailed);
                }
                // endstops define machine zero for the homed axes
                if x {
                    self.position = self.position.with_axis(core_geometry::Axis::X, 0.0);
                }
                if y {
                    self.position = self.position.with_axis(core_geometry::Axis::Y, 0.0);
                }
                if z {
                    self.position = self.position.with_axis(core_geometry::Axis::Z, 0.0);
                }
            }
            Some("G53") => self.local_offset = Vector4::zero(),
            Some("G90") => self.absolute = true,
            Some("G91") => self.absolute = false,
            Some("G92") => {
                if line.has_coordinates() {
                    self.local_offset =
                        self.position - line.coordinates(Vector4::zero(), self.unit_factor);
                } else {
                    self.local_offset = self.position;
                }
            }
            Some("M3") => {
                let rpm = line.get('S', self.spindle_rpm, 1.0);
                self.spindle(rpm)?;
                self.spindle_rpm = rpm;
            }
            Some("M5") => self.spindle(0.0)?,
            Some("M2") | Some("M30") => self.reset(),
            Some("M82") => {
                if !self.absolute {
                    return Err(MachineError::AmbiguousExtruderMode);
                }
            }
            Some("M83") => {
                if self.absolute {
                    return Err(MachineError::AmbiguousExtruderMode);
                }
            }
            Some("M84") => self.hal.disable_steppers()?,
            Some("M104") => self.set_heater_target(line, HeaterKind::Extruder, false)?,
            Some("M105") => reply = Some(self.report_temperatures()?),
            Some("M106") => {
                let on = line.get('S', 1.0, 1.0) != 0.0;
                self.fan(on)?;
            }
            Some("M107") => self.fan(false)?,
            Some("M109") => self.set_heater_target(line, HeaterKind::Extruder, true)?,
            Some("M111") => {
                // log level switching lives in the front end; accepted here
                // so scripts carrying it keep running
            }
            Some("M114") => {
                let p = self.position;
                reply = Some(format!("X:{} Y:{} Z:{} E:{}", p.x, p.y, p.z, p.e));
            }
            Some("M140") => self.set_heater_target(line, HeaterKind::Bed, false)?,
            Some("M190") => self.set_heater_target(line, HeaterKind::Bed, true)?,
            None => {}
            Some(_) => return Err(MachineError::UnknownCommand),
        }

        // sticky feed rate survives only successful commands
        self.velocity_mm_per_min = velocity;
        Ok(reply)
    }

    fn spindle(&mut self, rpm: f64) -> Result<(), MachineError> {
        let max = self.config.file.control.spindle_max_rpm;
        if rpm < 0.0 || rpm > max {
            return Err(MachineError::BadSpindleSpeed);
        }
        self.hal.join()?;
        self.hal.spindle_control(100.0 * rpm / max)?;
        Ok(())
    }
}

impl Drop for GMachine {
    fn drop(&mut self) {
        self.stop_heater(HeaterKind::Extruder);
        self.stop_heater(HeaterKind::Bed);
    }
}
