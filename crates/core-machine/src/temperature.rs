//! Heater and fan commands: M104/M109, M140/M190, M105, M106/M107.

use std::sync::Arc;

use core_gcode::GcodeLine;
use core_heater::{ControlFn, Heater, MeasureFn};
use tracing::warn;

use crate::{GMachine, MachineError};

/// Which heater a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaterKind {
    Extruder,
    Bed,
}

impl GMachine {
    /// M104/M140 set the target; M109/M190 additionally block until the
    /// temperature is reached and held. Target zero disables the heater.
    pub(crate) fn set_heater_target(
        &mut self,
        line: &GcodeLine,
        kind: HeaterKind,
        wait: bool,
    ) -> Result<(), MachineError> {
        if !line.has('S') {
            return Err(MachineError::MissingTemperature);
        }
        let target = line.get('S', 0.0, 1.0);
        if target == 0.0 {
            self.stop_heater(kind);
            return Ok(());
        }
        let t = &self.config.file.temperature;
        let limit = match kind {
            HeaterKind::Extruder => t.extruder_max_temperature,
            HeaterKind::Bed => t.bed_max_temperature,
        };
        if target < t.min_temperature || target > limit {
            return Err(MachineError::BadTemperature);
        }

        let coefficients = match kind {
            HeaterKind::Extruder => t.extruder_pid,
            HeaterKind::Bed => t.bed_pid,
        };

        // one live worker per heater; a new target replaces the old one
        self.stop_heater(kind);
        let hal = self.hal.clone();
        let measure: MeasureFn = match kind {
            HeaterKind::Extruder => Arc::new(move || {
                hal.get_extruder_temperature().map_err(Into::into)
            }),
            HeaterKind::Bed => Arc::new(move || hal.get_bed_temperature().map_err(Into::into)),
        };
        let hal = self.hal.clone();
        let control: ControlFn = match kind {
            HeaterKind::Extruder => Arc::new(move |percent| {
                if let Err(err) = hal.extruder_heater_control(percent) {
                    warn!(target: "machine", ?err, "extruder_heater_write_failed");
                }
            }),
            HeaterKind::Bed => Arc::new(move |percent| {
                if let Err(err) = hal.bed_heater_control(percent) {
                    warn!(target: "machine", ?err, "bed_heater_write_failed");
                }
            }),
        };
        let heater = Heater::spawn(target, coefficients, self.heater_tuning, measure, control);
        if kind == HeaterKind::Extruder && self.config.file.control.auto_fan_on && !self.fan_on {
            self.fan(true)?;
        }
        let slot = match kind {
            HeaterKind::Extruder => &mut self.extruder,
            HeaterKind::Bed => &mut self.bed,
        };
        let heater = slot.insert(heater);
        if wait {
            heater.wait();
        }
        Ok(())
    }

    pub(crate) fn stop_heater(&mut self, kind: HeaterKind) {
        let slot = match kind {
            HeaterKind::Extruder => &mut self.extruder,
            HeaterKind::Bed => &mut self.bed,
        };
        if let Some(heater) = slot.take() {
            heater.stop();
        }
    }

    /// M105 reply. Only fails when both sensors are unreadable.
    pub(crate) fn report_temperatures(&self) -> Result<String, MachineError> {
        let extruder = self.hal.get_extruder_temperature();
        let bed = self.hal.get_bed_temperature();
        if extruder.is_err() && bed.is_err() {
            return Err(MachineError::SensorFailure);
        }
        let format = |reading: Result<f64, _>| match reading {
            Ok(t) => format!("{t:.1}"),
            Err(_) => "error".to_string(),
        };
        Ok(format!("E:{} B:{}", format(extruder), format(bed)))
    }

    pub(crate) fn fan(&mut self, on: bool) -> Result<(), MachineError> {
        self.hal.fan_control(on)?;
        self.fan_on = on;
        Ok(())
    }
}
