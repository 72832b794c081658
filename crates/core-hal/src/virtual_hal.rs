//! Virtual device backend. Nothing moves; instead every consumed pulse
//! stream is checked against the generator contract, which makes this the
//! workhorse of the dispatcher and pulse tests.

use std::sync::{Arc, Mutex, MutexGuard};

use core_config::MachineConfig;
use core_geometry::Vector4;
use core_pulses::{PulseEvent, PulseGenerator};
use tracing::{debug, info};

use crate::{Hal, HalError, TemperatureError};

/// Observable side effects, for tests and debugging.
#[derive(Debug, Clone)]
pub struct VirtualState {
    pub spindle_percent: f64,
    pub fan_on: bool,
    pub extruder_power_percent: f64,
    pub bed_power_percent: f64,
    pub steppers_disabled: bool,
    pub calibrated_axes: Option<(bool, bool, bool)>,
    /// Net delta of every verified pulse stream, in order.
    pub moves: Vec<Vector4>,
    /// What `calibrate` reports; tests can set `false`.
    pub calibrate_result: bool,
    /// Simulated sensor readings; `Err` simulates a failed sensor.
    pub extruder_temperature: Result<f64, TemperatureError>,
    pub bed_temperature: Result<f64, TemperatureError>,
}

pub struct VirtualHal {
    config: Arc<MachineConfig>,
    state: Mutex<VirtualState>,
}

impl VirtualHal {
    pub fn new(config: Arc<MachineConfig>) -> Self {
        let t = &config.file.temperature;
        let state = VirtualState {
            spindle_percent: 0.0,
            fan_on: false,
            extruder_power_percent: 0.0,
            bed_power_percent: 0.0,
            steppers_disabled: false,
            calibrated_axes: None,
            moves: Vec::new(),
            calibrate_result: true,
            extruder_temperature: Ok(t.extruder_max_temperature * 0.999),
            bed_temperature: Ok(t.bed_max_temperature * 0.999),
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, VirtualState> {
        self.state.lock().expect("virtual hal state poisoned")
    }

    /// Walk the whole stream checking the contract of the pulse generator:
    /// direction first, equal times within an event, strictly increasing
    /// per-axis times, signed pulse sums matching the advertised delta, and
    /// nothing beyond the total-time estimate.
    fn verify(&self, generator: PulseGenerator) -> Result<Vector4, HalError> {
        let delta = generator.delta();
        let ppm = generator.pulses_per_mm();
        let total_time = generator.total_time_s();

        let mut signs = [0i8; 4];
        let mut signed_steps = [0i64; 4];
        let mut last_time = [None::<f64>; 4];
        let mut max_time: f64 = 0.0;
        let mut direction_seen = false;

        for event in generator {
            match event {
                PulseEvent::Direction(d) => {
                    direction_seen = true;
                    signs = d;
                }
                PulseEvent::Step(times) => {
                    if !direction_seen {
                        return Err(invariant("pulse before direction event"));
                    }
                    let mut event_time = None;
                    for (axis, time) in times.iter().enumerate() {
                        let Some(time) = time else { continue };
                        if signs[axis] == 0 {
                            return Err(invariant("pulse on an idle axis"));
                        }
                        match event_time {
                            None => event_time = Some(*time),
                            Some(t) if t != *time => {
                                return Err(invariant("fast forwarded pulse detected"));
                            }
                            _ => {}
                        }
                        if let Some(prev) = last_time[axis]
                            && *time <= prev
                        {
                            return Err(invariant(
                                "negative or zero time delta between pulses",
                            ));
                        }
                        last_time[axis] = Some(*time);
                        signed_steps[axis] += signs[axis] as i64;
                        max_time = max_time.max(*time);
                    }
                    if event_time.is_none() {
                        return Err(invariant("empty pulse event"));
                    }
                }
            }
        }
        if !direction_seen {
            return Err(invariant("direction not found"));
        }
        let achieved = Vector4::new(
            signed_steps[0] as f64 / ppm[0],
            signed_steps[1] as f64 / ppm[1],
            signed_steps[2] as f64 / ppm[2],
            signed_steps[3] as f64 / ppm[3],
        );
        if achieved != delta {
            return Err(invariant("wrong number of pulses"));
        }
        if max_time > total_time + 1e-6 {
            return Err(invariant("interpolation time or pulses wrong"));
        }
        debug!(
            target: "hal.virtual",
            delta = %delta,
            pulses_x = signed_steps[0],
            pulses_y = signed_steps[1],
            pulses_z = signed_steps[2],
            pulses_e = signed_steps[3],
            estimated_s = total_time,
            "verified_pulse_stream"
        );
        Ok(delta)
    }
}

fn invariant(message: &str) -> HalError {
    HalError::PulseInvariant(message.to_string())
}

impl Hal for VirtualHal {
    fn init(&self) -> Result<(), HalError> {
        info!(target: "hal.virtual", "initialize hal");
        Ok(())
    }

    fn deinit(&self) -> Result<(), HalError> {
        info!(target: "hal.virtual", "deinitialize hal");
        Ok(())
    }

    fn spindle_control(&self, percent: f64) -> Result<(), HalError> {
        info!(target: "hal.virtual", percent, "spindle control");
        self.state().spindle_percent = percent;
        Ok(())
    }

    fn fan_control(&self, on: bool) -> Result<(), HalError> {
        info!(target: "hal.virtual", on, "fan control");
        self.state().fan_on = on;
        Ok(())
    }

    fn extruder_heater_control(&self, percent: f64) -> Result<(), HalError> {
        self.state().extruder_power_percent = percent;
        Ok(())
    }

    fn bed_heater_control(&self, percent: f64) -> Result<(), HalError> {
        self.state().bed_power_percent = percent;
        Ok(())
    }

    fn get_extruder_temperature(&self) -> Result<f64, TemperatureError> {
        self.state().extruder_temperature.clone()
    }

    fn get_bed_temperature(&self) -> Result<f64, TemperatureError> {
        self.state().bed_temperature.clone()
    }

    fn disable_steppers(&self) -> Result<(), HalError> {
        info!(target: "hal.virtual", "disable steppers");
        self.state().steppers_disabled = true;
        Ok(())
    }

    fn calibrate(&self, x: bool, y: bool, z: bool) -> Result<bool, HalError> {
        info!(target: "hal.virtual", x, y, z, "calibrate");
        let mut state = self.state();
        state.calibrated_axes = Some((x, y, z));
        Ok(state.calibrate_result)
    }

    fn move_pulses(&self, generator: PulseGenerator) -> Result<(), HalError> {
        let delta = self.verify(generator)?;
        let mut state = self.state();
        state.steppers_disabled = false;
        state.moves.push(delta);
        Ok(())
    }

    fn join(&self) -> Result<(), HalError> {
        debug!(target: "hal.virtual", "join");
        Ok(())
    }
}

impl std::fmt::Debug for VirtualHal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualHal")
            .field("config", &self.config.file.control.instant_run)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_geometry::{Plane, RotationDirection};
    use core_pulses::PulseGenerator;

    fn config() -> Arc<MachineConfig> {
        let mut cfg = MachineConfig::default();
        cfg.file.control.stepper_max_acceleration_mm_per_s2 = 200.0;
        Arc::new(cfg)
    }

    #[test]
    fn verifies_linear_streams() {
        let cfg = config();
        let hal = VirtualHal::new(cfg.clone());
        for delta in [
            Vector4::new(1.0, 0.0, 0.0, 0.0),
            Vector4::new(25.4, 0.0, 0.0, 0.0),
            Vector4::new(200.0, 300.0, 48.0, 0.0),
            Vector4::new(-3.0, 2.0, -1.0, 4.0),
        ] {
            let stream = PulseGenerator::linear(delta, 1800.0, &cfg).unwrap();
            hal.move_pulses(stream).unwrap();
        }
        assert_eq!(hal.state().moves.len(), 4);
        assert_eq!(hal.state().moves[3], Vector4::new(-3.0, 2.0, -1.0, 4.0));
    }

    #[test]
    fn verifies_circular_streams() {
        let cfg = config();
        let hal = VirtualHal::new(cfg.clone());
        let stream = PulseGenerator::circular(
            Vector4::zero(),
            Vector4::new(1.0, 0.0, 0.0, 0.0),
            Plane::Xy,
            RotationDirection::Ccw,
            1800.0,
            &cfg,
        )
        .unwrap();
        hal.move_pulses(stream).unwrap();
        assert_eq!(hal.state().moves[0], Vector4::zero());
    }

    #[test]
    fn virtual_temperatures_run_just_below_limits() {
        let cfg = config();
        let hal = VirtualHal::new(cfg.clone());
        let t = hal.get_extruder_temperature().unwrap();
        assert!(t < cfg.file.temperature.extruder_max_temperature);
        assert!(t > cfg.file.temperature.extruder_max_temperature * 0.99);
    }

    #[test]
    fn movement_reenables_steppers() {
        let cfg = config();
        let hal = VirtualHal::new(cfg.clone());
        hal.disable_steppers().unwrap();
        assert!(hal.state().steppers_disabled);
        let stream =
            PulseGenerator::linear(Vector4::new(1.0, 0.0, 0.0, 0.0), 1800.0, &cfg).unwrap();
        hal.move_pulses(stream).unwrap();
        assert!(!hal.state().steppers_disabled);
    }
}
