//! Proportional-integral-derivative controller with anti-windup and a target
//! stability detector.

use core_config::PidCoefficients;

/// Relative error band that counts as "on target".
pub const FIX_ACCURACY: f64 = 0.01;
/// How long the error must stay inside the band before the target is
/// considered fixed.
pub const FIX_TIME_S: f64 = 2.5;

#[derive(Debug)]
pub struct Pid {
    target_value: f64,
    p: f64,
    i: f64,
    d: f64,
    windup_limit: f64,
    fix_time_s: f64,
    last_time: f64,
    integral: f64,
    last_error: f64,
    is_target_fixed: bool,
    target_fix_timer: Option<f64>,
}

impl Pid {
    /// `start_time` anchors the integration clock; callers pass the same
    /// monotonic seconds to every [`Pid::update`].
    pub fn new(target_value: f64, coefficients: &PidCoefficients, start_time: f64) -> Self {
        Self {
            target_value,
            p: coefficients.p,
            i: coefficients.i,
            d: coefficients.d,
            windup_limit: 1.0 / coefficients.i,
            fix_time_s: FIX_TIME_S,
            last_time: start_time,
            integral: 0.0,
            last_error: 0.0,
            is_target_fixed: false,
            target_fix_timer: None,
        }
    }

    /// Override the stability hold time (tests and tuning rigs).
    pub fn with_fix_time(mut self, fix_time_s: f64) -> Self {
        self.fix_time_s = fix_time_s;
        self
    }

    /// Feed a measurement; returns the demanded power in `0.0..=1.0`.
    pub fn update(&mut self, current_value: f64, current_time: f64) -> f64 {
        let delta_time = current_time - self.last_time;
        self.last_time = current_time;
        let error = self.target_value - current_value;
        self.integral += error * delta_time;
        // integral windup protection
        if self.integral.abs() > self.windup_limit {
            self.integral = self.windup_limit.copysign(self.integral);
        }
        let delta_error = error - self.last_error;
        self.last_error = error;

        let res = (self.p * error + self.i * self.integral + self.d * delta_error).clamp(0.0, 1.0);

        if !self.is_target_fixed {
            if error.abs() < self.target_value * FIX_ACCURACY && res < 1.0 {
                match self.target_fix_timer {
                    None => self.target_fix_timer = Some(current_time),
                    Some(since) => {
                        if current_time - since > self.fix_time_s {
                            self.is_target_fixed = true;
                        }
                    }
                }
            } else {
                self.target_fix_timer = None;
            }
        }
        res
    }

    /// True once the target has been reached and held.
    pub fn is_fixed(&self) -> bool {
        self.is_target_fixed
    }

    pub fn target_value(&self) -> f64 {
        self.target_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_config::MachineConfig;

    fn extruder_pid() -> PidCoefficients {
        MachineConfig::default().file.temperature.extruder_pid
    }

    fn bed_pid() -> PidCoefficients {
        MachineConfig::default().file.temperature.bed_pid
    }

    #[test]
    fn saturates_at_both_ends() {
        let mut pid = Pid::new(50.0, &extruder_pid(), 0.0);
        assert_eq!(pid.update(100.0, 1.0), 0.0);
        assert_eq!(pid.update(0.0, 2.0), 1.0);
        let mut pid = Pid::new(50.0, &bed_pid(), 0.0);
        assert_eq!(pid.update(100.0, 1.0), 0.0);
        assert_eq!(pid.update(0.0, 2.0), 1.0);
    }

    /// Heat a simulated thermal mass (heat transfer coefficient `heat`,
    /// natural cooling coefficient `cool`) and require the controller to
    /// reach and then hold the target.
    fn simulate(target: f64, coefficients: &PidCoefficients, cool: f64, heat: f64) {
        let environment = 25.0;
        let mut pid = Pid::new(target, coefficients, 0.0);
        let mut temperature = environment;
        let mut heater_power = 0.0;
        let mut fixed_at = None;
        let mut zeros = 0u32;
        let mut total = 0u32;
        let iters_per_s = 2.0; // 0.5 s step
        for k in 1..=(20 * 60 * iters_per_s as u32) {
            let now = k as f64 / iters_per_s;
            temperature -= (temperature - environment) * cool / iters_per_s;
            temperature += heat * heater_power / iters_per_s;
            heater_power = pid.update(temperature, now);
            if fixed_at.is_none() {
                if pid.is_fixed() {
                    fixed_at = Some(now);
                }
            } else {
                assert!(
                    (temperature - target).abs() < FIX_ACCURACY * target * 5.0,
                    "lost control at {now}: {temperature}/{target}"
                );
            }
            if heater_power == 0.0 {
                zeros += 1;
            }
            total += 1;
        }
        assert!(
            (temperature - target).abs() < FIX_ACCURACY * target,
            "failed to hold {temperature}/{target}"
        );
        assert!(
            zeros < total / 20,
            "bang-bang behaviour instead of fine control"
        );
        let fixed_at = fixed_at.expect("target never fixed");
        assert!(fixed_at < 900.0, "failed to heat in 15 minutes");
    }

    #[test]
    fn extruder_temperatures_are_reachable() {
        // reprap-style extruder plant coefficients
        for target in (150..=250).step_by(10) {
            simulate(target as f64, &extruder_pid(), 0.0108, 3.4070);
        }
    }

    #[test]
    fn bed_temperatures_are_reachable() {
        // heated bed is slow and heavy
        for target in (50..=100).step_by(10) {
            simulate(target as f64, &bed_pid(), 0.0027, 0.2522);
        }
    }

    #[test]
    fn fix_detection_needs_a_hold_period() {
        let mut pid = Pid::new(100.0, &extruder_pid(), 0.0);
        pid.update(100.0, 0.5);
        assert!(!pid.is_fixed());
        pid.update(100.0, 1.0);
        assert!(!pid.is_fixed());
        // hold period elapses
        pid.update(100.0, 3.1);
        assert!(pid.is_fixed());
    }

    #[test]
    fn leaving_the_band_resets_the_hold_timer() {
        let mut pid = Pid::new(100.0, &extruder_pid(), 0.0);
        pid.update(100.0, 0.5);
        pid.update(50.0, 1.0); // far off target again
        pid.update(100.0, 3.4);
        assert!(!pid.is_fixed(), "timer must restart after leaving the band");
    }
}
