//! Raspberry Pi hardware backend.
//!
//! Step pulses are rendered into a DMA control-block chain (set / clocked
//! delay / clear per pulse) so the engine emits them with microsecond
//! accuracy while the CPU keeps preparing the rest of the stream. Spindle and
//! heaters run on the slow DMA-PWM; the fan is a plain GPIO level. The
//! register plumbing lives in [`rpgpio`]; this module only translates machine
//! concepts (axes, pulses, percents) into pin masks.

mod registers;
mod rpgpio;
mod sensors;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use core_config::MachineConfig;
use core_geometry::Axis;
use core_hal::{Hal, HalError, TemperatureError};
use core_pulses::{AxisSigns, PulseEvent, PulseGenerator};
use tracing::{info, warn};

use rpgpio::{DmaGpio, DmaPwm, Gpio, PinMode};
use sensors::Ads1115;

const US_IN_SECOND: f64 = 1_000_000.0;
/// Pulse DMA ring: 30 MB of control blocks.
const DMA_BUFFER_SIZE: usize = 30 * 1024 * 1024;
const DMA_GPIO_CHANNEL: usize = 4;
const DMA_PWM_CHANNEL: usize = 14;
/// Streaming starts once this much motion is buffered.
const INSTANT_RUN_THRESHOLD_US: u64 = 100_000;

/// Per-axis step pin masks in X/Y/Z/E order.
fn step_masks(config: &MachineConfig) -> [u32; 4] {
    let a = &config.file.axis;
    [
        1 << a.stepper_step_pin_x,
        1 << a.stepper_step_pin_y,
        1 << a.stepper_step_pin_z,
        1 << a.stepper_step_pin_e,
    ]
}

fn dir_pins(config: &MachineConfig) -> [u32; 4] {
    let a = &config.file.axis;
    [
        a.stepper_dir_pin_x,
        a.stepper_dir_pin_y,
        a.stepper_dir_pin_z,
        a.stepper_dir_pin_e,
    ]
}

/// Map logical direction signs onto direction-pin levels. Forward is low
/// unless the axis is inverted; idle axes keep their previous level.
fn direction_masks(signs: &AxisSigns, pins: &[u32; 4], inverted: &[bool; 4]) -> (u32, u32) {
    let mut set = 0u32;
    let mut clear = 0u32;
    for axis in 0..4 {
        let forward = match signs[axis] {
            1 => true,
            -1 => false,
            _ => continue,
        };
        if forward != inverted[axis] {
            clear |= 1 << pins[axis];
        } else {
            set |= 1 << pins[axis];
        }
    }
    (set, clear)
}

pub struct RpiHal {
    config: Arc<MachineConfig>,
    gpio: Gpio,
    dma: Mutex<DmaGpio>,
    pwm: Mutex<DmaPwm>,
    adc: Option<Ads1115>,
}

impl RpiHal {
    /// True when this host looks like a Raspberry Pi with the expected SoC.
    pub fn available() -> bool {
        rpgpio::peripheral_base().is_ok()
    }

    pub fn new(config: Arc<MachineConfig>) -> Result<Self, HalError> {
        let base = rpgpio::peripheral_base()?;
        let gpio = Gpio::new(base)?;
        let dma = DmaGpio::new(base, DMA_BUFFER_SIZE, DMA_GPIO_CHANNEL)?;
        let pwm = DmaPwm::new(base, DMA_PWM_CHANNEL)?;
        let adc = match Ads1115::new() {
            Ok(adc) => Some(adc),
            Err(err) => {
                warn!(target: "hal.rpi", ?err, "ads1115 not detected");
                None
            }
        };
        Ok(Self {
            config,
            gpio,
            dma: Mutex::new(dma),
            pwm: Mutex::new(pwm),
            adc,
        })
    }

    fn lock_dma(&self) -> std::sync::MutexGuard<'_, DmaGpio> {
        self.dma.lock().expect("dma lock poisoned")
    }

    fn lock_pwm(&self) -> std::sync::MutexGuard<'_, DmaPwm> {
        self.pwm.lock().expect("pwm lock poisoned")
    }

    fn enable_steppers(&self) {
        self.gpio.clear(self.config.file.control.steppers_enable_pin);
    }

    /// One homing pass: drive the selected axes toward (or away from, when
    /// `invert`) their endstops until every switch reports, refreshing a one
    /// second pulse chain as axes drop out.
    fn calibrate_phase(
        &self,
        dma: &mut DmaGpio,
        x: bool,
        y: bool,
        z: bool,
        invert: bool,
    ) -> Result<bool, HalError> {
        let cfg = &self.config;
        let pins_cfg = dir_pins(cfg);
        for (i, axis) in [Axis::X, Axis::Y, Axis::Z].into_iter().enumerate() {
            if cfg.stepper_inverted(axis) != invert {
                self.gpio.clear(pins_cfg[i]);
            } else {
                self.gpio.set(pins_cfg[i]);
            }
        }
        let masks = step_masks(cfg);
        let mut pins = 0u32;
        let mut max_pulses = 0.0f64;
        let w = &cfg.file.workplace;
        if x {
            pins |= masks[0];
            max_pulses = max_pulses.max(w.table_size_x_mm * cfg.pulses_per_mm(Axis::X));
        }
        if y {
            pins |= masks[1];
            max_pulses = max_pulses.max(w.table_size_y_mm * cfg.pulses_per_mm(Axis::Y));
        }
        if z {
            pins |= masks[2];
            max_pulses = max_pulses.max(w.table_size_z_mm * cfg.pulses_per_mm(Axis::Z));
        }
        let pulses_per_mm_avg = (cfg.pulses_per_mm(Axis::X)
            + cfg.pulses_per_mm(Axis::Y)
            + cfg.pulses_per_mm(Axis::Z))
            / 3.0;
        let pulses_per_sec =
            cfg.file.control.calibration_velocity_mm_per_min / 60.0 * pulses_per_mm_avg;
        let deadline =
            Instant::now() + Duration::from_secs_f64(1.2 * max_pulses / pulses_per_sec);
        let delay_us = (US_IN_SECOND / pulses_per_sec) as u32;
        let pulse_us = cfg.file.control.stepper_pulse_length_us;

        let endstop = |pin: u32, axis: Axis| -> bool {
            let inverted = cfg.endstop_inverted(axis) != invert;
            // sample three times to ride out switch bounce
            (0..3).all(|_| (self.gpio.read(pin) == 1) == inverted)
        };
        let a = &cfg.file.axis;
        let mut last_pins = !pins;
        while Instant::now() < deadline {
            if pins & masks[0] != 0 && endstop(a.endstop_pin_x, Axis::X) {
                pins &= !masks[0];
            }
            if pins & masks[1] != 0 && endstop(a.endstop_pin_y, Axis::Y) {
                pins &= !masks[1];
            }
            if pins & masks[2] != 0 && endstop(a.endstop_pin_z, Axis::Z) {
                pins &= !masks[2];
            }
            if pins != last_pins {
                dma.stop();
                if pins == 0 {
                    return Ok(true);
                }
                last_pins = pins;
                // one second of pulses per chain: a crashed controller stops
                // the motors after at most that long
                dma.clear();
                let mut chain_us = 1_000_000i64;
                while chain_us > 0 {
                    dma.add_pulse(pins, pulse_us)?;
                    dma.add_delay(delay_us)?;
                    chain_us -= (delay_us + pulse_us) as i64;
                }
                dma.finalize_stream();
            }
            if !dma.is_active() {
                dma.run(false);
            }
        }
        Ok(false)
    }
}

impl Hal for RpiHal {
    fn init(&self) -> Result<(), HalError> {
        let c = &self.config.file.control;
        let a = &self.config.file.axis;
        let t = &self.config.file.temperature;
        for pin in [
            a.stepper_step_pin_x,
            a.stepper_step_pin_y,
            a.stepper_step_pin_z,
            a.stepper_step_pin_e,
            a.stepper_dir_pin_x,
            a.stepper_dir_pin_y,
            a.stepper_dir_pin_z,
            a.stepper_dir_pin_e,
            c.spindle_pwm_pin,
            c.fan_pin,
            c.steppers_enable_pin,
            t.extruder_heater_pin,
            t.bed_heater_pin,
        ] {
            self.gpio.init(pin, PinMode::Output);
        }
        for pin in [a.endstop_pin_x, a.endstop_pin_y, a.endstop_pin_z] {
            self.gpio.init(pin, PinMode::InputPullUp);
        }
        for pin in [
            c.spindle_pwm_pin,
            c.fan_pin,
            t.extruder_heater_pin,
            t.bed_heater_pin,
            c.steppers_enable_pin,
        ] {
            self.gpio.clear(pin);
        }
        info!(target: "hal.rpi", "initialized");
        Ok(())
    }

    fn deinit(&self) -> Result<(), HalError> {
        // shutdown aborts any motion still in flight; the machine keeps the
        // last completed-segment position and never resumes mid-segment
        self.lock_dma().stop();
        self.disable_steppers()?;
        self.lock_pwm().remove_all();
        let c = &self.config.file.control;
        let t = &self.config.file.temperature;
        for pin in [
            c.spindle_pwm_pin,
            c.fan_pin,
            t.extruder_heater_pin,
            t.bed_heater_pin,
        ] {
            self.gpio.clear(pin);
        }
        info!(target: "hal.rpi", "deinitialized");
        Ok(())
    }

    fn spindle_control(&self, percent: f64) -> Result<(), HalError> {
        info!(target: "hal.rpi", percent, "spindle control");
        let pin = self.config.file.control.spindle_pwm_pin;
        let mut pwm = self.lock_pwm();
        if percent > 0.0 {
            pwm.add_pin(pin, percent);
        } else {
            pwm.remove_pin(pin);
        }
        Ok(())
    }

    fn fan_control(&self, on: bool) -> Result<(), HalError> {
        info!(target: "hal.rpi", on, "fan control");
        let pin = self.config.file.control.fan_pin;
        if on {
            self.gpio.set(pin);
        } else {
            self.gpio.clear(pin);
        }
        Ok(())
    }

    fn extruder_heater_control(&self, percent: f64) -> Result<(), HalError> {
        let pin = self.config.file.temperature.extruder_heater_pin;
        let mut pwm = self.lock_pwm();
        if percent > 0.0 {
            pwm.add_pin(pin, percent);
        } else {
            pwm.remove_pin(pin);
        }
        Ok(())
    }

    fn bed_heater_control(&self, percent: f64) -> Result<(), HalError> {
        let pin = self.config.file.temperature.bed_heater_pin;
        let mut pwm = self.lock_pwm();
        if percent > 0.0 {
            pwm.add_pin(pin, percent);
        } else {
            pwm.remove_pin(pin);
        }
        Ok(())
    }

    fn get_extruder_temperature(&self) -> Result<f64, TemperatureError> {
        sensors::read_temperature(
            self.adc.as_ref(),
            self.config.file.temperature.extruder_temperature_sensor_channel,
        )
    }

    fn get_bed_temperature(&self) -> Result<f64, TemperatureError> {
        sensors::read_temperature(
            self.adc.as_ref(),
            self.config.file.temperature.bed_temperature_sensor_channel,
        )
    }

    fn disable_steppers(&self) -> Result<(), HalError> {
        info!(target: "hal.rpi", "disable steppers");
        self.gpio.set(self.config.file.control.steppers_enable_pin);
        Ok(())
    }

    fn calibrate(&self, x: bool, y: bool, z: bool) -> Result<bool, HalError> {
        info!(target: "hal.rpi", x, y, z, "calibrate");
        self.enable_steppers();
        let mut dma = self.lock_dma();
        // back off the switches first, then approach them slowly
        if !self.calibrate_phase(&mut dma, x, y, z, true)? {
            return Ok(false);
        }
        self.calibrate_phase(&mut dma, x, y, z, false)
    }

    /// Render the stream into the control-block ring right behind the chain
    /// that may still be running. With `INSTANT_RUN` the DMA starts as soon
    /// as a safe slice of motion is buffered and the writer keeps appending
    /// ahead of the live descriptor; if preparation falls behind real time,
    /// streaming is abandoned for this segment and the chain runs after a
    /// full build.
    fn move_pulses(&self, generator: PulseGenerator) -> Result<(), HalError> {
        self.enable_steppers();
        let cfg = &self.config;
        let masks = step_masks(cfg);
        let pins_cfg = dir_pins(cfg);
        let inverted = [
            cfg.stepper_inverted(Axis::X),
            cfg.stepper_inverted(Axis::Y),
            cfg.stepper_inverted(Axis::Z),
            cfg.stepper_inverted(Axis::E),
        ];
        let pulse_us = cfg.file.control.stepper_pulse_length_us;
        let total_time = generator.total_time_s();

        let mut dma = self.lock_dma();
        let margin = 4 * dma.control_block_size() as u32;
        dma.clear();
        let mut prev_us: u64 = 0;
        let mut is_ran = false;
        let mut instant = cfg.file.control.instant_run;
        let mut started = Instant::now();
        let mut current_cb: Option<u32> = Some(0);
        let mut buffered_us: u64 = 0;
        let mut buffered_from_us: u64 = 0;

        for event in generator {
            // back-pressure against the still-running previous chain
            while let Some(cb) = current_cb {
                if dma.current_address() + margin < cb {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
                current_cb = dma.active_control_block();
                if current_cb.is_none() {
                    // previous chain finished; restart the streaming clock
                    buffered_from_us = buffered_us;
                    started = Instant::now();
                }
            }
            match event {
                PulseEvent::Direction(signs) => {
                    let (set, clear) = direction_masks(&signs, &pins_cfg, &inverted);
                    dma.add_set_clear(set, clear)?;
                }
                PulseEvent::Step(times) => {
                    let mut pins = 0u32;
                    let mut event_time = None;
                    for (axis, time) in times.iter().enumerate() {
                        if let Some(time) = time {
                            pins |= masks[axis];
                            event_time = Some(*time);
                        }
                    }
                    let Some(event_time) = event_time else { continue };
                    let k = (event_time * US_IN_SECOND).round() as u64;
                    if k > prev_us {
                        dma.add_delay((k - prev_us) as u32)?;
                    }
                    dma.add_pulse(pins, pulse_us)?;
                    prev_us = k + pulse_us as u64;
                    buffered_us = k;

                    if !is_ran && instant && current_cb.is_none() {
                        let queued = buffered_us - buffered_from_us;
                        if queued > INSTANT_RUN_THRESHOLD_US {
                            let elapsed = started.elapsed().as_secs_f64();
                            let queued_s = queued as f64 / US_IN_SECOND;
                            if elapsed > queued_s {
                                warn!(
                                    target: "hal.rpi",
                                    elapsed,
                                    queued_s,
                                    "buffer preparation slower than motion, \
                                     falling back to full build"
                                );
                                instant = false;
                            } else {
                                dma.run_stream();
                                is_ran = true;
                            }
                        }
                    }
                }
            }
        }
        let prepared_in = started.elapsed();
        if !is_ran {
            // a short segment can follow a long-running one; wait out the
            // previous chain before (re)starting
            while dma.is_active() {
                std::thread::sleep(Duration::from_millis(10));
            }
            dma.run(false);
        } else {
            dma.finalize_stream();
        }
        info!(
            target: "hal.rpi",
            prepared_s = prepared_in.as_secs_f64(),
            estimated_s = total_time,
            "movement_enqueued"
        );
        Ok(())
    }

    fn join(&self) -> Result<(), HalError> {
        let dma = self.lock_dma();
        while dma.is_active() {
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_masks_follow_signs() {
        let pins = [13, 19, 26, 8];
        let no_inversion = [false; 4];
        let (set, clear) = direction_masks(&[1, -1, 0, 1], &pins, &no_inversion);
        // forward is low level
        assert_eq!(clear, 1 << 13 | 1 << 8);
        assert_eq!(set, 1 << 19);
        // idle z pin is untouched by either mask
        assert_eq!((set | clear) & (1 << 26), 0);
    }

    #[test]
    fn direction_masks_respect_inversion() {
        let pins = [13, 19, 26, 8];
        let inverted = [true, false, false, false];
        let (set, clear) = direction_masks(&[1, 1, 0, 0], &pins, &inverted);
        assert_eq!(set, 1 << 13);
        assert_eq!(clear, 1 << 19);
    }

    #[test]
    fn step_masks_match_configured_pins() {
        let cfg = MachineConfig::default();
        let masks = step_masks(&cfg);
        assert_eq!(masks[0], 1 << cfg.file.axis.stepper_step_pin_x);
        assert_eq!(masks[3], 1 << cfg.file.axis.stepper_step_pin_e);
    }
}
