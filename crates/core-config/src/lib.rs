//! Machine configuration loading and parsing.
//!
//! The on-disk format is `sinter.toml` with the four classic sections
//! (`[CONTROL]`, `[WORKPLACE]`, `[AXIS]`, `[TEMPERATURE]`) and
//! SCREAMING_SNAKE_CASE keys. Unknown fields are ignored so a config written
//! for a newer revision still loads. The serde-facing [`ConfigFile`] tree is
//! wrapped by the immutable [`MachineConfig`] value that is threaded into
//! every component at construction; nothing reads configuration globals.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use core_geometry::{Axis, Vector4};
use serde::Deserialize;
use tracing::info;

/// PID coefficient triple as stored in the config file.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub struct PidCoefficients {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ControlSection {
    pub stepper_pulse_length_us: u32,
    pub stepper_max_acceleration_mm_per_s2: f64,
    pub spindle_max_rpm: f64,
    pub min_velocity_mm_per_min: f64,
    pub calibration_velocity_mm_per_min: f64,
    pub max_velocity_mm_per_min_x: f64,
    pub max_velocity_mm_per_min_y: f64,
    pub max_velocity_mm_per_min_z: f64,
    pub max_velocity_mm_per_min_e: f64,
    pub spindle_pwm_pin: u32,
    pub fan_pin: u32,
    pub steppers_enable_pin: u32,
    pub instant_run: bool,
    pub auto_velocity_adjustment: bool,
    pub auto_fan_on: bool,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            stepper_pulse_length_us: 2,
            stepper_max_acceleration_mm_per_s2: 3000.0,
            spindle_max_rpm: 10000.0,
            min_velocity_mm_per_min: 1.0,
            calibration_velocity_mm_per_min: 300.0,
            max_velocity_mm_per_min_x: 24000.0,
            max_velocity_mm_per_min_y: 36000.0,
            max_velocity_mm_per_min_z: 600.0,
            max_velocity_mm_per_min_e: 1500.0,
            spindle_pwm_pin: 7,
            fan_pin: 27,
            steppers_enable_pin: 23,
            instant_run: true,
            auto_velocity_adjustment: false,
            auto_fan_on: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WorkplaceSection {
    pub table_size_x_mm: f64,
    pub table_size_y_mm: f64,
    pub table_size_z_mm: f64,
    pub table_size_x_min_mm: f64,
    pub table_size_y_min_mm: f64,
    pub table_size_z_min_mm: f64,
}

impl Default for WorkplaceSection {
    fn default() -> Self {
        Self {
            table_size_x_mm: 200.0,
            table_size_y_mm: 300.0,
            table_size_z_mm: 48.0,
            table_size_x_min_mm: 0.0,
            table_size_y_min_mm: 0.0,
            table_size_z_min_mm: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AxisSection {
    pub stepper_pulses_per_mm_x: f64,
    pub stepper_pulses_per_mm_y: f64,
    pub stepper_pulses_per_mm_z: f64,
    pub stepper_pulses_per_mm_e: f64,
    pub stepper_inverted_x: bool,
    pub stepper_inverted_y: bool,
    pub stepper_inverted_z: bool,
    pub stepper_inverted_e: bool,
    pub endstop_inverted_x: bool,
    pub endstop_inverted_y: bool,
    pub endstop_inverted_z: bool,
    pub stepper_step_pin_x: u32,
    pub stepper_step_pin_y: u32,
    pub stepper_step_pin_z: u32,
    pub stepper_step_pin_e: u32,
    pub stepper_dir_pin_x: u32,
    pub stepper_dir_pin_y: u32,
    pub stepper_dir_pin_z: u32,
    pub stepper_dir_pin_e: u32,
    pub endstop_pin_x: u32,
    pub endstop_pin_y: u32,
    pub endstop_pin_z: u32,
}

impl Default for AxisSection {
    fn default() -> Self {
        Self {
            stepper_pulses_per_mm_x: 400.0,
            stepper_pulses_per_mm_y: 400.0,
            stepper_pulses_per_mm_z: 400.0,
            stepper_pulses_per_mm_e: 80.0,
            stepper_inverted_x: false,
            stepper_inverted_y: false,
            stepper_inverted_z: false,
            stepper_inverted_e: false,
            endstop_inverted_x: false,
            endstop_inverted_y: false,
            endstop_inverted_z: false,
            stepper_step_pin_x: 16,
            stepper_step_pin_y: 20,
            stepper_step_pin_z: 21,
            stepper_step_pin_e: 25,
            stepper_dir_pin_x: 13,
            stepper_dir_pin_y: 19,
            stepper_dir_pin_z: 26,
            stepper_dir_pin_e: 8,
            endstop_pin_x: 12,
            endstop_pin_y: 6,
            endstop_pin_z: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TemperatureSection {
    pub extruder_max_temperature: f64,
    pub bed_max_temperature: f64,
    pub min_temperature: f64,
    pub extruder_pid: PidCoefficients,
    pub bed_pid: PidCoefficients,
    pub extruder_heater_pin: u32,
    pub bed_heater_pin: u32,
    pub extruder_temperature_sensor_channel: u8,
    pub bed_temperature_sensor_channel: u8,
}

impl Default for TemperatureSection {
    fn default() -> Self {
        Self {
            extruder_max_temperature: 250.0,
            bed_max_temperature: 100.0,
            min_temperature: 40.0,
            extruder_pid: PidCoefficients {
                p: 0.0592,
                i: 0.00206,
                d: 0.2069,
            },
            bed_pid: PidCoefficients {
                p: 0.2267,
                i: 0.00324,
                d: 0.9054,
            },
            extruder_heater_pin: 18,
            bed_heater_pin: 22,
            extruder_temperature_sensor_channel: 2,
            bed_temperature_sensor_channel: 1,
        }
    }
}

/// Raw deserialized file, section by section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    #[serde(rename = "CONTROL")]
    pub control: ControlSection,
    #[serde(rename = "WORKPLACE")]
    pub workplace: WorkplaceSection,
    #[serde(rename = "AXIS")]
    pub axis: AxisSection,
    #[serde(rename = "TEMPERATURE")]
    pub temperature: TemperatureSection,
}

/// Immutable runtime configuration handed to every component by reference.
#[derive(Debug, Clone, Default)]
pub struct MachineConfig {
    pub file: ConfigFile,
}

/// Best-effort config path: working directory first, then the platform
/// config dir.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("sinter.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("sinter").join("sinter.toml");
    }
    PathBuf::from("sinter.toml")
}

/// Load from `path` (or the discovered location). A missing file yields the
/// built-in defaults; a malformed file is an error, never a silent fallback.
pub fn load_from(path: Option<PathBuf>) -> Result<MachineConfig> {
    let path = path.unwrap_or_else(discover);
    let config = match std::fs::read_to_string(&path) {
        Ok(content) => {
            let file: ConfigFile = toml::from_str(&content)
                .with_context(|| format!("malformed config file {}", path.display()))?;
            info!(target: "config", path = %path.display(), "config_loaded");
            MachineConfig { file }
        }
        Err(_) => {
            info!(target: "config", path = %path.display(), "config_missing_using_defaults");
            MachineConfig::default()
        }
    };
    config.validate()?;
    Ok(config)
}

impl MachineConfig {
    fn validate(&self) -> Result<()> {
        for axis in Axis::ALL {
            if self.pulses_per_mm(axis) <= 0.0 {
                bail!("STEPPER_PULSES_PER_MM_{axis} must be positive");
            }
            if self.max_velocity(axis) <= 0.0 {
                bail!("MAX_VELOCITY_MM_PER_MIN_{axis} must be positive");
            }
        }
        let c = &self.file.control;
        if c.min_velocity_mm_per_min <= 0.0 {
            bail!("MIN_VELOCITY_MM_PER_MIN must be positive");
        }
        if c.stepper_max_acceleration_mm_per_s2 <= 0.0 {
            bail!("STEPPER_MAX_ACCELERATION_MM_PER_S2 must be positive");
        }
        let w = &self.file.workplace;
        if w.table_size_x_mm < w.table_size_x_min_mm
            || w.table_size_y_mm < w.table_size_y_min_mm
            || w.table_size_z_mm < w.table_size_z_min_mm
        {
            bail!("TABLE_SIZE_*_MM must not be below TABLE_SIZE_*_MIN_MM");
        }
        let t = &self.file.temperature;
        if t.extruder_pid.i <= 0.0 || t.bed_pid.i <= 0.0 {
            bail!("PID I coefficient must be positive");
        }
        Ok(())
    }

    pub fn pulses_per_mm(&self, axis: Axis) -> f64 {
        let a = &self.file.axis;
        match axis {
            Axis::X => a.stepper_pulses_per_mm_x,
            Axis::Y => a.stepper_pulses_per_mm_y,
            Axis::Z => a.stepper_pulses_per_mm_z,
            Axis::E => a.stepper_pulses_per_mm_e,
        }
    }

    /// Step size per axis, `1 / pulses_per_mm`, as a vector for grid snapping.
    pub fn step_base(&self) -> Vector4 {
        Vector4::new(
            1.0 / self.pulses_per_mm(Axis::X),
            1.0 / self.pulses_per_mm(Axis::Y),
            1.0 / self.pulses_per_mm(Axis::Z),
            1.0 / self.pulses_per_mm(Axis::E),
        )
    }

    pub fn max_velocity(&self, axis: Axis) -> f64 {
        let c = &self.file.control;
        match axis {
            Axis::X => c.max_velocity_mm_per_min_x,
            Axis::Y => c.max_velocity_mm_per_min_y,
            Axis::Z => c.max_velocity_mm_per_min_z,
            Axis::E => c.max_velocity_mm_per_min_e,
        }
    }

    pub fn stepper_inverted(&self, axis: Axis) -> bool {
        let a = &self.file.axis;
        match axis {
            Axis::X => a.stepper_inverted_x,
            Axis::Y => a.stepper_inverted_y,
            Axis::Z => a.stepper_inverted_z,
            Axis::E => a.stepper_inverted_e,
        }
    }

    /// Endstop polarity for X/Y/Z; E has no endstop and reads as `false`.
    pub fn endstop_inverted(&self, axis: Axis) -> bool {
        let a = &self.file.axis;
        match axis {
            Axis::X => a.endstop_inverted_x,
            Axis::Y => a.endstop_inverted_y,
            Axis::Z => a.endstop_inverted_z,
            Axis::E => false,
        }
    }

    /// Lower corner of the machine envelope (E unbounded, kept at zero since
    /// AABB membership ignores it).
    pub fn table_min(&self) -> Vector4 {
        let w = &self.file.workplace;
        Vector4::new(
            w.table_size_x_min_mm,
            w.table_size_y_min_mm,
            w.table_size_z_min_mm,
            0.0,
        )
    }

    /// Upper corner of the machine envelope.
    pub fn table_max(&self) -> Vector4 {
        let w = &self.file.workplace;
        Vector4::new(w.table_size_x_mm, w.table_size_y_mm, w.table_size_z_mm, 0.0)
    }

    pub fn acceleration_mm_per_s2(&self) -> f64 {
        self.file.control.stepper_max_acceleration_mm_per_s2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(content.as_bytes()).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn defaults_when_missing_file() {
        let cfg = load_from(Some(PathBuf::from("__nonexistent_hopefully__.toml"))).unwrap();
        assert_eq!(cfg.file.control.stepper_pulse_length_us, 2);
        assert_eq!(cfg.pulses_per_mm(Axis::E), 80.0);
        assert!(cfg.file.control.instant_run);
    }

    #[test]
    fn parses_sections_and_keys() {
        let tmp = write_config(
            "[CONTROL]\n\
             STEPPER_MAX_ACCELERATION_MM_PER_S2 = 200\n\
             MAX_VELOCITY_MM_PER_MIN_X = 1800\n\
             AUTO_VELOCITY_ADJUSTMENT = true\n\
             [WORKPLACE]\n\
             TABLE_SIZE_X_MM = 100\n\
             TABLE_SIZE_Y_MIN_MM = -10\n\
             [AXIS]\n\
             STEPPER_PULSES_PER_MM_X = 200\n\
             STEPPER_INVERTED_Y = true\n\
             [TEMPERATURE]\n\
             EXTRUDER_MAX_TEMPERATURE = 260\n\
             EXTRUDER_PID = { P = 0.1, I = 0.0274, D = 0.2055 }\n",
        );
        let cfg = load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(cfg.acceleration_mm_per_s2(), 200.0);
        assert_eq!(cfg.max_velocity(Axis::X), 1800.0);
        assert!(cfg.file.control.auto_velocity_adjustment);
        assert_eq!(cfg.table_max().x, 100.0);
        assert_eq!(cfg.table_min().y, -10.0);
        assert_eq!(cfg.pulses_per_mm(Axis::X), 200.0);
        assert!(cfg.stepper_inverted(Axis::Y));
        assert!(!cfg.stepper_inverted(Axis::X));
        assert_eq!(cfg.file.temperature.extruder_max_temperature, 260.0);
        assert_eq!(cfg.file.temperature.extruder_pid.i, 0.0274);
        // untouched sections keep defaults
        assert_eq!(cfg.max_velocity(Axis::Z), 600.0);
    }

    #[test]
    fn step_base_is_inverse_pulses() {
        let cfg = MachineConfig::default();
        let base = cfg.step_base();
        assert_eq!(base.x, 1.0 / 400.0);
        assert_eq!(base.e, 1.0 / 80.0);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = write_config("[CONTROL\nbroken");
        assert!(load_from(Some(tmp.path().to_path_buf())).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let tmp = write_config("[AXIS]\nSTEPPER_PULSES_PER_MM_X = 0\n");
        assert!(load_from(Some(tmp.path().to_path_buf())).is_err());
        let tmp = write_config("[WORKPLACE]\nTABLE_SIZE_X_MM = -5\n");
        assert!(load_from(Some(tmp.path().to_path_buf())).is_err());
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let tmp = write_config("[CONTROL]\nSOME_FUTURE_KEY = 42\n");
        assert!(load_from(Some(tmp.path().to_path_buf())).is_ok());
    }
}
