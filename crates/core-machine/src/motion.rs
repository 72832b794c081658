//! Linear motion: velocity admission, rapid velocity selection, the actual
//! dispatch into the pulse generator, and safe zeroing for G28.

use core_geometry::{Axis, Vector4};
use core_pulses::PulseGenerator;
use tracing::debug;

use crate::{GMachine, MachineError};

impl GMachine {
    /// Snap the delta to the step grid and run it as a linear segment.
    /// An empty (post-snap) delta is a no-op.
    pub(crate) fn move_linear(
        &mut self,
        delta: Vector4,
        velocity_mm_per_min: f64,
    ) -> Result<(), MachineError> {
        let delta = delta.snap(self.config.step_base());
        if delta.is_zero() {
            return Ok(());
        }
        let target = self.position + delta;
        if !target.is_in_aabb(self.config.table_min(), self.config.table_max()) {
            return Err(MachineError::OutOfArea);
        }
        let generator = PulseGenerator::linear(delta, velocity_mm_per_min, &self.config)?;
        self.hal.move_pulses(generator)?;
        self.position = target;
        debug!(target: "machine", position = %self.position, "position_updated");
        Ok(())
    }

    /// Rapid (G0) velocity: scale each active axis' limit by the inverse of
    /// its direction cosine and take the most restrictive result, so the
    /// binding axis runs exactly at its maximum.
    pub(crate) fn rapid_velocity(&self, delta: &Vector4) -> f64 {
        let length = delta.length();
        let mut velocity = f64::INFINITY;
        for axis in Axis::ALL {
            let d = delta[axis].abs();
            if d > 0.0 {
                velocity = velocity.min(self.config.max_velocity(axis) * length / d);
            }
        }
        if velocity.is_finite() {
            velocity
        } else {
            self.config.file.control.min_velocity_mm_per_min
        }
    }

    /// Check the per-axis velocities a linear segment implies. Returns the
    /// feed rate to use: the requested one, or a proportionally scaled-down
    /// one when auto velocity adjustment is enabled.
    pub(crate) fn admit_linear_velocity(
        &self,
        delta: &Vector4,
        velocity_mm_per_min: f64,
    ) -> Result<f64, MachineError> {
        let length = delta.length();
        if length == 0.0 {
            return Ok(velocity_mm_per_min);
        }
        let mut scale = 1.0f64;
        for axis in Axis::ALL {
            let axis_velocity = velocity_mm_per_min * delta[axis].abs() / length;
            let limit = self.config.max_velocity(axis);
            if axis_velocity > limit {
                scale = scale.min(limit / axis_velocity);
            }
        }
        self.apply_velocity_scale(velocity_mm_per_min, scale)
    }

    pub(crate) fn apply_velocity_scale(
        &self,
        velocity_mm_per_min: f64,
        scale: f64,
    ) -> Result<f64, MachineError> {
        if scale >= 1.0 {
            return Ok(velocity_mm_per_min);
        }
        if !self.config.file.control.auto_velocity_adjustment {
            return Err(MachineError::BadFeedRate);
        }
        let adjusted = velocity_mm_per_min * scale;
        debug!(
            target: "machine",
            requested = velocity_mm_per_min,
            adjusted,
            "velocity_auto_adjusted"
        );
        Ok(adjusted)
    }

    /// Drive the named axes to their zero coordinate, Z first so the head
    /// clears the work before the table moves.
    pub(crate) fn safe_zero(&mut self, x: bool, y: bool, z: bool) -> Result<(), MachineError> {
        let velocity = self.config.file.control.calibration_velocity_mm_per_min;
        if z {
            let d = Vector4::new(0.0, 0.0, -self.position.z, 0.0);
            self.move_linear(d, velocity)?;
        }
        let d = Vector4::new(
            if x { -self.position.x } else { 0.0 },
            if y { -self.position.y } else { 0.0 },
            0.0,
            0.0,
        );
        self.move_linear(d, velocity)
    }
}
