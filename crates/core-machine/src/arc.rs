//! Circular motion: admission (zero radii, the quadrant envelope scan),
//! velocity checks, and the arc-plus-residual dispatch.

use std::f64::consts::{FRAC_PI_2, TAU};

use core_geometry::{Plane, RotationDirection, Vector4};
use core_pulses::PulseGenerator;
use tracing::debug;

use crate::{GMachine, MachineError};

/// In-plane description of the requested arc, shared between admission and
/// dispatch.
struct ArcGeometry {
    start_angle: f64,
    total_angle: f64,
    radius: f64,
    arc_mm: f64,
    sigma: f64,
}

impl GMachine {
    pub(crate) fn move_circular(
        &mut self,
        delta: Vector4,
        radius_offset: Vector4,
        direction: RotationDirection,
        velocity_mm_per_min: f64,
    ) -> Result<(), MachineError> {
        let base = self.config.step_base();
        let delta = delta.snap(base);
        let radius_offset = radius_offset.snap(base);
        let plane = self.plane;

        let geometry = self.arc_geometry(&delta, &radius_offset, plane, direction)?;
        let target = self.position + delta;
        if !target.is_in_aabb(self.config.table_min(), self.config.table_max()) {
            return Err(MachineError::OutOfArea);
        }
        self.check_arc_envelope(&radius_offset, plane, &geometry)?;
        let velocity =
            self.admit_circular_velocity(&delta, plane, &geometry, velocity_mm_per_min)?;

        let generator = PulseGenerator::circular(
            delta,
            radius_offset,
            plane,
            direction,
            velocity,
            &self.config,
        )?;
        let achieved = generator.delta();
        self.hal.move_pulses(generator)?;
        self.position = self.position + achieved;
        debug!(target: "machine", position = %self.position, "position_updated");

        // the grid end of the arc rarely sits exactly on the requested
        // target; close the gap with a linear tail
        let residual = delta - achieved;
        if !residual.is_zero() {
            debug!(target: "machine", residual = %residual, "arc_residual_segment");
            let admitted = self.admit_linear_velocity(&residual, velocity)?;
            self.move_linear(residual, admitted)?;
        }
        Ok(())
    }

    fn arc_geometry(
        &self,
        delta: &Vector4,
        radius_offset: &Vector4,
        plane: Plane,
        direction: RotationDirection,
    ) -> Result<ArcGeometry, MachineError> {
        let (a_axis, b_axis) = plane.axes();
        let sa = -radius_offset[a_axis];
        let sb = -radius_offset[b_axis];
        let radius = (sa * sa + sb * sb).sqrt();
        if radius == 0.0 {
            return Err(MachineError::ZeroRadius);
        }
        let da = delta[a_axis];
        let db = delta[b_axis];
        let sigma = match direction {
            RotationDirection::Ccw => 1.0,
            RotationDirection::Cw => -1.0,
        };
        let start_angle = sb.atan2(sa);
        let total_angle = if da == 0.0 && db == 0.0 {
            TAU
        } else {
            let ea = sa + da;
            let eb = sb + db;
            if ea == 0.0 && eb == 0.0 {
                return Err(MachineError::ZeroRadius);
            }
            (sigma * (eb.atan2(ea) - start_angle)).rem_euclid(TAU)
        };
        Ok(ArcGeometry {
            start_angle,
            total_angle,
            radius,
            arc_mm: radius * total_angle,
            sigma,
        })
    }

    /// Scan the quadrant boundaries the arc crosses, in motion direction.
    /// Each crossing is an extremum of one in-plane axis; an arc whose
    /// endpoints are inside the envelope can still bulge outside only at
    /// those points.
    fn check_arc_envelope(
        &self,
        radius_offset: &Vector4,
        plane: Plane,
        geometry: &ArcGeometry,
    ) -> Result<(), MachineError> {
        let (a_axis, b_axis) = plane.axes();
        let centre_a = self.position[a_axis] + radius_offset[a_axis];
        let centre_b = self.position[b_axis] + radius_offset[b_axis];
        let min = self.config.table_min();
        let max = self.config.table_max();
        let (min_a, max_a) = (min[a_axis], max[a_axis]);
        let (min_b, max_b) = (min[b_axis], max[b_axis]);

        let sigma = geometry.sigma;
        let mut k = if sigma > 0.0 {
            (geometry.start_angle / FRAC_PI_2).floor() + 1.0
        } else {
            (geometry.start_angle / FRAC_PI_2).ceil() - 1.0
        };
        loop {
            let boundary = k * FRAC_PI_2;
            let travelled = sigma * (boundary - geometry.start_angle);
            if travelled >= geometry.total_angle - 1e-9 {
                return Ok(());
            }
            let pa = centre_a + geometry.radius * boundary.cos();
            let pb = centre_b + geometry.radius * boundary.sin();
            if pa < min_a || pa > max_a || pb < min_b || pb > max_b {
                debug!(
                    target: "machine",
                    boundary_deg = boundary.to_degrees(),
                    pa,
                    pb,
                    "arc_leaves_envelope"
                );
                return Err(MachineError::OutOfArea);
            }
            k += sigma;
        }
    }

    /// Peak per-axis velocities of an arc: the in-plane axes peak at the
    /// circular speed where the tangent aligns with them; the orthogonal axis
    /// and E run their linear share.
    fn admit_circular_velocity(
        &self,
        delta: &Vector4,
        plane: Plane,
        geometry: &ArcGeometry,
        velocity_mm_per_min: f64,
    ) -> Result<f64, MachineError> {
        let (a_axis, b_axis) = plane.axes();
        let ortho = plane.orthogonal();
        let d_ortho = delta[ortho].abs();
        let d_e = delta.e.abs();
        let total =
            (geometry.arc_mm * geometry.arc_mm + d_ortho * d_ortho + d_e * d_e).sqrt();
        if total == 0.0 {
            return Ok(velocity_mm_per_min);
        }
        let v_circ = velocity_mm_per_min * geometry.arc_mm / total;
        let v_ortho = velocity_mm_per_min * d_ortho / total;
        let v_e = velocity_mm_per_min * d_e / total;

        let mut scale = 1.0f64;
        for (axis, v) in [
            (a_axis, v_circ),
            (b_axis, v_circ),
            (ortho, v_ortho),
            (core_geometry::Axis::E, v_e),
        ] {
            let limit = self.config.max_velocity(axis);
            if v > limit {
                scale = scale.min(limit / v);
            }
        }
        self.apply_velocity_scale(velocity_mm_per_min, scale)
    }
}
