//! Linear interpolation: uniform pseudo-velocity per axis, expressed in terms
//! of position so that pulse `i` on an axis falls at `(i / ppm) / v`.

use core_geometry::Vector4;

use crate::{AxisSigns, AxisTimes, Profile, SECONDS_IN_MINUTE};

pub struct LinearShape {
    distance_mm: [f64; 4],
    velocity_mm_per_s: [f64; 4],
    direction: AxisSigns,
    pulses_per_mm: [f64; 4],
}

impl LinearShape {
    pub(crate) fn new(
        delta: Vector4,
        velocity_mm_per_min: f64,
        pulses_per_mm: [f64; 4],
        acceleration: f64,
    ) -> (Self, Profile) {
        let distance = delta.abs();
        let distance_total = distance.length();
        // per-axis share of the requested velocity
        let mut velocity =
            distance * (velocity_mm_per_min / SECONDS_IN_MINUTE / distance_total);

        let mut acceleration_time_s = velocity.max_component() / acceleration;
        let linear_time_s;
        // check if there is enough room to accelerate and brake
        // S = a * t^2 / 2
        if acceleration * acceleration_time_s * acceleration_time_s > distance_total {
            acceleration_time_s = (distance_total / acceleration).sqrt();
            linear_time_s = 0.0;
            // V = a * t -> V = 2 * S / t, half the distance accelerates and
            // the other half brakes
            velocity = distance / acceleration_time_s;
        } else {
            let linear_distance =
                distance_total - acceleration_time_s * acceleration_time_s * acceleration;
            linear_time_s = linear_distance / velocity.length();
        }

        let direction = [
            axis_sign(delta.x),
            axis_sign(delta.y),
            axis_sign(delta.z),
            axis_sign(delta.e),
        ];
        let profile = Profile::new(
            acceleration_time_s,
            linear_time_s,
            velocity.max_component(),
            acceleration,
        );
        let shape = Self {
            distance_mm: [distance.x, distance.y, distance.z, distance.e],
            velocity_mm_per_s: [velocity.x, velocity.y, velocity.z, velocity.e],
            direction,
            pulses_per_mm,
        };
        (shape, profile)
    }

    pub(crate) fn sample(&self, counters: &[u64; 4]) -> (AxisSigns, AxisTimes) {
        let mut times = [None; 4];
        for i in 0..4 {
            times[i] = axis_time(
                counters[i] as f64 / self.pulses_per_mm[i],
                self.distance_mm[i],
                self.velocity_mm_per_s[i],
            );
        }
        (self.direction, times)
    }
}

fn axis_sign(delta: f64) -> i8 {
    if delta > 0.0 {
        1
    } else if delta < 0.0 {
        -1
    } else {
        0
    }
}

/// Pseudo-time of the pulse at `position_mm`, or `None` once the axis is done.
/// S = V * t -> t = S / V
fn axis_time(position_mm: f64, distance_mm: f64, velocity_mm_per_s: f64) -> Option<f64> {
    if distance_mm == 0.0 || position_mm >= distance_mm {
        return None;
    }
    Some(position_mm / velocity_mm_per_s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_time_guards() {
        assert_eq!(axis_time(0.0, 0.0, 1.0), None);
        assert_eq!(axis_time(2.0, 2.0, 1.0), None);
        assert_eq!(axis_time(1.0, 2.0, 4.0), Some(0.25));
        // first pulse of an active axis is immediate
        assert_eq!(axis_time(0.0, 2.0, 4.0), Some(0.0));
    }

    #[test]
    fn velocity_splits_by_direction_cosine() {
        let ppm = [400.0; 4];
        let (shape, _) = LinearShape::new(Vector4::new(3.0, 4.0, 0.0, 0.0), 300.0, ppm, 3000.0);
        // |delta| = 5 mm, 300 mm/min = 5 mm/s total
        assert!((shape.velocity_mm_per_s[0] - 3.0).abs() < 1e-12);
        assert!((shape.velocity_mm_per_s[1] - 4.0).abs() < 1e-12);
        assert_eq!(shape.direction, [1, 1, 0, 0]);
    }

    #[test]
    fn triangular_profile_scales_velocity() {
        let ppm = [400.0; 4];
        // 1 mm at 60 mm/s with a = 200 needs 0.3 s of accel -> 9 mm, too long
        let (shape, profile) = LinearShape::new(Vector4::new(1.0, 0.0, 0.0, 0.0), 3600.0, ppm, 200.0);
        let expected_accel = (1.0f64 / 200.0).sqrt();
        assert!((profile.total_time_s() - 2.0 * expected_accel).abs() < 1e-12);
        assert!((shape.velocity_mm_per_s[0] - 1.0 / expected_accel).abs() < 1e-9);
    }
}
