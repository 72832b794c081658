//! Stepper pulse generation.
//!
//! Given a geometric primitive (linear segment, or arc in a plane with the
//! orthogonal axis and extruder co-moved), the generator yields a time-ordered
//! event stream: a direction event first (and again whenever any axis sign
//! flips), then pulse events carrying the absolute emission time of every axis
//! pulsed at that instant.
//!
//! Internally the motion is treated as uniform ("pseudo-time") and each
//! emitted instant is warped onto a symmetric trapezoid: accelerate at the
//! configured constant acceleration, cruise, brake. The two movement shapes
//! only have to express *where* pulse `i` of an axis falls in pseudo-time;
//! the shared warp in [`Profile`] does the rest.
//!
//!     S = V * Ta = a * Tu^2 / 2
//!
//! where `Tu` is uniform time and `Ta` accelerated time, which gives the
//! pseudo-to-real translation used in [`Profile::to_real_time`].

mod circular;
mod linear;

use core_config::MachineConfig;
use core_geometry::{Axis, Plane, RotationDirection, Vector4};
use thiserror::Error;
use tracing::debug;

pub use circular::CircularShape;
pub use linear::LinearShape;

pub const SECONDS_IN_MINUTE: f64 = 60.0;

/// Per-axis motor direction signs in X/Y/Z/E order. `0` means the axis never
/// pulses in this segment.
pub type AxisSigns = [i8; 4];

/// Per-axis pulse times in X/Y/Z/E order, seconds from segment start. `None`
/// means no pulse on that axis in this event; all present times are equal.
pub type AxisTimes = [Option<f64>; 4];

/// One event of the generated stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PulseEvent {
    /// Motor direction update; must be applied before any following pulse.
    Direction(AxisSigns),
    /// Simultaneous step pulses for every axis carrying a time.
    Step(AxisTimes),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PulseError {
    #[error("empty movement")]
    EmptyMove,
    #[error("zero radius arc")]
    ZeroRadius,
}

/// Symmetric trapezoid profile and the pseudo-time → real-time warp.
///
/// `to_real_time` is a pure function of the three profile constants; both
/// movement shapes share it unchanged.
#[derive(Debug, Clone, Copy)]
pub struct Profile {
    acceleration_time_s: f64,
    linear_time_s: f64,
    two_vmax_per_a: f64,
}

impl Profile {
    pub fn new(
        acceleration_time_s: f64,
        linear_time_s: f64,
        max_axis_velocity_mm_per_s: f64,
        acceleration_mm_per_s2: f64,
    ) -> Self {
        Self {
            acceleration_time_s,
            linear_time_s,
            two_vmax_per_a: 2.0 * max_axis_velocity_mm_per_s / acceleration_mm_per_s2,
        }
    }

    /// Translate a uniform-movement instant into the accelerated timeline.
    pub fn to_real_time(&self, pt_s: f64) -> f64 {
        // acceleration: S = Tpseudo * Vmax = a * t^2 / 2
        let t = (pt_s * self.two_vmax_per_a).sqrt();
        if t <= self.acceleration_time_s {
            return t;
        }

        // linear part
        let t = self.acceleration_time_s + pt_s
            - self.acceleration_time_s * self.acceleration_time_s / self.two_vmax_per_a;
        let bt = t - self.acceleration_time_s - self.linear_time_s;
        if bt <= 0.0 {
            return t;
        }

        // braking: V on the brake start is the same as on the acceleration
        // end; clamp keeps the last pulse of an exact-end arc from drifting
        // past the estimate by a rounding hair
        2.0 * self.acceleration_time_s + self.linear_time_s
            - (self.acceleration_time_s * self.acceleration_time_s - self.two_vmax_per_a * bt)
                .max(0.0)
                .sqrt()
    }

    pub fn total_time_s(&self) -> f64 {
        self.acceleration_time_s * 2.0 + self.linear_time_s
    }
}

enum Shape {
    Linear(LinearShape),
    Circular(CircularShape),
}

impl Shape {
    fn sample(&self, counters: &[u64; 4]) -> (AxisSigns, AxisTimes) {
        match self {
            Shape::Linear(s) => s.sample(counters),
            Shape::Circular(s) => s.sample(counters),
        }
    }

    fn advance(&mut self, axis: usize) {
        if let Shape::Circular(s) = self {
            s.advance(axis);
        }
    }
}

/// One-shot pulse stream for a single motion segment.
///
/// The iterator owns its parameters and a per-axis pulse counter; times are
/// guaranteed non-decreasing across the stream and strictly increasing per
/// axis.
pub struct PulseGenerator {
    shape: Shape,
    profile: Profile,
    counters: [u64; 4],
    last_direction: Option<AxisSigns>,
    delta: Vector4,
    pulses_per_mm: [f64; 4],
}

impl PulseGenerator {
    /// Linear segment. `delta` must be snapped to the step grid and non-empty.
    pub fn linear(
        delta: Vector4,
        velocity_mm_per_min: f64,
        config: &MachineConfig,
    ) -> Result<Self, PulseError> {
        if delta.is_zero() {
            return Err(PulseError::EmptyMove);
        }
        let ppm = axis_pulses(config);
        let (shape, profile) = LinearShape::new(
            delta,
            velocity_mm_per_min,
            ppm,
            config.acceleration_mm_per_s2(),
        );
        debug!(
            target: "pulses",
            delta = %delta,
            velocity_mm_per_min,
            total_time_s = profile.total_time_s(),
            "linear_segment"
        );
        Ok(Self {
            shape: Shape::Linear(shape),
            profile,
            counters: [0; 4],
            last_direction: None,
            delta,
            pulses_per_mm: ppm,
        })
    }

    /// Arc in `plane` with the orthogonal axis and E co-moved linearly.
    /// `delta` and `radius` must be snapped to the step grid; an empty
    /// in-plane delta means one full revolution.
    pub fn circular(
        delta: Vector4,
        radius: Vector4,
        plane: Plane,
        direction: RotationDirection,
        velocity_mm_per_min: f64,
        config: &MachineConfig,
    ) -> Result<Self, PulseError> {
        let ppm = axis_pulses(config);
        let (shape, profile) = CircularShape::new(
            delta,
            radius,
            plane,
            direction,
            velocity_mm_per_min,
            ppm,
            config.acceleration_mm_per_s2(),
        )?;
        let achieved = shape.net_delta();
        debug!(
            target: "pulses",
            delta = %delta,
            achieved = %achieved,
            radius = %radius,
            plane = %plane,
            velocity_mm_per_min,
            total_time_s = profile.total_time_s(),
            "circular_segment"
        );
        Ok(Self {
            shape: Shape::Circular(shape),
            profile,
            counters: [0; 4],
            last_direction: None,
            delta: achieved,
            pulses_per_mm: ppm,
        })
    }

    /// Net grid displacement this stream produces. For arcs this is the point
    /// actually reachable on the step grid, which the dispatcher uses for the
    /// position update and the residual segment.
    pub fn delta(&self) -> Vector4 {
        self.delta
    }

    pub fn total_time_s(&self) -> f64 {
        self.profile.total_time_s()
    }

    pub fn pulses_per_mm(&self) -> [f64; 4] {
        self.pulses_per_mm
    }
}

fn axis_pulses(config: &MachineConfig) -> [f64; 4] {
    [
        config.pulses_per_mm(Axis::X),
        config.pulses_per_mm(Axis::Y),
        config.pulses_per_mm(Axis::Z),
        config.pulses_per_mm(Axis::E),
    ]
}

impl Iterator for PulseGenerator {
    type Item = PulseEvent;

    fn next(&mut self) -> Option<PulseEvent> {
        let (direction, times) = self.shape.sample(&self.counters);
        if Some(direction) != self.last_direction {
            self.last_direction = Some(direction);
            return Some(PulseEvent::Direction(direction));
        }
        let m = times
            .iter()
            .flatten()
            .fold(f64::INFINITY, |acc, t| acc.min(*t));
        if !m.is_finite() {
            return None;
        }
        let real = self.profile.to_real_time(m);

        let mut out = [None; 4];
        for (i, t) in times.iter().enumerate() {
            if let Some(t) = t
                && *t <= m
            {
                out[i] = Some(real);
                self.counters[i] += 1;
                self.shape.advance(i);
            }
        }
        Some(PulseEvent::Step(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_config::MachineConfig;

    fn config() -> MachineConfig {
        let mut cfg = MachineConfig::default();
        cfg.file.control.stepper_max_acceleration_mm_per_s2 = 200.0;
        cfg.file.axis.stepper_pulses_per_mm_x = 400.0;
        cfg.file.axis.stepper_pulses_per_mm_y = 400.0;
        cfg.file.axis.stepper_pulses_per_mm_z = 400.0;
        cfg.file.axis.stepper_pulses_per_mm_e = 400.0;
        cfg
    }

    const VELOCITY: f64 = 1800.0;

    /// Consume a stream checking the shared contract, returning per-axis
    /// signed counts and the largest emitted time.
    fn drain(stream: PulseGenerator) -> ([i64; 4], f64) {
        let total = stream.total_time_s();
        let mut signs = [0i8; 4];
        let mut signed = [0i64; 4];
        let mut last = [None::<f64>; 4];
        let mut max_t: f64 = 0.0;
        let mut seen_direction = false;
        for event in stream {
            match event {
                PulseEvent::Direction(d) => {
                    seen_direction = true;
                    signs = d;
                }
                PulseEvent::Step(times) => {
                    assert!(seen_direction, "pulse before direction event");
                    let present: Vec<f64> = times.iter().flatten().copied().collect();
                    assert!(!present.is_empty());
                    for w in present.windows(2) {
                        assert_eq!(w[0], w[1], "unequal times within one event");
                    }
                    for (i, t) in times.iter().enumerate() {
                        if let Some(t) = t {
                            if let Some(prev) = last[i] {
                                assert!(*t > prev, "axis time not strictly increasing");
                            }
                            last[i] = Some(*t);
                            signed[i] += signs[i] as i64;
                            max_t = max_t.max(*t);
                        }
                    }
                }
            }
        }
        assert!(max_t <= total + 1e-6, "pulse after total time estimate");
        (signed, max_t)
    }

    #[test]
    fn zero_movement_is_rejected() {
        let cfg = config();
        assert_eq!(
            PulseGenerator::linear(Vector4::zero(), VELOCITY, &cfg).err(),
            Some(PulseError::EmptyMove)
        );
    }

    #[test]
    fn single_step_movement() {
        let cfg = config();
        let step = 1.0 / 400.0;
        let stream =
            PulseGenerator::linear(Vector4::new(step, 0.0, 0.0, 0.0), VELOCITY, &cfg).unwrap();
        let (signed, _) = drain(stream);
        assert_eq!(signed, [1, 0, 0, 0]);

        let stream =
            PulseGenerator::linear(Vector4::new(step, step, step, step), VELOCITY, &cfg).unwrap();
        let (signed, _) = drain(stream);
        assert_eq!(signed, [1, 1, 1, 1]);
    }

    #[test]
    fn first_event_is_direction_with_idle_axes_zero() {
        let cfg = config();
        let stream =
            PulseGenerator::linear(Vector4::new(1.0, 0.0, -2.0, 0.0), VELOCITY, &cfg).unwrap();
        let first = stream.into_iter().next().unwrap();
        assert_eq!(first, PulseEvent::Direction([1, 0, -1, 0]));
    }

    #[test]
    fn twice_faster_axis_interleaves_exactly() {
        let cfg = config();
        let stream =
            PulseGenerator::linear(Vector4::new(2.0, 4.0, 0.0, 0.0), VELOCITY, &cfg).unwrap();
        let mut i = 0u64;
        for event in stream {
            if let PulseEvent::Step(times) = event {
                if i % 2 == 0 {
                    assert!(times[0].is_some());
                } else {
                    assert!(times[0].is_none());
                }
                assert!(times[1].is_some());
                assert!(times[2].is_none());
                i += 1;
            }
        }
        assert_eq!(i, 4 * 400);
    }

    #[test]
    fn pulse_counts_match_distance() {
        let cfg = config();
        let delta = Vector4::new(200.0, 300.0, 48.0, 0.0);
        let stream = PulseGenerator::linear(delta, VELOCITY, &cfg).unwrap();
        let (signed, _) = drain(stream);
        assert_eq!(signed[0], 200 * 400);
        assert_eq!(signed[1], 300 * 400);
        assert_eq!(signed[2], 48 * 400);
        assert_eq!(signed[3], 0);
    }

    #[test]
    fn negative_delta_counts_down() {
        let cfg = config();
        let delta = Vector4::new(-1.0, 0.0, 0.0, -2.0);
        let stream = PulseGenerator::linear(delta, VELOCITY, &cfg).unwrap();
        let (signed, _) = drain(stream);
        assert_eq!(signed[0], -400);
        assert_eq!(signed[3], -800);
    }

    #[test]
    fn acceleration_shapes_the_interval_sequence() {
        // Near the midpoint the inter-pulse interval must equal the uniform
        // one; both ends must be strictly slower.
        let cfg = config();
        let stream =
            PulseGenerator::linear(Vector4::new(200.0, 0.0, 0.0, 0.0), VELOCITY, &cfg).unwrap();
        let mut times = Vec::new();
        for event in stream {
            if let PulseEvent::Step(t) = event {
                times.push(t[0].unwrap());
            }
        }
        let n = times.len();
        assert_eq!(n, 200 * 400);
        let accel_interval = times[2] - times[1];
        let mid_interval = times[n / 2] - times[n / 2 - 1];
        let brake_interval = times[n - 1] - times[n - 2];
        let uniform = SECONDS_IN_MINUTE / (VELOCITY * 400.0);
        assert!((mid_interval - uniform).abs() < uniform * 0.01);
        assert!(accel_interval > mid_interval);
        assert!(brake_interval > mid_interval);
    }

    #[test]
    fn triangular_profile_for_short_moves() {
        // A move too short to reach cruise speed still emits the right number
        // of pulses and stays within its own time estimate.
        let cfg = config();
        let stream = PulseGenerator::linear(Vector4::new(0.5, 0.0, 0.0, 0.0), 6000.0, &cfg).unwrap();
        let (signed, max_t) = drain(stream);
        assert_eq!(signed[0], 200);
        assert!(max_t > 0.0);
    }

    #[test]
    fn full_circle_returns_to_start_with_four_r_of_travel() {
        let cfg = config();
        let stream = PulseGenerator::circular(
            Vector4::zero(),
            Vector4::new(1.0, 0.0, 0.0, 0.0),
            Plane::Xy,
            RotationDirection::Ccw,
            VELOCITY,
            &cfg,
        )
        .unwrap();
        assert_eq!(stream.delta(), Vector4::zero());
        let mut per_axis = [0u64; 4];
        let mut signs = [0i8; 4];
        let mut signed = [0i64; 4];
        let mut direction_events = 0;
        for event in stream {
            match event {
                PulseEvent::Direction(d) => {
                    direction_events += 1;
                    signs = d;
                }
                PulseEvent::Step(times) => {
                    for (i, t) in times.iter().enumerate() {
                        if t.is_some() {
                            per_axis[i] += 1;
                            signed[i] += signs[i] as i64;
                        }
                    }
                }
            }
        }
        // four quadrants of travel per in-plane axis
        assert_eq!(per_axis[0], 4 * 400);
        assert_eq!(per_axis[1], 4 * 400);
        assert_eq!(per_axis[2], 0);
        assert_eq!(signed[0], 0);
        assert_eq!(signed[1], 0);
        // each in-plane axis reverses twice over a full revolution
        assert!(direction_events >= 3, "got {direction_events}");
    }

    #[test]
    fn helical_arc_moves_orthogonal_and_extruder() {
        let cfg = config();
        let stream = PulseGenerator::circular(
            Vector4::new(0.0, 0.0, 5.0, 2.0),
            Vector4::new(1.0, 0.0, 0.0, 0.0),
            Plane::Xy,
            RotationDirection::Cw,
            VELOCITY,
            &cfg,
        )
        .unwrap();
        let (signed, _) = drain(stream);
        assert_eq!(signed[0], 0);
        assert_eq!(signed[1], 0);
        assert_eq!(signed[2], 5 * 400);
        assert_eq!(signed[3], 2 * 400);
    }

    #[test]
    fn quarter_arc_net_displacement() {
        // CCW quarter from (R, 0) to (0, R) around centre at (-R, 0) offset.
        let cfg = config();
        let r = 2.0;
        let stream = PulseGenerator::circular(
            Vector4::new(-r, r, 0.0, 0.0),
            Vector4::new(-r, 0.0, 0.0, 0.0),
            Plane::Xy,
            RotationDirection::Ccw,
            VELOCITY,
            &cfg,
        )
        .unwrap();
        let achieved = stream.delta();
        assert!((achieved.x - -r).abs() < 1.0 / 400.0 + 1e-9);
        assert!((achieved.y - r).abs() < 1.0 / 400.0 + 1e-9);
        let (signed, _) = drain(stream);
        assert_eq!(signed[0], -(r * 400.0) as i64);
        assert_eq!(signed[1], (r * 400.0) as i64);
    }

    #[test]
    fn zero_radius_is_rejected() {
        let cfg = config();
        let err = PulseGenerator::circular(
            Vector4::new(1.0, 1.0, 0.0, 0.0),
            Vector4::zero(),
            Plane::Xy,
            RotationDirection::Cw,
            VELOCITY,
            &cfg,
        )
        .err();
        assert_eq!(err, Some(PulseError::ZeroRadius));
    }

    #[test]
    fn zx_plane_uses_its_own_axes() {
        let cfg = config();
        let stream = PulseGenerator::circular(
            Vector4::zero(),
            Vector4::new(0.0, 0.0, 1.0, 0.0),
            Plane::Zx,
            RotationDirection::Ccw,
            VELOCITY,
            &cfg,
        )
        .unwrap();
        let mut per_axis = [0u64; 4];
        for event in stream {
            if let PulseEvent::Step(times) = event {
                for (i, t) in times.iter().enumerate() {
                    if t.is_some() {
                        per_axis[i] += 1;
                    }
                }
            }
        }
        assert_eq!(per_axis[0], 4 * 400);
        assert_eq!(per_axis[1], 0);
        assert_eq!(per_axis[2], 4 * 400);
    }
}
