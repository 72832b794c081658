//! Circular interpolation with quadrant tracking.
//!
//! The arc is parametrised by the angle φ around the centre; the first plane
//! axis follows `R·cos φ`, the second `R·sin φ` (i.e. `cos` with a −π/2 phase
//! shift), so both in-plane axes run the same little state machine in local
//! coordinates. Pulse `i` of an in-plane axis happens when the axis coordinate
//! crosses the next step-grid level along its zig-zag path; the conjugate
//! coordinate is recovered from `a² + b² = R²` and the half-plane bit resolves
//! the acos branch. When the next level would overshoot ±R the axis reverses
//! and the half-plane flips, which is what surfaces as a mid-arc direction
//! event. The orthogonal axis and E are plain linear sub-motions sharing the
//! same pseudo-timeline.

use std::f64::consts::TAU;

use core_geometry::{Axis, Plane, RotationDirection, Vector4};

use crate::{AxisSigns, AxisTimes, Profile, PulseError, SECONDS_IN_MINUTE};

// coordinate comparisons against ±R
const GEOM_EPS: f64 = 1e-9;
// slack when comparing a crossing angle against the arc end
const END_EPS: f64 = 1e-8;

fn axis_slot(axis: Axis) -> usize {
    match axis {
        Axis::X => 0,
        Axis::Y => 1,
        Axis::Z => 2,
        Axis::E => 3,
    }
}

/// Step-grid walker for one in-plane axis.
#[derive(Debug, Clone)]
struct PlaneAxis {
    slot: usize,
    step: f64,
    radius: f64,
    /// Rotation sign: +1 CCW, −1 CW.
    sigma: f64,
    /// Local angle of the start point for this axis' parametrisation.
    psi0: f64,
    total_angle: f64,
    /// Current grid-aligned coordinate relative to the centre.
    pos: f64,
    moving_positive: bool,
    /// Half-plane of the conjugate coordinate, resolves the acos branch.
    other_negative: bool,
    last_angle: f64,
    current_sign: i8,
    /// Next crossing: travel angle from start and the step sign.
    pending: Option<(f64, i8)>,
}

impl PlaneAxis {
    /// `c0`/`s0` are the start coordinates in this axis' local frame (own
    /// coordinate, conjugate coordinate).
    fn new(
        slot: usize,
        step: f64,
        radius: f64,
        sigma: f64,
        total_angle: f64,
        c0: f64,
        s0: f64,
    ) -> Self {
        let (moving_positive, other_negative) = if s0 == 0.0 {
            // starting on an extremum: the entered half-plane decides
            if c0 > 0.0 {
                (false, sigma < 0.0)
            } else {
                (true, sigma > 0.0)
            }
        } else {
            // d(coord)/dφ = −σ·R·sin ψ0
            (sigma * s0 < 0.0, s0 < 0.0)
        };
        let mut axis = Self {
            slot,
            step,
            radius,
            sigma,
            psi0: s0.atan2(c0),
            total_angle,
            pos: c0,
            moving_positive,
            other_negative,
            last_angle: 0.0,
            current_sign: 0,
            pending: None,
        };
        axis.compute_next();
        axis
    }

    /// Advance past the pending crossing and find the next one.
    fn compute_next(&mut self) {
        let (cand, sign) = if self.moving_positive {
            let c = self.pos + self.step;
            if c > self.radius + GEOM_EPS {
                self.moving_positive = false;
                self.other_negative = !self.other_negative;
                let c = if (self.radius - self.pos).abs() <= GEOM_EPS {
                    // the extremum itself sat on the grid and was pulsed
                    self.pos - self.step
                } else {
                    self.pos
                };
                (c, -1)
            } else {
                (c, 1)
            }
        } else {
            let c = self.pos - self.step;
            if c < -(self.radius + GEOM_EPS) {
                self.moving_positive = true;
                self.other_negative = !self.other_negative;
                let c = if (self.radius + self.pos).abs() <= GEOM_EPS {
                    self.pos + self.step
                } else {
                    self.pos
                };
                (c, 1)
            } else {
                (c, -1)
            }
        };
        if cand > self.radius + GEOM_EPS || cand < -(self.radius + GEOM_EPS) {
            // circle smaller than a single step in this direction
            self.pending = None;
            return;
        }

        let ratio = (cand / self.radius).clamp(-1.0, 1.0);
        let principal = ratio.acos();
        let psi = if self.other_negative {
            -principal
        } else {
            principal
        };
        let mut travel = (self.sigma * (psi - self.psi0)).rem_euclid(TAU);
        // crossing angles are strictly increasing along the arc; a wrapped
        // value that landed behind the previous one is a whole turn ahead
        if travel < self.last_angle + 1e-12 {
            travel += TAU;
        }
        if travel > self.total_angle + END_EPS {
            self.pending = None;
            return;
        }
        self.pos = cand;
        self.last_angle = travel;
        self.current_sign = sign;
        self.pending = Some((travel, sign));
    }

    /// Signed step count from the current state to the arc end.
    fn remaining_steps(&self) -> i64 {
        let mut probe = self.clone();
        let mut steps = 0i64;
        while let Some((_, sign)) = probe.pending {
            steps += sign as i64;
            probe.compute_next();
        }
        steps
    }
}

/// Linear sub-motion for the orthogonal axis and E.
#[derive(Debug, Clone, Copy)]
struct LinearSubAxis {
    slot: usize,
    distance_mm: f64,
    velocity_mm_per_s: f64,
    sign: i8,
    pulses_per_mm: f64,
}

impl LinearSubAxis {
    fn new(slot: usize, delta: f64, velocity_mm_per_s: f64, pulses_per_mm: f64) -> Self {
        Self {
            slot,
            distance_mm: delta.abs(),
            velocity_mm_per_s,
            sign: if delta > 0.0 {
                1
            } else if delta < 0.0 {
                -1
            } else {
                0
            },
            pulses_per_mm,
        }
    }

    fn time(&self, counter: u64) -> Option<f64> {
        let position = counter as f64 / self.pulses_per_mm;
        if self.distance_mm == 0.0 || position >= self.distance_mm {
            return None;
        }
        Some(position / self.velocity_mm_per_s)
    }
}

pub struct CircularShape {
    in_plane: [PlaneAxis; 2],
    linear: [LinearSubAxis; 2],
    radius_mm: f64,
    circular_velocity_mm_per_s: f64,
}

impl CircularShape {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        delta: Vector4,
        radius: Vector4,
        plane: Plane,
        direction: RotationDirection,
        velocity_mm_per_min: f64,
        pulses_per_mm: [f64; 4],
        acceleration: f64,
    ) -> Result<(Self, Profile), PulseError> {
        let (a_axis, b_axis) = plane.axes();
        let ortho = plane.orthogonal();
        let sigma = match direction {
            RotationDirection::Ccw => 1.0,
            RotationDirection::Cw => -1.0,
        };

        // start point relative to the centre is the negated centre offset
        let sa = -radius[a_axis];
        let sb = -radius[b_axis];
        let r = (sa * sa + sb * sb).sqrt();
        if r == 0.0 {
            return Err(PulseError::ZeroRadius);
        }
        let da = delta[a_axis];
        let db = delta[b_axis];
        let total_angle = if da == 0.0 && db == 0.0 {
            TAU
        } else {
            let ea = sa + da;
            let eb = sb + db;
            if ea == 0.0 && eb == 0.0 {
                return Err(PulseError::ZeroRadius);
            }
            let start = sb.atan2(sa);
            let end = eb.atan2(ea);
            (sigma * (end - start)).rem_euclid(TAU)
        };

        let arc_mm = r * total_angle;
        let delta_ortho = delta[ortho];
        let delta_e = delta.e;
        let total_mm =
            (arc_mm * arc_mm + delta_ortho * delta_ortho + delta_e * delta_e).sqrt();
        if total_mm == 0.0 {
            return Err(PulseError::EmptyMove);
        }
        let velocity_mm_per_s = velocity_mm_per_min / SECONDS_IN_MINUTE;
        let mut v_circ = velocity_mm_per_s * arc_mm / total_mm;
        let mut v_ortho = velocity_mm_per_s * delta_ortho.abs() / total_mm;
        let mut v_e = velocity_mm_per_s * delta_e.abs() / total_mm;

        let mut acceleration_time_s = v_circ.max(v_ortho).max(v_e) / acceleration;
        let linear_time_s;
        if acceleration * acceleration_time_s * acceleration_time_s > total_mm {
            acceleration_time_s = (total_mm / acceleration).sqrt();
            linear_time_s = 0.0;
            v_circ = arc_mm / acceleration_time_s;
            v_ortho = delta_ortho.abs() / acceleration_time_s;
            v_e = delta_e.abs() / acceleration_time_s;
        } else {
            let linear_distance =
                total_mm - acceleration_time_s * acceleration_time_s * acceleration;
            linear_time_s = linear_distance / velocity_mm_per_s;
        }
        let profile = Profile::new(
            acceleration_time_s,
            linear_time_s,
            v_circ.max(v_ortho).max(v_e),
            acceleration,
        );

        let ia = axis_slot(a_axis);
        let ib = axis_slot(b_axis);
        let shape = Self {
            in_plane: [
                PlaneAxis::new(
                    ia,
                    1.0 / pulses_per_mm[ia],
                    r,
                    sigma,
                    total_angle,
                    sa,
                    sb,
                ),
                // the sine axis sees cos(φ − π/2): local frame (sb, −sa)
                PlaneAxis::new(
                    ib,
                    1.0 / pulses_per_mm[ib],
                    r,
                    sigma,
                    total_angle,
                    sb,
                    -sa,
                ),
            ],
            linear: [
                LinearSubAxis::new(
                    axis_slot(ortho),
                    delta_ortho,
                    v_ortho,
                    pulses_per_mm[axis_slot(ortho)],
                ),
                LinearSubAxis::new(axis_slot(Axis::E), delta_e, v_e, pulses_per_mm[3]),
            ],
            radius_mm: r,
            circular_velocity_mm_per_s: v_circ,
        };
        Ok((shape, profile))
    }

    /// Net grid displacement the whole stream will produce. Only meaningful
    /// before iteration starts.
    pub(crate) fn net_delta(&self) -> Vector4 {
        let mut out = Vector4::zero();
        for pa in &self.in_plane {
            let travel = pa.remaining_steps() as f64 * pa.step;
            out = out.with_axis(slot_axis(pa.slot), travel);
        }
        for la in &self.linear {
            out = out.with_axis(slot_axis(la.slot), la.sign as f64 * la.distance_mm);
        }
        out
    }

    pub(crate) fn sample(&self, counters: &[u64; 4]) -> (AxisSigns, AxisTimes) {
        let mut signs = [0i8; 4];
        let mut times = [None; 4];
        for pa in &self.in_plane {
            signs[pa.slot] = pa.current_sign;
            if let Some((angle, _)) = pa.pending {
                times[pa.slot] =
                    Some(angle * self.radius_mm / self.circular_velocity_mm_per_s);
            }
        }
        for la in &self.linear {
            signs[la.slot] = la.sign;
            times[la.slot] = la.time(counters[la.slot]);
        }
        (signs, times)
    }

    pub(crate) fn advance(&mut self, slot: usize) {
        for pa in &mut self.in_plane {
            if pa.slot == slot {
                pa.compute_next();
                return;
            }
        }
    }
}

fn slot_axis(slot: usize) -> Axis {
    match slot {
        0 => Axis::X,
        1 => Axis::Y,
        2 => Axis::Z,
        _ => Axis::E,
    }
}
