//! Piecewise exponential envelopes
//!
//! An `Envelope` is an ordered, contiguous list of segments, each of which
//! interpolates between two levels with a tunable curve shape:
//!
//!   y(t) = y0 + (y1 - y0) / (e^S - 1) * (e^(S*n) - 1)
//!
//! where n is the normalized position in [0, 1] and S is the curve shape.
//! S = 0 is linear, S > 0 changes late, S < 0 changes early. The forward
//! integral has a closed form per segment; near S = 0 the exponential model
//! is singular and we fall back to linear interpolation.
//!
//! Combining two envelopes (sum or product) does not stay within this
//! segment family, so the binary operations resample at segment boundaries,
//! local extrema, and inflection points, and refit one exponential per
//! resulting sub-segment. That is a deliberate approximation, not an exact
//! algebraic closure.

use crate::error::ConfigError;

/// Below this magnitude a curve shape is treated as exactly linear, since the
/// exponential formula degenerates (division by e^S - 1).
pub const LINEAR_SHAPE_EPSILON: f64 = 1e-6;

/// A single envelope segment with exponential interpolation.
#[derive(Clone, Debug, PartialEq)]
pub struct EnvelopeSegment {
    pub t0: f64,
    pub t1: f64,
    pub level0: f64,
    pub level1: f64,
    pub curve_shape: f64,
}

impl EnvelopeSegment {
    pub fn new(t0: f64, t1: f64, level0: f64, level1: f64, curve_shape: f64) -> Self {
        Self {
            t0,
            t1,
            level0,
            level1,
            curve_shape,
        }
    }

    /// Fit a segment through a halfway guide point instead of giving the
    /// shape directly. Used when refitting resampled curves.
    pub fn from_endpoints_and_halfway_level(
        t0: f64,
        t1: f64,
        level0: f64,
        level1: f64,
        halfway_level: f64,
    ) -> Self {
        if level0 == level1 {
            // a flat segment is the best we can do regardless of the guide point
            return Self::new(t0, t1, level0, level1, 0.0);
        }
        let halfway_norm = (halfway_level - level0) / (level1 - level0);
        if halfway_norm <= 0.0 || halfway_norm >= 1.0 {
            // guide point is not strictly between the endpoints; degrade to linear
            return Self::new(t0, t1, level0, level1, 0.0);
        }
        let curve_shape = 2.0 * (1.0 / halfway_norm - 1.0).ln();
        Self::new(t0, t1, level0, level1, curve_shape)
    }

    pub fn duration(&self) -> f64 {
        self.t1 - self.t0
    }

    pub fn is_linear(&self) -> bool {
        self.curve_shape.abs() < LINEAR_SHAPE_EPSILON
    }

    pub fn max_level(&self) -> f64 {
        // exponential interpolation is monotonic between the endpoints
        self.level0.max(self.level1)
    }

    pub fn contains(&self, t: f64) -> bool {
        self.t0 <= t && t < self.t1
    }

    /// Integration constants for the exponential form; None means linear.
    fn coefficients(&self) -> Option<(f64, f64)> {
        if self.is_linear() {
            return None;
        }
        let s = self.curve_shape;
        let dl = self.level1 - self.level0;
        let a = self.level0 - dl / (s.exp() - 1.0);
        let b = dl / (s * (s.exp() - 1.0));
        Some((a, b))
    }

    /// Interpolated value at t, clipped to the segment's level range outside
    /// its domain.
    pub fn value_at(&self, t: f64) -> f64 {
        if t >= self.t1 {
            return self.level1;
        }
        if t <= self.t0 {
            return self.level0;
        }
        self.value_at_unclipped(t)
    }

    fn value_at_unclipped(&self, t: f64) -> f64 {
        let norm_t = (t - self.t0) / (self.t1 - self.t0);
        if self.is_linear() {
            return self.level0 + norm_t * (self.level1 - self.level0);
        }
        let s = self.curve_shape;
        self.level0 + (self.level1 - self.level0) / (s.exp() - 1.0) * ((s * norm_t).exp() - 1.0)
    }

    /// Antiderivative of the interpolation curve at a normalized position.
    fn antiderivative(&self, a: f64, b: f64, norm_t: f64) -> f64 {
        a * norm_t + b * (self.curve_shape * norm_t).exp()
    }

    /// Closed-form integral of this segment from a to b (absolute positions,
    /// both within [t0, t1]).
    pub fn integrate(&self, a: f64, b: f64) -> f64 {
        debug_assert!(self.t0 <= a && a <= self.t1 && self.t0 <= b && b <= self.t1);
        if a == b {
            return 0.0;
        }
        let len = self.t1 - self.t0;
        let norm_a = (a - self.t0) / len;
        let norm_b = (b - self.t0) / len;

        match self.coefficients() {
            None => {
                // linear: trapezoid on the interpolated endpoint levels
                let level_a = (1.0 - norm_a) * self.level0 + norm_a * self.level1;
                let level_b = (1.0 - norm_b) * self.level0 + norm_b * self.level1;
                (b - a) * (level_a + level_b) / 2.0
            }
            Some((ca, cb)) => {
                len * (self.antiderivative(ca, cb, norm_b) - self.antiderivative(ca, cb, norm_a))
            }
        }
    }

    /// Split this segment at t without altering the curve, shrinking self to
    /// the first part and returning the second.
    pub fn split_at(&mut self, t: f64) -> EnvelopeSegment {
        debug_assert!(self.t0 < t && t < self.t1);
        let middle_level = self.value_at(t);
        // the shape says how much of e^x the segment traverses, so a split
        // divides it proportionally
        let shape_1 = (t - self.t0) / (self.t1 - self.t0) * self.curve_shape;
        let shape_2 = self.curve_shape - shape_1;
        let second = EnvelopeSegment::new(t, self.t1, middle_level, self.level1, shape_2);
        self.t1 = t;
        self.level1 = middle_level;
        self.curve_shape = shape_1;
        second
    }
}

/// A piecewise exponential curve. Constant-extrapolates beyond both ends.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    segments: Vec<EnvelopeSegment>,
}

impl Envelope {
    /// A length-zero envelope holding a constant level at t = 0.
    pub fn constant(level: f64) -> Self {
        Self {
            segments: vec![EnvelopeSegment::new(0.0, 0.0, level, level, 0.0)],
        }
    }

    pub fn from_segments(segments: Vec<EnvelopeSegment>) -> Result<Self, ConfigError> {
        if segments.is_empty() {
            return Err(ConfigError::MalformedEnvelope(
                "an envelope needs at least one segment".into(),
            ));
        }
        for pair in segments.windows(2) {
            if pair[0].t1 != pair[1].t0 {
                return Err(ConfigError::MalformedEnvelope(format!(
                    "segments are not contiguous at t = {}",
                    pair[0].t1
                )));
            }
        }
        Ok(Self { segments })
    }

    /// Build from N+1 levels, N durations and N curve shapes, starting at 0.
    pub fn from_levels_and_durations(
        levels: &[f64],
        durations: &[f64],
        curve_shapes: &[f64],
    ) -> Result<Self, ConfigError> {
        if levels.is_empty() {
            return Err(ConfigError::MalformedEnvelope(
                "at least one level is needed".into(),
            ));
        }
        if levels.len() == 1 {
            return Ok(Self::constant(levels[0]));
        }
        if durations.len() != levels.len() - 1 || curve_shapes.len() != durations.len() {
            return Err(ConfigError::MalformedEnvelope(format!(
                "{} levels require {} durations and curve shapes, got {} and {}",
                levels.len(),
                levels.len() - 1,
                durations.len(),
                curve_shapes.len()
            )));
        }
        if durations.iter().any(|d| !d.is_finite() || *d < 0.0) {
            return Err(ConfigError::MalformedEnvelope(
                "durations must be finite and non-negative".into(),
            ));
        }
        let mut segments = Vec::with_capacity(durations.len());
        let mut t = 0.0;
        for i in 0..durations.len() {
            segments.push(EnvelopeSegment::new(
                t,
                t + durations[i],
                levels[i],
                levels[i + 1],
                curve_shapes[i],
            ));
            t += durations[i];
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[EnvelopeSegment] {
        &self.segments
    }

    pub fn start_time(&self) -> f64 {
        self.segments[0].t0
    }

    pub fn end_time(&self) -> f64 {
        self.segments[self.segments.len() - 1].t1
    }

    pub fn start_level(&self) -> f64 {
        self.segments[0].level0
    }

    pub fn end_level(&self) -> f64 {
        self.segments[self.segments.len() - 1].level1
    }

    pub fn length(&self) -> f64 {
        self.end_time() - self.start_time()
    }

    /// The levels at every segment boundary (N segments give N+1 levels).
    /// With `durations` and `curve_shapes` these are the plain structured
    /// values handed to external serialization.
    pub fn levels(&self) -> Vec<f64> {
        let mut out: Vec<f64> = vec![self.segments[0].level0];
        out.extend(self.segments.iter().map(|s| s.level1));
        out
    }

    pub fn durations(&self) -> Vec<f64> {
        self.segments.iter().map(|s| s.duration()).collect()
    }

    pub fn curve_shapes(&self) -> Vec<f64> {
        self.segments.iter().map(|s| s.curve_shape).collect()
    }

    /// The segment boundary positions.
    pub fn times(&self) -> Vec<f64> {
        let mut out: Vec<f64> = vec![self.segments[0].t0];
        out.extend(self.segments.iter().map(|s| s.t1));
        out
    }

    pub fn value_at(&self, t: f64) -> f64 {
        if t < self.start_time() {
            return self.start_level();
        }
        for segment in &self.segments {
            if segment.contains(t) {
                return segment.value_at(t);
            }
        }
        self.end_level()
    }

    /// Index of the last segment starting at or before t.
    fn segment_index_at(&self, t: f64) -> usize {
        // partition_point gives the count of segments with t0 <= t
        let n = self.segments.partition_point(|s| s.t0 <= t);
        n.saturating_sub(1)
    }

    /// Insert a control point at t without changing the curve's shape.
    pub fn insert_interpolated(&mut self, t: f64) {
        if t < self.start_time() {
            let level = self.start_level();
            let first = &self.segments[0];
            self.segments
                .insert(0, EnvelopeSegment::new(t, first.t0, level, level, 0.0));
            return;
        }
        if t > self.end_time() {
            let level = self.end_level();
            let last_end = self.end_time();
            self.segments
                .push(EnvelopeSegment::new(last_end, t, level, level, 0.0));
            return;
        }
        let i = self.segment_index_at(t);
        let segment = &mut self.segments[i];
        if t > segment.t0 && t < segment.t1 {
            let second = segment.split_at(t);
            self.segments.insert(i + 1, second);
        }
    }

    /// Append a segment reaching `level` after `duration`. When both the last
    /// segment and the new one are linear and the new endpoint continues the
    /// last segment's trajectory to within `tolerance`, the last segment is
    /// extended instead of adding a new one.
    pub fn append_segment(&mut self, level: f64, duration: f64, curve_shape: f64, tolerance: f64) {
        let end_time = self.end_time();
        let end_level = self.end_level();

        enum Plan {
            ReplaceJumpLevel,
            RewriteLastInPlace,
            ExtendLinear,
            PushNew,
        }
        let plan = {
            let last = self.segments.last().unwrap();
            if last.duration() == 0.0 {
                if duration == 0.0 {
                    // two zero-length jumps collapse into one
                    Plan::ReplaceJumpLevel
                } else if last.level1 != last.level0 {
                    // the jump carries information; keep it and add a real segment
                    Plan::PushNew
                } else {
                    // the zero-length segment was inert; rewrite it in place
                    Plan::RewriteLastInPlace
                }
            } else if last.is_linear()
                && curve_shape.abs() < LINEAR_SHAPE_EPSILON
                && duration > 0.0
                && (extrapolate_linear(last, end_time + duration) - level).abs() <= tolerance
            {
                // close enough to a continuation of the previous linear segment
                Plan::ExtendLinear
            } else {
                Plan::PushNew
            }
        };

        match plan {
            Plan::ReplaceJumpLevel => {
                self.segments.last_mut().unwrap().level1 = level;
            }
            Plan::RewriteLastInPlace => {
                let last = self.segments.last_mut().unwrap();
                last.level1 = level;
                last.t1 = end_time + duration;
                last.curve_shape = curve_shape;
            }
            Plan::ExtendLinear => {
                let last = self.segments.last_mut().unwrap();
                last.t1 = end_time + duration;
                last.level1 = level;
            }
            Plan::PushNew => {
                self.segments.push(EnvelopeSegment::new(
                    end_time,
                    end_time + duration,
                    end_level,
                    level,
                    curve_shape,
                ));
            }
        }
    }

    /// Remove everything after t, splitting the segment containing it.
    pub fn remove_segments_after(&mut self, t: f64) {
        if t <= self.start_time() {
            let level = self.value_at(t);
            self.segments = vec![EnvelopeSegment::new(t, t, level, level, 0.0)];
            return;
        }
        if t >= self.end_time() {
            return;
        }
        self.insert_interpolated(t);
        self.segments.retain(|s| s.t1 <= t);
    }

    /// Integral over [t1, t2] with constant extrapolation outside the domain.
    pub fn integrate_interval(&self, t1: f64, t2: f64) -> f64 {
        if t1 == t2 {
            return 0.0;
        }
        if t2 < t1 {
            return -self.integrate_interval(t2, t1);
        }
        let start = self.start_time();
        let end = self.end_time();
        if t1 < start {
            return (start.min(t2) - t1) * self.start_level()
                + if t2 > start {
                    self.integrate_interval(start, t2)
                } else {
                    0.0
                };
        }
        if t2 > end {
            return (t2 - end.max(t1)) * self.end_level()
                + if t1 < end {
                    self.integrate_interval(t1, end)
                } else {
                    0.0
                };
        }

        let mut integral = 0.0;
        for segment in &self.segments[self.segment_index_at(t1)..] {
            if segment.t0 >= t2 {
                break;
            }
            let a = t1.max(segment.t0);
            let b = t2.min(segment.t1);
            if b > a {
                integral += segment.integrate(a, b);
            }
        }
        integral
    }

    /// Maximum level attained anywhere in [t1, t2].
    pub fn max_level_in(&self, t1: f64, t2: f64) -> f64 {
        let mut max = self.value_at(t1).max(self.value_at(t2));
        for segment in &self.segments {
            if segment.t1 > t1 && segment.t0 < t2 {
                max = max.max(segment.max_level());
            }
        }
        max
    }

    /// Find t2 >= t1 such that the integral over [t1, t2] equals
    /// `desired_area`, to within `max_error`. The exponential segment model
    /// has no elementary inverse, so this iterates: guess from the local
    /// level, then walk forward (or conservatively back off after an
    /// overshoot). Levels must be strictly positive for this to converge.
    pub fn upper_integration_bound(&self, t1: f64, desired_area: f64, max_error: f64) -> f64 {
        let mut t = t1;
        let mut remaining = desired_area;
        loop {
            if remaining < max_error {
                return t;
            }
            let level = self.value_at(t);
            let guess = remaining / level + t;
            let area = self.integrate_interval(t, guess);
            if area <= remaining {
                if remaining - area < max_error {
                    return guess;
                }
                remaining -= area;
                t = guess;
            } else {
                // overshot: a point based on the max level in the window is
                // guaranteed not to pass the true bound
                let conservative = level / self.max_level_in(t, guess) * (guess - t) + t;
                remaining -= self.integrate_interval(t, conservative);
                t = conservative;
            }
        }
    }

    /// Sum of two envelopes, resampled and refit within `tolerance`.
    pub fn add_resampled(&self, other: &Envelope, tolerance: f64) -> Envelope {
        self.binary_op_resampled(other, tolerance, |a, b| a + b)
    }

    /// Product of two envelopes, resampled and refit within `tolerance`.
    pub fn mul_resampled(&self, other: &Envelope, tolerance: f64) -> Envelope {
        self.binary_op_resampled(other, tolerance, |a, b| a * b)
    }

    fn binary_op_resampled(
        &self,
        other: &Envelope,
        tolerance: f64,
        op: impl Fn(f64, f64) -> f64,
    ) -> Envelope {
        // align both envelopes on the union of their control points, then
        // refit the combined value segment by segment
        let mut knots: Vec<f64> = self.times();
        knots.extend(other.times());
        knots.sort_by(|a, b| a.total_cmp(b));
        knots.dedup();

        let f = |t: f64| op(self.value_at(t), other.value_at(t));
        let mut result = segments_from_function(&f, &knots);
        merge_redundant_linear(&mut result, tolerance);
        Envelope { segments: result }
    }
}

fn extrapolate_linear(segment: &EnvelopeSegment, t: f64) -> f64 {
    let norm_t = (t - segment.t0) / (segment.t1 - segment.t0);
    segment.level0 + norm_t * (segment.level1 - segment.level0)
}

/// Resolution used when scanning a function for extrema and inflections.
const KEY_POINT_RESOLUTION: usize = 100;

/// Build monotonic exponential segments approximating `f` between each pair
/// of consecutive knots, adding internal key points at sign changes of the
/// first and second differences.
fn segments_from_function(f: &impl Fn(f64) -> f64, knots: &[f64]) -> Vec<EnvelopeSegment> {
    let mut key_points: Vec<f64> = Vec::new();
    for pair in knots.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        key_points.push(a);
        if b > a {
            key_points.extend(interior_key_points(f, a, b));
        }
    }
    key_points.push(knots[knots.len() - 1]);
    key_points.dedup();

    let mut segments = Vec::new();
    let mut i = 0;
    // a bounded number of halving passes keeps degenerate functions from
    // looping forever
    let mut splits_left = 8 * key_points.len();
    while i < key_points.len() - 1 {
        let a = key_points[i];
        let b = key_points[i + 1];
        let halfway = (a + b) / 2.0;
        let (va, vh, vb) = (f(a), f(halfway), f(b));

        let strictly_monotonic = va.min(vb) < vh && vh < va.max(vb);
        let is_constant = va == vh && vh == vb;
        if !(strictly_monotonic || is_constant) && splits_left > 0 {
            key_points.insert(i + 1, halfway);
            splits_left -= 1;
            continue;
        }
        segments.push(EnvelopeSegment::from_endpoints_and_halfway_level(
            a, b, va, vb, vh,
        ));
        i += 1;
    }
    segments
}

/// Sign changes in the first and second differences of f over (a, b).
fn interior_key_points(f: &impl Fn(f64) -> f64, a: f64, b: f64) -> Vec<f64> {
    let step = (b - a) / KEY_POINT_RESOLUTION as f64;
    let mut points = Vec::new();
    let mut prev_value: Option<f64> = None;
    let mut prev_diff: Option<f64> = None;
    let mut prev_second: Option<f64> = None;
    for i in 0..=KEY_POINT_RESOLUTION {
        let t = a + i as f64 * step;
        let value = f(t);
        if let Some(pv) = prev_value {
            // rounding avoids spurious sign changes from float noise
            let diff = round_to(value - pv, 1e-10);
            if let Some(pd) = prev_diff {
                if diff * pd < 0.0 {
                    points.push(t - step); // local extremum
                }
                let second = round_to(diff - pd, 1e-10);
                if let Some(ps) = prev_second {
                    if second * ps < 0.0 && points.last() != Some(&(t - step)) {
                        points.push(t - step); // inflection point
                    }
                }
                prev_second = Some(second);
            }
            prev_diff = Some(diff);
        }
        prev_value = Some(value);
    }
    points.retain(|p| *p > a && *p < b);
    points
}

fn round_to(x: f64, quantum: f64) -> f64 {
    (x / quantum).round() * quantum
}

/// Collapse runs of linear segments that continue each other within
/// tolerance.
fn merge_redundant_linear(segments: &mut Vec<EnvelopeSegment>, tolerance: f64) {
    let mut merged: Vec<EnvelopeSegment> = Vec::with_capacity(segments.len());
    for segment in segments.drain(..) {
        if let Some(last) = merged.last_mut() {
            if last.is_linear()
                && segment.is_linear()
                && last.duration() > 0.0
                && segment.duration() > 0.0
                && (extrapolate_linear(last, segment.t1) - segment.level1).abs() <= tolerance
            {
                last.t1 = segment.t1;
                last.level1 = segment.level1;
                continue;
            }
        }
        merged.push(segment);
    }
    *segments = merged;
}
