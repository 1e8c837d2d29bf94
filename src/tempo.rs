//! Tempo envelopes - beat length as a curve over beats
//!
//! A `TempoEnvelope` is an [`Envelope`] of *beat length* (seconds per beat,
//! or really parent-beats per beat) against this clock's own beat axis, plus
//! a cursor holding the position reached so far in both beat-space and
//! time-space. Integrating beat length over a beat interval gives the time
//! the interval takes; the inverse (how many beats fit in a given amount of
//! time) is solved iteratively since the exponential segment model has no
//! elementary inverse.
//!
//! Three equivalent views are exposed: beat length (s/beat), rate (beats/s),
//! and tempo (beats per minute). All mutations validate positivity up front;
//! a non-positive tempo is a configuration error, never a silent hang.

use crate::envelope::{Envelope, EnvelopeSegment};
use crate::error::ConfigError;

/// Error budget when inverting time back into beats.
const BEAT_SOLVE_MAX_ERROR: f64 = 1e-8;

/// Whether a tempo target's duration is measured in this clock's own beats
/// or in its time (i.e. the parent's beats).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DurationUnits {
    Beats,
    Time,
}

fn check_beat_length(value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidBeatLength(value))
    }
}

fn check_rate(value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidRate(value))
    }
}

fn check_tempo(value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidTempo(value))
    }
}

fn check_duration(value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidDuration(value))
    }
}

/// A tempo curve plus the (beat, time) position reached so far.
#[derive(Clone, Debug)]
pub struct TempoEnvelope {
    curve: Envelope,
    beat: f64,
    time: f64,
}

impl TempoEnvelope {
    /// A constant-rate envelope (rate in beats per second).
    pub fn new(initial_rate: f64) -> Result<Self, ConfigError> {
        let rate = check_rate(initial_rate)?;
        Ok(Self {
            curve: Envelope::constant(1.0 / rate),
            beat: 0.0,
            time: 0.0,
        })
    }

    /// Build from explicit beat-length levels, durations (in beats), and
    /// curve shapes.
    pub fn from_beat_lengths(
        levels: &[f64],
        durations: &[f64],
        curve_shapes: &[f64],
    ) -> Result<Self, ConfigError> {
        for level in levels {
            check_beat_length(*level)?;
        }
        Ok(Self {
            curve: Envelope::from_levels_and_durations(levels, durations, curve_shapes)?,
            beat: 0.0,
            time: 0.0,
        })
    }

    /// Build from tempo levels in beats per minute.
    pub fn from_tempos(
        levels: &[f64],
        durations: &[f64],
        curve_shapes: &[f64],
    ) -> Result<Self, ConfigError> {
        let mut beat_lengths = Vec::with_capacity(levels.len());
        for level in levels {
            beat_lengths.push(60.0 / check_tempo(*level)?);
        }
        Ok(Self {
            curve: Envelope::from_levels_and_durations(&beat_lengths, durations, curve_shapes)?,
            beat: 0.0,
            time: 0.0,
        })
    }

    /// Wrap a prebuilt beat-length curve, cursor at the curve's start.
    /// The caller guarantees the levels are positive.
    pub(crate) fn from_envelope(curve: Envelope) -> Self {
        let beat = curve.start_time();
        Self {
            curve,
            beat,
            time: 0.0,
        }
    }

    /// The beat position reached so far.
    pub fn beat(&self) -> f64 {
        self.beat
    }

    /// The time position reached so far (units of the parent's beats).
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn curve(&self) -> &Envelope {
        &self.curve
    }

    pub fn beat_length(&self) -> f64 {
        self.curve.value_at(self.beat)
    }

    pub fn beat_length_at(&self, beat: f64) -> f64 {
        self.curve.value_at(beat)
    }

    /// Rate in beats per second at the cursor.
    pub fn rate(&self) -> f64 {
        1.0 / self.beat_length()
    }

    pub fn rate_at(&self, beat: f64) -> f64 {
        1.0 / self.curve.value_at(beat)
    }

    /// Tempo in beats per minute at the cursor.
    pub fn tempo(&self) -> f64 {
        self.rate() * 60.0
    }

    pub fn tempo_at(&self, beat: f64) -> f64 {
        self.rate_at(beat) * 60.0
    }

    /// Plain structured values for external serialization.
    pub fn levels(&self) -> Vec<f64> {
        self.curve.levels()
    }

    pub fn durations(&self) -> Vec<f64> {
        self.curve.durations()
    }

    pub fn curve_shapes(&self) -> Vec<f64> {
        self.curve.curve_shapes()
    }

    /// Drop everything after `beat`, padding with a constant segment if the
    /// curve had not yet been extended that far.
    fn truncate_at(&mut self, beat: f64) {
        if self.curve.end_time() <= beat {
            let gap = beat - self.curve.end_time();
            if gap > 0.0 {
                self.curve.append_segment(self.curve.end_level(), gap, 0.0, 0.0);
            }
        } else {
            self.curve.remove_segments_after(beat);
        }
    }

    /// Splice a new constant beat length in at `beat`, discarding whatever
    /// curve lay beyond it.
    pub fn set_beat_length_at(&mut self, beat: f64, value: f64) -> Result<(), ConfigError> {
        let value = check_beat_length(value)?;
        self.truncate_at(beat);
        self.curve.append_segment(value, 0.0, 0.0, 0.0);
        Ok(())
    }

    pub fn set_rate_at(&mut self, beat: f64, rate: f64) -> Result<(), ConfigError> {
        let rate = check_rate(rate)?;
        self.set_beat_length_at(beat, 1.0 / rate)
    }

    pub fn set_tempo_at(&mut self, beat: f64, tempo: f64) -> Result<(), ConfigError> {
        let tempo = check_tempo(tempo)?;
        self.set_beat_length_at(beat, 60.0 / tempo)
    }

    /// Install a glide from the current level at `beat` toward
    /// `beat_length_target`, lasting `duration` (in `units`), with the given
    /// curve shape. Anything previously scheduled beyond `beat` is replaced.
    pub fn set_beat_length_target_at(
        &mut self,
        beat: f64,
        beat_length_target: f64,
        duration: f64,
        curve_shape: f64,
        units: DurationUnits,
    ) -> Result<(), ConfigError> {
        let target = check_beat_length(beat_length_target)?;
        let duration = check_duration(duration)?;
        self.truncate_at(beat);

        match units {
            DurationUnits::Beats => {
                self.curve.append_segment(target, duration, curve_shape, 0.0);
            }
            DurationUnits::Time => {
                // how long would the glide take if it were one beat long?
                let normalized_time = EnvelopeSegment::new(
                    0.0,
                    1.0,
                    self.curve.end_level(),
                    target,
                    curve_shape,
                )
                .integrate(0.0, 1.0);
                let beats_needed = duration / normalized_time;
                self.curve.append_segment(target, beats_needed, curve_shape, 0.0);
            }
        }
        Ok(())
    }

    pub fn set_rate_target_at(
        &mut self,
        beat: f64,
        rate_target: f64,
        duration: f64,
        curve_shape: f64,
        units: DurationUnits,
    ) -> Result<(), ConfigError> {
        let rate = check_rate(rate_target)?;
        self.set_beat_length_target_at(beat, 1.0 / rate, duration, curve_shape, units)
    }

    pub fn set_tempo_target_at(
        &mut self,
        beat: f64,
        tempo_target: f64,
        duration: f64,
        curve_shape: f64,
        units: DurationUnits,
    ) -> Result<(), ConfigError> {
        let tempo = check_tempo(tempo_target)?;
        self.set_beat_length_target_at(beat, 60.0 / tempo, duration, curve_shape, units)
    }

    /// Append another tempo curve starting at `start_beat`, discarding
    /// whatever was previously scheduled beyond it.
    pub fn extend_with(&mut self, other: &TempoEnvelope, start_beat: f64) {
        self.truncate_at(start_beat);
        if self.curve.end_level() != other.curve.start_level() {
            self.curve.append_segment(other.curve.start_level(), 0.0, 0.0, 0.0);
        }
        let levels = other.levels();
        let durations = other.durations();
        let shapes = other.curve_shapes();
        for i in 0..durations.len() {
            self.curve.append_segment(levels[i + 1], durations[i], shapes[i], 0.0);
        }
    }

    /// Time it takes to advance from `from_beat` to `to_beat`.
    pub fn time_for_beats(&self, from_beat: f64, to_beat: f64) -> f64 {
        self.curve.integrate_interval(from_beat, to_beat)
    }

    /// Time it takes to advance `beats` beats from the cursor.
    pub fn wait_time_for_beats(&self, beats: f64) -> f64 {
        self.time_for_beats(self.beat, self.beat + beats)
    }

    /// How many beats fit into `time` seconds starting at `from_beat`.
    pub fn beats_for_time(&self, from_beat: f64, time: f64) -> f64 {
        if time <= 0.0 {
            return 0.0;
        }
        self.curve
            .upper_integration_bound(from_beat, time, BEAT_SOLVE_MAX_ERROR)
            - from_beat
    }

    /// Advance the cursor by `beats`, returning (beats, time) advanced.
    pub fn advance(&mut self, beats: f64) -> (f64, f64) {
        let wait_time = self.wait_time_for_beats(beats);
        self.advance_exact(beats, wait_time);
        (beats, wait_time)
    }

    /// Advance the cursor by `seconds` of time, returning (beats, time)
    /// advanced.
    pub fn advance_time(&mut self, seconds: f64) -> (f64, f64) {
        let beats = self.beats_for_time(self.beat, seconds);
        self.advance_exact(beats, seconds);
        (beats, seconds)
    }

    /// Advance by a (beats, time) pair that has already been computed, so
    /// cursor bookkeeping stays exactly consistent with the caller's math.
    pub fn advance_exact(&mut self, beats: f64, wait_time: f64) {
        self.beat += beats;
        self.time += wait_time;
    }

    /// Jump the cursor to an absolute beat, recomputing the time position
    /// from the start of the curve.
    pub fn go_to_beat(&mut self, beat: f64) {
        self.beat = beat;
        self.time = self.curve.integrate_interval(0.0, beat);
    }
}

impl Default for TempoEnvelope {
    fn default() -> Self {
        Self {
            curve: Envelope::constant(1.0),
            beat: 0.0,
            time: 0.0,
        }
    }
}
