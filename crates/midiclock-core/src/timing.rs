//! Timing primitives for the clock.
//!
//! - [`Stopwatch`] - accumulated wall time across start/stop cycles
//! - [`BeatTimer`] - wall time to beat conversion at an adjustable tempo
//!
//! Every method takes the current [`Instant`] explicitly so the arithmetic
//! can be exercised without sleeping.

use crate::error::{ensure_positive, Result};
use std::time::{Duration, Instant};

const MS_PER_MINUTE: f64 = 60_000.0;

/// Longest single wait handed out by [`BeatTimer::duration_until`]. Callers
/// re-evaluate after waking, so far-off beats are reached in steps.
pub const MAX_WAIT: Duration = Duration::from_secs(3600);

/// Wall time accumulated while running.
#[derive(Clone, Debug, Default)]
pub struct Stopwatch {
    accumulated: Duration,
    started_at: Option<Instant>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting at `now`. No-op while running.
    pub fn start(&mut self, now: Instant) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    /// Stop counting, keeping the elapsed time.
    pub fn stop(&mut self, now: Instant) {
        if let Some(started) = self.started_at.take() {
            self.accumulated += now.saturating_duration_since(started);
        }
    }

    /// Zero the elapsed time. A running stopwatch keeps running from `now`.
    pub fn reset(&mut self, now: Instant) {
        self.accumulated = Duration::ZERO;
        if self.started_at.is_some() {
            self.started_at = Some(now);
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Total elapsed time as of `now`.
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        match self.started_at {
            Some(started) => self.accumulated + now.saturating_duration_since(started),
            None => self.accumulated,
        }
    }

    pub fn elapsed_ms_at(&self, now: Instant) -> f64 {
        self.elapsed_at(now).as_secs_f64() * 1000.0
    }
}

/// Converts elapsed wall time into beats.
///
/// `beat = (elapsed_ms + fudge_ms) / ms_per_beat`. The fudge offset absorbs
/// tempo changes so the beat position never jumps.
#[derive(Clone, Debug)]
pub struct BeatTimer {
    bpm: f64,
    ms_per_beat: f64,
    fudge_ms: f64,
    stopwatch: Stopwatch,
}

impl BeatTimer {
    /// Create a stopped timer at beat 0.
    pub fn new(bpm: f64) -> Result<Self> {
        ensure_positive("beats per minute", bpm)?;
        Ok(Self {
            bpm,
            ms_per_beat: MS_PER_MINUTE / bpm,
            fudge_ms: 0.0,
            stopwatch: Stopwatch::new(),
        })
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn ms_per_beat(&self) -> f64 {
        self.ms_per_beat
    }

    pub fn fudge_ms(&self) -> f64 {
        self.fudge_ms
    }

    /// Change tempo, preserving the beat position at `now`.
    pub fn set_bpm(&mut self, bpm: f64, now: Instant) -> Result<()> {
        ensure_positive("beats per minute", bpm)?;
        let elapsed_ms = self.stopwatch.elapsed_ms_at(now);
        let beat = (elapsed_ms + self.fudge_ms) / self.ms_per_beat;
        let ms_per_beat = MS_PER_MINUTE / bpm;

        self.bpm = bpm;
        self.ms_per_beat = ms_per_beat;
        self.fudge_ms = beat * ms_per_beat - elapsed_ms;
        Ok(())
    }

    /// Beat position at `now`.
    pub fn beat_at(&self, now: Instant) -> f64 {
        (self.stopwatch.elapsed_ms_at(now) + self.fudge_ms) / self.ms_per_beat
    }

    /// Wall time until `beat` is reached, zero if already past and at most
    /// [`MAX_WAIT`].
    pub fn duration_until(&self, beat: f64, now: Instant) -> Duration {
        let target_ms = beat * self.ms_per_beat;
        let current_ms = self.stopwatch.elapsed_ms_at(now) + self.fudge_ms;
        let wait_ms = target_ms - current_ms;
        if wait_ms.is_nan() || wait_ms <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(wait_ms / 1000.0).map_or(MAX_WAIT, |wait| wait.min(MAX_WAIT))
    }

    pub fn start(&mut self, now: Instant) {
        self.stopwatch.start(now);
    }

    pub fn stop(&mut self, now: Instant) {
        self.stopwatch.stop(now);
    }

    pub fn is_running(&self) -> bool {
        self.stopwatch.is_running()
    }

    /// Back to beat 0; the tempo is kept.
    pub fn reset(&mut self, now: Instant) {
        self.stopwatch.reset(now);
        self.fudge_ms = 0.0;
    }
}
