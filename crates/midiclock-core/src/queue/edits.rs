//! Bulk edits over every pending note.
//!
//! Each edit takes a [`NoteFilter`] and returns how many messages it changed
//! or removed. Edits that delete run [`MessageQueue::cleanup`] before
//! returning; edits that move messages in time re-bucket the queue.
//!
//! "Note" here means a self-propagating [`NoteOnOff`](crate::NoteOnOff).
//! Pitch edits skip the percussion channel, where the note number selects a
//! drum sound rather than a pitch.

use super::{MessageQueue, NoteFilter};
use crate::error::{ensure_positive, Error, Result};
use crate::message::{ensure_duration, ensure_time, Message, NoteOnOff};
use crate::midi::{validate_data, validate_pitch, Channel, ChannelSet, MAX_PITCH, OCTAVE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Curve used by [`MessageQueue::interpolate_velocity`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    #[default]
    Linear,
    /// `x^exponent` on the normalized input.
    Power(f64),
}

impl Interpolation {
    pub fn validate(&self) -> Result<()> {
        match self {
            Interpolation::Linear => Ok(()),
            Interpolation::Power(exponent) => ensure_positive("interpolation exponent", *exponent),
        }
    }

    /// Map `x` in `[0, 1]` onto `[0, 1]`.
    pub fn apply(&self, x: f64) -> f64 {
        let x = x.clamp(0.0, 1.0);
        match self {
            Interpolation::Linear => x,
            Interpolation::Power(exponent) => x.powf(*exponent),
        }
    }
}

/// Bit pattern of a time or duration, with -0.0 folded into 0.0.
fn key_bits(value: f64) -> u64 {
    (value + 0.0).to_bits()
}

fn shift_octaves_up(pitch: u8, target: u8) -> u8 {
    let mut pitch = pitch;
    while pitch < target && pitch + OCTAVE <= MAX_PITCH {
        pitch += OCTAVE;
    }
    pitch
}

fn shift_octaves_down(pitch: u8, target: u8) -> u8 {
    let mut pitch = pitch;
    while pitch > target && pitch >= OCTAVE {
        pitch -= OCTAVE;
    }
    pitch
}

impl MessageQueue {
    /// Apply `f` to every note accepted by `select`, counting the `true`s.
    fn edit_notes<S, F>(&mut self, select: S, mut f: F) -> usize
    where
        S: Fn(&Message) -> bool,
        F: FnMut(&mut NoteOnOff) -> bool,
    {
        let mut changed = 0;
        for message in self.iter_mut() {
            if !select(&*message) {
                continue;
            }
            if let Some(note) = message.note_on_off_mut() {
                if f(note) {
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Tombstone every message accepted by `select` and `remove`, then clean up.
    fn remove_where<S, R>(&mut self, select: S, remove: R) -> usize
    where
        S: Fn(&Message) -> bool,
        R: Fn(&Message) -> bool,
    {
        for message in self.iter_mut() {
            if select(&*message) && remove(&*message) {
                message.tombstone();
            }
        }
        let removed = self.cleanup();
        log::trace!("removed {removed} notes");
        removed
    }

    /// Keep one note per (pitch, time, duration): the loudest, and the
    /// earliest scheduled among equally loud ones.
    pub fn remove_identical_notes(&mut self, filter: &NoteFilter) -> Result<usize> {
        Ok(self.dedup_by(
            |m| filter.matches_melodic_note(m),
            |m| {
                let note = m.note_on_off_ref()?;
                Some((note.note.pitch, key_bits(m.time()), key_bits(note.duration)))
            },
        ))
    }

    /// Keep one percussion note per (drum key, time).
    pub fn remove_identical_percussion_notes(&mut self, filter: &NoteFilter) -> Result<usize> {
        Ok(self.dedup_by(
            |m| filter.matches_percussion_note(m),
            |m| Some((m.note()?.pitch, key_bits(m.time()), 0)),
        ))
    }

    fn dedup_by<S, K>(&mut self, select: S, key: K) -> usize
    where
        S: Fn(&Message) -> bool,
        K: Fn(&Message) -> Option<(u8, u64, u64)>,
    {
        // Positions are flat indices in dispatch order; the structure does
        // not change until cleanup.
        let mut keepers: HashMap<(u8, u64, u64), (usize, u8)> = HashMap::new();
        let mut candidates = Vec::new();
        for (pos, message) in self.iter().enumerate() {
            if !select(&*message) {
                continue;
            }
            let (Some(k), Some(note)) = (key(message), message.note()) else {
                continue;
            };
            candidates.push((pos, k));
            keepers
                .entry(k)
                .and_modify(|best| {
                    if note.velocity > best.1 {
                        *best = (pos, note.velocity);
                    }
                })
                .or_insert((pos, note.velocity));
        }

        let mut doomed = vec![false; self.len()];
        for (pos, k) in candidates {
            if keepers.get(&k).is_some_and(|best| best.0 != pos) {
                doomed[pos] = true;
            }
        }
        for (pos, message) in self.iter_mut().enumerate() {
            if doomed[pos] {
                message.tombstone();
            }
        }
        let removed = self.cleanup();
        log::trace!("removed {removed} duplicate notes");
        removed
    }

    /// Raise notes below `min` by whole octaves until they reach it.
    pub fn set_min_pitch(&mut self, filter: &NoteFilter, min: u8) -> Result<usize> {
        validate_pitch(min)?;
        Ok(self.edit_notes(
            |m| filter.matches_melodic_note(m),
            |n| {
                let pitch = shift_octaves_up(n.note.pitch, min);
                let changed = pitch != n.note.pitch;
                n.note.pitch = pitch;
                changed
            },
        ))
    }

    /// Lower notes above `max` by whole octaves until they reach it.
    pub fn set_max_pitch(&mut self, filter: &NoteFilter, max: u8) -> Result<usize> {
        validate_pitch(max)?;
        Ok(self.edit_notes(
            |m| filter.matches_melodic_note(m),
            |n| {
                let pitch = shift_octaves_down(n.note.pitch, max);
                let changed = pitch != n.note.pitch;
                n.note.pitch = pitch;
                changed
            },
        ))
    }

    /// Deal with notes below `bound`: remove those accepted by `delete_if`,
    /// raise those accepted by `move_if` by octaves until at or above it.
    pub fn move_pitch_above<D, M>(
        &mut self,
        filter: &NoteFilter,
        bound: u8,
        delete_if: D,
        move_if: M,
    ) -> Result<usize>
    where
        D: Fn(&Message) -> bool,
        M: Fn(&Message) -> bool,
    {
        validate_pitch(bound)?;
        Ok(self.move_pitch(
            filter,
            |pitch| pitch < bound,
            |pitch| shift_octaves_up(pitch, bound),
            delete_if,
            move_if,
        ))
    }

    /// Deal with notes above `bound`: remove those accepted by `delete_if`,
    /// lower those accepted by `move_if` by octaves until at or below it.
    pub fn move_pitch_below<D, M>(
        &mut self,
        filter: &NoteFilter,
        bound: u8,
        delete_if: D,
        move_if: M,
    ) -> Result<usize>
    where
        D: Fn(&Message) -> bool,
        M: Fn(&Message) -> bool,
    {
        validate_pitch(bound)?;
        Ok(self.move_pitch(
            filter,
            |pitch| pitch > bound,
            |pitch| shift_octaves_down(pitch, bound),
            delete_if,
            move_if,
        ))
    }

    fn move_pitch<O, T, D, M>(
        &mut self,
        filter: &NoteFilter,
        outside: O,
        toward: T,
        delete_if: D,
        move_if: M,
    ) -> usize
    where
        O: Fn(u8) -> bool,
        T: Fn(u8) -> u8,
        D: Fn(&Message) -> bool,
        M: Fn(&Message) -> bool,
    {
        let mut changed = 0;
        for message in self.iter_mut() {
            if !filter.matches_melodic_note(message) {
                continue;
            }
            let Some(pitch) = message.note().map(|n| n.pitch) else {
                continue;
            };
            if !outside(pitch) {
                continue;
            }
            if delete_if(&*message) {
                message.tombstone();
                changed += 1;
            } else if move_if(&*message) {
                let moved = toward(pitch);
                if let Some(n) = message.note_on_off_mut() {
                    if moved != pitch {
                        n.note.pitch = moved;
                        changed += 1;
                    }
                }
            }
        }
        self.cleanup();
        changed
    }

    /// Raise velocities below `min`. Silenced notes (velocity 0) stay silent.
    pub fn set_min_velocity(&mut self, filter: &NoteFilter, min: u8) -> Result<usize> {
        ensure_velocity_bound(min)?;
        Ok(self.edit_notes(
            |m| filter.matches_note(m),
            |n| {
                if n.note.velocity == 0 || n.note.velocity >= min {
                    return false;
                }
                n.note.velocity = min;
                true
            },
        ))
    }

    /// Lower velocities above `max`.
    pub fn set_max_velocity(&mut self, filter: &NoteFilter, max: u8) -> Result<usize> {
        ensure_velocity_bound(max)?;
        Ok(self.edit_notes(
            |m| filter.matches_note(m),
            |n| {
                if n.note.velocity <= max {
                    return false;
                }
                n.note.velocity = max;
                true
            },
        ))
    }

    /// Lengthen notes shorter than `min` beats.
    pub fn set_min_duration(&mut self, filter: &NoteFilter, min: f64) -> Result<usize> {
        ensure_duration("minimum duration", min)?;
        Ok(self.edit_notes(
            |m| filter.matches_note(m),
            |n| {
                if n.duration >= min {
                    return false;
                }
                n.duration = min;
                true
            },
        ))
    }

    /// Shorten notes longer than `max` beats.
    pub fn set_max_duration(&mut self, filter: &NoteFilter, max: f64) -> Result<usize> {
        ensure_duration("maximum duration", max)?;
        Ok(self.edit_notes(
            |m| filter.matches_note(m),
            |n| {
                if n.duration <= max {
                    return false;
                }
                n.duration = max;
                true
            },
        ))
    }

    /// Remap every velocity from `0..=127` into `new_min..=new_max`.
    pub fn interpolate_velocity(
        &mut self,
        filter: &NoteFilter,
        new_min: u8,
        new_max: u8,
        method: Interpolation,
    ) -> Result<usize> {
        validate_data("velocity", new_min)?;
        validate_data("velocity", new_max)?;
        if new_min > new_max {
            return Err(Error::invalid_argument(format!(
                "velocity range {new_min}..={new_max} is empty"
            )));
        }
        method.validate()?;

        let (low, high) = (new_min as f64, new_max as f64);
        Ok(self.edit_notes(
            |m| filter.matches_note(m),
            |n| {
                let x = n.note.velocity as f64 / 127.0;
                let velocity = (low + (high - low) * method.apply(x)).round() as u8;
                let changed = velocity != n.note.velocity;
                n.note.velocity = velocity;
                changed
            },
        ))
    }

    /// Quantize message times to the nearest multiple of `1 / fraction` beats.
    pub fn to_precision(&mut self, filter: &NoteFilter, fraction: f64) -> Result<usize> {
        ensure_positive("precision fraction", fraction)?;
        let quantize = |time: f64| (time * fraction).round() / fraction;
        for message in self.iter().filter(|m| filter.matches_timed(m)) {
            ensure_time(quantize(message.time()))?;
        }

        let mut changed = 0;
        for message in self.iter_mut() {
            if !filter.matches_timed(message) {
                continue;
            }
            let time = quantize(message.time());
            if time != message.time() {
                message.set_time(time);
                changed += 1;
            }
        }
        if changed > 0 {
            self.rebucket();
        }
        Ok(changed)
    }

    /// Multiply message times and note durations by `factor`.
    pub fn scale_duration_and_time(&mut self, filter: &NoteFilter, factor: f64) -> Result<usize> {
        ensure_positive("scale factor", factor)?;
        for message in self.iter().filter(|m| filter.matches_timed(m)) {
            ensure_time(message.time() * factor)?;
            if let Some(duration) = message.duration() {
                ensure_time(duration * factor)?;
            }
        }

        let mut changed = 0;
        for message in self.iter_mut() {
            if !filter.matches_timed(message) {
                continue;
            }
            let time = message.time() * factor;
            let mut moved = time != message.time();
            message.set_time(time);
            if let Some(n) = message.note_on_off_mut() {
                let duration = n.duration * factor;
                moved |= duration != n.duration;
                n.duration = duration;
            }
            if moved {
                changed += 1;
            }
        }
        if changed > 0 {
            self.rebucket();
        }
        Ok(changed)
    }

    /// Move selected notes (all note variants) to `target`.
    ///
    /// The percussion channel is never a target and never a source; asking
    /// for it is a no-op rather than an error.
    pub fn map_note_channels(&mut self, filter: &NoteFilter, target: Channel) -> Result<usize> {
        if target.is_percussion() {
            log::debug!("refusing to map notes onto the percussion channel");
            return Ok(0);
        }
        let mut changed = 0;
        for message in self.iter_mut() {
            if !filter.matches_any_note(message) {
                continue;
            }
            match message.channel() {
                Some(source) if !source.is_percussion() && source != target => {
                    message.set_channel(target);
                    changed += 1;
                }
                _ => {}
            }
        }
        Ok(changed)
    }

    /// Move every channel message on `sources` to `target`.
    ///
    /// The percussion channel is skipped as a source and ignored as a target.
    pub fn map_source_channels_to_target_channel(
        &mut self,
        sources: ChannelSet,
        target: Channel,
    ) -> Result<usize> {
        if target.is_percussion() {
            log::debug!("refusing to map channels onto the percussion channel");
            return Ok(0);
        }
        let mut changed = 0;
        for message in self.iter_mut() {
            if !message.is_live() {
                continue;
            }
            match message.channel() {
                Some(source)
                    if sources.contains(source) && !source.is_percussion() && source != target =>
                {
                    message.set_channel(target);
                    changed += 1;
                }
                _ => {}
            }
        }
        Ok(changed)
    }

    /// Replace note pitches, in time order, with a cyclic melody.
    ///
    /// Runs of repeated source pitches keep the same melody pitch for up to
    /// `max_repeat` notes before the melody advances. `max_repeat == 0`
    /// advances on every note.
    pub fn apply_melody(
        &mut self,
        filter: &NoteFilter,
        melody: &[u8],
        max_repeat: usize,
    ) -> Result<usize> {
        if melody.is_empty() {
            return Err(Error::invalid_argument("melody must not be empty"));
        }
        for pitch in melody {
            validate_pitch(*pitch)?;
        }

        let mut index = 0;
        let mut held = 0;
        let mut previous: Option<u8> = None;
        Ok(self.edit_notes(
            |m| filter.matches_melodic_note(m),
            |n| {
                let original = n.note.pitch;
                if let Some(prev) = previous {
                    if max_repeat == 0 || original != prev || held >= max_repeat {
                        index = (index + 1) % melody.len();
                        held = 0;
                    }
                }
                n.note.pitch = melody[index];
                held += 1;
                previous = Some(original);
                n.note.pitch != original
            },
        ))
    }

    /// Remove notes lasting longer than `max` beats.
    pub fn remove_notes_longer_than(&mut self, filter: &NoteFilter, max: f64) -> Result<usize> {
        ensure_duration("duration", max)?;
        Ok(self.remove_where(
            |m| filter.matches_note(m),
            |m| m.duration().is_some_and(|d| d > max),
        ))
    }

    /// Remove notes lasting less than `min` beats.
    pub fn remove_notes_shorter_than(&mut self, filter: &NoteFilter, min: f64) -> Result<usize> {
        ensure_duration("duration", min)?;
        Ok(self.remove_where(
            |m| filter.matches_note(m),
            |m| m.duration().is_some_and(|d| d < min),
        ))
    }

    /// Remove notes pitched above `max`.
    pub fn remove_notes_above(&mut self, filter: &NoteFilter, max: u8) -> Result<usize> {
        validate_pitch(max)?;
        Ok(self.remove_where(
            |m| filter.matches_melodic_note(m),
            |m| m.note().is_some_and(|n| n.pitch > max),
        ))
    }

    /// Remove notes pitched below `min`.
    pub fn remove_notes_below(&mut self, filter: &NoteFilter, min: u8) -> Result<usize> {
        validate_pitch(min)?;
        Ok(self.remove_where(
            |m| filter.matches_melodic_note(m),
            |m| m.note().is_some_and(|n| n.pitch < min),
        ))
    }

    /// Transpose selected notes up an octave. Each call moves again.
    pub fn set_octave_above(&mut self, filter: &NoteFilter) -> Result<usize> {
        self.transpose(filter, OCTAVE as i8)
    }

    /// Transpose selected notes down an octave. Each call moves again.
    pub fn set_octave_below(&mut self, filter: &NoteFilter) -> Result<usize> {
        self.transpose(filter, -(OCTAVE as i8))
    }

    /// Shift selected notes by `semitones`, skipping notes that would leave
    /// the MIDI range.
    pub fn transpose(&mut self, filter: &NoteFilter, semitones: i8) -> Result<usize> {
        Ok(self.edit_notes(
            |m| filter.matches_melodic_note(m),
            |n| {
                let shifted = n.note.pitch as i16 + semitones as i16;
                if semitones == 0 || !(0..=MAX_PITCH as i16).contains(&shifted) {
                    return false;
                }
                n.note.pitch = shifted as u8;
                true
            },
        ))
    }
}

fn ensure_velocity_bound(bound: u8) -> Result<()> {
    if bound == 0 {
        return Err(Error::invalid_argument("velocity bound must be greater than zero"));
    }
    validate_data("velocity bound", bound)?;
    Ok(())
}
