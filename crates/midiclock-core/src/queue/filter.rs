//! Selection of the messages a bulk edit applies to.

use crate::error::{Error, Result};
use crate::message::{Message, NoteOnOff};
use crate::midi::{validate_pitch, Channel, ChannelSet};

/// Selects messages by channel, pitch range and time window.
///
/// The default filter matches every channel, every pitch and every time.
/// Pitch bounds and the window are inclusive at the start; the window end is
/// exclusive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoteFilter {
    channels: ChannelSet,
    pitches: Option<(u8, u8)>,
    window: Option<(f64, f64)>,
}

impl Default for NoteFilter {
    fn default() -> Self {
        Self {
            channels: ChannelSet::all(),
            pitches: None,
            window: None,
        }
    }
}

impl NoteFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match only the given channels.
    pub fn channels(mut self, channels: ChannelSet) -> Self {
        self.channels = channels;
        self
    }

    /// Match a single channel.
    pub fn channel(self, channel: Channel) -> Self {
        self.channels(ChannelSet::single(channel))
    }

    /// Match pitches in `low..=high`.
    pub fn pitch_range(mut self, low: u8, high: u8) -> Result<Self> {
        validate_pitch(low)?;
        validate_pitch(high)?;
        if low > high {
            return Err(Error::invalid_argument(format!(
                "pitch range {low}..={high} is empty"
            )));
        }
        self.pitches = Some((low, high));
        Ok(self)
    }

    /// Match message times in `start..end`.
    pub fn window(mut self, start: f64, end: f64) -> Result<Self> {
        if !start.is_finite() || !end.is_finite() || start > end {
            return Err(Error::invalid_argument(format!(
                "time window {start}..{end} is invalid"
            )));
        }
        self.window = Some((start, end));
        Ok(self)
    }

    pub fn channel_set(&self) -> ChannelSet {
        self.channels
    }

    fn time_matches(&self, time: f64) -> bool {
        match self.window {
            Some((start, end)) => time >= start && time < end,
            None => true,
        }
    }

    fn pitch_matches(&self, pitch: u8) -> bool {
        match self.pitches {
            Some((low, high)) => pitch >= low && pitch <= high,
            None => true,
        }
    }

    /// Live message of any note variant on a selected channel, pitch and time.
    pub fn matches_any_note(&self, message: &Message) -> bool {
        if !message.is_live() || !self.time_matches(message.time()) {
            return false;
        }
        match message.note() {
            Some(note) => self.channels.contains(note.channel) && self.pitch_matches(note.pitch),
            None => false,
        }
    }

    /// Live self-propagating note selected by this filter.
    pub fn matches_note(&self, message: &Message) -> bool {
        message.note_on_off_ref().is_some() && self.matches_any_note(message)
    }

    /// Like [`matches_note`](Self::matches_note) but excluding the
    /// percussion channel, for edits where pitch means a musical pitch.
    pub fn matches_melodic_note(&self, message: &Message) -> bool {
        self.matches_note(message) && !is_percussion(message.note_on_off_ref())
    }

    /// Live percussion note selected by this filter; the pitch range acts as
    /// the percussion key range.
    pub fn matches_percussion_note(&self, message: &Message) -> bool {
        self.matches_note(message) && is_percussion(message.note_on_off_ref())
    }

    /// Any live message for time-based edits.
    ///
    /// Channel messages must be on a selected channel (and, for notes, in the
    /// pitch range). Channel-less messages only match a filter that selects
    /// every channel.
    pub fn matches_timed(&self, message: &Message) -> bool {
        if !message.is_live() || !self.time_matches(message.time()) {
            return false;
        }
        if let Some(note) = message.note() {
            return self.channels.contains(note.channel) && self.pitch_matches(note.pitch);
        }
        match message.channel() {
            Some(channel) => self.channels.contains(channel),
            None => self.channels == ChannelSet::all(),
        }
    }
}

fn is_percussion(note: Option<&NoteOnOff>) -> bool {
    note.is_some_and(|n| n.note.channel.is_percussion())
}
