//! MIDI value types and the output sink capability.
//!
//! The clock never talks to hardware. Everything it emits goes through a
//! [`MidiSink`]; device bindings live outside this crate. Two sinks ship
//! with the core:
//!
//! - [`NullSink`] - discards everything
//! - [`ChannelSink`] - forwards each primitive as a [`MidiEvent`] over a
//!   crossbeam channel, for hosts that drain events on their own thread

use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fmt;

/// Highest valid MIDI note number.
pub const MAX_PITCH: u8 = 127;

/// Highest valid 7-bit data value (velocity, controller value, program).
pub const MAX_DATA: u8 = 127;

/// Semitones per octave.
pub const OCTAVE: u8 = 12;

/// Controller number for pan.
pub const CC_PAN: u8 = 10;

/// Controller number for reverb send level.
pub const CC_REVERB: u8 = 91;

const CC_NRPN_MSB: u8 = 99;
const CC_NRPN_LSB: u8 = 98;
const CC_DATA_ENTRY_MSB: u8 = 6;
const CC_DATA_ENTRY_LSB: u8 = 38;

/// Reject note numbers above 127.
pub fn validate_pitch(pitch: u8) -> Result<u8> {
    if pitch > MAX_PITCH {
        return Err(Error::invalid_argument(format!(
            "pitch {pitch} is outside the MIDI range 0-127"
        )));
    }
    Ok(pitch)
}

/// Reject 7-bit data values above 127.
pub fn validate_data(name: &str, value: u8) -> Result<u8> {
    if value > MAX_DATA {
        return Err(Error::invalid_argument(format!(
            "{name} {value} is outside the range 0-127"
        )));
    }
    Ok(value)
}

/// Pitch class (0 = C ... 11 = B).
pub fn pitch_class(pitch: u8) -> u8 {
    pitch % OCTAVE
}

/// Shortest distance between two pitch classes around the octave circle.
pub fn pitch_class_distance(a: u8, b: u8) -> u8 {
    let d = (pitch_class(a) as i16 - pitch_class(b) as i16).unsigned_abs() as u8;
    d.min(OCTAVE - d)
}

/// A zero-indexed MIDI channel (0-15).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(u8);

impl Channel {
    /// The General MIDI percussion channel (the 10th, zero-indexed 9).
    pub const PERCUSSION: Channel = Channel(9);

    /// Number of MIDI channels.
    pub const COUNT: u8 = 16;

    /// Create a channel, rejecting indices above 15.
    pub fn new(index: u8) -> Result<Self> {
        if index >= Self::COUNT {
            return Err(Error::invalid_argument(format!(
                "channel {index} is outside the range 0-15"
            )));
        }
        Ok(Self(index))
    }

    /// Zero-based channel index.
    pub fn index(self) -> u8 {
        self.0
    }

    pub fn is_percussion(self) -> bool {
        self == Self::PERCUSSION
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {}", self.0 + 1)
    }
}

/// A set of MIDI channels stored as a 16-bit mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelSet {
    mask: u16,
}

impl ChannelSet {
    /// No channels.
    pub const fn empty() -> Self {
        Self { mask: 0 }
    }

    /// All sixteen channels, percussion included.
    pub const fn all() -> Self {
        Self { mask: u16::MAX }
    }

    /// All channels except the percussion channel.
    pub const fn melodic() -> Self {
        Self {
            mask: u16::MAX & !(1 << 9),
        }
    }

    /// A set holding a single channel.
    pub fn single(channel: Channel) -> Self {
        Self::empty().with(channel)
    }

    /// Build a set from raw channel indices, rejecting indices above 15.
    pub fn from_indices<I>(indices: I) -> Result<Self>
    where
        I: IntoIterator<Item = u8>,
    {
        let mut set = Self::empty();
        for index in indices {
            set.insert(Channel::new(index)?);
        }
        Ok(set)
    }

    pub fn with(mut self, channel: Channel) -> Self {
        self.insert(channel);
        self
    }

    pub fn insert(&mut self, channel: Channel) {
        self.mask |= 1 << channel.index();
    }

    pub fn remove(&mut self, channel: Channel) {
        self.mask &= !(1 << channel.index());
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.mask & (1 << channel.index()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// Iterate the member channels in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        (0..Channel::COUNT)
            .map(Channel)
            .filter(move |c| self.contains(*c))
    }
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<Channel> for ChannelSet {
    fn from_iter<T: IntoIterator<Item = Channel>>(iter: T) -> Self {
        let mut set = Self::empty();
        for channel in iter {
            set.insert(channel);
        }
        set
    }
}

/// A MIDI primitive as delivered to a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiEvent {
    /// Note on event (channel, note 0-127, velocity 0-127)
    NoteOn { channel: Channel, pitch: u8, velocity: u8 },
    /// Note off event (channel, note 0-127, release velocity)
    NoteOff { channel: Channel, pitch: u8, velocity: u8 },
    /// Control change (channel, controller number, value)
    ControlChange { channel: Channel, control: u8, value: u8 },
    /// Program change
    ProgramChange { channel: Channel, program: u8 },
    /// Pitch bend, signed and centered at 0 (-8192..=8191)
    PitchBend { channel: Channel, value: i16 },
    /// Non-registered parameter number with 14-bit parameter and value
    Nrpn { channel: Channel, parameter: u16, value: u16 },
    /// System exclusive payload
    SysEx(Vec<u8>),
}

/// The send primitives the clock needs from an output device.
///
/// Implementations are called from the dispatch thread while the queue lock
/// is held, so they should return quickly and must not panic.
pub trait MidiSink: Send + Sync {
    fn note_on(&self, channel: Channel, pitch: u8, velocity: u8);

    fn note_off(&self, channel: Channel, pitch: u8, velocity: u8);

    fn control_change(&self, channel: Channel, control: u8, value: u8);

    fn program_change(&self, channel: Channel, program: u8);

    fn pitch_bend(&self, channel: Channel, value: i16);

    /// Send an NRPN as the standard four controller messages
    /// (parameter MSB/LSB, then data entry MSB/LSB).
    fn nrpn(&self, channel: Channel, parameter: u16, value: u16) {
        self.control_change(channel, CC_NRPN_MSB, ((parameter >> 7) & 0x7f) as u8);
        self.control_change(channel, CC_NRPN_LSB, (parameter & 0x7f) as u8);
        self.control_change(channel, CC_DATA_ENTRY_MSB, ((value >> 7) & 0x7f) as u8);
        self.control_change(channel, CC_DATA_ENTRY_LSB, (value & 0x7f) as u8);
    }

    fn sysex(&self, data: &[u8]);
}

/// A sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MidiSink for NullSink {
    fn note_on(&self, _channel: Channel, _pitch: u8, _velocity: u8) {}
    fn note_off(&self, _channel: Channel, _pitch: u8, _velocity: u8) {}
    fn control_change(&self, _channel: Channel, _control: u8, _value: u8) {}
    fn program_change(&self, _channel: Channel, _program: u8) {}
    fn pitch_bend(&self, _channel: Channel, _value: i16) {}
    fn nrpn(&self, _channel: Channel, _parameter: u16, _value: u16) {}
    fn sysex(&self, _data: &[u8]) {}
}

/// A sink that forwards every primitive over a crossbeam channel.
///
/// Sends never block. Once the receiver is gone events are dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<MidiEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it.
    pub fn new() -> (Self, Receiver<MidiEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    /// Wrap an existing sender.
    pub fn from_sender(tx: Sender<MidiEvent>) -> Self {
        Self { tx }
    }

    fn forward(&self, event: MidiEvent) {
        if self.tx.send(event).is_err() {
            log::trace!("ChannelSink receiver dropped, discarding event");
        }
    }
}

impl MidiSink for ChannelSink {
    fn note_on(&self, channel: Channel, pitch: u8, velocity: u8) {
        self.forward(MidiEvent::NoteOn {
            channel,
            pitch,
            velocity,
        });
    }

    fn note_off(&self, channel: Channel, pitch: u8, velocity: u8) {
        self.forward(MidiEvent::NoteOff {
            channel,
            pitch,
            velocity,
        });
    }

    fn control_change(&self, channel: Channel, control: u8, value: u8) {
        self.forward(MidiEvent::ControlChange {
            channel,
            control,
            value,
        });
    }

    fn program_change(&self, channel: Channel, program: u8) {
        self.forward(MidiEvent::ProgramChange { channel, program });
    }

    fn pitch_bend(&self, channel: Channel, value: i16) {
        self.forward(MidiEvent::PitchBend { channel, value });
    }

    fn nrpn(&self, channel: Channel, parameter: u16, value: u16) {
        self.forward(MidiEvent::Nrpn {
            channel,
            parameter,
            value,
        });
    }

    fn sysex(&self, data: &[u8]) {
        self.forward(MidiEvent::SysEx(data.to_vec()));
    }
}
