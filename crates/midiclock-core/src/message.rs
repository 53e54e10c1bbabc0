//! Timestamped messages delivered by the clock.
//!
//! A [`Message`] pairs an identity and a beat time with a [`MessageKind`]
//! payload. Messages are compared by identity, never by value: two note-ons
//! with identical fields are still two distinct events.
//!
//! [`NoteOnOff`] is the self-propagating variant. Sending it emits the
//! note-on, moves it from [`NotePhase::Armed`] to [`NotePhase::Fired`], and
//! hands the matching note-off back to the dispatcher, which schedules it.

use crate::clock::DispatchContext;
use crate::error::{ensure_positive, Error, Result};
use crate::midi::{validate_data, validate_pitch, Channel, MidiSink, CC_PAN, CC_REVERB};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique message identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(u64);

impl MessageId {
    fn next() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Pitch and performance data shared by all note variants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Note {
    pub channel: Channel,
    /// MIDI note number (0-127). On the percussion channel this selects the
    /// drum sound.
    pub pitch: u8,
    /// 0-127
    pub velocity: u8,
    /// 0-127, sent as CC 10 before the note-on when set.
    pub pan: Option<u8>,
    /// Program sent before the note-on when set.
    pub instrument: Option<u8>,
    /// 0-127, sent as CC 91 before the note-on when set.
    pub reverb: Option<u8>,
}

impl Note {
    /// Create a note, validating pitch and velocity.
    pub fn new(channel: Channel, pitch: u8, velocity: u8) -> Result<Self> {
        Ok(Self {
            channel,
            pitch: validate_pitch(pitch)?,
            velocity: validate_data("velocity", velocity)?,
            pan: None,
            instrument: None,
            reverb: None,
        })
    }

    pub fn with_pan(mut self, pan: u8) -> Result<Self> {
        self.pan = Some(validate_data("pan", pan)?);
        Ok(self)
    }

    pub fn with_instrument(mut self, instrument: u8) -> Result<Self> {
        self.instrument = Some(validate_data("instrument", instrument)?);
        Ok(self)
    }

    pub fn with_reverb(mut self, reverb: u8) -> Result<Self> {
        self.reverb = Some(validate_data("reverb", reverb)?);
        Ok(self)
    }

    fn send_setup(&self, sink: &dyn MidiSink) {
        if let Some(program) = self.instrument {
            sink.program_change(self.channel, program);
        }
        if let Some(pan) = self.pan {
            sink.control_change(self.channel, CC_PAN, pan);
        }
        if let Some(reverb) = self.reverb {
            sink.control_change(self.channel, CC_REVERB, reverb);
        }
    }
}

/// Whether a [`NoteOnOff`] has already sounded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotePhase {
    /// Waiting to be sent.
    Armed,
    /// Note-on sent; the note-off has been handed to the dispatcher.
    Fired,
}

/// A note-on that schedules its own note-off `duration` beats later.
#[derive(Clone, Debug, PartialEq)]
pub struct NoteOnOff {
    pub note: Note,
    /// Length in beats.
    pub duration: f64,
    phase: NotePhase,
}

impl NoteOnOff {
    pub fn new(note: Note, duration: f64) -> Result<Self> {
        if !duration.is_finite() || duration < 0.0 {
            return Err(Error::invalid_argument(format!(
                "duration must be finite and non-negative, got {duration}"
            )));
        }
        Ok(Self {
            note,
            duration,
            phase: NotePhase::Armed,
        })
    }

    pub fn phase(&self) -> NotePhase {
        self.phase
    }

    /// Beat at which the note-off is due, given the note-on time.
    pub fn end(&self, start: f64) -> f64 {
        start + self.duration
    }
}

type CallbackFn = dyn Fn(&mut DispatchContext<'_>) + Send + Sync;

/// User code run on the dispatch thread at the scheduled beat.
///
/// The closure receives the [`DispatchContext`], through which it can read
/// the frozen beat time, schedule follow-ups and edit the queue.
#[derive(Clone)]
pub struct Callback(Arc<CallbackFn>);

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut DispatchContext<'_>) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    fn call(&self, ctx: &mut DispatchContext<'_>) {
        (self.0)(ctx)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback(..)")
    }
}

/// Message payloads.
#[derive(Clone, Debug)]
pub enum MessageKind {
    NoteOn(Note),
    NoteOff(Note),
    NoteOnOff(NoteOnOff),
    ControlChange { channel: Channel, control: u8, value: u8 },
    ProgramChange { channel: Channel, program: u8 },
    /// Signed bend, -8192..=8191.
    PitchBend { channel: Channel, value: i16 },
    /// 14-bit parameter number and value.
    Nrpn { channel: Channel, parameter: u16, value: u16 },
    SysEx(Vec<u8>),
    Callback(Callback),
}

impl MessageKind {
    /// Channel of any channel-voice payload.
    pub fn channel(&self) -> Option<Channel> {
        match self {
            MessageKind::NoteOn(n) | MessageKind::NoteOff(n) => Some(n.channel),
            MessageKind::NoteOnOff(n) => Some(n.note.channel),
            MessageKind::ControlChange { channel, .. }
            | MessageKind::ProgramChange { channel, .. }
            | MessageKind::PitchBend { channel, .. }
            | MessageKind::Nrpn { channel, .. } => Some(*channel),
            MessageKind::SysEx(_) | MessageKind::Callback(_) => None,
        }
    }

    fn channel_mut(&mut self) -> Option<&mut Channel> {
        match self {
            MessageKind::NoteOn(n) | MessageKind::NoteOff(n) => Some(&mut n.channel),
            MessageKind::NoteOnOff(n) => Some(&mut n.note.channel),
            MessageKind::ControlChange { channel, .. }
            | MessageKind::ProgramChange { channel, .. }
            | MessageKind::PitchBend { channel, .. }
            | MessageKind::Nrpn { channel, .. } => Some(channel),
            MessageKind::SysEx(_) | MessageKind::Callback(_) => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            MessageKind::NoteOn(_) => "note-on",
            MessageKind::NoteOff(_) => "note-off",
            MessageKind::NoteOnOff(_) => "note-on/off",
            MessageKind::ControlChange { .. } => "control-change",
            MessageKind::ProgramChange { .. } => "program-change",
            MessageKind::PitchBend { .. } => "pitch-bend",
            MessageKind::Nrpn { .. } => "nrpn",
            MessageKind::SysEx(_) => "sysex",
            MessageKind::Callback(_) => "callback",
        }
    }
}

/// A timestamped event waiting in (or popped from) a message queue.
#[derive(Debug)]
pub struct Message {
    id: MessageId,
    time: f64,
    tag: Option<String>,
    kind: MessageKind,
    live: bool,
}

impl Message {
    /// Create a message at `time` beats.
    pub fn new(time: f64, kind: MessageKind) -> Self {
        Self {
            id: MessageId::next(),
            time,
            tag: None,
            kind,
            live: true,
        }
    }

    pub fn note_on(time: f64, note: Note) -> Self {
        Self::new(time, MessageKind::NoteOn(note))
    }

    pub fn note_off(time: f64, note: Note) -> Self {
        Self::new(time, MessageKind::NoteOff(note))
    }

    /// A self-propagating note lasting `duration` beats.
    pub fn note_on_off(time: f64, note: Note, duration: f64) -> Result<Self> {
        Ok(Self::new(
            time,
            MessageKind::NoteOnOff(NoteOnOff::new(note, duration)?),
        ))
    }

    pub fn control_change(time: f64, channel: Channel, control: u8, value: u8) -> Result<Self> {
        Ok(Self::new(
            time,
            MessageKind::ControlChange {
                channel,
                control: validate_data("control", control)?,
                value: validate_data("control value", value)?,
            },
        ))
    }

    pub fn program_change(time: f64, channel: Channel, program: u8) -> Result<Self> {
        Ok(Self::new(
            time,
            MessageKind::ProgramChange {
                channel,
                program: validate_data("program", program)?,
            },
        ))
    }

    pub fn pitch_bend(time: f64, channel: Channel, value: i16) -> Result<Self> {
        if !(-8192..=8191).contains(&value) {
            return Err(Error::invalid_argument(format!(
                "pitch bend {value} is outside the range -8192..=8191"
            )));
        }
        Ok(Self::new(time, MessageKind::PitchBend { channel, value }))
    }

    pub fn nrpn(time: f64, channel: Channel, parameter: u16, value: u16) -> Result<Self> {
        if parameter > 0x3fff || value > 0x3fff {
            return Err(Error::invalid_argument(format!(
                "nrpn parameter {parameter} and value {value} must fit in 14 bits"
            )));
        }
        Ok(Self::new(
            time,
            MessageKind::Nrpn {
                channel,
                parameter,
                value,
            },
        ))
    }

    pub fn sysex(time: f64, data: impl Into<Vec<u8>>) -> Self {
        Self::new(time, MessageKind::SysEx(data.into()))
    }

    /// Run `f` on the dispatch thread at `time`.
    pub fn callback<F>(time: f64, f: F) -> Self
    where
        F: Fn(&mut DispatchContext<'_>) + Send + Sync + 'static,
    {
        Self::new(time, MessageKind::Callback(Callback::new(f)))
    }

    /// Attach an opaque user tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Scheduled time in beats.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut MessageKind {
        &mut self.kind
    }

    pub fn channel(&self) -> Option<Channel> {
        self.kind.channel()
    }

    pub(crate) fn set_channel(&mut self, channel: Channel) {
        if let Some(c) = self.kind.channel_mut() {
            *c = channel;
        }
    }

    /// Note data of any note variant.
    pub fn note(&self) -> Option<&Note> {
        match &self.kind {
            MessageKind::NoteOn(n) | MessageKind::NoteOff(n) => Some(n),
            MessageKind::NoteOnOff(n) => Some(&n.note),
            _ => None,
        }
    }

    /// The payload if this is a self-propagating note.
    pub fn note_on_off_ref(&self) -> Option<&NoteOnOff> {
        match &self.kind {
            MessageKind::NoteOnOff(n) => Some(n),
            _ => None,
        }
    }

    pub(crate) fn note_on_off_mut(&mut self) -> Option<&mut NoteOnOff> {
        match &mut self.kind {
            MessageKind::NoteOnOff(n) => Some(n),
            _ => None,
        }
    }

    /// Duration in beats, for self-propagating notes.
    pub fn duration(&self) -> Option<f64> {
        self.note_on_off_ref().map(|n| n.duration)
    }

    /// False once the message has been tombstoned by a bulk edit.
    pub fn is_live(&self) -> bool {
        self.live
    }

    pub(crate) fn tombstone(&mut self) {
        self.live = false;
    }

    /// A copy with a fresh identity, `delta` beats later.
    ///
    /// A self-propagating note is re-armed in the copy, so it sounds even if
    /// the original already fired.
    pub fn shifted_copy(&self, delta: f64) -> Message {
        let mut kind = self.kind.clone();
        if let MessageKind::NoteOnOff(n) = &mut kind {
            n.phase = NotePhase::Armed;
        }
        Message {
            id: MessageId::next(),
            time: self.time + delta,
            tag: self.tag.clone(),
            kind,
            live: true,
        }
    }

    /// Deliver the message to `sink`.
    ///
    /// Returns the follow-up message a self-propagating note produces; the
    /// caller is responsible for scheduling it.
    pub fn send_now(
        &mut self,
        sink: &dyn MidiSink,
        ctx: &mut DispatchContext<'_>,
    ) -> Option<Message> {
        match &mut self.kind {
            MessageKind::NoteOn(note) => {
                note.send_setup(sink);
                sink.note_on(note.channel, note.pitch, note.velocity);
            }
            MessageKind::NoteOff(note) => {
                sink.note_off(note.channel, note.pitch, note.velocity);
            }
            MessageKind::NoteOnOff(n) => {
                if n.phase == NotePhase::Fired {
                    return None;
                }
                n.note.send_setup(sink);
                sink.note_on(n.note.channel, n.note.pitch, n.note.velocity);
                n.phase = NotePhase::Fired;
                let mut off = Message::note_off(n.end(self.time), n.note.clone());
                off.tag = self.tag.clone();
                return Some(off);
            }
            MessageKind::ControlChange {
                channel,
                control,
                value,
            } => sink.control_change(*channel, *control, *value),
            MessageKind::ProgramChange { channel, program } => {
                sink.program_change(*channel, *program)
            }
            MessageKind::PitchBend { channel, value } => sink.pitch_bend(*channel, *value),
            MessageKind::Nrpn {
                channel,
                parameter,
                value,
            } => sink.nrpn(*channel, *parameter, *value),
            MessageKind::SysEx(data) => sink.sysex(data),
            MessageKind::Callback(callback) => callback.call(ctx),
        }
        None
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Message {}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {:.4}", self.kind.name(), self.time)?;
        if let Some(channel) = self.channel() {
            write!(f, " ({channel})")?;
        }
        Ok(())
    }
}

/// Validate a scheduled time.
pub(crate) fn ensure_time(time: f64) -> Result<()> {
    if time.is_finite() {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "message time must be finite, got {time}"
        )))
    }
}

/// Validate a note length bound.
pub(crate) fn ensure_duration(name: &str, duration: f64) -> Result<()> {
    ensure_positive(name, duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::DispatchContext;
    use crate::midi::{ChannelSink, MidiEvent};
    use crate::queue::MessageQueue;
    use std::sync::atomic::AtomicUsize;

    fn ch(index: u8) -> Channel {
        Channel::new(index).unwrap()
    }

    #[test]
    fn test_identity_equality() {
        let note = Note::new(ch(0), 60, 100).unwrap();
        let a = Message::note_on(1.0, note.clone());
        let b = Message::note_on(1.0, note);
        assert_ne!(a, b);
        assert_eq!(a, a);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_shifted_copy_has_new_identity() {
        let msg = Message::note_on_off(2.0, Note::new(ch(1), 64, 90).unwrap(), 0.5)
            .unwrap()
            .with_tag("lead");
        let copy = msg.shifted_copy(1.5);
        assert_ne!(copy, msg);
        assert!((copy.time() - 3.5).abs() < 1e-9);
        assert_eq!(copy.tag(), Some("lead"));
        assert_eq!(copy.duration(), Some(0.5));
        assert_eq!(copy.note().unwrap().pitch, 64);
    }

    #[test]
    fn test_constructor_validation() {
        assert!(Note::new(ch(0), 128, 100).is_err());
        assert!(Note::new(ch(0), 60, 128).is_err());
        assert!(Note::new(ch(0), 60, 100).unwrap().with_pan(200).is_err());
        let note = Note::new(ch(0), 60, 100).unwrap();
        assert!(Message::note_on_off(0.0, note.clone(), -1.0).is_err());
        assert!(Message::note_on_off(0.0, note, f64::NAN).is_err());
        assert!(Message::pitch_bend(0.0, ch(0), 8192).is_err());
        assert!(Message::pitch_bend(0.0, ch(0), -8192).is_ok());
        assert!(Message::nrpn(0.0, ch(0), 0x4000, 0).is_err());
        assert!(Message::control_change(0.0, ch(0), 7, 128).is_err());
    }

    #[test]
    fn test_note_on_off_fires_once_and_returns_note_off() {
        let (sink, rx) = ChannelSink::new();
        let mut queue = MessageQueue::new();
        let mut ctx = DispatchContext::new(1.0, 120.0, &mut queue);
        let note = Note::new(ch(1), 60, 100).unwrap().with_instrument(5).unwrap();
        let mut msg = Message::note_on_off(1.0, note, 2.0).unwrap().with_tag("t");

        let off = msg.send_now(&sink, &mut ctx).expect("follow-up note-off");
        assert!((off.time() - 3.0).abs() < 1e-9);
        assert_eq!(off.tag(), Some("t"));
        assert!(matches!(off.kind(), MessageKind::NoteOff(n) if n.pitch == 60));
        assert_eq!(msg.note_on_off_ref().unwrap().phase(), NotePhase::Fired);

        assert_eq!(
            rx.try_recv().unwrap(),
            MidiEvent::ProgramChange {
                channel: ch(1),
                program: 5
            }
        );
        assert!(matches!(rx.try_recv().unwrap(), MidiEvent::NoteOn { pitch: 60, .. }));

        // A fired note is inert.
        assert!(msg.send_now(&sink, &mut ctx).is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_shifted_copy_of_fired_note_sounds_again() {
        let (sink, rx) = ChannelSink::new();
        let mut queue = MessageQueue::new();
        let mut ctx = DispatchContext::new(0.0, 120.0, &mut queue);
        let mut msg = Message::note_on_off(0.0, Note::new(ch(2), 67, 80).unwrap(), 1.0).unwrap();
        assert!(msg.send_now(&sink, &mut ctx).is_some());

        let mut copy = msg.shifted_copy(4.0);
        assert_eq!(copy.note_on_off_ref().unwrap().phase(), NotePhase::Armed);
        assert_eq!(msg.note_on_off_ref().unwrap().phase(), NotePhase::Fired);
        let off = copy.send_now(&sink, &mut ctx).expect("copy fires");
        assert!((off.time() - 5.0).abs() < 1e-9);
        let note_ons = rx
            .try_iter()
            .filter(|e| matches!(e, MidiEvent::NoteOn { pitch: 67, .. }))
            .count();
        assert_eq!(note_ons, 2);
    }

    #[test]
    fn test_callback_receives_context() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let mut msg = Message::callback(4.0, move |ctx| {
            assert!((ctx.time() - 4.0).abs() < 1e-9);
            seen.fetch_add(1, Ordering::SeqCst);
            let _ = ctx.schedule(Message::sysex(5.0, vec![0xf0, 0xf7]));
        });
        let mut queue = MessageQueue::new();
        {
            let mut ctx = DispatchContext::new(4.0, 120.0, &mut queue);
            assert!(msg.send_now(&crate::midi::NullSink, &mut ctx).is_none());
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_display() {
        let msg = Message::control_change(1.5, ch(3), 7, 100).unwrap();
        assert_eq!(msg.to_string(), "control-change @ 1.5000 (channel 4)");
    }
}
