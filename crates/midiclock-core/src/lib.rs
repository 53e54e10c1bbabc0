//! Midiclock Core - real-time MIDI event scheduling.
//!
//! This crate provides a beat clock that delivers timestamped MIDI messages
//! to a sink while other threads keep editing what is still pending:
//!
//! - **Clock** - Rate-adjustable beat clock with a dispatch thread
//! - **Queue** - Time-bucketed message queue and its bulk edits
//! - **Message** - Note, controller, system exclusive and callback events
//! - **Timing** - Stopwatch and tempo-change arithmetic
//! - **MIDI** - Channel and pitch types, the sink interface, bundled sinks
//! - **Config** - TOML clock configuration
//!
//! # Architecture
//!
//! Callers push [`Message`]s into a [`Clock`], which keeps them in a
//! [`MessageQueue`]. The clock's dispatch thread pops each due
//! [`TimeSlice`] and calls [`Message::send_now`] on every message in it.
//! Self-propagating notes ([`NoteOnOff`]) hand back their note-off, which
//! goes straight back into the queue.
//!
//! ```no_run
//! use midiclock_core::{Channel, ChannelSink, Clock, Message, Note};
//! use std::sync::Arc;
//!
//! # fn main() -> midiclock_core::Result<()> {
//! let (sink, events) = ChannelSink::new();
//! let clock = Clock::new(120.0, Arc::new(sink))?;
//! let note = Note::new(Channel::new(0)?, 60, 100)?;
//! clock.schedule(Message::note_on_off(0.0, note, 1.0)?)?;
//! clock.start()?;
//! let first = events.recv();
//! clock.stop()?;
//! # let _ = first;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod midi;
pub mod queue;
pub mod timing;

// Re-export main types for convenience
pub use clock::{Clock, DispatchContext, SendObserver};
pub use config::{ClockConfig, DEFAULT_BPM};
pub use error::{Error, Result};
pub use message::{Callback, Message, MessageId, MessageKind, Note, NoteOnOff, NotePhase};
pub use midi::{Channel, ChannelSet, ChannelSink, MidiEvent, MidiSink, NullSink};
pub use queue::{Interpolation, MessageQueue, NoteFilter, TimeSlice};
pub use timing::{BeatTimer, Stopwatch};
