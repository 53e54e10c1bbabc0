//! The clock and its dispatch thread.
//!
//! A [`Clock`] owns a [`MessageQueue`] and, while running, one dispatch
//! thread that sleeps until the earliest pending slice is due, then sends
//! every message in it to the [`MidiSink`].
//!
//! # Locking
//!
//! Three locks guard the clock:
//!
//! - run state (running flag and join handle), only touched by the owner
//! - timing ([`BeatTimer`] and the frozen dispatch time)
//! - queue ([`MessageQueue`]), paired with a condition variable
//!
//! Locks are always taken in queue then timing order. The dispatch thread
//! holds the queue lock while sending, so code running on it must go through
//! the [`DispatchContext`] instead of the `Clock`. Clock methods that would
//! block on the queue lock return [`Error::InvalidState`] when called from
//! the dispatch thread.

use crate::config::ClockConfig;
use crate::error::{Error, Result};
use crate::message::{ensure_time, Message};
use crate::midi::{Channel, ChannelSet, MidiSink};
use crate::queue::{Interpolation, MessageQueue, NoteFilter};
use crate::timing::BeatTimer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

/// Lock a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hooks run on the dispatch thread around every send.
pub trait SendObserver: Send + Sync {
    /// Called before `message` is sent at beat `time`.
    fn before_send(&self, _message: &Message, _time: f64) {}

    /// Called after `message` was sent at beat `time`.
    fn after_send(&self, _message: &Message, _time: f64) {}
}

/// What a message sees while it is being sent.
///
/// The queue is already locked by the dispatcher; scheduling and editing
/// through the context is the only way to touch it from a callback.
pub struct DispatchContext<'a> {
    time: f64,
    bpm: f64,
    queue: &'a mut MessageQueue,
}

impl<'a> DispatchContext<'a> {
    pub(crate) fn new(time: f64, bpm: f64, queue: &'a mut MessageQueue) -> Self {
        Self { time, bpm, queue }
    }

    /// Scheduled beat of the slice being dispatched.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Queue a message for later dispatch.
    pub fn schedule(&mut self, message: Message) -> Result<()> {
        self.queue.add_message(message)
    }

    /// The pending messages, for edits from inside a callback.
    pub fn queue(&mut self) -> &mut MessageQueue {
        &mut *self.queue
    }
}

#[derive(Debug)]
struct Timing {
    timer: BeatTimer,
    /// Set while a slice is being sent.
    frozen: Option<f64>,
}

#[derive(Debug, Default)]
struct RunState {
    running: bool,
    handle: Option<JoinHandle<()>>,
}

/// State shared with the dispatch thread.
struct Shared {
    sink: Arc<dyn MidiSink>,
    queue: Mutex<MessageQueue>,
    wake: Condvar,
    timing: Mutex<Timing>,
    exit: AtomicBool,
    dispatch_thread: Mutex<Option<ThreadId>>,
    observers: RwLock<Vec<Arc<dyn SendObserver>>>,
}

impl Shared {
    fn on_dispatch_thread(&self) -> bool {
        *lock(&self.dispatch_thread) == Some(thread::current().id())
    }

    fn observers(&self) -> Vec<Arc<dyn SendObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wake the dispatcher.
    ///
    /// Taking the queue lock first means a dispatcher between its checks and
    /// its wait cannot miss the signal.
    fn notify(&self) {
        drop(lock(&self.queue));
        self.wake.notify_all();
    }
}

/// Rate-adjustable beat clock that dispatches scheduled messages.
pub struct Clock {
    shared: Arc<Shared>,
    run: Mutex<RunState>,
    interpolation: Interpolation,
}

impl Clock {
    /// Create a stopped clock at beat 0.
    pub fn new(bpm: f64, sink: Arc<dyn MidiSink>) -> Result<Self> {
        let timer = BeatTimer::new(bpm)?;
        Ok(Self {
            shared: Arc::new(Shared {
                sink,
                queue: Mutex::new(MessageQueue::new()),
                wake: Condvar::new(),
                timing: Mutex::new(Timing {
                    timer,
                    frozen: None,
                }),
                exit: AtomicBool::new(false),
                dispatch_thread: Mutex::new(None),
                observers: RwLock::new(Vec::new()),
            }),
            run: Mutex::new(RunState::default()),
            interpolation: Interpolation::default(),
        })
    }

    pub fn from_config(config: &ClockConfig, sink: Arc<dyn MidiSink>) -> Result<Self> {
        config.validate()?;
        let mut clock = Self::new(config.bpm, sink)?;
        clock.interpolation = config.interpolation;
        Ok(clock)
    }

    fn ensure_not_dispatching(&self, operation: &str) -> Result<()> {
        if self.shared.on_dispatch_thread() {
            return Err(Error::invalid_state(format!(
                "{operation} called from the dispatch thread"
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Timing
    // ========================================================================

    pub fn bpm(&self) -> f64 {
        lock(&self.shared.timing).timer.bpm()
    }

    /// Change tempo without moving the current beat position.
    pub fn set_bpm(&self, bpm: f64) -> Result<()> {
        lock(&self.shared.timing)
            .timer
            .set_bpm(bpm, Instant::now())?;
        log::debug!("tempo set to {bpm} BPM");
        if !self.shared.on_dispatch_thread() {
            self.shared.notify();
        }
        Ok(())
    }

    /// Current beat.
    ///
    /// On the dispatch thread this is the scheduled time of the slice being
    /// sent, not the wall-clock position.
    pub fn time(&self) -> f64 {
        let timing = lock(&self.shared.timing);
        if let Some(frozen) = timing.frozen {
            if self.shared.on_dispatch_thread() {
                return frozen;
            }
        }
        timing.timer.beat_at(Instant::now())
    }

    /// Always true on the dispatch thread.
    pub fn is_running(&self) -> bool {
        if self.shared.on_dispatch_thread() {
            return true;
        }
        lock(&self.run).running
    }

    // ========================================================================
    // Run state
    // ========================================================================

    /// Start the stopwatch and the dispatch thread.
    pub fn start(&self) -> Result<()> {
        self.ensure_not_dispatching("start")?;
        let mut run = lock(&self.run);
        if run.running {
            return Err(Error::invalid_state("clock is already running"));
        }

        self.shared.exit.store(false, Ordering::SeqCst);
        lock(&self.shared.timing).timer.start(Instant::now());

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("midiclock-dispatch".to_string())
            .spawn(move || dispatch_loop(&shared));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                lock(&self.shared.timing).timer.stop(Instant::now());
                return Err(err.into());
            }
        };

        run.running = true;
        run.handle = Some(handle);
        log::info!("clock started at beat {:.3}", self.time());
        Ok(())
    }

    /// Stop dispatching. Nothing is sent once this returns.
    pub fn stop(&self) -> Result<()> {
        self.ensure_not_dispatching("stop")?;
        let mut run = lock(&self.run);
        if !run.running {
            return Err(Error::invalid_state("clock is not running"));
        }

        self.shared.exit.store(true, Ordering::SeqCst);
        self.shared.notify();
        if let Some(handle) = run.handle.take() {
            if handle.join().is_err() {
                log::warn!("dispatch thread exited by panic");
            }
        }
        *lock(&self.shared.dispatch_thread) = None;

        let beat = {
            let mut timing = lock(&self.shared.timing);
            let now = Instant::now();
            timing.timer.stop(now);
            timing.frozen = None;
            timing.timer.beat_at(now)
        };
        run.running = false;
        log::info!("clock stopped at beat {beat:.3}");
        Ok(())
    }

    /// Rewind to beat 0 and discard every pending message.
    pub fn reset(&self) -> Result<()> {
        self.ensure_not_dispatching("reset")?;
        let run = lock(&self.run);
        if run.running {
            return Err(Error::invalid_state("cannot reset a running clock"));
        }
        let discarded = {
            let mut queue = lock(&self.shared.queue);
            let pending = queue.len();
            queue.clear();
            pending
        };
        let mut timing = lock(&self.shared.timing);
        timing.timer.reset(Instant::now());
        timing.frozen = None;
        log::info!("clock reset, {discarded} pending messages discarded");
        Ok(())
    }

    pub fn add_observer(&self, observer: Arc<dyn SendObserver>) {
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    // ========================================================================
    // Queue access
    // ========================================================================

    /// Queue a message and wake the dispatcher.
    pub fn schedule(&self, message: Message) -> Result<()> {
        self.with_queue_mut(|queue| queue.add_message(message))?
    }

    /// Queue a batch, each shifted by `delta` beats.
    ///
    /// Every time is checked before anything is inserted.
    pub fn schedule_all<I>(&self, messages: I, delta: f64) -> Result<usize>
    where
        I: IntoIterator<Item = Message>,
    {
        ensure_time(delta)?;
        let messages: Vec<Message> = messages
            .into_iter()
            .map(|mut message| {
                message.set_time(message.time() + delta);
                message
            })
            .collect();
        for message in &messages {
            ensure_time(message.time())?;
        }
        self.with_queue_mut(|queue| {
            let count = messages.len();
            for message in messages {
                queue.add_message(message)?;
            }
            Ok(count)
        })?
    }

    /// Number of messages waiting to be sent.
    pub fn pending_count(&self) -> Result<usize> {
        self.with_queue(MessageQueue::len)
    }

    /// Read the queue with a closure.
    pub fn with_queue<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&MessageQueue) -> R,
    {
        self.ensure_not_dispatching("queue read")?;
        let queue = lock(&self.shared.queue);
        Ok(f(&*queue))
    }

    /// Modify the queue with a closure, then wake the dispatcher.
    pub fn with_queue_mut<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut MessageQueue) -> R,
    {
        self.ensure_not_dispatching("queue edit")?;
        let result = {
            let mut queue = lock(&self.shared.queue);
            let result = f(&mut *queue);
            self.shared.wake.notify_all();
            result
        };
        Ok(result)
    }

    fn edit<F>(&self, name: &str, f: F) -> Result<usize>
    where
        F: FnOnce(&mut MessageQueue) -> Result<usize>,
    {
        let changed = self.with_queue_mut(f)??;
        log::trace!("{name}: {changed} messages affected");
        Ok(changed)
    }

    // ========================================================================
    // Bulk edits
    // ========================================================================

    pub fn align(&self, filter: &NoteFilter) -> Result<usize> {
        self.edit("align", |q| q.align(filter))
    }

    pub fn align_dissonants(&self, filter: &NoteFilter) -> Result<usize> {
        self.edit("align_dissonants", |q| q.align_dissonants(filter))
    }

    pub fn remove_identical_notes(&self, filter: &NoteFilter) -> Result<usize> {
        self.edit("remove_identical_notes", |q| q.remove_identical_notes(filter))
    }

    pub fn remove_identical_percussion_notes(&self, filter: &NoteFilter) -> Result<usize> {
        self.edit("remove_identical_percussion_notes", |q| {
            q.remove_identical_percussion_notes(filter)
        })
    }

    pub fn set_min_pitch(&self, filter: &NoteFilter, min: u8) -> Result<usize> {
        self.edit("set_min_pitch", |q| q.set_min_pitch(filter, min))
    }

    pub fn set_max_pitch(&self, filter: &NoteFilter, max: u8) -> Result<usize> {
        self.edit("set_max_pitch", |q| q.set_max_pitch(filter, max))
    }

    pub fn move_pitch_above<D, M>(
        &self,
        filter: &NoteFilter,
        bound: u8,
        delete_if: D,
        move_if: M,
    ) -> Result<usize>
    where
        D: Fn(&Message) -> bool,
        M: Fn(&Message) -> bool,
    {
        self.edit("move_pitch_above", |q| {
            q.move_pitch_above(filter, bound, delete_if, move_if)
        })
    }

    pub fn move_pitch_below<D, M>(
        &self,
        filter: &NoteFilter,
        bound: u8,
        delete_if: D,
        move_if: M,
    ) -> Result<usize>
    where
        D: Fn(&Message) -> bool,
        M: Fn(&Message) -> bool,
    {
        self.edit("move_pitch_below", |q| {
            q.move_pitch_below(filter, bound, delete_if, move_if)
        })
    }

    pub fn set_min_velocity(&self, filter: &NoteFilter, min: u8) -> Result<usize> {
        self.edit("set_min_velocity", |q| q.set_min_velocity(filter, min))
    }

    pub fn set_max_velocity(&self, filter: &NoteFilter, max: u8) -> Result<usize> {
        self.edit("set_max_velocity", |q| q.set_max_velocity(filter, max))
    }

    pub fn set_min_duration(&self, filter: &NoteFilter, min: f64) -> Result<usize> {
        self.edit("set_min_duration", |q| q.set_min_duration(filter, min))
    }

    pub fn set_max_duration(&self, filter: &NoteFilter, max: f64) -> Result<usize> {
        self.edit("set_max_duration", |q| q.set_max_duration(filter, max))
    }

    /// Remap velocities; `None` uses the curve from the clock's config.
    pub fn interpolate_velocity(
        &self,
        filter: &NoteFilter,
        new_min: u8,
        new_max: u8,
        method: Option<Interpolation>,
    ) -> Result<usize> {
        let method = method.unwrap_or(self.interpolation);
        self.edit("interpolate_velocity", |q| {
            q.interpolate_velocity(filter, new_min, new_max, method)
        })
    }

    pub fn to_precision(&self, filter: &NoteFilter, fraction: f64) -> Result<usize> {
        self.edit("to_precision", |q| q.to_precision(filter, fraction))
    }

    pub fn scale_duration_and_time(&self, filter: &NoteFilter, factor: f64) -> Result<usize> {
        self.edit("scale_duration_and_time", |q| {
            q.scale_duration_and_time(filter, factor)
        })
    }

    pub fn map_note_channels(&self, filter: &NoteFilter, target: Channel) -> Result<usize> {
        self.edit("map_note_channels", |q| q.map_note_channels(filter, target))
    }

    pub fn map_source_channels_to_target_channel(
        &self,
        sources: ChannelSet,
        target: Channel,
    ) -> Result<usize> {
        self.edit("map_source_channels_to_target_channel", |q| {
            q.map_source_channels_to_target_channel(sources, target)
        })
    }

    pub fn apply_melody(
        &self,
        filter: &NoteFilter,
        melody: &[u8],
        max_repeat: usize,
    ) -> Result<usize> {
        self.edit("apply_melody", |q| q.apply_melody(filter, melody, max_repeat))
    }

    pub fn remove_notes_longer_than(&self, filter: &NoteFilter, max: f64) -> Result<usize> {
        self.edit("remove_notes_longer_than", |q| {
            q.remove_notes_longer_than(filter, max)
        })
    }

    pub fn remove_notes_shorter_than(&self, filter: &NoteFilter, min: f64) -> Result<usize> {
        self.edit("remove_notes_shorter_than", |q| {
            q.remove_notes_shorter_than(filter, min)
        })
    }

    pub fn remove_notes_above(&self, filter: &NoteFilter, max: u8) -> Result<usize> {
        self.edit("remove_notes_above", |q| q.remove_notes_above(filter, max))
    }

    pub fn remove_notes_below(&self, filter: &NoteFilter, min: u8) -> Result<usize> {
        self.edit("remove_notes_below", |q| q.remove_notes_below(filter, min))
    }

    pub fn set_octave_above(&self, filter: &NoteFilter) -> Result<usize> {
        self.edit("set_octave_above", |q| q.set_octave_above(filter))
    }

    pub fn set_octave_below(&self, filter: &NoteFilter) -> Result<usize> {
        self.edit("set_octave_below", |q| q.set_octave_below(filter))
    }

    pub fn transpose(&self, filter: &NoteFilter, semitones: i8) -> Result<usize> {
        self.edit("transpose", |q| q.transpose(filter, semitones))
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        if self.shared.on_dispatch_thread() {
            // Cannot join ourselves; the loop exits after the current slice.
            self.shared.exit.store(true, Ordering::SeqCst);
            return;
        }
        let running = lock(&self.run).running;
        if running {
            let _ = self.stop();
        }
    }
}

fn dispatch_loop(shared: &Shared) {
    *lock(&shared.dispatch_thread) = Some(thread::current().id());
    let mut queue = lock(&shared.queue);

    while !shared.exit.load(Ordering::SeqCst) {
        let earliest = match queue.earliest_timestamp() {
            Ok(time) => time,
            Err(_) => {
                queue = shared
                    .wake
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }
        };

        let wait = lock(&shared.timing)
            .timer
            .duration_until(earliest, Instant::now());
        if !wait.is_zero() {
            queue = match shared.wake.wait_timeout(queue, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
            continue;
        }

        queue.cleanup();
        // The due slice may have been emptied by an edit.
        if queue.earliest_timestamp().ok() != Some(earliest) {
            continue;
        }
        let slice = match queue.pop_earliest() {
            Ok(slice) => slice,
            Err(_) => continue,
        };

        let time = slice.time();
        let bpm = {
            let mut timing = lock(&shared.timing);
            timing.frozen = Some(time);
            timing.timer.bpm()
        };
        let observers = shared.observers();
        log::trace!("dispatching {} messages at beat {time:.4}", slice.len());

        for mut message in slice.into_messages() {
            for observer in &observers {
                observer.before_send(&message, time);
            }
            let follow_up = {
                let mut ctx = DispatchContext::new(time, bpm, &mut *queue);
                message.send_now(shared.sink.as_ref(), &mut ctx)
            };
            if let Some(next) = follow_up {
                if let Err(err) = queue.add_message(next) {
                    log::warn!("dropping follow-up of {message}: {err}");
                }
            }
            for observer in &observers {
                observer.after_send(&message, time);
            }
        }

        lock(&shared.timing).frozen = None;
    }

    *lock(&shared.dispatch_thread) = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Note;
    use crate::midi::{ChannelSink, MidiEvent};
    use crossbeam_channel::{unbounded, RecvTimeoutError};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Weak;
    use std::time::Duration;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn ch(index: u8) -> Channel {
        Channel::new(index).unwrap()
    }

    fn sysex(time: f64) -> Message {
        Message::sysex(time, vec![0xf0, 0x7d, 0xf7])
    }

    fn channel_clock(bpm: f64) -> (Arc<Clock>, crossbeam_channel::Receiver<MidiEvent>) {
        let (sink, rx) = ChannelSink::new();
        (Arc::new(Clock::new(bpm, Arc::new(sink)).unwrap()), rx)
    }

    #[test]
    fn test_new_clock_is_stopped_at_zero() {
        let (clock, _rx) = channel_clock(120.0);
        assert_eq!(clock.time(), 0.0);
        assert!(!clock.is_running());
        assert_eq!(clock.bpm(), 120.0);
        assert_eq!(clock.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_rejects_invalid_bpm() {
        let sink: Arc<dyn MidiSink> = Arc::new(crate::midi::NullSink);
        assert!(matches!(
            Clock::new(0.0, sink.clone()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(Clock::new(f64::NAN, sink.clone()).is_err());
        let clock = Clock::new(100.0, sink).unwrap();
        assert!(clock.set_bpm(-5.0).is_err());
        assert_eq!(clock.bpm(), 100.0);
    }

    #[test]
    fn test_from_config() {
        let config = ClockConfig {
            bpm: 90.0,
            interpolation: Interpolation::Power(2.0),
        };
        let clock = Clock::from_config(&config, Arc::new(crate::midi::NullSink)).unwrap();
        assert_eq!(clock.bpm(), 90.0);
        assert_eq!(clock.interpolation, Interpolation::Power(2.0));
    }

    #[test]
    fn test_run_state_errors() {
        init();
        let (clock, _rx) = channel_clock(120.0);
        assert!(matches!(clock.stop(), Err(Error::InvalidState(_))));
        clock.start().unwrap();
        assert!(clock.is_running());
        assert!(matches!(clock.start(), Err(Error::InvalidState(_))));
        assert!(matches!(clock.reset(), Err(Error::InvalidState(_))));
        clock.stop().unwrap();
        assert!(!clock.is_running());
        assert!(clock.reset().is_ok());
    }

    #[test]
    fn test_bpm_change_keeps_position() {
        let (clock, _rx) = channel_clock(120.0);
        clock.set_bpm(60.0).unwrap();
        assert_eq!(clock.time(), 0.0);

        clock.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        clock.stop().unwrap();
        let before = clock.time();
        assert!(before > 0.0);
        clock.set_bpm(240.0).unwrap();
        assert!((clock.time() - before).abs() < 1e-9);
    }

    #[test]
    fn test_bpm_change_while_running_is_continuous() {
        let (clock, _rx) = channel_clock(120.0);
        clock.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        let before = clock.time();
        clock.set_bpm(30.0).unwrap();
        let after = clock.time();
        clock.stop().unwrap();
        assert!(after >= before);
        assert!(after - before < 0.05);
    }

    #[test]
    fn test_note_on_off_end_to_end() {
        init();
        let (clock, rx) = channel_clock(120.0);
        let note = Note::new(ch(0), 60, 100).unwrap();
        clock
            .schedule(Message::note_on_off(0.0, note, 1.0).unwrap())
            .unwrap();
        clock.start().unwrap();

        let on = rx.recv_timeout(Duration::from_millis(200)).unwrap();
        assert!(matches!(on, MidiEvent::NoteOn { pitch: 60, velocity: 100, .. }));

        thread::sleep(Duration::from_millis(250));
        let time = clock.time();
        assert!((time - 0.5).abs() < 0.15, "time was {time}");
        assert!(rx.try_recv().is_err());

        let off = rx.recv_timeout(Duration::from_millis(1000)).unwrap();
        assert!(matches!(off, MidiEvent::NoteOff { pitch: 60, .. }));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        clock.stop().unwrap();
        assert_eq!(clock.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_slices_dispatch_in_time_order() {
        let (clock, _rx) = channel_clock(600.0);
        let (tx, seen) = unbounded();
        for time in [0.3, 0.1, 0.2, 0.1] {
            let tx = tx.clone();
            clock
                .schedule(Message::callback(time, move |ctx| {
                    let _ = tx.send(ctx.time());
                }))
                .unwrap();
        }
        clock.start().unwrap();
        let times: Vec<f64> = (0..4)
            .map(|_| seen.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        clock.stop().unwrap();
        assert_eq!(times, vec![0.1, 0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_dispatch_thread_view_of_the_clock() {
        init();
        let (clock, _rx) = channel_clock(600.0);
        let (tx, seen) = unbounded();
        let weak: Weak<Clock> = Arc::downgrade(&clock);
        clock
            .schedule(Message::callback(0.05, move |_ctx| {
                let Some(clock) = weak.upgrade() else { return };
                let _ = tx.send((
                    clock.time(),
                    clock.is_running(),
                    matches!(clock.schedule(sysex(1.0)), Err(Error::InvalidState(_))),
                    matches!(clock.start(), Err(Error::InvalidState(_))),
                    matches!(clock.stop(), Err(Error::InvalidState(_))),
                    clock.pending_count().is_err(),
                ));
            }))
            .unwrap();
        clock.start().unwrap();
        let (time, running, schedule_err, start_err, stop_err, read_err) =
            seen.recv_timeout(Duration::from_secs(1)).unwrap();
        clock.stop().unwrap();

        assert_eq!(time, 0.05);
        assert!(running);
        assert!(schedule_err && start_err && stop_err && read_err);
    }

    #[test]
    fn test_callback_schedules_and_edits_through_context() {
        let (clock, rx) = channel_clock(600.0);
        clock
            .schedule(Message::callback(0.0, |ctx| {
                let next = ctx.time() + 0.1;
                let _ = ctx.schedule(Message::sysex(next, vec![0xf0, 0x01, 0xf7]));
                let _ = ctx.queue().remove_notes_above(&NoteFilter::all(), 64);
            }))
            .unwrap();
        for pitch in [72, 48] {
            let note = Note::new(ch(0), pitch, 90).unwrap();
            clock
                .schedule(Message::note_on_off(0.2, note, 0.1).unwrap())
                .unwrap();
        }
        clock.start().unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.recv_timeout(Duration::from_millis(300)) {
            events.push(event);
        }
        clock.stop().unwrap();

        assert_eq!(events[0], MidiEvent::SysEx(vec![0xf0, 0x01, 0xf7]));
        let pitches: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                MidiEvent::NoteOn { pitch, .. } => Some(*pitch),
                _ => None,
            })
            .collect();
        assert_eq!(pitches, vec![48]);
    }

    #[test]
    fn test_start_stop_start_stop() {
        let (clock, rx) = channel_clock(120.0);
        clock.schedule(sysex(1.0)).unwrap();
        clock.start().unwrap();
        clock.stop().unwrap();
        clock.start().unwrap();
        clock.stop().unwrap();
        assert!(!clock.is_running());

        thread::sleep(Duration::from_millis(600));
        assert!(rx.try_recv().is_err());
        assert_eq!(clock.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_bpm_raise_wakes_sleeping_dispatcher() {
        init();
        let (clock, rx) = channel_clock(30.0);
        // Four seconds away at the starting tempo.
        clock.schedule(sysex(2.0)).unwrap();
        clock.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());

        clock.set_bpm(6000.0).unwrap();
        let event = rx.recv_timeout(Duration::from_millis(300));
        clock.stop().unwrap();
        assert!(matches!(event, Ok(MidiEvent::SysEx(_))));
    }

    #[test]
    fn test_earlier_message_wakes_sleeping_dispatcher() {
        let (clock, rx) = channel_clock(120.0);
        clock
            .schedule(Message::sysex(10.0, vec![0xf0, 0x0a, 0xf7]))
            .unwrap();
        clock.start().unwrap();
        thread::sleep(Duration::from_millis(50));

        clock
            .schedule(Message::sysex(0.0, vec![0xf0, 0x00, 0xf7]))
            .unwrap();
        let event = rx.recv_timeout(Duration::from_millis(300));
        clock.stop().unwrap();
        assert_eq!(event, Ok(MidiEvent::SysEx(vec![0xf0, 0x00, 0xf7])));
        assert_eq!(clock.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_far_future_message_does_not_stall_dispatch() {
        init();
        let (clock, rx) = channel_clock(120.0);
        clock.schedule(sysex(1e20)).unwrap();
        clock.start().unwrap();
        thread::sleep(Duration::from_millis(50));

        clock
            .schedule(Message::sysex(0.0, vec![0xf0, 0x00, 0xf7]))
            .unwrap();
        let event = rx.recv_timeout(Duration::from_millis(500));
        assert!(clock.is_running());
        clock.stop().unwrap();
        assert_eq!(event, Ok(MidiEvent::SysEx(vec![0xf0, 0x00, 0xf7])));
        assert_eq!(clock.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_reset_rewinds_and_clears() {
        let (clock, _rx) = channel_clock(120.0);
        clock.schedule(sysex(50.0)).unwrap();
        clock.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        clock.stop().unwrap();
        assert!(clock.time() > 0.0);

        clock.reset().unwrap();
        assert_eq!(clock.time(), 0.0);
        assert_eq!(clock.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_schedule_validation_and_batches() {
        let (clock, _rx) = channel_clock(120.0);
        assert!(matches!(
            clock.schedule(sysex(f64::NAN)),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(clock.schedule_all(vec![sysex(0.0), sysex(1.0)], 2.0).unwrap(), 2);
        let times: Vec<f64> = clock
            .with_queue(|q| q.iter().map(Message::time).collect())
            .unwrap();
        assert_eq!(times, vec![2.0, 3.0]);

        // A bad entry rejects the whole batch.
        assert!(clock
            .schedule_all(vec![sysex(0.0), sysex(f64::INFINITY)], 0.0)
            .is_err());
        assert_eq!(clock.pending_count().unwrap(), 2);
    }

    #[test]
    fn test_edit_pass_through() {
        let (clock, _rx) = channel_clock(120.0);
        let note = Note::new(ch(0), 84, 100).unwrap();
        clock
            .schedule(Message::note_on_off(1.0, note, 1.0).unwrap())
            .unwrap();
        assert_eq!(clock.set_max_pitch(&NoteFilter::all(), 72).unwrap(), 1);
        assert_eq!(
            clock
                .interpolate_velocity(&NoteFilter::all(), 0, 64, None)
                .unwrap(),
            1
        );
        let (pitch, velocity) = clock
            .with_queue(|q| {
                let note = q.iter().next().and_then(Message::note).cloned().unwrap();
                (note.pitch, note.velocity)
            })
            .unwrap();
        assert_eq!(pitch, 72);
        assert_eq!(velocity, 50);
        assert!(clock.set_max_pitch(&NoteFilter::all(), 200).is_err());
    }

    #[derive(Default)]
    struct Counter {
        before: AtomicUsize,
        after: AtomicUsize,
    }

    impl SendObserver for Counter {
        fn before_send(&self, _message: &Message, _time: f64) {
            self.before.fetch_add(1, Ordering::SeqCst);
        }

        fn after_send(&self, _message: &Message, _time: f64) {
            self.after.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_observers_wrap_every_send() {
        let (clock, rx) = channel_clock(600.0);
        let counter = Arc::new(Counter::default());
        clock.add_observer(counter.clone());
        clock.schedule(sysex(0.0)).unwrap();
        clock.schedule(sysex(0.0)).unwrap();
        clock.start().unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        clock.stop().unwrap();
        assert_eq!(counter.before.load(Ordering::SeqCst), 2);
        assert_eq!(counter.after.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dropping_running_clock_stops_it() {
        let (sink, rx) = ChannelSink::new();
        let clock = Clock::new(120.0, Arc::new(sink)).unwrap();
        clock.start().unwrap();
        drop(clock);
        // Sink dropped with the joined dispatch thread.
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)),
            Err(RecvTimeoutError::Disconnected)
        );
    }
}
