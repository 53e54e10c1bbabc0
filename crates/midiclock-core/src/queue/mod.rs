//! Time-ordered message queue.
//!
//! Messages are grouped into [`TimeSlice`]s, one per exact beat time. Slices
//! are kept strictly ascending and, after [`MessageQueue::cleanup`], never
//! empty. Within a slice messages keep their insertion order.
//!
//! The bulk edits live in submodules:
//!
//! - [`filter`] - [`NoteFilter`], the shared channel/pitch/window selector
//! - `edits` - clamps, transpositions, removals, remapping, quantization
//! - `align` - overlap resolution between notes of related pitch

mod align;
mod edits;
pub mod filter;

pub use edits::Interpolation;
pub use filter::NoteFilter;

use crate::error::{Error, Result};
use crate::message::{ensure_time, Message};
use std::collections::VecDeque;

/// All messages sharing one scheduled beat time.
#[derive(Debug)]
pub struct TimeSlice {
    time: f64,
    messages: Vec<Message>,
}

impl TimeSlice {
    fn new(message: Message) -> Self {
        Self {
            time: message.time(),
            messages: vec![message],
        }
    }

    /// Beat time shared by every message in the slice.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

/// Pending messages bucketed by exact time.
#[derive(Debug, Default)]
pub struct MessageQueue {
    slices: VecDeque<TimeSlice>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message.
    ///
    /// Scheduling is usually close to monotonic, so the search starts from
    /// the tail.
    pub fn add_message(&mut self, message: Message) -> Result<()> {
        ensure_time(message.time())?;
        let time = message.time();

        let Some(last) = self.slices.back_mut() else {
            self.slices.push_back(TimeSlice::new(message));
            return Ok(());
        };
        if time > last.time {
            self.slices.push_back(TimeSlice::new(message));
            return Ok(());
        }

        for i in (0..self.slices.len()).rev() {
            let slice_time = self.slices[i].time;
            if slice_time == time {
                self.slices[i].messages.push(message);
                return Ok(());
            }
            if slice_time < time {
                self.slices.insert(i + 1, TimeSlice::new(message));
                return Ok(());
            }
        }
        self.slices.push_front(TimeSlice::new(message));
        Ok(())
    }

    /// Time of the first slice.
    pub fn earliest_timestamp(&self) -> Result<f64> {
        self.slices
            .front()
            .map(|slice| slice.time)
            .ok_or(Error::EmptyQueue)
    }

    /// Remove and return the first slice.
    pub fn pop_earliest(&mut self) -> Result<TimeSlice> {
        self.slices.pop_front().ok_or(Error::EmptyQueue)
    }

    /// Drop tombstoned messages and prune emptied slices.
    ///
    /// Returns the number of messages removed.
    pub fn cleanup(&mut self) -> usize {
        let mut removed = 0;
        for slice in self.slices.iter_mut() {
            let before = slice.messages.len();
            slice.messages.retain(Message::is_live);
            removed += before - slice.messages.len();
        }
        self.slices.retain(|slice| !slice.messages.is_empty());
        removed
    }

    /// Number of pending messages.
    pub fn len(&self) -> usize {
        self.slices.iter().map(TimeSlice::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.slices.len()
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.slices.clear();
    }

    pub fn slices(&self) -> impl Iterator<Item = &TimeSlice> {
        self.slices.iter()
    }

    /// All messages in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.slices.iter().flat_map(|slice| slice.messages.iter())
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Message> {
        self.slices
            .iter_mut()
            .flat_map(|slice| slice.messages.iter_mut())
    }

    /// Rebuild the slices after message times were changed in place.
    ///
    /// The sort is stable, so messages landing on the same time keep their
    /// previous dispatch order.
    pub(crate) fn rebucket(&mut self) {
        let mut messages: Vec<Message> = self
            .slices
            .drain(..)
            .flat_map(TimeSlice::into_messages)
            .collect();
        messages.sort_by(|a, b| a.time().total_cmp(&b.time()));

        for message in messages {
            match self.slices.back_mut() {
                Some(last) if last.time == message.time() => last.messages.push(message),
                _ => self.slices.push_back(TimeSlice::new(message)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageId;

    fn sysex(time: f64) -> Message {
        Message::sysex(time, vec![0xf0, 0xf7])
    }

    #[test]
    fn test_pop_in_ascending_order() {
        let mut queue = MessageQueue::new();
        for time in [3.0, 0.5, 7.25, 1.0, 2.0, 0.0, 5.5] {
            queue.add_message(sysex(time)).unwrap();
        }
        let mut popped = Vec::new();
        while let Ok(slice) = queue.pop_earliest() {
            popped.push(slice.time());
        }
        assert_eq!(popped, vec![0.0, 0.5, 1.0, 2.0, 3.0, 5.5, 7.25]);
    }

    #[test]
    fn test_equal_times_share_a_slice_in_insertion_order() {
        let mut queue = MessageQueue::new();
        let a = sysex(1.0);
        let b = sysex(1.0);
        let c = sysex(0.5);
        let d = sysex(1.0);
        let ids: Vec<MessageId> = vec![a.id(), b.id(), d.id()];
        queue.add_message(a).unwrap();
        queue.add_message(b).unwrap();
        queue.add_message(c).unwrap();
        queue.add_message(d).unwrap();

        assert_eq!(queue.bucket_count(), 2);
        assert_eq!(queue.pop_earliest().unwrap().len(), 1);
        let slice = queue.pop_earliest().unwrap();
        let popped: Vec<MessageId> = slice.messages().iter().map(Message::id).collect();
        assert_eq!(popped, ids);
    }

    #[test]
    fn test_backward_insert_positions() {
        let mut queue = MessageQueue::new();
        queue.add_message(sysex(2.0)).unwrap();
        queue.add_message(sysex(4.0)).unwrap();
        queue.add_message(sysex(3.0)).unwrap();
        queue.add_message(sysex(1.0)).unwrap();
        queue.add_message(sysex(4.0)).unwrap();
        let times: Vec<f64> = queue.slices().map(TimeSlice::time).collect();
        assert_eq!(times, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.earliest_timestamp().unwrap(), 1.0);
    }

    #[test]
    fn test_empty_queue_errors() {
        let mut queue = MessageQueue::new();
        assert!(matches!(queue.earliest_timestamp(), Err(Error::EmptyQueue)));
        assert!(matches!(queue.pop_earliest(), Err(Error::EmptyQueue)));
    }

    #[test]
    fn test_rejects_non_finite_time() {
        let mut queue = MessageQueue::new();
        assert!(matches!(
            queue.add_message(sysex(f64::NAN)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(queue.add_message(sysex(f64::INFINITY)).is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_negative_time_is_a_regular_time() {
        let mut queue = MessageQueue::new();
        queue.add_message(sysex(1.0)).unwrap();
        queue.add_message(sysex(-2.0)).unwrap();
        assert_eq!(queue.cleanup(), 0);
        assert_eq!(queue.earliest_timestamp().unwrap(), -2.0);
    }

    #[test]
    fn test_cleanup_prunes_tombstones_and_empty_slices() {
        let mut queue = MessageQueue::new();
        queue.add_message(sysex(1.0)).unwrap();
        queue.add_message(sysex(2.0)).unwrap();
        queue.add_message(sysex(2.0)).unwrap();
        for message in queue.iter_mut() {
            if message.time() == 1.0 {
                message.tombstone();
            }
        }
        if let Some(first_at_two) = queue.iter_mut().find(|m| m.time() == 2.0) {
            first_at_two.tombstone();
        }

        assert_eq!(queue.cleanup(), 2);
        assert_eq!(queue.bucket_count(), 1);
        assert_eq!(queue.earliest_timestamp().unwrap(), 2.0);
        assert!(queue.iter().all(Message::is_live));
    }

    #[test]
    fn test_rebucket_after_time_changes() {
        let mut queue = MessageQueue::new();
        let late = sysex(3.0);
        let late_id = late.id();
        queue.add_message(sysex(1.0)).unwrap();
        queue.add_message(sysex(2.0)).unwrap();
        queue.add_message(late).unwrap();
        for message in queue.iter_mut() {
            if message.id() == late_id {
                message.set_time(1.0);
            }
        }
        queue.rebucket();
        let slices: Vec<(f64, usize)> = queue.slices().map(|s| (s.time(), s.len())).collect();
        assert_eq!(slices, vec![(1.0, 2), (2.0, 1)]);
        // Earlier occupant stays first.
        let first = queue.pop_earliest().unwrap();
        assert_eq!(first.messages()[1].id(), late_id);
    }
}
