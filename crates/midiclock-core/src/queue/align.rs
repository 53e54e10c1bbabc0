//! Overlap resolution between sounding notes.
//!
//! Two notes on the same channel whose pitches are related (same pitch class
//! for [`MessageQueue::align`], fewer than three semitones apart for
//! [`MessageQueue::align_dissonants`]) must not sound at once. The earlier
//! note is cut where the later one starts, or silenced when both start
//! together.

use super::{MessageQueue, NoteFilter};
use crate::error::Result;
use crate::midi::{pitch_class_distance, Channel};

/// Start times closer than this count as simultaneous.
const SIMULTANEOUS: f64 = 1e-9;

/// Pitch classes closer than this count as dissonant.
const DISSONANT_DISTANCE: u8 = 3;

#[derive(Debug)]
struct Candidate {
    pos: usize,
    time: f64,
    duration: f64,
    channel: Channel,
    pitch: u8,
    velocity: u8,
    changed: bool,
}

impl Candidate {
    fn end(&self) -> f64 {
        self.time + self.duration
    }
}

impl MessageQueue {
    /// Resolve overlaps between notes of the same pitch class.
    pub fn align(&mut self, filter: &NoteFilter) -> Result<usize> {
        Ok(self.align_by(filter, |a, b| pitch_class_distance(a, b) == 0))
    }

    /// Resolve overlaps between notes whose pitch classes are within two
    /// semitones. A time window on `filter` limits the notes considered.
    pub fn align_dissonants(&mut self, filter: &NoteFilter) -> Result<usize> {
        Ok(self.align_by(filter, |a, b| {
            pitch_class_distance(a, b) < DISSONANT_DISTANCE
        }))
    }

    fn align_by<R>(&mut self, filter: &NoteFilter, related: R) -> usize
    where
        R: Fn(u8, u8) -> bool,
    {
        let mut candidates: Vec<Candidate> = self
            .iter()
            .enumerate()
            .filter(|(_, m)| filter.matches_melodic_note(m))
            .filter_map(|(pos, m)| {
                let n = m.note_on_off_ref()?;
                (n.note.velocity > 0).then(|| Candidate {
                    pos,
                    time: m.time(),
                    duration: n.duration,
                    channel: n.note.channel,
                    pitch: n.note.pitch,
                    velocity: n.note.velocity,
                    changed: false,
                })
            })
            .collect();

        // Stable: equal (time, duration) keep dispatch order.
        candidates.sort_by(|a, b| {
            a.time
                .total_cmp(&b.time)
                .then(a.duration.total_cmp(&b.duration))
        });

        for i in 0..candidates.len() {
            if candidates[i].velocity == 0 {
                continue;
            }
            for j in (i + 1)..candidates.len() {
                let (head, tail) = candidates.split_at_mut(j);
                let (a, b) = (&mut head[i], &tail[0]);
                if b.time >= a.end() {
                    break;
                }
                if b.velocity == 0 || b.channel != a.channel || !related(a.pitch, b.pitch) {
                    continue;
                }
                a.changed = true;
                if b.time - a.time <= SIMULTANEOUS {
                    a.velocity = 0;
                    break;
                }
                a.duration = b.time - a.time;
            }
        }

        let mut updates = vec![None; self.len()];
        let mut changed = 0;
        for c in candidates.iter().filter(|c| c.changed) {
            updates[c.pos] = Some((c.duration, c.velocity));
            changed += 1;
        }
        for (pos, message) in self.iter_mut().enumerate() {
            let Some((duration, velocity)) = updates[pos] else {
                continue;
            };
            if let Some(n) = message.note_on_off_mut() {
                n.duration = duration;
                n.note.velocity = velocity;
            }
        }
        log::trace!("aligned {changed} notes");
        changed
    }
}
