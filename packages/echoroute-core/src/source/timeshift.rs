//! Per-path arrival ring with delay and timeshift playback.
//!
//! Chunks are stored with their arrival time; the play head releases an
//! entry once `arrival + delay + backshift <= now`. The ring retains five
//! minutes of the past so the cursor can be repositioned into it, and only
//! ages entries out when the user has not repositioned recently.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::protocol::StreamFormat;
use crate::protocol_constants::TIMESHIFT_RETENTION_SECS;

/// One buffered chunk.
#[derive(Debug, Clone)]
struct Entry {
    arrival: Instant,
    format: StreamFormat,
    payload: Bytes,
}

/// Bounded ring of `(arrival, chunk)` with a playback cursor.
#[derive(Debug)]
pub struct TimeshiftBuffer {
    entries: VecDeque<Entry>,
    /// Index of the next entry to play.
    cursor: usize,
    delay: Duration,
    backshift: Duration,
    /// When the user last moved the cursor; eviction pauses for the
    /// retention window after a reposition.
    last_reposition: Option<Instant>,
}

impl TimeshiftBuffer {
    pub fn new(delay_ms: u32, backshift_sec: f32) -> Self {
        Self {
            entries: VecDeque::new(),
            cursor: 0,
            delay: Duration::from_millis(u64::from(delay_ms)),
            backshift: Duration::from_secs_f64(f64::from(backshift_sec.max(0.0))),
            last_reposition: None,
        }
    }

    /// Number of buffered entries (played and unplayed).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current playout offset applied on top of arrival times.
    fn playout_offset(&self) -> Duration {
        self.delay + self.backshift
    }

    /// Appends a chunk and ages out entries past retention.
    pub fn push(&mut self, now: Instant, format: StreamFormat, payload: Bytes) {
        self.entries.push_back(Entry {
            arrival: now,
            format,
            payload,
        });
        self.evict(now);
    }

    /// Releases the cursor entry if it is due.
    pub fn next_due(&mut self, now: Instant) -> Option<(StreamFormat, Bytes)> {
        let entry = self.entries.get(self.cursor)?;
        if entry.arrival + self.playout_offset() <= now {
            let result = (entry.format, entry.payload.clone());
            self.cursor += 1;
            Some(result)
        } else {
            None
        }
    }

    /// Time until the cursor entry becomes due, or `None` when nothing is
    /// waiting.
    pub fn time_until_due(&self, now: Instant) -> Option<Duration> {
        let entry = self.entries.get(self.cursor)?;
        Some((entry.arrival + self.playout_offset()).saturating_duration_since(now))
    }

    /// Updates the fixed playout delay.
    pub fn set_delay(&mut self, delay_ms: u32) {
        self.delay = Duration::from_millis(u64::from(delay_ms));
    }

    /// Current backshift in seconds.
    pub fn backshift_sec(&self) -> f32 {
        self.backshift.as_secs_f32()
    }

    /// Atomically repositions the cursor to the entry nearest the requested
    /// backshift, then re-derives the backshift from that entry so the play
    /// head lands exactly on a chunk boundary.
    pub fn reposition(&mut self, now: Instant, target_backshift_sec: f32) {
        self.last_reposition = Some(now);

        let target = Duration::from_secs_f64(f64::from(
            target_backshift_sec.clamp(0.0, TIMESHIFT_RETENTION_SECS as f32),
        ));
        if self.entries.is_empty() {
            self.backshift = target;
            self.cursor = 0;
            return;
        }

        // The entry that would play right now satisfies
        // arrival = now - delay - backshift.
        let Some(target_arrival) = now.checked_sub(self.delay + target) else {
            self.backshift = target;
            self.cursor = 0;
            return;
        };

        let mut best_index = 0;
        let mut best_distance = Duration::MAX;
        for (index, entry) in self.entries.iter().enumerate() {
            let distance = if entry.arrival >= target_arrival {
                entry.arrival - target_arrival
            } else {
                target_arrival - entry.arrival
            };
            if distance < best_distance {
                best_distance = distance;
                best_index = index;
            }
        }

        self.cursor = best_index;
        let arrival = self.entries[best_index].arrival;
        self.backshift = now
            .saturating_duration_since(arrival)
            .saturating_sub(self.delay);
    }

    /// Ages out entries whose playout time left the retention window,
    /// unless the user repositioned within the window.
    fn evict(&mut self, now: Instant) {
        if let Some(repositioned) = self.last_reposition {
            if now.saturating_duration_since(repositioned)
                < Duration::from_secs(TIMESHIFT_RETENTION_SECS)
            {
                return;
            }
        }
        let retention = Duration::from_secs(TIMESHIFT_RETENTION_SECS);
        let horizon = self.playout_offset() + retention;
        while let Some(front) = self.entries.front() {
            if front.arrival + horizon < now {
                self.entries.pop_front();
                self.cursor = self.cursor.saturating_sub(1);
            } else {
                break;
            }
        }
    }
}
