//! Gapless scheduling of response audio against the output clock.
//!
//! The scheduler is pure bookkeeping: it decides *when* each buffer starts and
//! tracks which buffers are still pending. The device that actually renders
//! them implements [`AudioOutput`].

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Identifies one scheduled buffer for its whole lifetime
pub type BufferId = u64;

/// Monotonic position of the output device, in seconds of rendered audio
pub trait PlaybackClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Device-side half of playback: a clock plus "play these samples at time t".
pub trait AudioOutput: Send {
    fn clock(&self) -> Arc<dyn PlaybackClock>;

    /// Queue `samples` (mono, at the output sample rate) to start at `start_at`.
    /// The device reports [`PlaybackEvent::Finished`] once the last sample played.
    fn play_at(&mut self, id: BufferId, samples: Vec<f32>, start_at: f64);

    /// Silence a buffer immediately, whether or not it started
    fn stop(&mut self, id: BufferId);

    /// Stop rendering and release the device. Must be safe to call twice.
    fn close(&mut self);
}

/// Completion notifications sent from the output device to the session loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    Finished(BufferId),
}

/// Placement decided for one buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start_at: f64,
    pub duration: f64,
}

impl ScheduledBuffer {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

pub struct PlaybackScheduler {
    next_start_time: f64,
    pending: BTreeMap<BufferId, ScheduledBuffer>,
    next_id: BufferId,
    published: watch::Sender<f64>,
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        let (published, _) = watch::channel(0.0);
        Self {
            next_start_time: 0.0,
            pending: BTreeMap::new(),
            next_id: 0,
            published,
        }
    }

    /// Receiver that always holds the current `next_start_time`. The capture
    /// pipeline compares it with the output clock to tell whether the model
    /// is still audible.
    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.published.subscribe()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Place a buffer of `duration` seconds right after the previous one, or
    /// at `now` if the clock already ran past it.
    pub fn schedule(&mut self, duration: f64, now: f64) -> ScheduledBuffer {
        let start_at = self.next_start_time.max(now);
        let buffer = ScheduledBuffer {
            id: self.next_id,
            start_at,
            duration,
        };
        self.next_id += 1;

        if start_at > self.next_start_time {
            log::debug!(
                "Playback: Clock ahead of schedule by {:.1}ms, starting immediately",
                (start_at - self.next_start_time) * 1000.0
            );
        }

        self.next_start_time = buffer.end_at();
        self.published.send_replace(self.next_start_time);
        self.pending.insert(buffer.id, buffer);
        log::trace!(
            "Playback: Buffer {} at {:.3}s for {:.1}ms ({} pending)",
            buffer.id,
            start_at,
            duration * 1000.0,
            self.pending.len()
        );
        buffer
    }

    /// Drop a buffer from the pending set once the device finished it.
    /// Returns false for unknown ids (already interrupted).
    pub fn complete(&mut self, id: BufferId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Clear everything for barge-in. Returns the ids the device must stop.
    pub fn interrupt(&mut self, now: f64) -> Vec<BufferId> {
        let stopped: Vec<BufferId> = self.pending.keys().copied().collect();
        self.pending.clear();
        self.next_start_time = now;
        self.published.send_replace(self.next_start_time);
        stopped
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Nothing pending and the clock has caught up with the schedule
    pub fn is_drained(&self, now: f64) -> bool {
        self.pending.is_empty() && now >= self.next_start_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_back_to_back_when_ahead_of_clock() {
        let mut scheduler = PlaybackScheduler::new();
        let a = scheduler.schedule(0.5, 1.0);
        let b = scheduler.schedule(0.25, 1.1);
        let c = scheduler.schedule(0.25, 1.2);

        assert_eq!(a.start_at, 1.0);
        assert_eq!(b.start_at, 1.5);
        assert_eq!(c.start_at, 1.75);
        assert_eq!(scheduler.next_start_time(), 2.0);
        assert_eq!(scheduler.pending_count(), 3);
    }

    #[test]
    fn test_late_buffer_starts_now() {
        let mut scheduler = PlaybackScheduler::new();
        scheduler.schedule(0.1, 0.0);
        let late = scheduler.schedule(0.1, 0.4);
        assert_eq!(late.start_at, 0.4);
        assert!((scheduler.next_start_time() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_start_times_never_overlap() {
        let mut scheduler = PlaybackScheduler::new();
        let arrivals = [
            (0.0, 0.2),
            (0.05, 0.3),
            (0.9, 0.1),
            (0.95, 0.05),
            (3.0, 0.4),
            (3.01, 0.2),
            (3.02, 0.2),
        ];
        let placed: Vec<ScheduledBuffer> = arrivals
            .iter()
            .map(|&(now, d)| scheduler.schedule(d, now))
            .collect();

        for pair in placed.windows(2) {
            assert!(pair[1].start_at >= pair[0].start_at);
            assert!(pair[1].start_at >= pair[0].end_at() - 1e-12);
        }
        for (buffer, &(now, _)) in placed.iter().zip(arrivals.iter()) {
            assert!(buffer.start_at >= now);
        }
    }

    #[test]
    fn test_interrupt_clears_pending_and_resets_clock() {
        let mut scheduler = PlaybackScheduler::new();
        let rx = scheduler.subscribe();
        let a = scheduler.schedule(1.0, 0.0);
        let b = scheduler.schedule(1.0, 0.0);
        assert_eq!(*rx.borrow(), 2.0);

        let stopped = scheduler.interrupt(0.3);
        assert_eq!(stopped, vec![a.id, b.id]);
        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(scheduler.next_start_time(), 0.3);
        assert_eq!(*rx.borrow(), 0.3);

        // Completions racing the interruption are ignored
        assert!(!scheduler.complete(a.id));
    }

    #[test]
    fn test_drained_after_all_complete() {
        let mut scheduler = PlaybackScheduler::new();
        let a = scheduler.schedule(0.5, 0.0);
        let b = scheduler.schedule(0.5, 0.0);
        assert!(!scheduler.is_drained(0.6));

        assert!(scheduler.complete(a.id));
        assert!(scheduler.complete(b.id));
        assert!(!scheduler.is_drained(0.9));
        assert!(scheduler.is_drained(1.0));
    }
}
