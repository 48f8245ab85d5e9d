//! Playback clock contract

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Notifications from the playback clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockEvent {
    /// Periodic position update during playback
    TimeUpdate(f64),
    /// The user moved the playhead
    Seeking(f64),
}

/// Source of the current playback position
pub trait PlaybackClock: Send + Sync {
    /// Position in seconds
    fn current_time(&self) -> f64;

    fn subscribe(&self) -> broadcast::Receiver<ClockEvent>;
}

/// Clock driven by explicit calls, for tests and headless playback
#[derive(Debug, Clone)]
pub struct ManualClock {
    position: Arc<AtomicU64>,
    events: broadcast::Sender<ClockEvent>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            position: Arc::new(AtomicU64::new(start.to_bits())),
            events,
        }
    }

    /// Advance playback to `position` and emit a time update
    pub fn tick(&self, position: f64) {
        self.position.store(position.to_bits(), Ordering::SeqCst);
        let _ = self.events.send(ClockEvent::TimeUpdate(position));
    }

    /// Jump to `position` and emit a seek
    pub fn seek(&self, position: f64) {
        self.position.store(position.to_bits(), Ordering::SeqCst);
        let _ = self.events.send(ClockEvent::Seeking(position));
    }
}

impl PlaybackClock for ManualClock {
    fn current_time(&self) -> f64 {
        f64::from_bits(self.position.load(Ordering::SeqCst))
    }

    fn subscribe(&self) -> broadcast::Receiver<ClockEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_events() {
        let clock = ManualClock::new(1.5);
        assert_eq!(clock.current_time(), 1.5);

        let mut rx = clock.subscribe();
        clock.tick(2.0);
        clock.seek(30.0);
        assert_eq!(rx.recv().await.unwrap(), ClockEvent::TimeUpdate(2.0));
        assert_eq!(rx.recv().await.unwrap(), ClockEvent::Seeking(30.0));
        assert_eq!(clock.current_time(), 30.0);
    }

    #[test]
    fn test_clones_share_position() {
        let clock = ManualClock::new(0.0);
        let other = clock.clone();
        other.tick(9.25);
        assert_eq!(clock.current_time(), 9.25);
    }
}
