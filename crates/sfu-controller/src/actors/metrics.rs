//! Actor counters and mailbox depth tracking.
//!
//! | Actor    | Capacity | Normal | Elevated | Critical |
//! |----------|----------|--------|----------|----------|
//! | Registry | 1000     | <= 100 | 101-500  | > 500    |
//! | Room     | 500      | <= 100 | 101-400  | > 400    |
//!
//! Depth is the number of messages still queued behind the one being
//! handled, read from the mailbox sender. Critical sits below capacity so
//! it fires before senders start waiting.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::observability::metrics as prom;

/// Depth bounds for one kind of mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxThresholds {
    /// Highest depth still considered normal.
    pub normal: usize,
    /// Highest depth before the mailbox is critical.
    pub warning: usize,
}

impl MailboxThresholds {
    pub const REGISTRY: Self = Self {
        normal: 100,
        warning: 500,
    };
    pub const ROOM: Self = Self {
        normal: 100,
        warning: 400,
    };

    #[must_use]
    pub const fn classify(&self, depth: usize) -> MailboxLevel {
        if depth > self.warning {
            MailboxLevel::Critical
        } else if depth > self.normal {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Which actor a monitor or panic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Registry,
    Room,
}

impl ActorType {
    /// Label value for the `actor_type` metric dimension.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Room => "room",
        }
    }

    #[must_use]
    pub const fn thresholds(&self) -> MailboxThresholds {
        match self {
            ActorType::Registry => MailboxThresholds::REGISTRY,
            ActorType::Room => MailboxThresholds::ROOM,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MailboxLevel {
    Normal = 0,
    Warning = 1,
    Critical = 2,
}

impl MailboxLevel {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => MailboxLevel::Normal,
            1 => MailboxLevel::Warning,
            _ => MailboxLevel::Critical,
        }
    }
}

/// Number of messages waiting in the channel `sender` feeds.
#[must_use]
pub fn queued<T>(sender: &tokio::sync::mpsc::Sender<T>) -> usize {
    sender.max_capacity().saturating_sub(sender.capacity())
}

/// Depth gauge for a single actor mailbox.
///
/// The run loop calls [`record_received`](Self::record_received) with the
/// backlog each time it takes a message, and
/// [`record_processed`](Self::record_processed) once it is handled. Level
/// changes are logged once per transition rather than on every message.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Room id, or the instance id for the registry.
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
    last_level: AtomicU8,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
            last_level: AtomicU8::new(MailboxLevel::Normal as u8),
        }
    }

    pub fn record_received(&self, queued: usize) {
        self.depth.store(queued, Ordering::Relaxed);
        self.peak_depth.fetch_max(queued, Ordering::Relaxed);
        self.observe(queued);
    }

    pub fn record_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.actor_type.thresholds().classify(self.current_depth())
    }

    fn observe(&self, depth: usize) {
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), depth);

        let level = self.actor_type.thresholds().classify(depth);
        let previous =
            MailboxLevel::from_u8(self.last_level.swap(level as u8, Ordering::Relaxed));
        if previous == level {
            return;
        }
        match level {
            MailboxLevel::Critical => warn!(
                target: "sfu.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                "Mailbox backlog critical"
            ),
            MailboxLevel::Warning if previous == MailboxLevel::Normal => debug!(
                target: "sfu.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                "Mailbox backlog building"
            ),
            _ => debug!(
                target: "sfu.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                level = ?level,
                "Mailbox backlog easing"
            ),
        }
    }
}

/// Process-wide room and participant counters.
///
/// One instance is shared by the registry, every room actor and the
/// status endpoint; each mutation also updates the Prometheus gauges.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    pub active_rooms: AtomicUsize,
    pub active_participants: AtomicUsize,
    pub actor_panics: AtomicU64,
    /// Room handlers that returned an error and were contained.
    pub handler_failures: AtomicU64,
    pub total_messages_processed: AtomicU64,
}

fn saturating_decrement(counter: &AtomicUsize) -> usize {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
            Some(c.saturating_sub(1))
        })
        .unwrap_or(0)
        .saturating_sub(1)
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let rooms = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_rooms_active(rooms);
    }

    pub fn room_removed(&self) {
        prom::set_rooms_active(saturating_decrement(&self.active_rooms));
    }

    pub fn participant_added(&self) {
        self.active_participants.fetch_add(1, Ordering::Relaxed);
        prom::participant_added();
    }

    pub fn participant_removed(&self) {
        saturating_decrement(&self.active_participants);
        prom::participant_removed();
    }

    /// A room or registry task ended by panicking. Always a bug.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "sfu.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor task panicked"
        );
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.active_rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.active_participants.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn handler_failure_count(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_sit_below_capacity() {
        let room = ActorType::Room.thresholds();
        let registry = ActorType::Registry.thresholds();

        assert_eq!(room.classify(100), MailboxLevel::Normal);
        assert_eq!(room.classify(101), MailboxLevel::Warning);
        assert_eq!(room.classify(401), MailboxLevel::Critical);
        assert_eq!(registry.classify(401), MailboxLevel::Warning);
        assert!(room.warning < 500);
        assert!(registry.warning < 1000);
    }

    #[tokio::test]
    async fn test_queued_reads_channel_backlog() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<u32>(8);
        assert_eq!(queued(&tx), 0);

        for n in 0..5 {
            tx.send(n).await.unwrap();
        }
        assert_eq!(queued(&tx), 5);

        rx.recv().await.unwrap();
        assert_eq!(queued(&tx), 4);
    }

    #[test]
    fn test_depth_tracks_latest_backlog_and_peak() {
        let monitor = MailboxMonitor::new(ActorType::Room, "room-1");

        monitor.record_received(3);
        monitor.record_processed();
        monitor.record_received(450);
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
        monitor.record_processed();
        monitor.record_received(40);
        monitor.record_processed();

        assert_eq!(monitor.current_depth(), 40);
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);
        assert_eq!(monitor.peak_depth(), 450);
        assert_eq!(monitor.messages_processed(), 3);
    }

    #[test]
    fn test_room_and_participant_counters() {
        let metrics = ActorMetrics::new();

        metrics.room_created();
        metrics.room_created();
        metrics.participant_added();
        metrics.room_removed();
        metrics.participant_removed();
        assert_eq!(metrics.room_count(), 1);
        assert_eq!(metrics.participant_count(), 0);

        metrics.room_removed();
        metrics.room_removed();
        metrics.participant_removed();
        assert_eq!(metrics.room_count(), 0);
        assert_eq!(metrics.participant_count(), 0);
    }

    #[test]
    fn test_failures_and_panics_are_counted_separately() {
        let metrics = ActorMetrics::new();

        metrics.record_handler_failure();
        metrics.record_handler_failure();
        metrics.record_panic(ActorType::Room);

        assert_eq!(metrics.handler_failure_count(), 2);
        assert_eq!(metrics.actor_panics.load(Ordering::Relaxed), 1);
    }
}
