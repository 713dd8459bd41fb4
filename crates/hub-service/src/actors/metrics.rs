//! Actor metrics and mailbox monitoring.
//!
//! Mailbox depth thresholds:
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Hub        | < 100  | 100-500 | > 500    |
//! | Recorder   | < 50   | 50-200  | > 200    |
//! | Connection | < 50   | 50-200  | > 200    |

use crate::observability::metrics as prom;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for the hub actor.
pub const HUB_MAILBOX_NORMAL: usize = 100;
pub const HUB_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for connection and recorder actors.
pub const CONNECTION_MAILBOX_NORMAL: usize = 50;
pub const CONNECTION_MAILBOX_WARNING: usize = 200;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `HubActor` (singleton session orchestrator).
    Hub,
    /// `RecordingControllerActor` (singleton).
    Recorder,
    /// `ConnectionActor` (one per signaling connection).
    Connection,
}

impl ActorType {
    /// Returns the actor type as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Hub => "hub",
            ActorType::Recorder => "recorder",
            ActorType::Connection => "connection",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Hub => HUB_MAILBOX_WARNING,
            ActorType::Recorder | ActorType::Connection => CONNECTION_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Hub => HUB_MAILBOX_NORMAL,
            ActorType::Recorder | ActorType::Connection => CONNECTION_MAILBOX_NORMAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks queue depth and throughput for one actor.
///
/// Depth is the number of messages still queued behind the one being
/// handled, sampled by the actor each time it takes a message.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
    messages_dropped: AtomicU64,
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
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Record the queue length seen when a message was taken.
    pub fn record_depth(&self, depth: usize) {
        let previous = self.depth.swap(depth, Ordering::Relaxed);
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);

        match self.level_for_depth(depth) {
            MailboxLevel::Critical => {
                warn!(
                    target: "hub.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth,
                    threshold = self.actor_type.warning_threshold(),
                    "Mailbox depth critical"
                );
            }
            MailboxLevel::Warning if self.level_for_depth(previous) == MailboxLevel::Normal => {
                debug!(
                    target: "hub.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth,
                    "Mailbox depth elevated"
                );
            }
            _ => {}
        }
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), depth);
    }

    pub fn record_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message dropped because the target mailbox was full.
    pub fn record_drop(&self) {
        let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_message_dropped(self.actor_type.as_str());
        warn!(
            target: "hub.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped,
            "Message dropped due to backpressure"
        );
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
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Shared counters for the actor system.
///
/// Written by the hub and connection actors. Every update is mirrored to
/// the Prometheus recorder; the atomic copies are what tests read.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    active_connections: AtomicUsize,
    active_streamers: AtomicUsize,
    active_viewers: AtomicUsize,
    actor_panics: AtomicU64,
    total_messages_processed: AtomicU64,
}

/// Point-in-time copy of [`ActorMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorMetricsSnapshot {
    pub connections: usize,
    pub streamers: usize,
    pub viewers: usize,
    pub panics: u64,
    pub messages_processed: u64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_connections(&self, count: usize) {
        self.active_connections.store(count, Ordering::SeqCst);
        prom::set_connections_active(count);
    }

    pub fn set_roles(&self, streamers: usize, viewers: usize) {
        self.active_streamers.store(streamers, Ordering::SeqCst);
        self.active_viewers.store(viewers, Ordering::SeqCst);
        prom::set_role_counts(streamers, viewers);
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total_panics = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "hub.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics,
            "Actor panic detected"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn snapshot(&self) -> ActorMetricsSnapshot {
        ActorMetricsSnapshot {
            connections: self.active_connections.load(Ordering::SeqCst),
            streamers: self.active_streamers.load(Ordering::SeqCst),
            viewers: self.active_viewers.load(Ordering::SeqCst),
            panics: self.actor_panics.load(Ordering::Relaxed),
            messages_processed: self.total_messages_processed.load(Ordering::Relaxed),
        }
    }
}
