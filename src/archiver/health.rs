// health.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::archiver::{error::SourceFailure, index::RefreshSummary, types::ArchiverId};
use crate::constants::EVENT_CHANNEL_CAPACITY;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reachability {
    /// No discovery attempt has completed yet.
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reachability::Unknown => f.write_str("unknown"),
            Reachability::Reachable => f.write_str("reachable"),
            Reachability::Unreachable => f.write_str("unreachable"),
        }
    }
}

/// Status notifications published to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ArchiveEvent {
    ReachabilityChanged {
        archiver: ArchiverId,
        from: Reachability,
        to: Reachability,
        at: DateTime<Utc>,
    },
    IndexRefreshed {
        summary: RefreshSummary,
    },
    /// Discovery failed for these archivers; their last-known PV sets
    /// remain in use.
    IndexStale {
        failed: Vec<ArchiverId>,
    },
    PartialCoverage {
        pv: String,
        failed: Vec<SourceFailure>,
    },
    QueryFailed {
        pv: String,
        message: String,
    },
}

/// Fan-out of [`ArchiveEvent`]s. Publishing never blocks; subscribers that
/// fall behind see `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct StatusBus {
    sender: broadcast::Sender<ArchiveEvent>,
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl StatusBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, event: ArchiveEvent) {
        match &event {
            ArchiveEvent::ReachabilityChanged { archiver, from, to, .. } => {
                if *to == Reachability::Unreachable {
                    warn!(archiver = %archiver, %from, %to, "archiver became unreachable");
                } else {
                    info!(archiver = %archiver, %from, %to, "archiver reachability changed");
                }
            }
            ArchiveEvent::IndexStale { failed } => {
                warn!(failed = failed.len(), "index is serving stale PV sets");
            }
            _ => debug!(?event, "status event"),
        }
        // no subscribers is not an error
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = StatusBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(ArchiveEvent::ReachabilityChanged {
            archiver: ArchiverId::from("arch-a"),
            from: Reachability::Unknown,
            to: Reachability::Reachable,
            at: Utc::now(),
        });

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                ArchiveEvent::ReachabilityChanged { archiver, to, .. } => {
                    assert_eq!(archiver.as_str(), "arch-a");
                    assert_eq!(to, Reachability::Reachable);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = StatusBus::new(4);
        bus.publish(ArchiveEvent::QueryFailed {
            pv: "X".into(),
            message: "boom".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
