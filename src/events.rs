//! Engine notifications.
//!
//! The orchestrator reports two things to the outside world: a media's
//! aggregate encoding status changed, and a primary rendition became
//! playable. [`EngineEvents`] is the seam; [`EventBus`] is the in-process
//! implementation, a `tokio::sync::broadcast` channel with a bounded ring
//! buffer of recent events so late subscribers can catch up.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reelforge_common::{AggregateStatus, MediaId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 100;

/// Hooks fired by the orchestrator. Implementations must not block.
pub trait EngineEvents: Send + Sync {
    fn on_aggregate_status_changed(&self, media_id: MediaId, status: AggregateStatus);

    /// A primary-family rendition finished; `manifest` is set once packaging
    /// produced a playlist.
    fn on_primary_rendition_ready(&self, media_id: MediaId, manifest: Option<&Path>);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    AggregateStatusChanged {
        media_id: MediaId,
        status: AggregateStatus,
    },
    PrimaryRenditionReady {
        media_id: MediaId,
        manifest_path: Option<PathBuf>,
    },
}

/// A timestamped event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    recent: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// `capacity` sizes the broadcast channel, not the ring buffer.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, payload: EventPayload) {
        let event = Event {
            timestamp: Utc::now(),
            payload,
        };

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        self.recent.read().iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EngineEvents for EventBus {
    fn on_aggregate_status_changed(&self, media_id: MediaId, status: AggregateStatus) {
        tracing::info!(%media_id, %status, "aggregate status changed");
        self.publish(EventPayload::AggregateStatusChanged { media_id, status });
    }

    fn on_primary_rendition_ready(&self, media_id: MediaId, manifest: Option<&Path>) {
        tracing::info!(%media_id, manifest = ?manifest, "primary rendition ready");
        self.publish(EventPayload::PrimaryRenditionReady {
            media_id,
            manifest_path: manifest.map(Path::to_path_buf),
        });
    }
}
