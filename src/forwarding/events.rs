//! Forward event system
//!
//! Status and statistics changes of port forwards are published on a
//! broadcast channel; hosts subscribe to drive their UI.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{ForwardStats, ForwardStatus};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ForwardEvent {
    /// Forward status changed (active, stopped, error...)
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        forward_id: String,
        session_id: String,
        status: ForwardStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Emitted when a forwarded connection ends
    #[serde(rename_all = "camelCase")]
    StatsUpdated {
        forward_id: String,
        session_id: String,
        stats: ForwardStats,
    },
}

/// Publishes [`ForwardEvent`]s for one session.
#[derive(Clone)]
pub struct ForwardEventEmitter {
    tx: Option<broadcast::Sender<ForwardEvent>>,
    session_id: String,
}

impl ForwardEventEmitter {
    pub fn new(session_id: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tx: Some(tx),
            session_id: session_id.into(),
        }
    }

    /// Emitter that drops every event.
    pub fn noop(session_id: impl Into<String>) -> Self {
        Self {
            tx: None,
            session_id: session_id.into(),
        }
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<ForwardEvent>> {
        self.tx.as_ref().map(|tx| tx.subscribe())
    }

    pub fn emit(&self, event: ForwardEvent) {
        if let Some(tx) = &self.tx {
            // no subscribers is fine
            let _ = tx.send(event);
        }
    }

    pub fn emit_status_changed(&self, forward_id: &str, status: ForwardStatus, error: Option<String>) {
        self.emit(ForwardEvent::StatusChanged {
            forward_id: forward_id.to_string(),
            session_id: self.session_id.clone(),
            status,
            error,
        });
    }

    pub fn emit_stats_updated(&self, forward_id: &str, stats: ForwardStats) {
        self.emit(ForwardEvent::StatsUpdated {
            forward_id: forward_id.to_string(),
            session_id: self.session_id.clone(),
            stats,
        });
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl std::fmt::Debug for ForwardEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardEventEmitter")
            .field("session_id", &self.session_id)
            .field("enabled", &self.tx.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_emitter() {
        let emitter = ForwardEventEmitter::noop("test-session");
        assert!(emitter.subscribe().is_none());
        emitter.emit_status_changed("fwd-1", ForwardStatus::Active, None);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let emitter = ForwardEventEmitter::new("sess-1");
        let mut rx = emitter.subscribe().unwrap();
        emitter.emit_status_changed("fwd-1", ForwardStatus::Error, Some("boom".into()));
        match rx.recv().await.unwrap() {
            ForwardEvent::StatusChanged {
                forward_id,
                session_id,
                status,
                error,
            } => {
                assert_eq!(forward_id, "fwd-1");
                assert_eq!(session_id, "sess-1");
                assert_eq!(status, ForwardStatus::Error);
                assert_eq!(error.as_deref(), Some("boom"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = ForwardEvent::StatusChanged {
            forward_id: "fwd-1".into(),
            session_id: "sess-1".into(),
            status: ForwardStatus::Active,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "statusChanged");
        assert_eq!(json["forwardId"], "fwd-1");
        assert_eq!(json["status"], "active");
        assert!(json.get("error").is_none());
    }
}
