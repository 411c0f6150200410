//! Event Bus (§4.7): structured, advisory events fanned out synchronously to
//! non-blocking subscribers. Missing subscribers, or a subscriber panicking,
//! never affect message correctness.

use std::collections::HashMap;
use tokio::sync::broadcast;

/// One of the minimum event types named in §4.7, each carrying the ids/names
/// of involved agents/teams plus a wall-clock timestamp.
#[derive(Debug, Clone)]
pub enum Event {
    MessageReceived {
        channel: String,
        message_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    MessageEnqueued {
        message_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    AgentRouted {
        message_id: String,
        agent_id: String,
        team_id: Option<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    ChainStepStart {
        conversation_id: String,
        agent_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    ChainStepDone {
        conversation_id: String,
        agent_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    ResponseReady {
        message_id: String,
        channel: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    TeamChainStart {
        conversation_id: String,
        team_id: String,
        leader_agent_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    ChainHandoff {
        conversation_id: String,
        from_agent_id: String,
        to_agent_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    TeamChainEnd {
        conversation_id: String,
        team_id: String,
        step_count: usize,
        members: Vec<String>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    ProcessorStart {
        agent_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Fans out events to every subscriber. Built on a broadcast channel so
/// subscribers can come and go freely; a subscriber lagging behind simply
/// misses older events rather than blocking publishers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish `event`. Never fails the caller: if nobody is listening the
    /// send is simply a no-op, per §4.7 ("events advisory").
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata passed alongside an event payload for subscribers that want a
/// generic key/value view (used by the HTTP API's event stream, if enabled).
pub type EventMetadata = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(Event::ProcessorStart {
            agent_id: "default".to_string(),
            timestamp: chrono::Utc::now(),
        });
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(Event::MessageReceived {
            channel: "telegram".to_string(),
            message_id: "m1".to_string(),
            timestamp: chrono::Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::MessageReceived { .. }));
    }
}
