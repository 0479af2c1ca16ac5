use std::collections::HashMap;
use std::sync::Mutex;

pub const CHAT_CHANNEL_FAMILY: &str = "chat";
pub const NAV_CHANNEL_FAMILY: &str = "nav";

/// Opaque pub/sub address: a family plus a topic within it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Channel {
    pub family: &'static str,
    pub topic: String,
}

impl Channel {
    pub fn chat(chat_id: &str) -> Channel {
        Channel {
            family: CHAT_CHANNEL_FAMILY,
            topic: chat_id.to_string(),
        }
    }

    /// Navigation sidebar of one viewer (a user's or a moderator's).
    pub fn nav(viewer_id: &str) -> Channel {
        Channel {
            family: NAV_CHANNEL_FAMILY,
            topic: viewer_id.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LiveEvent {
    pub channel: Channel,
    pub dedup_key: String,
    /// Set on durable (resumable) events only; streaming deltas carry None
    /// and may be dropped on disconnect without replay.
    pub event_id: Option<u64>,
    pub payload: serde_json::Value,
}

#[derive(Default)]
struct BrokerState {
    last_event_id: HashMap<Channel, u64>,
    history: HashMap<Channel, Vec<LiveEvent>>,
    transient: HashMap<Channel, HashMap<String, LiveEvent>>,
}

/// In-memory delta publisher. Transient publishes are last-write-wins per
/// dedup key; final publishes get a per-channel monotonically increasing
/// event ID and are retained for resumable catch-up reads.
#[derive(Default)]
pub struct LiveBroker {
    state: Mutex<BrokerState>,
}

impl LiveBroker {
    pub fn new() -> LiveBroker {
        LiveBroker::default()
    }

    /// Best-effort UI update; never the system of record. A later publish
    /// with the same dedup key replaces this one.
    pub fn publish_transient(
        &self,
        channel: Channel,
        dedup_key: &str,
        payload: serde_json::Value,
    ) {
        let event = LiveEvent {
            channel: channel.clone(),
            dedup_key: dedup_key.to_string(),
            event_id: None,
            payload,
        };
        let mut state = self.state.lock().unwrap();
        state
            .transient
            .entry(channel)
            .or_default()
            .insert(dedup_key.to_string(), event);
    }

    /// Durable state publish; returns the assigned event ID.
    pub fn publish_final(
        &self,
        channel: Channel,
        dedup_key: &str,
        payload: serde_json::Value,
    ) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state
            .last_event_id
            .entry(channel.clone())
            .and_modify(|n| *n += 1)
            .or_insert(1);
        let event = LiveEvent {
            channel: channel.clone(),
            dedup_key: dedup_key.to_string(),
            event_id: Some(*id),
            payload,
        };
        let id = *id;
        state.history.entry(channel).or_default().push(event);
        id
    }

    pub fn last_event_id(&self, channel: &Channel) -> u64 {
        let state = self.state.lock().unwrap();
        state.last_event_id.get(channel).copied().unwrap_or(0)
    }

    /// Latest transient value for a dedup key, if any burst reached us.
    pub fn latest_transient(&self, channel: &Channel, dedup_key: &str) -> Option<LiveEvent> {
        let state = self.state.lock().unwrap();
        state
            .transient
            .get(channel)
            .and_then(|m| m.get(dedup_key))
            .cloned()
    }

    /// Durable events after `last_event_id`, for a subscriber reconnecting
    /// with a last-seen ID.
    pub fn catch_up(&self, channel: &Channel, last_event_id: u64) -> Vec<LiveEvent> {
        let state = self.state.lock().unwrap();
        state
            .history
            .get(channel)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.event_id.is_some_and(|id| id > last_event_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
