//! Notifications emitted by the bridge to the outer process

use serde::{Deserialize, Serialize};

pub const COMMISSIONING_WINDOW_CLOSED: &str = "commissioningWindowClosed";

/// Bridge event as delivered on the outer event channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum BridgeEvent {
    EventTriggered(TriggeredEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggeredEvent {
    pub event_name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl BridgeEvent {
    pub fn commissioning_window_closed() -> Self {
        BridgeEvent::EventTriggered(TriggeredEvent {
            event_name: COMMISSIONING_WINDOW_CLOSED.to_string(),
            data: serde_json::json!({}),
        })
    }

    pub fn event_name(&self) -> &str {
        match self {
            BridgeEvent::EventTriggered(e) => &e.event_name,
        }
    }
}
