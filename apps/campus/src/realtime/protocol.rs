//! JSON frames exchanged over the realtime channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control frames the client sends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic_id: String },
    Unsubscribe { topic_id: String },
    Ping,
}

/// Frames pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed {
        topic_id: String,
    },
    Unsubscribed {
        topic_id: String,
    },
    Event {
        #[serde(flatten)]
        event: PushEvent,
    },
    Pong,
    Error {
        message: String,
    },
}

/// A typed push event, e.g. `new_reply` carrying the reply entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushEvent {
    pub event_type: String,
    pub topic_id: String,
    pub entity: Value,
}

impl PushEvent {
    /// The pushed entity's id, used for de-duplication against optimistic
    /// local inserts.
    pub fn entity_id(&self) -> Option<&str> {
        self.entity.get("id").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frames_serialize_with_snake_case_tags() {
        let frame = ClientFrame::Subscribe {
            topic_id: "thread-42".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json, json!({"type": "subscribe", "topic_id": "thread-42"}));

        let ping = serde_json::to_value(&ClientFrame::Ping).unwrap();
        assert_eq!(ping, json!({"type": "ping"}));
    }

    #[test]
    fn event_frames_flatten_the_payload() {
        let raw = json!({
            "type": "event",
            "event_type": "new_reply",
            "topic_id": "thread-42",
            "entity": {"id": "reply-7", "body": "welcome aboard"}
        });
        let frame: ServerFrame = serde_json::from_value(raw).unwrap();
        match frame {
            ServerFrame::Event { event } => {
                assert_eq!(event.event_type, "new_reply");
                assert_eq!(event.topic_id, "thread-42");
                assert_eq!(event.entity_id(), Some("reply-7"));
            }
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[test]
    fn entity_without_id_dedups_to_none() {
        let event = PushEvent {
            event_type: "presence".into(),
            topic_id: "course-1".into(),
            entity: json!({"count": 3}),
        };
        assert_eq!(event.entity_id(), None);
    }
}
