use serde::{Deserialize, Serialize};

use flowgate_core::event::Topic;

/// A frame sent by an observer.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Subscribe { topics: Vec<Topic> },
    Unsubscribe { topics: Vec<Topic> },
}

/// Control frames sent back to an observer. Event envelopes go out as-is.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Current topic set after a subscription change.
    Subscriptions { topics: Vec<Topic> },
    Error { message: String },
}

impl ServerFrame {
    pub fn to_text(&self) -> String {
        // Plain enum of strings and topics; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscription_frames() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe","topics":["execution","bridge"]}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                topics: vec![Topic::Execution, Topic::Bridge]
            }
        );

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"unsubscribe","topics":["logs"]}"#).unwrap();
        assert_eq!(frame, ClientFrame::Unsubscribe { topics: vec![Topic::Logs] });
    }

    #[test]
    fn rejects_unknown_topics_and_types() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"subscribe","topics":["metrics"]}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"publish","topics":[]}"#).is_err());
    }

    #[test]
    fn server_frames_are_tagged() {
        let text = ServerFrame::Subscriptions {
            topics: vec![Topic::Runtime],
        }
        .to_text();
        assert_eq!(text, r#"{"type":"subscriptions","topics":["runtime"]}"#);
    }
}
