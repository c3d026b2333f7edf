use crate::error::RealtimeError;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Event name of the frame that announces the server-assigned client id.
pub(crate) const CONNECT_EVENT: &str = "PB_CONNECT";

/// Topic that matches every collection.
pub(crate) const ALL_TOPICS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        })
    }
}

/// One decoded change event. Transient: produced from a single server
/// frame and handed straight to the matching callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: String,
    pub action: Action,
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
struct ConnectData {
    #[serde(rename = "clientId")]
    client_id: String,
}

#[derive(Debug, Deserialize)]
struct EventData {
    action: Action,
    #[serde(default)]
    record: Value,
}

#[derive(Debug, Clone)]
pub(crate) enum ServerMessage {
    Connect { client_id: String },
    Change(Event),
}

pub(crate) fn decode_message(frame: &SseFrame) -> Result<ServerMessage, RealtimeError> {
    if frame.event == CONNECT_EVENT {
        let data: ConnectData = serde_json::from_str(&frame.data)
            .map_err(|err| RealtimeError::Protocol(format!("malformed connect frame: {err}")))?;
        if data.client_id.is_empty() {
            return Err(RealtimeError::Protocol(
                "connect frame carried an empty client id".into(),
            ));
        }
        Ok(ServerMessage::Connect {
            client_id: data.client_id,
        })
    } else {
        let data: EventData = serde_json::from_str(&frame.data)?;
        Ok(ServerMessage::Change(Event {
            topic: frame.event.clone(),
            action: data.action,
            payload: data.record,
        }))
    }
}

/// One complete server-sent-events frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

/// Incremental SSE decoder. Chunks arrive on arbitrary boundaries; `push`
/// buffers them and `next_frame` yields frames as blank-line separators
/// become available. Handles `\n` and `\r\n`, `:` comments, and
/// multi-line `data:` fields.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn next_frame(&mut self) -> Option<SseFrame> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let mut line = &raw[..raw.len() - 1];
            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }

            if line.is_empty() {
                if self.event.is_none() && self.id.is_none() && self.data.is_empty() {
                    continue;
                }
                return Some(SseFrame {
                    id: self.id.take(),
                    event: self.event.take().unwrap_or_else(|| "message".to_string()),
                    data: std::mem::take(&mut self.data).join("\n"),
                });
            }

            let line = String::from_utf8_lossy(line);
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_ref(), ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                _ => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frames(input: &str) -> Vec<SseFrame> {
        let mut decoder = SseDecoder::new();
        decoder.push(input.as_bytes());
        let mut out = Vec::new();
        while let Some(frame) = decoder.next_frame() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_single_frame() {
        let out = frames("id:1\nevent:posts\ndata:{\"a\":1}\n\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id.as_deref(), Some("1"));
        assert_eq!(out[0].event, "posts");
        assert_eq!(out[0].data, "{\"a\":1}");
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"event:po");
        assert!(decoder.next_frame().is_none());
        decoder.push(b"sts\ndata:{}\n");
        assert!(decoder.next_frame().is_none());
        decoder.push(b"\nevent:comments\ndata:{}\n\n");

        let first = decoder.next_frame().unwrap();
        assert_eq!(first.event, "posts");
        let second = decoder.next_frame().unwrap();
        assert_eq!(second.event, "comments");
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_crlf_and_space_after_colon() {
        let out = frames("event: posts\r\ndata: {}\r\n\r\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event, "posts");
        assert_eq!(out[0].data, "{}");
    }

    #[test]
    fn test_comments_and_blank_lines_ignored() {
        let out = frames(":keepalive\n\n\nevent:posts\ndata:{}\n\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event, "posts");
    }

    #[test]
    fn test_multiline_data_joined() {
        let out = frames("event:posts\ndata:line1\ndata:line2\n\n");
        assert_eq!(out[0].data, "line1\nline2");
    }

    #[test]
    fn test_default_event_name() {
        let out = frames("data:{}\n\n");
        assert_eq!(out[0].event, "message");
    }

    #[test]
    fn test_decode_connect() {
        let frame = SseFrame {
            id: None,
            event: CONNECT_EVENT.to_string(),
            data: json!({"clientId": "abc"}).to_string(),
        };
        match decode_message(&frame).unwrap() {
            ServerMessage::Connect { client_id } => assert_eq!(client_id, "abc"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_connect_rejects_missing_id() {
        let frame = SseFrame {
            id: None,
            event: CONNECT_EVENT.to_string(),
            data: "{}".to_string(),
        };
        assert!(matches!(
            decode_message(&frame),
            Err(RealtimeError::Protocol(_))
        ));

        let empty = SseFrame {
            id: None,
            event: CONNECT_EVENT.to_string(),
            data: json!({"clientId": ""}).to_string(),
        };
        assert!(matches!(
            decode_message(&empty),
            Err(RealtimeError::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_change_event() {
        let frame = SseFrame {
            id: None,
            event: "posts/r1".to_string(),
            data: json!({"action": "update", "record": {"id": "r1", "title": "hi"}}).to_string(),
        };
        match decode_message(&frame).unwrap() {
            ServerMessage::Change(event) => {
                assert_eq!(event.topic, "posts/r1");
                assert_eq!(event.action, Action::Update);
                assert_eq!(event.payload["title"], "hi");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_action_is_decode_error() {
        let frame = SseFrame {
            id: None,
            event: "posts".to_string(),
            data: json!({"action": "upsert", "record": {}}).to_string(),
        };
        assert!(matches!(
            decode_message(&frame),
            Err(RealtimeError::Decode(_))
        ));
    }
}
