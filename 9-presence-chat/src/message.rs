use std::{collections::BTreeMap, io};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::event::{PresenceEvent, Username};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub const TYPE_KEY: &str = "type";
pub const SENDER_KEY: &str = "sender";
pub const PRESENCE_TYPE: &str = "presence";
pub const CHAT_TYPE: &str = "chat";

/// Opaque text payload plus string metadata, as carried by the transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub payload: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Envelope {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn presence(event: &PresenceEvent) -> Self {
        Self::new(event.kind.as_str())
            .with_meta(TYPE_KEY, PRESENCE_TYPE)
            .with_meta(SENDER_KEY, event.sender.as_str())
    }

    pub fn chat(sender: &Username, text: impl Into<String>) -> Self {
        Self::new(text)
            .with_meta(TYPE_KEY, CHAT_TYPE)
            .with_meta(SENDER_KEY, sender.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    /// Every subscriber receives every message.
    Topic,
    /// Each message goes to exactly one subscriber.
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Destination {
    pub kind: DestinationKind,
    pub name: String,
}

impl Destination {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Topic,
            name: name.into(),
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Queue,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToBroker {
    Subscribe {
        destination: Destination,
    },
    Unsubscribe {
        destination: Destination,
    },
    Publish {
        destination: Destination,
        message: Envelope,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerToClient {
    Deliver {
        destination: Destination,
        message: Envelope,
    },
    Error {
        message: String,
    },
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    // Simple line-oriented framing keeps interoperability with netcat-style tools.
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PresenceKind;

    #[test]
    fn presence_envelope_carries_kind_and_sender() {
        let alice = Username::new("alice").expect("valid name");
        let envelope = Envelope::presence(&PresenceEvent::new(PresenceKind::SyncRequest, alice));

        assert_eq!(envelope.payload, "sync-request");
        assert_eq!(envelope.meta(TYPE_KEY), Some(PRESENCE_TYPE));
        assert_eq!(envelope.meta(SENDER_KEY), Some("alice"));
    }

    #[tokio::test]
    async fn reader_skips_blank_lines_between_frames() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let frame = ClientToBroker::Publish {
            destination: Destination::topic("room"),
            message: Envelope::new("hello").with_meta(SENDER_KEY, "alice"),
        };

        writer.write_all(b"\n\r\n").await.expect("write blanks");
        write_message(&mut writer, &frame)
            .await
            .expect("write message");
        drop(writer);

        let parsed = read_message::<_, ClientToBroker>(&mut reader)
            .await
            .expect("read message")
            .expect("expected message");
        assert_eq!(parsed, frame);

        let end = read_message::<_, ClientToBroker>(&mut reader)
            .await
            .expect("read eof");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn reader_rejects_invalid_json() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut reader = tokio::io::BufReader::new(reader);
        writer.write_all(b"not json\n").await.expect("write");

        let err = read_message::<_, BrokerToClient>(&mut reader)
            .await
            .expect_err("invalid frame");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
