//! Domain values that flow between the router, the presence protocol and the
//! caller.

use std::{borrow::Borrow, fmt, str::FromStr};

use crate::error::{InvalidUsername, MalformedMessage};

/// Identifier a participant chose for the session.
///
/// Comparison is case-sensitive. Uniqueness across participants is not
/// negotiated: two peers with the same name share a private destination and a
/// registry entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Username(String);

impl Username {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, InvalidUsername> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(InvalidUsername);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Takes a name exactly as it arrived in message metadata. Blank names
    /// are rejected; surrounding whitespace is kept, so `"alice "` and
    /// `"alice"` are different participants.
    pub fn verbatim(raw: impl Into<String>) -> Result<Self, InvalidUsername> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(InvalidUsername);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Username {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl FromStr for Username {
    type Err = InvalidUsername;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceKind {
    Join,
    Leave,
    SyncRequest,
    SyncResponse,
}

impl PresenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceKind::Join => "join",
            PresenceKind::Leave => "leave",
            PresenceKind::SyncRequest => "sync-request",
            PresenceKind::SyncResponse => "sync-response",
        }
    }
}

impl fmt::Display for PresenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceKind {
    type Err = MalformedMessage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "join" => Ok(PresenceKind::Join),
            "leave" => Ok(PresenceKind::Leave),
            "sync-request" => Ok(PresenceKind::SyncRequest),
            "sync-response" => Ok(PresenceKind::SyncResponse),
            other => Err(MalformedMessage::UnknownPresenceKind(other.to_string())),
        }
    }
}

/// Control message carried on the broadcast destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub kind: PresenceKind,
    pub sender: Username,
}

impl PresenceEvent {
    pub fn new(kind: PresenceKind, sender: Username) -> Self {
        Self { kind, sender }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Public,
    Private,
}

/// Chat payload handed to the caller. Never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub sender: Username,
    pub text: String,
    pub scope: Scope,
}
