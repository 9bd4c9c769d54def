//! Presence-aware chat over a publish/subscribe transport.
//!
//! Every participant shares one broadcast destination for public chat and
//! presence control traffic, and owns one private destination for direct
//! messages. Modules, from the inside out:
//!
//! - [`event`] holds the domain values (usernames, presence and chat events).
//! - [`registry`] is the thread-safe set of online users.
//! - [`presence`] implements the Join / SyncRequest / SyncResponse protocol
//!   that lets a newcomer learn the roster in one round trip.
//! - [`router`] classifies inbound messages and suppresses our own echoes.
//! - [`session`] owns one user's lifecycle and wires the above to a transport.
//! - [`transport`] defines the transport seam plus in-memory and TCP adapters.
//! - [`broker`] is a small JSON-line pub/sub broker the TCP adapter talks to.
//! - [`cli`] and [`client`] provide the terminal front end.

pub mod broker;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod presence;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;

pub use config::{DestinationNames, SessionConfig};
pub use error::{SessionError, TransportError};
pub use event::{ChatEvent, PresenceEvent, PresenceKind, Scope, Username};
pub use registry::PresenceRegistry;
pub use session::{ChatSession, SessionState};
