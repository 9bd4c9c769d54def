use crate::{event::Username, message::Destination};

pub const DEFAULT_BROADCAST: &str = "presence-chat.public";
pub const DEFAULT_PRIVATE_PREFIX: &str = "presence-chat.private.";

/// Well-known destination names. Every participant in a room must use the
/// same values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationNames {
    pub broadcast: String,
    pub private_prefix: String,
}

impl Default for DestinationNames {
    fn default() -> Self {
        Self {
            broadcast: DEFAULT_BROADCAST.to_string(),
            private_prefix: DEFAULT_PRIVATE_PREFIX.to_string(),
        }
    }
}

impl DestinationNames {
    pub fn private_for(&self, user: &Username) -> String {
        format!("{}{}", self.private_prefix, user)
    }

    pub fn broadcast_destination(&self) -> Destination {
        Destination::topic(self.broadcast.clone())
    }

    pub fn private_destination(&self, user: &Username) -> Destination {
        Destination::queue(self.private_for(user))
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub username: Username,
    pub broker_address: String,
    pub destinations: DestinationNames,
}

impl SessionConfig {
    pub fn new(username: Username, broker_address: impl Into<String>) -> Self {
        Self {
            username,
            broker_address: broker_address.into(),
            destinations: DestinationNames::default(),
        }
    }

    pub fn with_destinations(mut self, destinations: DestinationNames) -> Self {
        self.destinations = destinations;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DestinationKind;

    #[test]
    fn private_destination_is_prefix_plus_username() {
        let names = DestinationNames {
            broadcast: "room".into(),
            private_prefix: "room.dm.".into(),
        };
        let bob = Username::new("Bob").expect("valid name");

        let destination = names.private_destination(&bob);

        assert_eq!(destination.kind, DestinationKind::Queue);
        assert_eq!(destination.name, "room.dm.Bob");
        assert_eq!(names.broadcast_destination(), Destination::topic("room"));
    }
}
