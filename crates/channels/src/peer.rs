use std::fmt;

use serde::{Deserialize, Serialize};

const GROUP_SUFFIX: &str = "@g.us";
const BROADCAST_SUFFIX: &str = "@broadcast";

/// Conversation identifier (a WhatsApp JID), e.g. `5511999999999@s.whatsapp.net`
/// for a person or `120363025246125486@g.us` for a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

/// What kind of conversation a [`PeerId`] addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Individual,
    Group,
    /// `status@broadcast` and broadcast lists.
    Broadcast,
}

impl PeerId {
    pub fn new(jid: impl Into<String>) -> Self {
        Self(jid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> PeerKind {
        if self.0.ends_with(GROUP_SUFFIX) {
            PeerKind::Group
        } else if self.0.ends_with(BROADCAST_SUFFIX) {
            PeerKind::Broadcast
        } else {
            PeerKind::Individual
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind() == PeerKind::Group
    }

    /// Numeric user part of the JID: everything before `@`, without the
    /// `:device` suffix multi-device JIDs carry.
    pub fn number(&self) -> &str {
        let user = self.0.split_once('@').map_or(self.0.as_str(), |(u, _)| u);
        user.split_once(':').map_or(user, |(u, _)| u)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
