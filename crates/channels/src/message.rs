use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Opaque authentication state owned by the transport. Saved verbatim after
/// every update and handed back on the next connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCredential(pub serde_json::Value);

/// A message received from a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub from: PeerId,
    /// Echo of a message this account sent itself.
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

impl InboundMessage {
    pub fn text(from: impl Into<PeerId>, text: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            from_me: false,
            text: Some(text.into()),
            caption: None,
        }
    }

    /// Text body, or the media caption when there is no body. Blank content
    /// counts as none.
    pub fn content(&self) -> Option<&str> {
        [self.text.as_deref(), self.caption.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// One outbound media message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub kind: MediaKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

impl OutboundPayload {
    pub fn image(url: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Image,
            url: url.into(),
            caption: Some(caption.into()),
        }
    }

    pub fn video(url: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Video,
            url: url.into(),
            caption: Some(caption.into()),
        }
    }
}
