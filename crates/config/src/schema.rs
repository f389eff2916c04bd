//! Config schema types (server, transport, session, onboarding).

use std::{path::PathBuf, time::Duration};

use {
    firstcontact_channels::OutboundPayload,
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FirstContactConfig {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub session: SessionConfig,
    pub onboarding: OnboardingConfig,
}

/// HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 3000,
        }
    }
}

/// Which WhatsApp client drives the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process client; needs a build with the `native` feature.
    Native,
    /// External bridge process reached over WebSocket.
    Bridge,
}

/// How the session reaches WhatsApp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Unset picks `native` when compiled in, `bridge` otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<TransportKind>,
    /// WebSocket endpoint of the bridge. Only `ws://` is supported.
    pub bridge_url: String,
    /// Deadline for a handshake, a send or a logout.
    pub request_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: None,
            bridge_url: "ws://127.0.0.1:8787/ws".into(),
            request_timeout_secs: 30,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Where the credential database lives. Defaults to `~/.firstcontact/`.
    pub data_dir: Option<PathBuf>,
    /// First reconnect delay after a transient disconnect.
    pub reconnect_base_ms: u64,
    /// Upper bound for the doubling reconnect delay.
    pub reconnect_max_ms: u64,
    /// Keep the greeted-peers ledger across restarts.
    pub persist_ledger: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            reconnect_base_ms: 2_000,
            reconnect_max_ms: 60_000,
            persist_ledger: false,
        }
    }
}

/// The greeting sent to every new peer, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnboardingConfig {
    pub steps: Vec<OutboundPayload>,
}

const MEDIA_BASE: &str = "https://raw.githubusercontent.com/JVSM-GAMES/Chatbot_Trafego/refs/heads/main";

impl Default for OnboardingConfig {
    fn default() -> Self {
        Self {
            steps: vec![
                OutboundPayload::image(
                    format!("{MEDIA_BASE}/450106494_1184806682764208_4902864346130955971_n.jpg"),
                    "🌿 Olá, seja bem-vindo ao *CG AGRO* 🌿",
                ),
                OutboundPayload::video(format!("{MEDIA_BASE}/Misturador.mp4"), "Misturador de rações!"),
                OutboundPayload::video(format!("{MEDIA_BASE}/Triturador.mp4"), "Triturador potente!"),
            ],
        }
    }
}
