use std::sync::Arc;

use {async_trait::async_trait, tokio::sync::mpsc};

use crate::{
    error::{ConnectError, DeliveryError, LogoutError},
    message::{InboundMessage, OutboundPayload, SessionCredential},
    peer::PeerId,
};

/// Why a transport connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The device was deauthorized from the phone. Terminal.
    LoggedOut,
    /// Network blips, server restarts, credential rotation.
    Transient(String),
}

impl DisconnectReason {
    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

/// Raw signal emitted by a transport connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A fresh pairing payload (QR contents) is available.
    PairingCode(String),
    Open,
    Closed(DisconnectReason),
    CredentialsUpdated(SessionCredential),
    Messages(Vec<InboundMessage>),
}

/// An open transport connection and its event stream.
pub struct Connection {
    pub link: Arc<dyn TransportLink>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens connections to the messaging network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport identifier (e.g. "bridge").
    fn name(&self) -> &str;

    /// Connect, resuming from `credential` when one is stored.
    async fn connect(&self, credential: Option<SessionCredential>)
    -> Result<Connection, ConnectError>;
}

/// Operations on one open connection.
#[async_trait]
pub trait TransportLink: Send + Sync {
    async fn send(&self, to: &PeerId, payload: &OutboundPayload) -> Result<(), DeliveryError>;

    /// Deauthorize this device.
    async fn logout(&self) -> Result<(), LogoutError>;

    /// Drop the connection without deauthorizing.
    async fn close(&self);
}

/// Send messages through whatever session is currently live.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_message(&self, to: &PeerId, payload: &OutboundPayload)
    -> Result<(), DeliveryError>;
}
