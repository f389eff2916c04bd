//! Transport seam for the messaging session.
//!
//! A transport (the WhatsApp bridge, or the in-memory one used in tests)
//! implements [`Transport`] to open a [`TransportLink`] plus a stream of raw
//! [`TransportEvent`]s. Everything above this crate only talks to these
//! traits and types.

pub mod error;
pub mod message;
pub mod peer;
pub mod plugin;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use {
    error::{ConnectError, DeliveryError, LogoutError},
    message::{InboundMessage, MediaKind, OutboundPayload, SessionCredential},
    peer::{PeerId, PeerKind},
    plugin::{
        Connection, DisconnectReason, Outbound, Transport, TransportEvent, TransportLink,
    },
};
