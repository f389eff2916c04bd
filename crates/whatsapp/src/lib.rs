//! WhatsApp session lifecycle: one connection kept alive across reconnects,
//! its pairing code exposed for scanning, and a one-time greeting sent to
//! every new peer.
//!
//! Two transports are provided: the in-process `whatsapp-rust` client
//! (`NativeTransport`, behind the `native` feature) and a WebSocket bridge
//! to an external process ([`BridgeTransport`]).
//!
//! Data flow:
//! transport events → [`ConnectionSession`] → [`ReconnectSupervisor`] →
//! ([`SessionManager`] state, inbound channel) → [`OnboardingDispatcher`] →
//! [`SessionManager`] (as `Outbound`) → transport.

pub mod backoff;
pub mod bridge;
pub mod credentials;
pub mod dispatcher;
pub mod ledger;
pub mod manager;
#[cfg(feature = "native")]
pub mod native;
pub mod session;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use {
    backoff::ReconnectBackoff,
    bridge::BridgeTransport,
    credentials::{CredentialStore, SledCredentialStore, StoreError, open_database},
    dispatcher::{DispatchOutcome, OnboardingDispatcher, Skip},
    ledger::ContactLedger,
    manager::{PairError, SessionManager},
    session::{ConnectionSession, PairingArtifact, SessionEvent},
    supervisor::{ReconnectSupervisor, SessionState},
};

#[cfg(feature = "native")]
pub use native::NativeTransport;
