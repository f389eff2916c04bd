use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use {
    firstcontact_channels::{
        ConnectError, Connection, DeliveryError, DisconnectReason, InboundMessage, LogoutError,
        OutboundPayload, PeerId, SessionCredential, Transport, TransportEvent, TransportLink,
    },
    serde::Serialize,
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{debug, info, warn},
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Scannable pairing payload. Valid until superseded or until the session
/// connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingArtifact {
    pub code: String,
    pub issued_at_ms: u64,
}

impl PairingArtifact {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            issued_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

/// Lifecycle notifications from one [`ConnectionSession`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PairingNeeded(PairingArtifact),
    /// Fired once per successful handshake.
    Connected,
    /// Fired once; nothing follows it.
    Disconnected(DisconnectReason),
    /// Must be persisted before the next event is handled.
    CredentialsUpdated(SessionCredential),
    Inbound(Vec<InboundMessage>),
}

/// One transport connection and its translated event stream.
pub struct ConnectionSession {
    id: u64,
    link: Option<Arc<dyn TransportLink>>,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSession {
    /// Connect through `transport`, resuming from `credential` if present.
    ///
    /// Only configuration errors are returned. Any other connect failure
    /// yields a session with no link whose event stream reports a transient
    /// disconnect.
    pub async fn start(
        transport: &dyn Transport,
        credential: Option<SessionCredential>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>), ConnectError> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let resuming = credential.is_some();

        match transport.connect(credential).await {
            Ok(Connection { link, events }) => {
                debug!(session = id, transport = transport.name(), resuming, "transport connected");
                let session = Arc::new(Self {
                    id,
                    link: Some(link),
                    closed: AtomicBool::new(false),
                    pump: Mutex::new(None),
                });
                let handle = tokio::spawn(pump_events(id, events, tx));
                *session.lock_pump() = Some(handle);
                Ok((session, rx))
            },
            Err(ConnectError::Unavailable(detail)) => {
                warn!(session = id, error = %detail, "transport connect failed");
                let _ = tx.send(SessionEvent::Disconnected(DisconnectReason::Transient(detail)));
                Ok((
                    Arc::new(Self {
                        id,
                        link: None,
                        closed: AtomicBool::new(true),
                        pump: Mutex::new(None),
                    }),
                    rx,
                ))
            },
            Err(e @ ConnectError::Configuration(_)) => Err(e),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn send_message(
        &self,
        to: &PeerId,
        payload: &OutboundPayload,
    ) -> Result<(), DeliveryError> {
        let link = match &self.link {
            Some(link) if !self.is_closed() => link,
            _ => return Err(DeliveryError::NotConnected),
        };
        link.send(to, payload).await
    }

    /// Deauthorize the device. On success the session is closed for good,
    /// its link is torn down and it stops emitting events.
    pub async fn logout(&self) -> Result<(), LogoutError> {
        let link = match &self.link {
            Some(link) if !self.is_closed() => link,
            _ => return Err(LogoutError::NotConnected),
        };
        link.logout().await?;
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.stop_pump();
            link.close().await;
        }
        info!(session = self.id, "session logged out");
        Ok(())
    }

    /// Drop the connection without deauthorizing.
    pub async fn close(&self) {
        let was_open = !self.closed.swap(true, Ordering::AcqRel);
        self.stop_pump();
        if was_open && let Some(link) = &self.link {
            link.close().await;
        }
    }

    fn stop_pump(&self) {
        if let Some(handle) = self.lock_pump().take() {
            handle.abort();
        }
    }

    fn lock_pump(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Translate raw transport events, enforcing once-only `Connected` and
/// `Disconnected`.
async fn pump_events(
    id: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    tx: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut connected = false;
    while let Some(event) = events.recv().await {
        let out = match event {
            TransportEvent::PairingCode(code) => {
                SessionEvent::PairingNeeded(PairingArtifact::new(code))
            },
            TransportEvent::Open => {
                if connected {
                    debug!(session = id, "ignoring repeated open");
                    continue;
                }
                connected = true;
                SessionEvent::Connected
            },
            TransportEvent::Closed(reason) => {
                let _ = tx.send(SessionEvent::Disconnected(reason));
                return;
            },
            TransportEvent::CredentialsUpdated(cred) => SessionEvent::CredentialsUpdated(cred),
            TransportEvent::Messages(batch) if batch.is_empty() => continue,
            TransportEvent::Messages(batch) => SessionEvent::Inbound(batch),
        };
        if tx.send(out).is_err() {
            return;
        }
    }
    let _ = tx.send(SessionEvent::Disconnected(DisconnectReason::Transient(
        "transport event stream ended".into(),
    )));
}
