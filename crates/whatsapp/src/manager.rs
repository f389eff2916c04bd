use std::sync::Arc;

use {
    async_trait::async_trait,
    firstcontact_channels::{
        DeliveryError, LogoutError, Outbound, OutboundPayload, PeerId, SessionCredential,
        Transport,
    },
    thiserror::Error,
    tokio::sync::{RwLock, mpsc, watch},
    tracing::{error, info, warn},
};

use crate::{
    backoff::ReconnectBackoff,
    credentials::CredentialStore,
    ledger::ContactLedger,
    session::{ConnectionSession, PairingArtifact},
    supervisor::{Control, ReconnectSupervisor, SessionState},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairError {
    #[error("session is {0:?}; log out before pairing again")]
    AlreadyActive(SessionState),
    #[error("reconnect supervisor is not running")]
    SupervisorStopped,
}

/// Owns the live session slot, the pairing artifact, the greeted-peer ledger
/// and the lifecycle state. Shared via `Arc` with the HTTP surface and the
/// dispatcher; only the [`ReconnectSupervisor`] installs sessions.
pub struct SessionManager {
    credentials: Arc<dyn CredentialStore>,
    ledger: Arc<ContactLedger>,
    session: RwLock<Option<Arc<ConnectionSession>>>,
    pairing: RwLock<Option<PairingArtifact>>,
    state: watch::Sender<SessionState>,
    control: mpsc::UnboundedSender<Control>,
}

impl SessionManager {
    /// Build the manager and the supervisor that drives it. Nothing connects
    /// until [`ReconnectSupervisor::run`] is awaited.
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        ledger: Arc<ContactLedger>,
        backoff: ReconnectBackoff,
    ) -> (Arc<Self>, ReconnectSupervisor) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            credentials,
            ledger,
            session: RwLock::new(None),
            pairing: RwLock::new(None),
            state: watch::Sender::new(SessionState::Disconnected),
            control: control_tx,
        });
        let supervisor =
            ReconnectSupervisor::new(Arc::clone(&manager), transport, backoff, control_rx);
        (manager, supervisor)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn ledger(&self) -> &Arc<ContactLedger> {
        &self.ledger
    }

    /// Latest pairing code, if one is waiting to be scanned.
    pub async fn pairing_artifact(&self) -> Option<PairingArtifact> {
        self.pairing.read().await.clone()
    }

    pub async fn current_session(&self) -> Option<Arc<ConnectionSession>> {
        self.session.read().await.clone()
    }

    /// Deauthorize the device and stop reconnecting.
    ///
    /// On success the session slot is emptied, the ledger, pairing code and
    /// stored credential are cleared and the state becomes
    /// [`SessionState::LoggedOut`]. Between connections (a reconnect wait or
    /// a handshake in progress) there is no link to deauthorize, so only the
    /// local reset happens. A transport failure is returned as-is and nothing
    /// local is reset.
    pub async fn logout(&self) -> Result<(), LogoutError> {
        match self.current_session().await {
            Some(session) => {
                if let Err(e) = session.logout().await {
                    error!(error = %e, "logout failed");
                    return Err(e);
                }
                info!("logged out by operator");
            },
            None if self.state() == SessionState::LoggedOut => {
                return Err(LogoutError::NotConnected);
            },
            None => {
                warn!(state = ?self.state(), "no live session to deauthorize, forgetting the device locally");
            },
        }
        self.enter_logged_out().await;
        let _ = self.control.send(Control::LoggedOut);
        Ok(())
    }

    /// Leave [`SessionState::LoggedOut`] and start a fresh pairing cycle.
    pub fn pair(&self) -> Result<(), PairError> {
        let state = self.state();
        if state != SessionState::LoggedOut {
            return Err(PairError::AlreadyActive(state));
        }
        self.control
            .send(Control::Pair)
            .map_err(|_| PairError::SupervisorStopped)
    }

    // ── Supervisor side ─────────────────────────────────────────────────────

    /// Move to `next` unless logged out. Returns whether the state changed.
    pub(crate) fn set_state(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == SessionState::LoggedOut || *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    pub(crate) fn leave_logged_out(&self) {
        self.state.send_replace(SessionState::Connecting);
    }

    /// Put `session` in the slot. Refused once logged out.
    pub(crate) async fn install(&self, session: &Arc<ConnectionSession>) -> bool {
        let mut slot = self.session.write().await;
        if self.state() == SessionState::LoggedOut {
            return false;
        }
        *slot = Some(Arc::clone(session));
        true
    }

    /// Empty the slot if it still holds `session`.
    pub(crate) async fn release(&self, session: &Arc<ConnectionSession>) {
        let mut slot = self.session.write().await;
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *slot = None;
        }
    }

    pub(crate) async fn set_pairing(&self, artifact: Option<PairingArtifact>) {
        *self.pairing.write().await = artifact;
    }

    pub(crate) async fn enter_logged_out(&self) {
        self.state.send_replace(SessionState::LoggedOut);
        self.session.write().await.take();
        self.set_pairing(None).await;
        self.ledger.reset();
        if let Err(e) = self.credentials.clear().await {
            warn!(error = %e, "failed to clear stored credential");
        }
    }

    pub(crate) async fn load_credential(&self) -> Option<SessionCredential> {
        match self.credentials.load().await {
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "stored credential unreadable, pairing from scratch");
                None
            },
        }
    }

    pub(crate) async fn save_credential(&self, credential: &SessionCredential) {
        if let Err(e) = self.credentials.save(credential).await {
            error!(error = %e, "failed to persist session credential; next reconnect may need a new pairing");
        }
    }
}

#[async_trait]
impl Outbound for SessionManager {
    async fn send_message(
        &self,
        to: &PeerId,
        payload: &OutboundPayload,
    ) -> Result<(), DeliveryError> {
        let session = self
            .current_session()
            .await
            .ok_or(DeliveryError::NotConnected)?;
        session.send_message(to, payload).await
    }
}
