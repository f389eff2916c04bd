//! Reconnect state machine.
//!
//! ```text
//!   Disconnected ──start──▶ Connecting ──open──▶ Connected
//!        ▲                      │                    │
//!        └──── transient close (after backoff) ◀─────┘
//!
//!   any ──logged out (remote or operator)──▶ LoggedOut ──pair──▶ Connecting
//! ```
//!
//! At most one [`ConnectionSession`] is live at a time, and no new one is
//! started while the state is `LoggedOut`.

use std::{sync::Arc, time::Duration};

use {
    firstcontact_channels::{ConnectError, DisconnectReason, InboundMessage, Transport},
    serde::Serialize,
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{
    backoff::ReconnectBackoff,
    manager::SessionManager,
    session::{ConnectionSession, SessionEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    LoggedOut,
}

/// Requests from the [`SessionManager`] to the supervisor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    LoggedOut,
    Pair,
}

enum Exit {
    Disconnected(DisconnectReason),
    LoggedOut,
    Shutdown,
}

enum Wait {
    Elapsed,
    LoggedOut,
    Shutdown,
}

/// Owns the connect / wait / reconnect loop for one [`SessionManager`].
pub struct ReconnectSupervisor {
    manager: Arc<SessionManager>,
    transport: Arc<dyn Transport>,
    backoff: ReconnectBackoff,
    control: mpsc::UnboundedReceiver<Control>,
}

impl ReconnectSupervisor {
    pub(crate) fn new(
        manager: Arc<SessionManager>,
        transport: Arc<dyn Transport>,
        backoff: ReconnectBackoff,
        control: mpsc::UnboundedReceiver<Control>,
    ) -> Self {
        Self {
            manager,
            transport,
            backoff,
            control,
        }
    }

    /// Keep a session alive until shutdown. Inbound batches are forwarded to
    /// `inbound` in arrival order.
    ///
    /// Returns an error only when the transport is misconfigured; retrying
    /// would fail the same way.
    pub async fn run(
        mut self,
        inbound: mpsc::UnboundedSender<Vec<InboundMessage>>,
    ) -> Result<(), ConnectError> {
        info!(transport = self.transport.name(), "session supervisor started");
        loop {
            if self.manager.state() == SessionState::LoggedOut && !self.wait_for_pair().await {
                return Ok(());
            }
            self.manager.set_state(SessionState::Connecting);

            let credential = self.manager.load_credential().await;
            let (session, mut events) =
                ConnectionSession::start(self.transport.as_ref(), credential).await?;
            if !self.manager.install(&session).await {
                session.close().await;
                continue;
            }
            debug!(session = session.id(), "session installed");

            let exit = self.drive(&mut events, &inbound).await;
            self.manager.release(&session).await;
            session.close().await;

            match exit {
                Exit::Shutdown => return Ok(()),
                Exit::LoggedOut => {},
                Exit::Disconnected(DisconnectReason::LoggedOut) => {
                    warn!(session = session.id(), "device logged out remotely; waiting for a new pairing");
                    self.manager.enter_logged_out().await;
                },
                Exit::Disconnected(DisconnectReason::Transient(detail)) => {
                    if !self.manager.set_state(SessionState::Disconnected) {
                        continue;
                    }
                    let delay = self.backoff.next_delay();
                    info!(
                        session = session.id(),
                        reason = %detail,
                        delay_ms = delay.as_millis() as u64,
                        "connection lost, reconnecting"
                    );
                    match self.wait(delay).await {
                        Wait::Elapsed | Wait::LoggedOut => {},
                        Wait::Shutdown => return Ok(()),
                    }
                },
            }
        }
    }

    /// Handle one session's events until it ends.
    async fn drive(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        inbound: &mpsc::UnboundedSender<Vec<InboundMessage>>,
    ) -> Exit {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        return Exit::Disconnected(DisconnectReason::Transient(
                            "session event stream closed".into(),
                        ));
                    };
                    match event {
                        SessionEvent::PairingNeeded(artifact) => {
                            info!("pairing code available, scan it from /qr");
                            self.manager.set_pairing(Some(artifact)).await;
                        },
                        SessionEvent::Connected => {
                            self.backoff.reset();
                            self.manager.set_pairing(None).await;
                            self.manager.set_state(SessionState::Connected);
                            info!("connected");
                        },
                        SessionEvent::CredentialsUpdated(credential) => {
                            self.manager.save_credential(&credential).await;
                        },
                        SessionEvent::Inbound(batch) => {
                            debug!(count = batch.len(), "inbound batch");
                            if inbound.send(batch).is_err() {
                                warn!("dispatcher gone, dropping inbound batch");
                            }
                        },
                        SessionEvent::Disconnected(reason) => return Exit::Disconnected(reason),
                    }
                },
                control = self.control.recv() => match control {
                    Some(Control::LoggedOut) => return Exit::LoggedOut,
                    Some(Control::Pair) => debug!("pair request ignored, session already active"),
                    None => return Exit::Shutdown,
                },
            }
        }
    }

    /// Sleep for `delay` unless the operator logs out first.
    async fn wait(&mut self, delay: Duration) -> Wait {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return Wait::Elapsed,
                control = self.control.recv() => match control {
                    Some(Control::LoggedOut) => return Wait::LoggedOut,
                    Some(Control::Pair) => {},
                    None => return Wait::Shutdown,
                },
            }
        }
    }

    /// Park until a pair request arrives. Returns `false` on shutdown.
    async fn wait_for_pair(&mut self) -> bool {
        info!("logged out, waiting for a pair request");
        loop {
            match self.control.recv().await {
                Some(Control::Pair) => {
                    self.backoff.reset();
                    self.manager.leave_logged_out();
                    info!("starting a new pairing cycle");
                    return true;
                },
                Some(Control::LoggedOut) => {},
                None => return false,
            }
        }
    }
}
