//! In-memory transport and outbound doubles for tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::sync::{mpsc, watch},
};

use crate::{
    error::{ConnectError, DeliveryError, LogoutError},
    message::{OutboundPayload, SessionCredential},
    peer::PeerId,
    plugin::{Connection, DisconnectReason, Outbound, Transport, TransportEvent, TransportLink},
};

#[derive(Default)]
struct Recorder {
    sent: Vec<(PeerId, OutboundPayload)>,
    fail_after: Option<usize>,
    delay: Option<Duration>,
}

impl Recorder {
    async fn record(
        this: &Mutex<Self>,
        to: &PeerId,
        payload: &OutboundPayload,
    ) -> Result<(), DeliveryError> {
        let delay = lock(this).delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut rec = lock(this);
        if rec.fail_after.is_some_and(|n| rec.sent.len() >= n) {
            return Err(DeliveryError::Rejected("injected failure".into()));
        }
        rec.sent.push((to.clone(), payload.clone()));
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── MockTransport ────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockState {
    credentials_seen: Vec<Option<SessionCredential>>,
    live: Option<mpsc::UnboundedSender<TransportEvent>>,
    connect_failures: VecDeque<ConnectError>,
    logout_failure: Option<String>,
    logouts: usize,
    closes: usize,
}

/// Transport whose connections are driven by the test through [`emit`].
///
/// [`emit`]: MockTransport::emit
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    recorder: Arc<Mutex<Recorder>>,
    connects: watch::Sender<usize>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(MockState::default())),
            recorder: Arc::new(Mutex::new(Recorder::default())),
            connects: watch::Sender::new(0),
        })
    }

    /// Push an event into the most recent connection.
    pub fn emit(&self, event: TransportEvent) -> bool {
        lock(&self.state)
            .live
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub fn connect_count(&self) -> usize {
        *self.connects.borrow()
    }

    /// Resolve once at least `n` connects have happened.
    pub async fn wait_for_connects(&self, n: usize) {
        let mut rx = self.connects.subscribe();
        let _ = rx.wait_for(|c| *c >= n).await;
    }

    pub fn credentials_seen(&self) -> Vec<Option<SessionCredential>> {
        lock(&self.state).credentials_seen.clone()
    }

    pub fn fail_next_connect(&self, err: ConnectError) {
        lock(&self.state).connect_failures.push_back(err);
    }

    pub fn fail_logout(&self, reason: &str) {
        lock(&self.state).logout_failure = Some(reason.into());
    }

    pub fn logout_count(&self) -> usize {
        lock(&self.state).logouts
    }

    /// Links torn down through [`TransportLink::close`].
    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }

    pub fn sent(&self) -> Vec<(PeerId, OutboundPayload)> {
        lock(&self.recorder).sent.clone()
    }

    /// Reject every send once `n` sends have succeeded.
    pub fn fail_sends_after(&self, n: usize) {
        lock(&self.recorder).fail_after = Some(n);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(
        &self,
        credential: Option<SessionCredential>,
    ) -> Result<Connection, ConnectError> {
        let result = {
            let mut state = lock(&self.state);
            state.credentials_seen.push(credential);
            match state.connect_failures.pop_front() {
                Some(err) => Err(err),
                None => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    state.live = Some(tx);
                    Ok(rx)
                },
            }
        };
        self.connects.send_modify(|c| *c += 1);

        let events = result?;
        Ok(Connection {
            link: Arc::new(MockLink {
                recorder: Arc::clone(&self.recorder),
                state: Arc::clone(&self.state),
                closed: Mutex::new(false),
            }),
            events,
        })
    }
}

struct MockLink {
    recorder: Arc<Mutex<Recorder>>,
    state: Arc<Mutex<MockState>>,
    closed: Mutex<bool>,
}

#[async_trait]
impl TransportLink for MockLink {
    async fn send(&self, to: &PeerId, payload: &OutboundPayload) -> Result<(), DeliveryError> {
        if *lock(&self.closed) {
            return Err(DeliveryError::NotConnected);
        }
        Recorder::record(&self.recorder, to, payload).await
    }

    async fn logout(&self) -> Result<(), LogoutError> {
        {
            let mut state = lock(&self.state);
            if let Some(reason) = state.logout_failure.take() {
                return Err(LogoutError::Failed(reason));
            }
            state.logouts += 1;
            if let Some(tx) = state.live.take() {
                let _ = tx.send(TransportEvent::Closed(DisconnectReason::LoggedOut));
            }
        }
        *lock(&self.closed) = true;
        Ok(())
    }

    async fn close(&self) {
        *lock(&self.closed) = true;
        lock(&self.state).closes += 1;
    }
}

// ── RecordingOutbound ────────────────────────────────────────────────────────

/// [`Outbound`] that records every send.
#[derive(Default)]
pub struct RecordingOutbound {
    recorder: Mutex<Recorder>,
}

impl RecordingOutbound {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every send first sleeps for `delay`, so concurrent callers interleave.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let out = Self::default();
        lock(&out.recorder).delay = Some(delay);
        Arc::new(out)
    }

    pub fn fail_after(&self, n: usize) {
        lock(&self.recorder).fail_after = Some(n);
    }

    pub fn sent(&self) -> Vec<(PeerId, OutboundPayload)> {
        lock(&self.recorder).sent.clone()
    }
}

#[async_trait]
impl Outbound for RecordingOutbound {
    async fn send_message(
        &self,
        to: &PeerId,
        payload: &OutboundPayload,
    ) -> Result<(), DeliveryError> {
        Recorder::record(&self.recorder, to, payload).await
    }
}
