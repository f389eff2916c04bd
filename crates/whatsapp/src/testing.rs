//! Shared fixtures for the lifecycle tests.

use std::sync::{Arc, Mutex};

use {
    async_trait::async_trait,
    firstcontact_channels::{
        ConnectError, InboundMessage, SessionCredential, testing::MockTransport,
    },
    tokio::{sync::mpsc, task::JoinHandle},
};

use crate::{
    backoff::ReconnectBackoff,
    credentials::{CredentialStore, StoreError},
    ledger::ContactLedger,
    manager::SessionManager,
    supervisor::{ReconnectSupervisor, SessionState},
};

#[derive(Default)]
pub(crate) struct MemoryCredentials {
    current: Mutex<Option<SessionCredential>>,
}

impl MemoryCredentials {
    pub(crate) fn is_empty(&self) -> bool {
        self.current.lock().unwrap().is_none()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentials {
    async fn load(&self) -> Result<Option<SessionCredential>, StoreError> {
        Ok(self.current.lock().unwrap().clone())
    }

    async fn save(&self, credential: &SessionCredential) -> Result<(), StoreError> {
        *self.current.lock().unwrap() = Some(credential.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.current.lock().unwrap().take();
        Ok(())
    }
}

pub(crate) struct Harness {
    pub transport: Arc<MockTransport>,
    pub manager: Arc<SessionManager>,
    pub credentials: Arc<MemoryCredentials>,
    pub inbound: mpsc::UnboundedReceiver<Vec<InboundMessage>>,
    inbound_tx: mpsc::UnboundedSender<Vec<InboundMessage>>,
    supervisor: Option<ReconnectSupervisor>,
    task: Option<JoinHandle<Result<(), ConnectError>>>,
}

impl Harness {
    /// Wired up but not running.
    pub fn idle() -> Self {
        let transport = MockTransport::new();
        let credentials = Arc::new(MemoryCredentials::default());
        let (manager, supervisor) = SessionManager::new(
            Arc::clone(&transport) as _,
            Arc::clone(&credentials) as _,
            Arc::new(ContactLedger::in_memory()),
            ReconnectBackoff::from_millis(1_000, 8_000),
        );
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        Self {
            transport,
            manager,
            credentials,
            inbound,
            inbound_tx,
            supervisor: Some(supervisor),
            task: None,
        }
    }

    pub fn idle_with_failures(n: usize) -> Self {
        let h = Self::idle();
        for _ in 0..n {
            h.transport
                .fail_next_connect(ConnectError::Unavailable("connection refused".into()));
        }
        h
    }

    pub fn idle_with_config_error() -> Self {
        let h = Self::idle();
        h.transport
            .fail_next_connect(ConnectError::Configuration("bad bridge url".into()));
        h
    }

    /// Spawn the supervisor and wait for its first connect.
    pub async fn run(mut self) -> Self {
        let supervisor = self.supervisor.take().unwrap();
        self.task = Some(tokio::spawn(supervisor.run(self.inbound_tx.clone())));
        self.transport.wait_for_connects(1).await;
        self
    }

    pub async fn start() -> Self {
        Self::idle().run().await
    }

    pub async fn run_to_completion(mut self) -> Result<(), ConnectError> {
        let supervisor = self.supervisor.take().unwrap();
        supervisor.run(self.inbound_tx.clone()).await
    }

    /// Hand the inbound stream to a consumer such as the dispatcher.
    pub fn take_inbound(&mut self) -> mpsc::UnboundedReceiver<Vec<InboundMessage>> {
        std::mem::replace(&mut self.inbound, mpsc::unbounded_channel().1)
    }

    pub async fn wait_for_state(&self, state: SessionState) {
        let mut rx = self.manager.subscribe();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    pub async fn wait_for_pairing(&self) {
        while self.manager.pairing_artifact().await.is_none() {
            tokio::task::yield_now().await;
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
