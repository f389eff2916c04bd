use std::sync::Arc;

use {
    firstcontact_channels::{DeliveryError, InboundMessage, Outbound, OutboundPayload, PeerKind},
    firstcontact_config::SettingsStore,
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::ledger::ContactLedger;

/// Why an inbound message did not trigger the greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    FromSelf,
    NoContent,
    Broadcast,
    GroupsDisabled,
    Blocked,
    AlreadyGreeted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Skipped(Skip),
    /// The whole sequence went out.
    Greeted { sent: usize },
    /// A send failed after `sent` successes. The peer stays greeted.
    Aborted { sent: usize, error: DeliveryError },
}

/// Sends the onboarding sequence to each peer's first eligible message.
#[derive(Clone)]
pub struct OnboardingDispatcher {
    ledger: Arc<ContactLedger>,
    settings: Arc<SettingsStore>,
    steps: Arc<[OutboundPayload]>,
    outbound: Arc<dyn Outbound>,
}

impl OnboardingDispatcher {
    pub fn new(
        ledger: Arc<ContactLedger>,
        settings: Arc<SettingsStore>,
        steps: Vec<OutboundPayload>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        Self {
            ledger,
            settings,
            steps: steps.into(),
            outbound,
        }
    }

    /// Process one inbound message.
    ///
    /// The peer is marked in the ledger before the first send, so concurrent
    /// calls for the same peer produce at most one sequence.
    pub async fn handle(&self, message: &InboundMessage) -> DispatchOutcome {
        if let Err(skip) = self.screen(message) {
            return DispatchOutcome::Skipped(skip);
        }
        let peer = &message.from;
        if !self.ledger.mark_greeted(peer) {
            return DispatchOutcome::Skipped(Skip::AlreadyGreeted);
        }

        info!(peer = %peer, steps = self.steps.len(), "greeting new contact");
        for (sent, step) in self.steps.iter().enumerate() {
            if let Err(error) = self.outbound.send_message(peer, step).await {
                warn!(peer = %peer, step = sent, error = %error, "onboarding aborted");
                return DispatchOutcome::Aborted { sent, error };
            }
        }
        DispatchOutcome::Greeted {
            sent: self.steps.len(),
        }
    }

    fn screen(&self, message: &InboundMessage) -> Result<(), Skip> {
        if message.from_me {
            return Err(Skip::FromSelf);
        }
        if message.content().is_none() {
            return Err(Skip::NoContent);
        }

        let settings = self.settings.get();
        match message.from.kind() {
            PeerKind::Broadcast => return Err(Skip::Broadcast),
            PeerKind::Group if !settings.allow_groups => return Err(Skip::GroupsDisabled),
            PeerKind::Group | PeerKind::Individual => {},
        }
        if settings.is_blocked(message.from.number()) {
            return Err(Skip::Blocked);
        }

        if self.ledger.has_been_greeted(&message.from) {
            return Err(Skip::AlreadyGreeted);
        }
        Ok(())
    }

    /// Consume inbound batches until the channel closes. Batches and the
    /// messages inside them are handled strictly in arrival order.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<Vec<InboundMessage>>) {
        while let Some(batch) = inbound.recv().await {
            for message in &batch {
                let outcome = self.handle(message).await;
                debug!(peer = %message.from, ?outcome, "inbound message handled");
            }
        }
        debug!("inbound channel closed, dispatcher stopping");
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        firstcontact_channels::{MediaKind, PeerId, TransportEvent, testing::RecordingOutbound},
        firstcontact_config::{OnboardingConfig, SettingsPatch},
        std::time::Duration,
    };

    use crate::{supervisor::SessionState, testing::Harness};

    const PEER: &str = "5511999999999@s.whatsapp.net";

    struct Fixture {
        _dir: tempfile::TempDir,
        ledger: Arc<ContactLedger>,
        settings: Arc<SettingsStore>,
        outbound: Arc<RecordingOutbound>,
        dispatcher: OnboardingDispatcher,
    }

    fn fixture(outbound: Arc<RecordingOutbound>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsStore::load(dir.path().join("settings.toml")).unwrap());
        let ledger = Arc::new(ContactLedger::in_memory());
        let dispatcher = OnboardingDispatcher::new(
            Arc::clone(&ledger),
            Arc::clone(&settings),
            OnboardingConfig::default().steps,
            Arc::clone(&outbound) as Arc<dyn Outbound>,
        );
        Fixture {
            _dir: dir,
            ledger,
            settings,
            outbound,
            dispatcher,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_message_gets_image_then_videos_in_order() {
        let f = fixture(RecordingOutbound::with_delay(Duration::from_millis(20)));
        let message = InboundMessage::text(PEER, "Olá, quero saber mais");

        let dispatcher = f.dispatcher.clone();
        let task = tokio::spawn(async move { dispatcher.handle(&message).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(f.ledger.has_been_greeted(&PeerId::from(PEER)));
        assert!(f.outbound.sent().is_empty());

        assert_eq!(task.await.unwrap(), DispatchOutcome::Greeted { sent: 3 });
        let sent = f.outbound.sent();
        let expected = OnboardingConfig::default().steps;
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(to, _)| to.as_str() == PEER));
        assert_eq!(sent[0].1.kind, MediaKind::Image);
        assert_eq!(sent[0].1.caption, expected[0].caption);
        assert_eq!(sent[1].1, expected[1]);
        assert_eq!(sent[2].1, expected[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_from_one_peer_is_greeted_once() {
        let f = fixture(RecordingOutbound::with_delay(Duration::from_millis(10)));
        let handles: Vec<_> = (0..5)
            .map(|i| {
                let dispatcher = f.dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher
                        .handle(&InboundMessage::text(PEER, format!("msg {i}")))
                        .await
                })
            })
            .collect();

        let mut greeted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                DispatchOutcome::Greeted { .. } => greeted += 1,
                DispatchOutcome::Skipped(Skip::AlreadyGreeted) => {},
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(greeted, 1);
        assert_eq!(f.outbound.sent().len(), 3);
    }

    #[tokio::test]
    async fn echoes_and_empty_messages_are_ignored() {
        let f = fixture(RecordingOutbound::new());
        let mut echo = InboundMessage::text(PEER, "hello");
        echo.from_me = true;
        let blank = InboundMessage::text(PEER, "   ");

        assert_eq!(
            f.dispatcher.handle(&echo).await,
            DispatchOutcome::Skipped(Skip::FromSelf)
        );
        assert_eq!(
            f.dispatcher.handle(&blank).await,
            DispatchOutcome::Skipped(Skip::NoContent)
        );
        assert!(f.ledger.is_empty());
    }

    #[tokio::test]
    async fn caption_counts_as_content() {
        let f = fixture(RecordingOutbound::new());
        let message = InboundMessage {
            from: PEER.into(),
            from_me: false,
            text: None,
            caption: Some("foto do produto".into()),
        };
        assert_eq!(
            f.dispatcher.handle(&message).await,
            DispatchOutcome::Greeted { sent: 3 }
        );
    }

    #[tokio::test]
    async fn groups_follow_settings() {
        let f = fixture(RecordingOutbound::new());
        let group = InboundMessage::text("120363025246125486@g.us", "oi pessoal");

        assert_eq!(
            f.dispatcher.handle(&group).await,
            DispatchOutcome::Skipped(Skip::GroupsDisabled)
        );
        f.settings
            .update(SettingsPatch {
                allow_groups: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            f.dispatcher.handle(&group).await,
            DispatchOutcome::Greeted { sent: 3 }
        );
    }

    #[tokio::test]
    async fn status_broadcasts_are_ignored() {
        let f = fixture(RecordingOutbound::new());
        let status = InboundMessage::text("status@broadcast", "new status");
        assert_eq!(
            f.dispatcher.handle(&status).await,
            DispatchOutcome::Skipped(Skip::Broadcast)
        );
    }

    #[tokio::test]
    async fn blocked_number_is_never_greeted() {
        let f = fixture(RecordingOutbound::new());
        f.settings
            .update(SettingsPatch {
                blocked_numbers: Some(vec!["+55 11 99999-9999".into()]),
                ..Default::default()
            })
            .unwrap();

        for _ in 0..2 {
            assert_eq!(
                f.dispatcher
                    .handle(&InboundMessage::text("5511999999999:12@s.whatsapp.net", "oi"))
                    .await,
                DispatchOutcome::Skipped(Skip::Blocked)
            );
        }
        f.ledger.reset();
        assert_eq!(
            f.dispatcher.handle(&InboundMessage::text(PEER, "oi")).await,
            DispatchOutcome::Skipped(Skip::Blocked)
        );
        assert!(f.outbound.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_send_aborts_and_keeps_peer_marked() {
        let f = fixture(RecordingOutbound::new());
        f.outbound.fail_after(1);

        let outcome = f.dispatcher.handle(&InboundMessage::text(PEER, "oi")).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Aborted {
                sent: 1,
                error: DeliveryError::Rejected("injected failure".into()),
            }
        );
        assert!(f.ledger.has_been_greeted(&PeerId::from(PEER)));
        assert_eq!(
            f.dispatcher.handle(&InboundMessage::text(PEER, "de novo")).await,
            DispatchOutcome::Skipped(Skip::AlreadyGreeted)
        );
        assert_eq!(f.outbound.sent().len(), 1);
    }

    #[tokio::test]
    async fn run_handles_batches_in_order() {
        let f = fixture(RecordingOutbound::new());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(vec![
            InboundMessage::text("1@s.whatsapp.net", "a"),
            InboundMessage::text("2@s.whatsapp.net", "b"),
        ])
        .unwrap();
        tx.send(vec![InboundMessage::text("1@s.whatsapp.net", "again")])
            .unwrap();
        drop(tx);

        f.dispatcher.clone().run(rx).await;

        let recipients: Vec<String> = f
            .outbound
            .sent()
            .into_iter()
            .map(|(to, _)| to.to_string())
            .collect();
        assert_eq!(recipients.len(), 6);
        assert!(recipients[..3].iter().all(|r| r == "1@s.whatsapp.net"));
        assert!(recipients[3..].iter().all(|r| r == "2@s.whatsapp.net"));
    }

    async fn wait_for_sends(h: &Harness, n: usize) {
        while h.transport.sent().len() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn peer_is_greeted_again_after_logout_and_repair() {
        let mut h = Harness::start().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsStore::load(dir.path().join("settings.toml")).unwrap());
        let steps = OnboardingConfig::default().steps;
        let dispatcher = OnboardingDispatcher::new(
            Arc::clone(h.manager.ledger()),
            settings,
            steps.clone(),
            Arc::clone(&h.manager) as Arc<dyn Outbound>,
        );
        tokio::spawn(dispatcher.run(h.take_inbound()));

        h.transport.emit(TransportEvent::Open);
        h.wait_for_state(SessionState::Connected).await;
        h.transport
            .emit(TransportEvent::Messages(vec![InboundMessage::text(PEER, "oi")]));
        wait_for_sends(&h, 3).await;

        h.transport
            .emit(TransportEvent::Messages(vec![InboundMessage::text(PEER, "oi de novo")]));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.transport.sent().len(), 3);

        h.manager.logout().await.unwrap();
        h.manager.pair().unwrap();
        h.transport.wait_for_connects(2).await;
        h.transport.emit(TransportEvent::Open);
        h.wait_for_state(SessionState::Connected).await;

        h.transport
            .emit(TransportEvent::Messages(vec![InboundMessage::text(PEER, "voltei")]));
        wait_for_sends(&h, 6).await;

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 6);
        assert!(sent.iter().all(|(to, _)| to.as_str() == PEER));
        let second: Vec<_> = sent[3..].iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(second, steps);
    }
}
