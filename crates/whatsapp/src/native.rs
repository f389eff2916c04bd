//! In-process WhatsApp Web client built on `whatsapp-rust`.
//!
//! Device keys live in a SQLite store under the data directory. The
//! [`SessionCredential`] handed to the manager only names that store, so a
//! connect without one wipes the store and starts a fresh pairing.

use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use {
    async_trait::async_trait,
    firstcontact_channels::{
        ConnectError, Connection, DeliveryError, DisconnectReason, InboundMessage, LogoutError,
        MediaKind, OutboundPayload, PeerId, SessionCredential, Transport, TransportEvent,
        TransportLink,
    },
    serde_json::json,
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{debug, info},
    wacore::{download::MediaType, types::events::Event, types::message::MessageInfo},
    wacore_binary::jid::Jid,
    waproto::whatsapp as wa,
    whatsapp_rust::{bot::Bot, client::Client, store::SqliteStore, upload::UploadResponse},
    whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory,
    whatsapp_rust_ureq_http_client::UreqHttpClient,
};

const STORE_FILE: &str = "whatsapp.db";

/// Opens a `whatsapp-rust` client per connection.
pub struct NativeTransport {
    store_path: PathBuf,
    timeout: Duration,
    http: reqwest::Client,
}

impl NativeTransport {
    pub fn new(data_dir: &Path, timeout: Duration) -> Self {
        Self {
            store_path: data_dir.join(STORE_FILE),
            timeout,
            http: reqwest::Client::new(),
        }
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }
}

/// The database and the side files SQLite keeps next to it.
fn store_files(path: &Path) -> Vec<PathBuf> {
    ["", "-wal", "-shm", "-journal"]
        .into_iter()
        .map(|suffix| {
            let mut name = path.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        })
        .collect()
}

fn wipe_store(path: &Path) -> io::Result<()> {
    for file in store_files(path) {
        match std::fs::remove_file(&file) {
            Ok(()) => debug!(path = %file.display(), "removed device store file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn store_marker(path: &str) -> SessionCredential {
    SessionCredential(json!({ "store": path }))
}

// ── Event translation ────────────────────────────────────────────────────────

fn translate(event: Event, store: &str) -> Option<TransportEvent> {
    match event {
        Event::PairingQrCode { code, .. } => Some(TransportEvent::PairingCode(code)),
        Event::PairSuccess(_) => Some(TransportEvent::CredentialsUpdated(store_marker(store))),
        Event::Connected(_) => Some(TransportEvent::Open),
        Event::LoggedOut(_) => Some(TransportEvent::Closed(DisconnectReason::LoggedOut)),
        Event::Disconnected(_) => Some(TransportEvent::Closed(DisconnectReason::Transient(
            "disconnected from server".into(),
        ))),
        Event::StreamReplaced(_) => Some(TransportEvent::Closed(DisconnectReason::Transient(
            "stream replaced by another client".into(),
        ))),
        Event::Message(message, info) => Some(TransportEvent::Messages(vec![inbound(
            &message, &info,
        )])),
        _ => None,
    }
}

fn inbound(message: &wa::Message, info: &MessageInfo) -> InboundMessage {
    InboundMessage {
        from: PeerId::from(info.source.chat.to_string()),
        from_me: info.source.is_from_me,
        text: message_text(message),
        caption: media_caption(message),
    }
}

fn message_text(message: &wa::Message) -> Option<String> {
    message.conversation.clone().or_else(|| {
        message
            .extended_text_message
            .as_ref()
            .and_then(|m| m.text.clone())
    })
}

fn media_caption(message: &wa::Message) -> Option<String> {
    message
        .image_message
        .as_ref()
        .and_then(|m| m.caption.clone())
        .or_else(|| message.video_message.as_ref().and_then(|m| m.caption.clone()))
}

// ── Outbound media ───────────────────────────────────────────────────────────

fn default_mimetype(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "image/jpeg",
        MediaKind::Video => "video/mp4",
    }
}

fn media_message(payload: &OutboundPayload, mimetype: String, upload: UploadResponse) -> wa::Message {
    match payload.kind {
        MediaKind::Image => wa::Message {
            image_message: Some(Box::new(wa::message::ImageMessage {
                url: Some(upload.url),
                direct_path: Some(upload.direct_path),
                media_key: Some(upload.media_key),
                file_enc_sha256: Some(upload.file_enc_sha256),
                file_sha256: Some(upload.file_sha256),
                file_length: Some(upload.file_length),
                mimetype: Some(mimetype),
                caption: payload.caption.clone(),
                ..Default::default()
            })),
            ..Default::default()
        },
        MediaKind::Video => wa::Message {
            video_message: Some(Box::new(wa::message::VideoMessage {
                url: Some(upload.url),
                direct_path: Some(upload.direct_path),
                media_key: Some(upload.media_key),
                file_enc_sha256: Some(upload.file_enc_sha256),
                file_sha256: Some(upload.file_sha256),
                file_length: Some(upload.file_length),
                mimetype: Some(mimetype),
                caption: payload.caption.clone(),
                ..Default::default()
            })),
            ..Default::default()
        },
    }
}

#[async_trait]
impl Transport for NativeTransport {
    fn name(&self) -> &str {
        "native"
    }

    async fn connect(
        &self,
        credential: Option<SessionCredential>,
    ) -> Result<Connection, ConnectError> {
        let store_err = |e: io::Error| {
            ConnectError::Configuration(format!(
                "device store {} unusable: {e}",
                self.store_path.display()
            ))
        };
        if credential.is_none() {
            wipe_store(&self.store_path).map_err(store_err)?;
        }
        if let Some(dir) = self.store_path.parent() {
            std::fs::create_dir_all(dir).map_err(store_err)?;
        }
        let store = self.store_path.to_string_lossy().into_owned();
        let backend = SqliteStore::new(&store).await.map_err(|e| {
            ConnectError::Configuration(format!("cannot open device store {store}: {e}"))
        })?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let handler_tx = events_tx.clone();
        let marker = store.clone();
        let build = Bot::builder()
            .with_backend(Arc::new(backend))
            .with_transport_factory(TokioWebSocketTransportFactory::new())
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, _client| {
                let tx = handler_tx.clone();
                let marker = marker.clone();
                async move {
                    if let Some(event) = translate(event, &marker) {
                        let _ = tx.send(event);
                    }
                }
            })
            .build();
        let mut bot = tokio::time::timeout(self.timeout, build)
            .await
            .map_err(|_| ConnectError::Unavailable("client setup timed out".into()))?
            .map_err(|e| ConnectError::Unavailable(format!("client setup failed: {e}")))?;
        let client = bot.client();
        let runner = bot
            .run()
            .await
            .map_err(|e| ConnectError::Unavailable(format!("client failed to start: {e}")))?;
        debug!(store = %store, resuming = credential.is_some(), "whatsapp client started");

        let watcher = tokio::spawn(async move {
            let _bot = bot;
            let reason = match runner.await {
                Ok(_) => "client stopped".to_string(),
                Err(e) => format!("client task failed: {e}"),
            };
            let _ = events_tx.send(TransportEvent::Closed(DisconnectReason::Transient(reason)));
        });

        let link = Arc::new(NativeLink {
            client,
            http: self.http.clone(),
            timeout: self.timeout,
            store_path: self.store_path.clone(),
            watcher: StdMutex::new(Some(watcher)),
        });
        Ok(Connection { link, events })
    }
}

struct NativeLink {
    client: Arc<Client>,
    http: reqwest::Client,
    timeout: Duration,
    store_path: PathBuf,
    watcher: StdMutex<Option<JoinHandle<()>>>,
}

impl NativeLink {
    async fn fetch(&self, payload: &OutboundPayload) -> Result<(Vec<u8>, String), DeliveryError> {
        let response = self
            .http
            .get(&payload.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| DeliveryError::Rejected(format!("media fetch failed: {e}")))?;
        let mimetype = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| default_mimetype(payload.kind).to_owned());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DeliveryError::Rejected(format!("media fetch failed: {e}")))?;
        Ok((bytes.to_vec(), mimetype))
    }

    async fn deliver(&self, to: Jid, payload: &OutboundPayload) -> Result<(), DeliveryError> {
        let (bytes, mimetype) = self.fetch(payload).await?;
        let media_type = match payload.kind {
            MediaKind::Image => MediaType::Image,
            MediaKind::Video => MediaType::Video,
        };
        let upload = self
            .client
            .upload(bytes, media_type)
            .await
            .map_err(|e| DeliveryError::Rejected(format!("media upload failed: {e}")))?;
        self.client
            .send_message(to, media_message(payload, mimetype, upload))
            .await
            .map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        Ok(())
    }

    fn stop_watcher(&self) {
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
    }
}

#[async_trait]
impl TransportLink for NativeLink {
    async fn send(&self, to: &PeerId, payload: &OutboundPayload) -> Result<(), DeliveryError> {
        let jid: Jid = to
            .as_str()
            .parse()
            .map_err(|e| DeliveryError::InvalidRecipient(format!("{to}: {e}")))?;
        tokio::time::timeout(self.timeout, self.deliver(jid, payload))
            .await
            .map_err(|_| DeliveryError::Timeout)?
    }

    async fn logout(&self) -> Result<(), LogoutError> {
        self.stop_watcher();
        self.client.disconnect().await;
        wipe_store(&self.store_path)
            .map_err(|e| LogoutError::Failed(format!("device store not removed: {e}")))?;
        info!(store = %self.store_path.display(), "device store removed");
        Ok(())
    }

    async fn close(&self) {
        self.stop_watcher();
        self.client.disconnect().await;
    }
}
