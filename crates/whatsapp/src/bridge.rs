//! WebSocket transport to a WhatsApp bridge process.
//!
//! The bridge speaks the WhatsApp Web protocol and exposes it as JSON text
//! frames tagged by `type`:
//!
//! | direction | frames |
//! |-----------|--------|
//! | client → bridge | `hello {credential?}`, `send {id, to, payload}`, `logout {id}` |
//! | bridge → client | `qr {code}`, `open`, `close {reason, message?}`, `creds {credential}`, `messages {messages}`, `ack {id, error?}` |
//!
//! `close` with reason `loggedOut` means the device was deauthorized; any
//! other reason is transient.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    firstcontact_channels::{
        ConnectError, Connection, DeliveryError, DisconnectReason, InboundMessage, LogoutError,
        OutboundPayload, PeerId, SessionCredential, Transport, TransportEvent, TransportLink,
    },
    firstcontact_config::TransportConfig,
    futures::{SinkExt, Stream, StreamExt},
    serde::{Deserialize, Serialize},
    tokio::{
        sync::{Mutex, mpsc, oneshot},
        task::JoinHandle,
    },
    tokio_tungstenite::{
        connect_async,
        tungstenite::{Error as WsError, Message},
    },
    tracing::{debug, trace, warn},
    url::Url,
};

const LOGGED_OUT_REASON: &str = "loggedOut";

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ClientFrame<'a> {
    Hello {
        #[serde(skip_serializing_if = "Option::is_none")]
        credential: Option<&'a SessionCredential>,
    },
    Send {
        id: u64,
        to: &'a PeerId,
        payload: &'a OutboundPayload,
    },
    Logout {
        id: u64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum BridgeFrame {
    Qr {
        code: String,
    },
    Open,
    Close {
        reason: String,
        #[serde(default)]
        message: Option<String>,
    },
    Creds {
        credential: SessionCredential,
    },
    Messages {
        messages: Vec<InboundMessage>,
    },
    Ack {
        id: u64,
        #[serde(default)]
        error: Option<AckError>,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct AckError {
    code: String,
    #[serde(default)]
    message: String,
}

enum RequestError {
    Closed,
    Timeout,
    Encode(String),
    Refused(AckError),
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), AckError>>>>>;

/// Connects to a bridge at a `ws://` URL.
pub struct BridgeTransport {
    url: String,
    request_timeout: Duration,
}

impl BridgeTransport {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            request_timeout,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.bridge_url.clone(), config.request_timeout())
    }
}

fn parse_bridge_url(raw: &str) -> Result<Url, ConnectError> {
    let url = Url::parse(raw)
        .map_err(|e| ConnectError::Configuration(format!("invalid bridge url {raw:?}: {e}")))?;
    if url.scheme() != "ws" {
        return Err(ConnectError::Configuration(format!(
            "unsupported bridge url scheme {:?}; expected ws://",
            url.scheme()
        )));
    }
    Ok(url)
}

fn encode(frame: &ClientFrame<'_>) -> Result<Message, serde_json::Error> {
    serde_json::to_string(frame).map(Message::text)
}

#[async_trait]
impl Transport for BridgeTransport {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn connect(
        &self,
        credential: Option<SessionCredential>,
    ) -> Result<Connection, ConnectError> {
        let url = parse_bridge_url(&self.url)?;
        let hello = encode(&ClientFrame::Hello {
            credential: credential.as_ref(),
        })
        .map_err(|e| ConnectError::Configuration(format!("credential not serializable: {e}")))?;

        // Upgrade and hello share one deadline.
        let handshake = async {
            let (socket, _) = connect_async(url.as_str())
                .await
                .map_err(|e| ConnectError::Unavailable(format!("bridge unreachable: {e}")))?;
            let (mut sink, stream) = socket.split();
            sink.send(hello)
                .await
                .map_err(|e| ConnectError::Unavailable(format!("bridge handshake failed: {e}")))?;
            Ok::<_, ConnectError>((sink, stream))
        };
        let (mut sink, stream) = tokio::time::timeout(self.request_timeout, handshake)
            .await
            .map_err(|_| {
                ConnectError::Unavailable(format!(
                    "bridge handshake timed out after {}ms",
                    self.request_timeout.as_millis()
                ))
            })??;
        debug!(url = %url, resuming = credential.is_some(), "connected to bridge");

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, "bridge writer stopped");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (events_tx, events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_frames(
            stream,
            Arc::clone(&pending),
            Arc::clone(&alive),
            events_tx,
        ));

        let link = Arc::new(BridgeLink {
            outgoing,
            pending,
            alive,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            request_timeout: self.request_timeout,
            reader: StdMutex::new(Some(reader)),
        });
        Ok(Connection { link, events })
    }
}

/// Route acks to waiting requests and everything else to the event stream.
async fn read_frames<S>(
    mut stream: S,
    pending: Pending,
    alive: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let reason = loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                break DisconnectReason::Transient(match frame {
                    Some(f) if !f.reason.is_empty() => {
                        format!("bridge closed the socket: {}", f.reason.as_str())
                    },
                    _ => "bridge closed the socket".into(),
                });
            },
            Some(Ok(_)) => continue,
            Some(Err(e)) => break DisconnectReason::Transient(format!("bridge socket error: {e}")),
            None => break DisconnectReason::Transient("bridge socket ended".into()),
        };

        let frame: BridgeFrame = match serde_json::from_str(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "ignoring malformed bridge frame");
                continue;
            },
        };
        let event = match frame {
            BridgeFrame::Ack { id, error } => {
                trace!(id, ok = error.is_none(), "bridge ack");
                match pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(error.map_or(Ok(()), Err));
                    },
                    None => warn!(id, "ack for unknown request id"),
                }
                continue;
            },
            BridgeFrame::Qr { code } => TransportEvent::PairingCode(code),
            BridgeFrame::Open => TransportEvent::Open,
            BridgeFrame::Creds { credential } => TransportEvent::CredentialsUpdated(credential),
            BridgeFrame::Messages { messages } => TransportEvent::Messages(messages),
            BridgeFrame::Close { reason, message } => break close_reason(&reason, message),
        };
        if events.send(event).is_err() {
            break DisconnectReason::Transient("event receiver dropped".into());
        }
    };

    alive.store(false, Ordering::Release);
    pending.lock().await.clear();
    debug!(?reason, "bridge connection ended");
    let _ = events.send(TransportEvent::Closed(reason));
}

fn close_reason(reason: &str, message: Option<String>) -> DisconnectReason {
    if reason == LOGGED_OUT_REASON {
        return DisconnectReason::LoggedOut;
    }
    match message {
        Some(message) if !message.is_empty() => {
            DisconnectReason::Transient(format!("{reason}: {message}"))
        },
        _ => DisconnectReason::Transient(reason.to_owned()),
    }
}

struct BridgeLink {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl BridgeLink {
    fn is_usable(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send `frame` and wait for the bridge's ack for `id`.
    async fn request(&self, id: u64, frame: &ClientFrame<'_>) -> Result<(), RequestError> {
        if !self.is_usable() {
            return Err(RequestError::Closed);
        }
        let message = encode(frame).map_err(|e| RequestError::Encode(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        if !self.alive.load(Ordering::Acquire) || self.outgoing.send(message).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RequestError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(ack))) => Err(RequestError::Refused(ack)),
            Ok(Err(_)) => Err(RequestError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RequestError::Timeout)
            },
        }
    }

    fn stop_reader(&self) {
        if let Some(handle) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[async_trait]
impl TransportLink for BridgeLink {
    async fn send(&self, to: &PeerId, payload: &OutboundPayload) -> Result<(), DeliveryError> {
        let id = self.next_id();
        let frame = ClientFrame::Send { id, to, payload };
        self.request(id, &frame).await.map_err(|e| match e {
            RequestError::Closed => DeliveryError::NotConnected,
            RequestError::Timeout => DeliveryError::Timeout,
            RequestError::Encode(detail) => DeliveryError::Rejected(detail),
            RequestError::Refused(ack) => match ack.code.as_str() {
                "not-connected" => DeliveryError::NotConnected,
                "invalid-recipient" => DeliveryError::InvalidRecipient(to.to_string()),
                "rate-limited" => DeliveryError::RateLimited,
                _ => DeliveryError::Rejected(format!("{}: {}", ack.code, ack.message)),
            },
        })
    }

    async fn logout(&self) -> Result<(), LogoutError> {
        let id = self.next_id();
        self.request(id, &ClientFrame::Logout { id })
            .await
            .map_err(|e| match e {
                RequestError::Closed => LogoutError::NotConnected,
                RequestError::Timeout => LogoutError::Failed("bridge did not acknowledge logout".into()),
                RequestError::Encode(detail) => LogoutError::Failed(detail),
                RequestError::Refused(ack) if ack.code == "not-connected" => LogoutError::NotConnected,
                RequestError::Refused(ack) => LogoutError::Failed(ack.message),
            })?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) && !self.alive.load(Ordering::Acquire) {
            return;
        }
        let _ = self.outgoing.send(Message::Close(None));
        self.stop_reader();
    }
}

impl Drop for BridgeLink {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        serde_json::{Value, json},
        tokio::net::{TcpListener, TcpStream},
        tokio_tungstenite::{WebSocketStream, accept_async},
    };

    struct FakeBridge {
        url: String,
        listener: TcpListener,
    }

    impl FakeBridge {
        async fn bind() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("ws://{}/ws", listener.local_addr().unwrap());
            Self { url, listener }
        }

        /// Accept one client and return its socket plus the hello frame.
        async fn accept(&self) -> (WebSocketStream<TcpStream>, Value) {
            let (tcp, _) = self.listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let hello = next_json(&mut ws).await;
            (ws, hello)
        }

        fn transport(&self) -> BridgeTransport {
            BridgeTransport::new(self.url.clone(), Duration::from_millis(500))
        }
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    async fn push(ws: &mut WebSocketStream<TcpStream>, frame: Value) {
        ws.send(Message::text(frame.to_string())).await.unwrap();
    }

    #[test]
    fn rejects_non_ws_urls() {
        for raw in ["http://localhost/ws", "wss://bridge.example.com", "not a url"] {
            assert!(matches!(
                parse_bridge_url(raw),
                Err(ConnectError::Configuration(_))
            ));
        }
        assert!(parse_bridge_url("ws://127.0.0.1:8787/ws").is_ok());
    }

    #[test]
    fn close_reasons() {
        assert_eq!(close_reason("loggedOut", None), DisconnectReason::LoggedOut);
        assert_eq!(
            close_reason("restartRequired", Some("stream replaced".into())),
            DisconnectReason::Transient("restartRequired: stream replaced".into())
        );
        assert_eq!(
            close_reason("connectionLost", None),
            DisconnectReason::Transient("connectionLost".into())
        );
    }

    #[tokio::test]
    async fn configuration_error_is_not_retried_as_unavailable() {
        let transport = BridgeTransport::new("https://bridge", Duration::from_secs(1));
        assert!(matches!(
            transport.connect(None).await.err(),
            Some(ConnectError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_bridge_is_unavailable() {
        let bridge = FakeBridge::bind().await;
        let transport = bridge.transport();
        drop(bridge);
        assert!(matches!(
            transport.connect(None).await.err(),
            Some(ConnectError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn silent_listener_times_out_as_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let silent = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(tcp);
        });

        let transport = BridgeTransport::new(url, Duration::from_millis(200));
        let result = tokio::time::timeout(Duration::from_secs(5), transport.connect(None)).await;
        silent.abort();

        match result {
            Ok(Err(ConnectError::Unavailable(detail))) => assert!(detail.contains("timed out")),
            Ok(Err(other)) => panic!("expected unavailable, got {other:?}"),
            Ok(Ok(_)) => panic!("handshake with a silent listener succeeded"),
            Err(_) => panic!("connect ignored its deadline"),
        }
    }

    #[tokio::test]
    async fn forwards_bridge_frames_as_events() {
        let bridge = FakeBridge::bind().await;
        let transport = bridge.transport();
        let credential = SessionCredential(json!({"me": "5511@s.whatsapp.net"}));
        let client = tokio::spawn({
            let credential = credential.clone();
            async move { transport.connect(Some(credential)).await.unwrap() }
        });

        let (mut ws, hello) = bridge.accept().await;
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["credential"]["me"], "5511@s.whatsapp.net");
        let mut conn = client.await.unwrap();

        push(&mut ws, json!({"type": "qr", "code": "2@abc"})).await;
        push(&mut ws, json!({"type": "open"})).await;
        push(&mut ws, json!({"type": "creds", "credential": {"v": 2}})).await;
        push(
            &mut ws,
            json!({"type": "messages", "messages": [
                {"from": "5511999999999@s.whatsapp.net", "fromMe": false, "text": "oi"}
            ]}),
        )
        .await;
        push(&mut ws, json!({"type": "bogus"})).await;
        push(&mut ws, json!({"type": "close", "reason": "loggedOut"})).await;

        assert_eq!(
            conn.events.recv().await,
            Some(TransportEvent::PairingCode("2@abc".into()))
        );
        assert_eq!(conn.events.recv().await, Some(TransportEvent::Open));
        assert_eq!(
            conn.events.recv().await,
            Some(TransportEvent::CredentialsUpdated(SessionCredential(json!({"v": 2}))))
        );
        match conn.events.recv().await {
            Some(TransportEvent::Messages(batch)) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].content(), Some("oi"));
            },
            other => panic!("expected messages, got {other:?}"),
        }
        assert_eq!(
            conn.events.recv().await,
            Some(TransportEvent::Closed(DisconnectReason::LoggedOut))
        );
        assert_eq!(conn.events.recv().await, None);
        assert_eq!(
            conn.link
                .send(&PeerId::from("1@s.whatsapp.net"), &OutboundPayload::image("u", "c"))
                .await,
            Err(DeliveryError::NotConnected)
        );
    }

    #[tokio::test]
    async fn sends_wait_for_acks() {
        let bridge = FakeBridge::bind().await;
        let transport = bridge.transport();
        let client = tokio::spawn(async move { transport.connect(None).await.unwrap() });
        let (mut ws, hello) = bridge.accept().await;
        assert!(hello.get("credential").is_none());
        let conn = client.await.unwrap();

        let server = tokio::spawn(async move {
            let first = next_json(&mut ws).await;
            assert_eq!(first["type"], "send");
            assert_eq!(first["payload"]["kind"], "image");
            push(&mut ws, json!({"type": "ack", "id": first["id"]})).await;

            let second = next_json(&mut ws).await;
            push(
                &mut ws,
                json!({"type": "ack", "id": second["id"], "error": {"code": "rate-limited", "message": "slow down"}}),
            )
            .await;

            let third = next_json(&mut ws).await;
            assert_eq!(third["type"], "logout");
            push(&mut ws, json!({"type": "ack", "id": third["id"]})).await;
            ws
        });

        let peer = PeerId::from("5511999999999@s.whatsapp.net");
        let image = OutboundPayload::image("https://x/a.jpg", "Olá");
        let video = OutboundPayload::video("https://x/b.mp4", "clip");
        assert_eq!(conn.link.send(&peer, &image).await, Ok(()));
        assert_eq!(
            conn.link.send(&peer, &video).await,
            Err(DeliveryError::RateLimited)
        );
        assert_eq!(conn.link.logout().await, Ok(()));
        assert_eq!(
            conn.link.send(&peer, &image).await,
            Err(DeliveryError::NotConnected)
        );
        let _ws = server.await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_send_times_out() {
        let bridge = FakeBridge::bind().await;
        let transport = bridge.transport();
        let client = tokio::spawn(async move { transport.connect(None).await.unwrap() });
        let (_ws, _) = bridge.accept().await;
        let conn = client.await.unwrap();

        let result = conn
            .link
            .send(
                &PeerId::from("1@s.whatsapp.net"),
                &OutboundPayload::image("u", "c"),
            )
            .await;
        assert_eq!(result, Err(DeliveryError::Timeout));
    }

    #[tokio::test]
    async fn dropped_socket_is_transient() {
        let bridge = FakeBridge::bind().await;
        let transport = bridge.transport();
        let client = tokio::spawn(async move { transport.connect(None).await.unwrap() });
        let (ws, _) = bridge.accept().await;
        let mut conn = client.await.unwrap();
        drop(ws);

        assert!(matches!(
            conn.events.recv().await,
            Some(TransportEvent::Closed(DisconnectReason::Transient(_)))
        ));
    }

    #[tokio::test]
    async fn close_after_logout_sends_a_close_frame() {
        let bridge = FakeBridge::bind().await;
        let transport = bridge.transport();
        let client = tokio::spawn(async move { transport.connect(None).await.unwrap() });
        let (mut ws, _) = bridge.accept().await;
        let conn = client.await.unwrap();

        let server = tokio::spawn(async move {
            let req = next_json(&mut ws).await;
            push(&mut ws, json!({"type": "ack", "id": req["id"]})).await;
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) => return true,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => return false,
                }
            }
        });
        conn.link.logout().await.unwrap();
        conn.link.close().await;

        let saw_close = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(saw_close);
    }

    #[tokio::test]
    async fn refused_logout_is_reported() {
        let bridge = FakeBridge::bind().await;
        let transport = bridge.transport();
        let client = tokio::spawn(async move { transport.connect(None).await.unwrap() });
        let (mut ws, _) = bridge.accept().await;
        let conn = client.await.unwrap();

        let server = tokio::spawn(async move {
            let req = next_json(&mut ws).await;
            push(
                &mut ws,
                json!({"type": "ack", "id": req["id"], "error": {"code": "failed", "message": "server error 500"}}),
            )
            .await;
            ws
        });
        assert_eq!(
            conn.link.logout().await,
            Err(LogoutError::Failed("server error 500".into()))
        );
        let _ws = server.await.unwrap();
    }
}
