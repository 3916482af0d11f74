//! Adapter for the device-linked socket protocol (unofficial multi-device
//! WhatsApp transport).
//!
//! The transport itself is owned by an external connection manager and
//! reached through the [`TransportPool`] seam; this adapter owns readiness
//! checking, the bounded reconnect-and-retry-once policy, quoted-reply
//! resolution, and normalization of both directions.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::error::ChannelError;
use crate::events::{ConnectionListener, ListenerSet, MessageListener};
use crate::recipient::{is_group_jid, normalize_recipient};
use crate::traits::ChannelAdapter;
use crate::types::{
    ChannelKind, ConnectionId, ConnectionStatus, DeliveryAck, MediaKind, MediaSource, MessageId,
    NormalizedMessage, Presence, ProfileInfo, RecipientId, SendContent, SendRequest, StatusCell,
};
use crate::menu::{render_button_menu, render_list_menu};

const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const QUOTE_STORE_CAPACITY: usize = 2048;

/// Transport error signatures that indicate the socket died underneath us,
/// as opposed to the protocol rejecting the payload.
const CONNECTION_CLOSED_SIGNATURES: &[&str] = &[
    "connection closed",
    "connection lost",
    "connection terminated",
    "socket hang up",
    "not connected",
    "stream errored",
];

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("{0}")]
    Protocol(String),
}

impl TransportError {
    pub fn is_connection_closed(&self) -> bool {
        match self {
            Self::Closed(_) => true,
            Self::Protocol(message) => {
                let message = message.to_ascii_lowercase();
                CONNECTION_CLOSED_SIGNATURES
                    .iter()
                    .any(|signature| message.contains(signature))
            }
        }
    }
}

/// Opaque reference to media already uploaded through the transport.
#[derive(Debug, Clone)]
pub struct MediaHandle(pub String);

#[derive(Debug, Clone)]
pub struct QuoteRef {
    pub message_id: String,
    pub remote_jid: String,
    pub participant: Option<String>,
    pub from_me: bool,
}

#[derive(Debug, Clone)]
pub struct SocketEnvelope {
    pub jid: String,
    pub payload: SocketPayload,
    pub quote: Option<QuoteRef>,
}

#[derive(Debug, Clone)]
pub enum SocketPayload {
    Text {
        body: String,
    },
    Media {
        handle: MediaHandle,
        kind: MediaKind,
        caption: Option<String>,
        filename: Option<String>,
    },
    Contact {
        name: String,
        vcard: String,
    },
}

#[derive(Debug, Clone)]
pub struct SocketReceipt {
    pub message_id: String,
    pub timestamp_millis: i64,
}

/// One live wire connection, owned by the external connection manager.
#[async_trait]
pub trait SocketTransport: Send + Sync {
    /// Synchronous readiness probe: is the underlying socket actually open,
    /// not merely referenced.
    fn is_open(&self) -> bool;

    /// The linked device's own canonical address.
    fn own_jid(&self) -> String;

    async fn send_envelope(&self, envelope: SocketEnvelope)
    -> Result<SocketReceipt, TransportError>;

    async fn upload_media(
        &self,
        data: Bytes,
        mime_type: &str,
        kind: MediaKind,
    ) -> Result<MediaHandle, TransportError>;

    async fn delete_envelope(&self, jid: &str, message_id: &str) -> Result<(), TransportError>;

    async fn send_presence(&self, jid: &str, presence: Presence) -> Result<(), TransportError>;

    async fn mark_read(&self, jid: &str, message_ids: &[String]) -> Result<(), TransportError>;

    async fn profile_picture_url(&self, jid: &str) -> Result<Option<String>, TransportError>;

    async fn status_text(&self, jid: &str) -> Result<Option<String>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Shared pool of live transports keyed by connection id. Acquire is
/// idempotent: repeated calls return the current shared handle rather than
/// dialing a second competing socket.
#[async_trait]
pub trait TransportPool: Send + Sync {
    async fn acquire(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Arc<dyn SocketTransport>, TransportError>;
}

/// Raw events pushed in by the external connection manager.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Opened,
    Closed { reason: String },
    Message(SocketMessageEvent),
}

#[derive(Debug, Clone)]
pub struct SocketMessageEvent {
    pub message_id: String,
    pub remote_jid: String,
    pub participant: Option<String>,
    pub from_me: bool,
    pub body: Option<String>,
    pub media_type: Option<MediaKind>,
    pub media_url: Option<String>,
    pub caption: Option<String>,
    pub timestamp_millis: i64,
}

#[derive(Debug, Clone)]
struct QuoteMeta {
    remote_jid: String,
    participant: Option<String>,
    from_me: bool,
}

/// Bounded map of recently seen message ids to their delivery metadata,
/// fed from both send and receive paths.
#[derive(Default)]
struct QuoteStore {
    inner: StdMutex<QuoteStoreInner>,
}

#[derive(Default)]
struct QuoteStoreInner {
    order: VecDeque<String>,
    entries: HashMap<String, QuoteMeta>,
}

impl QuoteStore {
    fn record(&self, message_id: &str, meta: QuoteMeta) {
        let mut inner = self.inner.lock().expect("quote store poisoned");
        if inner.entries.insert(message_id.to_string(), meta).is_none() {
            inner.order.push_back(message_id.to_string());
            if inner.order.len() > QUOTE_STORE_CAPACITY {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.entries.remove(&evicted);
                }
            }
        }
    }

    fn lookup(&self, message_id: &str) -> Option<QuoteMeta> {
        self.inner
            .lock()
            .expect("quote store poisoned")
            .entries
            .get(message_id)
            .cloned()
    }
}

pub struct SocketAdapter {
    connection_id: ConnectionId,
    pool: Arc<dyn TransportPool>,
    http: reqwest::Client,
    transport: RwLock<Option<Arc<dyn SocketTransport>>>,
    reinit_lock: Mutex<()>,
    own_jid: StdMutex<Option<String>>,
    status: StatusCell,
    listeners: ListenerSet,
    quotes: QuoteStore,
    reconnect_backoff: Duration,
}

impl SocketAdapter {
    pub fn new(
        connection_id: ConnectionId,
        pool: Arc<dyn TransportPool>,
    ) -> Result<Self, ChannelError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            connection_id,
            pool,
            http,
            transport: RwLock::new(None),
            reinit_lock: Mutex::new(()),
            own_jid: StdMutex::new(None),
            status: StatusCell::new(ConnectionStatus::Disconnected),
            listeners: ListenerSet::new(),
            quotes: QuoteStore::default(),
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        })
    }

    pub fn with_reconnect_backoff(mut self, reconnect_backoff: Duration) -> Self {
        self.reconnect_backoff = reconnect_backoff;
        self
    }

    fn cached_own_jid(&self) -> Option<String> {
        self.own_jid.lock().expect("own jid poisoned").clone()
    }

    fn remember_transport_identity(&self, transport: &Arc<dyn SocketTransport>) {
        *self.own_jid.lock().expect("own jid poisoned") = Some(transport.own_jid());
    }

    async fn current_transport(&self) -> Option<Arc<dyn SocketTransport>> {
        self.transport.read().await.clone()
    }

    /// Best-effort handle for advisory operations: no reinitialization.
    async fn advisory_transport(&self) -> Option<Arc<dyn SocketTransport>> {
        let transport = self.current_transport().await?;
        transport.is_open().then_some(transport)
    }

    /// Readiness check plus at most one reinitialization.
    async fn ready_transport(&self) -> Result<Arc<dyn SocketTransport>, ChannelError> {
        if let Some(transport) = self.current_transport().await {
            if transport.is_open() {
                return Ok(transport);
            }
        }
        self.reinitialize().await
    }

    /// Re-acquire the current shared transport from the pool. Serialized so
    /// concurrent sends racing a dead socket cannot install two competing
    /// transports; losers of the race reuse the winner's handle.
    async fn reinitialize(&self) -> Result<Arc<dyn SocketTransport>, ChannelError> {
        let _guard = self.reinit_lock.lock().await;
        if let Some(transport) = self.current_transport().await {
            if transport.is_open() {
                return Ok(transport);
            }
        }

        match self.pool.acquire(self.connection_id).await {
            Ok(transport) if transport.is_open() => {
                self.remember_transport_identity(&transport);
                *self.transport.write().await = Some(transport.clone());
                self.set_status(ConnectionStatus::Connected);
                Ok(transport)
            }
            Ok(_) => {
                self.set_status(ConnectionStatus::Disconnected);
                Err(ChannelError::SocketNotAvailable(
                    "reacquired transport is not open".to_string(),
                ))
            }
            Err(error) => {
                self.set_status(ConnectionStatus::Disconnected);
                Err(ChannelError::SocketNotAvailable(error.to_string()))
            }
        }
    }

    /// Bounded retry policy: ready → send → (closed? backoff, reinitialize,
    /// retry exactly once) → give up. The second failure propagates as-is.
    async fn send_with_retry(
        &self,
        envelope: SocketEnvelope,
    ) -> Result<SocketReceipt, ChannelError> {
        let transport = self.ready_transport().await?;
        match transport.send_envelope(envelope.clone()).await {
            Ok(receipt) => Ok(receipt),
            Err(error) if error.is_connection_closed() => {
                self.set_status(ConnectionStatus::Disconnected);
                tracing::warn!(
                    connection_id = self.connection_id,
                    %error,
                    backoff = ?self.reconnect_backoff,
                    "socket send hit a closed transport; reinitializing and retrying once"
                );
                tokio::time::sleep(self.reconnect_backoff).await;
                let transport = self.reinitialize().await?;
                transport
                    .send_envelope(envelope)
                    .await
                    .map_err(map_transport_error)
            }
            Err(error) => Err(map_transport_error(error)),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        if self.status.load() != status {
            self.status.store(status);
            self.listeners.dispatch_connection_update(status);
        }
    }

    fn resolve_quote(&self, quoted_id: &MessageId, destination_jid: &str) -> QuoteRef {
        match self.quotes.lookup(quoted_id.as_str()) {
            Some(meta) => QuoteRef {
                message_id: quoted_id.to_string(),
                remote_jid: meta.remote_jid,
                participant: meta.participant,
                from_me: meta.from_me,
            },
            // Metadata miss: degrade to a minimal quote instead of failing
            // the send.
            None => QuoteRef {
                message_id: quoted_id.to_string(),
                remote_jid: destination_jid.to_string(),
                participant: None,
                from_me: false,
            },
        }
    }

    async fn upload_from_source(
        &self,
        transport: &Arc<dyn SocketTransport>,
        kind: MediaKind,
        source: MediaSource,
    ) -> Result<MediaHandle, ChannelError> {
        let (data, mime_type) = match source {
            MediaSource::Bytes { data, mime_type } => (data, mime_type),
            MediaSource::Url(url) => self.fetch_media(&url).await?,
        };
        transport
            .upload_media(data, &mime_type, kind)
            .await
            .map_err(|error| ChannelError::MediaUpload(error.to_string()))
    }

    async fn fetch_media(&self, url: &str) -> Result<(Bytes, String), ChannelError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|error| ChannelError::MediaUpload(format!("fetch {url}: {error}")))?;
        if !response.status().is_success() {
            return Err(ChannelError::MediaUpload(format!(
                "fetch {url}: status={}",
                response.status()
            )));
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = response
            .bytes()
            .await
            .map_err(|error| ChannelError::MediaUpload(format!("fetch {url}: {error}")))?;
        Ok((data, mime_type))
    }

    /// Entry point for raw events pushed in by the connection manager.
    pub fn process_socket_event(&self, event: SocketEvent) {
        match event {
            SocketEvent::Opened => self.set_status(ConnectionStatus::Connected),
            SocketEvent::Closed { reason } => {
                tracing::warn!(
                    connection_id = self.connection_id,
                    %reason,
                    "socket transport closed"
                );
                self.set_status(ConnectionStatus::Disconnected);
            }
            SocketEvent::Message(event) => {
                self.quotes.record(
                    &event.message_id,
                    QuoteMeta {
                        remote_jid: event.remote_jid.clone(),
                        participant: event.participant.clone(),
                        from_me: event.from_me,
                    },
                );
                let message = self.normalize_inbound(&event);
                self.listeners.dispatch_message(message);
            }
        }
    }

    fn normalize_inbound(&self, event: &SocketMessageEvent) -> NormalizedMessage {
        let own = self.cached_own_jid();
        let is_group = is_group_jid(&event.remote_jid);
        let (from, to) = if event.from_me {
            (
                own.unwrap_or_else(|| event.remote_jid.clone()),
                event.remote_jid.clone(),
            )
        } else {
            let sender = event
                .participant
                .clone()
                .filter(|_| is_group)
                .unwrap_or_else(|| event.remote_jid.clone());
            (sender, own.unwrap_or_else(|| event.remote_jid.clone()))
        };

        NormalizedMessage {
            id: MessageId::new(event.message_id.clone()),
            channel: ChannelKind::Socket,
            from: RecipientId::new(from),
            to: RecipientId::new(to),
            body: event.body.clone().unwrap_or_default(),
            timestamp_millis: event.timestamp_millis,
            from_me: event.from_me,
            media_type: event.media_type,
            media_url: event.media_url.clone(),
            caption: event.caption.clone(),
            delivery_ack: None,
            is_group,
            participant_id: event.participant.clone().map(RecipientId::new),
        }
    }

    fn normalize_outbound(
        &self,
        receipt: &SocketReceipt,
        jid: &RecipientId,
        body: String,
        media_type: Option<MediaKind>,
        caption: Option<String>,
    ) -> NormalizedMessage {
        self.quotes.record(
            &receipt.message_id,
            QuoteMeta {
                remote_jid: jid.to_string(),
                participant: None,
                from_me: true,
            },
        );
        NormalizedMessage {
            id: MessageId::new(receipt.message_id.clone()),
            channel: ChannelKind::Socket,
            from: RecipientId::new(self.cached_own_jid().unwrap_or_default()),
            to: jid.clone(),
            body,
            timestamp_millis: receipt.timestamp_millis,
            from_me: true,
            media_type,
            media_url: None,
            caption,
            delivery_ack: Some(DeliveryAck::ServerAck),
            is_group: is_group_jid(jid.as_str()),
            participant_id: None,
        }
    }
}

fn map_transport_error(error: TransportError) -> ChannelError {
    if error.is_connection_closed() {
        ChannelError::ConnectionClosed(error.to_string())
    } else {
        ChannelError::Send(error.to_string())
    }
}

fn render_vcard(name: &str, phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    format!(
        "BEGIN:VCARD\nVERSION:3.0\nN:;{name};;;\nFN:{name}\nTEL;type=CELL;waid={digits}:+{digits}\nEND:VCARD"
    )
}

#[async_trait]
impl ChannelAdapter for SocketAdapter {
    fn channel_kind(&self) -> ChannelKind {
        ChannelKind::Socket
    }

    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn status(&self) -> ConnectionStatus {
        self.status.load()
    }

    async fn initialize(&self) -> Result<(), ChannelError> {
        self.status.store(ConnectionStatus::Connecting);
        match self.pool.acquire(self.connection_id).await {
            Ok(transport) => {
                self.remember_transport_identity(&transport);
                *self.transport.write().await = Some(transport);
                self.set_status(ConnectionStatus::Connected);
                Ok(())
            }
            Err(error) => {
                self.set_status(ConnectionStatus::Disconnected);
                Err(ChannelError::Initialization {
                    channel: ChannelKind::Socket.as_str().to_string(),
                    detail: error.to_string(),
                })
            }
        }
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        if let Some(transport) = self.transport.write().await.take() {
            if let Err(error) = transport.close().await {
                tracing::warn!(
                    connection_id = self.connection_id,
                    %error,
                    "error closing socket transport"
                );
            }
        }
        self.set_status(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn send_message(&self, request: SendRequest) -> Result<NormalizedMessage, ChannelError> {
        let jid = normalize_recipient(ChannelKind::Socket, &request.to)?;
        request.content.validate()?;
        let quote = request
            .quoted_message_id
            .as_ref()
            .map(|id| self.resolve_quote(id, jid.as_str()));

        let (payload, body, media_type, caption) = match request.content {
            SendContent::Text { body } => (
                SocketPayload::Text { body: body.clone() },
                body,
                None,
                None,
            ),
            SendContent::Buttons { body, buttons } => {
                // The wire protocol has no native buttons; render a numbered
                // text menu.
                let rendered = render_button_menu(&body, &buttons);
                (
                    SocketPayload::Text {
                        body: rendered.clone(),
                    },
                    rendered,
                    None,
                    None,
                )
            }
            SendContent::List { body, sections, .. } => {
                let rendered = render_list_menu(&body, &sections);
                (
                    SocketPayload::Text {
                        body: rendered.clone(),
                    },
                    rendered,
                    None,
                    None,
                )
            }
            SendContent::Contact { name, phone } => {
                let vcard = render_vcard(&name, &phone);
                (
                    SocketPayload::Contact {
                        name: name.clone(),
                        vcard,
                    },
                    name,
                    None,
                    None,
                )
            }
            SendContent::Media {
                kind,
                source,
                caption,
                filename,
            } => {
                let transport = self.ready_transport().await?;
                let handle = self.upload_from_source(&transport, kind, source).await?;
                (
                    SocketPayload::Media {
                        handle,
                        kind,
                        caption: caption.clone(),
                        filename,
                    },
                    String::new(),
                    Some(kind),
                    caption,
                )
            }
            SendContent::Template { .. } => {
                return Err(ChannelError::unsupported(ChannelKind::Socket, "template"));
            }
        };

        let envelope = SocketEnvelope {
            jid: jid.to_string(),
            payload,
            quote,
        };
        let receipt = self.send_with_retry(envelope).await?;
        Ok(self.normalize_outbound(&receipt, &jid, body, media_type, caption))
    }

    async fn delete_message(
        &self,
        to: &str,
        message_id: &str,
        _sent_at_millis: i64,
    ) -> Result<(), ChannelError> {
        let jid = normalize_recipient(ChannelKind::Socket, to)?;
        let transport = self.ready_transport().await?;
        transport
            .delete_envelope(jid.as_str(), message_id)
            .await
            .map_err(map_transport_error)
    }

    async fn get_profile_picture(&self, recipient: &str) -> Option<String> {
        let jid = normalize_recipient(ChannelKind::Socket, recipient).ok()?;
        let transport = self.advisory_transport().await?;
        match transport.profile_picture_url(jid.as_str()).await {
            Ok(url) => url,
            Err(error) => {
                tracing::warn!(%jid, %error, "profile picture lookup failed");
                None
            }
        }
    }

    async fn get_status(&self, recipient: &str) -> Option<String> {
        let jid = normalize_recipient(ChannelKind::Socket, recipient).ok()?;
        let transport = self.advisory_transport().await?;
        match transport.status_text(jid.as_str()).await {
            Ok(text) => text,
            Err(error) => {
                tracing::warn!(%jid, %error, "status lookup failed");
                None
            }
        }
    }

    async fn get_profile_info(&self, recipient: &str) -> Option<ProfileInfo> {
        let jid = normalize_recipient(ChannelKind::Socket, recipient).ok()?;
        let picture_url = self.get_profile_picture(jid.as_str()).await;
        Some(ProfileInfo {
            id: jid.into_inner(),
            name: None,
            picture_url,
        })
    }

    async fn mark_as_read(&self, recipient: &str, message_ids: &[MessageId]) {
        let Ok(jid) = normalize_recipient(ChannelKind::Socket, recipient) else {
            return;
        };
        let Some(transport) = self.advisory_transport().await else {
            return;
        };
        let ids: Vec<String> = message_ids.iter().map(|id| id.to_string()).collect();
        if let Err(error) = transport.mark_read(jid.as_str(), &ids).await {
            tracing::warn!(%jid, %error, "mark-as-read failed");
        }
    }

    async fn send_presence_update(&self, recipient: &str, presence: Presence) {
        let Ok(jid) = normalize_recipient(ChannelKind::Socket, recipient) else {
            return;
        };
        let Some(transport) = self.advisory_transport().await else {
            return;
        };
        if let Err(error) = transport.send_presence(jid.as_str(), presence).await {
            tracing::warn!(%jid, %error, ?presence, "presence update failed");
        }
    }

    async fn on_message(&self, listener: MessageListener) {
        self.listeners.add_message_listener(listener).await;
    }

    async fn on_connection_update(&self, listener: ConnectionListener) {
        self.listeners.add_connection_listener(listener).await;
    }

    fn supports_deleting(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::{
        MediaHandle, SocketAdapter, SocketEnvelope, SocketEvent, SocketMessageEvent, SocketPayload,
        SocketReceipt, SocketTransport, TransportError, TransportPool, render_vcard,
    };
    use crate::error::ChannelError;
    use crate::traits::ChannelAdapter;
    use crate::types::{
        ConnectionId, MediaKind, Presence, SendContent, SendRequest, now_millis,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct MockTransport {
        open: AtomicBool,
        sent: Mutex<Vec<SocketEnvelope>>,
        send_results: Mutex<VecDeque<Result<SocketReceipt, TransportError>>>,
        uploads: AtomicUsize,
    }

    impl MockTransport {
        fn open() -> Arc<Self> {
            let transport = Arc::new(Self::default());
            transport.open.store(true, Ordering::SeqCst);
            transport
        }

        fn closed() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn queue_send_result(&self, result: Result<SocketReceipt, TransportError>) {
            self.send_results
                .lock()
                .expect("send results")
                .push_back(result);
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().expect("sent").len()
        }

        fn last_sent(&self) -> SocketEnvelope {
            self.sent
                .lock()
                .expect("sent")
                .last()
                .expect("at least one send")
                .clone()
        }
    }

    #[async_trait]
    impl SocketTransport for MockTransport {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn own_jid(&self) -> String {
            "5511000000000@s.whatsapp.net".to_string()
        }

        async fn send_envelope(
            &self,
            envelope: SocketEnvelope,
        ) -> Result<SocketReceipt, TransportError> {
            self.sent.lock().expect("sent").push(envelope);
            match self.send_results.lock().expect("send results").pop_front() {
                Some(result) => result,
                None => Ok(SocketReceipt {
                    message_id: format!("receipt-{}", self.sent_count()),
                    timestamp_millis: now_millis(),
                }),
            }
        }

        async fn upload_media(
            &self,
            _data: Bytes,
            _mime_type: &str,
            _kind: MediaKind,
        ) -> Result<MediaHandle, TransportError> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(MediaHandle("upload-1".to_string()))
        }

        async fn delete_envelope(
            &self,
            _jid: &str,
            _message_id: &str,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send_presence(
            &self,
            _jid: &str,
            _presence: Presence,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn mark_read(&self, _jid: &str, _message_ids: &[String]) -> Result<(), TransportError> {
            Ok(())
        }

        async fn profile_picture_url(&self, _jid: &str) -> Result<Option<String>, TransportError> {
            Ok(Some("https://cdn.example/avatar.jpg".to_string()))
        }

        async fn status_text(&self, _jid: &str) -> Result<Option<String>, TransportError> {
            Ok(None)
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockPool {
        acquires: AtomicUsize,
        transports: Mutex<VecDeque<Result<Arc<MockTransport>, TransportError>>>,
    }

    impl MockPool {
        fn supplying(transports: Vec<Result<Arc<MockTransport>, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                acquires: AtomicUsize::new(0),
                transports: Mutex::new(transports.into()),
            })
        }

        fn acquire_count(&self) -> usize {
            self.acquires.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TransportPool for MockPool {
        async fn acquire(
            &self,
            _connection_id: ConnectionId,
        ) -> Result<Arc<dyn SocketTransport>, TransportError> {
            self.acquires.fetch_add(1, Ordering::SeqCst);
            match self.transports.lock().expect("transports").pop_front() {
                Some(Ok(transport)) => Ok(transport),
                Some(Err(error)) => Err(error),
                None => Err(TransportError::Closed("pool exhausted".to_string())),
            }
        }
    }

    fn adapter_with_pool(pool: Arc<MockPool>) -> SocketAdapter {
        SocketAdapter::new(7, pool)
            .expect("adapter")
            .with_reconnect_backoff(Duration::ZERO)
    }

    #[tokio::test]
    async fn text_send_returns_normalized_message_authored_by_us() {
        let transport = MockTransport::open();
        let pool = MockPool::supplying(vec![Ok(transport.clone())]);
        let adapter = adapter_with_pool(pool);
        adapter.initialize().await.expect("initialize");

        let message = adapter
            .send_message(SendRequest::text("+55 11 98888-7777", "hello there"))
            .await
            .expect("send");

        assert!(message.from_me);
        assert_eq!(message.body, "hello there");
        assert_eq!(message.to.as_str(), "5511988887777@s.whatsapp.net");
        assert_eq!(message.from.as_str(), "5511000000000@s.whatsapp.net");
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn not_ready_transport_is_reinitialized_once_then_send_succeeds() {
        let replacement = MockTransport::open();
        let pool = MockPool::supplying(vec![Ok(MockTransport::closed()), Ok(replacement.clone())]);
        let adapter = adapter_with_pool(pool.clone());
        adapter.initialize().await.expect("initialize");

        let message = adapter
            .send_message(SendRequest::text("5511988887777", "still there?"))
            .await
            .expect("send should succeed after one reinitialization");

        assert_eq!(message.body, "still there?");
        assert_eq!(replacement.sent_count(), 1);
        // one acquire from initialize, one from the readiness path
        assert_eq!(pool.acquire_count(), 2);
    }

    #[tokio::test]
    async fn still_not_ready_after_reinitialization_fails_without_second_attempt() {
        let pool = MockPool::supplying(vec![Ok(MockTransport::closed())]);
        let adapter = adapter_with_pool(pool.clone());

        let error = adapter
            .send_message(SendRequest::text("5511988887777", "anyone?"))
            .await
            .expect_err("send should fail");

        assert!(matches!(error, ChannelError::SocketNotAvailable(_)));
        assert_eq!(error.code(), "SOCKET_NOT_AVAILABLE");
        assert_eq!(pool.acquire_count(), 1, "exactly one reinitialization");
    }

    #[tokio::test]
    async fn closed_send_error_triggers_exactly_one_retry() {
        let transport = MockTransport::open();
        transport.queue_send_result(Err(TransportError::Closed("Connection Closed".to_string())));
        transport.queue_send_result(Ok(SocketReceipt {
            message_id: "retried".to_string(),
            timestamp_millis: 1_700_000_000_000,
        }));
        let pool = MockPool::supplying(vec![Ok(transport.clone()), Ok(transport.clone())]);
        let adapter = adapter_with_pool(pool);
        adapter.initialize().await.expect("initialize");

        let message = adapter
            .send_message(SendRequest::text("5511988887777", "retry me"))
            .await
            .expect("retry should succeed");

        assert_eq!(message.id.as_str(), "retried");
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test]
    async fn second_closed_failure_propagates_without_third_attempt() {
        let transport = MockTransport::open();
        transport.queue_send_result(Err(TransportError::Protocol(
            "stream errored out".to_string(),
        )));
        transport.queue_send_result(Err(TransportError::Closed("connection lost".to_string())));
        let pool = MockPool::supplying(vec![Ok(transport.clone()), Ok(transport.clone())]);
        let adapter = adapter_with_pool(pool);
        adapter.initialize().await.expect("initialize");

        let error = adapter
            .send_message(SendRequest::text("5511988887777", "retry me"))
            .await
            .expect_err("second failure should surface");

        assert!(matches!(error, ChannelError::ConnectionClosed(_)));
        assert_eq!(transport.sent_count(), 2, "no third attempt");
    }

    #[tokio::test]
    async fn non_connection_errors_are_not_retried() {
        let transport = MockTransport::open();
        transport.queue_send_result(Err(TransportError::Protocol("rate limited".to_string())));
        let pool = MockPool::supplying(vec![Ok(transport.clone())]);
        let adapter = adapter_with_pool(pool);
        adapter.initialize().await.expect("initialize");

        let error = adapter
            .send_message(SendRequest::text("5511988887777", "one shot"))
            .await
            .expect_err("protocol failure should surface");

        assert!(matches!(error, ChannelError::Send(_)));
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn invalid_recipient_fails_before_touching_the_pool() {
        let pool = MockPool::supplying(vec![]);
        let adapter = adapter_with_pool(pool.clone());

        let error = adapter
            .send_message(SendRequest::text("not a number", "hello"))
            .await
            .expect_err("should reject recipient");

        assert!(matches!(error, ChannelError::InvalidRecipient { .. }));
        assert_eq!(pool.acquire_count(), 0);
    }

    #[tokio::test]
    async fn quoted_reply_uses_stored_metadata_when_present() {
        let transport = MockTransport::open();
        let pool = MockPool::supplying(vec![Ok(transport.clone())]);
        let adapter = adapter_with_pool(pool);
        adapter.initialize().await.expect("initialize");

        adapter.process_socket_event(SocketEvent::Message(SocketMessageEvent {
            message_id: "inbound-1".to_string(),
            remote_jid: "123456789-555@g.us".to_string(),
            participant: Some("5511977776666@s.whatsapp.net".to_string()),
            from_me: false,
            body: Some("original".to_string()),
            media_type: None,
            media_url: None,
            caption: None,
            timestamp_millis: 1,
        }));

        adapter
            .send_message(
                SendRequest::text("123456789-555@g.us", "replying").with_quote("inbound-1"),
            )
            .await
            .expect("send");

        let envelope = transport.last_sent();
        let quote = envelope.quote.expect("quote attached");
        assert_eq!(quote.remote_jid, "123456789-555@g.us");
        assert_eq!(
            quote.participant.as_deref(),
            Some("5511977776666@s.whatsapp.net")
        );
        assert!(!quote.from_me);
    }

    #[tokio::test]
    async fn quoted_reply_degrades_to_minimal_quote_on_metadata_miss() {
        let transport = MockTransport::open();
        let pool = MockPool::supplying(vec![Ok(transport.clone())]);
        let adapter = adapter_with_pool(pool);
        adapter.initialize().await.expect("initialize");

        adapter
            .send_message(SendRequest::text("5511988887777", "replying").with_quote("never-seen"))
            .await
            .expect("send should not fail on a quote miss");

        let quote = transport.last_sent().quote.expect("quote attached");
        assert_eq!(quote.message_id, "never-seen");
        assert_eq!(quote.remote_jid, "5511988887777@s.whatsapp.net");
        assert!(quote.participant.is_none());
    }

    #[tokio::test]
    async fn media_buffer_uploads_before_sending() {
        let transport = MockTransport::open();
        let pool = MockPool::supplying(vec![Ok(transport.clone())]);
        let adapter = adapter_with_pool(pool);
        adapter.initialize().await.expect("initialize");

        let message = adapter
            .send_document_message(
                "5511988887777",
                Bytes::from_static(b"%PDF-1.4"),
                "application/pdf",
                "invoice.pdf",
                Some("March invoice"),
            )
            .await
            .expect("document send");

        assert_eq!(transport.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(message.media_type, Some(MediaKind::Document));
        assert_eq!(message.caption.as_deref(), Some("March invoice"));
        match transport.last_sent().payload {
            SocketPayload::Media { kind, filename, .. } => {
                assert_eq!(kind, MediaKind::Document);
                assert_eq!(filename.as_deref(), Some("invoice.pdf"));
            }
            other => panic!("expected media payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn template_content_is_unsupported_on_the_socket_channel() {
        let pool = MockPool::supplying(vec![Ok(MockTransport::open())]);
        let adapter = adapter_with_pool(pool);

        let error = adapter
            .send_message(SendRequest {
                to: "5511988887777".to_string(),
                content: SendContent::Template {
                    name: "welcome".to_string(),
                    language: "en".to_string(),
                    body_parameters: vec![],
                    header: None,
                },
                quoted_message_id: None,
            })
            .await
            .expect_err("templates are not a socket capability");

        assert_eq!(error.code(), "UNSUPPORTED_CONTENT");
    }

    #[test]
    fn vcard_rendering_embeds_the_wa_id() {
        let vcard = render_vcard("Ana Souza", "+55 (11) 98888-7777");
        assert!(vcard.contains("FN:Ana Souza"));
        assert!(vcard.contains("waid=5511988877777") || vcard.contains("waid=5511988887777"));
        assert!(vcard.starts_with("BEGIN:VCARD"));
    }
}
