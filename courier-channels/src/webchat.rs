//! Embedded web-chat adapter.
//!
//! One adapter instance serves a WebSocket namespace shared by many
//! concurrent visitor sessions. Sessions survive a transport drop for a
//! grace window so a reloading browser keeps its identity; with no
//! reconnect, the session is evicted and sends fail with
//! `SESSION_NOT_FOUND`.

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ChannelError;
use crate::events::{ConnectionListener, ListenerSet, MessageListener};
use crate::menu::{render_button_menu, render_list_menu};
use crate::recipient::normalize_recipient;
use crate::traits::ChannelAdapter;
use crate::types::{
    ChannelKind, ConnectionId, ConnectionStatus, MediaKind, MediaSource, MessageId,
    NormalizedMessage, Presence, RecipientId, SendContent, SendRequest, StatusCell, now_millis,
};

const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Frames sent to the visitor's browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionFrame {
    Session {
        recipient_id: String,
        #[serde(default)]
        greeting: Option<String>,
    },
    Message {
        id: String,
        body: String,
        #[serde(default)]
        media_url: Option<String>,
        #[serde(default)]
        media_type: Option<MediaKind>,
    },
    Typing {
        active: bool,
    },
}

/// Frames received from the visitor's browser.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum VisitorFrame {
    Message {
        content: String,
    },
    Identify {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        email: Option<String>,
    },
    Typing {
        #[serde(default)]
        active: bool,
    },
}

#[derive(Debug, Clone)]
pub struct WebChatSession {
    pub session_id: String,
    pub recipient_id: String,
    pub visitor_name: Option<String>,
    pub visitor_email: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    outbound: Option<mpsc::UnboundedSender<SessionFrame>>,
    /// Bumped on every attach/detach; a pending eviction only fires if the
    /// generation it captured is still current.
    generation: u64,
}

pub struct WebChatAdapter {
    connection_id: ConnectionId,
    greeting: Option<String>,
    grace_window: Duration,
    sessions: DashMap<String, WebChatSession>,
    status: StatusCell,
    listeners: ListenerSet,
}

impl WebChatAdapter {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            greeting: None,
            grace_window: DEFAULT_GRACE_WINDOW,
            sessions: DashMap::new(),
            status: StatusCell::new(ConnectionStatus::Disconnected),
            listeners: ListenerSet::new(),
        }
    }

    pub fn with_greeting(mut self, greeting: Option<String>) -> Self {
        self.greeting = greeting
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn with_grace_window(mut self, grace_window: Duration) -> Self {
        self.grace_window = grace_window;
        self
    }

    /// Router serving the visitor WebSocket at `/ws`. A reconnecting
    /// visitor passes its prior recipient id as `?session=`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route("/ws", get(ws_upgrade)).with_state(self)
    }

    pub fn session(&self, recipient_id: &str) -> Option<WebChatSession> {
        self.sessions.get(recipient_id).map(|entry| entry.clone())
    }

    fn own_address(&self) -> String {
        format!("webchat:{}", self.connection_id)
    }

    /// Mint a fresh session, or reattach to a live one when the visitor
    /// presents a known recipient id inside the grace window.
    pub(crate) fn open_session(
        &self,
        requested: Option<&str>,
    ) -> (String, mpsc::UnboundedReceiver<SessionFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(requested) = requested {
            if let Some(mut session) = self.sessions.get_mut(requested) {
                session.generation += 1;
                session.outbound = Some(tx.clone());
                session.last_activity_at = Utc::now();
                let _ = tx.send(SessionFrame::Session {
                    recipient_id: session.recipient_id.clone(),
                    greeting: None,
                });
                tracing::debug!(recipient_id = %requested, "web chat session resumed");
                return (requested.to_string(), rx);
            }
        }

        let recipient_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.sessions.insert(
            recipient_id.clone(),
            WebChatSession {
                session_id: Uuid::new_v4().to_string(),
                recipient_id: recipient_id.clone(),
                visitor_name: None,
                visitor_email: None,
                started_at: now,
                last_activity_at: now,
                outbound: Some(tx.clone()),
                generation: 0,
            },
        );
        let _ = tx.send(SessionFrame::Session {
            recipient_id: recipient_id.clone(),
            greeting: self.greeting.clone(),
        });
        tracing::debug!(recipient_id = %recipient_id, "web chat session started");
        (recipient_id, rx)
    }

    /// Drop the transport and schedule eviction after the grace window.
    /// A reattach inside the window bumps the generation, which cancels the
    /// pending eviction.
    pub(crate) fn detach_session(self: Arc<Self>, recipient_id: &str) {
        let generation = {
            let Some(mut session) = self.sessions.get_mut(recipient_id) else {
                return;
            };
            session.outbound = None;
            session.generation += 1;
            session.generation
        };

        let adapter = self;
        let recipient_id = recipient_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(adapter.grace_window).await;
            let expired = adapter
                .sessions
                .get(&recipient_id)
                .map(|session| session.generation == generation && session.outbound.is_none())
                .unwrap_or(false);
            if expired {
                adapter.sessions.remove(&recipient_id);
                tracing::info!(
                    recipient_id = %recipient_id,
                    "web chat session expired after grace window"
                );
            }
        });
    }

    pub(crate) fn apply_identity(
        &self,
        recipient_id: &str,
        name: Option<String>,
        email: Option<String>,
    ) {
        if let Some(mut session) = self.sessions.get_mut(recipient_id) {
            if let Some(name) = name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
                session.visitor_name = Some(name.to_string());
            }
            if let Some(email) = email.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
                session.visitor_email = Some(email.to_string());
            }
            session.last_activity_at = Utc::now();
        }
    }

    pub(crate) fn handle_visitor_message(
        &self,
        recipient_id: &str,
        content: String,
    ) -> NormalizedMessage {
        if let Some(mut session) = self.sessions.get_mut(recipient_id) {
            session.last_activity_at = Utc::now();
        }
        let message = NormalizedMessage {
            id: MessageId::new(Uuid::new_v4().to_string()),
            channel: ChannelKind::WebChat,
            from: RecipientId::new(recipient_id),
            to: RecipientId::new(self.own_address()),
            body: content,
            timestamp_millis: now_millis(),
            from_me: false,
            media_type: None,
            media_url: None,
            caption: None,
            delivery_ack: None,
            is_group: false,
            participant_id: None,
        };
        self.listeners.dispatch_message(message.clone());
        message
    }

    fn push_frame(&self, recipient_id: &str, frame: SessionFrame) -> Result<(), ChannelError> {
        let Some(session) = self.sessions.get(recipient_id) else {
            return Err(ChannelError::SessionNotFound(recipient_id.to_string()));
        };
        let Some(outbound) = &session.outbound else {
            return Err(ChannelError::ConnectionClosed(
                "visitor transport is detached".to_string(),
            ));
        };
        outbound
            .send(frame)
            .map_err(|_| ChannelError::ConnectionClosed("visitor socket closed".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    session: Option<String>,
}

async fn ws_upgrade(
    State(adapter): State<Arc<WebChatAdapter>>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(adapter, socket, query.session))
}

#[tracing::instrument(level = "info", skip_all)]
async fn handle_socket(adapter: Arc<WebChatAdapter>, socket: WebSocket, requested: Option<String>) {
    let (recipient_id, mut frames) = adapter.open_session(requested.as_deref());
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let forward_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: VisitorFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(%error, recipient_id = %recipient_id, "invalid visitor frame");
                continue;
            }
        };
        match frame {
            VisitorFrame::Message { content } => {
                let content = content.trim().to_string();
                if !content.is_empty() {
                    adapter.handle_visitor_message(&recipient_id, content);
                }
            }
            VisitorFrame::Identify { name, email } => {
                adapter.apply_identity(&recipient_id, name, email);
            }
            VisitorFrame::Typing { .. } => {
                adapter.apply_identity(&recipient_id, None, None);
            }
        }
    }

    forward_task.abort();
    adapter.detach_session(&recipient_id);
}

#[async_trait]
impl ChannelAdapter for WebChatAdapter {
    fn channel_kind(&self) -> ChannelKind {
        ChannelKind::WebChat
    }

    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn status(&self) -> ConnectionStatus {
        self.status.load()
    }

    async fn initialize(&self) -> Result<(), ChannelError> {
        // The namespace is live as soon as the HTTP layer mounts the router.
        self.status.store(ConnectionStatus::Connected);
        self.listeners
            .dispatch_connection_update(ConnectionStatus::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        self.sessions.clear();
        if self.status.load() != ConnectionStatus::Disconnected {
            self.status.store(ConnectionStatus::Disconnected);
            self.listeners
                .dispatch_connection_update(ConnectionStatus::Disconnected);
        }
        Ok(())
    }

    async fn send_message(&self, request: SendRequest) -> Result<NormalizedMessage, ChannelError> {
        let to = normalize_recipient(ChannelKind::WebChat, &request.to)?;
        request.content.validate()?;

        let message_id = Uuid::new_v4().to_string();
        let (frame, body, media_type, media_url, caption) = match request.content {
            SendContent::Text { body } => (
                SessionFrame::Message {
                    id: message_id.clone(),
                    body: body.clone(),
                    media_url: None,
                    media_type: None,
                },
                body,
                None,
                None,
                None,
            ),
            SendContent::Media {
                kind,
                source: MediaSource::Url(url),
                caption,
                ..
            } => (
                SessionFrame::Message {
                    id: message_id.clone(),
                    body: caption.clone().unwrap_or_default(),
                    media_url: Some(url.clone()),
                    media_type: Some(kind),
                },
                caption.clone().unwrap_or_default(),
                Some(kind),
                Some(url),
                caption,
            ),
            SendContent::Media { .. } => {
                return Err(ChannelError::unsupported(ChannelKind::WebChat, "media"));
            }
            SendContent::Buttons { body, buttons } => {
                let rendered = render_button_menu(&body, &buttons);
                (
                    SessionFrame::Message {
                        id: message_id.clone(),
                        body: rendered.clone(),
                        media_url: None,
                        media_type: None,
                    },
                    rendered,
                    None,
                    None,
                    None,
                )
            }
            SendContent::List { body, sections, .. } => {
                let rendered = render_list_menu(&body, &sections);
                (
                    SessionFrame::Message {
                        id: message_id.clone(),
                        body: rendered.clone(),
                        media_url: None,
                        media_type: None,
                    },
                    rendered,
                    None,
                    None,
                    None,
                )
            }
            SendContent::Contact { name, phone } => {
                let text = format!("{name}: {phone}");
                (
                    SessionFrame::Message {
                        id: message_id.clone(),
                        body: text.clone(),
                        media_url: None,
                        media_type: None,
                    },
                    text,
                    None,
                    None,
                    None,
                )
            }
            SendContent::Template { .. } => {
                return Err(ChannelError::unsupported(ChannelKind::WebChat, "template"));
            }
        };

        self.push_frame(to.as_str(), frame)?;

        Ok(NormalizedMessage {
            id: MessageId::new(message_id),
            channel: ChannelKind::WebChat,
            from: RecipientId::new(self.own_address()),
            to,
            body,
            timestamp_millis: now_millis(),
            from_me: true,
            media_type,
            media_url,
            caption,
            delivery_ack: None,
            is_group: false,
            participant_id: None,
        })
    }

    async fn send_presence_update(&self, recipient: &str, presence: Presence) {
        let Ok(to) = normalize_recipient(ChannelKind::WebChat, recipient) else {
            return;
        };
        let active = matches!(presence, Presence::Composing | Presence::Recording);
        if let Err(error) = self.push_frame(to.as_str(), SessionFrame::Typing { active }) {
            tracing::debug!(recipient = %to, %error, "typing frame not delivered");
        }
    }

    async fn on_message(&self, listener: MessageListener) {
        self.listeners.add_message_listener(listener).await;
    }

    async fn on_connection_update(&self, listener: ConnectionListener) {
        self.listeners.add_connection_listener(listener).await;
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionFrame, WebChatAdapter};
    use crate::error::ChannelError;
    use crate::traits::ChannelAdapter;
    use crate::types::{SendRequest};
    use std::sync::Arc;
    use std::time::Duration;

    fn adapter() -> Arc<WebChatAdapter> {
        Arc::new(
            WebChatAdapter::new(11)
                .with_greeting(Some("Welcome!".to_string()))
                .with_grace_window(Duration::from_secs(300)),
        )
    }

    #[tokio::test]
    async fn fresh_sessions_receive_a_session_frame_with_the_greeting() {
        let adapter = adapter();
        let (recipient_id, mut frames) = adapter.open_session(None);

        match frames.recv().await.expect("session frame") {
            SessionFrame::Session {
                recipient_id: announced,
                greeting,
            } => {
                assert_eq!(announced, recipient_id);
                assert_eq!(greeting.as_deref(), Some("Welcome!"));
            }
            other => panic!("expected session frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sends_to_a_live_session_reach_the_visitor() {
        let adapter = adapter();
        let (recipient_id, mut frames) = adapter.open_session(None);
        let _ = frames.recv().await;

        let message = adapter
            .send_message(SendRequest::text(recipient_id.clone(), "agent here"))
            .await
            .expect("send");

        assert!(message.from_me);
        assert_eq!(message.body, "agent here");
        match frames.recv().await.expect("message frame") {
            SessionFrame::Message { body, .. } => assert_eq!(body, "agent here"),
            other => panic!("expected message frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sends_to_unknown_recipients_fail_with_session_not_found() {
        let adapter = adapter();
        let error = adapter
            .send_message(SendRequest::text("no-such-visitor", "hello?"))
            .await
            .expect_err("unknown session");
        assert!(matches!(error, ChannelError::SessionNotFound(_)));
        assert_eq!(error.code(), "SESSION_NOT_FOUND");
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_inside_the_grace_window_preserves_identity() {
        let adapter = adapter();
        let (recipient_id, _frames) = adapter.open_session(None);
        adapter.apply_identity(
            &recipient_id,
            Some("Ana".to_string()),
            Some("ana@example.com".to_string()),
        );
        adapter.clone().detach_session(&recipient_id);

        // Reattach before the grace window elapses; this must cancel the
        // pending eviction.
        let (resumed_id, mut frames) = adapter.open_session(Some(&recipient_id));
        assert_eq!(resumed_id, recipient_id);
        match frames.recv().await.expect("session frame") {
            SessionFrame::Session { recipient_id: announced, greeting } => {
                assert_eq!(announced, recipient_id);
                assert!(greeting.is_none(), "resumed sessions skip the greeting");
            }
            other => panic!("expected session frame, got {other:?}"),
        }

        // Let the stale eviction timer fire; the session must survive it.
        tokio::time::sleep(Duration::from_secs(301)).await;
        let session = adapter.session(&recipient_id).expect("session survives");
        assert_eq!(session.visitor_name.as_deref(), Some("Ana"));
        assert_eq!(session.visitor_email.as_deref(), Some("ana@example.com"));

        adapter
            .send_message(SendRequest::text(recipient_id.clone(), "still with you"))
            .await
            .expect("send after resume");
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_expire_after_the_grace_window_without_reconnect() {
        let adapter = adapter();
        let (recipient_id, _frames) = adapter.open_session(None);
        adapter.clone().detach_session(&recipient_id);

        tokio::time::sleep(Duration::from_secs(301)).await;

        assert!(adapter.session(&recipient_id).is_none());
        let error = adapter
            .send_message(SendRequest::text(recipient_id, "anyone?"))
            .await
            .expect_err("expired session");
        assert!(matches!(error, ChannelError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn detached_but_unexpired_sessions_report_a_closed_transport() {
        let adapter = adapter();
        let (recipient_id, _frames) = adapter.open_session(None);
        adapter.clone().detach_session(&recipient_id);

        let error = adapter
            .send_message(SendRequest::text(recipient_id, "hello"))
            .await
            .expect_err("no live transport");
        assert!(matches!(error, ChannelError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn inbound_visitor_messages_are_normalized() {
        let adapter = adapter();
        let (recipient_id, _frames) = adapter.open_session(None);

        let message = adapter.handle_visitor_message(&recipient_id, "I need help".to_string());
        assert!(!message.from_me);
        assert_eq!(message.from.as_str(), recipient_id);
        assert_eq!(message.body, "I need help");
        assert_eq!(message.to.as_str(), "webchat:11");
    }
}
