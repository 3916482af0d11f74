//! Instagram Direct adapter.
//!
//! Shares the Messenger graph send shape but with a narrower capability
//! set: media is restricted to image/video, and document sends degrade to a
//! text message carrying the file name and a download link because the
//! channel has no native document attachment.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::ChannelError;
use crate::events::{ConnectionListener, ListenerSet, MessageListener};
use crate::facebook::{MessengerEvent, attachment_type, convert_messenger_event, init_error};
use crate::menu::{render_button_menu, render_list_menu};
use crate::recipient::normalize_recipient;
use crate::traits::ChannelAdapter;
use crate::types::{
    ChannelKind, ConnectionId, ConnectionStatus, DeliveryAck, MediaKind, MediaSource, MessageId,
    NormalizedMessage, ProfileInfo, RecipientId, SendContent, SendRequest, StatusCell, now_millis,
};

const GRAPH_BASE_URL: &str = "https://graph.facebook.com/v20.0";

pub struct InstagramAdapter {
    connection_id: ConnectionId,
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    status: StatusCell,
    listeners: ListenerSet,
}

impl std::fmt::Debug for InstagramAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstagramAdapter")
            .field("connection_id", &self.connection_id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl InstagramAdapter {
    pub fn new(connection_id: ConnectionId, access_token: &str) -> Result<Self, ChannelError> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(ChannelError::Configuration(
                "instagram access token is required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            connection_id,
            http,
            base_url: GRAPH_BASE_URL.to_string(),
            access_token: access_token.to_string(),
            status: StatusCell::new(ConnectionStatus::Disconnected),
            listeners: ListenerSet::new(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn post_message(&self, payload: &serde_json::Value) -> Result<String, ChannelError> {
        let url = format!("{}/me/messages", self.base_url);
        let response = self
            .http
            .post(url)
            .query(&[("access_token", self.access_token.as_str())])
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ChannelError::send_rejected(status, &body));
        }
        let message_id = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|value| {
                value
                    .get("message_id")
                    .and_then(|id| id.as_str())
                    .map(ToOwned::to_owned)
            });
        Ok(message_id.unwrap_or_else(|| format!("ig:{}", uuid::Uuid::new_v4())))
    }

    /// Entry point for raw webhook messaging events pushed in by the
    /// webhook-delivery collaborator.
    pub fn process_incoming_message(
        &self,
        raw_event: &serde_json::Value,
    ) -> Option<NormalizedMessage> {
        let event: MessengerEvent = match serde_json::from_value(raw_event.clone()) {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(
                    connection_id = self.connection_id,
                    %error,
                    "ignoring unparsable instagram event"
                );
                return None;
            }
        };
        let normalized = convert_messenger_event(ChannelKind::Instagram, &event)?;
        self.listeners.dispatch_message(normalized.clone());
        Some(normalized)
    }
}

/// Fallback body for document sends: the channel cannot attach documents,
/// so the visitor gets the file name plus a download link.
pub(crate) fn build_document_fallback_body(filename: Option<&str>, url: &str) -> String {
    match filename.map(str::trim).filter(|name| !name.is_empty()) {
        Some(filename) => format!("{filename}: {url}"),
        None => url.to_string(),
    }
}

#[async_trait]
impl ChannelAdapter for InstagramAdapter {
    fn channel_kind(&self) -> ChannelKind {
        ChannelKind::Instagram
    }

    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn status(&self) -> ConnectionStatus {
        self.status.load()
    }

    async fn initialize(&self) -> Result<(), ChannelError> {
        self.status.store(ConnectionStatus::Connecting);
        let url = format!("{}/me", self.base_url);
        let response = self
            .http
            .get(url)
            .query(&[("access_token", self.access_token.as_str())])
            .send()
            .await
            .map_err(|error| init_error(ChannelKind::Instagram, error.to_string()))?;
        if !response.status().is_success() {
            self.status.store(ConnectionStatus::Disconnected);
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(init_error(
                ChannelKind::Instagram,
                format!("token probe failed: status={status} body={body}"),
            ));
        }
        self.status.store(ConnectionStatus::Connected);
        self.listeners
            .dispatch_connection_update(ConnectionStatus::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        if self.status.load() != ConnectionStatus::Disconnected {
            self.status.store(ConnectionStatus::Disconnected);
            self.listeners
                .dispatch_connection_update(ConnectionStatus::Disconnected);
        }
        Ok(())
    }

    async fn send_message(&self, request: SendRequest) -> Result<NormalizedMessage, ChannelError> {
        let to = normalize_recipient(ChannelKind::Instagram, &request.to)?;
        request.content.validate()?;

        let (message, body, media_type, caption) = match request.content {
            SendContent::Text { body } => (
                serde_json::json!({ "text": body }),
                body,
                None,
                None,
            ),
            SendContent::Media {
                kind: kind @ (MediaKind::Image | MediaKind::Video),
                source: MediaSource::Url(url),
                caption,
                ..
            } => (
                serde_json::json!({
                    "attachment": {
                        "type": attachment_type(kind),
                        "payload": { "url": url },
                    }
                }),
                caption.clone().unwrap_or_default(),
                Some(kind),
                caption,
            ),
            SendContent::Media {
                kind: MediaKind::Document,
                source: MediaSource::Url(url),
                filename,
                ..
            } => {
                // Degrade rather than reject: the caller's document still
                // reaches the visitor as a download link.
                let text = build_document_fallback_body(filename.as_deref(), &url);
                (serde_json::json!({ "text": text.clone() }), text, None, None)
            }
            SendContent::Media { .. } => {
                return Err(ChannelError::unsupported(ChannelKind::Instagram, "media"));
            }
            SendContent::Buttons { body, buttons } => {
                let rendered = render_button_menu(&body, &buttons);
                (
                    serde_json::json!({ "text": rendered.clone() }),
                    rendered,
                    None,
                    None,
                )
            }
            SendContent::List { body, sections, .. } => {
                let rendered = render_list_menu(&body, &sections);
                (
                    serde_json::json!({ "text": rendered.clone() }),
                    rendered,
                    None,
                    None,
                )
            }
            SendContent::Contact { name, phone } => {
                let text = format!("{name}: {phone}");
                (serde_json::json!({ "text": text.clone() }), text, None, None)
            }
            SendContent::Template { .. } => {
                return Err(ChannelError::unsupported(ChannelKind::Instagram, "template"));
            }
        };

        let payload = serde_json::json!({
            "recipient": { "id": to.as_str() },
            "message": message,
        });
        let message_id = self.post_message(&payload).await?;

        Ok(NormalizedMessage {
            id: MessageId::new(message_id),
            channel: ChannelKind::Instagram,
            from: RecipientId::new("me"),
            to,
            body,
            timestamp_millis: now_millis(),
            from_me: true,
            media_type,
            media_url: None,
            caption,
            delivery_ack: Some(DeliveryAck::ServerAck),
            is_group: false,
            participant_id: None,
        })
    }

    async fn get_profile_info(&self, recipient: &str) -> Option<ProfileInfo> {
        let id = normalize_recipient(ChannelKind::Instagram, recipient).ok()?;
        let url = format!("{}/{}", self.base_url, id.as_str());
        let response = self
            .http
            .get(url)
            .query(&[
                ("fields", "name,profile_pic"),
                ("access_token", self.access_token.as_str()),
            ])
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            tracing::warn!(
                recipient = %id,
                status = %response.status(),
                "instagram profile lookup failed"
            );
            return None;
        }
        let parsed: serde_json::Value = response.json().await.ok()?;
        Some(ProfileInfo {
            id: id.into_inner(),
            name: parsed
                .get("name")
                .and_then(|value| value.as_str())
                .map(ToOwned::to_owned),
            picture_url: parsed
                .get("profile_pic")
                .and_then(|value| value.as_str())
                .map(ToOwned::to_owned),
        })
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
    use super::{InstagramAdapter, build_document_fallback_body};
    use crate::error::ChannelError;
    use crate::traits::ChannelAdapter;
    use crate::types::{MediaKind, MediaSource, SendContent, SendRequest};
    use bytes::Bytes;

    fn adapter() -> InstagramAdapter {
        InstagramAdapter::new(9, "ig-token").expect("adapter")
    }

    #[test]
    fn document_fallback_includes_file_name_and_url() {
        let body =
            build_document_fallback_body(Some("manual.pdf"), "https://files.example/manual.pdf");
        assert!(body.contains("manual.pdf"));
        assert!(body.contains("https://files.example/manual.pdf"));

        let nameless = build_document_fallback_body(None, "https://files.example/x");
        assert_eq!(nameless, "https://files.example/x");
    }

    #[tokio::test]
    async fn document_sends_never_fail_with_unsupported_content() {
        // The payload degrades to text before any capability gate fires;
        // shape it locally without hitting the network.
        let adapter = adapter().with_base_url("http://127.0.0.1:9");
        let result = adapter
            .send_message(SendRequest {
                to: "17890000000000001".to_string(),
                content: SendContent::Media {
                    kind: MediaKind::Document,
                    source: MediaSource::Url("https://files.example/manual.pdf".to_string()),
                    caption: None,
                    filename: Some("manual.pdf".to_string()),
                },
                quoted_message_id: None,
            })
            .await;

        match result {
            // Unroutable base url: the degrade path still reached the wire.
            Err(error) => assert_ne!(
                error.code(),
                "UNSUPPORTED_CONTENT",
                "documents must degrade, not be rejected"
            ),
            Ok(message) => {
                assert!(message.body.contains("manual.pdf"));
            }
        }
    }

    #[tokio::test]
    async fn audio_and_buffer_media_are_rejected_as_unsupported() {
        let adapter = adapter();
        let audio = adapter
            .send_message(SendRequest {
                to: "17890000000000001".to_string(),
                content: SendContent::Media {
                    kind: MediaKind::Audio,
                    source: MediaSource::Url("https://files.example/a.ogg".to_string()),
                    caption: None,
                    filename: None,
                },
                quoted_message_id: None,
            })
            .await
            .expect_err("audio is not an instagram capability");
        assert_eq!(audio.code(), "UNSUPPORTED_CONTENT");

        let buffer = adapter
            .send_message(SendRequest {
                to: "17890000000000001".to_string(),
                content: SendContent::Media {
                    kind: MediaKind::Image,
                    source: MediaSource::Bytes {
                        data: Bytes::from_static(b"fake"),
                        mime_type: "image/png".to_string(),
                    },
                    caption: None,
                    filename: None,
                },
                quoted_message_id: None,
            })
            .await
            .expect_err("buffer uploads are not supported on instagram");
        assert_eq!(buffer.code(), "UNSUPPORTED_CONTENT");
    }

    #[tokio::test]
    async fn inbound_events_share_the_messenger_shape() {
        let adapter = adapter();
        let event = serde_json::json!({
            "sender": { "id": "17890000000000001" },
            "recipient": { "id": "17860000000000009" },
            "timestamp": 1700000000500i64,
            "message": { "mid": "ig_m_1", "text": "saw your story" }
        });

        let message = adapter
            .process_incoming_message(&event)
            .expect("text event converts");
        assert_eq!(message.body, "saw your story");
        assert_eq!(
            message.channel,
            crate::types::ChannelKind::Instagram
        );
    }

    #[test]
    fn constructor_rejects_blank_tokens() {
        assert!(matches!(
            InstagramAdapter::new(1, "").expect_err("blank token"),
            ChannelError::Configuration(_)
        ));
    }
}
