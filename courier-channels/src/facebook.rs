//! Facebook Messenger adapter (graph send API + webhook events).

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::ChannelError;
use crate::events::{ConnectionListener, ListenerSet, MessageListener};
use crate::menu::render_list_menu;
use crate::recipient::normalize_recipient;
use crate::traits::ChannelAdapter;
use crate::types::{
    ChannelKind, ConnectionId, ConnectionStatus, DeliveryAck, MediaKind, MediaSource, MessageId,
    NormalizedMessage, Presence, ProfileInfo, RecipientId, SendContent, SendRequest, StatusCell,
    now_millis,
};

const GRAPH_BASE_URL: &str = "https://graph.facebook.com/v20.0";

pub struct FacebookAdapter {
    connection_id: ConnectionId,
    http: reqwest::Client,
    base_url: String,
    page_access_token: String,
    status: StatusCell,
    listeners: ListenerSet,
}

impl std::fmt::Debug for FacebookAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacebookAdapter")
            .field("connection_id", &self.connection_id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl FacebookAdapter {
    pub fn new(connection_id: ConnectionId, page_access_token: &str) -> Result<Self, ChannelError> {
        let page_access_token = page_access_token.trim();
        if page_access_token.is_empty() {
            return Err(ChannelError::Configuration(
                "facebook page access token is required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            connection_id,
            http,
            base_url: GRAPH_BASE_URL.to_string(),
            page_access_token: page_access_token.to_string(),
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
            .query(&[("access_token", self.page_access_token.as_str())])
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ChannelError::send_rejected(status, &body));
        }
        let parsed: MessengerSendResponse = serde_json::from_str(&body)
            .map_err(|error| ChannelError::Send(format!("unparsable send response: {error}")))?;
        Ok(parsed
            .message_id
            .unwrap_or_else(|| format!("fb:{}", uuid::Uuid::new_v4())))
    }

    /// Two-phase buffer upload: attachment upload API first, then reference
    /// the returned attachment id in the message payload.
    async fn upload_attachment(
        &self,
        kind: MediaKind,
        data: bytes::Bytes,
        mime_type: &str,
    ) -> Result<String, ChannelError> {
        let url = format!("{}/me/message_attachments", self.base_url);
        let message = serde_json::json!({
            "attachment": {
                "type": attachment_type(kind),
                "payload": { "is_reusable": true },
            }
        });
        let part = reqwest::multipart::Part::bytes(data.to_vec())
            .file_name("upload")
            .mime_str(mime_type)
            .map_err(|error| ChannelError::MediaUpload(format!("invalid mime type: {error}")))?;
        let form = reqwest::multipart::Form::new()
            .text("message", message.to_string())
            .part("filedata", part);

        let response = self
            .http
            .post(url)
            .query(&[("access_token", self.page_access_token.as_str())])
            .multipart(form)
            .send()
            .await
            .map_err(|error| ChannelError::MediaUpload(error.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| ChannelError::MediaUpload(error.to_string()))?;
        if !status.is_success() {
            return Err(ChannelError::MediaUpload(format!(
                "status={status} body={body}"
            )));
        }
        let parsed: AttachmentUploadResponse = serde_json::from_str(&body).map_err(|error| {
            ChannelError::MediaUpload(format!("unparsable upload response: {error}"))
        })?;
        Ok(parsed.attachment_id)
    }

    async fn send_action(&self, recipient: &str, action: &str) -> Result<(), ChannelError> {
        let payload = serde_json::json!({
            "recipient": { "id": recipient },
            "sender_action": action,
        });
        let url = format!("{}/me/messages", self.base_url);
        let response = self
            .http
            .post(url)
            .query(&[("access_token", self.page_access_token.as_str())])
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await?;
            return Err(ChannelError::send_rejected(status, &body));
        }
        Ok(())
    }

    /// Entry point for raw webhook messaging events pushed in by the
    /// webhook-delivery collaborator. Returns `None` for non-message events
    /// (delivery receipts, read receipts, postbacks we do not model).
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
                    "ignoring unparsable messenger event"
                );
                return None;
            }
        };
        let normalized = convert_messenger_event(ChannelKind::Facebook, &event)?;
        self.listeners.dispatch_message(normalized.clone());
        Some(normalized)
    }
}

pub(crate) fn attachment_type(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image | MediaKind::Sticker => "image",
        MediaKind::Video => "video",
        MediaKind::Audio | MediaKind::Ptt => "audio",
        MediaKind::Document => "file",
    }
}

pub(crate) fn convert_messenger_event(
    channel: ChannelKind,
    event: &MessengerEvent,
) -> Option<NormalizedMessage> {
    let message = event.message.as_ref()?;
    let sender = event.sender.as_ref()?.id.trim();
    let recipient = event.recipient.as_ref()?.id.trim();
    if sender.is_empty() || recipient.is_empty() {
        return None;
    }
    let from_me = message.is_echo;

    let (media_type, media_url) = message
        .attachments
        .first()
        .map(|attachment| {
            let kind = match attachment.attachment_type.as_str() {
                "image" => MediaKind::Image,
                "video" => MediaKind::Video,
                "audio" => MediaKind::Audio,
                _ => MediaKind::Document,
            };
            (Some(kind), attachment.payload.url.clone())
        })
        .unwrap_or((None, None));

    if message.text.is_none() && media_type.is_none() {
        return None;
    }

    Some(NormalizedMessage {
        id: MessageId::new(message.mid.clone()),
        channel,
        from: RecipientId::new(sender),
        to: RecipientId::new(recipient),
        body: message.text.clone().unwrap_or_default(),
        timestamp_millis: event.timestamp.unwrap_or_else(now_millis),
        from_me,
        media_type,
        media_url,
        caption: None,
        delivery_ack: None,
        is_group: false,
        participant_id: None,
    })
}

#[async_trait]
impl ChannelAdapter for FacebookAdapter {
    fn channel_kind(&self) -> ChannelKind {
        ChannelKind::Facebook
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
            .query(&[("access_token", self.page_access_token.as_str())])
            .send()
            .await
            .map_err(|error| init_error(ChannelKind::Facebook, error.to_string()))?;
        if !response.status().is_success() {
            self.status.store(ConnectionStatus::Disconnected);
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(init_error(
                ChannelKind::Facebook,
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
        let to = normalize_recipient(ChannelKind::Facebook, &request.to)?;
        request.content.validate()?;

        let (message, body, media_type, caption) = match request.content {
            SendContent::Text { body } => (
                serde_json::json!({ "text": body }),
                body,
                None,
                None,
            ),
            SendContent::Media {
                kind,
                source,
                caption,
                ..
            } => {
                let payload = match source {
                    MediaSource::Url(url) => serde_json::json!({
                        "url": url,
                        "is_reusable": true,
                    }),
                    MediaSource::Bytes { data, mime_type } => {
                        let attachment_id = self.upload_attachment(kind, data, &mime_type).await?;
                        serde_json::json!({ "attachment_id": attachment_id })
                    }
                };
                (
                    serde_json::json!({
                        "attachment": {
                            "type": attachment_type(kind),
                            "payload": payload,
                        }
                    }),
                    caption.clone().unwrap_or_default(),
                    Some(kind),
                    caption,
                )
            }
            SendContent::Buttons { body, buttons } => {
                let rendered: Vec<serde_json::Value> = buttons
                    .iter()
                    .map(|button| {
                        serde_json::json!({
                            "type": "postback",
                            "title": button.label,
                            "payload": button.id,
                        })
                    })
                    .collect();
                (
                    serde_json::json!({
                        "attachment": {
                            "type": "template",
                            "payload": {
                                "template_type": "button",
                                "text": body,
                                "buttons": rendered,
                            }
                        }
                    }),
                    body,
                    None,
                    None,
                )
            }
            SendContent::List { body, sections, .. } => {
                // Messenger retired its list template; degrade to a numbered
                // text menu.
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
                return Err(ChannelError::unsupported(ChannelKind::Facebook, "template"));
            }
        };

        let payload = serde_json::json!({
            "recipient": { "id": to.as_str() },
            "messaging_type": "RESPONSE",
            "message": message,
        });
        let message_id = self.post_message(&payload).await?;

        Ok(NormalizedMessage {
            id: MessageId::new(message_id),
            channel: ChannelKind::Facebook,
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

    async fn get_profile_picture(&self, recipient: &str) -> Option<String> {
        self.get_profile_info(recipient)
            .await
            .and_then(|profile| profile.picture_url)
    }

    async fn get_profile_info(&self, recipient: &str) -> Option<ProfileInfo> {
        let id = normalize_recipient(ChannelKind::Facebook, recipient).ok()?;
        let url = format!("{}/{}", self.base_url, id.as_str());
        let response = self
            .http
            .get(url)
            .query(&[
                ("fields", "name,profile_pic"),
                ("access_token", self.page_access_token.as_str()),
            ])
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            tracing::warn!(
                recipient = %id,
                status = %response.status(),
                "messenger profile lookup failed"
            );
            return None;
        }
        let parsed: MessengerProfile = response.json().await.ok()?;
        Some(ProfileInfo {
            id: id.into_inner(),
            name: parsed.name,
            picture_url: parsed.profile_pic,
        })
    }

    async fn mark_as_read(&self, recipient: &str, _message_ids: &[MessageId]) {
        let Ok(id) = normalize_recipient(ChannelKind::Facebook, recipient) else {
            return;
        };
        if let Err(error) = self.send_action(id.as_str(), "mark_seen").await {
            tracing::warn!(recipient = %id, %error, "mark-as-read failed");
        }
    }

    async fn send_presence_update(&self, recipient: &str, presence: Presence) {
        let Ok(id) = normalize_recipient(ChannelKind::Facebook, recipient) else {
            return;
        };
        let action = match presence {
            Presence::Composing | Presence::Recording => "typing_on",
            _ => "typing_off",
        };
        if let Err(error) = self.send_action(id.as_str(), action).await {
            tracing::warn!(recipient = %id, %error, "typing indicator failed");
        }
    }

    async fn on_message(&self, listener: MessageListener) {
        self.listeners.add_message_listener(listener).await;
    }

    async fn on_connection_update(&self, listener: ConnectionListener) {
        self.listeners.add_connection_listener(listener).await;
    }
}

pub(crate) fn init_error(channel: ChannelKind, detail: String) -> ChannelError {
    ChannelError::Initialization {
        channel: channel.as_str().to_string(),
        detail,
    }
}

#[derive(Debug, Deserialize)]
struct MessengerSendResponse {
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentUploadResponse {
    attachment_id: String,
}

#[derive(Debug, Deserialize)]
struct MessengerProfile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    profile_pic: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessengerEvent {
    #[serde(default)]
    pub(crate) sender: Option<MessengerParty>,
    #[serde(default)]
    pub(crate) recipient: Option<MessengerParty>,
    #[serde(default)]
    pub(crate) timestamp: Option<i64>,
    #[serde(default)]
    pub(crate) message: Option<MessengerMessage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessengerParty {
    #[serde(default)]
    pub(crate) id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessengerMessage {
    #[serde(default)]
    pub(crate) mid: String,
    #[serde(default)]
    pub(crate) text: Option<String>,
    #[serde(default)]
    pub(crate) is_echo: bool,
    #[serde(default)]
    pub(crate) attachments: Vec<MessengerAttachment>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessengerAttachment {
    #[serde(rename = "type", default)]
    pub(crate) attachment_type: String,
    #[serde(default)]
    pub(crate) payload: MessengerAttachmentPayload,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct MessengerAttachmentPayload {
    #[serde(default)]
    pub(crate) url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{FacebookAdapter, attachment_type};
    use crate::error::ChannelError;
    use crate::types::MediaKind;

    fn adapter() -> FacebookAdapter {
        FacebookAdapter::new(5, "page-token").expect("adapter")
    }

    #[test]
    fn constructor_rejects_a_blank_page_token() {
        assert!(matches!(
            FacebookAdapter::new(1, "   ").expect_err("blank token"),
            ChannelError::Configuration(_)
        ));
    }

    #[test]
    fn attachment_types_map_documents_to_file() {
        assert_eq!(attachment_type(MediaKind::Document), "file");
        assert_eq!(attachment_type(MediaKind::Ptt), "audio");
        assert_eq!(attachment_type(MediaKind::Sticker), "image");
    }

    #[tokio::test]
    async fn inbound_text_events_normalize_with_sender_and_recipient() {
        let adapter = adapter();
        let event = serde_json::json!({
            "sender": { "id": "2401111111111111" },
            "recipient": { "id": "1020304050" },
            "timestamp": 1700000000123i64,
            "message": { "mid": "m_abc", "text": "hi there" }
        });

        let message = adapter
            .process_incoming_message(&event)
            .expect("text message converts");
        assert_eq!(message.body, "hi there");
        assert_eq!(message.from.as_str(), "2401111111111111");
        assert_eq!(message.to.as_str(), "1020304050");
        assert_eq!(message.timestamp_millis, 1_700_000_000_123);
        assert!(!message.from_me);
    }

    #[tokio::test]
    async fn echo_events_are_marked_as_authored_by_us() {
        let adapter = adapter();
        let event = serde_json::json!({
            "sender": { "id": "1020304050" },
            "recipient": { "id": "2401111111111111" },
            "timestamp": 1700000000123i64,
            "message": { "mid": "m_echo", "text": "agent reply", "is_echo": true }
        });

        let message = adapter
            .process_incoming_message(&event)
            .expect("echo converts");
        assert!(message.from_me);
    }

    #[tokio::test]
    async fn attachment_events_carry_media_url_and_kind() {
        let adapter = adapter();
        let event = serde_json::json!({
            "sender": { "id": "2401111111111111" },
            "recipient": { "id": "1020304050" },
            "message": {
                "mid": "m_img",
                "attachments": [
                    { "type": "image", "payload": { "url": "https://cdn.example/p.jpg" } }
                ]
            }
        });

        let message = adapter
            .process_incoming_message(&event)
            .expect("attachment converts");
        assert_eq!(message.media_type, Some(MediaKind::Image));
        assert_eq!(message.media_url.as_deref(), Some("https://cdn.example/p.jpg"));
    }

    #[tokio::test]
    async fn delivery_receipts_are_ignored() {
        let adapter = adapter();
        let event = serde_json::json!({
            "sender": { "id": "2401111111111111" },
            "recipient": { "id": "1020304050" },
            "delivery": { "watermark": 1700000000000i64 }
        });
        assert!(adapter.process_incoming_message(&event).is_none());
    }
}
