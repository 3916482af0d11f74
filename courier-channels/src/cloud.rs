//! WhatsApp Business Cloud API adapter.
//!
//! Stateless REST: every operation is an independent authenticated graph
//! call. `initialize` resolves the phone number bound to the business
//! account and performs the idempotent provisioning side effects (app
//! subscription, two-factor registration); media sends follow the two-phase
//! upload-then-reference protocol.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use crate::error::ChannelError;
use crate::events::{ConnectionListener, ListenerSet, MessageListener};
use crate::recipient::normalize_recipient;
use crate::traits::ChannelAdapter;
use crate::types::{
    ChannelKind, ConnectionId, ConnectionStatus, DeliveryAck, MediaKind, MediaSource, MessageId,
    NormalizedMessage, RecipientId, SendContent, SendRequest, StatusCell, TemplateHeader,
    now_millis,
};

const GRAPH_BASE_URL: &str = "https://graph.facebook.com/v20.0";

/// Channel-imposed validity windows, checked locally before any network
/// round trip.
const EDIT_WINDOW_MILLIS: i64 = 15 * 60 * 1000;
const DELETE_WINDOW_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Metadata resolved during `initialize` and written back to the
/// connection's persisted record.
#[derive(Debug, Clone)]
pub struct CloudProvisioning {
    pub phone_number_id: String,
    pub business_account_id: String,
    pub display_phone_number: String,
    pub status: ConnectionStatus,
}

/// Persistence seam for the one side-effecting write this layer performs.
/// Implementations live in the configuration/persistence layer; a failing
/// write is logged and never blocks connectivity.
#[async_trait]
pub trait ProvisioningSink: Send + Sync {
    async fn record_cloud_provisioning(
        &self,
        connection_id: ConnectionId,
        provisioning: &CloudProvisioning,
    ) -> anyhow::Result<()>;
}

pub struct CloudAdapter {
    connection_id: ConnectionId,
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    business_account_id: String,
    phone_number_id: StdMutex<Option<String>>,
    two_factor_pin: Option<String>,
    sink: Option<Arc<dyn ProvisioningSink>>,
    status: StatusCell,
    listeners: ListenerSet,
}

impl std::fmt::Debug for CloudAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudAdapter")
            .field("connection_id", &self.connection_id)
            .field("base_url", &self.base_url)
            .field("business_account_id", &self.business_account_id)
            .finish_non_exhaustive()
    }
}

impl CloudAdapter {
    pub fn new(
        connection_id: ConnectionId,
        access_token: &str,
        business_account_id: &str,
    ) -> Result<Self, ChannelError> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(ChannelError::Configuration(
                "cloud access token is required".to_string(),
            ));
        }
        let business_account_id = business_account_id.trim();
        if business_account_id.is_empty() {
            return Err(ChannelError::Configuration(
                "cloud business account id is required".to_string(),
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
            business_account_id: business_account_id.to_string(),
            phone_number_id: StdMutex::new(None),
            two_factor_pin: None,
            sink: None,
            status: StatusCell::new(ConnectionStatus::Disconnected),
            listeners: ListenerSet::new(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_phone_number_id(self, phone_number_id: Option<String>) -> Self {
        *self.phone_number_id.lock().expect("phone number id") = phone_number_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn with_two_factor_pin(mut self, two_factor_pin: Option<String>) -> Self {
        self.two_factor_pin = two_factor_pin
            .as_deref()
            .map(str::trim)
            .filter(|pin| !pin.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn with_provisioning_sink(mut self, sink: Arc<dyn ProvisioningSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn phone_number_id(&self) -> Result<String, ChannelError> {
        self.phone_number_id
            .lock()
            .expect("phone number id")
            .clone()
            .ok_or_else(|| {
                ChannelError::Configuration(
                    "cloud phone number id is not resolved; call initialize first".to_string(),
                )
            })
    }

    fn messages_url(&self) -> Result<String, ChannelError> {
        Ok(format!("{}/{}/messages", self.base_url, self.phone_number_id()?))
    }

    async fn graph_post(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ChannelError::send_rejected(status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|error| ChannelError::Send(format!("unparsable graph response: {error}")))
    }

    /// Phase one of the media protocol: upload raw bytes, get an opaque id.
    async fn upload_media_bytes(&self, data: Bytes, mime_type: &str) -> Result<String, ChannelError> {
        let url = format!("{}/{}/media", self.base_url, self.phone_number_id()?);
        let part = reqwest::multipart::Part::bytes(data.to_vec())
            .file_name("upload")
            .mime_str(mime_type)
            .map_err(|error| ChannelError::MediaUpload(format!("invalid mime type: {error}")))?;
        let form = reqwest::multipart::Form::new()
            .text("messaging_product", "whatsapp")
            .part("file", part);

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
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
        let parsed: MediaUploadResponse = serde_json::from_str(&body)
            .map_err(|error| ChannelError::MediaUpload(format!("unparsable upload response: {error}")))?;
        Ok(parsed.id)
    }

    async fn fetch_and_upload(&self, link: &str) -> Result<String, ChannelError> {
        let response = self
            .http
            .get(link)
            .send()
            .await
            .map_err(|error| ChannelError::MediaUpload(format!("fetch {link}: {error}")))?;
        if !response.status().is_success() {
            return Err(ChannelError::MediaUpload(format!(
                "fetch {link}: status={}",
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
            .map_err(|error| ChannelError::MediaUpload(format!("fetch {link}: {error}")))?;
        self.upload_media_bytes(data, &mime_type).await
    }

    async fn build_template_components(
        &self,
        body_parameters: &[String],
        header: Option<TemplateHeader>,
    ) -> Result<Vec<serde_json::Value>, ChannelError> {
        let mut components = Vec::new();

        // Header media links are uploaded transparently so callers never
        // pre-upload template media themselves.
        if let Some(header) = header {
            let parameter = match header {
                TemplateHeader::Text(text) => serde_json::json!({
                    "type": "text",
                    "text": text,
                }),
                TemplateHeader::Media { kind, link } => {
                    let media_id = self.fetch_and_upload(&link).await?;
                    let key = cloud_media_type(kind);
                    serde_json::json!({
                        "type": key,
                        key: { "id": media_id },
                    })
                }
            };
            components.push(serde_json::json!({
                "type": "header",
                "parameters": [parameter],
            }));
        }

        if !body_parameters.is_empty() {
            let parameters: Vec<serde_json::Value> = body_parameters
                .iter()
                .map(|text| serde_json::json!({ "type": "text", "text": text }))
                .collect();
            components.push(serde_json::json!({
                "type": "body",
                "parameters": parameters,
            }));
        }

        Ok(components)
    }

    async fn post_send(
        &self,
        to: &RecipientId,
        mut payload: serde_json::Value,
        quoted_message_id: Option<&MessageId>,
        body: String,
        media_type: Option<MediaKind>,
        caption: Option<String>,
    ) -> Result<NormalizedMessage, ChannelError> {
        if let Some(quoted) = quoted_message_id {
            payload["context"] = serde_json::json!({ "message_id": quoted.as_str() });
        }
        let url = self.messages_url()?;
        let response = self.graph_post(&url, &payload).await?;
        let parsed: CloudSendResponse = serde_json::from_value(response)
            .map_err(|error| ChannelError::Send(format!("unparsable send response: {error}")))?;
        let message_id = parsed
            .messages
            .into_iter()
            .next()
            .map(|message| message.id)
            .ok_or_else(|| ChannelError::Send("send response carried no message id".to_string()))?;

        Ok(NormalizedMessage {
            id: MessageId::new(message_id),
            channel: ChannelKind::Cloud,
            from: RecipientId::new(self.phone_number_id()?),
            to: to.clone(),
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

    /// Entry point for raw webhook change envelopes pushed in by the
    /// webhook-delivery collaborator. Normalizes every message in the
    /// envelope, dispatches each to listeners, and returns them.
    pub fn process_webhook_event(&self, payload: &serde_json::Value) -> Vec<NormalizedMessage> {
        let parsed: WebhookPayload = match serde_json::from_value(payload.clone()) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::warn!(
                    connection_id = self.connection_id,
                    %error,
                    "ignoring unparsable cloud webhook payload"
                );
                return Vec::new();
            }
        };

        let mut messages = Vec::new();
        for entry in parsed.entry {
            for change in entry.changes {
                let own_number = change
                    .value
                    .metadata
                    .as_ref()
                    .map(|metadata| metadata.identity())
                    .unwrap_or_default();
                for message in &change.value.messages {
                    if let Some(normalized) = convert_webhook_message(message, &own_number) {
                        self.listeners.dispatch_message(normalized.clone());
                        messages.push(normalized);
                    }
                }
            }
        }
        messages
    }
}

fn cloud_media_type(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "image",
        MediaKind::Video => "video",
        MediaKind::Audio | MediaKind::Ptt => "audio",
        MediaKind::Document => "document",
        MediaKind::Sticker => "sticker",
    }
}

/// Message payload fragment for a media send: either a previously uploaded
/// id or a direct link.
fn build_media_value(
    kind: MediaKind,
    reference: MediaReference,
    caption: Option<&str>,
    filename: Option<&str>,
) -> serde_json::Value {
    let mut media = match reference {
        MediaReference::Id(id) => serde_json::json!({ "id": id }),
        MediaReference::Link(link) => serde_json::json!({ "link": link }),
    };
    // Captions are not meaningful on audio or sticker sends.
    if !matches!(kind, MediaKind::Audio | MediaKind::Ptt | MediaKind::Sticker) {
        if let Some(caption) = caption {
            media["caption"] = serde_json::json!(caption);
        }
        if kind == MediaKind::Document {
            if let Some(filename) = filename {
                media["filename"] = serde_json::json!(filename);
            }
        }
    }
    media
}

enum MediaReference {
    Id(String),
    Link(String),
}

fn convert_webhook_message(
    message: &WebhookMessage,
    own_number: &str,
) -> Option<NormalizedMessage> {
    let from = message.from.trim();
    if from.is_empty() {
        return None;
    }
    let timestamp_millis = message
        .timestamp
        .as_deref()
        .and_then(|seconds| seconds.parse::<i64>().ok())
        .map(|seconds| seconds * 1000)
        .unwrap_or_else(now_millis);

    let (body, media_type, caption) = match message.message_type.as_str() {
        "text" => (message.text.as_ref()?.body.clone(), None, None),
        "image" | "video" | "audio" | "document" | "sticker" => {
            let media = message.media_for_type()?;
            let kind = match message.message_type.as_str() {
                "image" => MediaKind::Image,
                "video" => MediaKind::Video,
                "audio" => MediaKind::Audio,
                "sticker" => MediaKind::Sticker,
                _ => MediaKind::Document,
            };
            (
                media.caption.clone().unwrap_or_default(),
                Some(kind),
                media.caption.clone(),
            )
        }
        "interactive" => {
            let reply = message.interactive.as_ref()?.reply_title()?;
            (reply, None, None)
        }
        _ => return None,
    };

    Some(NormalizedMessage {
        id: MessageId::new(message.id.clone()),
        channel: ChannelKind::Cloud,
        from: RecipientId::new(from),
        to: RecipientId::new(own_number),
        body,
        timestamp_millis,
        from_me: false,
        media_type,
        media_url: None,
        caption,
        delivery_ack: None,
        is_group: false,
        participant_id: None,
    })
}

#[async_trait]
impl ChannelAdapter for CloudAdapter {
    fn channel_kind(&self) -> ChannelKind {
        ChannelKind::Cloud
    }

    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn status(&self) -> ConnectionStatus {
        self.status.load()
    }

    async fn initialize(&self) -> Result<(), ChannelError> {
        self.status.store(ConnectionStatus::Connecting);

        let url = format!("{}/{}/phone_numbers", self.base_url, self.business_account_id);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|error| init_error(error.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| init_error(error.to_string()))?;
        if !status.is_success() {
            self.status.store(ConnectionStatus::Disconnected);
            return Err(init_error(format!("status={status} body={body}")));
        }
        let parsed: PhoneNumbersResponse = serde_json::from_str(&body)
            .map_err(|error| init_error(format!("unparsable phone number list: {error}")))?;

        let configured = self.phone_number_id.lock().expect("phone number id").clone();
        let entry = match configured {
            Some(id) => parsed.data.into_iter().find(|entry| entry.id == id),
            None => parsed.data.into_iter().next(),
        };
        let Some(entry) = entry else {
            self.status.store(ConnectionStatus::Disconnected);
            return Err(init_error(
                "business account has no matching phone number".to_string(),
            ));
        };
        *self.phone_number_id.lock().expect("phone number id") = Some(entry.id.clone());

        // Idempotent provisioning. The account may already be provisioned
        // from a prior run, so failures here are warnings, not fatal.
        let subscribe_url = format!(
            "{}/{}/subscribed_apps",
            self.base_url, self.business_account_id
        );
        if let Err(error) = self
            .graph_post(&subscribe_url, &serde_json::json!({}))
            .await
        {
            tracing::warn!(
                connection_id = self.connection_id,
                %error,
                "app subscription call failed; assuming already subscribed"
            );
        }

        if let Some(pin) = &self.two_factor_pin {
            let register_url = format!("{}/{}/register", self.base_url, entry.id);
            let payload = serde_json::json!({
                "messaging_product": "whatsapp",
                "pin": pin,
            });
            if let Err(error) = self.graph_post(&register_url, &payload).await {
                tracing::warn!(
                    connection_id = self.connection_id,
                    %error,
                    "two-factor registration failed; assuming already registered"
                );
            }
        }

        self.status.store(ConnectionStatus::Connected);
        self.listeners
            .dispatch_connection_update(ConnectionStatus::Connected);

        if let Some(sink) = &self.sink {
            let provisioning = CloudProvisioning {
                phone_number_id: entry.id,
                business_account_id: self.business_account_id.clone(),
                display_phone_number: entry.display_phone_number.unwrap_or_default(),
                status: ConnectionStatus::Connected,
            };
            if let Err(error) = sink
                .record_cloud_provisioning(self.connection_id, &provisioning)
                .await
            {
                // Connectivity is still usable even when the persisted
                // record update fails.
                tracing::warn!(
                    connection_id = self.connection_id,
                    %error,
                    "failed to persist cloud provisioning metadata"
                );
            }
        }

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
        let to = normalize_recipient(ChannelKind::Cloud, &request.to)?;
        request.content.validate()?;

        let base = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to.as_str(),
        });

        let (payload, body, media_type, caption) = match request.content {
            SendContent::Text { body } => {
                let mut payload = base;
                payload["type"] = serde_json::json!("text");
                payload["text"] = serde_json::json!({
                    "preview_url": false,
                    "body": body,
                });
                (payload, body, None, None)
            }
            SendContent::Media {
                kind,
                source,
                caption,
                filename,
            } => {
                let reference = match source {
                    MediaSource::Url(link) => MediaReference::Link(link),
                    MediaSource::Bytes { data, mime_type } => {
                        MediaReference::Id(self.upload_media_bytes(data, &mime_type).await?)
                    }
                };
                let key = cloud_media_type(kind);
                let mut payload = base;
                payload["type"] = serde_json::json!(key);
                payload[key] =
                    build_media_value(kind, reference, caption.as_deref(), filename.as_deref());
                (payload, String::new(), Some(kind), caption)
            }
            SendContent::Buttons { body, buttons } => {
                let rendered: Vec<serde_json::Value> = buttons
                    .iter()
                    .map(|button| {
                        serde_json::json!({
                            "type": "reply",
                            "reply": { "id": button.id, "title": button.label },
                        })
                    })
                    .collect();
                let mut payload = base;
                payload["type"] = serde_json::json!("interactive");
                payload["interactive"] = serde_json::json!({
                    "type": "button",
                    "body": { "text": body },
                    "action": { "buttons": rendered },
                });
                (payload, body, None, None)
            }
            SendContent::List {
                body,
                button_label,
                sections,
            } => {
                let rendered: Vec<serde_json::Value> = sections
                    .iter()
                    .map(|section| {
                        let rows: Vec<serde_json::Value> = section
                            .rows
                            .iter()
                            .map(|row| {
                                serde_json::json!({
                                    "id": row.id,
                                    "title": row.title,
                                    "description": row.description.clone().unwrap_or_default(),
                                })
                            })
                            .collect();
                        serde_json::json!({ "title": section.title, "rows": rows })
                    })
                    .collect();
                let mut payload = base;
                payload["type"] = serde_json::json!("interactive");
                payload["interactive"] = serde_json::json!({
                    "type": "list",
                    "body": { "text": body },
                    "action": { "button": button_label, "sections": rendered },
                });
                (payload, body, None, None)
            }
            SendContent::Contact { name, phone } => {
                let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
                let mut payload = base;
                payload["type"] = serde_json::json!("contacts");
                payload["contacts"] = serde_json::json!([{
                    "name": { "formatted_name": name, "first_name": name },
                    "phones": [{ "phone": format!("+{digits}"), "wa_id": digits }],
                }]);
                (payload, name, None, None)
            }
            SendContent::Template {
                name,
                language,
                body_parameters,
                header,
            } => {
                let components = self
                    .build_template_components(&body_parameters, header)
                    .await?;
                let mut payload = base;
                payload["type"] = serde_json::json!("template");
                payload["template"] = serde_json::json!({
                    "name": name,
                    "language": { "code": language },
                    "components": components,
                });
                (payload, name, None, None)
            }
        };

        self.post_send(
            &to,
            payload,
            request.quoted_message_id.as_ref(),
            body,
            media_type,
            caption,
        )
        .await
    }

    async fn edit_message(
        &self,
        to: &str,
        message_id: &str,
        body: &str,
        sent_at_millis: i64,
    ) -> Result<(), ChannelError> {
        let to = normalize_recipient(ChannelKind::Cloud, to)?;
        if now_millis() - sent_at_millis > EDIT_WINDOW_MILLIS {
            return Err(ChannelError::MessageTooOld {
                window: "15-minute edit",
            });
        }
        let payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "to": to.as_str(),
            "type": "text",
            "text": { "body": body },
            "edit": { "message_id": message_id },
        });
        let url = self.messages_url()?;
        self.graph_post(&url, &payload).await.map(|_| ())
    }

    async fn delete_message(
        &self,
        _to: &str,
        message_id: &str,
        sent_at_millis: i64,
    ) -> Result<(), ChannelError> {
        if now_millis() - sent_at_millis > DELETE_WINDOW_MILLIS {
            return Err(ChannelError::MessageTooOld {
                window: "24-hour delete",
            });
        }
        let url = format!(
            "{}/{}/messages/{}",
            self.base_url,
            self.phone_number_id()?,
            message_id
        );
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(ChannelError::send_rejected(status, &body));
        }
        Ok(())
    }

    async fn mark_as_read(&self, _recipient: &str, message_ids: &[MessageId]) {
        let Ok(url) = self.messages_url() else {
            return;
        };
        for message_id in message_ids {
            let payload = serde_json::json!({
                "messaging_product": "whatsapp",
                "status": "read",
                "message_id": message_id.as_str(),
            });
            if let Err(error) = self.graph_post(&url, &payload).await {
                tracing::warn!(
                    connection_id = self.connection_id,
                    message_id = %message_id,
                    %error,
                    "read receipt failed"
                );
            }
        }
    }

    async fn on_message(&self, listener: MessageListener) {
        self.listeners.add_message_listener(listener).await;
    }

    async fn on_connection_update(&self, listener: ConnectionListener) {
        self.listeners.add_connection_listener(listener).await;
    }

    fn supports_editing(&self) -> bool {
        true
    }

    fn supports_deleting(&self) -> bool {
        true
    }

    fn supports_templates(&self) -> bool {
        true
    }
}

fn init_error(detail: String) -> ChannelError {
    ChannelError::Initialization {
        channel: ChannelKind::Cloud.as_str().to_string(),
        detail,
    }
}

#[derive(Debug, Deserialize)]
struct MediaUploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CloudSendResponse {
    #[serde(default)]
    messages: Vec<CloudSentMessage>,
}

#[derive(Debug, Deserialize)]
struct CloudSentMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PhoneNumbersResponse {
    #[serde(default)]
    data: Vec<PhoneNumberEntry>,
}

#[derive(Debug, Deserialize)]
struct PhoneNumberEntry {
    id: String,
    #[serde(default)]
    display_phone_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
struct WebhookChange {
    #[serde(default)]
    value: WebhookChangeValue,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookChangeValue {
    #[serde(default)]
    metadata: Option<WebhookMetadata>,
    #[serde(default)]
    messages: Vec<WebhookMessage>,
}

#[derive(Debug, Deserialize)]
struct WebhookMetadata {
    #[serde(default)]
    phone_number_id: Option<String>,
    #[serde(default)]
    display_phone_number: Option<String>,
}

impl WebhookMetadata {
    fn identity(&self) -> String {
        self.display_phone_number
            .clone()
            .or_else(|| self.phone_number_id.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "type", default)]
    message_type: String,
    #[serde(default)]
    text: Option<WebhookText>,
    #[serde(default)]
    image: Option<WebhookMedia>,
    #[serde(default)]
    video: Option<WebhookMedia>,
    #[serde(default)]
    audio: Option<WebhookMedia>,
    #[serde(default)]
    document: Option<WebhookMedia>,
    #[serde(default)]
    sticker: Option<WebhookMedia>,
    #[serde(default)]
    interactive: Option<WebhookInteractive>,
}

impl WebhookMessage {
    fn media_for_type(&self) -> Option<&WebhookMedia> {
        match self.message_type.as_str() {
            "image" => self.image.as_ref(),
            "video" => self.video.as_ref(),
            "audio" => self.audio.as_ref(),
            "document" => self.document.as_ref(),
            "sticker" => self.sticker.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookText {
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct WebhookMedia {
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookInteractive {
    #[serde(default)]
    button_reply: Option<WebhookReply>,
    #[serde(default)]
    list_reply: Option<WebhookReply>,
}

impl WebhookInteractive {
    fn reply_title(&self) -> Option<String> {
        self.button_reply
            .as_ref()
            .or(self.list_reply.as_ref())
            .map(|reply| reply.title.clone())
    }
}

#[derive(Debug, Deserialize)]
struct WebhookReply {
    #[serde(default)]
    title: String,
}

#[cfg(test)]
mod tests {
    use super::{CloudAdapter, MediaReference, build_media_value, cloud_media_type};
    use crate::error::ChannelError;
    use crate::traits::ChannelAdapter;
    use crate::types::{Button, MediaKind, SendContent, SendRequest, now_millis};

    fn adapter() -> CloudAdapter {
        CloudAdapter::new(3, "token", "waba-1")
            .expect("adapter")
            .with_phone_number_id(Some("phone-1".to_string()))
    }

    #[test]
    fn constructor_rejects_missing_credentials() {
        assert!(matches!(
            CloudAdapter::new(1, "  ", "waba").expect_err("blank token"),
            ChannelError::Configuration(_)
        ));
        assert!(matches!(
            CloudAdapter::new(1, "token", "").expect_err("blank business account"),
            ChannelError::Configuration(_)
        ));
    }

    #[tokio::test]
    async fn stale_edit_is_rejected_locally_before_any_network_call() {
        let adapter = adapter().with_base_url("http://graph.invalid");
        let sixteen_minutes_ago = now_millis() - 16 * 60 * 1000;

        let error = adapter
            .edit_message("15551234567", "wamid.1", "corrected", sixteen_minutes_ago)
            .await
            .expect_err("stale edit must fail");

        assert_eq!(error.code(), "MESSAGE_TOO_OLD");
    }

    #[tokio::test]
    async fn stale_delete_is_rejected_locally() {
        let adapter = adapter().with_base_url("http://graph.invalid");
        let yesterday_plus = now_millis() - 25 * 60 * 60 * 1000;

        let error = adapter
            .delete_message("15551234567", "wamid.1", yesterday_plus)
            .await
            .expect_err("stale delete must fail");

        assert!(matches!(error, ChannelError::MessageTooOld { .. }));
    }

    #[tokio::test]
    async fn button_limit_violations_fail_before_any_network_call() {
        let adapter = adapter().with_base_url("http://graph.invalid");
        let error = adapter
            .send_message(SendRequest {
                to: "15551234567".to_string(),
                content: SendContent::Buttons {
                    body: "choose".to_string(),
                    buttons: (0..4)
                        .map(|i| Button {
                            id: i.to_string(),
                            label: format!("b{i}"),
                        })
                        .collect(),
                },
                quoted_message_id: None,
            })
            .await
            .expect_err("four buttons exceed the limit");

        assert!(matches!(error, ChannelError::InvalidContent(_)));
    }

    #[test]
    fn media_value_uses_link_or_id_and_respects_captions() {
        let linked = build_media_value(
            MediaKind::Image,
            MediaReference::Link("https://cdn.example/a.png".to_string()),
            Some("look"),
            None,
        );
        assert_eq!(linked["link"], "https://cdn.example/a.png");
        assert_eq!(linked["caption"], "look");

        let uploaded = build_media_value(
            MediaKind::Document,
            MediaReference::Id("media-9".to_string()),
            Some("contract"),
            Some("contract.pdf"),
        );
        assert_eq!(uploaded["id"], "media-9");
        assert_eq!(uploaded["filename"], "contract.pdf");

        let audio = build_media_value(
            MediaKind::Ptt,
            MediaReference::Id("media-2".to_string()),
            Some("ignored"),
            None,
        );
        assert!(audio.get("caption").is_none(), "audio carries no caption");
        assert_eq!(cloud_media_type(MediaKind::Ptt), "audio");
    }

    #[tokio::test]
    async fn webhook_messages_normalize_text_media_and_interactive_replies() {
        let adapter = adapter();
        let payload = serde_json::json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "metadata": {
                            "phone_number_id": "phone-1",
                            "display_phone_number": "15550001111"
                        },
                        "messages": [
                            {
                                "id": "wamid.text",
                                "from": "15551234567",
                                "timestamp": "1700000000",
                                "type": "text",
                                "text": { "body": "hello" }
                            },
                            {
                                "id": "wamid.image",
                                "from": "15551234567",
                                "timestamp": "1700000001",
                                "type": "image",
                                "image": { "caption": "my roof" }
                            },
                            {
                                "id": "wamid.reply",
                                "from": "15551234567",
                                "timestamp": "1700000002",
                                "type": "interactive",
                                "interactive": {
                                    "button_reply": { "id": "support", "title": "Support" }
                                }
                            }
                        ]
                    }
                }]
            }]
        });

        let messages = adapter.process_webhook_event(&payload);
        assert_eq!(messages.len(), 3);

        assert_eq!(messages[0].body, "hello");
        assert_eq!(messages[0].timestamp_millis, 1_700_000_000_000);
        assert!(!messages[0].from_me);
        assert_eq!(messages[0].to.as_str(), "15550001111");

        assert_eq!(messages[1].media_type, Some(MediaKind::Image));
        assert_eq!(messages[1].caption.as_deref(), Some("my roof"));

        assert_eq!(messages[2].body, "Support");
    }

    #[tokio::test]
    async fn unknown_webhook_event_kinds_are_ignored() {
        let adapter = adapter();
        let payload = serde_json::json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "messages": [{
                            "id": "wamid.x",
                            "from": "15551234567",
                            "type": "unsupported_thing"
                        }]
                    }
                }]
            }]
        });
        assert!(adapter.process_webhook_event(&payload).is_empty());
    }
}
