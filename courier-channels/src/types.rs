use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::ChannelError;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(RecipientId);

/// Numeric id of a logical connection, assigned by the persistence layer.
pub type ConnectionId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Socket,
    Cloud,
    Facebook,
    Instagram,
    #[serde(rename = "webchat")]
    WebChat,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::Cloud => "cloud",
            Self::Facebook => "facebook",
            Self::Instagram => "instagram",
            Self::WebChat => "webchat",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Lock-free status slot shared between an adapter's callers and its inbound
/// event path. Readable without await so `status()` stays synchronous.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn new(status: ConnectionStatus) -> Self {
        Self(AtomicU8::new(Self::encode(status)))
    }

    pub(crate) fn load(&self) -> ConnectionStatus {
        match self.0.load(Ordering::Acquire) {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }

    pub(crate) fn store(&self, status: ConnectionStatus) {
        self.0.store(Self::encode(status), Ordering::Release);
    }

    fn encode(status: ConnectionStatus) -> u8 {
        match status {
            ConnectionStatus::Disconnected => 0,
            ConnectionStatus::Connecting => 1,
            ConnectionStatus::Connected => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Ptt,
    Document,
    Sticker,
}

impl MediaKind {
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.trim().to_ascii_lowercase();
        if mime.starts_with("image/") {
            Self::Image
        } else if mime.starts_with("video/") {
            Self::Video
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else {
            Self::Document
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Ptt => "ptt",
            Self::Document => "document",
            Self::Sticker => "sticker",
        }
    }
}

/// Delivery ack ladder as reported by the socket protocol; REST channels only
/// ever report the first two rungs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryAck {
    Pending,
    ServerAck,
    DeliveryAck,
    Read,
    Played,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Available,
    Unavailable,
    Composing,
    Recording,
    Paused,
}

/// The channel-agnostic message shape produced on both send and receive
/// paths. Invariants: `id` is unique within a channel; `from_me` is true iff
/// the platform, not the remote party, authored the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub id: MessageId,
    pub channel: ChannelKind,
    pub from: RecipientId,
    pub to: RecipientId,
    pub body: String,
    pub timestamp_millis: i64,
    pub from_me: bool,
    #[serde(default)]
    pub media_type: Option<MediaKind>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub delivery_ack: Option<DeliveryAck>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub participant_id: Option<RecipientId>,
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Free-form destination; normalized per channel before any I/O.
    pub to: String,
    pub content: SendContent,
    pub quoted_message_id: Option<MessageId>,
}

impl SendRequest {
    pub fn text(to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            content: SendContent::Text { body: body.into() },
            quoted_message_id: None,
        }
    }

    pub fn with_quote(mut self, quoted_message_id: impl Into<MessageId>) -> Self {
        self.quoted_message_id = Some(quoted_message_id.into());
        self
    }
}

pub const MAX_BUTTONS: usize = 3;
pub const MAX_BUTTON_LABEL_CHARS: usize = 20;
pub const MAX_LIST_SECTIONS: usize = 10;
pub const MAX_LIST_ROWS_PER_SECTION: usize = 10;
pub const MAX_LIST_ROW_TITLE_CHARS: usize = 24;
pub const MAX_LIST_ROW_DESCRIPTION_CHARS: usize = 72;

#[derive(Debug, Clone)]
pub enum SendContent {
    Text {
        body: String,
    },
    Media {
        kind: MediaKind,
        source: MediaSource,
        caption: Option<String>,
        filename: Option<String>,
    },
    Buttons {
        body: String,
        buttons: Vec<Button>,
    },
    List {
        body: String,
        button_label: String,
        sections: Vec<ListSection>,
    },
    Contact {
        name: String,
        phone: String,
    },
    Template {
        name: String,
        language: String,
        body_parameters: Vec<String>,
        header: Option<TemplateHeader>,
    },
}

impl SendContent {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Media { .. } => "media",
            Self::Buttons { .. } => "buttons",
            Self::List { .. } => "list",
            Self::Contact { .. } => "contact",
            Self::Template { .. } => "template",
        }
    }

    /// Local shape validation, performed before any network I/O.
    pub fn validate(&self) -> Result<(), ChannelError> {
        match self {
            Self::Text { body } => {
                if body.trim().is_empty() {
                    return Err(ChannelError::InvalidContent(
                        "message body is empty".to_string(),
                    ));
                }
            }
            Self::Buttons { body, buttons } => {
                if body.trim().is_empty() {
                    return Err(ChannelError::InvalidContent(
                        "button message body is empty".to_string(),
                    ));
                }
                if buttons.is_empty() || buttons.len() > MAX_BUTTONS {
                    return Err(ChannelError::InvalidContent(format!(
                        "button count must be 1..={MAX_BUTTONS}, got {}",
                        buttons.len()
                    )));
                }
                for button in buttons {
                    if button.label.trim().is_empty()
                        || button.label.chars().count() > MAX_BUTTON_LABEL_CHARS
                    {
                        return Err(ChannelError::InvalidContent(format!(
                            "button label {:?} must be 1..={MAX_BUTTON_LABEL_CHARS} chars",
                            button.label
                        )));
                    }
                }
            }
            Self::List { sections, .. } => {
                if sections.is_empty() || sections.len() > MAX_LIST_SECTIONS {
                    return Err(ChannelError::InvalidContent(format!(
                        "list section count must be 1..={MAX_LIST_SECTIONS}, got {}",
                        sections.len()
                    )));
                }
                for section in sections {
                    if section.rows.is_empty() || section.rows.len() > MAX_LIST_ROWS_PER_SECTION {
                        return Err(ChannelError::InvalidContent(format!(
                            "list section {:?} row count must be 1..={MAX_LIST_ROWS_PER_SECTION}",
                            section.title
                        )));
                    }
                    for row in &section.rows {
                        if row.title.trim().is_empty()
                            || row.title.chars().count() > MAX_LIST_ROW_TITLE_CHARS
                        {
                            return Err(ChannelError::InvalidContent(format!(
                                "list row title {:?} must be 1..={MAX_LIST_ROW_TITLE_CHARS} chars",
                                row.title
                            )));
                        }
                        if let Some(description) = &row.description {
                            if description.chars().count() > MAX_LIST_ROW_DESCRIPTION_CHARS {
                                return Err(ChannelError::InvalidContent(format!(
                                    "list row description exceeds {MAX_LIST_ROW_DESCRIPTION_CHARS} chars"
                                )));
                            }
                        }
                    }
                }
            }
            Self::Contact { name, phone } => {
                if name.trim().is_empty() || phone.trim().is_empty() {
                    return Err(ChannelError::InvalidContent(
                        "contact cards require a name and a phone number".to_string(),
                    ));
                }
            }
            Self::Template { name, language, .. } => {
                if name.trim().is_empty() || language.trim().is_empty() {
                    return Err(ChannelError::InvalidContent(
                        "template sends require a template name and language".to_string(),
                    ));
                }
            }
            Self::Media { source, .. } => {
                if let MediaSource::Url(url) = source {
                    if url.trim().is_empty() {
                        return Err(ChannelError::InvalidContent(
                            "media URL is empty".to_string(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum MediaSource {
    Url(String),
    Bytes { data: bytes::Bytes, mime_type: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Button {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TemplateHeader {
    Text(String),
    Media { kind: MediaKind, link: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture_url: Option<String>,
}

/// Connection row handed in by the configuration/persistence layer.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionDescriptor {
    pub id: ConnectionId,
    #[serde(default)]
    pub name: String,
    pub channel: ChannelKind,
    #[serde(default)]
    pub credentials: ConnectionCredentials,
}

/// Per-channel credential bag. Which fields are required depends on the
/// channel and is enforced by the registry before an adapter is built.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionCredentials {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub business_account_id: Option<String>,
    #[serde(default)]
    pub phone_number_id: Option<String>,
    #[serde(default)]
    pub two_factor_pin: Option<String>,
    #[serde(default)]
    pub page_access_token: Option<String>,
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub session_grace_seconds: Option<u64>,
}
