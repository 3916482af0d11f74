use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ChannelError;
use crate::events::{ConnectionListener, MessageListener};
use crate::types::{
    ChannelKind, ConnectionId, ConnectionStatus, MediaKind, MediaSource, MessageId,
    NormalizedMessage, Presence, ProfileInfo, SendContent, SendRequest,
};

/// The capability interface implemented by every channel variant.
///
/// Operations that must surface failure return `Result`; advisory
/// operations (presence, read receipts, profile lookups) return `Option` or
/// `()` and log failures instead, so a presence hiccup can never masquerade
/// as a send failure.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel_kind(&self) -> ChannelKind;

    fn connection_id(&self) -> ConnectionId;

    /// Current connectivity, readable without await.
    fn status(&self) -> ConnectionStatus;

    /// Validate credentials/transport and transition to `Connected`.
    /// Never retried automatically.
    async fn initialize(&self) -> Result<(), ChannelError>;

    /// Release the transport and notify connection listeners. Idempotent.
    async fn disconnect(&self) -> Result<(), ChannelError>;

    /// Single send entry point: normalizes the recipient, validates content
    /// shape, then dispatches on the content kind.
    async fn send_message(&self, request: SendRequest) -> Result<NormalizedMessage, ChannelError>;

    async fn edit_message(
        &self,
        _to: &str,
        _message_id: &str,
        _body: &str,
        _sent_at_millis: i64,
    ) -> Result<(), ChannelError> {
        Err(ChannelError::EditNotSupported(
            self.channel_kind().as_str().to_string(),
        ))
    }

    async fn delete_message(
        &self,
        _to: &str,
        _message_id: &str,
        _sent_at_millis: i64,
    ) -> Result<(), ChannelError> {
        Err(ChannelError::DeleteNotSupported(
            self.channel_kind().as_str().to_string(),
        ))
    }

    /// Best-effort avatar lookup; `None` when the channel has no such
    /// concept or the lookup fails.
    async fn get_profile_picture(&self, _recipient: &str) -> Option<String> {
        None
    }

    /// Best-effort status/about text lookup.
    async fn get_status(&self, _recipient: &str) -> Option<String> {
        None
    }

    async fn get_profile_info(&self, _recipient: &str) -> Option<ProfileInfo> {
        None
    }

    /// Advisory; failures are swallowed and logged.
    async fn mark_as_read(&self, _recipient: &str, _message_ids: &[MessageId]) {}

    /// Advisory; failures are swallowed and logged.
    async fn send_presence_update(&self, _recipient: &str, _presence: Presence) {}

    async fn on_message(&self, listener: MessageListener);

    async fn on_connection_update(&self, listener: ConnectionListener);

    fn supports_editing(&self) -> bool {
        false
    }

    fn supports_deleting(&self) -> bool {
        false
    }

    fn supports_templates(&self) -> bool {
        false
    }

    async fn send_document_message(
        &self,
        to: &str,
        data: Bytes,
        mime_type: &str,
        filename: &str,
        caption: Option<&str>,
    ) -> Result<NormalizedMessage, ChannelError> {
        self.send_buffer(to, MediaKind::Document, data, mime_type, Some(filename), caption)
            .await
    }

    async fn send_image_message(
        &self,
        to: &str,
        data: Bytes,
        mime_type: &str,
        caption: Option<&str>,
    ) -> Result<NormalizedMessage, ChannelError> {
        self.send_buffer(to, MediaKind::Image, data, mime_type, None, caption)
            .await
    }

    async fn send_video_message(
        &self,
        to: &str,
        data: Bytes,
        mime_type: &str,
        caption: Option<&str>,
    ) -> Result<NormalizedMessage, ChannelError> {
        self.send_buffer(to, MediaKind::Video, data, mime_type, None, caption)
            .await
    }

    async fn send_audio_message(
        &self,
        to: &str,
        data: Bytes,
        mime_type: &str,
    ) -> Result<NormalizedMessage, ChannelError> {
        self.send_buffer(to, MediaKind::Audio, data, mime_type, None, None)
            .await
    }

    /// Shared body of the buffer-based convenience wrappers.
    async fn send_buffer(
        &self,
        to: &str,
        kind: MediaKind,
        data: Bytes,
        mime_type: &str,
        filename: Option<&str>,
        caption: Option<&str>,
    ) -> Result<NormalizedMessage, ChannelError> {
        self.send_message(SendRequest {
            to: to.to_string(),
            content: SendContent::Media {
                kind,
                source: MediaSource::Bytes {
                    data,
                    mime_type: mime_type.to_string(),
                },
                caption: caption.map(ToOwned::to_owned),
                filename: filename.map(ToOwned::to_owned),
            },
            quoted_message_id: None,
        })
        .await
    }
}
