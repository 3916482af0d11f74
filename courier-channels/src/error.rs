use thiserror::Error;

/// Error taxonomy shared by every channel adapter.
///
/// Each variant maps to a stable machine-readable code via [`code`]; the
/// ticket layer branches on codes, never on display strings.
/// `CONNECTION_CLOSED` is the one code requiring operator action (relink the
/// device) rather than automatic recovery.
///
/// [`code`]: ChannelError::code
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Missing or invalid credentials/config. Raised before any network
    /// call; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Credential/transport validation failed during `initialize`.
    #[error("{channel} initialization failed: {detail}")]
    Initialization { channel: String, detail: String },

    /// A previously live transport is gone and the single retry did not
    /// recover it.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The readiness check failed and one reinitialization did not produce a
    /// usable transport.
    #[error("socket transport not available: {0}")]
    SocketNotAvailable(String),

    /// Recipient normalization failed; no network I/O was attempted.
    #[error("invalid recipient {input:?}: {reason}")]
    InvalidRecipient { input: String, reason: String },

    /// The content kind is not meaningful on this channel.
    #[error("{channel} does not support {kind} content")]
    UnsupportedContent { channel: String, kind: &'static str },

    /// The content violates local shape limits (button/list bounds, empty
    /// body). Checked before any network I/O.
    #[error("invalid message content: {0}")]
    InvalidContent(String),

    /// Channel-imposed edit/delete age limit exceeded; checked locally.
    #[error("message is outside the {window} window")]
    MessageTooOld { window: &'static str },

    #[error("message editing is not supported on {0}")]
    EditNotSupported(String),

    #[error("message deletion is not supported on {0}")]
    DeleteNotSupported(String),

    /// Media upload failed before delivery was attempted. Distinct from
    /// [`ChannelError::Send`] so callers can retry the upload alone.
    #[error("media upload failed: {0}")]
    MediaUpload(String),

    /// The channel rejected the delivery itself.
    #[error("send failed: {0}")]
    Send(String),

    /// Web-chat: no live, non-expired session for the recipient id.
    #[error("web chat session not found for {0}")]
    SessionNotFound(String),

    /// Network-level failure talking to a stateless REST channel.
    #[error("transport error")]
    Transport(#[from] reqwest::Error),
}

impl ChannelError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Initialization { .. } => "INITIALIZATION_ERROR",
            Self::ConnectionClosed(_) => "CONNECTION_CLOSED",
            Self::SocketNotAvailable(_) => "SOCKET_NOT_AVAILABLE",
            Self::InvalidRecipient { .. } => "INVALID_RECIPIENT",
            Self::UnsupportedContent { .. } => "UNSUPPORTED_CONTENT",
            Self::InvalidContent(_) => "INVALID_CONTENT",
            Self::MessageTooOld { .. } => "MESSAGE_TOO_OLD",
            Self::EditNotSupported(_) => "EDIT_NOT_SUPPORTED",
            Self::DeleteNotSupported(_) => "DELETE_NOT_SUPPORTED",
            Self::MediaUpload(_) => "MEDIA_UPLOAD_ERROR",
            Self::Send(_) => "SEND_MESSAGE_ERROR",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::Transport(_) => "TRANSPORT_ERROR",
        }
    }

    pub(crate) fn unsupported(channel: crate::types::ChannelKind, kind: &'static str) -> Self {
        Self::UnsupportedContent {
            channel: channel.as_str().to_string(),
            kind,
        }
    }

    pub(crate) fn send_rejected(status: reqwest::StatusCode, body: &str) -> Self {
        Self::Send(format!("status={status} body={body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::ChannelError;
    use crate::types::ChannelKind;

    #[test]
    fn codes_are_stable_and_distinct_per_failure_family() {
        assert_eq!(
            ChannelError::Configuration("x".into()).code(),
            "CONFIGURATION_ERROR"
        );
        assert_eq!(
            ChannelError::ConnectionClosed("x".into()).code(),
            "CONNECTION_CLOSED"
        );
        assert_eq!(
            ChannelError::MediaUpload("x".into()).code(),
            "MEDIA_UPLOAD_ERROR"
        );
        assert_eq!(ChannelError::Send("x".into()).code(), "SEND_MESSAGE_ERROR");
        assert_ne!(
            ChannelError::MediaUpload("x".into()).code(),
            ChannelError::Send("x".into()).code(),
            "upload failures must stay distinguishable from delivery failures"
        );
    }

    #[test]
    fn unsupported_content_names_the_channel_and_kind() {
        let error = ChannelError::unsupported(ChannelKind::Instagram, "template");
        assert_eq!(error.code(), "UNSUPPORTED_CONTENT");
        assert!(error.to_string().contains("instagram"));
        assert!(error.to_string().contains("template"));
    }
}
