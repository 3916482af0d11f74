//! Recipient normalization.
//!
//! Converts free-form phone numbers / platform user ids into the canonical
//! per-channel address. Normalization is idempotent: feeding a canonical
//! address back in returns it unchanged.

use crate::error::ChannelError;
use crate::types::{ChannelKind, RecipientId};

pub(crate) const SOCKET_USER_SUFFIX: &str = "@s.whatsapp.net";
pub(crate) const SOCKET_GROUP_SUFFIX: &str = "@g.us";
const SOCKET_BROADCAST_SUFFIX: &str = "@broadcast";

const CLOUD_MIN_DIGITS: usize = 5;
const CLOUD_MAX_DIGITS: usize = 15;

/// Canonicalize `input` for `channel`, or fail with `INVALID_RECIPIENT`
/// before any network I/O happens.
pub fn normalize_recipient(
    channel: ChannelKind,
    input: &str,
) -> Result<RecipientId, ChannelError> {
    match channel {
        ChannelKind::Socket => normalize_socket_jid(input),
        ChannelKind::Cloud => normalize_cloud_number(input),
        ChannelKind::Facebook | ChannelKind::Instagram => normalize_platform_id(channel, input),
        ChannelKind::WebChat => normalize_session_recipient(input),
    }
}

pub(crate) fn is_group_jid(jid: &str) -> bool {
    jid.ends_with(SOCKET_GROUP_SUFFIX)
}

fn normalize_socket_jid(input: &str) -> Result<RecipientId, ChannelError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid(ChannelKind::Socket, input, "address is empty"));
    }

    if trimmed.contains('@') {
        let known_suffix = [
            SOCKET_USER_SUFFIX,
            SOCKET_GROUP_SUFFIX,
            SOCKET_BROADCAST_SUFFIX,
        ]
        .iter()
        .any(|suffix| trimmed.ends_with(suffix));
        if !known_suffix {
            return Err(invalid(
                ChannelKind::Socket,
                input,
                "unknown address domain suffix",
            ));
        }
        return Ok(RecipientId::new(trimmed));
    }

    let digits = strip_phone_punctuation(trimmed);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid(
            ChannelKind::Socket,
            input,
            "expected a phone number or a canonical jid",
        ));
    }
    Ok(RecipientId::new(format!("{digits}{SOCKET_USER_SUFFIX}")))
}

fn normalize_cloud_number(input: &str) -> Result<RecipientId, ChannelError> {
    let digits = strip_phone_punctuation(input.trim());
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid(
            ChannelKind::Cloud,
            input,
            "expected an E.164-like phone number",
        ));
    }
    if digits.len() < CLOUD_MIN_DIGITS || digits.len() > CLOUD_MAX_DIGITS {
        return Err(invalid(
            ChannelKind::Cloud,
            input,
            "phone number length out of range",
        ));
    }
    Ok(RecipientId::new(digits))
}

fn normalize_platform_id(
    channel: ChannelKind,
    input: &str,
) -> Result<RecipientId, ChannelError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid(channel, input, "platform user id is empty"));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(invalid(
            channel,
            input,
            "platform user id contains whitespace",
        ));
    }
    Ok(RecipientId::new(trimmed))
}

fn normalize_session_recipient(input: &str) -> Result<RecipientId, ChannelError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid(
            ChannelKind::WebChat,
            input,
            "session recipient id is empty",
        ));
    }
    Ok(RecipientId::new(trimmed))
}

fn strip_phone_punctuation(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '+' | '-' | '.' | '(' | ')' | ' '))
        .collect()
}

fn invalid(channel: ChannelKind, input: &str, reason: &str) -> ChannelError {
    ChannelError::InvalidRecipient {
        input: input.to_string(),
        reason: format!("{reason} ({channel})"),
    }
}
