//! Channel adapters for Courier.
//!
//! Every messaging backend (device-linked socket protocol, WhatsApp Cloud
//! API, Facebook Messenger, Instagram Direct, embedded web chat) is exposed
//! behind one capability interface producing one `NormalizedMessage` shape.
//! The rest of the platform talks to adapters exclusively through the
//! `AdapterRegistry` and never sees a channel-specific payload.

mod cloud;
mod error;
mod events;
mod facebook;
mod instagram;
mod menu;
mod recipient;
mod registry;
mod socket;
mod traits;
mod types;
mod webchat;

pub use cloud::{CloudAdapter, CloudProvisioning, ProvisioningSink};
pub use error::ChannelError;
pub use events::{ConnectionListener, ListenerSet, MessageListener};
pub use facebook::FacebookAdapter;
pub use instagram::InstagramAdapter;
pub use recipient::normalize_recipient;
pub use registry::{AdapterHandle, AdapterRegistry, RegistryStats};
pub use socket::{
    MediaHandle, QuoteRef, SocketAdapter, SocketEnvelope, SocketEvent, SocketMessageEvent,
    SocketPayload, SocketReceipt, SocketTransport, TransportError, TransportPool,
};
pub use traits::ChannelAdapter;
pub use types::{
    Button, ChannelKind, ConnectionCredentials, ConnectionDescriptor, ConnectionId,
    ConnectionStatus, DeliveryAck, ListRow, ListSection, MediaKind, MediaSource, MessageId,
    NormalizedMessage, Presence, ProfileInfo, RecipientId, SendContent, SendRequest,
    TemplateHeader,
};
pub use webchat::{SessionFrame, WebChatAdapter, WebChatSession};
