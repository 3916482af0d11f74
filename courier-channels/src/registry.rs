//! Adapter registry/factory.
//!
//! One adapter instance per logical connection for the lifetime of the
//! process. The registry is an explicit, injectable object so tests and
//! shutdown paths control its lifecycle; there is no module-level state.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cloud::{CloudAdapter, ProvisioningSink};
use crate::error::ChannelError;
use crate::facebook::FacebookAdapter;
use crate::instagram::InstagramAdapter;
use crate::socket::{SocketAdapter, TransportPool};
use crate::traits::ChannelAdapter;
use crate::types::{ChannelKind, ConnectionDescriptor, ConnectionId, ConnectionStatus};
use crate::webchat::WebChatAdapter;

/// A constructed adapter, tagged by variant so collaborators that need a
/// channel-specific entry point (webhook ingest, the web-chat router) can
/// reach the concrete type without downcasting.
#[derive(Clone)]
pub enum AdapterHandle {
    Socket(Arc<SocketAdapter>),
    Cloud(Arc<CloudAdapter>),
    Facebook(Arc<FacebookAdapter>),
    Instagram(Arc<InstagramAdapter>),
    WebChat(Arc<WebChatAdapter>),
}

impl std::fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            Self::Socket(_) => "Socket",
            Self::Cloud(_) => "Cloud",
            Self::Facebook(_) => "Facebook",
            Self::Instagram(_) => "Instagram",
            Self::WebChat(_) => "WebChat",
        };
        f.debug_tuple("AdapterHandle").field(&variant).finish()
    }
}

impl AdapterHandle {
    /// The capability interface shared by every variant.
    pub fn adapter(&self) -> Arc<dyn ChannelAdapter> {
        match self {
            Self::Socket(adapter) => adapter.clone(),
            Self::Cloud(adapter) => adapter.clone(),
            Self::Facebook(adapter) => adapter.clone(),
            Self::Instagram(adapter) => adapter.clone(),
            Self::WebChat(adapter) => adapter.clone(),
        }
    }

    pub fn channel_kind(&self) -> ChannelKind {
        self.adapter().channel_kind()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub connected: usize,
    pub by_channel: BTreeMap<String, usize>,
}

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: DashMap<ConnectionId, AdapterHandle>,
    transport_pool: Option<Arc<dyn TransportPool>>,
    provisioning_sink: Option<Arc<dyn ProvisioningSink>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Socket connections need the shared transport pool owned by the
    /// external connection manager.
    pub fn with_transport_pool(mut self, transport_pool: Arc<dyn TransportPool>) -> Self {
        self.transport_pool = Some(transport_pool);
        self
    }

    pub fn with_provisioning_sink(mut self, provisioning_sink: Arc<dyn ProvisioningSink>) -> Self {
        self.provisioning_sink = Some(provisioning_sink);
        self
    }

    /// Return the cached adapter for this connection id, constructing it on
    /// first use. Construction happens under the map's entry lock, so two
    /// callers racing the same id can never build two instances.
    pub fn create_adapter(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<AdapterHandle, ChannelError> {
        match self.adapters.entry(descriptor.id) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let handle = self.build_adapter(descriptor)?;
                entry.insert(handle.clone());
                tracing::info!(
                    connection_id = descriptor.id,
                    channel = %descriptor.channel,
                    name = %descriptor.name,
                    "adapter created"
                );
                Ok(handle)
            }
        }
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<AdapterHandle> {
        self.adapters
            .get(&connection_id)
            .map(|entry| entry.clone())
    }

    /// Evict from the cache without calling `disconnect()`; eviction and
    /// transport teardown are deliberately decoupled so callers control
    /// ordering.
    pub fn remove_adapter(&self, connection_id: ConnectionId) -> Option<AdapterHandle> {
        self.adapters
            .remove(&connection_id)
            .map(|(_, handle)| handle)
    }

    pub fn clear_all(&self) {
        self.adapters.clear();
    }

    pub fn stats(&self) -> RegistryStats {
        let mut by_channel: BTreeMap<String, usize> = BTreeMap::new();
        let mut connected = 0usize;
        let mut total = 0usize;
        for entry in self.adapters.iter() {
            total += 1;
            let adapter = entry.value().adapter();
            *by_channel
                .entry(adapter.channel_kind().as_str().to_string())
                .or_default() += 1;
            if adapter.status() == ConnectionStatus::Connected {
                connected += 1;
            }
        }
        RegistryStats {
            total,
            connected,
            by_channel,
        }
    }

    fn build_adapter(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<AdapterHandle, ChannelError> {
        let credentials = &descriptor.credentials;
        match descriptor.channel {
            ChannelKind::Socket => {
                let Some(pool) = self.transport_pool.clone() else {
                    return Err(missing(descriptor, "a device transport pool"));
                };
                Ok(AdapterHandle::Socket(Arc::new(SocketAdapter::new(
                    descriptor.id,
                    pool,
                )?)))
            }
            ChannelKind::Cloud => {
                let access_token = require(descriptor, credentials.access_token.as_deref(), "access_token")?;
                let business_account_id = require(
                    descriptor,
                    credentials.business_account_id.as_deref(),
                    "business_account_id",
                )?;
                let mut adapter = CloudAdapter::new(descriptor.id, access_token, business_account_id)?
                    .with_phone_number_id(credentials.phone_number_id.clone())
                    .with_two_factor_pin(credentials.two_factor_pin.clone());
                if let Some(sink) = self.provisioning_sink.clone() {
                    adapter = adapter.with_provisioning_sink(sink);
                }
                Ok(AdapterHandle::Cloud(Arc::new(adapter)))
            }
            ChannelKind::Facebook => {
                let page_access_token = require(
                    descriptor,
                    credentials.page_access_token.as_deref(),
                    "page_access_token",
                )?;
                Ok(AdapterHandle::Facebook(Arc::new(FacebookAdapter::new(
                    descriptor.id,
                    page_access_token,
                )?)))
            }
            ChannelKind::Instagram => {
                let access_token = require(descriptor, credentials.access_token.as_deref(), "access_token")?;
                Ok(AdapterHandle::Instagram(Arc::new(InstagramAdapter::new(
                    descriptor.id,
                    access_token,
                )?)))
            }
            ChannelKind::WebChat => {
                let mut adapter = WebChatAdapter::new(descriptor.id)
                    .with_greeting(credentials.greeting.clone());
                if let Some(grace_seconds) = credentials.session_grace_seconds {
                    adapter = adapter
                        .with_grace_window(std::time::Duration::from_secs(grace_seconds.max(1)));
                }
                Ok(AdapterHandle::WebChat(Arc::new(adapter)))
            }
        }
    }
}

fn require<'a>(
    descriptor: &ConnectionDescriptor,
    value: Option<&'a str>,
    field: &str,
) -> Result<&'a str, ChannelError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| missing(descriptor, field))
}

fn missing(descriptor: &ConnectionDescriptor, what: &str) -> ChannelError {
    ChannelError::Configuration(format!(
        "connection {} ({}, {}) is missing {what}",
        descriptor.id, descriptor.name, descriptor.channel
    ))
}
