use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Credentials;

/// Client settings with the documented defaults.
///
/// The struct deserialises cleanly from a host application's config file;
/// every field falls back to its default when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Initial endpoint (`host:port`) when no cluster resolver is in play.
    pub address: String,
    pub connection_timeout_ms: u64,
    /// Reconnection budget; `-1` means infinite.
    pub max_reconnections: i32,
    pub reconnection_delay: DelaySettings,
    pub default_credentials: Option<Credentials>,
    pub heartbeat: HeartbeatSettings,
    pub operation: OperationSettings,
    /// Default for reads and subscriptions that do not choose explicitly.
    pub resolve_link_tos: bool,
    /// Route writes to the master node.
    pub require_master: bool,
    /// Page size for catch-up subscriptions' historical reads.
    pub read_batch_size: usize,
    pub backpressure: BackpressureSettings,
    /// Cap on packets stashed while reconnecting; the oldest is failed with
    /// `ConnectionLost` on overflow.
    pub stash_limit: usize,
    /// Cap on live events buffered while a catch-up subscription pages
    /// history; overflow drops the subscription.
    pub live_buffer_limit: usize,
    pub cluster: Option<ClusterSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:1113".to_string(),
            connection_timeout_ms: 1_000,
            max_reconnections: 100,
            reconnection_delay: DelaySettings::default(),
            default_credentials: None,
            heartbeat: HeartbeatSettings::default(),
            operation: OperationSettings::default(),
            resolve_link_tos: false,
            require_master: true,
            read_batch_size: 500,
            backpressure: BackpressureSettings::default(),
            stash_limit: 512,
            live_buffer_limit: 65_536,
            cluster: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("address must be host:port, got {address:?}")]
    InvalidAddress { address: String },
    #[error("read_batch_size must be at least 1")]
    ZeroBatchSize,
    #[error("backpressure watermarks must satisfy low <= high <= max")]
    WatermarksOutOfOrder,
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let (host, port) = self
            .address
            .rsplit_once(':')
            .ok_or_else(|| SettingsError::InvalidAddress {
                address: self.address.clone(),
            })?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(SettingsError::InvalidAddress {
                address: self.address.clone(),
            });
        }
        if self.read_batch_size == 0 {
            return Err(SettingsError::ZeroBatchSize);
        }
        let bp = &self.backpressure;
        if bp.low_bytes > bp.high_bytes || bp.high_bytes > bp.max_bytes {
            return Err(SettingsError::WatermarksOutOfOrder);
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DelaySettings {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for DelaySettings {
    fn default() -> Self {
        Self {
            min_ms: 250,
            max_ms: 10_000,
        }
    }
}

impl DelaySettings {
    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms.max(self.min_ms))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            timeout_ms: 5_000,
        }
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationSettings {
    pub max_retries: u32,
    pub timeout_ms: u64,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            max_retries: 10,
            timeout_ms: 30_000,
        }
    }
}

impl OperationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Inbound frame-buffer watermarks, in bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureSettings {
    pub low_bytes: usize,
    pub high_bytes: usize,
    pub max_bytes: usize,
}

impl Default for BackpressureSettings {
    fn default() -> Self {
        Self {
            low_bytes: 1 << 20,
            high_bytes: 4 << 20,
            max_bytes: 64 << 20,
        }
    }
}

/// Gossip-based discovery inputs, consumed by a cluster-aware endpoint
/// resolver. The core only carries the values.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClusterSettings {
    pub gossip_seeds: Vec<String>,
    pub gossip_timeout_ms: u64,
    pub discover_attempts: u32,
}

/// Partial settings for layering on top of [`Settings`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SettingsOverride {
    pub address: Option<String>,
    pub connection_timeout_ms: Option<u64>,
    pub max_reconnections: Option<i32>,
    pub reconnection_delay: Option<DelaySettings>,
    pub default_credentials: Option<Credentials>,
    pub heartbeat: Option<HeartbeatSettings>,
    pub operation: Option<OperationSettings>,
    pub resolve_link_tos: Option<bool>,
    pub require_master: Option<bool>,
    pub read_batch_size: Option<usize>,
    pub backpressure: Option<BackpressureSettings>,
    pub stash_limit: Option<usize>,
    pub live_buffer_limit: Option<usize>,
    pub cluster: Option<ClusterSettings>,
}

impl SettingsOverride {
    pub fn apply_to(&self, target: &mut Settings) {
        if let Some(address) = self.address.as_ref() {
            target.address = address.clone();
        }
        if let Some(timeout) = self.connection_timeout_ms {
            target.connection_timeout_ms = timeout;
        }
        if let Some(max) = self.max_reconnections {
            target.max_reconnections = max;
        }
        if let Some(delay) = self.reconnection_delay {
            target.reconnection_delay = delay;
        }
        if let Some(creds) = self.default_credentials.as_ref() {
            target.default_credentials = Some(creds.clone());
        }
        if let Some(heartbeat) = self.heartbeat {
            target.heartbeat = heartbeat;
        }
        if let Some(operation) = self.operation {
            target.operation = operation;
        }
        if let Some(resolve) = self.resolve_link_tos {
            target.resolve_link_tos = resolve;
        }
        if let Some(require) = self.require_master {
            target.require_master = require;
        }
        if let Some(batch) = self.read_batch_size {
            target.read_batch_size = batch;
        }
        if let Some(backpressure) = self.backpressure {
            target.backpressure = backpressure;
        }
        if let Some(stash) = self.stash_limit {
            target.stash_limit = stash;
        }
        if let Some(live) = self.live_buffer_limit {
            target.live_buffer_limit = live;
        }
        if let Some(cluster) = self.cluster.as_ref() {
            target.cluster = Some(cluster.clone());
        }
    }
}
