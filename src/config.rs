//! Configuration for the offline sync engine.
//!
//! # Example
//!
//! ```
//! use offline_sync::SyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.request_timeout_ms, 15_000);
//!
//! // Full config
//! let config = SyncConfig {
//!     store_url: Some("sqlite:./offline.db?mode=rwc".into()),
//!     remote_base_url: Some("https://forms.example.com/api".into()),
//!     request_timeout_ms: 10_000,
//!     max_attempts: Some(10),
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;
use serde::Deserialize;

use crate::cache::CacheClass;

/// Configuration for the sync engine.
///
/// All fields have sensible defaults. Production use needs at least
/// `store_url` (otherwise nothing survives a restart) and `remote_base_url`.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Durable store URL (e.g., "sqlite:./offline.db?mode=rwc"). `None` = in-memory.
    #[serde(default)]
    pub store_url: Option<String>,

    /// Remote API base URL (e.g., "https://forms.example.com/api")
    #[serde(default)]
    pub remote_base_url: Option<String>,

    /// Bearer token sent with every remote request
    #[serde(default)]
    pub api_token: Option<String>,

    /// Upper bound for any single remote call (replay step or live fetch)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Periodic retry drain while online with pending entries (0 = disabled)
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,

    /// Connectivity probe interval (0 = rely on platform notifications only)
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Consecutive failed probes before reporting offline
    #[serde(default = "default_probe_failure_threshold")]
    pub probe_failure_threshold: u64,

    /// Failed replays before an entry is flagged for user attention (None = never)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,

    /// TTLs per cache class
    #[serde(default = "default_ttl_list_secs")]
    pub ttl_list_secs: u64,
    #[serde(default = "default_ttl_detail_secs")]
    pub ttl_detail_secs: u64,
    #[serde(default = "default_ttl_form_definition_secs")]
    pub ttl_form_definition_secs: u64,

    /// Buffer for drain events; slow subscribers lag rather than block drains
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_request_timeout_ms() -> u64 { 15_000 }
fn default_drain_interval_secs() -> u64 { 60 }
fn default_probe_interval_secs() -> u64 { 0 }
fn default_probe_failure_threshold() -> u64 { 3 }
fn default_max_attempts() -> Option<u32> { Some(25) }
fn default_ttl_list_secs() -> u64 { 60 }
fn default_ttl_detail_secs() -> u64 { 300 }
fn default_ttl_form_definition_secs() -> u64 { 24 * 60 * 60 }
fn default_event_channel_capacity() -> usize { 64 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store_url: None,
            remote_base_url: None,
            api_token: None,
            request_timeout_ms: default_request_timeout_ms(),
            drain_interval_secs: default_drain_interval_secs(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_failure_threshold: default_probe_failure_threshold(),
            max_attempts: default_max_attempts(),
            ttl_list_secs: default_ttl_list_secs(),
            ttl_detail_secs: default_ttl_detail_secs(),
            ttl_form_definition_secs: default_ttl_form_definition_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn ttl_for(&self, class: CacheClass) -> Duration {
        let secs = match class {
            CacheClass::List => self.ttl_list_secs,
            CacheClass::Detail => self.ttl_detail_secs,
            CacheClass::FormDefinition => self.ttl_form_definition_secs,
        };
        Duration::from_secs(secs)
    }
}
