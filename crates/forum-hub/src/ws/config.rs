//! Hub and transport tuning.

use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Where presence rows are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceBackend {
    /// The `presence_sessions` table in the hub database.
    #[default]
    Sqlite,
    /// Process memory. Nothing survives a restart.
    Memory,
}

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Capacity of each connection's outbound queue. A connection whose queue
    /// is full when the hub delivers to it is disconnected.
    pub outbound_capacity: usize,
    /// Deliveries that may wait for the hub loop at once. A client whose
    /// frame finds the backlog full is disconnected.
    pub delivery_backlog: usize,
    /// Interval between protocol pings sent by the write pump.
    pub ping_interval_secs: u64,
    /// A connection that sends nothing (not even a pong) for this long is
    /// dropped. Must be longer than the ping interval.
    pub read_timeout_secs: u64,
    /// Deadline for writing a single frame.
    pub write_timeout_secs: u64,
    /// Upper bound on one presence write made from the hub loop.
    pub presence_write_timeout_ms: u64,
    /// Upper bound on one message-store call made from a read pump.
    pub store_timeout_ms: u64,
    /// Delete presence rows left over from a previous process at startup.
    pub reset_presence_on_startup: bool,
    pub presence_backend: PresenceBackend,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            delivery_backlog: 4_096,
            ping_interval_secs: 30,
            read_timeout_secs: 60,
            write_timeout_secs: 10,
            presence_write_timeout_ms: 2_000,
            store_timeout_ms: 2_000,
            reset_presence_on_startup: true,
            presence_backend: PresenceBackend::Sqlite,
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<()> {
        // The `connected` greeting and the user's own `online` event are
        // queued back to back on every new connection.
        if self.outbound_capacity < 2 {
            bail!("hub.outbound_capacity must be at least 2");
        }
        if self.delivery_backlog == 0 || self.delivery_backlog > Semaphore::MAX_PERMITS {
            bail!(
                "hub.delivery_backlog must be between 1 and {}",
                Semaphore::MAX_PERMITS
            );
        }
        if self.ping_interval_secs == 0 {
            bail!("hub.ping_interval_secs must be at least 1");
        }
        if self.ping_interval_secs >= self.read_timeout_secs {
            bail!(
                "hub.ping_interval_secs ({}) must be shorter than hub.read_timeout_secs ({})",
                self.ping_interval_secs,
                self.read_timeout_secs
            );
        }
        if self.write_timeout_secs == 0 {
            bail!("hub.write_timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn presence_write_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_write_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        HubConfig::default().validate().unwrap();
    }

    #[test]
    fn ping_must_be_shorter_than_read_timeout() {
        let config = HubConfig {
            ping_interval_secs: 60,
            read_timeout_secs: 60,
            ..HubConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must be shorter"));
    }

    #[test]
    fn capacity_must_hold_greeting_and_online_event() {
        for outbound_capacity in [0, 1] {
            let config = HubConfig {
                outbound_capacity,
                ..HubConfig::default()
            };
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("at least 2"));
        }

        let config = HubConfig {
            outbound_capacity: 2,
            ..HubConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn empty_delivery_backlog_is_rejected() {
        let config = HubConfig {
            delivery_backlog: 0,
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: HubConfig = toml::from_str("outbound_capacity = 8\npresence_backend = \"memory\"").unwrap();
        assert_eq!(config.outbound_capacity, 8);
        assert_eq!(config.presence_backend, PresenceBackend::Memory);
        assert_eq!(config.read_timeout_secs, 60);
    }
}
