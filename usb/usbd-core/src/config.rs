//! Stack sizing and device identity, loaded from TOML.

use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Event queue slots kept for bus events and the setup packet, on top of one per open endpoint.
const EVENT_QUEUE_RESERVE: usize = 4;

#[derive(Clone, Debug, Deserialize)]
pub struct PoolConfig {
    /// Per speed.
    pub configurations: usize,
    pub interfaces: usize,
    pub alt_interfaces: usize,
    pub interface_groups: usize,
    pub endpoint_infos: usize,
    pub strings: usize,
    pub open_endpoints: usize,
    pub extra_urbs: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CoreSettings {
    pub std_req_timeout_ms: u64,
    pub desc_buf_len: usize,
    pub event_queue_len: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub release: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub lang_id: u16,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CoreConfig {
    pub pools: PoolConfig,
    pub core: CoreSettings,
    pub device: DeviceIdentity,
}

lazy_static::lazy_static! {
    static ref DEFAULT_CONFIG: CoreConfig = toml::from_slice(include_bytes!("../usbd.toml"))
        .expect("Failed to parse internally embedded config file");
}

impl CoreConfig {
    pub fn default_config() -> &'static CoreConfig {
        &DEFAULT_CONFIG
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CoreConfig = toml::from_str(text).map_err(|err| {
            log::warn!("usbd: invalid core configuration: {}", err);
            Error::InvalidParameter("config")
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn std_req_timeout(&self) -> Duration {
        Duration::from_millis(self.core.std_req_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.pools.configurations == 0 || self.pools.configurations > 127 {
            return Err(Error::InvalidParameter("pools.configurations"));
        }
        if self.pools.strings > 254 {
            return Err(Error::InvalidParameter("pools.strings"));
        }
        // Two control slots plus at least one data endpoint.
        if self.pools.open_endpoints < 3 || self.pools.open_endpoints > 32 {
            return Err(Error::InvalidParameter("pools.open_endpoints"));
        }
        // The scratch buffer is flushed in whole control packets.
        if self.core.desc_buf_len < 64 || self.core.desc_buf_len % 64 != 0 {
            return Err(Error::InvalidParameter("core.desc_buf_len"));
        }
        // Each open endpoint has at most one asynchronous completion queued at a time; a dropped
        // one would strand its URB.
        if self.core.event_queue_len < self.pools.open_endpoints + EVENT_QUEUE_RESERVE {
            return Err(Error::InvalidParameter("core.event_queue_len"));
        }
        Ok(())
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        DEFAULT_CONFIG.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn embedded_config_parses() {
        let config = CoreConfig::default_config();
        assert_eq!(config.core.std_req_timeout_ms, 5000);
        assert_eq!(config.std_req_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_tiny_scratch_buffer() {
        let text = r#"
            [pools]
            configurations = 1
            interfaces = 1
            alt_interfaces = 1
            interface_groups = 0
            endpoint_infos = 2
            strings = 4
            open_endpoints = 4
            extra_urbs = 0

            [core]
            std_req_timeout_ms = 100
            desc_buf_len = 8
            event_queue_len = 4

            [device]
            vendor_id = 1
            product_id = 2
            release = 3
            lang_id = 1033
        "#;
        assert_eq!(
            CoreConfig::from_toml_str(text).unwrap_err(),
            Error::InvalidParameter("core.desc_buf_len")
        );
    }

    #[test]
    fn event_queue_holds_every_endpoint_completion() {
        let mut config = CoreConfig::default();
        config.pools.open_endpoints = 16;
        config.core.event_queue_len = 19;
        assert_eq!(config.validate(), Err(Error::InvalidParameter("core.event_queue_len")));
        config.core.event_queue_len = 20;
        assert!(config.validate().is_ok());
    }
}
