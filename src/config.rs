//! Messenger and buffering configuration
//!
//! Configuration is plain serde data, normally loaded from YAML:
//!
//! ```yaml
//! publishers:
//!   camera_front:
//!     allocator_keys:
//!       image: shm_image
//! client_instances:
//!   remote:
//!     connection: tcp
//!     address: 192.168.0.10:8080
//!     reply_timeout_ms: 5000
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::BufferingPolicy;
use crate::{CoreError, Result};

/// Client instance name that means "deliver in-process"
pub const LOCALHOST_INSTANCE: &str = "localhost";

/// Reply wait used when a client instance does not set one
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 30_000;

/// Top-level messenger configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// Publisher instances that may be opened, by instance name
    pub publishers: BTreeMap<String, PublisherInstanceConfig>,

    /// Server endpoints, by client instance name
    pub client_instances: BTreeMap<String, ClientInstanceConfig>,
}

/// Configuration of one publisher instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherInstanceConfig {
    /// Allocator key per allocator name; empty selects the default allocator
    #[serde(default)]
    pub allocator_keys: BTreeMap<String, String>,
}

/// Connection parameters of a server endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInstanceConfig {
    /// Connection type understood by the connector
    pub connection: String,

    /// Address of the server
    pub address: String,

    /// How long to wait for a reply
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

fn default_reply_timeout_ms() -> u64 {
    DEFAULT_REPLY_TIMEOUT_MS
}

impl ClientInstanceConfig {
    pub fn new(connection: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            address: address.into(),
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
        }
    }

    /// Reply timeout as a duration
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Frame buffering parameters of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub policy: BufferingPolicy,
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { policy: BufferingPolicy::Overwrite, capacity: 4 }
    }
}

impl MessengerConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: MessengerConfig = serde_yaml_ng::from_str(yaml).map_err(|e| {
            CoreError::invalid_argument(format!("messenger config parsing failed: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            CoreError::not_found(format!("messenger config {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Check values serde cannot express
    pub fn validate(&self) -> Result<()> {
        for (name, client) in &self.client_instances {
            if client.reply_timeout_ms == 0 {
                return Err(CoreError::invalid_argument(format!(
                    "client instance {} has a zero reply timeout",
                    name
                )));
            }
            if client.address.is_empty() {
                return Err(CoreError::invalid_argument(format!(
                    "client instance {} has no address",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Look up a publisher instance
    pub fn publisher(&self, instance_name: &str) -> Result<&PublisherInstanceConfig> {
        self.publishers
            .get(instance_name)
            .ok_or_else(|| CoreError::not_found(format!("missing instance config: {}", instance_name)))
    }

    /// Look up a server endpoint
    pub fn client_instance(&self, name: &str) -> Result<&ClientInstanceConfig> {
        self.client_instances
            .get(name)
            .ok_or_else(|| CoreError::not_found(format!("missing client instance config: {}", name)))
    }
}

/// Whether frames for `client_instance` must cross a server connection
pub fn requires_server(client_instance: Option<&str>) -> bool {
    matches!(client_instance, Some(name) if name != LOCALHOST_INSTANCE)
}
