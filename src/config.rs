//! Engine configuration.
//!
//! Configuration is plain data: build it in code with the `with_*` methods or
//! load it from JSON. Durations are written as milliseconds.
//!
//! ```rust
//! use eventweave::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{
//!   "correlator": { "prefix": "orders", "timeout_ms": 30000, "fail_on_timeout": true },
//!   "async_reply": { "timeout_ms": 5000 }
//! }"#).unwrap();
//!
//! assert_eq!(config.correlator.prefix, "orders");
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default capacity of the processed-groups FIFO.
pub const MAX_PROCESSED_GROUPS: usize = 50_000;

/// Default interval between expiry sweeps.
pub const DEFAULT_EXPIRY_INTERVAL: Duration = Duration::from_millis(100);

/// Error type for configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
  /// The configuration file could not be read.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// The configuration document is malformed.
  #[error("invalid configuration: {0}")]
  Parse(#[from] serde_json::Error),
  /// A value is out of range.
  #[error("invalid value for '{field}': {reason}")]
  Invalid {
    /// Offending field.
    field: &'static str,
    /// Why it was rejected.
    reason: String,
  },
}

mod millis {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
  }
}

mod opt_millis {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
      Some(d) => s.serialize_some(&(d.as_millis() as u64)),
      None => s.serialize_none(),
    }
  }

  /// Zero and absent both mean "no timeout".
  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    Ok(
      Option::<u64>::deserialize(d)?
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis),
    )
  }
}

/// Configuration of one event correlator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
  /// Prefix of the store partitions owned by the correlator.
  pub prefix: String,
  /// Age after which an incomplete group expires. `None` disables expiry.
  #[serde(rename = "timeout_ms", with = "opt_millis")]
  pub timeout: Option<Duration>,
  /// Route expired members to the timeout processor (`true`) or aggregate
  /// the partial group (`false`).
  pub fail_on_timeout: bool,
  /// Interval between expiry sweeps.
  #[serde(rename = "expiry_interval_ms", with = "millis")]
  pub expiry_interval: Duration,
  /// Capacity of the processed-groups FIFO.
  pub max_processed_groups: usize,
  /// Number of lock stripes guarding group ids.
  pub lock_stripes: usize,
}

impl Default for CorrelatorConfig {
  fn default() -> Self {
    Self {
      prefix: "correlator".to_string(),
      timeout: None,
      fail_on_timeout: true,
      expiry_interval: DEFAULT_EXPIRY_INTERVAL,
      max_processed_groups: MAX_PROCESSED_GROUPS,
      lock_stripes: 64,
    }
  }
}

impl CorrelatorConfig {
  /// Creates a configuration with the given partition prefix.
  pub fn new(prefix: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
      ..Self::default()
    }
  }

  /// Sets the group timeout. A zero duration disables expiry.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = (!timeout.is_zero()).then_some(timeout);
    self
  }

  /// Sets whether expiry routes raw members or a partial aggregate.
  pub fn with_fail_on_timeout(mut self, fail_on_timeout: bool) -> Self {
    self.fail_on_timeout = fail_on_timeout;
    self
  }

  /// Sets the expiry sweep interval.
  pub fn with_expiry_interval(mut self, interval: Duration) -> Self {
    self.expiry_interval = interval;
    self
  }

  /// Sets the processed-groups FIFO capacity.
  pub fn with_max_processed_groups(mut self, max: usize) -> Self {
    self.max_processed_groups = max;
    self
  }

  /// Sets the number of lock stripes.
  pub fn with_lock_stripes(mut self, stripes: usize) -> Self {
    self.lock_stripes = stripes;
    self
  }

  /// Partition holding in-flight groups.
  pub fn event_groups_partition(&self) -> String {
    format!("{}.eventGroups", self.prefix)
  }

  /// Partition holding finalized group ids.
  pub fn processed_groups_partition(&self) -> String {
    format!("{}.processedGroups", self.prefix)
  }

  /// Checks value ranges.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.prefix.is_empty() {
      return Err(ConfigError::Invalid {
        field: "prefix",
        reason: "must not be empty".to_string(),
      });
    }
    if self.expiry_interval.is_zero() {
      return Err(ConfigError::Invalid {
        field: "expiry_interval_ms",
        reason: "must be greater than zero".to_string(),
      });
    }
    if self.lock_stripes == 0 {
      return Err(ConfigError::Invalid {
        field: "lock_stripes",
        reason: "must be greater than zero".to_string(),
      });
    }
    if self.max_processed_groups == 0 {
      return Err(ConfigError::Invalid {
        field: "max_processed_groups",
        reason: "must be greater than zero".to_string(),
      });
    }
    Ok(())
  }
}

/// Configuration of an async request-reply requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncReplyConfig {
  /// How long to wait for a reply. `None` waits forever.
  #[serde(rename = "timeout_ms", with = "opt_millis")]
  pub timeout: Option<Duration>,
  /// Fire a notification when a wait times out.
  pub notify_on_timeout: bool,
}

impl Default for AsyncReplyConfig {
  fn default() -> Self {
    Self {
      timeout: Some(Duration::from_secs(60)),
      notify_on_timeout: true,
    }
  }
}

impl AsyncReplyConfig {
  /// Sets the reply timeout. A zero duration waits forever.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = (!timeout.is_zero()).then_some(timeout);
    self
  }

  /// Waits forever for replies.
  pub fn without_timeout(mut self) -> Self {
    self.timeout = None;
    self
  }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Correlator settings.
  pub correlator: CorrelatorConfig,
  /// Async request-reply settings.
  pub async_reply: AsyncReplyConfig,
}

impl EngineConfig {
  /// Parses and validates a JSON document.
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    let config: EngineConfig = serde_json::from_str(json)?;
    config.correlator.validate()?;
    Ok(config)
  }

  /// Reads, parses and validates a JSON file.
  pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let json = std::fs::read_to_string(path)?;
    Self::from_json_str(&json)
  }
}
