// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::{LockError, Result};
use crate::types::LockPolicy;

/// Environment variable selecting the grant policy (`greedy` / `altruistic`)
pub const ENV_LOCK_POLICY: &str = "CLUSTER_LOCK_POLICY";
/// Environment variable for the reconnection window, in seconds
pub const ENV_RECONNECT_WINDOW_SECS: &str = "CLUSTER_LOCK_RECONNECT_WINDOW_SECS";
/// Environment variable for the reconnect expiry check interval, in milliseconds
pub const ENV_RECONNECT_CHECK_INTERVAL_MS: &str = "CLUSTER_LOCK_RECONNECT_CHECK_INTERVAL_MS";
/// Environment variable for the background deadlock scan interval, in seconds (0 disables)
pub const ENV_DEADLOCK_SCAN_INTERVAL_SECS: &str = "CLUSTER_LOCK_DEADLOCK_SCAN_INTERVAL_SECS";

/// Lock manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockManagerConfig {
    /// Grant policy
    #[serde(default)]
    pub lock_policy: LockPolicy,

    /// Background deadlock scan interval, `None` scans only on demand
    #[serde(default = "default_deadlock_scan_interval")]
    pub deadlock_scan_interval: Option<Duration>,

    /// Reconnection configuration
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Reconnection window configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// How long a disconnected client's lock state is retained
    #[serde(default = "default_reconnect_window")]
    pub window: Duration,

    /// How often expired windows are purged
    #[serde(default = "default_check_interval")]
    pub check_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            lock_policy: LockPolicy::default(),
            deadlock_scan_interval: default_deadlock_scan_interval(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            window: default_reconnect_window(),
            check_interval: default_check_interval(),
        }
    }
}

// Default value functions
fn default_deadlock_scan_interval() -> Option<Duration> {
    None
}

fn default_reconnect_window() -> Duration {
    Duration::from_secs(120)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(1)
}

/// Parsed value of `key`; unset or unparsable values fall back to the default
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl LockManagerConfig {
    /// Configuration with greedy grants and a background deadlock scan
    pub fn greedy() -> Self {
        Self {
            lock_policy: LockPolicy::Greedy,
            deadlock_scan_interval: Some(Duration::from_secs(60)),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Defaults overridden by `CLUSTER_LOCK_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(policy) = env_parse::<LockPolicy>(ENV_LOCK_POLICY) {
            config.lock_policy = policy;
        }
        if let Some(secs) = env_parse::<u64>(ENV_RECONNECT_WINDOW_SECS) {
            config.reconnect.window = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>(ENV_RECONNECT_CHECK_INTERVAL_MS) {
            config.reconnect.check_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>(ENV_DEADLOCK_SCAN_INTERVAL_SECS) {
            config.deadlock_scan_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }

        config
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.reconnect.window.is_zero() {
            return Err(LockError::configuration("Reconnect window must be greater than zero"));
        }

        if self.reconnect.check_interval.is_zero() {
            return Err(LockError::configuration("Reconnect check interval must be greater than zero"));
        }

        if self.deadlock_scan_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(LockError::configuration("Deadlock scan interval must be greater than zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LockManagerConfig::default();
        assert_eq!(config.lock_policy, LockPolicy::Altruistic);
        assert!(config.deadlock_scan_interval.is_none());
        assert_eq!(config.reconnect.window, Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_greedy_config() {
        let config = LockManagerConfig::greedy();
        assert_eq!(config.lock_policy, LockPolicy::Greedy);
        assert!(config.deadlock_scan_interval.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = LockManagerConfig::default();
        config.reconnect.window = Duration::ZERO;
        assert!(matches!(config.validate(), Err(LockError::Configuration { .. })));

        let mut config = LockManagerConfig::default();
        config.deadlock_scan_interval = Some(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization() {
        let config = LockManagerConfig::greedy();
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: LockManagerConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);

        let partial: LockManagerConfig = serde_json::from_str(r#"{"lock_policy":"greedy"}"#).unwrap();
        assert_eq!(partial.lock_policy, LockPolicy::Greedy);
        assert_eq!(partial.reconnect, ReconnectConfig::default());
    }

    #[test]
    fn test_env_parse_falls_back_when_unset() {
        assert_eq!(env_parse::<u64>("CLUSTER_LOCK_TEST_UNSET_SETTING"), None);
        assert_eq!(env_parse::<LockPolicy>("CLUSTER_LOCK_TEST_UNSET_SETTING"), None);
    }
}
