//! Engine configuration.

use crate::rpc::RetryPolicy;
use octagon_crypto::KdfParams;
use octagon_trust::DeviceInfo;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{OctagonError, OctagonResult};

/// Configuration shared by every context an [`OctagonManager`] creates.
///
/// Durations are written in humantime form (`"4s"`, `"10m"`) in JSON.
///
/// [`OctagonManager`]: crate::OctagonManager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OctagonConfig {
    /// Backoff for remote calls.
    pub retry: RetryPolicy,
    /// How long fetched escrow records stay fresh.
    #[serde(with = "humantime_serde")]
    pub escrow_cache_ttl: Duration,
    /// Delay before re-checking trust after a failed check.
    #[serde(with = "humantime_serde")]
    pub trust_recheck_delay: Duration,
    /// Argon2id cost for recovery key derivation.
    pub recovery_kdf: KdfParams,
    /// This device, as described in its peer info.
    pub device: DeviceInfo,
}

impl Default for OctagonConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            escrow_cache_ttl: Duration::from_secs(10 * 60),
            trust_recheck_delay: Duration::from_secs(10),
            recovery_kdf: KdfParams::default(),
            device: DeviceInfo::default(),
        }
    }
}

impl OctagonConfig {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> OctagonResult<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            OctagonError::InvalidRequest(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Same config, describing a different device.
    #[must_use]
    pub fn for_device(&self, device: DeviceInfo) -> Self {
        Self {
            device,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config: OctagonConfig =
            serde_json::from_str(r#"{ "escrow_cache_ttl": "2m", "retry": { "initial_delay": "1s" } }"#)
                .unwrap();
        assert_eq!(config.escrow_cache_ttl, Duration::from_secs(120));
        assert_eq!(config.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(config.retry.max_attempts, RetryPolicy::default().max_attempts);
        assert_eq!(config.device, DeviceInfo::default());
    }

    #[test]
    fn round_trips_through_json() {
        let config = OctagonConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<OctagonConfig>(&json).unwrap(), config);
    }
}
