//! Session configuration.
//!
//! [`SatelliteConfig`] carries the link capabilities and every timeout the
//! actors use. It can be built from defaults, from `SATLINK_*` environment
//! variables, or from a JSON file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Link capabilities and timer policy for one satellite session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SatelliteConfig {
    /// Whether the device supports satellite communication at all.
    pub supported: bool,
    /// Attach-required (NB-IoT class) link with explicit connect handshake.
    pub attach_required: bool,
    /// Substitute synthetic alignment, connectivity and datagram events.
    pub demo_mode: bool,
    /// How long a demo-mode transfer waits for the device to align.
    pub alignment_timeout_ms: u64,
    /// How long a poll waits for the link to attach.
    pub connect_wait_timeout_ms: u64,
    /// How long the receive direction waits for a push after a poll.
    pub datagram_wait_timeout_ms: u64,
    /// How long the session stays in `Listening` after a transfer.
    pub listening_timeout_ms: u64,
    /// Inactivity window before an attach-required link drops to `Idle`.
    pub nb_iot_inactivity_timeout_ms: u64,
    /// Demo simulator: delay from alignment to reported connection.
    pub demo_connect_delay_ms: u64,
    /// Demo simulator: delay from alignment loss to reported disconnection.
    pub demo_disconnect_delay_ms: u64,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            supported: true,
            attach_required: false,
            demo_mode: false,
            alignment_timeout_ms: 30_000,
            connect_wait_timeout_ms: 60_000,
            datagram_wait_timeout_ms: 30_000,
            listening_timeout_ms: 30_000,
            nb_iot_inactivity_timeout_ms: 180_000,
            demo_connect_delay_ms: 3_000,
            demo_disconnect_delay_ms: 5_000,
        }
    }
}

impl SatelliteConfig {
    /// Build the configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `SATLINK_SUPPORTED` | `supported` |
    /// | `SATLINK_ATTACH_REQUIRED` | `attach_required` |
    /// | `SATLINK_DEMO_MODE` | `demo_mode` |
    /// | `SATLINK_ALIGNMENT_TIMEOUT_MS` | `alignment_timeout_ms` |
    /// | `SATLINK_CONNECT_WAIT_TIMEOUT_MS` | `connect_wait_timeout_ms` |
    /// | `SATLINK_DATAGRAM_WAIT_TIMEOUT_MS` | `datagram_wait_timeout_ms` |
    /// | `SATLINK_LISTENING_TIMEOUT_MS` | `listening_timeout_ms` |
    /// | `SATLINK_NB_IOT_INACTIVITY_TIMEOUT_MS` | `nb_iot_inactivity_timeout_ms` |
    /// | `SATLINK_DEMO_CONNECT_DELAY_MS` | `demo_connect_delay_ms` |
    /// | `SATLINK_DEMO_DISCONNECT_DELAY_MS` | `demo_disconnect_delay_ms` |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        let flag = |key: &str, slot: &mut bool| -> Result<(), CoreError> {
            if let Some(raw) = lookup(key) {
                *slot = parse_bool(&raw)
                    .ok_or_else(|| CoreError::Config(format!("{key} must be a boolean, got {raw:?}")))?;
            }
            Ok(())
        };
        flag("SATLINK_SUPPORTED", &mut cfg.supported)?;
        flag("SATLINK_ATTACH_REQUIRED", &mut cfg.attach_required)?;
        flag("SATLINK_DEMO_MODE", &mut cfg.demo_mode)?;

        let millis = |key: &str, slot: &mut u64| -> Result<(), CoreError> {
            if let Some(raw) = lookup(key) {
                *slot = raw.trim().parse().map_err(|_| {
                    CoreError::Config(format!("{key} must be a number of milliseconds, got {raw:?}"))
                })?;
            }
            Ok(())
        };
        millis("SATLINK_ALIGNMENT_TIMEOUT_MS", &mut cfg.alignment_timeout_ms)?;
        millis("SATLINK_CONNECT_WAIT_TIMEOUT_MS", &mut cfg.connect_wait_timeout_ms)?;
        millis("SATLINK_DATAGRAM_WAIT_TIMEOUT_MS", &mut cfg.datagram_wait_timeout_ms)?;
        millis("SATLINK_LISTENING_TIMEOUT_MS", &mut cfg.listening_timeout_ms)?;
        millis(
            "SATLINK_NB_IOT_INACTIVITY_TIMEOUT_MS",
            &mut cfg.nb_iot_inactivity_timeout_ms,
        )?;
        millis("SATLINK_DEMO_CONNECT_DELAY_MS", &mut cfg.demo_connect_delay_ms)?;
        millis("SATLINK_DEMO_DISCONNECT_DELAY_MS", &mut cfg.demo_disconnect_delay_ms)?;

        Ok(cfg)
    }

    /// Load the configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Alignment wait in demo mode.
    pub fn alignment_timeout(&self) -> Duration {
        Duration::from_millis(self.alignment_timeout_ms)
    }

    /// Bounded wait for an attach-required link to connect.
    pub fn connect_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_wait_timeout_ms)
    }

    /// Bounded wait for a push after a successful poll.
    pub fn datagram_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.datagram_wait_timeout_ms)
    }

    /// Time spent in `Listening` before falling back to `Idle`.
    pub fn listening_timeout(&self) -> Duration {
        Duration::from_millis(self.listening_timeout_ms)
    }

    /// Inactivity window of an attach-required link.
    pub fn nb_iot_inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.nb_iot_inactivity_timeout_ms)
    }

    /// Demo simulator connect delay.
    pub fn demo_connect_delay(&self) -> Duration {
        Duration::from_millis(self.demo_connect_delay_ms)
    }

    /// Demo simulator disconnect delay.
    pub fn demo_disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.demo_disconnect_delay_ms)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config() {
        let cfg = SatelliteConfig::default();
        assert!(cfg.supported);
        assert!(!cfg.attach_required);
        assert!(!cfg.demo_mode);
        assert_eq!(cfg.listening_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = SatelliteConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, SatelliteConfig::default());
    }

    #[test]
    fn environment_overrides() {
        let cfg = SatelliteConfig::from_lookup(lookup(&[
            ("SATLINK_DEMO_MODE", "true"),
            ("SATLINK_ATTACH_REQUIRED", "1"),
            ("SATLINK_ALIGNMENT_TIMEOUT_MS", "1000"),
        ]))
        .unwrap();
        assert!(cfg.demo_mode);
        assert!(cfg.attach_required);
        assert_eq!(cfg.alignment_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = SatelliteConfig::from_lookup(lookup(&[("SATLINK_DEMO_MODE", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));

        let err = SatelliteConfig::from_lookup(lookup(&[("SATLINK_LISTENING_TIMEOUT_MS", "-5")]))
            .unwrap_err();
        assert!(err.to_string().contains("SATLINK_LISTENING_TIMEOUT_MS"));
    }

    #[test]
    fn partial_json_takes_defaults() {
        let cfg: SatelliteConfig =
            serde_json::from_str(r#"{ "demo_mode": true, "alignment_timeout_ms": 1500 }"#).unwrap();
        assert!(cfg.demo_mode);
        assert_eq!(cfg.alignment_timeout_ms, 1500);
        assert_eq!(cfg.connect_wait_timeout_ms, 60_000);
    }
}
