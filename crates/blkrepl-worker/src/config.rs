//! Worker configuration: per-disk resync tuning and per-connection network settings.
//!
//! All structs deserialize from TOML with every field optional; missing
//! fields take the defaults below.

use serde::{Deserialize, Serialize};

use crate::error::ReplResult;

/// What to do when the backing device reports an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IoErrorPolicy {
    /// Keep going on the backing device, degrade the disk to Inconsistent.
    PassOn,
    /// Fail the disk and run the `local-io-error` hook.
    CallHelper,
    /// Fail the disk.
    #[default]
    Detach,
}

/// Resync tuning for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConf {
    /// Fixed resync rate in KiB/s; also seeds the controller at resync start.
    pub resync_rate_kib: u32,
    /// Controller planning horizon in tenths of a second. 0 = fixed-rate mode.
    pub c_plan_ahead: u32,
    /// Desired resync delay in tenths of a second (used when `c_fill_target` is 0).
    pub c_delay_target: u32,
    /// Desired in-flight resync data in sectors. 0 = use `c_delay_target`.
    pub c_fill_target: u32,
    /// Upper bound on the resync rate in KiB/s.
    pub c_max_rate_kib: u32,
    /// Largest single resync request in bytes.
    pub max_bio_bytes: u32,
    /// Minor of the device that must finish resync before this one may start.
    pub resync_after: Option<u32>,
    /// Reaction to local I/O errors.
    pub on_io_error: IoErrorPolicy,
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            resync_rate_kib: 250,
            c_plan_ahead: 20,
            c_delay_target: 10,
            c_fill_target: 100,
            c_max_rate_kib: 102_400,
            max_bio_bytes: 128 * 1024,
            resync_after: None,
            on_io_error: IoErrorPolicy::Detach,
        }
    }
}

impl DiskConf {
    /// Length of the rate controller's plan ring (one slot per tick).
    pub fn plan_steps(&self) -> usize {
        self.c_plan_ahead as usize
    }
}

/// Network settings for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConf {
    /// Digest used for checksum-based resync (`sha256`, `blake3`), if any.
    pub csums_alg: Option<String>,
    /// Digest used for online verify, if any.
    pub verify_alg: Option<String>,
    /// Receive buffer pages the peer is willing to hold.
    pub max_buffers: u32,
    /// Number of writes after which a new epoch is started.
    pub max_epoch_size: u32,
    /// Cork the socket while the sender is busy.
    pub tcp_cork: bool,
    /// How long to wait for a ping ack, in milliseconds.
    pub ping_timeout_ms: u64,
}

impl Default for NetConf {
    fn default() -> Self {
        Self {
            csums_alg: None,
            verify_alg: None,
            max_buffers: 2048,
            max_epoch_size: 2048,
            tcp_cork: true,
            ping_timeout_ms: 500,
        }
    }
}

/// Top-level worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkerConfig {
    /// Per-disk settings applied to every device created from this config.
    pub disk: DiskConf,
    /// Connection settings.
    pub net: NetConf,
}

impl WorkerConfig {
    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> ReplResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: &std::path::Path) -> ReplResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let conf = WorkerConfig::default();
        assert_eq!(conf.disk.resync_rate_kib, 250);
        assert_eq!(conf.disk.plan_steps(), 20);
        assert_eq!(conf.disk.on_io_error, IoErrorPolicy::Detach);
        assert_eq!(conf.net.max_buffers, 2048);
        assert!(conf.net.csums_alg.is_none());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let conf = WorkerConfig::from_toml_str("").unwrap();
        assert_eq!(conf, WorkerConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let text = r#"
            [disk]
            c_plan_ahead = 0
            resync_rate_kib = 10240
            on_io_error = "pass_on"
            resync_after = 3

            [net]
            csums_alg = "sha256"
        "#;
        let conf = WorkerConfig::from_toml_str(text).unwrap();
        assert_eq!(conf.disk.plan_steps(), 0);
        assert_eq!(conf.disk.resync_rate_kib, 10240);
        assert_eq!(conf.disk.on_io_error, IoErrorPolicy::PassOn);
        assert_eq!(conf.disk.resync_after, Some(3));
        assert_eq!(conf.disk.c_fill_target, 100);
        assert_eq!(conf.net.csums_alg.as_deref(), Some("sha256"));
        assert_eq!(conf.net.max_epoch_size, 2048);
    }

    #[test]
    fn test_bad_toml() {
        assert!(WorkerConfig::from_toml_str("[disk]\nc_plan_ahead = \"x\"").is_err());
    }
}
