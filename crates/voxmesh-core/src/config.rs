//! Configuration system for voxmesh.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $VOXMESH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/voxmesh/config.toml
//!   3. ~/.config/voxmesh/config.toml
//!
//! Protocol code never reads tiers or quality levels by index; it asks for
//! them by name and gets the configured default back when the name is
//! unknown.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::DEFAULT_APP_PORT;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoxmeshConfig {
    pub network: NetworkConfig,
    pub chunking: ChunkingConfig,
    pub audio: AudioConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Private application port envelopes are exchanged on.
    pub app_port: u32,
    /// Local UDP address of the mesh adapter.
    pub bind_addr: String,
    /// Nodes reached by a broadcast send.
    pub peers: Vec<String>,
    /// Upper bound on bringing the mesh adapter up.
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Wire-size budget per named tier, in bytes of encoded envelope.
    pub sizes: BTreeMap<String, usize>,
    pub default_tier: String,
    /// Retries after the first failed transmit of a chunk.
    pub retry_count: u32,
    pub retry_delay_secs: f64,
    /// Partial transfers idle for longer than this are discarded.
    pub receive_timeout_secs: u64,
    /// Inter-chunk delay: base + encoded_len / bytes_per_sec, capped at max.
    pub pacing_base_secs: f64,
    pub pacing_bytes_per_sec: f64,
    pub pacing_max_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub default_quality: String,
    /// Compression level per named quality.
    pub quality_levels: BTreeMap<String, i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Where received voice messages are written.
    pub inbox_path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

const DEFAULT_TIER: &str = "Medium";
const FALLBACK_BUDGET: usize = 180;
const DEFAULT_QUALITY: &str = "Low";
const FALLBACK_LEVEL: i32 = 6;

fn default_tiers() -> BTreeMap<String, usize> {
    BTreeMap::from([
        ("Small".to_string(), 150),
        ("Medium".to_string(), 180),
        ("Large".to_string(), 200),
    ])
}

fn default_quality_levels() -> BTreeMap<String, i32> {
    BTreeMap::from([
        ("Ultra Low".to_string(), 19),
        ("Very Low".to_string(), 12),
        ("Low".to_string(), 6),
    ])
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            app_port: DEFAULT_APP_PORT,
            bind_addr: "0.0.0.0:4403".to_string(),
            peers: Vec::new(),
            connect_timeout_secs: 10,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            sizes: default_tiers(),
            default_tier: DEFAULT_TIER.to_string(),
            retry_count: 2,
            retry_delay_secs: 1.0,
            receive_timeout_secs: 60,
            pacing_base_secs: 1.0,
            pacing_bytes_per_sec: 200.0,
            pacing_max_secs: 5.0,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            default_quality: DEFAULT_QUALITY.to_string(),
            quality_levels: default_quality_levels(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            inbox_path: data_dir().join("inbox"),
        }
    }
}

// ── Lookups ───────────────────────────────────────────────────────────────────

impl ChunkingConfig {
    /// The tier used when none is named or the named one is unknown.
    ///
    /// A `default_tier` missing from `sizes` resolves to the first tier; an
    /// empty `sizes` table resolves to the built-in tiers.
    pub fn default_tier(&self) -> (String, usize) {
        if let Some(&size) = self.sizes.get(&self.default_tier) {
            return (self.default_tier.clone(), size);
        }
        if let Some((name, &size)) = self.sizes.iter().next() {
            return (name.clone(), size);
        }
        let size = default_tiers()
            .get(DEFAULT_TIER)
            .copied()
            .unwrap_or(FALLBACK_BUDGET);
        (DEFAULT_TIER.to_string(), size)
    }

    /// Wire budget for a named tier, falling back to the default tier.
    pub fn wire_budget(&self, tier: &str) -> usize {
        match self.sizes.get(tier) {
            Some(&size) => size,
            None => {
                let (name, size) = self.default_tier();
                tracing::warn!(tier, fallback = %name, "unknown chunk size tier");
                size
            }
        }
    }

    pub fn retry_delay(&self) -> Duration {
        secs_f64(self.retry_delay_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            base: secs_f64(self.pacing_base_secs),
            bytes_per_sec: self.pacing_bytes_per_sec,
            max: secs_f64(self.pacing_max_secs),
        }
    }
}

/// Inter-chunk delay policy: larger envelopes wait longer, up to a cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    pub base: Duration,
    pub bytes_per_sec: f64,
    pub max: Duration,
}

impl Pacing {
    /// Delay before the next chunk after sending `encoded_len` bytes.
    pub fn delay(&self, encoded_len: usize) -> Duration {
        let airtime = if self.bytes_per_sec > 0.0 {
            secs_f64(encoded_len as f64 / self.bytes_per_sec)
        } else {
            Duration::ZERO
        };
        (self.base + airtime).min(self.max)
    }
}

impl AudioConfig {
    /// Compression level for a named quality, falling back to the default.
    pub fn level(&self, quality: &str) -> i32 {
        if let Some(&level) = self.quality_levels.get(quality) {
            return level;
        }
        tracing::warn!(quality, fallback = %self.default_quality, "unknown audio quality");
        self.quality_levels
            .get(&self.default_quality)
            .copied()
            .unwrap_or(FALLBACK_LEVEL)
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Negative or non-finite values collapse to zero instead of panicking.
fn secs_f64(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("voxmesh")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("voxmesh")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl VoxmeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            VoxmeshConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a specific file without applying env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("VOXMESH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&VoxmeshConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply VOXMESH_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VOXMESH_NETWORK__BIND_ADDR") {
            self.network.bind_addr = v;
        }
        if let Ok(v) = std::env::var("VOXMESH_NETWORK__PEERS") {
            self.network.peers = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(v) = std::env::var("VOXMESH_NETWORK__APP_PORT") {
            if let Ok(p) = v.parse() {
                self.network.app_port = p;
            }
        }
        if let Ok(v) = std::env::var("VOXMESH_CHUNKING__DEFAULT_TIER") {
            self.chunking.default_tier = v;
        }
        if let Ok(v) = std::env::var("VOXMESH_CHUNKING__RETRY_COUNT") {
            if let Ok(n) = v.parse() {
                self.chunking.retry_count = n;
            }
        }
        if let Ok(v) = std::env::var("VOXMESH_CHUNKING__RECEIVE_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.chunking.receive_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("VOXMESH_STORAGE__INBOX_PATH") {
            self.storage.inbox_path = PathBuf::from(v);
        }
    }
}
