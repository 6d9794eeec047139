//! Configuration system for Mediawire.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MEDIAWIRE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/mediawire/config.toml
//!   3. ~/.config/mediawire/config.toml
//!
//! Every empirically tuned constant of the transport (slot counts, the
//! keyframe protection window, drift-correction steps) lives here so it can
//! be tuned without a rebuild.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::DEFAULT_MAX_DATAGRAM_SIZE;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub transport: TransportConfig,
    pub reassembly: ReassemblyConfig,
    pub playout: PlayoutConfig,
    pub drift: DriftConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest datagram the lossy transport accepts, prefix and header included.
    pub max_datagram_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Frames that may be in flight (partially received) at once.
    pub slots: usize,
    /// An incomplete keyframe in the oldest slot is protected from
    /// non-keyframe traffic newer than it by less than this many ms.
    pub keyframe_protect_ms: u32,
    /// While the scheduler is skipping, frames up to this many sequence
    /// numbers behind the last delivered one are still accepted.
    pub skip_tolerance: u16,
    /// Largest frame a sender may announce. Reassembly allocates the full
    /// announced length up front, so larger announcements are dropped.
    pub max_frame_bytes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayoutConfig {
    /// Slots in the timestamped video buffer (one is always kept free).
    pub video_capacity: usize,
    /// Slots in the audio ring buffer (one is always kept free).
    pub audio_capacity: usize,
    /// Half-width of the acceptance window around the wanted timestamp.
    pub tolerance_window_ms: u32,
    /// Extra half-width used while the clock offset estimate settles.
    pub startup_grace_ms: u32,
    /// Number of scheduler ticks the startup grace applies to.
    pub startup_ticks: u32,
    /// Video iteration period.
    pub video_interval_ms: u64,
    /// Audio iteration period.
    pub audio_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Starting value of the buffering adjustment. Negative = buffer.
    pub initial_adjustment_ms: i64,
    /// Latency the buffer always adds on top of the round trip.
    pub latency_floor_ms: i64,
    /// The adjustment never rises above `-min_buffering_ms`.
    pub min_buffering_ms: i64,
    /// Size of one drift-correction step per tick.
    pub step_ms: i64,
    /// Buffered entries above which the buffer counts as comfortably fed.
    pub comfortable_entries: usize,
    /// Buffered entries at which the buffer counts as nearly full.
    pub fill_threshold: usize,
    /// Distance outside the buffered range that triggers a fast correction.
    pub clock_jump_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Minimum spacing between two lower-frame-rate requests.
    pub lower_rate_interval_ms: u64,
    /// Frames per second asked for in each lower-frame-rate request.
    pub lower_rate_step: u8,
    /// Minimum spacing between two keyframe requests.
    pub keyframe_request_interval_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            slots: 5,
            keyframe_protect_ms: 3_500,
            skip_tolerance: 3,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            video_capacity: 16,
            audio_capacity: 8,
            tolerance_window_ms: 60,
            startup_grace_ms: 2_000,
            startup_ticks: 40,
            video_interval_ms: 10,
            audio_interval_ms: 20,
        }
    }
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            initial_adjustment_ms: -200,
            latency_floor_ms: 50,
            min_buffering_ms: 40,
            step_ms: 1,
            comfortable_entries: 3,
            fill_threshold: 10,
            clock_jump_ms: 500,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            lower_rate_interval_ms: 10_000,
            lower_rate_step: 1,
            keyframe_request_interval_ms: 1_000,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("mediawire")
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
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MediaConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MediaConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing sections and fields take defaults.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MEDIAWIRE_CONFIG")
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
            let text = toml::to_string_pretty(&MediaConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the buffers cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.max_datagram_size <= crate::wire::PACKET_OVERHEAD {
            return Err(ConfigError::Invalid {
                field: "transport.max_datagram_size",
                reason: "must leave room for payload after the 81 byte overhead",
            });
        }
        if self.reassembly.slots == 0 {
            return Err(ConfigError::Invalid {
                field: "reassembly.slots",
                reason: "at least one slot is required",
            });
        }
        if self.reassembly.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "reassembly.max_frame_bytes",
                reason: "must be positive",
            });
        }
        if self.playout.video_capacity < 2 || self.playout.audio_capacity < 2 {
            return Err(ConfigError::Invalid {
                field: "playout.*_capacity",
                reason: "one slot is reserved, capacity must be at least 2",
            });
        }
        if self.drift.step_ms <= 0 {
            return Err(ConfigError::Invalid {
                field: "drift.step_ms",
                reason: "must be positive",
            });
        }
        Ok(())
    }

    /// Apply MEDIAWIRE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        apply_env(
            "MEDIAWIRE_TRANSPORT__MAX_DATAGRAM_SIZE",
            &mut self.transport.max_datagram_size,
        );
        apply_env("MEDIAWIRE_REASSEMBLY__SLOTS", &mut self.reassembly.slots);
        apply_env(
            "MEDIAWIRE_REASSEMBLY__KEYFRAME_PROTECT_MS",
            &mut self.reassembly.keyframe_protect_ms,
        );
        apply_env(
            "MEDIAWIRE_PLAYOUT__VIDEO_CAPACITY",
            &mut self.playout.video_capacity,
        );
        apply_env(
            "MEDIAWIRE_PLAYOUT__TOLERANCE_WINDOW_MS",
            &mut self.playout.tolerance_window_ms,
        );
        apply_env(
            "MEDIAWIRE_DRIFT__INITIAL_ADJUSTMENT_MS",
            &mut self.drift.initial_adjustment_ms,
        );
        apply_env(
            "MEDIAWIRE_DRIFT__LATENCY_FLOOR_MS",
            &mut self.drift.latency_floor_ms,
        );
        apply_env(
            "MEDIAWIRE_CONTROL__LOWER_RATE_INTERVAL_MS",
            &mut self.control.lower_rate_interval_ms,
        );
    }
}

/// Overwrite `slot` with the parsed value of `var` when it is set and parses.
fn apply_env<T: std::str::FromStr>(var: &str, slot: &mut T) {
    if let Ok(v) = std::env::var(var) {
        if let Ok(parsed) = v.parse() {
            *slot = parsed;
        }
    }
}
