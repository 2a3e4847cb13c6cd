//! Monitor configuration
//!
//! This module handles configuration for a monitor radio: consumer mode
//! toggles, ring and buffer sizing, and parser limits. Files are loaded by
//! extension (JSON, TOML or YAML) and validated before use.

use crate::peer::{parse_mac, MacAddr};
use crate::reap::DoneMissingPolicy;
use crate::tlv::TlvHeaderMode;
use crate::{
    Result, RxMonError, MAX_MU_USERS, NBUF_ALLOC_MAP_RETRY_THRESHOLD, RX_MON_STATUS_BUF_ALIGN,
    RX_MON_STATUS_BUF_SIZE,
};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main monitor configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Status ring and buffer settings
    pub ring: RingConfig,
    /// TLV parser settings
    pub parser: ParserConfig,
    /// Consumer modes
    pub consumers: ConsumerConfig,
    /// Radio channel used when the status carries none
    pub channel: ChannelConfig,
}

/// Status ring configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Number of ring entries
    pub entries: usize,
    /// Status buffer size in bytes
    pub buf_size: usize,
    /// Allocation attempts per buffer
    pub alloc_retry_threshold: u32,
    /// Handling of released slots without the done marker
    pub done_missing_policy: DoneMissingPolicy,
}

/// TLV parser configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// TLV header width
    pub header_mode: TlvHeaderMode,
    /// Per-user records kept per PPDU
    pub max_users: usize,
}

/// First-good-frame delivery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McopyMode {
    #[default]
    Disabled,
    /// One frame per PPDU
    Mcopy,
    /// Every fcs-ok frame
    McopyExtended,
}

/// Enhanced capture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhCaptureMode {
    #[default]
    Disabled,
    Mpdu,
    MpduMsdu,
}

/// Packet-log tap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PktlogMode {
    #[default]
    Disabled,
    Full,
    Lite,
}

/// Consumer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Per-peer statistics
    pub enhanced_stats: bool,
    pub mcopy: McopyMode,
    pub enh_capture: EnhCaptureMode,
    pub pktlog: PktlogMode,
    /// Only log peers with packet logging enabled in the peer table
    pub pktlog_peer_filter: bool,
    /// Deliver 802.11 headers of monitor-direct frames (smart mesh)
    pub header_only: bool,
    /// A monitor interface exists
    pub monitor_vdev: bool,
    /// Full monitor mode owns the downstream ring
    pub full_mon_mode: bool,
    /// Count PPDUs for the scan special interface
    pub scan_special_vap: bool,
    /// Neighbour MAC addresses to track
    pub neighbour_peers: Vec<String>,
}

/// Radio channel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub num: u16,
    pub freq: u16,
}

/// Configuration validation result
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Whether configuration is valid
    pub valid: bool,
    /// Validation errors
    pub errors: Vec<String>,
    /// Validation warnings
    pub warnings: Vec<String>,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            entries: 1024,
            buf_size: RX_MON_STATUS_BUF_SIZE,
            alloc_retry_threshold: NBUF_ALLOC_MAP_RETRY_THRESHOLD,
            done_missing_policy: DoneMissingPolicy::Defer,
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            header_mode: TlvHeaderMode::Word32,
            max_users: MAX_MU_USERS,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { num: 6, freq: 2437 }
    }
}

impl MonitorConfig {
    /// Whether the m-copy path needs fcs tracking during parse.
    pub fn mcopy_enabled(&self) -> bool {
        self.consumers.mcopy != McopyMode::Disabled
    }

    /// Parsed neighbour addresses; malformed entries are skipped.
    pub fn neighbour_macs(&self) -> Vec<MacAddr> {
        self.consumers
            .neighbour_peers
            .iter()
            .filter_map(|s| parse_mac(s).ok())
            .collect()
    }
}

/// On-disk configuration format, picked by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|s| s.to_str()) {
            Some("json") => Ok(Self::Json),
            Some("toml") => Ok(Self::Toml),
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            _ => Err(RxMonError::Config(format!(
                "Unsupported config file format: {}",
                path.display()
            ))),
        }
    }

    fn decode(self, text: &str) -> Result<MonitorConfig> {
        let parsed = match self {
            Self::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
            Self::Toml => toml::from_str(text).map_err(|e| e.to_string()),
            Self::Yaml => serde_yaml::from_str(text).map_err(|e| e.to_string()),
        };
        parsed.map_err(|e| RxMonError::Parse(format!("{:?} config: {}", self, e)))
    }

    fn encode(self, config: &MonitorConfig) -> Result<String> {
        let text = match self {
            Self::Json => serde_json::to_string_pretty(config).map_err(|e| e.to_string()),
            Self::Toml => toml::to_string_pretty(config).map_err(|e| e.to_string()),
            Self::Yaml => serde_yaml::to_string(config).map_err(|e| e.to_string()),
        };
        text.map_err(|e| RxMonError::Serialization(format!("{:?} config: {}", self, e)))
    }
}

/// Configuration manager
#[derive(Debug)]
pub struct ConfigManager {
    /// Current configuration
    config: MonitorConfig,
    /// Path to configuration file
    config_path: Option<PathBuf>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    /// Create new configuration manager
    pub fn new() -> Self {
        Self {
            config: MonitorConfig::default(),
            config_path: None,
        }
    }

    /// Create configuration manager with config
    pub fn with_config(config: MonitorConfig) -> Self {
        Self {
            config,
            config_path: None,
        }
    }

    /// Load a monitor configuration. Missing sections and fields take
    /// their defaults; the result is not validated here.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let config = format.decode(&fs::read_to_string(path)?)?;
        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text = self.render(ConfigFormat::from_path(path)?)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Current configuration as text, e.g. for a diagnostics dump.
    pub fn render(&self, format: ConfigFormat) -> Result<String> {
        format.encode(&self.config)
    }

    pub fn get_config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&mut self, new_config: MonitorConfig) -> Result<()> {
        let validation = self.validate_config(&new_config)?;
        if !validation.valid {
            return Err(RxMonError::Config(format!(
                "Configuration validation failed: {}",
                validation.errors.join(", ")
            )));
        }
        self.config = new_config;
        Ok(())
    }

    /// Validate configuration
    pub fn validate_config(&self, config: &MonitorConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        };
        let consumers = &config.consumers;

        // Consumer modes
        if consumers.header_only && consumers.mcopy != McopyMode::Disabled {
            result
                .errors
                .push("Header-only delivery and m-copy cannot both be enabled".to_string());
        }
        if consumers.header_only && !consumers.monitor_vdev {
            result
                .errors
                .push("Header-only delivery requires a monitor vdev".to_string());
        }
        if consumers.header_only && consumers.neighbour_peers.is_empty() {
            result
                .warnings
                .push("Header-only delivery has no neighbour peers to match".to_string());
        }
        for mac in &consumers.neighbour_peers {
            if let Err(e) = parse_mac(mac) {
                result.errors.push(format!("Invalid neighbour peer: {}", e));
            }
        }

        // Ring
        if config.ring.entries == 0 {
            result.errors.push("Ring entries cannot be 0".to_string());
        } else if config.ring.entries < 2 {
            result
                .errors
                .push("Ring needs at least 2 entries".to_string());
        }
        let header_len = config.parser.header_mode.header_len();
        if config.ring.buf_size < header_len {
            result.errors.push(format!(
                "Buffer size {} is smaller than a TLV header ({} bytes)",
                config.ring.buf_size, header_len
            ));
        }
        if config.ring.buf_size % RX_MON_STATUS_BUF_ALIGN != 0 {
            result.errors.push(format!(
                "Buffer size {} is not a multiple of {}",
                config.ring.buf_size, RX_MON_STATUS_BUF_ALIGN
            ));
        }
        if config.ring.alloc_retry_threshold == 0 {
            result
                .errors
                .push("Allocation retry threshold cannot be 0".to_string());
        }

        // Parser
        if config.parser.max_users == 0 || config.parser.max_users > MAX_MU_USERS {
            result.errors.push(format!(
                "Max users must be between 1 and {}, got {}",
                MAX_MU_USERS, config.parser.max_users
            ));
        }

        if config.channel.num == 0 {
            result
                .warnings
                .push("Fallback channel is 0, status without channel stays unset".to_string());
        }

        result.valid = result.errors.is_empty();
        Ok(result)
    }

    /// Re-read the file this manager was loaded from. An invalid file
    /// leaves the current configuration in place.
    pub fn reload(&mut self) -> Result<()> {
        let Some(path) = self.config_path.as_deref() else {
            return Err(RxMonError::Config("No config file path set".to_string()));
        };
        let config = ConfigFormat::from_path(path)?.decode(&fs::read_to_string(path)?)?;
        self.update_config(config)
    }
}
