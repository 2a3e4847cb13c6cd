//! # rxmon: monitor-mode receive status pipeline
//!
//! Drains a hardware status ring carrying per-PPDU TLV buffers, keeps the
//! ring armed from a bounded descriptor pool, rebuilds each PPDU from the
//! TLV stream and fans the result out to the enabled consumer modes.
//!
//! ## Architecture
//!
//! The implementation is organized into several modules:
//! - `hw`: hardware ring and DMA collaborator traits, plus a software model
//! - `buffer`: status buffers and the parse queue
//! - `desc`: descriptor pool (arena + free index stack)
//! - `replenish`: buffer preparation and ring re-arming
//! - `reap`: status ring reader and the drop path
//! - `tlv`: status TLV decoding
//! - `ppdu`: the PPDU aggregate and its state machine
//! - `fanout`: consumer dispatch
//! - `stats` / `peer`: per-peer statistics and lookup tables
//! - `pipeline`: per-radio entry point and round-robin scheduling
//! - `config`: configuration surface

pub mod buffer;
pub mod config;
pub mod desc;
pub mod fanout;
pub mod hw;
pub mod peer;
pub mod pipeline;
pub mod ppdu;
pub mod reap;
pub mod replenish;
pub mod stats;
pub mod tlv;

// Re-export commonly used types
pub use crate::{
    buffer::{StatusBuffer, StatusQueue},
    config::{ConfigFormat, ConfigManager, MonitorConfig},
    desc::DescriptorPool,
    fanout::{Disposition, MonitorSinks},
    pipeline::{RadioPipeline, Scheduler},
    ppdu::{PpduInfo, PpduStatus},
    stats::{RxMonStats, StatsAggregator},
    tlv::{StatusTlv, TlvStatus},
};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RxMonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Ring error: {0}")]
    Ring(String),

    #[error("Buffer allocation failed: {0}")]
    Alloc(String),

    #[error("DMA map failed for {size} byte buffer")]
    Map { size: usize },

    #[error("Descriptor pool exhausted")]
    PoolExhausted,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, RxMonError>;

/// Radio (MAC) instance identifier.
pub type RadioId = u8;

// Constants
pub const RX_MON_STATUS_BASE_BUF_SIZE: usize = 2048;
pub const RX_MON_STATUS_BUF_RESERVATION: usize = 128;
pub const RX_MON_STATUS_BUF_ALIGN: usize = 128;
/// Usable status buffer size once headroom and alignment are carved out.
pub const RX_MON_STATUS_BUF_SIZE: usize =
    RX_MON_STATUS_BASE_BUF_SIZE - RX_MON_STATUS_BUF_RESERVATION - RX_MON_STATUS_BUF_ALIGN;
pub const MON_DROP_REAP_LIMIT: u32 = 64;
pub const NBUF_ALLOC_MAP_RETRY_THRESHOLD: u32 = 20;
pub const MAX_MU_USERS: usize = 16;
pub const MAX_MPDU_HDR_PER_STATUS_BUFFER: usize = 16;
pub const INVALID_PPDU_ID: u32 = 0xFFFF_FFFF;
pub const INVALID_PEER_ID: u16 = 0xFFFF;
pub const INVALID_AST_INDEX: u16 = 0xFFFF;
pub const RSSI_INVALID: i8 = -128;
/// Ownership tag written into ring entries armed by software.
pub const RX_MON_STATUS_OWNER: u8 = 4;

// Utility functions
pub fn init_logging() {
    env_logger::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(RX_MON_STATUS_BUF_SIZE, 1792);
        assert_eq!(RX_MON_STATUS_BUF_SIZE % 8, 0);
        assert!(MAX_MPDU_HDR_PER_STATUS_BUFFER <= 16);
        assert_eq!(MON_DROP_REAP_LIMIT, 64);
    }

    #[test]
    fn test_error_display() {
        let err = RxMonError::Map { size: 1792 };
        assert_eq!(err.to_string(), "DMA map failed for 1792 byte buffer");
        assert_eq!(RxMonError::PoolExhausted.to_string(), "Descriptor pool exhausted");
    }
}
