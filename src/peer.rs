//! Peer lookup and neighbour tracking
//!
//! The receive path identifies transmitters by AST index (address search
//! table entry). [`PeerTable`] resolves those to software peer ids; the
//! platform supplies the real table, [`StaticPeerTable`] is an in-memory
//! one for tests and replay.

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Result, RxMonError, INVALID_AST_INDEX, RSSI_INVALID};

pub type MacAddr = [u8; 6];

/// Format a MAC address as `aa:bb:cc:dd:ee:ff`.
pub fn format_mac(mac: &MacAddr) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Parse a colon-separated MAC address.
pub fn parse_mac(s: &str) -> Result<MacAddr> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| RxMonError::Parse(format!("MAC address too short: {}", s)))?;
        if part.len() != 2 {
            return Err(RxMonError::Parse(format!("bad MAC octet '{}' in {}", part, s)));
        }
        *byte = u8::from_str_radix(part, 16)
            .map_err(|e| RxMonError::Parse(format!("bad MAC octet '{}' in {}: {}", part, s, e)))?;
    }
    if parts.next().is_some() {
        return Err(RxMonError::Parse(format!("MAC address too long: {}", s)));
    }
    Ok(mac)
}

/// Peer lookup supplied by the platform
pub trait PeerTable: Send {
    /// Highest AST index the table may hold.
    fn max_ast_index(&self) -> u16;

    /// Software peer id behind an AST entry. Callers must not pass indices
    /// above [`max_ast_index`](Self::max_ast_index); see [`lookup_ast`].
    fn peer_by_ast(&self, ast_index: u16) -> Option<u16>;

    fn peer_mac(&self, peer_id: u16) -> Option<MacAddr>;

    /// Whether per-peer packet logging is enabled for this peer.
    fn pktlog_enabled(&self, peer_id: u16) -> bool;
}

/// Bounds-checked AST lookup; `None` for invalid or out-of-range indices.
pub fn lookup_ast(table: &dyn PeerTable, ast_index: u16) -> Option<u16> {
    if ast_index == INVALID_AST_INDEX {
        return None;
    }
    if ast_index > table.max_ast_index() {
        warn!(
            "AST index {} beyond table limit {}",
            ast_index,
            table.max_ast_index()
        );
        return None;
    }
    table.peer_by_ast(ast_index)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PeerEntry {
    mac: MacAddr,
    pktlog: bool,
}

/// In-memory peer table
#[derive(Debug, Clone, Default)]
pub struct StaticPeerTable {
    ast: HashMap<u16, u16>,
    peers: HashMap<u16, PeerEntry>,
    max_ast_index: u16,
}

impl StaticPeerTable {
    pub fn new(max_ast_index: u16) -> Self {
        Self {
            max_ast_index,
            ..Default::default()
        }
    }

    pub fn add_peer(&mut self, ast_index: u16, peer_id: u16, mac: MacAddr) -> bool {
        if ast_index > self.max_ast_index {
            warn!("AST index {} rejected, limit {}", ast_index, self.max_ast_index);
            return false;
        }
        self.ast.insert(ast_index, peer_id);
        self.peers.insert(peer_id, PeerEntry { mac, pktlog: false });
        true
    }

    pub fn set_pktlog(&mut self, peer_id: u16, enabled: bool) {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.pktlog = enabled;
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

impl PeerTable for StaticPeerTable {
    fn max_ast_index(&self) -> u16 {
        self.max_ast_index
    }

    fn peer_by_ast(&self, ast_index: u16) -> Option<u16> {
        self.ast.get(&ast_index).copied()
    }

    fn peer_mac(&self, peer_id: u16) -> Option<MacAddr> {
        self.peers.get(&peer_id).map(|p| p.mac)
    }

    fn pktlog_enabled(&self, peer_id: u16) -> bool {
        self.peers.get(&peer_id).map(|p| p.pktlog).unwrap_or(false)
    }
}

/// A configured neighbour (non-associated client) being tracked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighbourPeer {
    pub mac: String,
    pub rssi: i8,
    pub frames: u64,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Neighbour peers whose RSSI is sampled from overheard frames
#[derive(Debug, Clone, Default)]
pub struct NeighbourTable {
    peers: HashMap<MacAddr, NeighbourPeer>,
}

impl NeighbourTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_macs(macs: &[MacAddr]) -> Self {
        let mut table = Self::new();
        for mac in macs {
            table.add(*mac);
        }
        table
    }

    pub fn add(&mut self, mac: MacAddr) {
        self.peers.entry(mac).or_insert_with(|| NeighbourPeer {
            mac: format_mac(&mac),
            rssi: RSSI_INVALID,
            frames: 0,
            last_seen: None,
        });
    }

    pub fn remove(&mut self, mac: &MacAddr) -> Option<NeighbourPeer> {
        self.peers.remove(mac)
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn get(&self, mac: &MacAddr) -> Option<&NeighbourPeer> {
        self.peers.get(mac)
    }

    pub fn peers(&self) -> impl Iterator<Item = &NeighbourPeer> {
        self.peers.values()
    }

    /// Record an RSSI sample if `mac` is a tracked neighbour.
    pub fn update_rssi(&mut self, mac: &MacAddr, rssi: i8, now: DateTime<Utc>) -> bool {
        match self.peers.get_mut(mac) {
            Some(peer) => {
                peer.rssi = rssi;
                peer.frames += 1;
                peer.last_seen = Some(now);
                true
            }
            None => false,
        }
    }
}
