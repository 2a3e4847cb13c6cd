//! Per-peer receive statistics
//!
//! [`StatsAggregator`] turns a completed [`PpduInfo`] into an
//! [`RxPpduIndication`] and folds it into per-peer counters. Time comes
//! from an injected [`Clock`] and PHY rates from an injected
//! [`RateTable`], so the aggregator is deterministic under test.

use chrono::{DateTime, Utc};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::buffer::QueueStats;
use crate::fanout::FanoutStats;
use crate::peer::{format_mac, lookup_ast, PeerTable};
use crate::ppdu::{
    is_data_frame, ParseDiag, PpduInfo, Preamble, ReceptionType, MAX_CHAINS, OFDMA_NUM_RU_SIZE,
    TID_INVALID,
};
use crate::reap::ReapStats;
use crate::replenish::ReplenishStats;
use crate::{RadioId, INVALID_PEER_ID, MAX_MU_USERS};

/// MCS histogram buckets; the last one collects out-of-range values.
pub const MAX_MCS: usize = 14;
const MAX_MCS_11A: u8 = 8;
const MAX_MCS_11B: u8 = 4;
const MAX_MCS_11AC: u8 = 10;
const MAX_NSS: usize = 8;
const WME_AC_MAX: usize = 4;
/// SNR gain per bandwidth step (20/40/80/160 MHz)
const PKT_BW_GAIN: [u8; 4] = [0, 3, 6, 9];
const SNR_MULTIPLIER: u32 = 100;
const RATE_MULTIPLIER: u32 = 1000;
const LPF_LEN: u32 = 10;
const FC_RETRY: u16 = 0x0800;

/// Time source
pub trait Clock: Send {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests; clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = t;
    }

    pub fn advance(&self, d: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += d;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// PHY rate lookup in kbps; 0 when the combination is not valid.
pub trait RateTable: Send {
    fn rate_kbps(&self, preamble: Preamble, mcs: u8, nss: u8, bw: u8, gi: u8) -> u32;
}

/// Coarse rate table: single-stream 20 MHz long-GI rates scaled by
/// streams and bandwidth.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicRateTable;

const RATES_11B: [u32; 4] = [1000, 2000, 5500, 11000];
const RATES_11A: [u32; 8] = [6000, 9000, 12000, 18000, 24000, 36000, 48000, 54000];
const RATES_HT_VHT: [u32; 10] = [6500, 13000, 19500, 26000, 39000, 52000, 58500, 65000, 78000, 86700];
const RATES_HE: [u32; 12] = [
    8600, 17200, 25800, 34400, 51600, 68800, 77400, 86000, 103200, 114700, 129000, 143400,
];

impl RateTable for BasicRateTable {
    fn rate_kbps(&self, preamble: Preamble, mcs: u8, nss: u8, bw: u8, gi: u8) -> u32 {
        let mcs = mcs as usize;
        let base = match preamble {
            Preamble::Dot11B => return RATES_11B.get(mcs).copied().unwrap_or(0),
            Preamble::Dot11A => return RATES_11A.get(mcs).copied().unwrap_or(0),
            Preamble::Dot11N if mcs < 8 => RATES_HT_VHT[mcs],
            Preamble::Dot11Ac => RATES_HT_VHT.get(mcs).copied().unwrap_or(0),
            Preamble::Dot11Ax => RATES_HE.get(mcs).copied().unwrap_or(0),
            Preamble::Dot11N => 0,
        };
        if base == 0 || nss == 0 || bw > 3 {
            return 0;
        }
        let mut rate = base * nss as u32 * (1 << bw);
        if gi == 1 && matches!(preamble, Preamble::Dot11N | Preamble::Dot11Ac) {
            rate = rate * 10 / 9;
        }
        rate
    }
}

/// MCS histogram
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McsCount {
    pub mcs_count: [u64; MAX_MCS],
}

impl McsCount {
    /// Count `n` at `mcs`, or in the overflow bucket when `mcs >= limit`.
    fn add(&mut self, mcs: u8, limit: u8, n: u64) {
        let idx = if mcs >= limit {
            MAX_MCS - 1
        } else {
            mcs as usize
        };
        self.mcs_count[idx] += n;
    }
}

/// Per reception-type counters for MU PPDUs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuRxStats {
    pub ppdu_nss: [u64; MAX_NSS],
    pub mpdu_cnt_fcs_ok: u64,
    pub mpdu_cnt_fcs_err: u64,
    pub ppdu: McsCount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRxStats {
    pub peer_id: u16,
    pub mac: Option<String>,
    pub snr: u8,
    pub last_snr: u8,
    /// SNR average scaled by 100; `None` until the first sample.
    pub avg_snr: Option<u32>,
    pub nss: [u64; MAX_NSS],
    pub ppdu_nss: [u64; MAX_NSS],
    pub mpdu_cnt_fcs_ok: u64,
    pub mpdu_cnt_fcs_err: u64,
    /// Indexed MU-MIMO, MU-OFDMA
    pub rx_mu: [MuRxStats; 2],
    pub sgi_count: [u64; 4],
    pub bw: [u64; 4],
    pub reception_type: [u64; 4],
    pub ppdu_cnt: [u64; 4],
    pub ampdu_cnt: u64,
    pub non_ampdu_cnt: u64,
    pub rx_rate: u8,
    /// Indexed by preamble
    pub pkt_type: [McsCount; 5],
    pub su_ax_ppdu_cnt: McsCount,
    pub wme_ac_type: [u64; WME_AC_MAX],
    pub last_rx_rate: u32,
    pub avg_rx_rate: u32,
    pub rnd_avg_rx_rate: u32,
    pub last_rx_at: Option<DateTime<Utc>>,
}

impl PeerRxStats {
    pub fn new(peer_id: u16) -> Self {
        Self {
            peer_id,
            ..Default::default()
        }
    }

    /// Smoothed SNR in dB.
    pub fn avg_snr_db(&self) -> Option<u32> {
        self.avg_snr
            .map(|avg| (avg + SNR_MULTIPLIER / 2) / SNR_MULTIPLIER)
    }

    fn update_snr(&mut self, snr: u8) {
        self.snr = snr;
        let sample = snr as u32 * SNR_MULTIPLIER;
        self.avg_snr = Some(match self.avg_snr {
            None => sample,
            Some(avg) => lpf(avg, sample),
        });
    }

    fn update_rate(&mut self, ratekbps: u32) {
        if ratekbps == 0 {
            return;
        }
        self.last_rx_rate = ratekbps;
        let sample = ratekbps * RATE_MULTIPLIER;
        self.avg_rx_rate = if self.avg_rx_rate == 0 {
            sample
        } else {
            lpf(self.avg_rx_rate, sample)
        };
        self.rnd_avg_rx_rate = (self.avg_rx_rate + RATE_MULTIPLIER / 2) / RATE_MULTIPLIER;
    }
}

fn lpf(avg: u32, sample: u32) -> u32 {
    ((avg as u64 * (LPF_LEN as u64 - 1) + sample as u64) / LPF_LEN as u64) as u32
}

fn tid_to_wme_ac(tid: u8) -> usize {
    match tid & 0x7 {
        1 | 2 => 1,
        4 | 5 => 2,
        6 | 7 => 3,
        _ => 0,
    }
}

/// Per-user slice of a PPDU indication
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxPpduUser {
    pub peer_id: u16,
    pub mac: Option<String>,
    pub tid: u8,
    pub num_msdu: u32,
    pub mpdu_cnt_fcs_ok: u32,
    pub mpdu_cnt_fcs_err: u32,
    pub mpdu_ok_byte_count: u32,
    pub mpdu_err_byte_count: u32,
    pub is_ampdu: bool,
    pub retries: u32,
    pub frame_control: u16,
    pub first_data_seq_ctrl: u16,
    pub mcs: u8,
    pub nss: u8,
    pub mu_ul_info_valid: bool,
    pub ofdma_ru_start_index: u32,
    pub ofdma_ru_width: u32,
    pub rx_ratekbps: u32,
}

/// Summary of one received PPDU handed to statistics consumers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxPpduIndication {
    pub ppdu_id: u32,
    pub peer_id: u16,
    pub mac: Option<String>,
    pub num_users: u32,
    pub num_mpdu: u32,
    pub num_msdu: u32,
    pub is_ampdu: bool,
    pub retries: u32,
    pub tid: u8,
    pub frame_control: u16,
    pub preamble: Preamble,
    pub ppdu_type: ReceptionType,
    pub mcs: u8,
    pub nss: u8,
    pub bw: u8,
    pub gi: u8,
    pub ldpc: bool,
    pub stbc: bool,
    pub dcm: bool,
    pub beamformed: bool,
    pub ltf_size: u8,
    pub rssi: u8,
    pub per_chain_rssi: [i8; MAX_CHAINS],
    pub timestamp: u64,
    pub duration: u32,
    pub channel: u16,
    pub rx_antenna: u32,
    pub is_mcast_bcast: bool,
    pub rx_ratekbps: u32,
    pub users: Vec<RxPpduUser>,
}

/// UL OFDMA counters at radio level
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UlOfdmaStats {
    pub data_rx_ru_size: [u64; OFDMA_NUM_RU_SIZE],
    pub nondata_rx_ru_size: [u64; OFDMA_NUM_RU_SIZE],
    pub data_rx_ppdu: u64,
    pub data_users: [u64; MAX_MU_USERS + 1],
}

/// Radio-level diagnostic snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RxMonStats {
    pub radio: RadioId,
    pub captured_at: DateTime<Utc>,
    pub reap: ReapStats,
    pub replenish: ReplenishStats,
    pub parse: ParseDiag,
    pub fanout: FanoutStats,
    pub queue: QueueStats,
    pub ul_ofdma: UlOfdmaStats,
    pub descriptors_free: usize,
    pub peers_tracked: usize,
}

pub struct StatsAggregator {
    clock: Box<dyn Clock>,
    rates: Box<dyn RateTable>,
    peers: HashMap<u16, PeerRxStats>,
    invalid_peer: PeerRxStats,
    ul_ofdma: UlOfdmaStats,
    indications: u64,
}

impl std::fmt::Debug for StatsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsAggregator")
            .field("peers", &self.peers.len())
            .field("indications", &self.indications)
            .finish()
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(Box::new(SystemClock), Box::new(BasicRateTable))
    }
}

impl StatsAggregator {
    pub fn new(clock: Box<dyn Clock>, rates: Box<dyn RateTable>) -> Self {
        Self {
            clock,
            rates,
            peers: HashMap::new(),
            invalid_peer: PeerRxStats::new(INVALID_PEER_ID),
            ul_ofdma: UlOfdmaStats::default(),
            indications: 0,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn peer(&self, peer_id: u16) -> Option<&PeerRxStats> {
        self.peers.get(&peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerRxStats> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Counters for frames whose transmitter could not be resolved.
    pub fn invalid_peer(&self) -> &PeerRxStats {
        &self.invalid_peer
    }

    pub fn ul_ofdma(&self) -> &UlOfdmaStats {
        &self.ul_ofdma
    }

    pub fn indications(&self) -> u64 {
        self.indications
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.invalid_peer = PeerRxStats::new(INVALID_PEER_ID);
        self.ul_ofdma = UlOfdmaStats::default();
        self.indications = 0;
    }

    /// Build the indication for a completed PPDU and update per-peer
    /// counters. `notify` sees each peer's counters after its update.
    /// Returns the indication when it has a consumer: a resolved peer, or
    /// m-copy mode.
    pub fn handle_ppdu(
        &mut self,
        ppdu: &PpduInfo,
        peers: &dyn PeerTable,
        mcopy: bool,
        notify: &mut dyn FnMut(&PeerRxStats),
    ) -> Option<RxPpduIndication> {
        if ppdu.com_info.mpdu_cnt_fcs_ok == 0 {
            return None;
        }
        let rx = &ppdu.rx_status;
        if (!rx.frame_control_info_valid || rx.ast_index == crate::INVALID_AST_INDEX) && !mcopy {
            return None;
        }

        let mut ind = self.populate_indication(ppdu, peers);
        self.update_peer_stats(&mut ind, notify);
        self.indications += 1;

        if ind.peer_id != INVALID_PEER_ID || mcopy {
            Some(ind)
        } else {
            None
        }
    }

    fn populate_indication(&mut self, ppdu: &PpduInfo, peers: &dyn PeerTable) -> RxPpduIndication {
        let rx = &ppdu.rx_status;
        let com = &ppdu.com_info;
        let num_msdu =
            rx.tcp_msdu_count as u32 + rx.udp_msdu_count as u32 + rx.other_msdu_count as u32;
        let mut ind = RxPpduIndication {
            ppdu_id: com.ppdu_id,
            peer_id: INVALID_PEER_ID,
            frame_control: rx.frame_control,
            preamble: rx.preamble_type,
            num_mpdu: com.mpdu_cnt_fcs_ok,
            num_msdu,
            retries: if rx.frame_control & FC_RETRY != 0 {
                com.mpdu_cnt_fcs_ok
            } else {
                0
            },
            is_ampdu: com.mpdu_cnt_fcs_ok > 1,
            tid: rx.tid,
            ..Default::default()
        };

        let Some(peer_id) = lookup_ast(peers, rx.ast_index) else {
            return ind;
        };
        ind.peer_id = peer_id;
        ind.mac = peers.peer_mac(peer_id).map(|m| format_mac(&m));
        ind.bw = rx.bw;
        ind.nss = rx.nss;
        ind.mcs = rx.mcs;
        ind.gi = rx.sgi;
        ind.ldpc = rx.ldpc;
        ind.stbc = rx.is_stbc;
        ind.dcm = rx.dcm;
        ind.ppdu_type = rx.reception_type;
        ind.ltf_size = rx.ltf_size;
        ind.rssi = rx.rssi_comb;
        ind.per_chain_rssi = rx.rssi;
        ind.timestamp = rx.tsft;
        ind.duration = rx.duration;
        ind.channel = rx.chan_num;
        ind.beamformed = rx.beamformed;
        ind.rx_antenna = rx.rx_antenna;
        ind.is_mcast_bcast = rx.mcast_bcast;
        ind.num_users = com.num_users;
        ind.num_mpdu = 0;
        ind.num_msdu = 0;

        let num_users = ppdu.active_users();
        for (i, user) in ppdu.user_status.iter().enumerate().take(num_users) {
            let Some(user_peer) = lookup_ast(peers, user.ast_index) else {
                ind.users.push(RxPpduUser {
                    peer_id: INVALID_PEER_ID,
                    ..Default::default()
                });
                continue;
            };
            let mut out = RxPpduUser {
                peer_id: user_peer,
                mac: peers.peer_mac(user_peer).map(|m| format_mac(&m)),
                tid: rx.tid,
                num_msdu: user.num_msdu(),
                mpdu_cnt_fcs_ok: user.mpdu_cnt_fcs_ok,
                mpdu_cnt_fcs_err: user.mpdu_cnt_fcs_err,
                mpdu_ok_byte_count: user.mpdu_ok_byte_count,
                mpdu_err_byte_count: user.mpdu_err_byte_count,
                is_ampdu: user.mpdu_cnt_fcs_ok > 1,
                retries: if user.frame_control & FC_RETRY != 0 {
                    user.mpdu_cnt_fcs_ok
                } else {
                    0
                },
                frame_control: user.frame_control,
                first_data_seq_ctrl: user.first_data_seq_ctrl,
                mcs: user.mcs,
                nss: user.nss,
                ..Default::default()
            };
            ind.num_mpdu += user.mpdu_cnt_fcs_ok;
            ind.num_msdu += out.num_msdu;

            if rx.reception_type.is_mu() && user.mu_ul_info_valid {
                out.mu_ul_info_valid = true;
                out.ofdma_ru_start_index = user.ofdma_ru_start_index;
                out.ofdma_ru_width = user.ofdma_ru_width;
                let ru_size = user.ofdma_ru_size as usize;
                if ru_size >= OFDMA_NUM_RU_SIZE {
                    error!("user {} reports invalid RU size {}", i, ru_size);
                    ind.users.push(out);
                    break;
                }
                if is_data_frame(user.frame_control) {
                    self.ul_ofdma.data_rx_ru_size[ru_size] += 1;
                    self.ul_ofdma.data_rx_ppdu += 1;
                    self.ul_ofdma.data_users[num_users.min(MAX_MU_USERS)] += 1;
                } else {
                    self.ul_ofdma.nondata_rx_ru_size[ru_size] += 1;
                }
            }
            ind.users.push(out);
        }
        ind
    }

    fn update_peer_stats(&mut self, ind: &mut RxPpduIndication, notify: &mut dyn FnMut(&PeerRxStats)) {
        let preamble = ind.preamble;
        let ppdu_type = ind.ppdu_type;
        if matches!(preamble, Preamble::Dot11A | Preamble::Dot11B) {
            ind.nss = 1;
        }
        let pkt_bw_offset = match PKT_BW_GAIN.get(ind.bw as usize) {
            Some(gain) => *gain,
            None => {
                debug!("invalid bandwidth index {}", ind.bw);
                0
            }
        };
        let now = self.clock.now();

        for i in 0..ind.users.len() {
            let user = ind.users[i].clone();
            let valid = user.peer_id != INVALID_PEER_ID;
            let peer = if valid {
                self.peers
                    .entry(user.peer_id)
                    .or_insert_with(|| PeerRxStats::new(user.peer_id))
            } else {
                &mut self.invalid_peer
            };
            if peer.mac.is_none() {
                peer.mac = user.mac.clone();
            }

            let (mcs, nss) = if ppdu_type == ReceptionType::Su {
                (ind.mcs, ind.nss)
            } else {
                (user.mcs, user.nss)
            };
            let num_msdu = user.num_msdu as u64;

            peer.update_snr(ind.rssi.saturating_add(pkt_bw_offset));

            let nss_idx = (nss as usize).checked_sub(1).filter(|n| *n < MAX_NSS);
            match ppdu_type {
                ReceptionType::Su => {
                    if let Some(n) = nss_idx {
                        peer.nss[n] += num_msdu;
                        peer.ppdu_nss[n] += 1;
                    }
                    peer.mpdu_cnt_fcs_ok += user.mpdu_cnt_fcs_ok as u64;
                    peer.mpdu_cnt_fcs_err += user.mpdu_cnt_fcs_err as u64;
                }
                ReceptionType::MuMimo | ReceptionType::MuOfdma => {
                    let mu = &mut peer.rx_mu[(ppdu_type == ReceptionType::MuOfdma) as usize];
                    if let Some(n) = nss_idx {
                        peer.nss[n] += num_msdu;
                        mu.ppdu_nss[n] += 1;
                    }
                    mu.mpdu_cnt_fcs_ok += user.mpdu_cnt_fcs_ok as u64;
                    mu.mpdu_cnt_fcs_err += user.mpdu_cnt_fcs_err as u64;
                }
                ReceptionType::MuOfdmaMimo => {}
            }

            if let Some(c) = peer.sgi_count.get_mut(ind.gi as usize) {
                *c += num_msdu;
            }
            if let Some(c) = peer.bw.get_mut(ind.bw as usize) {
                *c += num_msdu;
            }
            peer.reception_type[ppdu_type as usize] += num_msdu;
            peer.ppdu_cnt[ppdu_type as usize] += 1;
            if user.is_ampdu {
                peer.ampdu_cnt += num_msdu;
            } else {
                peer.non_ampdu_cnt += num_msdu;
            }
            peer.rx_rate = mcs;

            let limit = match preamble {
                Preamble::Dot11A | Preamble::Dot11N => MAX_MCS_11A,
                Preamble::Dot11B => MAX_MCS_11B,
                Preamble::Dot11Ac => MAX_MCS_11AC,
                Preamble::Dot11Ax => (MAX_MCS - 1) as u8,
            };
            peer.pkt_type[preamble as usize].add(mcs, limit, num_msdu);
            if preamble == Preamble::Dot11Ax {
                match ppdu_type {
                    ReceptionType::Su => peer.su_ax_ppdu_cnt.add(mcs, limit, 1),
                    ReceptionType::MuMimo => peer.rx_mu[0].ppdu.add(mcs, limit, 1),
                    ReceptionType::MuOfdma => peer.rx_mu[1].ppdu.add(mcs, limit, 1),
                    ReceptionType::MuOfdmaMimo => {}
                }
            }

            // Non-QoS frames carry no access category.
            if ind.tid != TID_INVALID {
                peer.wme_ac_type[tid_to_wme_ac(user.tid)] += num_msdu;
            }
            peer.last_snr = ind.rssi;

            if valid {
                peer.last_rx_at = Some(now);
                if is_data_frame(ind.frame_control) {
                    let ratekbps =
                        self.rates
                            .rate_kbps(preamble, mcs, nss.max(1), ind.bw, ind.gi);
                    peer.update_rate(ratekbps);
                    ind.users[i].rx_ratekbps = ratekbps;
                    ind.rx_ratekbps = ratekbps;
                }
            }
            notify(&*peer);
        }
    }
}
