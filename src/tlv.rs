//! Status TLV decoding
//!
//! A status buffer is a sequence of little-endian TLVs. Every TLV starts
//! with a header word carrying the tag, the declared body length and the
//! user index the record belongs to. Bodies are padded so the next header
//! starts on a header-sized boundary.
//!
//! Decoding produces a [`StatusTlv`] value; [`StatusTlv::apply`] folds it
//! into the running [`PpduInfo`] and yields the [`TlvStatus`] that drives
//! the parse loop.

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::ppdu::{
    MsduFlowInfo, ParseDiag, PayloadLoc, PpduInfo, Preamble, ReceptionType, ResponseInfo, RxState,
    MAX_BW, MAX_CHAINS,
};
use crate::{Result, RxMonError, INVALID_PPDU_ID, RSSI_INVALID};

const TAG_SHIFT: u32 = 1;
const TAG_MASK: u32 = 0x1FF;
const LEN_SHIFT: u32 = 10;
const LEN_MASK: u32 = 0xFFFF;
const USER_SHIFT: u32 = 26;
const USER_MASK: u32 = 0x3F;

/// Bytes the cursor advances over a PPDU_END record; its declared length
/// also covers the nested records that follow it.
pub const PPDU_END_FIXED_LEN: usize = 16;

/// Raw value the hardware reports for an unmeasured RSSI entry.
const RSSI_RAW_INVALID: u8 = 0x80;

/// Width of the TLV header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlvHeaderMode {
    #[default]
    Word32,
    Word64,
}

impl TlvHeaderMode {
    pub fn header_len(self) -> usize {
        match self {
            Self::Word32 => 4,
            Self::Word64 => 8,
        }
    }

    /// Bodies are padded to the header width.
    pub fn align(self) -> usize {
        self.header_len()
    }

    pub fn align_up(self, len: usize) -> usize {
        let a = self.align();
        (len + a - 1) & !(a - 1)
    }
}

/// Status TLV tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TlvTag {
    /// Unwritten memory; nothing further in this buffer.
    Empty,
    StatusBufferDone,
    PpduStart,
    PpduEnd,
    RxpcuPpduEndInfo,
    PpduEndUserStats,
    PpduEndUserStatsExt,
    PpduEndStatusDone,
    Dummy,
    PhyHtSig,
    PhyLSigA,
    PhyLSigB,
    PhyVhtSigA,
    PhyHeSigASu,
    PhyHeSigAMuDl,
    PhyHeSigB1Mu,
    PhyHeSigB2Mu,
    PhyHeSigB2Ofdma,
    PhyRssiLegacy,
    RxHeader,
    MpduStart,
    MpduEnd,
    MsduEnd,
    RxResponseRequiredInfo,
    Unknown(u16),
}

impl From<u16> for TlvTag {
    fn from(value: u16) -> Self {
        match value {
            0 => Self::Empty,
            1 => Self::StatusBufferDone,
            2 => Self::PpduStart,
            3 => Self::PpduEnd,
            4 => Self::RxpcuPpduEndInfo,
            5 => Self::PpduEndUserStats,
            6 => Self::PpduEndUserStatsExt,
            7 => Self::PpduEndStatusDone,
            8 => Self::Dummy,
            9 => Self::PhyHtSig,
            10 => Self::PhyLSigA,
            11 => Self::PhyLSigB,
            12 => Self::PhyVhtSigA,
            13 => Self::PhyHeSigASu,
            14 => Self::PhyHeSigAMuDl,
            15 => Self::PhyHeSigB1Mu,
            16 => Self::PhyHeSigB2Mu,
            17 => Self::PhyHeSigB2Ofdma,
            18 => Self::PhyRssiLegacy,
            20 => Self::RxHeader,
            21 => Self::MpduStart,
            22 => Self::MpduEnd,
            23 => Self::MsduEnd,
            24 => Self::RxResponseRequiredInfo,
            other => Self::Unknown(other),
        }
    }
}

impl From<TlvTag> for u16 {
    fn from(tag: TlvTag) -> Self {
        match tag {
            TlvTag::Empty => 0,
            TlvTag::StatusBufferDone => 1,
            TlvTag::PpduStart => 2,
            TlvTag::PpduEnd => 3,
            TlvTag::RxpcuPpduEndInfo => 4,
            TlvTag::PpduEndUserStats => 5,
            TlvTag::PpduEndUserStatsExt => 6,
            TlvTag::PpduEndStatusDone => 7,
            TlvTag::Dummy => 8,
            TlvTag::PhyHtSig => 9,
            TlvTag::PhyLSigA => 10,
            TlvTag::PhyLSigB => 11,
            TlvTag::PhyVhtSigA => 12,
            TlvTag::PhyHeSigASu => 13,
            TlvTag::PhyHeSigAMuDl => 14,
            TlvTag::PhyHeSigB1Mu => 15,
            TlvTag::PhyHeSigB2Mu => 16,
            TlvTag::PhyHeSigB2Ofdma => 17,
            TlvTag::PhyRssiLegacy => 18,
            TlvTag::RxHeader => 20,
            TlvTag::MpduStart => 21,
            TlvTag::MpduEnd => 22,
            TlvTag::MsduEnd => 23,
            TlvTag::RxResponseRequiredInfo => 24,
            TlvTag::Unknown(val) => val,
        }
    }
}

/// Decoded TLV header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvHeader {
    pub tag: TlvTag,
    pub len: u16,
    pub user_id: u8,
}

impl TlvHeader {
    pub fn new(tag: TlvTag, len: u16, user_id: u8) -> Self {
        Self { tag, len, user_id }
    }

    /// Decode the header at the start of `buf`; `None` when too short.
    pub fn decode(buf: &[u8], mode: TlvHeaderMode) -> Option<Self> {
        if buf.len() < mode.header_len() {
            return None;
        }
        let mut cursor = buf;
        // The 64-bit layout keeps every field in the low word.
        let word = cursor.get_u32_le();
        Some(Self {
            tag: TlvTag::from(((word >> TAG_SHIFT) & TAG_MASK) as u16),
            len: ((word >> LEN_SHIFT) & LEN_MASK) as u16,
            user_id: ((word >> USER_SHIFT) & USER_MASK) as u8,
        })
    }

    pub fn encode(&self, out: &mut impl BufMut, mode: TlvHeaderMode) {
        let word = ((u16::from(self.tag) as u32 & TAG_MASK) << TAG_SHIFT)
            | ((self.len as u32 & LEN_MASK) << LEN_SHIFT)
            | ((self.user_id as u32 & USER_MASK) << USER_SHIFT);
        out.put_u32_le(word);
        if mode == TlvHeaderMode::Word64 {
            out.put_u32_le(0);
        }
    }
}

/// Whether the hardware finished writing a status buffer: its first record
/// is the buffer-done marker.
pub fn is_status_done(buf: &[u8], mode: TlvHeaderMode) -> bool {
    matches!(
        TlvHeader::decode(buf, mode),
        Some(TlvHeader { tag: TlvTag::StatusBufferDone, .. })
    )
}

/// Outcome of applying one TLV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlvStatus {
    PpduNotDone,
    PpduDone,
    PpduNonStdDone,
    BufDone,
    Header,
    MpduEnd,
    MsduEnd,
}

impl TlvStatus {
    /// Statuses after which the parse loop keeps walking the buffer.
    pub fn continues(self) -> bool {
        matches!(
            self,
            Self::PpduNotDone | Self::Header | Self::MpduEnd | Self::MsduEnd
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PpduStart {
    pub ppdu_id: u32,
    pub chan_num: u16,
    pub chan_freq: u16,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpduEnd {
    pub end_timestamp: u64,
    pub phy_flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxpcuEndInfo {
    pub rx_antenna: u32,
    pub tsft: u64,
    pub duration: u32,
}

/// PPDU_END_USER_STATS body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserStats {
    pub ast_index: u16,
    pub sw_peer_id: u16,
    pub mpdu_cnt_fcs_ok: u16,
    pub mpdu_cnt_fcs_err: u16,
    pub tid: u8,
    pub frame_control_valid: bool,
    pub data_seq_ctrl_valid: bool,
    pub monitor_direct_used: bool,
    pub frame_control: u16,
    pub first_data_seq_ctrl: u16,
    pub tcp_msdu_count: u16,
    pub udp_msdu_count: u16,
    pub other_msdu_count: u16,
    pub mpdu_ok_byte_count: u32,
    pub mpdu_err_byte_count: u32,
    pub mu_ul_word0: u32,
    pub mu_ul_word1: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HtSig {
    pub mcs: u8,
    pub bw: u8,
    pub sgi: u8,
    pub ldpc: bool,
    pub stbc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VhtSigA {
    pub bw: u8,
    pub sgi: u8,
    pub mcs: u8,
    pub nss: u8,
    pub stbc: bool,
    pub ldpc: bool,
    pub group_id: u8,
    pub beamformed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeSigASu {
    pub mcs: u8,
    pub bw: u8,
    pub nss: u8,
    pub gi: u8,
    pub ltf_size: u8,
    pub dcm: bool,
    pub stbc: bool,
    pub ldpc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeSigAMuDl {
    pub bw: u8,
    pub gi: u8,
    pub ltf_size: u8,
    pub dcm: bool,
    pub stbc: bool,
    pub ldpc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeSigB2 {
    pub mcs: u8,
    pub nss: u8,
    pub coding: u8,
    /// STA id for MU-MIMO, DCM flag for OFDMA.
    pub extra: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssiLegacy {
    pub rssi_comb: u8,
    pub bw: u8,
    pub reception_type: u8,
    pub num_chains: u8,
    pub chains: [[i8; MAX_BW]; MAX_CHAINS],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MpduStart {
    pub ppdu_id: u32,
    pub sw_peer_id: u16,
    pub frame_control: u16,
    pub mpdu_length: u16,
    pub fc_valid: bool,
    pub to_ds: bool,
    pub mac_addr2_valid: bool,
    pub mcast_bcast: bool,
    pub sw_frame_group_id: u8,
    pub mac_addr2: [u8; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsduEnd {
    pub flow_idx: u32,
    pub fse_metadata: u32,
    pub cce_metadata: u16,
    pub flow_idx_timeout: bool,
    pub flow_idx_invalid: bool,
    pub first_msdu: bool,
    pub last_msdu: bool,
}

/// Decoded status record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusTlv {
    StatusBufferDone,
    PpduStart(PpduStart),
    PpduEnd(PpduEnd),
    RxpcuPpduEndInfo(RxpcuEndInfo),
    UserStats(UserStats),
    UserStatsExt([u32; 6]),
    PpduEndStatusDone,
    Dummy,
    HtSig(HtSig),
    LSigA { rate: u8 },
    LSigB { rate: u8 },
    VhtSigA(VhtSigA),
    HeSigASu(HeSigASu),
    HeSigAMuDl(HeSigAMuDl),
    HeSigB1Mu { ru_allocation: u16 },
    HeSigB2Mu(HeSigB2),
    HeSigB2Ofdma(HeSigB2),
    RssiLegacy(RssiLegacy),
    /// 802.11 header capture; location is relative to the status buffer.
    RxHeader { payload: PayloadLoc, phy_ppdu_id: u32 },
    MpduStart(MpduStart),
    MpduEnd { fcs_err: bool },
    MsduEnd(MsduEnd),
    ResponseRequired(ResponseInfo),
    Empty,
    Unknown(u16),
}

fn need(body: &[u8], len: usize, what: &str) -> Result<()> {
    if body.len() < len {
        return Err(RxMonError::Parse(format!(
            "{} body is {} bytes, need {}",
            what,
            body.len(),
            len
        )));
    }
    Ok(())
}

fn flag(bits: u8, bit: u8) -> bool {
    bits & (1 << bit) != 0
}

impl StatusTlv {
    /// Decode one record. `body` is the declared body (possibly truncated by
    /// the end of the buffer) and `body_offset` its position in the buffer.
    pub fn decode(hdr: &TlvHeader, body: &[u8], body_offset: usize) -> Result<Self> {
        let mut b = body;
        let tlv = match hdr.tag {
            TlvTag::Empty => Self::Empty,
            TlvTag::StatusBufferDone => Self::StatusBufferDone,
            TlvTag::PpduStart => {
                need(b, 16, "PPDU_START")?;
                Self::PpduStart(PpduStart {
                    ppdu_id: b.get_u32_le(),
                    chan_num: b.get_u16_le(),
                    chan_freq: b.get_u16_le(),
                    timestamp: b.get_u64_le(),
                })
            }
            TlvTag::PpduEnd => {
                need(b, PPDU_END_FIXED_LEN, "PPDU_END")?;
                Self::PpduEnd(PpduEnd {
                    end_timestamp: b.get_u64_le(),
                    phy_flags: b.get_u32_le(),
                })
            }
            TlvTag::RxpcuPpduEndInfo => {
                need(b, 16, "RXPCU_PPDU_END_INFO")?;
                Self::RxpcuPpduEndInfo(RxpcuEndInfo {
                    rx_antenna: b.get_u32_le(),
                    tsft: b.get_u64_le(),
                    duration: b.get_u32_le(),
                })
            }
            TlvTag::PpduEndUserStats => {
                need(b, 40, "PPDU_END_USER_STATS")?;
                let ast_index = b.get_u16_le();
                let sw_peer_id = b.get_u16_le();
                let mpdu_cnt_fcs_ok = b.get_u16_le();
                let mpdu_cnt_fcs_err = b.get_u16_le();
                let tid = b.get_u8();
                let flags = b.get_u8();
                Self::UserStats(UserStats {
                    ast_index,
                    sw_peer_id,
                    mpdu_cnt_fcs_ok,
                    mpdu_cnt_fcs_err,
                    tid,
                    frame_control_valid: flag(flags, 0),
                    data_seq_ctrl_valid: flag(flags, 1),
                    monitor_direct_used: flag(flags, 2),
                    frame_control: b.get_u16_le(),
                    first_data_seq_ctrl: b.get_u16_le(),
                    tcp_msdu_count: b.get_u16_le(),
                    udp_msdu_count: b.get_u16_le(),
                    other_msdu_count: b.get_u16_le(),
                    mpdu_ok_byte_count: b.get_u32_le(),
                    mpdu_err_byte_count: b.get_u32_le(),
                    mu_ul_word0: b.get_u32_le(),
                    mu_ul_word1: b.get_u32_le(),
                })
            }
            TlvTag::PpduEndUserStatsExt => {
                need(b, 24, "PPDU_END_USER_STATS_EXT")?;
                let mut words = [0u32; 6];
                for w in words.iter_mut() {
                    *w = b.get_u32_le();
                }
                Self::UserStatsExt(words)
            }
            TlvTag::PpduEndStatusDone => Self::PpduEndStatusDone,
            TlvTag::Dummy => Self::Dummy,
            TlvTag::PhyHtSig => {
                need(b, 5, "PHYRX_HT_SIG")?;
                Self::HtSig(HtSig {
                    mcs: b.get_u8(),
                    bw: b.get_u8(),
                    sgi: b.get_u8(),
                    ldpc: b.get_u8() != 0,
                    stbc: b.get_u8() != 0,
                })
            }
            TlvTag::PhyLSigA => {
                need(b, 1, "PHYRX_L_SIG_A")?;
                Self::LSigA { rate: b.get_u8() }
            }
            TlvTag::PhyLSigB => {
                need(b, 1, "PHYRX_L_SIG_B")?;
                Self::LSigB { rate: b.get_u8() }
            }
            TlvTag::PhyVhtSigA => {
                need(b, 8, "PHYRX_VHT_SIG_A")?;
                Self::VhtSigA(VhtSigA {
                    bw: b.get_u8(),
                    sgi: b.get_u8(),
                    mcs: b.get_u8(),
                    nss: b.get_u8(),
                    stbc: b.get_u8() != 0,
                    ldpc: b.get_u8() != 0,
                    group_id: b.get_u8(),
                    beamformed: b.get_u8() != 0,
                })
            }
            TlvTag::PhyHeSigASu => {
                need(b, 8, "PHYRX_HE_SIG_A_SU")?;
                Self::HeSigASu(HeSigASu {
                    mcs: b.get_u8(),
                    bw: b.get_u8(),
                    nss: b.get_u8(),
                    gi: b.get_u8(),
                    ltf_size: b.get_u8(),
                    dcm: b.get_u8() != 0,
                    stbc: b.get_u8() != 0,
                    ldpc: b.get_u8() != 0,
                })
            }
            TlvTag::PhyHeSigAMuDl => {
                need(b, 6, "PHYRX_HE_SIG_A_MU_DL")?;
                Self::HeSigAMuDl(HeSigAMuDl {
                    bw: b.get_u8(),
                    gi: b.get_u8(),
                    ltf_size: b.get_u8(),
                    dcm: b.get_u8() != 0,
                    stbc: b.get_u8() != 0,
                    ldpc: b.get_u8() != 0,
                })
            }
            TlvTag::PhyHeSigB1Mu => {
                need(b, 2, "PHYRX_HE_SIG_B1_MU")?;
                Self::HeSigB1Mu {
                    ru_allocation: b.get_u16_le(),
                }
            }
            TlvTag::PhyHeSigB2Mu | TlvTag::PhyHeSigB2Ofdma => {
                need(b, 4, "PHYRX_HE_SIG_B2")?;
                let sig = HeSigB2 {
                    mcs: b.get_u8(),
                    nss: b.get_u8(),
                    coding: b.get_u8(),
                    extra: b.get_u8(),
                };
                if hdr.tag == TlvTag::PhyHeSigB2Mu {
                    Self::HeSigB2Mu(sig)
                } else {
                    Self::HeSigB2Ofdma(sig)
                }
            }
            TlvTag::PhyRssiLegacy => {
                need(b, 4, "PHYRX_RSSI_LEGACY")?;
                let rssi_comb = b.get_u8();
                let bw = b.get_u8();
                let reception_type = b.get_u8();
                let num_chains = b.get_u8().min(MAX_CHAINS as u8);
                let mut chains = [[RSSI_INVALID; MAX_BW]; MAX_CHAINS];
                for chain in chains.iter_mut().take(num_chains as usize) {
                    for entry in chain.iter_mut() {
                        if !b.has_remaining() {
                            break;
                        }
                        let raw = b.get_u8();
                        if raw != RSSI_RAW_INVALID {
                            *entry = raw as i8;
                        }
                    }
                }
                Self::RssiLegacy(RssiLegacy {
                    rssi_comb,
                    bw,
                    reception_type,
                    num_chains,
                    chains,
                })
            }
            TlvTag::RxHeader => {
                need(b, 4, "RX_HEADER")?;
                if body.len() < hdr.len as usize {
                    return Err(RxMonError::Parse(format!(
                        "RX_HEADER truncated: {} of {} bytes",
                        body.len(),
                        hdr.len
                    )));
                }
                Self::RxHeader {
                    phy_ppdu_id: b.get_u32_le(),
                    payload: PayloadLoc {
                        offset: body_offset,
                        len: hdr.len as usize,
                    },
                }
            }
            TlvTag::MpduStart => {
                need(b, 18, "RX_MPDU_START")?;
                let ppdu_id = b.get_u32_le();
                let sw_peer_id = b.get_u16_le();
                let frame_control = b.get_u16_le();
                let mpdu_length = b.get_u16_le();
                let flags = b.get_u8();
                let sw_frame_group_id = b.get_u8();
                let mut mac_addr2 = [0u8; 6];
                b.copy_to_slice(&mut mac_addr2);
                Self::MpduStart(MpduStart {
                    ppdu_id,
                    sw_peer_id,
                    frame_control,
                    mpdu_length,
                    fc_valid: flag(flags, 0),
                    to_ds: flag(flags, 1),
                    mac_addr2_valid: flag(flags, 2),
                    mcast_bcast: flag(flags, 3),
                    sw_frame_group_id,
                    mac_addr2,
                })
            }
            TlvTag::MpduEnd => {
                need(b, 4, "RX_MPDU_END")?;
                Self::MpduEnd {
                    fcs_err: b.get_u32_le() & 1 != 0,
                }
            }
            TlvTag::MsduEnd => {
                need(b, 11, "RX_MSDU_END")?;
                let flow_idx = b.get_u32_le();
                let fse_metadata = b.get_u32_le();
                let cce_metadata = b.get_u16_le();
                let flags = b.get_u8();
                Self::MsduEnd(MsduEnd {
                    flow_idx,
                    fse_metadata,
                    cce_metadata,
                    flow_idx_timeout: flag(flags, 0),
                    flow_idx_invalid: flag(flags, 1),
                    first_msdu: flag(flags, 2),
                    last_msdu: flag(flags, 3),
                })
            }
            TlvTag::RxResponseRequiredInfo => {
                need(b, 7, "RX_RESPONSE_REQUIRED_INFO")?;
                let mut addr = [0u8; 6];
                b.copy_to_slice(&mut addr);
                Self::ResponseRequired(ResponseInfo {
                    addr,
                    resp_type: b.get_u8(),
                })
            }
            TlvTag::Unknown(tag) => Self::Unknown(tag),
        };
        Ok(tlv)
    }

    /// Fold this record into the running aggregate.
    pub fn apply(&self, user_id: u8, ppdu: &mut PpduInfo, diag: &mut ParseDiag) -> TlvStatus {
        let user = user_id as usize;
        match self {
            Self::StatusBufferDone => TlvStatus::PpduNotDone,
            Self::Empty => TlvStatus::BufDone,
            Self::PpduStart(start) => {
                let prev = ppdu.com_info.ppdu_id;
                if ppdu.rx_state != RxState::Idle {
                    warn!(
                        "PPDU {} started while PPDU {} still open, discarding partial state",
                        start.ppdu_id, prev
                    );
                    diag.start_mid_ppdu += 1;
                }
                if prev != INVALID_PPDU_ID && prev == start.ppdu_id {
                    warn!("Matching ppdu_id {} detected", start.ppdu_id);
                    diag.dup_ppdu_id += 1;
                }
                ppdu.reset_for_start();
                ppdu.com_info.last_ppdu_id = prev;
                ppdu.com_info.ppdu_id = start.ppdu_id;
                ppdu.com_info.ppdu_timestamp = start.timestamp;
                ppdu.rx_status.chan_num = start.chan_num;
                ppdu.rx_status.chan_freq = start.chan_freq;
                ppdu.rx_state = RxState::Started;
                TlvStatus::PpduNotDone
            }
            Self::PpduEnd(end) => {
                ppdu.com_info.ppdu_end_timestamp = end.end_timestamp;
                ppdu.rx_state = RxState::Ended;
                TlvStatus::PpduNotDone
            }
            Self::RxpcuPpduEndInfo(info) => {
                ppdu.rx_status.rx_antenna = info.rx_antenna;
                ppdu.rx_status.tsft = info.tsft;
                ppdu.rx_status.duration = info.duration;
                TlvStatus::PpduNotDone
            }
            Self::UserStats(stats) => {
                if user >= ppdu.max_users {
                    debug!("user index {} beyond {} users, skipped", user, ppdu.max_users);
                    diag.user_idx_skipped += 1;
                    return TlvStatus::PpduNotDone;
                }
                ppdu.apply_user_stats(user, stats);
                TlvStatus::PpduNotDone
            }
            Self::UserStatsExt(words) => {
                if user >= ppdu.max_users {
                    diag.user_idx_skipped += 1;
                    return TlvStatus::PpduNotDone;
                }
                ppdu.user_status[user].mpdu_fcs_ok_bitmap[2..].copy_from_slice(words);
                TlvStatus::PpduNotDone
            }
            Self::PpduEndStatusDone => {
                ppdu.rx_state = RxState::Idle;
                TlvStatus::PpduDone
            }
            Self::Dummy => TlvStatus::BufDone,
            Self::HtSig(sig) => {
                let rx = &mut ppdu.rx_status;
                rx.preamble_type = Preamble::Dot11N;
                rx.mcs = sig.mcs & 0x7;
                rx.nss = (sig.mcs >> 3) + 1;
                rx.bw = sig.bw;
                rx.sgi = sig.sgi;
                rx.ldpc = sig.ldpc;
                rx.is_stbc = sig.stbc;
                rx.reception_type = ReceptionType::Su;
                TlvStatus::PpduNotDone
            }
            Self::LSigA { rate } => {
                let rx = &mut ppdu.rx_status;
                rx.preamble_type = Preamble::Dot11A;
                rx.mcs = (*rate).min(7);
                rx.nss = 1;
                rx.bw = 0;
                rx.reception_type = ReceptionType::Su;
                TlvStatus::PpduNotDone
            }
            Self::LSigB { rate } => {
                let rx = &mut ppdu.rx_status;
                rx.preamble_type = Preamble::Dot11B;
                rx.mcs = (*rate).min(3);
                rx.nss = 1;
                rx.bw = 0;
                rx.reception_type = ReceptionType::Su;
                TlvStatus::PpduNotDone
            }
            Self::VhtSigA(sig) => {
                let rx = &mut ppdu.rx_status;
                rx.preamble_type = Preamble::Dot11Ac;
                rx.bw = sig.bw;
                rx.sgi = sig.sgi;
                rx.mcs = sig.mcs;
                rx.nss = sig.nss;
                rx.is_stbc = sig.stbc;
                rx.ldpc = sig.ldpc;
                rx.beamformed = sig.beamformed;
                rx.group_id = sig.group_id;
                // Group ids 0 and 63 address a single user.
                rx.reception_type = if sig.group_id == 0 || sig.group_id == 63 {
                    ReceptionType::Su
                } else {
                    ReceptionType::MuMimo
                };
                TlvStatus::PpduNotDone
            }
            Self::HeSigASu(sig) => {
                let rx = &mut ppdu.rx_status;
                rx.preamble_type = Preamble::Dot11Ax;
                rx.mcs = sig.mcs;
                rx.bw = sig.bw;
                rx.nss = sig.nss;
                rx.sgi = sig.gi;
                rx.ltf_size = sig.ltf_size;
                rx.dcm = sig.dcm;
                rx.is_stbc = sig.stbc;
                rx.ldpc = sig.ldpc;
                rx.reception_type = ReceptionType::Su;
                TlvStatus::PpduNotDone
            }
            Self::HeSigAMuDl(sig) => {
                let rx = &mut ppdu.rx_status;
                rx.preamble_type = Preamble::Dot11Ax;
                rx.bw = sig.bw;
                rx.sgi = sig.gi;
                rx.ltf_size = sig.ltf_size;
                rx.dcm = sig.dcm;
                rx.is_stbc = sig.stbc;
                rx.ldpc = sig.ldpc;
                rx.reception_type = ReceptionType::MuMimo;
                TlvStatus::PpduNotDone
            }
            Self::HeSigB1Mu { ru_allocation } => {
                ppdu.rx_status.ru_allocation = *ru_allocation;
                TlvStatus::PpduNotDone
            }
            Self::HeSigB2Mu(sig) | Self::HeSigB2Ofdma(sig) => {
                let rx = &mut ppdu.rx_status;
                rx.mcs = sig.mcs;
                rx.nss = sig.nss;
                rx.ldpc = sig.coding != 0;
                if matches!(self, Self::HeSigB2Ofdma(_)) {
                    rx.dcm = sig.extra != 0;
                    rx.reception_type = ReceptionType::MuOfdma;
                } else {
                    rx.reception_type = ReceptionType::MuMimo;
                }
                if user < ppdu.max_users {
                    ppdu.user_status[user].mcs = sig.mcs;
                    ppdu.user_status[user].nss = sig.nss;
                } else {
                    diag.user_idx_skipped += 1;
                }
                TlvStatus::PpduNotDone
            }
            Self::RssiLegacy(rssi) => {
                let rx = &mut ppdu.rx_status;
                rx.rssi_comb = rssi.rssi_comb;
                rx.rssi_chain = rssi.chains;
                for (pri20, chain) in rx.rssi.iter_mut().zip(rssi.chains.iter()) {
                    *pri20 = chain[0];
                }
                TlvStatus::PpduNotDone
            }
            Self::RxHeader { payload, .. } => {
                ppdu.record_rx_header(user_id, *payload, diag);
                TlvStatus::Header
            }
            Self::MpduStart(mpdu) => {
                ppdu.apply_mpdu_start(mpdu);
                TlvStatus::PpduNotDone
            }
            Self::MpduEnd { fcs_err } => {
                ppdu.fcs_err = *fcs_err;
                TlvStatus::MpduEnd
            }
            Self::MsduEnd(msdu) => {
                if user < ppdu.max_users {
                    ppdu.msdu_info[user] = MsduFlowInfo {
                        flow_idx: msdu.flow_idx,
                        fse_metadata: msdu.fse_metadata,
                        cce_metadata: msdu.cce_metadata,
                        flow_idx_timeout: msdu.flow_idx_timeout,
                        flow_idx_invalid: msdu.flow_idx_invalid,
                        first_msdu: msdu.first_msdu,
                        last_msdu: msdu.last_msdu,
                    };
                } else {
                    diag.user_idx_skipped += 1;
                }
                TlvStatus::MsduEnd
            }
            Self::ResponseRequired(info) => {
                ppdu.response = Some(*info);
                ppdu.rx_state = RxState::Idle;
                TlvStatus::PpduNonStdDone
            }
            Self::Unknown(tag) => {
                debug!("unhandled status TLV tag {}", tag);
                diag.unhandled_tlv += 1;
                TlvStatus::PpduNotDone
            }
        }
    }

    fn tag(&self) -> TlvTag {
        match self {
            Self::StatusBufferDone => TlvTag::StatusBufferDone,
            Self::PpduStart(_) => TlvTag::PpduStart,
            Self::PpduEnd(_) => TlvTag::PpduEnd,
            Self::RxpcuPpduEndInfo(_) => TlvTag::RxpcuPpduEndInfo,
            Self::UserStats(_) => TlvTag::PpduEndUserStats,
            Self::UserStatsExt(_) => TlvTag::PpduEndUserStatsExt,
            Self::PpduEndStatusDone => TlvTag::PpduEndStatusDone,
            Self::Dummy => TlvTag::Dummy,
            Self::HtSig(_) => TlvTag::PhyHtSig,
            Self::LSigA { .. } => TlvTag::PhyLSigA,
            Self::LSigB { .. } => TlvTag::PhyLSigB,
            Self::VhtSigA(_) => TlvTag::PhyVhtSigA,
            Self::HeSigASu(_) => TlvTag::PhyHeSigASu,
            Self::HeSigAMuDl(_) => TlvTag::PhyHeSigAMuDl,
            Self::HeSigB1Mu { .. } => TlvTag::PhyHeSigB1Mu,
            Self::HeSigB2Mu(_) => TlvTag::PhyHeSigB2Mu,
            Self::HeSigB2Ofdma(_) => TlvTag::PhyHeSigB2Ofdma,
            Self::RssiLegacy(_) => TlvTag::PhyRssiLegacy,
            Self::RxHeader { .. } => TlvTag::RxHeader,
            Self::MpduStart(_) => TlvTag::MpduStart,
            Self::MpduEnd { .. } => TlvTag::MpduEnd,
            Self::MsduEnd(_) => TlvTag::MsduEnd,
            Self::ResponseRequired(_) => TlvTag::RxResponseRequiredInfo,
            Self::Empty => TlvTag::Empty,
            Self::Unknown(tag) => TlvTag::Unknown(*tag),
        }
    }

    /// Serialize the record body. RX headers carry captured frame bytes and
    /// go through [`TlvWriter::rx_header`] instead.
    fn encode_body(&self, out: &mut BytesMut) -> Result<()> {
        match self {
            Self::StatusBufferDone
            | Self::PpduEndStatusDone
            | Self::Dummy
            | Self::Empty
            | Self::Unknown(_) => {}
            Self::PpduStart(s) => {
                out.put_u32_le(s.ppdu_id);
                out.put_u16_le(s.chan_num);
                out.put_u16_le(s.chan_freq);
                out.put_u64_le(s.timestamp);
            }
            Self::PpduEnd(e) => put_ppdu_end(e, out),
            Self::RxpcuPpduEndInfo(i) => {
                out.put_u32_le(i.rx_antenna);
                out.put_u64_le(i.tsft);
                out.put_u32_le(i.duration);
            }
            Self::UserStats(u) => {
                out.put_u16_le(u.ast_index);
                out.put_u16_le(u.sw_peer_id);
                out.put_u16_le(u.mpdu_cnt_fcs_ok);
                out.put_u16_le(u.mpdu_cnt_fcs_err);
                out.put_u8(u.tid);
                out.put_u8(
                    u.frame_control_valid as u8
                        | (u.data_seq_ctrl_valid as u8) << 1
                        | (u.monitor_direct_used as u8) << 2,
                );
                out.put_u16_le(u.frame_control);
                out.put_u16_le(u.first_data_seq_ctrl);
                out.put_u16_le(u.tcp_msdu_count);
                out.put_u16_le(u.udp_msdu_count);
                out.put_u16_le(u.other_msdu_count);
                out.put_u32_le(u.mpdu_ok_byte_count);
                out.put_u32_le(u.mpdu_err_byte_count);
                out.put_u32_le(u.mu_ul_word0);
                out.put_u32_le(u.mu_ul_word1);
                out.put_u32_le(0);
            }
            Self::UserStatsExt(words) => {
                for w in words {
                    out.put_u32_le(*w);
                }
            }
            Self::HtSig(s) => {
                out.put_slice(&[s.mcs, s.bw, s.sgi, s.ldpc as u8, s.stbc as u8]);
            }
            Self::LSigA { rate } | Self::LSigB { rate } => out.put_u8(*rate),
            Self::VhtSigA(s) => out.put_slice(&[
                s.bw,
                s.sgi,
                s.mcs,
                s.nss,
                s.stbc as u8,
                s.ldpc as u8,
                s.group_id,
                s.beamformed as u8,
            ]),
            Self::HeSigASu(s) => out.put_slice(&[
                s.mcs,
                s.bw,
                s.nss,
                s.gi,
                s.ltf_size,
                s.dcm as u8,
                s.stbc as u8,
                s.ldpc as u8,
            ]),
            Self::HeSigAMuDl(s) => out.put_slice(&[
                s.bw,
                s.gi,
                s.ltf_size,
                s.dcm as u8,
                s.stbc as u8,
                s.ldpc as u8,
            ]),
            Self::HeSigB1Mu { ru_allocation } => out.put_u16_le(*ru_allocation),
            Self::HeSigB2Mu(s) | Self::HeSigB2Ofdma(s) => {
                out.put_slice(&[s.mcs, s.nss, s.coding, s.extra])
            }
            Self::RssiLegacy(r) => {
                out.put_slice(&[r.rssi_comb, r.bw, r.reception_type, r.num_chains]);
                for chain in r.chains.iter().take(r.num_chains as usize) {
                    for v in chain {
                        out.put_i8(*v);
                    }
                }
            }
            Self::RxHeader { .. } => {
                return Err(RxMonError::InvalidParameter(
                    "RX_HEADER records are written with TlvWriter::rx_header".to_string(),
                ))
            }
            Self::MpduStart(m) => {
                out.put_u32_le(m.ppdu_id);
                out.put_u16_le(m.sw_peer_id);
                out.put_u16_le(m.frame_control);
                out.put_u16_le(m.mpdu_length);
                out.put_u8(
                    m.fc_valid as u8
                        | (m.to_ds as u8) << 1
                        | (m.mac_addr2_valid as u8) << 2
                        | (m.mcast_bcast as u8) << 3,
                );
                out.put_u8(m.sw_frame_group_id);
                out.put_slice(&m.mac_addr2);
            }
            Self::MpduEnd { fcs_err } => out.put_u32_le(*fcs_err as u32),
            Self::MsduEnd(m) => {
                out.put_u32_le(m.flow_idx);
                out.put_u32_le(m.fse_metadata);
                out.put_u16_le(m.cce_metadata);
                out.put_u8(
                    m.flow_idx_timeout as u8
                        | (m.flow_idx_invalid as u8) << 1
                        | (m.first_msdu as u8) << 2
                        | (m.last_msdu as u8) << 3,
                );
            }
            Self::ResponseRequired(r) => {
                out.put_slice(&r.addr);
                out.put_u8(r.resp_type);
            }
        }
        Ok(())
    }
}

/// Builds status buffer contents the way the hardware lays them out.
/// Used by the software ring model, the replay tool and tests.
#[derive(Debug, Clone)]
pub struct TlvWriter {
    mode: TlvHeaderMode,
    buf: BytesMut,
}

/// Fixed PPDU_END body, padded to [`PPDU_END_FIXED_LEN`].
fn put_ppdu_end(end: &PpduEnd, out: &mut BytesMut) {
    out.put_u64_le(end.end_timestamp);
    out.put_u32_le(end.phy_flags);
    out.put_u32_le(0);
}

impl TlvWriter {
    /// Start a buffer without the done marker (hardware still writing).
    pub fn new(mode: TlvHeaderMode) -> Self {
        Self {
            mode,
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Start a completed buffer: the done marker comes first.
    pub fn done(mode: TlvHeaderMode) -> Self {
        let mut writer = Self::new(mode);
        writer.raw(TlvTag::StatusBufferDone, 0, &[]);
        writer
    }

    pub fn push(&mut self, user_id: u8, tlv: &StatusTlv) -> Result<&mut Self> {
        let mut body = BytesMut::with_capacity(64);
        tlv.encode_body(&mut body)?;
        Ok(self.raw(tlv.tag(), user_id, &body))
    }

    /// Capture record: phy ppdu id followed by the 802.11 header bytes.
    pub fn rx_header(&mut self, user_id: u8, phy_ppdu_id: u32, frame: &[u8]) -> &mut Self {
        let mut body = BytesMut::with_capacity(4 + frame.len());
        body.put_u32_le(phy_ppdu_id);
        body.put_slice(frame);
        self.raw(TlvTag::RxHeader, user_id, &body)
    }

    /// PPDU_END whose declared length spans the records that follow it.
    pub fn ppdu_end(&mut self, end: PpduEnd, nested_len: usize) -> &mut Self {
        let mut body = BytesMut::with_capacity(PPDU_END_FIXED_LEN);
        put_ppdu_end(&end, &mut body);
        let declared = (PPDU_END_FIXED_LEN + nested_len) as u16;
        TlvHeader::new(TlvTag::PpduEnd, declared, 0).encode(&mut self.buf, self.mode);
        self.buf.put_slice(&body);
        self
    }

    pub fn raw(&mut self, tag: TlvTag, user_id: u8, body: &[u8]) -> &mut Self {
        TlvHeader::new(tag, body.len() as u16, user_id).encode(&mut self.buf, self.mode);
        self.buf.put_slice(body);
        let padded = self.mode.align_up(body.len());
        self.buf.put_bytes(0, padded - body.len());
        self
    }

    /// Length of a record once framed, for sizing a PPDU_END span.
    pub fn framed_len(&self, body_len: usize) -> usize {
        self.mode.header_len() + self.mode.align_up(body_len)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> BytesMut {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ppdu::PpduInfo;

    fn decode_one(bytes: &[u8], mode: TlvHeaderMode) -> (TlvHeader, StatusTlv) {
        let hdr = TlvHeader::decode(bytes, mode).unwrap();
        let start = mode.header_len();
        let end = (start + hdr.len as usize).min(bytes.len());
        let tlv = StatusTlv::decode(&hdr, &bytes[start..end], start).unwrap();
        (hdr, tlv)
    }

    #[test]
    fn test_tag_conversion() {
        assert_eq!(TlvTag::from(7), TlvTag::PpduEndStatusDone);
        assert_eq!(u16::from(TlvTag::RxHeader), 20);
        assert_eq!(TlvTag::from(300), TlvTag::Unknown(300));
        assert_eq!(u16::from(TlvTag::Unknown(300)), 300);
    }

    #[test]
    fn test_header_fields() {
        let mut out = BytesMut::new();
        TlvHeader::new(TlvTag::PpduEndUserStats, 40, 5).encode(&mut out, TlvHeaderMode::Word32);
        assert_eq!(out.len(), 4);
        let hdr = TlvHeader::decode(&out, TlvHeaderMode::Word32).unwrap();
        assert_eq!(hdr.tag, TlvTag::PpduEndUserStats);
        assert_eq!(hdr.len, 40);
        assert_eq!(hdr.user_id, 5);

        let mut wide = BytesMut::new();
        TlvHeader::new(TlvTag::Dummy, 0, 0).encode(&mut wide, TlvHeaderMode::Word64);
        assert_eq!(wide.len(), 8);
        assert!(TlvHeader::decode(&wide[..4], TlvHeaderMode::Word64).is_none());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(TlvHeaderMode::Word32.align_up(5), 8);
        assert_eq!(TlvHeaderMode::Word32.align_up(8), 8);
        assert_eq!(TlvHeaderMode::Word64.align_up(5), 8);
        assert_eq!(TlvHeaderMode::Word64.align_up(9), 16);
        assert_eq!(TlvHeaderMode::Word64.align_up(0), 0);
    }

    #[test]
    fn test_status_done_marker() {
        let done = TlvWriter::done(TlvHeaderMode::Word32).finish();
        assert!(is_status_done(&done, TlvHeaderMode::Word32));
        assert!(!is_status_done(&[0u8; 16], TlvHeaderMode::Word32));
        assert!(!is_status_done(&[], TlvHeaderMode::Word32));
    }

    #[test]
    fn test_short_body_rejected() {
        let hdr = TlvHeader::new(TlvTag::PpduStart, 16, 0);
        let err = StatusTlv::decode(&hdr, &[0u8; 6], 4).unwrap_err();
        assert!(matches!(err, RxMonError::Parse(_)));
    }

    #[test]
    fn test_rssi_missing_chains_are_invalid() {
        let mut body = vec![60u8, 1, 0, 2];
        body.extend_from_slice(&[0xD0, 0xD2, 0x80, 0xD4]);
        body.extend_from_slice(&[0xC8, 0xC9]);
        let hdr = TlvHeader::new(TlvTag::PhyRssiLegacy, body.len() as u16, 0);
        let tlv = StatusTlv::decode(&hdr, &body, 4).unwrap();
        let StatusTlv::RssiLegacy(rssi) = tlv else {
            panic!("expected RSSI record");
        };
        assert_eq!(rssi.chains[0], [-48, -46, RSSI_INVALID, -44]);
        // Second chain was cut short by the body length.
        assert_eq!(rssi.chains[1], [-56, -55, RSSI_INVALID, RSSI_INVALID]);
        assert_eq!(rssi.chains[2], [RSSI_INVALID; MAX_BW]);

        let mut ppdu = PpduInfo::new(4);
        let mut diag = ParseDiag::default();
        StatusTlv::RssiLegacy(rssi).apply(0, &mut ppdu, &mut diag);
        assert_eq!(ppdu.rx_status.rssi_comb, 60);
        assert_eq!(ppdu.rx_status.rssi[0], -48);
        assert_eq!(ppdu.rx_status.rssi[3], RSSI_INVALID);
    }

    #[test]
    fn test_user_stats_decode_and_skip() {
        let stats = UserStats {
            ast_index: 12,
            sw_peer_id: 3,
            mpdu_cnt_fcs_ok: 4,
            mpdu_cnt_fcs_err: 1,
            tid: 5,
            frame_control_valid: true,
            frame_control: 0x0888,
            ..Default::default()
        };
        let mut w = TlvWriter::new(TlvHeaderMode::Word32);
        w.push(2, &StatusTlv::UserStats(stats)).unwrap();
        let bytes = w.finish();
        assert_eq!(bytes.len(), 44);
        let (hdr, tlv) = decode_one(&bytes, TlvHeaderMode::Word32);
        assert_eq!(hdr.user_id, 2);
        assert_eq!(tlv, StatusTlv::UserStats(stats));

        let mut ppdu = PpduInfo::new(2);
        let mut diag = ParseDiag::default();
        assert_eq!(tlv.apply(2, &mut ppdu, &mut diag), TlvStatus::PpduNotDone);
        assert_eq!(diag.user_idx_skipped, 1);
        assert_eq!(ppdu.com_info.num_users, 0);

        tlv.apply(1, &mut ppdu, &mut diag);
        assert_eq!(ppdu.com_info.num_users, 1);
        assert_eq!(ppdu.com_info.mpdu_cnt_fcs_ok, 4);
        assert_eq!(ppdu.user_status[1].ast_index, 12);
    }

    #[test]
    fn test_ppdu_start_detects_duplicates() {
        let mut ppdu = PpduInfo::new(4);
        let mut diag = ParseDiag::default();
        let start = StatusTlv::PpduStart(PpduStart {
            ppdu_id: 77,
            chan_num: 36,
            chan_freq: 5180,
            timestamp: 1000,
        });
        start.apply(0, &mut ppdu, &mut diag);
        assert_eq!(ppdu.com_info.ppdu_id, 77);
        assert_eq!(ppdu.com_info.last_ppdu_id, INVALID_PPDU_ID);
        assert_eq!(ppdu.rx_state, RxState::Started);

        // Second START without a DONE in between, same id.
        start.apply(0, &mut ppdu, &mut diag);
        assert_eq!(diag.start_mid_ppdu, 1);
        assert_eq!(diag.dup_ppdu_id, 1);
        assert_eq!(ppdu.com_info.last_ppdu_id, 77);
    }

    #[test]
    fn test_done_variants() {
        let mut ppdu = PpduInfo::new(4);
        let mut diag = ParseDiag::default();
        assert_eq!(
            StatusTlv::PpduEndStatusDone.apply(0, &mut ppdu, &mut diag),
            TlvStatus::PpduDone
        );
        assert_eq!(StatusTlv::Dummy.apply(0, &mut ppdu, &mut diag), TlvStatus::BufDone);
        assert_eq!(StatusTlv::Empty.apply(0, &mut ppdu, &mut diag), TlvStatus::BufDone);
        let resp = StatusTlv::ResponseRequired(ResponseInfo {
            addr: [2, 0, 0, 0, 0, 1],
            resp_type: 1,
        });
        assert_eq!(resp.apply(0, &mut ppdu, &mut diag), TlvStatus::PpduNonStdDone);
        assert!(ppdu.response.is_some());
        assert_eq!(
            StatusTlv::Unknown(99).apply(0, &mut ppdu, &mut diag),
            TlvStatus::PpduNotDone
        );
        assert_eq!(diag.unhandled_tlv, 1);
    }

    #[test]
    fn test_vht_group_id_sets_reception_type() {
        let mut ppdu = PpduInfo::new(4);
        let mut diag = ParseDiag::default();
        let mut sig = VhtSigA {
            bw: 2,
            mcs: 7,
            nss: 2,
            group_id: 63,
            ..Default::default()
        };
        StatusTlv::VhtSigA(sig).apply(0, &mut ppdu, &mut diag);
        assert_eq!(ppdu.rx_status.reception_type, ReceptionType::Su);
        sig.group_id = 5;
        StatusTlv::VhtSigA(sig).apply(0, &mut ppdu, &mut diag);
        assert_eq!(ppdu.rx_status.reception_type, ReceptionType::MuMimo);
        assert_eq!(ppdu.rx_status.preamble_type, Preamble::Dot11Ac);
    }

    #[test]
    fn test_rx_header_location() {
        let mut w = TlvWriter::done(TlvHeaderMode::Word32);
        w.rx_header(0, 9, &[0x08, 0x01, 0, 0, 1, 2, 3]);
        let bytes = w.finish();
        let hdr = TlvHeader::decode(&bytes[4..], TlvHeaderMode::Word32).unwrap();
        assert_eq!(hdr.tag, TlvTag::RxHeader);
        assert_eq!(hdr.len, 11);
        let tlv = StatusTlv::decode(&hdr, &bytes[8..8 + 11], 8).unwrap();
        assert_eq!(
            tlv,
            StatusTlv::RxHeader {
                payload: PayloadLoc { offset: 8, len: 11 },
                phy_ppdu_id: 9,
            }
        );
        // Body padded to the next word.
        assert_eq!(bytes.len(), 8 + 12);
    }

    #[test]
    fn test_ppdu_end_span_header() {
        let mode = TlvHeaderMode::Word32;
        let end = PpduEnd {
            end_timestamp: 0x1122_3344_5566,
            phy_flags: 3,
        };
        let mut w = TlvWriter::new(mode);
        w.ppdu_end(end, 24);
        let bytes = w.finish();
        assert_eq!(bytes.len(), mode.header_len() + PPDU_END_FIXED_LEN);

        let hdr = TlvHeader::decode(&bytes, mode).unwrap();
        assert_eq!(hdr.tag, TlvTag::PpduEnd);
        assert_eq!(hdr.len as usize, PPDU_END_FIXED_LEN + 24);
        let body = &bytes[mode.header_len()..];
        let tlv = StatusTlv::decode(&hdr, body, mode.header_len()).unwrap();
        assert_eq!(tlv, StatusTlv::PpduEnd(end));
    }

    #[test]
    fn test_rx_header_rejected_by_push() {
        let mut w = TlvWriter::new(TlvHeaderMode::Word32);
        let tlv = StatusTlv::RxHeader {
            payload: PayloadLoc { offset: 0, len: 0 },
            phy_ppdu_id: 0,
        };
        assert!(w.push(0, &tlv).is_err());
    }
}
