//! PPDU aggregate and TLV parse loop
//!
//! A PPDU's status may span several status buffers, so the aggregate lives
//! in the pipeline across calls and is only reset when the next PPDU_START
//! arrives.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::tlv::{
    MpduStart, StatusTlv, TlvHeader, TlvHeaderMode, TlvStatus, TlvTag, UserStats, PPDU_END_FIXED_LEN,
};
use crate::{
    INVALID_AST_INDEX, INVALID_PEER_ID, INVALID_PPDU_ID, MAX_MPDU_HDR_PER_STATUS_BUFFER,
    MAX_MU_USERS, RSSI_INVALID,
};

/// Receive chains tracked per PPDU
pub const MAX_CHAINS: usize = 8;
/// Bandwidth slots per chain (20/40/80/160 MHz)
pub const MAX_BW: usize = 4;
/// Words in a per-user fcs-ok bitmap
pub const FCS_OK_BITMAP_WORDS: usize = 8;
pub const TID_INVALID: u8 = 31;

// UL MU user info, word 0
const MU_UL_W0_VALID: u32 = 0x1;
const MU_UL_W0_VER_SHIFT: u32 = 1;
const MU_UL_W0_VER_MASK: u32 = 0x3;
// UL MU user info, word 1
const MU_UL_W1_MCS_MASK: u32 = 0xF;
const MU_UL_W1_NSS_SHIFT: u32 = 4;
const MU_UL_W1_NSS_MASK: u32 = 0x7;
const MU_UL_W1_RU_START_SHIFT: u32 = 7;
const MU_UL_W1_RU_START_MASK: u32 = 0xFF;
const MU_UL_W1_RU_SIZE_SHIFT: u32 = 15;
const MU_UL_W1_RU_SIZE_MASK: u32 = 0x7;

/// Number of RU size classes (26 .. 996x2 tones)
pub const OFDMA_NUM_RU_SIZE: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Preamble {
    #[default]
    Dot11A = 0,
    Dot11B = 1,
    Dot11N = 2,
    Dot11Ac = 3,
    Dot11Ax = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReceptionType {
    #[default]
    Su = 0,
    MuMimo = 1,
    MuOfdma = 2,
    MuOfdmaMimo = 3,
}

impl ReceptionType {
    pub fn is_mu(self) -> bool {
        matches!(self, Self::MuMimo | Self::MuOfdma | Self::MuOfdmaMimo)
    }
}

/// Where the hardware is within one PPDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RxState {
    #[default]
    Idle,
    Started,
    Ended,
}

/// Per-radio PPDU status as seen by the fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PpduStatus {
    #[default]
    Start,
    Done,
}

/// Location of captured bytes inside the status buffer being parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PayloadLoc {
    pub offset: usize,
    pub len: usize,
}

/// Peer that solicited a response frame (non-standard completion).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseInfo {
    pub addr: [u8; 6],
    pub resp_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsduFlowInfo {
    pub flow_idx: u32,
    pub fse_metadata: u32,
    pub cce_metadata: u16,
    pub flow_idx_timeout: bool,
    pub flow_idx_invalid: bool,
    pub first_msdu: bool,
    pub last_msdu: bool,
}

/// Parse-side diagnostic counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseDiag {
    pub dup_ppdu_id: u64,
    pub start_mid_ppdu: u64,
    pub user_idx_skipped: u64,
    pub mpdu_hdr_overflow: u64,
    pub tlv_decode_err: u64,
    pub unhandled_tlv: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTypeCounts {
    pub mgmt: u32,
    pub ctrl: u32,
    pub data: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonInfo {
    pub ppdu_id: u32,
    pub last_ppdu_id: u32,
    pub ppdu_timestamp: u64,
    pub ppdu_end_timestamp: u64,
    pub mpdu_cnt_fcs_ok: u32,
    pub mpdu_cnt_fcs_err: u32,
    /// RX headers seen in the current status buffer
    pub mpdu_cnt: u32,
    pub num_users: u32,
    pub frame_types: FrameTypeCounts,
}

impl Default for CommonInfo {
    fn default() -> Self {
        Self {
            ppdu_id: INVALID_PPDU_ID,
            last_ppdu_id: INVALID_PPDU_ID,
            ppdu_timestamp: 0,
            ppdu_end_timestamp: 0,
            mpdu_cnt_fcs_ok: 0,
            mpdu_cnt_fcs_err: 0,
            mpdu_cnt: 0,
            num_users: 0,
            frame_types: FrameTypeCounts::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxStatus {
    pub chan_num: u16,
    pub chan_freq: u16,
    pub tsft: u64,
    pub duration: u32,
    pub rx_antenna: u32,
    pub bw: u8,
    pub sgi: u8,
    pub ldpc: bool,
    pub is_stbc: bool,
    pub beamformed: bool,
    pub dcm: bool,
    pub ltf_size: u8,
    pub group_id: u8,
    pub ru_allocation: u16,
    pub mcs: u8,
    pub nss: u8,
    pub preamble_type: Preamble,
    pub reception_type: ReceptionType,
    pub rssi_comb: u8,
    /// Primary 20 MHz RSSI per chain
    pub rssi: [i8; MAX_CHAINS],
    pub rssi_chain: [[i8; MAX_BW]; MAX_CHAINS],
    pub ast_index: u16,
    pub tid: u8,
    pub frame_control_info_valid: bool,
    pub frame_control: u16,
    pub first_data_seq_ctrl: u16,
    pub tcp_msdu_count: u16,
    pub udp_msdu_count: u16,
    pub other_msdu_count: u16,
    pub mcast_bcast: bool,
    pub sw_frame_group_id: u8,
    pub monitor_direct_used: bool,
}

impl Default for RxStatus {
    fn default() -> Self {
        Self {
            chan_num: 0,
            chan_freq: 0,
            tsft: 0,
            duration: 0,
            rx_antenna: 0,
            bw: 0,
            sgi: 0,
            ldpc: false,
            is_stbc: false,
            beamformed: false,
            dcm: false,
            ltf_size: 0,
            group_id: 0,
            ru_allocation: 0,
            mcs: 0,
            nss: 0,
            preamble_type: Preamble::default(),
            reception_type: ReceptionType::default(),
            rssi_comb: 0,
            rssi: [RSSI_INVALID; MAX_CHAINS],
            rssi_chain: [[RSSI_INVALID; MAX_BW]; MAX_CHAINS],
            ast_index: INVALID_AST_INDEX,
            tid: TID_INVALID,
            frame_control_info_valid: false,
            frame_control: 0,
            first_data_seq_ctrl: 0,
            tcp_msdu_count: 0,
            udp_msdu_count: 0,
            other_msdu_count: 0,
            mcast_bcast: false,
            sw_frame_group_id: 0,
            monitor_direct_used: false,
        }
    }
}

/// Per-user record of one PPDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStatus {
    pub populated: bool,
    pub ast_index: u16,
    pub sw_peer_id: u16,
    pub tid: u8,
    pub mcs: u8,
    pub nss: u8,
    pub frame_control_info_valid: bool,
    pub frame_control: u16,
    pub first_data_seq_ctrl: u16,
    pub tcp_msdu_count: u16,
    pub udp_msdu_count: u16,
    pub other_msdu_count: u16,
    pub mpdu_cnt_fcs_ok: u32,
    pub mpdu_cnt_fcs_err: u32,
    pub mpdu_ok_byte_count: u32,
    pub mpdu_err_byte_count: u32,
    pub mpdu_fcs_ok_bitmap: [u32; FCS_OK_BITMAP_WORDS],
    pub mu_ul_word0: u32,
    pub mu_ul_word1: u32,
    pub mu_ul_info_valid: bool,
    pub ofdma_ru_start_index: u32,
    pub ofdma_ru_size: u32,
    pub ofdma_ru_width: u32,
}

impl Default for UserStatus {
    fn default() -> Self {
        Self {
            populated: false,
            ast_index: INVALID_AST_INDEX,
            sw_peer_id: INVALID_PEER_ID,
            tid: TID_INVALID,
            mcs: 0,
            nss: 0,
            frame_control_info_valid: false,
            frame_control: 0,
            first_data_seq_ctrl: 0,
            tcp_msdu_count: 0,
            udp_msdu_count: 0,
            other_msdu_count: 0,
            mpdu_cnt_fcs_ok: 0,
            mpdu_cnt_fcs_err: 0,
            mpdu_ok_byte_count: 0,
            mpdu_err_byte_count: 0,
            mpdu_fcs_ok_bitmap: [0; FCS_OK_BITMAP_WORDS],
            mu_ul_word0: 0,
            mu_ul_word1: 0,
            mu_ul_info_valid: false,
            ofdma_ru_start_index: 0,
            ofdma_ru_size: 0,
            ofdma_ru_width: 0,
        }
    }
}

impl UserStatus {
    pub fn num_msdu(&self) -> u32 {
        self.tcp_msdu_count as u32 + self.udp_msdu_count as u32 + self.other_msdu_count as u32
    }
}

/// Neighbour (non-associated client) information from MPDU_START
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NacInfo {
    pub fc_valid: bool,
    pub to_ds: bool,
    pub frame_control: u16,
    pub mac_addr2_valid: bool,
    pub mac_addr2: [u8; 6],
}

/// Running aggregate for the PPDU currently being received
#[derive(Debug, Clone)]
pub struct PpduInfo {
    /// Configured user limit, at most [`MAX_MU_USERS`]
    pub max_users: usize,
    pub com_info: CommonInfo,
    pub rx_status: RxStatus,
    pub user_status: [UserStatus; MAX_MU_USERS],
    pub msdu_info: [MsduFlowInfo; MAX_MU_USERS],
    pub nac_info: NacInfo,
    /// First captured header, used for header-only delivery
    pub first_msdu: Option<PayloadLoc>,
    /// Captured headers indexed by the fcs-ok count at capture time
    pub msdu_payloads: [Option<PayloadLoc>; MAX_MPDU_HDR_PER_STATUS_BUFFER],
    pub fcs_ok_cnt: usize,
    pub fcs_err_cnt: usize,
    pub is_fcs_passed: bool,
    pub fcs_err: bool,
    pub last_user_id: u8,
    pub response: Option<ResponseInfo>,
    pub rx_state: RxState,
}

impl PpduInfo {
    pub fn new(max_users: usize) -> Self {
        Self {
            max_users: max_users.min(MAX_MU_USERS),
            com_info: CommonInfo::default(),
            rx_status: RxStatus::default(),
            user_status: [UserStatus::default(); MAX_MU_USERS],
            msdu_info: [MsduFlowInfo::default(); MAX_MU_USERS],
            nac_info: NacInfo::default(),
            first_msdu: None,
            msdu_payloads: [None; MAX_MPDU_HDR_PER_STATUS_BUFFER],
            fcs_ok_cnt: 0,
            fcs_err_cnt: 0,
            is_fcs_passed: false,
            fcs_err: false,
            last_user_id: 0,
            response: None,
            rx_state: RxState::Idle,
        }
    }

    /// Clear everything except the configured limit.
    pub fn reset_for_start(&mut self) {
        *self = Self::new(self.max_users);
    }

    pub fn apply_user_stats(&mut self, user: usize, stats: &UserStats) {
        let u = &mut self.user_status[user];
        u.populated = true;
        u.ast_index = stats.ast_index;
        u.sw_peer_id = stats.sw_peer_id;
        u.tid = stats.tid;
        u.frame_control_info_valid = stats.frame_control_valid;
        u.frame_control = stats.frame_control;
        u.first_data_seq_ctrl = stats.first_data_seq_ctrl;
        u.tcp_msdu_count = stats.tcp_msdu_count;
        u.udp_msdu_count = stats.udp_msdu_count;
        u.other_msdu_count = stats.other_msdu_count;
        u.mpdu_cnt_fcs_ok = stats.mpdu_cnt_fcs_ok as u32;
        u.mpdu_cnt_fcs_err = stats.mpdu_cnt_fcs_err as u32;
        u.mpdu_ok_byte_count = stats.mpdu_ok_byte_count;
        u.mpdu_err_byte_count = stats.mpdu_err_byte_count;
        u.mu_ul_word0 = stats.mu_ul_word0;
        u.mu_ul_word1 = stats.mu_ul_word1;

        // PPDU-level view follows the last user reported.
        let rx = &mut self.rx_status;
        rx.ast_index = stats.ast_index;
        rx.tid = stats.tid;
        rx.tcp_msdu_count = stats.tcp_msdu_count;
        rx.udp_msdu_count = stats.udp_msdu_count;
        rx.other_msdu_count = stats.other_msdu_count;
        if stats.frame_control_valid {
            rx.frame_control_info_valid = true;
            rx.frame_control = stats.frame_control;
        }
        if stats.data_seq_ctrl_valid {
            rx.first_data_seq_ctrl = stats.first_data_seq_ctrl;
        }
        if stats.monitor_direct_used {
            rx.monitor_direct_used = true;
        }

        self.com_info.mpdu_cnt_fcs_ok += stats.mpdu_cnt_fcs_ok as u32;
        self.com_info.mpdu_cnt_fcs_err += stats.mpdu_cnt_fcs_err as u32;
        self.com_info.num_users += 1;
        self.last_user_id = user as u8;
    }

    pub fn apply_mpdu_start(&mut self, mpdu: &MpduStart) {
        self.nac_info = NacInfo {
            fc_valid: mpdu.fc_valid,
            to_ds: mpdu.to_ds,
            frame_control: mpdu.frame_control,
            mac_addr2_valid: mpdu.mac_addr2_valid,
            mac_addr2: mpdu.mac_addr2,
        };
        self.rx_status.mcast_bcast = mpdu.mcast_bcast;
        self.rx_status.sw_frame_group_id = mpdu.sw_frame_group_id;
        if mpdu.fc_valid {
            self.rx_status.frame_control_info_valid = true;
            self.rx_status.frame_control = mpdu.frame_control;
            let types = &mut self.com_info.frame_types;
            match frame_type(mpdu.frame_control) {
                FC_TYPE_MGMT => types.mgmt += 1,
                FC_TYPE_CTRL => types.ctrl += 1,
                FC_TYPE_DATA => types.data += 1,
                _ => {}
            }
        }
    }

    pub fn record_rx_header(&mut self, user_id: u8, loc: PayloadLoc, diag: &mut ParseDiag) {
        self.com_info.mpdu_cnt += 1;
        self.last_user_id = user_id;
        if self.first_msdu.is_none() {
            self.first_msdu = Some(loc);
        }
        match self.msdu_payloads.get_mut(self.fcs_ok_cnt) {
            Some(slot) => *slot = Some(loc),
            None => diag.mpdu_hdr_overflow += 1,
        }
    }

    /// Fcs bookkeeping for first-good-frame capture. The fcs verdict arrives
    /// in MPDU_END; if its header landed in the previous status buffer,
    /// `mpdu_cnt` is already zero and the verdict is parked in
    /// `is_fcs_passed` instead.
    pub fn track_mpdu_end(&mut self) {
        if !self.fcs_err {
            if self.fcs_ok_cnt > MAX_MPDU_HDR_PER_STATUS_BUFFER {
                debug!("{} fcs-ok MPDUs in one status buffer", self.fcs_ok_cnt);
                return;
            }
            if self.com_info.mpdu_cnt > 0 {
                self.fcs_ok_cnt += 1;
            } else {
                self.is_fcs_passed = true;
            }
        } else if self.com_info.mpdu_cnt > 0 {
            self.fcs_err_cnt += 1;
        } else {
            self.is_fcs_passed = false;
        }
    }

    /// Forget per-buffer capture state once a buffer has been consumed.
    pub fn clear_capture_state(&mut self) {
        self.fcs_ok_cnt = 0;
        self.fcs_err_cnt = 0;
        self.com_info.mpdu_cnt = 0;
        self.first_msdu = None;
        self.msdu_payloads = [None; MAX_MPDU_HDR_PER_STATUS_BUFFER];
    }

    /// Users to walk at completion time.
    pub fn active_users(&self) -> usize {
        (self.com_info.num_users as usize).min(self.max_users)
    }

    /// Fcs ok/err totals summed over the populated per-user records.
    pub fn user_fcs_totals(&self) -> (u32, u32) {
        self.user_status
            .iter()
            .filter(|u| u.populated)
            .fold((0, 0), |(ok, err), u| {
                (ok + u.mpdu_cnt_fcs_ok, err + u.mpdu_cnt_fcs_err)
            })
    }

    /// Per-user fcs counts must add up to the common totals.
    pub fn fcs_totals_consistent(&self) -> bool {
        let (ok, err) = self.user_fcs_totals();
        ok + err == self.com_info.mpdu_cnt_fcs_ok + self.com_info.mpdu_cnt_fcs_err
    }

    /// Decode UL MU user info into mcs/nss/RU placement for MU receptions.
    pub fn resolve_mu_ul_info(&mut self) {
        if !self.rx_status.reception_type.is_mu() {
            return;
        }
        let users = self.active_users();
        for user in self.user_status.iter_mut().take(users) {
            let w0 = user.mu_ul_word0;
            let w1 = user.mu_ul_word1;
            let version = (w0 >> MU_UL_W0_VER_SHIFT) & MU_UL_W0_VER_MASK;
            if w0 & MU_UL_W0_VALID == 0 || version != 0 {
                continue;
            }
            user.mcs = (w1 & MU_UL_W1_MCS_MASK) as u8;
            user.nss = (((w1 >> MU_UL_W1_NSS_SHIFT) & MU_UL_W1_NSS_MASK) + 1) as u8;
            user.mu_ul_info_valid = true;
            user.ofdma_ru_start_index = (w1 >> MU_UL_W1_RU_START_SHIFT) & MU_UL_W1_RU_START_MASK;
            user.ofdma_ru_size = (w1 >> MU_UL_W1_RU_SIZE_SHIFT) & MU_UL_W1_RU_SIZE_MASK;
            user.ofdma_ru_width = ru_size_to_width(user.ofdma_ru_size);
        }
    }
}

/// RU size class to width in 26-tone units; 0 for an unknown class.
pub fn ru_size_to_width(ru_size: u32) -> u32 {
    match ru_size {
        0 => 1,
        1 => 2,
        2 => 4,
        3 => 9,
        4 => 18,
        5 => 37,
        6 => 74,
        other => {
            debug!("RU size {} has no width", other);
            0
        }
    }
}

pub const FC_TYPE_MGMT: u8 = 0;
pub const FC_TYPE_CTRL: u8 = 1;
pub const FC_TYPE_DATA: u8 = 2;

/// 802.11 frame type from a little-endian frame-control field.
pub fn frame_type(frame_control: u16) -> u8 {
    ((frame_control >> 2) & 0x3) as u8
}

/// Data frames of any subtype.
pub fn is_data_frame(frame_control: u16) -> bool {
    frame_type(frame_control) == FC_TYPE_DATA
}

/// Walks the records of one status buffer.
#[derive(Debug, Clone, Copy)]
pub struct TlvParser {
    mode: TlvHeaderMode,
    track_mcopy_fcs: bool,
}

impl TlvParser {
    pub fn new(mode: TlvHeaderMode, track_mcopy_fcs: bool) -> Self {
        Self {
            mode,
            track_mcopy_fcs,
        }
    }

    /// Apply records until one ends the walk or the buffer runs out, and
    /// return the status of the last record applied.
    pub fn parse_buffer(&self, data: &[u8], ppdu: &mut PpduInfo, diag: &mut ParseDiag) -> TlvStatus {
        let hdr_len = self.mode.header_len();
        let mut pos = 0;
        let mut status = TlvStatus::PpduNotDone;

        while pos < data.len() {
            let Some(hdr) = TlvHeader::decode(&data[pos..], self.mode) else {
                break;
            };
            let body_start = pos + hdr_len;
            let (body_len, advance) = if hdr.tag == TlvTag::PpduEnd {
                (PPDU_END_FIXED_LEN, hdr_len + PPDU_END_FIXED_LEN)
            } else {
                (hdr.len as usize, hdr_len + self.mode.align_up(hdr.len as usize))
            };
            let body_end = (body_start + body_len).min(data.len());

            status = match StatusTlv::decode(&hdr, &data[body_start..body_end], body_start) {
                Ok(tlv) => tlv.apply(hdr.user_id, ppdu, diag),
                Err(e) => {
                    debug!("dropping status TLV {:?} at offset {}: {}", hdr.tag, pos, e);
                    diag.tlv_decode_err += 1;
                    TlvStatus::PpduNotDone
                }
            };

            if self.track_mcopy_fcs && status == TlvStatus::MpduEnd {
                ppdu.track_mpdu_end();
            }

            pos += advance;
            if !status.continues() {
                break;
            }
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::{PpduEnd, PpduStart, StatusTlv, TlvWriter};

    const MODE: TlvHeaderMode = TlvHeaderMode::Word32;

    fn start(id: u32) -> StatusTlv {
        StatusTlv::PpduStart(PpduStart {
            ppdu_id: id,
            chan_num: 6,
            chan_freq: 2437,
            timestamp: 42,
        })
    }

    fn user(ok: u16, err: u16) -> StatusTlv {
        StatusTlv::UserStats(UserStats {
            ast_index: 1,
            sw_peer_id: 1,
            mpdu_cnt_fcs_ok: ok,
            mpdu_cnt_fcs_err: err,
            ..Default::default()
        })
    }

    #[test]
    fn test_parse_stops_at_done() {
        let mut w = TlvWriter::done(MODE);
        w.push(0, &start(10)).unwrap();
        w.push(0, &user(3, 1)).unwrap();
        w.push(0, &StatusTlv::PpduEndStatusDone).unwrap();
        // Never reached: the walk ends at DONE.
        w.push(0, &start(11)).unwrap();
        let data = w.finish();

        let parser = TlvParser::new(MODE, false);
        let mut ppdu = PpduInfo::new(4);
        let mut diag = ParseDiag::default();
        let status = parser.parse_buffer(&data, &mut ppdu, &mut diag);
        assert_eq!(status, TlvStatus::PpduDone);
        assert_eq!(ppdu.com_info.ppdu_id, 10);
        assert_eq!(ppdu.com_info.mpdu_cnt_fcs_ok, 3);
        assert!(ppdu.fcs_totals_consistent());
    }

    #[test]
    fn test_ppdu_spans_buffers() {
        let parser = TlvParser::new(MODE, false);
        let mut ppdu = PpduInfo::new(4);
        let mut diag = ParseDiag::default();

        let mut first = TlvWriter::done(MODE);
        first.push(0, &start(5)).unwrap();
        first.push(0, &user(2, 0)).unwrap();
        let first = first.finish();
        assert_eq!(
            parser.parse_buffer(&first, &mut ppdu, &mut diag),
            TlvStatus::PpduNotDone
        );

        let mut second = TlvWriter::done(MODE);
        second.push(1, &user(1, 1)).unwrap();
        second.push(0, &StatusTlv::PpduEndStatusDone).unwrap();
        let second = second.finish();
        assert_eq!(
            parser.parse_buffer(&second, &mut ppdu, &mut diag),
            TlvStatus::PpduDone
        );
        assert_eq!(ppdu.com_info.ppdu_id, 5);
        assert_eq!(ppdu.com_info.num_users, 2);
        assert_eq!(ppdu.user_fcs_totals(), (3, 1));
    }

    #[test]
    fn test_next_start_clears_previous_ppdu() {
        let parser = TlvParser::new(MODE, false);
        let mut ppdu = PpduInfo::new(4);
        let mut diag = ParseDiag::default();

        let mut w = TlvWriter::done(MODE);
        w.push(0, &start(5)).unwrap();
        w.push(0, &user(2, 0)).unwrap();
        w.push(1, &user(1, 1)).unwrap();
        w.push(0, &StatusTlv::PpduEndStatusDone).unwrap();
        let status = parser.parse_buffer(&w.finish(), &mut ppdu, &mut diag);
        assert_eq!(status, TlvStatus::PpduDone);
        assert_eq!(ppdu.com_info.num_users, 2);

        let mut w = TlvWriter::done(MODE);
        w.push(0, &start(6)).unwrap();
        w.push(0, &user(1, 0)).unwrap();
        w.push(0, &StatusTlv::PpduEndStatusDone).unwrap();
        let status = parser.parse_buffer(&w.finish(), &mut ppdu, &mut diag);
        assert_eq!(status, TlvStatus::PpduDone);

        assert_eq!(ppdu.com_info.ppdu_id, 6);
        assert_eq!(ppdu.com_info.last_ppdu_id, 5);
        assert_eq!(ppdu.com_info.num_users, 1);
        assert_eq!(ppdu.com_info.mpdu_cnt_fcs_ok, 1);
        assert_eq!(ppdu.com_info.mpdu_cnt_fcs_err, 0);
        assert_eq!(ppdu.user_fcs_totals(), (1, 0));
        assert!(!ppdu.user_status[1].populated);
        assert_eq!(ppdu.user_status[1].mpdu_cnt_fcs_err, 0);
        assert!(ppdu.fcs_totals_consistent());
        assert_eq!(diag.start_mid_ppdu, 0);
        assert_eq!(diag.dup_ppdu_id, 0);
    }

    #[test]
    fn test_ppdu_end_skips_fixed_part_only() {
        let mut w = TlvWriter::done(MODE);
        w.push(0, &start(1)).unwrap();
        let nested = w.framed_len(40);
        w.ppdu_end(
            PpduEnd {
                end_timestamp: 99,
                phy_flags: 0,
            },
            nested,
        );
        w.push(0, &user(4, 0)).unwrap();
        w.push(0, &StatusTlv::PpduEndStatusDone).unwrap();
        let data = w.finish();

        let mut ppdu = PpduInfo::new(4);
        let mut diag = ParseDiag::default();
        let status = TlvParser::new(MODE, false).parse_buffer(&data, &mut ppdu, &mut diag);
        assert_eq!(status, TlvStatus::PpduDone);
        assert_eq!(ppdu.com_info.ppdu_end_timestamp, 99);
        // The nested user record was parsed, not skipped.
        assert_eq!(ppdu.com_info.mpdu_cnt_fcs_ok, 4);
        assert_eq!(diag, ParseDiag::default());
    }

    #[test]
    fn test_word64_headers() {
        let mode = TlvHeaderMode::Word64;
        let mut w = TlvWriter::done(mode);
        w.push(0, &start(3)).unwrap();
        w.push(0, &StatusTlv::LSigA { rate: 3 }).unwrap();
        w.push(0, &StatusTlv::PpduEndStatusDone).unwrap();
        let data = w.finish();
        assert_eq!(data.len() % 8, 0);

        let mut ppdu = PpduInfo::new(4);
        let mut diag = ParseDiag::default();
        let status = TlvParser::new(mode, false).parse_buffer(&data, &mut ppdu, &mut diag);
        assert_eq!(status, TlvStatus::PpduDone);
        assert_eq!(ppdu.rx_status.preamble_type, Preamble::Dot11A);
        assert_eq!(ppdu.rx_status.mcs, 3);
    }

    #[test]
    fn test_zero_tail_ends_buffer() {
        let mut w = TlvWriter::done(MODE);
        w.push(0, &start(8)).unwrap();
        let mut data = w.finish().to_vec();
        data.resize(256, 0);

        let mut ppdu = PpduInfo::new(4);
        let mut diag = ParseDiag::default();
        let status = TlvParser::new(MODE, false).parse_buffer(&data, &mut ppdu, &mut diag);
        assert_eq!(status, TlvStatus::BufDone);
        assert_eq!(ppdu.rx_state, RxState::Started);
    }

    #[test]
    fn test_fcs_tracking_across_buffers() {
        let parser = TlvParser::new(MODE, true);
        let mut ppdu = PpduInfo::new(4);
        let mut diag = ParseDiag::default();

        let mut first = TlvWriter::done(MODE);
        first.push(0, &start(2)).unwrap();
        first.rx_header(0, 2, &[0x08, 0x00, 0, 0]);
        first.push(0, &StatusTlv::MpduEnd { fcs_err: false }).unwrap();
        first.rx_header(0, 2, &[0x08, 0x00, 0, 0]);
        parser.parse_buffer(&first.finish(), &mut ppdu, &mut diag);
        assert_eq!(ppdu.fcs_ok_cnt, 1);
        assert_eq!(ppdu.com_info.mpdu_cnt, 2);
        assert!(ppdu.msdu_payloads[1].is_some());

        // The buffer is consumed; the second header's verdict comes next.
        ppdu.clear_capture_state();
        let mut second = TlvWriter::done(MODE);
        second.push(0, &StatusTlv::MpduEnd { fcs_err: false }).unwrap();
        parser.parse_buffer(&second.finish(), &mut ppdu, &mut diag);
        assert!(ppdu.is_fcs_passed);
        assert_eq!(ppdu.fcs_ok_cnt, 0);
    }

    #[test]
    fn test_mu_ul_width_resolution() {
        let mut ppdu = PpduInfo::new(4);
        ppdu.rx_status.reception_type = ReceptionType::MuOfdma;
        ppdu.com_info.num_users = 2;
        // valid, version 0; mcs 9, nss field 1 (two streams), start 4, RU-106
        ppdu.user_status[0].mu_ul_word0 = 1;
        ppdu.user_status[0].mu_ul_word1 = 9 | (1 << 4) | (4 << 7) | (2 << 15);
        // version 1 is ignored
        ppdu.user_status[1].mu_ul_word0 = 1 | (1 << 1);
        ppdu.resolve_mu_ul_info();

        let u0 = &ppdu.user_status[0];
        assert!(u0.mu_ul_info_valid);
        assert_eq!(u0.mcs, 9);
        assert_eq!(u0.nss, 2);
        assert_eq!(u0.ofdma_ru_start_index, 4);
        assert_eq!(u0.ofdma_ru_width, 4);
        assert!(!ppdu.user_status[1].mu_ul_info_valid);
    }

    #[test]
    fn test_ru_width_map() {
        let widths: Vec<u32> = (0..8).map(ru_size_to_width).collect();
        assert_eq!(widths, vec![1, 2, 4, 9, 18, 37, 74, 0]);
    }

    #[test]
    fn test_fcs_mismatch_detected() {
        let mut ppdu = PpduInfo::new(4);
        let mut diag = ParseDiag::default();
        user(2, 0).apply(0, &mut ppdu, &mut diag);
        assert!(ppdu.fcs_totals_consistent());
        // Same user reported twice: record overwritten, totals doubled.
        user(2, 0).apply(0, &mut ppdu, &mut diag);
        assert!(!ppdu.fcs_totals_consistent());
    }

    #[test]
    fn test_frame_type_helpers() {
        assert_eq!(frame_type(0x0080), FC_TYPE_MGMT);
        assert_eq!(frame_type(0x00d4), FC_TYPE_CTRL);
        assert!(is_data_frame(0x0088));
    }
}
