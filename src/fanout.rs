//! Consumer dispatch
//!
//! After a status buffer has been parsed, [`ConsumerFanout`] decides who
//! gets it. Every buffer passes the packet-log tap and then receives
//! exactly one [`Disposition`]. Buffers that close a PPDU additionally
//! drive statistics, neighbour tracking and the downstream trigger.

use bytes::Bytes;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::buffer::FilledBuffer;
use crate::config::{ChannelConfig, ConsumerConfig, EnhCaptureMode, McopyMode, MonitorConfig, PktlogMode};
use crate::peer::{NeighbourTable, PeerTable};
use crate::ppdu::{frame_type, PpduInfo, PpduStatus, FC_TYPE_DATA};
use crate::stats::{PeerRxStats, RxPpduIndication, StatsAggregator};
use crate::tlv::TlvStatus;
use crate::INVALID_PEER_ID;

/// Offset of the 802.11 header inside an RX_HEADER body.
const RX_HEADER_FRAME_OFFSET: usize = 4;

/// What happened to a status buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// The captured 802.11 header went to the monitor interface.
    HeaderOnly,
    /// Fcs-ok frames went to the m-copy consumer.
    FirstGoodFrame,
    /// Enhanced capture kept the buffer.
    Retained,
    Freed,
}

/// Packet-log tap event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PktlogEvent {
    pub lite: bool,
    pub peer_id: u16,
    pub data: Bytes,
}

/// Frame delivered in m-copy mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McopyFrame {
    pub ppdu_id: u32,
    /// 802.11 header onwards
    pub frame: Bytes,
}

/// Consumers of the monitor status path. Every method defaults to a no-op
/// so implementors only wire what they enable.
pub trait MonitorSinks: Send {
    fn pktlog(&mut self, _event: PktlogEvent) {}

    fn deliver_header_only(&mut self, _ppdu_id: u32, _header: Bytes) {}

    fn deliver_mcopy(&mut self, _frame: McopyFrame) {}

    /// Offer a buffer to enhanced capture. Returning `None` keeps it.
    fn enh_capture(&mut self, buffer: FilledBuffer, _ppdu: &PpduInfo) -> Option<FilledBuffer> {
        Some(buffer)
    }

    fn enh_capture_ppdu_done(&mut self, _ppdu: &PpduInfo) {}

    /// A response-required PPDU ended without a regular done marker.
    fn deliver_non_std(&mut self, _ppdu: &PpduInfo) {}

    fn ppdu_indication(&mut self, _indication: &RxPpduIndication) {}

    fn peer_stats(&mut self, _stats: &PeerRxStats) {}
}

/// Sinks that discard everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSinks;

impl MonitorSinks for NullSinks {}

/// Downstream destination-ring processing, kicked once per completed PPDU.
pub trait DestRing: Send {
    fn trigger(&mut self, ppdu: &PpduInfo);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullDestRing;

impl DestRing for NullDestRing {
    fn trigger(&mut self, _ppdu: &PpduInfo) {}
}

/// Counters kept for the scan special interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanVapStats {
    pub rx_ok_pkts: u64,
    pub rx_ok_bytes: u64,
    pub rx_err_pkts: u64,
    pub rx_err_bytes: u64,
    pub rx_mgmt_pkts: u64,
    pub rx_ctrl_pkts: u64,
    pub rx_data_pkts: u64,
}

/// Fan-out counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutStats {
    pub buffers: u64,
    pub status_ppdu_done: u64,
    pub ppdu_invariant_err: u64,
    pub non_std_delivered: u64,
    pub pktlog_sent: u64,
    pub pktlog_filtered: u64,
    pub header_only: u64,
    pub header_only_missing: u64,
    pub mcopy_delivered: u64,
    pub mcopy_dup_skipped: u64,
    pub mcopy_non_data_skipped: u64,
    pub mcopy_deferred: u64,
    pub retained: u64,
    pub freed: u64,
    pub stats_no_fcs_ok: u64,
    pub ppdu_indications: u64,
    pub neighbour_rssi_updated: u64,
    pub chan_num_fallback: u64,
    pub chan_freq_fallback: u64,
    pub dest_triggered: u64,
    pub scan_vap: ScanVapStats,
}

/// Collaborators the fan-out reports to
pub struct FanoutEnv<'a> {
    pub sinks: &'a mut dyn MonitorSinks,
    pub dest: &'a mut dyn DestRing,
    pub peers: &'a dyn PeerTable,
    pub stats: &'a mut StatsAggregator,
}

#[derive(Debug)]
pub struct ConsumerFanout {
    consumers: ConsumerConfig,
    channel: ChannelConfig,
    neighbours: NeighbourTable,
    ppdu_status: PpduStatus,
    /// Frame whose fcs verdict is expected in the next buffer
    mcopy_pending: Option<Bytes>,
    mcopy_last_ppdu_id: u32,
    stats: FanoutStats,
}

impl ConsumerFanout {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            consumers: config.consumers.clone(),
            channel: config.channel.clone(),
            neighbours: NeighbourTable::from_macs(&config.neighbour_macs()),
            ppdu_status: PpduStatus::Start,
            mcopy_pending: None,
            mcopy_last_ppdu_id: crate::INVALID_PPDU_ID,
            stats: FanoutStats::default(),
        }
    }

    pub fn get_stats(&self) -> &FanoutStats {
        &self.stats
    }

    pub fn ppdu_status(&self) -> PpduStatus {
        self.ppdu_status
    }

    pub fn neighbours(&self) -> &NeighbourTable {
        &self.neighbours
    }

    pub fn neighbours_mut(&mut self) -> &mut NeighbourTable {
        &mut self.neighbours
    }

    /// Whether any enabled consumer needs the TLVs decoded.
    pub fn needs_parse(&self) -> bool {
        self.consumers.monitor_vdev
            || self.consumers.enhanced_stats
            || self.consumers.mcopy != McopyMode::Disabled
            || self.consumers.enh_capture != EnhCaptureMode::Disabled
    }

    /// Drop cross-buffer state, e.g. when the radio is reconfigured.
    pub fn reset(&mut self) {
        self.mcopy_pending = None;
        self.mcopy_last_ppdu_id = crate::INVALID_PPDU_ID;
        self.ppdu_status = PpduStatus::Start;
    }

    /// Route one parsed status buffer.
    pub fn process_buffer(
        &mut self,
        buf: FilledBuffer,
        tlv_status: TlvStatus,
        ppdu: &mut PpduInfo,
        env: &mut FanoutEnv<'_>,
    ) -> Disposition {
        self.stats.buffers += 1;
        self.pktlog_tap(&buf, ppdu, env);

        if tlv_status == TlvStatus::PpduDone && !ppdu.fcs_totals_consistent() {
            let (ok, err) = ppdu.user_fcs_totals();
            warn!(
                "PPDU {} user fcs totals {}+{} disagree with common {}+{}, discarding",
                ppdu.com_info.ppdu_id,
                ok,
                err,
                ppdu.com_info.mpdu_cnt_fcs_ok,
                ppdu.com_info.mpdu_cnt_fcs_err
            );
            self.stats.status_ppdu_done += 1;
            self.stats.ppdu_invariant_err += 1;
            self.stats.freed += 1;
            self.mcopy_pending = None;
            ppdu.clear_capture_state();
            self.ppdu_status = PpduStatus::Start;
            return Disposition::Freed;
        }

        let disposition = self.dispose(buf, ppdu, env);
        match disposition {
            Disposition::HeaderOnly => self.stats.header_only += 1,
            Disposition::Retained => self.stats.retained += 1,
            Disposition::Freed => self.stats.freed += 1,
            Disposition::FirstGoodFrame => {}
        }
        ppdu.clear_capture_state();

        match tlv_status {
            TlvStatus::PpduNonStdDone => {
                env.sinks.deliver_non_std(ppdu);
                self.stats.non_std_delivered += 1;
            }
            TlvStatus::PpduDone => self.ppdu_done(ppdu, env),
            _ => {}
        }
        disposition
    }

    fn pktlog_tap(&mut self, buf: &FilledBuffer, ppdu: &PpduInfo, env: &mut FanoutEnv<'_>) {
        let lite = match self.consumers.pktlog {
            PktlogMode::Disabled => return,
            PktlogMode::Full => false,
            PktlogMode::Lite => true,
        };
        let peer_id = if self.consumers.pktlog_peer_filter {
            let peer_id = ppdu
                .user_status
                .get(ppdu.last_user_id as usize)
                .map(|u| u.sw_peer_id)
                .unwrap_or(INVALID_PEER_ID);
            if !env.peers.pktlog_enabled(peer_id) {
                self.stats.pktlog_filtered += 1;
                return;
            }
            peer_id
        } else {
            INVALID_PEER_ID
        };
        env.sinks.pktlog(PktlogEvent {
            lite,
            peer_id,
            data: buf.bytes(),
        });
        self.stats.pktlog_sent += 1;
    }

    fn dispose(&mut self, buf: FilledBuffer, ppdu: &mut PpduInfo, env: &mut FanoutEnv<'_>) -> Disposition {
        if self.consumers.header_only
            && ppdu.rx_status.monitor_direct_used
            && !self.neighbours.is_empty()
            && self.consumers.monitor_vdev
        {
            return self.header_only(&buf, ppdu, env);
        }
        if self.consumers.mcopy != McopyMode::Disabled {
            self.first_good_frame(&buf, ppdu, env);
            return Disposition::FirstGoodFrame;
        }
        if self.consumers.enh_capture != EnhCaptureMode::Disabled {
            return match env.sinks.enh_capture(buf, ppdu) {
                None => Disposition::Retained,
                Some(_) => Disposition::Freed,
            };
        }
        Disposition::Freed
    }

    fn header_only(&mut self, buf: &FilledBuffer, ppdu: &mut PpduInfo, env: &mut FanoutEnv<'_>) -> Disposition {
        let Some(loc) = ppdu.first_msdu.take() else {
            error!("first msdu payload not present in PPDU {}", ppdu.com_info.ppdu_id);
            self.stats.header_only_missing += 1;
            return Disposition::Freed;
        };
        if loc.len <= RX_HEADER_FRAME_OFFSET {
            error!("no header present in PPDU {}", ppdu.com_info.ppdu_id);
            self.stats.header_only_missing += 1;
            return Disposition::Freed;
        }
        let header = buf.slice(loc.offset + RX_HEADER_FRAME_OFFSET..loc.offset + loc.len);
        env.sinks.deliver_header_only(ppdu.com_info.ppdu_id, header);
        ppdu.rx_status.monitor_direct_used = false;
        Disposition::HeaderOnly
    }

    /// Captured frame `idx` of this buffer, or `None` when absent or not a
    /// data frame.
    fn mcopy_frame(&mut self, buf: &FilledBuffer, ppdu: &PpduInfo, idx: usize) -> Option<Bytes> {
        let loc = (*ppdu.msdu_payloads.get(idx)?)?;
        if loc.len <= RX_HEADER_FRAME_OFFSET {
            return None;
        }
        let frame = buf.slice(loc.offset + RX_HEADER_FRAME_OFFSET..loc.offset + loc.len);
        let fc = frame.first().copied()?;
        if frame_type(fc as u16) != FC_TYPE_DATA {
            self.stats.mcopy_non_data_skipped += 1;
            return None;
        }
        Some(frame)
    }

    fn mcopy_is_dup(&self, ppdu_id: u32) -> bool {
        self.consumers.mcopy == McopyMode::Mcopy && self.mcopy_last_ppdu_id == ppdu_id
    }

    fn mcopy_deliver(&mut self, ppdu_id: u32, frame: Bytes, env: &mut FanoutEnv<'_>) {
        self.mcopy_last_ppdu_id = ppdu_id;
        env.sinks.deliver_mcopy(McopyFrame { ppdu_id, frame });
        self.stats.mcopy_delivered += 1;
    }

    fn first_good_frame(&mut self, buf: &FilledBuffer, ppdu: &mut PpduInfo, env: &mut FanoutEnv<'_>) {
        let ppdu_id = ppdu.com_info.ppdu_id;

        // Header cached from the previous buffer; its verdict was parsed
        // from this one.
        if let Some(frame) = self.mcopy_pending.take() {
            if self.mcopy_is_dup(ppdu_id) {
                self.stats.mcopy_dup_skipped += 1;
            } else if ppdu.is_fcs_passed {
                self.mcopy_deliver(ppdu_id, frame, env);
                ppdu.is_fcs_passed = false;
            }
        }

        if ppdu.fcs_ok_cnt + ppdu.fcs_err_cnt != ppdu.com_info.mpdu_cnt as usize {
            if let Some(frame) = self.mcopy_frame(buf, ppdu, ppdu.fcs_ok_cnt) {
                debug!("PPDU {}: header split from its MPDU end, caching", ppdu_id);
                self.mcopy_pending = Some(frame);
                self.stats.mcopy_deferred += 1;
            }
        }

        if ppdu.com_info.mpdu_cnt == 0 || ppdu.fcs_ok_cnt == 0 {
            return;
        }
        let count = match self.consumers.mcopy {
            McopyMode::Mcopy => 1,
            _ => ppdu.fcs_ok_cnt,
        };
        for idx in 0..count {
            if self.mcopy_is_dup(ppdu_id) {
                self.stats.mcopy_dup_skipped += 1;
                break;
            }
            if let Some(frame) = self.mcopy_frame(buf, ppdu, idx) {
                self.mcopy_deliver(ppdu_id, frame, env);
            }
        }
    }

    fn ppdu_done(&mut self, ppdu: &mut PpduInfo, env: &mut FanoutEnv<'_>) {
        self.ppdu_status = PpduStatus::Done;
        self.stats.status_ppdu_done += 1;
        ppdu.resolve_mu_ul_info();

        let mcopy = self.consumers.mcopy != McopyMode::Disabled;
        if self.consumers.enhanced_stats || mcopy || !self.neighbours.is_empty() {
            if ppdu.com_info.mpdu_cnt_fcs_ok == 0 {
                self.stats.stats_no_fcs_ok += 1;
            } else {
                self.update_neighbour_rssi(ppdu, env);
                if self.consumers.enhanced_stats || mcopy {
                    let sinks = &mut *env.sinks;
                    let mut notify = |p: &PeerRxStats| sinks.peer_stats(p);
                    let indication = env.stats.handle_ppdu(ppdu, env.peers, mcopy, &mut notify);
                    if let Some(indication) = indication {
                        sinks.ppdu_indication(&indication);
                        self.stats.ppdu_indications += 1;
                    }
                }
            }
        }

        if self.consumers.enh_capture != EnhCaptureMode::Disabled {
            env.sinks.enh_capture_ppdu_done(ppdu);
        }

        if ppdu.rx_status.chan_num == 0 {
            ppdu.rx_status.chan_num = self.channel.num;
            self.stats.chan_num_fallback += 1;
        }
        if ppdu.rx_status.chan_freq == 0 {
            ppdu.rx_status.chan_freq = self.channel.freq;
            self.stats.chan_freq_fallback += 1;
        }

        if self.consumers.scan_special_vap && self.consumers.monitor_vdev {
            self.update_scan_vap(ppdu);
        }

        if !self.consumers.full_mon_mode {
            env.dest.trigger(ppdu);
            self.stats.dest_triggered += 1;
        }
        self.ppdu_status = PpduStatus::Start;
    }

    fn update_neighbour_rssi(&mut self, ppdu: &PpduInfo, env: &FanoutEnv<'_>) {
        let nac = &ppdu.nac_info;
        if !(nac.fc_valid && nac.to_ds && nac.mac_addr2_valid) {
            debug!(
                "neighbour RSSI not updated: fc_valid={} to_ds={} addr2_valid={}",
                nac.fc_valid, nac.to_ds, nac.mac_addr2_valid
            );
            return;
        }
        let rssi = i8::try_from(ppdu.rx_status.rssi_comb).unwrap_or(i8::MAX);
        if self.neighbours.update_rssi(&nac.mac_addr2, rssi, env.stats.now()) {
            self.stats.neighbour_rssi_updated += 1;
        }
    }

    fn update_scan_vap(&mut self, ppdu: &PpduInfo) {
        let scan = &mut self.stats.scan_vap;
        for user in ppdu.user_status.iter().take(ppdu.active_users()) {
            scan.rx_ok_pkts += user.mpdu_cnt_fcs_ok as u64;
            scan.rx_ok_bytes += user.mpdu_ok_byte_count as u64;
            scan.rx_err_pkts += user.mpdu_cnt_fcs_err as u64;
            scan.rx_err_bytes += user.mpdu_err_byte_count as u64;
        }
        let types = &ppdu.com_info.frame_types;
        scan.rx_mgmt_pkts += types.mgmt as u64;
        scan.rx_ctrl_pkts += types.ctrl as u64;
        scan.rx_data_pkts += types.data as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::StaticPeerTable;
    use crate::ppdu::{ParseDiag, TlvParser};
    use crate::tlv::{MpduStart, PpduStart, StatusTlv, TlvHeaderMode, TlvWriter, UserStats};
    use bytes::BytesMut;

    const MODE: TlvHeaderMode = TlvHeaderMode::Word32;
    const DATA_HDR: [u8; 4] = [0x08, 0x01, 0x00, 0x00];
    const MGMT_HDR: [u8; 4] = [0x80, 0x00, 0x00, 0x00];
    const NEIGHBOUR: [u8; 6] = [0x02, 0, 0, 0, 0, 0x0a];

    #[derive(Default)]
    struct Recorder {
        pktlog: Vec<PktlogEvent>,
        headers: Vec<Bytes>,
        mcopy: Vec<McopyFrame>,
        retain: bool,
        retained: Vec<FilledBuffer>,
        enh_done: usize,
        non_std: usize,
        indications: Vec<RxPpduIndication>,
        peer_updates: usize,
    }

    impl MonitorSinks for Recorder {
        fn pktlog(&mut self, event: PktlogEvent) {
            self.pktlog.push(event);
        }

        fn deliver_header_only(&mut self, _ppdu_id: u32, header: Bytes) {
            self.headers.push(header);
        }

        fn deliver_mcopy(&mut self, frame: McopyFrame) {
            self.mcopy.push(frame);
        }

        fn enh_capture(&mut self, buffer: FilledBuffer, _ppdu: &PpduInfo) -> Option<FilledBuffer> {
            if self.retain {
                self.retained.push(buffer);
                None
            } else {
                Some(buffer)
            }
        }

        fn enh_capture_ppdu_done(&mut self, _ppdu: &PpduInfo) {
            self.enh_done += 1;
        }

        fn deliver_non_std(&mut self, _ppdu: &PpduInfo) {
            self.non_std += 1;
        }

        fn ppdu_indication(&mut self, indication: &RxPpduIndication) {
            self.indications.push(indication.clone());
        }

        fn peer_stats(&mut self, _stats: &PeerRxStats) {
            self.peer_updates += 1;
        }
    }

    #[derive(Default)]
    struct CountingDest {
        triggers: usize,
        last_chan: u16,
    }

    impl DestRing for CountingDest {
        fn trigger(&mut self, ppdu: &PpduInfo) {
            self.triggers += 1;
            self.last_chan = ppdu.rx_status.chan_num;
        }
    }

    struct Harness {
        fanout: ConsumerFanout,
        parser: TlvParser,
        ppdu: PpduInfo,
        diag: ParseDiag,
        sinks: Recorder,
        dest: CountingDest,
        peers: StaticPeerTable,
        stats: StatsAggregator,
    }

    impl Harness {
        fn new(config: MonitorConfig) -> Self {
            let mut peers = StaticPeerTable::new(64);
            peers.add_peer(5, 1, [0x02, 0, 0, 0, 0, 1]);
            Self {
                parser: TlvParser::new(MODE, config.mcopy_enabled()),
                fanout: ConsumerFanout::new(&config),
                ppdu: PpduInfo::new(4),
                diag: ParseDiag::default(),
                sinks: Recorder::default(),
                dest: CountingDest::default(),
                peers,
                stats: StatsAggregator::default(),
            }
        }

        fn feed(&mut self, data: BytesMut) -> Disposition {
            let status = self.parser.parse_buffer(&data, &mut self.ppdu, &mut self.diag);
            let buf = FilledBuffer::new(0x1000, data.freeze());
            let mut env = FanoutEnv {
                sinks: &mut self.sinks,
                dest: &mut self.dest,
                peers: &self.peers,
                stats: &mut self.stats,
            };
            self.fanout.process_buffer(buf, status, &mut self.ppdu, &mut env)
        }
    }

    fn start(id: u32) -> StatusTlv {
        StatusTlv::PpduStart(PpduStart {
            ppdu_id: id,
            chan_num: 36,
            chan_freq: 5180,
            timestamp: 1,
        })
    }

    fn user(ok: u16, err: u16) -> StatusTlv {
        StatusTlv::UserStats(UserStats {
            ast_index: 5,
            sw_peer_id: 1,
            mpdu_cnt_fcs_ok: ok,
            mpdu_cnt_fcs_err: err,
            frame_control_valid: true,
            frame_control: 0x0088,
            udp_msdu_count: ok,
            ..Default::default()
        })
    }

    fn done_ppdu(id: u32, ok: u16) -> BytesMut {
        let mut w = TlvWriter::done(MODE);
        w.push(0, &start(id)).unwrap();
        w.push(0, &user(ok, 0)).unwrap();
        w.push(0, &StatusTlv::PpduEndStatusDone).unwrap();
        w.finish()
    }

    #[test]
    fn test_pktlog_full_and_peer_filter() {
        let mut config = MonitorConfig::default();
        config.consumers.pktlog = PktlogMode::Full;
        let mut h = Harness::new(config.clone());
        h.feed(done_ppdu(1, 1));
        assert_eq!(h.sinks.pktlog.len(), 1);
        assert_eq!(h.sinks.pktlog[0].peer_id, INVALID_PEER_ID);
        assert!(!h.sinks.pktlog[0].lite);

        config.consumers.pktlog = PktlogMode::Lite;
        config.consumers.pktlog_peer_filter = true;
        let mut h = Harness::new(config);
        h.feed(done_ppdu(1, 1));
        assert!(h.sinks.pktlog.is_empty());
        assert_eq!(h.fanout.get_stats().pktlog_filtered, 1);

        h.peers.set_pktlog(1, true);
        h.feed(done_ppdu(2, 1));
        assert_eq!(h.sinks.pktlog.len(), 1);
        assert_eq!(h.sinks.pktlog[0].peer_id, 1);
        assert!(h.sinks.pktlog[0].lite);
    }

    #[test]
    fn test_done_without_fcs_ok() {
        let mut config = MonitorConfig::default();
        config.consumers.enhanced_stats = true;
        let mut h = Harness::new(config);
        let d = h.feed(done_ppdu(9, 0));

        assert_eq!(d, Disposition::Freed);
        assert_eq!(h.fanout.get_stats().status_ppdu_done, 1);
        assert_eq!(h.fanout.get_stats().stats_no_fcs_ok, 1);
        assert!(h.sinks.indications.is_empty());
        assert_eq!(h.sinks.peer_updates, 0);
        assert_eq!(h.dest.triggers, 1);
        assert_eq!(h.fanout.ppdu_status(), PpduStatus::Start);
    }

    #[test]
    fn test_enhanced_stats_indication() {
        let mut config = MonitorConfig::default();
        config.consumers.enhanced_stats = true;
        let mut h = Harness::new(config);
        h.feed(done_ppdu(3, 2));
        assert_eq!(h.sinks.indications.len(), 1);
        assert_eq!(h.sinks.indications[0].peer_id, 1);
        assert_eq!(h.sinks.peer_updates, 1);
        assert_eq!(h.stats.peer(1).unwrap().mpdu_cnt_fcs_ok, 2);
    }

    #[test]
    fn test_invariant_mismatch_discards() {
        let mut config = MonitorConfig::default();
        config.consumers.enhanced_stats = true;
        let mut h = Harness::new(config);
        let mut w = TlvWriter::done(MODE);
        w.push(0, &start(4)).unwrap();
        w.push(0, &user(2, 0)).unwrap();
        w.push(0, &user(1, 0)).unwrap();
        w.push(0, &StatusTlv::PpduEndStatusDone).unwrap();

        assert_eq!(h.feed(w.finish()), Disposition::Freed);
        let stats = h.fanout.get_stats();
        assert_eq!(stats.ppdu_invariant_err, 1);
        assert_eq!(stats.dest_triggered, 0);
        assert!(h.sinks.indications.is_empty());
    }

    #[test]
    fn test_header_only_delivery() {
        let mut config = MonitorConfig::default();
        config.consumers.header_only = true;
        config.consumers.monitor_vdev = true;
        config.consumers.neighbour_peers = vec!["02:00:00:00:00:0a".to_string()];
        let mut h = Harness::new(config);

        let mut w = TlvWriter::done(MODE);
        w.push(0, &start(6)).unwrap();
        w.push(
            0,
            &StatusTlv::UserStats(UserStats {
                monitor_direct_used: true,
                ..Default::default()
            }),
        )
        .unwrap();
        w.rx_header(0, 6, &DATA_HDR);
        assert_eq!(h.feed(w.finish()), Disposition::HeaderOnly);
        assert_eq!(h.sinks.headers, vec![Bytes::from_static(&DATA_HDR)]);
        assert!(!h.ppdu.rx_status.monitor_direct_used);

        // No monitor-direct flag on the next buffer.
        let mut w = TlvWriter::done(MODE);
        w.rx_header(0, 6, &DATA_HDR);
        assert_eq!(h.feed(w.finish()), Disposition::Freed);
    }

    #[test]
    fn test_mcopy_one_frame_per_ppdu() {
        let mut config = MonitorConfig::default();
        config.consumers.mcopy = McopyMode::Mcopy;
        let mut h = Harness::new(config);

        let mut w = TlvWriter::done(MODE);
        w.push(0, &start(10)).unwrap();
        w.rx_header(0, 10, &MGMT_HDR);
        w.push(0, &StatusTlv::MpduEnd { fcs_err: false }).unwrap();
        w.rx_header(0, 10, &DATA_HDR);
        w.push(0, &StatusTlv::MpduEnd { fcs_err: false }).unwrap();
        assert_eq!(h.feed(w.finish()), Disposition::FirstGoodFrame);
        // Only the first fcs-ok frame is considered, and it is management.
        assert!(h.sinks.mcopy.is_empty());
        assert_eq!(h.fanout.get_stats().mcopy_non_data_skipped, 1);

        let mut w = TlvWriter::done(MODE);
        w.rx_header(0, 10, &DATA_HDR);
        w.push(0, &StatusTlv::MpduEnd { fcs_err: false }).unwrap();
        w.rx_header(0, 10, &DATA_HDR);
        w.push(0, &StatusTlv::MpduEnd { fcs_err: false }).unwrap();
        h.feed(w.finish());
        assert_eq!(h.sinks.mcopy.len(), 1);
        assert_eq!(h.sinks.mcopy[0].ppdu_id, 10);
        assert_eq!(&h.sinks.mcopy[0].frame[..], &DATA_HDR);

        // Same PPDU id again: deduplicated.
        let mut w = TlvWriter::done(MODE);
        w.rx_header(0, 10, &DATA_HDR);
        w.push(0, &StatusTlv::MpduEnd { fcs_err: false }).unwrap();
        h.feed(w.finish());
        assert_eq!(h.sinks.mcopy.len(), 1);
        assert_eq!(h.fanout.get_stats().mcopy_dup_skipped, 1);
    }

    #[test]
    fn test_mcopy_extended_all_fcs_ok() {
        let mut config = MonitorConfig::default();
        config.consumers.mcopy = McopyMode::McopyExtended;
        let mut h = Harness::new(config);

        let mut w = TlvWriter::done(MODE);
        w.push(0, &start(11)).unwrap();
        for fcs_err in [false, true, false] {
            w.rx_header(0, 11, &DATA_HDR);
            w.push(0, &StatusTlv::MpduEnd { fcs_err }).unwrap();
        }
        h.feed(w.finish());
        assert_eq!(h.sinks.mcopy.len(), 2);
        assert_eq!(h.ppdu.fcs_ok_cnt, 0);
    }

    #[test]
    fn test_mcopy_header_split_across_buffers() {
        let mut config = MonitorConfig::default();
        config.consumers.mcopy = McopyMode::McopyExtended;
        let mut h = Harness::new(config);

        let mut w = TlvWriter::done(MODE);
        w.push(0, &start(12)).unwrap();
        w.rx_header(0, 12, &DATA_HDR);
        h.feed(w.finish());
        assert!(h.sinks.mcopy.is_empty());
        assert_eq!(h.fanout.get_stats().mcopy_deferred, 1);

        let mut w = TlvWriter::done(MODE);
        w.push(0, &StatusTlv::MpduEnd { fcs_err: false }).unwrap();
        h.feed(w.finish());
        assert_eq!(h.sinks.mcopy.len(), 1);
        assert_eq!(&h.sinks.mcopy[0].frame[..], &DATA_HDR);
        assert!(!h.ppdu.is_fcs_passed);
    }

    #[test]
    fn test_enh_capture_retains() {
        let mut config = MonitorConfig::default();
        config.consumers.enh_capture = EnhCaptureMode::Mpdu;
        let mut h = Harness::new(config);
        h.sinks.retain = true;
        assert_eq!(h.feed(done_ppdu(13, 1)), Disposition::Retained);
        assert_eq!(h.sinks.retained.len(), 1);
        assert_eq!(h.sinks.enh_done, 1);

        h.sinks.retain = false;
        assert_eq!(h.feed(done_ppdu(14, 1)), Disposition::Freed);
        assert_eq!(h.fanout.get_stats().retained, 1);
    }

    #[test]
    fn test_non_std_completion() {
        let mut h = Harness::new(MonitorConfig::default());
        let mut w = TlvWriter::done(MODE);
        w.push(0, &start(15)).unwrap();
        w.push(
            0,
            &StatusTlv::ResponseRequired(crate::ppdu::ResponseInfo {
                addr: [1; 6],
                resp_type: 2,
            }),
        )
        .unwrap();
        h.feed(w.finish());
        assert_eq!(h.sinks.non_std, 1);
        assert_eq!(h.fanout.get_stats().non_std_delivered, 1);
        assert_eq!(h.dest.triggers, 0);
    }

    #[test]
    fn test_channel_fallback_and_full_mon() {
        let mut config = MonitorConfig::default();
        config.channel = ChannelConfig { num: 149, freq: 5745 };
        let mut h = Harness::new(config.clone());
        let mut w = TlvWriter::done(MODE);
        w.push(
            0,
            &StatusTlv::PpduStart(PpduStart {
                ppdu_id: 16,
                ..Default::default()
            }),
        )
        .unwrap();
        w.push(0, &StatusTlv::PpduEndStatusDone).unwrap();
        h.feed(w.finish());
        assert_eq!(h.dest.last_chan, 149);
        assert_eq!(h.ppdu.rx_status.chan_freq, 5745);
        assert_eq!(h.fanout.get_stats().chan_num_fallback, 1);

        config.consumers.full_mon_mode = true;
        let mut h = Harness::new(config);
        h.feed(done_ppdu(17, 1));
        assert_eq!(h.dest.triggers, 0);
        assert_eq!(h.fanout.get_stats().status_ppdu_done, 1);
    }

    #[test]
    fn test_neighbour_rssi_and_scan_vap() {
        let mut config = MonitorConfig::default();
        config.consumers.monitor_vdev = true;
        config.consumers.scan_special_vap = true;
        config.consumers.neighbour_peers = vec!["02:00:00:00:00:0a".to_string()];
        let mut h = Harness::new(config);

        let mut w = TlvWriter::done(MODE);
        w.push(0, &start(18)).unwrap();
        w.push(
            0,
            &StatusTlv::MpduStart(MpduStart {
                fc_valid: true,
                to_ds: true,
                mac_addr2_valid: true,
                frame_control: 0x0108,
                mac_addr2: NEIGHBOUR,
                ..Default::default()
            }),
        )
        .unwrap();
        w.push(0, &user(3, 1)).unwrap();
        w.push(0, &StatusTlv::PpduEndStatusDone).unwrap();
        h.feed(w.finish());

        let stats = h.fanout.get_stats();
        assert_eq!(stats.neighbour_rssi_updated, 1);
        assert_eq!(h.fanout.neighbours().get(&NEIGHBOUR).unwrap().frames, 1);
        assert_eq!(stats.scan_vap.rx_ok_pkts, 3);
        assert_eq!(stats.scan_vap.rx_err_pkts, 1);
        assert_eq!(stats.scan_vap.rx_data_pkts, 1);
        // Stats aggregation stays off without enhanced stats or m-copy.
        assert!(h.sinks.indications.is_empty());
    }
}
