//! Per-radio pipeline and polling
//!
//! [`RadioPipeline`] owns everything one radio needs: descriptor pool,
//! reader, parse queue, the in-progress PPDU and the consumer fan-out.
//! [`Scheduler`] polls several of them round-robin.

use log::{debug, info, warn};
use std::future::Future;
use std::time::Duration;

use crate::buffer::StatusQueue;
use crate::config::{ConfigManager, MonitorConfig};
use crate::desc::DescriptorPool;
use crate::fanout::{
    ConsumerFanout, DestRing, Disposition, FanoutEnv, MonitorSinks, NullDestRing, NullSinks,
};
use crate::hw::{DmaOps, StatusSrng};
use crate::peer::{NeighbourTable, PeerTable, StaticPeerTable};
use crate::ppdu::{ParseDiag, PpduInfo, PpduStatus, TlvParser};
use crate::reap::{RingParts, StatusRingReader};
use crate::replenish::{BufferReplenisher, ReplenishReport};
use crate::stats::{RxMonStats, StatsAggregator};
use crate::tlv::TlvStatus;
use crate::{RadioId, Result, RxMonError};

/// Platform-side collaborators of a pipeline
pub struct Collaborators {
    pub sinks: Box<dyn MonitorSinks>,
    pub dest: Box<dyn DestRing>,
    pub peers: Box<dyn PeerTable>,
    pub stats: StatsAggregator,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            sinks: Box::new(NullSinks),
            dest: Box::new(NullDestRing),
            peers: Box::new(StaticPeerTable::new(0)),
            stats: StatsAggregator::default(),
        }
    }
}

/// Monitor status pipeline for one radio
pub struct RadioPipeline {
    radio: RadioId,
    config: MonitorConfig,
    ring: Box<dyn StatusSrng + Send>,
    dma: Box<dyn DmaOps + Send>,
    pool: DescriptorPool,
    replenisher: BufferReplenisher,
    reader: StatusRingReader,
    queue: StatusQueue,
    parser: TlvParser,
    /// PPDU being assembled; survives across buffers and passes
    ppdu: PpduInfo,
    diag: ParseDiag,
    fanout: ConsumerFanout,
    sinks: Box<dyn MonitorSinks>,
    dest: Box<dyn DestRing>,
    peers: Box<dyn PeerTable>,
    stats: StatsAggregator,
    torn_down: bool,
}

impl std::fmt::Debug for RadioPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioPipeline")
            .field("radio", &self.radio)
            .field("queue", &self.queue.len())
            .field("descriptors_free", &self.pool.free_count())
            .field("torn_down", &self.torn_down)
            .finish()
    }
}

impl RadioPipeline {
    /// Build a pipeline over `ring`. The ring size must match the
    /// configured entry count.
    pub fn new(
        radio: RadioId,
        config: MonitorConfig,
        ring: Box<dyn StatusSrng + Send>,
        dma: Box<dyn DmaOps + Send>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let validation = ConfigManager::new().validate_config(&config)?;
        if !validation.valid {
            return Err(RxMonError::Config(format!(
                "radio {}: {}",
                radio,
                validation.errors.join("; ")
            )));
        }
        for warning in &validation.warnings {
            warn!("radio {}: {}", radio, warning);
        }
        if ring.num_entries() != config.ring.entries {
            return Err(RxMonError::InvalidParameter(format!(
                "radio {}: ring has {} entries, config expects {}",
                radio,
                ring.num_entries(),
                config.ring.entries
            )));
        }

        let mode = config.parser.header_mode;
        Ok(Self {
            radio,
            pool: DescriptorPool::new(config.ring.entries + 1),
            replenisher: BufferReplenisher::new(
                config.ring.buf_size,
                config.ring.alloc_retry_threshold,
            ),
            reader: StatusRingReader::new(mode, config.ring.done_missing_policy),
            queue: StatusQueue::new(),
            parser: TlvParser::new(mode, config.mcopy_enabled()),
            ppdu: PpduInfo::new(config.parser.max_users),
            diag: ParseDiag::default(),
            fanout: ConsumerFanout::new(&config),
            sinks: collaborators.sinks,
            dest: collaborators.dest,
            peers: collaborators.peers,
            stats: collaborators.stats,
            ring,
            dma,
            config,
            torn_down: false,
        })
    }

    pub fn radio(&self) -> RadioId {
        self.radio
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Arm every ring slot but one.
    pub fn init(&mut self) -> ReplenishReport {
        let desired = self.config.ring.entries - 1;
        let report = self
            .replenisher
            .replenish(&mut *self.ring, &mut *self.dma, &mut self.pool, desired);
        info!(
            "radio {}: armed {} of {} status buffers",
            self.radio, report.placed, desired
        );
        report
    }

    /// Reap up to `quota` completed status buffers and run everything
    /// queued through the parser and consumers. Returns the number of ring
    /// entries drained.
    pub fn process(&mut self, quota: u32) -> u32 {
        if quota == 0 || self.torn_down {
            return 0;
        }
        let mut hw = RingParts {
            ring: &mut *self.ring,
            dma: &mut *self.dma,
            pool: &mut self.pool,
            replenisher: &mut self.replenisher,
        };
        let drained = self.reader.reap(&mut hw, &mut self.queue, quota);
        self.process_queue(quota - drained);
        drained
    }

    /// Drain the parse queue. The whole queue is handled regardless of
    /// `remaining` so buffers never outlive the pass that reaped them.
    fn process_queue(&mut self, remaining: u32) {
        let queued = self.queue.len();
        if queued > 0 {
            debug!(
                "radio {}: parsing {} buffers, {} quota left",
                self.radio, queued, remaining
            );
        }
        let parse = self.fanout.needs_parse();
        while let Some(buf) = self.queue.pop() {
            let status = if parse {
                self.parser
                    .parse_buffer(buf.bytes().as_ref(), &mut self.ppdu, &mut self.diag)
            } else {
                TlvStatus::BufDone
            };
            let mut env = FanoutEnv {
                sinks: &mut *self.sinks,
                dest: &mut *self.dest,
                peers: &*self.peers,
                stats: &mut self.stats,
            };
            let disposition = self.fanout.process_buffer(buf, status, &mut self.ppdu, &mut env);
            if disposition == Disposition::Retained {
                debug!("radio {}: buffer kept by enhanced capture", self.radio);
            }
        }
    }

    /// Free up to `quota` completed buffers without parsing them and empty
    /// the parse queue. Returns the ring entries drained.
    pub fn drop_packets(&mut self, quota: u32) -> u32 {
        if self.torn_down {
            return 0;
        }
        let mut hw = RingParts {
            ring: &mut *self.ring,
            dma: &mut *self.dma,
            pool: &mut self.pool,
            replenisher: &mut self.replenisher,
        };
        let dropped = self.reader.drop_status_buffers(&mut hw, quota);
        let flushed = self.queue.flush();
        if dropped > 0 || flushed > 0 {
            debug!(
                "radio {}: dropped {} ring buffers, flushed {} queued",
                self.radio, dropped, flushed
            );
        }
        dropped
    }

    /// Release every buffer and descriptor. The pipeline is inert
    /// afterwards.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        let freed = self.pool.free_buffers(&mut *self.dma);
        self.pool.clear();
        let flushed = self.queue.flush();
        self.fanout.reset();
        self.ppdu.reset_for_start();
        self.torn_down = true;
        info!(
            "radio {}: torn down, {} buffers freed, {} queued dropped",
            self.radio, freed, flushed
        );
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn ppdu(&self) -> &PpduInfo {
        &self.ppdu
    }

    pub fn ppdu_status(&self) -> PpduStatus {
        self.fanout.ppdu_status()
    }

    pub fn aggregator(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn neighbours(&self) -> &NeighbourTable {
        self.fanout.neighbours()
    }

    pub fn neighbours_mut(&mut self) -> &mut NeighbourTable {
        self.fanout.neighbours_mut()
    }

    /// Diagnostic snapshot.
    pub fn stats(&self) -> RxMonStats {
        RxMonStats {
            radio: self.radio,
            captured_at: self.stats.now(),
            reap: self.reader.get_stats().clone(),
            replenish: self.replenisher.get_stats().clone(),
            parse: self.diag.clone(),
            fanout: self.fanout.get_stats().clone(),
            queue: self.queue.get_stats().clone(),
            ul_ofdma: self.stats.ul_ofdma().clone(),
            descriptors_free: self.pool.free_count(),
            peers_tracked: self.stats.peer_count(),
        }
    }
}

/// Round-robin poller over several radios
#[derive(Debug)]
pub struct Scheduler {
    pipelines: Vec<RadioPipeline>,
    quota: u32,
    next: usize,
    passes: u64,
}

impl Scheduler {
    pub fn new(quota: u32) -> Self {
        Self {
            pipelines: Vec::new(),
            quota,
            next: 0,
            passes: 0,
        }
    }

    pub fn add(&mut self, pipeline: RadioPipeline) {
        info!("scheduler: added radio {}", pipeline.radio());
        self.pipelines.push(pipeline);
    }

    pub fn quota(&self) -> u32 {
        self.quota
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn pipelines(&self) -> &[RadioPipeline] {
        &self.pipelines
    }

    pub fn pipeline_mut(&mut self, radio: RadioId) -> Option<&mut RadioPipeline> {
        self.pipelines.iter_mut().find(|p| p.radio() == radio)
    }

    /// One pass over all radios, each with the per-radio quota. The radio
    /// served first rotates between passes.
    pub fn poll(&mut self) -> u32 {
        let n = self.pipelines.len();
        if n == 0 {
            return 0;
        }
        let mut total = 0;
        for i in 0..n {
            let idx = (self.next + i) % n;
            total += self.pipelines[idx].process(self.quota);
        }
        self.next = (self.next + 1) % n;
        self.passes += 1;
        total
    }

    /// Poll every `period` until `shutdown` resolves. Returns the entries
    /// drained over the whole run.
    pub async fn run<F>(&mut self, period: Duration, shutdown: F) -> u64
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(period);
        tokio::pin!(shutdown);
        let mut total = 0u64;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    total += self.poll() as u64;
                }
            }
        }
        info!("scheduler stopped after {} passes", self.passes);
        total
    }

    pub fn teardown(&mut self) {
        for pipeline in self.pipelines.iter_mut() {
            pipeline.teardown();
        }
    }

    pub fn into_pipelines(self) -> Vec<RadioPipeline> {
        self.pipelines
    }
}
