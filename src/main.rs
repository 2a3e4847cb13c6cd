//! Monitor status replay
//!
//! Feeds recorded status buffers through simulated radios and prints the
//! resulting diagnostics as JSON.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use clap::{Arg, ArgAction, Command};
use rxmon::{
    config::ConfigManager,
    hw::sim::{sim_pair, SimRing},
    peer::{NeighbourPeer, StaticPeerTable},
    pipeline::{Collaborators, RadioPipeline, Scheduler},
    stats::{PeerRxStats, RxMonStats},
    MonitorConfig, RadioId, Result, RxMonError,
};
use serde::Serialize;
use std::{collections::VecDeque, path::PathBuf, process, time::Duration};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_QUOTA: &str = "64";

const DEFAULT_INTERVAL_MS: &str = "10";

/// AST indices mapped one-to-one onto peer ids during replay.
const REPLAY_AST_ENTRIES: u16 = 1024;

/// Per-radio replay output
#[derive(Debug, Serialize)]
struct RadioReport {
    capture: String,
    records: usize,
    stats: RxMonStats,
    peers: Vec<PeerRxStats>,
    neighbours: Vec<NeighbourPeer>,
}

#[derive(Debug, Serialize)]
struct ReplayReport {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    interrupted: bool,
    passes: u64,
    drained: u64,
    radios: Vec<RadioReport>,
}

/// Hardware side of one simulated radio
struct CaptureFeed {
    radio: RadioId,
    path: String,
    ring: SimRing,
    total: usize,
    pending: VecDeque<Bytes>,
}

impl CaptureFeed {
    /// Complete as many armed slots as there are records left.
    fn push_ready(&mut self) -> Result<usize> {
        let mut pushed = 0;
        while !self.pending.is_empty() && self.ring.hw_has_armed() {
            if let Some(record) = self.pending.pop_front() {
                self.ring.complete(&record)?;
                pushed += 1;
            }
        }
        if pushed > 0 {
            debug!(radio = self.radio, pushed, left = self.pending.len(), "fed status buffers");
        }
        Ok(pushed)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("rxmon-replay")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Replay recorded monitor status buffers through the receive pipeline")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (toml, json or yaml)"),
        )
        .arg(
            Arg::new("capture")
                .value_name("CAPTURE")
                .help("Capture file, one per radio")
                .required(true)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("quota")
                .short('q')
                .long("quota")
                .value_name("N")
                .help("Ring entries drained per radio per pass")
                .value_parser(clap::value_parser!(u32))
                .default_value(DEFAULT_QUOTA),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .long("interval")
                .value_name("MS")
                .help("Polling interval in milliseconds")
                .value_parser(clap::value_parser!(u64))
                .default_value(DEFAULT_INTERVAL_MS),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .default_value(DEFAULT_LOG_LEVEL),
        )
        .arg(
            Arg::new("compact")
                .long("compact")
                .help("Print single-line JSON")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or(DEFAULT_LOG_LEVEL);
    init_logging(log_level)?;

    let config = load_configuration(matches.get_one::<String>("config").map(PathBuf::from))?;
    let quota = matches.get_one::<u32>("quota").copied().unwrap_or(64);
    let interval = matches.get_one::<u64>("interval").copied().unwrap_or(10);
    let captures: Vec<String> = matches
        .get_many::<String>("capture")
        .map(|v| v.cloned().collect())
        .unwrap_or_default();

    match run_replay(config, &captures, quota, Duration::from_millis(interval.max(1))).await {
        Ok(report) => {
            let json = if matches.get_flag("compact") {
                serde_json::to_string(&report)
            } else {
                serde_json::to_string_pretty(&report)
            }
            .map_err(|e| RxMonError::Serialization(e.to_string()))?;
            println!("{}", json);
            Ok(())
        }
        Err(e) => {
            error!("replay failed: {}", e);
            process::exit(1);
        }
    }
}

/// Initialize logging system
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| RxMonError::Config(format!("Invalid log level '{}': {}", level, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn load_configuration(path: Option<PathBuf>) -> Result<MonitorConfig> {
    let Some(path) = path else {
        info!("No configuration file given, using defaults");
        return Ok(MonitorConfig::default());
    };
    info!("Loading configuration from: {}", path.display());
    let manager = ConfigManager::load_from_file(&path)?;
    Ok(manager.get_config().clone())
}

/// Split a capture into status buffers: each record is a little-endian
/// `u32` length followed by that many bytes.
fn parse_capture(data: &[u8]) -> Result<Vec<Bytes>> {
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let Some(len_bytes) = data.get(pos..pos + 4) else {
            return Err(RxMonError::Parse(format!(
                "truncated record length at offset {}",
                pos
            )));
        };
        let mut word = [0u8; 4];
        word.copy_from_slice(len_bytes);
        let len = u32::from_le_bytes(word) as usize;
        pos += 4;
        let Some(body) = data.get(pos..pos + len) else {
            return Err(RxMonError::Parse(format!(
                "record at offset {} wants {} bytes, {} left",
                pos - 4,
                len,
                data.len() - pos
            )));
        };
        records.push(Bytes::copy_from_slice(body));
        pos += len;
    }
    Ok(records)
}

fn replay_peers() -> StaticPeerTable {
    let mut peers = StaticPeerTable::new(REPLAY_AST_ENTRIES - 1);
    for ast in 0..REPLAY_AST_ENTRIES {
        let [hi, lo] = ast.to_be_bytes();
        peers.add_peer(ast, ast, [0x02, 0, 0, 0, hi, lo]);
    }
    peers
}

async fn run_replay(
    config: MonitorConfig,
    captures: &[String],
    quota: u32,
    period: Duration,
) -> Result<ReplayReport> {
    let started_at = Utc::now();
    let mut scheduler = Scheduler::new(quota);
    let mut feeds = Vec::with_capacity(captures.len());

    for (idx, path) in captures.iter().enumerate() {
        let radio = RadioId::try_from(idx)
            .map_err(|_| RxMonError::InvalidParameter(format!("too many radios: {}", idx + 1)))?;
        let data = tokio::fs::read(path).await?;
        let records = parse_capture(&data)?;
        info!(radio, path = %path, records = records.len(), "loaded capture");

        let (ring, dma) = sim_pair(config.ring.entries)?;
        let collaborators = Collaborators {
            peers: Box::new(replay_peers()),
            ..Default::default()
        };
        let mut pipeline = RadioPipeline::new(
            radio,
            config.clone(),
            Box::new(ring.clone()),
            Box::new(dma),
            collaborators,
        )?;
        let armed = pipeline.init();
        if armed.placed + 1 < config.ring.entries {
            warn!(radio, placed = armed.placed, "status ring only partly armed");
        }
        scheduler.add(pipeline);
        feeds.push(CaptureFeed {
            radio,
            path: path.clone(),
            ring,
            total: records.len(),
            pending: records.into(),
        });
    }

    let mut ticker = tokio::time::interval(period);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut interrupted = false;
    let mut drained = 0u64;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received Ctrl+C, stopping replay");
                interrupted = true;
                break;
            }
            _ = ticker.tick() => {
                let mut fed = 0;
                for feed in feeds.iter_mut() {
                    fed += feed.push_ready()?;
                }
                let n = scheduler.poll();
                drained += n as u64;
                let left: usize = feeds.iter().map(|f| f.pending.len()).sum();
                if n == 0 && fed == 0 && left == 0 {
                    break;
                }
                if n == 0 && fed == 0 {
                    warn!(left, "no progress this pass");
                }
            }
        }
    }
    info!(passes = scheduler.passes(), drained, "replay finished");

    let mut radios = Vec::with_capacity(feeds.len());
    for (feed, pipeline) in feeds.iter().zip(scheduler.pipelines()) {
        let mut peers: Vec<PeerRxStats> = pipeline.aggregator().peers().cloned().collect();
        peers.sort_by_key(|p| p.peer_id);
        radios.push(RadioReport {
            capture: feed.path.clone(),
            records: feed.total,
            stats: pipeline.stats(),
            peers,
            neighbours: pipeline.neighbours().peers().cloned().collect(),
        });
    }
    let passes = scheduler.passes();
    scheduler.teardown();

    Ok(ReplayReport {
        started_at,
        finished_at: Utc::now(),
        interrupted,
        passes,
        drained,
        radios,
    })
}
