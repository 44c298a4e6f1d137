//! Drains [`Stats`] once per second into a [`Round`], logs it, and assembles the
//! final [`Report`] when the clients are done.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use hdrhistogram::Histogram;
use itertools::Itertools;
use serde_with::{serde_as, DurationSecondsWithFrac};
use tokio::sync::{oneshot, Barrier};
use tracing::info;

use crate::{
    stats::{Sample, Stats},
    Args,
};

const ROUND: Duration = Duration::from_secs(1);

/// Microseconds.
#[derive(serde::Serialize, Default)]
pub(crate) struct Latency {
    samples: u64,
    p50: u64,
    p99: u64,
    p999: u64,
    max: u64,
}

impl Latency {
    fn of(histogram: &Histogram<u64>) -> Self {
        if histogram.is_empty() {
            return Latency::default();
        }
        Latency {
            samples: histogram.len(),
            p50: histogram.value_at_quantile(0.5),
            p99: histogram.value_at_quantile(0.99),
            p999: histogram.value_at_quantile(0.999),
            max: histogram.max(),
        }
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}us", self.p50, self.p99, self.max)
    }
}

#[serde_as]
#[derive(serde::Serialize)]
pub(crate) struct Round {
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    elapsed: Duration,
    read_iops: f64,
    write_iops: f64,
    bandwidth_mibps: f64,
    busy_retries: u64,
    queue_iops: Vec<f64>,
    /// Per connection, sampled at the end of the round; the peak in a total.
    in_flight: Vec<usize>,
    read_latency_us: Latency,
    write_latency_us: Latency,
}

impl Round {
    fn new(sample: &Sample, elapsed: Duration, block_size: usize) -> Self {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let ios = (sample.reads + sample.writes) as f64;
        Round {
            elapsed,
            read_iops: sample.reads as f64 / secs,
            write_iops: sample.writes as f64 / secs,
            bandwidth_mibps: ios * block_size as f64 / (1u64 << 20) as f64 / secs,
            busy_retries: sample.busy_retries,
            queue_iops: sample.per_queue.iter().map(|n| *n as f64 / secs).collect(),
            in_flight: sample.in_flight.clone(),
            read_latency_us: Latency::of(&sample.read_latency),
            write_latency_us: Latency::of(&sample.write_latency),
        }
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "t={:.1}s r={:.0} w={:.0} iops {:.1} MiB/s busy={} queues=[{}] in_flight=[{}] \
             lat p50/p99/max r={} w={}",
            self.elapsed.as_secs_f64(),
            self.read_iops,
            self.write_iops,
            self.bandwidth_mibps,
            self.busy_retries,
            self.queue_iops.iter().map(|iops| format!("{iops:.0}")).join(" "),
            self.in_flight.iter().join(" "),
            self.read_latency_us,
            self.write_latency_us,
        )
    }
}

/// The library's own view of the run.
#[derive(serde::Serialize)]
pub(crate) struct Counters {
    ios_submitted: u64,
    ios_completed: u64,
    ios_failed: u64,
    orphan_completions: u64,
}

#[derive(serde::Serialize)]
pub(crate) struct Report {
    args: Args,
    rounds: Vec<Round>,
    pub(crate) total: Round,
    client_runtimes_secs: Vec<f64>,
    counters: Counters,
}

pub(crate) async fn run(
    args: Arc<Args>,
    stats: Arc<Stats>,
    start: Arc<Barrier>,
    mut finished: oneshot::Receiver<Vec<Duration>>,
) -> Report {
    let block_size = args.block_size();
    start.wait().await;
    let started = Instant::now();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + ROUND, ROUND);
    let mut total = Sample::empty(args.connections.get());
    let mut rounds = Vec::new();
    let mut round_start = started;

    let runtimes = loop {
        let finished_now = tokio::select! {
            _ = ticker.tick() => None,
            runtimes = &mut finished => Some(runtimes.unwrap_or_default()),
        };
        let sample = stats.drain();
        let round = Round::new(&sample, round_start.elapsed(), block_size);
        round_start = Instant::now();
        info!("{round}");
        total.absorb(&sample);
        rounds.push(round);
        if let Some(runtimes) = finished_now {
            break runtimes;
        }
    };

    let metrics = xnbd::metrics::global();
    Report {
        args: args.as_ref().clone(),
        rounds,
        total: Round::new(&total, started.elapsed(), block_size),
        client_runtimes_secs: runtimes
            .into_iter()
            .sorted()
            .map(|d| d.as_secs_f64())
            .collect(),
        counters: Counters {
            ios_submitted: metrics.ios_submitted,
            ios_completed: metrics.ios_completed,
            ios_failed: metrics.ios_failed,
            orphan_completions: metrics.orphan_completions,
        },
    }
}
