//! Push random block IO at one xnbd device served over the loopback transport and
//! report throughput, per-direction latency, queue back-pressure and occupancy.

use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::{CommandFactory, Parser};
use tracing::{error, info};

mod client;
mod monitor;
mod stats;

#[derive(serde::Serialize, clap::Parser, Clone)]
struct Args {
    num_clients: NonZeroUsize,
    file_size_mib: NonZeroU64,
    /// log2 of the request size; at most one transfer unit
    block_size_shift: NonZeroU64,
    /// `ctrl-c`, a duration like `30s`, `<n>-ios` in total or `<n>-ios-per-client`;
    /// counts take a k/m/g suffix.
    #[clap(long, default_value = "ctrl-c")]
    stop_after: StopAfter,
    /// Connections of the session, and so hardware queues of the device.
    #[clap(long, default_value = "4")]
    connections: NonZeroUsize,
    #[clap(long, default_value = "64")]
    queue_depth: NonZeroU64,
    #[clap(long, value_enum, default_value = "memory")]
    store: StoreKind,
    #[clap(long, default_value = "xnbd-bench.output.json")]
    output: PathBuf,
    #[clap(subcommand)]
    work_kind: WorkKind,
}

impl Args {
    fn block_size(&self) -> usize {
        1 << self.block_size_shift.get()
    }

    fn check(&self) -> Result<(), String> {
        if self.block_size() > xnbd_proto::SUBMIT_BLOCK_SIZE {
            return Err(format!(
                "block size {} exceeds the {} byte transfer unit",
                self.block_size(),
                xnbd_proto::SUBMIT_BLOCK_SIZE
            ));
        }
        if (self.file_size_mib.get() << 20) < self.block_size() as u64 {
            return Err("the file must hold at least one block".to_owned());
        }
        if u32::try_from(self.queue_depth.get()).is_err() {
            return Err("queue depth must fit in 32 bits".to_owned());
        }
        Ok(())
    }
}

#[derive(Clone, Copy, serde::Serialize)]
enum StopAfter {
    CtrlC,
    Elapsed(Duration),
    TotalIos(u64),
    IosPerClient(u64),
}

/// `250`, `10k`, `3m` or `1g`.
fn parse_count(s: &str) -> Result<u64, String> {
    let (digits, scale) = match s.as_bytes().last() {
        Some(b'k') => (&s[..s.len() - 1], 1_000),
        Some(b'm') => (&s[..s.len() - 1], 1_000_000),
        Some(b'g') => (&s[..s.len() - 1], 1_000_000_000),
        _ => (s, 1),
    };
    digits
        .parse::<NonZeroU64>()
        .map(|n| n.get() * scale)
        .map_err(|e| format!("invalid io count {s:?}: {e}"))
}

impl FromStr for StopAfter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "ctrl-c" {
            return Ok(StopAfter::CtrlC);
        }
        if let Some(count) = s.strip_suffix("-ios-per-client") {
            return parse_count(count).map(StopAfter::IosPerClient);
        }
        if let Some(count) = s.strip_suffix("-ios") {
            return parse_count(count).map(StopAfter::TotalIos);
        }
        humantime::parse_duration(s)
            .map(StopAfter::Elapsed)
            .map_err(|e| format!("invalid duration {s:?}: {e}"))
    }
}

#[derive(Clone, Copy, clap::ValueEnum, serde::Serialize)]
enum StoreKind {
    Memory,
    /// A file below `./data`, accessed with positional IO.
    Dir,
}

#[derive(Clone, Copy, clap::Subcommand, serde::Serialize)]
enum WorkKind {
    Read {
        #[clap(long)]
        validate: bool,
    },
    Write,
    Mixed {
        read_percent: u8,
        #[clap(long)]
        validate: bool,
    },
}

impl WorkKind {
    fn validate(&self) -> bool {
        match self {
            WorkKind::Read { validate } | WorkKind::Mixed { validate, .. } => *validate,
            WorkKind::Write => false,
        }
    }

    fn read_percent(&self) -> u8 {
        match self {
            WorkKind::Read { .. } => 100,
            WorkKind::Write => 0,
            WorkKind::Mixed { read_percent, .. } => (*read_percent).min(100),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    xnbd::env_tunables::assert_no_unknown_env_vars();

    let args = Args::parse();
    if let Err(msg) = args.check() {
        Args::command()
            .error(clap::error::ErrorKind::ValueValidation, msg)
            .exit();
    }
    let args = Arc::new(args);

    let stop = Arc::new(AtomicBool::new(false));
    if let StopAfter::Elapsed(after) = args.stop_after {
        let stop = Arc::clone(&stop);
        std::thread::Builder::new()
            .name("stop-timer".to_owned())
            .spawn(move || {
                std::thread::sleep(after);
                info!(?after, "run time elapsed");
                stop.store(true, Ordering::Relaxed);
            })
            .expect("spawn stop timer");
    }
    ctrlc::set_handler({
        let stop = Arc::clone(&stop);
        move || {
            if stop.swap(true, Ordering::Relaxed) {
                error!("second ctrl-c, aborting");
                std::process::abort();
            }
            info!("ctrl-c, stopping clients");
        }
    })
    .expect("install ctrl-c handler");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("build runtime");
    let report = rt.block_on(run(Arc::clone(&args), stop));

    info!("total: {}", report.total);
    info!(path = ?args.output, "writing report");
    let json = serde_json::to_string_pretty(&report).expect("report serializes");
    std::fs::write(&args.output, json).expect("write report");
}

async fn run(args: Arc<Args>, stop: Arc<AtomicBool>) -> monitor::Report {
    let stats = Arc::new(stats::Stats::new(
        args.num_clients.get(),
        args.connections.get(),
    ));
    let start = Arc::new(tokio::sync::Barrier::new(args.num_clients.get() + 1));
    let (finished_tx, finished_rx) = tokio::sync::oneshot::channel();
    let monitor = tokio::spawn(monitor::run(
        Arc::clone(&args),
        Arc::clone(&stats),
        Arc::clone(&start),
        finished_rx,
    ));
    let runtimes = client::run(args, start, stop, stats).await;
    if finished_tx.send(runtimes).is_err() {
        error!("monitor exited early");
    }
    monitor.await.expect("monitor task")
}
