//! The clients: one tokio task each, all pushing block requests at a single device.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{info, warn};
use xnbd::{
    transport::{
        loopback::LoopbackTransport,
        store::{DirStore, MemoryStore},
    },
    BlockRequest, Device, Payload, Session, SessionConfig, SubmitError,
};

use crate::{
    stats::{Direction, Stats},
    Args, StopAfter, StoreKind,
};

const PORTAL: &str = "loopback://xnbd-bench";
const FILE: &str = "/bench.img";
const DIR_STORE_ROOT: &str = "data";

/// Every 8 byte word of the file holds its own offset.
fn pattern(offset: u64, len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(len);
    let mut word = offset;
    while buf.len() + 8 <= len {
        buf.put_u64_le(word);
        word += 8;
    }
    buf.resize(len, 0);
    buf.freeze()
}

fn check_pattern(offset: u64, mut data: &[u8]) {
    let mut word = offset;
    while data.remaining() >= 8 {
        let got = data.get_u64_le();
        assert_eq!(got, word, "data at offset {word} does not match the pattern");
        word += 8;
    }
}

/// How many more requests a client may start.
#[derive(Clone)]
enum Budget {
    Unlimited,
    /// Possibly shared between clients.
    Counted(Arc<AtomicI64>),
}

impl Budget {
    fn per_client(stop_after: StopAfter, num_clients: usize) -> Vec<Budget> {
        let counted = |n: u64| Budget::Counted(Arc::new(AtomicI64::new(n.min(i64::MAX as u64) as i64)));
        match stop_after {
            StopAfter::CtrlC | StopAfter::Elapsed(_) => vec![Budget::Unlimited; num_clients],
            StopAfter::TotalIos(total) => vec![counted(total); num_clients],
            StopAfter::IosPerClient(each) => (0..num_clients).map(|_| counted(each)).collect(),
        }
    }

    fn take(&self) -> bool {
        match self {
            Budget::Unlimited => true,
            Budget::Counted(left) => left.fetch_sub(1, Ordering::Relaxed) > 0,
        }
    }
}

fn setup_transport(args: &Args) -> LoopbackTransport {
    let file_size = usize::try_from(args.file_size_mib.get() << 20).unwrap();
    let contents = pattern(0, file_size).to_vec();
    match args.store {
        StoreKind::Memory => {
            let store = MemoryStore::new();
            store.insert(FILE, contents);
            LoopbackTransport::new(store)
        }
        StoreKind::Dir => {
            std::fs::create_dir_all(DIR_STORE_ROOT).unwrap();
            let path = std::path::Path::new(DIR_STORE_ROOT).join(FILE.trim_start_matches('/'));
            info!(?path, "writing pattern file");
            std::fs::write(&path, contents).unwrap();
            LoopbackTransport::new(DirStore::new(DIR_STORE_ROOT))
        }
    }
}

/// Run every client to completion. Returns how long each one ran.
pub(crate) async fn run(
    args: Arc<Args>,
    start: Arc<tokio::sync::Barrier>,
    stop: Arc<AtomicBool>,
    stats: Arc<Stats>,
) -> Vec<Duration> {
    let transport = setup_transport(&args);
    let config = SessionConfig {
        nr_connections: args.connections.get(),
        queue_depth: u32::try_from(args.queue_depth.get()).unwrap(),
        ..SessionConfig::default()
    };
    let mut session = Session::create(&transport, PORTAL, config)
        .await
        .expect("create session");
    let device = session.open_device(FILE).await.expect("open device");
    info!(?device, queues = device.queues().len(), "device ready");
    stats.watch_connections(session.connections());

    let tasks: Vec<_> = Budget::per_client(args.stop_after, args.num_clients.get())
        .into_iter()
        .enumerate()
        .map(|(client_num, budget)| {
            tokio::spawn(client(
                Arc::clone(&args),
                client_num,
                Arc::clone(&device),
                Arc::clone(&start),
                Arc::clone(&stop),
                Arc::clone(&stats),
                budget,
            ))
        })
        .collect();

    let mut runtimes = Vec::with_capacity(tasks.len());
    for task in tasks {
        runtimes.push(task.await.expect("client task"));
    }

    drop(device);
    session.shutdown().await;
    runtimes
}

async fn client(
    args: Arc<Args>,
    client_num: usize,
    device: Arc<Device>,
    start: Arc<tokio::sync::Barrier>,
    stop: Arc<AtomicBool>,
    stats: Arc<Stats>,
    budget: Budget,
) -> Duration {
    let block_size = args.block_size();
    let blocks = (device.stat().size / block_size as u64).max(1);
    let queue = client_num % device.queues().len();
    let read_percent = args.work_kind.read_percent();
    let validate = args.work_kind.validate();
    let mut rng = StdRng::seed_from_u64(client_num as u64);

    start.wait().await;
    let started = Instant::now();

    while !stop.load(Ordering::Relaxed) && budget.take() {
        let offset = rng.gen_range(0..blocks) * block_size as u64;
        let is_read = rng.gen_range(0..100u8) < read_percent;
        let payload = if is_read {
            Payload::read(block_size)
        } else {
            Payload::write(pattern(offset, block_size))
        };

        let op_start = Instant::now();
        let (mut request, done) = BlockRequest::with_channel(offset, Some(payload));
        loop {
            match device.submit(queue, request) {
                Ok(()) => break,
                Err(SubmitError::Busy { request: r, .. }) => {
                    stats.busy(client_num);
                    request = r;
                    tokio::task::yield_now().await;
                }
                Err(e) => panic!("submit failed: {e}"),
            }
        }
        let completion = done.await.expect("every request completes");
        match completion.result {
            Ok(n) if n == block_size => {}
            Ok(n) => warn!(client_num, offset, n, "short transfer"),
            Err(e) => panic!("request at offset {offset} failed: {e}"),
        }
        let direction = if is_read {
            Direction::Read
        } else {
            Direction::Write
        };
        stats.record(client_num, queue, direction, op_start.elapsed());

        if is_read && validate {
            if let Some(data) = completion.payload.and_then(|p| p.into_read()) {
                check_pattern(offset, &data);
            }
        }
    }

    started.elapsed()
}
