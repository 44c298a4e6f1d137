//! Counters the clients bump and the monitor drains once per round.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use crossbeam_utils::CachePadded;
use hdrhistogram::Histogram;
use xnbd::ConnectionHandle;

#[derive(Clone, Copy, Debug)]
pub(crate) enum Direction {
    Read,
    Write,
}

struct ClientStats {
    reads: AtomicU64,
    writes: AtomicU64,
    busy_retries: AtomicU64,
    read_latency: Mutex<Histogram<u64>>,
    write_latency: Mutex<Histogram<u64>>,
}

pub(crate) struct Stats {
    clients: Vec<CachePadded<ClientStats>>,
    /// Completions per hardware queue.
    queues: Vec<CachePadded<AtomicU64>>,
    connections: Mutex<Vec<ConnectionHandle>>,
}

pub(crate) fn latency_histogram() -> Histogram<u64> {
    // 1us .. 100s at 3 significant digits
    Histogram::new_with_bounds(1, 100_000_000, 3).expect("static histogram bounds")
}

impl Stats {
    pub(crate) fn new(num_clients: usize, num_queues: usize) -> Self {
        Stats {
            clients: (0..num_clients)
                .map(|_| {
                    CachePadded::new(ClientStats {
                        reads: AtomicU64::new(0),
                        writes: AtomicU64::new(0),
                        busy_retries: AtomicU64::new(0),
                        read_latency: Mutex::new(latency_histogram()),
                        write_latency: Mutex::new(latency_histogram()),
                    })
                })
                .collect(),
            queues: (0..num_queues)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Sample the in-flight depth of these connections at the end of every round.
    pub(crate) fn watch_connections(&self, connections: &[ConnectionHandle]) {
        *self.connections.lock().unwrap() = connections.to_vec();
    }

    pub(crate) fn record(&self, client: usize, queue: usize, direction: Direction, latency: Duration) {
        let stats = &self.clients[client];
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX).max(1);
        let (count, histogram) = match direction {
            Direction::Read => (&stats.reads, &stats.read_latency),
            Direction::Write => (&stats.writes, &stats.write_latency),
        };
        count.fetch_add(1, Ordering::Relaxed);
        histogram.lock().unwrap().saturating_record(micros);
        self.queues[queue].fetch_add(1, Ordering::Relaxed);
    }

    /// The device answered `Busy` and the client will retry.
    pub(crate) fn busy(&self, client: usize) {
        self.clients[client]
            .busy_retries
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Everything recorded since the previous drain.
    pub(crate) fn drain(&self) -> Sample {
        let mut sample = Sample::empty(self.queues.len());
        for client in &self.clients {
            sample.reads += client.reads.swap(0, Ordering::Relaxed);
            sample.writes += client.writes.swap(0, Ordering::Relaxed);
            sample.busy_retries += client.busy_retries.swap(0, Ordering::Relaxed);
            for (from, into) in [
                (&client.read_latency, &mut sample.read_latency),
                (&client.write_latency, &mut sample.write_latency),
            ] {
                let mut from = from.lock().unwrap();
                into.add(&*from).expect("histograms share bounds");
                from.clear();
            }
        }
        for (queue, count) in self.queues.iter().enumerate() {
            sample.per_queue[queue] = count.swap(0, Ordering::Relaxed);
        }
        sample.in_flight = self
            .connections
            .lock()
            .unwrap()
            .iter()
            .map(ConnectionHandle::in_flight)
            .collect();
        sample
    }
}

pub(crate) struct Sample {
    pub(crate) reads: u64,
    pub(crate) writes: u64,
    pub(crate) busy_retries: u64,
    pub(crate) per_queue: Vec<u64>,
    /// Per connection. In a total, the highest depth seen in any round.
    pub(crate) in_flight: Vec<usize>,
    pub(crate) read_latency: Histogram<u64>,
    pub(crate) write_latency: Histogram<u64>,
}

impl Sample {
    pub(crate) fn empty(num_queues: usize) -> Self {
        Sample {
            reads: 0,
            writes: 0,
            busy_retries: 0,
            per_queue: vec![0; num_queues],
            in_flight: Vec::new(),
            read_latency: latency_histogram(),
            write_latency: latency_histogram(),
        }
    }

    pub(crate) fn absorb(&mut self, round: &Sample) {
        self.reads += round.reads;
        self.writes += round.writes;
        self.busy_retries += round.busy_retries;
        for (total, n) in self.per_queue.iter_mut().zip(&round.per_queue) {
            *total += n;
        }
        if self.in_flight.len() < round.in_flight.len() {
            self.in_flight.resize(round.in_flight.len(), 0);
        }
        for (peak, n) in self.in_flight.iter_mut().zip(&round.in_flight) {
            *peak = (*peak).max(*n);
        }
        self.read_latency
            .add(&round.read_latency)
            .expect("histograms share bounds");
        self.write_latency
            .add(&round.write_latency)
            .expect("histograms share bounds");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_splits_directions_and_resets() {
        let stats = Stats::new(2, 3);
        stats.record(0, 2, Direction::Read, Duration::from_micros(40));
        stats.record(1, 2, Direction::Write, Duration::from_micros(900));
        stats.record(1, 0, Direction::Write, Duration::from_micros(700));
        stats.busy(1);

        let first = stats.drain();
        assert_eq!((first.reads, first.writes, first.busy_retries), (1, 2, 1));
        assert_eq!(first.per_queue, vec![1, 0, 2]);
        assert_eq!(first.read_latency.len(), 1);
        assert_eq!(first.write_latency.len(), 2);
        assert!(first.write_latency.min() >= 700);

        let second = stats.drain();
        assert_eq!((second.reads, second.writes, second.busy_retries), (0, 0, 0));
        assert!(second.read_latency.is_empty());

        let mut total = Sample::empty(3);
        total.absorb(&first);
        total.absorb(&second);
        assert_eq!(total.per_queue, vec![1, 0, 2]);
        assert_eq!(total.write_latency.len(), 2);
    }
}
