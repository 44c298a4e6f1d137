//! Online CPUs and NUMA nodes of the host, and thread pinning.

use std::fs;
use std::path::Path;

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use tracing::debug;

const SYSFS_CPU_ONLINE: &str = "/sys/devices/system/cpu/online";
const SYSFS_NODE_DIR: &str = "/sys/devices/system/node";

/// Snapshot of the schedulable CPUs and online NUMA nodes, both ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    cpus: Vec<usize>,
    nodes: Vec<usize>,
}

impl Topology {
    /// Build a topology from explicit id lists. Empty lists fall back to cpu 0 / node 0.
    pub fn new(cpus: impl IntoIterator<Item = usize>, nodes: impl IntoIterator<Item = usize>) -> Self {
        let mut cpus: Vec<usize> = cpus.into_iter().collect();
        cpus.sort_unstable();
        cpus.dedup();
        if cpus.is_empty() {
            cpus.push(0);
        }
        let mut nodes: Vec<usize> = nodes.into_iter().collect();
        nodes.sort_unstable();
        nodes.dedup();
        if nodes.is_empty() {
            nodes.push(0);
        }
        Topology { cpus, nodes }
    }

    /// Read the host topology from sysfs.
    pub fn detect() -> Self {
        let cpus = fs::read_to_string(SYSFS_CPU_ONLINE)
            .map(|s| parse_cpulist(&s))
            .unwrap_or_default();
        let cpus = if cpus.is_empty() {
            let n = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            (0..n).collect()
        } else {
            cpus
        };
        let nodes = online_nodes(Path::new(SYSFS_NODE_DIR));
        let topology = Topology::new(cpus, nodes);
        debug!(?topology, "detected topology");
        topology
    }

    pub fn online_cpus(&self) -> &[usize] {
        &self.cpus
    }

    pub fn online_nodes(&self) -> &[usize] {
        &self.nodes
    }

    /// The cpu a connection of the given index runs on.
    pub fn cpu_for_connection(&self, index: usize) -> usize {
        self.cpus[index % self.cpus.len()]
    }
}

fn online_nodes(node_dir: &Path) -> Vec<usize> {
    if let Ok(s) = fs::read_to_string(node_dir.join("online")) {
        let nodes = parse_cpulist(&s);
        if !nodes.is_empty() {
            return nodes;
        }
    }
    let mut nodes = Vec::new();
    if let Ok(entries) = fs::read_dir(node_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(num) = name
                .strip_prefix("node")
                .and_then(|s| s.parse::<usize>().ok())
            {
                nodes.push(num);
            }
        }
    }
    nodes
}

/// Parse the kernel's list format, e.g. `0-3,8,10-11`.
pub(crate) fn parse_cpulist(s: &str) -> Vec<usize> {
    let mut ids = Vec::new();
    for part in s.trim().split(',') {
        let part = part.trim();
        if let Some((a, b)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (a.parse::<usize>(), b.parse::<usize>()) {
                ids.extend(start..=end);
            }
        } else if let Ok(id) = part.parse::<usize>() {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    ids.dedup();
    ids
}

pub(crate) fn pin_current_thread(cpu: usize) -> nix::Result<()> {
    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &set)
}

/// The cpu the calling thread is currently running on.
pub(crate) fn current_cpu() -> Option<usize> {
    nix::sched::sched_getcpu().ok()
}
