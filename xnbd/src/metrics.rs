use std::sync::atomic::{AtomicU64, Ordering};

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Metrics {
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
    pub control_rpcs: u64,
    pub ios_submitted: u64,
    pub ios_completed: u64,
    pub ios_failed: u64,
    /// Submit answers that arrived without a back-reference to their request.
    pub orphan_completions: u64,
}

pub(crate) struct MetricsStorage {
    pub(crate) sessions_created: AtomicU64,
    pub(crate) sessions_destroyed: AtomicU64,
    pub(crate) control_rpcs: AtomicU64,
    pub(crate) ios_submitted: AtomicU64,
    pub(crate) ios_completed: AtomicU64,
    pub(crate) ios_failed: AtomicU64,
    pub(crate) orphan_completions: AtomicU64,
}

impl MetricsStorage {
    pub(crate) const fn new_const() -> Self {
        MetricsStorage {
            sessions_created: AtomicU64::new(0),
            sessions_destroyed: AtomicU64::new(0),
            control_rpcs: AtomicU64::new(0),
            ios_submitted: AtomicU64::new(0),
            ios_completed: AtomicU64::new(0),
            ios_failed: AtomicU64::new(0),
            orphan_completions: AtomicU64::new(0),
        }
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl MetricsStorage {
    fn make_pub(&self) -> Metrics {
        Metrics {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_destroyed: self.sessions_destroyed.load(Ordering::Relaxed),
            control_rpcs: self.control_rpcs.load(Ordering::Relaxed),
            ios_submitted: self.ios_submitted.load(Ordering::Relaxed),
            ios_completed: self.ios_completed.load(Ordering::Relaxed),
            ios_failed: self.ios_failed.load(Ordering::Relaxed),
            orphan_completions: self.orphan_completions.load(Ordering::Relaxed),
        }
    }
}

pub(crate) static GLOBAL_STORAGE: MetricsStorage = MetricsStorage::new_const();

pub fn global() -> Metrics {
    GLOBAL_STORAGE.make_pub()
}
