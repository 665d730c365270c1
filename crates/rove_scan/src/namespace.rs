//! Namespace model: set registry, partitioned in-memory index trees,
//! partition reservations and reduce iteration, the cluster view, and
//! per-namespace scan statistics.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;

use crate::record::{Digest, Record, N_PARTITIONS, SET_NAME_MAX};
use crate::udf::UdfRegistry;

#[derive(Clone, Debug)]
pub struct NamespaceConfig {
    /// Ceiling (and zero-default) for background scan rps.
    pub background_scan_max_rps: u32,
    /// In-memory namespaces skip the post-bin-filter throttle sleep.
    pub storage_data_in_memory: bool,
    /// Default socket timeout when the client sends none.
    pub default_socket_timeout_ms: u32,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            background_scan_max_rps: 10_000,
            storage_data_in_memory: true,
            default_socket_timeout_ms: 10_000,
        }
    }
}

/// Cluster membership view, refreshed by the exchange layer.
pub struct ClusterView {
    key: AtomicU64,
    size: AtomicU32,
    migrate_tx_partitions_remaining: AtomicU32,
    migrate_rx_partitions_remaining: AtomicU32,
}

impl ClusterView {
    fn new() -> Self {
        Self {
            key: AtomicU64::new(1),
            size: AtomicU32::new(1),
            migrate_tx_partitions_remaining: AtomicU32::new(0),
            migrate_rx_partitions_remaining: AtomicU32::new(0),
        }
    }

    pub fn key(&self) -> u64 {
        self.key.load(Ordering::Relaxed)
    }

    /// Membership change: new epoch token.
    pub fn bump_key(&self) {
        self.key.fetch_add(1, Ordering::Relaxed);
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Relaxed).max(1)
    }

    pub fn set_size(&self, size: u32) {
        self.size.store(size, Ordering::Relaxed);
    }

    pub fn migrations_active(&self) -> bool {
        self.migrate_tx_partitions_remaining.load(Ordering::Relaxed) != 0
            || self.migrate_rx_partitions_remaining.load(Ordering::Relaxed) != 0
    }

    pub fn set_migrations(&self, tx_remaining: u32, rx_remaining: u32) {
        self.migrate_tx_partitions_remaining
            .store(tx_remaining, Ordering::Relaxed);
        self.migrate_rx_partitions_remaining
            .store(rx_remaining, Ordering::Relaxed);
    }
}

/// Per-namespace scan completion and sub-transaction filter counters.
#[derive(Default)]
pub struct ScanStats {
    pub n_scan_basic_complete: AtomicU64,
    pub n_scan_basic_abort: AtomicU64,
    pub n_scan_basic_error: AtomicU64,
    pub n_scan_aggr_complete: AtomicU64,
    pub n_scan_aggr_abort: AtomicU64,
    pub n_scan_aggr_error: AtomicU64,
    pub n_scan_udf_bg_complete: AtomicU64,
    pub n_scan_udf_bg_abort: AtomicU64,
    pub n_scan_udf_bg_error: AtomicU64,
    pub n_scan_ops_bg_complete: AtomicU64,
    pub n_scan_ops_bg_abort: AtomicU64,
    pub n_scan_ops_bg_error: AtomicU64,
    pub n_udf_sub_filtered_out: AtomicU64,
    pub n_ops_sub_filtered_out: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ScanStatsSnapshot {
    pub scan_basic_complete: u64,
    pub scan_basic_abort: u64,
    pub scan_basic_error: u64,
    pub scan_aggr_complete: u64,
    pub scan_aggr_abort: u64,
    pub scan_aggr_error: u64,
    pub scan_udf_bg_complete: u64,
    pub scan_udf_bg_abort: u64,
    pub scan_udf_bg_error: u64,
    pub scan_ops_bg_complete: u64,
    pub scan_ops_bg_abort: u64,
    pub scan_ops_bg_error: u64,
    pub udf_sub_filtered_out: u64,
    pub ops_sub_filtered_out: u64,
}

impl ScanStats {
    pub fn snapshot(&self) -> ScanStatsSnapshot {
        ScanStatsSnapshot {
            scan_basic_complete: self.n_scan_basic_complete.load(Ordering::Relaxed),
            scan_basic_abort: self.n_scan_basic_abort.load(Ordering::Relaxed),
            scan_basic_error: self.n_scan_basic_error.load(Ordering::Relaxed),
            scan_aggr_complete: self.n_scan_aggr_complete.load(Ordering::Relaxed),
            scan_aggr_abort: self.n_scan_aggr_abort.load(Ordering::Relaxed),
            scan_aggr_error: self.n_scan_aggr_error.load(Ordering::Relaxed),
            scan_udf_bg_complete: self.n_scan_udf_bg_complete.load(Ordering::Relaxed),
            scan_udf_bg_abort: self.n_scan_udf_bg_abort.load(Ordering::Relaxed),
            scan_udf_bg_error: self.n_scan_udf_bg_error.load(Ordering::Relaxed),
            scan_ops_bg_complete: self.n_scan_ops_bg_complete.load(Ordering::Relaxed),
            scan_ops_bg_abort: self.n_scan_ops_bg_abort.load(Ordering::Relaxed),
            scan_ops_bg_error: self.n_scan_ops_bg_error.load(Ordering::Relaxed),
            udf_sub_filtered_out: self.n_udf_sub_filtered_out.load(Ordering::Relaxed),
            ops_sub_filtered_out: self.n_ops_sub_filtered_out.load(Ordering::Relaxed),
        }
    }
}

pub type RecordHandle = Arc<Mutex<Record>>;

/// Ordered digest index for one partition.
///
/// The map lock protects the tree structure; each record has its own lock,
/// held only while a visitor or a sub-transaction touches it.
pub struct PartitionTree {
    map: RwLock<BTreeMap<Digest, RecordHandle>>,
}

impl PartitionTree {
    fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn size(&self) -> u64 {
        self.map.read().map(|m| m.len() as u64).unwrap_or(0)
    }

    pub fn insert(&self, record: Record) {
        if let Ok(mut map) = self.map.write() {
            map.insert(record.digest, Arc::new(Mutex::new(record)));
        }
    }

    pub fn get(&self, digest: &Digest) -> Option<RecordHandle> {
        self.map.read().ok()?.get(digest).cloned()
    }

    /// Visit live records in digest order. The visitor returns `false` to
    /// stop iteration.
    pub fn reduce_live(&self, cb: impl FnMut(MutexGuard<'_, Record>) -> bool) {
        self.reduce_inner(None, true, cb);
    }

    /// Visit live records starting from `from` (inclusive) when present.
    pub fn reduce_from_live(
        &self,
        from: Option<&Digest>,
        cb: impl FnMut(MutexGuard<'_, Record>) -> bool,
    ) {
        self.reduce_inner(from, true, cb);
    }

    /// Visit all index entries, tombstones included, from `from`.
    pub fn reduce_from(
        &self,
        from: Option<&Digest>,
        cb: impl FnMut(MutexGuard<'_, Record>) -> bool,
    ) {
        self.reduce_inner(from, false, cb);
    }

    fn reduce_inner(
        &self,
        from: Option<&Digest>,
        live_only: bool,
        mut cb: impl FnMut(MutexGuard<'_, Record>) -> bool,
    ) {
        let Ok(map) = self.map.read() else {
            return;
        };
        let range = match from {
            Some(from) => map.range((Bound::Included(*from), Bound::Unbounded)),
            None => map.range((Bound::<Digest>::Unbounded, Bound::Unbounded)),
        };
        for (_, handle) in range {
            let Ok(guard) = handle.lock() else {
                continue;
            };
            if live_only && !guard.is_live() {
                continue;
            }
            if !cb(guard) {
                break;
            }
        }
    }
}

struct Partition {
    tree: Arc<PartitionTree>,
    owned: AtomicBool,
}

/// Short-lived hold on a partition's index tree. A reservation without a
/// tree means this node cannot serve the partition.
pub struct Reservation {
    pub pid: u32,
    pub tree: Option<Arc<PartitionTree>>,
}

pub struct Namespace {
    pub name: String,
    pub config: NamespaceConfig,
    sets: RwLock<Vec<String>>,
    partitions: Vec<Partition>,
    pub cluster: ClusterView,
    pub scan_stats: ScanStats,
    pub udfs: UdfRegistry,
}

impl Namespace {
    pub fn new(name: impl Into<String>, config: NamespaceConfig) -> Arc<Self> {
        let partitions = (0..N_PARTITIONS)
            .map(|_| Partition {
                tree: Arc::new(PartitionTree::new()),
                owned: AtomicBool::new(true),
            })
            .collect();
        Arc::new(Self {
            name: name.into(),
            config,
            sets: RwLock::new(Vec::new()),
            partitions,
            cluster: ClusterView::new(),
            scan_stats: ScanStats::default(),
            udfs: UdfRegistry::new(),
        })
    }

    /// Set id for a name; `INVALID_SET_ID` when unknown.
    pub fn set_id(&self, name: &str) -> u16 {
        let Ok(sets) = self.sets.read() else {
            return 0;
        };
        sets.iter()
            .position(|s| s == name)
            .map(|i| (i + 1) as u16)
            .unwrap_or(0)
    }

    pub fn set_name(&self, set_id: u16) -> Option<String> {
        if set_id == 0 {
            return None;
        }
        self.sets.read().ok()?.get(set_id as usize - 1).cloned()
    }

    pub fn register_set(&self, name: &str) -> anyhow::Result<u16> {
        anyhow::ensure!(
            !name.is_empty() && name.len() <= SET_NAME_MAX,
            "bad set name length {}",
            name.len()
        );
        let existing = self.set_id(name);
        if existing != 0 {
            return Ok(existing);
        }
        let mut sets = self
            .sets
            .write()
            .map_err(|_| anyhow::anyhow!("set registry poisoned"))?;
        sets.push(name.to_string());
        Ok(sets.len() as u16)
    }

    pub fn insert(&self, record: Record) {
        let pid = record.digest.partition_id() as usize;
        self.partitions[pid].tree.insert(record);
    }

    pub fn find_record(&self, digest: &Digest) -> Option<RecordHandle> {
        let pid = digest.partition_id() as usize;
        self.partitions[pid].tree.get(digest)
    }

    pub fn is_owned(&self, pid: u32) -> bool {
        self.partitions[pid as usize].owned.load(Ordering::Relaxed)
    }

    pub fn set_owned(&self, pid: u32, owned: bool) {
        self.partitions[pid as usize]
            .owned
            .store(owned, Ordering::Relaxed);
    }

    /// Reserve a partition for one slice.
    pub fn reserve(&self, pid: u32) -> Reservation {
        let partition = &self.partitions[pid as usize];
        Reservation {
            pid,
            tree: partition
                .owned
                .load(Ordering::Relaxed)
                .then(|| partition.tree.clone()),
        }
    }

    pub fn record_count(&self) -> u64 {
        self.partitions.iter().map(|p| p.tree.size()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DIGEST_SZ;

    fn digest(pid: u16, tail: u8) -> Digest {
        let mut d = [tail; DIGEST_SZ];
        d[..2].copy_from_slice(&pid.to_le_bytes());
        Digest(d)
    }

    #[test]
    fn set_registry_assigns_stable_ids() {
        let ns = Namespace::new("test", NamespaceConfig::default());
        assert_eq!(ns.set_id("users"), 0);
        let id = ns.register_set("users").unwrap();
        assert_eq!(id, 1);
        assert_eq!(ns.register_set("users").unwrap(), 1);
        assert_eq!(ns.register_set("orders").unwrap(), 2);
        assert_eq!(ns.set_name(2).as_deref(), Some("orders"));
        assert!(ns.register_set("").is_err());
    }

    #[test]
    fn records_route_to_digest_partition() {
        let ns = Namespace::new("test", NamespaceConfig::default());
        ns.insert(Record::new(digest(17, 1), 0));
        let rsv = ns.reserve(17);
        assert_eq!(rsv.tree.unwrap().size(), 1);
        assert_eq!(ns.reserve(18).tree.unwrap().size(), 0);
    }

    #[test]
    fn reservation_has_no_tree_for_disowned_partition() {
        let ns = Namespace::new("test", NamespaceConfig::default());
        ns.set_owned(9, false);
        assert!(ns.reserve(9).tree.is_none());
        assert!(ns.reserve(10).tree.is_some());
    }

    #[test]
    fn reduce_live_skips_tombstones_and_honors_stop() {
        let ns = Namespace::new("test", NamespaceConfig::default());
        for tail in 0..4u8 {
            let mut r = Record::new(digest(5, tail), 0);
            r.tombstone = tail == 1;
            ns.insert(r);
        }
        let tree = ns.reserve(5).tree.unwrap();

        let mut seen = Vec::new();
        tree.reduce_live(|r| {
            seen.push(r.digest);
            true
        });
        assert_eq!(seen.len(), 3);

        let mut all = 0;
        tree.reduce_from(None, |_| {
            all += 1;
            true
        });
        assert_eq!(all, 4);

        let mut first_only = 0;
        tree.reduce_live(|_| {
            first_only += 1;
            false
        });
        assert_eq!(first_only, 1);
    }

    #[test]
    fn reduce_from_resumes_at_digest() {
        let ns = Namespace::new("test", NamespaceConfig::default());
        for tail in 0..5u8 {
            ns.insert(Record::new(digest(2, tail), 0));
        }
        let tree = ns.reserve(2).tree.unwrap();
        let from = digest(2, 2);
        let mut seen = Vec::new();
        tree.reduce_from_live(Some(&from), |r| {
            seen.push(r.digest);
            true
        });
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], from);
    }
}
