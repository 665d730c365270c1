//! Basic scan: per-partition iteration streaming record responses back
//! on the client connection, with optional predicate filtering, bin
//! selection, and bounded sampling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::conn::ConnJob;
use crate::job::{JobCore, JobStat, ResultCode, ScanError, ScanJob, INVALID_SET_ID};
use crate::msg::{self, INFO1_GET_NO_BINS};
use crate::namespace::{Namespace, Reservation};
use crate::predicate::{Predicate, TriState};
use crate::proto::{ChunkBuffer, CHUNK_LIMIT};
use crate::record::{Record, BIN_NAME_MAX, N_PARTITIONS};
use crate::scan::{
    self, convert_old_priority, get_scan_options, get_scan_pids, get_scan_predicate, get_scan_rps,
    get_scan_sample_max, get_scan_set, get_scan_socket_timeout, ScanService, Transaction,
};

/// Slack added to each partition's sample allocation so population spread
/// across partitions cannot starve the global target.
const SAMPLE_MARGIN: u64 = 4;

pub(crate) struct BasicScanJob {
    conn: ConnJob,
    core: JobCore,
    cluster_key: u64,
    fail_on_cluster_change: bool,
    no_bin_data: bool,
    sample_pct: u8,
    sample_max: u64,
    sample_count: AtomicU64,
    max_per_partition: u64,
    predicate: Option<Predicate>,
    bin_names: Option<Vec<String>>,
}

pub(crate) fn start(
    svc: &ScanService,
    tr: &mut Transaction,
    ns: &Arc<Namespace>,
) -> Result<(), ScanError> {
    let (set_name, set_id) = get_scan_set(tr, ns)?;
    let options = get_scan_options(tr)?;
    let pids = get_scan_pids(tr)?;
    let sample_max = get_scan_sample_max(tr)?;
    let mut rps = get_scan_rps(tr)?;
    let timeout = get_scan_socket_timeout(tr, ns)?;

    if pids.is_none() && set_id == INVALID_SET_ID && !set_name.is_empty() {
        // Only legacy scans reject here - partition-list scans must
        // produce per-partition markers instead.
        return Err(ScanError::new(ResultCode::NotFound, "unknown scan set"));
    }

    let predicate = get_scan_predicate(tr)?;
    convert_old_priority(options.priority, &mut rps);

    let bin_names = bin_names_from_ops(tr)?;
    let no_bin_data = tr.msg.info1 & INFO1_GET_NO_BINS != 0;

    if options.fail_on_cluster_change && ns.cluster.migrations_active() {
        warn!(client = %tr.client, "basic scan job not started - migration");
        return Err(ScanError::new(
            ResultCode::ClusterKeyMismatch,
            "migrations in progress",
        ));
    }

    let core = JobCore::new(
        tr.trid,
        ns.clone(),
        set_name,
        set_id,
        pids,
        rps,
        tr.client.clone(),
    );
    let max_per_partition = sample_max_init(
        sample_max,
        options.sample_pct,
        core.n_pids_requested,
        ns.cluster.size(),
    );

    // Take ownership of the connection from the transaction.
    let sink = tr
        .sink
        .take()
        .ok_or_else(|| ScanError::new(ResultCode::Parameter, "scan has no client connection"))?;

    let job = Arc::new(BasicScanJob {
        conn: ConnJob::own(sink, timeout, tr.compress),
        cluster_key: ns.cluster.key(),
        fail_on_cluster_change: options.fail_on_cluster_change,
        no_bin_data,
        sample_pct: options.sample_pct,
        sample_max,
        sample_count: AtomicU64::new(0),
        max_per_partition,
        predicate,
        bin_names,
        core,
    });

    info!(
        trid = job.core.trid,
        ns = %ns.name,
        set = %job.core.set_name,
        n_pids_requested = job.core.n_pids_requested,
        rps = job.core.rps,
        sample_mode = if sample_max == 0 { "pct" } else { "max" },
        sample = if sample_max == 0 { job.sample_pct as u64 } else { sample_max },
        metadata_only = job.no_bin_data,
        fail_on_cluster_change = job.fail_on_cluster_change,
        socket_timeout = timeout,
        client = %job.core.client,
        "starting basic scan job"
    );

    if let Err(err) = svc.manager().start_job(job.clone()) {
        warn!(trid = job.core.trid, error = %err, "basic scan job failed to start");
        if let Some(sink) = job.conn.take_back() {
            tr.sink = Some(sink);
        }
        return Err(err);
    }

    Ok(())
}

struct BasicSlice {
    bb: ChunkBuffer,
    limit: u64,
    count: u64,
}

impl ScanJob for BasicScanJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn slice(&self, rsv: &Reservation) {
        let core = &self.core;
        let mut slice = BasicSlice {
            bb: ChunkBuffer::new(),
            limit: 0,
            count: 0,
        };

        let Some(tree) = &rsv.tree else {
            // Unservable partition - only reachable with a partition list.
            msg::make_pid_done(&mut slice.bb, rsv.pid, ResultCode::Unavailable);
            self.conn.send_chunk(core, &mut slice.bb);
            return;
        };

        if core.set_id == INVALID_SET_ID && !core.set_name.is_empty() {
            // Legacy scans already rejected the unknown set at start.
            msg::make_pid_done(&mut slice.bb, rsv.pid, ResultCode::Ok);
            self.conn.send_chunk(core, &mut slice.bb);
            return;
        }

        let started = Instant::now();
        let from = core.resume_digest(rsv.pid);

        if self.max_per_partition != 0 {
            if self.sample_count.load(Ordering::Relaxed) < self.sample_max {
                tree.reduce_from_live(from.as_ref(), |r| self.visit(&mut slice, &r));
            }
        } else if self.sample_pct != 100 {
            slice.limit = tree.size() * self.sample_pct as u64 / 100;
            if slice.limit != 0 {
                tree.reduce_from(from.as_ref(), |r| self.visit(&mut slice, &r));
            }
        } else {
            // 100% - no limit.
            tree.reduce_from_live(from.as_ref(), |r| self.visit(&mut slice, &r));
        }

        if core.pids.is_some() {
            msg::make_pid_done(&mut slice.bb, rsv.pid, ResultCode::Ok);
        }
        if slice.bb.payload_len() > 0 {
            self.conn.send_chunk(core, &mut slice.bb);
        }

        debug!(
            trid = core.trid,
            pid = rsv.pid,
            took_ms = started.elapsed().as_millis() as u64,
            "basic scan slice done"
        );
    }

    fn finish(&self) {
        self.conn.finish(&self.core);

        let stats = &self.core.ns.scan_stats;
        match self.core.abandon_code() {
            ResultCode::Ok => stats.n_scan_basic_complete.fetch_add(1, Ordering::Relaxed),
            ResultCode::UserAbort => stats.n_scan_basic_abort.fetch_add(1, Ordering::Relaxed),
            _ => stats.n_scan_basic_error.fetch_add(1, Ordering::Relaxed),
        };

        info!(
            trid = self.core.trid,
            reason = ?self.core.abandon_code(),
            "finished basic scan job"
        );
    }

    fn info(&self) -> JobStat {
        let mut stat = self.core.base_stat(scan::ScanType::Basic.as_str());
        self.conn.info_into(&mut stat);
        stat
    }
}

impl BasicScanJob {
    /// Ordered per-record policy; returns false to stop this partition.
    fn visit(&self, slice: &mut BasicSlice, r: &Record) -> bool {
        let core = &self.core;

        if core.abandoned().is_some() {
            return false;
        }

        if self.fail_on_cluster_change && self.cluster_key != core.ns.cluster.key() {
            core.abandon(ResultCode::ClusterKeyMismatch);
            return false;
        }

        if slice.limit != 0 {
            // Sample-pct counts pre-filter visits; the visit that reaches
            // the limit stops before emitting, so the last visited record
            // is always skipped.
            if slice.count == slice.limit {
                return false;
            }
            slice.count += 1;

            // Tombstones count toward the limit but are not emitted.
            if !r.is_live() {
                return true;
            }
        }

        if core.excluded_set(r) || r.is_doomed() {
            return true;
        }

        let mut bin_predicate = None;
        if let Some(predicate) = &self.predicate {
            match predicate.matches_metadata(r) {
                TriState::False => {
                    core.n_filtered_meta.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                TriState::Unknown => bin_predicate = Some(predicate),
                TriState::True => {}
            }
        }

        if let Some(predicate) = bin_predicate {
            if !predicate.matches_bins(r) {
                core.n_filtered_bins.fetch_add(1, Ordering::Relaxed);
                if !core.ns.config.storage_data_in_memory {
                    core.throttle_sleep();
                }
                return true;
            }
        }

        let mut last_sample = false;
        if self.max_per_partition != 0 {
            // Sample-max counts post-filter survivors.
            let count = self.sample_count.fetch_add(1, Ordering::Relaxed) + 1;
            if count > self.sample_max {
                return false;
            }
            if count == self.sample_max {
                last_sample = true;
            }
        }

        let set_name = core.ns.set_name(r.set_id);
        if self.no_bin_data {
            msg::make_record_response(&mut slice.bb, r, set_name.as_deref(), true, None);
        } else {
            if r.unreadable {
                warn!(trid = core.trid, "record unreadable");
                core.n_failed.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            msg::make_record_response(
                &mut slice.bb,
                r,
                set_name.as_deref(),
                false,
                self.bin_names.as_deref(),
            );
        }

        core.n_succeeded.fetch_add(1, Ordering::Relaxed);

        if last_sample {
            return false;
        }

        core.throttle_sleep();

        // Past the chunk limit, flush and start a fresh frame. A failed
        // send has already abandoned the job; the next visit stops.
        if slice.bb.payload_len() > CHUNK_LIMIT {
            if !self.conn.send_chunk(core, &mut slice.bb) {
                return true;
            }
            slice.bb.reset();
        }

        true
    }
}

/// Bin-name projection from the request's op names, deduplicated.
fn bin_names_from_ops(tr: &Transaction) -> Result<Option<Vec<String>>, ScanError> {
    if tr.msg.ops.is_empty() {
        return Ok(None);
    }
    let mut names: Vec<String> = Vec::with_capacity(tr.msg.ops.len());
    for op in &tr.msg.ops {
        if op.bin_name.len() > BIN_NAME_MAX {
            warn!(len = op.bin_name.len(), "basic scan job bin name too long");
            return Err(ScanError::new(ResultCode::BinName, "bin name too long"));
        }
        if !names.contains(&op.bin_name) {
            names.push(op.bin_name.clone());
        }
    }
    Ok(Some(names))
}

/// Split a global sample ceiling across partitions ahead of time.
fn sample_max_init(sample_max: u64, sample_pct: u8, n_pids_requested: u16, cluster_size: u32) -> u64 {
    if sample_max == 0 {
        // Sampling, if any, is percentage-driven.
        return 0;
    }

    if sample_pct != 100 {
        warn!(sample_max, sample_pct, "unexpected - scan has both sample-max and pct");
    }

    let mut n_pids = n_pids_requested as u64;
    if n_pids == 0 {
        warn!(sample_max, "unexpected - scan has sample-max but no pids");
        // Estimate this node's master count.
        n_pids = (N_PARTITIONS as u64 / cluster_size as u64).max(1);
    }

    (sample_max + n_pids - 1) / n_pids + SAMPLE_MARGIN
}
