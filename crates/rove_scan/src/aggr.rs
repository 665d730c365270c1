//! Aggregation scan: collect each slice's surviving digests, then drive
//! the registered aggregation function over them, streaming emitted
//! values back on the client connection.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{info, warn};

use crate::conn::ConnJob;
use crate::job::{JobCore, JobStat, ResultCode, ScanError, ScanJob, INVALID_SET_ID};
use crate::msg::{self, FieldType};
use crate::namespace::{Namespace, Reservation};
use crate::proto::{ChunkBuffer, CHUNK_LIMIT};
use crate::record::{Digest, Particle};
use crate::scan::{
    self, convert_old_priority, get_scan_options, get_scan_rps, get_scan_set,
    get_scan_socket_timeout, ScanService, Transaction,
};
use crate::udf::{RecordView, UdfDef};

/// Digests collected per list node before a new one is appended.
pub const KEYS_PER_CHUNK: usize = 512;

/// Engine-level aggregation error codes.
pub const AGGR_ERR_UDF_NOT_FOUND: u32 = 100;
pub const AGGR_ERR_EXECUTION: u32 = 101;

pub(crate) struct AggrCall {
    pub def: UdfDef,
}

pub(crate) struct AggrScanJob {
    conn: ConnJob,
    core: JobCore,
    call: AggrCall,
}

pub(crate) fn start(
    svc: &ScanService,
    tr: &mut Transaction,
    ns: &Arc<Namespace>,
) -> Result<(), ScanError> {
    if svc.cfg.udf_execution_disabled {
        warn!(client = %tr.client, "aggregation scan job forbidden");
        return Err(ScanError::new(ResultCode::Forbidden, "UDF execution disabled"));
    }

    let (set_name, set_id) = get_scan_set(tr, ns)?;
    let options = get_scan_options(tr)?;
    let mut rps = get_scan_rps(tr)?;
    let timeout = get_scan_socket_timeout(tr, ns)?;

    if set_id == INVALID_SET_ID && !set_name.is_empty() {
        return Err(ScanError::new(ResultCode::NotFound, "unknown scan set"));
    }

    if tr.msg.has_field(FieldType::Predicate) {
        warn!(client = %tr.client, "aggregation scans do not support predicate filters");
        return Err(ScanError::new(
            ResultCode::UnsupportedFeature,
            "predicate on aggregation scan",
        ));
    }

    convert_old_priority(options.priority, &mut rps);

    let Some(def) = UdfDef::from_msg(&tr.msg) else {
        warn!(client = %tr.client, "aggregation scan job failed call init");
        return Err(ScanError::new(ResultCode::Parameter, "bad aggregation call"));
    };

    let core = JobCore::new(
        tr.trid,
        ns.clone(),
        set_name,
        set_id,
        None,
        rps,
        tr.client.clone(),
    );

    let sink = tr
        .sink
        .take()
        .ok_or_else(|| ScanError::new(ResultCode::Parameter, "scan has no client connection"))?;

    let job = Arc::new(AggrScanJob {
        conn: ConnJob::own(sink, timeout, tr.compress),
        core,
        call: AggrCall { def },
    });

    info!(
        trid = job.core.trid,
        ns = %ns.name,
        set = %job.core.set_name,
        rps = job.core.rps,
        socket_timeout = timeout,
        client = %job.core.client,
        "starting aggregation scan job"
    );

    if let Err(err) = svc.manager().start_job(job.clone()) {
        warn!(trid = job.core.trid, error = %err, "aggregation scan job failed to start");
        if let Some(sink) = job.conn.take_back() {
            tr.sink = Some(sink);
        }
        return Err(err);
    }

    Ok(())
}

/// Linked list of fixed-size digest chunks, built per slice.
pub(crate) struct DigestList {
    chunks: Vec<Vec<Digest>>,
}

impl DigestList {
    pub fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    pub fn push(&mut self, digest: Digest) {
        match self.chunks.last_mut() {
            Some(tail) if tail.len() < KEYS_PER_CHUNK => tail.push(digest),
            _ => {
                let mut chunk = Vec::with_capacity(KEYS_PER_CHUNK);
                chunk.push(digest);
                self.chunks.push(chunk);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Digest> {
        self.chunks.iter().flatten()
    }
}

/// Callbacks the aggregation pipeline makes into its owning slice.
pub(crate) trait AggrHooks {
    /// The pid argument is deliberately unused: the pipeline never leaves
    /// the slice's partition, so the current reservation is returned
    /// regardless. Extensions that re-dispatch across partitions must
    /// revisit this.
    fn ptn_reserve(&mut self, pid: u32) -> &Reservation;

    /// Encode one emitted value; false when the stream is gone.
    fn ostream_write(&mut self, val: Particle) -> bool;
}

pub(crate) struct AggrError {
    pub code: u32,
    pub detail: Option<String>,
}

fn module_err_string(code: u32) -> String {
    format!("UDF error {code}")
}

/// Run the registered aggregation over the collected digests.
pub(crate) fn process(
    ns: &Namespace,
    call: &AggrCall,
    digests: &DigestList,
    hooks: &mut dyn AggrHooks,
) -> Result<(), AggrError> {
    let Some(aggr_fn) = ns.udfs.aggregation(&call.def) else {
        return Err(AggrError {
            code: AGGR_ERR_UDF_NOT_FOUND,
            detail: Some(format!("{}:{}", call.def.module, call.def.function)),
        });
    };

    let mut views = Vec::with_capacity(digests.len());
    for keyd in digests.iter() {
        let rsv = hooks.ptn_reserve(keyd.partition_id());
        let Some(tree) = &rsv.tree else {
            continue;
        };
        let Some(handle) = tree.get(keyd) else {
            // Deleted since collection.
            continue;
        };
        let Ok(r) = handle.lock() else {
            continue;
        };
        if !r.is_live() || r.is_doomed() {
            continue;
        }
        views.push(RecordView::of(&r));
    }

    aggr_fn(&views, &mut |val| hooks.ostream_write(val)).map_err(|detail| AggrError {
        code: AGGR_ERR_EXECUTION,
        detail: Some(detail),
    })
}

struct AggrSlice<'a> {
    job: &'a AggrScanJob,
    rsv: &'a Reservation,
    bb: ChunkBuffer,
}

impl AggrSlice<'_> {
    fn write_val(&mut self, val: &Particle, success: bool) -> bool {
        msg::make_val_response(&mut self.bb, val, success);
        if self.bb.payload_len() > CHUNK_LIMIT {
            if !self.job.conn.send_chunk(&self.job.core, &mut self.bb) {
                return false;
            }
            self.bb.reset();
        }
        true
    }
}

impl AggrHooks for AggrSlice<'_> {
    fn ptn_reserve(&mut self, _pid: u32) -> &Reservation {
        self.rsv
    }

    fn ostream_write(&mut self, val: Particle) -> bool {
        if self.job.core.abandoned().is_some() {
            return false;
        }
        self.write_val(&val, true)
    }
}

impl ScanJob for AggrScanJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn slice(&self, rsv: &Reservation) {
        let core = &self.core;
        let Some(tree) = &rsv.tree else {
            return;
        };

        let mut digests = DigestList::new();
        tree.reduce_live(|r| {
            if core.abandoned().is_some() {
                return false;
            }
            if core.excluded_set(&r) || r.is_doomed() {
                return true;
            }
            let keyd = r.digest;
            drop(r);
            digests.push(keyd);
            core.n_succeeded.fetch_add(1, Ordering::Relaxed);
            core.throttle_sleep();
            true
        });

        if digests.len() == 0 {
            return;
        }

        let mut slice = AggrSlice {
            job: self,
            rsv,
            bb: ChunkBuffer::new(),
        };

        if let Err(err) = process(&core.ns, &self.call, &digests, &mut slice) {
            let mut reason = module_err_string(err.code);
            if let Some(detail) = err.detail {
                reason.push_str(" : ");
                reason.push_str(&detail);
            }
            warn!(trid = core.trid, reason = %reason, "aggregation scan job failed");
            slice.write_val(&Particle::Str(reason), false);
            core.abandon(ResultCode::Unknown);
        }

        if slice.bb.payload_len() > 0 {
            self.conn.send_chunk(core, &mut slice.bb);
        }
    }

    fn finish(&self) {
        self.conn.finish(&self.core);

        let stats = &self.core.ns.scan_stats;
        match self.core.abandon_code() {
            ResultCode::Ok => stats.n_scan_aggr_complete.fetch_add(1, Ordering::Relaxed),
            ResultCode::UserAbort => stats.n_scan_aggr_abort.fetch_add(1, Ordering::Relaxed),
            _ => stats.n_scan_aggr_error.fetch_add(1, Ordering::Relaxed),
        };

        info!(
            trid = self.core.trid,
            reason = ?self.core.abandon_code(),
            "finished aggregation scan job"
        );
    }

    fn info(&self) -> JobStat {
        let mut stat = self.core.base_stat(scan::ScanType::Aggr.as_str());
        self.conn.info_into(&mut stat);
        stat
    }
}
