//! Background scans: UDF-invoking and multi-op write fan-out.
//!
//! Both flavors reply `fin(Ok)` as soon as the manager admits the job and
//! then run asynchronously, submitting one internal write sub-transaction
//! per surviving record. In-flight fan-out is capped per job; `finish`
//! waits for every submitted sub-transaction's completion callback.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{info, warn};

use crate::conn::ResponseSink;
use crate::job::{JobCore, JobStat, ResultCode, ScanError, ScanJob, INVALID_SET_ID};
use crate::msg::{
    self, Msg, MsgOp, OpType, INFO1_READ, INFO2_DURABLE_DELETE, INFO2_WRITE, INFO3_REPLACE_ONLY,
    INFO3_UPDATE_ONLY,
};
use crate::namespace::{Namespace, Reservation};
use crate::predicate::{Predicate, TriState};
use crate::record::Record;
use crate::scan::{
    self, convert_old_priority, get_scan_options, get_scan_predicate, get_scan_rps, get_scan_set,
    validate_background_scan_rps, ScanService, Transaction,
};
use crate::service::{InternalTxn, ServiceQueue};
use crate::udf::UdfDef;

/// In-flight sub-transaction cap per job. Staying below target rps beats
/// queue buildup and sub-transaction timeouts.
const MAX_ACTIVE_TRANSACTIONS: u32 = 200;

/// Origin template for UDF sub-transactions, shared by every transaction
/// the job submits. The job handle is weak: completions that outlive the
/// job resolve to a no-op.
pub struct UdfOrigin {
    pub(crate) predicate: Option<Predicate>,
    pub(crate) def: UdfDef,
    pub(crate) msg: Msg,
    job: Weak<UdfBgScanJob>,
}

impl UdfOrigin {
    pub(crate) fn complete(&self, result: ResultCode) {
        if let Some(job) = self.job.upgrade() {
            job.tr_complete(result);
        }
    }
}

/// Origin template for write-op sub-transactions.
pub struct OpsOrigin {
    pub(crate) predicate: Option<Predicate>,
    pub(crate) msg: Msg,
    job: Weak<OpsBgScanJob>,
}

impl OpsOrigin {
    pub(crate) fn complete(&self, result: ResultCode) {
        if let Some(job) = self.job.upgrade() {
            job.tr_complete(result);
        }
    }
}

pub(crate) struct UdfBgScanJob {
    core: JobCore,
    n_active_tr: AtomicU32,
    origin: Arc<UdfOrigin>,
    queue: Arc<dyn ServiceQueue>,
}

pub(crate) struct OpsBgScanJob {
    core: JobCore,
    n_active_tr: AtomicU32,
    origin: Arc<OpsOrigin>,
    queue: Arc<dyn ServiceQueue>,
}

pub(crate) fn start_udf(
    svc: &ScanService,
    tr: &mut Transaction,
    ns: &Arc<Namespace>,
) -> Result<(), ScanError> {
    if svc.cfg.udf_execution_disabled {
        warn!(client = %tr.client, "udf-bg scan job forbidden");
        return Err(ScanError::new(ResultCode::Forbidden, "UDF execution disabled"));
    }

    let (set_name, set_id) = get_scan_set(tr, ns)?;
    let options = get_scan_options(tr)?;
    let mut rps = get_scan_rps(tr)?;

    if set_id == INVALID_SET_ID && !set_name.is_empty() {
        return Err(ScanError::new(ResultCode::NotFound, "unknown scan set"));
    }

    convert_old_priority(options.priority, &mut rps);
    validate_background_scan_rps(ns, &mut rps)?;

    let predicate = get_scan_predicate(tr)?;
    let Some(def) = UdfDef::from_msg(&tr.msg) else {
        warn!(client = %tr.client, "udf-bg scan job failed def init");
        return Err(ScanError::new(ResultCode::Parameter, "bad udf call"));
    };

    let info2 = INFO2_WRITE | (tr.msg.info2 & INFO2_DURABLE_DELETE);
    let template = msg::make_internal(&ns.name, info2, 0, Vec::new());

    let job = Arc::new_cyclic(|me: &Weak<UdfBgScanJob>| UdfBgScanJob {
        core: JobCore::new(
            tr.trid,
            ns.clone(),
            set_name,
            set_id,
            None,
            rps,
            tr.client.clone(),
        ),
        n_active_tr: AtomicU32::new(0),
        origin: Arc::new(UdfOrigin {
            predicate,
            def,
            msg: template,
            job: me.clone(),
        }),
        queue: svc.queue(),
    });

    info!(
        trid = job.core.trid,
        ns = %ns.name,
        set = %job.core.set_name,
        rps = job.core.rps,
        udf_module = %job.origin.def.module,
        udf_function = %job.origin.def.function,
        client = %job.core.client,
        "starting udf-bg scan job"
    );

    svc.manager().start_job(job.clone()).map_err(|err| {
        warn!(trid = job.core.trid, error = %err, "udf-bg scan job failed to start");
        err
    })?;

    send_bg_fin(tr, ns);
    Ok(())
}

pub(crate) fn start_ops(
    svc: &ScanService,
    tr: &mut Transaction,
    ns: &Arc<Namespace>,
) -> Result<(), ScanError> {
    let (set_name, set_id) = get_scan_set(tr, ns)?;
    let _options = get_scan_options(tr)?;
    let mut rps = get_scan_rps(tr)?;

    if set_id == INVALID_SET_ID && !set_name.is_empty() {
        return Err(ScanError::new(ResultCode::NotFound, "unknown scan set"));
    }

    validate_background_scan_rps(ns, &mut rps)?;

    let ops = validate_ops(&tr.msg)?;
    let predicate = get_scan_predicate(tr)?;

    let info2 = INFO2_WRITE | (tr.msg.info2 & INFO2_DURABLE_DELETE);
    let info3 = INFO3_UPDATE_ONLY | (tr.msg.info3 & INFO3_REPLACE_ONLY);
    let template = msg::make_internal(&ns.name, info2, info3, ops);

    let job = Arc::new_cyclic(|me: &Weak<OpsBgScanJob>| OpsBgScanJob {
        core: JobCore::new(
            tr.trid,
            ns.clone(),
            set_name,
            set_id,
            None,
            rps,
            tr.client.clone(),
        ),
        n_active_tr: AtomicU32::new(0),
        origin: Arc::new(OpsOrigin {
            predicate,
            msg: template,
            job: me.clone(),
        }),
        queue: svc.queue(),
    });

    info!(
        trid = job.core.trid,
        ns = %ns.name,
        set = %job.core.set_name,
        rps = job.core.rps,
        n_ops = job.origin.msg.ops.len(),
        client = %job.core.client,
        "starting ops-bg scan job"
    );

    svc.manager().start_job(job.clone()).map_err(|err| {
        warn!(trid = job.core.trid, error = %err, "ops-bg scan job failed to start");
        err
    })?;

    send_bg_fin(tr, ns);
    Ok(())
}

/// Synchronous `fin(Ok)` right after admission; the job's side effects
/// happen off this connection. A failed fin cannot be reported, so the
/// connection is just force-closed.
fn send_bg_fin(tr: &mut Transaction, ns: &Namespace) {
    let Some(mut sink) = tr.sink.take() else {
        return;
    };
    let timeout = bg_fin_timeout_ms(ns);
    let frame = msg::fin_frame(ResultCode::Ok);
    if let Err(err) = sink.send_all(&frame, timeout, false) {
        warn!(error = ?err, "background scan job error sending fin");
        sink.force_close();
    }
}

fn bg_fin_timeout_ms(ns: &Namespace) -> i64 {
    match ns.config.default_socket_timeout_ms {
        0 => -1,
        ms => ms as i64,
    }
}

/// Reported as the background job's total client traffic: only the
/// synchronous fin - sub-transaction writes are not accounted here.
fn bg_net_io_bytes() -> u64 {
    msg::fin_frame(ResultCode::Ok).len() as u64
}

fn validate_ops(m: &Msg) -> Result<Vec<MsgOp>, ScanError> {
    if m.info1 & INFO1_READ != 0 || m.ops.iter().any(|op| op.op == OpType::Read) {
        warn!("ops-bg scan ops not write only");
        return Err(ScanError::new(ResultCode::Parameter, "ops not write only"));
    }
    if m.ops.is_empty() {
        warn!("ops-bg scan has no ops");
        return Err(ScanError::new(ResultCode::Parameter, "no ops"));
    }
    Ok(m.ops.clone())
}

fn drain_active(n_active_tr: &AtomicU32) {
    while n_active_tr.load(Ordering::SeqCst) != 0 {
        std::thread::sleep(Duration::from_micros(100));
    }
}

fn completion_counters(core: &JobCore, result: ResultCode) {
    match result {
        ResultCode::Ok => {
            core.n_succeeded.fetch_add(1, Ordering::Relaxed);
        }
        // Record deleted after the transaction was generated.
        ResultCode::NotFound => {}
        ResultCode::FilteredOut => {
            core.n_filtered_bins.fetch_add(1, Ordering::Relaxed);
        }
        _ => {
            core.n_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl UdfBgScanJob {
    fn visit(&self, r: std::sync::MutexGuard<'_, Record>) -> bool {
        let core = &self.core;
        if core.abandoned().is_some() {
            return false;
        }
        if core.excluded_set(&r) || r.is_doomed() {
            return true;
        }
        if let Some(predicate) = &self.origin.predicate {
            if predicate.matches_metadata(&r) == TriState::False {
                core.n_filtered_meta.fetch_add(1, Ordering::Relaxed);
                core.ns
                    .scan_stats
                    .n_udf_sub_filtered_out
                    .fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }

        let keyd = r.digest;
        // Release the record lock before throttling and enqueuing.
        drop(r);

        while self.n_active_tr.load(Ordering::SeqCst) > MAX_ACTIVE_TRANSACTIONS {
            std::thread::sleep(Duration::from_millis(1));
        }
        core.throttle_sleep();

        self.n_active_tr.fetch_add(1, Ordering::SeqCst);
        self.queue.enqueue(InternalTxn::Udf {
            ns: core.ns.clone(),
            keyd,
            origin: self.origin.clone(),
        });
        true
    }

    fn tr_complete(&self, result: ResultCode) {
        self.n_active_tr.fetch_sub(1, Ordering::SeqCst);
        completion_counters(&self.core, result);
    }
}

impl ScanJob for UdfBgScanJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn slice(&self, rsv: &Reservation) {
        let Some(tree) = &rsv.tree else {
            return;
        };
        tree.reduce_live(|r| self.visit(r));
    }

    fn finish(&self) {
        drain_active(&self.n_active_tr);

        let stats = &self.core.ns.scan_stats;
        match self.core.abandon_code() {
            ResultCode::Ok => stats.n_scan_udf_bg_complete.fetch_add(1, Ordering::Relaxed),
            ResultCode::UserAbort => stats.n_scan_udf_bg_abort.fetch_add(1, Ordering::Relaxed),
            _ => stats.n_scan_udf_bg_error.fetch_add(1, Ordering::Relaxed),
        };

        info!(
            trid = self.core.trid,
            reason = ?self.core.abandon_code(),
            "finished udf-bg scan job"
        );
    }

    fn info(&self) -> JobStat {
        let mut stat = self.core.base_stat(scan::ScanType::UdfBg.as_str());
        stat.net_io_bytes = bg_net_io_bytes();
        stat.socket_timeout_ms = bg_fin_timeout_ms(&self.core.ns);
        stat.extra = format!(
            "udf-filename={} udf-function={} udf-active={}",
            self.origin.def.module,
            self.origin.def.function,
            self.n_active_tr.load(Ordering::Relaxed)
        );
        stat
    }
}

impl OpsBgScanJob {
    fn visit(&self, r: std::sync::MutexGuard<'_, Record>) -> bool {
        let core = &self.core;
        if core.abandoned().is_some() {
            return false;
        }
        if core.excluded_set(&r) || r.is_doomed() {
            return true;
        }
        if let Some(predicate) = &self.origin.predicate {
            if predicate.matches_metadata(&r) == TriState::False {
                core.n_filtered_meta.fetch_add(1, Ordering::Relaxed);
                core.ns
                    .scan_stats
                    .n_ops_sub_filtered_out
                    .fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }

        let keyd = r.digest;
        // Release the record lock before throttling and enqueuing.
        drop(r);

        while self.n_active_tr.load(Ordering::SeqCst) > MAX_ACTIVE_TRANSACTIONS {
            std::thread::sleep(Duration::from_millis(1));
        }
        core.throttle_sleep();

        self.n_active_tr.fetch_add(1, Ordering::SeqCst);
        self.queue.enqueue(InternalTxn::Ops {
            ns: core.ns.clone(),
            keyd,
            origin: self.origin.clone(),
        });
        true
    }

    fn tr_complete(&self, result: ResultCode) {
        self.n_active_tr.fetch_sub(1, Ordering::SeqCst);
        completion_counters(&self.core, result);
    }
}

impl ScanJob for OpsBgScanJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn slice(&self, rsv: &Reservation) {
        let Some(tree) = &rsv.tree else {
            return;
        };
        tree.reduce_live(|r| self.visit(r));
    }

    fn finish(&self) {
        drain_active(&self.n_active_tr);

        let stats = &self.core.ns.scan_stats;
        match self.core.abandon_code() {
            ResultCode::Ok => stats.n_scan_ops_bg_complete.fetch_add(1, Ordering::Relaxed),
            ResultCode::UserAbort => stats.n_scan_ops_bg_abort.fetch_add(1, Ordering::Relaxed),
            _ => stats.n_scan_ops_bg_error.fetch_add(1, Ordering::Relaxed),
        };

        info!(
            trid = self.core.trid,
            reason = ?self.core.abandon_code(),
            "finished ops-bg scan job"
        );
    }

    fn info(&self) -> JobStat {
        let mut stat = self.core.base_stat(scan::ScanType::OpsBg.as_str());
        stat.net_io_bytes = bg_net_io_bytes();
        stat.socket_timeout_ms = bg_fin_timeout_ms(&self.core.ns);
        stat.extra = format!("ops-active={}", self.n_active_tr.load(Ordering::Relaxed));
        stat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::FieldType;
    use crate::record::Particle;

    #[test]
    fn ops_validation_rejects_reads_and_empty_lists() {
        let mut m = Msg {
            ops: vec![MsgOp::write("a", Particle::Int(1))],
            ..Msg::default()
        };
        assert_eq!(validate_ops(&m).unwrap().len(), 1);

        m.info1 = INFO1_READ;
        assert_eq!(validate_ops(&m).unwrap_err().code, ResultCode::Parameter);

        m.info1 = 0;
        m.ops.push(MsgOp::read("b"));
        assert_eq!(validate_ops(&m).unwrap_err().code, ResultCode::Parameter);

        let empty = Msg::default();
        assert_eq!(validate_ops(&empty).unwrap_err().code, ResultCode::Parameter);
    }

    #[test]
    fn internal_template_composes_info_bits() {
        let client = Msg {
            info2: INFO2_DURABLE_DELETE | INFO2_WRITE,
            info3: INFO3_REPLACE_ONLY | 0x40,
            ..Msg::default()
        };
        let info2 = INFO2_WRITE | (client.info2 & INFO2_DURABLE_DELETE);
        let info3 = INFO3_UPDATE_ONLY | (client.info3 & INFO3_REPLACE_ONLY);
        let template = msg::make_internal("test", info2, info3, Vec::new());

        assert_eq!(template.info2, INFO2_WRITE | INFO2_DURABLE_DELETE);
        assert_eq!(template.info3, INFO3_UPDATE_ONLY | INFO3_REPLACE_ONLY);
        assert_eq!(
            template.field(FieldType::Namespace).unwrap().data,
            b"test".to_vec()
        );
    }

    #[test]
    fn bg_net_io_is_the_fin_size_only() {
        assert_eq!(
            bg_net_io_bytes(),
            msg::fin_frame(ResultCode::Ok).len() as u64
        );
    }
}
