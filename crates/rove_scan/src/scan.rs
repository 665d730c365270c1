//! Scan dispatch: request field parsing, scan-type selection, and the
//! public service façade over the scan manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::conn::ResponseSink;
use crate::job::{JobStat, PidRequest, ResultCode, ScanError, INVALID_SET_ID};
use crate::manager::ScanManager;
use crate::msg::{FieldType, Msg, INFO2_WRITE, UDF_OP_AGGREGATE, UDF_OP_BACKGROUND};
use crate::namespace::Namespace;
use crate::predicate::Predicate;
use crate::record::{Digest, DIGEST_SZ, N_PARTITIONS, SET_NAME_MAX};
use crate::service::{ServicePool, ServiceQueue};
use crate::{aggr, background, basic};

/// Rps assigned to legacy low-priority scans that did not set one.
pub const LOW_PRIORITY_RPS: u32 = 5000;

#[derive(Clone, Debug)]
pub struct ScanConfig {
    /// Threads driving per-partition slice callbacks.
    pub worker_threads: usize,
    pub max_active_jobs: usize,
    /// Finished jobs retained for monitoring.
    pub max_done_jobs: usize,
    /// Threads applying internal write sub-transactions.
    pub service_threads: usize,
    pub udf_execution_disabled: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_active_jobs: 16,
            max_done_jobs: 100,
            service_threads: 2,
            udf_execution_disabled: false,
        }
    }
}

static NEXT_TRID: AtomicU64 = AtomicU64::new(1 << 32);

/// A parsed client request plus its originating connection.
pub struct Transaction {
    pub trid: u64,
    pub msg: Msg,
    pub client: String,
    pub sink: Option<Box<dyn ResponseSink>>,
    pub compress: bool,
}

impl Transaction {
    /// The transaction id comes from the client when supplied, else a
    /// server-generated one.
    pub fn new(msg: Msg, client: impl Into<String>) -> Self {
        let trid = msg
            .field(FieldType::Trid)
            .and_then(|f| f.data.as_slice().try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or_else(|| NEXT_TRID.fetch_add(1, Ordering::Relaxed));
        Self {
            trid,
            msg,
            client: client.into(),
            sink: None,
            compress: false,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn ResponseSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn is_udf(&self) -> bool {
        self.msg.has_field(FieldType::UdfOp)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanType {
    Basic,
    Aggr,
    UdfBg,
    OpsBg,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Basic => "basic",
            ScanType::Aggr => "aggregation",
            ScanType::UdfBg => "background-udf",
            ScanType::OpsBg => "background-ops",
        }
    }
}

fn get_scan_type(tr: &Transaction) -> Option<ScanType> {
    if !tr.is_udf() {
        return Some(if tr.msg.info2 & INFO2_WRITE != 0 {
            ScanType::OpsBg
        } else {
            ScanType::Basic
        });
    }
    match tr.msg.field(FieldType::UdfOp)?.data.as_slice() {
        [UDF_OP_AGGREGATE] => Some(ScanType::Aggr),
        [UDF_OP_BACKGROUND] => Some(ScanType::UdfBg),
        _ => None,
    }
}

/// Public entry for the scan subsystem: dispatch, monitoring, abort.
pub struct ScanService {
    pub cfg: ScanConfig,
    manager: ScanManager,
    queue: Arc<dyn ServiceQueue>,
}

impl ScanService {
    /// Initialize the subsystem with its own internal-write service pool.
    pub fn init(cfg: ScanConfig) -> anyhow::Result<Self> {
        let queue = Arc::new(ServicePool::spawn(cfg.service_threads)?);
        Self::with_queue(cfg, queue)
    }

    /// Initialize against an externally supplied service queue.
    pub fn with_queue(cfg: ScanConfig, queue: Arc<dyn ServiceQueue>) -> anyhow::Result<Self> {
        let manager = ScanManager::new(&cfg)?;
        Ok(Self {
            cfg,
            manager,
            queue,
        })
    }

    /// Dispatch a scan request to the matching job start path. On error
    /// the connection stays with the transaction so the caller can report
    /// the result code itself.
    pub fn scan(&self, tr: &mut Transaction, ns: &Arc<Namespace>) -> Result<(), ScanError> {
        match get_scan_type(tr) {
            Some(ScanType::Basic) => basic::start(self, tr, ns),
            Some(ScanType::Aggr) => aggr::start(self, tr, ns),
            Some(ScanType::UdfBg) => background::start_udf(self, tr, ns),
            Some(ScanType::OpsBg) => background::start_ops(self, tr, ns),
            None => {
                warn!(client = %tr.client, "can't identify scan type");
                Err(ScanError::new(ResultCode::Parameter, "unknown scan type"))
            }
        }
    }

    pub fn get_jobstat(&self, trid: u64) -> Option<JobStat> {
        self.manager.get_job_info(trid)
    }

    pub fn get_jobstat_all(&self) -> Vec<JobStat> {
        self.manager.get_info()
    }

    pub fn abort_job(&self, trid: u64) -> bool {
        self.manager.abort_job(trid)
    }

    pub fn abort_all_jobs(&self) -> usize {
        self.manager.abort_all_jobs()
    }

    pub fn active_job_count(&self) -> usize {
        self.manager.active_job_count()
    }

    pub fn limit_finished_jobs(&self) {
        self.manager.limit_finished_jobs()
    }

    /// True once no job is active (all admitted jobs finished).
    pub fn drained(&self) -> bool {
        self.manager.drained()
    }

    pub(crate) fn manager(&self) -> &ScanManager {
        &self.manager
    }

    pub(crate) fn queue(&self) -> Arc<dyn ServiceQueue> {
        self.queue.clone()
    }
}

//
// Request field parsing. Each helper tolerates an absent field and fails
// with the canonical result code on a malformed one.
//

pub(crate) fn get_scan_set(tr: &Transaction, ns: &Namespace) -> Result<(String, u16), ScanError> {
    let Some(field) = tr.msg.field(FieldType::Set) else {
        return Ok((String::new(), INVALID_SET_ID));
    };
    if field.data.is_empty() {
        // As if no set name was sent - scan the whole namespace.
        return Ok((String::new(), INVALID_SET_ID));
    }
    if field.data.len() > SET_NAME_MAX {
        warn!(len = field.data.len(), "scan msg set name too long");
        return Err(ScanError::new(ResultCode::Parameter, "set name too long"));
    }
    let set_name = String::from_utf8(field.data.clone())
        .map_err(|_| ScanError::new(ResultCode::Parameter, "set name not utf-8"))?;
    let set_id = ns.set_id(&set_name);
    if set_id == INVALID_SET_ID {
        // Keep going - partition-list scans still need per-partition results.
        warn!(client = %tr.client, set = %set_name, "scan msg has unrecognized set");
    }
    Ok((set_name, set_id))
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ScanOptions {
    pub priority: u8,
    pub fail_on_cluster_change: bool,
    pub sample_pct: u8,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            fail_on_cluster_change: false,
            sample_pct: 100,
        }
    }
}

const SCAN_OPTIONS_FAIL_ON_CLUSTER_CHANGE: u8 = 0x08;

pub(crate) fn get_scan_options(tr: &Transaction) -> Result<ScanOptions, ScanError> {
    let Some(field) = tr.msg.field(FieldType::ScanOptions) else {
        return Ok(ScanOptions::default());
    };
    if field.data.len() != 2 {
        warn!(size = field.data.len(), "scan msg options field size not 2");
        return Err(ScanError::new(ResultCode::Parameter, "bad scan options"));
    }
    let sample_pct = field.data[1];
    if sample_pct > 100 {
        warn!(sample_pct, "scan msg sample pct out of range");
        return Err(ScanError::new(ResultCode::Parameter, "bad sample pct"));
    }
    Ok(ScanOptions {
        priority: field.data[0] >> 4,
        fail_on_cluster_change: field.data[0] & SCAN_OPTIONS_FAIL_ON_CLUSTER_CHANGE != 0,
        sample_pct,
    })
}

pub(crate) fn get_scan_pids(tr: &Transaction) -> Result<Option<Vec<PidRequest>>, ScanError> {
    let pid_field = tr.msg.field(FieldType::PidArray);
    let digest_field = tr.msg.field(FieldType::DigestArray);
    if pid_field.is_none() && digest_field.is_none() {
        return Ok(None);
    }

    let mut pids = vec![PidRequest::default(); N_PARTITIONS as usize];

    if let Some(field) = pid_field {
        if field.data.len() % 2 != 0 || field.data.len() / 2 > N_PARTITIONS as usize {
            warn!(size = field.data.len(), "bad pid array");
            return Err(ScanError::new(ResultCode::Parameter, "bad pid array"));
        }
        for chunk in field.data.chunks_exact(2) {
            let pid = u16::from_le_bytes([chunk[0], chunk[1]]) as u32;
            if pid >= N_PARTITIONS || pids[pid as usize].requested {
                warn!(pid, "bad or duplicate pid");
                return Err(ScanError::new(ResultCode::Parameter, "bad or duplicate pid"));
            }
            pids[pid as usize].requested = true;
        }
    }

    if let Some(field) = digest_field {
        if field.data.len() % DIGEST_SZ != 0 || field.data.len() / DIGEST_SZ > N_PARTITIONS as usize
        {
            warn!(size = field.data.len(), "bad digest array");
            return Err(ScanError::new(ResultCode::Parameter, "bad digest array"));
        }
        for chunk in field.data.chunks_exact(DIGEST_SZ) {
            let mut keyd = [0u8; DIGEST_SZ];
            keyd.copy_from_slice(chunk);
            let digest = Digest(keyd);
            let pid = digest.partition_id();
            if pids[pid as usize].requested {
                warn!(pid, "duplicate digest pid");
                return Err(ScanError::new(
                    ResultCode::Parameter,
                    "bad or duplicate digest pid",
                ));
            }
            pids[pid as usize] = PidRequest {
                requested: true,
                digest: Some(digest),
            };
        }
    }

    Ok(Some(pids))
}

pub(crate) fn get_scan_sample_max(tr: &Transaction) -> Result<u64, ScanError> {
    let Some(field) = tr.msg.field(FieldType::SampleMax) else {
        return Ok(0);
    };
    let bytes: [u8; 8] = field.data.as_slice().try_into().map_err(|_| {
        warn!(size = field.data.len(), "scan sample-max field size not 8");
        ScanError::new(ResultCode::Parameter, "bad sample-max")
    })?;
    Ok(u64::from_be_bytes(bytes))
}

pub(crate) fn get_scan_rps(tr: &Transaction) -> Result<u32, ScanError> {
    let Some(field) = tr.msg.field(FieldType::RecsPerSec) else {
        return Ok(0);
    };
    let bytes: [u8; 4] = field.data.as_slice().try_into().map_err(|_| {
        warn!(size = field.data.len(), "scan recs-per-sec field size not 4");
        ScanError::new(ResultCode::Parameter, "bad recs-per-sec")
    })?;
    Ok(u32::from_be_bytes(bytes))
}

pub(crate) fn get_scan_socket_timeout(
    tr: &Transaction,
    ns: &Namespace,
) -> Result<u32, ScanError> {
    let Some(field) = tr.msg.field(FieldType::SocketTimeout) else {
        return Ok(ns.config.default_socket_timeout_ms);
    };
    let bytes: [u8; 4] = field.data.as_slice().try_into().map_err(|_| {
        warn!(size = field.data.len(), "scan socket timeout field size not 4");
        ScanError::new(ResultCode::Parameter, "bad socket timeout")
    })?;
    Ok(u32::from_be_bytes(bytes))
}

pub(crate) fn get_scan_predicate(tr: &Transaction) -> Result<Option<Predicate>, ScanError> {
    let Some(field) = tr.msg.field(FieldType::Predicate) else {
        return Ok(None);
    };
    match Predicate::compile(&field.data) {
        Ok(predicate) => Ok(Some(predicate)),
        Err(err) => {
            warn!(error = %err, "scan predicate failed to compile");
            Err(ScanError::new(ResultCode::Parameter, "bad predicate"))
        }
    }
}

/// Old clients express pacing as a priority; translate low priority into
/// an rps ceiling when none was given.
pub(crate) fn convert_old_priority(priority: u8, rps: &mut u32) {
    if priority != 0 && *rps != 0 {
        warn!(rps = *rps, priority, "unexpected - scan has both rps and priority");
        return;
    }
    if priority == 1 && *rps == 0 {
        info!(rps = LOW_PRIORITY_RPS, "low-priority scan from old client");
        *rps = LOW_PRIORITY_RPS;
    }
}

pub(crate) fn validate_background_scan_rps(ns: &Namespace, rps: &mut u32) -> Result<(), ScanError> {
    if *rps > ns.config.background_scan_max_rps {
        warn!(
            rps = *rps,
            max = ns.config.background_scan_max_rps,
            "scan rps exceeds background-scan-max-rps"
        );
        return Err(ScanError::new(ResultCode::Parameter, "rps too high"));
    }
    if *rps == 0 {
        *rps = ns.config.background_scan_max_rps;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::MsgField;
    use crate::namespace::NamespaceConfig;
    use crate::predicate::build;

    fn tr(fields: Vec<MsgField>) -> Transaction {
        Transaction::new(
            Msg {
                fields,
                ..Msg::default()
            },
            "test-client",
        )
    }

    #[test]
    fn trid_is_taken_from_field_or_generated() {
        let with = tr(vec![MsgField::u64_be(FieldType::Trid, 77)]);
        assert_eq!(with.trid, 77);
        let a = tr(vec![]);
        let b = tr(vec![]);
        assert_ne!(a.trid, b.trid);
    }

    #[test]
    fn scan_type_selection_table() {
        let basic = tr(vec![]);
        assert_eq!(get_scan_type(&basic), Some(ScanType::Basic));

        let mut ops = tr(vec![]);
        ops.msg.info2 = INFO2_WRITE;
        assert_eq!(get_scan_type(&ops), Some(ScanType::OpsBg));

        let aggr = tr(vec![MsgField::u8(FieldType::UdfOp, UDF_OP_AGGREGATE)]);
        assert_eq!(get_scan_type(&aggr), Some(ScanType::Aggr));

        let udf_bg = tr(vec![MsgField::u8(FieldType::UdfOp, UDF_OP_BACKGROUND)]);
        assert_eq!(get_scan_type(&udf_bg), Some(ScanType::UdfBg));

        let unknown = tr(vec![MsgField::u8(FieldType::UdfOp, 9)]);
        assert_eq!(get_scan_type(&unknown), None);
    }

    #[test]
    fn set_parsing_tolerates_unknown_names() {
        let ns = Namespace::new("test", NamespaceConfig::default());
        ns.register_set("known").unwrap();

        let (name, id) = get_scan_set(&tr(vec![]), &ns).unwrap();
        assert_eq!((name.as_str(), id), ("", INVALID_SET_ID));

        let (name, id) =
            get_scan_set(&tr(vec![MsgField::str(FieldType::Set, "known")]), &ns).unwrap();
        assert_eq!((name.as_str(), id), ("known", 1));

        let (name, id) =
            get_scan_set(&tr(vec![MsgField::str(FieldType::Set, "mystery")]), &ns).unwrap();
        assert_eq!((name.as_str(), id), ("mystery", INVALID_SET_ID));

        let long = "x".repeat(SET_NAME_MAX + 1);
        let err = get_scan_set(&tr(vec![MsgField::str(FieldType::Set, &long)]), &ns).unwrap_err();
        assert_eq!(err.code, ResultCode::Parameter);
    }

    #[test]
    fn options_defaults_and_validation() {
        let options = get_scan_options(&tr(vec![])).unwrap();
        assert_eq!(options.sample_pct, 100);
        assert!(!options.fail_on_cluster_change);

        let options = get_scan_options(&tr(vec![MsgField::bytes(
            FieldType::ScanOptions,
            vec![0x18, 50],
        )]))
        .unwrap();
        assert_eq!(options.priority, 1);
        assert!(options.fail_on_cluster_change);
        assert_eq!(options.sample_pct, 50);

        let err = get_scan_options(&tr(vec![MsgField::u8(FieldType::ScanOptions, 0)])).unwrap_err();
        assert_eq!(err.code, ResultCode::Parameter);

        let err = get_scan_options(&tr(vec![MsgField::bytes(
            FieldType::ScanOptions,
            vec![0, 101],
        )]))
        .unwrap_err();
        assert_eq!(err.code, ResultCode::Parameter);
    }

    #[test]
    fn pid_list_rejects_bad_and_duplicate_ids() {
        assert!(get_scan_pids(&tr(vec![])).unwrap().is_none());

        let mut data = Vec::new();
        data.extend_from_slice(&5u16.to_le_bytes());
        data.extend_from_slice(&9u16.to_le_bytes());
        let pids = get_scan_pids(&tr(vec![MsgField::bytes(FieldType::PidArray, data.clone())]))
            .unwrap()
            .unwrap();
        assert!(pids[5].requested && pids[9].requested);
        assert!(!pids[0].requested);

        data.extend_from_slice(&5u16.to_le_bytes());
        let err = get_scan_pids(&tr(vec![MsgField::bytes(FieldType::PidArray, data)])).unwrap_err();
        assert_eq!(err.code, ResultCode::Parameter);

        let out_of_range = (N_PARTITIONS as u16).to_le_bytes().to_vec();
        let err = get_scan_pids(&tr(vec![MsgField::bytes(FieldType::PidArray, out_of_range)]))
            .unwrap_err();
        assert_eq!(err.code, ResultCode::Parameter);
    }

    #[test]
    fn digest_list_carries_resume_digest() {
        let mut digest = [3u8; DIGEST_SZ];
        digest[0] = 10;
        digest[1] = 0;
        let pids = get_scan_pids(&tr(vec![MsgField::bytes(
            FieldType::DigestArray,
            digest.to_vec(),
        )]))
        .unwrap()
        .unwrap();
        assert!(pids[10].requested);
        assert_eq!(pids[10].digest, Some(Digest(digest)));

        // Two digests landing in the same partition conflict.
        let mut data = digest.to_vec();
        let mut other = [4u8; DIGEST_SZ];
        other[0] = 10;
        other[1] = 0;
        data.extend_from_slice(&other);
        let err =
            get_scan_pids(&tr(vec![MsgField::bytes(FieldType::DigestArray, data)])).unwrap_err();
        assert_eq!(err.code, ResultCode::Parameter);
    }

    #[test]
    fn numeric_fields_validate_sizes() {
        let ns = Namespace::new("test", NamespaceConfig::default());

        assert_eq!(get_scan_sample_max(&tr(vec![])).unwrap(), 0);
        let v = get_scan_sample_max(&tr(vec![MsgField::u64_be(FieldType::SampleMax, 9)])).unwrap();
        assert_eq!(v, 9);
        assert!(
            get_scan_sample_max(&tr(vec![MsgField::u8(FieldType::SampleMax, 9)])).is_err()
        );

        assert_eq!(get_scan_rps(&tr(vec![])).unwrap(), 0);
        assert!(get_scan_rps(&tr(vec![MsgField::u8(FieldType::RecsPerSec, 1)])).is_err());

        assert_eq!(
            get_scan_socket_timeout(&tr(vec![]), &ns).unwrap(),
            ns.config.default_socket_timeout_ms
        );
        let v = get_scan_socket_timeout(
            &tr(vec![MsgField::u32_be(FieldType::SocketTimeout, 0)]),
            &ns,
        )
        .unwrap();
        assert_eq!(v, 0);
    }

    #[test]
    fn predicate_compile_failure_is_parameter() {
        let ok = get_scan_predicate(&tr(vec![MsgField::bytes(
            FieldType::Predicate,
            build::generation_ge(1),
        )]))
        .unwrap();
        assert!(ok.is_some());

        let err = get_scan_predicate(&tr(vec![MsgField::bytes(
            FieldType::Predicate,
            vec![0x7f],
        )]))
        .unwrap_err();
        assert_eq!(err.code, ResultCode::Parameter);
    }

    #[test]
    fn old_priority_conversion() {
        let mut rps = 0;
        convert_old_priority(1, &mut rps);
        assert_eq!(rps, LOW_PRIORITY_RPS);

        let mut rps = 100;
        convert_old_priority(1, &mut rps);
        assert_eq!(rps, 100);

        let mut rps = 0;
        convert_old_priority(0, &mut rps);
        assert_eq!(rps, 0);
    }

    #[test]
    fn background_rps_is_capped_and_defaulted() {
        let ns = Namespace::new("test", NamespaceConfig::default());
        let mut rps = 0;
        validate_background_scan_rps(&ns, &mut rps).unwrap();
        assert_eq!(rps, ns.config.background_scan_max_rps);

        let mut rps = ns.config.background_scan_max_rps + 1;
        let err = validate_background_scan_rps(&ns, &mut rps).unwrap_err();
        assert_eq!(err.code, ResultCode::Parameter);
    }
}
