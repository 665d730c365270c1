//! Shared scan job model: result codes, the common job core, and the
//! job trait implemented by the four scan flavors.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::namespace::{Namespace, Reservation};
use crate::record::{now_ms, now_s, Digest, Record};

/// Set id meaning "no set" / "whole namespace".
pub const INVALID_SET_ID: u16 = 0;

/// One flat result-code space: wire result codes, pre-admission errors,
/// and job abandon reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    Unknown = 1,
    NotFound = 2,
    Parameter = 4,
    ClusterKeyMismatch = 7,
    Unavailable = 11,
    BinName = 21,
    Forbidden = 22,
    UnsupportedFeature = 26,
    FilteredOut = 27,
    UserAbort = 120,
    ResponseError = 121,
    ResponseTimeout = 122,
}

impl ResultCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => ResultCode::Ok,
            2 => ResultCode::NotFound,
            4 => ResultCode::Parameter,
            7 => ResultCode::ClusterKeyMismatch,
            11 => ResultCode::Unavailable,
            21 => ResultCode::BinName,
            22 => ResultCode::Forbidden,
            26 => ResultCode::UnsupportedFeature,
            27 => ResultCode::FilteredOut,
            120 => ResultCode::UserAbort,
            121 => ResultCode::ResponseError,
            122 => ResultCode::ResponseTimeout,
            _ => ResultCode::Unknown,
        }
    }
}

/// Pre-admission scan failure, reported to the client and never admitted.
#[derive(Debug, thiserror::Error)]
#[error("scan rejected ({code:?}): {detail}")]
pub struct ScanError {
    pub code: ResultCode,
    pub detail: String,
}

impl ScanError {
    pub fn new(code: ResultCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// Per-partition request entry. `digest` carries the resume key when the
/// client asked to continue a partition from a specific record.
#[derive(Clone, Copy, Debug, Default)]
pub struct PidRequest {
    pub requested: bool,
    pub digest: Option<Digest>,
}

/// Post-emission records-per-second pacing.
///
/// Permits refresh once per wall-clock second; an exhausted window yields
/// `1e6 / rps` microseconds of sleep per extra record.
struct Throttle {
    window_s: AtomicU64,
    count: AtomicU64,
}

impl Throttle {
    fn new() -> Self {
        Self {
            window_s: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn sleep_us(&self, rps: u32) -> u64 {
        if rps == 0 {
            return 0;
        }
        let now = now_s();
        if self.window_s.swap(now, Ordering::Relaxed) != now {
            self.count.store(0, Ordering::Relaxed);
        }
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if count > rps as u64 {
            1_000_000 / rps as u64
        } else {
            0
        }
    }
}

/// Fields and counters shared by all scan job flavors.
pub struct JobCore {
    pub trid: u64,
    pub ns: Arc<Namespace>,
    pub set_name: String,
    pub set_id: u16,
    pub pids: Option<Vec<PidRequest>>,
    pub n_pids_requested: u16,
    pub rps: u32,
    pub client: String,
    pub start_ms: u64,

    abandoned: AtomicU32,
    pub n_succeeded: AtomicU64,
    pub n_failed: AtomicU64,
    pub n_filtered_meta: AtomicU64,
    pub n_filtered_bins: AtomicU64,
    throttle: Throttle,
}

impl JobCore {
    pub fn new(
        trid: u64,
        ns: Arc<Namespace>,
        set_name: String,
        set_id: u16,
        pids: Option<Vec<PidRequest>>,
        rps: u32,
        client: String,
    ) -> Self {
        let n_pids_requested = match &pids {
            Some(pids) => pids.iter().filter(|p| p.requested).count() as u16,
            None => 0,
        };
        Self {
            trid,
            ns,
            set_name,
            set_id,
            pids,
            n_pids_requested,
            rps,
            client,
            start_ms: now_ms(),
            abandoned: AtomicU32::new(0),
            n_succeeded: AtomicU64::new(0),
            n_failed: AtomicU64::new(0),
            n_filtered_meta: AtomicU64::new(0),
            n_filtered_bins: AtomicU64::new(0),
            throttle: Throttle::new(),
        }
    }

    /// Terminal reason, if any slice or callback has abandoned the job.
    pub fn abandoned(&self) -> Option<ResultCode> {
        match self.abandoned.load(Ordering::Relaxed) {
            0 => None,
            v => Some(ResultCode::from_u32(v)),
        }
    }

    /// Reason sent with the terminal fin: the abandon reason or Ok.
    pub fn abandon_code(&self) -> ResultCode {
        self.abandoned().unwrap_or(ResultCode::Ok)
    }

    /// First terminal condition wins; later calls are no-ops.
    pub fn abandon(&self, reason: ResultCode) {
        let _ = self.abandoned.compare_exchange(
            0,
            reason as u32,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// A valid set id at this point means "restrict to that set"; an
    /// invalid one means the whole namespace.
    pub fn excluded_set(&self, r: &Record) -> bool {
        self.set_id != INVALID_SET_ID && self.set_id != r.set_id
    }

    /// Resume digest for a partition, when the request carried one.
    pub fn resume_digest(&self, pid: u32) -> Option<Digest> {
        self.pids
            .as_ref()
            .and_then(|pids| pids[pid as usize].digest)
    }

    pub fn throttle_us(&self) -> u64 {
        self.throttle.sleep_us(self.rps)
    }

    /// Called after each successful emission, never on skipped records.
    pub fn throttle_sleep(&self) {
        let sleep_us = self.throttle_us();
        if sleep_us != 0 {
            std::thread::sleep(Duration::from_micros(sleep_us));
        }
    }

    pub fn base_stat(&self, job_type: &str) -> JobStat {
        JobStat {
            trid: self.trid,
            job_type: job_type.to_string(),
            ns: self.ns.name.clone(),
            set: self.set_name.clone(),
            n_pids_requested: self.n_pids_requested,
            rps: self.rps,
            active: true,
            run_ms: now_ms().saturating_sub(self.start_ms),
            recs_succeeded: self.n_succeeded.load(Ordering::Relaxed),
            recs_failed: self.n_failed.load(Ordering::Relaxed),
            recs_filtered_meta: self.n_filtered_meta.load(Ordering::Relaxed),
            recs_filtered_bins: self.n_filtered_bins.load(Ordering::Relaxed),
            net_io_bytes: 0,
            socket_timeout_ms: 0,
            abandoned: self.abandon_code(),
            client: self.client.clone(),
            extra: String::new(),
        }
    }
}

/// Monitoring row for one job.
#[derive(Clone, Debug, Serialize)]
pub struct JobStat {
    pub trid: u64,
    pub job_type: String,
    pub ns: String,
    pub set: String,
    pub n_pids_requested: u16,
    pub rps: u32,
    pub active: bool,
    pub run_ms: u64,
    pub recs_succeeded: u64,
    pub recs_failed: u64,
    pub recs_filtered_meta: u64,
    pub recs_filtered_bins: u64,
    pub net_io_bytes: u64,
    pub socket_timeout_ms: i64,
    pub abandoned: ResultCode,
    pub client: String,
    pub extra: String,
}

/// Uniform lifecycle implemented by each scan flavor. Destruction is
/// `Drop`; the manager calls `finish` after the last slice returns.
pub trait ScanJob: Send + Sync {
    fn core(&self) -> &JobCore;
    fn slice(&self, rsv: &Reservation);
    fn finish(&self);
    fn info(&self) -> JobStat;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NamespaceConfig;
    use crate::record::DIGEST_SZ;

    fn test_core(rps: u32) -> JobCore {
        let ns = Namespace::new("test", NamespaceConfig::default());
        JobCore::new(1, ns, String::new(), INVALID_SET_ID, None, rps, "t".into())
    }

    #[test]
    fn abandon_is_write_once() {
        let core = test_core(0);
        assert_eq!(core.abandoned(), None);
        core.abandon(ResultCode::UserAbort);
        core.abandon(ResultCode::ResponseError);
        assert_eq!(core.abandoned(), Some(ResultCode::UserAbort));
        assert_eq!(core.abandon_code(), ResultCode::UserAbort);
    }

    #[test]
    fn throttle_disabled_at_zero_rps() {
        let core = test_core(0);
        for _ in 0..1000 {
            assert_eq!(core.throttle_us(), 0);
        }
    }

    #[test]
    fn throttle_kicks_in_past_rps() {
        let core = test_core(100);
        let mut slept = 0u64;
        for _ in 0..300 {
            slept += core.throttle_us();
        }
        // Each window gives 100 free permits, the rest pay 1e6/rps each.
        // Even if the wall-clock second rolls over once mid-loop, at
        // least 100 of the 300 calls pay.
        assert!(slept >= 100 * 10_000, "slept only {slept}us");
    }

    #[test]
    fn excluded_set_ignores_whole_namespace_scans() {
        let core = test_core(0);
        let r = Record::new(Digest([0u8; DIGEST_SZ]), 5);
        assert!(!core.excluded_set(&r));
    }

    #[test]
    fn n_pids_requested_counts_requested_entries() {
        let ns = Namespace::new("test", NamespaceConfig::default());
        let mut pids = vec![PidRequest::default(); crate::record::N_PARTITIONS as usize];
        pids[3].requested = true;
        pids[9].requested = true;
        let core = JobCore::new(1, ns, String::new(), 0, Some(pids), 0, "t".into());
        assert_eq!(core.n_pids_requested, 2);
    }
}
