//! Scan job admission and per-partition slicing.
//!
//! A fixed pool of worker threads drains admitted jobs in FIFO order.
//! Workers claim partition ids from the front job with an atomic cursor,
//! reserve each partition, and drive the job's `slice`. The worker that
//! returns the job's last in-flight slice calls `finish` exactly once and
//! moves the job to the bounded finished list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::Context;
use tracing::warn;

use crate::job::{JobStat, ResultCode, ScanError, ScanJob};
use crate::record::N_PARTITIONS;
use crate::scan::ScanConfig;

struct ManagedJob {
    job: Arc<dyn ScanJob>,
    next_pid: AtomicU32,
    n_active_slices: AtomicU32,
    finished: AtomicBool,
}

impl ManagedJob {
    fn stat(&self, active: bool) -> JobStat {
        let mut stat = self.job.info();
        stat.active = active;
        stat
    }
}

struct ManagerState {
    active: Vec<Arc<ManagedJob>>,
    done: VecDeque<Arc<ManagedJob>>,
}

struct ManagerInner {
    state: Mutex<ManagerState>,
    work_cv: Condvar,
    shutdown: AtomicBool,
    max_done_jobs: usize,
}

pub struct ScanManager {
    inner: Arc<ManagerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_active_jobs: usize,
}

impl ScanManager {
    pub fn new(cfg: &ScanConfig) -> anyhow::Result<Self> {
        let inner = Arc::new(ManagerInner {
            state: Mutex::new(ManagerState {
                active: Vec::new(),
                done: VecDeque::new(),
            }),
            work_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            max_done_jobs: cfg.max_done_jobs,
        });

        let mut workers = Vec::with_capacity(cfg.worker_threads.max(1));
        for i in 0..cfg.worker_threads.max(1) {
            let inner = inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("scan-worker-{i}"))
                .spawn(move || worker_loop(&inner))
                .context("spawn scan worker thread")?;
            workers.push(handle);
        }

        Ok(Self {
            inner,
            workers: Mutex::new(workers),
            max_active_jobs: cfg.max_active_jobs,
        })
    }

    /// Admit a job; slicing starts immediately on the worker pool.
    pub fn start_job(&self, job: Arc<dyn ScanJob>) -> Result<(), ScanError> {
        let Ok(mut state) = self.inner.state.lock() else {
            return Err(ScanError::new(ResultCode::Unknown, "scan manager poisoned"));
        };
        let trid = job.core().trid;
        if state.active.iter().any(|m| m.job.core().trid == trid) {
            return Err(ScanError::new(
                ResultCode::Parameter,
                format!("scan job with trid {trid} already active"),
            ));
        }
        if state.active.len() >= self.max_active_jobs {
            return Err(ScanError::new(
                ResultCode::Forbidden,
                format!("too many active scan jobs ({})", state.active.len()),
            ));
        }
        state.active.push(Arc::new(ManagedJob {
            job,
            next_pid: AtomicU32::new(0),
            n_active_slices: AtomicU32::new(0),
            finished: AtomicBool::new(false),
        }));
        self.inner.work_cv.notify_all();
        Ok(())
    }

    /// External abort; slices observe the reason at their next record.
    pub fn abort_job(&self, trid: u64) -> bool {
        let Ok(state) = self.inner.state.lock() else {
            return false;
        };
        match state.active.iter().find(|m| m.job.core().trid == trid) {
            Some(managed) => {
                managed.job.core().abandon(ResultCode::UserAbort);
                true
            }
            None => false,
        }
    }

    pub fn abort_all_jobs(&self) -> usize {
        let Ok(state) = self.inner.state.lock() else {
            return 0;
        };
        for managed in &state.active {
            managed.job.core().abandon(ResultCode::UserAbort);
        }
        state.active.len()
    }

    pub fn get_job_info(&self, trid: u64) -> Option<JobStat> {
        let state = self.inner.state.lock().ok()?;
        if let Some(managed) = state.active.iter().find(|m| m.job.core().trid == trid) {
            return Some(managed.stat(true));
        }
        state
            .done
            .iter()
            .find(|m| m.job.core().trid == trid)
            .map(|m| m.stat(false))
    }

    /// Active jobs in admission order, then finished jobs oldest first.
    pub fn get_info(&self) -> Vec<JobStat> {
        let Ok(state) = self.inner.state.lock() else {
            return Vec::new();
        };
        state
            .active
            .iter()
            .map(|m| m.stat(true))
            .chain(state.done.iter().map(|m| m.stat(false)))
            .collect()
    }

    pub fn active_job_count(&self) -> usize {
        self.inner.state.lock().map(|s| s.active.len()).unwrap_or(0)
    }

    /// Re-apply the finished-job retention cap.
    pub fn limit_finished_jobs(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            while state.done.len() > self.inner.max_done_jobs {
                state.done.pop_front();
            }
        }
    }

    /// Test and shutdown aid: true once no jobs are active.
    pub fn drained(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|s| s.active.is_empty())
            .unwrap_or(true)
    }
}

impl Drop for ScanManager {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.abort_all_jobs();
        self.inner.work_cv.notify_all();
        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                if handle.join().is_err() {
                    warn!("scan worker thread panicked");
                }
            }
        }
    }
}

fn worker_loop(inner: &Arc<ManagerInner>) {
    loop {
        let managed = {
            let Ok(mut state) = inner.state.lock() else {
                return;
            };
            loop {
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let claimable = state
                    .active
                    .iter()
                    .find(|m| m.next_pid.load(Ordering::SeqCst) < N_PARTITIONS)
                    .cloned();
                if let Some(managed) = claimable {
                    break managed;
                }
                state = match inner.work_cv.wait(state) {
                    Ok(state) => state,
                    Err(_) => return,
                };
            }
        };

        run_slices(inner, &managed);
        maybe_complete(inner, &managed);
    }
}

fn run_slices(inner: &Arc<ManagerInner>, managed: &Arc<ManagedJob>) {
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        // The slice hold must be visible before the pid claim so the
        // completion check cannot fire while this slice runs.
        managed.n_active_slices.fetch_add(1, Ordering::SeqCst);
        let pid = managed.next_pid.fetch_add(1, Ordering::SeqCst);
        if pid >= N_PARTITIONS {
            managed.n_active_slices.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let core = managed.job.core();
        let wanted = match &core.pids {
            Some(pids) => pids[pid as usize].requested,
            None => core.ns.is_owned(pid),
        };
        if wanted {
            let rsv = core.ns.reserve(pid);
            managed.job.slice(&rsv);
        }
        managed.n_active_slices.fetch_sub(1, Ordering::SeqCst);
    }
}

fn maybe_complete(inner: &Arc<ManagerInner>, managed: &Arc<ManagedJob>) {
    if managed.next_pid.load(Ordering::SeqCst) < N_PARTITIONS
        || managed.n_active_slices.load(Ordering::SeqCst) != 0
        || managed.finished.swap(true, Ordering::SeqCst)
    {
        return;
    }

    managed.job.finish();

    let Ok(mut state) = inner.state.lock() else {
        return;
    };
    state.active.retain(|m| !Arc::ptr_eq(m, managed));
    state.done.push_back(managed.clone());
    while state.done.len() > inner.max_done_jobs {
        state.done.pop_front();
    }
    inner.work_cv.notify_all();
}
