//! Internal write sub-transactions and the service pool that applies
//! them.
//!
//! Background scan jobs fan records out as single-record write
//! transactions referencing the job's origin template. The pool applies
//! each write against the namespace and reports the outcome through the
//! origin's completion callback, from whatever thread ran it.

use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::Context;
use tracing::warn;

use crate::background::{OpsOrigin, UdfOrigin};
use crate::job::ResultCode;
use crate::msg::{OpType, INFO3_REPLACE_ONLY};
use crate::namespace::Namespace;
use crate::record::{now_ms, Digest, Particle, Record};

/// One internal single-record write, ready for the service queue.
pub enum InternalTxn {
    Udf {
        ns: Arc<Namespace>,
        keyd: Digest,
        origin: Arc<UdfOrigin>,
    },
    Ops {
        ns: Arc<Namespace>,
        keyd: Digest,
        origin: Arc<OpsOrigin>,
    },
}

impl InternalTxn {
    /// Apply the write and fire the completion callback.
    pub fn execute(self) {
        match self {
            InternalTxn::Udf { ns, keyd, origin } => {
                let result = apply_udf(&ns, &keyd, &origin);
                origin.complete(result);
            }
            InternalTxn::Ops { ns, keyd, origin } => {
                let result = apply_ops(&ns, &keyd, &origin);
                origin.complete(result);
            }
        }
    }
}

/// Submission side of the internal transaction pipeline.
pub trait ServiceQueue: Send + Sync {
    fn enqueue(&self, txn: InternalTxn);
}

/// Applies sub-transactions on the submitting thread. Deterministic, for
/// tests and embedded use.
pub struct InlineQueue;

impl ServiceQueue for InlineQueue {
    fn enqueue(&self, txn: InternalTxn) {
        txn.execute();
    }
}

/// Worker-thread pool draining the internal transaction queue.
pub struct ServicePool {
    tx: Mutex<Option<mpsc::Sender<InternalTxn>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ServicePool {
    pub fn spawn(threads: usize) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel::<InternalTxn>();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("rw-sub-{i}"))
                .spawn(move || loop {
                    let txn = {
                        let Ok(rx) = rx.lock() else {
                            break;
                        };
                        match rx.recv() {
                            Ok(txn) => txn,
                            Err(_) => break,
                        }
                    };
                    txn.execute();
                })
                .context("spawn service pool worker")?;
            workers.push(handle);
        }

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }
}

impl ServiceQueue for ServicePool {
    fn enqueue(&self, txn: InternalTxn) {
        let Ok(guard) = self.tx.lock() else {
            return;
        };
        if let Some(tx) = guard.as_ref() {
            // A closed queue drops the transaction; the owning job's
            // completion accounting still ran on everything delivered.
            if tx.send(txn).is_err() {
                warn!("service pool queue closed");
            }
        }
    }
}

impl Drop for ServicePool {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                if handle.join().is_err() {
                    warn!("service pool worker panicked");
                }
            }
        }
    }
}

fn apply_udf(ns: &Namespace, keyd: &Digest, origin: &UdfOrigin) -> ResultCode {
    let Some(handle) = ns.find_record(keyd) else {
        // Deleted between the scan visit and the apply.
        return ResultCode::NotFound;
    };
    let Ok(mut r) = handle.lock() else {
        return ResultCode::Unknown;
    };
    if !r.is_live() || r.is_doomed() {
        return ResultCode::NotFound;
    }
    if let Some(predicate) = &origin.predicate {
        if !predicate.matches_bins(&r) {
            return ResultCode::FilteredOut;
        }
    }
    let Some(writer) = ns.udfs.writer(&origin.def) else {
        warn!(
            module = %origin.def.module,
            function = %origin.def.function,
            "udf sub-transaction has no registered writer"
        );
        return ResultCode::Unknown;
    };
    match writer(&mut r) {
        Ok(()) => {
            r.generation += 1;
            r.last_update_ms = now_ms();
            ResultCode::Ok
        }
        Err(err) => {
            warn!(error = %err, "udf sub-transaction failed");
            ResultCode::Unknown
        }
    }
}

fn apply_ops(ns: &Namespace, keyd: &Digest, origin: &OpsOrigin) -> ResultCode {
    let Some(handle) = ns.find_record(keyd) else {
        return ResultCode::NotFound;
    };
    let Ok(mut r) = handle.lock() else {
        return ResultCode::Unknown;
    };
    if !r.is_live() || r.is_doomed() {
        // Update-only: the record must still exist.
        return ResultCode::NotFound;
    }
    if let Some(predicate) = &origin.predicate {
        if !predicate.matches_bins(&r) {
            return ResultCode::FilteredOut;
        }
    }

    if origin.msg.info3 & INFO3_REPLACE_ONLY != 0 {
        r.bins.clear();
    }
    for op in &origin.msg.ops {
        let applied = match op.op {
            OpType::Write => match &op.particle {
                Some(value) => r.write_bin(&op.bin_name, value.clone()),
                None => Err(anyhow::anyhow!("write op without value")),
            },
            OpType::Incr => incr_bin(&mut r, &op.bin_name, &op.particle),
            // Read ops were rejected at job start.
            OpType::Read => Ok(()),
        };
        if let Err(err) = applied {
            warn!(bin = %op.bin_name, error = %err, "ops sub-transaction failed");
            return ResultCode::Unknown;
        }
    }

    r.generation += 1;
    r.last_update_ms = now_ms();
    ResultCode::Ok
}

fn incr_bin(r: &mut Record, name: &str, delta: &Option<Particle>) -> anyhow::Result<()> {
    let Some(Particle::Int(delta)) = delta else {
        anyhow::bail!("incr op needs an int value");
    };
    match r.bin(name).map(|b| &b.value) {
        Some(Particle::Int(current)) => {
            let next = current.wrapping_add(*delta);
            r.write_bin(name, Particle::Int(next))
        }
        Some(_) => anyhow::bail!("incr op on non-int bin"),
        None => r.write_bin(name, Particle::Int(*delta)),
    }
}
