//! Shared helpers for scan integration tests: namespace seeding, request
//! building, capture sinks, and drain waiting.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use rove_scan::msg::{FieldType, Msg, MsgField, INFO3_LAST, INFO3_PARTITION_DONE};
use rove_scan::record::DIGEST_SZ;
use rove_scan::{
    Bin, Digest, MemorySink, Namespace, NamespaceConfig, Particle, Record, ResponseSink,
    ScanConfig, ScanError, ScanService, SinkCapture, Transaction,
};

/// Digest landing in `pid`, unique per `tail`.
pub fn digest(pid: u16, tail: u8) -> Digest {
    let mut d = [tail; DIGEST_SZ];
    d[..2].copy_from_slice(&pid.to_le_bytes());
    Digest(d)
}

pub fn record(pid: u16, tail: u8, set_id: u16) -> Record {
    let mut r = Record::new(digest(pid, tail), set_id);
    r.bins = vec![
        Bin::new("id", Particle::Int(tail as i64)),
        Bin::new("city", Particle::Str("nyc".to_string())),
    ];
    r
}

pub fn namespace() -> Arc<Namespace> {
    Namespace::new("test", NamespaceConfig::default())
}

/// Single-worker service for deterministic partition ordering.
pub fn service() -> ScanService {
    service_with(ScanConfig {
        worker_threads: 1,
        ..ScanConfig::default()
    })
}

pub fn service_with(cfg: ScanConfig) -> ScanService {
    ScanService::init(cfg).expect("scan service")
}

pub fn with_trid(mut msg: Msg, trid: u64) -> Msg {
    msg.fields.push(MsgField::u64_be(FieldType::Trid, trid));
    msg
}

pub fn run_scan(
    svc: &ScanService,
    ns: &Arc<Namespace>,
    msg: Msg,
) -> (Result<(), ScanError>, SinkCapture) {
    let (sink, capture) = MemorySink::new();
    run_scan_with(svc, ns, msg, Box::new(sink), capture)
}

pub fn run_scan_with(
    svc: &ScanService,
    ns: &Arc<Namespace>,
    msg: Msg,
    sink: Box<dyn ResponseSink>,
    capture: SinkCapture,
) -> (Result<(), ScanError>, SinkCapture) {
    let mut tr = Transaction::new(msg, "test-client").with_sink(sink);
    let result = svc.scan(&mut tr, ns);
    (result, capture)
}

pub fn wait_drained(svc: &ScanService) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !svc.drained() {
        assert!(Instant::now() < deadline, "scan service did not drain");
        std::thread::sleep(Duration::from_millis(1));
    }
}

pub fn pid_list_field(pids: &[u16]) -> MsgField {
    let mut data = Vec::with_capacity(pids.len() * 2);
    for pid in pids {
        data.extend_from_slice(&pid.to_le_bytes());
    }
    MsgField::bytes(FieldType::PidArray, data)
}

pub fn digest_list_field(digests: &[Digest]) -> MsgField {
    let mut data = Vec::with_capacity(digests.len() * DIGEST_SZ);
    for digest in digests {
        data.extend_from_slice(&digest.0);
    }
    MsgField::bytes(FieldType::DigestArray, data)
}

/// Legacy two-byte scan options field.
pub fn options_field(byte0: u8, sample_pct: u8) -> MsgField {
    MsgField::bytes(FieldType::ScanOptions, vec![byte0, sample_pct])
}

pub fn is_fin(m: &Msg) -> bool {
    m.info3 & INFO3_LAST != 0
}

pub fn is_pid_done(m: &Msg) -> bool {
    m.info3 & INFO3_PARTITION_DONE != 0
}

pub fn record_msgs(msgs: &[Msg]) -> Vec<&Msg> {
    msgs.iter()
        .filter(|m| !is_fin(m) && !is_pid_done(m))
        .collect()
}

pub fn pid_of_marker(m: &Msg) -> u32 {
    let field = m.field(FieldType::Pid).expect("marker has pid field");
    u32::from_be_bytes(field.data.as_slice().try_into().expect("pid field size"))
}

pub fn digest_of_response(m: &Msg) -> Digest {
    let field = m.field(FieldType::Digest).expect("response has digest");
    Digest::from_slice(&field.data).expect("digest field size")
}
