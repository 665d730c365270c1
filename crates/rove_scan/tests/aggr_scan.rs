mod common;

use std::sync::Arc;

use common::*;
use rove_scan::msg::{FieldType, Msg, MsgField, UDF_OP_AGGREGATE};
use rove_scan::predicate::build;
use rove_scan::udf::RecordView;
use rove_scan::{Particle, ResultCode, ScanConfig};

fn aggr_msg(module: &str, function: &str) -> Msg {
    Msg {
        fields: vec![
            MsgField::u8(FieldType::UdfOp, UDF_OP_AGGREGATE),
            MsgField::str(FieldType::UdfModule, module),
            MsgField::str(FieldType::UdfFunction, function),
        ],
        ..Msg::default()
    }
}

#[test]
fn aggregation_streams_emitted_values() {
    let ns = namespace();
    for tail in 1..=3u8 {
        ns.insert(record(1, tail, 0));
    }
    ns.udfs.register_aggregation(
        "stats",
        "count",
        Arc::new(|records: &[RecordView], emit| {
            emit(Particle::Int(records.len() as i64));
            Ok(())
        }),
    );

    let svc = service();
    let (result, capture) = run_scan(&svc, &ns, with_trid(aggr_msg("stats", "count"), 200));
    result.unwrap();
    wait_drained(&svc);

    let msgs = capture.msgs().unwrap();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].ops.len(), 1);
    assert_eq!(msgs[0].ops[0].bin_name, "SUCCESS");
    assert_eq!(msgs[0].ops[0].particle, Some(Particle::Int(3)));
    assert!(is_fin(&msgs[1]));
    assert_eq!(msgs[1].result_code, ResultCode::Ok as u8);

    let stat = svc.get_jobstat(200).unwrap();
    assert_eq!(stat.job_type, "aggregation");
    assert_eq!(stat.recs_succeeded, 3);
    assert_eq!(ns.scan_stats.snapshot().scan_aggr_complete, 1);
}

#[test]
fn sum_aggregation_folds_bin_values() {
    let ns = namespace();
    for tail in 1..=4u8 {
        ns.insert(record(2, tail, 0));
    }
    ns.udfs.register_aggregation(
        "stats",
        "sum_id",
        Arc::new(|records: &[RecordView], emit| {
            let mut sum = 0i64;
            for record in records {
                if let Some(Particle::Int(id)) = record.bin("id").map(|b| &b.value) {
                    sum += id;
                }
            }
            emit(Particle::Int(sum));
            Ok(())
        }),
    );

    let svc = service();
    let (result, capture) = run_scan(&svc, &ns, with_trid(aggr_msg("stats", "sum_id"), 201));
    result.unwrap();
    wait_drained(&svc);

    let msgs = capture.msgs().unwrap();
    assert_eq!(msgs[0].ops[0].particle, Some(Particle::Int(1 + 2 + 3 + 4)));
}

#[test]
fn unregistered_udf_reports_failure_value_and_abandons() {
    let ns = namespace();
    ns.insert(record(3, 1, 0));

    let svc = service();
    let (result, capture) = run_scan(&svc, &ns, with_trid(aggr_msg("stats", "missing"), 202));
    result.unwrap();
    wait_drained(&svc);

    let msgs = capture.msgs().unwrap();
    assert_eq!(msgs[0].ops[0].bin_name, "FAILURE");
    match &msgs[0].ops[0].particle {
        Some(Particle::Str(reason)) => {
            assert!(reason.starts_with("UDF error 100"), "reason: {reason}");
        }
        other => panic!("unexpected failure particle: {other:?}"),
    }
    assert!(is_fin(msgs.last().unwrap()));
    assert_eq!(
        msgs.last().unwrap().result_code,
        ResultCode::Unknown as u8
    );
    assert_eq!(ns.scan_stats.snapshot().scan_aggr_error, 1);
}

#[test]
fn failing_udf_carries_its_error_string() {
    let ns = namespace();
    ns.insert(record(4, 1, 0));
    ns.udfs.register_aggregation(
        "stats",
        "boom",
        Arc::new(|_records: &[RecordView], _emit| Err("boom".to_string())),
    );

    let svc = service();
    let (result, capture) = run_scan(&svc, &ns, with_trid(aggr_msg("stats", "boom"), 203));
    result.unwrap();
    wait_drained(&svc);

    let msgs = capture.msgs().unwrap();
    match &msgs[0].ops[0].particle {
        Some(Particle::Str(reason)) => assert_eq!(reason, "UDF error 101 : boom"),
        other => panic!("unexpected failure particle: {other:?}"),
    }

    let stat = svc.get_jobstat(203).unwrap();
    assert_eq!(stat.abandoned, ResultCode::Unknown);
}

#[test]
fn predicate_filters_are_unsupported() {
    let ns = namespace();
    let svc = service();
    let mut msg = aggr_msg("stats", "count");
    msg.fields
        .push(MsgField::bytes(FieldType::Predicate, build::generation_ge(1)));

    let (result, _capture) = run_scan(&svc, &ns, msg);
    assert_eq!(result.unwrap_err().code, ResultCode::UnsupportedFeature);
    assert!(svc.get_jobstat_all().is_empty());
}

#[test]
fn udf_execution_disabled_is_forbidden() {
    let ns = namespace();
    let svc = service_with(ScanConfig {
        worker_threads: 1,
        udf_execution_disabled: true,
        ..ScanConfig::default()
    });

    let (result, _capture) = run_scan(&svc, &ns, aggr_msg("stats", "count"));
    assert_eq!(result.unwrap_err().code, ResultCode::Forbidden);
}

#[test]
fn unknown_set_is_not_found() {
    let ns = namespace();
    let svc = service();
    let mut msg = aggr_msg("stats", "count");
    msg.fields.push(MsgField::str(FieldType::Set, "ghost"));

    let (result, _capture) = run_scan(&svc, &ns, msg);
    assert_eq!(result.unwrap_err().code, ResultCode::NotFound);
}
