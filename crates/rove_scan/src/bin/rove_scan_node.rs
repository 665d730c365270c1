//! Demo scan node: seeds one namespace with sample records, registers a
//! few UDFs, and serves the scan wire protocol on TCP.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use rove_scan::msg::{self, Msg};
use rove_scan::record::{Bin, Digest, Particle, Record, DIGEST_SZ};
use rove_scan::udf::RecordView;
use rove_scan::{
    proto, Namespace, NamespaceConfig, ResponseSink, ScanConfig, ScanService, TcpSink, Transaction,
};

#[derive(Debug, Parser)]
#[command(name = "rove-scan-node", about = "Rove scan subsystem demo node")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:4100")]
    listen: SocketAddr,

    #[arg(long, default_value = "test")]
    namespace: String,

    /// Sample records to seed at startup.
    #[arg(long, default_value_t = 10_000)]
    records: u64,

    #[arg(long, default_value_t = 4)]
    scan_threads: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let ns = Namespace::new(&args.namespace, NamespaceConfig::default());
    seed_records(&ns, args.records, args.seed)?;
    register_udfs(&ns);

    let service = Arc::new(ScanService::init(ScanConfig {
        worker_threads: args.scan_threads,
        ..ScanConfig::default()
    })?);

    info!(
        listen = %args.listen,
        ns = %ns.name,
        records = ns.record_count(),
        "rove scan node ready"
    );

    let listener = TcpListener::bind(args.listen).context("bind scan listener")?;
    loop {
        let (stream, peer) = listener.accept().context("accept scan connection")?;
        let service = service.clone();
        let ns = ns.clone();
        std::thread::spawn(move || {
            if let Err(err) = handle_conn(stream, peer, &service, &ns) {
                debug!(peer = %peer, error = ?err, "scan connection closed");
            }
        });
    }
}

fn handle_conn(
    stream: TcpStream,
    peer: SocketAddr,
    service: &ScanService,
    ns: &Arc<Namespace>,
) -> anyhow::Result<()> {
    let mut reader = stream.try_clone().context("clone scan connection")?;
    loop {
        let Some(payload) = proto::read_frame(&mut reader)? else {
            return Ok(());
        };
        let (request, _) = Msg::decode_one(&payload)?;
        let sink = TcpSink::new(stream.try_clone().context("clone scan connection")?);
        let mut tr = Transaction::new(request, peer.to_string()).with_sink(Box::new(sink));

        if let Err(err) = service.scan(&mut tr, ns) {
            warn!(trid = tr.trid, error = %err, "scan rejected");
            // The connection stayed with the transaction; report the
            // result code as the terminal fin ourselves.
            if let Some(mut sink) = tr.sink.take() {
                let _ = sink.send_all(&msg::fin_frame(err.code), -1, false);
            }
        }
    }
}

fn seed_records(ns: &Arc<Namespace>, count: u64, seed: u64) -> anyhow::Result<()> {
    let users = ns.register_set("users")?;
    let events = ns.register_set("events")?;
    let mut rng = StdRng::seed_from_u64(seed);
    let cities = ["nyc", "sf", "berlin", "tokyo"];

    for i in 0..count {
        let mut digest = [0u8; DIGEST_SZ];
        rng.fill(&mut digest[..]);
        let set_id = if rng.gen_bool(0.7) { users } else { events };

        let mut record = Record::new(Digest(digest), set_id);
        record.bins = vec![
            Bin::new("id", Particle::Int(i as i64)),
            Bin::new("score", Particle::Int(rng.gen_range(0..1000))),
            Bin::new(
                "city",
                Particle::Str(cities[rng.gen_range(0..cities.len())].to_string()),
            ),
        ];
        ns.insert(record);
    }

    info!(records = count, "seeded namespace");
    Ok(())
}

fn register_udfs(ns: &Arc<Namespace>) {
    ns.udfs.register_aggregation(
        "stats",
        "count",
        Arc::new(|records: &[RecordView], emit| {
            emit(Particle::Int(records.len() as i64));
            Ok(())
        }),
    );

    ns.udfs.register_aggregation(
        "stats",
        "sum_score",
        Arc::new(|records: &[RecordView], emit| {
            let mut sum = 0i64;
            for record in records {
                if let Some(Particle::Int(score)) = record.bin("score").map(|b| &b.value) {
                    sum += score;
                }
            }
            emit(Particle::Int(sum));
            Ok(())
        }),
    );

    ns.udfs.register_writer(
        "mods",
        "bump_score",
        Arc::new(|record| {
            let next = match record.bin("score").map(|b| &b.value) {
                Some(Particle::Int(score)) => score + 1,
                _ => 1,
            };
            record
                .write_bin("score", Particle::Int(next))
                .map_err(|err| err.to_string())
        }),
    );
}
