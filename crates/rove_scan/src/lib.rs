//! Scan dispatch and per-record streaming core for the Rove key-value
//! node.
//!
//! A client scan request is dispatched to one of four job flavors: basic
//! (stream record responses), aggregation (fold records through a
//! registered UDF and stream its values), and the two background flavors
//! (fan surviving records out as internal UDF or write-op
//! sub-transactions). All four share one lifecycle - start, per-partition
//! slice, finish - driven by the scan manager's worker pool.
//!
//! Entry point: build a [`ScanService`], hand it a [`Transaction`] parsed
//! from the wire plus the target [`Namespace`].

mod aggr;
pub mod background;
mod basic;
pub mod conn;
pub mod job;
pub mod manager;
pub mod msg;
pub mod namespace;
pub mod predicate;
pub mod proto;
pub mod record;
pub mod scan;
pub mod service;
pub mod udf;

pub use conn::{MemorySink, ResponseSink, SinkCapture, TcpSink};
pub use job::{JobStat, PidRequest, ResultCode, ScanError};
pub use namespace::{Namespace, NamespaceConfig, Reservation};
pub use record::{Bin, Digest, Particle, Record};
pub use scan::{ScanConfig, ScanService, ScanType, Transaction};
pub use service::{InlineQueue, InternalTxn, ServicePool, ServiceQueue};
