//! Client connection ownership for foreground scan jobs.
//!
//! A foreground job owns its client connection for its whole lifetime.
//! `ConnJob` wraps the connection in a mutex that serializes every chunk
//! send and the terminal fin; holding that lock is the only permission to
//! touch the sink. Send failures release the connection and abandon the
//! owning job.

use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::job::{JobCore, JobStat, ResultCode};
use crate::msg;
use crate::proto::ChunkBuffer;

/// Blocking response channel back to the client.
///
/// `compress` is the client's request-level flag, carried through for the
/// transport layer; the sinks here transmit uncompressed.
pub trait ResponseSink: Send {
    fn send_all(&mut self, frame: &[u8], timeout_ms: i64, compress: bool) -> io::Result<()>;
    fn force_close(&mut self);
    fn peer(&self) -> String;
}

/// TCP-backed sink with a per-send write timeout.
pub struct TcpSink {
    stream: TcpStream,
    peer: String,
}

impl TcpSink {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        Self { stream, peer }
    }
}

impl ResponseSink for TcpSink {
    fn send_all(&mut self, frame: &[u8], timeout_ms: i64, _compress: bool) -> io::Result<()> {
        use std::io::Write;
        let timeout = if timeout_ms > 0 {
            Some(Duration::from_millis(timeout_ms as u64))
        } else {
            None
        };
        self.stream.set_write_timeout(timeout)?;
        self.stream.write_all(frame)
    }

    fn force_close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// In-memory capture sink with programmable failure, the test-side
/// counterpart of `TcpSink`.
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
    sends: usize,
    fail_after: Option<(usize, io::ErrorKind)>,
}

impl MemorySink {
    pub fn new() -> (Self, SinkCapture) {
        Self::with_failure(None)
    }

    /// Fail every send once `ok_sends` sends have succeeded.
    pub fn failing_after(ok_sends: usize, kind: io::ErrorKind) -> (Self, SinkCapture) {
        Self::with_failure(Some((ok_sends, kind)))
    }

    fn with_failure(fail_after: Option<(usize, io::ErrorKind)>) -> (Self, SinkCapture) {
        let data = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let capture = SinkCapture {
            data: data.clone(),
            closed: closed.clone(),
        };
        (
            Self {
                data,
                closed,
                sends: 0,
                fail_after,
            },
            capture,
        )
    }
}

impl ResponseSink for MemorySink {
    fn send_all(&mut self, frame: &[u8], _timeout_ms: i64, _compress: bool) -> io::Result<()> {
        if let Some((ok_sends, kind)) = self.fail_after {
            if self.sends >= ok_sends {
                return Err(io::Error::new(kind, "injected send failure"));
            }
        }
        self.sends += 1;
        if let Ok(mut data) = self.data.lock() {
            data.extend_from_slice(frame);
        }
        Ok(())
    }

    fn force_close(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn peer(&self) -> String {
        "mem".to_string()
    }
}

/// Reader half of a `MemorySink`.
#[derive(Clone)]
pub struct SinkCapture {
    data: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl SinkCapture {
    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn force_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Split the captured stream into frame payloads.
    pub fn frames(&self) -> anyhow::Result<Vec<Vec<u8>>> {
        let bytes = self.bytes();
        let mut cursor = std::io::Cursor::new(bytes);
        let mut out = Vec::new();
        while let Some(payload) = crate::proto::read_frame(&mut cursor)? {
            out.push(payload);
        }
        Ok(out)
    }

    /// All messages across all captured frames, in send order.
    pub fn msgs(&self) -> anyhow::Result<Vec<msg::Msg>> {
        let mut out = Vec::new();
        for payload in self.frames()? {
            out.extend(msg::Msg::decode_all(&payload)?);
        }
        Ok(out)
    }
}

/// Foreground connection state composed into basic and aggregation jobs.
pub struct ConnJob {
    sink: Mutex<Option<Box<dyn ResponseSink>>>,
    timeout_ms: i64,
    compress: bool,
    net_io_bytes: AtomicU64,
}

impl ConnJob {
    /// Take ownership of the client connection from the transaction.
    /// A zero timeout means no send deadline.
    pub fn own(sink: Box<dyn ResponseSink>, timeout_ms: u32, compress: bool) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
            timeout_ms: if timeout_ms == 0 { -1 } else { timeout_ms as i64 },
            compress,
            net_io_bytes: AtomicU64::new(0),
        }
    }

    /// Undo `own` when the job fails to start, returning the connection
    /// to the caller so it can report the error itself.
    pub fn take_back(&self) -> Option<Box<dyn ResponseSink>> {
        self.sink.lock().ok().and_then(|mut guard| guard.take())
    }

    /// Send the buffered chunk; on failure the connection is closed and
    /// the job abandoned with a timeout-specific reason.
    pub fn send_chunk(&self, core: &JobCore, bb: &mut ChunkBuffer) -> bool {
        let frame_len = {
            let Ok(mut guard) = self.sink.lock() else {
                return false;
            };
            let Some(sink) = guard.as_mut() else {
                // Job already abandoned.
                return false;
            };
            let frame = bb.frame();
            match sink.send_all(frame, self.timeout_ms, self.compress) {
                Ok(()) => frame.len() as u64,
                Err(err) => {
                    let reason = if matches!(
                        err.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) {
                        ResultCode::ResponseTimeout
                    } else {
                        ResultCode::ResponseError
                    };
                    warn!(
                        client = %sink.peer(),
                        size = frame.len(),
                        error = ?err,
                        "error sending scan response chunk"
                    );
                    sink.force_close();
                    *guard = None;
                    drop(guard);
                    core.abandon(reason);
                    return false;
                }
            }
        };
        self.net_io_bytes.fetch_add(frame_len, Ordering::Relaxed);
        true
    }

    /// Send the terminal fin bearing the abandon reason and release the
    /// connection; a failed fin force-closes it.
    pub fn finish(&self, core: &JobCore) {
        let Ok(mut guard) = self.sink.lock() else {
            return;
        };
        let Some(mut sink) = guard.take() else {
            return;
        };
        let frame = msg::fin_frame(core.abandon_code());
        match sink.send_all(&frame, self.timeout_ms, false) {
            Ok(()) => {
                self.net_io_bytes
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(trid = core.trid, error = ?err, "error sending scan fin");
                sink.force_close();
            }
        }
    }

    pub fn net_io_bytes(&self) -> u64 {
        self.net_io_bytes.load(Ordering::Relaxed)
    }

    pub fn info_into(&self, stat: &mut JobStat) {
        stat.net_io_bytes = self.net_io_bytes();
        stat.socket_timeout_ms = self.timeout_ms;
    }
}
