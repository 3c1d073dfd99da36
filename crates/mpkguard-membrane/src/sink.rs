//! Diagnostic sink: fixed-size signal records streamed over TCP.
//!
//! Each record is two native-endian `i32`s, `{signal, value}`. The consumer
//! on the other end is an external tool; this side only produces.

use std::io::Write;
use std::net::{SocketAddrV4, TcpStream};

use parking_lot::Mutex;

use crate::counters::CountersSnapshot;
use crate::error::{IsolationError, IsolationResult};

/// Signal codes understood by the statistics consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Signal {
    LoadFalseNegative = 1,
    StoreFalseNegative = 2,
    LoadFalsePositive = 3,
    TotalStores = 4,
    TotalLoads = 5,
    StoreFalsePositive = 6,
    TotalUnsafeStores = 7,
    TotalAllocas = 8,
    UnsafeAllocas = 9,
    TotalHeapAlloc = 10,
    UnsafeHeapAlloc = 11,
    EndExecution = 101,
    BeginExecution = 501,
}

impl Signal {
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// One record on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SignalRecord {
    pub signal: i32,
    pub value: i32,
}

pub const RECORD_SIZE: usize = std::mem::size_of::<SignalRecord>();

impl SignalRecord {
    #[must_use]
    pub const fn new(signal: Signal, value: i32) -> Self {
        Self {
            signal: signal.code(),
            value,
        }
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; RECORD_SIZE] {
        let mut out = [0_u8; RECORD_SIZE];
        out[..4].copy_from_slice(&self.signal.to_ne_bytes());
        out[4..].copy_from_slice(&self.value.to_ne_bytes());
        out
    }

    #[must_use]
    pub fn from_bytes(raw: [u8; RECORD_SIZE]) -> Self {
        Self {
            signal: i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]),
            value: i32::from_ne_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }
}

fn clamp(value: u64) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Counter records sent at the end of execution, in wire order.
#[must_use]
pub fn counter_records(snapshot: &CountersSnapshot) -> [SignalRecord; 11] {
    let loads = snapshot.total_safe_loads.saturating_add(snapshot.total_unsafe_loads);
    let stores = snapshot.total_safe_stores.saturating_add(snapshot.total_unsafe_stores);
    [
        SignalRecord::new(Signal::TotalHeapAlloc, clamp(snapshot.total_heap)),
        SignalRecord::new(Signal::UnsafeHeapAlloc, clamp(snapshot.unsafe_heap)),
        SignalRecord::new(Signal::TotalAllocas, clamp(snapshot.total_allocas)),
        SignalRecord::new(Signal::UnsafeAllocas, clamp(snapshot.unsafe_allocas)),
        SignalRecord::new(Signal::TotalLoads, clamp(loads)),
        SignalRecord::new(Signal::TotalStores, clamp(stores)),
        SignalRecord::new(Signal::TotalUnsafeStores, clamp(snapshot.total_unsafe_stores)),
        SignalRecord::new(Signal::LoadFalsePositive, clamp(snapshot.safe_loads_in_unsafe)),
        SignalRecord::new(Signal::StoreFalsePositive, clamp(snapshot.safe_stores_in_unsafe)),
        SignalRecord::new(Signal::LoadFalseNegative, clamp(snapshot.unsafe_loads_in_safe)),
        SignalRecord::new(Signal::StoreFalseNegative, clamp(snapshot.unsafe_stores_in_safe)),
    ]
}

/// Connected producer end. Sends from concurrent threads are serialized.
#[derive(Debug)]
pub struct DiagnosticSink {
    endpoint: SocketAddrV4,
    stream: Mutex<TcpStream>,
}

impl DiagnosticSink {
    pub fn connect(endpoint: SocketAddrV4) -> IsolationResult<Self> {
        let stream = TcpStream::connect(endpoint)
            .map_err(|source| IsolationError::Transport { endpoint, source })?;
        // Records are 8 bytes each; send them as they come.
        let _ = stream.set_nodelay(true);
        Ok(Self {
            endpoint,
            stream: Mutex::new(stream),
        })
    }

    #[must_use]
    pub const fn endpoint(&self) -> SocketAddrV4 {
        self.endpoint
    }

    pub fn send(&self, record: SignalRecord) -> IsolationResult<()> {
        self.stream
            .lock()
            .write_all(&record.to_bytes())
            .map_err(|source| IsolationError::Transport {
                endpoint: self.endpoint,
                source,
            })
    }

    pub fn send_signal(&self, signal: Signal, value: i32) -> IsolationResult<()> {
        self.send(SignalRecord::new(signal, value))
    }

    /// Stream the counters followed by the end-of-execution marker.
    pub fn send_final_report(&self, snapshot: &CountersSnapshot) -> IsolationResult<()> {
        let records = counter_records(snapshot);
        let mut stream = self.stream.lock();
        for record in records
            .iter()
            .copied()
            .chain(std::iter::once(SignalRecord::new(Signal::EndExecution, 0)))
        {
            stream
                .write_all(&record.to_bytes())
                .map_err(|source| IsolationError::Transport {
                    endpoint: self.endpoint,
                    source,
                })?;
        }
        stream.flush().map_err(|source| IsolationError::Transport {
            endpoint: self.endpoint,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn local_listener() -> (TcpListener, SocketAddrV4) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = match listener.local_addr().expect("addr") {
            std::net::SocketAddr::V4(v4) => v4,
            std::net::SocketAddr::V6(_) => unreachable!("bound to ipv4"),
        };
        (listener, addr)
    }

    #[test]
    fn signal_codes_match_wire_protocol() {
        assert_eq!(Signal::EndExecution.code(), 101);
        assert_eq!(Signal::BeginExecution.code(), 501);
        assert_eq!(Signal::UnsafeHeapAlloc.code(), 11);
        assert_eq!(RECORD_SIZE, 8);
    }

    #[test]
    fn record_bytes_are_native_endian_pairs() {
        let record = SignalRecord::new(Signal::TotalLoads, 0x0102_0304);
        let bytes = record.to_bytes();
        assert_eq!(&bytes[..4], &5_i32.to_ne_bytes());
        assert_eq!(SignalRecord::from_bytes(bytes), record);
    }

    #[test]
    fn oversized_counters_saturate() {
        let snapshot = CountersSnapshot {
            total_heap: u64::MAX,
            ..CountersSnapshot::default()
        };
        let records = counter_records(&snapshot);
        assert_eq!(records[0].value, i32::MAX);
        assert_eq!(records[1].value, 0);
    }

    #[test]
    fn refused_connection_is_a_transport_error() {
        let (listener, addr) = local_listener();
        drop(listener);
        let err = DiagnosticSink::connect(addr).expect_err("nobody listening");
        assert_eq!(err.category(), crate::error::ErrorCategory::Transport);
    }

    #[test]
    fn final_report_ends_with_end_execution() {
        let (listener, addr) = local_listener();
        let reader = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            let mut raw = Vec::new();
            conn.read_to_end(&mut raw).expect("read");
            raw
        });

        let sink = DiagnosticSink::connect(addr).expect("connect");
        sink.send_signal(Signal::BeginExecution, 0).expect("begin");
        let snapshot = CountersSnapshot {
            total_heap: 3,
            unsafe_heap: 1,
            ..CountersSnapshot::default()
        };
        sink.send_final_report(&snapshot).expect("report");
        drop(sink);

        let raw = reader.join().expect("join");
        let records: Vec<SignalRecord> = raw
            .chunks_exact(RECORD_SIZE)
            .map(|chunk| SignalRecord::from_bytes(chunk.try_into().expect("8 bytes")))
            .collect();
        assert_eq!(records.len(), 13);
        assert_eq!(records[0], SignalRecord::new(Signal::BeginExecution, 0));
        assert_eq!(records[1], SignalRecord::new(Signal::TotalHeapAlloc, 3));
        assert_eq!(records[2], SignalRecord::new(Signal::UnsafeHeapAlloc, 1));
        assert_eq!(records[12], SignalRecord::new(Signal::EndExecution, 0));
    }
}
