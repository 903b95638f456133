//! In-memory device, transport and dialer doubles shared by unit tests.

use crate::device::PacketDevice;
use crate::dialer::Dialer;
use crate::error::DialError;
use crate::transport::{FrameSink, FrameSource, Session};
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// ============================================================================
// Packet device
// ============================================================================

/// Device fed from a channel. Reads block until a packet is pushed and fail
/// once the feeding side is gone.
pub struct MockDevice {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    written: mpsc::UnboundedSender<Vec<u8>>,
    fail_writes: AtomicBool,
    mtu: u16,
}

/// Test-side controls for a [`MockDevice`].
pub struct DeviceHandle {
    incoming: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    written: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub fn mock_device(mtu: u16) -> (Arc<MockDevice>, DeviceHandle) {
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let device = MockDevice {
        incoming: tokio::sync::Mutex::new(incoming_rx),
        written: written_tx,
        fail_writes: AtomicBool::new(false),
        mtu,
    };
    let handle = DeviceHandle {
        incoming: Mutex::new(Some(incoming_tx)),
        written: written_rx,
    };
    (Arc::new(device), handle)
}

impl MockDevice {
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

impl PacketDevice for MockDevice {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self.incoming.lock().await.recv().await;
        match packet {
            Some(packet) if packet.len() <= buf.len() => {
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            Some(packet) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}-byte packet exceeds read buffer", packet.len()),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "mock device closed",
            )),
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("mock device write failure"));
        }
        self.written
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device handle dropped"))
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }
}

impl DeviceHandle {
    /// Queue a packet for the next device read.
    pub fn push(&self, packet: &[u8]) {
        if let Some(tx) = self.incoming.lock().expect("device handle lock").as_ref() {
            let _ = tx.send(packet.to_vec());
        }
    }

    /// Make reads fail once queued packets are drained.
    pub fn end_reads(&self) {
        self.incoming.lock().expect("device handle lock").take();
    }

    pub async fn next_written(&mut self) -> Option<Vec<u8>> {
        self.written.recv().await
    }

    pub fn try_written(&mut self) -> Option<Vec<u8>> {
        self.written.try_recv().ok()
    }
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Default)]
struct TransportCounters {
    sends: AtomicUsize,
    fail_sends_after: AtomicUsize,
    stall_sends: AtomicBool,
    stall_keepalives: AtomicBool,
    keepalives: AtomicUsize,
    closes: AtomicUsize,
}

/// Sink recording frames into a channel.
pub struct MockSink {
    sent: mpsc::UnboundedSender<Bytes>,
    counters: Arc<TransportCounters>,
}

/// Source yielding frames pushed by the test.
pub struct MockSource {
    incoming: mpsc::UnboundedReceiver<io::Result<Bytes>>,
}

impl FrameSink for MockSink {
    async fn send_frame(&mut self, frame: Bytes) -> io::Result<()> {
        if self.counters.stall_sends.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        let sent = self.counters.sends.fetch_add(1, Ordering::SeqCst);
        if sent >= self.counters.fail_sends_after.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock transport write failure",
            ));
        }
        self.sent
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "loopback handle dropped"))
    }

    async fn send_keepalive(&mut self) -> io::Result<()> {
        if self.counters.stall_keepalives.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        self.counters.keepalives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl FrameSource for MockSource {
    async fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        match self.incoming.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Test-side end of a loopback session.
pub struct LoopbackHandle {
    sent: mpsc::UnboundedReceiver<Bytes>,
    incoming: Mutex<Option<mpsc::UnboundedSender<io::Result<Bytes>>>>,
    counters: Arc<TransportCounters>,
}

pub type MockSession = Session<MockSink, MockSource>;

/// A session whose far end is driven by the returned handle.
pub fn loopback_session(relay_addr: &str) -> (MockSession, LoopbackHandle) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let counters = Arc::new(TransportCounters {
        fail_sends_after: AtomicUsize::new(usize::MAX),
        ..Default::default()
    });
    let sink = MockSink {
        sent: sent_tx,
        counters: counters.clone(),
    };
    let source = MockSource {
        incoming: incoming_rx,
    };
    let handle = LoopbackHandle {
        sent: sent_rx,
        incoming: Mutex::new(Some(incoming_tx)),
        counters,
    };
    (Session::new(sink, source, relay_addr), handle)
}

impl LoopbackHandle {
    /// Frame the client wrote, in order.
    pub async fn next_sent(&mut self) -> Option<Bytes> {
        self.sent.recv().await
    }

    pub fn try_next_sent(&mut self) -> Option<Bytes> {
        self.sent.try_recv().ok()
    }

    /// Deliver a frame from the relay.
    pub fn push_incoming(&self, frame: &[u8]) {
        if let Some(tx) = self.incoming.lock().expect("loopback lock").as_ref() {
            let _ = tx.send(Ok(Bytes::copy_from_slice(frame)));
        }
    }

    /// Make the next transport read fail.
    pub fn push_read_error(&self, err: io::Error) {
        if let Some(tx) = self.incoming.lock().expect("loopback lock").as_ref() {
            let _ = tx.send(Err(err));
        }
    }

    /// Relay closes its side; reads return `None` after queued frames.
    pub fn close_incoming(&self) {
        self.incoming.lock().expect("loopback lock").take();
    }

    /// Let `n` more frames through, then fail every send.
    pub fn fail_sends_after(&self, n: usize) {
        let sent = self.counters.sends.load(Ordering::SeqCst);
        self.counters
            .fail_sends_after
            .store(sent.saturating_add(n), Ordering::SeqCst);
    }

    /// Frame sends never complete, as with a relay that stopped reading.
    pub fn stall_sends(&self) {
        self.counters.stall_sends.store(true, Ordering::SeqCst);
    }

    /// Keepalive sends never complete.
    pub fn stall_keepalives(&self) {
        self.counters.stall_keepalives.store(true, Ordering::SeqCst);
    }

    pub fn sink_closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn keepalives(&self) -> usize {
        self.counters.keepalives.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Dialer
// ============================================================================

/// Fails the first `failures` dials, then hands out queued sessions. Once the
/// queue is empty, dials never complete.
pub struct MockDialer {
    failures_left: AtomicU32,
    attempts: AtomicU32,
    sessions: Mutex<VecDeque<MockSession>>,
}

impl MockDialer {
    pub fn new(failures: u32, sessions: Vec<MockSession>) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            sessions: Mutex::new(sessions.into()),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Dialer for MockDialer {
    type Sink = MockSink;
    type Source = MockSource;

    async fn dial(&self) -> Result<MockSession, DialError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DialError::connect("scripted dial failure"));
        }

        let next = self.sessions.lock().expect("sessions lock").pop_front();
        match next {
            Some(mut session) => {
                session.activate();
                Ok(session)
            }
            None => std::future::pending().await,
        }
    }
}
