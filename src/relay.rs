//! Bidirectional packet relay for one session.
//!
//! Two pumps run as separate tasks:
//! - device→transport: one device read becomes one binary frame.
//! - transport→device: one frame becomes one device write.
//!
//! Each pump owns a single packet buffer and blocks on its own I/O, so a slow
//! consumer stalls only its pump. The first pump to stop cancels its sibling
//! through a shared child token. [`Relay::run`] then reports why.

use crate::device::PacketDevice;
use crate::error::{Direction, RelayError};
use crate::transport::{FrameSink, FrameSource, Session};
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default packet buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Relay tuning.
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    /// Size of each pump's packet buffer. Never smaller than the device MTU.
    pub buffer_size: usize,
    /// Send a keepalive frame when set.
    pub keepalive_interval: Option<Duration>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            keepalive_interval: None,
        }
    }
}

/// Packet counters across all sessions.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub packets_to_transport: AtomicU64,
    pub bytes_to_transport: AtomicU64,
    pub packets_to_device: AtomicU64,
    pub bytes_to_device: AtomicU64,
}

impl RelayStats {
    fn record(&self, direction: Direction, len: usize) {
        let (packets, bytes) = match direction {
            Direction::DeviceToTransport => (&self.packets_to_transport, &self.bytes_to_transport),
            Direction::TransportToDevice => (&self.packets_to_device, &self.bytes_to_device),
        };
        packets.fetch_add(1, Ordering::Relaxed);
        bytes.fetch_add(len as u64, Ordering::Relaxed);
    }
}

pub struct Relay {
    options: RelayOptions,
    stats: Arc<RelayStats>,
}

impl Relay {
    pub fn new(options: RelayOptions) -> Self {
        Self {
            options,
            stats: Arc::new(RelayStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    /// Relay packets until one direction fails or `cancel` fires.
    ///
    /// On failure the session is closed before returning. On cancellation
    /// the session is left open for the owner to close. Either way both
    /// pumps have exited and the session holds its transport halves again.
    pub async fn run<P, S, R>(
        &self,
        cancel: &CancellationToken,
        device: &Arc<P>,
        session: &mut Session<S, R>,
    ) -> RelayError
    where
        P: PacketDevice,
        S: FrameSink,
        R: FrameSource,
    {
        let Some((sink, source)) = session.take_halves() else {
            return RelayError::TransportWrite(io::Error::new(
                io::ErrorKind::NotConnected,
                "session has no transport",
            ));
        };

        let pumps = cancel.child_token();
        let mut outbound = tokio::spawn(device_to_transport(
            device.clone(),
            sink,
            self.options,
            self.stats.clone(),
            pumps.clone(),
        ));
        let mut inbound = tokio::spawn(transport_to_device(
            device.clone(),
            source,
            self.stats.clone(),
            pumps.clone(),
        ));

        let (sink, source, failure) = tokio::select! {
            result = &mut outbound => {
                pumps.cancel();
                let (sink, failure) = join_pump(result, Direction::DeviceToTransport);
                let (source, _) = join_pump(inbound.await, Direction::TransportToDevice);
                (sink, source, failure)
            }
            result = &mut inbound => {
                pumps.cancel();
                let (source, failure) = join_pump(result, Direction::TransportToDevice);
                let (sink, _) = join_pump(outbound.await, Direction::DeviceToTransport);
                (sink, source, failure)
            }
        };
        session.restore_halves(sink, source);

        if failure.is_canceled() {
            log::info!("Relay to {} canceled", session.relay_addr());
            return failure;
        }

        if let Some(direction) = failure.direction() {
            log::warn!(
                "Relay {} to {} failed: {}",
                direction,
                session.relay_addr(),
                failure
            );
        }
        session.close().await;
        failure
    }
}

/// Unwrap a pump's result; a panicked pump counts as an I/O failure in its
/// direction and loses its half.
fn join_pump<T>(
    result: Result<(T, RelayError), JoinError>,
    direction: Direction,
) -> (Option<T>, RelayError) {
    match result {
        Ok((half, failure)) => (Some(half), failure),
        Err(e) => {
            let err = io::Error::other(format!("{} pump aborted: {}", direction, e));
            let failure = match direction {
                Direction::DeviceToTransport => RelayError::DeviceRead(err),
                Direction::TransportToDevice => RelayError::TransportRead(err),
            };
            (None, failure)
        }
    }
}

async fn tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn device_to_transport<P: PacketDevice, S: FrameSink>(
    device: Arc<P>,
    mut sink: S,
    options: RelayOptions,
    stats: Arc<RelayStats>,
    cancel: CancellationToken,
) -> (S, RelayError) {
    let mut buf = vec![0u8; options.buffer_size.max(usize::from(device.mtu()))];
    let mut keepalive = options.keepalive_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (sink, RelayError::Canceled),
            _ = tick(&mut keepalive) => None,
            read = device.read_packet(&mut buf) => Some(read),
        };

        let n = match read {
            None => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return (sink, RelayError::Canceled),
                    sent = sink.send_keepalive() => {
                        if let Err(e) = sent {
                            return (sink, RelayError::TransportWrite(e));
                        }
                    }
                }
                log::trace!("Keepalive sent");
                continue;
            }
            Some(Ok(0)) => {
                return (
                    sink,
                    RelayError::DeviceRead(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "device reached end of file",
                    )),
                )
            }
            Some(Ok(n)) => n,
            Some(Err(e)) => return (sink, RelayError::DeviceRead(e)),
        };

        let frame = Bytes::copy_from_slice(&buf[..n]);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return (sink, RelayError::Canceled),
            sent = sink.send_frame(frame) => {
                if let Err(e) = sent {
                    return (sink, RelayError::TransportWrite(e));
                }
            }
        }
        stats.record(Direction::DeviceToTransport, n);
    }
}

async fn transport_to_device<P: PacketDevice, R: FrameSource>(
    device: Arc<P>,
    mut source: R,
    stats: Arc<RelayStats>,
    cancel: CancellationToken,
) -> (R, RelayError) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (source, RelayError::Canceled),
            read = source.next_frame() => match read {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    return (
                        source,
                        RelayError::TransportRead(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "relay closed the connection",
                        )),
                    )
                }
                Err(e) => return (source, RelayError::TransportRead(e)),
            },
        };
        if frame.is_empty() {
            log::trace!("Skipping empty frame");
            continue;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return (source, RelayError::Canceled),
            written = device.write_packet(&frame) => {
                if let Err(e) = written {
                    return (source, RelayError::DeviceWrite(e));
                }
            }
        }
        stats.record(Direction::TransportToDevice, frame.len());
    }
}
