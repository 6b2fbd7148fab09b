//! Socket multiplexor - independent logical channels over one socket.
//!
//! One physical connection carries two logical frame streams: the
//! synchronous request/reply channel and the asynchronous push channel. The
//! multiplexor tags every outbound frame with its channel id (via the
//! [`segment`] format) and runs a demultiplexing task that routes inbound
//! segments to per-channel queues. A blocking read on one channel therefore
//! never stalls traffic on the other: each channel's consumer waits only on
//! its own queue.
//!
//! Failure semantics: any I/O error on the physical socket is terminal. The
//! fault is recorded once and surfaced to every channel reader; the
//! multiplexor never retries - reconnection belongs to the endpoints.
//!
//! # Example
//!
//! ```
//! use mqwire::mux::{Multiplexor, SYNC_CHANNEL, PUSH_CHANNEL};
//! use bytes::Bytes;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (a, b) = tokio::io::duplex(4096);
//! let left = Multiplexor::open(a);
//! let right = Multiplexor::open(b);
//!
//! let mut rx = right.take_reader(SYNC_CHANNEL).unwrap();
//! left.writer(SYNC_CHANNEL)
//!     .send(Bytes::from_static(b"frame"))
//!     .await
//!     .unwrap();
//! assert_eq!(&rx.recv().await.unwrap()[..], b"frame");
//! # }
//! ```

pub mod segment;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{MqwireError, Result};
use crate::writer::{spawn_writer_task, OutboundSegment, WriterConfig, WriterHandle};
use segment::SegmentBuffer;

pub use segment::{Segment, SegmentHeader, DEFAULT_MAX_SEGMENT_SIZE, SEGMENT_HEADER_SIZE};

/// Logical channel for synchronous request/reply traffic.
pub const SYNC_CHANNEL: u8 = 1;

/// Logical channel for asynchronous server-to-client push traffic.
pub const PUSH_CHANNEL: u8 = 2;

/// The fixed channel set both peers agree on out of band.
pub const PROTOCOL_CHANNELS: [u8; 2] = [SYNC_CHANNEL, PUSH_CHANNEL];

/// Per-channel inbound queue depth. A full queue applies backpressure to the
/// demux task, which in turn stops reading the socket.
const CHANNEL_QUEUE_CAPACITY: usize = 256;

/// Terminal connection fault, recorded once and reproduced for every reader.
#[derive(Debug, Clone)]
enum Fault {
    Io(std::io::ErrorKind, String),
    Protocol(String),
    Closed,
}

#[derive(Default)]
struct FaultCell(Mutex<Option<Fault>>);

impl FaultCell {
    /// Record the first fault; later ones are ignored.
    fn set(&self, fault: Fault) {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(fault);
        }
    }

    fn to_error(&self) -> MqwireError {
        let guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(Fault::Io(kind, msg)) => {
                MqwireError::Io(std::io::Error::new(*kind, msg.clone()))
            }
            Some(Fault::Protocol(msg)) => MqwireError::Protocol(msg.clone()),
            Some(Fault::Closed) | None => MqwireError::ConnectionClosed,
        }
    }
}

/// Receiving view of one logical channel. Yields whole frames.
pub struct ChannelReader {
    channel: u8,
    rx: mpsc::Receiver<Bytes>,
    fault: Arc<FaultCell>,
}

impl ChannelReader {
    /// Receive the next frame on this channel.
    ///
    /// Blocks only this channel's consumer. Once the physical connection has
    /// failed, returns the recorded terminal fault after any already-queued
    /// frames are drained.
    pub async fn recv(&mut self) -> Result<Bytes> {
        match self.rx.recv().await {
            Some(frame) => Ok(frame),
            None => Err(self.fault.to_error()),
        }
    }

    /// The channel id this reader observes.
    pub fn channel(&self) -> u8 {
        self.channel
    }
}

/// Sending view of one logical channel. Cheaply cloneable.
#[derive(Clone)]
pub struct ChannelWriter {
    channel: u8,
    handle: WriterHandle,
}

impl ChannelWriter {
    /// Send one frame on this channel.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.handle.send(OutboundSegment::new(self.channel, frame)).await
    }

    /// The channel id this writer feeds.
    pub fn channel(&self) -> u8 {
        self.channel
    }
}

/// Splits one physical connection into the fixed set of logical channels.
pub struct Multiplexor {
    writer: WriterHandle,
    readers: Mutex<HashMap<u8, mpsc::Receiver<Bytes>>>,
    fault: Arc<FaultCell>,
    demux_task: JoinHandle<()>,
    _writer_task: JoinHandle<Result<()>>,
    closed: AtomicBool,
}

impl Multiplexor {
    /// Wrap an already-connected stream. Spawns the demultiplexing task and
    /// the writer task; both live until the socket fails or [`close`] is
    /// called.
    ///
    /// [`close`]: Multiplexor::close
    pub fn open<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, WriterConfig::default());

        let fault = Arc::new(FaultCell::default());

        let mut senders = HashMap::new();
        let mut readers = HashMap::new();
        for &channel in &PROTOCOL_CHANNELS {
            let (tx, rx) = mpsc::channel(CHANNEL_QUEUE_CAPACITY);
            senders.insert(channel, tx);
            readers.insert(channel, rx);
        }

        let demux_task = tokio::spawn(demux_loop(read_half, senders, fault.clone()));

        Self {
            writer,
            readers: Mutex::new(readers),
            fault,
            demux_task,
            _writer_task: writer_task,
            closed: AtomicBool::new(false),
        }
    }

    /// Take the (single) reader for a channel. Returns `None` for an unknown
    /// channel id or if the reader was already taken.
    pub fn take_reader(&self, channel: u8) -> Option<ChannelReader> {
        let rx = self
            .readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&channel)?;
        Some(ChannelReader {
            channel,
            rx,
            fault: self.fault.clone(),
        })
    }

    /// A writer for a channel. May be cloned freely.
    pub fn writer(&self, channel: u8) -> ChannelWriter {
        debug_assert!(PROTOCOL_CHANNELS.contains(&channel));
        ChannelWriter {
            channel,
            handle: self.writer.clone(),
        }
    }

    /// Close the connection and invalidate all channel views. Idempotent.
    ///
    /// The demux task stops immediately, waking every reader with a
    /// terminal error. The writer task is left to drain already-queued
    /// segments; it exits once the last [`ChannelWriter`] is dropped, and
    /// the socket's write half closes with it.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fault.set(Fault::Closed);
        self.demux_task.abort();
    }

    /// Whether [`close`](Multiplexor::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Multiplexor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reads the socket, parses segments, and routes each to its channel queue.
async fn demux_loop<R>(
    mut reader: R,
    senders: HashMap<u8, mpsc::Sender<Bytes>>,
    fault: Arc<FaultCell>,
) where
    R: AsyncRead + Unpin,
{
    let mut parser = SegmentBuffer::new();
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                fault.set(Fault::Closed);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                fault.set(Fault::Io(e.kind(), e.to_string()));
                return;
            }
        };

        let segments = match parser.push(&buf[..n]) {
            Ok(segments) => segments,
            Err(e) => {
                fault.set(Fault::Protocol(e.to_string()));
                return;
            }
        };

        for segment in segments {
            match senders.get(&segment.channel) {
                Some(tx) => {
                    // A dropped reader discards its channel's traffic; the
                    // peer channels stay live.
                    if tx.send(segment.payload).await.is_err() {
                        tracing::debug!(channel = segment.channel, "channel reader gone, frame dropped");
                    }
                }
                None => {
                    fault.set(Fault::Protocol(format!(
                        "segment for unknown channel {}",
                        segment.channel
                    )));
                    return;
                }
            }
        }
    }
    // Senders drop here; blocked readers wake with the recorded fault.
}
