//! Dedicated writer task for the physical socket.
//!
//! All logical channels funnel their outbound segments through one mpsc
//! channel into a single writer task, which owns the socket's write half.
//! This serializes segment writes (a segment is never torn by an interleaved
//! write from another channel) without a mutex, and lets multiple segments be
//! flushed in one vectored syscall.
//!
//! ```text
//! sync channel ─┐
//! push channel ─┼─► mpsc::Sender<OutboundSegment> ─► writer task ─► socket
//! dlq session  ─┘
//! ```

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{MqwireError, Result};
use crate::mux::segment::{SegmentHeader, SEGMENT_HEADER_SIZE};

/// Default maximum pending segments before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_SEGMENTS: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum segments to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A segment ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundSegment {
    /// Pre-encoded segment header (5 bytes).
    pub header: [u8; SEGMENT_HEADER_SIZE],
    /// Frame payload (may be empty, e.g. a push ack).
    pub payload: Bytes,
}

impl OutboundSegment {
    /// Create an outbound segment for `channel` carrying `payload`.
    #[inline]
    pub fn new(channel: u8, payload: Bytes) -> Self {
        Self {
            header: SegmentHeader::new(channel, payload.len() as u32).encode(),
            payload,
        }
    }

    /// Total size of this segment (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        SEGMENT_HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending segments before backpressure kicks in.
    pub max_pending: usize,
    /// Channel capacity for the segment queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING_SEGMENTS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending segments to the writer task.
///
/// Cheaply cloneable; one clone per logical channel.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundSegment>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Send a segment to the writer task, waiting out backpressure up to the
    /// configured timeout.
    pub async fn send(&self, segment: OutboundSegment) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(segment).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            MqwireError::ConnectionClosed
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                return Err(MqwireError::BackpressureTimeout);
            }
            tokio::time::sleep(check_interval).await;
        }
    }

}

/// Spawn the writer task and return a handle for sending segments.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        max_pending: config.max_pending,
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Main writer loop - receives segments and writes them to the socket.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundSegment>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(s) => s,
            // All handles dropped, clean shutdown.
            None => return Ok(()),
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(segment) => batch.push(segment),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        write_batch(&mut writer, &batch).await?;
        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

/// Write a batch of segments with scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundSegment]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 2);
    for segment in batch {
        slices.push(IoSlice::new(&segment.header));
        if !segment.payload.is_empty() {
            slices.push(IoSlice::new(&segment.payload));
        }
    }

    let total_size: usize = batch.iter().map(|s| s.size()).sum();

    let mut total_written = writer.write_vectored(&slices).await?;
    if total_written == 0 {
        return Err(MqwireError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        )));
    }

    // Partial write: rebuild slices past the written prefix and continue.
    while total_written < total_size {
        let remaining = build_remaining_slices(batch, total_written);
        if remaining.is_empty() {
            break;
        }
        let written = writer.write_vectored(&remaining).await?;
        if written == 0 {
            return Err(MqwireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build the IoSlice array for data past `skip_bytes`.
fn build_remaining_slices(batch: &[OutboundSegment], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for segment in batch {
        let header_end = offset + SEGMENT_HEADER_SIZE;
        if skip_bytes < header_end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&segment.header[start..]));
        }
        offset = header_end;

        if !segment.payload.is_empty() {
            let payload_end = offset + segment.payload.len();
            if skip_bytes < payload_end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&segment.payload[start..]));
            }
            offset = payload_end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::duplex;

    #[test]
    fn test_outbound_segment_layout() {
        let segment = OutboundSegment::new(1, Bytes::from_static(b"hello"));
        assert_eq!(segment.header[0], 1);
        assert_eq!(segment.size(), SEGMENT_HEADER_SIZE + 5);
    }

    #[tokio::test]
    async fn test_writer_sends_segment() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        handle
            .send(OutboundSegment::new(2, Bytes::from_static(b"ping")))
            .await
            .unwrap();

        let mut buf = vec![0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf)
            .await
            .unwrap();
        assert_eq!(n, SEGMENT_HEADER_SIZE + 4);
        assert_eq!(buf[0], 2);
        assert_eq!(&buf[SEGMENT_HEADER_SIZE..n], b"ping");
    }

    #[tokio::test]
    async fn test_writer_batches_many_segments() {
        let (client, mut server) = duplex(16 * 1024);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for i in 0..10u32 {
            let payload = Bytes::copy_from_slice(&i.to_be_bytes());
            handle.send(OutboundSegment::new(1, payload)).await.unwrap();
        }

        let expected = 10 * (SEGMENT_HEADER_SIZE + 4);
        let mut buf = vec![0u8; expected];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut buf)
            .await
            .unwrap();
        // Every header names channel 1 and length 4.
        for chunk in buf.chunks(SEGMENT_HEADER_SIZE + 4) {
            assert_eq!(chunk[0], 1);
            assert_eq!(u32::from_be_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]), 4);
        }
    }

    #[tokio::test]
    async fn test_write_batch_into_cursor() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5)
            .map(|_| OutboundSegment::new(1, Bytes::from_static(b"abc")))
            .collect();

        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner().len(), 5 * (SEGMENT_HEADER_SIZE + 3));
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = vec![OutboundSegment::new(1, Bytes::from_static(b"hello"))];

        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);

        let slices = build_remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), SEGMENT_HEADER_SIZE - 3);

        let slices = build_remaining_slices(&batch, SEGMENT_HEADER_SIZE);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 5);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_handle_drop() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);
        let result = task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_send_after_writer_gone() {
        let (client, _server) = duplex(4096);
        let config = WriterConfig::default();
        let (handle, task) = spawn_writer_task(client, config);

        // Kill the writer task, then sending must fail with ConnectionClosed.
        task.abort();
        let _ = task.await;

        let result = handle
            .send(OutboundSegment::new(1, Bytes::from_static(b"x")))
            .await;
        assert!(matches!(result, Err(MqwireError::ConnectionClosed)));
    }
}
