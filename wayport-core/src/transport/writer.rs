//! Batched frame writer with drain acknowledgements
//!
//! Every control connection has exactly one writer task. Producers queue
//! frames through a [`FrameSink`]; the task collects them into batches, writes
//! and flushes the socket, then acknowledges each frame of the batch. That
//! acknowledgement is the drain signal stream writers wait on.

use bytes::BytesMut;
use kanal::{AsyncReceiver, AsyncSender};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wayport_common::{Result, TunnelError};
use wayport_protocol::{Frame, TunnelCodec};

const MAX_BATCH_SIZE: usize = 32;
const BATCH_TIMEOUT_MICROS: u64 = 100;

/// A queued frame and the optional drain acknowledgement for it
#[derive(Debug)]
pub struct Outbound {
    pub(crate) frame: Frame,
    drained: Option<oneshot::Sender<()>>,
}

impl Outbound {
    /// Take the frame and signal its drain without writing it anywhere.
    /// Used by in-process transports.
    pub fn acknowledge(self) -> Frame {
        if let Some(ack) = self.drained {
            let _ = ack.send(());
        }
        self.frame
    }
}

/// Producer handle for a connection's writer task
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: AsyncSender<Outbound>,
    closed: CancellationToken,
}

/// Consumer end of a [`FrameSink`], owned by the writer task.
///
/// Dropping the queue marks the sink closed, which fails every pending drain
/// wait instead of leaving it parked on a frame that will never be written.
#[derive(Debug)]
pub struct FrameQueue {
    rx: AsyncReceiver<Outbound>,
    closed: CancellationToken,
}

impl FrameQueue {
    pub async fn recv(&self) -> Option<Outbound> {
        self.rx.recv().await.ok()
    }
}

impl Drop for FrameQueue {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl FrameSink {
    /// Create a sink and the queue the writer task consumes
    pub fn channel() -> (Self, FrameQueue) {
        let (tx, rx) = kanal::unbounded_async();
        let closed = CancellationToken::new();
        (
            Self {
                tx,
                closed: closed.clone(),
            },
            FrameQueue { rx, closed },
        )
    }

    /// Queue a frame without waiting for it to reach the socket
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(TunnelError::PeerDisconnected);
        }
        self.tx
            .send(Outbound {
                frame,
                drained: None,
            })
            .await
            .map_err(|_| TunnelError::PeerDisconnected)
    }

    /// Queue a frame and wait until the writer has flushed the batch holding it
    pub async fn send_and_drain(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(TunnelError::PeerDisconnected);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Outbound {
                frame,
                drained: Some(ack_tx),
            })
            .await
            .map_err(|_| TunnelError::PeerDisconnected)?;
        tokio::select! {
            ack = ack_rx => ack.map_err(|_| TunnelError::PeerDisconnected),
            () = self.closed.cancelled() => Err(TunnelError::PeerDisconnected),
        }
    }

    /// Queue a frame from a synchronous context. Returns false if the
    /// connection's writer is gone.
    pub fn try_send(&self, frame: Frame) -> bool {
        !self.is_closed()
            && matches!(
                self.tx.try_send(Outbound {
                    frame,
                    drained: None
                }),
                Ok(true)
            )
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the writer task is gone
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Drive the writer for one connection until the queue closes or a write fails.
///
/// Frames that fail to encode are dropped with a warning; their drain
/// acknowledgement is dropped too, which the waiting writer observes as a
/// disconnect.
pub async fn run_frame_writer<W>(
    queue: FrameQueue,
    mut writer: W,
    mut codec: TunnelCodec,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    let mut acks = Vec::with_capacity(MAX_BATCH_SIZE);
    let mut buf = BytesMut::with_capacity(64 * 1024);

    loop {
        batch.clear();
        acks.clear();
        buf.clear();

        // 1. Wait for the first frame
        match queue.recv().await {
            Some(outbound) => batch.push(outbound),
            None => break,
        }

        // 2. Collect more frames with a short timeout
        let deadline = Duration::from_micros(BATCH_TIMEOUT_MICROS);
        let start = std::time::Instant::now();

        while batch.len() < MAX_BATCH_SIZE {
            let Some(remaining) = deadline.checked_sub(start.elapsed()) else {
                break;
            };
            match timeout(remaining, queue.recv()).await {
                Ok(Some(outbound)) => batch.push(outbound),
                _ => break,
            }
        }

        // 3. Encode the batch into one buffer
        for Outbound { frame, drained } in batch.drain(..) {
            let name = frame.event_name();
            if let Err(e) = codec.encode(frame, &mut buf) {
                warn!("Skipping unencodable {} frame: {}", name, e);
                continue;
            }
            if let Some(ack) = drained {
                acks.push(ack);
            }
        }

        // 4. Write, flush, then signal drain
        if !buf.is_empty() {
            writer.write_all(&buf).await?;
            writer.flush().await?;
        }
        for ack in acks.drain(..) {
            let _ = ack.send(());
        }
    }

    debug!("Frame writer queue closed");
    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::StreamExt;
    use tokio::io::duplex;
    use tokio_util::codec::FramedRead;
    use wayport_protocol::{Direction, RequestId};

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (sink, rx) = FrameSink::channel();
        let (writer, reader) = duplex(64 * 1024);
        tokio::spawn(run_frame_writer(rx, writer, TunnelCodec::new()));

        let id = RequestId::generate();
        for i in 0..5u8 {
            sink.send(Direction::Request.pipe(id, Bytes::from(vec![i])))
                .await
                .unwrap();
        }
        drop(sink);

        let frames: Vec<Frame> = FramedRead::new(reader, TunnelCodec::new())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.into_iter().enumerate() {
            assert_eq!(frame, Direction::Request.pipe(id, Bytes::from(vec![i as u8])));
        }
    }

    #[tokio::test]
    async fn test_drain_ack_after_flush() {
        let (sink, rx) = FrameSink::channel();
        let (writer, reader) = duplex(64 * 1024);
        tokio::spawn(run_frame_writer(rx, writer, TunnelCodec::new()));

        sink.send_and_drain(Frame::Ping { timestamp: 7 }).await.unwrap();

        let mut framed = FramedRead::new(reader, TunnelCodec::new());
        let frame = framed.next().await.unwrap().unwrap();
        assert_eq!(frame, Frame::Ping { timestamp: 7 });
    }

    #[tokio::test]
    async fn test_drain_waits_for_slow_socket() {
        let (sink, rx) = FrameSink::channel();
        // Buffer smaller than the chunk: the write cannot finish until read
        let (writer, reader) = duplex(64);
        tokio::spawn(run_frame_writer(rx, writer, TunnelCodec::new()));

        let id = RequestId::generate();
        let pending = tokio::spawn({
            let sink = sink.clone();
            async move {
                sink.send_and_drain(Direction::Response.pipe(id, Bytes::from(vec![1u8; 4096])))
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        let mut framed = FramedRead::new(reader, TunnelCodec::new());
        framed.next().await.unwrap().unwrap();
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_writer_exit_fails_pending_drain() {
        let (sink, queue) = FrameSink::channel();
        let pending = tokio::spawn({
            let sink = sink.clone();
            async move { sink.send_and_drain(Frame::Ping { timestamp: 1 }).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Writer goes away with the frame still queued
        drop(queue);
        assert!(matches!(
            pending.await.unwrap(),
            Err(TunnelError::PeerDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_closed_writer_fails_drain() {
        let (sink, queue) = FrameSink::channel();
        drop(queue);

        let result = sink.send_and_drain(Frame::Ping { timestamp: 1 }).await;
        assert!(matches!(result, Err(TunnelError::PeerDisconnected)));
        assert!(!sink.try_send(Frame::Ping { timestamp: 2 }));
    }
}
