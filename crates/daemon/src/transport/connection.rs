//! Per-connection plumbing shared by every transport.
//!
//! A connection owns a bounded outbound queue drained by a writer task. Hub
//! events are offered with `try_send` and dropped when the queue is full, so
//! a slow client never stalls a session's reader thread; request replies are
//! awaited on the same queue and are never dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use protocol::ServerMessage;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{TransportError, TransportKind};
use crate::router::{ConnectionContext, MessageRouter};
use crate::session::EventSink;

/// Statistics about a sink's event handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Events queued successfully.
    pub events_sent: u64,
    /// Events dropped because the queue was full.
    pub events_dropped: u64,
    /// Whether the sink is currently dropping events.
    pub is_backpressured: bool,
}

/// Hub sink feeding one connection's outbound queue.
pub struct ChannelSink {
    kind: TransportKind,
    tx: mpsc::Sender<ServerMessage>,
    ready: Arc<AtomicBool>,
    backpressured: AtomicBool,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Creates a sink with a queue of `capacity` messages.
    pub fn new(kind: TransportKind, capacity: usize) -> (Arc<Self>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = ChannelSink {
            kind,
            tx,
            ready: Arc::new(AtomicBool::new(false)),
            backpressured: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        };
        (Arc::new(sink), rx)
    }

    /// The readiness flag shared with the connection's routing context.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    /// Queues a request reply, waiting for room if necessary.
    ///
    /// Returns `false` once the writer side has gone away.
    pub async fn send_reply(&self, reply: ServerMessage) -> bool {
        self.tx.send(reply).await.is_ok()
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            events_sent: self.sent.load(Ordering::Relaxed),
            events_dropped: self.dropped.load(Ordering::Relaxed),
            is_backpressured: self.backpressured.load(Ordering::Relaxed),
        }
    }
}

impl EventSink for ChannelSink {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn send_event(&self, event: ServerMessage) {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                if self.backpressured.swap(false, Ordering::Relaxed) {
                    tracing::debug!(transport = %self.kind, "Client recovered from backpressure");
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if !self.backpressured.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        transport = %self.kind,
                        dropped,
                        "Client is backpressured, dropping events"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!(transport = %self.kind, "Client channel closed");
            }
        }
    }
}

/// Serves one newline-delimited JSON connection until EOF, error or shutdown.
///
/// Used by both the stdio and Unix socket transports.
pub async fn serve_lines<R, W>(
    reader: R,
    writer: W,
    router: Arc<MessageRouter>,
    kind: TransportKind,
    queue_capacity: usize,
    shutdown: CancellationToken,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (sink, rx) = ChannelSink::new(kind, queue_capacity);
    let hub = Arc::clone(router.registry().hub());
    let sink_id = hub.add(sink.clone());
    let writer_task = tokio::spawn(write_lines(writer, rx, kind));

    tracing::info!(transport = %kind, "Client connected");

    let mut ctx = ConnectionContext::new(sink.ready_flag());
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            read = reader.read_until(b'\n', &mut line) => match read {
                Ok(0) => break Ok(()),
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line).into_owned();
                    line.clear();
                    if let Some(reply) = router.dispatch_text(&text, &mut ctx).await {
                        if !sink.send_reply(reply).await {
                            break Ok(());
                        }
                    }
                }
                Err(e) => break Err(TransportError::Io(e)),
            },
        }
    };

    hub.remove(sink_id);
    let stats = sink.stats();
    drop(sink);
    if let Ok(Err(e)) = writer_task.await {
        tracing::debug!(transport = %kind, error = %e, "Writer finished with error");
    }

    tracing::info!(
        transport = %kind,
        sent = stats.events_sent,
        dropped = stats.events_dropped,
        "Client disconnected"
    );
    result
}

/// Drains the outbound queue as one JSON object per line.
async fn write_lines<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<ServerMessage>,
    kind: TransportKind,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut json = message.to_json()?;
        json.push('\n');
        if let Err(e) = writer.write_all(json.as_bytes()).await {
            tracing::debug!(transport = %kind, error = %e, "Write failed, closing writer");
            return Err(e.into());
        }
        // Batch whatever is already queued before flushing.
        if rx.is_empty() {
            writer.flush().await?;
        }
    }
    writer.flush().await?;
    Ok(())
}
