//! WebSocket transport.
//!
//! A plain TCP listener that performs the RFC 6455 upgrade itself and then
//! exchanges one JSON message per text frame. Frames are decoded with the
//! codec in [`protocol::websocket`]; fragmented frames are not supported.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{
    encode_frame, find_request_end, handshake_response, parse_upgrade_request, try_decode_frame,
    Opcode, ProtocolError, ServerMessage, WsFrame, MAX_HANDSHAKE_SIZE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::connection::ChannelSink;
use super::{TransportError, TransportKind};
use crate::router::{ConnectionContext, MessageRouter};

const READ_CHUNK: usize = 4096;

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// A TCP listener serving WebSocket clients.
pub struct WsServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl WsServer {
    /// Bind the listener to `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "WebSocket listening");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until shutdown, serving each on its own task.
    pub async fn run(
        self,
        router: Arc<MessageRouter>,
        queue_capacity: usize,
        shutdown: CancellationToken,
    ) -> Result<(), io::Error> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept WebSocket connection");
                            continue;
                        }
                    };

                    let router = Arc::clone(&router);
                    let shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, router, queue_capacity, shutdown).await {
                            tracing::debug!(peer = %peer, error = %e, "WebSocket connection ended with error");
                        }
                    });
                }
            }
        }

        Ok(())
    }
}

/// Reads the HTTP upgrade request and answers it.
///
/// Returns any bytes that arrived after the request head; they belong to the
/// first frame.
async fn accept_upgrade(stream: &mut TcpStream) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; READ_CHUNK];

    let head_len = loop {
        if let Some(end) = find_request_end(&buf) {
            break end;
        }
        if buf.len() > MAX_HANDSHAKE_SIZE {
            let _ = stream.write_all(BAD_REQUEST).await;
            return Err(ProtocolError::HandshakeFailed("request head too large".to_string()).into());
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProtocolError::HandshakeFailed(
                "connection closed during handshake".to_string(),
            )
            .into());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_len]);
    let key = match parse_upgrade_request(&head) {
        Ok(key) => key,
        Err(e) => {
            let _ = stream.write_all(BAD_REQUEST).await;
            return Err(e.into());
        }
    };

    stream.write_all(handshake_response(&key).as_bytes()).await?;
    Ok(buf.split_off(head_len))
}

/// Serves one WebSocket client from upgrade to close.
async fn serve_connection(
    mut stream: TcpStream,
    router: Arc<MessageRouter>,
    queue_capacity: usize,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let mut pending = accept_upgrade(&mut stream).await?;
    let _ = stream.set_nodelay(true);

    let (mut read_half, write_half) = stream.into_split();
    let writer: SharedWriter = Arc::new(Mutex::new(write_half));

    let (sink, rx) = ChannelSink::new(TransportKind::WebSocket, queue_capacity);
    let hub = Arc::clone(router.registry().hub());
    let sink_id = hub.add(sink.clone());
    let writer_task = tokio::spawn(write_frames(Arc::clone(&writer), rx));

    tracing::info!(transport = %TransportKind::WebSocket, "Client connected");

    let mut ctx = ConnectionContext::new(sink.ready_flag());
    let mut chunk = [0u8; READ_CHUNK];

    let result: Result<(), TransportError> = 'conn: loop {
        // Drain every complete frame already buffered.
        loop {
            let (frame, used) = match try_decode_frame(&pending) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(e) => break 'conn Err(e.into()),
            };
            pending.drain(..used);

            match frame.opcode {
                Opcode::Text => {
                    let text = String::from_utf8_lossy(&frame.payload);
                    if let Some(reply) = router.dispatch_text(&text, &mut ctx).await {
                        if !sink.send_reply(reply).await {
                            break 'conn Ok(());
                        }
                    }
                }
                Opcode::Ping => {
                    let pong = WsFrame::pong(frame.payload).encode();
                    if let Err(e) = writer.lock().await.write_all(&pong).await {
                        break 'conn Err(e.into());
                    }
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    let echo = encode_frame(Opcode::Close, &frame.payload, None);
                    let _ = writer.lock().await.write_all(&echo).await;
                    break 'conn Ok(());
                }
                Opcode::Binary => {
                    tracing::debug!("Binary frames are not supported, closing");
                    break 'conn Ok(());
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            read = read_half.read(&mut chunk) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => pending.extend_from_slice(&chunk[..n]),
                Err(e) => break Err(e.into()),
            },
        }
    };

    hub.remove(sink_id);
    let stats = sink.stats();
    drop(sink);
    if let Ok(Err(e)) = writer_task.await {
        tracing::debug!(error = %e, "WebSocket writer finished with error");
    }
    let _ = writer.lock().await.shutdown().await;

    tracing::info!(
        transport = %TransportKind::WebSocket,
        sent = stats.events_sent,
        dropped = stats.events_dropped,
        "Client disconnected"
    );
    result
}

/// Drains the outbound queue as one text frame per message.
async fn write_frames(
    writer: SharedWriter,
    mut rx: mpsc::Receiver<ServerMessage>,
) -> Result<(), TransportError> {
    while let Some(message) = rx.recv().await {
        let json = message.to_json()?;
        let frame = WsFrame::text(&json).encode();
        writer.lock().await.write_all(&frame).await?;
    }
    Ok(())
}
