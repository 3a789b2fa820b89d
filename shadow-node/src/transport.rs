//! TCP transport: hello exchange, then length-prefixed frames in both directions.
//! One reader task and one writer task per session; the event loop owns the core.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use shadow_core::wire::{frame_len, LEN_SIZE};
use shadow_core::{
    encode_frame, ConnectionEvent, ConnectionHandle, FrameDecodeError, FrameEncodeError, Hello,
    NodeId,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::node::NodeEvent;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("frame: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("bad hello: {0}")]
    Hello(#[from] serde_json::Error),
    #[error("peer closed before hello")]
    ClosedBeforeHello,
    #[error("invalid node id in hello: {0:?}")]
    InvalidId(String),
    #[error("expected {expected}, reached {actual}")]
    UnexpectedPeer { expected: NodeId, actual: NodeId },
    #[error("handshake timed out")]
    Timeout,
    #[error("no directory entry for {0}")]
    Unresolved(NodeId),
}

/// Read one frame payload. `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Vec<u8>>, NodeError> {
    let mut len_buf = [0u8; LEN_SIZE];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = frame_len(len_buf)?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Send our hello, read theirs. Both sides write first; hellos are small enough not to block.
async fn exchange_hello(stream: &mut TcpStream, me: &NodeId) -> Result<NodeId, NodeError> {
    let out = encode_frame(&Hello { hello: me.clone() })?;
    stream.write_all(&out).await?;
    stream.flush().await?;
    let payload = read_frame(stream)
        .await?
        .ok_or(NodeError::ClosedBeforeHello)?;
    let hello: Hello = serde_json::from_slice(&payload)?;
    match NodeId::sanitized(hello.hello.as_str()) {
        Some(id) if id == hello.hello => Ok(id),
        _ => Err(NodeError::InvalidId(hello.hello.to_string())),
    }
}

/// Inbound side of the hello exchange. Returns the remote's node ID.
pub async fn accept_hello(
    stream: &mut TcpStream,
    me: &NodeId,
    timeout: Duration,
) -> Result<NodeId, NodeError> {
    tokio::time::timeout(timeout, exchange_hello(stream, me))
        .await
        .map_err(|_| NodeError::Timeout)?
}

/// Connect to `addr` and confirm it answers as `expected`.
pub async fn dial(
    addr: SocketAddr,
    me: &NodeId,
    expected: &NodeId,
    timeout: Duration,
) -> Result<TcpStream, NodeError> {
    let attempt = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let actual = exchange_hello(&mut stream, me).await?;
        if &actual != expected {
            return Err(NodeError::UnexpectedPeer {
                expected: expected.clone(),
                actual,
            });
        }
        Ok::<_, NodeError>(stream)
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| NodeError::Timeout)?
}

/// Accept until the listener fails. Each accepted stream completes its hello on its own task and
/// is handed to the event loop as `NodeEvent::Accepted`.
pub async fn accept_loop(
    listener: TcpListener,
    me: NodeId,
    timeout: Duration,
    events: mpsc::UnboundedSender<NodeEvent>,
) -> io::Result<()> {
    loop {
        let (mut stream, addr) = listener.accept().await?;
        let me = me.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            match accept_hello(&mut stream, &me, timeout).await {
                Ok(remote) => {
                    let _ = events.send(NodeEvent::Accepted { remote, stream });
                }
                Err(e) => tracing::warn!(%addr, error = %e, "inbound hello failed"),
            }
        });
    }
}

/// A live transport session: queued writer plus reader task.
pub struct Session {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    /// Split `stream` into reader and writer tasks. Payloads go to `events` as `Data`; the end of
    /// the stream is reported once as `Connection { Closed | Failed }`.
    pub fn spawn(
        stream: TcpStream,
        remote: NodeId,
        handle: ConnectionHandle,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (mut reader, mut writer) = stream.into_split();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if writer.write_all(&frame).await.is_err() {
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });
        let reader = tokio::spawn(async move {
            let event = loop {
                match read_frame(&mut reader).await {
                    Ok(Some(payload)) => {
                        let data = NodeEvent::Data {
                            remote: remote.clone(),
                            handle,
                            payload,
                        };
                        if events.send(data).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break ConnectionEvent::Closed,
                    Err(e) => {
                        break ConnectionEvent::Failed {
                            reason: e.to_string(),
                        }
                    }
                }
            };
            let _ = events.send(NodeEvent::Connection {
                remote,
                handle,
                event,
            });
        });
        Self { tx, reader, writer }
    }

    /// Queue a complete frame. False if the writer is gone.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.tx.send(frame).is_ok()
    }

    /// Stop reading; queued frames are flushed before the write half shuts down. The returned
    /// handle finishes once the writer is done.
    pub fn close(self) -> JoinHandle<()> {
        self.reader.abort();
        self.writer
    }
}
