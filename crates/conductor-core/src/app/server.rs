//! ControlServer - worker 接続の accept ループ
//!
//! 1 接続につき:
//! - 最初のフレームは IDENTIFY（タイムアウトあり）
//! - 書き込みは専用の writer タスク 1 つだけ（フレームが混ざらない）
//! - 壊れたフレームはログに出して読み飛ばす

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::LinesCodecError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::orchestrator::Orchestrator;
use crate::app::session::{ConnectionSession, WorkerIdentity};
use crate::error::{ConductorError, Result};
use crate::protocol::{ControlMessage, FrameTransport, WorkerMessage, decode, encode, framed};

/// How long a new connection has to send IDENTIFY.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type FrameSink = SplitSink<FrameTransport<TcpStream>, String>;
type FrameStream = SplitStream<FrameTransport<TcpStream>>;

pub struct ControlServer {
    listener: TcpListener,
    orchestrator: Arc<Orchestrator>,
}

impl ControlServer {
    pub async fn bind(addr: &str, orchestrator: Arc<Orchestrator>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "control server listening");
        Ok(Self {
            listener,
            orchestrator,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown`; each connection runs on its own task.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("control server stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let orchestrator = Arc::clone(&self.orchestrator);
                        let closed = shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(orchestrator, stream, peer, closed).await {
                                warn!(%peer, error = %e, "worker connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
    }
}

async fn serve_connection(
    orchestrator: Arc<Orchestrator>,
    stream: TcpStream,
    peer: SocketAddr,
    closed: CancellationToken,
) -> Result<()> {
    let (sink, mut frames) = framed(stream).split();

    let identity = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_identify(&mut frames)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ConductorError::Protocol(format!(
                "no IDENTIFY from {peer} within {}s",
                HANDSHAKE_TIMEOUT.as_secs()
            )));
        }
    };
    info!(%peer, hostname = %identity.hostname, "worker identified");

    let (tx, rx) = mpsc::unbounded_channel();
    let session = Arc::new(ConnectionSession::new(tx, closed.clone()));
    let session_id = orchestrator.session_opened(identity, session);
    let writer = tokio::spawn(write_frames(sink, rx, closed.clone()));

    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                debug!(session = %session_id, "session closed by registry");
                break;
            }
            frame = frames.next() => match frame {
                None => {
                    info!(session = %session_id, "worker hung up");
                    break;
                }
                Some(Ok(line)) => match decode::<WorkerMessage>(&line) {
                    Ok(message) => {
                        if let Err(e) = orchestrator.handle_worker_message(session_id, message).await {
                            warn!(session = %session_id, error = %e, "failed to handle worker frame");
                        }
                    }
                    Err(e) => warn!(session = %session_id, error = %e, "malformed frame skipped"),
                },
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(session = %session_id, "oversized frame skipped");
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    warn!(session = %session_id, error = %e, "read failed");
                    break;
                }
            },
        }
    }

    closed.cancel();
    if let Err(e) = writer.await {
        warn!(session = %session_id, error = %e, "writer task panicked");
    }
    orchestrator.session_closed(session_id).await
}

async fn read_identify(frames: &mut FrameStream) -> Result<WorkerIdentity> {
    loop {
        match frames.next().await {
            None => return Err(ConductorError::Protocol("closed before IDENTIFY".into())),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => continue,
            Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
            Some(Ok(line)) => match decode::<WorkerMessage>(&line) {
                Ok(WorkerMessage::Identify {
                    hostname,
                    working_directory,
                }) => {
                    return Ok(WorkerIdentity {
                        hostname,
                        working_directory,
                    });
                }
                Ok(other) => {
                    return Err(ConductorError::Protocol(format!(
                        "expected IDENTIFY, got {other:?}"
                    )));
                }
                Err(e) => warn!(error = %e, "malformed handshake frame skipped"),
            },
        }
    }
}

/// The single writer of a connection.
async fn write_frames(
    mut sink: FrameSink,
    mut rx: mpsc::UnboundedReceiver<ControlMessage>,
    closed: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let line = match encode(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode control frame");
                continue;
            }
        };
        if let Err(e) = sink.send(line).await {
            warn!(error = %e, "write failed; closing session");
            closed.cancel();
            break;
        }
    }
    let _ = sink.close().await;
}
