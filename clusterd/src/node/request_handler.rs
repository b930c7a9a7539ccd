use std::io::{self, Cursor};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use binrw::{BinRead, BinWrite};
use clusterd_api::{ConnectionHello, FrameHeader, Request, CLUSTERD_VERSION_0};
use convi::ExpectFrom;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace};

use crate::engine::{ConsensusEngine, HandlerError};
use crate::task::AutoJoinHandle;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("invalid data")]
    Invalid,
    #[error("invalid data: {0}")]
    ParseError(#[from] binrw::Error),
    #[error("io: {0}")]
    IO(#[from] io::Error),
    #[error("join: {0}")]
    JoinError(#[from] tokio::task::JoinError),
    #[error("handler: {0}")]
    Handler(#[from] HandlerError),
}

pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Serves Ping and RequestVote from peers
///
/// Runs its own tokio runtime on a dedicated thread. Handlers take the
/// cluster lock and may fsync, so they run on the blocking pool.
pub struct RequestHandler {
    local_addr: SocketAddr,
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl RequestHandler {
    /// How often idle loops check for shutdown
    const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

    pub fn new(engine: Arc<ConsensusEngine>, listen_addr: SocketAddr) -> anyhow::Result<Self> {
        let rt = tokio::runtime::Runtime::new()?;

        let (tx, rx) = flume::bounded(1);

        let join_handle = AutoJoinHandle::spawn_res(
            "request-handler",
            move || -> Result<(), io::Error> {
                let _guard = scopeguard::guard((), |_| {
                    info!("RequestHandler is done");
                });
                let panic_guard = engine.panic_guard("request-handler");

                rt.block_on(async {
                    let bound = async {
                        let listener = TcpListener::bind(listen_addr).await?;
                        let local_addr = listener.local_addr()?;
                        Ok::<_, io::Error>((listener, local_addr))
                    }
                    .await;

                    match bound {
                        Ok((listener, local_addr)) => {
                            let _ = tx.send(Ok(local_addr));
                            handle_requests(engine.clone(), listener).await;
                        }
                        // reported to `new` through the channel
                        Err(e) => {
                            let _ = tx.send(Err(e));
                        }
                    }
                });

                debug!("Waiting for RequestHandler to complete all connections...");
                rt.shutdown_timeout(Duration::from_secs(5));
                panic_guard.done();

                Ok(())
            },
        );

        let local_addr = rx
            .recv()?
            .map_err(|e| anyhow::format_err!("binding {listen_addr}: {e}"))?;

        info!(%local_addr, "Listening for peers");

        Ok(Self {
            join_handle,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn handle_requests(engine: Arc<ConsensusEngine>, listener: TcpListener) {
    while !engine.is_shutting_down() {
        let (mut stream, peer_addr) =
            // bound by a timeout, so we can exit after shutdown in a reasonable time
            match timeout(RequestHandler::SHUTDOWN_POLL, listener.accept()).await {
                Ok(Ok(o)) => o,
                Ok(Err(e)) => {
                    error!(%e, "request handling listener accept error");
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }
                Err(_) => {
                    // just a timeout
                    continue;
                }
            };

        debug!(%peer_addr, "New peer connection");

        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(&engine, &mut stream).await {
                debug!(%peer_addr, "Connection error: {}", e);
            }
        });
    }
}

async fn handle_connection(
    engine: &Arc<ConsensusEngine>,
    stream: &mut TcpStream,
) -> ConnectionResult<()> {
    // We always prepare exact buffers to be sent immediately
    stream.set_nodelay(true)?;
    handle_connection_init(stream).await?;
    handle_connection_loop(engine, stream).await?;
    Ok(())
}

async fn handle_connection_init(stream: &mut TcpStream) -> ConnectionResult<()> {
    let hello = ConnectionHello {
        version: CLUSTERD_VERSION_0,
    };

    let mut buf = Cursor::new(vec![]);
    hello.write(&mut buf)?;
    stream.write_all(buf.get_ref()).await?;
    Ok(())
}

async fn handle_connection_loop(
    engine: &Arc<ConsensusEngine>,
    stream: &mut TcpStream,
) -> ConnectionResult<()> {
    let mut header_buf = [0u8; FrameHeader::BYTE_SIZE];

    while !engine.is_shutting_down() {
        // `read_exact` would lose a partially read header on timeout,
        // so only the wait for readiness is bounded
        match timeout(RequestHandler::SHUTDOWN_POLL, stream.readable()).await {
            Ok(res) => {
                res?;
            }
            Err(_) => continue,
        }
        stream.read_exact(&mut header_buf).await?;

        let header = FrameHeader::read(&mut Cursor::new(&header_buf))?;
        if FrameHeader::MAX_LEN < header.len {
            return Err(ConnectionError::Invalid);
        }

        let mut body = vec![0u8; usize::expect_from(header.len)];
        stream.read_exact(&mut body).await?;
        let request = Request::from_frame_body(&body)?;
        trace!(?request, "Request");

        let response = tokio::task::spawn_blocking({
            let engine = engine.clone();
            move || engine.handle_request(request)
        })
        .await??;

        stream.write_all(&response.to_frame()?).await?;
    }

    Ok(())
}
