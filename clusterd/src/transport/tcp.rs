use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use binrw::BinRead;
use clusterd_api::{
    ConnectionHello, FrameHeader, PingRequest, Request, Response, TermId, VoteRequest,
    CLUSTERD_VERSION_0,
};
use convi::ExpectFrom;
use tracing::{debug, trace};

use super::{Reply, RequestHandle, RequestKind, Transport, TransportError, TransportResult};
use crate::peers::{PeerDescriptor, PeerId};

/// Read timeout used when discarding a reply nobody collected
const STALE_REPLY_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Default)]
struct PeerConn {
    stream: Option<TcpStream>,
    /// Request sent, reply not read yet
    pending: Option<(u64, RequestKind)>,
}

impl PeerConn {
    fn stream(&mut self) -> TransportResult<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| TransportError::Down("not connected".into()))
    }

    /// Forget the connection after any error; the keeper will redo it
    fn fail(&mut self, err: TransportError) -> TransportError {
        self.stream = None;
        self.pending = None;
        err
    }
}

/// Blocking, one-connection-per-peer TCP transport
///
/// Requests to a given peer are strictly sequential: one outstanding
/// request per connection. Requests to different peers overlap, which
/// is what makes sending to everyone first and collecting afterwards
/// worthwhile.
#[derive(Default)]
pub struct TcpTransport {
    conns: RwLock<HashMap<PeerId, Arc<Mutex<PeerConn>>>>,
    next_request_id: AtomicU64,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn conn(&self, peer: &PeerId) -> Arc<Mutex<PeerConn>> {
        if let Some(conn) = self.conns.read().expect("Locking failed").get(peer) {
            return conn.clone();
        }
        self.conns
            .write()
            .expect("Locking failed")
            .entry(peer.clone())
            .or_default()
            .clone()
    }

    fn open(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
        let mut last_err = None;
        for sock_addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sock_addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {addr}"))
        }))
    }

    fn handshake(stream: &mut TcpStream, timeout: Duration) -> TransportResult<()> {
        // We always prepare exact buffers to be sent immediately
        stream.set_nodelay(true).map_err(down)?;
        stream.set_read_timeout(Some(timeout)).map_err(down)?;
        stream.set_write_timeout(Some(timeout)).map_err(down)?;

        let mut buf = [0u8; ConnectionHello::BYTE_SIZE];
        stream.read_exact(&mut buf).map_err(io_error)?;
        let hello = ConnectionHello::read(&mut Cursor::new(&buf)).map_err(protocol)?;

        if hello.version != CLUSTERD_VERSION_0 {
            return Err(TransportError::Protocol(format!(
                "unsupported protocol version {}",
                hello.version
            )));
        }
        Ok(())
    }

    fn read_frame(stream: &mut TcpStream) -> TransportResult<Response> {
        let mut header_buf = [0u8; FrameHeader::BYTE_SIZE];
        stream.read_exact(&mut header_buf).map_err(io_error)?;
        let header = FrameHeader::read(&mut Cursor::new(&header_buf)).map_err(protocol)?;

        if FrameHeader::MAX_LEN < header.len {
            return Err(TransportError::Protocol(format!(
                "frame too long: {}",
                header.len
            )));
        }

        let mut body = vec![0u8; usize::expect_from(header.len)];
        stream.read_exact(&mut body).map_err(io_error)?;
        Response::from_frame_body(&body).map_err(protocol)
    }

    fn send(
        &self,
        peer: &PeerId,
        request: Request,
        kind: RequestKind,
    ) -> TransportResult<RequestHandle> {
        let frame = request.to_frame().map_err(protocol)?;

        let conn = self.conn(peer);
        let mut conn = conn.lock().expect("Locking failed");

        if let Some((id, stale_kind)) = conn.pending.take() {
            // Nobody waited for the previous reply; it has to be consumed
            // before the stream can carry anything else
            trace!(%peer, id, ?stale_kind, "Discarding uncollected reply");
            let res = conn.stream().and_then(|stream| {
                stream
                    .set_read_timeout(Some(STALE_REPLY_TIMEOUT))
                    .map_err(down)?;
                Self::read_frame(stream)
            });
            if let Err(e) = res {
                return Err(conn.fail(e));
            }
        }

        let res = conn
            .stream()
            .and_then(|stream| stream.write_all(&frame).map_err(io_error));
        if let Err(e) = res {
            return Err(conn.fail(e));
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        conn.pending = Some((id, kind));

        Ok(RequestHandle {
            peer: peer.clone(),
            id,
            kind,
        })
    }
}

fn down(e: io::Error) -> TransportError {
    TransportError::Down(e.to_string())
}

fn io_error(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout,
        _ => down(e),
    }
}

fn protocol(e: binrw::Error) -> TransportError {
    TransportError::Protocol(e.to_string())
}

impl Transport for TcpTransport {
    fn connect(&self, peer: &PeerDescriptor, timeout: Duration) -> TransportResult<()> {
        debug!(peer = %peer.id, addr = %peer.addr, "Connecting to peer");

        let mut stream = Self::open(&peer.addr, timeout).map_err(io_error)?;
        Self::handshake(&mut stream, timeout)?;

        let conn = self.conn(&peer.id);
        let mut conn = conn.lock().expect("Locking failed");
        conn.stream = Some(stream);
        conn.pending = None;

        trace!(peer = %peer.id, "Connected");
        Ok(())
    }

    fn send_ping(
        &self,
        peer: &PeerId,
        term: TermId,
        leader: &PeerId,
    ) -> TransportResult<RequestHandle> {
        self.send(
            peer,
            Request::Ping(PingRequest {
                term,
                leader: leader.into(),
            }),
            RequestKind::Ping,
        )
    }

    fn send_vote(
        &self,
        peer: &PeerId,
        term: TermId,
        candidate: &PeerId,
    ) -> TransportResult<RequestHandle> {
        self.send(
            peer,
            Request::Vote(VoteRequest {
                term,
                candidate: candidate.into(),
            }),
            RequestKind::Vote,
        )
    }

    fn collect(&self, handle: RequestHandle, timeout: Duration) -> TransportResult<Reply> {
        let conn = self.conn(&handle.peer);
        let mut conn = conn.lock().expect("Locking failed");

        match conn.pending {
            Some((id, _)) if id == handle.id => conn.pending = None,
            _ => {
                return Err(TransportError::Protocol(format!(
                    "no outstanding request {}",
                    handle.id
                )))
            }
        }

        let res = conn.stream().and_then(|stream| {
            stream.set_read_timeout(Some(timeout)).map_err(down)?;
            Self::read_frame(stream)
        });

        // A timed out reply could still show up later and desync the
        // stream, so every error drops the connection
        match res.and_then(|response| Reply::from_response(handle.kind, response)) {
            Ok(reply) => Ok(reply),
            Err(TransportError::Unwilling) => Err(TransportError::Unwilling),
            Err(e) => Err(conn.fail(e)),
        }
    }
}
