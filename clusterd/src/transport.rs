//! Delivery of Ping and RequestVote to peers
//!
//! The consensus code only needs "send a request to a peer now, pick
//! the reply up later (within a timeout)". How the bytes travel is up
//! to the implementation.
use std::time::Duration;

use clusterd_api::{PingResponse, Response, TermId, VoteDecision, VoteResponse};
use thiserror::Error;

use crate::peers::{PeerDescriptor, PeerId};

pub mod local;
pub mod tcp;

pub use self::local::{LocalNetwork, LocalTransport};
pub use self::tcp::TcpTransport;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("timeout")]
    Timeout,
    #[error("peer is unwilling to perform")]
    Unwilling,
    #[error("peer down: {0}")]
    Down(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Ping,
    Vote,
}

/// An outstanding request; redeem with [`Transport::collect`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestHandle {
    pub peer: PeerId,
    pub id: u64,
    pub kind: RequestKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PingReply {
    pub term: TermId,
    pub status: u64,
    pub highest_committed_index: i64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VoteReply {
    pub term: TermId,
    pub decision: VoteDecision,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Ping(PingReply),
    Vote(VoteReply),
}

impl Reply {
    /// Interpret a wire response to a request of `kind`
    pub fn from_response(kind: RequestKind, response: Response) -> TransportResult<Self> {
        match (kind, response) {
            (
                RequestKind::Ping,
                Response::Ping(PingResponse::Accepted {
                    term,
                    status,
                    highest_committed_index,
                }),
            ) => Ok(Reply::Ping(PingReply {
                term,
                status,
                highest_committed_index,
            })),
            (RequestKind::Vote, Response::Vote(VoteResponse::Decided { term, decision })) => {
                Ok(Reply::Vote(VoteReply { term, decision }))
            }
            (RequestKind::Ping, Response::Ping(PingResponse::Unwilling))
            | (RequestKind::Vote, Response::Vote(VoteResponse::Unwilling)) => {
                Err(TransportError::Unwilling)
            }
            (kind, response) => Err(TransportError::Protocol(format!(
                "unexpected response to {kind:?}: {response:?}"
            ))),
        }
    }
}

pub trait Transport: Send + Sync {
    /// (Re)establish the connection to `peer`
    fn connect(&self, peer: &PeerDescriptor, timeout: Duration) -> TransportResult<()>;

    /// Dispatch a Ping without waiting for the reply
    fn send_ping(
        &self,
        peer: &PeerId,
        term: TermId,
        leader: &PeerId,
    ) -> TransportResult<RequestHandle>;

    /// Dispatch a RequestVote without waiting for the reply
    fn send_vote(
        &self,
        peer: &PeerId,
        term: TermId,
        candidate: &PeerId,
    ) -> TransportResult<RequestHandle>;

    /// Wait (at most `timeout`) for the reply to a previously sent request
    fn collect(&self, handle: RequestHandle, timeout: Duration) -> TransportResult<Reply>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_response_is_protocol_error() {
        let res = Reply::from_response(
            RequestKind::Vote,
            Response::Ping(PingResponse::Accepted {
                term: TermId(1),
                status: 0,
                highest_committed_index: 0,
            }),
        );
        assert!(matches!(res, Err(TransportError::Protocol(_))));
        assert_eq!(
            Reply::from_response(RequestKind::Vote, Response::Vote(VoteResponse::Unwilling)),
            Err(TransportError::Unwilling)
        );
    }
}
