use binrw::{binrw, BinRead, BinWrite};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io::Cursor;

use crate::{frame, PeerName, TermId};

pub const CLUSTERD_VERSION_0: u8 = 0;

/// Connection header
///
/// On every connect server sends some initial data.
#[derive(BinRead, BinWrite, Debug, Copy, Clone)]
#[br(big)]
#[bw(big)]
pub struct ConnectionHello {
    /// Protocol version
    pub version: u8,
}

impl ConnectionHello {
    pub const BYTE_SIZE: usize = 1;
}

/// Every request and response is prefixed with its length
#[derive(BinRead, BinWrite, Debug, Copy, Clone)]
#[br(big)]
#[bw(big)]
pub struct FrameHeader {
    pub len: u32,
}

impl FrameHeader {
    pub const BYTE_SIZE: usize = 4;
    /// Nothing we send is anywhere near this
    pub const MAX_LEN: u32 = 16 * 1024;
}

/// Heartbeat sent by the leader to every active peer
#[derive(Debug, Clone, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct PingRequest {
    /// Term the sender is leading
    pub term: TermId,
    pub leader: PeerName,
}

/// Sent by a candidate to every active, connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct VoteRequest {
    /// Term the candidate is running in (already persisted by the candidate)
    pub term: TermId,
    pub candidate: PeerName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub enum Request {
    #[brw(magic(1u8))]
    Ping(PingRequest),
    #[brw(magic(2u8))]
    Vote(VoteRequest),
}

impl Request {
    /// Serialize into a complete frame (header included)
    pub fn to_frame(&self) -> binrw::BinResult<Vec<u8>> {
        let mut body = Cursor::new(vec![]);
        self.write(&mut body)?;
        frame(body.into_inner())
    }

    /// Parse a frame body (header already stripped)
    pub fn from_frame_body(body: &[u8]) -> binrw::BinResult<Self> {
        Self::read(&mut Cursor::new(body))
    }
}

/// Voter's decision on a [`VoteRequest`]
#[derive(
    TryFromPrimitive, IntoPrimitive, Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy,
)]
#[repr(u8)]
#[binrw]
#[brw(repr = u8)]
pub enum VoteDecision {
    Granted = 0,
    /// Already voted for someone else in this term
    Denied = 1,
    /// Candidate's term is behind ours
    Stale = 2,
}

impl VoteDecision {
    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub enum PingResponse {
    #[brw(magic(0u8))]
    Accepted {
        /// Term of the responder after handling the ping
        term: TermId,
        status: u64,
        highest_committed_index: i64,
    },
    /// Responder does not take part in the consensus (yet)
    #[brw(magic(1u8))]
    Unwilling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub enum VoteResponse {
    #[brw(magic(0u8))]
    Decided {
        /// Term of the responder after handling the request
        term: TermId,
        decision: VoteDecision,
    },
    /// Responder does not take part in the consensus (yet)
    #[brw(magic(1u8))]
    Unwilling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub enum Response {
    #[brw(magic(1u8))]
    Ping(PingResponse),
    #[brw(magic(2u8))]
    Vote(VoteResponse),
}

impl Response {
    pub fn to_frame(&self) -> binrw::BinResult<Vec<u8>> {
        let mut body = Cursor::new(vec![]);
        self.write(&mut body)?;
        frame(body.into_inner())
    }

    pub fn from_frame_body(body: &[u8]) -> binrw::BinResult<Self> {
        Self::read(&mut Cursor::new(body))
    }
}

#[test]
fn vote_request_frame() {
    let req = Request::Vote(VoteRequest {
        term: TermId(0x0102030405060708),
        candidate: PeerName::from("a.example.com"),
    });
    let frame = req.to_frame().unwrap();

    let header = FrameHeader::read(&mut Cursor::new(&frame[..FrameHeader::BYTE_SIZE])).unwrap();
    assert_eq!(
        usize::try_from(header.len).unwrap(),
        frame.len() - FrameHeader::BYTE_SIZE
    );
    // magic, term, name length
    assert_eq!(frame[4], 2);
    assert_eq!(&frame[5..13], &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(&frame[13..15], &[0, 13]);
    assert_eq!(
        Request::from_frame_body(&frame[FrameHeader::BYTE_SIZE..]).unwrap(),
        req
    );
}

#[test]
fn unknown_vote_decision_is_rejected() {
    let body = [2u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 7];
    assert!(Response::from_frame_body(&body).is_err());
}
