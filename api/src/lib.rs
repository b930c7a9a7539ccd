use binrw::{binrw, Endian};
use binrw::{BinRead, BinWrite};
use derive_more::Display;
use std::io::{Cursor, Read, Seek};

mod net;
pub use self::net::*;

/// Raft term (election id)
///
/// Terms only ever grow, both in memory and on disk.
#[derive(
    Copy, Clone, Debug, Default, BinRead, BinWrite, PartialEq, Eq, PartialOrd, Ord, Hash, Display,
)]
#[br(big)]
#[bw(big)]
pub struct TermId(pub u64);

impl TermId {
    pub const BYTE_SIZE: usize = 8;

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Name of a cluster member (usually its FQDN)
///
/// On the wire: 2B big endian length followed by UTF-8 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[binrw]
#[brw(big)]
pub struct PeerName(
    #[br(parse_with(PeerName::parse))]
    #[bw(write_with(PeerName::write))]
    pub String,
);

impl PeerName {
    pub const MAX_LEN: usize = 1024;

    fn parse<R: Read + Seek>(reader: &mut R, _endian: Endian, _: ()) -> binrw::BinResult<String> {
        let mut len = [0u8; 2];
        reader.read_exact(&mut len)?;
        let len = usize::from(u16::from_be_bytes(len));
        if Self::MAX_LEN < len {
            return Err(binrw::Error::AssertFail {
                pos: reader.stream_position()?,
                message: format!("peer name too long: {len}"),
            });
        }
        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;

        String::from_utf8(bytes).map_err(|e| binrw::Error::AssertFail {
            pos: 0,
            message: format!("peer name is not utf8: {e}"),
        })
    }

    #[allow(clippy::ptr_arg)]
    fn write<W: binrw::io::Write + binrw::io::Seek>(
        name: &String,
        writer: &mut W,
        _endian: Endian,
        _: (),
    ) -> binrw::BinResult<()> {
        let len = match u16::try_from(name.len()) {
            Ok(len) if name.len() <= Self::MAX_LEN => len,
            _ => {
                return Err(binrw::Error::AssertFail {
                    pos: writer.stream_position()?,
                    message: format!("peer name too long: {}", name.len()),
                })
            }
        };
        writer.write_all(&len.to_be_bytes())?;
        writer.write_all(name.as_bytes())?;

        Ok(())
    }
}

impl From<&str> for PeerName {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Prefix `body` with a [`FrameHeader`]
pub(crate) fn frame(body: Vec<u8>) -> binrw::BinResult<Vec<u8>> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= FrameHeader::MAX_LEN)
        .ok_or_else(|| binrw::Error::AssertFail {
            pos: 0,
            message: format!("frame too large: {}", body.len()),
        })?;

    let mut buf = Cursor::new(Vec::with_capacity(FrameHeader::BYTE_SIZE + body.len()));
    FrameHeader { len }.write(&mut buf)?;
    let mut buf = buf.into_inner();
    buf.extend_from_slice(&body);
    Ok(buf)
}

#[test]
fn peer_name_rejects_invalid_utf8() {
    let bytes = [0u8, 2, 0xff, 0xfe];
    assert!(PeerName::read(&mut Cursor::new(&bytes[..])).is_err());
}
