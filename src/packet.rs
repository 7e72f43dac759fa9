use std::{cmp::Ordering, io};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::coding::{self, BufExt, BufMutExt};
use crate::crypto::HeaderKey;
use crate::shared::ConnectionId;
use crate::{MAX_CID_SIZE, VERSION};

// Header protection makes it impossible to decode a header (which contains a
// variable-length packet number) without crypto context, and the right context
// depends on the packet type. We therefore decode in two phases: first the
// cleartext invariants (type, version, connection IDs, payload length), which
// identify the epoch whose header key applies, and then the protected
// remainder once the caller has supplied that key.
#[derive(Debug)]
pub(crate) struct PartialDecode {
    plain_header: PlainHeader,
    buf: io::Cursor<BytesMut>,
}

impl PartialDecode {
    /// Separates the first packet of a datagram from any coalesced remainder
    pub fn new(bytes: BytesMut) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut buf = io::Cursor::new(bytes);
        let plain_header = PlainHeader::decode(&mut buf)?;
        let dgram_len = buf.get_ref().len();
        let packet_len = plain_header
            .payload_len()
            .map(|len| (buf.position() + len) as usize)
            .unwrap_or(dgram_len);
        match dgram_len.cmp(&packet_len) {
            Ordering::Equal => Ok((Self { plain_header, buf }, None)),
            Ordering::Less => Err(PacketDecodeError::InvalidHeader(
                "packet too short to contain payload length",
            )),
            Ordering::Greater => {
                let rest = Some(buf.get_mut().split_off(packet_len));
                Ok((Self { plain_header, buf }, rest))
            }
        }
    }

    pub fn space(&self) -> Option<SpaceId> {
        use self::PlainHeader::*;
        match self.plain_header {
            Initial { .. } => Some(SpaceId::Initial),
            Long {
                ty: LongType::Handshake,
                ..
            } => Some(SpaceId::Handshake),
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => Some(SpaceId::Data),
            Short { .. } => Some(SpaceId::Data),
            _ => None,
        }
    }

    pub fn is_0rtt(&self) -> bool {
        match self.plain_header {
            PlainHeader::Long { ty, .. } => ty == LongType::ZeroRtt,
            _ => false,
        }
    }

    /// Length of the packet being decoded
    pub fn len(&self) -> usize {
        self.buf.get_ref().len()
    }

    pub fn dst_cid(&self) -> ConnectionId {
        use self::PlainHeader::*;
        match self.plain_header {
            Initial { dst_cid, .. } => dst_cid,
            Long { dst_cid, .. } => dst_cid,
            Retry { dst_cid, .. } => dst_cid,
            Short { dst_cid } => dst_cid,
            VersionNegotiate { dst_cid, .. } => dst_cid,
        }
    }

    pub fn src_cid(&self) -> Option<ConnectionId> {
        use self::PlainHeader::*;
        match self.plain_header {
            Initial { src_cid, .. } => Some(src_cid),
            Long { src_cid, .. } => Some(src_cid),
            Retry { src_cid, .. } => Some(src_cid),
            VersionNegotiate { src_cid, .. } => Some(src_cid),
            Short { .. } => None,
        }
    }

    pub fn finish(self, header_key: Option<&HeaderKey>) -> Result<Packet, PacketDecodeError> {
        use self::PlainHeader::*;
        let Self {
            plain_header,
            mut buf,
        } = self;

        if let Initial {
            dst_cid,
            src_cid,
            token_pos,
            ..
        } = plain_header
        {
            let number = Self::decrypt_header(&mut buf, header_key.unwrap())?;
            let header_len = buf.position() as usize;
            let mut bytes = buf.into_inner();
            let header_data = bytes.split_to(header_len).freeze();
            let token = header_data.slice(token_pos.clone());
            return Ok(Packet {
                header: Header::Initial {
                    dst_cid,
                    src_cid,
                    token,
                    number,
                },
                header_data,
                payload: bytes,
            });
        }

        let header = match plain_header {
            Long {
                ty,
                dst_cid,
                src_cid,
                ..
            } => Header::Long {
                ty,
                dst_cid,
                src_cid,
                number: Self::decrypt_header(&mut buf, header_key.unwrap())?,
            },
            Retry {
                dst_cid,
                src_cid,
                orig_dst_cid,
            } => Header::Retry {
                dst_cid,
                src_cid,
                orig_dst_cid,
            },
            Short { dst_cid, .. } => {
                let number = Self::decrypt_header(&mut buf, header_key.unwrap())?;
                let key_phase = buf.get_ref()[0] & KEY_PHASE_BIT != 0;
                Header::Short {
                    key_phase,
                    dst_cid,
                    number,
                }
            }
            VersionNegotiate { dst_cid, src_cid } => Header::VersionNegotiate { dst_cid, src_cid },
            Initial { .. } => unreachable!(),
        };

        let header_len = buf.position() as usize;
        let mut bytes = buf.into_inner();
        Ok(Packet {
            header,
            header_data: bytes.split_to(header_len).freeze(),
            payload: bytes,
        })
    }

    fn decrypt_header(
        buf: &mut io::Cursor<BytesMut>,
        header_key: &HeaderKey,
    ) -> Result<PacketNumber, PacketDecodeError> {
        let packet_length = buf.get_ref().len();
        let pn_offset = buf.position() as usize;
        if packet_length < pn_offset + 4 + header_key.sample_size() {
            return Err(PacketDecodeError::InvalidHeader(
                "packet too short to extract header protection sample",
            ));
        }

        header_key.decrypt(pn_offset, buf.get_mut());

        let len = PacketNumber::decode_len(buf.get_ref()[0]);
        PacketNumber::decode(len, buf)
    }
}

pub(crate) struct Packet {
    pub header: Header,
    pub header_data: Bytes,
    pub payload: BytesMut,
}

#[derive(Debug, Clone)]
pub(crate) enum Header {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        orig_dst_cid: ConnectionId,
    },
    Short {
        key_phase: bool,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    VersionNegotiate {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

impl Header {
    pub fn encode(&self, w: &mut Vec<u8>) -> PartialEncode {
        use self::Header::*;
        match *self {
            Initial {
                ref dst_cid,
                ref src_cid,
                ref token,
                number,
            } => {
                w.write(LONG_HEADER_FORM | FIXED_BIT | number.tag());
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.write_var(token.len() as u64);
                w.put_slice(token);
                w.write::<u16>(0); // Payload length placeholder; filled by `PartialEncode::finish`
                number.encode(w);
                PartialEncode {
                    header_len: w.len(),
                    pn: Some((number.len(), true)),
                }
            }
            Long {
                ty,
                ref dst_cid,
                ref src_cid,
                number,
            } => {
                w.write(LONG_HEADER_FORM | FIXED_BIT | (ty as u8) << 4 | number.tag());
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.write::<u16>(0); // Payload length placeholder
                number.encode(w);
                PartialEncode {
                    header_len: w.len(),
                    pn: Some((number.len(), true)),
                }
            }
            Short {
                key_phase,
                ref dst_cid,
                number,
            } => {
                w.write(FIXED_BIT | if key_phase { KEY_PHASE_BIT } else { 0 } | number.tag());
                w.put_slice(dst_cid);
                number.encode(w);
                PartialEncode {
                    header_len: w.len(),
                    pn: Some((number.len(), false)),
                }
            }
            Retry { .. } | VersionNegotiate { .. } => {
                unreachable!("clients do not send Retry or Version Negotiation packets")
            }
        }
    }

    fn encode_cids<W: BufMut>(w: &mut W, dst_cid: &ConnectionId, src_cid: &ConnectionId) {
        w.put_u8(cid_nibble(dst_cid) << 4 | cid_nibble(src_cid));
        w.put_slice(dst_cid);
        w.put_slice(src_cid);
    }

    pub fn number(&self) -> Option<PacketNumber> {
        use self::Header::*;
        Some(match *self {
            Initial { number, .. } => number,
            Long { number, .. } => number,
            Short { number, .. } => number,
            _ => return None,
        })
    }

    pub fn space(&self) -> SpaceId {
        use self::Header::*;
        match *self {
            Short { .. } => SpaceId::Data,
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => SpaceId::Data,
            Long {
                ty: LongType::Handshake,
                ..
            } => SpaceId::Handshake,
            _ => SpaceId::Initial,
        }
    }

    pub fn key_phase(&self) -> bool {
        match *self {
            Header::Short { key_phase, .. } => key_phase,
            _ => false,
        }
    }

    pub fn is_short(&self) -> bool {
        matches!(*self, Header::Short { .. })
    }

    pub fn is_0rtt(&self) -> bool {
        matches!(
            *self,
            Header::Long {
                ty: LongType::ZeroRtt,
                ..
            }
        )
    }

    pub fn is_retry(&self) -> bool {
        matches!(*self, Header::Retry { .. })
    }

    pub fn dst_cid(&self) -> &ConnectionId {
        use self::Header::*;
        match *self {
            Initial { ref dst_cid, .. } => dst_cid,
            Long { ref dst_cid, .. } => dst_cid,
            Retry { ref dst_cid, .. } => dst_cid,
            Short { ref dst_cid, .. } => dst_cid,
            VersionNegotiate { ref dst_cid, .. } => dst_cid,
        }
    }
}

pub(crate) struct PartialEncode {
    header_len: usize,
    // Packet number length, payload length needed
    pn: Option<(usize, bool)>,
}

impl PartialEncode {
    /// Fill in the payload length, protect the payload, and protect the header
    ///
    /// `buf` must already include space for the AEAD tag. The payload length
    /// is part of the additional data, so it is written before encryption.
    pub fn finish(
        self,
        buf: &mut [u8],
        header_key: &HeaderKey,
        crypto: Option<(u64, &crate::crypto::PacketKey)>,
    ) {
        let PartialEncode { header_len, pn } = self;
        let (pn_len, write_len) = match pn {
            Some(x) => x,
            None => return,
        };

        let pn_pos = header_len - pn_len;
        if write_len {
            let len = buf.len() - header_len + pn_len;
            assert!(len < 2usize.pow(14)); // Fits in the two-byte reserved form
            let mut slice = &mut buf[pn_pos - 2..pn_pos];
            slice.put_u16(len as u16 | 0b01 << 14);
        }

        if let Some((number, key)) = crypto {
            key.encrypt(number, buf, header_len);
        }

        debug_assert!(
            pn_pos + 4 + header_key.sample_size() <= buf.len(),
            "packet must be padded to at least {} bytes for header protection sampling",
            pn_pos + 4 + header_key.sample_size()
        );
        header_key.encrypt(pn_pos, buf);
    }
}

#[derive(Debug)]
enum PlainHeader {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token_pos: std::ops::Range<usize>,
        len: u64,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        len: u64,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        orig_dst_cid: ConnectionId,
    },
    Short {
        dst_cid: ConnectionId,
    },
    VersionNegotiate {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

impl PlainHeader {
    fn payload_len(&self) -> Option<u64> {
        use self::PlainHeader::*;
        match self {
            Initial { len, .. } | Long { len, .. } => Some(*len),
            _ => None,
        }
    }

    fn decode(buf: &mut io::Cursor<BytesMut>) -> Result<Self, PacketDecodeError> {
        let first = buf.get::<u8>()?;
        if first & LONG_HEADER_FORM == 0 {
            // As the client, our local CIDs are of known fixed length
            let dst_cid = Self::get_cid(buf, crate::LOC_CID_LEN)?;
            return Ok(PlainHeader::Short { dst_cid });
        }

        let version = buf.get::<u32>()?;
        let cid_lengths = buf.get::<u8>()?;
        let dst_cid = Self::get_cid(buf, cid_len_from_nibble(cid_lengths >> 4))?;
        let src_cid = Self::get_cid(buf, cid_len_from_nibble(cid_lengths & 0xf))?;

        if version == 0 {
            return Ok(PlainHeader::VersionNegotiate { dst_cid, src_cid });
        }
        if version != VERSION {
            return Err(PacketDecodeError::UnsupportedVersion {
                src_cid,
                dst_cid,
            });
        }

        if first & FIXED_BIT == 0 {
            return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
        }
        match (first & 0x30) >> 4 {
            0x0 => {
                let token_len = buf.get_var()? as usize;
                let token_start = buf.position() as usize;
                if buf.remaining() < token_len {
                    return Err(PacketDecodeError::InvalidHeader("token longer than packet"));
                }
                buf.advance(token_len);
                let len = buf.get_var()?;
                Ok(PlainHeader::Initial {
                    dst_cid,
                    src_cid,
                    token_pos: token_start..token_start + token_len,
                    len,
                })
            }
            0x1 => Ok(PlainHeader::Long {
                ty: LongType::ZeroRtt,
                dst_cid,
                src_cid,
                len: buf.get_var()?,
            }),
            0x2 => Ok(PlainHeader::Long {
                ty: LongType::Handshake,
                dst_cid,
                src_cid,
                len: buf.get_var()?,
            }),
            0x3 => {
                let orig_dst_cid = Self::get_cid(buf, cid_len_from_nibble(first & 0xf))?;
                Ok(PlainHeader::Retry {
                    dst_cid,
                    src_cid,
                    orig_dst_cid,
                })
            }
            _ => unreachable!(),
        }
    }

    fn get_cid(buf: &mut io::Cursor<BytesMut>, len: usize) -> Result<ConnectionId, PacketDecodeError> {
        if len > MAX_CID_SIZE {
            return Err(PacketDecodeError::InvalidHeader(
                "illegal connection ID length",
            ));
        }
        if buf.remaining() < len {
            return Err(PacketDecodeError::InvalidHeader(
                "connection ID longer than packet",
            ));
        }
        let cid = ConnectionId::new(&buf.chunk()[..len]);
        buf.advance(len);
        Ok(cid)
    }
}

/// Connection ID lengths are encoded in a nibble as `length - 3`, zero meaning absent
fn cid_nibble(cid: &ConnectionId) -> u8 {
    if cid.is_empty() {
        0
    } else {
        cid.len() as u8 - 3
    }
}

fn cid_len_from_nibble(nibble: u8) -> usize {
    if nibble == 0 {
        0
    } else {
        nibble as usize + 3
    }
}

/// An encoded packet number
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    pub fn new(n: u64, largest_acked: u64) -> Self {
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            PacketNumber::U8(n as u8)
        } else if range < 1 << 16 {
            PacketNumber::U16(n as u16)
        } else if range < 1 << 24 {
            PacketNumber::U24(n as u32)
        } else if range < 1 << 32 {
            PacketNumber::U32(n as u32)
        } else {
            panic!("packet number too large to encode")
        }
    }

    pub fn len(self) -> usize {
        use self::PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    pub fn encode<W: BufMut>(self, w: &mut W) {
        use self::PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U24(x) => w.put_uint(u64::from(x), 3),
            U32(x) => w.write(x),
        }
    }

    pub fn decode<R: Buf>(len: usize, r: &mut R) -> Result<PacketNumber, PacketDecodeError> {
        use self::PacketNumber::*;
        if r.remaining() < len {
            return Err(PacketDecodeError::InvalidHeader("truncated packet number"));
        }
        let pn = match len {
            1 => U8(r.get_u8()),
            2 => U16(r.get_u16()),
            3 => U24(r.get_uint(3) as u32),
            4 => U32(r.get_u32()),
            _ => unreachable!(),
        };
        Ok(pn)
    }

    pub fn decode_len(tag: u8) -> usize {
        1 + (tag & 0x03) as usize
    }

    fn tag(self) -> u8 {
        use self::PacketNumber::*;
        match self {
            U8(_) => 0b00,
            U16(_) => 0b01,
            U24(_) => 0b10,
            U32(_) => 0b11,
        }
    }

    /// Recover the full packet number from its truncation, per the transport
    /// draft's sample algorithm
    pub fn expand(self, expected: u64) -> u64 {
        use self::PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U24(x) => u64::from(x),
            U32(x) => u64::from(x),
        };
        let nbits = self.len() * 8;
        let win = 1 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // The incoming packet number should be greater than expected - hwin
        // and less than or equal to expected + hwin, which means we can't just
        // splice the truncated bits into expected.
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).map_or(false, |x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate > win {
            candidate - win
        } else {
            candidate
        }
    }
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub(crate) enum PacketDecodeError {
    #[error("unsupported version")]
    UnsupportedVersion {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        PacketDecodeError::InvalidHeader("unexpected end of packet")
    }
}

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const KEY_PHASE_BIT: u8 = 0x04;

/// Packet number space identifiers
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum SpaceId {
    /// Unprotected packets, used to bootstrap the handshake
    Initial = 0,
    Handshake = 1,
    /// Application data space, used for both 0-RTT and 1-RTT packets
    Data = 2,
}

impl SpaceId {
    pub const VALUES: [SpaceId; 3] = [SpaceId::Initial, SpaceId::Handshake, SpaceId::Data];
}

/// Long packet types with uniform header structure
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongType {
    ZeroRtt = 0x1,
    Handshake = 0x2,
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use std::io;

    fn check_pn(typed: PacketNumber, encoded: &[u8]) {
        let mut buf = Vec::new();
        typed.encode(&mut buf);
        assert_eq!(&buf[..], encoded);
        let decoded = PacketNumber::decode(typed.len(), &mut io::Cursor::new(&buf)).unwrap();
        assert_eq!(typed, decoded);
    }

    #[test]
    fn roundtrip_packet_numbers() {
        check_pn(PacketNumber::U8(0x7f), &hex!("7f"));
        check_pn(PacketNumber::U16(0x80), &hex!("0080"));
        check_pn(PacketNumber::U16(0x3fff), &hex!("3fff"));
        check_pn(PacketNumber::U32(0x0000_4000), &hex!("00004000"));
        check_pn(PacketNumber::U32(0xffff_ffff), &hex!("ffffffff"));
    }

    #[test]
    fn pn_encode() {
        check_pn(PacketNumber::new(0x10, 0), &hex!("10"));
        check_pn(PacketNumber::new(0x100, 0), &hex!("0100"));
        check_pn(PacketNumber::new(0x10000, 0), &hex!("010000"));
    }

    #[test]
    fn pn_expand_roundtrip() {
        for expected in 0..1024 {
            for actual in expected..1024 {
                assert_eq!(actual, PacketNumber::new(actual, expected).expand(expected));
            }
        }
    }

    #[test]
    fn cid_nibbles() {
        assert_eq!(cid_nibble(&ConnectionId::new(&[])), 0);
        assert_eq!(cid_len_from_nibble(0), 0);
        let cid = ConnectionId::new(&[0; 8]);
        assert_eq!(cid_len_from_nibble(cid_nibble(&cid)), 8);
        let cid = ConnectionId::new(&[0; 18]);
        assert_eq!(cid_len_from_nibble(cid_nibble(&cid)), 18);
    }

    #[test]
    fn header_roundtrip() {
        use crate::crypto::KeyPair;
        use crate::Side;

        let dcid = ConnectionId::new(&hex!("06b858ec6f80452b"));
        let client = KeyPair::initial(&dcid, Side::Client);
        let server = KeyPair::initial(&dcid, Side::Server);

        let number = 42;
        let header = Header::Initial {
            number: PacketNumber::new(number, 0),
            src_cid: ConnectionId::new(&hex!("c0ffee00c0ffee00")),
            dst_cid: dcid,
            token: Bytes::new(),
        };
        let mut buf = Vec::new();
        let encode = header.encode(&mut buf);
        let header_len = buf.len();
        buf.resize(header_len + 64 + client.write.packet.tag_len(), 0);
        encode.finish(
            &mut buf,
            &client.write.header,
            Some((number, &client.write.packet)),
        );

        let (decode, rest) = PartialDecode::new(buf.as_slice().into()).unwrap();
        assert!(rest.is_none());
        assert_eq!(decode.space(), Some(SpaceId::Initial));
        let mut packet = decode.finish(Some(&server.read.header)).unwrap();
        let expanded = packet.header.number().unwrap().expand(0);
        assert_eq!(expanded, number);
        server
            .read
            .packet
            .decrypt(expanded, &packet.header_data, &mut packet.payload)
            .unwrap();
        assert_eq!(&packet.payload[..], &[0; 64][..]);
    }

    #[test]
    fn short_header_roundtrip() {
        use crate::crypto::{CipherSuite, Keys, Secret};

        let secret = Secret::new(CipherSuite::Aes128Gcm, &[0x17; 32]);
        let keys = Keys::new(&secret);

        let dst_cid = ConnectionId::new(&[0xab; crate::LOC_CID_LEN]);
        let number = 0x2a;
        let header = Header::Short {
            key_phase: false,
            dst_cid,
            number: PacketNumber::new(number, 0),
        };
        let mut buf = Vec::new();
        let encode = header.encode(&mut buf);
        let header_len = buf.len();
        buf.resize(header_len + 32 + keys.packet.tag_len(), 0);
        encode.finish(&mut buf, &keys.header, Some((number, &keys.packet)));

        let (decode, _) = PartialDecode::new(buf.as_slice().into()).unwrap();
        let mut packet = decode.finish(Some(&keys.header)).unwrap();
        assert!(packet.header.is_short());
        let expanded = packet.header.number().unwrap().expand(0);
        assert_eq!(expanded, number);
        keys.packet
            .decrypt(expanded, &packet.header_data, &mut packet.payload)
            .unwrap();
        assert_eq!(&packet.payload[..], &[0; 32][..]);
    }
}
