use bytes::Bytes;

use crate::assembler::Assembler;
use crate::crypto::EncryptionLevel;
use crate::frame;

/// The four parallel CRYPTO streams, one per encryption level
///
/// Each is an ordered byte stream with no flow control limit, carrying TLS
/// handshake payload. Levels are fully independent: each has its own offset
/// space in both directions.
pub struct CryptoStreams {
    streams: [CryptoStream; 4],
}

#[derive(Default)]
struct CryptoStream {
    /// Inbound handshake bytes, reassembled into order
    recv: Assembler,
    /// Offset the next outbound byte will occupy
    tx_offset: u64,
}

impl CryptoStreams {
    pub fn new() -> Self {
        Self {
            streams: Default::default(),
        }
    }

    /// Buffer inbound CRYPTO frame data for `level`
    pub fn insert(&mut self, level: EncryptionLevel, offset: u64, data: Bytes) {
        self.stream_mut(level).recv.insert(offset, data);
    }

    /// Read in-order inbound bytes for `level`
    pub fn read(&mut self, level: EncryptionLevel, buf: &mut [u8]) -> usize {
        self.stream_mut(level).recv.read(buf)
    }

    /// Offset up to which inbound bytes have been consumed at `level`
    pub fn rx_offset(&self, level: EncryptionLevel) -> u64 {
        self.streams[level as usize].recv.offset()
    }

    /// Queue outbound handshake bytes at `level`, assigning stream offsets
    pub fn write(&mut self, level: EncryptionLevel, data: Vec<u8>) -> frame::Crypto {
        let stream = self.stream_mut(level);
        let offset = stream.tx_offset;
        stream.tx_offset += data.len() as u64;
        frame::Crypto {
            offset,
            data: data.into(),
        }
    }

    fn stream_mut(&mut self, level: EncryptionLevel) -> &mut CryptoStream {
        &mut self.streams[level as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_independent() {
        let mut streams = CryptoStreams::new();
        streams.insert(EncryptionLevel::Initial, 0, Bytes::from_static(b"init"));
        streams.insert(EncryptionLevel::Handshake, 0, Bytes::from_static(b"hs"));

        let mut buf = [0; 16];
        let n = streams.read(EncryptionLevel::Handshake, &mut buf);
        assert_eq!(&buf[..n], b"hs");
        let n = streams.read(EncryptionLevel::Initial, &mut buf);
        assert_eq!(&buf[..n], b"init");
    }

    #[test]
    fn inbound_ordering_holds_gaps() {
        let mut streams = CryptoStreams::new();
        streams.insert(EncryptionLevel::Initial, 4, Bytes::from_static(b"late"));
        let mut buf = [0; 16];
        assert_eq!(streams.read(EncryptionLevel::Initial, &mut buf), 0);
        streams.insert(EncryptionLevel::Initial, 0, Bytes::from_static(b"earl"));
        let n = streams.read(EncryptionLevel::Initial, &mut buf);
        assert_eq!(&buf[..n], b"earllate");
        assert_eq!(streams.rx_offset(EncryptionLevel::Initial), 8);
    }

    #[test]
    fn outbound_offsets_accumulate() {
        let mut streams = CryptoStreams::new();
        let a = streams.write(EncryptionLevel::Initial, b"hello".to_vec());
        assert_eq!(a.offset, 0);
        let b = streams.write(EncryptionLevel::Initial, b"world".to_vec());
        assert_eq!(b.offset, 5);
        // Independent offset space per level
        let c = streams.write(EncryptionLevel::Handshake, b"x".to_vec());
        assert_eq!(c.offset, 0);
    }
}
