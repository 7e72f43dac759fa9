//! Packet protection keys and the interface to the TLS record layer
//!
//! The TLS stack itself lives outside this crate. Everything the connection
//! needs from it is captured by the [`Session`] trait: ordered handshake
//! bytes per encryption level in both directions, and traffic *secrets* per
//! cipher kind. All packet-protection material (AEAD keys, IVs, and
//! header-protection keys) is derived here, from those secrets, using the
//! QUIC labels.

use bytes::{Bytes, BytesMut};
use ring::{aead, hkdf};

use crate::shared::ConnectionId;
use crate::transport_error::TransportError;
use crate::transport_parameters::TransportParameters;
use crate::Side;

/// TLS 1.3 cipher suites usable with QUIC
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CipherSuite {
    /// TLS13_AES_128_GCM_SHA256
    Aes128Gcm,
    /// TLS13_AES_256_GCM_SHA384
    Aes256Gcm,
    /// TLS13_CHACHA20_POLY1305_SHA256
    ChaCha20Poly1305,
}

impl CipherSuite {
    fn aead(self) -> &'static aead::Algorithm {
        match self {
            CipherSuite::Aes128Gcm => &aead::AES_128_GCM,
            CipherSuite::Aes256Gcm => &aead::AES_256_GCM,
            CipherSuite::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    fn header_protection(self) -> &'static aead::quic::Algorithm {
        match self {
            CipherSuite::Aes128Gcm => &aead::quic::AES_128,
            CipherSuite::Aes256Gcm => &aead::quic::AES_256,
            CipherSuite::ChaCha20Poly1305 => &aead::quic::CHACHA20,
        }
    }

    fn hkdf(self) -> hkdf::Algorithm {
        match self {
            CipherSuite::Aes256Gcm => hkdf::HKDF_SHA384,
            _ => hkdf::HKDF_SHA256,
        }
    }

    fn key_len(self) -> usize {
        match self {
            CipherSuite::Aes128Gcm => 16,
            _ => 32,
        }
    }
}

/// A TLS traffic secret, from which packet protection keys are derived
#[derive(Clone)]
pub struct Secret {
    suite: CipherSuite,
    bytes: Vec<u8>,
}

impl Secret {
    /// Wrap a raw secret exported by the TLS stack
    pub fn new(suite: CipherSuite, bytes: &[u8]) -> Self {
        Self {
            suite,
            bytes: bytes.to_vec(),
        }
    }

    fn prk(&self) -> hkdf::Prk {
        hkdf::Prk::new_less_safe(self.suite.hkdf(), &self.bytes)
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material
        f.debug_struct("Secret").field("suite", &self.suite).finish()
    }
}

/// Which connection key slot a freshly derived secret belongs to
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CipherKind {
    /// Protects outgoing Handshake packets
    HandshakeWrite,
    /// Unprotects incoming Handshake packets
    HandshakeRead,
    /// Protects outgoing 1-RTT packets
    OneRttWrite,
    /// Unprotects incoming 1-RTT packets
    OneRttRead,
    /// Protects outgoing 0-RTT packets; early data is never received by a client
    ZeroRttWrite,
}

/// Epochs of the handshake, each with its own keys and CRYPTO stream
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EncryptionLevel {
    /// Keys derived from the client's first Destination Connection ID
    Initial = 0,
    /// Keys derived from the handshake secrets
    Handshake = 1,
    /// Keys derived from a previous connection's resumption secret
    EarlyData = 2,
    /// Keys derived from the 1-RTT secrets
    AppData = 3,
}

impl EncryptionLevel {
    /// The packet number space packets of this epoch belong to
    pub(crate) fn space(self) -> crate::packet::SpaceId {
        use crate::packet::SpaceId;
        match self {
            EncryptionLevel::Initial => SpaceId::Initial,
            EncryptionLevel::Handshake => SpaceId::Handshake,
            EncryptionLevel::EarlyData | EncryptionLevel::AppData => SpaceId::Data,
        }
    }
}

/// Keys used to protect packet payloads in one direction
pub struct PacketKey {
    key: aead::LessSafeKey,
    /// Mixed with the packet number to form the AEAD nonce
    iv: [u8; NONCE_LEN],
}

impl PacketKey {
    fn new(secret: &Secret) -> Self {
        let prk = secret.prk();
        let mut key = vec![0; secret.suite.key_len()];
        hkdf_expand_label(&prk, KEY_LABEL, &mut key);
        let mut iv = [0; NONCE_LEN];
        hkdf_expand_label(&prk, IV_LABEL, &mut iv);
        Self {
            key: aead::LessSafeKey::new(
                aead::UnboundKey::new(secret.suite.aead(), &key).expect("key length mismatch"),
            ),
            iv,
        }
    }

    fn nonce(&self, packet: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (b, pn) in nonce[NONCE_LEN - 8..].iter_mut().zip(&packet.to_be_bytes()) {
            *b ^= pn;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }

    /// Encrypt the packet payload in place, filling the trailing tag space
    pub fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize) {
        let (header, payload) = buf.split_at_mut(header_len);
        let (payload, tag_storage) = payload.split_at_mut(payload.len() - self.tag_len());
        let aad = aead::Aad::from(&*header);
        let tag = self
            .key
            .seal_in_place_separate_tag(self.nonce(packet), aad, payload)
            .expect("packet encryption failed");
        tag_storage.copy_from_slice(tag.as_ref());
    }

    /// Decrypt the packet payload in place, stripping the tag on success
    pub fn decrypt(&self, packet: u64, header: &[u8], payload: &mut BytesMut) -> Result<(), ()> {
        if payload.len() < self.tag_len() {
            return Err(());
        }
        let payload_len = payload.len();
        let aad = aead::Aad::from(header);
        self.key
            .open_in_place(self.nonce(packet), aad, payload.as_mut())
            .map_err(|_| ())?;
        payload.truncate(payload_len - self.tag_len());
        Ok(())
    }

    /// The length of the AEAD tag appended to packets on encryption
    pub fn tag_len(&self) -> usize {
        self.key.algorithm().tag_len()
    }
}

impl std::fmt::Debug for PacketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PacketKey")
    }
}

/// Key used to mask the packet number and low first-byte bits of each packet
pub struct HeaderKey(aead::quic::HeaderProtectionKey);

impl HeaderKey {
    fn new(secret: &Secret) -> Self {
        let mut key = vec![0; secret.suite.key_len()];
        hkdf_expand_label(&secret.prk(), HP_LABEL, &mut key);
        Self(
            aead::quic::HeaderProtectionKey::new(secret.suite.header_protection(), &key)
                .expect("key length mismatch"),
        )
    }

    pub(crate) fn decrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        let (header, sample) = packet.split_at_mut(pn_offset + 4);
        let mask = self
            .0
            .new_mask(&sample[0..self.sample_size()])
            .expect("sample length mismatch");
        if header[0] & crate::packet::LONG_HEADER_FORM == crate::packet::LONG_HEADER_FORM {
            // Long header: 4 bits masked
            header[0] ^= mask[0] & 0x0f;
        } else {
            // Short header: 5 bits masked
            header[0] ^= mask[0] & 0x1f;
        }
        let pn_length = crate::packet::PacketNumber::decode_len(header[0]);
        for (out, inp) in header[pn_offset..pn_offset + pn_length]
            .iter_mut()
            .zip(&mask[1..])
        {
            *out ^= inp;
        }
    }

    pub(crate) fn encrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        let (header, sample) = packet.split_at_mut(pn_offset + 4);
        let mask = self
            .0
            .new_mask(&sample[0..self.sample_size()])
            .expect("sample length mismatch");
        let pn_length = crate::packet::PacketNumber::decode_len(header[0]);
        if header[0] & crate::packet::LONG_HEADER_FORM == crate::packet::LONG_HEADER_FORM {
            header[0] ^= mask[0] & 0x0f;
        } else {
            header[0] ^= mask[0] & 0x1f;
        }
        for (out, inp) in header[pn_offset..pn_offset + pn_length]
            .iter_mut()
            .zip(&mask[1..])
        {
            *out ^= inp;
        }
    }

    pub(crate) fn sample_size(&self) -> usize {
        self.0.algorithm().sample_len()
    }
}

impl std::fmt::Debug for HeaderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HeaderKey")
    }
}

/// Packet and header protection keys for one direction of one epoch,
/// derived from a single traffic secret
#[derive(Debug)]
pub struct Keys {
    /// AEAD protecting packet payloads
    pub packet: PacketKey,
    /// Cipher masking packet numbers
    pub header: HeaderKey,
}

impl Keys {
    /// Derive both keys from one traffic secret
    pub fn new(secret: &Secret) -> Self {
        Self {
            packet: PacketKey::new(secret),
            header: HeaderKey::new(secret),
        }
    }
}

/// Write and read keys for one epoch
#[derive(Debug)]
pub struct KeyPair {
    /// Keys protecting what we send
    pub write: Keys,
    /// Keys unprotecting what the peer sends
    pub read: Keys,
}

impl KeyPair {
    /// Derive the Initial keys from the client's first Destination CID
    pub fn initial(dst_cid: &ConnectionId, side: Side) -> Self {
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT);
        let initial = salt.extract(dst_cid);

        let secret = |label: &[u8]| {
            let mut bytes = [0; 32];
            hkdf_expand_label(&initial, label, &mut bytes);
            Secret::new(CipherSuite::Aes128Gcm, &bytes)
        };
        let client = secret(b"client in");
        let server = secret(b"server in");
        let (write, read) = match side {
            Side::Client => (&client, &server),
            Side::Server => (&server, &client),
        };
        Self {
            write: Keys::new(write),
            read: Keys::new(read),
        }
    }
}

const NONCE_LEN: usize = 12;

const KEY_LABEL: &[u8] = b"quic key";
const IV_LABEL: &[u8] = b"quic iv";
const HP_LABEL: &[u8] = b"quic hp";

const INITIAL_SALT: [u8; 20] = [
    0xef, 0x4f, 0xb0, 0xab, 0xb4, 0x74, 0x70, 0xc4, 0x1b, 0xef, 0xcf, 0x80, 0x31, 0x33, 0x4f,
    0xae, 0x48, 0x5e, 0x09, 0xa0,
];

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// TLS 1.3 HKDF-Expand-Label with an empty context
fn hkdf_expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    const BASE_LABEL: &[u8] = b"tls13 ";
    const EMPTY_CONTEXT: &[u8] = &[0];
    let len = (out.len() as u16).to_be_bytes();
    let label_len = [(BASE_LABEL.len() + label.len()) as u8];
    let info = [&len[..], &label_len[..], BASE_LABEL, label, EMPTY_CONTEXT];
    prk.expand(&info, OkmLen(out.len()))
        .expect("HKDF output length out of bounds")
        .fill(out)
        .expect("HKDF output length mismatch");
}

/// A ticket delivered by the server after the handshake, enabling resumption
/// and 0-RTT on a later connection
#[derive(Debug, Clone)]
pub struct SessionTicket {
    /// Opaque resumption state
    pub ticket: Bytes,
    /// Cipher suite the ticket's PSK is bound to
    pub suite: CipherSuite,
}

/// Client-side configuration for the TLS record layer
///
/// Carries the TLS context and certificate verifier; the transport hands it
/// the hostname to validate, the transport parameters to embed in the
/// ClientHello (including any private ones), and cached resumption state.
pub trait ClientConfig<S: Session> {
    /// Begin a TLS session for a new connection
    fn start_session(
        &self,
        server_name: &str,
        params: &TransportParameters,
        psk: Option<&crate::psk::CachedPsk>,
    ) -> Result<S, crate::connection::ConnectError>;
}

/// The interface the TLS record layer exposes to the connection
///
/// Implementations wrap an actual TLS 1.3 stack. The connection feeds it
/// CRYPTO-stream bytes in epoch order, drains outbound handshake bytes per
/// epoch, and harvests traffic secrets as they become available.
pub trait Session {
    /// The epoch whose CRYPTO bytes the record layer will consume next
    fn read_level(&self) -> EncryptionLevel;

    /// Feed handshake bytes received at the current read level
    ///
    /// Cleartext alerts and malformed handshake messages surface here as
    /// transport errors carrying the corresponding crypto error code.
    fn read_handshake(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Drain outbound handshake bytes, tagged with the epoch that must carry them
    fn poll_transmit(&mut self) -> Option<(EncryptionLevel, Vec<u8>)>;

    /// Drain newly available traffic secrets
    fn poll_secret(&mut self) -> Option<(CipherKind, Secret)>;

    /// Returns `true` until the TLS handshake has completed
    fn is_handshaking(&self) -> bool;

    /// Whether the session was established by resuming an earlier one
    fn is_resumed(&self) -> bool;

    /// The negotiated application protocol, once known
    fn alpn_protocol(&self) -> Option<&[u8]>;

    /// Whether the server accepted our early data; `None` until the
    /// handshake has progressed far enough to know
    fn early_data_accepted(&self) -> Option<bool>;

    /// When early data was rejected, whether the parameters the server
    /// settled on match those the early data was sent under
    fn early_parameters_match(&self) -> bool;

    /// The peer's transport parameters, once its first flight has arrived
    fn transport_parameters(&self) -> Result<Option<TransportParameters>, TransportError>;

    /// Drain a NewSessionTicket received from the server, if any
    fn poll_session_ticket(&mut self) -> Option<SessionTicket>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_keys_are_symmetric() {
        let cid = ConnectionId::new(&[0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04]);
        let client = KeyPair::initial(&cid, Side::Client);
        let server = KeyPair::initial(&cid, Side::Server);

        let mut buf = b"some header".to_vec();
        let header_len = buf.len();
        buf.resize(header_len + 13 + client.write.packet.tag_len(), 1);
        client.write.packet.encrypt(0, &mut buf, header_len);

        let mut payload = bytes::BytesMut::from(&buf[header_len..]);
        server
            .read
            .packet
            .decrypt(0, &buf[..header_len], &mut payload)
            .unwrap();
        assert_eq!(&payload[..], &[1u8; 13][..]);
    }

    #[test]
    fn distinct_directions() {
        let cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let pair = KeyPair::initial(&cid, Side::Client);

        let mut buf = vec![0; 8 + 16 + pair.write.packet.tag_len()];
        pair.write.packet.encrypt(7, &mut buf, 8);
        let mut payload = bytes::BytesMut::from(&buf[8..]);
        // Our own read keys must not accept what we sent
        assert!(pair.read.packet.decrypt(7, &buf[..8], &mut payload).is_err());
    }

    #[test]
    fn tampering_detected() {
        let secret = Secret::new(CipherSuite::Aes128Gcm, &[0x42; 32]);
        let keys = Keys::new(&secret);
        let mut buf = vec![0; 4 + 32 + keys.packet.tag_len()];
        keys.packet.encrypt(1, &mut buf, 4);
        buf[10] ^= 1;
        let mut payload = bytes::BytesMut::from(&buf[4..]);
        assert!(keys.packet.decrypt(1, &buf[..4], &mut payload).is_err());
    }

    #[test]
    fn suite_parameters() {
        assert_eq!(CipherSuite::Aes128Gcm.key_len(), 16);
        assert_eq!(CipherSuite::Aes256Gcm.key_len(), 32);
        let secret = Secret::new(CipherSuite::ChaCha20Poly1305, &[0x99; 32]);
        let keys = Keys::new(&secret);
        assert_eq!(keys.packet.tag_len(), 16);
        assert_eq!(keys.header.sample_size(), 16);
    }
}
