use std::collections::VecDeque;

use thiserror::Error;
use tracing::{debug, trace};

use crate::crypto::{CipherKind, EncryptionLevel, Keys, Secret, Session, SessionTicket};
use crate::crypto_stream::CryptoStreams;
use crate::frame;
use crate::transport_error::TransportError;
use crate::transport_parameters::TransportParameters;

/// Client progress through the handshake
///
/// Transitions are strictly forward. `Established` is reached only on the
/// first receipt of 1-RTT-protected data, which proves the server installed
/// our 1-RTT keys.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Phase {
    /// Nothing received beyond our own Initial flight
    Initial,
    /// The server's first reply has arrived
    Handshake,
    /// TLS completed; we may send 1-RTT data
    OneRttKeysDerived,
    /// The server has demonstrably switched to 1-RTT keys
    Established,
}

/// A failure of the handshake layer
///
/// Once raised, the driver is poisoned: every subsequent operation returns
/// the same error rather than acting on stale state.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum HandshakeError {
    /// The server rejected our early data and its parameters changed, so the
    /// data cannot be replayed on 1-RTT
    #[error("early data rejected with changed transport parameters")]
    EarlyDataRejected,
    /// The TLS layer failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Drives the TLS session from CRYPTO-stream bytes and turns its secrets
/// into installed packet protection keys
pub struct HandshakeDriver<S> {
    session: S,
    phase: Phase,
    crypto: CryptoStreams,
    /// CRYPTO frames ready for packetization, in production order
    outbound: VecDeque<(EncryptionLevel, frame::Crypto)>,

    handshake_write: Option<Keys>,
    handshake_read: Option<Keys>,
    one_rtt_write: Option<Keys>,
    one_rtt_read: Option<Keys>,
    zero_rtt_write: Option<Keys>,

    error: Option<HandshakeError>,
    early_data_attempted: bool,
    /// ALPN the early data was sent under, from the resumption cache
    early_alpn: Option<Vec<u8>>,
    zero_rtt_rejected: Option<bool>,
}

impl<S: Session> HandshakeDriver<S> {
    pub fn new(session: S, early_alpn: Option<Vec<u8>>) -> Self {
        Self {
            session,
            phase: Phase::Initial,
            crypto: CryptoStreams::new(),
            outbound: VecDeque::new(),

            handshake_write: None,
            handshake_read: None,
            one_rtt_write: None,
            one_rtt_read: None,
            zero_rtt_write: None,

            error: None,
            early_data_attempted: false,
            early_alpn,
            zero_rtt_rejected: None,
        }
    }

    /// Start the handshake: emit the ClientHello and derive any 0-RTT keys
    pub fn start(&mut self) -> Result<(), HandshakeError> {
        self.drain_session()
    }

    /// Process an inbound CRYPTO frame received at `level`
    pub fn on_crypto_frame(
        &mut self,
        level: EncryptionLevel,
        frame: frame::Crypto,
    ) -> Result<(), HandshakeError> {
        self.check_error()?;
        if frame.data.is_empty() {
            return Ok(());
        }
        // A MITM that corrupts the Finished message leaves the server emitting
        // either a cleartext close or a cleartext alert. Reads switch to 1-RTT
        // ciphers immediately, so that cleartext is dropped and the connection
        // times out instead of closing cleanly.
        if self.phase == Phase::Initial {
            // Could be an HRR or a cleartext alert
            self.phase = Phase::Handshake;
        }
        self.crypto.insert(level, frame.offset, frame.data);

        let mut buf = [0; 8192];
        loop {
            // Feed whichever level the record layer currently expects; stop
            // once it is waiting on data that has not arrived
            let expected = self.session.read_level();
            let n = self.crypto.read(expected, &mut buf);
            if n == 0 {
                break;
            }
            trace!(level = ?expected, bytes = n, "read handshake bytes");
            if let Err(e) = self.session.read_handshake(&buf[..n]) {
                return Err(self.raise(e.into()));
            }
            self.drain_session()?;
        }
        self.drain_session()
    }

    /// Harvest everything the session has produced: secrets, outbound bytes,
    /// and handshake completion
    fn drain_session(&mut self) -> Result<(), HandshakeError> {
        while let Some((kind, secret)) = self.session.poll_secret() {
            self.compute_keys(kind, &secret);
        }
        while let Some((level, data)) = self.session.poll_transmit() {
            self.write_data_to_stream(level, data);
        }
        if !self.session.is_handshaking() && self.phase < Phase::OneRttKeysDerived {
            self.on_handshake_complete()?;
        }
        Ok(())
    }

    /// Build the AEAD and the packet-number cipher from one secret and store
    /// them in the matching slot
    fn compute_keys(&mut self, kind: CipherKind, secret: &Secret) {
        trace!(?kind, "deriving packet protection keys");
        let keys = Keys::new(secret);
        let slot = match kind {
            CipherKind::HandshakeWrite => &mut self.handshake_write,
            CipherKind::HandshakeRead => &mut self.handshake_read,
            CipherKind::OneRttWrite => &mut self.one_rtt_write,
            CipherKind::OneRttRead => &mut self.one_rtt_read,
            CipherKind::ZeroRttWrite => {
                // The 0-RTT secret is keyed by the resumed session's suite,
                // carried on the secret itself
                self.early_data_attempted = true;
                &mut self.zero_rtt_write
            }
        };
        *slot = Some(keys);
    }

    /// Queue outbound handshake bytes on the CRYPTO stream for `level`
    fn write_data_to_stream(&mut self, level: EncryptionLevel, data: Vec<u8>) {
        if level == EncryptionLevel::AppData {
            // 1-RTT handshake traffic (e.g. client Finished under some
            // orderings, post-handshake messages) is carried by the record
            // layer only; never re-sent as CRYPTO frames by the client
            return;
        }
        let frame = self.crypto.write(level, data);
        trace!(?level, offset = frame.offset, len = frame.data.len(), "queueing CRYPTO");
        self.outbound.push_back((level, frame));
    }

    fn on_handshake_complete(&mut self) -> Result<(), HandshakeError> {
        if self.early_data_attempted {
            match self.session.early_data_accepted() {
                Some(true) | None => {
                    self.zero_rtt_rejected = Some(false);
                }
                Some(false) => {
                    // TODO: handle HRR-based rejection once the record layer
                    // exposes it; an HRR discards early data without reaching
                    // this path
                    if self.session.early_parameters_match() {
                        debug!("0-RTT rejected; parameters match, retry on 1-RTT");
                        self.zero_rtt_rejected = Some(true);
                    } else {
                        // Replaying the data under changed parameters is not
                        // supported
                        return Err(self.raise(HandshakeError::EarlyDataRejected));
                    }
                }
            }
        }
        trace!("handshake complete");
        self.phase = Phase::OneRttKeysDerived;
        Ok(())
    }

    /// Record that a 1-RTT-protected packet was successfully decrypted,
    /// implicitly acknowledging our 1-RTT keys
    pub fn on_one_rtt_protected_data(&mut self) {
        if self.phase == Phase::OneRttKeysDerived {
            trace!("established");
            self.phase = Phase::Established;
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Next CRYPTO frame awaiting packetization
    pub fn poll_outbound(&mut self) -> Option<(EncryptionLevel, frame::Crypto)> {
        self.outbound.pop_front()
    }

    fn raise(&mut self, e: HandshakeError) -> HandshakeError {
        self.error = Some(e.clone());
        e
    }

    fn check_error(&self) -> Result<(), HandshakeError> {
        match self.error {
            Some(ref e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    //
    // Move-out key accessors. Ownership of each cipher passes to the caller
    // exactly once; afterwards the slot reads as `None`. A pending error
    // short-circuits every accessor.
    //

    pub fn take_handshake_write_keys(&mut self) -> Result<Option<Keys>, HandshakeError> {
        self.check_error()?;
        Ok(self.handshake_write.take())
    }

    pub fn take_handshake_read_keys(&mut self) -> Result<Option<Keys>, HandshakeError> {
        self.check_error()?;
        Ok(self.handshake_read.take())
    }

    pub fn take_one_rtt_write_keys(&mut self) -> Result<Option<Keys>, HandshakeError> {
        self.check_error()?;
        Ok(self.one_rtt_write.take())
    }

    pub fn take_one_rtt_read_keys(&mut self) -> Result<Option<Keys>, HandshakeError> {
        self.check_error()?;
        Ok(self.one_rtt_read.take())
    }

    pub fn take_zero_rtt_write_keys(&mut self) -> Result<Option<Keys>, HandshakeError> {
        self.check_error()?;
        Ok(self.zero_rtt_write.take())
    }

    //
    // Queries
    //

    /// Whether the TLS session was resumed from a cached PSK
    pub fn is_tls_resumed(&self) -> bool {
        self.session.is_resumed()
    }

    /// Whether early data was attempted on this connection
    pub fn early_data_attempted(&self) -> bool {
        self.early_data_attempted
    }

    /// Whether the server declined our early data while keeping compatible
    /// parameters; consumed by the caller to rearm 0-RTT state for 1-RTT
    pub fn take_zero_rtt_rejected(&mut self) -> Option<bool> {
        self.zero_rtt_rejected.take()
    }

    /// The application protocol in effect
    ///
    /// While early data is in flight this is the protocol the early data was
    /// sent under; otherwise the negotiated one.
    pub fn application_protocol(&self) -> Option<&[u8]> {
        if self.early_data_attempted {
            if let Some(ref alpn) = self.early_alpn {
                return Some(alpn);
            }
        }
        self.session.alpn_protocol()
    }

    /// The server's transport parameters, once available
    pub fn server_transport_parameters(
        &mut self,
    ) -> Result<Option<TransportParameters>, HandshakeError> {
        self.check_error()?;
        self.session.transport_parameters().map_err(|e| {
            let e = HandshakeError::from(e);
            self.error = Some(e.clone());
            e
        })
    }

    /// ALPN negotiated by the completed handshake, for building cache entries
    pub fn negotiated_alpn(&self) -> Option<Vec<u8>> {
        self.session.alpn_protocol().map(|x| x.to_vec())
    }

    /// Drain a NewSessionTicket for storage in the PSK cache
    pub fn poll_session_ticket(&mut self) -> Option<SessionTicket> {
        self.session.poll_session_ticket()
    }
}
