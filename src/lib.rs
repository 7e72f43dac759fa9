//! Client-side protocol logic for the QUIC transport protocol (draft 17 era)
//!
//! This library implements the hard parts of a QUIC client as a deterministic
//! state machine: the connection lifecycle, the TLS-over-QUIC handshake
//! driver and its per-epoch key schedule, NewReno congestion control, the
//! stream and flow-control engine, and Happy Eyeballs path selection across a
//! pair of UDP sockets.
//!
//! It performs no I/O of its own. The embedding event loop feeds it incoming
//! datagrams and timer expirations, and drains outgoing datagrams via
//! [`ClientConnection::poll_transmit`] and application-facing events via
//! [`ClientConnection::poll`]. All state lives on one thread; scale-out is
//! achieved by sharding connections across event loops.
//!
//! The TLS record layer itself is an external collaborator, reached only
//! through the epoch-keyed secret interface in [`crypto::Session`].

#![warn(missing_docs)]

use std::fmt;
use std::ops;

mod assembler;
mod coding;
mod crypto_stream;
mod range_set;
mod spaces;
mod varint;


/// Congestion control strategies
pub mod congestion;
/// Cryptographic material and the TLS collaborator interface
pub mod crypto;

mod config;
pub use crate::config::{ClientConfig, ConfigError, TransportConfig};

mod connection;
pub use crate::connection::{
    ClientConnection, ConnectError, ConnectionError, Event, Io, Timer, TimerSetting, TimerUpdate,
};

mod frame;
pub use crate::frame::{ApplicationClose, ConnectionClose};

mod handshake;
pub use crate::handshake::Phase;

mod packet;

mod paths;
pub use crate::paths::AddressFamily;

mod psk;
pub use crate::psk::{CachedPsk, InMemoryPskCache, PskCache};

mod shared;
pub use crate::shared::{ConnectionId, SocketId, Transmit};

mod stream;
pub use crate::stream::{FinishError, ReadError, WriteError};

mod streams;

mod transport_error;
pub use crate::transport_error::{Code as TransportErrorCode, TransportError};

mod transport_parameters;
pub use crate::transport_parameters::{CustomParameter, TransportParameters};

/// The QUIC protocol version implemented
pub const VERSION: u32 = 0xff00_0011;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Directionality {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl Directionality {
    fn iter() -> impl Iterator<Item = Self> {
        [Directionality::Bi, Directionality::Uni].iter().cloned()
    }
}

impl fmt::Display for Directionality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Directionality::Bi => "bidirectional",
            Directionality::Uni => "unidirectional",
        };
        f.write_str(s)
    }
}

/// Identifier for a stream within a particular connection
///
/// The two low bits encode the initiating side and the directionality.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub(crate) u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        let directionality = match self.directionality() {
            Directionality::Uni => "uni",
            Directionality::Bi => "bi",
        };
        write!(
            f,
            "{} {}directional stream {}",
            initiator,
            directionality,
            self.index()
        )
    }
}

impl StreamId {
    pub(crate) fn new(initiator: Side, directionality: Directionality, index: u64) -> Self {
        StreamId(index << 2 | (directionality as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn directionality(self) -> Directionality {
        if self.0 & 0x2 == 0 {
            Directionality::Bi
        } else {
            Directionality::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl coding::Codec for StreamId {
    fn decode<B: bytes::Buf>(buf: &mut B) -> coding::Result<StreamId> {
        varint::read(buf).map(StreamId).ok_or(coding::UnexpectedEnd)
    }
    fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        varint::write(self.0, buf).unwrap()
    }
}

//
// Useful internal constants
//

const MAX_CID_SIZE: usize = 18;
const MIN_CID_SIZE: usize = 4;
const LOC_CID_LEN: usize = 8;
const MIN_INITIAL_SIZE: usize = 1200;
const MIN_MTU: u16 = 1232;
const TIMER_GRANULARITY: std::time::Duration = std::time::Duration::from_millis(1);

/// The protocol's canonical UDP datagram size, used by NewReno's congestion
/// avoidance growth independently of the connection's negotiated size
const DEFAULT_UDP_SEND_PACKET_LEN: u64 = 1200;
