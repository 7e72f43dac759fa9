use std::net::SocketAddr;
use std::{fmt, ops};

use rand::RngCore;

use crate::MAX_CID_SIZE;

/// Protocol-level identifier for a connection.
///
/// Mainly useful for identifying this connection's packets on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub(crate) fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub(crate) fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }
}

impl ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Identifies one of the UDP sockets supplied to a connection
///
/// The connection never touches sockets directly; every [`Transmit`] names the
/// socket it should leave through, and every incoming datagram names the
/// socket it arrived on. At most two sockets exist, one per address family,
/// while Happy Eyeballs races the initial flight.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SocketId {
    /// The socket the connection attempt began on
    Primary,
    /// The optional second socket of the opposite address family
    Secondary,
}

/// An outgoing UDP datagram
#[derive(Debug)]
pub struct Transmit {
    /// The socket this datagram should be sent from
    pub socket: SocketId,
    /// The address this datagram should be sent to
    pub destination: SocketAddr,
    /// Contents of the datagram
    pub contents: Vec<u8>,
}
