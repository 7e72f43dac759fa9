use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;
use std::{cmp, mem};

use bytes::Bytes;
use fnv::FnvHashSet;

use crate::crypto::Keys;
use crate::frame;
use crate::range_set::RangeSet;
use crate::StreamId;

/// State specific to one packet number space
pub struct PacketSpace {
    /// Keys protecting what we send in this space, if derived yet
    pub write_keys: Option<Keys>,
    /// Keys unprotecting what the peer sends in this space
    pub read_keys: Option<Keys>,
    pub dedup: Dedup,
    /// Highest received packet number
    pub rx_packet: u64,
    /// Time at which the above was received
    pub rx_packet_time: Instant,

    /// Data to send
    pub pending: Retransmits,
    /// Packet numbers to acknowledge
    pub pending_acks: RangeSet,
    /// Set iff we have received a non-ack frame since the last ack-only packet we sent
    pub permit_ack_only: bool,

    /// The packet number of the next packet that will be sent, if any
    pub next_packet_number: u64,
    /// The largest packet number the remote peer acknowledged in an ACK frame
    pub largest_acked_packet: u64,
    /// Transmitted but not acked
    // BTreeMap to allow the range queries ACK processing and loss detection need
    pub sent_packets: BTreeMap<u64, SentPacket>,
}

impl PacketSpace {
    pub fn new(now: Instant) -> Self {
        Self {
            write_keys: None,
            read_keys: None,
            dedup: Dedup::new(),
            rx_packet: 0,
            rx_packet_time: now,

            pending: Retransmits::default(),
            pending_acks: RangeSet::new(),
            permit_ack_only: false,

            next_packet_number: 0,
            largest_acked_packet: 0,
            sent_packets: BTreeMap::new(),
        }
    }

    pub fn get_tx_number(&mut self) -> u64 {
        // TODO: Handle packet number overflow gracefully
        assert!(self.next_packet_number < 2u64.pow(62));
        let x = self.next_packet_number;
        self.next_packet_number += 1;
        x
    }

    pub fn can_send(&self) -> bool {
        !self.pending.is_empty() || (self.permit_ack_only && !self.pending_acks.is_empty())
    }

    /// Mark the tail of `id`'s queued data FIN, or queue an empty FIN frame
    pub fn finish_stream(&mut self, id: StreamId, offset: u64) {
        for frame in &mut self.pending.stream {
            if frame.id == id && frame.offset + frame.data.len() as u64 == offset {
                frame.fin = true;
                return;
            }
        }
        self.pending.stream.push_back(frame::Stream {
            id,
            data: Bytes::new(),
            offset,
            fin: true,
        });
    }
}

/// Represents one or more packets subject to retransmission
#[derive(Debug, Clone)]
pub struct SentPacket {
    /// The time the packet was sent
    pub time_sent: Instant,
    /// The number of bytes sent in the packet, not including UDP or IP
    /// overhead, but including QUIC framing overhead. Zero if this packet is
    /// not counted towards congestion control, i.e. not an "in flight" packet.
    pub size: u16,
    /// Whether an acknowledgement is expected directly in response to this packet
    pub ack_eliciting: bool,
    /// Whether the packet carries CRYPTO frames critical to handshake completion
    pub is_crypto_packet: bool,
    /// Acknowledgements included in the packet, so they can be re-queued if it is lost
    pub acks: RangeSet,
    pub retransmits: Retransmits,
}

/// Retransmittable data queued for transmission
#[derive(Debug, Clone)]
pub struct Retransmits {
    pub max_data: bool,
    pub max_uni_stream_id: bool,
    pub max_bi_stream_id: bool,
    pub stream: VecDeque<frame::Stream>,
    pub rst_stream: Vec<(StreamId, u16)>,
    pub stop_sending: Vec<(StreamId, u16)>,
    pub max_stream_data: FnvHashSet<StreamId>,
    pub crypto: VecDeque<frame::Crypto>,
}

impl Retransmits {
    pub fn is_empty(&self) -> bool {
        !self.max_data
            && !self.max_uni_stream_id
            && !self.max_bi_stream_id
            && self.stream.is_empty()
            && self.rst_stream.is_empty()
            && self.stop_sending.is_empty()
            && self.max_stream_data.is_empty()
            && self.crypto.is_empty()
    }
}

impl Default for Retransmits {
    fn default() -> Self {
        Self {
            max_data: false,
            max_uni_stream_id: false,
            max_bi_stream_id: false,
            stream: VecDeque::new(),
            rst_stream: Vec::new(),
            stop_sending: Vec::new(),
            max_stream_data: FnvHashSet::default(),
            crypto: VecDeque::new(),
        }
    }
}

impl ::std::ops::AddAssign for Retransmits {
    fn add_assign(&mut self, rhs: Self) {
        // Requeue retransmits ahead of fresh data to reduce in-stream
        // head-of-line blocking
        self.max_data |= rhs.max_data;
        self.max_uni_stream_id |= rhs.max_uni_stream_id;
        self.max_bi_stream_id |= rhs.max_bi_stream_id;
        for stream in rhs.stream.into_iter().rev() {
            self.stream.push_front(stream);
        }
        self.rst_stream.extend_from_slice(&rhs.rst_stream);
        self.stop_sending.extend_from_slice(&rhs.stop_sending);
        self.max_stream_data.extend(&rhs.max_stream_data);
        for crypto in rhs.crypto.into_iter().rev() {
            self.crypto.push_front(crypto);
        }
    }
}

/// RFC 4303-style sliding window packet number deduplicator.
///
/// A contiguous bitfield, where each bit corresponds to a packet number and
/// the rightmost bit is always set. A set bit represents a packet that has
/// been successfully authenticated. Bits left of the window are assumed set.
///
/// ```text
/// ...xxxxxxxxx 1 0
///     ^        ^ ^
/// window highest next
/// ```
pub struct Dedup {
    window: Window,
    /// Lowest packet number higher than all yet authenticated
    next: u64,
}

/// Inner bitfield type.
///
/// Packet numbers are never reused, so this only needs to cover packets that
/// are reordered but still delivered in a timely manner.
type Window = u128;

/// Number of packets tracked by `Dedup`
const WINDOW_SIZE: u64 = 1 + mem::size_of::<Window>() as u64 * 8;

impl Dedup {
    /// Construct an empty window positioned at the start
    pub fn new() -> Self {
        Self { window: 0, next: 0 }
    }

    /// Highest packet number authenticated
    fn highest(&self) -> u64 {
        self.next - 1
    }

    /// Record a newly authenticated packet number.
    ///
    /// Returns whether the packet might be a duplicate.
    pub fn insert(&mut self, packet: u64) -> bool {
        if let Some(diff) = packet.checked_sub(self.next) {
            // Right of the window
            self.window = (self.window << 1 | 1)
                .checked_shl(cmp::min(diff, u64::from(u32::max_value())) as u32)
                .unwrap_or(0);
            self.next = packet + 1;
            false
        } else if self.highest() - packet < WINDOW_SIZE {
            // Within the window
            if let Some(bit) = (self.highest() - packet).checked_sub(1) {
                // < highest
                let mask = 1 << bit;
                let duplicate = self.window & mask != 0;
                self.window |= mask;
                duplicate
            } else {
                // == highest
                true
            }
        } else {
            // Left of the window
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_sanity() {
        let mut dedup = Dedup::new();
        assert!(!dedup.insert(0));
        assert!(dedup.insert(0));
        assert!(!dedup.insert(1));
        assert!(!dedup.insert(2));
        assert!(!dedup.insert(4));
        assert!(!dedup.insert(7));
        assert!(dedup.insert(4));
        assert!(!dedup.insert(3));
        assert!(!dedup.insert(6));
        assert!(!dedup.insert(5));
        assert!(dedup.insert(5));
    }

    #[test]
    fn dedup_happypath() {
        let mut dedup = Dedup::new();
        for i in 0..(2 * WINDOW_SIZE) {
            assert!(!dedup.insert(i));
            for j in 0..=i {
                assert!(dedup.insert(j));
            }
        }
    }

    #[test]
    fn dedup_jump() {
        let mut dedup = Dedup::new();
        dedup.insert(2 * WINDOW_SIZE);
        assert!(dedup.insert(WINDOW_SIZE));
        assert_eq!(dedup.next, 2 * WINDOW_SIZE + 1);
        assert_eq!(dedup.window, 0);
        assert!(!dedup.insert(WINDOW_SIZE + 1));
        assert_eq!(dedup.next, 2 * WINDOW_SIZE + 1);
        assert_eq!(dedup.window, 1 << (WINDOW_SIZE - 2));
    }

    #[test]
    fn retransmits_requeue_order() {
        let mut base = Retransmits::default();
        base.stream.push_back(crate::frame::Stream {
            id: StreamId(0),
            offset: 100,
            fin: false,
            data: Bytes::from_static(b"new"),
        });
        let mut lost = Retransmits::default();
        lost.stream.push_back(crate::frame::Stream {
            id: StreamId(0),
            offset: 0,
            fin: false,
            data: Bytes::from_static(b"old"),
        });
        base += lost;
        assert_eq!(base.stream[0].offset, 0);
        assert_eq!(base.stream[1].offset, 100);
    }
}
