//! Logic for limiting the amount of data allowed in flight

use std::time::{Duration, Instant};

mod new_reno;
pub use new_reno::{NewReno, NewRenoConfig};

/// A batch of newly acknowledged packets
#[derive(Debug, Copy, Clone)]
pub struct AckEvent {
    /// Sum of the encoded sizes of the acknowledged packets
    pub acked_bytes: u64,
    /// Highest packet number among the acknowledged packets
    pub largest_acked_packet: u64,
}

/// A batch of packets declared lost
#[derive(Debug, Copy, Clone)]
pub struct LossEvent {
    /// Sum of the encoded sizes of the lost packets
    pub lost_bytes: u64,
    /// Highest packet number among the lost packets
    pub largest_lost_packet: u64,
    /// Highest packet number sent so far, recorded when the loss was detected
    pub largest_sent: u64,
}

/// Common interface for congestion controllers
///
/// A controller accounts for every byte handed to the network and gates
/// further sends via [`writable_bytes`](Controller::writable_bytes).
pub trait Controller: Send {
    /// A packet of `bytes` encoded size was handed to the socket
    fn on_packet_sent(&mut self, bytes: u64);

    /// Packets left tracking for a reason other than acknowledgement, e.g.
    /// they were abandoned along with their epoch or queued for
    /// retransmission
    fn on_remove_bytes_from_inflight(&mut self, bytes: u64);

    /// Packet deliveries were confirmed
    fn on_packet_acked(&mut self, ack: &AckEvent);

    /// Packets were deemed lost
    fn on_packet_loss(&mut self, loss: &LossEvent);

    /// Process the outcome of one ACK frame. Losses are applied before acks
    /// so inflight accounting reflects them first.
    fn on_packet_ack_or_loss(&mut self, ack: Option<&AckEvent>, loss: Option<&LossEvent>) {
        if let Some(loss) = loss {
            self.on_packet_loss(loss);
        }
        if let Some(ack) = ack {
            self.on_packet_acked(ack);
        }
    }

    /// A retransmission timeout was confirmed genuine by a subsequent ack
    fn on_rto_verified(&mut self);

    /// Number of bytes that may currently be sent
    fn writable_bytes(&self) -> u64;

    /// Current congestion window in bytes
    fn congestion_window(&self) -> u64;

    /// Bytes of outstanding packets, neither acked nor declared lost
    fn bytes_in_flight(&self) -> u64;

    /// Whether the window is still growing by acked bytes
    fn in_slow_start(&self) -> bool;

    /// Whether this controller supports pacing
    fn can_be_paced(&self) -> bool {
        false
    }

    /// Interval between paced writes
    fn pacing_interval(&self) -> Duration;

    /// Packets permitted per paced write
    fn pacing_rate(&self, now: Instant) -> u64;

    /// Which algorithm this controller implements
    fn kind(&self) -> Kind;
}

/// Identifies a congestion control algorithm
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Kind {
    /// Standard NewReno
    NewReno,
}

/// Clamp a congestion window to the configured bounds
fn bounded_cwnd(cwnd: u64, udp_send_packet_len: u64, max_cwnd_in_mss: u64, min_cwnd_in_mss: u64) -> u64 {
    cwnd.min(max_cwnd_in_mss * udp_send_packet_len)
        .max(min_cwnd_in_mss * udp_send_packet_len)
}

/// Timer resolution assumed by pacing queries on controllers that do not pace
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_micros(200);
