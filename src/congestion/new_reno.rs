use std::time::{Duration, Instant};

use tracing::trace;

use super::{bounded_cwnd, AckEvent, Controller, Kind, LossEvent, DEFAULT_TICK_INTERVAL};
use crate::DEFAULT_UDP_SEND_PACKET_LEN;

const LOSS_REDUCTION_FACTOR_SHIFT: u32 = 1;

/// A simple, standard congestion controller
///
/// Multiplicative decrease happens at most once per recovery episode: a loss
/// only shrinks the window when its packet number lies beyond the episode
/// started by the previous loss.
#[derive(Debug, Clone)]
pub struct NewReno {
    config: NewRenoConfig,
    /// Maximum number of bytes that may be in flight
    cwnd_bytes: u64,
    /// Window size below which acked bytes grow the window directly
    ssthresh: u64,
    bytes_in_flight: u64,
    /// Packet number past which the next loss starts a fresh recovery episode
    end_of_recovery: u64,
}

impl NewReno {
    /// Construct a controller with the window at its configured initial size
    pub fn new(config: NewRenoConfig) -> Self {
        let cwnd_bytes = bounded_cwnd(
            config.init_cwnd_in_mss * config.udp_send_packet_len,
            config.udp_send_packet_len,
            config.max_cwnd_in_mss,
            config.min_cwnd_in_mss,
        );
        Self {
            config,
            cwnd_bytes,
            ssthresh: u64::max_value(),
            bytes_in_flight: 0,
            end_of_recovery: 0,
        }
    }

    fn clamp_cwnd(&mut self) {
        self.cwnd_bytes = bounded_cwnd(
            self.cwnd_bytes,
            self.config.udp_send_packet_len,
            self.config.max_cwnd_in_mss,
            self.config.min_cwnd_in_mss,
        );
    }
}

impl Controller for NewReno {
    fn on_packet_sent(&mut self, bytes: u64) {
        self.bytes_in_flight = self
            .bytes_in_flight
            .checked_add(bytes)
            .expect("bytes in flight overflow");
        trace!(
            writable = self.writable_bytes(),
            cwnd = self.cwnd_bytes,
            inflight = self.bytes_in_flight,
            "sent"
        );
    }

    fn on_remove_bytes_from_inflight(&mut self, bytes: u64) {
        self.bytes_in_flight = self
            .bytes_in_flight
            .checked_sub(bytes)
            .expect("bytes in flight underflow");
        trace!(
            writable = self.writable_bytes(),
            cwnd = self.cwnd_bytes,
            inflight = self.bytes_in_flight,
            "removed from inflight"
        );
    }

    fn on_packet_acked(&mut self, ack: &AckEvent) {
        self.bytes_in_flight = self
            .bytes_in_flight
            .checked_sub(ack.acked_bytes)
            .expect("bytes in flight underflow");

        if ack.largest_acked_packet < self.end_of_recovery {
            // Still inside a recovery episode; no window growth
            return;
        }
        if self.cwnd_bytes < self.ssthresh {
            // Slow start
            self.cwnd_bytes = self
                .cwnd_bytes
                .checked_add(ack.acked_bytes)
                .expect("congestion window overflow");
        } else {
            // Congestion avoidance
            // TODO: confirm whether this should scale by the connection's
            // negotiated datagram size instead of the protocol default; check
            // how the Linux stack computes the equivalent term first
            let addition = (DEFAULT_UDP_SEND_PACKET_LEN * ack.acked_bytes) / self.cwnd_bytes;
            self.cwnd_bytes = self
                .cwnd_bytes
                .checked_add(addition)
                .expect("congestion window overflow");
        }
        self.clamp_cwnd();
        trace!(
            writable = self.writable_bytes(),
            cwnd = self.cwnd_bytes,
            inflight = self.bytes_in_flight,
            largest_acked = ack.largest_acked_packet,
            "acked"
        );
    }

    fn on_packet_loss(&mut self, loss: &LossEvent) {
        self.bytes_in_flight = self
            .bytes_in_flight
            .checked_sub(loss.lost_bytes)
            .expect("bytes in flight underflow");
        if self.end_of_recovery < loss.largest_lost_packet {
            self.end_of_recovery = loss.largest_sent;
            self.cwnd_bytes >>= LOSS_REDUCTION_FACTOR_SHIFT;
            self.clamp_cwnd();
            // Also exits slow start
            self.ssthresh = self.cwnd_bytes;
            trace!(
                ssthresh = self.ssthresh,
                cwnd = self.cwnd_bytes,
                inflight = self.bytes_in_flight,
                packet = loss.largest_lost_packet,
                "new recovery episode"
            );
        } else {
            trace!(
                cwnd = self.cwnd_bytes,
                inflight = self.bytes_in_flight,
                packet = loss.largest_lost_packet,
                "loss within recovery"
            );
        }
    }

    fn on_rto_verified(&mut self) {
        self.cwnd_bytes = self.config.min_cwnd_in_mss * self.config.udp_send_packet_len;
        trace!(cwnd = self.cwnd_bytes, "RTO verified, window collapsed");
    }

    fn writable_bytes(&self) -> u64 {
        if self.bytes_in_flight > self.cwnd_bytes {
            0
        } else {
            self.cwnd_bytes - self.bytes_in_flight
        }
    }

    fn congestion_window(&self) -> u64 {
        self.cwnd_bytes
    }

    fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    fn in_slow_start(&self) -> bool {
        self.cwnd_bytes < self.ssthresh
    }

    fn pacing_interval(&self) -> Duration {
        // Pacing is not supported on NewReno
        DEFAULT_TICK_INTERVAL
    }

    fn pacing_rate(&self, _now: Instant) -> u64 {
        // Pacing is not supported on NewReno
        self.config.write_packets_limit
    }

    fn kind(&self) -> Kind {
        Kind::NewReno
    }
}

/// Configuration for the `NewReno` congestion controller
#[derive(Debug, Clone)]
pub struct NewRenoConfig {
    /// The sender's maximum UDP payload size, not including UDP or IP overhead
    pub udp_send_packet_len: u64,
    /// Initial congestion window, in units of `udp_send_packet_len`
    pub init_cwnd_in_mss: u64,
    /// Lower bound on the congestion window, in units of `udp_send_packet_len`
    pub min_cwnd_in_mss: u64,
    /// Upper bound on the congestion window, in units of `udp_send_packet_len`
    pub max_cwnd_in_mss: u64,
    /// Packets permitted per write burst; reported by the pacing-rate query
    pub write_packets_limit: u64,
}

impl Default for NewRenoConfig {
    fn default() -> Self {
        Self {
            udp_send_packet_len: DEFAULT_UDP_SEND_PACKET_LEN,
            init_cwnd_in_mss: 10,
            min_cwnd_in_mss: 2,
            max_cwnd_in_mss: 2000,
            write_packets_limit: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> NewReno {
        NewReno::new(NewRenoConfig::default())
    }

    #[test]
    fn slow_start_grows_by_acked_bytes() {
        let mut cc = controller();
        assert_eq!(cc.congestion_window(), 12_000);
        assert!(cc.in_slow_start());

        cc.on_packet_sent(1200);
        assert_eq!(cc.bytes_in_flight(), 1200);
        cc.on_packet_acked(&AckEvent {
            acked_bytes: 1200,
            largest_acked_packet: 1,
        });
        assert_eq!(cc.congestion_window(), 13_200);
        assert_eq!(cc.bytes_in_flight(), 0);
        assert!(cc.in_slow_start());
    }

    #[test]
    fn ack_zeroes_inflight_exactly() {
        let mut cc = controller();
        cc.on_packet_sent(777);
        cc.on_packet_acked(&AckEvent {
            acked_bytes: 777,
            largest_acked_packet: 1,
        });
        assert_eq!(cc.bytes_in_flight(), 0);
        assert_eq!(cc.writable_bytes(), cc.congestion_window());
    }

    #[test]
    fn loss_halves_window_once_per_episode() {
        let mut cc = controller();
        // Grow past the initial window
        for i in 1..=10 {
            cc.on_packet_sent(1200);
            cc.on_packet_acked(&AckEvent {
                acked_bytes: 1200,
                largest_acked_packet: i,
            });
        }
        let before = cc.congestion_window();
        assert_eq!(before, 24_000);

        cc.on_packet_sent(1200);
        cc.on_packet_sent(1200);
        cc.on_packet_loss(&LossEvent {
            lost_bytes: 1200,
            largest_lost_packet: 11,
            largest_sent: 100,
        });
        assert_eq!(cc.congestion_window(), 12_000);
        assert_eq!(cc.ssthresh, 12_000);
        assert_eq!(cc.end_of_recovery, 100);
        assert!(!cc.in_slow_start());

        // A second loss within the same recovery window changes nothing
        cc.on_packet_loss(&LossEvent {
            lost_bytes: 1200,
            largest_lost_packet: 80,
            largest_sent: 120,
        });
        assert_eq!(cc.congestion_window(), 12_000);
        assert_eq!(cc.end_of_recovery, 100);
    }

    #[test]
    fn no_growth_for_acks_inside_recovery() {
        let mut cc = controller();
        cc.on_packet_sent(2400);
        cc.on_packet_loss(&LossEvent {
            lost_bytes: 1200,
            largest_lost_packet: 1,
            largest_sent: 50,
        });
        let window = cc.congestion_window();
        cc.on_packet_acked(&AckEvent {
            acked_bytes: 1200,
            largest_acked_packet: 40,
        });
        assert_eq!(cc.congestion_window(), window);
    }

    #[test]
    fn congestion_avoidance_uses_default_packet_len() {
        let mut cc = NewReno::new(NewRenoConfig {
            udp_send_packet_len: 9000,
            ..NewRenoConfig::default()
        });
        // Leave slow start
        cc.on_packet_sent(1000);
        cc.on_packet_loss(&LossEvent {
            lost_bytes: 1000,
            largest_lost_packet: 1,
            largest_sent: 1,
        });
        assert!(!cc.in_slow_start());
        let before = cc.congestion_window();
        cc.on_packet_sent(1000);
        cc.on_packet_acked(&AckEvent {
            acked_bytes: 1000,
            largest_acked_packet: 2,
        });
        // Growth is scaled by the protocol constant, not the configured size
        let expected = before + DEFAULT_UDP_SEND_PACKET_LEN * 1000 / before;
        assert_eq!(cc.congestion_window(), expected);
    }

    #[test]
    fn halving_clamps_at_floor() {
        let mut cc = NewReno::new(NewRenoConfig {
            init_cwnd_in_mss: 2,
            ..NewRenoConfig::default()
        });
        assert_eq!(cc.congestion_window(), 2400);
        cc.on_packet_sent(1200);
        cc.on_packet_loss(&LossEvent {
            lost_bytes: 1200,
            largest_lost_packet: 1,
            largest_sent: 1,
        });
        // Halving would give 1200; the floor is 2 * 1200
        assert_eq!(cc.congestion_window(), 2400);
    }

    #[test]
    fn rto_collapses_to_floor() {
        let mut cc = controller();
        for i in 1..=20 {
            cc.on_packet_sent(1200);
            cc.on_packet_acked(&AckEvent {
                acked_bytes: 1200,
                largest_acked_packet: i,
            });
        }
        assert!(cc.congestion_window() > 2400);
        cc.on_rto_verified();
        assert_eq!(cc.congestion_window(), 2400);
    }

    #[test]
    fn ack_or_loss_applies_loss_first() {
        let mut cc = controller();
        cc.on_packet_sent(1200);
        cc.on_packet_sent(1200);
        cc.on_packet_ack_or_loss(
            Some(&AckEvent {
                acked_bytes: 1200,
                largest_acked_packet: 2,
            }),
            Some(&LossEvent {
                lost_bytes: 1200,
                largest_lost_packet: 1,
                largest_sent: 2,
            }),
        );
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn writable_bytes_never_underflows() {
        let mut cc = NewReno::new(NewRenoConfig {
            init_cwnd_in_mss: 2,
            ..NewRenoConfig::default()
        });
        cc.on_packet_sent(5000);
        assert_eq!(cc.writable_bytes(), 0);
    }

    #[test]
    fn slow_start_tracks_ssthresh() {
        let mut cc = controller();
        assert!(cc.in_slow_start());
        cc.on_packet_sent(1200);
        cc.on_packet_loss(&LossEvent {
            lost_bytes: 1200,
            largest_lost_packet: 1,
            largest_sent: 1,
        });
        assert_eq!(cc.in_slow_start(), cc.congestion_window() < cc.ssthresh);
        assert!(!cc.in_slow_start());
    }
}
