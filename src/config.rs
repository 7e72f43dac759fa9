use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::congestion::NewRenoConfig;
use crate::paths::AddressFamily;
use crate::psk::PskCache;
use crate::transport_parameters::{CustomParameter, MIN_CUSTOM_PARAMETER_ID};
use crate::varint;

/// Parameters governing the core QUIC state machine
///
/// Window sizes should be tuned to the expected round trip time, link
/// capacity, and memory availability. Larger windows raise worst-case memory
/// consumption but do not impair performance on slower links.
pub struct TransportConfig {
    /// Maximum number of bidirectional streams the peer may have open
    pub stream_window_bidi: u64,
    /// Variant of `stream_window_bidi` for unidirectional streams
    pub stream_window_uni: u64,
    /// Maximum duration of inactivity to accept before timing out the
    /// connection (ms). The effective value is the minimum of this and the
    /// peer's. 0 for none.
    pub idle_timeout_ms: u64,
    /// Maximum number of bytes the peer may transmit on any one stream
    /// before becoming blocked
    pub stream_receive_window: u64,
    /// Maximum number of bytes the peer may transmit across all streams
    /// before becoming blocked
    pub receive_window: u64,

    /// Maximum reordering in packet number space before packet-threshold
    /// loss detection considers a packet lost
    pub packet_threshold: u32,
    /// Maximum reordering in time space before time-threshold loss detection
    /// considers a packet lost; 0.16 fixed point, added to 1
    pub time_threshold: u16,
    /// The RTT used before an RTT sample is taken (μs)
    pub initial_rtt_us: u64,

    /// The sender's maximum UDP payload size, not including UDP or IP overhead
    pub udp_send_packet_len: u64,
    /// Initial congestion window, in units of `udp_send_packet_len`
    pub init_cwnd_in_mss: u64,
    /// Congestion window floor, in units of `udp_send_packet_len`
    pub min_cwnd_in_mss: u64,
    /// Congestion window ceiling, in units of `udp_send_packet_len`
    pub max_cwnd_in_mss: u64,
    /// Packets permitted per write burst
    pub write_packets_limit: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        const EXPECTED_RTT: u64 = 100; // ms
        const MAX_STREAM_BANDWIDTH: u64 = 12500 * 1000; // bytes/s
        // Window size needed to avoid pipeline stalls
        const STREAM_RWND: u64 = MAX_STREAM_BANDWIDTH / 1000 * EXPECTED_RTT;

        Self {
            stream_window_bidi: 32,
            stream_window_uni: 32,
            idle_timeout_ms: 10_000,
            stream_receive_window: STREAM_RWND,
            receive_window: 8 * STREAM_RWND,

            packet_threshold: 3,
            time_threshold: 0x2000, // 1/8
            initial_rtt_us: EXPECTED_RTT * 1000,

            udp_send_packet_len: crate::DEFAULT_UDP_SEND_PACKET_LEN,
            init_cwnd_in_mss: 10,
            min_cwnd_in_mss: 2,
            max_cwnd_in_mss: 2000,
            write_packets_limit: 5,
        }
    }
}

impl TransportConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if let Some(&(name, _)) = [
            ("stream_window_bidi", self.stream_window_bidi),
            ("stream_window_uni", self.stream_window_uni),
            ("receive_window", self.receive_window),
            ("stream_receive_window", self.stream_receive_window),
        ]
        .iter()
        .find(|&&(_, x)| x > varint::MAX_VALUE)
        {
            return Err(ConfigError::VarIntBounds(name));
        }
        if self.min_cwnd_in_mss > self.max_cwnd_in_mss || self.min_cwnd_in_mss == 0 {
            return Err(ConfigError::IllegalValue(
                "congestion window bounds must satisfy 0 < min <= max",
            ));
        }
        if self.udp_send_packet_len < 1200 {
            return Err(ConfigError::IllegalValue(
                "udp_send_packet_len must be at least 1200",
            ));
        }
        Ok(())
    }

    pub(crate) fn congestion(&self) -> NewRenoConfig {
        NewRenoConfig {
            udp_send_packet_len: self.udp_send_packet_len,
            init_cwnd_in_mss: self.init_cwnd_in_mss,
            min_cwnd_in_mss: self.min_cwnd_in_mss,
            max_cwnd_in_mss: self.max_cwnd_in_mss,
            write_packets_limit: self.write_packets_limit,
        }
    }
}

/// Per-connection client configuration
///
/// The TLS context, certificate verifier, and hostname validation live with
/// the session factory supplied at connection construction; this carries
/// everything the transport itself needs before `start`.
pub struct ClientConfig {
    /// Server name, for certificate validation and PSK cache keying
    pub server_name: String,
    /// Candidate peer addresses, at most one per address family
    pub remotes: Vec<SocketAddr>,
    /// Whether to race address families when both are available
    pub happy_eyeballs: bool,
    /// Address family that worked for a previous connection, if known
    pub cached_family: Option<AddressFamily>,
    /// Cache holding resumption state across connections
    pub psk_cache: Option<Arc<dyn PskCache>>,
    /// Private transport parameters to append to the ClientHello
    pub custom_parameters: Vec<CustomParameter>,
}

impl ClientConfig {
    /// Configuration with the given server name and no peer addresses yet
    pub fn new<T: Into<String>>(server_name: T) -> Self {
        Self {
            server_name: server_name.into(),
            remotes: Vec::new(),
            happy_eyeballs: false,
            cached_family: None,
            psk_cache: None,
            custom_parameters: Vec::new(),
        }
    }

    /// Supply a peer address; must be called at least once before start
    pub fn add_peer_address(&mut self, remote: SocketAddr) -> &mut Self {
        self.remotes.push(remote);
        self
    }

    /// Enable racing the connection over both address families
    pub fn happy_eyeballs(&mut self, enabled: bool) -> &mut Self {
        self.happy_eyeballs = enabled;
        self
    }

    /// Set the cache that remembers PSKs and server transport parameters from
    /// previous connections, enabling resumption and 0-RTT
    pub fn psk_cache(&mut self, cache: Arc<dyn PskCache>) -> &mut Self {
        self.psk_cache = Some(cache);
        self
    }

    /// Register a private transport parameter
    ///
    /// Private parameters must use IDs greater than 0x3fff.
    pub fn custom_transport_parameter(
        &mut self,
        param: CustomParameter,
    ) -> Result<&mut Self, ConfigError> {
        if param.id < MIN_CUSTOM_PARAMETER_ID {
            return Err(ConfigError::IllegalValue(
                "custom transport parameter IDs must be greater than 0x3fff",
            ));
        }
        self.custom_parameters.push(param);
        Ok(self)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.remotes.is_empty() {
            return Err(ConfigError::IllegalValue(
                "at least one peer address is required",
            ));
        }
        Ok(())
    }
}

/// Errors in the configuration of a connection
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Value exceeds the varint-encodable range
    #[error("{0} too large for varint encoding")]
    VarIntBounds(&'static str),
    /// Value out of its permitted range
    #[error("illegal configuration value: {0}")]
    IllegalValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn defaults_validate() {
        TransportConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_tiny_packets() {
        let config = TransportConfig {
            udp_send_packet_len: 500,
            ..TransportConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn custom_parameter_ids_restricted() {
        let mut config = ClientConfig::new("example.com");
        assert!(config
            .custom_transport_parameter(CustomParameter {
                id: 0x3fff,
                value: Bytes::new(),
            })
            .is_err());
        assert!(config
            .custom_transport_parameter(CustomParameter {
                id: 0x4000,
                value: Bytes::new(),
            })
            .is_ok());
    }

    #[test]
    fn peer_address_required() {
        let config = ClientConfig::new("example.com");
        assert!(config.validate().is_err());
    }
}
