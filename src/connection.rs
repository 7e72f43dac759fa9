use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{cmp, mem};

use bytes::{Buf, Bytes, BytesMut};
use fnv::FnvHashSet;
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::{debug, trace};

use crate::coding::BufExt;
use crate::config::{ClientConfig, ConfigError, TransportConfig};
use crate::congestion::{AckEvent, Controller, LossEvent, NewReno};
use crate::crypto::{self, EncryptionLevel, Keys, Session};
use crate::frame::{self, ApplicationClose, ConnectionClose, Frame, FrameStruct};
use crate::handshake::{HandshakeDriver, HandshakeError, Phase};
use crate::packet::{
    Header, LongType, Packet, PacketDecodeError, PacketNumber, PartialDecode, SpaceId,
};
use crate::paths::PathManager;
use crate::psk::{CachedPsk, PskCache};
use crate::range_set::RangeSet;
use crate::shared::{ConnectionId, SocketId, Transmit};
use crate::spaces::{PacketSpace, Retransmits, SentPacket};
use crate::stream::{self, FinishError, ReadError, WriteError};
use crate::streams::Streams;
use crate::transport_error::TransportError;
use crate::transport_parameters::TransportParameters;
use crate::{Directionality, StreamId, LOC_CID_LEN, MIN_INITIAL_SIZE, TIMER_GRANULARITY};

/// A client-side QUIC connection
///
/// Performs no I/O itself. Feed it datagrams with
/// [`handle_dgram`](Self::handle_dgram) and timer expirations with
/// [`timeout`](Self::timeout); drain outgoing datagrams with
/// [`poll_transmit`](Self::poll_transmit), timer changes and socket
/// retirements with [`poll_io`](Self::poll_io), and application events with
/// [`poll`](Self::poll).
pub struct ClientConnection<S: Session> {
    config: Arc<TransportConfig>,
    server_name: String,
    psk_cache: Option<Arc<dyn PskCache>>,
    handshake: HandshakeDriver<S>,
    paths: PathManager,

    /// DCID of our first Initial packet; the Initial keys derive from it
    init_cid: ConnectionId,
    loc_cid: ConnectionId,
    rem_cid: ConnectionId,
    /// Whether the peer has supplied its own CID yet
    rem_cid_set: bool,

    state: State,
    app_closed: bool,
    /// Whether `Event::Connected` has been delivered
    connected_emitted: bool,

    /// Peer-advertised transport parameters, once the handshake supplies them
    params: TransportParameters,
    server_params_set: bool,

    /// Packet number spaces: Initial, Handshake, 1-RTT
    spaces: [PacketSpace; 3],
    /// Highest packet number space with write keys installed
    highest_space: SpaceId,
    /// 0-RTT packet protection; write-only, a client never receives early data
    zero_rtt_keys: Option<Keys>,

    streams: Streams,
    /// Streams blocked on connection-level flow control or congestion
    blocked_streams: FnvHashSet<StreamId>,

    congestion: Box<dyn Controller>,
    /// Outstanding packet counters feeding the loss-detection alarms
    in_flight: InFlight,

    //
    // Loss detection
    //
    /// Consecutive times all unacked CRYPTO data was retransmitted
    crypto_count: u32,
    /// Consecutive RTOs fired without an intervening ack
    rto_count: u32,
    /// Largest packet number sent before the most recent RTO fired
    largest_sent_before_rto: u64,
    /// Earliest time at which time-threshold loss detection declares a loss
    loss_time: Option<Instant>,
    time_of_last_sent_ack_eliciting_packet: Instant,
    time_of_last_sent_crypto_packet: Instant,
    rtt: RttEstimator,
    /// Total outgoing packets deemed lost
    lost_packets: u64,

    idle_timeout_ms: u64,
    events: VecDeque<Event>,
    io: IoQueue,
    ping_pending: bool,
    /// PATH_RESPONSE owed to the peer, most recent challenge wins
    path_response: Option<u64>,
}

impl<S: Session> ClientConnection<S> {
    /// Construct a connection ready to be started
    pub fn new<C>(
        client_config: ClientConfig,
        config: Arc<TransportConfig>,
        crypto_config: &C,
        now: Instant,
    ) -> Result<Self, ConnectError>
    where
        C: crypto::ClientConfig<S>,
    {
        config.validate()?;
        client_config.validate()?;
        let mut rng = OsRng;
        let init_cid = ConnectionId::random(&mut rng, INITIAL_DCID_LEN);
        let loc_cid = ConnectionId::random(&mut rng, LOC_CID_LEN);

        let mut local_params = TransportParameters::new(&config);
        local_params.custom = client_config.custom_parameters.clone();

        let psk = client_config
            .psk_cache
            .as_ref()
            .and_then(|cache| cache.load(&client_config.server_name));
        let session =
            crypto_config.start_session(&client_config.server_name, &local_params, psk.as_ref())?;
        let early_alpn = psk.as_ref().and_then(|x| x.alpn.clone());

        let paths = PathManager::new(
            &client_config.remotes,
            client_config.happy_eyeballs,
            client_config.cached_family,
        );

        let mut initial_space = PacketSpace::new(now);
        let keys = crypto::KeyPair::initial(&init_cid, crate::Side::Client);
        initial_space.write_keys = Some(keys.write);
        initial_space.read_keys = Some(keys.read);

        let streams = Streams::new(
            config.stream_window_bidi,
            config.stream_window_uni,
            config.receive_window,
            config.stream_receive_window,
        );

        Ok(Self {
            server_name: client_config.server_name,
            psk_cache: client_config.psk_cache,
            handshake: HandshakeDriver::new(session, early_alpn),
            paths,

            init_cid,
            loc_cid,
            rem_cid: init_cid,
            rem_cid_set: false,

            state: State::Handshake,
            app_closed: false,
            connected_emitted: false,

            params: TransportParameters::default(),
            server_params_set: false,

            spaces: [initial_space, PacketSpace::new(now), PacketSpace::new(now)],
            highest_space: SpaceId::Initial,
            zero_rtt_keys: None,

            streams,
            blocked_streams: FnvHashSet::default(),

            congestion: Box::new(NewReno::new(config.congestion())),
            in_flight: InFlight::new(),

            crypto_count: 0,
            rto_count: 0,
            largest_sent_before_rto: 0,
            loss_time: None,
            time_of_last_sent_ack_eliciting_packet: now,
            time_of_last_sent_crypto_packet: now,
            rtt: RttEstimator::new(),
            lost_packets: 0,

            idle_timeout_ms: config.idle_timeout_ms,
            events: VecDeque::new(),
            io: IoQueue::new(),
            ping_pending: false,
            path_response: None,

            config,
        })
    }

    /// Begin the cryptographic handshake
    pub fn start(&mut self, now: Instant) {
        trace!(server = %self.server_name, "starting handshake");
        if let Err(e) = self.handshake.start() {
            self.fail(now, e.into());
            return;
        }
        self.drive_handshake(now);
        if self.paths.needs_delay_timer() {
            self.io
                .timer_start(Timer::HappyEyeballs, now + self.paths.delay());
        }
        self.reset_idle_timeout(now);
    }

    /// Process an incoming UDP datagram
    pub fn handle_dgram(
        &mut self,
        now: Instant,
        socket: SocketId,
        remote: SocketAddr,
        data: BytesMut,
    ) {
        if !self.paths.is_known_remote(socket, remote) {
            trace!(%remote, "discarding packet from unknown address");
            return;
        }
        let mut remaining = Some(data);
        while let Some(data) = remaining {
            match PartialDecode::new(data) {
                Ok((partial_decode, rest)) => {
                    remaining = rest;
                    self.handle_decode(now, socket, partial_decode);
                }
                Err(PacketDecodeError::UnsupportedVersion { .. }) => {
                    debug!("dropping packet with unsupported version");
                    return;
                }
                Err(e) => {
                    trace!(reason = %e, "malformed header");
                    return;
                }
            }
        }
    }

    fn handle_decode(&mut self, now: Instant, socket: SocketId, partial_decode: PartialDecode) {
        if partial_decode.is_0rtt() {
            debug!("dropping unexpected 0-RTT packet");
            return;
        }
        if partial_decode.dst_cid() != self.loc_cid {
            debug!(
                dst_cid = %partial_decode.dst_cid(),
                "dropping packet for foreign connection ID"
            );
            return;
        }
        let header_key = match partial_decode.space() {
            Some(space) => match self.spaces[space as usize].read_keys {
                Some(ref keys) => Some(&keys.header),
                None => {
                    debug!(
                        ?space,
                        len = partial_decode.len(),
                        "discarding packet for space without keys"
                    );
                    return;
                }
            },
            // Unprotected packet (Retry / Version Negotiation)
            None => None,
        };

        match partial_decode.finish(header_key) {
            Ok(packet) => self.handle_packet(now, socket, packet),
            Err(e) => {
                trace!(reason = %e, "unable to complete packet decoding");
            }
        }
    }

    fn handle_packet(&mut self, now: Instant, socket: SocketId, mut packet: Packet) {
        let was_closed = self.state.is_closed();

        let result = match self.decrypt_packet(&mut packet) {
            Err(()) => {
                // Could be a tampered packet or a cleartext alert after our
                // reads rotated to new keys; both drop silently and the
                // connection resolves by timeout rather than a clean close
                debug!("failed to authenticate packet");
                return;
            }
            Ok(number) => {
                if let Some(number) = number {
                    let space = packet.header.space();
                    if self.spaces[space as usize].dedup.insert(number) {
                        debug!(packet = number, "discarding possible duplicate packet");
                        return;
                    }
                    if !self.state.is_closed() {
                        self.on_packet_authenticated(now, socket, space, number);
                    }
                }
                self.handle_connected_inner(now, &packet)
            }
        };

        // State transitions for error cases
        if let Err(conn_err) = result {
            self.events.push_back(Event::ConnectionLost {
                reason: conn_err.clone(),
            });
            self.state = match conn_err {
                ConnectionError::ApplicationClosed { .. }
                | ConnectionError::ConnectionClosed { .. } => State::Draining,
                ConnectionError::TransportError(err) => {
                    debug!(error = %err, "closing connection due to transport error");
                    State::Closed(frame::ConnectionClose::from(err).into())
                }
                ConnectionError::EarlyDataRejected => State::Closed(
                    frame::ConnectionClose::from(TransportError::PROTOCOL_VIOLATION(
                        "0-RTT parameters changed",
                    ))
                    .into(),
                ),
                ConnectionError::VersionMismatch => State::Draining,
                ConnectionError::TimedOut => {
                    unreachable!("timeouts aren't generated by packet processing");
                }
            };
        }

        if !was_closed && self.state.is_closed() {
            self.close_common(now);
        }
        if let State::Closed(_) = self.state {
            self.io.close = true;
        }
    }

    fn handle_connected_inner(
        &mut self,
        now: Instant,
        packet: &Packet,
    ) -> Result<(), ConnectionError> {
        match packet.header {
            Header::Retry { .. } => {
                // TODO: restart the handshake with the server-chosen CID and
                // echo the retry token on the next Initial
                debug!("ignoring Retry packet");
                Ok(())
            }
            Header::VersionNegotiate { .. } => {
                let mut payload = std::io::Cursor::new(&packet.payload[..]);
                if packet.payload.len() % 4 != 0 {
                    return Err(TransportError::PROTOCOL_VIOLATION(
                        "malformed version negotiation",
                    )
                    .into());
                }
                while payload.has_remaining() {
                    let version = payload.get::<u32>().unwrap();
                    if version == crate::VERSION {
                        // Our version is supported, so this packet is spurious
                        return Ok(());
                    }
                }
                debug!("remote doesn't support our version");
                Err(ConnectionError::VersionMismatch)
            }
            Header::Initial {
                src_cid: rem_cid, ..
            }
            | Header::Long {
                ty: LongType::Handshake,
                src_cid: rem_cid,
                ..
            } => {
                if !self.rem_cid_set {
                    trace!(%rem_cid, "switching remote CID");
                    self.rem_cid = rem_cid;
                    self.rem_cid_set = true;
                }
                self.process_payload(now, packet.header.space(), packet.payload.clone().freeze())
            }
            Header::Short { .. } => {
                self.process_payload(now, SpaceId::Data, packet.payload.clone().freeze())
            }
            Header::Long {
                ty: LongType::ZeroRtt,
                ..
            } => {
                // Dropped before decryption; clients never receive 0-RTT
                Ok(())
            }
        }
    }

    /// Dispatch every frame of a decrypted packet payload
    fn process_payload(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        payload: Bytes,
    ) -> Result<(), ConnectionError> {
        let handshake_space = space_id != SpaceId::Data;
        for result in frame::Iter::new(payload) {
            let frame = result.map_err(TransportError::from)?;
            match frame {
                Frame::Padding => {}
                _ => {
                    trace!(ty = %frame.ty(), "got frame");
                }
            }
            match frame {
                Frame::Ack(_) | Frame::Padding => {}
                _ => {
                    self.spaces[space_id as usize].permit_ack_only = true;
                }
            }
            if handshake_space {
                // Initial and Handshake packets carry only handshake plumbing
                match frame {
                    Frame::Padding
                    | Frame::Ping
                    | Frame::Ack(_)
                    | Frame::Crypto(_)
                    | Frame::ConnectionClose(_)
                    | Frame::ApplicationClose(_) => {}
                    _ => {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "illegal frame type in handshake packet",
                        )
                        .into());
                    }
                }
            }
            match frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Crypto(crypto) => {
                    self.read_crypto(now, space_id, crypto)?;
                }
                Frame::Ack(ack) => {
                    self.on_ack_received(now, space_id, ack);
                }
                Frame::ConnectionClose(reason) => {
                    self.events.push_back(Event::ConnectionLost {
                        reason: ConnectionError::ConnectionClosed { reason },
                    });
                    trace!("draining");
                    self.state = State::Draining;
                    return Ok(());
                }
                Frame::ApplicationClose(reason) => {
                    self.events.push_back(Event::ConnectionLost {
                        reason: ConnectionError::ApplicationClosed { reason },
                    });
                    trace!("draining");
                    self.state = State::Draining;
                    return Ok(());
                }
                Frame::Stream(frame) => {
                    self.on_stream_frame(frame)?;
                }
                Frame::ResetStream(frame) => {
                    self.on_reset_stream(frame)?;
                }
                Frame::StopSending { id, error_code } => {
                    self.on_stop_sending(id, error_code)?;
                }
                Frame::MaxData(bytes) => {
                    let was_blocked = self.blocked();
                    self.streams.max_data = cmp::max(bytes, self.streams.max_data);
                    if was_blocked && !self.blocked() {
                        for stream in self.blocked_streams.drain() {
                            self.events.push_back(Event::StreamWritable { stream });
                        }
                    }
                }
                Frame::MaxStreamData { id, offset } => {
                    self.on_max_stream_data(id, offset)?;
                }
                Frame::MaxStreams {
                    directionality,
                    count,
                } => {
                    let current = &mut self.streams.max[directionality as usize];
                    if count > *current {
                        *current = count;
                        self.events
                            .push_back(Event::StreamAvailable { directionality });
                    }
                }
                Frame::DataBlocked { offset } => {
                    debug!(offset, "peer claims to be blocked at connection level");
                }
                Frame::StreamDataBlocked { id, offset } => {
                    if id.initiator() == crate::Side::Client
                        && id.directionality() == Directionality::Uni
                    {
                        return Err(TransportError::STREAM_STATE_ERROR(
                            "STREAM_DATA_BLOCKED on send-only stream",
                        )
                        .into());
                    }
                    debug!(stream = %id, offset, "peer claims to be blocked at stream level");
                }
                Frame::StreamsBlocked {
                    directionality,
                    limit,
                } => {
                    debug!(
                        %directionality,
                        limit, "peer claims to be blocked opening streams"
                    );
                }
                Frame::PathChallenge(token) => {
                    self.path_response = Some(token);
                }
                Frame::PathResponse(token) => {
                    debug!(token, "ignoring unsolicited PATH_RESPONSE");
                }
                Frame::NewToken { .. } => {
                    trace!("got NEW_TOKEN");
                    // TODO: retain for address validation on a future connection
                }
            }
        }
        Ok(())
    }

    /// Feed CRYPTO-frame bytes to the handshake driver and absorb its output
    fn read_crypto(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        crypto: frame::Crypto,
    ) -> Result<(), ConnectionError> {
        let level = match space_id {
            SpaceId::Initial => EncryptionLevel::Initial,
            SpaceId::Handshake => EncryptionLevel::Handshake,
            SpaceId::Data => EncryptionLevel::AppData,
        };
        self.handshake.on_crypto_frame(level, crypto)?;
        self.drive_handshake(now);
        Ok(())
    }

    /// Install freshly derived keys, queue outbound CRYPTO frames, apply the
    /// server's transport parameters, and surface handshake progress
    fn drive_handshake(&mut self, now: Instant) {
        // Key installation is a move-out handoff: the driver's slot empties
        // and the connection owns the cipher from here on
        if let Ok(Some(keys)) = self.handshake.take_handshake_write_keys() {
            trace!("handshake write keys ready");
            self.spaces[SpaceId::Handshake as usize].write_keys = Some(keys);
            if self.highest_space < SpaceId::Handshake {
                self.highest_space = SpaceId::Handshake;
            }
        }
        if let Ok(Some(keys)) = self.handshake.take_handshake_read_keys() {
            trace!("handshake read keys ready");
            self.spaces[SpaceId::Handshake as usize].read_keys = Some(keys);
        }
        if let Ok(Some(keys)) = self.handshake.take_zero_rtt_write_keys() {
            trace!("0-RTT keys ready");
            self.zero_rtt_keys = Some(keys);
        }
        if let Ok(Some(keys)) = self.handshake.take_one_rtt_write_keys() {
            trace!("1-RTT write keys ready");
            self.spaces[SpaceId::Data as usize].write_keys = Some(keys);
            self.highest_space = SpaceId::Data;
        }
        if let Ok(Some(keys)) = self.handshake.take_one_rtt_read_keys() {
            trace!("1-RTT read keys ready");
            self.spaces[SpaceId::Data as usize].read_keys = Some(keys);
        }

        while let Some((level, frame)) = self.handshake.poll_outbound() {
            let space = level.space();
            self.spaces[space as usize].pending.crypto.push_back(frame);
        }

        if !self.server_params_set {
            match self.handshake.server_transport_parameters() {
                Ok(Some(params)) => {
                    if let Err(e) = self.set_params(params) {
                        self.fail(now, e.into());
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.fail(now, e.into());
                    return;
                }
            }
        }

        if let Some(rejected) = self.handshake.take_zero_rtt_rejected() {
            if rejected {
                self.reject_0rtt();
            }
        }

        if self.handshake.phase() >= Phase::OneRttKeysDerived && !self.connected_emitted {
            self.connected_emitted = true;
            self.state = State::Established;
            self.events.push_back(Event::Connected);
        }

        if let Some(ticket) = self.handshake.poll_session_ticket() {
            if let Some(ref cache) = self.psk_cache {
                if self.server_params_set {
                    cache.store(
                        &self.server_name,
                        CachedPsk {
                            ticket: ticket.ticket,
                            alpn: self.handshake.negotiated_alpn(),
                            suite: ticket.suite,
                            transport_parameters: self.params.clone(),
                        },
                    );
                }
            }
        }
    }

    /// Reset 0-RTT state so the application's early data can be retried on 1-RTT
    fn reject_0rtt(&mut self) {
        debug!("0-RTT rejected");
        self.streams.zero_rtt_rejected();
        self.blocked_streams.clear();
        self.zero_rtt_keys = None;
        // Discard queued 0-RTT frames and forget the packets carrying them
        self.spaces[SpaceId::Data as usize].pending = Retransmits::default();
        let sent_packets = mem::replace(
            &mut self.spaces[SpaceId::Data as usize].sent_packets,
            Default::default(),
        );
        let mut freed = 0;
        for (_, packet) in sent_packets {
            self.in_flight.remove(&packet);
            freed += u64::from(packet.size);
        }
        if freed != 0 {
            self.congestion.on_remove_bytes_from_inflight(freed);
        }
        self.events.push_back(Event::ZeroRttRejected);
    }

    fn set_params(&mut self, params: TransportParameters) -> Result<(), TransportError> {
        trace!("applying server transport parameters");
        self.streams.max = [
            u64::from(params.initial_max_bidi_streams),
            u64::from(params.initial_max_uni_streams),
        ];
        self.streams.max_data = u64::from(params.initial_max_data);
        for i in 0..self.streams.max_remote[Directionality::Bi as usize] {
            let id = StreamId::new(crate::Side::Server, Directionality::Bi, i);
            if let Some(ss) = self.streams.get_send_mut(id) {
                ss.max_data = u64::from(params.initial_max_stream_data_bidi_local);
            }
        }
        self.idle_timeout_ms = {
            let peer = u64::from(params.idle_timeout) * 1000;
            if self.config.idle_timeout_ms == 0 || peer == 0 {
                cmp::max(self.config.idle_timeout_ms, peer)
            } else {
                cmp::min(self.config.idle_timeout_ms, peer)
            }
        };
        self.params = params;
        self.server_params_set = true;
        Ok(())
    }

    fn on_stream_frame(&mut self, frame: frame::Stream) -> Result<(), ConnectionError> {
        trace!(stream = %frame.id, offset = frame.offset, len = frame.data.len(), fin = frame.fin, "got STREAM");
        let id = frame.id;
        let data_recvd = self.streams.data_recvd;
        let max_data = self.streams.local_max_data;
        let window = self.streams.stream_receive_window();
        match self.streams.get_recv_stream(id) {
            Err(e) => {
                debug!(stream = %id, "received illegal STREAM frame");
                return Err(e.into());
            }
            Ok(None) => {
                trace!("dropping frame for closed stream");
                return Ok(());
            }
            Ok(Some(rs)) => {
                if rs.is_finished() {
                    trace!("dropping frame for finished stream");
                    return Ok(());
                }
                let new_bytes = rs
                    .ingest(frame, data_recvd, max_data, window)
                    .map_err(TransportError::from)?;
                self.streams.data_recvd += new_bytes;
            }
        }
        self.notify_stream_frame(id, true);
        Ok(())
    }

    fn on_reset_stream(&mut self, frame: frame::ResetStream) -> Result<(), ConnectionError> {
        let frame::ResetStream {
            id,
            error_code,
            final_offset,
        } = frame;
        let (limit, bytes_read, changed) = match self.streams.get_recv_stream(id) {
            Err(e) => {
                debug!("received illegal RESET_STREAM");
                return Err(e.into());
            }
            Ok(None) => {
                trace!("received RESET_STREAM on closed stream");
                return Ok(());
            }
            Ok(Some(rs)) => {
                let limit = rs.limit();
                let bytes_read = rs.bytes_read;
                let changed = rs
                    .on_reset(error_code, final_offset)
                    .map_err(TransportError::from)?;
                (limit, bytes_read, changed)
            }
        };
        if !changed {
            // Duplicate reset with a consistent final size
            return Ok(());
        }

        // The final size is now fixed, so account for bytes the peer will
        // never send and release the stream's unconsumed credit
        if bytes_read != final_offset {
            self.streams.data_recvd += final_offset - limit;
            self.streams.local_max_data += final_offset - bytes_read;
            if self.streams.max_data_due() {
                self.spaces[SpaceId::Data as usize].pending.max_data = true;
            }
        }
        self.notify_stream_frame(id, true);
        Ok(())
    }

    fn on_stop_sending(&mut self, id: StreamId, error_code: u16) -> Result<(), ConnectionError> {
        if id.initiator() != crate::Side::Client && id.directionality() == Directionality::Uni
            || !self.streams.contains(id)
        {
            debug!(stream = %id, "got STOP_SENDING on invalid stream");
            return Err(
                TransportError::STREAM_STATE_ERROR("STOP_SENDING on invalid stream").into(),
            );
        }
        self.reset_inner(id, error_code, Some(error_code));
        let ss = self.streams.get_send_mut(id).unwrap();
        if self.blocked_streams.remove(&id) || ss.offset == ss.max_data {
            self.events.push_back(Event::StreamWritable { stream: id });
        }
        self.notify_stream_frame(id, false);
        Ok(())
    }

    fn on_max_stream_data(&mut self, id: StreamId, offset: u64) -> Result<(), ConnectionError> {
        if id.initiator() != crate::Side::Client && id.directionality() == Directionality::Uni {
            debug!(stream = %id, "got MAX_STREAM_DATA on recv-only stream");
            return Err(
                TransportError::STREAM_STATE_ERROR("MAX_STREAM_DATA on recv-only stream").into(),
            );
        }
        match self.streams.get_send_mut(id) {
            Some(ss) => {
                if offset > ss.max_data {
                    trace!(stream = %id, old = ss.max_data, new = offset, "stream limit increased");
                    if ss.offset == ss.max_data {
                        self.events.push_back(Event::StreamWritable { stream: id });
                    }
                    ss.max_data = offset;
                }
            }
            None => {
                debug!(stream = %id, "got MAX_STREAM_DATA on unopened stream");
                return Err(
                    TransportError::STREAM_STATE_ERROR("MAX_STREAM_DATA on unopened stream").into(),
                );
            }
        }
        self.notify_stream_frame(id, false);
        Ok(())
    }

    /// Notify the application that new streams were opened or a stream became readable
    fn notify_stream_frame(&mut self, id: StreamId, notify_readable: bool) {
        if self.streams.on_remote_frame(id) {
            self.events.push_back(Event::StreamOpened);
        } else if notify_readable {
            self.events.push_back(Event::StreamReadable { stream: id });
        }
    }

    fn on_packet_authenticated(
        &mut self,
        now: Instant,
        socket: SocketId,
        space_id: SpaceId,
        packet: u64,
    ) {
        trace!(?space_id, packet, "packet authenticated");
        self.reset_idle_timeout(now);

        // The first authenticated response settles the Happy Eyeballs race
        if !self.paths.is_chosen() {
            if let Some(loser) = self.paths.on_response(socket) {
                self.io.retired_sockets.push(loser);
            }
            self.io.timer_stop(Timer::HappyEyeballs);
        }

        let space = &mut self.spaces[space_id as usize];
        space.pending_acks.insert_one(packet);
        if space.pending_acks.len() > MAX_ACK_BLOCKS {
            space.pending_acks.pop_min();
        }
        if packet >= space.rx_packet {
            space.rx_packet = packet;
            space.rx_packet_time = now;
        }
    }

    fn decrypt_packet(&mut self, packet: &mut Packet) -> Result<Option<u64>, ()> {
        let number = match packet.header.number() {
            Some(x) => x,
            // Unprotected packets carry no number
            None => return Ok(None),
        };
        let space_id = packet.header.space();
        let space = &mut self.spaces[space_id as usize];
        let number = number.expand(space.rx_packet + 1);
        let keys = space.read_keys.as_ref().ok_or(())?;
        keys.packet
            .decrypt(number, &packet.header_data, &mut packet.payload)
            .map_err(|()| {
                trace!(packet = number, "decryption failed");
            })?;

        if packet.header.is_short() {
            // 1-RTT protected data proves the server installed our keys
            self.handshake.on_one_rtt_protected_data();
        }
        Ok(Some(number))
    }

    fn on_ack_received(&mut self, now: Instant, space_id: SpaceId, ack: frame::Ack) {
        trace!(largest = ack.largest, "handling ACK");
        let was_blocked = self.blocked();
        let max_ack_delay = self.max_ack_delay();
        let space = &mut self.spaces[space_id as usize];
        space.largest_acked_packet = cmp::max(ack.largest, space.largest_acked_packet);

        if let Some(info) = space.sent_packets.get(&ack.largest) {
            if info.ack_eliciting {
                let delay = Duration::from_micros(ack.delay << self.params.ack_delay_exponent);
                let rtt = now - info.time_sent;
                self.rtt.update(cmp::min(delay, max_ack_delay), rtt);
            }
        }

        // Filter out just the newly acked packets
        let newly_acked = ack
            .iter()
            .flat_map(|range| {
                self.spaces[space_id as usize]
                    .sent_packets
                    .range(range)
                    .map(|(&n, _)| n)
            })
            .collect::<Vec<_>>();
        if newly_acked.is_empty() {
            return;
        }

        let mut acked_bytes = 0;
        for &packet in &newly_acked {
            if let Some(info) = self.spaces[space_id as usize].sent_packets.remove(&packet) {
                acked_bytes += u64::from(info.size);
                self.in_flight.remove(&info);
                self.on_frames_acked(space_id, info);
            }
        }

        // An ack covering post-RTO sends proves the timeout was genuine
        let rto_verified = self.rto_count > 0 && ack.largest > self.largest_sent_before_rto;
        if rto_verified {
            self.rto_count = 0;
        }

        self.crypto_count = 0;
        let loss = self.detect_lost_packets(now, space_id);
        if rto_verified {
            self.congestion.on_rto_verified();
        }
        self.congestion.on_packet_ack_or_loss(
            Some(&AckEvent {
                acked_bytes,
                largest_acked_packet: ack.largest,
            }),
            loss.as_ref(),
        );

        self.set_loss_detection_timer();
        if was_blocked && !self.blocked() {
            for stream in self.blocked_streams.drain() {
                self.events.push_back(Event::StreamWritable { stream });
            }
        }
    }

    /// Update stream state for confirmed delivery of a packet's frames
    fn on_frames_acked(&mut self, space_id: SpaceId, info: SentPacket) {
        for (id, _) in info.retransmits.rst_stream {
            if let Some(ss) = self.streams.get_send_mut(id) {
                if let stream::SendState::ResetSent { stop_reason } = ss.state {
                    ss.state = stream::SendState::ResetRecvd { stop_reason };
                    if stop_reason.is_none() {
                        self.streams.maybe_cleanup(id);
                    }
                }
            }
        }
        for frame in info.retransmits.stream {
            let ss = match self.streams.get_send_mut(frame.id) {
                Some(x) => x,
                None => continue,
            };
            ss.bytes_in_flight -= frame.data.len() as u64;
            if ss.state == stream::SendState::DataSent && ss.bytes_in_flight == 0 {
                ss.state = stream::SendState::DataRecvd;
                self.streams.maybe_cleanup(frame.id);
                self.events
                    .push_back(Event::StreamFinished { stream: frame.id });
            }
        }
        self.spaces[space_id as usize]
            .pending_acks
            .subtract(&info.acks);
    }

    /// Declare packets lost by packet and time thresholds; requeue their frames
    fn detect_lost_packets(&mut self, now: Instant, space_id: SpaceId) -> Option<LossEvent> {
        self.loss_time = None;
        let mut rtt = self.rtt.latest;
        if let Some(smoothed) = self.rtt.smoothed {
            rtt = cmp::max(rtt, smoothed);
        }
        let loss_delay = rtt + ((rtt * u32::from(self.config.time_threshold)) / 65536);
        let lost_send_time = now.checked_sub(loss_delay);

        let space = &mut self.spaces[space_id as usize];
        let largest_acked = space.largest_acked_packet;
        let lost_pn = largest_acked.saturating_sub(u64::from(self.config.packet_threshold));

        let mut lost_packets = Vec::new();
        for (&packet, info) in space.sent_packets.range(0..largest_acked) {
            if lost_send_time.map_or(false, |t| info.time_sent <= t) || packet <= lost_pn {
                lost_packets.push(packet);
            } else {
                let next_loss_time = info.time_sent + loss_delay;
                self.loss_time = Some(
                    self.loss_time
                        .map_or(next_loss_time, |x| cmp::min(x, next_loss_time)),
                );
            }
        }
        if lost_packets.is_empty() {
            return None;
        }

        let largest_lost = *lost_packets.last().unwrap();
        let largest_sent = space.next_packet_number.saturating_sub(1);
        self.lost_packets += lost_packets.len() as u64;
        trace!(?lost_packets, "packets lost");
        let mut lost_bytes = 0;
        for packet in &lost_packets {
            let info = self.spaces[space_id as usize]
                .sent_packets
                .remove(packet)
                .unwrap();
            lost_bytes += u64::from(info.size);
            self.in_flight.remove(&info);
            self.spaces[space_id as usize].pending += info.retransmits;
        }
        // Lost ack-only packets carry no congestion penalty
        if lost_bytes == 0 {
            return None;
        }
        Some(LossEvent {
            lost_bytes,
            largest_lost_packet: largest_lost,
            largest_sent,
        })
    }

    fn set_loss_detection_timer(&mut self) {
        if self.in_flight.crypto != 0 || self.state.is_handshake() {
            // Handshake retransmission alarm
            let timeout = match self.rtt.smoothed {
                Some(smoothed) => 2 * smoothed,
                None => 2 * Duration::from_micros(self.config.initial_rtt_us),
            };
            let timeout = cmp::max(timeout, TIMER_GRANULARITY)
                * 2u32.pow(cmp::min(self.crypto_count, MAX_BACKOFF_EXPONENT));
            self.io.timer_start(
                Timer::LossDetection,
                self.time_of_last_sent_crypto_packet + timeout,
            );
            return;
        }

        if self.in_flight.ack_eliciting == 0 {
            self.io.timer_stop(Timer::LossDetection);
            return;
        }

        if let Some(loss_time) = self.loss_time {
            // Time-threshold loss detection
            self.io.timer_start(Timer::LossDetection, loss_time);
            return;
        }

        // RTO
        let timeout = self.rto() * 2u32.pow(cmp::min(self.rto_count, MAX_BACKOFF_EXPONENT));
        self.io.timer_start(
            Timer::LossDetection,
            self.time_of_last_sent_ack_eliciting_packet + timeout,
        );
    }

    fn on_loss_detection_timeout(&mut self, now: Instant) {
        if self.in_flight.crypto != 0 {
            trace!("retransmitting handshake packets");
            for &space_id in &[SpaceId::Initial, SpaceId::Handshake] {
                if self.spaces[space_id as usize].write_keys.is_none() {
                    continue;
                }
                let sent_packets = mem::replace(
                    &mut self.spaces[space_id as usize].sent_packets,
                    Default::default(),
                );
                self.lost_packets += sent_packets.len() as u64;
                let mut freed = 0;
                for (_, packet) in sent_packets {
                    freed += u64::from(packet.size);
                    self.in_flight.remove(&packet);
                    self.spaces[space_id as usize].pending += packet.retransmits;
                }
                if freed != 0 {
                    self.congestion.on_remove_bytes_from_inflight(freed);
                }
            }
            self.crypto_count = self.crypto_count.saturating_add(1);
        } else if self.state.is_handshake() {
            trace!("sending anti-deadlock handshake packet");
            self.io.probes += 1;
            self.crypto_count = self.crypto_count.saturating_add(1);
        } else if self.loss_time.is_some() {
            // Time-threshold loss detection
            let loss = self.detect_lost_packets(now, SpaceId::Data);
            if let Some(loss) = loss {
                self.congestion.on_packet_ack_or_loss(None, Some(&loss));
            }
        } else {
            trace!(in_flight = self.congestion.bytes_in_flight(), "RTO fired");
            self.io.probes += 2;
            self.largest_sent_before_rto = self.spaces[SpaceId::Data as usize]
                .next_packet_number
                .saturating_sub(1);
            self.rto_count = self.rto_count.saturating_add(1);
        }
        self.set_loss_detection_timer();
    }

    /// Retransmission timeout
    fn rto(&self) -> Duration {
        let rtt = self
            .rtt
            .smoothed
            .unwrap_or_else(|| Duration::from_micros(self.config.initial_rtt_us));
        let computed = rtt + 4 * self.rtt.var + self.max_ack_delay();
        cmp::max(computed, TIMER_GRANULARITY)
    }

    fn max_ack_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.params.max_ack_delay))
    }

    /// Handle a timer expiring
    pub fn timeout(&mut self, now: Instant, timer: Timer) {
        match timer {
            Timer::Close => {
                self.state = State::Drained;
            }
            Timer::Idle => {
                self.close_common(now);
                self.io.timer_stop(Timer::Close);
                self.events.push_back(Event::ConnectionLost {
                    reason: ConnectionError::TimedOut,
                });
                self.state = State::Drained;
            }
            Timer::LossDetection => {
                self.on_loss_detection_timeout(now);
            }
            Timer::HappyEyeballs => {
                self.paths.on_delay_expired();
            }
        }
    }

    fn reset_idle_timeout(&mut self, now: Instant) {
        if self.idle_timeout_ms == 0 {
            return;
        }
        if self.state.is_closed() {
            self.io.timer_stop(Timer::Idle);
            return;
        }
        self.io
            .timer_start(Timer::Idle, now + Duration::from_millis(self.idle_timeout_ms));
    }

    /// Close a connection immediately
    ///
    /// This does not ensure delivery of outstanding data. It is the
    /// application's responsibility to call this only when all important
    /// communications have been completed.
    pub fn close(&mut self, now: Instant, error_code: u16, reason: Bytes) {
        let was_closed = self.state.is_closed();
        if !was_closed {
            self.close_common(now);
            self.io.close = true;
        }
        self.app_closed = true;
        match self.state {
            State::Handshake | State::Established => {
                self.state = State::Closed(CloseReason::Application(ApplicationClose {
                    error_code,
                    reason,
                }));
            }
            _ => {}
        }
    }

    /// Every error funnels through here exactly once
    fn fail(&mut self, now: Instant, reason: ConnectionError) {
        if self.state.is_closed() {
            return;
        }
        self.events.push_back(Event::ConnectionLost {
            reason: reason.clone(),
        });
        self.state = match reason {
            ConnectionError::TransportError(err) => {
                State::Closed(frame::ConnectionClose::from(err).into())
            }
            ConnectionError::EarlyDataRejected => State::Closed(
                frame::ConnectionClose::from(TransportError::PROTOCOL_VIOLATION(
                    "0-RTT parameters changed",
                ))
                .into(),
            ),
            _ => State::Draining,
        };
        self.close_common(now);
        self.io.close = matches!(self.state, State::Closed(_));
    }

    fn close_common(&mut self, now: Instant) {
        trace!("connection closed");
        self.io.timer_stop(Timer::LossDetection);
        self.io.timer_stop(Timer::Idle);
        self.io.timer_stop(Timer::HappyEyeballs);
        self.io.timer_start(Timer::Close, now + 3 * self.rto());
    }

    /// Returns application-facing events
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Returns I/O actions to execute immediately
    pub fn poll_io(&mut self) -> Option<Io> {
        for (&timer, update) in Timer::VALUES.iter().zip(self.io.timers.iter_mut()) {
            if let Some(update) = update.take() {
                return Some(Io::TimerUpdate(TimerUpdate { timer, update }));
            }
        }
        if let Some(socket) = self.io.retired_sockets.pop() {
            return Some(Io::RetireSocket { socket });
        }
        None
    }

    /// Returns the next datagram to transmit
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        // A duplicated datagram owed to the racing socket goes out first
        if let Some(transmit) = self.io.dup_transmit.take() {
            return Some(transmit);
        }

        let (space_id, close) = match self.state {
            State::Draining | State::Drained => {
                return None;
            }
            State::Closed(_) => {
                if mem::replace(&mut self.io.close, false) {
                    (self.highest_space, true)
                } else {
                    return None;
                }
            }
            _ => {
                let id = SpaceId::VALUES
                    .iter()
                    .find(|&&x| {
                        self.spaces[x as usize].write_keys.is_some()
                            && self.spaces[x as usize].can_send()
                    })
                    .cloned()
                    .or_else(|| {
                        if self.spaces[SpaceId::Data as usize].write_keys.is_some()
                            && self.can_send_1rtt()
                        {
                            Some(SpaceId::Data)
                        } else if self.io.probes != 0 {
                            Some(self.highest_space)
                        } else if self.zero_rtt_keys.is_some()
                            && self.spaces[SpaceId::Data as usize].can_send()
                        {
                            Some(SpaceId::Data)
                        } else {
                            None
                        }
                    })?;
                (id, false)
            }
        };

        let probe = !close && self.io.probes != 0;
        let mut ack_only = self.spaces[space_id as usize].pending.is_empty();
        if space_id == SpaceId::Data {
            ack_only &= self.path_response.is_none() && !self.ping_pending;
            if !probe && !ack_only && self.congestion_blocked() {
                trace!("blocked by congestion control");
                return None;
            }
        }

        //
        // From here on, a packet will definitely be sent
        //

        self.io.probes = self.io.probes.saturating_sub(1);
        if self.spaces[SpaceId::Initial as usize].write_keys.is_some()
            && space_id == SpaceId::Handshake
        {
            // A client stops both sending and processing Initial packets when
            // it sends its first Handshake packet
            self.discard_space(SpaceId::Initial);
        }

        let space = &mut self.spaces[space_id as usize];
        let exact_number = space.get_tx_number();
        trace!(?space_id, number = exact_number, "sending packet");
        let number = PacketNumber::new(exact_number, space.largest_acked_packet);
        let is_0rtt = space_id == SpaceId::Data && space.write_keys.is_none();
        let header = match space_id {
            SpaceId::Data if !is_0rtt => Header::Short {
                dst_cid: self.rem_cid,
                key_phase: false,
                number,
            },
            SpaceId::Data => Header::Long {
                ty: LongType::ZeroRtt,
                src_cid: self.loc_cid,
                dst_cid: self.rem_cid,
                number,
            },
            SpaceId::Handshake => Header::Long {
                ty: LongType::Handshake,
                src_cid: self.loc_cid,
                dst_cid: self.rem_cid,
                number,
            },
            SpaceId::Initial => Header::Initial {
                src_cid: self.loc_cid,
                dst_cid: self.rem_cid,
                token: Bytes::new(),
                number,
            },
        };
        let mut buf = Vec::new();
        let partial_encode = header.encode(&mut buf);
        let header_len = buf.len();

        if probe && ack_only && !self.state.is_handshake() {
            // Nothing ack-eliciting to send, so make something up
            self.ping_pending = true;
            ack_only = false;
        }

        let (sent, acks) = if close {
            trace!("sending CONNECTION_CLOSE");
            let tag_len = self.write_keys(space_id).packet.tag_len();
            let max_len = self.config.udp_send_packet_len as usize - header_len - tag_len;
            match self.state {
                State::Closed(CloseReason::Application(ref x)) => x.encode(&mut buf, max_len),
                State::Closed(CloseReason::Connection(ref x)) => x.encode(&mut buf, max_len),
                _ => unreachable!("tried to make a close packet when the connection wasn't closed"),
            }
            (Retransmits::default(), RangeSet::new())
        } else {
            self.populate_packet(now, space_id, &mut buf)
        };

        let keys = if self.spaces[space_id as usize].write_keys.is_some() {
            self.spaces[space_id as usize].write_keys.as_ref().unwrap()
        } else {
            debug_assert!(is_0rtt);
            self.zero_rtt_keys.as_ref().unwrap()
        };

        let mut padded = false;
        if space_id == SpaceId::Initial {
            // Initial packets MUST be padded to the minimum datagram size
            buf.resize(MIN_INITIAL_SIZE - keys.packet.tag_len(), 0);
            padded = true;
        }

        // Packets must be long enough past the packet number for the header
        // protection sample
        let pn_len = number.len();
        let protected_payload_len = (buf.len() + keys.packet.tag_len()) - header_len;
        if let Some(padding_minus_one) =
            (keys.header.sample_size() + 3).checked_sub(pn_len + protected_payload_len)
        {
            let padding = padding_minus_one + 1;
            padded = true;
            trace!(count = padding, "PADDING");
            buf.resize(buf.len() + padding, 0);
        }

        buf.resize(buf.len() + keys.packet.tag_len(), 0);
        partial_encode.finish(&mut buf, &keys.header, Some((exact_number, &keys.packet)));

        if !close {
            let space = &mut self.spaces[space_id as usize];
            // Acks just sent needn't be immediately re-sent
            space.permit_ack_only &= acks.is_empty();
            let size = if padded || !ack_only {
                buf.len() as u16
            } else {
                0
            };
            let packet = SentPacket {
                time_sent: now,
                size,
                ack_eliciting: !ack_only,
                is_crypto_packet: space_id != SpaceId::Data && !sent.crypto.is_empty(),
                acks,
                retransmits: sent,
            };
            self.on_packet_sent(now, space_id, exact_number, packet);
        }

        let (socket, destination) = self.paths.current();
        trace!(len = buf.len(), %destination, "sending datagram");

        // While the Happy Eyeballs race is undecided, duplicate handshake
        // datagrams onto the second socket
        if let Some((dup_socket, dup_remote)) = self.paths.duplicate_target() {
            self.io.dup_transmit = Some(Transmit {
                socket: dup_socket,
                destination: dup_remote,
                contents: buf.clone(),
            });
        }

        Some(Transmit {
            socket,
            destination,
            contents: buf,
        })
    }

    fn write_keys(&self, space_id: SpaceId) -> &Keys {
        self.spaces[space_id as usize]
            .write_keys
            .as_ref()
            .unwrap_or_else(|| self.zero_rtt_keys.as_ref().unwrap())
    }

    fn populate_packet(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        buf: &mut Vec<u8>,
    ) -> (Retransmits, RangeSet) {
        use crate::coding::BufMutExt;

        let space = &mut self.spaces[space_id as usize];
        let mut sent = Retransmits::default();
        let is_0rtt = space_id == SpaceId::Data && space.write_keys.is_none();
        let tag_len = match space.write_keys {
            Some(ref keys) => keys.packet.tag_len(),
            None => self.zero_rtt_keys.as_ref().unwrap().packet.tag_len(),
        };
        let max_size = self.config.udp_send_packet_len as usize - tag_len;

        // PING
        if space_id == SpaceId::Data && mem::replace(&mut self.ping_pending, false) {
            trace!("PING");
            buf.write(frame::FrameType::PING);
        }

        // ACK; 0-RTT packets must never carry acks
        let acks = if !space.pending_acks.is_empty() && !is_0rtt {
            let delay = micros_from(now - space.rx_packet_time) >> ACK_DELAY_EXPONENT;
            trace!("ACK");
            frame::Ack::encode(delay, &space.pending_acks, None, buf);
            space.pending_acks.clone()
        } else {
            RangeSet::new()
        };

        // PATH_RESPONSE
        if buf.len() + 9 < max_size && space_id == SpaceId::Data && !is_0rtt {
            if let Some(token) = self.path_response.take() {
                trace!(token, "PATH_RESPONSE");
                buf.write(frame::FrameType::PATH_RESPONSE);
                buf.write(token);
            }
        }

        // CRYPTO
        while buf.len() + frame::Crypto::SIZE_BOUND < max_size {
            let mut frame = match space.pending.crypto.pop_front() {
                Some(x) => x,
                None => break,
            };
            let len = cmp::min(
                frame.data.len(),
                max_size - buf.len() - frame::Crypto::SIZE_BOUND,
            );
            let data = frame.data.split_to(len);
            let truncated = frame::Crypto {
                offset: frame.offset,
                data,
            };
            trace!(
                offset = truncated.offset,
                len = truncated.data.len(),
                "CRYPTO"
            );
            truncated.encode(buf);
            sent.crypto.push_back(truncated);
            if !frame.data.is_empty() {
                frame.offset += len as u64;
                space.pending.crypto.push_front(frame);
            }
        }

        // Frame types forbidden in 0-RTT packets are deferred until the
        // handshake completes
        if !is_0rtt {
            // RESET_STREAM
            while buf.len() + frame::ResetStream::SIZE_BOUND < max_size {
                let (id, error_code) = match space.pending.rst_stream.pop() {
                    Some(x) => x,
                    None => break,
                };
                let final_offset = match self.streams.get_send(id) {
                    Some(ss) => ss.offset,
                    None => continue,
                };
                trace!(stream = %id, "RESET_STREAM");
                sent.rst_stream.push((id, error_code));
                frame::ResetStream {
                    id,
                    error_code,
                    final_offset,
                }
                .encode(buf);
            }

            // STOP_SENDING
            while buf.len() + 11 < max_size {
                let (id, error_code) = match space.pending.stop_sending.pop() {
                    Some(x) => x,
                    None => break,
                };
                match self.streams.get_recv(id) {
                    Some(rs) if !rs.is_finished() => {}
                    _ => continue,
                }
                trace!(stream = %id, "STOP_SENDING");
                sent.stop_sending.push((id, error_code));
                buf.write(frame::FrameType::STOP_SENDING);
                buf.write(id);
                buf.write::<u16>(error_code);
            }

            // MAX_DATA
            if space.pending.max_data && buf.len() + 9 < max_size {
                trace!(value = self.streams.local_max_data, "MAX_DATA");
                space.pending.max_data = false;
                sent.max_data = true;
                buf.write(frame::FrameType::MAX_DATA);
                buf.write_var(self.streams.local_max_data);
            }

            // MAX_STREAM_DATA
            while buf.len() + 17 < max_size {
                let id = match space.pending.max_stream_data.iter().next() {
                    Some(x) => *x,
                    None => break,
                };
                space.pending.max_stream_data.remove(&id);
                let max = match self.streams.max_stream_data_value(id) {
                    Some(x) => x,
                    None => continue,
                };
                sent.max_stream_data.insert(id);
                trace!(stream = %id, max, "MAX_STREAM_DATA");
                buf.write(frame::FrameType::MAX_STREAM_DATA);
                buf.write(id);
                buf.write_var(max);
            }

            // MAX_STREAMS
            if space.pending.max_bi_stream_id && buf.len() + 9 < max_size {
                space.pending.max_bi_stream_id = false;
                sent.max_bi_stream_id = true;
                trace!(
                    value = self.streams.max_remote[Directionality::Bi as usize],
                    "MAX_STREAMS (bidirectional)"
                );
                buf.write(frame::FrameType::MAX_STREAMS_BIDI);
                buf.write_var(self.streams.max_remote[Directionality::Bi as usize]);
            }
            if space.pending.max_uni_stream_id && buf.len() + 9 < max_size {
                space.pending.max_uni_stream_id = false;
                sent.max_uni_stream_id = true;
                trace!(
                    value = self.streams.max_remote[Directionality::Uni as usize],
                    "MAX_STREAMS (unidirectional)"
                );
                buf.write(frame::FrameType::MAX_STREAMS_UNI);
                buf.write_var(self.streams.max_remote[Directionality::Uni as usize]);
            }
        }

        // STREAM
        while buf.len() + frame::Stream::SIZE_BOUND < max_size {
            let mut stream = match space.pending.stream.pop_front() {
                Some(x) => x,
                None => break,
            };
            if self
                .streams
                .get_send(stream.id)
                .map_or(true, |s| s.state.was_reset())
            {
                continue;
            }
            let len = cmp::min(
                stream.data.len(),
                max_size - buf.len() - frame::Stream::SIZE_BOUND,
            );
            let data = stream.data.split_to(len);
            let fin = stream.fin && stream.data.is_empty();
            trace!(id = %stream.id, offset = stream.offset, len, fin, "STREAM");
            let frame = frame::Stream {
                id: stream.id,
                offset: stream.offset,
                fin,
                data,
            };
            frame.encode(true, buf);
            sent.stream.push_back(frame);
            if !stream.data.is_empty() {
                stream.offset += len as u64;
                space.pending.stream.push_front(stream);
            }
        }

        (sent, acks)
    }

    fn on_packet_sent(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        packet_number: u64,
        packet: SentPacket,
    ) {
        let size = packet.size;
        let ack_eliciting = packet.ack_eliciting;
        let is_crypto_packet = packet.is_crypto_packet;

        self.in_flight.insert(&packet);
        self.spaces[space_id as usize]
            .sent_packets
            .insert(packet_number, packet);
        if size != 0 {
            self.congestion.on_packet_sent(u64::from(size));
            if ack_eliciting {
                self.time_of_last_sent_ack_eliciting_packet = now;
            }
            if is_crypto_packet {
                self.time_of_last_sent_crypto_packet = now;
            }
            self.set_loss_detection_timer();
        }
    }

    fn discard_space(&mut self, space_id: SpaceId) {
        trace!(?space_id, "discarding space");
        let space = &mut self.spaces[space_id as usize];
        space.write_keys = None;
        space.read_keys = None;
        let sent_packets = mem::replace(&mut space.sent_packets, Default::default());
        let mut freed = 0;
        for (_, packet) in sent_packets {
            freed += u64::from(packet.size);
            self.in_flight.remove(&packet);
        }
        if freed != 0 {
            self.congestion.on_remove_bytes_from_inflight(freed);
        }
    }

    fn congestion_blocked(&self) -> bool {
        self.congestion.writable_bytes() < self.config.udp_send_packet_len
    }

    fn blocked(&self) -> bool {
        self.streams.conn_blocked() || self.congestion_blocked()
    }

    /// Whether we have non-retransmittable 1-RTT data to send
    fn can_send_1rtt(&self) -> bool {
        self.ping_pending || self.path_response.is_some()
    }

    //
    // Stream operations
    //

    /// Open a stream for transmission, if the peer's limits allow
    pub fn open(&mut self, direction: Directionality) -> Option<StreamId> {
        let max_stream_data = match direction {
            Directionality::Uni => self.params.initial_max_stream_data_uni,
            Directionality::Bi => self.params.initial_max_stream_data_bidi_remote,
        };
        self.streams.open(direction, u64::from(max_stream_data))
    }

    /// Accept a stream the peer has opened
    pub fn accept(&mut self) -> Option<StreamId> {
        let id = self.streams.accept()?;
        self.streams.alloc_remote_stream(id.directionality());
        let space = &mut self.spaces[SpaceId::Data as usize];
        match id.directionality() {
            Directionality::Bi => space.pending.max_bi_stream_id = true,
            Directionality::Uni => space.pending.max_uni_stream_id = true,
        }
        Some(id)
    }

    /// Write application data to a stream
    pub fn write(&mut self, id: StreamId, data: &[u8]) -> Result<usize, WriteError> {
        assert!(
            id.directionality() == Directionality::Bi || id.initiator() == crate::Side::Client
        );
        if self.state.is_closed() {
            trace!(stream = %id, "write blocked; connection draining");
            return Err(WriteError::Blocked);
        }
        if self.blocked() {
            trace!(stream = %id, "write blocked at connection level");
            self.blocked_streams.insert(id);
            return Err(WriteError::Blocked);
        }

        let budget_res = self
            .streams
            .get_send_mut(id)
            .ok_or(WriteError::UnknownStream)?
            .write_budget();
        let stream_budget = match budget_res {
            Ok(budget) => budget,
            Err(e @ WriteError::Stopped { .. }) => {
                self.streams.maybe_cleanup(id);
                return Err(e);
            }
            Err(e) => {
                trace!(stream = %id, "write blocked by stream flow control");
                return Err(e);
            }
        };

        let conn_budget = self.streams.conn_send_budget();
        let n = conn_budget.min(stream_budget).min(data.len() as u64) as usize;
        self.queue_stream_data(id, Bytes::copy_from_slice(&data[0..n]));
        trace!(stream = %id, len = n, "wrote data");
        Ok(n)
    }

    fn queue_stream_data(&mut self, id: StreamId, data: Bytes) {
        let ss = self.streams.get_send_mut(id).unwrap();
        assert_eq!(ss.state, stream::SendState::Ready);
        let offset = ss.offset;
        ss.offset += data.len() as u64;
        ss.bytes_in_flight += data.len() as u64;
        self.streams.data_sent += data.len() as u64;
        self.spaces[SpaceId::Data as usize]
            .pending
            .stream
            .push_back(frame::Stream {
                offset,
                fin: false,
                data,
                id,
            });
    }

    /// Read data received on a stream, in order
    pub fn read(&mut self, id: StreamId, buf: &mut [u8]) -> Result<usize, ReadError> {
        let (len, more) = self.streams.read(id, buf)?;
        // Issue fresh flow control credit once enough has been consumed
        let space = &mut self.spaces[SpaceId::Data as usize];
        if self.streams.max_data_due() {
            space.pending.max_data = true;
        }
        if more && self.streams.max_stream_data_due(id) {
            space.pending.max_stream_data.insert(id);
        }
        Ok(len)
    }

    /// Signal that no further data will be written to `id`
    pub fn finish(&mut self, id: StreamId) -> Result<(), FinishError> {
        let ss = self
            .streams
            .get_send_mut(id)
            .ok_or(FinishError::UnknownStream)?;
        ss.finish()?;
        let offset = ss.offset;
        self.spaces[SpaceId::Data as usize].finish_stream(id, offset);
        Ok(())
    }

    /// Abandon transmission on a stream
    ///
    /// Queued data is dropped and a RESET_STREAM carrying `error_code` and
    /// the stream's final offset is sent. Repeating the call is a no-op.
    pub fn reset(&mut self, id: StreamId, error_code: u16) {
        assert!(
            id.directionality() == Directionality::Bi || id.initiator() == crate::Side::Client,
            "only streams supporting outgoing data may be reset"
        );
        self.reset_inner(id, error_code, None);
    }

    fn reset_inner(&mut self, id: StreamId, error_code: u16, stop_reason: Option<u16>) {
        // Idempotent: a no-op on an already reset or closed stream
        let stream = match self.streams.get_send_mut(id) {
            Some(x) => x,
            None => return,
        };
        match stream.state {
            stream::SendState::DataRecvd
            | stream::SendState::ResetSent { .. }
            | stream::SendState::ResetRecvd { .. } => {
                return;
            }
            _ => {}
        }
        stream.state = stream::SendState::ResetSent { stop_reason };

        let space = &mut self.spaces[SpaceId::Data as usize];
        // Drop pending outbound data
        space.pending.stream.retain(|frame| frame.id != id);
        space.pending.rst_stream.push((id, error_code));
    }

    /// Ask the peer to stop transmitting on a stream
    pub fn stop_sending(&mut self, id: StreamId, error_code: u16) {
        assert!(
            id.directionality() == Directionality::Bi || id.initiator() != crate::Side::Client,
            "only streams supporting incoming data may be stopped"
        );
        let stream = self
            .streams
            .get_recv(id)
            .expect("stream must be open to be stopped");
        // Only bother if there's data we haven't received yet
        if !stream.is_finished() {
            self.spaces[SpaceId::Data as usize]
                .pending
                .stop_sending
                .push((id, error_code));
        }
    }

    /// Ping the remote endpoint, e.g. to keep the connection alive
    pub fn ping(&mut self) {
        self.ping_pending = true;
    }

    //
    // Queries
    //

    /// Current phase of the handshake
    pub fn phase(&self) -> Phase {
        self.handshake.phase()
    }

    /// Whether the TLS session was resumed from a cached PSK
    pub fn is_tls_resumed(&self) -> bool {
        self.handshake.is_tls_resumed()
    }

    /// Whether application data can be protected for transmission yet
    pub fn has_write_cipher(&self) -> bool {
        self.spaces[SpaceId::Data as usize].write_keys.is_some() || self.zero_rtt_keys.is_some()
    }

    /// The application protocol in effect, preferring the early-data value
    /// while early data is in flight
    pub fn application_protocol(&self) -> Option<&[u8]> {
        self.handshake.application_protocol()
    }

    /// Whether the connection is in a terminal state
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Whether no further traffic will be exchanged and state may be dropped
    pub fn is_drained(&self) -> bool {
        matches!(self.state, State::Drained)
    }

    /// The number of bytes of outstanding packets
    pub fn bytes_in_flight(&self) -> u64 {
        self.congestion.bytes_in_flight()
    }

    /// Total number of outgoing packets deemed lost so far
    pub fn lost_packets(&self) -> u64 {
        self.lost_packets
    }

    /// The address the connection is currently talking to
    pub fn remote(&self) -> SocketAddr {
        self.paths.current().1
    }

    /// The connection ID incoming packets must be addressed to
    ///
    /// The embedder routes datagrams to this connection by matching it.
    pub fn local_cid(&self) -> ConnectionId {
        self.loc_cid
    }
}

/// Lifecycle of the connection as a whole
enum State {
    Handshake,
    Established,
    Closed(CloseReason),
    /// Waiting out the drain period after a peer-initiated close
    Draining,
    /// All done; resources may be reclaimed
    Drained,
}

impl State {
    fn is_handshake(&self) -> bool {
        matches!(*self, State::Handshake)
    }

    fn is_closed(&self) -> bool {
        matches!(*self, State::Closed(_) | State::Draining | State::Drained)
    }
}

enum CloseReason {
    Connection(ConnectionClose),
    Application(ApplicationClose),
}

impl From<ConnectionClose> for CloseReason {
    fn from(x: ConnectionClose) -> Self {
        CloseReason::Connection(x)
    }
}

/// Reasons why a connection might be lost
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// The peer violated the QUIC specification as understood by this implementation
    #[error(transparent)]
    TransportError(TransportError),
    /// The peer's QUIC stack aborted the connection automatically
    #[error("aborted by peer: {reason}")]
    ConnectionClosed {
        /// The reason the peer gave
        reason: ConnectionClose,
    },
    /// The peer closed the connection
    #[error("closed by peer: {reason}")]
    ApplicationClosed {
        /// The reason the peer's application gave
        reason: ApplicationClose,
    },
    /// The peer is unable to continue processing this connection's version
    #[error("peer doesn't implement any supported version")]
    VersionMismatch,
    /// The peer has become unreachable
    #[error("timed out")]
    TimedOut,
    /// Early data was rejected and the parameters it assumed have changed
    #[error("early data rejected by server")]
    EarlyDataRejected,
}

impl From<TransportError> for ConnectionError {
    fn from(x: TransportError) -> Self {
        ConnectionError::TransportError(x)
    }
}

impl From<HandshakeError> for ConnectionError {
    fn from(x: HandshakeError) -> Self {
        match x {
            HandshakeError::EarlyDataRejected => ConnectionError::EarlyDataRejected,
            HandshakeError::Transport(e) => ConnectionError::TransportError(e),
        }
    }
}

/// Events of interest to the application
#[derive(Debug)]
pub enum Event {
    /// The handshake completed; 1-RTT data may now be sent
    Connected,
    /// The connection was lost, once and terminally
    ConnectionLost {
        /// Why the connection ended
        reason: ConnectionError,
    },
    /// The peer opened one or more streams; fetch them with `accept`
    StreamOpened,
    /// A stream has data or an error waiting to be read
    StreamReadable {
        /// Which stream
        stream: StreamId,
    },
    /// A formerly write-blocked stream may now accept data
    StreamWritable {
        /// Which stream
        stream: StreamId,
    },
    /// All data on the stream was delivered and acknowledged
    StreamFinished {
        /// Which stream
        stream: StreamId,
    },
    /// The peer raised its stream limit; more may be opened
    StreamAvailable {
        /// Which directionality's limit rose
        directionality: Directionality,
    },
    /// The server refused our early data; it must be retried on 1-RTT
    ZeroRttRejected,
}

/// Kinds of timeouts needed to run the protocol logic
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Timer {
    /// When to declare packets lost or retransmit handshake data
    LossDetection = 0,
    /// When to abandon an inactive connection
    Idle = 1,
    /// When the close drain period ends
    Close = 2,
    /// When the second address family joins the connection race
    HappyEyeballs = 3,
}

impl Timer {
    /// All timer kinds, in index order
    pub const VALUES: [Timer; 4] = [
        Timer::LossDetection,
        Timer::Idle,
        Timer::Close,
        Timer::HappyEyeballs,
    ];
}

/// Change applicable to one of a connection's timers
#[derive(Debug, Copy, Clone)]
pub enum TimerSetting {
    /// Set the timer to expire at a certain point in time
    Start(Instant),
    /// Cancel the timer if it's currently running
    Stop,
}

/// Change to apply to a specific timer
#[derive(Debug, Copy, Clone)]
pub struct TimerUpdate {
    /// Which timer to change
    pub timer: Timer,
    /// What to do with it
    pub update: TimerSetting,
}

/// I/O operations to be immediately executed by the backend
#[derive(Debug)]
pub enum Io {
    /// Stop or (re)start a timer
    TimerUpdate(TimerUpdate),
    /// Close `socket` and stop delivering its datagrams; the path race is over
    RetireSocket {
        /// The losing socket
        socket: SocketId,
    },
}

/// Encoding of I/O operations to emit on upcoming `poll_io` calls
struct IoQueue {
    /// Number of probe packets to transmit
    probes: u8,
    /// Whether to transmit a close packet
    close: bool,
    timers: [Option<TimerSetting>; 4],
    retired_sockets: Vec<SocketId>,
    /// Datagram owed to the racing secondary socket
    dup_transmit: Option<Transmit>,
}

impl IoQueue {
    fn new() -> Self {
        Self {
            probes: 0,
            close: false,
            timers: [None; 4],
            retired_sockets: Vec::new(),
            dup_transmit: None,
        }
    }

    fn timer_start(&mut self, timer: Timer, time: Instant) {
        self.timers[timer as usize] = Some(TimerSetting::Start(time));
    }

    fn timer_stop(&mut self, timer: Timer) {
        self.timers[timer as usize] = Some(TimerSetting::Stop);
    }
}

/// Outstanding packet counters feeding loss detection
struct InFlight {
    /// Unacknowledged Initial/Handshake packets bearing CRYPTO frames
    crypto: u64,
    /// Packets in flight containing frames other than ACK and PADDING
    ack_eliciting: u64,
}

impl InFlight {
    fn new() -> Self {
        Self {
            crypto: 0,
            ack_eliciting: 0,
        }
    }

    fn insert(&mut self, packet: &SentPacket) {
        self.crypto += u64::from(packet.is_crypto_packet);
        self.ack_eliciting += u64::from(packet.ack_eliciting);
    }

    fn remove(&mut self, packet: &SentPacket) {
        self.crypto -= u64::from(packet.is_crypto_packet);
        self.ack_eliciting -= u64::from(packet.ack_eliciting);
    }
}

struct RttEstimator {
    /// The most recent RTT measurement made when receiving an ack for a
    /// previously unacked packet
    latest: Duration,
    /// The smoothed RTT of the connection, computed as described in RFC 6298
    smoothed: Option<Duration>,
    /// The RTT variance, computed as described in RFC 6298
    var: Duration,
    /// The minimum RTT seen in the connection, ignoring ack delay
    min: Duration,
}

impl RttEstimator {
    fn new() -> Self {
        Self {
            latest: Duration::new(0, 0),
            smoothed: None,
            var: Duration::new(0, 0),
            min: Duration::new(u64::max_value(), 0),
        }
    }

    fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest = rtt;
        // min_rtt ignores ack delay
        self.min = cmp::min(self.min, self.latest);
        // Adjust for ack delay if it's plausible
        if self.latest - self.min > ack_delay {
            self.latest -= ack_delay;
        }
        if let Some(smoothed) = self.smoothed {
            let var_sample = if smoothed > self.latest {
                smoothed - self.latest
            } else {
                self.latest - smoothed
            };
            self.var = (3 * self.var + var_sample) / 4;
            self.smoothed = Some((7 * smoothed + self.latest) / 8);
        } else {
            self.smoothed = Some(self.latest);
            self.var = self.latest / 2;
        }
    }
}

/// Errors preventing a connection from being created
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The TLS collaborator refused the session parameters
    #[error("TLS session could not be started: {0}")]
    Tls(TransportError),
}

fn micros_from(x: Duration) -> u64 {
    x.as_secs() * 1000 * 1000 + u64::from(x.subsec_micros())
}

/// Exponent advertised (implicitly, by default) for our ACK delay encoding
const ACK_DELAY_EXPONENT: u64 = 3;

/// Ensures all our ACKs fit in one minimum-MTU packet with room to spare
const MAX_ACK_BLOCKS: usize = 64;

// Prevents overflow and improves behavior in extreme circumstances
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// First flight DCIDs must be at least 8 bytes for Initial key derivation
const INITIAL_DCID_LEN: usize = 8;
