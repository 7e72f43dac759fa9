use std::collections::hash_map;

use fnv::FnvHashMap;

use crate::stream::{ReadError, Recv, Send};
use crate::transport_error::TransportError;
use crate::{Directionality, Side, StreamId};

/// The connection's stream table and flow-control accounting
///
/// Owns the per-stream state machines and both levels of flow control.
/// Decisions about what to put on the wire stay with the connection; methods
/// here report when a flow-control advertisement is due.
pub struct Streams {
    // Streams that are currently open, or could be immediately opened by the peer
    send: FnvHashMap<StreamId, Send>,
    recv: FnvHashMap<StreamId, Recv>,
    /// Locally initiated streams opened so far, per directionality
    next: [u64; 2],
    /// Peer-granted limits on locally initiated streams
    pub max: [u64; 2],
    /// Maximum that can be remotely initiated
    pub max_remote: [u64; 2],
    /// Lowest remote index that hasn't actually been opened
    pub next_remote: [u64; 2],
    /// Next remote stream to report to the application, once opened
    next_reported_remote: [u64; 2],

    /// Peer's limit on outgoing data across all streams
    pub max_data: u64,
    /// Sum of stream offsets we have queued for transmission
    pub data_sent: u64,
    /// Sum of end offsets received; includes gaps, so an upper bound
    pub data_recvd: u64,
    /// Limit on incoming data we have granted
    pub local_max_data: u64,
    /// Value of `local_max_data` last advertised to the peer
    max_data_advertised: u64,

    receive_window: u64,
    stream_receive_window: u64,
}

impl Streams {
    pub fn new(
        max_remote_bi: u64,
        max_remote_uni: u64,
        receive_window: u64,
        stream_receive_window: u64,
    ) -> Self {
        let mut this = Self {
            send: FnvHashMap::default(),
            recv: FnvHashMap::default(),
            next: [0, 0],
            max: [0, 0],
            max_remote: [max_remote_bi, max_remote_uni],
            next_remote: [0, 0],
            next_reported_remote: [0, 0],

            max_data: 0,
            data_sent: 0,
            data_recvd: 0,
            local_max_data: receive_window,
            max_data_advertised: receive_window,

            receive_window,
            stream_receive_window,
        };

        for dir in Directionality::iter() {
            for i in 0..this.max_remote[dir as usize] {
                this.insert(true, StreamId::new(Side::Server, dir, i));
            }
        }

        this
    }

    /// Open a locally initiated stream, if the peer's stream limit allows
    pub fn open(&mut self, direction: Directionality, max_stream_data: u64) -> Option<StreamId> {
        if self.next[direction as usize] >= self.max[direction as usize] {
            return None;
        }
        self.next[direction as usize] += 1;
        let id = StreamId::new(Side::Client, direction, self.next[direction as usize] - 1);
        self.insert(false, id);
        if let Some(ss) = self.send.get_mut(&id) {
            ss.max_data = max_stream_data;
        }
        Some(id)
    }

    /// Surface the next peer-opened stream to the application
    pub fn accept(&mut self) -> Option<StreamId> {
        for dir in Directionality::iter() {
            if self.next_remote[dir as usize] > self.next_reported_remote[dir as usize] {
                let x = self.next_reported_remote[dir as usize];
                self.next_reported_remote[dir as usize] = x + 1;
                return Some(StreamId::new(Side::Server, dir, x));
            }
        }
        None
    }

    /// Permit an additional remote `dir` stream, replacing an exhausted one
    pub fn alloc_remote_stream(&mut self, dir: Directionality) {
        self.max_remote[dir as usize] += 1;
        let id = StreamId::new(Side::Server, dir, self.max_remote[dir as usize] - 1);
        self.insert(true, id);
    }

    /// Ordered read; returns the bytes read and whether the peer may still send more
    pub fn read(&mut self, id: StreamId, buf: &mut [u8]) -> Result<(usize, bool), ReadError> {
        let rs = self.recv.get_mut(&id).ok_or(ReadError::UnknownStream)?;
        match rs.read(buf) {
            Ok(len) => {
                let more = rs.receiving_unknown_size();
                self.local_max_data += len as u64;
                Ok((len, more))
            }
            Err(e @ ReadError::Finished) | Err(e @ ReadError::Reset { .. }) => {
                self.maybe_cleanup(id);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether consumed connection credit warrants a fresh MAX_DATA
    ///
    /// Re-advertises only once at least half the window has been consumed
    /// since the previous advertisement.
    pub fn max_data_due(&mut self) -> bool {
        if self.local_max_data - self.max_data_advertised < self.receive_window / 2 {
            return false;
        }
        self.max_data_advertised = self.local_max_data;
        true
    }

    /// Whether `id`'s consumed stream credit warrants a fresh MAX_STREAM_DATA
    pub fn max_stream_data_due(&mut self, id: StreamId) -> bool {
        let window = self.stream_receive_window;
        let rs = match self.recv.get_mut(&id) {
            Some(x) => x,
            None => return false,
        };
        let desired = rs.bytes_read + window;
        if desired - rs.max_stream_data_advertised < window / 2 {
            return false;
        }
        rs.max_stream_data_advertised = desired;
        true
    }

    /// Offset to advertise in a MAX_STREAM_DATA frame for `id`
    pub fn max_stream_data_value(&self, id: StreamId) -> Option<u64> {
        let rs = self.recv.get(&id)?;
        if rs.is_finished() {
            return None;
        }
        Some(rs.bytes_read + self.stream_receive_window)
    }

    /// Connection-level budget remaining for outgoing stream data
    pub fn conn_send_budget(&self) -> u64 {
        self.max_data - self.data_sent
    }

    /// Whether connection-level flow control currently forbids sending
    pub fn conn_blocked(&self) -> bool {
        self.data_sent >= self.max_data
    }

    /// Look up the receive half addressed by a peer frame, validating the ID
    pub fn get_recv_stream(
        &mut self,
        id: StreamId,
    ) -> Result<Option<&mut Recv>, TransportError> {
        if Side::Client == id.initiator() {
            match id.directionality() {
                Directionality::Uni => {
                    return Err(TransportError::STREAM_STATE_ERROR(
                        "illegal operation on send-only stream",
                    ));
                }
                Directionality::Bi if id.index() >= self.next[Directionality::Bi as usize] => {
                    return Err(TransportError::STREAM_STATE_ERROR(
                        "operation on unopened stream",
                    ));
                }
                Directionality::Bi => {}
            };
        } else {
            let limit = self.max_remote[id.directionality() as usize];
            if id.index() >= limit {
                return Err(TransportError::STREAM_LIMIT_ERROR(""));
            }
        }
        Ok(self.recv.get_mut(&id))
    }

    /// Track the opening of remote streams; returns whether `id` is new
    pub fn on_remote_frame(&mut self, id: StreamId) -> bool {
        if id.initiator() == Side::Client {
            return false;
        }
        let next = &mut self.next_remote[id.directionality() as usize];
        if id.index() >= *next {
            *next = id.index() + 1;
            return true;
        }
        false
    }

    /// Discard state for a stream if it's fully closed.
    ///
    /// Called when one side of a stream transitions to a closed state.
    pub fn maybe_cleanup(&mut self, id: StreamId) {
        match self.send.entry(id) {
            hash_map::Entry::Vacant(_) => {}
            hash_map::Entry::Occupied(e) => {
                if e.get().is_closed() {
                    e.remove_entry();
                }
            }
        }
        match self.recv.entry(id) {
            hash_map::Entry::Vacant(_) => {}
            hash_map::Entry::Occupied(e) => {
                if e.get().is_closed() {
                    e.remove_entry();
                }
            }
        }
    }

    pub fn get_recv_mut(&mut self, id: StreamId) -> Option<&mut Recv> {
        self.recv.get_mut(&id)
    }

    pub fn get_send_mut(&mut self, id: StreamId) -> Option<&mut Send> {
        self.send.get_mut(&id)
    }

    pub fn get_send(&self, id: StreamId) -> Option<&Send> {
        self.send.get(&id)
    }

    pub fn get_recv(&self, id: StreamId) -> Option<&Recv> {
        self.recv.get(&id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.send.contains_key(&id) || self.recv.contains_key(&id)
    }

    /// Revert locally initiated streams to their initial state after the
    /// server ignored our 0-RTT data
    pub fn zero_rtt_rejected(&mut self) {
        for dir in Directionality::iter() {
            for i in 0..self.next[dir as usize] {
                let id = StreamId::new(Side::Client, dir, i);
                self.send.remove(&id);
                if let Directionality::Bi = dir {
                    self.recv.remove(&id);
                }
            }
            self.next[dir as usize] = 0;
        }
        self.data_sent = 0;
    }

    pub(crate) fn stream_receive_window(&self) -> u64 {
        self.stream_receive_window
    }

    fn insert(&mut self, remote: bool, id: StreamId) {
        let bi = id.directionality() == Directionality::Bi;
        if bi || !remote {
            assert!(self.send.insert(id, Send::new(0)).is_none());
        }
        if bi || remote {
            assert!(
                self.recv
                    .insert(id, Recv::new(self.stream_receive_window))
                    .is_none()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Streams {
        let mut streams = Streams::new(8, 8, 1 << 16, 1 << 12);
        streams.max = [8, 8];
        streams.max_data = 1 << 16;
        streams
    }

    #[test]
    fn stream_ids_encode_role() {
        let mut streams = engine();
        let bi = streams.open(Directionality::Bi, 100).unwrap();
        assert_eq!(bi.initiator(), Side::Client);
        assert_eq!(bi.directionality(), Directionality::Bi);
        let uni = streams.open(Directionality::Uni, 100).unwrap();
        assert_eq!(uni.directionality(), Directionality::Uni);
        assert_eq!(uni.index(), 0);
    }

    #[test]
    fn open_respects_limits() {
        let mut streams = engine();
        streams.max = [1, 0];
        assert!(streams.open(Directionality::Bi, 100).is_some());
        assert!(streams.open(Directionality::Bi, 100).is_none());
        assert!(streams.open(Directionality::Uni, 100).is_none());
    }

    #[test]
    fn remote_streams_reported_once() {
        let mut streams = engine();
        let id = StreamId::new(Side::Server, Directionality::Uni, 0);
        assert!(streams.on_remote_frame(id));
        assert!(!streams.on_remote_frame(id));
        assert_eq!(streams.accept(), Some(id));
        assert_eq!(streams.accept(), None);
    }

    #[test]
    fn recv_only_streams_reject_sends() {
        let mut streams = engine();
        let id = StreamId::new(Side::Client, Directionality::Uni, 0);
        assert!(streams.get_recv_stream(id).is_err());
    }

    #[test]
    fn remote_limit_enforced() {
        let mut streams = engine();
        let id = StreamId::new(Side::Server, Directionality::Bi, 9);
        let err = streams.get_recv_stream(id).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::STREAM_LIMIT_ERROR);
    }

    #[test]
    fn max_data_highwater() {
        let mut streams = engine();
        streams.local_max_data += 100;
        assert!(!streams.max_data_due());
        streams.local_max_data += (1 << 15) - 100;
        assert!(streams.max_data_due());
        // No duplicate advertisement until another half window is consumed
        assert!(!streams.max_data_due());
    }

    #[test]
    fn max_stream_data_highwater() {
        let mut streams = engine();
        let id = StreamId::new(Side::Server, Directionality::Uni, 0);
        {
            let rs = streams.get_recv_mut(id).unwrap();
            rs.bytes_read = 100;
        }
        assert!(!streams.max_stream_data_due(id));
        streams.get_recv_mut(id).unwrap().bytes_read = 1 << 11;
        assert!(streams.max_stream_data_due(id));
        assert!(!streams.max_stream_data_due(id));
    }
}
