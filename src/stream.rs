use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::assembler::Assembler;
use crate::frame;
use crate::range_set::RangeSet;
use crate::transport_error::TransportError;

/// Send half of a stream
#[derive(Debug)]
pub struct Send {
    /// Offset the next queued byte will occupy; the stream's final offset
    /// once FIN or RESET_STREAM has been emitted
    pub offset: u64,
    /// Peer-advertised flow control limit
    pub max_data: u64,
    pub state: SendState,
    /// Number of bytes sent but unacked
    pub bytes_in_flight: u64,
}

impl Send {
    pub fn new(max_data: u64) -> Self {
        Self {
            offset: 0,
            max_data,
            state: SendState::Ready,
            bytes_in_flight: 0,
        }
    }

    pub fn write_budget(&mut self) -> Result<u64, WriteError> {
        if let Some(error_code) = self.take_stop_reason() {
            return Err(WriteError::Stopped { error_code });
        }
        let budget = self.max_data - self.offset;
        if budget == 0 {
            Err(WriteError::Blocked)
        } else {
            Ok(budget)
        }
    }

    /// All data acknowledged and any STOP_SENDING reason delivered to the application
    pub fn is_closed(&self) -> bool {
        use self::SendState::*;
        matches!(
            self.state,
            DataRecvd | ResetRecvd { stop_reason: None }
        )
    }

    pub fn finish(&mut self) -> Result<(), FinishError> {
        if self.state == SendState::Ready {
            self.state = SendState::DataSent;
            Ok(())
        } else if let Some(error_code) = self.take_stop_reason() {
            Err(FinishError::Stopped { error_code })
        } else {
            Err(FinishError::UnknownStream)
        }
    }

    fn take_stop_reason(&mut self) -> Option<u16> {
        match self.state {
            SendState::ResetSent {
                ref mut stop_reason,
            }
            | SendState::ResetRecvd {
                ref mut stop_reason,
            } => stop_reason.take(),
            _ => None,
        }
    }
}

/// `stop_reason` below is set iff the stream was stopped and the application
/// has not yet been told; resources are retained while it is set.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendState {
    /// Open for writes
    Ready,
    /// FIN queued; writes are over
    DataSent,
    /// RESET_STREAM queued or sent
    ResetSent { stop_reason: Option<u16> },
    /// FIN acknowledged
    DataRecvd,
    /// RESET_STREAM acknowledged
    ResetRecvd { stop_reason: Option<u16> },
}

impl SendState {
    pub fn was_reset(self) -> bool {
        use self::SendState::*;
        matches!(self, ResetSent { .. } | ResetRecvd { .. })
    }
}

/// Receive half of a stream
#[derive(Debug)]
pub struct Recv {
    pub state: RecvState,
    pub recvd: RangeSet,
    assembler: Assembler,
    /// Number of bytes delivered to the application
    pub bytes_read: u64,
    /// Highest offset we have issued flow control credit up to
    pub max_stream_data_advertised: u64,
}

impl Recv {
    pub fn new(receive_window: u64) -> Self {
        Self {
            state: RecvState::Recv { size: None },
            recvd: RangeSet::new(),
            assembler: Assembler::new(),
            bytes_read: 0,
            max_stream_data_advertised: receive_window,
        }
    }

    /// Buffer a STREAM frame, enforcing flow control and final-size consistency
    ///
    /// `received` and `max_data` are the connection-level counters; returns
    /// the number of previously unseen bytes.
    pub fn ingest(
        &mut self,
        frame: frame::Stream,
        received: u64,
        max_data: u64,
        receive_window: u64,
    ) -> Result<u64, TransportError> {
        let end = frame.offset + frame.data.len() as u64;
        if let Some(final_offset) = self.final_offset() {
            if end > final_offset || (frame.fin && end != final_offset) {
                debug!(end, final_offset, "final size error");
                return Err(TransportError::FINAL_SIZE_ERROR(""));
            }
        }

        let prev_end = self.limit();
        let new_bytes = end.saturating_sub(prev_end);
        let stream_max_data = self.bytes_read + receive_window;
        if end > stream_max_data || received + new_bytes > max_data {
            debug!(
                stream = frame.id.0,
                received, new_bytes, max_data, end, stream_max_data, "flow control error"
            );
            return Err(TransportError::FLOW_CONTROL_ERROR(""));
        }

        if frame.fin {
            if let RecvState::Recv { ref mut size } = self.state {
                *size = Some(end);
            }
        }

        self.recvd.insert(frame.offset..end);
        if !frame.data.is_empty() {
            self.assembler.insert(frame.offset, frame.data);
        }

        if let RecvState::Recv { size: Some(size) } = self.state {
            if self.is_all_data_received() {
                self.state = RecvState::DataRecvd { size };
            }
        }

        Ok(new_bytes)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        let read = self.assembler.read(buf);
        if read > 0 {
            self.bytes_read += read as u64;
            Ok(read)
        } else {
            Err(self.read_blocked())
        }
    }

    fn read_blocked(&mut self) -> ReadError {
        match self.state {
            RecvState::ResetRecvd { error_code, .. } => {
                self.state = RecvState::Closed;
                ReadError::Reset { error_code }
            }
            RecvState::Closed => panic!("tried to read from a closed stream"),
            RecvState::Recv { .. } => ReadError::Blocked,
            RecvState::DataRecvd { .. } => {
                self.state = RecvState::Closed;
                ReadError::Finished
            }
        }
    }

    /// Whether the peer may still have more data to send
    pub fn receiving_unknown_size(&self) -> bool {
        matches!(self.state, RecvState::Recv { size: None })
    }

    /// No more data expected from the peer
    pub fn is_finished(&self) -> bool {
        !matches!(self.state, RecvState::Recv { .. })
    }

    /// All data read by the application
    pub fn is_closed(&self) -> bool {
        self.state == RecvState::Closed
    }

    /// Offset after the largest byte received
    pub fn limit(&self) -> u64 {
        self.recvd.max().map_or(0, |x| x + 1)
    }

    pub fn final_offset(&self) -> Option<u64> {
        match self.state {
            RecvState::Recv { size } => size,
            RecvState::ResetRecvd { size, .. } => Some(size),
            RecvState::DataRecvd { size } => Some(size),
            RecvState::Closed => None,
        }
    }

    /// Whether the final offset is known and every byte up to it has arrived
    pub fn is_all_data_received(&self) -> bool {
        let size = match self.final_offset() {
            Some(x) => x,
            None => return false,
        };
        if size == 0 {
            return true;
        }
        self.recvd.len() == 1 && self.recvd.peek_min() == Some(0..size)
    }

    /// Apply an inbound RESET_STREAM after validating its final size
    ///
    /// Returns whether state changed; a duplicate reset is a no-op.
    pub fn on_reset(&mut self, error_code: u16, final_offset: u64) -> Result<bool, TransportError> {
        if let Some(offset) = self.final_offset() {
            if offset != final_offset {
                return Err(TransportError::FINAL_SIZE_ERROR("inconsistent value"));
            }
        } else if self.limit() > final_offset {
            return Err(TransportError::FINAL_SIZE_ERROR("lower than high water mark"));
        }
        if self.is_closed() || matches!(self.state, RecvState::ResetRecvd { .. }) {
            return Ok(false);
        }
        self.state = RecvState::ResetRecvd {
            size: final_offset,
            error_code,
        };
        // Drop partially reassembled data; future reads fail immediately with
        // the reset, and no further flow control credit is issued for it
        self.assembler.clear();
        Ok(true)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecvState {
    /// Open; `size` becomes known when FIN arrives
    Recv { size: Option<u64> },
    /// Every byte through the final offset has arrived
    DataRecvd { size: u64 },
    /// Peer abandoned the stream
    ResetRecvd { size: u64, error_code: u16 },
    /// Terminal outcome delivered to the application
    Closed,
}

/// Errors triggered when reading from a recv stream
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ReadError {
    /// No more data is currently available on this stream.
    #[error("blocked")]
    Blocked,
    /// The peer abandoned transmitting data on this stream.
    #[error("reset by peer: error {error_code}")]
    Reset {
        /// Application-defined reason for resetting the stream
        error_code: u16,
    },
    /// The data on this stream has been fully delivered and no more will be transmitted.
    #[error("finished")]
    Finished,
    /// Unknown stream
    #[error("unknown stream")]
    UnknownStream,
}

/// Errors triggered while writing to a send stream
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum WriteError {
    /// The peer is not able to accept additional data, or the connection is congested.
    #[error("unable to accept further writes")]
    Blocked,
    /// The peer is no longer accepting data on this stream.
    #[error("stopped by peer: error {error_code}")]
    Stopped {
        /// Application-defined reason for stopping the stream
        error_code: u16,
    },
    /// Unknown stream
    #[error("unknown stream")]
    UnknownStream,
}

/// Reasons why attempting to finish a stream might fail
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum FinishError {
    /// The peer is no longer accepting data on this stream.
    #[error("stopped by peer: error {error_code}")]
    Stopped {
        /// Application-defined reason for stopping the stream
        error_code: u16,
    },
    /// The stream has not yet been created or is already considered destroyed
    #[error("unknown stream")]
    UnknownStream,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamId;
    use assert_matches::assert_matches;

    fn stream_frame(offset: u64, data: &'static [u8], fin: bool) -> frame::Stream {
        frame::Stream {
            id: StreamId(0),
            offset,
            fin,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn all_data_received_needs_final_offset() {
        let mut rs = Recv::new(1024);
        rs.ingest(stream_frame(0, b"hello", false), 0, 1 << 20, 1024)
            .unwrap();
        assert!(!rs.is_all_data_received());
        rs.ingest(stream_frame(5, b"!", true), 0, 1 << 20, 1024)
            .unwrap();
        assert!(rs.is_all_data_received());
        assert_matches!(rs.state, RecvState::DataRecvd { size: 6 });
    }

    #[test]
    fn all_data_received_needs_contiguity() {
        let mut rs = Recv::new(1024);
        // Gap at [5, 10)
        rs.ingest(stream_frame(0, b"01234", false), 0, 1 << 20, 1024)
            .unwrap();
        rs.ingest(stream_frame(10, b"abcde", true), 0, 1 << 20, 1024)
            .unwrap();
        assert!(!rs.is_all_data_received());
        rs.ingest(stream_frame(5, b"56789", false), 0, 1 << 20, 1024)
            .unwrap();
        assert!(rs.is_all_data_received());
    }

    #[test]
    fn reset_establishes_final_offset() {
        let mut rs = Recv::new(1024);
        rs.ingest(stream_frame(0, b"xyz", false), 0, 1 << 20, 1024)
            .unwrap();
        assert!(rs.on_reset(7, 3).unwrap());
        assert!(rs.is_all_data_received());
        assert_matches!(rs.read(&mut [0; 8]), Err(ReadError::Reset { error_code: 7 }));
    }

    #[test]
    fn duplicate_reset_is_noop() {
        let mut rs = Recv::new(1024);
        assert!(rs.on_reset(7, 100).unwrap());
        assert_eq!(rs.on_reset(7, 100).unwrap(), false);
        assert_matches!(rs.state, RecvState::ResetRecvd { size: 100, error_code: 7 });
    }

    #[test]
    fn reset_final_size_below_highwater_rejected() {
        let mut rs = Recv::new(1024);
        // Data through offset 300
        rs.ingest(
            frame::Stream {
                id: StreamId(0),
                offset: 100,
                fin: false,
                data: Bytes::from(vec![0; 200]),
            },
            0,
            1 << 20,
            1024,
        )
        .unwrap();
        let err = rs.on_reset(0, 200).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FINAL_SIZE_ERROR);
    }

    #[test]
    fn reset_final_size_conflict_rejected() {
        let mut rs = Recv::new(1024);
        rs.ingest(stream_frame(0, b"done", true), 0, 1 << 20, 1024)
            .unwrap();
        let err = rs.on_reset(0, 40).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FINAL_SIZE_ERROR);
    }

    #[test]
    fn data_beyond_fin_rejected() {
        let mut rs = Recv::new(1024);
        rs.ingest(stream_frame(0, b"abc", true), 0, 1 << 20, 1024)
            .unwrap();
        let err = rs
            .ingest(stream_frame(3, b"d", false), 0, 1 << 20, 1024)
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FINAL_SIZE_ERROR);
    }

    #[test]
    fn stream_flow_control_enforced() {
        let mut rs = Recv::new(4);
        let err = rs
            .ingest(stream_frame(0, b"too long", false), 0, 1 << 20, 4)
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn connection_flow_control_enforced() {
        let mut rs = Recv::new(1024);
        let err = rs
            .ingest(stream_frame(0, b"data", false), 10, 12, 1024)
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn write_budget_tracks_peer_limit() {
        let mut ss = Send::new(10);
        assert_eq!(ss.write_budget().unwrap(), 10);
        ss.offset = 10;
        assert_matches!(ss.write_budget(), Err(WriteError::Blocked));
    }

    #[test]
    fn finish_only_once() {
        let mut ss = Send::new(10);
        ss.finish().unwrap();
        assert_matches!(ss.finish(), Err(FinishError::UnknownStream));
    }
}
