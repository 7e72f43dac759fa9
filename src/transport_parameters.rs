use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::coding::{BufExt, BufMutExt};
use crate::config::TransportConfig;
use crate::transport_error::TransportError;
use crate::VERSION;

// Apply a given macro to the list of all simple-integer-typed transport
// parameters, with codes and defaults, avoiding duplication across decoding,
// encoding, and `Default`.
macro_rules! apply_params {
    ($macro:ident) => {
        $macro! {
            // name (id): type = default,
            initial_max_stream_data_bidi_local(0x0000): u32 = 0,
            initial_max_stream_data_bidi_remote(0x000a): u32 = 0,
            initial_max_stream_data_uni(0x000b): u32 = 0,
            initial_max_data(0x0001): u32 = 0,

            initial_max_bidi_streams(0x0002): u16 = 0,
            initial_max_uni_streams(0x0008): u16 = 0,

            idle_timeout(0x0003): u16 = 0,
            max_packet_size(0x0005): u16 = 65527,
            ack_delay_exponent(0x0007): u8 = 3,
            max_ack_delay(0x000c): u8 = 25,
        }
    };
}

macro_rules! make_struct {
    {$($name:ident ($code:expr) : $ty:ty = $default:expr,)*} => {
        /// Parameters governing a connection's transport behavior, exchanged
        /// during the handshake
        #[derive(Debug, Clone, Eq, PartialEq)]
        pub struct TransportParameters {
            $(#[allow(missing_docs)] pub $name : $ty,)*

            /// Whether the endpoint intends to reject connection migration
            pub disable_migration: bool,
            /// Token the server may use for stateless resets
            pub stateless_reset_token: Option<[u8; 16]>,
            /// Private parameters with IDs above 0x3fff, opaque to the transport
            pub custom: Vec<CustomParameter>,
        }

        impl Default for TransportParameters {
            /// Standard defaults, used if the peer does not supply a given parameter.
            fn default() -> Self {
                Self {
                    $($name: $default,)*

                    disable_migration: false,
                    stateless_reset_token: None,
                    custom: Vec::new(),
                }
            }
        }
    }
}

apply_params!(make_struct);

/// A transport parameter outside the standard registry
///
/// Private parameters must use IDs greater than 0x3fff.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CustomParameter {
    /// Parameter identifier; must be greater than 0x3fff
    pub id: u16,
    /// Opaque value
    pub value: Bytes,
}

/// Lowest ID usable for custom transport parameters
pub(crate) const MIN_CUSTOM_PARAMETER_ID: u16 = 0x4000;

impl TransportParameters {
    pub(crate) fn new(config: &TransportConfig) -> Self {
        TransportParameters {
            initial_max_bidi_streams: config.stream_window_bidi as u16,
            initial_max_uni_streams: config.stream_window_uni as u16,
            initial_max_data: config.receive_window as u32,
            initial_max_stream_data_bidi_local: config.stream_receive_window as u32,
            initial_max_stream_data_bidi_remote: config.stream_receive_window as u32,
            initial_max_stream_data_uni: config.stream_receive_window as u32,
            idle_timeout: (config.idle_timeout_ms / 1000) as u16,
            ..Self::default()
        }
    }

    fn write_entries<W: BufMut>(&self, w: &mut W) {
        macro_rules! write_params {
            {$($name:ident ($code:expr) : $ty:ty = $default:expr,)*} => {
                $(
                    if self.$name != $default {
                        w.write::<u16>($code);
                        w.write::<u16>(std::mem::size_of::<$ty>() as u16);
                        w.write(self.$name);
                    }
                )*
            }
        }
        apply_params!(write_params);

        if self.disable_migration {
            w.write::<u16>(0x0009);
            w.write::<u16>(0);
        }

        for custom in &self.custom {
            w.write::<u16>(custom.id);
            w.write::<u16>(custom.value.len() as u16);
            w.put_slice(&custom.value);
        }
    }

    /// Encode in the form a client sends in its ClientHello extension
    pub fn write<W: BufMut>(&self, w: &mut W) {
        w.write::<u32>(VERSION); // Initially requested version

        let mut buf = Vec::new();
        self.write_entries(&mut buf);
        w.write::<u16>(buf.len() as u16);
        w.put_slice(&buf);
    }

    /// Decode from the form a server sends in its EncryptedExtensions
    pub fn read<R: Buf>(r: &mut R) -> Result<Self, Error> {
        if r.remaining() < 7 {
            return Err(Error::Malformed);
        }
        let negotiated = r.get::<u32>().map_err(|_| Error::Malformed)?;
        if negotiated != VERSION {
            return Err(Error::VersionNegotiation);
        }
        let supported_bytes = r.get::<u8>().map_err(|_| Error::Malformed)?;
        if supported_bytes < 4 || supported_bytes > 252 || supported_bytes % 4 != 0 {
            return Err(Error::Malformed);
        }
        if r.remaining() < supported_bytes as usize {
            return Err(Error::Malformed);
        }
        let mut found = false;
        for _ in 0..(supported_bytes / 4) {
            found |= r.get::<u32>().unwrap() == negotiated;
        }
        if !found {
            return Err(Error::VersionNegotiation);
        }

        Self::read_entries(r)
    }

    fn read_entries<R: Buf>(r: &mut R) -> Result<Self, Error> {
        if r.remaining() < 2 {
            return Err(Error::Malformed);
        }
        let params_len = r.get::<u16>().unwrap();
        if params_len as usize != r.remaining() {
            return Err(Error::Malformed);
        }

        let mut params = TransportParameters::default();

        // State to check for duplicate transport parameters
        macro_rules! param_state {
            {$($name:ident ($code:expr) : $ty:ty = $default:expr,)*} => {{
                struct ParamState {
                    $($name: bool,)*
                }
                ParamState {
                    $($name: false,)*
                }
            }}
        }
        let mut got = apply_params!(param_state);

        while r.has_remaining() {
            if r.remaining() < 4 {
                return Err(Error::Malformed);
            }
            let id = r.get::<u16>().unwrap();
            let len = r.get::<u16>().unwrap();
            if r.remaining() < len as usize {
                return Err(Error::Malformed);
            }

            match id {
                0x0006 => {
                    if len != 16 || params.stateless_reset_token.is_some() {
                        return Err(Error::Malformed);
                    }
                    let mut tok = [0; 16];
                    r.copy_to_slice(&mut tok);
                    params.stateless_reset_token = Some(tok);
                }
                0x0009 => {
                    if len != 0 || params.disable_migration {
                        return Err(Error::Malformed);
                    }
                    params.disable_migration = true;
                }
                id if id >= MIN_CUSTOM_PARAMETER_ID => {
                    let mut value = vec![0; len as usize];
                    r.copy_to_slice(&mut value);
                    params.custom.push(CustomParameter {
                        id,
                        value: value.into(),
                    });
                }
                _ => {
                    macro_rules! parse {
                        {$($name:ident ($code:expr) : $ty:ty = $default:expr,)*} => {
                            match id {
                                $($code => {
                                    if len != std::mem::size_of::<$ty>() as u16 || got.$name {
                                        return Err(Error::Malformed);
                                    }
                                    params.$name = r.get().unwrap();
                                    got.$name = true;
                                })*
                                _ => r.advance(len as usize),
                            }
                        }
                    }
                    apply_params!(parse);
                }
            }
        }

        if params.ack_delay_exponent > 20 {
            return Err(Error::IllegalValue);
        }

        Ok(params)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub(crate) enum Error {
    #[error("version negotiation was tampered with")]
    VersionNegotiation,
    #[error("parameter had illegal value")]
    IllegalValue,
    #[error("parameters were malformed")]
    Malformed,
}

impl From<Error> for TransportError {
    fn from(e: Error) -> Self {
        TransportError::TRANSPORT_PARAMETER_ERROR(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn server_encode(params: &TransportParameters) -> Vec<u8> {
        // The server-side form: negotiated version, supported list, entries
        let mut buf = Vec::new();
        buf.write::<u32>(VERSION);
        buf.write::<u8>(8);
        buf.write::<u32>(0x0a1a_2a3a); // Reserved version
        buf.write::<u32>(VERSION);
        let mut entries = Vec::new();
        params.write_entries(&mut entries);
        buf.write::<u16>(entries.len() as u16);
        buf.extend_from_slice(&entries);
        buf
    }

    #[test]
    fn coding() {
        let mut params = TransportParameters {
            initial_max_data: 42,
            initial_max_stream_data_bidi_local: 1000,
            initial_max_stream_data_bidi_remote: 1001,
            initial_max_stream_data_uni: 1002,
            initial_max_bidi_streams: 16,
            idle_timeout: 30,
            stateless_reset_token: Some([0xab; 16]),
            ..TransportParameters::default()
        };
        params.custom.push(CustomParameter {
            id: 0x4127,
            value: Bytes::from_static(b"opaque"),
        });

        let buf = server_encode(&params);
        let decoded = TransportParameters::read(&mut io::Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn rejects_wrong_version() {
        let params = TransportParameters::default();
        let mut buf = server_encode(&params);
        buf[0] ^= 0xff;
        assert_eq!(
            TransportParameters::read(&mut io::Cursor::new(&buf)),
            Err(Error::VersionNegotiation)
        );
    }

    #[test]
    fn rejects_duplicates() {
        let mut buf = Vec::new();
        buf.write::<u32>(VERSION);
        buf.write::<u8>(4);
        buf.write::<u32>(VERSION);
        let mut entries = Vec::new();
        for _ in 0..2 {
            entries.write::<u16>(0x0001);
            entries.write::<u16>(4);
            entries.write::<u32>(42);
        }
        buf.write::<u16>(entries.len() as u16);
        buf.extend_from_slice(&entries);
        assert_eq!(
            TransportParameters::read(&mut io::Cursor::new(&buf)),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn client_form_carries_custom_params() {
        let mut params = TransportParameters::default();
        params.initial_max_data = 7;
        params.custom.push(CustomParameter {
            id: 0x7fff,
            value: Bytes::from_static(&[1, 2, 3]),
        });
        let mut buf = Vec::new();
        params.write(&mut buf);
        // version prologue, then entries; decode the entry section directly
        let mut r = io::Cursor::new(&buf[4..]);
        let decoded = TransportParameters::read_entries(&mut r).unwrap();
        assert_eq!(decoded.custom, params.custom);
        assert_eq!(decoded.initial_max_data, 7);
    }
}
