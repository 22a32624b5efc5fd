//! The wire-encoding contract, external to this crate.
//!
//! This module defines the seam only: the RADIUS wire constants the trunk
//! must know about directly (to route replies and to parse the one
//! Protocol-Error negotiation hint this crate understands), and the
//! [`Codec`] trait the embedding server implements with its real attribute
//! dictionary and signing. No production codec ships here — that is out of
//! scope.

use async_trait::async_trait;

use crate::error::CodecError;

/// RADIUS header length in bytes.
pub const HEADER_LEN: usize = 20;
/// Offset of the 16-byte authenticator within the header.
pub const AUTHENTICATOR_OFFSET: usize = 4;
/// Offset of the ID byte within the header.
pub const ID_OFFSET: usize = 1;
/// Offset of the big-endian 16-bit length prefix within the header.
pub const LENGTH_OFFSET: usize = 2;
/// Largest RADIUS packet.
pub const MAX_PACKET: usize = 65535;
/// Largest single attribute (type + length + value).
pub const MAX_ATTRIBUTE: usize = 255;

/// Error-Cause attribute number.
pub const ATTR_ERROR_CAUSE: u8 = 101;
/// Error-Cause value meaning "Response Too Big" in RFC 7930's negotiation
/// extension — the one Protocol-Error hint this crate understands.
pub const ERROR_CAUSE_RESPONSE_TOO_BIG: u32 = 601;
/// Extended-Attribute-1 (long extended format) attribute number.
pub const ATTR_EXTENDED_1: u8 = 241;
/// Extended-type carrying the original packet's code inside Extended-Attribute-1.
pub const EXT_TYPE_ORIGINAL_PACKET_CODE: u8 = 1;

/// RADIUS packet codes this crate inspects directly (everything else is
/// opaque and left to the dictionary).
pub mod code {
    pub const ACCESS_REQUEST: u8 = 1;
    pub const ACCESS_ACCEPT: u8 = 2;
    pub const ACCESS_REJECT: u8 = 3;
    pub const ACCOUNTING_REQUEST: u8 = 4;
    pub const ACCOUNTING_RESPONSE: u8 = 5;
    pub const ACCESS_CHALLENGE: u8 = 11;
    pub const STATUS_SERVER: u8 = 12;
    pub const COA_REQUEST: u8 = 43;
    pub const COA_ACK: u8 = 44;
    pub const COA_NAK: u8 = 45;
    pub const DISCONNECT_REQUEST: u8 = 40;
    pub const DISCONNECT_ACK: u8 = 41;
    pub const DISCONNECT_NAK: u8 = 42;
    pub const PROTOCOL_ERROR: u8 = 52;
}

/// A single decoded attribute: type, raw value bytes (the embedding
/// dictionary interprets them; this crate treats them opaquely except for
/// the fixed Protocol-Error attributes it parses itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: u8,
    pub value: Vec<u8>,
}

/// A fully decoded reply.
#[derive(Debug, Clone)]
pub struct DecodedReply {
    pub code: u8,
    pub attributes: Vec<Attribute>,
}

impl DecodedReply {
    pub fn error_cause(&self) -> Option<u32> {
        self.attributes
            .iter()
            .find(|a| a.kind == ATTR_ERROR_CAUSE && a.value.len() == 4)
            .map(|a| u32::from_be_bytes([a.value[0], a.value[1], a.value[2], a.value[3]]))
    }

    /// Extended-Attribute-1 encodes Original-Packet-Code as: ext-type byte,
    /// three zero bytes, then the 1-byte code.
    pub fn original_packet_code(&self) -> Option<u8> {
        self.attributes.iter().find_map(|a| {
            if a.kind != ATTR_EXTENDED_1 || a.value.len() != 5 {
                return None;
            }
            if a.value[0] != EXT_TYPE_ORIGINAL_PACKET_CODE {
                return None;
            }
            if a.value[1..4] != [0, 0, 0] {
                return None;
            }
            Some(a.value[4])
        })
    }

    pub fn has_message_authenticator(&self) -> bool {
        self.attributes.iter().any(|a| a.kind == ATTR_MESSAGE_AUTHENTICATOR)
    }

    /// Response-Length companion to an Error-Cause=601 Protocol-Error reply
    /// This crate has no attribute dictionary of its own,
    /// so we recognise it only by shape: a 4-byte attribute that is not
    /// Error-Cause itself, on a reply whose Error-Cause is 601.
    pub fn response_length_hint(&self) -> Option<u32> {
        if self.error_cause() != Some(ERROR_CAUSE_RESPONSE_TOO_BIG) {
            return None;
        }
        self.attributes
            .iter()
            .find(|a| a.kind != ATTR_ERROR_CAUSE && a.value.len() == 4)
            .map(|a| u32::from_be_bytes([a.value[0], a.value[1], a.value[2], a.value[3]]))
    }
}

/// Message-Authenticator attribute number.
pub const ATTR_MESSAGE_AUTHENTICATOR: u8 = 80;
/// Proxy-State attribute number.
pub const ATTR_PROXY_STATE: u8 = 33;

/// External collaborator: encodes/signs outgoing packets and decodes/verifies
/// incoming ones. Attribute dictionary lookups live entirely on the other
/// side of this trait.
#[async_trait]
pub trait Codec: Send + Sync {
    /// Produces a signed RADIUS datagram for `id`. If `add_proxy_state`, a
    /// Proxy-State attribute is appended to the request's *extra* attribute
    /// list (not the main list) so concurrent encodes of the same logical
    /// request never race on it.
    async fn encode(
        &self,
        code: u8,
        id: u8,
        attributes: &[Attribute],
        extra_attributes: &[Attribute],
        require_message_authenticator: bool,
    ) -> Result<Vec<u8>, CodecError>;

    /// Decodes and verifies a reply using the authenticator saved at encode
    /// time.
    fn decode(
        &self,
        bytes: &[u8],
        request_authenticator: &[u8; 16],
        require_message_authenticator: bool,
    ) -> Result<DecodedReply, CodecError>;
}

/// Reads the ID byte out of a raw, not-yet-decoded datagram, without
/// involving the [`Codec`] — used by the trunk's read loop to find the
/// owning [`crate::id_tracker::IdEntry`] before paying for full decode.
pub fn peek_id(bytes: &[u8]) -> Option<u8> {
    bytes.get(ID_OFFSET).copied()
}

/// Reads the big-endian length prefix out of a raw datagram.
pub fn peek_length(bytes: &[u8]) -> Option<u16> {
    let hi = *bytes.get(LENGTH_OFFSET)?;
    let lo = *bytes.get(LENGTH_OFFSET + 1)?;
    Some(u16::from_be_bytes([hi, lo]))
}

/// A codec test double, kept public (not `#[cfg(test)]`) so integration
/// tests under `tests/` can drive the trunk end-to-end without a real
/// attribute dictionary — the crate never ships a production codec
/// (wire encoding is out of scope).
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    pub struct NullCodec {
        pub encode_calls: AtomicU32,
    }

    #[async_trait]
    impl Codec for NullCodec {
        async fn encode(
            &self,
            code: u8,
            id: u8,
            _attributes: &[Attribute],
            _extra_attributes: &[Attribute],
            _require_message_authenticator: bool,
        ) -> Result<Vec<u8>, CodecError> {
            self.encode_calls.fetch_add(1, Ordering::SeqCst);
            let mut buf = vec![0u8; HEADER_LEN];
            buf[0] = code;
            buf[ID_OFFSET] = id;
            let len = HEADER_LEN as u16;
            buf[LENGTH_OFFSET..LENGTH_OFFSET + 2].copy_from_slice(&len.to_be_bytes());
            Ok(buf)
        }

        fn decode(
            &self,
            bytes: &[u8],
            _request_authenticator: &[u8; 16],
            _require_message_authenticator: bool,
        ) -> Result<DecodedReply, CodecError> {
            if bytes.len() < HEADER_LEN {
                return Err(CodecError::ShortPacket(bytes.len()));
            }
            Ok(DecodedReply {
                code: bytes[0],
                attributes: Vec::new(),
            })
        }
    }

    /// A codec test double that round-trips a minimal RADIUS-style TLV
    /// attribute list (type byte, length byte including both, value bytes)
    /// after the header, for tests that need `decode` to actually surface
    /// attributes (e.g. Protocol-Error/Response-Length negotiation).
    #[derive(Default)]
    pub struct AttributeCodec;

    #[async_trait]
    impl Codec for AttributeCodec {
        async fn encode(
            &self,
            code: u8,
            id: u8,
            attributes: &[Attribute],
            _extra_attributes: &[Attribute],
            _require_message_authenticator: bool,
        ) -> Result<Vec<u8>, CodecError> {
            let mut buf = vec![0u8; HEADER_LEN];
            buf[0] = code;
            buf[ID_OFFSET] = id;
            encode_attributes(&mut buf, attributes);
            let len = buf.len() as u16;
            buf[LENGTH_OFFSET..LENGTH_OFFSET + 2].copy_from_slice(&len.to_be_bytes());
            Ok(buf)
        }

        fn decode(
            &self,
            bytes: &[u8],
            _request_authenticator: &[u8; 16],
            _require_message_authenticator: bool,
        ) -> Result<DecodedReply, CodecError> {
            if bytes.len() < HEADER_LEN {
                return Err(CodecError::ShortPacket(bytes.len()));
            }
            Ok(DecodedReply {
                code: bytes[0],
                attributes: decode_attributes(&bytes[HEADER_LEN..]),
            })
        }
    }

    /// Appends `type, len (incl. header), value...` TLVs, RADIUS-style.
    pub fn encode_attributes(buf: &mut Vec<u8>, attributes: &[Attribute]) {
        for attr in attributes {
            buf.push(attr.kind);
            buf.push((attr.value.len() + 2) as u8);
            buf.extend_from_slice(&attr.value);
        }
    }

    pub fn decode_attributes(mut bytes: &[u8]) -> Vec<Attribute> {
        let mut out = Vec::new();
        while bytes.len() >= 2 {
            let kind = bytes[0];
            let len = bytes[1] as usize;
            if len < 2 || len > bytes.len() {
                break;
            }
            out.push(Attribute {
                kind,
                value: bytes[2..len].to_vec(),
            });
            bytes = &bytes[len..];
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_error_cause() {
        let reply = DecodedReply {
            code: code::PROTOCOL_ERROR,
            attributes: vec![Attribute {
                kind: ATTR_ERROR_CAUSE,
                value: ERROR_CAUSE_RESPONSE_TOO_BIG.to_be_bytes().to_vec(),
            }],
        };
        assert_eq!(reply.error_cause(), Some(ERROR_CAUSE_RESPONSE_TOO_BIG));
    }

    #[test]
    fn parses_original_packet_code() {
        let mut value = vec![EXT_TYPE_ORIGINAL_PACKET_CODE, 0, 0, 0];
        value.push(code::ACCESS_REQUEST);
        let reply = DecodedReply {
            code: code::PROTOCOL_ERROR,
            attributes: vec![Attribute {
                kind: ATTR_EXTENDED_1,
                value,
            }],
        };
        assert_eq!(reply.original_packet_code(), Some(code::ACCESS_REQUEST));
    }

    #[test]
    fn peek_id_reads_offset_one() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[ID_OFFSET] = 42;
        assert_eq!(peek_id(&buf), Some(42));
    }
}
