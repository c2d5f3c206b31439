//! # NDT Control Framing
//!
//! Every message on the control connection is a 3-byte header followed by
//! the payload:
//!
//! ```text
//!  0                   1                   2
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-----------------+
//! |     Type      |     Payload Length (BE16)     |  Payload ...    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-----------------+
//! ```
//!
//! Payloads are ASCII text in practice (port numbers, speeds, `key:value`
//! pairs, result blocks) but the framing itself is binary-safe.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{ProtocolError, WireError};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Header size: 1 (type) + 2 (length).
pub const HEADER_LEN: usize = 3;

/// Maximum payload of a single frame.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

// ─── Message Types ───────────────────────────────────────────────────────────

/// Control message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    CommFailure = 0,
    SrvQueue = 1,
    Login = 2,
    TestPrepare = 3,
    TestStart = 4,
    TestMsg = 5,
    TestFinalize = 6,
    Error = 7,
    Results = 8,
    Logout = 9,
    Waiting = 10,
    /// Login carrying a client version string after the bitmask byte.
    ExtendedLogin = 11,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::CommFailure),
            1 => Some(Self::SrvQueue),
            2 => Some(Self::Login),
            3 => Some(Self::TestPrepare),
            4 => Some(Self::TestStart),
            5 => Some(Self::TestMsg),
            6 => Some(Self::TestFinalize),
            7 => Some(Self::Error),
            8 => Some(Self::Results),
            9 => Some(Self::Logout),
            10 => Some(Self::Waiting),
            11 => Some(Self::ExtendedLogin),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CommFailure => "COMM_FAILURE",
            Self::SrvQueue => "SRV_QUEUE",
            Self::Login => "MSG_LOGIN",
            Self::TestPrepare => "TEST_PREPARE",
            Self::TestStart => "TEST_START",
            Self::TestMsg => "TEST_MSG",
            Self::TestFinalize => "TEST_FINALIZE",
            Self::Error => "MSG_ERROR",
            Self::Results => "MSG_RESULTS",
            Self::Logout => "MSG_LOGOUT",
            Self::Waiting => "MSG_WAITING",
            Self::ExtendedLogin => "MSG_EXTENDED_LOGIN",
        };
        f.write_str(name)
    }
}

// ─── Frame ───────────────────────────────────────────────────────────────────

/// One control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Frame {
            msg_type,
            payload: payload.into(),
        }
    }

    /// Frame with a UTF-8 text payload.
    pub fn text(msg_type: MessageType, text: &str) -> Self {
        Frame::new(msg_type, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn empty(msg_type: MessageType) -> Self {
        Frame::new(msg_type, Bytes::new())
    }

    /// Payload interpreted as text, lossy on invalid UTF-8.
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Total encoded size.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Append the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge(self.payload.len()));
        }
        buf.reserve(self.encoded_len());
        buf.put_u8(self.msg_type.as_u8());
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Streaming decode.
    ///
    /// Returns `Ok(None)` until a whole frame is buffered, then splits it off
    /// the front of `buf`. A declared length above `max_payload` is rejected
    /// as soon as the header is visible.
    pub fn decode(buf: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>, WireError> {
        let Some((msg_type, len)) = peek_header(buf, max_payload)? else {
            return Ok(None);
        };
        if buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        buf.advance(HEADER_LEN);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Frame { msg_type, payload }))
    }
}

/// Parse the 3-byte header without consuming it.
pub fn parse_header(header: [u8; HEADER_LEN], max_payload: usize) -> Result<(MessageType, usize), WireError> {
    let msg_type = MessageType::from_u8(header[0]).ok_or(WireError::UnknownType(header[0]))?;
    let len = u16::from_be_bytes([header[1], header[2]]) as usize;
    if len > max_payload {
        return Err(WireError::ExceedsBuffer {
            declared: len,
            limit: max_payload,
        });
    }
    Ok((msg_type, len))
}

fn peek_header(buf: &BytesMut, max_payload: usize) -> Result<Option<(MessageType, usize)>, WireError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    parse_header([buf[0], buf[1], buf[2]], max_payload).map(Some)
}

/// Check that `frame` has the expected type.
///
/// A `MSG_ERROR` frame surfaces as [`ProtocolError::PeerError`] carrying the
/// peer's text; any other mismatch is [`ProtocolError::UnexpectedType`].
pub fn expect_type(frame: &Frame, expected: MessageType) -> Result<(), ProtocolError> {
    if frame.msg_type == expected {
        return Ok(());
    }
    if frame.msg_type == MessageType::Error {
        return Err(ProtocolError::PeerError(frame.payload_str()));
    }
    Err(ProtocolError::UnexpectedType {
        expected,
        received: frame.msg_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_type_then_be16_length() {
        let frame = Frame::text(MessageType::TestPrepare, "3002");
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(&bytes[..3], &[3, 0x00, 0x04]);
        assert_eq!(&bytes[3..], b"3002");
    }

    #[test]
    fn decode_waits_for_full_payload() {
        let bytes = Frame::text(MessageType::TestMsg, "hello").to_bytes().unwrap();
        let mut buf = BytesMut::from(&bytes[..5]);
        assert_eq!(Frame::decode(&mut buf, MAX_PAYLOAD_LEN).unwrap(), None);
        buf.extend_from_slice(&bytes[5..]);
        let frame = Frame::decode(&mut buf, MAX_PAYLOAD_LEN).unwrap().unwrap();
        assert_eq!(frame.payload_str(), "hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_rejects_oversized_declared_length() {
        let mut buf = BytesMut::from(&[5u8, 0x01, 0x00][..]);
        let err = Frame::decode(&mut buf, 64).unwrap_err();
        assert_eq!(
            err,
            WireError::ExceedsBuffer {
                declared: 256,
                limit: 64
            }
        );
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut buf = BytesMut::from(&[42u8, 0, 0][..]);
        assert_eq!(
            Frame::decode(&mut buf, MAX_PAYLOAD_LEN).unwrap_err(),
            WireError::UnknownType(42)
        );
    }

    #[test]
    fn encode_rejects_payload_over_limit() {
        let frame = Frame::new(MessageType::TestMsg, vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(
            frame.to_bytes(),
            Err(WireError::PayloadTooLarge(65536))
        ));
    }

    #[test]
    fn expect_type_carries_peer_error_text() {
        let frame = Frame::text(MessageType::Error, "Invalid test suite request.");
        let err = expect_type(&frame, MessageType::Login).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::PeerError("Invalid test suite request.".into())
        );
        assert!(expect_type(&frame, MessageType::Error).is_ok());
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        Frame::text(MessageType::TestStart, "").encode(&mut buf).unwrap();
        Frame::text(MessageType::TestMsg, "42").encode(&mut buf).unwrap();
        let a = Frame::decode(&mut buf, MAX_PAYLOAD_LEN).unwrap().unwrap();
        let b = Frame::decode(&mut buf, MAX_PAYLOAD_LEN).unwrap().unwrap();
        assert_eq!(a.msg_type, MessageType::TestStart);
        assert!(a.payload.is_empty());
        assert_eq!(b.payload_str(), "42");
    }
}
