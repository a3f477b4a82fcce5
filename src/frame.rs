//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! A [`Frame`] is what travels on the wire. Application data is carried by
//! [`Message`](crate::Message), which the driver splits into (outgoing) or assembles from
//! (incoming) frames.
use bytes::BytesMut;

use crate::{close::CloseCode, WebSocketError};

/// Largest payload a control frame (close, ping, pong) may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest encoded header: 2 basic bytes, 8 bytes of extended length, 4 bytes of mask key.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// WebSocket operation code (OpCode) that determines the semantic meaning and handling of a frame.
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved; frames carrying them are rejected with
/// [`WebSocketError::InvalidOpCode`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames cannot be fragmented and carry at most [`MAX_CONTROL_PAYLOAD`] bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A single WebSocket frame.
///
/// # Fields
/// - `fin`: Final fragment flag. When `true`, indicates this frame completes a message.
/// - `opcode`: Defines the frame type.
/// - `mask`: Optional 32-bit XOR masking key. Every client-to-server frame is masked.
/// - `payload`: Frame payload, unmasked unless [`Frame::mask`] was called.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// The masking key for the frame, if any.
    mask: Option<[u8; 4]>,
    /// The payload of the frame.
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a new WebSocket `Frame`.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Final text frame.
    pub fn text(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// Final binary frame.
    pub fn binary(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    pub fn pong(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// Close frame carrying `code` followed by `reason`.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);

        Self::new(true, OpCode::Close, None, payload)
    }

    /// Close frame with an arbitrary payload, used to echo the peer's close frame verbatim.
    pub fn close_raw(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Close, None, BytesMut::from(payload.as_ref()))
    }

    /// Status code carried by a close frame, if any.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?);
        Some(CloseCode::from(code))
    }

    /// Checks if the frame payload is valid UTF-8.
    #[inline(always)]
    pub fn is_utf8(&self) -> bool {
        std::str::from_utf8(&self.payload).is_ok()
    }

    #[inline(always)]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Masks the payload in place.
    ///
    /// If no masking key is set, a fresh random key is generated and stored in the frame.
    pub fn mask(&mut self) {
        let mask = *self.mask.get_or_insert_with(rand::random);
        crate::mask::apply_mask(&mut self.payload, mask);
    }

    /// Reverses [`Frame::mask`] and forgets the key.
    pub fn unmask(&mut self) {
        if let Some(mask) = self.mask.take() {
            crate::mask::apply_mask(&mut self.payload, mask);
        }
    }

    /// Writes the frame header into `head` and returns the number of bytes used.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        write_head(head, self.fin, self.opcode, self.payload.len(), self.mask)
    }
}

/// Serializes a frame header.
///
/// The payload length uses the smallest encoding that fits: 7 bits below 126, 16 bits
/// below 65536 and 64 bits otherwise.
pub(crate) fn write_head(
    head: &mut [u8],
    fin: bool,
    opcode: OpCode,
    len: usize,
    mask: Option<[u8; 4]>,
) -> usize {
    head[0] = (fin as u8) << 7 | u8::from(opcode);

    let size = if len < 126 {
        head[1] = len as u8;
        2
    } else if len < 65536 {
        head[1] = 126;
        head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        4
    } else {
        head[1] = 127;
        head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
        10
    };

    if let Some(mask) = mask {
        head[1] |= 0x80;
        head[size..size + 4].copy_from_slice(&mask);
        size + 4
    } else {
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod opcode_tests {
        use super::*;

        #[test]
        fn test_is_control() {
            assert!(OpCode::Close.is_control());
            assert!(OpCode::Ping.is_control());
            assert!(OpCode::Pong.is_control());

            assert!(!OpCode::Continuation.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
        }

        #[test]
        fn test_try_from_u8() {
            for code in [0x0u8, 0x1, 0x2, 0x8, 0x9, 0xA] {
                let opcode = OpCode::try_from(code).unwrap();
                assert_eq!(u8::from(opcode), code);
            }

            for code in [0x3u8, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
                assert!(matches!(
                    OpCode::try_from(code),
                    Err(WebSocketError::InvalidOpCode(c)) if c == code
                ));
            }
        }
    }

    mod frame_tests {
        use super::*;

        #[test]
        fn test_close_payload_layout() {
            let frame = Frame::close(CloseCode::Normal, "bye");
            assert_eq!(frame.opcode, OpCode::Close);
            assert_eq!(&frame.payload[..], b"\x03\xE8bye");
            assert_eq!(frame.close_code(), Some(CloseCode::Normal));

            assert_eq!(Frame::close_raw(b"").close_code(), None);
        }

        #[test]
        fn test_frame_is_utf8() {
            assert!(Frame::text("Hello, 世界").is_utf8());
            assert!(!Frame::text(&[0xFF, 0xFE, 0xFD][..]).is_utf8());
        }

        #[test]
        fn test_frame_mask_unmask() {
            let payload = BytesMut::from("Mask me");
            let mut frame = Frame::new(
                true,
                OpCode::Binary,
                Some([0x01, 0x02, 0x03, 0x04]),
                payload.clone(),
            );

            frame.mask();
            assert_ne!(frame.payload, payload);

            frame.unmask();
            assert_eq!(frame.payload, payload);
            assert!(!frame.is_masked());
        }

        #[test]
        fn test_mask_generates_key() {
            let mut frame = Frame::text("random key");
            assert!(!frame.is_masked());
            frame.mask();
            assert!(frame.is_masked());
        }

        #[test]
        fn test_frame_fmt_head_lengths() {
            let mut head = [0u8; MAX_HEAD_SIZE];

            let frame = Frame::binary(BytesMut::zeroed(125));
            assert_eq!(frame.fmt_head(&mut head), 2);
            assert_eq!(head[0], 0x82);
            assert_eq!(head[1], 125);

            let frame = Frame::binary(BytesMut::zeroed(126));
            assert_eq!(frame.fmt_head(&mut head), 4);
            assert_eq!(head[1], 126);
            assert_eq!(&head[2..4], &126u16.to_be_bytes());

            let frame = Frame::binary(BytesMut::zeroed(65535));
            assert_eq!(frame.fmt_head(&mut head), 4);
            assert_eq!(&head[2..4], &65535u16.to_be_bytes());

            let frame = Frame::binary(BytesMut::zeroed(65536));
            assert_eq!(frame.fmt_head(&mut head), 10);
            assert_eq!(head[1], 127);
            assert_eq!(&head[2..10], &65536u64.to_be_bytes());
        }

        #[test]
        fn test_frame_fmt_head_masked() {
            let mask_key = [0xAA, 0xBB, 0xCC, 0xDD];
            let frame = Frame::new(false, OpCode::Text, Some(mask_key), "Header test");

            let mut head = [0u8; MAX_HEAD_SIZE];
            assert_eq!(frame.fmt_head(&mut head), 2 + 4);
            // FIN=0, opcode=1
            assert_eq!(head[0], 0x01);
            assert_eq!(head[1], 0x80 | 11);
            assert_eq!(&head[2..6], &mask_key);
        }
    }
}
