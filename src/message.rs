//! Logical WebSocket messages.
//!
//! A [`Message`] is the unit the application sends and receives; on the wire it may span
//! several frames. Small payloads (up to 125 bytes, the size of a control frame) are stored
//! inline without touching the heap, larger ones in a growable buffer.
use bytes::{Bytes, BytesMut};

use crate::{frame::MAX_CONTROL_PAYLOAD, Frame, OpCode, Result, WebSocketError};

/// Upper bound for a message payload, in either direction: 8 MiB.
pub const MAX_PAYLOAD_LENGTH: usize = 8 * 1024 * 1024;

const INLINE_CAPACITY: usize = MAX_CONTROL_PAYLOAD;

#[derive(Clone)]
enum Payload {
    Inline { len: u8, buf: [u8; INLINE_CAPACITY] },
    Heap(BytesMut),
}

impl Payload {
    fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Inline { len, buf } => &buf[..usize::from(*len)],
            Payload::Heap(bytes) => bytes,
        }
    }
}

/// A text or binary message, possibly assembled from several frames.
///
/// The payload length never exceeds [`MAX_PAYLOAD_LENGTH`]; growing past it fails with
/// [`WebSocketError::PayloadTooLarge`] and leaves the message untouched.
#[derive(Clone)]
pub struct Message {
    opcode: OpCode,
    payload: Payload,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("opcode", &self.opcode)
            .field("len", &self.len())
            .field("inline", &self.is_inline())
            .finish()
    }
}

impl Message {
    /// Empty message of the given kind. Any opcode other than `Binary` yields a text message.
    pub fn empty(opcode: OpCode) -> Self {
        let opcode = match opcode {
            OpCode::Binary => OpCode::Binary,
            _ => OpCode::Text,
        };

        Self {
            opcode,
            payload: Payload::Inline {
                len: 0,
                buf: [0; INLINE_CAPACITY],
            },
        }
    }

    /// Text message. Fails with [`WebSocketError::MessageTooLarge`] above the cap.
    pub fn text(text: impl AsRef<str>) -> Result<Self> {
        Self::with_payload(OpCode::Text, text.as_ref().as_bytes())
    }

    /// Binary message. Fails with [`WebSocketError::MessageTooLarge`] above the cap.
    pub fn binary(bytes: impl AsRef<[u8]>) -> Result<Self> {
        Self::with_payload(OpCode::Binary, bytes.as_ref())
    }

    fn with_payload(opcode: OpCode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_PAYLOAD_LENGTH {
            return Err(WebSocketError::MessageTooLarge(bytes.len()));
        }

        let mut message = Self::empty(opcode);
        message.extend(bytes)?;
        Ok(message)
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn is_text(&self) -> bool {
        self.opcode == OpCode::Text
    }

    pub fn len(&self) -> usize {
        self.payload.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the payload is still held in the inline buffer.
    pub fn is_inline(&self) -> bool {
        matches!(self.payload, Payload::Inline { .. })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.payload.as_slice()
    }

    /// Appends `bytes`, moving the payload to the heap once it outgrows the inline buffer.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        let new_len = self.check_growth(bytes.len())?;

        match &mut self.payload {
            Payload::Inline { len, buf } if new_len <= INLINE_CAPACITY => {
                buf[usize::from(*len)..new_len].copy_from_slice(bytes);
                *len = new_len as u8;
            }
            Payload::Inline { len, buf } => {
                let mut heap = BytesMut::with_capacity(new_len);
                heap.extend_from_slice(&buf[..usize::from(*len)]);
                heap.extend_from_slice(bytes);
                self.payload = Payload::Heap(heap);
            }
            Payload::Heap(heap) => heap.extend_from_slice(bytes),
        }
        Ok(())
    }

    /// Appends an owned chunk. A large first chunk is adopted without copying.
    pub fn append(&mut self, chunk: BytesMut) -> Result<()> {
        if self.is_empty() && chunk.len() > INLINE_CAPACITY {
            self.check_growth(chunk.len())?;
            self.payload = Payload::Heap(chunk);
            return Ok(());
        }
        self.extend(&chunk)
    }

    fn check_growth(&self, additional: usize) -> Result<usize> {
        match self.len().checked_add(additional) {
            Some(new_len) if new_len <= MAX_PAYLOAD_LENGTH => Ok(new_len),
            _ => Err(WebSocketError::PayloadTooLarge),
        }
    }

    /// Converts the message into a single, final, unmasked frame.
    pub fn into_frame(self) -> Frame {
        let payload = match self.payload {
            Payload::Inline { len, buf } => BytesMut::from(&buf[..usize::from(len)]),
            Payload::Heap(heap) => heap,
        };
        Frame::new(true, self.opcode, None, payload)
    }

    /// Converts the message into application data, validating UTF-8 for text.
    pub fn into_data(self) -> Result<Data> {
        let is_text = self.is_text();
        let bytes = match self.payload {
            Payload::Inline { len, buf } => Bytes::copy_from_slice(&buf[..usize::from(len)]),
            Payload::Heap(heap) => heap.freeze(),
        };

        if is_text {
            std::str::from_utf8(&bytes)
                .map(|text| Data::Text(text.to_owned()))
                .map_err(|_| WebSocketError::InvalidUTF8)
        } else {
            Ok(Data::Binary(bytes))
        }
    }
}

impl TryFrom<Data> for Message {
    type Error = WebSocketError;

    fn try_from(data: Data) -> Result<Self> {
        match data {
            Data::Text(text) => Message::text(text),
            Data::Binary(bytes) if bytes.len() > INLINE_CAPACITY => {
                if bytes.len() > MAX_PAYLOAD_LENGTH {
                    return Err(WebSocketError::MessageTooLarge(bytes.len()));
                }
                Ok(Message {
                    opcode: OpCode::Binary,
                    payload: Payload::Heap(BytesMut::from(&bytes[..])),
                })
            }
            Data::Binary(bytes) => Message::binary(bytes),
        }
    }
}

/// Application payload exchanged through [`WebSocket`](crate::WebSocket).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    /// UTF-8 text, sent as a text message.
    Text(String),
    /// Raw bytes, sent as a binary message.
    Binary(Bytes),
}

impl Data {
    pub fn len(&self) -> usize {
        match self {
            Data::Text(text) => text.len(),
            Data::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Data::Text(text) => Some(text),
            Data::Binary(_) => None,
        }
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::Text(value.to_owned())
    }
}

impl From<String> for Data {
    fn from(value: String) -> Self {
        Data::Text(value)
    }
}

impl From<Bytes> for Data {
    fn from(value: Bytes) -> Self {
        Data::Binary(value)
    }
}

impl From<Vec<u8>> for Data {
    fn from(value: Vec<u8>) -> Self {
        Data::Binary(value.into())
    }
}

impl From<&[u8]> for Data {
    fn from(value: &[u8]) -> Self {
        Data::Binary(Bytes::copy_from_slice(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_stays_inline() {
        let message = Message::text("hello").unwrap();
        assert!(message.is_inline());
        assert_eq!(message.as_bytes(), b"hello");

        let message = Message::binary([7u8; 125]).unwrap();
        assert!(message.is_inline());
        assert_eq!(message.len(), 125);
    }

    #[test]
    fn test_extend_promotes_to_heap() {
        let mut message = Message::empty(OpCode::Binary);
        message.extend(&[1u8; 100]).unwrap();
        assert!(message.is_inline());

        message.extend(&[2u8; 100]).unwrap();
        assert!(!message.is_inline());
        assert_eq!(message.len(), 200);
        assert_eq!(&message.as_bytes()[..100], &[1u8; 100][..]);
        assert_eq!(&message.as_bytes()[100..], &[2u8; 100][..]);
    }

    #[test]
    fn test_append_adopts_large_first_chunk() {
        let mut message = Message::empty(OpCode::Binary);
        message.append(BytesMut::from(&[9u8; 4096][..])).unwrap();
        assert!(!message.is_inline());
        assert_eq!(message.len(), 4096);

        message.append(BytesMut::from(&b"tail"[..])).unwrap();
        assert_eq!(message.len(), 4100);
        assert_eq!(&message.as_bytes()[4096..], b"tail");
    }

    #[test]
    fn test_cap_is_enforced() {
        let mut message = Message::empty(OpCode::Binary);
        message.append(BytesMut::zeroed(MAX_PAYLOAD_LENGTH)).unwrap();

        let err = message.extend(&[0]).unwrap_err();
        assert!(matches!(err, WebSocketError::PayloadTooLarge));
        assert_eq!(message.len(), MAX_PAYLOAD_LENGTH);

        let err = Message::binary(vec![0u8; MAX_PAYLOAD_LENGTH + 1]).unwrap_err();
        assert!(matches!(err, WebSocketError::MessageTooLarge(n) if n == MAX_PAYLOAD_LENGTH + 1));
    }

    #[test]
    fn test_into_data_validates_utf8() {
        let mut message = Message::empty(OpCode::Text);
        message.extend(&[0xFF, 0xFE]).unwrap();
        assert!(matches!(message.into_data(), Err(WebSocketError::InvalidUTF8)));

        let data = Message::text("héllo").unwrap().into_data().unwrap();
        assert_eq!(data, Data::Text("héllo".into()));

        let data = Message::binary([0xFF, 0xFE]).unwrap().into_data().unwrap();
        assert_eq!(data, Data::Binary(Bytes::from_static(&[0xFF, 0xFE])));
    }

    #[test]
    fn test_into_frame() {
        let frame = Message::binary(vec![3u8; 300]).unwrap().into_frame();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(frame.payload.len(), 300);
        assert!(!frame.is_masked());
    }

    #[test]
    fn test_try_from_data() {
        let message = Message::try_from(Data::from("hi")).unwrap();
        assert!(message.is_text());

        let message = Message::try_from(Data::from(vec![1u8; 1000])).unwrap();
        assert_eq!(message.opcode(), OpCode::Binary);
        assert_eq!(message.len(), 1000);
    }
}
