//! Frame encoding and decoding.
//!
//! Encoding is synchronous: [`Encoder`] serializes [`Frame`]s into a buffer (it plugs into
//! `tokio_util`'s `Encoder` trait) and [`encode`] does the same for a bare payload.
//!
//! Decoding reads straight from the connection. The driver probes for a frame's first byte
//! without blocking and, once a frame has started, [`Decoder::read_header`] and
//! [`Decoder::read_payload`] read the rest, each bounded by the stream's I/O timeout. Every
//! header check (reserved bits, opcode, control frame rules, payload cap) runs before a single
//! payload byte is consumed.
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec;

use crate::{
    frame::{self, Frame, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    mask::apply_mask,
    message::MAX_PAYLOAD_LENGTH,
    OpCode, Result, WebSocketError,
};

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Indicates if this is the final fragment in a message.
    pub fin: bool,
    pub opcode: OpCode,
    /// Masking key. Servers must not mask, but a masked frame is still accepted and unmasked.
    pub mask: Option<[u8; 4]>,
    /// Payload length in bytes, already checked against the decoder's cap.
    pub payload_len: usize,
}

/// Reads frame headers and payloads, enforcing the protocol limits.
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum allowed size for a single frame payload.
    max_payload: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_LENGTH)
    }
}

impl Decoder {
    /// Creates a new `Decoder` rejecting payloads above `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Reads a complete frame header from `stream`.
    pub async fn decode_header<R>(&self, stream: &mut R) -> Result<FrameHeader>
    where
        R: AsyncRead + Unpin,
    {
        let first = read_header_u8(stream).await?;
        self.read_header(first, stream).await
    }

    /// Reads the remainder of a header whose first byte was already consumed.
    ///
    /// # Errors
    /// - [`WebSocketError::TruncatedHeader`] if the stream ends before the header is complete
    /// - [`WebSocketError::ReservedBitsNotZero`], [`WebSocketError::InvalidOpCode`]
    /// - [`WebSocketError::ControlFrameFragmented`], [`WebSocketError::ControlFrameTooLarge`]
    /// - [`WebSocketError::PayloadTooLarge`] when the declared length is above the cap
    pub async fn read_header<R>(&self, first: u8, stream: &mut R) -> Result<FrameHeader>
    where
        R: AsyncRead + Unpin,
    {
        // no extensions are negotiated, so RSV1-3 must all be clear
        if first & 0b0111_0000 != 0 {
            return Err(WebSocketError::ReservedBitsNotZero);
        }

        let fin = first & 0b1000_0000 != 0;
        let opcode = OpCode::try_from(first & 0b0000_1111)?;
        if opcode.is_control() && !fin {
            return Err(WebSocketError::ControlFrameFragmented);
        }

        let second = read_header_u8(stream).await?;
        let masked = second & 0b1000_0000 != 0;
        let length_code = second & 0x7F;

        if opcode.is_control() && usize::from(length_code) > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }

        let payload_len = match length_code {
            126 => {
                let mut buf = [0u8; 2];
                read_header_exact(stream, &mut buf).await?;
                usize::from(u16::from_be_bytes(buf))
            }
            127 => {
                let mut buf = [0u8; 8];
                read_header_exact(stream, &mut buf).await?;
                usize::try_from(u64::from_be_bytes(buf))
                    .map_err(|_| WebSocketError::PayloadTooLarge)?
            }
            len => usize::from(len),
        };

        if payload_len > self.max_payload {
            return Err(WebSocketError::PayloadTooLarge);
        }

        let mask = if masked {
            let mut key = [0u8; 4];
            read_header_exact(stream, &mut key).await?;
            Some(key)
        } else {
            None
        };

        Ok(FrameHeader {
            fin,
            opcode,
            mask,
            payload_len,
        })
    }

    /// Appends the payload described by `header` to `dst`, unmasking it if needed.
    pub async fn read_payload<R>(
        &self,
        header: &FrameHeader,
        stream: &mut R,
        dst: &mut BytesMut,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let start = dst.len();
        dst.resize(start + header.payload_len, 0);

        if let Err(err) = stream.read_exact(&mut dst[start..]).await {
            dst.truncate(start);
            return Err(match err.kind() {
                std::io::ErrorKind::UnexpectedEof => WebSocketError::ConnectionClosed,
                _ => err.into(),
            });
        }

        if let Some(mask) = header.mask {
            apply_mask(&mut dst[start..], mask);
        }
        Ok(())
    }

    /// Reads one whole frame.
    pub async fn read_frame<R>(&self, stream: &mut R) -> Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        let header = self.decode_header(stream).await?;
        let mut payload = BytesMut::with_capacity(header.payload_len);
        self.read_payload(&header, stream, &mut payload).await?;

        Ok(Frame::new(header.fin, header.opcode, None, payload))
    }
}

async fn read_header_u8<R: AsyncRead + Unpin>(stream: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    read_header_exact(stream, &mut byte).await?;
    Ok(byte[0])
}

async fn read_header_exact<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut [u8]) -> Result<()> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(WebSocketError::TruncatedHeader)
        }
        Err(err) => Err(err.into()),
    }
}

/// WebSocket frame encoder.
///
/// Writes the header and appends the payload as-is; call [`Frame::mask`] beforehand for
/// client-to-server frames.
pub struct Encoder;

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

/// Serializes a single frame carrying `payload`.
///
/// When `masking_required` is set a random key is generated and **`payload` is masked in
/// place**: the caller's buffer holds masked bytes after this returns.
pub fn encode(
    opcode: OpCode,
    payload: &mut [u8],
    is_final: bool,
    masking_required: bool,
) -> BytesMut {
    let mask = masking_required.then(rand::random::<[u8; 4]>);
    if let Some(mask) = mask {
        apply_mask(payload, mask);
    }

    let mut head = [0u8; MAX_HEAD_SIZE];
    let size = frame::write_head(&mut head, is_final, opcode, payload.len(), mask);

    let mut dst = BytesMut::with_capacity(size + payload.len());
    dst.extend_from_slice(&head[..size]);
    dst.extend_from_slice(payload);
    dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio_util::codec::Encoder as _;

    const SIZES: [usize; 7] = [0, 1, 125, 126, 65535, 65536, MAX_PAYLOAD_LENGTH];

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_round_trip_sizes() {
        let decoder = Decoder::default();

        for len in SIZES {
            for masked in [false, true] {
                let original = pattern(len);
                let mut payload = original.clone();
                let wire = encode(OpCode::Binary, &mut payload, true, masked);

                let mut src = &wire[..];
                let frame = decoder.read_frame(&mut src).await.unwrap();

                assert!(frame.fin);
                assert_eq!(frame.opcode, OpCode::Binary);
                assert_eq!(frame.payload.len(), len, "len {len} masked {masked}");
                assert!(frame.payload[..] == original[..], "len {len} masked {masked}");
                assert!(src.is_empty());
            }
        }
    }

    #[test]
    fn test_encode_masks_in_place() {
        let original = b"mask me please".to_vec();
        let mut payload = original.clone();
        let wire = encode(OpCode::Text, &mut payload, true, true);

        assert_ne!(payload, original);
        // FIN + text, MASK + len
        assert_eq!(wire[0], 0x81);
        assert_eq!(wire[1], 0x80 | original.len() as u8);

        let key = [wire[2], wire[3], wire[4], wire[5]];
        apply_mask(&mut payload, key);
        assert_eq!(payload, original);
        assert_eq!(&wire[6..], &{
            let mut masked = original.clone();
            apply_mask(&mut masked, key);
            masked
        }[..]);
    }

    #[test]
    fn test_encode_unmasked_fragment() {
        let mut payload = b"abc".to_vec();
        let wire = encode(OpCode::Text, &mut payload, false, false);

        assert_eq!(&wire[..], b"\x01\x03abc");
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn test_encoder_writes_frame() {
        let mut frame = Frame::text("hello");
        frame.mask();

        let mut dst = BytesMut::new();
        Encoder.encode(frame.clone(), &mut dst).unwrap();

        assert_eq!(dst.len(), 2 + 4 + 5);
        assert_eq!(dst[0], 0x81);
        assert_eq!(dst[1], 0x85);
        assert_eq!(&dst[6..], &frame.payload[..]);
    }

    #[tokio::test]
    async fn test_oversized_rejected_before_payload() {
        let (mut client, mut server) = duplex(64);

        let mut head = [0u8; 10];
        head[0] = 0x82;
        head[1] = 127;
        head[2..].copy_from_slice(&((MAX_PAYLOAD_LENGTH as u64) + 1).to_be_bytes());
        server.write_all(&head).await.unwrap();
        // no payload follows and the writer stays open: reading it would hang
        let err = Decoder::default().decode_header(&mut client).await.unwrap_err();
        assert!(matches!(err, WebSocketError::PayloadTooLarge));

        let err = Decoder::new(16)
            .decode_header(&mut &[0x82u8, 17][..])
            .await
            .unwrap_err();
        assert!(matches!(err, WebSocketError::PayloadTooLarge));
        drop(server);
    }

    #[tokio::test]
    async fn test_control_frame_limits() {
        let decoder = Decoder::default();

        // ping with a 16-bit length of 126
        let err = decoder
            .decode_header(&mut &[0x89u8, 126, 0, 126][..])
            .await
            .unwrap_err();
        assert!(matches!(err, WebSocketError::ControlFrameTooLarge));

        // ping without FIN
        let err = decoder
            .decode_header(&mut &[0x09u8, 0][..])
            .await
            .unwrap_err();
        assert!(matches!(err, WebSocketError::ControlFrameFragmented));

        let header = decoder
            .decode_header(&mut &[0x89u8, 125][..])
            .await
            .unwrap();
        assert_eq!(header.payload_len, 125);
        assert_eq!(header.opcode, OpCode::Ping);
    }

    #[tokio::test]
    async fn test_invalid_headers() {
        let decoder = Decoder::default();

        let err = decoder.decode_header(&mut &[0xC1u8, 0][..]).await.unwrap_err();
        assert!(matches!(err, WebSocketError::ReservedBitsNotZero));

        let err = decoder.decode_header(&mut &[0x83u8, 0][..]).await.unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidOpCode(3)));
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let decoder = Decoder::default();

        for bytes in [&[][..], &[0x81][..], &[0x81, 126, 0][..], &[0x81, 0x85, 1, 2][..]] {
            let err = decoder.decode_header(&mut &bytes[..]).await.unwrap_err();
            assert!(matches!(err, WebSocketError::TruncatedHeader), "{bytes:?}");
        }
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let err = Decoder::default()
            .read_frame(&mut &[0x82u8, 4, 1, 2][..])
            .await
            .unwrap_err();
        assert!(matches!(err, WebSocketError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_zero_length_payload() {
        let frame = Decoder::default()
            .read_frame(&mut &[0x8Au8, 0][..])
            .await
            .unwrap();
        assert_eq!(frame.opcode, OpCode::Pong);
        assert!(frame.payload.is_empty());
    }
}
