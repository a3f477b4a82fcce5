//! Per-connection frame processing.
//!
//! A [`SocketDriver`] owns the upgraded stream and runs as a periodic item. Each tick it
//! writes everything the facade queued, then looks for one inbound frame without waiting.
//! Once the first byte of a frame is there, the rest of the frame is read with the stream's
//! I/O timeout. Messages, peer closes and failures are posted back to the facade.
use std::sync::Arc;

use bytes::BytesMut;
use futures::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc::UnboundedSender,
    time::{Duration, Instant},
};
use tokio_util::codec::Encoder as _;

use crate::{
    close::CloseCode,
    codec::{Decoder, Encoder, FrameHeader},
    executor::PeriodicItem,
    stream::{MaybeTlsStream, NetworkStream},
    websocket::{Posted, Signal},
    Frame, Message, OpCode, Options, Result, SendQueue, WebSocketError,
};

/// Outcome of one [`SocketDriver::process`] call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Processed {
    /// A frame was received; another tick follows right away.
    SomethingHappened,
    /// No inbound data; the next tick waits for the tick interval.
    NothingHappened,
}

/// Channel back to the facade, tagged with the connection attempt it belongs to.
#[derive(Clone)]
pub(crate) struct Outbox {
    attempt: u64,
    tx: UnboundedSender<Posted>,
}

impl Outbox {
    pub(crate) fn new(attempt: u64, tx: UnboundedSender<Posted>) -> Self {
        Self { attempt, tx }
    }

    pub(crate) fn post(&self, signal: Signal) {
        // the facade is gone, nobody is listening
        let _ = self.tx.send(Posted {
            attempt: self.attempt,
            signal,
        });
    }
}

/// Drives an open WebSocket connection.
pub struct SocketDriver<S = MaybeTlsStream> {
    stream: NetworkStream<S>,
    decoder: Decoder,
    queue: Arc<SendQueue>,
    /// Message being reassembled from fragments.
    pending: Option<Message>,
    outbox: Outbox,
    tick_interval: Duration,
    next_execution: Instant,
    write_buf: BytesMut,
    failed: bool,
    closed: bool,
}

impl<S> SocketDriver<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        stream: NetworkStream<S>,
        queue: Arc<SendQueue>,
        options: &Options,
        outbox: Outbox,
    ) -> Self {
        Self {
            stream,
            decoder: Decoder::new(options.max_payload),
            queue,
            pending: None,
            outbox,
            tick_interval: options.tick_interval,
            next_execution: Instant::now(),
            write_buf: BytesMut::new(),
            failed: false,
            closed: false,
        }
    }

    /// Whether the peer's close frame was received and answered.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Runs one tick: sends the queued messages, then handles at most one inbound frame.
    ///
    /// # Errors
    /// Any I/O failure or protocol violation. The connection is unusable afterwards.
    pub async fn process(&mut self) -> Result<Processed> {
        while let Some(message) = self.queue.pop() {
            log::trace!("sending {:?}", message);
            self.write_frame(message.into_frame()).await?;
        }

        let Some(first) = self.stream.try_read_byte()? else {
            return Ok(Processed::NothingHappened);
        };

        let header = self.decoder.read_header(first, &mut self.stream).await?;
        if header.opcode.is_control() {
            let mut payload = BytesMut::with_capacity(header.payload_len);
            self.decoder
                .read_payload(&header, &mut self.stream, &mut payload)
                .await?;
            self.on_control(header.opcode, payload).await?;
        } else {
            self.on_data(&header).await?;
        }

        Ok(Processed::SomethingHappened)
    }

    async fn on_control(&mut self, opcode: OpCode, payload: BytesMut) -> Result<()> {
        match opcode {
            OpCode::Ping => {
                log::trace!("ping ({} bytes), answering", payload.len());
                self.write_frame(Frame::pong(payload)).await
            }
            OpCode::Pong => Ok(()),
            OpCode::Close => {
                if payload.len() == 1 {
                    return Err(WebSocketError::InvalidCloseFrame);
                }
                let code = Frame::close_raw(&payload).close_code();
                if code.is_some_and(|code| !code.is_allowed())
                    || payload.get(2..).is_some_and(|reason| std::str::from_utf8(reason).is_err())
                {
                    return Err(WebSocketError::InvalidCloseFrame);
                }
                log::debug!("peer closed the connection ({code:?})");

                self.write_frame(Frame::close_raw(&payload)).await?;
                self.closed = true;
                self.outbox.post(Signal::PeerClosed);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_data(&mut self, header: &FrameHeader) -> Result<()> {
        match (header.opcode, self.pending.is_some()) {
            (OpCode::Continuation, false) => return Err(WebSocketError::InvalidContinuationFrame),
            (OpCode::Text | OpCode::Binary, true) => return Err(WebSocketError::InvalidFragment),
            _ => {}
        }

        let pending = self
            .pending
            .get_or_insert_with(|| Message::empty(header.opcode));
        if pending.len() + header.payload_len > self.decoder.max_payload() {
            return Err(WebSocketError::PayloadTooLarge);
        }

        let mut payload = BytesMut::with_capacity(header.payload_len);
        self.decoder
            .read_payload(header, &mut self.stream, &mut payload)
            .await?;
        pending.append(payload)?;

        if header.fin {
            if let Some(message) = self.pending.take() {
                log::trace!("received {:?}", message);
                let data = message.into_data()?;
                self.outbox.post(Signal::Received(data));
            }
        }
        Ok(())
    }

    async fn write_frame(&mut self, mut frame: Frame) -> Result<()> {
        frame.mask();

        self.write_buf.clear();
        Encoder.encode(frame, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn send_close_request(&mut self) -> Result<()> {
        let Some((code, reason)) = self.queue.take_close_request() else {
            return Ok(());
        };

        let frame = match code {
            0 => Frame::close_raw(b""),
            code => Frame::close(CloseCode::from(code), reason),
        };
        self.write_frame(frame).await
    }
}

impl<S> PeriodicItem for SocketDriver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn execution_time(&self) -> Instant {
        self.next_execution
    }

    fn execute(&mut self, now: Instant) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match self.process().await {
                Ok(Processed::SomethingHappened) => self.next_execution = Instant::now(),
                Ok(Processed::NothingHappened) => self.next_execution = now + self.tick_interval,
                Err(err) => {
                    log::debug!("socket processing failed: {err}");
                    self.failed = true;
                    self.outbox.post(Signal::ProcessingError(err));
                }
            }
        })
    }

    fn is_finished(&self) -> bool {
        self.failed || self.closed
    }

    fn finish(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.failed && !self.closed {
                if let Err(err) = self.send_close_request().await {
                    log::debug!("close frame not sent: {err}");
                }
            }
            let _ = self.stream.shutdown().await;
        })
    }
}
