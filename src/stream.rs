//! Byte streams used by the pool and the socket driver.
//!
//! [`MaybeTlsStream`] picks plain TCP or TLS at construction. [`NetworkStream`] wraps it with
//! the behaviour every connection needs once it leaves the pool: a bound on how long a single
//! read or write may stall, an optional cancellation token, a prefix of bytes that were
//! already read by the HTTP layer, and a non-blocking single byte probe.
use std::{
    future::Future,
    io,
    pin::{pin, Pin},
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Buf, Bytes};
use futures::FutureExt;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
    net::TcpStream,
    time::Sleep,
};
use tokio_rustls::client::TlsStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::{Result, WebSocketError};

/// Upper bound for a single read or write to make progress.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// A stream that might be protected with TLS.
#[non_exhaustive]
#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum MaybeTlsStream<S = TcpStream> {
    /// Unencrypted socket stream.
    Plain(S),
    /// Encrypted socket stream using `rustls`.
    Tls(TlsStream<S>),
}

impl<S> From<S> for MaybeTlsStream<S> {
    fn from(value: S) -> Self {
        Self::Plain(value)
    }
}

impl<S> From<TlsStream<S>> for MaybeTlsStream<S> {
    fn from(value: TlsStream<S>) -> Self {
        Self::Tls(value)
    }
}

impl<S> MaybeTlsStream<S> {
    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::Tls(_))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => pin!(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => pin!(s).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => pin!(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => pin!(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => pin!(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => pin!(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => pin!(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => pin!(s).poll_shutdown(cx),
        }
    }
}

/// A connection stream with timeouts, cancellation and a read prefix.
///
/// Reads first drain the prefix, then fall through to the inner stream. Whenever a read or
/// write returns `Pending` a deadline of `timeout` is armed; it is cleared as soon as the
/// operation makes progress. A stalled operation fails with [`WebSocketError::Timeout`] and a
/// cancelled token fails every subsequent read and write with [`WebSocketError::Canceled`]
/// (both delivered inside an `io::Error`, converted back by `From<io::Error>`).
pub struct NetworkStream<S = MaybeTlsStream> {
    inner: S,
    prefix: Bytes,
    timeout: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
    cancel: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    canceled: bool,
}

impl<S> NetworkStream<S> {
    /// Wraps `inner` with the default [`IO_TIMEOUT`].
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            prefix: Bytes::new(),
            timeout: Some(IO_TIMEOUT),
            read_deadline: None,
            write_deadline: None,
            cancel: None,
            canceled: false,
        }
    }

    /// Sets the per-operation timeout. `None` disables it.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
        self.read_deadline = None;
        self.write_deadline = None;
    }

    /// Binds a cancellation token to every subsequent read and write.
    pub fn set_cancel_token(&mut self, token: CancellationToken) {
        self.canceled = token.is_cancelled();
        self.cancel = Some(Box::pin(token.cancelled_owned()));
    }

    /// Prepends bytes that were read from the wire by someone else (the HTTP layer reads past
    /// the end of the upgrade response when the server pipelines its first frame).
    pub fn push_prefix(&mut self, bytes: Bytes) {
        if self.prefix.is_empty() {
            self.prefix = bytes;
        } else {
            let mut joined = Vec::with_capacity(bytes.len() + self.prefix.len());
            joined.extend_from_slice(&bytes);
            joined.extend_from_slice(&self.prefix);
            self.prefix = joined.into();
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn poll_canceled(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if !self.canceled {
            if let Some(cancel) = self.cancel.as_mut() {
                self.canceled = cancel.as_mut().poll(cx).is_ready();
            }
        }

        if self.canceled {
            return Err(WebSocketError::Canceled.into());
        }
        Ok(())
    }
}

/// Arms the deadline in `slot` if needed and fails once it elapses.
fn poll_deadline(
    slot: &mut Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
    cx: &mut Context<'_>,
) -> io::Result<()> {
    let Some(timeout) = timeout else {
        return Ok(());
    };

    let sleep = slot.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
    if sleep.as_mut().poll(cx).is_ready() {
        *slot = None;
        return Err(WebSocketError::Timeout.into());
    }
    Ok(())
}

impl<S: AsyncRead + Unpin> NetworkStream<S> {
    /// Returns the next byte if one is available right now, without waiting.
    ///
    /// `Ok(None)` means nothing has arrived yet. End of stream yields
    /// [`WebSocketError::ConnectionClosed`]. No deadline is armed by this call.
    pub fn try_read_byte(&mut self) -> Result<Option<u8>> {
        if !self.canceled {
            if let Some(cancel) = self.cancel.as_mut() {
                self.canceled = cancel.as_mut().now_or_never().is_some();
            }
        }
        if self.canceled {
            return Err(WebSocketError::Canceled);
        }

        if !self.prefix.is_empty() {
            return Ok(Some(self.prefix.get_u8()));
        }

        match self.inner.read_u8().now_or_never() {
            None => Ok(None),
            Some(Ok(byte)) => Ok(Some(byte)),
            Some(Err(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Err(WebSocketError::ConnectionClosed)
            }
            Some(Err(err)) => Err(err.into()),
        }
    }

    /// Checks an idle connection for a peer close.
    ///
    /// Nothing should arrive on an idle HTTP connection, so end of stream, an error or
    /// unsolicited bytes all mean the connection can no longer be reused.
    pub fn is_closed_while_idle(&mut self) -> bool {
        if !self.prefix.is_empty() {
            return true;
        }

        let mut probe = [0u8; 1];
        self.inner.read(&mut probe).now_or_never().is_some()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for NetworkStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.poll_canceled(cx)?;

        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(res) => {
                this.read_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                poll_deadline(&mut this.read_deadline, this.timeout, cx)?;
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for NetworkStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.poll_canceled(cx)?;

        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(res) => {
                this.write_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                poll_deadline(&mut this.write_deadline, this.timeout, cx)?;
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.poll_canceled(cx)?;

        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(res) => {
                this.write_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                poll_deadline(&mut this.write_deadline, this.timeout, cx)?;
                Poll::Pending
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(res) => {
                this.write_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                poll_deadline(&mut this.write_deadline, this.timeout, cx)?;
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefix_is_read_first() {
        let (client, mut server) = duplex(64);
        let mut stream = NetworkStream::new(client);
        stream.push_prefix(Bytes::from_static(b"ab"));

        server.write_all(b"cd").await.unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[tokio::test]
    async fn test_stalled_read_times_out() {
        let (client, _server) = duplex(64);
        let mut stream = NetworkStream::new(client);
        stream.set_timeout(Some(Duration::from_millis(50)));

        let err = stream.read_u8().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(matches!(WebSocketError::from(err), WebSocketError::Timeout));
    }

    #[tokio::test]
    async fn test_cancel_token_interrupts_read() {
        let (client, _server) = duplex(64);
        let mut stream = NetworkStream::new(client);
        stream.set_timeout(None);

        let token = CancellationToken::new();
        stream.set_cancel_token(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let err = stream.read_u8().await.unwrap_err();
        assert!(matches!(WebSocketError::from(err), WebSocketError::Canceled));
        canceller.await.unwrap();

        assert!(matches!(
            stream.try_read_byte(),
            Err(WebSocketError::Canceled)
        ));
    }

    #[tokio::test]
    async fn test_try_read_byte() {
        let (client, mut server) = duplex(64);
        let mut stream = NetworkStream::new(client);

        assert!(stream.try_read_byte().unwrap().is_none());

        server.write_all(&[0x81]).await.unwrap();
        assert_eq!(stream.try_read_byte().unwrap(), Some(0x81));
        assert!(stream.try_read_byte().unwrap().is_none());

        drop(server);
        assert!(matches!(
            stream.try_read_byte(),
            Err(WebSocketError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_idle_close_detection() {
        let (client, server) = duplex(64);
        let mut stream = NetworkStream::new(client);
        assert!(!stream.is_closed_while_idle());

        drop(server);
        assert!(stream.is_closed_while_idle());
    }
}
