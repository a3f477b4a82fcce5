//! HTTP/1.1 Upgrade handshake over a pooled connection.
//!
//! The request is sent with hyper's HTTP/1 client connection, driven in place instead of
//! being spawned, so that once the response arrives the raw stream (and whatever hyper read
//! past the response head) can be taken back with `Connection::into_parts`. On a 101 the
//! stream is detached from the pool and becomes the WebSocket stream; on any other status a
//! keep-alive connection goes back to the pool.
use std::{
    future::{poll_fn, Future},
    pin::pin,
    task::Poll,
};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{client::conn::http1, header, HeaderMap, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    pool::{ConnectionPool, PooledConnection},
    stream::NetworkStream,
    Options, Result, WebSocketError,
};

/// Attempts for one handshake: a reset on the first one (typically a stale pooled
/// connection) is retried once.
const MAX_ATTEMPTS: usize = 2;

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

type ClientConnection = http1::Connection<TokioIo<NetworkStream>, Empty<Bytes>>;

/// Progress of a [`Handshake`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    SendingRequest,
    AwaitingResponse,
    Upgraded,
    Failed,
}

/// Result of a successful handshake.
pub struct Upgraded {
    /// The detached stream, with the I/O timeout set and the attempt's token bound to it.
    pub stream: NetworkStream,
    /// Subprotocol selected by the server, if any.
    pub protocol: Option<String>,
}

impl std::fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgraded")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Client side of the opening handshake.
pub struct Handshake {
    url: Url,
    protocols: Vec<String>,
    options: Options,
    key: String,
    state: HandshakeState,
}

impl Handshake {
    /// Prepares a handshake for a `ws://` or `wss://` URL.
    pub fn new(url: Url, protocols: Vec<String>, options: Options) -> Result<Self> {
        match url.scheme() {
            "ws" | "wss" => {}
            _ => return Err(WebSocketError::InvalidHttpScheme),
        }
        if url.host_str().is_none() {
            return Err(WebSocketError::MissingHost);
        }

        Ok(Self {
            url,
            protocols,
            options,
            key: generate_key(),
            state: HandshakeState::NotStarted,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "wss"
    }

    /// Pool key: the host, followed by the port when the URL names one explicitly.
    pub fn hostname(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        }
    }

    /// Runs the handshake to completion.
    ///
    /// Every network operation observes `cancel`; once it fires the handshake fails with
    /// [`WebSocketError::Canceled`] at its next I/O checkpoint.
    pub async fn perform(
        &mut self,
        pool: &ConnectionPool,
        cancel: &CancellationToken,
    ) -> Result<Upgraded> {
        let result = self.run(pool, cancel).await;

        self.state = match result {
            Ok(_) => HandshakeState::Upgraded,
            Err(ref err) => {
                log::debug!("handshake with {} failed: {err}", self.url);
                HandshakeState::Failed
            }
        };
        result
    }

    async fn run(&mut self, pool: &ConnectionPool, cancel: &CancellationToken) -> Result<Upgraded> {
        let hostname = self.hostname();
        let mut attempt = 1;

        loop {
            self.state = HandshakeState::SendingRequest;

            let connection = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WebSocketError::Canceled),
                connection = pool.acquire(&hostname, self.is_tls()) => connection?,
            };
            let mut lease = Lease {
                pool,
                connection: Some(connection),
            };

            let connection = lease.connection()?;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WebSocketError::Canceled),
                opened = connection.open() => opened?,
            }

            match self.transact(lease.connection()?, cancel).await {
                Ok(protocol) => {
                    let stream = lease.detach().ok_or(WebSocketError::ConnectionClosed)?;

                    log::debug!(
                        "upgraded {} (protocol: {})",
                        self.url,
                        protocol.as_deref().unwrap_or("none")
                    );
                    return Ok(Upgraded { stream, protocol });
                }
                Err(err) if attempt < MAX_ATTEMPTS && err.is_connection_reset() => {
                    log::debug!("connection reset during handshake, retrying: {err}");
                    drop(lease);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One request/response exchange on `connection`.
    ///
    /// The stream is lent to hyper for the exchange. It is put back into `connection` after a
    /// 101 (to be detached) or after a non-101 response that leaves the connection reusable;
    /// in every other case it is dropped and the connection ends up closed.
    async fn transact(
        &mut self,
        connection: &mut PooledConnection,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let mut stream = connection
            .take_stream()
            .ok_or(WebSocketError::ConnectionClosed)?;
        stream.set_cancel_token(cancel.clone());

        let request = self.request()?;
        let (mut sender, mut conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(map_hyper_error)?;

        let response = sender.send_request(request);
        self.state = HandshakeState::AwaitingResponse;

        let (response, mut conn_done) = drive(&mut conn, false, response).await?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            let status = response.status().as_u16();
            log::debug!("handshake rejected with status {status}");

            let keep_alive = is_keep_alive(response.version(), response.headers());
            let drained = drive(&mut conn, conn_done, response.into_body().collect()).await;
            drop(sender);

            if keep_alive {
                if let Ok((_, done)) = drained {
                    conn_done = done;
                    if let Some(stream) = finish(conn, conn_done).await {
                        connection.restore_stream(stream);
                    }
                }
            }
            return Err(WebSocketError::InvalidStatusCode(status));
        }

        let protocol = verify(&response, &self.key, &self.options)?;
        if let Some(stream) = finish(conn, conn_done).await {
            connection.restore_stream(stream);
        }
        Ok(protocol)
    }

    fn request(&self) -> Result<Request<Empty<Bytes>>> {
        let mut builder = Request::builder()
            .method("GET")
            .uri(&self.url[url::Position::BeforePath..])
            .header(header::HOST, self.hostname())
            .header(header::USER_AGENT, self.options.user_agent.as_str())
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "upgrade")
            .header(header::SEC_WEBSOCKET_KEY, self.key.as_str())
            .header(header::SEC_WEBSOCKET_VERSION, "13");

        if !self.protocols.is_empty() {
            builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, self.protocols.join(", "));
        }

        builder
            .body(Empty::<Bytes>::new())
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err).into())
    }
}

/// A connection borrowed from the pool for one attempt.
///
/// Dropping the lease releases the connection, which also covers a handshake future dropped
/// halfway through. A connection whose stream is still lent to hyper goes back without it and
/// is forgotten by the pool.
struct Lease<'a> {
    pool: &'a ConnectionPool,
    connection: Option<PooledConnection>,
}

impl Lease<'_> {
    fn connection(&mut self) -> Result<&mut PooledConnection> {
        self.connection
            .as_mut()
            .ok_or(WebSocketError::ConnectionClosed)
    }

    fn detach(mut self) -> Option<NetworkStream> {
        let connection = self.connection.take()?;
        self.pool.detach(connection)
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}

/// Polls the hyper connection together with `fut` until `fut` resolves.
///
/// Returns the output and whether the connection finished along the way.
async fn drive<T, F>(conn: &mut ClientConnection, mut conn_done: bool, fut: F) -> Result<(T, bool)>
where
    F: Future<Output = std::result::Result<T, hyper::Error>>,
{
    let mut fut = pin!(fut);

    poll_fn(|cx| {
        if !conn_done {
            match conn.poll_without_shutdown(cx) {
                Poll::Ready(Ok(())) => conn_done = true,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(map_hyper_error(err))),
                Poll::Pending => {}
            }
        }

        match fut.as_mut().poll(cx) {
            Poll::Ready(Ok(output)) => Poll::Ready(Ok((output, conn_done))),
            Poll::Ready(Err(err)) => Poll::Ready(Err(map_hyper_error(err))),
            Poll::Pending if conn_done => Poll::Ready(Err(WebSocketError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    })
    .await
}

/// Lets the connection wind down without shutting the stream, then takes the stream back,
/// including any bytes hyper already buffered.
async fn finish(mut conn: ClientConnection, conn_done: bool) -> Option<NetworkStream> {
    if !conn_done {
        if let Err(err) = poll_fn(|cx| conn.poll_without_shutdown(cx)).await {
            log::debug!("connection unusable after handshake: {err}");
            return None;
        }
    }

    let parts = conn.into_parts();
    let mut stream = parts.io.into_inner();
    if !parts.read_buf.is_empty() {
        log::trace!("{} bytes read past the response head", parts.read_buf.len());
        stream.push_prefix(parts.read_buf);
    }
    Some(stream)
}

fn is_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let close = header_has_token(headers, header::CONNECTION, "close");
    match version {
        Version::HTTP_11 => !close,
        Version::HTTP_10 => header_has_token(headers, header::CONNECTION, "keep-alive"),
        _ => false,
    }
}

fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

/// Validates a 101 response and returns the negotiated subprotocol.
fn verify<B>(response: &Response<B>, key: &str, options: &Options) -> Result<Option<String>> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(WebSocketError::InvalidStatusCode(
            response.status().as_u16(),
        ));
    }

    let headers = response.headers();

    if !headers
        .get(header::UPGRADE)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if !header_has_token(headers, header::CONNECTION, "upgrade") {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    let accept = headers
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(WebSocketError::MissingAcceptKey)?;
    if options.verify_accept && accept != accept_key(key.as_bytes()) {
        return Err(WebSocketError::InvalidAcceptKey);
    }

    // no extension is ever offered
    if let Some(extensions) = headers
        .get(header::SEC_WEBSOCKET_EXTENSIONS)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.trim().is_empty())
    {
        return Err(WebSocketError::UnsupportedExtension(extensions.to_owned()));
    }

    Ok(headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.trim().to_owned())
        .filter(|h| !h.is_empty()))
}

/// Hyper reports I/O failures of the stream as its own errors; timeouts and cancellation
/// are pulled back out so callers see them as such.
fn map_hyper_error(err: hyper::Error) -> WebSocketError {
    let inner = std::error::Error::source(&err)
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .and_then(|io| io.get_ref())
        .and_then(|inner| inner.downcast_ref::<WebSocketError>());

    match inner {
        Some(WebSocketError::Canceled) => WebSocketError::Canceled,
        Some(WebSocketError::Timeout) => WebSocketError::Timeout,
        _ => WebSocketError::HTTPError(err),
    }
}

pub(crate) fn accept_key(key: &[u8]) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

fn generate_key() -> String {
    use base64::prelude::*;
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}
