//! The [`WebSocket`] facade.
//!
//! The facade owns the ready state. Background contexts (the handshake task and the socket
//! driver) never touch it: they post [`Posted`] values through a channel, and the owner
//! applies them when it polls for events. Every state change and every event therefore
//! happens inside a `&mut self` method on the owning task.
//!
//! ```text
//!             open()                 101 + valid headers
//!   Closed ──────────► Connecting ─────────────────────► Open
//!     ▲                   │  │                            │
//!     │  handshake error  │  │ close()          close(),  │ peer close,
//!     ├───────────────────┘  └──────► Closing ◄───────────┘ processing error
//!     │                                  │
//!     └──────────────────────────────────┘
//! ```
use std::{
    collections::VecDeque,
    future::{poll_fn, Future},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Stream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use url::Url;

use crate::{
    close::CloseCode,
    driver::{Outbox, SocketDriver},
    executor::{Executor, PeriodicHandle},
    handshake::{Handshake, Upgraded},
    pool::ConnectionPool,
    Data, Message, Options, Result, SendQueue, WebSocketError,
};

/// Longest close reason that fits in a control frame next to the status code.
const MAX_CLOSE_REASON: usize = 123;

/// Connection state, numbered like the browser API.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

/// Notifications delivered to the owner of a [`WebSocket`].
#[derive(Debug)]
pub enum Event {
    /// The handshake succeeded; [`WebSocket::send`] is now allowed.
    Open,
    /// A complete message arrived.
    Message(Data),
    /// Something failed. Always accompanied by a transition to [`ReadyState::Closed`].
    Error(WebSocketError),
    /// The connection was closed, locally or by the peer.
    Close,
    ReadyStateChange(ReadyState),
}

/// Subprotocols offered in the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Protocols(Vec<String>);

impl Protocols {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for Protocols {
    fn from(value: &str) -> Self {
        if value.is_empty() {
            Self::none()
        } else {
            Self(vec![value.to_owned()])
        }
    }
}

impl From<String> for Protocols {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<Vec<String>> for Protocols {
    fn from(value: Vec<String>) -> Self {
        Self(value)
    }
}

impl From<&[&str]> for Protocols {
    fn from(value: &[&str]) -> Self {
        Self(value.iter().map(|p| (*p).to_owned()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Protocols {
    fn from(value: [&str; N]) -> Self {
        Self::from(&value[..])
    }
}

/// Result posted by a background context.
pub(crate) enum Signal {
    Connected(Upgraded),
    ConnectFailed(WebSocketError),
    Received(Data),
    PeerClosed,
    ProcessingError(WebSocketError),
}

pub(crate) struct Posted {
    /// Connection attempt the signal belongs to; signals of earlier attempts are dropped.
    pub(crate) attempt: u64,
    pub(crate) signal: Signal,
}

/// A WebSocket client connection.
///
/// # Example
/// ```no_run
/// use pooled_ws::{ConnectionPool, Event, Executor, ReadyState, WebSocket};
///
/// # async fn run() -> pooled_ws::Result<()> {
/// let executor = Executor::current();
/// let mut ws = WebSocket::new(ConnectionPool::new(executor.clone()), executor);
///
/// ws.open("wss://echo.example.com/", ["chat", "superchat"])?;
/// while let Some(event) = ws.next_event().await {
///     if let Event::Open = event {
///         println!("negotiated {:?}", ws.protocol());
///         ws.close(1000, "")?;
///     }
/// }
/// assert_eq!(ws.ready_state(), ReadyState::Closed);
/// # Ok(())
/// # }
/// ```
pub struct WebSocket {
    state: ReadyState,
    url: Option<Url>,
    protocol: Option<String>,
    options: Options,
    pool: ConnectionPool,
    executor: Executor,
    queue: Arc<SendQueue>,
    tx: UnboundedSender<Posted>,
    rx: UnboundedReceiver<Posted>,
    attempt: u64,
    /// Token of the current attempt, bound to the handshake and to the upgraded stream.
    cancel: Option<CancellationToken>,
    canceled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    driver: Option<PeriodicHandle>,
    events: VecDeque<Event>,
}

impl WebSocket {
    pub fn new(pool: ConnectionPool, executor: Executor) -> Self {
        Self::with_options(pool, executor, Options::default())
    }

    pub fn with_options(pool: ConnectionPool, executor: Executor, options: Options) -> Self {
        let (tx, rx) = unbounded_channel();

        Self {
            state: ReadyState::Closed,
            url: None,
            protocol: None,
            options,
            pool,
            executor,
            queue: Arc::new(SendQueue::new()),
            tx,
            rx,
            attempt: 0,
            cancel: None,
            canceled: None,
            driver: None,
            events: VecDeque::new(),
        }
    }

    /// Starts connecting to `url` in the background.
    ///
    /// Only allowed while [`ReadyState::Closed`]. The outcome is reported as [`Event::Open`]
    /// or [`Event::Error`].
    pub fn open(&mut self, url: &str, protocols: impl Into<Protocols>) -> Result<()> {
        if self.state != ReadyState::Closed {
            return Err(WebSocketError::InvalidState("open"));
        }

        let url = Url::parse(url)?;
        let protocols: Protocols = protocols.into();
        let mut handshake = Handshake::new(url.clone(), protocols.0, self.options.clone())?;

        self.attempt += 1;
        let outbox = Outbox::new(self.attempt, self.tx.clone());
        let cancel = self.executor.cancel_token();
        let pool = self.pool.clone();
        let token = cancel.clone();

        log::debug!("connecting to {url} (attempt {})", self.attempt);
        // the handle is not kept: cancellation is observed through `canceled`
        let _ = self.executor.schedule_work(&cancel, async move {
            match handshake.perform(&pool, &token).await {
                Ok(upgraded) => outbox.post(Signal::Connected(upgraded)),
                Err(err) => outbox.post(Signal::ConnectFailed(err)),
            }
        });

        self.url = Some(url);
        self.protocol = None;
        self.queue = Arc::new(SendQueue::new());
        self.canceled = Some(Box::pin(cancel.clone().cancelled_owned()));
        self.cancel = Some(cancel);
        self.set_state(ReadyState::Connecting);
        Ok(())
    }

    /// Closes the connection.
    ///
    /// `code` is 0 for no status code, 1000, or 3000-4999; `reason` is at most 123 bytes and
    /// requires a code. While connecting the handshake is canceled; while open the driver is
    /// stopped and sends a close frame on its way out. Either way the socket is
    /// [`ReadyState::Closed`] when this returns and [`Event::Close`] is queued.
    pub fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let valid_code = match code {
            0 => reason.is_empty(),
            code => CloseCode::from(code).is_sendable(),
        };
        if !valid_code || reason.len() > MAX_CLOSE_REASON {
            return Err(WebSocketError::InvalidCloseCode);
        }

        if self.state == ReadyState::Closed {
            return Err(WebSocketError::InvalidState("close"));
        }

        if self.state == ReadyState::Open {
            self.queue.request_close(code, reason);
        }
        self.shutdown();
        Ok(())
    }

    /// Queues `data` for sending. Text is sent as a text message, bytes as a binary one.
    pub fn send(&mut self, data: impl Into<Data>) -> Result<()> {
        if self.state != ReadyState::Open {
            return Err(WebSocketError::InvalidState("send"));
        }

        let message = Message::try_from(data.into())?;
        self.queue.push(message);
        Ok(())
    }

    /// Payload bytes queued by [`WebSocket::send`] and not yet written.
    pub fn buffered_amount(&self) -> usize {
        self.queue.buffered_amount()
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state
    }

    /// URL of the last call to [`WebSocket::open`].
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Subprotocol selected by the server.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Returns the next event if one is ready, without waiting.
    pub fn poll_event(&mut self) -> Option<Event> {
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        match self.poll_next_event(&mut cx) {
            Poll::Ready(event) => event,
            Poll::Pending => None,
        }
    }

    /// Waits for the next event.
    ///
    /// Resolves to `None` once the socket is closed and every event was delivered.
    pub async fn next_event(&mut self) -> Option<Event> {
        poll_fn(|cx| self.poll_next_event(cx)).await
    }

    pub fn poll_next_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Poll::Ready(Some(event));
            }

            if let Poll::Ready(Some(posted)) = self.rx.poll_recv(cx) {
                self.apply(posted);
                continue;
            }

            // canceled from outside, most likely by Executor::terminate
            if let Some(canceled) = self.canceled.as_mut() {
                if canceled.as_mut().poll(cx).is_ready() {
                    self.canceled = None;
                    self.fail(WebSocketError::Canceled);
                    continue;
                }
            }

            if self.state == ReadyState::Closed {
                return Poll::Ready(None);
            }
            return Poll::Pending;
        }
    }

    fn apply(&mut self, posted: Posted) {
        if posted.attempt != self.attempt {
            log::trace!("dropping signal of stale attempt {}", posted.attempt);
            return;
        }

        match (self.state, posted.signal) {
            (ReadyState::Connecting, Signal::Connected(upgraded)) => {
                self.protocol = upgraded.protocol;
                let driver = SocketDriver::new(
                    upgraded.stream,
                    self.queue.clone(),
                    &self.options,
                    Outbox::new(self.attempt, self.tx.clone()),
                );
                self.driver = Some(self.executor.add_periodic(driver));

                self.set_state(ReadyState::Open);
                self.events.push_back(Event::Open);
            }
            (ReadyState::Connecting, Signal::ConnectFailed(err)) => self.fail(err),
            (ReadyState::Open, Signal::Received(data)) => self.events.push_back(Event::Message(data)),
            (ReadyState::Open, Signal::PeerClosed) => self.shutdown(),
            (ReadyState::Open, Signal::ProcessingError(err)) => self.fail(err),
            (state, _) => log::trace!("signal ignored in state {state:?}"),
        }
    }

    /// Collapses the socket to Closed and reports `err`. An open socket is closed first.
    fn fail(&mut self, err: WebSocketError) {
        match self.state {
            ReadyState::Closed => return,
            ReadyState::Connecting => {
                self.release_attempt();
                self.set_state(ReadyState::Closed);
            }
            ReadyState::Open | ReadyState::Closing => self.shutdown(),
        }
        self.events.push_back(Event::Error(err));
    }

    fn shutdown(&mut self) {
        self.release_attempt();
        self.queue.flush_all();

        self.set_state(ReadyState::Closing);
        self.set_state(ReadyState::Closed);
        self.events.push_back(Event::Close);
    }

    /// Stops the background work of the current attempt and disowns its signals.
    fn release_attempt(&mut self) {
        if let Some(driver) = self.driver.take() {
            // finishes in the background, sending the close frame if one was requested
            let _ = driver.remove();
        }

        if let Some(cancel) = self.cancel.take() {
            if self.state == ReadyState::Connecting {
                cancel.cancel();
            }
        }
        self.canceled = None;
        self.attempt += 1;
    }

    fn set_state(&mut self, state: ReadyState) {
        if self.state != state {
            log::debug!("ready state {:?} -> {state:?}", self.state);
            self.state = state;
            self.events.push_back(Event::ReadyStateChange(state));
        }
    }
}

impl Stream for WebSocket {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_next_event(cx)
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        match self.state {
            ReadyState::Open => self.queue.request_close(u16::from(CloseCode::Away), ""),
            ReadyState::Connecting => {
                if let Some(cancel) = self.cancel.take() {
                    cancel.cancel();
                }
            }
            _ => {}
        }
    }
}
