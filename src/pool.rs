//! Pool of reusable HTTP connections.
//!
//! Connections are keyed by `(hostname, tls)`. A persistent connection is owned by the pool
//! while idle, handed out by [`ConnectionPool::acquire`] and given back with
//! [`ConnectionPool::release`]. [`ConnectionPool::detach`] takes the stream out for good,
//! which is what a successful WebSocket upgrade does.
//!
//! ```text
//!   acquire ──► in use ──release──► idle ──(idle ≥ 7 s)──► evicted
//!                  │                  ▲ │
//!                  │                  └─┘ acquire (reuse)
//!                  └──detach──► stream owned by the caller, entry forgotten
//! ```
//!
//! An idle-check periodic item runs every [`CHECK_INTERVAL`] while the pool holds
//! connections and is removed again once the pool is empty.
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    time::{timeout, Instant},
};
use tokio_rustls::{
    rustls::{self, pki_types::ServerName, pki_types::TrustAnchor},
    TlsConnector,
};

use crate::{
    executor::{Executor, PeriodicHandle, PeriodicItem},
    stream::{MaybeTlsStream, NetworkStream, IO_TIMEOUT},
    Result, WebSocketError,
};

/// Persistent connections allowed per `(hostname, tls)` key.
pub const MAX_CONNECTIONS_PER_HOST: usize = 6;

/// Idle time after which a pooled connection is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(7);

/// Period of the idle check.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
struct HostKey {
    hostname: String,
    tls: bool,
}

struct Entry {
    id: u64,
    key: HostKey,
    in_use: bool,
    last_used: Instant,
    /// Present while the connection is idle in the pool.
    connection: Option<PooledConnection>,
}

#[derive(Default)]
struct PoolState {
    entries: Vec<Entry>,
    idle_check: Option<PeriodicHandle>,
}

struct Inner {
    state: Mutex<PoolState>,
    executor: Executor,
    connector: Option<TlsConnector>,
    next_id: AtomicU64,
}

/// Bounded set of reusable connections, shared by cloning.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

impl ConnectionPool {
    /// Creates an empty pool whose idle check runs on `executor`.
    pub fn new(executor: Executor) -> Self {
        Self::build(executor, None)
    }

    /// Same as [`ConnectionPool::new`], with a custom TLS connector for `wss` hosts.
    ///
    /// By default a connector trusting the `webpki-roots` certificates is used.
    pub fn with_connector(executor: Executor, connector: TlsConnector) -> Self {
        Self::build(executor, Some(connector))
    }

    fn build(executor: Executor, connector: Option<TlsConnector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(PoolState::default()),
                executor,
                connector,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Hands out a connection for `hostname` (`host` or `host:port`).
    ///
    /// An idle connection for the same key is reused when one is available. Otherwise the
    /// hostname is resolved and a new, not yet opened connection is returned: persistent if the
    /// key has fewer than [`MAX_CONNECTIONS_PER_HOST`] connections, one-shot otherwise.
    pub async fn acquire(&self, hostname: &str, tls: bool) -> Result<PooledConnection> {
        let key = HostKey {
            hostname: hostname.to_owned(),
            tls,
        };

        if let Some(connection) = self.take_idle(&key) {
            log::debug!("reusing connection #{} to {hostname}", connection.id);
            return Ok(connection);
        }

        let address = resolve(hostname, tls).await?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let persistent = {
            let mut state = self.inner.state.lock();
            let count = state.entries.iter().filter(|e| e.key == key).count();
            if count < MAX_CONNECTIONS_PER_HOST {
                state.entries.push(Entry {
                    id,
                    key,
                    in_use: true,
                    last_used: Instant::now(),
                    connection: None,
                });
                true
            } else {
                false
            }
        };

        log::debug!(
            "new {} connection #{id} to {hostname} ({address})",
            if persistent { "persistent" } else { "one-shot" }
        );

        Ok(PooledConnection {
            id,
            hostname: hostname.to_owned(),
            address,
            persistent,
            connector: tls.then(|| self.inner.connector.clone()),
            stream: None,
        })
    }

    fn take_idle(&self, key: &HostKey) -> Option<PooledConnection> {
        let mut state = self.inner.state.lock();

        loop {
            let index = state
                .entries
                .iter()
                .position(|e| !e.in_use && e.key == *key && e.connection.is_some())?;

            let entry = &mut state.entries[index];
            let mut connection = entry.connection.take()?;

            if connection.is_open() && !connection.peer_closed() {
                entry.in_use = true;
                entry.last_used = Instant::now();
                return Some(connection);
            }

            log::debug!("dropping stale connection #{}", connection.id);
            state.entries.remove(index);
        }
    }

    /// Returns a connection obtained from [`ConnectionPool::acquire`].
    ///
    /// One-shot connections are closed. Persistent ones go back to the pool as idle unless they
    /// were closed, in which case they are forgotten.
    pub fn release(&self, mut connection: PooledConnection) {
        if !connection.persistent {
            log::trace!("closing one-shot connection #{}", connection.id);
            return;
        }

        let reusable = connection.is_open() && !connection.peer_closed();

        let mut state = self.inner.state.lock();
        let Some(index) = state.entries.iter().position(|e| e.id == connection.id) else {
            // forgotten by terminate()
            return;
        };

        if !reusable {
            log::debug!("connection #{} closed, removing from pool", connection.id);
            state.entries.remove(index);
            self.disable_check_if_empty(&mut state);
            return;
        }

        let entry = &mut state.entries[index];
        entry.in_use = false;
        entry.last_used = Instant::now();
        entry.connection = Some(connection);

        if state.idle_check.is_none() {
            state.idle_check = Some(self.inner.executor.add_periodic(IdleCheck {
                pool: Arc::downgrade(&self.inner),
                next: Instant::now() + CHECK_INTERVAL,
            }));
        }
    }

    /// Removes `connection` from the pool's bookkeeping and moves its stream to the caller.
    pub fn detach(&self, mut connection: PooledConnection) -> Option<NetworkStream> {
        let mut state = self.inner.state.lock();
        if let Some(index) = state.entries.iter().position(|e| e.id == connection.id) {
            state.entries.remove(index);
            self.disable_check_if_empty(&mut state);
        }

        log::debug!("connection #{} detached from pool", connection.id);
        connection.stream.take()
    }

    /// Closes idle connections unused for at least [`IDLE_TIMEOUT`] as of `now`.
    ///
    /// Connections in use are skipped. Returns the number of evicted connections.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.entries.len();

        state.entries.retain(|entry| {
            let expired =
                !entry.in_use && now.saturating_duration_since(entry.last_used) >= IDLE_TIMEOUT;
            if expired {
                log::debug!("evicting idle connection #{} to {}", entry.id, entry.key.hostname);
            }
            !expired
        });

        let evicted = before - state.entries.len();
        self.disable_check_if_empty(&mut state);
        evicted
    }

    fn disable_check_if_empty(&self, state: &mut PoolState) {
        if state.entries.is_empty() && state.idle_check.take().is_some() {
            log::trace!("pool empty, idle check disabled");
        }
    }

    /// Closes every tracked connection and stops the idle check.
    ///
    /// Connections currently in use are forgotten; releasing them later closes them.
    pub fn terminate(&self) {
        let mut state = self.inner.state.lock();
        log::debug!("terminating pool with {} connections", state.entries.len());
        state.entries.clear();
        state.idle_check = None;
    }

    /// Number of tracked persistent connections, idle or in use.
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn idle_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .filter(|e| !e.in_use)
            .count()
    }

    pub fn is_idle_check_enabled(&self) -> bool {
        self.inner.state.lock().idle_check.is_some()
    }
}

/// Periodic eviction of idle connections.
struct IdleCheck {
    pool: Weak<Inner>,
    next: Instant,
}

impl PeriodicItem for IdleCheck {
    fn execution_time(&self) -> Instant {
        self.next
    }

    fn execute(&mut self, now: Instant) -> BoxFuture<'_, ()> {
        if let Some(inner) = self.pool.upgrade() {
            ConnectionPool { inner }.evict_idle(now);
        }
        self.next = now + CHECK_INTERVAL;
        Box::pin(async {})
    }

    fn is_finished(&self) -> bool {
        self.pool.strong_count() == 0
    }
}

/// A connection handed out by the pool.
pub struct PooledConnection {
    id: u64,
    hostname: String,
    address: SocketAddr,
    persistent: bool,
    /// `Some` for TLS connections; the inner `None` selects the default connector.
    connector: Option<Option<TlsConnector>>,
    stream: Option<NetworkStream>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("hostname", &self.hostname)
            .field("address", &self.address)
            .field("tls", &self.is_tls())
            .field("persistent", &self.persistent)
            .field("open", &self.is_open())
            .finish()
    }
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_tls(&self) -> bool {
        self.connector.is_some()
    }

    /// `false` for one-shot connections created past the per-host limit.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn peer_closed(&mut self) -> bool {
        self.stream
            .as_mut()
            .is_some_and(NetworkStream::is_closed_while_idle)
    }

    /// Connects (TCP, then TLS when required) unless already open.
    pub async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let tcp = timeout(IO_TIMEOUT, TcpStream::connect(self.address))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))
            .and_then(|res| res)
            .map_err(|source| self.connection_failed(source))?;
        tcp.set_nodelay(true)?;

        let stream = match &self.connector {
            None => MaybeTlsStream::Plain(tcp),
            Some(connector) => {
                let connector = match connector {
                    Some(connector) => connector.clone(),
                    None => tls_connector().map_err(|source| self.connection_failed(source))?,
                };
                let domain = ServerName::try_from(server_name(&self.hostname).to_owned())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid dnsname"))
                    .map_err(|source| self.connection_failed(source))?;

                let tls = timeout(IO_TIMEOUT, connector.connect(domain, tcp))
                    .await
                    .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))
                    .and_then(|res| res)
                    .map_err(|source| self.connection_failed(source))?;
                MaybeTlsStream::Tls(tls)
            }
        };

        log::trace!("connection #{} open to {}", self.id, self.address);
        self.stream = Some(NetworkStream::new(stream));
        Ok(())
    }

    /// Shuts the stream down. The connection can be reopened with [`PooledConnection::open`].
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    pub fn stream_mut(&mut self) -> Option<&mut NetworkStream> {
        self.stream.as_mut()
    }

    /// Lends the stream to someone else (the HTTP layer); give it back with
    /// [`PooledConnection::restore_stream`].
    pub(crate) fn take_stream(&mut self) -> Option<NetworkStream> {
        self.stream.take()
    }

    pub(crate) fn restore_stream(&mut self, stream: NetworkStream) {
        self.stream = Some(stream);
    }

    fn connection_failed(&self, source: io::Error) -> WebSocketError {
        WebSocketError::ConnectionFailed {
            host: self.hostname.clone(),
            source,
        }
    }
}

/// Whether `hostname` ends with an explicit `:port`.
fn has_port(hostname: &str) -> bool {
    hostname
        .rsplit_once(':')
        .is_some_and(|(host, port)| {
            // a bare IPv6 address has colons but no port
            !host.is_empty()
                && port.parse::<u16>().is_ok()
                && (!host.contains(':') || host.ends_with(']'))
        })
}

/// Host part of `hostname`, without port and IPv6 brackets.
fn server_name(hostname: &str) -> &str {
    let host = if has_port(hostname) {
        hostname.rsplit_once(':').map_or(hostname, |(host, _)| host)
    } else {
        hostname
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

async fn resolve(hostname: &str, tls: bool) -> Result<SocketAddr> {
    let target = if has_port(hostname) {
        hostname.to_owned()
    } else {
        format!("{hostname}:{}", if tls { 443 } else { 80 })
    };

    let failed = |source| WebSocketError::ConnectionFailed {
        host: hostname.to_owned(),
        source,
    };

    tokio::net::lookup_host(target)
        .await
        .map_err(failed)?
        .next()
        .ok_or_else(|| failed(io::Error::new(io::ErrorKind::NotFound, "no address found")))
}

/// Creates a TLS connector with the `webpki-roots` certificates.
/// If the crypto provider hasn't been set, [*ring*](https://github.com/briansmith/ring) is used.
fn tls_connector() -> io::Result<TlsConnector> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| TrustAnchor {
        subject: ta.subject.clone(),
        subject_public_key_info: ta.subject_public_key_info.clone(),
        name_constraints: ta.name_constraints.clone(),
    }));

    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    config.alpn_protocols = vec!["http/1.1".into()];

    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        (listener, host)
    }

    async fn open_connection(pool: &ConnectionPool, host: &str) -> PooledConnection {
        let mut connection = pool.acquire(host, false).await.unwrap();
        connection.open().await.unwrap();
        connection
    }

    #[test]
    fn test_hostname_parsing() {
        assert!(has_port("example.com:8080"));
        assert!(!has_port("example.com"));
        assert!(has_port("[::1]:9000"));
        assert!(!has_port("[::1]"));

        assert_eq!(server_name("example.com:8080"), "example.com");
        assert_eq!(server_name("example.com"), "example.com");
        assert_eq!(server_name("[::1]:9000"), "::1");
    }

    #[tokio::test]
    async fn test_release_and_reuse() {
        let (_listener, host) = listener().await;
        let pool = ConnectionPool::new(Executor::current());

        let connection = open_connection(&pool, &host).await;
        let id = connection.id();
        assert!(connection.is_persistent());
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(pool.idle_count(), 0);

        pool.release(connection);
        assert_eq!(pool.idle_count(), 1);
        assert!(pool.is_idle_check_enabled());

        let connection = pool.acquire(&host, false).await.unwrap();
        assert_eq!(connection.id(), id);
        assert!(connection.is_open());
        assert_eq!(pool.idle_count(), 0);

        // same host over TLS is a different key
        let other = pool.acquire(&host, true).await.unwrap();
        assert_ne!(other.id(), id);
        assert!(other.is_tls());
    }

    #[tokio::test]
    async fn test_release_closed_connection_is_dropped() {
        let (_listener, host) = listener().await;
        let pool = ConnectionPool::new(Executor::current());

        let mut connection = open_connection(&pool, &host).await;
        connection.close().await;
        pool.release(connection);

        assert_eq!(pool.connection_count(), 0);
        assert!(!pool.is_idle_check_enabled());
    }

    #[tokio::test]
    async fn test_per_host_limit_falls_back_to_one_shot() {
        let (_listener, host) = listener().await;
        let pool = ConnectionPool::new(Executor::current());

        let mut held = Vec::new();
        for _ in 0..MAX_CONNECTIONS_PER_HOST {
            let connection = pool.acquire(&host, false).await.unwrap();
            assert!(connection.is_persistent());
            held.push(connection);
        }

        let extra = pool.acquire(&host, false).await.unwrap();
        assert!(!extra.is_persistent());
        assert_eq!(pool.connection_count(), MAX_CONNECTIONS_PER_HOST);

        pool.release(extra);
        assert_eq!(pool.connection_count(), MAX_CONNECTIONS_PER_HOST);
    }

    #[tokio::test]
    async fn test_idle_eviction() {
        let (_listener, host) = listener().await;
        let pool = ConnectionPool::new(Executor::current());

        let idle = open_connection(&pool, &host).await;
        let busy = open_connection(&pool, &host).await;
        pool.release(idle);
        let t0 = Instant::now();

        // idle for about 6 s: survives
        assert_eq!(pool.evict_idle(t0 + Duration::from_secs(5)), 0);
        assert_eq!(pool.evict_idle(t0 + Duration::from_secs(6)), 0);
        assert_eq!(pool.idle_count(), 1);

        // idle for 8 s: evicted
        assert_eq!(pool.evict_idle(t0 + Duration::from_secs(8)), 1);
        assert_eq!(pool.idle_count(), 0);

        // in use connections are never evicted
        assert_eq!(pool.evict_idle(t0 + Duration::from_secs(600)), 0);
        assert_eq!(pool.connection_count(), 1);
        assert!(pool.is_idle_check_enabled());

        let stream = pool.detach(busy);
        assert!(stream.is_some());
        assert_eq!(pool.connection_count(), 0);
        assert!(!pool.is_idle_check_enabled());
    }

    #[tokio::test]
    async fn test_terminate() {
        let (_listener, host) = listener().await;
        let pool = ConnectionPool::new(Executor::current());

        let idle = open_connection(&pool, &host).await;
        let busy = open_connection(&pool, &host).await;
        pool.release(idle);

        pool.terminate();
        assert_eq!(pool.connection_count(), 0);
        assert!(!pool.is_idle_check_enabled());

        pool.release(busy);
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let (listener, host) = listener().await;
        drop(listener);

        let pool = ConnectionPool::new(Executor::current());
        let mut connection = pool.acquire(&host, false).await.unwrap();
        let err = connection.open().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ConnectionFailed);
    }
}
