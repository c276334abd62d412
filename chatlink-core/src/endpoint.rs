//! One live TCP connection: connect/accept, blocking full writes and reads, shutdown discipline.
//!
//! Sockets are set up on the tokio runtime (address reuse, backlog 1, cancellable accept),
//! then handed over as blocking std streams for the receive task and the foreground sender.

use std::future;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::{self as tnet, TcpSocket};
use tokio::sync::watch;

/// Single-peer protocol: at most one pending connection.
const BACKLOG: u32 = 1;

/// Connected socket plus the peer identity and the two cancellation flags.
/// `send` and `receive` take `&self`, so one endpoint can be written by the
/// foreground and read by the background task at the same time.
#[derive(Debug)]
pub struct Endpoint {
    stream: TcpStream,
    peer: String,
    cancelled: AtomicBool,
    app_cancelled: watch::Receiver<bool>,
}

impl Endpoint {
    /// Dial `host:port` with address reuse and the OS default connect timeout.
    /// Gives up early when the app is shutting down.
    pub async fn connect(
        host: &str,
        port: u16,
        mut app_cancelled: watch::Receiver<bool>,
    ) -> Result<Self, ConnectError> {
        let error = |source: io::Error| ConnectError {
            host: host.to_owned(),
            port,
            source,
        };
        let stream = tokio::select! {
            biased;
            _ = stopped(&mut app_cancelled) => {
                return Err(error(io::Error::new(io::ErrorKind::Interrupted, "shutting down")));
            }
            dialed = dial(host, port) => dialed.map_err(error)?,
        };
        let stream = blocking(stream).map_err(error)?;
        log::info!("connected to {}:{}", host, port);
        Ok(Self::from_stream(stream, host.to_owned(), app_cancelled))
    }

    /// Bind `0.0.0.0:port` with address reuse and backlog 1, for a single accept.
    /// Port 0 picks an ephemeral port.
    pub async fn listen(port: u16) -> Result<Listener, AcceptError> {
        Listener::bind(port)
    }

    fn from_stream(stream: TcpStream, peer: String, app_cancelled: watch::Receiver<bool>) -> Self {
        Self {
            stream,
            peer,
            cancelled: AtomicBool::new(false),
            app_cancelled,
        }
    }

    /// Host string for a dialed connection, source IP for an accepted one.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write every byte or fail. Never a short write.
    pub fn send(&self, bytes: &[u8]) -> Result<(), SendError> {
        if self.is_cancelled() {
            return Err(SendError::Closed);
        }
        (&self.stream).write_all(bytes)?;
        Ok(())
    }

    /// Blocking read of up to `max_bytes`. Orderly end-of-stream and socket errors
    /// both come back as `ConnectionClosed`.
    pub fn receive(&self, max_bytes: usize) -> Result<Vec<u8>, ConnectionClosed> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ConnectionClosed);
        }
        let mut buf = vec![0u8; max_bytes.max(1)];
        loop {
            match (&self.stream).read(&mut buf) {
                Ok(0) => {
                    log::debug!("{} closed the connection", self.peer);
                    return Err(ConnectionClosed);
                }
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("read from {} failed: {}", self.peer, e);
                    return Err(ConnectionClosed);
                }
            }
        }
    }

    /// Read exactly `len` bytes, across as many reads as it takes.
    pub fn receive_exact(&self, len: usize) -> Result<Vec<u8>, ConnectionClosed> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let chunk = self.receive(len - out.len())?;
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Half-close: the peer sees end-of-stream, reads on this side keep working.
    pub fn close_write(&self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Write)
    }

    /// Cancel the connection, half-close, then shut both directions so a read
    /// blocked in another thread returns. Returns `true` only for the call that closed.
    pub fn close(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.close_write() {
            log::debug!("half-close of {} failed: {}", self.peer, e);
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            log::debug!("shutdown of {} failed: {}", self.peer, e);
        }
        log::info!("closed connection to {}", self.peer);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || *self.app_cancelled.borrow()
    }
}

/// Listening socket good for exactly one accept.
#[derive(Debug)]
pub struct Listener {
    inner: tnet::TcpListener,
    port: u16,
}

impl Listener {
    fn bind(port: u16) -> Result<Self, AcceptError> {
        let bind_error = |source| AcceptError::Bind { port, source };
        let socket = TcpSocket::new_v4().map_err(bind_error)?;
        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket
            .bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
            .map_err(bind_error)?;
        let inner = socket.listen(BACKLOG).map_err(bind_error)?;
        let port = inner.local_addr().map_err(AcceptError::Accept)?.port();
        log::debug!("listening on {}:{}", Ipv4Addr::UNSPECIFIED, port);
        Ok(Self { inner, port })
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Wait for one peer, or until the app shuts down. Either way the listening
    /// socket is closed when this returns.
    pub async fn accept(self, mut app_cancelled: watch::Receiver<bool>) -> Result<Endpoint, AcceptError> {
        let Listener { inner, port } = self;
        let (stream, addr) = tokio::select! {
            biased;
            _ = stopped(&mut app_cancelled) => {
                log::debug!("stopped listening on port {}", port);
                return Err(AcceptError::Cancelled);
            }
            accepted = inner.accept() => accepted.map_err(AcceptError::Accept)?,
        };
        drop(inner);
        let stream = blocking(stream).map_err(AcceptError::Accept)?;
        log::info!("accepted {} on port {}", addr, port);
        Ok(Endpoint::from_stream(
            stream,
            addr.ip().to_string(),
            app_cancelled,
        ))
    }
}

/// Try every resolved address in turn, each on a fresh socket with address reuse.
async fn dial(host: &str, port: u16) -> io::Result<tnet::TcpStream> {
    let mut last_error = None;
    for addr in tnet::lookup_host((host, port)).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                log::debug!("connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

/// Leave the reactor: reads and writes from here on block their thread.
fn blocking(stream: tnet::TcpStream) -> io::Result<TcpStream> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    Ok(stream)
}

/// Resolves once the app flag is raised. A dropped sender never resolves.
async fn stopped(app_cancelled: &mut watch::Receiver<bool>) {
    let sender_gone = app_cancelled.wait_for(|stop| *stop).await.is_err();
    if sender_gone {
        future::pending::<()>().await;
    }
}

/// Dialer could not reach the host.
#[derive(Debug, thiserror::Error)]
#[error("could not connect to {host}:{port}: {source}")]
pub struct ConnectError {
    pub host: String,
    pub port: u16,
    pub source: io::Error,
}

/// Listener could not bind or accept, or was cancelled while waiting.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("could not bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("stopped listening")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
    #[error("send failed: {0}")]
    Io(#[from] io::Error),
}

/// Peer closed the stream or the socket failed; both mean the peer is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("peer disconnected")]
pub struct ConnectionClosed;

/// (dialer side, listener side) over loopback.
#[cfg(test)]
pub(crate) fn loopback_pair() -> (Endpoint, Endpoint) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let (_stop, cancel) = watch::channel(false);
        let listener = Endpoint::listen(0).await.unwrap();
        let port = listener.local_port();
        let (dialed, accepted) = tokio::join!(
            Endpoint::connect("127.0.0.1", port, cancel.clone()),
            listener.accept(cancel.clone())
        );
        (dialed.unwrap(), accepted.unwrap())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    fn unused_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn send_and_receive() {
        let (dialer, listener) = loopback_pair();
        dialer.send(b"alice:hello").unwrap();
        assert_eq!(listener.receive(1024).unwrap(), b"alice:hello");
        assert_eq!(dialer.peer(), "127.0.0.1");
        assert_eq!(listener.peer(), "127.0.0.1");
    }

    #[test]
    fn receive_exact_spans_writes() {
        let (dialer, listener) = loopback_pair();
        dialer.send(b"abc").unwrap();
        dialer.send(b"defgh").unwrap();
        assert_eq!(listener.receive_exact(8).unwrap(), b"abcdefgh");
    }

    #[test]
    fn dialer_sets_address_reuse() {
        let (dialer, _listener) = loopback_pair();
        let socket = TcpSocket::from_std_stream(dialer.stream.try_clone().unwrap());
        assert!(socket.reuseaddr().unwrap());
    }

    #[test]
    fn peer_close_reads_as_closed() {
        let (dialer, listener) = loopback_pair();
        assert!(dialer.close());
        assert_eq!(listener.receive(64), Err(ConnectionClosed));
    }

    #[test]
    fn close_is_idempotent() {
        let (dialer, _listener) = loopback_pair();
        assert!(dialer.close());
        assert!(!dialer.close());
        assert!(dialer.is_cancelled());
        assert!(matches!(dialer.send(b"x"), Err(SendError::Closed)));
        assert_eq!(dialer.receive(64), Err(ConnectionClosed));
    }

    #[test]
    fn half_close_lets_peer_finish_reading() {
        let (dialer, listener) = loopback_pair();
        dialer.send(b"last words").unwrap();
        dialer.close_write().unwrap();
        assert_eq!(listener.receive_exact(10).unwrap(), b"last words");
        assert_eq!(listener.receive(64), Err(ConnectionClosed));
    }

    #[test]
    fn close_unblocks_pending_receive() {
        let (dialer, _listener) = loopback_pair();
        let dialer = Arc::new(dialer);
        let reader = dialer.clone();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(reader.receive(64));
        });
        thread::sleep(Duration::from_millis(100));
        dialer.close();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Err(ConnectionClosed));
    }

    #[tokio::test]
    async fn app_flag_cancels_accept_and_closes_socket() {
        let listener = Endpoint::listen(0).await.unwrap();
        let port = listener.local_port();
        let (stop, cancel) = watch::channel(false);
        let waiting = tokio::spawn(listener.accept(cancel));
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.send_replace(true);

        let result = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(AcceptError::Cancelled)));
        assert!(std::net::TcpStream::connect(("127.0.0.1", port)).is_err());
    }

    #[tokio::test]
    async fn app_flag_raised_early_still_cancels() {
        let listener = Endpoint::listen(0).await.unwrap();
        let (_stop, cancel) = watch::channel(true);
        assert!(matches!(
            listener.accept(cancel).await,
            Err(AcceptError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn listener_stops_after_first_accept() {
        let listener = Endpoint::listen(0).await.unwrap();
        let port = listener.local_port();
        let (_stop, cancel) = watch::channel(false);
        let (dialed, accepted) = tokio::join!(
            Endpoint::connect("127.0.0.1", port, cancel.clone()),
            listener.accept(cancel.clone())
        );
        let _dialer = dialed.unwrap();
        let _accepted = accepted.unwrap();
        assert!(Endpoint::connect("127.0.0.1", port, cancel).await.is_err());
    }

    #[tokio::test]
    async fn connect_failure_names_host_and_port() {
        let port = unused_port();
        let (_stop, cancel) = watch::channel(false);
        let err = Endpoint::connect("127.0.0.1", port, cancel).await.unwrap_err();
        assert_eq!(err.host, "127.0.0.1");
        assert_eq!(err.port, port);
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let held = Endpoint::listen(0).await.unwrap();
        let err = Endpoint::listen(held.local_port()).await.unwrap_err();
        assert!(matches!(err, AcceptError::Bind { .. }));
    }
}
