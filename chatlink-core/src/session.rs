//! Connection lifecycle for both roles, the background accept/receive task, and input dispatch.
//!
//! All transitions go through one mutex. Socket shutdown happens under it (it never blocks);
//! connect, accept, send and receive never do. Events are emitted after the lock is released.
//!
//! Each session owns a small tokio runtime: the listener's accept loop is an async task,
//! blocking socket reads run on its blocking pool, and joins are bounded with `time::timeout`.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::{self, Handle, Runtime};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::{self, FileHeader, FrameEncodeError, TextFrame, BUFFER_SIZE, DEFAULT_PORT};
use crate::endpoint::{AcceptError, ConnectError, Endpoint, SendError};
use crate::resolve::{HomePathResolver, PathResolver};
use crate::stream::{self, TransferError, TransferProgress};

const EXIT_COMMAND: &str = "exit";

/// How long a transition waits for the previous background task before detaching it.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Dialer only, while its connect call is in flight.
    Connecting,
    Connected,
}

/// The dialer sends text frames and receives files; the listener does the opposite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Dialer { username: String },
    Listener,
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Dialer { .. } => "dialer",
            Role::Listener => "listener",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: Role,
    /// Port the listener binds and the dialer connects to.
    pub port: u16,
    /// Where the dialer writes received files.
    pub download_dir: PathBuf,
    pub chunk_size: usize,
    pub join_timeout: Duration,
}

impl SessionConfig {
    pub fn dialer(username: impl Into<String>) -> Self {
        Self::with_role(Role::Dialer {
            username: username.into(),
        })
    }

    pub fn listener() -> Self {
        Self::with_role(Role::Listener)
    }

    fn with_role(role: Role) -> Self {
        Self {
            role,
            port: DEFAULT_PORT,
            download_dir: PathBuf::from("."),
            chunk_size: BUFFER_SIZE,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Status notifications for display.
#[derive(Debug)]
pub enum SessionEvent {
    /// Listener bound its port and is waiting for a peer.
    Listening { port: u16 },
    Connected { peer: String },
    /// `lost` is true when the peer went away rather than a local exit.
    Disconnected { peer: String, lost: bool },
    Message { peer: String, frame: TextFrame },
    TransferStarted {
        direction: Direction,
        file_name: String,
        total_bytes: u64,
    },
    Progress {
        direction: Direction,
        file_name: String,
        progress: TransferProgress,
    },
    TransferComplete {
        direction: Direction,
        file_name: String,
        path: PathBuf,
    },
    /// Incoming transfer failed. The connection stays up only when the body could be skipped.
    TransferFailed {
        file_name: Option<String>,
        reason: String,
    },
    /// Listener input while no peer is connected.
    NotConnected,
    CommandFailed { reason: String },
    /// Bind or accept failed; the listener stops waiting for peers.
    ListenFailed { reason: String },
}

pub trait EventSink: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

impl EventSink for mpsc::Sender<SessionEvent> {
    fn on_event(&self, event: SessionEvent) {
        let _ = self.send(event);
    }
}

/// What the input loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not connected")]
    NotConnected,
    #[error("already connected to {0}")]
    AlreadyConnected(String),
    #[error("a connection attempt is already in progress")]
    Busy,
    #[error("only the {0} can do that")]
    WrongRole(&'static str),
    #[error("already listening")]
    AlreadyListening,
    #[error("session has shut down")]
    ShutDown,
    #[error("no file found at '{0}'")]
    FileNotFound(String),
    #[error("could not start the session runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Accept(#[from] AcceptError),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// The per-process state machine. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    _runtime: Arc<Executor>,
}

struct Shared {
    config: SessionConfig,
    sink: Arc<dyn EventSink>,
    resolver: Box<dyn PathResolver>,
    runtime: Handle,
    /// App cancellation flag. Every endpoint and pending accept watches it.
    stop: watch::Sender<bool>,
    inner: Mutex<Inner>,
}

/// Owns the session runtime. Background tasks only hold a `Handle`, so the
/// runtime goes away with the last `Session` clone, without waiting on them.
struct Executor(Option<Runtime>);

impl Drop for Executor {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

struct Inner {
    state: ConnectionState,
    endpoint: Option<Arc<Endpoint>>,
    /// Bumped on every new connection so a stale task cannot tear down its successor.
    generation: u64,
    background: Option<Background>,
    listening: bool,
    terminated: bool,
}

impl Session {
    pub fn new(config: SessionConfig, sink: Arc<dyn EventSink>) -> Result<Self, SessionError> {
        Self::with_resolver(config, sink, Box::new(HomePathResolver::new()))
    }

    pub fn with_resolver(
        config: SessionConfig,
        sink: Arc<dyn EventSink>,
        resolver: Box<dyn PathResolver>,
    ) -> Result<Self, SessionError> {
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("chatlink-session")
            .enable_all()
            .build()
            .map_err(SessionError::Runtime)?;
        let (stop, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                sink,
                resolver,
                runtime: runtime.handle().clone(),
                stop,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    endpoint: None,
                    generation: 0,
                    background: None,
                    listening: false,
                    terminated: false,
                }),
            }),
            _runtime: Arc::new(Executor(Some(runtime))),
        })
    }

    pub fn role(&self) -> &Role {
        &self.shared.config.role
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Identity of the connected peer, if any.
    pub fn peer(&self) -> Option<String> {
        self.shared
            .lock()
            .endpoint
            .as_ref()
            .map(|e| e.peer().to_owned())
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.lock().terminated
    }

    /// Listener: start the background task that accepts a peer, serves it, and
    /// goes back to accepting after every disconnect. State stays `Disconnected` until a peer arrives.
    pub fn begin_listening(&self) -> Result<(), SessionError> {
        if self.shared.config.role != Role::Listener {
            return Err(SessionError::WrongRole("listener"));
        }
        let mut inner = self.shared.lock();
        if inner.terminated {
            return Err(SessionError::ShutDown);
        }
        if inner.listening {
            return Err(SessionError::AlreadyListening);
        }
        let shared = self.shared.clone();
        let task = self.shared.runtime.spawn(shared.listen_loop());
        inner.background = Some(Background(task));
        inner.listening = true;
        Ok(())
    }

    /// Dialer: tear down whatever came before, connect to `host`, start the receive task.
    /// On failure the state goes back to `Disconnected`.
    pub fn connect(&self, host: &str) -> Result<(), SessionError> {
        if !matches!(self.shared.config.role, Role::Dialer { .. }) {
            return Err(SessionError::WrongRole("dialer"));
        }
        let host = host.trim();
        let previous = {
            let mut inner = self.shared.lock();
            if inner.terminated {
                return Err(SessionError::ShutDown);
            }
            match inner.state {
                ConnectionState::Connected => {
                    let peer = inner
                        .endpoint
                        .as_ref()
                        .map(|e| e.peer().to_owned())
                        .unwrap_or_default();
                    return Err(SessionError::AlreadyConnected(peer));
                }
                ConnectionState::Connecting => return Err(SessionError::Busy),
                ConnectionState::Disconnected => {}
            }
            if let Some(stale) = inner.endpoint.take() {
                stale.close();
            }
            inner.state = ConnectionState::Connecting;
            inner.background.take()
        };
        if let Some(task) = previous {
            self.shared.join(task);
        }

        log::debug!("connecting to {}:{}", host, self.shared.config.port);
        let result = self.shared.runtime.block_on(Endpoint::connect(
            host,
            self.shared.config.port,
            self.shared.stop.subscribe(),
        ));

        let mut inner = self.shared.lock();
        let endpoint = match result {
            Ok(endpoint) => Arc::new(endpoint),
            Err(e) => {
                if inner.state == ConnectionState::Connecting {
                    inner.state = ConnectionState::Disconnected;
                }
                log::warn!("{}", e);
                return Err(e.into());
            }
        };
        if inner.terminated {
            endpoint.close();
            return Err(SessionError::ShutDown);
        }
        inner.generation += 1;
        let generation = inner.generation;
        // The receive task holds off until `Connected` is out, so no incoming
        // transfer event can reach the sink ahead of it.
        let (ready, started) = oneshot::channel::<()>();
        let shared = self.shared.clone();
        let reader = endpoint.clone();
        let task = self.shared.runtime.spawn_blocking(move || {
            let _ = started.blocking_recv();
            shared.receive_loop(&reader, generation)
        });
        inner.background = Some(Background(task));
        inner.state = ConnectionState::Connected;
        inner.endpoint = Some(endpoint);
        drop(inner);

        self.shared.emit(SessionEvent::Connected {
            peer: host.to_owned(),
        });
        let _ = ready.send(());
        Ok(())
    }

    /// Dialer: send `body` as a text frame from the configured username.
    /// A failed send tears the connection down.
    pub fn send_text(&self, body: &str) -> Result<(), SessionError> {
        let Role::Dialer { username } = &self.shared.config.role else {
            return Err(SessionError::WrongRole("dialer"));
        };
        let frame = codec::encode_text(username, body)?;
        let (endpoint, generation) = self.shared.current()?;
        if let Err(e) = endpoint.send(&frame) {
            log::warn!("send to {} failed: {}", endpoint.peer(), e);
            self.shared.teardown(Some(generation), true);
            return Err(e.into());
        }
        Ok(())
    }

    /// Listener: resolve `raw_path` to a regular file and stream it to the peer.
    /// A path that does not resolve changes nothing. A transfer that fails after
    /// the header went out leaves the stream unframed, so the connection is dropped.
    pub fn send_file(&self, raw_path: &str) -> Result<PathBuf, SessionError> {
        if self.shared.config.role != Role::Listener {
            return Err(SessionError::WrongRole("listener"));
        }
        let path = self
            .shared
            .resolver
            .resolve(raw_path)
            .ok_or_else(|| SessionError::FileNotFound(raw_path.trim().to_owned()))?;
        let (endpoint, generation) = self.shared.current()?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let total_bytes = fs::metadata(&path).map_err(TransferError::Open)?.len();

        self.shared.emit(SessionEvent::TransferStarted {
            direction: Direction::Outgoing,
            file_name: file_name.clone(),
            total_bytes,
        });
        let sent = stream::send_file(
            &endpoint,
            &path,
            self.shared.config.chunk_size,
            &mut |progress| {
                self.shared.emit(SessionEvent::Progress {
                    direction: Direction::Outgoing,
                    file_name: file_name.clone(),
                    progress,
                })
            },
        );
        match sent {
            Ok(_) => {
                self.shared.emit(SessionEvent::TransferComplete {
                    direction: Direction::Outgoing,
                    file_name,
                    path: path.clone(),
                });
                Ok(path)
            }
            Err(e) => {
                if e.desynchronizes() {
                    log::warn!("transfer of {} failed mid-stream: {}", file_name, e);
                    self.shared
                        .teardown(Some(generation), matches!(e, TransferError::Send(_)));
                }
                Err(e.into())
            }
        }
    }

    /// User-initiated `CONNECTED -> DISCONNECTED`. Returns `false` if there was nothing to close.
    /// The listener's background task goes back to accepting on its own.
    pub fn disconnect(&self) -> bool {
        self.shared.teardown(None, false)
    }

    /// Stop everything: set both cancellation flags, close the live connection,
    /// stop the listener and wait for the background task. Safe to call repeatedly and concurrently.
    pub fn shutdown(&self) {
        self.shared.stop.send_replace(true);
        let (endpoint, task) = {
            let mut inner = self.shared.lock();
            if inner.terminated {
                return;
            }
            inner.terminated = true;
            inner.state = ConnectionState::Disconnected;
            let endpoint = inner.endpoint.take();
            if let Some(endpoint) = &endpoint {
                endpoint.close();
            }
            (endpoint, inner.background.take())
        };
        if let Some(endpoint) = endpoint {
            self.shared.emit(SessionEvent::Disconnected {
                peer: endpoint.peer().to_owned(),
                lost: false,
            });
        }
        if let Some(task) = task {
            self.shared.join(task);
        }
        log::info!("{} session shut down", self.shared.config.role.name());
    }

    /// Dispatch one line of user input on the current state and role.
    pub fn handle_input(&self, line: &str) -> Flow {
        let command = line.trim();
        if command.is_empty() {
            return Flow::Continue;
        }
        let exit = command.eq_ignore_ascii_case(EXIT_COMMAND);
        let result = match (self.state(), self.role()) {
            (ConnectionState::Connected, _) if exit => {
                self.disconnect();
                Ok(())
            }
            (ConnectionState::Connected, Role::Dialer { .. }) => self.send_text(line),
            (ConnectionState::Connected, Role::Listener) => self.send_file(command).map(|_| ()),
            (_, _) if exit => {
                self.shutdown();
                return Flow::Exit;
            }
            (_, Role::Dialer { .. }) => self.connect(command),
            (_, Role::Listener) => {
                self.shared.emit(SessionEvent::NotConnected);
                Ok(())
            }
        };
        if let Err(e) = result {
            log::debug!("command failed: {}", e);
            self.shared.emit(SessionEvent::CommandFailed {
                reason: e.to_string(),
            });
        }
        Flow::Continue
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        self.sink.on_event(event);
    }

    fn current(&self) -> Result<(Arc<Endpoint>, u64), SessionError> {
        let inner = self.lock();
        match (&inner.state, &inner.endpoint) {
            (ConnectionState::Connected, Some(endpoint)) => Ok((endpoint.clone(), inner.generation)),
            _ => Err(SessionError::NotConnected),
        }
    }

    /// The single `CONNECTED -> DISCONNECTED` path. With `Some(generation)` it only
    /// tears down that connection. Returns `true` for the call that actually closed it.
    fn teardown(&self, generation: Option<u64>, lost: bool) -> bool {
        let endpoint = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Connected {
                return false;
            }
            if generation.is_some_and(|g| g != inner.generation) {
                return false;
            }
            let Some(endpoint) = inner.endpoint.take() else {
                return false;
            };
            endpoint.close();
            inner.state = ConnectionState::Disconnected;
            endpoint
        };
        if lost {
            log::warn!("lost connection to {}", endpoint.peer());
        } else {
            log::info!("disconnected from {}", endpoint.peer());
        }
        self.emit(SessionEvent::Disconnected {
            peer: endpoint.peer().to_owned(),
            lost,
        });
        true
    }

    /// Store a freshly accepted endpoint. `None` if the session shut down meanwhile.
    fn install(&self, endpoint: &Arc<Endpoint>) -> Option<u64> {
        let generation = {
            let mut inner = self.lock();
            if inner.terminated {
                endpoint.close();
                return None;
            }
            if let Some(stale) = inner.endpoint.take() {
                stale.close();
            }
            inner.generation += 1;
            inner.state = ConnectionState::Connected;
            inner.endpoint = Some(endpoint.clone());
            inner.generation
        };
        self.emit(SessionEvent::Connected {
            peer: endpoint.peer().to_owned(),
        });
        Some(generation)
    }

    fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Wait for a background task, but no longer than `join_timeout`.
    /// Never called from a background task itself.
    fn join(&self, task: Background) {
        let timeout = self.config.join_timeout;
        let _guard = self.runtime.enter();
        match self.runtime.block_on(tokio::time::timeout(timeout, task.0)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => log::error!("background task panicked"),
            Ok(Err(_)) => log::debug!("background task was cancelled"),
            Err(_) => log::warn!("background task still running after {:?}, detaching", timeout),
        }
    }

    /// Listener worker: accept one peer, serve it on the blocking pool until it
    /// goes away, then bind again. Ends on shutdown or a bind/accept failure.
    async fn listen_loop(self: Arc<Self>) {
        while !self.is_stopping() {
            let listener = match Endpoint::listen(self.config.port).await {
                Ok(listener) => listener,
                Err(e) => {
                    self.listen_failed(e);
                    break;
                }
            };
            self.emit(SessionEvent::Listening {
                port: listener.local_port(),
            });
            let endpoint = match listener.accept(self.stop.subscribe()).await {
                Ok(endpoint) => Arc::new(endpoint),
                Err(AcceptError::Cancelled) => break,
                Err(e) => {
                    self.listen_failed(e);
                    break;
                }
            };
            let Some(generation) = self.install(&endpoint) else {
                break;
            };
            let shared = self.clone();
            let served =
                tokio::task::spawn_blocking(move || shared.receive_loop(&endpoint, generation)).await;
            if let Err(e) = served {
                log::error!("receive task failed: {}", e);
                break;
            }
        }
        self.lock().listening = false;
        log::debug!("listener task stopped");
    }

    fn listen_failed(&self, error: AcceptError) {
        log::error!("{}", error);
        self.emit(SessionEvent::ListenFailed {
            reason: error.to_string(),
        });
    }

    /// Read until the connection ends, then run the disconnect transition
    /// (a no-op if the foreground already did).
    fn receive_loop(&self, endpoint: &Endpoint, generation: u64) {
        match self.config.role {
            Role::Listener => self.receive_messages(endpoint),
            Role::Dialer { .. } => self.receive_files(endpoint),
        }
        self.teardown(Some(generation), true);
    }

    fn receive_messages(&self, endpoint: &Endpoint) {
        while !endpoint.is_cancelled() {
            let Ok(bytes) = endpoint.receive(BUFFER_SIZE) else {
                return;
            };
            match codec::decode_text(&bytes) {
                Ok(Some(frame)) => self.emit(SessionEvent::Message {
                    peer: endpoint.peer().to_owned(),
                    frame,
                }),
                Ok(None) => log::debug!("ignoring empty frame from {}", endpoint.peer()),
                Err(e) => log::warn!("dropping frame from {}: {}", endpoint.peer(), e),
            }
        }
    }

    fn receive_files(&self, endpoint: &Endpoint) {
        while !endpoint.is_cancelled() {
            let header = match stream::read_header(endpoint) {
                Ok(header) => header,
                Err(TransferError::Closed) => return,
                Err(e) => {
                    self.transfer_failed(None, e);
                    return;
                }
            };
            match self.receive_one(endpoint, &header) {
                Ok(path) => self.emit(SessionEvent::TransferComplete {
                    direction: Direction::Incoming,
                    file_name: header.file_name,
                    path,
                }),
                Err(e) => {
                    let in_sync = !e.desynchronizes();
                    self.transfer_failed(Some(header.file_name), e);
                    if !in_sync {
                        return;
                    }
                }
            }
        }
    }

    fn receive_one(&self, endpoint: &Endpoint, header: &FileHeader) -> Result<PathBuf, TransferError> {
        let total_bytes = u64::from(header.byte_length);
        let destination = match stream::destination_for(&self.config.download_dir, &header.file_name) {
            Ok(destination) => destination,
            Err(e) => {
                stream::skip_body(endpoint, total_bytes, self.config.chunk_size)?;
                return Err(e);
            }
        };
        log::info!(
            "receiving {} ({} bytes) from {}",
            header.file_name,
            total_bytes,
            endpoint.peer()
        );
        self.emit(SessionEvent::TransferStarted {
            direction: Direction::Incoming,
            file_name: header.file_name.clone(),
            total_bytes,
        });
        stream::receive_file(
            endpoint,
            &destination,
            total_bytes,
            self.config.chunk_size,
            &mut |progress| {
                self.emit(SessionEvent::Progress {
                    direction: Direction::Incoming,
                    file_name: header.file_name.clone(),
                    progress,
                })
            },
        )?;
        Ok(destination)
    }

    fn transfer_failed(&self, file_name: Option<String>, error: TransferError) {
        log::warn!("incoming transfer failed: {}", error);
        self.emit(SessionEvent::TransferFailed {
            file_name,
            reason: error.to_string(),
        });
    }
}

/// The one background task: the listener's accept loop or the dialer's receive loop.
struct Background(JoinHandle<()>);
