use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::BytesMut;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, trace, warn};

use crate::core::{CommandId, Config, Error, LinkState, Result, Role};
use crate::protocol::codec::FrameCodec;
use crate::protocol::dispatcher::FrameDispatcher;
use crate::protocol::frame::{Frame, MAX_FRAME_LEN, STATUS_OK};
use crate::util::lock;
use super::broker::RequestBroker;
use super::keepalive::{FailureFn, KeepaliveMonitor, ProbeFn};
use super::role::Endpoint;

/// Write half of the peer socket
pub(crate) type LinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half of the peer socket
type LinkReader = Box<dyn AsyncRead + Send + Unpin>;

/// Transitions buffered for slow subscribers
const TRANSITION_CAPACITY: usize = 64;

/// How often `try_connect_with_timeout` re-checks the link
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// State shared between the worker and the handles calling into it
pub(crate) struct SharedState {
    /// Side of the link
    pub(crate) role: Role,
    /// Current lifecycle state
    state: AtomicU8,
    /// Set by `start()`, cleared by `stop()`
    start: AtomicBool,
    /// Teardown requested
    disconnect: AtomicBool,
    /// Sticky error of the current cycle
    error: AtomicBool,
    /// Message of the last error
    last_error: StdMutex<Option<String>>,
    /// Write half of the peer socket while connected
    pub(crate) writer: Mutex<Option<LinkWriter>>,
    /// Sockets held open by the worker
    open_sockets: AtomicUsize,
    /// Bound address while the server is listening
    local_addr: StdMutex<Option<SocketAddr>>,
    /// Lifecycle transitions
    transitions: broadcast::Sender<LinkState>,
    /// Wakes the worker out of Idle
    wake: Notify,
}

impl SharedState {
    pub(crate) fn new(role: Role) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        SharedState {
            role,
            state: AtomicU8::new(LinkState::Idle as u8),
            start: AtomicBool::new(false),
            disconnect: AtomicBool::new(false),
            error: AtomicBool::new(false),
            last_error: StdMutex::new(None),
            writer: Mutex::new(None),
            open_sockets: AtomicUsize::new(0),
            local_addr: StdMutex::new(None),
            transitions,
            wake: Notify::new(),
        }
    }

    pub(crate) fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::SeqCst)).unwrap_or(LinkState::Idle)
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::SeqCst);
        // No subscribers is fine
        let _ = self.transitions.send(state);
    }

    fn start_requested(&self) -> bool {
        self.start.load(Ordering::SeqCst)
    }

    fn disconnect_requested(&self) -> bool {
        self.disconnect.load(Ordering::SeqCst)
    }

    pub(crate) fn request_disconnect(&self) {
        self.disconnect.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Stop or disconnect pending
    fn cancel_requested(&self) -> bool {
        !self.start_requested() || self.disconnect_requested()
    }

    fn set_error(&self, err: &Error) {
        *lock(&self.last_error) = Some(err.to_string());
        self.error.store(true, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.state().is_open() && self.start_requested() && !self.disconnect_requested()
    }
}

/// One end of the link.
///
/// Owns a worker task that runs the connection state machine for either
/// role. Dropping the connection aborts the worker and closes its sockets.
pub struct Connection {
    shared: Arc<SharedState>,
    broker: Arc<RequestBroker>,
    worker: JoinHandle<()>,
}

impl Connection {
    /// Spawns the worker for `config`; must be called from within a runtime.
    ///
    /// The connection stays Idle until `start()`. Inbound frames are handed
    /// to `dispatcher`.
    pub fn new(config: Config, dispatcher: Arc<dyn FrameDispatcher>) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(SharedState::new(config.role));
        let broker = Arc::new(RequestBroker::new(Arc::clone(&shared), config.write_timeout));
        let keepalive = KeepaliveMonitor::new(
            config.keepalive.interval,
            keepalive_probe(Arc::clone(&broker), config.keepalive.probe_timeout),
            liveness_lost(Arc::clone(&shared), Arc::clone(&dispatcher)),
        );

        let worker = Worker {
            endpoint: Endpoint::new(config.role, config.addr),
            config,
            shared: Arc::clone(&shared),
            broker: Arc::clone(&broker),
            keepalive,
            dispatcher,
            reader: None,
            codec: FrameCodec::new(),
            recv_buffer: BytesMut::with_capacity(MAX_FRAME_LEN),
        };
        info!(role = ?worker.config.role, addr = %worker.config.addr, "link worker spawned");
        let worker = tokio::spawn(worker.run());

        Ok(Connection { shared, broker, worker })
    }

    /// Makes the connection eligible to (re)connect
    pub fn start(&self) {
        self.shared.start.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Tears the link down and keeps it down
    pub fn stop(&self) {
        self.shared.start.store(false, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Tears the link down; it reconnects if still started
    pub fn disconnect_request(&self) {
        self.shared.request_disconnect();
    }

    /// True while the link is up, started, and not being torn down
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Waits up to `limit` for the link to come up
    pub async fn try_connect_with_timeout(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.is_connected() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(CONNECT_POLL_INTERVAL).await;
        }
    }

    /// Sends a command and waits for the peer's verdict
    pub async fn send_command(&self, command: CommandId, timeout: Duration) -> Result<()> {
        send_command(&self.broker, command, timeout).await
    }

    /// Current lifecycle state
    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Stream of lifecycle transitions
    pub fn subscribe(&self) -> broadcast::Receiver<LinkState> {
        self.shared.transitions.subscribe()
    }

    /// Request broker of this connection
    pub fn broker(&self) -> Arc<RequestBroker> {
        Arc::clone(&self.broker)
    }

    /// Side of the link
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Address the server is listening on, while it listens
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.local_addr)
    }

    /// Sockets currently held open
    pub fn open_sockets(&self) -> usize {
        self.shared.open_sockets.load(Ordering::SeqCst)
    }

    /// Message of the most recent connection error
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

pub(crate) async fn send_command(broker: &RequestBroker, command: CommandId, timeout: Duration) -> Result<()> {
    let mut status = [0u8; 1];
    let len = broker
        .send_and_wait(&Frame::command(command), &mut status, timeout)
        .await?;
    if len == 0 || status[0] != STATUS_OK {
        return Err(Error::rejected(format!("peer refused {}", command)));
    }
    Ok(())
}

fn keepalive_probe(broker: Arc<RequestBroker>, probe_timeout: Duration) -> ProbeFn {
    Arc::new(move || {
        let broker = Arc::clone(&broker);
        async move { send_command(&broker, CommandId::KEEPALIVE, probe_timeout).await }.boxed()
    })
}

fn liveness_lost(shared: Arc<SharedState>, dispatcher: Arc<dyn FrameDispatcher>) -> FailureFn {
    Arc::new(move |err| {
        warn!(role = ?shared.role, error = %err, "peer unresponsive, disconnecting");
        // Outputs go safe before the worker observes the teardown
        if shared.role == Role::Server {
            dispatcher.on_liveness_lost();
        }
        shared.set_error(err);
        shared.request_disconnect();
    })
}

/// State machine driving one connection
struct Worker {
    config: Config,
    shared: Arc<SharedState>,
    broker: Arc<RequestBroker>,
    keepalive: KeepaliveMonitor,
    dispatcher: Arc<dyn FrameDispatcher>,
    endpoint: Endpoint,
    reader: Option<LinkReader>,
    codec: FrameCodec,
    recv_buffer: BytesMut,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let next = match self.shared.state() {
                LinkState::Idle => self.idle().await,
                LinkState::CreatingSocket => self.create_socket(),
                LinkState::Connecting => self.connect().await,
                LinkState::Listening => self.listen().await,
                LinkState::Ready => self.ready().await,
                LinkState::ParsingResponse => self.parse_response().await,
                LinkState::Closing => self.close().await,
                LinkState::CheckingErrors => self.check_errors().await,
            };
            self.enter(next);
        }
    }

    fn enter(&mut self, next: LinkState) {
        let open = self.endpoint.open_count() + usize::from(self.reader.is_some());
        self.shared.open_sockets.store(open, Ordering::SeqCst);

        let current = self.shared.state();
        if current != next {
            trace!(from = %current, to = %next, "link transition");
            self.shared.set_state(next);
        }
    }

    fn fail(&self, err: Error) {
        debug!(error = %err, "link cycle failed");
        self.shared.set_error(&err);
    }

    async fn idle(&mut self) -> LinkState {
        if self.shared.disconnect_requested() {
            self.shared.start.store(false, Ordering::SeqCst);
            self.shared.error.store(false, Ordering::SeqCst);
            self.shared.disconnect.store(false, Ordering::SeqCst);
            return LinkState::Idle;
        }
        if self.shared.start_requested() {
            self.shared.error.store(false, Ordering::SeqCst);
            return LinkState::CreatingSocket;
        }
        let _ = timeout(self.config.idle_poll_interval, self.shared.wake.notified()).await;
        LinkState::Idle
    }

    fn create_socket(&mut self) -> LinkState {
        match self.endpoint.create() {
            Ok(()) => match self.config.role {
                Role::Client => LinkState::Connecting,
                Role::Server => LinkState::Listening,
            },
            Err(e) => {
                self.fail(e);
                LinkState::Closing
            }
        }
    }

    async fn connect(&mut self) -> LinkState {
        if self.shared.cancel_requested() {
            return LinkState::Closing;
        }
        match self.endpoint.connect(self.config.connect_timeout).await {
            Ok(stream) => {
                info!(peer = %self.config.addr, "connected");
                self.attach(stream).await;
                LinkState::Ready
            }
            Err(e) => {
                self.fail(e);
                LinkState::Closing
            }
        }
    }

    async fn listen(&mut self) -> LinkState {
        if self.shared.cancel_requested() {
            return LinkState::Closing;
        }
        let accepted = self.endpoint.poll_accept(self.config.listen_poll_timeout).await;
        *lock(&self.shared.local_addr) = self.endpoint.local_addr();

        match accepted {
            Ok(Some((stream, peer))) => {
                info!(%peer, "peer accepted");
                self.attach(stream).await;
                LinkState::Ready
            }
            Ok(None) => LinkState::Listening,
            Err(e) => {
                self.fail(e);
                LinkState::Closing
            }
        }
    }

    async fn attach(&mut self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not disable Nagle");
        }
        let (reader, writer) = stream.into_split();
        self.reader = Some(Box::new(reader));
        *self.shared.writer.lock().await = Some(Box::new(writer));
        self.recv_buffer.clear();
        self.keepalive.start();
    }

    async fn ready(&mut self) -> LinkState {
        if self.shared.cancel_requested() {
            return LinkState::Closing;
        }
        let Some(reader) = self.reader.as_mut() else {
            self.fail(Error::socket("peer socket not readable"));
            return LinkState::Closing;
        };

        self.recv_buffer.reserve(MAX_FRAME_LEN);
        match timeout(self.config.ready_poll_timeout, reader.read_buf(&mut self.recv_buffer)).await {
            Err(_) => LinkState::Ready,
            Ok(Ok(0)) => match self.config.role {
                Role::Client => {
                    sleep(self.config.peer_closed_delay).await;
                    LinkState::Ready
                }
                Role::Server => {
                    info!("peer closed the link");
                    LinkState::Closing
                }
            },
            Ok(Ok(n)) => {
                trace!(bytes = n, "inbound bytes");
                LinkState::ParsingResponse
            }
            Ok(Err(e)) => {
                self.fail(Error::socket(format!("read failed: {}", e)));
                LinkState::Closing
            }
        }
    }

    async fn parse_response(&mut self) -> LinkState {
        loop {
            match self.codec.decode(&mut self.recv_buffer) {
                Ok(Some(frame)) => {
                    trace!(%frame, "inbound frame");
                    if let Some(reply) = self.dispatcher.on_frame(frame, &self.broker) {
                        if let Err(e) = self.broker.send(&reply).await {
                            warn!(error = %e, %reply, "reply not sent");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => warn!(error = %e, "malformed inbound bytes dropped"),
            }
        }
        self.keepalive.observe_liveness();

        if self.shared.cancel_requested() {
            LinkState::Closing
        } else {
            LinkState::Ready
        }
    }

    async fn close(&mut self) -> LinkState {
        self.reader = None;
        *self.shared.writer.lock().await = None;
        self.endpoint.close();
        *lock(&self.shared.local_addr) = None;
        self.keepalive.stop();
        self.recv_buffer.clear();
        LinkState::CheckingErrors
    }

    async fn check_errors(&mut self) -> LinkState {
        let failed = self.shared.error.swap(false, Ordering::SeqCst);
        self.shared.disconnect.store(false, Ordering::SeqCst);
        if failed {
            let message = lock(&self.shared.last_error).clone().unwrap_or_default();
            error!(role = ?self.config.role, error = %message, "link cycle ended with error");
            sleep(self.config.idle_poll_interval).await;
        }
        LinkState::Idle
    }
}
