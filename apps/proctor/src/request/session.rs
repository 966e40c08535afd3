use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, ReentrantMutex};
use proctor_proto::{SessionEnd, SessionKind, SessionStart, message_type, negotiate_version};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{RequestState, SessionError, SessionFault, SessionOptions, SessionOutcome, SessionPhase};
use crate::codec::{HostMessage, MessageCodec};
use crate::host::TestHostManager;
use crate::telemetry::logging::hexdump;
use crate::transport::{ChannelConfig, ChannelError, CommunicationChannel, ConnectionInfo, ConnectionRole};

/// Turns host messages into handler calls for one kind of request.
pub(super) trait EventSink: Send + Sync {
    fn deliver(&self, message: HostMessage) -> Result<(), SessionError>;
    fn complete(&self, outcome: &SessionOutcome);
}

enum Terminal {
    Completed(SessionEnd),
    Aborted,
    Faulted {
        phase: SessionPhase,
        error: SessionError,
    },
}

impl Terminal {
    fn state(&self) -> RequestState {
        match self {
            Terminal::Completed(_) => RequestState::Completed,
            Terminal::Aborted => RequestState::Aborted,
            Terminal::Faulted { .. } => RequestState::Faulted,
        }
    }
}

struct StateCell {
    state: RequestState,
    started: bool,
    outcome: Option<SessionOutcome>,
    /// Set after the completion handler returned.
    finished: bool,
}

type Established = Option<Arc<CommunicationChannel>>;

/// State shared between a request handle and its driver thread.
///
/// Lock order: `host_manager` before `state`. `dispatch` is held while a
/// handler runs and is reentrant so handlers may call `abort`.
pub(super) struct SessionCore {
    id: Uuid,
    kind: SessionKind,
    start: SessionStart,
    options: SessionOptions,
    codec: MessageCodec,
    host_manager: Mutex<Box<dyn TestHostManager>>,
    channel: Mutex<Option<Arc<CommunicationChannel>>>,
    state: Mutex<StateCell>,
    finished: Condvar,
    dispatch: ReentrantMutex<()>,
    aborted: AtomicBool,
    released: AtomicBool,
    sink: OnceLock<Arc<dyn EventSink>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCore {
    pub(super) fn new(
        start: SessionStart,
        host_manager: Box<dyn TestHostManager>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        debug!(session = %id, kind = ?start.kind, manager = host_manager.name(), "request created");
        Arc::new(Self {
            id,
            kind: start.kind,
            start,
            options,
            codec: MessageCodec::new(),
            host_manager: Mutex::new(host_manager),
            channel: Mutex::new(None),
            state: Mutex::new(StateCell {
                state: RequestState::Created,
                started: false,
                outcome: None,
                finished: false,
            }),
            finished: Condvar::new(),
            dispatch: ReentrantMutex::new(()),
            aborted: AtomicBool::new(false),
            released: AtomicBool::new(false),
            sink: OnceLock::new(),
            driver: Mutex::new(None),
        })
    }

    pub(super) fn id(&self) -> Uuid {
        self.id
    }

    pub(super) fn state(&self) -> RequestState {
        self.state.lock().state
    }

    pub(super) fn outcome(&self) -> Option<SessionOutcome> {
        self.state.lock().outcome.clone()
    }

    /// Spawns the driver thread. A request starts at most once.
    pub(super) fn start(self: &Arc<Self>, sink: Arc<dyn EventSink>) -> Result<(), SessionError> {
        {
            let mut cell = self.state.lock();
            if cell.started || cell.state != RequestState::Created {
                return Err(SessionError::InvalidState(cell.state));
            }
            // Set before the start is visible so an early abort still reports completion.
            let _ = self.sink.set(sink);
            cell.started = true;
        }

        let core = Arc::clone(self);
        let name = format!("proctor-{}-{}", kind_name(self.kind), &self.id.simple().to_string()[..8]);
        match thread::Builder::new().name(name).spawn(move || core.drive()) {
            Ok(handle) => {
                *self.driver.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                let kind = err.kind();
                let message = err.to_string();
                self.finish(Terminal::Faulted {
                    phase: SessionPhase::Connection,
                    error: SessionError::Driver(err),
                });
                Err(SessionError::Driver(io::Error::new(kind, message)))
            }
        }
    }

    /// Idempotent. Waits for an in-flight handler call on other threads, so no
    /// discovery or result event is delivered once this returns.
    pub(super) fn abort(&self) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            debug!(session = %self.id, "abort already requested");
            return;
        }
        let _dispatch = self.dispatch.lock();
        let prior = self.state();
        if prior.is_terminal() {
            debug!(session = %self.id, state = ?prior, "abort after the request finished");
            return;
        }
        info!(session = %self.id, state = ?prior, "aborting request");
        let channel = self.channel.lock().clone();
        if let (RequestState::Active, Some(channel)) = (prior, channel) {
            if let Err(err) = channel.send(message_type::ABORT) {
                debug!(session = %self.id, error = %err, "could not notify test host of abort");
            }
        }
        self.finish(Terminal::Aborted);
    }

    pub(super) fn wait_for_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cell = self.state.lock();
        while !cell.finished {
            if self.finished.wait_until(&mut cell, deadline).timed_out() {
                return cell.finished;
            }
        }
        true
    }

    /// Aborts an unfinished request, releases its resources and joins the
    /// driver. Used when the request handle is dropped.
    pub(super) fn shutdown(&self) {
        if !self.state().is_terminal() {
            self.abort();
        }
        self.release(false);
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(session = %self.id, "session driver panicked");
            }
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn drive(self: Arc<Self>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                self.fail(SessionPhase::Connection, SessionError::Driver(err));
                return;
            }
        };
        let channel = match runtime.block_on(self.establish()) {
            Ok(Some(channel)) => channel,
            Ok(None) => return,
            Err((phase, error)) => {
                self.fail(phase, error);
                return;
            }
        };
        drop(runtime);
        self.pump(&channel);
        debug!(session = %self.id, state = ?self.state(), "session driver exiting");
    }

    /// Binds the channel, launches the host, handshakes and sends the session
    /// start. `None` means the request was aborted along the way.
    async fn establish(&self) -> Result<Established, (SessionPhase, SessionError)> {
        let role = self.options.role;
        let channel = Arc::new(CommunicationChannel::new(
            role,
            ChannelConfig {
                connection_timeout: self.options.connection_timeout,
                protocol_version: self.options.protocol_version,
                ..ChannelConfig::default()
            },
            self.codec,
        ));
        *self.channel.lock() = Some(Arc::clone(&channel));
        if self.state().is_terminal() {
            channel.stop();
            return Ok(None);
        }

        let connection = self
            .prepare_endpoint(&channel)
            .map_err(|error| (SessionPhase::Connection, error))?;
        if !self
            .launch_host(&connection)
            .map_err(|error| (SessionPhase::Connection, error))?
        {
            return Ok(None);
        }
        if !self.advance(RequestState::Created, RequestState::Initialized) {
            return Ok(None);
        }

        let timeout = self.options.connection_timeout;
        let connected = match role {
            ConnectionRole::Host => {
                match tokio::time::timeout(timeout, channel.accept_async()).await {
                    Ok(accepted) => accepted,
                    Err(_) => Err(ChannelError::ConnectionTimeout(timeout)),
                }
            }
            ConnectionRole::Client => channel.connect_to_async(connection.endpoint).await,
        };
        match connected {
            Ok(()) => {}
            Err(_) if self.is_aborted() => return Ok(None),
            Err(ChannelError::ConnectionTimeout(waited)) => {
                return Err((SessionPhase::Connection, SessionError::ConnectionTimeout(waited)));
            }
            Err(err) => return Err((SessionPhase::Connection, err.into())),
        }
        info!(session = %self.id, peer = ?channel.peer_addr(), "test host connected");

        let version = match self.handshake(&channel) {
            Ok(version) => version,
            Err(_) if self.is_aborted() => return Ok(None),
            Err(error) => return Err((SessionPhase::Handshake, error)),
        };
        info!(session = %self.id, version, "handshake complete");

        if let Err(err) = channel.send_payload(message_type::SESSION_START, &self.start) {
            if self.is_aborted() {
                return Ok(None);
            }
            return Err((SessionPhase::Session, err.into()));
        }
        if !self.advance(RequestState::Initialized, RequestState::Active) {
            return Ok(None);
        }
        debug!(session = %self.id, sources = self.start.sources.len(), "session started");
        Ok(Some(channel))
    }

    /// Returns what the test host needs to reach this side of the channel.
    fn prepare_endpoint(&self, channel: &CommunicationChannel) -> Result<ConnectionInfo, SessionError> {
        let endpoint = match self.options.role {
            ConnectionRole::Host => SocketAddr::from((Ipv4Addr::LOCALHOST, channel.host()?)),
            ConnectionRole::Client => reserve_loopback_endpoint().map_err(ChannelError::from)?,
        };
        Ok(ConnectionInfo {
            endpoint,
            role: self.options.role.peer(),
            timeout: self.options.connection_timeout,
        })
    }

    /// False when the request finished before the host could be launched.
    fn launch_host(&self, connection: &ConnectionInfo) -> Result<bool, SessionError> {
        let mut manager = self.host_manager.lock();
        if self.state().is_terminal() {
            return Ok(false);
        }
        let handle = manager.launch(connection)?;
        debug!(
            session = %self.id,
            pid = ?handle.pid,
            custom_launcher = handle.custom_launcher,
            endpoint = %connection.endpoint,
            "test host launched for session"
        );
        Ok(true)
    }

    /// The client side speaks first; the host side answers with its own
    /// version. Both settle on the lower one.
    fn handshake(&self, channel: &CommunicationChannel) -> Result<u32, SessionError> {
        let timeout = self.options.handshake_timeout;
        if channel.role() == ConnectionRole::Client {
            channel.send_handshake()?;
        }
        let envelope = match channel.receive_within(timeout) {
            Ok(envelope) => envelope,
            Err(ChannelError::Timeout) => return Err(SessionError::HandshakeTimeout(timeout)),
            Err(err) => return Err(err.into()),
        };
        if envelope.message_type() != message_type::HANDSHAKE {
            return Err(SessionError::Protocol(format!(
                "expected {} but received {}",
                message_type::HANDSHAKE,
                envelope.message_type()
            )));
        }
        let HostMessage::Handshake(peer) = HostMessage::from_envelope(&self.codec, &envelope)? else {
            return Err(SessionError::Protocol("malformed handshake".to_string()));
        };
        if channel.role() == ConnectionRole::Host {
            channel.send_handshake()?;
        }
        let version = negotiate_version(channel.local_protocol_version(), peer.protocol_version);
        channel.set_version(version);
        Ok(version)
    }

    fn pump(&self, channel: &CommunicationChannel) {
        loop {
            if self.is_aborted() {
                return;
            }
            let raw = match channel.receive_raw() {
                Ok(raw) => raw,
                Err(_) if self.is_aborted() || self.state().is_terminal() => return,
                Err(err) => {
                    self.fail(SessionPhase::Session, err.into());
                    return;
                }
            };
            let decoded = self
                .codec
                .decode(&raw)
                .and_then(|envelope| HostMessage::from_envelope(&self.codec, &envelope));
            let message = match decoded {
                Ok(message) => message,
                Err(err) => {
                    trace!(session = %self.id, frame = %hexdump(raw.as_bytes()), "undecodable frame");
                    self.fail(SessionPhase::Session, err.into());
                    return;
                }
            };
            match message {
                HostMessage::SessionEnd(end) => {
                    self.complete(end);
                    return;
                }
                HostMessage::Error(error) => {
                    self.fail(
                        SessionPhase::Session,
                        SessionError::HostReported {
                            message: error.message,
                            detail: error.detail,
                        },
                    );
                    return;
                }
                HostMessage::Handshake(_) => {
                    self.fail(
                        SessionPhase::Session,
                        SessionError::Protocol("handshake after session start".to_string()),
                    );
                    return;
                }
                message => {
                    if let Err(error) = self.dispatch(message) {
                        self.fail(SessionPhase::Session, error);
                        return;
                    }
                }
            }
        }
    }

    fn dispatch(&self, message: HostMessage) -> Result<(), SessionError> {
        let _dispatch = self.dispatch.lock();
        if self.is_aborted() || self.state() != RequestState::Active {
            trace!(session = %self.id, "dropping event after the request stopped");
            return Ok(());
        }
        match self.sink.get() {
            Some(sink) => sink.deliver(message),
            None => Ok(()),
        }
    }

    fn complete(&self, end: SessionEnd) {
        let _dispatch = self.dispatch.lock();
        if self.is_aborted() {
            return;
        }
        self.finish(Terminal::Completed(end));
    }

    fn fail(&self, phase: SessionPhase, error: SessionError) {
        if self.is_aborted() {
            debug!(session = %self.id, ?phase, error = %error, "ignoring error after abort");
            return;
        }
        self.finish(Terminal::Faulted { phase, error });
    }

    fn advance(&self, from: RequestState, to: RequestState) -> bool {
        let mut cell = self.state.lock();
        if cell.state != from {
            return false;
        }
        debug!(session = %self.id, ?from, ?to, "request state change");
        cell.state = to;
        true
    }

    /// Moves to a terminal state, tears the session down and reports the
    /// outcome. Only the first caller has any effect.
    fn finish(&self, terminal: Terminal) -> bool {
        let target = terminal.state();
        {
            let mut cell = self.state.lock();
            if cell.state.is_terminal() {
                return false;
            }
            debug!(session = %self.id, from = ?cell.state, to = ?target, "request state change");
            cell.state = target;
        }

        let host_terminated = self.release(matches!(terminal, Terminal::Completed(_)));
        let outcome = match terminal {
            Terminal::Completed(end) => {
                info!(session = %self.id, total_tests = end.total_tests, "request completed");
                SessionOutcome::Completed(end)
            }
            Terminal::Aborted => {
                info!(session = %self.id, "request aborted");
                SessionOutcome::Aborted
            }
            Terminal::Faulted { phase, error } => {
                warn!(session = %self.id, ?phase, error = %error, host_terminated, "request faulted");
                SessionOutcome::Faulted(SessionFault {
                    phase,
                    error: Arc::new(error),
                    host_terminated,
                })
            }
        };

        self.state.lock().outcome = Some(outcome.clone());
        if let Some(sink) = self.sink.get() {
            sink.complete(&outcome);
        }
        self.state.lock().finished = true;
        self.finished.notify_all();
        true
    }

    /// Stops the channel and ends the test host, once. Returns true when a
    /// still-running host had to be killed.
    fn release(&self, graceful: bool) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            channel.stop();
        }
        let mut manager = self.host_manager.lock();
        if graceful {
            manager.shutdown(self.options.host_exit_grace)
        } else {
            let running = !manager.has_exited();
            manager.terminate();
            running
        }
    }
}

fn kind_name(kind: SessionKind) -> &'static str {
    match kind {
        SessionKind::Discovery => "discovery",
        SessionKind::Run => "run",
    }
}

/// Picks a free loopback port for a test host that listens itself.
fn reserve_loopback_endpoint() -> io::Result<SocketAddr> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    listener.local_addr()
}
