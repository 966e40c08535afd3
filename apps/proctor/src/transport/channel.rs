use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use proctor_proto::{Handshake, LEGACY_PROTOCOL_VERSION, message_type};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::frame::{FrameReader, write_frame};
use super::{ChannelConfig, ChannelError, ConnectionRole};
use crate::codec::{CodecError, Envelope, MessageCodec};

#[derive(Debug, Default)]
struct ChannelState {
    bound: bool,
    stopped: bool,
    listener: Option<TcpListener>,
    /// Handle kept for shutdown; reads and writes go through their own clones.
    stream: Option<TcpStream>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl ChannelState {
    fn connected(&self) -> bool {
        self.stream.is_some() && !self.stopped
    }
}

/// One socket endpoint exchanging framed envelopes with exactly one peer.
///
/// `accept_async` and `connect_async` are the only operations that suspend.
/// `receive` blocks for at most one frame and `stop` unblocks every waiter.
pub struct CommunicationChannel {
    role: ConnectionRole,
    config: ChannelConfig,
    codec: MessageCodec,
    state: Mutex<ChannelState>,
    connected: Condvar,
    closed: watch::Sender<bool>,
    reader: Mutex<Option<FrameReader<TcpStream>>>,
    writer: Mutex<Option<TcpStream>>,
    version: AtomicU32,
}

impl CommunicationChannel {
    pub fn new(role: ConnectionRole, config: ChannelConfig, codec: MessageCodec) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            role,
            config,
            codec,
            state: Mutex::new(ChannelState::default()),
            connected: Condvar::new(),
            closed,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            version: AtomicU32::new(LEGACY_PROTOCOL_VERSION),
        }
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    /// Version used to encode payload messages; settled by the handshake.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn set_version(&self, version: u32) {
        self.version
            .store(version.max(LEGACY_PROTOCOL_VERSION), Ordering::Release);
    }

    pub fn local_protocol_version(&self) -> u32 {
        self.config.protocol_version
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.state.lock().peer_addr
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Binds a loopback listener on an ephemeral port and returns the port.
    pub fn host(&self) -> Result<u16, ChannelError> {
        self.host_at(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .map(|addr| addr.port())
    }

    /// Binds a listener on `addr`, for a peer that was told where to listen.
    pub fn host_at(&self, addr: SocketAddr) -> Result<SocketAddr, ChannelError> {
        self.expect_role(ConnectionRole::Host)?;
        let mut state = self.state.lock();
        if state.stopped {
            return Err(ChannelError::ChannelClosed);
        }
        if state.bound {
            return Err(ChannelError::AlreadyBound);
        }
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        state.bound = true;
        state.listener = Some(listener);
        state.local_addr = Some(addr);
        info!(%addr, "channel listening");
        Ok(addr)
    }

    /// Waits for the single peer to dial in. Must run inside a tokio runtime.
    pub async fn accept_async(&self) -> Result<(), ChannelError> {
        self.expect_role(ConnectionRole::Host)?;
        let std_listener = {
            let state = self.state.lock();
            if state.stopped {
                return Err(ChannelError::ChannelClosed);
            }
            if state.stream.is_some() {
                return Err(ChannelError::AlreadyBound);
            }
            state
                .listener
                .as_ref()
                .ok_or(ChannelError::NotConnected)?
                .try_clone()?
        };
        let listener = tokio::net::TcpListener::from_std(std_listener)?;
        let mut closed = self.closed.subscribe();

        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = closed.wait_for(|closed| *closed) => return Err(ChannelError::ChannelClosed),
        };
        debug!(%peer, "accepted peer connection");
        self.attach(stream.into_std()?, true)
    }

    /// Blocks until a peer has connected or `timeout` elapses. A timeout leaves
    /// the listener in place.
    pub fn wait_for_client_connection(&self, timeout: Duration) -> bool {
        if self.role != ConnectionRole::Host {
            warn!(role = %self.role, "wait_for_client_connection on a non-host channel");
            return false;
        }
        self.wait_for_connection(timeout)
    }

    /// Dials the orchestrator-local `port`, retrying until the configured
    /// connection timeout.
    pub async fn connect_async(&self, port: u16) -> Result<(), ChannelError> {
        self.connect_to_async(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .await
    }

    pub async fn connect_to_async(&self, addr: SocketAddr) -> Result<(), ChannelError> {
        self.expect_role(ConnectionRole::Client)?;
        {
            let mut state = self.state.lock();
            if state.stopped {
                return Err(ChannelError::ChannelClosed);
            }
            if state.bound {
                return Err(ChannelError::AlreadyBound);
            }
            state.bound = true;
        }

        let timeout = self.config.connection_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut closed = self.closed.subscribe();
        loop {
            let attempt = tokio::select! {
                attempt = tokio::time::timeout_at(deadline, tokio::net::TcpStream::connect(addr)) => attempt,
                _ = closed.wait_for(|closed| *closed) => return Err(ChannelError::ChannelClosed),
            };
            match attempt {
                Ok(Ok(stream)) => {
                    debug!(%addr, "connected to peer");
                    return self.attach(stream.into_std()?, false);
                }
                Ok(Err(err)) => trace!(%addr, error = %err, "connect attempt failed"),
                Err(_) => return Err(ChannelError::ConnectionTimeout(timeout)),
            }
            if tokio::time::Instant::now() + self.config.retry_interval >= deadline {
                return Err(ChannelError::ConnectionTimeout(timeout));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_interval) => {}
                _ = closed.wait_for(|closed| *closed) => return Err(ChannelError::ChannelClosed),
            }
        }
    }

    pub fn wait_for_server_connection(&self, timeout: Duration) -> bool {
        if self.role != ConnectionRole::Client {
            warn!(role = %self.role, "wait_for_server_connection on a non-client channel");
            return false;
        }
        self.wait_for_connection(timeout)
    }

    pub fn send(&self, message_type: &str) -> Result<(), ChannelError> {
        let raw = self.codec.encode_empty(message_type)?;
        self.send_raw(&raw)
    }

    pub fn send_payload<T: Serialize + ?Sized>(
        &self,
        message_type: &str,
        payload: &T,
    ) -> Result<(), ChannelError> {
        let raw = self.codec.encode(message_type, payload, self.version())?;
        self.send_raw(&raw)
    }

    /// Announces the highest protocol version this side speaks. Always sent in
    /// the legacy envelope so any peer can read it.
    pub fn send_handshake(&self) -> Result<(), ChannelError> {
        let handshake = Handshake {
            protocol_version: self.config.protocol_version,
        };
        let raw = self
            .codec
            .encode(message_type::HANDSHAKE, &handshake, LEGACY_PROTOCOL_VERSION)?;
        self.send_raw(&raw)
    }

    pub fn send_raw(&self, raw: &str) -> Result<(), ChannelError> {
        if self.is_stopped() {
            return Err(ChannelError::ChannelClosed);
        }
        let mut writer = self.writer.lock();
        let stream = writer.as_mut().ok_or(ChannelError::NotConnected)?;
        trace!(bytes = raw.len(), "sending frame");
        write_frame(stream, raw.as_bytes())
    }

    pub fn receive(&self) -> Result<Envelope, ChannelError> {
        let raw = self.receive_raw()?;
        Ok(self.codec.decode(&raw)?)
    }

    pub fn receive_raw(&self) -> Result<String, ChannelError> {
        self.receive_raw_inner(None)
    }

    /// Like [`receive`](Self::receive) but gives up with `Timeout` once
    /// `timeout` passes. A partially read frame stays buffered.
    pub fn receive_within(&self, timeout: Duration) -> Result<Envelope, ChannelError> {
        let raw = self.receive_raw_inner(Some(timeout))?;
        Ok(self.codec.decode(&raw)?)
    }

    /// Idempotent. Releases the socket and wakes anything blocked in accept,
    /// connect, wait or receive.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.listener = None;
            if let Some(stream) = state.stream.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        self.connected.notify_all();
        self.closed.send_replace(true);
        info!(role = %self.role, "channel stopped");
    }

    fn receive_raw_inner(&self, timeout: Option<Duration>) -> Result<String, ChannelError> {
        if self.is_stopped() {
            return Err(ChannelError::ChannelClosed);
        }
        let frame = {
            let mut reader = self.reader.lock();
            let reader = reader.as_mut().ok_or(ChannelError::NotConnected)?;
            // Sockets refuse a zero read timeout; an empty deadline has already passed.
            if timeout == Some(Duration::ZERO) {
                return Err(ChannelError::Timeout);
            }
            reader.get_ref().set_read_timeout(timeout)?;
            let frame = reader.read_frame();
            if timeout.is_some() {
                let _ = reader.get_ref().set_read_timeout(None);
            }
            frame?
        };
        if self.is_stopped() {
            return Err(ChannelError::ChannelClosed);
        }
        trace!(bytes = frame.len(), "received frame");
        String::from_utf8(frame).map_err(|_| ChannelError::Codec(CodecError::NotUtf8))
    }

    fn wait_for_connection(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        let mut state = self.state.lock();
        self.connected.wait_while_for(
            &mut state,
            |state| state.stream.is_none() && !state.stopped,
            timeout,
        );
        let connected = state.connected();
        if !connected {
            debug!(
                waited_ms = started.elapsed().as_millis() as u64,
                "no peer connection yet"
            );
        }
        connected
    }

    fn attach(&self, stream: TcpStream, hosted: bool) -> Result<(), ChannelError> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;

        {
            let mut state = self.state.lock();
            if state.stopped {
                let _ = stream.shutdown(Shutdown::Both);
                return Err(ChannelError::ChannelClosed);
            }
            if state.stream.is_some() {
                let _ = stream.shutdown(Shutdown::Both);
                return Err(ChannelError::AlreadyBound);
            }
            *self.reader.lock() = Some(FrameReader::new(reader));
            *self.writer.lock() = Some(writer);
            state.stream = Some(stream);
            state.peer_addr = peer;
            if hosted {
                state.listener = None;
            } else {
                state.local_addr = local;
            }
        }
        self.connected.notify_all();
        info!(role = %self.role, peer = ?peer, "channel connected");
        Ok(())
    }

    fn expect_role(&self, expected: ConnectionRole) -> Result<(), ChannelError> {
        if self.role == expected {
            Ok(())
        } else {
            Err(ChannelError::WrongRole {
                expected,
                actual: self.role,
            })
        }
    }
}

impl Drop for CommunicationChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctor_proto::CURRENT_PROTOCOL_VERSION;
    use serde_json::json;
    use std::sync::Arc;

    fn channel(role: ConnectionRole) -> Arc<CommunicationChannel> {
        let config = ChannelConfig {
            connection_timeout: Duration::from_secs(2),
            ..ChannelConfig::default()
        };
        Arc::new(CommunicationChannel::new(role, config, MessageCodec::new()))
    }

    #[test_timeout::timeout(10)]
    fn wait_for_client_times_out_and_keeps_listening() {
        let host = channel(ConnectionRole::Host);
        let port = host.host().expect("host");

        let started = Instant::now();
        assert!(!host.wait_for_client_connection(Duration::from_millis(100)));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(100), "{waited:?}");
        assert!(waited < Duration::from_secs(2), "{waited:?}");

        // still listening: the OS completes the connect against the backlog
        let peer = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).expect("listener alive");
        drop(peer);
        assert!(!host.is_stopped());
    }

    #[test]
    fn second_host_call_fails() {
        let host = channel(ConnectionRole::Host);
        host.host().expect("host");
        assert!(matches!(host.host(), Err(ChannelError::AlreadyBound)));
    }

    #[test]
    fn role_operations_are_checked() {
        let client = channel(ConnectionRole::Client);
        assert!(matches!(
            client.host(),
            Err(ChannelError::WrongRole {
                expected: ConnectionRole::Host,
                actual: ConnectionRole::Client
            })
        ));
        assert!(!client.wait_for_client_connection(Duration::from_millis(1)));
    }

    #[test]
    fn send_before_connect_is_not_connected() {
        let host = channel(ConnectionRole::Host);
        assert!(matches!(
            host.send(message_type::ABORT),
            Err(ChannelError::NotConnected)
        ));
        host.stop();
        assert!(matches!(
            host.send(message_type::ABORT),
            Err(ChannelError::ChannelClosed)
        ));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn host_and_client_exchange_messages() {
        let host = channel(ConnectionRole::Host);
        let client = channel(ConnectionRole::Client);
        let port = host.host().expect("host");

        let (accepted, connected) = tokio::join!(host.accept_async(), client.connect_async(port));
        accepted.expect("accept");
        connected.expect("connect");
        assert!(host.wait_for_client_connection(Duration::from_millis(10)));
        assert!(client.wait_for_server_connection(Duration::from_millis(10)));

        client.send_handshake().expect("handshake");
        let envelope = host.receive().expect("receive handshake");
        assert_eq!(envelope.message_type(), message_type::HANDSHAKE);
        assert_eq!(envelope.version(), LEGACY_PROTOCOL_VERSION);
        let handshake: Handshake = host
            .codec()
            .decode_payload(envelope.message())
            .expect("handshake payload");
        assert_eq!(handshake.protocol_version, CURRENT_PROTOCOL_VERSION);

        client.set_version(2);
        client
            .send_payload(message_type::SESSION_START, &json!({"sources": ["a.dll"]}))
            .expect("send");
        let envelope = host.receive().expect("receive start");
        assert_eq!(envelope.version(), 2);

        host.send_raw(r#"{"MessageType":"Session.End"}"#)
            .expect("raw send");
        assert_eq!(
            client.receive_raw().expect("raw receive"),
            r#"{"MessageType":"Session.End"}"#
        );

        assert!(matches!(
            client.connect_async(port).await,
            Err(ChannelError::AlreadyBound)
        ));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn stop_unblocks_pending_accept() {
        let host = channel(ConnectionRole::Host);
        host.host().expect("host");
        let stopper = host.clone();
        let stop = async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.stop();
            stopper.stop();
        };
        let (accepted, ()) = tokio::join!(host.accept_async(), stop);
        assert!(matches!(accepted, Err(ChannelError::ChannelClosed)));
        assert!(!host.wait_for_client_connection(Duration::from_millis(10)));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn connect_gives_up_after_timeout() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let client = Arc::new(CommunicationChannel::new(
            ConnectionRole::Client,
            ChannelConfig {
                connection_timeout: Duration::from_millis(200),
                ..ChannelConfig::default()
            },
            MessageCodec::new(),
        ));
        assert!(matches!(
            client.connect_async(port).await,
            Err(ChannelError::ConnectionTimeout(_))
        ));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn peer_disconnect_surfaces_channel_closed() {
        let host = channel(ConnectionRole::Host);
        let client = channel(ConnectionRole::Client);
        let port = host.host().expect("host");
        let (accepted, connected) = tokio::join!(host.accept_async(), client.connect_async(port));
        accepted.expect("accept");
        connected.expect("connect");

        client.stop();
        let receiver = host.clone();
        let result = tokio::task::spawn_blocking(move || receiver.receive())
            .await
            .expect("join");
        assert!(matches!(result, Err(ChannelError::ChannelClosed)));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn stop_unblocks_pending_receive() {
        let host = channel(ConnectionRole::Host);
        let client = channel(ConnectionRole::Client);
        let port = host.host().expect("host");
        let (accepted, connected) = tokio::join!(host.accept_async(), client.connect_async(port));
        accepted.expect("accept");
        connected.expect("connect");

        let receiver = host.clone();
        let pending = tokio::task::spawn_blocking(move || receiver.receive_raw());
        tokio::time::sleep(Duration::from_millis(50)).await;
        host.stop();
        assert!(matches!(
            pending.await.expect("join"),
            Err(ChannelError::ChannelClosed)
        ));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn receive_within_times_out_without_losing_the_stream() {
        let host = channel(ConnectionRole::Host);
        let client = channel(ConnectionRole::Client);
        let port = host.host().expect("host");
        let (accepted, connected) = tokio::join!(host.accept_async(), client.connect_async(port));
        accepted.expect("accept");
        connected.expect("connect");

        let receiver = host.clone();
        let timed_out = tokio::task::spawn_blocking(move || {
            receiver.receive_within(Duration::from_millis(50))
        })
        .await
        .expect("join");
        assert!(matches!(timed_out, Err(ChannelError::Timeout)));
        assert!(matches!(
            host.receive_within(Duration::ZERO),
            Err(ChannelError::Timeout)
        ));

        client.send(message_type::SESSION_END).expect("send");
        let receiver = host.clone();
        let envelope = tokio::task::spawn_blocking(move || receiver.receive())
            .await
            .expect("join")
            .expect("receive after timeout");
        assert_eq!(envelope.message_type(), message_type::SESSION_END);
    }
}
