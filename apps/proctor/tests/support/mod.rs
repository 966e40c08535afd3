//! In-process test host driven by a script, started through a custom launcher
//! so integration tests never spawn real processes.

#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use proctor_core::codec::{ControllerMessage, MessageCodec};
use proctor_core::host::{
    DefaultTestHostManager, HostError, HostManagerFactory, HostManagerRegistry, HostProcess,
    HostStartInfo, TestHostLauncher, TestHostManager,
};
use proctor_core::config::ProctorConfig;
use proctor_core::transport::{ChannelConfig, ChannelError, CommunicationChannel, ConnectionInfo, ConnectionRole};
use proctor_core::TestPlatform;
use proctor_proto::{
    Handshake, SessionStart, TestCase, TestOutcome, TestResult, message_type, negotiate_version,
};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum Step {
    /// Sends a payload encoded with the negotiated version.
    Send(&'static str, Value),
    /// Sends a frame exactly as given.
    SendRaw(String),
    Pause(Duration),
    /// Blocks until the orchestrator sends `Session.Abort` or hangs up.
    AwaitAbort,
    /// Blocks until killed.
    Hang,
    /// Hangs up without ending the session.
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub protocol_version: u32,
    pub handshake: bool,
    pub steps: Vec<Step>,
}

impl Script {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            protocol_version: proctor_proto::CURRENT_PROTOCOL_VERSION,
            handshake: true,
            steps,
        }
    }

    pub fn legacy(mut self) -> Self {
        self.protocol_version = proctor_proto::LEGACY_PROTOCOL_VERSION;
        self
    }

    /// Connects but never answers the handshake.
    pub fn silent() -> Self {
        Self {
            handshake: false,
            ..Self::new(vec![Step::Hang])
        }
    }
}

/// What the fake host observed, shared with the test.
#[derive(Default)]
pub struct HostLog {
    pub launches: AtomicUsize,
    pub start_info: Mutex<Option<HostStartInfo>>,
    pub connection: Mutex<Option<ConnectionInfo>>,
    pub negotiated: Mutex<Option<u32>>,
    pub session_start: Mutex<Option<SessionStart>>,
    pub abort_received: AtomicBool,
    pub killed: AtomicBool,
    pub exited: AtomicBool,
}

pub struct ScriptedLauncher {
    script: Script,
    pub log: Arc<HostLog>,
}

impl ScriptedLauncher {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            log: Arc::new(HostLog::default()),
        })
    }
}

impl TestHostLauncher for ScriptedLauncher {
    fn launch_test_host(
        &self,
        start_info: &HostStartInfo,
        connection: &ConnectionInfo,
    ) -> Result<Box<dyn HostProcess>, HostError> {
        self.log.launches.fetch_add(1, Ordering::SeqCst);
        *self.log.start_info.lock() = Some(start_info.clone());
        *self.log.connection.lock() = Some(connection.clone());

        let channel = Arc::new(CommunicationChannel::new(
            connection.role,
            ChannelConfig {
                connection_timeout: connection.timeout,
                protocol_version: self.script.protocol_version,
                ..ChannelConfig::default()
            },
            MessageCodec::new(),
        ));
        if connection.role == ConnectionRole::Host {
            channel
                .host_at(connection.endpoint)
                .map_err(|err| HostError::Launcher(err.to_string()))?;
        }

        let script = self.script.clone();
        let log = Arc::clone(&self.log);
        let host_channel = Arc::clone(&channel);
        let endpoint = connection.endpoint;
        let thread = thread::Builder::new()
            .name("fake-testhost".to_string())
            .spawn(move || {
                let _ = serve(&host_channel, endpoint, &script, &log);
                host_channel.stop();
                log.exited.store(true, Ordering::SeqCst);
            })
            .map_err(|err| HostError::Launcher(err.to_string()))?;

        Ok(Box::new(FakeProcess {
            channel,
            log: Arc::clone(&self.log),
            thread: Some(thread),
        }))
    }
}

struct FakeProcess {
    channel: Arc<CommunicationChannel>,
    log: Arc<HostLog>,
    thread: Option<JoinHandle<()>>,
}

impl HostProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn has_exited(&mut self) -> bool {
        self.log.exited.load(Ordering::SeqCst)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.log.killed.store(true, Ordering::SeqCst);
        self.channel.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(())
    }
}

fn serve(
    channel: &CommunicationChannel,
    endpoint: std::net::SocketAddr,
    script: &Script,
    log: &HostLog,
) -> Result<(), ChannelError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    match channel.role() {
        ConnectionRole::Client => runtime.block_on(channel.connect_to_async(endpoint))?,
        ConnectionRole::Host => runtime.block_on(channel.accept_async())?,
    }
    drop(runtime);

    if !script.handshake {
        return hang(channel, log);
    }
    if channel.role() == ConnectionRole::Client {
        channel.send_handshake()?;
    }
    let envelope = channel.receive()?;
    let peer: Handshake = channel.codec().decode_payload(envelope.message())?;
    if channel.role() == ConnectionRole::Host {
        channel.send_handshake()?;
    }
    let version = negotiate_version(script.protocol_version, peer.protocol_version);
    channel.set_version(version);
    *log.negotiated.lock() = Some(version);

    let envelope = channel.receive()?;
    if let ControllerMessage::SessionStart(start) =
        ControllerMessage::from_envelope(channel.codec(), &envelope)?
    {
        *log.session_start.lock() = Some(start);
    }

    for step in &script.steps {
        match step {
            Step::Send(tag, payload) => channel.send_payload(tag, payload)?,
            Step::SendRaw(raw) => channel.send_raw(raw)?,
            Step::Pause(duration) => thread::sleep(*duration),
            Step::AwaitAbort => loop {
                let envelope = channel.receive()?;
                if envelope.message_type() == message_type::ABORT {
                    log.abort_received.store(true, Ordering::SeqCst);
                    break;
                }
            },
            Step::Hang => return hang(channel, log),
            Step::Disconnect => {
                channel.stop();
                return Ok(());
            }
        }
    }
    Ok(())
}

fn hang(channel: &CommunicationChannel, log: &HostLog) -> Result<(), ChannelError> {
    while !log.killed.load(Ordering::SeqCst) && !channel.is_stopped() {
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

pub fn payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).expect("payload")
}

pub fn test_case(name: &str) -> TestCase {
    TestCase::new(name, "a.dll", "executor://fake")
}

pub fn passed(name: &str) -> TestResult {
    TestResult::new(test_case(name), TestOutcome::Passed)
}

pub fn session_end(total_tests: u64) -> Step {
    Step::Send(
        message_type::SESSION_END,
        serde_json::json!({ "total_tests": total_tests, "aborted": false, "elapsed_ms": 1 }),
    )
}

pub fn fast_config() -> ProctorConfig {
    ProctorConfig {
        connection_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(5),
        host_exit_grace: Duration::from_millis(200),
        ..ProctorConfig::default()
    }
}

/// Platform whose every host manager launches through `launcher`.
pub fn platform_with(launcher: Arc<ScriptedLauncher>, config: ProctorConfig) -> TestPlatform {
    let factory: HostManagerFactory = Arc::new(move || {
        let mut manager = DefaultTestHostManager::new("/nonexistent/testhost");
        manager.set_custom_launcher(launcher.clone());
        Box::new(manager)
    });
    TestPlatform::with_registry(config, HostManagerRegistry::new(factory))
}
