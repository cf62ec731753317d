mod local;
mod pool;
mod telnet;

use crate::config::{LocalConfig, SessionConfig, TelnetConfig};
use crate::error::{ApiError, ErrorCode, GatewayResult};
use crate::ids::IdGenerator;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;

pub use local::{LocalBackend, LocalMode};
pub use pool::SessionPool;
pub use telnet::{CONTINUE_COMMAND, TelnetBackend, TelnetParams};

/// Reply for a command that is blank after trimming; the backend is never touched.
pub const EMPTY_COMMAND_MESSAGE: &str = "command is empty string";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Local,
    Console,
    Telnet,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Local => "local",
            SessionType::Console => "console",
            SessionType::Telnet => "telnet",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionType {
    type Err = ApiError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "local" => Ok(SessionType::Local),
            "console" => Ok(SessionType::Console),
            "telnet" => Ok(SessionType::Telnet),
            other => Err(ApiError::new(
                ErrorCode::InvalidArgument,
                format!("Unknown session type: {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Longest wait for a single command's output.
    pub command: Duration,
    /// Longest gap between commands before the session closes itself.
    pub idle: Duration,
}

impl From<&SessionConfig> for SessionTimeouts {
    fn from(config: &SessionConfig) -> Self {
        Self {
            command: config.command_timeout(),
            idle: config.idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub session_type: SessionType,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub closed: bool,
}

/// Backend a session's processing task drives. Only that task ever holds it.
#[async_trait]
pub trait SessionBackend: Send {
    /// Backend setup performed once before the processing task starts.
    async fn connect(&mut self) -> GatewayResult<()> {
        Ok(())
    }

    /// Runs one non-empty, trimmed command and returns its output.
    ///
    /// An error is fatal: the session closes and the caller receives it.
    async fn execute(&mut self, command: &str) -> GatewayResult<String>;

    /// Checks the backend is still reachable. Errors are fatal like `execute` errors.
    async fn ping(&mut self) -> GatewayResult<()> {
        Ok(())
    }

    /// Releases the backend resource after the processing task stops.
    async fn shutdown(&mut self) {}
}

enum Operation {
    Command(String),
    Ping,
}

struct CommandRequest {
    operation: Operation,
    reply: oneshot::Sender<GatewayResult<String>>,
}

pub struct Session {
    id: String,
    session_type: SessionType,
    timeouts: SessionTimeouts,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
    backend: Mutex<Option<Box<dyn SessionBackend>>>,
    commands: OnceLock<mpsc::Sender<CommandRequest>>,
    created_at: u64,
    last_activity: AtomicU64,
}

impl Session {
    pub fn new(
        id: String,
        session_type: SessionType,
        timeouts: SessionTimeouts,
        backend: Box<dyn SessionBackend>,
    ) -> Self {
        let now = now_ms();
        Self {
            id,
            session_type,
            timeouts,
            closed: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            backend: Mutex::new(Some(backend)),
            commands: OnceLock::new(),
            created_at: now,
            last_activity: AtomicU64::new(now),
        }
    }

    /// Echo-mode local session.
    pub fn local(
        ids: &dyn IdGenerator,
        session: &SessionConfig,
        local: &LocalConfig,
    ) -> GatewayResult<Self> {
        let id = acquire_id(ids)?;
        let backend = LocalBackend::echo(Duration::from_millis(local.echo_delay_ms));
        tracing::info!(session_id = %id, session_type = "local", "Created session");
        Ok(Self::new(
            id,
            SessionType::Local,
            SessionTimeouts::from(session),
            Box::new(backend),
        ))
    }

    /// Session that runs each command as a local child process.
    pub fn console(ids: &dyn IdGenerator, session: &SessionConfig) -> GatewayResult<Self> {
        let id = acquire_id(ids)?;
        tracing::info!(session_id = %id, session_type = "console", "Created session");
        Ok(Self::new(
            id,
            SessionType::Console,
            SessionTimeouts::from(session),
            Box::new(LocalBackend::process()),
        ))
    }

    pub fn telnet(
        ids: &dyn IdGenerator,
        params: TelnetParams,
        session: &SessionConfig,
        telnet: &TelnetConfig,
    ) -> GatewayResult<Self> {
        params.validate()?;
        let id = acquire_id(ids)?;
        let timeouts = SessionTimeouts::from(session);
        tracing::info!(
            session_id = %id,
            session_type = "telnet",
            host = %params.host,
            port = params.port,
            "Created session"
        );
        let backend = TelnetBackend::new(params, telnet, timeouts.command);
        Ok(Self::new(id, SessionType::Telnet, timeouts, Box::new(backend)))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn timeouts(&self) -> SessionTimeouts {
        self.timeouts
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            session_type: self.session_type,
            created_at: self.created_at,
            last_activity_at: self.last_activity.load(Ordering::SeqCst),
            closed: self.is_closed(),
        }
    }

    /// Performs backend setup and starts the processing task.
    ///
    /// On failure the session is closed and its backend dropped, so any half-open
    /// connection is released.
    pub async fn connect(&self) -> GatewayResult<()> {
        let backend = self.take_backend();
        let Some(mut backend) = backend else {
            return Err(ApiError::new(
                ErrorCode::InvalidArgument,
                "Session was already connected",
            )
            .into());
        };
        if self.is_closed() {
            return Err(self.closed_error());
        }

        tracing::info!(session_id = %self.id, session_type = %self.session_type, "Connecting session");
        if let Err(err) = backend.connect().await {
            tracing::warn!(
                session_id = %self.id,
                session_type = %self.session_type,
                error = %err,
                "Session connect failed"
            );
            self.mark_closed();
            return Err(err);
        }

        let (sender, receiver) = mpsc::channel(1);
        if self.commands.set(sender).is_err() {
            self.mark_closed();
            return Err(ApiError::new(
                ErrorCode::InvalidArgument,
                "Session was already connected",
            )
            .into());
        }

        let task = ProcessingTask {
            session_id: self.id.clone(),
            session_type: self.session_type,
            idle_timeout: self.timeouts.idle,
            closed: self.closed.clone(),
            cancel: self.cancel.clone(),
        };
        tokio::spawn(task.run(backend, receiver));
        Ok(())
    }

    /// Submits one command and waits for its output.
    ///
    /// A response timeout is terminal: the session closes and the command is abandoned.
    pub async fn command(&self, text: &str) -> GatewayResult<String> {
        tracing::info!(session_id = %self.id, session_type = %self.session_type, command = %text, "Executing command");
        self.submit(Operation::Command(text.to_string())).await
    }

    /// Round trip through the processing task to the backend; `false` once the session is
    /// closed or the backend stopped answering.
    pub async fn ping(&self) -> bool {
        match self.submit(Operation::Ping).await {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(session_id = %self.id, error = %err, "Ping failed");
                false
            }
        }
    }

    async fn submit(&self, operation: Operation) -> GatewayResult<String> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let sender = self.commands.get().ok_or_else(|| {
            ApiError::new(ErrorCode::InvalidArgument, "Session is not connected")
        })?;

        self.touch();
        let deadline = Instant::now() + self.timeouts.command;
        let (reply, response) = oneshot::channel();
        let request = CommandRequest { operation, reply };

        match timeout_at(deadline, sender.send(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.mark_closed();
                return Err(self.closed_error());
            }
            Err(_) => return Err(self.expire()),
        }

        match timeout_at(deadline, response).await {
            Ok(Ok(result)) => {
                self.touch();
                result
            }
            // The processing task stopped without answering.
            Ok(Err(_)) => {
                self.mark_closed();
                Err(self.closed_error())
            }
            Err(_) => Err(self.expire()),
        }
    }

    /// Marks the session closed and stops its processing task. Never blocks.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!(session_id = %self.id, session_type = %self.session_type, "Closing session");
        }
        self.cancel.cancel();
        drop(self.take_backend());
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn expire(&self) -> crate::error::GatewayError {
        tracing::warn!(
            session_id = %self.id,
            session_type = %self.session_type,
            timeout_ms = self.timeouts.command.as_millis() as u64,
            "Timed out waiting for command output; closing session"
        );
        self.mark_closed();
        ApiError::new(ErrorCode::CommandTimeout, "Timed out waiting for command output")
            .with_details(format!("session_id={}", self.id))
            .into()
    }

    fn closed_error(&self) -> crate::error::GatewayError {
        ApiError::new(ErrorCode::SessionClosed, "Session is closed")
            .with_details(format!("session_id={}", self.id))
            .into()
    }

    fn take_backend(&self) -> Option<Box<dyn SessionBackend>> {
        self.backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::SeqCst);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("session_type", &self.session_type)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct ProcessingTask {
    session_id: String,
    session_type: SessionType,
    idle_timeout: Duration,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ProcessingTask {
    async fn run(
        self,
        mut backend: Box<dyn SessionBackend>,
        mut commands: mpsc::Receiver<CommandRequest>,
    ) {
        let reason = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break "disconnect requested",
                request = commands.recv() => {
                    let Some(CommandRequest { operation, reply }) = request else {
                        break "command channel closed";
                    };
                    let work = async {
                        match &operation {
                            Operation::Command(text) => {
                                let command = text.trim();
                                if command.is_empty() {
                                    return Ok(EMPTY_COMMAND_MESSAGE.to_string());
                                }
                                backend.execute(command).await
                            }
                            Operation::Ping => backend.ping().await.map(|()| String::new()),
                        }
                    };

                    let outcome = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => None,
                        result = work => Some(result),
                    };
                    match outcome {
                        None => break "cancelled during command",
                        Some(Ok(output)) => {
                            if reply.send(Ok(output)).is_err() {
                                tracing::debug!(
                                    session_id = %self.session_id,
                                    "Caller abandoned command; output dropped"
                                );
                            }
                        }
                        Some(Err(err)) => {
                            tracing::warn!(
                                session_id = %self.session_id,
                                session_type = %self.session_type,
                                error = %err,
                                "Backend failed; closing session"
                            );
                            self.closed.store(true, Ordering::SeqCst);
                            let _ = reply.send(Err(err));
                            break "backend failure";
                        }
                    }
                }
                _ = sleep(self.idle_timeout) => {
                    tracing::info!(
                        session_id = %self.session_id,
                        session_type = %self.session_type,
                        idle_timeout_ms = self.idle_timeout.as_millis() as u64,
                        "Idle timeout reached; closing session"
                    );
                    break "idle timeout";
                }
            }
        };

        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        commands.close();
        backend.shutdown().await;
        tracing::info!(session_id = %self.session_id, reason, "Session processing task stopped");
    }
}

fn acquire_id(ids: &dyn IdGenerator) -> GatewayResult<String> {
    ids.next_id().map_err(|err| {
        ApiError::new(ErrorCode::IdGeneration, "Failed to generate session id")
            .with_details(err.to_string())
            .into()
    })
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::GatewayError;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Default)]
    pub(crate) struct Recorder {
        pub executed: Arc<Mutex<Vec<String>>>,
        pub pings: Arc<AtomicUsize>,
        pub shutdowns: Arc<AtomicUsize>,
    }

    impl Recorder {
        pub fn executed(&self) -> Vec<String> {
            self.executed.lock().expect("recorder mutex poisoned").clone()
        }
    }

    /// Replies `out:<command>` after `delay`; fails on commands equal to `fail_on`.
    pub(crate) struct ScriptedBackend {
        pub recorder: Recorder,
        pub delay: Duration,
        pub fail_on: Option<String>,
        pub fail_connect: bool,
        pub fail_ping: bool,
    }

    impl ScriptedBackend {
        pub fn new(recorder: Recorder) -> Self {
            Self {
                recorder,
                delay: Duration::ZERO,
                fail_on: None,
                fail_connect: false,
                fail_ping: false,
            }
        }
    }

    #[async_trait]
    impl SessionBackend for ScriptedBackend {
        async fn connect(&mut self) -> GatewayResult<()> {
            if self.fail_connect {
                return Err(ApiError::new(ErrorCode::ConnectFailed, "refused").into());
            }
            Ok(())
        }

        async fn execute(&mut self, command: &str) -> GatewayResult<String> {
            self.recorder
                .executed
                .lock()
                .expect("recorder mutex poisoned")
                .push(command.to_string());
            if self.fail_on.as_deref() == Some(command) {
                return Err(ApiError::new(ErrorCode::RemoteClosed, "peer went away").into());
            }
            sleep(self.delay).await;
            Ok(format!("out:{command}"))
        }

        async fn ping(&mut self) -> GatewayResult<()> {
            self.recorder.pings.fetch_add(1, Ordering::SeqCst);
            if self.fail_ping {
                return Err(ApiError::new(ErrorCode::RemoteClosed, "peer went away").into());
            }
            Ok(())
        }

        async fn shutdown(&mut self) {
            self.recorder.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn timeouts(command_ms: u64, idle_ms: u64) -> SessionTimeouts {
        SessionTimeouts {
            command: Duration::from_millis(command_ms),
            idle: Duration::from_millis(idle_ms),
        }
    }

    fn scripted_session(backend: ScriptedBackend, timeouts: SessionTimeouts) -> Session {
        Session::new("s-1".to_string(), SessionType::Local, timeouts, Box::new(backend))
    }

    fn code(err: GatewayError) -> ErrorCode {
        err.code()
    }

    #[tokio::test]
    async fn commands_pair_with_outputs_in_order() {
        let recorder = Recorder::default();
        let session = scripted_session(ScriptedBackend::new(recorder.clone()), timeouts(1_000, 5_000));
        session.connect().await.expect("connect");

        for i in 0..5 {
            let output = session.command(&format!("cmd-{i}")).await.expect("command");
            assert_eq!(output, format!("out:cmd-{i}"));
        }
        assert_eq!(
            recorder.executed(),
            vec!["cmd-0", "cmd-1", "cmd-2", "cmd-3", "cmd-4"]
        );
    }

    #[tokio::test]
    async fn blank_command_is_answered_without_backend() {
        let recorder = Recorder::default();
        let session = scripted_session(ScriptedBackend::new(recorder.clone()), timeouts(1_000, 5_000));
        session.connect().await.expect("connect");

        assert_eq!(session.command("").await.expect("empty"), EMPTY_COMMAND_MESSAGE);
        assert_eq!(session.command("   \t ").await.expect("blank"), EMPTY_COMMAND_MESSAGE);
        assert!(recorder.executed().is_empty());
    }

    #[tokio::test]
    async fn ping_reaches_the_backend() {
        let recorder = Recorder::default();
        let session = scripted_session(ScriptedBackend::new(recorder.clone()), timeouts(1_000, 5_000));
        session.connect().await.expect("connect");

        assert!(session.ping().await);
        assert!(session.ping().await);
        assert_eq!(recorder.pings.load(Ordering::SeqCst), 2);
        assert!(recorder.executed().is_empty());
    }

    #[tokio::test]
    async fn failed_ping_reports_dead_and_closes_session() {
        let recorder = Recorder::default();
        let mut backend = ScriptedBackend::new(recorder.clone());
        backend.fail_ping = true;
        let session = scripted_session(backend, timeouts(1_000, 5_000));
        session.connect().await.expect("connect");

        assert!(!session.ping().await);
        assert!(session.is_closed());
        let err = session.command("uptime").await.unwrap_err();
        assert_eq!(code(err), ErrorCode::SessionClosed);
    }

    #[tokio::test]
    async fn command_is_trimmed_before_execution() {
        let recorder = Recorder::default();
        let session = scripted_session(ScriptedBackend::new(recorder.clone()), timeouts(1_000, 5_000));
        session.connect().await.expect("connect");

        session.command("  uptime  ").await.expect("command");
        assert_eq!(recorder.executed(), vec!["uptime"]);
    }

    #[tokio::test]
    async fn command_after_close_fails_fast() {
        let recorder = Recorder::default();
        let session = scripted_session(ScriptedBackend::new(recorder.clone()), timeouts(1_000, 5_000));
        session.connect().await.expect("connect");

        session.close();
        assert!(session.is_closed());
        let err = session.command("uptime").await.unwrap_err();
        assert_eq!(code(err), ErrorCode::SessionClosed);
        assert!(!session.ping().await);
        assert!(recorder.executed().is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_task() {
        let recorder = Recorder::default();
        let session = scripted_session(ScriptedBackend::new(recorder.clone()), timeouts(1_000, 5_000));
        session.connect().await.expect("connect");

        session.close();
        session.close();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn response_timeout_closes_session_and_drops_late_output() {
        let recorder = Recorder::default();
        let mut backend = ScriptedBackend::new(recorder.clone());
        backend.delay = Duration::from_millis(500);
        let session = scripted_session(backend, timeouts(50, 5_000));
        session.connect().await.expect("connect");

        let err = session.command("slow").await.unwrap_err();
        assert_eq!(code(err), ErrorCode::CommandTimeout);
        assert!(session.is_closed());

        // The task must exit instead of waiting to publish the late output.
        sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.shutdowns.load(Ordering::SeqCst), 1);
        let err = session.command("again").await.unwrap_err();
        assert_eq!(code(err), ErrorCode::SessionClosed);
    }

    #[tokio::test]
    async fn idle_session_closes_itself() {
        let recorder = Recorder::default();
        let session = scripted_session(ScriptedBackend::new(recorder.clone()), timeouts(1_000, 60));
        session.connect().await.expect("connect");
        assert!(!session.is_closed());

        sleep(Duration::from_millis(200)).await;
        assert!(session.is_closed());
        assert_eq!(recorder.shutdowns.load(Ordering::SeqCst), 1);

        // Closing after the task already exited must not block.
        session.close();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn commands_reset_the_idle_timer() {
        let recorder = Recorder::default();
        let session = scripted_session(ScriptedBackend::new(recorder.clone()), timeouts(1_000, 150));
        session.connect().await.expect("connect");

        for _ in 0..4 {
            sleep(Duration::from_millis(60)).await;
            session.command("keepalive").await.expect("command");
        }
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn backend_failure_is_fatal() {
        let recorder = Recorder::default();
        let mut backend = ScriptedBackend::new(recorder.clone());
        backend.fail_on = Some("boom".to_string());
        let session = scripted_session(backend, timeouts(1_000, 5_000));
        session.connect().await.expect("connect");

        let err = session.command("boom").await.unwrap_err();
        assert_eq!(code(err), ErrorCode::RemoteClosed);
        assert!(session.is_closed());
        let err = session.command("after").await.unwrap_err();
        assert_eq!(code(err), ErrorCode::SessionClosed);
    }

    #[tokio::test]
    async fn connect_failure_closes_session() {
        let recorder = Recorder::default();
        let mut backend = ScriptedBackend::new(recorder.clone());
        backend.fail_connect = true;
        let session = scripted_session(backend, timeouts(1_000, 5_000));

        let err = session.connect().await.unwrap_err();
        assert_eq!(code(err), ErrorCode::ConnectFailed);
        assert!(session.is_closed());
        let err = session.command("uptime").await.unwrap_err();
        assert_eq!(code(err), ErrorCode::SessionClosed);
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let session = scripted_session(ScriptedBackend::new(Recorder::default()), timeouts(1_000, 5_000));
        session.connect().await.expect("connect");
        let err = session.connect().await.unwrap_err();
        assert_eq!(code(err), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn command_before_connect_is_rejected() {
        let session = scripted_session(ScriptedBackend::new(Recorder::default()), timeouts(1_000, 5_000));
        let err = session.command("uptime").await.unwrap_err();
        assert_eq!(code(err), ErrorCode::InvalidArgument);
    }

    struct FailingIds;

    impl IdGenerator for FailingIds {
        fn next_id(&self) -> GatewayResult<String> {
            Err(ApiError::new(ErrorCode::IoError, "clock went backwards").into())
        }
    }

    #[test]
    fn id_generation_failure_is_reported() {
        let err = Session::console(&FailingIds, &SessionConfig::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::IdGeneration);
    }

    #[test]
    fn constructors_take_timeouts_from_config() {
        let config = SessionConfig {
            command_timeout_ms: 1_500,
            idle_timeout_ms: 9_000,
            reap_interval_ms: 0,
        };
        let session = Session::local(&crate::ids::UuidGenerator, &config, &LocalConfig::default())
            .expect("local");
        assert_eq!(session.session_type(), SessionType::Local);
        assert_eq!(session.timeouts(), timeouts(1_500, 9_000));
        assert!(!session.info().closed);
    }

    #[test]
    fn session_type_round_trips_through_str() {
        for kind in [SessionType::Local, SessionType::Console, SessionType::Telnet] {
            assert_eq!(kind.as_str().parse::<SessionType>().expect("parse"), kind);
        }
        assert!("ssh".parse::<SessionType>().is_err());
    }
}
