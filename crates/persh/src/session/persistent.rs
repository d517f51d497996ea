//! A single persistent shell session.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::sync::{OnceCell, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::{DisposeReason, SessionConfig, SessionId, SessionInfo, SessionState};
use crate::completion::{CommandOutput, CompletionParser, Marker};
use crate::transport::{ShellChannel, ShellConnector, ShellEvent, ShellWriter};
use crate::{Credentials, Error, HostTarget, Result};

type DisposeCallback = Box<dyn FnOnce(&PersistentSession) + Send>;
type PendingResult = oneshot::Sender<Result<CommandOutput>>;

/// One interactive shell reused across command executions.
///
/// The session moves through [`SessionState`]s. At most one command is in
/// flight; a second [`execute`](Self::execute) fails fast with
/// [`Error::Busy`]. Every teardown path (explicit close, inactivity,
/// transport failure) ends in the same idempotent disposal.
pub struct PersistentSession {
    id: SessionId,
    credentials: Credentials,
    config: SessionConfig,
    connector: Arc<dyn ShellConnector>,
    started_at: Instant,
    created_at: SystemTime,
    connected: OnceCell<Result<()>>,
    inner: Mutex<Inner>,
    on_dispose: Mutex<Option<DisposeCallback>>,
}

struct Inner {
    state: SessionState,
    parser: CompletionParser,
    pending: Option<PendingResult>,
    writer: Option<ShellWriter>,
    last_command: Option<String>,
    last_activity: Instant,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    pump: Option<JoinHandle<()>>,
    reason: Option<DisposeReason>,
}

impl PersistentSession {
    /// Creates an unconnected session.
    pub fn new(
        id: SessionId,
        credentials: Credentials,
        connector: Arc<dyn ShellConnector>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id,
            credentials,
            connector,
            started_at: now,
            created_at: SystemTime::now(),
            connected: OnceCell::new(),
            inner: Mutex::new(Inner {
                state: SessionState::Unconnected,
                parser: CompletionParser::with_max_buffer(config.max_buffer_bytes),
                pending: None,
                writer: None,
                last_command: None,
                last_activity: now,
                timer: None,
                timer_generation: 0,
                pump: None,
                reason: None,
            }),
            config,
            on_dispose: Mutex::new(None),
        })
    }

    /// Registers the callback run exactly once when the session is disposed.
    ///
    /// The callback runs without any session lock held.
    pub fn on_dispose(&self, callback: impl FnOnce(&PersistentSession) + Send + 'static) {
        *self.on_dispose.lock() = Some(Box::new(callback));
    }

    /// Returns the session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the connection target.
    pub fn target(&self) -> &HostTarget {
        &self.credentials.target
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Returns true once the session has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.state() == SessionState::Disposed
    }

    /// Returns why the session was disposed, if it was.
    pub fn dispose_reason(&self) -> Option<DisposeReason> {
        self.inner.lock().reason
    }

    /// Returns the time since the session was created.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Returns the time since the last completed command or connect.
    pub fn idle_time(&self) -> Duration {
        self.inner.lock().last_activity.elapsed()
    }

    /// Returns the most recently submitted command.
    pub fn last_command(&self) -> Option<String> {
        self.inner.lock().last_command.clone()
    }

    /// Returns a snapshot suitable for listing.
    pub fn info(&self) -> SessionInfo {
        let inner = self.inner.lock();
        let target = &self.credentials.target;
        SessionInfo {
            id: self.id.clone(),
            host: target.host.clone(),
            port: target.port,
            username: target.username.clone(),
            created_at: self.created_at,
            uptime: self.started_at.elapsed(),
            idle_time: inner.last_activity.elapsed(),
            last_command: inner.last_command.clone(),
            state: inner.state,
        }
    }

    /// Connects, opens and primes the shell if that has not happened yet.
    ///
    /// Concurrent callers share one connect attempt and all observe its
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after disposal, or the connect failure.
    /// A failed connect disposes the session.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        match self.state() {
            SessionState::Disposed => return Err(Error::Disposed(self.id.clone())),
            SessionState::Ready | SessionState::Executing => return Ok(()),
            SessionState::Unconnected | SessionState::Connecting => {}
        }

        self.connected
            .get_or_init(|| self.connect())
            .await
            .clone()?;

        if self.is_disposed() {
            return Err(Error::Disposed(self.id.clone()));
        }
        Ok(())
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Disposed {
                return Err(Error::Disposed(self.id.clone()));
            }
            inner.state = SessionState::Connecting;
        }

        let target = &self.credentials.target;
        info!(
            session_id = %self.id,
            host = %target.host,
            port = target.port,
            user = %target.username,
            method = %self.credentials.method(),
            "Connecting session"
        );
        let started = Instant::now();

        let ShellChannel { writer, events } =
            match self.connector.open_shell(&self.credentials, &self.config.pty).await {
                Ok(channel) => channel,
                Err(err) => {
                    error!(session_id = %self.id, error = %err, "Connect failed");
                    self.dispose_with(DisposeReason::ConnectFailed);
                    return Err(err);
                }
            };

        let ready = Marker::ready();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Disposed {
                writer.close();
                return Err(self.closed_error(&inner));
            }
            inner.parser.expect(ready.clone());
            inner.pending = Some(tx);
            inner.writer = Some(writer.clone());
            inner.pump = Some(tokio::spawn(pump_events(Arc::downgrade(self), events)));
        }

        if let Err(err) = writer.write(priming_script(&ready)) {
            self.dispose_with(DisposeReason::ConnectFailed);
            return Err(self.transport_error(err));
        }

        match tokio::time::timeout(self.config.ready_timeout, rx).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(err))) => {
                self.dispose_with(DisposeReason::ConnectFailed);
                return Err(err);
            }
            Ok(Err(_)) => return Err(self.closed_error(&self.inner.lock())),
            Err(_) => {
                let err = Error::ReadyTimeout {
                    target: target.to_string(),
                    timeout: self.config.ready_timeout,
                };
                error!(session_id = %self.id, error = %err, "Shell never became ready");
                self.dispose_with(DisposeReason::ConnectFailed);
                return Err(err);
            }
        }

        info!(
            session_id = %self.id,
            host = %target.host,
            duration_ms = started.elapsed().as_millis() as u64,
            "Session ready"
        );
        Ok(())
    }

    /// Runs one command and waits for its completion marker.
    ///
    /// A non-zero exit status is a normal result; the session stays usable.
    ///
    /// # Errors
    ///
    /// - [`Error::Busy`] while another command is in flight
    /// - [`Error::Disposed`] after disposal
    /// - [`Error::NotConnected`] before [`ensure_connected`](Self::ensure_connected)
    /// - the transport or protocol failure that disposed the session mid-command
    pub async fn execute(self: &Arc<Self>, command: &str) -> Result<CommandOutput> {
        let rx = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Ready => {}
                SessionState::Executing => {
                    warn!(session_id = %self.id, "Rejecting command, session is busy");
                    return Err(Error::Busy(self.id.clone()));
                }
                SessionState::Disposed => return Err(Error::Disposed(self.id.clone())),
                SessionState::Unconnected | SessionState::Connecting => {
                    return Err(Error::NotConnected(self.id.clone()));
                }
            }
            let Some(writer) = inner.writer.clone() else {
                return Err(Error::NotConnected(self.id.clone()));
            };

            let submission = inner.parser.submit(command);
            if let Err(err) = writer.write(submission.payload) {
                drop(inner);
                let err = self.transport_error(err);
                self.teardown(DisposeReason::TransportError, Some(err.clone()));
                return Err(err);
            }

            let (tx, rx) = oneshot::channel();
            inner.pending = Some(tx);
            inner.state = SessionState::Executing;
            inner.last_command = Some(command.to_string());
            inner.last_activity = Instant::now();
            self.arm_timer(&mut inner);
            rx
        };

        debug!(session_id = %self.id, command, "Executing command");
        let started = Instant::now();

        match rx.await {
            Ok(result) => {
                let output = result?;
                debug!(
                    session_id = %self.id,
                    exit_code = output.exit_code,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Command completed"
                );
                Ok(output)
            }
            Err(_) => Err(self.closed_error(&self.inner.lock())),
        }
    }

    /// Closes the session. Safe to call any number of times.
    pub fn dispose(&self) {
        self.dispose_with(DisposeReason::Closed);
    }

    /// Disposes the session for `reason`.
    ///
    /// Returns false if it was already disposed.
    pub fn dispose_with(&self, reason: DisposeReason) -> bool {
        self.teardown(reason, None)
    }

    fn teardown(&self, reason: DisposeReason, error: Option<Error>) -> bool {
        let callback = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Disposed {
                return false;
            }
            inner.state = SessionState::Disposed;
            inner.reason = Some(reason);

            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
            if let Some(writer) = inner.writer.take() {
                writer.close();
            }
            inner.parser.clear();

            if let Some(pending) = inner.pending.take() {
                let err = error.unwrap_or_else(|| self.closed_error(&inner));
                let _ = pending.send(Err(err));
            }
            self.on_dispose.lock().take()
        };

        info!(
            session_id = %self.id,
            host = %self.credentials.target.host,
            reason = %reason,
            uptime_secs = self.uptime().as_secs(),
            "Session disposed"
        );

        if let Some(callback) = callback {
            callback(self);
        }
        true
    }

    fn closed_error(&self, inner: &Inner) -> Error {
        match inner.reason {
            Some(reason) => Error::SessionClosed {
                session: self.id.clone(),
                reason,
            },
            None => Error::Disposed(self.id.clone()),
        }
    }

    /// Attaches the session id and target to a bare transport failure.
    fn transport_error(&self, err: Error) -> Error {
        match err {
            Error::Transport(message) => Error::SessionTransport {
                session: self.id.clone(),
                target: self.credentials.target.to_string(),
                message,
            },
            other => other,
        }
    }

    fn handle_event(self: &Arc<Self>, event: ShellEvent) {
        match event {
            ShellEvent::Data(bytes) => {
                trace!(session_id = %self.id, len = bytes.len(), "Shell output");
                let mut inner = self.inner.lock();
                if inner.state == SessionState::Disposed {
                    return;
                }
                let fed = inner.parser.feed(&bytes);
                match fed {
                    Ok(Some(output)) => {
                        if matches!(
                            inner.state,
                            SessionState::Connecting | SessionState::Executing
                        ) {
                            inner.state = SessionState::Ready;
                        }
                        inner.last_activity = Instant::now();
                        self.arm_timer(&mut inner);
                        if let Some(pending) = inner.pending.take() {
                            let _ = pending.send(Ok(output));
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        drop(inner);
                        error!(session_id = %self.id, error = %err, "Completion protocol violated");
                        let err = Error::Protocol {
                            session: self.id.clone(),
                            message: err.to_string(),
                        };
                        self.teardown(DisposeReason::ProtocolError, Some(err));
                    }
                }
            }
            ShellEvent::Error(message) => {
                warn!(session_id = %self.id, error = %message, "Transport error");
                let err = self.transport_error(Error::Transport(message));
                self.teardown(DisposeReason::TransportError, Some(err));
            }
            ShellEvent::Closed => {
                debug!(session_id = %self.id, "Shell channel closed by remote");
                self.dispose_with(DisposeReason::TransportClosed);
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, inner: &mut Inner) {
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.timer_generation += 1;
        let generation = inner.timer_generation;
        let timeout = self.config.inactivity_timeout;
        let session = Arc::downgrade(self);

        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = session.upgrade() {
                session.inactivity_elapsed(generation);
            }
        }));
    }

    fn inactivity_elapsed(&self, generation: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.timer_generation != generation || inner.state == SessionState::Disposed {
                return;
            }
            // Detach so disposal does not abort the task running this.
            inner.timer = None;
        }
        info!(
            session_id = %self.id,
            timeout_secs = self.config.inactivity_timeout.as_secs(),
            "Session idle too long"
        );
        self.dispose_with(DisposeReason::InactivityTimeout);
    }
}

impl std::fmt::Debug for PersistentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentSession")
            .field("id", &self.id)
            .field("target", &self.credentials.target)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for PersistentSession {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        if let Some(writer) = inner.writer.take() {
            writer.close();
        }
    }
}

async fn pump_events(
    session: Weak<PersistentSession>,
    mut events: mpsc::UnboundedReceiver<ShellEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        let terminal = !matches!(event, ShellEvent::Data(_));
        session.handle_event(event);
        if terminal {
            return;
        }
    }

    // The transport dropped its sender without saying why.
    if let Some(session) = session.upgrade() {
        session.dispose_with(DisposeReason::TransportClosed);
    }
}

/// Shell statements that make the stream predictable, then print `ready`.
fn priming_script(ready: &Marker) -> String {
    format!(
        "stty -echo 2>/dev/null\n\
         unset PROMPT_COMMAND\n\
         export PS1='' PS2=''\n\
         bind 'set enable-bracketed-paste off' 2>/dev/null\n\
         {}\n",
        ready.echo_statement(false)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeShell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn new_session(shell: &FakeShell, config: SessionConfig) -> Arc<PersistentSession> {
        PersistentSession::new(
            SessionId::from("t1"),
            Credentials::password("fake", 22, "user", "pw"),
            Arc::new(shell.clone()),
            config,
        )
    }

    async fn connected(shell: &FakeShell) -> Arc<PersistentSession> {
        let session = new_session(shell, SessionConfig::default());
        session.ensure_connected().await.unwrap();
        session
    }

    #[test]
    fn test_priming_script_hides_ready_marker() {
        let ready = Marker::new(crate::completion::READY_PREFIX, "abc");
        let script = priming_script(&ready);
        assert!(script.starts_with("stty -echo"));
        assert!(script.contains("PS1=''"));
        assert!(!script.contains(ready.as_str()));
        assert!(script.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_execute_before_connect_is_rejected() {
        let session = new_session(&FakeShell::new(), SessionConfig::default());
        let err = session.execute("pwd").await.unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
        assert_eq!(session.state(), SessionState::Unconnected);
    }

    #[tokio::test]
    async fn test_connect_then_execute() {
        let shell = FakeShell::new();
        shell.banner("Welcome to fakehost\r\n$ ");
        let session = connected(&shell).await;
        assert_eq!(session.state(), SessionState::Ready);

        let out = session.execute("pwd").await.unwrap();
        assert_eq!(out.output, "/home/user");
        assert_eq!(out.exit_code, 0);
        assert_eq!(session.last_command().as_deref(), Some("pwd"));
    }

    #[tokio::test]
    async fn test_state_persists_between_commands() {
        let shell = FakeShell::new();
        let session = connected(&shell).await;

        session.execute("cd /var/log").await.unwrap();
        session.execute("export STAGE=blue").await.unwrap();
        assert_eq!(session.execute("pwd").await.unwrap().output, "/var/log");
        assert_eq!(session.execute("echo $STAGE").await.unwrap().output, "blue");
    }

    #[tokio::test]
    async fn test_non_zero_exit_keeps_session_ready() {
        let shell = FakeShell::new();
        shell.respond("make test", "1 failed", 2);
        let session = connected(&shell).await;

        let out = session.execute("make test").await.unwrap();
        assert_eq!(out.output, "1 failed");
        assert_eq!(out.exit_code, 2);
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.execute("true").await.unwrap().success());
    }

    #[tokio::test]
    async fn test_tiny_chunks() {
        let shell = FakeShell::new();
        shell.chunk_size(3).respond("cat notes", "line one\nline two", 0);
        let session = connected(&shell).await;

        let out = session.execute("cat notes").await.unwrap();
        assert_eq!(out.output, "line one\nline two");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_attempt() {
        let shell = FakeShell::new();
        shell.connect_delay(Duration::from_millis(50));
        let session = new_session(&shell, SessionConfig::default());

        let (a, b) = tokio::join!(session.ensure_connected(), session.ensure_connected());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(shell.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_failure() {
        let shell = FakeShell::new();
        shell.connect_delay(Duration::from_millis(50));
        shell.fail_connect(Error::Connection {
            target: "user@fake:22".into(),
            message: "no route to host".into(),
        });
        let session = new_session(&shell, SessionConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        session.on_dispose(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (a, b) = tokio::join!(session.ensure_connected(), session.ensure_connected());
        let (a, b) = (a.unwrap_err(), b.unwrap_err());
        assert!(matches!(a, Error::Connection { .. }), "{a:?}");
        assert!(matches!(b, Error::Connection { .. }), "{b:?}");
        assert_eq!(a.to_string(), b.to_string());
        assert!(a.to_string().contains("no route to host"));
        assert_eq!(shell.connect_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.dispose_reason(), Some(DisposeReason::ConnectFailed));
    }

    #[tokio::test]
    async fn test_connect_failure_disposes() {
        let shell = FakeShell::new();
        shell.fail_connect(Error::Connection {
            target: "user@fake:22".into(),
            message: "connection refused".into(),
        });
        let session = new_session(&shell, SessionConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        session.on_dispose(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let err = session.ensure_connected().await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(session.dispose_reason(), Some(DisposeReason::ConnectFailed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = session.ensure_connected().await.unwrap_err();
        assert!(matches!(err, Error::Disposed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_timeout() {
        let shell = FakeShell::new();
        shell.never_ready();
        let session = new_session(
            &shell,
            SessionConfig::default().with_ready_timeout(Duration::from_secs(2)),
        );

        let err = session.ensure_connected().await.unwrap_err();
        assert!(matches!(err, Error::ReadyTimeout { .. }));
        assert!(session.is_disposed());
        assert!(shell.last_channel().unwrap().written().contains("stty -echo"));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let shell = FakeShell::new();
        let session = connected(&shell).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        session.on_dispose(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(session.dispose_with(DisposeReason::Closed));
        assert!(!session.dispose_with(DisposeReason::Closed));
        session.dispose();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.dispose_reason(), Some(DisposeReason::Closed));

        assert!(matches!(
            session.execute("pwd").await,
            Err(Error::Disposed(_))
        ));
        assert!(matches!(
            session.ensure_connected().await,
            Err(Error::Disposed(_))
        ));
    }

    #[tokio::test]
    async fn test_buffer_overflow_is_protocol_error() {
        let shell = FakeShell::new();
        shell.respond("cat big", &"x".repeat(1000), 0);
        let session = new_session(&shell, SessionConfig::default().with_max_buffer_bytes(256));
        session.ensure_connected().await.unwrap();

        let err = session.execute("cat big").await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        assert_eq!(session.dispose_reason(), Some(DisposeReason::ProtocolError));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_disposes() {
        let shell = FakeShell::new();
        let session = new_session(
            &shell,
            SessionConfig::default().with_inactivity_timeout(Duration::from_secs(60)),
        );
        session.ensure_connected().await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        session.execute("pwd").await.unwrap();
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(session.state(), SessionState::Ready);

        tokio::time::sleep(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;
        assert_eq!(session.dispose_reason(), Some(DisposeReason::InactivityTimeout));
        assert!(shell.last_channel().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_info_has_no_secrets() {
        let shell = FakeShell::new();
        let session = connected(&shell).await;
        session.execute("whoami").await.unwrap();

        let info = session.info();
        assert_eq!(info.host, "fake");
        assert_eq!(info.port, 22);
        assert_eq!(info.username, "user");
        assert_eq!(info.last_command.as_deref(), Some("whoami"));
        assert_eq!(info.state, SessionState::Ready);
    }
}
