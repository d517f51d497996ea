//! Persistent shell sessions and the registry that owns them.
//!
//! This module provides the session layer:
//! - [`PersistentSession`]: one shell channel, one command in flight,
//!   inactivity eviction and idempotent disposal
//! - [`SessionRegistry`]: caller-visible ids mapped to live sessions
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use persh::{SessionConfig, SessionRegistry};
//! use persh::transport::fake::FakeShell;
//!
//! let config = SessionConfig::default().with_inactivity_timeout(Duration::from_secs(600));
//! let registry = SessionRegistry::new(Arc::new(FakeShell::new()), config);
//!
//! let session = registry.get_or_create("build", creds, false).await?;
//! session.execute("cd /srv").await?;
//!
//! registry.remove("build");
//! ```

mod persistent;
mod registry;

use std::borrow::Borrow;
use std::fmt;
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use crate::Pty;
use crate::completion::DEFAULT_MAX_BUFFER_BYTES;

pub use persistent::PersistentSession;
pub use registry::SessionRegistry;

/// Caller-visible session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a [`PersistentSession`].
///
/// `Unconnected → Connecting → Ready ⇄ Executing`, with `Disposed`
/// reachable from every state and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, no connection attempted yet.
    Unconnected,
    /// Connecting, authenticating or priming the shell.
    Connecting,
    /// Idle and accepting commands.
    Ready,
    /// One command is in flight.
    Executing,
    /// Torn down.
    Disposed,
}

impl SessionState {
    /// Returns the lowercase state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Disposed => "disposed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session was disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisposeReason {
    /// Explicitly closed by the caller.
    Closed,
    /// The inactivity timer fired.
    InactivityTimeout,
    /// The channel or connection reported an error.
    TransportError,
    /// The remote side closed the channel.
    TransportClosed,
    /// Connecting, authenticating or priming failed.
    ConnectFailed,
    /// The output stream broke the completion protocol.
    ProtocolError,
    /// A new session took over the same id.
    Replaced,
    /// The owning registry shut down.
    Shutdown,
}

impl DisposeReason {
    /// Returns a short description used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed by client",
            Self::InactivityTimeout => "inactivity timeout",
            Self::TransportError => "transport error",
            Self::TransportClosed => "connection closed by remote host",
            Self::ConnectFailed => "connect failed",
            Self::ProtocolError => "protocol error",
            Self::Replaced => "replaced by a new session",
            Self::Shutdown => "server shutdown",
        }
    }
}

impl fmt::Display for DisposeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration shared by every session a registry creates.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle time after which a session disposes itself.
    pub inactivity_timeout: Duration,
    /// How long shell priming may take before the connect fails.
    pub ready_timeout: Duration,
    /// Bound on TCP connect plus SSH handshake.
    pub connect_timeout: Duration,
    /// Bytes buffered without a marker before the session is failed.
    pub max_buffer_bytes: usize,
    /// PTY requested for the shell.
    pub pty: Pty,
    /// Maximum number of live sessions per registry.
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(2 * 60 * 60),
            ready_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(30),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            pty: Pty::default(),
            max_sessions: 100,
        }
    }
}

impl SessionConfig {
    /// Sets the inactivity timeout.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Sets the shell readiness timeout.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the output buffer cap.
    pub fn with_max_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }

    /// Sets the PTY request.
    pub fn with_pty(mut self, pty: Pty) -> Self {
        self.pty = pty;
        self
    }

    /// Sets the live session limit.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }
}

/// Snapshot of a session for listing. Holds no secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Remote login name.
    pub username: String,
    /// Wall-clock creation time.
    pub created_at: SystemTime,
    /// Time since creation.
    pub uptime: Duration,
    /// Time since the last completed command or connect.
    pub idle_time: Duration,
    /// Most recently submitted command.
    pub last_command: Option<String>,
    /// Lifecycle state at snapshot time.
    pub state: SessionState,
}
