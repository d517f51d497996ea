#![forbid(unsafe_code)]
// Allow pedantic lints for early-stage API ergonomics.
#![allow(clippy::doc_markdown)]
#![allow(clippy::nursery)]
#![allow(clippy::pedantic)]

//! # Persh
//!
//! Persistent SSH shell sessions for tool-calling clients.
//!
//! Persh keeps one interactive shell open per logical session so that
//! working directory, environment variables and background jobs survive
//! across separate command invocations:
//! - Marker-framed completion detection over an echo-free shell stream
//! - Exactly one command in flight per session
//! - Inactivity eviction and idempotent teardown
//! - A registry mapping caller-visible ids to live sessions
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use persh::{Credentials, SessionConfig, SessionRegistry};
//! use persh::transport::RusshConnector;
//!
//! #[tokio::main]
//! async fn main() -> persh::Result<()> {
//!     let config = SessionConfig::default();
//!     let registry = SessionRegistry::new(Arc::new(RusshConnector::new(&config)), config);
//!
//!     let creds = Credentials::password("example.com", 22, "deploy", "hunter2");
//!     let session = registry.get_or_create("s1", creds, false).await?;
//!
//!     session.execute("cd /srv/app").await?;
//!     let out = session.execute("pwd").await?;
//!     assert_eq!(out.output, "/srv/app");
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub mod completion;
pub mod credentials;
pub mod session;
pub mod transport;

pub use completion::{CommandOutput, CompletionParser, Marker, ParseError, Submission};
pub use credentials::{AuthMethod, Credentials, HostTarget};
pub use session::{
    DisposeReason, PersistentSession, SessionConfig, SessionId, SessionInfo, SessionRegistry,
    SessionState,
};

// -----------------------------------------------------------------------------
// Error Types
// -----------------------------------------------------------------------------

/// Errors that can occur while driving persistent shell sessions.
///
/// The type is `Clone` so that every caller waiting on one shared connect
/// attempt observes the same failure.
///
/// # Recovery Strategies
///
/// | Error Variant | Class | Recovery Strategy |
/// |--------------|-------|-------------------|
/// | [`Connection`](Error::Connection) | connection | Check host, network, DNS |
/// | [`AuthenticationFailed`](Error::AuthenticationFailed) | connection | Fix credentials |
/// | [`KeyPassphraseRequired`](Error::KeyPassphraseRequired) | connection | Supply a passphrase |
/// | [`KeyDecryption`](Error::KeyDecryption) | connection | Fix the passphrase or key file |
/// | [`Transport`](Error::Transport) | protocol | Start a new session |
/// | [`SessionTransport`](Error::SessionTransport) | protocol | Start a new session |
/// | [`Protocol`](Error::Protocol) | protocol | Start a new session |
/// | [`Busy`](Error::Busy) | busy | Retry later or use another session |
/// | [`SessionNotFound`](Error::SessionNotFound) | not-found | Start a session first |
/// | [`Disposed`](Error::Disposed) | lifecycle | Start a new session |
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Connecting to the remote host failed (DNS, TCP, handshake).
    #[error("connection to {target} failed: {message}")]
    Connection {
        /// `user@host:port` of the attempted connection.
        target: String,
        /// Underlying failure description.
        message: String,
    },

    /// The remote host rejected every offered credential.
    #[error("authentication failed for {target} using {method}")]
    AuthenticationFailed {
        /// `user@host:port` of the attempted connection.
        target: String,
        /// Authentication method that was tried last.
        method: AuthMethod,
    },

    /// The private key is encrypted and no passphrase was supplied.
    #[error("private key {path} is encrypted and no passphrase was provided")]
    KeyPassphraseRequired {
        /// Path of the key file.
        path: String,
    },

    /// The private key could not be decrypted with the supplied passphrase.
    #[error("failed to decrypt private key {path}: {message}")]
    KeyDecryption {
        /// Path of the key file.
        path: String,
        /// Underlying failure description.
        message: String,
    },

    /// Any other key loading or agent failure.
    #[error("key error: {0}")]
    Key(String),

    /// The shell channel or connection failed outside any session.
    #[error("transport error: {0}")]
    Transport(String),

    /// A session's shell channel or connection failed after it was
    /// established.
    #[error("transport error on session {session} ({target}): {message}")]
    SessionTransport {
        /// Affected session.
        session: SessionId,
        /// `user@host:port` of the session.
        target: String,
        /// Underlying failure description.
        message: String,
    },

    /// The shell stream violated the completion protocol.
    #[error("protocol error on session {session}: {message}")]
    Protocol {
        /// Affected session.
        session: SessionId,
        /// What went wrong.
        message: String,
    },

    /// The shell did not print the readiness sentinel in time.
    #[error("shell on {target} did not become ready within {timeout:?}")]
    ReadyTimeout {
        /// `user@host:port` of the session.
        target: String,
        /// The configured readiness timeout.
        timeout: Duration,
    },

    /// A command is already in flight on this session.
    #[error("session {0} is busy executing another command")]
    Busy(SessionId),

    /// The session has been torn down.
    #[error("session {0} has been disposed")]
    Disposed(SessionId),

    /// The session closed while a command was pending.
    #[error("session {session} closed: {reason}")]
    SessionClosed {
        /// Affected session.
        session: SessionId,
        /// Why the session closed.
        reason: DisposeReason,
    },

    /// `execute` was called before the shell became ready.
    #[error("session {0} is not connected")]
    NotConnected(SessionId),

    /// No session is registered under this id.
    #[error("session {0} does not exist")]
    SessionNotFound(String),

    /// A live session already uses this id.
    #[error("session {0} already exists")]
    SessionExists(String),

    /// No host profile is stored under this id.
    #[error("unknown host {0}")]
    HostNotFound(String),

    /// The registry refused to create another session.
    #[error("maximum sessions reached ({max})")]
    MaxSessionsReached {
        /// Configured limit.
        max: usize,
    },

    /// Invalid configuration or input.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl Error {
    /// Returns true if the error is fatal to the session that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::AuthenticationFailed { .. }
                | Self::KeyPassphraseRequired { .. }
                | Self::KeyDecryption { .. }
                | Self::Key(_)
                | Self::Transport(_)
                | Self::SessionTransport { .. }
                | Self::Protocol { .. }
                | Self::ReadyTimeout { .. }
                | Self::SessionClosed { .. }
        )
    }

    /// Returns true for the recoverable "command already in flight" condition.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// A specialized [`Result`] type for persh operations.
pub type Result<T> = std::result::Result<T, Error>;

// -----------------------------------------------------------------------------
// PTY Types
// -----------------------------------------------------------------------------

/// Window size information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Terminal width in columns.
    pub width: u32,
    /// Terminal height in rows.
    pub height: u32,
}

impl Default for Window {
    fn default() -> Self {
        // Wide enough that typical command output is not hard-wrapped.
        Self {
            width: 200,
            height: 50,
        }
    }
}

/// Pseudo-terminal request sent when opening the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pty {
    /// Terminal type (e.g., "xterm-256color").
    pub term: String,
    /// Window dimensions.
    pub window: Window,
}

impl Default for Pty {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            window: Window::default(),
        }
    }
}

impl fmt::Display for Pty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}x{}", self.term, self.window.width, self.window.height)
    }
}
