//! The shell transport seam.
//!
//! A [`ShellConnector`] opens one interactive PTY shell and hands back a
//! [`ShellChannel`]: a non-blocking writer plus a stream of [`ShellEvent`]s.
//! Sessions never talk to the SSH library directly, which keeps the
//! completion protocol and lifecycle testable against [`fake::FakeShell`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Credentials, Error, Pty, Result};

pub mod fake;
mod ssh;

pub use ssh::RusshConnector;

/// Something that happened on an open shell channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// Bytes from the remote shell (stdout and stderr interleaved).
    Data(Vec<u8>),
    /// The channel or connection failed.
    Error(String),
    /// The channel closed.
    Closed,
}

/// Instructions accepted by a transport's pump task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellInput {
    /// Bytes to write to the shell's stdin.
    Data(Vec<u8>),
    /// Close the channel and end the connection.
    Close,
}

/// Write half of a shell channel.
#[derive(Debug, Clone)]
pub struct ShellWriter {
    tx: mpsc::UnboundedSender<ShellInput>,
}

impl ShellWriter {
    /// Wraps the sender side of a pump task's input queue.
    pub fn new(tx: mpsc::UnboundedSender<ShellInput>) -> Self {
        Self { tx }
    }

    /// Queues bytes for the remote shell.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the channel is already gone.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.tx
            .send(ShellInput::Data(data.into()))
            .map_err(|_| Error::Transport("shell channel is closed".to_string()))
    }

    /// Asks the transport to close the channel and connection.
    pub fn close(&self) {
        let _ = self.tx.send(ShellInput::Close);
    }

    /// Returns true once the transport has stopped accepting input.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open interactive shell.
#[derive(Debug)]
pub struct ShellChannel {
    /// Write half.
    pub writer: ShellWriter,
    /// Events from the remote side, in arrival order.
    pub events: mpsc::UnboundedReceiver<ShellEvent>,
}

/// Opens interactive shells on remote hosts.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    /// Connects, authenticates, requests a PTY and starts a shell.
    async fn open_shell(&self, credentials: &Credentials, pty: &Pty) -> Result<ShellChannel>;
}
