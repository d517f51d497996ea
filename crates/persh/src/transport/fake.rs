//! In-memory scripted shell for exercising sessions without a network.
//!
//! [`FakeShell`] implements [`ShellConnector`] and emulates just enough of
//! an interactive POSIX shell behind a PTY to drive the completion protocol:
//! terminal echo until `stty -echo`, `echo` with `$?` and `$VAR` expansion,
//! `cd`/`pwd`, `export`, and scripted responses for anything else.
//!
//! # Example
//!
//! ```rust,ignore
//! let shell = FakeShell::new();
//! shell.respond("uname -s", "Linux", 0);
//! let registry = SessionRegistry::new(Arc::new(shell.clone()), SessionConfig::default());
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::{ShellChannel, ShellConnector, ShellEvent, ShellInput, ShellWriter};
use crate::completion::READY_PREFIX;
use crate::{Credentials, Error, Pty, Result};

const DEFAULT_HOME: &str = "/home/user";

/// A scripted reply to one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Text printed by the command (`\n` is sent as `\r\n`).
    pub output: String,
    /// Exit status stored in `$?`.
    pub exit_code: i32,
    /// Time the command "runs" before printing.
    pub delay: Duration,
}

#[derive(Debug, Default)]
struct Script {
    responses: HashMap<String, Response>,
    fail_connect: Option<Error>,
    connect_delay: Duration,
    banner: Option<String>,
    chunk_size: Option<usize>,
    never_ready: bool,
    channels: Vec<FakeChannelControl>,
}

/// A [`ShellConnector`] that opens scripted in-memory shells.
#[derive(Clone, Default)]
pub struct FakeShell {
    script: Arc<Mutex<Script>>,
    connects: Arc<AtomicUsize>,
}

impl std::fmt::Debug for FakeShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeShell")
            .field("connects", &self.connect_count())
            .finish()
    }
}

impl FakeShell {
    /// Creates a shell with no scripted commands.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the reply to an exact command line.
    pub fn respond(&self, command: &str, output: &str, exit_code: i32) -> &Self {
        self.respond_after(command, output, exit_code, Duration::ZERO)
    }

    /// Scripts a reply that is printed after `delay`.
    pub fn respond_after(
        &self,
        command: &str,
        output: &str,
        exit_code: i32,
        delay: Duration,
    ) -> &Self {
        self.script.lock().responses.insert(
            command.to_string(),
            Response {
                output: output.to_string(),
                exit_code,
                delay,
            },
        );
        self
    }

    /// Makes every subsequent connect attempt fail with `error`.
    pub fn fail_connect(&self, error: Error) -> &Self {
        self.script.lock().fail_connect = Some(error);
        self
    }

    /// Lets connect attempts succeed again.
    pub fn allow_connect(&self) -> &Self {
        self.script.lock().fail_connect = None;
        self
    }

    /// Delays every connect attempt.
    pub fn connect_delay(&self, delay: Duration) -> &Self {
        self.script.lock().connect_delay = delay;
        self
    }

    /// Prints `banner` as soon as a shell opens, like a MOTD and prompt.
    pub fn banner(&self, banner: &str) -> &Self {
        self.script.lock().banner = Some(banner.to_string());
        self
    }

    /// Splits every emitted line into chunks of at most `size` bytes.
    pub fn chunk_size(&self, size: usize) -> &Self {
        self.script.lock().chunk_size = Some(size.max(1));
        self
    }

    /// Never prints the readiness sentinel.
    pub fn never_ready(&self) -> &Self {
        self.script.lock().never_ready = true;
        self
    }

    /// Returns the number of connect attempts so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Returns controls for the most recently opened shell.
    pub fn last_channel(&self) -> Option<FakeChannelControl> {
        self.script.lock().channels.last().cloned()
    }

    /// Returns controls for every shell opened so far.
    pub fn channels(&self) -> Vec<FakeChannelControl> {
        self.script.lock().channels.clone()
    }
}

#[async_trait]
impl ShellConnector for FakeShell {
    async fn open_shell(&self, credentials: &Credentials, _pty: &Pty) -> Result<ShellChannel> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let delay = self.script.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.script.lock().fail_connect.clone() {
            return Err(err);
        }

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let control = FakeChannelControl {
            events: events_tx.clone(),
            written: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(Mutex::new(false)),
        };

        let (banner, chunk_size, never_ready) = {
            let mut script = self.script.lock();
            script.channels.push(control.clone());
            (script.banner.clone(), script.chunk_size, script.never_ready)
        };

        let emulator = Emulator {
            script: Arc::clone(&self.script),
            events: events_tx,
            control: control.clone(),
            chunk_size,
            never_ready,
            echo: true,
            status: 0,
            cwd: DEFAULT_HOME.to_string(),
            env: HashMap::from([("HOME".to_string(), DEFAULT_HOME.to_string())]),
            user: credentials.target.username.clone(),
        };
        if let Some(banner) = banner {
            emulator.emit(&banner);
        }
        tokio::spawn(emulator.run(input_rx));

        Ok(ShellChannel {
            writer: ShellWriter::new(input_tx),
            events: events_rx,
        })
    }
}

/// Handle for poking at one opened fake shell.
#[derive(Debug, Clone)]
pub struct FakeChannelControl {
    events: mpsc::UnboundedSender<ShellEvent>,
    written: Arc<Mutex<Vec<u8>>>,
    closed: Arc<Mutex<bool>>,
}

impl FakeChannelControl {
    /// Delivers raw bytes as if the remote shell printed them.
    pub fn send_data(&self, data: &str) {
        let _ = self.events.send(ShellEvent::Data(data.as_bytes().to_vec()));
    }

    /// Simulates a transport failure.
    pub fn fail(&self, message: &str) {
        let _ = self.events.send(ShellEvent::Error(message.to_string()));
    }

    /// Simulates the remote side closing the channel.
    pub fn close(&self) {
        let _ = self.events.send(ShellEvent::Closed);
    }

    /// Returns everything the session wrote to this shell.
    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.written.lock()).into_owned()
    }

    /// Returns true once the session asked the transport to close.
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

struct Emulator {
    script: Arc<Mutex<Script>>,
    events: mpsc::UnboundedSender<ShellEvent>,
    control: FakeChannelControl,
    chunk_size: Option<usize>,
    never_ready: bool,
    echo: bool,
    status: i32,
    cwd: String,
    env: HashMap<String, String>,
    user: String,
}

impl Emulator {
    async fn run(mut self, mut input: mpsc::UnboundedReceiver<ShellInput>) {
        let mut pending = String::new();

        while let Some(msg) = input.recv().await {
            match msg {
                ShellInput::Data(bytes) => {
                    self.control.written.lock().extend_from_slice(&bytes);
                    pending.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(idx) = pending.find('\n') {
                        let line: String = pending.drain(..=idx).collect();
                        self.line(line.trim_end_matches(['\r', '\n'])).await;
                    }
                }
                ShellInput::Close => {
                    *self.control.closed.lock() = true;
                    break;
                }
            }
        }
    }

    async fn line(&mut self, line: &str) {
        trace!(line, "Fake shell input");
        if self.echo {
            self.emit(&format!("{line}\n"));
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        let scripted = self.script.lock().responses.get(trimmed).cloned();
        if let Some(response) = scripted {
            if !response.delay.is_zero() {
                tokio::time::sleep(response.delay).await;
            }
            if !response.output.is_empty() {
                self.emit(&format!("{}\n", response.output));
            }
            self.status = response.exit_code;
            return;
        }

        let (word, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        self.status = match word {
            "stty" => {
                if rest.contains("-echo") {
                    self.echo = false;
                }
                0
            }
            "echo" => {
                let text = self.expand(&rest.replace(['"', '\''], ""));
                if self.never_ready && text.contains(READY_PREFIX) {
                    return;
                }
                self.emit(&format!("{text}\n"));
                0
            }
            "export" => {
                for assignment in rest.split_whitespace() {
                    if let Some((name, value)) = assignment.split_once('=') {
                        let value = self.expand(&value.replace(['"', '\''], ""));
                        self.env.insert(name.to_string(), value);
                    }
                }
                0
            }
            "unset" | "bind" | "true" => 0,
            "false" => 1,
            // Sets the status without ending the shell.
            "exit" => rest.trim().parse().unwrap_or(0),
            "pwd" => {
                self.emit(&format!("{}\n", self.cwd));
                0
            }
            "whoami" => {
                self.emit(&format!("{}\n", self.user));
                0
            }
            "cd" => self.change_dir(rest),
            _ => {
                self.emit(&format!("sh: {word}: command not found\n"));
                127
            }
        };
    }

    fn change_dir(&mut self, arg: &str) -> i32 {
        let arg = arg.trim();
        let next = if arg.is_empty() || arg == "~" {
            DEFAULT_HOME.to_string()
        } else if arg.starts_with('/') {
            arg.to_string()
        } else {
            format!("{}/{}", self.cwd.trim_end_matches('/'), arg)
        };
        self.cwd = next;
        0
    }

    fn expand(&self, text: &str) -> String {
        let mut out = text.replace("$?", &self.status.to_string());
        let mut names: Vec<&String> = self.env.keys().collect();
        // Longest first so `$HOMEDIR` is not clobbered by `$HOME`.
        names.sort_by_key(|name| std::cmp::Reverse(name.len()));
        for name in names {
            out = out.replace(&format!("${name}"), &self.env[name]);
        }
        out
    }

    fn emit(&self, text: &str) {
        let bytes = text.replace('\n', "\r\n").into_bytes();
        match self.chunk_size {
            Some(size) => {
                for chunk in bytes.chunks(size) {
                    let _ = self.events.send(ShellEvent::Data(chunk.to_vec()));
                }
            }
            None => {
                let _ = self.events.send(ShellEvent::Data(bytes));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(channel: &mut ShellChannel, until: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(until) {
            match channel.events.recv().await {
                Some(ShellEvent::Data(bytes)) => seen.push_str(&String::from_utf8_lossy(&bytes)),
                other => panic!("unexpected event {other:?}"),
            }
        }
        seen
    }

    fn creds() -> Credentials {
        Credentials::password("fake", 22, "alice", "pw")
    }

    #[tokio::test]
    async fn test_echo_until_stty() {
        let shell = FakeShell::new();
        let mut channel = shell.open_shell(&creds(), &Pty::default()).await.unwrap();

        channel.writer.write("stty -echo\necho hi\n").unwrap();
        let seen = collect(&mut channel, "hi\r\n").await;
        assert!(seen.starts_with("stty -echo\r\n"));
        assert!(!seen.contains("echo hi"));
    }

    #[tokio::test]
    async fn test_status_and_env_expansion() {
        let shell = FakeShell::new();
        shell.respond("make", "boom", 2);
        let mut channel = shell.open_shell(&creds(), &Pty::default()).await.unwrap();

        channel
            .writer
            .write("stty -echo\nmake\necho \"st\"\"at=$?\"\nexport GREETING=hello\necho $GREETING\n")
            .unwrap();
        let seen = collect(&mut channel, "hello\r\n").await;
        assert!(seen.contains("boom\r\nstat=2\r\n"));
    }

    #[tokio::test]
    async fn test_cd_and_pwd() {
        let shell = FakeShell::new();
        let mut channel = shell.open_shell(&creds(), &Pty::default()).await.unwrap();

        channel.writer.write("stty -echo\ncd /srv\ncd app\npwd\n").unwrap();
        collect(&mut channel, "/srv/app\r\n").await;
    }

    #[tokio::test]
    async fn test_connect_failure_is_counted() {
        let shell = FakeShell::new();
        shell.fail_connect(Error::Connection {
            target: "alice@fake:22".into(),
            message: "refused".into(),
        });
        assert!(shell.open_shell(&creds(), &Pty::default()).await.is_err());
        assert_eq!(shell.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_close_is_recorded() {
        let shell = FakeShell::new();
        let channel = shell.open_shell(&creds(), &Pty::default()).await.unwrap();
        channel.writer.write("stty -echo\n").unwrap();
        channel.writer.close();

        let control = shell.last_channel().unwrap();
        for _ in 0..50 {
            if control.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(control.is_closed());
        assert_eq!(control.written(), "stty -echo\n");
    }
}
