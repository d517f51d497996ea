//! russh-backed shell transport.
//!
//! Each opened shell gets one pump task that owns the russh channel and
//! connection handle. The task forwards queued writes to the channel and
//! channel messages to the session as [`ShellEvent`]s, so the session side
//! never awaits the SSH library while holding its own state.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::{ShellChannel, ShellConnector, ShellEvent, ShellInput, ShellWriter};
use crate::credentials::Auth;
use crate::{Credentials, Error, HostTarget, Pty, Result, SessionConfig};

/// Opens PTY shells over SSH using russh.
pub struct RusshConnector {
    config: Arc<client::Config>,
    connect_timeout: Duration,
}

impl RusshConnector {
    /// Creates a connector using the timeouts in `config`.
    pub fn new(config: &SessionConfig) -> Self {
        let ssh_config = client::Config {
            // Session idleness is handled by the session's own timer.
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        Self {
            config: Arc::new(ssh_config),
            connect_timeout: config.connect_timeout,
        }
    }

    async fn connect(&self, target: &HostTarget) -> Result<Handle<ClientHandler>> {
        let handler = ClientHandler {
            target: target.to_string(),
        };
        let addr = (target.host.clone(), target.port);
        let connecting = client::connect(Arc::clone(&self.config), addr, handler);

        match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(err)) => Err(Error::Connection {
                target: target.to_string(),
                message: err.to_string(),
            }),
            Err(_) => Err(Error::Connection {
                target: target.to_string(),
                message: format!("timed out after {:?}", self.connect_timeout),
            }),
        }
    }
}

impl std::fmt::Debug for RusshConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshConnector")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[async_trait]
impl ShellConnector for RusshConnector {
    async fn open_shell(&self, credentials: &Credentials, pty: &Pty) -> Result<ShellChannel> {
        let target = &credentials.target;
        let mut handle = self.connect(target).await?;
        debug!(target = %target, "SSH handshake complete");

        authenticate(&mut handle, credentials).await?;
        info!(target = %target, method = %credentials.method(), "SSH authenticated");

        let channel = open_pty_shell(&handle, pty).await.map_err(|err| Error::Connection {
            target: target.to_string(),
            message: format!("failed to open shell: {err}"),
        })?;

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(handle, channel, input_rx, events_tx, target.to_string()));

        Ok(ShellChannel {
            writer: ShellWriter::new(input_tx),
            events: events_rx,
        })
    }
}

struct ClientHandler {
    target: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        info!(
            target = %self.target,
            fingerprint = %server_public_key.fingerprint(),
            "Accepting server host key"
        );
        Ok(true)
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    credentials: &Credentials,
) -> Result<()> {
    let target = &credentials.target;
    let user = target.username.clone();
    let transport_err = |err: russh::Error| Error::Connection {
        target: target.to_string(),
        message: err.to_string(),
    };

    let accepted = match &credentials.auth {
        Auth::Password(password) => handle
            .authenticate_password(user, password.clone())
            .await
            .map_err(transport_err)?,
        Auth::KeyFile { path, passphrase } => {
            let key_pair = load_key(path, passphrase.as_deref())?;
            handle
                .authenticate_publickey(user, Arc::new(key_pair))
                .await
                .map_err(transport_err)?
        }
        Auth::Agent => authenticate_with_agent(handle, &user).await?,
    };

    if accepted {
        Ok(())
    } else {
        Err(Error::AuthenticationFailed {
            target: target.to_string(),
            method: credentials.method(),
        })
    }
}

fn load_key(path: &Path, passphrase: Option<&str>) -> Result<key::KeyPair> {
    let shown = path.display().to_string();
    if !path.exists() {
        return Err(Error::Key(format!("private key {shown} does not exist")));
    }

    russh_keys::load_secret_key(path, passphrase).map_err(|err| match err {
        russh_keys::Error::KeyIsEncrypted => Error::KeyPassphraseRequired { path: shown },
        other if passphrase.is_some() => Error::KeyDecryption {
            path: shown,
            message: other.to_string(),
        },
        other => Error::Key(format!("failed to load {shown}: {other}")),
    })
}

#[cfg(unix)]
async fn authenticate_with_agent(
    handle: &mut Handle<ClientHandler>,
    user: &str,
) -> Result<bool> {
    use russh_keys::agent::client::AgentClient;

    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|err| Error::Key(format!("ssh agent unavailable: {err}")))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|err| Error::Key(format!("ssh agent refused to list keys: {err}")))?;

    if identities.is_empty() {
        return Err(Error::Key("ssh agent holds no identities".to_string()));
    }

    for identity in identities {
        let fingerprint = identity.fingerprint();
        let (returned, result) = handle.authenticate_future(user, identity, agent).await;
        agent = returned;
        match result {
            Ok(true) => return Ok(true),
            Ok(false) => debug!(%fingerprint, "Agent identity rejected"),
            Err(err) => warn!(%fingerprint, error = %err, "Agent signing failed"),
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_with_agent(
    _handle: &mut Handle<ClientHandler>,
    _user: &str,
) -> Result<bool> {
    Err(Error::Key(
        "ssh agent authentication is only supported on unix".to_string(),
    ))
}

async fn open_pty_shell(
    handle: &Handle<ClientHandler>,
    pty: &Pty,
) -> std::result::Result<Channel<Msg>, russh::Error> {
    let channel = handle.channel_open_session().await?;
    channel
        .request_pty(
            false,
            &pty.term,
            pty.window.width,
            pty.window.height,
            0,
            0,
            &[],
        )
        .await?;
    channel.request_shell(false).await?;
    Ok(channel)
}

async fn pump(
    handle: Handle<ClientHandler>,
    mut channel: Channel<Msg>,
    mut input: mpsc::UnboundedReceiver<ShellInput>,
    events: mpsc::UnboundedSender<ShellEvent>,
    target: String,
) {
    loop {
        tokio::select! {
            queued = input.recv() => match queued {
                Some(ShellInput::Data(bytes)) => {
                    trace!(target = %target, len = bytes.len(), "Writing to shell");
                    if let Err(err) = channel.data(&bytes[..]).await {
                        warn!(target = %target, error = %err, "Shell write failed");
                        let _ = events.send(ShellEvent::Error(err.to_string()));
                        break;
                    }
                }
                Some(ShellInput::Close) | None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    trace!(target = %target, len = data.len(), "Shell data");
                    let _ = events.send(ShellEvent::Data(data.to_vec()));
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(target = %target, exit_status, "Remote shell exited");
                }
                Some(ChannelMsg::Eof) => {
                    debug!(target = %target, "Shell EOF");
                }
                Some(ChannelMsg::Close) | None => {
                    debug!(target = %target, "Shell channel closed");
                    let _ = events.send(ShellEvent::Closed);
                    break;
                }
                Some(_) => {}
            },
        }
    }

    if let Err(err) = handle
        .disconnect(Disconnect::ByApplication, "session closed", "en")
        .await
    {
        debug!(target = %target, error = %err, "Disconnect after close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use russh::client::Handler as _;
    use std::io::Write;

    // github.com's published ed25519 host key.
    const HOST_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_accepted_host_key_is_logged_at_info() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let key = russh_keys::parse_public_key_base64(HOST_KEY).unwrap();
        let mut handler = ClientHandler {
            target: "git@github.com:22".to_string(),
        };
        assert!(handler.check_server_key(&key).await.unwrap());

        let logs = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(logs.contains("INFO"), "{logs}");
        assert!(logs.contains("Accepting server host key"), "{logs}");
        assert!(logs.contains(&key.fingerprint()), "{logs}");
    }
}
