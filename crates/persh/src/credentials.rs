//! Connection credentials consumed by the session layer.
//!
//! Secrets held here never leave through `Debug` or `Display`; both print a
//! redacted form so credentials can be logged alongside session events.

use std::fmt;
use std::path::PathBuf;

/// Authentication method names, used in logs and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// Password authentication.
    Password,
    /// Private key file authentication.
    PublicKey,
    /// Keys offered by a running SSH agent.
    Agent,
}

impl AuthMethod {
    /// Returns the wire-style name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::PublicKey => "publickey",
            Self::Agent => "agent",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a session connects to. Safe to display.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostTarget {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Remote login name.
    pub username: String,
}

impl HostTarget {
    /// Creates a new target.
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
        }
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Secret material used to authenticate.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    /// A login password.
    Password(String),
    /// A private key file, optionally passphrase-protected.
    KeyFile {
        /// Absolute path of the key.
        path: PathBuf,
        /// Passphrase for an encrypted key.
        passphrase: Option<String>,
    },
    /// Whatever identities the SSH agent offers.
    Agent,
}

impl Auth {
    /// Returns the method this credential uses.
    pub fn method(&self) -> AuthMethod {
        match self {
            Self::Password(_) => AuthMethod::Password,
            Self::KeyFile { .. } => AuthMethod::PublicKey,
            Self::Agent => AuthMethod::Agent,
        }
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            Self::Agent => f.write_str("Agent"),
        }
    }
}

/// A connection target plus the secret used to log in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    /// Connection target.
    pub target: HostTarget,
    /// Authentication secret.
    pub auth: Auth,
}

impl Credentials {
    /// Creates password credentials.
    pub fn password(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            target: HostTarget::new(host, port, username),
            auth: Auth::Password(password.into()),
        }
    }

    /// Creates key file credentials.
    pub fn key_file(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        path: impl Into<PathBuf>,
        passphrase: Option<String>,
    ) -> Self {
        Self {
            target: HostTarget::new(host, port, username),
            auth: Auth::KeyFile {
                path: path.into(),
                passphrase,
            },
        }
    }

    /// Creates credentials that defer to the SSH agent.
    pub fn agent(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            target: HostTarget::new(host, port, username),
            auth: Auth::Agent,
        }
    }

    /// Picks an auth method from optional parts.
    ///
    /// Precedence is password, then key file, then the SSH agent.
    pub fn from_parts(
        target: HostTarget,
        password: Option<String>,
        key_path: Option<PathBuf>,
        passphrase: Option<String>,
    ) -> Self {
        let auth = match (password, key_path) {
            (Some(password), _) => Auth::Password(password),
            (None, Some(path)) => Auth::KeyFile { path, passphrase },
            (None, None) => Auth::Agent,
        };
        Self { target, auth }
    }

    /// Returns the method these credentials use.
    pub fn method(&self) -> AuthMethod {
        self.auth.method()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> HostTarget {
        HostTarget::new("db.internal", 2222, "ops")
    }

    #[test]
    fn test_target_display() {
        assert_eq!(target().to_string(), "ops@db.internal:2222");
    }

    #[test]
    fn test_precedence_password_first() {
        let creds = Credentials::from_parts(
            target(),
            Some("pw".into()),
            Some(PathBuf::from("/k")),
            None,
        );
        assert_eq!(creds.method(), AuthMethod::Password);
    }

    #[test]
    fn test_precedence_key_then_agent() {
        let creds = Credentials::from_parts(
            target(),
            None,
            Some(PathBuf::from("/k")),
            Some("secret".into()),
        );
        assert_eq!(creds.method(), AuthMethod::PublicKey);

        let creds = Credentials::from_parts(target(), None, None, None);
        assert_eq!(creds.method(), AuthMethod::Agent);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::password("h", 22, "u", "hunter2");
        let debug = format!("{creds:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));

        let creds = Credentials::key_file("h", 22, "u", "/id_ed25519", Some("open sesame".into()));
        let debug = format!("{creds:?}");
        assert!(!debug.contains("open sesame"));
        assert!(debug.contains("/id_ed25519"));
    }
}
