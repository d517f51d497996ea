//! Host profiles persisted as JSON.
//!
//! The file holds one object keyed by host id:
//!
//! ```json
//! {
//!   "web1": { "host": "10.0.0.5", "port": 22, "username": "deploy", "keyPath": "~/.ssh/id_ed25519" }
//! }
//! ```
//!
//! Writes go to a temporary sibling that is renamed over the original, and
//! on Unix the file is only readable by its owner.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use persh::{Credentials, Error, HostTarget, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::home_dir;

fn default_port() -> u16 {
    22
}

/// Stored connection details for one host.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostProfile {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl HostProfile {
    /// Creates a profile that authenticates through the SSH agent.
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: None,
            key_path: None,
            passphrase: None,
        }
    }

    /// Sets a password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets a private key path and optional passphrase.
    pub fn with_key(mut self, path: impl Into<String>, passphrase: Option<String>) -> Self {
        self.key_path = Some(path.into());
        self.passphrase = passphrase;
        self
    }

    /// Builds credentials. Precedence: password, key file, agent.
    pub fn credentials(&self) -> Credentials {
        Credentials::from_parts(
            HostTarget::new(&self.host, self.port, &self.username),
            self.password.clone().filter(|p| !p.is_empty()),
            self.key_path
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(expand_tilde),
            self.passphrase.clone().filter(|p| !p.is_empty()),
        )
    }

    fn auth_name(&self) -> &'static str {
        self.credentials().method().as_str()
    }
}

impl fmt::Debug for HostProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |secret: &Option<String>| secret.as_ref().map(|_| "<redacted>");
        f.debug_struct("HostProfile")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("key_path", &self.key_path)
            .field("passphrase", &redacted(&self.passphrase))
            .finish()
    }
}

/// Partial update for [`HostStore::update`]. `None` leaves a field alone;
/// an empty string clears an optional field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostUpdate {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub key_path: Option<String>,
    pub passphrase: Option<String>,
}

/// Secret-free listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSummary {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: &'static str,
}

/// Host profiles keyed by id, backed by a JSON file.
pub struct HostStore {
    path: PathBuf,
    hosts: Mutex<BTreeMap<String, HostProfile>>,
}

impl HostStore {
    /// Loads the store at `path`. A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let hosts = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text).map_err(|err| {
                Error::Configuration(format!("invalid hosts file {}: {err}", path.display()))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        debug!(path = %path.display(), hosts = hosts.len(), "Loaded host profiles");
        Ok(Self {
            path,
            hosts: Mutex::new(hosts),
        })
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds a new profile.
    ///
    /// # Errors
    ///
    /// Fails if the id is taken, the profile is invalid, or saving fails.
    pub fn add(&self, id: &str, profile: HostProfile) -> Result<()> {
        validate(id, &profile)?;
        let mut hosts = self.hosts.lock();
        if hosts.contains_key(id) {
            return Err(Error::Configuration(format!("host {id} already exists")));
        }
        let mut next = hosts.clone();
        next.insert(id.to_string(), profile);
        self.save(&next)?;
        *hosts = next;
        info!(host_id = id, "Host profile added");
        Ok(())
    }

    /// Applies a partial update to an existing profile.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::HostNotFound`] if absent, or if the result is
    /// invalid or saving fails.
    pub fn update(&self, id: &str, update: HostUpdate) -> Result<HostProfile> {
        let mut hosts = self.hosts.lock();
        let mut profile = hosts
            .get(id)
            .cloned()
            .ok_or_else(|| Error::HostNotFound(id.to_string()))?;

        if let Some(host) = update.host {
            profile.host = host;
        }
        if let Some(port) = update.port {
            profile.port = port;
        }
        if let Some(username) = update.username {
            profile.username = username;
        }
        let clearable = |value: Option<String>, slot: &mut Option<String>| {
            if let Some(value) = value {
                *slot = (!value.is_empty()).then_some(value);
            }
        };
        clearable(update.password, &mut profile.password);
        clearable(update.key_path, &mut profile.key_path);
        clearable(update.passphrase, &mut profile.passphrase);

        validate(id, &profile)?;
        let mut next = hosts.clone();
        next.insert(id.to_string(), profile.clone());
        self.save(&next)?;
        *hosts = next;
        info!(host_id = id, "Host profile updated");
        Ok(profile)
    }

    /// Removes a profile.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::HostNotFound`] if absent, or if saving fails.
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut hosts = self.hosts.lock();
        if !hosts.contains_key(id) {
            return Err(Error::HostNotFound(id.to_string()));
        }
        let mut next = hosts.clone();
        next.remove(id);
        self.save(&next)?;
        *hosts = next;
        info!(host_id = id, "Host profile removed");
        Ok(())
    }

    /// Returns a copy of one profile.
    pub fn get(&self, id: &str) -> Option<HostProfile> {
        self.hosts.lock().get(id).cloned()
    }

    /// Lists every profile without secrets, sorted by id.
    pub fn list(&self) -> Vec<HostSummary> {
        self.hosts
            .lock()
            .iter()
            .map(|(id, profile)| HostSummary {
                id: id.clone(),
                host: profile.host.clone(),
                port: profile.port,
                username: profile.username.clone(),
                auth: profile.auth_name(),
            })
            .collect()
    }

    /// Resolves a host id to credentials.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HostNotFound`] for unknown ids.
    pub fn resolve(&self, id: &str) -> Result<Credentials> {
        self.get(id)
            .map(|profile| profile.credentials())
            .ok_or_else(|| Error::HostNotFound(id.to_string()))
    }

    fn save(&self, hosts: &BTreeMap<String, HostProfile>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(hosts)
            .map_err(|err| Error::Configuration(format!("cannot encode hosts: {err}")))?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = private_file(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl fmt::Debug for HostStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostStore")
            .field("path", &self.path)
            .field("hosts", &self.hosts.lock().len())
            .finish()
    }
}

#[cfg(unix)]
fn private_file(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies on creation.
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn private_file(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// Expands a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    let rest = if path == "~" {
        Some("")
    } else {
        path.strip_prefix("~/")
    };
    match (rest, home_dir()) {
        (Some(rest), Some(home)) if rest.is_empty() => home,
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

fn validate(id: &str, profile: &HostProfile) -> Result<()> {
    let id_ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !id_ok {
        return Err(Error::Configuration(format!(
            "invalid host id {id:?}: use letters, digits, '.', '_' or '-'"
        )));
    }
    if profile.host.trim().is_empty() {
        return Err(Error::Configuration("host must not be empty".to_string()));
    }
    if profile.username.trim().is_empty() {
        return Err(Error::Configuration("username must not be empty".to_string()));
    }
    if profile.port == 0 {
        return Err(Error::Configuration("port must be between 1 and 65535".to_string()));
    }
    Ok(())
}
