//! Session operations exposed to tool callers.

use std::sync::Arc;

use persh::{CommandOutput, Error, Result, SessionId, SessionInfo, SessionRegistry};
use tracing::info;

use crate::hosts::HostStore;

/// Host resolution plus the session registry, with input validation.
#[derive(Clone)]
pub struct SessionService {
    hosts: Arc<HostStore>,
    registry: SessionRegistry,
    max_command_length: usize,
}

impl SessionService {
    pub fn new(hosts: HostStore, registry: SessionRegistry, max_command_length: usize) -> Self {
        Self {
            hosts: Arc::new(hosts),
            registry,
            max_command_length,
        }
    }

    pub fn hosts(&self) -> &HostStore {
        &self.hosts
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Opens a session to `host_id`, under `session_id` or a generated id.
    ///
    /// # Errors
    ///
    /// - [`Error::HostNotFound`] for an unknown host
    /// - [`Error::SessionExists`] if `session_id` names a live session
    /// - any connect failure
    pub async fn start_session(
        &self,
        host_id: &str,
        session_id: Option<&str>,
    ) -> Result<SessionId> {
        let credentials = self.hosts.resolve(host_id)?;

        let id = match session_id.map(str::trim) {
            Some("") => {
                return Err(Error::Configuration(
                    "session id must not be empty".to_string(),
                ));
            }
            Some(id) => SessionId::from(id),
            None => SessionId::generate(),
        };

        let session = self.registry.create(id.clone(), credentials).await?;
        info!(
            session_id = %id,
            host_id,
            target = %session.target(),
            "Session started"
        );
        Ok(id)
    }

    /// Runs `command` in an existing session.
    ///
    /// A non-zero exit code is returned as output, not as an error.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] for empty or oversized commands
    /// - [`Error::SessionNotFound`] for unknown or closed sessions
    /// - [`Error::Busy`] while another command runs in the session
    pub async fn execute(&self, session_id: &str, command: &str) -> Result<CommandOutput> {
        self.validate_command(command)?;
        let session = self
            .registry
            .get(session_id)
            .filter(|session| !session.is_disposed())
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        session.execute(command).await
    }

    /// Closes a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if there is no such session.
    pub fn close_session(&self, session_id: &str) -> Result<()> {
        if self.registry.remove(session_id) {
            info!(session_id, "Session closed by client");
            Ok(())
        } else {
            Err(Error::SessionNotFound(session_id.to_string()))
        }
    }

    /// Lists live sessions.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    /// Disposes every session.
    pub fn shutdown(&self) -> usize {
        self.registry.shutdown()
    }

    fn validate_command(&self, command: &str) -> Result<()> {
        if command.trim().is_empty() {
            return Err(Error::Configuration("command must not be empty".to_string()));
        }
        if command.len() > self.max_command_length {
            return Err(Error::Configuration(format!(
                "command is {} bytes, limit is {}",
                command.len(),
                self.max_command_length
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for SessionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionService")
            .field("hosts", &self.hosts)
            .field("registry", &self.registry)
            .field("max_command_length", &self.max_command_length)
            .finish()
    }
}
