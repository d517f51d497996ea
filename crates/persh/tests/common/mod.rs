#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use persh::transport::fake::FakeShell;
use persh::{Credentials, SessionConfig, SessionRegistry};

pub const HOME: &str = "/home/user";

pub fn creds() -> Credentials {
    Credentials::password("h1.test", 22, "user", "secret-pw")
}

pub fn registry(shell: &FakeShell) -> SessionRegistry {
    registry_with(shell, SessionConfig::default())
}

pub fn registry_with(shell: &FakeShell, config: SessionConfig) -> SessionRegistry {
    SessionRegistry::new(Arc::new(shell.clone()), config)
}

/// Polls `check` until it holds or the attempt budget runs out.
pub async fn wait_until(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    check()
}
