#![forbid(unsafe_code)]
// Allow pedantic lints for early-stage API ergonomics.
#![allow(clippy::nursery)]
#![allow(clippy::pedantic)]

//! # persh-mcp
//!
//! An MCP server that gives tool-calling clients persistent SSH shells.
//!
//! - Host profiles stored in a JSON file ([`hosts`])
//! - Session tools backed by [`persh::SessionRegistry`] ([`service`], [`tools`])
//! - JSON-RPC 2.0 over stdin/stdout ([`server`])
//!
//! ## Quick start (library)
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use persh::SessionRegistry;
//! use persh::transport::RusshConnector;
//! use persh_mcp::{Config, HostStore, McpServer, SessionService};
//!
//! # async fn run() -> persh::Result<()> {
//! let config = Config::new("/tmp/hosts.json");
//! let registry = SessionRegistry::new(
//!     Arc::new(RusshConnector::new(&config.session)),
//!     config.session.clone(),
//! );
//! let service = SessionService::new(
//!     HostStore::open(&config.hosts_file)?,
//!     registry,
//!     config.max_command_length,
//! );
//! let server = McpServer::new(service);
//! let stdin = tokio::io::BufReader::new(tokio::io::stdin());
//! server.serve(stdin, tokio::io::stdout()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod hosts;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod service;
pub mod tools;

pub use config::{Args, Config, LogFormat};
pub use hosts::{HostProfile, HostStore, HostSummary, HostUpdate};
pub use server::McpServer;
pub use service::SessionService;
