#![forbid(unsafe_code)]

//! # persh-mcp CLI
//!
//! ```bash
//! persh-mcp                               # hosts from ~/.persh/hosts.json
//! persh-mcp --hosts-file ./hosts.json     # explicit hosts file
//! RUST_LOG=persh=debug persh-mcp          # verbose session logs on stderr
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use persh::SessionRegistry;
use persh::transport::RusshConnector;
use persh_mcp::{Args, Config, HostStore, McpServer, SessionService, logging};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_args(args)?;
    logging::init(&config.log_level, config.log_format)?;

    let hosts = HostStore::open(&config.hosts_file)
        .with_context(|| format!("loading {}", config.hosts_file.display()))?;
    let registry = SessionRegistry::new(
        Arc::new(RusshConnector::new(&config.session)),
        config.session.clone(),
    );
    let server = McpServer::new(SessionService::new(
        hosts,
        registry,
        config.max_command_length,
    ));

    info!(
        hosts_file = %config.hosts_file.display(),
        version = env!("CARGO_PKG_VERSION"),
        "persh-mcp listening on stdio"
    );

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    tokio::select! {
        served = server.serve(stdin, tokio::io::stdout()) => served?,
        _ = tokio::signal::ctrl_c() => {
            let disposed = server.service().shutdown();
            info!(disposed, "Interrupted, sessions closed");
        }
    }
    Ok(())
}
