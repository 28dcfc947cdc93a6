//! `loops-api` binary entrypoint.
//!
//! Loads configuration from environment variables, wires the engine and
//! starts the HTTP server.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::{Context, Result};

use loops_api::config::Config;
use loops_api::engine::Engine;
use loops_api::server::Server;
use loops_core::observability::{LogFormat, init_logging};

fn choose_log_format(config: &Config) -> LogFormat {
    if config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(choose_log_format(&config));
    config.validate()?;

    let engine = Engine::from_config(&config)
        .await
        .context("failed to wire the SOS engine")?;

    let server = Server::with_engine(config, engine);
    server.serve().await?;
    Ok(())
}
