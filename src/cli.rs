// SPDX-License-Identifier: Apache-2.0

//! Daemon command line and logging setup.

use std::io;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use camino::Utf8PathBuf;
use clap::{Args, Parser};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::device::Device;
use crate::registry::Registry;
use crate::server::handler::ConnectionHandler;
use crate::server::{Broker, Server};
use crate::{DEFAULT_DEVICE_NODE, DEFAULT_SOCKET};

/// Normal-world broker daemon for TrustZone secure-world services.
///
/// Multiplexes client processes onto the single secure-world entry
/// point: command channels and per-session notification channels over
/// one abstract UNIX socket, MCP traffic over the shared MCI region.
#[derive(Parser, Debug)]
#[clap(version)]
pub struct Options {
    /// Logging options
    #[clap(flatten)]
    logger: LogOptions,

    /// Kernel driver node
    #[clap(long, env = "MC_DEVICE_NODE", default_value = DEFAULT_DEVICE_NODE)]
    device: Utf8PathBuf,

    /// Abstract socket name clients connect to
    #[clap(long, env = "MC_SOCKET_NAME", default_value = DEFAULT_SOCKET)]
    socket: String,

    /// Run without the cooperative scheduler thread
    #[clap(long)]
    no_scheduler: bool,
}

impl Options {
    pub fn execute(self) -> anyhow::Result<ExitCode> {
        let Self {
            logger,
            device,
            socket,
            no_scheduler,
        } = self;

        let env_filter =
            EnvFilter::builder().parse_lossy(logger.log_filter.as_deref().unwrap_or(""));
        let log_target = logger.log_target;
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(move || -> Box<dyn io::Write> {
                match log_target {
                    LogTarget::Stdout => Box::new(io::stdout()),
                    LogTarget::Stderr => Box::new(io::stderr()),
                }
            })
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).init();

        // A client that dies mid-write must not take the broker down.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let registry = Registry::from_env();

        let secure_device = Device::open(0, device.as_std_path(), !no_scheduler)
            .context("secure device initialization failed")?;
        secure_device
            .start()
            .context("device threads failed to start")?;

        let broker = Arc::new(Broker::new(registry));
        broker.add_device(secure_device);

        let mut server = Server::bind(&socket, ConnectionHandler::new(broker))
            .with_context(|| format!("cannot bind abstract socket {socket:?}"))?;

        info!(%socket, "broker ready");
        server.run().context("server loop failed")?;
        Ok(ExitCode::SUCCESS)
    }
}

/// Common logging / output options
#[derive(Args, Debug)]
pub struct LogOptions {
    /// Set fancier logging filters.
    ///
    /// This is equivalent to the `RUST_LOG` environment variable.
    /// For more info, see the [EnvFilter] documentation.
    #[clap(long = "log-filter", env = "MC_LOG")]
    log_filter: Option<String>,

    /// Set log output target ("stderr", "stdout")
    #[clap(long, default_value = "stderr")]
    log_target: LogTarget,
}

/// Represents logging target.
#[derive(Debug, Clone, Copy)]
enum LogTarget {
    Stdout,
    Stderr,
}

/// Convert a str to a LogTarget. This is how Clap parses CLI args.
impl FromStr for LogTarget {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            _ => Err(anyhow!("unknown log target {:?}", s)),
        }
    }
}
