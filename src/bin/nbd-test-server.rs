//! `nbd-test-server`: serves a [`MemoryPlugin`] configured from JSON.
//!
//! Without `--listen` or `--unix` one session is served on stdin/stdout,
//! which is how `Target::Command` talks to it. Logs go to stderr.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nbd_core::config::PluginConfig;
use nbd_core::memory::MemoryPlugin;
use nbd_core::server::NbdServer;

#[derive(Debug, Parser)]
#[command(name = "nbd-test-server", about = "In-memory NBD server for conformance tests", version, long_about = None)]
struct Cli {
    /// Plugin configuration as JSON.
    #[arg(long, value_name = "JSON", conflicts_with = "cfg_arg")]
    cfg: Option<String>,

    /// Plugin configuration in the `cfg=<JSON>` form.
    #[arg(value_name = "cfg=JSON")]
    cfg_arg: Option<String>,

    /// Serve TCP clients on this address, e.g. 127.0.0.1:10809.
    #[arg(long, value_name = "ADDR", conflicts_with = "unix")]
    listen: Option<String>,

    /// Serve clients on this Unix socket.
    #[arg(long, value_name = "PATH")]
    unix: Option<PathBuf>,

    /// Only accept this export name. Any name is accepted by default.
    #[arg(long)]
    export_name: Option<String>,
}

impl Cli {
    fn plugin_config(&self) -> Result<PluginConfig, nbd_core::config::ConfigError> {
        match (&self.cfg, &self.cfg_arg) {
            (Some(json), _) => PluginConfig::from_json(json),
            (None, Some(arg)) => PluginConfig::from_arg(arg),
            (None, None) => Ok(PluginConfig::default()),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout may be the NBD stream
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::parse();
    init_tracing();

    let config = args.plugin_config()?;
    info!(size = config.capabilities.size, "starting in-memory plugin");

    let mut server = NbdServer::new(Arc::new(MemoryPlugin::new(config)?));
    if let Some(name) = &args.export_name {
        server = server.with_export_name(name.clone());
    }

    if let Some(address) = &args.listen {
        let listener = tokio::net::TcpListener::bind(address).await?;
        info!(address = %listener.local_addr()?, "listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let server = server.clone();
            tokio::spawn(async move {
                info!(%peer, "client connected");
                let (reader, writer) = stream.into_split();
                if let Err(e) = server.serve(reader, writer).await {
                    error!(%peer, error = %e, "session failed");
                }
            });
        }
    }

    #[cfg(unix)]
    if let Some(path) = &args.unix {
        let listener = tokio::net::UnixListener::bind(path)?;
        info!(path = %path.display(), "listening");
        loop {
            let (stream, _) = listener.accept().await?;
            let server = server.clone();
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                if let Err(e) = server.serve(reader, writer).await {
                    error!(error = %e, "session failed");
                }
            });
        }
    }

    #[cfg(not(unix))]
    if args.unix.is_some() {
        return Err("Unix domain sockets are not available on this platform".into());
    }

    server
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await?;
    Ok(())
}
