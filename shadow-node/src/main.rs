// Shadow node daemon: persistent identity, TCP sessions to directory peers, file transfer and chat.

mod config;
mod console;
mod node;
mod store;
mod transport;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use shadow_core::ShadowCore;

use crate::node::{Node, NodeEvent};
use crate::store::FileIdentityStore;

#[derive(Parser, Debug)]
#[command(name = "shadow-node", version, about = "Shadow peer node")]
struct Args {
    /// Config file (default: ~/.config/shadow/config.toml, then /etc/shadow/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP listen port
    #[arg(short = 'p', long)]
    listen_port: Option<u16>,

    /// Directory holding identity.toml
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Node ID to connect to once listening (repeatable)
    #[arg(long = "connect", value_name = "NODE_ID")]
    connect: Vec<String>,

    /// Print this node's ID and exit
    #[arg(long)]
    print_id: bool,
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging();

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(port) = args.listen_port {
        cfg.listen_port = port;
    }
    if let Some(dir) = args.data_dir {
        cfg.data_dir = dir;
    }
    cfg.autoconnect.extend(args.connect);

    let mut store = FileIdentityStore::new(cfg.identity_path());
    let core = ShadowCore::from_store(&mut store);
    tracing::info!(
        node = %core.node_id(),
        origin = ?core.identity().origin,
        store = %store.path().display(),
        "identity ready"
    );
    if args.print_id {
        println!("{}", core.node_id());
        return Ok(());
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    rt.block_on(async {
        let (node, rx) = Node::new(core, cfg);
        tracing::info!(node = %node.core().node_id(), "starting event loop");
        let events = node.events();
        tokio::spawn(console::run(events.clone()));
        tokio::spawn(async move {
            match shutdown_signal().await {
                Ok(()) => {
                    let _ = events.send(NodeEvent::Shutdown);
                }
                Err(e) => tracing::warn!(error = %e, "signal handler unavailable"),
            }
        });
        node.run(rx).await;
    });
    // stdin reads block on a worker thread; don't wait for them
    rt.shutdown_timeout(Duration::from_millis(200));
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
