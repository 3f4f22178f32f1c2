// Shoal node: seed a file or fetch one from a seeding peer over UDP.

mod config;
mod node;
mod storage;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use shoal_core::{BlockGeometry, FileSession, HashGatedStore};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::storage::FileBackend;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage:
  shoal-node seed <file> [<transfer-id>]
  shoal-node fetch <peer-addr> <transfer-id> <file-len> <out-file>";

#[derive(Debug, PartialEq)]
enum Command {
    Version,
    Seed {
        path: PathBuf,
        id: Option<Uuid>,
    },
    Fetch {
        peer: SocketAddr,
        id: Uuid,
        len: u64,
        out: PathBuf,
    },
}

fn parse_args(args: &[String]) -> anyhow::Result<Command> {
    if args.iter().any(|a| a == "--version" || a == "-V") {
        return Ok(Command::Version);
    }
    match args {
        [cmd, path] if cmd == "seed" => Ok(Command::Seed {
            path: path.into(),
            id: None,
        }),
        [cmd, path, id] if cmd == "seed" => Ok(Command::Seed {
            path: path.into(),
            id: Some(id.parse().context("bad transfer id")?),
        }),
        [cmd, peer, id, len, out] if cmd == "fetch" => Ok(Command::Fetch {
            peer: peer.parse().context("bad peer address")?,
            id: id.parse().context("bad transfer id")?,
            len: len.parse().context("bad file length")?,
            out: out.into(),
        }),
        _ => bail!("{USAGE}"),
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    if command == Command::Version {
        println!("shoal-node {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cfg = config::load();
    let tick = Duration::from_millis(cfg.tick_ms.max(1));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match command {
            Command::Version => Ok(()),
            Command::Seed { path, id } => {
                let backend = FileBackend::open(&path)
                    .with_context(|| format!("opening {}", path.display()))?;
                let len = shoal_core::StorageBackend::len(&backend);
                let geometry = BlockGeometry::from_config(len, &cfg.transfer)?;
                let store = HashGatedStore::seeded(geometry, cfg.transfer.hash_alg, backend)?;
                let id = id.unwrap_or_else(Uuid::new_v4);
                let socket = tokio::net::UdpSocket::bind(("0.0.0.0", cfg.port))
                    .await
                    .with_context(|| format!("binding udp port {}", cfg.port))?;
                tracing::info!(
                    transfer = %id,
                    file = %path.display(),
                    len,
                    addr = %socket.local_addr()?,
                    "seeding"
                );
                println!("{id} {len}");
                let session = FileSession::new(id, store, cfg.transfer, cfg.ledbat, Instant::now());
                node::run(socket, session, None, tick).await
            }
            Command::Fetch { peer, id, len, out } => {
                let backend = FileBackend::create(&out, len)
                    .with_context(|| format!("creating {}", out.display()))?;
                let geometry = BlockGeometry::from_config(len, &cfg.transfer)?;
                let store = HashGatedStore::new(geometry, cfg.transfer.hash_alg, backend)?;
                let socket = tokio::net::UdpSocket::bind(("0.0.0.0", 0)).await?;
                let session = FileSession::new(id, store, cfg.transfer, cfg.ledbat, Instant::now());
                node::run(socket, session, Some(peer), tick).await
            }
        }
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
