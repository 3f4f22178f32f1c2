//! UDP loop: feed datagrams and ticks into a file session, perform its actions.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Context;
use shoal_core::{Action, FileSession, StorageBackend};
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;

/// Largest datagram we accept.
const RECV_BUF: usize = 65536;

/// What the loop should do after performing a batch of actions.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Done,
}

/// Drive `session` over `socket` until shutdown. When `download_from` is set, the session pulls
/// the file from that peer and the loop returns once the file is complete.
pub async fn run<S: StorageBackend>(
    socket: UdpSocket,
    mut session: FileSession<S>,
    download_from: Option<SocketAddr>,
    tick: Duration,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; RECV_BUF];
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = crate::shutdown_signal();
    tokio::pin!(shutdown);

    let mut actions = match download_from {
        Some(peer) => session.start_download(peer, Instant::now()),
        None => Vec::new(),
    };
    loop {
        if perform(&socket, actions).await? == Flow::Done && download_from.is_some() {
            break;
        }
        actions = tokio::select! {
            r = socket.recv_from(&mut buf) => {
                let (n, from) = r.context("udp recv")?;
                match session.on_datagram(from, &buf[..n], Instant::now()) {
                    Ok(actions) => actions,
                    Err(e) => {
                        tracing::debug!(%from, error = %e, "dropping datagram");
                        Vec::new()
                    }
                }
            }
            _ = ticker.tick() => session.tick(Instant::now()),
            res = &mut shutdown => {
                res?;
                tracing::info!(transfer = %session.transfer_id(), "shutting down");
                break;
            }
        };
    }
    session.close();
    Ok(())
}

async fn perform(socket: &UdpSocket, actions: Vec<Action>) -> anyhow::Result<Flow> {
    let mut flow = Flow::Continue;
    for action in actions {
        match action {
            Action::Send(to, frame) => {
                // Datagram loss is handled by the protocol; a failed send is just a lost datagram.
                if let Err(e) = socket.send_to(&frame, to).await {
                    tracing::debug!(%to, error = %e, "send failed");
                }
            }
            Action::BlockCompleted { block, hash } => {
                tracing::info!(block, hash = %hex(&hash), "block stored");
            }
            Action::TransferComplete => {
                tracing::info!("transfer complete");
                flow = Flow::Done;
            }
            Action::TransferFailed(e) => {
                return Err(anyhow::Error::new(e).context("transfer failed"));
            }
        }
    }
    Ok(flow)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
