use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use shoal_core::integrity::hash_block;
use shoal_core::{
    Action, BlockGeometry, FileSession, HashAlg, HashGatedStore, LedbatConfig,
    MemoryBackend, TransferConfig,
};
use uuid::Uuid;

const SEEDER: u16 = 4000;
const LEECHER: u16 = 4001;
const STEP: Duration = Duration::from_millis(5);

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

struct Outcome {
    completed: Vec<(u32, Vec<u8>)>,
    finished: bool,
    /// Losses the leecher's window saw while its download was running.
    losses: u64,
    leecher: FileSession<MemoryBackend>,
    seeder: FileSession<MemoryBackend>,
}

/// Run a seeder and a leecher against each other over a simulated datagram link. Every
/// `drop_every`-th datagram is lost.
fn run(file: &[u8], drop_every: Option<usize>) -> Outcome {
    let start = Instant::now();
    let id = Uuid::new_v4();
    let config = TransferConfig::default();
    let geometry = BlockGeometry::from_config(file.len() as u64, &config).unwrap();

    let seed_store =
        HashGatedStore::seeded(geometry, HashAlg::Sha256, MemoryBackend::from_vec(file.to_vec()))
            .unwrap();
    let leech_store =
        HashGatedStore::new(geometry, HashAlg::Sha256, MemoryBackend::new(file.len() as u64))
            .unwrap();
    let mut seeder = FileSession::new(id, seed_store, config.clone(), LedbatConfig::default(), start);
    let mut leecher = FileSession::new(id, leech_store, config, LedbatConfig::default(), start);

    let mut link: VecDeque<(SocketAddr, SocketAddr, Vec<u8>)> = VecDeque::new();
    let mut completed = Vec::new();
    let mut finished = false;
    let mut losses = 0;
    let mut sent = 0usize;

    // Actions are tagged with the address of the session that produced them.
    let mut pending: Vec<(SocketAddr, Action)> = leecher
        .start_download(addr(SEEDER), start)
        .into_iter()
        .map(|a| (addr(LEECHER), a))
        .collect();
    let mut now = start;
    for _ in 0..20_000 {
        for action in pending.drain(..) {
            match action {
                (from, Action::Send(to, frame)) => link.push_back((from, to, frame)),
                (_, Action::BlockCompleted { block, hash }) => completed.push((block, hash)),
                (_, Action::TransferComplete) => finished = true,
                (_, Action::TransferFailed(e)) => panic!("transfer failed: {e}"),
            }
        }
        if finished {
            break;
        }

        now += STEP;
        let mut delivered = Vec::new();
        for (from, to, frame) in link.drain(..) {
            sent += 1;
            if drop_every.is_some_and(|n| sent % n == 0) {
                continue;
            }
            let session = if to == addr(SEEDER) { &mut seeder } else { &mut leecher };
            let actions = session.on_datagram(from, &frame, now).unwrap();
            delivered.extend(actions.into_iter().map(|a| (to, a)));
        }
        pending = delivered;
        pending.extend(seeder.tick(now).into_iter().map(|a| (addr(SEEDER), a)));
        pending.extend(leecher.tick(now).into_iter().map(|a| (addr(LEECHER), a)));
        if let Some(download) = leecher.download() {
            losses = download.window_stats().total_losses;
        }
    }

    Outcome {
        completed,
        finished,
        losses,
        leecher,
        seeder,
    }
}

fn random_file(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

#[test]
fn leecher_downloads_whole_file() {
    let file = random_file(5 * 10 * 1024, 1);
    let outcome = run(&file, None);

    assert!(outcome.finished);
    assert_eq!(outcome.completed.len(), 5);
    let mut blocks: Vec<u32> = outcome.completed.iter().map(|(b, _)| *b).collect();
    blocks.sort_unstable();
    assert_eq!(blocks, vec![0, 1, 2, 3, 4]);
    for (block, hash) in &outcome.completed {
        let start = *block as usize * 10240;
        assert_eq!(hash, &hash_block(HashAlg::Sha256, &file[start..start + 10240]));
    }
    assert!(outcome.leecher.is_complete());
    assert_eq!(outcome.leecher.cache().store().backend().as_slice(), &file[..]);
    assert!(outcome.seeder.cache().stats().hits > 0);
    assert_eq!(outcome.losses, 0);
}

#[test]
fn survives_datagram_loss_with_irregular_tail() {
    let file = random_file(7 * 10 * 1024 + 3000, 2);
    let outcome = run(&file, Some(7));

    assert!(outcome.finished);
    assert_eq!(outcome.completed.len(), 8);
    assert_eq!(outcome.leecher.cache().store().backend().as_slice(), &file[..]);
    assert!(outcome.losses > 0);
    let stats = outcome
        .leecher
        .download()
        .map(|d| d.window_stats().total_losses);
    // The download side is released once the file is complete.
    assert_eq!(stats, None);
}

#[test]
fn empty_file_completes_immediately() {
    let outcome = run(&[], None);
    assert!(outcome.finished);
    assert!(outcome.completed.is_empty());
}
