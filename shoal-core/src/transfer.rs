//! Per-peer transfer drivers.
//!
//! `DownloadTransfer` pulls a file from one peer: the pipeline decides what to ask for, the datum
//! channel decides when. `UploadTransfer` answers one peer's requests from the local store.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Instant;

use crate::best_effort::{BestEffort, BestEffortEvent};
use crate::cache::{CacheHint, CachePrefetchLayer, HintOutcome, HintOwner};
use crate::channel::ReliableDatumChannel;
use crate::config::{LedbatConfig, TransferConfig};
use crate::ledbat::WindowStats;
use crate::pipeline::{BlockPipelineManager, PipelineEvent};
use crate::protocol::{Message, Request, Response};
use crate::session::TransferError;
use crate::store::{BlockStore, StorageBackend, StorageError};

/// Milliseconds since `epoch`, the timestamp unit on the wire.
fn timestamp(epoch: Instant, now: Instant) -> u64 {
    now.saturating_duration_since(epoch).as_millis() as u64
}

/// What a download step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutput {
    Send(Message),
    Completed { block: u32, hash: Vec<u8> },
    /// The pipeline rebuilt its cache hint; the local cache may register it too.
    HintRebuilt(CacheHint),
}

#[derive(Debug, Clone)]
enum Unit {
    Piece { block: u32, piece: u32 },
    Hashes { blocks: Vec<u32> },
}

impl Unit {
    fn request(&self) -> Request {
        match self {
            Unit::Piece { block, piece } => Request::Piece {
                block: *block,
                piece: *piece,
            },
            Unit::Hashes { blocks } => Request::Hashes {
                blocks: blocks.clone(),
            },
        }
    }
}

pub struct DownloadTransfer {
    peer: SocketAddr,
    config: TransferConfig,
    epoch: Instant,
    pipeline: BlockPipelineManager,
    channel: ReliableDatumChannel<Unit>,
    hints: BestEffort<CacheHint>,
    last_ack_delay: Option<(u64, u64)>,
    closed: bool,
}

impl DownloadTransfer {
    pub fn new(
        peer: SocketAddr,
        config: &TransferConfig,
        ledbat: &LedbatConfig,
        epoch: Instant,
        now: Instant,
    ) -> Self {
        Self {
            peer,
            config: config.clone(),
            epoch,
            pipeline: BlockPipelineManager::new(config),
            channel: ReliableDatumChannel::new(ledbat, now),
            hints: BestEffort::new(),
            last_ack_delay: None,
            closed: false,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// `ack_delay` of the latest ack, receive half in our own clock.
    pub fn last_ack_delay(&self) -> Option<(u64, u64)> {
        self.last_ack_delay
    }

    pub fn window_stats(&self) -> WindowStats {
        self.channel.window().stats()
    }

    pub fn pipeline(&self) -> &BlockPipelineManager {
        &self.pipeline
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.channel.next_deadline(), self.hints.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Handle timeouts and retries, then top up the channel.
    pub fn tick<S: BlockStore>(
        &mut self,
        now: Instant,
        store: &mut S,
    ) -> Result<Vec<DownloadOutput>, TransferError> {
        let mut out = Vec::new();
        if self.closed {
            return Ok(out);
        }
        for unit in self.channel.expire(now) {
            self.requeue(&*store, unit);
        }
        if self.channel.consecutive_timeouts() >= self.config.max_consecutive_timeouts {
            tracing::warn!(
                peer = %self.peer,
                timeouts = self.channel.consecutive_timeouts(),
                "peer unreachable"
            );
            return Err(TransferError::PeerUnreachable(self.peer));
        }
        for event in self.hints.tick(now) {
            match event {
                BestEffortEvent::Resend { req_id, payload } => {
                    out.push(DownloadOutput::Send(Message::CacheHintReq {
                        req_id,
                        hint: payload,
                    }));
                }
                BestEffortEvent::Timeout { req_id, payload } => {
                    tracing::debug!(req_id, stamp = payload.stamp, "cache hint request timed out");
                }
            }
        }
        self.pump(now, &*store, &mut out);
        Ok(out)
    }

    pub fn on_message<S: BlockStore>(
        &mut self,
        now: Instant,
        store: &mut S,
        message: Message,
    ) -> Result<Vec<DownloadOutput>, TransferError> {
        let mut out = Vec::new();
        if self.closed {
            return Ok(out);
        }
        match message {
            Message::Ack {
                msg_id,
                data_delay: (sent, received),
                ack_delay: (ack_sent, _),
                payload,
                ..
            } => {
                let one_way_delay = received as i64 - sent as i64;
                let ack_delay = (ack_sent, timestamp(self.epoch, now));
                self.last_ack_delay = Some(ack_delay);
                tracing::trace!(
                    msg_id,
                    one_way_delay,
                    reverse_delay = ack_delay.1 as i64 - ack_delay.0 as i64,
                    "ack received"
                );
                if let Some(unit) = self.channel.on_ack(now, msg_id, one_way_delay) {
                    self.on_response(store, unit, payload)?;
                }
            }
            Message::CacheHintAcc { req_id, stamp } => {
                self.hints.on_response(req_id);
                tracing::trace!(req_id, stamp, "cache hint accepted");
            }
            Message::CacheHintRej { req_id, stamp } => {
                self.hints.on_response(req_id);
                tracing::debug!(req_id, stamp, "cache hint rejected by peer");
            }
            other => {
                tracing::debug!(peer = %self.peer, message = ?other, "unexpected message on download side");
            }
        }
        self.pump(now, &*store, &mut out);
        Ok(out)
    }

    fn on_response<S: BlockStore>(
        &mut self,
        store: &mut S,
        unit: Unit,
        response: Response,
    ) -> Result<(), StorageError> {
        match (unit, response) {
            (
                Unit::Piece { block, piece },
                Response::PieceResp {
                    block: b,
                    piece: p,
                    bytes,
                },
            ) if (b, p) == (block, piece) => {
                self.pipeline.write_piece(store, block, piece, bytes)?;
            }
            (Unit::Piece { block, piece }, Response::PieceMissing { .. }) => {
                tracing::debug!(block, piece, "peer cannot serve piece");
                self.pipeline.reset_piece(block, piece);
            }
            (Unit::Hashes { blocks }, Response::HashResp { hashes, missing }) => {
                let requested: BTreeSet<u32> = blocks.iter().copied().collect();
                let mut answered = BTreeSet::new();
                for (block, hash) in hashes {
                    if requested.contains(&block) && answered.insert(block) {
                        self.pipeline.write_hash(store, block, &hash)?;
                    }
                }
                let missing: Vec<u32> = missing
                    .into_iter()
                    .filter(|b| requested.contains(b) && answered.insert(*b))
                    .collect();
                self.pipeline.hash_missing(&*store, &missing);
                let unanswered: Vec<u32> = requested.difference(&answered).copied().collect();
                self.pipeline.reset_hashes(&*store, &unanswered);
            }
            (unit, response) => {
                tracing::debug!(?unit, ?response, "response does not match request");
                self.requeue(&*store, unit);
            }
        }
        Ok(())
    }

    fn requeue<S: BlockStore>(&mut self, store: &S, unit: Unit) {
        match unit {
            Unit::Piece { block, piece } => self.pipeline.reset_piece(block, piece),
            Unit::Hashes { blocks } => self.pipeline.reset_hashes(store, &blocks),
        }
    }

    /// Move pipeline work into the channel and everything sendable onto `out`.
    fn pump<S: BlockStore>(&mut self, now: Instant, store: &S, out: &mut Vec<DownloadOutput>) {
        let hash_size = store.hash_alg().hash_size() as u64;
        self.pipeline.work_available(store);
        while self.channel.queued() < self.config.send_buffer {
            let hashes = self.pipeline.next_hashes(store);
            if !hashes.is_empty() {
                let bytes = hashes.len() as u64 * hash_size;
                self.channel.push(Unit::Hashes { blocks: hashes }, bytes);
                continue;
            }
            if let Some((block, piece)) = self.pipeline.next_piece() {
                let bytes = store
                    .geometry()
                    .piece_range(block, piece)
                    .map_or(self.config.piece_size as u64, |r| r.len);
                self.channel.push(Unit::Piece { block, piece }, bytes);
                continue;
            }
            if !self.pipeline.work_available(store) {
                break;
            }
        }

        for event in self.pipeline.take_events() {
            match event {
                PipelineEvent::BlockRequested { block, piece_count } => {
                    out.push(DownloadOutput::Send(Message::BlockReq { block, piece_count }));
                }
                PipelineEvent::Completed { block, hash } => {
                    out.push(DownloadOutput::Completed { block, hash });
                }
                PipelineEvent::Rejected { .. } => {}
            }
        }

        if let Some(hint) = self.pipeline.take_cache_hint() {
            // A newer hint supersedes any still being retried.
            self.hints.clear();
            let req_id = self.hints.send(
                now,
                hint.clone(),
                self.config.hint_retries,
                self.config.hint_retry_interval(),
            );
            out.push(DownloadOutput::HintRebuilt(hint.clone()));
            out.push(DownloadOutput::Send(Message::CacheHintReq { req_id, hint }));
        }

        let send_ts = timestamp(self.epoch, now);
        for (msg_id, unit) in self.channel.poll_send(now) {
            out.push(DownloadOutput::Send(Message::Datum {
                msg_id,
                send_ts,
                payload: unit.request(),
            }));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drop all in-flight work. Later calls are no-ops.
    pub fn close(&mut self) {
        self.closed = true;
        self.pipeline.close();
        self.channel.close();
        self.hints.clear();
    }
}

/// Serves one requesting peer.
pub struct UploadTransfer {
    peer: SocketAddr,
    epoch: Instant,
    last_seen: Instant,
    next_payload_id: u64,
    pieces_served: u64,
}

impl UploadTransfer {
    pub fn new(peer: SocketAddr, epoch: Instant) -> Self {
        Self {
            peer,
            epoch,
            last_seen: epoch,
            next_payload_id: 0,
            pieces_served: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// When the peer last sent us anything.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn pieces_served(&self) -> u64 {
        self.pieces_served
    }

    /// Answer one message. Only a backend failure is an error; bad requests get a negative answer.
    pub fn on_message<S: StorageBackend>(
        &mut self,
        now: Instant,
        cache: &mut CachePrefetchLayer<S>,
        message: Message,
    ) -> Result<Vec<Message>, StorageError> {
        self.last_seen = self.last_seen.max(now);
        let received = timestamp(self.epoch, now);
        let reply = match message {
            Message::Datum {
                msg_id,
                send_ts,
                payload,
            } => {
                let payload = self.answer(cache, payload)?;
                let payload_id = self.next_payload_id;
                self.next_payload_id += 1;
                Message::Ack {
                    msg_id,
                    payload_id,
                    data_delay: (send_ts, received),
                    ack_delay: (timestamp(self.epoch, now), 0),
                    payload,
                }
            }
            Message::CacheHintReq { req_id, hint } => {
                let owner = HintOwner::Reader(self.peer);
                let stamp = hint.stamp;
                if cache.hint(&owner) == Some(&hint) {
                    // Retransmission of the hint already in place.
                    Message::CacheHintAcc { req_id, stamp }
                } else {
                    match cache.set_hint(owner, hint)? {
                        HintOutcome::Accepted => Message::CacheHintAcc { req_id, stamp },
                        HintOutcome::Stale => Message::CacheHintRej { req_id, stamp },
                    }
                }
            }
            Message::BlockReq { block, piece_count } => {
                let loaded = cache.prefetch(block)?;
                tracing::trace!(block, piece_count, loaded, "block prefetch requested");
                return Ok(Vec::new());
            }
            other => {
                tracing::debug!(peer = %self.peer, message = ?other, "unexpected message on upload side");
                return Ok(Vec::new());
            }
        };
        Ok(vec![reply])
    }

    fn answer<S: StorageBackend>(
        &mut self,
        cache: &mut CachePrefetchLayer<S>,
        request: Request,
    ) -> Result<Response, StorageError> {
        match request {
            Request::Piece { block, piece } => match cache.read_piece(block, piece) {
                Ok(bytes) => {
                    self.pieces_served += 1;
                    Ok(Response::PieceResp {
                        block,
                        piece,
                        bytes,
                    })
                }
                Err(StorageError::UnknownBlock(_))
                | Err(StorageError::UnknownPiece { .. })
                | Err(StorageError::BlockMissing(_)) => Ok(Response::PieceMissing { block, piece }),
                Err(e) => Err(e),
            },
            Request::Hashes { blocks } => {
                let mut hashes = Vec::new();
                let mut missing = Vec::new();
                for block in blocks {
                    match cache.read_hash(block) {
                        Ok(Some(hash)) => hashes.push((block, hash)),
                        Ok(None) | Err(StorageError::UnknownBlock(_)) => missing.push(block),
                        Err(e) => return Err(e),
                    }
                }
                Ok(Response::HashResp { hashes, missing })
            }
        }
    }
}
