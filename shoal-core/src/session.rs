//! Host-driven API: FileSession receives events from host, returns actions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use uuid::Uuid;

use crate::cache::{CachePrefetchLayer, HintOwner};
use crate::config::{LedbatConfig, TransferConfig};
use crate::protocol::{Envelope, Message, PROTOCOL_VERSION};
use crate::store::{BlockStore, HashGatedStore, StorageBackend, StorageError};
use crate::transfer::{DownloadOutput, DownloadTransfer, UploadTransfer};
use crate::wire::{self, FrameDecodeError};

/// Terminal failure of a transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("peer {0} unreachable")]
    PeerUnreachable(SocketAddr),
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to decode message: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("unknown transfer {0}")]
    UnknownTransfer(Uuid),
}

/// Action for host to perform.
#[derive(Debug)]
pub enum Action {
    /// Send this frame as one datagram.
    Send(SocketAddr, Vec<u8>),
    BlockCompleted { block: u32, hash: Vec<u8> },
    /// Every block is verified and stored.
    TransferComplete,
    TransferFailed(TransferError),
}

/// One file, shared by the download side and every peer reading from us.
pub struct FileSession<S> {
    transfer_id: Uuid,
    config: TransferConfig,
    ledbat: LedbatConfig,
    epoch: Instant,
    cache: CachePrefetchLayer<S>,
    download: Option<DownloadTransfer>,
    uploads: HashMap<SocketAddr, UploadTransfer>,
    complete_reported: bool,
    closed: bool,
}

impl<S: StorageBackend> FileSession<S> {
    pub fn new(
        transfer_id: Uuid,
        store: HashGatedStore<S>,
        config: TransferConfig,
        ledbat: LedbatConfig,
        now: Instant,
    ) -> Self {
        Self {
            transfer_id,
            config,
            ledbat,
            epoch: now,
            cache: CachePrefetchLayer::new(store),
            download: None,
            uploads: HashMap::new(),
            complete_reported: false,
            closed: false,
        }
    }

    pub fn transfer_id(&self) -> Uuid {
        self.transfer_id
    }

    pub fn cache(&self) -> &CachePrefetchLayer<S> {
        &self.cache
    }

    pub fn download(&self) -> Option<&DownloadTransfer> {
        self.download.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.cache.is_complete()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Start pulling missing blocks from `peer`. Replaces any previous download side.
    pub fn start_download(&mut self, peer: SocketAddr, now: Instant) -> Vec<Action> {
        if self.closed {
            return Vec::new();
        }
        self.drop_download();
        tracing::info!(
            transfer = %self.transfer_id,
            %peer,
            blocks = self.cache.geometry().nr_blocks(),
            "starting download"
        );
        self.download = Some(DownloadTransfer::new(
            peer,
            &self.config,
            &self.ledbat,
            self.epoch,
            now,
        ));
        self.tick(now)
    }

    /// Process one received datagram.
    pub fn on_datagram(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Vec<Action>, MessageError> {
        let (envelope, _consumed) = wire::decode_frame(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(MessageError::Version(envelope.version));
        }
        let transfer_id = Uuid::from_bytes(envelope.transfer_id);
        if transfer_id != self.transfer_id {
            return Err(MessageError::UnknownTransfer(transfer_id));
        }
        if self.closed {
            return Ok(Vec::new());
        }

        match envelope.message {
            message @ (Message::Datum { .. }
            | Message::CacheHintReq { .. }
            | Message::BlockReq { .. }) => Ok(self.on_upload_message(from, message, now)),
            message @ (Message::Ack { .. }
            | Message::CacheHintAcc { .. }
            | Message::CacheHintRej { .. }) => {
                let Some(download) = self.download.as_mut().filter(|d| d.peer() == from) else {
                    tracing::debug!(%from, "response from peer we are not downloading from");
                    return Ok(Vec::new());
                };
                let result = download.on_message(now, &mut self.cache, message);
                Ok(self.download_actions(result))
            }
        }
    }

    fn on_upload_message(&mut self, from: SocketAddr, message: Message, now: Instant) -> Vec<Action> {
        let epoch = self.epoch;
        let upload = self
            .uploads
            .entry(from)
            .or_insert_with(|| UploadTransfer::new(from, epoch));
        match upload.on_message(now, &mut self.cache, message) {
            Ok(replies) => replies
                .into_iter()
                .filter_map(|reply| self.frame(from, reply))
                .collect(),
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "serving peer failed");
                self.drop_upload(from);
                vec![Action::TransferFailed(TransferError::Storage(e))]
            }
        }
    }

    /// Forget a reading peer and release the blocks its hint kept cached.
    fn drop_upload(&mut self, peer: SocketAddr) {
        self.uploads.remove(&peer);
        self.cache.clear_hint(&HintOwner::Reader(peer));
    }

    fn drop_download(&mut self) {
        if let Some(mut download) = self.download.take() {
            download.close();
            self.cache.clear_hint(&HintOwner::Writer(download.peer()));
        }
    }

    /// Number of peers currently reading from us.
    pub fn upload_count(&self) -> usize {
        self.uploads.len()
    }

    /// Drive timers: idle readers, retransmission timeouts, hint retries, refilling the request
    /// window.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        if self.closed {
            return Vec::new();
        }
        self.expire_uploads(now);
        let Some(download) = self.download.as_mut() else {
            return Vec::new();
        };
        let result = download.tick(now, &mut self.cache);
        self.download_actions(result)
    }

    fn expire_uploads(&mut self, now: Instant) {
        let timeout = self.config.upload_idle_timeout();
        let idle: Vec<SocketAddr> = self
            .uploads
            .values()
            .filter(|u| now.saturating_duration_since(u.last_seen()) >= timeout)
            .map(|u| u.peer())
            .collect();
        for peer in idle {
            tracing::debug!(%peer, "reader idle, dropping");
            self.drop_upload(peer);
        }
    }

    /// Earliest instant at which `tick` has timer work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let timeout = self.config.upload_idle_timeout();
        let upload = self.uploads.values().map(|u| u.last_seen() + timeout).min();
        let download = self.download.as_ref().and_then(|d| d.next_deadline());
        match (upload, download) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn download_actions(
        &mut self,
        result: Result<Vec<DownloadOutput>, TransferError>,
    ) -> Vec<Action> {
        let Some(peer) = self.download.as_ref().map(|d| d.peer()) else {
            return Vec::new();
        };
        let outputs = match result {
            Ok(outputs) => outputs,
            Err(e) => return self.fail_download(e),
        };
        let mut actions = Vec::new();
        for output in outputs {
            match output {
                DownloadOutput::Send(message) => actions.extend(self.frame(peer, message)),
                DownloadOutput::Completed { block, hash } => {
                    actions.push(Action::BlockCompleted { block, hash });
                }
                DownloadOutput::HintRebuilt(hint) => {
                    if let Err(e) = self.cache.set_hint(HintOwner::Writer(peer), hint) {
                        actions.extend(self.fail_download(e.into()));
                        return actions;
                    }
                }
            }
        }
        if self.cache.is_complete() && !self.complete_reported {
            self.complete_reported = true;
            tracing::info!(transfer = %self.transfer_id, "transfer complete");
            self.drop_download();
            actions.push(Action::TransferComplete);
        }
        actions
    }

    fn fail_download(&mut self, error: TransferError) -> Vec<Action> {
        tracing::warn!(transfer = %self.transfer_id, error = %error, "download failed");
        self.drop_download();
        vec![Action::TransferFailed(error)]
    }

    fn frame(&self, to: SocketAddr, message: Message) -> Option<Action> {
        let envelope = Envelope::new(self.transfer_id.into_bytes(), message);
        match wire::encode_frame(&envelope) {
            Ok(frame) => Some(Action::Send(to, frame)),
            Err(e) => {
                tracing::warn!(%to, error = %e, "failed to encode frame");
                None
            }
        }
    }

    /// Stop everything. Later calls are no-ops.
    pub fn close(&mut self) {
        self.closed = true;
        self.drop_download();
        self.uploads.clear();
        self.cache.clear_hints();
    }
}
