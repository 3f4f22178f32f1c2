//! Transfer and congestion-control configuration.
//!
//! Both structs deserialize from the node's TOML file; every field has a default so a partial
//! file (or none at all) is valid.

use std::time::Duration;

use serde::Deserialize;

use crate::integrity::HashAlg;

/// Default piece size in bytes.
pub const DEFAULT_PIECE_SIZE: u32 = 1024;

/// Default number of pieces per block.
pub const DEFAULT_PIECES_PER_BLOCK: u32 = 10;

/// Block/piece geometry, pipeline batch sizes and request retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    /// Piece size in bytes; the unit requested over the wire.
    #[serde(default = "default_piece_size")]
    pub piece_size: u32,
    /// Pieces per block. Block size is `piece_size * pieces_per_block`.
    #[serde(default = "default_pieces_per_block")]
    pub pieces_per_block: u32,
    #[serde(default)]
    pub hash_alg: HashAlg,
    /// Ceiling on blocks assembling at the same time.
    #[serde(default = "default_max_pending_blocks")]
    pub max_pending_blocks: usize,
    /// Block hashes asked for in one request.
    #[serde(default = "default_hash_batch")]
    pub hash_batch: usize,
    /// Blocks hinted to the peer's cache ahead of assembly.
    #[serde(default = "default_cache_lookahead")]
    pub cache_lookahead: usize,
    /// Units kept buffered in the datum channel waiting for window space.
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
    /// Best-effort retries for cache hint requests.
    #[serde(default = "default_hint_retries")]
    pub hint_retries: u32,
    #[serde(default = "default_hint_retry_interval_ms")]
    pub hint_retry_interval_ms: u64,
    /// Timeouts in a row without any ack before the peer is declared unreachable.
    #[serde(default = "default_max_consecutive_timeouts")]
    pub max_consecutive_timeouts: u32,
    /// A reading peer silent for this long is dropped along with its cache hint.
    #[serde(default = "default_upload_idle_timeout_ms")]
    pub upload_idle_timeout_ms: u64,
}

fn default_piece_size() -> u32 {
    DEFAULT_PIECE_SIZE
}
fn default_pieces_per_block() -> u32 {
    DEFAULT_PIECES_PER_BLOCK
}
fn default_max_pending_blocks() -> usize {
    2
}
fn default_hash_batch() -> usize {
    10
}
fn default_cache_lookahead() -> usize {
    8
}
fn default_send_buffer() -> usize {
    8
}
fn default_hint_retries() -> u32 {
    3
}
fn default_hint_retry_interval_ms() -> u64 {
    500
}
fn default_max_consecutive_timeouts() -> u32 {
    16
}
fn default_upload_idle_timeout_ms() -> u64 {
    30_000
}

impl TransferConfig {
    pub fn block_size(&self) -> u64 {
        self.piece_size as u64 * self.pieces_per_block as u64
    }

    pub fn hint_retry_interval(&self) -> Duration {
        Duration::from_millis(self.hint_retry_interval_ms)
    }

    pub fn upload_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_idle_timeout_ms)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            piece_size: default_piece_size(),
            pieces_per_block: default_pieces_per_block(),
            hash_alg: HashAlg::default(),
            max_pending_blocks: default_max_pending_blocks(),
            hash_batch: default_hash_batch(),
            cache_lookahead: default_cache_lookahead(),
            send_buffer: default_send_buffer(),
            hint_retries: default_hint_retries(),
            hint_retry_interval_ms: default_hint_retry_interval_ms(),
            max_consecutive_timeouts: default_max_consecutive_timeouts(),
            upload_idle_timeout_ms: default_upload_idle_timeout_ms(),
        }
    }
}

/// Which loss events are allowed to shrink the window.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LossPolicy {
    /// At most one reduction per round trip.
    #[default]
    Simple,
    /// React once per round trip when the loss ratio over it reaches `threshold`.
    Percentage { threshold: f64 },
}

/// LEDBAT constants. Window sizes are in units of `mss`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedbatConfig {
    /// Nominal segment size used for window arithmetic (bytes).
    #[serde(default = "default_mss")]
    pub mss: u64,
    #[serde(default = "default_init_cwnd")]
    pub init_cwnd: u64,
    #[serde(default = "default_min_cwnd")]
    pub min_cwnd: u64,
    /// Target queuing delay in milliseconds.
    #[serde(default = "default_target_ms")]
    pub target_ms: u64,
    #[serde(default = "default_gain")]
    pub gain: f64,
    /// Multiplicative decay applied when queuing delay is above target.
    #[serde(default = "default_dtl_beta")]
    pub dtl_beta: f64,
    #[serde(default = "default_allowed_increase")]
    pub allowed_increase: u64,
    #[serde(default = "default_min_rto_ms")]
    pub min_rto_ms: u64,
    #[serde(default = "default_max_rto_ms")]
    pub max_rto_ms: u64,
    /// One-way delay samples kept for the current delay filter.
    #[serde(default = "default_current_filter")]
    pub current_filter: usize,
    /// Minutes of base delay history.
    #[serde(default = "default_base_history")]
    pub base_history: usize,
    /// Split the window into time panes of `min_rto` width.
    #[serde(default)]
    pub multi_pane: bool,
    #[serde(default)]
    pub loss_policy: LossPolicy,
}

fn default_mss() -> u64 {
    1024
}
fn default_init_cwnd() -> u64 {
    10
}
fn default_min_cwnd() -> u64 {
    2
}
fn default_target_ms() -> u64 {
    100
}
fn default_gain() -> f64 {
    1.0
}
fn default_dtl_beta() -> f64 {
    0.87
}
fn default_allowed_increase() -> u64 {
    1
}
fn default_min_rto_ms() -> u64 {
    200
}
fn default_max_rto_ms() -> u64 {
    10_000
}
fn default_current_filter() -> usize {
    4
}
fn default_base_history() -> usize {
    10
}

impl LedbatConfig {
    pub fn min_rto(&self) -> Duration {
        Duration::from_millis(self.min_rto_ms)
    }

    pub fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }

    /// Window floor in bytes.
    pub fn min_window(&self) -> u64 {
        self.min_cwnd * self.mss
    }

    /// Initial window in bytes.
    pub fn init_window(&self) -> u64 {
        self.init_cwnd * self.mss
    }
}

impl Default for LedbatConfig {
    fn default() -> Self {
        Self {
            mss: default_mss(),
            init_cwnd: default_init_cwnd(),
            min_cwnd: default_min_cwnd(),
            target_ms: default_target_ms(),
            gain: default_gain(),
            dtl_beta: default_dtl_beta(),
            allowed_increase: default_allowed_increase(),
            min_rto_ms: default_min_rto_ms(),
            max_rto_ms: default_max_rto_ms(),
            current_filter: default_current_filter(),
            base_history: default_base_history(),
            multi_pane: false,
            loss_policy: LossPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_block_geometry() {
        let c = TransferConfig::default();
        assert_eq!(c.block_size(), 10 * 1024);
        assert_eq!(c.hash_alg, HashAlg::Sha256);
    }

    #[test]
    fn ledbat_windows_in_bytes() {
        let c = LedbatConfig::default();
        assert_eq!(c.init_window(), 10 * 1024);
        assert_eq!(c.min_window(), 2 * 1024);
        assert_eq!(c.min_rto(), Duration::from_millis(200));
    }
}
