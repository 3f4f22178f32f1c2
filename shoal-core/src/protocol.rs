//! Shoal wire protocol: message types and version.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::CacheHint;
use crate::ledbat::MsgId;

/// Current protocol version. Carried in every envelope.
pub const PROTOCOL_VERSION: u8 = 1;

/// Unit of work a downloader asks for inside a `Datum`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Hashes of these blocks.
    Hashes { blocks: Vec<u32> },
    /// One piece of one block.
    Piece { block: u32, piece: u32 },
}

/// Answer carried back inside an `Ack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Known hashes, plus the requested blocks the peer has no hash for.
    HashResp {
        hashes: Vec<(u32, Vec<u8>)>,
        missing: Vec<u32>,
    },
    PieceResp { block: u32, piece: u32, bytes: Bytes },
    /// The peer cannot serve the piece (block not present).
    PieceMissing { block: u32, piece: u32 },
}

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Ask the peer to keep these blocks warm. Sent best-effort.
    CacheHintReq { req_id: u64, hint: CacheHint },
    CacheHintAcc { req_id: u64, stamp: u64 },
    /// Hint ignored because its stamp was not newer than the last one accepted.
    CacheHintRej { req_id: u64, stamp: u64 },
    /// Congestion-controlled request. `send_ts` is milliseconds since the sender's epoch.
    Datum {
        msg_id: MsgId,
        send_ts: u64,
        payload: Request,
    },
    /// Answer to a `Datum`. `msg_id` echoes the datum; `payload_id` numbers the responder's acks.
    /// `data_delay` is (datum send_ts, receive time at responder); `ack_delay` is (ack send time,
    /// receive time). The responder sends the receive half as 0; the downloader fills it in on
    /// arrival.
    Ack {
        msg_id: MsgId,
        payload_id: u64,
        data_delay: (u64, u64),
        ack_delay: (u64, u64),
        payload: Response,
    },
    /// A block was admitted to assembly on the downloader; the peer may prefetch it.
    BlockReq { block: u32, piece_count: u32 },
}

/// What actually travels in a datagram: a message bound to one transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub transfer_id: [u8; 16],
    pub message: Message,
}

impl Envelope {
    pub fn new(transfer_id: [u8; 16], message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            transfer_id,
            message,
        }
    }
}
