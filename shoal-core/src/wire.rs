//! Framing: length-prefix (4 bytes LE) + bincode payload.

use crate::protocol::Envelope;

const LEN_SIZE: usize = 4;
/// One frame must fit a UDP datagram.
pub const MAX_FRAME_LEN: u32 = 65_507 - LEN_SIZE as u32;

/// Encode an envelope into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(envelope).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode the frame carried by one datagram. Returns the envelope and the number of bytes the frame
/// occupies; anything after it is ignored. A datagram shorter than its length prefix claims is
/// truncated and yields `NeedMore`; datagrams are never reassembled, so the caller drops it.
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let envelope: Envelope =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((envelope, LEN_SIZE + len))
}

/// Error decoding a datagram's frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    /// Datagram shorter than the length prefix or the length it announces.
    #[error("truncated frame")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
