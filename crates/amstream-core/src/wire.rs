//! On-wire control header.
//!
//! Every active message starts with this fixed 16-byte header. It is the
//! only structure amstream ever places on the wire; message boundaries
//! above the byte stream belong to the caller.
//!
//! ```text
//!  0               8          12         16
//!  +---------------+----------+----------+-------------------+
//!  | sequence u64  | size u32 | op u32   | payload (WRITE)   |
//!  +---------------+----------+----------+-------------------+
//! ```
//!
//! All fields are little-endian. Only `WRITE` carries a payload, and its
//! length must equal `size`. Control ops carry no payload; for them `size`
//! is op-specific metadata.

use crate::error::WireError;

/// Encoded header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Operation code carried in the header.
///
/// Zero is deliberately unassigned so an all-zero header never decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AmOp {
    /// Reader is starved; asks the writer to flush corked data.
    Read = 1,
    /// Data segment; payload follows.
    Write = 2,
    /// Writer's answer to `Read`.
    ReadCompletion = 3,
    /// Reader acknowledges consumed bytes.
    WriteCompletion = 4,
}

impl AmOp {
    /// Whether frames with this op carry a payload.
    #[inline]
    pub const fn has_payload(self) -> bool {
        matches!(self, AmOp::Write)
    }
}

impl TryFrom<u32> for AmOp {
    type Error = WireError;

    fn try_from(v: u32) -> Result<Self, WireError> {
        match v {
            1 => Ok(AmOp::Read),
            2 => Ok(AmOp::Write),
            3 => Ok(AmOp::ReadCompletion),
            4 => Ok(AmOp::WriteCompletion),
            other => Err(WireError::UnknownOp(other)),
        }
    }
}

impl From<AmOp> for u32 {
    fn from(op: AmOp) -> u32 {
        op as u32
    }
}

/// Control header prefixed to every active message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    /// Data sequence number for `Write`; referenced sequence for control ops.
    pub sequence: u64,
    /// Payload length for `Write`; op-specific count for control ops.
    pub size: u32,
    pub op: AmOp,
}

impl WireHeader {
    /// Data segment header.
    pub const fn write(sequence: u64, size: u32) -> Self {
        Self { sequence, size, op: AmOp::Write }
    }

    /// Starvation signal: `next_expected` is the reader's next data
    /// sequence, `wanted` the number of bytes the reader asked for.
    pub const fn read(next_expected: u64, wanted: u32) -> Self {
        Self { sequence: next_expected, size: wanted, op: AmOp::Read }
    }

    /// Answer to `read`: the writer's next sequence and its queued bytes.
    pub const fn read_completion(next_sequence: u64, queued: u32) -> Self {
        Self { sequence: next_sequence, size: queued, op: AmOp::ReadCompletion }
    }

    /// Consumption acknowledgement up to and including `last_consumed`.
    pub const fn write_completion(last_consumed: u64, consumed: u32) -> Self {
        Self { sequence: last_consumed, size: consumed, op: AmOp::WriteCompletion }
    }

    /// Encode to the fixed little-endian layout.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..8].copy_from_slice(&self.sequence.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out[12..16].copy_from_slice(&u32::from(self.op).to_le_bytes());
        out
    }

    /// Decode from the first `HEADER_LEN` bytes of `buf`.
    ///
    /// Trailing bytes are ignored; callers validate the payload separately
    /// with [`WireHeader::check_payload`].
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::Truncated { need: HEADER_LEN, have: buf.len() });
        }
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&buf[0..8]);
        let mut size = [0u8; 4];
        size.copy_from_slice(&buf[8..12]);
        let mut op = [0u8; 4];
        op.copy_from_slice(&buf[12..16]);

        Ok(Self {
            sequence: u64::from_le_bytes(seq),
            size: u32::from_le_bytes(size),
            op: AmOp::try_from(u32::from_le_bytes(op))?,
        })
    }

    /// Check that a received payload matches what this header announces.
    pub fn check_payload(&self, payload_len: usize) -> Result<(), WireError> {
        let expected = if self.op.has_payload() { self.size as usize } else { 0 };
        if payload_len != expected {
            return Err(WireError::PayloadLength {
                op: self.op,
                expected,
                actual: payload_len,
            });
        }
        Ok(())
    }
}
