use super::{CompareOp, CopyDirection, SyncCmd};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) const STREAM_MAGIC: u32 = 0x4e59_5347; // "GSYN"
pub(crate) const STREAM_VERSION: u16 = 1;
pub(crate) const STREAM_HEADER_SIZE: usize = 16;
pub(crate) const PACKET_HEADER_SIZE: usize = 8;

pub(crate) const LAYOUT_WIDE: u16 = 1;
pub(crate) const LAYOUT_COMPACT: u16 = 2;

pub(crate) const OP_SEMAPHORE_WAIT: u16 = 1;
pub(crate) const OP_COMPLETION_WRITE: u16 = 2;
pub(crate) const OP_COPY: u16 = 3;
pub(crate) const OP_DISPATCH: u16 = 4;
pub(crate) const OP_CACHE_FLUSH: u16 = 5;

pub(crate) const FLAG_POST_SYNC: u16 = 1 << 0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncodeMetrics {
    pub commands_in: usize,
    pub waits: u32,
    pub writes: u32,
    pub copies: u32,
    pub dispatches: u32,
    pub cache_flushes: u32,
    pub bytes_out: usize,
    pub encode_time: Duration,
}

#[derive(Debug, Clone)]
pub struct EncodeResult {
    pub bytes: Vec<u8>,
    pub metrics: EncodeMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("arithmetic overflow while encoding {0}")]
    ArithmeticOverflow(&'static str),
    #[error("{what} value {value:#x} does not fit the compact layout")]
    ValueTooWide { what: &'static str, value: u64 },
}

/// Wire layout selected once per device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    /// Every payload field is a little-endian u64.
    #[default]
    Wide,
    /// Dword-oriented payloads; semaphore operands are limited to 32 bits.
    Compact,
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderKind::Wide => f.write_str("wide"),
            EncoderKind::Compact => f.write_str("compact"),
        }
    }
}

/// Strategy that turns [`SyncCmd`] primitives into engine-consumable bytes.
///
/// Implementations must be deterministic: the same command slice always yields the same bytes.
pub trait CommandEncoder: Send + Sync + fmt::Debug {
    fn kind(&self) -> EncoderKind;

    /// Exact number of bytes `encode` would produce for `cmds`.
    fn encoded_size(&self, cmds: &[SyncCmd]) -> Result<usize, EncodeError>;

    fn encode(&self, cmds: &[SyncCmd]) -> Result<EncodeResult, EncodeError>;
}

pub fn encoder_for(kind: EncoderKind) -> Arc<dyn CommandEncoder> {
    match kind {
        EncoderKind::Wide => Arc::new(WideEncoder),
        EncoderKind::Compact => Arc::new(CompactEncoder),
    }
}

fn add_size(total: usize, size: usize) -> Result<usize, EncodeError> {
    total
        .checked_add(size)
        .ok_or(EncodeError::ArithmeticOverflow("stream size"))
}

fn narrow_u32(what: &'static str, value: u64) -> Result<u32, EncodeError> {
    u32::try_from(value).map_err(|_| EncodeError::ValueTooWide { what, value })
}

fn compare_op_bits(op: CompareOp) -> u16 {
    match op {
        CompareOp::Equal => 0,
        CompareOp::GreaterOrEqual => 1,
    }
}

fn direction_bits(direction: CopyDirection) -> u16 {
    match direction {
        CopyDirection::Plain => 0,
        CopyDirection::AuxToNonAux => 1,
        CopyDirection::NonAuxToAux => 2,
    }
}

/// Little-endian byte writer shared by both layouts.
struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn stream_header(&mut self, layout: u16, cmd_count: u32, total: u32) {
        self.u32(STREAM_MAGIC);
        self.u16(STREAM_VERSION);
        self.u16(layout);
        self.u32(cmd_count);
        self.u32(total);
    }

    fn packet_header(&mut self, opcode: u16, flags: u16, size: usize) -> Result<(), EncodeError> {
        let size = u32::try_from(size).map_err(|_| EncodeError::ArithmeticOverflow("packet size"))?;
        self.u16(opcode);
        self.u16(flags);
        self.u32(size);
        Ok(())
    }
}

fn count(metrics: &mut EncodeMetrics, cmd: &SyncCmd) {
    match cmd {
        SyncCmd::SemaphoreWait { .. } => metrics.waits += 1,
        SyncCmd::CompletionWrite { .. } => metrics.writes += 1,
        SyncCmd::Copy { .. } => metrics.copies += 1,
        SyncCmd::Dispatch { .. } => metrics.dispatches += 1,
        SyncCmd::CacheFlush { .. } => metrics.cache_flushes += 1,
    }
}

fn finish(
    layout: u16,
    cmds: &[SyncCmd],
    total: usize,
    start: Instant,
    body: impl FnOnce(&mut PacketWriter, &mut EncodeMetrics) -> Result<(), EncodeError>,
) -> Result<EncodeResult, EncodeError> {
    let cmd_count =
        u32::try_from(cmds.len()).map_err(|_| EncodeError::ArithmeticOverflow("command count"))?;
    let total_u32 =
        u32::try_from(total).map_err(|_| EncodeError::ArithmeticOverflow("stream size"))?;

    let mut metrics = EncodeMetrics {
        commands_in: cmds.len(),
        ..EncodeMetrics::default()
    };
    let mut w = PacketWriter::with_capacity(total);
    w.stream_header(layout, cmd_count, total_u32);
    body(&mut w, &mut metrics)?;
    debug_assert_eq!(w.buf.len(), total);

    metrics.bytes_out = w.buf.len();
    metrics.encode_time = start.elapsed();
    Ok(EncodeResult {
        bytes: w.buf,
        metrics,
    })
}

/// Layout where every operand is a full u64.
#[derive(Debug, Default, Clone, Copy)]
pub struct WideEncoder;

impl WideEncoder {
    fn packet_size(cmd: &SyncCmd) -> usize {
        PACKET_HEADER_SIZE
            + match cmd {
                SyncCmd::SemaphoreWait { .. } => 16,
                SyncCmd::CompletionWrite { .. } => 16,
                SyncCmd::Copy { .. } => 16,
                SyncCmd::Dispatch { .. } => 16,
                SyncCmd::CacheFlush { .. } => 16,
            }
    }
}

impl CommandEncoder for WideEncoder {
    fn kind(&self) -> EncoderKind {
        EncoderKind::Wide
    }

    fn encoded_size(&self, cmds: &[SyncCmd]) -> Result<usize, EncodeError> {
        cmds.iter()
            .try_fold(STREAM_HEADER_SIZE, |total, cmd| add_size(total, Self::packet_size(cmd)))
    }

    fn encode(&self, cmds: &[SyncCmd]) -> Result<EncodeResult, EncodeError> {
        let start = Instant::now();
        let total = self.encoded_size(cmds)?;
        finish(LAYOUT_WIDE, cmds, total, start, |w, metrics| {
            for cmd in cmds {
                count(metrics, cmd);
                let size = Self::packet_size(cmd);
                match *cmd {
                    SyncCmd::SemaphoreWait { address, value, op } => {
                        w.packet_header(OP_SEMAPHORE_WAIT, compare_op_bits(op), size)?;
                        w.u64(address);
                        w.u64(value);
                    }
                    SyncCmd::CompletionWrite { address, value } => {
                        w.packet_header(OP_COMPLETION_WRITE, 0, size)?;
                        w.u64(address);
                        w.u64(value);
                    }
                    SyncCmd::Copy {
                        buffer,
                        direction,
                        size: bytes,
                    } => {
                        w.packet_header(OP_COPY, direction_bits(direction), size)?;
                        w.u64(u64::from(buffer.0));
                        w.u64(bytes);
                    }
                    SyncCmd::Dispatch {
                        kernel,
                        partition,
                        partitions,
                    } => {
                        w.packet_header(OP_DISPATCH, 0, size)?;
                        w.u64(u64::from(kernel.0));
                        w.u32(partition);
                        w.u32(partitions);
                    }
                    SyncCmd::CacheFlush { post_sync } => {
                        let flags = if post_sync.is_some() { FLAG_POST_SYNC } else { 0 };
                        w.packet_header(OP_CACHE_FLUSH, flags, size)?;
                        let ps = post_sync.unwrap_or(super::PostSync {
                            address: 0,
                            value: 0,
                        });
                        w.u64(ps.address);
                        w.u64(ps.value);
                    }
                }
            }
            Ok(())
        })
    }
}

/// Dword-oriented layout: addresses are split into lo/hi dwords and semaphore operands must fit
/// in 32 bits.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactEncoder;

impl CompactEncoder {
    fn packet_size(cmd: &SyncCmd) -> usize {
        PACKET_HEADER_SIZE
            + match cmd {
                SyncCmd::SemaphoreWait { .. } => 12,
                SyncCmd::CompletionWrite { .. } => 16,
                SyncCmd::Copy { .. } => 12,
                SyncCmd::Dispatch { .. } => 12,
                SyncCmd::CacheFlush { post_sync } => {
                    if post_sync.is_some() {
                        16
                    } else {
                        0
                    }
                }
            }
    }

    fn split(w: &mut PacketWriter, v: u64) {
        w.u32(v as u32);
        w.u32((v >> 32) as u32);
    }
}

impl CommandEncoder for CompactEncoder {
    fn kind(&self) -> EncoderKind {
        EncoderKind::Compact
    }

    fn encoded_size(&self, cmds: &[SyncCmd]) -> Result<usize, EncodeError> {
        cmds.iter()
            .try_fold(STREAM_HEADER_SIZE, |total, cmd| add_size(total, Self::packet_size(cmd)))
    }

    fn encode(&self, cmds: &[SyncCmd]) -> Result<EncodeResult, EncodeError> {
        let start = Instant::now();
        let total = self.encoded_size(cmds)?;
        finish(LAYOUT_COMPACT, cmds, total, start, |w, metrics| {
            for cmd in cmds {
                count(metrics, cmd);
                let size = Self::packet_size(cmd);
                match *cmd {
                    SyncCmd::SemaphoreWait { address, value, op } => {
                        let value = narrow_u32("semaphore operand", value)?;
                        w.packet_header(OP_SEMAPHORE_WAIT, compare_op_bits(op), size)?;
                        Self::split(w, address);
                        w.u32(value);
                    }
                    SyncCmd::CompletionWrite { address, value } => {
                        w.packet_header(OP_COMPLETION_WRITE, 0, size)?;
                        Self::split(w, address);
                        Self::split(w, value);
                    }
                    SyncCmd::Copy {
                        buffer,
                        direction,
                        size: bytes,
                    } => {
                        w.packet_header(OP_COPY, direction_bits(direction), size)?;
                        w.u32(buffer.0);
                        Self::split(w, bytes);
                    }
                    SyncCmd::Dispatch {
                        kernel,
                        partition,
                        partitions,
                    } => {
                        w.packet_header(OP_DISPATCH, 0, size)?;
                        w.u32(kernel.0);
                        w.u32(partition);
                        w.u32(partitions);
                    }
                    SyncCmd::CacheFlush { post_sync } => match post_sync {
                        Some(ps) => {
                            w.packet_header(OP_CACHE_FLUSH, FLAG_POST_SYNC, size)?;
                            Self::split(w, ps.address);
                            Self::split(w, ps.value);
                        }
                        None => w.packet_header(OP_CACHE_FLUSH, 0, size)?,
                    },
                }
            }
            Ok(())
        })
    }
}
