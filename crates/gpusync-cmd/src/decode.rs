use super::encode::{
    FLAG_POST_SYNC, LAYOUT_COMPACT, LAYOUT_WIDE, OP_CACHE_FLUSH, OP_COMPLETION_WRITE, OP_COPY,
    OP_DISPATCH, OP_SEMAPHORE_WAIT, PACKET_HEADER_SIZE, STREAM_HEADER_SIZE, STREAM_MAGIC,
    STREAM_VERSION,
};
use super::{BufferId, CompareOp, CopyDirection, KernelId, PostSync, SyncCmd};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("stream too short ({0} bytes)")]
    Truncated(usize),
    #[error("bad stream magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported stream version {0}")]
    UnsupportedVersion(u16),
    #[error("unknown stream layout {0}")]
    UnknownLayout(u16),
    #[error("stream header declares {declared} bytes but {actual} were provided")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("packet at offset {offset} is malformed")]
    MalformedPacket { offset: usize },
    #[error("unknown opcode {opcode} at offset {offset}")]
    UnknownOpcode { opcode: u16, offset: usize },
    #[error("stream header declares {declared} commands but {actual} were decoded")]
    CountMismatch { declared: usize, actual: usize },
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let end = self.pos.checked_add(N)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        slice.try_into().ok()
    }

    fn u16(&mut self) -> Option<u16> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take::<8>().map(u64::from_le_bytes)
    }

    fn split_u64(&mut self) -> Option<u64> {
        let lo = self.u32()?;
        let hi = self.u32()?;
        Some(u64::from(lo) | (u64::from(hi) << 32))
    }
}

fn compare_op(flags: u16) -> Option<CompareOp> {
    match flags {
        0 => Some(CompareOp::Equal),
        1 => Some(CompareOp::GreaterOrEqual),
        _ => None,
    }
}

fn direction(flags: u16) -> Option<CopyDirection> {
    match flags {
        0 => Some(CopyDirection::Plain),
        1 => Some(CopyDirection::AuxToNonAux),
        2 => Some(CopyDirection::NonAuxToAux),
        _ => None,
    }
}

/// Parse a stream produced by any [`crate::CommandEncoder`]; the layout is taken from the header.
pub fn decode_stream(bytes: &[u8]) -> Result<Vec<SyncCmd>, DecodeError> {
    if bytes.len() < STREAM_HEADER_SIZE {
        return Err(DecodeError::Truncated(bytes.len()));
    }
    let mut r = Reader { bytes, pos: 0 };
    let truncated = DecodeError::Truncated(bytes.len());

    let magic = r.u32().ok_or(truncated.clone())?;
    if magic != STREAM_MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let version = r.u16().ok_or(truncated.clone())?;
    if version != STREAM_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let layout = r.u16().ok_or(truncated.clone())?;
    if layout != LAYOUT_WIDE && layout != LAYOUT_COMPACT {
        return Err(DecodeError::UnknownLayout(layout));
    }
    let declared_count = r.u32().ok_or(truncated.clone())? as usize;
    let declared_size = r.u32().ok_or(truncated)? as usize;
    if declared_size != bytes.len() {
        return Err(DecodeError::SizeMismatch {
            declared: declared_size,
            actual: bytes.len(),
        });
    }

    let mut cmds = Vec::with_capacity(declared_count);
    while r.pos < bytes.len() {
        let offset = r.pos;
        let malformed = DecodeError::MalformedPacket { offset };
        let opcode = r.u16().ok_or(malformed.clone())?;
        let flags = r.u16().ok_or(malformed.clone())?;
        let size = r.u32().ok_or(malformed.clone())? as usize;
        if size < PACKET_HEADER_SIZE {
            return Err(malformed);
        }

        let cmd = if layout == LAYOUT_WIDE {
            decode_wide(&mut r, opcode, flags, offset)?
        } else {
            decode_compact(&mut r, opcode, flags, offset)?
        };
        if r.pos != offset + size {
            return Err(malformed);
        }
        cmds.push(cmd);
    }

    if cmds.len() != declared_count {
        return Err(DecodeError::CountMismatch {
            declared: declared_count,
            actual: cmds.len(),
        });
    }
    Ok(cmds)
}

fn decode_wide(
    r: &mut Reader<'_>,
    opcode: u16,
    flags: u16,
    offset: usize,
) -> Result<SyncCmd, DecodeError> {
    let malformed = || DecodeError::MalformedPacket { offset };
    let cmd = match opcode {
        OP_SEMAPHORE_WAIT => SyncCmd::SemaphoreWait {
            address: r.u64().ok_or_else(malformed)?,
            value: r.u64().ok_or_else(malformed)?,
            op: compare_op(flags).ok_or_else(malformed)?,
        },
        OP_COMPLETION_WRITE => SyncCmd::CompletionWrite {
            address: r.u64().ok_or_else(malformed)?,
            value: r.u64().ok_or_else(malformed)?,
        },
        OP_COPY => {
            let buffer = r.u64().ok_or_else(malformed)?;
            SyncCmd::Copy {
                buffer: BufferId(u32::try_from(buffer).map_err(|_| malformed())?),
                direction: direction(flags).ok_or_else(malformed)?,
                size: r.u64().ok_or_else(malformed)?,
            }
        }
        OP_DISPATCH => {
            let kernel = r.u64().ok_or_else(malformed)?;
            SyncCmd::Dispatch {
                kernel: KernelId(u32::try_from(kernel).map_err(|_| malformed())?),
                partition: r.u32().ok_or_else(malformed)?,
                partitions: r.u32().ok_or_else(malformed)?,
            }
        }
        OP_CACHE_FLUSH => {
            let address = r.u64().ok_or_else(malformed)?;
            let value = r.u64().ok_or_else(malformed)?;
            SyncCmd::CacheFlush {
                post_sync: (flags & FLAG_POST_SYNC != 0).then_some(PostSync { address, value }),
            }
        }
        _ => return Err(DecodeError::UnknownOpcode { opcode, offset }),
    };
    Ok(cmd)
}

fn decode_compact(
    r: &mut Reader<'_>,
    opcode: u16,
    flags: u16,
    offset: usize,
) -> Result<SyncCmd, DecodeError> {
    let malformed = || DecodeError::MalformedPacket { offset };
    let cmd = match opcode {
        OP_SEMAPHORE_WAIT => SyncCmd::SemaphoreWait {
            address: r.split_u64().ok_or_else(malformed)?,
            value: u64::from(r.u32().ok_or_else(malformed)?),
            op: compare_op(flags).ok_or_else(malformed)?,
        },
        OP_COMPLETION_WRITE => SyncCmd::CompletionWrite {
            address: r.split_u64().ok_or_else(malformed)?,
            value: r.split_u64().ok_or_else(malformed)?,
        },
        OP_COPY => SyncCmd::Copy {
            buffer: BufferId(r.u32().ok_or_else(malformed)?),
            direction: direction(flags).ok_or_else(malformed)?,
            size: r.split_u64().ok_or_else(malformed)?,
        },
        OP_DISPATCH => SyncCmd::Dispatch {
            kernel: KernelId(r.u32().ok_or_else(malformed)?),
            partition: r.u32().ok_or_else(malformed)?,
            partitions: r.u32().ok_or_else(malformed)?,
        },
        OP_CACHE_FLUSH => {
            let post_sync = if flags & FLAG_POST_SYNC != 0 {
                Some(PostSync {
                    address: r.split_u64().ok_or_else(malformed)?,
                    value: r.split_u64().ok_or_else(malformed)?,
                })
            } else {
                None
            };
            SyncCmd::CacheFlush { post_sync }
        }
        _ => return Err(DecodeError::UnknownOpcode { opcode, offset }),
    };
    Ok(cmd)
}
