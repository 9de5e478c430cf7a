//! Git delta instruction decoding.
//!
//! A delta is two size varints (base, result) followed by copy and insert
//! instructions. Only decoding is supported; packs written by this crate
//! are never deltified.

use crate::pack::{MAX_ENTRY_SIZE, PREALLOC_LIMIT};
use crate::{Result, StorageError};

fn corrupt(msg: &str) -> StorageError {
    StorageError::CorruptPack(format!("bad delta: {}", msg))
}

fn next_byte(delta: &[u8], pos: &mut usize) -> Result<u8> {
    let byte = *delta.get(*pos).ok_or_else(|| corrupt("truncated"))?;
    *pos += 1;
    Ok(byte)
}

fn read_size(delta: &[u8], pos: &mut usize) -> Result<usize> {
    let mut size = 0usize;
    let mut shift = 0u32;
    loop {
        let byte = next_byte(delta, pos)?;
        if shift >= usize::BITS {
            return Err(corrupt("size overflow"));
        }
        size |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(size);
        }
    }
}

/// Rebuilds an object from its base and a delta.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    let base_size = read_size(delta, &mut pos)?;
    let result_size = read_size(delta, &mut pos)?;
    if base_size != base.len() {
        return Err(corrupt("base size mismatch"));
    }
    if result_size > MAX_ENTRY_SIZE {
        return Err(corrupt("result too large"));
    }

    let mut out = Vec::with_capacity(result_size.min(PREALLOC_LIMIT));
    while pos < delta.len() {
        let op = next_byte(delta, &mut pos)?;
        if op & 0x80 != 0 {
            let mut offset = 0usize;
            for i in 0..4 {
                if op & (1 << i) != 0 {
                    offset |= (next_byte(delta, &mut pos)? as usize) << (8 * i);
                }
            }
            let mut size = 0usize;
            for i in 0..3 {
                if op & (0x10 << i) != 0 {
                    size |= (next_byte(delta, &mut pos)? as usize) << (8 * i);
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            let end = offset
                .checked_add(size)
                .filter(|end| *end <= base.len())
                .ok_or_else(|| corrupt("copy out of range"))?;
            out.extend_from_slice(&base[offset..end]);
        } else if op != 0 {
            let end = pos + op as usize;
            let literal = delta.get(pos..end).ok_or_else(|| corrupt("truncated insert"))?;
            out.extend_from_slice(literal);
            pos = end;
        } else {
            return Err(corrupt("reserved opcode"));
        }
        if out.len() > result_size {
            return Err(corrupt("result size mismatch"));
        }
    }

    if out.len() != result_size {
        return Err(corrupt("result size mismatch"));
    }
    Ok(out)
}
