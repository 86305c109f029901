//! Binary wire format for leaves and branches
//!
//! Used when permissions travel between server processes. Each value is one
//! flags byte followed by a length-prefixed UTF-8 path:
//!
//! ```text
//! bit 7    present (a lone 0x00 byte encodes "no value")
//! bit 6    long path: u16 big-endian length instead of a u8
//! bit 3    subtractive (branch only)
//! bit 2    superuser (branch only, no path follows)
//! bits 0-1 domain
//! ```

use bytes::{Buf, BufMut};

use super::branch::PermissionBranch;
use super::leaf::PermissionLeaf;
use super::path::{Domain, Mode};
use super::PermissionError;

const FLAG_PRESENT: u8 = 0b1000_0000;
const FLAG_LONG_PATH: u8 = 0b0100_0000;
const FLAG_SUBTRACTIVE: u8 = 0b0000_1000;
const FLAG_SUPERUSER: u8 = 0b0000_0100;
const DOMAIN_MASK: u8 = 0b0000_0011;
const RESERVED_MASK: u8 = 0b0011_0000;

/// Longest path the long form can carry.
pub const MAX_PATH_LEN: usize = u16::MAX as usize;

fn put_path(buf: &mut impl BufMut, flags: u8, path: &str) -> Result<(), PermissionError> {
    let bytes = path.as_bytes();
    if bytes.len() > MAX_PATH_LEN {
        return Err(PermissionError::Codec(format!(
            "Path of {} bytes exceeds maximum of {}",
            bytes.len(),
            MAX_PATH_LEN
        )));
    }

    if bytes.len() > u8::MAX as usize {
        buf.put_u8(flags | FLAG_LONG_PATH);
        buf.put_u16(bytes.len() as u16);
    } else {
        buf.put_u8(flags);
        buf.put_u8(bytes.len() as u8);
    }
    buf.put_slice(bytes);
    Ok(())
}

fn get_path(buf: &mut impl Buf, flags: u8) -> Result<String, PermissionError> {
    let len = if flags & FLAG_LONG_PATH != 0 {
        ensure_remaining(buf, 2)?;
        buf.get_u16() as usize
    } else {
        ensure_remaining(buf, 1)?;
        buf.get_u8() as usize
    };

    ensure_remaining(buf, len)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|e| PermissionError::Codec(format!("Path is not UTF-8: {}", e)))
}

fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), PermissionError> {
    if buf.remaining() < needed {
        return Err(PermissionError::Codec(format!(
            "Truncated input: needed {} bytes, {} remaining",
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_flags(buf: &mut impl Buf) -> Result<Option<u8>, PermissionError> {
    ensure_remaining(buf, 1)?;
    let flags = buf.get_u8();
    if flags & FLAG_PRESENT == 0 {
        return if flags == 0 {
            Ok(None)
        } else {
            Err(PermissionError::Codec(format!(
                "Flags 0x{:02x} set without presence marker",
                flags
            )))
        };
    }
    if flags & RESERVED_MASK != 0 {
        return Err(PermissionError::Codec(format!(
            "Reserved bits set in flags 0x{:02x}",
            flags
        )));
    }
    Ok(Some(flags))
}

/// Append an optional leaf.
pub fn encode_leaf(
    leaf: Option<&PermissionLeaf>,
    buf: &mut impl BufMut,
) -> Result<(), PermissionError> {
    match leaf {
        None => {
            buf.put_u8(0);
            Ok(())
        }
        Some(leaf) => put_path(
            buf,
            FLAG_PRESENT | leaf.domain().wire_code(),
            leaf.path(),
        ),
    }
}

/// Read an optional leaf written by [`encode_leaf`].
pub fn decode_leaf(buf: &mut impl Buf) -> Result<Option<PermissionLeaf>, PermissionError> {
    let Some(flags) = get_flags(buf)? else {
        return Ok(None);
    };
    if flags & (FLAG_SUPERUSER | FLAG_SUBTRACTIVE) != 0 {
        return Err(PermissionError::Codec(format!(
            "Branch-only bits set on a leaf: 0x{:02x}",
            flags
        )));
    }
    let path = get_path(buf, flags)?;
    Ok(Some(PermissionLeaf::new(
        Domain::from_wire_code(flags & DOMAIN_MASK),
        path,
    )))
}

/// Append an optional branch.
pub fn encode_branch(
    branch: Option<&PermissionBranch>,
    buf: &mut impl BufMut,
) -> Result<(), PermissionError> {
    let Some(branch) = branch else {
        buf.put_u8(0);
        return Ok(());
    };

    let mut flags = FLAG_PRESENT;
    if branch.is_subtractive() {
        flags |= FLAG_SUBTRACTIVE;
    }
    if branch.is_superuser() {
        buf.put_u8(flags | FLAG_SUPERUSER);
        return Ok(());
    }
    put_path(buf, flags | branch.domain().wire_code(), branch.path())
}

/// Read an optional branch written by [`encode_branch`].
pub fn decode_branch(buf: &mut impl Buf) -> Result<Option<PermissionBranch>, PermissionError> {
    let Some(flags) = get_flags(buf)? else {
        return Ok(None);
    };
    let mode = if flags & FLAG_SUBTRACTIVE != 0 {
        Mode::Subtractive
    } else {
        Mode::Additive
    };
    if flags & FLAG_SUPERUSER != 0 {
        return Ok(Some(PermissionBranch::superuser(mode)));
    }
    let path = get_path(buf, flags)?;
    Ok(Some(PermissionBranch::new(
        Domain::from_wire_code(flags & DOMAIN_MASK),
        path,
        mode,
    )))
}

/// Encode a list of branches as a u16 count followed by each branch.
pub fn encode_branches(
    branches: &[PermissionBranch],
    buf: &mut impl BufMut,
) -> Result<(), PermissionError> {
    let count = u16::try_from(branches.len()).map_err(|_| {
        PermissionError::Codec(format!("Too many branches to encode: {}", branches.len()))
    })?;
    buf.put_u16(count);
    for branch in branches {
        encode_branch(Some(branch), buf)?;
    }
    Ok(())
}

/// Decode a list written by [`encode_branches`]. Absent entries are rejected.
pub fn decode_branches(buf: &mut impl Buf) -> Result<Vec<PermissionBranch>, PermissionError> {
    ensure_remaining(buf, 2)?;
    let count = buf.get_u16() as usize;
    let mut branches = Vec::with_capacity(count);
    for index in 0..count {
        let branch = decode_branch(buf)?.ok_or_else(|| {
            PermissionError::Codec(format!("Missing branch at index {}", index))
        })?;
        branches.push(branch);
    }
    Ok(branches)
}
