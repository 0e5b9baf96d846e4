//! Domain name normalization, encoding and decompression.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use super::WireError;
use crate::error::Error;

/// Longest allowed label.
const MAX_LABEL: usize = 63;

/// Longest allowed encoded name.
const MAX_NAME: usize = 255;

/// Cap on compression pointer hops while decompressing one name.
const MAX_POINTER_HOPS: usize = 128;

/// Strips leading dot runs and trailing dot runs from a name.
///
/// Two inputs that differ only in surrounding dots normalize to the same
/// name and therefore to the same wire encoding. A name that is nothing
/// but dots is rejected.
pub(crate) fn normalize(name: &str) -> Result<&str, Error> {
    let name = name.trim_start_matches('.').trim_end_matches('.');
    if name.is_empty() {
        return Err(Error::InvalidName);
    }
    Ok(name)
}

/// Encodes a host name into uncompressed wire form.
pub(crate) fn encode(name: &str) -> Result<Vec<u8>, Error> {
    let name = normalize(name)?;
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.split('.') {
        if label.is_empty() {
            return Err(Error::InvalidName);
        }
        if label.len() > MAX_LABEL {
            return Err(Error::NameTooLong);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    if out.len() > MAX_NAME {
        return Err(Error::NameTooLong);
    }
    Ok(out)
}

/// Decompresses the name starting at `pos` within `msg`.
///
/// Returns the uncompressed wire form and the position just past the
/// name's in-place representation. Pointer chains are bounded, so crafted
/// loops fail instead of spinning.
pub(crate) fn decompress(
    msg: &[u8],
    pos: usize,
) -> Result<(Vec<u8>, usize), WireError> {
    let mut out = Vec::new();
    let mut pos = pos;
    let mut resume = None;
    let mut hops = 0;
    loop {
        let len = *msg.get(pos).ok_or(WireError)? as usize;
        if len == 0 {
            out.push(0);
            if out.len() > MAX_NAME {
                return Err(WireError);
            }
            return Ok((out, resume.unwrap_or(pos + 1)));
        } else if len & 0xc0 == 0xc0 {
            let low = *msg.get(pos + 1).ok_or(WireError)? as usize;
            if resume.is_none() {
                resume = Some(pos + 2);
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(WireError);
            }
            pos = (len & 0x3f) << 8 | low;
        } else if len & 0xc0 != 0 {
            // 0x40 and 0x80 label types are reserved.
            return Err(WireError);
        } else {
            let end = pos + 1 + len;
            if end > msg.len() {
                return Err(WireError);
            }
            out.push(len as u8);
            out.extend_from_slice(&msg[pos + 1..end]);
            if out.len() > MAX_NAME {
                return Err(WireError);
            }
            pos = end;
        }
    }
}

/// Converts an uncompressed wire name to presentation form.
pub(crate) fn to_string(wire: &[u8]) -> String {
    let mut out = String::new();
    let mut pos = 0;
    while pos < wire.len() {
        let len = wire[pos] as usize;
        if len == 0 {
            break;
        }
        if !out.is_empty() {
            out.push('.');
        }
        let end = (pos + 1 + len).min(wire.len());
        out.push_str(&String::from_utf8_lossy(&wire[pos + 1..end]));
        pos = end;
    }
    out
}

//============ Tests =========================================================
