//! Reply decoding.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use super::{name, Header, Question, RecordType, WireError, CLASS_IN};
use super::HEADER_SIZE;
use crate::reply::{Rcode, RecordData, Reply, ReplyEntry, SoaData};
use std::net::{Ipv4Addr, Ipv6Addr};

//------------ ReplyMismatch -------------------------------------------------

/// Why an inbound packet was not accepted as the reply to a request.
///
/// None of these complete the request; the packet is dropped and the
/// request keeps waiting for its timer or a better packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ReplyMismatch {
    /// The QR bit says the packet is a query, not a response.
    NotAReply,

    /// The question counts of request and reply differ.
    QuestionCount,

    /// A question of the reply differs from the request's.
    QuestionContent,

    /// The packet is truncated or malformed.
    Malformed,
}

//------------ RrOutcome -----------------------------------------------------

/// Outcome of parsing a single answer record.
enum RrOutcome {
    /// A supported record, parsed.
    Entry(ReplyEntry),

    /// An unsupported record type, skipped.
    Skip,
}

/// Parses a reply packet against the request's question list.
///
/// The header is checked first, then every question is compared
/// byte-for-byte (after decompression) against the request's stored
/// questions. On a NOERROR reply the answer records are parsed into reply
/// entries; a malformed record stops parsing but keeps what was already
/// accumulated. When no entry matches the first requested type and the
/// request was not ANY, the result code becomes [`Rcode::NoRecord`].
pub(crate) fn parse_reply(
    msg: &[u8],
    questions: &[Question],
) -> Result<Reply, ReplyMismatch> {
    let header = Header::parse(msg).ok_or(ReplyMismatch::Malformed)?;
    if !header.qr() {
        return Err(ReplyMismatch::NotAReply);
    }
    if header.qdcount as usize != questions.len() || questions.is_empty() {
        return Err(ReplyMismatch::QuestionCount);
    }

    let mut pos = HEADER_SIZE;
    for question in questions {
        let (wire, next) = name::decompress(msg, pos)
            .map_err(|_| ReplyMismatch::Malformed)?;
        let qtype =
            read_u16(msg, next).ok_or(ReplyMismatch::Malformed)?;
        let qclass =
            read_u16(msg, next + 2).ok_or(ReplyMismatch::Malformed)?;
        if wire != question.wire_name
            || qtype != question.qtype.to_wire()
            || qclass != CLASS_IN
        {
            return Err(ReplyMismatch::QuestionContent);
        }
        pos = next + 4;
    }

    let mut reply = Reply::with_rcode(Rcode::from_wire(header.rcode()));
    reply.truncated = header.tc();
    reply.authenticated = header.ad();

    let first_type = questions[0].qtype;
    let mut found = false;
    if reply.rcode == Rcode::NoError {
        for _ in 0..header.ancount {
            match parse_rr(msg, &mut pos) {
                Ok(RrOutcome::Entry(entry)) => {
                    if entry.rtype() == first_type {
                        found = true;
                    }
                    reply.entries.push(entry);
                }
                Ok(RrOutcome::Skip) => {}
                // Incomplete record: keep the entries parsed so far.
                Err(WireError) => break,
            }
        }
        if !found && first_type != RecordType::Any {
            reply.rcode = Rcode::NoRecord;
        }
    }

    Ok(reply)
}

/// Parses one answer record, advancing `pos` past it.
fn parse_rr(msg: &[u8], pos: &mut usize) -> Result<RrOutcome, WireError> {
    let (_owner, next) = name::decompress(msg, *pos)?;
    let rtype = read_u16(msg, next).ok_or(WireError)?;
    let _class = read_u16(msg, next + 2).ok_or(WireError)?;
    let ttl = read_u32(msg, next + 4).ok_or(WireError)?;
    let rdlen = read_u16(msg, next + 8).ok_or(WireError)? as usize;
    let rdata = next + 10;
    let end = rdata + rdlen;
    if end > msg.len() {
        return Err(WireError);
    }
    *pos = end;

    let data = match RecordType::from_wire(rtype) {
        None | Some(RecordType::Any) => return Ok(RrOutcome::Skip),
        Some(RecordType::A) => {
            if rdlen != 4 {
                return Err(WireError);
            }
            RecordData::A(Ipv4Addr::new(
                msg[rdata],
                msg[rdata + 1],
                msg[rdata + 2],
                msg[rdata + 3],
            ))
        }
        Some(RecordType::Aaaa) => {
            if rdlen != 16 {
                return Err(WireError);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&msg[rdata..end]);
            RecordData::Aaaa(Ipv6Addr::from(octets))
        }
        Some(RecordType::Ns) => RecordData::Ns(parse_domain(msg, rdata, end)?),
        Some(RecordType::Cname) => {
            RecordData::Cname(parse_domain(msg, rdata, end)?)
        }
        Some(RecordType::Ptr) => {
            RecordData::Ptr(parse_domain(msg, rdata, end)?)
        }
        Some(RecordType::Mx) => {
            let preference = read_u16(msg, rdata).ok_or(WireError)?;
            RecordData::Mx {
                preference,
                exchange: parse_domain(msg, rdata + 2, end)?,
            }
        }
        Some(RecordType::Txt) => RecordData::Txt(parse_txt(msg, rdata, end)?),
        Some(RecordType::Srv) => {
            let priority = read_u16(msg, rdata).ok_or(WireError)?;
            let weight = read_u16(msg, rdata + 2).ok_or(WireError)?;
            let port = read_u16(msg, rdata + 4).ok_or(WireError)?;
            RecordData::Srv {
                priority,
                weight,
                port,
                target: parse_domain(msg, rdata + 6, end)?,
            }
        }
        Some(RecordType::Soa) => {
            let (mname, after_mname) = name::decompress(msg, rdata)?;
            let (rname, after_rname) = name::decompress(msg, after_mname)?;
            if after_rname + 20 > end {
                return Err(WireError);
            }
            RecordData::Soa(SoaData {
                mname: name::to_string(&mname),
                rname: name::to_string(&rname),
                serial: read_u32(msg, after_rname).ok_or(WireError)?,
                refresh: read_u32(msg, after_rname + 4).ok_or(WireError)?,
                retry: read_u32(msg, after_rname + 8).ok_or(WireError)?,
                expire: read_u32(msg, after_rname + 12).ok_or(WireError)?,
                minimum: read_u32(msg, after_rname + 16).ok_or(WireError)?,
            })
        }
    };

    Ok(RrOutcome::Entry(ReplyEntry::new(ttl, data)))
}

/// Parses a domain name inside rdata; the name may point back into the
/// whole message but its in-place part must stay within the record.
fn parse_domain(
    msg: &[u8],
    start: usize,
    limit: usize,
) -> Result<String, WireError> {
    let (wire, next) = name::decompress(msg, start)?;
    if next > limit {
        return Err(WireError);
    }
    Ok(name::to_string(&wire))
}

/// Parses TXT rdata: character strings, concatenated.
fn parse_txt(
    msg: &[u8],
    start: usize,
    limit: usize,
) -> Result<String, WireError> {
    let mut out = String::new();
    let mut pos = start;
    while pos < limit {
        let len = msg[pos] as usize;
        let end = pos + 1 + len;
        if end > limit {
            return Err(WireError);
        }
        out.push_str(&String::from_utf8_lossy(&msg[pos + 1..end]));
        pos = end;
    }
    Ok(out)
}

/// Reads a big-endian `u16`, `None` past the end of the message.
fn read_u16(msg: &[u8], pos: usize) -> Option<u16> {
    let bytes = msg.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Reads a big-endian `u32`, `None` past the end of the message.
fn read_u32(msg: &[u8], pos: usize) -> Option<u32> {
    let bytes = msg.get(pos..pos + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

//============ Tests =========================================================
