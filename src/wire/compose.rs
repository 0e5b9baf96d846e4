//! Query encoding.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use super::{Question, CLASS_IN, FLAG_RD, UDP_PACKET_SIZE};
use std::collections::HashMap;

/// Record type of the EDNS0 OPT pseudo-RR.
const TYPE_OPT: u16 = 41;

/// The DO ("DNSSEC OK") bit within the OPT TTL field.
const EDNS_DO: u32 = 0x0000_8000;

/// Encodes a query packet: header, question section, EDNS0 OPT record.
///
/// All questions share one header with RD set. With more than one question
/// a single compression table spans the whole section; a single question
/// is written without compression. The OPT record always closes the packet
/// and advertises the receive buffer size; the DO bit follows `dnssec`.
pub(crate) fn compose_query(
    id: u16,
    questions: &[Question],
    dnssec: bool,
) -> Vec<u8> {
    let estimate: usize = questions
        .iter()
        .map(|q| q.wire_name.len() + 4)
        .sum::<usize>()
        + 12
        + 11;
    let mut buf = Vec::with_capacity(estimate);

    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&FLAG_RD.to_be_bytes());
    buf.extend_from_slice(&(questions.len() as u16).to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    // The additional section always carries the OPT record.
    buf.extend_from_slice(&1u16.to_be_bytes());

    let mut table = if questions.len() > 1 {
        Some(HashMap::new())
    } else {
        None
    };
    for question in questions {
        match &mut table {
            Some(table) => write_compressed(&mut buf, &question.wire_name, table),
            None => buf.extend_from_slice(&question.wire_name),
        }
        buf.extend_from_slice(&question.qtype.to_wire().to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());
    }

    // OPT: root name, type, requestor's payload size as the class, the
    // extended rcode/version/flags as the TTL, empty rdata.
    buf.push(0);
    buf.extend_from_slice(&TYPE_OPT.to_be_bytes());
    buf.extend_from_slice(&(UDP_PACKET_SIZE as u16).to_be_bytes());
    let ttl: u32 = if dnssec { EDNS_DO } else { 0 };
    buf.extend_from_slice(&ttl.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());

    buf
}

/// Writes a name, replacing any already-seen suffix with a pointer.
fn write_compressed(
    buf: &mut Vec<u8>,
    wire_name: &[u8],
    table: &mut HashMap<Vec<u8>, u16>,
) {
    let mut pos = 0;
    while wire_name[pos] != 0 {
        let suffix = &wire_name[pos..];
        if let Some(&offset) = table.get(suffix) {
            buf.extend_from_slice(&(0xc000 | offset).to_be_bytes());
            return;
        }
        let here = buf.len();
        // Offsets past the pointer range are written but not recorded.
        if here < 0x4000 {
            table.insert(suffix.to_vec(), here as u16);
        }
        let len = wire_name[pos] as usize;
        buf.extend_from_slice(&wire_name[pos..pos + 1 + len]);
        pos += 1 + len;
    }
    buf.push(0);
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::{name, Header, RecordType, FLAG_RD};

    fn question(qname: &str, qtype: RecordType) -> Question {
        Question {
            wire_name: name::encode(qname).unwrap(),
            qtype,
        }
    }

    #[test]
    fn single_question_layout() {
        let q = [question("example.com", RecordType::A)];
        let packet = compose_query(0x1234, &q, false);

        let header = Header::parse(&packet).unwrap();
        assert_eq!(header.id, 0x1234);
        assert!(!header.qr());
        assert_eq!(header.flags, FLAG_RD);
        assert_eq!(header.qdcount, 1);
        assert_eq!(header.ancount, 0);

        // QNAME, QTYPE, QCLASS follow the header verbatim.
        let qname = name::encode("example.com").unwrap();
        assert_eq!(&packet[12..12 + qname.len()], &qname[..]);
        let after = 12 + qname.len();
        assert_eq!(&packet[after..after + 4], &[0, 1, 0, 1]);
    }

    #[test]
    fn opt_record_closes_the_packet() {
        let q = [question("example.com", RecordType::A)];
        let packet = compose_query(1, &q, false);

        // Root name, type 41, class = payload size, zero ttl, empty rdata.
        let opt = &packet[packet.len() - 11..];
        assert_eq!(opt[0], 0);
        assert_eq!(u16::from_be_bytes([opt[1], opt[2]]), 41);
        assert_eq!(
            u16::from_be_bytes([opt[3], opt[4]]) as usize,
            UDP_PACKET_SIZE
        );
        assert_eq!(&opt[5..9], &[0, 0, 0, 0]);
        assert_eq!(&opt[9..11], &[0, 0]);

        // Exactly one OPT in the packet.
        assert_eq!(u16::from_be_bytes([packet[10], packet[11]]), 1);
    }

    #[test]
    fn dnssec_sets_the_do_bit() {
        let q = [question("example.com", RecordType::A)];
        let packet = compose_query(1, &q, true);
        let opt = &packet[packet.len() - 11..];
        assert_eq!(&opt[5..9], &[0, 0, 0x80, 0]);
    }

    #[test]
    fn second_question_compresses_to_a_pointer() {
        let qs = [
            question("example.com", RecordType::A),
            question("example.com", RecordType::Aaaa),
        ];
        let packet = compose_query(1, &qs, false);

        let qname = name::encode("example.com").unwrap();
        let second = 12 + qname.len() + 4;
        // The repeated name collapses to a two-octet pointer at offset 12.
        assert_eq!(&packet[second..second + 2], &[0xc0, 12]);

        let (wire, _) = name::decompress(&packet, second).unwrap();
        assert_eq!(wire, qname);
    }

    #[test]
    fn shared_suffix_compresses_partially() {
        let qs = [
            question("example.com", RecordType::A),
            question("www.example.com", RecordType::A),
        ];
        let packet = compose_query(1, &qs, false);

        let first = name::encode("example.com").unwrap();
        let second_start = 12 + first.len() + 4;
        // "www" label written in place, remainder is a pointer to 12.
        assert_eq!(&packet[second_start..second_start + 4], b"\x03www");
        assert_eq!(&packet[second_start + 4..second_start + 6], &[0xc0, 12]);

        let (wire, _) = name::decompress(&packet, second_start).unwrap();
        assert_eq!(wire, name::encode("www.example.com").unwrap());
    }

    #[test]
    fn questions_round_trip() {
        let qs = [
            question("example.com", RecordType::A),
            question("mail.example.com", RecordType::Mx),
            question("other.example.org", RecordType::Txt),
        ];
        let packet = compose_query(7, &qs, false);

        let mut pos = 12;
        for q in &qs {
            let (wire, next) = name::decompress(&packet, pos).unwrap();
            assert_eq!(wire, q.wire_name);
            assert_eq!(
                u16::from_be_bytes([packet[next], packet[next + 1]]),
                q.qtype.to_wire()
            );
            assert_eq!(
                u16::from_be_bytes([packet[next + 2], packet[next + 3]]),
                CLASS_IN
            );
            pos = next + 4;
        }
    }
}
