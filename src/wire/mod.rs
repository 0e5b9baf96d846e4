//! The DNS wire codec.
//!
//! Pure encoding and decoding of DNS messages; no I/O happens here.
//! [`compose`] builds query packets, [`parse`] decodes replies, [`name`]
//! handles domain name normalization, encoding and decompression.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

pub(crate) mod compose;
pub(crate) mod name;
pub(crate) mod parse;

use std::fmt;

/// Size of the fixed DNS message header.
pub(crate) const HEADER_SIZE: usize = 12;

/// Receive buffer size for UDP datagrams, also advertised through EDNS0.
pub(crate) const UDP_PACKET_SIZE: usize = 4096;

/// The Internet class.
pub(crate) const CLASS_IN: u16 = 1;

/// The QR header bit: the message is a response.
pub(crate) const FLAG_QR: u16 = 0x8000;

/// The TC header bit: the response was truncated.
pub(crate) const FLAG_TC: u16 = 0x0200;

/// The RD header bit: recursion desired.
pub(crate) const FLAG_RD: u16 = 0x0100;

/// The AD header bit: authenticated data.
pub(crate) const FLAG_AD: u16 = 0x0020;

//------------ WireError -----------------------------------------------------

/// A message was truncated or malformed beyond recovery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct WireError;

//------------ RecordType ----------------------------------------------------

/// The type of a question or of an answer record.
///
/// Only the types the engine can parse are named; anything else in an
/// answer section is skipped.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RecordType {
    /// An IPv4 host address.
    A,
    /// An authoritative name server.
    Ns,
    /// The canonical name of an alias.
    Cname,
    /// The start of a zone of authority.
    Soa,
    /// A domain name pointer.
    Ptr,
    /// A mail exchange.
    Mx,
    /// Descriptive text.
    Txt,
    /// An IPv6 host address.
    Aaaa,
    /// The location of a service.
    Srv,
    /// Any record type. Only meaningful in questions.
    Any,
}

impl RecordType {
    /// The wire value of this type.
    pub(crate) fn to_wire(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Soa => 6,
            RecordType::Ptr => 12,
            RecordType::Mx => 15,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Srv => 33,
            RecordType::Any => 255,
        }
    }

    /// Maps a wire value to a named type, `None` for unsupported types.
    pub(crate) fn from_wire(value: u16) -> Option<Self> {
        match value {
            1 => Some(RecordType::A),
            2 => Some(RecordType::Ns),
            5 => Some(RecordType::Cname),
            6 => Some(RecordType::Soa),
            12 => Some(RecordType::Ptr),
            15 => Some(RecordType::Mx),
            16 => Some(RecordType::Txt),
            28 => Some(RecordType::Aaaa),
            33 => Some(RecordType::Srv),
            255 => Some(RecordType::Any),
            _ => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordType::A => "A",
            RecordType::Ns => "NS",
            RecordType::Cname => "CNAME",
            RecordType::Soa => "SOA",
            RecordType::Ptr => "PTR",
            RecordType::Mx => "MX",
            RecordType::Txt => "TXT",
            RecordType::Aaaa => "AAAA",
            RecordType::Srv => "SRV",
            RecordType::Any => "ANY",
        };
        f.write_str(name)
    }
}

//------------ Question ------------------------------------------------------

/// One question of a request, kept in wire form for reply comparison.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Question {
    /// The encoded, uncompressed QNAME.
    pub(crate) wire_name: Vec<u8>,

    /// The requested record type.
    pub(crate) qtype: RecordType,
}

//------------ Header --------------------------------------------------------

/// The fixed twelve-octet message header, decoded.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Header {
    /// The transaction ID.
    pub(crate) id: u16,

    /// The flag and code bits.
    pub(crate) flags: u16,

    /// Number of questions.
    pub(crate) qdcount: u16,

    /// Number of answer records.
    pub(crate) ancount: u16,
}

impl Header {
    /// Decodes the header, `None` if the message is too short.
    pub(crate) fn parse(msg: &[u8]) -> Option<Header> {
        if msg.len() < HEADER_SIZE {
            return None;
        }
        Some(Header {
            id: u16::from_be_bytes([msg[0], msg[1]]),
            flags: u16::from_be_bytes([msg[2], msg[3]]),
            qdcount: u16::from_be_bytes([msg[4], msg[5]]),
            ancount: u16::from_be_bytes([msg[6], msg[7]]),
        })
    }

    /// Whether the message is a response.
    pub(crate) fn qr(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    /// Whether the response was truncated.
    pub(crate) fn tc(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    /// Whether the server authenticated the data.
    pub(crate) fn ad(&self) -> bool {
        self.flags & FLAG_AD != 0
    }

    /// The four-bit result code.
    pub(crate) fn rcode(&self) -> u8 {
        (self.flags & 0x000f) as u8
    }
}
