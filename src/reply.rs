//! Replies delivered to request callbacks.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use crate::wire::RecordType;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

//------------ Rcode ---------------------------------------------------------

/// The result code of a finished request.
///
/// The first group mirrors the RCODE field of the DNS header and is passed
/// through from the server. The second group is synthesized locally by the
/// engine and never appears on the wire.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Rcode {
    /// No error condition.
    NoError,

    /// The server could not interpret the query.
    FormErr,

    /// The server failed to process the query.
    ServFail,

    /// The queried name does not exist.
    NxDomain,

    /// The server does not support the requested kind of query.
    NotImp,

    /// The server refused to answer.
    Refused,

    /// A name exists when it should not.
    YxDomain,

    /// An RR set exists when it should not.
    YxRrSet,

    /// An RR set that should exist does not.
    NxRrSet,

    /// The server is not authoritative for the zone.
    NotAuth,

    /// A name is not within the zone.
    NotZone,

    /// An RCODE value without a named variant.
    Other(u8),

    /// The server answered NOERROR without a record of the requested type.
    NoRecord,

    /// A permanent network error with no retransmits left.
    NetworkError,

    /// Retransmits were exhausted, or a TCP attempt timed out.
    Timeout,
}

impl Rcode {
    /// Maps the four-bit header RCODE to a result code.
    pub(crate) fn from_wire(value: u8) -> Self {
        match value {
            0 => Rcode::NoError,
            1 => Rcode::FormErr,
            2 => Rcode::ServFail,
            3 => Rcode::NxDomain,
            4 => Rcode::NotImp,
            5 => Rcode::Refused,
            6 => Rcode::YxDomain,
            7 => Rcode::YxRrSet,
            8 => Rcode::NxRrSet,
            9 => Rcode::NotAuth,
            10 => Rcode::NotZone,
            value => Rcode::Other(value),
        }
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rcode::NoError => write!(f, "no error"),
            Rcode::FormErr => write!(f, "query format error"),
            Rcode::ServFail => write!(f, "server failure"),
            Rcode::NxDomain => write!(f, "no such name"),
            Rcode::NotImp => write!(f, "not implemented"),
            Rcode::Refused => write!(f, "query refused"),
            Rcode::YxDomain => write!(f, "name should not exist"),
            Rcode::YxRrSet => write!(f, "RR set should not exist"),
            Rcode::NxRrSet => write!(f, "RR set does not exist"),
            Rcode::NotAuth => write!(f, "not authoritative"),
            Rcode::NotZone => write!(f, "name not in zone"),
            Rcode::Other(value) => write!(f, "rcode {}", value),
            Rcode::NoRecord => write!(f, "requested record is not found"),
            Rcode::NetworkError => write!(f, "network error"),
            Rcode::Timeout => write!(f, "request timed out"),
        }
    }
}

//------------ Reply ---------------------------------------------------------

/// The outcome of a request, handed to the completion callback.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    /// The result code: a server RCODE or a locally synthesized code.
    pub rcode: Rcode,

    /// The server set the AD bit: the answer was DNSSEC-authenticated
    /// upstream. The library itself validates nothing.
    pub authenticated: bool,

    /// The reply had the TC bit set and was delivered as-is because no
    /// TCP retry was possible.
    pub truncated: bool,

    /// The parsed answer records, in answer-section order.
    pub entries: Vec<ReplyEntry>,
}

impl Reply {
    /// Creates an empty reply with the given result code.
    pub(crate) fn with_rcode(rcode: Rcode) -> Self {
        Reply {
            rcode,
            authenticated: false,
            truncated: false,
            entries: Vec::new(),
        }
    }
}

//------------ ReplyEntry ----------------------------------------------------

/// One parsed answer record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplyEntry {
    /// Time to live, seconds.
    pub ttl: u32,

    /// The record data.
    pub data: RecordData,
}

impl ReplyEntry {
    /// Creates an entry.
    pub fn new(ttl: u32, data: RecordData) -> Self {
        ReplyEntry { ttl, data }
    }

    /// The record type of this entry.
    pub fn rtype(&self) -> RecordType {
        self.data.rtype()
    }
}

//------------ RecordData ----------------------------------------------------

/// The typed data of an answer record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecordData {
    /// An IPv4 host address.
    A(Ipv4Addr),

    /// An authoritative name server.
    Ns(String),

    /// The canonical name of an alias.
    Cname(String),

    /// The start of a zone of authority.
    Soa(SoaData),

    /// A domain name pointer.
    Ptr(String),

    /// A mail exchange.
    Mx {
        /// Preference given to this exchange, lower is preferred.
        preference: u16,
        /// The host of the exchange.
        exchange: String,
    },

    /// Descriptive text, character strings concatenated.
    Txt(String),

    /// An IPv6 host address.
    Aaaa(Ipv6Addr),

    /// The location of a service.
    Srv {
        /// Target selection priority, lower is preferred.
        priority: u16,
        /// Relative weight among targets of equal priority.
        weight: u16,
        /// The port the service listens on.
        port: u16,
        /// The host providing the service.
        target: String,
    },
}

impl RecordData {
    /// The record type of this data.
    pub fn rtype(&self) -> RecordType {
        match self {
            RecordData::A(_) => RecordType::A,
            RecordData::Ns(_) => RecordType::Ns,
            RecordData::Cname(_) => RecordType::Cname,
            RecordData::Soa(_) => RecordType::Soa,
            RecordData::Ptr(_) => RecordType::Ptr,
            RecordData::Mx { .. } => RecordType::Mx,
            RecordData::Txt(_) => RecordType::Txt,
            RecordData::Aaaa(_) => RecordType::Aaaa,
            RecordData::Srv { .. } => RecordType::Srv,
        }
    }
}

//------------ SoaData -------------------------------------------------------

/// The fields of an SOA record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SoaData {
    /// The primary name server of the zone.
    pub mname: String,

    /// The mailbox of the person responsible for the zone.
    pub rname: String,

    /// Version number of the zone.
    pub serial: u32,

    /// Refresh interval, seconds.
    pub refresh: u32,

    /// Retry interval, seconds.
    pub retry: u32,

    /// Expiry limit, seconds.
    pub expire: u32,

    /// Minimum TTL, seconds.
    pub minimum: u32,
}
