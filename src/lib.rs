//! A recursive-client DNS resolver engine for an external event loop.
//!
//! This crate issues DNS queries over UDP and TCP on behalf of a host
//! application that already owns an event loop. It does not run a loop of
//! its own and it never blocks: the host registers the crate's interest in
//! readable and writable sockets, timers, and periodic housekeeping through
//! the [`EventLoop`] adapter and calls back into the [`Resolver`] handler
//! entry points with the [`EventContext`] it was handed at registration
//! time.
//!
//! The core of the crate is the request lifecycle engine: a query is
//! encoded, assigned a transaction ID on one of the I/O channels of a
//! selected upstream server, tracked in that channel's pending table, and
//! driven through retransmits, server failover and an upgrade to TCP when
//! the UDP reply comes back truncated. Incoming datagrams and stream frames
//! are matched to pending requests by transaction ID, parsed, and delivered
//! through a completion callback that fires exactly once per request.
//!
//! Everything runs on a single thread. Shared state uses `Rc` and interior
//! mutability rather than locks; handlers are re-entrant (a read handler
//! may synchronously queue a TCP retransmit, a completion callback may
//! submit new requests) but must never be called from another thread.
//!
//! What this crate deliberately does not do: answer caching, DNSSEC
//! validation (only the AD bit is surfaced), zone data, or connection
//! multiplexing beyond a small fixed fan-out of channels per server.

pub mod channel;
mod engine;
pub mod error;
pub mod event;
mod permutor;
pub mod plugin;
pub mod reply;
pub mod request;
pub mod resolver;
pub mod server;
pub mod upstream;
mod wire;

pub use self::channel::IoChannel;
pub use self::error::Error;
pub use self::event::{EventContext, EventHandle, EventLoop, Housekeeping};
pub use self::plugin::TransportPlugin;
pub use self::reply::{Rcode, RecordData, Reply, ReplyEntry, SoaData};
pub use self::request::{RequestBuilder, RequestHandle, RequestState};
pub use self::resolver::Resolver;
pub use self::server::UpstreamServer;
pub use self::upstream::UpstreamPolicy;
pub use self::wire::RecordType;
