//! Transport plugin hook for UDP channels.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use crate::channel::IoChannel;
use crate::request::Request;
use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;

/// Replaces the raw send and receive operations of UDP channels.
///
/// A plugin typically wraps queries in an encrypted envelope. Because the
/// envelope may carry its own request identification (a nonce, say), the
/// receive hook may resolve the request itself; when it returns `None` the
/// engine falls back to matching the transaction ID of the decoded packet.
///
/// Both hooks run on the engine's thread and must not call back into the
/// resolver.
pub trait TransportPlugin {
    /// Sends the request's packet on `socket`.
    ///
    /// `peer` is `Some` until the channel's socket has been connected;
    /// afterwards the plugin sends to the connected peer.
    fn send(
        &self,
        req: &Request,
        socket: &UdpSocket,
        peer: Option<&SocketAddr>,
    ) -> io::Result<usize>;

    /// Receives a datagram into `buf`, returning the decoded length and,
    /// if the plugin identified it, the matching request.
    fn recv(
        &self,
        channel: &IoChannel,
        socket: &UdpSocket,
        buf: &mut [u8],
    ) -> io::Result<(usize, Option<Rc<RefCell<Request>>>)>;
}
