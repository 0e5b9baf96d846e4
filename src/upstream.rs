//! Upstream server selection.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use crate::server::UpstreamServer;
use std::rc::Rc;

/// A pluggable policy deciding which server serves a query or a retry.
///
/// The resolver consults the policy for every new request and for every
/// retransmit that moves away from its current server, and reports the
/// outcome of each attempt back through [`ok`] and [`fail`]. A policy that
/// returns `None` from a selection hands the decision back to the built-in
/// rotation over the resolver's server list.
///
/// When no policy is installed at all, the resolver rotates over its
/// servers in priority order.
///
/// [`ok`]: Self::ok
/// [`fail`]: Self::fail
pub trait UpstreamPolicy {
    /// Picks a server for a new request.
    ///
    /// `name` is the first question in normalized presentation form.
    fn select(&self, name: &str) -> Option<Rc<UpstreamServer>>;

    /// Picks a server for a retransmit.
    ///
    /// `prev` is the server whose attempt just failed, if it is known.
    fn select_retransmit(
        &self,
        name: &str,
        prev: Option<&Rc<UpstreamServer>>,
    ) -> Option<Rc<UpstreamServer>>;

    /// Reports a reply successfully received from `server`.
    fn ok(&self, server: &Rc<UpstreamServer>);

    /// Reports a failed attempt on `server`.
    fn fail(&self, server: &Rc<UpstreamServer>, reason: &str);

    /// The number of selectable servers.
    fn count(&self) -> usize;

    /// Periodic hook to revive dead servers and refresh weights.
    fn rescan(&self) {}
}
