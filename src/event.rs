//! The event-loop adapter.
//!
//! The resolver never blocks and never owns a loop. Instead, the host
//! implements [`EventLoop`] on top of whatever reactor it already runs and
//! hands the implementation to [`Resolver::bind_event_loop`]. Whenever the
//! resolver registers interest in a socket or arms a timer it passes an
//! [`EventContext`]; the host stores that context with the registration and
//! passes it back, verbatim, to [`Resolver::on_read`], [`on_write`] or
//! [`on_timer`] when the event fires. Periodic housekeeping works the same
//! way with [`Housekeeping`] and [`Resolver::on_periodic`].
//!
//! Registrations are identified by [`EventHandle`] values the adapter
//! issues; the resolver keeps them only to cancel or re-arm events.
//!
//! The adapter must not call back into the resolver from within one of the
//! registration methods; readiness is always reported from the loop proper.
//!
//! [`Resolver::bind_event_loop`]: crate::resolver::Resolver::bind_event_loop
//! [`Resolver::on_read`]: crate::resolver::Resolver::on_read
//! [`on_write`]: crate::resolver::Resolver::on_write
//! [`on_timer`]: crate::resolver::Resolver::on_timer
//! [`Resolver::on_periodic`]: crate::resolver::Resolver::on_periodic

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use crate::channel::IoChannel;
use crate::request::Request;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Weak;
use std::time::Duration;

//------------ EventHandle ---------------------------------------------------

/// An opaque identifier for a registered event, issued by the adapter.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EventHandle(pub u64);

//------------ EventContext --------------------------------------------------

/// The dispatch value attached to a readable, writable or timer event.
///
/// A writable socket can mean two different things: a TCP channel with
/// frames to flush (or a connect to finish), or a single UDP request whose
/// send returned `EAGAIN`. The context names the case explicitly instead of
/// leaving the handler to guess from the file descriptor. The references
/// are weak, so a stale registration firing after the object went away is
/// simply ignored.
#[derive(Clone, Debug)]
pub enum EventContext {
    /// The event concerns an I/O channel.
    Channel(Weak<IoChannel>),

    /// The event concerns a single request.
    Request(Weak<RefCell<Request>>),
}

//------------ Housekeeping --------------------------------------------------

/// The dispatch value attached to a periodic event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Housekeeping {
    /// Upstream rescan and idle TCP connection close.
    Rescan,

    /// Replacement of over-used UDP channels.
    ChannelRefresh,
}

//------------ EventLoop -----------------------------------------------------

/// The capability set the resolver consumes from the host's reactor.
///
/// Read interest is persistent: it stays registered until [`del_read`] is
/// called. Write interest likewise stays until [`del_write`]; the resolver
/// removes it as soon as it has nothing left to write. Timers are one-shot
/// but can be re-armed in place with [`repeat_timer`].
///
/// [`del_read`]: Self::del_read
/// [`del_write`]: Self::del_write
/// [`repeat_timer`]: Self::repeat_timer
pub trait EventLoop {
    /// Registers persistent readable interest in `fd`.
    fn add_read(&self, fd: RawFd, ctx: EventContext) -> EventHandle;

    /// Drops a readable-interest registration.
    fn del_read(&self, handle: EventHandle);

    /// Registers writable interest in `fd`.
    fn add_write(&self, fd: RawFd, ctx: EventContext) -> EventHandle;

    /// Drops a writable-interest registration.
    fn del_write(&self, handle: EventHandle);

    /// Arms a one-shot timer firing after `after`.
    fn add_timer(&self, after: Duration, ctx: EventContext) -> EventHandle;

    /// Re-arms a timer for its original interval.
    fn repeat_timer(&self, handle: EventHandle);

    /// Cancels a timer.
    fn del_timer(&self, handle: EventHandle);

    /// Registers a recurring housekeeping callback.
    ///
    /// Hosts without a periodic facility return `None`; housekeeping is
    /// then disabled and the resolver works without it.
    fn add_periodic(
        &self,
        every: Duration,
        task: Housekeeping,
    ) -> Option<EventHandle> {
        let _ = (every, task);
        None
    }

    /// Cancels a periodic registration.
    fn del_periodic(&self, handle: EventHandle) {
        let _ = handle;
    }
}
