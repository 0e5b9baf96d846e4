//! Requests: one in-flight DNS query each.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use crate::channel::IoChannel;
use crate::error::Error;
use crate::event::EventHandle;
use crate::reply::Reply;
use crate::resolver::Resolver;
use crate::wire::{Question, RecordType};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Default per-attempt timeout.
const DEF_TIMEOUT: Duration = Duration::from_secs(5);

/// Smallest accepted per-attempt timeout.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Default number of send attempts.
const DEF_RETRANSMITS: u32 = 3;

//------------ RequestState --------------------------------------------------

/// The lifecycle states of a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestState {
    /// Created, nothing sent yet.
    New,

    /// The send returned `EAGAIN`; waiting for the socket to turn writable.
    WaitSend,

    /// Sent; waiting for the reply or the timer.
    WaitReply,

    /// Rescheduled over TCP after a truncated UDP reply.
    Tcp,

    /// A configured fake reply waits to be delivered on the next writable
    /// tick.
    Fake,

    /// Terminal: the callback has fired.
    Replied,
}

//------------ Request -------------------------------------------------------

/// One in-flight query.
///
/// A request owns its encoded packet, its question list (kept for reply
/// verification), its completion callback and its timing state. While the
/// request is in a channel's pending table the first two packet octets
/// always hold its transaction ID in network order.
pub struct Request {
    /// Back-reference to the resolver; never keeps it alive.
    pub(crate) resolver: Weak<Resolver>,

    /// The channel the request is currently bound to.
    pub(crate) io: Option<Rc<IoChannel>>,

    /// The transaction ID, mirrored in the packet's first two octets.
    pub(crate) id: u16,

    /// The encoded query packet. Empty for fake requests.
    pub(crate) packet: Vec<u8>,

    /// The questions, in wire form, for reply verification.
    pub(crate) questions: Vec<Question>,

    /// The first question in presentation form, for upstream selection
    /// and logging.
    pub(crate) name: String,

    /// The completion callback; taken exactly once.
    pub(crate) callback: Option<Box<dyn FnOnce(Reply)>>,

    /// The pre-built reply of a fake request.
    pub(crate) reply: Option<Reply>,

    /// Send attempts left.
    pub(crate) retransmits: u32,

    /// Per-attempt timeout.
    pub(crate) timeout: Duration,

    /// Current lifecycle state.
    pub(crate) state: RequestState,

    /// The armed timer, if any.
    pub(crate) timer_ev: Option<EventHandle>,

    /// The armed writable event, if any.
    pub(crate) write_ev: Option<EventHandle>,
}

impl Request {
    /// The transaction ID.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The encoded query packet.
    pub fn packet(&self) -> &[u8] {
        &self.packet
    }

    /// The current lifecycle state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// The first question in presentation form.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resolver this request runs on, while it is alive.
    pub fn resolver(&self) -> Option<Rc<Resolver>> {
        self.resolver.upgrade()
    }

    /// Rewrites the transaction ID, both the field and the packet octets.
    pub(crate) fn set_id(&mut self, id: u16) {
        self.id = id;
        if self.packet.len() >= 2 {
            self.packet[..2].copy_from_slice(&id.to_be_bytes());
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("retransmits", &self.retransmits)
            .finish_non_exhaustive()
    }
}

//------------ RequestHandle -------------------------------------------------

/// A handle on a submitted request.
///
/// The handle is observational: the request lives in its channel's pending
/// table and completes through its callback whether or not the handle is
/// kept around.
#[derive(Clone)]
pub struct RequestHandle {
    /// The shared request.
    pub(crate) inner: Rc<RefCell<Request>>,
}

impl RequestHandle {
    /// The transaction ID currently assigned to the request.
    pub fn id(&self) -> u16 {
        self.inner.borrow().id
    }

    /// The request's current lifecycle state.
    pub fn state(&self) -> RequestState {
        self.inner.borrow().state
    }
}

//------------ RequestBuilder ------------------------------------------------

/// Builds a request: an ordered list of questions plus timing parameters.
///
/// Created by [`Resolver::request`]; consumed by [`submit`].
///
/// [`Resolver::request`]: crate::resolver::Resolver::request
/// [`submit`]: Self::submit
pub struct RequestBuilder {
    /// The resolver the request will run on.
    pub(crate) resolver: Rc<Resolver>,

    /// Per-attempt timeout.
    pub(crate) timeout: Duration,

    /// Number of send attempts.
    pub(crate) retransmits: u32,

    /// The questions, in order.
    pub(crate) questions: Vec<(String, RecordType)>,
}

impl RequestBuilder {
    /// Creates a builder with default timing.
    pub(crate) fn new(resolver: Rc<Resolver>) -> Self {
        RequestBuilder {
            resolver,
            timeout: DEF_TIMEOUT,
            retransmits: DEF_RETRANSMITS,
            questions: Vec::new(),
        }
    }

    /// Sets the per-attempt timeout. Values below one millisecond are
    /// quietly raised.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(MIN_TIMEOUT);
        self
    }

    /// Sets the number of send attempts. Zero is coerced to one.
    pub fn retransmits(mut self, retransmits: u32) -> Self {
        self.retransmits = retransmits.max(1);
        self
    }

    /// Appends a question.
    pub fn question(
        mut self,
        name: impl Into<String>,
        qtype: RecordType,
    ) -> Self {
        self.questions.push((name.into(), qtype));
        self
    }

    /// Submits the request.
    ///
    /// On success the callback fires exactly once, always from an
    /// event-loop handler, never synchronously from this call. Returns an
    /// error when the name is invalid, the resolver is uninitialized, no
    /// server can be selected, or every send attempt failed outright.
    pub fn submit<F>(self, callback: F) -> Result<RequestHandle, Error>
    where
        F: FnOnce(Reply) + 'static,
    {
        let resolver = self.resolver.clone();
        resolver.make_request(self, Box::new(callback))
    }
}

//============ Tests =========================================================
