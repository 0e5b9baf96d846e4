//! The resolver: configuration, servers, and the public API.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use crate::channel::IoChannel;
use crate::engine::{self, SendOutcome};
use crate::error::Error;
use crate::event::{EventContext, EventHandle, EventLoop, Housekeeping};
use crate::permutor::IdPermutor;
use crate::plugin::TransportPlugin;
use crate::reply::{Rcode, Reply, ReplyEntry};
use crate::request::{Request, RequestBuilder, RequestHandle, RequestState};
use crate::server::UpstreamServer;
use crate::upstream::UpstreamPolicy;
use crate::wire::{self, Question, RecordType};
use std::cell::{Cell, RefCell};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, warn};

/// Period of the upstream rescan housekeeping task.
const DEF_RESCAN_PERIOD: Duration = Duration::from_secs(60);

/// Longest name the fake-reply table will match.
const MAX_FAKE_NAME: usize = 128;

//------------ Resolver ------------------------------------------------------

/// The top-level resolver object.
///
/// A resolver aggregates upstream servers with their I/O channels, the
/// host's event loop, an optional upstream selection policy, an optional
/// transport plugin and a table of locally configured fake replies.
///
/// Setup runs in three steps: create the resolver, bind the event loop and
/// add servers (plus any optional configuration), then call [`init`] to
/// open the channels. After that, requests are built with [`request`] and
/// complete through their callbacks as the host dispatches events into
/// [`on_read`], [`on_write`], [`on_timer`] and [`on_periodic`].
///
/// Everything is single-threaded; the resolver is neither `Send` nor
/// `Sync`.
///
/// [`init`]: Self::init
/// [`request`]: Self::request
/// [`on_read`]: Self::on_read
/// [`on_write`]: Self::on_write
/// [`on_timer`]: Self::on_timer
/// [`on_periodic`]: Self::on_periodic
pub struct Resolver {
    /// The host's event loop.
    event_loop: RefCell<Option<Rc<dyn EventLoop>>>,

    /// Configured servers, sorted by descending priority.
    servers: RefCell<Vec<Rc<UpstreamServer>>>,

    /// Optional upstream selection policy.
    policy: RefCell<Option<Rc<dyn UpstreamPolicy>>>,

    /// Optional transport plugin for UDP channels.
    plugin: RefCell<Option<Rc<dyn TransportPlugin>>>,

    /// Fake replies by lowercased name and type.
    fake_replies: RefCell<HashMap<(String, RecordType), FakeReply>>,

    /// Channel use ceiling; zero disables rotation.
    max_ioc_uses: Cell<u64>,

    /// Channel refresh period, when rotation is enabled.
    refresh_period: Cell<Option<Duration>>,

    /// Whether queries carry the EDNS0 DO bit.
    dnssec: Cell<bool>,

    /// Set by a successful [`Self::init`].
    initialized: Cell<bool>,

    /// The transaction ID generator.
    pub(crate) permutor: RefCell<IdPermutor>,

    /// Rotation cursor of the built-in upstream fallback.
    rr_cursor: Cell<usize>,

    /// Registration of the rescan periodic.
    rescan_ev: Cell<Option<EventHandle>>,

    /// Registration of the channel refresh periodic.
    refresh_ev: Cell<Option<EventHandle>>,
}

/// A configured fake reply.
struct FakeReply {
    /// The result code to deliver.
    rcode: Rcode,

    /// The answer entries to deliver.
    entries: Vec<ReplyEntry>,
}

impl Resolver {
    /// Creates a resolver.
    ///
    /// It needs an event loop and at least one server, then [`init`],
    /// before it accepts requests.
    ///
    /// [`init`]: Self::init
    pub fn new() -> Rc<Resolver> {
        Rc::new(Resolver {
            event_loop: RefCell::new(None),
            servers: RefCell::new(Vec::new()),
            policy: RefCell::new(None),
            plugin: RefCell::new(None),
            fake_replies: RefCell::new(HashMap::new()),
            max_ioc_uses: Cell::new(0),
            refresh_period: Cell::new(None),
            dnssec: Cell::new(false),
            initialized: Cell::new(false),
            permutor: RefCell::new(IdPermutor::new()),
            rr_cursor: Cell::new(0),
            rescan_ev: Cell::new(None),
            refresh_ev: Cell::new(None),
        })
    }

    /// Binds the host's event loop.
    pub fn bind_event_loop(&self, event_loop: Rc<dyn EventLoop>) {
        *self.event_loop.borrow_mut() = Some(event_loop);
    }

    /// The bound event loop, if any.
    pub(crate) fn event_loop(&self) -> Option<Rc<dyn EventLoop>> {
        self.event_loop.borrow().clone()
    }

    /// Adds an upstream server.
    ///
    /// `name` must be an IP literal. `io_cnt` UDP channels are opened for
    /// the server at init; the TCP channel count defaults to one and can
    /// be changed on the returned record before init.
    pub fn add_server(
        &self,
        name: &str,
        port: u16,
        priority: u32,
        io_cnt: usize,
    ) -> Result<Rc<UpstreamServer>, Error> {
        let server = Rc::new(UpstreamServer::new(name, port, priority, io_cnt)?);
        let mut servers = self.servers.borrow_mut();
        servers.push(server.clone());
        servers.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Ok(server)
    }

    /// Installs an upstream selection policy.
    pub fn set_upstream_policy(&self, policy: Rc<dyn UpstreamPolicy>) {
        *self.policy.borrow_mut() = Some(policy);
    }

    /// The installed policy, if any.
    pub(crate) fn policy(&self) -> Option<Rc<dyn UpstreamPolicy>> {
        self.policy.borrow().clone()
    }

    /// Installs a transport plugin replacing raw UDP send and receive.
    pub fn register_plugin(&self, plugin: Rc<dyn TransportPlugin>) {
        *self.plugin.borrow_mut() = Some(plugin);
    }

    /// The installed plugin, if any.
    pub(crate) fn plugin(&self) -> Option<Rc<dyn TransportPlugin>> {
        self.plugin.borrow().clone()
    }

    /// Enables the EDNS0 DO bit on outgoing queries.
    pub fn set_dnssec(&self, enabled: bool) {
        self.dnssec.set(enabled);
    }

    /// Sets the channel use ceiling and the rotation period.
    ///
    /// Once a UDP channel has carried more than `max_uses` requests it is
    /// replaced with a fresh one on the next rotation tick, which runs
    /// every `period`. In-flight requests keep the old channel alive until
    /// they drain. A zero `max_uses` or zero `period` disables rotation.
    pub fn set_max_io_uses(&self, max_uses: u64, period: Duration) {
        self.max_ioc_uses.set(max_uses);
        self.refresh_period
            .set(if period.is_zero() { None } else { Some(period) });
        if let Some(el) = self.event_loop() {
            if let Some(ev) = self.refresh_ev.take() {
                el.del_periodic(ev);
            }
            if self.initialized.get() {
                if let Some(period) = self.refresh_period.get() {
                    self.refresh_ev
                        .set(el.add_periodic(period, Housekeeping::ChannelRefresh));
                }
            }
        }
    }

    /// The channel use ceiling.
    pub(crate) fn max_ioc_uses(&self) -> u64 {
        self.max_ioc_uses.get()
    }

    /// Registers a fake reply for `(name, qtype)`.
    ///
    /// A matching single-question request is answered locally with `rcode`
    /// and `entries` on the next writable tick, without any socket
    /// traffic. Registering the same key again replaces the result code
    /// and appends the entries.
    pub fn set_fake_reply(
        &self,
        name: &str,
        qtype: RecordType,
        rcode: Rcode,
        entries: Vec<ReplyEntry>,
    ) -> Result<(), Error> {
        let name = wire::name::normalize(name)?.to_ascii_lowercase();
        if name.len() >= MAX_FAKE_NAME {
            return Err(Error::FakeNameTooLong);
        }
        let mut table = self.fake_replies.borrow_mut();
        match table.entry((name, qtype)) {
            Entry::Occupied(mut occupied) => {
                let fake = occupied.get_mut();
                fake.rcode = rcode;
                fake.entries.extend(entries);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(FakeReply { rcode, entries });
            }
        }
        Ok(())
    }

    /// Looks up a fake reply for a single-question request.
    fn lookup_fake(&self, name: &str, qtype: RecordType) -> Option<Reply> {
        if name.len() >= MAX_FAKE_NAME {
            return None;
        }
        let table = self.fake_replies.borrow();
        let fake = table.get(&(name.to_ascii_lowercase(), qtype))?;
        let mut reply = Reply::with_rcode(fake.rcode);
        reply.entries = fake.entries.clone();
        Some(reply)
    }

    /// Opens the channels of every configured server and registers the
    /// periodic housekeeping. The resolver then accepts requests.
    pub fn init(self: &Rc<Self>) -> Result<(), Error> {
        let el = self.event_loop().ok_or(Error::NoEventLoop)?;
        let servers = self.servers.borrow().clone();
        if servers.is_empty() {
            return Err(Error::NoServers);
        }
        for server in &servers {
            let mut udp = Vec::with_capacity(server.io_cnt());
            for _ in 0..server.io_cnt() {
                udp.push(IoChannel::open(self, server, false)?);
            }
            // TCP channels are optional: resolving works without them,
            // truncated replies are then delivered as-is.
            let mut tcp = Vec::with_capacity(server.tcp_cnt());
            for _ in 0..server.tcp_cnt() {
                match IoChannel::open(self, server, true) {
                    Ok(channel) => tcp.push(channel),
                    Err(e) => debug!(
                        "cannot open TCP channel to {}: {}",
                        server.name(),
                        e
                    ),
                }
            }
            server.install_channels(udp, tcp);
        }
        self.rescan_ev
            .set(el.add_periodic(DEF_RESCAN_PERIOD, Housekeeping::Rescan));
        if let Some(period) = self.refresh_period.get() {
            self.refresh_ev
                .set(el.add_periodic(period, Housekeeping::ChannelRefresh));
        }
        self.initialized.set(true);
        Ok(())
    }

    /// Whether [`Self::init`] has run.
    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    /// Starts building a request.
    pub fn request(self: &Rc<Self>) -> RequestBuilder {
        RequestBuilder::new(self.clone())
    }

    /// Builds, binds and sends a request; the entry point behind
    /// [`RequestBuilder::submit`].
    pub(crate) fn make_request(
        self: &Rc<Self>,
        builder: RequestBuilder,
        callback: Box<dyn FnOnce(Reply)>,
    ) -> Result<RequestHandle, Error> {
        if !self.initialized.get() {
            return Err(Error::NotInitialized);
        }
        if builder.questions.is_empty() {
            return Err(Error::NoQuestions);
        }
        let el = self.event_loop().ok_or(Error::NoEventLoop)?;

        let mut questions = Vec::with_capacity(builder.questions.len());
        let mut first_name = None;
        for (raw_name, qtype) in &builder.questions {
            let normalized = wire::name::normalize(raw_name)?.to_string();
            let wire_name = wire::name::encode(&normalized)?;
            if first_name.is_none() {
                first_name = Some(normalized);
            }
            questions.push(Question {
                wire_name,
                qtype: *qtype,
            });
        }
        let first_name = match first_name {
            Some(name) => name,
            None => return Err(Error::NoQuestions),
        };

        // Fake replies short-circuit plain single-question requests.
        let fake = if questions.len() == 1 {
            self.lookup_fake(&first_name, questions[0].qtype)
        } else {
            None
        };

        let (packet, state, reply) = match fake {
            Some(reply) => (Vec::new(), RequestState::Fake, Some(reply)),
            None => {
                let id = self.permutor.borrow_mut().next_id();
                let packet =
                    wire::compose::compose_query(id, &questions, self.dnssec.get());
                (packet, RequestState::New, None)
            }
        };
        let id = if packet.len() >= 2 {
            u16::from_be_bytes([packet[0], packet[1]])
        } else {
            0
        };

        let req = Rc::new(RefCell::new(Request {
            resolver: Rc::downgrade(self),
            io: None,
            id,
            packet,
            questions,
            name: first_name.clone(),
            callback: Some(callback),
            reply,
            retransmits: builder.retransmits.max(1),
            timeout: builder.timeout,
            state,
            timer_ev: None,
            write_ev: None,
        }));

        let mut server = match self.select_server(&first_name, false, None) {
            Some(server) => server,
            None => {
                warn!("cannot find suitable server for request");
                return Err(Error::NoServers);
            }
        };

        if req.borrow().state == RequestState::Fake {
            // The channel is only borrowed for its event-loop slot; the
            // reply is delivered on the next writable tick without any
            // socket traffic.
            let Some(ioc) = server.random_udp_channel() else {
                return Err(Error::NoServers);
            };
            let fd = ioc.fd();
            req.borrow_mut().io = Some(ioc);
            if let Some(fd) = fd {
                let ev =
                    el.add_write(fd, EventContext::Request(Rc::downgrade(&req)));
                req.borrow_mut().write_ev = Some(ev);
            }
            return Ok(RequestHandle { inner: req });
        }

        loop {
            let Some(ioc) = server.random_udp_channel() else {
                return Err(Error::NoServers);
            };
            req.borrow_mut().io = Some(ioc.clone());
            match engine::send_request(self, &req, true) {
                SendOutcome::Failed => {
                    let left = {
                        let mut r = req.borrow_mut();
                        r.retransmits -= 1;
                        r.retransmits
                    };
                    self.upstream_fail(Some(&server), "send IO error");
                    if left == 0 {
                        debug!("cannot send DNS request for {}", first_name);
                        return Err(Error::SendFailed);
                    }
                    server = match self.select_server(
                        &first_name,
                        true,
                        Some(&server),
                    ) {
                        Some(server) => server,
                        None => {
                            warn!("cannot find suitable server for request");
                            return Err(Error::NoServers);
                        }
                    };
                }
                _ => {
                    ioc.bump_uses();
                    break;
                }
            }
        }

        Ok(RequestHandle { inner: req })
    }

    /// Selects a server for a new request or a retransmit.
    ///
    /// The installed policy is asked first; when it abstains (or none is
    /// installed) the built-in rotation decides.
    pub(crate) fn select_server(
        &self,
        name: &str,
        retransmit: bool,
        prev: Option<&Rc<UpstreamServer>>,
    ) -> Option<Rc<UpstreamServer>> {
        if let Some(policy) = self.policy() {
            let choice = if retransmit {
                policy.select_retransmit(name, prev)
            } else {
                policy.select(name)
            };
            if choice.is_some() {
                return choice;
            }
        }
        self.rotate(retransmit, prev)
    }

    /// The built-in fallback: a cursor over the priority-ordered list.
    fn rotate(
        &self,
        retransmit: bool,
        prev: Option<&Rc<UpstreamServer>>,
    ) -> Option<Rc<UpstreamServer>> {
        let servers = self.servers.borrow();
        if servers.is_empty() {
            return None;
        }
        let mut idx = self.rr_cursor.get() % servers.len();
        // A retransmit moves off the server that just failed when it can.
        if retransmit && servers.len() > 1 {
            if let Some(prev) = prev {
                if Rc::ptr_eq(&servers[idx], prev) {
                    idx = (idx + 1) % servers.len();
                }
            }
        }
        self.rr_cursor.set(idx + 1);
        Some(servers[idx].clone())
    }

    /// The number of selectable servers.
    pub(crate) fn server_count(&self) -> usize {
        match self.policy() {
            Some(policy) => policy.count(),
            None => self.servers.borrow().len(),
        }
    }

    /// A snapshot of the server list for housekeeping.
    pub(crate) fn servers_snapshot(&self) -> Vec<Rc<UpstreamServer>> {
        self.servers.borrow().clone()
    }

    /// Reports a success to the upstream policy.
    pub(crate) fn upstream_ok(&self, server: &Rc<UpstreamServer>) {
        if let Some(policy) = self.policy() {
            policy.ok(server);
        }
    }

    /// Reports a failure to the upstream policy.
    pub(crate) fn upstream_fail(
        &self,
        server: Option<&Rc<UpstreamServer>>,
        reason: &str,
    ) {
        if let (Some(policy), Some(server)) = (self.policy(), server) {
            policy.fail(server, reason);
        }
    }

    /// Tears the resolver down: cancels the periodic events and closes
    /// every channel. Runs from `Drop` as well.
    pub fn shutdown(&self) {
        if let Some(el) = self.event_loop() {
            if let Some(ev) = self.rescan_ev.take() {
                el.del_periodic(ev);
            }
            if let Some(ev) = self.refresh_ev.take() {
                el.del_periodic(ev);
            }
            for server in self.servers.borrow().iter() {
                for channel in server.all_channels() {
                    channel.close(&el);
                }
            }
        }
        self.initialized.set(false);
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
