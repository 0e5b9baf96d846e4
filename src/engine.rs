//! The event handlers and the request state machine.
//!
//! Everything here runs from one of the four handler entry points the host
//! dispatches into: [`Resolver::on_read`], [`Resolver::on_write`],
//! [`Resolver::on_timer`] and [`Resolver::on_periodic`]. Handlers drain
//! their sockets, so they work with level- and edge-triggered reactors
//! alike, and they are re-entrant: a completion callback may submit new
//! requests, a read handler may synchronously queue a TCP retransmit.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use crate::channel::{would_block, IoChannel, OutputFrame, TcpRead};
use crate::event::{EventContext, EventLoop, Housekeeping};
use crate::reply::{Rcode, Reply};
use crate::request::{Request, RequestState};
use crate::resolver::Resolver;
use crate::server::UpstreamServer;
use crate::wire::{self, parse::ReplyMismatch, Header, HEADER_SIZE, UDP_PACKET_SIZE};
use bytes::Bytes;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, error, info, warn};

/// Attempts at drawing a non-colliding transaction ID before giving up.
const MAX_ID_CYCLES: usize = 32;

//------------ SendOutcome ---------------------------------------------------

/// Result of one send attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SendOutcome {
    /// The packet left the socket.
    Sent,

    /// The socket would block; completion comes through a writable event.
    Deferred,

    /// A permanent send error.
    Failed,
}

//------------ Handler entry points ------------------------------------------

impl Resolver {
    /// Handles read readiness on a channel's socket.
    ///
    /// Call this when the event registered through
    /// [`EventLoop::add_read`] fires, passing the registration's context.
    pub fn on_read(self: &Rc<Self>, ctx: &EventContext) {
        let EventContext::Channel(channel) = ctx else {
            debug!("read event carries a request context, ignoring");
            return;
        };
        let Some(ioc) = channel.upgrade() else { return };
        if ioc.is_tcp() {
            if ioc.is_connected() {
                tcp_read(self, &ioc);
            } else {
                error!("read readiness on a TCP channel that is not connected");
            }
        } else {
            udp_read(self, &ioc);
        }
    }

    /// Handles write readiness.
    ///
    /// A writable socket either belongs to a TCP channel with frames to
    /// flush (or a connect to finish), or to a single UDP request that is
    /// resending after `EAGAIN`; the context tells the cases apart.
    pub fn on_write(self: &Rc<Self>, ctx: &EventContext) {
        match ctx {
            EventContext::Channel(channel) => {
                let Some(ioc) = channel.upgrade() else { return };
                if !ioc.is_tcp() {
                    return;
                }
                let Some(el) = self.event_loop() else { return };
                if !ioc.is_connected() {
                    ioc.tcp_connect_done(&el);
                }
                ioc.flush_output(&el);
            }
            EventContext::Request(request) => {
                let Some(req) = request.upgrade() else { return };
                request_writable(self, &req);
            }
        }
    }

    /// Handles a request's timer firing.
    pub fn on_timer(self: &Rc<Self>, ctx: &EventContext) {
        let EventContext::Request(request) = ctx else {
            debug!("timer event carries a channel context, ignoring");
            return;
        };
        let Some(req) = request.upgrade() else { return };
        request_timeout(self, &req);
    }

    /// Runs one periodic housekeeping task.
    pub fn on_periodic(self: &Rc<Self>, task: Housekeeping) {
        match task {
            Housekeeping::Rescan => rescan(self),
            Housekeeping::ChannelRefresh => refresh_channels(self),
        }
    }
}

//------------ Send path -----------------------------------------------------

/// Sends a request's packet on its bound channel.
///
/// With `new_req` the request is being placed on the channel for the first
/// time: a transaction ID colliding with the channel's pending table is
/// regenerated (up to [`MAX_ID_CYCLES`] attempts), and the request is
/// installed in the table with either a timer (packet sent) or a writable
/// event (`EAGAIN`). Retransmits on an already-installed request leave
/// event management to the caller.
pub(crate) fn send_request(
    resolver: &Rc<Resolver>,
    req: &Rc<RefCell<Request>>,
    new_req: bool,
) -> SendOutcome {
    let Some(el) = resolver.event_loop() else {
        return SendOutcome::Failed;
    };
    let Some(ioc) = req.borrow().io.clone() else {
        return SendOutcome::Failed;
    };

    if new_req {
        let mut cycles = 0;
        loop {
            let id = req.borrow().id;
            if !ioc.pending_contains(id) {
                break;
            }
            if cycles >= MAX_ID_CYCLES {
                return SendOutcome::Failed;
            }
            let fresh = resolver.permutor.borrow_mut().next_id();
            req.borrow_mut().set_id(fresh);
            cycles += 1;
        }
    }

    let plugin = resolver.plugin();
    let res = {
        let r = req.borrow();
        ioc.send_packet(&r, plugin.as_ref())
    };
    match res {
        Err(e) if would_block(&e) => {
            if new_req {
                let id = req.borrow().id;
                ioc.pending_insert(id, req.clone());
                let fd = ioc.fd();
                if let Some(fd) = fd {
                    let ev = el
                        .add_write(fd, EventContext::Request(Rc::downgrade(req)));
                    req.borrow_mut().write_ev = Some(ev);
                }
                req.borrow_mut().state = RequestState::WaitSend;
            }
            SendOutcome::Deferred
        }
        Err(e) => {
            if let Some(server) = ioc.server() {
                debug!("send failed: {} for server {}", e, server.name());
            }
            SendOutcome::Failed
        }
        Ok(_) => {
            if new_req {
                let id = req.borrow().id;
                ioc.pending_insert(id, req.clone());
                let timeout = req.borrow().timeout;
                let ev =
                    el.add_timer(timeout, EventContext::Request(Rc::downgrade(req)));
                let mut r = req.borrow_mut();
                r.timer_ev = Some(ev);
                r.state = RequestState::WaitReply;
            }
            SendOutcome::Sent
        }
    }
}

/// Removes a request from its channel's table and cancels its events.
fn unschedule(el: &Rc<dyn EventLoop>, req: &Rc<RefCell<Request>>) {
    let (io, timer, write, id) = {
        let mut r = req.borrow_mut();
        (r.io.clone(), r.timer_ev.take(), r.write_ev.take(), r.id)
    };
    if let Some(ev) = timer {
        el.del_timer(ev);
    }
    if let Some(ev) = write {
        el.del_write(ev);
    }
    if let Some(io) = io {
        io.pending_remove(id);
    }
}

/// Delivers `reply` and finishes the request.
///
/// The channel reference is released before the callback runs; the
/// callback may submit new requests.
fn deliver(req: &Rc<RefCell<Request>>, reply: Reply) {
    let callback = {
        let mut r = req.borrow_mut();
        r.state = RequestState::Replied;
        r.io = None;
        r.callback.take()
    };
    debug_assert!(callback.is_some(), "request delivered twice");
    if let Some(callback) = callback {
        callback(reply);
    }
}

//------------ Read path -----------------------------------------------------

/// Reads datagrams off a UDP channel until the socket would block.
fn udp_read(resolver: &Rc<Resolver>, ioc: &Rc<IoChannel>) {
    let plugin = resolver.plugin();
    let mut buf = [0u8; UDP_PACKET_SIZE];
    loop {
        match ioc.recv_packet(&mut buf, plugin.as_ref()) {
            Err(e) if would_block(&e) => return,
            Err(e) => {
                debug!("error receiving from UDP socket: {}", e);
                return;
            }
            Ok((len, preidentified)) => {
                let req = preidentified.or_else(|| {
                    if len > HEADER_SIZE {
                        find_request(ioc, &buf[..len])
                    } else {
                        None
                    }
                });
                match req {
                    Some(req) => {
                        handle_reply(resolver, ioc, &req, &buf[..len])
                    }
                    // Stray datagrams still age the channel.
                    None => ioc.bump_uses(),
                }
            }
        }
    }
}

/// Drains complete frames off a TCP channel and dispatches them.
fn tcp_read(resolver: &Rc<Resolver>, ioc: &Rc<IoChannel>) {
    loop {
        match ioc.tcp_read() {
            TcpRead::Frame(frame) => {
                if let Some(req) = find_request(ioc, &frame) {
                    handle_reply(resolver, ioc, &req, &frame);
                }
            }
            TcpRead::Blocked => return,
            TcpRead::Reset => {
                if let Some(el) = resolver.event_loop() {
                    ioc.reset(&el);
                }
                return;
            }
        }
    }
}

/// Looks up the pending request matching a packet's transaction ID.
fn find_request(
    ioc: &Rc<IoChannel>,
    packet: &[u8],
) -> Option<Rc<RefCell<Request>>> {
    let header = Header::parse(packet)?;
    let req = ioc.pending_get(header.id);
    if req.is_none() {
        warn!(
            "DNS request with id {} has not been found for IO channel",
            header.id
        );
    }
    req
}

/// Parses a reply and either completes the request or reschedules it over
/// TCP.
fn handle_reply(
    resolver: &Rc<Resolver>,
    ioc: &Rc<IoChannel>,
    req: &Rc<RefCell<Request>>,
    packet: &[u8],
) {
    let parsed = {
        let r = req.borrow();
        wire::parse::parse_reply(packet, &r.questions)
    };
    let reply = match parsed {
        Ok(reply) => reply,
        Err(ReplyMismatch::NotAReply) => {
            info!("got a query packet while waiting for reply");
            return;
        }
        Err(ReplyMismatch::QuestionCount) => {
            info!("reply question count does not match the request");
            return;
        }
        Err(ReplyMismatch::QuestionContent) => {
            let id = req.borrow().id;
            info!("DNS request with id {} is for a different query, ignoring", id);
            return;
        }
        Err(ReplyMismatch::Malformed) => {
            debug!("malformed reply, ignoring");
            return;
        }
    };

    if let Some(server) = ioc.server() {
        resolver.upstream_ok(&server);
    }
    let Some(el) = resolver.event_loop() else { return };
    unschedule(&el, req);

    if reply.truncated && !ioc.is_tcp() {
        debug!("truncated UDP reply for {}", req.borrow().name());
        if let Some(server) = ioc.server() {
            if server.tcp_channel_count() > 0
                && reschedule_over_tcp(resolver, req, &server)
            {
                return;
            }
        }
        // No TCP channel worked; the truncated reply is all there is.
    }
    deliver(req, reply);
}

//------------ TC upgrade ----------------------------------------------------

/// Moves a truncated request onto one of the server's TCP channels.
///
/// The request has already left its UDP channel's table. It gets a fresh,
/// non-colliding transaction ID on the TCP channel before the output frame
/// is built, so table key, packet octets and wire bytes stay in step. A
/// `false` return means no TCP channel could be used and the caller
/// delivers the truncated reply as-is.
fn reschedule_over_tcp(
    resolver: &Rc<Resolver>,
    req: &Rc<RefCell<Request>>,
    server: &Rc<UpstreamServer>,
) -> bool {
    let Some(el) = resolver.event_loop() else { return false };
    let Some(ioc) = server.random_tcp_channel() else { return false };

    if !ioc.is_connected() && !ioc.is_connecting() {
        if let Err(e) = ioc.tcp_connect() {
            debug!("cannot connect TCP channel to {}: {}", server.name(), e);
            return false;
        }
    }

    // The TCP attempt always goes out under a newly generated ID.
    let fresh = resolver.permutor.borrow_mut().next_id();
    req.borrow_mut().set_id(fresh);
    let mut cycles = 0;
    loop {
        let id = req.borrow().id;
        if !ioc.pending_contains(id) {
            break;
        }
        if cycles >= MAX_ID_CYCLES {
            return false;
        }
        let fresh = resolver.permutor.borrow_mut().next_id();
        req.borrow_mut().set_id(fresh);
        cycles += 1;
    }

    let (frame, id, timeout) = {
        let r = req.borrow();
        (
            OutputFrame::new(Bytes::copy_from_slice(&r.packet)),
            r.id,
            r.timeout,
        )
    };
    ioc.push_frame(&el, frame);
    ioc.pending_insert(id, req.clone());
    let ev = el.add_timer(timeout, EventContext::Request(Rc::downgrade(req)));
    {
        let mut r = req.borrow_mut();
        r.timer_ev = Some(ev);
        // Swap the channel binding: the UDP reference drops, the TCP
        // channel is retained.
        r.io = Some(ioc);
        r.state = RequestState::Tcp;
    }
    true
}

//------------ Write path ----------------------------------------------------

/// A request's socket became writable: deliver a fake reply or resend.
fn request_writable(resolver: &Rc<Resolver>, req: &Rc<RefCell<Request>>) {
    let Some(el) = resolver.event_loop() else { return };
    let write_ev = req.borrow_mut().write_ev.take();
    if let Some(ev) = write_ev {
        el.del_write(ev);
    }

    if req.borrow().state == RequestState::Fake {
        let reply = req.borrow_mut().reply.take();
        if let Some(reply) = reply {
            deliver(req, reply);
        }
        return;
    }

    match send_request(resolver, req, false) {
        SendOutcome::Deferred => {
            let fd = req.borrow().io.as_ref().and_then(|io| io.fd());
            if let Some(fd) = fd {
                let ev =
                    el.add_write(fd, EventContext::Request(Rc::downgrade(req)));
                req.borrow_mut().write_ev = Some(ev);
            }
            req.borrow_mut().state = RequestState::WaitSend;
        }
        SendOutcome::Failed => {
            let server = req.borrow().io.as_ref().and_then(|io| io.server());
            resolver.upstream_fail(server.as_ref(), "retransmit send failed");
            unschedule(&el, req);
            deliver(req, Reply::with_rcode(Rcode::NetworkError));
        }
        SendOutcome::Sent => {
            let (timer, timeout) = {
                let r = req.borrow();
                (r.timer_ev, r.timeout)
            };
            match timer {
                Some(ev) => el.repeat_timer(ev),
                None => {
                    let ev = el
                        .add_timer(timeout, EventContext::Request(Rc::downgrade(req)));
                    req.borrow_mut().timer_ev = Some(ev);
                }
            }
            req.borrow_mut().state = RequestState::WaitReply;
        }
    }
}

//------------ Timer path ----------------------------------------------------

/// A request's timer fired: retransmit, fail over, or finish with TIMEOUT.
fn request_timeout(resolver: &Rc<Resolver>, req: &Rc<RefCell<Request>>) {
    let Some(el) = resolver.event_loop() else { return };

    let (state, left) = {
        let mut r = req.borrow_mut();
        r.retransmits = r.retransmits.saturating_sub(1);
        (r.state, r.retransmits)
    };
    // A deferred resend still holds its writable event while the timer
    // runs; the retransmit counter advances all the same.
    debug_assert!(
        matches!(
            state,
            RequestState::WaitReply | RequestState::WaitSend | RequestState::Tcp
        ),
        "timer fired in state {:?}",
        state
    );

    {
        let server = req.borrow().io.as_ref().and_then(|io| io.server());
        resolver.upstream_fail(server.as_ref(), "timeout waiting reply");
    }

    // TCP attempts are not retransmitted.
    if state == RequestState::Tcp || left == 0 {
        unschedule(&el, req);
        deliver(req, Reply::with_rcode(Rcode::Timeout));
        return;
    }

    let mut renew = false;
    let (active, prev_server) = {
        let r = req.borrow();
        (
            r.io.as_ref().map(|io| io.is_active()).unwrap_or(false),
            r.io.as_ref().and_then(|io| io.server()),
        )
    };
    if !active || resolver.server_count() > 1 {
        debug!("reschedule request with id: {}", req.borrow().id());
        unschedule(&el, req);
        req.borrow_mut().io = None;
        let name = req.borrow().name().to_string();
        let Some(server) =
            resolver.select_server(&name, true, prev_server.as_ref())
        else {
            warn!("cannot find suitable server for request");
            deliver(req, Reply::with_rcode(Rcode::ServFail));
            return;
        };
        let Some(ioc) = server.random_udp_channel() else {
            warn!("cannot find suitable server for request");
            deliver(req, Reply::with_rcode(Rcode::ServFail));
            return;
        };
        ioc.bump_uses();
        // The failover attempt goes out under a fresh transaction ID.
        let fresh = resolver.permutor.borrow_mut().next_id();
        {
            let mut r = req.borrow_mut();
            r.io = Some(ioc);
            r.set_id(fresh);
        }
        renew = true;
    }

    // With renew, send_request manages the table and events itself.
    match send_request(resolver, req, renew) {
        SendOutcome::Deferred => {
            if !renew {
                let fd = req.borrow().io.as_ref().and_then(|io| io.fd());
                if let Some(fd) = fd {
                    let ev = el
                        .add_write(fd, EventContext::Request(Rc::downgrade(req)));
                    req.borrow_mut().write_ev = Some(ev);
                }
                // The timer stays armed; retransmits keep counting down
                // while the send waits for the socket.
                let timer = req.borrow().timer_ev;
                if let Some(ev) = timer {
                    el.repeat_timer(ev);
                }
            }
            req.borrow_mut().state = RequestState::WaitSend;
        }
        SendOutcome::Failed => {
            let server = req.borrow().io.as_ref().and_then(|io| io.server());
            resolver
                .upstream_fail(server.as_ref(), "cannot send retransmit after timeout");
            unschedule(&el, req);
            deliver(req, Reply::with_rcode(Rcode::NetworkError));
        }
        SendOutcome::Sent => {
            if !renew {
                let timer = req.borrow().timer_ev;
                if let Some(ev) = timer {
                    el.repeat_timer(ev);
                }
            }
            req.borrow_mut().state = RequestState::WaitReply;
        }
    }
}

//------------ Periodic housekeeping -----------------------------------------

/// Upstream rescan plus idle TCP connection close.
fn rescan(resolver: &Rc<Resolver>) {
    if let Some(policy) = resolver.policy() {
        policy.rescan();
    }
    let Some(el) = resolver.event_loop() else { return };
    for server in resolver.servers_snapshot() {
        for ioc in server.tcp_channels_snapshot() {
            if ioc.is_connected() && ioc.pending_len() == 0 {
                debug!("reset inactive TCP connection to {}", server.name());
                ioc.reset(&el);
            }
        }
    }
}

/// Replaces UDP channels whose use count exceeded the configured ceiling.
fn refresh_channels(resolver: &Rc<Resolver>) {
    let max_uses = resolver.max_ioc_uses();
    if max_uses == 0 {
        return;
    }
    for server in resolver.servers_snapshot() {
        for idx in 0..server.udp_channel_count() {
            let Some(old) = server.udp_channel_at(idx) else { continue };
            if old.uses() <= max_uses {
                continue;
            }
            match IoChannel::open(resolver, &server, false) {
                Ok(fresh) => {
                    debug!(
                        "io channel for server {} replaced after {} uses",
                        server.name(),
                        old.uses()
                    );
                    // In-flight requests keep the old channel alive until
                    // they drain.
                    old.set_active(false);
                    server.replace_udp_channel(idx, fresh);
                }
                Err(e) => error!(
                    "cannot refresh io channel for server {}: {}",
                    server.name(),
                    e
                ),
            }
        }
    }
}

//============ Tests =========================================================
