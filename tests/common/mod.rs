//! Test support: a deterministic event-loop adapter and loopback fixtures
//! standing in for upstream servers.

#![allow(dead_code)]

use redns::{EventContext, EventHandle, EventLoop, Housekeeping, Reply};
use std::cell::RefCell;
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// The QR bit for crafted reply flags.
pub const QR: u16 = 0x8000;

/// The TC bit for crafted reply flags.
pub const TC: u16 = 0x0200;

/// The AD bit for crafted reply flags.
pub const AD: u16 = 0x0020;

//------------ MockLoop ------------------------------------------------------

/// One recorded fd registration.
pub struct Registration {
    pub handle: EventHandle,
    pub fd: RawFd,
    pub ctx: EventContext,
    pub active: bool,
}

/// One recorded timer.
pub struct TimerReg {
    pub handle: EventHandle,
    pub after: Duration,
    pub ctx: EventContext,
    pub active: bool,
    pub repeats: u32,
}

/// One recorded periodic task.
pub struct PeriodicReg {
    pub handle: EventHandle,
    pub every: Duration,
    pub task: Housekeeping,
    pub active: bool,
}

#[derive(Default)]
struct Inner {
    next: u64,
    reads: Vec<Registration>,
    writes: Vec<Registration>,
    timers: Vec<TimerReg>,
    periodics: Vec<PeriodicReg>,
}

/// An event-loop adapter that records every registration and lets the
/// test fire readiness and timers by hand, in any order it likes.
#[derive(Default)]
pub struct MockLoop {
    inner: RefCell<Inner>,
}

impl MockLoop {
    pub fn new() -> Rc<MockLoop> {
        Rc::new(MockLoop::default())
    }

    /// The context of the `idx`-th read registration ever made.
    pub fn read_ctx(&self, idx: usize) -> EventContext {
        self.inner.borrow().reads[idx].ctx.clone()
    }

    /// The context of the most recent active write registration.
    pub fn last_write_ctx(&self) -> EventContext {
        let inner = self.inner.borrow();
        inner
            .writes
            .iter()
            .rev()
            .find(|reg| reg.active)
            .expect("no active write registration")
            .ctx
            .clone()
    }

    /// The context of the most recent active timer.
    pub fn last_timer_ctx(&self) -> EventContext {
        let inner = self.inner.borrow();
        inner
            .timers
            .iter()
            .rev()
            .find(|reg| reg.active)
            .expect("no active timer")
            .ctx
            .clone()
    }

    /// Read registrations ever made.
    pub fn reads_total(&self) -> usize {
        self.inner.borrow().reads.len()
    }

    /// Currently active read registrations.
    pub fn active_reads(&self) -> usize {
        self.inner.borrow().reads.iter().filter(|r| r.active).count()
    }

    /// Currently active write registrations.
    pub fn active_writes(&self) -> usize {
        self.inner.borrow().writes.iter().filter(|r| r.active).count()
    }

    /// Currently active timers.
    pub fn active_timers(&self) -> usize {
        self.inner.borrow().timers.iter().filter(|r| r.active).count()
    }

    /// Currently active periodic registrations.
    pub fn active_periodics(&self) -> usize {
        self.inner
            .borrow()
            .periodics
            .iter()
            .filter(|r| r.active)
            .count()
    }

    /// Times the most recently armed timer has been re-armed.
    pub fn last_timer_repeats(&self) -> u32 {
        let inner = self.inner.borrow();
        inner.timers.last().map(|reg| reg.repeats).unwrap_or(0)
    }

    fn issue(inner: &mut Inner) -> EventHandle {
        inner.next += 1;
        EventHandle(inner.next)
    }
}

impl EventLoop for MockLoop {
    fn add_read(&self, fd: RawFd, ctx: EventContext) -> EventHandle {
        let mut inner = self.inner.borrow_mut();
        let handle = Self::issue(&mut inner);
        inner.reads.push(Registration {
            handle,
            fd,
            ctx,
            active: true,
        });
        handle
    }

    fn del_read(&self, handle: EventHandle) {
        let mut inner = self.inner.borrow_mut();
        if let Some(reg) =
            inner.reads.iter_mut().find(|reg| reg.handle == handle)
        {
            reg.active = false;
        }
    }

    fn add_write(&self, fd: RawFd, ctx: EventContext) -> EventHandle {
        let mut inner = self.inner.borrow_mut();
        let handle = Self::issue(&mut inner);
        inner.writes.push(Registration {
            handle,
            fd,
            ctx,
            active: true,
        });
        handle
    }

    fn del_write(&self, handle: EventHandle) {
        let mut inner = self.inner.borrow_mut();
        if let Some(reg) =
            inner.writes.iter_mut().find(|reg| reg.handle == handle)
        {
            reg.active = false;
        }
    }

    fn add_timer(&self, after: Duration, ctx: EventContext) -> EventHandle {
        let mut inner = self.inner.borrow_mut();
        let handle = Self::issue(&mut inner);
        inner.timers.push(TimerReg {
            handle,
            after,
            ctx,
            active: true,
            repeats: 0,
        });
        handle
    }

    fn repeat_timer(&self, handle: EventHandle) {
        let mut inner = self.inner.borrow_mut();
        if let Some(reg) =
            inner.timers.iter_mut().find(|reg| reg.handle == handle)
        {
            reg.repeats += 1;
        }
    }

    fn del_timer(&self, handle: EventHandle) {
        let mut inner = self.inner.borrow_mut();
        if let Some(reg) =
            inner.timers.iter_mut().find(|reg| reg.handle == handle)
        {
            reg.active = false;
        }
    }

    fn add_periodic(
        &self,
        every: Duration,
        task: Housekeeping,
    ) -> Option<EventHandle> {
        let mut inner = self.inner.borrow_mut();
        let handle = Self::issue(&mut inner);
        inner.periodics.push(PeriodicReg {
            handle,
            every,
            task,
            active: true,
        });
        Some(handle)
    }

    fn del_periodic(&self, handle: EventHandle) {
        let mut inner = self.inner.borrow_mut();
        if let Some(reg) =
            inner.periodics.iter_mut().find(|reg| reg.handle == handle)
        {
            reg.active = false;
        }
    }
}

//------------ FakeServer ----------------------------------------------------

/// A loopback stand-in for an upstream server: a UDP socket and a TCP
/// listener sharing one port.
pub struct FakeServer {
    pub udp: UdpSocket,
    pub tcp: TcpListener,
}

impl FakeServer {
    /// Binds the pair, retrying until the UDP port is also free for TCP.
    pub fn start() -> FakeServer {
        for _ in 0..8 {
            let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
            let port = udp.local_addr().unwrap().port();
            if let Ok(tcp) = TcpListener::bind(("127.0.0.1", port)) {
                udp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
                return FakeServer { udp, tcp };
            }
        }
        panic!("could not bind a UDP/TCP port pair");
    }

    pub fn port(&self) -> u16 {
        self.udp.local_addr().unwrap().port()
    }

    /// Receives one query datagram, panicking after the read timeout.
    pub fn recv_query(&self) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 4096];
        let (len, peer) = self.udp.recv_from(&mut buf).unwrap();
        (buf[..len].to_vec(), peer)
    }

    /// Tries to receive a datagram within `wait`.
    pub fn try_recv_query(&self, wait: Duration) -> Option<Vec<u8>> {
        self.udp.set_read_timeout(Some(wait)).unwrap();
        let mut buf = [0u8; 4096];
        let res = self.udp.recv_from(&mut buf).ok();
        self.udp.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        res.map(|(len, _)| buf[..len].to_vec())
    }

    /// Accepts the engine's TCP connection and returns the stream with a
    /// read timeout set.
    pub fn accept(&self) -> TcpStream {
        let (stream, _) = self.tcp.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }
}

/// Reads one length-prefixed DNS frame off a TCP stream.
pub fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut prefix = [0u8; 2];
    stream.read_exact(&mut prefix).unwrap();
    let len = u16::from_be_bytes(prefix) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    body
}

/// Wraps a DNS message into a length-prefixed TCP frame.
pub fn frame(msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(msg.len() + 2);
    out.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    out.extend_from_slice(msg);
    out
}

//------------ Reply crafting ------------------------------------------------

/// Builds a reply for a received query: same ID, the question section
/// echoed verbatim, the given flags (add `QR`), and raw answer records.
///
/// Our queries always end in an 11-octet OPT record, so the question
/// section is everything between the header and that record.
pub fn reply_from_query(
    query: &[u8],
    flags: u16,
    ancount: u16,
    answers: &[u8],
) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&query[0..2]);
    msg.extend_from_slice(&flags.to_be_bytes());
    msg.extend_from_slice(&query[4..6]);
    msg.extend_from_slice(&ancount.to_be_bytes());
    msg.extend_from_slice(&[0, 0, 0, 0]);
    msg.extend_from_slice(&query[12..query.len() - 11]);
    msg.extend_from_slice(answers);
    msg
}

/// An A answer record whose owner name points at the first question.
pub fn a_answer(ttl: u32, ip: [u8; 4]) -> Vec<u8> {
    let mut rr = vec![0xc0, 12, 0, 1, 0, 1];
    rr.extend_from_slice(&ttl.to_be_bytes());
    rr.extend_from_slice(&4u16.to_be_bytes());
    rr.extend_from_slice(&ip);
    rr
}

//------------ Callback capture ----------------------------------------------

/// A capture slot plus a callback that fills it.
pub fn capture() -> (Rc<RefCell<Option<Reply>>>, impl FnOnce(Reply)) {
    let slot = Rc::new(RefCell::new(None));
    let sink = slot.clone();
    (slot, move |reply| {
        *sink.borrow_mut() = Some(reply);
    })
}
