//! I/O channels: one socket to one upstream server.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use crate::error::Error;
use crate::event::{EventContext, EventHandle, EventLoop};
use crate::plugin::TransportPlugin;
use crate::request::Request;
use crate::resolver::Resolver;
use crate::server::UpstreamServer;
use crate::wire::HEADER_SIZE;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io::{self, IoSlice, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, error};

/// Ceiling for the lazily grown TCP read buffer.
const MAX_READ_BUF: usize = u16::MAX as usize;

//------------ IoChannel -----------------------------------------------------

/// A single UDP or TCP channel to one upstream server.
///
/// A channel owns its socket, the pending table mapping transaction IDs to
/// in-flight requests, and a use counter that eventually rotates the
/// channel out (see [`Resolver::set_max_io_uses`]). TCP channels
/// additionally carry an output chain of queued frames and the state of a
/// partially read inbound frame.
///
/// Channels are shared: the owning server holds them, and every request
/// currently bound to a channel holds it too, which is what keeps a
/// rotated-out channel alive until its last reply arrives.
///
/// [`Resolver::set_max_io_uses`]: crate::resolver::Resolver::set_max_io_uses
pub struct IoChannel {
    /// The upstream peer address.
    peer: SocketAddr,

    /// Back-reference to the resolver; never keeps it alive.
    resolver: Weak<Resolver>,

    /// Back-reference to the owning server; never keeps it alive.
    server: Weak<UpstreamServer>,

    /// Whether this is a TCP channel.
    tcp: bool,

    /// UDP: the socket was `connect`ed after its first successful send.
    /// TCP: the connection is established.
    connected: Cell<bool>,

    /// The channel accepts new requests. Cleared when the channel is
    /// rotated out; in-flight requests still drain on it.
    active: Cell<bool>,

    /// A TCP connect is in flight.
    connecting: Cell<bool>,

    /// The socket, while one is open.
    sock: RefCell<Option<ChannelSocket>>,

    /// In-flight requests by transaction ID.
    pending: RefCell<HashMap<u16, Rc<RefCell<Request>>>>,

    /// Requests (and stray datagrams) this channel has carried.
    uses: Cell<u64>,

    /// Readable-interest registration.
    read_ev: Cell<Option<EventHandle>>,

    /// Writable-interest registration (TCP flush).
    write_ev: Cell<Option<EventHandle>>,

    /// TCP framing state.
    tcp_io: RefCell<TcpIo>,
}

/// The socket held by a channel.
enum ChannelSocket {
    /// A datagram socket.
    Udp(UdpSocket),

    /// A stream socket, possibly with the connect still in flight.
    Tcp(TcpStream),
}

/// Output chain and partial-read state of a TCP channel.
#[derive(Default)]
struct TcpIo {
    /// Frames waiting to be written, in FIFO order.
    out: VecDeque<OutputFrame>,

    /// The two length-prefix octets being collected.
    len_buf: [u8; 2],

    /// Octets of the current inbound frame read so far, prefix included.
    cur_read: usize,

    /// Body length of the frame being read.
    next_read_size: usize,

    /// Lazily grown read buffer, doubling up to [`MAX_READ_BUF`].
    read_buf: Vec<u8>,
}

//------------ OutputFrame ---------------------------------------------------

/// One queued TCP frame: big-endian length prefix plus message body.
pub(crate) struct OutputFrame {
    /// The length prefix.
    prefix: [u8; 2],

    /// The DNS message.
    body: Bytes,

    /// Octets written so far, prefix included.
    written: usize,
}

impl OutputFrame {
    /// Creates a frame for `body`.
    pub(crate) fn new(body: Bytes) -> OutputFrame {
        let len = body.len() as u16;
        OutputFrame {
            prefix: len.to_be_bytes(),
            body,
            written: 0,
        }
    }

    /// Whether the whole frame has been written out.
    fn is_complete(&self) -> bool {
        self.written >= 2 + self.body.len()
    }
}

//------------ TcpRead -------------------------------------------------------

/// Result of draining the read side of a TCP channel.
pub(crate) enum TcpRead {
    /// A complete frame arrived.
    Frame(Bytes),

    /// Nothing more to read for now.
    Blocked,

    /// EOF or a fatal error; the channel must be reset.
    Reset,
}

/// Why a single read step could not complete a frame.
enum ReadStep {
    /// The socket would block.
    Blocked,

    /// The peer closed the stream.
    Eof,

    /// The length prefix names a frame smaller than a DNS header.
    ShortPrefix(usize),

    /// An I/O error.
    Io(io::Error),
}

impl IoChannel {
    /// Opens a channel to `server`.
    ///
    /// UDP channels get their socket and readable registration right away;
    /// TCP channels stay dormant until the first connect.
    pub(crate) fn open(
        resolver: &Rc<Resolver>,
        server: &Rc<UpstreamServer>,
        tcp: bool,
    ) -> Result<Rc<IoChannel>, Error> {
        let peer = server.addr();
        let sock = if tcp {
            None
        } else {
            let udp =
                udp_socket(peer).map_err(|e| Error::Socket(Arc::new(e)))?;
            Some(ChannelSocket::Udp(udp))
        };
        let channel = Rc::new(IoChannel {
            peer,
            resolver: Rc::downgrade(resolver),
            server: Rc::downgrade(server),
            tcp,
            connected: Cell::new(false),
            active: Cell::new(true),
            connecting: Cell::new(false),
            sock: RefCell::new(sock),
            pending: RefCell::new(HashMap::new()),
            uses: Cell::new(0),
            read_ev: Cell::new(None),
            write_ev: Cell::new(None),
            tcp_io: RefCell::new(TcpIo::default()),
        });
        if !tcp {
            let el = resolver.event_loop().ok_or(Error::NoEventLoop)?;
            if let Some(fd) = channel.fd() {
                let ev = el
                    .add_read(fd, EventContext::Channel(Rc::downgrade(&channel)));
                channel.read_ev.set(Some(ev));
            }
        }
        Ok(channel)
    }

    /// Whether this is a TCP channel.
    pub fn is_tcp(&self) -> bool {
        self.tcp
    }

    /// The upstream peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The owning server, while it is alive.
    pub fn server(&self) -> Option<Rc<UpstreamServer>> {
        self.server.upgrade()
    }

    /// Whether the socket is connected (see [`IoChannel`]).
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.get()
    }

    /// Whether the channel still accepts new requests.
    pub(crate) fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Whether a TCP connect is in flight.
    pub(crate) fn is_connecting(&self) -> bool {
        self.connecting.get()
    }

    /// Marks the channel active or rotated-out.
    pub(crate) fn set_active(&self, active: bool) {
        self.active.set(active);
    }

    /// The current use count.
    pub(crate) fn uses(&self) -> u64 {
        self.uses.get()
    }

    /// Bumps the use count.
    pub(crate) fn bump_uses(&self) {
        self.uses.set(self.uses.get() + 1);
    }

    /// The raw file descriptor of the open socket, if any.
    pub(crate) fn fd(&self) -> Option<RawFd> {
        self.sock.borrow().as_ref().map(|sock| match sock {
            ChannelSocket::Udp(udp) => udp.as_raw_fd(),
            ChannelSocket::Tcp(stream) => stream.as_raw_fd(),
        })
    }

    /// Whether `id` is taken in the pending table.
    pub(crate) fn pending_contains(&self, id: u16) -> bool {
        self.pending.borrow().contains_key(&id)
    }

    /// Installs a request under its transaction ID.
    pub(crate) fn pending_insert(&self, id: u16, req: Rc<RefCell<Request>>) {
        self.pending.borrow_mut().insert(id, req);
    }

    /// Removes and returns the request under `id`.
    pub(crate) fn pending_remove(
        &self,
        id: u16,
    ) -> Option<Rc<RefCell<Request>>> {
        self.pending.borrow_mut().remove(&id)
    }

    /// Looks up the request under `id`.
    pub(crate) fn pending_get(&self, id: u16) -> Option<Rc<RefCell<Request>>> {
        self.pending.borrow().get(&id).cloned()
    }

    /// Number of in-flight requests on this channel.
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Sends a request's packet over a UDP channel.
    ///
    /// An unconnected socket sends to the peer address and is `connect`ed
    /// after the first successful send, so later sends (and receives)
    /// go through the connected fast path.
    pub(crate) fn send_packet(
        &self,
        req: &Request,
        plugin: Option<&Rc<dyn TransportPlugin>>,
    ) -> io::Result<usize> {
        let sock = self.sock.borrow();
        let Some(ChannelSocket::Udp(udp)) = sock.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel has no UDP socket",
            ));
        };
        let connected = self.connected.get();
        let sent = match plugin {
            Some(plugin) => {
                let peer = if connected { None } else { Some(&self.peer) };
                plugin.send(req, udp, peer)?
            }
            None => {
                if connected {
                    udp.send(req.packet())?
                } else {
                    udp.send_to(req.packet(), self.peer)?
                }
            }
        };
        if !connected {
            match udp.connect(self.peer) {
                Ok(()) => self.connected.set(true),
                Err(e) => {
                    if let Some(server) = self.server() {
                        error!(
                            "cannot connect after sending request: {} for server {}",
                            e,
                            server.name()
                        );
                    }
                }
            }
        }
        Ok(sent)
    }

    /// Receives one datagram off a UDP channel.
    pub(crate) fn recv_packet(
        &self,
        buf: &mut [u8],
        plugin: Option<&Rc<dyn TransportPlugin>>,
    ) -> io::Result<(usize, Option<Rc<RefCell<Request>>>)> {
        let sock = self.sock.borrow();
        let Some(ChannelSocket::Udp(udp)) = sock.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel has no UDP socket",
            ));
        };
        match plugin {
            Some(plugin) => plugin.recv(self, udp, buf),
            None => udp.recv(buf).map(|len| (len, None)),
        }
    }

    /// Starts a non-blocking TCP connect unless one is established or in
    /// flight already.
    pub(crate) fn tcp_connect(&self) -> io::Result<()> {
        if self.connected.get() || self.connecting.get() {
            return Ok(());
        }
        let stream = tcp_socket(self.peer)?;
        *self.sock.borrow_mut() = Some(ChannelSocket::Tcp(stream));
        self.connecting.set(true);
        Ok(())
    }

    /// Completes a TCP connect on the first write readiness.
    ///
    /// Connect errors are not probed here; a failed connect surfaces as a
    /// write error or EOF and resets the channel.
    pub(crate) fn tcp_connect_done(
        self: &Rc<Self>,
        el: &Rc<dyn EventLoop>,
    ) {
        self.connected.set(true);
        self.active.set(true);
        self.connecting.set(false);
        if self.read_ev.get().is_none() {
            if let Some(fd) = self.fd() {
                let ev =
                    el.add_read(fd, EventContext::Channel(Rc::downgrade(self)));
                self.read_ev.set(Some(ev));
            }
        }
    }

    /// Queues a frame and makes sure writable interest is armed.
    pub(crate) fn push_frame(
        self: &Rc<Self>,
        el: &Rc<dyn EventLoop>,
        frame: OutputFrame,
    ) {
        self.tcp_io.borrow_mut().out.push_back(frame);
        if self.write_ev.get().is_none() {
            if let Some(fd) = self.fd() {
                let ev =
                    el.add_write(fd, EventContext::Channel(Rc::downgrade(self)));
                self.write_ev.set(Some(ev));
            }
        }
    }

    /// Writes as much of the output chain as the socket accepts and drops
    /// writable interest once the chain is empty.
    ///
    /// Returns `false` if the channel died and was reset.
    pub(crate) fn flush_output(&self, el: &Rc<dyn EventLoop>) -> bool {
        loop {
            let res = {
                let mut tcp_io = self.tcp_io.borrow_mut();
                let Some(frame) = tcp_io.out.front_mut() else {
                    break;
                };
                let sock = self.sock.borrow();
                let Some(ChannelSocket::Tcp(stream)) = sock.as_ref() else {
                    break;
                };
                write_frame(stream, frame)
            };
            match res {
                Ok(_) => {
                    let mut tcp_io = self.tcp_io.borrow_mut();
                    let done = tcp_io
                        .out
                        .front()
                        .map(|frame| frame.is_complete())
                        .unwrap_or(false);
                    if done {
                        tcp_io.out.pop_front();
                        continue;
                    }
                    // Partial write; wait for the next readiness.
                    break;
                }
                Err(e) if would_block(&e) => break,
                Err(e) => {
                    if let Some(server) = self.server() {
                        error!(
                            "error when trying to write request to {}: {}",
                            server.name(),
                            e
                        );
                    }
                    self.reset(el);
                    return false;
                }
            }
        }
        if self.tcp_io.borrow().out.is_empty() {
            if let Some(ev) = self.write_ev.take() {
                el.del_write(ev);
            }
        }
        true
    }

    /// Drains the read side of a TCP channel.
    ///
    /// Keeps reading until a full frame is assembled, the socket would
    /// block, or the stream dies. A length prefix smaller than a DNS
    /// header is a protocol violation that kills the channel.
    pub(crate) fn tcp_read(&self) -> TcpRead {
        loop {
            let step = {
                let sock = self.sock.borrow();
                let Some(ChannelSocket::Tcp(stream)) = sock.as_ref() else {
                    return TcpRead::Blocked;
                };
                let mut tcp_io = self.tcp_io.borrow_mut();
                read_step(stream, &mut tcp_io)
            };
            match step {
                Ok(Some(frame)) => return TcpRead::Frame(frame),
                Ok(None) => continue,
                Err(ReadStep::Blocked) => return TcpRead::Blocked,
                Err(ReadStep::Eof) => {
                    debug!("closing TCP channel due to EOF");
                    return TcpRead::Reset;
                }
                Err(ReadStep::ShortPrefix(size)) => {
                    error!("got truncated size: {} on TCP read", size);
                    return TcpRead::Reset;
                }
                Err(ReadStep::Io(e)) => {
                    debug!("closing TCP channel due to IO error: {}", e);
                    return TcpRead::Reset;
                }
            }
        }
    }

    /// Resets a TCP channel: cancels its events, closes the socket, drops
    /// queued output and partial-read state.
    ///
    /// Pending requests stay in the table and finish through their own
    /// timers.
    pub(crate) fn reset(&self, el: &Rc<dyn EventLoop>) {
        if let Some(ev) = self.read_ev.take() {
            el.del_read(ev);
        }
        if let Some(ev) = self.write_ev.take() {
            el.del_write(ev);
        }
        *self.sock.borrow_mut() = None;
        let mut tcp_io = self.tcp_io.borrow_mut();
        tcp_io.out.clear();
        tcp_io.cur_read = 0;
        tcp_io.next_read_size = 0;
        self.connected.set(false);
        self.connecting.set(false);
    }

    /// Closes the channel for good at resolver teardown.
    pub(crate) fn close(&self, el: &Rc<dyn EventLoop>) {
        self.reset(el);
        self.active.set(false);
        self.pending.borrow_mut().clear();
    }
}

impl Drop for IoChannel {
    fn drop(&mut self) {
        // A rotated-out channel that drained its last request unregisters
        // itself here.
        if let Some(resolver) = self.resolver.upgrade() {
            if let Some(el) = resolver.event_loop() {
                if let Some(ev) = self.read_ev.take() {
                    el.del_read(ev);
                }
                if let Some(ev) = self.write_ev.take() {
                    el.del_write(ev);
                }
            }
        }
    }
}

//------------ Socket helpers ------------------------------------------------

/// Writes the unsent part of a frame with a single vectored write.
fn write_frame(
    mut stream: &TcpStream,
    frame: &mut OutputFrame,
) -> io::Result<usize> {
    let written = frame.written;
    let n = if written < 2 {
        let iov = [
            IoSlice::new(&frame.prefix[written..]),
            IoSlice::new(&frame.body),
        ];
        stream.write_vectored(&iov)?
    } else {
        stream.write(&frame.body[written - 2..])?
    };
    frame.written += n;
    Ok(n)
}

/// Performs one read toward the current inbound frame.
///
/// Returns `Ok(Some(frame))` once a frame is complete and resets the
/// framing state, `Ok(None)` when progress was made but the frame is still
/// short.
fn read_step(
    mut stream: &TcpStream,
    tcp_io: &mut TcpIo,
) -> Result<Option<Bytes>, ReadStep> {
    if tcp_io.cur_read < 2 {
        let start = tcp_io.cur_read;
        let n = map_read(stream.read(&mut tcp_io.len_buf[start..]))?;
        tcp_io.cur_read += n;
        if tcp_io.cur_read < 2 {
            return Ok(None);
        }
        let size = u16::from_be_bytes(tcp_io.len_buf) as usize;
        if size < HEADER_SIZE {
            return Err(ReadStep::ShortPrefix(size));
        }
        tcp_io.next_read_size = size;
        if tcp_io.read_buf.len() < size {
            let grown = (tcp_io.read_buf.len() * 2).clamp(size, MAX_READ_BUF);
            tcp_io.read_buf.resize(grown, 0);
        }
        return Ok(None);
    }

    let have = tcp_io.cur_read - 2;
    let want = tcp_io.next_read_size - have;
    let n = map_read(stream.read(&mut tcp_io.read_buf[have..have + want]))?;
    tcp_io.cur_read += n;
    if tcp_io.cur_read - 2 == tcp_io.next_read_size {
        let frame =
            Bytes::copy_from_slice(&tcp_io.read_buf[..tcp_io.next_read_size]);
        tcp_io.cur_read = 0;
        tcp_io.next_read_size = 0;
        return Ok(Some(frame));
    }
    Ok(None)
}

/// Classifies the result of a read syscall.
fn map_read(res: io::Result<usize>) -> Result<usize, ReadStep> {
    match res {
        Ok(0) => Err(ReadStep::Eof),
        Ok(n) => Ok(n),
        Err(e) if would_block(&e) => Err(ReadStep::Blocked),
        Err(e) => Err(ReadStep::Io(e)),
    }
}

/// Creates a non-blocking UDP socket bound to the unspecified address of
/// the peer's family.
fn udp_socket(peer: SocketAddr) -> io::Result<UdpSocket> {
    let domain = match peer {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_nonblocking(true)?;
    let bind: SocketAddr = match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    sock.bind(&bind.into())?;
    Ok(sock.into())
}

/// Creates a non-blocking TCP socket with a connect in flight.
fn tcp_socket(peer: SocketAddr) -> io::Result<TcpStream> {
    let domain = match peer {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    sock.set_nonblocking(true)?;
    match sock.connect(&peer.into()) {
        Ok(()) => {}
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Err(e),
    }
    Ok(sock.into())
}

/// EAGAIN and EINTR: transient conditions retried through the event loop.
pub(crate) fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// A non-blocking connect reports completion through write readiness.
fn connect_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || would_block(e)
}
