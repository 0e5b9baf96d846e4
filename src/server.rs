//! Upstream server records.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use crate::channel::IoChannel;
use crate::error::Error;
use rand::{thread_rng, Rng};
use std::cell::{Cell, RefCell};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

/// Default number of TCP channels per server.
const DEF_TCP_CHANNELS: usize = 1;

//------------ UpstreamServer ------------------------------------------------

/// One configured upstream name server.
///
/// A server owns a fixed fan-out of UDP channels and TCP channels, all
/// created by [`Resolver::init`]. New requests land on a random UDP
/// channel; TCP channels only carry requests whose UDP reply came back
/// truncated.
///
/// [`Resolver::init`]: crate::resolver::Resolver::init
pub struct UpstreamServer {
    /// The server's address as given, an IP literal.
    name: String,

    /// The peer socket address.
    addr: SocketAddr,

    /// Selection priority; higher sorts first in the built-in rotation.
    priority: u32,

    /// Number of UDP channels to open at init.
    io_cnt: usize,

    /// Number of TCP channels to open at init.
    tcp_cnt: Cell<usize>,

    /// The UDP channels.
    udp_channels: RefCell<Vec<Rc<IoChannel>>>,

    /// The TCP channels.
    tcp_channels: RefCell<Vec<Rc<IoChannel>>>,
}

impl UpstreamServer {
    /// Creates a server record; channels are opened later at init.
    pub(crate) fn new(
        name: &str,
        port: u16,
        priority: u32,
        io_cnt: usize,
    ) -> Result<Self, Error> {
        let ip: IpAddr =
            name.parse().map_err(|_| Error::InvalidServerAddress)?;
        if port == 0 || io_cnt == 0 {
            return Err(Error::InvalidServerArguments);
        }
        Ok(UpstreamServer {
            name: name.into(),
            addr: SocketAddr::new(ip, port),
            priority,
            io_cnt,
            tcp_cnt: Cell::new(DEF_TCP_CHANNELS),
            udp_channels: RefCell::new(Vec::new()),
            tcp_channels: RefCell::new(Vec::new()),
        })
    }

    /// The server's name, an IP literal.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The peer socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The selection priority.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Sets the TCP channel count, effective at the next resolver init.
    ///
    /// A server may run with zero TCP channels; truncated UDP replies are
    /// then delivered as-is instead of being retried over TCP.
    pub fn set_tcp_channel_count(&self, count: usize) {
        self.tcp_cnt.set(count);
    }

    /// Number of UDP channels to open.
    pub(crate) fn io_cnt(&self) -> usize {
        self.io_cnt
    }

    /// Number of TCP channels to open.
    pub(crate) fn tcp_cnt(&self) -> usize {
        self.tcp_cnt.get()
    }

    /// Installs the channel arrays at init.
    pub(crate) fn install_channels(
        &self,
        udp: Vec<Rc<IoChannel>>,
        tcp: Vec<Rc<IoChannel>>,
    ) {
        *self.udp_channels.borrow_mut() = udp;
        *self.tcp_channels.borrow_mut() = tcp;
    }

    /// Picks a UDP channel uniformly at random.
    pub(crate) fn random_udp_channel(&self) -> Option<Rc<IoChannel>> {
        let channels = self.udp_channels.borrow();
        if channels.is_empty() {
            return None;
        }
        let idx = thread_rng().gen_range(0..channels.len());
        Some(channels[idx].clone())
    }

    /// Picks a TCP channel uniformly at random.
    pub(crate) fn random_tcp_channel(&self) -> Option<Rc<IoChannel>> {
        let channels = self.tcp_channels.borrow();
        if channels.is_empty() {
            return None;
        }
        let idx = thread_rng().gen_range(0..channels.len());
        Some(channels[idx].clone())
    }

    /// The number of TCP channels currently installed.
    pub(crate) fn tcp_channel_count(&self) -> usize {
        self.tcp_channels.borrow().len()
    }

    /// The number of UDP channels currently installed.
    pub(crate) fn udp_channel_count(&self) -> usize {
        self.udp_channels.borrow().len()
    }

    /// The UDP channel at `idx`, if still installed.
    pub(crate) fn udp_channel_at(&self, idx: usize) -> Option<Rc<IoChannel>> {
        self.udp_channels.borrow().get(idx).cloned()
    }

    /// Replaces the UDP channel at `idx` with a fresh one.
    ///
    /// The old channel lives on through its in-flight requests until they
    /// drain.
    pub(crate) fn replace_udp_channel(
        &self,
        idx: usize,
        fresh: Rc<IoChannel>,
    ) {
        let mut channels = self.udp_channels.borrow_mut();
        if idx < channels.len() {
            channels[idx] = fresh;
        }
    }

    /// A snapshot of the TCP channels for periodic housekeeping.
    pub(crate) fn tcp_channels_snapshot(&self) -> Vec<Rc<IoChannel>> {
        self.tcp_channels.borrow().clone()
    }

    /// A snapshot of every channel, UDP and TCP.
    pub(crate) fn all_channels(&self) -> Vec<Rc<IoChannel>> {
        let mut all = self.udp_channels.borrow().clone();
        all.extend(self.tcp_channels.borrow().iter().cloned());
        all
    }
}

//============ Tests =========================================================
