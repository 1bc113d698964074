/*! Collaborators on the test agents.

The driver does not talk to hosts itself. It goes through three
services, each a trait so that a remote procedure call transport, a local
implementation or an in-memory network can stand behind it:

 - [SocketApi] runs Berkeley socket calls on one agent;
 - [PacketEngine] crafts and captures individual TCP segments;
 - [NetConfig] edits ARP tables, routes and forwarding.

[RstInjector] is the narrow slice of a packet engine that a kernel-socket
peer needs to reset a connection in TIME_WAIT.

All failures are reported as [std::io::Error]. Socket calls keep the
errno, which callers compare against `libc` constants.

[SocketApi]: trait.SocketApi.html
[PacketEngine]: trait.PacketEngine.html
[NetConfig]: trait.NetConfig.html
[RstInjector]: trait.RstInjector.html
*/

use core::fmt;
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr};

use crate::time::Duration;
use crate::wire::{EthernetAddress, Segment, SeqNumber};

#[cfg(feature = "sys-linux")]
pub mod sys;

/// A socket descriptor on an agent.
pub type Fd = i32;

/// Address family of a socket or a forwarding switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Family {
        match addr {
            IpAddr::V4(_) => Family::Ipv4,
            IpAddr::V6(_) => Family::Ipv6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Family::Ipv4 => write!(f, "ipv4"),
            Family::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// Socket calls executed on one agent.
///
/// `connect`, `accept` and `recv` follow non-blocking semantics: a call
/// that cannot complete yet fails with `EINPROGRESS`, `EALREADY` or
/// `EAGAIN` rather than blocking.
pub trait SocketApi {
    /// Name of the agent the calls run on.
    fn agent(&self) -> &str;

    /// Create a TCP socket.
    fn socket(&mut self, family: Family) -> io::Result<Fd>;

    fn bind(&mut self, fd: Fd, addr: SocketAddr) -> io::Result<()>;

    /// Toggle `O_NONBLOCK` with `fcntl`.
    fn set_nonblocking(&mut self, fd: Fd, nonblocking: bool) -> io::Result<()>;

    fn set_reuse_addr(&mut self, fd: Fd, reuse: bool) -> io::Result<()>;

    /// Set `SO_LINGER`. `Some(Duration::ZERO)` makes `close` abort the
    /// connection with RST.
    fn set_linger(&mut self, fd: Fd, linger: Option<Duration>) -> io::Result<()>;

    fn connect(&mut self, fd: Fd, addr: SocketAddr) -> io::Result<()>;

    fn listen(&mut self, fd: Fd, backlog: i32) -> io::Result<()>;

    fn accept(&mut self, fd: Fd) -> io::Result<Fd>;

    fn shutdown(&mut self, fd: Fd, how: Shutdown) -> io::Result<()>;

    fn close(&mut self, fd: Fd) -> io::Result<()>;

    /// `recv` with `MSG_DONTWAIT`. `Ok(0)` means the remote side sent FIN.
    fn recv(&mut self, fd: Fd, buf: &mut [u8]) -> io::Result<usize>;

    /// The `tcpi_state` field of `getsockopt(TCP_INFO)`.
    fn tcp_info_state(&mut self, fd: Fd) -> io::Result<u8>;

    /// Restart the process serving the calls, dropping all its sockets.
    fn restart(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "agent cannot be restarted",
        ))
    }
}

/// A handle, identifying a half-connection in a packet engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConnHandle(pub usize);

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a crafted half-connection lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnSpec {
    pub agent: String,
    pub interface: String,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub local_link: EthernetAddress,
    /// Next hop towards `remote`: the IUT itself or the gateway.
    pub remote_link: EthernetAddress,
}

/// A user-space TCP segment sender and sniffer.
pub trait PacketEngine {
    /// Bind a half-connection to the addresses in `spec`. No segment is
    /// sent.
    fn create(&mut self, spec: &ConnSpec) -> io::Result<ConnHandle>;

    /// Send one segment. Ports come from the connection, not from
    /// `segment`.
    fn send(&mut self, conn: ConnHandle, segment: &Segment) -> io::Result<()>;

    /// Next segment received from the remote side, waiting at most
    /// `timeout`. Fails with `TimedOut` if none arrives.
    fn recv(&mut self, conn: ConnHandle, timeout: Duration) -> io::Result<Segment>;

    fn destroy(&mut self, conn: ConnHandle) -> io::Result<()>;
}

/// Sequence numbers of a SYN-ACK the peer kernel sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaughtSynAck {
    pub seq_number: SeqNumber,
    pub ack_number: SeqNumber,
}

/// Raw RST injection on behalf of a kernel socket.
pub trait RstInjector {
    /// Start watching for the first SYN-ACK sent from `local` to `remote`.
    fn arm(&mut self, local: SocketAddr, remote: SocketAddr) -> io::Result<()>;

    /// The SYN-ACK seen since `arm`.
    fn catch(&mut self) -> io::Result<CaughtSynAck>;

    /// Send RST from `local` to `remote` with the given numbers.
    fn send(&mut self, seq_number: SeqNumber, ack_number: SeqNumber) -> io::Result<()>;

    fn disarm(&mut self) -> io::Result<()>;
}

/// Host network configuration on the agents.
pub trait NetConfig {
    /// Install a static ARP entry.
    fn add_arp(
        &mut self,
        agent: &str,
        interface: &str,
        addr: IpAddr,
        link_addr: EthernetAddress,
    ) -> io::Result<()>;

    fn del_arp(&mut self, agent: &str, interface: &str, addr: IpAddr) -> io::Result<()>;

    /// Route `dst` (host route) via `gateway`.
    fn add_route(&mut self, agent: &str, dst: IpAddr, gateway: IpAddr) -> io::Result<()>;

    fn del_route(&mut self, agent: &str, dst: IpAddr, gateway: IpAddr) -> io::Result<()>;

    fn forwarding(&mut self, agent: &str, family: Family) -> io::Result<bool>;

    fn set_forwarding(&mut self, agent: &str, family: Family, enabled: bool) -> io::Result<()>;

    /// Hardware address of an interface.
    fn link_addr(&mut self, agent: &str, interface: &str) -> io::Result<EthernetAddress>;
}

/// Whether an error carries the given errno.
pub(crate) fn is_errno(err: &io::Error, errno: i32) -> bool {
    err.raw_os_error() == Some(errno)
}

/// `EAGAIN`, `EWOULDBLOCK` or the portable `WouldBlock` kind.
pub(crate) fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || is_errno(err, libc::EAGAIN)
        || is_errno(err, libc::EWOULDBLOCK)
}

/// A non-blocking connect that has not finished yet.
pub(crate) fn connect_pending(err: &io::Error) -> bool {
    is_errno(err, libc::EINPROGRESS) || is_errno(err, libc::EALREADY)
}
