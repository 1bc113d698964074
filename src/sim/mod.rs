/*! An in-memory test network.

A [Network] is a handful of simulated hosts on one or two Ethernet
links, each with its own ARP table, routes, forwarding switch and a
small TCP. It implements every agent service a session needs, all on a
virtual clock, so a whole path can be driven in a unit test without real
hosts and without waiting for real retransmission timers.

Two topologies are provided:

 - [direct](struct.Network.html#method.direct): the IUT host `iut` and
   the peer host `tst` share one link;
 - [with_gateway](struct.Network.html#method.with_gateway): `iut` and
   `tst` sit on two different links, with the router `gw` between them.
   Nothing routes through `gw` until a session configures it.

Frames are delivered immediately. A frame addressed to a link address
no interface owns is lost, but still seen by the packet engine, the way
a sniffer on a shared segment would see it.

Faults can be injected with [fail_next](struct.Network.html#method.fail_next)
to exercise the error paths of session setup.

[Network]: struct.Network.html
*/

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;

use crate::agent::{ConnSpec, NetConfig, PacketEngine, RstInjector, SocketApi};
use crate::classify::PacketTally;
use crate::endpoint::{Endpoint, Gateway};
use crate::time::{Clock, Instant};
use crate::wire::{EthernetAddress, Segment, TcpFlags};

mod kernel;
mod services;

use self::kernel::{Kernel, Outgoing};
use self::services::{SimClock, SimEngine, SimInjector, SimNetConfig, SimSockets};

pub use self::kernel::TIME_WAIT_LEN;

/// Agent name of the host the IUT runs on.
pub const IUT: &str = "iut";
/// Agent name of the peer host.
pub const PEER: &str = "tst";
/// Agent name of the router.
pub const GATEWAY: &str = "gw";

/// A setup step that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Socket,
    Bind,
    Listen,
    CreateCsap,
    ArmInjector,
    AddArp,
    AddRoute,
    SetForwarding,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Fault::Socket => write!(f, "socket"),
            Fault::Bind => write!(f, "bind"),
            Fault::Listen => write!(f, "listen"),
            Fault::CreateCsap => write!(f, "create CSAP"),
            Fault::ArmInjector => write!(f, "arm injector"),
            Fault::AddArp => write!(f, "add ARP entry"),
            Fault::AddRoute => write!(f, "add route"),
            Fault::SetForwarding => write!(f, "set forwarding"),
        }
    }
}

/// A static ARP entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpEntry {
    pub interface: String,
    pub addr: IpAddr,
    pub link_addr: EthernetAddress,
}

/// A host route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub dst: IpAddr,
    pub via: IpAddr,
}

#[derive(Debug)]
struct Interface {
    name: String,
    addr: IpAddr,
    link_addr: EthernetAddress,
    link: usize,
}

#[derive(Debug)]
struct Host {
    name: String,
    interfaces: Vec<Interface>,
    arp: Vec<ArpEntry>,
    routes: Vec<Route>,
    forwarding: bool,
    kernel: Kernel,
}

impl Host {
    fn new(name: &str, isn_seed: u32) -> Host {
        Host {
            name: name.to_owned(),
            interfaces: Vec::new(),
            arp: Vec::new(),
            routes: Vec::new(),
            forwarding: false,
            kernel: Kernel::new(name, isn_seed),
        }
    }

    fn interface(mut self, name: &str, addr: Ipv4Addr, link_addr: [u8; 6], link: usize) -> Host {
        self.interfaces.push(Interface {
            name: name.to_owned(),
            addr: IpAddr::V4(addr),
            link_addr: EthernetAddress(link_addr),
            link,
        });
        self
    }

    fn owns(&self, addr: IpAddr) -> bool {
        self.interfaces.iter().any(|iface| iface.addr == addr)
    }
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    link: usize,
    src_link: EthernetAddress,
    dst_link: EthernetAddress,
    src: SocketAddr,
    dst: SocketAddr,
    segment: Segment,
}

/// A packet engine half-connection.
#[derive(Debug)]
struct Sniffer {
    spec: ConnSpec,
    link: usize,
    inbox: VecDeque<Segment>,
}

/// An armed RST injector.
#[derive(Debug)]
struct Watch {
    local: SocketAddr,
    remote: SocketAddr,
    caught: Option<Frame>,
}

#[derive(Debug)]
struct World {
    now: Instant,
    hosts: Vec<Host>,
    wire: VecDeque<Frame>,
    sniffers: Vec<Option<Sniffer>>,
    watches: Vec<Option<Watch>>,
    faults: Vec<(String, Fault)>,
    /// Every segment a host, engine or injector originated.
    emitted: Vec<(SocketAddr, TcpFlags)>,
}

fn no_such(what: &str, name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no {} {}", what, name))
}

impl World {
    fn new(hosts: Vec<Host>) -> World {
        World {
            now: Instant::ZERO,
            hosts,
            wire: VecDeque::new(),
            sniffers: Vec::new(),
            watches: Vec::new(),
            faults: Vec::new(),
            emitted: Vec::new(),
        }
    }

    fn host_index(&self, agent: &str) -> io::Result<usize> {
        self.hosts
            .iter()
            .position(|host| host.name == agent)
            .ok_or_else(|| no_such("agent", agent))
    }

    fn host_mut(&mut self, agent: &str) -> io::Result<&mut Host> {
        let index = self.host_index(agent)?;
        Ok(&mut self.hosts[index])
    }

    /// Fail with the injected fault, if one is pending for this step.
    fn check_fault(&mut self, agent: &str, fault: Fault) -> io::Result<()> {
        match self
            .faults
            .iter()
            .position(|(name, f)| name == agent && *f == fault)
        {
            Some(index) => {
                self.faults.remove(index);
                net_debug!("sim: injected {} failure on {}", fault, agent);
                Err(io::Error::other(format!("injected {} failure", fault)))
            }
            None => Ok(()),
        }
    }

    fn link_addr_on(&self, link: usize, addr: IpAddr) -> Option<EthernetAddress> {
        self.hosts
            .iter()
            .flat_map(|host| host.interfaces.iter())
            .find(|iface| iface.link == link && iface.addr == addr)
            .map(|iface| iface.link_addr)
    }

    /// Send a segment out of `host`, routing and resolving the next hop
    /// the way its tables say.
    fn transmit(&mut self, host: usize, src: SocketAddr, dst: SocketAddr, segment: Segment) {
        let frame = {
            let sender = &self.hosts[host];
            let next_hop = sender
                .routes
                .iter()
                .find(|route| route.dst == dst.ip())
                .map_or(dst.ip(), |route| route.via);
            let Some(iface) = sender
                .interfaces
                .iter()
                .find(|iface| self.link_addr_on(iface.link, next_hop).is_some())
            else {
                net_trace!("sim: {} has no route to {}", sender.name, dst);
                return;
            };
            let static_entry = sender
                .arp
                .iter()
                .find(|entry| entry.interface == iface.name && entry.addr == next_hop)
                .map(|entry| entry.link_addr);
            let Some(dst_link) = static_entry.or_else(|| self.link_addr_on(iface.link, next_hop))
            else {
                return;
            };
            Frame {
                link: iface.link,
                src_link: iface.link_addr,
                dst_link,
                src,
                dst,
                segment,
            }
        };
        self.wire.push_back(frame);
    }

    fn emit(&mut self, host: usize, out: Vec<Outgoing>) {
        for outgoing in out {
            self.emitted.push((outgoing.src, outgoing.segment.flags));
            self.transmit(host, outgoing.src, outgoing.dst, outgoing.segment);
        }
    }

    fn sniff(&mut self, frame: &Frame) {
        for sniffer in self.sniffers.iter_mut().flatten() {
            if sniffer.link == frame.link
                && sniffer.spec.remote == frame.src
                && sniffer.spec.local == frame.dst
            {
                sniffer.inbox.push_back(frame.segment);
            }
        }
        for watch in self.watches.iter_mut().flatten() {
            if watch.caught.is_none()
                && watch.local == frame.src
                && watch.remote == frame.dst
                && frame.segment.flags == TcpFlags::SYN | TcpFlags::ACK
            {
                watch.caught = Some(*frame);
            }
        }
    }

    /// Deliver frames until the wire is quiet.
    fn pump(&mut self) {
        while let Some(frame) = self.wire.pop_front() {
            self.sniff(&frame);
            let receiver = self.hosts.iter().position(|host| {
                host.interfaces
                    .iter()
                    .any(|iface| iface.link == frame.link && iface.link_addr == frame.dst_link)
            });
            let Some(host) = receiver else {
                net_trace!(
                    "sim: {} -> {} to {} lost",
                    frame.src,
                    frame.dst,
                    frame.dst_link
                );
                continue;
            };
            if self.hosts[host].owns(frame.dst.ip()) {
                let mut out = Vec::new();
                let now = self.now;
                self.hosts[host]
                    .kernel
                    .input(now, frame.src, frame.dst, &frame.segment, &mut out);
                self.emit(host, out);
            } else if self.hosts[host].forwarding {
                self.transmit(host, frame.src, frame.dst, frame.segment);
            }
        }
    }

    /// Run a kernel call on `host` and deliver whatever it sends.
    fn with_kernel<T, F>(&mut self, host: usize, f: F) -> T
    where
        F: FnOnce(&mut Kernel, Instant, &mut Vec<Outgoing>) -> T,
    {
        let mut out = Vec::new();
        let now = self.now;
        let result = f(&mut self.hosts[host].kernel, now, &mut out);
        self.emit(host, out);
        self.pump();
        result
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.hosts
            .iter()
            .filter_map(|host| host.kernel.next_deadline())
            .min()
    }

    /// Move the clock to `until`, firing every timer due on the way.
    fn advance_to(&mut self, until: Instant) {
        while let Some(deadline) = self.next_deadline().filter(|t| *t <= until) {
            if deadline > self.now {
                self.now = deadline;
            }
            for host in 0..self.hosts.len() {
                self.with_kernel(host, |kernel, now, out| kernel.poll(now, out));
            }
        }
        if until > self.now {
            self.now = until;
        }
    }

    /// Put a frame on `link` as if a raw socket on `agent` sent it.
    fn inject(&mut self, frame: Frame) {
        self.emitted.push((frame.src, frame.segment.flags));
        self.wire.push_back(frame);
        self.pump();
    }
}

/// A simulated network. Clones share the same network.
#[derive(Debug, Clone)]
pub struct Network {
    world: Rc<RefCell<World>>,
}

const IUT_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
const PEER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
const GW_IUT_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0xfe];
const GW_PEER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x01, 0xfe];

impl Network {
    fn from_hosts(hosts: Vec<Host>) -> Network {
        Network {
            world: Rc::new(RefCell::new(World::new(hosts))),
        }
    }

    /// `iut` 10.0.0.1 and `tst` 10.0.0.2 on one link.
    pub fn direct() -> Network {
        Network::from_hosts(vec![
            Host::new(IUT, 0x1000_0000).interface("eth0", Ipv4Addr::new(10, 0, 0, 1), IUT_MAC, 0),
            Host::new(PEER, 0x5000_0000).interface("eth0", Ipv4Addr::new(10, 0, 0, 2), PEER_MAC, 0),
        ])
    }

    /// `iut` 10.0.0.1 and `gw` 10.0.0.254 on one link, `gw` 10.0.1.254 and
    /// `tst` 10.0.1.2 on another.
    pub fn with_gateway() -> Network {
        Network::from_hosts(vec![
            Host::new(IUT, 0x1000_0000).interface("eth0", Ipv4Addr::new(10, 0, 0, 1), IUT_MAC, 0),
            Host::new(GATEWAY, 0x3000_0000)
                .interface("eth0", Ipv4Addr::new(10, 0, 0, 254), GW_IUT_MAC, 0)
                .interface("eth1", Ipv4Addr::new(10, 0, 1, 254), GW_PEER_MAC, 1),
            Host::new(PEER, 0x5000_0000).interface("eth0", Ipv4Addr::new(10, 0, 1, 2), PEER_MAC, 1),
        ])
    }

    /// The first interface of `agent`, with `port`.
    pub fn endpoint(&self, agent: &str, port: u16) -> Option<Endpoint> {
        self.interface_endpoint(agent, 0, port)
    }

    fn interface_endpoint(&self, agent: &str, index: usize, port: u16) -> Option<Endpoint> {
        let world = self.world.borrow();
        let host = world.hosts.iter().find(|host| host.name == agent)?;
        let iface = host.interfaces.get(index)?;
        Some(Endpoint::new(
            agent,
            iface.name.clone(),
            SocketAddr::new(iface.addr, port),
            iface.link_addr,
        ))
    }

    /// The router, in the gateway topology.
    pub fn gateway(&self) -> Option<Gateway> {
        Some(Gateway::new(
            self.interface_endpoint(GATEWAY, 0, 0)?,
            self.interface_endpoint(GATEWAY, 1, 0)?,
        ))
    }

    pub fn sockets(&self, agent: &str) -> Box<dyn SocketApi> {
        Box::new(SimSockets::new(self.world.clone(), agent))
    }

    pub fn packet_engine(&self) -> Box<dyn PacketEngine> {
        Box::new(SimEngine::new(self.world.clone()))
    }

    pub fn rst_injector(&self, agent: &str) -> Box<dyn RstInjector> {
        Box::new(SimInjector::new(self.world.clone(), agent))
    }

    pub fn netconf(&self) -> Box<dyn NetConfig> {
        Box::new(SimNetConfig::new(self.world.clone()))
    }

    pub fn clock(&self) -> Rc<dyn Clock> {
        Rc::new(SimClock::new(self.world.clone()))
    }

    pub fn now(&self) -> Instant {
        self.world.borrow().now
    }

    /// Make the next `fault` step on `agent` fail.
    pub fn fail_next(&self, agent: &str, fault: Fault) {
        self.world.borrow_mut().faults.push((agent.to_owned(), fault));
    }

    /// Faults injected but not hit yet.
    pub fn pending_faults(&self) -> usize {
        self.world.borrow().faults.len()
    }

    pub fn arp_entries(&self, agent: &str) -> Vec<ArpEntry> {
        let world = self.world.borrow();
        world
            .hosts
            .iter()
            .find(|host| host.name == agent)
            .map_or_else(Vec::new, |host| host.arp.clone())
    }

    pub fn routes(&self, agent: &str) -> Vec<Route> {
        let world = self.world.borrow();
        world
            .hosts
            .iter()
            .find(|host| host.name == agent)
            .map_or_else(Vec::new, |host| host.routes.clone())
    }

    pub fn forwarding(&self, agent: &str) -> bool {
        let world = self.world.borrow();
        world
            .hosts
            .iter()
            .any(|host| host.name == agent && host.forwarding)
    }

    /// Configure `agent` by hand, as an administrator would have before a
    /// session starts.
    pub fn add_route(&self, agent: &str, dst: IpAddr, via: IpAddr) -> io::Result<()> {
        self.world.borrow_mut().host_mut(agent)?.routes.push(Route { dst, via });
        Ok(())
    }

    pub fn set_forwarding(&self, agent: &str, enabled: bool) -> io::Result<()> {
        self.world.borrow_mut().host_mut(agent)?.forwarding = enabled;
        Ok(())
    }

    /// Descriptors open on `agent`.
    pub fn open_fds(&self, agent: &str) -> usize {
        let world = self.world.borrow();
        world
            .hosts
            .iter()
            .find(|host| host.name == agent)
            .map_or(0, |host| host.kernel.open_fds())
    }

    /// Sockets alive on `agent`, including ones without a descriptor.
    pub fn socket_count(&self, agent: &str) -> usize {
        let world = self.world.borrow();
        world
            .hosts
            .iter()
            .find(|host| host.name == agent)
            .map_or(0, |host| host.kernel.socket_count())
    }

    /// Packet engine connections not destroyed yet.
    pub fn csap_count(&self) -> usize {
        self.world.borrow().sniffers.iter().flatten().count()
    }

    /// RST injectors armed and not disarmed yet.
    pub fn armed_injectors(&self) -> usize {
        self.world.borrow().watches.iter().flatten().count()
    }

    /// Segments originated from `addr` since the last
    /// [clear_capture](#method.clear_capture), by flag set.
    pub fn tally(&self, addr: IpAddr) -> PacketTally {
        let tally = PacketTally::new();
        for (src, flags) in &self.world.borrow().emitted {
            if src.ip() == addr {
                tally.record_flags(*flags);
            }
        }
        tally
    }

    pub fn clear_capture(&self) {
        self.world.borrow_mut().emitted.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::agent::Family;
    use crate::time::Duration;
    use std::net::Shutdown;

    #[test]
    fn test_direct_handshake_over_the_wire() {
        let net = Network::direct();
        let iut = net.endpoint(IUT, 5000).unwrap();
        let peer = net.endpoint(PEER, 6000).unwrap();
        let mut server = net.sockets(PEER);
        let mut client = net.sockets(IUT);

        let listener = server.socket(Family::Ipv4).unwrap();
        server.bind(listener, peer.addr).unwrap();
        server.listen(listener, 1).unwrap();

        let fd = client.socket(Family::Ipv4).unwrap();
        client.bind(fd, iut.addr).unwrap();
        let err = client.connect(fd, peer.addr).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINPROGRESS));
        client.connect(fd, peer.addr).unwrap();
        assert_eq!(client.tcp_info_state(fd).unwrap(), 1);

        let accepted = server.accept(listener).unwrap();
        assert_eq!(server.tcp_info_state(accepted).unwrap(), 1);

        let tally = net.tally(iut.ip());
        assert_eq!(tally.total(), 2);
        assert_eq!(net.tally(peer.ip()).total(), 1);
    }

    #[test]
    fn test_alien_arp_entry_black_holes() {
        let net = Network::direct();
        let iut = net.endpoint(IUT, 5000).unwrap();
        let peer = net.endpoint(PEER, 6000).unwrap();
        let mut netconf = net.netconf();
        netconf
            .add_arp(IUT, "eth0", peer.ip(), EthernetAddress([2, 0, 0, 0, 0x11, 0x11]))
            .unwrap();

        let mut server = net.sockets(PEER);
        let listener = server.socket(Family::Ipv4).unwrap();
        server.bind(listener, peer.addr).unwrap();
        server.listen(listener, 1).unwrap();
        let mut client = net.sockets(IUT);
        let fd = client.socket(Family::Ipv4).unwrap();
        client.bind(fd, iut.addr).unwrap();
        assert!(client.connect(fd, peer.addr).is_err());

        net.clock().sleep(Duration::from_secs(5));
        assert_eq!(client.tcp_info_state(fd).unwrap(), 2);
        assert_eq!(net.tally(peer.ip()).total(), 0);

        netconf.del_arp(IUT, "eth0", peer.ip()).unwrap();
        net.clock().sleep(Duration::from_secs(4));
        assert_eq!(client.tcp_info_state(fd).unwrap(), 1);
    }

    #[test]
    fn test_gateway_forwards_only_when_enabled() {
        let net = Network::with_gateway();
        let iut = net.endpoint(IUT, 5000).unwrap();
        let peer = net.endpoint(PEER, 6000).unwrap();
        let gw = net.gateway().unwrap();
        net.add_route(IUT, peer.ip(), gw.iut_side.ip()).unwrap();
        net.add_route(PEER, iut.ip(), gw.peer_side.ip()).unwrap();

        let mut server = net.sockets(PEER);
        let listener = server.socket(Family::Ipv4).unwrap();
        server.bind(listener, peer.addr).unwrap();
        server.listen(listener, 1).unwrap();
        let mut client = net.sockets(IUT);
        let fd = client.socket(Family::Ipv4).unwrap();
        client.bind(fd, iut.addr).unwrap();
        assert!(client.connect(fd, peer.addr).is_err());
        assert_eq!(client.tcp_info_state(fd).unwrap(), 2);

        net.set_forwarding(GATEWAY, true).unwrap();
        net.clock().sleep(Duration::from_secs(2));
        assert_eq!(client.tcp_info_state(fd).unwrap(), 1);

        client.shutdown(fd, Shutdown::Write).unwrap();
        assert_eq!(client.tcp_info_state(fd).unwrap(), 5);
    }

    #[test]
    fn test_engine_sees_lost_frames() {
        let net = Network::direct();
        let iut = net.endpoint(IUT, 5000).unwrap();
        let peer = net.endpoint(PEER, 6000).unwrap();
        let alien = EthernetAddress([2, 0, 0, 0, 0x11, 0x11]);
        net.netconf().add_arp(IUT, "eth0", peer.ip(), alien).unwrap();

        let mut engine = net.packet_engine();
        let conn = engine
            .create(&ConnSpec {
                agent: PEER.into(),
                interface: "eth0".into(),
                local: peer.addr,
                remote: iut.addr,
                local_link: peer.link_addr,
                remote_link: iut.link_addr,
            })
            .unwrap();
        let mut client = net.sockets(IUT);
        let fd = client.socket(Family::Ipv4).unwrap();
        client.bind(fd, iut.addr).unwrap();
        assert!(client.connect(fd, peer.addr).is_err());

        let syn = engine.recv(conn, Duration::ZERO).unwrap();
        assert_eq!(syn.flags, TcpFlags::SYN);
        let start = net.now();
        let again = engine.recv(conn, Duration::from_secs(10)).unwrap();
        assert_eq!(again.seq_number, syn.seq_number);
        assert_eq!(net.now() - start, Duration::from_secs(1));

        let err = engine.recv(conn, Duration::from_millis(500)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        engine.destroy(conn).unwrap();
        assert_eq!(net.csap_count(), 0);
    }

    #[test]
    fn test_fault_fires_once() {
        let net = Network::direct();
        net.fail_next(IUT, Fault::Socket);
        let mut api = net.sockets(IUT);
        assert!(api.socket(Family::Ipv4).is_err());
        assert!(api.socket(Family::Ipv4).is_ok());
        assert_eq!(net.pending_faults(), 0);
    }
}
