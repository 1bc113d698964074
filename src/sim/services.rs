//! The agent services of a simulated network.

use std::cell::RefCell;
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::rc::Rc;

use super::kernel::{Kernel, Outgoing};
use super::{ArpEntry, Fault, Frame, Route, Sniffer, Watch, World, no_such};
use crate::agent::{
    CaughtSynAck, ConnHandle, ConnSpec, Family, Fd, NetConfig, PacketEngine, RstInjector,
    SocketApi,
};
use crate::time::{Clock, Duration, Instant};
use crate::wire::{EthernetAddress, Segment, SeqNumber, TcpFlags};

type Shared = Rc<RefCell<World>>;

/// Socket calls on one simulated host.
pub struct SimSockets {
    world: Shared,
    agent: String,
}

impl SimSockets {
    pub fn new(world: Shared, agent: &str) -> SimSockets {
        SimSockets {
            world,
            agent: agent.to_owned(),
        }
    }

    fn call<T, F>(&mut self, fault: Option<Fault>, f: F) -> io::Result<T>
    where
        F: FnOnce(&mut Kernel, Instant, &mut Vec<Outgoing>) -> io::Result<T>,
    {
        let mut world = self.world.borrow_mut();
        if let Some(fault) = fault {
            world.check_fault(&self.agent, fault)?;
        }
        let host = world.host_index(&self.agent)?;
        world.with_kernel(host, f)
    }
}

impl SocketApi for SimSockets {
    fn agent(&self) -> &str {
        &self.agent
    }

    fn socket(&mut self, _family: Family) -> io::Result<Fd> {
        self.call(Some(Fault::Socket), |kernel, _, _| Ok(kernel.socket()))
    }

    fn bind(&mut self, fd: Fd, addr: SocketAddr) -> io::Result<()> {
        self.call(Some(Fault::Bind), |kernel, _, _| kernel.bind(fd, addr))
    }

    fn set_nonblocking(&mut self, fd: Fd, _nonblocking: bool) -> io::Result<()> {
        self.call(None, |kernel, _, _| kernel.check_fd(fd))
    }

    fn set_reuse_addr(&mut self, fd: Fd, reuse: bool) -> io::Result<()> {
        self.call(None, |kernel, _, _| kernel.set_reuse_addr(fd, reuse))
    }

    fn set_linger(&mut self, fd: Fd, linger: Option<Duration>) -> io::Result<()> {
        self.call(None, |kernel, _, _| kernel.set_linger(fd, linger))
    }

    fn connect(&mut self, fd: Fd, addr: SocketAddr) -> io::Result<()> {
        self.call(None, |kernel, now, out| kernel.connect(fd, addr, now, out))
    }

    fn listen(&mut self, fd: Fd, backlog: i32) -> io::Result<()> {
        self.call(Some(Fault::Listen), |kernel, _, _| kernel.listen(fd, backlog))
    }

    fn accept(&mut self, fd: Fd) -> io::Result<Fd> {
        self.call(None, |kernel, _, _| kernel.accept(fd))
    }

    fn shutdown(&mut self, fd: Fd, how: Shutdown) -> io::Result<()> {
        self.call(None, |kernel, now, out| kernel.shutdown(fd, how, now, out))
    }

    fn close(&mut self, fd: Fd) -> io::Result<()> {
        self.call(None, |kernel, now, out| kernel.close(fd, now, out))
    }

    fn recv(&mut self, fd: Fd, _buf: &mut [u8]) -> io::Result<usize> {
        self.call(None, |kernel, _, _| kernel.recv(fd))
    }

    fn tcp_info_state(&mut self, fd: Fd) -> io::Result<u8> {
        self.call(None, |kernel, _, _| kernel.tcpi_state(fd))
    }

    fn restart(&mut self) -> io::Result<()> {
        net_debug!("sim: restarting {}", self.agent);
        self.call(None, |kernel, now, out| {
            kernel.close_all(now, out);
            Ok(())
        })
    }
}

/// Raw segments, sent and sniffed on the links of the network.
pub struct SimEngine {
    world: Shared,
}

impl SimEngine {
    pub fn new(world: Shared) -> SimEngine {
        SimEngine { world }
    }
}

fn no_conn(conn: ConnHandle) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no CSAP {}", conn))
}

impl PacketEngine for SimEngine {
    fn create(&mut self, spec: &ConnSpec) -> io::Result<ConnHandle> {
        let mut world = self.world.borrow_mut();
        world.check_fault(&spec.agent, Fault::CreateCsap)?;
        let host = world.host_index(&spec.agent)?;
        let link = world.hosts[host]
            .interfaces
            .iter()
            .find(|iface| iface.name == spec.interface)
            .map(|iface| iface.link)
            .ok_or_else(|| no_such("interface", &spec.interface))?;
        world.sniffers.push(Some(Sniffer {
            spec: spec.clone(),
            link,
            inbox: Default::default(),
        }));
        Ok(ConnHandle(world.sniffers.len() - 1))
    }

    fn send(&mut self, conn: ConnHandle, segment: &Segment) -> io::Result<()> {
        let mut world = self.world.borrow_mut();
        let sniffer = world
            .sniffers
            .get(conn.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| no_conn(conn))?;
        let frame = Frame {
            link: sniffer.link,
            src_link: sniffer.spec.local_link,
            dst_link: sniffer.spec.remote_link,
            src: sniffer.spec.local,
            dst: sniffer.spec.remote,
            segment: Segment {
                src_port: sniffer.spec.local.port(),
                dst_port: sniffer.spec.remote.port(),
                ..*segment
            },
        };
        world.inject(frame);
        Ok(())
    }

    fn recv(&mut self, conn: ConnHandle, timeout: Duration) -> io::Result<Segment> {
        let deadline = self.world.borrow().now + timeout;
        loop {
            let mut world = self.world.borrow_mut();
            let sniffer = world
                .sniffers
                .get_mut(conn.0)
                .and_then(Option::as_mut)
                .ok_or_else(|| no_conn(conn))?;
            if let Some(segment) = sniffer.inbox.pop_front() {
                return Ok(segment);
            }
            if world.now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "nothing captured"));
            }
            let next = world
                .next_deadline()
                .filter(|t| *t < deadline)
                .unwrap_or(deadline);
            world.advance_to(next);
        }
    }

    fn destroy(&mut self, conn: ConnHandle) -> io::Result<()> {
        let mut world = self.world.borrow_mut();
        world
            .sniffers
            .get_mut(conn.0)
            .and_then(Option::take)
            .map(|_| ())
            .ok_or_else(|| no_conn(conn))
    }
}

/// RST injection from a host's link.
pub struct SimInjector {
    world: Shared,
    agent: String,
    watch: Option<usize>,
}

impl SimInjector {
    pub fn new(world: Shared, agent: &str) -> SimInjector {
        SimInjector {
            world,
            agent: agent.to_owned(),
            watch: None,
        }
    }

    fn caught(&self) -> io::Result<(Frame, SocketAddr, SocketAddr)> {
        let world = self.world.borrow();
        let watch = self
            .watch
            .and_then(|index| world.watches.get(index))
            .and_then(Option::as_ref)
            .ok_or_else(|| io::Error::other("injector is not armed"))?;
        let frame = watch
            .caught
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no SYN-ACK seen"))?;
        Ok((frame, watch.local, watch.remote))
    }
}

impl RstInjector for SimInjector {
    fn arm(&mut self, local: SocketAddr, remote: SocketAddr) -> io::Result<()> {
        self.disarm()?;
        let mut world = self.world.borrow_mut();
        world.check_fault(&self.agent, Fault::ArmInjector)?;
        world.watches.push(Some(Watch {
            local,
            remote,
            caught: None,
        }));
        self.watch = Some(world.watches.len() - 1);
        Ok(())
    }

    fn catch(&mut self) -> io::Result<CaughtSynAck> {
        let (frame, _, _) = self.caught()?;
        Ok(CaughtSynAck {
            seq_number: frame.segment.seq_number,
            ack_number: frame.segment.ack_number,
        })
    }

    fn send(&mut self, seq_number: SeqNumber, ack_number: SeqNumber) -> io::Result<()> {
        let (caught, local, remote) = self.caught()?;
        let frame = Frame {
            src: local,
            dst: remote,
            segment: Segment {
                src_port: local.port(),
                dst_port: remote.port(),
                seq_number,
                ack_number,
                flags: TcpFlags::RST | TcpFlags::ACK,
                window_len: 0,
            },
            ..caught
        };
        net_debug!("sim: {} injects {}", self.agent, frame.segment);
        self.world.borrow_mut().inject(frame);
        Ok(())
    }

    fn disarm(&mut self) -> io::Result<()> {
        if let Some(index) = self.watch.take() {
            if let Some(slot) = self.world.borrow_mut().watches.get_mut(index) {
                *slot = None;
            }
        }
        Ok(())
    }
}

/// ARP, routing and forwarding on every host.
pub struct SimNetConfig {
    world: Shared,
}

impl SimNetConfig {
    pub fn new(world: Shared) -> SimNetConfig {
        SimNetConfig { world }
    }
}

impl NetConfig for SimNetConfig {
    fn add_arp(
        &mut self,
        agent: &str,
        interface: &str,
        addr: IpAddr,
        link_addr: EthernetAddress,
    ) -> io::Result<()> {
        let mut world = self.world.borrow_mut();
        world.check_fault(agent, Fault::AddArp)?;
        let host = world.host_mut(agent)?;
        if !host.interfaces.iter().any(|iface| iface.name == interface) {
            return Err(no_such("interface", interface));
        }
        host.arp
            .retain(|entry| !(entry.interface == interface && entry.addr == addr));
        host.arp.push(ArpEntry {
            interface: interface.to_owned(),
            addr,
            link_addr,
        });
        Ok(())
    }

    fn del_arp(&mut self, agent: &str, interface: &str, addr: IpAddr) -> io::Result<()> {
        let mut world = self.world.borrow_mut();
        let host = world.host_mut(agent)?;
        let before = host.arp.len();
        host.arp
            .retain(|entry| !(entry.interface == interface && entry.addr == addr));
        if host.arp.len() == before {
            return Err(no_such("ARP entry for", &addr.to_string()));
        }
        Ok(())
    }

    fn add_route(&mut self, agent: &str, dst: IpAddr, gateway: IpAddr) -> io::Result<()> {
        let mut world = self.world.borrow_mut();
        world.check_fault(agent, Fault::AddRoute)?;
        let host = world.host_mut(agent)?;
        if host.routes.iter().any(|route| route.dst == dst) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("route to {} exists", dst),
            ));
        }
        host.routes.push(Route { dst, via: gateway });
        Ok(())
    }

    fn del_route(&mut self, agent: &str, dst: IpAddr, gateway: IpAddr) -> io::Result<()> {
        let mut world = self.world.borrow_mut();
        let host = world.host_mut(agent)?;
        let route = Route { dst, via: gateway };
        match host.routes.iter().position(|r| *r == route) {
            Some(index) => {
                host.routes.remove(index);
                Ok(())
            }
            None => Err(no_such("route to", &dst.to_string())),
        }
    }

    fn forwarding(&mut self, agent: &str, _family: Family) -> io::Result<bool> {
        Ok(self.world.borrow_mut().host_mut(agent)?.forwarding)
    }

    fn set_forwarding(&mut self, agent: &str, _family: Family, enabled: bool) -> io::Result<()> {
        let mut world = self.world.borrow_mut();
        world.check_fault(agent, Fault::SetForwarding)?;
        world.host_mut(agent)?.forwarding = enabled;
        Ok(())
    }

    fn link_addr(&mut self, agent: &str, interface: &str) -> io::Result<EthernetAddress> {
        let mut world = self.world.borrow_mut();
        world
            .host_mut(agent)?
            .interfaces
            .iter()
            .find(|iface| iface.name == interface)
            .map(|iface| iface.link_addr)
            .ok_or_else(|| no_such("interface", interface))
    }
}

/// The virtual clock of the network. Sleeping runs the timers of every
/// host.
pub struct SimClock {
    world: Shared,
}

impl SimClock {
    pub fn new(world: Shared) -> SimClock {
        SimClock { world }
    }
}

impl Clock for SimClock {
    fn now(&self) -> Instant {
        self.world.borrow().now
    }

    fn sleep(&self, duration: Duration) {
        let mut world = self.world.borrow_mut();
        let until = world.now + duration;
        world.advance_to(until);
    }
}
