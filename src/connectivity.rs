/*! Traffic gating between the IUT and the peer.

A direction is broken by pointing the next hop of that direction at an
alien link address in the ARP table of the upstream host, and restored by
deleting that entry. Segments sent while a direction is broken are lost,
and both kernels retransmit them once it is restored, which is what lets
the driver stop a connection in a transient state.

In gateway mode this module also owns the two host routes through the
gateway and the gateway's forwarding switch.
*/

use std::net::IpAddr;
use std::rc::Rc;

use crate::agent::{Family, NetConfig};
use crate::endpoint::{Direction, Endpoint, Gateway};
use crate::error::{Error, ErrorKind, Result};
use crate::flags::SessionFlags;
use crate::time::{Clock, Duration};
use crate::wire::EthernetAddress;

/// Which directions currently have an ARP entry black-holing them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    pub peer_to_iut_broken: bool,
    pub iut_to_peer_broken: bool,
}

impl ConnectivityState {
    pub fn is_broken(&self, direction: Direction) -> bool {
        match direction {
            Direction::PeerToIut => self.peer_to_iut_broken,
            Direction::IutToPeer => self.iut_to_peer_broken,
        }
    }

    fn set(&mut self, direction: Direction, broken: bool) {
        match direction {
            Direction::PeerToIut => self.peer_to_iut_broken = broken,
            Direction::IutToPeer => self.iut_to_peer_broken = broken,
        }
    }
}

/// The ARP entry that breaks one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpTarget {
    /// Upstream host of the direction.
    pub agent: String,
    pub interface: String,
    /// Next hop whose resolution gets poisoned.
    pub victim: IpAddr,
}

impl ArpTarget {
    /// Where to break each direction.
    ///
    /// Peer to IUT is always cut on the peer host, at the IUT or at the
    /// gateway in front of it. IUT to peer is cut on the IUT host, or on
    /// the gateway when there is one.
    pub fn for_direction(
        direction: Direction,
        iut: &Endpoint,
        peer: &Endpoint,
        gateway: Option<&Gateway>,
    ) -> ArpTarget {
        match (direction, gateway) {
            (Direction::PeerToIut, Some(gw)) => ArpTarget {
                agent: peer.agent.clone(),
                interface: peer.interface.clone(),
                victim: gw.peer_side.ip(),
            },
            (Direction::PeerToIut, None) => ArpTarget {
                agent: peer.agent.clone(),
                interface: peer.interface.clone(),
                victim: iut.ip(),
            },
            (Direction::IutToPeer, Some(gw)) => ArpTarget {
                agent: gw.peer_side.agent.clone(),
                interface: gw.peer_side.interface.clone(),
                victim: peer.ip(),
            },
            (Direction::IutToPeer, None) => ArpTarget {
                agent: iut.agent.clone(),
                interface: iut.interface.clone(),
                victim: peer.ip(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InstalledRoute {
    agent: String,
    dst: IpAddr,
    via: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ForwardingChange {
    agent: String,
    family: Family,
    previous: bool,
}

fn config_error(call: &str, err: std::io::Error) -> Error {
    Error::io(ErrorKind::ConfigFailed, call, err)
}

/// The connectivity controller of one session.
pub struct Connectivity {
    netconf: Box<dyn NetConfig>,
    clock: Rc<dyn Clock>,
    alien: EthernetAddress,
    peer_to_iut: ArpTarget,
    iut_to_peer: ArpTarget,
    state: ConnectivityState,
    frozen: bool,
    settle: Duration,
    routes: Vec<InstalledRoute>,
    forwarding: Option<ForwardingChange>,
}

impl Connectivity {
    pub fn new(
        netconf: Box<dyn NetConfig>,
        clock: Rc<dyn Clock>,
        alien: EthernetAddress,
        peer_to_iut: ArpTarget,
        iut_to_peer: ArpTarget,
    ) -> Connectivity {
        Connectivity {
            netconf,
            clock,
            alien,
            peer_to_iut,
            iut_to_peer,
            state: ConnectivityState::default(),
            frozen: false,
            settle: Duration::ZERO,
            routes: Vec::new(),
            forwarding: None,
        }
    }

    /// Apply the session flags: `NO_CONNECTIVITY_CHANGE` turns every
    /// primitive into a no-op, `SUPPRESS_CONFIG_WAIT` drops the settle
    /// delay.
    pub fn apply_flags(&mut self, flags: SessionFlags, settle: Duration) {
        self.frozen = flags.contains(SessionFlags::NO_CONNECTIVITY_CHANGE);
        self.settle = if flags.contains(SessionFlags::SUPPRESS_CONFIG_WAIT) {
            Duration::ZERO
        } else {
            settle
        };
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub(crate) fn netconf(&mut self) -> &mut dyn NetConfig {
        &mut *self.netconf
    }

    fn target(&self, direction: Direction) -> &ArpTarget {
        match direction {
            Direction::PeerToIut => &self.peer_to_iut,
            Direction::IutToPeer => &self.iut_to_peer,
        }
    }

    fn settle(&self) {
        if self.settle > Duration::ZERO {
            self.clock.sleep(self.settle);
        }
    }

    /// Install the ARP entry without waiting. Returns whether anything
    /// changed.
    fn install(&mut self, direction: Direction) -> Result<bool> {
        if self.frozen || self.state.is_broken(direction) {
            return Ok(false);
        }
        let target = self.target(direction).clone();
        self.netconf
            .add_arp(&target.agent, &target.interface, target.victim, self.alien)
            .map_err(|e| config_error("add ARP entry", e))?;
        self.state.set(direction, true);
        net_info!(
            "{} broken: {} on {} -> {}",
            direction,
            target.victim,
            target.agent,
            self.alien
        );
        Ok(true)
    }

    fn uninstall(&mut self, direction: Direction) -> Result<bool> {
        if self.frozen || !self.state.is_broken(direction) {
            return Ok(false);
        }
        let target = self.target(direction).clone();
        self.netconf
            .del_arp(&target.agent, &target.interface, target.victim)
            .map_err(|e| config_error("delete ARP entry", e))?;
        self.state.set(direction, false);
        net_info!("{} restored: {} on {}", direction, target.victim, target.agent);
        Ok(true)
    }

    /// Black-hole `direction`. Breaking a broken direction does nothing.
    pub fn break_direction(&mut self, direction: Direction) -> Result<()> {
        if self.install(direction)? {
            self.settle();
        }
        Ok(())
    }

    /// Undo [break_direction](#method.break_direction).
    pub fn restore_direction(&mut self, direction: Direction) -> Result<()> {
        if self.uninstall(direction)? {
            self.settle();
        }
        Ok(())
    }

    /// Bring both directions to the requested state, settling once.
    pub fn set(&mut self, peer_to_iut_ok: bool, iut_to_peer_ok: bool) -> Result<()> {
        let mut changed = false;
        for (direction, ok) in [
            (Direction::PeerToIut, peer_to_iut_ok),
            (Direction::IutToPeer, iut_to_peer_ok),
        ] {
            changed |= if ok {
                self.uninstall(direction)?
            } else {
                self.install(direction)?
            };
        }
        if changed {
            self.settle();
        }
        Ok(())
    }

    /// Route each endpoint to the other through the gateway and enable
    /// forwarding on it.
    ///
    /// Everything installed is remembered, so a failure half way leaves
    /// exactly what [unconfigure_gateway](#method.unconfigure_gateway)
    /// removes.
    pub fn configure_gateway(
        &mut self,
        gateway: &Gateway,
        iut: &Endpoint,
        peer: &Endpoint,
    ) -> Result<()> {
        if gateway.preconfigured {
            net_debug!("gateway {} is preconfigured", gateway.agent());
            return Ok(());
        }

        for (host, dst, via) in [
            (iut, peer.ip(), gateway.iut_side.ip()),
            (peer, iut.ip(), gateway.peer_side.ip()),
        ] {
            self.netconf
                .add_route(&host.agent, dst, via)
                .map_err(|e| config_error("add route", e))?;
            net_info!("{}: route to {} via {}", host.agent, dst, via);
            self.routes.push(InstalledRoute {
                agent: host.agent.clone(),
                dst,
                via,
            });
        }

        let family = Family::of(&iut.ip());
        let agent = gateway.agent().to_owned();
        let previous = self
            .netconf
            .forwarding(&agent, family)
            .map_err(|e| config_error("read forwarding", e))?;
        if !previous {
            self.netconf
                .set_forwarding(&agent, family, true)
                .map_err(|e| config_error("enable forwarding", e))?;
            self.forwarding = Some(ForwardingChange {
                agent,
                family,
                previous,
            });
        }
        self.settle();
        Ok(())
    }

    /// Delete the routes this controller added and put forwarding back.
    /// Every step is attempted; the first failure is returned.
    pub fn unconfigure_gateway(&mut self) -> Result<()> {
        let mut result = Ok(());
        let mut note = |r: Result<()>| {
            if let Err(err) = r {
                net_error!("gateway teardown: {}", err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        };

        while let Some(route) = self.routes.pop() {
            note(
                self.netconf
                    .del_route(&route.agent, route.dst, route.via)
                    .map_err(|e| config_error("delete route", e)),
            );
        }
        if let Some(change) = self.forwarding.take() {
            note(
                self.netconf
                    .set_forwarding(&change.agent, change.family, change.previous)
                    .map_err(|e| config_error("restore forwarding", e)),
            );
        }
        result
    }

    /// Remove every ARP entry this controller installed, even when the
    /// session flags now forbid changes.
    pub fn restore_all(&mut self) -> Result<()> {
        self.frozen = false;
        let mut result = Ok(());
        let mut changed = false;
        for direction in [Direction::PeerToIut, Direction::IutToPeer] {
            match self.uninstall(direction) {
                Ok(c) => changed |= c,
                Err(err) => {
                    net_error!("restoring {}: {}", direction, err);
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        if changed {
            self.settle();
        }
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::io;

    #[derive(Default)]
    struct Log {
        calls: Vec<String>,
        fail_route: bool,
    }

    struct RecordingConfig(Rc<RefCell<Log>>);

    impl NetConfig for RecordingConfig {
        fn add_arp(
            &mut self,
            agent: &str,
            _if: &str,
            addr: IpAddr,
            mac: EthernetAddress,
        ) -> io::Result<()> {
            self.0.borrow_mut().calls.push(format!("arp+ {} {} {}", agent, addr, mac));
            Ok(())
        }
        fn del_arp(&mut self, agent: &str, _if: &str, addr: IpAddr) -> io::Result<()> {
            self.0.borrow_mut().calls.push(format!("arp- {} {}", agent, addr));
            Ok(())
        }
        fn add_route(&mut self, agent: &str, dst: IpAddr, via: IpAddr) -> io::Result<()> {
            let mut log = self.0.borrow_mut();
            if log.fail_route && agent == "peer" {
                return Err(io::Error::other("no route to host"));
            }
            log.calls.push(format!("route+ {} {} {}", agent, dst, via));
            Ok(())
        }
        fn del_route(&mut self, agent: &str, dst: IpAddr, via: IpAddr) -> io::Result<()> {
            self.0.borrow_mut().calls.push(format!("route- {} {} {}", agent, dst, via));
            Ok(())
        }
        fn forwarding(&mut self, _agent: &str, _family: Family) -> io::Result<bool> {
            Ok(false)
        }
        fn set_forwarding(&mut self, agent: &str, family: Family, on: bool) -> io::Result<()> {
            self.0.borrow_mut().calls.push(format!("fwd {} {} {}", agent, family, on));
            Ok(())
        }
        fn link_addr(&mut self, _agent: &str, _if: &str) -> io::Result<EthernetAddress> {
            Ok(EthernetAddress::default())
        }
    }

    struct CountingClock(Cell<u32>);

    impl Clock for CountingClock {
        fn now(&self) -> crate::time::Instant {
            crate::time::Instant::ZERO
        }
        fn sleep(&self, _duration: Duration) {
            self.0.set(self.0.get() + 1);
        }
    }

    const ALIEN: EthernetAddress = EthernetAddress([0x02, 0xde, 0xad, 0, 0, 1]);

    fn endpoint(agent: &str, addr: &str) -> Endpoint {
        Endpoint::new(agent, "eth0", addr.parse().unwrap(), EthernetAddress::default())
    }

    fn controller(
        gateway: Option<&Gateway>,
    ) -> (Connectivity, Rc<RefCell<Log>>, Rc<CountingClock>) {
        let log = Rc::new(RefCell::new(Log::default()));
        let clock = Rc::new(CountingClock(Cell::new(0)));
        let iut = endpoint("iut", "10.0.0.1:5000");
        let peer = endpoint("peer", "10.0.1.1:6000");
        let conn = Connectivity::new(
            Box::new(RecordingConfig(log.clone())),
            clock.clone(),
            ALIEN,
            ArpTarget::for_direction(Direction::PeerToIut, &iut, &peer, gateway),
            ArpTarget::for_direction(Direction::IutToPeer, &iut, &peer, gateway),
        );
        (conn, log, clock)
    }

    #[test]
    fn test_break_is_idempotent() {
        let (mut conn, log, clock) = controller(None);
        conn.apply_flags(SessionFlags::empty(), Duration::from_secs(2));
        conn.break_direction(Direction::PeerToIut).unwrap();
        conn.break_direction(Direction::PeerToIut).unwrap();
        assert_eq!(log.borrow().calls, vec!["arp+ peer 10.0.0.1 02:de:ad:00:00:01"]);
        assert_eq!(clock.0.get(), 1);
        assert!(conn.state().peer_to_iut_broken);

        conn.restore_direction(Direction::PeerToIut).unwrap();
        conn.restore_direction(Direction::PeerToIut).unwrap();
        assert_eq!(log.borrow().calls.len(), 2);
        assert_eq!(conn.state(), ConnectivityState::default());
    }

    #[test]
    fn test_frozen_does_nothing() {
        let (mut conn, log, _clock) = controller(None);
        conn.apply_flags(SessionFlags::NO_CONNECTIVITY_CHANGE, Duration::from_secs(2));
        conn.set(false, false).unwrap();
        assert!(log.borrow().calls.is_empty());
        assert!(!conn.state().iut_to_peer_broken);
    }

    #[test]
    fn test_set_settles_once() {
        let (mut conn, log, clock) = controller(None);
        conn.apply_flags(SessionFlags::empty(), Duration::from_secs(2));
        conn.set(false, false).unwrap();
        assert_eq!(clock.0.get(), 1);
        assert_eq!(log.borrow().calls[1], "arp+ iut 10.0.1.1 02:de:ad:00:00:01");
        conn.set(true, false).unwrap();
        assert_eq!(clock.0.get(), 2);
        conn.set(true, false).unwrap();
        assert_eq!(clock.0.get(), 2);
    }

    #[test]
    fn test_suppressed_wait() {
        let (mut conn, _log, clock) = controller(None);
        conn.apply_flags(SessionFlags::SUPPRESS_CONFIG_WAIT, Duration::from_secs(2));
        conn.break_direction(Direction::IutToPeer).unwrap();
        assert_eq!(clock.0.get(), 0);
    }

    #[test]
    fn test_gateway_targets() {
        let gw = Gateway::new(endpoint("gw", "10.0.0.254:0"), endpoint("gw", "10.0.1.254:0"));
        let (mut conn, log, _clock) = controller(Some(&gw));
        conn.apply_flags(SessionFlags::SUPPRESS_CONFIG_WAIT, Duration::ZERO);
        conn.set(false, false).unwrap();
        assert_eq!(
            log.borrow().calls,
            vec![
                "arp+ peer 10.0.1.254 02:de:ad:00:00:01",
                "arp+ gw 10.0.1.1 02:de:ad:00:00:01",
            ]
        );
        conn.restore_all().unwrap();
        assert_eq!(conn.state(), ConnectivityState::default());
    }

    #[test]
    fn test_gateway_rollback_removes_partial_routes() {
        let gw = Gateway::new(endpoint("gw", "10.0.0.254:0"), endpoint("gw", "10.0.1.254:0"));
        let (mut conn, log, _clock) = controller(Some(&gw));
        log.borrow_mut().fail_route = true;
        let iut = endpoint("iut", "10.0.0.1:5000");
        let peer = endpoint("peer", "10.0.1.1:6000");
        let err = conn.configure_gateway(&gw, &iut, &peer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigFailed);
        conn.unconfigure_gateway().unwrap();
        assert_eq!(
            log.borrow().calls,
            vec!["route+ iut 10.0.1.1 10.0.0.254", "route- iut 10.0.1.1 10.0.0.254"]
        );
    }

    #[test]
    fn test_gateway_restores_forwarding() {
        let gw = Gateway::new(endpoint("gw", "10.0.0.254:0"), endpoint("gw", "10.0.1.254:0"));
        let (mut conn, log, _clock) = controller(Some(&gw));
        conn.apply_flags(SessionFlags::SUPPRESS_CONFIG_WAIT, Duration::ZERO);
        let iut = endpoint("iut", "10.0.0.1:5000");
        let peer = endpoint("peer", "10.0.1.1:6000");
        conn.configure_gateway(&gw, &iut, &peer).unwrap();
        conn.unconfigure_gateway().unwrap();
        let calls = log.borrow().calls.clone();
        assert_eq!(calls[2], "fwd gw ipv4 true");
        assert_eq!(calls.last().unwrap(), "fwd gw ipv4 false");
    }

    #[test]
    fn test_preconfigured_gateway_untouched() {
        let gw = Gateway::new(endpoint("gw", "10.0.0.254:0"), endpoint("gw", "10.0.1.254:0"))
            .preconfigured(true);
        let (mut conn, log, _clock) = controller(Some(&gw));
        let iut = endpoint("iut", "10.0.0.1:5000");
        let peer = endpoint("peer", "10.0.1.1:6000");
        conn.configure_gateway(&gw, &iut, &peer).unwrap();
        conn.unconfigure_gateway().unwrap();
        assert!(log.borrow().calls.is_empty());
    }
}
