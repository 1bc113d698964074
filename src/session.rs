/*! Sessions.

A [Session] owns one IUT socket, one peer and the traffic gating between
them, and remembers what the IUT was last observed doing. It is opened
with a [SessionBuilder] and driven with [run_str], [run_states] or
[run_path].

Everything a session changes on the hosts (ARP entries, routes, the
gateway's forwarding switch, sockets, packet engine connections) is
undone when it is closed. Dropping a session closes it too, so an early
return or a panic in a test does not leave the hosts misconfigured.

[Session]: struct.Session.html
[SessionBuilder]: struct.SessionBuilder.html
[run_str]: struct.Session.html#method.run_str
[run_states]: struct.Session.html#method.run_states
[run_path]: struct.Session.html#method.run_path
*/

use std::rc::Rc;

use crate::agent::{ConnSpec, Fd, NetConfig, PacketEngine, RstInjector, SocketApi};
use crate::config::Config;
use crate::connectivity::{ArpTarget, Connectivity, ConnectivityState};
use crate::endpoint::{Direction, Endpoint, Gateway};
use crate::error::{Error, ErrorKind, Result};
use crate::flags::SessionFlags;
use crate::iut::IutDriver;
use crate::peer::{CraftedPeer, Peer, PeerKind, SocketPeer};
use crate::state::TcpState;
use crate::table::{Action, Move, PeerAction};
use crate::time::{Clock, Duration, SystemClock};
use crate::wire::EthernetAddress;

/// Link address ARP entries point at to black-hole a direction.
pub const DEFAULT_ALIEN_LINK_ADDR: EthernetAddress =
    EthernetAddress([0x02, 0x00, 0x00, 0x0a, 0x11, 0xe7]);

/// The service that emulates the peer.
pub enum PeerBackend {
    /// Socket calls on the peer agent. The injector, if any, is used to
    /// reset a connection in TIME_WAIT.
    Socket {
        api: Box<dyn SocketApi>,
        injector: Option<Box<dyn RstInjector>>,
    },
    /// A packet engine on the peer agent.
    Crafted { engine: Box<dyn PacketEngine> },
}

/// Parameters of a session that is about to be opened.
pub struct SessionBuilder {
    iut: Endpoint,
    iut_api: Box<dyn SocketApi>,
    peer: Endpoint,
    backend: PeerBackend,
    netconf: Box<dyn NetConfig>,
    gateway: Option<Gateway>,
    clock: Rc<dyn Clock>,
    alien: EthernetAddress,
    flags: SessionFlags,
    config: Config,
}

impl SessionBuilder {
    /// Route traffic through `gateway`. With a packet engine peer this
    /// selects [PeerKind::CraftedPacketViaGateway].
    ///
    /// [PeerKind::CraftedPacketViaGateway]: ../peer/enum.PeerKind.html#variant.CraftedPacketViaGateway
    pub fn gateway(mut self, gateway: Gateway) -> SessionBuilder {
        self.gateway = Some(gateway);
        self
    }

    pub fn flags(mut self, flags: SessionFlags) -> SessionBuilder {
        self.flags = flags;
        self
    }

    pub fn config(mut self, config: Config) -> SessionBuilder {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Rc<dyn Clock>) -> SessionBuilder {
        self.clock = clock;
        self
    }

    pub fn alien_link_addr(mut self, alien: EthernetAddress) -> SessionBuilder {
        self.alien = alien;
        self
    }

    /// Open the session.
    ///
    /// The peer is created first, then the gateway is configured, then
    /// the IUT socket is created and bound. A packet engine peer also
    /// gets the IUT to peer direction broken, so that no kernel on the
    /// peer side answers the IUT. If any step fails, everything done
    /// before it is undone and the error is returned.
    pub fn open(self) -> Result<Session> {
        let SessionBuilder {
            iut,
            iut_api,
            peer,
            backend,
            mut netconf,
            gateway,
            clock,
            alien,
            flags,
            config,
        } = self;

        let (peer_kind, peer_handle) = match backend {
            PeerBackend::Socket { api, injector } => {
                let mut socket = SocketPeer::new(api, peer.clone(), iut.addr, clock.clone())
                    .with_reuse_addr(flags.contains(SessionFlags::TESTER_REUSE_ADDR))
                    .with_injector(injector)
                    .with_retry_step(config.retry_step);
                let backlog = if flags.contains(SessionFlags::ESTABLISH_PASSIVE) {
                    None
                } else {
                    Some(config.listen_backlog)
                };
                socket.open(backlog)?;
                (PeerKind::RealSocket, Peer::Socket(socket))
            }
            PeerBackend::Crafted { engine } => {
                let remote_link = match &gateway {
                    Some(gw) => link_addr_of(&mut *netconf, &gw.peer_side)?,
                    None => link_addr_of(&mut *netconf, &iut)?,
                };
                let spec = ConnSpec {
                    agent: peer.agent.clone(),
                    interface: peer.interface.clone(),
                    local: peer.addr,
                    remote: iut.addr,
                    local_link: link_addr_of(&mut *netconf, &peer)?,
                    remote_link,
                };
                let crafted = CraftedPeer::open(engine, &spec, clock.clone())?;
                let kind = if gateway.is_some() {
                    PeerKind::CraftedPacketViaGateway
                } else {
                    PeerKind::CraftedPacket
                };
                (kind, Peer::Crafted(crafted))
            }
        };

        let mut links = Connectivity::new(
            netconf,
            clock.clone(),
            alien,
            ArpTarget::for_direction(Direction::PeerToIut, &iut, &peer, gateway.as_ref()),
            ArpTarget::for_direction(Direction::IutToPeer, &iut, &peer, gateway.as_ref()),
        );
        links.apply_flags(flags, config.settle_delay);

        let mut session = Session {
            iut: IutDriver::new(iut_api, iut),
            peer: peer_handle,
            peer_kind,
            links,
            gateway,
            peer_endpoint: peer,
            clock,
            config,
            flags,
            current: TcpState::Unknown,
            state_from: TcpState::Unknown,
            state_to: TcpState::Unknown,
            remaining_path: None,
            timeout_used: false,
            elapsed: Duration::ZERO,
            closed: false,
        };
        // From here on a failure drops `session`, which tears it down.
        if let Some(gateway) = session.gateway.clone() {
            session
                .links
                .configure_gateway(&gateway, session.iut.endpoint(), &session.peer_endpoint)?;
        }
        session.iut.open()?;
        if session.peer_kind.is_crafted() {
            session.links.break_direction(Direction::IutToPeer)?;
        }
        session.update_state()?;
        net_info!(
            "session open: iut {}, {} peer {}",
            session.iut.endpoint(),
            session.peer_kind,
            session.peer_endpoint
        );
        Ok(session)
    }
}

/// The configured link address of an endpoint, or the one its agent
/// reports.
fn link_addr_of(netconf: &mut dyn NetConfig, endpoint: &Endpoint) -> Result<EthernetAddress> {
    if endpoint.link_addr != EthernetAddress::default() {
        return Ok(endpoint.link_addr);
    }
    netconf
        .link_addr(&endpoint.agent, &endpoint.interface)
        .map_err(|e| Error::io(ErrorKind::ConfigFailed, "read link address", e))
}

/// A connection between the IUT and the peer, and the means to drive it.
pub struct Session {
    pub(crate) iut: IutDriver,
    pub(crate) peer: Peer,
    pub(crate) peer_kind: PeerKind,
    pub(crate) links: Connectivity,
    pub(crate) gateway: Option<Gateway>,
    pub(crate) peer_endpoint: Endpoint,
    pub(crate) clock: Rc<dyn Clock>,
    pub(crate) config: Config,
    pub(crate) flags: SessionFlags,
    /// State the IUT was last observed in.
    pub(crate) current: TcpState,
    pub(crate) state_from: TcpState,
    pub(crate) state_to: TcpState,
    pub(crate) remaining_path: Option<String>,
    pub(crate) timeout_used: bool,
    pub(crate) elapsed: Duration,
    closed: bool,
}

impl Session {
    /// Start describing a session between `iut` and `peer`.
    pub fn builder(
        iut: Endpoint,
        iut_api: Box<dyn SocketApi>,
        peer: Endpoint,
        backend: PeerBackend,
        netconf: Box<dyn NetConfig>,
    ) -> SessionBuilder {
        SessionBuilder {
            iut,
            iut_api,
            peer,
            backend,
            netconf,
            gateway: None,
            clock: Rc::new(SystemClock::new()),
            alien: DEFAULT_ALIEN_LINK_ADDR,
            flags: SessionFlags::empty(),
            config: Config::default(),
        }
    }

    pub fn peer_kind(&self) -> PeerKind {
        self.peer_kind
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The state the IUT was last observed in. Does not query the IUT.
    pub fn current_state(&self) -> TcpState {
        self.current
    }

    /// Override the remembered state without querying the IUT.
    ///
    /// Paths started with an `UNKNOWN` initial state take this as their
    /// starting point.
    pub fn set_current_state(&mut self, state: TcpState) {
        net_debug!("current state set to {} (was {})", state, self.current);
        self.current = state;
    }

    /// Query the IUT and remember the answer.
    pub fn update_state(&mut self) -> Result<TcpState> {
        self.current = self.iut.query_state()?;
        Ok(self.current)
    }

    /// Source state of the last edge attempted.
    pub fn state_from(&self) -> TcpState {
        self.state_from
    }

    /// Target state of the last edge attempted.
    pub fn state_to(&self) -> TcpState {
        self.state_to
    }

    /// What the last path run left unexecuted, if it stopped or failed.
    pub fn remaining_path(&self) -> Option<&str> {
        self.remaining_path.as_deref()
    }

    /// Whether the last edge ran with `PREFER_TIMEOUT_PATH`.
    pub fn timeout_used(&self) -> bool {
        self.timeout_used
    }

    /// Time the last edge took, when `PREFER_TIMEOUT_PATH` was in effect.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn iut_fd(&self) -> Option<Fd> {
        self.iut.fd()
    }

    pub fn peer_fd(&self) -> Option<Fd> {
        self.peer.fd()
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.links.state()
    }

    pub fn break_direction(&mut self, direction: Direction) -> Result<()> {
        self.links.break_direction(direction)
    }

    pub fn restore_direction(&mut self, direction: Direction) -> Result<()> {
        self.links.restore_direction(direction)
    }

    /// Make the peer reset the connection, outside of any path.
    pub fn send_rst(&mut self) -> Result<()> {
        let from = self.current;
        self.state_from = from;
        self.state_to = TcpState::Closed;
        let mv = Move {
            from,
            to: TcpState::Closed,
            peer: Some(PeerAction::Rst),
            iut: None,
        };
        self.run_peer_action(&mv, PeerAction::Rst, self.flags)
            .map_err(|e| e.during(Action::Peer(PeerAction::Rst)).at(from, TcpState::Closed))
    }

    /// Close the session, reporting the first teardown failure.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut result = Ok(());
        let mut note = |step: &str, r: Result<()>| {
            if let Err(err) = r {
                net_error!("session teardown, {}: {}", step, err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        };

        note("restore connectivity", self.links.restore_all());
        self.drain_connects();
        note("close IUT socket", self.iut.close());
        note("release peer", self.peer.destroy());
        note("unconfigure gateway", self.links.unconfigure_gateway());
        net_info!("session closed");
        result
    }

    /// Let connects still in flight complete or fail, so that closing the
    /// sockets does not race the handshake. Failures are expected here.
    fn drain_connects(&mut self) {
        let budget = self.config.ordinary_budget;
        if self.iut.connect_pending() {
            if let Err(err) = self.iut.connect(self.peer_endpoint.addr) {
                net_debug!("draining IUT connect: {}", err);
            }
        }
        let drained = match &mut self.peer {
            Peer::Socket(peer) if peer.connect_pending() => peer.finish_connect(budget),
            Peer::Crafted(peer) if peer.opening() => peer.wait_handshake(budget),
            _ => Ok(()),
        };
        if let Err(err) = drained {
            net_debug!("draining peer connect: {}", err);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            net_error!("session dropped with a failed teardown: {}", err);
        }
    }
}
