use core::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::wire::EthernetAddress;

/// One end of the tested path, as seen by the agent that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Name of the test agent that hosts the endpoint.
    pub agent: String,
    /// Network interface on that agent.
    pub interface: String,
    /// Address and port the endpoint binds to.
    pub addr: SocketAddr,
    /// Hardware address of `interface`.
    pub link_addr: EthernetAddress,
}

impl Endpoint {
    pub fn new(
        agent: impl Into<String>,
        interface: impl Into<String>,
        addr: SocketAddr,
        link_addr: EthernetAddress,
    ) -> Endpoint {
        Endpoint {
            agent: agent.into(),
            interface: interface.into(),
            addr,
            link_addr,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{} {}", self.agent, self.interface, self.addr)
    }
}

/// One direction of traffic between the IUT and the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    PeerToIut,
    IutToPeer,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::PeerToIut => write!(f, "peer->iut"),
            Direction::IutToPeer => write!(f, "iut->peer"),
        }
    }
}

/// A router placed between the IUT and the peer.
///
/// Both sides must live on the same agent. The IUT side faces the IUT
/// network, the peer side faces the peer network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    pub iut_side: Endpoint,
    pub peer_side: Endpoint,
    /// Routes and forwarding are already in place; leave them alone.
    pub preconfigured: bool,
}

impl Gateway {
    pub fn new(iut_side: Endpoint, peer_side: Endpoint) -> Gateway {
        Gateway {
            iut_side,
            peer_side,
            preconfigured: false,
        }
    }

    pub fn preconfigured(mut self, preconfigured: bool) -> Gateway {
        self.preconfigured = preconfigured;
        self
    }

    pub fn agent(&self) -> &str {
        &self.iut_side.agent
    }
}
