/*! The other end of the tested connection.

A peer is emulated in one of two ways:

 - [SocketPeer] is an ordinary kernel socket on a second host. Segments
   come out of that host's TCP stack as a side effect of socket calls,
   so some combinations cannot be produced at all.
 - [CraftedPeer] is a half-connection in a [PacketEngine]. Every
   operation emits exactly one segment with the flags and numbers the
   caller asked for.

The two variants keep their own state and share nothing; [Peer] only
dispatches. The choreography that turns a table action into calls on
either variant lives in the `action` module.

[SocketPeer]: struct.SocketPeer.html
[CraftedPeer]: struct.CraftedPeer.html
[Peer]: enum.Peer.html
[PacketEngine]: ../agent/trait.PacketEngine.html
*/

use core::fmt;

use crate::agent::Fd;
use crate::error::Result;
use crate::table::PeerAction;

mod csap;
mod socket;

pub use self::csap::{CraftedPeer, Role};
pub use self::socket::SocketPeer;

/// How the peer is emulated. Fixed when the session is opened.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum PeerKind {
    RealSocket,
    CraftedPacket,
    /// Crafted segments, with a router between the peer and the IUT.
    CraftedPacketViaGateway,
}

impl PeerKind {
    pub fn is_crafted(&self) -> bool {
        !matches!(self, PeerKind::RealSocket)
    }
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerKind::RealSocket => write!(f, "socket"),
            PeerKind::CraftedPacket => write!(f, "CSAP"),
            PeerKind::CraftedPacketViaGateway => write!(f, "CSAP via gateway"),
        }
    }
}

/// A peer of either kind.
#[allow(clippy::large_enum_variant)]
pub enum Peer {
    Socket(SocketPeer),
    Crafted(CraftedPeer),
}

impl Peer {
    /// Whether the back end can produce the segment behind `action`.
    pub fn supports(&self, action: PeerAction) -> bool {
        match self {
            Peer::Socket(_) => action != PeerAction::FinAck,
            Peer::Crafted(_) => true,
        }
    }

    pub fn as_socket_mut(&mut self) -> Option<&mut SocketPeer> {
        match self {
            Peer::Socket(peer) => Some(peer),
            Peer::Crafted(_) => None,
        }
    }

    pub fn as_crafted_mut(&mut self) -> Option<&mut CraftedPeer> {
        match self {
            Peer::Crafted(peer) => Some(peer),
            Peer::Socket(_) => None,
        }
    }

    /// The main peer socket. Crafted peers have none.
    pub fn fd(&self) -> Option<Fd> {
        match self {
            Peer::Socket(peer) => peer.fd(),
            Peer::Crafted(_) => None,
        }
    }

    /// Release everything the peer holds. Safe to call twice.
    pub fn destroy(&mut self) -> Result<()> {
        match self {
            Peer::Socket(peer) => peer.destroy(),
            Peer::Crafted(peer) => peer.destroy(),
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Peer::Socket(peer) => write!(f, "Peer::Socket({:?})", peer.fd()),
            Peer::Crafted(peer) => write!(f, "Peer::Crafted({:?})", peer.conn()),
        }
    }
}
