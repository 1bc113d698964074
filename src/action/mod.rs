/*! Table actions, carried out on a concrete peer.

The transition table only names what each side must do. How a kernel
socket peer or a crafted-segment peer does it differs a lot: the socket
peer steers both kernels by breaking and restoring traffic directions,
while the crafted peer emits exactly the segment it needs and reads the
IUT's answer off the wire. Each back end has its own module; this one
dispatches and holds what they share.
*/

use crate::error::{Error, ErrorKind, Result};
use crate::flags::SessionFlags;
use crate::peer::{CraftedPeer, Peer, SocketPeer};
use crate::session::Session;
use crate::table::{IutAction, Move, PeerAction};
use crate::time::Duration;

mod csap;
mod socket;

fn wrong_backend() -> Error {
    Error::new(ErrorKind::BackendUnsupported, "action issued to the wrong peer back end")
}

pub(crate) fn socket_peer(peer: &mut Peer) -> Result<&mut SocketPeer> {
    peer.as_socket_mut().ok_or_else(wrong_backend)
}

pub(crate) fn crafted_peer(peer: &mut Peer) -> Result<&mut CraftedPeer> {
    peer.as_crafted_mut().ok_or_else(wrong_backend)
}

impl Session {
    pub(crate) fn run_peer_action(
        &mut self,
        mv: &Move,
        action: PeerAction,
        flags: SessionFlags,
    ) -> Result<()> {
        if !self.peer.supports(action) {
            return Err(Error::new(
                ErrorKind::BackendUnsupported,
                format!("{} peer cannot {}", self.peer_kind, action),
            ));
        }
        net_trace!("peer action {} on {} -> {}", action, mv.from, mv.to);
        match self.peer {
            Peer::Socket(_) => self.socket_peer_action(mv, action, flags),
            Peer::Crafted(_) => self.csap_peer_action(mv, action),
        }
    }

    pub(crate) fn run_iut_action(
        &mut self,
        mv: &Move,
        action: IutAction,
        _flags: SessionFlags,
    ) -> Result<()> {
        net_trace!("iut action {} on {} -> {}", action, mv.from, mv.to);
        match self.peer {
            Peer::Socket(_) => self.socket_iut_action(mv, action),
            Peer::Crafted(_) => self.csap_iut_action(mv, action),
        }
    }

    /// Accept on the listening IUT socket, retrying while nothing is
    /// queued. The accepted socket becomes the IUT socket.
    pub(crate) fn accept_iut(&mut self, budget: Duration) -> Result<()> {
        let deadline = self.clock.now() + budget;
        loop {
            if self.iut.accept()?.is_some() {
                return Ok(());
            }
            if self.clock.now() >= deadline {
                return Err(Error::new(
                    ErrorKind::Timeout,
                    "no connection to accept on the IUT",
                ));
            }
            self.clock.sleep(self.config.retry_step);
        }
    }
}
