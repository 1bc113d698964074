//! Actions for a kernel socket peer.
//!
//! Neither kernel can be told to emit one particular segment, so each
//! action sets up which direction may carry traffic, makes a socket call
//! and lets the retransmission timers deliver the segment the edge needs
//! while the answer is lost.

use super::socket_peer;
use crate::error::{Error, ErrorKind, Result};
use crate::flags::SessionFlags;
use crate::session::Session;
use crate::state::TcpState;
use crate::table::{IutAction, Move, PeerAction};

impl Session {
    pub(super) fn socket_iut_action(&mut self, mv: &Move, action: IutAction) -> Result<()> {
        let budget = self.config.ordinary_budget;
        match action {
            IutAction::Listen => self.iut.listen(self.config.listen_backlog),
            IutAction::Connect => {
                self.links.set(false, false)?;
                self.iut.connect(self.peer_endpoint.addr)?;
                if self.update_state()? == TcpState::Closed {
                    self.wait_change(None, budget)?;
                }
                Ok(())
            }
            IutAction::SynAck => {
                // The IUT hears the peer's SYN, its SYN-ACK is lost.
                self.links.set(true, false)?;
                // A listener never leaves LISTEN, there is nothing to wait for.
                let passive = mv.from == TcpState::Listen
                    && mv.to == TcpState::SynRecv
                    && self.current == TcpState::Listen;
                if !passive {
                    self.wait_change(Some(mv.to), budget)?;
                }
                Ok(())
            }
            IutAction::Ack => {
                self.links.set(true, false)?;
                self.wait_change(Some(mv.to), budget)?;
                Ok(())
            }
            IutAction::Close | IutAction::ShutdownWrite => {
                self.links.set(false, false)?;
                self.iut.shutdown_write()
            }
            IutAction::WaitChange => {
                self.wait_change(Some(mv.to), self.config.timeout_budget)?;
                Ok(())
            }
        }
    }

    pub(super) fn socket_peer_action(
        &mut self,
        mv: &Move,
        action: PeerAction,
        flags: SessionFlags,
    ) -> Result<()> {
        let budget = self.config.ordinary_budget;
        match action {
            PeerAction::Syn => {
                self.links.set(false, false)?;
                socket_peer(&mut self.peer)?.send_syn()
            }
            PeerAction::SynAck => {
                self.links.set(true, true)?;
                // Nudge the IUT's pending connect; its kernel finishes it.
                self.iut.connect(self.peer_endpoint.addr)?;
                self.iut.abandon_connect();
                socket_peer(&mut self.peer)?.accept(budget)
            }
            PeerAction::Ack => self.socket_peer_ack(flags),
            PeerAction::Fin => {
                self.links.set(false, false)?;
                socket_peer(&mut self.peer)?.send_fin()
            }
            PeerAction::FinAck => Err(Error::new(
                ErrorKind::BackendUnsupported,
                "a socket cannot send FIN together with the ACK of the IUT's FIN",
            )),
            PeerAction::Rst => self.socket_peer_rst(mv),
        }
    }

    fn socket_peer_ack(&mut self, flags: SessionFlags) -> Result<()> {
        let budget = self.config.ordinary_budget;
        self.links.set(true, true)?;
        if !socket_peer(&mut self.peer)?.connect_pending() {
            return Ok(());
        }

        if self.current == TcpState::Listen {
            self.accept_iut(budget)?;
        } else {
            // Simultaneous open: both sides have a connect in flight.
            self.iut.connect(self.peer_endpoint.addr)?;
        }
        socket_peer(&mut self.peer)?.finish_connect(budget)?;

        if flags.contains(SessionFlags::NO_CONNECTIVITY_CHANGE) {
            self.wait_change(None, budget)?;
        }
        Ok(())
    }

    fn socket_peer_rst(&mut self, mv: &Move) -> Result<()> {
        let budget = self.config.ordinary_budget;
        if !matches!(self.current, TcpState::TimeWait | TcpState::Closed) {
            // Let the RST through but keep the IUT from answering it.
            self.links.set(true, false)?;
            socket_peer(&mut self.peer)?.send_rst()?;
            self.links.set(true, true)?;
            self.wait_change(Some(mv.to), budget)?;
            return Ok(());
        }

        // The kernel drops RSTs for connections it has already closed.
        self.links.set(true, false)?;
        socket_peer(&mut self.peer)?.send_rst_injected()?;
        // TIME_WAIT is not always observable, so any change will do.
        self.wait_change(None, budget)?;
        Ok(())
    }
}
