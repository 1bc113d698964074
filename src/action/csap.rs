//! Actions for a crafted-segment peer.
//!
//! The IUT's segments never reach a kernel on the peer side, so traffic
//! directions are left alone: the peer reads what the IUT sent off the
//! wire and answers with exactly the segment the edge calls for.

use super::crafted_peer;
use crate::error::Result;
use crate::session::Session;
use crate::state::TcpState;
use crate::table::{IutAction, Move, PeerAction};
use crate::wire::TcpFlags;

impl Session {
    pub(super) fn csap_iut_action(&mut self, mv: &Move, action: IutAction) -> Result<()> {
        let budget = self.config.ordinary_budget;
        match action {
            IutAction::Listen => self.iut.listen(self.config.listen_backlog),
            IutAction::Connect => {
                self.iut.connect(self.peer_endpoint.addr)?;
                if self.update_state()? == TcpState::Closed {
                    self.wait_change(None, budget)?;
                }
                Ok(())
            }
            IutAction::SynAck => {
                crafted_peer(&mut self.peer)?.expect("SYN-ACK", budget, |s| {
                    s.flags.contains(TcpFlags::SYN | TcpFlags::ACK)
                })?;
                Ok(())
            }
            IutAction::Ack => {
                let peer = crafted_peer(&mut self.peer)?;
                let snd_nxt = peer.snd_nxt();
                peer.expect("ACK", budget, |s| {
                    s.flags.contains(TcpFlags::ACK) && s.ack_number.covers(snd_nxt)
                })?;
                if self.iut.connect_pending() {
                    self.iut.connect(self.peer_endpoint.addr)?;
                }
                Ok(())
            }
            IutAction::Close | IutAction::ShutdownWrite => self.iut.shutdown_write(),
            IutAction::WaitChange => {
                self.wait_change(Some(mv.to), self.config.timeout_budget)?;
                Ok(())
            }
        }
    }

    pub(super) fn csap_peer_action(&mut self, mv: &Move, action: PeerAction) -> Result<()> {
        let budget = self.config.ordinary_budget;
        let peer = crafted_peer(&mut self.peer)?;
        match action {
            PeerAction::Syn => peer.send_syn(),
            PeerAction::SynAck => {
                if peer.rcv_nxt().is_none() {
                    peer.expect("SYN", budget, |s| s.flags.contains(TcpFlags::SYN))?;
                }
                peer.send_syn_ack()
            }
            PeerAction::Ack => {
                let fin_due = matches!(
                    mv.from,
                    TcpState::FinWait1 | TcpState::Closing | TcpState::LastAck
                );
                if fin_due && !peer.fin_received() {
                    peer.expect("FIN", budget, |s| s.flags.contains(TcpFlags::FIN))?;
                } else {
                    peer.drain()?;
                }
                peer.send_ack()?;
                if self.iut.is_listening() {
                    self.accept_iut(budget)?;
                }
                Ok(())
            }
            PeerAction::Fin => {
                peer.drain()?;
                peer.send_fin()
            }
            PeerAction::FinAck => {
                if !peer.fin_received() {
                    peer.expect("FIN", budget, |s| s.flags.contains(TcpFlags::FIN))?;
                }
                peer.send_fin_ack()
            }
            PeerAction::Rst => peer.send_rst(),
        }
    }
}
