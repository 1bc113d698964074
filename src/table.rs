/*! The transition table.

Every edge of the TCP state machine the driver can force, with the peer
action and the IUT action that force it. A pair may appear more than
once; the entries then differ in [Style], and [lookup] picks one
according to the edge preferences in effect.

[Style]: enum.Style.html
[lookup]: fn.lookup.html
*/

use core::fmt;

use crate::flags::SessionFlags;
use crate::state::TcpState;

/// What the peer does on an edge.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum PeerAction {
    Syn,
    SynAck,
    Ack,
    Fin,
    /// FIN carrying the acknowledgement of the IUT's FIN.
    FinAck,
    Rst,
}

impl fmt::Display for PeerAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerAction::Syn => write!(f, "send_syn"),
            PeerAction::SynAck => write!(f, "send_syn_ack"),
            PeerAction::Ack => write!(f, "send_ack"),
            PeerAction::Fin => write!(f, "send_fin"),
            PeerAction::FinAck => write!(f, "send_fin_ack"),
            PeerAction::Rst => write!(f, "send_rst"),
        }
    }
}

/// What the IUT does on an edge.
///
/// `SynAck` and `Ack` do not call the socket API: they let the IUT kernel
/// answer the segment the peer has just sent.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum IutAction {
    Listen,
    Connect,
    SynAck,
    Ack,
    Close,
    ShutdownWrite,
    WaitChange,
}

impl fmt::Display for IutAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IutAction::Listen => write!(f, "listen"),
            IutAction::Connect => write!(f, "connect"),
            IutAction::SynAck => write!(f, "send_syn_ack"),
            IutAction::Ack => write!(f, "send_ack"),
            IutAction::Close => write!(f, "close"),
            IutAction::ShutdownWrite => write!(f, "shutdown_write"),
            IutAction::WaitChange => write!(f, "wait_for_state_change"),
        }
    }
}

/// Either side's action, for error reports.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Action {
    Peer(PeerAction),
    Iut(IutAction),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Action::Peer(action) => write!(f, "peer {}", action),
            Action::Iut(action) => write!(f, "iut {}", action),
        }
    }
}

/// How an edge is driven.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Style {
    /// Packets exchanged in the normal course of the protocol.
    Normal,
    /// The IUT leaves the state on its own timer.
    Timeout,
    /// The peer aborts the connection.
    Rst,
}

/// One entry of the table.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Move {
    pub from: TcpState,
    pub to: TcpState,
    pub peer: Option<PeerAction>,
    pub iut: Option<IutAction>,
}

impl Move {
    const fn new(
        from: TcpState,
        to: TcpState,
        peer: Option<PeerAction>,
        iut: Option<IutAction>,
    ) -> Move {
        Move { from, to, peer, iut }
    }

    pub fn style(&self) -> Style {
        if self.iut == Some(IutAction::WaitChange) {
            Style::Timeout
        } else if self.peer == Some(PeerAction::Rst) {
            Style::Rst
        } else {
            Style::Normal
        }
    }

    /// Waits on this edge are bounded by the timeout budget.
    pub fn is_timer_driven(&self) -> bool {
        self.style() == Style::Timeout
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {} [", self.from, self.to)?;
        match self.peer {
            Some(action) => write!(f, "peer {}", action)?,
            None => write!(f, "peer -")?,
        }
        match self.iut {
            Some(action) => write!(f, ", iut {}]", action),
            None => write!(f, ", iut -]"),
        }
    }
}

use self::IutAction as I;
use self::PeerAction as P;
use crate::state::TcpState as S;

static MOVES: [Move; 28] = [
    Move::new(S::Closed, S::Listen, None, Some(I::Listen)),
    Move::new(S::Listen, S::SynSent, None, Some(I::Connect)),
    Move::new(S::Listen, S::SynRecv, Some(P::Syn), Some(I::SynAck)),
    Move::new(S::Closed, S::SynSent, None, Some(I::Connect)),
    Move::new(S::SynSent, S::SynRecv, Some(P::Syn), Some(I::SynAck)),
    Move::new(S::SynSent, S::Established, Some(P::SynAck), Some(I::Ack)),
    Move::new(S::SynSent, S::Closed, None, Some(I::Close)),
    Move::new(S::SynSent, S::Closed, None, Some(I::WaitChange)),
    Move::new(S::SynRecv, S::Listen, Some(P::Rst), None),
    Move::new(S::SynRecv, S::Established, Some(P::Ack), None),
    Move::new(S::SynRecv, S::FinWait1, None, Some(I::ShutdownWrite)),
    Move::new(S::Established, S::FinWait1, None, Some(I::ShutdownWrite)),
    Move::new(S::Established, S::CloseWait, Some(P::Fin), Some(I::Ack)),
    Move::new(S::CloseWait, S::LastAck, None, Some(I::ShutdownWrite)),
    Move::new(S::LastAck, S::Closed, Some(P::Ack), None),
    Move::new(S::FinWait1, S::FinWait2, Some(P::Ack), None),
    Move::new(S::FinWait1, S::Closing, Some(P::Fin), Some(I::Ack)),
    Move::new(S::FinWait1, S::TimeWait, Some(P::FinAck), Some(I::Ack)),
    Move::new(S::FinWait2, S::TimeWait, Some(P::Fin), Some(I::Ack)),
    Move::new(S::Closing, S::TimeWait, Some(P::Ack), None),
    Move::new(S::TimeWait, S::Closed, None, Some(I::WaitChange)),
    // Aborts from every synchronized state.
    Move::new(S::Established, S::Closed, Some(P::Rst), None),
    Move::new(S::FinWait1, S::Closed, Some(P::Rst), None),
    Move::new(S::FinWait2, S::Closed, Some(P::Rst), None),
    Move::new(S::CloseWait, S::Closed, Some(P::Rst), None),
    Move::new(S::Closing, S::Closed, Some(P::Rst), None),
    Move::new(S::LastAck, S::Closed, Some(P::Rst), None),
    Move::new(S::TimeWait, S::Closed, Some(P::Rst), None),
];

/// All entries, in lookup order.
pub fn moves() -> &'static [Move] {
    &MOVES
}

/// Find the entry for `(from, to)`.
///
/// With `PREFER_TIMEOUT_PATH` or `PREFER_RST_PATH` set, an entry of the
/// preferred style wins. Otherwise, or if there is none, the first
/// normal entry wins, and failing that the first entry for the pair.
pub fn lookup(from: TcpState, to: TcpState, flags: SessionFlags) -> Option<&'static Move> {
    let mut candidates = MOVES.iter().filter(|mv| mv.from == from && mv.to == to);
    let first = candidates.clone().next()?;

    let preferred = |style: Style| candidates.clone().find(|mv| mv.style() == style);
    if flags.contains(SessionFlags::PREFER_TIMEOUT_PATH) {
        if let Some(mv) = preferred(Style::Timeout) {
            return Some(mv);
        }
    }
    if flags.contains(SessionFlags::PREFER_RST_PATH) {
        if let Some(mv) = preferred(Style::Rst) {
            return Some(mv);
        }
    }

    Some(candidates.find(|mv| mv.style() == Style::Normal).unwrap_or(first))
}
