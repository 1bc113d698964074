use std::io;
use std::rc::Rc;

use crate::agent::{ConnHandle, ConnSpec, PacketEngine};
use crate::error::{Error, ErrorKind, Result};
use crate::time::{Clock, Duration};
use crate::wire::{Segment, SeqNumber, TcpFlags};

/// Initial sequence number of crafted connections.
const INITIAL_SEQ: SeqNumber = SeqNumber(0x2000_0000);

/// Receive window advertised in crafted segments.
const WINDOW: u16 = 64240;

/// Which side opened the crafted connection.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Role {
    /// The peer sent the first SYN.
    Client,
    /// The peer answered the IUT's SYN.
    Server,
}

fn peer_error(call: &str, err: io::Error) -> Error {
    Error::io(ErrorKind::PeerSendFailed, call, err)
}

fn recv_error(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::TimedOut {
        Error::new(ErrorKind::Timeout, "no segment from the IUT")
    } else {
        peer_error("receive", err)
    }
}

/// A half-connection in a packet engine.
///
/// The peer keeps its own sequence space and the IUT's as far as it has
/// seen it. Every `send_*` emits one segment built from that state; every
/// segment received through [wait_inbound](#method.wait_inbound) updates
/// it.
pub struct CraftedPeer {
    engine: Box<dyn PacketEngine>,
    clock: Rc<dyn Clock>,
    conn: Option<ConnHandle>,
    role: Option<Role>,
    snd_nxt: SeqNumber,
    /// Next sequence number expected from the IUT, once its SYN is seen.
    rcv_nxt: Option<SeqNumber>,
    /// Acknowledgement carried by the last segment sent.
    ack_sent: Option<SeqNumber>,
    /// Highest acknowledgement received from the IUT.
    remote_ack: Option<SeqNumber>,
    fin_received: bool,
}

impl CraftedPeer {
    /// Bind a half-connection described by `spec`.
    pub fn open(
        mut engine: Box<dyn PacketEngine>,
        spec: &ConnSpec,
        clock: Rc<dyn Clock>,
    ) -> Result<CraftedPeer> {
        let conn = engine
            .create(spec)
            .map_err(|e| peer_error("create CSAP", e))?;
        net_debug!(
            "peer {}: CSAP {} {} -> {} via {}",
            spec.agent,
            conn,
            spec.local,
            spec.remote,
            spec.remote_link
        );
        Ok(CraftedPeer {
            engine,
            clock,
            conn: Some(conn),
            role: None,
            snd_nxt: INITIAL_SEQ,
            rcv_nxt: None,
            ack_sent: None,
            remote_ack: None,
            fin_received: false,
        })
    }

    pub fn conn(&self) -> Option<ConnHandle> {
        self.conn
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn snd_nxt(&self) -> SeqNumber {
        self.snd_nxt
    }

    pub fn rcv_nxt(&self) -> Option<SeqNumber> {
        self.rcv_nxt
    }

    pub fn fin_received(&self) -> bool {
        self.fin_received
    }

    /// Whether the peer sent SYN and has heard nothing back yet.
    pub fn opening(&self) -> bool {
        self.role == Some(Role::Client) && self.rcv_nxt.is_none()
    }

    /// Whether the IUT has acknowledged everything sent so far.
    pub fn all_acked(&self) -> bool {
        self.remote_ack.is_some_and(|ack| ack.covers(self.snd_nxt))
    }

    fn handle(&self) -> Result<ConnHandle> {
        self.conn
            .ok_or_else(|| Error::new(ErrorKind::PeerSendFailed, "CSAP is destroyed"))
    }

    fn expected(&self) -> Result<SeqNumber> {
        self.rcv_nxt.ok_or_else(|| {
            Error::new(ErrorKind::PeerSendFailed, "nothing received from the IUT yet")
        })
    }

    fn emit(&mut self, flags: TcpFlags, ack_number: Option<SeqNumber>) -> Result<()> {
        let conn = self.handle()?;
        let mut flags = flags;
        if ack_number.is_some() {
            flags |= TcpFlags::ACK;
        }
        let segment = Segment {
            src_port: 0,
            dst_port: 0,
            seq_number: self.snd_nxt,
            ack_number: ack_number.unwrap_or_default(),
            flags,
            window_len: WINDOW,
        };
        self.engine
            .send(conn, &segment)
            .map_err(|e| peer_error("send", e))?;
        net_trace!("peer: sent {}", segment);
        self.snd_nxt += segment.segment_len();
        if ack_number.is_some() {
            self.ack_sent = ack_number;
        }
        Ok(())
    }

    /// Open actively. Any earlier state of the half-connection is dropped.
    pub fn send_syn(&mut self) -> Result<()> {
        self.snd_nxt = INITIAL_SEQ;
        self.rcv_nxt = None;
        self.ack_sent = None;
        self.remote_ack = None;
        self.fin_received = false;
        self.role = Some(Role::Client);
        self.emit(TcpFlags::SYN, None)
    }

    /// Answer the IUT's SYN.
    pub fn send_syn_ack(&mut self) -> Result<()> {
        let ack = self.expected()?;
        self.snd_nxt = INITIAL_SEQ;
        if self.role.is_none() {
            self.role = Some(Role::Server);
        }
        self.emit(TcpFlags::SYN, Some(ack))
    }

    /// Acknowledge everything received.
    pub fn send_ack(&mut self) -> Result<()> {
        let ack = self.expected()?;
        self.emit(TcpFlags::empty(), Some(ack))
    }

    /// FIN acknowledging no more than the previous segment did, so an IUT
    /// FIN that crossed it stays unacknowledged.
    pub fn send_fin(&mut self) -> Result<()> {
        let ack = match self.ack_sent {
            Some(ack) => ack,
            None => self.expected()?,
        };
        self.emit(TcpFlags::FIN, Some(ack))
    }

    /// FIN acknowledging everything received, the IUT's FIN included.
    pub fn send_fin_ack(&mut self) -> Result<()> {
        let ack = self.expected()?;
        self.emit(TcpFlags::FIN, Some(ack))
    }

    pub fn send_rst(&mut self) -> Result<()> {
        let ack = match self.ack_sent {
            Some(ack) => Some(ack),
            None => self.rcv_nxt,
        };
        self.emit(TcpFlags::RST, ack)
    }

    fn absorb(&mut self, segment: &Segment) {
        if segment.flags.contains(TcpFlags::SYN) {
            self.rcv_nxt = Some(segment.seq_number + segment.segment_len());
        } else if segment.flags.contains(TcpFlags::FIN) && !self.fin_received {
            self.rcv_nxt = Some(segment.seq_number + 1);
            self.fin_received = true;
        }
        if segment.flags.contains(TcpFlags::ACK) {
            let newer = match self.remote_ack {
                Some(ack) => segment.ack_number.covers(ack),
                None => true,
            };
            if newer {
                self.remote_ack = Some(segment.ack_number);
            }
        }
    }

    /// The next segment from the IUT, waiting at most `budget`.
    pub fn wait_inbound(&mut self, budget: Duration) -> Result<Segment> {
        let conn = self.handle()?;
        let segment = self.engine.recv(conn, budget).map_err(recv_error)?;
        net_trace!("peer: received {}", segment);
        self.absorb(&segment);
        Ok(segment)
    }

    /// Receive until a segment satisfies `pred`. Segments that do not are
    /// still taken into account.
    pub fn expect<F>(&mut self, what: &str, budget: Duration, pred: F) -> Result<Segment>
    where
        F: Fn(&Segment) -> bool,
    {
        let deadline = self.clock.now() + budget;
        loop {
            let now = self.clock.now();
            let remaining = if now >= deadline {
                Duration::ZERO
            } else {
                deadline - now
            };
            match self.wait_inbound(remaining) {
                Ok(segment) if pred(&segment) => return Ok(segment),
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::Timeout => {
                    return Err(Error::new(
                        ErrorKind::Timeout,
                        format!("no {} from the IUT", what),
                    ));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Consume whatever the IUT has already sent.
    pub fn drain(&mut self) -> Result<()> {
        loop {
            match self.wait_inbound(Duration::ZERO) {
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::Timeout => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Complete the three-way handshake from whichever side the peer is on.
    ///
    /// A client waits for the SYN-ACK and acknowledges it. A server waits
    /// until its SYN-ACK is acknowledged.
    pub fn wait_handshake(&mut self, budget: Duration) -> Result<()> {
        match self.role {
            Some(Role::Client) => {
                self.expect("SYN-ACK", budget, |s| {
                    s.flags.contains(TcpFlags::SYN | TcpFlags::ACK)
                })?;
                self.send_ack()
            }
            Some(Role::Server) => {
                let snd_nxt = self.snd_nxt;
                self.expect("ACK", budget, |s| {
                    s.flags.contains(TcpFlags::ACK) && s.ack_number.covers(snd_nxt)
                })?;
                Ok(())
            }
            None => Err(Error::new(
                ErrorKind::PeerSendFailed,
                "no handshake in progress",
            )),
        }
    }

    pub fn destroy(&mut self) -> Result<()> {
        match self.conn.take() {
            Some(conn) => self
                .engine
                .destroy(conn)
                .map_err(|e| peer_error("destroy CSAP", e)),
            None => Ok(()),
        }
    }
}
