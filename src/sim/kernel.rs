/*! The TCP of a simulated host.

Just enough of RFC 793 to walk every state of the machine: sequence
numbers, SYN and FIN retransmission, the SYN_SENT give-up timer and
TIME_WAIT. There is no data path and the receive window is never
consulted; a segment is acceptable only if it starts exactly at
`rcv_nxt`.
*/

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::{Shutdown, SocketAddr};

use crate::agent::Fd;
use crate::state::TcpState;
use crate::time::{Duration, Instant};
use crate::wire::{Segment, SeqNumber, TcpFlags};

const INITIAL_RTO: Duration = Duration::from_secs(1);
const MAX_RTO: Duration = Duration::from_secs(60);
/// How long SYN is retransmitted before `connect` fails with `ETIMEDOUT`.
const SYN_GIVE_UP: Duration = Duration::from_secs(127);
/// Twice the maximum segment lifetime.
pub const TIME_WAIT_LEN: Duration = Duration::from_secs(120);
const WINDOW: u16 = 64240;
const FIRST_FD: Fd = 3;
const FIRST_EPHEMERAL_PORT: u16 = 32768;
const ISN_STRIDE: u32 = 64_000;

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// `a` is strictly before `b` in sequence space.
fn before(a: SeqNumber, b: SeqNumber) -> bool {
    !a.covers(b)
}

/// A segment leaving the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Outgoing {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub segment: Segment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connect {
    Idle,
    InProgress,
    /// Completion was reported to the caller once.
    Reported,
}

type SockId = usize;

#[derive(Debug)]
struct Socket {
    state: TcpState,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    reuse_addr: bool,
    abort_on_close: bool,
    /// Owned by a descriptor.
    has_fd: bool,
    /// Closed by its owner while the connection lingers on.
    orphan: bool,
    /// The listener an embryonic connection was spawned by.
    listener: Option<SockId>,
    backlog: usize,
    accept_queue: VecDeque<SockId>,
    iss: SeqNumber,
    snd_una: SeqNumber,
    snd_nxt: SeqNumber,
    rcv_nxt: SeqNumber,
    fin_seq: Option<SeqNumber>,
    fin_received: bool,
    rto: Duration,
    retransmit_at: Option<Instant>,
    give_up_at: Option<Instant>,
    time_wait_until: Option<Instant>,
    connect: Connect,
    error: Option<i32>,
}

impl Socket {
    fn new() -> Socket {
        Socket {
            state: TcpState::Closed,
            local: None,
            remote: None,
            reuse_addr: false,
            abort_on_close: false,
            has_fd: true,
            orphan: false,
            listener: None,
            backlog: 0,
            accept_queue: VecDeque::new(),
            iss: SeqNumber::default(),
            snd_una: SeqNumber::default(),
            snd_nxt: SeqNumber::default(),
            rcv_nxt: SeqNumber::default(),
            fin_seq: None,
            fin_received: false,
            rto: INITIAL_RTO,
            retransmit_at: None,
            give_up_at: None,
            time_wait_until: None,
            connect: Connect::Idle,
            error: None,
        }
    }

    fn stop_timers(&mut self) {
        self.retransmit_at = None;
        self.give_up_at = None;
        self.time_wait_until = None;
        self.rto = INITIAL_RTO;
    }

    fn arm_retransmit(&mut self, now: Instant) {
        self.rto = INITIAL_RTO;
        self.retransmit_at = Some(now + self.rto);
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.retransmit_at, self.give_up_at, self.time_wait_until]
            .into_iter()
            .flatten()
            .min()
    }

    fn matches(&self, local: SocketAddr, remote: SocketAddr) -> bool {
        self.local == Some(local) && self.remote == Some(remote)
    }

    fn listens_on(&self, local: SocketAddr) -> bool {
        self.state == TcpState::Listen
            && self.local.is_some_and(|addr| {
                addr.port() == local.port()
                    && (addr.ip() == local.ip() || addr.ip().is_unspecified())
            })
    }

    /// A segment with the given flags and sequence number, acknowledging
    /// `rcv_nxt` when `ACK` is among the flags.
    fn segment(&self, flags: TcpFlags, seq_number: SeqNumber) -> Option<Outgoing> {
        let (src, dst) = (self.local?, self.remote?);
        let ack_number = if flags.contains(TcpFlags::ACK) {
            self.rcv_nxt
        } else {
            SeqNumber::default()
        };
        Some(Outgoing {
            src,
            dst,
            segment: Segment {
                src_port: src.port(),
                dst_port: dst.port(),
                seq_number,
                ack_number,
                flags,
                window_len: WINDOW,
            },
        })
    }

    fn send(&self, flags: TcpFlags, seq_number: SeqNumber, out: &mut Vec<Outgoing>) {
        out.extend(self.segment(flags, seq_number));
    }

    fn send_ack(&self, out: &mut Vec<Outgoing>) {
        self.send(TcpFlags::ACK, self.snd_nxt, out)
    }

    fn send_syn_ack(&self, out: &mut Vec<Outgoing>) {
        self.send(TcpFlags::SYN | TcpFlags::ACK, self.iss, out)
    }

    fn send_rst(&self, out: &mut Vec<Outgoing>) {
        self.send(TcpFlags::RST | TcpFlags::ACK, self.snd_nxt, out)
    }

    fn send_fin(&mut self, now: Instant, out: &mut Vec<Outgoing>) {
        self.fin_seq = Some(self.snd_nxt);
        self.send(TcpFlags::FIN | TcpFlags::ACK, self.snd_nxt, out);
        self.snd_nxt += 1;
        self.arm_retransmit(now);
    }

    fn retransmit(&self, out: &mut Vec<Outgoing>) {
        match self.state {
            TcpState::SynSent => self.send(TcpFlags::SYN, self.iss, out),
            TcpState::SynRecv => self.send_syn_ack(out),
            TcpState::FinWait1 | TcpState::Closing | TcpState::LastAck => {
                if let Some(seq) = self.fin_seq {
                    self.send(TcpFlags::FIN | TcpFlags::ACK, seq, out)
                }
            }
            _ => (),
        }
    }
}

/// The sockets of one host.
#[derive(Debug)]
pub(super) struct Kernel {
    name: String,
    /// Slots are never reused, so a stale id finds nothing.
    sockets: Vec<Option<Socket>>,
    fds: BTreeMap<Fd, SockId>,
    next_fd: Fd,
    next_isn: u32,
    next_port: u16,
}

impl Kernel {
    pub fn new(name: &str, isn_seed: u32) -> Kernel {
        Kernel {
            name: name.to_owned(),
            sockets: Vec::new(),
            fds: BTreeMap::new(),
            next_fd: FIRST_FD,
            next_isn: isn_seed,
            next_port: FIRST_EPHEMERAL_PORT,
        }
    }

    /// Descriptors currently open.
    pub fn open_fds(&self) -> usize {
        self.fds.len()
    }

    /// Sockets alive, with or without a descriptor.
    pub fn socket_count(&self) -> usize {
        self.sockets.iter().flatten().count()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.sockets
            .iter()
            .flatten()
            .filter_map(Socket::next_deadline)
            .min()
    }

    fn isn(&mut self) -> SeqNumber {
        let isn = SeqNumber(self.next_isn);
        self.next_isn = self.next_isn.wrapping_add(ISN_STRIDE);
        isn
    }

    fn get(&self, id: SockId) -> Option<&Socket> {
        self.sockets.get(id).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: SockId) -> Option<&mut Socket> {
        self.sockets.get_mut(id).and_then(Option::as_mut)
    }

    fn insert(&mut self, socket: Socket) -> SockId {
        self.sockets.push(Some(socket));
        self.sockets.len() - 1
    }

    fn remove(&mut self, id: SockId) {
        if let Some(slot) = self.sockets.get_mut(id) {
            *slot = None;
        }
        for socket in self.sockets.iter_mut().flatten() {
            socket.accept_queue.retain(|&child| child != id);
        }
    }

    fn by_fd(&self, fd: Fd) -> io::Result<SockId> {
        self.fds.get(&fd).copied().ok_or_else(|| errno(libc::EBADF))
    }

    fn socket_of(&mut self, fd: Fd) -> io::Result<&mut Socket> {
        let id = self.by_fd(fd)?;
        self.get_mut(id).ok_or_else(|| errno(libc::EBADF))
    }

    fn new_fd(&mut self, id: SockId) -> Fd {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, id);
        fd
    }

    /// The connection is over. A socket still owned by a descriptor stays
    /// around in CLOSED, remembering `error` for the next call.
    fn finish(&mut self, id: SockId, error: Option<i32>) {
        if let Some(socket) = self.get(id) {
            net_trace!("{}: socket {} {} -> CLOSED", self.name, id, socket.state);
        }
        let Some(socket) = self.get_mut(id) else {
            return;
        };
        if socket.has_fd {
            socket.state = TcpState::Closed;
            socket.stop_timers();
            socket.error = error;
        } else {
            self.remove(id);
        }
    }

    fn set_state(&mut self, id: SockId, state: TcpState) {
        if let Some(socket) = self.get_mut(id) {
            socket.state = state;
        }
        net_trace!("{}: socket {} -> {}", self.name, id, state);
    }

    fn enter_time_wait(&mut self, id: SockId, now: Instant) {
        if let Some(socket) = self.get_mut(id) {
            socket.stop_timers();
            socket.time_wait_until = Some(now + TIME_WAIT_LEN);
        }
        self.set_state(id, TcpState::TimeWait);
    }

    // Socket calls.

    pub fn socket(&mut self) -> Fd {
        let id = self.insert(Socket::new());
        self.new_fd(id)
    }

    pub fn bind(&mut self, fd: Fd, addr: SocketAddr) -> io::Result<()> {
        let id = self.by_fd(fd)?;
        let reuse = self.get(id).is_some_and(|socket| socket.reuse_addr);
        if self.get(id).is_some_and(|socket| socket.local.is_some()) {
            return Err(errno(libc::EINVAL));
        }
        let conflict = self.sockets.iter().enumerate().any(|(other, socket)| {
            socket.as_ref().is_some_and(|socket| {
                other != id
                    && socket.has_fd
                    && socket.local == Some(addr)
                    && !(reuse && socket.reuse_addr && socket.state != TcpState::Listen)
            })
        });
        if conflict {
            return Err(errno(libc::EADDRINUSE));
        }
        self.socket_of(fd)?.local = Some(addr);
        Ok(())
    }

    pub fn check_fd(&self, fd: Fd) -> io::Result<()> {
        self.by_fd(fd).map(|_| ())
    }

    pub fn set_reuse_addr(&mut self, fd: Fd, reuse: bool) -> io::Result<()> {
        self.socket_of(fd)?.reuse_addr = reuse;
        Ok(())
    }

    pub fn set_linger(&mut self, fd: Fd, linger: Option<Duration>) -> io::Result<()> {
        self.socket_of(fd)?.abort_on_close = linger == Some(Duration::ZERO);
        Ok(())
    }

    pub fn connect(
        &mut self,
        fd: Fd,
        addr: SocketAddr,
        now: Instant,
        out: &mut Vec<Outgoing>,
    ) -> io::Result<()> {
        let id = self.by_fd(fd)?;
        let port = self.next_port;
        let isn = SeqNumber(self.next_isn);
        let socket = self.get_mut(id).ok_or_else(|| errno(libc::EBADF))?;
        if let Some(code) = socket.error.take() {
            socket.connect = Connect::Idle;
            return Err(errno(code));
        }

        match (socket.state, socket.connect) {
            (TcpState::Closed | TcpState::Listen, _) => (),
            (TcpState::SynSent | TcpState::SynRecv, Connect::InProgress) => {
                return Err(errno(libc::EALREADY));
            }
            (_, Connect::InProgress) => {
                socket.connect = Connect::Reported;
                return Ok(());
            }
            _ => return Err(errno(libc::EISCONN)),
        }

        let mut ephemeral = false;
        if socket.local.is_none() {
            socket.local = Some(SocketAddr::new(addr.ip(), port));
            ephemeral = true;
        }
        socket.remote = Some(addr);
        socket.iss = isn;
        socket.snd_una = isn;
        socket.snd_nxt = isn + 1;
        socket.fin_seq = None;
        socket.fin_received = false;
        socket.state = TcpState::SynSent;
        socket.connect = Connect::InProgress;
        socket.accept_queue.clear();
        socket.send(TcpFlags::SYN, isn, out);
        socket.arm_retransmit(now);
        socket.give_up_at = Some(now + SYN_GIVE_UP);

        self.isn();
        if ephemeral {
            self.next_port = self.next_port.wrapping_add(1);
        }
        net_trace!("{}: socket {} connecting to {}", self.name, fd, addr);
        Err(errno(libc::EINPROGRESS))
    }

    pub fn listen(&mut self, fd: Fd, backlog: i32) -> io::Result<()> {
        let socket = self.socket_of(fd)?;
        if socket.state != TcpState::Closed || socket.local.is_none() {
            return Err(errno(libc::EINVAL));
        }
        socket.state = TcpState::Listen;
        socket.backlog = backlog.max(1) as usize;
        Ok(())
    }

    pub fn accept(&mut self, fd: Fd) -> io::Result<Fd> {
        let socket = self.socket_of(fd)?;
        if socket.state != TcpState::Listen {
            return Err(errno(libc::EINVAL));
        }
        let child = socket.accept_queue.pop_front().ok_or_else(|| errno(libc::EAGAIN))?;
        if let Some(socket) = self.get_mut(child) {
            socket.has_fd = true;
            socket.listener = None;
        }
        Ok(self.new_fd(child))
    }

    pub fn shutdown(
        &mut self,
        fd: Fd,
        how: Shutdown,
        now: Instant,
        out: &mut Vec<Outgoing>,
    ) -> io::Result<()> {
        if how == Shutdown::Read {
            return self.check_fd(fd);
        }
        let id = self.by_fd(fd)?;
        let socket = self.get_mut(id).ok_or_else(|| errno(libc::EBADF))?;
        match socket.state {
            TcpState::Closed => return Err(errno(libc::ENOTCONN)),
            TcpState::Listen => (),
            TcpState::SynSent => {
                socket.connect = Connect::Idle;
                self.finish(id, None);
            }
            TcpState::SynRecv | TcpState::Established => {
                socket.send_fin(now, out);
                self.set_state(id, TcpState::FinWait1);
            }
            TcpState::CloseWait => {
                socket.send_fin(now, out);
                self.set_state(id, TcpState::LastAck);
            }
            _ => (),
        }
        Ok(())
    }

    pub fn close(&mut self, fd: Fd, now: Instant, out: &mut Vec<Outgoing>) -> io::Result<()> {
        let id = self.by_fd(fd)?;
        self.fds.remove(&fd);
        let Some(socket) = self.get_mut(id) else {
            return Ok(());
        };
        socket.has_fd = false;
        let state = socket.state;

        if socket.abort_on_close && (state.is_synchronized() || state == TcpState::SynRecv) {
            socket.send_rst(out);
            self.remove(id);
            return Ok(());
        }
        match state {
            TcpState::Listen => {
                let queued: Vec<SockId> = socket.accept_queue.drain(..).collect();
                for child in queued {
                    if let Some(child) = self.get(child) {
                        child.send_rst(out);
                    }
                    self.remove(child);
                }
                let embryos: Vec<SockId> = self
                    .sockets
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.as_ref().is_some_and(|s| s.listener == Some(id)))
                    .map(|(child, _)| child)
                    .collect();
                for child in embryos {
                    self.remove(child);
                }
                self.remove(id);
            }
            TcpState::Closed | TcpState::SynSent => self.remove(id),
            TcpState::SynRecv | TcpState::Established => {
                socket.orphan = true;
                socket.send_fin(now, out);
                self.set_state(id, TcpState::FinWait1);
            }
            TcpState::CloseWait => {
                socket.orphan = true;
                socket.send_fin(now, out);
                self.set_state(id, TcpState::LastAck);
            }
            _ => socket.orphan = true,
        }
        Ok(())
    }

    /// Close every descriptor, the way a process exit does.
    pub fn close_all(&mut self, now: Instant, out: &mut Vec<Outgoing>) {
        let fds: Vec<Fd> = self.fds.keys().copied().collect();
        for fd in fds {
            if let Err(err) = self.close(fd, now, out) {
                net_debug!("{}: closing {} on exit: {}", self.name, fd, err);
            }
        }
    }

    pub fn recv(&mut self, fd: Fd) -> io::Result<usize> {
        let socket = self.socket_of(fd)?;
        if let Some(code) = socket.error.take() {
            return Err(errno(code));
        }
        match socket.state {
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => Err(errno(libc::ENOTCONN)),
            _ if socket.fin_received => Ok(0),
            _ => Err(errno(libc::EAGAIN)),
        }
    }

    pub fn tcpi_state(&mut self, fd: Fd) -> io::Result<u8> {
        let state = self.socket_of(fd)?.state;
        state.tcpi_state().ok_or_else(|| errno(libc::EINVAL))
    }

    // Segment arrival.

    /// Find the socket a segment belongs to. A live connection wins over
    /// an orphaned one on the same addresses, and either over a listener.
    fn demux(&self, local: SocketAddr, remote: SocketAddr) -> Option<SockId> {
        let mut orphan = None;
        for (id, socket) in self.sockets.iter().enumerate() {
            let Some(socket) = socket else { continue };
            if matches!(socket.state, TcpState::Closed | TcpState::Listen)
                || !socket.matches(local, remote)
            {
                continue;
            }
            if !socket.orphan {
                return Some(id);
            }
            orphan.get_or_insert(id);
        }
        orphan.or_else(|| {
            self.sockets
                .iter()
                .position(|s| s.as_ref().is_some_and(|s| s.listens_on(local)))
        })
    }

    pub fn input(
        &mut self,
        now: Instant,
        src: SocketAddr,
        dst: SocketAddr,
        segment: &Segment,
        out: &mut Vec<Outgoing>,
    ) {
        net_trace!("{}: {} -> {}: {}", self.name, src, dst, segment);
        let Some(id) = self.demux(dst, src) else {
            reset_unknown(src, dst, segment, out);
            return;
        };
        match self.get(id).map(|socket| socket.state) {
            Some(TcpState::Listen) => self.listen_input(id, now, src, dst, segment, out),
            Some(TcpState::SynSent) => self.syn_sent_input(id, now, segment, out),
            Some(_) => self.synchronized_input(id, now, segment, out),
            None => (),
        }
    }

    fn listen_input(
        &mut self,
        id: SockId,
        now: Instant,
        src: SocketAddr,
        dst: SocketAddr,
        segment: &Segment,
        out: &mut Vec<Outgoing>,
    ) {
        let flags = segment.flags;
        if flags.contains(TcpFlags::RST) {
            return;
        }
        if flags.contains(TcpFlags::ACK) {
            reset_unknown(src, dst, segment, out);
            return;
        }
        if !flags.contains(TcpFlags::SYN) {
            return;
        }
        let Some(listener) = self.get(id) else { return };
        if listener.accept_queue.len() >= listener.backlog {
            net_debug!("{}: accept queue full, SYN from {} dropped", self.name, src);
            return;
        }
        let (reuse_addr, abort_on_close) = (listener.reuse_addr, listener.abort_on_close);

        let iss = self.isn();
        let mut child = Socket::new();
        child.reuse_addr = reuse_addr;
        child.abort_on_close = abort_on_close;
        child.state = TcpState::SynRecv;
        child.has_fd = false;
        child.listener = Some(id);
        child.local = Some(dst);
        child.remote = Some(src);
        child.iss = iss;
        child.snd_una = iss;
        child.snd_nxt = iss + 1;
        child.rcv_nxt = segment.seq_number + 1;
        child.send_syn_ack(out);
        child.arm_retransmit(now);
        self.insert(child);
        net_trace!("{}: SYN from {}, embryo in SYN_RECV", self.name, src);
    }

    fn syn_sent_input(
        &mut self,
        id: SockId,
        now: Instant,
        segment: &Segment,
        out: &mut Vec<Outgoing>,
    ) {
        let Some(socket) = self.get_mut(id) else {
            return;
        };
        let flags = segment.flags;
        let has_ack = flags.contains(TcpFlags::ACK);
        let ack_ok = has_ack && segment.ack_number == socket.snd_nxt;

        if has_ack && !ack_ok {
            if !flags.contains(TcpFlags::RST) {
                socket.send(TcpFlags::RST, segment.ack_number, out);
            }
            return;
        }
        if flags.contains(TcpFlags::RST) {
            if ack_ok {
                self.finish(id, Some(libc::ECONNREFUSED));
            }
            return;
        }
        if !flags.contains(TcpFlags::SYN) {
            return;
        }

        socket.rcv_nxt = segment.seq_number + 1;
        if ack_ok {
            socket.snd_una = segment.ack_number;
            socket.stop_timers();
            socket.send_ack(out);
            self.set_state(id, TcpState::Established);
        } else {
            // Simultaneous open.
            socket.give_up_at = None;
            socket.send_syn_ack(out);
            socket.arm_retransmit(now);
            self.set_state(id, TcpState::SynRecv);
        }
    }

    fn synchronized_input(
        &mut self,
        id: SockId,
        now: Instant,
        segment: &Segment,
        out: &mut Vec<Outgoing>,
    ) {
        let Some(socket) = self.get_mut(id) else {
            return;
        };
        let flags = segment.flags;
        let state = socket.state;

        if state == TcpState::SynRecv
            && flags.contains(TcpFlags::SYN)
            && !flags.contains(TcpFlags::ACK)
            && segment.seq_number + 1 == socket.rcv_nxt
        {
            socket.send_syn_ack(out);
            return;
        }
        if segment.seq_number != socket.rcv_nxt {
            if !flags.contains(TcpFlags::RST) {
                socket.send_ack(out);
            }
            return;
        }
        if flags.contains(TcpFlags::RST) {
            self.reset(id);
            return;
        }
        if flags.contains(TcpFlags::SYN) {
            socket.send_ack(out);
            return;
        }
        if !flags.contains(TcpFlags::ACK) {
            return;
        }

        if before(socket.snd_nxt, segment.ack_number) {
            socket.send_ack(out);
            return;
        }
        if before(socket.snd_una, segment.ack_number) {
            socket.snd_una = segment.ack_number;
        }
        let all_acked = socket.snd_una == socket.snd_nxt;
        if all_acked {
            socket.retransmit_at = None;
            socket.rto = INITIAL_RTO;
        }
        match state {
            TcpState::SynRecv if !all_acked => return,
            TcpState::SynRecv => {
                let listener = socket.listener;
                self.set_state(id, TcpState::Established);
                if let Some(listener) = listener.and_then(|l| self.get_mut(l)) {
                    listener.accept_queue.push_back(id);
                }
            }
            TcpState::FinWait1 if all_acked => self.set_state(id, TcpState::FinWait2),
            TcpState::Closing if all_acked => {
                self.enter_time_wait(id, now);
                return;
            }
            TcpState::LastAck if all_acked => {
                self.finish(id, None);
                return;
            }
            _ => (),
        }

        if !flags.contains(TcpFlags::FIN) {
            return;
        }
        let Some(socket) = self.get_mut(id) else {
            return;
        };
        socket.rcv_nxt += 1;
        socket.fin_received = true;
        socket.send_ack(out);
        match socket.state {
            TcpState::SynRecv | TcpState::Established => self.set_state(id, TcpState::CloseWait),
            TcpState::FinWait1 => self.set_state(id, TcpState::Closing),
            TcpState::FinWait2 => self.enter_time_wait(id, now),
            _ => (),
        }
    }

    /// An acceptable RST arrived.
    fn reset(&mut self, id: SockId) {
        let Some(socket) = self.get(id) else {
            return;
        };
        if socket.state == TcpState::SynRecv && socket.listener.is_some() {
            net_trace!("{}: embryo {} reset", self.name, id);
            self.remove(id);
            return;
        }
        let error = match (socket.state, socket.connect) {
            (TcpState::TimeWait, _) => None,
            (TcpState::SynRecv, Connect::InProgress) => Some(libc::ECONNREFUSED),
            _ => Some(libc::ECONNRESET),
        };
        self.finish(id, error);
    }

    /// Fire every timer due at `now`.
    pub fn poll(&mut self, now: Instant, out: &mut Vec<Outgoing>) {
        for id in 0..self.sockets.len() {
            let Some(socket) = self.get_mut(id) else {
                continue;
            };
            if socket.time_wait_until.is_some_and(|t| t <= now) {
                self.finish(id, None);
                continue;
            }
            if socket.state == TcpState::SynSent && socket.give_up_at.is_some_and(|t| t <= now) {
                self.finish(id, Some(libc::ETIMEDOUT));
                continue;
            }
            if socket.retransmit_at.is_some_and(|t| t <= now) {
                socket.retransmit(out);
                socket.rto = if socket.rto * 2 < MAX_RTO {
                    socket.rto * 2
                } else {
                    MAX_RTO
                };
                socket.retransmit_at = Some(now + socket.rto);
            }
        }
    }
}

/// Answer a segment no socket claims.
fn reset_unknown(src: SocketAddr, dst: SocketAddr, segment: &Segment, out: &mut Vec<Outgoing>) {
    if segment.flags.contains(TcpFlags::RST) {
        return;
    }
    let (flags, seq_number, ack_number) = if segment.flags.contains(TcpFlags::ACK) {
        (TcpFlags::RST, segment.ack_number, SeqNumber::default())
    } else {
        (
            TcpFlags::RST | TcpFlags::ACK,
            SeqNumber::default(),
            segment.seq_number + segment.segment_len(),
        )
    };
    out.push(Outgoing {
        src: dst,
        dst: src,
        segment: Segment {
            src_port: dst.port(),
            dst_port: src.port(),
            seq_number,
            ack_number,
            flags,
            window_len: 0,
        },
    });
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn segment(flags: TcpFlags, seq: u32, ack: u32) -> Segment {
        Segment {
            src_port: 2000,
            dst_port: 1000,
            seq_number: SeqNumber(seq),
            ack_number: SeqNumber(ack),
            flags,
            window_len: 1000,
        }
    }

    fn at(secs: u64) -> Instant {
        Instant::ZERO + Duration::from_secs(secs)
    }

    const LOCAL: &str = "10.0.0.1:1000";
    const REMOTE: &str = "10.0.0.2:2000";

    fn connecting() -> (Kernel, Fd, Vec<Outgoing>) {
        let mut kernel = Kernel::new("host", 1000);
        let fd = kernel.socket();
        kernel.bind(fd, addr(LOCAL)).unwrap();
        let mut out = Vec::new();
        let err = kernel.connect(fd, addr(REMOTE), at(0), &mut out).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINPROGRESS));
        (kernel, fd, out)
    }

    fn state(kernel: &mut Kernel, fd: Fd) -> TcpState {
        TcpState::from_tcpi_state(kernel.tcpi_state(fd).unwrap())
    }

    #[test]
    fn test_active_open() {
        let (mut kernel, fd, out) = connecting();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].segment.flags, TcpFlags::SYN);
        assert_eq!(out[0].segment.seq_number, SeqNumber(1000));
        assert_eq!(state(&mut kernel, fd), TcpState::SynSent);

        let mut out = Vec::new();
        let err = kernel.connect(fd, addr(REMOTE), at(0), &mut out).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EALREADY));

        let synack = segment(TcpFlags::SYN | TcpFlags::ACK, 500, 1001);
        kernel.input(at(0), addr(REMOTE), addr(LOCAL), &synack, &mut out);
        assert_eq!(state(&mut kernel, fd), TcpState::Established);
        assert_eq!(out[0].segment.flags, TcpFlags::ACK);
        assert_eq!(out[0].segment.ack_number, SeqNumber(501));

        assert!(kernel.connect(fd, addr(REMOTE), at(0), &mut out).is_ok());
        let err = kernel.connect(fd, addr(REMOTE), at(0), &mut out).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EISCONN));
    }

    #[test]
    fn test_syn_retransmit_and_give_up() {
        let (mut kernel, fd, _) = connecting();
        let mut out = Vec::new();
        let mut now = at(0);
        while let Some(deadline) = kernel.next_deadline() {
            now = deadline;
            kernel.poll(now, &mut out);
        }
        assert_eq!(now, at(127));
        // At 1, 3, 7, 15, 31, 63 and, with the backoff capped, 123 s.
        assert_eq!(out.len(), 7);
        assert!(out.iter().all(|o| o.segment.flags == TcpFlags::SYN));
        assert_eq!(state(&mut kernel, fd), TcpState::Closed);

        let err = kernel.connect(fd, addr(REMOTE), now, &mut out).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
    }

    #[test]
    fn test_passive_open_and_accept() {
        let mut kernel = Kernel::new("host", 7000);
        let listener = kernel.socket();
        kernel.bind(listener, addr(LOCAL)).unwrap();
        kernel.listen(listener, 1).unwrap();
        let mut out = Vec::new();

        kernel.input(at(0), addr(REMOTE), addr(LOCAL), &segment(TcpFlags::SYN, 100, 0), &mut out);
        assert_eq!(out[0].segment.flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(out[0].segment.ack_number, SeqNumber(101));
        assert_eq!(
            kernel.accept(listener).unwrap_err().raw_os_error(),
            Some(libc::EAGAIN)
        );

        // A retransmitted SYN gets the SYN-ACK again.
        out.clear();
        kernel.input(at(1), addr(REMOTE), addr(LOCAL), &segment(TcpFlags::SYN, 100, 0), &mut out);
        assert_eq!(out[0].segment.flags, TcpFlags::SYN | TcpFlags::ACK);

        kernel.input(
            at(1),
            addr(REMOTE),
            addr(LOCAL),
            &segment(TcpFlags::ACK, 101, 7001),
            &mut out,
        );
        let fd = kernel.accept(listener).unwrap();
        assert_eq!(state(&mut kernel, fd), TcpState::Established);
        assert_eq!(state(&mut kernel, listener), TcpState::Listen);
    }

    #[test]
    fn test_close_sequence() {
        let (mut kernel, fd, _) = connecting();
        let mut out = Vec::new();
        let synack = segment(TcpFlags::SYN | TcpFlags::ACK, 500, 1001);
        kernel.input(at(0), addr(REMOTE), addr(LOCAL), &synack, &mut out);

        kernel.shutdown(fd, Shutdown::Write, at(1), &mut out).unwrap();
        assert_eq!(state(&mut kernel, fd), TcpState::FinWait1);
        kernel.input(
            at(1),
            addr(REMOTE),
            addr(LOCAL),
            &segment(TcpFlags::ACK, 501, 1002),
            &mut out,
        );
        assert_eq!(state(&mut kernel, fd), TcpState::FinWait2);
        kernel.input(
            at(2),
            addr(REMOTE),
            addr(LOCAL),
            &segment(TcpFlags::FIN | TcpFlags::ACK, 501, 1002),
            &mut out,
        );
        assert_eq!(state(&mut kernel, fd), TcpState::TimeWait);

        kernel.poll(at(121), &mut out);
        assert_eq!(state(&mut kernel, fd), TcpState::TimeWait);
        kernel.poll(at(122), &mut out);
        assert_eq!(state(&mut kernel, fd), TcpState::Closed);
    }

    #[test]
    fn test_rst_needs_exact_sequence() {
        let (mut kernel, fd, _) = connecting();
        let mut out = Vec::new();
        let synack = segment(TcpFlags::SYN | TcpFlags::ACK, 500, 1001);
        kernel.input(at(0), addr(REMOTE), addr(LOCAL), &synack, &mut out);

        out.clear();
        kernel.input(at(0), addr(REMOTE), addr(LOCAL), &segment(TcpFlags::RST, 900, 0), &mut out);
        assert_eq!(state(&mut kernel, fd), TcpState::Established);
        assert!(out.is_empty());

        kernel.input(at(0), addr(REMOTE), addr(LOCAL), &segment(TcpFlags::RST, 501, 0), &mut out);
        assert_eq!(state(&mut kernel, fd), TcpState::Closed);
        assert_eq!(kernel.recv(fd).unwrap_err().raw_os_error(), Some(libc::ECONNRESET));
    }

    #[test]
    fn test_no_socket_answers_rst() {
        let mut kernel = Kernel::new("host", 0);
        let mut out = Vec::new();
        kernel.input(at(0), addr(REMOTE), addr(LOCAL), &segment(TcpFlags::SYN, 41, 0), &mut out);
        assert_eq!(out[0].segment.flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(out[0].segment.ack_number, SeqNumber(42));
        assert_eq!(out[0].dst, addr(REMOTE));

        out.clear();
        kernel.input(at(0), addr(REMOTE), addr(LOCAL), &segment(TcpFlags::ACK, 41, 77), &mut out);
        assert_eq!(out[0].segment.flags, TcpFlags::RST);
        assert_eq!(out[0].segment.seq_number, SeqNumber(77));
    }

    #[test]
    fn test_abortive_close() {
        let (mut kernel, fd, _) = connecting();
        let mut out = Vec::new();
        let synack = segment(TcpFlags::SYN | TcpFlags::ACK, 500, 1001);
        kernel.input(at(0), addr(REMOTE), addr(LOCAL), &synack, &mut out);
        kernel.set_linger(fd, Some(Duration::ZERO)).unwrap();

        out.clear();
        kernel.close(fd, at(0), &mut out).unwrap();
        assert_eq!(out[0].segment.flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(out[0].segment.seq_number, SeqNumber(1001));
        assert_eq!(kernel.socket_count(), 0);
        assert_eq!(kernel.open_fds(), 0);
    }

    #[test]
    fn test_close_all_releases_descriptors() {
        let (mut kernel, fd, _) = connecting();
        let idle = kernel.socket();
        let mut out = Vec::new();
        let synack = segment(TcpFlags::SYN | TcpFlags::ACK, 500, 1001);
        kernel.input(at(0), addr(REMOTE), addr(LOCAL), &synack, &mut out);
        assert_eq!(kernel.open_fds(), 2);

        out.clear();
        kernel.close_all(at(1), &mut out);
        assert_eq!(kernel.open_fds(), 0);
        assert!(out[0].segment.flags.contains(TcpFlags::FIN));
        assert_eq!(
            kernel.tcpi_state(fd).unwrap_err().raw_os_error(),
            Some(libc::EBADF)
        );
        assert!(kernel.tcpi_state(idle).is_err());
    }

    #[test]
    fn test_fresh_socket_reports_close() {
        let mut kernel = Kernel::new("host", 0);
        let fd = kernel.socket();
        assert_eq!(kernel.tcpi_state(fd).unwrap(), 7);
        assert_eq!(
            kernel.tcpi_state(fd + 1).unwrap_err().raw_os_error(),
            Some(libc::EBADF)
        );
    }

    #[test]
    fn test_accepted_socket_inherits_linger() {
        let mut kernel = Kernel::new("host", 7000);
        let listener = kernel.socket();
        kernel.set_linger(listener, Some(Duration::ZERO)).unwrap();
        kernel.bind(listener, addr(LOCAL)).unwrap();
        kernel.listen(listener, 1).unwrap();
        let mut out = Vec::new();
        kernel.input(at(0), addr(REMOTE), addr(LOCAL), &segment(TcpFlags::SYN, 100, 0), &mut out);
        kernel.input(
            at(0),
            addr(REMOTE),
            addr(LOCAL),
            &segment(TcpFlags::ACK, 101, 7001),
            &mut out,
        );
        let fd = kernel.accept(listener).unwrap();

        out.clear();
        kernel.close(fd, at(1), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].segment.flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(out[0].segment.seq_number, SeqNumber(7001));
    }

    #[test]
    fn test_bind_conflict() {
        let mut kernel = Kernel::new("host", 0);
        let a = kernel.socket();
        let b = kernel.socket();
        kernel.bind(a, addr(LOCAL)).unwrap();
        assert_eq!(
            kernel.bind(b, addr(LOCAL)).unwrap_err().raw_os_error(),
            Some(libc::EADDRINUSE)
        );
        kernel.set_reuse_addr(a, true).unwrap();
        kernel.set_reuse_addr(b, true).unwrap();
        kernel.bind(b, addr(LOCAL)).unwrap();
    }
}
