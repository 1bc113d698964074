use std::io;
use std::net::{Shutdown, SocketAddr};
use std::rc::Rc;

use crate::agent::{self, Fd, Family, RstInjector, SocketApi};
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::time::{Clock, Duration};

fn peer_error(call: &str, err: io::Error) -> Error {
    Error::io(ErrorKind::PeerSendFailed, call, err)
}

/// A kernel socket acting as the peer.
///
/// Every socket this peer creates has `SO_LINGER` set to zero, so that
/// closing it aborts the connection with RST instead of sending FIN.
/// When the peer accepts a connection, the accepted socket becomes the
/// main one and the listener is kept aside until the peer is destroyed.
pub struct SocketPeer {
    api: Box<dyn SocketApi>,
    endpoint: Endpoint,
    remote: SocketAddr,
    clock: Rc<dyn Clock>,
    injector: Option<Box<dyn RstInjector>>,
    reuse_addr: bool,
    retry_step: Duration,
    fd: Option<Fd>,
    aux: Option<Fd>,
    connect_pending: bool,
}

impl SocketPeer {
    /// Create a peer bound to `endpoint` that talks to `remote`. No socket
    /// is created until [open](#method.open).
    pub fn new(
        api: Box<dyn SocketApi>,
        endpoint: Endpoint,
        remote: SocketAddr,
        clock: Rc<dyn Clock>,
    ) -> SocketPeer {
        SocketPeer {
            api,
            endpoint,
            remote,
            clock,
            injector: None,
            reuse_addr: false,
            retry_step: Duration::from_millis(10),
            fd: None,
            aux: None,
            connect_pending: false,
        }
    }

    /// Set `SO_REUSEADDR` on every socket the peer creates.
    pub fn with_reuse_addr(mut self, reuse_addr: bool) -> SocketPeer {
        self.reuse_addr = reuse_addr;
        self
    }

    /// Use `injector` to reset connections the kernel will not reset.
    pub fn with_injector(mut self, injector: Option<Box<dyn RstInjector>>) -> SocketPeer {
        self.injector = injector;
        self
    }

    pub fn with_retry_step(mut self, step: Duration) -> SocketPeer {
        self.retry_step = step;
        self
    }

    pub fn fd(&self) -> Option<Fd> {
        self.fd
    }

    pub fn aux_fd(&self) -> Option<Fd> {
        self.aux
    }

    pub fn connect_pending(&self) -> bool {
        self.connect_pending
    }

    /// Create the main socket and, with a backlog, make it listen for the
    /// IUT. Arms the RST injector if there is one.
    ///
    /// On failure everything acquired so far is released again.
    pub fn open(&mut self, backlog: Option<i32>) -> Result<()> {
        let result = self.try_open(backlog);
        if result.is_err() {
            if let Err(err) = self.destroy() {
                net_error!("peer {}: cleanup after failed open: {}", self.api.agent(), err);
            }
        }
        result
    }

    fn try_open(&mut self, backlog: Option<i32>) -> Result<()> {
        let fd = self.create_socket()?;
        if let Some(backlog) = backlog {
            self.api
                .listen(fd, backlog)
                .map_err(|e| peer_error("listen", e))?;
            net_debug!("peer {}: listening on {}", self.api.agent(), self.endpoint.addr);
        }
        if let Some(injector) = self.injector.as_mut() {
            injector
                .arm(self.endpoint.addr, self.remote)
                .map_err(|e| peer_error("arm RST injector", e))?;
        }
        Ok(())
    }

    fn create_socket(&mut self) -> Result<Fd> {
        let family = Family::of(&self.endpoint.ip());
        let fd = self.api.socket(family).map_err(|e| peer_error("socket", e))?;
        self.fd = Some(fd);
        self.api
            .set_linger(fd, Some(Duration::ZERO))
            .map_err(|e| peer_error("setsockopt(SO_LINGER)", e))?;
        if self.reuse_addr {
            self.api
                .set_reuse_addr(fd, true)
                .map_err(|e| peer_error("setsockopt(SO_REUSEADDR)", e))?;
        }
        self.api
            .bind(fd, self.endpoint.addr)
            .map_err(|e| peer_error("bind", e))?;
        Ok(fd)
    }

    fn close_all(&mut self) -> Result<()> {
        let mut result = Ok(());
        for fd in [self.aux.take(), self.fd.take()].into_iter().flatten() {
            if let Err(err) = self.api.close(fd) {
                net_error!("peer {}: close({}) failed: {}", self.api.agent(), fd, err);
                if result.is_ok() {
                    result = Err(peer_error("close", err));
                }
            }
        }
        self.connect_pending = false;
        result
    }

    /// Replace every peer socket with a fresh, bound, non-listening one.
    pub fn recreate(&mut self) -> Result<Fd> {
        self.close_all()?;
        self.create_socket()
    }

    /// Emit SYN: a non-blocking connect from a fresh socket.
    pub fn send_syn(&mut self) -> Result<()> {
        let fd = self.recreate()?;
        self.api
            .set_nonblocking(fd, true)
            .map_err(|e| peer_error("fcntl(O_NONBLOCK)", e))?;
        match self.api.connect(fd, self.remote) {
            Ok(()) => self.connect_pending = false,
            Err(err) if agent::connect_pending(&err) => self.connect_pending = true,
            Err(err) => return Err(peer_error("connect", err)),
        }
        net_debug!("peer {}: connecting to {}", self.api.agent(), self.remote);
        Ok(())
    }

    /// Wait for a pending connect to complete.
    pub fn finish_connect(&mut self, budget: Duration) -> Result<()> {
        let fd = self.main_fd()?;
        let deadline = self.clock.now() + budget;
        loop {
            match self.api.connect(fd, self.remote) {
                Ok(()) => break,
                Err(err) if agent::is_errno(&err, libc::EISCONN) => break,
                Err(err) if agent::connect_pending(&err) => {
                    if self.clock.now() >= deadline {
                        return Err(Error::new(
                            ErrorKind::Timeout,
                            format!("connect to {} did not complete", self.remote),
                        ));
                    }
                    self.clock.sleep(self.retry_step);
                }
                Err(err) => {
                    self.connect_pending = false;
                    return Err(peer_error("connect", err));
                }
            }
        }
        self.connect_pending = false;
        net_debug!("peer {}: connected to {}", self.api.agent(), self.remote);
        Ok(())
    }

    /// Accept the IUT's connection on the listening socket.
    pub fn accept(&mut self, budget: Duration) -> Result<()> {
        let listener = self.main_fd()?;
        self.api
            .set_nonblocking(listener, true)
            .map_err(|e| peer_error("fcntl(O_NONBLOCK)", e))?;
        let deadline = self.clock.now() + budget;
        let fd = loop {
            match self.api.accept(listener) {
                Ok(fd) => break fd,
                Err(err) if agent::would_block(&err) => {
                    if self.clock.now() >= deadline {
                        return Err(Error::new(ErrorKind::Timeout, "nothing to accept"));
                    }
                    self.clock.sleep(self.retry_step);
                }
                Err(err) => return Err(peer_error("accept", err)),
            }
        };
        self.aux = Some(listener);
        self.fd = Some(fd);
        self.api
            .set_linger(fd, Some(Duration::ZERO))
            .map_err(|e| peer_error("setsockopt(SO_LINGER)", e))?;
        net_debug!("peer {}: accepted socket {}", self.api.agent(), fd);
        Ok(())
    }

    /// Emit FIN by shutting down the write side.
    pub fn send_fin(&mut self) -> Result<()> {
        let fd = self.main_fd()?;
        self.api
            .shutdown(fd, Shutdown::Write)
            .map_err(|e| peer_error("shutdown(SHUT_WR)", e))
    }

    /// Abort the connection.
    ///
    /// With a connect still pending the socket has nothing to abort yet,
    /// so the whole peer agent is restarted instead. Otherwise both
    /// sockets are closed, which sends RST because of the zero linger.
    pub fn send_rst(&mut self) -> Result<()> {
        if self.connect_pending {
            net_info!("peer {}: restarting to drop a pending connect", self.api.agent());
            self.api.restart().map_err(|e| peer_error("restart", e))?;
            self.fd = None;
            self.aux = None;
            self.connect_pending = false;
            return Ok(());
        }
        self.close_all()
    }

    /// Reset a connection the kernel no longer answers for.
    ///
    /// The injector saw the SYN-ACK this peer sent when the connection was
    /// opened. The RST carries that ISN advanced past the SYN and the FIN,
    /// and acknowledges what the SYN-ACK acknowledged.
    pub fn send_rst_injected(&mut self) -> Result<()> {
        let injector = self.injector.as_mut().ok_or_else(|| {
            Error::new(
                ErrorKind::BackendUnsupported,
                "no RST injector for a connection in TIME_WAIT",
            )
        })?;
        let synack = injector
            .catch()
            .map_err(|e| peer_error("catch SYN-ACK", e))?;
        let seq_number = synack.seq_number + 2;
        let ack_number = synack.ack_number;
        injector
            .send(seq_number, ack_number)
            .map_err(|e| peer_error("inject RST", e))?;
        net_debug!("peer: injected RST seq={} ack={}", seq_number, ack_number);
        Ok(())
    }

    /// Close every socket and disarm the injector. All steps are
    /// attempted; the first failure is returned.
    pub fn destroy(&mut self) -> Result<()> {
        let mut result = self.close_all();
        if let Some(injector) = self.injector.as_mut() {
            if let Err(err) = injector.disarm() {
                net_error!("peer: disarm RST injector: {}", err);
                if result.is_ok() {
                    result = Err(peer_error("disarm RST injector", err));
                }
            }
        }
        result
    }

    fn main_fd(&self) -> Result<Fd> {
        self.fd
            .ok_or_else(|| Error::new(ErrorKind::PeerSendFailed, "peer socket is not open"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::agent::CaughtSynAck;
    use crate::time::Instant;
    use crate::wire::{EthernetAddress, SeqNumber};
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct Script {
        calls: Vec<String>,
        next_fd: Fd,
        connect: Vec<io::Result<()>>,
        accept: Vec<io::Result<Fd>>,
        fail_bind: bool,
    }

    struct ScriptedApi(Rc<RefCell<Script>>);

    impl SocketApi for ScriptedApi {
        fn agent(&self) -> &str {
            "tst"
        }
        fn socket(&mut self, _family: Family) -> io::Result<Fd> {
            let mut script = self.0.borrow_mut();
            script.next_fd += 1;
            let fd = script.next_fd + 10;
            script.calls.push(format!("socket {}", fd));
            Ok(fd)
        }
        fn bind(&mut self, fd: Fd, _addr: SocketAddr) -> io::Result<()> {
            let mut script = self.0.borrow_mut();
            script.calls.push(format!("bind {}", fd));
            if script.fail_bind {
                return Err(io::Error::from_raw_os_error(libc::EADDRINUSE));
            }
            Ok(())
        }
        fn set_nonblocking(&mut self, _fd: Fd, _on: bool) -> io::Result<()> {
            Ok(())
        }
        fn set_reuse_addr(&mut self, fd: Fd, _on: bool) -> io::Result<()> {
            self.0.borrow_mut().calls.push(format!("reuse {}", fd));
            Ok(())
        }
        fn set_linger(&mut self, fd: Fd, linger: Option<Duration>) -> io::Result<()> {
            assert_eq!(linger, Some(Duration::ZERO));
            self.0.borrow_mut().calls.push(format!("linger {}", fd));
            Ok(())
        }
        fn connect(&mut self, _fd: Fd, _addr: SocketAddr) -> io::Result<()> {
            self.0.borrow_mut().connect.remove(0)
        }
        fn listen(&mut self, fd: Fd, _backlog: i32) -> io::Result<()> {
            self.0.borrow_mut().calls.push(format!("listen {}", fd));
            Ok(())
        }
        fn accept(&mut self, _fd: Fd) -> io::Result<Fd> {
            self.0.borrow_mut().accept.remove(0)
        }
        fn shutdown(&mut self, fd: Fd, _how: Shutdown) -> io::Result<()> {
            self.0.borrow_mut().calls.push(format!("shutdown {}", fd));
            Ok(())
        }
        fn close(&mut self, fd: Fd) -> io::Result<()> {
            self.0.borrow_mut().calls.push(format!("close {}", fd));
            Ok(())
        }
        fn recv(&mut self, _fd: Fd, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(libc::EAGAIN))
        }
        fn tcp_info_state(&mut self, _fd: Fd) -> io::Result<u8> {
            Ok(7)
        }
        fn restart(&mut self) -> io::Result<()> {
            self.0.borrow_mut().calls.push("restart".into());
            Ok(())
        }
    }

    struct StepClock(Cell<i64>);

    impl Clock for StepClock {
        fn now(&self) -> Instant {
            Instant::from_micros(self.0.get())
        }
        fn sleep(&self, duration: Duration) {
            self.0.set(self.0.get() + duration.total_micros() as i64);
        }
    }

    #[derive(Default)]
    struct Injected {
        armed: bool,
        sent: Option<(SeqNumber, SeqNumber)>,
    }

    struct FakeInjector(Rc<RefCell<Injected>>);

    impl RstInjector for FakeInjector {
        fn arm(&mut self, _local: SocketAddr, _remote: SocketAddr) -> io::Result<()> {
            self.0.borrow_mut().armed = true;
            Ok(())
        }
        fn catch(&mut self) -> io::Result<CaughtSynAck> {
            Ok(CaughtSynAck {
                seq_number: SeqNumber(1000),
                ack_number: SeqNumber(5001),
            })
        }
        fn send(&mut self, seq_number: SeqNumber, ack_number: SeqNumber) -> io::Result<()> {
            self.0.borrow_mut().sent = Some((seq_number, ack_number));
            Ok(())
        }
        fn disarm(&mut self) -> io::Result<()> {
            self.0.borrow_mut().armed = false;
            Ok(())
        }
    }

    fn peer() -> (SocketPeer, Rc<RefCell<Script>>) {
        let script = Rc::new(RefCell::new(Script::default()));
        let endpoint = Endpoint::new(
            "tst",
            "eth0",
            "10.0.0.2:6000".parse().unwrap(),
            EthernetAddress([0x02, 0, 0, 0, 0, 2]),
        );
        let peer = SocketPeer::new(
            Box::new(ScriptedApi(script.clone())),
            endpoint,
            "10.0.0.1:5000".parse().unwrap(),
            Rc::new(StepClock(Cell::new(0))),
        );
        (peer, script)
    }

    #[test]
    fn test_open_listening() {
        let (mut peer, script) = peer();
        peer = peer.with_reuse_addr(true);
        peer.open(Some(1)).unwrap();
        assert_eq!(
            script.borrow().calls,
            vec!["socket 11", "linger 11", "reuse 11", "bind 11", "listen 11"]
        );
    }

    #[test]
    fn test_open_failure_cleans_up() {
        let (mut peer, script) = peer();
        script.borrow_mut().fail_bind = true;
        let err = peer.open(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerSendFailed);
        assert_eq!(peer.fd(), None);
        assert_eq!(script.borrow().calls.last().unwrap(), "close 11");
    }

    #[test]
    fn test_syn_then_finish_connect() {
        let (mut peer, script) = peer();
        peer.open(Some(1)).unwrap();
        script.borrow_mut().connect = vec![
            Err(io::Error::from_raw_os_error(libc::EINPROGRESS)),
            Err(io::Error::from_raw_os_error(libc::EALREADY)),
            Err(io::Error::from_raw_os_error(libc::EISCONN)),
        ];
        peer.send_syn().unwrap();
        assert!(peer.connect_pending());
        assert_eq!(peer.fd(), Some(12));
        peer.finish_connect(Duration::from_secs(1)).unwrap();
        assert!(!peer.connect_pending());
    }

    #[test]
    fn test_finish_connect_times_out() {
        let (mut peer, script) = peer();
        peer.open(None).unwrap();
        script.borrow_mut().connect = (0..200)
            .map(|_| Err(io::Error::from_raw_os_error(libc::EALREADY)))
            .collect();
        let err = peer.finish_connect(Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_accept_keeps_listener() {
        let (mut peer, script) = peer();
        peer.open(Some(1)).unwrap();
        script.borrow_mut().accept = vec![Err(io::Error::from_raw_os_error(libc::EAGAIN)), Ok(30)];
        peer.accept(Duration::from_secs(1)).unwrap();
        assert_eq!(peer.fd(), Some(30));
        assert_eq!(peer.aux_fd(), Some(11));
        assert_eq!(script.borrow().calls.last().unwrap(), "linger 30");

        peer.send_rst().unwrap();
        let calls = script.borrow().calls.clone();
        assert_eq!(&calls[calls.len() - 2..], ["close 11", "close 30"]);
        assert_eq!(peer.fd(), None);
    }

    #[test]
    fn test_rst_with_pending_connect_restarts() {
        let (mut peer, script) = peer();
        peer.open(None).unwrap();
        script.borrow_mut().connect = vec![Err(io::Error::from_raw_os_error(libc::EINPROGRESS))];
        peer.send_syn().unwrap();
        peer.send_rst().unwrap();
        assert_eq!(script.borrow().calls.last().unwrap(), "restart");
        assert!(!peer.connect_pending());
        assert_eq!(peer.fd(), None);
    }

    #[test]
    fn test_injected_rst_numbers() {
        let (peer, _script) = peer();
        let injected = Rc::new(RefCell::new(Injected::default()));
        let mut peer = peer.with_injector(Some(Box::new(FakeInjector(injected.clone()))));
        peer.open(Some(1)).unwrap();
        assert!(injected.borrow().armed);

        peer.send_rst_injected().unwrap();
        assert_eq!(injected.borrow().sent, Some((SeqNumber(1002), SeqNumber(5001))));

        peer.destroy().unwrap();
        assert!(!injected.borrow().armed);
    }

    #[test]
    fn test_injected_rst_needs_injector() {
        let (mut peer, _script) = peer();
        peer.open(Some(1)).unwrap();
        let err = peer.send_rst_injected().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnsupported);
    }
}
