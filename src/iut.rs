use std::io;
use std::net::{Shutdown, SocketAddr};

use crate::agent::{self, Fd, Family, SocketApi};
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::state::TcpState;

/// Result of a non-blocking connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    InProgress,
}

fn iut_error(call: &str, err: io::Error) -> Error {
    Error::io(ErrorKind::IutCallFailed, call, err)
}

/// The socket under test.
///
/// After a passive open the accepted socket becomes the main one and the
/// listener is kept as an auxiliary socket until [close](#method.close).
pub struct IutDriver {
    api: Box<dyn SocketApi>,
    endpoint: Endpoint,
    fd: Option<Fd>,
    listener: Option<Fd>,
    listening: bool,
    connect_pending: bool,
}

impl IutDriver {
    pub fn new(api: Box<dyn SocketApi>, endpoint: Endpoint) -> IutDriver {
        IutDriver {
            api,
            endpoint,
            fd: None,
            listener: None,
            listening: false,
            connect_pending: false,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn fd(&self) -> Option<Fd> {
        self.fd
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn connect_pending(&self) -> bool {
        self.connect_pending
    }

    fn main_fd(&self) -> Result<Fd> {
        self.fd
            .ok_or_else(|| Error::new(ErrorKind::IutCallFailed, "IUT socket is not open"))
    }

    /// Create the socket, bind it to the endpoint and make it non-blocking.
    pub fn open(&mut self) -> Result<Fd> {
        let family = Family::of(&self.endpoint.ip());
        let fd = self.api.socket(family).map_err(|e| iut_error("socket", e))?;
        self.fd = Some(fd);
        self.api
            .bind(fd, self.endpoint.addr)
            .map_err(|e| iut_error("bind", e))?;
        self.api
            .set_nonblocking(fd, true)
            .map_err(|e| iut_error("fcntl(O_NONBLOCK)", e))?;
        net_debug!("iut {}: socket {} bound to {}", self.api.agent(), fd, self.endpoint.addr);
        Ok(fd)
    }

    pub fn listen(&mut self, backlog: i32) -> Result<()> {
        let fd = self.main_fd()?;
        self.api
            .listen(fd, backlog)
            .map_err(|e| iut_error("listen", e))?;
        self.listening = true;
        Ok(())
    }

    /// Start or continue a non-blocking connect.
    pub fn connect(&mut self, remote: SocketAddr) -> Result<ConnectStatus> {
        let fd = self.main_fd()?;
        match self.api.connect(fd, remote) {
            Ok(()) => {
                self.connect_pending = false;
                Ok(ConnectStatus::Connected)
            }
            Err(err) if agent::connect_pending(&err) => {
                self.connect_pending = true;
                Ok(ConnectStatus::InProgress)
            }
            Err(err) if agent::is_errno(&err, libc::EISCONN) => {
                self.connect_pending = false;
                Ok(ConnectStatus::Connected)
            }
            Err(err) => {
                self.connect_pending = false;
                Err(iut_error("connect", err))
            }
        }
    }

    /// Forget a pending connect without completing it.
    pub fn abandon_connect(&mut self) {
        self.connect_pending = false;
    }

    /// Accept a connection on the listening socket. `Ok(None)` means none
    /// is ready yet.
    pub fn accept(&mut self) -> Result<Option<Fd>> {
        let listener = self.main_fd()?;
        let fd = match self.api.accept(listener) {
            Ok(fd) => fd,
            Err(err) if agent::would_block(&err) => return Ok(None),
            Err(err) => return Err(iut_error("accept", err)),
        };
        self.listener = Some(listener);
        self.fd = Some(fd);
        self.listening = false;
        self.api
            .set_nonblocking(fd, true)
            .map_err(|e| iut_error("fcntl(O_NONBLOCK)", e))?;
        net_debug!("iut {}: accepted socket {}", self.api.agent(), fd);
        Ok(Some(fd))
    }

    pub fn shutdown_write(&mut self) -> Result<()> {
        let fd = self.main_fd()?;
        self.api
            .shutdown(fd, Shutdown::Write)
            .map_err(|e| iut_error("shutdown(SHUT_WR)", e))
    }

    /// Read the state from `TCP_INFO`.
    pub fn query_state(&mut self) -> Result<TcpState> {
        let fd = self.main_fd()?;
        let raw = self
            .api
            .tcp_info_state(fd)
            .map_err(|e| iut_error("getsockopt(TCP_INFO)", e))?;
        let state = TcpState::from_tcpi_state(raw);
        net_trace!("iut {}: socket {} is {}", self.api.agent(), fd, state);
        Ok(state)
    }

    /// Close the listener kept after a passive open, then the main socket.
    ///
    /// Both are attempted; the first failure is returned.
    pub fn close(&mut self) -> Result<()> {
        let mut result = Ok(());
        for fd in [self.listener.take(), self.fd.take()].into_iter().flatten() {
            if let Err(err) = self.api.close(fd) {
                net_error!("iut {}: close({}) failed: {}", self.api.agent(), fd, err);
                if result.is_ok() {
                    result = Err(iut_error("close", err));
                }
            }
        }
        self.listening = false;
        self.connect_pending = false;
        result
    }
}
