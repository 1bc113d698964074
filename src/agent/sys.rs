//! Socket calls on the local host, for an IUT that runs in the same
//! process as the driver.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub use self::linux::LocalSockets;
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::net::{Shutdown, SocketAddr};
    use std::{io, mem, ptr};

    use crate::agent::{Fd, Family, SocketApi};
    use crate::time::Duration;

    fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret)
        }
    }

    fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
        // SAFETY: sockaddr_storage is plain old data and large enough for
        // either address family.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = match addr {
            SocketAddr::V4(addr) => {
                let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = addr.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                };
                unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(addr) => {
                let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = addr.port().to_be();
                sin6.sin6_flowinfo = addr.flowinfo();
                sin6.sin6_scope_id = addr.scope_id();
                sin6.sin6_addr = libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                };
                unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
                mem::size_of::<libc::sockaddr_in6>()
            }
        };
        (storage, len as libc::socklen_t)
    }

    fn setsockopt<T>(fd: Fd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        cvt(ret).map(|_| ())
    }

    /// Berkeley sockets of this process.
    #[derive(Debug, Clone)]
    pub struct LocalSockets {
        agent: String,
    }

    impl LocalSockets {
        pub fn new(agent: impl Into<String>) -> LocalSockets {
            LocalSockets {
                agent: agent.into(),
            }
        }
    }

    impl SocketApi for LocalSockets {
        fn agent(&self) -> &str {
            &self.agent
        }

        fn socket(&mut self, family: Family) -> io::Result<Fd> {
            let domain = match family {
                Family::Ipv4 => libc::AF_INET,
                Family::Ipv6 => libc::AF_INET6,
            };
            cvt(unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) })
        }

        fn bind(&mut self, fd: Fd, addr: SocketAddr) -> io::Result<()> {
            let (storage, len) = sockaddr_of(&addr);
            let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
            cvt(ret).map(|_| ())
        }

        fn set_nonblocking(&mut self, fd: Fd, nonblocking: bool) -> io::Result<()> {
            let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
            let flags = if nonblocking {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            };
            cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }).map(|_| ())
        }

        fn set_reuse_addr(&mut self, fd: Fd, reuse: bool) -> io::Result<()> {
            let value = reuse as libc::c_int;
            setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &value)
        }

        fn set_linger(&mut self, fd: Fd, linger: Option<Duration>) -> io::Result<()> {
            let value = libc::linger {
                l_onoff: linger.is_some() as libc::c_int,
                l_linger: linger.map_or(0, |d| d.secs() as libc::c_int),
            };
            setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, &value)
        }

        fn connect(&mut self, fd: Fd, addr: SocketAddr) -> io::Result<()> {
            let (storage, len) = sockaddr_of(&addr);
            let ret =
                unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
            cvt(ret).map(|_| ())
        }

        fn listen(&mut self, fd: Fd, backlog: i32) -> io::Result<()> {
            cvt(unsafe { libc::listen(fd, backlog) }).map(|_| ())
        }

        fn accept(&mut self, fd: Fd) -> io::Result<Fd> {
            let flags = libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
            cvt(unsafe { libc::accept4(fd, ptr::null_mut(), ptr::null_mut(), flags) })
        }

        fn shutdown(&mut self, fd: Fd, how: Shutdown) -> io::Result<()> {
            let how = match how {
                Shutdown::Read => libc::SHUT_RD,
                Shutdown::Write => libc::SHUT_WR,
                Shutdown::Both => libc::SHUT_RDWR,
            };
            cvt(unsafe { libc::shutdown(fd, how) }).map(|_| ())
        }

        fn close(&mut self, fd: Fd) -> io::Result<()> {
            cvt(unsafe { libc::close(fd) }).map(|_| ())
        }

        fn recv(&mut self, fd: Fd, buf: &mut [u8]) -> io::Result<usize> {
            let ret = unsafe {
                libc::recv(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if ret < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(ret as usize)
            }
        }

        fn tcp_info_state(&mut self, fd: Fd) -> io::Result<u8> {
            let mut info: libc::tcp_info = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::tcp_info>() as libc::socklen_t;
            let ret = unsafe {
                libc::getsockopt(
                    fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_INFO,
                    &mut info as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            cvt(ret)?;
            Ok(info.tcpi_state)
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;
        use crate::state::TcpState;

        #[test]
        fn test_fresh_socket_is_closed() {
            let mut api = LocalSockets::new("local");
            let fd = api.socket(Family::Ipv4).unwrap();
            let raw = api.tcp_info_state(fd).unwrap();
            assert_eq!(TcpState::from_tcpi_state(raw), TcpState::Closed);
            api.close(fd).unwrap();
        }

        #[test]
        fn test_listen_is_observed() {
            let mut api = LocalSockets::new("local");
            let fd = api.socket(Family::Ipv4).unwrap();
            api.set_reuse_addr(fd, true).unwrap();
            api.set_linger(fd, Some(Duration::ZERO)).unwrap();
            api.bind(fd, "127.0.0.1:0".parse().unwrap()).unwrap();
            api.listen(fd, 1).unwrap();
            let raw = api.tcp_info_state(fd).unwrap();
            assert_eq!(TcpState::from_tcpi_state(raw), TcpState::Listen);

            api.set_nonblocking(fd, true).unwrap();
            let err = api.accept(fd).unwrap_err();
            assert!(crate::agent::would_block(&err));
            api.close(fd).unwrap();
        }

        fn local_port(fd: Fd) -> u16 {
            let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let ret = unsafe {
                libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
            };
            cvt(ret).unwrap();
            u16::from_be(addr.sin_port)
        }

        #[test]
        fn test_accepted_socket_flags() {
            let mut api = LocalSockets::new("local");
            let fd = api.socket(Family::Ipv4).unwrap();
            api.bind(fd, "127.0.0.1:0".parse().unwrap()).unwrap();
            api.listen(fd, 1).unwrap();
            let port = local_port(fd);

            let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
            let child = api.accept(fd).unwrap();
            let status = cvt(unsafe { libc::fcntl(child, libc::F_GETFL) }).unwrap();
            assert_ne!(status & libc::O_NONBLOCK, 0);
            let fd_flags = cvt(unsafe { libc::fcntl(child, libc::F_GETFD) }).unwrap();
            assert_ne!(fd_flags & libc::FD_CLOEXEC, 0);
            let raw = api.tcp_info_state(child).unwrap();
            assert_eq!(TcpState::from_tcpi_state(raw), TcpState::Established);

            api.close(child).unwrap();
            api.close(fd).unwrap();
        }
    }
}
