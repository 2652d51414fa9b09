use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use log::*;
use nix::errno::Errno;
use nix::sys::socket::{self, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage};

/// Resolve a host/port pair. Multi-stack hosts expand to several addresses;
/// the client uses the first, the server listens on all of them.
pub fn resolve_addr(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address for {}:{}", host, port),
        ));
    }
    Ok(addrs)
}

#[inline]
fn family_of(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

fn new_socket(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let fd = socket::socket(family_of(addr), SockType::Stream, SockFlag::SOCK_NONBLOCK, None)
        .map_err(io::Error::from)?;
    socket::setsockopt(&fd, sockopt::TcpNoDelay, &true).map_err(io::Error::from)?;
    Ok(fd)
}

fn set_buf_sizes<F: AsFd>(fd: &F, rbuf: usize, sbuf: usize) -> io::Result<()> {
    socket::setsockopt(fd, sockopt::RcvBuf, &rbuf).map_err(io::Error::from)?;
    socket::setsockopt(fd, sockopt::SndBuf, &sbuf).map_err(io::Error::from)?;
    Ok(())
}

pub struct ConnectStart {
    pub sock: mio::net::TcpStream,
    /// true when connect returned EINPROGRESS and writable readiness will
    /// report the outcome.
    pub in_progress: bool,
}

/// Create a nonblocking client socket with the channel's options applied
/// and start connecting it.
pub fn start_connect(addr: &SocketAddr, rbuf: usize, sbuf: usize) -> io::Result<ConnectStart> {
    let fd = new_socket(addr)?;
    set_buf_sizes(&fd, rbuf, sbuf)?;

    let target = SockaddrStorage::from(*addr);
    let in_progress = match socket::connect(fd.as_raw_fd(), &target) {
        Ok(()) => false,
        Err(Errno::EINPROGRESS) | Err(Errno::EINTR) => true,
        Err(e) => {
            debug!("connect to {} failed: {}", addr, e);
            return Err(io::Error::from(e));
        }
    };

    let std_sock = StdTcpStream::from(fd);
    Ok(ConnectStart { sock: mio::net::TcpStream::from_std(std_sock), in_progress })
}

/// Create a nonblocking listening socket: reuseaddr, linger off, nodelay,
/// backlog 1024.
pub fn build_listener(addr: &SocketAddr) -> io::Result<mio::net::TcpListener> {
    let fd = new_socket(addr)?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(io::Error::from)?;
    let linger = nix::libc::linger { l_onoff: 0, l_linger: 0 };
    socket::setsockopt(&fd, sockopt::Linger, &linger).map_err(io::Error::from)?;

    socket::bind(fd.as_raw_fd(), &SockaddrStorage::from(*addr)).map_err(io::Error::from)?;
    socket::listen(&fd, Backlog::new(1024).unwrap()).map_err(io::Error::from)?;

    let std_listener = StdTcpListener::from(fd);
    Ok(mio::net::TcpListener::from_std(std_listener))
}

/// Apply the per-connection socket options to an accepted stream.
pub fn apply_stream_options(
    sock: &mio::net::TcpStream, rbuf: usize, sbuf: usize,
) -> io::Result<()> {
    let fd = unsafe { BorrowedFd::borrow_raw(sock.as_raw_fd()) };
    socket::setsockopt(&fd, sockopt::TcpNoDelay, &true).map_err(io::Error::from)?;
    set_buf_sizes(&fd, rbuf, sbuf)
}

/// The local hostname, used for address reporting before a connection
/// exists.
pub fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            error!("gethostname failed: {}", e);
            "local".to_string()
        }
    }
}
