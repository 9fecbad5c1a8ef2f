//! Blocking-style TCP on top of the hook layer
//!
//! `TcpListener` and `TcpStream` look like their `std::net` counterparts,
//! but every potentially blocking call goes through `hook`. Inside an
//! IOManager worker that parks the fiber rather than the thread; outside
//! one they behave like ordinary blocking sockets.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use libc::{c_int, socklen_t};
use nix::sys::socket::{getpeername, getsockname, SockaddrLike, SockaddrStorage};

use crate::hook;

const LISTEN_BACKLOG: c_int = 128;

fn cvt(rc: c_int) -> io::Result<c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn cvt_size(n: isize) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn to_std(addr: &SockaddrStorage) -> io::Result<SocketAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Ok(SocketAddr::V4((*v4).into()));
    }
    if let Some(v6) = addr.as_sockaddr_in6() {
        return Ok(SocketAddr::V6((*v6).into()));
    }
    Err(io::Error::new(io::ErrorKind::InvalidInput, "not an inet address"))
}

/// Socket fd closed through the hook layer on drop
#[derive(Debug)]
struct Socket {
    fd: RawFd,
}

impl Socket {
    fn new(addr: &SocketAddr) -> io::Result<Socket> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = cvt(hook::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0))?;
        Ok(Socket { fd })
    }

    fn set_timeval(&self, optname: c_int, dur: Option<Duration>) -> io::Result<()> {
        let tv = match dur {
            Some(d) if d.is_zero() => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero timeout"));
            }
            Some(d) => libc::timeval {
                tv_sec: d.as_secs() as libc::time_t,
                tv_usec: d.subsec_micros() as libc::suseconds_t,
            },
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        let rc = unsafe {
            hook::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                optname,
                (&tv as *const libc::timeval).cast(),
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };
        cvt(rc).map(drop)
    }

    fn set_int(&self, level: c_int, optname: c_int, value: c_int) -> io::Result<()> {
        let rc = unsafe {
            hook::setsockopt(
                self.fd,
                level,
                optname,
                (&value as *const c_int).cast(),
                std::mem::size_of::<c_int>() as socklen_t,
            )
        };
        cvt(rc).map(drop)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        to_std(&getsockname::<SockaddrStorage>(self.fd)?)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}

/// Listening TCP socket
#[derive(Debug)]
pub struct TcpListener {
    sock: Socket,
}

impl TcpListener {
    /// Bind with `SO_REUSEADDR` and start listening
    pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
        let sock = Socket::new(&addr)?;
        sock.set_int(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;

        let storage = SockaddrStorage::from(addr);
        cvt(unsafe { libc::bind(sock.fd, storage.as_ptr(), storage.len()) })?;
        cvt(unsafe { libc::listen(sock.fd, LISTEN_BACKLOG) })?;
        Ok(TcpListener { sock })
    }

    /// Wait for a connection; parks the fiber on a hooked thread
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let fd = cvt(unsafe { hook::accept(self.sock.fd, std::ptr::null_mut(), std::ptr::null_mut()) })?;
        let stream = TcpStream {
            sock: Socket { fd },
        };
        let peer = stream.peer_addr()?;
        Ok((stream, peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.fd
    }
}

/// Connected TCP socket
#[derive(Debug)]
pub struct TcpStream {
    sock: Socket,
}

impl TcpStream {
    /// Connect, bounded by `tcp.connect.timeout` on a hooked thread
    pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
        Self::connect_with(addr, hook::connect_timeout_ms())
    }

    pub fn connect_timeout(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1);
        Self::connect_with(addr, ms)
    }

    fn connect_with(addr: SocketAddr, timeout_ms: u64) -> io::Result<TcpStream> {
        let sock = Socket::new(&addr)?;
        let storage = SockaddrStorage::from(addr);
        let rc = unsafe {
            hook::connect_with_timeout(sock.fd, storage.as_ptr(), storage.len(), timeout_ms)
        };
        cvt(rc)?;
        Ok(TcpStream { sock })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        to_std(&getpeername::<SockaddrStorage>(self.sock.fd)?)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    /// `None` waits forever
    pub fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.sock.set_timeval(libc::SO_RCVTIMEO, dur)
    }

    pub fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.sock.set_timeval(libc::SO_SNDTIMEO, dur)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.sock
            .set_int(libc::IPPROTO_TCP, libc::TCP_NODELAY, c_int::from(nodelay))
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        cvt(unsafe { libc::shutdown(self.sock.fd, how) }).map(drop)
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        cvt_size(hook::read(self.sock.fd, buf))
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        cvt_size(hook::send(self.sock.fd, buf, libc::MSG_NOSIGNAL))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;

    use crate::iomanager::IoManager;
    use crate::scheduler::{Scheduler, Task};

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn run_in_fiber<T, F>(iom: &Arc<IoManager>, f: F) -> mpsc::Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        iom.schedule(Task::call(move || {
            let _ = tx.send(f());
        }));
        rx
    }

    #[test]
    fn test_echo_between_fibers() {
        let iom = IoManager::new(2, false, "net_echo").unwrap();
        let (addr_tx, addr_rx) = mpsc::channel();

        let server = run_in_fiber(&iom, move || -> io::Result<()> {
            let listener = TcpListener::bind(localhost())?;
            let _ = addr_tx.send(listener.local_addr()?);
            let (mut conn, peer) = listener.accept()?;
            assert!(peer.ip().is_loopback());

            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf)?;
            conn.write_all(&buf[..n])?;
            Ok(())
        });

        let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let client = run_in_fiber(&iom, move || -> io::Result<Vec<u8>> {
            let mut stream = TcpStream::connect(addr)?;
            assert_eq!(stream.peer_addr()?, addr);
            stream.write_all(b"hello fiber")?;
            let mut buf = vec![0u8; 11];
            stream.read_exact(&mut buf)?;
            Ok(buf)
        });

        let echoed = client.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(echoed, b"hello fiber");
        server.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        iom.stop();
    }

    #[test]
    fn test_plain_threads_block_normally() {
        let listener = TcpListener::bind(localhost()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"abc").unwrap();
            stream.shutdown(Shutdown::Write).unwrap();
        });

        let (mut conn, _) = listener.accept().unwrap();
        let mut got = Vec::new();
        conn.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"abc");
        client.join().unwrap();
    }

    #[test]
    fn test_read_timeout_in_fiber() {
        let iom = IoManager::new(1, false, "net_timeout").unwrap();
        let rx = run_in_fiber(&iom, || -> io::Result<io::ErrorKind> {
            let listener = TcpListener::bind(localhost())?;
            let mut stream = TcpStream::connect(listener.local_addr()?)?;
            let (_conn, _) = listener.accept()?;

            stream.set_read_timeout(Some(Duration::from_millis(50)))?;
            let mut buf = [0u8; 8];
            Ok(stream.read(&mut buf).unwrap_err().kind())
        });
        let kind = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(kind, io::ErrorKind::TimedOut);
        iom.stop();
    }

    #[test]
    fn test_connect_refused_in_fiber() {
        let iom = IoManager::new(1, false, "net_refused").unwrap();
        let rx = run_in_fiber(&iom, || {
            TcpStream::connect_timeout("127.0.0.1:1".parse().unwrap(), Duration::from_secs(1))
                .unwrap_err()
                .kind()
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            io::ErrorKind::ConnectionRefused
        );
        iom.stop();
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let listener = TcpListener::bind(localhost()).unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let err = stream.set_read_timeout(Some(Duration::ZERO)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        stream.set_nodelay(true).unwrap();
    }
}
