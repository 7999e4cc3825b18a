use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::auth::{self, AuthKey};
use crate::wire::{self, Frame};
use crate::{Error, Result};

/// How long an accepted peer gets to complete authentication before the
/// listener gives up on it.
const AUTH_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SOCKET: AtomicU64 = AtomicU64::new(0);

/// A broker endpoint address. The listener picks a concrete one when the
/// caller does not: a fresh socket path under the system temp directory on
/// Unix, loopback TCP with an OS-assigned port elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerAddr {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            BrokerAddr::Unix(path) => write!(f, "{}", path.display()),
            BrokerAddr::Tcp(addr) => write!(f, "{addr}"),
        }
    }
}

fn default_addr() -> BrokerAddr {
    #[cfg(unix)]
    {
        let n = NEXT_SOCKET.fetch_add(1, Ordering::Relaxed);
        BrokerAddr::Unix(
            std::env::temp_dir().join(format!("fanout-{}-{n}.sock", std::process::id())),
        )
    }
    #[cfg(not(unix))]
    {
        BrokerAddr::Tcp(SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.set_read_timeout(timeout),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Stream::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(stream) => stream.as_raw_fd(),
            Stream::Unix(stream) => stream.as_raw_fd(),
        }
    }

    #[cfg(not(unix))]
    fn readable(&self, timeout: Option<Duration>) -> Result<bool> {
        fallback::stream_readable(self, timeout)
    }
}

impl Read for &Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match **self {
            Stream::Tcp(ref stream) => {
                let mut stream = stream;
                stream.read(buf)
            }
            #[cfg(unix)]
            Stream::Unix(ref stream) => {
                let mut stream = stream;
                stream.read(buf)
            }
        }
    }
}

impl Write for &Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match **self {
            Stream::Tcp(ref stream) => {
                let mut stream = stream;
                stream.write(buf)
            }
            #[cfg(unix)]
            Stream::Unix(ref stream) => {
                let mut stream = stream;
                stream.write(buf)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match **self {
            Stream::Tcp(ref stream) => {
                let mut stream = stream;
                stream.flush()
            }
            #[cfg(unix)]
            Stream::Unix(ref stream) => {
                let mut stream = stream;
                stream.flush()
            }
        }
    }
}

/// One authenticated broker connection.
///
/// All I/O goes through `&self`: frames are read and written directly on
/// the socket, so a connection can be shared behind an `Arc` as long as a
/// single thread drives it at a time.
pub struct Connection {
    id: u64,
    stream: Stream,
}

impl Connection {
    /// Connects and authenticates to a listener at `addr`.
    pub fn connect(addr: &BrokerAddr, authkey: &AuthKey) -> Result<Connection> {
        let stream = match addr {
            #[cfg(unix)]
            BrokerAddr::Unix(path) => Stream::Unix(UnixStream::connect(path)?),
            BrokerAddr::Tcp(tcp_addr) => Stream::Tcp(TcpStream::connect(tcp_addr)?),
        };
        auth::authenticate_client(&mut &stream, authkey)?;
        debug!("connected to broker at {addr}");
        Ok(Connection {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            stream,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&self, frame: &Frame) -> Result<()> {
        wire::write_frame(&mut &self.stream, frame)
    }

    /// Receives one frame, blocking until it is complete. A peer that went
    /// away reads as [`Error::Disconnected`].
    pub fn recv(&self) -> Result<Frame> {
        wire::read_frame(&mut &self.stream)
    }

    /// Waits up to `timeout` for the connection to become readable.
    /// `None` blocks indefinitely, a zero timeout probes without blocking.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<bool> {
        #[cfg(unix)]
        {
            Ok(!platform::wait_readable(&[self.stream.raw_fd()], timeout)?.is_empty())
        }
        #[cfg(not(unix))]
        {
            self.stream.readable(timeout)
        }
    }

    pub fn close(&self) {
        self.stream.shutdown();
    }
}

/// Waits for any of `conns` to become readable and returns the indexes of
/// the ready ones. EOF and error states count as readable so the caller
/// observes them through `recv`.
pub(crate) fn wait_readable(conns: &[&Connection], timeout: Option<Duration>) -> Result<Vec<usize>> {
    #[cfg(unix)]
    {
        let fds: Vec<RawFd> = conns.iter().map(|conn| conn.stream.raw_fd()).collect();
        Ok(platform::wait_readable(&fds, timeout)?)
    }
    #[cfg(not(unix))]
    {
        let streams: Vec<&Stream> = conns.iter().map(|conn| &conn.stream).collect();
        fallback::wait_readable(&streams, timeout)
    }
}

enum ListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// The broker's listening socket. Accepting performs the server half of
/// the authentication exchange before a [`Connection`] is handed out.
pub struct Listener {
    inner: ListenerInner,
    addr: BrokerAddr,
    authkey: AuthKey,
}

impl Listener {
    /// Binds to `addr`, or to a transport-selected local address when
    /// `addr` is `None`. The concrete address is reported by
    /// [`Listener::address`].
    pub fn bind(addr: Option<BrokerAddr>, authkey: AuthKey) -> Result<Listener> {
        let addr = addr.unwrap_or_else(default_addr);
        let (inner, addr) = match addr {
            #[cfg(unix)]
            BrokerAddr::Unix(path) => {
                let listener = UnixListener::bind(&path)?;
                (ListenerInner::Unix(listener), BrokerAddr::Unix(path))
            }
            BrokerAddr::Tcp(tcp_addr) => {
                let listener = TcpListener::bind(tcp_addr)?;
                let bound = listener.local_addr()?;
                (ListenerInner::Tcp(listener), BrokerAddr::Tcp(bound))
            }
        };
        #[cfg(not(unix))]
        match &inner {
            ListenerInner::Tcp(listener) => listener.set_nonblocking(true)?,
        }
        Ok(Listener {
            inner,
            addr,
            authkey,
        })
    }

    pub fn address(&self) -> &BrokerAddr {
        &self.addr
    }

    /// Accepts and authenticates the next connection, blocking until one
    /// arrives.
    pub fn accept(&self) -> Result<Connection> {
        loop {
            if let Some(stream) = self.accept_stream(None)? {
                return self.authenticate(stream);
            }
        }
    }

    /// Like [`Listener::accept`], but gives up after `timeout` when no
    /// connection is pending.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<Connection>> {
        match self.accept_stream(Some(timeout))? {
            Some(stream) => self.authenticate(stream).map(Some),
            None => Ok(None),
        }
    }

    #[cfg(unix)]
    fn accept_stream(&self, timeout: Option<Duration>) -> Result<Option<Stream>> {
        let fd = match &self.inner {
            ListenerInner::Tcp(listener) => listener.as_raw_fd(),
            ListenerInner::Unix(listener) => listener.as_raw_fd(),
        };
        if let Some(timeout) = timeout {
            if platform::wait_readable(&[fd], Some(timeout))?.is_empty() {
                return Ok(None);
            }
        }
        let stream = match &self.inner {
            ListenerInner::Tcp(listener) => Stream::Tcp(listener.accept()?.0),
            ListenerInner::Unix(listener) => Stream::Unix(listener.accept()?.0),
        };
        Ok(Some(stream))
    }

    #[cfg(not(unix))]
    fn accept_stream(&self, timeout: Option<Duration>) -> Result<Option<Stream>> {
        fallback::accept_stream(&self.inner, timeout)
    }

    /// Runs server-side authentication on a fresh stream. Every failure in
    /// this window reads as an authentication error so one bad peer never
    /// takes the accept loop down.
    fn authenticate(&self, stream: Stream) -> Result<Connection> {
        stream.set_read_timeout(Some(AUTH_TIMEOUT))?;
        match auth::authenticate_server(&mut &stream, &self.authkey) {
            Ok(()) => {}
            Err(Error::Auth(reason)) => return Err(Error::Auth(reason)),
            Err(_) => return Err(Error::Auth("handshake aborted")),
        }
        stream.set_read_timeout(None)?;
        Ok(Connection {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            stream,
        })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let BrokerAddr::Unix(path) = &self.addr {
            let _ = fs::remove_file(path);
        }
    }
}

/// Writes the `(address, key)` pair to `path` as JSON. Refuses to replace
/// an existing file unless `overwrite` is set.
pub fn write_broker_file(
    path: &Path,
    addr: &BrokerAddr,
    authkey: &AuthKey,
    overwrite: bool,
) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    let file = options.open(path)?;
    serde_json::to_writer(file, &(addr, authkey))?;
    Ok(())
}

/// Loads an `(address, key)` pair previously written by
/// [`write_broker_file`].
pub fn read_broker_file(path: &Path) -> Result<(BrokerAddr, AuthKey)> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(unix)]
mod platform {
    use std::io;
    use std::os::unix::io::RawFd;
    use std::time::Duration;

    use libc::{poll, pollfd, POLLERR, POLLHUP, POLLIN};

    pub fn wait_readable(fds: &[RawFd], timeout: Option<Duration>) -> io::Result<Vec<usize>> {
        let mut pfds: Vec<pollfd> = fds
            .iter()
            .map(|&fd| pollfd {
                fd,
                events: POLLIN,
                revents: 0,
            })
            .collect();
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(timeout) => {
                let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
                if ms == 0 && !timeout.is_zero() {
                    1
                } else {
                    ms
                }
            }
        };
        loop {
            let res = unsafe { poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(pfds
                .iter()
                .enumerate()
                .filter(|(_, pfd)| pfd.revents & (POLLIN | POLLHUP | POLLERR) != 0)
                .map(|(index, _)| index)
                .collect());
        }
    }
}

#[cfg(not(unix))]
mod fallback {
    use std::io;
    use std::time::{Duration, Instant};

    use super::{ListenerInner, Stream};
    use crate::Result;

    const PROBE_INTERVAL: Duration = Duration::from_millis(5);

    fn probe(stream: &Stream) -> Result<bool> {
        let Stream::Tcp(tcp) = stream;
        tcp.set_nonblocking(true)?;
        let res = tcp.peek(&mut [0u8; 1]);
        tcp.set_nonblocking(false)?;
        match res {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn stream_readable(stream: &Stream, timeout: Option<Duration>) -> Result<bool> {
        Ok(!wait_readable(&[stream], timeout)?.is_empty())
    }

    pub fn wait_readable(streams: &[&Stream], timeout: Option<Duration>) -> Result<Vec<usize>> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let mut ready = Vec::new();
            for (index, stream) in streams.iter().enumerate() {
                if probe(stream)? {
                    ready.push(index);
                }
            }
            if !ready.is_empty() {
                return Ok(ready);
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => return Ok(ready),
                _ => std::thread::sleep(PROBE_INTERVAL),
            }
        }
    }

    pub fn accept_stream(
        inner: &ListenerInner,
        timeout: Option<Duration>,
    ) -> Result<Option<Stream>> {
        let ListenerInner::Tcp(listener) = inner;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    return Ok(Some(Stream::Tcp(stream)));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => match deadline {
                    Some(deadline) if Instant::now() >= deadline => return Ok(None),
                    _ => std::thread::sleep(PROBE_INTERVAL),
                },
                Err(err) => return Err(err.into()),
            }
        }
    }
}
