use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Socket, Type};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Listening socket over either address family. The UNIX variant keeps its
/// path so the socket file can be unlinked on drop.
pub enum Acceptor {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl Acceptor {
    /// Bind a TCP listener with an explicit backlog.
    /// Returns the bound local address, which resolves port 0 requests.
    pub fn bind_tcp(host: &str, port: u16, backlog: i32) -> io::Result<(Self, SocketAddr)> {
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;

        let listener: std::net::TcpListener = socket.into();
        let local_addr = listener.local_addr()?;
        Ok((Acceptor::Tcp(TcpListener::from_std(listener)), local_addr))
    }

    /// Bind a UNIX-domain listener, replacing any stale socket file
    pub fn bind_unix(path: &str) -> io::Result<Self> {
        let path = PathBuf::from(path);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        Ok(Acceptor::Unix(listener, path))
    }

    /// Accept one pending connection; `WouldBlock` when the queue is empty
    pub fn accept(&self) -> io::Result<(ClientStream, Option<SocketAddr>)> {
        match self {
            Acceptor::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                Ok((ClientStream::Tcp(stream), Some(addr)))
            }
            Acceptor::Unix(listener, _) => {
                let (stream, _) = listener.accept()?;
                Ok((ClientStream::Unix(stream), None))
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Acceptor::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Source for Acceptor {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Acceptor::Tcp(l) => l.register(registry, token, interests),
            Acceptor::Unix(l, _) => l.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Acceptor::Tcp(l) => l.reregister(registry, token, interests),
            Acceptor::Unix(l, _) => l.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Acceptor::Tcp(l) => l.deregister(registry),
            Acceptor::Unix(l, _) => l.deregister(registry),
        }
    }
}

/// A connected client over either address family
pub enum ClientStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl ClientStream {
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        match self {
            ClientStream::Tcp(s) => s.set_nodelay(nodelay),
            ClientStream::Unix(_) => Ok(()),
        }
    }
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ClientStream::Tcp(s) => s.read(buf),
            ClientStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ClientStream::Tcp(s) => s.write(buf),
            ClientStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ClientStream::Tcp(s) => s.flush(),
            ClientStream::Unix(s) => s.flush(),
        }
    }
}

impl Source for ClientStream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            ClientStream::Tcp(s) => s.register(registry, token, interests),
            ClientStream::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            ClientStream::Tcp(s) => s.reregister(registry, token, interests),
            ClientStream::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            ClientStream::Tcp(s) => s.deregister(registry),
            ClientStream::Unix(s) => s.deregister(registry),
        }
    }
}
