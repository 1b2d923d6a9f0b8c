use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::core::{Error, Result, Role};

/// One pending peer at a time
const LISTEN_BACKLOG: u32 = 1;

/// Socket handling that differs between the two roles.
///
/// A client connects its socket outbound; a server binds and listens once
/// per cycle, then accepts a single peer.
pub(crate) struct Endpoint {
    role: Role,
    addr: SocketAddr,
    socket: Option<TcpSocket>,
    listener: Option<TcpListener>,
}

impl Endpoint {
    pub(crate) fn new(role: Role, addr: SocketAddr) -> Self {
        Endpoint {
            role,
            addr,
            socket: None,
            listener: None,
        }
    }

    /// Opens a fresh stream socket for this cycle
    pub(crate) fn create(&mut self) -> Result<()> {
        let socket = Socket::new(Domain::for_address(self.addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::socket(format!("create failed: {}", e)))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::socket(format!("set non-blocking failed: {}", e)))?;
        if self.role == Role::Server {
            socket
                .set_reuse_address(true)
                .map_err(|e| Error::socket(format!("set reuse address failed: {}", e)))?;
        }

        let stream: std::net::TcpStream = socket.into();
        self.socket = Some(TcpSocket::from_std_stream(stream));
        Ok(())
    }

    /// Connects the created socket to the peer
    pub(crate) async fn connect(&mut self, limit: Duration) -> Result<TcpStream> {
        let socket = self
            .socket
            .take()
            .ok_or_else(|| Error::socket("no socket to connect"))?;

        match timeout(limit, socket.connect(self.addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::socket(format!("connect to {} failed: {}", self.addr, e))),
            Err(_) => Err(Error::timeout(format!("connect to {} took over {:?}", self.addr, limit))),
        }
    }

    /// Waits up to `limit` for a peer, binding and listening on first use.
    ///
    /// Returns `Ok(None)` when no peer arrived in time.
    pub(crate) async fn poll_accept(&mut self, limit: Duration) -> Result<Option<(TcpStream, SocketAddr)>> {
        if self.listener.is_none() {
            let socket = self
                .socket
                .take()
                .ok_or_else(|| Error::socket("no socket to listen on"))?;
            socket
                .bind(self.addr)
                .map_err(|e| Error::socket(format!("bind to {} failed: {}", self.addr, e)))?;
            let listener = socket
                .listen(LISTEN_BACKLOG)
                .map_err(|e| Error::socket(format!("listen on {} failed: {}", self.addr, e)))?;
            debug!(addr = ?listener.local_addr().ok(), "listening");
            self.listener = Some(listener);
        }

        let Some(listener) = self.listener.as_ref() else {
            return Ok(None);
        };
        match timeout(limit, listener.accept()).await {
            Ok(Ok(accepted)) => Ok(Some(accepted)),
            Ok(Err(e)) => Err(Error::socket(format!("accept failed: {}", e))),
            Err(_) => Ok(None),
        }
    }

    /// Address the listener is bound to
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Closes the unconnected socket and the listener, if open
    pub(crate) fn close(&mut self) {
        self.socket = None;
        self.listener = None;
    }

    /// Sockets this endpoint holds open
    pub(crate) fn open_count(&self) -> usize {
        usize::from(self.socket.is_some()) + usize::from(self.listener.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_server_accepts_one_peer() {
        let mut server = Endpoint::new(Role::Server, loopback());
        server.create().unwrap();
        assert_eq!(server.open_count(), 1);

        // Nobody there yet
        let accepted = server.poll_accept(Duration::from_millis(20)).await.unwrap();
        assert!(accepted.is_none());
        assert_eq!(server.open_count(), 1);
        let addr = server.local_addr().unwrap();

        let mut client = Endpoint::new(Role::Client, addr);
        client.create().unwrap();
        let (connected, accepted) = tokio::join!(
            client.connect(Duration::from_secs(1)),
            server.poll_accept(Duration::from_secs(1)),
        );
        let stream = connected.unwrap();
        let (_peer, peer_addr) = accepted.unwrap().expect("peer accepted");
        assert_eq!(peer_addr, stream.local_addr().unwrap());
        assert_eq!(client.open_count(), 0);

        server.close();
        assert_eq!(server.open_count(), 0);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let vacant = std::net::TcpListener::bind(loopback()).unwrap();
        let addr = vacant.local_addr().unwrap();
        drop(vacant);

        let mut client = Endpoint::new(Role::Client, addr);
        client.create().unwrap();
        let err = client.connect(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Socket(_)));
        assert_eq!(client.open_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_without_socket() {
        let mut client = Endpoint::new(Role::Client, loopback());
        assert!(client.connect(Duration::from_millis(10)).await.is_err());
    }
}
