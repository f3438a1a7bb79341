use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;
use wirefuzz_core::config::TransportKind;
use wirefuzz_core::transport::{Transport, TransportError, TransportFactory};

/// Largest response read in one receive call.
const RECEIVE_BUFFER: usize = 65_536;

/// Basic TCP client. Each receive returns whatever one read yields.
pub struct TcpTransport {
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub async fn connect(address: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| TransportError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(address, error = %e, "could not disable Nagle's algorithm");
        }
        Ok(Self { stream: Some(stream) })
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream()?.write_all(bytes).await?;
        Ok(())
    }

    async fn receive(&mut self, wait: Duration) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream()?;
        let mut buf = vec![0u8; RECEIVE_BUFFER];
        let read = timeout(wait, stream.read(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout(wait))??;
        if read == 0 {
            self.stream = None;
            return Err(TransportError::Closed);
        }
        buf.truncate(read);
        Ok(buf)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.flush().await {
                debug!(error = %e, "flush before close failed");
            }
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "shutdown failed, peer may already be gone");
            }
        }
        Ok(())
    }
}

/// Connected UDP socket; one datagram per request and per response.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn connect(address: &str) -> Result<Self, TransportError> {
        let connect_err = |e: std::io::Error| TransportError::Connect {
            address: address.to_string(),
            reason: e.to_string(),
        };
        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(connect_err)?;
        socket.connect(address).await.map_err(connect_err)?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.socket.send(bytes).await?;
        Ok(())
    }

    async fn receive(&mut self, wait: Duration) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; RECEIVE_BUFFER];
        let read = timeout(wait, self.socket.recv(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout(wait))??;
        buf.truncate(read);
        Ok(buf)
    }
}

/// Opens one TCP connection or UDP socket per session.
pub struct NetFactory {
    address: String,
    kind: TransportKind,
}

impl NetFactory {
    pub fn new(address: String, kind: TransportKind) -> Self {
        Self { address, kind }
    }
}

#[async_trait]
impl TransportFactory for NetFactory {
    async fn connect(&self, session_id: usize) -> Result<Box<dyn Transport>, TransportError> {
        debug!(session = session_id, address = %self.address, kind = ?self.kind, "connecting");
        Ok(match self.kind {
            TransportKind::Tcp => Box::new(TcpTransport::connect(&self.address).await?),
            TransportKind::Udp => Box::new(UdpTransport::connect(&self.address).await?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_transport_exchanges_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let factory = NetFactory::new(address, TransportKind::Tcp);
        let mut transport = factory.connect(0).await.unwrap();
        transport.send(b"STCP").await.unwrap();
        let reply = transport.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply, b"STCP");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn closing_after_the_peer_left_still_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut transport = TcpTransport::connect(&address).await.unwrap();
        accept.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.close().await.unwrap();
        assert_eq!(transport.send(b"late").await.unwrap_err(), TransportError::Closed);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let mut transport = TcpTransport::connect(&address).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn udp_receive_times_out() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = peer.local_addr().unwrap().to_string();
        let mut transport = UdpTransport::connect(&address).await.unwrap();
        transport.send(b"ping").await.unwrap();
        let err = transport.receive(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn refused_tcp_connect_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = TcpTransport::connect(&address).await.err().unwrap();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
