use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::config;

/// Outbound side of the stream the engine writes packets to. Inbound bytes
/// and open/close notifications are pushed into the connection by whoever
/// owns the socket.
pub trait Transport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

#[derive(Debug)]
pub enum TransportError {
    Resolve {
        address: String,
        source: io::Error,
    },
    Connect {
        address: String,
        source: io::Error,
    },
    Configure {
        source: io::Error,
    },
    Write {
        source: io::Error,
    },
    Read {
        source: io::Error,
    },
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve { address, source } => {
                write!(f, "failed to resolve job server address {address}: {source}")
            }
            Self::Connect { address, source } => {
                write!(f, "failed to connect to job server at {address}: {source}")
            }
            Self::Configure { source } => {
                write!(f, "failed to configure job server stream: {source}")
            }
            Self::Write { source } => write!(f, "failed to write to job server: {source}"),
            Self::Read { source } => write!(f, "failed to read from job server: {source}"),
            Self::Closed => write!(f, "job server closed the connection"),
        }
    }
}

impl std::error::Error for TransportError {}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Closed,
}

/// Non-blocking TCP stream to a job server. Writes that the socket cannot
/// take yet are kept in order and flushed on the next `send` or
/// `flush_pending`.
pub struct TcpTransport {
    stream: TcpStream,
    peer_addr: SocketAddr,
    outgoing: Vec<u8>,
}

impl TcpTransport {
    pub fn connect(config: &config::ServerConfig) -> Result<Self, TransportError> {
        let address = format!("{}:{}", config.host, config.port);
        let candidates: Vec<SocketAddr> = address
            .to_socket_addrs()
            .map_err(|source| TransportError::Resolve {
                address: address.clone(),
                source,
            })?
            .collect();

        let timeout = Duration::from_millis(config.connect_timeout_ms.max(1));
        let mut last_error =
            io::Error::new(io::ErrorKind::NotFound, "address resolved to no candidates");
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => return Self::from_stream(stream),
                Err(error) => last_error = error,
            }
        }

        Err(TransportError::Connect {
            address,
            source: last_error,
        })
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        stream
            .set_nodelay(true)
            .map_err(|source| TransportError::Configure { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| TransportError::Configure { source })?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|source| TransportError::Configure { source })?;

        Ok(Self {
            stream,
            peer_addr,
            outgoing: Vec::new(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn pending_write_bytes(&self) -> usize {
        self.outgoing.len()
    }

    pub fn try_read(&mut self, buffer: &mut [u8]) -> Result<ReadOutcome, TransportError> {
        match self.stream.read(buffer) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(size) => Ok(ReadOutcome::Data(size)),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::WouldBlock),
            Err(source) => Err(TransportError::Read { source }),
        }
    }

    pub fn flush_pending(&mut self) -> Result<(), TransportError> {
        while !self.outgoing.is_empty() {
            match self.stream.write(&self.outgoing) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(written) => {
                    self.outgoing.drain(..written);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => return Err(TransportError::Write { source }),
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.outgoing.extend_from_slice(bytes);
        self.flush_pending()
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer_addr", &self.peer_addr)
            .field("pending_write_bytes", &self.outgoing.len())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use super::{ReadOutcome, TcpTransport, Transport, TransportError};
    use crate::config::ServerConfig;

    fn read_until(transport: &mut TcpTransport, expected: usize) -> Vec<u8> {
        let mut received = Vec::new();
        let mut chunk = [0_u8; 64];
        for _ in 0..200 {
            match transport.try_read(&mut chunk).expect("read should not fail") {
                ReadOutcome::Data(size) => received.extend_from_slice(&chunk[..size]),
                ReadOutcome::WouldBlock => thread::sleep(Duration::from_millis(5)),
                ReadOutcome::Closed => break,
            }
            if received.len() >= expected {
                break;
            }
        }
        received
    }

    #[test]
    fn sends_and_receives_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let port = listener.local_addr().expect("local addr").port();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept should succeed");
            let mut request = [0_u8; 5];
            stream.read_exact(&mut request).expect("request should arrive");
            stream.write_all(b"world").expect("response should send");
            request
        });

        let mut transport = TcpTransport::connect(&ServerConfig {
            host: "127.0.0.1".to_owned(),
            port,
            connect_timeout_ms: 1_000,
        })
        .expect("transport should connect");
        assert_eq!(transport.peer_addr().port(), port);

        transport.send(b"hello").expect("send should succeed");
        let received = read_until(&mut transport, 5);

        assert_eq!(received, b"world");
        assert_eq!(&server.join().expect("server thread"), b"hello");
        assert_eq!(transport.pending_write_bytes(), 0);
    }

    #[test]
    fn reports_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let port = listener.local_addr().expect("local addr").port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept should succeed");
            drop(stream);
        });

        let mut transport = TcpTransport::connect(&ServerConfig {
            host: "127.0.0.1".to_owned(),
            port,
            connect_timeout_ms: 1_000,
        })
        .expect("transport should connect");
        server.join().expect("server thread");

        let mut chunk = [0_u8; 8];
        let mut outcome = ReadOutcome::WouldBlock;
        for _ in 0..200 {
            outcome = transport.try_read(&mut chunk).expect("read should not fail");
            if outcome != ReadOutcome::WouldBlock {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(outcome, ReadOutcome::Closed);
    }

    #[test]
    fn connect_failure_names_the_address() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let error = TcpTransport::connect(&ServerConfig {
            host: "127.0.0.1".to_owned(),
            port,
            connect_timeout_ms: 200,
        })
        .expect_err("nothing listens on the port");

        assert!(matches!(error, TransportError::Connect { .. }));
        assert!(error.to_string().contains(&format!("127.0.0.1:{port}")));
    }
}
