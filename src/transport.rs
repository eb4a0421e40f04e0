use std::io::{self, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, info};

use crate::modbus_tcp::{ModbusTcpFramer, read_frame};
use crate::{ConnectionError, ModbusTransportError, SessionConfig};

/// Responses carrying an older transaction id are skipped at most this many
/// times per request before the stream is declared out of sync.
const MAX_STALE_FRAMES: usize = 8;

/// One request/response round-trip at the PDU level.
pub trait Transport {
    /// Sends a request PDU and returns the response PDU, which may be an
    /// exception response.
    fn exchange(&mut self, pdu: &[u8]) -> Result<Vec<u8>, ModbusTransportError>;

    fn shutdown(&mut self) {}
}

/// Opens transports for a session.
pub trait Connector {
    type Transport: Transport;

    fn connect(&self, config: &SessionConfig) -> Result<Self::Transport, ConnectionError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Transport = TcpTransport;

    fn connect(&self, config: &SessionConfig) -> Result<TcpTransport, ConnectionError> {
        let timeout = config.timeout();
        if timeout.is_zero() {
            return Err(ConnectionError::ZeroTimeout);
        }

        let addr = config.address();
        let candidates: Vec<SocketAddr> = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|source| ConnectionError::InvalidAddress {
                addr: addr.clone(),
                source,
            })?
            .collect();

        let mut last_error = io::Error::new(ErrorKind::NotFound, "host resolved to no addresses");
        for socket_addr in candidates {
            match TcpStream::connect_timeout(&socket_addr, timeout) {
                Ok(stream) => {
                    let transport = TcpTransport::new(stream, config.unit_id, timeout)
                        .map_err(|source| ConnectionError::Io {
                            addr: addr.clone(),
                            source,
                        })?;
                    info!("Connected to {} (unit {})", socket_addr, config.unit_id);
                    return Ok(transport);
                }
                Err(e) => {
                    debug!("Connect attempt to {} failed: {}", socket_addr, e);
                    last_error = e;
                }
            }
        }

        if last_error.kind() == ErrorKind::TimedOut {
            Err(ConnectionError::Timeout { addr, timeout })
        } else {
            Err(ConnectionError::Io {
                addr,
                source: last_error,
            })
        }
    }
}

/// Modbus TCP over a blocking socket; `timeout` bounds every socket read and write.
pub struct TcpTransport {
    stream: TcpStream,
    framer: ModbusTcpFramer,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, unit_id: u8, timeout: Duration) -> io::Result<Self> {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            framer: ModbusTcpFramer::new(unit_id),
        })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl Transport for TcpTransport {
    fn exchange(&mut self, pdu: &[u8]) -> Result<Vec<u8>, ModbusTransportError> {
        let (transaction_id, frame) = self.framer.wrap_tcp(pdu);
        self.stream.write_all(&frame)?;

        for _ in 0..=MAX_STALE_FRAMES {
            let response = read_frame(&mut self.stream)?;
            let (response_id, response_pdu) = self.framer.unwrap_tcp(&response)?;
            if response_id == transaction_id {
                return Ok(response_pdu.to_vec());
            }
            debug!(
                "Discarding stale response for transaction {} (waiting for {})",
                response_id, transaction_id
            );
        }
        Err(ModbusTransportError::StaleFrames(transaction_id))
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
