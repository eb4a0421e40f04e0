// lib.rs

mod discovery;
mod error;
mod modbus_tcp;
mod pdu;
mod session;
mod transport;

pub use discovery::{
    AddressRange, CancelToken, CoilMap, CoilProbe, DiscoveryConfig, DiscoveryResult, Module,
    ScanOptions,
};
pub use error::{AccessError, ConfigError, ConnectionError, DiscoveryError};
pub use modbus_tcp::{MAX_ADU_LEN, MBAP_HEADER_LEN, ModbusTcpFramer, read_frame};
pub use pdu::{ModbusUnit, ModbusUnitBuilder, ModbusUnitError, ReadValues, RegisterType};
pub use session::{ConnectionState, Session, SessionConfig, connect};
pub use transport::{Connector, TcpConnector, TcpTransport, Transport};

#[derive(Debug, thiserror::Error)]
pub enum ModbusTransportError {
    #[error("Frame too short")]
    FrameTooShort,

    #[error("Invalid protocol ID: {0}")]
    InvalidProtocolId(u16),

    #[error("Invalid MBAP length field: {0}")]
    InvalidLength(u16),

    #[error("Unit ID mismatch: expected {expected}, received {received}")]
    UnitIdMismatch { expected: u8, received: u8 },

    #[error("Too many stale frames while waiting for transaction {0}")]
    StaleFrames(u16),

    #[error("No response before the request timeout")]
    Timeout,

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ModbusUnitError),
}

impl ModbusTransportError {
    /// Whether the byte stream can no longer be trusted and the session must be dropped.
    ///
    /// A complete frame with a bad protocol or unit id leaves the stream on a
    /// frame boundary, so only that response is rejected.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ModbusTransportError::FrameTooShort
                | ModbusTransportError::InvalidLength(_)
                | ModbusTransportError::StaleFrames(_)
                | ModbusTransportError::ConnectionClosed
                | ModbusTransportError::Io(_)
        )
    }
}
