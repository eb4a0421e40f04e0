use std::time::Duration;

use thiserror::Error;

use crate::{ModbusTransportError, ModbusUnitError, RegisterType};

/// Failure to establish or keep the TCP session. Fatal to the run.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid server address {addr}: {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timeout must be greater than zero")]
    ZeroTimeout,

    #[error("Timed out connecting to {addr} after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("Failed to connect to Modbus TCP server at {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Session is not connected")]
    NotConnected,

    #[error("Connection lost: {0}")]
    Lost(String),
}

/// A single read or write that did not complete.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("Session is not connected")]
    NotConnected,

    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] ModbusUnitError),

    #[error("Device not responding at {register_type} address {address}: {source}")]
    NotResponding {
        register_type: RegisterType,
        address: u16,
        #[source]
        source: ModbusTransportError,
    },
}

impl AccessError {
    /// True when the device answered with a Modbus exception response.
    pub fn is_exception(&self) -> bool {
        matches!(
            self,
            AccessError::NotResponding {
                source: ModbusTransportError::Protocol(ModbusUnitError::ModbusException(..)),
                ..
            }
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Module {name}: start address {start} is greater than end address {end}")]
    InvertedRange { name: String, start: u16, end: u16 },

    #[error("Module {0} is declared more than once")]
    DuplicateModule(String),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Discovery cancelled")]
    Cancelled,
}
