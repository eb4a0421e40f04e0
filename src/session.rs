use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::pdu::{ModbusUnit, ReadValues, RegisterType};
use crate::transport::{Connector, TcpConnector, Transport};
use crate::{AccessError, ConnectionError, ModbusTransportError, ModbusUnitError};

/// Where and how to reach one Modbus server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Server hostname or IP
    pub host: String,
    /// Server port (default 502)
    pub port: u16,
    /// Modbus unit/slave ID carried in the MBAP header
    pub unit_id: u8,
    /// Bound on the TCP connect and on every request round-trip, in milliseconds
    pub timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "192.168.20.50".to_string(),
            port: 502,
            unit_id: 1,
            timeout_ms: 5000,
        }
    }
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            ..Self::default()
        }
    }

    /// Sub-millisecond timeouts round up to 1 ms.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_micros().div_ceil(1000).min(u64::MAX as u128) as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// A single-owner Modbus session. Every operation takes `&mut self`, so only
/// one request is ever in flight.
///
/// A fatal transport error drops the connection; reconnecting is up to the
/// caller, typically by checking [`Session::is_connected`] before each logical
/// operation and calling [`Session::connect`] again.
pub struct Session<C: Connector = TcpConnector> {
    config: SessionConfig,
    connector: C,
    transport: Option<C::Transport>,
}

/// Opens a TCP session to the server described by `config`.
pub fn connect(config: SessionConfig) -> Result<Session, ConnectionError> {
    let mut session = Session::new(config);
    session.connect()?;
    Ok(session)
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_connector(config, TcpConnector)
    }
}

impl<C: Connector> Session<C> {
    /// Creates a disconnected session that opens its transport through `connector`.
    pub fn with_connector(config: SessionConfig, connector: C) -> Self {
        Self {
            config,
            connector,
            transport: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        if self.transport.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Opens the connection. No-op on a session that is already connected.
    pub fn connect(&mut self) -> Result<&mut Self, ConnectionError> {
        if self.transport.is_none() {
            let transport = self.connector.connect(&self.config)?;
            self.transport = Some(transport);
        }
        Ok(self)
    }

    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
            info!("Closed session to {}", self.config.address());
        }
    }

    pub fn read_coil(&mut self, address: u16) -> Result<bool, AccessError> {
        let bits = self.read(RegisterType::Coil, address, 1)?.into_bits();
        first(bits, RegisterType::Coil, address)
    }

    pub fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>, AccessError> {
        Ok(self.read(RegisterType::Coil, address, count)?.into_bits())
    }

    pub fn read_discrete_input(&mut self, address: u16) -> Result<bool, AccessError> {
        let bits = self.read(RegisterType::Discrete, address, 1)?.into_bits();
        first(bits, RegisterType::Discrete, address)
    }

    pub fn read_discrete_inputs(&mut self, address: u16, count: u16) -> Result<Vec<bool>, AccessError> {
        Ok(self.read(RegisterType::Discrete, address, count)?.into_bits())
    }

    pub fn read_register(&mut self, address: u16) -> Result<u16, AccessError> {
        let words = self.read(RegisterType::Holding, address, 1)?.into_words();
        first(words, RegisterType::Holding, address)
    }

    pub fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, AccessError> {
        Ok(self.read(RegisterType::Holding, address, count)?.into_words())
    }

    /// Writes one coil and returns once the device has echoed the request.
    pub fn write_coil(&mut self, address: u16, value: bool) -> Result<(), AccessError> {
        self.write_coils(address, &[value])
    }

    pub fn write_coils(&mut self, address: u16, values: &[bool]) -> Result<(), AccessError> {
        let unit = write_unit(RegisterType::Coil, address, values.len())?;
        let request = unit.create_coils_write_request(values)?;
        self.write(&unit, &request)
    }

    pub fn write_register(&mut self, address: u16, value: u16) -> Result<(), AccessError> {
        self.write_registers(address, &[value])
    }

    pub fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), AccessError> {
        let unit = write_unit(RegisterType::Holding, address, values.len())?;
        let request = unit.create_registers_write_request(values)?;
        self.write(&unit, &request)
    }

    /// Inverts a coil and returns its new state.
    pub fn toggle_coil(&mut self, address: u16) -> Result<bool, AccessError> {
        let new_state = !self.read_coil(address)?;
        self.write_coil(address, new_state)?;
        Ok(new_state)
    }

    /// Single-point read used by scans: true when the device answered with data.
    pub(crate) fn probe(&mut self, register_type: RegisterType, address: u16) -> Result<bool, AccessError> {
        let values = self.read(register_type, address, 1)?;
        Ok(!values.is_empty())
    }

    fn read(&mut self, register_type: RegisterType, address: u16, count: u16) -> Result<ReadValues, AccessError> {
        let unit = ModbusUnit::builder()
            .address(address)
            .length(count as usize)
            .register_type(register_type)
            .build()?;

        let request = unit.create_read_request();
        let response = self.exchange(register_type, address, &request)?;
        unit.parse_response(&response)
            .map_err(|e| not_responding(register_type, address, e))
    }

    fn write(&mut self, unit: &ModbusUnit, request: &[u8]) -> Result<(), AccessError> {
        let register_type = unit.register_type();
        let address = unit.start_addr();
        let response = self.exchange(register_type, address, request)?;
        unit.parse_write_response(request, &response)
            .map_err(|e| not_responding(register_type, address, e))
    }

    fn exchange(&mut self, register_type: RegisterType, address: u16, request: &[u8]) -> Result<Vec<u8>, AccessError> {
        let transport = self.transport.as_mut().ok_or(AccessError::NotConnected)?;
        match transport.exchange(request) {
            Ok(response) => Ok(response),
            Err(source) => {
                if source.is_fatal() {
                    warn!(
                        "Dropping session to {} after {} address {}: {}",
                        self.config.address(),
                        register_type,
                        address,
                        source
                    );
                    self.close();
                }
                Err(AccessError::NotResponding {
                    register_type,
                    address,
                    source,
                })
            }
        }
    }
}

impl<C: Connector> Drop for Session<C> {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_unit(register_type: RegisterType, address: u16, len: usize) -> Result<ModbusUnit, AccessError> {
    let unit = ModbusUnit::builder()
        .address(address)
        .length(len)
        .register_type(register_type)
        .build_for_write()?;
    Ok(unit)
}

fn not_responding(register_type: RegisterType, address: u16, error: ModbusUnitError) -> AccessError {
    AccessError::NotResponding {
        register_type,
        address,
        source: ModbusTransportError::Protocol(error),
    }
}

fn first<T>(values: Vec<T>, register_type: RegisterType, address: u16) -> Result<T, AccessError> {
    values
        .into_iter()
        .next()
        .ok_or_else(|| not_responding(register_type, address, ModbusUnitError::EmptyResponse))
}
