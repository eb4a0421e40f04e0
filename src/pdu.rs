use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_WORDS: u16 = 125;
pub const MAX_WRITE_BITS: u16 = 1968;
pub const MAX_WRITE_WORDS: u16 = 123;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

#[derive(Debug, Error)]
pub enum ModbusUnitError {
    #[error("Invalid quantity {quantity} for {register_type} (allowed 1..={max})")]
    InvalidLength {
        register_type: RegisterType,
        quantity: usize,
        max: u16,
    },

    #[error("Invalid range: {0} + {1} exceeds address space")]
    RangeToMatch(u16, usize),

    #[error("Type {0} has no write command")]
    InvalidRegisterTypeForWriteCommand(RegisterType),

    #[error("Empty response received")]
    EmptyResponse,

    #[error("Modbus exception: function code {0:#04x}, exception code {1:#04x}")]
    ModbusException(u8, u8),

    #[error("Unexpected function code: expected {0:#04x}, got {1:#04x}")]
    UnexpectedFunctionCode(u8, u8),

    #[error("Invalid response length")]
    InvalidResponseLength,

    #[error("Data length mismatch: expected {expected}, got {actual}")]
    DataLengthMismatch { expected: usize, actual: usize },

    #[error("Write was not acknowledged: response does not echo request")]
    WriteEchoMismatch,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Coil,
    Discrete,
    Holding,
}

impl RegisterType {
    pub fn read_command(self) -> u8 {
        match self {
            RegisterType::Coil => 0x01,
            RegisterType::Discrete => 0x02,
            RegisterType::Holding => 0x03,
        }
    }

    fn max_read(self) -> u16 {
        match self {
            RegisterType::Coil | RegisterType::Discrete => MAX_READ_BITS,
            RegisterType::Holding => MAX_READ_WORDS,
        }
    }

    fn is_bit(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Discrete)
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterType::Coil => "coil",
            RegisterType::Discrete => "discrete",
            RegisterType::Holding => "holding",
        };
        f.write_str(name)
    }
}

/// Decoded payload of a read response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadValues {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

impl ReadValues {
    pub fn len(&self) -> usize {
        match self {
            ReadValues::Bits(bits) => bits.len(),
            ReadValues::Words(words) => words.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_bits(self) -> Vec<bool> {
        match self {
            ReadValues::Bits(bits) => bits,
            ReadValues::Words(words) => words.into_iter().map(|w| w != 0).collect(),
        }
    }

    pub fn into_words(self) -> Vec<u16> {
        match self {
            ReadValues::Bits(bits) => bits.into_iter().map(u16::from).collect(),
            ReadValues::Words(words) => words,
        }
    }
}

/// One contiguous block of points of a single register type.
pub struct ModbusUnit {
    start_addr: u16,
    length: u16,
    register_type: RegisterType,
}

pub struct ModbusUnitBuilder {
    start_addr: u16,
    length: usize,
    register_type: RegisterType,
}

impl ModbusUnitBuilder {
    pub fn address(mut self, addr: u16) -> Self {
        self.start_addr = addr;
        self
    }

    pub fn length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    pub fn register_type(mut self, register_type: RegisterType) -> Self {
        self.register_type = register_type;
        self
    }

    /// Validates the block against the read quantity limits of its type.
    pub fn build(self) -> Result<ModbusUnit, ModbusUnitError> {
        let max = self.register_type.max_read();
        self.build_with_limit(max)
    }

    /// Write blocks are bounded by the write quantity limit instead of the read one.
    pub fn build_for_write(self) -> Result<ModbusUnit, ModbusUnitError> {
        let max = match self.register_type {
            RegisterType::Coil => MAX_WRITE_BITS,
            RegisterType::Holding => MAX_WRITE_WORDS,
            RegisterType::Discrete => {
                return Err(ModbusUnitError::InvalidRegisterTypeForWriteCommand(self.register_type));
            }
        };
        self.build_with_limit(max)
    }

    fn build_with_limit(self, max: u16) -> Result<ModbusUnit, ModbusUnitError> {
        if self.length == 0 || self.length > max as usize {
            return Err(ModbusUnitError::InvalidLength {
                register_type: self.register_type,
                quantity: self.length,
                max,
            });
        }
        if self.start_addr as usize + self.length > u16::MAX as usize + 1 {
            return Err(ModbusUnitError::RangeToMatch(self.start_addr, self.length));
        }
        Ok(ModbusUnit {
            start_addr: self.start_addr,
            length: self.length as u16,
            register_type: self.register_type,
        })
    }
}

impl ModbusUnit {
    pub fn builder() -> ModbusUnitBuilder {
        ModbusUnitBuilder {
            start_addr: 0,
            length: 1,
            register_type: RegisterType::Coil,
        }
    }

    pub fn start_addr(&self) -> u16 {
        self.start_addr
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn register_type(&self) -> RegisterType {
        self.register_type
    }

    pub fn create_read_request(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(5);
        msg.push(self.register_type.read_command());
        msg.extend_from_slice(&self.start_addr.to_be_bytes());
        msg.extend_from_slice(&self.length.to_be_bytes());
        msg
    }

    /// Single-coil writes use FC 0x05, longer runs FC 0x0F.
    pub fn create_coils_write_request(&self, data: &[bool]) -> Result<Vec<u8>, ModbusUnitError> {
        if self.register_type != RegisterType::Coil {
            return Err(ModbusUnitError::InvalidRegisterTypeForWriteCommand(self.register_type));
        }
        self.check_write_length(data.len(), MAX_WRITE_BITS)?;

        let mut result = Vec::with_capacity(6 + data.len().div_ceil(8));
        if data.len() == 1 {
            result.push(0x05);
            result.extend_from_slice(&self.start_addr.to_be_bytes());
            let value = if data[0] { COIL_ON } else { COIL_OFF };
            result.extend_from_slice(&value.to_be_bytes());
            return Ok(result);
        }

        let byte_count = data.len().div_ceil(8);
        result.push(0x0F);
        result.extend_from_slice(&self.start_addr.to_be_bytes());
        result.extend_from_slice(&(data.len() as u16).to_be_bytes());
        result.push(byte_count as u8);

        let mut bytes = vec![0u8; byte_count];
        for (i, &bit) in data.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        result.extend(bytes);
        Ok(result)
    }

    /// Single-register writes use FC 0x06, longer runs FC 0x10.
    pub fn create_registers_write_request(&self, data: &[u16]) -> Result<Vec<u8>, ModbusUnitError> {
        if self.register_type != RegisterType::Holding {
            return Err(ModbusUnitError::InvalidRegisterTypeForWriteCommand(self.register_type));
        }
        self.check_write_length(data.len(), MAX_WRITE_WORDS)?;

        let mut result = Vec::with_capacity(6 + data.len() * 2);
        if data.len() == 1 {
            result.push(0x06);
            result.extend_from_slice(&self.start_addr.to_be_bytes());
            result.extend_from_slice(&data[0].to_be_bytes());
            return Ok(result);
        }

        result.push(0x10);
        result.extend_from_slice(&self.start_addr.to_be_bytes());
        result.extend_from_slice(&(data.len() as u16).to_be_bytes());
        result.push((data.len() * 2) as u8);
        for value in data {
            result.extend_from_slice(&value.to_be_bytes());
        }
        Ok(result)
    }

    fn check_write_length(&self, len: usize, max: u16) -> Result<(), ModbusUnitError> {
        if len != self.length as usize {
            return Err(ModbusUnitError::DataLengthMismatch {
                expected: self.length as usize,
                actual: len,
            });
        }
        if len > max as usize {
            return Err(ModbusUnitError::InvalidLength {
                register_type: self.register_type,
                quantity: len,
                max,
            });
        }
        Ok(())
    }

    pub fn parse_response(&self, pdu: &[u8]) -> Result<ReadValues, ModbusUnitError> {
        let expected_fc = self.register_type.read_command();
        check_function_code(pdu, expected_fc)?;

        if self.register_type.is_bit() {
            self.parse_bits(pdu).map(ReadValues::Bits)
        } else {
            self.parse_words(pdu).map(ReadValues::Words)
        }
    }

    /// A write is acknowledged only when the device echoes the request
    /// (the whole PDU for 0x05/0x06, address and quantity for 0x0F/0x10).
    pub fn parse_write_response(&self, request: &[u8], pdu: &[u8]) -> Result<(), ModbusUnitError> {
        let expected_fc = *request.first().ok_or(ModbusUnitError::EmptyResponse)?;
        check_function_code(pdu, expected_fc)?;

        if pdu.len() != 5 {
            return Err(ModbusUnitError::InvalidResponseLength);
        }
        let echoed = match expected_fc {
            0x05 | 0x06 => pdu == request,
            _ => request.len() >= 5 && pdu[..5] == request[..5],
        };
        if !echoed {
            return Err(ModbusUnitError::WriteEchoMismatch);
        }
        Ok(())
    }

    fn parse_words(&self, pdu: &[u8]) -> Result<Vec<u16>, ModbusUnitError> {
        if pdu.len() < 2 {
            return Err(ModbusUnitError::InvalidResponseLength);
        }

        let byte_count = pdu[1] as usize;
        let expected_bytes = self.length as usize * 2;

        if byte_count != expected_bytes || pdu.len() < 2 + byte_count {
            return Err(ModbusUnitError::InvalidResponseLength);
        }

        Ok(pdu[2..2 + byte_count]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    fn parse_bits(&self, pdu: &[u8]) -> Result<Vec<bool>, ModbusUnitError> {
        if pdu.len() < 2 {
            return Err(ModbusUnitError::InvalidResponseLength);
        }

        let byte_count = pdu[1] as usize;
        let expected_bytes = (self.length as usize).div_ceil(8);

        if byte_count != expected_bytes || pdu.len() < 2 + byte_count {
            return Err(ModbusUnitError::InvalidResponseLength);
        }

        Ok((0..self.length as usize)
            .map(|i| (pdu[2 + i / 8] >> (i % 8)) & 0x01 == 1)
            .collect())
    }
}

/// Rejects exception responses (function code | 0x80) and foreign function codes.
fn check_function_code(pdu: &[u8], expected_fc: u8) -> Result<(), ModbusUnitError> {
    let function_code = *pdu.first().ok_or(ModbusUnitError::EmptyResponse)?;

    if function_code & 0x80 != 0 {
        let exception_code = pdu.get(1).copied().unwrap_or(0);
        return Err(ModbusUnitError::ModbusException(function_code, exception_code));
    }
    if function_code != expected_fc {
        return Err(ModbusUnitError::UnexpectedFunctionCode(expected_fc, function_code));
    }
    Ok(())
}
