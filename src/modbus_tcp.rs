use std::io::{ErrorKind, Read};

use super::*;

pub const MBAP_HEADER_LEN: usize = 7;
/// 7-byte MBAP header plus the 253-byte maximum PDU.
pub const MAX_ADU_LEN: usize = 260;

/// MBAP framing for one unit id, with a rolling transaction id.
pub struct ModbusTcpFramer {
    transaction_id: u16,
    unit_id: u8,
}

impl ModbusTcpFramer {
    pub fn new(unit_id: u8) -> Self {
        Self {
            transaction_id: 0,
            unit_id,
        }
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Wraps `pdu` in an MBAP header and returns the transaction id it was sent under.
    pub fn wrap_tcp(&mut self, pdu: &[u8]) -> (u16, Vec<u8>) {
        self.transaction_id = self.transaction_id.wrapping_add(1);

        let length = (pdu.len() + 1) as u16;
        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());

        frame.extend_from_slice(&self.transaction_id.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(&length.to_be_bytes());
        frame.push(self.unit_id);
        frame.extend_from_slice(pdu);

        (self.transaction_id, frame)
    }

    /// Validates the header of a complete response frame, returning its
    /// transaction id and PDU.
    pub fn unwrap_tcp<'a>(&self, frame: &'a [u8]) -> Result<(u16, &'a [u8]), ModbusTransportError> {
        if frame.len() < MBAP_HEADER_LEN + 1 {
            return Err(ModbusTransportError::FrameTooShort);
        }

        let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);

        let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
        if protocol_id != 0 {
            return Err(ModbusTransportError::InvalidProtocolId(protocol_id));
        }

        let length = u16::from_be_bytes([frame[4], frame[5]]);
        check_length_field(length)?;
        let expected_len = 6 + length as usize;
        if frame.len() < expected_len {
            return Err(ModbusTransportError::FrameTooShort);
        }

        let unit_id = frame[6];
        if unit_id != self.unit_id {
            return Err(ModbusTransportError::UnitIdMismatch {
                expected: self.unit_id,
                received: unit_id,
            });
        }

        Ok((transaction_id, &frame[MBAP_HEADER_LEN..expected_len]))
    }
}

fn check_length_field(length: u16) -> Result<(), ModbusTransportError> {
    // unit id + at least the function code, at most unit id + 253-byte PDU
    if !(2..=(MAX_ADU_LEN - 6) as u16).contains(&length) {
        return Err(ModbusTransportError::InvalidLength(length));
    }
    Ok(())
}

/// Reads exactly one MBAP frame from `reader`.
///
/// A read timeout before the first header byte arrives is reported as
/// [`ModbusTransportError::Timeout`] and leaves the stream aligned on a frame
/// boundary. Any failure after that point means the stream is desynchronised.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, ModbusTransportError> {
    let mut header = [0u8; MBAP_HEADER_LEN];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) => return Err(ModbusTransportError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if filled == 0 && is_timeout(&e) => return Err(ModbusTransportError::Timeout),
            Err(e) => return Err(ModbusTransportError::Io(e)),
        }
    }

    let length = u16::from_be_bytes([header[4], header[5]]);
    check_length_field(length)?;

    let mut frame = Vec::with_capacity(6 + length as usize);
    frame.extend_from_slice(&header);
    frame.resize(6 + length as usize, 0);
    reader.read_exact(&mut frame[MBAP_HEADER_LEN..]).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            ModbusTransportError::ConnectionClosed
        } else {
            ModbusTransportError::Io(e)
        }
    })?;
    Ok(frame)
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
