/// Modbus protocol definitions and data structures
///
/// This module contains the protocol vocabulary shared by the frames, codecs
/// and the dispatcher: function codes, the exception catalog, PDU builders for
/// requests and a parser for response PDUs.

use serde::{Deserialize, Serialize};
use std::fmt;
use crate::error::{ModbusError, ModbusResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value)
pub type ModbusValue = u16;

/// Modbus unit identifier carried by MBAP headers and serial frames
pub type UnitId = u8;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Wire value of an energised coil in Write Single Coil
pub const COIL_ON: u16 = 0xFF00;

/// Wire value of a de-energised coil in Write Single Coil
pub const COIL_OFF: u16 = 0x0000;

/// Modbus function codes served by the default dispatch table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable function name
    pub fn name(self) -> &'static str {
        match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(self,
            ModbusFunction::ReadCoils |
            ModbusFunction::ReadDiscreteInputs |
            ModbusFunction::ReadHoldingRegisters |
            ModbusFunction::ReadInputRegisters
        )
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        !self.is_read_function()
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Modbus exception catalog
///
/// Fixed, process-wide set of in-band error conditions. The absence of an
/// exception ("success") is expressed by `Ok` in codec results, so code 0 is
/// never a member of this catalog and never goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveDeviceFailure = 0x04,
    Acknowledge = 0x05,
    SlaveDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::SlaveDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::SlaveDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Short catalog name
    pub fn name(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "Illegal Function",
            ModbusException::IllegalDataAddress => "Illegal Data Address",
            ModbusException::IllegalDataValue => "Illegal Data Value",
            ModbusException::SlaveDeviceFailure => "Slave Device Failure",
            ModbusException::Acknowledge => "Acknowledge",
            ModbusException::SlaveDeviceBusy => "Slave Device Busy",
            ModbusException::MemoryParityError => "Memory Parity Error",
            ModbusException::GatewayPathUnavailable => "Gateway Path Unavailable",
            ModbusException::GatewayTargetDeviceFailedToRespond => "Gateway Target Device Failed to Respond",
        }
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "The function code received in the query is not an allowable action for the server",
            ModbusException::IllegalDataAddress => "The data address received in the query is not an allowable address for the server",
            ModbusException::IllegalDataValue => "A value contained in the query data field is not an allowable value for server",
            ModbusException::SlaveDeviceFailure => "An unrecoverable error occurred while the server was attempting to perform the requested action",
            ModbusException::Acknowledge => "The server has accepted the request and is processing it, but a long duration of time will be required to do so",
            ModbusException::SlaveDeviceBusy => "The server is engaged in processing a long-duration program command",
            ModbusException::MemoryParityError => "The server attempted to read record file, but detected a parity error in the memory",
            ModbusException::GatewayPathUnavailable => "Gateway was unable to allocate an internal communication path",
            ModbusException::GatewayTargetDeviceFailedToRespond => "No response was obtained from the target device",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Modbus request PDU builder
///
/// The server never needs this type; it exists so integrators and tests can
/// produce well-formed request PDUs without hand-assembling bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub function: ModbusFunction,
    pub address: ModbusAddress,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl ModbusRequest {
    /// Create a new read request (0x01-0x04)
    pub fn new_read(function: ModbusFunction, address: ModbusAddress, quantity: u16) -> Self {
        Self {
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Create a Write Single Coil request (0x05)
    pub fn write_single_coil(address: ModbusAddress, value: bool) -> Self {
        let value = if value { COIL_ON } else { COIL_OFF };
        Self {
            function: ModbusFunction::WriteSingleCoil,
            address,
            quantity: 1,
            data: value.to_be_bytes().to_vec(),
        }
    }

    /// Create a Write Single Register request (0x06)
    pub fn write_single_register(address: ModbusAddress, value: ModbusValue) -> Self {
        Self {
            function: ModbusFunction::WriteSingleRegister,
            address,
            quantity: 1,
            data: value.to_be_bytes().to_vec(),
        }
    }

    /// Create a Write Multiple Coils request (0x0F)
    pub fn write_multiple_coils(address: ModbusAddress, values: &[bool]) -> Self {
        Self {
            function: ModbusFunction::WriteMultipleCoils,
            address,
            quantity: values.len() as u16,
            data: data_utils::pack_bits(values),
        }
    }

    /// Create a Write Multiple Registers request (0x10)
    pub fn write_multiple_registers(address: ModbusAddress, values: &[ModbusValue]) -> Self {
        Self {
            function: ModbusFunction::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            data: data_utils::registers_to_bytes(values),
        }
    }

    /// Encode to a PDU: function code followed by the function-specific fields
    pub fn to_pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(6 + self.data.len());
        pdu.push(self.function.to_u8());
        pdu.extend_from_slice(&self.address.to_be_bytes());

        match self.function {
            ModbusFunction::ReadCoils |
            ModbusFunction::ReadDiscreteInputs |
            ModbusFunction::ReadHoldingRegisters |
            ModbusFunction::ReadInputRegisters => {
                pdu.extend_from_slice(&self.quantity.to_be_bytes());
            },

            ModbusFunction::WriteSingleCoil |
            ModbusFunction::WriteSingleRegister => {
                pdu.extend_from_slice(&self.data);
            },

            ModbusFunction::WriteMultipleCoils |
            ModbusFunction::WriteMultipleRegisters => {
                pdu.extend_from_slice(&self.quantity.to_be_bytes());
                pdu.push(self.data.len() as u8);
                pdu.extend_from_slice(&self.data);
            },
        }

        pdu
    }
}

/// Modbus response PDU, as read back by a client
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    /// Function code with the exception flag stripped
    pub function: u8,
    pub data: Vec<u8>,
    pub exception: Option<ModbusException>,
}

impl ModbusResponse {
    /// Parse a response PDU (function code + payload)
    pub fn from_pdu(pdu: &[u8]) -> ModbusResult<Self> {
        let (&function, data) = pdu.split_first()
            .ok_or_else(|| ModbusError::frame("Empty response PDU"))?;

        if function & EXCEPTION_FLAG != 0 {
            let code = *data.first()
                .ok_or_else(|| ModbusError::frame("Exception response without exception code"))?;
            let exception = ModbusException::from_u8(code)
                .ok_or_else(|| ModbusError::exception(function & !EXCEPTION_FLAG, code))?;

            return Ok(Self {
                function: function & !EXCEPTION_FLAG,
                data: Vec::new(),
                exception: Some(exception),
            });
        }

        Ok(Self {
            function,
            data: data.to_vec(),
            exception: None,
        })
    }

    /// Check if this is an exception response
    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Get exception error if present
    pub fn get_exception(&self) -> Option<ModbusError> {
        self.exception.map(|exc| ModbusError::exception(self.function, exc.to_u8()))
    }

    fn ensure_success(&self) -> ModbusResult<()> {
        match self.get_exception() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Parse response data as registers (u16 values)
    pub fn parse_registers(&self) -> ModbusResult<Vec<u16>> {
        self.ensure_success()?;

        let (&byte_count, payload) = self.data.split_first()
            .ok_or_else(|| ModbusError::frame("Empty response data"))?;
        let byte_count = byte_count as usize;

        if payload.len() < byte_count {
            return Err(ModbusError::frame("Incomplete register data"));
        }

        data_utils::bytes_to_registers(&payload[..byte_count])
            .map_err(|_| ModbusError::frame("Invalid register data length"))
    }

    /// Parse response data as bits (bool values)
    ///
    /// Returns every bit of every data byte; callers truncate to the quantity
    /// they asked for.
    pub fn parse_bits(&self) -> ModbusResult<Vec<bool>> {
        self.ensure_success()?;

        let (&byte_count, payload) = self.data.split_first()
            .ok_or_else(|| ModbusError::frame("Empty response data"))?;
        let byte_count = byte_count as usize;

        if payload.len() < byte_count {
            return Err(ModbusError::frame("Incomplete bit data"));
        }

        Ok(data_utils::unpack_bits(&payload[..byte_count], byte_count * 8))
    }

    /// Parse the (address, value-or-quantity) echo of a write response
    pub fn parse_echo(&self) -> ModbusResult<(u16, u16)> {
        self.ensure_success()?;

        if self.data.len() != 4 {
            return Err(ModbusError::frame(format!(
                "Write echo must be 4 bytes, got {}", self.data.len()
            )));
        }

        Ok((
            u16::from_be_bytes([self.data[0], self.data[1]]),
            u16::from_be_bytes([self.data[2], self.data[3]]),
        ))
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(ModbusError::invalid_data("Byte array length must be even".to_string()));
        }

        Ok(bytes.chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    /// Pack boolean values into bytes, LSB first
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let byte_count = (bits.len() + 7) / 8;
        let mut bytes = vec![0u8; byte_count];

        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }

        bytes
    }

    /// Unpack bytes into boolean values, LSB first
    ///
    /// Bits beyond the end of `bytes` read as `false`.
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| {
                bytes.get(i / 8)
                    .map(|byte| byte & (1 << (i % 8)) != 0)
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(ModbusFunction::from_u8(0x03).unwrap(), ModbusFunction::ReadHoldingRegisters);
        assert_eq!(ModbusFunction::ReadHoldingRegisters.to_u8(), 0x03);

        assert!(ModbusFunction::from_u8(0xFF).is_err());
        assert!(ModbusFunction::WriteMultipleCoils.is_write_function());
        assert!(ModbusFunction::ReadDiscreteInputs.is_read_function());
    }

    #[test]
    fn test_exception_conversion() {
        assert_eq!(ModbusException::from_u8(0x02).unwrap(), ModbusException::IllegalDataAddress);
        assert_eq!(ModbusException::IllegalDataAddress.to_u8(), 0x02);
        assert_eq!(ModbusException::from_u8(0x00), None);
    }

    #[test]
    fn test_request_pdu_encoding() {
        let read = ModbusRequest::new_read(ModbusFunction::ReadHoldingRegisters, 0x006B, 3);
        assert_eq!(read.to_pdu(), vec![0x03, 0x00, 0x6B, 0x00, 0x03]);

        let coil = ModbusRequest::write_single_coil(0x00AC, true);
        assert_eq!(coil.to_pdu(), vec![0x05, 0x00, 0xAC, 0xFF, 0x00]);

        let coils = ModbusRequest::write_multiple_coils(
            0x0013,
            &[true, false, true, true, false, false, true, true, true, false],
        );
        assert_eq!(coils.to_pdu(), vec![0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]);

        let registers = ModbusRequest::write_multiple_registers(0x0001, &[0x000A, 0x0102]);
        assert_eq!(
            registers.to_pdu(),
            vec![0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
    }

    #[test]
    fn test_data_utils() {
        let registers = vec![0x1234, 0x5678];
        let bytes = data_utils::registers_to_bytes(&registers);
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);
        assert!(data_utils::bytes_to_registers(&bytes[..3]).is_err());

        let bits = vec![true, false, true, true, false, false, false, false, true];
        let packed = data_utils::pack_bits(&bits);
        assert_eq!(packed, vec![0b0000_1101, 0b0000_0001]);
        assert_eq!(data_utils::unpack_bits(&packed, bits.len()), bits);
    }

    #[test]
    fn test_response_parsing() {
        let response = ModbusResponse::from_pdu(&[0x03, 4, 0x12, 0x34, 0x56, 0x78]).unwrap();
        assert_eq!(response.parse_registers().unwrap(), vec![0x1234, 0x5678]);

        let response = ModbusResponse::from_pdu(&[0x01, 1, 0b1010_1010]).unwrap();
        let bits = response.parse_bits().unwrap();
        assert!(!bits[0]); // LSB first
        assert!(bits[1]);
        assert!(!bits[2]);
        assert!(bits[3]);

        let response = ModbusResponse::from_pdu(&[0x06, 0x00, 0x01, 0x00, 0x03]).unwrap();
        assert_eq!(response.parse_echo().unwrap(), (1, 3));
    }

    #[test]
    fn test_exception_response_parsing() {
        let response = ModbusResponse::from_pdu(&[0x83, 0x02]).unwrap();
        assert!(response.is_exception());
        assert_eq!(response.function, 0x03);
        assert_eq!(response.exception, Some(ModbusException::IllegalDataAddress));
        assert!(matches!(
            response.parse_registers(),
            Err(ModbusError::Exception { function: 0x03, code: 0x02, .. })
        ));

        assert!(ModbusResponse::from_pdu(&[0x83]).is_err());
        assert!(ModbusResponse::from_pdu(&[]).is_err());
    }
}
