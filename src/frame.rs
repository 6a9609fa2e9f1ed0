//! # Modbus Frames
//!
//! A frame is one decoded request or response unit together with the framing
//! of the transport that carried it. The server core never looks at the
//! framing: it reads the function code and payload through the [`Frame`]
//! trait, builds the response by copying the request frame and overwriting its
//! payload (or setting an exception), then hands `to_bytes()` back to the
//! connection.
//!
//! ## Encodings
//!
//! | Type | Wire format |
//! |------|-------------|
//! | [`TcpFrame`] | MBAP header (transaction, protocol, length, unit) + PDU |
//! | [`RtuFrame`] | address + PDU + CRC-16 (little-endian) |
//! | [`AsciiFrame`] | `:` + hex(address + PDU + LRC) + CRLF |
//!
//! ## Example
//!
//! ```rust
//! use voltage_mbserver::frame::{Frame, TcpFrame};
//! use voltage_mbserver::protocol::ModbusException;
//!
//! let raw = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03];
//! let request = TcpFrame::decode(&raw).unwrap();
//! assert_eq!(request.function(), 0x03);
//!
//! let mut response = request.copy();
//! response.set_exception(ModbusException::IllegalDataAddress);
//! assert_eq!(response.to_bytes(), vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x11, 0x83, 0x02]);
//! ```

use std::fmt;
use crc::{Crc, CRC_16_MODBUS};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusException, UnitId, EXCEPTION_FLAG};

/// Modbus TCP Application Protocol header size (without the unit identifier)
pub const MBAP_HEADER_SIZE: usize = 6;

/// Largest MBAP length field value: unit id + 253-byte PDU
pub const MAX_MBAP_LENGTH: usize = 254;

/// Largest RTU frame: address + 253-byte PDU + CRC
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Largest ASCII frame: `:` + 2 × (address + PDU + LRC) + CRLF
pub const MAX_ASCII_FRAME_SIZE: usize = 513;

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Decoded protocol unit, polymorphic over the transport encoding
///
/// Implementations must be cheap to copy; the server copies every request
/// frame to build its response.
pub trait Frame: Send + Sync + fmt::Debug {
    /// Unit identifier (MBAP unit id or serial slave address)
    fn unit_id(&self) -> UnitId;

    /// Function code, including the exception flag on exception frames
    fn function(&self) -> u8;

    /// Function-specific payload following the function code
    fn data(&self) -> &[u8];

    /// Deep copy of this frame
    fn copy(&self) -> Box<dyn Frame>;

    /// Replace the payload
    fn set_data(&mut self, data: Vec<u8>);

    /// Turn this frame into an exception response for its function
    fn set_exception(&mut self, exception: ModbusException);

    /// Serialize with the transport's framing
    fn to_bytes(&self) -> Vec<u8>;

    /// Function code followed by the payload
    fn pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(1 + self.data().len());
        pdu.push(self.function());
        pdu.extend_from_slice(self.data());
        pdu
    }
}

/// Split a PDU slice into function code and payload
fn split_pdu(pdu: &[u8]) -> ModbusResult<(u8, Vec<u8>)> {
    match pdu.split_first() {
        Some((&function, data)) => Ok((function, data.to_vec())),
        None => Err(ModbusError::frame("Missing function code")),
    }
}

/// Modbus TCP frame (MBAP header + PDU)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpFrame {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: UnitId,
    pub function: u8,
    pub data: Vec<u8>,
}

impl TcpFrame {
    /// Build a frame around a PDU
    pub fn new(transaction_id: u16, unit_id: UnitId, pdu: &[u8]) -> ModbusResult<Self> {
        let (function, data) = split_pdu(pdu)?;
        Ok(Self {
            transaction_id,
            protocol_id: 0,
            unit_id,
            function,
            data,
        })
    }

    /// Total frame size announced by an MBAP header
    ///
    /// Returns `Ok(None)` while fewer than [`MBAP_HEADER_SIZE`] bytes are
    /// available, and an error for headers no valid frame can carry.
    pub fn frame_length(buffer: &[u8]) -> ModbusResult<Option<usize>> {
        if buffer.len() < MBAP_HEADER_SIZE {
            return Ok(None);
        }

        let protocol_id = u16::from_be_bytes([buffer[2], buffer[3]]);
        if protocol_id != 0 {
            return Err(ModbusError::frame(format!("Invalid protocol ID: {}", protocol_id)));
        }

        let length = u16::from_be_bytes([buffer[4], buffer[5]]) as usize;
        if !(2..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(ModbusError::frame(format!("Invalid MBAP length: {}", length)));
        }

        Ok(Some(MBAP_HEADER_SIZE + length))
    }

    /// Decode one complete MBAP frame
    pub fn decode(frame: &[u8]) -> ModbusResult<Self> {
        if frame.len() < MBAP_HEADER_SIZE + 2 {
            return Err(ModbusError::frame("Frame too short"));
        }

        let expected = Self::frame_length(frame)?
            .ok_or_else(|| ModbusError::frame("Incomplete MBAP header"))?;
        if frame.len() != expected {
            return Err(ModbusError::frame(format!(
                "Frame length mismatch: header announces {} bytes, got {}",
                expected, frame.len()
            )));
        }

        Ok(Self {
            transaction_id: u16::from_be_bytes([frame[0], frame[1]]),
            protocol_id: 0,
            unit_id: frame[6],
            function: frame[7],
            data: frame[MBAP_HEADER_SIZE + 2..].to_vec(),
        })
    }
}

impl Frame for TcpFrame {
    fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    fn function(&self) -> u8 {
        self.function
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn copy(&self) -> Box<dyn Frame> {
        Box::new(self.clone())
    }

    fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    fn set_exception(&mut self, exception: ModbusException) {
        self.function |= EXCEPTION_FLAG;
        self.data = vec![exception.to_u8()];
    }

    fn to_bytes(&self) -> Vec<u8> {
        // unit_id + function_code + data
        let length = self.data.len() + 2;
        let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + length);

        frame.extend_from_slice(&self.transaction_id.to_be_bytes());
        frame.extend_from_slice(&self.protocol_id.to_be_bytes());
        frame.extend_from_slice(&(length as u16).to_be_bytes());
        frame.push(self.unit_id);
        frame.push(self.function);
        frame.extend_from_slice(&self.data);

        frame
    }
}

/// Modbus RTU frame (address + PDU + CRC)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    pub address: UnitId,
    pub function: u8,
    pub data: Vec<u8>,
}

impl RtuFrame {
    /// Build a frame around a PDU
    pub fn new(address: UnitId, pdu: &[u8]) -> ModbusResult<Self> {
        let (function, data) = split_pdu(pdu)?;
        Ok(Self { address, function, data })
    }

    /// Calculate CRC for RTU frame
    pub fn calculate_crc(data: &[u8]) -> u16 {
        CRC_MODBUS.checksum(data)
    }

    /// Decode one complete RTU frame, verifying its CRC
    pub fn decode(frame: &[u8]) -> ModbusResult<Self> {
        if frame.len() < 4 {
            return Err(ModbusError::frame("RTU frame too short"));
        }
        if frame.len() > MAX_RTU_FRAME_SIZE {
            return Err(ModbusError::frame(format!("RTU frame too long: {} bytes", frame.len())));
        }

        let data_len = frame.len() - 2;
        let received_crc = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
        let calculated_crc = Self::calculate_crc(&frame[..data_len]);

        if received_crc != calculated_crc {
            return Err(ModbusError::crc_mismatch(calculated_crc, received_crc));
        }

        Ok(Self {
            address: frame[0],
            function: frame[1],
            data: frame[2..data_len].to_vec(),
        })
    }
}

impl Frame for RtuFrame {
    fn unit_id(&self) -> UnitId {
        self.address
    }

    fn function(&self) -> u8 {
        self.function
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn copy(&self) -> Box<dyn Frame> {
        Box::new(self.clone())
    }

    fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    fn set_exception(&mut self, exception: ModbusException) {
        self.function |= EXCEPTION_FLAG;
        self.data = vec![exception.to_u8()];
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(4 + self.data.len());
        frame.push(self.address);
        frame.push(self.function);
        frame.extend_from_slice(&self.data);

        // CRC is little-endian in RTU
        let crc = Self::calculate_crc(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }
}

/// Modbus ASCII frame (`:AAFFDDD...LRC\r\n`)
///
/// - `:` - Start character
/// - `AA` - Address (2 ASCII chars)
/// - `FF` - Function code (2 ASCII chars)
/// - `DDD...` - Data (variable length ASCII chars)
/// - `LRC` - Checksum (2 ASCII chars)
/// - `CRLF` - End characters (0x0D, 0x0A)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiFrame {
    pub address: UnitId,
    pub function: u8,
    pub data: Vec<u8>,
}

impl AsciiFrame {
    /// Build a frame around a PDU
    pub fn new(address: UnitId, pdu: &[u8]) -> ModbusResult<Self> {
        let (function, data) = split_pdu(pdu)?;
        Ok(Self { address, function, data })
    }

    /// Longitudinal redundancy check: two's complement of the byte sum
    pub fn calculate_lrc(data: &[u8]) -> u8 {
        data.iter()
            .fold(0u8, |sum, &byte| sum.wrapping_add(byte))
            .wrapping_neg()
    }

    /// Decode one complete ASCII frame, verifying its LRC
    pub fn decode(frame: &[u8]) -> ModbusResult<Self> {
        if frame.first() != Some(&b':') {
            return Err(ModbusError::frame("ASCII frame must start with ':'"));
        }
        if !frame.ends_with(b"\r\n") {
            return Err(ModbusError::frame("ASCII frame must end with CRLF"));
        }

        let body = &frame[1..frame.len() - 2];
        let raw = hex::decode(body)
            .map_err(|e| ModbusError::frame(format!("Invalid ASCII hex payload: {}", e)))?;

        // address + function + lrc
        if raw.len() < 3 {
            return Err(ModbusError::frame("ASCII frame too short"));
        }

        let (&received_lrc, content) = raw.split_last()
            .ok_or_else(|| ModbusError::frame("ASCII frame too short"))?;
        let calculated_lrc = Self::calculate_lrc(content);
        if received_lrc != calculated_lrc {
            return Err(ModbusError::frame(format!(
                "LRC mismatch: expected 0x{:02X}, got 0x{:02X}",
                calculated_lrc, received_lrc
            )));
        }

        Ok(Self {
            address: content[0],
            function: content[1],
            data: content[2..].to_vec(),
        })
    }
}

impl Frame for AsciiFrame {
    fn unit_id(&self) -> UnitId {
        self.address
    }

    fn function(&self) -> u8 {
        self.function
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn copy(&self) -> Box<dyn Frame> {
        Box::new(self.clone())
    }

    fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    fn set_exception(&mut self, exception: ModbusException) {
        self.function |= EXCEPTION_FLAG;
        self.data = vec![exception.to_u8()];
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(3 + self.data.len());
        raw.push(self.address);
        raw.push(self.function);
        raw.extend_from_slice(&self.data);
        raw.push(Self::calculate_lrc(&raw));

        let mut frame = Vec::with_capacity(3 + raw.len() * 2);
        frame.push(b':');
        frame.extend_from_slice(hex::encode_upper(&raw).as_bytes());
        frame.extend_from_slice(b"\r\n");
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_decode_and_reply() {
        let raw = [0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x01, 0x00, 0x03];
        let frame = TcpFrame::decode(&raw).unwrap();
        assert_eq!(frame.transaction_id, 0x1234);
        assert_eq!(frame.unit_id(), 0x01);
        assert_eq!(frame.function(), 0x06);
        assert_eq!(frame.data(), &[0x00, 0x01, 0x00, 0x03]);

        // Echo responses serialize back to the request bytes
        assert_eq!(frame.copy().to_bytes(), raw.to_vec());

        let mut response = frame.copy();
        response.set_data(vec![0x02, 0xAB, 0xCD]);
        assert_eq!(
            response.to_bytes(),
            vec![0x12, 0x34, 0x00, 0x00, 0x00, 0x05, 0x01, 0x06, 0x02, 0xAB, 0xCD]
        );
    }

    #[test]
    fn test_tcp_decode_errors() {
        assert!(TcpFrame::decode(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01]).is_err());
        // Non-zero protocol id
        assert!(TcpFrame::decode(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x02, 0x01, 0x03]).is_err());
        // Length field disagrees with the buffer
        assert!(TcpFrame::decode(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03]).is_err());
    }

    #[test]
    fn test_tcp_frame_length() {
        assert_eq!(TcpFrame::frame_length(&[0x00, 0x01, 0x00]).unwrap(), None);
        assert_eq!(
            TcpFrame::frame_length(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06]).unwrap(),
            Some(12)
        );
        assert!(TcpFrame::frame_length(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00]).is_err());
    }

    #[test]
    fn test_rtu_crc_known_vector() {
        // 01 03 00 00 00 02 C4 0B
        let raw = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B];
        assert_eq!(RtuFrame::calculate_crc(&raw[..6]), 0x0BC4);

        let frame = RtuFrame::decode(&raw).unwrap();
        assert_eq!(frame.address, 0x01);
        assert_eq!(frame.function, 0x03);
        assert_eq!(frame.data, vec![0x00, 0x00, 0x00, 0x02]);
        assert_eq!(frame.to_bytes(), raw.to_vec());
    }

    #[test]
    fn test_rtu_crc_mismatch() {
        let raw = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0C];
        match RtuFrame::decode(&raw) {
            Err(ModbusError::CrcMismatch { expected, actual }) => {
                assert_eq!(expected, 0x0BC4);
                assert_eq!(actual, 0x0CC4);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_rtu_exception_frame() {
        let mut frame = RtuFrame::new(0x01, &[0x08, 0x00, 0x00]).unwrap();
        frame.set_exception(ModbusException::IllegalFunction);

        let bytes = frame.to_bytes();
        assert_eq!(&bytes[..3], &[0x01, 0x88, 0x01]);
        assert!(RtuFrame::decode(&bytes).is_ok());
    }

    #[test]
    fn test_ascii_lrc_calculation() {
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        assert_eq!(AsciiFrame::calculate_lrc(&data), 0xFA);

        // Sums past 0xFF wrap
        assert_eq!(AsciiFrame::calculate_lrc(&[0xFF, 0xFF, 0x02]), 0x00);
    }

    #[test]
    fn test_ascii_frame_encoding() {
        let frame = AsciiFrame::new(0x01, &[0x03, 0x00, 0x00, 0x00, 0x02]).unwrap();
        assert_eq!(frame.to_bytes(), b":010300000002FA\r\n".to_vec());

        let decoded = AsciiFrame::decode(b":010300000002fa\r\n").unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_ascii_error_handling() {
        assert!(AsciiFrame::decode(b"X010300000002FA\r\n").is_err());
        assert!(AsciiFrame::decode(b":010300000002FA\r\r").is_err());
        assert!(AsciiFrame::decode(b":01030000002FA\r\n").is_err());
        assert!(AsciiFrame::decode(b":010300000002FF\r\n").is_err());
        assert!(AsciiFrame::decode(b":01FE\r\n").is_err());
    }

    #[test]
    fn test_pdu_accessor() {
        let frame = RtuFrame::new(0x11, &[0x03, 0x00, 0x6B, 0x00, 0x03]).unwrap();
        assert_eq!(frame.pdu(), vec![0x03, 0x00, 0x6B, 0x00, 0x03]);
        assert!(RtuFrame::new(0x11, &[]).is_err());
    }
}
