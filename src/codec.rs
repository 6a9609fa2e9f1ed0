//! # Standard Function Codecs
//!
//! One codec per supported function code. A codec decodes the request payload
//! of a [`Frame`], validates it, reads or mutates the
//! [`ModbusRegisterBank`] and returns the response payload (the bytes that
//! follow the function code in the response PDU). Validation failures are
//! returned as a [`ModbusException`]; codecs never panic on malformed input.
//!
//! | Code | Codec | Quantity | Response |
//! |------|-------|----------|----------|
//! | 0x01 | [`read_coils`] | 1..=2000 | byte count + packed bits |
//! | 0x02 | [`read_discrete_inputs`] | 1..=2000 | byte count + packed bits |
//! | 0x03 | [`read_holding_registers`] | 1..=125 | byte count + big-endian registers |
//! | 0x04 | [`read_input_registers`] | 1..=125 | byte count + big-endian registers |
//! | 0x05 | [`write_single_coil`] | - | echo address + value |
//! | 0x06 | [`write_holding_register`] | - | echo address + value |
//! | 0x0F | [`write_multiple_coils`] | 1..=1968 | echo address + quantity |
//! | 0x10 | [`write_holding_registers`] | 1..=123 | echo address + quantity |
//!
//! Quantity and byte-count violations yield `IllegalDataValue`; ranges running
//! past address 65535 yield `IllegalDataAddress`. Payloads of the wrong length
//! are treated as `IllegalDataValue`.

use std::sync::Arc;

use crate::frame::Frame;
use crate::protocol::{ModbusException, COIL_OFF, COIL_ON};
use crate::register_bank::ModbusRegisterBank;
use crate::utils::validation::{validate_address_range, validate_payload_len, validate_quantity};
use crate::{MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS};

/// Outcome of a codec: response payload, or the exception to answer with
pub type CodecResult = Result<Vec<u8>, ModbusException>;

/// A function handler as stored in the dispatch table
///
/// Handlers run inside the request serializer and get exclusive access to the
/// register bank for the duration of the call.
pub type FunctionHandler =
    Arc<dyn Fn(&mut ModbusRegisterBank, &dyn Frame) -> CodecResult + Send + Sync>;

/// Wrap a function or closure as a [`FunctionHandler`]
pub fn handler<F>(f: F) -> FunctionHandler
where
    F: Fn(&mut ModbusRegisterBank, &dyn Frame) -> CodecResult + Send + Sync + 'static,
{
    Arc::new(f)
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

/// Decode the leading address and quantity (or value) fields
fn address_and_quantity(data: &[u8]) -> Result<(u16, u16), ModbusException> {
    if data.len() < 4 {
        return Err(ModbusException::IllegalDataValue);
    }
    Ok((read_u16(data, 0), read_u16(data, 2)))
}

fn read_bits(space: &[u8], frame: &dyn Frame) -> CodecResult {
    let data = frame.data();
    validate_payload_len(data, 4)?;
    let (address, quantity) = address_and_quantity(data)?;

    validate_quantity(quantity, MAX_READ_COILS)?;
    validate_address_range(address, quantity)?;

    let start = address as usize;
    let bits = &space[start..start + quantity as usize];

    let byte_count = (quantity as usize + 7) / 8;
    let mut response = vec![0u8; 1 + byte_count];
    response[0] = byte_count as u8;

    for (i, &bit) in bits.iter().enumerate() {
        if bit != 0 {
            response[1 + i / 8] |= 1 << (i % 8);
        }
    }

    Ok(response)
}

fn read_registers(space: &[u16], frame: &dyn Frame) -> CodecResult {
    let data = frame.data();
    validate_payload_len(data, 4)?;
    let (address, quantity) = address_and_quantity(data)?;

    validate_quantity(quantity, MAX_READ_REGISTERS)?;
    validate_address_range(address, quantity)?;

    let start = address as usize;
    let registers = &space[start..start + quantity as usize];

    let mut response = Vec::with_capacity(1 + registers.len() * 2);
    response.push((quantity * 2) as u8);
    for register in registers {
        response.extend_from_slice(&register.to_be_bytes());
    }

    Ok(response)
}

/// Read Coils (0x01)
pub fn read_coils(bank: &mut ModbusRegisterBank, frame: &dyn Frame) -> CodecResult {
    read_bits(bank.coils(), frame)
}

/// Read Discrete Inputs (0x02)
pub fn read_discrete_inputs(bank: &mut ModbusRegisterBank, frame: &dyn Frame) -> CodecResult {
    read_bits(bank.discrete_inputs(), frame)
}

/// Read Holding Registers (0x03)
pub fn read_holding_registers(bank: &mut ModbusRegisterBank, frame: &dyn Frame) -> CodecResult {
    read_registers(bank.holding_registers(), frame)
}

/// Read Input Registers (0x04)
pub fn read_input_registers(bank: &mut ModbusRegisterBank, frame: &dyn Frame) -> CodecResult {
    read_registers(bank.input_registers(), frame)
}

/// Write Single Coil (0x05)
///
/// The value must be exactly `0xFF00` (on) or `0x0000` (off).
pub fn write_single_coil(bank: &mut ModbusRegisterBank, frame: &dyn Frame) -> CodecResult {
    let data = frame.data();
    validate_payload_len(data, 4)?;
    let (address, value) = address_and_quantity(data)?;

    let coil_value = match value {
        COIL_ON => true,
        COIL_OFF => false,
        _ => return Err(ModbusException::IllegalDataValue),
    };
    validate_address_range(address, 1)?;

    bank.write_single_coil(address, coil_value);

    Ok(data.to_vec())
}

/// Write Single Register (0x06)
pub fn write_holding_register(bank: &mut ModbusRegisterBank, frame: &dyn Frame) -> CodecResult {
    let data = frame.data();
    validate_payload_len(data, 4)?;
    let (address, value) = address_and_quantity(data)?;
    validate_address_range(address, 1)?;

    bank.write_single_register(address, value);

    Ok(data.to_vec())
}

/// Write Multiple Coils (0x0F)
pub fn write_multiple_coils(bank: &mut ModbusRegisterBank, frame: &dyn Frame) -> CodecResult {
    let data = frame.data();
    if data.len() < 5 {
        return Err(ModbusException::IllegalDataValue);
    }
    let (address, quantity) = address_and_quantity(data)?;
    let byte_count = data[4] as usize;

    validate_quantity(quantity, MAX_WRITE_COILS)?;
    if byte_count != (quantity as usize + 7) / 8 {
        return Err(ModbusException::IllegalDataValue);
    }
    validate_payload_len(data, 5 + byte_count)?;
    validate_address_range(address, quantity)?;

    let packed = &data[5..];
    let start = address as usize;
    for (i, coil) in bank.coils_mut()[start..start + quantity as usize].iter_mut().enumerate() {
        *coil = (packed[i / 8] >> (i % 8)) & 0x01;
    }

    Ok(data[..4].to_vec())
}

/// Write Multiple Registers (0x10)
pub fn write_holding_registers(bank: &mut ModbusRegisterBank, frame: &dyn Frame) -> CodecResult {
    let data = frame.data();
    if data.len() < 5 {
        return Err(ModbusException::IllegalDataValue);
    }
    let (address, quantity) = address_and_quantity(data)?;
    let byte_count = data[4] as usize;

    validate_quantity(quantity, MAX_WRITE_REGISTERS)?;
    if byte_count != quantity as usize * 2 {
        return Err(ModbusException::IllegalDataValue);
    }
    validate_payload_len(data, 5 + byte_count)?;
    validate_address_range(address, quantity)?;

    let start = address as usize;
    let registers = &mut bank.holding_registers_mut()[start..start + quantity as usize];
    for (register, chunk) in registers.iter_mut().zip(data[5..].chunks_exact(2)) {
        *register = u16::from_be_bytes([chunk[0], chunk[1]]);
    }

    Ok(data[..4].to_vec())
}
