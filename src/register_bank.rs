/// Modbus register bank (the device's memory banks)
///
/// Four independently addressed spaces of 65536 elements each: discrete
/// inputs, coils, holding registers and input registers. There is no locking
/// in here. The bank is owned by the request serializer and every access,
/// including inspection from tests, goes through it.

use crate::error::{ModbusError, ModbusResult};

/// Number of addressable elements in each space
pub const BANK_SIZE: usize = 65536;

/// Modbus register bank for storing coils, discrete inputs, holding registers and input registers
///
/// Bit-valued spaces are stored as one byte per address (0 or 1). Single
/// addresses are `u16` and therefore always in range; range accessors check
/// that `address + quantity` stays inside the space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRegisterBank {
    /// Discrete inputs (read-only on the wire) - 1 bit each
    discrete_inputs: Vec<u8>,
    /// Coils (read/write) - 1 bit each
    coils: Vec<u8>,
    /// Holding registers (read/write) - 16 bits each
    holding_registers: Vec<u16>,
    /// Input registers (read-only on the wire) - 16 bits each
    input_registers: Vec<u16>,
}

/// Resolve `address..address + quantity` inside a bank space
fn span(address: u16, quantity: usize) -> ModbusResult<std::ops::Range<usize>> {
    let start = address as usize;
    let end = start + quantity;
    if end > BANK_SIZE {
        return Err(ModbusError::invalid_address(address, quantity.min(u16::MAX as usize) as u16));
    }
    Ok(start..end)
}

impl ModbusRegisterBank {
    /// Create a new register bank with every address zeroed
    pub fn new() -> Self {
        Self {
            discrete_inputs: vec![0; BANK_SIZE],
            coils: vec![0; BANK_SIZE],
            holding_registers: vec![0; BANK_SIZE],
            input_registers: vec![0; BANK_SIZE],
        }
    }

    pub fn discrete_inputs(&self) -> &[u8] {
        &self.discrete_inputs
    }

    pub fn discrete_inputs_mut(&mut self) -> &mut [u8] {
        &mut self.discrete_inputs
    }

    pub fn coils(&self) -> &[u8] {
        &self.coils
    }

    pub fn coils_mut(&mut self) -> &mut [u8] {
        &mut self.coils
    }

    pub fn holding_registers(&self) -> &[u16] {
        &self.holding_registers
    }

    pub fn holding_registers_mut(&mut self) -> &mut [u16] {
        &mut self.holding_registers
    }

    pub fn input_registers(&self) -> &[u16] {
        &self.input_registers
    }

    pub fn input_registers_mut(&mut self) -> &mut [u16] {
        &mut self.input_registers
    }

    /// Read coils starting at address (function code 0x01)
    pub fn read_coils(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let range = span(address, quantity as usize)?;
        Ok(self.coils[range].iter().map(|&bit| bit != 0).collect())
    }

    /// Read discrete inputs starting at address (function code 0x02)
    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let range = span(address, quantity as usize)?;
        Ok(self.discrete_inputs[range].iter().map(|&bit| bit != 0).collect())
    }

    /// Read holding registers starting at address (function code 0x03)
    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let range = span(address, quantity as usize)?;
        Ok(self.holding_registers[range].to_vec())
    }

    /// Read input registers starting at address (function code 0x04)
    pub fn read_input_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let range = span(address, quantity as usize)?;
        Ok(self.input_registers[range].to_vec())
    }

    /// Write single coil (function code 0x05)
    pub fn write_single_coil(&mut self, address: u16, value: bool) {
        self.coils[address as usize] = value as u8;
    }

    /// Write single register (function code 0x06)
    pub fn write_single_register(&mut self, address: u16, value: u16) {
        self.holding_registers[address as usize] = value;
    }

    /// Write multiple coils (function code 0x0F)
    pub fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> ModbusResult<()> {
        let range = span(address, values.len())?;
        for (slot, &value) in self.coils[range].iter_mut().zip(values) {
            *slot = value as u8;
        }
        Ok(())
    }

    /// Write multiple registers (function code 0x10)
    pub fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> ModbusResult<()> {
        let range = span(address, values.len())?;
        self.holding_registers[range].copy_from_slice(values);
        Ok(())
    }

    /// Set input register value (seeding/simulation)
    pub fn set_input_register(&mut self, address: u16, value: u16) {
        self.input_registers[address as usize] = value;
    }

    /// Set discrete input value (seeding/simulation)
    pub fn set_discrete_input(&mut self, address: u16, value: bool) {
        self.discrete_inputs[address as usize] = value as u8;
    }

    /// Get register bank statistics
    pub fn get_stats(&self) -> RegisterBankStats {
        RegisterBankStats {
            coils_set: self.coils.iter().filter(|&&bit| bit != 0).count(),
            discrete_inputs_set: self.discrete_inputs.iter().filter(|&&bit| bit != 0).count(),
            holding_registers_nonzero: self.holding_registers.iter().filter(|&&value| value != 0).count(),
            input_registers_nonzero: self.input_registers.iter().filter(|&&value| value != 0).count(),
        }
    }
}

impl Default for ModbusRegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

/// Register bank statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterBankStats {
    pub coils_set: usize,
    pub discrete_inputs_set: usize,
    pub holding_registers_nonzero: usize,
    pub input_registers_nonzero: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coil_operations() {
        let mut bank = ModbusRegisterBank::new();

        bank.write_single_coil(10, true);
        assert_eq!(bank.read_coils(10, 1).unwrap(), vec![true]);
        assert_eq!(bank.coils()[10], 1);

        bank.write_multiple_coils(20, &[true, false, true]).unwrap();
        assert_eq!(bank.read_coils(20, 3).unwrap(), vec![true, false, true]);
    }

    #[test]
    fn test_register_operations() {
        let mut bank = ModbusRegisterBank::new();

        bank.write_single_register(5, 42);
        assert_eq!(bank.read_holding_registers(5, 1).unwrap(), vec![42]);

        bank.write_multiple_registers(100, &[100, 200, 300]).unwrap();
        assert_eq!(bank.read_holding_registers(100, 3).unwrap(), vec![100, 200, 300]);
    }

    #[test]
    fn test_spaces_do_not_alias() {
        let mut bank = ModbusRegisterBank::new();

        bank.write_single_register(7, 0xBEEF);
        bank.set_input_register(7, 0x1234);
        bank.write_single_coil(7, true);

        assert_eq!(bank.read_holding_registers(7, 1).unwrap(), vec![0xBEEF]);
        assert_eq!(bank.read_input_registers(7, 1).unwrap(), vec![0x1234]);
        assert_eq!(bank.read_discrete_inputs(7, 1).unwrap(), vec![false]);
    }

    #[test]
    fn test_range_bounds() {
        let mut bank = ModbusRegisterBank::new();

        assert_eq!(bank.read_holding_registers(65535, 1).unwrap(), vec![0]);
        assert!(bank.read_holding_registers(65535, 2).is_err());
        assert!(bank.write_multiple_coils(65530, &[true; 7]).is_err());
        assert!(bank.write_multiple_coils(65530, &[true; 6]).is_ok());
        assert_eq!(bank.holding_registers().len(), BANK_SIZE);
    }

    #[test]
    fn test_stats() {
        let mut bank = ModbusRegisterBank::new();
        bank.write_multiple_registers(0, &[1, 0, 3]).unwrap();
        bank.set_discrete_input(9, true);

        let stats = bank.get_stats();
        assert_eq!(stats.holding_registers_nonzero, 2);
        assert_eq!(stats.discrete_inputs_set, 1);
        assert_eq!(stats.coils_set, 0);
    }
}
