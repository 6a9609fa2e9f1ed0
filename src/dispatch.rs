//! Function-code dispatch table
//!
//! Maps each of the 256 possible function codes to an optional
//! [`FunctionHandler`]. Registering a handler for a populated slot replaces
//! the previous one, which is how custom device profiles override the
//! standard codecs. Codes with no handler answer `IllegalFunction`.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use log::{debug, warn};

use crate::codec::{self, CodecResult, FunctionHandler};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::Frame;
use crate::protocol::{ModbusException, ModbusFunction, EXCEPTION_FLAG};
use crate::register_bank::ModbusRegisterBank;

/// Function code → handler mapping
#[derive(Clone)]
pub struct DispatchTable {
    handlers: [Option<FunctionHandler>; 256],
}

impl DispatchTable {
    /// Table with no handlers at all; every request answers `IllegalFunction`
    pub fn empty() -> Self {
        Self {
            handlers: std::array::from_fn(|_| None),
        }
    }

    /// Table populated with the eight standard codecs
    pub fn with_defaults() -> Self {
        let mut table = Self::empty();
        table.install(ModbusFunction::ReadCoils, codec::handler(codec::read_coils));
        table.install(ModbusFunction::ReadDiscreteInputs, codec::handler(codec::read_discrete_inputs));
        table.install(ModbusFunction::ReadHoldingRegisters, codec::handler(codec::read_holding_registers));
        table.install(ModbusFunction::ReadInputRegisters, codec::handler(codec::read_input_registers));
        table.install(ModbusFunction::WriteSingleCoil, codec::handler(codec::write_single_coil));
        table.install(ModbusFunction::WriteSingleRegister, codec::handler(codec::write_holding_register));
        table.install(ModbusFunction::WriteMultipleCoils, codec::handler(codec::write_multiple_coils));
        table.install(ModbusFunction::WriteMultipleRegisters, codec::handler(codec::write_holding_registers));
        table
    }

    fn install(&mut self, function: ModbusFunction, handler: FunctionHandler) {
        self.handlers[function.to_u8() as usize] = Some(handler);
    }

    /// Check that a function code can carry a handler
    ///
    /// Only 0x01..=0x7F are accepted, narrower than the full 0..=255 code
    /// space on purpose: 0 is not a function, and codes with the exception
    /// bit set can never be answered without colliding with exception
    /// responses.
    pub fn validate_function_code(function: u8) -> ModbusResult<()> {
        if function == 0 || function & EXCEPTION_FLAG != 0 {
            return Err(ModbusError::invalid_function(function));
        }
        Ok(())
    }

    /// Install or replace the handler for `function`
    pub fn register(&mut self, function: u8, handler: FunctionHandler) -> ModbusResult<()> {
        Self::validate_function_code(function)?;

        if self.handlers[function as usize].replace(handler).is_some() {
            debug!("Replaced handler for function 0x{:02X}", function);
        } else {
            debug!("Registered handler for function 0x{:02X}", function);
        }
        Ok(())
    }

    /// Remove the handler for `function`, returning it
    pub fn unregister(&mut self, function: u8) -> Option<FunctionHandler> {
        self.handlers[function as usize].take()
    }

    /// Look up the handler for `function`
    pub fn resolve(&self, function: u8) -> Option<&FunctionHandler> {
        self.handlers[function as usize].as_ref()
    }

    /// Function codes that currently have a handler
    pub fn registered_functions(&self) -> Vec<u8> {
        (0..=255u8)
            .filter(|&code| self.handlers[code as usize].is_some())
            .collect()
    }

    /// Run the handler for a request frame
    ///
    /// A handler that panics answers `SlaveDeviceFailure`; writes it made
    /// before panicking stay applied.
    pub fn invoke(&self, bank: &mut ModbusRegisterBank, frame: &dyn Frame) -> CodecResult {
        match self.resolve(frame.function()) {
            Some(handler) => match catch_unwind(AssertUnwindSafe(|| handler(bank, frame))) {
                Ok(result) => result,
                Err(_) => {
                    warn!("Handler for function 0x{:02X} panicked", frame.function());
                    Err(ModbusException::SlaveDeviceFailure)
                }
            },
            None => {
                warn!("No handler for function 0x{:02X}", frame.function());
                Err(ModbusException::IllegalFunction)
            }
        }
    }

    /// Apply a request frame and build its response frame
    ///
    /// The response is a copy of the request with its payload replaced by the
    /// handler's output, or turned into an exception response.
    pub fn dispatch(&self, bank: &mut ModbusRegisterBank, frame: &dyn Frame) -> Box<dyn Frame> {
        let mut response = frame.copy();

        match self.invoke(bank, frame) {
            Ok(data) => response.set_data(data),
            Err(exception) => {
                debug!(
                    "Function 0x{:02X} answered with {}",
                    frame.function(),
                    exception.name()
                );
                response.set_exception(exception);
            }
        }

        response
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("registered", &self.registered_functions())
            .finish()
    }
}
