//! # Voltage Modbus Server - Modbus Slave Request-Processing Engine
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **Version:** 0.1.0
//! **License:** MIT
//!
//! A Modbus slave for TCP, RTU and ASCII transports built around one rule:
//! the device memory is touched by exactly one task. Transports decode frames
//! and submit them; a single request serializer applies them in submission
//! order and writes each response back to the connection it came from.
//!
//! ## Features
//!
//! - **Serialized register access**: no locks around the register bank, no torn writes
//! - **Pluggable function handlers**: override any standard codec or add custom ones
//! - **Three encodings**: Modbus TCP (MBAP), RTU (CRC-16) and ASCII (LRC)
//! - **Listeners included**: TCP with connection limits and idle timeouts, serial via `tokio-serial`
//! - **Built-in monitoring**: request, exception and byte counters plus timing metrics
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Quantity |
//! |------|----------|----------|
//! | 0x01 | Read Coils | 1..=2000 |
//! | 0x02 | Read Discrete Inputs | 1..=2000 |
//! | 0x03 | Read Holding Registers | 1..=125 |
//! | 0x04 | Read Input Registers | 1..=125 |
//! | 0x05 | Write Single Coil | - |
//! | 0x06 | Write Single Register | - |
//! | 0x0F | Write Multiple Coils | 1..=1968 |
//! | 0x10 | Write Multiple Registers | 1..=123 |
//!
//! Any other code answers `Illegal Function` unless a handler is registered.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_mbserver::{codec, ModbusResult, ModbusSlave, TcpListenerConfig};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut builder = ModbusSlave::builder();
//!     builder.register_bank_mut().write_single_register(0, 0x1234);
//!
//!     // Custom function 0x41: report the number of coils that are on
//!     let slave = builder
//!         .function_handler(0x41, codec::handler(|bank, _frame| {
//!             let on = bank.coils().iter().filter(|&&c| c != 0).count() as u16;
//!             Ok(on.to_be_bytes().to_vec())
//!         }))?
//!         .build();
//!
//!     slave.listen_tcp(TcpListenerConfig::default()).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     slave.shutdown().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//! │ TCP listener │ │ RTU listener │ │ Custom input │
//! └──────────────┘ └──────────────┘ └──────────────┘
//!         │ Request        │ Request        │ Request
//!         ▼                ▼                ▼
//! ┌──────────────────────────────────────────────────┐
//! │               FIFO request queue                  │
//! └──────────────────────────────────────────────────┘
//!                          │
//! ┌──────────────────────────────────────────────────┐
//! │ Request serializer                               │
//! │   Dispatch table ──► Codec ──► Register bank     │
//! └──────────────────────────────────────────────────┘
//!                          │ response bytes
//!                          ▼
//!                 originating connection
//! ```

/// Core error types and result handling
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod error;

/// Modbus protocol definitions and message handling
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod protocol;

/// Device memory: coils, discrete inputs, holding and input registers
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod register_bank;

/// Transport-independent frame contract and its TCP/RTU/ASCII encodings
pub mod frame;

/// Standard function codecs
pub mod codec;

/// Function code dispatch table
pub mod dispatch;

/// Slave façade and request serializer
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod server;

/// TCP and serial listeners
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod transport;

/// Background register simulation
pub mod simulation;

/// Utility functions and performance monitoring
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod utils;

/// Logging system for the library
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod logging;

// Re-export main types for convenience
pub use error::{ModbusError, ModbusResult};
pub use protocol::{ModbusException, ModbusFunction, ModbusRequest, ModbusResponse};
pub use register_bank::{ModbusRegisterBank, RegisterBankStats};
pub use frame::{AsciiFrame, Frame, RtuFrame, TcpFrame};
pub use codec::{CodecResult, FunctionHandler};
pub use dispatch::DispatchTable;
pub use server::{ChannelConnection, Connection, ModbusSlave, Request, RequestQueue, ServerStats, SlaveBuilder};
pub use transport::{SerialEncoding, SerialListenerConfig, SerialParity, TcpListenerConfig};
pub use simulation::{DataSource, RandomSource, RegisterSimulator, SimulationConfig};
pub use utils::{OperationTimer, PerformanceMetrics};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};

/// Maximum number of coils or discrete inputs in one read request
pub const MAX_READ_COILS: u16 = 2000;

/// Maximum number of registers in one read request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum number of coils in one write request
pub const MAX_WRITE_COILS: u16 = 1968;

/// Maximum number of registers in one write request
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Modbus Server v{} - Modbus slave engine for TCP/RTU/ASCII by Evan Liu", VERSION)
}
