//! # Voltage Modbus Server Error Handling
//!
//! This module provides the error type used by every fallible operation of the
//! slave engine that is *not* a Modbus protocol exception: frame decoding in
//! the transports, connection writes, handler registration, listener setup and
//! shutdown.
//!
//! ## Overview
//!
//! Protocol exceptions (Illegal Function, Illegal Data Address, ...) are normal,
//! wire-visible outcomes of a request and are modelled by
//! [`ModbusException`](crate::protocol::ModbusException). They never travel as a
//! `ModbusError` inside the server. `ModbusError::Exception` only shows up when
//! a response PDU is parsed on the client side of a conversation, e.g. by
//! [`ModbusResponse`](crate::protocol::ModbusResponse).
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: socket and serial port failures
//! - **Connection Errors**: bind failures, peers going away, closed reply channels
//! - **Timeout Errors**: idle connections exceeding their timeout
//!
//! ### Protocol Errors
//! - **Frame Errors**: raw bytes that cannot be decoded into a frame
//! - **CRC Errors**: RTU checksum failures
//! - **Exception Responses**: exception PDUs read back by a client-side parser
//!
//! ### System Errors
//! - **Configuration Errors**: invalid listener settings
//! - **Server Shutdown**: requests submitted after the serializer stopped
//! - **Internal Errors**: should not occur in normal operation
//!
//! ## Usage Example
//!
//! ```rust
//! use voltage_mbserver::{ModbusError, ModbusResult};
//! use voltage_mbserver::frame::RtuFrame;
//!
//! fn decode(raw: &[u8]) -> ModbusResult<RtuFrame> {
//!     match RtuFrame::decode(raw) {
//!         Err(error) if error.is_protocol_error() => {
//!             println!("Dropping malformed frame: {}", error);
//!             Err(error)
//!         }
//!         other => other,
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for Modbus server operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus server error types
///
/// Each variant carries enough context to be logged by the transport that hit
/// it. None of them is fatal to the request serializer.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// I/O related errors (network, serial)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors
    ///
    /// # Examples
    /// - Listener failed to bind its address
    /// - Response could not be delivered because the peer went away
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    ///
    /// Only transports time out; the request serializer never does.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Invalid function code
    ///
    /// Raised synchronously by handler registration for codes that cannot be
    /// served (0 and anything with the exception bit 0x80 set).
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Invalid address range
    ///
    /// Start/count combinations that leave the 0..=65535 address space.
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Invalid data value
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// CRC validation failure on an RTU frame
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Modbus exception response read back from a response PDU
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Frame parsing errors
    ///
    /// # Examples
    /// - Incomplete MBAP header
    /// - Non-zero MBAP protocol identifier
    /// - ASCII frame without the leading `:`
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The request serializer has stopped and no longer accepts work
    #[error("Server is shut down")]
    ServerShutdown,

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms
        }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a Modbus exception error
    ///
    /// Maps the exception code to its catalog description; codes outside the
    /// catalog are reported as "Unknown Exception".
    pub fn exception(function: u8, code: u8) -> Self {
        let message = crate::protocol::ModbusException::from_u8(code)
            .map(|exception| exception.name())
            .unwrap_or("Unknown Exception")
            .to_string();

        Self::Exception { function, code, message }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is a network/transport issue
    ///
    /// # Examples
    ///
    /// ```rust
    /// use voltage_mbserver::ModbusError;
    ///
    /// let connection_error = ModbusError::connection("Connection reset by peer");
    /// assert!(connection_error.is_transport_error());
    ///
    /// let frame_error = ModbusError::frame("Frame too short");
    /// assert!(!frame_error.is_transport_error());
    /// ```
    pub fn is_transport_error(&self) -> bool {
        matches!(self,
            Self::Io { .. } |
            Self::Connection { .. } |
            Self::Timeout { .. }
        )
    }

    /// Check if the error is a protocol issue
    ///
    /// Transports drop or close connections on protocol errors instead of
    /// submitting anything to the server.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self,
            Self::InvalidFunction { .. } |
            Self::Exception { .. } |
            Self::Frame { .. } |
            Self::CrcMismatch { .. }
        )
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors
///
/// The elapsed duration is not known here; callers that know it should build
/// the error with [`ModbusError::timeout`] instead.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

/// Convert from serial port errors
impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(format!("Serial port error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ModbusError::timeout("idle connection", 5000);
        assert!(err.is_transport_error());
        assert!(!err.is_protocol_error());

        let err = ModbusError::exception(0x03, 0x02);
        assert!(err.is_protocol_error());
        assert!(!err.is_transport_error());

        assert!(!ModbusError::ServerShutdown.is_transport_error());
        assert!(!ModbusError::ServerShutdown.is_protocol_error());
    }

    #[test]
    fn test_error_display() {
        let err = ModbusError::crc_mismatch(0x1234, 0x5678);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));
    }

    #[test]
    fn test_exception_message_lookup() {
        match ModbusError::exception(0x03, 0x02) {
            ModbusError::Exception { message, .. } => assert_eq!(message, "Illegal Data Address"),
            other => panic!("unexpected error: {:?}", other),
        }

        match ModbusError::exception(0x03, 0x7F) {
            ModbusError::Exception { message, .. } => assert_eq!(message, "Unknown Exception"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<u16>("not json").unwrap_err();
        let err: ModbusError = json_err.into();
        assert!(matches!(err, ModbusError::Configuration { .. }));
    }
}
