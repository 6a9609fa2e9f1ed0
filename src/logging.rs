//! Callback-based request/response logging
//!
//! The request serializer hands every request frame and the response frame
//! built for it to a [`CallbackLogger`]. The logger renders them raw (the
//! transport bytes as hex), interpreted (function name plus decoded fields)
//! or both, and passes the text to a user callback.

use std::sync::Arc;

use crate::frame::Frame;
use crate::protocol::{ModbusException, ModbusFunction, COIL_ON, EXCEPTION_FLAG};
use crate::utils::format::bytes_to_hex;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw frame bytes only
    Raw,
    /// Show interpreted frames with field descriptions
    Interpreted,
    /// Interpreted at the logger's level, raw bytes at debug level
    Both,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that uses callbacks for flexible logging
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Interpreted)
    }

    /// Create a new callback logger with specific mode
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger with default console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => {
                    eprintln!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
                LogLevel::Info | LogLevel::Debug => {
                    println!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Set logging mode
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Get current logging mode
    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    /// Whether any callback is installed
    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    /// Log an error message
    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Log a warning message
    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    /// Log an info message
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    /// Log a debug message
    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level <= self.min_level
    }

    /// Log packet data with hex dump
    pub fn log_packet(&self, level: LogLevel, direction: &str, data: &[u8]) {
        if !self.should_log(level) {
            return;
        }

        let message = format!("{} packet ({} bytes): {}", direction, data.len(), bytes_to_hex(data));
        self.log(level, &message);
    }

    /// Log a request frame as received by the slave
    pub fn log_request(&self, frame: &dyn Frame) {
        if !self.is_enabled() {
            return;
        }
        let interpreted = || {
            format!(
                "Modbus Request -> Unit: {}, Function: {} (0x{:02X}), {}",
                frame.unit_id(),
                function_name(frame.function()),
                frame.function(),
                interpret_request_data(frame.function(), frame.data())
            )
        };
        self.emit("Modbus Request -> Raw", frame, interpreted);
    }

    /// Log a response frame as sent back by the slave
    pub fn log_response(&self, frame: &dyn Frame) {
        if !self.is_enabled() {
            return;
        }
        let interpreted = || {
            let function = frame.function() & !EXCEPTION_FLAG;
            format!(
                "Modbus Response <- Unit: {}, Function: {} (0x{:02X}), {}",
                frame.unit_id(),
                function_name(function),
                function,
                interpret_response_data(frame.function(), frame.data())
            )
        };
        self.emit("Modbus Response <- Raw", frame, interpreted);
    }

    fn emit<F: Fn() -> String>(&self, raw_label: &str, frame: &dyn Frame, interpreted: F) {
        let raw = || format!("{}: {}", raw_label, bytes_to_hex(&frame.to_bytes()));
        match self.mode {
            LoggingMode::Raw => self.info(&raw()),
            LoggingMode::Interpreted => self.info(&interpreted()),
            LoggingMode::Both => {
                self.info(&interpreted());
                if self.should_log(LogLevel::Debug) {
                    self.debug(&raw());
                }
            }
        }
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("enabled", &self.is_enabled())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .finish()
    }
}

fn function_name(function: u8) -> &'static str {
    ModbusFunction::from_u8(function)
        .map(|f| f.name())
        .unwrap_or("Unknown Function")
}

fn field(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn interpret_request_data(function: u8, data: &[u8]) -> String {
    match (function, field(data, 0), field(data, 2)) {
        (0x01..=0x04 | 0x0F | 0x10, Some(address), Some(quantity)) => {
            format!("Address: {}, Quantity: {}", address, quantity)
        }
        (0x05, Some(address), Some(value)) => {
            format!("Address: {}, Value: 0x{:04X}", address, value)
        }
        (0x06, Some(address), Some(value)) => {
            format!("Address: {}, Value: {} (0x{:04X})", address, value, value)
        }
        _ => format!("Data: {}", hex::encode(data)),
    }
}

fn interpret_response_data(function: u8, data: &[u8]) -> String {
    if function & EXCEPTION_FLAG != 0 {
        return match data.first().and_then(|&code| ModbusException::from_u8(code)) {
            Some(exception) => format!("Exception: {} (0x{:02X})", exception.name(), exception.to_u8()),
            None => format!("Exception: {}", hex::encode(data)),
        };
    }

    if data.is_empty() {
        return "No data".to_string();
    }

    match function {
        0x01 | 0x02 => {
            let byte_count = data[0];
            let bits: Vec<bool> = data[1..]
                .iter()
                .flat_map(|&byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
                .take(16)
                .collect();
            format!("Byte count: {}, Bits: {:?}", byte_count, bits)
        }
        0x03 | 0x04 => {
            let byte_count = data[0];
            let registers: Vec<u16> = data[1..]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .take(8)
                .collect();
            format!("Byte count: {}, Registers: {:?}", byte_count, registers)
        }
        0x05 => match (field(data, 0), field(data, 2)) {
            (Some(address), Some(value)) => format!(
                "Address: {}, Value: 0x{:04X} ({})",
                address,
                value,
                if value == COIL_ON { "ON" } else { "OFF" }
            ),
            _ => format!("Data: {}", hex::encode(data)),
        },
        0x06 => match (field(data, 0), field(data, 2)) {
            (Some(address), Some(value)) => {
                format!("Address: {}, Value: {} (0x{:04X})", address, value, value)
            }
            _ => format!("Data: {}", hex::encode(data)),
        },
        0x0F | 0x10 => match (field(data, 0), field(data, 2)) {
            (Some(address), Some(quantity)) => format!("Address: {}, Quantity: {}", address, quantity),
            _ => format!("Data: {}", hex::encode(data)),
        },
        _ => format!("Data: {}", hex::encode(data)),
    }
}

/// Convenience macro for creating a simple console logger
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::CallbackLogger::console()
    };
}

/// Convenience macro for creating a custom logger
#[macro_export]
macro_rules! custom_logger {
    ($callback:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $crate::logging::LogLevel::Info)
    };
    ($callback:expr, $level:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $level)
    };
    ($callback:expr, $level:expr, $mode:expr) => {
        $crate::logging::CallbackLogger::with_mode(Some($callback), $level, $mode)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{RtuFrame, TcpFrame};
    use std::sync::Mutex;

    fn capture(level: LogLevel, mode: LoggingMode) -> (CallbackLogger, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |level, message| {
            sink.lock().unwrap().push(format!("{} {}", level.as_str(), message));
        });
        (CallbackLogger::with_mode(Some(callback), level, mode), lines)
    }

    #[test]
    fn test_level_filtering() {
        let (logger, lines) = capture(LogLevel::Warn, LoggingMode::Interpreted);
        logger.debug("hidden");
        logger.info("hidden");
        logger.warn("shown");
        logger.error("shown");
        assert_eq!(*lines.lock().unwrap(), vec!["WARN shown", "ERROR shown"]);
    }

    #[test]
    fn test_interpreted_request_and_response() {
        let (logger, lines) = capture(LogLevel::Info, LoggingMode::Interpreted);
        let request = TcpFrame::new(1, 0x11, &[0x03, 0x00, 0x6B, 0x00, 0x02]).unwrap();
        let mut response = request.clone();
        response.data = vec![0x04, 0x12, 0x34, 0x00, 0x07];

        logger.log_request(&request);
        logger.log_response(&response);

        let lines = lines.lock().unwrap();
        assert!(lines[0].contains("Read Holding Registers"));
        assert!(lines[0].contains("Address: 107, Quantity: 2"));
        assert!(lines[1].contains("Registers: [4660, 7]"));
    }

    #[test]
    fn test_exception_response() {
        let (logger, lines) = capture(LogLevel::Info, LoggingMode::Interpreted);
        let mut response = RtuFrame::new(1, &[0x10, 0x00, 0x00, 0x00, 0x01]).unwrap();
        response.set_exception(ModbusException::IllegalDataAddress);

        logger.log_response(&response);
        let lines = lines.lock().unwrap();
        assert!(lines[0].contains("Write Multiple Registers (0x10)"));
        assert!(lines[0].contains("Illegal Data Address"));
    }

    #[test]
    fn test_both_mode_raw_at_debug() {
        let (logger, lines) = capture(LogLevel::Debug, LoggingMode::Both);
        let request = RtuFrame::new(1, &[0x03, 0x00, 0x00, 0x00, 0x02]).unwrap();
        logger.log_request(&request);

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("DEBUG Modbus Request -> Raw: 01 03 00 00 00 02 C4 0B"));
    }

    #[test]
    fn test_disabled_logger() {
        let logger = CallbackLogger::disabled();
        assert!(!logger.is_enabled());
        logger.log_request(&RtuFrame::new(1, &[0x03]).unwrap());
    }
}
