//! Utility functions and helpers for the Modbus server
//!
//! This module contains request validation shared by the codecs, formatting
//! helpers for logs, and performance monitoring for the request serializer.

use std::time::{Duration, Instant};
use log::debug;
use crate::protocol::ModbusException;
use crate::register_bank::BANK_SIZE;

/// Performance metrics for dispatched requests
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
}

impl PerformanceMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request answered with data
    pub fn record_success(&mut self, duration: Duration) {
        self.successful_requests += 1;
        self.record(duration);
    }

    /// Record a request answered with an exception
    pub fn record_failure(&mut self, duration: Duration) {
        self.failed_requests += 1;
        self.record(duration);
    }

    fn record(&mut self, duration: Duration) {
        self.total_requests += 1;
        self.total_duration += duration;

        self.min_duration = Some(
            self.min_duration.map_or(duration, |min| min.min(duration))
        );
        self.max_duration = Some(
            self.max_duration.map_or(duration, |max| max.max(duration))
        );

        self.avg_duration = self.total_duration / self.total_requests as u32;
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.successful_requests as f64 / self.total_requests as f64) * 100.0
    }
}

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start(operation_name: &str) -> Self {
        debug!("Starting operation: {}", operation_name);
        Self {
            start: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    /// Stop the timer and return duration
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!("Operation '{}' completed in {:?}", self.operation_name, duration);
        duration
    }
}

/// Request validation shared by the standard codecs
///
/// Failures are wire exceptions, not errors: they end up in the response frame.
pub mod validation {
    use super::*;

    /// Validate a quantity field against `1..=max`
    pub fn validate_quantity(quantity: u16, max: u16) -> Result<(), ModbusException> {
        if quantity == 0 || quantity > max {
            return Err(ModbusException::IllegalDataValue);
        }
        Ok(())
    }

    /// Validate that `start..start + count` lies inside a memory bank
    pub fn validate_address_range(start: u16, count: u16) -> Result<(), ModbusException> {
        if start as usize + count as usize > BANK_SIZE {
            return Err(ModbusException::IllegalDataAddress);
        }
        Ok(())
    }

    /// Validate a request payload's exact length
    pub fn validate_payload_len(data: &[u8], expected: usize) -> Result<(), ModbusException> {
        if data.len() != expected {
            return Err(ModbusException::IllegalDataValue);
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format performance metrics as a table
    pub fn format_metrics(metrics: &PerformanceMetrics) -> String {
        format!(
            "Performance Metrics:\n\
             ├─ Total Requests: {}\n\
             ├─ Answered with data: {} ({:.1}%)\n\
             ├─ Answered with exception: {}\n\
             ├─ Average Duration: {:?}\n\
             ├─ Min Duration: {}\n\
             └─ Max Duration: {}",
            metrics.total_requests,
            metrics.successful_requests,
            metrics.success_rate(),
            metrics.failed_requests,
            metrics.avg_duration,
            metrics.min_duration.map_or("N/A".to_string(), |d| format!("{:?}", d)),
            metrics.max_duration.map_or("N/A".to_string(), |d| format!("{:?}", d)),
        )
    }
}

/// Logging utilities
pub mod logging {
    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_performance_metrics() {
        let mut metrics = PerformanceMetrics::new();

        metrics.record_success(Duration::from_millis(100));
        metrics.record_success(Duration::from_millis(200));
        metrics.record_failure(Duration::from_millis(150));

        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.min_duration, Some(Duration::from_millis(100)));
        assert_eq!(metrics.max_duration, Some(Duration::from_millis(200)));
        assert_eq!(metrics.avg_duration, Duration::from_millis(150));
        assert!((metrics.success_rate() - 66.67).abs() < 0.1);
    }

    #[test]
    fn test_validation() {
        assert!(validation::validate_quantity(1, 125).is_ok());
        assert!(validation::validate_quantity(125, 125).is_ok());
        assert_eq!(validation::validate_quantity(0, 125), Err(ModbusException::IllegalDataValue));
        assert_eq!(validation::validate_quantity(126, 125), Err(ModbusException::IllegalDataValue));

        assert!(validation::validate_address_range(0, 10).is_ok());
        assert!(validation::validate_address_range(65530, 6).is_ok());
        assert_eq!(
            validation::validate_address_range(65530, 7),
            Err(ModbusException::IllegalDataAddress)
        );

        assert!(validation::validate_payload_len(&[0; 4], 4).is_ok());
        assert!(validation::validate_payload_len(&[0; 3], 4).is_err());
    }

    #[test]
    fn test_formatting() {
        let bytes = vec![0x01, 0x03, 0x10, 0xFF];
        assert_eq!(format::bytes_to_hex(&bytes), "01 03 10 FF");

        let table = format::format_metrics(&PerformanceMetrics::new());
        assert!(table.contains("Total Requests: 0"));
        assert!(table.contains("Min Duration: N/A"));
    }
}
