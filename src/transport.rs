//! # Modbus Slave Transports
//!
//! Listeners that turn raw bytes into [`Frame`]s and feed them to the request
//! serializer.
//!
//! ## TCP
//!
//! One task per accepted connection. Bytes accumulate in a buffer and are cut
//! into frames by the MBAP length field. Each frame is submitted and the
//! connection waits for its response before handling the next one, so
//! responses leave in request order. A frame that cannot be decoded closes
//! the connection; nothing undecodable ever reaches the serializer.
//!
//! ## Serial
//!
//! | Encoding | Frame delimiter | Checksum |
//! |----------|-----------------|----------|
//! | RTU | 3.5 character times of silence | CRC-16 |
//! | ASCII | `CR LF` | LRC |
//!
//! A serial line cannot be closed on a bad frame, so undecodable frames are
//! logged and dropped. With a unit id configured, frames addressed to other
//! units are ignored and broadcasts (unit 0) are applied without a response.
//!
//! ## Configuration
//!
//! ```rust
//! use voltage_mbserver::transport::{SerialEncoding, SerialListenerConfig, TcpListenerConfig};
//!
//! let tcp: TcpListenerConfig = serde_json::from_str(
//!     r#"{"bind_address":"127.0.0.1:5020","max_connections":4,"idle_timeout":{"secs":30,"nanos":0},"packet_logging":true}"#,
//! ).unwrap();
//! assert_eq!(tcp.max_connections, 4);
//!
//! let serial = SerialListenerConfig::ascii("/dev/ttyUSB0", 9600);
//! assert_eq!(serial.encoding, SerialEncoding::Ascii);
//! assert_eq!(serial.data_bits, 7);
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;
use tokio_serial::SerialStream;
use log::{debug, error, info, warn};

use crate::error::{ModbusError, ModbusResult};
use crate::frame::{AsciiFrame, Frame, RtuFrame, TcpFrame, MAX_ASCII_FRAME_SIZE, MAX_RTU_FRAME_SIZE};
use crate::server::{ChannelConnection, Connection, Request, RequestQueue, SharedStats};
use crate::utils::format::bytes_to_hex;
use crate::{DEFAULT_TCP_PORT, MAX_TCP_FRAME_SIZE};

/// Log packet with direction and format
fn log_packet(direction: &str, data: &[u8], protocol: &str, unit_id: Option<u8>) {
    let hex_string = bytes_to_hex(data);
    match unit_id {
        Some(id) => tracing::info!("[MODBUS-{}] {} unit:{} {}", protocol, direction, id, hex_string),
        None => tracing::info!("[MODBUS-{}] {} {}", protocol, direction, hex_string),
    }
}

/// Modbus TCP listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpListenerConfig {
    pub bind_address: SocketAddr,
    /// Connections beyond this limit are closed right after accept
    pub max_connections: usize,
    /// Connections silent for this long are closed
    pub idle_timeout: Duration,
    #[serde(default)]
    pub packet_logging: bool,
}

impl TcpListenerConfig {
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            ..Default::default()
        }
    }
}

impl Default for TcpListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_TCP_PORT)),
            max_connections: 100,
            idle_timeout: Duration::from_secs(60),
            packet_logging: false,
        }
    }
}

/// Serial line encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialEncoding {
    Rtu,
    Ascii,
}

impl SerialEncoding {
    fn label(self) -> &'static str {
        match self {
            SerialEncoding::Rtu => "RTU",
            SerialEncoding::Ascii => "ASCII",
        }
    }
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialParity {
    None,
    Odd,
    Even,
}

impl From<SerialParity> for tokio_serial::Parity {
    fn from(parity: SerialParity) -> Self {
        match parity {
            SerialParity::None => tokio_serial::Parity::None,
            SerialParity::Odd => tokio_serial::Parity::Odd,
            SerialParity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Modbus serial listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialListenerConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: SerialParity,
    pub encoding: SerialEncoding,
    /// Answer only this unit (plus broadcasts); `None` answers every unit
    pub unit_id: Option<u8>,
    #[serde(default)]
    pub packet_logging: bool,
}

impl SerialListenerConfig {
    /// RTU line, 8N1
    pub fn rtu<S: Into<String>>(port: S, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// ASCII line, 7E1
    pub fn ascii<S: Into<String>>(port: S, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: 7,
            parity: SerialParity::Even,
            encoding: SerialEncoding::Ascii,
            ..Default::default()
        }
    }

    /// Silent interval that terminates an RTU frame
    ///
    /// 3.5 character times of 11 bits, fixed at 1.75 ms above 19200 baud.
    pub fn frame_gap(&self) -> Duration {
        if self.baud_rate > 19_200 {
            return Duration::from_micros(1_750);
        }
        let char_time_us = 11_000_000 / self.baud_rate.max(1) as u64;
        Duration::from_micros(char_time_us * 35 / 10)
    }

    /// Check the line settings and convert them for the serial driver
    pub fn validate(&self) -> ModbusResult<(tokio_serial::DataBits, tokio_serial::StopBits)> {
        if self.baud_rate == 0 {
            return Err(ModbusError::configuration("Baud rate must be positive"));
        }

        let data_bits = match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => return Err(ModbusError::configuration(format!("Unsupported data bits: {}", other))),
        };
        let stop_bits = match self.stop_bits {
            1 => tokio_serial::StopBits::One,
            2 => tokio_serial::StopBits::Two,
            other => return Err(ModbusError::configuration(format!("Unsupported stop bits: {}", other))),
        };
        if let Some(0) = self.unit_id {
            return Err(ModbusError::configuration("Unit id 0 is reserved for broadcasts"));
        }

        Ok((data_bits, stop_bits))
    }
}

impl Default for SerialListenerConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            encoding: SerialEncoding::Rtu,
            unit_id: Some(1),
            packet_logging: false,
        }
    }
}

/// Bind the TCP listener socket
pub(crate) async fn bind_tcp(config: &TcpListenerConfig) -> ModbusResult<TcpListener> {
    if config.max_connections == 0 {
        return Err(ModbusError::configuration("max_connections must be at least 1"));
    }

    TcpListener::bind(config.bind_address)
        .await
        .map_err(|e| ModbusError::connection(format!("Failed to bind to {}: {}", config.bind_address, e)))
}

/// Accept connections until shutdown
pub(crate) async fn run_tcp_listener(
    listener: TcpListener,
    config: TcpListenerConfig,
    queue: RequestQueue,
    stats: SharedStats,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let limiter = Arc::new(Semaphore::new(config.max_connections));

    info!("Modbus TCP listener started on {}", config.bind_address);
    info!("   - Max connections: {}", config.max_connections);
    info!("   - Idle timeout: {:?}", config.idle_timeout);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping TCP listener");
                break;
            }

            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };

                let permit = match limiter.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Connection limit ({}) reached, rejecting {}", config.max_connections, peer);
                        continue;
                    }
                };

                stats.lock().await.connections_count += 1;

                let config = config.clone();
                let queue = queue.clone();
                let stats = stats.clone();
                let shutdown_rx = shutdown_tx.subscribe();

                tokio::spawn(async move {
                    info!("Client connected: {}", peer);
                    match serve_connection(stream, peer.to_string(), &config, queue, stats, shutdown_rx).await {
                        Ok(()) => info!("Client disconnected: {}", peer),
                        Err(e) => warn!("Closing connection {}: {}", peer, e),
                    }
                    drop(permit);
                });
            }
        }
    }
}

/// Serve one MBAP stream until the peer leaves, idles out or shutdown
///
/// Returns an error when the stream fails or carries an undecodable frame;
/// either way the caller drops the stream.
pub async fn serve_connection<S>(
    mut stream: S,
    peer: String,
    config: &TcpListenerConfig,
    queue: RequestQueue,
    stats: SharedStats,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> ModbusResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (connection, mut responses) = ChannelConnection::new(peer.clone());
    let connection: Arc<dyn Connection> = Arc::new(connection);
    let mut buffer = BytesMut::with_capacity(MAX_TCP_FRAME_SIZE);

    loop {
        while let Some(length) = TcpFrame::frame_length(&buffer[..])? {
            if buffer.len() < length {
                break;
            }

            let raw = buffer.split_to(length);
            if config.packet_logging {
                log_packet("RX", &raw, "TCP", raw.get(6).copied());
            }

            let frame = TcpFrame::decode(&raw)?;
            debug!("{} -> TID={} function=0x{:02X}", peer, frame.transaction_id, frame.function);
            queue.submit(Request::new(Box::new(frame), connection.clone()))?;

            let response = responses.recv().await.ok_or(ModbusError::ServerShutdown)?;
            if config.packet_logging {
                log_packet("TX", &response, "TCP", response.get(6).copied());
            }
            stream.write_all(&response).await?;
            stats.lock().await.bytes_sent += response.len() as u64;
        }

        let read = tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Shutdown signal received for client {}", peer);
                return Ok(());
            }
            result = timeout(config.idle_timeout, stream.read_buf(&mut buffer)) => result,
        };

        match read {
            Ok(Ok(0)) => {
                if !buffer.is_empty() {
                    debug!("{} left with {} unprocessed bytes", peer, buffer.len());
                }
                return Ok(());
            }
            Ok(Ok(n)) => stats.lock().await.bytes_received += n as u64,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(ModbusError::timeout(
                    format!("Idle connection {}", peer),
                    config.idle_timeout.as_millis() as u64,
                ))
            }
        }
    }
}

/// Open the configured serial port
pub(crate) fn open_serial(config: &SerialListenerConfig) -> ModbusResult<SerialStream> {
    let (data_bits, stop_bits) = config.validate()?;

    let builder = tokio_serial::new(&config.port, config.baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(config.parity.into());

    SerialStream::open(&builder)
        .map_err(|e| ModbusError::connection(format!("Failed to open serial port {}: {}", config.port, e)))
}

/// Read one RTU frame: everything up to the first silent interval
///
/// Returns `Ok(None)` once the stream is exhausted.
async fn read_rtu_frame<S>(stream: &mut S, gap: Duration) -> ModbusResult<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; MAX_RTU_FRAME_SIZE];
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
        return Ok(None);
    }

    let mut frame = chunk[..n].to_vec();
    loop {
        match timeout(gap, stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => {
                frame.extend_from_slice(&chunk[..n]);
                if frame.len() > MAX_RTU_FRAME_SIZE {
                    return Err(ModbusError::frame("RTU frame too large"));
                }
            }
            Ok(Err(e)) => return Err(e.into()),
        }
    }

    Ok(Some(frame))
}

/// Read one ASCII frame, up to and including `CR LF`
async fn read_ascii_frame<S>(stream: &mut S, buffer: &mut BytesMut) -> ModbusResult<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    loop {
        // Resynchronise on the start character
        match buffer.iter().position(|&b| b == b':') {
            Some(start) => buffer.advance(start),
            None => buffer.clear(),
        }

        if let Some(end) = buffer.windows(2).position(|w| w == b"\r\n") {
            let line = buffer.split_to(end + 2);
            // A restart inside the line abandons the partial frame before it
            let start = line[..end].iter().rposition(|&b| b == b':').unwrap_or(0);
            return Ok(Some(line[start..].to_vec()));
        }
        if buffer.len() > MAX_ASCII_FRAME_SIZE {
            buffer.clear();
            return Err(ModbusError::frame("ASCII frame too large"));
        }
        if stream.read_buf(buffer).await? == 0 {
            return Ok(None);
        }
    }
}

fn decode_serial_frame(encoding: SerialEncoding, raw: &[u8]) -> ModbusResult<Box<dyn Frame>> {
    Ok(match encoding {
        SerialEncoding::Rtu => Box::new(RtuFrame::decode(raw)?),
        SerialEncoding::Ascii => Box::new(AsciiFrame::decode(raw)?),
    })
}

/// Serve a serial line until it closes or shutdown
pub async fn serve_serial<S>(
    mut stream: S,
    config: SerialListenerConfig,
    queue: RequestQueue,
    stats: SharedStats,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> ModbusResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (connection, mut responses) = ChannelConnection::new(config.port.clone());
    let connection: Arc<dyn Connection> = Arc::new(connection);
    let protocol = config.encoding.label();
    let gap = config.frame_gap();
    let mut buffer = BytesMut::with_capacity(MAX_ASCII_FRAME_SIZE);

    info!("Modbus {} listener started on {} @ {} baud", protocol, config.port, config.baud_rate);

    loop {
        let read = tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping {} listener", protocol);
                return Ok(());
            }
            read = async {
                match config.encoding {
                    SerialEncoding::Rtu => read_rtu_frame(&mut stream, gap).await,
                    SerialEncoding::Ascii => read_ascii_frame(&mut stream, &mut buffer).await,
                }
            } => read,
        };

        let raw = match read {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!("Serial port {} closed", config.port);
                return Ok(());
            }
            Err(e) if e.is_protocol_error() => {
                warn!("Dropping serial frame on {}: {}", config.port, e);
                continue;
            }
            Err(e) => return Err(e),
        };

        stats.lock().await.bytes_received += raw.len() as u64;
        if config.packet_logging {
            log_packet("RX", &raw, protocol, None);
        }

        let frame = match decode_serial_frame(config.encoding, &raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping undecodable frame on {}: {}", config.port, e);
                continue;
            }
        };

        let unit_id = frame.unit_id();
        let broadcast = unit_id == 0;
        if let Some(expected) = config.unit_id {
            if !broadcast && unit_id != expected {
                debug!("Ignoring frame for unit {}", unit_id);
                continue;
            }
        }

        queue.submit(Request::new(frame, connection.clone()))?;
        let response = responses.recv().await.ok_or(ModbusError::ServerShutdown)?;

        if broadcast {
            debug!("Broadcast request applied without response");
            continue;
        }

        if config.packet_logging {
            log_packet("TX", &response, protocol, Some(unit_id));
        }
        stream.write_all(&response).await?;
        stats.lock().await.bytes_sent += response.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ModbusSlave, ServerStats};
    use tokio::sync::Mutex;
    use tokio_test::io::Builder;

    fn shared_stats() -> SharedStats {
        Arc::new(Mutex::new(ServerStats::default()))
    }

    #[tokio::test]
    async fn test_tcp_connection_split_frames() {
        let slave = ModbusSlave::new();
        slave.with_registers(|bank| bank.write_multiple_registers(0, &[1, 2]).unwrap()).await.unwrap();

        // Request arrives in two pieces, a second one right behind it
        let stream = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00])
            .read(&[0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02])
            .write(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02])
            .read(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x00, 0x00, 0x09])
            .write(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x00, 0x00, 0x09])
            .build();

        let (_tx, rx) = broadcast::channel(1);
        let stats = shared_stats();
        serve_connection(stream, "mock".to_string(), &TcpListenerConfig::default(), slave.queue(), stats.clone(), rx)
            .await
            .unwrap();

        let stats = stats.lock().await;
        assert_eq!(stats.bytes_received, 24);
        assert_eq!(stats.bytes_sent, 25);
        assert_eq!(slave.with_registers(|bank| bank.holding_registers()[0]).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_tcp_connection_closes_on_bad_header() {
        let slave = ModbusSlave::new();
        let stream = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x07, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01])
            .build();

        let (_tx, rx) = broadcast::channel(1);
        let result = serve_connection(stream, "mock".to_string(), &TcpListenerConfig::default(), slave.queue(), shared_stats(), rx).await;
        assert!(matches!(result, Err(ModbusError::Frame { .. })));
    }

    #[tokio::test]
    async fn test_rtu_line_with_unit_filter() {
        let slave = ModbusSlave::new();
        slave.with_registers(|bank| bank.set_input_register(0, 0x0102)).await.unwrap();

        let request = RtuFrame::new(0x11, &[0x04, 0x00, 0x00, 0x00, 0x01]).unwrap().to_bytes();
        let response = RtuFrame::new(0x11, &[0x04, 0x02, 0x01, 0x02]).unwrap().to_bytes();
        let other_unit = RtuFrame::new(0x12, &[0x04, 0x00, 0x00, 0x00, 0x01]).unwrap().to_bytes();
        let corrupted = [0x11, 0x04, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00];

        let stream = Builder::new()
            .read(&other_unit)
            .wait(Duration::from_millis(20))
            .read(&corrupted)
            .wait(Duration::from_millis(20))
            .read(&request)
            .write(&response)
            .build();

        let config = SerialListenerConfig {
            unit_id: Some(0x11),
            ..SerialListenerConfig::rtu("mock", 9600)
        };
        let (_tx, rx) = broadcast::channel(1);
        serve_serial(stream, config, slave.queue(), shared_stats(), rx).await.unwrap();

        let stats = slave.stats().await;
        assert_eq!(stats.total_requests, 1);
    }

    #[tokio::test]
    async fn test_ascii_line_broadcast_is_silent() {
        let slave = ModbusSlave::new();

        let broadcast_write = AsciiFrame::new(0x00, &[0x06, 0x00, 0x01, 0x00, 0x2A]).unwrap().to_bytes();
        let read = AsciiFrame::new(0x01, &[0x03, 0x00, 0x01, 0x00, 0x01]).unwrap().to_bytes();
        let answer = AsciiFrame::new(0x01, &[0x03, 0x02, 0x00, 0x2A]).unwrap().to_bytes();

        let mut both = broadcast_write.clone();
        both.extend_from_slice(&read);

        let stream = Builder::new().read(&both).write(&answer).build();
        let (_tx, rx) = broadcast::channel(1);
        serve_serial(stream, SerialListenerConfig::ascii("mock", 9600), slave.queue(), shared_stats(), rx)
            .await
            .unwrap();

        assert_eq!(slave.with_registers(|bank| bank.holding_registers()[1]).await.unwrap(), 0x2A);
    }

    #[tokio::test]
    async fn test_ascii_line_resyncs_on_start_character() {
        let slave = ModbusSlave::new();
        slave.with_registers(|bank| bank.write_single_register(4, 0x0BEE)).await.unwrap();

        let read = AsciiFrame::new(0x01, &[0x03, 0x00, 0x04, 0x00, 0x01]).unwrap().to_bytes();
        let answer = AsciiFrame::new(0x01, &[0x03, 0x02, 0x0B, 0xEE]).unwrap().to_bytes();

        // Line noise, then a frame cut short by a restart
        let mut line = vec![0x00, 0xFF, b'z'];
        line.extend_from_slice(b":0103");
        line.extend_from_slice(&read);

        let stream = Builder::new().read(&line).write(&answer).build();
        let (_tx, rx) = broadcast::channel(1);
        serve_serial(stream, SerialListenerConfig::ascii("mock", 9600), slave.queue(), shared_stats(), rx)
            .await
            .unwrap();

        assert_eq!(slave.stats().await.total_requests, 1);
    }

    #[test]
    fn test_serial_config() {
        let config = SerialListenerConfig::rtu("/dev/ttyS0", 9600);
        assert_eq!(config.frame_gap(), Duration::from_micros(4007));
        assert!(config.validate().is_ok());

        let fast = SerialListenerConfig::rtu("/dev/ttyS0", 115_200);
        assert_eq!(fast.frame_gap(), Duration::from_micros(1_750));

        let bad = SerialListenerConfig { data_bits: 9, ..Default::default() };
        assert!(matches!(bad.validate(), Err(ModbusError::Configuration { .. })));

        let reserved = SerialListenerConfig { unit_id: Some(0), ..Default::default() };
        assert!(reserved.validate().is_err());
    }

    #[test]
    fn test_tcp_config_defaults() {
        let config = TcpListenerConfig::default();
        assert_eq!(config.bind_address.port(), 502);
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));

        let json = serde_json::to_string(&config).unwrap();
        let parsed: TcpListenerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
