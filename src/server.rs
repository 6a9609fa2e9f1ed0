//! Modbus slave engine
//!
//! [`ModbusSlave`] owns the register bank and the dispatch table and hands
//! both to a single request serializer task. Transports decode frames, pair
//! them with the connection they came from and submit them as [`Request`]s;
//! the serializer applies them one at a time in submission order and writes
//! each response back to its connection.
//!
//! Registration and register inspection after startup travel over the same
//! queue as requests, so nothing ever touches the bank concurrently with a
//! handler.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use log::{debug, error, info, warn};

use crate::codec::FunctionHandler;
use crate::dispatch::DispatchTable;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::Frame;
use crate::logging::CallbackLogger;
use crate::protocol::EXCEPTION_FLAG;
use crate::register_bank::{ModbusRegisterBank, RegisterBankStats};
use crate::simulation::{DataSource, RegisterSimulator};
use crate::transport::{self, SerialListenerConfig, TcpListenerConfig};
use crate::utils::{OperationTimer, PerformanceMetrics};

/// Duplex connection a response is written back to
#[async_trait]
pub trait Connection: Send + Sync {
    /// Write one serialized response frame
    async fn write(&self, bytes: &[u8]) -> ModbusResult<()>;

    /// Peer description for logs
    fn peer(&self) -> String {
        "unknown".to_string()
    }
}

/// Connection that forwards response bytes into a channel
///
/// Listeners own the socket or serial port and drain the receiving end, so
/// the serializer never blocks on device I/O.
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    peer: String,
}

impl ChannelConnection {
    /// Create a connection and the receiver its responses arrive on
    pub fn new<S: Into<String>>(peer: S) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, peer: peer.into() }, rx)
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn write(&self, bytes: &[u8]) -> ModbusResult<()> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| ModbusError::connection(format!("Connection {} is closed", self.peer)))
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// A decoded frame paired with the connection it arrived on
pub struct Request {
    pub frame: Box<dyn Frame>,
    pub connection: Arc<dyn Connection>,
}

impl Request {
    pub fn new(frame: Box<dyn Frame>, connection: Arc<dyn Connection>) -> Self {
        Self { frame, connection }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("frame", &self.frame)
            .field("peer", &self.connection.peer())
            .finish()
    }
}

type Inspection = Box<dyn FnOnce(&mut ModbusRegisterBank) + Send>;

/// Work items of the request serializer
enum Command {
    Request(Request),
    Register {
        function: u8,
        handler: FunctionHandler,
        reply: oneshot::Sender<ModbusResult<()>>,
    },
    Inspect(Inspection),
    Stop,
}

/// Server statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub exception_responses: u64,
    pub write_failures: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
    pub metrics: PerformanceMetrics,
    pub register_bank_stats: Option<RegisterBankStats>,
}

/// Statistics shared between the serializer and the listeners
pub type SharedStats = Arc<Mutex<ServerStats>>;

/// Submission handle for the request serializer
///
/// Cheap to clone; every transport and simulator holds one.
#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<Command>,
}

impl RequestQueue {
    fn send(&self, command: Command) -> ModbusResult<()> {
        self.tx.send(command).map_err(|_| ModbusError::ServerShutdown)
    }

    /// Enqueue a request; its response is written to the request's connection
    pub fn submit(&self, request: Request) -> ModbusResult<()> {
        self.send(Command::Request(request))
    }

    /// Install or replace a function handler between two requests
    pub async fn register_function_handler(&self, function: u8, handler: FunctionHandler) -> ModbusResult<()> {
        DispatchTable::validate_function_code(function)?;

        let (reply, rx) = oneshot::channel();
        self.send(Command::Register { function, handler, reply })?;
        rx.await.map_err(|_| ModbusError::ServerShutdown)?
    }

    /// Run `f` against the register bank inside the serializer
    pub async fn with_registers<F, R>(&self, f: F) -> ModbusResult<R>
    where
        F: FnOnce(&mut ModbusRegisterBank) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Inspect(Box::new(move |bank| {
            let _ = reply.send(f(bank));
        })))?;
        rx.await.map_err(|_| ModbusError::ServerShutdown)
    }

    fn stop(&self) -> bool {
        self.send(Command::Stop).is_ok()
    }
}

/// Pre-traffic configuration of a [`ModbusSlave`]
pub struct SlaveBuilder {
    register_bank: ModbusRegisterBank,
    dispatch: DispatchTable,
    logger: CallbackLogger,
}

impl SlaveBuilder {
    /// Zeroed register bank, the standard codecs and no callback logger
    pub fn new() -> Self {
        Self {
            register_bank: ModbusRegisterBank::new(),
            dispatch: DispatchTable::with_defaults(),
            logger: CallbackLogger::disabled(),
        }
    }

    /// Replace the initial register bank
    pub fn register_bank(mut self, register_bank: ModbusRegisterBank) -> Self {
        self.register_bank = register_bank;
        self
    }

    /// Seed the register bank before the serializer takes ownership of it
    pub fn register_bank_mut(&mut self) -> &mut ModbusRegisterBank {
        &mut self.register_bank
    }

    /// Replace the whole dispatch table
    pub fn dispatch_table(mut self, dispatch: DispatchTable) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Install or replace the handler for one function code
    pub fn function_handler(mut self, function: u8, handler: FunctionHandler) -> ModbusResult<Self> {
        self.dispatch.register(function, handler)?;
        Ok(self)
    }

    /// Attach a request/response logger
    pub fn logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Start the request serializer
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> ModbusSlave {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let stats: SharedStats = Arc::new(Mutex::new(ServerStats::default()));

        let serializer = Serializer {
            register_bank: self.register_bank,
            dispatch: self.dispatch,
            logger: self.logger,
            stats: stats.clone(),
        };
        let handle = tokio::spawn(serializer.run(rx));

        ModbusSlave {
            queue: RequestQueue { tx },
            stats,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            serializer: Mutex::new(Some(handle)),
            start_time: Instant::now(),
        }
    }
}

impl Default for SlaveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The single consumer of the request queue
struct Serializer {
    register_bank: ModbusRegisterBank,
    dispatch: DispatchTable,
    logger: CallbackLogger,
    stats: SharedStats,
}

impl Serializer {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!("Request serializer started");

        while let Some(command) = rx.recv().await {
            match command {
                Command::Request(request) => self.process(request).await,
                Command::Register { function, handler, reply } => {
                    let _ = reply.send(self.dispatch.register(function, handler));
                }
                Command::Inspect(f) => f(&mut self.register_bank),
                Command::Stop => {
                    // Already queued commands are still drained
                    debug!("Request serializer stopping");
                    rx.close();
                }
            }
        }

        debug!("Request serializer stopped");
    }

    async fn process(&mut self, request: Request) {
        let timer = OperationTimer::start("dispatch");
        self.logger.log_request(request.frame.as_ref());

        let response = self.dispatch.dispatch(&mut self.register_bank, request.frame.as_ref());
        let duration = timer.stop();
        let is_exception = response.function() & EXCEPTION_FLAG != 0;

        self.logger.log_response(response.as_ref());
        let bytes = response.to_bytes();
        let write_result = request.connection.write(&bytes).await;

        let mut stats = self.stats.lock().await;
        stats.total_requests += 1;
        if is_exception {
            stats.exception_responses += 1;
            stats.metrics.record_failure(duration);
        } else {
            stats.metrics.record_success(duration);
        }

        if let Err(e) = write_result {
            stats.write_failures += 1;
            warn!("Failed to deliver response to {}: {}", request.connection.peer(), e);
        }
    }
}

/// Modbus slave façade
///
/// ```rust,no_run
/// use voltage_mbserver::{ModbusSlave, TcpListenerConfig};
///
/// #[tokio::main]
/// async fn main() -> voltage_mbserver::ModbusResult<()> {
///     let slave = ModbusSlave::new();
///     slave.with_registers(|bank| bank.write_single_register(0, 1234)).await?;
///     let addr = slave.listen_tcp(TcpListenerConfig::default()).await?;
///     println!("listening on {}", addr);
///
///     tokio::signal::ctrl_c().await?;
///     slave.shutdown().await
/// }
/// ```
pub struct ModbusSlave {
    queue: RequestQueue,
    stats: SharedStats,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    serializer: Mutex<Option<JoinHandle<()>>>,
    start_time: Instant,
}

impl ModbusSlave {
    /// Slave with a zeroed register bank and the standard codecs
    pub fn new() -> Self {
        SlaveBuilder::new().build()
    }

    pub fn builder() -> SlaveBuilder {
        SlaveBuilder::new()
    }

    /// Submission handle for custom transports
    pub fn queue(&self) -> RequestQueue {
        self.queue.clone()
    }

    /// Enqueue a request
    pub fn submit(&self, request: Request) -> ModbusResult<()> {
        self.queue.submit(request)
    }

    /// Install or replace a function handler while traffic is flowing
    pub async fn register_function_handler(&self, function: u8, handler: FunctionHandler) -> ModbusResult<()> {
        self.queue.register_function_handler(function, handler).await
    }

    /// Read or write the register bank inside the serializer
    pub async fn with_registers<F, R>(&self, f: F) -> ModbusResult<R>
    where
        F: FnOnce(&mut ModbusRegisterBank) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.queue.with_registers(f).await
    }

    /// Snapshot of the server statistics
    pub async fn stats(&self) -> ServerStats {
        let register_bank_stats = self.with_registers(|bank| bank.get_stats()).await.ok();

        let mut stats = self.stats.lock().await.clone();
        stats.uptime_seconds = self.start_time.elapsed().as_secs();
        stats.register_bank_stats = register_bank_stats;
        stats
    }

    /// Bind a TCP listener and serve it until shutdown
    ///
    /// Returns the bound address, which differs from the configured one when
    /// binding port 0.
    pub async fn listen_tcp(&self, config: TcpListenerConfig) -> ModbusResult<SocketAddr> {
        let listener = transport::bind_tcp(&config).await?;
        let local_addr = listener.local_addr()?;

        let handle = tokio::spawn(transport::run_tcp_listener(
            listener,
            config,
            self.queue.clone(),
            self.stats.clone(),
            self.shutdown_tx.clone(),
        ));
        self.tasks.lock().await.push(handle);

        Ok(local_addr)
    }

    /// Open a serial port and serve it until shutdown
    pub async fn listen_serial(&self, config: SerialListenerConfig) -> ModbusResult<()> {
        let port = transport::open_serial(&config)?;
        let queue = self.queue.clone();
        let stats = self.stats.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let name = config.port.clone();
            if let Err(e) = transport::serve_serial(port, config, queue, stats, shutdown_rx).await {
                error!("Serial listener on {} stopped: {}", name, e);
            }
        });
        self.tasks.lock().await.push(handle);

        Ok(())
    }

    /// Run a register simulator until shutdown
    pub async fn spawn_simulator<D>(&self, simulator: RegisterSimulator<D>)
    where
        D: DataSource + 'static,
    {
        let handle = tokio::spawn(simulator.run(self.queue.clone(), self.shutdown_tx.subscribe()));
        self.tasks.lock().await.push(handle);
    }

    /// Stop listeners and simulators, then drain and stop the serializer
    ///
    /// Requests accepted before this call are still applied and answered.
    /// Later submissions fail with [`ModbusError::ServerShutdown`]. Calling
    /// it twice is harmless.
    pub async fn shutdown(&self) -> ModbusResult<()> {
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        if self.queue.stop() {
            info!("Draining request queue");
        }

        if let Some(handle) = self.serializer.lock().await.take() {
            handle
                .await
                .map_err(|e| ModbusError::internal(format!("Request serializer failed: {}", e)))?;
            info!("Modbus slave stopped");
        }

        Ok(())
    }

    /// Time since the slave was built
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for ModbusSlave {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, CodecResult};
    use crate::frame::TcpFrame;
    use crate::protocol::ModbusException;

    fn tcp_request(tid: u16, pdu: &[u8]) -> Box<dyn Frame> {
        Box::new(TcpFrame::new(tid, 1, pdu).unwrap())
    }

    struct FailingConnection;

    #[async_trait]
    impl Connection for FailingConnection {
        async fn write(&self, _bytes: &[u8]) -> ModbusResult<()> {
            Err(ModbusError::connection("peer reset"))
        }
    }

    #[tokio::test]
    async fn test_submit_and_respond() {
        let slave = ModbusSlave::new();
        let (connection, mut responses) = ChannelConnection::new("test");
        let connection: Arc<dyn Connection> = Arc::new(connection);

        slave
            .submit(Request::new(tcp_request(9, &[0x06, 0x00, 0x05, 0x12, 0x34]), connection.clone()))
            .unwrap();
        slave
            .submit(Request::new(tcp_request(10, &[0x03, 0x00, 0x05, 0x00, 0x01]), connection))
            .unwrap();

        assert_eq!(
            responses.recv().await.unwrap(),
            vec![0x00, 0x09, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x05, 0x12, 0x34]
        );
        assert_eq!(
            responses.recv().await.unwrap(),
            vec![0x00, 0x0A, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x12, 0x34]
        );
    }

    #[tokio::test]
    async fn test_write_failure_does_not_stop_serializer() {
        let slave = ModbusSlave::new();
        slave
            .submit(Request::new(
                tcp_request(1, &[0x06, 0x00, 0x00, 0x00, 0x2A]),
                Arc::new(FailingConnection),
            ))
            .unwrap();

        let value = slave.with_registers(|bank| bank.holding_registers()[0]).await.unwrap();
        assert_eq!(value, 0x2A);

        let stats = slave.stats().await;
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.write_failures, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_serializer() {
        fn broken(_bank: &mut ModbusRegisterBank, _frame: &dyn Frame) -> CodecResult {
            panic!("handler bug");
        }

        let slave = ModbusSlave::builder()
            .function_handler(0x41, codec::handler(broken))
            .unwrap()
            .build();

        let (connection, mut responses) = ChannelConnection::new("test");
        let connection: Arc<dyn Connection> = Arc::new(connection);
        slave.submit(Request::new(tcp_request(1, &[0x41]), connection.clone())).unwrap();
        slave
            .submit(Request::new(tcp_request(2, &[0x03, 0x00, 0x00, 0x00, 0x01]), connection))
            .unwrap();

        assert_eq!(&responses.recv().await.unwrap()[7..], &[0xC1, 0x04]);
        assert_eq!(&responses.recv().await.unwrap()[7..], &[0x03, 0x02, 0x00, 0x00]);

        let stats = slave.stats().await;
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.exception_responses, 1);
    }

    #[tokio::test]
    async fn test_builder_seed_and_override() {
        fn fixed(_bank: &mut ModbusRegisterBank, _frame: &dyn Frame) -> CodecResult {
            Ok(vec![0x02, 0xCA, 0xFE])
        }

        let mut builder = ModbusSlave::builder();
        builder.register_bank_mut().set_input_register(3, 77);
        let slave = builder.function_handler(0x03, codec::handler(fixed)).unwrap().build();

        let (connection, mut responses) = ChannelConnection::new("test");
        let connection: Arc<dyn Connection> = Arc::new(connection);
        slave
            .submit(Request::new(tcp_request(1, &[0x03, 0x00, 0x00, 0x00, 0x01]), connection.clone()))
            .unwrap();
        slave
            .submit(Request::new(tcp_request(2, &[0x04, 0x00, 0x03, 0x00, 0x01]), connection))
            .unwrap();

        assert_eq!(&responses.recv().await.unwrap()[7..], &[0x03, 0x02, 0xCA, 0xFE]);
        assert_eq!(&responses.recv().await.unwrap()[7..], &[0x04, 0x02, 0x00, 0x4D]);
    }

    #[tokio::test]
    async fn test_runtime_registration() {
        let slave = ModbusSlave::new();

        assert!(matches!(
            slave
                .register_function_handler(0x83, codec::handler(|_, _| Ok(Vec::new())))
                .await,
            Err(ModbusError::InvalidFunction { code: 0x83 })
        ));

        slave
            .register_function_handler(0x41, codec::handler(|_, _| Err(ModbusException::SlaveDeviceBusy)))
            .await
            .unwrap();

        let (connection, mut responses) = ChannelConnection::new("test");
        slave
            .submit(Request::new(tcp_request(1, &[0x41]), Arc::new(connection)))
            .unwrap();
        assert_eq!(&responses.recv().await.unwrap()[7..], &[0xC1, 0x06]);

        let stats = slave.stats().await;
        assert_eq!(stats.exception_responses, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_rejects() {
        let slave = ModbusSlave::new();
        let (connection, mut responses) = ChannelConnection::new("test");
        let connection: Arc<dyn Connection> = Arc::new(connection);

        for address in 0..10u8 {
            slave
                .submit(Request::new(
                    tcp_request(address as u16, &[0x05, 0x00, address, 0xFF, 0x00]),
                    connection.clone(),
                ))
                .unwrap();
        }
        slave.shutdown().await.unwrap();

        for _ in 0..10 {
            assert!(responses.recv().await.is_some());
        }

        let late = slave.submit(Request::new(tcp_request(99, &[0x03, 0x00, 0x00, 0x00, 0x01]), connection));
        assert!(matches!(late, Err(ModbusError::ServerShutdown)));
        assert!(matches!(
            slave.with_registers(|bank| bank.coils()[0]).await,
            Err(ModbusError::ServerShutdown)
        ));

        // Idempotent
        slave.shutdown().await.unwrap();
    }
}
