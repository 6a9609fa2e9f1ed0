/// Voltage Modbus Server Demo
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
/// Seeds a slave with test data and serves it over TCP, and over a serial
/// line when `MBSERVER_SERIAL` names a port.
///
/// Environment:
/// - `MBSERVER_BIND` - TCP bind address (default `127.0.0.1:5020`)
/// - `MBSERVER_SERIAL` - serial port for an RTU listener
/// - `MBSERVER_BAUD` - serial baud rate (default 9600)
/// - `MBSERVER_SIMULATE` - refresh holding registers 50..60 with random values

use std::env;
use std::time::Duration;
use anyhow::Context;
use log::{error, info};
use tokio::signal;

use voltage_mbserver::{
    utils::format::format_metrics, CallbackLogger, ModbusSlave, RegisterSimulator,
    SerialListenerConfig, SimulationConfig, TcpListenerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    println!("🚀 {}", voltage_mbserver::info());
    println!("=============================");

    let mut builder = ModbusSlave::builder();

    info!("🔧 Initializing test data...");
    let bank = builder.register_bank_mut();
    for i in 0..50u16 {
        bank.write_single_register(i, 0x1000 + i);
        bank.write_single_coil(i, i % 3 == 0);
        bank.set_input_register(i, 0x2000 + i);
        bank.set_discrete_input(i, i % 2 == 0);
    }

    let slave = builder.logger(CallbackLogger::console()).build();

    let bind_address = env::var("MBSERVER_BIND").unwrap_or_else(|_| "127.0.0.1:5020".to_string());
    let config = TcpListenerConfig {
        bind_address: bind_address
            .parse()
            .with_context(|| format!("invalid bind address {}", bind_address))?,
        max_connections: 50,
        idle_timeout: Duration::from_secs(30),
        packet_logging: true,
    };

    let local_addr = slave.listen_tcp(config).await?;
    info!("✅ Listening on {}", local_addr);

    if let Ok(port) = env::var("MBSERVER_SERIAL") {
        let baud_rate = match env::var("MBSERVER_BAUD") {
            Ok(baud) => baud.parse().with_context(|| format!("invalid baud rate {}", baud))?,
            Err(_) => 9600,
        };
        slave.listen_serial(SerialListenerConfig::rtu(port.clone(), baud_rate)).await?;
        info!("✅ RTU listener on {} @ {} baud", port, baud_rate);
    }

    if env::var("MBSERVER_SIMULATE").is_ok() {
        let simulator = RegisterSimulator::from_config(SimulationConfig {
            addresses: (50..60).collect(),
            min: 0,
            max: 1000,
            interval: Duration::from_secs(5),
            seed: 2024,
        })?;
        slave.spawn_simulator(simulator).await;
        info!("🔄 Simulating holding registers 50..60");
    }

    println!("\n📋 Server running...");
    println!("   - Addresses 0-49 hold test data in every space");
    println!("   - Press Ctrl+C to stop the server");

    if let Err(err) = signal::ctrl_c().await {
        error!("❌ Failed to listen for interrupt signal: {}", err);
    }
    info!("🛑 Stopping server...");

    slave.shutdown().await?;

    let stats = slave.stats().await;
    info!("📊 Final server statistics:");
    info!("   Total connections: {}", stats.connections_count);
    info!("   Total requests: {}", stats.total_requests);
    info!("   Exception responses: {}", stats.exception_responses);
    info!("   Write failures: {}", stats.write_failures);
    info!("   Bytes received: {} bytes", stats.bytes_received);
    info!("   Bytes sent: {} bytes", stats.bytes_sent);
    info!("   Uptime: {} seconds", stats.uptime_seconds);
    println!("{}", format_metrics(&stats.metrics));

    Ok(())
}
