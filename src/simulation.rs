//! Background register simulation
//!
//! Periodically writes values from a [`DataSource`] into holding registers,
//! e.g. to make a bench slave look like a live sensor. Values are computed
//! outside the serializer and applied in one batch through
//! [`RequestQueue::with_registers`], so a client never sees a half-applied
//! update.

use std::time::Duration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use log::{debug, info, warn};

use crate::error::{ModbusError, ModbusResult};
use crate::server::RequestQueue;

/// Source of simulated register values
pub trait DataSource: Send {
    /// Next value for the register at `address`
    fn next_value(&mut self, address: u16) -> u16;
}

/// Uniformly distributed values from an explicitly seeded generator
#[derive(Debug, Clone)]
pub struct RandomSource {
    rng: StdRng,
    min: u16,
    max: u16,
}

impl RandomSource {
    pub fn new(seed: u64, min: u16, max: u16) -> ModbusResult<Self> {
        if min > max {
            return Err(ModbusError::configuration(format!(
                "Simulation range is empty: {}..={}", min, max
            )));
        }
        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            min,
            max,
        })
    }
}

impl DataSource for RandomSource {
    fn next_value(&mut self, _address: u16) -> u16 {
        self.rng.gen_range(self.min..=self.max)
    }
}

/// Any `FnMut(address) -> value` closure is a data source
impl<F> DataSource for F
where
    F: FnMut(u16) -> u16 + Send,
{
    fn next_value(&mut self, address: u16) -> u16 {
        self(address)
    }
}

/// Simulation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Holding registers to refresh
    pub addresses: Vec<u16>,
    pub min: u16,
    pub max: u16,
    pub interval: Duration,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            min: 0,
            max: u16::MAX,
            interval: Duration::from_secs(1),
            seed: 0,
        }
    }
}

/// Periodic holding-register updater
pub struct RegisterSimulator<D: DataSource> {
    addresses: Vec<u16>,
    interval: Duration,
    source: D,
}

impl RegisterSimulator<RandomSource> {
    /// Simulator drawing from a [`RandomSource`] built from `config`
    pub fn from_config(config: SimulationConfig) -> ModbusResult<Self> {
        let source = RandomSource::new(config.seed, config.min, config.max)?;
        Self::new(config.addresses, config.interval, source)
    }
}

impl<D: DataSource> RegisterSimulator<D> {
    pub fn new(addresses: Vec<u16>, interval: Duration, source: D) -> ModbusResult<Self> {
        if interval.is_zero() {
            return Err(ModbusError::configuration("Simulation interval must be positive"));
        }
        Ok(Self { addresses, interval, source })
    }

    /// Apply one round of values
    pub async fn tick(&mut self, queue: &RequestQueue) -> ModbusResult<()> {
        let updates: Vec<(u16, u16)> = self
            .addresses
            .iter()
            .map(|&address| (address, self.source.next_value(address)))
            .collect();

        debug!("Simulating {} registers", updates.len());
        queue
            .with_registers(move |bank| {
                for (address, value) in updates {
                    bank.write_single_register(address, value);
                }
            })
            .await
    }

    /// Tick on the configured interval until shutdown
    pub async fn run(mut self, queue: RequestQueue, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Register simulator started for {} registers every {:?}", self.addresses.len(), self.interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(&queue).await {
                        warn!("Register simulator stopped: {}", e);
                        return;
                    }
                }
            }
        }

        info!("Register simulator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ModbusSlave;

    #[test]
    fn test_random_source_is_reproducible() {
        let mut a = RandomSource::new(42, 10, 20).unwrap();
        let mut b = RandomSource::new(42, 10, 20).unwrap();

        for address in 0..100 {
            let value = a.next_value(address);
            assert_eq!(value, b.next_value(address));
            assert!((10..=20).contains(&value));
        }

        assert!(RandomSource::new(0, 5, 4).is_err());
    }

    #[test]
    fn test_config_validation() {
        let config = SimulationConfig { interval: Duration::ZERO, ..Default::default() };
        assert!(RegisterSimulator::from_config(config).is_err());
    }

    #[tokio::test]
    async fn test_tick_writes_through_serializer() {
        let slave = ModbusSlave::new();
        let mut simulator = RegisterSimulator::new(
            vec![3, 7],
            Duration::from_millis(10),
            |address: u16| address * 100,
        )
        .unwrap();

        simulator.tick(&slave.queue()).await.unwrap();

        let values = slave
            .with_registers(|bank| (bank.holding_registers()[3], bank.holding_registers()[7]))
            .await
            .unwrap();
        assert_eq!(values, (300, 700));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let slave = ModbusSlave::new();
        let simulator = RegisterSimulator::from_config(SimulationConfig {
            addresses: vec![0],
            min: 1,
            max: 1,
            interval: Duration::from_millis(5),
            seed: 7,
        })
        .unwrap();

        slave.spawn_simulator(simulator).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(slave.with_registers(|bank| bank.holding_registers()[0]).await.unwrap(), 1);

        slave.shutdown().await.unwrap();
    }
}
