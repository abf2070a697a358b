//! Node configuration from `AXON_*` environment variables.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use axon_bus::{BusConfig, EscalatorConfig};
use axon_clock::NodeId;
use axon_cluster::AggregatorConfig;
use axon_crdt::StoreConfig;
use axon_sync::SyncConfig;

use crate::error::{Error, Result};

/// Everything needed to start a [`Node`](crate::Node).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub bus: BusConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub escalator: EscalatorConfig,
    pub aggregator: AggregatorConfig,
}

impl NodeConfig {
    /// Defaults for everything except the node id.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            bus: BusConfig::default(),
            store: StoreConfig::default(),
            sync: SyncConfig::default(),
            escalator: EscalatorConfig::default(),
            aggregator: AggregatorConfig::default(),
        }
    }

    /// Read the process environment.
    ///
    /// | variable                      | default  |
    /// |-------------------------------|----------|
    /// | `AXON_NODE_ID`                | `axon-1` |
    /// | `AXON_MIN_PEERS`              | 1        |
    /// | `AXON_MAX_CLOCK_DRIFT_MS`     | 500      |
    /// | `AXON_SYNC_INTERVAL_MS`       | 5000     |
    /// | `AXON_HEARTBEAT_INTERVAL_MS`  | 2000     |
    /// | `AXON_DISCOVERY_INTERVAL_MS`  | 10000    |
    /// | `AXON_EXCHANGE_TIMEOUT_MS`    | 2000     |
    /// | `AXON_SUBSCRIBER_CAPACITY`    | 1024     |
    /// | `AXON_MAX_LOG_LEN`            | 1024     |
    /// | `AXON_MAX_RESTARTS`           | 5        |
    /// | `AXON_ALGEDONIC_THRESHOLD`    | 0.8      |
    /// | `AXON_CONSENSUS_QUORUM`       | 2        |
    /// | `AXON_SEARCH_TIMEOUT_MS`      | 500      |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup };

        let node_id = env.raw("AXON_NODE_ID").unwrap_or_else(|| "axon-1".to_string());
        let defaults = Self::new(NodeId::new(node_id)?);

        let sync = defaults
            .sync
            .clone()
            .with_min_peers(env.parse("AXON_MIN_PEERS", defaults.sync.min_peers)?)
            .with_max_clock_drift(env.millis("AXON_MAX_CLOCK_DRIFT_MS", defaults.sync.max_clock_drift)?)
            .with_sync_interval(env.millis("AXON_SYNC_INTERVAL_MS", defaults.sync.sync_interval)?)
            .with_heartbeat_interval(env.millis("AXON_HEARTBEAT_INTERVAL_MS", defaults.sync.heartbeat_interval)?)
            .with_discovery_interval(env.millis("AXON_DISCOVERY_INTERVAL_MS", defaults.sync.discovery_interval)?)
            .with_exchange_timeout(env.millis("AXON_EXCHANGE_TIMEOUT_MS", defaults.sync.exchange_timeout)?);

        let bus = defaults
            .bus
            .clone()
            .with_subscriber_capacity(env.parse("AXON_SUBSCRIBER_CAPACITY", defaults.bus.subscriber_capacity)?);

        let restart = defaults
            .store
            .restart
            .with_max_restarts(env.parse("AXON_MAX_RESTARTS", defaults.store.restart.max_restarts)?);
        let store = defaults
            .store
            .clone()
            .with_max_log_len(env.parse("AXON_MAX_LOG_LEN", defaults.store.max_log_len)?)
            .with_restart_policy(restart);

        let threshold: f64 = env.parse("AXON_ALGEDONIC_THRESHOLD", defaults.escalator.threshold)?;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::Config {
                var: "AXON_ALGEDONIC_THRESHOLD",
                value: threshold.to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        let escalator = defaults.escalator.with_threshold(threshold);

        let aggregator = defaults
            .aggregator
            .clone()
            .with_consensus_quorum(env.parse("AXON_CONSENSUS_QUORUM", defaults.aggregator.consensus_quorum)?)
            .with_search_timeout(env.millis("AXON_SEARCH_TIMEOUT_MS", defaults.aggregator.search_timeout)?);

        let config = Self {
            node_id: defaults.node_id,
            bus,
            store,
            sync,
            escalator,
            aggregator,
        };
        Ok(config)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn raw(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.raw(var) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| Error::Config {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn millis(&self, var: &'static str, default: Duration) -> Result<Duration> {
        let ms = self.parse(var, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }
}
