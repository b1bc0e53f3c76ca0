//! Configuration types.

use std::time::Duration;

/// Message pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of workers draining the incoming message queue.
    pub incoming_workers: usize,
    /// Number of workers dispatching outgoing messages.
    pub dispatch_workers: usize,
    /// Capacity of the bounded incoming message queue.
    pub incoming_queue_size: usize,
    /// Capacity of the bounded outgoing dispatch queue.
    pub dispatch_queue_size: usize,
    /// How often the store is scanned for pending outgoing messages.
    pub scan_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            incoming_workers: 2,
            dispatch_workers: 4,
            incoming_queue_size: 1000,
            dispatch_queue_size: 1000,
            scan_interval: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Build config from `DESKRELAY_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            incoming_workers: env_usize("DESKRELAY_INCOMING_WORKERS", d.incoming_workers),
            dispatch_workers: env_usize("DESKRELAY_DISPATCH_WORKERS", d.dispatch_workers),
            incoming_queue_size: env_usize("DESKRELAY_INCOMING_QUEUE_SIZE", d.incoming_queue_size),
            dispatch_queue_size: env_usize("DESKRELAY_DISPATCH_QUEUE_SIZE", d.dispatch_queue_size),
            scan_interval: Duration::from_secs(env_u64(
                "DESKRELAY_SCAN_INTERVAL_SECS",
                d.scan_interval.as_secs(),
            )),
        }
    }
}

/// Automation engine configuration.
#[derive(Debug, Clone)]
pub struct AutomationConfig {
    /// Number of rule evaluation workers.
    pub workers: usize,
    /// Capacity of the trigger and task queues.
    pub queue_size: usize,
    /// Wall-clock interval between time-trigger sweeps.
    pub sweep_interval: Duration,
    /// Trailing window of conversations a sweep evaluates.
    pub lookback: Duration,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_size: 5000,
            sweep_interval: Duration::from_secs(3600), // 1 hour
            lookback: Duration::from_secs(30 * 24 * 3600), // 30 days
        }
    }
}

impl AutomationConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_usize("DESKRELAY_AUTOMATION_WORKERS", d.workers),
            queue_size: env_usize("DESKRELAY_AUTOMATION_QUEUE_SIZE", d.queue_size),
            sweep_interval: Duration::from_secs(env_u64(
                "DESKRELAY_SWEEP_INTERVAL_SECS",
                d.sweep_interval.as_secs(),
            )),
            lookback: Duration::from_secs(env_u64(
                "DESKRELAY_LOOKBACK_SECS",
                d.lookback.as_secs(),
            )),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
