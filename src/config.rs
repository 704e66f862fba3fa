//! Runtime configuration
//!
//! Tunables for the scheduler's cooperation budget, the frame-depth cap and
//! the queue/serial thresholds. Defaults match the embedded host contract;
//! every knob can be overridden through the builder or a `FIBRA_*`
//! environment variable.

use anyhow::{Context, Result};

/// Runtime tunables
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Minimum time between cooperative yields (ms)
    pub yield_period_ms: u64,

    /// Delay before a yielded fiber is rescheduled (ms)
    pub yield_delay_ms: u64,

    /// Maximum frame depth; calling into depth `max_stack_depth + 1` faults
    pub max_stack_depth: u32,

    /// Default per-source event queue capacity
    pub event_queue_capacity: usize,

    /// Serial buffer is flushed once it exceeds this many characters
    pub serial_flush_len: usize,

    /// Default pause per traced position (ms), until traceConfig overrides it
    pub trace_pause_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            yield_period_ms: 20,
            yield_delay_ms: 5,
            max_stack_depth: 1000,
            event_queue_capacity: 5,
            serial_flush_len: 16,
            trace_pause_ms: 0,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Load configuration, applying any `FIBRA_*` environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Config::default();
        if let Some(v) = read_env("FIBRA_YIELD_PERIOD_MS")? {
            config.yield_period_ms = v;
        }
        if let Some(v) = read_env("FIBRA_YIELD_DELAY_MS")? {
            config.yield_delay_ms = v;
        }
        if let Some(v) = read_env("FIBRA_MAX_STACK_DEPTH")? {
            config.max_stack_depth = v as u32;
        }
        if let Some(v) = read_env("FIBRA_EVENT_QUEUE_CAPACITY")? {
            config.event_queue_capacity = v as usize;
        }
        if let Some(v) = read_env("FIBRA_SERIAL_FLUSH_LEN")? {
            config.serial_flush_len = v as usize;
        }
        Ok(config)
    }
}

fn read_env(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => {
            let v = raw
                .parse::<u64>()
                .with_context(|| format!("invalid value for {name}: {raw:?}"))?;
            Ok(Some(v))
        }
        Err(_) => Ok(None),
    }
}

/// Builder for constructing a Config
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn yield_period_ms(mut self, ms: u64) -> Self {
        self.config.yield_period_ms = ms;
        self
    }

    pub fn yield_delay_ms(mut self, ms: u64) -> Self {
        self.config.yield_delay_ms = ms;
        self
    }

    pub fn max_stack_depth(mut self, depth: u32) -> Self {
        self.config.max_stack_depth = depth;
        self
    }

    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.event_queue_capacity = capacity;
        self
    }

    pub fn serial_flush_len(mut self, len: usize) -> Self {
        self.config.serial_flush_len = len;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
