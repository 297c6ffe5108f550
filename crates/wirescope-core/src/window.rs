//! Time-windowed metric buckets shared by stream handlers

use crate::configurable::ModuleConfig;
use crate::error::{CoreError, CoreResult};
use crate::prometheus::PrometheusText;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_NUM_PERIODS: usize = 5;
pub const DEFAULT_PERIOD_SECS: u64 = 60;
pub const DEFAULT_DEEP_SAMPLE_RATE: u64 = 100;
pub const MAX_NUM_PERIODS: usize = 60;

/// Window shape read from a handler's merged configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    pub num_periods: usize,
    pub period: Duration,
    /// Percentage of events that get deep (per-name) analysis
    pub deep_sample_rate: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            num_periods: DEFAULT_NUM_PERIODS,
            period: Duration::from_secs(DEFAULT_PERIOD_SECS),
            deep_sample_rate: DEFAULT_DEEP_SAMPLE_RATE,
        }
    }
}

impl WindowConfig {
    pub fn from_config(config: &ModuleConfig) -> CoreResult<Self> {
        let num_periods = config
            .try_get::<u64>("num_periods")?
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_NUM_PERIODS);
        if num_periods == 0 || num_periods > MAX_NUM_PERIODS {
            return Err(CoreError::InvalidConfig(format!(
                "num_periods must be between 1 and {}",
                MAX_NUM_PERIODS
            )));
        }

        let period_secs = config
            .try_get::<u64>("period_secs")?
            .unwrap_or(DEFAULT_PERIOD_SECS);
        if period_secs == 0 {
            return Err(CoreError::InvalidConfig(
                "period_secs must be greater than 0".to_string(),
            ));
        }

        let mut deep_sample_rate = config
            .try_get::<u64>("deep_sample_rate")?
            .unwrap_or(DEFAULT_DEEP_SAMPLE_RATE);
        if deep_sample_rate > 100 {
            warn!(deep_sample_rate, "deep_sample_rate above 100, clamping");
            deep_sample_rate = 100;
        }

        Ok(Self {
            num_periods,
            period: Duration::from_secs(period_secs),
            deep_sample_rate,
        })
    }
}

/// Per-period metrics kept by a handler
pub trait MetricsBucket: Default + Send + Sync {
    /// Fold another period's metrics into this one
    fn merge(&mut self, other: &Self);

    fn to_json(&self) -> Value;

    /// Write this period's metrics, each sample carrying `labels`
    fn to_prometheus(&self, out: &mut PrometheusText, labels: &[(&str, &str)]);
}

struct Period<B> {
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    bucket: B,
}

impl<B: MetricsBucket> Period<B> {
    fn open() -> Self {
        Self {
            start: Utc::now(),
            end: None,
            bucket: B::default(),
        }
    }

    fn period_json(&self) -> Value {
        let end = self.end.unwrap_or_else(Utc::now);
        json!({
            "start_ts": self.start.timestamp(),
            "length": (end - self.start).num_seconds(),
        })
    }
}

/// Ring of metric buckets; the front bucket is live
pub struct WindowedMetrics<B> {
    config: WindowConfig,
    periods: VecDeque<Period<B>>,
    sample_counter: u64,
}

impl<B: MetricsBucket> WindowedMetrics<B> {
    pub fn new(config: WindowConfig) -> Self {
        let mut periods = VecDeque::with_capacity(config.num_periods);
        periods.push_front(Period::open());
        Self {
            config,
            periods,
            sample_counter: 0,
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn live(&mut self) -> &mut B {
        if self.periods.is_empty() {
            self.periods.push_front(Period::open());
        }
        &mut self.periods[0].bucket
    }

    /// Close the live period and open a new one, dropping the oldest
    pub fn rotate(&mut self) {
        if let Some(live) = self.periods.front_mut() {
            live.end = Some(Utc::now());
        }
        self.periods.push_front(Period::open());
        self.periods.truncate(self.config.num_periods);
    }

    /// Whether the next event should get deep analysis
    pub fn should_deep_sample(&mut self) -> bool {
        self.sample_counter = self.sample_counter.wrapping_add(1);
        self.sample_counter % 100 < self.config.deep_sample_rate
    }

    pub fn len(&self) -> usize {
        self.periods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    /// The `n`-th most recent period, 0 being live
    pub fn bucket_json(&self, n: usize) -> CoreResult<Value> {
        let period = self.periods.get(n).ok_or_else(|| {
            CoreError::NotFound(format!(
                "bucket {} does not exist ({} available)",
                n,
                self.periods.len()
            ))
        })?;
        Ok(json!({
            "period": period.period_json(),
            "metrics": period.bucket.to_json(),
        }))
    }

    /// The most recent closed period, or the live one before the first
    /// rotation
    pub fn prometheus(&self, out: &mut PrometheusText, labels: &[(&str, &str)]) {
        if let Some(period) = self.periods.get(1).or_else(|| self.periods.front()) {
            period.bucket.to_prometheus(out, labels);
        }
    }

    /// All retained periods merged into one
    pub fn merged_json(&self) -> Value {
        let mut merged = B::default();
        for period in &self.periods {
            merged.merge(&period.bucket);
        }
        let oldest = self.periods.back().map(|p| p.start.timestamp());
        json!({
            "periods": self.periods.len(),
            "num_periods": self.config.num_periods,
            "period_secs": self.config.period.as_secs(),
            "deep_sample_rate": self.config.deep_sample_rate,
            "start_ts": oldest,
            "metrics": merged.to_json(),
        })
    }
}
