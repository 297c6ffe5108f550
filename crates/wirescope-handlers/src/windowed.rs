//! Shared runtime for handlers that keep windowed metrics
//!
//! A handler is a [`PacketProcessor`] wrapped in a [`WindowedHandler`]. The
//! wrapper owns the event subscription, the period rotation timer and the
//! output bus; the processor only decides what to count and what to pass on.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};
use wirescope_core::{
    event_bus, BackgroundTask, CoreResult, EventSender, MetricsBucket, Module, ModuleConfig,
    PacketEvent, PrometheusText, StreamHandler, WindowConfig, WindowedMetrics,
};

/// Per-type packet logic of a windowed handler
pub trait PacketProcessor: Send + Sync + 'static {
    type Bucket: MetricsBucket + 'static;

    /// Count `event` into the live bucket. Returns whether the event is
    /// passed on to chained handlers.
    fn process(&self, event: &PacketEvent, window: &mut WindowedMetrics<Self::Bucket>) -> bool;
}

pub struct WindowedHandler<P: PacketProcessor> {
    name: String,
    handler_type: &'static str,
    config: ModuleConfig,
    processor: Arc<P>,
    source: EventSender,
    output: EventSender,
    upstream: Option<String>,
    window: Arc<Mutex<WindowedMetrics<P::Bucket>>>,
    task: Option<BackgroundTask>,
}

impl<P: PacketProcessor> WindowedHandler<P> {
    /// `source` is the bus to consume: the input stream's, or the upstream
    /// handler's output when chained.
    pub fn new(
        name: &str,
        handler_type: &'static str,
        config: &ModuleConfig,
        processor: P,
        source: EventSender,
        upstream: Option<String>,
    ) -> CoreResult<Self> {
        let window = WindowConfig::from_config(config)?;
        Ok(Self {
            name: name.to_string(),
            handler_type,
            config: config.clone(),
            processor: Arc::new(processor),
            source,
            output: event_bus(),
            upstream,
            window: Arc::new(Mutex::new(WindowedMetrics::new(window))),
            task: None,
        })
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }
}

#[async_trait]
impl<P: PacketProcessor> Module for WindowedHandler<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema_key(&self) -> &str {
        self.handler_type
    }

    fn running(&self) -> bool {
        self.task.is_some()
    }

    fn config(&self) -> &ModuleConfig {
        &self.config
    }

    async fn start(&mut self) -> CoreResult<()> {
        if self.task.is_some() {
            return Ok(());
        }

        let mut events = self.source.subscribe();
        let output = self.output.clone();
        let processor = self.processor.clone();
        let window = self.window.clone();
        let period = window.lock().config().period;
        let name = self.name.clone();

        self.task = Some(BackgroundTask::spawn(move |mut shutdown| async move {
            let mut rotation = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = rotation.tick() => window.lock().rotate(),
                    received = events.recv() => match received {
                        Ok(event) => {
                            let forward = processor.process(&event, &mut window.lock());
                            if forward {
                                let _ = output.send(event);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(handler = %name, skipped, "Stream handler lagged behind its source");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!(handler = %name, "Stream handler loop exited");
        }));

        info!(handler = %self.name, handler_type = %self.handler_type, "Stream handler started");
        Ok(())
    }

    async fn stop(&mut self) -> CoreResult<()> {
        if let Some(task) = self.task.take() {
            task.shutdown().await;
            info!(handler = %self.name, "Stream handler stopped");
        }
        Ok(())
    }

    fn info_json(&self) -> Value {
        json!({
            "name": self.name,
            "type": self.handler_type,
            "running": self.running(),
            "upstream": self.upstream,
            "config": self.config.to_json(),
            "window": self.window.lock().merged_json(),
        })
    }
}

impl<P: PacketProcessor> StreamHandler for WindowedHandler<P> {
    fn output(&self) -> EventSender {
        self.output.clone()
    }

    fn upstream(&self) -> Option<&str> {
        self.upstream.as_deref()
    }

    fn window_json(&self, bucket: usize) -> CoreResult<Value> {
        self.window.lock().bucket_json(bucket)
    }

    fn prometheus(&self, out: &mut PrometheusText, labels: &[(&str, &str)]) {
        let labels: Vec<(&str, &str)> = labels
            .iter()
            .copied()
            .chain([("handler", self.name.as_str())])
            .collect();
        self.window.lock().prometheus(out, &labels);
    }
}

/// Number of entries reported in top-N lists
pub const TOP_N: usize = 10;

/// Highest counts first, ties broken by name
pub fn top_n(counts: &HashMap<String, u64>, n: usize) -> Vec<Value> {
    let mut entries: Vec<(&String, &u64)> = counts.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    entries
        .into_iter()
        .take(n)
        .map(|(name, estimate)| json!({"name": name, "estimate": estimate}))
        .collect()
}

/// Add every count in `from` into `into`
pub fn merge_counts(into: &mut HashMap<String, u64>, from: &HashMap<String, u64>) {
    for (key, count) in from {
        *into.entry(key.clone()).or_default() += count;
    }
}
