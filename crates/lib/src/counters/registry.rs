use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::util::ScopedRwLock;

use super::types::{Counter, CounterInfo, CounterSnapshot, CounterValue, IntegerCounter, SamplingCounter};

/// Every counter of one build. Build-scoped, never global.
#[derive(Default)]
pub struct CounterRegistry {
  counters: ScopedRwLock<Vec<Arc<dyn Counter>>>,
}

impl CounterRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, counter: Arc<dyn Counter>) {
    self.counters.with_write(|c| c.push(counter));
  }

  pub fn integer(&self, info: CounterInfo) -> Arc<IntegerCounter> {
    let counter = Arc::new(IntegerCounter::new(info));
    self.register(counter.clone());
    counter
  }

  pub fn sampling(&self, info: CounterInfo) -> Arc<SamplingCounter> {
    let counter = Arc::new(SamplingCounter::new(info));
    self.register(counter.clone());
    counter
  }

  pub fn len(&self) -> usize {
    self.counters.with_read(Vec::len)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Flush every counter, keeping only those that had data.
  pub fn flush_all(&self) -> Vec<CounterSnapshot> {
    let counters = self.counters.with_read(Vec::clone);
    counters.iter().filter_map(|c| c.flush()).collect()
  }
}

/// Receives flushed snapshots.
pub trait CounterSink: Send + Sync {
  fn publish(&self, snapshots: &[CounterSnapshot]);
}

/// Reports snapshots as `info!` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCounterSink;

impl CounterSink for TracingCounterSink {
  fn publish(&self, snapshots: &[CounterSnapshot]) {
    for snapshot in snapshots {
      let tags = snapshot
        .info
        .tags
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
      match &snapshot.value {
        CounterValue::Integer { value } => info!(
          category = %snapshot.info.category,
          name = %snapshot.info.name,
          tags = %tags,
          value,
          "counter"
        ),
        CounterValue::Samples { count, sum, min, max } => info!(
          category = %snapshot.info.category,
          name = %snapshot.info.name,
          tags = %tags,
          count,
          sum,
          min,
          max,
          "counter"
        ),
      }
    }
  }
}

/// Shortest flush interval. Shorter requests, zero included, are raised to it.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Background task flushing a registry on an interval.
pub struct PeriodicFlush {
  stop: Option<oneshot::Sender<()>>,
  task: JoinHandle<()>,
}

impl PeriodicFlush {
  /// Stop the task after one last flush, so nothing recorded is dropped.
  pub async fn stop(mut self) {
    if let Some(stop) = self.stop.take() {
      let _ = stop.send(());
    }
    if let Err(err) = (&mut self.task).await {
      warn!(error = %err, "counter flusher failed, final counters may be lost");
    }
  }
}

pub fn spawn_periodic_flush(
  registry: Arc<CounterRegistry>,
  sink: Arc<dyn CounterSink>,
  interval: Duration,
) -> PeriodicFlush {
  let (stop_tx, mut stop_rx) = oneshot::channel();
  let task = tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval.max(MIN_FLUSH_INTERVAL));
    ticker.tick().await;
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          let snapshots = registry.flush_all();
          if !snapshots.is_empty() {
            sink.publish(&snapshots);
          }
        }
        _ = &mut stop_rx => break,
      }
    }
    let snapshots = registry.flush_all();
    if !snapshots.is_empty() {
      sink.publish(&snapshots);
    }
  });

  PeriodicFlush {
    stop: Some(stop_tx),
    task,
  }
}
