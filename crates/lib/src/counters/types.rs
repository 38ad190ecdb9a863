use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

use crate::util::ScopedRwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterInfo {
  pub category: String,
  pub name: String,
  pub tags: BTreeMap<String, String>,
}

impl CounterInfo {
  pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      category: category.into(),
      name: name.into(),
      tags: BTreeMap::new(),
    }
  }

  pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.tags.insert(key.into(), value.into());
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CounterValue {
  Integer { value: i64 },
  Samples { count: u64, sum: i64, min: i64, max: i64 },
}

/// Values accumulated by one counter between two flushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
  pub info: CounterInfo,
  pub value: CounterValue,
}

pub trait Counter: Send + Sync {
  fn info(&self) -> &CounterInfo;

  /// Capture the accumulated value and reset it in one step. `None` when
  /// nothing was recorded since the last flush.
  fn flush(&self) -> Option<CounterSnapshot>;
}

/// Lock-free running total.
#[derive(Debug)]
pub struct IntegerCounter {
  info: CounterInfo,
  value: AtomicI64,
}

impl IntegerCounter {
  pub fn new(info: CounterInfo) -> Self {
    Self {
      info,
      value: AtomicI64::new(0),
    }
  }

  pub fn inc(&self) {
    self.add(1);
  }

  pub fn add(&self, delta: i64) {
    self.value.fetch_add(delta, Ordering::Relaxed);
  }

  pub fn get(&self) -> i64 {
    self.value.load(Ordering::Relaxed)
  }
}

impl Counter for IntegerCounter {
  fn info(&self) -> &CounterInfo {
    &self.info
  }

  fn flush(&self) -> Option<CounterSnapshot> {
    match self.value.swap(0, Ordering::AcqRel) {
      0 => None,
      value => Some(CounterSnapshot {
        info: self.info.clone(),
        value: CounterValue::Integer { value },
      }),
    }
  }
}

#[derive(Debug, Default, Clone, Copy)]
struct Samples {
  count: u64,
  sum: i64,
  min: i64,
  max: i64,
}

/// Count, sum and range of recorded samples.
#[derive(Debug)]
pub struct SamplingCounter {
  info: CounterInfo,
  samples: ScopedRwLock<Samples>,
}

impl SamplingCounter {
  pub fn new(info: CounterInfo) -> Self {
    Self {
      info,
      samples: ScopedRwLock::default(),
    }
  }

  pub fn add_sample(&self, sample: i64) {
    self.samples.with_write(|s| {
      if s.count == 0 {
        s.min = sample;
        s.max = sample;
      } else {
        s.min = s.min.min(sample);
        s.max = s.max.max(sample);
      }
      s.count += 1;
      s.sum = s.sum.saturating_add(sample);
    });
  }
}

impl Counter for SamplingCounter {
  fn info(&self) -> &CounterInfo {
    &self.info
  }

  fn flush(&self) -> Option<CounterSnapshot> {
    let taken = self.samples.with_write(std::mem::take);
    (taken.count > 0).then(|| CounterSnapshot {
      info: self.info.clone(),
      value: CounterValue::Samples {
        count: taken.count,
        sum: taken.sum,
        min: taken.min,
        max: taken.max,
      },
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[test]
  fn integer_flush_captures_and_resets() {
    let counter = IntegerCounter::new(CounterInfo::new("build", "rules_built"));
    assert!(counter.flush().is_none());

    counter.inc();
    counter.add(4);
    let snapshot = counter.flush().unwrap();
    assert_eq!(snapshot.value, CounterValue::Integer { value: 5 });
    assert!(counter.flush().is_none());
  }

  #[test]
  fn concurrent_increments_are_counted_exactly_once() {
    let counter = Arc::new(IntegerCounter::new(CounterInfo::new("build", "events")));
    let flushed = Arc::new(AtomicI64::new(0));

    let writers: Vec<_> = (0..4)
      .map(|_| {
        let counter = counter.clone();
        std::thread::spawn(move || {
          for _ in 0..10_000 {
            counter.inc();
          }
        })
      })
      .collect();
    let flusher = {
      let counter = counter.clone();
      let flushed = flushed.clone();
      std::thread::spawn(move || {
        for _ in 0..100 {
          if let Some(CounterSnapshot {
            value: CounterValue::Integer { value },
            ..
          }) = counter.flush()
          {
            flushed.fetch_add(value, Ordering::SeqCst);
          }
        }
      })
    };

    for w in writers {
      w.join().unwrap();
    }
    flusher.join().unwrap();
    if let Some(CounterSnapshot {
      value: CounterValue::Integer { value },
      ..
    }) = counter.flush()
    {
      flushed.fetch_add(value, Ordering::SeqCst);
    }

    assert_eq!(flushed.load(Ordering::SeqCst), 40_000);
  }

  #[test]
  fn sampling_tracks_range() {
    let counter = SamplingCounter::new(CounterInfo::new("cache", "bytes").with_tag("mode", "remote"));
    counter.add_sample(10);
    counter.add_sample(-3);
    counter.add_sample(7);

    let snapshot = counter.flush().unwrap();
    assert_eq!(
      snapshot.value,
      CounterValue::Samples {
        count: 3,
        sum: 14,
        min: -3,
        max: 10
      }
    );
    assert_eq!(snapshot.info.tags["mode"], "remote");
    assert!(counter.flush().is_none());
  }
}
