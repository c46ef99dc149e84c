//! Rolling window of memory samples.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One accounting checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub usage_bytes: u64,
    /// Signed change from the previous sample; 0 for the first one.
    pub delta_since_last: i64,
}

/// Fixed-capacity window; pushing onto a full window drops the oldest sample.
#[derive(Debug)]
pub(crate) struct SampleWindow {
    samples: VecDeque<MemorySample>,
    capacity: usize,
}

impl SampleWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self { samples: VecDeque::with_capacity(capacity), capacity }
    }

    /// Append a sample. Timestamps never go backwards, even if the wall clock does.
    pub(crate) fn push(&mut self, now: DateTime<Utc>, usage_bytes: u64) -> MemorySample {
        let (timestamp, delta_since_last) = match self.samples.back() {
            Some(last) => (now.max(last.timestamp), signed_delta(last.usage_bytes, usage_bytes)),
            None => (now, 0),
        };

        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }

        let sample = MemorySample { timestamp, usage_bytes, delta_since_last };
        self.samples.push_back(sample);
        sample
    }

    pub(crate) fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    pub(crate) fn latest(&self) -> Option<&MemorySample> {
        self.samples.back()
    }

    /// True when the window is full and no sample is lower than its predecessor.
    pub(crate) fn is_non_decreasing(&self) -> bool {
        self.is_full() && self.samples.iter().zip(self.samples.iter().skip(1)).all(|(a, b)| b.usage_bytes >= a.usage_bytes)
    }

    /// Average growth across the window in bytes per second.
    pub(crate) fn trend_bytes_per_sec(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };

        let elapsed = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return 0.0;
        }

        (last.usage_bytes as f64 - first.usage_bytes as f64) / elapsed
    }
}

fn signed_delta(previous: u64, current: u64) -> i64 {
    if current >= previous {
        i64::try_from(current - previous).unwrap_or(i64::MAX)
    } else {
        i64::try_from(previous - current).map(|d| -d).unwrap_or(i64::MIN)
    }
}
