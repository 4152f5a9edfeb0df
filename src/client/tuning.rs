//! Throughput adaptation for the transfer scheduler.
//!
//! Additive increase, multiplicative decrease over chunk size and parallelism.
//! [`adapt`] is a pure function of the current setting, the triggering event
//! and the recent sample window; [`AdaptiveTuner`] only stores that state and
//! decides when failures have repeated often enough to count.

use std::time::Duration;

/// One completed chunk transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpeedSample {
    pub bytes: u64,
    pub elapsed_ms: u64,
}

impl SpeedSample {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        Self {
            bytes,
            elapsed_ms: elapsed.as_millis().max(1) as u64,
        }
    }
}

/// Fixed-capacity ring buffer of recent samples.
#[derive(Clone, Debug)]
pub struct SampleWindow {
    samples: Vec<SpeedSample>,
    capacity: usize,
    next: usize,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    pub fn push(&mut self, sample: SpeedSample) {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.next = 0;
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    /// Aggregate throughput in bytes per second, 0 when empty.
    pub fn throughput(&self) -> u64 {
        let (bytes, ms) = self
            .samples
            .iter()
            .fold((0u64, 0u64), |(b, t), s| (b + s.bytes, t + s.elapsed_ms));
        if ms == 0 {
            return 0;
        }
        bytes.saturating_mul(1000) / ms
    }
}

/// Bounds and steps for the controller.
#[derive(Clone, Debug)]
pub struct TuningConfig {
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub chunk_size_step: u64,
    pub min_parallelism: usize,
    pub max_parallelism: usize,
    pub parallelism_step: usize,
    /// Multiplier applied on a decrease, in (0, 1).
    pub decrease_factor: f64,
    /// Failures absorbed before a decrease. The count restarts on every
    /// success and after every decrease.
    pub failure_tolerance: u32,
    /// Samples that must be collected, error-free, before increasing.
    pub window: usize,
    /// Throughput (bytes/s) the window must reach to increase.
    pub high_throughput: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: 1024 * 1024,
            max_chunk_size: 32 * 1024 * 1024,
            chunk_size_step: 1024 * 1024,
            min_parallelism: 1,
            max_parallelism: 8,
            parallelism_step: 1,
            decrease_factor: 0.5,
            failure_tolerance: 1,
            window: 8,
            high_throughput: 4 * 1024 * 1024,
        }
    }
}

/// Current adaptive setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tuning {
    pub chunk_size: u64,
    pub parallelism: usize,
}

impl Tuning {
    pub fn clamped(self, cfg: &TuningConfig) -> Self {
        Self {
            chunk_size: self
                .chunk_size
                .clamp(cfg.min_chunk_size, cfg.max_chunk_size),
            parallelism: self
                .parallelism
                .clamp(cfg.min_parallelism, cfg.max_parallelism),
        }
    }
}

/// What just happened to a chunk send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferEvent {
    Success,
    /// Repeated timeouts or non-success responses.
    Failure,
}

/// Next setting given `event` and the samples collected since the last change.
///
/// Increase only once the window is full of error-free samples and its
/// throughput reaches `high_throughput`. A failure cuts both dimensions
/// by `decrease_factor`. The result always lies within the configured bounds.
pub fn adapt(
    current: Tuning,
    event: TransferEvent,
    window: &SampleWindow,
    cfg: &TuningConfig,
) -> Tuning {
    let next = match event {
        TransferEvent::Failure => Tuning {
            chunk_size: (current.chunk_size as f64 * cfg.decrease_factor) as u64,
            parallelism: (current.parallelism as f64 * cfg.decrease_factor) as usize,
        },
        TransferEvent::Success
            if window.is_full() && window.throughput() >= cfg.high_throughput =>
        {
            Tuning {
                chunk_size: current.chunk_size.saturating_add(cfg.chunk_size_step),
                parallelism: current.parallelism.saturating_add(cfg.parallelism_step),
            }
        }
        TransferEvent::Success => current,
    };
    next.clamped(cfg)
}

/// Holds the controller state between events.
#[derive(Clone, Debug)]
pub struct AdaptiveTuner {
    cfg: TuningConfig,
    current: Tuning,
    window: SampleWindow,
    strikes: u32,
}

impl AdaptiveTuner {
    pub fn new(cfg: TuningConfig, initial: Tuning) -> Self {
        let current = initial.clamped(&cfg);
        let window = SampleWindow::new(cfg.window);
        Self {
            cfg,
            current,
            window,
            strikes: 0,
        }
    }

    pub fn current(&self) -> Tuning {
        self.current
    }

    pub fn throughput(&self) -> u64 {
        self.window.throughput()
    }

    pub fn on_success(&mut self, sample: SpeedSample) -> Tuning {
        self.strikes = 0;
        self.window.push(sample);
        self.apply(TransferEvent::Success)
    }

    /// A single failure between successes only restarts the window.
    pub fn on_failure(&mut self) -> Tuning {
        self.strikes += 1;
        if self.strikes <= self.cfg.failure_tolerance {
            self.window.clear();
            return self.current;
        }
        self.strikes = 0;
        self.apply(TransferEvent::Failure)
    }

    fn apply(&mut self, event: TransferEvent) -> Tuning {
        let next = adapt(self.current, event, &self.window, &self.cfg);
        // Either a change or a failure starts a fresh observation window.
        if next != self.current || event == TransferEvent::Failure {
            self.window.clear();
            if next != self.current {
                tracing::debug!(
                    chunk_size = next.chunk_size,
                    parallelism = next.parallelism,
                    ?event,
                    "transfer tuning adjusted"
                );
            }
        }
        self.current = next;
        next
    }
}
