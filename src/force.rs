//! The force stream adapter. Sensors write into a single [`ForceCell`]; the
//! audio path and the dashboard read the newest sample out of it.
//!
//! The cell holds one packed sample in an `AtomicU64` (load bits in the high
//! half, device timestamp in the low half) and the arrival time of that
//! sample in a second `AtomicU64`. Neither side ever waits on the other,
//! and a reader always sees a whole sample. The arrival time may briefly lag
//! the sample it describes, which can only make a fresh sample look one write
//! older than it is.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// One load-cell reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceSample {
    /// Device clock at measurement, microsecond resolution
    pub timestamp: Duration,
    /// Measured load
    pub load_newtons: f32,
}

impl ForceSample {
    /// A reading taken at `micros` on the device clock.
    pub fn new(micros: u32, load_newtons: f32) -> Self {
        Self {
            timestamp: Duration::from_micros(micros as u64),
            load_newtons,
        }
    }

    fn pack(self) -> u64 {
        // The device clock is a 32-bit microsecond counter and wraps the same way
        let micros = self.timestamp.as_micros() as u32;
        ((self.load_newtons.to_bits() as u64) << 32) | micros as u64
    }

    fn unpack(bits: u64) -> Self {
        Self::new(bits as u32, f32::from_bits((bits >> 32) as u32))
    }
}

/// Last-writer-wins slot for the newest [`ForceSample`].
#[derive(Debug)]
pub struct ForceCell {
    sample: AtomicU64,
    // Nanoseconds since `epoch` plus one; zero until the first write
    arrived: AtomicU64,
    epoch: Instant,
}

impl Default for ForceCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ForceCell {
    /// An empty cell.
    pub fn new() -> Self {
        Self {
            sample: AtomicU64::new(0),
            arrived: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Records a sample that arrived just now.
    pub fn ingest(&self, sample: ForceSample) {
        self.ingest_at(sample, Instant::now());
    }

    /// Records a sample that arrived at `at`.
    pub fn ingest_at(&self, sample: ForceSample, at: Instant) {
        self.sample.store(sample.pack(), Ordering::Release);
        let stamp = at.saturating_duration_since(self.epoch).as_nanos() as u64;
        self.arrived.store(stamp.saturating_add(1), Ordering::Release);
    }

    /// The newest sample, or `None` if nothing has arrived yet.
    pub fn latest(&self) -> Option<ForceSample> {
        if self.arrived.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(ForceSample::unpack(self.sample.load(Ordering::Acquire)))
    }

    /// Time since the newest sample arrived, `None` if nothing has arrived.
    pub fn age_since_last(&self) -> Option<Duration> {
        self.age_at(Instant::now())
    }

    /// Age of the newest sample as seen from `now`.
    pub fn age_at(&self, now: Instant) -> Option<Duration> {
        match self.arrived.load(Ordering::Acquire) {
            0 => None,
            stamp => {
                let arrived = self.epoch + Duration::from_nanos(stamp - 1);
                Some(now.saturating_duration_since(arrived))
            }
        }
    }

    /// True when no sample has arrived within `threshold` of `now`, including
    /// when no sample has ever arrived.
    pub fn is_stale_at(&self, now: Instant, threshold: Duration) -> bool {
        self.age_at(now).map_or(true, |age| age > threshold)
    }
}

/// A source of force readings that publishes into a [`ForceCell`].
///
/// Implementations own whatever thread or callback delivers samples and must
/// stop writing once [`ForceSensor::detach`] returns.
pub trait ForceSensor {
    /// Starts delivering samples into `cell`.
    fn attach(&mut self, cell: Arc<ForceCell>);

    /// Stops delivering samples.
    fn detach(&mut self);

    /// Short human-readable name for logs and the dashboard.
    fn name(&self) -> &str;
}
