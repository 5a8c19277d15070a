//! Job diagnostics: timing, counts and errors of one scheduler run.
//!
//! Every [`Scheduler::run`](crate::scheduler::Scheduler::run) returns a
//! [`JobSummary`] alongside the rows written to the result sink. Command
//! and tile timings are taken through a [`Clock`] so tests can inject a
//! deterministic time source.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ErrorReport;
use crate::results::JobStatus;

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    origin: Instant,
}

impl StdClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that advances by a fixed step on every reading.
#[derive(Debug)]
pub struct SteppingClock {
    ticks: AtomicU64,
    step: Duration,
}

impl SteppingClock {
    #[must_use]
    pub const fn new(step: Duration) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> Duration {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        self.step
            .saturating_mul(u32::try_from(tick).unwrap_or(u32::MAX))
    }
}

/// Accumulated run time of one command family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTiming {
    pub calls: u64,
    /// Sum over all calls (seconds).
    #[serde(with = "duration_serde")]
    pub total: Duration,
}

impl CommandTiming {
    /// Mean duration per call, zero when never called.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> Duration {
        match u32::try_from(self.calls) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total / n,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.calls as f64),
        }
    }
}

/// Per-command timings keyed by command name (`$blur`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timings(BTreeMap<String, CommandTiming>);

impl Timings {
    pub fn record(&mut self, command: &str, elapsed: Duration) {
        let entry = self.0.entry(command.to_owned()).or_default();
        entry.calls += 1;
        entry.total += elapsed;
    }

    pub fn merge(&mut self, other: Self) {
        for (command, timing) in other.0 {
            let entry = self.0.entry(command).or_default();
            entry.calls += timing.calls;
            entry.total += timing.total;
        }
    }

    #[must_use]
    pub fn get(&self, command: &str) -> Option<&CommandTiming> {
        self.0.get(command)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CommandTiming)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    /// Images found across all plates.
    pub images: u64,
    /// Images written to the result sink.
    pub images_written: u64,
    /// Images skipped because they could not be read.
    pub failed_images: u64,
    /// Work units (tile × t-stack) processed.
    pub tiles: u64,
    /// Work units aborted by a fatal command.
    pub failed_tiles: u64,
    /// Object rows written.
    pub objects: u64,
    /// Command failures that were logged and skipped.
    pub command_errors: u64,
    pub commands: Timings,
    /// Wall-clock duration of the job (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Image-level errors, in the order they were seen.
    pub errors: Vec<ErrorReport>,
}

impl JobSummary {
    /// Mean duration of `command`, `None` when it never ran.
    #[must_use]
    pub fn mean_duration(&self, command: &str) -> Option<Duration> {
        self.commands.get(command).map(CommandTiming::mean)
    }
}

impl std::fmt::Display for JobSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "job {} {}", self.job_id, self.status.as_str())?;
        writeln!(
            f,
            "  images: {} written, {} failed, {} found",
            self.images_written, self.failed_images, self.images
        )?;
        writeln!(f, "  tiles: {} ({} failed)", self.tiles, self.failed_tiles)?;
        writeln!(f, "  objects: {}", self.objects)?;
        writeln!(f, "  command errors: {}", self.command_errors)?;
        for (command, timing) in self.commands.iter() {
            writeln!(
                f,
                "  {command}: {} calls, mean {:.3} ms",
                timing.calls,
                timing.mean().as_secs_f64() * 1000.0
            )?;
        }
        write!(f, "  total: {:.3} s", self.total_duration.as_secs_f64())
    }
}
