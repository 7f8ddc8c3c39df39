//! Staged concurrency profiles for barrage.
//!
//! A load profile is an ordered list of [`Stage`] values, each naming a
//! target number of concurrent virtual users and how long the stage lasts.
//! [`Profile`] answers the only question the rest of barrage asks of it:
//! given some offset from run start, how many virtual users should be active,
//! or is the run over? [`Schedule`] wraps a `Profile` with a [`Clock`] and
//! yields that answer on a fixed resolution.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{self, Duration, Instant};

/// Errors produced by [`Profile`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A profile must contain at least one stage.
    #[error("load profile has no stages")]
    Empty,
    /// The sum of stage durations overflowed.
    #[error("load profile duration overflows")]
    Overflow,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// A time-bounded segment of the load profile.
pub struct Stage {
    /// The number of concurrent virtual users this stage drives toward
    pub target: u32,
    /// How long the stage lasts, for example `"3s"` or `"1m30s"`
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

/// How concurrency moves between stage targets.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
pub enum Ramp {
    /// Move linearly from the prior stage's target to this stage's target
    /// across the stage. The first stage ramps up from zero.
    #[default]
    Linear,
    /// Hold this stage's target for the whole stage.
    Step,
}

/// An immutable load profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    stages: Vec<Stage>,
    ramp: Ramp,
    total: Duration,
    maximum: u32,
}

impl Profile {
    /// Create a new [`Profile`].
    ///
    /// # Errors
    ///
    /// Returns an error if `stages` is empty or the stage durations overflow
    /// when summed.
    pub fn new(stages: Vec<Stage>, ramp: Ramp) -> Result<Self, Error> {
        if stages.is_empty() {
            return Err(Error::Empty);
        }
        let total = stages
            .iter()
            .try_fold(Duration::ZERO, |acc, stage| acc.checked_add(stage.duration))
            .ok_or(Error::Overflow)?;
        let maximum = stages.iter().map(|stage| stage.target).max().unwrap_or(0);

        Ok(Self {
            stages,
            ramp,
            total,
            maximum,
        })
    }

    /// The configured stages, in order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The ramp policy in effect.
    #[must_use]
    pub fn ramp(&self) -> Ramp {
        self.ramp
    }

    /// Total run length, the sum of every stage's duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.total
    }

    /// The largest target across all stages. No offset ever yields more.
    #[must_use]
    pub fn maximum_target(&self) -> u32 {
        self.maximum
    }

    /// The target concurrency at `elapsed` from run start, or `None` once the
    /// profile is complete.
    ///
    /// Each stage covers the half-open window `[start, end)`. Under
    /// [`Ramp::Linear`] the value at a stage's end boundary is exactly that
    /// stage's target, which is also where the next stage begins.
    #[must_use]
    pub fn target_at(&self, elapsed: Duration) -> Option<u32> {
        let mut start = Duration::ZERO;
        let mut previous = 0;
        for stage in &self.stages {
            let end = start + stage.duration;
            if elapsed < end {
                let target = match self.ramp {
                    Ramp::Step => stage.target,
                    Ramp::Linear => {
                        interpolate(previous, stage.target, elapsed - start, stage.duration)
                    }
                };
                return Some(target);
            }
            previous = stage.target;
            start = end;
        }
        None
    }
}

/// Linear interpolation in integer nanoseconds. The result always lies
/// between `from` and `to` inclusive and equals `to` once `into >= span`.
#[allow(clippy::cast_possible_truncation)]
fn interpolate(from: u32, to: u32, into: Duration, span: Duration) -> u32 {
    if span.is_zero() {
        return to;
    }
    let span = span.as_nanos();
    let into = into.as_nanos().min(span);
    if to >= from {
        // delta <= to - from, fits in u32
        let delta = u128::from(to - from) * into / span;
        from + delta as u32
    } else {
        let delta = u128::from(from - to) * into / span;
        from - delta as u32
    }
}

#[async_trait]
/// The `Clock` a [`Schedule`] reads time from
pub trait Clock {
    /// Time elapsed since the clock was created
    fn elapsed(&self) -> Duration;
    /// Wait for `duration`
    async fn wait(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy)]
/// A clock that operates with respect to tokio's notion of real time.
pub struct RealClock {
    start: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for RealClock {
    fn elapsed(&self) -> Duration {
        Instant::now().duration_since(self.start)
    }

    async fn wait(&self, duration: Duration) {
        time::sleep(duration).await;
    }
}

/// A [`Profile`] driven by a [`Clock`].
#[derive(Debug)]
pub struct Schedule<C = RealClock> {
    profile: Profile,
    clock: C,
    resolution: Duration,
    started: bool,
}

impl Schedule<RealClock> {
    /// Create a new [`Schedule`] starting now.
    #[must_use]
    pub fn new(profile: Profile, resolution: Duration) -> Self {
        Self::with_clock(profile, resolution, RealClock::default())
    }
}

impl<C> Schedule<C>
where
    C: Clock + Send + Sync,
{
    /// Create a new [`Schedule`] with an explicit clock.
    #[must_use]
    pub fn with_clock(profile: Profile, resolution: Duration, clock: C) -> Self {
        Self {
            profile,
            clock,
            resolution,
            started: false,
        }
    }

    /// The underlying profile.
    #[must_use]
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Time since the schedule's clock started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    /// Wait out one resolution period, then report the current target. The
    /// first call returns immediately. Returns `None` once the profile is
    /// complete.
    ///
    /// A wait never runs past the end of the profile, so completion is
    /// reported promptly even with a coarse resolution.
    pub async fn next(&mut self) -> Option<u32> {
        if self.started {
            let remaining = self
                .profile
                .duration()
                .saturating_sub(self.clock.elapsed());
            self.clock.wait(self.resolution.min(remaining)).await;
        }
        self.started = true;
        self.profile.target_at(self.clock.elapsed())
    }
}
