//! The stage scheduler.
//!
//! [`Scheduler`] walks a load [`Profile`] and keeps the number of running
//! virtual users at its target. The target is re-evaluated every adjustment
//! interval. New users are spawned up to the target and, when the target
//! falls, the most recently started users are retired first. A retired user
//! finishes its in-flight iteration and is counted against the profile's
//! maximum until it exits, so the number of live users never exceeds that
//! maximum.
//!
//! ## Metrics
//!
//! `target_virtual_users`: The profile's current concurrency target
//! `active_virtual_users`: Users spawned and not yet retired
//!

use std::sync::Arc;

use barrage_signal::{Broadcaster, Watcher};
use barrage_stage::{Profile, Schedule};
use metrics::gauge;
use rand::{
    SeedableRng,
    rngs::{SmallRng, StdRng},
};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::{
    config::{self, Config},
    dispatch::Dispatch,
    vu::{Context, Tally, VirtualUser},
};

/// Errors produced by [`Scheduler`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// See [`config::Error`]
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
}

/// The outcome of a complete run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// Completed iterations
    pub iterations: u64,
    /// Iterations answered with a 2xx status
    pub successes: u64,
    /// Iterations answered with any other status
    pub rejections: u64,
    /// Iterations that received no response
    pub transport_failures: u64,
    /// Iterations that sent the failure request
    pub faults: u64,
    /// Largest number of simultaneously active users
    pub peak_virtual_users: u32,
}

/// Active users in start order, each with the signal that retires it.
#[derive(Debug, Default)]
struct Roster {
    users: Vec<(u32, Broadcaster)>,
}

impl Roster {
    fn len(&self) -> u32 {
        u32::try_from(self.users.len()).unwrap_or(u32::MAX)
    }

    fn push(&mut self, id: u32, retire: Broadcaster) {
        self.users.push((id, retire));
    }

    /// Retire the `count` most recently started users, returning their ids.
    fn retire(&mut self, count: u32) -> Vec<u32> {
        let keep = self.users.len().saturating_sub(count as usize);
        self.users
            .drain(keep..)
            .rev()
            .map(|(id, retire)| {
                retire.signal();
                id
            })
            .collect()
    }

    fn retire_all(&mut self) -> Vec<u32> {
        self.retire(self.len())
    }
}

/// Drives virtual users through a load profile.
#[derive(Debug)]
pub struct Scheduler<D> {
    schedule: Schedule,
    context: Arc<Context<D>>,
    master: StdRng,
    shutdown: Watcher,
}

impl<D> Scheduler<D>
where
    D: Dispatch,
{
    /// Create a new [`Scheduler`] from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` does not describe a runnable profile,
    /// workload or fault injector.
    pub fn new(config: &Config, dispatcher: D, shutdown: Watcher) -> Result<Self, Error> {
        let context = Context {
            workload: config.workload()?,
            fault: config.fault()?,
            pacing: config.pacing,
            dispatcher,
        };
        let schedule = Schedule::new(config.profile()?, config.adjust_interval);
        Ok(Self::with_schedule(schedule, context, config.seed, shutdown))
    }

    /// Create a new [`Scheduler`] from its parts. Without a `seed` the run's
    /// randomness is drawn from the thread's generator.
    #[must_use]
    pub fn with_schedule(
        schedule: Schedule,
        context: Context<D>,
        seed: Option<u64>,
        shutdown: Watcher,
    ) -> Self {
        let master = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self {
            schedule,
            context: Arc::new(context),
            master,
            shutdown,
        }
    }

    /// The profile being run.
    #[must_use]
    pub fn profile(&self) -> &Profile {
        self.schedule.profile()
    }

    /// Run the profile to completion or until shutdown is signaled. Every
    /// virtual user is retired and awaited before this returns.
    pub async fn run(self) -> Summary {
        let Self {
            mut schedule,
            context,
            mut master,
            shutdown,
        } = self;

        let maximum = schedule.profile().maximum_target() as usize;
        let tally = Arc::new(Tally::default());
        let mut roster = Roster::default();
        let mut tasks = JoinSet::new();
        let mut next_id: u32 = 0;
        let mut peak: u32 = 0;

        info!(
            stages = schedule.profile().stages().len(),
            duration = ?schedule.profile().duration(),
            maximum,
            "starting load profile"
        );

        let shutdown = shutdown.recv();
        tokio::pin!(shutdown);
        loop {
            let target = tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
                target = schedule.next() => target,
            };
            let Some(target) = target else {
                info!("load profile complete");
                break;
            };
            gauge!("target_virtual_users").set(f64::from(target));

            while let Some(result) = tasks.try_join_next() {
                if let Err(err) = result {
                    error!("virtual user task failed: {err}");
                }
            }

            let active = roster.len();
            if target > active {
                // Users still finishing after retirement occupy a slot.
                let room = u32::try_from(maximum.saturating_sub(tasks.len())).unwrap_or(0);
                for _ in 0..(target - active).min(room) {
                    let (watcher, broadcaster) = barrage_signal::signal();
                    let user = VirtualUser::new(
                        next_id,
                        SmallRng::from_rng(&mut master),
                        Arc::clone(&context),
                        Arc::clone(&tally),
                        watcher,
                    );
                    tasks.spawn(user.run());
                    roster.push(next_id, broadcaster);
                    next_id = next_id.wrapping_add(1);
                }
            } else if target < active {
                let retired = roster.retire(active - target);
                debug!(?retired, "retired virtual users");
            }

            peak = peak.max(roster.len());
            gauge!("active_virtual_users").set(f64::from(roster.len()));
        }

        let retired = roster.retire_all();
        info!(retired = retired.len(), "waiting on in-flight iterations");
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                error!("virtual user task failed: {err}");
            }
        }
        gauge!("active_virtual_users").set(0.0);

        Summary {
            iterations: tally.iterations(),
            successes: tally.successes(),
            rejections: tally.rejections(),
            transport_failures: tally.transport_failures(),
            faults: tally.faults(),
            peak_virtual_users: peak,
        }
    }
}
