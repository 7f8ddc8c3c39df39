//! The virtual user loop.
//!
//! A virtual user repeats one iteration until it is retired: optional extra
//! latency, a fault check, synthesis, dispatch and finally the pacing sleep.
//! Retirement is observed only at the two sleeps, an iteration that has
//! started dispatching always runs to completion.
//!
//! ## Metrics
//!
//! `requests_sent`: Requests handed to the dispatcher, by `kind`
//! `request_ok`: Responses received, by `kind` and `status_code`
//! `request_failure`: Requests without a response, by `kind` and `error`
//! `faults_injected`: Iterations replaced by the failure request
//!

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use barrage_payload::Workload;
use barrage_signal::Watcher;
use metrics::counter;
use rand::{Rng, rngs::SmallRng};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::debug;

use crate::{dispatch::Dispatch, fault::Fault};

/// Everything the virtual users of one run share. Read-only.
#[derive(Debug)]
pub struct Context<D> {
    /// Request synthesis
    pub workload: Workload,
    /// Fault injection
    pub fault: Fault,
    /// Sleep after every iteration
    pub pacing: Duration,
    /// Where requests go
    pub dispatcher: D,
}

/// Iteration outcomes, summed across every virtual user of a run.
#[derive(Debug, Default)]
pub struct Tally {
    iterations: AtomicU64,
    successes: AtomicU64,
    rejections: AtomicU64,
    transport_failures: AtomicU64,
    faults: AtomicU64,
}

impl Tally {
    /// Completed iterations.
    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Iterations answered with a 2xx status.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Iterations answered with any other status.
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Iterations that received no response.
    #[must_use]
    pub fn transport_failures(&self) -> u64 {
        self.transport_failures.load(Ordering::Relaxed)
    }

    /// Iterations that sent the failure request.
    #[must_use]
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }
}

/// One simulated user.
#[derive(Debug)]
pub struct VirtualUser<D> {
    id: u32,
    rng: SmallRng,
    context: Arc<Context<D>>,
    tally: Arc<Tally>,
    retire: Watcher,
}

impl<D> VirtualUser<D>
where
    D: Dispatch,
{
    /// Create a new [`VirtualUser`]. The user runs until `retire` fires.
    #[must_use]
    pub fn new(
        id: u32,
        rng: SmallRng,
        context: Arc<Context<D>>,
        tally: Arc<Tally>,
        retire: Watcher,
    ) -> Self {
        Self {
            id,
            rng,
            context,
            tally,
            retire,
        }
    }

    /// Run iterations until retired.
    pub async fn run(self) {
        let Self {
            id,
            mut rng,
            context,
            tally,
            retire,
        } = self;

        let retire = retire.recv();
        tokio::pin!(retire);

        debug!(id, "virtual user started");
        loop {
            if let Some(latency) = context.fault.extra_latency() {
                tokio::select! {
                    biased;
                    () = &mut retire => break,
                    () = sleep(latency) => {}
                }
            }

            iteration(&context, &tally, &mut rng).await;

            tokio::select! {
                biased;
                () = &mut retire => break,
                () = sleep(context.pacing) => {}
            }
        }
        debug!(id, "virtual user retired");
    }
}

async fn iteration<D, R>(context: &Context<D>, tally: &Tally, rng: &mut R)
where
    D: Dispatch,
    R: Rng + Send,
{
    let request = if context.fault.trips(rng) {
        debug!("simulated failure");
        counter!("faults_injected").increment(1);
        tally.faults.fetch_add(1, Ordering::Relaxed);
        context.workload.failure_request(rng)
    } else {
        context.workload.synthesize(rng, OffsetDateTime::now_utc())
    };
    let kind = request.kind.as_str();

    counter!("requests_sent", "kind" => kind).increment(1);
    match context.dispatcher.dispatch(&request).await {
        Ok(status) => {
            counter!("request_ok", "kind" => kind, "status_code" => status.as_u16().to_string())
                .increment(1);
            if status.is_success() {
                tally.successes.fetch_add(1, Ordering::Relaxed);
            } else {
                debug!(kind, status = status.as_u16(), "non-success response");
                tally.rejections.fetch_add(1, Ordering::Relaxed);
            }
        }
        Err(err) => {
            debug!(kind, "request failed: {err}");
            counter!("request_failure", "kind" => kind, "error" => err.label()).increment(1);
            tally.transport_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
    tally.iterations.fetch_add(1, Ordering::Relaxed);
}
