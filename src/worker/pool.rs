use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{JobHandler, disposition_for};
use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{ErrorKind, PipelineError};
use crate::model::{JobId, Lane};
use crate::queue::{BrokerError, Disposition, LeasedJob, SqliteBroker};

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub visibility: Duration,
    pub poll_interval: Duration,
    /// Crawl workers pause while the analyze lane holds this many jobs
    pub analyze_depth_ceiling: u64,
}

impl PoolOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            visibility: settings.broker.visibility_timeout(),
            poll_interval: settings.broker.poll_interval(),
            analyze_depth_ceiling: settings.workers.analyze_depth_ceiling() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    /// Crawl worker waiting for the analyze lane to drain
    Throttled,
    Busy { job: JobId },
    Halted { reason: String },
    Stopped,
}

#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub id: String,
    pub lane: Lane,
    pub state: WorkerState,
}

struct Slot {
    id: String,
    lane: Lane,
    state: watch::Sender<WorkerState>,
    resume: Notify,
}

impl Slot {
    fn set(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    fn halted(&self) -> bool {
        matches!(*self.state.borrow(), WorkerState::Halted { .. })
    }
}

#[derive(Clone)]
struct WorkerContext {
    broker: Arc<SqliteBroker>,
    handler: Arc<dyn JobHandler>,
    options: PoolOptions,
    cancel: CancellationToken,
}

pub struct WorkerPool {
    broker: Arc<SqliteBroker>,
    options: PoolOptions,
    cancel: CancellationToken,
    slots: Vec<Arc<Slot>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(broker: Arc<SqliteBroker>, options: PoolOptions) -> Self {
        Self {
            broker,
            options,
            cancel: CancellationToken::new(),
            slots: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// Start `count` workers running `handler` on its lane
    pub fn spawn(&mut self, handler: Arc<dyn JobHandler>, count: usize) {
        let lane = handler.lane();
        let group = format!("{}-{}", lane, std::process::id());
        let ctx = WorkerContext {
            broker: self.broker.clone(),
            handler,
            options: self.options.clone(),
            cancel: self.cancel.clone(),
        };

        for _ in 0..count {
            let index = self.slots.iter().filter(|s| s.lane == lane).count();
            let (state, _) = watch::channel(WorkerState::Idle);
            let slot = Arc::new(Slot {
                id: format!("{group}-w{index}"),
                lane,
                state,
                resume: Notify::new(),
            });
            self.slots.push(slot.clone());
            self.handles.push(tokio::spawn(run_worker(slot, ctx.clone())));
        }
        info!(%lane, workers = count, "workers started");
    }

    pub fn workers(&self) -> Vec<WorkerStatus> {
        self.slots
            .iter()
            .map(|slot| WorkerStatus {
                id: slot.id.clone(),
                lane: slot.lane,
                state: slot.state.borrow().clone(),
            })
            .collect()
    }

    /// Watch one worker's state
    pub fn subscribe(&self, worker: &str) -> Option<watch::Receiver<WorkerState>> {
        self.slots
            .iter()
            .find(|s| s.id == worker)
            .map(|s| s.state.subscribe())
    }

    /// Let a halted worker lease again. False when no such worker is halted.
    pub fn resume(&self, worker: &str) -> bool {
        match self.slots.iter().find(|s| s.id == worker && s.halted()) {
            Some(slot) => {
                info!(worker = %slot.id, "worker resumed");
                slot.set(WorkerState::Idle);
                slot.resume.notify_one();
                true
            }
            None => false,
        }
    }

    /// Resume every halted worker, returning how many were halted
    pub fn resume_halted(&self) -> usize {
        let halted: Vec<String> = self
            .slots
            .iter()
            .filter(|s| s.halted())
            .map(|s| s.id.clone())
            .collect();
        halted.iter().filter(|id| self.resume(id)).count()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop leasing and wait up to `grace` for in-flight jobs. Jobs still
    /// running afterwards are abandoned and their leases expire in the
    /// broker. Returns true when every worker finished in time.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.cancel.cancel();
        let aborts: Vec<_> = self.handles.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(grace, futures::future::join_all(self.handles)).await {
            Ok(_) => {
                info!("workers drained");
                true
            }
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "shutdown grace elapsed, abandoning in-flight jobs");
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

async fn run_worker(slot: Arc<Slot>, ctx: WorkerContext) {
    let lane = slot.lane;
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        if slot.halted() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = slot.resume.notified() => continue,
            }
        }

        if lane == Lane::Crawl {
            match ctx.broker.depth(Lane::Analyze).await {
                Ok(depth) if depth >= ctx.options.analyze_depth_ceiling => {
                    debug!(worker = %slot.id, depth, "analyze lane full, holding crawl");
                    slot.set(WorkerState::Throttled);
                    idle(&ctx).await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    broker_failure(&slot, e);
                    idle(&ctx).await;
                    continue;
                }
            }
        }

        let job = match ctx.broker.lease(lane, &slot.id, ctx.options.visibility).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                slot.set(WorkerState::Idle);
                idle(&ctx).await;
                continue;
            }
            Err(e) => {
                broker_failure(&slot, e);
                idle(&ctx).await;
                continue;
            }
        };

        slot.set(WorkerState::Busy { job: job.id });
        process(&slot, &ctx, job).await;
        if !slot.halted() {
            slot.set(WorkerState::Idle);
        }
    }
    slot.set(WorkerState::Stopped);
    info!(worker = %slot.id, "worker stopped");
}

async fn idle(ctx: &WorkerContext) {
    tokio::select! {
        _ = ctx.cancel.cancelled() => {}
        _ = sleep(ctx.options.poll_interval) => {}
    }
}

fn broker_failure(slot: &Slot, err: BrokerError) {
    let err = PipelineError::from(err);
    if err.kind() == ErrorKind::Fatal {
        halt(slot, &err);
    } else {
        warn!(worker = %slot.id, error = %err, "broker unavailable");
    }
}

fn halt(slot: &Slot, err: &PipelineError) {
    error!(worker = %slot.id, error = %err, "worker halted, resume required");
    slot.set(WorkerState::Halted {
        reason: err.to_string(),
    });
}

async fn process(slot: &Slot, ctx: &WorkerContext, job: LeasedJob) {
    let heartbeat = (ctx.options.visibility / 3).max(MIN_HEARTBEAT);
    let work = AssertUnwindSafe(ctx.handler.handle(&job)).catch_unwind();
    tokio::pin!(work);

    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            result = &mut work => break result,
            _ = ticker.tick() => {
                match ctx.broker.renew(job.lease_id, ctx.options.visibility).await {
                    Ok(expires_at) => debug!(job_id = %job.id, expires_at, "lease renewed"),
                    Err(BrokerError::LeaseLost(_)) => {
                        warn!(job_id = %job.id, worker = %slot.id, "lease lost while running")
                    }
                    Err(e) => warn!(job_id = %job.id, error = %e, "lease renewal failed"),
                }
            }
        }
    };

    let result = match outcome {
        Ok(Ok(())) => ctx.broker.ack(job.lease_id).await.map(|()| {
            info!(lane = %job.lane, job_id = %job.id, worker = %slot.id, "job completed");
        }),
        Ok(Err(err)) => {
            let disposition = disposition_for(&err, ctx.broker.clock().now_ms());
            if err.kind() == ErrorKind::Fatal {
                halt(slot, &err);
            } else {
                warn!(lane = %job.lane, job_id = %job.id, error = %err, "job failed");
            }
            nack(ctx, &job, disposition).await
        }
        Err(_) => {
            error!(lane = %job.lane, job_id = %job.id, worker = %slot.id, "handler panicked");
            let disposition = Disposition::Retry {
                error: "handler panicked".to_string(),
            };
            nack(ctx, &job, disposition).await
        }
    };

    match result {
        Ok(()) => {}
        Err(BrokerError::LeaseLost(_)) => {
            // another worker owns the redelivery now
            warn!(job_id = %job.id, worker = %slot.id, "result dropped, lease no longer held");
        }
        Err(e) => warn!(job_id = %job.id, error = %e, "cannot settle job"),
    }
}

async fn nack(ctx: &WorkerContext, job: &LeasedJob, disposition: Disposition) -> Result<(), BrokerError> {
    let outcome = ctx.broker.nack(job.lease_id, disposition).await?;
    debug!(
        job_id = %job.id,
        state = outcome.state.as_str(),
        attempts = outcome.attempts,
        available_at = outcome.available_at,
        "job handed back"
    );
    Ok(())
}
