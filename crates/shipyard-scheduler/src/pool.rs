use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use shipyard_bus::{AsyncResult, Bus};
use shipyard_core::config::WorkerGroupConfig;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::{
    error::{Result, SchedulerError},
    store::JobStore,
    types::{Job, MessageFilter},
};

/// Runs persisted jobs through the bus with a bounded number of concurrent
/// handlers per worker group.
///
/// A single coordinator owns the running counts. It starts one claim task per
/// group with spare capacity on every poll tick, whenever a task reports a
/// successful claim, and whenever a task that ran a job finishes.
pub struct WorkerPool {
    store: JobStore,
    bus: Arc<Bus>,
    poll_interval: Duration,
    slots: Vec<Slot>,
}

struct Slot {
    name: String,
    size: usize,
    filter: MessageFilter,
    running: usize,
}

enum Event {
    Poll,
    Finished { slot: usize, worked: bool },
}

impl WorkerPool {
    /// Build a pool from its worker groups, checked against the async
    /// requests registered on `bus`.
    ///
    /// Fails when a group lists a message the bus cannot decode, when two
    /// groups list the same message, or when there is no catch-all group and
    /// some registered message is left without a group.
    pub fn new(
        store: JobStore,
        bus: Arc<Bus>,
        poll_interval: Duration,
        groups: Vec<WorkerGroupConfig>,
    ) -> Result<Self> {
        if groups.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "at least one worker group is required".to_string(),
            ));
        }

        let marshaller = bus.marshaller();
        let mut owners: HashMap<&str, &str> = HashMap::new();
        for group in &groups {
            for message in &group.messages {
                if !marshaller.is_registered(message) {
                    return Err(SchedulerError::InvalidConfig(format!(
                        "worker group {} lists unknown message {message}",
                        group.name
                    )));
                }
                if let Some(previous) = owners.insert(message, &group.name) {
                    return Err(SchedulerError::InvalidConfig(format!(
                        "message {message} is listed by worker groups {previous} and {}",
                        group.name
                    )));
                }
            }
        }

        if !groups.iter().any(WorkerGroupConfig::is_catch_all) {
            let uncovered: Vec<&str> = marshaller
                .names()
                .into_iter()
                .filter(|name| !owners.contains_key(name))
                .collect();
            if !uncovered.is_empty() {
                return Err(SchedulerError::InvalidConfig(format!(
                    "no worker group handles {}",
                    uncovered.join(", ")
                )));
            }
        }

        let mut listed: Vec<String> = owners.into_keys().map(str::to_string).collect();
        listed.sort_unstable();

        let slots = groups
            .into_iter()
            .map(|group| {
                let filter = if group.is_catch_all() {
                    MessageFilter::Except(listed.clone())
                } else {
                    MessageFilter::Only(group.messages)
                };
                Slot {
                    name: group.name,
                    size: group.size.max(1),
                    filter,
                    running: 0,
                }
            })
            .collect();

        Ok(Self {
            store,
            bus,
            poll_interval,
            slots,
        })
    }

    /// Process jobs until `shutdown` flips to `true` (or its sender is
    /// dropped), then wait for every in-flight job to settle.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        for slot in &self.slots {
            info!(group = %slot.name, size = slot.size, filter = ?slot.filter, "worker group ready");
        }
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "worker pool started");

        let wake = Arc::new(Notify::new());
        let mut tasks: JoinSet<(usize, bool)> = JoinSet::new();
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            let event = tokio::select! {
                _ = interval.tick() => Event::Poll,
                _ = wake.notified() => Event::Poll,
                Some(joined) = tasks.join_next() => match joined {
                    Ok((slot, worked)) => Event::Finished { slot, worked },
                    Err(e) => {
                        error!("worker task failed: {e}");
                        continue;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match event {
                Event::Poll => self.fill(&mut tasks, &wake, &shutdown),
                Event::Finished { slot, worked } => {
                    self.slots[slot].running -= 1;
                    if worked {
                        self.fill(&mut tasks, &wake, &shutdown);
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "worker pool shutting down");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("worker task failed: {e}");
            }
        }
        info!("worker pool stopped");
    }

    // --- private helpers ---------------------------------------------------

    /// Start one claim task for every group with spare capacity.
    fn fill(
        &mut self,
        tasks: &mut JoinSet<(usize, bool)>,
        wake: &Arc<Notify>,
        shutdown: &watch::Receiver<bool>,
    ) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.running >= slot.size {
                continue;
            }
            slot.running += 1;

            let store = self.store.clone();
            let bus = Arc::clone(&self.bus);
            let filter = slot.filter.clone();
            let group = slot.name.clone();
            let wake = Arc::clone(wake);
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let worked = AssertUnwindSafe(work(store, bus, filter, &group, wake, shutdown))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        error!(%group, "worker task panicked: {}", panic_message(&*panic));
                        true
                    });
                (index, worked)
            });
        }
    }
}

/// Claim at most one job and run it. Returns whether a job was claimed.
async fn work(
    store: JobStore,
    bus: Arc<Bus>,
    filter: MessageFilter,
    group: &str,
    wake: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
) -> bool {
    if *shutdown.borrow() {
        return false;
    }

    let job = match store.claim(&filter, Some(1)) {
        Ok(mut jobs) => match jobs.pop() {
            Some(job) => job,
            None => return false,
        },
        Err(e) => {
            error!(%group, "job claim failed: {e}");
            return false;
        }
    };

    wake.notify_one();
    execute(&store, &bus, job, group).await;
    true
}

/// Run a claimed job and record its outcome. Handler panics count as failures.
async fn execute(store: &JobStore, bus: &Bus, job: Job, group: &str) {
    let started = Instant::now();
    debug!(job_id = %job.id, message_name = %job.message_name, %group, "job started");

    let outcome = AssertUnwindSafe(bus.send_persisted(&job.message_name, &job.message_data))
        .catch_unwind()
        .await;

    let settled = match outcome {
        Ok(Ok(AsyncResult::Processed)) => store.done(&job),
        Ok(Ok(AsyncResult::Delay)) => store.delay(&job),
        Ok(Err(e)) => store.retry(&job, &format!("{e:#}")),
        Err(panic) => store.retry(
            &job,
            &format!("handler panicked: {}", panic_message(&*panic)),
        ),
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    match settled {
        Ok(()) => debug!(job_id = %job.id, %group, duration_ms, "job settled"),
        Err(e) => error!(job_id = %job.id, %group, duration_ms, "failed to settle job: {e}"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
