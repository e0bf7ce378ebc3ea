use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use shipyard_bus::{AsyncRequest, Bus, BusError, Message, MessageKind, Request, Signal, Unit};
use shipyard_core::types::{JobId, Paginated};
use tracing::info;

use crate::{
    error::Result,
    store::JobStore,
    types::{Job, NewJob, QueueOptions},
};

/// Entry point for producers: turns async requests into persisted jobs.
#[derive(Clone)]
pub struct Scheduler {
    store: JobStore,
    bus: Arc<Bus>,
}

impl Scheduler {
    pub fn new(store: JobStore, bus: Arc<Bus>) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Persist `request` for the worker pool.
    ///
    /// The request type must have been registered with
    /// [`Bus::register_async`], otherwise nothing could ever decode it.
    pub fn queue<R: AsyncRequest>(&self, request: &R, options: QueueOptions) -> Result<JobId> {
        let marshaller = self.bus.marshaller();
        if !marshaller.is_registered(R::NAME) {
            return Err(BusError::UnknownMessage {
                name: R::NAME.to_string(),
            }
            .into());
        }

        let message_data = marshaller.encode(request)?;
        self.store.create(NewJob {
            resource_id: request.resource_id(),
            message_name: R::NAME.to_string(),
            message_data,
            group: options.group.or_else(|| request.group()),
            policy: options.policy,
        })
    }

    /// Bind the job administration messages ([`GetJobs`], [`RetryJob`],
    /// [`DismissJob`]) on the bus.
    pub fn register_handlers(&self) {
        let store = self.store.clone();
        self.bus.register(move |query: GetJobs| {
            let store = store.clone();
            async move { Ok::<_, anyhow::Error>(store.list(query.page.unwrap_or(1))?) }
        });

        let store = self.store.clone();
        self.bus.register(move |cmd: RetryJob| {
            let store = store.clone();
            async move {
                store.clear_error(&cmd.id)?;
                Ok::<_, anyhow::Error>(Unit)
            }
        });

        // The bus owns this handler, so it only keeps a weak reference back.
        let store = self.store.clone();
        let bus: Weak<Bus> = Arc::downgrade(&self.bus);
        self.bus.register(move |cmd: DismissJob| {
            let store = store.clone();
            let bus = bus.clone();
            async move {
                let job = store.delete(&cmd.id)?;
                if let Some(bus) = bus.upgrade() {
                    let dismissed = JobDismissed {
                        id: job.id.clone(),
                        message_name: job.message_name.clone(),
                        resource_id: job.resource_id.clone(),
                    };
                    // A listener that fails keeps the job queued.
                    if let Err(e) = bus.notify(&[&dismissed]).await {
                        store.restore(&job)?;
                        return Err(e.into());
                    }
                }
                info!(job_id = %job.id, message_name = %job.message_name, "job dismissed");
                Ok::<_, anyhow::Error>(Unit)
            }
        });
    }
}

/// List persisted jobs, [`crate::JOBS_PER_PAGE`] at a time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetJobs {
    /// 1-based; defaults to the first page.
    pub page: Option<u32>,
}

impl Message for GetJobs {
    const NAME: &'static str = "scheduler.query.get_jobs";
    const KIND: MessageKind = MessageKind::Query;
}

impl Request for GetJobs {
    type Output = Paginated<Job>;
}

/// Clear the error of a failed job so it runs again immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryJob {
    pub id: String,
}

impl Message for RetryJob {
    const NAME: &'static str = "scheduler.command.retry_job";
    const KIND: MessageKind = MessageKind::Command;
}

impl Request for RetryJob {
    type Output = Unit;
}

/// Delete a cancellable job that is not running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DismissJob {
    pub id: String,
}

impl Message for DismissJob {
    const NAME: &'static str = "scheduler.command.dismiss_job";
    const KIND: MessageKind = MessageKind::Command;
}

impl Request for DismissJob {
    type Output = Unit;
}

/// Raised after [`DismissJob`] removed a job, so owners of the resource can
/// roll back whatever state the job was meant to advance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDismissed {
    pub id: JobId,
    pub message_name: String,
    pub resource_id: String,
}

impl Message for JobDismissed {
    const NAME: &'static str = "scheduler.event.job_dismissed";
    const KIND: MessageKind = MessageKind::Notification;
}

impl Signal for JobDismissed {}
