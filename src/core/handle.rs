//! # QueueHandle: the caller side of a queue actor.
//!
//! Cheap to clone. Every method sends one command and, for queries, waits for the
//! reply. Once the actor stopped, every method returns [`QueueError::Closed`].

use std::sync::Arc;
use std::time::Duration;

use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{
    actor::Command,
    config::BroadcastConstants,
    dump::QueueDump,
    queue::{EnqueueOutcome, FinishResult, FinishTarget},
    stats::BroadcastStats,
};
use crate::{
    error::QueueError,
    events::{Bus, Event},
    host::ProcessInfo,
    record::{BroadcastRecord, Pid, UserId},
};

const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to a running broadcast queue.
#[derive(Clone)]
pub struct QueueHandle {
    name: Arc<str>,
    tx: mpsc::Sender<Command>,
    bus: Bus,
    token: CancellationToken,
    poll_interval: Duration,
}

impl QueueHandle {
    pub(crate) fn new(
        name: Arc<str>,
        tx: mpsc::Sender<Command>,
        bus: Bus,
        token: CancellationToken,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name,
            tx,
            bus,
            token,
            poll_interval,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn closed(&self) -> QueueError {
        QueueError::Closed {
            queue: self.name.to_string(),
        }
    }

    async fn send(&self, cmd: Command) -> Result<(), QueueError> {
        self.tx.send(cmd).await.map_err(|_| self.closed())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Hands a record to the queue.
    ///
    /// # Errors
    /// - [`QueueError::InvalidRecord`] for an empty action or a record that was
    ///   already accepted by a queue
    /// - [`QueueError::Closed`] once the actor stopped
    pub async fn enqueue(&self, record: BroadcastRecord) -> Result<EnqueueOutcome, QueueError> {
        if record.intent.action.is_empty() {
            return Err(QueueError::InvalidRecord {
                reason: "intent action is empty".into(),
            });
        }
        if let Some(id) = record.id() {
            return Err(QueueError::InvalidRecord {
                reason: format!("record {id} was already enqueued"),
            });
        }
        self.request(|reply| Command::Enqueue {
            record: Box::new(record),
            reply,
        })
        .await
    }

    /// Acknowledges the active receiver. Returns `false` if `target` is not the
    /// receiver the queue is waiting for.
    pub async fn finish_receiver(
        &self,
        target: FinishTarget,
        result: FinishResult,
        wait_for_services: bool,
    ) -> Result<bool, QueueError> {
        self.request(|reply| Command::FinishReceiver {
            target,
            result,
            wait_for_services,
            reply,
        })
        .await
    }

    /// A started process attached. Returns `true` if a pending receiver was handed to it.
    pub async fn process_attached(&self, process: ProcessInfo) -> Result<bool, QueueError> {
        self.request(|reply| Command::ProcessAttached { process, reply })
            .await
    }

    /// A process died. Returns `true` if it was running (or starting for) a receiver.
    pub async fn process_gone(&self, pid: Pid) -> Result<bool, QueueError> {
        self.request(|reply| Command::ProcessGone { pid, reply }).await
    }

    /// Drops queued manifest receivers of a disabled or removed package.
    ///
    /// `package: None` clears every package of `user`; `classes` limits the match
    /// to those component classes. Returns `true` if anything was removed.
    pub async fn cleanup_disabled_package_receivers(
        &self,
        package: Option<&str>,
        classes: Option<&[String]>,
        user: UserId,
    ) -> Result<bool, QueueError> {
        let package = package.map(str::to_owned);
        let classes = classes.map(<[String]>::to_vec);
        self.request(|reply| Command::CleanupPackage {
            package,
            classes,
            user,
            reply,
        })
        .await
    }

    pub async fn background_services_finished(&self, user: UserId) -> Result<(), QueueError> {
        self.send(Command::BackgroundServicesFinished(user)).await
    }

    /// Flushes all deferred fragments into the backlog. Returns how many moved.
    pub async fn cancel_deferrals(&self) -> Result<usize, QueueError> {
        self.request(Command::CancelDeferrals).await
    }

    /// Enables timeouts and hung detection.
    pub async fn set_processes_ready(&self) -> Result<(), QueueError> {
        self.send(Command::SetProcessesReady).await
    }

    pub async fn update_constants(&self, constants: BroadcastConstants) -> Result<(), QueueError> {
        self.send(Command::UpdateConstants(Box::new(constants)))
            .await
    }

    pub async fn is_idle(&self) -> Result<bool, QueueError> {
        self.request(Command::IsIdle).await
    }

    /// True once every record enqueued at or before `barrier` left the queue.
    pub async fn is_beyond_barrier(&self, barrier: Instant) -> Result<bool, QueueError> {
        self.request(|reply| Command::BeyondBarrier(barrier, reply))
            .await
    }

    pub async fn describe_state(&self) -> Result<String, QueueError> {
        self.request(Command::Describe).await
    }

    pub async fn dump(&self) -> Result<QueueDump, QueueError> {
        self.request(Command::Dump).await.map(|d| *d)
    }

    /// Returns the statistics gathered so far and starts a new period.
    pub async fn take_stats(&self) -> Result<BroadcastStats, QueueError> {
        self.request(Command::TakeStats).await
    }

    /// Waits until the queue has nothing left, flushing deferrals while it waits.
    pub async fn wait_for_idle(&self) -> Result<(), QueueError> {
        self.wait_for(None).await
    }

    /// Waits until everything enqueued before this call left the queue.
    pub async fn wait_for_barrier(&self) -> Result<(), QueueError> {
        self.wait_for(Some(Instant::now())).await
    }

    async fn wait_for(&self, barrier: Option<Instant>) -> Result<(), QueueError> {
        let mut last_log: Option<Instant> = None;
        loop {
            let done = match barrier {
                Some(b) => self.is_beyond_barrier(b).await?,
                None => self.is_idle().await?,
            };
            if done {
                return Ok(());
            }

            let now = Instant::now();
            if last_log.map_or(true, |t| now >= t + WAIT_LOG_INTERVAL) {
                last_log = Some(now);
                let state = self.describe_state().await?;
                info!(queue = %self.name, %state, "still waiting for broadcast queue");
            }
            self.cancel_deferrals().await?;
            time::sleep(self.poll_interval).await;
        }
    }

    /// Receiver of every event published by this queue from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Stops the actor and the subscriber workers.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
