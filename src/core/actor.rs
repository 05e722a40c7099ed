//! # QueueActor: the task that owns a [`BroadcastQueue`].
//!
//! Every mutation of a queue happens on its actor. Callers talk to it through a
//! [`QueueHandle`](crate::QueueHandle), which turns each operation into a
//! [`Command`]; queries carry a oneshot reply channel.
//!
//! ## Loop
//! ```text
//! loop {
//!   ├─► queue.pump()                      (run everything scheduled)
//!   ├─► deadline = queue.next_deadline()  (timeout, grant revocation, deferral)
//!   └─► select! {
//!         token.cancelled()   → exit
//!         rx.recv()           → apply command (None → exit)
//!         sleep_until(deadline) → queue.on_timer(now)
//!       }
//! }
//! ```
//!
//! ## Rules
//! - Commands are applied in arrival order; a query sees every earlier command.
//! - The queue is pumped between any two commands.
//! - With no deadline the actor sleeps until the next command.

use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    config::BroadcastConstants,
    dump::QueueDump,
    queue::{BroadcastQueue, EnqueueOutcome, FinishResult, FinishTarget},
    stats::BroadcastStats,
};
use crate::{
    host::ProcessInfo,
    record::{BroadcastRecord, Pid, UserId},
};

/// Mailbox message of a queue actor.
pub(crate) enum Command {
    Enqueue {
        record: Box<BroadcastRecord>,
        reply: oneshot::Sender<EnqueueOutcome>,
    },
    FinishReceiver {
        target: FinishTarget,
        result: FinishResult,
        wait_for_services: bool,
        reply: oneshot::Sender<bool>,
    },
    ProcessAttached {
        process: ProcessInfo,
        reply: oneshot::Sender<bool>,
    },
    ProcessGone {
        pid: Pid,
        reply: oneshot::Sender<bool>,
    },
    CleanupPackage {
        package: Option<String>,
        classes: Option<Vec<String>>,
        user: UserId,
        reply: oneshot::Sender<bool>,
    },
    BackgroundServicesFinished(UserId),
    CancelDeferrals(oneshot::Sender<usize>),
    SetProcessesReady,
    UpdateConstants(Box<BroadcastConstants>),
    IsIdle(oneshot::Sender<bool>),
    BeyondBarrier(Instant, oneshot::Sender<bool>),
    Describe(oneshot::Sender<String>),
    Dump(oneshot::Sender<Box<QueueDump>>),
    TakeStats(oneshot::Sender<BroadcastStats>),
}

pub(crate) struct QueueActor {
    queue: BroadcastQueue,
    rx: mpsc::Receiver<Command>,
}

impl QueueActor {
    pub(crate) fn new(queue: BroadcastQueue, rx: mpsc::Receiver<Command>) -> Self {
        Self { queue, rx }
    }

    /// Runs until the token is cancelled or every handle was dropped.
    pub(crate) async fn run(self, token: CancellationToken) {
        let Self { mut queue, mut rx } = self;
        info!(queue = %queue.name(), "broadcast queue started");

        loop {
            queue.pump();
            let deadline = queue.next_deadline(Instant::now());
            let sleep = async move {
                match deadline {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            select! {
                biased;
                _ = token.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => apply(&mut queue, cmd),
                    None => break,
                },
                _ = sleep => queue.on_timer(Instant::now()),
            }
        }

        info!(
            queue = %queue.name(),
            records = queue.len(),
            "broadcast queue stopped"
        );
    }
}

fn apply(queue: &mut BroadcastQueue, cmd: Command) {
    match cmd {
        Command::Enqueue { record, reply } => {
            let _ = reply.send(queue.enqueue(*record));
        }
        Command::FinishReceiver {
            target,
            result,
            wait_for_services,
            reply,
        } => {
            let _ = reply.send(queue.finish_receiver(target, result, wait_for_services));
        }
        Command::ProcessAttached { process, reply } => {
            let _ = reply.send(queue.on_process_attached(&process));
        }
        Command::ProcessGone { pid, reply } => {
            let _ = reply.send(queue.process_gone(pid));
        }
        Command::CleanupPackage {
            package,
            classes,
            user,
            reply,
        } => {
            let _ = reply.send(queue.cleanup_disabled_package_receivers(
                package.as_deref(),
                classes.as_deref(),
                user,
            ));
        }
        Command::BackgroundServicesFinished(user) => queue.background_services_finished(user),
        Command::CancelDeferrals(reply) => {
            let _ = reply.send(queue.cancel_deferrals());
        }
        Command::SetProcessesReady => queue.set_processes_ready(),
        Command::UpdateConstants(constants) => queue.update_constants(*constants),
        Command::IsIdle(reply) => {
            let _ = reply.send(queue.is_idle());
        }
        Command::BeyondBarrier(barrier, reply) => {
            let _ = reply.send(queue.is_beyond_barrier(barrier));
        }
        Command::Describe(reply) => {
            let _ = reply.send(queue.describe_state());
        }
        Command::Dump(reply) => {
            debug!(queue = %queue.name(), "dumping queue state");
            let _ = reply.send(Box::new(queue.dump()));
        }
        Command::TakeStats(reply) => {
            let _ = reply.send(queue.take_stats());
        }
    }
}
