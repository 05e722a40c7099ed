use std::sync::Arc;

use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio_util::sync::CancellationToken;

use super::{
    actor::QueueActor,
    config::BroadcastConstants,
    handle::QueueHandle,
    queue::BroadcastQueue,
};
use crate::{
    events::{Bus, Event, EventKind},
    host::Host,
    policies::{RuleSkipPolicy, SkipPolicy},
    subscribers::{Subscribe, SubscriberSet},
};

/// Builder for a broadcast queue actor.
pub struct QueueBuilder {
    name: String,
    constants: BroadcastConstants,
    host: Host,
    skip: Option<Arc<dyn SkipPolicy>>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    delay_behind_services: bool,
    processes_ready: bool,
}

impl QueueBuilder {
    /// Creates a builder with the permissive [`RuleSkipPolicy`] and no subscribers.
    pub fn new(name: impl Into<String>, constants: BroadcastConstants, host: Host) -> Self {
        Self {
            name: name.into(),
            constants,
            host,
            skip: None,
            subscribers: Vec::new(),
            delay_behind_services: false,
            processes_ready: true,
        }
    }

    /// Sets the delivery gate consulted before each receiver.
    pub fn with_skip_policy(mut self, skip: Arc<dyn SkipPolicy>) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Sets event subscribers for observability.
    ///
    /// Subscribers receive queue events through dedicated workers with bounded queues.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Holds the chain while background services started by a receiver still run.
    pub fn delay_behind_services(mut self, delay: bool) -> Self {
        self.delay_behind_services = delay;
        self
    }

    /// Whether timeouts and hung detection are active from the start (default `true`).
    pub fn processes_ready(mut self, ready: bool) -> Self {
        self.processes_ready = ready;
        self
    }

    /// Spawns the queue actor and its subscriber listener.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(self) -> QueueHandle {
        let bus = Bus::new(self.constants.bus_capacity_clamped());
        let token = CancellationToken::new();
        let name: Arc<str> = Arc::from(self.name);

        let subs = SubscriberSet::new(self.subscribers, bus.clone());
        subscriber_listener(&bus, subs, token.clone());

        let (tx, rx) = mpsc::channel(self.constants.command_capacity_clamped());
        let poll_interval = self.constants.idle_poll_interval;
        let skip = self
            .skip
            .unwrap_or_else(|| Arc::new(RuleSkipPolicy::default()));
        let queue = BroadcastQueue::new(Arc::clone(&name), self.constants, self.host, skip, bus.clone())
            .with_delay_behind_services(self.delay_behind_services)
            .with_processes_ready(self.processes_ready);

        tokio::spawn(QueueActor::new(queue, rx).run(token.clone()));
        QueueHandle::new(name, tx, bus, token, poll_interval)
    }
}

/// Subscribes to the bus and forwards events to the subscriber set.
fn subscriber_listener(bus: &Bus, subs: SubscriberSet, token: CancellationToken) {
    if subs.is_empty() {
        return;
    }
    let mut rx = bus.subscribe();
    let bus = bus.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                msg = rx.recv() => match msg {
                    Ok(ev) => subs.emit(&ev),
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(n)) => {
                        bus.publish(
                            Event::new(EventKind::SubscriberOverflow)
                                .with_reason(format!("listener lagged by {n} events")),
                        );
                    }
                }
            }
        }
        subs.shutdown().await;
    });
}
