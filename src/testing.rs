//! Scripted host used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::{
    error::DeliveryError,
    host::{AnrReporter, Delivery, Host, ProcessInfo, ProcessManager, ReceiverTransport, TimeoutRecord},
    record::{
        BroadcastRecord, ComponentName, ManifestReceiver, Pid, ReceiverId, RecordId,
        RegisteredReceiver, Uid, UserId,
    },
};

/// One collaborator call, in the order the queue made them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Perform {
        receiver: ReceiverId,
        index: Option<usize>,
        code: i32,
        data: Option<String>,
        ordered: bool,
    },
    Schedule {
        pid: Pid,
        class: String,
        index: Option<usize>,
        code: i32,
    },
    Start {
        process: String,
    },
    Kill {
        pid: Pid,
    },
    Anr {
        pid: Pid,
        record: RecordId,
    },
    Grant {
        pid: Pid,
    },
    Revoke {
        pid: Pid,
    },
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    running: HashMap<(String, Uid), ProcessInfo>,
    startable: HashMap<String, ProcessInfo>,
    dead: HashSet<Pid>,
    debugging: HashSet<Pid>,
    fail_perform: HashSet<ReceiverId>,
    fail_schedule: HashSet<Pid>,
    background_services: bool,
}

#[derive(Clone, Default)]
pub(crate) struct FakeHost {
    state: Arc<Mutex<State>>,
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn host(&self) -> Host {
        Host::new(Arc::new(self.clone()), Arc::new(self.clone()))
            .with_anr_reporter(Arc::new(self.clone()))
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub(crate) fn run_process(&self, p: ProcessInfo) {
        self.with(|s| {
            s.running.insert((p.name.clone(), p.uid), p);
        });
    }

    /// `start_process(name)` will succeed with `p`.
    pub(crate) fn startable(&self, name: &str, p: ProcessInfo) {
        self.with(|s| {
            s.startable.insert(name.to_string(), p);
        });
    }

    /// The process dies behind the queue's back.
    pub(crate) fn die(&self, pid: Pid) {
        self.with(|s| {
            s.dead.insert(pid);
            s.running.retain(|_, p| p.pid != pid);
        });
    }

    pub(crate) fn set_debugging(&self, pid: Pid) {
        self.with(|s| {
            s.debugging.insert(pid);
        });
    }

    pub(crate) fn fail_perform(&self, receiver: ReceiverId) {
        self.with(|s| {
            s.fail_perform.insert(receiver);
        });
    }

    pub(crate) fn fail_schedule(&self, pid: Pid) {
        self.with(|s| {
            s.fail_schedule.insert(pid);
        });
    }

    pub(crate) fn set_background_services(&self, running: bool) {
        self.with(|s| s.background_services = running);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    /// Receivers called through `perform_receive`, in order.
    pub(crate) fn performed(&self) -> Vec<ReceiverId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Perform { receiver, .. } => Some(receiver),
                _ => None,
            })
            .collect()
    }

    fn push(&self, call: Call) {
        self.with(|s| s.calls.push(call));
    }
}

impl ProcessManager for FakeHost {
    fn running_process(&self, name: &str, uid: Uid) -> Option<ProcessInfo> {
        self.with(|s| s.running.get(&(name.to_string(), uid)).cloned())
    }

    fn start_process(
        &self,
        name: &str,
        _receiver: &ManifestReceiver,
        _record: &BroadcastRecord,
    ) -> Option<ProcessInfo> {
        self.push(Call::Start {
            process: name.to_string(),
        });
        self.with(|s| s.startable.get(name).cloned())
    }

    fn is_alive(&self, process: &ProcessInfo) -> bool {
        self.with(|s| !s.dead.contains(&process.pid))
    }

    fn is_debugging(&self, pid: Pid) -> bool {
        self.with(|s| s.debugging.contains(&pid))
    }

    fn kill(&self, process: &ProcessInfo, _reason: &str) {
        self.push(Call::Kill { pid: process.pid });
        self.die(process.pid);
    }

    fn has_background_services(&self, _user: UserId) -> bool {
        self.with(|s| s.background_services)
    }

    fn grant_background_start(&self, pid: Pid, _record: RecordId) {
        self.push(Call::Grant { pid });
    }

    fn revoke_background_start(&self, pid: Pid, _record: RecordId) {
        self.push(Call::Revoke { pid });
    }
}

impl ReceiverTransport for FakeHost {
    fn schedule_receiver(
        &self,
        process: &ProcessInfo,
        receiver: &ManifestReceiver,
        delivery: &Delivery,
    ) -> Result<(), DeliveryError> {
        if self.with(|s| s.fail_schedule.contains(&process.pid)) {
            return Err(DeliveryError::ProcessDead);
        }
        self.push(Call::Schedule {
            pid: process.pid,
            class: receiver.component.class.clone(),
            index: delivery.receiver_index,
            code: delivery.result_code,
        });
        Ok(())
    }

    fn perform_receive(
        &self,
        target: &RegisteredReceiver,
        delivery: &Delivery,
    ) -> Result<(), DeliveryError> {
        if self.with(|s| s.fail_perform.contains(&target.id)) {
            return Err(DeliveryError::Remote {
                reason: "binder died".into(),
            });
        }
        self.push(Call::Perform {
            receiver: target.id,
            index: delivery.receiver_index,
            code: delivery.result_code,
            data: delivery.result_data.clone(),
            ordered: delivery.ordered,
        });
        Ok(())
    }
}

impl AnrReporter for FakeHost {
    fn report_unresponsive(&self, process: &ProcessInfo, timeout: &TimeoutRecord) {
        self.push(Call::Anr {
            pid: process.pid,
            record: timeout.record,
        });
    }
}

/// Routes scheduler logs to the test output; `RUST_LOG` picks the level.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Registered receiver with no hosting process.
pub(crate) fn registered(id: u64, uid: Uid) -> RegisteredReceiver {
    RegisteredReceiver::new(ReceiverId::new(id), uid, format!("com.app{uid}"))
}

/// Registered receiver living in `process`.
pub(crate) fn registered_in(id: u64, process: &ProcessInfo) -> RegisteredReceiver {
    RegisteredReceiver::new(ReceiverId::new(id), process.uid, process.name.clone())
        .with_process(process.clone())
}

/// Manifest receiver of `package`, hosted in a process of the same name.
pub(crate) fn manifest(package: &str, uid: Uid) -> ManifestReceiver {
    ManifestReceiver::new(ComponentName::new(package, format!("{package}.Receiver")), uid)
}

/// Result target of ordered broadcasts sent by the system.
pub(crate) fn result_target() -> RegisteredReceiver {
    RegisteredReceiver::new(ReceiverId::new(900), 1000, "android")
}
