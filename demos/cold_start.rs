//! # Example: cold_start
//!
//! One ordered broadcast to three manifest receivers:
//! - `com.warm` is already running and answers quickly;
//! - `com.cold` has no process yet, so the queue parks the record until it attaches;
//! - `com.slow` takes longer than `slow_time`, so its uid starts deferring.
//!
//! The simulated host answers every delivery from a spawned task, the way a real
//! transport would report back asynchronously.
//!
//! ## Flow
//! ```text
//! enqueue ──► com.warm  schedule_receiver ─► finish (100ms)
//!         ──► com.cold  start_process ─► (300ms) process_attached ─► schedule ─► finish
//!         ──► com.slow  schedule_receiver ─► finish (1.5s) ─► uid deferred
//!         ──► result_to perform_receive(code = 3)
//! ```
//!
//! ## Run
//! ```bash
//! cargo run --example cold_start --features logging
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use broadcastq::{
    BroadcastConstants, BroadcastRecord, ComponentName, Delivery, DeliveryError, FinishResult,
    FinishTarget, Host, Intent, LogWriter, ManifestReceiver, Pid, ProcessInfo, ProcessManager,
    QueueBuilder, QueueHandle, ReceiverId, ReceiverTransport, RegisteredReceiver, Subscribe, Uid,
};

#[derive(Default)]
struct SimHost {
    handle: OnceLock<QueueHandle>,
    running: Mutex<HashMap<String, Pid>>,
    next_pid: Mutex<Pid>,
}

impl SimHost {
    fn handle(&self) -> Option<QueueHandle> {
        self.handle.get().cloned()
    }
}

impl ProcessManager for SimHost {
    fn running_process(&self, name: &str, uid: Uid) -> Option<ProcessInfo> {
        let running = self.running.lock().ok()?;
        running.get(name).map(|pid| ProcessInfo::new(*pid, name, uid))
    }

    fn start_process(
        &self,
        name: &str,
        receiver: &ManifestReceiver,
        _record: &BroadcastRecord,
    ) -> Option<ProcessInfo> {
        let pid = {
            let mut next = self.next_pid.lock().ok()?;
            *next += 1;
            *next
        };
        let process = ProcessInfo::new(pid, name, receiver.uid);
        println!("[host] starting {name} as pid {pid}");

        let handle = self.handle()?;
        let attached = process.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = handle.process_attached(attached).await;
        });
        if let Ok(mut running) = self.running.lock() {
            running.insert(name.to_string(), pid);
        }
        Some(process)
    }

    fn is_alive(&self, _process: &ProcessInfo) -> bool {
        true
    }

    fn kill(&self, process: &ProcessInfo, reason: &str) {
        println!("[host] kill pid {} ({reason})", process.pid);
    }
}

impl ReceiverTransport for SimHost {
    fn schedule_receiver(
        &self,
        process: &ProcessInfo,
        receiver: &ManifestReceiver,
        delivery: &Delivery,
    ) -> Result<(), DeliveryError> {
        let handle = self.handle().ok_or(DeliveryError::ProcessDead)?;
        println!(
            "[host] {} receives {} (code {})",
            receiver.component, delivery.intent.action, delivery.result_code
        );

        let work = if receiver.component.package == "com.slow" {
            Duration::from_millis(1500)
        } else {
            Duration::from_millis(100)
        };
        let pid = process.pid;
        let code = delivery.result_code + 1;
        tokio::spawn(async move {
            tokio::time::sleep(work).await;
            let _ = handle
                .finish_receiver(FinishTarget::Process(pid), FinishResult::new(code), false)
                .await;
        });
        Ok(())
    }

    fn perform_receive(
        &self,
        target: &RegisteredReceiver,
        delivery: &Delivery,
    ) -> Result<(), DeliveryError> {
        println!(
            "[host] final result to {}: code {}",
            target.package, delivery.result_code
        );
        Ok(())
    }
}

fn manifest(package: &str, uid: Uid) -> ManifestReceiver {
    ManifestReceiver::new(ComponentName::new(package, format!("{package}.Receiver")), uid)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // 1. Host collaborators; the transport needs the handle to report back
    let sim = Arc::new(SimHost::default());
    sim.running.lock().map_err(|_| "lock poisoned")?.insert("com.warm".into(), 100);
    let host = Host::new(sim.clone(), sim.clone());

    // 2. A foreground queue that treats anything over 1s as slow
    let mut constants = BroadcastConstants::foreground();
    constants.parse_overrides("bcast_slow_time=1000")?;
    let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
    let queue = QueueBuilder::new("foreground", constants, host)
        .with_subscribers(subs)
        .spawn();
    sim.handle.set(queue.clone()).map_err(|_| "handle already set")?;

    // 3. One ordered broadcast with a result target
    let record = BroadcastRecord::new(
        Intent::new("com.example.PACKAGE_READY"),
        vec![
            manifest("com.warm", 10_001).into(),
            manifest("com.cold", 10_002).into(),
            manifest("com.slow", 10_003).into(),
        ],
    )
    .with_ordered(true)
    .with_caller("android", 1000, 1)
    .with_result_to(RegisteredReceiver::new(ReceiverId::new(1), 1000, "android"));
    queue.enqueue(record).await?;

    // 4. Wait for the chain, then look at what the queue remembers
    queue.wait_for_idle().await?;
    let dump = queue.dump().await?;
    println!("{}", dump.to_json()?);

    queue.shutdown();
    Ok(())
}
