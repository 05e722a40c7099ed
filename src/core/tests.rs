use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};

use super::{
    queue::BroadcastQueue, BroadcastConstants, EnqueueOutcome, FinishResult, FinishTarget,
    HistoryEntry, QueueBuilder,
};
use crate::{
    error::QueueError,
    events::{Bus, Event, EventKind},
    host::ProcessInfo,
    policies::{PackageState, RuleSkipPolicy, SkipPolicy},
    record::{
        BroadcastRecord, DeliveryState, DispatchState, Intent, IntentFlags, Receiver, ReceiverId,
        Uid, RESULT_CANCELED, RESULT_OK,
    },
    subscribers::Subscribe,
    testing::{init_tracing, manifest, registered, registered_in, result_target, Call, FakeHost},
};

const APP_A: Uid = 10_001;
const APP_B: Uid = 10_002;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn rid(n: u64) -> ReceiverId {
    ReceiverId::new(n)
}

fn queue(host: &FakeHost) -> (BroadcastQueue, broadcast::Receiver<Event>) {
    init_tracing();
    queue_with(host, Arc::new(RuleSkipPolicy::default()))
}

fn queue_with(
    host: &FakeHost,
    skip: Arc<dyn SkipPolicy>,
) -> (BroadcastQueue, broadcast::Receiver<Event>) {
    let bus = Bus::new(256);
    let rx = bus.subscribe();
    let q = BroadcastQueue::new("test", BroadcastConstants::default(), host.host(), skip, bus);
    (q, rx)
}

fn kinds(rx: &mut broadcast::Receiver<Event>) -> Vec<EventKind> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev.kind);
    }
    out
}

fn ordered(action: &str, receivers: Vec<Receiver>) -> BroadcastRecord {
    BroadcastRecord::new(Intent::new(action), receivers).with_ordered(true)
}

fn last_history(q: &BroadcastQueue) -> HistoryEntry {
    q.dump().history.last().cloned().expect("history is empty")
}

fn proc_a() -> ProcessInfo {
    ProcessInfo::new(101, "com.a", APP_A)
}

fn proc_b() -> ProcessInfo {
    ProcessInfo::new(102, "com.b", APP_B)
}

fn is_schedule_to(call: &Call, pid: u32) -> bool {
    matches!(call, Call::Schedule { pid: p, .. } if *p == pid)
}

// ---- Parallel and ordered delivery ----

#[tokio::test(start_paused = true)]
async fn test_parallel_delivers_every_receiver_at_once() {
    let host = FakeHost::new();
    let (mut q, mut rx) = queue(&host);

    let rec = BroadcastRecord::new(
        Intent::new("TICK"),
        vec![registered(1, APP_A).into(), registered(2, APP_B).into()],
    );
    assert!(matches!(q.enqueue(rec), EnqueueOutcome::Enqueued(_)));
    q.pump();

    assert_eq!(host.performed(), vec![rid(1), rid(2)]);
    assert!(host
        .calls()
        .iter()
        .all(|c| matches!(c, Call::Perform { ordered: false, .. })));
    assert_eq!(q.len(), 0);
    assert!(q.is_idle());
    assert_eq!(last_history(&q).delivery, vec![DeliveryState::Delivered; 2]);

    let k = kinds(&mut rx);
    assert_eq!(k.first(), Some(&EventKind::Enqueued));
    assert_eq!(k.last(), Some(&EventKind::Retired));
}

#[tokio::test(start_paused = true)]
async fn test_ordered_chain_propagates_result() {
    let host = FakeHost::new();
    let (mut q, _rx) = queue(&host);

    let rec = ordered(
        "CHAIN",
        vec![registered(1, APP_A).into(), registered(2, APP_B).into()],
    )
    .with_result_to(result_target())
    .with_initial_result(RESULT_OK, None);
    let id = q.enqueue(rec).id();
    q.pump();

    assert_eq!(host.performed(), vec![rid(1)]);
    assert_eq!(q.active(), Some(id));
    assert_eq!(q.record(id).map(BroadcastRecord::in_flight), Some(1));
    assert_eq!(
        q.record(id).map(BroadcastRecord::state),
        Some(DispatchState::CallDoneReceive)
    );

    assert!(q.finish_receiver(
        FinishTarget::Receiver(rid(1)),
        FinishResult::new(5).with_data("a"),
        false
    ));
    q.pump();
    assert_eq!(
        host.calls().last(),
        Some(&Call::Perform {
            receiver: rid(2),
            index: Some(1),
            code: 5,
            data: Some("a".into()),
            ordered: true,
        })
    );
    assert_eq!(q.record(id).map(BroadcastRecord::in_flight), Some(1));

    assert!(q.finish_receiver(FinishTarget::Receiver(rid(2)), FinishResult::new(7), false));
    q.pump();
    assert_eq!(
        host.calls().last(),
        Some(&Call::Perform {
            receiver: rid(900),
            index: None,
            code: 7,
            data: None,
            ordered: false,
        })
    );
    assert_eq!(q.len(), 0);

    let h = last_history(&q);
    assert_eq!(h.result_code, 7);
    assert_eq!(h.delivery, vec![DeliveryState::Delivered; 2]);
    assert!(!h.aborted);
}

#[tokio::test(start_paused = true)]
async fn test_abort_stops_chain() {
    let host = FakeHost::new();
    let (mut q, _rx) = queue(&host);

    let rec = ordered(
        "ABORT",
        vec![registered(1, APP_A).into(), registered(2, APP_B).into()],
    )
    .with_result_to(result_target());
    q.enqueue(rec);
    q.pump();

    assert!(q.finish_receiver(
        FinishTarget::Receiver(rid(1)),
        FinishResult::new(3).with_abort(true),
        false
    ));
    q.pump();

    assert_eq!(host.performed(), vec![rid(1), rid(900)]);
    let h = last_history(&q);
    assert!(h.aborted);
    assert_eq!(h.result_code, 3);
    assert_eq!(
        h.delivery,
        vec![DeliveryState::Delivered, DeliveryState::Pending]
    );
}

#[tokio::test(start_paused = true)]
async fn test_no_abort_intent_ignores_abort() {
    let host = FakeHost::new();
    let (mut q, _rx) = queue(&host);

    let intent = Intent::new("NO_ABORT").with_flags(IntentFlags {
        no_abort: true,
        ..IntentFlags::default()
    });
    let rec = BroadcastRecord::new(
        intent,
        vec![registered(1, APP_A).into(), registered(2, APP_B).into()],
    )
    .with_ordered(true);
    q.enqueue(rec);
    q.pump();

    q.finish_receiver(
        FinishTarget::Receiver(rid(1)),
        FinishResult::new(3).with_abort(true),
        false,
    );
    q.pump();
    assert_eq!(host.performed(), vec![rid(1), rid(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_record_without_receivers_is_retired() {
    let host = FakeHost::new();
    let (mut q, _rx) = queue(&host);

    let out = q.enqueue(ordered("EMPTY", Vec::new()));
    assert!(matches!(out, EnqueueOutcome::Retired(_)));
    assert_eq!(q.len(), 0);
    assert!(q.is_idle());
    assert_eq!(q.dump().total_retired, 1);
    assert!(host.calls().is_empty());
}

// ---- Manifest receivers and process start ----

#[tokio::test(start_paused = true)]
async fn test_manifest_receiver_in_running_process() {
    let host = FakeHost::new();
    host.run_process(proc_a());
    let (mut q, _rx) = queue(&host);

    let id = q.enqueue(ordered("BOOT", vec![manifest("com.a", APP_A).into()])).id();
    q.pump();

    assert_eq!(
        host.calls(),
        vec![Call::Schedule {
            pid: 101,
            class: "com.a.Receiver".into(),
            index: Some(0),
            code: 0,
        }]
    );
    assert_eq!(
        q.record(id).map(BroadcastRecord::state),
        Some(DispatchState::AppReceive)
    );

    assert!(!q.finish_receiver(FinishTarget::Receiver(rid(1)), FinishResult::default(), false));
    assert!(q.finish_receiver(FinishTarget::Process(101), FinishResult::default(), false));
    q.pump();

    assert_eq!(q.len(), 0);
    let h = last_history(&q);
    assert_eq!(h.manifest_count, 1);
    assert_eq!(h.delivery, vec![DeliveryState::Delivered]);
}

#[tokio::test(start_paused = true)]
async fn test_cold_start_waits_for_attach() {
    let host = FakeHost::new();
    host.startable("com.a", proc_a());
    let (mut q, mut rx) = queue(&host);

    let id = q.enqueue(ordered("BOOT", vec![manifest("com.a", APP_A).into()])).id();
    q.pump();

    assert_eq!(
        host.calls(),
        vec![Call::Start {
            process: "com.a".into()
        }]
    );
    assert_eq!(q.pending_record(), Some(id));
    assert!(!q.is_idle());
    assert!(kinds(&mut rx).contains(&EventKind::ProcessStartRequested));

    // a pending receiver cannot be finished before it was delivered
    assert!(!q.finish_receiver(FinishTarget::Process(101), FinishResult::default(), false));
    assert!(!q.on_process_attached(&ProcessInfo::new(999, "com.a", APP_A)));
    assert!(q.on_process_attached(&proc_a()));
    assert_eq!(q.pending_record(), None);
    assert!(is_schedule_to(&host.calls()[1], 101));

    assert!(q.finish_receiver(FinishTarget::Process(101), FinishResult::default(), false));
    q.pump();
    assert_eq!(q.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pending_process_death_skips_receiver() {
    let host = FakeHost::new();
    host.startable("com.a", proc_a());
    host.run_process(proc_b());
    let (mut q, _rx) = queue(&host);

    let id = q
        .enqueue(ordered(
            "BOOT",
            vec![manifest("com.a", APP_A).into(), manifest("com.b", APP_B).into()],
        ))
        .id();
    q.pump();
    assert_eq!(q.pending_record(), Some(id));

    host.die(101);
    assert!(q.process_gone(101));
    q.pump();

    assert_eq!(q.pending_record(), None);
    assert!(host.calls().last().map_or(false, |c| is_schedule_to(c, 102)));
    assert_eq!(
        q.record(id).map(|r| r.delivery()[0]),
        Some(DeliveryState::Skipped)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unstartable_middle_receiver_skipped_and_result_sent_once() {
    let host = FakeHost::new();
    let pc = ProcessInfo::new(103, "com.c", 10_003);
    host.run_process(proc_a());
    host.startable("com.b", proc_b());
    host.run_process(pc.clone());
    let (mut q, _rx) = queue(&host);
    let results = |host: &FakeHost| host.performed().iter().filter(|r| **r == rid(900)).count();

    let id = q
        .enqueue(
            ordered(
                "BOOT",
                vec![
                    manifest("com.a", APP_A).into(),
                    manifest("com.b", APP_B).into(),
                    manifest("com.c", 10_003).into(),
                ],
            )
            .with_result_to(result_target()),
        )
        .id();
    q.pump();
    assert!(q.finish_receiver(FinishTarget::Process(101), FinishResult::new(1), false));
    q.pump();
    assert_eq!(q.pending_record(), Some(id));

    // receiver 2's process dies before it ever attaches
    host.die(102);
    assert!(q.process_gone(102));
    q.pump();
    assert!(host.calls().last().map_or(false, |c| is_schedule_to(c, 103)));
    assert_eq!(results(&host), 0);

    assert!(q.finish_receiver(FinishTarget::Process(103), FinishResult::new(7), false));
    q.pump();
    q.pump();
    assert_eq!(results(&host), 1);
    assert_eq!(
        host.calls().last(),
        Some(&Call::Perform {
            receiver: rid(900),
            index: None,
            code: 7,
            data: None,
            ordered: false,
        })
    );
    assert!(q.record(id).is_none());
    assert_eq!(
        last_history(&q).delivery,
        vec![
            DeliveryState::Delivered,
            DeliveryState::Skipped,
            DeliveryState::Delivered
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_dead_pending_process_detected_on_next_pass() {
    let host = FakeHost::new();
    host.startable("com.a", proc_a());
    host.run_process(proc_b());
    let (mut q, mut rx) = queue(&host);

    q.enqueue(ordered(
        "BOOT",
        vec![manifest("com.a", APP_A).into(), manifest("com.b", APP_B).into()],
    ));
    q.pump();

    // nobody reports the death; the next scheduling pass notices it
    host.die(101);
    q.enqueue(BroadcastRecord::new(
        Intent::new("TICK"),
        vec![registered(5, APP_B).into()],
    ));
    q.pump();

    assert_eq!(q.pending_record(), None);
    assert!(host.calls().iter().any(|c| is_schedule_to(c, 102)));
    assert!(kinds(&mut rx).contains(&EventKind::ReceiverDiscarded));
}

#[tokio::test(start_paused = true)]
async fn test_failed_start_discards_receiver() {
    let host = FakeHost::new();
    let (mut q, _rx) = queue(&host);

    let id = q
        .enqueue(ordered(
            "BOOT",
            vec![manifest("com.a", APP_A).into(), registered(2, APP_B).into()],
        ))
        .id();
    q.pump();

    assert_eq!(
        host.calls().first(),
        Some(&Call::Start {
            process: "com.a".into()
        })
    );
    assert_eq!(host.performed(), vec![rid(2)]);
    assert_eq!(q.pending_record(), None);
    assert_eq!(
        q.record(id).map(|r| r.delivery()[0]),
        Some(DeliveryState::Skipped)
    );
}

#[tokio::test(start_paused = true)]
async fn test_schedule_failure_restarts_process() {
    let host = FakeHost::new();
    host.run_process(proc_a());
    host.fail_schedule(101);
    host.startable("com.a", ProcessInfo::new(201, "com.a", APP_A));
    let (mut q, _rx) = queue(&host);

    let id = q.enqueue(ordered("BOOT", vec![manifest("com.a", APP_A).into()])).id();
    q.pump();

    assert_eq!(
        host.calls(),
        vec![
            Call::Kill { pid: 101 },
            Call::Start {
                process: "com.a".into()
            },
        ]
    );
    assert_eq!(q.pending_record(), Some(id));
    assert!(q.on_process_attached(&ProcessInfo::new(201, "com.a", APP_A)));
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_kills_process() {
    let host = FakeHost::new();
    host.fail_perform(rid(1));
    let (mut q, mut rx) = queue(&host);

    let id = q
        .enqueue(ordered(
            "CHAIN",
            vec![registered_in(1, &proc_a()).into(), registered(2, APP_B).into()],
        ))
        .id();
    q.pump();

    assert_eq!(host.calls().first(), Some(&Call::Kill { pid: 101 }));
    assert_eq!(host.performed(), vec![rid(2)]);
    assert_eq!(
        q.record(id).map(|r| r.delivery()[0]),
        Some(DeliveryState::Skipped)
    );
    assert!(kinds(&mut rx).contains(&EventKind::DeliveryFailed));
}

#[tokio::test(start_paused = true)]
async fn test_finish_from_wrong_target_is_ignored() {
    let host = FakeHost::new();
    let (mut q, _rx) = queue(&host);

    let id = q
        .enqueue(ordered("CHAIN", vec![registered_in(1, &proc_a()).into()]))
        .id();
    q.pump();

    assert!(!q.finish_receiver(FinishTarget::Receiver(rid(7)), FinishResult::default(), false));
    // registered receivers are finished by id, not by process
    assert!(!q.finish_receiver(FinishTarget::Process(101), FinishResult::default(), false));
    assert_eq!(q.record(id).map(BroadcastRecord::in_flight), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_process_gone_skips_running_receiver() {
    let host = FakeHost::new();
    let (mut q, _rx) = queue(&host);

    q.enqueue(ordered(
        "CHAIN",
        vec![registered_in(1, &proc_a()).into(), registered(2, APP_B).into()],
    ));
    q.pump();

    assert!(!q.process_gone(555));
    assert!(q.process_gone(101));
    q.pump();
    assert_eq!(host.performed(), vec![rid(1), rid(2)]);
}

// ---- Timeouts ----

#[tokio::test(start_paused = true)]
async fn test_timeout_reports_anr_and_moves_on() {
    let host = FakeHost::new();
    let (mut q, mut rx) = queue(&host);
    let start = Instant::now();

    let id = q
        .enqueue(ordered(
            "SLOW",
            vec![registered_in(1, &proc_a()).into(), registered(2, APP_B).into()],
        ))
        .id();
    q.pump();
    assert_eq!(q.timeout_at(), Some(start + Duration::from_secs(10)));
    assert_eq!(q.next_deadline(start), q.timeout_at());

    time::advance(Duration::from_secs(10)).await;
    q.on_timer(Instant::now());
    q.pump();

    assert!(host.calls().contains(&Call::Anr { pid: 101, record: id }));
    assert_eq!(host.performed(), vec![rid(1), rid(2)]);
    let r = q.record(id).expect("record still queued");
    assert_eq!(r.delivery()[0], DeliveryState::Timeout);
    assert_eq!(r.anr_count(), 1);

    let k = kinds(&mut rx);
    assert!(k.contains(&EventKind::ReceiverTimeout));
    assert!(k.contains(&EventKind::AnrReported));
}

#[tokio::test(start_paused = true)]
async fn test_debugging_process_times_out_without_anr() {
    let host = FakeHost::new();
    host.set_debugging(101);
    let (mut q, _rx) = queue(&host);

    q.enqueue(ordered("SLOW", vec![registered_in(1, &proc_a()).into()]));
    q.pump();

    time::advance(Duration::from_secs(10)).await;
    q.on_timer(Instant::now());
    q.pump();

    assert!(!host.calls().iter().any(|c| matches!(c, Call::Anr { .. })));
    assert_eq!(q.len(), 0);
    let h = last_history(&q);
    assert_eq!(h.anr_count, 0);
    assert_eq!(h.delivery, vec![DeliveryState::Timeout]);
}

#[tokio::test(start_paused = true)]
async fn test_premature_timeout_rearms() {
    let host = FakeHost::new();
    let (mut q, _rx) = queue(&host);
    let start = Instant::now();

    let id = q
        .enqueue(ordered(
            "CHAIN",
            vec![registered(1, APP_A).into(), registered(2, APP_B).into()],
        ))
        .id();
    q.pump();

    time::advance(Duration::from_secs(6)).await;
    q.finish_receiver(FinishTarget::Receiver(rid(1)), FinishResult::default(), false);
    q.pump();
    assert_eq!(q.timeout_at(), Some(start + Duration::from_secs(10)));

    time::advance(Duration::from_secs(4)).await;
    q.on_timer(Instant::now());
    assert_eq!(q.timeout_at(), Some(start + Duration::from_secs(16)));
    assert_eq!(
        q.record(id).map(|r| r.delivery()[1]),
        Some(DeliveryState::Pending)
    );

    time::advance(Duration::from_secs(6)).await;
    q.on_timer(Instant::now());
    q.pump();
    assert_eq!(q.len(), 0);
    assert_eq!(
        last_history(&q).delivery,
        vec![DeliveryState::Delivered, DeliveryState::Timeout]
    );
}

#[tokio::test(start_paused = true)]
async fn test_exempt_record_never_times_out() {
    let host = FakeHost::new();
    let (mut q, _rx) = queue(&host);

    let id = q
        .enqueue(ordered("EXEMPT", vec![registered(1, APP_A).into()]).with_timeout_exempt(true))
        .id();
    q.pump();

    time::advance(Duration::from_secs(30)).await;
    q.on_timer(Instant::now());
    q.pump();

    assert_eq!(q.timeout_at(), None);
    assert_eq!(
        q.record(id).map(|r| r.delivery()[0]),
        Some(DeliveryState::Pending)
    );
    assert!(q.finish_receiver(FinishTarget::Receiver(rid(1)), FinishResult::default(), false));
    assert_eq!(q.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hung_record_forced_out_once_processes_ready() {
    let host = FakeHost::new();
    let bus = Bus::new(256);
    let mut rx = bus.subscribe();
    let mut q = BroadcastQueue::new(
        "test",
        BroadcastConstants::default(),
        host.host(),
        Arc::new(RuleSkipPolicy::default()),
        bus,
    )
    .with_processes_ready(false);

    q.enqueue(ordered(
        "HUNG",
        vec![registered(1, APP_A).into(), registered(2, APP_B).into()],
    ));
    q.pump();

    // 2 receivers * 2 * 10s
    time::advance(Duration::from_secs(41)).await;
    q.on_timer(Instant::now());
    q.pump();
    assert_eq!(q.len(), 1);
    assert_eq!(q.timeout_at(), None);

    q.set_processes_ready();
    q.pump();

    assert_eq!(q.len(), 0);
    assert_eq!(host.performed(), vec![rid(1)]);
    assert_eq!(
        last_history(&q).delivery,
        vec![DeliveryState::Timeout, DeliveryState::Pending]
    );
    assert!(kinds(&mut rx).contains(&EventKind::HungDiscarded));
}

// ---- Deferral ----

#[tokio::test(start_paused = true)]
async fn test_slow_receiver_defers_uid_and_splits() {
    let host = FakeHost::new();
    let (mut q, mut rx) = queue(&host);
    let pa = proc_a();

    q.enqueue(ordered("FIRST", vec![registered_in(1, &pa).into()]));
    q.pump();
    time::advance(Duration::from_secs(6)).await;
    q.finish_receiver(FinishTarget::Receiver(rid(1)), FinishResult::default(), false);
    q.pump();
    assert!(q.is_deferring(APP_A));
    assert!(kinds(&mut rx).contains(&EventKind::UidDeferred));

    let id = q
        .enqueue(
            ordered(
                "SECOND",
                vec![registered_in(3, &pa).into(), registered(4, APP_B).into()],
            )
            .with_result_to(result_target()),
        )
        .id();
    q.pump();

    // uid A's receiver was pulled out; the rest of the record keeps going
    assert_eq!(host.performed(), vec![rid(1), rid(4)]);
    let token = q
        .record(id)
        .and_then(BroadcastRecord::split_token)
        .expect("record was split");
    assert_eq!(q.split_refcount(token), Some(2));
    let k = kinds(&mut rx);
    assert!(k.contains(&EventKind::BroadcastSplit));
    assert!(k.contains(&EventKind::FragmentDeferred));

    // first half completes: no result yet; the fragment runs next
    q.finish_receiver(FinishTarget::Receiver(rid(4)), FinishResult::new(3), false);
    q.pump();
    assert_eq!(host.performed(), vec![rid(1), rid(4), rid(3)]);
    assert_eq!(q.split_refcount(token), Some(1));

    q.finish_receiver(FinishTarget::Receiver(rid(3)), FinishResult::new(9), false);
    q.pump();
    assert_eq!(host.performed(), vec![rid(1), rid(4), rid(3), rid(900)]);
    assert_eq!(
        host.calls().last(),
        Some(&Call::Perform {
            receiver: rid(900),
            index: None,
            code: 9,
            data: None,
            ordered: false,
        })
    );
    assert_eq!(q.split_refcount(token), None);
    assert_eq!(q.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_core_uid_is_never_deferred() {
    let host = FakeHost::new();
    let (mut q, _rx) = queue(&host);
    let system = ProcessInfo::new(7, "system", 1000);

    q.enqueue(ordered("SYS", vec![registered_in(1, &system).into()]));
    q.pump();
    time::advance(Duration::from_secs(6)).await;
    q.finish_receiver(FinishTarget::Receiver(rid(1)), FinishResult::default(), false);

    assert!(!q.is_deferring(1000));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_deferrals_flushes_fragments() {
    let host = FakeHost::new();
    let (mut q, mut rx) = queue(&host);
    q.start_deferring(APP_A);

    let c = q.enqueue(ordered("C", vec![registered(1, APP_A).into()])).id();
    let d = q.enqueue(ordered("D", vec![registered(2, APP_B).into()])).id();
    q.pump();

    // C is held back while D can run
    assert_eq!(host.performed(), vec![rid(2)]);
    assert_eq!(q.active(), Some(d));
    assert_eq!(q.record(c).map(|r| r.deferred), Some(true));

    let dump = q.dump();
    assert_eq!(dump.deferrals.len(), 1);
    assert_eq!(dump.deferrals[0].uid, APP_A);
    assert_eq!(dump.deferrals[0].records, vec![c]);

    assert_eq!(q.cancel_deferrals(), 1);
    assert!(!q.is_deferring(APP_A));
    assert!(kinds(&mut rx).contains(&EventKind::DeferralsCancelled));
    q.pump();

    q.finish_receiver(FinishTarget::Receiver(rid(2)), FinishResult::default(), false);
    q.pump();
    assert_eq!(host.performed(), vec![rid(2), rid(1)]);
    assert_eq!(q.active(), Some(c));
    assert_eq!(q.cancel_deferrals(), 0);
}

// ---- Replacement ----

#[tokio::test(start_paused = true)]
async fn test_replace_pending_cancels_old_result() {
    let host = FakeHost::new();
    let (mut q, _rx) = queue(&host);

    q.enqueue(ordered("BLOCK", vec![registered(1, APP_A).into()]));
    q.pump();

    let replacing = || {
        let intent = Intent::new("REPLACE").with_flags(IntentFlags {
            replace_pending: true,
            ..IntentFlags::default()
        });
        BroadcastRecord::new(intent, vec![registered(2, APP_B).into()])
            .with_ordered(true)
            .with_result_to(result_target())
            .with_initial_result(RESULT_OK, None)
    };
    let first = q.enqueue(replacing());
    let EnqueueOutcome::Enqueued(old) = first else {
        panic!("unexpected outcome {first:?}");
    };
    let second = q.enqueue(replacing());
    assert_eq!(
        second,
        EnqueueOutcome::Replaced {
            id: second.id(),
            replaced: old
        }
    );
    assert!(q.record(old).is_none());
    assert_eq!(
        host.calls().last(),
        Some(&Call::Perform {
            receiver: rid(900),
            index: None,
            code: RESULT_CANCELED,
            data: None,
            ordered: false,
        })
    );

    q.finish_receiver(FinishTarget::Receiver(rid(1)), FinishResult::default(), false);
    q.pump();
    assert_eq!(q.active(), Some(second.id()));
    assert_eq!(host.performed().last(), Some(&rid(2)));
}

#[tokio::test(start_paused = true)]
async fn test_replace_pending_leaves_deferred_fragment_alone() {
    let host = FakeHost::new();
    let (mut q, _rx) = queue(&host);
    q.start_deferring(APP_A);

    let replacing = |receivers: Vec<Receiver>| {
        let intent = Intent::new("REPLACE").with_flags(IntentFlags {
            replace_pending: true,
            ..IntentFlags::default()
        });
        BroadcastRecord::new(intent, receivers).with_ordered(true)
    };
    let x = q
        .enqueue(replacing(vec![
            registered(1, APP_B).into(),
            registered(2, APP_A).into(),
            registered(3, APP_B).into(),
        ]))
        .id();
    q.pump();
    q.finish_receiver(FinishTarget::Receiver(rid(1)), FinishResult::default(), false);
    q.pump();

    // receiver 2 was split out into a parked fragment without a split token
    assert_eq!(host.performed(), vec![rid(1), rid(3)]);
    let fragment = q.dump().deferrals[0].records[0];
    assert_ne!(fragment, x);
    assert_eq!(q.record(fragment).and_then(BroadcastRecord::split_token), None);

    let y = q.enqueue(replacing(vec![registered(5, APP_B).into()]));
    assert!(matches!(y, EnqueueOutcome::Enqueued(_)), "unexpected outcome {y:?}");
    assert!(q.record(fragment).is_some());

    q.finish_receiver(FinishTarget::Receiver(rid(3)), FinishResult::default(), false);
    q.pump();
    q.finish_receiver(FinishTarget::Receiver(rid(5)), FinishResult::default(), false);
    q.pump();
    assert_eq!(host.performed(), vec![rid(1), rid(3), rid(5), rid(2)]);
}

// ---- Background services, grants, barriers ----

#[tokio::test(start_paused = true)]
async fn test_waiting_services_holds_chain_until_finished() {
    let host = FakeHost::new();
    host.run_process(proc_a());
    host.run_process(proc_b());
    host.set_background_services(true);
    let (q, _rx) = queue(&host);
    let mut q = q.with_delay_behind_services(true);

    let id = q
        .enqueue(ordered(
            "BOOT",
            vec![manifest("com.a", APP_A).into(), manifest("com.b", APP_B).into()],
        ))
        .id();
    q.pump();

    assert!(q.finish_receiver(FinishTarget::Process(101), FinishResult::default(), true));
    q.pump();
    assert_eq!(
        q.record(id).map(BroadcastRecord::state),
        Some(DispatchState::WaitingServices)
    );
    assert!(!host.calls().iter().any(|c| is_schedule_to(c, 102)));

    q.background_services_finished(0);
    q.pump();
    assert!(host.calls().last().map_or(false, |c| is_schedule_to(c, 102)));
}

#[tokio::test(start_paused = true)]
async fn test_waiting_services_gives_up_at_timeout() {
    let host = FakeHost::new();
    host.run_process(proc_a());
    host.run_process(proc_b());
    host.set_background_services(true);
    let (q, _rx) = queue(&host);
    let mut q = q.with_delay_behind_services(true);

    q.enqueue(ordered(
        "BOOT",
        vec![manifest("com.a", APP_A).into(), manifest("com.b", APP_B).into()],
    ));
    q.pump();
    q.finish_receiver(FinishTarget::Process(101), FinishResult::default(), true);
    q.pump();

    time::advance(Duration::from_secs(10)).await;
    q.on_timer(Instant::now());
    q.pump();

    assert!(host.calls().last().map_or(false, |c| is_schedule_to(c, 102)));
    assert!(!host.calls().iter().any(|c| matches!(c, Call::Anr { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_background_start_grant_revoked_after_window() {
    let host = FakeHost::new();
    let (mut q, _rx) = queue(&host);
    let start = Instant::now();

    q.enqueue(
        ordered("ALARM", vec![registered_in(1, &proc_a()).into()]).with_background_start(true),
    );
    q.pump();
    assert!(host.calls().contains(&Call::Grant { pid: 101 }));

    time::advance(Duration::from_secs(1)).await;
    q.finish_receiver(FinishTarget::Receiver(rid(1)), FinishResult::default(), false);
    q.pump();
    assert_eq!(
        q.next_deadline(Instant::now()),
        Some(start + Duration::from_secs(10))
    );
    assert!(!host.calls().contains(&Call::Revoke { pid: 101 }));

    time::advance(Duration::from_secs(9)).await;
    q.on_timer(Instant::now());
    assert!(host.calls().contains(&Call::Revoke { pid: 101 }));
    assert_eq!(q.next_deadline(Instant::now()), None);
}

#[tokio::test(start_paused = true)]
async fn test_barrier_waits_for_earlier_records_only() {
    let host = FakeHost::new();
    let (mut q, _rx) = queue(&host);

    q.enqueue(ordered("B", vec![registered(1, APP_A).into()]));
    q.pump();
    let barrier = Instant::now();
    time::advance(ms(1)).await;
    q.enqueue(ordered("C", vec![registered(2, APP_B).into()]));
    q.pump();

    assert!(!q.is_beyond_barrier(barrier));
    q.finish_receiver(FinishTarget::Receiver(rid(1)), FinishResult::default(), false);
    q.pump();
    assert!(q.is_beyond_barrier(barrier));
    assert!(!q.is_idle());
    assert!(q.describe_state().contains("active="));
}

// ---- Skip policy and stats ----

struct Restricted;

impl PackageState for Restricted {
    fn is_background_restricted(&self, package: &str, _uid: Uid) -> bool {
        package == "com.a"
    }
}

#[tokio::test(start_paused = true)]
async fn test_background_restricted_receiver_counted() {
    let host = FakeHost::new();
    let (mut q, mut rx) = queue_with(&host, Arc::new(RuleSkipPolicy::new(Arc::new(Restricted))));

    q.enqueue(
        ordered(
            "PACKAGE_CHANGED",
            vec![manifest("com.a", APP_A).into(), manifest("com.b", APP_B).into()],
        )
        .with_caller("android", 1000, 1),
    );
    q.pump();

    // com.a skipped, com.b has no process and cannot be started
    assert_eq!(
        host.calls(),
        vec![Call::Start {
            process: "com.b".into()
        }]
    );
    assert_eq!(q.len(), 0);
    let h = last_history(&q);
    assert_eq!(h.manifest_skip_count, 1);
    assert_eq!(h.manifest_count, 1);

    let stats = q.stats();
    let violations = stats.get("PACKAGE_CHANGED", "com.a").expect("violation row");
    assert_eq!(violations.background_violations, 1);
    let sent = stats.get("PACKAGE_CHANGED", "android").expect("broadcast row");
    assert_eq!(sent.broadcasts, 1);
    assert_eq!(sent.receives, 1);
    assert_eq!(sent.skips, 1);
    assert!(kinds(&mut rx).contains(&EventKind::ReceiverSkipped));

    let taken = q.take_stats();
    assert!(!taken.is_empty());
    assert!(q.stats().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dump_serializes_queue_state() {
    let host = FakeHost::new();
    let (mut q, _rx) = queue(&host);

    let id = q.enqueue(ordered("DUMP", vec![registered(1, APP_A).into()])).id();
    q.pump();

    let dump = q.dump();
    assert_eq!(dump.active.as_ref().and_then(|a| a.id), Some(id));
    assert!(dump.ordered.is_empty());
    let json = dump.to_json().expect("dump serializes");
    assert!(json.contains("\"queue\": \"test\""));
    assert!(json.contains("\"action\": \"DUMP\""));
}

// ---- Package cleanup ----

#[tokio::test(start_paused = true)]
async fn test_cleanup_disabled_package_drops_queued_receivers() {
    let host = FakeHost::new();
    host.run_process(proc_a());
    host.run_process(proc_b());
    let (mut q, mut rx) = queue(&host);
    q.start_deferring(APP_B);

    // parked in the deferral table, active, and still in the backlog
    let w = q.enqueue(ordered("W", vec![manifest("com.b", APP_B).into()])).id();
    let x = q
        .enqueue(
            ordered(
                "X",
                vec![
                    manifest("com.a", APP_A).into(),
                    manifest("com.b", APP_B).into(),
                    manifest("com.a", APP_A).into(),
                ],
            )
            .with_result_to(result_target()),
        )
        .id();
    q.pump();
    let y = q.enqueue(ordered("Y", vec![manifest("com.b", APP_B).into()])).id();
    q.pump();
    assert_eq!(q.record(w).map(|r| r.deferred), Some(true));
    assert_eq!(q.active(), Some(x));
    let _ = kinds(&mut rx);

    assert!(!q.cleanup_disabled_package_receivers(Some("com.other"), None, 0));
    assert!(!q.cleanup_disabled_package_receivers(None, None, 1));
    let classes = vec!["com.b.Receiver".to_string()];
    assert!(q.cleanup_disabled_package_receivers(Some("com.b"), Some(&classes), 0));
    assert_eq!(
        kinds(&mut rx)
            .iter()
            .filter(|k| **k == EventKind::PackageReceiversRemoved)
            .count(),
        3
    );
    assert_eq!(q.record(x).map(|r| r.receivers().len()), Some(2));
    assert_eq!(q.record(y).map(|r| r.receivers().len()), Some(0));

    assert!(q.finish_receiver(FinishTarget::Process(101), FinishResult::default(), false));
    q.pump();
    assert!(q.finish_receiver(FinishTarget::Process(101), FinishResult::default(), false));
    q.pump();

    assert_eq!(q.len(), 0);
    assert!(!host.calls().iter().any(|c| is_schedule_to(c, 102)));
    assert_eq!(
        host.calls().iter().filter(|c| is_schedule_to(c, 101)).count(),
        2
    );
    assert_eq!(host.performed(), vec![rid(900)]);
}

// ---- Handle and actor ----

fn spawn(host: &FakeHost) -> super::QueueHandle {
    init_tracing();
    QueueBuilder::new("fg", BroadcastConstants::foreground(), host.host()).spawn()
}

#[tokio::test(start_paused = true)]
async fn test_handle_delivers_and_goes_idle() {
    let host = FakeHost::new();
    let handle = spawn(&host);
    let mut rx = handle.subscribe();

    handle
        .enqueue(BroadcastRecord::new(
            Intent::new("TICK"),
            vec![registered(1, APP_A).into()],
        ))
        .await
        .unwrap();
    handle.wait_for_idle().await.unwrap();

    assert_eq!(host.performed(), vec![rid(1)]);
    assert!(kinds(&mut rx).contains(&EventKind::Retired));
    assert_eq!(handle.dump().await.unwrap().total_retired, 1);
}

#[tokio::test(start_paused = true)]
async fn test_handle_wait_for_idle_sees_late_finish() {
    let host = FakeHost::new();
    let handle = spawn(&host);

    handle
        .enqueue(ordered("CHAIN", vec![registered(1, APP_A).into()]))
        .await
        .unwrap();

    let finisher = handle.clone();
    tokio::spawn(async move {
        time::sleep(ms(250)).await;
        finisher
            .finish_receiver(FinishTarget::Receiver(rid(1)), FinishResult::default(), false)
            .await
    });

    assert!(!handle.is_idle().await.unwrap());
    handle.wait_for_barrier().await.unwrap();
    assert!(handle.is_idle().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_handle_times_out_receiver() {
    let host = FakeHost::new();
    let handle = spawn(&host);

    handle
        .enqueue(ordered("SLOW", vec![registered_in(1, &proc_a()).into()]))
        .await
        .unwrap();
    handle.wait_for_idle().await.unwrap();

    assert!(host.calls().iter().any(|c| matches!(c, Call::Anr { pid: 101, .. })));
    let dump = handle.dump().await.unwrap();
    assert_eq!(dump.history[0].delivery, vec![DeliveryState::Timeout]);
}

#[tokio::test(start_paused = true)]
async fn test_handle_cleanup_package_drops_queued_receiver() {
    let host = FakeHost::new();
    host.run_process(proc_a());
    let handle = spawn(&host);

    handle
        .enqueue(ordered(
            "PKG",
            vec![manifest("com.a", APP_A).into(), manifest("com.b", APP_B).into()],
        ))
        .await
        .unwrap();
    assert!(handle
        .cleanup_disabled_package_receivers(Some("com.b"), None, 0)
        .await
        .unwrap());
    handle
        .finish_receiver(FinishTarget::Process(101), FinishResult::default(), false)
        .await
        .unwrap();
    handle.wait_for_idle().await.unwrap();

    assert!(!host.calls().iter().any(|c| matches!(c, Call::Start { .. })));
    let dump = handle.dump().await.unwrap();
    assert_eq!(dump.history[0].delivery, vec![DeliveryState::Delivered]);
}

#[tokio::test(start_paused = true)]
async fn test_handle_rejects_invalid_records() {
    let host = FakeHost::new();
    let handle = spawn(&host);

    let err = handle
        .enqueue(BroadcastRecord::new(Intent::new(""), Vec::new()))
        .await
        .unwrap_err();
    assert_eq!(err.as_label(), "queue_invalid_record");
}

#[tokio::test(start_paused = true)]
async fn test_handle_closed_after_shutdown() {
    let host = FakeHost::new();
    let handle = spawn(&host);

    handle.shutdown();
    while !handle.is_closed() {
        time::sleep(ms(1)).await;
    }
    let err = handle.is_idle().await.unwrap_err();
    assert!(matches!(err, QueueError::Closed { .. }));
}

struct Counter(Arc<AtomicUsize>);

#[async_trait]
impl Subscribe for Counter {
    async fn on_event(&self, event: &Event) {
        if event.kind == EventKind::Retired {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn name(&self) -> &'static str {
        "counter"
    }
}

#[tokio::test(start_paused = true)]
async fn test_builder_fans_out_to_subscribers() {
    let host = FakeHost::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let handle = QueueBuilder::new("fg", BroadcastConstants::foreground(), host.host())
        .with_subscribers(vec![Arc::new(Counter(Arc::clone(&seen)))])
        .spawn();

    for _ in 0..3 {
        handle
            .enqueue(BroadcastRecord::new(
                Intent::new("TICK"),
                vec![registered(1, APP_A).into()],
            ))
            .await
            .unwrap();
    }
    handle.wait_for_idle().await.unwrap();

    while seen.load(Ordering::SeqCst) < 3 {
        time::sleep(ms(10)).await;
    }
    handle.shutdown();
}
