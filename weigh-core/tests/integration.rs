//! End-to-end coverage of the FSM, outbox store, and payload pipeline
//! wired together the way `weigh-edge`'s control loop + orchestrator do,
//! without the async worker tasks themselves. Mirrors §8's concrete
//! scenarios.

use weigh_core::detector::Calibration;
use weigh_core::fsm::{Action, Event, Fsm, FsmParams, State};
use weigh_core::model::{CompletionMode, JobKind, JobStatus, PauseReason, WeighEvent};
use weigh_core::payload;
use weigh_core::store::{MemoryStore, Store};
use weigh_core::Error;

fn calib() -> Calibration {
    let samples: Vec<(f64, f64)> = (0..50).map(|i| (i as f64 * 0.1, 0.0)).collect();
    Calibration::from_empty_pan_log(&samples, 0.05).unwrap()
}

fn new_fsm() -> Fsm {
    let mut f = Fsm::new("dev-1".to_string(), calib(), FsmParams::default());
    f.apply(Event::BatchStart {
        batch_id: "batch-1".into(),
        product_id: "prod-a".into(),
    });
    f
}

fn run_placement(f: &mut Fsm, weight: f64, mut t: f64, duration: f64, dt: f64) -> (f64, Vec<Action>) {
    let mut actions = vec![];
    let end = t + duration;
    while t < end {
        t += dt;
        actions.extend(f.apply(Event::Sample { value: weight, now: t }));
    }
    (t, actions)
}

/// Stand-in for `Orchestrator::handle_print_requested`: allocates the next
/// `seq`, canonicalizes the payload, and writes the paired outbox rows.
async fn enqueue_print(store: &MemoryStore, f: &mut Fsm, intent: &weigh_core::fsm::PrintIntent, now: i64) -> Result<u64, Error> {
    let state = store
        .get_batch_state(&intent.device_id, &intent.batch_id)
        .await
        .unwrap()
        .expect("batch_state present");
    let event = WeighEvent {
        event_id: intent.event_id.clone(),
        device_id: intent.device_id.clone(),
        batch_id: intent.batch_id.clone(),
        product_id: intent.product_id.clone(),
        seq: state.next_seq,
        weight: intent.weight,
        ts: intent.ts,
    };
    let canonical = payload::canonicalize(&event);
    let result = store
        .allocate_and_enqueue(
            &intent.device_id,
            &intent.batch_id,
            &intent.event_id,
            &canonical.json,
            &canonical.hash_hex,
            CompletionMode::StatusQuery,
            now,
        )
        .await;
    match &result {
        Ok(_) => {
            f.apply(Event::PrintEnqueued(intent.event_id.clone()));
        }
        // Idempotent restart (§8 scenario 6): the row already exists from an
        // earlier run. The FSM still observes `PrintEnqueued` so it advances
        // past `LOCKED` exactly as if this were the first attempt.
        Err(Error::Duplicate(_)) => {
            f.apply(Event::PrintEnqueued(intent.event_id.clone()));
        }
        Err(_) => {}
    }
    result
}

fn only_print_requested(actions: &[Action]) -> Option<&weigh_core::fsm::PrintIntent> {
    actions.iter().find_map(|a| match a {
        Action::PrintRequested(intent) => Some(intent),
        _ => None,
    })
}

#[tokio::test]
async fn one_placement_produces_matching_print_and_erp_rows() {
    let store = MemoryStore::new();
    store
        .start_batch(&"dev-1".into(), &"batch-1".into(), &"prod-a".into(), 1)
        .await
        .unwrap();

    let mut f = new_fsm();
    let (t, _) = run_placement(&mut f, 0.0, 0.0, 1.0, 0.1);
    let (t, actions) = run_placement(&mut f, 5.0, t, 5.0, 0.1);
    let intent = only_print_requested(&actions).expect("one PrintRequested").clone();

    let seq = enqueue_print(&store, &mut f, &intent, 10).await.unwrap();
    assert_eq!(seq, 1);
    assert_eq!(f.state(), State::Printing);

    assert_eq!(
        store.get_status(JobKind::Print, &intent.event_id).await.unwrap(),
        Some(JobStatus::New)
    );
    assert_eq!(
        store.get_status(JobKind::Erp, &intent.event_id).await.unwrap(),
        Some(JobStatus::New)
    );

    // Printer ack sequence, as the print worker would drive it.
    store
        .mark_status(JobKind::Print, &intent.event_id, JobStatus::Received, 11)
        .await
        .unwrap();
    f.apply(Event::PrinterReceived);
    store
        .mark_status(JobKind::Print, &intent.event_id, JobStatus::Completed, 12)
        .await
        .unwrap();
    store
        .mark_status(JobKind::Print, &intent.event_id, JobStatus::Done, 12)
        .await
        .unwrap();
    f.apply(Event::PrinterCompleted);
    assert_eq!(f.state(), State::PostGuard);

    let (_t, _) = run_placement(&mut f, 0.0, t, 0.9, 0.1);
    assert_eq!(f.state(), State::WaitEmpty);
}

#[tokio::test]
async fn product_switch_during_loading_is_queued_until_pan_clears() {
    let mut f = new_fsm();
    let (t, _) = run_placement(&mut f, 2.0, 0.0, 0.3, 0.1);
    assert_eq!(f.state(), State::Loading);
    f.apply(Event::ProductSwitch("prod-b".into()));
    assert_eq!(f.active_product(), Some(&"prod-a".to_string()));
    let (_t, _) = run_placement(&mut f, 0.0, t, 0.9, 0.1);
    assert_eq!(f.state(), State::WaitEmpty);
    assert_eq!(f.active_product(), Some(&"prod-b".to_string()));
}

#[tokio::test]
async fn idempotent_restart_reinserts_without_duplicating_outbox_rows() {
    let store = MemoryStore::new();
    store
        .start_batch(&"dev-1".into(), &"batch-1".into(), &"prod-a".into(), 1)
        .await
        .unwrap();

    let mut f = new_fsm();
    let (t, _) = run_placement(&mut f, 0.0, 0.0, 1.0, 0.1);
    let (_t, actions) = run_placement(&mut f, 5.0, t, 5.0, 0.1);
    let intent = only_print_requested(&actions).expect("one PrintRequested").clone();

    let seq = enqueue_print(&store, &mut f, &intent, 10).await.unwrap();
    assert_eq!(seq, 1);
    assert_eq!(f.state(), State::Printing);

    // Simulate a crash right after commit, before the FSM's next event is
    // durably observed elsewhere, then a restart that replays the same
    // `PrintRequested` intent.
    let replay = enqueue_print(&store, &mut f, &intent, 20).await;
    assert!(matches!(replay, Err(Error::Duplicate(_))));

    // Exactly one row per table; `next_seq` did not advance a second time.
    assert_eq!(store.count_pending_erp().await.unwrap(), 1);
    let state = store
        .get_batch_state(&"dev-1".into(), &"batch-1".into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.next_seq, 2);
}

#[tokio::test]
async fn erp_gates_on_print_completion() {
    let store = MemoryStore::new();
    store
        .start_batch(&"dev-1".into(), &"batch-1".into(), &"prod-a".into(), 1)
        .await
        .unwrap();

    let mut f = new_fsm();
    let (t, _) = run_placement(&mut f, 0.0, 0.0, 1.0, 0.1);
    let (_t, actions) = run_placement(&mut f, 5.0, t, 5.0, 0.1);
    let intent = only_print_requested(&actions).expect("one PrintRequested").clone();
    enqueue_print(&store, &mut f, &intent, 10).await.unwrap();

    let print_status = store
        .get_status(JobKind::Print, &intent.event_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!print_status.gates_erp_send());

    store
        .mark_status(JobKind::Print, &intent.event_id, JobStatus::Completed, 11)
        .await
        .unwrap();
    let print_status = store
        .get_status(JobKind::Print, &intent.event_id)
        .await
        .unwrap()
        .unwrap();
    assert!(print_status.gates_erp_send());
}

#[tokio::test]
async fn rfid_unknown_falls_back_to_scan_recon_and_still_completes_the_placement() {
    let store = MemoryStore::new();
    store
        .start_batch(&"dev-1".into(), &"batch-1".into(), &"prod-a".into(), 1)
        .await
        .unwrap();

    let mut f = new_fsm();
    let (t, _) = run_placement(&mut f, 0.0, 0.0, 1.0, 0.1);
    let (t, actions) = run_placement(&mut f, 5.0, t, 5.0, 0.1);
    let intent = only_print_requested(&actions).expect("one PrintRequested").clone();
    enqueue_print(&store, &mut f, &intent, 10).await.unwrap();
    f.apply(Event::PrinterReceived);

    // Printer finished the job buffer but could not resolve the RFID tag.
    store
        .update_completion_mode(&intent.event_id, CompletionMode::ScanRecon, 11)
        .await
        .unwrap();
    store
        .mark_status(JobKind::Print, &intent.event_id, JobStatus::Completed, 11)
        .await
        .unwrap();
    f.apply(Event::ScanRecon);
    assert_eq!(f.state(), State::PostGuard);

    let (_t, _) = run_placement(&mut f, 0.0, t, 0.9, 0.1);
    assert_eq!(f.state(), State::WaitEmpty);

    assert_eq!(
        store.get_status(JobKind::Print, &intent.event_id).await.unwrap(),
        Some(JobStatus::Completed)
    );
}

#[tokio::test]
async fn pause_on_erp_backpressure_does_not_touch_the_outbox() {
    // Mirrors the orchestrator's backpressure check: when pending ERP jobs
    // are at the configured limit, the orchestrator must refuse to enqueue
    // and instead push the FSM into `PAUSED[ERP_BACKPRESSURE]` (§7).
    let store = MemoryStore::new();
    store
        .start_batch(&"dev-1".into(), &"batch-1".into(), &"prod-a".into(), 1)
        .await
        .unwrap();

    let mut f = new_fsm();
    let (t, _) = run_placement(&mut f, 0.0, 0.0, 1.0, 0.1);
    let (_t, actions) = run_placement(&mut f, 5.0, t, 5.0, 0.1);
    let intent = only_print_requested(&actions).expect("one PrintRequested").clone();

    let max_erp_queue: u64 = 0;
    let pending = store.count_pending_erp().await.unwrap();
    assert!(pending >= max_erp_queue);
    let step_actions = f.apply(Event::Pause(PauseReason::ErpBackpressure));
    assert_eq!(f.state(), State::Paused);
    assert_eq!(f.pause_reason(), Some(PauseReason::ErpBackpressure));
    assert!(step_actions
        .iter()
        .any(|a| matches!(a, Action::Pause(PauseReason::ErpBackpressure))));

    // No row was ever written for this placement.
    assert_eq!(
        store.get_status(JobKind::Print, &intent.event_id).await.unwrap(),
        None
    );
}
