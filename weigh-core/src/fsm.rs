//! Batch-weigh finite-state machine (§4.2).
//!
//! Owns all in-memory per-device state (`current_event_id`, `lock_weight`,
//! `print_sent`, `pending_product`) plus the device's [`Detector`]. The
//! control loop is the sole caller of [`Fsm::apply`]; no other task may
//! synthesise a transition (§9 "Concurrency model").

use crate::detector::{Calibration, Detector};
use crate::model::{BatchId, DeviceId, EventId, MonoSeconds, PauseReason, ProductId};

/// Timing/threshold parameters, §4.2. Defaults match the spec's literals;
/// callers may override from `Config` for testing.
#[derive(Clone, Copy, Debug)]
pub struct FsmParams {
    pub t_settle: f64,
    pub t_clear: f64,
    pub n_min: u64,
}

impl Default for FsmParams {
    fn default() -> Self {
        FsmParams {
            t_settle: 0.50,
            t_clear: 0.70,
            n_min: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    WaitEmpty,
    Loading,
    Settling,
    Locked,
    Printing,
    PostGuard,
    Paused,
}

/// Inputs the control loop feeds to the FSM.
#[derive(Clone, Debug)]
pub enum Event {
    BatchStart {
        batch_id: BatchId,
        product_id: ProductId,
    },
    BatchStop,
    ProductSwitch(ProductId),
    Sample {
        value: f64,
        now: MonoSeconds,
    },
    /// Orchestrator confirms the outbox transaction committed for this event.
    PrintEnqueued(EventId),
    PrinterReceived,
    PrinterCompleted,
    ScanRecon,
    /// A worker or the control loop itself is pushing the FSM into `PAUSED`.
    Pause(PauseReason),
    ReasonCleared(PauseReason),
}

/// A request to mint an outbox transaction, emitted exactly once per
/// `event_id` on the `SETTLING`→`LOCKED` transition (§4.2 contract).
#[derive(Clone, Debug, PartialEq)]
pub struct PrintIntent {
    pub event_id: EventId,
    pub device_id: DeviceId,
    pub batch_id: BatchId,
    pub product_id: ProductId,
    pub weight: f64,
    pub ts: MonoSeconds,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    PrintRequested(PrintIntent),
    Pause(PauseReason),
}

pub struct Fsm {
    device_id: DeviceId,
    params: FsmParams,
    state: State,
    active_batch: Option<BatchId>,
    active_product: Option<ProductId>,
    pending_product: Option<ProductId>,
    current_event_id: Option<EventId>,
    lock_weight: f64,
    print_sent: bool,
    pause_reason: Option<PauseReason>,
    loading_entered_at: MonoSeconds,
    below_empty_since: Option<MonoSeconds>,
    /// Sticky: true once the pan has been below `EMPTY_THRESH` continuously
    /// for at least `T_CLEAR`; reset the instant a sample rises back above
    /// threshold. `ReasonCleared` has no timestamp of its own, so it reads
    /// this instead of recomputing a duration.
    pan_cleared_sustained: bool,
    detector: Detector,
}

impl Fsm {
    pub fn new(device_id: DeviceId, calibration: Calibration, params: FsmParams) -> Self {
        Fsm {
            device_id,
            params,
            state: State::WaitEmpty,
            active_batch: None,
            active_product: None,
            pending_product: None,
            current_event_id: None,
            lock_weight: 0.0,
            print_sent: false,
            pause_reason: None,
            loading_entered_at: 0.0,
            below_empty_since: None,
            pan_cleared_sustained: false,
            detector: Detector::new(calibration),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn pause_reason(&self) -> Option<PauseReason> {
        self.pause_reason
    }

    pub fn active_product(&self) -> Option<&ProductId> {
        self.active_product.as_ref()
    }

    pub fn active_batch(&self) -> Option<&BatchId> {
        self.active_batch.as_ref()
    }

    pub fn current_event_id(&self) -> Option<&EventId> {
        self.current_event_id.as_ref()
    }

    fn below_empty_duration(&self, now: MonoSeconds) -> f64 {
        match self.below_empty_since {
            Some(since) => now - since,
            None => 0.0,
        }
    }

    fn track_empty(&mut self, value: f64, now: MonoSeconds) {
        if value < self.detector.calibration().empty_thresh {
            let since = *self.below_empty_since.get_or_insert(now);
            if now - since >= self.params.t_clear {
                self.pan_cleared_sustained = true;
            }
        } else {
            self.below_empty_since = None;
            self.pan_cleared_sustained = false;
        }
    }

    fn enter_wait_empty(&mut self) {
        self.state = State::WaitEmpty;
        self.current_event_id = None;
        self.print_sent = false;
        self.pause_reason = None;
        if let Some(p) = self.pending_product.take() {
            self.active_product = Some(p);
        }
    }

    fn enter_paused(&mut self, reason: PauseReason) -> Vec<Action> {
        self.state = State::Paused;
        self.pause_reason = Some(reason);
        vec![Action::Pause(reason)]
    }

    /// Apply one event, returning zero or more actions for the orchestrator
    /// / workers to act on.
    pub fn apply(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::BatchStart {
                batch_id,
                product_id,
            } => {
                self.active_batch = Some(batch_id);
                self.pending_product = None;
                self.active_product = Some(product_id);
                if self.state == State::Paused
                    && self.pause_reason == Some(PauseReason::BatchStop)
                {
                    self.enter_wait_empty();
                }
                vec![]
            }
            Event::ProductSwitch(product_id) => {
                match self.state {
                    State::WaitEmpty => self.active_product = Some(product_id),
                    _ => self.pending_product = Some(product_id),
                }
                vec![]
            }
            Event::BatchStop => self.enter_paused(PauseReason::BatchStop),
            Event::Sample { value, now } => self.on_sample(value, now),
            Event::PrintEnqueued(event_id) => {
                if self.state == State::Locked && self.current_event_id.as_deref() == Some(event_id.as_str()) {
                    self.print_sent = true;
                    self.state = State::Printing;
                }
                vec![]
            }
            Event::PrinterReceived => vec![],
            Event::PrinterCompleted | Event::ScanRecon => {
                if self.state == State::Printing {
                    self.state = State::PostGuard;
                }
                vec![]
            }
            Event::Pause(reason) => self.enter_paused(reason),
            Event::ReasonCleared(reason) => self.on_reason_cleared(reason),
        }
    }

    fn on_sample(&mut self, value: f64, now: MonoSeconds) -> Vec<Action> {
        self.detector.update(now, value);
        self.track_empty(value, now);

        match self.state {
            State::WaitEmpty => {
                if value >= self.detector.calibration().placement_min {
                    self.detector.reset();
                    self.detector.update(now, value);
                    self.print_sent = false;
                    self.current_event_id = None;
                    self.state = State::Loading;
                    self.loading_entered_at = now;
                }
                vec![]
            }
            State::Loading => {
                if self.below_empty_duration(now) >= self.params.t_clear {
                    self.detector.reset();
                    self.enter_wait_empty();
                    return vec![];
                }
                if now - self.loading_entered_at >= self.params.t_settle
                    && self.detector.sample_count() >= self.params.n_min
                {
                    self.state = State::Settling;
                }
                vec![]
            }
            State::Settling => {
                if self.below_empty_duration(now) >= self.params.t_clear {
                    self.detector.reset();
                    self.enter_wait_empty();
                    return vec![];
                }
                if self.detector.stable() {
                    self.lock_weight = self.detector.mean();
                    self.current_event_id = Some(crate::model::new_opaque_id());
                    self.print_sent = false;
                    self.state = State::Locked;
                    let intent = PrintIntent {
                        event_id: self.current_event_id.clone().unwrap(),
                        device_id: self.device_id.clone(),
                        batch_id: self.active_batch.clone().unwrap_or_default(),
                        product_id: self.active_product.clone().unwrap_or_default(),
                        weight: self.lock_weight,
                        ts: now,
                    };
                    return vec![Action::PrintRequested(intent)];
                }
                vec![]
            }
            State::Locked => {
                let limit = self.detector.calibration().change_limit(self.lock_weight);
                if (value - self.lock_weight).abs() > limit {
                    if self.print_sent {
                        return self.enter_paused(PauseReason::ReweighRequired);
                    }
                    self.detector.reset();
                    self.detector.update(now, value);
                    self.state = State::Settling;
                }
                vec![]
            }
            State::Printing => {
                let limit = self.detector.calibration().change_limit(self.lock_weight);
                if (value - self.lock_weight).abs() > limit {
                    return self.enter_paused(PauseReason::ReweighRequired);
                }
                vec![]
            }
            State::PostGuard => {
                if self.below_empty_duration(now) >= self.params.t_clear {
                    self.enter_wait_empty();
                }
                vec![]
            }
            State::Paused => vec![],
        }
    }

    fn on_reason_cleared(&mut self, reason: PauseReason) -> Vec<Action> {
        if self.state != State::Paused || self.pause_reason != Some(reason) {
            return vec![];
        }
        if reason.requires_clear_before_resume() && !self.pan_cleared_sustained {
            return vec![];
        }
        self.enter_wait_empty();
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calib() -> Calibration {
        let samples: Vec<(f64, f64)> = (0..50).map(|i| (i as f64 * 0.1, 0.0)).collect();
        Calibration::from_empty_pan_log(&samples, 0.05).unwrap()
    }

    fn fsm() -> Fsm {
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

    #[test]
    fn one_placement_emits_exactly_one_print_requested() {
        let mut f = fsm();
        // Empty pan for a while, not yet loading.
        let (t, _) = run_placement(&mut f, 0.0, 0.0, 1.0, 0.1);
        let (_t, actions) = run_placement(&mut f, 5.0, t, 5.0, 0.1);
        let print_requests: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, Action::PrintRequested(_)))
            .collect();
        assert_eq!(print_requests.len(), 1);
        assert_eq!(f.state(), State::Locked);
    }

    #[test]
    fn product_switch_during_loading_is_queued_until_pan_clears() {
        let mut f = fsm();
        let (t, _) = run_placement(&mut f, 2.0, 0.0, 0.3, 0.1);
        assert_eq!(f.state(), State::Loading);
        f.apply(Event::ProductSwitch("prod-b".into()));
        assert_eq!(f.active_product(), Some(&"prod-a".to_string()));
        // Pan clears for T_CLEAR.
        let (_t, _) = run_placement(&mut f, 0.0, t, 0.9, 0.1);
        assert_eq!(f.state(), State::WaitEmpty);
        assert_eq!(f.active_product(), Some(&"prod-b".to_string()));
    }

    #[test]
    fn reweigh_after_print_sent_pauses_without_new_event_id() {
        let mut f = fsm();
        let (t, _) = run_placement(&mut f, 5.0, 0.0, 1.0, 0.1);
        let (_t2, actions) = run_placement(&mut f, 5.0, t, 5.0, 0.1);
        assert_eq!(f.state(), State::Locked);
        let event_id = f.current_event_id().cloned().unwrap();
        f.apply(Event::PrintEnqueued(event_id.clone()));
        assert_eq!(f.state(), State::Printing);
        let step_actions = f.apply(Event::Sample {
            value: 5.5,
            now: 100.0,
        });
        assert_eq!(f.state(), State::Paused);
        assert_eq!(f.pause_reason(), Some(PauseReason::ReweighRequired));
        assert_eq!(f.current_event_id(), Some(&event_id));
        assert!(step_actions
            .iter()
            .any(|a| matches!(a, Action::Pause(PauseReason::ReweighRequired))));
        let _ = actions;
    }

    #[test]
    fn printer_completed_moves_to_post_guard_then_wait_empty_after_clear() {
        let mut f = fsm();
        let (t, _) = run_placement(&mut f, 5.0, 0.0, 1.0, 0.1);
        let (t2, _) = run_placement(&mut f, 5.0, t, 5.0, 0.1);
        let event_id = f.current_event_id().cloned().unwrap();
        f.apply(Event::PrintEnqueued(event_id));
        f.apply(Event::PrinterReceived);
        f.apply(Event::PrinterCompleted);
        assert_eq!(f.state(), State::PostGuard);
        let (_t3, _) = run_placement(&mut f, 0.0, t2, 0.9, 0.1);
        assert_eq!(f.state(), State::WaitEmpty);
    }

    #[test]
    fn paused_with_reweigh_required_needs_pan_clear_before_reason_cleared_is_honored() {
        let mut f = fsm();
        let (t, _) = run_placement(&mut f, 5.0, 0.0, 1.0, 0.1);
        run_placement(&mut f, 5.0, t, 5.0, 0.1);
        let event_id = f.current_event_id().cloned().unwrap();
        f.apply(Event::PrintEnqueued(event_id));
        f.apply(Event::Sample {
            value: 6.0,
            now: 1000.0,
        });
        assert_eq!(f.pause_reason(), Some(PauseReason::ReweighRequired));
        f.apply(Event::ReasonCleared(PauseReason::ReweighRequired));
        assert_eq!(f.state(), State::Paused, "must stay paused until pan clears");
        run_placement(&mut f, 0.0, 1000.0, 0.9, 0.1);
        f.apply(Event::ReasonCleared(PauseReason::ReweighRequired));
        assert_eq!(f.state(), State::WaitEmpty);
    }
}
