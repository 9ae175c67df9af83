//! Control loop (§4.4): the single writer to the FSM. Drains the bounded
//! control queue (priority) before dispatching the single latest scale
//! sample, so high-rate sample bursts can never starve batch-lifecycle or
//! printer-ack events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::{mpsc, watch, Notify};
use tracing::{info, info_span, warn, Instrument};
use weigh_core::fsm::{Action, Event, Fsm};
use weigh_core::model::{MonoSeconds, PauseReason};

struct SampleSlot {
    value: Mutex<Option<(f64, MonoSeconds)>>,
    notify: Notify,
}

impl SampleSlot {
    fn new() -> Self {
        SampleSlot {
            value: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    fn update(&self, value: f64, now: MonoSeconds) {
        *self.value.lock().expect("sample slot poisoned") = Some((value, now));
        self.notify.notify_one();
    }

    fn take(&self) -> Option<(f64, MonoSeconds)> {
        self.value.lock().expect("sample slot poisoned").take()
    }
}

/// Handle shared with the scale driver and the HTTP/CLI control surface
/// (§6's `update_latest_sample` / `enqueue_control` contracts).
#[derive(Clone)]
pub struct ControlHandle {
    control_tx: mpsc::Sender<Event>,
    sample_slot: std::sync::Arc<SampleSlot>,
    overflowed: std::sync::Arc<AtomicBool>,
}

impl ControlHandle {
    /// Returns `false` on overflow; the loop itself will push a
    /// `Pause(CONTROL_QUEUE_OVERFLOW)` into the FSM on its next wake.
    pub fn enqueue_control(&self, event: Event) -> bool {
        match self.control_tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.overflowed.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    /// Never blocks; overwrites whatever sample is currently pending.
    pub fn update_latest_sample(&self, value: f64, now: MonoSeconds) {
        self.sample_slot.update(value, now);
    }
}

pub struct ControlLoop {
    device_id: String,
    control_rx: mpsc::Receiver<Event>,
    sample_slot: std::sync::Arc<SampleSlot>,
    overflowed: std::sync::Arc<AtomicBool>,
    fsm: Fsm,
    action_tx: mpsc::Sender<Action>,
    shutdown: watch::Receiver<bool>,
}

impl ControlLoop {
    pub fn new(
        device_id: String,
        fsm: Fsm,
        control_capacity: usize,
        action_tx: mpsc::Sender<Action>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, ControlHandle) {
        let (control_tx, control_rx) = mpsc::channel(control_capacity);
        let sample_slot = std::sync::Arc::new(SampleSlot::new());
        let overflowed = std::sync::Arc::new(AtomicBool::new(false));
        let handle = ControlHandle {
            control_tx,
            sample_slot: sample_slot.clone(),
            overflowed: overflowed.clone(),
        };
        (
            ControlLoop {
                device_id,
                control_rx,
                sample_slot,
                overflowed,
                fsm,
                action_tx,
                shutdown,
            },
            handle,
        )
    }

    pub async fn run(mut self) {
        let span = info_span!("device", device_id = %self.device_id);
        async move {
            loop {
                if *self.shutdown.borrow() {
                    break;
                }

                if self.overflowed.swap(false, Ordering::SeqCst) {
                    warn!("control queue overflow; pausing FSM");
                    self.dispatch(Event::Pause(PauseReason::ControlQueueOverflow)).await;
                    continue;
                }

                tokio::select! {
                    _ = self.shutdown.changed() => {
                        if *self.shutdown.borrow() {
                            break;
                        }
                    }
                    maybe_event = self.control_rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                self.dispatch(event).await;
                                while let Ok(event) = self.control_rx.try_recv() {
                                    self.dispatch(event).await;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = self.sample_slot.notify.notified() => {
                        if self.control_rx.is_empty() {
                            if let Some((value, now)) = self.sample_slot.take() {
                                self.dispatch(Event::Sample { value, now }).await;
                            }
                        }
                    }
                }
            }
            info!("control loop shut down");
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&mut self, event: Event) {
        for action in self.fsm.apply(event) {
            if matches!(action, Action::Pause(_)) {
                warn!(?action, "fsm paused");
            }
            if self.action_tx.send(action).await.is_err() {
                warn!("action channel closed; dropping fsm action");
            }
        }
    }
}
