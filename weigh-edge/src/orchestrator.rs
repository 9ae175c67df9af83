//! Orchestrator (§4.4): translates `PrintRequested` FSM actions into
//! outbox transactions, and reports backpressure/storage failures back to
//! the control loop as `Pause` events.

use std::sync::Arc;

use tracing::{error, warn};
use weigh_core::fsm::{Action, Event, PrintIntent};
use weigh_core::model::{CompletionMode, PauseReason, WeighEvent};
use weigh_core::payload;
use weigh_core::store::Store;
use weigh_core::Error as CoreError;

use crate::control_loop::ControlHandle;

pub struct Orchestrator {
    action_rx: tokio::sync::mpsc::Receiver<Action>,
    store: Arc<dyn Store>,
    control: ControlHandle,
    max_erp_queue: u64,
}

impl Orchestrator {
    pub fn new(
        action_rx: tokio::sync::mpsc::Receiver<Action>,
        store: Arc<dyn Store>,
        control: ControlHandle,
        max_erp_queue: u64,
    ) -> Self {
        Orchestrator {
            action_rx,
            store,
            control,
            max_erp_queue,
        }
    }

    pub async fn run(mut self) {
        while let Some(action) = self.action_rx.recv().await {
            match action {
                Action::PrintRequested(intent) => self.handle_print_requested(intent).await,
                Action::Pause(reason) => {
                    warn!(?reason, "fsm-originated pause observed by orchestrator");
                }
            }
        }
    }

    async fn handle_print_requested(&self, intent: PrintIntent) {
        match self.store.count_pending_erp().await {
            Ok(n) if n >= self.max_erp_queue => {
                warn!(pending = n, limit = self.max_erp_queue, "erp outbox backpressure");
                self.control
                    .enqueue_control(Event::Pause(PauseReason::ErpBackpressure));
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to read erp outbox depth");
                self.control.enqueue_control(Event::Pause(PauseReason::DbError));
                return;
            }
            Ok(_) => {}
        }

        let state = match self
            .store
            .get_batch_state(&intent.device_id, &intent.batch_id)
            .await
        {
            Ok(Some(state)) => state,
            Ok(None) => {
                error!(
                    device_id = %intent.device_id,
                    batch_id = %intent.batch_id,
                    "missing batch_state at allocation time"
                );
                self.control.enqueue_control(Event::Pause(PauseReason::DbError));
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to read batch_state");
                self.control.enqueue_control(Event::Pause(PauseReason::DbError));
                return;
            }
        };

        let now = chrono::Utc::now().timestamp_millis();
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

        let result = self
            .store
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

        match result {
            Ok(_seq) => {
                self.control.enqueue_control(Event::PrintEnqueued(intent.event_id));
            }
            // A duplicate here means this event_id was already committed by
            // an earlier run (crash between commit and the FSM observing
            // `PrintEnqueued`) — idempotent restart, not a failure (§8
            // scenario 6).
            Err(CoreError::Duplicate(_)) => {
                self.control.enqueue_control(Event::PrintEnqueued(intent.event_id));
            }
            Err(e) => {
                error!(error = %e, event_id = %intent.event_id, "allocate_and_enqueue failed");
                self.control.enqueue_control(Event::Pause(PauseReason::DbError));
            }
        }
    }
}
