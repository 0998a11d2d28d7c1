//! The stage chain seen from the protocol stage, and its terminal end.
//!
//! The protocol stage talks to the rest of the pipeline only through
//! [`StageChain`]. [`PipelineRoot`] is the minimal chain this crate ships: it
//! hands finished operations and incoming events to user code on the callback
//! context and publishes connectivity on a watch channel.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    dispatch::{panic_message, ContextId, Cx, Dispatcher},
    error::Error,
    operation::{Event, Operation},
    state::ConnectionState,
    unhandled::UnhandledFailures,
};

/// Handler for events that reach the top of the pipeline.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync + 'static>;

/// Services the surrounding pipeline provides to a stage.
///
/// Every method must be called on the pipeline context.
pub trait StageChain: Send + Sync {
    /// Finishes `op`; its callback runs with the recorded outcome.
    fn complete_op(&self, cx: &Cx, op: Operation);

    /// Hands an operation this stage does not handle to the next stage down.
    fn pass_op_to_next_stage(&self, cx: &Cx, op: Operation);

    /// Hands an event to the stage above.
    fn pass_event_to_previous_stage(&self, cx: &Cx, event: Event);

    /// Tells every stage above that the connection is up.
    fn on_connected(&self, cx: &Cx);

    /// Tells every stage above that the connection is down.
    fn on_disconnected(&self, cx: &Cx);
}

/// Terminal stage chain.
pub struct PipelineRoot {
    dispatcher: Dispatcher,
    unhandled: UnhandledFailures,
    on_event: Option<EventHandler>,
    state_tx: watch::Sender<ConnectionState>,
}

impl PipelineRoot {
    pub fn new(
        dispatcher: Dispatcher,
        unhandled: UnhandledFailures,
        on_event: Option<EventHandler>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            dispatcher,
            unhandled,
            on_event,
            state_tx,
        }
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!("Connection state changed: {} -> {}", previous, state);
        }
    }

    /// Runs user code on the callback context, reporting a panic to the
    /// unhandled-failure sink.
    fn run_user_code(&self, cx: &Cx, what: String, f: impl FnOnce() + Send + 'static) {
        let unhandled = self.unhandled.clone();
        let _ = self.dispatcher.run_async(cx, ContextId::Callback, move |_| {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                unhandled.report(Error::pipeline(format!(
                    "{} panicked: {}",
                    what,
                    panic_message(&*payload)
                )));
            }
        });
    }
}

impl StageChain for PipelineRoot {
    fn complete_op(&self, cx: &Cx, op: Operation) {
        cx.assert_on(ContextId::Pipeline);

        let name = op.name();
        let id = op.id();
        let (callback, outcome) = op.finish();
        match &outcome {
            Ok(()) => debug!("{}[{}]: completed", name, id),
            Err(e) => debug!("{}[{}]: completed with error: {}", name, id, e),
        }

        match callback {
            Some(callback) => self.run_user_code(
                cx,
                format!("completion callback of {name}[{id}]"),
                move || callback(outcome),
            ),
            None => {
                if let Err(e) = outcome {
                    self.unhandled.report(e);
                }
            }
        }
    }

    fn pass_op_to_next_stage(&self, cx: &Cx, mut op: Operation) {
        cx.assert_on(ContextId::Pipeline);
        warn!("{}[{}]: reached the end of the pipeline unhandled", op.name(), op.id());
        op.set_error(Error::pipeline(format!(
            "{} not handled by any stage in the pipeline",
            op.name()
        )));
        self.complete_op(cx, op);
    }

    fn pass_event_to_previous_stage(&self, cx: &Cx, event: Event) {
        cx.assert_on(ContextId::Pipeline);
        match &self.on_event {
            Some(handler) => {
                let handler = Arc::clone(handler);
                self.run_user_code(cx, format!("{} event handler", event.name()), move || {
                    handler(event)
                });
            }
            None => warn!("{} event dropped: no event handler registered", event.name()),
        }
    }

    fn on_connected(&self, cx: &Cx) {
        cx.assert_on(ContextId::Pipeline);
        self.set_state(ConnectionState::Connected);
    }

    fn on_disconnected(&self, cx: &Cx) {
        cx.assert_on(ContextId::Pipeline);
        self.set_state(ConnectionState::Disconnected);
    }
}
