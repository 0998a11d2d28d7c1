//! The protocol stage: the innermost pipeline stage, owning the protocol
//! session and its connection lifecycle.
//!
//! All state lives in an [`Affine`] cell bound to the pipeline context. The
//! stage never calls into the chain while that cell is borrowed, so chain
//! callbacks that come back into the stage cannot trip the re-entrancy check.
//!
//! At most one connect-class operation (Connect, Reconnect) and one
//! Disconnect are tracked at a time. A new one of either class supersedes
//! both: the old operations fail with a Pipeline error and the new one takes
//! its slot. The session call behind a superseded operation is not aborted;
//! when its callback arrives the slot is empty or belongs to the newer
//! operation.
//!
//! Publish, Subscribe and Unsubscribe are not slot tracked. Any number can be
//! waiting for their acknowledgement.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use super::{
    chain::StageChain,
    dispatch::{Affine, ContextId, Cx, Dispatcher},
    error::{Error, ErrorKind},
    operation::{ConnectionArgs, Credential, Event, OpKind, Operation},
    session::{AckCallback, ProtocolSession, SessionFactory, SessionHandlers},
    unhandled::UnhandledFailures,
};

#[derive(Default)]
struct SessionState {
    args: Option<ConnectionArgs>,
    credential: Option<Credential>,
    session: Option<Box<dyn ProtocolSession>>,
    active_connect: Option<Operation>,
    active_disconnect: Option<Operation>,
    awaiting_ack: HashMap<u64, Operation>,
}

impl SessionState {
    fn token(&self) -> Option<&str> {
        match &self.credential {
            Some(Credential::SasToken(token)) => Some(token.as_str()),
            _ => None,
        }
    }
}

/// Which slot a connect-class or disconnect-class operation occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Connect,
    Disconnect,
}

pub struct ProtocolStage {
    name: String,
    chain: Arc<dyn StageChain>,
    dispatcher: Dispatcher,
    factory: Arc<dyn SessionFactory>,
    unhandled: UnhandledFailures,
    state: Affine<SessionState>,
    this: Weak<ProtocolStage>,
}

impl ProtocolStage {
    pub fn new(
        name: impl Into<String>,
        chain: Arc<dyn StageChain>,
        dispatcher: Dispatcher,
        factory: Arc<dyn SessionFactory>,
        unhandled: UnhandledFailures,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.into(),
            chain,
            dispatcher,
            factory,
            unhandled,
            state: Affine::new(ContextId::Pipeline, SessionState::default()),
            this: this.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handles one operation arriving from the stage above.
    pub fn run_op(&self, cx: &Cx, op: Operation) {
        cx.assert_on(ContextId::Pipeline);

        match op.kind() {
            OpKind::SetConnectionArgs(args) => {
                let args = args.clone();
                self.set_connection_args(cx, op, args);
            }
            OpKind::SetCredential(credential) => {
                let credential = credential.clone();
                self.set_credential(cx, op, credential);
            }
            OpKind::Connect => {
                info!("{}({}): connecting", self.name, op.name());
                self.start_connection_op(cx, op, Slot::Connect, |state| {
                    let password = state.token().map(str::to_owned);
                    let certificate = match &state.credential {
                        Some(Credential::Certificate(cert)) => Some(cert.clone()),
                        _ => None,
                    };
                    let session = session_mut(state, "Connect")?;
                    session.connect(password.as_deref(), certificate.as_ref())
                });
            }
            OpKind::Reconnect => {
                info!("{}({}): reconnecting", self.name, op.name());
                self.start_connection_op(cx, op, Slot::Connect, |state| {
                    let password = state.token().map(str::to_owned);
                    let session = session_mut(state, "Reconnect")?;
                    session.reconnect(password.as_deref())
                });
            }
            OpKind::Disconnect => {
                info!("{}({}): disconnecting", self.name, op.name());
                self.start_connection_op(cx, op, Slot::Disconnect, |state| {
                    session_mut(state, "Disconnect")?.disconnect()
                });
            }
            OpKind::Publish { topic, payload } => {
                info!("{}({}): publishing on {}", self.name, op.name(), topic);
                let (topic, payload) = (topic.clone(), payload.clone());
                self.start_acked_op(cx, op, move |session, on_ack| {
                    session.publish(&topic, payload, on_ack)
                });
            }
            OpKind::Subscribe { topic } => {
                info!("{}({}): subscribing to {}", self.name, op.name(), topic);
                let topic = topic.clone();
                self.start_acked_op(cx, op, move |session, on_ack| {
                    session.subscribe(&topic, on_ack)
                });
            }
            OpKind::Unsubscribe { topic } => {
                info!("{}({}): unsubscribing from {}", self.name, op.name(), topic);
                let topic = topic.clone();
                self.start_acked_op(cx, op, move |session, on_ack| {
                    session.unsubscribe(&topic, on_ack)
                });
            }
            OpKind::EnableFeature(_) | OpKind::DisableFeature(_) => {
                debug!("{}({}): passing down", self.name, op.name());
                self.chain.pass_op_to_next_stage(cx, op);
            }
        }
    }

    fn set_connection_args(&self, cx: &Cx, mut op: Operation, args: ConnectionArgs) {
        info!("{}({}): got connection args", self.name, op.name());

        if self.state.with(cx, |state| state.session.is_some()) {
            op.set_error(Error::pipeline(
                "connection args already set: the session is created only once",
            ));
            self.chain.complete_op(cx, op);
            return;
        }

        match self.factory.create(&args, self.handlers()) {
            Ok(session) => {
                debug!(
                    "{}: session created for {} on {}",
                    self.name, args.client_id, args.hostname
                );
                self.state.with(cx, move |state| {
                    state.args = Some(args);
                    state.session = Some(session);
                });
            }
            Err(e) => {
                error!("{}({}): failed to create session: {}", self.name, op.name(), e);
                op.set_error(e);
            }
        }
        self.chain.complete_op(cx, op);
    }

    fn set_credential(&self, cx: &Cx, op: Operation, credential: Credential) {
        info!("{}({}): got {}", self.name, op.name(), credential.kind());
        self.state.with(cx, |state| state.credential = Some(credential));
        self.chain.complete_op(cx, op);
    }

    /// Fails whatever sits in the connect and disconnect slots. Runs before
    /// every new connect-class or disconnect-class operation.
    fn cancel_active_connect_disconnect(&self, cx: &Cx, superseded_by: &str) {
        let (connect, disconnect) = self.state.with(cx, |state| {
            (state.active_connect.take(), state.active_disconnect.take())
        });

        for mut op in [connect, disconnect].into_iter().flatten() {
            info!(
                "{}({}): cancelling, superseded by {}",
                self.name,
                op.name(),
                superseded_by
            );
            op.set_error(Error::pipeline(format!(
                "superseded: cancelled because a new {superseded_by} operation was issued"
            )));
            self.chain.complete_op(cx, op);
        }
    }

    fn start_connection_op<F>(&self, cx: &Cx, op: Operation, slot: Slot, call: F)
    where
        F: FnOnce(&mut SessionState) -> Result<(), Error>,
    {
        self.cancel_active_connect_disconnect(cx, op.name());

        let failed = self.state.with(cx, move |state| {
            *slot_mut(state, slot) = Some(op);
            match call(state) {
                Ok(()) => None,
                Err(e) => slot_mut(state, slot).take().map(|mut op| {
                    op.set_error(e);
                    op
                }),
            }
        });

        if let Some(op) = failed {
            warn!(
                "{}({}): failed to start: {}",
                self.name,
                op.name(),
                op.error().map(ToString::to_string).unwrap_or_default()
            );
            self.chain.complete_op(cx, op);
        }
    }

    fn start_acked_op<F>(&self, cx: &Cx, op: Operation, call: F)
    where
        F: FnOnce(&mut Box<dyn ProtocolSession>, AckCallback) -> Result<(), Error>,
    {
        let id = op.id();
        let name = op.name();
        let on_ack = self.link().ack_callback(id);

        let failed = self.state.with(cx, move |state| match state.session.as_mut() {
            None => {
                let mut op = op;
                op.set_error(no_session(name));
                Some(op)
            }
            Some(session) => {
                state.awaiting_ack.insert(id, op);
                match call(session, on_ack) {
                    Ok(()) => None,
                    Err(e) => state.awaiting_ack.remove(&id).map(|mut op| {
                        op.set_error(e);
                        op
                    }),
                }
            }
        });

        if let Some(op) = failed {
            warn!(
                "{}({}): failed to start: {}",
                self.name,
                op.name(),
                op.error().map(ToString::to_string).unwrap_or_default()
            );
            self.chain.complete_op(cx, op);
        }
    }

    fn handle_ack(&self, cx: &Cx, id: u64, result: Result<(), Error>) {
        let Some(mut op) = self.state.with(cx, |state| state.awaiting_ack.remove(&id)) else {
            warn!("{}: acknowledgement for unknown operation {}", self.name, id);
            return;
        };

        match result {
            Ok(()) => info!(
                "{}({}): {} received. completing op.",
                self.name,
                op.name(),
                ack_packet_name(op.kind())
            ),
            Err(e) => {
                warn!("{}({}): not acknowledged: {}", self.name, op.name(), e);
                op.set_error(e);
            }
        }
        self.chain.complete_op(cx, op);
    }

    fn handle_connected(&self, cx: &Cx) {
        info!("{}: connected", self.name);
        // Stages above learn about the connection before the connect op
        // completes.
        self.chain.on_connected(cx);

        match self.state.with(cx, |state| state.active_connect.take()) {
            Some(op) => {
                info!("{}({}): completing connect op", self.name, op.name());
                self.chain.complete_op(cx, op);
            }
            None => warn!("{}: connection was unexpected", self.name),
        }
    }

    fn handle_connection_failure(&self, cx: &Cx, cause: Error) {
        error!("{}: connection failure: {}", self.name, cause);

        match self.state.with(cx, |state| state.active_connect.take()) {
            Some(mut op) => {
                info!("{}({}): failing connect op", self.name, op.name());
                op.set_error(cause);
                self.chain.complete_op(cx, op);
            }
            None => {
                warn!("{}: connection failure was unexpected", self.name);
                self.unhandled.report(cause);
            }
        }
    }

    fn handle_disconnected(&self, cx: &Cx, cause: Option<Error>) {
        match &cause {
            Some(cause) => warn!("{}: disconnected: {}", self.name, cause),
            None => info!("{}: disconnected", self.name),
        }
        self.chain.on_disconnected(cx);

        match self.state.with(cx, |state| state.active_disconnect.take()) {
            Some(mut op) => {
                info!("{}({}): completing disconnect op", self.name, op.name());
                if let Some(cause) = cause {
                    op.set_error(cause);
                }
                self.chain.complete_op(cx, op);
            }
            None => {
                warn!("{}: disconnection was unexpected", self.name);
                if let Some(cause) = cause {
                    self.unhandled.report(cause);
                }
            }
        }
    }

    fn handle_message(&self, cx: &Cx, topic: String, payload: Bytes) {
        debug!(
            "{}: message received on {} ({} bytes)",
            self.name,
            topic,
            payload.len()
        );
        self.chain
            .pass_event_to_previous_stage(cx, Event::IncomingMessage { topic, payload });
    }

    /// Fails every tracked operation with `OperationCancelled` and drops the
    /// session. Used when the pipeline shuts down.
    pub fn abandon(&self, cx: &Cx) {
        let (session, pending) = self.state.with(cx, |state| {
            let mut pending: Vec<Operation> =
                [state.active_connect.take(), state.active_disconnect.take()]
                    .into_iter()
                    .flatten()
                    .collect();
            pending.extend(state.awaiting_ack.drain().map(|(_, op)| op));
            (state.session.take(), pending)
        });

        if !pending.is_empty() {
            info!(
                "{}: cancelling {} pending operation(s) on shutdown",
                self.name,
                pending.len()
            );
        }
        for mut op in pending {
            op.set_error(Error::new(
                ErrorKind::OperationCancelled,
                "pipeline shut down before the operation completed",
            ));
            self.chain.complete_op(cx, op);
        }
        drop(session);
    }

    fn link(&self) -> StageLink {
        StageLink {
            stage: self.this.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }

    /// Session handlers that forward onto the pipeline context.
    fn handlers(&self) -> SessionHandlers {
        let connected = self.link();
        let failure = self.link();
        let disconnected = self.link();
        let message = self.link();

        SessionHandlers {
            on_mqtt_connected: Arc::new(move || {
                connected.post(|stage, cx| stage.handle_connected(cx))
            }),
            on_mqtt_connection_failure: Arc::new(move |cause: Error| {
                failure.post(move |stage, cx| stage.handle_connection_failure(cx, cause))
            }),
            on_mqtt_disconnected: Arc::new(move |cause: Option<Error>| {
                disconnected.post(move |stage, cx| stage.handle_disconnected(cx, cause))
            }),
            on_mqtt_message_received: Arc::new(move |topic: String, payload: Bytes| {
                message.post(move |stage, cx| stage.handle_message(cx, topic, payload))
            }),
        }
    }
}

/// Weak route back into the stage from session threads.
#[derive(Clone)]
struct StageLink {
    stage: Weak<ProtocolStage>,
    dispatcher: Dispatcher,
}

impl StageLink {
    /// Queues `f` on the pipeline context. Dropped if the stage is gone.
    fn post<F>(&self, f: F)
    where
        F: FnOnce(&ProtocolStage, &Cx) + Send + 'static,
    {
        let stage = self.stage.clone();
        let _ = self
            .dispatcher
            .run_async(&Cx::external(), ContextId::Pipeline, move |cx| {
                match stage.upgrade() {
                    Some(stage) => f(&stage, cx),
                    None => debug!("protocol stage dropped, ignoring session callback"),
                }
            });
    }

    fn ack_callback(self, id: u64) -> AckCallback {
        Box::new(move |result| self.post(move |stage, cx| stage.handle_ack(cx, id, result)))
    }
}

fn slot_mut(state: &mut SessionState, slot: Slot) -> &mut Option<Operation> {
    match slot {
        Slot::Connect => &mut state.active_connect,
        Slot::Disconnect => &mut state.active_disconnect,
    }
}

fn session_mut<'a>(
    state: &'a mut SessionState,
    op_name: &str,
) -> Result<&'a mut Box<dyn ProtocolSession>, Error> {
    state.session.as_mut().ok_or_else(|| no_session(op_name))
}

fn no_session(op_name: &str) -> Error {
    Error::pipeline(format!(
        "{op_name} issued before SetConnectionArgs: no session exists"
    ))
}

fn ack_packet_name(kind: &OpKind) -> &'static str {
    match kind {
        OpKind::Publish { .. } => "PUBACK",
        OpKind::Subscribe { .. } => "SUBACK",
        OpKind::Unsubscribe { .. } => "UNSUBACK",
        _ => "ACK",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        config::pipeline::PipelineConfig,
        core::operation::ClientCertificate,
    };

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Completed(&'static str, Result<(), ErrorKind>, String),
        Passed(&'static str),
        Event(String),
        Connected,
        Disconnected,
        /// A session call, when calls are journaled into the chain.
        Called(Call),
    }

    #[derive(Default)]
    struct RecordingChain {
        seen: Mutex<Vec<Seen>>,
    }

    impl RecordingChain {
        fn take(&self) -> Vec<Seen> {
            std::mem::take(&mut *self.seen.lock().unwrap())
        }
    }

    impl StageChain for RecordingChain {
        fn complete_op(&self, cx: &Cx, op: Operation) {
            cx.assert_on(ContextId::Pipeline);
            let name = op.name();
            let (_, outcome) = op.finish();
            let message = outcome.as_ref().err().map(|e| e.message().to_owned());
            self.seen.lock().unwrap().push(Seen::Completed(
                name,
                outcome.map_err(|e| e.kind()),
                message.unwrap_or_default(),
            ));
        }

        fn pass_op_to_next_stage(&self, _: &Cx, op: Operation) {
            self.seen.lock().unwrap().push(Seen::Passed(op.name()));
        }

        fn pass_event_to_previous_stage(&self, _: &Cx, event: Event) {
            let Event::IncomingMessage { topic, .. } = event;
            self.seen.lock().unwrap().push(Seen::Event(topic));
        }

        fn on_connected(&self, _: &Cx) {
            self.seen.lock().unwrap().push(Seen::Connected);
        }

        fn on_disconnected(&self, _: &Cx) {
            self.seen.lock().unwrap().push(Seen::Disconnected);
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Connect(Option<String>, bool),
        Reconnect(Option<String>),
        Disconnect,
        Publish(String),
    }

    #[derive(Default)]
    struct SessionRecorder {
        calls: Mutex<Vec<Call>>,
        handlers: Mutex<Option<SessionHandlers>>,
        acks: Mutex<Vec<AckCallback>>,
        fail_next: Mutex<Option<Error>>,
        journal: Mutex<Option<Arc<RecordingChain>>>,
    }

    impl SessionRecorder {
        fn handlers(&self) -> SessionHandlers {
            self.handlers.lock().unwrap().clone().unwrap()
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) -> Result<(), Error> {
            if let Some(chain) = self.journal.lock().unwrap().as_ref() {
                chain.seen.lock().unwrap().push(Seen::Called(call.clone()));
            }
            self.calls.lock().unwrap().push(call);
            match self.fail_next.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    struct RecordedSession(Arc<SessionRecorder>);

    impl ProtocolSession for RecordedSession {
        fn connect(
            &mut self,
            password: Option<&str>,
            client_certificate: Option<&ClientCertificate>,
        ) -> Result<(), Error> {
            self.0.record(Call::Connect(
                password.map(str::to_owned),
                client_certificate.is_some(),
            ))
        }

        fn reconnect(&mut self, password: Option<&str>) -> Result<(), Error> {
            self.0.record(Call::Reconnect(password.map(str::to_owned)))
        }

        fn disconnect(&mut self) -> Result<(), Error> {
            self.0.record(Call::Disconnect)
        }

        fn publish(&mut self, topic: &str, _: Bytes, on_ack: AckCallback) -> Result<(), Error> {
            self.0.record(Call::Publish(topic.to_owned()))?;
            self.0.acks.lock().unwrap().push(on_ack);
            Ok(())
        }

        fn subscribe(&mut self, _: &str, on_ack: AckCallback) -> Result<(), Error> {
            self.0.acks.lock().unwrap().push(on_ack);
            Ok(())
        }

        fn unsubscribe(&mut self, _: &str, on_ack: AckCallback) -> Result<(), Error> {
            self.0.acks.lock().unwrap().push(on_ack);
            Ok(())
        }
    }

    struct RecorderFactory(Arc<SessionRecorder>);

    impl SessionFactory for RecorderFactory {
        fn create(
            &self,
            _: &ConnectionArgs,
            handlers: SessionHandlers,
        ) -> Result<Box<dyn ProtocolSession>, Error> {
            *self.0.handlers.lock().unwrap() = Some(handlers);
            Ok(Box::new(RecordedSession(Arc::clone(&self.0))))
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        chain: Arc<RecordingChain>,
        recorder: Arc<SessionRecorder>,
        unhandled: UnhandledFailures,
        stage: Arc<ProtocolStage>,
    }

    impl Harness {
        fn new() -> Self {
            let dispatcher = Dispatcher::new(&PipelineConfig::default()).unwrap();
            let chain = Arc::new(RecordingChain::default());
            let recorder = Arc::new(SessionRecorder::default());
            let unhandled = UnhandledFailures::new(8);
            let stage = ProtocolStage::new(
                "MQTTClientStage",
                chain.clone(),
                dispatcher.clone(),
                Arc::new(RecorderFactory(Arc::clone(&recorder))),
                unhandled.clone(),
            );
            Self {
                dispatcher,
                chain,
                recorder,
                unhandled,
                stage,
            }
        }

        fn run(&self, kind: OpKind) {
            let stage = Arc::clone(&self.stage);
            self.dispatcher
                .run_blocking(&Cx::external(), ContextId::Pipeline, move |cx| {
                    stage.run_op(cx, Operation::new(kind))
                })
                .unwrap();
        }

        /// Waits until everything already queued on the pipeline context ran.
        fn settle(&self) {
            self.dispatcher
                .run_blocking(&Cx::external(), ContextId::Pipeline, |_| ())
                .unwrap();
        }

        fn with_session(&self) -> &Self {
            self.run(OpKind::SetConnectionArgs(ConnectionArgs::new(
                "hub.example.net",
                "hub.example.net/d1",
                "d1",
            )));
            self.chain.take();
            self
        }

        /// Logs session calls into the chain's record, so calls and
        /// completions can be checked in one order.
        fn journal_calls(&self) -> &Self {
            *self.recorder.journal.lock().unwrap() = Some(Arc::clone(&self.chain));
            self
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.dispatcher.shutdown();
        }
    }

    fn ok(name: &'static str) -> Seen {
        Seen::Completed(name, Ok(()), String::new())
    }

    #[test]
    fn test_set_connection_args_creates_session_once() {
        let h = Harness::new();
        let args = ConnectionArgs::new("h", "h/c1", "c1");
        h.run(OpKind::SetConnectionArgs(args.clone()));
        h.run(OpKind::SetConnectionArgs(args));

        let seen = h.chain.take();
        assert_eq!(seen[0], ok("SetConnectionArgs"));
        assert!(matches!(
            &seen[1],
            Seen::Completed("SetConnectionArgs", Err(ErrorKind::Pipeline), _)
        ));
    }

    #[test]
    fn test_connect_passes_stored_token() {
        let h = Harness::new();
        h.with_session();
        h.run(OpKind::SetCredential(Credential::SasToken("t1".into())));
        h.run(OpKind::Connect);

        assert_eq!(h.recorder.calls(), [Call::Connect(Some("t1".into()), false)]);
        assert_eq!(h.chain.take(), [ok("SetCredential")]);
    }

    #[test]
    fn test_replaced_credential_is_used() {
        let h = Harness::new();
        h.with_session();
        h.run(OpKind::SetCredential(Credential::SasToken("t1".into())));
        h.run(OpKind::SetCredential(Credential::SasToken("t2".into())));
        h.run(OpKind::Connect);
        h.run(OpKind::SetCredential(Credential::Certificate(ClientCertificate {
            certificate: "cert".into(),
            private_key: "key".into(),
        })));
        h.run(OpKind::Connect);
        h.run(OpKind::Reconnect);

        assert_eq!(
            h.recorder.calls(),
            [
                Call::Connect(Some("t2".into()), false),
                Call::Connect(None, true),
                Call::Reconnect(None),
            ]
        );
    }

    #[test]
    fn test_credential_before_args_survives() {
        let h = Harness::new();
        h.run(OpKind::SetCredential(Credential::SasToken("early".into())));
        h.with_session();
        h.run(OpKind::Reconnect);

        assert_eq!(h.recorder.calls(), [Call::Reconnect(Some("early".into()))]);
    }

    #[test]
    fn test_connect_supersedes_connect() {
        let h = Harness::new();
        h.with_session().journal_calls();
        h.run(OpKind::Connect);
        h.run(OpKind::Connect);

        let seen = h.chain.take();
        match &seen[..] {
            [
                Seen::Called(Call::Connect(None, false)),
                Seen::Completed("Connect", Err(ErrorKind::Pipeline), message),
                Seen::Called(Call::Connect(None, false)),
            ] => assert!(message.contains("superseded")),
            other => panic!("unexpected {other:?}"),
        }

        (h.recorder.handlers().on_mqtt_connected)();
        h.settle();
        assert_eq!(h.chain.take(), [Seen::Connected, ok("Connect")]);
    }

    #[test]
    fn test_disconnect_supersedes_pending_connect() {
        let h = Harness::new();
        h.with_session();
        h.run(OpKind::Connect);
        h.run(OpKind::Disconnect);

        let seen = h.chain.take();
        assert!(matches!(
            &seen[..],
            [Seen::Completed("Connect", Err(ErrorKind::Pipeline), _)]
        ));

        // The late CONNACK of the superseded connect finds an empty slot.
        (h.recorder.handlers().on_mqtt_connected)();
        (h.recorder.handlers().on_mqtt_disconnected)(None);
        h.settle();
        assert_eq!(
            h.chain.take(),
            [Seen::Connected, Seen::Disconnected, ok("Disconnect")]
        );
    }

    #[test]
    fn test_unsolicited_connect_is_noop() {
        let h = Harness::new();
        h.with_session();
        (h.recorder.handlers().on_mqtt_connected)();
        h.settle();

        assert_eq!(h.chain.take(), [Seen::Connected]);
        assert_eq!(h.unhandled.count(), 0);
    }

    #[test]
    fn test_connection_failure_fails_connect() {
        let h = Harness::new();
        h.with_session();
        h.run(OpKind::Connect);
        (h.recorder.handlers().on_mqtt_connection_failure)(Error::from_connect_code(4));
        h.settle();

        let seen = h.chain.take();
        assert!(matches!(
            &seen[..],
            [Seen::Completed("Connect", Err(ErrorKind::Unauthorized), _)]
        ));
    }

    #[test]
    fn test_unexpected_failures_go_to_sink() {
        let h = Harness::new();
        h.with_session();
        (h.recorder.handlers().on_mqtt_connection_failure)(Error::from_result_code(8));
        (h.recorder.handlers().on_mqtt_disconnected)(Some(Error::from_result_code(7)));
        (h.recorder.handlers().on_mqtt_disconnected)(None);
        h.settle();

        assert_eq!(h.unhandled.count(), 2);
        assert_eq!(h.chain.take(), [Seen::Disconnected, Seen::Disconnected]);
    }

    #[test]
    fn test_disconnect_with_cause_fails_disconnect_op() {
        let h = Harness::new();
        h.with_session();
        h.run(OpKind::Disconnect);
        (h.recorder.handlers().on_mqtt_disconnected)(Some(Error::from_result_code(7)));
        h.settle();

        let seen = h.chain.take();
        assert!(matches!(
            &seen[..],
            [
                Seen::Disconnected,
                Seen::Completed("Disconnect", Err(ErrorKind::ConnectionDropped), _)
            ]
        ));
        assert_eq!(h.unhandled.count(), 0);
    }

    #[test]
    fn test_synchronous_connect_error_clears_slot() {
        let h = Harness::new();
        h.with_session();
        *h.recorder.fail_next.lock().unwrap() = Some(Error::from_result_code(3));
        h.run(OpKind::Connect);

        let seen = h.chain.take();
        assert!(matches!(
            &seen[..],
            [Seen::Completed("Connect", Err(ErrorKind::Transport), _)]
        ));

        // Slot is empty: a later connected notification completes nothing.
        (h.recorder.handlers().on_mqtt_connected)();
        h.settle();
        assert_eq!(h.chain.take(), [Seen::Connected]);
    }

    #[test]
    fn test_connect_without_session_fails() {
        let h = Harness::new();
        h.run(OpKind::Connect);

        let seen = h.chain.take();
        match &seen[..] {
            [Seen::Completed("Connect", Err(ErrorKind::Pipeline), message)] => {
                assert!(message.contains("before SetConnectionArgs"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_publish_completes_on_ack() {
        let h = Harness::new();
        h.with_session();
        h.run(OpKind::Publish {
            topic: "devices/d1/messages/events/".into(),
            payload: Bytes::from_static(b"{}"),
        });
        h.run(OpKind::Subscribe {
            topic: "devices/d1/messages/devicebound/#".into(),
        });
        assert!(h.chain.take().is_empty());

        let acks: Vec<_> = h.recorder.acks.lock().unwrap().drain(..).collect();
        let mut acks = acks.into_iter();
        acks.next().unwrap()(Ok(()));
        acks.next().unwrap()(Err(Error::from_result_code(7)));
        h.settle();

        let seen = h.chain.take();
        assert_eq!(seen[0], ok("Publish"));
        assert!(matches!(
            &seen[1],
            Seen::Completed("Subscribe", Err(ErrorKind::ConnectionDropped), _)
        ));
    }

    #[test]
    fn test_publish_sync_failure_completes_immediately() {
        let h = Harness::new();
        h.with_session();
        *h.recorder.fail_next.lock().unwrap() = Some(Error::from_result_code(15));
        h.run(OpKind::Publish {
            topic: "t".into(),
            payload: Bytes::new(),
        });

        let seen = h.chain.take();
        assert!(matches!(
            &seen[..],
            [Seen::Completed("Publish", Err(ErrorKind::Transport), _)]
        ));
    }

    #[test]
    fn test_message_becomes_event() {
        let h = Harness::new();
        h.with_session();
        (h.recorder.handlers().on_mqtt_message_received)(
            "devices/d1/messages/devicebound/x".into(),
            Bytes::from_static(b"payload"),
        );
        h.settle();

        assert_eq!(
            h.chain.take(),
            [Seen::Event("devices/d1/messages/devicebound/x".into())]
        );
    }

    #[test]
    fn test_other_ops_pass_down() {
        let h = Harness::new();
        h.run(OpKind::EnableFeature("methods".into()));
        assert_eq!(h.chain.take(), [Seen::Passed("EnableFeature")]);
    }

    #[test]
    fn test_abandon_cancels_pending() {
        let h = Harness::new();
        h.with_session();
        h.run(OpKind::Connect);
        h.run(OpKind::Subscribe { topic: "t".into() });

        let stage = Arc::clone(&h.stage);
        h.dispatcher
            .run_blocking(&Cx::external(), ContextId::Pipeline, move |cx| stage.abandon(cx))
            .unwrap();

        let seen = h.chain.take();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|s| matches!(
            s,
            Seen::Completed(_, Err(ErrorKind::OperationCancelled), _)
        )));
    }

    #[test]
    #[should_panic(expected = "must be called on the pipeline context")]
    fn test_run_op_off_context_panics() {
        let h = Harness::new();
        h.stage.run_op(&Cx::external(), Operation::new(OpKind::Connect));
    }
}
