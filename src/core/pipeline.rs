//! Assembled pipeline: dispatcher, protocol stage and terminal root.
//!
//! [`Pipeline`] is what callers hold. Every operation is queued onto the
//! pipeline context and its completion callback fires on the callback
//! context, so callers never touch protocol state from their own threads.
//!
//! ```ignore
//! let pipeline = PipelineBuilder::new(config.pipeline.clone())
//!     .session_factory(Arc::new(MqttSessionFactory::new(config.transport.clone())?))
//!     .on_event(|event| println!("{event:?}"))
//!     .build()?;
//!
//! pipeline.set_connection_args(args).await?;
//! pipeline.set_credential(Credential::SasToken(token)).await?;
//! pipeline.connect().await?;
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{
    chain::{EventHandler, PipelineRoot, StageChain},
    completion::{completion_pair, OpWaiter},
    dispatch::{ContextId, Cx, DispatchError, Dispatcher},
    error::Error,
    operation::{ConnectionArgs, Credential, Event, OpCallback, OpKind, Operation},
    session::SessionFactory,
    stage::ProtocolStage,
    state::ConnectionState,
    unhandled::UnhandledFailures,
};
use crate::config::pipeline::PipelineConfig;

impl From<DispatchError> for Error {
    fn from(e: DispatchError) -> Self {
        Error::pipeline(format!("dispatcher unavailable: {e}")).with_cause(e)
    }
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    session_factory: Option<Arc<dyn SessionFactory>>,
    on_event: Option<EventHandler>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            session_factory: None,
            on_event: None,
        }
    }

    pub fn session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.session_factory = Some(factory);
        self
    }

    /// Registers the handler for events that reach the top of the pipeline.
    /// It runs on the callback context.
    pub fn on_event(mut self, handler: impl Fn(Event) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(handler));
        self
    }

    /// Starts both execution contexts and wires the stages together.
    pub fn build(self) -> Result<Pipeline, Error> {
        let factory = self
            .session_factory
            .ok_or_else(|| Error::pipeline("no session factory configured"))?;

        let dispatcher = Dispatcher::new(&self.config)?;
        let unhandled = UnhandledFailures::new(self.config.unhandled_history);
        let root = Arc::new(PipelineRoot::new(
            dispatcher.clone(),
            unhandled.clone(),
            self.on_event,
        ));
        let stage = ProtocolStage::new(
            self.config.stage_name.clone(),
            Arc::clone(&root) as Arc<dyn StageChain>,
            dispatcher.clone(),
            factory,
            unhandled.clone(),
        );

        info!(
            "Pipeline started: stage {}, threads {}-pipeline and {}-callback",
            stage.name(),
            self.config.thread_name_prefix,
            self.config.thread_name_prefix
        );

        Ok(Pipeline {
            dispatcher,
            root,
            stage,
            unhandled,
        })
    }
}

pub struct Pipeline {
    dispatcher: Dispatcher,
    root: Arc<PipelineRoot>,
    stage: Arc<ProtocolStage>,
    unhandled: UnhandledFailures,
}

impl Pipeline {
    /// Queues an operation and returns a waiter for its outcome.
    ///
    /// After [`Pipeline::shutdown`] the waiter resolves to a Pipeline error.
    pub fn submit(&self, kind: OpKind) -> OpWaiter {
        let (done, waiter) = completion_pair();
        self.submit_with_callback(kind, done);
        waiter
    }

    /// Queues an operation whose outcome is delivered to `callback` on the
    /// callback context.
    pub fn submit_with_callback(&self, kind: OpKind, callback: OpCallback) {
        let op = Operation::with_callback(kind, callback);
        debug!("{}[{}]: submitted", op.name(), op.id());

        let stage = Arc::clone(&self.stage);
        let _ = self
            .dispatcher
            .run_async(&Cx::external(), ContextId::Pipeline, move |cx| {
                stage.run_op(cx, op)
            });
    }

    pub async fn execute(&self, kind: OpKind) -> Result<(), Error> {
        self.submit(kind).wait().await
    }

    /// Blocking variant of [`Pipeline::execute`] for plain threads.
    pub fn execute_blocking(&self, kind: OpKind) -> Result<(), Error> {
        self.submit(kind).wait_blocking()
    }

    pub async fn set_connection_args(&self, args: ConnectionArgs) -> Result<(), Error> {
        self.execute(OpKind::SetConnectionArgs(args)).await
    }

    pub async fn set_credential(&self, credential: Credential) -> Result<(), Error> {
        self.execute(OpKind::SetCredential(credential)).await
    }

    pub async fn connect(&self) -> Result<(), Error> {
        self.execute(OpKind::Connect).await
    }

    pub async fn reconnect(&self) -> Result<(), Error> {
        self.execute(OpKind::Reconnect).await
    }

    pub async fn disconnect(&self) -> Result<(), Error> {
        self.execute(OpKind::Disconnect).await
    }

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.execute(OpKind::Publish {
            topic: topic.into(),
            payload: payload.into(),
        })
        .await
    }

    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<(), Error> {
        self.execute(OpKind::Subscribe {
            topic: topic.into(),
        })
        .await
    }

    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<(), Error> {
        self.execute(OpKind::Unsubscribe {
            topic: topic.into(),
        })
        .await
    }

    /// Connectivity as last reported by the protocol stage.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.root.connection_state()
    }

    pub fn unhandled_failures(&self) -> &UnhandledFailures {
        &self.unhandled
    }

    /// Cancels pending operations, drops the session and stops both
    /// execution contexts. Safe to call more than once.
    pub fn shutdown(&self) {
        let stage = Arc::clone(&self.stage);
        let _ = self
            .dispatcher
            .run_async(&Cx::external(), ContextId::Pipeline, move |cx| {
                stage.abandon(cx)
            });
        self.dispatcher.shutdown();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stage", &self.stage.name())
            .field("unhandled", &self.unhandled)
            .finish_non_exhaustive()
    }
}
