pub mod chain;
pub mod completion;
pub mod dispatch;
pub mod error;
#[cfg(feature = "hubpipe-mqtt")]
pub mod mqtt;
pub mod operation;
pub mod pipeline;
pub mod session;
pub mod stage;
pub mod state;
pub mod unhandled;
