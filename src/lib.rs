//! hubpipe: connectivity core of an IoT device client pipeline.
//!
//! Operations (connect, publish, subscribe, ...) travel down a stage chain to
//! a protocol stage that drives an MQTT session; events (incoming messages)
//! travel back up. Everything that touches pipeline state runs on one named
//! worker thread, and every user callback runs on a second one.
//!
//! ## Modules
//!
//! * `config`: TOML configuration for logging, the pipeline and the MQTT
//!   transport, validated with the `validator` crate.
//!
//! * `core`: the pipeline itself:
//!   - `dispatch`: the pipeline and callback execution contexts
//!   - `error`: the generic error taxonomy and the MQTT code mapper
//!   - `stage`: the protocol stage and its connection lifecycle
//!   - `pipeline`: the assembled pipeline callers hold
//!
//! * `logger`: `tracing` subscriber setup (console and systemd journald).
//!
//! ## Features
//!
//! * `hubpipe-mqtt`: MQTT sessions over `rumqttc` via the `hubpipe_mqtt`
//!   crate (default: enabled). Without it a [`core::session::SessionFactory`]
//!   must be supplied by the caller.

pub mod config;
pub mod core;
pub mod logger;

pub use crate::core::{
    completion::OpWaiter,
    error::{Error, ErrorKind},
    operation::{ClientCertificate, ConnectionArgs, Credential, Event, OpKind},
    pipeline::{Pipeline, PipelineBuilder},
    state::ConnectionState,
};
