#![cfg(feature = "hubpipe-mqtt")]

use std::{net::TcpListener, sync::Arc, time::Duration};

use hubpipe::{
    config::{pipeline::PipelineConfig, TransportConfig},
    core::mqtt::MqttSessionFactory,
    ConnectionArgs, ErrorKind, OpKind, Pipeline, PipelineBuilder,
};

const WAIT: Duration = Duration::from_secs(5);

async fn pipeline(port: u16) -> Pipeline {
    let transport = TransportConfig {
        tls: false,
        port,
        ..Default::default()
    };
    let pipeline = PipelineBuilder::new(PipelineConfig::default())
        .session_factory(Arc::new(MqttSessionFactory::new(transport).unwrap()))
        .build()
        .unwrap();
    pipeline
        .set_connection_args(ConnectionArgs::new("127.0.0.1", "user", "device-1"))
        .await
        .unwrap();
    pipeline
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_while_broker_is_silent_completes() {
    // Completes the TCP handshake through its backlog, never sends CONNACK.
    let silent = TcpListener::bind("127.0.0.1:0").unwrap();
    let pipeline = pipeline(silent.local_addr().unwrap().port()).await;

    let connect = pipeline.submit(OpKind::Connect);
    let disconnect = pipeline.submit(OpKind::Disconnect);

    let outcome = tokio::time::timeout(WAIT, disconnect.wait())
        .await
        .expect("disconnect never completed");
    assert!(outcome.is_ok(), "{outcome:?}");

    let err = tokio::time::timeout(WAIT, connect.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Pipeline);

    assert_eq!(pipeline.unhandled_failures().count(), 0);
    assert!(!pipeline.connection_state().borrow().is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_after_refused_connect_reports_dropped_connection() {
    let pipeline = pipeline(1).await;

    let refused = tokio::time::timeout(WAIT, pipeline.connect()).await.unwrap();
    assert!(refused.is_err());

    let err = tokio::time::timeout(WAIT, pipeline.disconnect())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionDropped, "{err:?}");
}
